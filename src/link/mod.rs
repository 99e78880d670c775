//! Transport plumbing between the host and the dyno controller.
//!
//! The transport is split in two halves: a [`LineSource`] owned by the reader
//! thread and a [`LineSink`] shared by every command sender behind a mutex.

mod commands;
pub mod reader;
pub mod serial;

use std::io;

pub use commands::{CommandInterface, SentCommand};
pub use reader::LinkReader;
pub use serial::{list_ports, open_serial};

/// Write half of a line-oriented transport.
pub trait LineSink: Send {
    /// Writes `line` followed by a newline and flushes.
    fn write_line(&mut self, line: &str) -> io::Result<()>;
}

/// Read half of a line-oriented transport.
pub trait LineSource: Send {
    /// Returns the next complete line without its terminator, or `None` when
    /// the read timed out before a full line arrived.
    fn read_line(&mut self) -> io::Result<Option<String>>;
}
