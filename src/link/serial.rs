//! USB-serial transport to the ESP32 controller.

use std::io::{self, BufRead, BufReader, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use serialport::SerialPort;

use super::{LineSink, LineSource};

pub struct SerialSource {
    reader: BufReader<Box<dyn SerialPort>>,
    pending: Vec<u8>,
}

pub struct SerialSink {
    port: Box<dyn SerialPort>,
}

/// Opens `port_name` and returns independent read and write halves.
///
/// The read half times out after `read_timeout` so the reader thread can
/// notice shutdown requests.
pub fn open_serial(
    port_name: &str,
    baud_rate: u32,
    read_timeout: Duration,
) -> Result<(SerialSource, SerialSink)> {
    let port = serialport::new(port_name, baud_rate)
        .timeout(read_timeout)
        .open()
        .with_context(|| format!("failed to open serial port {port_name} at {baud_rate} baud"))?;

    let writer = port
        .try_clone()
        .with_context(|| format!("failed to clone serial port handle for {port_name}"))?;

    Ok((
        SerialSource {
            reader: BufReader::new(port),
            pending: Vec::with_capacity(256),
        },
        SerialSink { port: writer },
    ))
}

/// Names of the serial ports currently present on this machine.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports().context("failed to enumerate serial ports")?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

impl LineSource for SerialSource {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        // `pending` survives timeouts so a line split across reads is not lost.
        match self.reader.read_until(b'\n', &mut self.pending) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial port closed",
            )),
            Ok(_) if self.pending.last() == Some(&b'\n') => {
                let line = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                Ok(Some(line))
            }
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl LineSink for SerialSink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()
    }
}
