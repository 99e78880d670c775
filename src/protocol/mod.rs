//! Line protocol spoken by the dyno controller.
//!
//! Host -> device: one command per line ([`DynoCommand`]).
//! Device -> host: `PONG:<ms>`, `ACK:<cmd>:<recv>:<send>:<ack>`, a JSON
//! telemetry object, or free text.

mod command;
mod frame;
mod parser;

pub use command::DynoCommand;
pub use frame::{
    DynoFrame, DynoState, MotorFrame, MotorState, TelemetryFrame, TelemetrySample,
};
pub use parser::parse_line;

/// Device timestamps carried by an `ACK:` line, in device clock units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckTiming {
    pub command: String,
    pub receive_time: i64,
    pub send_time: i64,
    pub ack_time: i64,
}

/// Everything the link reader can hand to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Pong { device_time: i64 },
    Ack(AckTiming),
    Telemetry(TelemetryFrame),
    RawLog(String),
    DecodeError { line: String, reason: String },
    /// The transport failed while reading; the reader has stopped.
    LinkFailure(String),
}
