//! SQLite session store for telemetry samples.

mod connection;
pub mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use connection::Database;
pub use models::{DatabaseStats, MotorChannels, SessionSummary, StoredSample};
