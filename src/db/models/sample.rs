//! Persisted telemetry rows.
//!
//! Rows are keyed by `(session_start, relative_time)`. `session_start` is the
//! device clock (seconds) of the first frame of a session, so two sessions
//! that started at the same device time after separate reboots share a key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::MotorState;

/// The five per-motor channels kept in the session store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotorChannels {
    pub rpm: f64,
    pub current: f64,
    pub voltage: f64,
    pub temp_fet: f64,
    pub temp_motor: f64,
}

impl From<&MotorState> for MotorChannels {
    fn from(state: &MotorState) -> Self {
        Self {
            rpm: state.rpm,
            current: state.current,
            voltage: state.voltage,
            temp_fet: state.temp_fet,
            temp_motor: state.temp_motor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSample {
    pub id: i64,
    pub session_start: f64,
    pub relative_time: f64,
    /// Device clock, seconds.
    pub timestamp: f64,
    pub drive: MotorChannels,
    pub brake: MotorChannels,
    pub mechanical_power: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_start: f64,
    pub sample_count: u64,
    pub last_relative_time: f64,
    pub last_created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub total_samples: u64,
    pub session_count: u64,
    pub file_size_bytes: u64,
}
