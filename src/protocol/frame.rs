//! Telemetry frame types.
//!
//! A frame on the wire may carry only the fields that changed since the last
//! one, so every field of the wire types is optional. [`TelemetrySample`] is
//! the fully populated view that partial frames are folded into.

use serde::{Deserialize, Serialize};

/// Decoded `{"timestamp": .., "drive": {..}, "brake": {..}, "dyno": {..}}` line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    #[serde(rename = "timestamp", default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive: Option<MotorFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brake: Option<MotorFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dyno: Option<DynoFrame>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MotorFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_fet: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_motor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duty_cycle: Option<f64>,
    #[serde(rename = "data_age", default, skip_serializing_if = "Option::is_none")]
    pub data_age_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynoFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_rpm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_load: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brake_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency_stop: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mechanical_power: Option<f64>,
}

/// Latest known values of one motor controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotorState {
    pub rpm: f64,
    pub current: f64,
    pub voltage: f64,
    pub temp_fet: f64,
    pub temp_motor: f64,
    pub duty_cycle: f64,
    pub data_age_ms: f64,
}

impl MotorState {
    fn apply(&mut self, frame: &MotorFrame) {
        merge(&mut self.rpm, frame.rpm);
        merge(&mut self.current, frame.current);
        merge(&mut self.voltage, frame.voltage);
        merge(&mut self.temp_fet, frame.temp_fet);
        merge(&mut self.temp_motor, frame.temp_motor);
        merge(&mut self.duty_cycle, frame.duty_cycle);
        merge(&mut self.data_age_ms, frame.data_age_ms);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DynoState {
    pub target_rpm: f64,
    pub target_load: f64,
    pub drive_enabled: bool,
    pub brake_enabled: bool,
    pub emergency_stop: bool,
    pub mechanical_power: f64,
}

impl DynoState {
    fn apply(&mut self, frame: &DynoFrame) {
        merge(&mut self.target_rpm, frame.target_rpm);
        merge(&mut self.target_load, frame.target_load);
        merge(&mut self.drive_enabled, frame.drive_enabled);
        merge(&mut self.brake_enabled, frame.brake_enabled);
        merge(&mut self.emergency_stop, frame.emergency_stop);
        merge(&mut self.mechanical_power, frame.mechanical_power);
    }
}

/// Current-value table: every field the device has ever reported, with zero
/// defaults for fields it has not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp_ms: Option<u64>,
    pub drive: MotorState,
    pub brake: MotorState,
    pub dyno: DynoState,
}

impl TelemetrySample {
    /// Folds the fields present in `frame` into `self`; absent fields keep their value.
    pub fn apply(&mut self, frame: &TelemetryFrame) {
        if let Some(timestamp_ms) = frame.timestamp_ms {
            self.timestamp_ms = Some(timestamp_ms);
        }
        if let Some(drive) = &frame.drive {
            self.drive.apply(drive);
        }
        if let Some(brake) = &frame.brake {
            self.brake.apply(brake);
        }
        if let Some(dyno) = &frame.dyno {
            self.dyno.apply(dyno);
        }
    }

    pub fn max_temp_fet(&self) -> f64 {
        self.drive.temp_fet.max(self.brake.temp_fet)
    }

    pub fn max_temp_motor(&self) -> f64 {
        self.drive.temp_motor.max(self.brake.temp_motor)
    }
}

fn merge<T: Copy>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}
