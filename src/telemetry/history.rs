use std::collections::VecDeque;

use serde::Serialize;

use crate::protocol::TelemetrySample;

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Rolling history kept as parallel columns; index `i` of every column belongs
/// to the same frame.
#[derive(Debug, Clone)]
pub struct History {
    capacity: usize,
    timestamps: VecDeque<f64>,
    drive_rpm: VecDeque<f64>,
    drive_current: VecDeque<f64>,
    drive_voltage: VecDeque<f64>,
    drive_temp_fet: VecDeque<f64>,
    drive_temp_motor: VecDeque<f64>,
    brake_rpm: VecDeque<f64>,
    brake_current: VecDeque<f64>,
    brake_voltage: VecDeque<f64>,
    brake_temp_fet: VecDeque<f64>,
    brake_temp_motor: VecDeque<f64>,
    mechanical_power: VecDeque<f64>,
}

/// Owned copy of the history columns, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlotData {
    pub timestamps: Vec<f64>,
    pub drive_rpm: Vec<f64>,
    pub drive_current: Vec<f64>,
    pub drive_voltage: Vec<f64>,
    pub drive_temp_fet: Vec<f64>,
    pub drive_temp_motor: Vec<f64>,
    pub brake_rpm: Vec<f64>,
    pub brake_current: Vec<f64>,
    pub brake_voltage: Vec<f64>,
    pub brake_temp_fet: Vec<f64>,
    pub brake_temp_motor: Vec<f64>,
    pub mechanical_power: Vec<f64>,
}

impl PlotData {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let column = || VecDeque::with_capacity(capacity);
        Self {
            capacity,
            timestamps: column(),
            drive_rpm: column(),
            drive_current: column(),
            drive_voltage: column(),
            drive_temp_fet: column(),
            drive_temp_motor: column(),
            brake_rpm: column(),
            brake_current: column(),
            brake_voltage: column(),
            brake_temp_fet: column(),
            brake_temp_motor: column(),
            mechanical_power: column(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn push(&mut self, relative_time: f64, sample: &TelemetrySample) {
        let capacity = self.capacity;
        let put = |column: &mut VecDeque<f64>, value: f64| {
            if column.len() == capacity {
                column.pop_front();
            }
            column.push_back(value);
        };

        put(&mut self.timestamps, relative_time);
        put(&mut self.drive_rpm, sample.drive.rpm);
        put(&mut self.drive_current, sample.drive.current);
        put(&mut self.drive_voltage, sample.drive.voltage);
        put(&mut self.drive_temp_fet, sample.drive.temp_fet);
        put(&mut self.drive_temp_motor, sample.drive.temp_motor);
        put(&mut self.brake_rpm, sample.brake.rpm);
        put(&mut self.brake_current, sample.brake.current);
        put(&mut self.brake_voltage, sample.brake.voltage);
        put(&mut self.brake_temp_fet, sample.brake.temp_fet);
        put(&mut self.brake_temp_motor, sample.brake.temp_motor);
        put(&mut self.mechanical_power, sample.dyno.mechanical_power);
    }

    pub fn clear(&mut self) {
        for column in self.columns_mut() {
            column.clear();
        }
    }

    pub fn plot_data(&self) -> PlotData {
        let copy = |column: &VecDeque<f64>| column.iter().copied().collect::<Vec<_>>();
        PlotData {
            timestamps: copy(&self.timestamps),
            drive_rpm: copy(&self.drive_rpm),
            drive_current: copy(&self.drive_current),
            drive_voltage: copy(&self.drive_voltage),
            drive_temp_fet: copy(&self.drive_temp_fet),
            drive_temp_motor: copy(&self.drive_temp_motor),
            brake_rpm: copy(&self.brake_rpm),
            brake_current: copy(&self.brake_current),
            brake_voltage: copy(&self.brake_voltage),
            brake_temp_fet: copy(&self.brake_temp_fet),
            brake_temp_motor: copy(&self.brake_temp_motor),
            mechanical_power: copy(&self.mechanical_power),
        }
    }

    fn columns_mut(&mut self) -> [&mut VecDeque<f64>; 12] {
        [
            &mut self.timestamps,
            &mut self.drive_rpm,
            &mut self.drive_current,
            &mut self.drive_voltage,
            &mut self.drive_temp_fet,
            &mut self.drive_temp_motor,
            &mut self.brake_rpm,
            &mut self.brake_current,
            &mut self.brake_voltage,
            &mut self.brake_temp_fet,
            &mut self.brake_temp_motor,
            &mut self.mechanical_power,
        ]
    }
}
