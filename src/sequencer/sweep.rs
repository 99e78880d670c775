//! Sweep plans and per-point averaging.

use serde::Serialize;
use tokio::time::Duration;
use uuid::Uuid;

use crate::protocol::TelemetrySample;

use super::validation::{GridSweepParams, SpeedSweepParams};

/// 2D sweeps sample at 5 Hz for 2 s at every point.
pub const SAMPLES_PER_POINT: usize = 10;
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);
/// Part of each step reserved for sampling.
const SAMPLING_RESERVE_S: f64 = 2.0;
const MIN_STABILIZATION_S: f64 = 1.0;

/// `steps` evenly spaced values from `start` to `end`, both inclusive.
pub fn linspace(start: f64, end: f64, steps: u32) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let span = end - start;
            let last = f64::from(steps - 1);
            (0..steps)
                .map(|i| start + span * f64::from(i) / last)
                .collect()
        }
    }
}

/// Commanded RPM per step, truncated toward zero.
pub fn speed_setpoints(params: &SpeedSweepParams) -> Vec<i32> {
    linspace(params.start_rpm, params.end_rpm, params.steps)
        .into_iter()
        .map(|rpm| rpm as i32)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridStep {
    /// 1-based.
    pub step_number: usize,
    pub target_rpm: f64,
    pub target_amperage: f64,
    /// First step at a new RPM level; the drive setpoint is sent only here.
    pub new_rpm: bool,
}

/// RPM ascending in the outer loop, amperage descending within each RPM.
pub fn grid_plan(params: &GridSweepParams) -> Vec<GridStep> {
    let (start_rpm, end_rpm) = params.rpm_range;
    let (start_amps, end_amps) = params.amperage_range;
    let rpms = linspace(start_rpm, end_rpm, params.rpm_steps);
    let amps = linspace(end_amps, start_amps, params.amperage_steps);

    let mut plan = Vec::with_capacity(rpms.len() * amps.len());
    for &target_rpm in &rpms {
        for (j, &target_amperage) in amps.iter().enumerate() {
            plan.push(GridStep {
                step_number: plan.len() + 1,
                target_rpm,
                target_amperage,
                new_rpm: j == 0,
            });
        }
    }
    plan
}

pub fn stabilization_time(step_duration_s: f64) -> Duration {
    Duration::from_secs_f64((step_duration_s - SAMPLING_RESERVE_S).max(MIN_STABILIZATION_S))
}

/// One averaged operating point of a 2D sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepDataPoint {
    pub run_id: Uuid,
    pub step_number: usize,
    pub target_rpm: f64,
    pub target_amperage: f64,
    pub actual_rpm: f64,
    pub actual_amperage: f64,
    pub drive_current: f64,
    pub mechanical_power: f64,
    pub drive_temp_fet: f64,
    pub drive_temp_motor: f64,
    pub brake_temp_fet: f64,
    pub brake_temp_motor: f64,
    pub drive_voltage: f64,
    pub brake_voltage: f64,
    /// Max of the averaged drive and brake values.
    pub max_temp_fet: f64,
    pub max_temp_motor: f64,
    pub sample_count: usize,
    pub actual_rpm_std: f64,
    pub actual_amperage_std: f64,
    pub mechanical_power_std: f64,
    /// Spread of the per-sample FET maxima.
    pub max_temp_fet_std: f64,
}

/// Welford mean and population variance.
#[derive(Debug, Clone, Copy, Default)]
struct RunningStat {
    count: usize,
    mean: f64,
    m2: f64,
}

impl RunningStat {
    fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn population_std(&self) -> f64 {
        if self.count > 1 {
            (self.m2 / self.count as f64).sqrt()
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SampleAccumulator {
    actual_rpm: RunningStat,
    actual_amperage: RunningStat,
    drive_current: RunningStat,
    mechanical_power: RunningStat,
    drive_temp_fet: RunningStat,
    drive_temp_motor: RunningStat,
    brake_temp_fet: RunningStat,
    brake_temp_motor: RunningStat,
    drive_voltage: RunningStat,
    brake_voltage: RunningStat,
    max_temp_fet: RunningStat,
}

impl SampleAccumulator {
    pub fn push(&mut self, sample: &TelemetrySample) {
        self.actual_rpm.push(sample.drive.rpm);
        self.actual_amperage.push(sample.brake.current);
        self.drive_current.push(sample.drive.current);
        self.mechanical_power.push(sample.dyno.mechanical_power);
        self.drive_temp_fet.push(sample.drive.temp_fet);
        self.drive_temp_motor.push(sample.drive.temp_motor);
        self.brake_temp_fet.push(sample.brake.temp_fet);
        self.brake_temp_motor.push(sample.brake.temp_motor);
        self.drive_voltage.push(sample.drive.voltage);
        self.brake_voltage.push(sample.brake.voltage);
        self.max_temp_fet.push(sample.max_temp_fet());
    }

    pub fn len(&self) -> usize {
        self.actual_rpm.count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `None` when nothing was sampled.
    pub fn finish(&self, run_id: Uuid, step: &GridStep) -> Option<SweepDataPoint> {
        if self.is_empty() {
            return None;
        }

        let drive_temp_fet = self.drive_temp_fet.mean;
        let drive_temp_motor = self.drive_temp_motor.mean;
        let brake_temp_fet = self.brake_temp_fet.mean;
        let brake_temp_motor = self.brake_temp_motor.mean;

        Some(SweepDataPoint {
            run_id,
            step_number: step.step_number,
            target_rpm: step.target_rpm,
            target_amperage: step.target_amperage,
            actual_rpm: self.actual_rpm.mean,
            actual_amperage: self.actual_amperage.mean,
            drive_current: self.drive_current.mean,
            mechanical_power: self.mechanical_power.mean,
            drive_temp_fet,
            drive_temp_motor,
            brake_temp_fet,
            brake_temp_motor,
            drive_voltage: self.drive_voltage.mean,
            brake_voltage: self.brake_voltage.mean,
            max_temp_fet: drive_temp_fet.max(brake_temp_fet),
            max_temp_motor: drive_temp_motor.max(brake_temp_motor),
            sample_count: self.len(),
            actual_rpm_std: self.actual_rpm.population_std(),
            actual_amperage_std: self.actual_amperage.population_std(),
            mechanical_power_std: self.mechanical_power.population_std(),
            max_temp_fet_std: self.max_temp_fet.population_std(),
        })
    }
}
