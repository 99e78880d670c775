use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_RPM: f64 = 10_000.0;
pub const MAX_AMPERAGE: f64 = 50.0;
pub const MAX_STEP_DURATION_S: f64 = 300.0;
pub const MAX_AXIS_STEPS: u32 = 50;
pub const MAX_TOTAL_STEPS: u32 = 2_500;
pub const MAX_TOTAL_DURATION_S: f64 = 7_200.0;

/// Every violated rule, in check order.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{}", .0.join("; "))]
pub struct ValidationErrors(pub Vec<String>);

impl ValidationErrors {
    pub fn messages(&self) -> &[String] {
        &self.0
    }

    fn into_result(self) -> Result<(), ValidationErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    fn check(&mut self, violated: bool, message: impl Into<String>) {
        if violated {
            self.0.push(message.into());
        }
    }
}

/// 1D sweep of drive speed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedSweepParams {
    pub start_rpm: f64,
    pub end_rpm: f64,
    pub steps: u32,
    pub step_duration_s: f64,
}

impl SpeedSweepParams {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors(Vec::new());
        errors.check(self.start_rpm < 0.0, "Start RPM cannot be negative");
        errors.check(self.end_rpm < 0.0, "End RPM cannot be negative");
        errors.check(self.steps == 0, "Steps must be positive");
        errors.check(
            self.start_rpm >= self.end_rpm,
            "Start RPM must be less than end RPM",
        );
        errors.check(
            self.end_rpm > MAX_RPM,
            format!("End RPM exceeds safety limit ({MAX_RPM} RPM)"),
        );
        check_step_duration(&mut errors, self.step_duration_s);
        errors.into_result()
    }
}

/// 2D sweep: drive speed (outer) x brake current (inner).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSweepParams {
    pub rpm_range: (f64, f64),
    pub amperage_range: (f64, f64),
    pub rpm_steps: u32,
    pub amperage_steps: u32,
    pub step_duration_s: f64,
}

impl GridSweepParams {
    pub fn total_steps(&self) -> u32 {
        self.rpm_steps.saturating_mul(self.amperage_steps)
    }

    pub fn total_duration_s(&self) -> f64 {
        f64::from(self.total_steps()) * self.step_duration_s
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let (start_rpm, end_rpm) = self.rpm_range;
        let (start_amps, end_amps) = self.amperage_range;
        let mut errors = ValidationErrors(Vec::new());

        errors.check(start_rpm < 0.0, "Start RPM cannot be negative");
        errors.check(end_rpm < 0.0, "End RPM cannot be negative");
        errors.check(start_rpm >= end_rpm, "Start RPM must be less than end RPM");
        errors.check(
            end_rpm > MAX_RPM,
            format!("End RPM exceeds safety limit ({MAX_RPM} RPM)"),
        );
        errors.check(self.rpm_steps == 0, "RPM steps must be positive");
        errors.check(
            self.rpm_steps > MAX_AXIS_STEPS,
            format!("RPM steps exceed reasonable limit ({MAX_AXIS_STEPS})"),
        );

        errors.check(start_amps < 0.0, "Start amperage cannot be negative");
        errors.check(end_amps < 0.0, "End amperage cannot be negative");
        errors.check(
            start_amps >= end_amps,
            "Start amperage must be less than end amperage",
        );
        errors.check(
            end_amps > MAX_AMPERAGE,
            format!("End amperage exceeds safety limit ({MAX_AMPERAGE} A)"),
        );
        errors.check(self.amperage_steps == 0, "Amperage steps must be positive");
        errors.check(
            self.amperage_steps > MAX_AXIS_STEPS,
            format!("Amperage steps exceed reasonable limit ({MAX_AXIS_STEPS})"),
        );

        check_step_duration(&mut errors, self.step_duration_s);

        let total_duration = self.total_duration_s();
        errors.check(
            total_duration > MAX_TOTAL_DURATION_S,
            format!(
                "Total test duration ({:.1} minutes) exceeds safety limit ({:.0} minutes)",
                total_duration / 60.0,
                MAX_TOTAL_DURATION_S / 60.0
            ),
        );
        errors.check(
            self.total_steps() > MAX_TOTAL_STEPS,
            format!(
                "Total data points ({}) exceeds reasonable limit ({MAX_TOTAL_STEPS})",
                self.total_steps()
            ),
        );

        errors.into_result()
    }
}

fn check_step_duration(errors: &mut ValidationErrors, step_duration_s: f64) {
    // NaN fails both bounds.
    errors.check(!(step_duration_s > 0.0), "Step duration must be positive");
    errors.check(
        step_duration_s > MAX_STEP_DURATION_S,
        format!("Step duration exceeds safety limit ({MAX_STEP_DURATION_S} seconds)"),
    );
}
