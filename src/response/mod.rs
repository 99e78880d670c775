//! Latency and step-response measurements against the live controller.

mod ping;
mod step;
mod tester;

use std::fmt::Write as _;
use std::time::Duration;

use serde::Serialize;

pub use ping::{PingStats, PingTracker};
pub use step::{analyze_step_response, StepAnalysisError, StepResponse};
pub use tester::{ResponseTest, ResponseTester, PONG_GRACE_PERIOD};

use crate::protocol::TelemetrySample;

/// Telemetry channel watched by a command-response test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResponseChannel {
    DriveRpm,
    BrakeCurrent,
}

impl ResponseChannel {
    pub fn read(self, sample: &TelemetrySample) -> f64 {
        match self {
            ResponseChannel::DriveRpm => sample.drive.rpm,
            ResponseChannel::BrakeCurrent => sample.brake.current,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ResponseChannel::DriveRpm => "drive rpm",
            ResponseChannel::BrakeCurrent => "brake current",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResponse {
    pub channel: ResponseChannel,
    pub target: f64,
    pub initial_value: f64,
    pub observed_value: f64,
    pub response_time: Duration,
}

/// Terminal result of one response-time test. A missing response is its own
/// variant, never a zero latency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ResponseOutcome {
    Ping(PingStats),
    NoResponses { sent: usize },
    Command(CommandResponse),
    TimedOut { channel: ResponseChannel, timeout: Duration },
    Step(StepResponse),
    AnalysisFailed(StepAnalysisError),
    SendFailed { command: String },
    Cancelled,
}

impl ResponseOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ResponseOutcome::Ping(_) | ResponseOutcome::Command(_) | ResponseOutcome::Step(_)
        )
    }

    /// Human-readable report.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        match self {
            ResponseOutcome::Ping(stats) => {
                let _ = writeln!(out, "Ping: {}/{} responses", stats.received, stats.sent);
                let _ = writeln!(out, "  Mean latency: {:.1} us", stats.mean_us);
                let _ = writeln!(out, "  Median latency: {:.1} us", stats.median_us);
                let _ = writeln!(out, "  Min/Max: {:.1}/{:.1} us", stats.min_us, stats.max_us);
                let _ = write!(out, "  Std dev: {:.1} us", stats.stdev_us);
            }
            ResponseOutcome::NoResponses { sent } => {
                let _ = write!(out, "Ping: no valid responses received ({sent} sent)");
            }
            ResponseOutcome::Command(resp) => {
                let us = resp.response_time.as_secs_f64() * 1e6;
                let _ = writeln!(
                    out,
                    "{} response: {:.1} -> {:.1} (target {:.1})",
                    resp.channel.label(),
                    resp.initial_value,
                    resp.observed_value,
                    resp.target
                );
                let _ = write!(out, "  Response time: {:.1} us ({:.2} ms)", us, us / 1000.0);
            }
            ResponseOutcome::TimedOut { channel, timeout } => {
                let _ = write!(
                    out,
                    "{} response: no response detected within {:.1} s",
                    channel.label(),
                    timeout.as_secs_f64()
                );
            }
            ResponseOutcome::Step(step) => {
                let _ = writeln!(
                    out,
                    "Step response: {:.1} -> {:.1}, final {:.1}",
                    step.initial_value, step.target_value, step.final_value
                );
                let _ = writeln!(out, "  Rise time: {}", format_secs(step.rise_time_s));
                let _ = writeln!(out, "  Settling time: {}", format_secs(step.settling_time_s));
                let _ = writeln!(out, "  Overshoot: {:.1}%", step.overshoot_percent);
                let _ = write!(out, "  Steady-state error: {:.1}", step.steady_state_error);
            }
            ResponseOutcome::AnalysisFailed(err) => {
                let _ = write!(out, "Step response: analysis error: {err}");
            }
            ResponseOutcome::SendFailed { command } => {
                let _ = write!(out, "Failed to send '{command}'");
            }
            ResponseOutcome::Cancelled => out.push_str("Test cancelled"),
        }
        out
    }
}

fn format_secs(value: Option<f64>) -> String {
    match value {
        Some(secs) => format!("{secs:.3} s"),
        None => "N/A".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_response_summary_is_not_a_latency() {
        let outcome = ResponseOutcome::NoResponses { sent: 10 };
        assert!(!outcome.is_success());
        assert_eq!(outcome.summary(), "Ping: no valid responses received (10 sent)");
    }

    #[test]
    fn command_summary_reports_microseconds_and_millis() {
        let outcome = ResponseOutcome::Command(CommandResponse {
            channel: ResponseChannel::BrakeCurrent,
            target: 2.0,
            initial_value: 0.0,
            observed_value: 0.4,
            response_time: Duration::from_micros(12_500),
        });
        let summary = outcome.summary();
        assert!(summary.starts_with("brake current response"));
        assert!(summary.contains("12500.0 us (12.50 ms)"));
    }

    #[test]
    fn undefined_step_metrics_print_na() {
        let (times, values): (Vec<f64>, Vec<f64>) =
            (0..12).map(|i| (f64::from(i) * 0.1, 500.0)).unzip();
        let step = analyze_step_response(&times, &values, 0.0, 500.0).unwrap();
        let summary = ResponseOutcome::Step(step).summary();
        assert!(summary.contains("Rise time: N/A"));
        assert!(summary.contains("Settling time: 0.000 s"));
    }
}
