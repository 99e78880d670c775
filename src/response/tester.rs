use log::{info, warn};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::link::CommandInterface;
use crate::protocol::DynoCommand;
use crate::telemetry::TelemetryHandle;
use crate::utils::wait::{sleep_or_cancel, sleep_until_or_cancel};

use super::{
    analyze_step_response, CommandResponse, PingStats, PingTracker, ResponseChannel,
    ResponseOutcome, StepAnalysisError,
};

/// How long the ping test keeps waiting for late PONGs after the last send.
pub const PONG_GRACE_PERIOD: Duration = Duration::from_secs(1);

const ENABLE_SETTLE: Duration = Duration::from_millis(100);
const RESPONSE_POLL: Duration = Duration::from_millis(1);
const PONG_POLL: Duration = Duration::from_millis(10);
/// Fraction of the commanded change that counts as a response.
const RESPONSE_THRESHOLD: f64 = 0.1;

/// One response-time test and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseTest {
    Ping {
        iterations: usize,
        delay: Duration,
    },
    DriveResponse {
        target_rpm: i32,
        timeout: Duration,
    },
    BrakeResponse {
        target_current: f64,
        timeout: Duration,
    },
    Step {
        target_rpm: i32,
        duration: Duration,
        sample_rate_hz: f64,
    },
}

/// Runs response-time tests through the shared command interface.
///
/// PONGs reach the tester through the [`PingTracker`] the dispatcher feeds;
/// everything else is read from telemetry snapshots.
#[derive(Clone)]
pub struct ResponseTester {
    commands: CommandInterface,
    telemetry: TelemetryHandle,
    pings: PingTracker,
}

impl ResponseTester {
    pub fn new(commands: CommandInterface, telemetry: TelemetryHandle, pings: PingTracker) -> Self {
        Self {
            commands,
            telemetry,
            pings,
        }
    }

    pub async fn run(&self, test: ResponseTest, cancel: &CancellationToken) -> ResponseOutcome {
        info!("Starting response test {test:?}");
        let outcome = match test {
            ResponseTest::Ping { iterations, delay } => {
                self.ping_test(iterations, delay, cancel).await
            }
            ResponseTest::DriveResponse {
                target_rpm,
                timeout,
            } => {
                self.command_response_test(
                    ResponseChannel::DriveRpm,
                    f64::from(target_rpm),
                    timeout,
                    cancel,
                )
                .await
            }
            ResponseTest::BrakeResponse {
                target_current,
                timeout,
            } => {
                self.command_response_test(
                    ResponseChannel::BrakeCurrent,
                    target_current,
                    timeout,
                    cancel,
                )
                .await
            }
            ResponseTest::Step {
                target_rpm,
                duration,
                sample_rate_hz,
            } => {
                self.step_response_test(target_rpm, duration, sample_rate_hz, cancel)
                    .await
            }
        };
        info!("Response test finished: {}", outcome.summary().lines().next().unwrap_or(""));
        outcome
    }

    pub async fn ping_test(
        &self,
        iterations: usize,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> ResponseOutcome {
        self.pings.reset();
        if !self.commands.enable_timing_mode() {
            return ResponseOutcome::SendFailed {
                command: "timing_on".into(),
            };
        }

        let mut sent = 0;
        let mut cancelled = false;
        for _ in 0..iterations {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            // Recorded before the write so a fast PONG always finds its send.
            self.pings.record_send(Instant::now());
            if self.commands.send_ping() {
                sent += 1;
            } else {
                self.pings.withdraw_last();
            }

            if !delay.is_zero() && !sleep_or_cancel(delay, cancel).await {
                cancelled = true;
                break;
            }
        }

        if !cancelled {
            let deadline = Instant::now() + PONG_GRACE_PERIOD;
            while self.pings.outstanding() > 0 && Instant::now() < deadline {
                if !sleep_or_cancel(PONG_POLL, cancel).await {
                    cancelled = true;
                    break;
                }
            }
        }

        self.commands.disable_timing_mode();

        if cancelled {
            return ResponseOutcome::Cancelled;
        }
        match PingStats::from_round_trips(sent, self.pings.round_trips()) {
            Some(stats) => ResponseOutcome::Ping(stats),
            None => ResponseOutcome::NoResponses { sent },
        }
    }

    pub async fn command_response_test(
        &self,
        channel: ResponseChannel,
        target: f64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ResponseOutcome {
        let outcome = self
            .measure_command_response(channel, target, timeout, cancel)
            .await;

        match channel {
            ResponseChannel::DriveRpm => self.commands.set_drive_speed(0),
            ResponseChannel::BrakeCurrent => self.commands.set_brake_load(0.0),
        };
        self.commands.disable_all();

        outcome
    }

    async fn measure_command_response(
        &self,
        channel: ResponseChannel,
        target: f64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ResponseOutcome {
        let enabled = match channel {
            ResponseChannel::DriveRpm => self.commands.enable_drive(),
            ResponseChannel::BrakeCurrent => self.commands.enable_brake(),
        };
        if !enabled {
            return ResponseOutcome::SendFailed {
                command: match channel {
                    ResponseChannel::DriveRpm => "enable_drive".into(),
                    ResponseChannel::BrakeCurrent => "enable_brake".into(),
                },
            };
        }
        if !sleep_or_cancel(ENABLE_SETTLE, cancel).await {
            return ResponseOutcome::Cancelled;
        }

        let initial_value = channel.read(&self.telemetry.current());
        let expected_change = (target - initial_value).abs();

        let sent_at = Instant::now();
        let delivered = match channel {
            ResponseChannel::DriveRpm => self.commands.set_drive_speed(target as i32),
            ResponseChannel::BrakeCurrent => self.commands.set_brake_load(target),
        };
        if !delivered {
            return ResponseOutcome::SendFailed {
                command: match channel {
                    ResponseChannel::DriveRpm => DynoCommand::Speed(target as i32).to_string(),
                    ResponseChannel::BrakeCurrent => DynoCommand::Load(target).to_string(),
                },
            };
        }

        let deadline = sent_at + timeout;
        let mut poll = time::interval(RESPONSE_POLL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ResponseOutcome::Cancelled,
                _ = time::sleep_until(deadline) => {
                    warn!("No {} response within {timeout:?}", channel.label());
                    return ResponseOutcome::TimedOut { channel, timeout };
                }
                _ = poll.tick() => {
                    let observed_value = channel.read(&self.telemetry.current());
                    if expected_change > 0.0
                        && (observed_value - initial_value).abs() > RESPONSE_THRESHOLD * expected_change
                    {
                        return ResponseOutcome::Command(CommandResponse {
                            channel,
                            target,
                            initial_value,
                            observed_value,
                            response_time: sent_at.elapsed(),
                        });
                    }
                }
            }
        }
    }

    pub async fn step_response_test(
        &self,
        target_rpm: i32,
        duration: Duration,
        sample_rate_hz: f64,
        cancel: &CancellationToken,
    ) -> ResponseOutcome {
        if !(sample_rate_hz > 0.0 && sample_rate_hz.is_finite()) {
            return ResponseOutcome::AnalysisFailed(StepAnalysisError::InvalidSampleRate {
                rate_hz: sample_rate_hz,
            });
        }

        let captured = self
            .capture_step(target_rpm, duration, sample_rate_hz, cancel)
            .await;

        self.commands.set_drive_speed(0);
        self.commands.disable_all();

        let (initial, times, values) = match captured {
            Ok(series) => series,
            Err(outcome) => return outcome,
        };

        match analyze_step_response(&times, &values, initial, f64::from(target_rpm)) {
            Ok(step) => ResponseOutcome::Step(step),
            Err(err) => ResponseOutcome::AnalysisFailed(err),
        }
    }

    async fn capture_step(
        &self,
        target_rpm: i32,
        duration: Duration,
        sample_rate_hz: f64,
        cancel: &CancellationToken,
    ) -> Result<(f64, Vec<f64>, Vec<f64>), ResponseOutcome> {
        if !self.commands.enable_drive() {
            return Err(ResponseOutcome::SendFailed {
                command: "enable_drive".into(),
            });
        }
        if !sleep_or_cancel(ENABLE_SETTLE, cancel).await {
            return Err(ResponseOutcome::Cancelled);
        }

        let started = Instant::now();
        let initial = self.telemetry.current().drive.rpm;
        if !self.commands.set_drive_speed(target_rpm) {
            return Err(ResponseOutcome::SendFailed {
                command: format!("speed {target_rpm}"),
            });
        }

        let interval = Duration::from_secs_f64(1.0 / sample_rate_hz);
        let mut times = Vec::new();
        let mut values = Vec::new();
        let mut next_sample = started;
        while started.elapsed() < duration {
            times.push(started.elapsed().as_secs_f64());
            values.push(self.telemetry.current().drive.rpm);

            next_sample += interval;
            if !sleep_until_or_cancel(next_sample, cancel).await {
                return Err(ResponseOutcome::Cancelled);
            }
        }

        Ok((initial, times, values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testing::RecordingSink;
    use crate::protocol::{MotorFrame, TelemetryFrame};

    fn rig() -> (RecordingSink, ResponseTester, TelemetryHandle, PingTracker) {
        let sink = RecordingSink::default();
        let commands = CommandInterface::new(Box::new(sink.clone()));
        let telemetry = TelemetryHandle::default();
        let pings = PingTracker::new();
        let tester = ResponseTester::new(commands, telemetry.clone(), pings.clone());
        (sink, tester, telemetry, pings)
    }

    fn drive_rpm(rpm: f64) -> TelemetryFrame {
        TelemetryFrame {
            drive: Some(MotorFrame {
                rpm: Some(rpm),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn brake_current(current: f64) -> TelemetryFrame {
        TelemetryFrame {
            brake: Some(MotorFrame {
                current: Some(current),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ping_test_collects_every_pong() {
        let (sink, tester, _telemetry, pings) = rig();
        let mut audit = tester.commands.subscribe();
        tokio::spawn(async move {
            while let Ok(sent) = audit.recv().await {
                if sent.line == "ping" {
                    time::sleep(Duration::from_millis(2)).await;
                    pings.record_pong(Instant::now());
                }
            }
        });

        let outcome = tester
            .ping_test(5, Duration::from_millis(20), &CancellationToken::new())
            .await;

        let ResponseOutcome::Ping(stats) = outcome else {
            panic!("expected ping stats, got {outcome:?}");
        };
        assert_eq!(stats.sent, 5);
        assert_eq!(stats.received, 5);
        assert!(stats.rtts_us.iter().all(|rtt| *rtt >= 2_000.0 && *rtt < 3_000.0));

        let lines = sink.lines();
        assert_eq!(lines.first().map(String::as_str), Some("timing_on"));
        assert_eq!(lines.last().map(String::as_str), Some("timing_off"));
        assert_eq!(lines.iter().filter(|l| *l == "ping").count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_yields_no_responses_after_grace() {
        let (_sink, tester, _telemetry, _pings) = rig();
        let started = Instant::now();
        let outcome = tester
            .ping_test(3, Duration::ZERO, &CancellationToken::new())
            .await;
        assert_eq!(outcome, ResponseOutcome::NoResponses { sent: 3 });
        assert!(started.elapsed() >= PONG_GRACE_PERIOD);
    }

    #[tokio::test(start_paused = true)]
    async fn timing_on_failure_aborts_before_any_ping() {
        let (sink, tester, _telemetry, pings) = rig();
        sink.set_failing(true);
        let outcome = tester
            .ping_test(3, Duration::ZERO, &CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            ResponseOutcome::SendFailed {
                command: "timing_on".into()
            }
        );
        assert_eq!(pings.outstanding(), 0);
        assert!(sink.lines().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ping_writes_are_withdrawn_from_the_tracker() {
        let (sink, tester, _telemetry, pings) = rig();
        let mut audit = tester.commands.subscribe();
        let port = sink.clone();
        let tracker = pings.clone();
        tokio::spawn(async move {
            while let Ok(sent) = audit.recv().await {
                if sent.line == "ping" && sent.delivered {
                    // The port drops pings after the first one goes through.
                    port.reject("ping");
                    time::sleep(Duration::from_millis(2)).await;
                    tracker.record_pong(Instant::now());
                }
            }
        });

        let outcome = tester
            .ping_test(3, Duration::from_millis(20), &CancellationToken::new())
            .await;

        let ResponseOutcome::Ping(stats) = outcome else {
            panic!("expected ping stats, got {outcome:?}");
        };
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.received, 1);
        assert!(stats.rtts_us[0] >= 2_000.0 && stats.rtts_us[0] < 3_000.0);
        assert_eq!(pings.outstanding(), 0);
        assert_eq!(sink.lines(), vec!["timing_on", "ping", "timing_off"]);
    }

    #[tokio::test(start_paused = true)]
    async fn drive_response_time_is_measured_from_the_setpoint() {
        let (sink, tester, telemetry, _pings) = rig();
        let feeder = telemetry.clone();
        tokio::spawn(async move {
            // Setpoint goes out at 100 ms; motor moves 50 ms later.
            time::sleep(Duration::from_millis(150)).await;
            feeder.ingest(&drive_rpm(400.0));
        });

        let outcome = tester
            .run(
                ResponseTest::DriveResponse {
                    target_rpm: 1000,
                    timeout: Duration::from_secs(5),
                },
                &CancellationToken::new(),
            )
            .await;

        let ResponseOutcome::Command(resp) = outcome else {
            panic!("expected a response, got {outcome:?}");
        };
        assert_eq!(resp.initial_value, 0.0);
        assert_eq!(resp.observed_value, 400.0);
        assert!(resp.response_time >= Duration::from_millis(50));
        assert!(resp.response_time <= Duration::from_millis(52));
        assert_eq!(
            sink.lines(),
            vec!["enable_drive", "speed 1000", "speed 0", "disable_all"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn small_movement_times_out_and_still_stops_the_brake() {
        let (sink, tester, telemetry, _pings) = rig();
        telemetry.ingest(&brake_current(1.0));
        let feeder = telemetry.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(200)).await;
            // 0.05 A of a 1 A change is below the 10 % threshold.
            feeder.ingest(&brake_current(1.05));
        });

        let outcome = tester
            .command_response_test(
                ResponseChannel::BrakeCurrent,
                2.0,
                Duration::from_millis(500),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(
            outcome,
            ResponseOutcome::TimedOut {
                channel: ResponseChannel::BrakeCurrent,
                timeout: Duration::from_millis(500)
            }
        );
        assert_eq!(
            sink.lines(),
            vec!["enable_brake", "load 2.0", "load 0.0", "disable_all"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn step_test_samples_full_duration_then_analyzes() {
        let (sink, tester, telemetry, _pings) = rig();
        let feeder = telemetry.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(100)).await;
            for i in 1..=10 {
                time::sleep(Duration::from_millis(50)).await;
                feeder.ingest(&drive_rpm(f64::from(i) * 80.0));
            }
        });

        let outcome = tester
            .step_response_test(800, Duration::from_secs(2), 20.0, &CancellationToken::new())
            .await;

        let ResponseOutcome::Step(step) = outcome else {
            panic!("expected step analysis, got {outcome:?}");
        };
        assert_eq!(step.values.len(), 40);
        assert_eq!(step.final_value, 800.0);
        assert!(step.rise_time_s.is_some());
        assert_eq!(step.overshoot, 0.0);
        assert_eq!(sink.lines().last().map(String::as_str), Some("disable_all"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_step_test_still_stops_the_drive() {
        let (sink, tester, _telemetry, _pings) = rig();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let outcome = tester
            .step_response_test(800, Duration::from_secs(10), 50.0, &cancel)
            .await;
        assert_eq!(outcome, ResponseOutcome::Cancelled);
        assert_eq!(
            sink.lines(),
            vec!["enable_drive", "speed 800", "speed 0", "disable_all"]
        );
    }
}
