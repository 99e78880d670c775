//! In-process stand-in for the dyno controller firmware.
//!
//! [`SimulatedDyno`] implements both transport halves: commands written to
//! the sink are interpreted like the firmware would (echo lines, `PONG:`,
//! `ACK:` in timing mode, enable/estop flags) and the source interleaves the
//! replies with a JSON telemetry frame every 100 ms.

use std::{
    collections::VecDeque,
    fmt, io,
    str::FromStr,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::link::{LineSink, LineSource};
use crate::protocol::{DynoFrame, MotorFrame, TelemetryFrame};

pub const FRAME_INTERVAL: Duration = Duration::from_millis(100);

const FRAME_DT_S: f64 = 0.1;
const RPM_RESPONSE: f64 = 0.8;
const THERMAL_RESPONSE: f64 = 0.02;
const SUPPLY_VOLTAGE: f64 = 48.0;
const AMBIENT_C: f64 = 25.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scenario {
    /// Motors at rest until commanded.
    #[default]
    Idle,
    SteadyState,
    /// Ramp to 2000 RPM and 15 A over 10 s.
    Startup,
    /// 2500 RPM with a slow sinusoidal brake load.
    LoadTest,
}

impl FromStr for Scenario {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Ok(match value {
            "idle" => Scenario::Idle,
            "steady_state" => Scenario::SteadyState,
            "startup" => Scenario::Startup,
            "load_test" => Scenario::LoadTest,
            other => bail!("unknown simulator scenario '{other}'"),
        })
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scenario::Idle => "idle",
            Scenario::SteadyState => "steady_state",
            Scenario::Startup => "startup",
            Scenario::LoadTest => "load_test",
        })
    }
}

impl Scenario {
    /// Scenario setpoints `(rpm, load)` `t` seconds after boot.
    fn setpoints(self, t: f64) -> (f64, f64) {
        match self {
            Scenario::Idle => (0.0, 0.0),
            Scenario::SteadyState => (1500.0, 20.0),
            Scenario::Startup => {
                let ramp = (t / 10.0).min(1.0);
                (2000.0 * ramp, 15.0 * ramp)
            }
            Scenario::LoadTest => (2500.0, 35.0 * ((t / 5.0).sin() * 0.3 + 0.7)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Motor {
    rpm: f64,
    current: f64,
    voltage: f64,
    temp_fet: f64,
    temp_motor: f64,
}

impl Default for Motor {
    fn default() -> Self {
        Self {
            rpm: 0.0,
            current: 0.0,
            voltage: SUPPLY_VOLTAGE,
            temp_fet: AMBIENT_C,
            temp_motor: AMBIENT_C,
        }
    }
}

struct SimState {
    scenario: Scenario,
    rng: StdRng,
    boot: Instant,
    next_frame: Instant,
    replies: VecDeque<String>,
    drive_enabled: bool,
    brake_enabled: bool,
    estop: bool,
    timing: bool,
    /// Set by the first setpoint command; the scenario stops driving targets.
    manual: bool,
    target_rpm: f64,
    target_load: f64,
    drive: Motor,
    brake: Motor,
    mechanical_power: f64,
}

impl SimState {
    fn new(scenario: Scenario, rng: StdRng) -> Self {
        let now = Instant::now();
        let running = scenario != Scenario::Idle;
        Self {
            scenario,
            rng,
            boot: now,
            next_frame: now + FRAME_INTERVAL,
            replies: VecDeque::new(),
            drive_enabled: running,
            brake_enabled: running,
            estop: false,
            timing: false,
            manual: false,
            target_rpm: 0.0,
            target_load: 0.0,
            drive: Motor::default(),
            brake: Motor::default(),
            mechanical_power: 0.0,
        }
    }

    fn millis(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }

    fn micros(&self) -> i64 {
        self.boot.elapsed().as_micros() as i64
    }

    fn noise(&mut self, value: f64, percent: f64) -> f64 {
        value + value * (percent / 100.0) * self.rng.gen_range(-1.0..=1.0)
    }

    fn handle_command(&mut self, line: &str) {
        let received = self.micros();
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default();
        let argument = parts.next();

        let reply = match (command, argument) {
            ("ping", None) => format!("PONG:{}", self.millis()),
            ("timing_on", None) => {
                self.timing = true;
                "Timing mode enabled".to_string()
            }
            ("timing_off", None) => {
                self.timing = false;
                "Timing mode disabled".to_string()
            }
            ("estop", None) => {
                self.estop = true;
                self.disable();
                "EMERGENCY STOP ACTIVATED".to_string()
            }
            ("disable_all", None) => {
                self.disable();
                "All motors disabled".to_string()
            }
            // Enabling either motor is how the firmware clears an estop.
            ("enable_drive", None) => {
                self.drive_enabled = true;
                self.estop = false;
                "Drive motor enabled".to_string()
            }
            ("enable_brake", None) => {
                self.brake_enabled = true;
                self.estop = false;
                "Brake motor enabled".to_string()
            }
            _ if self.estop => format!("Emergency stop active, ignoring '{line}'"),
            ("speed", Some(value)) => match value.parse::<i32>() {
                Ok(rpm) => {
                    self.take_manual_control();
                    self.target_rpm = f64::from(rpm);
                    if rpm != 0 {
                        self.drive_enabled = true;
                    }
                    format!("Drive RPM set to {rpm}")
                }
                Err(_) => format!("Invalid speed value: {value}"),
            },
            ("load", Some(value)) => match value.parse::<f64>() {
                Ok(amps) => {
                    self.take_manual_control();
                    self.target_load = amps;
                    if amps != 0.0 {
                        self.brake_enabled = true;
                    }
                    format!("Brake load set to {amps} A")
                }
                Err(_) => format!("Invalid load value: {value}"),
            },
            _ => format!("Unknown command: {line}"),
        };

        if self.timing && matches!(command, "speed" | "load") {
            let sent = self.micros();
            let acked = self.micros();
            self.replies
                .push_back(format!("ACK:{command}:{received}:{sent}:{acked}"));
        }
        self.replies.push_back(reply);
    }

    fn take_manual_control(&mut self) {
        if !self.manual {
            let (rpm, load) = self.scenario.setpoints(self.boot.elapsed().as_secs_f64());
            self.target_rpm = rpm;
            self.target_load = load;
            self.manual = true;
        }
    }

    fn disable(&mut self) {
        self.drive_enabled = false;
        self.brake_enabled = false;
        self.manual = true;
        self.target_rpm = 0.0;
        self.target_load = 0.0;
    }

    fn reboot(&mut self) {
        let scenario = self.scenario;
        let rng = StdRng::from_rng(&mut self.rng).unwrap_or_else(|_| StdRng::from_entropy());
        *self = SimState::new(scenario, rng);
    }

    /// Advances the plant one frame and renders it.
    fn advance_frame(&mut self) -> TelemetryFrame {
        let t = self.boot.elapsed().as_secs_f64();
        let (target_rpm, target_load) = if self.manual {
            (self.target_rpm, self.target_load)
        } else {
            self.scenario.setpoints(t)
        };
        let rpm_goal = if self.drive_enabled { target_rpm } else { 0.0 };
        let load_goal = if self.brake_enabled { target_load } else { 0.0 };

        let drive_rpm = self.drive.rpm + (rpm_goal - self.drive.rpm) * RPM_RESPONSE * FRAME_DT_S;
        self.drive.rpm = self.noise(drive_rpm, 1.5).max(0.0);
        let brake_rpm = self.brake.rpm + (rpm_goal * 0.99 - self.brake.rpm) * RPM_RESPONSE * FRAME_DT_S;
        self.brake.rpm = self.noise(brake_rpm, 1.5).max(0.0);

        self.drive.voltage = self.noise(SUPPLY_VOLTAGE, 3.0);
        self.brake.voltage = self.noise(SUPPLY_VOLTAGE, 3.0);

        self.drive.current = if self.drive_enabled {
            let base = self.drive.rpm / 3000.0 * 30.0 + self.rng.gen_range(2.0..8.0);
            self.noise(base, 5.0)
        } else {
            0.0
        };
        self.brake.current = self.noise(load_goal, 3.0);

        let speed_factor = (self.drive.rpm / 3000.0).min(1.0);
        let electrical = self.drive.voltage * self.drive.current * 0.85;
        let mechanical = self.noise(electrical * (0.7 + 0.3 * speed_factor), 2.0);
        self.mechanical_power = mechanical.max(0.0);

        for motor in [&mut self.drive, &mut self.brake] {
            let loss = motor.current * motor.voltage * 0.15;
            motor.temp_fet += (AMBIENT_C + loss * 0.6 * 0.8 - motor.temp_fet) * THERMAL_RESPONSE;
            motor.temp_motor +=
                (AMBIENT_C + loss * 0.4 * 0.8 - motor.temp_motor) * THERMAL_RESPONSE;
        }

        let drive_age = f64::from(self.rng.gen_range(50u32..=150));
        let brake_age = f64::from(self.rng.gen_range(50u32..=150));

        TelemetryFrame {
            timestamp_ms: Some(self.millis()),
            drive: Some(motor_frame(&self.drive, drive_age)),
            brake: Some(motor_frame(&self.brake, brake_age)),
            dyno: Some(DynoFrame {
                target_rpm: Some(target_rpm.round()),
                target_load: Some(round_to(target_load, 2)),
                drive_enabled: Some(self.drive_enabled),
                brake_enabled: Some(self.brake_enabled),
                emergency_stop: Some(self.estop),
                mechanical_power: Some(round_to(self.mechanical_power, 3)),
            }),
        }
    }
}

fn motor_frame(motor: &Motor, data_age_ms: f64) -> MotorFrame {
    MotorFrame {
        rpm: Some(motor.rpm.round()),
        current: Some(round_to(motor.current, 2)),
        voltage: Some(round_to(motor.voltage, 2)),
        temp_fet: Some(round_to(motor.temp_fet, 1)),
        temp_motor: Some(round_to(motor.temp_motor, 1)),
        duty_cycle: Some(round_to((motor.current / 50.0 * 100.0).min(100.0), 1)),
        data_age_ms: Some(data_age_ms),
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

struct Shared {
    state: Mutex<SimState>,
    wake: Condvar,
}

/// Handle on a simulated controller; clones share one device.
#[derive(Clone)]
pub struct SimulatedDyno {
    shared: Arc<Shared>,
}

impl SimulatedDyno {
    pub fn new(scenario: Scenario) -> Self {
        Self::with_rng(scenario, StdRng::from_entropy())
    }

    /// Deterministic noise for tests.
    pub fn with_seed(scenario: Scenario, seed: u64) -> Self {
        Self::with_rng(scenario, StdRng::seed_from_u64(seed))
    }

    fn with_rng(scenario: Scenario, rng: StdRng) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState::new(scenario, rng)),
                wake: Condvar::new(),
            }),
        }
    }

    /// Transport halves. `read_timeout` bounds each `read_line` call.
    pub fn transport(&self, read_timeout: Duration) -> (SimLineSource, SimLineSink) {
        (
            SimLineSource {
                shared: Arc::clone(&self.shared),
                read_timeout,
            },
            SimLineSink {
                shared: Arc::clone(&self.shared),
            },
        )
    }

    /// Power-cycles the controller: clock back to zero, flags and plant reset.
    pub fn reboot(&self) {
        let mut state = lock(&self.shared);
        state.reboot();
        state.replies.push_back("Dyno controller ready".to_string());
        self.shared.wake.notify_all();
    }

    pub fn scenario(&self) -> Scenario {
        lock(&self.shared).scenario
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, SimState> {
    match shared.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct SimLineSource {
    shared: Arc<Shared>,
    read_timeout: Duration,
}

impl LineSource for SimLineSource {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let deadline = Instant::now() + self.read_timeout;
        let mut state = lock(&self.shared);

        loop {
            if let Some(reply) = state.replies.pop_front() {
                return Ok(Some(reply));
            }

            let now = Instant::now();
            if now >= state.next_frame {
                state.next_frame = (state.next_frame + FRAME_INTERVAL).max(now);
                let frame = state.advance_frame();
                let line = serde_json::to_string(&frame)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                return Ok(Some(line));
            }
            if now >= deadline {
                return Ok(None);
            }

            let wait = (state.next_frame - now).min(deadline - now);
            state = match self.shared.wake.wait_timeout(state, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

pub struct SimLineSink {
    shared: Arc<Shared>,
}

impl LineSink for SimLineSink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut state = lock(&self.shared);
        state.handle_command(line.trim());
        self.shared.wake.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{parse_line, DeviceEvent};

    fn next_reply(source: &mut SimLineSource) -> String {
        for _ in 0..20 {
            if let Some(line) = source.read_line().unwrap() {
                if !line.starts_with('{') {
                    return line;
                }
            }
        }
        panic!("no reply");
    }

    #[test]
    fn ping_gets_a_pong() {
        let dyno = SimulatedDyno::with_seed(Scenario::Idle, 7);
        let (mut source, mut sink) = dyno.transport(Duration::from_millis(20));
        sink.write_line("ping").unwrap();
        assert!(matches!(
            parse_line(&next_reply(&mut source)),
            DeviceEvent::Pong { .. }
        ));
    }

    #[test]
    fn setpoints_are_echoed_and_estop_latches() {
        let dyno = SimulatedDyno::with_seed(Scenario::Idle, 7);
        let (mut source, mut sink) = dyno.transport(Duration::from_millis(20));

        sink.write_line("speed 1200").unwrap();
        assert_eq!(next_reply(&mut source), "Drive RPM set to 1200");
        sink.write_line("load 2.5").unwrap();
        assert_eq!(next_reply(&mut source), "Brake load set to 2.5 A");

        sink.write_line("estop").unwrap();
        assert_eq!(next_reply(&mut source), "EMERGENCY STOP ACTIVATED");
        sink.write_line("speed 100").unwrap();
        assert!(next_reply(&mut source).starts_with("Emergency stop active"));
        sink.write_line("bogus").unwrap();
        assert!(next_reply(&mut source).starts_with("Emergency stop active"));
    }

    #[test]
    fn enabling_a_motor_clears_the_estop() {
        let dyno = SimulatedDyno::with_seed(Scenario::Idle, 7);
        let (mut source, mut sink) = dyno.transport(Duration::from_millis(20));

        sink.write_line("estop").unwrap();
        assert_eq!(next_reply(&mut source), "EMERGENCY STOP ACTIVATED");
        assert!(lock(&dyno.shared).estop);

        sink.write_line("enable_brake").unwrap();
        assert_eq!(next_reply(&mut source), "Brake motor enabled");
        assert!(!lock(&dyno.shared).estop);

        sink.write_line("speed 800").unwrap();
        assert_eq!(next_reply(&mut source), "Drive RPM set to 800");
        let state = lock(&dyno.shared);
        assert!(state.drive_enabled);
        assert_eq!(state.target_rpm, 800.0);
    }

    #[test]
    fn timing_mode_acks_setpoints() {
        let dyno = SimulatedDyno::with_seed(Scenario::Idle, 7);
        let (mut source, mut sink) = dyno.transport(Duration::from_millis(20));
        sink.write_line("timing_on").unwrap();
        assert_eq!(next_reply(&mut source), "Timing mode enabled");

        sink.write_line("speed 300").unwrap();
        let DeviceEvent::Ack(ack) = parse_line(&next_reply(&mut source)) else {
            panic!("expected ACK");
        };
        assert_eq!(ack.command, "speed");
        assert!(ack.ack_time >= ack.receive_time);
        assert_eq!(next_reply(&mut source), "Drive RPM set to 300");
    }

    #[test]
    fn telemetry_frames_parse_and_track_setpoint() {
        let dyno = SimulatedDyno::with_seed(Scenario::Idle, 7);
        let (mut source, mut sink) = dyno.transport(Duration::from_millis(150));
        sink.write_line("speed 1000").unwrap();

        {
            let mut state = lock(&dyno.shared);
            state.replies.clear();
            for _ in 0..60 {
                state.advance_frame();
            }
        }

        let line = loop {
            if let Some(line) = source.read_line().unwrap() {
                break line;
            }
        };
        let DeviceEvent::Telemetry(frame) = parse_line(&line) else {
            panic!("expected telemetry, got {line}");
        };
        let rpm = frame.drive.and_then(|d| d.rpm).unwrap();
        assert!((900.0..1100.0).contains(&rpm), "rpm {rpm}");
        assert_eq!(frame.dyno.and_then(|d| d.drive_enabled), Some(true));
    }

    #[test]
    fn reboot_resets_the_device_clock() {
        let dyno = SimulatedDyno::with_seed(Scenario::SteadyState, 1);
        std::thread::sleep(Duration::from_millis(30));
        let before = lock(&dyno.shared).millis();
        dyno.reboot();
        assert!(lock(&dyno.shared).millis() < before);

        let (mut source, _sink) = dyno.transport(Duration::from_millis(20));
        assert_eq!(next_reply(&mut source), "Dyno controller ready");
    }

    #[test]
    fn scenario_names_round_trip() {
        for name in ["idle", "steady_state", "startup", "load_test"] {
            assert_eq!(name.parse::<Scenario>().unwrap().to_string(), name);
        }
        assert!("temp_ramp".parse::<Scenario>().is_err());
    }
}
