use std::fmt;

/// Host -> controller commands. `Display` renders the exact wire text
/// (without the trailing newline).
#[derive(Debug, Clone, PartialEq)]
pub enum DynoCommand {
    Speed(i32),
    Load(f64),
    EnableDrive,
    EnableBrake,
    DisableAll,
    EmergencyStop,
    TimingOn,
    TimingOff,
    Ping,
    Raw(String),
}

impl fmt::Display for DynoCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynoCommand::Speed(rpm) => write!(f, "speed {rpm}"),
            // Always send a decimal point: `load 10.0`, `load 2.5`.
            DynoCommand::Load(current) if current.fract() == 0.0 => write!(f, "load {current:.1}"),
            DynoCommand::Load(current) => write!(f, "load {current}"),
            DynoCommand::EnableDrive => f.write_str("enable_drive"),
            DynoCommand::EnableBrake => f.write_str("enable_brake"),
            DynoCommand::DisableAll => f.write_str("disable_all"),
            DynoCommand::EmergencyStop => f.write_str("estop"),
            DynoCommand::TimingOn => f.write_str("timing_on"),
            DynoCommand::TimingOff => f.write_str("timing_off"),
            DynoCommand::Ping => f.write_str("ping"),
            DynoCommand::Raw(text) => f.write_str(text),
        }
    }
}
