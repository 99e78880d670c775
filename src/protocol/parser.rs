use serde_json::Value;

use super::{AckTiming, DeviceEvent, TelemetryFrame};

const PONG_PREFIX: &str = "PONG:";
const ACK_PREFIX: &str = "ACK:";
const REQUIRED_SECTIONS: [&str; 3] = ["drive", "brake", "dyno"];

/// Classifies one received line.
///
/// Timing replies (`PONG:`/`ACK:`) are recognised before anything else, so a
/// line is never both a timing reply and a telemetry frame. Malformed timing
/// replies and JSON frames missing a section come back as
/// [`DeviceEvent::DecodeError`]; JSON that doesn't even parse is plain text.
pub fn parse_line(line: &str) -> DeviceEvent {
    let line = line.trim();

    if let Some(suffix) = line.strip_prefix(PONG_PREFIX) {
        return match suffix.trim().parse::<i64>() {
            Ok(device_time) => DeviceEvent::Pong { device_time },
            Err(err) => decode_error(line, format!("bad PONG timestamp: {err}")),
        };
    }

    if line.starts_with(ACK_PREFIX) {
        return parse_ack(line);
    }

    if line.starts_with('{') && line.ends_with('}') {
        return parse_frame(line);
    }

    DeviceEvent::RawLog(line.to_string())
}

fn parse_ack(line: &str) -> DeviceEvent {
    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() < 5 {
        return decode_error(line, format!("ACK has {} fields, expected 5", parts.len()));
    }

    let times: Result<Vec<i64>, _> = parts[2..5].iter().map(|p| p.trim().parse::<i64>()).collect();
    match times {
        Ok(times) => DeviceEvent::Ack(AckTiming {
            command: parts[1].to_string(),
            receive_time: times[0],
            send_time: times[1],
            ack_time: times[2],
        }),
        Err(err) => decode_error(line, format!("bad ACK time field: {err}")),
    }
}

fn parse_frame(line: &str) -> DeviceEvent {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => return DeviceEvent::RawLog(line.to_string()),
    };

    let Some(object) = value.as_object() else {
        return DeviceEvent::RawLog(line.to_string());
    };

    let missing: Vec<&str> = REQUIRED_SECTIONS
        .iter()
        .copied()
        .filter(|section| !object.contains_key(*section))
        .collect();
    if !missing.is_empty() {
        return decode_error(line, format!("frame missing {}", missing.join(", ")));
    }

    match serde_json::from_value::<TelemetryFrame>(value) {
        Ok(frame) => DeviceEvent::Telemetry(frame),
        Err(err) => decode_error(line, format!("invalid frame: {err}")),
    }
}

fn decode_error(line: &str, reason: String) -> DeviceEvent {
    DeviceEvent::DecodeError {
        line: line.to_string(),
        reason,
    }
}
