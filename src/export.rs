//! CSV writers for sweep results, telemetry history and test reports.

use std::{fs::File, io, path::Path};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use log::warn;

use crate::protocol::{MotorState, TelemetrySample};
use crate::response::ResponseOutcome;
use crate::sequencer::SweepDataPoint;
use crate::telemetry::PlotData;

const SWEEP_HEADER: [&str; 22] = [
    "run_id",
    "step",
    "target_rpm",
    "target_amperage",
    "actual_rpm",
    "actual_amperage",
    "drive_current",
    "mechanical_power",
    "drive_temp_fet",
    "drive_temp_motor",
    "brake_temp_fet",
    "brake_temp_motor",
    "drive_voltage",
    "brake_voltage",
    "max_temp_fet",
    "max_temp_motor",
    "sample_count",
    "actual_rpm_std",
    "actual_amperage_std",
    "mechanical_power_std",
    "max_temp_fet_std",
    "timestamp",
];

const HISTORY_HEADER: [&str; 12] = [
    "timestamp",
    "drive_rpm",
    "drive_current",
    "drive_voltage",
    "drive_temp_fet",
    "drive_temp_motor",
    "brake_rpm",
    "brake_current",
    "brake_voltage",
    "brake_temp_fet",
    "brake_temp_motor",
    "mechanical_power",
];

/// `<prefix>_YYYYmmdd_HHMMSS.csv` in local time.
pub fn default_filename(prefix: &str) -> String {
    format!("{prefix}_{}.csv", Local::now().format("%Y%m%d_%H%M%S"))
}

/// Creates `path` and hands a CSV writer over it to `write`.
pub fn export_to_file<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut csv::Writer<File>) -> Result<()>,
{
    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write(&mut writer)?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", path.display()))?;
    Ok(())
}

/// One row per averaged operating point. `exported_at` is stamped on every row.
pub fn write_sweep_csv<W: io::Write>(
    writer: &mut csv::Writer<W>,
    points: &[SweepDataPoint],
    exported_at: DateTime<Utc>,
) -> Result<()> {
    writer.write_record(SWEEP_HEADER)?;
    let stamp = exported_at.to_rfc3339();
    for p in points {
        writer.write_record([
            p.run_id.to_string(),
            p.step_number.to_string(),
            p.target_rpm.to_string(),
            p.target_amperage.to_string(),
            p.actual_rpm.to_string(),
            p.actual_amperage.to_string(),
            p.drive_current.to_string(),
            p.mechanical_power.to_string(),
            p.drive_temp_fet.to_string(),
            p.drive_temp_motor.to_string(),
            p.brake_temp_fet.to_string(),
            p.brake_temp_motor.to_string(),
            p.drive_voltage.to_string(),
            p.brake_voltage.to_string(),
            p.max_temp_fet.to_string(),
            p.max_temp_motor.to_string(),
            p.sample_count.to_string(),
            p.actual_rpm_std.to_string(),
            p.actual_amperage_std.to_string(),
            p.mechanical_power_std.to_string(),
            p.max_temp_fet_std.to_string(),
            stamp.clone(),
        ])?;
    }
    Ok(())
}

/// One row per history index. Uneven columns are cut to the shortest.
pub fn write_history_csv<W: io::Write>(
    writer: &mut csv::Writer<W>,
    plot: &PlotData,
) -> Result<()> {
    let mut columns = [
        plot.timestamps.iter(),
        plot.drive_rpm.iter(),
        plot.drive_current.iter(),
        plot.drive_voltage.iter(),
        plot.drive_temp_fet.iter(),
        plot.drive_temp_motor.iter(),
        plot.brake_rpm.iter(),
        plot.brake_current.iter(),
        plot.brake_voltage.iter(),
        plot.brake_temp_fet.iter(),
        plot.brake_temp_motor.iter(),
        plot.mechanical_power.iter(),
    ];
    let rows = columns.iter().map(|c| c.len()).min().unwrap_or(0);
    if rows != plot.len() {
        warn!(
            "History columns are uneven; exporting {rows} of {} rows",
            plot.len()
        );
    }

    writer.write_record(HISTORY_HEADER)?;
    let mut record = Vec::with_capacity(columns.len());
    for _ in 0..rows {
        record.clear();
        record.extend(columns.iter_mut().filter_map(|c| c.next()).map(f64::to_string));
        writer.write_record(&record)?;
    }
    Ok(())
}

/// `Section,Parameter,Value` snapshot of the current-value table.
pub fn write_current_values_csv<W: io::Write>(
    writer: &mut csv::Writer<W>,
    sample: &TelemetrySample,
) -> Result<()> {
    writer.write_record(["Section", "Parameter", "Value"])?;
    write_motor_rows(writer, "Drive Motor", &sample.drive)?;
    write_motor_rows(writer, "Brake Motor", &sample.brake)?;

    let dyno = &sample.dyno;
    for (name, value) in [
        ("Target Rpm", dyno.target_rpm.to_string()),
        ("Target Load", dyno.target_load.to_string()),
        ("Drive Enabled", dyno.drive_enabled.to_string()),
        ("Brake Enabled", dyno.brake_enabled.to_string()),
        ("Emergency Stop", dyno.emergency_stop.to_string()),
        ("Mechanical Power", dyno.mechanical_power.to_string()),
    ] {
        writer.write_record(["Dyno", name, value.as_str()])?;
    }
    Ok(())
}

fn write_motor_rows<W: io::Write>(
    writer: &mut csv::Writer<W>,
    section: &str,
    motor: &MotorState,
) -> Result<()> {
    for (name, value) in [
        ("Rpm", motor.rpm),
        ("Current", motor.current),
        ("Voltage", motor.voltage),
        ("Temp Fet", motor.temp_fet),
        ("Temp Motor", motor.temp_motor),
        ("Duty Cycle", motor.duty_cycle),
        ("Data Age", motor.data_age_ms),
    ] {
        writer.write_record([section, name, value.to_string().as_str()])?;
    }
    Ok(())
}

/// `Timestamp,Test Type,Parameter,Value,Units` rows for one response test.
/// Failed tests produce a single `status` row.
pub fn write_response_csv<W: io::Write>(
    writer: &mut csv::Writer<W>,
    outcome: &ResponseOutcome,
    at: DateTime<Utc>,
) -> Result<()> {
    writer.write_record(["Timestamp", "Test Type", "Parameter", "Value", "Units"])?;
    let stamp = at.to_rfc3339();
    let mut row = |test: &str, parameter: String, value: String, units: &str| {
        writer.write_record([stamp.as_str(), test, parameter.as_str(), value.as_str(), units])
    };

    match outcome {
        ResponseOutcome::Ping(stats) => {
            for (i, rtt) in stats.rtts_us.iter().enumerate() {
                row("ping", format!("RTT_{i}"), rtt.to_string(), "microseconds")?;
            }
            row("ping", "mean".into(), stats.mean_us.to_string(), "microseconds")?;
            row("ping", "median".into(), stats.median_us.to_string(), "microseconds")?;
        }
        ResponseOutcome::Command(resp) => {
            let us = resp.response_time.as_secs_f64() * 1e6;
            row(resp.channel.label(), "response_time".into(), us.to_string(), "microseconds")?;
        }
        ResponseOutcome::Step(step) => {
            let optional = |v: Option<f64>| v.map(|s| s.to_string()).unwrap_or_default();
            row("step", "rise_time".into(), optional(step.rise_time_s), "seconds")?;
            row("step", "settling_time".into(), optional(step.settling_time_s), "seconds")?;
            row("step", "overshoot".into(), step.overshoot_percent.to_string(), "percent")?;
            row(
                "step",
                "steady_state_error".into(),
                step.steady_state_error.to_string(),
                "",
            )?;
        }
        other => {
            row("response", "status".into(), other.summary(), "")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::PingStats;
    use uuid::Uuid;

    fn output(writer: csv::Writer<Vec<u8>>) -> String {
        String::from_utf8(writer.into_inner().unwrap()).unwrap()
    }

    fn plot() -> PlotData {
        PlotData {
            timestamps: vec![0.0, 0.1],
            drive_rpm: vec![100.0, 200.0],
            drive_current: vec![1.0, 2.0],
            drive_voltage: vec![48.0, 48.0],
            drive_temp_fet: vec![30.0, 31.0],
            drive_temp_motor: vec![28.0, 29.0],
            brake_rpm: vec![99.0, 198.0],
            brake_current: vec![0.5, 0.6],
            brake_voltage: vec![48.0, 48.0],
            brake_temp_fet: vec![27.0, 27.5],
            brake_temp_motor: vec![26.0, 26.5],
            mechanical_power: vec![10.0, 20.0],
        }
    }

    #[test]
    fn history_rows_follow_plot_indices() {
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_history_csv(&mut writer, &plot()).unwrap();

        let text = output(writer);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,drive_rpm,drive_current,drive_voltage,"));
        assert_eq!(lines[2], "0.1,200,2,48,31,29,198,0.6,48,27.5,26.5,20");
    }

    #[test]
    fn uneven_history_columns_are_cut_to_the_shortest() {
        let mut plot = plot();
        plot.timestamps.push(0.2);
        plot.drive_rpm.push(300.0);
        plot.mechanical_power.clear();
        plot.mechanical_power.push(10.0);

        let mut writer = csv::Writer::from_writer(Vec::new());
        write_history_csv(&mut writer, &plot).unwrap();

        let text = output(writer);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "0,100,1,48,30,28,99,0.5,48,27,26,10");
    }

    #[test]
    fn sweep_rows_carry_run_id_and_stats() {
        let point = SweepDataPoint {
            run_id: Uuid::nil(),
            step_number: 3,
            target_rpm: 1000.0,
            target_amperage: 5.0,
            actual_rpm: 998.5,
            actual_amperage: 5.1,
            drive_current: 7.0,
            mechanical_power: 120.0,
            drive_temp_fet: 40.0,
            drive_temp_motor: 38.0,
            brake_temp_fet: 42.0,
            brake_temp_motor: 39.0,
            drive_voltage: 48.0,
            brake_voltage: 47.9,
            max_temp_fet: 42.0,
            max_temp_motor: 39.0,
            sample_count: 10,
            actual_rpm_std: 1.5,
            actual_amperage_std: 0.1,
            mechanical_power_std: 2.0,
            max_temp_fet_std: 0.2,
        };
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_sweep_csv(&mut writer, &[point], Utc::now()).unwrap();

        let text = output(writer);
        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.len(), SWEEP_HEADER.len());
        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(&record[0], Uuid::nil().to_string());
        assert_eq!(&record[1], "3");
        assert_eq!(&record[4], "998.5");
        assert_eq!(&record[16], "10");
    }

    #[test]
    fn failed_response_test_exports_a_status_row() {
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_response_csv(
            &mut writer,
            &ResponseOutcome::NoResponses { sent: 5 },
            Utc::now(),
        )
        .unwrap();
        let text = output(writer);
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("no valid responses received (5 sent)"));

        let stats = PingStats::from_round_trips(3, vec![100.0, 200.0]).unwrap();
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_response_csv(&mut writer, &ResponseOutcome::Ping(stats), Utc::now()).unwrap();
        let text = output(writer);
        assert!(text.contains("RTT_1,200,microseconds"));
        assert!(text.contains("mean,150,microseconds"));
    }

    #[test]
    fn current_values_cover_every_section() {
        let mut sample = TelemetrySample::default();
        sample.dyno.emergency_stop = true;
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_current_values_csv(&mut writer, &sample).unwrap();
        let text = output(writer);
        assert!(text.contains("Drive Motor,Rpm,0"));
        assert!(text.contains("Brake Motor,Data Age,0"));
        assert!(text.contains("Dyno,Emergency Stop,true"));
    }

    #[test]
    fn file_export_writes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(default_filename("dyno_test_results"));
        export_to_file(&path, |w| write_sweep_csv(w, &[], Utc::now())).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("run_id,step,"));
    }
}
