use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, error};
use rusqlite::{params, Row, Transaction};
use tokio::sync::oneshot;

use crate::db::{
    connection::{Database, PendingSample},
    helpers::{format_datetime, parse_datetime, to_u64},
    models::{DatabaseStats, MotorChannels, SessionSummary, StoredSample},
};
use crate::telemetry::RecordedSample;

const SAMPLE_COLUMNS: &str = "id, session_start, relative_time, timestamp,
    drive_rpm, drive_current, drive_voltage, drive_temp_fet, drive_temp_motor,
    brake_rpm, brake_current, brake_voltage, brake_temp_fet, brake_temp_motor,
    mechanical_power, created_at";

fn row_to_sample(row: &Row) -> Result<StoredSample> {
    let created_at: String = row.get("created_at")?;

    Ok(StoredSample {
        id: row.get("id")?,
        session_start: row.get("session_start")?,
        relative_time: row.get("relative_time")?,
        timestamp: row.get("timestamp")?,
        drive: MotorChannels {
            rpm: row.get("drive_rpm")?,
            current: row.get("drive_current")?,
            voltage: row.get("drive_voltage")?,
            temp_fet: row.get("drive_temp_fet")?,
            temp_motor: row.get("drive_temp_motor")?,
        },
        brake: MotorChannels {
            rpm: row.get("brake_rpm")?,
            current: row.get("brake_current")?,
            voltage: row.get("brake_voltage")?,
            temp_fet: row.get("brake_temp_fet")?,
            temp_motor: row.get("brake_temp_motor")?,
        },
        mechanical_power: row.get("mechanical_power")?,
        created_at: parse_datetime(&created_at, "created_at")?,
    })
}

const INSERT_SAMPLE: &str = "INSERT INTO telemetry_samples (
    session_start, relative_time, timestamp,
    drive_rpm, drive_current, drive_voltage, drive_temp_fet, drive_temp_motor,
    brake_rpm, brake_current, brake_voltage, brake_temp_fet, brake_temp_motor,
    mechanical_power, created_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)";

/// Writes a batch inside `tx`, one result per row.
pub(crate) fn insert_samples(
    tx: &Transaction<'_>,
    rows: &[PendingSample],
) -> Result<Vec<Result<()>>> {
    let mut stmt = tx
        .prepare_cached(INSERT_SAMPLE)
        .context("failed to prepare telemetry insert")?;

    Ok(rows
        .iter()
        .map(|pending| {
            let record = &pending.sample;
            let drive = MotorChannels::from(&record.values.drive);
            let brake = MotorChannels::from(&record.values.brake);
            stmt.execute(params![
                record.session_start,
                record.relative_time,
                record.timestamp,
                drive.rpm,
                drive.current,
                drive.voltage,
                drive.temp_fet,
                drive.temp_motor,
                brake.rpm,
                brake.current,
                brake.voltage,
                brake.temp_fet,
                brake.temp_motor,
                record.values.dyno.mechanical_power,
                format_datetime(pending.created_at),
            ])
            .map(|_| ())
            .context("failed to insert telemetry sample")
        })
        .collect())
}

impl Database {
    pub async fn insert_sample(&self, sample: &RecordedSample) -> Result<()> {
        self.insert_sample_at(sample, Utc::now()).await
    }

    /// Inserts with an explicit wall-clock insertion time and waits for the
    /// batch holding it to commit.
    pub async fn insert_sample_at(
        &self,
        sample: &RecordedSample,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let (reply, committed) = oneshot::channel();
        self.append(PendingSample {
            sample: *sample,
            created_at,
            reply: Some(reply),
        })?;
        committed
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }

    /// Ingestion-path insert: queued without waiting; a failed write is
    /// logged and the sample dropped.
    pub fn store_sample(&self, sample: &RecordedSample) {
        let pending = PendingSample {
            sample: *sample,
            created_at: Utc::now(),
            reply: None,
        };
        if let Err(err) = self.append(pending) {
            error!(
                "Dropping telemetry sample (session {}, t={:.3}): {err:#}",
                sample.session_start, sample.relative_time
            );
        }
    }

    /// All rows of a session in `relative_time` order. With `range_secs`, only
    /// rows newer than the session's latest `relative_time` minus the range.
    pub async fn get_session_samples(
        &self,
        session_start: f64,
        range_secs: Option<f64>,
    ) -> Result<Vec<StoredSample>> {
        self.execute(move |conn| {
            let mut samples = Vec::new();
            match range_secs {
                Some(range) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {SAMPLE_COLUMNS}
                         FROM telemetry_samples
                         WHERE session_start = ?1
                           AND relative_time > (
                               SELECT MAX(relative_time) FROM telemetry_samples
                               WHERE session_start = ?1
                           ) - ?2
                         ORDER BY relative_time ASC, id ASC"
                    ))?;
                    let mut rows = stmt.query(params![session_start, range])?;
                    while let Some(row) = rows.next()? {
                        samples.push(row_to_sample(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {SAMPLE_COLUMNS}
                         FROM telemetry_samples
                         WHERE session_start = ?1
                         ORDER BY relative_time ASC, id ASC"
                    ))?;
                    let mut rows = stmt.query(params![session_start])?;
                    while let Some(row) = rows.next()? {
                        samples.push(row_to_sample(row)?);
                    }
                }
            }
            Ok(samples)
        })
        .await
    }

    /// Deletes rows inserted more than `days` ago, across all sessions.
    pub async fn purge_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = format_datetime(Utc::now() - Duration::days(i64::from(days)));
        let deleted = self
            .execute(move |conn| {
                conn.execute(
                    "DELETE FROM telemetry_samples WHERE created_at < ?1",
                    params![cutoff],
                )
                .context("failed to purge telemetry samples")
            })
            .await?;
        debug!("Purged {deleted} telemetry samples older than {days} days");
        Ok(deleted)
    }

    pub async fn clear_session(&self, session_start: f64) -> Result<usize> {
        self.execute(move |conn| {
            conn.execute(
                "DELETE FROM telemetry_samples WHERE session_start = ?1",
                params![session_start],
            )
            .context("failed to clear session")
        })
        .await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_start, COUNT(*), MAX(relative_time), MAX(created_at)
                 FROM telemetry_samples
                 GROUP BY session_start
                 ORDER BY MAX(created_at) DESC",
            )?;

            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                let last_created_at: String = row.get(3)?;
                sessions.push(SessionSummary {
                    session_start: row.get(0)?,
                    sample_count: to_u64(row.get(1)?, "sample_count")?,
                    last_relative_time: row.get(2)?,
                    last_created_at: parse_datetime(&last_created_at, "created_at")?,
                });
            }
            Ok(sessions)
        })
        .await
    }

    pub async fn database_stats(&self) -> Result<DatabaseStats> {
        let path = self.path().to_path_buf();
        let (total, sessions) = self
            .execute(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*), COUNT(DISTINCT session_start) FROM telemetry_samples",
                    [],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )?)
            })
            .await?;

        // Uncheckpointed pages live in the `-wal` file.
        let mut wal_path = path.clone().into_os_string();
        wal_path.push("-wal");
        let file_size_bytes = [path.as_os_str(), wal_path.as_os_str()]
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();

        Ok(DatabaseStats {
            total_samples: to_u64(total, "total_samples")?,
            session_count: to_u64(sessions, "session_count")?,
            file_size_bytes,
        })
    }
}
