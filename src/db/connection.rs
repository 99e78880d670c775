use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::migrations::run_migrations;
use super::repositories::insert_samples;
use crate::telemetry::RecordedSample;

/// Upper bound on rows committed in one transaction.
const MAX_BATCH: usize = 256;

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// A telemetry row waiting for the next batch commit.
pub(crate) struct PendingSample {
    pub sample: RecordedSample,
    pub created_at: DateTime<Utc>,
    /// `None` for ingestion writes: failures are logged, nobody waits.
    pub reply: Option<oneshot::Sender<Result<()>>>,
}

impl PendingSample {
    fn finish(self, result: Result<()>) {
        match self.reply {
            Some(reply) => {
                if reply.send(result).is_err() {
                    error!("Session store caller dropped before receiving result");
                }
            }
            None => {
                if let Err(err) = result {
                    error!(
                        "Dropping telemetry sample (session {}, t={:.3}): {err:#}",
                        self.sample.session_start, self.sample.relative_time
                    );
                }
            }
        }
    }
}

enum DbCommand {
    Append(PendingSample),
    Execute(DbTask),
    Shutdown,
}

struct StoreWorker {
    sender: mpsc::Sender<DbCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreWorker {
    fn drop(&mut self) {
        let handle = match self.thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(handle) = handle else {
            return;
        };

        // Pending rows are flushed before the thread exits.
        if self.sender.send(DbCommand::Shutdown).is_err() {
            error!("Session store thread exited before shutdown");
        }
        if let Err(join_err) = handle.join() {
            error!("Failed to join session store thread: {join_err:?}");
        }
    }
}

/// Session store handle. One thread owns the SQLite connection; telemetry
/// appends queued back to back are committed together, and every other
/// request runs in queue order after the rows queued before it.
#[derive(Clone)]
pub struct Database {
    worker: Arc<StoreWorker>,
    db_path: Arc<PathBuf>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (sender, commands) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let path = db_path.clone();

        let thread = thread::Builder::new()
            .name("dyno-db".into())
            .spawn(move || {
                let conn = match open_store(&path) {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                serve(conn, commands);
                info!("Session store thread shutting down");
            })
            .context("failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        info!("Session store initialized at {}", db_path.display());

        Ok(Self {
            worker: Arc::new(StoreWorker {
                sender,
                thread: Mutex::new(Some(thread)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    /// Queues one telemetry row for the next batch commit.
    pub(crate) fn append(&self, pending: PendingSample) -> Result<()> {
        self.worker
            .sender
            .send(DbCommand::Append(pending))
            .map_err(|_| anyhow!("session store thread is gone"))
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            if reply_tx.send(task(conn)).is_err() {
                error!("Session store caller dropped before receiving result");
            }
        }));

        self.worker
            .sender
            .send(command)
            .map_err(|_| anyhow!("session store thread is gone"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }
}

fn open_store(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path).context("failed to open SQLite database")?;
    // WAL with NORMAL sync keeps the ~10 Hz append path off fsync.
    let journal: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .context("failed to enable WAL mode")?;
    if !journal.eq_ignore_ascii_case("wal") {
        warn!("Session store running in {journal} journal mode");
    }
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous mode")?;
    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

fn serve(mut conn: Connection, commands: mpsc::Receiver<DbCommand>) {
    let mut batch = Vec::new();
    while let Ok(first) = commands.recv() {
        let mut next = Some(first);
        while let Some(command) = next.take() {
            match command {
                DbCommand::Append(pending) => batch.push(pending),
                DbCommand::Execute(task) => {
                    flush(&mut conn, &mut batch);
                    task(&mut conn);
                }
                DbCommand::Shutdown => {
                    flush(&mut conn, &mut batch);
                    return;
                }
            }
            if batch.len() < MAX_BATCH {
                next = commands.try_recv().ok();
            }
        }
        flush(&mut conn, &mut batch);
    }
    flush(&mut conn, &mut batch);
}

/// Commits queued rows in one transaction. A row that fails is reported on
/// its own; a failed commit fails every row of the batch.
fn flush(conn: &mut Connection, batch: &mut Vec<PendingSample>) {
    if batch.is_empty() {
        return;
    }
    let rows = std::mem::take(batch);

    let committed = conn
        .transaction()
        .context("failed to open telemetry transaction")
        .and_then(|tx| {
            let results = insert_samples(&tx, &rows)?;
            tx.commit().context("failed to commit telemetry batch")?;
            Ok(results)
        });

    match committed {
        Ok(results) => {
            debug!("Committed {} telemetry rows", rows.len());
            for (pending, result) in rows.into_iter().zip(results) {
                pending.finish(result);
            }
        }
        Err(err) => {
            let reason = format!("{err:#}");
            let count = rows.len();
            for pending in rows {
                pending.finish(Err(anyhow!("batch of {count} rows rolled back: {reason}")));
            }
        }
    }
}
