use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use anyhow::{Context, Result};
use log::{error, info};
use tokio::sync::mpsc;

use crate::protocol::{parse_line, DeviceEvent};

use super::LineSource;

const ENABLE_LOGS: bool = true;

use crate::log_debug;

/// Owns the read half of the transport on a dedicated thread.
///
/// Each complete line is parsed and pushed into the event channel; the
/// thread exits when asked to, when the receiver goes away, or after the
/// first read error (reported as [`DeviceEvent::LinkFailure`]).
pub struct LinkReader {
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LinkReader {
    pub fn spawn(
        mut source: Box<dyn LineSource>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeviceEvent>)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&shutdown);

        let worker = thread::Builder::new()
            .name("dyno-link-reader".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    match source.read_line() {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            log_debug!("<- {line}");
                            if event_tx.send(parse_line(line)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => continue,
                        Err(err) => {
                            error!("Serial read failed: {err}");
                            let _ = event_tx.send(DeviceEvent::LinkFailure(err.to_string()));
                            break;
                        }
                    }
                }

                info!("Link reader thread shutting down");
            })
            .context("failed to spawn link reader thread")?;

        Ok((
            Self {
                shutdown,
                worker: Mutex::new(Some(worker)),
            },
            event_rx,
        ))
    }

    pub fn is_running(&self) -> bool {
        let guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Signals the thread and waits for it; returns within one read timeout.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = guard.take() {
            if let Err(join_err) = handle.join() {
                error!("Failed to join link reader thread: {join_err:?}");
            }
        }
    }
}

impl Drop for LinkReader {
    fn drop(&mut self) {
        self.stop();
    }
}
