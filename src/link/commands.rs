use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::protocol::DynoCommand;

use super::LineSink;

const AUDIT_CAPACITY: usize = 256;

/// Audit record published for every command write attempt.
#[derive(Debug, Clone, Serialize)]
pub struct SentCommand {
    pub line: String,
    pub delivered: bool,
    pub sent_at: DateTime<Utc>,
}

/// Fire-and-forget command sender.
///
/// Cheap to clone; all clones share one sink, and the sink mutex is held for
/// exactly one line so concurrent senders never interleave mid-line. Every
/// method returns whether the write reached the transport; nothing waits for
/// the device to acknowledge.
#[derive(Clone)]
pub struct CommandInterface {
    sink: Arc<Mutex<Option<Box<dyn LineSink>>>>,
    audit: broadcast::Sender<SentCommand>,
}

impl CommandInterface {
    pub fn new(sink: Box<dyn LineSink>) -> Self {
        let (audit, _) = broadcast::channel(AUDIT_CAPACITY);
        Self {
            sink: Arc::new(Mutex::new(Some(sink))),
            audit,
        }
    }

    /// A sender with no transport behind it; every send reports failure.
    pub fn detached() -> Self {
        let (audit, _) = broadcast::channel(AUDIT_CAPACITY);
        Self {
            sink: Arc::new(Mutex::new(None)),
            audit,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SentCommand> {
        self.audit.subscribe()
    }

    pub fn is_attached(&self) -> bool {
        self.lock_sink().is_some()
    }

    /// Installs `sink` as the transport for this sender and all its clones.
    pub fn attach(&self, sink: Box<dyn LineSink>) {
        *self.lock_sink() = Some(sink);
    }

    /// Drops the transport; later sends return `false`.
    pub fn detach(&self) {
        self.lock_sink().take();
    }

    pub fn set_drive_speed(&self, rpm: i32) -> bool {
        self.send(&DynoCommand::Speed(rpm))
    }

    pub fn set_brake_load(&self, current: f64) -> bool {
        self.send(&DynoCommand::Load(current))
    }

    pub fn enable_drive(&self) -> bool {
        self.send(&DynoCommand::EnableDrive)
    }

    pub fn enable_brake(&self) -> bool {
        self.send(&DynoCommand::EnableBrake)
    }

    pub fn disable_all(&self) -> bool {
        self.send(&DynoCommand::DisableAll)
    }

    pub fn emergency_stop(&self) -> bool {
        self.send(&DynoCommand::EmergencyStop)
    }

    pub fn enable_timing_mode(&self) -> bool {
        self.send(&DynoCommand::TimingOn)
    }

    pub fn disable_timing_mode(&self) -> bool {
        self.send(&DynoCommand::TimingOff)
    }

    pub fn send_ping(&self) -> bool {
        self.send(&DynoCommand::Ping)
    }

    pub fn send_raw(&self, command: &str) -> bool {
        self.send(&DynoCommand::Raw(command.to_string()))
    }

    pub fn send(&self, command: &DynoCommand) -> bool {
        let line = command.to_string();
        let delivered = {
            let mut guard = self.lock_sink();
            match guard.as_mut() {
                Some(sink) => match sink.write_line(&line) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("Failed to send '{line}': {err}");
                        false
                    }
                },
                None => {
                    debug!("Dropping '{line}': link not connected");
                    false
                }
            }
        };

        if delivered {
            debug!("-> {line}");
        }

        // No subscribers is fine.
        let _ = self.audit.send(SentCommand {
            line,
            delivered,
            sent_at: Utc::now(),
        });

        delivered
    }

    fn lock_sink(&self) -> MutexGuard<'_, Option<Box<dyn LineSink>>> {
        match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
