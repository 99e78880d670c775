//! Single consumer of the link reader's event channel.

use log::{error, info};
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::protocol::{AckTiming, DeviceEvent};
use crate::response::PingTracker;
use crate::telemetry::{RecordedSample, TelemetryHandle};

const ENABLE_LOGS: bool = true;
pub const EVENT_CAPACITY: usize = 512;

use crate::{log_debug, log_info, log_warn};

/// What subscribers see after the dispatcher has applied an event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LinkEvent {
    Telemetry(RecordedSample),
    /// The controller restarted; `previous` was the closed session's start.
    SessionRestarted { previous: f64 },
    Pong {
        device_time: i64,
        rtt_us: Option<f64>,
    },
    Ack {
        command: String,
        /// `ack_time - receive_time`, device clock units.
        device_latency: i64,
    },
    Log { line: String },
    DecodeError { line: String, reason: String },
    LinkLost { reason: String },
}

enum StoreOp {
    Insert(RecordedSample),
    ClearSession(f64),
}

/// Routes device events: telemetry into the model and the session store,
/// PONGs into the ping tracker, everything out to subscribers.
///
/// The dispatcher is the only writer of the telemetry model. Store writes go
/// through a persistence task in arrival order, so a slow database never
/// stalls ingestion.
pub struct Dispatcher {
    telemetry: TelemetryHandle,
    pings: PingTracker,
    store: Option<Database>,
    clear_session_on_restart: bool,
    events: broadcast::Sender<LinkEvent>,
}

impl Dispatcher {
    pub fn new(telemetry: TelemetryHandle, pings: PingTracker) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            telemetry,
            pings,
            store: None,
            clear_session_on_restart: false,
            events,
        }
    }

    pub fn with_store(mut self, store: Database, clear_session_on_restart: bool) -> Self {
        self.store = Some(store);
        self.clear_session_on_restart = clear_session_on_restart;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Publishes on an existing channel so subscribers outlive this dispatcher.
    pub fn with_events(mut self, events: broadcast::Sender<LinkEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn spawn(
        self,
        device_events: mpsc::UnboundedReceiver<DeviceEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(device_events, cancel))
    }

    /// Runs until cancelled or the reader side of the channel closes, then
    /// drains pending store writes.
    pub async fn run(
        self,
        mut device_events: mpsc::UnboundedReceiver<DeviceEvent>,
        cancel: CancellationToken,
    ) {
        let (store_tx, writer) = match self.store.clone() {
            Some(db) => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(tokio::spawn(persist(db, rx))))
            }
            None => (None, None),
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log_info!("Dispatcher cancelled");
                    break;
                }
                event = device_events.recv() => {
                    match event {
                        Some(event) => self.handle(event, store_tx.as_ref()),
                        None => {
                            log_info!("Device event channel closed");
                            break;
                        }
                    }
                }
            }
        }

        drop(store_tx);
        if let Some(writer) = writer {
            if let Err(err) = writer.await {
                error!("Telemetry persistence task failed: {err}");
            }
        }
    }

    fn handle(&self, event: DeviceEvent, store: Option<&mpsc::UnboundedSender<StoreOp>>) {
        match event {
            DeviceEvent::Telemetry(frame) => {
                let update = self.telemetry.ingest(&frame);

                if let Some(previous) = update.closed_session {
                    info!("Controller restart detected; session {previous} closed");
                    if self.clear_session_on_restart {
                        queue(store, StoreOp::ClearSession(previous));
                    }
                    self.publish(LinkEvent::SessionRestarted { previous });
                }

                if let Some(recorded) = update.recorded {
                    queue(store, StoreOp::Insert(recorded));
                    self.publish(LinkEvent::Telemetry(recorded));
                }
            }
            DeviceEvent::Pong { device_time } => {
                let rtt_us = self.pings.record_pong(Instant::now());
                match rtt_us {
                    Some(rtt) => log_debug!("PONG {device_time}: {rtt:.1} us"),
                    None => log_warn!("Unsolicited PONG {device_time}"),
                }
                self.publish(LinkEvent::Pong {
                    device_time,
                    rtt_us,
                });
            }
            DeviceEvent::Ack(AckTiming {
                command,
                receive_time,
                ack_time,
                ..
            }) => {
                let device_latency = ack_time - receive_time;
                log_debug!("ACK {command}: {device_latency} device ticks");
                self.publish(LinkEvent::Ack {
                    command,
                    device_latency,
                });
            }
            DeviceEvent::RawLog(line) => {
                log_info!("[dyno] {line}");
                self.publish(LinkEvent::Log { line });
            }
            DeviceEvent::DecodeError { line, reason } => {
                log_warn!("Undecodable line '{line}': {reason}");
                self.publish(LinkEvent::DecodeError { line, reason });
            }
            DeviceEvent::LinkFailure(reason) => {
                error!("Link lost: {reason}");
                self.publish(LinkEvent::LinkLost { reason });
            }
        }
    }

    fn publish(&self, event: LinkEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn queue(store: Option<&mpsc::UnboundedSender<StoreOp>>, op: StoreOp) {
    if let Some(tx) = store {
        if tx.send(op).is_err() {
            error!("Telemetry persistence task is gone; sample dropped");
        }
    }
}

async fn persist(db: Database, mut ops: mpsc::UnboundedReceiver<StoreOp>) {
    while let Some(op) = ops.recv().await {
        match op {
            StoreOp::Insert(sample) => db.store_sample(&sample),
            StoreOp::ClearSession(session_start) => match db.clear_session(session_start).await {
                Ok(removed) => info!("Cleared {removed} rows of session {session_start}"),
                Err(err) => error!("Failed to clear session {session_start}: {err:#}"),
            },
        }
    }
}
