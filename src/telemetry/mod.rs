//! Live telemetry: current values, rolling history, session tracking.

mod history;
mod model;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use history::{History, PlotData, DEFAULT_HISTORY_CAPACITY};
pub use model::{
    FrameUpdate, RecordedSample, TelemetryModel, RESTART_MIN_HISTORY, RESTART_WINDOW_SECS,
};

use crate::protocol::{TelemetryFrame, TelemetrySample};

/// Shared handle to the [`TelemetryModel`].
///
/// The dispatcher is the only caller of [`TelemetryHandle::ingest`]; the
/// sequencer, the tester and any UI read copies through the snapshot methods.
#[derive(Clone)]
pub struct TelemetryHandle {
    inner: Arc<RwLock<TelemetryModel>>,
}

impl TelemetryHandle {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TelemetryModel::new(history_capacity))),
        }
    }

    pub fn ingest(&self, frame: &TelemetryFrame) -> FrameUpdate {
        self.write().update_from_frame(frame)
    }

    pub fn current(&self) -> TelemetrySample {
        self.read().current()
    }

    pub fn plot_data(&self) -> PlotData {
        self.read().get_plot_data()
    }

    pub fn has_data(&self) -> bool {
        self.read().has_data()
    }

    pub fn session_start(&self) -> Option<f64> {
        self.read().session_start()
    }

    pub fn clear_history(&self) {
        self.write().clear_history();
    }

    fn read(&self) -> RwLockReadGuard<'_, TelemetryModel> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, TelemetryModel> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for TelemetryHandle {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
