use serde::Serialize;

use crate::protocol::{TelemetryFrame, TelemetrySample};

use super::history::{History, PlotData};

/// A frame this close (in seconds) to the session start that also moves the
/// device clock backwards means the controller rebooted.
pub const RESTART_WINDOW_SECS: f64 = 5.0;
/// Restart detection only arms once the history holds more samples than this.
pub const RESTART_MIN_HISTORY: usize = 10;

/// One timestamped frame as it was appended to history, ready to persist.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RecordedSample {
    pub session_start: f64,
    pub relative_time: f64,
    /// Device clock in seconds.
    pub timestamp: f64,
    pub values: TelemetrySample,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameUpdate {
    /// `session_start` of the session a detected restart just closed.
    pub closed_session: Option<f64>,
    pub recorded: Option<RecordedSample>,
}

/// Current values, rolling history, and the session/restart state machine.
///
/// `NoSession --first timestamped frame--> Active --restart--> NoSession`,
/// where the restarting frame immediately re-opens a fresh session.
#[derive(Debug, Clone)]
pub struct TelemetryModel {
    current: TelemetrySample,
    history: History,
    session_start: Option<f64>,
    last_timestamp: Option<f64>,
}

impl TelemetryModel {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            current: TelemetrySample::default(),
            history: History::with_capacity(history_capacity),
            session_start: None,
            last_timestamp: None,
        }
    }

    pub fn update_from_frame(&mut self, frame: &TelemetryFrame) -> FrameUpdate {
        self.current.apply(frame);

        let Some(timestamp_ms) = frame.timestamp_ms else {
            return FrameUpdate::default();
        };
        let timestamp = timestamp_ms as f64 / 1000.0;

        let mut closed_session = None;
        if let Some(session_start) = self.session_start {
            let regressed = self.last_timestamp.is_some_and(|last| timestamp < last);
            if regressed
                && timestamp - session_start < RESTART_WINDOW_SECS
                && self.history.len() > RESTART_MIN_HISTORY
            {
                self.history.clear();
                self.session_start = None;
                closed_session = Some(session_start);
            }
        }

        let session_start = *self.session_start.get_or_insert(timestamp);
        self.last_timestamp = Some(timestamp);

        let relative_time = timestamp - session_start;
        self.history.push(relative_time, &self.current);

        FrameUpdate {
            closed_session,
            recorded: Some(RecordedSample {
                session_start,
                relative_time,
                timestamp,
                values: self.current,
            }),
        }
    }

    pub fn current(&self) -> TelemetrySample {
        self.current
    }

    pub fn session_start(&self) -> Option<f64> {
        self.session_start
    }

    pub fn has_data(&self) -> bool {
        !self.history.is_empty()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn get_plot_data(&self) -> PlotData {
        self.history.plot_data()
    }

    /// Drops the history but keeps the current values and the open session.
    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

impl Default for TelemetryModel {
    fn default() -> Self {
        Self::new(super::history::DEFAULT_HISTORY_CAPACITY)
    }
}
