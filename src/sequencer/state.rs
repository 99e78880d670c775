use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SequencerStatus {
    #[default]
    Idle,
    Validating,
    Running,
    /// Stop requested; the safety reset has not gone out yet.
    Stopping,
    Completed,
    Stopped,
    Failed,
}

impl SequencerStatus {
    /// A sequence owns the actuators in these states.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SequencerStatus::Validating | SequencerStatus::Running | SequencerStatus::Stopping
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SequenceKind {
    SpeedSweep,
    GridSweep,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SequencerSnapshot {
    pub status: SequencerStatus,
    pub kind: Option<SequenceKind>,
    pub run_id: Option<Uuid>,
    pub current_step: usize,
    pub total_steps: usize,
    /// Progress line while running; failure reason once failed.
    pub message: Option<String>,
}

impl SequencerSnapshot {
    pub(crate) fn begin(kind: SequenceKind, run_id: Uuid, total_steps: usize) -> Self {
        Self {
            status: SequencerStatus::Validating,
            kind: Some(kind),
            run_id: Some(run_id),
            current_step: 0,
            total_steps,
            message: None,
        }
    }
}
