//! Automated sweeps: a 1D speed sweep and a 2D speed x load grid.

mod controller;
mod state;
mod sweep;
mod validation;

pub use controller::{SequenceError, SequencerEvent, TestSequencer};
pub use state::{SequenceKind, SequencerSnapshot, SequencerStatus};
pub use sweep::{
    grid_plan, linspace, speed_setpoints, stabilization_time, GridStep, SampleAccumulator,
    SweepDataPoint, SAMPLES_PER_POINT, SAMPLE_INTERVAL,
};
pub use validation::{GridSweepParams, SpeedSweepParams, ValidationErrors};
