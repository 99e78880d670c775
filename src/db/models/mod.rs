pub mod sample;

pub use sample::{DatabaseStats, MotorChannels, SessionSummary, StoredSample};
