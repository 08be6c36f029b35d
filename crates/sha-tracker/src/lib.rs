pub mod error;
pub mod tracker;

pub use error::TrackerError;
pub use tracker::{JobHandle, StepHandle, Tracker, DEFAULT_RECOVERY_THRESHOLD_MINUTES};
