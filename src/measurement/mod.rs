//! The measurement layer: voltage ranges, run state shared with the
//! controlling side, the reading queue and the engine that drives a run.

pub mod engine;
pub mod estimate;
pub mod range;
pub mod reading;
pub mod state;

pub use engine::{EngineState, MeasurementEvent, StopReason, SweepEngine};
pub use estimate::Estimate;
pub use range::LinearRange;
pub use reading::{Reading, ReadingQueue};
pub use state::{ChangeVoltageRequest, MeasurementConfig, MeasurementKind, MeasurementState};
