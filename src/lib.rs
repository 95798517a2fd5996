#![deny(dead_code)]

// The regression engine lives in its own subsystem directory.
#[path = "../surface/mod.rs"]
pub mod surface;

pub use surface::executor::{PredictionRun, RunError, run_prediction};
pub use surface::model::{ModelKind, RunConfig};
