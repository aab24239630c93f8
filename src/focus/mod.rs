//! Autofocus: sharpness metrics, tilt-compensation surfaces and the
//! coarse-to-fine sweep engine.

pub mod engine;
pub mod metric;
pub mod plane;

pub use engine::{AutofocusEngine, AutofocusFailure, AutofocusResult, FocusSample, SweepPhase};
pub use metric::FocusMetric;
pub use plane::{Area, PlaneModel, PlaneStore, SurfaceKind};
