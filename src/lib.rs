//! Control core for a motorized microscope stage.
//!
//! The stage is a Marlin-flavoured G-code controller on a serial link;
//! this crate layers, bottom to top:
//!
//! - [`transport`]: line-oriented byte stream seam (serial behind the
//!   `serial` feature, simulator in [`mock`])
//! - [`stage`]: wire protocol, port discovery and the driver state
//!   machine with its one-operation-at-a-time ownership model
//! - [`camera`]: frame-source seam the focus and scan layers consume
//! - [`focus`]: sharpness metrics, tilt-compensation surfaces and the
//!   coarse-to-fine autofocus sweep
//! - [`scan`]: serpentine grid traversal with optional per-tile autofocus
//!   and time-lapse repetition
//!
//! Everything observable flows through the [`events::EventBus`];
//! consumers subscribe instead of polling.

pub mod camera;
pub mod config;
pub mod error;
pub mod events;
pub mod focus;
pub mod mock;
pub mod scan;
pub mod stage;
pub mod transport;

pub use config::Settings;
pub use error::{StageError, StageResult};
pub use events::{CancelToken, Event, EventBus};
pub use focus::{AutofocusEngine, AutofocusResult, FocusMetric, PlaneStore, SurfaceKind};
pub use scan::{GridSpec, ScanControl, ScanJob, ScanOrchestrator, ScanOutcome};
pub use stage::{BoardIdentity, ConnectionState, Position, StageDriver, StageOperation};
