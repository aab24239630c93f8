//! Motion-controller domain: wire protocol, port discovery and the driver.
//!
//! The controller speaks a Marlin-flavoured G-code dialect over a serial
//! link. Everything in this module is millimetres; user-facing feed rates
//! are mm/s and get converted to the controller's mm/min on the wire.

pub mod driver;
pub mod probe;
pub mod protocol;

pub use driver::{StageDriver, StageOperation};

use serde::{Deserialize, Serialize};

/// An absolute stage position in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "X{:.4} Y{:.4} Z{:.4}", self.x, self.y, self.z)
    }
}

/// High-level motion intent executed by [`StageOperation::execute`].
///
/// Feed rates are mm/s here; the wire carries mm/min.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionCommand {
    /// Bounded relative move; zero axes are omitted from the wire command.
    Jog {
        dx: f64,
        dy: f64,
        dz: f64,
        feed_mm_s: f64,
    },
    /// Home all axes, Z first so the objective cannot crash into the sample.
    Home,
    /// Block until all queued motion has physically completed (M400).
    Wait,
}

/// Identity reported by the controller in response to `M115`.
///
/// A connection is *verified* only when `firmware_name` matches the
/// expected family and, if configured, the machine name/UUID match too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardIdentity {
    pub firmware_name: String,
    pub machine_name: Option<String>,
    pub machine_uuid: Option<String>,
}

impl BoardIdentity {
    /// Case-insensitive firmware family check (e.g. "Marlin").
    pub fn is_family(&self, family: &str) -> bool {
        self.firmware_name
            .to_ascii_lowercase()
            .contains(&family.to_ascii_lowercase())
    }
}

/// Soft endstop bounds reported by `M211`, when the firmware exposes them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageBounds {
    pub min: [Option<f64>; 3],
    pub max: [Option<f64>; 3],
}

/// Driver connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Probing,
    Connected,
    /// A long-running operation (jog, autofocus, scan) owns the stage.
    Busy,
    /// A timeout poisoned the connection; re-probe to recover.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Probing => "probing",
            ConnectionState::Connected => "connected",
            ConnectionState::Busy => "busy",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}
