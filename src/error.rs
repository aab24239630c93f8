//! Error types for the stage control core.
//!
//! `StageError` is the single taxonomy used across the crate. The variants
//! deliberately distinguish *silence* (`Timeout`) from *garbage*
//! (`Protocol`) from an *acknowledged* controller failure (`Motion`),
//! because the recovery story differs for each: a timeout poisons the
//! connection, a protocol error means the firmware and driver disagree,
//! and a motion error leaves the link healthy.
//!
//! Capture failures originate outside this crate (the camera backend is a
//! capability, not an implementation here) and are carried as text.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type StageResult<T> = std::result::Result<T, StageError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    /// I/O-level failure on the serial link; not recoverable without reopening.
    #[error("transport error: {0}")]
    Transport(String),

    /// The controller answered, but with something the driver cannot parse.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No acknowledgement within the command budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Probing finished without a verified board.
    #[error("no compatible stage controller found")]
    NoDeviceFound,

    /// More than one name-matching board and no UUID to decide.
    #[error("ambiguous device match on ports: {}", .0.join(", "))]
    AmbiguousDevice(Vec<String>),

    /// The stage is owned by another running operation.
    #[error("stage is busy: {0} in progress")]
    Busy(String),

    /// The controller acknowledged the command with an error line.
    #[error("motion error: {0}")]
    Motion(String),

    /// The capture capability failed or yielded no frame.
    #[error("capture error: {0}")]
    Capture(String),

    /// All focus scores equal or zero; likely nothing in view.
    #[error("degenerate focus scores: no usable contrast in sweep")]
    DegenerateScores,

    /// Cooperative cancellation honored at a safe boundary.
    #[error("operation cancelled")]
    Cancelled,

    /// No connection is established (or it was lost and needs re-probing).
    #[error("stage is not connected")]
    NotConnected,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("configuration error: {0}")]
    Config(String),
}
