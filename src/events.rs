//! Observer surface: data events over a broadcast channel.
//!
//! Consumers (a GUI, a logger, a test harness) subscribe instead of
//! polling internal state. Emission never blocks and never fails the
//! producer; an event with no subscribers is simply dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::camera::Frame;
use crate::focus::engine::{FocusSample, SweepPhase};
use crate::scan::ScanOutcome;
use crate::stage::{ConnectionState, Position};

/// Everything observable from outside the control core.
#[derive(Debug, Clone)]
pub enum Event {
    ConnectionChanged {
        state: ConnectionState,
    },
    AutofocusStarted {
        area: Option<String>,
        seeded_z: Option<f64>,
    },
    AutofocusSample {
        phase: SweepPhase,
        sample: FocusSample,
    },
    AutofocusFinished {
        result: Result<FocusSample, String>,
        last_position: Option<Position>,
    },
    TileStarted {
        row: u32,
        col: u32,
        cycle: u32,
    },
    /// A tile capture succeeded; the frame is tagged with its grid
    /// coordinates and cycle index. Persistence is the subscriber's job.
    TileCaptured {
        row: u32,
        col: u32,
        cycle: u32,
        frame: Arc<Frame>,
    },
    /// Capture failed for one tile; the pass continues.
    TileFailed {
        row: u32,
        col: u32,
        cycle: u32,
        error: String,
    },
    PassCompleted {
        cycle: u32,
    },
    ScanFinished {
        outcome: ScanOutcome,
    },
}

/// Cloneable handle for emitting and subscribing to [`Event`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Fire-and-forget emission; lagging or absent subscribers never
    /// stall the control loop.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Cooperative cancellation flag, checked at safe boundaries only
/// (between sweep steps, between tiles) — never by aborting an in-flight
/// motion command, since the physical stage state would become unknown.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
