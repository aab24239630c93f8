//! Grid scan orchestration: serpentine tile traversal, optional per-tile
//! autofocus and time-lapse repetition.
//!
//! The orchestrator owns the stage for the whole run (one
//! [`StageOperation`] across every pass) so nothing can interleave motion
//! with it. Per-tile capture problems mark the tile failed and the pass
//! continues; motion problems abort the run, since the stage position can
//! no longer be trusted. Pause and cancel are honored at tile boundaries
//! only, and time spent paused shifts the remaining pass schedule rather
//! than compressing the next interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::camera::FrameSource;
use crate::config::ScanSettings;
use crate::error::{StageError, StageResult};
use crate::events::{CancelToken, Event, EventBus};
use crate::focus::engine::AutofocusEngine;
use crate::stage::{Position, StageDriver, StageOperation};

/// Rectangular tile grid, addressed row-major.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct GridSpec {
    pub rows: u32,
    pub cols: u32,
    /// Tile-to-tile spacing along X, mm.
    pub pitch_x_mm: f64,
    /// Tile-to-tile spacing along Y, mm.
    pub pitch_y_mm: f64,
    /// XY of tile (0, 0). `None` anchors the grid wherever the stage
    /// stands when the pass starts; Z is never touched by grid motion.
    #[serde(default)]
    pub origin: Option<Position>,
}

impl GridSpec {
    pub fn validate(&self) -> StageResult<()> {
        if self.rows == 0 || self.cols == 0 {
            return Err(StageError::InvalidParameter(
                "grid must have at least one row and one column".to_string(),
            ));
        }
        if (self.cols > 1 && self.pitch_x_mm <= 0.0) || (self.rows > 1 && self.pitch_y_mm <= 0.0) {
            return Err(StageError::InvalidParameter(
                "tile pitch must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Serpentine traversal: even rows left to right, odd rows right to
    /// left, so the head never retraces a full row width between rows.
    pub fn tiles(&self) -> Vec<Tile> {
        let mut tiles = Vec::with_capacity((self.rows * self.cols) as usize);
        for row in 0..self.rows {
            let cols: Vec<u32> = if row % 2 == 0 {
                (0..self.cols).collect()
            } else {
                (0..self.cols).rev().collect()
            };
            for col in cols {
                tiles.push(Tile {
                    row,
                    col,
                    dx_mm: col as f64 * self.pitch_x_mm,
                    dy_mm: row as f64 * self.pitch_y_mm,
                });
            }
        }
        tiles
    }
}

/// One grid stop, as an XY offset from the pass origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tile {
    pub row: u32,
    pub col: u32,
    pub dx_mm: f64,
    pub dy_mm: f64,
}

/// Time-lapse repetition on an absolute schedule of `interval` from the
/// start of the run.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Repeat {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// `None` repeats until cancelled.
    #[serde(default)]
    pub passes: Option<u32>,
}

/// Per-tile autofocus policy for a scan.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScanAutofocus {
    /// Tilt-surface area the tiles belong to, when known up front.
    pub area: Option<String>,
    /// Fold each tile's winning focus point back into the surface.
    pub update_plane: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanJob {
    pub grid: GridSpec,
    #[serde(default)]
    pub repeat: Option<Repeat>,
    /// `None` scans at whatever Z the stage holds.
    #[serde(default)]
    pub autofocus: Option<ScanAutofocus>,
}

impl ScanJob {
    pub fn validate(&self) -> StageResult<()> {
        self.grid.validate()?;
        if let Some(repeat) = &self.repeat {
            if repeat.passes == Some(0) {
                return Err(StageError::InvalidParameter(
                    "repeat requires at least one pass".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Shared pause/cancel surface for a running scan.
///
/// Both take effect at the next tile boundary; an in-flight move or
/// capture always completes first.
#[derive(Default)]
pub struct ScanControl {
    paused: AtomicBool,
    cancel: CancelToken,
    notify: Notify,
}

impl ScanControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Block while paused; returns how long the pause lasted.
    async fn wait_while_paused(&self) -> Duration {
        if !self.is_paused() || self.is_cancelled() {
            return Duration::ZERO;
        }
        let start = Instant::now();
        loop {
            let notified = self.notify.notified();
            if !self.is_paused() || self.is_cancelled() {
                break;
            }
            notified.await;
        }
        start.elapsed()
    }
}

/// How a scan run ended. `Failed` and `Cancelled` carry enough context
/// to resume: the last tile that fully completed and where the stage was
/// left.
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Completed {
        passes: u32,
    },
    Cancelled {
        last_completed_tile: Option<(u32, u32)>,
        last_position: Option<Position>,
    },
    Failed {
        error: StageError,
        last_completed_tile: Option<(u32, u32)>,
        last_position: Option<Position>,
    },
}

pub struct ScanOrchestrator {
    settings: ScanSettings,
    autofocus: Arc<AutofocusEngine>,
    events: EventBus,
}

struct RunState {
    current: Position,
    last_completed_tile: Option<(u32, u32)>,
    /// Accumulated pause time, applied as a shift to the pass schedule.
    pause_shift: Duration,
}

impl ScanOrchestrator {
    pub fn new(settings: ScanSettings, autofocus: Arc<AutofocusEngine>, events: EventBus) -> Self {
        Self {
            settings,
            autofocus,
            events,
        }
    }

    /// Run a scan job to an outcome. Fails early (with `Busy` or
    /// `InvalidParameter`) before any motion; once motion starts, every
    /// ending is reported as a [`ScanOutcome`].
    pub async fn run(
        &self,
        driver: &StageDriver,
        camera: &dyn FrameSource,
        job: &ScanJob,
        control: Arc<ScanControl>,
    ) -> StageResult<ScanOutcome> {
        job.validate()?;
        let op = driver.try_begin("scan")?;

        let outcome = self.drive(&op, camera, job, &control).await;
        match &outcome {
            ScanOutcome::Completed { passes } => info!("scan completed: {passes} pass(es)"),
            ScanOutcome::Cancelled { .. } => info!("scan cancelled"),
            ScanOutcome::Failed { error, .. } => warn!("scan failed: {error}"),
        }
        self.events.emit(Event::ScanFinished {
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    async fn drive(
        &self,
        op: &StageOperation,
        camera: &dyn FrameSource,
        job: &ScanJob,
        control: &ScanControl,
    ) -> ScanOutcome {
        let epoch = Instant::now();
        let mut state = RunState {
            current: Position::new(0.0, 0.0, 0.0),
            last_completed_tile: None,
            pause_shift: Duration::ZERO,
        };
        let tiles = job.grid.tiles();

        let mut cycle: u32 = 0;
        loop {
            if cycle > 0 {
                // repeat schedule is absolute from the run start, shifted
                // by however long the run has sat paused
                let interval = match job.repeat {
                    Some(r) => r.interval,
                    None => Duration::ZERO,
                };
                let target = epoch + interval * cycle + state.pause_shift;
                if let Some(outcome) = self.wait_until(target, control, &state).await {
                    return outcome;
                }
            }

            // anchor the pass: configured origin, else wherever the stage is
            let here = match op.position().await {
                Ok(p) => p,
                Err(error) => return self.fail(error, &state),
            };
            state.current = here;
            let origin = match job.grid.origin {
                Some(o) => Position::new(o.x, o.y, here.z),
                None => here,
            };

            for tile in &tiles {
                state.pause_shift += control.wait_while_paused().await;
                if control.is_cancelled() {
                    return ScanOutcome::Cancelled {
                        last_completed_tile: state.last_completed_tile,
                        last_position: Some(state.current),
                    };
                }

                if let Some(outcome) = self
                    .run_tile(op, camera, job, control, cycle, *tile, origin, &mut state)
                    .await
                {
                    return outcome;
                }
            }

            self.events.emit(Event::PassCompleted { cycle });
            cycle += 1;

            match job.repeat {
                None => break,
                // passes == None repeats until cancelled
                Some(r) => {
                    if r.passes.is_some_and(|n| cycle >= n) {
                        break;
                    }
                }
            }
        }

        ScanOutcome::Completed { passes: cycle }
    }

    /// One tile: move, settle, optional autofocus, capture. Returns
    /// `Some(outcome)` only on run-ending conditions.
    #[allow(clippy::too_many_arguments)]
    async fn run_tile(
        &self,
        op: &StageOperation,
        camera: &dyn FrameSource,
        job: &ScanJob,
        control: &ScanControl,
        cycle: u32,
        tile: Tile,
        origin: Position,
        state: &mut RunState,
    ) -> Option<ScanOutcome> {
        self.events.emit(Event::TileStarted {
            row: tile.row,
            col: tile.col,
            cycle,
        });

        let dx = origin.x + tile.dx_mm - state.current.x;
        let dy = origin.y + tile.dy_mm - state.current.y;
        if dx != 0.0 || dy != 0.0 {
            if let Err(error) = op.jog(dx, dy, 0.0, self.settings.feed_mm_s).await {
                return Some(self.fail(error, state));
            }
            state.current.x += dx;
            state.current.y += dy;
        }
        if let Err(error) = op.wait_idle().await {
            return Some(self.fail(error, state));
        }
        if !self.settings.settle.is_zero() {
            tokio::time::sleep(self.settings.settle).await;
        }

        let mut tile_error: Option<String> = None;
        if let Some(af) = &job.autofocus {
            match self
                .autofocus
                .run_with(op, camera, af.area.as_deref(), control.token(), af.update_plane)
                .await
            {
                Ok(result) => state.current = result.best.position,
                Err(failure) => {
                    if let Some(p) = failure.last_position {
                        state.current = p;
                    }
                    match failure.error {
                        StageError::Cancelled => {
                            return Some(ScanOutcome::Cancelled {
                                last_completed_tile: state.last_completed_tile,
                                last_position: Some(state.current),
                            });
                        }
                        // a focus miss spoils the tile, not the run
                        StageError::Capture(_) | StageError::DegenerateScores => {
                            tile_error = Some(failure.error.to_string());
                        }
                        error => return Some(self.fail(error, state)),
                    }
                }
            }
        }

        if tile_error.is_none() {
            match camera.capture().await {
                Ok(frame) => {
                    self.events.emit(Event::TileCaptured {
                        row: tile.row,
                        col: tile.col,
                        cycle,
                        frame: Arc::new(frame),
                    });
                }
                Err(e) => tile_error = Some(e.to_string()),
            }
        }

        if let Some(error) = tile_error {
            warn!("tile ({}, {}) failed: {error}", tile.row, tile.col);
            self.events.emit(Event::TileFailed {
                row: tile.row,
                col: tile.col,
                cycle,
                error,
            });
        }

        state.last_completed_tile = Some((tile.row, tile.col));
        None
    }

    /// Sleep toward the next pass, staying responsive to cancel.
    async fn wait_until(
        &self,
        target: Instant,
        control: &ScanControl,
        state: &RunState,
    ) -> Option<ScanOutcome> {
        loop {
            if control.is_cancelled() {
                return Some(ScanOutcome::Cancelled {
                    last_completed_tile: state.last_completed_tile,
                    last_position: Some(state.current),
                });
            }
            if Instant::now() >= target {
                return None;
            }
            let notified = control.notify.notified();
            tokio::select! {
                _ = tokio::time::sleep_until(target) => {}
                _ = notified => {}
            }
        }
    }

    fn fail(&self, error: StageError, state: &RunState) -> ScanOutcome {
        ScanOutcome::Failed {
            error,
            last_completed_tile: state.last_completed_tile,
            last_position: Some(state.current),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutofocusSettings, TimeoutSettings};
    use crate::focus::plane::{PlaneStore, SurfaceKind};
    use crate::mock::{MockCamera, SimStage};
    use crate::stage::ConnectionState;

    fn grid(rows: u32, cols: u32) -> GridSpec {
        GridSpec {
            rows,
            cols,
            pitch_x_mm: 1.0,
            pitch_y_mm: 1.0,
            origin: None,
        }
    }

    fn job(rows: u32, cols: u32) -> ScanJob {
        ScanJob {
            grid: grid(rows, cols),
            repeat: None,
            autofocus: None,
        }
    }

    fn orchestrator(events: EventBus) -> ScanOrchestrator {
        let engine = AutofocusEngine::new(
            AutofocusSettings {
                z_range_mm: 0.02,
                settle: Duration::ZERO,
                ..AutofocusSettings::default()
            },
            Arc::new(PlaneStore::new(SurfaceKind::Linear)),
            events.clone(),
        );
        ScanOrchestrator::new(
            ScanSettings {
                feed_mm_s: 10.0,
                settle: Duration::ZERO,
            },
            Arc::new(engine),
            events,
        )
    }

    async fn connect(sim: SimStage) -> StageDriver {
        let identity = sim.identity();
        let timeouts = TimeoutSettings {
            command: Duration::from_millis(200),
            home: Duration::from_millis(500),
            wait_idle: Duration::from_millis(500),
        };
        StageDriver::connect(Box::new(sim), identity, timeouts, EventBus::default())
            .await
            .unwrap()
    }

    fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[test]
    fn serpentine_traversal_order() {
        let order: Vec<(u32, u32)> = grid(2, 3).tiles().iter().map(|t| (t.row, t.col)).collect();
        assert_eq!(
            order,
            vec![(0, 0), (0, 1), (0, 2), (1, 2), (1, 1), (1, 0)]
        );
    }

    #[test]
    fn grid_validation_rejects_degenerate_specs() {
        assert!(grid(0, 3).validate().is_err());
        let mut g = grid(2, 2);
        g.pitch_y_mm = 0.0;
        assert!(g.validate().is_err());
        // single row never moves along Y, so Y pitch may be zero
        let mut g = grid(1, 2);
        g.pitch_y_mm = 0.0;
        assert!(g.validate().is_ok());
    }

    #[tokio::test]
    async fn single_pass_captures_every_tile() {
        let sim = SimStage::new();
        let driver = connect(sim).await;
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let orch = orchestrator(events);
        let camera = MockCamera::new(32, 32);

        let outcome = orch
            .run(&driver, &camera, &job(2, 2), ScanControl::new())
            .await
            .unwrap();

        assert!(matches!(outcome, ScanOutcome::Completed { passes: 1 }));
        assert_eq!(camera.frames_served(), 4);
        assert_eq!(driver.state(), ConnectionState::Connected);

        let captured = drain_events(&mut rx)
            .iter()
            .filter(|e| matches!(e, Event::TileCaptured { .. }))
            .count();
        assert_eq!(captured, 4);
    }

    #[tokio::test]
    async fn capture_failures_mark_tiles_and_continue() {
        let sim = SimStage::new();
        let driver = connect(sim).await;
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let orch = orchestrator(events);
        let camera = MockCamera::new(32, 32);
        camera.set_failing(true);

        let outcome = orch
            .run(&driver, &camera, &job(2, 2), ScanControl::new())
            .await
            .unwrap();

        assert!(matches!(outcome, ScanOutcome::Completed { .. }));
        let failed = drain_events(&mut rx)
            .iter()
            .filter(|e| matches!(e, Event::TileFailed { .. }))
            .count();
        assert_eq!(failed, 4);
    }

    #[tokio::test]
    async fn motion_failure_aborts_with_resume_context() {
        let sim = SimStage::new();
        sim.fail_command("G1", "Endstop hit");
        let driver = connect(sim).await;
        let orch = orchestrator(EventBus::default());
        let camera = MockCamera::new(32, 32);

        let outcome = orch
            .run(&driver, &camera, &job(2, 2), ScanControl::new())
            .await
            .unwrap();

        // tile (0,0) needs no move and completes; the move to (0,1) fails
        match outcome {
            ScanOutcome::Failed {
                error,
                last_completed_tile,
                last_position,
            } => {
                assert!(matches!(error, StageError::Motion(_)));
                assert_eq!(last_completed_tile, Some((0, 0)));
                assert!(last_position.is_some());
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_takes_effect_at_the_next_tile_boundary() {
        struct CancellingCamera {
            inner: MockCamera,
            control: Arc<ScanControl>,
        }
        #[async_trait::async_trait]
        impl crate::camera::FrameSource for CancellingCamera {
            async fn capture(&self) -> anyhow::Result<crate::camera::Frame> {
                let frame = self.inner.capture().await?;
                self.control.cancel();
                Ok(frame)
            }
        }

        let sim = SimStage::new();
        let driver = connect(sim).await;
        let orch = orchestrator(EventBus::default());
        let control = ScanControl::new();
        let camera = CancellingCamera {
            inner: MockCamera::new(32, 32),
            control: control.clone(),
        };

        let outcome = orch
            .run(&driver, &camera, &job(2, 2), control)
            .await
            .unwrap();

        match outcome {
            ScanOutcome::Cancelled {
                last_completed_tile,
                ..
            } => assert_eq!(last_completed_tile, Some((0, 0))),
            other => panic!("expected cancellation, got {other:?}"),
        }
        // stage released, not poisoned
        assert_eq!(driver.state(), ConnectionState::Connected);
        driver.position().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_the_run_until_resume() {
        let sim = SimStage::new();
        let driver = connect(sim).await;
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let orch = Arc::new(orchestrator(events));
        let camera = Arc::new(MockCamera::new(32, 32));
        let control = ScanControl::new();
        control.pause();

        let handle = {
            let orch = orch.clone();
            let driver = driver.clone();
            let camera = camera.clone();
            let control = control.clone();
            tokio::spawn(async move { orch.run(&driver, camera.as_ref(), &job(2, 2), control).await })
        };

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(
            !drain_events(&mut rx)
                .iter()
                .any(|e| matches!(e, Event::TileStarted { .. })),
            "tiles started while paused"
        );

        control.resume();
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, ScanOutcome::Completed { passes: 1 }));
        assert_eq!(camera.frames_served(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_runs_every_pass_on_schedule() {
        let sim = SimStage::new();
        let driver = connect(sim).await;
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let orch = orchestrator(events);
        let camera = MockCamera::new(32, 32);
        let job = ScanJob {
            grid: grid(2, 2),
            repeat: Some(Repeat {
                interval: Duration::from_secs(60),
                passes: Some(3),
            }),
            autofocus: None,
        };

        let started = Instant::now();
        let outcome = orch
            .run(&driver, &camera, &job, ScanControl::new())
            .await
            .unwrap();

        assert!(matches!(outcome, ScanOutcome::Completed { passes: 3 }));
        assert_eq!(camera.frames_served(), 12);
        // absolute schedule: third pass starts 2 intervals after the epoch
        assert!(started.elapsed() >= Duration::from_secs(120));
        let passes = drain_events(&mut rx)
            .iter()
            .filter(|e| matches!(e, Event::PassCompleted { .. }))
            .count();
        assert_eq!(passes, 3);
    }

    #[tokio::test]
    async fn configured_origin_anchors_the_grid() {
        let sim = SimStage::new();
        sim.set_position(Position::new(5.0, 5.0, 0.0));
        let position = sim.position_handle();
        let driver = connect(sim).await;
        let orch = orchestrator(EventBus::default());
        let camera = MockCamera::new(32, 32);

        let mut job = job(1, 2);
        job.grid.origin = Some(Position::new(1.0, 2.0, 0.0));
        let outcome = orch
            .run(&driver, &camera, &job, ScanControl::new())
            .await
            .unwrap();

        assert!(matches!(outcome, ScanOutcome::Completed { .. }));
        // run ends on the last tile: origin + one X pitch
        let end = *position.lock().unwrap();
        assert_eq!(end, Position::new(2.0, 2.0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn open_ended_repeat_runs_until_cancelled() {
        struct CountingCamera {
            inner: MockCamera,
            control: Arc<ScanControl>,
            cancel_after: u64,
        }
        #[async_trait::async_trait]
        impl crate::camera::FrameSource for CountingCamera {
            async fn capture(&self) -> anyhow::Result<crate::camera::Frame> {
                let frame = self.inner.capture().await?;
                if self.inner.frames_served() >= self.cancel_after {
                    self.control.cancel();
                }
                Ok(frame)
            }
        }

        let sim = SimStage::new();
        let driver = connect(sim).await;
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let orch = orchestrator(events);
        let control = ScanControl::new();
        let camera = CountingCamera {
            inner: MockCamera::new(32, 32),
            control: control.clone(),
            cancel_after: 4, // the last tile of the first pass
        };
        let job = ScanJob {
            grid: grid(2, 2),
            repeat: Some(Repeat {
                interval: Duration::from_secs(60),
                passes: None,
            }),
            autofocus: None,
        };

        let outcome = orch.run(&driver, &camera, &job, control).await.unwrap();

        // the first pass still completes; cancellation lands while
        // waiting for the (unbounded) second pass
        assert!(matches!(outcome, ScanOutcome::Cancelled { .. }));
        let passes = drain_events(&mut rx)
            .iter()
            .filter(|e| matches!(e, Event::PassCompleted { .. }))
            .count();
        assert_eq!(passes, 1);
    }

    #[tokio::test]
    async fn per_tile_autofocus_updates_the_surface() {
        let sim = SimStage::new();
        let camera = MockCamera::focus_linked(sim.position_handle(), 0.01, 0.2, 32, 32);
        let driver = connect(sim).await;
        let events = EventBus::default();
        let orch = orchestrator(events);
        let job = ScanJob {
            grid: grid(1, 2),
            repeat: None,
            autofocus: Some(ScanAutofocus {
                area: None,
                update_plane: true,
            }),
        };

        let outcome = orch
            .run(&driver, &camera, &job, ScanControl::new())
            .await
            .unwrap();

        assert!(matches!(outcome, ScanOutcome::Completed { .. }));
        assert_eq!(orch.autofocus.planes().sample_count(None), 2);
    }
}
