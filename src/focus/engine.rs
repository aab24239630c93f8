//! Coarse-to-fine autofocus sweep.
//!
//! The engine owns no hardware: it drives a [`StageOperation`] (exclusive
//! stage ownership for the whole run) and a [`FrameSource`], scoring one
//! frame per Z step. A tilt-surface prediction, when available, seeds the
//! sweep center and shrinks the coarse range; the winning point can be
//! folded back into the surface so later runs in the same region start
//! closer and sweep less.
//!
//! Every Z move is a relative jog followed by a motion sync, so a frame
//! is never scored while the stage is still settling. Cancellation is
//! honored between steps only; an in-flight move always completes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::camera::FrameSource;
use crate::config::AutofocusSettings;
use crate::error::{StageError, StageResult};
use crate::events::{CancelToken, Event, EventBus};
use crate::stage::{Position, StageDriver, StageOperation};

use super::plane::PlaneStore;

/// One scored point of a sweep.
#[derive(Debug, Clone)]
pub struct FocusSample {
    pub position: Position,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    Coarse,
    Fine,
}

/// A completed sweep: the winning sample plus everything scored on the way.
#[derive(Debug, Clone)]
pub struct AutofocusResult {
    pub best: FocusSample,
    pub samples: Vec<FocusSample>,
    /// Tilt-surface prediction that seeded the sweep, when one applied.
    pub seeded_z: Option<f64>,
}

/// A failed sweep. Partial samples are kept so a caller (or a log
/// subscriber) can see how far the sweep got and where the stage was left.
#[derive(Debug)]
pub struct AutofocusFailure {
    pub error: StageError,
    pub samples: Vec<FocusSample>,
    pub last_position: Option<Position>,
}

pub struct AutofocusEngine {
    settings: AutofocusSettings,
    planes: Arc<PlaneStore>,
    events: EventBus,
}

impl AutofocusEngine {
    pub fn new(settings: AutofocusSettings, planes: Arc<PlaneStore>, events: EventBus) -> Self {
        Self {
            settings,
            planes,
            events,
        }
    }

    pub fn planes(&self) -> &Arc<PlaneStore> {
        &self.planes
    }

    /// Claim the stage and run one sweep. Fails with `Busy` (no samples)
    /// when another operation holds the stage.
    pub async fn run(
        &self,
        driver: &StageDriver,
        camera: &dyn FrameSource,
        area: Option<&str>,
        cancel: &CancelToken,
        update_plane: bool,
    ) -> Result<AutofocusResult, AutofocusFailure> {
        let op = driver.try_begin("autofocus").map_err(|error| AutofocusFailure {
            error,
            samples: Vec::new(),
            last_position: None,
        })?;
        self.run_with(&op, camera, area, cancel, update_plane).await
    }

    /// Run one sweep inside an operation the caller already holds. Scan
    /// passes use this so autofocus nests inside the scan's ownership.
    pub async fn run_with(
        &self,
        op: &StageOperation,
        camera: &dyn FrameSource,
        area: Option<&str>,
        cancel: &CancelToken,
        update_plane: bool,
    ) -> Result<AutofocusResult, AutofocusFailure> {
        let mut samples = Vec::new();
        let mut last_position = None;

        match self
            .sweep(op, camera, area, cancel, &mut samples, &mut last_position)
            .await
        {
            Ok((best, seeded_z)) => {
                if update_plane {
                    self.planes.add_samples(
                        area,
                        &[(best.position.x, best.position.y, best.position.z)],
                    );
                }
                info!(
                    "autofocus done at z={:.4} (score {:.3e}, {} samples)",
                    best.position.z,
                    best.score,
                    samples.len()
                );
                self.events.emit(Event::AutofocusFinished {
                    result: Ok(best.clone()),
                    last_position: Some(best.position),
                });
                Ok(AutofocusResult {
                    best,
                    samples,
                    seeded_z,
                })
            }
            Err(error) => {
                self.events.emit(Event::AutofocusFinished {
                    result: Err(error.to_string()),
                    last_position,
                });
                Err(AutofocusFailure {
                    error,
                    samples,
                    last_position,
                })
            }
        }
    }

    async fn sweep(
        &self,
        op: &StageOperation,
        camera: &dyn FrameSource,
        area: Option<&str>,
        cancel: &CancelToken,
        samples: &mut Vec<FocusSample>,
        last_position: &mut Option<Position>,
    ) -> StageResult<(FocusSample, Option<f64>)> {
        let cfg = &self.settings;
        if cfg.coarse_step_mm <= 0.0 || cfg.fine_step_mm <= 0.0 || cfg.z_range_mm <= 0.0 {
            return Err(StageError::InvalidParameter(
                "sweep range and steps must be positive".to_string(),
            ));
        }

        let start = op.position().await?;
        *last_position = Some(start);

        let seeded_z = self
            .planes
            .predict(area, start.x, start.y, cfg.seed_min_samples);
        self.events.emit(Event::AutofocusStarted {
            area: area.map(str::to_string),
            seeded_z,
        });

        let center = seeded_z.unwrap_or(start.z);
        let half_range = match seeded_z {
            Some(z) => {
                debug!("sweep seeded at z={z:.4}, range shrunk by {}", cfg.seeded_range_factor);
                cfg.z_range_mm * cfg.seeded_range_factor
            }
            None => cfg.z_range_mm,
        };

        let mut current = start;

        let coarse_best = self
            .scan_phase(
                op,
                camera,
                cancel,
                SweepPhase::Coarse,
                center,
                half_range,
                cfg.coarse_step_mm,
                cfg.coarse_feed_mm_s,
                &mut current,
                samples,
                last_position,
            )
            .await?;

        // Fine sweep spans one coarse step either side of the coarse winner.
        let fine_best = self
            .scan_phase(
                op,
                camera,
                cancel,
                SweepPhase::Fine,
                coarse_best.position.z,
                cfg.coarse_step_mm,
                cfg.fine_step_mm,
                cfg.fine_feed_mm_s,
                &mut current,
                samples,
                last_position,
            )
            .await?;

        let best = pick_best(&[coarse_best, fine_best], center);

        // Land on the winner and let the motion finish before returning.
        self.step_to(op, &mut current, best.position.z, cfg.fine_feed_mm_s)
            .await?;
        *last_position = Some(current);

        Ok((best, seeded_z))
    }

    /// Sweep [center - half, center + half] at the given step, scoring one
    /// frame per stop. Returns the phase winner.
    #[allow(clippy::too_many_arguments)]
    async fn scan_phase(
        &self,
        op: &StageOperation,
        camera: &dyn FrameSource,
        cancel: &CancelToken,
        phase: SweepPhase,
        center: f64,
        half_range: f64,
        step: f64,
        feed_mm_s: f64,
        current: &mut Position,
        samples: &mut Vec<FocusSample>,
        last_position: &mut Option<Position>,
    ) -> StageResult<FocusSample> {
        let steps = ((2.0 * half_range) / step).round().max(1.0) as usize;
        let bottom = center - half_range;

        let mut phase_samples = Vec::with_capacity(steps + 1);
        for i in 0..=steps {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            let target = bottom + i as f64 * step;
            self.step_to(op, current, target, feed_mm_s).await?;
            *last_position = Some(*current);

            if !self.settings.settle.is_zero() {
                tokio::time::sleep(self.settings.settle).await;
            }

            let frame = camera
                .capture()
                .await
                .map_err(|e| StageError::Capture(e.to_string()))?;
            let sample = FocusSample {
                position: *current,
                score: self.settings.metric.score(&frame),
                timestamp: Utc::now(),
            };
            self.events.emit(Event::AutofocusSample {
                phase,
                sample: sample.clone(),
            });
            samples.push(sample.clone());
            phase_samples.push(sample);
        }

        let lo = phase_samples.iter().map(|s| s.score).fold(f64::INFINITY, f64::min);
        let hi = phase_samples
            .iter()
            .map(|s| s.score)
            .fold(f64::NEG_INFINITY, f64::max);
        if hi <= 0.0 || hi - lo < 1e-12 {
            return Err(StageError::DegenerateScores);
        }

        Ok(pick_best(&phase_samples, center))
    }

    /// Relative jog to an absolute Z target, tracked against the position
    /// we believe the stage holds, then sync.
    async fn step_to(
        &self,
        op: &StageOperation,
        current: &mut Position,
        target_z: f64,
        feed_mm_s: f64,
    ) -> StageResult<()> {
        let dz = target_z - current.z;
        if dz != 0.0 {
            op.jog(0.0, 0.0, dz, feed_mm_s).await?;
        }
        op.wait_idle().await?;
        current.z = target_z;
        Ok(())
    }
}

/// Highest score wins; on a near-tie the sample closest to the sweep
/// center wins, so a flat-topped response does not drift toward an edge.
fn pick_best(samples: &[FocusSample], center: f64) -> FocusSample {
    let mut best = samples[0].clone();
    for s in &samples[1..] {
        let better = s.score > best.score + 1e-12
            || ((s.score - best.score).abs() <= 1e-12
                && (s.position.z - center).abs() < (best.position.z - center).abs());
        if better {
            best = s.clone();
        }
    }
    best
}
