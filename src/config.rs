//! Typed settings for the stage control core.
//!
//! Settings deserialize from TOML with environment overrides
//! (`MICROSTAGE__TIMEOUTS__COMMAND=10s` style) and every struct carries
//! sensible defaults so an empty file is a valid configuration. Durations
//! are written in humantime form ("2s", "30ms").

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{StageError, StageResult};
use crate::focus::metric::FocusMetric;

/// Top-level settings bundle.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub probe: ProbeSettings,
    pub timeouts: TimeoutSettings,
    pub autofocus: AutofocusSettings,
    pub scan: ScanSettings,
}

impl Settings {
    /// Load settings from an optional TOML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> StageResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder
            .add_source(config::Environment::with_prefix("MICROSTAGE").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| StageError::Config(e.to_string()))
    }
}

/// Port discovery and identity verification.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Explicit candidate ports; empty means enumerate the system.
    pub ports: Vec<String>,
    /// Baud rates to try per port, in order. High-rate default first,
    /// then the documented fallback.
    pub bauds: Vec<u32>,
    /// Firmware family token that must appear in the M115 response.
    pub firmware_family: String,
    /// Required machine name; boards without it are never accepted.
    pub machine_name: String,
    /// Optional UUID used to disambiguate multiple compatible boards.
    pub machine_uuid: Option<String>,
    /// Settle delay after opening a port (boards auto-reset on open).
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
    /// Per-line read timeout while collecting the identification response.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            bauds: vec![250_000, 115_200],
            firmware_family: "Marlin".to_string(),
            machine_name: "MicroStageController".to_string(),
            machine_uuid: Some("a3a4637a-68c4-4340-9fda-847b4fe0d3fc".to_string()),
            settle: Duration::from_secs(2),
            read_timeout: Duration::from_secs(1),
        }
    }
}

/// Command acknowledgement budgets.
///
/// Home and motion-sync acknowledge only after physical motion completes,
/// so they get budgets far larger than ordinary commands.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    #[serde(with = "humantime_serde")]
    pub command: Duration,
    #[serde(with = "humantime_serde")]
    pub home: Duration,
    #[serde(with = "humantime_serde")]
    pub wait_idle: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(5),
            home: Duration::from_secs(90),
            wait_idle: Duration::from_secs(60),
        }
    }
}

/// Coarse-to-fine sweep parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutofocusSettings {
    /// Half-range of the unseeded coarse sweep, mm around the current Z.
    pub z_range_mm: f64,
    pub coarse_step_mm: f64,
    pub fine_step_mm: f64,
    /// Feed for coarse sweep moves, mm/s.
    pub coarse_feed_mm_s: f64,
    /// Feed for fine sweep moves, mm/s.
    pub fine_feed_mm_s: f64,
    /// Extra settle after motion stops, before scoring a frame.
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
    /// Minimum plane-model samples before a predicted Z seeds the sweep.
    pub seed_min_samples: usize,
    /// Coarse half-range shrink factor when seeded by a plane model.
    pub seeded_range_factor: f64,
    pub metric: FocusMetric,
}

impl Default for AutofocusSettings {
    fn default() -> Self {
        Self {
            z_range_mm: 0.5,
            coarse_step_mm: 0.010,
            fine_step_mm: 0.002,
            coarse_feed_mm_s: 4.0,
            fine_feed_mm_s: 3.0,
            settle: Duration::from_millis(30),
            seed_min_samples: 3,
            seeded_range_factor: 0.25,
            metric: FocusMetric::LaplacianVariance,
        }
    }
}

/// Grid traversal parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Feed for tile-to-tile XY moves, mm/s.
    pub feed_mm_s: f64,
    /// Extra settle after motion stops, before a tile capture.
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            feed_mm_s: 10.0,
            settle: Duration::from_millis(30),
        }
    }
}
