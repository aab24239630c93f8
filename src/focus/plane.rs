//! Tilt-compensation surfaces.
//!
//! Each area of the sample (plus a global fallback) accumulates
//! best-focus points and fits Z as a polynomial surface of X,Y. Below
//! the minimum point count for the configured order the model degrades
//! to a flat plane at the mean Z, and a degenerate fit (collinear
//! points) falls back the same way instead of failing the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::Deserialize;

/// Surface polynomial order. Fitting requires 3/6/10 points respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceKind {
    #[default]
    Linear,
    Quadratic,
    Cubic,
}

impl SurfaceKind {
    pub fn min_points(&self) -> usize {
        match self {
            SurfaceKind::Linear => 3,
            SurfaceKind::Quadratic => 6,
            SurfaceKind::Cubic => 10,
        }
    }

    fn basis(&self, x: f64, y: f64) -> Vec<f64> {
        let mut terms = vec![1.0, x, y];
        if matches!(self, SurfaceKind::Quadratic | SurfaceKind::Cubic) {
            terms.extend([x * x, x * y, y * y]);
        }
        if matches!(self, SurfaceKind::Cubic) {
            terms.extend([x * x * x, x * x * y, x * y * y, y * y * y]);
        }
        terms
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Fit {
    /// No samples yet; prediction is impossible.
    Empty,
    /// Too few (or degenerate) points: single Z at the sample mean.
    Flat(f64),
    Surface(DVector<f64>),
}

/// One fitted tilt-compensation surface.
#[derive(Debug, Clone)]
pub struct PlaneModel {
    kind: SurfaceKind,
    samples: Vec<(f64, f64, f64)>,
    fit: Fit,
}

impl PlaneModel {
    pub fn new(kind: SurfaceKind) -> Self {
        Self {
            kind,
            samples: Vec::new(),
            fit: Fit::Empty,
        }
    }

    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Append best-focus points and refit.
    pub fn add_samples(&mut self, points: &[(f64, f64, f64)]) {
        self.samples.extend_from_slice(points);
        self.refit();
    }

    fn refit(&mut self) {
        if self.samples.is_empty() {
            self.fit = Fit::Empty;
            return;
        }

        let mean_z =
            self.samples.iter().map(|&(_, _, z)| z).sum::<f64>() / self.samples.len() as f64;

        if self.samples.len() < self.kind.min_points() {
            self.fit = Fit::Flat(mean_z);
            return;
        }

        let terms = self.kind.basis(0.0, 0.0).len();
        let rows: Vec<f64> = self
            .samples
            .iter()
            .flat_map(|&(x, y, _)| self.kind.basis(x, y))
            .collect();
        let a = DMatrix::from_row_slice(self.samples.len(), terms, &rows);
        let b = DVector::from_iterator(self.samples.len(), self.samples.iter().map(|&(_, _, z)| z));

        let eps = 1e-10;
        let svd = a.svd(true, true);
        if svd.rank(eps) < terms {
            warn!("degenerate surface fit ({} samples, rank-deficient); using flat model", self.samples.len());
            self.fit = Fit::Flat(mean_z);
            return;
        }
        match svd.solve(&b, eps) {
            Ok(coeffs) if coeffs.iter().all(|c| c.is_finite()) => {
                debug!("refit {:?} surface from {} samples", self.kind, self.samples.len());
                self.fit = Fit::Surface(coeffs);
            }
            _ => {
                warn!("surface solve failed; using flat model");
                self.fit = Fit::Flat(mean_z);
            }
        }
    }

    /// Evaluate the surface; `None` until the first sample arrives.
    pub fn predict(&self, x: f64, y: f64) -> Option<f64> {
        match &self.fit {
            Fit::Empty => None,
            Fit::Flat(z) => Some(*z),
            Fit::Surface(coeffs) => Some(
                self.kind
                    .basis(x, y)
                    .iter()
                    .zip(coeffs.iter())
                    .map(|(t, c)| t * c)
                    .sum(),
            ),
        }
    }
}

/// A named region of the sample with its own tilt surface.
#[derive(Debug, Clone)]
pub struct Area {
    pub id: String,
    /// Closed polygon in stage XY (mm). Empty means "never matched by
    /// position"; such areas are reachable only by explicit id.
    pub polygon: Vec<(f64, f64)>,
    /// Higher priority wins when polygons overlap.
    pub priority: i32,
}

impl Area {
    /// Ray-cast point-in-polygon test.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.polygon.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        for i in 0..n {
            let (x1, y1) = self.polygon[i];
            let (x2, y2) = self.polygon[(i + 1) % n];
            if (y1 > y) != (y2 > y) && x < (x2 - x1) * (y - y1) / (y2 - y1 + 1e-12) + x1 {
                inside = !inside;
            }
        }
        inside
    }
}

struct AreaEntry {
    area: Area,
    model: StdMutex<PlaneModel>,
}

/// Shared registry of tilt surfaces: per-area models plus a global
/// fallback.
///
/// Updates to one area serialize on that area's lock; autofocus runs
/// against *different* areas proceed independently. No lock is ever held
/// across an await point — fitting is pure math.
pub struct PlaneStore {
    kind: SurfaceKind,
    global: StdMutex<PlaneModel>,
    areas: StdRwLock<HashMap<String, Arc<AreaEntry>>>,
}

impl PlaneStore {
    pub fn new(kind: SurfaceKind) -> Self {
        Self {
            kind,
            global: StdMutex::new(PlaneModel::new(kind)),
            areas: StdRwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) an area. Its accumulated samples reset.
    pub fn define_area(&self, area: Area) {
        let entry = Arc::new(AreaEntry {
            model: StdMutex::new(PlaneModel::new(self.kind)),
            area,
        });
        self.areas
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry.area.id.clone(), entry.clone());
    }

    fn entry(&self, area_id: &str) -> Option<Arc<AreaEntry>> {
        self.areas
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(area_id)
            .cloned()
    }

    /// Fold best-focus points into an area's model (auto-created with an
    /// empty polygon when unknown) or into the global model.
    pub fn add_samples(&self, area_id: Option<&str>, points: &[(f64, f64, f64)]) {
        match area_id {
            Some(id) => {
                let entry = self.entry(id).unwrap_or_else(|| {
                    let entry = Arc::new(AreaEntry {
                        area: Area {
                            id: id.to_string(),
                            polygon: Vec::new(),
                            priority: 0,
                        },
                        model: StdMutex::new(PlaneModel::new(self.kind)),
                    });
                    self.areas
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(id.to_string(), entry.clone());
                    entry
                });
                entry
                    .model
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .add_samples(points);
            }
            None => self
                .global
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .add_samples(points),
        }
    }

    /// Highest-priority area whose polygon contains (x, y).
    pub fn select_area(&self, x: f64, y: f64) -> Option<String> {
        self.areas
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|e| e.area.contains(x, y))
            .max_by_key(|e| e.area.priority)
            .map(|e| e.area.id.clone())
    }

    /// Samples accumulated in the given area (or the global model).
    pub fn sample_count(&self, area_id: Option<&str>) -> usize {
        match area_id {
            Some(id) => self
                .entry(id)
                .map(|e| e.model.lock().unwrap_or_else(|p| p.into_inner()).sample_count())
                .unwrap_or(0),
            None => self
                .global
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .sample_count(),
        }
    }

    /// Predict Z at (x, y): the explicit (or position-matched) area when
    /// it has at least `min_samples`, else the global model under the
    /// same gate, else `None` (caller supplies the default).
    pub fn predict(&self, area_id: Option<&str>, x: f64, y: f64, min_samples: usize) -> Option<f64> {
        let resolved = area_id
            .map(str::to_string)
            .or_else(|| self.select_area(x, y));

        if let Some(id) = resolved {
            if let Some(entry) = self.entry(&id) {
                let model = entry.model.lock().unwrap_or_else(|e| e.into_inner());
                if model.sample_count() >= min_samples {
                    return model.predict(x, y);
                }
            }
        }

        let global = self.global.lock().unwrap_or_else(|e| e.into_inner());
        if global.sample_count() >= min_samples {
            return global.predict(x, y);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn planar_fit_roundtrip() {
        // z = 2 + 0.1x - 0.05y, sampled on a non-degenerate spread
        let pts: Vec<(f64, f64, f64)> = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0), (10.0, 10.0), (5.0, 3.0)]
            .iter()
            .map(|&(x, y)| (x, y, 2.0 + 0.1 * x - 0.05 * y))
            .collect();
        let mut model = PlaneModel::new(SurfaceKind::Linear);
        model.add_samples(&pts);

        for &(x, y, z) in &pts {
            assert_abs_diff_eq!(model.predict(x, y).unwrap(), z, epsilon = 1e-9);
        }
        // and at an unsampled position
        assert_abs_diff_eq!(model.predict(3.0, 7.0).unwrap(), 2.0 + 0.3 - 0.35, epsilon = 1e-9);
    }

    #[test]
    fn below_min_points_is_flat_at_mean() {
        let mut model = PlaneModel::new(SurfaceKind::Linear);
        model.add_samples(&[(0.0, 0.0, 1.0), (5.0, 5.0, 3.0)]);
        assert_abs_diff_eq!(model.predict(100.0, -40.0).unwrap(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn collinear_points_fall_back_to_flat() {
        // all on the line y = x: rank-deficient design matrix
        let pts: Vec<(f64, f64, f64)> =
            (0..5).map(|i| (i as f64, i as f64, 1.0 + i as f64)).collect();
        let mut model = PlaneModel::new(SurfaceKind::Linear);
        model.add_samples(&pts);
        assert_abs_diff_eq!(model.predict(50.0, 0.0).unwrap(), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn quadratic_fit_reproduces_curvature() {
        let f = |x: f64, y: f64| 1.0 + 0.02 * x * x - 0.01 * x * y + 0.03 * y * y;
        let mut pts = Vec::new();
        for x in 0..4 {
            for y in 0..4 {
                pts.push((x as f64, y as f64, f(x as f64, y as f64)));
            }
        }
        let mut model = PlaneModel::new(SurfaceKind::Quadratic);
        model.add_samples(&pts);
        assert_abs_diff_eq!(model.predict(2.5, 1.5).unwrap(), f(2.5, 1.5), epsilon = 1e-8);
    }

    #[test]
    fn empty_model_predicts_nothing() {
        let model = PlaneModel::new(SurfaceKind::Linear);
        assert!(model.predict(0.0, 0.0).is_none());
    }

    #[test]
    fn area_polygon_contains() {
        let area = Area {
            id: "well-a1".into(),
            polygon: vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)],
            priority: 0,
        };
        assert!(area.contains(5.0, 5.0));
        assert!(!area.contains(15.0, 5.0));
        assert!(!area.contains(-1.0, 5.0));
    }

    #[test]
    fn store_prefers_area_then_global_then_none() {
        let store = PlaneStore::new(SurfaceKind::Linear);
        store.define_area(Area {
            id: "well-a1".into(),
            polygon: vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)],
            priority: 0,
        });

        // nothing fitted yet
        assert!(store.predict(None, 5.0, 5.0, 3).is_none());

        // global gets enough points
        store.add_samples(
            None,
            &[(0.0, 0.0, 1.0), (20.0, 0.0, 1.0), (0.0, 20.0, 1.0), (20.0, 20.0, 1.0)],
        );
        assert_abs_diff_eq!(store.predict(None, 5.0, 5.0, 3).unwrap(), 1.0, epsilon = 1e-9);

        // area override wins inside its polygon
        store.add_samples(
            Some("well-a1"),
            &[(0.0, 0.0, 2.0), (10.0, 0.0, 2.0), (0.0, 10.0, 2.0), (10.0, 10.0, 2.0)],
        );
        assert_abs_diff_eq!(store.predict(None, 5.0, 5.0, 3).unwrap(), 2.0, epsilon = 1e-9);
        // outside the polygon the global model still answers
        assert_abs_diff_eq!(store.predict(None, 50.0, 50.0, 3).unwrap(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn overlapping_areas_resolve_by_priority() {
        let store = PlaneStore::new(SurfaceKind::Linear);
        for (id, priority) in [("low", 0), ("high", 5)] {
            store.define_area(Area {
                id: id.into(),
                polygon: vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)],
                priority,
            });
        }
        assert_eq!(store.select_area(5.0, 5.0).as_deref(), Some("high"));
    }
}
