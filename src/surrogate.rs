//! Frozen, queryable result of a training run.
//!
//! A [`TrainedSurrogate`] bundles the trained field with the domain and physical parameters it
//! was trained against. Every query takes `&self`; the surrogate can be shared across threads.

use crate::field::{FieldModel, Mlp};
use crate::geometry::{BoundaryTag, Domain};
use crate::loss;
use crate::measurements::MeasurementSet;
use crate::params::{PhysicalParams, Scales};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedSurrogate<F = Mlp> {
    field: F,
    domain: Domain,
    params: PhysicalParams,
}

/// Predictions at a list of points, one array per output.
#[derive(Debug, Clone, PartialEq)]
pub struct PointPredictions {
    pub u: Array1<f64>,
    pub v: Array1<f64>,
    pub p: Array1<f64>,
}

/// Predictions on a regular grid; `ny × nx` arrays, NaN outside the domain.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowFieldGrid {
    pub x: Array2<f64>,
    pub y: Array2<f64>,
    pub u: Array2<f64>,
    pub v: Array2<f64>,
    pub p: Array2<f64>,
}

/// Min and max of each output over the points that were inside the domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRanges {
    pub u: (f64, f64),
    pub v: (f64, f64),
    pub p: (f64, f64),
}

impl<F> TrainedSurrogate<F> {
    pub fn new(field: F, domain: Domain, params: PhysicalParams) -> Self {
        Self {
            field,
            domain,
            params,
        }
    }

    pub fn field(&self) -> &F {
        &self.field
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn params(&self) -> &PhysicalParams {
        &self.params
    }

    pub fn into_field(self) -> F {
        self.field
    }
}

fn linspace(lo: f64, hi: f64, n: usize) -> impl Iterator<Item = f64> {
    let step = if n > 1 { (hi - lo) / (n - 1) as f64 } else { 0.0 };
    (0..n).map(move |i| lo + step * i as f64)
}

impl<F: FieldModel> TrainedSurrogate<F> {
    /// Inside the domain, counting points on (or within rounding of) the boundary.
    fn covers(&self, p: [f64; 2]) -> bool {
        self.domain.contains(p)
            || self.domain.distance_to_boundary(p) <= 1e-9 * self.domain.characteristic_length()
    }

    pub fn predict_single_point(&self, x: f64, y: f64) -> Result<[f64; 3]> {
        let out = self.field.predict(&ndarray::array![[x, y]].view())?;
        Ok([out[[0, 0]], out[[0, 1]], out[[0, 2]]])
    }

    /// `points` is `n × 2`.
    pub fn predict_multiple_points(&self, points: &ArrayView2<f64>) -> Result<PointPredictions> {
        let out = self.field.predict(points)?;
        Ok(PointPredictions {
            u: out.column(0).to_owned(),
            v: out.column(1).to_owned(),
            p: out.column(2).to_owned(),
        })
    }

    /// Regular `nx × ny` grid over `[x₀, x₀ + length] × [y₀, y₀ + width]`, where `(x₀, y₀)` is
    /// the lower-left corner of the domain's bounding box.
    pub fn predict_flow_field(
        &self,
        length: f64,
        width: f64,
        nx: usize,
        ny: usize,
    ) -> Result<FlowFieldGrid> {
        if nx == 0 || ny == 0 {
            return Err(Error::Shape("flow field grid needs nx, ny >= 1"));
        }
        if !(length > 0.0) || !(width > 0.0) {
            return Err(Error::ParameterInvalid(
                "grid length and width must be positive".into(),
            ));
        }
        let (lo, _) = self.domain.bounding_box();
        let xs: Vec<f64> = linspace(lo[0], lo[0] + length, nx).collect();
        let ys: Vec<f64> = linspace(lo[1], lo[1] + width, ny).collect();

        let mut x = Array2::zeros((ny, nx));
        let mut y = Array2::zeros((ny, nx));
        let mut inside = Vec::new();
        for (j, &yv) in ys.iter().enumerate() {
            for (i, &xv) in xs.iter().enumerate() {
                x[[j, i]] = xv;
                y[[j, i]] = yv;
                if self.covers([xv, yv]) {
                    inside.push((j, i));
                }
            }
        }
        let mut coords = Array2::zeros((inside.len(), 2));
        for (k, &(j, i)) in inside.iter().enumerate() {
            coords[[k, 0]] = x[[j, i]];
            coords[[k, 1]] = y[[j, i]];
        }
        let out = self.field.predict(&coords.view())?;

        let mut u = Array2::from_elem((ny, nx), f64::NAN);
        let mut v = Array2::from_elem((ny, nx), f64::NAN);
        let mut p = Array2::from_elem((ny, nx), f64::NAN);
        for (k, &(j, i)) in inside.iter().enumerate() {
            u[[j, i]] = out[[k, 0]];
            v[[j, i]] = out[[k, 1]];
            p[[j, i]] = out[[k, 2]];
        }
        Ok(FlowFieldGrid { x, y, u, v, p })
    }

    /// Volumetric flux (per unit depth) `∫ u dy` through the vertical line at `x`, by the
    /// midpoint rule on `n` cells over the bounding box, counting only cells inside the domain.
    pub fn cross_section_flux(&self, x: f64, n: usize) -> Result<f64> {
        if n == 0 {
            return Err(Error::Shape("cross section needs n >= 1"));
        }
        let (lo, hi) = self.domain.bounding_box();
        let dy = (hi[1] - lo[1]) / n as f64;
        let ys: Vec<f64> = (0..n)
            .map(|k| lo[1] + (k as f64 + 0.5) * dy)
            .filter(|&y| self.domain.contains([x, y]))
            .collect();
        if ys.is_empty() {
            return Ok(0.0);
        }
        let mut coords = Array2::zeros((ys.len(), 2));
        for (k, &y) in ys.iter().enumerate() {
            coords[[k, 0]] = x;
            coords[[k, 1]] = y;
        }
        let out = self.field.predict(&coords.view())?;
        Ok(out.column(0).sum() * dy)
    }

    /// Largest velocity magnitude on the walls, sampled at `n` evenly spaced interior points of
    /// each wall segment.
    pub fn max_wall_slip(&self, n: usize) -> Result<f64> {
        let walls: Vec<usize> = self.domain.segments_tagged(BoundaryTag::Wall).collect();
        if n == 0 || walls.is_empty() {
            return Ok(0.0);
        }
        let mut coords = Array2::zeros((n * walls.len(), 2));
        for (w, &seg) in walls.iter().enumerate() {
            let (a, b) = self.domain.segment_points(seg);
            for k in 0..n {
                let s = (k as f64 + 0.5) / n as f64;
                coords[[w * n + k, 0]] = a[0] + s * (b[0] - a[0]);
                coords[[w * n + k, 1]] = a[1] + s * (b[1] - a[1]);
            }
        }
        let out = self.field.predict(&coords.view())?;
        Ok(out
            .rows()
            .into_iter()
            .map(|r| r[0].hypot(r[1]))
            .fold(0.0, f64::max))
    }

    /// Ranges of `u, v, p` over an `nx × ny` grid spanning the bounding box.
    pub fn value_ranges(&self, nx: usize, ny: usize) -> Result<ValueRanges> {
        let (lo, hi) = self.domain.bounding_box();
        let g = self.predict_flow_field(hi[0] - lo[0], hi[1] - lo[1], nx, ny)?;
        let range = |a: &Array2<f64>| {
            a.iter()
                .filter(|x| x.is_finite())
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(mn, mx), &x| {
                    (mn.min(x), mx.max(x))
                })
        };
        Ok(ValueRanges {
            u: range(&g.u),
            v: range(&g.v),
            p: range(&g.p),
        })
    }

    /// Normalized data misfit against `measurements` (see [`loss::data_term`]).
    pub fn data_loss(&self, measurements: &MeasurementSet, scales: &Scales) -> Result<f64> {
        let pred = self.field.predict(&measurements.coords())?;
        let (l, _) = loss::data_term(&pred, &measurements.values().to_owned(), scales);
        Ok(l)
    }
}

impl<F: Serialize> TrainedSurrogate<F> {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        Ok(())
    }
}

impl<F: DeserializeOwned> TrainedSurrogate<F> {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytic::Poiseuille;
    use crate::field::MlpConfig;
    use approx::assert_relative_eq;

    fn poiseuille_surrogate() -> TrainedSurrogate<Poiseuille> {
        let d = Domain::rectangle(0.01, 0.0002).unwrap();
        let p = PhysicalParams::default();
        TrainedSurrogate::new(Poiseuille::new(&d, &p).unwrap(), d, p)
    }

    #[test]
    fn single_and_batched_queries_agree() {
        let s = poiseuille_surrogate();
        let one = s.predict_single_point(0.004, 0.0001).unwrap();
        let many = s
            .predict_multiple_points(&ndarray::array![[0.004, 0.0001], [0.001, 0.00005]].view())
            .unwrap();
        assert_eq!(one, [many.u[0], many.v[0], many.p[0]]);
        assert_relative_eq!(one[0], 1.5 * 0.0077, max_relative = 1e-12);
    }

    #[test]
    fn grid_is_nan_outside_the_domain() {
        let d = Domain::t_junction(4.0, 2.0, 1.0, 2.0).unwrap();
        let p = PhysicalParams::new(1.0, 0.1, 1.0).unwrap();
        let s = TrainedSurrogate::new(Poiseuille::new(&d, &p).unwrap(), d, p);
        let g = s.predict_flow_field(4.0, 3.0, 9, 7).unwrap();
        assert_eq!(g.u.dim(), (7, 9));
        // (0, 3) is the top-left bounding box corner, outside the T.
        assert!(g.u[[6, 0]].is_nan());
        // (2, 2) lies in the branch; (0, 0) is a corner of the main channel.
        assert!(g.u[[4, 4]].is_finite());
        assert!(g.u[[0, 0]].is_finite());
        assert_eq!(g.x[[0, 8]], 4.0);
    }

    #[test]
    fn poiseuille_flux_is_constant_and_walls_do_not_slip() {
        let s = poiseuille_surrogate();
        for x in [0.001, 0.005, 0.009] {
            let q = s.cross_section_flux(x, 400).unwrap();
            assert_relative_eq!(q, 0.0077 * 0.0002, max_relative = 1e-4);
        }
        assert!(s.max_wall_slip(50).unwrap() < 1e-15);
        let r = s.value_ranges(11, 11).unwrap();
        assert_relative_eq!(r.u.1, 1.5 * 0.0077, max_relative = 1e-12);
        assert!(r.p.0 >= -1e-12 && r.p.1 > 0.0);
    }

    #[test]
    fn mlp_artifact_round_trips_through_json() {
        let d = Domain::y_junction(1.0, 1.0, 0.5, 30.0).unwrap();
        let p = PhysicalParams::new(1.0, 0.05, 0.5).unwrap();
        let net = Mlp::new(&MlpConfig::default(), &d, &Scales::new(&d, &p), &p).unwrap();
        let s = TrainedSurrogate::new(net, d, p);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("surrogate.json");
        s.save_json(&path).unwrap();
        let back: TrainedSurrogate = TrainedSurrogate::load_json(&path).unwrap();
        assert_eq!(back.params(), s.params());
        assert_eq!(back.domain(), s.domain());
        let a = s.predict_single_point(0.5, 0.0).unwrap();
        let b = back.predict_single_point(0.5, 0.0).unwrap();
        for k in 0..3 {
            assert_relative_eq!(a[k], b[k], max_relative = 1e-12);
        }
    }
}
