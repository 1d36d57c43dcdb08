//! Collocation point selection.
//!
//! Three kinds of points:
//!
//! - **interior**: uniform or Halton points over the bounding box, rejected outside the polygon;
//!   redrawn per resampling epoch,
//! - **boundary**: stratified along each tagged segment, count proportional to length with a
//!   per-segment floor so short outlets are never starved; fixed for a run,
//! - **key points**: a few jittered points just inside every vertex, more at reentrant
//!   (bifurcation) corners; fixed for a run and always part of the residual set.
//!
//! Requests beyond what the polygon can hold at a stable spacing are clamped, never refused.

use crate::geometry::{BoundaryTag, Domain};
use crate::params::PhysicalParams;
use crate::{Error, Result, Warning};
use log::warn;
use ndarray::{concatenate, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// How interior points are distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InteriorDistribution {
    /// i.i.d. uniform over the bounding box.
    #[default]
    Uniform,
    /// Halton sequence (bases 2 and 3) with a seeded Cranley–Patterson shift.
    Halton,
}

/// Sampler knobs. Lengths are in units of the characteristic length `l_c`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Interior points per epoch.
    pub interior: usize,
    /// Boundary points, shared between segments in proportion to length.
    pub boundary: usize,
    /// Floor on boundary points per segment.
    pub min_per_segment: usize,
    /// Key points at each convex vertex.
    pub key_points_per_vertex: usize,
    /// Multiplier on key points at reentrant vertices.
    pub concave_multiplier: usize,
    /// Distance of key points from their vertex along the inward bisector.
    pub key_offset: f64,
    /// Standard deviation of the key point jitter.
    pub key_jitter: f64,
    /// Smallest spacing considered numerically stable.
    pub min_spacing: f64,
    pub distribution: InteriorDistribution,
    /// Rejection sampling gives up after `interior * max_attempts_factor` draws.
    pub max_attempts_factor: usize,
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interior: 2_000,
            boundary: 200,
            min_per_segment: 8,
            key_points_per_vertex: 4,
            concave_multiplier: 4,
            key_offset: 0.05,
            key_jitter: 0.02,
            min_spacing: 0.002,
            distribution: InteriorDistribution::Uniform,
            max_attempts_factor: 50,
            seed: 42,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interior == 0 {
            return Err(Error::Config("sampler.interior must be >= 1".into()));
        }
        if self.min_per_segment == 0 {
            return Err(Error::Config("sampler.min_per_segment must be >= 1".into()));
        }
        if self.concave_multiplier == 0 {
            return Err(Error::Config("sampler.concave_multiplier must be >= 1".into()));
        }
        if self.max_attempts_factor == 0 {
            return Err(Error::Config("sampler.max_attempts_factor must be >= 1".into()));
        }
        for (name, x) in [
            ("key_offset", self.key_offset),
            ("min_spacing", self.min_spacing),
        ] {
            if !(x > 0.0) || !x.is_finite() {
                return Err(Error::Config(format!(
                    "sampler.{name} must be positive and finite"
                )));
            }
        }
        if !(self.key_jitter >= 0.0) || !self.key_jitter.is_finite() {
            return Err(Error::Config(
                "sampler.key_jitter must be non-negative and finite".into(),
            ));
        }
        Ok(())
    }
}

/// Boundary collocation points and what to enforce at each.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryPoints {
    /// `n × 2`.
    pub coords: Array2<f64>,
    pub tags: Vec<BoundaryTag>,
    /// Index of the owning segment.
    pub segments: Vec<usize>,
    /// Unit outward normals, `n × 2`.
    pub normals: Array2<f64>,
    /// Dirichlet velocity target `(u, v)`, `n × 2`: the inlet profile along the inward normal
    /// on inlets, zero on walls, unused on outlets.
    pub velocity_targets: Array2<f64>,
}

impl BoundaryPoints {
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Row indices carrying `tag`.
    pub fn rows_tagged(&self, tag: BoundaryTag) -> Vec<usize> {
        (0..self.len()).filter(|&i| self.tags[i] == tag).collect()
    }
}

/// Points at which the losses are evaluated for one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct CollocationSet {
    /// Interior points of the current epoch, `n × 2`.
    pub interior: Array2<f64>,
    /// Key points, `k × 2`.
    pub key_points: Array2<f64>,
    pub boundary: BoundaryPoints,
    /// Resampling epoch the interior points were drawn for.
    pub epoch: u64,
}

impl CollocationSet {
    /// Interior and key points stacked: every row where the PDE is enforced.
    pub fn residual_points(&self) -> Array2<f64> {
        // Both operands have two columns.
        concatenate(Axis(0), &[self.interior.view(), self.key_points.view()])
            .unwrap_or_else(|_| self.interior.clone())
    }
}

/// Draw a full collocation set.
///
/// Boundary and key points depend only on `(domain, params, cfg)`; interior points also on
/// `epoch`. Clamped requests are logged and returned as [`Warning::SamplingDegraded`].
pub fn sample(
    domain: &Domain,
    params: &PhysicalParams,
    cfg: &SamplerConfig,
    epoch: u64,
) -> Result<(CollocationSet, Vec<Warning>)> {
    cfg.validate()?;
    let mut warnings = Vec::new();
    let interior = sample_interior(domain, cfg, epoch, &mut warnings);
    let boundary = sample_boundary(domain, params, cfg, &mut warnings);
    let key_points = key_points(domain, cfg);
    Ok((
        CollocationSet {
            interior,
            key_points,
            boundary,
            epoch,
        },
        warnings,
    ))
}

/// Redraw only the interior points of `set` for a new epoch.
pub fn resample_interior(
    set: &mut CollocationSet,
    domain: &Domain,
    cfg: &SamplerConfig,
    epoch: u64,
) -> Vec<Warning> {
    let mut warnings = Vec::new();
    set.interior = sample_interior(domain, cfg, epoch, &mut warnings);
    set.epoch = epoch;
    warnings
}

const STREAM_INTERIOR: u64 = 1;
const STREAM_BOUNDARY: u64 = 2;
const STREAM_KEY: u64 = 3;

/// SplitMix64 finalizer over `(seed, stream, epoch)`.
fn stream_seed(seed: u64, stream: u64, epoch: u64) -> u64 {
    let mut z = seed
        .wrapping_add(stream.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(epoch.wrapping_mul(0xD1B5_4A32_D192_ED03));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn degraded(warnings: &mut Vec<Warning>, what: String, requested: usize, granted: usize) {
    warn!("sampling degraded for {what}: requested {requested} points, granted {granted}");
    warnings.push(Warning::SamplingDegraded {
        what,
        requested,
        granted,
    });
}

fn radical_inverse(mut i: u64, base: u64) -> f64 {
    let inv = 1.0 / base as f64;
    let mut f = inv;
    let mut r = 0.0;
    while i > 0 {
        r += f * (i % base) as f64;
        i /= base;
        f *= inv;
    }
    r
}

fn sample_interior(
    domain: &Domain,
    cfg: &SamplerConfig,
    epoch: u64,
    warnings: &mut Vec<Warning>,
) -> Array2<f64> {
    let spacing = cfg.min_spacing * domain.characteristic_length();
    let cap = ((domain.area() / (spacing * spacing)).floor() as usize).max(1);
    let mut n = cfg.interior;
    if n > cap {
        degraded(warnings, "interior".into(), n, cap);
        n = cap;
    }

    let (lo, hi) = domain.bounding_box();
    let mut rng = ChaCha8Rng::seed_from_u64(stream_seed(cfg.seed, STREAM_INTERIOR, epoch));
    let shift: [f64; 2] = [rng.random(), rng.random()];
    // Successive epochs continue the Halton sequence instead of repeating it.
    let stride = (cfg.interior as u64).wrapping_mul(cfg.max_attempts_factor as u64);
    let mut halton_index = 1 + epoch.wrapping_mul(stride);

    let budget = n.saturating_mul(cfg.max_attempts_factor);
    let mut pts = Vec::with_capacity(2 * n);
    let mut attempts = 0;
    while pts.len() < 2 * n && attempts < budget {
        attempts += 1;
        let (a, b) = match cfg.distribution {
            InteriorDistribution::Uniform => (rng.random::<f64>(), rng.random::<f64>()),
            InteriorDistribution::Halton => {
                let a = (radical_inverse(halton_index, 2) + shift[0]).fract();
                let b = (radical_inverse(halton_index, 3) + shift[1]).fract();
                halton_index += 1;
                (a, b)
            }
        };
        let p = [lo[0] + a * (hi[0] - lo[0]), lo[1] + b * (hi[1] - lo[1])];
        if domain.contains(p) {
            pts.extend_from_slice(&p);
        }
    }
    let got = pts.len() / 2;
    if got < n {
        degraded(warnings, "interior (rejection budget)".into(), n, got);
    }
    Array2::from_shape_vec((got, 2), pts).unwrap_or_else(|_| Array2::zeros((0, 2)))
}

fn sample_boundary(
    domain: &Domain,
    params: &PhysicalParams,
    cfg: &SamplerConfig,
    warnings: &mut Vec<Warning>,
) -> BoundaryPoints {
    let spacing = cfg.min_spacing * domain.characteristic_length();
    let perimeter = domain.perimeter();
    let mut rng = ChaCha8Rng::seed_from_u64(stream_seed(cfg.seed, STREAM_BOUNDARY, 0));

    let mut coords = Vec::new();
    let mut normals = Vec::new();
    let mut targets = Vec::new();
    let mut tags = Vec::new();
    let mut segments = Vec::new();
    for (i, seg) in domain.segments().iter().enumerate() {
        let len = domain.segment_length(i);
        let share = (cfg.boundary as f64 * len / perimeter).round() as usize;
        let mut n = share.max(cfg.min_per_segment);
        let cap = ((len / spacing).floor() as usize).max(1);
        if n > cap {
            degraded(warnings, format!("boundary segment {i} ({})", seg.label), n, cap);
            n = cap;
        }
        let (a, b) = domain.segment_points(i);
        let normal = domain.outward_normal(i);
        for k in 0..n {
            let u: f64 = rng.random();
            let s = (k as f64 + u) / n as f64;
            coords.extend_from_slice(&[a[0] + s * (b[0] - a[0]), a[1] + s * (b[1] - a[1])]);
            normals.extend_from_slice(&normal);
            let target = match seg.tag {
                BoundaryTag::Inlet => {
                    let speed = params.inlet_profile.speed(params.inlet_velocity, s);
                    [-speed * normal[0], -speed * normal[1]]
                }
                BoundaryTag::Wall | BoundaryTag::Outlet => [0.0, 0.0],
            };
            targets.extend_from_slice(&target);
            tags.push(seg.tag);
            segments.push(i);
        }
    }
    let n = tags.len();
    BoundaryPoints {
        coords: Array2::from_shape_vec((n, 2), coords).unwrap_or_else(|_| Array2::zeros((0, 2))),
        tags,
        segments,
        normals: Array2::from_shape_vec((n, 2), normals).unwrap_or_else(|_| Array2::zeros((0, 2))),
        velocity_targets: Array2::from_shape_vec((n, 2), targets)
            .unwrap_or_else(|_| Array2::zeros((0, 2))),
    }
}

fn key_points(domain: &Domain, cfg: &SamplerConfig) -> Array2<f64> {
    let lc = domain.characteristic_length();
    let offset = cfg.key_offset * lc;
    let jitter = cfg.key_jitter * lc;
    let mut rng = ChaCha8Rng::seed_from_u64(stream_seed(cfg.seed, STREAM_KEY, 0));

    let mut pts = Vec::new();
    for (i, &v) in domain.vertices().iter().enumerate() {
        let count = if domain.is_concave_vertex(i) {
            cfg.key_points_per_vertex * cfg.concave_multiplier
        } else {
            cfg.key_points_per_vertex
        };
        let dir = domain.inward_bisector(i);
        let base = [v[0] + offset * dir[0], v[1] + offset * dir[1]];
        for _ in 0..count {
            let mut p = base;
            for _ in 0..8 {
                let zx: f64 = StandardNormal.sample(&mut rng);
                let zy: f64 = StandardNormal.sample(&mut rng);
                let q = [base[0] + jitter * zx, base[1] + jitter * zy];
                if domain.contains(q) {
                    p = q;
                    break;
                }
            }
            if domain.contains(p) {
                pts.extend_from_slice(&p);
            }
        }
    }
    let n = pts.len() / 2;
    Array2::from_shape_vec((n, 2), pts).unwrap_or_else(|_| Array2::zeros((0, 2)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn unit_params() -> PhysicalParams {
        PhysicalParams::new(1.0, 0.1, 1.0).unwrap()
    }

    #[test]
    fn all_points_lie_where_they_should() {
        let d = Domain::t_junction(4.0, 2.0, 1.0, 2.0).unwrap();
        let (set, warnings) = sample(&d, &unit_params(), &SamplerConfig::default(), 0).unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(set.interior.nrows(), 2_000);
        for row in set.interior.rows() {
            assert!(d.contains([row[0], row[1]]));
        }
        for row in set.key_points.rows() {
            assert!(d.contains([row[0], row[1]]));
        }
        for (i, row) in set.boundary.coords.rows().into_iter().enumerate() {
            assert!(d.distance_to_boundary([row[0], row[1]]) < 1e-12, "row {i}");
        }
    }

    #[test]
    fn short_segments_get_the_floor() {
        // Outlet is 1/100 of the perimeter.
        let d = Domain::rectangle(50.0, 1.0).unwrap();
        let cfg = SamplerConfig {
            boundary: 100,
            min_per_segment: 10,
            ..SamplerConfig::default()
        };
        let (set, _) = sample(&d, &unit_params(), &cfg, 0).unwrap();
        assert_eq!(set.boundary.rows_tagged(BoundaryTag::Outlet).len(), 10);
        assert_eq!(set.boundary.rows_tagged(BoundaryTag::Inlet).len(), 10);
    }

    #[test]
    fn concave_vertices_get_more_key_points() {
        let d = Domain::t_junction(4.0, 2.0, 1.0, 2.0).unwrap();
        let cfg = SamplerConfig {
            key_jitter: 0.0,
            ..SamplerConfig::default()
        };
        let (set, _) = sample(&d, &unit_params(), &cfg, 0).unwrap();
        // 6 convex corners × 4 + 2 reentrant corners × 16.
        assert_eq!(set.key_points.nrows(), 6 * 4 + 2 * 16);
    }

    #[test]
    fn inlet_targets_follow_the_parabolic_profile() {
        let d = Domain::rectangle(2.0, 1.0).unwrap();
        let (set, _) = sample(&d, &unit_params(), &SamplerConfig::default(), 0).unwrap();
        let b = &set.boundary;
        for i in b.rows_tagged(BoundaryTag::Inlet) {
            let y = b.coords[[i, 1]];
            let expected = 6.0 * y * (1.0 - y);
            assert!((b.velocity_targets[[i, 0]] - expected).abs() < 1e-12);
            assert_eq!(b.velocity_targets[[i, 1]], 0.0);
        }
        for i in b.rows_tagged(BoundaryTag::Wall) {
            assert_eq!(b.velocity_targets[[i, 0]], 0.0);
        }
    }

    #[test]
    fn oversized_requests_are_clamped_with_a_warning() {
        let d = Domain::rectangle(1.0, 1.0).unwrap();
        let cfg = SamplerConfig {
            interior: 5_000,
            min_spacing: 0.25,
            ..SamplerConfig::default()
        };
        let (set, warnings) = sample(&d, &unit_params(), &cfg, 0).unwrap();
        // l_c = 0.5, spacing 0.125: at most 64 interior points.
        assert_eq!(set.interior.nrows(), 64);
        assert!(warnings.iter().any(|w| matches!(
            w,
            Warning::SamplingDegraded { what, requested: 5_000, granted: 64 } if what == "interior"
        )));
    }

    #[test]
    fn resampling_changes_interior_only() {
        let d = Domain::y_junction(2.0, 2.0, 1.0, 30.0).unwrap();
        let cfg = SamplerConfig {
            distribution: InteriorDistribution::Halton,
            ..SamplerConfig::default()
        };
        let (a, _) = sample(&d, &unit_params(), &cfg, 0).unwrap();
        let mut b = a.clone();
        resample_interior(&mut b, &d, &cfg, 1);
        assert_ne!(a.interior, b.interior);
        assert_eq!(a.boundary, b.boundary);
        assert_eq!(a.key_points, b.key_points);
        assert_eq!(b.epoch, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 16, .. ProptestConfig::default() })]

        #[test]
        fn prop_same_seed_same_set(
            seed in any::<u64>(),
            epoch in 0u64..100,
            halton in any::<bool>(),
            width in 0.2f64..2.0,
        ) {
            let d = Domain::rectangle(3.0, width).unwrap();
            let cfg = SamplerConfig {
                interior: 300,
                boundary: 60,
                seed,
                distribution: if halton { InteriorDistribution::Halton } else { InteriorDistribution::Uniform },
                ..SamplerConfig::default()
            };
            let (a, wa) = sample(&d, &unit_params(), &cfg, epoch).unwrap();
            let (b, wb) = sample(&d, &unit_params(), &cfg, epoch).unwrap();
            prop_assert_eq!(a, b);
            prop_assert_eq!(wa, wb);
        }
    }
}
