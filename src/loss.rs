//! Composite training objective.
//!
//! `total = w_data·L_data + w_physics·L_physics + w_bc·L_bc`, where every term is a mean of
//! squared, non-dimensionalized errors:
//!
//! - `L_data`: observed `(u, v, p)` components, velocities over `v_in`, pressure over `μ v_in/l_c`;
//! - `L_physics`: per collocation point, `(r_c D/v_in)² + (r_x l_c²/(μ v_in))² + (r_y l_c²/(μ v_in))²`
//!   with `D` the domain extent;
//! - `L_bc`: per boundary point, the Dirichlet velocity error over `v_in` on inlets and walls;
//!   on outlets, the pressure error over `μ v_in/l_c` plus `(∂u_n/∂n · l_c/v_in)²`. Points are
//!   averaged within each tag first and the tag means are then averaged, so a short inlet
//!   counts as much as long walls.
//!
//! The weights come from a [`WeightSchedule`], which is either fixed or a monotone,
//! threshold-gated sequence of phases.

use crate::field::{Jet, TrainableField, P, U, V};
use crate::geometry::BoundaryTag;
use crate::measurements::MeasurementSet;
use crate::params::{PhysicalParams, Scales};
use crate::residual::{self, Residuals};
use crate::sampler::CollocationSet;
use crate::{Error, Result};
use ndarray::{concatenate, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Multipliers of the three loss terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub data: f64,
    pub physics: f64,
    pub bc: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            data: 1.0,
            physics: 1.0,
            bc: 1.0,
        }
    }
}

impl LossWeights {
    pub fn validate(&self) -> Result<()> {
        for (name, w) in [("data", self.data), ("physics", self.physics), ("bc", self.bc)] {
            if !(w >= 0.0) || !w.is_finite() {
                return Err(Error::Config(format!(
                    "loss weight {name} must be non-negative and finite, got {w}"
                )));
            }
        }
        Ok(())
    }
}

/// Unweighted loss components plus the weighted total.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LossBreakdown {
    pub data: f64,
    pub physics: f64,
    pub bc: f64,
    pub total: f64,
}

/// Combine the three terms under `weights`.
pub fn compose(data: f64, physics: f64, bc: f64, weights: &LossWeights) -> LossBreakdown {
    LossBreakdown {
        data,
        physics,
        bc,
        total: weights.data * data + weights.physics * physics + weights.bc * bc,
    }
}

/// Mean normalized squared residual over the rows in `rows`, with its adjoint.
///
/// Returns `(L_physics, ∂L/∂continuity, ∂L/∂momentum_x, ∂L/∂momentum_y)`; adjoint entries
/// outside `rows` are zero.
pub fn physics_term(
    residuals: &Residuals,
    rows: std::ops::Range<usize>,
    scales: &Scales,
) -> (f64, Array1<f64>, Array1<f64>, Array1<f64>) {
    let n = residuals.len();
    let mut gc = Array1::zeros(n);
    let mut gx = Array1::zeros(n);
    let mut gy = Array1::zeros(n);
    if rows.is_empty() {
        return (0.0, gc, gx, gy);
    }
    let inv_n = 1.0 / rows.len() as f64;
    let (sc2, sm2) = (scales.continuity.powi(2), scales.momentum.powi(2));
    let mut loss = 0.0;
    for i in rows {
        let (rc, rx, ry) = (
            residuals.continuity[i],
            residuals.momentum_x[i],
            residuals.momentum_y[i],
        );
        loss += rc * rc / sc2 + (rx * rx + ry * ry) / sm2;
        gc[i] = 2.0 * rc / sc2 * inv_n;
        gx[i] = 2.0 * rx / sm2 * inv_n;
        gy[i] = 2.0 * ry / sm2 * inv_n;
    }
    (loss * inv_n, gc, gx, gy)
}

/// What each boundary row enforces, borrowed from a [`crate::sampler::BoundaryPoints`].
pub struct BoundaryRow {
    pub tag: BoundaryTag,
    pub normal: [f64; 2],
    pub velocity_target: [f64; 2],
}

fn tag_index(tag: BoundaryTag) -> usize {
    match tag {
        BoundaryTag::Inlet => 0,
        BoundaryTag::Outlet => 1,
        BoundaryTag::Wall => 2,
    }
}

/// Boundary violation over `rows` (jet rows `offset..offset + rows.len()`), accumulating
/// `scale · ∂L_bc/∂jet` into `adjoint`.
///
/// The result is the mean over the tags present of the per-tag mean squared violation.
pub fn boundary_term(
    jet: &Jet,
    offset: usize,
    rows: &[BoundaryRow],
    params: &PhysicalParams,
    scales: &Scales,
    scale: f64,
    adjoint: &mut Jet,
) -> f64 {
    let mut counts = [0usize; 3];
    for row in rows {
        counts[tag_index(row.tag)] += 1;
    }
    let groups = counts.iter().filter(|&&c| c > 0).count();
    if groups == 0 {
        return 0.0;
    }
    let row_weight = counts.map(|c| {
        if c == 0 {
            0.0
        } else {
            1.0 / (c * groups) as f64
        }
    });
    let sv = scales.velocity;
    let sp = scales.pressure;
    let sn = scales.length / scales.velocity;
    let mut loss = 0.0;
    for (k, row) in rows.iter().enumerate() {
        let i = offset + k;
        let inv_n = row_weight[tag_index(row.tag)];
        match row.tag {
            BoundaryTag::Inlet | BoundaryTag::Wall => {
                let eu = (jet.value[[i, U]] - row.velocity_target[0]) / sv;
                let ev = (jet.value[[i, V]] - row.velocity_target[1]) / sv;
                loss += (eu * eu + ev * ev) * inv_n;
                adjoint.value[[i, U]] += scale * 2.0 * eu / sv * inv_n;
                adjoint.value[[i, V]] += scale * 2.0 * ev / sv * inv_n;
            }
            BoundaryTag::Outlet => {
                let ep = (jet.value[[i, P]] - params.outlet_pressure) / sp;
                let [nx, ny] = row.normal;
                let dudn = nx * nx * jet.dx[[i, U]]
                    + nx * ny * (jet.dy[[i, U]] + jet.dx[[i, V]])
                    + ny * ny * jet.dy[[i, V]];
                let q = dudn * sn;
                loss += (ep * ep + q * q) * inv_n;
                adjoint.value[[i, P]] += scale * 2.0 * ep / sp * inv_n;
                let gq = scale * 2.0 * q * sn * inv_n;
                adjoint.dx[[i, U]] += gq * nx * nx;
                adjoint.dy[[i, U]] += gq * nx * ny;
                adjoint.dx[[i, V]] += gq * nx * ny;
                adjoint.dy[[i, V]] += gq * ny * ny;
            }
        }
    }
    loss
}

/// Mean normalized squared error over the observed components of `observed` (NaN marks an
/// unobserved component) against `predicted` (both `n × 3`, rows aligned).
///
/// Returns the loss and `∂L/∂predicted`.
pub fn data_term(
    predicted: &Array2<f64>,
    observed: &Array2<f64>,
    scales: &Scales,
) -> (f64, Array2<f64>) {
    let mut grad = Array2::zeros(predicted.raw_dim());
    let scale = [scales.velocity, scales.velocity, scales.pressure];
    let mut count = 0usize;
    let mut loss = 0.0;
    for i in 0..observed.nrows() {
        for j in 0..3 {
            let obs = observed[[i, j]];
            if obs.is_finite() {
                let e = (predicted[[i, j]] - obs) / scale[j];
                loss += e * e;
                grad[[i, j]] = 2.0 * e / scale[j];
                count += 1;
            }
        }
    }
    if count == 0 {
        return (0.0, grad);
    }
    let inv = 1.0 / count as f64;
    grad.mapv_inplace(|g| g * inv);
    (loss * inv, grad)
}

/// Result of one objective evaluation.
#[derive(Debug, Clone)]
pub struct LossEval {
    pub breakdown: LossBreakdown,
    /// Gradient of `breakdown.total` with respect to the flat field parameters.
    pub gradient: Option<Array1<f64>>,
    /// Rows discarded because the field or its residuals were not finite there.
    pub dropped: usize,
    /// Residual rows that survived; zero means the physics term could not be evaluated.
    pub kept_physics: usize,
}

/// Everything the objective needs besides the field and the collocation set.
#[derive(Debug, Clone, Copy)]
pub struct Objective<'a> {
    pub params: &'a PhysicalParams,
    pub scales: &'a Scales,
    pub measurements: Option<&'a MeasurementSet>,
}

impl<'a> Objective<'a> {
    /// Evaluate the composite loss (and optionally its parameter gradient) in one batched
    /// forward pass over residual, boundary, and measurement points.
    ///
    /// Rows whose outputs or residuals are not finite are dropped and the pass is redone on
    /// the remaining rows.
    pub fn evaluate<F: TrainableField>(
        &self,
        field: &F,
        set: &CollocationSet,
        weights: &LossWeights,
        with_gradient: bool,
    ) -> Result<LossEval> {
        let residual_pts = set.residual_points();
        let nr = residual_pts.nrows();
        let nb = set.boundary.len();
        let empty = Array2::<f64>::zeros((0, 2));
        let meas_coords = self.measurements.map_or(empty.view(), |m| m.coords());
        let nd = meas_coords.nrows();

        let coords = concatenate(
            Axis(0),
            &[residual_pts.view(), set.boundary.coords.view(), meas_coords],
        )
        .map_err(|_| Error::Shape("collocation coordinates must have two columns"))?;

        let (mut jet, mut tape) = field.forward_tape(&coords.view())?;
        let mut residuals =
            residual::navier_stokes(&jet, self.params.density, self.params.viscosity)?;

        let mut r_idx: Vec<usize> = (0..nr).collect();
        let mut b_idx: Vec<usize> = (0..nb).collect();
        let mut d_idx: Vec<usize> = (0..nd).collect();
        let finite_residuals = residuals.finite_mask();
        let ok = |i: usize| jet.row_is_finite(i) && (i >= nr || finite_residuals[i]);
        let dropped = (0..coords.nrows()).filter(|&i| !ok(i)).count();
        if dropped > 0 {
            r_idx.retain(|&i| ok(i));
            b_idx.retain(|&i| ok(nr + i));
            d_idx.retain(|&i| ok(nr + nb + i));
            let keep: Vec<usize> = r_idx
                .iter()
                .copied()
                .chain(b_idx.iter().map(|&i| nr + i))
                .chain(d_idx.iter().map(|&i| nr + nb + i))
                .collect();
            let kept_coords = coords.select(Axis(0), &keep);
            let (j, t) = field.forward_tape(&kept_coords.view())?;
            jet = j;
            tape = t;
            residuals = residual::navier_stokes(&jet, self.params.density, self.params.viscosity)?;
        }
        let (nr, nb) = (r_idx.len(), b_idx.len());

        let (l_phys, gc, gx, gy) = physics_term(&residuals, 0..nr, self.scales);

        let rows: Vec<BoundaryRow> = b_idx
            .iter()
            .map(|&i| BoundaryRow {
                tag: set.boundary.tags[i],
                normal: [set.boundary.normals[[i, 0]], set.boundary.normals[[i, 1]]],
                velocity_target: [
                    set.boundary.velocity_targets[[i, 0]],
                    set.boundary.velocity_targets[[i, 1]],
                ],
            })
            .collect();
        let mut adjoint = Jet::zeros(jet.nrows(), 3);
        let l_bc = boundary_term(
            &jet,
            nr,
            &rows,
            self.params,
            self.scales,
            weights.bc,
            &mut adjoint,
        );

        let mut l_data = 0.0;
        if let Some(m) = self.measurements {
            let observed = m.values().select(Axis(0), &d_idx);
            let predicted = jet
                .value
                .slice(ndarray::s![nr + nb.., ..])
                .to_owned();
            let (l, g) = data_term(&predicted, &observed, self.scales);
            l_data = l;
            for k in 0..g.nrows() {
                for j in 0..3 {
                    adjoint.value[[nr + nb + k, j]] += weights.data * g[[k, j]];
                }
            }
        }

        let breakdown = compose(l_data, l_phys, l_bc, weights);
        let gradient = if with_gradient {
            let wp = weights.physics;
            let g_phys = residual::adjoint(
                &jet,
                self.params.density,
                self.params.viscosity,
                &(wp * &gc).view(),
                &(wp * &gx).view(),
                &(wp * &gy).view(),
            );
            let total = Jet {
                value: adjoint.value + &g_phys.value,
                dx: adjoint.dx + &g_phys.dx,
                dy: adjoint.dy + &g_phys.dy,
                dxx: adjoint.dxx + &g_phys.dxx,
                dyy: adjoint.dyy + &g_phys.dyy,
            };
            Some(field.backward(&tape, &total))
        } else {
            None
        };

        Ok(LossEval {
            breakdown,
            gradient,
            dropped,
            kept_physics: nr,
        })
    }
}

/// Thresholds and levels of the adaptive schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveSchedule {
    /// Boundary weight while anchoring; `√bc_high` during the ramp.
    pub bc_high: f64,
    /// Physics weight while anchoring.
    pub physics_low: f64,
    /// Data weight, constant in every phase.
    pub data: f64,
    /// Anchor → Ramp once `L_bc` falls below this.
    pub bc_threshold: f64,
    /// Ramp → Balanced once `L_physics` falls below this.
    pub physics_threshold: f64,
    /// Maximum iterations spent in Anchor or Ramp before advancing anyway.
    pub max_phase_iters: usize,
}

impl Default for AdaptiveSchedule {
    fn default() -> Self {
        Self {
            bc_high: 100.0,
            physics_low: 0.01,
            data: 10.0,
            bc_threshold: 1e-2,
            physics_threshold: 1e-1,
            max_phase_iters: 2_000,
        }
    }
}

/// How loss weights evolve during the Adam stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WeightSchedule {
    Fixed(LossWeights),
    Adaptive(AdaptiveSchedule),
}

impl Default for WeightSchedule {
    fn default() -> Self {
        WeightSchedule::Adaptive(AdaptiveSchedule::default())
    }
}

impl WeightSchedule {
    pub fn validate(&self) -> Result<()> {
        match self {
            WeightSchedule::Fixed(w) => w.validate(),
            WeightSchedule::Adaptive(a) => {
                if !(a.bc_high >= 1.0) || !a.bc_high.is_finite() {
                    return Err(Error::Config("schedule.bc_high must be >= 1 and finite".into()));
                }
                if !(a.physics_low > 0.0 && a.physics_low <= 1.0) {
                    return Err(Error::Config("schedule.physics_low must be in (0, 1]".into()));
                }
                if !(a.data >= 0.0) || !a.data.is_finite() {
                    return Err(Error::Config(
                        "schedule.data must be non-negative and finite".into(),
                    ));
                }
                if !(a.bc_threshold > 0.0) || !(a.physics_threshold > 0.0) {
                    return Err(Error::Config("schedule thresholds must be positive".into()));
                }
                if a.max_phase_iters == 0 {
                    return Err(Error::Config("schedule.max_phase_iters must be >= 1".into()));
                }
                Ok(())
            }
        }
    }
}

/// Phase of the adaptive schedule. Phases only advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SchedulePhase {
    /// Boundary conditions dominate.
    Anchor,
    /// Physics at full weight, boundary weight reduced.
    Ramp,
    /// All terms at unit weight (data keeps its own level).
    Balanced,
}

/// A schedule together with its current phase; owned by one training run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleState {
    schedule: WeightSchedule,
    phase: SchedulePhase,
    phase_start: usize,
}

impl ScheduleState {
    pub fn new(schedule: WeightSchedule) -> Self {
        let phase = match schedule {
            WeightSchedule::Fixed(_) => SchedulePhase::Balanced,
            WeightSchedule::Adaptive(_) => SchedulePhase::Anchor,
        };
        Self {
            schedule,
            phase,
            phase_start: 0,
        }
    }

    pub fn phase(&self) -> SchedulePhase {
        self.phase
    }

    /// No further weight changes can happen.
    pub fn is_settled(&self) -> bool {
        matches!(self.schedule, WeightSchedule::Fixed(_)) || self.phase == SchedulePhase::Balanced
    }

    pub fn weights(&self) -> LossWeights {
        match self.schedule {
            WeightSchedule::Fixed(w) => w,
            WeightSchedule::Adaptive(a) => match self.phase {
                SchedulePhase::Anchor => LossWeights {
                    data: a.data,
                    physics: a.physics_low,
                    bc: a.bc_high,
                },
                SchedulePhase::Ramp => LossWeights {
                    data: a.data,
                    physics: 1.0,
                    bc: a.bc_high.sqrt(),
                },
                SchedulePhase::Balanced => LossWeights {
                    data: a.data,
                    physics: 1.0,
                    bc: 1.0,
                },
            },
        }
    }

    /// Feed the unweighted components observed at `iteration`; returns the new phase if
    /// this observation advanced the schedule.
    pub fn observe(&mut self, iteration: usize, losses: &LossBreakdown) -> Option<SchedulePhase> {
        let WeightSchedule::Adaptive(a) = self.schedule else {
            return None;
        };
        let stalled = iteration.saturating_sub(self.phase_start) >= a.max_phase_iters;
        let next = match self.phase {
            SchedulePhase::Anchor if losses.bc < a.bc_threshold || stalled => SchedulePhase::Ramp,
            SchedulePhase::Ramp if losses.physics < a.physics_threshold || stalled => {
                SchedulePhase::Balanced
            }
            _ => return None,
        };
        self.phase = next;
        self.phase_start = iteration;
        Some(next)
    }
}
