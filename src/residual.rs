//! Steady incompressible Navier–Stokes residuals.
//!
//! For a field jet `(u, v, p)` with first and pure second derivatives:
//!
//! - continuity: `∂u/∂x + ∂v/∂y`
//! - momentum-x: `ρ(u ∂u/∂x + v ∂u/∂y) + ∂p/∂x − μ(∂²u/∂x² + ∂²u/∂y²)`
//! - momentum-y: `ρ(u ∂v/∂x + v ∂v/∂y) + ∂p/∂y − μ(∂²v/∂x² + ∂²v/∂y²)`
//!
//! Residuals are a pure function of the jet and `(ρ, μ)`. The adjoint maps `∂L/∂r` back onto
//! the jet so training can continue the reverse sweep through the field.

use crate::field::{FieldModel, Jet, P, U, V};
use crate::params::Scales;
use crate::{Error, Result};
use ndarray::{Array1, ArrayView1, ArrayView2};

/// Per-point residuals of the three governing equations.
#[derive(Debug, Clone, PartialEq)]
pub struct Residuals {
    pub continuity: Array1<f64>,
    pub momentum_x: Array1<f64>,
    pub momentum_y: Array1<f64>,
}

impl Residuals {
    pub fn len(&self) -> usize {
        self.continuity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.continuity.is_empty()
    }

    /// `true` for rows whose three residuals are all finite.
    pub fn finite_mask(&self) -> Vec<bool> {
        (0..self.len())
            .map(|i| {
                self.continuity[i].is_finite()
                    && self.momentum_x[i].is_finite()
                    && self.momentum_y[i].is_finite()
            })
            .collect()
    }

    /// Root mean square of each normalized residual over the finite rows:
    /// `[continuity / (v_in/l_c), momentum_x / (μ v_in/l_c²), momentum_y / (μ v_in/l_c²)]`.
    pub fn normalized_rms(&self, scales: &Scales) -> [f64; 3] {
        let mask = self.finite_mask();
        let kept = mask.iter().filter(|&&k| k).count().max(1) as f64;
        let mut acc = [0.0; 3];
        for i in (0..self.len()).filter(|&i| mask[i]) {
            acc[0] += (self.continuity[i] / scales.continuity).powi(2);
            acc[1] += (self.momentum_x[i] / scales.momentum).powi(2);
            acc[2] += (self.momentum_y[i] / scales.momentum).powi(2);
        }
        acc.map(|a| (a / kept).sqrt())
    }
}

/// Residuals from a precomputed jet (`n × 3` columns `u, v, p`).
pub fn navier_stokes(jet: &Jet, density: f64, viscosity: f64) -> Result<Residuals> {
    if jet.ncols() != 3 {
        return Err(Error::Shape("field jet must have three columns (u, v, p)"));
    }
    let n = jet.nrows();
    let (rho, mu) = (density, viscosity);
    let mut rc = Array1::zeros(n);
    let mut rx = Array1::zeros(n);
    let mut ry = Array1::zeros(n);
    for i in 0..n {
        let (u, v) = (jet.value[[i, U]], jet.value[[i, V]]);
        let (ux, uy) = (jet.dx[[i, U]], jet.dy[[i, U]]);
        let (vx, vy) = (jet.dx[[i, V]], jet.dy[[i, V]]);
        let lap_u = jet.dxx[[i, U]] + jet.dyy[[i, U]];
        let lap_v = jet.dxx[[i, V]] + jet.dyy[[i, V]];
        rc[i] = ux + vy;
        rx[i] = rho * (u * ux + v * uy) + jet.dx[[i, P]] - mu * lap_u;
        ry[i] = rho * (u * vx + v * vy) + jet.dy[[i, P]] - mu * lap_v;
    }
    Ok(Residuals {
        continuity: rc,
        momentum_x: rx,
        momentum_y: ry,
    })
}

/// Evaluate the residuals of `field` at `coords` (`n × 2`).
pub fn evaluate<F: FieldModel + ?Sized>(
    field: &F,
    coords: &ArrayView2<f64>,
    density: f64,
    viscosity: f64,
) -> Result<Residuals> {
    let jet = field.predict_with_gradients(coords)?;
    navier_stokes(&jet, density, viscosity)
}

/// Pull `∂L/∂(continuity, momentum_x, momentum_y)` back to `∂L/∂jet`.
pub fn adjoint(
    jet: &Jet,
    density: f64,
    viscosity: f64,
    g_continuity: &ArrayView1<f64>,
    g_momentum_x: &ArrayView1<f64>,
    g_momentum_y: &ArrayView1<f64>,
) -> Jet {
    let n = jet.nrows();
    let (rho, mu) = (density, viscosity);
    let mut g = Jet::zeros(n, 3);
    for i in 0..n {
        let (ac, ax, ay) = (g_continuity[i], g_momentum_x[i], g_momentum_y[i]);
        let (u, v) = (jet.value[[i, U]], jet.value[[i, V]]);
        let (ux, uy) = (jet.dx[[i, U]], jet.dy[[i, U]]);
        let (vx, vy) = (jet.dx[[i, V]], jet.dy[[i, V]]);

        g.value[[i, U]] = rho * (ax * ux + ay * vx);
        g.value[[i, V]] = rho * (ax * uy + ay * vy);
        g.dx[[i, U]] = ac + ax * rho * u;
        g.dy[[i, U]] = ax * rho * v;
        g.dx[[i, V]] = ay * rho * u;
        g.dy[[i, V]] = ac + ay * rho * v;
        g.dx[[i, P]] = ax;
        g.dy[[i, P]] = ay;
        g.dxx[[i, U]] = -mu * ax;
        g.dyy[[i, U]] = -mu * ax;
        g.dxx[[i, V]] = -mu * ay;
        g.dyy[[i, V]] = -mu * ay;
    }
    g
}
