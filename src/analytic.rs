//! Plane Poiseuille flow: the exact steady solution in a straight channel.
//!
//! With mean velocity `V`, width `W`, and `η = (y − y₀)/W`:
//!
//! - `u = 6 V η (1 − η)` (peak `1.5 V` on the centreline)
//! - `v = 0`
//! - `p = p_out + 12 μ V (x_out − x) / W²`
//!
//! Used as a reference for trained surrogates and as an oracle in tests.

use crate::field::{check_coords, FieldModel, Jet, P, U};
use crate::geometry::Domain;
use crate::params::PhysicalParams;
use crate::Result;
use ndarray::ArrayView2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Poiseuille {
    /// `y` of the lower wall.
    y0: f64,
    width: f64,
    /// `x` of the outlet plane.
    x_out: f64,
    mean_velocity: f64,
    viscosity: f64,
    outlet_pressure: f64,
}

impl Poiseuille {
    /// Fully developed flow through the bounding box of `domain`, left to right.
    pub fn new(domain: &Domain, params: &PhysicalParams) -> Result<Self> {
        params.validate()?;
        let (lo, hi) = domain.bounding_box();
        Ok(Self {
            y0: lo[1],
            width: hi[1] - lo[1],
            x_out: hi[0],
            mean_velocity: params.inlet_velocity,
            viscosity: params.viscosity,
            outlet_pressure: params.outlet_pressure,
        })
    }

    pub fn peak_velocity(&self) -> f64 {
        1.5 * self.mean_velocity
    }

    /// Pressure gradient magnitude `12 μ V / W²`.
    pub fn pressure_gradient(&self) -> f64 {
        12.0 * self.viscosity * self.mean_velocity / (self.width * self.width)
    }

    /// Volumetric flux per unit depth, `V W`.
    pub fn flux(&self) -> f64 {
        self.mean_velocity * self.width
    }

    /// Same channel with a different viscosity. Velocities are unchanged; only pressure scales.
    pub fn with_viscosity(self, viscosity: f64) -> Self {
        Self { viscosity, ..self }
    }
}

impl FieldModel for Poiseuille {
    fn predict_with_gradients(&self, coords: &ArrayView2<f64>) -> Result<Jet> {
        check_coords(coords)?;
        let n = coords.nrows();
        let w = self.width;
        let vm = self.mean_velocity;
        let g = self.pressure_gradient();
        let mut jet = Jet::zeros(n, 3);
        for i in 0..n {
            let eta = (coords[[i, 1]] - self.y0) / w;
            jet.value[[i, U]] = 6.0 * vm * eta * (1.0 - eta);
            jet.dy[[i, U]] = 6.0 * vm * (1.0 - 2.0 * eta) / w;
            jet.dyy[[i, U]] = -12.0 * vm / (w * w);
            jet.value[[i, P]] = self.outlet_pressure + g * (self.x_out - coords[[i, 0]]);
            jet.dx[[i, P]] = -g;
        }
        Ok(jet)
    }
}
