//! Physical parameters and the characteristic scales derived from them.

use crate::geometry::Domain;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Velocity profile imposed on inlet segments (along the inward normal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InletProfile {
    /// Fully developed plane Poiseuille profile with mean `v_in` (peak `1.5·v_in`).
    #[default]
    Parabolic,
    /// Plug flow `v_in` across the whole inlet.
    Uniform,
}

impl InletProfile {
    /// Normal velocity at fractional position `s ∈ [0, 1]` along the inlet segment.
    #[inline]
    pub fn speed(self, v_in: f64, s: f64) -> f64 {
        match self {
            InletProfile::Parabolic => 6.0 * v_in * s * (1.0 - s),
            InletProfile::Uniform => v_in,
        }
    }
}

/// Fluid properties and operating point, fixed for a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalParams {
    /// Density ρ (kg/m³).
    pub density: f64,
    /// Dynamic viscosity μ (Pa·s).
    pub viscosity: f64,
    /// Mean inlet velocity magnitude (m/s).
    pub inlet_velocity: f64,
    /// Outlet reference pressure (Pa).
    #[serde(default)]
    pub outlet_pressure: f64,
    #[serde(default)]
    pub inlet_profile: InletProfile,
}

impl Default for PhysicalParams {
    /// Water in a microchannel at 0.77 cm/s.
    fn default() -> Self {
        Self {
            density: 1000.0,
            viscosity: 1e-3,
            inlet_velocity: 0.0077,
            outlet_pressure: 0.0,
            inlet_profile: InletProfile::Parabolic,
        }
    }
}

impl PhysicalParams {
    pub fn new(density: f64, viscosity: f64, inlet_velocity: f64) -> Result<Self> {
        let p = Self {
            density,
            viscosity,
            inlet_velocity,
            ..Self::default()
        };
        p.validate()?;
        Ok(p)
    }

    /// ρ, μ, v_in must be positive and finite; p_out finite.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("density", self.density),
            ("viscosity", self.viscosity),
            ("inlet velocity", self.inlet_velocity),
        ];
        for (name, x) in positive {
            if !(x > 0.0) || !x.is_finite() {
                return Err(Error::ParameterInvalid(format!(
                    "{name} must be positive and finite, got {x}"
                )));
            }
        }
        if !self.outlet_pressure.is_finite() {
            return Err(Error::ParameterInvalid(
                "outlet pressure must be finite".into(),
            ));
        }
        Ok(())
    }

    pub fn with_viscosity(self, viscosity: f64) -> Self {
        Self { viscosity, ..self }
    }

    /// Reynolds number `ρ·v_in·l/μ` for a length `l`.
    pub fn reynolds(&self, length: f64) -> f64 {
        self.density * self.inlet_velocity * length / self.viscosity
    }
}

/// Characteristic scales used to normalize every loss term and the network output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scales {
    /// `l_c = 2·area/perimeter`.
    pub length: f64,
    /// `v_in`.
    pub velocity: f64,
    /// `μ·v_in/l_c`.
    pub pressure: f64,
    /// Pressure unit of the network output: `12·μ·v_in·extent/l_c²`, the plane Poiseuille
    /// drop across the whole domain.
    pub pressure_output: f64,
    /// `v_in/extent`, for the continuity residual: a unit residual is a flux change of the
    /// order of the inflow across the whole domain.
    pub continuity: f64,
    /// `μ·v_in/l_c²`, for the momentum residuals.
    pub momentum: f64,
}

impl Scales {
    pub fn new(domain: &Domain, params: &PhysicalParams) -> Self {
        let l = domain.characteristic_length();
        let (lo, hi) = domain.bounding_box();
        let span = (hi[0] - lo[0]).max(hi[1] - lo[1]);
        let v = params.inlet_velocity;
        let mu = params.viscosity;
        Self {
            length: l,
            velocity: v,
            pressure: mu * v / l,
            pressure_output: 12.0 * mu * v * span / (l * l),
            continuity: v / span,
            momentum: mu * v / (l * l),
        }
    }
}

/// Operating points of the reference microchannel dataset (`L = 10 mm`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StandardCase {
    V02W150,
    V08W150,
    V15W150,
    V02W200,
    V08W200,
    V15W200,
    V02W250,
    V08W250,
    V15W250,
}

impl StandardCase {
    pub const ALL: [StandardCase; 9] = [
        StandardCase::V02W150,
        StandardCase::V08W150,
        StandardCase::V15W150,
        StandardCase::V02W200,
        StandardCase::V08W200,
        StandardCase::V15W200,
        StandardCase::V02W250,
        StandardCase::V08W250,
        StandardCase::V15W250,
    ];

    /// Channel length (m).
    pub const LENGTH: f64 = 0.01;

    /// Inlet velocity (m/s).
    pub fn inlet_velocity(self) -> f64 {
        use StandardCase::*;
        match self {
            V02W150 | V02W200 | V02W250 => 0.0015,
            V08W150 | V08W200 | V08W250 => 0.0077,
            V15W150 | V15W200 | V15W250 => 0.0154,
        }
    }

    /// Channel width (m).
    pub fn width(self) -> f64 {
        use StandardCase::*;
        match self {
            V02W150 | V08W150 | V15W150 => 150e-6,
            V02W200 | V08W200 | V15W200 => 200e-6,
            V02W250 | V08W250 | V15W250 => 250e-6,
        }
    }

    /// Case name as used in the dataset files, e.g. `v0.8_w200`.
    pub fn name(self) -> &'static str {
        use StandardCase::*;
        match self {
            V02W150 => "v0.2_w150",
            V08W150 => "v0.8_w150",
            V15W150 => "v1.5_w150",
            V02W200 => "v0.2_w200",
            V08W200 => "v0.8_w200",
            V15W200 => "v1.5_w200",
            V02W250 => "v0.2_w250",
            V08W250 => "v0.8_w250",
            V15W250 => "v1.5_w250",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Straight channel and water properties for this case.
    pub fn setup(self) -> Result<(Domain, PhysicalParams)> {
        let domain = Domain::rectangle(Self::LENGTH, self.width())?;
        let params = PhysicalParams {
            inlet_velocity: self.inlet_velocity(),
            ..PhysicalParams::default()
        };
        Ok((domain, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_parameters_are_rejected() {
        assert!(PhysicalParams::new(1000.0, 1e-3, 0.0077).is_ok());
        for (rho, mu, v) in [
            (0.0, 1e-3, 0.01),
            (1000.0, -1e-3, 0.01),
            (1000.0, 1e-3, f64::NAN),
            (f64::INFINITY, 1e-3, 0.01),
        ] {
            let err = PhysicalParams::new(rho, mu, v).unwrap_err();
            assert!(matches!(err, Error::ParameterInvalid(_)), "{err}");
        }
    }

    #[test]
    fn parabolic_profile_has_mean_v_in_and_peak_one_and_a_half() {
        let n = 10_000;
        let mut mean = 0.0;
        for i in 0..n {
            let s = (i as f64 + 0.5) / n as f64;
            mean += InletProfile::Parabolic.speed(2.0, s);
        }
        mean /= n as f64;
        assert!((mean - 2.0).abs() < 1e-6, "mean={mean}");
        assert!((InletProfile::Parabolic.speed(2.0, 0.5) - 3.0).abs() < 1e-12);
        assert_eq!(InletProfile::Parabolic.speed(2.0, 0.0), 0.0);
    }

    #[test]
    fn scales_for_reference_microchannel() {
        let d = Domain::rectangle(0.01, 0.0002).unwrap();
        let p = PhysicalParams::default();
        let s = Scales::new(&d, &p);
        assert_eq!(s.velocity, 0.0077);
        assert!((s.pressure - 1e-3 * 0.0077 / s.length).abs() < 1e-15);
        // Low Reynolds number regime.
        assert!(p.reynolds(0.0002) < 2.0);
    }

    #[test]
    fn network_pressure_unit_matches_the_channel_drop() {
        // Slender channel: l_c ≈ W, so the unit is within a few percent of 12 μ v L / W².
        let (d, p) = StandardCase::V08W200.setup().unwrap();
        let s = Scales::new(&d, &p);
        let w = StandardCase::V08W200.width();
        let drop = 12.0 * p.viscosity * p.inlet_velocity * StandardCase::LENGTH / (w * w);
        let ratio = s.pressure_output / drop;
        assert!(ratio > 1.0 && ratio < 1.1, "{ratio}");
        // Continuity is measured against the inflow over the channel length, not the width.
        assert!((s.continuity - p.inlet_velocity / StandardCase::LENGTH).abs() < 1e-15);
    }

    #[test]
    fn standard_cases_resolve_by_name() {
        for c in StandardCase::ALL {
            assert_eq!(StandardCase::from_name(c.name()), Some(c));
            let (d, p) = c.setup().unwrap();
            assert!(p.validate().is_ok());
            assert!((d.area() - StandardCase::LENGTH * c.width()).abs() < 1e-15);
        }
        assert_eq!(StandardCase::from_name("v9_w1"), None);
    }
}
