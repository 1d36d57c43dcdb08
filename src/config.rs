//! Serializable run configuration.
//!
//! Every section has defaults, so a config file only names what it changes:
//!
//! ```json
//! {
//!   "domain": { "kind": "t_junction", "main_length": 0.01, "branch_length": 0.004,
//!               "width": 0.0002, "junction_x": 0.005 },
//!   "train": { "adam": { "max_iters": 3000 } },
//!   "viscosity_range": [0.0002, 0.005]
//! }
//! ```

use crate::calibration::{CalibrationConfig, PinnFitter};
use crate::field::MlpConfig;
use crate::geometry::{Domain, DomainSpec};
use crate::params::{PhysicalParams, StandardCase};
use crate::trainer::TrainConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where the domain comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainConfig {
    /// One of the [`StandardCase`] straight channels, by name (`"v0.8_w200"`). Also supplies the
    /// inlet velocity unless `physics` is given.
    Case { name: String },
    Rectangle {
        length: f64,
        width: f64,
    },
    TJunction {
        main_length: f64,
        branch_length: f64,
        width: f64,
        junction_x: f64,
    },
    YJunction {
        inlet_length: f64,
        branch_length: f64,
        width: f64,
        angle_deg: f64,
    },
    /// Explicit vertices and tagged segments.
    Polygon(DomainSpec),
}

impl Default for DomainConfig {
    fn default() -> Self {
        DomainConfig::Case {
            name: StandardCase::V08W200.name().to_string(),
        }
    }
}

impl DomainConfig {
    fn case(&self) -> Result<Option<StandardCase>> {
        match self {
            DomainConfig::Case { name } => StandardCase::from_name(name)
                .map(Some)
                .ok_or_else(|| Error::Config(format!("unknown standard case {name:?}"))),
            _ => Ok(None),
        }
    }

    pub fn build(&self) -> Result<Domain> {
        match self {
            DomainConfig::Case { .. } => match self.case()? {
                Some(case) => Ok(case.setup()?.0),
                None => Err(Error::Config("standard case lookup failed".into())),
            },
            DomainConfig::Rectangle { length, width } => Domain::rectangle(*length, *width),
            DomainConfig::TJunction {
                main_length,
                branch_length,
                width,
                junction_x,
            } => Domain::t_junction(*main_length, *branch_length, *width, *junction_x),
            DomainConfig::YJunction {
                inlet_length,
                branch_length,
                width,
                angle_deg,
            } => Domain::y_junction(*inlet_length, *branch_length, *width, *angle_deg),
            DomainConfig::Polygon(spec) => Domain::try_from(spec.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub domain: DomainConfig,
    /// Physical parameters. Defaults to water (with the case's inlet velocity for a standard
    /// case).
    pub physics: Option<PhysicalParams>,
    pub network: MlpConfig,
    pub train: TrainConfig,
    pub calibration: CalibrationConfig,
    /// Viscosity search range `(μ_lo, μ_hi)`; calibration runs only when set.
    pub viscosity_range: Option<(f64, f64)>,
    /// Measurement table (`x y u v p`) to reconstruct from or calibrate against.
    pub measurements: Option<PathBuf>,
}

impl RunConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_json_str(&s)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks every section without building the domain.
    pub fn validate(&self) -> Result<()> {
        self.domain.case()?;
        if let Some(p) = &self.physics {
            p.validate()?;
        }
        if self.network.hidden.is_empty() || self.network.hidden.contains(&0) {
            return Err(Error::Config(
                "network.hidden must list at least one non-empty layer".into(),
            ));
        }
        self.train.validate()?;
        self.calibration.validate()?;
        if let Some((lo, hi)) = self.viscosity_range {
            if !(lo > 0.0) || !(hi > lo) || !hi.is_finite() {
                return Err(Error::Config(format!(
                    "viscosity_range must satisfy 0 < lo < hi < inf, got ({lo}, {hi})"
                )));
            }
        }
        Ok(())
    }

    /// Domain and physical parameters for this run.
    pub fn setup(&self) -> Result<(Domain, PhysicalParams)> {
        let domain = self.domain.build()?;
        let params = match (&self.physics, self.domain.case()?) {
            (Some(p), _) => *p,
            (None, Some(case)) => case.setup()?.1,
            (None, None) => PhysicalParams::default(),
        };
        params.validate()?;
        Ok((domain, params))
    }

    pub fn fitter(&self) -> PinnFitter {
        PinnFitter {
            network: self.network.clone(),
            train: self.train.clone(),
            train_on_measurements: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundaryTag;
    use approx::assert_relative_eq;

    #[test]
    fn empty_config_is_the_default_case() {
        let cfg = RunConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, RunConfig::default());
        let (d, p) = cfg.setup().unwrap();
        assert_relative_eq!(p.inlet_velocity, 0.0077);
        let (lo, hi) = d.bounding_box();
        assert_relative_eq!(hi[0] - lo[0], 0.01);
        assert_relative_eq!(hi[1] - lo[1], 200e-6, max_relative = 1e-12);
    }

    #[test]
    fn partial_sections_keep_their_defaults() {
        let cfg = RunConfig::from_json_str(
            r#"{
                "domain": { "kind": "t_junction", "main_length": 4.0, "branch_length": 2.0,
                            "width": 1.0, "junction_x": 2.0 },
                "physics": { "density": 1.0, "viscosity": 0.1, "inlet_velocity": 1.0 },
                "train": { "adam": { "max_iters": 300 } },
                "viscosity_range": [0.01, 1.0]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.train.adam.max_iters, 300);
        assert_eq!(cfg.train.adam.resample_every, 500);
        assert_eq!(cfg.network, MlpConfig::default());
        let (d, p) = cfg.setup().unwrap();
        assert_eq!(d.segments_tagged(BoundaryTag::Outlet).count(), 2);
        assert_eq!(p.viscosity, 0.1);
        assert_eq!(cfg.fitter().train, cfg.train);
    }

    #[test]
    fn explicit_polygon_is_validated() {
        let good = r#"{ "domain": { "kind": "polygon",
            "vertices": [[0,0],[1,0],[1,1],[0,1]],
            "segments": [
                {"start":0,"end":1,"tag":"Wall","label":"W1"},
                {"start":1,"end":2,"tag":"Outlet","label":"O"},
                {"start":2,"end":3,"tag":"Wall","label":"W2"},
                {"start":3,"end":0,"tag":"Inlet","label":"I"}
            ] } }"#;
        let cfg = RunConfig::from_json_str(good).unwrap();
        assert_relative_eq!(cfg.setup().unwrap().0.area(), 1.0);

        // Edge 2→3 tagged twice and edge 3→0 left bare.
        let open = good.replace(
            r#""start":3,"end":0,"tag":"Inlet""#,
            r#""start":2,"end":3,"tag":"Inlet""#,
        );
        let cfg = RunConfig::from_json_str(&open).unwrap();
        assert!(matches!(cfg.setup(), Err(Error::GeometryInvalid(_))));
    }

    #[test]
    fn bad_values_are_rejected() {
        for bad in [
            r#"{ "domain": { "kind": "case", "name": "v9_w1" } }"#,
            r#"{ "viscosity_range": [0.01, 0.001] }"#,
            r#"{ "network": { "hidden": [] } }"#,
            r#"{ "train": { "adam": { "resample_every": 0 } } }"#,
            r#"{ "physics": { "density": -1.0, "viscosity": 0.1, "inlet_velocity": 1.0 } }"#,
        ] {
            assert!(RunConfig::from_json_str(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn file_round_trip() {
        let cfg = RunConfig {
            viscosity_range: Some((2e-4, 5e-3)),
            ..RunConfig::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, cfg.to_json_pretty().unwrap()).unwrap();
        assert_eq!(RunConfig::from_path(&path).unwrap(), cfg);
    }
}
