//! # pinnflow
//!
//! Physics-informed reconstruction of steady 2-D laminar flow in microchannels.
//!
//! A small network is treated as a continuous field \((x, y) \mapsto (u, v, p)\) and trained
//! against the incompressible Navier–Stokes equations instead of dense labels:
//!
//! \[
//! \nabla\cdot\mathbf{u} = 0,\qquad
//! \rho(\mathbf{u}\cdot\nabla)\mathbf{u} + \nabla p - \mu\nabla^2\mathbf{u} = 0,
//! \]
//!
//! plus the inlet / wall / outlet conditions of a tagged polygon, plus (optionally) a handful of
//! measured points. A calibration loop wraps training to estimate the fluid viscosity from those
//! measurements.
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: samplers, network initialization and training take a
//!   `seed` (directly or through their config). Same inputs + same seed give identical results.
//! - **No finite differences in the library**: spatial derivatives come from forward-mode jets
//!   through the network, parameter gradients from a reverse sweep over the recorded tape.
//! - **No hidden normalization**: every scale used to normalize a loss term is a field of
//!   [`params::Scales`] and documented where it is used.
//! - **Runs own their state**: a training run is a context object; nothing is process-wide, so
//!   independent runs (e.g. calibration candidates) can execute concurrently.
//!
//! ## Module map
//!
//! - `geometry`: tagged channel polygons (straight, T-junction, Y-junction) and validation
//! - `params`: physical parameters and characteristic scales
//! - `field`: the field capability traits, jets, and the MLP surrogate
//! - `residual`: continuity / momentum residuals and their adjoint
//! - `sampler`: interior, boundary and key-point collocation
//! - `loss`: composite loss and the adaptive weight schedule
//! - `optim`: Adam and L-BFGS on flat parameter vectors
//! - `trainer`: the staged training state machine
//! - `calibration`: viscosity estimation against sparse measurements
//! - `measurements`: measurement sets, table import, unit normalization
//! - `surrogate`: trained artifacts, queries, export
//! - `analytic`: plane Poiseuille reference field
//! - `config`: serializable run configuration

pub mod analytic;
pub mod calibration;
pub mod config;
pub mod field;
pub mod geometry;
pub mod loss;
pub mod measurements;
pub mod optim;
pub mod params;
pub mod residual;
pub mod sampler;
pub mod surrogate;
pub mod trainer;

use trainer::TrainState;

/// pinnflow error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("invalid geometry: {0}")]
    GeometryInvalid(String),
    #[error("invalid parameter: {0}")]
    ParameterInvalid(String),
    #[error("training diverged in {stage} at iteration {iteration}: {detail}")]
    DivergedTraining {
        stage: TrainState,
        iteration: usize,
        detail: String,
    },
    #[error(
        "no viscosity in [{lo:e}, {hi:e}] improves on the baseline data loss {baseline:e} (best {best:e})"
    )]
    CalibrationOutOfRange {
        lo: f64,
        hi: f64,
        baseline: f64,
        best: f64,
    },
    #[error("invalid measurement set: {0}")]
    Measurement(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    /// Stage and iteration at which a run-fatal error was detected.
    ///
    /// Geometry and parameter errors are reported at `(Init, 0)`.
    pub fn stage(&self) -> Option<(TrainState, usize)> {
        match self {
            Error::GeometryInvalid(_) | Error::ParameterInvalid(_) => Some((TrainState::Init, 0)),
            Error::DivergedTraining {
                stage, iteration, ..
            } => Some((*stage, *iteration)),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Non-fatal conditions recovered locally during a run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Warning {
    /// The sampler clamped a requested point count.
    SamplingDegraded {
        what: String,
        requested: usize,
        granted: usize,
    },
    /// Collocation points were discarded because their residuals were not finite.
    PointsDropped {
        stage: TrainState,
        iteration: usize,
        count: usize,
    },
}
