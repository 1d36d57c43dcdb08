//! Viscosity calibration against sparse measurements.
//!
//! For each candidate viscosity a surrogate is fitted and scored by its data loss against the
//! measurements. The search is derivative-free:
//!
//! 1. a coarse, log-spaced scan over `[μ_lo, μ_hi]`, with candidates fitted in parallel;
//! 2. golden-section search in `ln μ` on the bracket around the best coarse candidate;
//! 3. a final fit at the estimate, which is the surrogate handed back.
//!
//! Data losses are always computed with the scales of the base parameters, so candidates are
//! compared on the same footing. A candidate that cannot beat the zero-flow baseline (every
//! velocity zero, pressure at the outlet reference) is no estimate at all.

use crate::analytic::Poiseuille;
use crate::field::{FieldModel, Mlp, MlpConfig};
use crate::geometry::Domain;
use crate::loss;
use crate::measurements::MeasurementSet;
use crate::params::{PhysicalParams, Scales};
use crate::surrogate::TrainedSurrogate;
use crate::trainer::{self, TrainConfig};
use crate::{Error, Result};
use log::{debug, info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Inverse of the golden ratio.
const INV_PHI: f64 = 0.618_033_988_749_894_9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Size of the coarse log-spaced scan (at least 2; both range ends are included).
    pub coarse_candidates: usize,
    /// Golden-section iteration cap.
    pub golden_iters: usize,
    /// Golden-section stops once the bracket is narrower than this in `ln μ`.
    pub log_tol: f64,
    /// Start later fits from the best surrogate so far. Every fit still trains to convergence.
    pub warm_start: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            coarse_candidates: 7,
            golden_iters: 12,
            log_tol: 1e-2,
            warm_start: false,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.coarse_candidates < 2 {
            return Err(Error::Config(
                "calibration.coarse_candidates must be >= 2".into(),
            ));
        }
        if !(self.log_tol > 0.0) || !self.log_tol.is_finite() {
            return Err(Error::Config(
                "calibration.log_tol must be positive and finite".into(),
            ));
        }
        Ok(())
    }
}

/// Produces a surrogate for one candidate parameter set.
///
/// Implementations must not share mutable state between calls: coarse candidates are fitted
/// concurrently.
pub trait CandidateFitter: Sync {
    type Field: FieldModel + Clone + Send + Sync;

    fn fit(
        &self,
        domain: &Domain,
        params: &PhysicalParams,
        measurements: &MeasurementSet,
        warm_start: Option<&Self::Field>,
    ) -> Result<TrainedSurrogate<Self::Field>>;
}

/// Fits a physics-informed [`Mlp`] at each candidate viscosity with the training controller.
///
/// By default a candidate is a pure forward solve and only its score sees the measurements.
/// With `train_on_measurements` they also enter training as the data term, which pulls every
/// candidate toward the data and flattens the viscosity response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinnFitter {
    pub network: MlpConfig,
    pub train: TrainConfig,
    pub train_on_measurements: bool,
}

impl CandidateFitter for PinnFitter {
    type Field = Mlp;

    fn fit(
        &self,
        domain: &Domain,
        params: &PhysicalParams,
        measurements: &MeasurementSet,
        warm_start: Option<&Mlp>,
    ) -> Result<TrainedSurrogate<Mlp>> {
        let m = self.train_on_measurements.then_some(measurements);
        let out = match warm_start {
            Some(net) => {
                let mut net = net.clone();
                net.rescale_outputs(&Scales::new(domain, params), params);
                trainer::train(domain, params, net, m, &self.train)?
            }
            None => trainer::train_pinn(domain, params, &self.network, m, &self.train)?,
        };
        debug!(
            "pinn fit at mu={:e}: {:?} after {} records",
            params.viscosity,
            out.termination,
            out.trace.len()
        );
        Ok(out.surrogate)
    }
}

/// Plane Poiseuille flow at each candidate viscosity. No training; useful as a fast baseline
/// for straight channels where the flow is known to be fully developed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoiseuilleFitter;

impl CandidateFitter for PoiseuilleFitter {
    type Field = Poiseuille;

    fn fit(
        &self,
        domain: &Domain,
        params: &PhysicalParams,
        _measurements: &MeasurementSet,
        _warm_start: Option<&Poiseuille>,
    ) -> Result<TrainedSurrogate<Poiseuille>> {
        let field = Poiseuille::new(domain, params)?;
        Ok(TrainedSurrogate::new(field, domain.clone(), *params))
    }
}

/// One scored candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateEval {
    pub viscosity: f64,
    pub data_loss: f64,
}

#[derive(Debug, Clone)]
pub struct Calibration<F> {
    pub viscosity: f64,
    /// Data loss of `surrogate`.
    pub data_loss: f64,
    /// Data loss of the zero-flow baseline.
    pub baseline_loss: f64,
    /// Surrogate from the final fit at `viscosity`.
    pub surrogate: TrainedSurrogate<F>,
    /// Every candidate scored, in evaluation order (the final fit last).
    pub evaluations: Vec<CandidateEval>,
}

/// Borrowed inputs shared by every candidate fit.
struct Search<'a, C: CandidateFitter> {
    fitter: &'a C,
    domain: &'a Domain,
    base: &'a PhysicalParams,
    scales: Scales,
    measurements: &'a MeasurementSet,
}

impl<C: CandidateFitter> Search<'_, C> {
    fn score(
        &self,
        viscosity: f64,
        warm: Option<&C::Field>,
    ) -> Result<(CandidateEval, TrainedSurrogate<C::Field>)> {
        let params = self.base.with_viscosity(viscosity);
        let surrogate = self.fitter.fit(self.domain, &params, self.measurements, warm)?;
        let l = surrogate.data_loss(self.measurements, &self.scales)?;
        let data_loss = if l.is_finite() { l } else { f64::INFINITY };
        debug!("calibration candidate mu={viscosity:e} data_loss={data_loss:e}");
        Ok((
            CandidateEval {
                viscosity,
                data_loss,
            },
            surrogate,
        ))
    }
}

fn zero_flow_loss(measurements: &MeasurementSet, params: &PhysicalParams, scales: &Scales) -> f64 {
    let mut pred = Array2::zeros((measurements.len(), 3));
    pred.column_mut(2).fill(params.outlet_pressure);
    loss::data_term(&pred, &measurements.values().to_owned(), scales).0
}

/// Estimate the viscosity in `range` that best explains `measurements`.
///
/// `base` supplies every other physical parameter (and the scales used for scoring).
pub fn calibrate<C: CandidateFitter>(
    fitter: &C,
    domain: &Domain,
    base: &PhysicalParams,
    measurements: &MeasurementSet,
    range: (f64, f64),
    cfg: &CalibrationConfig,
) -> Result<Calibration<C::Field>> {
    cfg.validate()?;
    base.validate()?;
    let (lo, hi) = range;
    if !(lo > 0.0) || !(hi > lo) || !hi.is_finite() {
        return Err(Error::ParameterInvalid(format!(
            "viscosity range must satisfy 0 < lo < hi < inf, got ({lo:e}, {hi:e})"
        )));
    }
    if measurements.is_empty() {
        return Err(Error::Measurement("calibration needs measurements".into()));
    }

    let search = Search {
        fitter,
        domain,
        base,
        scales: Scales::new(domain, base),
        measurements,
    };
    let baseline = zero_flow_loss(measurements, base, &search.scales);
    let (ln_lo, ln_hi) = (lo.ln(), hi.ln());
    let n = cfg.coarse_candidates;
    let grid: Vec<f64> = (0..n)
        .map(|i| (ln_lo + (ln_hi - ln_lo) * i as f64 / (n - 1) as f64).exp())
        .collect();

    // Coarse scan: independent fits, in parallel.
    let coarse: Vec<(CandidateEval, TrainedSurrogate<C::Field>)> = grid
        .par_iter()
        .map(|&mu| search.score(mu, None))
        .collect::<Result<_>>()?;
    let mut evaluations: Vec<CandidateEval> = coarse.iter().map(|(e, _)| *e).collect();
    let mut best_i = 0;
    for (i, e) in evaluations.iter().enumerate() {
        if e.data_loss < evaluations[best_i].data_loss {
            best_i = i;
        }
    }
    let mut best = evaluations[best_i];
    let mut best_field = if cfg.warm_start {
        coarse
            .into_iter()
            .nth(best_i)
            .map(|(_, s)| s.into_field())
    } else {
        None
    };
    info!(
        "calibration coarse scan: best mu={:e} (data_loss={:e}, baseline={baseline:e})",
        best.viscosity, best.data_loss
    );

    // Golden-section refinement on the neighbouring grid cells.
    let mut a = grid[best_i.saturating_sub(1)].ln();
    let mut b = grid[(best_i + 1).min(n - 1)].ln();
    let mut c = b - INV_PHI * (b - a);
    let mut d = a + INV_PHI * (b - a);
    let mut fc: Option<f64> = None;
    let mut fd: Option<f64> = None;
    for _ in 0..cfg.golden_iters {
        if b - a < cfg.log_tol {
            break;
        }
        for (x, fx) in [(c, &mut fc), (d, &mut fd)] {
            if fx.is_none() {
                let (e, s) = search.score(x.exp(), best_field.as_ref())?;
                evaluations.push(e);
                if e.data_loss < best.data_loss {
                    best = e;
                    if cfg.warm_start {
                        best_field = Some(s.into_field());
                    }
                }
                *fx = Some(e.data_loss);
            }
        }
        let (vc, vd) = (fc.unwrap_or(f64::INFINITY), fd.unwrap_or(f64::INFINITY));
        if vc <= vd {
            b = d;
            d = c;
            fd = fc;
            c = b - INV_PHI * (b - a);
            fc = None;
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + INV_PHI * (b - a);
            fd = None;
        }
    }

    let (final_eval, surrogate) = search.score(best.viscosity, best_field.as_ref())?;
    evaluations.push(final_eval);
    if !(final_eval.data_loss < baseline) {
        return Err(Error::CalibrationOutOfRange {
            lo,
            hi,
            baseline,
            best: final_eval.data_loss.min(best.data_loss),
        });
    }

    let ln_est = best.viscosity.ln();
    if ln_est - ln_lo < cfg.log_tol || ln_hi - ln_est < cfg.log_tol {
        warn!(
            "calibrated viscosity {:e} sits on the search bound ({lo:e}, {hi:e}); widen the range",
            best.viscosity
        );
    }
    info!(
        "calibrated viscosity {:e} (data_loss={:e}) after {} fits",
        best.viscosity,
        final_eval.data_loss,
        evaluations.len()
    );
    Ok(Calibration {
        viscosity: best.viscosity,
        data_loss: final_eval.data_loss,
        baseline_loss: baseline,
        surrogate,
        evaluations,
    })
}
