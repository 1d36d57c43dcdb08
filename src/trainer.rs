//! The staged training controller.
//!
//! ```text
//! INIT ──► ADAM_STAGE ──► REFINE_STAGE ──► CONVERGED
//!   │           │               │
//!   └───────────┴───────────────┴────────► FAILED
//! ```
//!
//! - `INIT` validates the inputs and draws the first collocation set.
//! - `ADAM_STAGE` takes Adam steps under the weight schedule, redrawing interior points every
//!   `resample_every` iterations. It ends on a plateau of the best total loss (checked only once
//!   the schedule has settled, since weight changes move the total) or on its iteration budget.
//! - `REFINE_STAGE` runs L-BFGS on the last collocation set with the weights frozen. It ends on
//!   a small gradient norm, a plateau, a stalled line search, or its iteration budget.
//! - `FAILED` is entered on a non-finite loss or gradient, or when every residual point of a
//!   batch is non-finite. It surfaces as [`Error::DivergedTraining`] and is never retried.
//!
//! Isolated non-finite points are dropped from their batch and reported as
//! [`Warning::PointsDropped`]. A [`CancelToken`] is honoured between iterations; a cancelled run
//! returns its best parameters so far with the partial trace.
//!
//! All mutable state lives in one [`TrainingRun`], so independent runs can proceed in parallel.

use crate::field::{Mlp, MlpConfig, TrainableField};
use crate::geometry::Domain;
use crate::loss::{LossBreakdown, LossEval, LossWeights, Objective, ScheduleState, WeightSchedule};
use crate::measurements::MeasurementSet;
use crate::optim::{Adam, AdamConfig, Lbfgs, LbfgsConfig, LbfgsStep};
use crate::params::{PhysicalParams, Scales};
use crate::sampler::{self, CollocationSet, SamplerConfig};
use crate::surrogate::TrainedSurrogate;
use crate::{Error, Result, Warning};
use log::{debug, info, warn};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Training controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainState {
    Init,
    AdamStage,
    RefineStage,
    Converged,
    Failed,
}

impl TrainState {
    /// Transition guard.
    pub fn can_advance_to(self, next: TrainState) -> bool {
        use TrainState::*;
        matches!(
            (self, next),
            (Init, AdamStage)
                | (AdamStage, RefineStage)
                | (RefineStage, Converged)
                | (Init | AdamStage | RefineStage, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TrainState::Converged | TrainState::Failed)
    }
}

impl fmt::Display for TrainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrainState::Init => "INIT",
            TrainState::AdamStage => "ADAM_STAGE",
            TrainState::RefineStage => "REFINE_STAGE",
            TrainState::Converged => "CONVERGED",
            TrainState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// Gradient norm fell below the refinement tolerance.
    GradientNorm,
    /// Best total loss stopped improving during refinement.
    Plateau,
    /// The line search found no decrease along the quasi-Newton direction.
    LineSearchStalled,
    /// The refinement iteration budget ran out.
    IterationBudget,
    /// Stopped through the [`CancelToken`]; the surrogate holds the best parameters seen.
    Cancelled,
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One line of the loss trace. Components are unweighted; `total` uses `weights`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossRecord {
    pub stage: TrainState,
    pub iteration: usize,
    pub data: f64,
    pub physics: f64,
    pub bc: f64,
    pub total: f64,
    pub weights: LossWeights,
}

/// Append-only record of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LossTrace(Vec<LossRecord>);

impl LossTrace {
    pub fn push(&mut self, record: LossRecord) {
        self.0.push(record);
    }

    pub fn records(&self) -> &[LossRecord] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&LossRecord> {
        self.0.last()
    }

    /// Records of one stage.
    pub fn stage(&self, stage: TrainState) -> impl Iterator<Item = &LossRecord> + '_ {
        self.0.iter().filter(move |r| r.stage == stage)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamStageConfig {
    pub optimizer: AdamConfig,
    pub max_iters: usize,
    /// Redraw interior points every this many iterations.
    pub resample_every: usize,
    pub plateau_window: usize,
    /// Stop when the best total improved by less than this fraction over the window.
    pub plateau_rel_tol: f64,
}

impl Default for AdamStageConfig {
    fn default() -> Self {
        Self {
            optimizer: AdamConfig::default(),
            max_iters: 10_000,
            resample_every: 500,
            plateau_window: 500,
            plateau_rel_tol: 1e-3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineStageConfig {
    pub optimizer: LbfgsConfig,
    pub max_iters: usize,
    /// Converged once the gradient norm falls below this.
    pub grad_tol: f64,
    pub plateau_window: usize,
    pub plateau_rel_tol: f64,
}

impl Default for RefineStageConfig {
    fn default() -> Self {
        Self {
            optimizer: LbfgsConfig::default(),
            max_iters: 2_000,
            grad_tol: 1e-8,
            plateau_window: 100,
            plateau_rel_tol: 1e-6,
        }
    }
}

/// Everything a training run needs besides the domain, the parameters, and the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub sampler: SamplerConfig,
    pub schedule: WeightSchedule,
    pub adam: AdamStageConfig,
    pub refine: RefineStageConfig,
    /// Log a debug trace line every this many iterations (0 disables).
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerConfig::default(),
            schedule: WeightSchedule::default(),
            adam: AdamStageConfig::default(),
            refine: RefineStageConfig::default(),
            log_every: 500,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        self.sampler.validate()?;
        self.schedule.validate()?;
        self.adam.optimizer.validate()?;
        self.refine.optimizer.validate()?;
        if self.adam.resample_every == 0 {
            return Err(Error::Config("adam.resample_every must be >= 1".into()));
        }
        if self.adam.plateau_window == 0 || self.refine.plateau_window == 0 {
            return Err(Error::Config("plateau windows must be >= 1".into()));
        }
        for (name, x) in [
            ("adam.plateau_rel_tol", self.adam.plateau_rel_tol),
            ("refine.plateau_rel_tol", self.refine.plateau_rel_tol),
            ("refine.grad_tol", self.refine.grad_tol),
        ] {
            if !(x >= 0.0) || !x.is_finite() {
                return Err(Error::Config(format!(
                    "{name} must be non-negative and finite"
                )));
            }
        }
        Ok(())
    }
}

/// Detects when the best value seen stops improving.
#[derive(Debug, Clone)]
struct Plateau {
    window: usize,
    rel_tol: f64,
    best: VecDeque<f64>,
}

impl Plateau {
    fn new(window: usize, rel_tol: f64) -> Self {
        Self {
            window,
            rel_tol,
            best: VecDeque::with_capacity(window + 1),
        }
    }

    fn reset(&mut self) {
        self.best.clear();
    }

    /// Feed a value; `true` once the best value improved by less than `rel_tol` (relative)
    /// over the last `window` values.
    fn push(&mut self, value: f64) -> bool {
        let best = self.best.back().map_or(value, |&b| b.min(value));
        self.best.push_back(best);
        if self.best.len() > self.window + 1 {
            self.best.pop_front();
        }
        if self.best.len() <= self.window {
            return false;
        }
        let old = self.best[0];
        (old - best) <= self.rel_tol * old.abs()
    }
}

/// What a finished (or cancelled) run hands back.
#[derive(Debug, Clone)]
pub struct TrainOutcome<F> {
    pub surrogate: TrainedSurrogate<F>,
    pub trace: LossTrace,
    pub termination: Termination,
    pub warnings: Vec<Warning>,
    /// Total collocation rows discarded for non-finite values.
    pub dropped_points: usize,
}

/// One training run: the only owner of its field, collocation set, schedule, and trace.
pub struct TrainingRun<'a, F: TrainableField> {
    domain: &'a Domain,
    params: PhysicalParams,
    scales: Scales,
    measurements: Option<&'a MeasurementSet>,
    cfg: TrainConfig,
    field: F,
    cancel: Option<CancelToken>,

    state: TrainState,
    iteration: usize,
    schedule: ScheduleState,
    trace: LossTrace,
    warnings: Vec<Warning>,
    dropped_points: usize,
    best: Option<(f64, Array1<f64>)>,
}

impl<'a, F: TrainableField> TrainingRun<'a, F> {
    pub fn new(domain: &'a Domain, params: PhysicalParams, field: F, cfg: TrainConfig) -> Self {
        let scales = Scales::new(domain, &params);
        let schedule = ScheduleState::new(cfg.schedule);
        Self {
            domain,
            params,
            scales,
            measurements: None,
            cfg,
            field,
            cancel: None,
            state: TrainState::Init,
            iteration: 0,
            schedule,
            trace: LossTrace::default(),
            warnings: Vec::new(),
            dropped_points: 0,
            best: None,
        }
    }

    /// Fit these measurements as well as the physics.
    pub fn with_measurements(mut self, measurements: &'a MeasurementSet) -> Self {
        self.measurements = Some(measurements);
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn state(&self) -> TrainState {
        self.state
    }

    /// Drive the state machine to a terminal state.
    pub fn run(mut self) -> Result<TrainOutcome<F>> {
        let mut set = self.init()?;
        self.advance(TrainState::AdamStage)?;
        if let Some(t) = self.adam_stage(&mut set)? {
            return self.finish(t);
        }
        self.advance(TrainState::RefineStage)?;
        let termination = self.refine_stage(&set)?;
        if termination != Termination::Cancelled {
            self.advance(TrainState::Converged)?;
        }
        self.finish(termination)
    }

    fn advance(&mut self, next: TrainState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::Config(format!(
                "illegal training transition {} -> {next}",
                self.state
            )));
        }
        info!("training: {} -> {next} at iteration {}", self.state, self.iteration);
        self.state = next;
        Ok(())
    }

    /// Enter FAILED and build the error describing where.
    fn fail(&mut self, detail: impl Into<String>) -> Error {
        let stage = self.state;
        let detail = detail.into();
        warn!("training failed in {stage} at iteration {}: {detail}", self.iteration);
        self.state = TrainState::Failed;
        Error::DivergedTraining {
            stage,
            iteration: self.iteration,
            detail,
        }
    }

    fn init(&mut self) -> Result<CollocationSet> {
        self.params.validate()?;
        if !(self.domain.area() > 0.0) {
            return Err(Error::GeometryInvalid("domain has no area".into()));
        }
        self.cfg.validate()?;
        if self.field.num_params() == 0 {
            return Err(Error::Config("field has no trainable parameters".into()));
        }
        if self.field.params().iter().any(|x| !x.is_finite()) {
            return Err(Error::ParameterInvalid(
                "initial field parameters must be finite".into(),
            ));
        }
        let (set, warnings) = sampler::sample(self.domain, &self.params, &self.cfg.sampler, 0)?;
        info!(
            "training: {} interior, {} key, {} boundary points; {} parameters; Re(l_c) = {:.3}",
            set.interior.nrows(),
            set.key_points.nrows(),
            set.boundary.len(),
            self.field.num_params(),
            self.params.reynolds(self.scales.length)
        );
        self.warnings.extend(warnings);
        Ok(set)
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    fn objective(&self) -> Objective<'_> {
        Objective {
            params: &self.params,
            scales: &self.scales,
            measurements: self.measurements,
        }
    }

    /// Evaluate at the current parameters, handling dropped rows and divergence.
    fn evaluate(&mut self, set: &CollocationSet, weights: &LossWeights) -> Result<LossEval> {
        let eval = self.objective().evaluate(&self.field, set, weights, true)?;
        if eval.dropped > 0 {
            warn!(
                "{} at iteration {}: dropped {} non-finite collocation points",
                self.state, self.iteration, eval.dropped
            );
            self.dropped_points += eval.dropped;
            self.warnings.push(Warning::PointsDropped {
                stage: self.state,
                iteration: self.iteration,
                count: eval.dropped,
            });
        }
        if eval.kept_physics == 0 {
            return Err(self.fail("every residual point in the batch was non-finite"));
        }
        if !eval.breakdown.total.is_finite() {
            return Err(self.fail(format!("non-finite loss {}", eval.breakdown.total)));
        }
        if eval
            .gradient
            .as_ref()
            .is_some_and(|g| g.iter().any(|x| !x.is_finite()))
        {
            return Err(self.fail("non-finite gradient"));
        }
        Ok(eval)
    }

    fn record(&mut self, b: &LossBreakdown, weights: LossWeights) {
        let r = LossRecord {
            stage: self.state,
            iteration: self.iteration,
            data: b.data,
            physics: b.physics,
            bc: b.bc,
            total: b.total,
            weights,
        };
        if self.cfg.log_every > 0 && self.iteration % self.cfg.log_every == 0 {
            debug!(
                "{} it={} total={:.4e} data={:.3e} physics={:.3e} bc={:.3e}",
                r.stage, r.iteration, r.total, r.data, r.physics, r.bc
            );
        }
        self.trace.push(r);
    }

    fn note_best(&mut self, total: f64) {
        if self.best.as_ref().map_or(true, |(b, _)| total < *b) {
            self.best = Some((total, self.field.params()));
        }
    }

    /// Returns `Some(Cancelled)` if the run was cancelled during the stage.
    fn adam_stage(&mut self, set: &mut CollocationSet) -> Result<Option<Termination>> {
        let n = self.field.num_params();
        let mut adam = Adam::new(self.cfg.adam.optimizer, n)?;
        let mut plateau = Plateau::new(self.cfg.adam.plateau_window, self.cfg.adam.plateau_rel_tol);
        let mut x = self.field.params();

        for it in 0..self.cfg.adam.max_iters {
            if self.cancelled() {
                return Ok(Some(Termination::Cancelled));
            }
            if it > 0 && it % self.cfg.adam.resample_every == 0 {
                let epoch = (it / self.cfg.adam.resample_every) as u64;
                let w = sampler::resample_interior(set, self.domain, &self.cfg.sampler, epoch);
                self.warnings.extend(w);
            }

            let weights = self.schedule.weights();
            let eval = self.evaluate(set, &weights)?;
            let b = eval.breakdown;
            self.record(&b, weights);
            self.note_best(b.total);

            if let Some(phase) = self.schedule.observe(self.iteration, &b) {
                info!("weight schedule -> {phase:?} at iteration {}", self.iteration);
                plateau.reset();
                // Totals under different weights are not comparable.
                self.best = Some((f64::INFINITY, self.field.params()));
            }
            if self.schedule.is_settled() && plateau.push(b.total) {
                info!("adam stage plateaued at iteration {}", self.iteration);
                break;
            }

            let Some(g) = eval.gradient else {
                return Err(self.fail("missing gradient"));
            };
            adam.step(&mut x, &g.view())?;
            self.field.set_params(&x.view())?;
            self.iteration += 1;
        }
        Ok(None)
    }

    fn refine_stage(&mut self, set: &CollocationSet) -> Result<Termination> {
        let weights = self.schedule.weights();
        let mut lbfgs = Lbfgs::new(self.cfg.refine.optimizer)?;
        let mut plateau =
            Plateau::new(self.cfg.refine.plateau_window, self.cfg.refine.plateau_rel_tol);

        let mut x = self.field.params();
        let eval = self.evaluate(set, &weights)?;
        let mut f = eval.breakdown.total;
        let base_dropped = eval.dropped;
        let Some(mut g) = eval.gradient else {
            return Err(self.fail("missing gradient"));
        };
        self.best = None;
        self.note_best(f);

        for _ in 0..self.cfg.refine.max_iters {
            if self.cancelled() {
                return Ok(Termination::Cancelled);
            }
            let gnorm = g.dot(&g).sqrt();
            if gnorm < self.cfg.refine.grad_tol {
                info!("refinement converged: gradient norm {gnorm:e}");
                return Ok(Termination::GradientNorm);
            }

            let mut candidate = self.field.clone();
            let objective = self.objective();
            let step = lbfgs.step(&mut x, f, &g, |trial| {
                candidate.set_params(&trial.view())?;
                let e = objective.evaluate(&candidate, set, &weights, true)?;
                // A trial that loses other points is a different objective; treat it as too
                // long a step.
                if e.dropped != base_dropped {
                    return Ok((f64::NAN, Array1::zeros(trial.len())));
                }
                let grad = e.gradient.unwrap_or_else(|| Array1::zeros(trial.len()));
                Ok((e.breakdown.total, grad))
            })?;

            match step {
                LbfgsStep::Accepted { .. } => {
                    self.field.set_params(&x.view())?;
                    self.iteration += 1;
                    let eval = self.evaluate(set, &weights)?;
                    let Some(grad) = eval.gradient else {
                        return Err(self.fail("missing gradient"));
                    };
                    f = eval.breakdown.total;
                    g = grad;
                    self.record(&eval.breakdown, weights);
                    self.note_best(f);
                    if plateau.push(f) {
                        info!("refinement plateaued at iteration {}", self.iteration);
                        return Ok(Termination::Plateau);
                    }
                }
                LbfgsStep::Stalled { .. } => {
                    info!("refinement line search stalled at iteration {}", self.iteration);
                    return Ok(Termination::LineSearchStalled);
                }
            }
        }
        Ok(Termination::IterationBudget)
    }

    fn finish(mut self, termination: Termination) -> Result<TrainOutcome<F>> {
        if termination == Termination::Cancelled {
            info!(
                "training cancelled in {} at iteration {}; keeping best parameters",
                self.state, self.iteration
            );
            if let Some((_, best)) = self.best.take() {
                if best.iter().all(|v| v.is_finite()) {
                    self.field.set_params(&best.view())?;
                }
            }
        }
        if let Some(last) = self.trace.last() {
            info!(
                "training finished ({termination:?}) after {} iterations: total={:.4e} data={:.3e} physics={:.3e} bc={:.3e}",
                self.iteration, last.total, last.data, last.physics, last.bc
            );
        }
        Ok(TrainOutcome {
            surrogate: TrainedSurrogate::new(self.field, self.domain.clone(), self.params),
            trace: self.trace,
            termination,
            warnings: self.warnings,
            dropped_points: self.dropped_points,
        })
    }
}

/// Train `field` on `domain` with the given parameters (and optional measurements).
pub fn train<F: TrainableField>(
    domain: &Domain,
    params: &PhysicalParams,
    field: F,
    measurements: Option<&MeasurementSet>,
    cfg: &TrainConfig,
) -> Result<TrainOutcome<F>> {
    let mut run = TrainingRun::new(domain, *params, field, cfg.clone());
    if let Some(m) = measurements {
        run = run.with_measurements(m);
    }
    run.run()
}

/// Build a fresh [`Mlp`] for `domain`/`params` and train it.
pub fn train_pinn(
    domain: &Domain,
    params: &PhysicalParams,
    network: &MlpConfig,
    measurements: Option<&MeasurementSet>,
    cfg: &TrainConfig,
) -> Result<TrainOutcome<Mlp>> {
    params.validate()?;
    let scales = Scales::new(domain, params);
    let field = Mlp::new(network, domain, &scales, params)?;
    train(domain, params, field, measurements, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldModel, Jet};
    use crate::loss::AdaptiveSchedule;
    use ndarray::{ArrayView1, ArrayView2};

    fn unit_problem() -> (Domain, PhysicalParams) {
        (
            Domain::rectangle(2.0, 1.0).unwrap(),
            PhysicalParams::new(1.0, 0.1, 1.0).unwrap(),
        )
    }

    fn small_net() -> MlpConfig {
        MlpConfig {
            hidden: vec![12, 12],
            seed: 5,
            ..MlpConfig::default()
        }
    }

    fn quick_config() -> TrainConfig {
        TrainConfig {
            sampler: SamplerConfig {
                interior: 120,
                boundary: 48,
                min_per_segment: 6,
                key_points_per_vertex: 1,
                ..SamplerConfig::default()
            },
            schedule: WeightSchedule::Adaptive(AdaptiveSchedule {
                max_phase_iters: 40,
                ..AdaptiveSchedule::default()
            }),
            adam: AdamStageConfig {
                optimizer: AdamConfig {
                    lr: 1e-2,
                    ..AdamConfig::default()
                },
                max_iters: 150,
                resample_every: 50,
                plateau_window: 1_000,
                ..AdamStageConfig::default()
            },
            refine: RefineStageConfig {
                max_iters: 30,
                ..RefineStageConfig::default()
            },
            log_every: 0,
        }
    }

    #[test]
    fn transition_guards() {
        use TrainState::*;
        assert!(Init.can_advance_to(AdamStage));
        assert!(AdamStage.can_advance_to(RefineStage));
        assert!(RefineStage.can_advance_to(Converged));
        assert!(AdamStage.can_advance_to(Failed));
        assert!(!Init.can_advance_to(RefineStage));
        assert!(!Converged.can_advance_to(AdamStage));
        assert!(!Failed.can_advance_to(Failed));
        assert!(!RefineStage.can_advance_to(AdamStage));
        assert_eq!(AdamStage.to_string(), "ADAM_STAGE");
    }

    #[test]
    fn plateau_needs_a_full_window() {
        let mut p = Plateau::new(3, 0.01);
        assert!(!p.push(10.0));
        assert!(!p.push(5.0));
        assert!(!p.push(5.0));
        // best went 10 -> 5 over the window: still improving.
        assert!(!p.push(5.0));
        // 5 -> 5 over the last three: plateau.
        assert!(p.push(5.0));
        p.reset();
        assert!(!p.push(1.0));
    }

    #[test]
    fn short_run_visits_stages_in_order_and_lowers_the_loss() {
        let (d, p) = unit_problem();
        let out = train_pinn(&d, &p, &small_net(), None, &quick_config()).unwrap();
        let recs = out.trace.records();
        assert!(!recs.is_empty());
        assert_eq!(recs[0].stage, TrainState::AdamStage);
        assert_eq!(recs[0].iteration, 0);
        // Adam records come first, refinement records after.
        let first_refine = recs
            .iter()
            .position(|r| r.stage == TrainState::RefineStage)
            .unwrap_or(recs.len());
        assert!(recs[first_refine..]
            .iter()
            .all(|r| r.stage == TrainState::RefineStage));
        assert_eq!(out.trace.stage(TrainState::AdamStage).count(), 150);
        assert!(recs.windows(2).all(|w| w[0].iteration <= w[1].iteration));

        let first = recs[0].physics + recs[0].bc;
        let last = recs[recs.len() - 1].physics + recs[recs.len() - 1].bc;
        assert!(last < first, "first={first} last={last}");
        assert_eq!(out.dropped_points, 0);
        assert_ne!(out.termination, Termination::Cancelled);
    }

    #[test]
    fn identical_inputs_give_identical_traces() {
        let (d, p) = unit_problem();
        let mut cfg = quick_config();
        cfg.adam.max_iters = 40;
        cfg.refine.max_iters = 5;
        let a = train_pinn(&d, &p, &small_net(), None, &cfg).unwrap();
        let b = train_pinn(&d, &p, &small_net(), None, &cfg).unwrap();
        assert_eq!(a.trace, b.trace);
    }

    #[test]
    fn invalid_parameters_fail_at_init() {
        let (d, _) = unit_problem();
        let good = PhysicalParams::new(1.0, 0.1, 1.0).unwrap();
        let scales = Scales::new(&d, &good);
        let net = Mlp::new(&small_net(), &d, &scales, &good).unwrap();
        let bad = PhysicalParams {
            viscosity: -1.0,
            ..good
        };
        let err = train(&d, &bad, net, None, &quick_config()).unwrap_err();
        assert_eq!(err.stage(), Some((TrainState::Init, 0)));
    }

    #[test]
    fn cancelled_run_returns_partial_progress() {
        let (d, p) = unit_problem();
        let scales = Scales::new(&d, &p);
        let net = Mlp::new(&small_net(), &d, &scales, &p).unwrap();
        let initial = net.params();
        let token = CancelToken::new();
        token.cancel();
        let out = TrainingRun::new(&d, p, net, quick_config())
            .with_cancel_token(token)
            .run()
            .unwrap();
        assert_eq!(out.termination, Termination::Cancelled);
        assert!(out.trace.is_empty());
        assert_eq!(out.surrogate.field().params(), initial);
    }

    /// An MLP whose outputs are poisoned with NaN left of `poison_x`.
    #[derive(Debug, Clone)]
    struct Poisoned {
        inner: Mlp,
        poison_x: f64,
    }

    impl Poisoned {
        fn poison(&self, coords: &ArrayView2<f64>, jet: &mut Jet) {
            for i in 0..coords.nrows() {
                if coords[[i, 0]] < self.poison_x {
                    jet.value[[i, 0]] = f64::NAN;
                }
            }
        }
    }

    impl FieldModel for Poisoned {
        fn predict_with_gradients(&self, coords: &ArrayView2<f64>) -> Result<Jet> {
            let mut jet = self.inner.predict_with_gradients(coords)?;
            self.poison(coords, &mut jet);
            Ok(jet)
        }
    }

    impl TrainableField for Poisoned {
        type Tape = <Mlp as TrainableField>::Tape;

        fn num_params(&self) -> usize {
            self.inner.num_params()
        }

        fn params(&self) -> Array1<f64> {
            self.inner.params()
        }

        fn set_params(&mut self, params: &ArrayView1<f64>) -> Result<()> {
            self.inner.set_params(params)
        }

        fn forward_tape(&self, coords: &ArrayView2<f64>) -> Result<(Jet, Self::Tape)> {
            let (mut jet, tape) = self.inner.forward_tape(coords)?;
            self.poison(coords, &mut jet);
            Ok((jet, tape))
        }

        fn backward(&self, tape: &Self::Tape, adjoint: &Jet) -> Array1<f64> {
            self.inner.backward(tape, adjoint)
        }
    }

    fn poisoned(poison_x: f64) -> (Domain, PhysicalParams, Poisoned) {
        let (d, p) = unit_problem();
        let scales = Scales::new(&d, &p);
        let inner = Mlp::new(&small_net(), &d, &scales, &p).unwrap();
        (d, p, Poisoned { inner, poison_x })
    }

    #[test]
    fn isolated_nan_points_are_dropped_not_fatal() {
        let (d, p, field) = poisoned(0.02);
        let mut cfg = quick_config();
        cfg.adam.max_iters = 10;
        cfg.refine.max_iters = 3;
        let out = train(&d, &p, field, None, &cfg).unwrap();
        assert!(out.dropped_points > 0);
        assert!(out.warnings.iter().any(|w| matches!(
            w,
            Warning::PointsDropped {
                stage: TrainState::AdamStage,
                iteration: 0,
                ..
            }
        )));
    }

    #[test]
    fn refinement_steps_count_dropped_points_and_record_finite_losses() {
        let (d, p, field) = poisoned(0.02);
        let mut cfg = quick_config();
        cfg.adam.max_iters = 10;
        cfg.refine.max_iters = 4;
        let out = train(&d, &p, field, None, &cfg).unwrap();
        let refine: Vec<&LossRecord> = out.trace.stage(TrainState::RefineStage).collect();
        assert!(!refine.is_empty());
        for r in refine {
            assert!(r.total.is_finite() && r.physics.is_finite());
            assert!(out.warnings.iter().any(|w| matches!(
                w,
                Warning::PointsDropped { stage: TrainState::RefineStage, iteration, .. }
                    if *iteration == r.iteration
            )));
        }
    }

    /// An MLP that cancels its run after `limit` parameter updates and refuses any more.
    #[derive(Debug, Clone)]
    struct Frozen {
        inner: Mlp,
        token: CancelToken,
        updates: usize,
        limit: usize,
    }

    impl FieldModel for Frozen {
        fn predict_with_gradients(&self, coords: &ArrayView2<f64>) -> Result<Jet> {
            self.inner.predict_with_gradients(coords)
        }
    }

    impl TrainableField for Frozen {
        type Tape = <Mlp as TrainableField>::Tape;

        fn num_params(&self) -> usize {
            self.inner.num_params()
        }

        fn params(&self) -> Array1<f64> {
            self.inner.params()
        }

        fn set_params(&mut self, params: &ArrayView1<f64>) -> Result<()> {
            if self.updates == self.limit {
                return Err(Error::ParameterInvalid("parameters are frozen".into()));
            }
            self.updates += 1;
            if self.updates == self.limit {
                self.token.cancel();
            }
            self.inner.set_params(params)
        }

        fn forward_tape(&self, coords: &ArrayView2<f64>) -> Result<(Jet, Self::Tape)> {
            self.inner.forward_tape(coords)
        }

        fn backward(&self, tape: &Self::Tape, adjoint: &Jet) -> Array1<f64> {
            self.inner.backward(tape, adjoint)
        }
    }

    #[test]
    fn failing_to_restore_best_parameters_is_an_error() {
        let (d, p) = unit_problem();
        let token = CancelToken::new();
        let field = Frozen {
            inner: Mlp::new(&small_net(), &d, &Scales::new(&d, &p), &p).unwrap(),
            token: token.clone(),
            updates: 0,
            limit: 3,
        };
        let err = TrainingRun::new(&d, p, field, quick_config())
            .with_cancel_token(token)
            .run()
            .unwrap_err();
        assert!(matches!(err, Error::ParameterInvalid(_)), "{err}");
    }

    #[test]
    fn all_nan_batch_is_divergence_with_stage_and_iteration() {
        let (d, p, field) = poisoned(f64::INFINITY);
        let err = train(&d, &p, field, None, &quick_config()).unwrap_err();
        match err {
            Error::DivergedTraining {
                stage, iteration, ..
            } => {
                assert_eq!(stage, TrainState::AdamStage);
                assert_eq!(iteration, 0);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn trace_serializes_as_a_json_array() {
        let mut t = LossTrace::default();
        t.push(LossRecord {
            stage: TrainState::RefineStage,
            iteration: 3,
            data: 0.0,
            physics: 1.0,
            bc: 2.0,
            total: 3.0,
            weights: LossWeights::default(),
        });
        let json = t.to_json().unwrap();
        assert!(json.trim_start().starts_with('['));
        let back: LossTrace = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
