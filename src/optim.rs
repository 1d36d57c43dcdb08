//! Optimizers over flat parameter vectors.
//!
//! - [`Adam`]: bias-corrected first-order steps for the stochastic stage (the collocation set
//!   changes between steps).
//! - [`Lbfgs`]: limited-memory quasi-Newton steps with Armijo backtracking for the refinement
//!   stage, where the objective is held fixed.
//!
//! Both are driven one step at a time so the caller keeps control of logging, tracing, and
//! cancellation between iterations.

use crate::{Error, Result};
use log::trace;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl AdamConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.lr > 0.0) || !self.lr.is_finite() {
            return Err(Error::Config("adam.lr must be positive and finite".into()));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(Error::Config("adam betas must be in [0, 1)".into()));
        }
        if !(self.eps > 0.0) {
            return Err(Error::Config("adam.eps must be positive".into()));
        }
        Ok(())
    }
}

/// Adam state for one parameter vector.
#[derive(Debug, Clone)]
pub struct Adam {
    cfg: AdamConfig,
    m: Array1<f64>,
    v: Array1<f64>,
    t: i32,
}

impl Adam {
    pub fn new(cfg: AdamConfig, n_params: usize) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            m: Array1::zeros(n_params),
            v: Array1::zeros(n_params),
            t: 0,
        })
    }

    pub fn step(&mut self, params: &mut Array1<f64>, grad: &ArrayView1<f64>) -> Result<()> {
        if params.len() != self.m.len() || grad.len() != self.m.len() {
            return Err(Error::Shape("adam: parameter and gradient lengths must match"));
        }
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
        } = self.cfg;
        self.t = self.t.saturating_add(1);
        let bc1 = 1.0 - beta1.powi(self.t);
        let bc2 = 1.0 - beta2.powi(self.t);
        for i in 0..params.len() {
            let g = grad[i];
            self.m[i] = beta1 * self.m[i] + (1.0 - beta1) * g;
            self.v[i] = beta2 * self.v[i] + (1.0 - beta2) * g * g;
            let m_hat = self.m[i] / bc1;
            let v_hat = self.v[i] / bc2;
            params[i] -= lr * m_hat / (v_hat.sqrt() + eps);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbfgsConfig {
    /// Number of stored curvature pairs.
    pub memory: usize,
    /// Armijo sufficient-decrease constant.
    pub c1: f64,
    /// Maximum backtracking halvings per step.
    pub max_line_search: usize,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            memory: 20,
            c1: 1e-4,
            max_line_search: 30,
        }
    }
}

impl LbfgsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.memory == 0 {
            return Err(Error::Config("lbfgs.memory must be >= 1".into()));
        }
        if !(self.c1 > 0.0 && self.c1 < 1.0) {
            return Err(Error::Config("lbfgs.c1 must be in (0, 1)".into()));
        }
        if self.max_line_search == 0 {
            return Err(Error::Config("lbfgs.max_line_search must be >= 1".into()));
        }
        Ok(())
    }
}

/// Result of one L-BFGS step.
#[derive(Debug, Clone)]
pub enum LbfgsStep {
    /// A step satisfying the Armijo condition was taken; `x` was updated in place.
    Accepted {
        value: f64,
        gradient: Array1<f64>,
        evaluations: usize,
    },
    /// No step along the search direction decreased the objective; `x` is unchanged.
    Stalled { evaluations: usize },
}

/// L-BFGS curvature memory.
#[derive(Debug, Clone)]
pub struct Lbfgs {
    cfg: LbfgsConfig,
    s: VecDeque<Array1<f64>>,
    y: VecDeque<Array1<f64>>,
}

impl Lbfgs {
    pub fn new(cfg: LbfgsConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            s: VecDeque::with_capacity(cfg.memory),
            y: VecDeque::with_capacity(cfg.memory),
        })
    }

    /// Search direction `-H g` by the two-loop recursion.
    pub fn direction(&self, grad: &Array1<f64>) -> Array1<f64> {
        let mut q = grad.clone();
        let k = self.s.len();
        let mut alpha = vec![0.0; k];
        let mut rho = vec![0.0; k];
        for i in (0..k).rev() {
            rho[i] = 1.0 / self.y[i].dot(&self.s[i]);
            alpha[i] = rho[i] * self.s[i].dot(&q);
            q.scaled_add(-alpha[i], &self.y[i]);
        }
        if let (Some(s), Some(y)) = (self.s.back(), self.y.back()) {
            q *= s.dot(y) / y.dot(y);
        }
        for i in 0..k {
            let beta = rho[i] * self.y[i].dot(&q);
            q.scaled_add(alpha[i] - beta, &self.s[i]);
        }
        -q
    }

    /// Take one step from `x` (with objective `value` and gradient `grad` there).
    ///
    /// `eval` returns the objective and gradient at a trial point. Non-finite trial values are
    /// treated as insufficient decrease.
    pub fn step<E>(
        &mut self,
        x: &mut Array1<f64>,
        value: f64,
        grad: &Array1<f64>,
        mut eval: E,
    ) -> Result<LbfgsStep>
    where
        E: FnMut(&Array1<f64>) -> Result<(f64, Array1<f64>)>,
    {
        let mut d = self.direction(grad);
        let mut slope = grad.dot(&d);
        if !(slope < 0.0) || !slope.is_finite() {
            trace!("lbfgs: direction is not a descent direction, resetting memory");
            self.s.clear();
            self.y.clear();
            d = -grad;
            slope = grad.dot(&d);
        }
        // Without curvature information, start from a step of unit length.
        let mut step = if self.s.is_empty() {
            (1.0 / grad.dot(grad).sqrt()).min(1.0)
        } else {
            1.0
        };

        for evaluations in 1..=self.cfg.max_line_search {
            let trial = &*x + &(step * &d);
            let (f, g) = eval(&trial)?;
            trace!("lbfgs: step={step:e} f={f:e} (from {value:e})");
            if f.is_finite() && f <= value + self.cfg.c1 * step * slope {
                let s = &trial - &*x;
                let y = &g - grad;
                if s.dot(&y) > 1e-12 * s.dot(&s).sqrt() * y.dot(&y).sqrt() {
                    if self.s.len() == self.cfg.memory {
                        self.s.pop_front();
                        self.y.pop_front();
                    }
                    self.s.push_back(s);
                    self.y.push_back(y);
                }
                *x = trial;
                return Ok(LbfgsStep::Accepted {
                    value: f,
                    gradient: g,
                    evaluations,
                });
            }
            step *= 0.5;
        }
        Ok(LbfgsStep::Stalled {
            evaluations: self.cfg.max_line_search,
        })
    }
}
