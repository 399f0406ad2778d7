//! L-BFGS backend via the `argmin` crate.
//!
//! Wraps the objective (plus augmented-Lagrangian and bound-barrier terms)
//! into argmin's `CostFunction` + `Gradient` traits and runs L-BFGS with a
//! Moré–Thuente line search.
//!
//! Uses `Vec<f64>` as the argmin parameter type, matching the flat design
//! vector the driver already works with.
//!
//! Constraints `g_k(x) <= 0` are handled by an outer augmented Lagrangian
//! loop around the L-BFGS solve:
//!
//!   min  f(x)  +  Σ_k (μ/2) [max(0, λ_k/μ + g_k(x))]²
//!
//! followed by
//!
//!   λ_k ← max(0, λ_k + μ · g_k)
//!   μ   ← min(μ_max, α · μ)
//!
//! until every `g_k <= tolerance_k` or the outer budget runs out.
//!
//! Recognized parameters: `lbfgs_memory`, `al_mu_init`, `al_mu_factor`,
//! `al_mu_max`, `al_max_outer_iters`, `barrier_weight`, `barrier_sharpness`.

use super::{max_violation, Backend, FirstError, Functional, InequalityConstraint, Solution};
use crate::config::{OptimizerOptions, PerVariable};
use crate::error::{OptfxError, Result};
use argmin::core::{CostFunction, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use log::{info, warn};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

const BACKEND: &str = "argmin";
const DEFAULT_MAX_ITERS: u64 = 500;
const DEFAULT_MEMORY: usize = 10;

// ─────────────────────────────────────────────────────────────
//  Augmented Lagrangian settings / state
// ─────────────────────────────────────────────────────────────

/// Settings for the augmented Lagrangian outer loop.
#[derive(Debug, Clone)]
pub struct AlSettings {
    /// Initial penalty parameter μ.
    pub mu_init: f64,
    /// Multiplicative growth factor for μ each outer iteration.
    pub mu_factor: f64,
    /// Maximum value of μ (prevents ill-conditioning).
    pub mu_max: f64,
    /// Maximum number of outer iterations.
    pub max_outer_iters: usize,
}

impl Default for AlSettings {
    fn default() -> Self {
        Self {
            mu_init: 10.0,
            mu_factor: 5.0,
            mu_max: 1e8,
            max_outer_iters: 20,
        }
    }
}

/// Multiplier estimates and current penalty.
#[derive(Debug, Clone)]
struct AlState {
    lambdas: Vec<f64>,
    mu: f64,
}

impl AlState {
    fn new(num_constraints: usize, settings: &AlSettings) -> Self {
        Self {
            lambdas: vec![0.0; num_constraints],
            mu: settings.mu_init,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Bound barrier  (softplus, smooth one-sided)
// ─────────────────────────────────────────────────────────────

/// Numerically stable log(1 + exp(z)).
#[inline]
fn log1pexp(z: f64) -> f64 {
    if z > 0.0 {
        z + (-z).exp().ln_1p()
    } else {
        z.exp().ln_1p()
    }
}

/// `k < 0` ⟹ penalise x < b, `k > 0` ⟹ penalise x > b.
#[inline]
fn softplus(x: f64, b: f64, k: f64) -> f64 {
    log1pexp(-k * (b - x) - 1.0)
}

#[inline]
fn softplus_grad(x: f64, b: f64, k: f64) -> f64 {
    let z = -k * (b - x) - 1.0;
    k / (1.0 + (-z).exp())
}

/// Soft box constraints on the design, added to the objective.
#[derive(Debug, Clone)]
struct Barrier {
    lower: Vec<f64>,
    upper: Vec<f64>,
    weight: f64,
    sharpness: f64,
}

impl Barrier {
    /// Adds the penalty gradient into `grad` and returns the penalty.
    fn apply(&self, x: &[f64], grad: &mut [f64]) -> f64 {
        let mut loss = 0.0;
        for (i, &xi) in x.iter().enumerate() {
            let lb = self.lower[i];
            if lb.is_finite() {
                loss += self.weight * softplus(xi, lb, -self.sharpness);
                grad[i] += self.weight * softplus_grad(xi, lb, -self.sharpness);
            }
            let ub = self.upper[i];
            if ub.is_finite() {
                loss += self.weight * softplus(xi, ub, self.sharpness);
                grad[i] += self.weight * softplus_grad(xi, ub, self.sharpness);
            }
        }
        loss
    }
}

// ─────────────────────────────────────────────────────────────
//  argmin problem wrapper
// ─────────────────────────────────────────────────────────────

/// Objective + AL penalty + barrier, as argmin sees it.
///
/// argmin calls `cost(x)` and `gradient(x)` separately at the same `x`; the
/// last `(x, value, gradient)` is cached so each point costs one pass over
/// the objective and constraints.
///
/// The line search turns callback errors into a plain solver exit, so the
/// first one goes to `failure` and every later call fails without touching
/// the problem.
struct Penalized<'a> {
    objective: &'a dyn Functional,
    constraints: &'a [InequalityConstraint<'a>],
    al: Option<AlState>,
    barrier: Option<&'a Barrier>,
    failure: &'a FirstError,
    last_eval: RefCell<Option<(Vec<f64>, f64, Vec<f64>)>>,
}

impl<'a> Penalized<'a> {
    fn ensure_evaluated(&self, x: &[f64]) -> Result<()> {
        if let Some((cached_x, _, _)) = self.last_eval.borrow().as_ref() {
            if cached_x == x {
                return Ok(());
            }
        }

        let n = x.len();
        let mut grad = vec![0.0; n];
        let mut value = self.objective.evaluate(x, Some(&mut grad))?;

        if let Some(al) = &self.al {
            let mut g_grad = vec![0.0; n];
            for (k, c) in self.constraints.iter().enumerate() {
                let g = c.functional.evaluate(x, Some(&mut g_grad))?;
                let shifted = (al.lambdas[k] / al.mu + g).max(0.0);
                if shifted > 0.0 {
                    value += 0.5 * al.mu * shifted * shifted;
                    for (gi, dgi) in grad.iter_mut().zip(&g_grad) {
                        *gi += al.mu * shifted * dgi;
                    }
                }
            }
        }

        if let Some(barrier) = self.barrier {
            value += barrier.apply(x, &mut grad);
        }

        *self.last_eval.borrow_mut() = Some((x.to_vec(), value, grad));
        Ok(())
    }

    /// Evaluate at `x` (or reuse the cache) and pick from the result.
    fn cached<T>(&self, x: &[f64], pick: impl FnOnce(&(Vec<f64>, f64, Vec<f64>)) -> T) -> Result<T> {
        self.failure
            .run(|| self.ensure_evaluated(x))
            .ok_or_else(|| OptfxError::Optimizer("objective evaluation failed".into()))?;
        self.last_eval
            .borrow()
            .as_ref()
            .map(pick)
            .ok_or_else(|| OptfxError::Optimizer("no cached evaluation".into()))
    }
}

impl<'a> CostFunction for Penalized<'a> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        Ok(self.cached(x, |(_, value, _)| *value)?)
    }
}

impl<'a> Gradient for Penalized<'a> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, x: &Self::Param) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        Ok(self.cached(x, |(_, _, grad)| grad.clone())?)
    }
}

/// Outcome of one L-BFGS solve.
struct Inner {
    x: Vec<f64>,
    iterations: usize,
    termination: String,
}

// ─────────────────────────────────────────────────────────────
//  Backend
// ─────────────────────────────────────────────────────────────

/// Pure-Rust backend: L-BFGS, augmented Lagrangian for constraints.
#[derive(Debug, Clone)]
pub struct ArgminBackend {
    size: usize,
    memory: usize,
    max_iters: u64,
    target_cost: f64,
    tol_cost: Option<f64>,
    timeout: Option<Duration>,
    lower: Option<PerVariable>,
    upper: Option<PerVariable>,
    barrier_weight: f64,
    barrier_sharpness: f64,
    al: AlSettings,
    params: BTreeMap<String, f64>,
}

impl ArgminBackend {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            memory: DEFAULT_MEMORY,
            max_iters: DEFAULT_MAX_ITERS,
            target_cost: f64::NEG_INFINITY,
            tol_cost: None,
            timeout: None,
            lower: None,
            upper: None,
            barrier_weight: 1000.0,
            barrier_sharpness: 10.0,
            al: AlSettings::default(),
            params: BTreeMap::new(),
        }
    }

    pub fn al_settings(&self) -> &AlSettings {
        &self.al
    }

    fn barrier(&self) -> Option<Barrier> {
        if self.lower.is_none() && self.upper.is_none() {
            return None;
        }
        let expand = |b: &Option<PerVariable>, unset: f64| {
            b.as_ref()
                .map_or_else(|| vec![unset; self.size], |b| b.expand(self.size))
        };
        Some(Barrier {
            lower: expand(&self.lower, f64::NEG_INFINITY),
            upper: expand(&self.upper, f64::INFINITY),
            weight: self.barrier_weight,
            sharpness: self.barrier_sharpness,
        })
    }

    /// One L-BFGS solve from `init`, with optional AL terms.
    fn inner_lbfgs(
        &self,
        objective: &dyn Functional,
        constraints: &[InequalityConstraint<'_>],
        barrier: Option<&Barrier>,
        init: Vec<f64>,
        al: Option<AlState>,
        deadline: Option<Instant>,
    ) -> Result<Inner> {
        let failure = FirstError::default();
        let problem = Penalized {
            objective,
            constraints,
            al,
            barrier,
            failure: &failure,
            last_eval: RefCell::new(None),
        };

        let linesearch = MoreThuenteLineSearch::new();
        let mut solver = LBFGS::new(linesearch, self.memory);
        if let Some(tol) = self.tol_cost {
            solver = solver.with_tolerance_cost(tol)?;
        }

        let max_iters = self.max_iters;
        let target_cost = self.target_cost;
        let mut executor = Executor::new(problem, solver)
            .configure(|config| config.param(init).max_iters(max_iters).target_cost(target_cost));
        if let Some(deadline) = deadline {
            executor = executor.timeout(deadline.saturating_duration_since(Instant::now()));
        }

        let result = executor.run();
        if let Some(err) = failure.take() {
            return Err(err);
        }
        let result = result?;
        let state = result.state();
        let x = state
            .get_best_param()
            .cloned()
            .ok_or_else(|| OptfxError::Optimizer("L-BFGS returned no best parameters".into()))?;
        let termination = state
            .get_termination_reason()
            .map_or_else(|| "unknown".to_string(), |r| format!("{r:?}"));
        Ok(Inner {
            x,
            iterations: state.get_iter() as usize,
            termination,
        })
    }

    /// Augmented Lagrangian outer loop.
    fn minimize_constrained(
        &self,
        objective: &dyn Functional,
        constraints: &[InequalityConstraint<'_>],
        barrier: Option<&Barrier>,
        x0: &[f64],
        deadline: Option<Instant>,
    ) -> Result<Solution> {
        let mut al = AlState::new(constraints.len(), &self.al);
        let mut best = x0.to_vec();
        let mut total_iters = 0usize;
        let mut termination = String::new();
        let mut feasible = false;
        let mut outer = 0usize;

        while outer < self.al.max_outer_iters {
            outer += 1;
            let inner = self.inner_lbfgs(
                objective,
                constraints,
                barrier,
                best,
                Some(al.clone()),
                deadline,
            )?;
            best = inner.x;
            total_iters += inner.iterations;
            termination = inner.termination;

            let g = constraints
                .iter()
                .map(|c| c.functional.evaluate(&best, None))
                .collect::<Result<Vec<f64>>>()?;
            let viol = g.iter().fold(0.0_f64, |m, &v| m.max(v));

            info!(
                "AL outer {}: μ={:.2e}, max_violation={:.4e}, |λ|_max={:.4e}",
                outer,
                al.mu,
                viol,
                al.lambdas.iter().fold(0.0_f64, |m, &v| m.max(v.abs())),
            );

            feasible = g.iter().zip(constraints).all(|(&gk, c)| gk <= c.tolerance);
            if feasible {
                info!("AL converged: constraints satisfied to {viol:.2e}");
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("AL stopped: time budget exhausted");
                break;
            }

            // Multiplier update: λ_k ← max(0, λ_k + μ g_k)
            for (k, &gk) in g.iter().enumerate() {
                al.lambdas[k] = (al.lambdas[k] + al.mu * gk).max(0.0);
            }
            al.mu = (al.mu * self.al.mu_factor).min(self.al.mu_max);
        }

        let max_violation = max_violation(constraints, &best)?;
        if !feasible {
            return Err(OptfxError::NotConverged {
                max_violation,
                iterations: outer,
            });
        }

        let cost = objective.evaluate(&best, None)?;
        Ok(Solution {
            x: best,
            cost,
            iterations: total_iters,
            termination,
            max_violation,
        })
    }
}

impl Backend for ArgminBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn apply_options(&mut self, options: &OptimizerOptions) -> Result<()> {
        options.check_size(self.size)?;
        for name in ["ftol_rel", "xtol_rel", "xtol_abs", "initial_step"] {
            if options.names_set().contains(&name) {
                return Err(OptfxError::UnsupportedOption {
                    name: name.to_string(),
                    backend: BACKEND,
                });
            }
        }
        if let Some(n) = options.maxeval {
            self.max_iters = u64::from(n);
        }
        if let Some(t) = options.maxtime {
            self.timeout = Some(Duration::from_secs_f64(t));
        }
        if let Some(stop) = options.stopval {
            self.target_cost = stop;
        }
        self.tol_cost = options.ftol_abs.or(self.tol_cost);
        self.lower = options.lower_bounds.clone().or(self.lower.take());
        self.upper = options.upper_bounds.clone().or(self.upper.take());
        Ok(())
    }

    fn set_param(&mut self, key: &str, value: f64) -> Result<()> {
        let invalid = |reason: &str| OptfxError::InvalidOption {
            name: key.to_string(),
            reason: reason.to_string(),
        };
        let positive = value.is_finite() && value > 0.0;
        match key {
            "lbfgs_memory" => {
                if !positive || value.fract() != 0.0 {
                    return Err(invalid("expected a positive whole number"));
                }
                self.memory = value as usize;
            }
            "al_max_outer_iters" => {
                if !positive || value.fract() != 0.0 {
                    return Err(invalid("expected a positive whole number"));
                }
                self.al.max_outer_iters = value as usize;
            }
            "al_mu_init" | "al_mu_max" | "barrier_weight" | "barrier_sharpness" => {
                if !positive {
                    return Err(invalid("expected a positive value"));
                }
                match key {
                    "al_mu_init" => self.al.mu_init = value,
                    "al_mu_max" => self.al.mu_max = value,
                    "barrier_weight" => self.barrier_weight = value,
                    _ => self.barrier_sharpness = value,
                }
            }
            "al_mu_factor" => {
                if !(value.is_finite() && value >= 1.0) {
                    return Err(invalid("expected a growth factor >= 1"));
                }
                self.al.mu_factor = value;
            }
            _ => warn!("{BACKEND} backend ignores parameter {key} = {value}"),
        }
        self.params.insert(key.to_string(), value);
        Ok(())
    }

    fn minimize(
        &mut self,
        objective: &dyn Functional,
        constraints: &[InequalityConstraint<'_>],
        x0: &[f64],
    ) -> Result<Solution> {
        if x0.len() != self.size {
            return Err(OptfxError::ShapeMismatch {
                expected: self.size,
                actual: x0.len(),
            });
        }
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let barrier = self.barrier();

        if !constraints.is_empty() {
            return self.minimize_constrained(objective, constraints, barrier.as_ref(), x0, deadline);
        }

        let inner = self.inner_lbfgs(objective, constraints, barrier.as_ref(), x0.to_vec(), None, deadline)?;
        let cost = objective.evaluate(&inner.x, None)?;
        Ok(Solution {
            x: inner.x,
            cost,
            iterations: inner.iterations,
            termination: inner.termination,
            max_violation: 0.0,
        })
    }
}
