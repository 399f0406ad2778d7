//! External optimizer seam.
//!
//! A backend receives the objective and the inequality constraints as
//! [`Functional`]s over the flat design vector and returns the optimized
//! vector.  Two implementations:
//!
//! - [`lbfgs::ArgminBackend`]: pure-Rust L-BFGS, constraints through an
//!   augmented Lagrangian outer loop.  Always available.
//! - `nlopt_backend::NloptBackend`: NLopt's gradient-based algorithms (MMA, CCSAQ,
//!   SLSQP, …), compiled with the `nlopt` feature.

pub mod lbfgs;
#[cfg(feature = "nlopt")]
pub mod nlopt_backend;

use crate::config::{Algorithm, BackendKind, OptimizerOptions};
use crate::error::{OptfxError, Result};
use crate::evaluator::Evaluator;
use crate::problem::Problem;
use crate::registry::ConstraintBinding;
use std::cell::RefCell;

/// A scalar function of the flat design with an optional gradient output.
///
/// When `grad` is `Some`, every entry must be overwritten.
pub trait Functional {
    fn evaluate(&self, x: &[f64], grad: Option<&mut [f64]>) -> Result<f64>;
}

impl<P: Problem> Functional for Evaluator<'_, P> {
    fn evaluate(&self, x: &[f64], grad: Option<&mut [f64]>) -> Result<f64> {
        Evaluator::evaluate(self, x, grad)
    }
}

impl<P: Problem> Functional for ConstraintBinding<'_, '_, P> {
    fn evaluate(&self, x: &[f64], grad: Option<&mut [f64]>) -> Result<f64> {
        ConstraintBinding::evaluate(self, x, grad)
    }
}

/// Inequality constraint `g(x) <= 0`, satisfied up to `tolerance`.
#[derive(Clone, Copy)]
pub struct InequalityConstraint<'c> {
    pub name: &'c str,
    pub tolerance: f64,
    pub functional: &'c dyn Functional,
}

/// What a backend hands back after a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub x: Vec<f64>,
    /// Objective value at `x`.
    pub cost: f64,
    /// argmin: L-BFGS iterations summed over inner solves.  NLopt: objective
    /// evaluations, since NLopt exposes no iteration count.
    pub iterations: usize,
    /// Backend's reason for stopping, for reporting.
    pub termination: String,
    /// Largest constraint value at `x`, clipped at zero.
    pub max_violation: f64,
}

pub trait Backend {
    /// Short backend name for messages.
    fn name(&self) -> &'static str;

    /// Validate and store recognized options.
    ///
    /// Options the backend cannot honor fail with `UnsupportedOption`.
    fn apply_options(&mut self, options: &OptimizerOptions) -> Result<()>;

    /// Store a free-form parameter.  Keys the backend does not use are kept
    /// and logged.
    fn set_param(&mut self, key: &str, value: f64) -> Result<()>;

    /// Minimize `objective` subject to `constraints`, starting at `x0`.
    fn minimize(
        &mut self,
        objective: &dyn Functional,
        constraints: &[InequalityConstraint<'_>],
        x0: &[f64],
    ) -> Result<Solution>;
}

/// Instantiate the backend for `algorithm` on a `size`-dimensional design.
pub fn create(algorithm: Algorithm, size: usize) -> Result<Box<dyn Backend>> {
    match algorithm.backend() {
        BackendKind::Argmin => Ok(Box::new(lbfgs::ArgminBackend::new(size))),
        BackendKind::Nlopt => create_nlopt(algorithm, size),
    }
}

#[cfg(feature = "nlopt")]
fn create_nlopt(algorithm: Algorithm, size: usize) -> Result<Box<dyn Backend>> {
    Ok(Box::new(nlopt_backend::NloptBackend::new(algorithm, size)?))
}

#[cfg(not(feature = "nlopt"))]
fn create_nlopt(algorithm: Algorithm, _size: usize) -> Result<Box<dyn Backend>> {
    Err(OptfxError::DependencyUnavailable {
        algorithm: algorithm.name().to_string(),
        feature: "nlopt",
    })
}

/// First error raised inside an optimizer callback.
///
/// Optimizers either swallow callback errors or cannot carry ours at all,
/// so the first one is kept here and returned after the run.  Once set,
/// [`FirstError::run`] no longer calls into the problem.
#[derive(Debug, Default)]
pub(crate) struct FirstError(RefCell<Option<OptfxError>>);

impl FirstError {
    /// Run `f` unless an earlier call failed.  `None` means failed, now or before.
    pub(crate) fn run<T>(&self, f: impl FnOnce() -> Result<T>) -> Option<T> {
        if self.is_set() {
            return None;
        }
        match f() {
            Ok(v) => Some(v),
            Err(e) => {
                *self.0.borrow_mut() = Some(e);
                None
            }
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.borrow().is_some()
    }

    pub(crate) fn take(&self) -> Option<OptfxError> {
        self.0.borrow_mut().take()
    }
}

/// Largest positive constraint value at `x`.
pub(crate) fn max_violation(constraints: &[InequalityConstraint<'_>], x: &[f64]) -> Result<f64> {
    let mut worst = 0.0_f64;
    for c in constraints {
        worst = worst.max(c.functional.evaluate(x, None)?);
    }
    Ok(worst)
}
