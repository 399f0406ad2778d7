//! NLopt backend (feature `nlopt`).
//!
//! NLopt callbacks return a bare `f64` and NLopt keeps iterating on NaN, so
//! the first error raised by the problem is stashed, every later callback
//! returns NaN without calling the problem, and the stashed error is
//! returned once `optimize` comes back.  Runs without `maxeval` or
//! `maxtime` get [`DEFAULT_MAXEVAL`] so that such a run still ends.

use super::{max_violation, Backend, FirstError, Functional, InequalityConstraint, Solution};
use crate::config::{Algorithm, OptimizerOptions, PerVariable};
use crate::error::{OptfxError, Result};
use log::{info, warn};
use nlopt::{Nlopt, Target};
use std::cell::Cell;
use std::collections::BTreeMap;

const BACKEND: &str = "nlopt";

/// Evaluation budget when neither `maxeval` nor `maxtime` is set.
pub const DEFAULT_MAXEVAL: u32 = 10_000;

fn nlopt_algorithm(algorithm: Algorithm) -> Result<nlopt::Algorithm> {
    Ok(match algorithm {
        Algorithm::LdMma => nlopt::Algorithm::Mma,
        Algorithm::LdCcsaq => nlopt::Algorithm::Ccsaq,
        Algorithm::LdSlsqp => nlopt::Algorithm::Slsqp,
        Algorithm::LdLbfgs => nlopt::Algorithm::Lbfgs,
        Algorithm::LnCobyla => nlopt::Algorithm::Cobyla,
        Algorithm::Lbfgs => return Err(OptfxError::UnknownAlgorithm(algorithm.name().into())),
    })
}

/// Map an NLopt setter status onto our error type.
fn check<S, F: std::fmt::Debug>(setting: &str, status: std::result::Result<S, F>) -> Result<()> {
    status.map(|_| ()).map_err(|fail| OptfxError::InvalidOption {
        name: setting.to_string(),
        reason: format!("rejected by NLopt: {fail:?}"),
    })
}

pub struct NloptBackend {
    algorithm: Algorithm,
    size: usize,
    options: OptimizerOptions,
    params: BTreeMap<String, f64>,
}

impl NloptBackend {
    pub fn new(algorithm: Algorithm, size: usize) -> Result<Self> {
        nlopt_algorithm(algorithm)?;
        Ok(Self {
            algorithm,
            size,
            options: OptimizerOptions::default(),
            params: BTreeMap::new(),
        })
    }
}

impl Backend for NloptBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn apply_options(&mut self, options: &OptimizerOptions) -> Result<()> {
        options.check_size(self.size)?;
        self.options = options.clone();
        Ok(())
    }

    fn set_param(&mut self, key: &str, value: f64) -> Result<()> {
        warn!("{BACKEND} backend stores but does not forward parameter {key} = {value}");
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

        let failure = FirstError::default();
        let evaluations = Cell::new(0usize);
        let uses_gradient = self.algorithm.uses_gradient();
        let objective_fn = |x: &[f64], grad: Option<&mut [f64]>, _: &mut ()| -> f64 {
            let grad = if uses_gradient { grad } else { None };
            failure
                .run(|| {
                    evaluations.set(evaluations.get() + 1);
                    objective.evaluate(x, grad)
                })
                .unwrap_or(f64::NAN)
        };
        let mut opt = Nlopt::new(
            nlopt_algorithm(self.algorithm)?,
            self.size,
            objective_fn,
            Target::Minimize,
            (),
        );

        let o = &self.options;
        if let Some(v) = o.stopval {
            check("stopval", opt.set_stopval(v))?;
        }
        if let Some(v) = o.ftol_rel {
            check("ftol_rel", opt.set_ftol_rel(v))?;
        }
        if let Some(v) = o.ftol_abs {
            check("ftol_abs", opt.set_ftol_abs(v))?;
        }
        if let Some(v) = o.xtol_rel {
            check("xtol_rel", opt.set_xtol_rel(v))?;
        }
        if let Some(v) = o.xtol_abs {
            check("xtol_abs", opt.set_xtol_abs1(v))?;
        }
        if let Some(v) = o.maxeval {
            check("maxeval", opt.set_maxeval(v))?;
        }
        if let Some(v) = o.maxtime {
            check("maxtime", opt.set_maxtime(v))?;
        }
        if o.maxeval.is_none() && o.maxtime.is_none() {
            info!(
                "{} has no maxeval or maxtime; stopping after {DEFAULT_MAXEVAL} evaluations",
                self.algorithm
            );
            check("maxeval", opt.set_maxeval(DEFAULT_MAXEVAL))?;
        }
        match &o.lower_bounds {
            Some(PerVariable::Uniform(v)) => check("lower_bounds", opt.set_lower_bound(*v))?,
            Some(PerVariable::Each(v)) => check("lower_bounds", opt.set_lower_bounds(v))?,
            None => {}
        }
        match &o.upper_bounds {
            Some(PerVariable::Uniform(v)) => check("upper_bounds", opt.set_upper_bound(*v))?,
            Some(PerVariable::Each(v)) => check("upper_bounds", opt.set_upper_bounds(v))?,
            None => {}
        }
        match &o.initial_step {
            Some(PerVariable::Uniform(v)) => check("initial_step", opt.set_initial_step1(*v))?,
            Some(PerVariable::Each(v)) => check("initial_step", opt.set_initial_step(v))?,
            None => {}
        }

        for c in constraints {
            let functional = c.functional;
            let failure = &failure;
            let constraint_fn = move |x: &[f64], grad: Option<&mut [f64]>, _: &mut ()| -> f64 {
                let grad = if uses_gradient { grad } else { None };
                failure
                    .run(|| functional.evaluate(x, grad))
                    .unwrap_or(f64::NAN)
            };
            opt.add_inequality_constraint(constraint_fn, (), c.tolerance)
                .map_err(|fail| {
                    OptfxError::Optimizer(format!(
                        "{} rejected constraint {}: {fail:?}",
                        self.algorithm, c.name
                    ))
                })?;
        }

        let mut x = x0.to_vec();
        let outcome = opt.optimize(&mut x);
        drop(opt);

        if let Some(err) = failure.take() {
            return Err(err);
        }
        match outcome {
            Ok((state, cost)) => Ok(Solution {
                max_violation: max_violation(constraints, &x)?,
                x,
                cost,
                iterations: evaluations.get(),
                termination: format!("{state:?}"),
            }),
            Err((state, _)) => Err(OptfxError::Optimizer(format!(
                "{} failed: {state:?}",
                self.algorithm
            ))),
        }
    }
}
