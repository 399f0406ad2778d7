//! Constraint registry: discovers the problem's constraint functionals by
//! name and binds each one to its own evaluation unit.
//!
//! Each [`ConstraintBinding`] owns the name it was created with, so the
//! value and gradient callbacks handed to the optimizer always evaluate
//! their own constraint no matter how many others were registered after.

use crate::error::{OptfxError, Result};
use crate::evaluator::Evaluator;
use crate::problem::{Problem, CONSTRAINT_PREFIX};
use log::debug;
use std::collections::HashMap;

/// Default feasibility tolerance for inequality constraints.
pub const DEFAULT_CONSTRAINT_TOLERANCE: f64 = 1e-8;

/// Names of the constraint functionals declared by `problem`, sorted.
///
/// An empty result is valid: the run is then unconstrained.
pub fn discover<P: Problem>(problem: &P) -> Vec<String> {
    let mut names: Vec<String> = problem
        .functionals()
        .into_iter()
        .filter(|name| name.starts_with(CONSTRAINT_PREFIX))
        .collect();
    names.sort();
    names.dedup();
    names
}

/// One inequality constraint `g(x) <= tolerance`, bound to its name.
pub struct ConstraintBinding<'e, 'p, P: Problem> {
    name: String,
    tolerance: f64,
    weighting: &'e P::Weighting,
    evaluator: &'e Evaluator<'p, P>,
}

impl<'e, 'p, P: Problem> ConstraintBinding<'e, 'p, P> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// g(x).
    pub fn value(&self, x: &[f64]) -> Result<f64> {
        self.evaluator.functional(x, &self.name)
    }

    /// Overwrite `grad` with dg/dx.
    pub fn gradient(&self, x: &[f64], grad: &mut [f64]) -> Result<()> {
        self.evaluator
            .functional_gradient(x, &self.name, self.weighting, grad)
    }

    /// Value and optional gradient in one call, as the optimizer asks for them.
    pub fn evaluate(&self, x: &[f64], grad: Option<&mut [f64]>) -> Result<f64> {
        let value = self.value(x)?;
        if let Some(grad) = grad {
            self.gradient(x, grad)?;
        }
        Ok(value)
    }
}

/// Bind a single constraint.  `name` is moved into the binding.
pub fn bind<'e, 'p, P: Problem>(
    name: String,
    evaluator: &'e Evaluator<'p, P>,
    weighting: &'e P::Weighting,
    tolerance: f64,
) -> ConstraintBinding<'e, 'p, P> {
    ConstraintBinding {
        name,
        tolerance,
        weighting,
        evaluator,
    }
}

/// Ordered, per-run collection of constraint bindings.
pub struct Registry<'e, 'p, P: Problem> {
    bindings: Vec<ConstraintBinding<'e, 'p, P>>,
}

impl<'e, 'p, P: Problem> Registry<'e, 'p, P> {
    /// Bind every constraint in `names`, in order.
    ///
    /// Fails if a name has no weighting entry.
    pub fn build(
        names: Vec<String>,
        evaluator: &'e Evaluator<'p, P>,
        weighting: &'e HashMap<String, P::Weighting>,
        tolerance: f64,
    ) -> Result<Self> {
        let mut bindings = Vec::with_capacity(names.len());
        for name in names {
            let w = weighting
                .get(&name)
                .ok_or_else(|| OptfxError::MissingWeighting(name.clone()))?;
            debug!("binding constraint {name} (tol = {tolerance:.1e})");
            bindings.push(bind(name, evaluator, w, tolerance));
        }
        Ok(Self { bindings })
    }

    pub fn bindings(&self) -> &[ConstraintBinding<'e, 'p, P>] {
        &self.bindings
    }

    pub fn names(&self) -> Vec<&str> {
        self.bindings.iter().map(ConstraintBinding::name).collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
