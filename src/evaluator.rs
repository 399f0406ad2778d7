//! Objective evaluator: adapts `Problem::forward` / `Problem::backward` to
//! the `(x, grad) -> cost` callback contract of the optimizer.
//!
//! The problem is shared with every constraint binding of the run, so it
//! lives in a `RefCell`.  Callbacks run on the optimizer's thread one at a
//! time and never overlap, so the borrows never conflict.
//!
//! **Evaluation cache**: the last `(x, cost, gradient)` is kept so that a
//! cost query followed by a gradient query (argmin) or a constraint query
//! (NLopt) at the same `x` triggers only one forward solve.  A query at any
//! other `x` re-runs `forward` first, so results depend only on `x`.

use crate::codec::{self, Offsets};
use crate::error::{OptfxError, Result};
use crate::problem::Problem;
use log::debug;
use std::cell::{Cell, RefCell};

/// Result of the last forward solve.
struct LastEval {
    design: Vec<f64>,
    cost: f64,
    gradient: Option<Vec<f64>>,
}

/// Shared evaluation context for one optimization run.
pub struct Evaluator<'p, P: Problem> {
    problem: RefCell<&'p mut P>,
    templates: &'p [P::Block],
    offsets: Offsets,
    last: RefCell<Option<LastEval>>,
    /// Cost of every fresh forward solve, in call order.
    trace: RefCell<Vec<f64>>,
    forward_calls: Cell<usize>,
}

impl<'p, P: Problem> Evaluator<'p, P> {
    pub fn new(problem: &'p mut P, templates: &'p [P::Block]) -> Self {
        Self {
            problem: RefCell::new(problem),
            templates,
            offsets: Offsets::of(templates),
            last: RefCell::new(None),
            trace: RefCell::new(Vec::new()),
            forward_calls: Cell::new(0),
        }
    }

    pub fn offsets(&self) -> &Offsets {
        &self.offsets
    }

    pub fn templates(&self) -> &'p [P::Block] {
        self.templates
    }

    /// Length of the flat design vector.
    pub fn size(&self) -> usize {
        self.offsets.total()
    }

    /// Number of forward solves so far.
    pub fn forward_calls(&self) -> usize {
        self.forward_calls.get()
    }

    /// Costs of all forward solves so far.
    pub fn trace(&self) -> Vec<f64> {
        self.trace.borrow().clone()
    }

    /// Cost at `x`; if `grad` is given it is overwritten with d cost / dx.
    pub fn evaluate(&self, x: &[f64], grad: Option<&mut [f64]>) -> Result<f64> {
        let cost = self.ensure_forward(x)?;
        if let Some(grad) = grad {
            self.write_gradient(grad)?;
        }
        Ok(cost)
    }

    /// Value of the named functional at `x`.
    pub(crate) fn functional(&self, x: &[f64], name: &str) -> Result<f64> {
        self.ensure_forward(x)?;
        self.problem
            .borrow_mut()
            .evaluate(name)
            .map_err(OptfxError::problem)
    }

    /// Gradient of the named functional at `x`, written into `grad`.
    pub(crate) fn functional_gradient(
        &self,
        x: &[f64],
        name: &str,
        weighting: &P::Weighting,
        grad: &mut [f64],
    ) -> Result<()> {
        self.ensure_forward(x)?;
        let parts = self
            .problem
            .borrow_mut()
            .backward_constraint(name, weighting)
            .map_err(OptfxError::problem)?;
        codec::flatten_into(&parts, grad)
    }

    /// Run `forward` unless the problem already holds the state for `x`.
    fn ensure_forward(&self, x: &[f64]) -> Result<f64> {
        if let Some(last) = self.last.borrow().as_ref() {
            if last.design == x {
                return Ok(last.cost);
            }
        }

        let blocks = codec::reconstruct(x, &self.offsets, self.templates)?;
        let cost = self
            .problem
            .borrow_mut()
            .forward(&blocks)
            .map_err(OptfxError::problem)?;

        let n = self.forward_calls.get() + 1;
        self.forward_calls.set(n);
        self.trace.borrow_mut().push(cost);
        debug!("forward #{n}: cost = {cost:.6e}");

        *self.last.borrow_mut() = Some(LastEval {
            design: x.to_vec(),
            cost,
            gradient: None,
        });
        Ok(cost)
    }

    /// Overwrite `grad` with the objective gradient of the cached design.
    fn write_gradient(&self, grad: &mut [f64]) -> Result<()> {
        let mut last = self.last.borrow_mut();
        let Some(last) = last.as_mut() else {
            return Err(OptfxError::Optimizer(
                "gradient requested before any forward evaluation".into(),
            ));
        };
        if let Some(cached) = &last.gradient {
            codec::flatten_into(std::slice::from_ref(cached), grad)?;
            return Ok(());
        }

        let parts = self
            .problem
            .borrow_mut()
            .backward()
            .map_err(OptfxError::problem)?;
        codec::flatten_into(&parts, grad)?;
        last.gradient = Some(grad.to_vec());
        Ok(())
    }
}
