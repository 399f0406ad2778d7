//! The caller's PDE problem, as seen by the driver.
//!
//! The problem owns the forward (PDE) solve and the adjoint.  The driver
//! only ever calls it through this trait:
//!
//! 1. `forward(blocks)` → cost, with whatever side effects the solve needs.
//! 2. `backward()` → d cost / d block, one array per block, same order.
//! 3. `evaluate(name)` for every named functional the problem declares, and
//!    `backward_constraint(name, weighting)` for its gradient.
//!
//! Functionals whose name starts with [`CONSTRAINT_PREFIX`] are picked up as
//! inequality constraints `g(x) <= 0` (see `registry`).
//!
//! `backward` is only meaningful right after a `forward` on the same design,
//! and constraint evaluations read the state left by the last `forward`.
//! The driver guarantees that ordering; calling these out of order is the
//! implementor's problem to detect.

use crate::codec::DesignBlock;
use std::error::Error as StdError;

/// Name prefix marking a functional as an inequality constraint.
pub const CONSTRAINT_PREFIX: &str = "constraint_";

/// Per-block arrays returned by the backward passes.
pub type BlockGradients = Vec<Vec<f64>>;

pub trait Problem {
    /// Design block type (the templates passed to `optimize`).
    type Block: DesignBlock;
    /// Auxiliary data handed to `backward_constraint`, keyed by name.
    type Weighting;
    type Error: StdError + Send + Sync + 'static;

    /// Solve the forward problem for `blocks` and return the cost.
    fn forward(&mut self, blocks: &[Self::Block]) -> Result<f64, Self::Error>;

    /// Gradient of the last `forward` cost w.r.t. each block.
    fn backward(&mut self) -> Result<BlockGradients, Self::Error>;

    /// Names of the scalar functionals this problem exposes.
    ///
    /// Only names starting with [`CONSTRAINT_PREFIX`] are used by the
    /// driver; anything else is ignored.
    fn functionals(&self) -> Vec<String> {
        Vec::new()
    }

    /// Value of the functional `name` at the last forward design.
    fn evaluate(&mut self, name: &str) -> Result<f64, Self::Error>;

    /// Gradient of the functional `name` w.r.t. each block.
    fn backward_constraint(
        &mut self,
        name: &str,
        weighting: &Self::Weighting,
    ) -> Result<BlockGradients, Self::Error>;
}
