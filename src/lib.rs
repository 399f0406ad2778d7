//! **optfx**: gradient-based optimization driver for PDE-constrained design problems.
//!
//! The caller owns the physics: a [`Problem`] solves the forward problem,
//! computes adjoint gradients and declares named scalar functionals.  This
//! crate connects it to an external optimizer:
//!
//! 1. **Codec** (`codec`): flatten design blocks into one vector and back.
//! 2. **Evaluator** (`evaluator`): `(x, grad) -> cost` callback over `forward` / `backward`.
//! 3. **Registry** (`registry`): `constraint_*` functionals → inequality constraints.
//! 4. **Backends** (`backend`): argmin L-BFGS (always) and NLopt (feature `nlopt`).
//! 5. **Driver** (`driver`): configure, bind, run, reconstruct.
//!
//! ```no_run
//! # use optfx::{optimize, OptimizerConfig, Algorithm};
//! # fn demo<P: optfx::Problem>(problem: &mut P, initials: &[P::Block],
//! #         weights: &std::collections::HashMap<String, P::Weighting>) -> optfx::Result<()> {
//! let config = OptimizerConfig::new(Algorithm::LdMma)
//!     .with_option("set_maxeval", 200u32)
//!     .with_option("set_lower_bounds", 0.0)
//!     .with_option("set_upper_bounds", 1.0);
//! let optimized = optimize(problem, initials, weights, &config)?;
//! # let _ = optimized;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod codec;
pub mod problem;
pub mod evaluator;
pub mod registry;
pub mod config;
pub mod backend;
pub mod driver;

pub use codec::{DesignBlock, NodalField, Offsets};
pub use config::{Algorithm, OptimizerConfig, OptionValue};
pub use driver::{optimize, optimize_with_report, Driver, DriverState, Outcome, RunReport};
pub use error::{OptfxError, Result};
pub use problem::{BlockGradients, Problem, CONSTRAINT_PREFIX};
