//! Crate-wide error type.
//!
//! Every fallible operation returns `Result<T, OptfxError>`.  Errors raised
//! by the caller's problem are boxed and carried through the optimizer
//! callbacks unchanged.

use std::error::Error as StdError;

use thiserror::Error;

/// Unified error type for the driver, the codec and the backends.
#[derive(Debug, Error)]
pub enum OptfxError {
    /// The algorithm needs a backend that was not compiled in.
    #[error("algorithm {algorithm} is unavailable: rebuild with the `{feature}` feature")]
    DependencyUnavailable {
        algorithm: String,
        feature: &'static str,
    },

    /// Algorithm name not known to any backend.
    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Flat vector length disagrees with the block layout.
    #[error("shape mismatch: expected length {expected}, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Number of blocks (or gradient parts) disagrees with the layout.
    #[error("block count mismatch: expected {expected} blocks, got {actual}")]
    BlockCount { expected: usize, actual: usize },

    /// Option key is not in the recognized option table.
    #[error("unknown optimizer option: {0}")]
    UnknownOption(String),

    /// Option key is known but its value cannot be used.
    #[error("invalid value for optimizer option {name}: {reason}")]
    InvalidOption { name: String, reason: String },

    /// Option key is known but the selected backend cannot honor it.
    #[error("option {name} is not supported by the {backend} backend")]
    UnsupportedOption {
        name: String,
        backend: &'static str,
    },

    /// A discovered constraint has no entry in the weighting map.
    #[error("no constraint weighting given for {0}")]
    MissingWeighting(String),

    /// Driver operation called out of order, or driver reused.
    #[error("driver is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// The caller's problem failed during a forward or backward evaluation.
    #[error("problem evaluation failed")]
    Problem(#[source] Box<dyn StdError + Send + Sync>),

    /// The external optimizer failed.
    #[error("optimizer error: {0}")]
    Optimizer(String),

    /// Constraints were still violated when the outer iterations ran out.
    #[error("constraints not satisfied after {iterations} outer iterations (max violation {max_violation:.3e})")]
    NotConverged { max_violation: f64, iterations: usize },
}

impl OptfxError {
    /// Wrap an error raised by the caller's problem.
    pub fn problem<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Problem(Box::new(err))
    }
}

impl From<argmin::core::Error> for OptfxError {
    fn from(e: argmin::core::Error) -> Self {
        // Errors raised inside our own cost/gradient callbacks come back
        // wrapped; recover them so problem failures keep their source.
        match e.downcast::<OptfxError>() {
            Ok(inner) => inner,
            Err(other) => Self::Optimizer(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OptfxError>;
