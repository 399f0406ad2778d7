//! Optimization driver: configures a backend, binds the objective and the
//! discovered constraints, runs the optimizer and maps the result back to
//! design blocks.
//!
//! A driver is single-use:
//!
//! ```text
//! Configured → ObjectiveBound → ConstraintsBound → Running → Completed | Failed
//! ```
//!
//! Calls made in any other order fail with [`OptfxError::InvalidState`].

use crate::backend::{self, Backend, Functional, InequalityConstraint, Solution};
use crate::codec;
use crate::config::{Algorithm, OptimizerConfig, OptimizerOptions, OptionValue};
use crate::error::{OptfxError, Result};
use crate::evaluator::Evaluator;
use crate::problem::Problem;
use crate::registry::{self, Registry};
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

// ─────────────────────────────────────────────────────────────
//  State / report
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Configured,
    ObjectiveBound,
    ConstraintsBound,
    Running,
    Completed,
    Failed,
}

impl DriverState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Configured => "configured",
            Self::ObjectiveBound => "objective-bound",
            Self::ConstraintsBound => "constraints-bound",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub algorithm: Algorithm,
    /// Optimized flat design.
    pub solution: Vec<f64>,
    /// Objective at `solution`.
    pub cost: f64,
    /// argmin: L-BFGS iterations.  NLopt: objective evaluations.
    pub iterations: usize,
    /// Number of forward solves.
    pub evaluations: usize,
    /// Cost of every forward solve, in call order.
    pub cost_trace: Vec<f64>,
    pub termination: String,
    pub max_violation: f64,
    /// Names of the constraints that were enforced.
    pub constraints: Vec<String>,
    pub elapsed_secs: f64,
}

/// Blocks returned by [`optimize_with_report`], plus the run summary.
#[derive(Debug, Clone)]
pub struct Outcome<B> {
    pub blocks: Vec<B>,
    pub report: RunReport,
}

// ─────────────────────────────────────────────────────────────
//  Driver
// ─────────────────────────────────────────────────────────────

pub struct Driver<'e, 'p, P: Problem> {
    algorithm: Algorithm,
    size: usize,
    backend: Box<dyn Backend>,
    state: DriverState,
    objective: Option<&'e Evaluator<'p, P>>,
    constraints: Option<Registry<'e, 'p, P>>,
}

impl<'e, 'p, P: Problem> Driver<'e, 'p, P> {
    /// Create the backend for `config.algorithm` on a `size`-dimensional
    /// design and apply the options and parameters.
    ///
    /// Nothing is evaluated here, so configuration errors surface before
    /// the first forward solve.
    pub fn configure(config: &OptimizerConfig, size: usize) -> Result<Self> {
        let backend = backend::create(config.algorithm, size)?;
        let mut driver = Self {
            algorithm: config.algorithm,
            size,
            backend,
            state: DriverState::Configured,
            objective: None,
            constraints: None,
        };
        driver.apply_options(&config.options)?;
        driver.apply_parameters(&config.params)?;
        Ok(driver)
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Validate `options` against the option table and hand them to the
    /// backend.
    pub fn apply_options(&mut self, options: &BTreeMap<String, OptionValue>) -> Result<()> {
        self.require(DriverState::Configured)?;
        let parsed = OptimizerOptions::from_map(options)?;
        self.backend.apply_options(&parsed)
    }

    /// Store free-form parameters on the backend.
    pub fn apply_parameters(&mut self, params: &BTreeMap<String, f64>) -> Result<()> {
        self.require(DriverState::Configured)?;
        for (key, &value) in params {
            self.backend.set_param(key, value)?;
        }
        Ok(())
    }

    pub fn bind_objective(&mut self, evaluator: &'e Evaluator<'p, P>) -> Result<()> {
        self.require(DriverState::Configured)?;
        if evaluator.size() != self.size {
            return Err(OptfxError::ShapeMismatch {
                expected: self.size,
                actual: evaluator.size(),
            });
        }
        self.objective = Some(evaluator);
        self.state = DriverState::ObjectiveBound;
        Ok(())
    }

    /// Bind the run's constraints.  An empty registry makes the run
    /// unconstrained.
    pub fn bind_constraints(&mut self, registry: Registry<'e, 'p, P>) -> Result<()> {
        self.require(DriverState::ObjectiveBound)?;
        self.constraints = Some(registry);
        self.state = DriverState::ConstraintsBound;
        Ok(())
    }

    /// Run the backend from `initial` until it stops.
    pub fn run(&mut self, initial: &[f64]) -> Result<RunReport> {
        self.require(DriverState::ConstraintsBound)?;
        let (Some(evaluator), Some(registry)) = (self.objective, self.constraints.as_ref()) else {
            return Err(self.invalid(DriverState::ConstraintsBound));
        };
        if initial.len() != self.size {
            return Err(OptfxError::ShapeMismatch {
                expected: self.size,
                actual: initial.len(),
            });
        }

        let constraints: Vec<InequalityConstraint<'_>> = registry
            .bindings()
            .iter()
            .map(|b| InequalityConstraint {
                name: b.name(),
                tolerance: b.tolerance(),
                functional: b as &dyn Functional,
            })
            .collect();

        info!(
            "{} ({} backend): {} design variables, {} constraint(s)",
            self.algorithm,
            self.backend.name(),
            self.size,
            constraints.len()
        );
        self.state = DriverState::Running;
        let start = Instant::now();

        let result = self.backend.minimize(evaluator, &constraints, initial);
        let elapsed_secs = start.elapsed().as_secs_f64();

        match result {
            Ok(Solution {
                x,
                cost,
                iterations,
                termination,
                max_violation,
            }) => {
                self.state = DriverState::Completed;
                info!(
                    "{} finished: cost = {cost:.6e}, {} evaluations, {termination} ({elapsed_secs:.3}s)",
                    self.algorithm,
                    evaluator.forward_calls()
                );
                Ok(RunReport {
                    algorithm: self.algorithm,
                    solution: x,
                    cost,
                    iterations,
                    evaluations: evaluator.forward_calls(),
                    cost_trace: evaluator.trace(),
                    termination,
                    max_violation,
                    constraints: registry.names().into_iter().map(String::from).collect(),
                    elapsed_secs,
                })
            }
            Err(e) => {
                self.state = DriverState::Failed;
                warn!("{} failed after {} evaluations: {e}", self.algorithm, evaluator.forward_calls());
                Err(e)
            }
        }
    }

    /// Map a flat solution back onto the bound evaluator's templates.
    pub fn reconstruct(&self, solution: &[f64]) -> Result<Vec<P::Block>> {
        self.require(DriverState::Completed)?;
        let evaluator = self
            .objective
            .ok_or_else(|| self.invalid(DriverState::Completed))?;
        codec::reconstruct(solution, evaluator.offsets(), evaluator.templates())
    }

    fn require(&self, expected: DriverState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid(expected))
        }
    }

    fn invalid(&self, expected: DriverState) -> OptfxError {
        OptfxError::InvalidState {
            expected: expected.name(),
            actual: self.state.name(),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Entry points
// ─────────────────────────────────────────────────────────────

/// Optimize `problem` starting from `initials` and return new blocks in
/// the same order and with the same shapes.
///
/// `weighting` must hold an entry for every `constraint_*` functional the
/// problem declares.
pub fn optimize<P: Problem>(
    problem: &mut P,
    initials: &[P::Block],
    weighting: &HashMap<String, P::Weighting>,
    config: &OptimizerConfig,
) -> Result<Vec<P::Block>> {
    optimize_with_report(problem, initials, weighting, config).map(|outcome| outcome.blocks)
}

/// [`optimize`], also returning the [`RunReport`].
pub fn optimize_with_report<P: Problem>(
    problem: &mut P,
    initials: &[P::Block],
    weighting: &HashMap<String, P::Weighting>,
    config: &OptimizerConfig,
) -> Result<Outcome<P::Block>> {
    let names = registry::discover(&*problem);
    let evaluator = Evaluator::new(problem, initials);
    let registry = Registry::build(names, &evaluator, weighting, config.constraint_tolerance)?;

    let mut driver = Driver::configure(config, evaluator.size())?;
    driver.bind_objective(&evaluator)?;
    driver.bind_constraints(registry)?;

    let report = driver.run(&codec::flatten(initials))?;
    let blocks = driver.reconstruct(&report.solution)?;
    Ok(Outcome { blocks, report })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::BlockGradients;
    use approx::assert_abs_diff_eq;
    use std::convert::Infallible;

    /// f(x) = Σ (x_i - 1)², no constraints.
    struct Shifted {
        x: Vec<f64>,
    }

    impl Problem for Shifted {
        type Block = Vec<f64>;
        type Weighting = ();
        type Error = Infallible;

        fn forward(&mut self, blocks: &[Vec<f64>]) -> std::result::Result<f64, Infallible> {
            self.x = blocks.concat();
            Ok(self.x.iter().map(|v| (v - 1.0).powi(2)).sum())
        }

        fn backward(&mut self) -> std::result::Result<BlockGradients, Infallible> {
            Ok(vec![self.x.iter().map(|v| 2.0 * (v - 1.0)).collect()])
        }

        fn evaluate(&mut self, _: &str) -> std::result::Result<f64, Infallible> {
            Ok(0.0)
        }

        fn backward_constraint(&mut self, _: &str, _: &()) -> std::result::Result<BlockGradients, Infallible> {
            Ok(Vec::new())
        }
    }

    fn lbfgs() -> OptimizerConfig {
        OptimizerConfig::new(Algorithm::Lbfgs)
    }

    #[test]
    fn full_lifecycle() {
        let mut problem = Shifted { x: Vec::new() };
        let templates = vec![vec![0.0; 3]];
        let weights = HashMap::new();
        let evaluator = Evaluator::new(&mut problem, &templates);
        let registry = Registry::build(Vec::new(), &evaluator, &weights, 1e-8).unwrap();

        let mut driver = Driver::configure(&lbfgs(), 3).unwrap();
        assert_eq!(driver.state(), DriverState::Configured);
        driver.bind_objective(&evaluator).unwrap();
        assert_eq!(driver.state(), DriverState::ObjectiveBound);
        driver.bind_constraints(registry).unwrap();
        assert_eq!(driver.state(), DriverState::ConstraintsBound);

        let report = driver.run(&[0.0, 0.0, 0.0]).unwrap();
        assert_eq!(driver.state(), DriverState::Completed);
        assert!(report.constraints.is_empty());
        assert_eq!(report.evaluations, report.cost_trace.len());
        assert_abs_diff_eq!(report.cost, 0.0, epsilon = 1e-10);

        let blocks = driver.reconstruct(&report.solution).unwrap();
        assert_eq!(blocks.len(), 1);
        for v in &blocks[0] {
            assert_abs_diff_eq!(*v, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn out_of_order_calls_are_rejected() {
        let mut problem = Shifted { x: Vec::new() };
        let templates = vec![vec![0.0; 2]];
        let weights = HashMap::new();
        let evaluator = Evaluator::new(&mut problem, &templates);

        let mut driver = Driver::configure(&lbfgs(), 2).unwrap();
        assert!(matches!(
            driver.run(&[0.0, 0.0]),
            Err(OptfxError::InvalidState { expected: "constraints-bound", actual: "configured" })
        ));
        let registry = Registry::build(Vec::new(), &evaluator, &weights, 1e-8).unwrap();
        assert!(matches!(
            driver.bind_constraints(registry),
            Err(OptfxError::InvalidState { .. })
        ));
        assert!(matches!(
            driver.reconstruct(&[0.0, 0.0]),
            Err(OptfxError::InvalidState { .. })
        ));
        assert_eq!(evaluator.forward_calls(), 0);
    }

    #[test]
    fn driver_is_single_use() {
        let mut problem = Shifted { x: Vec::new() };
        let templates = vec![vec![0.0; 2]];
        let weights = HashMap::new();
        let evaluator = Evaluator::new(&mut problem, &templates);
        let registry = Registry::build(Vec::new(), &evaluator, &weights, 1e-8).unwrap();

        let mut driver = Driver::configure(&lbfgs(), 2).unwrap();
        driver.bind_objective(&evaluator).unwrap();
        driver.bind_constraints(registry).unwrap();
        driver.run(&[0.0, 0.0]).unwrap();

        assert!(matches!(
            driver.run(&[0.0, 0.0]),
            Err(OptfxError::InvalidState { actual: "completed", .. })
        ));
        assert!(matches!(
            driver.apply_options(&BTreeMap::new()),
            Err(OptfxError::InvalidState { .. })
        ));
    }

    #[test]
    fn objective_size_must_match_configuration() {
        let mut problem = Shifted { x: Vec::new() };
        let templates = vec![vec![0.0; 2]];
        let evaluator = Evaluator::new(&mut problem, &templates);
        let mut driver = Driver::configure(&lbfgs(), 5).unwrap();
        assert!(matches!(
            driver.bind_objective(&evaluator),
            Err(OptfxError::ShapeMismatch { expected: 5, actual: 2 })
        ));
        assert_eq!(driver.state(), DriverState::Configured);
    }

    #[test]
    fn unknown_option_fails_configuration() {
        let config = lbfgs().with_option("set_population", 10.0);
        assert!(matches!(
            Driver::<Shifted>::configure(&config, 2),
            Err(OptfxError::UnknownOption(_))
        ));
    }

    #[test]
    fn optimize_returns_blocks_in_input_order() {
        let mut problem = Shifted { x: Vec::new() };
        let initials = vec![vec![0.0; 2], vec![5.0], vec![-3.0; 3]];
        let blocks = optimize(&mut problem, &initials, &HashMap::new(), &lbfgs()).unwrap();
        assert_eq!(
            blocks.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![2, 1, 3]
        );
        for v in blocks.concat() {
            assert_abs_diff_eq!(v, 1.0, epsilon = 1e-5);
        }
    }
}
