//! Finite-difference checks of the gradients the optimizer receives.
//!
//! The objective callback (`Evaluator`) and the constraint binding each
//! hand back an analytic gradient assembled from the problem's per-block
//! adjoint arrays.  Every component is compared against a central
//! difference of the same callback:
//!
//!     dJ/dx_i  ≈  [ J(x + h eᵢ) − J(x − h eᵢ) ] / 2h

mod common;

use approx::assert_relative_eq;
use common::{Rod, RodError};
use optfx::evaluator::Evaluator;
use optfx::registry::{self, Registry};
use optfx::OptfxError;
use std::collections::HashMap;

/// Central-difference step.  Much smaller steps lose digits to roundoff.
const H: f64 = 1e-4;

/// A non-uniform design so no two elements share a gradient.
fn design(n: usize) -> Vec<f64> {
    (0..n).map(|i| -1.0 + 2.5 * i as f64 / n as f64).collect()
}

fn central_difference(f: impl Fn(&[f64]) -> f64, x: &[f64]) -> Vec<f64> {
    let mut shifted = x.to_vec();
    (0..x.len())
        .map(|i| {
            shifted[i] = x[i] + H;
            let up = f(&shifted);
            shifted[i] = x[i] - H;
            let down = f(&shifted);
            shifted[i] = x[i];
            (up - down) / (2.0 * H)
        })
        .collect()
}

#[test]
fn objective_gradient_matches_finite_differences() {
    let mut rod = Rod::new(12, 0.4);
    let x = design(12);
    let templates = vec![x.clone()];
    let eval = Evaluator::new(&mut rod, &templates);

    let mut grad = vec![0.0; 12];
    eval.evaluate(&x, Some(&mut grad)).unwrap();
    let fd = central_difference(|p| eval.evaluate(p, None).unwrap(), &x);

    for (i, (a, n)) in grad.iter().zip(&fd).enumerate() {
        assert!(*a < 0.0, "more material must lower compliance (element {i})");
        assert_relative_eq!(*a, *n, max_relative = 1e-5, epsilon = 1e-10);
    }
}

#[test]
fn constraint_gradient_matches_finite_differences() {
    let mut rod = Rod::new(8, 0.3);
    let names = registry::discover(&rod);
    assert_eq!(names, vec!["constraint_volume"]);

    let x = design(8);
    let templates = vec![x.clone()];
    let weights = HashMap::from([("constraint_volume".to_string(), 1.0)]);
    let eval = Evaluator::new(&mut rod, &templates);
    let registry = Registry::build(names, &eval, &weights, 1e-8).unwrap();
    let volume = &registry.bindings()[0];

    let mut grad = vec![0.0; 8];
    volume.gradient(&x, &mut grad).unwrap();
    let fd = central_difference(|p| volume.value(p).unwrap(), &x);

    for (a, n) in grad.iter().zip(&fd) {
        assert_relative_eq!(*a, *n, max_relative = 1e-6, epsilon = 1e-12);
    }
}

#[test]
fn weighting_scales_the_constraint_gradient() {
    let mut rod = Rod::new(5, 0.5);
    let names = registry::discover(&rod);
    let x = design(5);
    let templates = vec![x.clone()];
    let weights = HashMap::from([("constraint_volume".to_string(), 4.0)]);
    let eval = Evaluator::new(&mut rod, &templates);
    let registry = Registry::build(names, &eval, &weights, 1e-8).unwrap();

    let mut weighted = vec![0.0; 5];
    registry.bindings()[0].gradient(&x, &mut weighted).unwrap();
    let fd = central_difference(|p| registry.bindings()[0].value(p).unwrap(), &x);
    for (w, n) in weighted.iter().zip(&fd) {
        assert_relative_eq!(*w, 4.0 * n, max_relative = 1e-6, epsilon = 1e-12);
    }
}

#[test]
fn constraint_value_follows_the_queried_design() {
    let mut rod = Rod::new(4, 0.5);
    let names = registry::discover(&rod);
    let templates = vec![vec![0.0; 4]];
    let weights = HashMap::from([("constraint_volume".to_string(), 1.0)]);
    let eval = Evaluator::new(&mut rod, &templates);
    let registry = Registry::build(names, &eval, &weights, 1e-8).unwrap();
    let volume = &registry.bindings()[0];

    // Objective at one design, constraint at another: the constraint must
    // not see the objective's design.
    eval.evaluate(&[5.0; 4], None).unwrap();
    assert_relative_eq!(volume.value(&[0.0; 4]).unwrap(), 0.0, epsilon = 1e-15);
    assert!(volume.value(&[5.0; 4]).unwrap() > 0.4);
}

#[test]
fn problem_errors_keep_their_source() {
    let mut rod = Rod::new(4, 0.5);
    rod.fail_after = Some(1);
    let templates = vec![vec![0.0; 4]];
    let eval = Evaluator::new(&mut rod, &templates);

    eval.evaluate(&[0.0; 4], None).unwrap();
    let err = eval.evaluate(&[1.0; 4], None).unwrap_err();
    let source = match err {
        OptfxError::Problem(source) => source,
        other => panic!("expected a problem error, got {other}"),
    };
    assert!(matches!(
        source.downcast_ref::<RodError>(),
        Some(RodError::Diverged(2))
    ));
}
