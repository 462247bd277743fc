use approx::assert_relative_eq;
use assert_matches::assert_matches;
use rstest::rstest;

use crate::optimisers::{minimize_newton, OptimisationError};
use crate::Result;

#[rstest]
#[case::inside(1.0)]
#[case::below_bounds(-3.0)]
#[case::above_bounds(12.0)]
fn linear_root(#[case] guess: f64) {
    let oracle = |x: f64| -> Result<(f64, f64)> { Ok((x - 2.0, 1.0)) };
    let root = minimize_newton(0.0, guess, 5.0, 1e-8, 50, &oracle).unwrap();
    assert_relative_eq!(root, 2.0, epsilon = 1e-7);
}

#[test]
fn quadratic_root() {
    let oracle = |x: f64| -> Result<(f64, f64)> { Ok((x * x - 4.0, 2.0 * x)) };
    let root = minimize_newton(0.0, 5.0, 10.0, 1e-8, 50, &oracle).unwrap();
    assert_relative_eq!(root, 2.0, epsilon = 1e-6);
}

#[test]
fn guess_at_root_returns_immediately() {
    let oracle = |x: f64| -> Result<(f64, f64)> { Ok((3.0 * (x - 0.5), 3.0)) };
    let root = minimize_newton(0.0, 0.5, 1.0, 1e-6, 10, &oracle).unwrap();
    assert_eq!(root, 0.5);
}

#[test]
fn bisects_without_positive_derivative() {
    // The derivative has the wrong sign everywhere, so every step bisects the bracket.
    let oracle = |x: f64| -> Result<(f64, f64)> { Ok((x - 2.0, -1.0)) };
    let root = minimize_newton(0.0, 1.0, 5.0, 1e-6, 100, &oracle).unwrap();
    assert_relative_eq!(root, 2.0, epsilon = 1e-5);
}

#[test]
fn iteration_cap_returns_previous_point() {
    let oracle = |x: f64| -> Result<(f64, f64)> { Ok((x - 2.0, -1.0)) };
    // brackets: [0.7, 5] -> [0.7, 2.85] -> [1.775, 2.85], stopping at the third step
    let root = minimize_newton(0.0, 0.7, 5.0, 1e-12, 3, &oracle).unwrap();
    assert_relative_eq!(root, 1.775, epsilon = 1e-12);
}

#[test]
fn zero_iterations_is_a_limit_error() {
    let oracle = |x: f64| -> Result<(f64, f64)> { Ok((x - 2.0, 1.0)) };
    let err = minimize_newton(0.0, 1.0, 5.0, 1e-8, 0, &oracle).unwrap_err();
    assert_matches!(
        err.downcast_ref::<OptimisationError>(),
        Some(OptimisationError::NewtonLimit)
    );
}

#[rstest]
#[case::nan_value(f64::NAN, 1.0)]
#[case::infinite_derivative(1.0, f64::INFINITY)]
fn non_finite_derivatives_fail(#[case] f: f64, #[case] df: f64) {
    let oracle = move |_: f64| -> Result<(f64, f64)> { Ok((f, df)) };
    let err = minimize_newton(0.0, 1.0, 5.0, 1e-8, 10, &oracle).unwrap_err();
    assert_matches!(
        err.downcast_ref::<OptimisationError>(),
        Some(OptimisationError::NewtonDerivative(_))
    );
}

#[test]
fn oracle_errors_propagate() {
    let oracle = |_: f64| -> Result<(f64, f64)> { anyhow::bail!("oracle failed") };
    let err = minimize_newton(0.0, 1.0, 5.0, 1e-8, 10, &oracle).unwrap_err();
    assert_eq!(err.to_string(), "oracle failed");
}

#[test]
fn reversed_interval_is_rejected() {
    let oracle = |x: f64| -> Result<(f64, f64)> { Ok((x - 2.0, 1.0)) };
    let err = minimize_newton(5.0, 1.0, 0.0, 1e-8, 10, &oracle).unwrap_err();
    assert_matches!(
        err.downcast_ref::<OptimisationError>(),
        Some(OptimisationError::InvalidParameter(_))
    );
}
