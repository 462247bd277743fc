use std::cell::Cell;

use approx::assert_relative_eq;
use argmin::core::CostFunction;
use assert_matches::assert_matches;

use crate::optimisers::lbfgsb::{LbfgsbSolver, Task};
use crate::optimisers::{minimize_lbfgsb, OptimisationError};
use crate::parameters::{Bound, BoundType};
use crate::Result;

/// `(x0 - 1)^2 + 2 (x1 + 3)^2`, unconstrained minimum at `(1, -3)`.
struct BoxQuadratic {
    evaluations: Cell<usize>,
}

impl BoxQuadratic {
    fn new() -> Self {
        Self {
            evaluations: Cell::new(0),
        }
    }
}

impl CostFunction for BoxQuadratic {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Vec<f64>) -> Result<f64> {
        self.evaluations.set(self.evaluations.get() + 1);
        Ok((x[0] - 1.0).powi(2) + 2.0 * (x[1] + 3.0).powi(2))
    }
}

struct Undefined;

impl CostFunction for Undefined {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, _: &Vec<f64>) -> Result<f64> {
        Ok(f64::NAN)
    }
}

#[test]
fn active_lower_bound() {
    let bounds = [Bound::both(-5.0, 5.0), Bound::both(-1.5, 5.0)];
    let mut x = vec![4.0, 2.0];
    let score = minimize_lbfgsb(&mut x, &bounds, 1e7, 1e-5, &BoxQuadratic::new()).unwrap();
    assert_relative_eq!(x[0], 1.0, epsilon = 1e-3);
    assert_relative_eq!(x[1], -1.5, epsilon = 1e-3);
    assert_relative_eq!(score, 4.5, epsilon = 1e-3);
}

#[test]
fn interior_minimum() {
    let bounds = [
        Bound::new(-10.0, 0.0, BoundType::Lower),
        Bound::new(0.0, 10.0, BoundType::Upper),
    ];
    let mut x = vec![-4.0, 3.0];
    let score = minimize_lbfgsb(&mut x, &bounds, 1e7, 1e-6, &BoxQuadratic::new()).unwrap();
    assert_relative_eq!(x[0], 1.0, epsilon = 1e-3);
    assert_relative_eq!(x[1], -3.0, epsilon = 1e-3);
    assert!(score < 1e-5);
}

#[test]
fn start_is_projected_into_bounds() {
    let bounds = [Bound::both(2.0, 5.0), Bound::both(-1.0, 1.0)];
    let mut x = vec![-7.0, 8.0];
    minimize_lbfgsb(&mut x, &bounds, 1e7, 1e-5, &BoxQuadratic::new()).unwrap();
    assert_relative_eq!(x[0], 2.0, epsilon = 1e-6);
    assert_relative_eq!(x[1], -1.0, epsilon = 1e-6);
}

#[test]
fn undefined_score_is_an_error() {
    let bounds = [Bound::both(0.0, 1.0)];
    let mut x = vec![0.5];
    let err = minimize_lbfgsb(&mut x, &bounds, 1e7, 1e-5, &Undefined).unwrap_err();
    assert_matches!(
        err.downcast_ref::<OptimisationError>(),
        Some(OptimisationError::LbfgsbUnknown)
    );
}

#[test]
fn empty_vector_evaluates_once() {
    struct Constant<'a>(&'a Cell<usize>);
    impl CostFunction for Constant<'_> {
        type Param = Vec<f64>;
        type Output = f64;

        fn cost(&self, x: &Vec<f64>) -> Result<f64> {
            assert!(x.is_empty());
            self.0.set(self.0.get() + 1);
            Ok(-12.5)
        }
    }
    let evaluations = Cell::new(0);
    let mut x: Vec<f64> = Vec::new();
    let score = minimize_lbfgsb(&mut x, &[], 1e7, 1e-5, &Constant(&evaluations)).unwrap();
    assert_eq!(score, -12.5);
    assert_eq!(evaluations.get(), 1);
}

#[test]
fn bounds_must_match_variables() {
    let mut x = vec![0.0, 0.0];
    let err = minimize_lbfgsb(&mut x, &[Bound::both(0.0, 1.0)], 1e7, 1e-5, &BoxQuadratic::new())
        .unwrap_err();
    assert_matches!(
        err.downcast_ref::<OptimisationError>(),
        Some(OptimisationError::InvalidParameter(_))
    );
}

#[test]
fn empty_bounds_are_rejected() {
    let mut x = vec![0.0, 0.0];
    let objective = BoxQuadratic::new();
    let bounds = [Bound::both(0.0, 1.0), Bound::both(200.0, 100.0)];
    let err = minimize_lbfgsb(&mut x, &bounds, 1e7, 1e-5, &objective).unwrap_err();
    assert_matches!(
        err.downcast_ref::<OptimisationError>(),
        Some(OptimisationError::InvalidParameter(_))
    );
    assert_eq!(objective.evaluations.get(), 0);
}

#[test]
fn reverse_communication_with_exact_gradient() {
    let bounds = [Bound::both(-10.0, 10.0)];
    let mut solver = LbfgsbSolver::new(&bounds, 1e7, 1e-8).unwrap();
    let mut x = vec![7.0];
    let (mut f, mut g) = (0.0, vec![0.0]);
    let mut evaluations = 0;
    loop {
        match solver.step(&mut x, f, &g) {
            Task::Fg => {
                evaluations += 1;
                f = (x[0] - 2.5).powi(2);
                g[0] = 2.0 * (x[0] - 2.5);
            }
            Task::NewX => continue,
            Task::Converged => break,
            Task::Abnormal => panic!("line search failed"),
        }
        assert!(evaluations < 100);
    }
    assert_relative_eq!(x[0], 2.5, epsilon = 1e-6);
    assert!(solver.iterations() > 0);
}
