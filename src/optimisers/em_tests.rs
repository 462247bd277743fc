use approx::assert_relative_eq;
use assert_matches::assert_matches;

use crate::optimisers::{minimize_em, EmOutcome, OptimisationError};
use crate::Result;

/// Runs EM over fixed per-category site likelihoods. The callback mimics a partition: it fills
/// the buffer under the weights applied in the previous round and then applies the new ones.
fn run_em(raw: &[[f64; 2]], site_weights: &[u32], weights: &mut [f64]) -> Result<EmOutcome> {
    let mut sitecat = vec![0.0; raw.len() * 2];
    let mut applied = weights.to_vec();
    minimize_em(weights, &mut sitecat, site_weights, |current, out| {
        for (site, lk) in raw.iter().enumerate() {
            for c in 0..2 {
                out[site * 2 + c] = applied[c] * lk[c];
            }
        }
        applied.copy_from_slice(current);
        Ok(())
    })
}

#[test]
fn fixed_point_is_kept() {
    let mut weights = [0.5, 0.5];
    let outcome = run_em(&[[1.0, 1.0], [0.3, 0.3]], &[2, 5], &mut weights).unwrap();
    assert_eq!(
        outcome,
        EmOutcome {
            rounds: 1,
            converged: true
        }
    );
    assert_relative_eq!(weights[0], 0.5);
    assert_relative_eq!(weights[1], 0.5);
}

#[test]
fn weights_follow_pattern_weights() {
    let mut weights = [0.5, 0.5];
    let outcome = run_em(&[[1.0, 0.0], [0.0, 1.0]], &[3, 1], &mut weights).unwrap();
    assert_eq!(outcome.rounds, 2);
    assert!(outcome.converged);
    assert_relative_eq!(weights[0], 0.75, epsilon = 1e-12);
    assert_relative_eq!(weights[1], 0.25, epsilon = 1e-12);
}

#[test]
fn slow_convergence_stops_after_ten_rounds() {
    // The weight ratio halves every round: w0 / w1 = 2^-k.
    let mut weights = [0.5, 0.5];
    let outcome = run_em(&[[1.0, 2.0]], &[1], &mut weights).unwrap();
    assert_eq!(
        outcome,
        EmOutcome {
            rounds: 10,
            converged: false
        }
    );
    assert_relative_eq!(weights[0], 1.0 / 1025.0, epsilon = 1e-12);
    assert_relative_eq!(weights[1], 1024.0 / 1025.0, epsilon = 1e-12);
}

#[test]
fn weights_sum_to_one() {
    let mut weights = [0.2, 0.8];
    run_em(
        &[[0.1, 0.4], [0.7, 0.2], [0.5, 0.5]],
        &[4, 2, 1],
        &mut weights,
    )
    .unwrap();
    assert_relative_eq!(weights.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
}

#[test]
fn dimension_mismatch() {
    let mut weights = [0.5, 0.5];
    let mut sitecat = vec![0.0; 3];
    let err = minimize_em(&mut weights, &mut sitecat, &[1, 1], |_, _| Ok(())).unwrap_err();
    assert_matches!(
        err.downcast_ref::<OptimisationError>(),
        Some(OptimisationError::InvalidParameter(_))
    );
}

#[test]
fn update_errors_propagate() {
    let mut weights = [0.5, 0.5];
    let mut sitecat = vec![0.0; 2];
    let err = minimize_em(&mut weights, &mut sitecat, &[1], |_, _| {
        anyhow::bail!("no likelihoods")
    })
    .unwrap_err();
    assert_eq!(err.to_string(), "no likelihoods");
}
