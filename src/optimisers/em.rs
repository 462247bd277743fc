use anyhow::bail;
use log::debug;

use crate::optimisers::OptimisationError;
use crate::Result;

const MAX_ROUNDS: usize = 10;
const CONVERGENCE_THRESHOLD: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmOutcome {
    pub rounds: usize,
    pub converged: bool,
}

/// Expectation-maximisation of mixture weights (Wang, Li, Susko and Roger, 2008).
///
/// `sitecat_lh` holds the weighted per-site, per-category likelihoods, `sites x weights.len()`
/// row-major, and is refreshed by `update` at the start of every round. `update` receives the
/// weights of the current round. From the second round on the refreshed values are rescaled by
/// the ratio of the new to the old weights of the previous round.
pub fn minimize_em<F>(
    weights: &mut [f64],
    sitecat_lh: &mut [f64],
    site_weights: &[u32],
    mut update: F,
) -> Result<EmOutcome>
where
    F: FnMut(&[f64], &mut [f64]) -> Result<()>,
{
    let cats = weights.len();
    if cats == 0 || sitecat_lh.len() != site_weights.len() * cats {
        bail!(OptimisationError::InvalidParameter(format!(
            "{} site-category likelihoods do not fit {} sites and {} categories",
            sitecat_lh.len(),
            site_weights.len(),
            cats
        )));
    }
    let total: f64 = site_weights.iter().map(|&w| w as f64).sum();
    let mut new_weights = vec![0.0; cats];
    let mut ratios: Option<Vec<f64>> = None;

    for round in 1..=MAX_ROUNDS {
        update(weights, sitecat_lh)?;

        if let Some(ratios) = &ratios {
            for site in sitecat_lh.chunks_exact_mut(cats) {
                site.iter_mut().zip(ratios).for_each(|(lk, r)| *lk *= r);
            }
        }

        new_weights.iter_mut().for_each(|w| *w = 0.0);
        for (site, &w) in sitecat_lh.chunks_exact(cats).zip(site_weights) {
            let site_lk: f64 = site.iter().sum();
            let scale = w as f64 / site_lk;
            for (new, lk) in new_weights.iter_mut().zip(site) {
                *new += lk * scale;
            }
        }

        let mut converged = true;
        let mut round_ratios = vec![0.0; cats];
        for c in 0..cats {
            new_weights[c] /= total;
            converged &= (weights[c] - new_weights[c]).abs() < CONVERGENCE_THRESHOLD;
            round_ratios[c] = new_weights[c] / weights[c];
            weights[c] = new_weights[c];
        }
        ratios = Some(round_ratios);
        debug!("EM round {}: weights {:?}", round, weights);

        if converged {
            return Ok(EmOutcome {
                rounds: round,
                converged: true,
            });
        }
    }
    Ok(EmOutcome {
        rounds: MAX_ROUNDS,
        converged: false,
    })
}
