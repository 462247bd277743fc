use anyhow::bail;
use log::{debug, info, warn};

use crate::likelihood::{LikelihoodPartition, SumTable};
use crate::optimisers::{
    minimize_newton, BranchOptimisationResult, DerivativeOracle, OptimisationError,
};
use crate::parameters::{
    BRANCH_LENGTH_TOLERANCE, DEFAULT_BRANCH_LENGTH, MAX_BRANCH_LENGTH, MIN_BRANCH_LENGTH,
};
use crate::tree::{NodeIdx, UTree};
use crate::Result;

const NEWTON_MAX_ITERATIONS: usize = 10;
/// Length changes at or below this leave the probability matrix untouched.
const MIN_LENGTH_CHANGE: f64 = 1e-10;
/// Rounding noise tolerated when comparing log-likelihoods of consecutive rounds.
const MONOTONICITY_SLACK: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchOptimiserConfig {
    pub min_length: f64,
    pub max_length: f64,
    pub tolerance: f64,
    pub smoothings: usize,
    pub radius: Option<usize>,
    pub keep_update: bool,
    pub check_improvement: bool,
}

impl Default for BranchOptimiserConfig {
    fn default() -> Self {
        Self {
            min_length: MIN_BRANCH_LENGTH,
            max_length: MAX_BRANCH_LENGTH,
            tolerance: BRANCH_LENGTH_TOLERANCE,
            smoothings: 32,
            radius: None,
            keep_update: true,
            check_improvement: true,
        }
    }
}

impl BranchOptimiserConfig {
    pub fn min_length(mut self, min_length: f64) -> Self {
        self.min_length = min_length;
        self
    }

    pub fn max_length(mut self, max_length: f64) -> Self {
        self.max_length = max_length;
        self
    }

    /// Log-likelihood gain below which the smoothing rounds stop.
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn smoothings(mut self, smoothings: usize) -> Self {
        self.smoothings = smoothings;
        self
    }

    /// How many edges away from the starting edge the walk reaches, `None` for the whole tree.
    pub fn radius(mut self, radius: Option<usize>) -> Self {
        self.radius = radius;
        self
    }

    /// Update the probability matrix of an edge as soon as its length changes.
    pub fn keep_update(mut self, keep_update: bool) -> Self {
        self.keep_update = keep_update;
        self
    }

    /// Only commit a new length if the log-likelihood does not drop.
    pub fn check_improvement(mut self, check_improvement: bool) -> Self {
        self.check_improvement = check_improvement;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(self.min_length > 0.0 && self.max_length > self.min_length) {
            bail!(OptimisationError::InvalidParameter(format!(
                "Branch length bounds [{}, {}] are not a valid interval",
                self.min_length, self.max_length
            )));
        }
        if !(self.tolerance > 0.0) {
            bail!(OptimisationError::InvalidParameter(format!(
                "Branch length tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }

    fn newton_tolerance(&self) -> f64 {
        self.min_length / 10.0
    }
}

/// Newton-Raphson optimisation of every branch length reachable from a starting edge.
///
/// The partials of the partition are re-oriented while walking the tree so that each visited
/// edge sees likelihood vectors pointing at it. Each node is returned to its entry orientation
/// before the walk leaves it.
pub struct BranchOptimiser<'a, P: LikelihoodPartition> {
    pub(crate) tree: &'a mut UTree,
    pub(crate) partition: &'a mut P,
    pub(crate) params_indices: Vec<usize>,
    pub(crate) config: BranchOptimiserConfig,
}

impl<'a, P: LikelihoodPartition> BranchOptimiser<'a, P> {
    pub fn new(
        tree: &'a mut UTree,
        partition: &'a mut P,
        params_indices: &[usize],
        config: BranchOptimiserConfig,
    ) -> Self {
        Self {
            tree,
            partition,
            params_indices: params_indices.to_vec(),
            config,
        }
    }

    /// Runs smoothing rounds over both directions of the edge at `start`.
    pub fn run(self, start: NodeIdx) -> Result<BranchOptimisationResult> {
        self.config.validate()?;
        if start >= self.tree.node_count() {
            bail!(OptimisationError::InvalidParameter(format!(
                "Starting edge {} is not part of a tree with {} records",
                start,
                self.tree.node_count()
            )));
        }
        info!("Optimising branch lengths.");

        let setup = self.tree.likelihood_setup(start, &self.params_indices);
        setup.update_all(self.partition)?;
        let initial_logl = setup.loglikelihood(self.partition);
        info!("Initial logl: {}.", initial_logl);

        let sumtable = SumTable::new(
            self.partition.sites(),
            self.partition.rate_cats(),
            self.partition.states(),
        )?;
        let config = self.config;
        let mut walker = EdgeWalker {
            tree: self.tree,
            partition: self.partition,
            params_indices: &self.params_indices,
            config: &config,
            sumtable,
            monitor: initial_logl,
        };

        let mut logl = initial_logl;
        let mut iterations = 0;
        while iterations < config.smoothings {
            iterations += 1;
            walker.monitor = logl;
            walker.optimise_subtree(start, config.radius)?;
            let back = walker.tree.back(start);
            walker.optimise_subtree(back, config.radius.map(|r| r.saturating_sub(1)))?;

            let new_logl = walker.round_loglikelihood(start)?;
            debug!("Smoothing round {}: logl {}", iterations, new_logl);
            if new_logl < logl - MONOTONICITY_SLACK {
                warn!(
                    "Branch length optimisation decreased the logl from {} to {}.",
                    logl, new_logl
                );
                debug_assert!(
                    !(config.check_improvement && config.keep_update),
                    "logl decreased from {} to {} in checked mode",
                    logl,
                    new_logl
                );
            }
            let gain = (new_logl - logl).abs();
            logl = new_logl;
            if gain < config.tolerance {
                break;
            }
        }

        info!(
            "Final logl: {}, achieved in {} iteration(s).",
            logl, iterations
        );
        Ok(BranchOptimisationResult {
            initial_logl,
            final_logl: logl,
            iterations,
        })
    }
}

/// Optimises the branch lengths within `radius` edges of `start`.
pub fn optimise_branch_lengths_local<P: LikelihoodPartition>(
    tree: &mut UTree,
    partition: &mut P,
    params_indices: &[usize],
    start: NodeIdx,
    radius: usize,
    config: BranchOptimiserConfig,
) -> Result<BranchOptimisationResult> {
    BranchOptimiser::new(tree, partition, params_indices, config.radius(Some(radius))).run(start)
}

/// Optimises every branch length of the tree.
pub fn optimise_branch_lengths_iterative<P: LikelihoodPartition>(
    tree: &mut UTree,
    partition: &mut P,
    params_indices: &[usize],
    start: NodeIdx,
    config: BranchOptimiserConfig,
) -> Result<BranchOptimisationResult> {
    BranchOptimiser::new(tree, partition, params_indices, config.radius(None)).run(start)
}

/// Derivatives of the negative log-likelihood along one edge, read from a prepared sum-table.
struct EdgeDerivatives<'e, P: LikelihoodPartition> {
    partition: &'e P,
    parent_scaler: Option<usize>,
    child_scaler: Option<usize>,
    params_indices: &'e [usize],
    sumtable: &'e SumTable,
}

impl<P: LikelihoodPartition> DerivativeOracle for EdgeDerivatives<'_, P> {
    fn derivatives(&self, length: f64) -> Result<(f64, f64)> {
        self.partition.derivatives(
            self.parent_scaler,
            self.child_scaler,
            length,
            self.params_indices,
            self.sumtable,
        )
    }
}

/// Undo token of a pivot. Restoring recomputes the partials of the node towards the edge of
/// `record`, the orientation the node had when the walk entered it.
#[must_use]
struct Orientation {
    record: NodeIdx,
}

impl Orientation {
    fn restore<P: LikelihoodPartition>(self, tree: &UTree, partition: &mut P) -> Result<()> {
        orient(tree, partition, self.record)
    }
}

/// Points the partials of the inner node of `record` at the edge of `record`.
fn orient<P: LikelihoodPartition>(tree: &UTree, partition: &mut P, record: NodeIdx) -> Result<()> {
    match tree.operation(record) {
        Some(op) => partition.update_partials(&[op]),
        None => Ok(()),
    }
}

struct EdgeWalker<'w, P: LikelihoodPartition> {
    tree: &'w mut UTree,
    partition: &'w mut P,
    params_indices: &'w [usize],
    config: &'w BranchOptimiserConfig,
    sumtable: SumTable,
    /// Best log-likelihood committed so far in the current round.
    monitor: f64,
}

impl<P: LikelihoodPartition> EdgeWalker<'_, P> {
    /// Optimises the edge of `p`, then the edges behind the two other records of its node.
    fn optimise_subtree(&mut self, p: NodeIdx, radius: Option<usize>) -> Result<()> {
        self.optimise_edge(p)?;

        if radius == Some(0) {
            return Ok(());
        }
        let Some((q, z)) = self.tree.children(p) else {
            return Ok(());
        };
        let child_radius = radius.map(|r| r - 1);

        let entry = Orientation { record: p };
        let walked = self.walk_children(q, z, child_radius);
        let restored = entry.restore(self.tree, self.partition);
        walked.and(restored)
    }

    /// Pivots the node towards each of its two other edges in turn and walks the subtree
    /// behind it.
    fn walk_children(&mut self, q: NodeIdx, z: NodeIdx, radius: Option<usize>) -> Result<()> {
        orient(self.tree, self.partition, q)?;
        self.optimise_subtree(self.tree.back(q), radius)?;
        orient(self.tree, self.partition, z)?;
        self.optimise_subtree(self.tree.back(z), radius)
    }

    fn optimise_edge(&mut self, p: NodeIdx) -> Result<()> {
        let back = self.tree.back(p);
        let old = self.tree.length(p);
        assert_eq!(
            old,
            self.tree.length(back),
            "edge {}-{} has different lengths at its ends",
            p,
            back
        );
        let (parent, child) = (self.tree.node(p), self.tree.node(back));
        let (parent_clv, parent_scaler) = (parent.clv_index, parent.scaler_index);
        let (child_clv, child_scaler) = (child.clv_index, child.scaler_index);
        let matrix = parent.pmatrix_index;

        self.partition.update_sumtable(
            parent_clv,
            child_clv,
            self.params_indices,
            &mut self.sumtable,
        )?;

        let (min, max) = (self.config.min_length, self.config.max_length);
        let guess = if old < min || old > max {
            DEFAULT_BRANCH_LENGTH
        } else {
            old
        };
        let oracle = EdgeDerivatives {
            partition: &*self.partition,
            parent_scaler,
            child_scaler,
            params_indices: self.params_indices,
            sumtable: &self.sumtable,
        };
        let length = minimize_newton(
            min,
            guess,
            max,
            self.config.newton_tolerance(),
            NEWTON_MAX_ITERATIONS,
            &oracle,
        )?;

        if !(self.config.keep_update && (length - old).abs() > MIN_LENGTH_CHANGE) {
            self.tree.set_length(p, length);
            return Ok(());
        }
        self.partition
            .update_prob_matrices(self.params_indices, &[matrix], &[length])?;
        if !self.config.check_improvement {
            self.tree.set_length(p, length);
            return Ok(());
        }

        let logl = self.partition.edge_loglikelihood(
            parent_clv,
            parent_scaler,
            child_clv,
            child_scaler,
            matrix,
            self.params_indices,
        );
        if logl >= self.monitor {
            self.monitor = logl;
            self.tree.set_length(p, length);
            debug!("Optimised branch {} to {:.6}, logl {}.", p, length, logl);
        } else {
            debug!(
                "Keeping branch {} at {:.6}, {:.6} lowers the logl to {}.",
                p, old, length, logl
            );
            self.partition
                .update_prob_matrices(self.params_indices, &[matrix], &[old])?;
        }
        Ok(())
    }

    /// Log-likelihood after a smoothing round. Without eager matrix updates the partials are
    /// stale and get recomputed from the tree.
    fn round_loglikelihood(&mut self, start: NodeIdx) -> Result<f64> {
        let setup = self.tree.likelihood_setup(start, self.params_indices);
        if !self.config.keep_update {
            setup.update_all(self.partition)?;
        }
        Ok(setup.loglikelihood(self.partition))
    }
}
