use anyhow::bail;

use crate::optimisers::OptimisationError;
use crate::Result;

pub mod gamma;
pub mod partition;
pub mod substitution_model;

pub use partition::{Partition, PartitionBuilder};
pub use substitution_model::{SubstMatrix, SubstitutionModel};

/// Partial likelihood update: the CLV of `parent` is recomputed from its two children across
/// the edges with probability matrices `child1_matrix` and `child2_matrix`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub parent_clv: usize,
    pub parent_scaler: Option<usize>,
    pub child1_clv: usize,
    pub child1_scaler: Option<usize>,
    pub child1_matrix: usize,
    pub child2_clv: usize,
    pub child2_scaler: Option<usize>,
    pub child2_matrix: usize,
}

/// Where the log-likelihood of a tree is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationPoint {
    Edge {
        parent_clv: usize,
        parent_scaler: Option<usize>,
        child_clv: usize,
        child_scaler: Option<usize>,
        matrix: usize,
    },
    Root {
        clv: usize,
        scaler: Option<usize>,
    },
}

/// Everything needed to bring a partition up to date for a given tree and evaluate it:
/// the partial updates in post-order, every branch with its matrix index, and the point
/// at which the likelihood is computed.
#[derive(Debug, Clone, PartialEq)]
pub struct LikelihoodSetup {
    pub operations: Vec<Operation>,
    pub matrix_indices: Vec<usize>,
    pub branch_lengths: Vec<f64>,
    pub params_indices: Vec<usize>,
    pub evaluation: EvaluationPoint,
}

impl LikelihoodSetup {
    pub fn is_rooted(&self) -> bool {
        matches!(self.evaluation, EvaluationPoint::Root { .. })
    }

    /// Recomputes every probability matrix and every partial likelihood.
    pub fn update_all<P: LikelihoodPartition>(&self, partition: &mut P) -> Result<()> {
        partition.update_prob_matrices(
            &self.params_indices,
            &self.matrix_indices,
            &self.branch_lengths,
        )?;
        partition.update_partials(&self.operations)
    }

    /// Recomputes only the probability matrix at position `slot` of `matrix_indices`.
    pub fn update_single<P: LikelihoodPartition>(&self, partition: &mut P, slot: usize) -> Result<()> {
        partition.update_prob_matrices(
            &self.params_indices,
            &self.matrix_indices[slot..slot + 1],
            &self.branch_lengths[slot..slot + 1],
        )
    }

    pub fn loglikelihood<P: LikelihoodPartition>(&self, partition: &P) -> f64 {
        match self.evaluation {
            EvaluationPoint::Edge {
                parent_clv,
                parent_scaler,
                child_clv,
                child_scaler,
                matrix,
            } => partition.edge_loglikelihood(
                parent_clv,
                parent_scaler,
                child_clv,
                child_scaler,
                matrix,
                &self.params_indices,
            ),
            EvaluationPoint::Root { clv, scaler } => {
                partition.root_loglikelihood(clv, scaler, &self.params_indices)
            }
        }
    }
}

/// Scratch buffer of per-site, per-category, per-state products at one edge, from which the
/// derivatives of the likelihood with respect to that edge's length follow in linear time.
#[derive(Debug, Clone)]
pub struct SumTable {
    pub(crate) values: Vec<f64>,
    pub(crate) sites: usize,
    pub(crate) rate_cats: usize,
    pub(crate) states: usize,
}

impl SumTable {
    pub fn new(sites: usize, rate_cats: usize, states: usize) -> Result<Self> {
        let len = sites * rate_cats * states;
        let mut values = Vec::new();
        if values.try_reserve_exact(len).is_err() {
            bail!(OptimisationError::Allocation(format!(
                "Cannot allocate a sum-table of {} entries",
                len
            )));
        }
        values.resize(len, 0.0);
        Ok(Self {
            values,
            sites,
            rate_cats,
            states,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn site_category(&self, site: usize, category: usize) -> &[f64] {
        let start = (site * self.rate_cats + category) * self.states;
        &self.values[start..start + self.states]
    }
}

/// Numeric state of one substitution model over a set of site patterns, as seen by the
/// optimisers. Indices of CLVs, scalers and probability matrices come from the tree.
pub trait LikelihoodPartition {
    fn states(&self) -> usize;
    fn sites(&self) -> usize;
    fn rate_cats(&self) -> usize;
    fn rate_matrices(&self) -> usize;
    fn pattern_weights(&self) -> &[u32];

    fn subst_rates(&self, matrix: usize) -> &[f64];
    fn frequencies(&self, matrix: usize) -> &[f64];
    fn prop_invar(&self, matrix: usize) -> f64;
    fn category_rates(&self) -> &[f64];
    fn category_weights(&self) -> &[f64];

    fn set_subst_rates(&mut self, matrix: usize, rates: &[f64]) -> Result<()>;
    fn set_frequencies(&mut self, matrix: usize, frequencies: &[f64]) -> Result<()>;
    fn set_prop_invar(&mut self, matrix: usize, prop_invar: f64) -> Result<()>;
    fn set_category_rates(&mut self, rates: &[f64]) -> Result<()>;
    fn set_category_weights(&mut self, weights: &[f64]) -> Result<()>;

    fn update_prob_matrices(
        &mut self,
        params_indices: &[usize],
        matrix_indices: &[usize],
        lengths: &[f64],
    ) -> Result<()>;

    fn update_partials(&mut self, operations: &[Operation]) -> Result<()>;

    fn edge_loglikelihood(
        &self,
        parent_clv: usize,
        parent_scaler: Option<usize>,
        child_clv: usize,
        child_scaler: Option<usize>,
        matrix: usize,
        params_indices: &[usize],
    ) -> f64;

    fn root_loglikelihood(&self, clv: usize, scaler: Option<usize>, params_indices: &[usize])
        -> f64;

    fn update_sumtable(
        &self,
        parent_clv: usize,
        child_clv: usize,
        params_indices: &[usize],
        sumtable: &mut SumTable,
    ) -> Result<()>;

    /// First and second derivative of the negative log-likelihood with respect to the length
    /// of the edge the sum-table was built for.
    fn derivatives(
        &self,
        parent_scaler: Option<usize>,
        child_scaler: Option<usize>,
        length: f64,
        params_indices: &[usize],
        sumtable: &SumTable,
    ) -> Result<(f64, f64)>;

    /// Per-site, per-category likelihood contributions across an edge, weighted by the
    /// current category weights, written to `out[site * rate_cats + category]`.
    #[allow(clippy::too_many_arguments)]
    fn sitecat_likelihoods(
        &self,
        parent_clv: usize,
        parent_scaler: Option<usize>,
        child_clv: usize,
        child_scaler: Option<usize>,
        matrix: usize,
        params_indices: &[usize],
        out: &mut [f64],
    ) -> Result<()>;
}
