use std::f64::consts::LN_2;

use anyhow::bail;
use hashbrown::HashMap;
use log::{debug, info};

use crate::alphabets::{Alphabet, StateMask};
use crate::io::DataError;
use crate::likelihood::{LikelihoodPartition, Operation, SubstitutionModel, SumTable};
use crate::msa::Patterns;
use crate::optimisers::OptimisationError;
use crate::tree::UTree;
use crate::Result;

/// Sites whose partial likelihoods all drop below 2^-256 are rescaled by 2^256.
const SCALE_EXPONENT: f64 = 256.0;
const SCALE_THRESHOLD: f64 = 8.636168555094445e-78;
const SCALE_FACTOR: f64 = 1.157920892373162e77;
const LN_SCALE: f64 = SCALE_EXPONENT * LN_2;

/// Weights are accepted if they sum to one within this tolerance and get renormalised.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-4;

/// Conditional likelihood vectors, probability matrices and model parameters of one set of
/// site patterns. Tip CLVs occupy indices `0..tips`, inner CLVs follow.
#[derive(Clone, Debug)]
pub struct Partition {
    tips: usize,
    states: usize,
    sites: usize,
    rate_cats: usize,
    pattern_weights: Vec<u32>,
    models: Vec<SubstitutionModel>,
    rates: Vec<f64>,
    rate_weights: Vec<f64>,
    clv: Vec<Vec<f64>>,
    pmatrix: Vec<Vec<f64>>,
    scalers: Vec<Vec<u32>>,
    tip_masks: Vec<Vec<StateMask>>,
    invariant: Option<Vec<Option<usize>>>,
}

impl Partition {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tips: usize,
        clv_buffers: usize,
        states: usize,
        sites: usize,
        rate_matrices: usize,
        prob_matrices: usize,
        rate_cats: usize,
        scale_buffers: usize,
    ) -> Result<Self> {
        if rate_matrices == 0 || rate_cats == 0 {
            bail!(OptimisationError::InvalidParameter(String::from(
                "A partition needs at least one rate matrix and one rate category"
            )));
        }
        if states > StateMask::BITS as usize {
            bail!(OptimisationError::InvalidParameter(format!(
                "At most {} states are supported, got {}",
                StateMask::BITS,
                states
            )));
        }
        let models = (0..rate_matrices)
            .map(|_| SubstitutionModel::new(states))
            .collect::<Result<Vec<_>>>()?;
        let clv_len = sites * rate_cats * states;
        Ok(Self {
            tips,
            states,
            sites,
            rate_cats,
            pattern_weights: vec![1; sites],
            models,
            rates: vec![1.0; rate_cats],
            rate_weights: vec![1.0 / rate_cats as f64; rate_cats],
            clv: vec![vec![0.0; clv_len]; tips + clv_buffers],
            pmatrix: vec![vec![0.0; rate_cats * states * states]; prob_matrices],
            scalers: vec![vec![0; sites]; scale_buffers],
            tip_masks: vec![Vec::new(); tips],
            invariant: None,
        })
    }

    pub fn tips(&self) -> usize {
        self.tips
    }

    pub fn model(&self, matrix: usize) -> &SubstitutionModel {
        &self.models[matrix]
    }

    pub fn clv(&self, clv_index: usize) -> &[f64] {
        &self.clv[clv_index]
    }

    pub fn pmatrix(&self, matrix: usize) -> &[f64] {
        &self.pmatrix[matrix]
    }

    pub fn tip_masks(&self, tip: usize) -> &[StateMask] {
        &self.tip_masks[tip]
    }

    pub fn invariant_sites(&self) -> Option<&[Option<usize>]> {
        self.invariant.as_deref()
    }

    pub fn set_pattern_weights(&mut self, weights: &[u32]) -> Result<()> {
        if weights.len() != self.sites {
            bail!(OptimisationError::InvalidParameter(format!(
                "Expected {} pattern weights, got {}",
                self.sites,
                weights.len()
            )));
        }
        self.pattern_weights = weights.to_vec();
        Ok(())
    }

    /// Sets the CLV of a tip from its sequence, every state compatible with a character
    /// getting likelihood one.
    pub fn set_tip_states(&mut self, tip: usize, alphabet: &Alphabet, sequence: &[u8]) -> Result<()> {
        if tip >= self.tips {
            bail!(OptimisationError::InvalidParameter(format!(
                "Tip index {} out of range for {} tips",
                tip, self.tips
            )));
        }
        if sequence.len() != self.sites || alphabet.states() != self.states {
            bail!(DataError {
                message: format!(
                    "Sequence of length {} over {} states does not fit a partition of {} sites and {} states",
                    sequence.len(),
                    alphabet.states(),
                    self.sites,
                    self.states
                ),
            });
        }
        let mut masks = Vec::with_capacity(self.sites);
        for &char in sequence {
            let mask = alphabet.mask(char);
            if mask == 0 {
                bail!(DataError {
                    message: format!("Invalid character {} for tip {}", char as char, tip),
                });
            }
            masks.push(mask);
        }
        let (n, cats) = (self.states, self.rate_cats);
        let clv = &mut self.clv[tip];
        for (s, mask) in masks.iter().enumerate() {
            for c in 0..cats {
                let base = (s * cats + c) * n;
                for i in 0..n {
                    clv[base + i] = if mask & (1 << i) != 0 { 1.0 } else { 0.0 };
                }
            }
        }
        self.tip_masks[tip] = masks;
        self.invariant = None;
        Ok(())
    }

    /// Marks every site at which all tips share exactly one possible state.
    pub fn update_invariant_sites(&mut self) {
        let invariant = (0..self.sites)
            .map(|s| {
                let common = self
                    .tip_masks
                    .iter()
                    .filter(|masks| !masks.is_empty())
                    .fold(StateMask::MAX, |acc, masks| acc & masks[s]);
                if common != 0 && common.is_power_of_two() {
                    Some(common.trailing_zeros() as usize)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();
        debug!(
            "Found {} invariant site pattern(s) out of {}.",
            invariant.iter().filter(|s| s.is_some()).count(),
            self.sites
        );
        self.invariant = Some(invariant);
    }

    fn invariant_state(&self, site: usize) -> Option<usize> {
        self.invariant.as_ref().and_then(|inv| inv[site])
    }

    fn site_scale(&self, scalers: &[Option<usize>], site: usize) -> u32 {
        scalers
            .iter()
            .flatten()
            .map(|&idx| self.scalers[idx][site])
            .sum()
    }

    fn invariant_term(&self, site: usize, params_indices: &[usize]) -> f64 {
        match self.invariant_state(site) {
            Some(state) => params_indices
                .iter()
                .zip(self.rate_weights.iter())
                .map(|(&m, w)| {
                    let model = &self.models[m];
                    w * model.prop_invar() * model.frequencies()[state]
                })
                .sum(),
            None => 0.0,
        }
    }

    fn check_params_indices(&self, params_indices: &[usize]) -> Result<()> {
        if params_indices.len() != self.rate_cats
            || params_indices.iter().any(|&m| m >= self.models.len())
        {
            bail!(OptimisationError::InvalidParameter(format!(
                "Invalid rate matrix indices {:?} for {} categories and {} matrices",
                params_indices,
                self.rate_cats,
                self.models.len()
            )));
        }
        Ok(())
    }

    fn check_model(&self, matrix: usize) -> Result<()> {
        if matrix >= self.models.len() {
            bail!(OptimisationError::InvalidParameter(format!(
                "Rate matrix index {} out of range",
                matrix
            )));
        }
        Ok(())
    }
}

/// Log of a site likelihood whose variable part was rescaled `scale` times.
fn site_loglikelihood(variable: f64, invariant: f64, scale: u32) -> f64 {
    if scale == 0 {
        return (variable + invariant).ln();
    }
    let ln_variable = variable.ln() - scale as f64 * LN_SCALE;
    if invariant <= 0.0 {
        return ln_variable;
    }
    let ln_invariant = invariant.ln();
    let max = ln_variable.max(ln_invariant);
    max + ((ln_variable - max).exp() + (ln_invariant - max).exp()).ln()
}

impl LikelihoodPartition for Partition {
    fn states(&self) -> usize {
        self.states
    }

    fn sites(&self) -> usize {
        self.sites
    }

    fn rate_cats(&self) -> usize {
        self.rate_cats
    }

    fn rate_matrices(&self) -> usize {
        self.models.len()
    }

    fn pattern_weights(&self) -> &[u32] {
        &self.pattern_weights
    }

    fn subst_rates(&self, matrix: usize) -> &[f64] {
        self.models[matrix].subst_rates()
    }

    fn frequencies(&self, matrix: usize) -> &[f64] {
        self.models[matrix].frequencies()
    }

    fn prop_invar(&self, matrix: usize) -> f64 {
        self.models[matrix].prop_invar()
    }

    fn category_rates(&self) -> &[f64] {
        &self.rates
    }

    fn category_weights(&self) -> &[f64] {
        &self.rate_weights
    }

    fn set_subst_rates(&mut self, matrix: usize, rates: &[f64]) -> Result<()> {
        self.check_model(matrix)?;
        self.models[matrix].set_subst_rates(rates)
    }

    fn set_frequencies(&mut self, matrix: usize, frequencies: &[f64]) -> Result<()> {
        self.check_model(matrix)?;
        self.models[matrix].set_frequencies(frequencies)
    }

    fn set_prop_invar(&mut self, matrix: usize, prop_invar: f64) -> Result<()> {
        self.check_model(matrix)?;
        if prop_invar > 0.0 && self.invariant.is_none() {
            self.update_invariant_sites();
        }
        self.models[matrix].set_prop_invar(prop_invar)
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        if rates.len() != self.rate_cats || rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            bail!(OptimisationError::InvalidParameter(format!(
                "Expected {} finite non-negative category rates, got {:?}",
                self.rate_cats, rates
            )));
        }
        self.rates = rates.to_vec();
        Ok(())
    }

    fn set_category_weights(&mut self, weights: &[f64]) -> Result<()> {
        if weights.len() != self.rate_cats || weights.iter().any(|w| !w.is_finite() || *w < 0.0)
        {
            bail!(OptimisationError::InvalidParameter(format!(
                "Expected {} finite non-negative category weights, got {:?}",
                self.rate_cats, weights
            )));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            bail!(OptimisationError::InvalidParameter(format!(
                "Category weights must sum to 1.0, got {}",
                sum
            )));
        }
        self.rate_weights = weights.iter().map(|w| w / sum).collect();
        Ok(())
    }

    fn update_prob_matrices(
        &mut self,
        params_indices: &[usize],
        matrix_indices: &[usize],
        lengths: &[f64],
    ) -> Result<()> {
        self.check_params_indices(params_indices)?;
        if matrix_indices.len() != lengths.len() {
            bail!(OptimisationError::InvalidParameter(format!(
                "Got {} matrix indices but {} branch lengths",
                matrix_indices.len(),
                lengths.len()
            )));
        }
        let block = self.states * self.states;
        for (&idx, &length) in matrix_indices.iter().zip(lengths) {
            if idx >= self.pmatrix.len() || !length.is_finite() || length < 0.0 {
                bail!(OptimisationError::InvalidParameter(format!(
                    "Cannot set probability matrix {} for branch length {}",
                    idx, length
                )));
            }
            let pmatrix = &mut self.pmatrix[idx];
            for (c, (&m, &rate)) in params_indices.iter().zip(&self.rates).enumerate() {
                self.models[m].p_into(length * rate, &mut pmatrix[c * block..(c + 1) * block]);
            }
        }
        Ok(())
    }

    fn update_partials(&mut self, operations: &[Operation]) -> Result<()> {
        let (n, cats, sites) = (self.states, self.rate_cats, self.sites);
        let span = cats * n;
        for op in operations {
            let clvs = [op.parent_clv, op.child1_clv, op.child2_clv];
            if clvs.iter().any(|&c| c >= self.clv.len())
                || op.child1_matrix >= self.pmatrix.len()
                || op.child2_matrix >= self.pmatrix.len()
                || op.parent_clv == op.child1_clv
                || op.parent_clv == op.child2_clv
            {
                bail!(OptimisationError::InvalidParameter(format!(
                    "Invalid partial likelihood operation {:?}",
                    op
                )));
            }

            let mut parent = std::mem::take(&mut self.clv[op.parent_clv]);
            let left = &self.clv[op.child1_clv];
            let right = &self.clv[op.child2_clv];
            let left_p = &self.pmatrix[op.child1_matrix];
            let right_p = &self.pmatrix[op.child2_matrix];
            for s in 0..sites {
                for c in 0..cats {
                    let base = (s * cats + c) * n;
                    let pbase = c * n * n;
                    for i in 0..n {
                        let row = pbase + i * n;
                        let mut l = 0.0;
                        let mut r = 0.0;
                        for j in 0..n {
                            l += left_p[row + j] * left[base + j];
                            r += right_p[row + j] * right[base + j];
                        }
                        parent[base + i] = l * r;
                    }
                }
            }

            if let Some(scaler_idx) = op.parent_scaler {
                let mut scaler = std::mem::take(&mut self.scalers[scaler_idx]);
                for (s, count) in scaler.iter_mut().enumerate() {
                    let inherited = self.site_scale(&[op.child1_scaler, op.child2_scaler], s);
                    let site = &mut parent[s * span..(s + 1) * span];
                    let max = site.iter().fold(0.0_f64, |acc, v| acc.max(*v));
                    *count = inherited;
                    if max < SCALE_THRESHOLD {
                        site.iter_mut().for_each(|v| *v *= SCALE_FACTOR);
                        *count += 1;
                    }
                }
                self.scalers[scaler_idx] = scaler;
            }
            self.clv[op.parent_clv] = parent;
        }
        Ok(())
    }

    fn edge_loglikelihood(
        &self,
        parent_clv: usize,
        parent_scaler: Option<usize>,
        child_clv: usize,
        child_scaler: Option<usize>,
        matrix: usize,
        params_indices: &[usize],
    ) -> f64 {
        let n = self.states;
        let cats = self.rate_cats;
        let parent = &self.clv[parent_clv];
        let child = &self.clv[child_clv];
        let pmatrix = &self.pmatrix[matrix];

        let mut logl = 0.0;
        for s in 0..self.sites {
            let mut variable = 0.0;
            for (c, &m) in params_indices.iter().enumerate() {
                let model = &self.models[m];
                let freqs = model.frequencies();
                let base = (s * cats + c) * n;
                let pbase = c * n * n;
                let mut term = 0.0;
                for i in 0..n {
                    let row = pbase + i * n;
                    let mut t = 0.0;
                    for j in 0..n {
                        t += pmatrix[row + j] * child[base + j];
                    }
                    term += freqs[i] * parent[base + i] * t;
                }
                variable += self.rate_weights[c] * (1.0 - model.prop_invar()) * term;
            }
            let invariant = self.invariant_term(s, params_indices);
            let scale = self.site_scale(&[parent_scaler, child_scaler], s);
            logl +=
                self.pattern_weights[s] as f64 * site_loglikelihood(variable, invariant, scale);
        }
        logl
    }

    fn root_loglikelihood(
        &self,
        clv: usize,
        scaler: Option<usize>,
        params_indices: &[usize],
    ) -> f64 {
        let n = self.states;
        let cats = self.rate_cats;
        let root = &self.clv[clv];

        let mut logl = 0.0;
        for s in 0..self.sites {
            let mut variable = 0.0;
            for (c, &m) in params_indices.iter().enumerate() {
                let model = &self.models[m];
                let base = (s * cats + c) * n;
                let term: f64 = model
                    .frequencies()
                    .iter()
                    .zip(&root[base..base + n])
                    .map(|(f, l)| f * l)
                    .sum();
                variable += self.rate_weights[c] * (1.0 - model.prop_invar()) * term;
            }
            let invariant = self.invariant_term(s, params_indices);
            let scale = self.site_scale(&[scaler], s);
            logl +=
                self.pattern_weights[s] as f64 * site_loglikelihood(variable, invariant, scale);
        }
        logl
    }

    fn update_sumtable(
        &self,
        parent_clv: usize,
        child_clv: usize,
        params_indices: &[usize],
        sumtable: &mut SumTable,
    ) -> Result<()> {
        self.check_params_indices(params_indices)?;
        let (n, cats) = (self.states, self.rate_cats);
        if sumtable.sites != self.sites || sumtable.rate_cats != cats || sumtable.states != n {
            bail!(OptimisationError::InvalidParameter(String::from(
                "Sum-table dimensions do not match the partition"
            )));
        }
        let parent = &self.clv[parent_clv];
        let child = &self.clv[child_clv];
        for s in 0..self.sites {
            for (c, &m) in params_indices.iter().enumerate() {
                let model = &self.models[m];
                let freqs = model.frequencies();
                let eigenvectors = model.eigenvectors();
                let inv_eigenvectors = model.inv_eigenvectors();
                let base = (s * cats + c) * n;
                for k in 0..n {
                    let mut left = 0.0;
                    let mut right = 0.0;
                    for i in 0..n {
                        left += freqs[i] * parent[base + i] * eigenvectors[(i, k)];
                        right += inv_eigenvectors[(k, i)] * child[base + i];
                    }
                    sumtable.values[base + k] = left * right;
                }
            }
        }
        Ok(())
    }

    fn derivatives(
        &self,
        parent_scaler: Option<usize>,
        child_scaler: Option<usize>,
        length: f64,
        params_indices: &[usize],
        sumtable: &SumTable,
    ) -> Result<(f64, f64)> {
        self.check_params_indices(params_indices)?;
        let mut d1 = 0.0;
        let mut d2 = 0.0;
        for s in 0..self.sites {
            let mut v0 = 0.0;
            let mut v1 = 0.0;
            let mut v2 = 0.0;
            for (c, &m) in params_indices.iter().enumerate() {
                let model = &self.models[m];
                let rate = self.rates[c];
                let mut t0 = 0.0;
                let mut t1 = 0.0;
                let mut t2 = 0.0;
                for (lambda, st) in model
                    .eigenvalues()
                    .iter()
                    .zip(sumtable.site_category(s, c))
                {
                    let lr = lambda * rate;
                    let e = (lr * length).exp() * st;
                    t0 += e;
                    t1 += lr * e;
                    t2 += lr * lr * e;
                }
                let w = self.rate_weights[c] * (1.0 - model.prop_invar());
                v0 += w * t0;
                v1 += w * t1;
                v2 += w * t2;
            }
            let invariant = self.invariant_term(s, params_indices);
            let scale = self.site_scale(&[parent_scaler, child_scaler], s);
            let site_lk = if invariant > 0.0 {
                v0 + invariant * (scale as f64 * LN_SCALE).exp()
            } else {
                v0
            };
            if site_lk <= 0.0 {
                continue;
            }
            let a = v1 / site_lk;
            let b = v2 / site_lk;
            let weight = self.pattern_weights[s] as f64;
            d1 -= weight * a;
            d2 -= weight * (b - a * a);
        }
        Ok((d1, d2))
    }

    fn sitecat_likelihoods(
        &self,
        parent_clv: usize,
        _parent_scaler: Option<usize>,
        child_clv: usize,
        _child_scaler: Option<usize>,
        matrix: usize,
        params_indices: &[usize],
        out: &mut [f64],
    ) -> Result<()> {
        self.check_params_indices(params_indices)?;
        let (n, cats) = (self.states, self.rate_cats);
        if out.len() != self.sites * cats {
            bail!(OptimisationError::InvalidParameter(format!(
                "Expected a buffer of {} site-category entries, got {}",
                self.sites * cats,
                out.len()
            )));
        }
        let parent = &self.clv[parent_clv];
        let child = &self.clv[child_clv];
        let pmatrix = &self.pmatrix[matrix];
        // Scalers are shared by every category of a site and cancel out.
        for s in 0..self.sites {
            for (c, &m) in params_indices.iter().enumerate() {
                let freqs = self.models[m].frequencies();
                let base = (s * cats + c) * n;
                let pbase = c * n * n;
                let mut term = 0.0;
                for i in 0..n {
                    let row = pbase + i * n;
                    let t: f64 = (0..n).map(|j| pmatrix[row + j] * child[base + j]).sum();
                    term += freqs[i] * parent[base + i] * t;
                }
                out[s * cats + c] = self.rate_weights[c] * term;
            }
        }
        Ok(())
    }
}

/// Builds a partition for a tree from compressed site patterns, matching tips to sequences
/// by label.
pub struct PartitionBuilder<'a> {
    patterns: &'a Patterns,
    tree: &'a UTree,
    rate_cats: usize,
    rate_matrices: usize,
}

impl<'a> PartitionBuilder<'a> {
    pub fn new(patterns: &'a Patterns, tree: &'a UTree) -> Self {
        Self {
            patterns,
            tree,
            rate_cats: 1,
            rate_matrices: 1,
        }
    }

    pub fn rate_categories(mut self, rate_cats: usize) -> Self {
        self.rate_cats = rate_cats;
        self
    }

    pub fn rate_matrices(mut self, rate_matrices: usize) -> Self {
        self.rate_matrices = rate_matrices;
        self
    }

    pub fn build(self) -> Result<Partition> {
        let alphabet = self.patterns.sequence_type().alphabet();
        let rows: HashMap<&str, usize> = self
            .patterns
            .labels()
            .iter()
            .enumerate()
            .map(|(i, label)| (label.as_str(), i))
            .collect();

        let tips = self.tree.tip_count();
        let inner = self.tree.inner_count();
        let mut partition = Partition::new(
            tips,
            inner,
            alphabet.states(),
            self.patterns.pattern_count(),
            self.rate_matrices,
            self.tree.branch_count(),
            self.rate_cats,
            inner,
        )?;
        partition.set_pattern_weights(self.patterns.weights())?;
        for tip in 0..tips {
            let label = self.tree.tip_label(tip);
            let Some(&row) = rows.get(label) else {
                bail!(DataError {
                    message: format!("Tip {} has no matching sequence", label),
                });
            };
            partition.set_tip_states(tip, &alphabet, self.patterns.sequence(row))?;
        }
        partition.update_invariant_sites();
        info!(
            "Built partition: {} tips, {} site patterns, {} states, {} rate categories.",
            tips,
            self.patterns.pattern_count(),
            alphabet.states(),
            self.rate_cats
        );
        Ok(partition)
    }
}
