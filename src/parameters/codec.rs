use std::cell::Cell;

use anyhow::bail;

use crate::likelihood::gamma::discrete_gamma_rates;
use crate::likelihood::{EvaluationPoint, LikelihoodPartition, LikelihoodSetup};
use crate::optimisers::OptimisationError;
use crate::parameters::{
    Bound, OptimisationRequest, ParameterKind, ParameterSet, MAX_BRANCH_LENGTH,
    MIN_BRANCH_LENGTH,
};
use crate::Result;

/// Position of one parameter group inside the optimisation vector.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Segment {
    kind: ParameterKind,
    start: usize,
    len: usize,
}

/// Values a decode may overwrite, kept to undo a partially applied vector.
struct Snapshot {
    subst_rates: Option<Vec<f64>>,
    frequencies: Option<Vec<f64>>,
    prop_invar: Vec<(usize, f64)>,
    category_rates: Option<Vec<f64>>,
    category_weights: Option<Vec<f64>>,
    alpha: f64,
    branch_lengths: Vec<f64>,
}

/// Maps the selected model parameters of a partition to a flat vector and back.
///
/// Substitution rates are stored relative to the last exchangeability, frequencies and rate
/// weights relative to their dominant entry. The dominant entries are fixed when the codec is
/// created, so decoding followed by encoding returns the same vector.
#[derive(Debug, Clone)]
pub struct ParameterCodec {
    parameters: ParameterSet,
    segments: Vec<Segment>,
    bounds: Vec<Bound>,
    matrix: usize,
    params_indices: Vec<usize>,
    symmetries: Option<Vec<usize>>,
    alpha: Cell<f64>,
    freq_dominant: usize,
    weight_dominant: usize,
    branch_slot: Option<usize>,
}

impl ParameterCodec {
    pub fn new<P: LikelihoodPartition>(
        request: &OptimisationRequest,
        partition: &P,
        setup: &LikelihoodSetup,
    ) -> Result<Self> {
        let parameters = request.parameters.clone();
        if parameters.contains(ParameterKind::Topology) {
            bail!(OptimisationError::Unimplemented(
                ParameterKind::Topology.to_string()
            ));
        }
        if parameters.is_empty() {
            bail!(OptimisationError::InvalidSelection(String::from(
                "no parameters selected"
            )));
        }
        if parameters.contains(ParameterKind::BranchSingle)
            && parameters.contains(ParameterKind::BranchesAll)
        {
            bail!(OptimisationError::InvalidSelection(String::from(
                "a single branch and all branches cannot be optimised together"
            )));
        }
        if request.params_indices.len() != partition.rate_cats()
            || request
                .params_indices
                .iter()
                .any(|&m| m >= partition.rate_matrices())
        {
            bail!(OptimisationError::InvalidParameter(format!(
                "Rate matrix indices {:?} do not fit {} categories and {} matrices",
                request.params_indices,
                partition.rate_cats(),
                partition.rate_matrices()
            )));
        }
        if request.matrix >= partition.rate_matrices() {
            bail!(OptimisationError::InvalidParameter(format!(
                "Rate matrix {} out of range",
                request.matrix
            )));
        }

        let rate_count = partition.subst_rates(request.matrix).len();
        if let Some(symmetries) = &request.symmetries {
            if symmetries.len() != rate_count {
                bail!(OptimisationError::InvalidParameter(format!(
                    "Expected {} symmetry classes, got {}",
                    rate_count,
                    symmetries.len()
                )));
            }
        }

        let branch_slot = if parameters.contains(ParameterKind::BranchSingle) {
            let EvaluationPoint::Edge { matrix, .. } = setup.evaluation else {
                bail!(OptimisationError::InvalidSelection(String::from(
                    "a single branch requires evaluation at an edge"
                )));
            };
            let Some(slot) = setup.matrix_indices.iter().position(|&m| m == matrix) else {
                bail!(OptimisationError::InvalidParameter(format!(
                    "Evaluation edge matrix {} is not part of the setup",
                    matrix
                )));
            };
            Some(slot)
        } else {
            None
        };

        let mut codec = Self {
            parameters,
            segments: Vec::new(),
            bounds: Vec::new(),
            matrix: request.matrix,
            params_indices: request.params_indices.clone(),
            symmetries: request.symmetries.clone(),
            alpha: Cell::new(request.alpha),
            freq_dominant: dominant(partition.frequencies(request.matrix)),
            weight_dominant: dominant(partition.category_weights()),
            branch_slot,
        };

        let kinds: Vec<ParameterKind> = codec.parameters.iter().collect();
        let mut start = 0;
        for kind in kinds {
            let len = match kind {
                ParameterKind::SubstRates => codec.free_subst_rates(rate_count),
                ParameterKind::Frequencies => partition.states() - 1,
                ParameterKind::PropInvar | ParameterKind::Alpha => 1,
                ParameterKind::FreeRates => partition.rate_cats(),
                ParameterKind::RateWeights => partition.rate_cats() - 1,
                ParameterKind::BranchSingle => 1,
                ParameterKind::BranchesAll => setup.branch_lengths.len(),
                ParameterKind::Topology => 0,
            };
            let bound = match request.bound_override(kind) {
                Some((min, max)) => Bound::new(min, max, Bound::default_for(kind).kind),
                None => Bound::default_for(kind),
            };
            codec.segments.push(Segment { kind, start, len });
            codec.bounds.extend(std::iter::repeat(bound).take(len));
            start += len;
        }
        Ok(codec)
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    /// Length of the optimisation vector.
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn bounds(&self) -> Vec<Bound> {
        self.bounds.clone()
    }

    /// Gamma shape last applied to the partition.
    pub fn alpha(&self) -> f64 {
        self.alpha.get()
    }

    /// Part of `x` that encodes `kind`, if it was selected.
    pub fn slice<'x>(&self, x: &'x [f64], kind: ParameterKind) -> Option<&'x [f64]> {
        self.segments
            .iter()
            .find(|s| s.kind == kind)
            .map(|s| &x[s.start..s.start + s.len])
    }

    pub fn encode<P: LikelihoodPartition>(
        &self,
        partition: &P,
        setup: &LikelihoodSetup,
    ) -> Vec<f64> {
        let mut x = Vec::with_capacity(self.len());
        for segment in &self.segments {
            match segment.kind {
                ParameterKind::SubstRates => {
                    x.extend(self.encode_subst_rates(partition.subst_rates(self.matrix)))
                }
                ParameterKind::Frequencies => x.extend(encode_ratios(
                    partition.frequencies(self.matrix),
                    self.freq_dominant,
                )),
                ParameterKind::PropInvar => {
                    x.push(partition.prop_invar(self.params_indices[0]))
                }
                ParameterKind::Alpha => x.push(self.alpha.get()),
                ParameterKind::FreeRates => x.extend_from_slice(partition.category_rates()),
                ParameterKind::RateWeights => x.extend(encode_ratios(
                    partition.category_weights(),
                    self.weight_dominant,
                )),
                ParameterKind::BranchSingle => {
                    if let Some(slot) = self.branch_slot {
                        x.push(setup.branch_lengths[slot]);
                    }
                }
                ParameterKind::BranchesAll => x.extend_from_slice(&setup.branch_lengths),
                ParameterKind::Topology => {}
            }
        }
        x
    }

    /// Applies `x` to the partition and the setup and brings the affected probability
    /// matrices and partials up to date.
    ///
    /// Either every group is applied or none: when a value is rejected, the groups written
    /// before it are restored and the partition keeps its previous model.
    pub fn decode<P: LikelihoodPartition>(
        &self,
        x: &[f64],
        partition: &mut P,
        setup: &mut LikelihoodSetup,
    ) -> Result<()> {
        if x.len() != self.len() {
            bail!(OptimisationError::InvalidParameter(format!(
                "Expected a vector of {} parameters, got {}",
                self.len(),
                x.len()
            )));
        }
        let snapshot = self.snapshot(partition, setup);
        if let Err(e) = self.apply(x, partition, setup) {
            self.restore(snapshot, partition, setup)?;
            return Err(e);
        }

        match self.branch_slot {
            Some(slot) if self.parameters.is_only(ParameterKind::BranchSingle) => {
                setup.update_single(partition, slot)
            }
            _ => setup.update_all(partition),
        }
    }

    fn apply<P: LikelihoodPartition>(
        &self,
        x: &[f64],
        partition: &mut P,
        setup: &mut LikelihoodSetup,
    ) -> Result<()> {
        for segment in &self.segments {
            let values = &x[segment.start..segment.start + segment.len];
            match segment.kind {
                ParameterKind::SubstRates => {
                    let rate_count = partition.subst_rates(self.matrix).len();
                    let rates = self.decode_subst_rates(values, rate_count);
                    partition.set_subst_rates(self.matrix, &rates)?;
                }
                ParameterKind::Frequencies => {
                    let frequencies = decode_ratios(values, self.freq_dominant);
                    partition.set_frequencies(self.matrix, &frequencies)?;
                }
                ParameterKind::PropInvar => {
                    for m in self.distinct_matrices() {
                        partition.set_prop_invar(m, values[0])?;
                    }
                }
                ParameterKind::Alpha => {
                    let rates = discrete_gamma_rates(values[0], partition.rate_cats())?;
                    partition.set_category_rates(&rates)?;
                    self.alpha.set(values[0]);
                }
                ParameterKind::FreeRates => partition.set_category_rates(values)?,
                ParameterKind::RateWeights => {
                    let weights = decode_ratios(values, self.weight_dominant);
                    partition.set_category_weights(&weights)?;
                }
                ParameterKind::BranchSingle => {
                    if let Some(slot) = self.branch_slot {
                        setup.branch_lengths[slot] = values[0];
                    }
                }
                ParameterKind::BranchesAll => setup.branch_lengths.copy_from_slice(values),
                ParameterKind::Topology => {}
            }
        }
        Ok(())
    }

    fn snapshot<P: LikelihoodPartition>(
        &self,
        partition: &P,
        setup: &LikelihoodSetup,
    ) -> Snapshot {
        let touches = |kind| self.parameters.contains(kind);
        Snapshot {
            subst_rates: touches(ParameterKind::SubstRates)
                .then(|| partition.subst_rates(self.matrix).to_vec()),
            frequencies: touches(ParameterKind::Frequencies)
                .then(|| partition.frequencies(self.matrix).to_vec()),
            prop_invar: if touches(ParameterKind::PropInvar) {
                self.distinct_matrices()
                    .into_iter()
                    .map(|m| (m, partition.prop_invar(m)))
                    .collect()
            } else {
                Vec::new()
            },
            category_rates: (touches(ParameterKind::Alpha) || touches(ParameterKind::FreeRates))
                .then(|| partition.category_rates().to_vec()),
            category_weights: touches(ParameterKind::RateWeights)
                .then(|| partition.category_weights().to_vec()),
            alpha: self.alpha.get(),
            branch_lengths: setup.branch_lengths.clone(),
        }
    }

    fn restore<P: LikelihoodPartition>(
        &self,
        snapshot: Snapshot,
        partition: &mut P,
        setup: &mut LikelihoodSetup,
    ) -> Result<()> {
        if let Some(rates) = snapshot.subst_rates {
            partition.set_subst_rates(self.matrix, &rates)?;
        }
        if let Some(frequencies) = snapshot.frequencies {
            partition.set_frequencies(self.matrix, &frequencies)?;
        }
        for (m, prop_invar) in snapshot.prop_invar {
            partition.set_prop_invar(m, prop_invar)?;
        }
        if let Some(rates) = snapshot.category_rates {
            partition.set_category_rates(&rates)?;
        }
        if let Some(weights) = snapshot.category_weights {
            partition.set_category_weights(&weights)?;
        }
        self.alpha.set(snapshot.alpha);
        setup.branch_lengths = snapshot.branch_lengths;
        Ok(())
    }

    fn distinct_matrices(&self) -> Vec<usize> {
        let mut matrices = self.params_indices.clone();
        matrices.sort_unstable();
        matrices.dedup();
        matrices
    }

    fn free_subst_rates(&self, rate_count: usize) -> usize {
        match &self.symmetries {
            Some(symmetries) => symmetries.iter().copied().max().unwrap_or_default(),
            None => rate_count.saturating_sub(1),
        }
    }

    /// Index of the free variable of a symmetry class, `None` for the class of the last rate.
    fn class_variable(&self, class: usize, fixed_class: usize) -> Option<usize> {
        match class.cmp(&fixed_class) {
            std::cmp::Ordering::Less => Some(class),
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => Some(class - 1),
        }
    }

    fn encode_subst_rates(&self, rates: &[f64]) -> Vec<f64> {
        let Some(&reference) = rates.last() else {
            return Vec::new();
        };
        match &self.symmetries {
            Some(symmetries) => {
                let fixed_class = symmetries[symmetries.len() - 1];
                let mut x = vec![1.0; self.free_subst_rates(rates.len())];
                let mut seen = vec![false; x.len()];
                for (rate, &class) in rates.iter().zip(symmetries) {
                    if let Some(var) = self.class_variable(class, fixed_class) {
                        if !seen[var] {
                            x[var] = rate / reference;
                            seen[var] = true;
                        }
                    }
                }
                x
            }
            None => rates[..rates.len() - 1]
                .iter()
                .map(|r| r / reference)
                .collect(),
        }
    }

    fn decode_subst_rates(&self, values: &[f64], rate_count: usize) -> Vec<f64> {
        match &self.symmetries {
            Some(symmetries) => {
                let fixed_class = symmetries[symmetries.len() - 1];
                symmetries
                    .iter()
                    .map(|&class| match self.class_variable(class, fixed_class) {
                        Some(var) => values[var],
                        None => 1.0,
                    })
                    .collect()
            }
            None => {
                let mut rates = values.to_vec();
                rates.resize(rate_count, 1.0);
                rates
            }
        }
    }
}

/// Index of the largest entry, ties going to the last one scanned first.
fn dominant(values: &[f64]) -> usize {
    let mut best = values.len().saturating_sub(1);
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

fn encode_ratios(values: &[f64], dominant: usize) -> Vec<f64> {
    values
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != dominant)
        .map(|(_, v)| v / values[dominant])
        .collect()
}

fn decode_ratios(ratios: &[f64], dominant: usize) -> Vec<f64> {
    let sum = 1.0 + ratios.iter().sum::<f64>();
    let mut values: Vec<f64> = ratios.iter().map(|r| r / sum).collect();
    values.insert(dominant.min(values.len()), 1.0 / sum);
    values
}

/// Bounds of a scalar parameter in the one-dimensional search, the caller's limits
/// replacing the defaults where positive.
pub(crate) fn onedim_bounds(request: &OptimisationRequest, kind: ParameterKind) -> (f64, f64) {
    let (default_min, default_max) = match kind {
        ParameterKind::PropInvar => (0.0, super::MAX_PINV),
        ParameterKind::Alpha => (super::MIN_ALPHA, super::MAX_ALPHA),
        _ => (MIN_BRANCH_LENGTH, MAX_BRANCH_LENGTH),
    };
    match request.bound_override(kind) {
        Some((min, max)) => (
            if min > 0.0 { min } else { default_min },
            if max > 0.0 { max } else { default_max },
        ),
        None => (default_min, default_max),
    }
}
