use std::collections::BTreeSet;
use std::fmt::Display;

use hashbrown::HashMap;

pub mod codec;

pub use codec::ParameterCodec;

/// Relative finite-difference step of the multidimensional optimiser, also the margin kept
/// away from degenerate parameter values.
pub const ERR: f64 = 1e-7;

/// Log-likelihood reported for impossible parameter combinations.
pub const LNL_UNLIKELY: f64 = -1e80;

pub const DEFAULT_BRANCH_LENGTH: f64 = 0.1;
pub const DEFAULT_ALPHA: f64 = 0.5;
pub const DEFAULT_PINV: f64 = 0.01;

pub const MIN_BRANCH_LENGTH: f64 = 1e-4;
pub const MAX_BRANCH_LENGTH: f64 = 100.0;
pub const BRANCH_LENGTH_TOLERANCE: f64 = 1e-4;

pub const MIN_SUBST_RATE: f64 = 1e-3;
pub const MAX_SUBST_RATE: f64 = 1000.0;

pub const MIN_FREQ_RATIO: f64 = 1e-3;
pub const MAX_FREQ_RATIO: f64 = 100.0;

pub const MIN_ALPHA: f64 = 0.0201 + ERR;
pub const MAX_ALPHA: f64 = 100.0;

/// Lower bound of the proportion of invariant sites in the multidimensional search. The
/// scalar search starts from zero.
pub const MIN_PINV: f64 = ERR;
pub const MAX_PINV: f64 = 0.99;

pub const MIN_RATE: f64 = 0.02;
pub const MAX_RATE: f64 = 100.0;

pub const MIN_RATE_WEIGHT: f64 = 1e-3;
pub const MAX_RATE_WEIGHT: f64 = 100.0;

pub const DEFAULT_FACTR: f64 = 1e7;
pub const DEFAULT_PGTOL: f64 = 1e-3;

/// Groups of free parameters. The declaration order is the order of the groups in the
/// optimisation vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParameterKind {
    SubstRates,
    Frequencies,
    PropInvar,
    Alpha,
    FreeRates,
    RateWeights,
    BranchSingle,
    BranchesAll,
    Topology,
}

impl Display for ParameterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParameterKind::SubstRates => "substitution rates",
            ParameterKind::Frequencies => "stationary frequencies",
            ParameterKind::PropInvar => "proportion of invariant sites",
            ParameterKind::Alpha => "gamma shape",
            ParameterKind::FreeRates => "free rates",
            ParameterKind::RateWeights => "rate weights",
            ParameterKind::BranchSingle => "single branch length",
            ParameterKind::BranchesAll => "all branch lengths",
            ParameterKind::Topology => "topology",
        };
        write!(f, "{}", name)
    }
}

/// Ordered set of parameter groups, iterated in optimisation vector order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet(BTreeSet<ParameterKind>);

impl ParameterSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn single(kind: ParameterKind) -> Self {
        Self(BTreeSet::from([kind]))
    }

    pub fn insert(&mut self, kind: ParameterKind) -> bool {
        self.0.insert(kind)
    }

    pub fn contains(&self, kind: ParameterKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the set holds exactly `kind` and nothing else.
    pub fn is_only(&self, kind: ParameterKind) -> bool {
        self.0.len() == 1 && self.0.contains(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = ParameterKind> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<ParameterKind> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = ParameterKind>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[ParameterKind; N]> for ParameterSet {
    fn from(kinds: [ParameterKind; N]) -> Self {
        kinds.into_iter().collect()
    }
}

/// Which sides of a box constraint are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundType {
    None = 0,
    Lower = 1,
    Both = 2,
    Upper = 3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound {
    pub lower: f64,
    pub upper: f64,
    pub kind: BoundType,
}

impl Bound {
    pub fn new(lower: f64, upper: f64, kind: BoundType) -> Self {
        Self { lower, upper, kind }
    }

    pub fn both(lower: f64, upper: f64) -> Self {
        Self::new(lower, upper, BoundType::Both)
    }

    /// Effective lower limit, negative infinity when the lower side is inactive.
    pub fn lower_limit(&self) -> f64 {
        match self.kind {
            BoundType::Lower | BoundType::Both => self.lower,
            BoundType::None | BoundType::Upper => f64::NEG_INFINITY,
        }
    }

    pub fn upper_limit(&self) -> f64 {
        match self.kind {
            BoundType::Upper | BoundType::Both => self.upper,
            BoundType::None | BoundType::Lower => f64::INFINITY,
        }
    }

    pub fn project(&self, x: f64) -> f64 {
        x.max(self.lower_limit()).min(self.upper_limit())
    }

    /// Default bounds of a parameter group in the multidimensional search.
    pub fn default_for(kind: ParameterKind) -> Self {
        match kind {
            ParameterKind::SubstRates => Bound::both(MIN_SUBST_RATE, MAX_SUBST_RATE),
            ParameterKind::Frequencies => Bound::both(MIN_FREQ_RATIO, MAX_FREQ_RATIO),
            ParameterKind::PropInvar => Bound::both(MIN_PINV, MAX_PINV),
            ParameterKind::Alpha => Bound::both(MIN_ALPHA, MAX_ALPHA),
            ParameterKind::FreeRates => Bound::both(MIN_RATE, MAX_RATE),
            ParameterKind::RateWeights => Bound::both(MIN_RATE_WEIGHT, MAX_RATE_WEIGHT),
            ParameterKind::BranchSingle | ParameterKind::BranchesAll => {
                Bound::new(MIN_BRANCH_LENGTH, MAX_BRANCH_LENGTH, BoundType::Lower)
            }
            ParameterKind::Topology => Bound::new(0.0, 0.0, BoundType::None),
        }
    }
}

/// What to optimise and how: the selected parameter groups with optional bound overrides,
/// the convergence tolerances and the model layout the groups refer to.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisationRequest {
    pub(crate) parameters: ParameterSet,
    pub(crate) bounds: HashMap<ParameterKind, (f64, f64)>,
    pub(crate) factr: f64,
    pub(crate) pgtol: f64,
    pub(crate) symmetries: Option<Vec<usize>>,
    pub(crate) alpha: f64,
    pub(crate) params_indices: Vec<usize>,
    pub(crate) matrix: usize,
}

impl OptimisationRequest {
    pub fn builder(params_indices: &[usize]) -> OptimisationRequestBuilder {
        OptimisationRequestBuilder {
            request: OptimisationRequest {
                parameters: ParameterSet::new(),
                bounds: HashMap::new(),
                factr: DEFAULT_FACTR,
                pgtol: DEFAULT_PGTOL,
                symmetries: None,
                alpha: DEFAULT_ALPHA,
                params_indices: params_indices.to_vec(),
                matrix: params_indices.first().copied().unwrap_or_default(),
            },
        }
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn factr(&self) -> f64 {
        self.factr
    }

    pub fn pgtol(&self) -> f64 {
        self.pgtol
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn params_indices(&self) -> &[usize] {
        &self.params_indices
    }

    /// Overridden `(min, max)` of a group, if any.
    pub fn bound_override(&self, kind: ParameterKind) -> Option<(f64, f64)> {
        self.bounds.get(&kind).copied()
    }

    /// Same request with a different selection of parameter groups.
    pub fn with_parameters(&self, parameters: ParameterSet) -> Self {
        Self {
            parameters,
            ..self.clone()
        }
    }
}

pub struct OptimisationRequestBuilder {
    request: OptimisationRequest,
}

impl OptimisationRequestBuilder {
    pub fn parameters(mut self, parameters: impl Into<ParameterSet>) -> Self {
        self.request.parameters = parameters.into();
        self
    }

    pub fn bounds(mut self, kind: ParameterKind, min: f64, max: f64) -> Self {
        self.request.bounds.insert(kind, (min, max));
        self
    }

    pub fn factr(mut self, factr: f64) -> Self {
        self.request.factr = factr;
        self
    }

    pub fn pgtol(mut self, pgtol: f64) -> Self {
        self.request.pgtol = pgtol;
        self
    }

    pub fn symmetries(mut self, symmetries: Option<Vec<usize>>) -> Self {
        self.request.symmetries = symmetries;
        self
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.request.alpha = alpha;
        self
    }

    /// Rate matrix whose substitution rates and frequencies are optimised.
    pub fn matrix(mut self, matrix: usize) -> Self {
        self.request.matrix = matrix;
        self
    }

    pub fn build(self) -> OptimisationRequest {
        self.request
    }
}

#[cfg(test)]
#[cfg_attr(coverage, coverage(off))]
mod parameters_tests;
