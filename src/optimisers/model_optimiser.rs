use std::cell::RefCell;

use anyhow::{bail, Error};
use argmin::core::CostFunction;
use log::{debug, info, warn};

use crate::likelihood::{EvaluationPoint, LikelihoodPartition, LikelihoodSetup};
use crate::optimisers::{
    minimize_brent, minimize_em, minimize_lbfgsb, BranchOptimiser, BranchOptimiserConfig,
    EmOutcome, ModelOptimisationResult, OptimisationError, ParameterOptimisationResult,
};
use crate::parameters::codec::onedim_bounds;
use crate::parameters::{OptimisationRequest, ParameterCodec, ParameterKind, ParameterSet};
use crate::tree::UTree;
use crate::Result;

/// Negative log-likelihood of a partition as a function of the encoded parameters.
///
/// Decoding failures do not abort the search: the point scores `+inf` and the error is kept
/// so that the caller can report it if the search ends on such a point.
pub(crate) struct ParameterObjective<'a, P: LikelihoodPartition> {
    pub(crate) codec: &'a ParameterCodec,
    pub(crate) partition: RefCell<&'a mut P>,
    pub(crate) setup: RefCell<&'a mut LikelihoodSetup>,
    pub(crate) error: RefCell<Option<Error>>,
}

impl<'a, P: LikelihoodPartition> ParameterObjective<'a, P> {
    pub(crate) fn new(
        codec: &'a ParameterCodec,
        partition: &'a mut P,
        setup: &'a mut LikelihoodSetup,
    ) -> Self {
        Self {
            codec,
            partition: RefCell::new(partition),
            setup: RefCell::new(setup),
            error: RefCell::new(None),
        }
    }

    fn evaluate(&self, x: &[f64]) -> f64 {
        let mut partition = self.partition.borrow_mut();
        let mut setup = self.setup.borrow_mut();
        match self.codec.decode(x, &mut **partition, &mut **setup) {
            Ok(()) => -setup.loglikelihood(&**partition),
            Err(e) => {
                warn!("Cannot apply parameters {:?}: {}", x, e);
                self.error.replace(Some(e));
                f64::INFINITY
            }
        }
    }

    /// Error recorded while decoding, if the final score is unusable.
    fn surface_error(&self, score: f64) -> Result<()> {
        if !score.is_finite() {
            if let Some(e) = self.error.borrow_mut().take() {
                return Err(e);
            }
        }
        Ok(())
    }
}

impl<P: LikelihoodPartition> CostFunction for ParameterObjective<'_, P> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Vec<f64>) -> Result<f64> {
        Ok(self.evaluate(x))
    }
}

/// Scalar view of a one-parameter objective.
struct ScalarObjective<'o, 'a, P: LikelihoodPartition> {
    inner: &'o ParameterObjective<'a, P>,
}

impl<P: LikelihoodPartition> CostFunction for ScalarObjective<'_, '_, P> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, x: &f64) -> Result<f64> {
        Ok(self.inner.evaluate(&[*x]))
    }
}

/// Optimises a single scalar parameter, the gamma shape, the proportion of invariant sites or
/// the length of the evaluation edge, with Brent's method.
pub fn optimise_onedim<P: LikelihoodPartition>(
    request: &OptimisationRequest,
    partition: &mut P,
    setup: &mut LikelihoodSetup,
) -> Result<ParameterOptimisationResult> {
    let kind = onedim_kind(request.parameters())?;
    let (min, max) = onedim_bounds(request, kind);
    run_brent(request, kind, partition, setup, min, None, max)
}

/// Brent search for a single scalar parameter over the caller's range `[min, max]`, starting
/// from `guess` instead of the current value.
pub fn optimise_brent_ranged<P: LikelihoodPartition>(
    request: &OptimisationRequest,
    partition: &mut P,
    setup: &mut LikelihoodSetup,
    min: f64,
    guess: f64,
    max: f64,
) -> Result<ParameterOptimisationResult> {
    let kind = onedim_kind(request.parameters())?;
    if guess.is_nan() || guess < min || guess > max {
        bail!(OptimisationError::InvalidParameter(format!(
            "Guess {} for {} is outside [{}, {}]",
            guess, kind, min, max
        )));
    }
    run_brent(request, kind, partition, setup, min, Some(guess), max)
}

fn onedim_kind(parameters: &ParameterSet) -> Result<ParameterKind> {
    let Some(kind) = [
        ParameterKind::Alpha,
        ParameterKind::PropInvar,
        ParameterKind::BranchSingle,
    ]
    .into_iter()
    .find(|&kind| parameters.is_only(kind)) else {
        if parameters.contains(ParameterKind::Topology) {
            bail!(OptimisationError::Unimplemented(
                ParameterKind::Topology.to_string()
            ));
        }
        bail!(OptimisationError::InvalidSelection(format!(
            "one-dimensional optimisation needs exactly one of alpha, pinv or a single branch, got {:?}",
            parameters
        )));
    };
    Ok(kind)
}

fn run_brent<P: LikelihoodPartition>(
    request: &OptimisationRequest,
    kind: ParameterKind,
    partition: &mut P,
    setup: &mut LikelihoodSetup,
    min: f64,
    guess: Option<f64>,
    max: f64,
) -> Result<ParameterOptimisationResult> {
    let codec = ParameterCodec::new(request, partition, setup)?;
    setup.update_all(partition)?;
    let initial_logl = setup.loglikelihood(partition);
    let start = guess.unwrap_or_else(|| codec.encode(partition, setup)[0]);
    debug!(
        "Optimising {} from {} in [{}, {}], initial logl {}.",
        kind, start, min, max, initial_logl
    );

    let objective = ParameterObjective::new(&codec, partition, setup);
    let result = minimize_brent(
        min,
        start,
        max,
        request.pgtol(),
        &ScalarObjective { inner: &objective },
    )?;
    let score = objective.evaluate(&[result.x]);
    objective.surface_error(score)?;
    debug!("Optimised {} to {} with logl {}.", kind, result.x, -score);

    Ok(ParameterOptimisationResult {
        initial_logl,
        final_logl: -score,
        iterations: 1,
        values: vec![result.x],
    })
}

/// Optimises any combination of parameter groups jointly with L-BFGS-B.
pub fn optimise_multidim<P: LikelihoodPartition>(
    request: &OptimisationRequest,
    partition: &mut P,
    setup: &mut LikelihoodSetup,
) -> Result<ParameterOptimisationResult> {
    let codec = ParameterCodec::new(request, partition, setup)?;
    setup.update_all(partition)?;
    let initial_logl = setup.loglikelihood(partition);
    let mut x = codec.encode(partition, setup);
    let bounds = codec.bounds();
    debug!(
        "Optimising {} parameter(s) of {:?}, initial logl {}.",
        x.len(),
        codec.parameters(),
        initial_logl
    );

    let objective = ParameterObjective::new(&codec, partition, setup);
    let score = match minimize_lbfgsb(&mut x, &bounds, request.factr(), request.pgtol(), &objective)
    {
        Ok(score) => score,
        Err(e) => {
            objective.surface_error(f64::NAN)?;
            return Err(e);
        }
    };
    objective.surface_error(score)?;

    Ok(ParameterOptimisationResult {
        initial_logl,
        final_logl: -score,
        iterations: 1,
        values: x,
    })
}

/// Re-estimates the rate category weights by expectation-maximisation at the evaluation edge.
pub fn optimise_rate_weights_em<P: LikelihoodPartition>(
    partition: &mut P,
    setup: &mut LikelihoodSetup,
) -> Result<EmOutcome> {
    let EvaluationPoint::Edge {
        parent_clv,
        parent_scaler,
        child_clv,
        child_scaler,
        matrix,
    } = setup.evaluation
    else {
        bail!(OptimisationError::InvalidSelection(String::from(
            "rate weights can only be estimated at an edge"
        )));
    };
    setup.update_all(partition)?;

    let mut weights = partition.category_weights().to_vec();
    let site_weights = partition.pattern_weights().to_vec();
    let mut sitecat = vec![0.0; partition.sites() * partition.rate_cats()];
    let params_indices = setup.params_indices.clone();

    let outcome = minimize_em(&mut weights, &mut sitecat, &site_weights, |current, out| {
        // evaluated under the weights applied last round, rescaled inside the EM step
        partition.sitecat_likelihoods(
            parent_clv,
            parent_scaler,
            child_clv,
            child_scaler,
            matrix,
            &params_indices,
            out,
        )?;
        partition.set_category_weights(current)
    })?;
    partition.set_category_weights(&weights)?;
    debug!(
        "Rate weights after {} EM round(s): {:?}",
        outcome.rounds, weights
    );
    Ok(outcome)
}

/// Cycles through the model parameters and the branch lengths of a tree until the
/// log-likelihood stops improving.
pub struct ModelOptimiser<'a, P: LikelihoodPartition> {
    pub(crate) tree: &'a mut UTree,
    pub(crate) partition: &'a mut P,
    pub(crate) request: OptimisationRequest,
    pub(crate) blen_config: BranchOptimiserConfig,
    pub(crate) epsilon: f64,
    pub(crate) max_iterations: usize,
}

impl<'a, P: LikelihoodPartition> ModelOptimiser<'a, P> {
    /// `request` selects the model parameter groups to estimate. Branch lengths are optimised
    /// when it contains [`ParameterKind::BranchesAll`].
    pub fn new(tree: &'a mut UTree, partition: &'a mut P, request: OptimisationRequest) -> Self {
        Self {
            tree,
            partition,
            request,
            blen_config: BranchOptimiserConfig::default(),
            epsilon: 1e-3,
            max_iterations: 100,
        }
    }

    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn branch_config(mut self, config: BranchOptimiserConfig) -> Self {
        self.blen_config = config;
        self
    }

    /// Gamma shape in effect after the last cycle.
    pub fn alpha(&self) -> f64 {
        self.request.alpha()
    }

    pub fn run(&mut self) -> Result<ModelOptimisationResult> {
        let selected = self.request.parameters().clone();
        if selected.contains(ParameterKind::Topology) {
            bail!(OptimisationError::Unimplemented(
                ParameterKind::Topology.to_string()
            ));
        }
        info!("Optimising model parameters: {:?}.", selected);

        let edge = self.tree.default_edge();
        let mut setup = self
            .tree
            .likelihood_setup(edge, self.request.params_indices());
        setup.update_all(self.partition)?;
        let initial_logl = setup.loglikelihood(self.partition);
        info!("Initial logl: {}.", initial_logl);

        let mut curr_logl = initial_logl;
        let mut prev_logl = f64::NEG_INFINITY;
        let mut iterations = 0;
        while curr_logl - prev_logl > self.epsilon && iterations < self.max_iterations {
            iterations += 1;
            debug!("Iteration: {}", iterations);
            prev_logl = curr_logl;

            for kind in [ParameterKind::SubstRates, ParameterKind::Frequencies] {
                if selected.contains(kind) {
                    curr_logl = self.multidim_step(kind)?;
                }
            }
            for kind in [ParameterKind::Alpha, ParameterKind::PropInvar] {
                if selected.contains(kind) {
                    curr_logl = self.onedim_step(kind)?;
                }
            }
            if selected.contains(ParameterKind::RateWeights) {
                curr_logl = self.rate_weights_step()?;
            }
            if selected.contains(ParameterKind::BranchesAll) {
                let o = BranchOptimiser::new(
                    self.tree,
                    self.partition,
                    self.request.params_indices(),
                    self.blen_config,
                )
                .run(edge)?;
                curr_logl = o.final_logl;
            }
            debug!("Logl after iteration {}: {}", iterations, curr_logl);
            if curr_logl < prev_logl {
                warn!(
                    "Log-likelihood decreased from {} to {} in iteration {}.",
                    prev_logl, curr_logl, iterations
                );
            }
        }

        info!(
            "Final logl: {}, achieved in {} iteration(s).",
            curr_logl, iterations
        );
        Ok(ModelOptimisationResult {
            initial_logl,
            final_logl: curr_logl,
            iterations,
        })
    }

    fn setup(&self) -> LikelihoodSetup {
        self.tree
            .likelihood_setup(self.tree.default_edge(), self.request.params_indices())
    }

    fn multidim_step(&mut self, kind: ParameterKind) -> Result<f64> {
        let mut setup = self.setup();
        let request = self.request.with_parameters(ParameterSet::single(kind));
        let codec = ParameterCodec::new(&request, self.partition, &setup)?;
        if codec.is_empty() {
            setup.update_all(self.partition)?;
            return Ok(setup.loglikelihood(self.partition));
        }
        let o = optimise_multidim(&request, self.partition, &mut setup)?;
        debug!("Optimised {} to {:?}, logl {}.", kind, o.values, o.final_logl);
        Ok(o.final_logl)
    }

    fn onedim_step(&mut self, kind: ParameterKind) -> Result<f64> {
        let mut setup = self.setup();
        let request = self.request.with_parameters(ParameterSet::single(kind));
        let o = optimise_onedim(&request, self.partition, &mut setup)?;
        if kind == ParameterKind::Alpha {
            self.request.alpha = o.values[0];
        }
        debug!("Optimised {} to {}, logl {}.", kind, o.values[0], o.final_logl);
        Ok(o.final_logl)
    }

    fn rate_weights_step(&mut self) -> Result<f64> {
        let mut setup = self.setup();
        optimise_rate_weights_em(self.partition, &mut setup)?;
        setup.update_all(self.partition)?;
        Ok(setup.loglikelihood(self.partition))
    }
}
