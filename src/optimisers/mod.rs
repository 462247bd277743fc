use std::fmt;

use crate::Result;

pub mod branch_length_optimiser;
pub mod brent;
pub mod em;
pub mod lbfgsb;
pub mod model_optimiser;
pub mod newton;

pub use branch_length_optimiser::{
    optimise_branch_lengths_iterative, optimise_branch_lengths_local, BranchOptimiser,
    BranchOptimiserConfig,
};
pub use brent::{minimize_brent, BrentResult};
pub use em::{minimize_em, EmOutcome};
pub use lbfgsb::minimize_lbfgsb;
pub use model_optimiser::{
    optimise_brent_ranged, optimise_multidim, optimise_onedim, optimise_rate_weights_em,
    ModelOptimiser,
};
pub use newton::minimize_newton;

/// Failures of the optimisation routines. Returned wrapped in `anyhow::Error`, callers can
/// recover the variant with `downcast_ref::<OptimisationError>()`.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimisationError {
    Allocation(String),
    NewtonDerivative(String),
    NewtonLimit,
    LbfgsbUnknown,
    Unimplemented(String),
    InvalidParameter(String),
    InvalidSelection(String),
}

impl fmt::Display for OptimisationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimisationError::Allocation(what) => write!(f, "Memory allocation failed: {}", what),
            OptimisationError::NewtonDerivative(what) => {
                write!(f, "Newton-Raphson derivative error: {}", what)
            }
            OptimisationError::NewtonLimit => {
                write!(f, "Newton-Raphson did not run within the iteration limit")
            }
            OptimisationError::LbfgsbUnknown => {
                write!(f, "L-BFGS-B finished with an undefined score")
            }
            OptimisationError::Unimplemented(what) => {
                write!(f, "Optimisation of {} is not implemented", what)
            }
            OptimisationError::InvalidParameter(what) => write!(f, "Invalid parameter: {}", what),
            OptimisationError::InvalidSelection(what) => {
                write!(f, "Invalid parameter selection: {}", what)
            }
        }
    }
}

impl std::error::Error for OptimisationError {}

/// Value and derivative of a scalar function, the oracle Newton-Raphson finds a root of.
pub trait DerivativeOracle {
    fn derivatives(&self, x: f64) -> Result<(f64, f64)>;
}

impl<F> DerivativeOracle for F
where
    F: Fn(f64) -> Result<(f64, f64)>,
{
    fn derivatives(&self, x: f64) -> Result<(f64, f64)> {
        self(x)
    }
}

/// Outcome of a model parameter optimisation, log-likelihoods before and after and the final
/// optimisation vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterOptimisationResult {
    pub initial_logl: f64,
    pub final_logl: f64,
    pub iterations: usize,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BranchOptimisationResult {
    pub initial_logl: f64,
    pub final_logl: f64,
    pub iterations: usize,
}

impl BranchOptimisationResult {
    /// Score minimised by the branch optimiser.
    pub fn negative_logl(&self) -> f64 {
        -self.final_logl
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelOptimisationResult {
    pub initial_logl: f64,
    pub final_logl: f64,
    pub iterations: usize,
}

#[cfg(test)]
#[cfg_attr(coverage, coverage(off))]
mod branch_length_optimiser_tests;
#[cfg(test)]
#[cfg_attr(coverage, coverage(off))]
mod em_tests;
#[cfg(test)]
#[cfg_attr(coverage, coverage(off))]
mod lbfgsb_tests;
#[cfg(test)]
#[cfg_attr(coverage, coverage(off))]
mod newton_tests;
