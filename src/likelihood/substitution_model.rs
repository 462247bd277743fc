use std::fmt::Display;

use anyhow::bail;
use nalgebra::{DMatrix, SymmetricEigen};

use crate::optimisers::OptimisationError;
use crate::Result;

pub type SubstMatrix = DMatrix<f64>;

/// Frequencies are accepted if they sum to one within this tolerance and get renormalised.
const FREQ_SUM_TOLERANCE: f64 = 1e-4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrequencyOptimisation {
    Empirical,
    Estimated,
    Fixed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum ModelType {
    JC69,
    K80,
    HKY,
    TN93,
    GTR,
    POISSON,
}

impl ModelType {
    pub fn new(name: &str) -> Result<Self> {
        Ok(match name.to_uppercase().as_str() {
            "JC69" | "JC" => ModelType::JC69,
            "K80" | "K2P" => ModelType::K80,
            "HKY" | "HKY85" => ModelType::HKY,
            "TN93" => ModelType::TN93,
            "GTR" => ModelType::GTR,
            "POISSON" => ModelType::POISSON,
            _ => bail!("Unknown model requested: {}", name),
        })
    }

    pub fn states(&self) -> usize {
        match self {
            ModelType::POISSON => 20,
            _ => 4,
        }
    }

    /// Symmetry classes of the exchangeabilities in AC, AG, AT, CG, CT, GT order,
    /// `None` when every rate is free.
    pub fn symmetries(&self) -> Option<Vec<usize>> {
        match self {
            ModelType::JC69 => Some(vec![0; 6]),
            ModelType::K80 | ModelType::HKY => Some(vec![0, 1, 0, 0, 1, 0]),
            ModelType::TN93 => Some(vec![0, 1, 0, 0, 2, 0]),
            ModelType::GTR => None,
            ModelType::POISSON => Some(vec![0; 190]),
        }
    }

    /// Whether the model fixes stationary frequencies to be equal.
    pub fn equal_frequencies(&self) -> bool {
        matches!(self, ModelType::JC69 | ModelType::K80 | ModelType::POISSON)
    }
}

impl Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Time-reversible substitution model, parameterised by the exchangeabilities of every state
/// pair (upper triangle, row-major) and the stationary frequencies. The rate matrix is scaled
/// to one expected substitution per unit of time.
#[derive(Clone, Debug, PartialEq)]
pub struct SubstitutionModel {
    states: usize,
    subst_rates: Vec<f64>,
    frequencies: Vec<f64>,
    prop_invar: f64,
    eigenvalues: Vec<f64>,
    eigenvectors: SubstMatrix,
    inv_eigenvectors: SubstMatrix,
}

impl SubstitutionModel {
    pub fn new(states: usize) -> Result<Self> {
        if states < 2 {
            bail!(OptimisationError::InvalidParameter(format!(
                "A substitution model needs at least two states, got {}",
                states
            )));
        }
        let mut model = Self {
            states,
            subst_rates: vec![1.0; states * (states - 1) / 2],
            frequencies: vec![1.0 / states as f64; states],
            prop_invar: 0.0,
            eigenvalues: vec![0.0; states],
            eigenvectors: SubstMatrix::identity(states, states),
            inv_eigenvectors: SubstMatrix::identity(states, states),
        };
        model.update_eigen()?;
        Ok(model)
    }

    pub fn states(&self) -> usize {
        self.states
    }

    pub fn subst_rates(&self) -> &[f64] {
        &self.subst_rates
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn prop_invar(&self) -> f64 {
        self.prop_invar
    }

    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    pub fn eigenvectors(&self) -> &SubstMatrix {
        &self.eigenvectors
    }

    pub fn inv_eigenvectors(&self) -> &SubstMatrix {
        &self.inv_eigenvectors
    }

    pub fn set_subst_rates(&mut self, rates: &[f64]) -> Result<()> {
        if rates.len() != self.subst_rates.len() {
            bail!(OptimisationError::InvalidParameter(format!(
                "Expected {} substitution rates, got {}",
                self.subst_rates.len(),
                rates.len()
            )));
        }
        if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            bail!(OptimisationError::InvalidParameter(format!(
                "Substitution rates must be finite and non-negative, got {:?}",
                rates
            )));
        }
        let previous = std::mem::replace(&mut self.subst_rates, rates.to_vec());
        if let Err(e) = self.update_eigen() {
            self.subst_rates = previous;
            return Err(e);
        }
        Ok(())
    }

    pub fn set_frequencies(&mut self, frequencies: &[f64]) -> Result<()> {
        if frequencies.len() != self.states {
            bail!(OptimisationError::InvalidParameter(format!(
                "Expected {} frequencies, got {}",
                self.states,
                frequencies.len()
            )));
        }
        if frequencies.iter().any(|f| !f.is_finite() || *f <= 0.0) {
            bail!(OptimisationError::InvalidParameter(format!(
                "Frequencies must be finite and positive, got {:?}",
                frequencies
            )));
        }
        let sum: f64 = frequencies.iter().sum();
        if (sum - 1.0).abs() > FREQ_SUM_TOLERANCE {
            bail!(OptimisationError::InvalidParameter(format!(
                "Frequencies must sum to 1.0, got {}",
                sum
            )));
        }
        let normalised = frequencies.iter().map(|f| f / sum).collect();
        let previous = std::mem::replace(&mut self.frequencies, normalised);
        if let Err(e) = self.update_eigen() {
            self.frequencies = previous;
            return Err(e);
        }
        Ok(())
    }

    pub fn set_prop_invar(&mut self, prop_invar: f64) -> Result<()> {
        if !(0.0..1.0).contains(&prop_invar) {
            bail!(OptimisationError::InvalidParameter(format!(
                "Proportion of invariant sites must be in [0, 1), got {}",
                prop_invar
            )));
        }
        self.prop_invar = prop_invar;
        Ok(())
    }

    /// Normalised instantaneous rate matrix.
    pub fn q(&self) -> SubstMatrix {
        let n = self.states;
        let mut q = SubstMatrix::zeros(n, n);
        let mut k = 0;
        for i in 0..n {
            for j in (i + 1)..n {
                q[(i, j)] = self.subst_rates[k] * self.frequencies[j];
                q[(j, i)] = self.subst_rates[k] * self.frequencies[i];
                k += 1;
            }
        }
        for i in 0..n {
            let row_sum: f64 = q.row(i).sum();
            q[(i, i)] = -row_sum;
        }
        let mu: f64 = -(0..n).map(|i| self.frequencies[i] * q[(i, i)]).sum::<f64>();
        q / mu
    }

    /// Writes the transition probabilities for time `t` into `out`, row-major.
    pub fn p_into(&self, t: f64, out: &mut [f64]) {
        let n = self.states;
        let exps: Vec<f64> = self.eigenvalues.iter().map(|l| (l * t).exp()).collect();
        for i in 0..n {
            for j in 0..n {
                let mut p = 0.0;
                for (k, e) in exps.iter().enumerate() {
                    p += self.eigenvectors[(i, k)] * e * self.inv_eigenvectors[(k, j)];
                }
                out[i * n + j] = p.max(0.0);
            }
        }
    }

    pub fn p(&self, t: f64) -> SubstMatrix {
        let mut values = vec![0.0; self.states * self.states];
        self.p_into(t, &mut values);
        SubstMatrix::from_row_slice(self.states, self.states, &values)
    }

    // Q = D^-1/2 S D^1/2 for the symmetric S = D^1/2 Q D^-1/2, D = diag(pi).
    fn update_eigen(&mut self) -> Result<()> {
        let n = self.states;
        let q = self.q();
        if q.iter().any(|v| !v.is_finite()) {
            bail!(OptimisationError::InvalidParameter(String::from(
                "Substitution rates do not define a valid rate matrix"
            )));
        }
        let sqrt_pi: Vec<f64> = self.frequencies.iter().map(|f| f.sqrt()).collect();
        let mut s = SubstMatrix::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                s[(i, j)] = sqrt_pi[i] * q[(i, j)] / sqrt_pi[j];
            }
        }
        // Symmetrise against rounding before the decomposition.
        let s = (&s + s.transpose()) * 0.5;
        let eigen = SymmetricEigen::new(s);
        self.eigenvalues = eigen.eigenvalues.iter().copied().collect();
        self.eigenvectors = SubstMatrix::from_fn(n, n, |i, k| {
            eigen.eigenvectors[(i, k)] / sqrt_pi[i]
        });
        self.inv_eigenvectors = SubstMatrix::from_fn(n, n, |k, j| {
            eigen.eigenvectors[(j, k)] * sqrt_pi[j]
        });
        Ok(())
    }
}
