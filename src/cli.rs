use std::fmt::Display;
use std::path::{Path, PathBuf};

use anyhow::bail;
use clap::{Parser, ValueEnum};

use phylo_optimise::likelihood::gamma::MIN_ALPHA;
use phylo_optimise::likelihood::substitution_model::{FrequencyOptimisation, ModelType};

use crate::Result;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub(super) struct Cli {
    /// Sequence file in fasta format
    #[arg(short, long, value_name = "SEQ_FILE")]
    pub(super) seq_file: PathBuf,

    /// Tree file in newick format, the first tree in the file is used
    #[arg(short, long, value_name = "TREE_FILE")]
    pub(super) tree_file: PathBuf,

    /// Prefix of the output files, defaults to the sequence file without its extension
    #[arg(short, long, value_name = "OUTPUT_PREFIX")]
    pub(super) output_prefix: Option<PathBuf>,

    /// Substitution model: JC69, K80, HKY, TN93, GTR or POISSON
    #[arg(short, long, value_name = "MODEL", default_value = "GTR")]
    pub(super) model: String,

    /// Number of discrete gamma rate categories, 1 for no rate heterogeneity
    #[arg(short, long, value_name = "CATEGORIES", default_value_t = 1)]
    pub(super) gamma: usize,

    /// Initial gamma shape parameter
    #[arg(short, long, default_value_t = 0.5)]
    pub(super) alpha: f64,

    /// Estimate a proportion of invariant sites
    #[arg(long)]
    pub(super) pinv: bool,

    /// How the stationary frequencies are set
    #[arg(short, long, value_enum, default_value_t = FreqMode::Empirical)]
    pub(super) freq_opt: FreqMode,

    /// Keep the branch lengths of the input tree
    #[arg(long)]
    pub(super) fixed_branches: bool,

    /// Stop once an iteration improves the log-likelihood by less than this
    #[arg(short, long, default_value_t = 1e-3)]
    pub(super) epsilon: f64,

    /// Maximum number of optimisation rounds
    #[arg(short = 'x', long, default_value_t = 100)]
    pub(super) max_iterations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(super) enum FreqMode {
    /// Frequencies observed in the alignment
    Empirical,
    /// Empirical frequencies as a starting point for maximum likelihood estimation
    Estimated,
    /// Equal frequencies
    Fixed,
}

impl From<FreqMode> for FrequencyOptimisation {
    fn from(mode: FreqMode) -> Self {
        match mode {
            FreqMode::Empirical => FrequencyOptimisation::Empirical,
            FreqMode::Estimated => FrequencyOptimisation::Estimated,
            FreqMode::Fixed => FrequencyOptimisation::Fixed,
        }
    }
}

pub(super) struct ConfigBuilder {
    cli: Cli,
}

impl From<Cli> for ConfigBuilder {
    fn from(cli: Cli) -> Self {
        ConfigBuilder { cli }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct Config {
    pub(super) seq_file: PathBuf,
    pub(super) tree_file: PathBuf,
    pub(super) out_tree: PathBuf,
    pub(super) out_logl: PathBuf,
    pub(super) log_file: PathBuf,
    pub(super) model: ModelType,
    pub(super) gamma_categories: usize,
    pub(super) alpha: f64,
    pub(super) pinv: bool,
    pub(super) freq_opt: FrequencyOptimisation,
    pub(super) optimise_branches: bool,
    pub(super) epsilon: f64,
    pub(super) max_iterations: usize,
}

impl ConfigBuilder {
    pub(super) fn setup(self) -> Result<Config> {
        let cli = self.cli;
        for file in [&cli.seq_file, &cli.tree_file] {
            if !file.is_file() {
                bail!("Input file {} does not exist", file.display());
            }
        }
        let model = ModelType::new(&cli.model)?;
        if cli.gamma == 0 {
            bail!("At least one rate category is required");
        }
        if cli.alpha.is_nan() || cli.alpha < MIN_ALPHA {
            bail!("Gamma shape must be at least {}, got {}", MIN_ALPHA, cli.alpha);
        }
        if cli.epsilon.is_nan() || cli.epsilon <= 0.0 {
            bail!("Epsilon must be positive, got {}", cli.epsilon);
        }

        let prefix = match cli.output_prefix {
            Some(prefix) => prefix,
            None => cli.seq_file.with_extension(""),
        };
        let out_tree = with_suffix(&prefix, "_optimised.newick");
        let out_logl = with_suffix(&prefix, "_logl.out");
        let log_file = with_suffix(&prefix, ".log");
        if out_tree.exists() {
            bail!("Output file {} already exists", out_tree.display());
        }

        Ok(Config {
            seq_file: cli.seq_file,
            tree_file: cli.tree_file,
            out_tree,
            out_logl,
            log_file,
            model,
            gamma_categories: cli.gamma,
            alpha: cli.alpha,
            pinv: cli.pinv,
            freq_opt: cli.freq_opt.into(),
            optimise_branches: !cli.fixed_branches,
            epsilon: cli.epsilon,
            max_iterations: cli.max_iterations,
        })
    }
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Sequences: {}", self.seq_file.display())?;
        writeln!(f, "Tree: {}", self.tree_file.display())?;
        writeln!(f, "Model: {}", self.model)?;
        if self.gamma_categories > 1 {
            writeln!(
                f,
                "Gamma rates: {} categories, initial alpha {}",
                self.gamma_categories, self.alpha
            )?;
        }
        writeln!(f, "Invariant sites: {}", self.pinv)?;
        writeln!(f, "Frequencies: {:?}", self.freq_opt)?;
        writeln!(f, "Branch lengths optimised: {}", self.optimise_branches)?;
        writeln!(
            f,
            "Epsilon: {}, max iterations: {}",
            self.epsilon, self.max_iterations
        )?;
        write!(
            f,
            "Output: {} and {}",
            self.out_tree.display(),
            self.out_logl.display()
        )
    }
}
