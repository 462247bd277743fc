use std::fs::File;
use std::io::Write;

use anyhow::{anyhow, bail, Error};
use clap::Parser;
use ftail::Ftail;
use log::{debug, info, warn, LevelFilter};

use phylo_optimise::io::{read_newick_from_file, read_sequences, write_newick_to_file};
use phylo_optimise::likelihood::gamma::discrete_gamma_rates;
use phylo_optimise::likelihood::substitution_model::{FrequencyOptimisation, ModelType};
use phylo_optimise::likelihood::{LikelihoodPartition, Partition, PartitionBuilder};
use phylo_optimise::msa::{
    empirical_frequencies, empirical_invariant_sites, empirical_subst_rates, Patterns,
};
use phylo_optimise::optimisers::ModelOptimiser;
use phylo_optimise::parameters::ParameterKind::*;
use phylo_optimise::parameters::{OptimisationRequest, ParameterSet, DEFAULT_PINV, MAX_PINV};

mod cli;
use crate::cli::{Cli, Config, ConfigBuilder};

type Result<T> = std::result::Result<T, Error>;

fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            bail!("Unable to parse command line arguments: \n {}", error)
        }
    };
    let cfg_build: ConfigBuilder = cli.into();
    let cfg = cfg_build.setup()?;

    Ftail::new()
        .console(LevelFilter::Info)
        .single_file(&cfg.log_file.to_string_lossy(), true, LevelFilter::Trace)
        .init()
        .map_err(|e| anyhow!("Unable to set up logging: {:?}", e))?;

    info!("phylo-optimise run started.");
    info!("{}", cfg);

    let records = read_sequences(&cfg.seq_file)?;
    let Some(mut tree) = read_newick_from_file(&cfg.tree_file)?.into_iter().next() else {
        bail!("No tree found in {}", cfg.tree_file.display());
    };
    let patterns = Patterns::from_records(&records)?;
    let states = patterns.sequence_type().alphabet().states();
    if cfg.model.states() != states {
        bail!(
            "Model {} needs {} states, the sequences have {}",
            cfg.model,
            cfg.model.states(),
            states
        );
    }

    let mut partition = PartitionBuilder::new(&patterns, &tree)
        .rate_categories(cfg.gamma_categories)
        .build()?;
    initialise_model(&cfg, &mut partition)?;

    let request = OptimisationRequest::builder(&vec![0; cfg.gamma_categories])
        .parameters(selected_parameters(&cfg))
        .symmetries(cfg.model.symmetries())
        .alpha(cfg.alpha)
        .build();
    let mut optimiser = ModelOptimiser::new(&mut tree, &mut partition, request)
        .epsilon(cfg.epsilon)
        .max_iterations(cfg.max_iterations);
    let result = optimiser.run()?;
    let alpha = optimiser.alpha();

    debug!("Final substitution rates: {:?}", partition.subst_rates(0));
    debug!("Final frequencies: {:?}", partition.frequencies(0));
    if cfg.gamma_categories > 1 {
        info!("Final alpha: {}", alpha);
    }
    if cfg.pinv {
        info!("Final proportion of invariant sites: {}", partition.prop_invar(0));
    }
    debug!("Final tree: {}", tree);

    info!("Putting resulting tree in {}", cfg.out_tree.display());
    write_newick_to_file(&[tree], &cfg.out_tree)?;
    let mut out_logl = File::create(&cfg.out_logl)?;
    writeln!(out_logl, "{}", result.final_logl)?;

    info!("phylo-optimise run finished.");
    Ok(())
}

fn initialise_model(cfg: &Config, partition: &mut Partition) -> Result<()> {
    if !cfg.model.equal_frequencies() && cfg.freq_opt != FrequencyOptimisation::Fixed {
        let frequencies = empirical_frequencies(partition);
        if frequencies.iter().any(|&f| f <= 0.0) {
            warn!(
                "Some states never occur in the alignment, using equal frequencies instead of {:?}.",
                frequencies
            );
        } else {
            partition.set_frequencies(0, &frequencies)?;
        }
    }
    if cfg.model == ModelType::GTR {
        partition.set_subst_rates(0, &empirical_subst_rates(partition))?;
    }
    if cfg.gamma_categories > 1 {
        partition.set_category_rates(&discrete_gamma_rates(cfg.alpha, cfg.gamma_categories)?)?;
    }
    if cfg.pinv {
        let pinv = (empirical_invariant_sites(partition) / 2.0).clamp(DEFAULT_PINV, MAX_PINV);
        partition.set_prop_invar(0, pinv)?;
    }
    Ok(())
}

fn selected_parameters(cfg: &Config) -> ParameterSet {
    let mut parameters = ParameterSet::new();
    if !matches!(cfg.model, ModelType::JC69 | ModelType::POISSON) {
        parameters.insert(SubstRates);
    }
    if !cfg.model.equal_frequencies() && cfg.freq_opt == FrequencyOptimisation::Estimated {
        parameters.insert(Frequencies);
    }
    if cfg.gamma_categories > 1 {
        parameters.insert(Alpha);
    }
    if cfg.pinv {
        parameters.insert(PropInvar);
    }
    if cfg.optimise_branches {
        parameters.insert(BranchesAll);
    }
    parameters
}
