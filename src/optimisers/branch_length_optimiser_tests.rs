use approx::assert_relative_eq;
use assert_matches::assert_matches;
use rstest::rstest;

use crate::assert_float_relative_slice_eq;
use crate::likelihood::{Partition, PartitionBuilder};
use crate::msa::Patterns;
use crate::optimisers::{
    optimise_branch_lengths_iterative, optimise_branch_lengths_local, BranchOptimiser,
    BranchOptimiserConfig, OptimisationError,
};
use crate::tree::UTree;

const SEQ_A: &[u8] = b"ACGTACGTACGTACGTACGT";
const SEQ_B: &[u8] = b"ACGAAGGTTCGTACCTACGA";
// 5 of 20 sites differ: t = -3/4 ln(1 - 4/3 * 1/4)
const JC_OPTIMUM: f64 = 0.30409883108112323;
const JC_OPTIMUM_LOGL: f64 = -44.46565155811453;

fn partition_for(tree: &UTree, records: &[bio::io::fasta::Record]) -> Partition {
    let patterns = Patterns::from_records(records).unwrap();
    PartitionBuilder::new(&patterns, tree).build().unwrap()
}

fn two_taxon(length: f64) -> (UTree, Partition) {
    let tree = tree!(&format!("(A:{},B:0.0);", length));
    let records = [record_wo_desc!("A", SEQ_A), record_wo_desc!("B", SEQ_B)];
    let partition = partition_for(&tree, &records);
    (tree, partition)
}

fn six_taxon() -> (UTree, Partition) {
    let tree = tree!("((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1,(E:0.1,F:0.1):0.1);");
    let records = [
        record_wo_desc!("A", b"ACGTACGTACGTACGA"),
        record_wo_desc!("B", b"ACGTACGAACGTACGT"),
        record_wo_desc!("C", b"ACCTACGTTCGTACGT"),
        record_wo_desc!("D", b"ACCTAGGTTCGTACCT"),
        record_wo_desc!("E", b"TCCTAGGTTCGAACCT"),
        record_wo_desc!("F", b"TCCTAGGTTGGAACCA"),
    ];
    let partition = partition_for(&tree, &records);
    (tree, partition)
}

fn full_loglikelihood(tree: &UTree, partition: &mut Partition) -> f64 {
    let setup = tree.likelihood_setup(tree.default_edge(), &[0]);
    setup.update_all(partition).unwrap();
    setup.loglikelihood(partition)
}

#[rstest]
#[case::short(0.01)]
#[case::close(0.3)]
#[case::long(2.0)]
fn two_taxon_closed_form(#[case] guess: f64) {
    let (mut tree, mut partition) = two_taxon(guess);
    let start = tree.default_edge();
    let result = optimise_branch_lengths_iterative(
        &mut tree,
        &mut partition,
        &[0],
        start,
        BranchOptimiserConfig::default(),
    )
    .unwrap();
    assert_relative_eq!(tree.length(start), JC_OPTIMUM, epsilon = 1e-4);
    assert_relative_eq!(tree.length(tree.back(start)), tree.length(start));
    assert_relative_eq!(result.final_logl, JC_OPTIMUM_LOGL, epsilon = 1e-6);
    assert_relative_eq!(result.negative_logl(), -JC_OPTIMUM_LOGL, epsilon = 1e-6);
    assert!(result.final_logl >= result.initial_logl);
}

#[test]
fn out_of_bounds_length_restarts_from_default() {
    let (mut tree, mut partition) = two_taxon(500.0);
    let start = tree.default_edge();
    optimise_branch_lengths_iterative(
        &mut tree,
        &mut partition,
        &[0],
        start,
        BranchOptimiserConfig::default(),
    )
    .unwrap();
    assert_relative_eq!(tree.length(start), JC_OPTIMUM, epsilon = 1e-4);
}

#[test]
fn checked_rounds_never_decrease() {
    let (mut tree, mut partition) = six_taxon();
    let start = tree.default_edge();
    let config = BranchOptimiserConfig::default().smoothings(1);
    let mut previous = f64::NEG_INFINITY;
    for _ in 0..5 {
        let result =
            BranchOptimiser::new(&mut tree, &mut partition, &[0], config).run(start).unwrap();
        assert!(result.final_logl >= result.initial_logl);
        assert!(result.initial_logl >= previous - 1e-9);
        assert_eq!(result.iterations, 1);
        previous = result.final_logl;
    }
}

#[test]
fn checked_update_rolls_back_a_worse_length() {
    // the optimum lies below the allowed range, so any accepted length lowers the logl
    let (mut tree, mut partition) = two_taxon(JC_OPTIMUM);
    let start = tree.default_edge();
    let matrix = tree.node(start).pmatrix_index;
    let config = BranchOptimiserConfig::default()
        .min_length(0.5)
        .max_length(1.0);
    let result = BranchOptimiser::new(&mut tree, &mut partition, &[0], config)
        .run(start)
        .unwrap();

    assert_eq!(tree.length(start), JC_OPTIMUM);
    assert_eq!(tree.length(tree.back(start)), JC_OPTIMUM);
    assert_relative_eq!(result.final_logl, result.initial_logl, epsilon = 1e-12);
    assert_relative_eq!(result.final_logl, JC_OPTIMUM_LOGL, epsilon = 1e-6);

    let mut expected = partition.clone();
    tree.likelihood_setup(start, &[0])
        .update_all(&mut expected)
        .unwrap();
    assert_float_relative_slice_eq(partition.pmatrix(matrix), expected.pmatrix(matrix), 1e-12);
}

#[test]
fn unchecked_update_keeps_a_worse_length() {
    let (mut tree, mut partition) = two_taxon(JC_OPTIMUM);
    let start = tree.default_edge();
    let config = BranchOptimiserConfig::default()
        .min_length(0.5)
        .max_length(1.0)
        .check_improvement(false);
    let result = BranchOptimiser::new(&mut tree, &mut partition, &[0], config)
        .run(start)
        .unwrap();

    assert!(tree.length(start) >= 0.5);
    assert!(result.final_logl < result.initial_logl);
}

#[test]
fn walk_restores_partials() {
    let (mut tree, mut partition) = six_taxon();
    let start = tree.default_edge();
    let result = optimise_branch_lengths_iterative(
        &mut tree,
        &mut partition,
        &[0],
        start,
        BranchOptimiserConfig::default(),
    )
    .unwrap();
    assert!(result.final_logl > result.initial_logl);
    assert_relative_eq!(
        full_loglikelihood(&tree, &mut partition),
        result.final_logl,
        epsilon = 1e-8
    );
    for edge in tree.edges() {
        assert_eq!(tree.length(edge), tree.length(tree.back(edge)));
        assert!(tree.length(edge) >= 1e-4);
    }
}

#[test]
fn radius_limits_the_walk() {
    let (mut tree, mut partition) = six_taxon();
    let start = tree.default_edge();
    let result = optimise_branch_lengths_local(
        &mut tree,
        &mut partition,
        &[0],
        start,
        1,
        BranchOptimiserConfig::default(),
    )
    .unwrap();
    assert!(result.final_logl >= result.initial_logl);
    for tip in 0..tree.tip_count() {
        assert_eq!(tree.length(tip), 0.1);
    }

    let (mut full_tree, mut full_partition) = six_taxon();
    let full = optimise_branch_lengths_iterative(
        &mut full_tree,
        &mut full_partition,
        &[0],
        start,
        BranchOptimiserConfig::default(),
    )
    .unwrap();
    assert!(full.final_logl >= result.final_logl - 1e-6);
    assert!((0..full_tree.tip_count()).any(|tip| full_tree.length(tip) != 0.1));
}

#[test]
fn radius_zero_touches_only_the_start_edge() {
    let (mut tree, mut partition) = six_taxon();
    let start = tree.default_edge();
    let before = tree.clone();
    optimise_branch_lengths_local(
        &mut tree,
        &mut partition,
        &[0],
        start,
        0,
        BranchOptimiserConfig::default(),
    )
    .unwrap();
    for edge in tree.edges() {
        if edge != start && tree.back(edge) != start {
            assert_eq!(tree.length(edge), before.length(edge));
        }
    }
}

#[test]
fn lazy_matrix_updates_converge() {
    let (mut tree, mut partition) = six_taxon();
    let start = tree.default_edge();
    let lazy = optimise_branch_lengths_iterative(
        &mut tree,
        &mut partition,
        &[0],
        start,
        BranchOptimiserConfig::default().keep_update(false),
    )
    .unwrap();
    assert_relative_eq!(
        full_loglikelihood(&tree, &mut partition),
        lazy.final_logl,
        epsilon = 1e-8
    );

    let (mut eager_tree, mut eager_partition) = six_taxon();
    let eager = optimise_branch_lengths_iterative(
        &mut eager_tree,
        &mut eager_partition,
        &[0],
        start,
        BranchOptimiserConfig::default(),
    )
    .unwrap();
    assert_relative_eq!(lazy.final_logl, eager.final_logl, epsilon = 1e-3);
}

#[test]
fn unchecked_mode_improves() {
    let (mut tree, mut partition) = six_taxon();
    let start = tree.default_edge();
    let result = optimise_branch_lengths_iterative(
        &mut tree,
        &mut partition,
        &[0],
        start,
        BranchOptimiserConfig::default().check_improvement(false),
    )
    .unwrap();
    assert!(result.final_logl > result.initial_logl);
}

#[test]
fn zero_smoothings_only_evaluates() {
    let (mut tree, mut partition) = six_taxon();
    let start = tree.default_edge();
    let result = BranchOptimiser::new(
        &mut tree,
        &mut partition,
        &[0],
        BranchOptimiserConfig::default().smoothings(0),
    )
    .run(start)
    .unwrap();
    assert_eq!(result.iterations, 0);
    assert_eq!(result.initial_logl, result.final_logl);
}

#[rstest]
#[case::zero_minimum(BranchOptimiserConfig::default().min_length(0.0))]
#[case::empty_interval(BranchOptimiserConfig::default().max_length(1e-5))]
#[case::zero_tolerance(BranchOptimiserConfig::default().tolerance(0.0))]
fn invalid_configs(#[case] config: BranchOptimiserConfig) {
    let (mut tree, mut partition) = six_taxon();
    let start = tree.default_edge();
    let err = BranchOptimiser::new(&mut tree, &mut partition, &[0], config)
        .run(start)
        .unwrap_err();
    assert_matches!(
        err.downcast_ref::<OptimisationError>(),
        Some(OptimisationError::InvalidParameter(_))
    );
}

#[test]
fn start_must_be_in_the_tree() {
    let (mut tree, mut partition) = six_taxon();
    let records = tree.node_count();
    let err = BranchOptimiser::new(
        &mut tree,
        &mut partition,
        &[0],
        BranchOptimiserConfig::default(),
    )
    .run(records)
    .unwrap_err();
    assert_matches!(
        err.downcast_ref::<OptimisationError>(),
        Some(OptimisationError::InvalidParameter(_))
    );
}
