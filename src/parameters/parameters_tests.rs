use approx::assert_relative_eq;
use assert_matches::assert_matches;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rstest::rstest;

use crate::assert_float_relative_slice_eq;
use crate::likelihood::{
    EvaluationPoint, LikelihoodPartition, LikelihoodSetup, Partition, PartitionBuilder,
};
use crate::msa::Patterns;
use crate::optimisers::OptimisationError;
use crate::parameters::codec::onedim_bounds;
use crate::parameters::ParameterKind::*;
use crate::parameters::{
    Bound, BoundType, OptimisationRequest, ParameterCodec, ParameterKind, ParameterSet,
    MAX_PINV, MIN_ALPHA, MIN_BRANCH_LENGTH,
};
use crate::tree::UTree;

fn gtr_partition(rate_cats: usize) -> (UTree, Partition, LikelihoodSetup) {
    let tree = tree!("((A:0.1,B:0.2):0.05,C:0.3,D:0.4);");
    let records = vec![
        record_wo_desc!("A", b"ACGTTGCAACGT"),
        record_wo_desc!("B", b"ACGTTGCAATGT"),
        record_wo_desc!("C", b"ACTTTGGAACGA"),
        record_wo_desc!("D", b"GCGTAGCATCGA"),
    ];
    let patterns = Patterns::from_records(&records).unwrap();
    let mut partition = PartitionBuilder::new(&patterns, &tree)
        .rate_categories(rate_cats)
        .build()
        .unwrap();
    partition
        .set_subst_rates(0, &[1.2, 2.4, 0.6, 0.9, 3.6, 1.5])
        .unwrap();
    partition.set_frequencies(0, &[0.1, 0.2, 0.3, 0.4]).unwrap();
    let setup = tree.likelihood_setup(tree.default_edge(), &vec![0; rate_cats]);
    (tree, partition, setup)
}

fn request(rate_cats: usize, parameters: impl Into<ParameterSet>) -> OptimisationRequest {
    OptimisationRequest::builder(&vec![0; rate_cats])
        .parameters(parameters)
        .build()
}

fn codec_error(request: &OptimisationRequest, rate_cats: usize) -> OptimisationError {
    let (_, partition, setup) = gtr_partition(rate_cats);
    let err = ParameterCodec::new(request, &partition, &setup).unwrap_err();
    err.downcast_ref::<OptimisationError>().unwrap().clone()
}

#[test]
fn parameter_set_iterates_in_vector_order() {
    let set = ParameterSet::from([BranchesAll, SubstRates, Alpha, Frequencies]);
    assert_eq!(
        set.iter().collect::<Vec<_>>(),
        vec![SubstRates, Frequencies, Alpha, BranchesAll]
    );
    assert!(set.contains(Alpha));
    assert!(!set.contains(PropInvar));
    assert!(!set.is_only(Alpha));
    assert!(ParameterSet::single(Alpha).is_only(Alpha));
}

#[test]
fn request_defaults() {
    let request = OptimisationRequest::builder(&[2, 0, 1]).build();
    assert!(request.parameters().is_empty());
    assert_eq!(request.factr(), 1e7);
    assert_eq!(request.pgtol(), 1e-3);
    assert_eq!(request.alpha(), 0.5);
    assert_eq!(request.matrix, 2);
    assert_eq!(request.params_indices(), &[2, 0, 1]);
    assert_eq!(request.bound_override(Alpha), None);
}

#[test]
fn bound_limits() {
    let both = Bound::both(1.0, 2.0);
    assert_eq!(both.project(0.5), 1.0);
    assert_eq!(both.project(2.5), 2.0);
    let lower = Bound::new(1.0, 2.0, BoundType::Lower);
    assert_eq!(lower.upper_limit(), f64::INFINITY);
    assert_eq!(lower.project(5.0), 5.0);
    let upper = Bound::new(1.0, 2.0, BoundType::Upper);
    assert_eq!(upper.lower_limit(), f64::NEG_INFINITY);
    assert_eq!(upper.project(-5.0), -5.0);
    assert_eq!(Bound::default_for(BranchesAll).kind, BoundType::Lower);
}

#[test]
fn vector_layout() {
    let (_, partition, setup) = gtr_partition(4);
    let request = request(4, [BranchesAll, Alpha, SubstRates, Frequencies, PropInvar]);
    let codec = ParameterCodec::new(&request, &partition, &setup).unwrap();
    assert_eq!(codec.len(), 5 + 3 + 1 + 1 + 5);

    let x = codec.encode(&partition, &setup);
    assert_eq!(x.len(), codec.len());
    assert_float_relative_slice_eq(
        codec.slice(&x, SubstRates).unwrap(),
        &[0.8, 1.6, 0.4, 0.6, 2.4],
        1e-12,
    );
    assert_float_relative_slice_eq(
        codec.slice(&x, Frequencies).unwrap(),
        &[0.25, 0.5, 0.75],
        1e-12,
    );
    assert_eq!(codec.slice(&x, PropInvar).unwrap(), &[0.0]);
    assert_eq!(codec.slice(&x, Alpha).unwrap(), &[0.5]);
    assert_eq!(
        codec.slice(&x, BranchesAll).unwrap(),
        &setup.branch_lengths[..]
    );
    assert_eq!(codec.slice(&x, RateWeights), None);

    let bounds = codec.bounds();
    assert_eq!(bounds[0], Bound::default_for(SubstRates));
    assert_eq!(bounds[5], Bound::default_for(Frequencies));
    assert_eq!(bounds[8], Bound::default_for(PropInvar));
    assert_eq!(bounds[9], Bound::default_for(Alpha));
    assert_eq!(bounds[14], Bound::default_for(BranchesAll));
}

#[test]
fn bound_overrides_keep_their_kind() {
    let (_, partition, setup) = gtr_partition(1);
    let request = OptimisationRequest::builder(&[0])
        .parameters([BranchesAll])
        .bounds(BranchesAll, 0.01, 5.0)
        .build();
    let codec = ParameterCodec::new(&request, &partition, &setup).unwrap();
    for bound in codec.bounds() {
        assert_eq!(bound, Bound::new(0.01, 5.0, BoundType::Lower));
    }
}

#[test]
fn decode_then_encode() {
    let (_, mut partition, mut setup) = gtr_partition(4);
    let request = request(4, [SubstRates, Frequencies, PropInvar, Alpha, BranchesAll]);
    let codec = ParameterCodec::new(&request, &partition, &setup).unwrap();
    let x = vec![
        2.0, 1.0, 0.5, 1.0, 3.0, // rates
        0.5, 0.3, 0.9, // frequencies
        0.2, // pinv
        1.3, // alpha
        0.2, 0.3, 0.4, 0.5, 0.6, // branches
    ];
    codec.decode(&x, &mut partition, &mut setup).unwrap();

    assert_float_relative_slice_eq(
        partition.subst_rates(0),
        &[2.0, 1.0, 0.5, 1.0, 3.0, 1.0],
        1e-12,
    );
    assert_relative_eq!(partition.frequencies(0).iter().sum::<f64>(), 1.0);
    assert_relative_eq!(partition.frequencies(0)[3], 1.0 / 2.7, epsilon = 1e-12);
    assert_eq!(partition.prop_invar(0), 0.2);
    assert_eq!(codec.alpha(), 1.3);
    assert_relative_eq!(
        partition.category_rates().iter().sum::<f64>() / 4.0,
        1.0,
        epsilon = 1e-8
    );
    assert_eq!(setup.branch_lengths, vec![0.2, 0.3, 0.4, 0.5, 0.6]);

    assert_float_relative_slice_eq(&codec.encode(&partition, &setup), &x, 1e-10);
}

#[test]
fn free_rates_keep_the_last_exchangeability_at_one() {
    let (_, mut partition, mut setup) = gtr_partition(1);
    let codec = ParameterCodec::new(&request(1, [SubstRates]), &partition, &setup).unwrap();
    assert_eq!(codec.len(), 5);
    let x = [2.0, 1.0, 1.0, 1.0, 3.0];
    codec.decode(&x, &mut partition, &mut setup).unwrap();
    assert_float_relative_slice_eq(
        partition.subst_rates(0),
        &[2.0, 1.0, 1.0, 1.0, 3.0, 1.0],
        1e-12,
    );
    assert_float_relative_slice_eq(&codec.encode(&partition, &setup), &x, 1e-12);
}

#[test]
fn rejected_decode_leaves_the_model_untouched() {
    let (_, mut partition, mut setup) = gtr_partition(4);
    let codec = ParameterCodec::new(
        &request(4, [SubstRates, PropInvar, BranchesAll]),
        &partition,
        &setup,
    )
    .unwrap();
    let before = codec.encode(&partition, &setup);
    let lengths = setup.branch_lengths.clone();
    let x = [
        2.0, 1.0, 1.0, 1.0, 3.0, // rates
        1.5, // pinv outside [0, 1)
        0.2, 0.3, 0.4, 0.5, 0.6, // branches
    ];
    let err = codec.decode(&x, &mut partition, &mut setup).unwrap_err();
    assert_matches!(
        err.downcast_ref::<OptimisationError>(),
        Some(OptimisationError::InvalidParameter(_))
    );
    assert_eq!(partition.subst_rates(0), &[1.2, 2.4, 0.6, 0.9, 3.6, 1.5]);
    assert_eq!(partition.prop_invar(0), 0.0);
    assert_eq!(setup.branch_lengths, lengths);
    assert_float_relative_slice_eq(&codec.encode(&partition, &setup), &before, 1e-12);
}

#[test]
fn random_round_trips() {
    let mut rng = StdRng::seed_from_u64(17);
    let (_, mut partition, mut setup) = gtr_partition(4);
    let request = request(4, [SubstRates, Frequencies, RateWeights, BranchesAll]);
    let codec = ParameterCodec::new(&request, &partition, &setup).unwrap();
    for _ in 0..20 {
        let x: Vec<f64> = codec
            .bounds()
            .iter()
            .map(|b| rng.gen_range(b.lower.max(0.01)..b.upper.min(10.0)))
            .collect();
        codec.decode(&x, &mut partition, &mut setup).unwrap();
        assert_relative_eq!(
            partition.frequencies(0).iter().sum::<f64>(),
            1.0,
            epsilon = 1e-12
        );
        assert_relative_eq!(
            partition.category_weights().iter().sum::<f64>(),
            1.0,
            epsilon = 1e-12
        );
        assert_eq!(partition.subst_rates(0)[5], 1.0);
        assert_float_relative_slice_eq(&codec.encode(&partition, &setup), &x, 1e-9);
    }
}

#[rstest]
#[case::hky(vec![0, 1, 0, 0, 1, 0], vec![4.0], vec![1.0, 4.0, 1.0, 1.0, 4.0, 1.0])]
#[case::tn93(vec![0, 1, 0, 0, 2, 0], vec![3.0, 5.0], vec![1.0, 3.0, 1.0, 1.0, 5.0, 1.0])]
#[case::last_class_fixed(vec![1, 0, 2, 2, 0, 1], vec![0.5, 2.0], vec![1.0, 0.5, 2.0, 2.0, 0.5, 1.0])]
fn symmetric_rates_share_values(
    #[case] symmetries: Vec<usize>,
    #[case] x: Vec<f64>,
    #[case] rates: Vec<f64>,
) {
    let (_, mut partition, mut setup) = gtr_partition(1);
    let request = OptimisationRequest::builder(&[0])
        .parameters([SubstRates])
        .symmetries(Some(symmetries))
        .build();
    let codec = ParameterCodec::new(&request, &partition, &setup).unwrap();
    assert_eq!(codec.len(), x.len());
    codec.decode(&x, &mut partition, &mut setup).unwrap();
    assert_eq!(partition.subst_rates(0), &rates[..]);
    assert_eq!(codec.encode(&partition, &setup), x);
}

#[test]
fn equal_rates_have_no_free_parameters() {
    let (_, partition, setup) = gtr_partition(1);
    let request = OptimisationRequest::builder(&[0])
        .parameters([SubstRates])
        .symmetries(Some(vec![0; 6]))
        .build();
    let codec = ParameterCodec::new(&request, &partition, &setup).unwrap();
    assert!(codec.is_empty());
}

#[test]
fn single_branch_at_evaluation_edge() {
    let (tree, mut partition, mut setup) = gtr_partition(1);
    let request = request(1, [BranchSingle]);
    let codec = ParameterCodec::new(&request, &partition, &setup).unwrap();
    assert_eq!(codec.encode(&partition, &setup), vec![0.05]);
    assert_eq!(codec.bounds()[0].kind, BoundType::Lower);

    codec.decode(&[0.3], &mut partition, &mut setup).unwrap();
    let EvaluationPoint::Edge { matrix, .. } = setup.evaluation else {
        panic!("evaluation is not at an edge");
    };
    let slot = setup
        .matrix_indices
        .iter()
        .position(|&m| m == matrix)
        .unwrap();
    assert_eq!(setup.branch_lengths[slot], 0.3);
    assert_eq!(setup.branch_lengths[..4], [0.1, 0.2, 0.3, 0.4]);
    assert_eq!(tree.length(tree.default_edge()), 0.05);
}

#[rstest]
#[case::topology(ParameterSet::from([Alpha, Topology]))]
fn topology_is_unimplemented(#[case] parameters: ParameterSet) {
    let err = codec_error(&request(1, parameters), 1);
    assert_matches!(err, OptimisationError::Unimplemented(_));
}

#[rstest]
#[case::nothing(ParameterSet::new())]
#[case::single_and_all(ParameterSet::from([BranchSingle, BranchesAll]))]
fn invalid_selections(#[case] parameters: ParameterSet) {
    let err = codec_error(&request(1, parameters), 1);
    assert_matches!(err, OptimisationError::InvalidSelection(_));
}

#[test]
fn single_branch_needs_an_edge() {
    let (_, partition, mut setup) = gtr_partition(1);
    setup.evaluation = EvaluationPoint::Root {
        clv: 4,
        scaler: Some(0),
    };
    let err = ParameterCodec::new(&request(1, [BranchSingle]), &partition, &setup).unwrap_err();
    assert_matches!(
        err.downcast_ref::<OptimisationError>(),
        Some(OptimisationError::InvalidSelection(_))
    );
}

#[test]
fn invalid_layouts() {
    let wrong_categories = request(2, [Alpha]);
    assert_matches!(
        codec_error(&wrong_categories, 4),
        OptimisationError::InvalidParameter(_)
    );
    let wrong_symmetries = OptimisationRequest::builder(&[0])
        .parameters([SubstRates])
        .symmetries(Some(vec![0, 1, 0]))
        .build();
    assert_matches!(
        codec_error(&wrong_symmetries, 1),
        OptimisationError::InvalidParameter(_)
    );
    let wrong_matrix = OptimisationRequest::builder(&[0])
        .parameters([Frequencies])
        .matrix(3)
        .build();
    assert_matches!(
        codec_error(&wrong_matrix, 1),
        OptimisationError::InvalidParameter(_)
    );
}

#[test]
fn decode_rejects_wrong_length() {
    let (_, mut partition, mut setup) = gtr_partition(1);
    let codec = ParameterCodec::new(&request(1, [Frequencies]), &partition, &setup).unwrap();
    let err = codec
        .decode(&[0.5, 0.5], &mut partition, &mut setup)
        .unwrap_err();
    assert_matches!(
        err.downcast_ref::<OptimisationError>(),
        Some(OptimisationError::InvalidParameter(_))
    );
}

#[test]
fn decode_rejects_invalid_values() {
    let (_, mut partition, mut setup) = gtr_partition(1);
    let codec = ParameterCodec::new(&request(1, [SubstRates]), &partition, &setup).unwrap();
    assert!(codec
        .decode(&[1.0, -1.0, 1.0, 1.0, 1.0], &mut partition, &mut setup)
        .is_err());
    assert_eq!(partition.subst_rates(0), &[1.2, 2.4, 0.6, 0.9, 3.6, 1.5]);
}

#[rstest]
#[case::pinv(PropInvar, None, (0.0, MAX_PINV))]
#[case::alpha(Alpha, None, (MIN_ALPHA, 100.0))]
#[case::branch(BranchSingle, None, (MIN_BRANCH_LENGTH, 100.0))]
#[case::override_both(Alpha, Some((0.5, 4.0)), (0.5, 4.0))]
#[case::override_max_only(PropInvar, Some((0.0, 0.5)), (0.0, 0.5))]
fn scalar_bounds(
    #[case] kind: ParameterKind,
    #[case] limits: Option<(f64, f64)>,
    #[case] expected: (f64, f64),
) {
    let mut builder = OptimisationRequest::builder(&[0]).parameters([kind]);
    if let Some((min, max)) = limits {
        builder = builder.bounds(kind, min, max);
    }
    assert_eq!(onedim_bounds(&builder.build(), kind), expected);
}
