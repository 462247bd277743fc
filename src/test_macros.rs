use crate::tree::UTree;

#[test]
fn test_record_macro() {
    let record = record!("seq1", Some("description"), b"ATCG");
    assert_eq!(record.id(), "seq1");
    assert_eq!(record.desc(), Some("description"));
    assert_eq!(record.seq(), b"ATCG");

    let record = record!("seq2", None, b"TTTT");
    assert_eq!(record.id(), "seq2");
    assert_eq!(record.desc(), None);
    assert_eq!(record.seq(), b"TTTT");

    let record = record_wo_desc!("seq3", b"GCGC");
    assert_eq!(record.id(), "seq3");
    assert_eq!(record.desc(), None);
}

#[test]
fn test_tree_macro() {
    let tree: UTree = tree!("((A:1.0,B:2.0):1.0,C:3.0,D:4.0);");
    assert_eq!(tree.tip_count(), 4);
    assert_eq!(tree.inner_count(), 2);
    assert_eq!(tree.branch_count(), 5);
}
