use std::fmt::Display;

use anyhow::bail;

use crate::likelihood::{EvaluationPoint, LikelihoodSetup, Operation};
use crate::optimisers::OptimisationError;
use crate::Result;

pub mod tree_parser;

pub type NodeIdx = usize;

/// One end of an edge in an unrooted tree. Inner nodes consist of three records linked in a
/// cycle through `next` that share their CLV and scaler; tips have a single record without
/// `next`. `back` is the record at the other end of the edge.
#[derive(Debug, Clone, PartialEq)]
pub struct UNode {
    pub idx: NodeIdx,
    pub next: Option<NodeIdx>,
    pub back: NodeIdx,
    pub length: f64,
    pub pmatrix_index: usize,
    pub clv_index: usize,
    pub scaler_index: Option<usize>,
    pub label: Option<String>,
}

impl UNode {
    pub(crate) fn new_tip(idx: NodeIdx, label: String) -> Self {
        Self {
            idx,
            next: None,
            back: idx,
            length: 0.0,
            pmatrix_index: idx,
            clv_index: idx,
            scaler_index: None,
            label: Some(label),
        }
    }

    pub fn is_tip(&self) -> bool {
        self.next.is_none()
    }
}

/// Unrooted binary tree stored as an arena of node records. Tips take indices `0..tips`, the
/// three records of inner node `k` follow at `tips + 3k..tips + 3k + 3`.
#[derive(Debug, Clone, PartialEq)]
pub struct UTree {
    pub(crate) nodes: Vec<UNode>,
    pub(crate) tips: usize,
}

impl UTree {
    pub fn tip_count(&self) -> usize {
        self.tips
    }

    pub fn inner_count(&self) -> usize {
        (self.nodes.len() - self.tips) / 3
    }

    pub fn branch_count(&self) -> usize {
        self.nodes.len() / 2
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, idx: NodeIdx) -> &UNode {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> &[UNode] {
        &self.nodes
    }

    pub fn back(&self, idx: NodeIdx) -> NodeIdx {
        self.nodes[idx].back
    }

    pub fn next(&self, idx: NodeIdx) -> Option<NodeIdx> {
        self.nodes[idx].next
    }

    pub fn is_tip(&self, idx: NodeIdx) -> bool {
        self.nodes[idx].is_tip()
    }

    pub fn length(&self, idx: NodeIdx) -> f64 {
        self.nodes[idx].length
    }

    pub fn tip_label(&self, tip: usize) -> &str {
        self.nodes[tip].label.as_deref().unwrap_or_default()
    }

    pub fn tip_index(&self, label: &str) -> Option<usize> {
        (0..self.tips).find(|&tip| self.tip_label(tip) == label)
    }

    /// Sets the length of the edge at `idx` on both of its ends.
    pub fn set_length(&mut self, idx: NodeIdx, length: f64) {
        let back = self.nodes[idx].back;
        self.nodes[idx].length = length;
        self.nodes[back].length = length;
    }

    /// The two other records of the inner node `idx` belongs to, in `next` order.
    pub fn children(&self, idx: NodeIdx) -> Option<(NodeIdx, NodeIdx)> {
        let q = self.nodes[idx].next?;
        let z = self.nodes[q].next?;
        Some((q, z))
    }

    /// Record at which likelihood evaluation starts by default: the first inner record, or the
    /// first tip of a two-taxon tree.
    pub fn default_edge(&self) -> NodeIdx {
        if self.inner_count() > 0 {
            self.tips
        } else {
            0
        }
    }

    /// One record per edge, ordered by probability matrix index.
    pub fn edges(&self) -> Vec<NodeIdx> {
        let mut edges: Vec<NodeIdx> = self
            .nodes
            .iter()
            .filter(|n| n.idx < n.back)
            .map(|n| n.idx)
            .collect();
        edges.sort_by_key(|&idx| self.nodes[idx].pmatrix_index);
        edges
    }

    pub fn branch_lengths(&self) -> Vec<f64> {
        self.edges().iter().map(|&e| self.length(e)).collect()
    }

    /// Applies lengths given per probability matrix index.
    pub fn set_lengths(&mut self, matrix_indices: &[usize], lengths: &[f64]) -> Result<()> {
        if matrix_indices.len() != lengths.len() {
            bail!(OptimisationError::InvalidParameter(format!(
                "Got {} matrix indices but {} lengths",
                matrix_indices.len(),
                lengths.len()
            )));
        }
        let edges = self.edges();
        for (&matrix, &length) in matrix_indices.iter().zip(lengths) {
            let Some(&edge) = edges
                .iter()
                .find(|&&e| self.nodes[e].pmatrix_index == matrix)
            else {
                bail!(OptimisationError::InvalidParameter(format!(
                    "No edge with probability matrix {}",
                    matrix
                )));
            };
            self.set_length(edge, length);
        }
        Ok(())
    }

    /// Operation recomputing the CLV of the inner node of `idx` from the subtrees behind its
    /// two other records, so that the CLV summarises everything away from `back(idx)`.
    pub fn operation(&self, idx: NodeIdx) -> Option<Operation> {
        let (q, z) = self.children(idx)?;
        let left = &self.nodes[self.back(q)];
        let right = &self.nodes[self.back(z)];
        let node = &self.nodes[idx];
        Some(Operation {
            parent_clv: node.clv_index,
            parent_scaler: node.scaler_index,
            child1_clv: left.clv_index,
            child1_scaler: left.scaler_index,
            child1_matrix: left.pmatrix_index,
            child2_clv: right.clv_index,
            child2_scaler: right.scaler_index,
            child2_matrix: right.pmatrix_index,
        })
    }

    /// Post-order operations orienting every CLV towards the edge at `edge`.
    pub fn traverse_operations(&self, edge: NodeIdx) -> Vec<Operation> {
        let mut operations = Vec::with_capacity(self.inner_count());
        self.collect_operations(edge, &mut operations);
        self.collect_operations(self.back(edge), &mut operations);
        operations
    }

    fn collect_operations(&self, idx: NodeIdx, operations: &mut Vec<Operation>) {
        let mut stack = vec![(idx, false)];
        while let Some((node, expanded)) = stack.pop() {
            let Some((q, z)) = self.children(node) else {
                continue;
            };
            if expanded {
                if let Some(op) = self.operation(node) {
                    operations.push(op);
                }
            } else {
                stack.push((node, true));
                stack.push((self.back(z), false));
                stack.push((self.back(q), false));
            }
        }
    }

    /// Likelihood setup evaluating the tree at the edge `edge`.
    pub fn likelihood_setup(&self, edge: NodeIdx, params_indices: &[usize]) -> LikelihoodSetup {
        let parent = &self.nodes[edge];
        let child = &self.nodes[parent.back];
        let edges = self.edges();
        LikelihoodSetup {
            operations: self.traverse_operations(edge),
            matrix_indices: edges
                .iter()
                .map(|&e| self.nodes[e].pmatrix_index)
                .collect(),
            branch_lengths: edges.iter().map(|&e| self.length(e)).collect(),
            params_indices: params_indices.to_vec(),
            evaluation: EvaluationPoint::Edge {
                parent_clv: parent.clv_index,
                parent_scaler: parent.scaler_index,
                child_clv: child.clv_index,
                child_scaler: child.scaler_index,
                matrix: parent.pmatrix_index,
            },
        }
    }

    pub fn to_newick(&self) -> String {
        let start = self.default_edge();
        let mut newick = String::from("(");
        if self.is_tip(start) {
            self.write_subtree(start, &mut newick);
            newick.push(',');
            let back = self.back(start);
            newick.push_str(self.nodes[back].label.as_deref().unwrap_or_default());
            newick.push_str(":0");
        } else {
            let (q, z) = self.children(start).unwrap_or((start, start));
            for (i, record) in [start, q, z].into_iter().enumerate() {
                if i > 0 {
                    newick.push(',');
                }
                self.write_subtree(self.back(record), &mut newick);
            }
        }
        newick.push_str(");");
        newick
    }

    fn write_subtree(&self, idx: NodeIdx, out: &mut String) {
        let node = &self.nodes[idx];
        match self.children(idx) {
            None => out.push_str(node.label.as_deref().unwrap_or_default()),
            Some((q, z)) => {
                out.push('(');
                self.write_subtree(self.back(q), out);
                out.push(',');
                self.write_subtree(self.back(z), out);
                out.push(')');
            }
        }
        out.push_str(&format!(":{}", node.length));
    }
}

impl Display for UTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_newick())
    }
}
