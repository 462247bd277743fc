use std::fmt;
use std::result::Result as stdResult;

use anyhow::bail;
use log::{info, warn};
use pest::error::{Error as PestError, ErrorVariant};
use pest::{iterators::Pair, Parser};
use pest_derive::Parser;

use crate::tree::{NodeIdx, UNode, UTree};
use crate::Result;

#[derive(Parser)]
#[grammar = "./tree/newick.pest"]
pub struct NewickParser;

#[derive(Debug)]
pub(crate) struct ParsingError(pub(crate) Box<PestError<Rule>>);

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Malformed newick string")?;
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParsingError {}

/// Subtree as read from the newick string, before indices are assigned.
#[derive(Debug)]
struct ParsedNode {
    label: String,
    length: f64,
    children: Vec<ParsedNode>,
}

impl ParsedNode {
    fn tip_count(&self) -> usize {
        if self.children.is_empty() {
            1
        } else {
            self.children.iter().map(|c| c.tip_count()).sum()
        }
    }
}

pub fn from_newick(newick_string: &str) -> Result<Vec<UTree>> {
    info!("Parsing newick trees.");
    let mut trees = Vec::new();
    let newick_rule = match NewickParser::parse(Rule::newick, newick_string) {
        Ok(mut pairs) => pairs.next(),
        Err(e) => bail!(ParsingError(Box::new(e))),
    };
    let Some(newick_rule) = newick_rule else {
        return Ok(trees);
    };
    for tree_rule in newick_rule.into_inner() {
        if tree_rule.as_rule() != Rule::tree {
            continue;
        }
        let Some(rule) = tree_rule.into_inner().next() else {
            continue;
        };
        let parsed = match rule.as_rule() {
            Rule::rooted => parse_rooted_rule(rule),
            Rule::unrooted => parse_unrooted_rule(rule),
            _ => unreachable!(),
        };
        match parsed {
            Ok(top) => trees.push(TreeBuilder::build(top)),
            Err(e) => bail!(ParsingError(e)),
        }
    }
    info!("Finished parsing newick trees successfully.");
    Ok(trees)
}

fn custom_error(rule: &Pair<Rule>, message: &str) -> Box<PestError<Rule>> {
    Box::new(PestError::new_from_span(
        ErrorVariant::CustomError {
            message: message.to_string(),
        },
        rule.as_span(),
    ))
}

fn parse_rooted_rule(rooted_rule: Pair<Rule>) -> stdResult<ParsedNode, Box<PestError<Rule>>> {
    let span_rule = rooted_rule.clone();
    let Some(top_rule) = rooted_rule.into_inner().next() else {
        return Err(custom_error(&span_rule, "Empty tree"));
    };
    let top = match top_rule.as_rule() {
        Rule::internal => parse_internal_rule(top_rule.clone(), true)?,
        _ => return Err(custom_error(&top_rule, "A tree needs at least two taxa")),
    };
    if top.children.len() != 2 {
        return Err(custom_error(
            &top_rule,
            "The root of a rooted tree must have exactly two children",
        ));
    }
    warn!("Found rooted tree, will unroot it by joining the two root branches.");
    Ok(top)
}

fn parse_unrooted_rule(tree_rule: Pair<Rule>) -> stdResult<ParsedNode, Box<PestError<Rule>>> {
    let span_rule = tree_rule.clone();
    let top = parse_internal_rule(tree_rule, true)?;
    if top.children.len() != 3 {
        return Err(custom_error(
            &span_rule,
            "Only binary unrooted trees with a trifurcation at the top are supported",
        ));
    }
    Ok(top)
}

fn parse_internal_rule(
    internal_rule: Pair<Rule>,
    is_top: bool,
) -> stdResult<ParsedNode, Box<PestError<Rule>>> {
    let span_rule = internal_rule.clone();
    let mut node = ParsedNode {
        label: String::new(),
        length: 0.0,
        children: Vec::new(),
    };
    for rule in internal_rule.into_inner() {
        match rule.as_rule() {
            Rule::label => node.label = parse_label_rule(rule),
            Rule::branch_length => node.length = parse_branch_length_rule(rule)?,
            Rule::internal => node.children.push(parse_internal_rule(rule, false)?),
            Rule::leaf => node.children.push(parse_leaf_rule(rule)?),
            _ => unreachable!(),
        }
    }
    if !is_top && node.children.len() != 2 {
        return Err(custom_error(
            &span_rule,
            "Inner nodes must have exactly two children",
        ));
    }
    Ok(node)
}

fn parse_leaf_rule(leaf_rule: Pair<Rule>) -> stdResult<ParsedNode, Box<PestError<Rule>>> {
    let mut node = ParsedNode {
        label: String::new(),
        length: 0.0,
        children: Vec::new(),
    };
    for rule in leaf_rule.into_inner() {
        match rule.as_rule() {
            Rule::label => node.label = parse_label_rule(rule),
            Rule::branch_length => node.length = parse_branch_length_rule(rule)?,
            _ => unreachable!(),
        }
    }
    Ok(node)
}

fn parse_branch_length_rule(rule: Pair<Rule>) -> stdResult<f64, Box<PestError<Rule>>> {
    let Some(number) = rule.clone().into_inner().next() else {
        return Err(custom_error(&rule, "Missing branch length"));
    };
    match number.as_str().trim().parse::<f64>() {
        Ok(length) if length.is_finite() && length >= 0.0 => Ok(length),
        Ok(_) => Err(custom_error(
            &number,
            "Branch lengths must be finite and non-negative",
        )),
        Err(_) => Err(custom_error(&number, "Branch length is not a number")),
    }
}

fn parse_label_rule(rule: Pair<Rule>) -> String {
    rule.as_str().to_string()
}

/// Lays out a parsed tree in the arena: tips first in order of appearance, then inner nodes.
/// Tip edges use the tip index as probability matrix, inner edges are numbered after them.
struct TreeBuilder {
    nodes: Vec<UNode>,
    tips: usize,
    next_tip: usize,
    next_pmatrix: usize,
}

impl TreeBuilder {
    fn build(top: ParsedNode) -> UTree {
        let tips = top.tip_count();
        let mut builder = TreeBuilder {
            nodes: (0..tips)
                .map(|idx| UNode::new_tip(idx, String::new()))
                .collect(),
            tips,
            next_tip: 0,
            next_pmatrix: tips,
        };
        if top.children.len() == 3 {
            let records = builder.add_inner(&top.label);
            for (record, child) in records.into_iter().zip(&top.children) {
                let up = builder.add_subtree(child);
                builder.connect(record, up, child.length);
            }
        } else {
            let left = builder.add_subtree(&top.children[0]);
            let right = builder.add_subtree(&top.children[1]);
            builder.connect(
                left,
                right,
                top.children[0].length + top.children[1].length,
            );
        }
        UTree {
            nodes: builder.nodes,
            tips,
        }
    }

    /// Adds the subtree and returns the record that faces its parent.
    fn add_subtree(&mut self, node: &ParsedNode) -> NodeIdx {
        if node.children.is_empty() {
            let idx = self.next_tip;
            self.next_tip += 1;
            self.nodes[idx].label = Some(node.label.clone());
            return idx;
        }
        let [up, left, right] = self.add_inner(&node.label);
        let left_up = self.add_subtree(&node.children[0]);
        self.connect(left, left_up, node.children[0].length);
        let right_up = self.add_subtree(&node.children[1]);
        self.connect(right, right_up, node.children[1].length);
        up
    }

    fn add_inner(&mut self, label: &str) -> [NodeIdx; 3] {
        let first = self.nodes.len();
        let k = (first - self.tips) / 3;
        let records = [first, first + 1, first + 2];
        for (i, &idx) in records.iter().enumerate() {
            self.nodes.push(UNode {
                idx,
                next: Some(records[(i + 1) % 3]),
                back: idx,
                length: 0.0,
                pmatrix_index: 0,
                clv_index: self.tips + k,
                scaler_index: Some(k),
                label: if i == 0 && !label.is_empty() {
                    Some(label.to_string())
                } else {
                    None
                },
            });
        }
        records
    }

    fn connect(&mut self, a: NodeIdx, b: NodeIdx, length: f64) {
        let pmatrix = if self.nodes[a].is_tip() {
            a
        } else if self.nodes[b].is_tip() {
            b
        } else {
            self.next_pmatrix += 1;
            self.next_pmatrix - 1
        };
        for (from, to) in [(a, b), (b, a)] {
            let node = &mut self.nodes[from];
            node.back = to;
            node.length = length;
            node.pmatrix_index = pmatrix;
        }
    }
}

