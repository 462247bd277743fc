use anyhow::bail;
use bio::io::fasta::Record;
use hashbrown::HashMap;
use log::info;

use crate::alphabets::{sequence_type, SequenceType};
use crate::io::DataError;
use crate::likelihood::{LikelihoodPartition, Partition};
use crate::Result;

/// Alignment columns compressed into unique site patterns with their multiplicities.
#[derive(Debug, Clone, PartialEq)]
pub struct Patterns {
    labels: Vec<String>,
    sequences: Vec<Vec<u8>>,
    weights: Vec<u32>,
    sequence_type: SequenceType,
}

impl Patterns {
    /// Compresses aligned records, keeping patterns in order of first appearance.
    pub fn from_records(records: &[Record]) -> Result<Self> {
        if records.is_empty() {
            bail!(DataError {
                message: String::from("No sequences to compress"),
            });
        }
        let length = records[0].seq().len();
        if let Some(rec) = records.iter().find(|rec| rec.seq().len() != length) {
            bail!(DataError {
                message: format!(
                    "Sequences are not aligned, {} has length {} instead of {}",
                    rec.id(),
                    rec.seq().len(),
                    length
                ),
            });
        }
        let sequence_type = sequence_type(records);
        let alphabet = sequence_type.alphabet();
        if let Some(rec) = records.iter().find(|rec| !alphabet.is_word(rec.seq())) {
            bail!(DataError {
                message: format!("Invalid characters in sequence {}", rec.id()),
            });
        }

        let mut index: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut columns: Vec<Vec<u8>> = Vec::new();
        let mut weights = Vec::new();
        for site in 0..length {
            let column: Vec<u8> = records
                .iter()
                .map(|rec| rec.seq()[site].to_ascii_uppercase())
                .collect();
            match index.get(&column) {
                Some(&pattern) => weights[pattern] += 1,
                None => {
                    index.insert(column.clone(), columns.len());
                    columns.push(column);
                    weights.push(1);
                }
            }
        }

        let sequences = (0..records.len())
            .map(|row| columns.iter().map(|col| col[row]).collect())
            .collect();
        info!(
            "Compressed {} sites into {} patterns.",
            length,
            columns.len()
        );
        Ok(Self {
            labels: records.iter().map(|rec| rec.id().to_string()).collect(),
            sequences,
            weights,
            sequence_type,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn sequence(&self, row: usize) -> &[u8] {
        &self.sequences[row]
    }

    pub fn weights(&self) -> &[u32] {
        &self.weights
    }

    pub fn pattern_count(&self) -> usize {
        self.weights.len()
    }

    pub fn taxa_count(&self) -> usize {
        self.labels.len()
    }

    /// Number of alignment columns before compression.
    pub fn site_count(&self) -> usize {
        self.weights.iter().map(|&w| w as usize).sum()
    }

    pub fn sequence_type(&self) -> SequenceType {
        self.sequence_type
    }
}

fn uncompressed_sites(partition: &Partition) -> f64 {
    partition
        .pattern_weights()
        .iter()
        .map(|&w| w as f64)
        .sum()
}

/// State frequencies observed at the tips, ambiguous characters counting equally towards
/// every state they allow.
pub fn empirical_frequencies(partition: &Partition) -> Vec<f64> {
    let states = partition.states();
    let weights = partition.pattern_weights();
    let mut frequencies = vec![0.0; states];
    for tip in 0..partition.tips() {
        for (mask, &w) in partition.tip_masks(tip).iter().zip(weights) {
            let share = w as f64 / mask.count_ones() as f64;
            for (k, freq) in frequencies.iter_mut().enumerate() {
                if mask & (1 << k) != 0 {
                    *freq += share;
                }
            }
        }
    }
    let total = uncompressed_sites(partition) * partition.tips() as f64;
    frequencies.iter_mut().for_each(|f| *f /= total);
    frequencies
}

/// Exchangeabilities from pairwise co-occurrence of states within sites, relative to the last
/// pair and clamped to `[0.01, 50]`. The last rate is exactly one.
pub fn empirical_subst_rates(partition: &Partition) -> Vec<f64> {
    let states = partition.states();
    let undefined = (0..states).fold(0u32, |acc, k| acc | (1 << k));
    let weights = partition.pattern_weights();
    let mut pair_counts = vec![0.0; states * states];
    let mut state_counts = vec![0u64; states];
    for (site, &w) in weights.iter().enumerate() {
        state_counts.iter_mut().for_each(|c| *c = 0);
        for tip in 0..partition.tips() {
            let mask = partition.tip_masks(tip)[site];
            if mask == undefined {
                continue;
            }
            for (k, count) in state_counts.iter_mut().enumerate() {
                if mask & (1 << k) != 0 {
                    *count += 1;
                }
            }
        }
        for i in 0..states {
            if state_counts[i] == 0 {
                continue;
            }
            for j in (i + 1)..states {
                pair_counts[i * states + j] += (state_counts[i] * state_counts[j]) as f64 * w as f64;
            }
        }
    }

    let mut last = pair_counts[(states - 2) * states + states - 1];
    if last < 1e-7 {
        last = 1.0;
    }
    let mut rates = Vec::with_capacity(states * (states - 1) / 2);
    for i in 0..states - 1 {
        for j in (i + 1)..states {
            rates.push((pair_counts[i * states + j] / last).clamp(0.01, 50.0));
        }
    }
    if let Some(r) = rates.last_mut() {
        *r = 1.0;
    }
    rates
}

/// Share of alignment columns that are invariant.
pub fn empirical_invariant_sites(partition: &mut Partition) -> f64 {
    if partition.invariant_sites().is_none() {
        partition.update_invariant_sites();
    }
    let invariant: f64 = partition
        .invariant_sites()
        .unwrap_or_default()
        .iter()
        .zip(partition.pattern_weights())
        .filter(|(inv, _)| inv.is_some())
        .map(|(_, &w)| w as f64)
        .sum();
    invariant / uncompressed_sites(partition)
}
