use std::error::Error;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::bail;
use bio::io::fasta::{Reader, Record};
use log::info;

use crate::alphabets::{protein_alphabet, GAP, POSSIBLE_GAPS};
use crate::tree::{tree_parser, UTree};
use crate::Result;

pub(crate) struct DataError {
    pub(crate) message: String,
}
impl fmt::Debug for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl Error for DataError {}

/// Reads sequences from a fasta file, returning a vector of fasta records.
/// All sequences are converted to uppercase and every gap symbol to `-`.
///
/// # Arguments
/// * `path` - Path to the fasta file.
pub fn read_sequences(path: &Path) -> Result<Vec<Record>> {
    info!("Reading sequences from file {}", path.display());
    let reader = Reader::from_file(path)?;
    let mut sequences = Vec::new();

    for result in reader.records() {
        let rec = result?;
        if let Err(e) = rec.check() {
            bail!(DataError {
                message: e.to_string()
            });
        }
        let seq: Vec<u8> = rec
            .seq()
            .to_ascii_uppercase()
            .iter()
            .map(|c| if POSSIBLE_GAPS.contains(c) { GAP } else { *c })
            .collect();

        if !protein_alphabet().is_word(&seq) {
            bail!(DataError {
                message: format!(
                    "Invalid genetic sequence encountered: {}",
                    String::from_utf8_lossy(&seq)
                )
            });
        }

        sequences.push(Record::with_attrs(rec.id(), rec.desc(), &seq));
    }
    if sequences.is_empty() {
        bail!(DataError {
            message: String::from("No sequences found in file")
        });
    }

    info!("Read sequences successfully");
    Ok(sequences)
}

/// Reads newick trees from a file, returning a vector of unrooted trees.
///
/// Rooted trees are unrooted by merging the two branches at the root.
pub fn read_newick_from_file(path: &Path) -> Result<Vec<UTree>> {
    info!("Reading newick trees from file {}", path.display());
    let newick = fs::read_to_string(path)?;
    info!("Read file successfully");
    tree_parser::from_newick(&newick)
}

/// Writes newick trees to the given file path. Will return an error if the file already exists.
pub fn write_newick_to_file(trees: &[UTree], path: &Path) -> Result<()> {
    info!("Writing newick trees to file {}", path.display());
    if path.exists() {
        bail!(DataError {
            message: String::from("File already exists")
        });
    }
    let mut writer = File::create(path)?;
    for tree in trees {
        writer.write_all(tree.to_newick().as_bytes())?;
        writer.write_all(b"\n")?;
    }
    info!("Finished writing successfully");
    Ok(())
}
