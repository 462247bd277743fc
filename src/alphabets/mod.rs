use lazy_static::lazy_static;

use bio::io::fasta::Record;

pub static NUCLEOTIDES: &[u8] = b"ACGT";
pub static AMB_NUCLEOTIDES: &[u8] = b"RYSWKMBDHVNX?";
pub static AMINOACIDS: &[u8] = b"ARNDCQEGHILKMFPSTWYV";
pub static AMB_AMINOACIDS: &[u8] = b"BJZX?*";
pub static GAP: u8 = b'-';
pub static POSSIBLE_GAPS: &[u8] = b"-.~_";

/// Bit set of the states a character is compatible with, bit `i` standing for state `i`.
pub type StateMask = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceType {
    DNA,
    Protein,
}

impl SequenceType {
    pub fn alphabet(&self) -> Alphabet {
        match self {
            SequenceType::DNA => dna_alphabet(),
            SequenceType::Protein => protein_alphabet(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alphabet {
    symbols: &'static [u8],
    ambiguous: &'static [u8],
    masks: &'static [StateMask; 256],
}

impl Alphabet {
    /// Number of unambiguous states.
    pub fn states(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbols(&self) -> &'static [u8] {
        self.symbols
    }

    pub fn all_symbols(&self) -> Vec<u8> {
        let mut symbols = self.symbols.to_vec();
        symbols.extend_from_slice(self.ambiguous);
        symbols
    }

    pub fn is_word(&self, word: &[u8]) -> bool {
        word.iter().all(|&c| self.mask(c) != 0)
    }

    /// State mask of a character, zero if the character is not part of the alphabet.
    pub fn mask(&self, char: u8) -> StateMask {
        self.masks[char as usize]
    }

    pub fn full_mask(&self) -> StateMask {
        full_mask(self.states())
    }
}

pub fn dna_alphabet() -> Alphabet {
    Alphabet {
        symbols: NUCLEOTIDES,
        ambiguous: AMB_NUCLEOTIDES,
        masks: &DNA_MASKS,
    }
}

pub fn protein_alphabet() -> Alphabet {
    Alphabet {
        symbols: AMINOACIDS,
        ambiguous: AMB_AMINOACIDS,
        masks: &PROTEIN_MASKS,
    }
}

/// Guesses the sequence type, anything that is not a valid DNA word is treated as protein.
pub fn sequence_type(sequences: &[Record]) -> SequenceType {
    let dna = dna_alphabet();
    if sequences.iter().all(|rec| dna.is_word(rec.seq())) {
        SequenceType::DNA
    } else {
        SequenceType::Protein
    }
}

fn full_mask(states: usize) -> StateMask {
    if states >= StateMask::BITS as usize {
        StateMask::MAX
    } else {
        (1 << states) - 1
    }
}

fn set_mask(masks: &mut [StateMask; 256], char: u8, mask: StateMask) {
    masks[char.to_ascii_uppercase() as usize] = mask;
    masks[char.to_ascii_lowercase() as usize] = mask;
}

fn nucleotide_mask(chars: &[u8]) -> StateMask {
    chars
        .iter()
        .map(|c| 1 << NUCLEOTIDES.iter().position(|n| n == c).unwrap_or_default())
        .fold(0, |acc, bit| acc | bit)
}

fn aminoacid_mask(chars: &[u8]) -> StateMask {
    chars
        .iter()
        .map(|c| 1 << AMINOACIDS.iter().position(|a| a == c).unwrap_or_default())
        .fold(0, |acc, bit| acc | bit)
}

static IUPAC_NUCLEOTIDES: &[(u8, &[u8])] = &[
    (b'A', b"A"),
    (b'C', b"C"),
    (b'G', b"G"),
    (b'T', b"T"),
    (b'U', b"T"),
    (b'R', b"AG"),
    (b'Y', b"CT"),
    (b'S', b"CG"),
    (b'W', b"AT"),
    (b'K', b"GT"),
    (b'M', b"AC"),
    (b'B', b"CGT"),
    (b'D', b"AGT"),
    (b'H', b"ACT"),
    (b'V', b"ACG"),
];

lazy_static! {
    pub static ref DNA_MASKS: [StateMask; 256] = {
        let mut masks = [0; 256];
        let full = full_mask(NUCLEOTIDES.len());
        for &(char, set) in IUPAC_NUCLEOTIDES {
            set_mask(&mut masks, char, nucleotide_mask(set));
        }
        for &char in b"NXO?" {
            set_mask(&mut masks, char, full);
        }
        for &char in POSSIBLE_GAPS {
            masks[char as usize] = full;
        }
        masks
    };
    pub static ref PROTEIN_MASKS: [StateMask; 256] = {
        let mut masks = [0; 256];
        let full = full_mask(AMINOACIDS.len());
        for (i, &char) in AMINOACIDS.iter().enumerate() {
            set_mask(&mut masks, char, 1 << i);
        }
        set_mask(&mut masks, b'B', aminoacid_mask(b"DN"));
        set_mask(&mut masks, b'Z', aminoacid_mask(b"EQ"));
        set_mask(&mut masks, b'J', aminoacid_mask(b"IL"));
        for &char in b"X?*" {
            set_mask(&mut masks, char, full);
        }
        for &char in POSSIBLE_GAPS {
            masks[char as usize] = full;
        }
        masks
    };
}
