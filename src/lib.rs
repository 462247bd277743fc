use anyhow::Error;

#[macro_use]
mod macros;

pub mod alphabets;
pub mod io;
pub mod likelihood;
pub mod msa;
pub mod optimisers;
pub mod parameters;
pub mod tree;

pub type Result<T> = std::result::Result<T, Error>;

pub fn assert_float_relative_slice_eq(actual: &[f64], expected: &[f64], epsilon: f64) {
    use approx::relative_eq;
    assert_eq!(
        actual.len(),
        expected.len(),
        "Must have the same number of entries."
    );
    for (i, (&act, &exp)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            relative_eq!(act, exp, epsilon = epsilon),
            "Entries at position {} do not match, actual: {}, expected: {}",
            i,
            act,
            exp,
        );
    }
}

#[cfg(test)]
#[cfg_attr(coverage, coverage(off))]
mod test_macros;
