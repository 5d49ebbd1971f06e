//! Loads the two input vectors for the dot-product workload from plain
//! text files and installs them into main memory using the fixed layout:
//! `mem[0] = N`, `mem[1..=N] = A`, `mem[N+1..=2N] = B`, `mem[2N+1..3N] = 0`
//! (the result area PEs write their partial sums into).

use std::fs;
use std::path::Path;

use crate::bus::Interconnect;
use crate::error::{SimError, SimResult};
use crate::geometry::MEMORY_WORDS;

/// Parse a vector file: one decimal floating point number per line, blank
/// lines and `#`/`;`-prefixed comment lines ignored.
pub fn parse_vector_file(contents: &str) -> SimResult<Vec<f64>> {
    let mut values = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }
        let value: f64 = trimmed.parse().map_err(|_| {
            SimError::ConfigError(format!(
                "line {}: {:?} is not a valid number",
                line_no + 1,
                trimmed
            ))
        })?;
        values.push(value);
    }
    Ok(values)
}

/// Read and parse a vector file from disk.
pub fn load_vector_file(path: &Path) -> SimResult<Vec<f64>> {
    let contents = fs::read_to_string(path)?;
    parse_vector_file(&contents)
}

/// Install vectors `a` and `b` (equal length `n`) into main memory via the
/// interconnect's direct preload path, per the fixed layout. Returns `n`.
pub fn install_vectors(interconnect: &Interconnect, a: &[f64], b: &[f64]) -> SimResult<usize> {
    if a.len() != b.len() {
        return Err(SimError::ConfigError(format!(
            "vector length mismatch: A has {} elements, B has {}",
            a.len(),
            b.len()
        )));
    }
    let n = a.len();
    if 3 * n + 1 > MEMORY_WORDS {
        return Err(SimError::ConfigError(format!(
            "vectors of length {} do not fit in {} words of memory",
            n, MEMORY_WORDS
        )));
    }

    interconnect.preload_word(0, n as u64)?;
    for (i, &value) in a.iter().enumerate() {
        interconnect.preload_word(1 + i, value.to_bits())?;
    }
    for (i, &value) in b.iter().enumerate() {
        interconnect.preload_word(n + 1 + i, value.to_bits())?;
    }
    for i in 0..n {
        interconnect.preload_word(2 * n + 1 + i, 0)?;
    }

    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::main_memory::MainMemory;

    #[test]
    fn parses_vector_file_ignoring_comments_and_blanks() {
        let text = "# header\n1.0\n;comment\n\n2.5\n-3\n";
        let values = parse_vector_file(text).unwrap();
        assert_eq!(values, vec![1.0, 2.5, -3.0]);
    }

    #[test]
    fn installs_layout_correctly() {
        let ic = Interconnect::new(1, MainMemory::new());
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![5.0, 6.0, 7.0, 8.0];
        let n = install_vectors(&ic, &a, &b).unwrap();
        assert_eq!(n, 4);
        assert_eq!(ic.peek_word(0).unwrap(), 4);
        assert_eq!(f64::from_bits(ic.peek_word(1).unwrap()), 1.0);
        assert_eq!(f64::from_bits(ic.peek_word(4).unwrap()), 4.0);
        assert_eq!(f64::from_bits(ic.peek_word(5).unwrap()), 5.0);
        assert_eq!(f64::from_bits(ic.peek_word(8).unwrap()), 8.0);
        assert_eq!(ic.peek_word(9).unwrap(), 0);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let ic = Interconnect::new(1, MainMemory::new());
        let result = install_vectors(&ic, &[1.0, 2.0], &[1.0]);
        assert!(matches!(result, Err(SimError::ConfigError(_))));
    }
}
