//! Assembles the parallel dot-product workload: one program per PE that
//! walks its slice of the two input vectors (installed by `vectors.rs`),
//! accumulates a partial sum via `FMUL`/`FADD`, and stores it into the
//! result area of memory. This exercises the full instruction set and the
//! full memory subsystem end to end, and is this simulator's canonical
//! worked example.

use crate::error::SimResult;
use crate::loader;
use crate::instruction::Instruction;

/// Split `n` elements as evenly as possible across `num_pes` contiguous
/// chunks; any remainder is distributed to the first chunks, one element
/// each.
pub fn split_range(n: usize, num_pes: usize) -> Vec<(usize, usize)> {
    let base = n / num_pes;
    let extra = n % num_pes;
    let mut ranges = Vec::with_capacity(num_pes);
    let mut start = 0;
    for pe in 0..num_pes {
        let len = base + if pe < extra { 1 } else { 0 };
        ranges.push((start, start + len));
        start += len;
    }
    ranges
}

/// Assembly source for one PE's partial dot product over `a[start..end]`
/// and `b[start..end]` (word indices into memory), storing the result at
/// `result_addr`.
fn program_source(start: usize, end: usize, a_base: usize, b_base: usize, result_addr: usize) -> String {
    let a_start = a_base + start;
    let b_start = b_base + start;
    let count = end - start;
    format!(
        "MOVE R1, {a_start}\n\
         MOVE R2, {b_start}\n\
         MOVE R3, {count}\n\
         MOVE R4, 0\n\
         loop_start:\n\
         CMP R3, 0\n\
         JLE loop_end\n\
         LOAD R5, R1\n\
         LOAD R6, R2\n\
         FMUL R7, R5, R6\n\
         FADD R4, R4, R7\n\
         INC R1\n\
         INC R2\n\
         DEC R3\n\
         JNZ loop_start\n\
         loop_end:\n\
         STORE R4, {result_addr}\n",
        a_start = a_start,
        b_start = b_start,
        count = count,
        result_addr = result_addr,
    )
}

/// Build one assembled program per PE for the dot-product workload over `n`
/// elements split across `num_pes` PEs. `a_base`/`b_base`/`result_base`
/// match the fixed memory layout from `vectors::install_vectors`
/// (`a_base = 1`, `b_base = n + 1`, `result_base = 2n + 1`).
pub fn build_dot_product_programs(
    n: usize,
    num_pes: usize,
    a_base: usize,
    b_base: usize,
    result_base: usize,
) -> SimResult<Vec<Vec<Instruction>>> {
    split_range(n, num_pes)
        .into_iter()
        .enumerate()
        .map(|(pe_id, (start, end))| {
            let source = program_source(start, end, a_base, b_base, result_base + pe_id);
            loader::assemble(&source)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_evenly_when_divisible() {
        let ranges = split_range(16, 4);
        assert_eq!(ranges, vec![(0, 4), (4, 8), (8, 12), (12, 16)]);
    }

    #[test]
    fn distributes_remainder_to_first_chunks() {
        let ranges = split_range(10, 4);
        assert_eq!(ranges, vec![(0, 3), (3, 6), (6, 8), (8, 10)]);
    }

    #[test]
    fn programs_assemble_without_error() {
        let programs = build_dot_product_programs(16, 4, 1, 17, 33).unwrap();
        assert_eq!(programs.len(), 4);
        for program in &programs {
            assert!(!program.is_empty());
        }
    }
}
