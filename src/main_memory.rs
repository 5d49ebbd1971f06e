//! Main memory: a flat, word-addressed store. All coherence bookkeeping
//! lives in the caches and the interconnect; main memory itself is a dumb
//! array guarded by whatever serializes access to it (the interconnect's
//! single critical section).

use crate::error::{SimError, SimResult};
use crate::geometry::{ByteAddress, BLOCK_SIZE, MEMORY_WORDS, WORD_SIZE};

/// The simulator's main memory: `MEMORY_WORDS` 64-bit words.
pub struct MainMemory {
    words: Vec<u64>,
}

impl MainMemory {
    /// Create a zero-initialized main memory of `MEMORY_WORDS` words.
    pub fn new() -> MainMemory {
        MainMemory {
            words: vec![0u64; MEMORY_WORDS],
        }
    }

    /// Read the word at `word_index`.
    pub fn read(&self, word_index: usize) -> SimResult<u64> {
        self.words.get(word_index).copied().ok_or_else(|| {
            SimError::OutOfRange(format!(
                "word index {} out of range (0..{})",
                word_index, MEMORY_WORDS
            ))
        })
    }

    /// Write `value` to the word at `word_index`.
    pub fn write(&mut self, word_index: usize, value: u64) -> SimResult<()> {
        let slot = self.words.get_mut(word_index).ok_or_else(|| {
            SimError::OutOfRange(format!(
                "word index {} out of range (0..{})",
                word_index, MEMORY_WORDS
            ))
        })?;
        *slot = value;
        Ok(())
    }

    /// Read the word at `word_index` as an IEEE-754 double via exact bit
    /// reinterpretation (no numeric conversion), mirroring the original
    /// simulator's `memcpy`-based `readAsDouble`.
    pub fn read_as_f64(&self, word_index: usize) -> SimResult<f64> {
        self.read(word_index).map(f64::from_bits)
    }

    /// Write `value` to the word at `word_index` as its raw IEEE-754 bit
    /// pattern.
    pub fn write_as_f64(&mut self, word_index: usize, value: f64) -> SimResult<()> {
        self.write(word_index, value.to_bits())
    }

    /// Read one block's worth of bytes starting at `block_addr` (which must
    /// be block-aligned). Used only by the interconnect while servicing a
    /// `BusRd`/`BusRdX` transaction.
    pub fn read_block(&self, block_addr: ByteAddress) -> SimResult<[u8; BLOCK_SIZE]> {
        let mut out = [0u8; BLOCK_SIZE];
        let base_word = (block_addr.0 as usize) / WORD_SIZE;
        let words_per_block = BLOCK_SIZE / WORD_SIZE;
        for i in 0..words_per_block {
            let word = self.read(base_word + i)?;
            out[i * WORD_SIZE..(i + 1) * WORD_SIZE].copy_from_slice(&word.to_le_bytes());
        }
        Ok(out)
    }

    /// Write one block's worth of bytes starting at `block_addr`. Used only
    /// by the interconnect while servicing a `BusWB` transaction.
    pub fn write_block(&mut self, block_addr: ByteAddress, data: &[u8; BLOCK_SIZE]) -> SimResult<()> {
        let base_word = (block_addr.0 as usize) / WORD_SIZE;
        let words_per_block = BLOCK_SIZE / WORD_SIZE;
        for i in 0..words_per_block {
            let mut bytes = [0u8; WORD_SIZE];
            bytes.copy_from_slice(&data[i * WORD_SIZE..(i + 1) * WORD_SIZE]);
            self.write(base_word + i, u64::from_le_bytes(bytes))?;
        }
        Ok(())
    }
}

impl Default for MainMemory {
    fn default() -> Self {
        MainMemory::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let mut mem = MainMemory::new();
        mem.write(0, 0xDEADBEEF).unwrap();
        assert_eq!(mem.read(0).unwrap(), 0xDEADBEEF);
    }

    #[test]
    fn out_of_range_is_an_error() {
        let mem = MainMemory::new();
        assert!(matches!(
            mem.read(MEMORY_WORDS),
            Err(SimError::OutOfRange(_))
        ));
    }

    #[test]
    fn float_bit_reinterpretation_round_trips() {
        let mut mem = MainMemory::new();
        mem.write_as_f64(2, std::f64::consts::PI).unwrap();
        assert_eq!(mem.read_as_f64(2).unwrap(), std::f64::consts::PI);
        // And the raw bits match the f64's own bit pattern, not a decimal
        // conversion through some other width.
        assert_eq!(mem.read(2).unwrap(), std::f64::consts::PI.to_bits());
    }

    #[test]
    fn block_round_trip() {
        let mut mem = MainMemory::new();
        let mut data = [0u8; BLOCK_SIZE];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        mem.write_block(ByteAddress(0), &data).unwrap();
        let back = mem.read_block(ByteAddress(0)).unwrap();
        assert_eq!(back, data);
    }
}
