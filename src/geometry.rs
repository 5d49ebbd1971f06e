//! Address geometry: block size, set/way counts, and the tag/index/offset
//! decomposition shared by the cache and the interconnect.

/// Size of a cache block / bus transaction unit, in bytes.
pub const BLOCK_SIZE: usize = 32;

/// Number of sets per cache.
pub const NUM_SETS: usize = 8;

/// Number of ways per set (associativity).
pub const NUM_WAYS: usize = 2;

/// Number of bits of a byte address consumed by the block offset.
pub const OFFSET_BITS: u32 = 5; // log2(BLOCK_SIZE)

/// Number of bits of a byte address consumed by the set index.
pub const INDEX_BITS: u32 = 3; // log2(NUM_SETS)

/// Width in bytes of one main-memory word.
pub const WORD_SIZE: usize = 8;

/// Number of words in main memory.
pub const MEMORY_WORDS: usize = 512;

/// A 64-bit byte address, decomposable into (tag, index, offset).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteAddress(pub u64);

/// The decomposed form of a [`ByteAddress`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decomposed {
    /// High bits identifying the block's identity within a set.
    pub tag: u64,
    /// Which set of the cache this address maps to.
    pub index: usize,
    /// Byte offset within the block.
    pub offset: usize,
}

impl ByteAddress {
    /// Decompose this address into (tag, index, offset).
    pub fn decompose(self) -> Decomposed {
        let offset = (self.0 & ((1 << OFFSET_BITS) - 1)) as usize;
        let index = ((self.0 >> OFFSET_BITS) & ((1 << INDEX_BITS) - 1)) as usize;
        let tag = self.0 >> (OFFSET_BITS + INDEX_BITS);
        Decomposed { tag, index, offset }
    }

    /// Reassemble a byte address from its decomposed parts.
    pub fn compose(d: Decomposed) -> ByteAddress {
        let addr = (d.tag << (OFFSET_BITS + INDEX_BITS))
            | ((d.index as u64) << OFFSET_BITS)
            | d.offset as u64;
        ByteAddress(addr)
    }

    /// The byte address of the first byte of this address's containing
    /// block (offset cleared to zero).
    pub fn block_base(self) -> ByteAddress {
        ByteAddress(self.0 & !((1u64 << OFFSET_BITS) - 1))
    }

    /// Byte address of the word at the given word index.
    pub fn of_word(word_index: usize) -> ByteAddress {
        ByteAddress((word_index * WORD_SIZE) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for raw in [0u64, 1, 31, 32, 255, 256, 1_000_000] {
            let addr = ByteAddress(raw);
            let d = addr.decompose();
            assert_eq!(ByteAddress::compose(d), addr);
        }
    }

    #[test]
    fn offset_and_index_widths() {
        let addr = ByteAddress(0b1_010_11111); // tag=1, index=0b010, offset=0b11111
        let d = addr.decompose();
        assert_eq!(d.offset, 0b11111);
        assert_eq!(d.index, 0b010);
        assert_eq!(d.tag, 1);
    }

    #[test]
    fn block_base_clears_offset() {
        let addr = ByteAddress(0x123);
        assert_eq!(addr.block_base().0 % BLOCK_SIZE as u64, 0);
    }
}
