//! The per-PE set-associative cache: services local loads/stores from its
//! owning PE and snooped bus events from peer caches, keeping itself
//! coherent via the pure MESI controller in `mesi.rs` and evicting via the
//! bit-matrix LRU in `lru.rs`.
//!
//! A `Cache` holds no handle back to the interconnect. All bus traffic a
//! cache needs (fetches, upgrades, writebacks) is driven by the
//! [`crate::bus::Interconnect`], which owns every cache directly inside its
//! own single lock and therefore never needs to re-enter anything to reach
//! one. See `bus.rs` for why that single-lock shape is what makes the
//! snoop/request interleaving deadlock-free.

use log::trace;

use crate::error::SimResult;
use crate::geometry::{ByteAddress, Decomposed, BLOCK_SIZE, NUM_SETS, NUM_WAYS, WORD_SIZE};
use crate::lru::LruPolicy;
use crate::main_memory::MainMemory;
use crate::mesi::{self, BusEvent, MesiState};

/// The cache's write-hit / write-miss policy. The combination required to
/// be correct end-to-end is `WriteBackAllocate`; `WriteThroughNoAllocate` is
/// provided for completeness (it bypasses the cache entirely on a write
/// miss) but is not exercised by the coherence invariants in the test
/// suite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WritePolicy {
    /// Write-back, write-allocate: the default and only policy guaranteed
    /// correct under the full MESI/LRU/interconnect interaction.
    WriteBackAllocate,
    /// Write-through, no-write-allocate: writes on a miss go straight to
    /// memory without installing a line.
    WriteThroughNoAllocate,
}

/// One way of one cache set.
#[derive(Clone, Copy, Debug)]
struct CacheLine {
    valid: bool,
    dirty: bool,
    mesi: MesiState,
    tag: u64,
    data: [u8; BLOCK_SIZE],
}

impl CacheLine {
    fn empty() -> CacheLine {
        CacheLine {
            valid: false,
            dirty: false,
            mesi: MesiState::Invalid,
            tag: 0,
            data: [0u8; BLOCK_SIZE],
        }
    }
}

struct CacheSet {
    ways: [CacheLine; NUM_WAYS],
    lru: LruPolicy,
}

impl CacheSet {
    fn new() -> CacheSet {
        CacheSet {
            ways: [CacheLine::empty(); NUM_WAYS],
            lru: LruPolicy::new(NUM_WAYS),
        }
    }

    fn find(&self, tag: u64) -> Option<usize> {
        self.ways
            .iter()
            .position(|line| line.valid && line.tag == tag)
    }
}

/// Per-cache access statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    /// Local reads that hit.
    pub read_hits: u64,
    /// Local reads that missed.
    pub read_misses: u64,
    /// Local writes that hit.
    pub write_hits: u64,
    /// Local writes that missed.
    pub write_misses: u64,
    /// Lines killed by a snooped invalidation.
    pub invalidations: u64,
    /// Blocks flushed to memory (eviction or snoop-triggered).
    pub writebacks: u64,
    /// MESI state transitions actually taken (`next != current`).
    pub mesi_transitions: u64,
}

/// What a local miss needs from the rest of the machine before the line can
/// be installed. Produced by [`Cache::begin_miss`], consumed by
/// [`Cache::finish_miss`] once the interconnect has broadcast the snoop and
/// fetched (or not) the block.
pub struct MissRequest {
    pub block_address: ByteAddress,
    pub evicted_writeback: Option<(ByteAddress, [u8; BLOCK_SIZE])>,
    pub needs_bus_message: bool,
    way: usize,
    decomposed: Decomposed,
    next_state: MesiState,
    dirty_on_install: bool,
}

/// A private, write-back set-associative cache belonging to one PE.
pub struct Cache {
    pe_id: usize,
    sets: Vec<CacheSet>,
    write_policy: WritePolicy,
    stats: CacheStats,
}

impl Cache {
    /// Create a cache for the given PE, with `NUM_SETS` sets of `NUM_WAYS`
    /// ways each.
    pub fn new(pe_id: usize, write_policy: WritePolicy) -> Cache {
        Cache {
            pe_id,
            sets: (0..NUM_SETS).map(|_| CacheSet::new()).collect(),
            write_policy,
            stats: CacheStats::default(),
        }
    }

    /// The PE this cache belongs to.
    pub fn pe_id(&self) -> usize {
        self.pe_id
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// This cache's write policy.
    pub fn write_policy(&self) -> WritePolicy {
        self.write_policy
    }

    fn run_mesi(&mut self, set: usize, way: usize, event: BusEvent) -> mesi::MesiResult {
        let current = self.sets[set].ways[way].mesi;
        let result = mesi::transition(current, event);
        if result.next_state != current {
            self.stats.mesi_transitions += 1;
            trace!(
                "pe{} cache set{} way{}: {:?} -[{:?}]-> {:?}",
                self.pe_id, set, way, current, event, result.next_state
            );
        }
        self.sets[set].ways[way].mesi = result.next_state;
        result
    }

    fn block_address_of(&self, set_idx: usize, tag: u64) -> ByteAddress {
        ByteAddress::compose(Decomposed {
            tag,
            index: set_idx,
            offset: 0,
        })
    }

    /// Try a local read against the cache as it stands. On hit, updates
    /// MESI/LRU/stats and returns the word. On miss, bumps the miss
    /// counter and returns `None`; the caller must follow up with
    /// [`Cache::begin_miss`].
    pub fn try_read_hit(&mut self, addr: ByteAddress) -> Option<u64> {
        let d = addr.decompose();
        let way = self.sets[d.index].find(d.tag)?;
        self.stats.read_hits += 1;
        self.run_mesi(d.index, way, BusEvent::LocalRead);
        self.sets[d.index].lru.access(way);
        Some(read_word(&self.sets[d.index].ways[way].data, d.offset))
    }

    /// Try a local write against the cache as it stands. On hit, updates
    /// MESI/LRU/stats, writes the word, and returns `Some(needs_bus_message)`
    /// (whether a `BusUpgr` must be broadcast to invalidate peers). On miss,
    /// bumps the miss counter and returns `None`.
    pub fn try_write_hit(&mut self, addr: ByteAddress, value: u64) -> Option<bool> {
        let d = addr.decompose();
        let way = self.sets[d.index].find(d.tag)?;
        self.stats.write_hits += 1;
        let result = self.run_mesi(d.index, way, BusEvent::LocalWrite);
        write_word(&mut self.sets[d.index].ways[way].data, d.offset, value);
        self.sets[d.index].ways[way].dirty = true;
        self.sets[d.index].lru.access(way);
        Some(result.needs_bus_message)
    }

    /// Select and evict a victim way for a miss at `addr`, preparing
    /// whatever bus activity the miss itself requires. Any writeback the
    /// eviction causes is returned for the caller (the interconnect) to
    /// apply directly to memory: eviction never needs a snoop broadcast of
    /// its own, since the evicting cache is the sole owner of the line
    /// being replaced.
    pub fn begin_miss(&mut self, addr: ByteAddress, event: BusEvent) -> MissRequest {
        let d = addr.decompose();
        let set_idx = d.index;

        let way = {
            let set = &self.sets[set_idx];
            if let Some(invalid_way) = set.ways.iter().position(|l| !l.valid) {
                invalid_way
            } else {
                set.lru.victim()
            }
        };

        let mut evicted_writeback = None;
        if self.sets[set_idx].ways[way].valid {
            let result = self.run_mesi(set_idx, way, BusEvent::Eviction);
            if result.needs_writeback {
                let block_addr = self.block_address_of(set_idx, self.sets[set_idx].ways[way].tag);
                evicted_writeback = Some((block_addr, self.sets[set_idx].ways[way].data));
                self.stats.writebacks += 1;
            }
            // Eviction always leaves the line Invalid, per the MESI table.
            self.sets[set_idx].ways[way].valid = false;
            self.sets[set_idx].ways[way].dirty = false;
        }

        let result = mesi::transition(MesiState::Invalid, event);
        self.stats.mesi_transitions += 1;

        MissRequest {
            block_address: addr.block_base(),
            evicted_writeback,
            needs_bus_message: result.needs_bus_message,
            way,
            decomposed: d,
            next_state: result.next_state,
            dirty_on_install: event == BusEvent::LocalWrite,
        }
    }

    /// Install the line a [`MissRequest`] describes, once the interconnect
    /// has broadcast the snoop and (if needed) fetched the block. `value`
    /// carries the word being stored for a write miss (patched in before
    /// install); `None` for a plain read miss. `peer_holds_block` is whether
    /// the snoop broadcast found a peer still holding the block afterward
    /// (S/E/M): a read miss that finds one installs `Shared` instead of the
    /// optimistic `Exclusive` `begin_miss` assumed before the broadcast ran.
    pub fn finish_miss(
        &mut self,
        req: MissRequest,
        fetched: Option<[u8; BLOCK_SIZE]>,
        value: Option<u64>,
        peer_holds_block: bool,
    ) -> u64 {
        let d = req.decomposed;
        let mut data = fetched.unwrap_or([0u8; BLOCK_SIZE]);
        if let Some(value) = value {
            write_word(&mut data, d.offset, value);
            self.stats.write_misses += 1;
        } else {
            self.stats.read_misses += 1;
        }

        let next_state = if peer_holds_block && req.next_state == MesiState::Exclusive {
            MesiState::Shared
        } else {
            req.next_state
        };

        self.sets[d.index].ways[req.way] = CacheLine {
            valid: true,
            dirty: req.dirty_on_install,
            mesi: next_state,
            tag: d.tag,
            data,
        };
        self.sets[d.index].lru.access(req.way);

        read_word(&data, d.offset)
    }

    /// The write policy this cache was configured with, and whether a
    /// write-through no-write-allocate miss is in play; used by the
    /// interconnect to choose between the write-allocate and bypass paths.
    pub fn is_write_allocate(&self) -> bool {
        self.write_policy == WritePolicy::WriteBackAllocate
    }

    /// Handle a snooped bus event for `block_addr`, raised by a peer cache's
    /// transaction. Called by the interconnect from inside its own single
    /// lock, so any writeback this causes is applied directly to `memory`.
    /// Returns whether this cache still holds the block afterward (S/E/M) —
    /// `false` on a tag miss or when the event invalidated the line.
    pub fn snoop(&mut self, block_addr: ByteAddress, event: BusEvent, memory: &mut MainMemory) -> bool {
        let d = block_addr.decompose();
        let way = match self.sets[d.index].find(d.tag) {
            Some(way) => way,
            None => return false, // tag miss: this cache doesn't hold the block, no-op
        };

        let result = self.run_mesi(d.index, way, event);

        if result.needs_writeback {
            let data = self.sets[d.index].ways[way].data;
            if memory.write_block(block_addr, &data).is_ok() {
                self.stats.writebacks += 1;
            }
            self.sets[d.index].ways[way].dirty = false;
        }

        if result.needs_invalidate {
            self.sets[d.index].ways[way].valid = false;
            self.sets[d.index].ways[way].dirty = false;
            self.stats.invalidations += 1;
        }

        !result.needs_invalidate
    }

    /// Flush every line still dirty (`Modified`) to `memory`, clearing dirty
    /// and counting a writeback each. Called once the machine has gone
    /// idle, so the final values a report or test reads via a direct memory
    /// peek reflect the last writer instead of a stale pre-write value that
    /// never left an unflushed `Modified` line.
    pub fn flush_modified(&mut self, memory: &mut MainMemory) -> SimResult<()> {
        for set_idx in 0..self.sets.len() {
            for way in 0..NUM_WAYS {
                let line = self.sets[set_idx].ways[way];
                if line.valid && line.dirty {
                    let block_addr = self.block_address_of(set_idx, line.tag);
                    memory.write_block(block_addr, &line.data)?;
                    self.sets[set_idx].ways[way].dirty = false;
                    self.stats.writebacks += 1;
                }
            }
        }
        Ok(())
    }
}

fn read_word(block: &[u8; BLOCK_SIZE], offset: usize) -> u64 {
    let mut bytes = [0u8; WORD_SIZE];
    bytes.copy_from_slice(&block[offset..offset + WORD_SIZE]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn write_word(block: &mut [u8; BLOCK_SIZE], offset: usize, value: u64) {
    block[offset..offset + WORD_SIZE].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Interconnect;
    use crate::main_memory::MainMemory;

    fn fresh(ic: &Interconnect) {
        ic.register(Cache::new(0, WritePolicy::WriteBackAllocate));
    }

    #[test]
    fn read_miss_on_empty_cache_goes_exclusive() {
        let ic = Interconnect::new(1, MainMemory::new());
        fresh(&ic);
        let (word, hit) = ic.cache_read(0, ByteAddress(0)).unwrap();
        assert!(!hit);
        assert_eq!(word, 0);
        let stats = ic.cache_stats(0);
        assert_eq!(stats.read_misses, 1);
        assert_eq!(stats.mesi_transitions, 1);
    }

    #[test]
    fn write_allocate_produces_dirty_modified_line() {
        let ic = Interconnect::new(1, MainMemory::new());
        fresh(&ic);
        let addr = ByteAddress::compose(Decomposed {
            tag: 0,
            index: 0,
            offset: 0,
        });
        let hit = ic.cache_write(0, addr, 0xDEADBEEF).unwrap();
        assert!(!hit);
        let (word, hit2) = ic.cache_read(0, addr).unwrap();
        assert!(hit2);
        assert_eq!(word, 0xDEADBEEF);
    }

    #[test]
    fn lru_eviction_on_third_conflicting_access() {
        let ic = Interconnect::new(1, MainMemory::new());
        fresh(&ic);
        // Three addresses that all map to set 0 via distinct tags.
        let a0 = ByteAddress::compose(Decomposed { tag: 0, index: 0, offset: 0 });
        let a1 = ByteAddress::compose(Decomposed { tag: 1, index: 0, offset: 0 });
        let a2 = ByteAddress::compose(Decomposed { tag: 2, index: 0, offset: 0 });

        ic.cache_read(0, a0).unwrap();
        ic.cache_read(0, a1).unwrap();
        // a0 is now LRU and gets evicted by this third distinct tag.
        ic.cache_read(0, a2).unwrap();
        let (_, hit) = ic.cache_read(0, a0).unwrap();
        assert!(!hit, "a0 should have been evicted");
    }

    #[test]
    fn snoop_on_tag_miss_is_noop() {
        let mut cache = Cache::new(0, WritePolicy::WriteBackAllocate);
        let mut mem = MainMemory::new();
        let held = cache.snoop(ByteAddress(0), BusEvent::BusRead, &mut mem);
        assert!(!held);
        let stats = cache.stats();
        assert_eq!(stats.invalidations, 0);
        assert_eq!(stats.writebacks, 0);
    }

    #[test]
    fn flush_modified_writes_dirty_lines_and_clears_dirty() {
        let ic = Interconnect::new(1, MainMemory::new());
        fresh(&ic);
        let addr = ByteAddress::compose(Decomposed { tag: 0, index: 0, offset: 0 });
        ic.cache_write(0, addr, 0xC0FFEE).unwrap();
        assert_eq!(ic.peek_word(0).unwrap(), 0);

        ic.flush_all_modified().unwrap();
        assert_eq!(ic.peek_word(0).unwrap(), 0xC0FFEE);
        assert_eq!(ic.cache_stats(0).writebacks, 1);
    }
}
