//! The interconnect: every cache, main memory, and the bus arbitration state
//! all live behind one `Mutex`. That single lock is what makes the
//! snoop/request interleaving deadlock-free: a cache never holds a lock of
//! its own that the interconnect would need to re-acquire while servicing
//! someone else's request, because caches aren't locked independently at
//! all — they're plain fields of [`InterconnectInner`], reachable only
//! while the interconnect's own lock is held.
//!
//! This rules out the lock-ordering hazard an earlier version of this
//! module had: with each cache behind its own `Mutex` *and* the
//! interconnect behind its own `Mutex`, PE A blocked mid-request waiting on
//! the interconnect lock (held by PE B's in-flight transaction) while PE B's
//! snoop broadcast tried to lock PE A's cache (held by PE A) was a real
//! deadlock between two threads. Folding every cache into
//! `InterconnectInner` removes the second lock entirely.
//!
//! [`Interconnect::cache_read`] and [`Interconnect::cache_write`] are the
//! PE-facing entry points: each holds the single lock for its entire
//! duration, so a hit, a miss's eviction, its snoop broadcast, and its
//! memory fetch are all one atomic step as observed by every other PE.
//!
//! [`Interconnect::submit`]/[`Interconnect::step`]/[`Interconnect::request`]
//! are a lower-level, queue-and-arbitrate primitive kept for testing
//! round-robin fairness directly, independent of any cache.

use std::collections::VecDeque;
use std::sync::Mutex;

use log::{debug, trace};

use crate::cache::{write_word, Cache};
use crate::error::{SimError, SimResult};
use crate::geometry::{ByteAddress, BLOCK_SIZE};
use crate::main_memory::MainMemory;
use crate::mesi::BusEvent;

/// The kind of a bus transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionKind {
    /// Shared read request (miss on a load).
    BusRd,
    /// Exclusive read request (miss on a store, or write-allocate).
    BusRdX,
    /// Upgrade a Shared line to Modified without fetching data.
    BusUpgr,
    /// Write a dirty block back to memory (eviction or write-through flush).
    BusWB,
}

/// A single bus transaction, as recorded in the processed-transaction log.
#[derive(Clone, Debug)]
pub struct BusTransaction {
    /// The kind of transaction.
    pub kind: TransactionKind,
    /// The block-aligned address this transaction concerns.
    pub block_address: ByteAddress,
    /// The id of the PE whose cache submitted this transaction.
    pub pe_id: usize,
    /// Data carried by the transaction: the block written for `BusWB`, or
    /// the fetched block for a serviced `BusRd`/`BusRdX`.
    pub payload: Option<[u8; BLOCK_SIZE]>,
    seq: u64,
}

struct PendingEntry {
    txn: BusTransaction,
}

struct InterconnectInner {
    queues: Vec<VecDeque<PendingEntry>>,
    next_pe: usize,
    memory: MainMemory,
    caches: Vec<Cache>,
    processed: Vec<BusTransaction>,
    next_seq: u64,
}

impl InterconnectInner {
    fn log(&mut self, kind: TransactionKind, block_address: ByteAddress, pe_id: usize, payload: Option<[u8; BLOCK_SIZE]>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.processed.push(BusTransaction {
            kind,
            block_address,
            pe_id,
            payload,
            seq,
        });
    }
}

/// The shared interconnect: round-robin arbitration across registered
/// caches, backed by a single main memory, all behind one lock.
pub struct Interconnect {
    inner: Mutex<InterconnectInner>,
    num_pes: usize,
}

/// Broadcast `event` for `block_address` to every cache but the sender's.
/// Returns whether any peer still held the block afterward (S/E/M) — used
/// by a read miss to tell whether it must install `Shared` rather than the
/// optimistic `Exclusive` `begin_miss` assumed before this broadcast ran.
fn broadcast_snoop_locked(
    inner: &mut InterconnectInner,
    sender_pe: usize,
    block_address: ByteAddress,
    event: BusEvent,
) -> bool {
    let caches = &mut inner.caches;
    let memory = &mut inner.memory;
    let mut peer_holds_block = false;
    for (pe_id, cache) in caches.iter_mut().enumerate() {
        if pe_id == sender_pe {
            continue;
        }
        if cache.snoop(block_address, event, memory) {
            peer_holds_block = true;
        }
    }
    peer_holds_block
}

impl Interconnect {
    /// Create an interconnect for `num_pes` PEs, owning `memory`.
    pub fn new(num_pes: usize, memory: MainMemory) -> Interconnect {
        let mut queues = Vec::with_capacity(num_pes);
        for _ in 0..num_pes {
            queues.push(VecDeque::new());
        }
        Interconnect {
            inner: Mutex::new(InterconnectInner {
                queues,
                next_pe: 0,
                memory,
                caches: Vec::with_capacity(num_pes),
                processed: Vec::new(),
                next_seq: 0,
            }),
            num_pes,
        }
    }

    /// Register a cache with the interconnect. Caches must be registered in
    /// PE-id order, one per PE, before any traffic begins: `cache.pe_id()`
    /// must equal the number of caches already registered.
    pub fn register(&self, cache: Cache) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(cache.pe_id(), inner.caches.len(), "caches must register in pe_id order");
        inner.caches.push(cache);
    }

    /// Service a local read from `pe_id`'s cache at `addr`: hit, or a full
    /// miss (eviction, snoop broadcast, memory fetch, install), all under
    /// one lock acquisition. Returns the word read and whether it was a hit.
    pub fn cache_read(&self, pe_id: usize, addr: ByteAddress) -> SimResult<(u64, bool)> {
        let mut inner = self.inner.lock().unwrap();
        self.check_pe(&inner, pe_id)?;

        if let Some(word) = inner.caches[pe_id].try_read_hit(addr) {
            return Ok((word, true));
        }

        let req = inner.caches[pe_id].begin_miss(addr, BusEvent::LocalRead);
        if let Some((evict_addr, data)) = req.evicted_writeback {
            inner.memory.write_block(evict_addr, &data)?;
            inner.log(TransactionKind::BusWB, evict_addr, pe_id, Some(data));
        }

        let mut fetched = None;
        let mut peer_holds_block = false;
        if req.needs_bus_message {
            peer_holds_block = broadcast_snoop_locked(&mut inner, pe_id, req.block_address, BusEvent::BusRead);
            let block = inner.memory.read_block(req.block_address)?;
            fetched = Some(block);
            inner.log(TransactionKind::BusRd, req.block_address, pe_id, Some(block));
            debug!("bus: BusRd pe{} {:?} serviced from memory", pe_id, req.block_address);
        }

        let word = inner.caches[pe_id].finish_miss(req, fetched, None, peer_holds_block);
        Ok((word, false))
    }

    /// Service a local write from `pe_id`'s cache at `addr`. Returns whether
    /// it was a hit. Handles both `WriteBackAllocate` (the default) and
    /// `WriteThroughNoAllocate` misses, which bypass installing a line
    /// entirely.
    pub fn cache_write(&self, pe_id: usize, addr: ByteAddress, value: u64) -> SimResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        self.check_pe(&inner, pe_id)?;

        if let Some(needs_bus_message) = inner.caches[pe_id].try_write_hit(addr, value) {
            if needs_bus_message {
                let block_addr = addr.block_base();
                let _ = broadcast_snoop_locked(&mut inner, pe_id, block_addr, BusEvent::BusUpgrade);
                inner.log(TransactionKind::BusUpgr, block_addr, pe_id, None);
                debug!("bus: BusUpgr pe{} {:?}", pe_id, block_addr);
            }
            return Ok(true);
        }

        if !inner.caches[pe_id].is_write_allocate() {
            // Write-through, no-write-allocate: fetch-and-invalidate via
            // BusRdX (same snoop effect as a write-allocate miss), patch the
            // one written word, flush straight back without installing a
            // line.
            let block_addr = addr.block_base();
            let _ = broadcast_snoop_locked(&mut inner, pe_id, block_addr, BusEvent::BusReadX);
            let mut data = inner.memory.read_block(block_addr)?;
            inner.log(TransactionKind::BusRdX, block_addr, pe_id, Some(data));
            let offset = addr.decompose().offset;
            write_word(&mut data, offset, value);
            inner.memory.write_block(block_addr, &data)?;
            inner.log(TransactionKind::BusWB, block_addr, pe_id, Some(data));
            return Ok(false);
        }

        let req = inner.caches[pe_id].begin_miss(addr, BusEvent::LocalWrite);
        if let Some((evict_addr, data)) = req.evicted_writeback {
            inner.memory.write_block(evict_addr, &data)?;
            inner.log(TransactionKind::BusWB, evict_addr, pe_id, Some(data));
        }

        let mut fetched = None;
        if req.needs_bus_message {
            let _ = broadcast_snoop_locked(&mut inner, pe_id, req.block_address, BusEvent::BusReadX);
            let block = inner.memory.read_block(req.block_address)?;
            fetched = Some(block);
            inner.log(TransactionKind::BusRdX, req.block_address, pe_id, Some(block));
            debug!("bus: BusRdX pe{} {:?} serviced from memory", pe_id, req.block_address);
        }

        // A write miss always ends Modified (BusReadX invalidates any peer),
        // so whether a peer held the block beforehand doesn't matter here.
        inner.caches[pe_id].finish_miss(req, fetched, Some(value), false);
        Ok(false)
    }

    /// Flush every cache's `Modified` lines to memory. Call once the
    /// interconnect has gone idle (after [`Interconnect::run_until_idle`])
    /// before reading final results directly out of memory: a synchronous
    /// `cache_write` leaves a written line `Modified` in its owning cache,
    /// and nothing else ever flushes it back on its own.
    pub fn flush_all_modified(&self) -> SimResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let InterconnectInner { caches, memory, .. } = &mut *inner;
        for cache in caches.iter_mut() {
            cache.flush_modified(memory)?;
        }
        Ok(())
    }

    /// This PE's cache statistics.
    pub fn cache_stats(&self, pe_id: usize) -> crate::cache::CacheStats {
        self.inner.lock().unwrap().caches[pe_id].stats()
    }

    fn check_pe(&self, inner: &InterconnectInner, pe_id: usize) -> SimResult<()> {
        if pe_id >= inner.queues.len() {
            return Err(SimError::OutOfRange(format!("pe id {} has no queue", pe_id)));
        }
        Ok(())
    }

    /// Enqueue a transaction on the sender's queue without processing
    /// anything. A low-level primitive for testing round-robin arbitration
    /// directly; not used by the cache-driven read/write path.
    pub fn submit(&self, txn: BusTransaction) -> SimResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        Self::enqueue_locked(&mut inner, txn)
    }

    fn enqueue_locked(inner: &mut InterconnectInner, mut txn: BusTransaction) -> SimResult<u64> {
        if txn.pe_id >= inner.queues.len() {
            return Err(SimError::OutOfRange(format!(
                "pe id {} has no queue",
                txn.pe_id
            )));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        txn.seq = seq;
        let pe_id = txn.pe_id;
        inner.queues[pe_id].push_back(PendingEntry { txn });
        Ok(seq)
    }

    /// Process at most one transaction, taken from the next non-empty queue
    /// in round-robin order. Returns whether any work was done.
    pub fn step(&self) -> SimResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        self.step_locked(&mut inner)
    }

    fn step_locked(&self, inner: &mut InterconnectInner) -> SimResult<bool> {
        let start = inner.next_pe;
        let mut chosen = None;
        for offset in 0..self.num_pes {
            let pe = (start + offset) % self.num_pes;
            if !inner.queues[pe].is_empty() {
                chosen = Some(pe);
                break;
            }
        }
        let pe = match chosen {
            Some(pe) => pe,
            None => return Ok(false),
        };

        let entry = inner.queues[pe]
            .pop_front()
            .expect("checked non-empty above");
        inner.next_pe = (pe + 1) % self.num_pes;

        trace!(
            "bus: servicing {:?} from pe{} at {:?}",
            entry.txn.kind,
            entry.txn.pe_id,
            entry.txn.block_address
        );

        let mut txn = entry.txn;
        self.service_locked(inner, &mut txn)?;
        inner.processed.push(txn);

        Ok(true)
    }

    fn service_locked(&self, inner: &mut InterconnectInner, txn: &mut BusTransaction) -> SimResult<()> {
        match txn.kind {
            TransactionKind::BusRd => {
                let _ = broadcast_snoop_locked(inner, txn.pe_id, txn.block_address, BusEvent::BusRead);
                let block = inner.memory.read_block(txn.block_address)?;
                txn.payload = Some(block);
            }
            TransactionKind::BusRdX => {
                let _ = broadcast_snoop_locked(inner, txn.pe_id, txn.block_address, BusEvent::BusReadX);
                let block = inner.memory.read_block(txn.block_address)?;
                txn.payload = Some(block);
            }
            TransactionKind::BusUpgr => {
                let _ = broadcast_snoop_locked(inner, txn.pe_id, txn.block_address, BusEvent::BusUpgrade);
            }
            TransactionKind::BusWB => {
                let data = txn.payload.ok_or_else(|| {
                    SimError::ProgramError("BusWB submitted without payload".into())
                })?;
                inner.memory.write_block(txn.block_address, &data)?;
            }
        }
        Ok(())
    }

    /// Run `step` until every queue is empty.
    pub fn run_until_idle(&self) -> SimResult<()> {
        while self.step()? {}
        Ok(())
    }

    /// Enqueue `txn` and drain the bus (round-robin, same as repeated
    /// `step`) until this transaction has been serviced, returning it with
    /// its payload filled in.
    pub fn request(&self, txn: BusTransaction) -> SimResult<BusTransaction> {
        let mut inner = self.inner.lock().unwrap();
        let seq = Self::enqueue_locked(&mut inner, txn)?;

        loop {
            if let Some(done) = inner.processed.iter().rev().find(|t| t.seq == seq) {
                return Ok(done.clone());
            }
            let progressed = self.step_locked(&mut inner)?;
            if !progressed {
                // Unreachable: we just enqueued our own transaction above.
                return Err(SimError::ProgramError(
                    "interconnect idle while a submitted transaction is unserviced".into(),
                ));
            }
        }
    }

    /// The log of every transaction serviced so far, in service order. This
    /// includes both queue-driven (`submit`/`step`) and direct
    /// (`cache_read`/`cache_write`) traffic.
    pub fn processed_transactions(&self) -> Vec<BusTransaction> {
        self.inner.lock().unwrap().processed.clone()
    }

    /// Write directly to main memory, bypassing arbitration and any cache.
    /// Intended for workload setup (installing a program's input vectors)
    /// before any PE has started running, when there is no concurrent bus
    /// traffic to linearize against.
    pub fn preload_word(&self, word_index: usize, value: u64) -> SimResult<()> {
        self.inner.lock().unwrap().memory.write(word_index, value)
    }

    /// Read directly from main memory, bypassing arbitration and any cache.
    /// Intended for final reporting after all PEs have joined and the bus
    /// is idle.
    pub fn peek_word(&self, word_index: usize) -> SimResult<u64> {
        self.inner.lock().unwrap().memory.read(word_index)
    }

    /// Whether any PE has a pending, unserviced transaction in the
    /// low-level queue (the `cache_read`/`cache_write` path never leaves one
    /// pending, since it services synchronously).
    pub fn has_pending(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.queues.iter().any(|q| !q.is_empty())
    }
}

impl BusTransaction {
    /// Construct a new transaction. `seq` is assigned by the interconnect
    /// on submission and is not meaningful before that.
    pub fn new(
        kind: TransactionKind,
        block_address: ByteAddress,
        pe_id: usize,
        payload: Option<[u8; BLOCK_SIZE]>,
    ) -> BusTransaction {
        BusTransaction {
            kind,
            block_address,
            pe_id,
            payload,
            seq: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_fairness() {
        let ic = Interconnect::new(4, MainMemory::new());
        for pe in 0..4 {
            ic.submit(BusTransaction::new(
                TransactionKind::BusRd,
                ByteAddress(0),
                pe,
                None,
            ))
            .unwrap();
        }
        for expected_pe in 0..4 {
            ic.step().unwrap();
            let processed = ic.processed_transactions();
            assert_eq!(processed.last().unwrap().pe_id, expected_pe);
        }
    }

    #[test]
    fn bus_wb_writes_memory() {
        let ic = Interconnect::new(1, MainMemory::new());
        let mut data = [0u8; BLOCK_SIZE];
        data[0] = 0xAB;
        ic.submit(BusTransaction::new(
            TransactionKind::BusWB,
            ByteAddress(0),
            0,
            Some(data),
        ))
        .unwrap();
        ic.run_until_idle().unwrap();
        let processed = ic.processed_transactions();
        assert_eq!(processed.len(), 1);
    }

    #[test]
    fn submit_with_unknown_pe_errors() {
        let ic = Interconnect::new(2, MainMemory::new());
        let result = ic.submit(BusTransaction::new(
            TransactionKind::BusRd,
            ByteAddress(0),
            5,
            None,
        ));
        assert!(matches!(result, Err(SimError::OutOfRange(_))));
    }

    fn two_caches() -> Interconnect {
        let ic = Interconnect::new(2, MainMemory::new());
        ic.register(Cache::new(0, crate::cache::WritePolicy::WriteBackAllocate));
        ic.register(Cache::new(1, crate::cache::WritePolicy::WriteBackAllocate));
        ic
    }

    #[test]
    fn peer_read_demotes_modified_to_shared_and_sees_written_value() {
        let ic = two_caches();
        ic.cache_write(0, ByteAddress(0), 0x42).unwrap();
        assert_eq!(ic.cache_stats(0).writebacks, 0);

        let (word, hit) = ic.cache_read(1, ByteAddress(0)).unwrap();
        assert!(!hit);
        assert_eq!(word, 0x42, "pe1 must see pe0's write via the snoop-triggered writeback");
        // pe0's line demoted Modified -> Shared, flushing to memory on the way.
        assert_eq!(ic.cache_stats(0).writebacks, 1);
    }

    #[test]
    fn two_peer_reads_both_end_shared_not_exclusive() {
        let ic = two_caches();
        ic.cache_read(0, ByteAddress(0)).unwrap();
        let (_, hit) = ic.cache_read(1, ByteAddress(0)).unwrap();
        assert!(!hit);

        // Both pe0 and pe1 hold the block Shared now. A write from pe1 must
        // invalidate pe0's copy: if pe1 had wrongly installed Exclusive (sole
        // ownership), a local write would be silent and pe0's Shared copy
        // would go stale with no invalidation ever reaching it.
        ic.cache_write(1, ByteAddress(0), 7).unwrap();
        assert_eq!(
            ic.cache_stats(0).invalidations,
            1,
            "pe0's Shared copy must be invalidated by pe1's write"
        );
    }

    #[test]
    fn peer_write_invalidates_the_other_caches_copy() {
        let ic = two_caches();
        ic.cache_read(0, ByteAddress(0)).unwrap();
        ic.cache_write(1, ByteAddress(0), 0x99).unwrap();
        assert_eq!(ic.cache_stats(0).invalidations, 1);

        // pe0 must miss again: its copy was invalidated by pe1's write.
        let (word, hit) = ic.cache_read(0, ByteAddress(0)).unwrap();
        assert!(!hit);
        assert_eq!(word, 0x99);
    }
}
