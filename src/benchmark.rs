//! Synthetic cache access-pattern sweeps: sequential/random/thread-unique/
//! shared/false-sharing phases, run across all PEs' caches concurrently and
//! synchronized phase-by-phase so the phases are actually comparable to
//! each other. Not required for coherence correctness; carried because the
//! teacher repo treats this as a first-class part of the binary and a
//! complete rendition of this system does too.

use std::sync::{Arc, Barrier};
use std::thread;

use chrono::Utc;
use log::info;
use rand::Rng;

use crate::bus::Interconnect;
use crate::cache::{Cache, WritePolicy};
use crate::geometry::{ByteAddress, BLOCK_SIZE, MEMORY_WORDS, NUM_SETS, NUM_WAYS, WORD_SIZE};
use crate::main_memory::MainMemory;

/// Words held by one cache at full occupancy; used to size the
/// thread-unique, shared, and false-sharing chunks.
const CACHE_CAPACITY_WORDS: usize = NUM_SETS * NUM_WAYS * (BLOCK_SIZE / WORD_SIZE);

fn synchronize_phase(
    pe_id: usize,
    interconnect: &Interconnect,
    barrier: &Barrier,
    timer: &mut chrono::DateTime<Utc>,
    phase_name: &str,
) {
    barrier.wait();
    let now = Utc::now();
    let stats = interconnect.cache_stats(pe_id);
    let accesses = stats.read_hits + stats.read_misses + stats.write_hits + stats.write_misses;
    let misses = stats.read_misses + stats.write_misses;
    let miss_percent = if accesses == 0 {
        0.0
    } else {
        100.0 * misses as f64 / accesses as f64
    };
    info!(
        "pe{} {}: {} ms, {:.3}% miss",
        pe_id,
        phase_name,
        (now - *timer).num_milliseconds(),
        miss_percent
    );
    *timer = now;
    barrier.wait();
}

fn run_phases(pe_id: usize, interconnect: Arc<Interconnect>, barrier: Arc<Barrier>) {
    let mut timer = Utc::now();
    let mut rng = rand::thread_rng();

    for i in 0..MEMORY_WORDS {
        let _ = interconnect.cache_read(pe_id, ByteAddress::of_word(i));
    }
    synchronize_phase(pe_id, &interconnect, &barrier, &mut timer, "sequential read");

    for i in 0..MEMORY_WORDS {
        let _ = interconnect.cache_write(pe_id, ByteAddress::of_word(i), pe_id as u64);
    }
    synchronize_phase(pe_id, &interconnect, &barrier, &mut timer, "sequential write");

    for _ in 0..MEMORY_WORDS {
        let addr = rng.gen_range(0..MEMORY_WORDS);
        let _ = interconnect.cache_read(pe_id, ByteAddress::of_word(addr));
    }
    synchronize_phase(pe_id, &interconnect, &barrier, &mut timer, "random read");

    for _ in 0..MEMORY_WORDS {
        let addr = rng.gen_range(0..MEMORY_WORDS);
        let _ = interconnect.cache_write(pe_id, ByteAddress::of_word(addr), pe_id as u64);
    }
    synchronize_phase(pe_id, &interconnect, &barrier, &mut timer, "random write");

    let unique_offset = pe_id * CACHE_CAPACITY_WORDS;
    for i in 0..MEMORY_WORDS {
        let addr = unique_offset + (i % CACHE_CAPACITY_WORDS);
        let _ = interconnect.cache_read(pe_id, ByteAddress::of_word(addr));
    }
    synchronize_phase(pe_id, &interconnect, &barrier, &mut timer, "thread-unique chunk read");

    for i in 0..MEMORY_WORDS {
        let addr = unique_offset + (i % CACHE_CAPACITY_WORDS);
        let _ = interconnect.cache_write(pe_id, ByteAddress::of_word(addr), pe_id as u64);
    }
    synchronize_phase(pe_id, &interconnect, &barrier, &mut timer, "thread-unique chunk write");

    for i in 0..MEMORY_WORDS {
        let addr = i % CACHE_CAPACITY_WORDS;
        let _ = interconnect.cache_read(pe_id, ByteAddress::of_word(addr));
    }
    synchronize_phase(pe_id, &interconnect, &barrier, &mut timer, "shared chunk read");

    for i in 0..MEMORY_WORDS {
        let addr = i % CACHE_CAPACITY_WORDS;
        let _ = interconnect.cache_write(pe_id, ByteAddress::of_word(addr), pe_id as u64);
    }
    synchronize_phase(pe_id, &interconnect, &barrier, &mut timer, "shared chunk write");

    for i in 0..MEMORY_WORDS {
        let addr = (i * (pe_id + 1)) % CACHE_CAPACITY_WORDS;
        let _ = interconnect.cache_write(pe_id, ByteAddress::of_word(addr), pe_id as u64);
    }
    synchronize_phase(pe_id, &interconnect, &barrier, &mut timer, "false-sharing chunk write");
}

/// Run the synthetic access-pattern sweep across `num_pes` caches sharing
/// one interconnect and main memory, reporting timing and miss rate per
/// phase per PE via the `log` facade.
pub fn run_benchmark(num_pes: usize) {
    let interconnect = Arc::new(Interconnect::new(num_pes, MainMemory::new()));
    let barrier = Arc::new(Barrier::new(num_pes));

    for pe_id in 0..num_pes {
        interconnect.register(Cache::new(pe_id, WritePolicy::WriteBackAllocate));
    }

    let handles: Vec<_> = (0..num_pes)
        .map(|pe_id| {
            let interconnect = interconnect.clone();
            let barrier = barrier.clone();
            thread::spawn(move || run_phases(pe_id, interconnect, barrier))
        })
        .collect();

    for handle in handles {
        handle.join().expect("benchmark thread panicked");
    }
}
