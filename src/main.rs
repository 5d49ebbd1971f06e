//! `mesi-sim`: a cycle-level simulator of a small shared-memory
//! multiprocessor — four PEs, private write-back caches kept coherent by a
//! snooping MESI protocol, round-robin bus arbitration, one main memory.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

pub mod benchmark;
pub mod bus;
pub mod cache;
pub mod clock;
pub mod error;
pub mod geometry;
pub mod instruction;
pub mod loader;
pub mod lru;
pub mod main_memory;
pub mod mesi;
pub mod pe;
pub mod vectors;
pub mod workload;

use bus::Interconnect;
use cache::{Cache, WritePolicy};
use clock::Clock;
use main_memory::MainMemory;
use pe::Pe;

/// Number of processing elements in the simulated machine.
pub const NUM_PES: usize = 4;

#[derive(Parser)]
#[command(name = "mesi-sim", about = "A snooping-MESI multiprocessor simulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the parallel dot-product workload over two vector files, split
    /// across all PEs.
    DotProduct {
        /// Path to vector A (one number per line).
        a: PathBuf,
        /// Path to vector B (one number per line).
        b: PathBuf,
        /// Step one instruction at a time, pausing for Enter ('q' to quit).
        #[arg(short = 's', long)]
        step: bool,
    },
    /// Run the same assembly program on every PE.
    Program {
        /// Path to an assembly source file.
        file: PathBuf,
        /// Step one instruction at a time, pausing for Enter ('q' to quit).
        #[arg(short = 's', long)]
        step: bool,
    },
    /// Run the synthetic cache access-pattern benchmark.
    Bench {
        /// Number of simulated PEs / caches.
        #[arg(long, default_value_t = NUM_PES)]
        pes: usize,
    },
}

fn build_pes(
    programs: Vec<Vec<instruction::Instruction>>,
    interconnect: &Arc<Interconnect>,
    step: bool,
) -> Vec<Pe> {
    let clock = if step { Some(Arc::new(Clock::new(true))) } else { None };

    programs
        .into_iter()
        .enumerate()
        .map(|(pe_id, program)| {
            interconnect.register(Cache::new(pe_id, WritePolicy::WriteBackAllocate));
            let pe = Pe::new(pe_id, program, interconnect.clone());
            match &clock {
                Some(clock) => pe.with_clock(clock.clone()),
                None => pe,
            }
        })
        .collect()
}

fn run_pes(pes: Vec<Pe>) -> Result<Vec<Pe>> {
    let handles: Vec<_> = pes
        .into_iter()
        .map(|mut pe| thread::spawn(move || -> Result<Pe, error::SimError> { pe.run_to_completion().map(|_| pe) }))
        .collect();

    let mut finished = Vec::with_capacity(handles.len());
    for handle in handles {
        let pe = handle
            .join()
            .expect("PE thread panicked")
            .context("PE execution failed")?;
        finished.push(pe);
    }
    Ok(finished)
}

fn report_stats(pes: &[Pe]) {
    for pe in pes {
        let stats = pe.stats();
        info!(
            "pe{}: {} instructions, {} loads, {} stores, {} cycles",
            pe.id(),
            stats.instructions,
            stats.loads,
            stats.stores,
            stats.cycles
        );
    }
}

fn run_dot_product(a: PathBuf, b: PathBuf, step: bool) -> Result<()> {
    let vector_a = vectors::load_vector_file(&a).context("reading vector A")?;
    let vector_b = vectors::load_vector_file(&b).context("reading vector B")?;

    let interconnect = Arc::new(Interconnect::new(NUM_PES, MainMemory::new()));
    let n = vectors::install_vectors(&interconnect, &vector_a, &vector_b)?;
    let result_base = 2 * n + 1;

    let programs = workload::build_dot_product_programs(n, NUM_PES, 1, n + 1, result_base)?;
    let pes = build_pes(programs, &interconnect, step);
    let finished = run_pes(pes)?;

    interconnect.run_until_idle()?;
    interconnect.flush_all_modified()?;
    report_stats(&finished);

    let mut total = 0.0f64;
    for pe_id in 0..NUM_PES {
        let bits = interconnect.peek_word(result_base + pe_id)?;
        let partial = f64::from_bits(bits);
        println!("pe{} partial sum: {}", pe_id, partial);
        total += partial;
    }
    println!("dot product: {}", total);

    Ok(())
}

fn run_program(file: PathBuf, step: bool) -> Result<()> {
    let source = std::fs::read_to_string(&file).context("reading program file")?;
    let program = loader::assemble(&source).context("assembling program")?;

    let interconnect = Arc::new(Interconnect::new(NUM_PES, MainMemory::new()));
    let programs = vec![program; NUM_PES];
    let pes = build_pes(programs, &interconnect, step);
    let finished = run_pes(pes)?;

    interconnect.run_until_idle()?;
    interconnect.flush_all_modified()?;
    report_stats(&finished);

    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::DotProduct { a, b, step } => run_dot_product(a, b, step),
        Command::Program { file, step } => run_program(file, step),
        Command::Bench { pes } => {
            benchmark::run_benchmark(pes);
            Ok(())
        }
    };

    if let Err(err) = &result {
        log::error!("{:?}", err);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    /// End-to-end: four PEs, four real threads, one shared interconnect,
    /// computing a dot product neither PE could get right alone if the
    /// coherence protocol let a stale partial sum slip through.
    #[test]
    fn parallel_dot_product_matches_sequential_reference() {
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let b = vec![7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0];
        let expected: f64 = a.iter().zip(&b).map(|(x, y)| x * y).sum();

        let interconnect = Arc::new(Interconnect::new(NUM_PES, MainMemory::new()));
        let n = vectors::install_vectors(&interconnect, &a, &b).unwrap();
        let result_base = 2 * n + 1;

        let programs = workload::build_dot_product_programs(n, NUM_PES, 1, n + 1, result_base).unwrap();
        let pes = build_pes(programs, &interconnect, false);
        let finished = run_pes(pes).unwrap();
        assert_eq!(finished.len(), NUM_PES);

        interconnect.run_until_idle().unwrap();
        interconnect.flush_all_modified().unwrap();

        let mut total = 0.0f64;
        for pe_id in 0..NUM_PES {
            let bits = interconnect.peek_word(result_base + pe_id).unwrap();
            total += f64::from_bits(bits);
        }
        assert!((total - expected).abs() < 1e-9, "got {}, expected {}", total, expected);
    }
}
