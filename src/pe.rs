//! The processing element: fetch-decode-execute loop over the instruction
//! set in `instruction.rs`, talking to its private cache through a thin
//! word-index-to-byte-address port adapter.

use std::sync::Arc;

use log::{info, trace};

use crate::bus::Interconnect;
use crate::clock::{Clock, StepAction};
use crate::error::{SimError, SimResult};
use crate::geometry::ByteAddress;
use crate::instruction::{Instruction, OpCode};

/// Number of general-purpose registers per PE.
pub const NUM_REGISTERS: usize = 16;

/// Safety cap on executed instructions, guarding against runaway programs
/// (e.g. a mis-assembled infinite loop). Mirrors the original simulator's
/// `max_instructions` guard.
pub const MAX_INSTRUCTIONS: u64 = 1_000_000;

/// Adapts a PE's word-indexed loads/stores to the interconnect's
/// byte-addressed, pe-id-scoped cache interface. Holds no cache state of
/// its own; `pe_id` selects which registered cache the interconnect
/// services.
pub struct CachePort {
    interconnect: Arc<Interconnect>,
    pe_id: usize,
}

impl CachePort {
    /// Wrap an interconnect handle and this PE's id as a port.
    pub fn new(interconnect: Arc<Interconnect>, pe_id: usize) -> CachePort {
        CachePort { interconnect, pe_id }
    }

    /// Load the word at `word_index`.
    pub fn load(&self, word_index: u64) -> SimResult<u64> {
        let addr = ByteAddress::of_word(word_index as usize);
        let (word, _hit) = self.interconnect.cache_read(self.pe_id, addr)?;
        Ok(word)
    }

    /// Store `value` to the word at `word_index`.
    pub fn store(&self, word_index: u64, value: u64) -> SimResult<()> {
        let addr = ByteAddress::of_word(word_index as usize);
        self.interconnect.cache_write(self.pe_id, addr, value)?;
        Ok(())
    }
}

/// Execution statistics for one PE, reported at the end of a run.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeStats {
    /// Total instructions executed.
    pub instructions: u64,
    /// Loads executed.
    pub loads: u64,
    /// Stores executed.
    pub stores: u64,
    /// Simulated cycles consumed.
    pub cycles: u64,
}

/// A single processing element: its registers, program, and port to its
/// private cache.
pub struct Pe {
    id: usize,
    regs: [u64; NUM_REGISTERS],
    program: Vec<Instruction>,
    port: CachePort,
    stats: PeStats,
    clock: Option<Arc<Clock>>,
}

fn to_f64(bits: u64) -> f64 {
    f64::from_bits(bits)
}

fn from_f64(value: f64) -> u64 {
    value.to_bits()
}

impl Pe {
    /// Create a PE with the given id, program, and interconnect handle. The
    /// PE's cache must already be registered with `interconnect` under this
    /// same `id`.
    pub fn new(id: usize, program: Vec<Instruction>, interconnect: Arc<Interconnect>) -> Pe {
        Pe {
            id,
            regs: [0u64; NUM_REGISTERS],
            program,
            port: CachePort::new(interconnect, id),
            stats: PeStats::default(),
            clock: None,
        }
    }

    /// Gate this PE's per-instruction progress on a shared [`Clock`]. In
    /// stepping mode this pauses the PE before every instruction until the
    /// user advances or quits.
    pub fn with_clock(mut self, clock: Arc<Clock>) -> Pe {
        self.clock = Some(clock);
        self
    }

    /// This PE's execution statistics so far.
    pub fn stats(&self) -> PeStats {
        self.stats
    }

    /// This PE's id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// A read-only view of this PE's registers, for tests and final
    /// reporting.
    pub fn registers(&self) -> &[u64; NUM_REGISTERS] {
        &self.regs
    }

    fn reg(&self, index: i64) -> SimResult<u64> {
        let idx = usize::try_from(index).map_err(|_| {
            SimError::ProgramError(format!("pe{}: negative register index {}", self.id, index))
        })?;
        self.regs.get(idx).copied().ok_or_else(|| {
            SimError::ProgramError(format!("pe{}: register index {} out of range", self.id, idx))
        })
    }

    fn reg_mut(&mut self, index: i64) -> SimResult<&mut u64> {
        let idx = usize::try_from(index).map_err(|_| {
            SimError::ProgramError(format!("pe{}: negative register index {}", self.id, index))
        })?;
        self.regs.get_mut(idx).ok_or_else(|| {
            SimError::ProgramError(format!("pe{}: register index {} out of range", self.id, idx))
        })
    }

    /// Resolve an operand that may be a register (`reg >= 0`) or fall back
    /// to an immediate.
    fn operand(&self, reg: i64, imm: i64) -> SimResult<u64> {
        if reg >= 0 {
            self.reg(reg)
        } else {
            Ok(imm as u64)
        }
    }

    /// Run this PE's program to completion (or until `MAX_INSTRUCTIONS` is
    /// reached, at which point it is treated as a program error — a
    /// well-formed program for this simulator always halts by running off
    /// the end of its instruction list).
    pub fn run_to_completion(&mut self) -> SimResult<()> {
        let mut pc: usize = 0;
        let mut executed: u64 = 0;

        while pc < self.program.len() {
            if executed >= MAX_INSTRUCTIONS {
                return Err(SimError::ProgramError(format!(
                    "pe{}: exceeded {} instructions without halting",
                    self.id, MAX_INSTRUCTIONS
                )));
            }
            if let Some(clock) = &self.clock {
                if clock.tick() == StepAction::Quit {
                    info!("pe{}: stepping aborted by user at pc={}", self.id, pc);
                    return Ok(());
                }
            }
            let inst = self.program[pc];
            trace!("pe{} pc={} executing {:?}", self.id, pc, inst);
            pc = self.execute(inst, pc)?;
            self.stats.instructions += 1;
            executed += 1;
        }

        info!(
            "pe{} finished after {} instructions ({} loads, {} stores, {} cycles)",
            self.id, self.stats.instructions, self.stats.loads, self.stats.stores, self.stats.cycles
        );
        Ok(())
    }

    fn execute(&mut self, inst: Instruction, pc: usize) -> SimResult<usize> {
        match inst.op {
            OpCode::Nop => {
                self.stats.cycles += 1;
                Ok(pc + 1)
            }
            OpCode::Load => {
                let addr = self.operand(inst.ra, inst.imm)?;
                let value = self.port.load(addr)?;
                *self.reg_mut(inst.rd)? = value;
                self.stats.loads += 1;
                self.stats.cycles += 1;
                Ok(pc + 1)
            }
            OpCode::Store => {
                let addr = self.operand(inst.rb, inst.imm)?;
                let value = self.reg(inst.ra)?;
                self.port.store(addr, value)?;
                self.stats.stores += 1;
                self.stats.cycles += 1;
                Ok(pc + 1)
            }
            OpCode::FMul => {
                let a = to_f64(self.reg(inst.ra)?);
                let b = to_f64(self.reg(inst.rb)?);
                *self.reg_mut(inst.rd)? = from_f64(a * b);
                self.stats.cycles += 1;
                Ok(pc + 1)
            }
            OpCode::FAdd => {
                let a = to_f64(self.reg(inst.ra)?);
                let b = to_f64(self.reg(inst.rb)?);
                *self.reg_mut(inst.rd)? = from_f64(a + b);
                self.stats.cycles += 1;
                Ok(pc + 1)
            }
            OpCode::Div => {
                let a = self.reg(inst.ra)? as i64;
                let b = self.operand(inst.rb, inst.imm)? as i64;
                if b == 0 {
                    return Err(SimError::ProgramError(format!(
                        "pe{}: division by zero at pc={}",
                        self.id, pc
                    )));
                }
                *self.reg_mut(inst.rd)? = (a / b) as u64;
                self.stats.cycles += 10;
                Ok(pc + 1)
            }
            OpCode::Mul => {
                let a = self.reg(inst.ra)?;
                let b = self.operand(inst.rb, inst.imm)?;
                *self.reg_mut(inst.rd)? = a.wrapping_mul(b);
                self.stats.cycles += 5;
                Ok(pc + 1)
            }
            OpCode::Move => {
                let value = self.operand(inst.ra, inst.imm)?;
                *self.reg_mut(inst.rd)? = value;
                self.stats.cycles += 1;
                Ok(pc + 1)
            }
            OpCode::Add => {
                let a = self.reg(inst.ra)?;
                let b = self.operand(inst.rb, inst.imm)?;
                *self.reg_mut(inst.rd)? = a.wrapping_add(b);
                self.stats.cycles += 1;
                Ok(pc + 1)
            }
            OpCode::Cmp => {
                let a = self.reg(inst.ra)? as i64;
                let b = self.operand(inst.rb, inst.imm)? as i64;
                self.regs[0] = if a < b {
                    1
                } else if a == b {
                    0
                } else {
                    2
                };
                self.stats.cycles += 1;
                Ok(pc + 1)
            }
            OpCode::Jl => {
                self.stats.cycles += 1;
                if self.regs[0] == 1 {
                    Ok(inst.imm as usize)
                } else {
                    Ok(pc + 1)
                }
            }
            OpCode::Jle => {
                self.stats.cycles += 1;
                if self.regs[0] == 1 || self.regs[0] == 0 {
                    Ok(inst.imm as usize)
                } else {
                    Ok(pc + 1)
                }
            }
            OpCode::Inc => {
                let slot = self.reg_mut(inst.rd)?;
                *slot = ((*slot as i64).wrapping_add(1)) as u64;
                self.stats.cycles += 1;
                Ok(pc + 1)
            }
            OpCode::Dec => {
                let slot = self.reg_mut(inst.rd)?;
                *slot = ((*slot as i64).wrapping_sub(1)) as u64;
                self.stats.cycles += 1;
                Ok(pc + 1)
            }
            OpCode::Jnz => {
                self.stats.cycles += 1;
                if self.regs[0] != 0 {
                    Ok(inst.imm as usize)
                } else {
                    Ok(pc + 1)
                }
            }
        }
    }
}
