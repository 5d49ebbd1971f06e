//! The PE instruction set: a small fixed-width ISA covering integer and
//! floating point arithmetic, memory access, and branching.

/// One opcode in the instruction set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    /// No operation.
    Nop,
    /// Load a word from memory into a register.
    Load,
    /// Store a register's word to memory.
    Store,
    /// Multiply two registers as IEEE-754 doubles (bit reinterpretation).
    FMul,
    /// Add two registers as IEEE-754 doubles (bit reinterpretation).
    FAdd,
    /// Increment a register (signed).
    Inc,
    /// Decrement a register (signed).
    Dec,
    /// Jump if the condition register is non-zero.
    Jnz,
    /// Signed integer division; traps on division by zero.
    Div,
    /// Unsigned (wrapping) integer multiplication.
    Mul,
    /// Move a register or immediate into a register.
    Move,
    /// Unsigned (wrapping) integer addition.
    Add,
    /// Signed comparison, result (0 eq / 1 less / 2 greater) into reg 0.
    Cmp,
    /// Jump if the last `Cmp` found "less than".
    Jl,
    /// Jump if the last `Cmp` found "less than or equal".
    Jle,
}

/// One decoded instruction. Operand fields that aren't used by a given
/// opcode are `-1` (for register fields) or `0` (for `imm`), matching the
/// original assembler's convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    /// The opcode.
    pub op: OpCode,
    /// Destination register index, or -1.
    pub rd: i64,
    /// First source register index, or -1 (then `imm` supplies the value).
    pub ra: i64,
    /// Second source register index, or -1 (then `imm` supplies the value).
    pub rb: i64,
    /// Immediate operand: a literal value, or a jump target instruction
    /// index for `Jnz`/`Jl`/`Jle`.
    pub imm: i64,
}

impl Instruction {
    /// Construct an instruction with all operand fields explicit.
    pub fn new(op: OpCode, rd: i64, ra: i64, rb: i64, imm: i64) -> Instruction {
        Instruction { op, rd, ra, rb, imm }
    }
}
