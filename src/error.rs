//! Error taxonomy for the simulator.

use thiserror::Error;

/// Errors that can surface from the memory subsystem, the loader, or the PE
/// execution engine.
#[derive(Error, Debug)]
pub enum SimError {
    /// An address, word index, or PE id fell outside its declared range.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// The assembled program is malformed: unknown opcode, unresolved label,
    /// bad operand, or a runtime fault such as division by zero.
    #[error("program error: {0}")]
    ProgramError(String),

    /// Reading an input file (program source or vector file) failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The workload configuration is inconsistent (e.g. mismatched vector
    /// lengths, or a vector too large to fit in memory).
    #[error("config error: {0}")]
    ConfigError(String),
}

/// Convenience alias used throughout the memory subsystem and loader.
pub type SimResult<T> = Result<T, SimError>;
