//! Errors raised while analyzing cache behavior.
//!
//! [`ChmcError`] is what library entry points return; the binary decides which of them end the
//! run. [`ResolveError`] never escapes the address resolver: each one is degraded into the
//! pessimistic "unknown address" reference for the instruction that produced it.

use thiserror::Error;

/// Failures that stop (part of) an analysis run.
#[derive(Error, Debug)]
pub enum ChmcError {
    /// Invalid cache geometry; reported before any analysis starts.
    #[error("invalid cache configuration for {level}: {reason}")]
    Configuration { level: String, reason: String },

    /// A required input (program, procedure, cache level) was not provided.
    #[error("missing required input: {0}")]
    MissingInput(String),

    /// The exported program listing could not be understood.
    #[error("malformed program export at line {line}: {reason}")]
    MalformedExport { line: usize, reason: String },

    /// Requested statistics ranges fall outside the analyzed procedures.
    #[error("statistics request out of range: {0}")]
    OutOfRangeStatistics(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not set up logging: {0}")]
    Logger(String),
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, ChmcError>;

/// Why the backward walk could not produce an address for a load/store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The walk ran out of predecessors while registers were still pending.
    #[error("address registers {0:?} left unresolved")]
    Unresolved(Vec<String>),

    /// The node-visit ceiling was exceeded.
    #[error("backtracking budget of {0} nodes exhausted")]
    BudgetExhausted(usize),

    /// An operand could not be read as a number.
    #[error("malformed immediate `{0}`")]
    MalformedImmediate(String),

    /// The address depends on an operation the tracker cannot express as base + offset.
    #[error("address computation `{0}` cannot be tracked")]
    NonLinear(String),

    /// The address is relative to a stack pointer whose height is not known.
    #[error("stack pointer height is not known")]
    UnknownStackHeight,

    /// The address was computed but lies in no known data segment.
    #[error("address {0:#x} lies in no known data segment")]
    OutsideSegments(i128),
}
