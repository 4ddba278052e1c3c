//! Error types for the interpolation engine

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced to the interpreter.
///
/// Solver timeouts and unknown answers are deliberately *not* here: the
/// subsumption check treats them as a failed (not-subsumed) outcome and
/// counts them, per the failure-counting the statistics report exposes.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Instruction dispatch hit an opcode/arity pair outside the transition table
    #[error("unhandled opcode {opcode} with {arity} argument(s)")]
    UnhandledOpcode { opcode: String, arity: usize },

    /// An expression visitor hit a node kind its caller should have normalized
    #[error("unhandled expression kind: {0}")]
    UnhandledKind(String),

    /// An expected versioned value was absent and no recovery rule applied
    #[error("operand not found for instruction {instr} (operand {operand})")]
    OperandNotFound { instr: u64, operand: usize },

    /// Store-frame lookup disagreed with the call history
    #[error("store frame not found for location context {context}")]
    ContextMismatch { context: String },

    /// A feature the pass does not implement (e.g. floating-point predicates)
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Writing the rendered search graph failed
    #[error("render I/O error: {0}")]
    RenderIo(#[from] std::io::Error),
}
