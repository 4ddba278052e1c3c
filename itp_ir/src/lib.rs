//! Symbolic expression IR for the interpolation engine
//!
//! This crate holds everything the interpolation core shares with its
//! collaborators: the bitvector expression algebra, the shadow-array
//! machinery used to existentially quantify table entries, the solver-oracle
//! trait, the error taxonomy, and the recognized configuration flags.
//!
//! The IR is designed to be:
//! - Immutable and cheaply shared (`Rc` handles, structural equality)
//! - Constant-folding at construction, so consumers can branch on
//!   `is_true`/`is_false`
//! - Serializable, so table snapshots and configs can be persisted

pub mod config;
pub mod error;
pub mod expr;
pub mod shadow;
pub mod solver;

pub use config::InterpConfig;
pub use error::{EngineError, Result};
pub use expr::{
    collect_arrays, rebuild_binary, simplify_not, substitute, substitute_array, Array, ArrayRef,
    BinOp, CmpOp, Expr, ExprRef, UpdateList, BOOL_WIDTH,
};
pub use shadow::{ArrayCache, ShadowRegistry};
pub use solver::{Query, SatResult, SolverBackend, TrivialSolver, Validity};
