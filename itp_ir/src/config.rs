//! Engine configuration
//!
//! The recognized option flags, collected into one serde-friendly struct that
//! the interpreter constructs once and hands to the engine. Nothing here is a
//! process-wide global.

use serde::{Deserialize, Serialize};

/// Configuration for the interpolation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpConfig {
    /// Master switch for interpolation
    #[serde(default = "default_true")]
    pub interpolation_enabled: bool,

    /// Emit a dot graph of the search tree on shutdown
    #[serde(default)]
    pub output_tree: bool,

    /// Verbosity of subsumption reasons and messages (0..=4)
    #[serde(default)]
    pub debug_subsumption: u8,

    /// Skip shadowing (existential quantification) at entry construction
    #[serde(default)]
    pub no_existential: bool,

    /// Skip pointer-bound slackening entirely
    #[serde(default)]
    pub no_bound_interpolation: bool,

    /// Restrict slackening to accesses inside the named wrapper function
    #[serde(default)]
    pub special_function_bound_interpolation: Option<String>,

    /// Use exact address equalities instead of bound-based interpolants
    #[serde(default)]
    pub exact_address_interpolant: bool,

    /// Record per-phase timers
    #[serde(default)]
    pub time_statistics: bool,

    /// Synthesize weakest-precondition interpolants on node removal
    #[serde(default)]
    pub wp_interpolant: bool,

    /// Per-query solver timeout in milliseconds
    #[serde(default = "default_solver_timeout_ms")]
    pub solver_timeout_ms: u64,
}

const fn default_true() -> bool {
    true
}

const fn default_solver_timeout_ms() -> u64 {
    10_000
}

impl Default for InterpConfig {
    fn default() -> Self {
        Self {
            interpolation_enabled: true,
            output_tree: false,
            debug_subsumption: 0,
            no_existential: false,
            no_bound_interpolation: false,
            special_function_bound_interpolation: None,
            exact_address_interpolant: false,
            time_statistics: false,
            wp_interpolant: false,
            solver_timeout_ms: default_solver_timeout_ms(),
        }
    }
}
