//! Solver oracle interface
//!
//! The engine never talks to an SMT solver directly; it goes through the
//! `SolverBackend` trait. A subsumption check issues one of two query forms:
//! a *direct validity* query for existentially quantified formulas, or an
//! *evaluate* query that may consult the state's constraint store (and
//! whatever caching the backend layers on top). Timeouts are advisory: a
//! backend that runs out of time answers `Unknown`, and the check fails
//! safely.

use crate::expr::ExprRef;
use std::time::Duration;

/// Outcome of a validity query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// The query holds under the constraint store
    Valid,
    /// A counterexample exists
    Invalid,
    /// The solver could not decide (includes timeout)
    Unknown,
}

/// Outcome of a satisfiability query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatResult {
    Sat,
    Unsat,
    Unknown,
}

/// A query: prove `expr` under the conjunction of `constraints`.
#[derive(Debug, Clone)]
pub struct Query {
    pub constraints: Vec<ExprRef>,
    pub expr: ExprRef,
}

impl Query {
    #[must_use]
    pub fn new(constraints: Vec<ExprRef>, expr: ExprRef) -> Self {
        Self { constraints, expr }
    }
}

/// The solver oracle the subsumption check drives.
pub trait SolverBackend {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Decide validity directly, without pre-solving optimizations.
    ///
    /// This is the only entry point that must accept quantified queries.
    fn compute_validity(&mut self, query: &Query, timeout: Duration) -> Validity;

    /// Decide validity of an unquantified query; the backend may use
    /// counterexample caches or other pre-solving over the constraint store.
    fn evaluate(&mut self, query: &Query, timeout: Duration) -> Validity {
        self.compute_validity(query, timeout)
    }

    /// The unsat core of the last `Valid` answer: the subset of the
    /// constraint store the solver needed. Backends that do not track cores
    /// return the empty vector.
    fn unsat_core(&self) -> Vec<ExprRef>;
}

/// A backend that decides only constant queries.
///
/// Useful as a default when no external solver is wired up: the existential
/// simplifier discharges many subsumption queries to constants, and
/// everything else conservatively fails the check.
#[derive(Debug, Default)]
pub struct TrivialSolver;

impl SolverBackend for TrivialSolver {
    fn name(&self) -> &'static str {
        "trivial"
    }

    fn compute_validity(&mut self, query: &Query, _timeout: Duration) -> Validity {
        if query.expr.is_true() {
            Validity::Valid
        } else if query.expr.is_false() {
            Validity::Invalid
        } else {
            Validity::Unknown
        }
    }

    fn unsat_core(&self) -> Vec<ExprRef> {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    #[test]
    fn test_trivial_solver_decides_constants() {
        let mut solver = TrivialSolver;
        let timeout = Duration::from_millis(10);
        let valid = Query::new(vec![], Expr::true_());
        assert_eq!(solver.compute_validity(&valid, timeout), Validity::Valid);
        let invalid = Query::new(vec![], Expr::false_());
        assert_eq!(solver.compute_validity(&invalid, timeout), Validity::Invalid);
    }

    #[test]
    fn test_trivial_solver_unknown_on_symbolic() {
        let mut solver = TrivialSolver;
        let cache = crate::shadow::ArrayCache::new();
        let a = cache.create("a", 4);
        let q = Query::new(
            vec![],
            Expr::eq(
                Expr::read(crate::expr::UpdateList::new(a), Expr::constant(0, 32)),
                Expr::constant(1, 8),
            ),
        );
        assert_eq!(
            solver.compute_validity(&q, Duration::from_millis(10)),
            Validity::Unknown
        );
        assert!(solver.unsat_core().is_empty());
    }
}
