//! Subsumption table
//!
//! When a fully-explored tree node dies, its interpolant and the core-marked
//! fragment of its store are packaged into a table entry, indexed by program
//! point. A later state reaching the same point is *subsumed* when the
//! entry's interpolant, conjoined with equalities tying the entry's store
//! snapshot to the state's, is valid under the state's constraints.
//!
//! Free arrays of the entry were renamed to shadow copies at construction;
//! the check existentially quantifies them and first tries to discharge the
//! query by substitution before involving the solver.

use crate::alloc_graph::AllocationGraph;
use crate::memory::{AllocationContext, StoredAddress};
use crate::tree::MarkerMap;
use crate::value::VersionedValueRef;
use itp_ir::expr::{BinOp, CmpOp, Expr, ExprRef};
use itp_ir::{
    rebuild_binary, simplify_not, substitute, ArrayRef, EngineError, Query, Result,
    ShadowRegistry, SolverBackend, Validity,
};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::instr::ValueId;

/// Concretely-addressed store snapshot: context → (weak address → value).
pub type ConcreteStoreSnapshot = BTreeMap<AllocationContext, BTreeMap<StoredAddress, StoredValue>>;

/// Symbolically-addressed store snapshot: context → [(address, value)].
pub type SymbolicStoreSnapshot = BTreeMap<AllocationContext, Vec<(StoredAddress, StoredValue)>>;

/// A processed value ready for storage in (or comparison against) a table
/// entry: the expression plus, for pointers, the per-site offset bounds and
/// offsets used by bound-based subsumption.
#[derive(Debug, Clone)]
pub struct StoredValue {
    expr: ExprRef,
    allocation_bounds: BTreeMap<ValueId, BTreeSet<ExprRef>>,
    allocation_offsets: BTreeMap<ValueId, BTreeSet<ExprRef>>,
    use_bound: bool,
    core_reasons: BTreeSet<String>,
}

impl StoredValue {
    fn build(
        value: &VersionedValueRef,
        shadow: Option<(&ShadowRegistry, &mut Vec<ArrayRef>)>,
    ) -> Self {
        let mut allocation_bounds: BTreeMap<ValueId, BTreeSet<ExprRef>> = BTreeMap::new();
        let mut allocation_offsets: BTreeMap<ValueId, BTreeSet<ExprRef>> = BTreeMap::new();
        for loc in value.locations() {
            let site = loc.context.site;
            allocation_bounds
                .entry(site)
                .or_default()
                .extend(loc.bounds());
            allocation_offsets
                .entry(site)
                .or_default()
                .insert(Rc::clone(&loc.offset));
        }
        let expr = match shadow {
            Some((registry, replacements)) => registry.shadow_expr(&value.expr(), replacements),
            None => value.expr(),
        };
        Self {
            expr,
            use_bound: value.bound_interpolation_usable() && !allocation_bounds.is_empty(),
            allocation_bounds,
            allocation_offsets,
            core_reasons: value.reasons(),
        }
    }

    /// Snapshot a value as-is (state side of a check).
    #[must_use]
    pub fn plain(value: &VersionedValueRef) -> Self {
        Self::build(value, None)
    }

    /// Snapshot a value with its expression rewritten to shadow arrays
    /// (entry side; the arrays land in `replacements`).
    #[must_use]
    pub fn shadowed(
        value: &VersionedValueRef,
        registry: &ShadowRegistry,
        replacements: &mut Vec<ArrayRef>,
    ) -> Self {
        Self::build(value, Some((registry, replacements)))
    }

    #[must_use]
    pub fn expr(&self) -> ExprRef {
        Rc::clone(&self.expr)
    }

    #[must_use]
    pub fn is_pointer(&self) -> bool {
        !self.allocation_bounds.is_empty() || !self.allocation_offsets.is_empty()
    }

    #[must_use]
    pub fn use_bound(&self) -> bool {
        self.use_bound
    }

    #[must_use]
    pub fn core_reasons(&self) -> &BTreeSet<String> {
        &self.core_reasons
    }

    /// The bounds check `offset <u bound` for every state offset against
    /// every bound this entry value proved safe, conjoined. Constant-false
    /// when no allocation site is shared; the caller then falls back to
    /// exact address equalities.
    #[must_use]
    pub fn bounds_check(&self, state: &Self, collected: &mut BTreeSet<ExprRef>) -> ExprRef {
        let mut acc: Option<ExprRef> = None;
        let mut matched = false;
        for (site, bounds) in &self.allocation_bounds {
            let Some(offsets) = state.allocation_offsets.get(site) else {
                continue;
            };
            matched = true;
            for bound in bounds {
                collected.insert(Rc::clone(bound));
                for offset in offsets {
                    let check = Expr::cmp(
                        CmpOp::Ult,
                        Expr::zext(Rc::clone(offset), bound.width()),
                        Rc::clone(bound),
                    );
                    acc = Expr::and_opt(acc, check);
                }
            }
        }
        match (matched, acc) {
            (true, Some(e)) => e,
            _ => Expr::false_(),
        }
    }
}

/// One subsumption-table entry.
#[derive(Debug)]
pub struct TableEntry {
    program_point: u64,
    interpolant: Option<ExprRef>,
    concrete_store: ConcreteStoreSnapshot,
    symbolic_store: SymbolicStoreSnapshot,
    existentials: Vec<ArrayRef>,
    wp_interpolant: Option<ExprRef>,
}

/// Outcome of one entry check, with the solver traffic it generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub subsumed: bool,
    pub solver_calls: u64,
    pub solver_failures: u64,
}

impl CheckResult {
    const fn miss(solver_calls: u64, solver_failures: u64) -> Self {
        Self {
            subsumed: false,
            solver_calls,
            solver_failures,
        }
    }

    const fn hit(solver_calls: u64) -> Self {
        Self {
            subsumed: true,
            solver_calls,
            solver_failures: 0,
        }
    }
}

/// The state side of a check, assembled by the tree from the current node.
pub struct StateSnapshot<'a> {
    pub program_point: u64,
    pub concrete: &'a ConcreteStoreSnapshot,
    pub symbolic: &'a SymbolicStoreSnapshot,
    pub constraints: &'a [ExprRef],
    pub markers: &'a MarkerMap,
}

impl TableEntry {
    #[must_use]
    pub fn new(
        program_point: u64,
        interpolant: Option<ExprRef>,
        concrete_store: ConcreteStoreSnapshot,
        symbolic_store: SymbolicStoreSnapshot,
        existentials: Vec<ArrayRef>,
    ) -> Self {
        Self {
            program_point,
            interpolant,
            concrete_store,
            symbolic_store,
            existentials,
            wp_interpolant: None,
        }
    }

    #[must_use]
    pub fn program_point(&self) -> u64 {
        self.program_point
    }

    #[must_use]
    pub fn interpolant(&self) -> Option<ExprRef> {
        self.interpolant.clone()
    }

    pub fn set_interpolant(&mut self, interpolant: Option<ExprRef>) {
        self.interpolant = interpolant;
    }

    #[must_use]
    pub fn concrete_store(&self) -> &ConcreteStoreSnapshot {
        &self.concrete_store
    }

    #[must_use]
    pub fn concrete_store_mut(&mut self) -> &mut ConcreteStoreSnapshot {
        &mut self.concrete_store
    }

    #[must_use]
    pub fn symbolic_store(&self) -> &SymbolicStoreSnapshot {
        &self.symbolic_store
    }

    #[must_use]
    pub fn existentials(&self) -> &[ArrayRef] {
        &self.existentials
    }

    pub fn set_existentials(&mut self, existentials: Vec<ArrayRef>) {
        self.existentials = existentials;
    }

    #[must_use]
    pub fn wp_interpolant(&self) -> Option<ExprRef> {
        self.wp_interpolant.clone()
    }

    pub fn set_wp_interpolant(&mut self, wp: Option<ExprRef>) {
        self.wp_interpolant = wp;
    }

    /// An empty entry subsumes every state at its program point.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interpolant.is_none()
            && self.concrete_store.is_empty()
            && self.symbolic_store.is_empty()
    }

    /// Build the state-equality constraint tying this entry's snapshot to
    /// the state's. `None` means some keyed allocation is unconstrained in
    /// the state, which fails the check outright.
    fn state_equality(&self, state: &StateSnapshot<'_>, exact_address: bool) -> Option<Option<ExprRef>> {
        let mut acc: Option<ExprRef> = None;

        for (context, entries) in &self.concrete_store {
            let state_entries = state.concrete.get(context)?;
            for (address, entry_value) in entries {
                let state_value = state_entries.get(address)?;
                let conjunct = if entry_value.is_pointer()
                    && entry_value.use_bound()
                    && !exact_address
                {
                    let mut collected = BTreeSet::new();
                    let check = entry_value.bounds_check(state_value, &mut collected);
                    if check.is_false() {
                        Expr::eq(entry_value.expr(), state_value.expr())
                    } else {
                        check
                    }
                } else {
                    Expr::eq(entry_value.expr(), state_value.expr())
                };
                acc = Expr::and_opt(acc, conjunct);
            }
        }

        for (context, entries) in &self.symbolic_store {
            let state_entries = state.symbolic.get(context)?;
            if state_entries.is_empty() {
                return None;
            }
            for (_, entry_value) in entries {
                let mut disjuncts: Option<ExprRef> = None;
                for (_, state_value) in state_entries {
                    let eq = Expr::eq(entry_value.expr(), state_value.expr());
                    disjuncts = Some(match disjuncts {
                        Some(d) => Expr::or(eq, d),
                        None => eq,
                    });
                }
                if let Some(d) = disjuncts {
                    acc = Expr::and_opt(acc, d);
                }
            }
        }

        Some(acc)
    }

    /// The subsumption check for one entry.
    pub fn subsumed(
        &self,
        solver: &mut dyn SolverBackend,
        state: &StateSnapshot<'_>,
        timeout: Duration,
        exact_address: bool,
    ) -> CheckResult {
        // Program-point guard.
        if state.program_point != self.program_point {
            return CheckResult::miss(0, 0);
        }

        // An empty entry subsumes everything here.
        if self.is_empty() {
            return CheckResult::hit(0);
        }

        let Some(state_equality) = self.state_equality(state, exact_address) else {
            // The state does not constrain some keyed allocation.
            return CheckResult::miss(0, 0);
        };

        // query = interpolant ∧ state equality, simplified when a side is
        // missing; both missing means everything is subsumed.
        let mut query = match (self.interpolant.clone(), state_equality) {
            (Some(i), Some(eq)) => Expr::and(i, eq),
            (Some(i), None) => i,
            (None, Some(eq)) => eq,
            (None, None) => return CheckResult::hit(0),
        };

        let quantified = !self.existentials.is_empty();
        if quantified {
            let exists = Expr::exists(self.existentials.clone(), query);
            query = match simplify_exists(&exists) {
                Ok(simplified) => simplified,
                Err(err) => {
                    warn!(error = %err, "existential simplification failed; keeping query");
                    exists
                }
            };
        }

        if query.is_true() {
            return CheckResult::hit(0);
        }
        if query.is_const() {
            return CheckResult::miss(0, 0);
        }

        debug!(point = self.program_point, query = %query, "subsumption solver query");

        let q = Query::new(state.constraints.to_vec(), Rc::clone(&query));
        let result = if quantified && matches!(query.as_ref(), Expr::Exists { .. }) {
            // Quantified queries bypass pre-solving; a dedicated solver
            // activation scoped to this check.
            solver.compute_validity(&q, timeout)
        } else {
            solver.evaluate(&q, timeout)
        };

        match result {
            Validity::Valid => {
                let core = solver.unsat_core();
                self.mark_unsat_core_constraints(state, &core);
                CheckResult::hit(1)
            }
            Validity::Invalid | Validity::Unknown => CheckResult::miss(1, 1),
        }
    }

    /// Flag the markers named by the unsat core, then include every flagged
    /// constraint in the interpolant (which marks its condition's flow as
    /// core).
    fn mark_unsat_core_constraints(&self, state: &StateSnapshot<'_>, core: &[ExprRef]) {
        for constraint in core {
            match state.markers.get(constraint) {
                Some(marker) => marker.may_include_in_interpolant(),
                // Constraints can be missing from the path condition when
                // states were merged upstream.
                None => warn!(
                    constraint = %constraint,
                    "unsat-core constraint not on path condition; \
                     state merge may have dropped it"
                ),
            }
        }
        let mut graph = AllocationGraph::new();
        for marker in state.markers.values() {
            marker.include_in_interpolant(&mut graph);
        }
    }
}

impl std::fmt::Display for TableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "program point = {}", self.program_point)?;
        match &self.interpolant {
            Some(i) => writeln!(f, "interpolant = {i}")?,
            None => writeln!(f, "interpolant = (empty)")?,
        }
        if !self.concrete_store.is_empty() {
            write!(f, "concrete allocations = [")?;
            for (i, (context, entries)) in self.concrete_store.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}:", context.site_name)?;
                for (j, value) in entries.values().enumerate() {
                    if j > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", value.expr())?;
                }
            }
            writeln!(f, "]")?;
        }
        if !self.existentials.is_empty() {
            let names: Vec<&str> = self.existentials.iter().map(|a| a.name.as_str()).collect();
            writeln!(f, "existentials = [{}]", names.join(", "))?;
        }
        if let Some(wp) = &self.wp_interpolant {
            writeln!(f, "wp = {wp}")?;
        }
        Ok(())
    }
}

/// The subsumption table: entries bucketed by program point, insertion order
/// preserved within a bucket.
#[derive(Debug, Default)]
pub struct SubsumptionTable {
    entries: BTreeMap<u64, Vec<TableEntry>>,
    count: usize,
}

impl SubsumptionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: TableEntry) {
        self.entries
            .entry(entry.program_point())
            .or_default()
            .push(entry);
        self.count += 1;
    }

    #[must_use]
    pub fn entries_at(&self, program_point: u64) -> &[TableEntry] {
        self.entries
            .get(&program_point)
            .map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableEntry> {
        self.entries.values().flatten()
    }
}

// ----- existential simplification -----

/// Whether any read in `expr` goes through one of `arrays`.
#[must_use]
pub fn has_existentials(arrays: &[ArrayRef], expr: &ExprRef) -> bool {
    let mut found = BTreeSet::new();
    itp_ir::collect_arrays(expr, &mut found);
    found.iter().any(|a| arrays.iter().any(|b| b.id == a.id))
}

/// Whether `needle` occurs as a subterm of `haystack`.
#[must_use]
pub fn contains_subexpr(haystack: &ExprRef, needle: &ExprRef) -> bool {
    if haystack == needle {
        return true;
    }
    match haystack.as_ref() {
        Expr::Const { .. } => false,
        Expr::Read { index, .. } => contains_subexpr(index, needle),
        Expr::Concat { msb, lsb } => {
            contains_subexpr(msb, needle) || contains_subexpr(lsb, needle)
        }
        Expr::Extract { expr, .. }
        | Expr::ZExt { expr, .. }
        | Expr::SExt { expr, .. }
        | Expr::Not(expr) => contains_subexpr(expr, needle),
        Expr::Select {
            cond,
            true_expr,
            false_expr,
        } => {
            contains_subexpr(cond, needle)
                || contains_subexpr(true_expr, needle)
                || contains_subexpr(false_expr, needle)
        }
        Expr::Binary { left, right, .. } | Expr::Cmp { left, right, .. } => {
            contains_subexpr(left, needle) || contains_subexpr(right, needle)
        }
        Expr::Exists { body, .. } => contains_subexpr(body, needle),
    }
}

/// Collect the atoms of the interpolant side, normalizing negated
/// comparisons along the way.
fn simplify_interpolant(pack: &mut Vec<ExprRef>, expr: &ExprRef) -> ExprRef {
    if let Expr::Binary {
        op: BinOp::And,
        left,
        right,
    } = expr.as_ref()
    {
        let l = simplify_interpolant(pack, left);
        let r = simplify_interpolant(pack, right);
        return Expr::and(l, r);
    }
    let normalized = simplify_not(Rc::clone(expr));
    if !normalized.is_const() && !pack.contains(&normalized) {
        pack.push(Rc::clone(&normalized));
    }
    normalized
}

/// Reduce the equality conjunction: constant atoms fold away, equalities are
/// collected into `pack` for substitution, disjunctions are simplified but
/// contribute no atoms.
fn simplify_equality(pack: &mut Vec<ExprRef>, expr: &ExprRef) -> Result<ExprRef> {
    match expr.as_ref() {
        Expr::Const { .. } => Ok(Rc::clone(expr)),
        Expr::Cmp { op, .. } => {
            if *op == CmpOp::Eq && !pack.contains(expr) {
                pack.push(Rc::clone(expr));
            }
            Ok(Rc::clone(expr))
        }
        Expr::Binary {
            op: BinOp::And,
            left,
            right,
        } => {
            let l = simplify_equality(pack, left)?;
            if l.is_false() {
                return Ok(l);
            }
            let r = simplify_equality(pack, right)?;
            if r.is_false() {
                return Ok(r);
            }
            if l.is_true() {
                return Ok(r);
            }
            if r.is_true() {
                return Ok(l);
            }
            Ok(Expr::and(l, r))
        }
        Expr::Binary {
            op: BinOp::Or,
            left,
            right,
        } => {
            // Atoms inside a disjunct must not drive substitution.
            let mut dummy = vec![];
            let l = simplify_equality(&mut dummy, left)?;
            if l.is_true() {
                return Ok(l);
            }
            let r = simplify_equality(&mut dummy, right)?;
            if r.is_true() {
                return Ok(r);
            }
            if l.is_false() {
                return Ok(r);
            }
            if r.is_false() {
                return Ok(l);
            }
            Ok(Expr::or(l, r))
        }
        other => Err(EngineError::UnhandledKind(format!(
            "equality constraint shape: {other}"
        ))),
    }
}

/// Reserved Fourier–Motzkin elimination hook; currently the identity.
fn simplify_with_fourier_motzkin(exists_expr: ExprRef) -> ExprRef {
    exists_expr
}

/// Simplify `exists(V, A ∧ E)`: substitute equalities of `E` into the atoms
/// of `A`, dropping the quantifier entirely when no quantified variable
/// survives.
pub fn simplify_exists(exists_expr: &ExprRef) -> Result<ExprRef> {
    let Expr::Exists { arrays, body } = exists_expr.as_ref() else {
        return Ok(Rc::clone(exists_expr));
    };

    if body.is_const() {
        return Ok(Rc::clone(body));
    }

    // The body is a conjunction of the interpolant (over shadow variables)
    // and the state equality constraints; anything else is left alone.
    let Expr::Binary {
        op: BinOp::And,
        left: interpolant_side,
        right: equality_side,
    } = body.as_ref()
    else {
        return Ok(Rc::clone(exists_expr));
    };

    // A disjunctive equality side is a single clause of a CNF; nothing to
    // substitute from.
    if matches!(
        equality_side.as_ref(),
        Expr::Binary { op: BinOp::Or, .. }
    ) {
        return Ok(Rc::clone(exists_expr));
    }

    let mut equality_pack = vec![];
    let full_equality = simplify_equality(&mut equality_pack, equality_side)?;
    if full_equality.is_false() {
        return Ok(Expr::false_());
    }

    let mut interpolant_pack = vec![];
    let simplified_interpolant = simplify_interpolant(&mut interpolant_pack, interpolant_side);
    if simplified_interpolant.is_const() {
        // Equalities alone decide the query.
        return Ok(full_equality);
    }

    let mut new_interpolant: Option<ExprRef> = None;
    for atom in &interpolant_pack {
        let mut atom = Rc::clone(atom);
        for equality in &equality_pack {
            let Expr::Cmp {
                op: CmpOp::Eq,
                left: eq_left,
                right: eq_right,
            } = equality.as_ref()
            else {
                continue;
            };
            let (Expr::Cmp {
                left: atom_left,
                right: atom_right,
                ..
            }
            | Expr::Binary {
                left: atom_left,
                right: atom_right,
                ..
            }) = atom.as_ref()
            else {
                continue;
            };
            // The shadow variable sits on the equality's left; substitute
            // when the atom's lhs occurs inside it.
            if contains_subexpr(eq_left, atom_left) {
                let new_left = Rc::clone(eq_right);
                let new_right = if matches!(eq_left.as_ref(), Expr::Binary { .. }) {
                    substitute(eq_left, atom_left, atom_right)
                } else {
                    Rc::clone(atom_right)
                };
                if let Some(rebuilt) = rebuild_binary(&atom, new_left, new_right) {
                    atom = rebuilt;
                }
            }
        }
        new_interpolant = Expr::and_opt(new_interpolant, atom);
    }

    let new_body = match new_interpolant {
        Some(ni) => {
            if !has_existentials(arrays, &ni) {
                return Ok(ni);
            }
            Expr::and(ni, full_equality)
        }
        None => Expr::and(simplified_interpolant, full_equality),
    };

    Ok(simplify_with_fourier_motzkin(Expr::exists(
        arrays.clone(),
        new_body,
    )))
}
