//! Versioned values
//!
//! A versioned value is one dynamic incarnation of a static program value:
//! symbolic execution may pass through the same instruction many times, and
//! each pass gets a fresh version. Identity is the sequentially issued
//! version id, never structural equality.
//!
//! Values carry the shadow state the dependency tracker accumulates: pointer
//! locations, labelled flow edges back to the values they were computed
//! from, the addresses they were loaded from or stored to, and the `core`
//! bit that marks participation in an interpolant.

use crate::instr::{ValueDescRef, ValueId};
use crate::memory::LocationRef;
use itp_ir::expr::ExprRef;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

/// Shared handle to a versioned value.
pub type VersionedValueRef = Rc<VersionedValue>;

/// A flow edge: where a value came from, and through which location (if the
/// flow went through memory).
#[derive(Debug, Clone)]
pub struct FlowSource {
    pub value: VersionedValueRef,
    pub via: Option<LocationRef>,
}

/// One dynamic incarnation of a program value.
#[derive(Debug)]
pub struct VersionedValue {
    value: ValueDescRef,
    version: u64,
    expr: ExprRef,
    locations: RefCell<Vec<LocationRef>>,
    /// Keyed by source version id, so re-adding an edge is idempotent
    sources: RefCell<BTreeMap<u64, FlowSource>>,
    load_address: RefCell<Option<VersionedValueRef>>,
    store_address: RefCell<Option<VersionedValueRef>>,
    core: Cell<bool>,
    reasons: RefCell<BTreeSet<String>>,
    bound_interpolation_usable: Cell<bool>,
}

impl VersionedValue {
    #[must_use]
    pub fn new(value: ValueDescRef, version: u64, expr: ExprRef) -> VersionedValueRef {
        Rc::new(Self {
            value,
            version,
            expr,
            locations: RefCell::new(vec![]),
            sources: RefCell::new(BTreeMap::new()),
            load_address: RefCell::new(None),
            store_address: RefCell::new(None),
            core: Cell::new(false),
            reasons: RefCell::new(BTreeSet::new()),
            bound_interpolation_usable: Cell::new(true),
        })
    }

    #[must_use]
    pub fn program_value(&self) -> &ValueDescRef {
        &self.value
    }

    #[must_use]
    pub fn value_id(&self) -> ValueId {
        self.value.id
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn expr(&self) -> ExprRef {
        Rc::clone(&self.expr)
    }

    // ----- locations -----

    pub fn add_location(&self, loc: LocationRef) {
        self.locations.borrow_mut().push(loc);
    }

    #[must_use]
    pub fn locations(&self) -> Vec<LocationRef> {
        self.locations.borrow().clone()
    }

    /// A value is a pointer when it carries at least one location.
    #[must_use]
    pub fn is_pointer(&self) -> bool {
        !self.locations.borrow().is_empty()
    }

    // ----- flow edges -----

    /// Add a plain flow edge from `source`.
    pub fn add_source(&self, source: &VersionedValueRef) {
        self.sources.borrow_mut().insert(
            source.version,
            FlowSource {
                value: Rc::clone(source),
                via: None,
            },
        );
    }

    /// Add a flow edge from `source` that went through memory at `via`.
    pub fn add_source_via(&self, source: &VersionedValueRef, via: LocationRef) {
        self.sources.borrow_mut().insert(
            source.version,
            FlowSource {
                value: Rc::clone(source),
                via: Some(via),
            },
        );
    }

    #[must_use]
    pub fn sources(&self) -> Vec<FlowSource> {
        self.sources.borrow().values().cloned().collect()
    }

    // ----- load/store addresses -----

    pub fn set_load_address(&self, address: &VersionedValueRef) {
        *self.load_address.borrow_mut() = Some(Rc::clone(address));
    }

    pub fn set_store_address(&self, address: &VersionedValueRef) {
        *self.store_address.borrow_mut() = Some(Rc::clone(address));
    }

    #[must_use]
    pub fn load_address(&self) -> Option<VersionedValueRef> {
        self.load_address.borrow().clone()
    }

    #[must_use]
    pub fn store_address(&self) -> Option<VersionedValueRef> {
        self.store_address.borrow().clone()
    }

    // ----- core marking -----

    /// Mark this value as needed by the interpolant, with a reason.
    pub fn mark_core(&self, reason: &str) {
        self.core.set(true);
        if !reason.is_empty() {
            self.reasons.borrow_mut().insert(reason.to_string());
        }
    }

    #[must_use]
    pub fn is_core(&self) -> bool {
        self.core.get()
    }

    #[must_use]
    pub fn reasons(&self) -> BTreeSet<String> {
        self.reasons.borrow().clone()
    }

    // ----- bound interpolation -----

    #[must_use]
    pub fn bound_interpolation_usable(&self) -> bool {
        self.bound_interpolation_usable.get()
            && self
                .locations
                .borrow()
                .iter()
                .all(|l| l.bound_interpolation_usable())
    }

    pub fn disable_bound_interpolation(&self) {
        self.bound_interpolation_usable.set(false);
    }
}

impl std::fmt::Display for VersionedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "V")?;
        if self.is_core() {
            write!(f, "(I)")?;
        }
        write!(f, "[{}:{}]#{}", self.value.name, self.expr, self.version)
    }
}

/// Collect the transitive flow closure of `value`: every source reachable
/// through flow edges, plus load/store address values, plus `value` itself.
///
/// De-duplication is by version id, so shared upstream values appear once.
#[must_use]
pub fn flow_closure(value: &VersionedValueRef) -> Vec<VersionedValueRef> {
    let mut seen = BTreeSet::new();
    let mut out = vec![];
    let mut worklist = vec![Rc::clone(value)];
    while let Some(v) = worklist.pop() {
        if !seen.insert(v.version) {
            continue;
        }
        for src in v.sources() {
            worklist.push(src.value);
        }
        if let Some(addr) = v.load_address() {
            worklist.push(addr);
        }
        if let Some(addr) = v.store_address() {
            worklist.push(addr);
        }
        out.push(v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::{TypeDesc, ValueDesc, ValueKind};
    use crate::memory::MemoryLocation;
    use itp_ir::expr::Expr;

    fn desc(id: u64, name: &str) -> ValueDescRef {
        Rc::new(ValueDesc {
            id: ValueId(id),
            name: name.to_string(),
            kind: ValueKind::Instruction,
            ty: TypeDesc::Int { bits: 32 },
        })
    }

    #[test]
    fn test_identity_is_version() {
        let d = desc(1, "x");
        let v1 = VersionedValue::new(Rc::clone(&d), 0, Expr::constant(1, 32));
        let v2 = VersionedValue::new(d, 1, Expr::constant(1, 32));
        assert_eq!(v1.value_id(), v2.value_id());
        assert_ne!(v1.version(), v2.version());
    }

    #[test]
    fn test_pointer_iff_has_locations() {
        let d = desc(1, "p");
        let v = VersionedValue::new(Rc::clone(&d), 0, Expr::constant(0x1000, 64));
        assert!(!v.is_pointer());
        v.add_location(MemoryLocation::create(
            &d,
            vec![],
            Expr::constant(0x1000, 64),
            4,
            1,
        ));
        assert!(v.is_pointer());
    }

    #[test]
    fn test_source_edges_idempotent() {
        let v = VersionedValue::new(desc(1, "x"), 0, Expr::constant(1, 32));
        let s = VersionedValue::new(desc(2, "y"), 1, Expr::constant(2, 32));
        v.add_source(&s);
        v.add_source(&s);
        assert_eq!(v.sources().len(), 1);
    }

    #[test]
    fn test_mark_core_accumulates_reasons() {
        let v = VersionedValue::new(desc(1, "x"), 0, Expr::constant(1, 32));
        assert!(!v.is_core());
        v.mark_core("branch condition");
        v.mark_core("memory bound");
        assert!(v.is_core());
        assert_eq!(v.reasons().len(), 2);
    }

    #[test]
    fn test_flow_closure_transitive_and_deduped() {
        let a = VersionedValue::new(desc(1, "a"), 0, Expr::constant(1, 32));
        let b = VersionedValue::new(desc(2, "b"), 1, Expr::constant(2, 32));
        let c = VersionedValue::new(desc(3, "c"), 2, Expr::constant(3, 32));
        // diamond: c <- a, c <- b, b <- a
        b.add_source(&a);
        c.add_source(&a);
        c.add_source(&b);
        let closure = flow_closure(&c);
        assert_eq!(closure.len(), 3);
    }

    #[test]
    fn test_flow_closure_includes_addresses() {
        let v = VersionedValue::new(desc(1, "x"), 0, Expr::constant(1, 32));
        let addr = VersionedValue::new(desc(2, "p"), 1, Expr::constant(0x1000, 64));
        v.set_load_address(&addr);
        let closure = flow_closure(&v);
        assert_eq!(closure.len(), 2);
    }
}
