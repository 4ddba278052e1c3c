//! Memory-location model
//!
//! A memory location pairs an allocation site (plus the call history that
//! reached it) with a base address, an offset from that base, and the
//! allocation size. Two orderings matter:
//!
//! - the *full* compare, which includes the allocation id and indexes store
//!   frames, and
//! - the *weak* compare, which ignores the allocation id so that allocations
//!   of the same site in different loop iterations collide when states are
//!   compared for subsumption.

use crate::instr::{CallHistory, InstrId, ValueDescRef, ValueId};
use itp_ir::expr::{Expr, ExprRef};
use itp_ir::BinOp;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::rc::Rc;

/// Shared handle to a memory location.
pub type LocationRef = Rc<MemoryLocation>;

/// An allocation site plus the call history under which it was reached.
#[derive(Debug, Clone)]
pub struct AllocationContext {
    pub site: ValueId,
    /// Name of the site value, kept for rendering and WP variable naming
    pub site_name: String,
    /// Whether the site is a global variable
    pub site_global: bool,
    pub call_history: CallHistory,
}

impl AllocationContext {
    #[must_use]
    pub fn new(site: &ValueDescRef, call_history: CallHistory) -> Self {
        Self {
            site: site.id,
            site_name: site.name.clone(),
            site_global: site.is_global(),
            call_history,
        }
    }

    /// Whether this context's call history is a prefix of `current`.
    ///
    /// Gates the visibility of a location across stack frames.
    #[must_use]
    pub fn is_prefix_of(&self, current: &[InstrId]) -> bool {
        self.call_history.len() <= current.len()
            && current[..self.call_history.len()] == self.call_history[..]
    }
}

impl PartialEq for AllocationContext {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AllocationContext {}

impl PartialOrd for AllocationContext {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AllocationContext {
    fn cmp(&self, other: &Self) -> Ordering {
        // site_name and site_global are presentation/routing only
        (self.site, &self.call_history).cmp(&(other.site, &other.call_history))
    }
}

/// A pointer into an allocation: base address, offset, size, and the id of
/// the concrete allocation event.
#[derive(Debug)]
pub struct MemoryLocation {
    pub context: AllocationContext,
    pub base: ExprRef,
    pub offset: ExprRef,
    pub size: u64,
    /// Distinguishes allocations of the same site across loop iterations
    pub allocation_id: u64,
    /// Offset bounds proven safe by passed memory checks (slackening)
    bounds: RefCell<BTreeSet<ExprRef>>,
    /// Cleared when an offset cannot be recomputed, disabling bound use
    bound_interpolation_usable: Cell<bool>,
}

impl MemoryLocation {
    /// A fresh location at the base of an allocation.
    #[must_use]
    pub fn create(
        site: &ValueDescRef,
        call_history: CallHistory,
        address: ExprRef,
        size: u64,
        allocation_id: u64,
    ) -> LocationRef {
        let zero = Expr::constant(0, address.width());
        Rc::new(Self {
            context: AllocationContext::new(site, call_history),
            base: address,
            offset: zero,
            size,
            allocation_id,
            bounds: RefCell::new(BTreeSet::new()),
            bound_interpolation_usable: Cell::new(true),
        })
    }

    /// A location within the same allocation, displaced by `offset_delta`.
    #[must_use]
    pub fn with_offset(parent: &LocationRef, offset_delta: ExprRef) -> LocationRef {
        let offset = Expr::binary(BinOp::Add, Rc::clone(&parent.offset), offset_delta);
        Rc::new(Self {
            context: parent.context.clone(),
            base: Rc::clone(&parent.base),
            offset,
            size: parent.size,
            allocation_id: parent.allocation_id,
            bounds: RefCell::new(parent.bounds.borrow().clone()),
            bound_interpolation_usable: Cell::new(parent.bound_interpolation_usable.get()),
        })
    }

    /// A location within the same allocation whose offset is recomputed
    /// from an absolute address (`offset = address - base`).
    ///
    /// Used when a pointer reappears from an integer: the displacement is
    /// whatever the address arithmetic produced.
    #[must_use]
    pub fn re_based(parent: &LocationRef, address: ExprRef) -> LocationRef {
        let offset = Expr::binary(BinOp::Sub, address, Rc::clone(&parent.base));
        Rc::new(Self {
            context: parent.context.clone(),
            base: Rc::clone(&parent.base),
            offset,
            size: parent.size,
            allocation_id: parent.allocation_id,
            bounds: RefCell::new(parent.bounds.borrow().clone()),
            bound_interpolation_usable: Cell::new(parent.bound_interpolation_usable.get()),
        })
    }

    /// A copy of this location with base and offset rewritten to shadow
    /// arrays, for storage in a subsumption-table entry.
    #[must_use]
    pub fn shadowed(
        loc: &LocationRef,
        shadow: &itp_ir::ShadowRegistry,
        replacements: &mut Vec<itp_ir::ArrayRef>,
    ) -> LocationRef {
        Rc::new(Self {
            context: loc.context.clone(),
            base: shadow.shadow_expr(&loc.base, replacements),
            offset: shadow.shadow_expr(&loc.offset, replacements),
            size: loc.size,
            allocation_id: loc.allocation_id,
            bounds: RefCell::new(loc.bounds.borrow().clone()),
            bound_interpolation_usable: Cell::new(loc.bound_interpolation_usable.get()),
        })
    }

    /// Whether both base and offset are concrete.
    #[must_use]
    pub fn has_constant_address(&self) -> bool {
        self.base.is_const() && self.offset.is_const()
    }

    /// Globals live in the global frame, regardless of call history.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.context.site_global
    }

    /// The absolute address expression, `base + offset`.
    #[must_use]
    pub fn address(&self) -> ExprRef {
        Expr::binary(BinOp::Add, Rc::clone(&self.base), Rc::clone(&self.offset))
    }

    /// Full ordering: `(site, context, base, offset, allocation_id)`.
    #[must_use]
    pub fn full_cmp(&self, other: &Self) -> Ordering {
        self.context
            .cmp(&other.context)
            .then_with(|| self.base.cmp(&other.base))
            .then_with(|| self.offset.cmp(&other.offset))
            .then_with(|| self.allocation_id.cmp(&other.allocation_id))
    }

    /// Weak ordering: the full ordering minus the allocation id.
    #[must_use]
    pub fn weak_cmp(&self, other: &Self) -> Ordering {
        self.context
            .cmp(&other.context)
            .then_with(|| self.base.cmp(&other.base))
            .then_with(|| self.offset.cmp(&other.offset))
    }

    /// Record the tightest bound under which a passed memory check proved
    /// this location safe, collecting it into `out` as well.
    ///
    /// A passed check on an in-bounds access establishes the allocation size
    /// as a safe offset bound; any later state whose offset stays under it
    /// is equally safe. Returns false when no usable bound exists (unsized
    /// allocation), in which case the caller falls back to exact addresses.
    pub fn adjust_offset_bound(&self, out: &mut BTreeSet<ExprRef>) -> bool {
        if self.size == 0 {
            self.bound_interpolation_usable.set(false);
            return false;
        }
        let bound = Expr::constant(self.size, self.offset.width());
        self.bounds.borrow_mut().insert(Rc::clone(&bound));
        out.insert(bound);
        true
    }

    /// The proven-safe offset bounds recorded so far.
    #[must_use]
    pub fn bounds(&self) -> BTreeSet<ExprRef> {
        self.bounds.borrow().clone()
    }

    /// Whether bound-based interpolation may be used for this location.
    #[must_use]
    pub fn bound_interpolation_usable(&self) -> bool {
        self.bound_interpolation_usable.get()
    }

    pub fn disable_bound_interpolation(&self) {
        self.bound_interpolation_usable.set(false);
    }
}

impl PartialEq for MemoryLocation {
    fn eq(&self, other: &Self) -> bool {
        self.full_cmp(other) == Ordering::Equal
    }
}

impl Eq for MemoryLocation {}

impl PartialOrd for MemoryLocation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.full_cmp(other))
    }
}

impl Ord for MemoryLocation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.full_cmp(other)
    }
}

impl std::fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{}[base={},offset={},size={}]",
            self.context.site_name, self.allocation_id, self.base, self.offset, self.size
        )
    }
}

/// A location keyed for the subsumption table: ordering is the weak compare,
/// so the same site from different loop iterations lands on one key.
#[derive(Debug, Clone)]
pub struct StoredAddress(pub LocationRef);

impl StoredAddress {
    #[must_use]
    pub fn new(loc: LocationRef) -> Self {
        Self(loc)
    }
}

impl PartialEq for StoredAddress {
    fn eq(&self, other: &Self) -> bool {
        self.0.weak_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for StoredAddress {}

impl PartialOrd for StoredAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.0.weak_cmp(&other.0))
    }
}

impl Ord for StoredAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.weak_cmp(&other.0)
    }
}
