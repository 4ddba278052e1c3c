//! Store frames
//!
//! Each dependency instance carries one global frame plus a stack of local
//! frames mirroring the call stack. A frame maps memory locations to the
//! `(address value, stored value)` pair last written there, split into a
//! concretely-addressed map and a symbolically-addressed one.
//!
//! Child dependencies do not copy their parent's frames eagerly: a fresh
//! frame keeps a `source` link to the frame it was forked from and reads
//! through it until the first write, which copies both maps and severs the
//! link (copy-on-write).

use crate::instr::InstrId;
use crate::memory::LocationRef;
use crate::value::VersionedValueRef;
use itp_ir::{EngineError, Result};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Shared handle to a store frame.
pub type FrameRef = Rc<StoreFrame>;

/// An `(address value, stored value)` pair.
pub type StoredPair = (VersionedValueRef, VersionedValueRef);

/// One frame of the store.
#[derive(Debug)]
pub struct StoreFrame {
    concrete: RefCell<BTreeMap<LocationRef, StoredPair>>,
    symbolic: RefCell<Vec<(LocationRef, StoredPair)>>,
    /// The call instruction that pushed this frame; `None` for the bottom
    /// frame and the global frame
    callsite: Option<InstrId>,
    /// Depth in the frame stack; the bottom frame has height 0
    height: usize,
    parent: Option<FrameRef>,
    /// Copy-on-write source; cleared on first update
    source: RefCell<Option<FrameRef>>,
}

impl StoreFrame {
    /// The global frame (also used as the bottom stack frame).
    #[must_use]
    pub fn base() -> FrameRef {
        Rc::new(Self {
            concrete: RefCell::new(BTreeMap::new()),
            symbolic: RefCell::new(vec![]),
            callsite: None,
            height: 0,
            parent: None,
            source: RefCell::new(None),
        })
    }

    /// Push a frame for a call.
    #[must_use]
    pub fn push(parent: &FrameRef, callsite: InstrId) -> FrameRef {
        Rc::new(Self {
            concrete: RefCell::new(BTreeMap::new()),
            symbolic: RefCell::new(vec![]),
            callsite: Some(callsite),
            height: parent.height + 1,
            parent: Some(Rc::clone(parent)),
            source: RefCell::new(None),
        })
    }

    /// Fork a frame for a child dependency.
    ///
    /// If the forked frame has itself never been written, the new frame
    /// sources from the same place it does, so reads never chase a chain of
    /// empty frames.
    #[must_use]
    pub fn fork(original: &FrameRef, parent: Option<FrameRef>) -> FrameRef {
        let source = match &*original.source.borrow() {
            Some(src) => Rc::clone(src),
            None => Rc::clone(original),
        };
        Rc::new(Self {
            concrete: RefCell::new(BTreeMap::new()),
            symbolic: RefCell::new(vec![]),
            callsite: original.callsite,
            height: original.height,
            parent,
            source: RefCell::new(Some(source)),
        })
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    #[must_use]
    pub fn callsite(&self) -> Option<InstrId> {
        self.callsite
    }

    /// Locate the frame a location belongs to, walking from this frame down
    /// the parent chain until the frame heights agree with the location's
    /// call history, then checking the topmost callsites match.
    pub fn find_frame(self: &FrameRef, loc: &LocationRef) -> Result<FrameRef> {
        let history = &loc.context.call_history;
        let target_height = history.len();
        if self.height < target_height {
            return Err(EngineError::ContextMismatch {
                context: loc.to_string(),
            });
        }
        let mut current = Rc::clone(self);
        for _ in target_height..self.height {
            let parent = current.parent.clone().ok_or_else(|| {
                EngineError::ContextMismatch {
                    context: loc.to_string(),
                }
            })?;
            current = parent;
        }
        // A full element-wise check would also pass here; matching the top
        // callsite is the invariant the interpreter maintains.
        let matches = match (current.callsite, history.last()) {
            (None, None) => true,
            (Some(cs), Some(top)) => cs == *top,
            _ => false,
        };
        if matches {
            Ok(current)
        } else {
            Err(EngineError::ContextMismatch {
                context: loc.to_string(),
            })
        }
    }

    fn copy_on_write(&self) {
        let source = self.source.borrow_mut().take();
        if let Some(src) = source {
            *self.concrete.borrow_mut() = src.effective_concrete();
            *self.symbolic.borrow_mut() = src.effective_symbolic();
        }
    }

    /// Write `(address, value)` at `loc` in this frame.
    pub fn update(
        &self,
        loc: &LocationRef,
        address: &VersionedValueRef,
        value: &VersionedValueRef,
    ) {
        self.copy_on_write();
        let pair = (Rc::clone(address), Rc::clone(value));
        if loc.has_constant_address() {
            self.concrete.borrow_mut().insert(Rc::clone(loc), pair);
        } else {
            let mut symbolic = self.symbolic.borrow_mut();
            if let Some(slot) = symbolic
                .iter_mut()
                .find(|(l, _)| l.full_cmp(loc) == Ordering::Equal)
            {
                slot.1 = pair;
            } else {
                symbolic.push((Rc::clone(loc), pair));
            }
        }
    }

    /// Read the latest pair stored at `loc` in this frame.
    ///
    /// Symbolic addresses are matched by structural equality of the full
    /// location; adding an if-then-else over the path condition instead is
    /// out of scope.
    #[must_use]
    pub fn read(&self, loc: &LocationRef) -> Option<StoredPair> {
        if loc.has_constant_address() {
            if let Some(src) = &*self.source.borrow() {
                return src.read(loc);
            }
            self.concrete.borrow().get(loc).cloned()
        } else {
            if let Some(src) = &*self.source.borrow() {
                return src.read(loc);
            }
            self.symbolic
                .borrow()
                .iter()
                .find(|(l, _)| l.full_cmp(loc) == Ordering::Equal)
                .map(|(_, pair)| pair.clone())
        }
    }

    /// The concrete map this frame effectively holds (its source's until the
    /// first write).
    #[must_use]
    pub fn effective_concrete(&self) -> BTreeMap<LocationRef, StoredPair> {
        match &*self.source.borrow() {
            Some(src) => src.effective_concrete(),
            None => self.concrete.borrow().clone(),
        }
    }

    /// The symbolic map this frame effectively holds.
    #[must_use]
    pub fn effective_symbolic(&self) -> Vec<(LocationRef, StoredPair)> {
        match &*self.source.borrow() {
            Some(src) => src.effective_symbolic(),
            None => self.symbolic.borrow().clone(),
        }
    }
}
