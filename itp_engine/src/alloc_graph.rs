//! Allocation marking graph
//!
//! A build-only DAG over memory locations, constructed while marking the
//! values an unsatisfiability core depends on. Sinks form the current
//! frontier: the allocations the interpolant ultimately talks about. The
//! graph is the proof object of *which* allocations matter; it is never
//! traversed after construction except to list sinks.

use crate::memory::LocationRef;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug)]
struct AllocationNode {
    alloc: LocationRef,
    parents: RefCell<Vec<Rc<AllocationNode>>>,
}

/// The allocation dependency DAG.
#[derive(Debug, Default)]
pub struct AllocationGraph {
    nodes: Vec<Rc<AllocationNode>>,
    sinks: Vec<Rc<AllocationNode>>,
}

impl AllocationGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, alloc: &LocationRef) -> Option<Rc<AllocationNode>> {
        self.nodes
            .iter()
            .find(|n| Rc::ptr_eq(&n.alloc, alloc))
            .cloned()
    }

    /// Add `alloc` as a sink, unless it was already visited.
    pub fn add_sink(&mut self, alloc: &LocationRef) {
        if self.find(alloc).is_some() {
            return;
        }
        let node = Rc::new(AllocationNode {
            alloc: Rc::clone(alloc),
            parents: RefCell::new(vec![]),
        });
        self.nodes.push(Rc::clone(&node));
        self.sinks.push(node);
    }

    /// Add an edge from `source` to `target`.
    ///
    /// A source that was a sink stops being one (it now has an outgoing
    /// edge); a target never seen before becomes a new sink.
    pub fn add_edge(&mut self, source: &LocationRef, target: &LocationRef) {
        let source_node = match self.find(source) {
            Some(node) => {
                self.sinks.retain(|s| !Rc::ptr_eq(s, &node));
                node
            }
            None => {
                let node = Rc::new(AllocationNode {
                    alloc: Rc::clone(source),
                    parents: RefCell::new(vec![]),
                });
                self.nodes.push(Rc::clone(&node));
                node
            }
        };

        let target_node = match self.find(target) {
            Some(node) => node,
            None => {
                let node = Rc::new(AllocationNode {
                    alloc: Rc::clone(target),
                    parents: RefCell::new(vec![]),
                });
                self.nodes.push(Rc::clone(&node));
                self.sinks.push(Rc::clone(&node));
                node
            }
        };

        let already = target_node
            .parents
            .borrow()
            .iter()
            .any(|p| Rc::ptr_eq(p, &source_node));
        if !already {
            target_node.parents.borrow_mut().push(source_node);
        }
    }

    /// The current sink frontier.
    #[must_use]
    pub fn sinks(&self) -> Vec<LocationRef> {
        self.sinks.iter().map(|n| Rc::clone(&n.alloc)).collect()
    }

    /// Whether the graph recorded `alloc` at all.
    #[must_use]
    pub fn contains(&self, alloc: &LocationRef) -> bool {
        self.find(alloc).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::{TypeDesc, ValueDesc, ValueId, ValueKind};
    use crate::memory::MemoryLocation;
    use itp_ir::expr::Expr;

    fn loc(id: u64) -> LocationRef {
        let site = Rc::new(ValueDesc {
            id: ValueId(id),
            name: format!("a{id}"),
            kind: ValueKind::Instruction,
            ty: TypeDesc::Int { bits: 32 },
        });
        MemoryLocation::create(&site, vec![], Expr::constant(id * 0x100, 64), 4, id)
    }

    #[test]
    fn test_add_sink_dedups() {
        let mut g = AllocationGraph::new();
        let a = loc(1);
        g.add_sink(&a);
        g.add_sink(&a);
        assert_eq!(g.sinks().len(), 1);
    }

    #[test]
    fn test_edge_moves_sink_to_target() {
        let mut g = AllocationGraph::new();
        let a = loc(1);
        let b = loc(2);
        g.add_sink(&a);
        g.add_edge(&a, &b);
        let sinks = g.sinks();
        assert_eq!(sinks.len(), 1);
        assert!(Rc::ptr_eq(&sinks[0], &b));
        assert!(g.contains(&a));
    }

    #[test]
    fn test_existing_target_stays_non_sink() {
        let mut g = AllocationGraph::new();
        let a = loc(1);
        let b = loc(2);
        let c = loc(3);
        g.add_sink(&b);
        g.add_edge(&b, &c); // b -> c, sink = c
        g.add_edge(&a, &b); // b already known and not a sink
        let sinks = g.sinks();
        assert_eq!(sinks.len(), 1);
        assert!(Rc::ptr_eq(&sinks[0], &c));
    }
}
