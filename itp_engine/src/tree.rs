//! Interpolation tree
//!
//! The binary tree of execution states the interpreter explores. Each node
//! owns a dependency instance and the head of a path-condition list whose
//! tail is shared with its parent; node removal (leaf-only, cascading
//! upwards) is the moment interpolants are distilled into table entries.

use crate::alloc_graph::AllocationGraph;
use crate::dependency::{Dependency, DependencyRef, IdSource};
use crate::instr::{CallHistory, InstrRef, TargetData, ValueId};
use crate::table::{ConcreteStoreSnapshot, SymbolicStoreSnapshot, TableEntry};
use crate::value::VersionedValueRef;
use crate::wp::WpFlag;
use itp_ir::expr::{BinOp, Expr, ExprRef};
use itp_ir::{ArrayRef, InterpConfig, ShadowRegistry};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

/// Shared handle to a tree node.
pub type NodeRef = Rc<RefCell<TreeNode>>;

/// Constraint → marker map used during a subsumption check.
pub type MarkerMap = BTreeMap<ExprRef, Rc<PathConditionMarker>>;

/// One node of the path-condition list.
///
/// The list is immutable and grows at the front; the tail is shared with the
/// parent tree node, so dropping a node's prefix never touches the parent's.
#[derive(Debug)]
pub struct PathCondition {
    constraint: ExprRef,
    /// The constraint with arrays renamed to shadows; built on demand the
    /// first time the constraint lands in an interpolant
    shadow_constraint: RefCell<ExprRef>,
    shadowed: Cell<bool>,
    dependency: DependencyRef,
    condition: Option<VersionedValueRef>,
    in_interpolant: Cell<bool>,
    tail: Option<Rc<PathCondition>>,
    serial: u64,
}

impl PathCondition {
    #[must_use]
    pub fn new(
        constraint: ExprRef,
        dependency: DependencyRef,
        condition: Option<VersionedValueRef>,
        tail: Option<Rc<PathCondition>>,
        serial: u64,
    ) -> Rc<Self> {
        Rc::new(Self {
            shadow_constraint: RefCell::new(Rc::clone(&constraint)),
            constraint,
            shadowed: Cell::new(false),
            dependency,
            condition,
            in_interpolant: Cell::new(false),
            tail,
            serial,
        })
    }

    #[must_use]
    pub fn constraint(&self) -> ExprRef {
        Rc::clone(&self.constraint)
    }

    #[must_use]
    pub fn tail(&self) -> Option<Rc<PathCondition>> {
        self.tail.clone()
    }

    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    #[must_use]
    pub fn in_interpolant(&self) -> bool {
        self.in_interpolant.get()
    }

    /// Put this constraint into the interpolant: mark everything its
    /// condition value flows from as core, and flag the constraint.
    pub fn include_in_interpolant(&self, graph: &mut AllocationGraph) {
        if let Some(condition) = &self.condition {
            self.dependency
                .mark_all_values(graph, condition, "subsumption core constraint");
        }
        self.in_interpolant.set(true);
    }

    /// Fold the list into an interpolant: the shadow copies of every flagged
    /// constraint, conjoined. `None` when nothing is flagged.
    #[must_use]
    pub fn pack_interpolant(
        self: &Rc<Self>,
        shadow: &ShadowRegistry,
        replacements: &mut Vec<ArrayRef>,
    ) -> Option<ExprRef> {
        let mut result: Option<ExprRef> = None;
        let mut cursor = Some(Rc::clone(self));
        while let Some(pc) = cursor {
            if pc.in_interpolant.get() {
                if !pc.shadowed.get() {
                    *pc.shadow_constraint.borrow_mut() =
                        shadow.shadow_expr(&pc.constraint, replacements);
                    pc.shadowed.set(true);
                }
                let shadowed = pc.shadow_constraint.borrow().clone();
                result = Expr::and_opt(result, shadowed);
            }
            cursor = pc.tail.clone();
        }
        result
    }
}

/// Marker used while matching an unsat core against the path condition:
/// first flagged as "may be included", then committed in one sweep.
#[derive(Debug)]
pub struct PathConditionMarker {
    may_include: Cell<bool>,
    pc: Rc<PathCondition>,
}

impl PathConditionMarker {
    #[must_use]
    pub fn new(pc: Rc<PathCondition>) -> Rc<Self> {
        Rc::new(Self {
            may_include: Cell::new(false),
            pc,
        })
    }

    pub fn may_include_in_interpolant(&self) {
        self.may_include.set(true);
    }

    pub fn include_in_interpolant(&self, graph: &mut AllocationGraph) {
        if self.may_include.get() {
            self.pc.include_in_interpolant(graph);
        }
    }
}

/// A node of the interpolation tree.
#[derive(Debug)]
pub struct TreeNode {
    serial: u64,
    parent: Weak<RefCell<TreeNode>>,
    left: Option<NodeRef>,
    right: Option<NodeRef>,
    /// Program point; assigned once, on the first `set_current_node`
    node_id: u64,
    is_subsumed: bool,
    path_condition: Option<Rc<PathCondition>>,
    dependency: DependencyRef,
    /// Call history of the state currently sitting at this node
    call_history: CallHistory,
    /// Reverse-ordered instruction record for the WP pass
    wp_record: Vec<(InstrRef, WpFlag)>,
    /// PHI incoming-operand choices, for WP operand synthesis
    phi_choices: HashMap<ValueId, usize>,
}

impl TreeNode {
    fn new(serial: u64, parent: Weak<RefCell<TreeNode>>, dependency: DependencyRef) -> NodeRef {
        let path_condition = parent
            .upgrade()
            .and_then(|p| p.borrow().path_condition.clone());
        Rc::new(RefCell::new(Self {
            serial,
            parent,
            left: None,
            right: None,
            node_id: 0,
            is_subsumed: false,
            path_condition,
            dependency,
            call_history: vec![],
            wp_record: vec![],
            phi_choices: HashMap::new(),
        }))
    }

    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Program point; zero until assigned.
    #[must_use]
    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Idempotent program-point assignment.
    pub fn set_node_location(&mut self, program_point: u64) {
        if self.node_id == 0 {
            self.node_id = program_point;
        }
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeRef> {
        self.parent.upgrade()
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    #[must_use]
    pub fn is_subsumed(&self) -> bool {
        self.is_subsumed
    }

    pub fn set_subsumed(&mut self) {
        self.is_subsumed = true;
    }

    #[must_use]
    pub fn dependency(&self) -> DependencyRef {
        Rc::clone(&self.dependency)
    }

    #[must_use]
    pub fn call_history(&self) -> CallHistory {
        self.call_history.clone()
    }

    pub fn set_call_history(&mut self, history: CallHistory) {
        self.call_history = history;
    }

    pub fn record_wp_instruction(&mut self, instr: InstrRef, flag: WpFlag) {
        self.wp_record.push((instr, flag));
    }

    #[must_use]
    pub fn wp_record(&self) -> &[(InstrRef, WpFlag)] {
        &self.wp_record
    }

    pub fn record_phi_choice(&mut self, phi: ValueId, incoming_index: usize) {
        self.phi_choices.insert(phi, incoming_index);
    }

    #[must_use]
    pub fn phi_choices(&self) -> HashMap<ValueId, usize> {
        self.phi_choices.clone()
    }

    #[must_use]
    pub fn path_condition(&self) -> Option<Rc<PathCondition>> {
        self.path_condition.clone()
    }

    /// Prepend a constraint to the path-condition list.
    pub fn add_constraint(
        &mut self,
        constraint: ExprRef,
        condition: ValueId,
        serial: u64,
    ) -> Rc<PathCondition> {
        let condition_value = self.dependency.latest_value_no_constant_check(condition);
        let pc = PathCondition::new(
            constraint,
            Rc::clone(&self.dependency),
            condition_value,
            self.path_condition.take(),
            serial,
        );
        self.path_condition = Some(Rc::clone(&pc));
        pc
    }

    /// Build the marker map for a subsumption check: one marker per path
    /// condition. Disjunctions additionally map each disjunct to the same
    /// marker, because the solver reports the disjuncts separately.
    #[must_use]
    pub fn make_marker_map(&self) -> MarkerMap {
        let mut map = MarkerMap::new();
        let mut cursor = self.path_condition.clone();
        while let Some(pc) = cursor {
            let marker = PathConditionMarker::new(Rc::clone(&pc));
            if let Expr::Binary {
                op: BinOp::Or,
                left,
                right,
            } = pc.constraint().as_ref()
            {
                map.insert(Rc::clone(left), Rc::clone(&marker));
                map.insert(Rc::clone(right), Rc::clone(&marker));
            }
            map.insert(pc.constraint(), marker);
            cursor = pc.tail();
        }
        map
    }

    /// The node's interpolant: flagged path conditions, shadowed and
    /// conjoined.
    #[must_use]
    pub fn get_interpolant(
        &self,
        shadow: &ShadowRegistry,
        replacements: &mut Vec<ArrayRef>,
    ) -> Option<ExprRef> {
        self.path_condition
            .as_ref()
            .and_then(|pc| pc.pack_interpolant(shadow, replacements))
    }

    /// Store snapshots describing the state *at* this node's program point.
    ///
    /// The program point is the first instruction of a basic block, so the
    /// snapshot comes from the parent's dependency: the state before the
    /// checkpoint instruction.
    #[must_use]
    pub fn stored_expressions(
        &self,
        shadow: &ShadowRegistry,
        replacements: &mut Vec<ArrayRef>,
        core_only: bool,
    ) -> (ConcreteStoreSnapshot, SymbolicStoreSnapshot) {
        match self.parent.upgrade() {
            Some(parent) => {
                let parent = parent.borrow();
                parent.dependency.get_stored_expressions(
                    &self.call_history,
                    shadow,
                    replacements,
                    core_only,
                )
            }
            None => (ConcreteStoreSnapshot::new(), SymbolicStoreSnapshot::new()),
        }
    }

    /// Package this node into a subsumption-table entry.
    #[must_use]
    pub fn build_table_entry(&self, shadow: &ShadowRegistry) -> TableEntry {
        let mut replacements = vec![];
        let interpolant = self.get_interpolant(shadow, &mut replacements);
        let (concrete, symbolic) = self.stored_expressions(shadow, &mut replacements, true);
        TableEntry::new(self.node_id, interpolant, concrete, symbolic, replacements)
    }
}

/// The interpolation tree.
#[derive(Debug)]
pub struct Tree {
    root: NodeRef,
    current: NodeRef,
    ids: IdSource,
}

impl Tree {
    #[must_use]
    pub fn new(
        target_data: Rc<TargetData>,
        config: Rc<InterpConfig>,
        ids: IdSource,
    ) -> Self {
        let dependency = Dependency::root(target_data, config, ids.clone());
        let root = TreeNode::new(ids.next(), Weak::new(), dependency);
        Self {
            current: Rc::clone(&root),
            root,
            ids,
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeRef {
        Rc::clone(&self.root)
    }

    #[must_use]
    pub fn current(&self) -> NodeRef {
        Rc::clone(&self.current)
    }

    /// Make `node` current and assign its program point (first time only).
    pub fn set_current_node(&mut self, node: &NodeRef, program_point: u64) {
        node.borrow_mut().set_node_location(program_point);
        self.current = Rc::clone(node);
    }

    /// Prepend a constraint to the current node's path condition.
    pub fn add_constraint(&mut self, constraint: ExprRef, condition: ValueId) -> Rc<PathCondition> {
        let serial = self.ids.next();
        self.current
            .borrow_mut()
            .add_constraint(constraint, condition, serial)
    }

    /// Split the current node into two children, each with a fresh
    /// dependency chained to the parent's.
    pub fn split(&mut self, parent: &NodeRef) -> (NodeRef, NodeRef) {
        let (left, right) = {
            let parent_borrow = parent.borrow();
            assert!(parent_borrow.is_leaf(), "split of an inner node");
            let dep = parent_borrow.dependency();
            let left = TreeNode::new(
                self.ids.next(),
                Rc::downgrade(parent),
                Dependency::child(&dep),
            );
            let right = TreeNode::new(
                self.ids.next(),
                Rc::downgrade(parent),
                Dependency::child(&dep),
            );
            (left, right)
        };
        {
            let mut parent_borrow = parent.borrow_mut();
            parent_borrow.left = Some(Rc::clone(&left));
            parent_borrow.right = Some(Rc::clone(&right));
        }
        (left, right)
    }

    /// Remove a fully-explored leaf, cascading upward while parents become
    /// leaves themselves. Returns the removed nodes that were *not*
    /// subsumed, in removal order; each must be tabled by the caller.
    pub fn remove(&mut self, node: &NodeRef) -> Vec<NodeRef> {
        assert!(node.borrow().is_leaf(), "remove of an inner node");
        let mut to_table = vec![];
        let mut cursor = Some(Rc::clone(node));
        while let Some(current) = cursor {
            if !current.borrow().is_leaf() {
                break;
            }
            if !current.borrow().is_subsumed() {
                to_table.push(Rc::clone(&current));
            }
            let parent = current.borrow().parent();
            if let Some(parent) = &parent {
                let mut p = parent.borrow_mut();
                if p.left.as_ref().is_some_and(|l| Rc::ptr_eq(l, &current)) {
                    p.left = None;
                } else {
                    debug_assert!(
                        p.right.as_ref().is_some_and(|r| Rc::ptr_eq(r, &current)),
                        "removed node is not a child of its parent"
                    );
                    p.right = None;
                }
            }
            cursor = parent;
        }
        to_table
    }

    /// Match the solver's last unsat core against the current node's path
    /// condition (newest first, core in reverse) and include every matched
    /// constraint in the interpolant. `branch_condition` is the condition of
    /// the branch that just proved infeasible.
    pub fn mark_path_condition(
        &mut self,
        unsat_core: &[ExprRef],
        branch_condition: Option<ValueId>,
    ) {
        let mut graph = AllocationGraph::new();
        let current = self.current.borrow();
        if let Some(cond) = branch_condition {
            current
                .dependency
                .mark_value_by_id(&mut graph, cond, "infeasible branch condition");
        }
        let mut pc = current.path_condition();
        for constraint in unsat_core.iter().rev() {
            loop {
                let Some(node) = pc.clone() else {
                    return;
                };
                pc = node.tail();
                if node.constraint() == *constraint {
                    node.include_in_interpolant(&mut graph);
                    break;
                }
            }
        }
    }
}
