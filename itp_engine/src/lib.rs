//! Interpolation core for a symbolic-execution engine
//!
//! As a symbolic interpreter explores a program's instruction-level
//! control-flow tree, this crate records data-flow dependencies between
//! symbolic values and memory, and on path exit distills a *state
//! interpolant*: a condition on program state strong enough to imply the
//! infeasibility (or safety) of the explored suffix, yet weak enough that
//! unrelated future paths reaching the same program point are subsumed
//! without re-exploration.
//!
//! The interpreter drives the [`Engine`] synchronously, one event per
//! instruction; the SMT solver is an external collaborator behind the
//! [`itp_ir::SolverBackend`] trait. Everything the engine owns — shadow
//! arrays, the tree, the subsumption table, the optional search-graph
//! renderer — lives in the `Engine` value; there are no process-wide
//! singletons.

pub mod alloc_graph;
pub mod dependency;
pub mod instr;
pub mod memory;
pub mod render;
pub mod stats;
pub mod store;
pub mod table;
pub mod tree;
pub mod value;
pub mod wp;

use crate::dependency::IdSource;
use crate::instr::{CallHistory, InstrRef, Opcode, Program, TargetData, ValueDescRef, ValueId};
use crate::render::SearchGraph;
use crate::stats::{Stats, StatsReport};
use crate::table::{StateSnapshot, SubsumptionTable};
use crate::tree::{NodeRef, Tree};
use crate::value::VersionedValueRef;
use crate::wp::{update_table_entry, WpFlag, WpPass};
use itp_ir::expr::ExprRef;
use itp_ir::{ArrayCache, InterpConfig, Result, ShadowRegistry, SolverBackend};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, warn};

/// The interpolation engine: tree lifecycle, dependency tracking,
/// subsumption table, and bookkeeping, behind the interpreter-facing API.
pub struct Engine {
    config: Rc<InterpConfig>,
    arrays: Rc<ArrayCache>,
    shadow: Rc<ShadowRegistry>,
    program: Rc<Program>,
    tree: Tree,
    table: SubsumptionTable,
    graph: SearchGraph,
    stats: Stats,
}

impl Engine {
    /// Build an engine for one exploration. The root tree node is created
    /// here; the interpreter attaches its root state to it.
    #[must_use]
    pub fn new(config: InterpConfig, target_data: TargetData) -> Self {
        let config = Rc::new(config);
        let arrays = Rc::new(ArrayCache::new());
        let shadow = Rc::new(ShadowRegistry::new(Rc::clone(&arrays)));
        let tree = Tree::new(
            Rc::new(target_data),
            Rc::clone(&config),
            IdSource::new(),
        );
        let mut graph = SearchGraph::new(config.output_tree);
        graph.set_root(&tree.root());
        Self {
            stats: Stats::new(config.time_statistics),
            graph,
            table: SubsumptionTable::new(),
            program: Rc::new(Program::new()),
            shadow,
            arrays,
            config,
            tree,
        }
    }

    #[must_use]
    pub fn config(&self) -> &InterpConfig {
        &self.config
    }

    #[must_use]
    pub fn arrays(&self) -> &Rc<ArrayCache> {
        &self.arrays
    }

    #[must_use]
    pub fn shadow(&self) -> &Rc<ShadowRegistry> {
        &self.shadow
    }

    #[must_use]
    pub fn program(&self) -> &Rc<Program> {
        &self.program
    }

    #[must_use]
    pub fn root(&self) -> NodeRef {
        self.tree.root()
    }

    #[must_use]
    pub fn current(&self) -> NodeRef {
        self.tree.current()
    }

    #[must_use]
    pub fn subsumption_table(&self) -> &SubsumptionTable {
        &self.table
    }

    /// Make `node` current; its program point is assigned on first call.
    pub fn set_current_node(&mut self, node: &NodeRef, program_point: u64) {
        if !self.config.interpolation_enabled {
            return;
        }
        if self.stats.enabled() {
            self.stats.set_current_node.start();
        }
        self.tree.set_current_node(node, program_point);
        self.graph
            .set_current_node(node, &format!("pp {program_point}"));
        if self.stats.enabled() {
            self.stats.set_current_node.end();
        }
    }

    /// Per-instruction event: update the current node's dependency state.
    pub fn execute(
        &mut self,
        instr: &InstrRef,
        call_history: &CallHistory,
        args: &[ExprRef],
        symbolic_error: bool,
    ) -> Result<Option<VersionedValueRef>> {
        if !self.config.interpolation_enabled {
            return Ok(None);
        }
        if self.stats.enabled() {
            self.stats.execute.start();
        }
        self.program.register(instr);
        let node = self.tree.current();
        node.borrow_mut().set_call_history(call_history.clone());
        if self.config.wp_interpolant
            && !matches!(instr.opcode, Opcode::Br { conditional: true })
        {
            node.borrow_mut()
                .record_wp_instruction(Rc::clone(instr), WpFlag::Ignore);
        }
        let dependency = node.borrow().dependency();
        let result = dependency.execute(instr, call_history, args, symbolic_error);
        if self.stats.enabled() {
            self.stats.execute.end();
        }
        result
    }

    /// PHI event; `incoming_index` selects the operand of the edge taken.
    pub fn execute_phi(
        &mut self,
        instr: &InstrRef,
        incoming_index: usize,
        call_history: &CallHistory,
        value_expr: &ExprRef,
        symbolic_error: bool,
    ) -> Result<Option<VersionedValueRef>> {
        if !self.config.interpolation_enabled {
            return Ok(None);
        }
        self.program.register(instr);
        let node = self.tree.current();
        node.borrow_mut().set_call_history(call_history.clone());
        node.borrow_mut()
            .record_phi_choice(instr.result.id, incoming_index);
        let dependency = node.borrow().dependency();
        dependency.execute_phi(instr, incoming_index, call_history, value_expr, symbolic_error)
    }

    /// Load/store event. When the interpreter's bounds check passed, the
    /// pointer's flow is marked core with slackened offset bounds, so later
    /// accesses under the proven bound subsume.
    pub fn execute_memory_operation(
        &mut self,
        instr: &InstrRef,
        call_history: &CallHistory,
        args: &[ExprRef],
        bounds_check_passed: bool,
        symbolic_error: bool,
    ) -> Result<Option<VersionedValueRef>> {
        if !self.config.interpolation_enabled {
            return Ok(None);
        }
        let result = self.execute(instr, call_history, args, symbolic_error)?;

        let slackening_applies = bounds_check_passed
            && !self.config.no_bound_interpolation
            && self
                .config
                .special_function_bound_interpolation
                .as_ref()
                .map_or(true, |f| *f == instr.function);
        if slackening_applies {
            let address_operand = match instr.opcode {
                Opcode::Load => 0,
                Opcode::Store => 1,
                _ => return Ok(result),
            };
            let dependency = self.tree.current().borrow().dependency();
            if let Some(address) =
                dependency.latest_value_no_constant_check(instr.operands[address_operand].id)
            {
                let mut graph = alloc_graph::AllocationGraph::new();
                let mut bounds = std::collections::BTreeSet::new();
                let reason = format!(
                    "memory bounds check at {}:{}",
                    instr.function, instr.id
                );
                dependency.mark_all_pointer_values(&mut graph, &address, &mut bounds, &reason);
            }
        }
        Ok(result)
    }

    /// Record the direction a conditional branch took, for the WP pass.
    pub fn record_branch_direction(&mut self, instr: &InstrRef, taken: bool) {
        if !self.config.interpolation_enabled || !self.config.wp_interpolant {
            return;
        }
        self.program.register(instr);
        let flag = if taken { WpFlag::Taken } else { WpFlag::NotTaken };
        self.tree
            .current()
            .borrow_mut()
            .record_wp_instruction(Rc::clone(instr), flag);
    }

    /// Bind a call's arguments to the callee's parameters.
    pub fn bind_call_arguments(
        &mut self,
        site: &InstrRef,
        call_history: &CallHistory,
        args: &[ExprRef],
        params: &[ValueDescRef],
    ) {
        if !self.config.interpolation_enabled {
            return;
        }
        self.program.register(site);
        let dependency = self.tree.current().borrow().dependency();
        dependency.bind_call_arguments(site, call_history, args, params);
    }

    /// Propagate a return value back to its callsite.
    pub fn bind_return_value(
        &mut self,
        site: &InstrRef,
        call_history: &CallHistory,
        ret: &InstrRef,
        return_expr: Option<&ExprRef>,
    ) {
        if !self.config.interpolation_enabled {
            return;
        }
        let dependency = self.tree.current().borrow().dependency();
        dependency.bind_return_value(site, call_history, ret, return_expr);
    }

    /// Prepend a branch constraint to the current node's path condition.
    pub fn add_constraint(&mut self, constraint: ExprRef, condition: ValueId) {
        if !self.config.interpolation_enabled {
            return;
        }
        let node = self.tree.current();
        let pc = self.tree.add_constraint(Rc::clone(&constraint), condition);
        self.graph.add_path_condition(&node, &pc, &constraint);
    }

    /// Split the current node into two children for a state fork.
    pub fn split(&mut self, parent: &NodeRef) -> (NodeRef, NodeRef) {
        if self.stats.enabled() {
            self.stats.split.start();
        }
        let (left, right) = self.tree.split(parent);
        self.graph.add_children(parent, &left, &right);
        if self.stats.enabled() {
            self.stats.split.end();
        }
        (left, right)
    }

    /// Check whether the current state is covered by an earlier table entry
    /// at the same program point.
    pub fn check_current_state_subsumption(
        &mut self,
        solver: &mut dyn SolverBackend,
        constraints: &[ExprRef],
        timeout: Duration,
    ) -> bool {
        if !self.config.interpolation_enabled {
            return false;
        }
        if self.stats.enabled() {
            self.stats.check_subsumption.start();
        }
        let node = self.tree.current();
        let program_point = node.borrow().node_id();
        let markers = node.borrow().make_marker_map();
        let mut dummy = vec![];
        let (concrete, symbolic) = node
            .borrow()
            .stored_expressions(&self.shadow, &mut dummy, false);
        let state = StateSnapshot {
            program_point,
            concrete: &concrete,
            symbolic: &symbolic,
            constraints,
            markers: &markers,
        };

        let mut subsumed = false;
        for entry in self.table.entries_at(program_point) {
            let result = entry.subsumed(
                solver,
                &state,
                timeout,
                self.config.exact_address_interpolant,
            );
            self.stats.solver_calls += result.solver_calls;
            self.stats.solver_failures += result.solver_failures;
            if result.subsumed {
                subsumed = true;
                break;
            }
        }

        if subsumed {
            node.borrow_mut().set_subsumed();
            self.stats.nodes_subsumed += 1;
            self.graph.mark_as_subsumed(&node, program_point);
            self.sweep_interpolant_tags(&node);
            debug!(program_point, "state subsumed by table entry");
        }
        if self.stats.enabled() {
            self.stats.check_subsumption.end();
        }
        subsumed
    }

    /// After an infeasible branch, include the unsat core's constraints in
    /// the interpolant. `branch_condition` is the condition value of the
    /// branch the solver refuted.
    pub fn mark_path_condition(
        &mut self,
        unsat_core: &[ExprRef],
        branch_condition: Option<ValueId>,
    ) {
        if !self.config.interpolation_enabled {
            return;
        }
        if self.stats.enabled() {
            self.stats.mark_path_condition.start();
        }
        self.tree.mark_path_condition(unsat_core, branch_condition);
        let node = self.tree.current();
        self.sweep_interpolant_tags(&node);
        if self.stats.enabled() {
            self.stats.mark_path_condition.end();
        }
    }

    fn sweep_interpolant_tags(&mut self, node: &NodeRef) {
        let mut pc = node.borrow().path_condition();
        while let Some(current) = pc {
            if current.in_interpolant() {
                self.graph.include_in_interpolant(&current);
            }
            pc = current.tail();
        }
    }

    /// Remove a fully-explored leaf. Unless subsumed, each node removed
    /// (the leaf, plus ancestors that become leaves) is distilled into a
    /// subsumption-table entry; with WP interpolation on, the recorded
    /// instruction list is pushed up and folded into the entry.
    pub fn remove(&mut self, node: &NodeRef) {
        if !self.config.interpolation_enabled {
            return;
        }
        if self.stats.enabled() {
            self.stats.remove.start();
        }
        for dead in self.tree.remove(node) {
            let mut entry = dead.borrow().build_table_entry(&self.shadow);
            if self.config.wp_interpolant && !dead.borrow().wp_record().is_empty() {
                let mut pass = WpPass::new(&self.program, Rc::clone(&self.arrays))
                    .with_phi_choices(dead.borrow().phi_choices());
                match pass.push_up(dead.borrow().wp_record()) {
                    Ok(wp) => {
                        entry.set_wp_interpolant(Some(wp));
                        update_table_entry(&mut entry, pass.store(), &self.shadow);
                    }
                    Err(err) => {
                        // The deletion interpolant still stands on its own.
                        warn!(error = %err, "weakest-precondition pass failed");
                    }
                }
            }
            self.graph.add_table_entry(&dead, entry.program_point());
            self.table.insert(entry);
            self.stats.entries_tabled += 1;
        }
        if self.stats.enabled() {
            self.stats.remove.end();
        }
    }

    /// Write the search-tree dot graph (no-op unless `output_tree` is set).
    pub fn save_graph(&self, path: &Path) -> Result<()> {
        self.graph.save(path)
    }

    /// Shutdown statistics.
    #[must_use]
    pub fn stats_report(&self) -> StatsReport {
        self.stats.report()
    }
}
