//! Dependency tracking
//!
//! Per-node shadow state for the interpolation tree: every instruction event
//! the interpreter issues lands in `Dependency::execute`, which maintains the
//! versioned-value graph, the store frames, and the pointer locations that a
//! later interpolant may need.
//!
//! A dependency instance is created per tree node and chains to its parent;
//! lookups fall through the chain, writes stay local (store frames fork
//! copy-on-write). Marking walks the flow edges recorded here to decide
//! which values and allocations are `core` for an unsatisfiability core.

use crate::alloc_graph::AllocationGraph;
use crate::instr::{
    CallHistory, InstrId, InstrRef, Opcode, TargetData, TypeDesc, ValueDescRef, ValueId,
};
use crate::memory::{AllocationContext, LocationRef, MemoryLocation, StoredAddress};
use crate::store::{FrameRef, StoreFrame};
use crate::table::{ConcreteStoreSnapshot, StoredValue, SymbolicStoreSnapshot};
use crate::value::{flow_closure, VersionedValue, VersionedValueRef};
use itp_ir::expr::{Expr, ExprRef};
use itp_ir::{ArrayRef, EngineError, InterpConfig, Result, ShadowRegistry};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use tracing::{debug, warn};

/// Shared handle to a dependency instance.
pub type DependencyRef = Rc<Dependency>;

/// Issues version and allocation ids, shared across a whole tree.
#[derive(Debug, Clone, Default)]
pub struct IdSource(Rc<Cell<u64>>);

impl IdSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn next(&self) -> u64 {
        let id = self.0.get();
        self.0.set(id + 1);
        id
    }
}

/// Per-node dependency state.
#[derive(Debug)]
pub struct Dependency {
    parent: Option<DependencyRef>,
    values: RefCell<HashMap<ValueId, Vec<VersionedValueRef>>>,
    global_frame: FrameRef,
    stack: RefCell<Vec<FrameRef>>,
    argument_values: RefCell<Vec<Option<VersionedValueRef>>>,
    target_data: Rc<TargetData>,
    config: Rc<InterpConfig>,
    ids: IdSource,
}

impl Dependency {
    /// The root dependency of a fresh tree.
    #[must_use]
    pub fn root(
        target_data: Rc<TargetData>,
        config: Rc<InterpConfig>,
        ids: IdSource,
    ) -> DependencyRef {
        Rc::new(Self {
            parent: None,
            values: RefCell::new(HashMap::new()),
            global_frame: StoreFrame::base(),
            stack: RefCell::new(vec![StoreFrame::base()]),
            argument_values: RefCell::new(vec![]),
            target_data,
            config,
            ids,
        })
    }

    /// A child dependency: shares the parent through the lookup chain and
    /// forks every store frame copy-on-write.
    #[must_use]
    pub fn child(parent: &DependencyRef) -> DependencyRef {
        let global_frame = StoreFrame::fork(&parent.global_frame, None);
        let mut stack = Vec::with_capacity(parent.stack.borrow().len());
        let mut prev: Option<FrameRef> = None;
        for frame in parent.stack.borrow().iter() {
            let forked = StoreFrame::fork(frame, prev.clone());
            prev = Some(Rc::clone(&forked));
            stack.push(forked);
        }
        Rc::new(Self {
            parent: Some(Rc::clone(parent)),
            values: RefCell::new(HashMap::new()),
            global_frame,
            stack: RefCell::new(stack),
            argument_values: RefCell::new(vec![]),
            target_data: Rc::clone(&parent.target_data),
            config: Rc::clone(&parent.config),
            ids: parent.ids.clone(),
        })
    }

    /// The previous node's dependency ("cdr" of the chain).
    #[must_use]
    pub fn cdr(&self) -> Option<DependencyRef> {
        self.parent.clone()
    }

    // ----- value registration and lookup -----

    fn register(&self, value: &ValueDescRef, expr: ExprRef) -> VersionedValueRef {
        let v = VersionedValue::new(Rc::clone(value), self.ids.next(), expr);
        self.values
            .borrow_mut()
            .entry(value.id)
            .or_default()
            .push(Rc::clone(&v));
        v
    }

    fn new_pointer_value(
        &self,
        value: &ValueDescRef,
        call_history: &CallHistory,
        address: ExprRef,
        size: u64,
    ) -> VersionedValueRef {
        let v = self.register(value, Rc::clone(&address));
        v.add_location(MemoryLocation::create(
            value,
            call_history.clone(),
            address,
            size,
            self.ids.next(),
        ));
        v
    }

    /// Latest version of a value, without materializing constants.
    #[must_use]
    pub fn latest_value_no_constant_check(&self, id: ValueId) -> Option<VersionedValueRef> {
        if let Some(vs) = self.values.borrow().get(&id) {
            if let Some(last) = vs.last() {
                return Some(Rc::clone(last));
            }
        }
        self.parent
            .as_ref()
            .and_then(|p| p.latest_value_no_constant_check(id))
    }

    /// Latest version of a value; constants are materialized fresh (pointer
    /// constants get an allocation at their address).
    #[must_use]
    pub fn latest_value(
        &self,
        value: &ValueDescRef,
        call_history: &CallHistory,
        expr: &ExprRef,
    ) -> Option<VersionedValueRef> {
        match &value.kind {
            crate::instr::ValueKind::ConstantPointer => {
                let size = value
                    .ty
                    .total_bits()
                    .map_or(0, |bits| (bits + 7) / 8);
                Some(self.new_pointer_value(value, call_history, Rc::clone(expr), size))
            }
            crate::instr::ValueKind::ConstantInt { .. } => {
                Some(self.register(value, Rc::clone(expr)))
            }
            _ => self.latest_value_no_constant_check(value.id),
        }
    }

    /// Resolve an operand to a versioned value, applying the recovery rules:
    /// constants and function arguments are materialized, as is anything
    /// when the interpreter flags a symbolic-execution error. `None` is a
    /// programming error the caller reports.
    fn operand_value(
        &self,
        instr: &InstrRef,
        index: usize,
        expr: &ExprRef,
        call_history: &CallHistory,
        symbolic_error: bool,
    ) -> Option<VersionedValueRef> {
        let operand = &instr.operands[index];
        if let Some(v) = self.latest_value(operand, call_history, expr) {
            return Some(v);
        }
        if operand.is_argument() || symbolic_error {
            return Some(self.register(operand, Rc::clone(expr)));
        }
        None
    }

    fn resolve_operand(
        &self,
        instr: &InstrRef,
        index: usize,
        expr: &ExprRef,
        call_history: &CallHistory,
        symbolic_error: bool,
    ) -> Result<VersionedValueRef> {
        self.operand_value(instr, index, expr, call_history, symbolic_error)
            .ok_or(EngineError::OperandNotFound {
                instr: instr.id,
                operand: index,
            })
    }

    // ----- flow edges -----

    fn flow(source: &VersionedValueRef, target: &VersionedValueRef) {
        target.add_source(source);
        for loc in source.locations() {
            target.add_location(loc);
        }
    }

    fn flow_non_pointer(source: &VersionedValueRef, target: &VersionedValueRef) {
        target.add_source(source);
    }

    fn flow_via(source: &VersionedValueRef, target: &VersionedValueRef, via: &LocationRef) {
        target.add_source_via(source, Rc::clone(via));
        for loc in source.locations() {
            target.add_location(loc);
        }
    }

    // ----- store access -----

    fn frame_for(&self, loc: &LocationRef) -> Result<FrameRef> {
        if loc.is_global() {
            Ok(Rc::clone(&self.global_frame))
        } else {
            let top = Rc::clone(self.stack.borrow().last().expect("stack is never empty"));
            top.find_frame(loc)
        }
    }

    /// Relate a location to its stored value (last-writer-wins per frame).
    pub fn update_store(
        &self,
        loc: &LocationRef,
        address: &VersionedValueRef,
        value: &VersionedValueRef,
    ) -> Result<()> {
        self.frame_for(loc)?.update(loc, address, value);
        value.set_store_address(address);
        Ok(())
    }

    /// Read the latest pair stored at `loc`.
    pub fn read_store(
        &self,
        loc: &LocationRef,
    ) -> Result<Option<(VersionedValueRef, VersionedValueRef)>> {
        Ok(self.frame_for(loc)?.read(loc))
    }

    fn push_frame(&self, callsite: InstrId) {
        let mut stack = self.stack.borrow_mut();
        let top = Rc::clone(stack.last().expect("stack is never empty"));
        stack.push(StoreFrame::push(&top, callsite));
    }

    fn pop_frame(&self) {
        let mut stack = self.stack.borrow_mut();
        if stack.len() > 1 {
            stack.pop();
        }
    }

    // ----- event dispatch -----

    /// Abstract state transition for one instruction.
    ///
    /// `args` carries the symbolic expressions of the event, result cell
    /// first for the 2- and 3-operand forms. Returns the versioned value
    /// created for the result, when there is one.
    pub fn execute(
        &self,
        instr: &InstrRef,
        call_history: &CallHistory,
        args: &[ExprRef],
        symbolic_error: bool,
    ) -> Result<Option<VersionedValueRef>> {
        if let Opcode::Call { callee } = &instr.opcode {
            let name = callee.clone().unwrap_or_default();
            return self.execute_call(instr, &name, call_history, args, symbolic_error);
        }
        match args.len() {
            0 => self.execute_nullary(instr, call_history),
            1 => self.execute_unary(instr, call_history, &args[0], symbolic_error),
            2 => self.execute_memory(instr, call_history, &args[0], &args[1], symbolic_error),
            3 => self.execute_ternary(instr, call_history, args, symbolic_error),
            n => Err(EngineError::UnhandledOpcode {
                opcode: instr.opcode.mnemonic().to_string(),
                arity: n,
            }),
        }
    }

    fn execute_nullary(
        &self,
        instr: &InstrRef,
        _call_history: &CallHistory,
    ) -> Result<Option<VersionedValueRef>> {
        if let Opcode::Br { conditional: true } = instr.opcode {
            // The branch decides path feasibility, so everything the
            // condition flows from participates in the interpolant.
            if let Some(cond) = self.latest_value_no_constant_check(instr.operands[0].id) {
                let mut graph = AllocationGraph::new();
                let reason = format!("branch condition at {}:{}", instr.function, instr.id);
                self.mark_all_values(&mut graph, &cond, &reason);
            }
        }
        Ok(None)
    }

    fn execute_unary(
        &self,
        instr: &InstrRef,
        call_history: &CallHistory,
        arg: &ExprRef,
        symbolic_error: bool,
    ) -> Result<Option<VersionedValueRef>> {
        match &instr.opcode {
            Opcode::Alloca { size } => Ok(Some(self.new_pointer_value(
                &instr.result,
                call_history,
                Rc::clone(arg),
                *size,
            ))),
            Opcode::IntToPtr => {
                let source = self.resolve_operand(instr, 0, arg, call_history, symbolic_error)?;
                let result = self.register(&instr.result, Rc::clone(arg));
                result.add_source(&source);
                if source.is_pointer() {
                    // Recompute displacements against the integer address.
                    for loc in source.locations() {
                        result.add_location(MemoryLocation::re_based(&loc, Rc::clone(arg)));
                    }
                    result.disable_bound_interpolation();
                } else {
                    // Promotion: the integer becomes a pointer to an
                    // allocation of unknown extent.
                    result.add_location(MemoryLocation::create(
                        &instr.result,
                        call_history.clone(),
                        Rc::clone(arg),
                        0,
                        self.ids.next(),
                    ));
                }
                Ok(Some(result))
            }
            op if op.is_cast() || *op == Opcode::PtrToInt => {
                let source = self.resolve_operand(instr, 0, arg, call_history, symbolic_error)?;
                let result = self.register(&instr.result, Rc::clone(arg));
                Self::flow(&source, &result);
                Ok(Some(result))
            }
            _ => Err(EngineError::UnhandledOpcode {
                opcode: instr.opcode.mnemonic().to_string(),
                arity: 1,
            }),
        }
    }

    fn execute_memory(
        &self,
        instr: &InstrRef,
        call_history: &CallHistory,
        value_expr: &ExprRef,
        address: &ExprRef,
        symbolic_error: bool,
    ) -> Result<Option<VersionedValueRef>> {
        match instr.opcode {
            Opcode::Load => {
                let address_value =
                    self.resolve_operand(instr, 0, address, call_history, symbolic_error)?;
                if !address_value.is_pointer() {
                    // First sight of this address as a pointer: give it an
                    // allocation of unknown extent.
                    address_value.add_location(MemoryLocation::create(
                        &instr.operands[0],
                        call_history.clone(),
                        Rc::clone(address),
                        0,
                        self.ids.next(),
                    ));
                }
                let result = self.register(&instr.result, Rc::clone(value_expr));
                result.set_load_address(&address_value);
                for loc in address_value.locations() {
                    match self.read_store(&loc)? {
                        Some((_, stored))
                            if stored.expr().width() == value_expr.width() =>
                        {
                            Self::flow_via(&stored, &result, &loc);
                        }
                        _ => {
                            // First touch: the location's content is this
                            // load's own result from now on.
                            self.update_store(&loc, &address_value, &result)?;
                        }
                    }
                }
                Ok(Some(result))
            }
            Opcode::Store => {
                let data = match self.latest_value(&instr.operands[0], call_history, value_expr)
                {
                    Some(v) => v,
                    None => self.register(&instr.operands[0], Rc::clone(value_expr)),
                };
                let address_value =
                    match self.latest_value(&instr.operands[1], call_history, address) {
                        Some(v) if v.is_pointer() => v,
                        Some(v) => {
                            v.add_location(MemoryLocation::create(
                                &instr.operands[1],
                                call_history.clone(),
                                Rc::clone(address),
                                0,
                                self.ids.next(),
                            ));
                            v
                        }
                        None => self.new_pointer_value(
                            &instr.operands[1],
                            call_history,
                            Rc::clone(address),
                            0,
                        ),
                    };
                for loc in address_value.locations() {
                    self.update_store(&loc, &address_value, &data)?;
                }
                Ok(None)
            }
            _ => Err(EngineError::UnhandledOpcode {
                opcode: instr.opcode.mnemonic().to_string(),
                arity: 2,
            }),
        }
    }

    fn execute_ternary(
        &self,
        instr: &InstrRef,
        call_history: &CallHistory,
        args: &[ExprRef],
        symbolic_error: bool,
    ) -> Result<Option<VersionedValueRef>> {
        let result_expr = &args[0];
        match &instr.opcode {
            Opcode::Select => {
                let op1 = self.operand_value(instr, 1, &args[1], call_history, symbolic_error);
                let op2 = self.operand_value(instr, 2, &args[2], call_history, symbolic_error);
                let result = self.register(&instr.result, Rc::clone(result_expr));
                if let Some(v) = op1 {
                    Self::flow(&v, &result);
                }
                if let Some(v) = op2 {
                    Self::flow(&v, &result);
                }
                Ok(Some(result))
            }
            Opcode::GetElementPtr => {
                let base_addr = &args[1];
                let offset_delta = &args[2];
                let source =
                    match self.latest_value(&instr.operands[0], call_history, base_addr) {
                        Some(v) if v.is_pointer() => v,
                        Some(v) => {
                            v.add_location(MemoryLocation::create(
                                &instr.operands[0],
                                call_history.clone(),
                                Rc::clone(base_addr),
                                0,
                                self.ids.next(),
                            ));
                            v
                        }
                        None if symbolic_error || instr.operands[0].is_constant() => self
                            .new_pointer_value(
                                &instr.operands[0],
                                call_history,
                                Rc::clone(base_addr),
                                0,
                            ),
                        None => {
                            return Err(EngineError::OperandNotFound {
                                instr: instr.id,
                                operand: 0,
                            })
                        }
                    };
                let result = self.register(&instr.result, Rc::clone(result_expr));
                let mut consistent = vec![];
                for loc in source.locations() {
                    let child = MemoryLocation::with_offset(&loc, Rc::clone(offset_delta));
                    // Keep only offsets consistent with address - base when
                    // everything is concrete.
                    if result_expr.is_const() && child.has_constant_address() {
                        if child.address() == *result_expr {
                            consistent.push(child);
                        }
                    } else {
                        consistent.push(child);
                    }
                }
                if consistent.is_empty() {
                    // The concrete filter rejected everything; fall back to
                    // the unfiltered displacements but give up on bounds.
                    for loc in source.locations() {
                        result
                            .add_location(MemoryLocation::with_offset(&loc, Rc::clone(offset_delta)));
                    }
                    result.disable_bound_interpolation();
                } else {
                    for child in consistent {
                        result.add_location(child);
                    }
                }
                result.add_source(&source);
                Ok(Some(result))
            }
            op if op.is_binary() => {
                let non_pointer = matches!(op, Opcode::ICmp(_) | Opcode::FCmp(_));
                let op1 = self.operand_value(instr, 0, &args[1], call_history, symbolic_error);
                let op2 = self.operand_value(instr, 1, &args[2], call_history, symbolic_error);
                let result = self.register(&instr.result, Rc::clone(result_expr));
                for v in [op1, op2].into_iter().flatten() {
                    if non_pointer {
                        Self::flow_non_pointer(&v, &result);
                    } else {
                        Self::flow(&v, &result);
                    }
                }
                Ok(Some(result))
            }
            _ => Err(EngineError::UnhandledOpcode {
                opcode: instr.opcode.mnemonic().to_string(),
                arity: 3,
            }),
        }
    }

    /// PHI: flow the value of the incoming edge the interpreter took.
    pub fn execute_phi(
        &self,
        instr: &InstrRef,
        incoming_index: usize,
        call_history: &CallHistory,
        value_expr: &ExprRef,
        symbolic_error: bool,
    ) -> Result<Option<VersionedValueRef>> {
        let incoming = &instr.operands[incoming_index];
        match self.operand_value(instr, incoming_index, value_expr, call_history, symbolic_error)
        {
            Some(source) => {
                let result = self.register(&instr.result, Rc::clone(value_expr));
                Self::flow(&source, &result);
                Ok(Some(result))
            }
            None if incoming.is_constant() => {
                Ok(Some(self.register(&instr.result, Rc::clone(value_expr))))
            }
            None => Err(EngineError::OperandNotFound {
                instr: instr.id,
                operand: incoming_index,
            }),
        }
    }

    // ----- external calls -----

    fn execute_call(
        &self,
        instr: &InstrRef,
        callee: &str,
        call_history: &CallHistory,
        args: &[ExprRef],
        _symbolic_error: bool,
    ) -> Result<Option<VersionedValueRef>> {
        let result_expr = args.first().cloned().unwrap_or_else(Expr::true_);
        let has_result = !matches!(instr.result.ty, TypeDesc::Void);

        let const_of = |e: &ExprRef| e.as_const().map(|(v, _)| v);

        match callee {
            // new / new[]
            "_Znwm" | "_Znam" => {
                let size = args.get(1).and_then(const_of).unwrap_or(0);
                Ok(Some(self.new_pointer_value(
                    &instr.result,
                    call_history,
                    result_expr,
                    size,
                )))
            }
            "malloc" => {
                // Two forms: size argument present, or only the address of
                // the fresh object is known.
                let size = args.get(1).and_then(const_of).unwrap_or(0);
                Ok(Some(self.new_pointer_value(
                    &instr.result,
                    call_history,
                    result_expr,
                    size,
                )))
            }
            "calloc" => {
                let n = args.get(1).and_then(const_of).unwrap_or(0);
                let m = args.get(2).and_then(const_of).unwrap_or(0);
                Ok(Some(self.new_pointer_value(
                    &instr.result,
                    call_history,
                    result_expr,
                    n * m,
                )))
            }
            "realloc" => {
                let result = self.register(&instr.result, result_expr);
                if let Some(arg) = args.get(1) {
                    if let Some(v) = self.latest_value(&instr.operands[0], call_history, arg) {
                        Self::flow(&v, &result);
                    }
                }
                Ok(Some(result))
            }
            "getenv" | "__errno_location" | "__ctype_b_loc" => Ok(Some(
                self.new_pointer_value(&instr.result, call_history, result_expr, 0),
            )),
            "getpagesize" | "geteuid" => {
                Ok(Some(self.register(&instr.result, result_expr)))
            }
            "puts" | "fflush" | "printf" | "vprintf" | "ioctl" | "fchmodat" | "fchownat"
            | "strcmp" | "strncmp" | "syscall" | "__ctype_b_locargs" | "fopen" | "fclose"
            | "fread" | "fwrite" | "fgets" | "fputs" | "fputc" | "fgetc" | "fseek" | "ftell" => {
                // Result depends on every argument; memory reached through
                // pointer arguments is assumed checked inside the callee.
                let result = self.register(&instr.result, result_expr);
                for (operand, arg) in instr.operands.iter().zip(args.iter().skip(1)) {
                    if let Some(v) = self.latest_value(operand, call_history, arg) {
                        Self::flow_non_pointer(&v, &result);
                    }
                }
                if has_result {
                    Ok(Some(result))
                } else {
                    Ok(None)
                }
            }
            name if name.starts_with("klee_get_value") => {
                let result = self.register(&instr.result, result_expr);
                if let Some(arg) = args.get(1) {
                    if let Some(v) = self.latest_value(&instr.operands[0], call_history, arg) {
                        Self::flow(&v, &result);
                    }
                }
                Ok(Some(result))
            }
            name => {
                warn!(
                    callee = name,
                    instr = instr.id,
                    "unknown external function; arguments not linked to result"
                );
                if has_result {
                    Ok(Some(self.register(&instr.result, result_expr)))
                } else {
                    Ok(None)
                }
            }
        }
    }

    // ----- call binding -----

    /// Record the expressions of a call's arguments and bind them to the
    /// callee's parameters; pushes a store frame for the callee.
    pub fn bind_call_arguments(
        &self,
        site: &InstrRef,
        call_history: &CallHistory,
        args: &[ExprRef],
        params: &[ValueDescRef],
    ) {
        let mut staged = vec![];
        for (i, param_expr) in args.iter().enumerate() {
            let v = self
                .latest_value(&site.operands[i], call_history, param_expr)
                .or_else(|| Some(self.register(&site.operands[i], Rc::clone(param_expr))));
            staged.push(v);
        }
        *self.argument_values.borrow_mut() = staged;

        self.push_frame(site.id);

        let staged = self.argument_values.borrow_mut().drain(..).collect::<Vec<_>>();
        for (param, arg_value) in params.iter().zip(staged) {
            if let Some(arg_value) = arg_value {
                let bound = self.register(param, arg_value.expr());
                Self::flow(&arg_value, &bound);
            }
        }
    }

    /// Propagate the callee's return value to the callsite value; pops the
    /// callee's store frame.
    pub fn bind_return_value(
        &self,
        site: &InstrRef,
        call_history: &CallHistory,
        ret: &InstrRef,
        return_expr: Option<&ExprRef>,
    ) {
        if let (Opcode::Ret { has_value: true }, Some(expr)) = (&ret.opcode, return_expr) {
            if let Some(returned) = self.latest_value(&ret.operands[0], call_history, expr) {
                let result = self.register(&site.result, Rc::clone(expr));
                Self::flow(&returned, &result);
            }
        }
        self.pop_frame();
    }

    // ----- marking -----

    /// Mark the transitive flow closure of `value` as core, and record the
    /// allocations it depends on in `graph`.
    pub fn mark_all_values(&self, graph: &mut AllocationGraph, value: &VersionedValueRef, reason: &str) {
        self.build_allocation_graph(graph, value);
        for v in flow_closure(value) {
            v.mark_core(reason);
        }
    }

    /// Mark by program value: the latest version is resolved first.
    pub fn mark_value_by_id(&self, graph: &mut AllocationGraph, id: ValueId, reason: &str) {
        if let Some(v) = self.latest_value_no_constant_check(id) {
            self.mark_all_values(graph, &v, reason);
        }
    }

    /// Pointer-flow marking with slackening: additionally record for every
    /// location of every marked pointer the bound under which the passed
    /// memory check keeps it safe.
    pub fn mark_all_pointer_values(
        &self,
        graph: &mut AllocationGraph,
        value: &VersionedValueRef,
        bounds: &mut BTreeSet<ExprRef>,
        reason: &str,
    ) {
        self.build_allocation_graph(graph, value);
        for v in flow_closure(value) {
            v.mark_core(reason);
            if self.config.no_bound_interpolation || !v.bound_interpolation_usable() {
                continue;
            }
            for loc in v.locations() {
                if !loc.adjust_offset_bound(bounds) {
                    debug!(
                        location = %loc,
                        "offset bound unusable; exact addresses will be used"
                    );
                }
            }
        }
    }

    // ----- allocation graph -----

    /// Direct allocation sources of `value`: flow edges labelled with a
    /// location, with unlabelled edges resolved transitively. A value with
    /// no labelled edges anywhere contributes its own locations.
    fn direct_allocation_sources(
        &self,
        value: &VersionedValueRef,
    ) -> Vec<(Option<VersionedValueRef>, LocationRef)> {
        let mut out = vec![];
        for src in value.sources() {
            match src.via {
                Some(via) => out.push((Some(src.value), via)),
                None => {
                    let sub = self.direct_allocation_sources(&src.value);
                    if sub.is_empty() {
                        for loc in src.value.locations() {
                            out.push((Some(Rc::clone(&src.value)), loc));
                        }
                    } else {
                        out.extend(sub);
                    }
                }
            }
        }
        if out.is_empty() {
            // No labelled flow: fall back to the cell this value sits in,
            // then to the value's own allocations.
            if let Some(loc) = self.location_storing(value) {
                out.push((None, loc));
            } else {
                for loc in value.locations() {
                    out.push((None, loc));
                }
            }
        }
        out
    }

    /// The location whose stored value is `value`, if any frame holds one.
    fn location_storing(&self, value: &VersionedValueRef) -> Option<LocationRef> {
        let mut frames = vec![Rc::clone(&self.global_frame)];
        frames.extend(self.stack.borrow().iter().cloned());
        for frame in frames {
            for (loc, (_, stored)) in frame.effective_concrete() {
                if stored.version() == value.version() {
                    return Some(loc);
                }
            }
            for (loc, (_, stored)) in frame.effective_symbolic() {
                if stored.version() == value.version() {
                    return Some(loc);
                }
            }
        }
        None
    }

    fn build_allocation_graph_from(
        &self,
        graph: &mut AllocationGraph,
        source: Option<VersionedValueRef>,
        alloc: &LocationRef,
    ) {
        let Some(source) = source else { return };
        for (next, loc) in self.direct_allocation_sources(&source) {
            if !Rc::ptr_eq(&loc, alloc) {
                graph.add_edge(&loc, alloc);
                self.build_allocation_graph_from(graph, next, &loc);
            }
        }
    }

    /// Seed the allocation graph with the allocations `value` directly
    /// depends on and grow it backwards through the flow edges.
    pub fn build_allocation_graph(&self, graph: &mut AllocationGraph, value: &VersionedValueRef) {
        for (source, loc) in self.direct_allocation_sources(value) {
            graph.add_sink(&loc);
            self.build_allocation_graph_from(graph, source, &loc);
        }
    }

    // ----- snapshots -----

    /// The locations known to this state and the expressions stored there,
    /// split into the concretely-addressed and symbolically-addressed parts.
    ///
    /// With `core_only`, only values marked core are returned and (unless
    /// existentials are disabled) their expressions are rewritten to shadow
    /// arrays, feeding `replacements`.
    pub fn get_stored_expressions(
        &self,
        call_history: &CallHistory,
        shadow: &ShadowRegistry,
        replacements: &mut Vec<ArrayRef>,
        core_only: bool,
    ) -> (ConcreteStoreSnapshot, SymbolicStoreSnapshot) {
        let mut concrete: ConcreteStoreSnapshot = ConcreteStoreSnapshot::new();
        let mut symbolic: SymbolicStoreSnapshot = SymbolicStoreSnapshot::new();
        let shadowing = core_only && !self.config.no_existential;

        let mut frames = vec![Rc::clone(&self.global_frame)];
        frames.extend(self.stack.borrow().iter().cloned());

        for frame in frames {
            for (loc, (_, value)) in frame.effective_concrete() {
                if !loc.context.is_prefix_of(call_history) {
                    continue;
                }
                if core_only && !value.is_core() {
                    continue;
                }
                let stored = if shadowing {
                    StoredValue::shadowed(&value, shadow, replacements)
                } else {
                    StoredValue::plain(&value)
                };
                concrete
                    .entry(loc.context.clone())
                    .or_default()
                    .insert(StoredAddress::new(Rc::clone(&loc)), stored);
            }
            for (loc, (_, value)) in frame.effective_symbolic() {
                if !loc.context.is_prefix_of(call_history) {
                    continue;
                }
                if core_only && !value.is_core() {
                    continue;
                }
                let (key_loc, stored) = if shadowing {
                    (
                        MemoryLocation::shadowed(&loc, shadow, replacements),
                        StoredValue::shadowed(&value, shadow, replacements),
                    )
                } else {
                    (Rc::clone(&loc), StoredValue::plain(&value))
                };
                symbolic
                    .entry(loc.context.clone())
                    .or_default()
                    .push((StoredAddress::new(key_loc), stored));
            }
        }
        (concrete, symbolic)
    }

    /// The latest expression stored for an allocation site, preferring the
    /// deepest (longest call history) incarnation. Used when instantiating
    /// weakest-precondition variables at a subsumption point.
    #[must_use]
    pub fn latest_value_of_site(&self, site: ValueId) -> Option<ExprRef> {
        let mut best: Option<(usize, ExprRef)> = None;
        let mut frames = vec![Rc::clone(&self.global_frame)];
        frames.extend(self.stack.borrow().iter().cloned());
        for frame in frames {
            for (loc, (_, value)) in frame.effective_concrete() {
                if loc.context.site == site {
                    let depth = loc.context.call_history.len();
                    if best.as_ref().map_or(true, |(d, _)| depth >= *d) {
                        best = Some((depth, value.expr()));
                    }
                }
            }
        }
        best.map(|(_, e)| e)
    }

    /// Allocation context lookup for a site, used by the WP table update.
    #[must_use]
    pub fn deepest_context_of_site(&self, site: ValueId) -> Option<AllocationContext> {
        let mut best: Option<AllocationContext> = None;
        let mut frames = vec![Rc::clone(&self.global_frame)];
        frames.extend(self.stack.borrow().iter().cloned());
        for frame in frames {
            for (loc, _) in frame.effective_concrete() {
                if loc.context.site == site {
                    let better = best
                        .as_ref()
                        .map_or(true, |b| loc.context.call_history.len() >= b.call_history.len());
                    if better {
                        best = Some(loc.context.clone());
                    }
                }
            }
        }
        best
    }

    #[must_use]
    pub fn target_data(&self) -> &TargetData {
        &self.target_data
    }

    #[must_use]
    pub fn config(&self) -> &InterpConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::{Instruction, IntPredicate, ValueDesc, ValueKind};
    use itp_ir::ArrayCache;

    fn root_dep() -> DependencyRef {
        Dependency::root(
            Rc::new(TargetData::default()),
            Rc::new(InterpConfig::default()),
            IdSource::new(),
        )
    }

    fn int_ty(bits: u32) -> TypeDesc {
        TypeDesc::Int { bits }
    }

    fn instr_value(id: u64, name: &str, ty: TypeDesc) -> ValueDescRef {
        Rc::new(ValueDesc {
            id: ValueId(id),
            name: name.to_string(),
            kind: ValueKind::Instruction,
            ty,
        })
    }

    fn argument(id: u64, name: &str) -> ValueDescRef {
        Rc::new(ValueDesc {
            id: ValueId(id),
            name: name.to_string(),
            kind: ValueKind::Argument { of_main: false },
            ty: int_ty(32),
        })
    }

    #[test]
    fn test_lookup_falls_through_to_parent() {
        let parent = root_dep();
        let x = instr_value(1, "x", int_ty(32));
        let v = parent.register(&x, Expr::constant(1, 32));
        let child = Dependency::child(&parent);
        let found = child
            .latest_value_no_constant_check(ValueId(1))
            .expect("inherited");
        assert_eq!(found.version(), v.version());
    }

    #[test]
    fn test_local_version_shadows_parent() {
        let parent = root_dep();
        let x = instr_value(1, "x", int_ty(32));
        parent.register(&x, Expr::constant(1, 32));
        let child = Dependency::child(&parent);
        let newer = child.register(&x, Expr::constant(2, 32));
        let found = child
            .latest_value_no_constant_check(ValueId(1))
            .expect("local");
        assert_eq!(found.version(), newer.version());
        // The parent still sees its own version.
        let parent_found = parent
            .latest_value_no_constant_check(ValueId(1))
            .expect("parent");
        assert_eq!(parent_found.expr().as_const(), Some((1, 32)));
    }

    #[test]
    fn test_conditional_branch_marks_condition_flow() {
        let dep = root_dep();
        let cache = ArrayCache::new();
        let sym = Expr::zext(
            Expr::read(
                itp_ir::UpdateList::new(cache.create("n", 4)),
                Expr::constant(0, 32),
            ),
            32,
        );

        let cmp = Instruction::new(
            1,
            Opcode::ICmp(IntPredicate::Eq),
            instr_value(1, "c", int_ty(1)),
            vec![argument(10, "n"), argument(11, "m")],
            "f",
        );
        dep.execute(
            &cmp,
            &vec![],
            &[Expr::bool_const(true), Rc::clone(&sym), Expr::constant(0, 32)],
            false,
        )
        .expect("icmp");

        let br = Instruction::new(
            2,
            Opcode::Br { conditional: true },
            instr_value(2, "", TypeDesc::Void),
            vec![Rc::clone(&cmp.result)],
            "f",
        );
        dep.execute(&br, &vec![], &[], false).expect("br");

        // The comparison and both operands are core.
        for id in [1u64, 10, 11] {
            let v = dep
                .latest_value_no_constant_check(ValueId(id))
                .expect("value");
            assert!(v.is_core(), "value {id} must be core");
            assert!(!v.reasons().is_empty());
        }
    }

    #[test]
    fn test_unhandled_arity_is_an_error() {
        let dep = root_dep();
        let bad = Instruction::new(
            1,
            Opcode::Select,
            instr_value(1, "s", int_ty(32)),
            vec![],
            "f",
        );
        let args = vec![Expr::constant(0, 32); 5];
        assert!(matches!(
            dep.execute(&bad, &vec![], &args, false),
            Err(EngineError::UnhandledOpcode { .. })
        ));
    }

    #[test]
    fn test_missing_operand_is_an_error_without_recovery() {
        let dep = root_dep();
        let zext = Instruction::new(
            1,
            Opcode::ZExt,
            instr_value(1, "z", int_ty(64)),
            vec![instr_value(99, "ghost", int_ty(32))],
            "f",
        );
        let r = dep.execute(&zext, &vec![], &[Expr::constant(0, 64)], false);
        assert!(matches!(r, Err(EngineError::OperandNotFound { .. })));
        // With the symbolic-error flag the operand materializes instead.
        let r = dep.execute(&zext, &vec![], &[Expr::constant(0, 64)], true);
        assert!(r.expect("recovered").is_some());
    }

    #[test]
    fn test_allocation_graph_reaches_via_labelled_sources() {
        let dep = root_dep();
        let a = instr_value(1, "a", TypeDesc::Pointer {
            elem: Box::new(int_ty(32)),
        });
        let alloca = Instruction::new(
            1,
            Opcode::Alloca { size: 4 },
            Rc::clone(&a),
            vec![],
            "f",
        );
        dep.execute(&alloca, &vec![], &[Expr::constant(0x1000, 64)], false)
            .expect("alloca");

        let ld = Instruction::new(
            2,
            Opcode::Load,
            instr_value(2, "v", int_ty(32)),
            vec![Rc::clone(&a)],
            "f",
        );
        let loaded = dep
            .execute(
                &ld,
                &vec![],
                &[Expr::constant(0, 32), Expr::constant(0x1000, 64)],
                false,
            )
            .expect("load")
            .expect("value");

        let mut graph = AllocationGraph::new();
        dep.build_allocation_graph(&mut graph, &loaded);
        let pointer = dep
            .latest_value_no_constant_check(ValueId(1))
            .expect("a");
        assert!(graph.contains(&pointer.locations()[0]));
    }
}
