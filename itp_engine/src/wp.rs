//! Weakest-precondition pass
//!
//! A backward pass over the instruction list recorded while a basic block
//! was explored. Starting from `true` at the bottom, taken branches conjoin
//! their condition, not-taken branches the negation, and stores substitute
//! the stored value for the address variable; everything else is forwarded
//! untouched. The result is a formula over fresh symbolic arrays (one per
//! touched allocation context) that implies the observed behaviour and can
//! replace a deletion interpolant in a table entry.

use crate::dependency::Dependency;
use crate::instr::{InstrRef, IntPredicate, Opcode, Program, ValueDescRef, ValueId, ValueKind};
use crate::memory::AllocationContext;
use crate::table::TableEntry;
use itp_ir::expr::{Expr, ExprRef, UpdateList};
use itp_ir::{
    collect_arrays, simplify_not, substitute, substitute_array, ArrayCache, ArrayRef, BinOp,
    CmpOp, EngineError, Result, ShadowRegistry,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use tracing::warn;

/// How a recorded instruction participates in the WP computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WpFlag {
    /// Forwarded (substitution handles its effect, if any)
    Ignore,
    /// A conditional branch whose true edge was taken
    Taken,
    /// A conditional branch whose false edge was taken
    NotTaken,
}

/// Map from allocation contexts to the fresh array (and its read
/// expression) standing for that memory in the WP formula.
#[derive(Debug)]
pub struct WpArrayStore {
    cache: Rc<ArrayCache>,
    entries: BTreeMap<AllocationContext, (ArrayRef, ExprRef)>,
}

impl WpArrayStore {
    #[must_use]
    pub fn new(cache: Rc<ArrayCache>) -> Self {
        Self {
            cache,
            entries: BTreeMap::new(),
        }
    }

    /// Create the symbolic variable for an allocation context: a fresh array
    /// read byte by byte (little-endian) and concatenated up to the cell
    /// width. Insertion is idempotent per context.
    pub fn create_and_insert(
        &mut self,
        context: AllocationContext,
        name: &str,
        cell_bits: u32,
        total_bits: u64,
        offset: Option<ExprRef>,
    ) -> Result<ExprRef> {
        if let Some((_, expr)) = self.entries.get(&context) {
            if offset.is_none() {
                return Ok(Rc::clone(expr));
            }
        }
        if cell_bits == 0 || cell_bits % 8 != 0 {
            return Err(EngineError::Unsupported(format!(
                "weakest-precondition variable of width {cell_bits}"
            )));
        }
        let array = self.cache.create(name, (total_bits + 7) / 8);
        let num_bytes = cell_bits / 8;
        let mut expr: Option<ExprRef> = None;
        for i in 0..num_bytes {
            let mut index = Expr::constant(u64::from(i), array.domain_width);
            if let Some(off) = &offset {
                index = Expr::binary(
                    BinOp::Add,
                    Expr::zext(Rc::clone(off), array.domain_width),
                    index,
                );
            }
            let byte = Expr::read(UpdateList::new(Rc::clone(&array)), index);
            expr = Some(match expr {
                // Little-endian: later bytes occupy higher bits.
                Some(acc) => Expr::concat(byte, acc),
                None => byte,
            });
        }
        let expr = expr.expect("cell width is at least one byte");
        self.entries
            .insert(context, (array, Rc::clone(&expr)));
        Ok(expr)
    }

    #[must_use]
    pub fn contains(&self, context: &AllocationContext) -> bool {
        self.entries.contains_key(context)
    }

    #[must_use]
    pub fn array_of(&self, context: &AllocationContext) -> Option<ArrayRef> {
        self.entries.get(context).map(|(a, _)| Rc::clone(a))
    }

    #[must_use]
    pub fn expr_of(&self, context: &AllocationContext) -> Option<ExprRef> {
        self.entries.get(context).map(|(_, e)| Rc::clone(e))
    }

    /// The allocation context whose variable is backed by `array`.
    #[must_use]
    pub fn context_of_array(&self, array: &ArrayRef) -> Option<AllocationContext> {
        self.entries
            .iter()
            .find(|(_, (a, _))| a.id == array.id)
            .map(|(ctx, _)| ctx.clone())
    }

    /// The allocation context of a `Read`/`Concat` WP variable.
    #[must_use]
    pub fn context_of_expr(&self, expr: &ExprRef) -> Option<AllocationContext> {
        let mut arrays = BTreeSet::new();
        collect_arrays(expr, &mut arrays);
        for array in arrays {
            if let Some(ctx) = self.context_of_array(&array) {
                return Some(ctx);
            }
        }
        warn!(expr = %expr, "no WP array store entry backs this expression");
        None
    }

    /// Merge a child's store into this one. Contexts unknown here move over;
    /// contexts present on both sides substitute the child's array with this
    /// store's inside `child_wp`.
    #[must_use]
    pub fn merge(&mut self, child: WpArrayStore, mut child_wp: ExprRef) -> ExprRef {
        for (context, (array, expr)) in child.entries {
            match self.entries.get(&context) {
                None => {
                    self.entries.insert(context, (array, expr));
                }
                Some((ours, _)) => {
                    child_wp = substitute_array(&child_wp, &array, ours);
                }
            }
        }
        child_wp
    }

    /// Every read symbol of `wp` must have a backing array here.
    pub fn sanity_check(&self, wp: &ExprRef) -> Result<()> {
        let mut arrays = BTreeSet::new();
        collect_arrays(wp, &mut arrays);
        for array in arrays {
            if self.context_of_array(&array).is_none() {
                return Err(EngineError::UnhandledKind(format!(
                    "WP variable {} has no backing array-store entry",
                    array.name
                )));
            }
        }
        Ok(())
    }
}

/// The push-up computation over one node's recorded instruction list.
pub struct WpPass<'a> {
    program: &'a Program,
    store: WpArrayStore,
    phi_choices: HashMap<ValueId, usize>,
}

impl<'a> WpPass<'a> {
    #[must_use]
    pub fn new(program: &'a Program, cache: Rc<ArrayCache>) -> Self {
        Self {
            program,
            store: WpArrayStore::new(cache),
            phi_choices: HashMap::new(),
        }
    }

    /// Provide the PHI incoming choices recorded during execution.
    #[must_use]
    pub fn with_phi_choices(mut self, phi_choices: HashMap<ValueId, usize>) -> Self {
        self.phi_choices = phi_choices;
        self
    }

    #[must_use]
    pub fn store(&self) -> &WpArrayStore {
        &self.store
    }

    #[must_use]
    pub fn into_store(self) -> WpArrayStore {
        self.store
    }

    /// Push the weakest precondition from the bottom of the recorded list
    /// up to its top.
    pub fn push_up(&mut self, recorded: &[(InstrRef, WpFlag)]) -> Result<ExprRef> {
        let mut wp = Expr::true_();
        for (instr, flag) in recorded.iter().rev() {
            match flag {
                WpFlag::Taken => {
                    let cond = simplify_not(self.branch_condition(instr)?);
                    wp = if wp.is_true() { cond } else { Expr::and(wp, cond) };
                }
                WpFlag::NotTaken => {
                    let cond = simplify_not(Expr::not(self.branch_condition(instr)?));
                    wp = if wp.is_true() { cond } else { Expr::and(wp, cond) };
                }
                WpFlag::Ignore => {
                    if instr.opcode == Opcode::Store {
                        wp = self.apply_store(&wp, instr)?;
                    }
                }
            }
        }
        Ok(wp)
    }

    /// `wp[value/address]` for a store whose address the formula mentions.
    fn apply_store(&mut self, wp: &ExprRef, instr: &InstrRef) -> Result<ExprRef> {
        let address_var = self.expr_from_value(&instr.operands[1], None)?;
        if !crate::table::contains_subexpr(wp, &address_var) {
            return Ok(Rc::clone(wp));
        }
        let value = self.expr_from_value(&instr.operands[0], None)?;
        Ok(substitute(wp, &address_var, &value))
    }

    /// The condition of a conditional branch, as a boolean expression.
    fn branch_condition(&mut self, instr: &InstrRef) -> Result<ExprRef> {
        if !matches!(instr.opcode, Opcode::Br { conditional: true }) {
            return Err(EngineError::UnhandledKind(format!(
                "branch condition of non-branch {}",
                instr.opcode.mnemonic()
            )));
        }
        self.condition_of(&instr.operands[0])
    }

    fn condition_of(&mut self, value: &ValueDescRef) -> Result<ExprRef> {
        let Some(def) = self.program.def(value.id) else {
            return Err(EngineError::Unsupported(format!(
                "branch condition without a recorded definition: {}",
                value.name
            )));
        };
        match &def.opcode {
            Opcode::ICmp(pred) => self.cmp_condition(&def, *pred),
            Opcode::FCmp(_) => Err(EngineError::Unsupported(
                "floating-point predicate in weakest precondition".to_string(),
            )),
            Opcode::And => {
                let l = self.condition_of(&def.operands[0])?;
                let r = self.condition_of(&def.operands[1])?;
                Ok(Expr::and(l, r))
            }
            Opcode::Or => {
                let l = self.condition_of(&def.operands[0])?;
                let r = self.condition_of(&def.operands[1])?;
                Ok(Expr::or(l, r))
            }
            other => Err(EngineError::Unsupported(format!(
                "branch condition defined by {}",
                other.mnemonic()
            ))),
        }
    }

    fn cmp_condition(&mut self, cmp: &InstrRef, pred: IntPredicate) -> Result<ExprRef> {
        let left = self.expr_from_value(&cmp.operands[0], None)?;
        let right = self.expr_from_value(&cmp.operands[1], None)?;
        let op = match pred {
            IntPredicate::Eq => CmpOp::Eq,
            IntPredicate::Ne => CmpOp::Ne,
            IntPredicate::Ugt => CmpOp::Ugt,
            IntPredicate::Uge => CmpOp::Uge,
            IntPredicate::Ult => CmpOp::Ult,
            IntPredicate::Ule => CmpOp::Ule,
            IntPredicate::Sgt => CmpOp::Sgt,
            IntPredicate::Sge => CmpOp::Sge,
            IntPredicate::Slt => CmpOp::Slt,
            IntPredicate::Sle => CmpOp::Sle,
        };
        Ok(Expr::cmp(op, left, right))
    }

    /// The symbolic variable for a memory address value.
    fn wp_variable(
        &mut self,
        address: &ValueDescRef,
        offset: Option<ExprRef>,
    ) -> Result<ExprRef> {
        let cell_bits = address.ty.cell_bits().ok_or_else(|| {
            EngineError::Unsupported(format!(
                "weakest-precondition variable for type of {}",
                address.name
            ))
        })?;
        let total_bits = address.ty.total_bits().unwrap_or(u64::from(cell_bits));
        let context = AllocationContext::new(address, vec![]);
        self.store
            .create_and_insert(context, &address.name, cell_bits, total_bits, offset)
    }

    /// Synthesize the expression of an operand by walking its definition.
    fn expr_from_value(
        &mut self,
        value: &ValueDescRef,
        offset: Option<ExprRef>,
    ) -> Result<ExprRef> {
        match &value.kind {
            ValueKind::ConstantInt { value: c } => {
                let width = match value.ty {
                    crate::instr::TypeDesc::Int { bits } => bits,
                    _ if *c <= u64::from(u8::MAX) => 8,
                    _ if *c <= u64::from(u16::MAX) => 16,
                    _ if *c <= u64::from(u32::MAX) => 32,
                    _ => 64,
                };
                Ok(Expr::constant(*c, width))
            }
            ValueKind::Global => self.wp_variable(value, offset),
            ValueKind::Argument { .. } => Err(EngineError::Unsupported(format!(
                "function argument {} in weakest precondition",
                value.name
            ))),
            ValueKind::ConstantPointer => Err(EngineError::Unsupported(format!(
                "constant pointer {} in weakest precondition",
                value.name
            ))),
            ValueKind::Instruction => {
                let Some(def) = self.program.def(value.id) else {
                    return Err(EngineError::Unsupported(format!(
                        "operand {} without a recorded definition",
                        value.name
                    )));
                };
                self.expr_from_def(&def, offset)
            }
        }
    }

    fn expr_from_def(&mut self, def: &InstrRef, offset: Option<ExprRef>) -> Result<ExprRef> {
        match &def.opcode {
            Opcode::Load => {
                let inner = &def.operands[0];
                if let Some(inner_def) = self.program.def(inner.id) {
                    match &inner_def.opcode {
                        Opcode::GetElementPtr => {
                            let gep_offset = self.expr_from_value(&inner_def.operands[1], None)?;
                            return self.expr_from_value(
                                &inner_def.operands[0],
                                Some(gep_offset),
                            );
                        }
                        Opcode::Load => {
                            return self.wp_variable(&inner_def.operands[0], offset);
                        }
                        Opcode::Alloca { .. } => {
                            return self.wp_variable(&inner_def.result, offset);
                        }
                        _ => {}
                    }
                }
                self.wp_variable(inner, offset)
            }
            Opcode::Alloca { .. } => self.wp_variable(&def.result, offset),
            Opcode::ICmp(pred) => self.cmp_condition(def, *pred),
            Opcode::ZExt => {
                let arg = self.expr_from_value(&def.operands[0], offset)?;
                let bits = def
                    .result
                    .ty
                    .cell_bits()
                    .ok_or_else(|| EngineError::Unsupported("zext to opaque type".to_string()))?;
                Ok(Expr::zext(arg, bits))
            }
            Opcode::SExt => {
                let arg = self.expr_from_value(&def.operands[0], offset)?;
                let bits = def
                    .result
                    .ty
                    .cell_bits()
                    .ok_or_else(|| EngineError::Unsupported("sext to opaque type".to_string()))?;
                Ok(Expr::sext(arg, bits))
            }
            Opcode::GetElementPtr => {
                let mut new_offset = self.expr_from_value(&def.operands[1], None)?;
                if let Some(outer) = offset {
                    let count = def.operands[0].ty.array_count();
                    let width = new_offset.width();
                    let count_expr = Expr::constant(count, width);
                    new_offset = Expr::binary(
                        BinOp::Add,
                        Expr::binary(BinOp::Mul, new_offset, count_expr),
                        Expr::zext(outer, width),
                    );
                }
                self.expr_from_value(&def.operands[0], Some(new_offset))
            }
            Opcode::Phi => {
                let Some(&choice) = self.phi_choices.get(&def.result.id) else {
                    return Err(EngineError::Unsupported(format!(
                        "phi {} without a recorded incoming edge",
                        def.result.name
                    )));
                };
                self.expr_from_value(&def.operands[choice], offset)
            }
            op if op.is_binary() => {
                let left = self.expr_from_value(&def.operands[0], None)?;
                let right = self.expr_from_value(&def.operands[1], None)?;
                let bin = match op {
                    Opcode::Add => BinOp::Add,
                    Opcode::Sub => BinOp::Sub,
                    Opcode::Mul => BinOp::Mul,
                    Opcode::UDiv => BinOp::UDiv,
                    Opcode::SDiv => BinOp::SDiv,
                    Opcode::URem => BinOp::URem,
                    Opcode::SRem => BinOp::SRem,
                    Opcode::And => BinOp::And,
                    Opcode::Or => BinOp::Or,
                    Opcode::Xor => BinOp::Xor,
                    Opcode::Shl => BinOp::Shl,
                    Opcode::LShr => BinOp::LShr,
                    Opcode::AShr => BinOp::AShr,
                    other => {
                        return Err(EngineError::Unsupported(format!(
                            "{} in weakest precondition",
                            other.mnemonic()
                        )))
                    }
                };
                Ok(Expr::binary(bin, left, right))
            }
            other => Err(EngineError::Unsupported(format!(
                "{} in weakest precondition",
                other.mnemonic()
            ))),
        }
    }
}

/// Back-substitute a WP formula at a subsumption point: every variable
/// backed by `store` is replaced by the latest value the dependency holds
/// for its allocation context. Variables without a stored value stay.
#[must_use]
pub fn instantiate_wp_expression(
    dependency: &Dependency,
    expr: &ExprRef,
    store: &WpArrayStore,
) -> ExprRef {
    match expr.as_ref() {
        Expr::Const { .. } => Rc::clone(expr),
        Expr::Read { .. } | Expr::Concat { .. } => {
            match store
                .context_of_expr(expr)
                .and_then(|ctx| dependency.latest_value_of_site(ctx.site))
            {
                Some(stored) => stored,
                None => Rc::clone(expr),
            }
        }
        Expr::Extract {
            expr: inner,
            offset,
            width,
        } => Expr::extract(
            instantiate_wp_expression(dependency, inner, store),
            *offset,
            *width,
        ),
        Expr::ZExt { expr: inner, width } => Expr::zext(
            instantiate_wp_expression(dependency, inner, store),
            *width,
        ),
        Expr::SExt { expr: inner, width } => Expr::sext(
            instantiate_wp_expression(dependency, inner, store),
            *width,
        ),
        Expr::Select {
            cond,
            true_expr,
            false_expr,
        } => Expr::select(
            instantiate_wp_expression(dependency, cond, store),
            instantiate_wp_expression(dependency, true_expr, store),
            instantiate_wp_expression(dependency, false_expr, store),
        ),
        Expr::Not(inner) => Expr::not(instantiate_wp_expression(dependency, inner, store)),
        Expr::Binary { op, left, right } => Expr::binary(
            *op,
            instantiate_wp_expression(dependency, left, store),
            instantiate_wp_expression(dependency, right, store),
        ),
        Expr::Cmp { op, left, right } => Expr::cmp(
            *op,
            instantiate_wp_expression(dependency, left, store),
            instantiate_wp_expression(dependency, right, store),
        ),
        Expr::Exists { arrays, body } => Expr::exists(
            arrays.clone(),
            instantiate_wp_expression(dependency, body, store),
        ),
    }
}

/// Drop interpolant conjuncts that mention any of `shadows`.
fn remove_shadow_exprs(expr: &ExprRef, shadows: &BTreeSet<u64>) -> Option<ExprRef> {
    if let Expr::Binary {
        op: BinOp::And,
        left,
        right,
    } = expr.as_ref()
    {
        let l = remove_shadow_exprs(left, shadows);
        let r = remove_shadow_exprs(right, shadows);
        return match (l, r) {
            (Some(l), Some(r)) => Some(Expr::and(l, r)),
            (Some(e), None) | (None, Some(e)) => Some(e),
            (None, None) => None,
        };
    }
    let mut arrays = BTreeSet::new();
    collect_arrays(expr, &mut arrays);
    if arrays.iter().any(|a| shadows.contains(&a.id)) {
        None
    } else {
        Some(Rc::clone(expr))
    }
}

/// Fold a WP interpolant into an existing table entry: the WP variables'
/// shadow arrays stop being existential, their latest concrete-store rows
/// are dropped (the WP constrains them instead), and the stored interpolant
/// loses the conjuncts that talked about them.
pub fn update_table_entry(
    entry: &mut TableEntry,
    store: &WpArrayStore,
    shadow: &ShadowRegistry,
) {
    let Some(wp) = entry.wp_interpolant() else {
        return;
    };

    let mut wp_arrays = BTreeSet::new();
    collect_arrays(&wp, &mut wp_arrays);

    // Shadow copies of the WP variables, by source name (with the pointer
    // suffix convention stripped).
    let mut shadow_ids = BTreeSet::new();
    for array in &wp_arrays {
        let trimmed = array.name.strip_suffix(".addr").unwrap_or(&array.name);
        for candidate in [array.name.as_str(), trimmed] {
            if let Some(sh) = shadow.shadow_for_name(candidate) {
                shadow_ids.insert(sh.id);
            }
        }
    }

    // The shadows stop being existentially quantified.
    let existentials: Vec<ArrayRef> = entry
        .existentials()
        .iter()
        .filter(|a| !shadow_ids.contains(&a.id))
        .cloned()
        .collect();
    entry.set_existentials(existentials);

    // Delete the latest (longest call history) concrete-store row of every
    // WP variable's allocation site.
    for array in &wp_arrays {
        let Some(context) = store.context_of_array(array) else {
            continue;
        };
        let candidate = entry
            .concrete_store()
            .keys()
            .filter(|ctx| ctx.site == context.site)
            .max_by_key(|ctx| ctx.call_history.len())
            .cloned();
        if let Some(key) = candidate {
            entry.concrete_store_mut().remove(&key);
        }
    }

    // Strip the shadow reads from the stored interpolant.
    if let Some(interpolant) = entry.interpolant() {
        entry.set_interpolant(remove_shadow_exprs(&interpolant, &shadow_ids));
    }
}
