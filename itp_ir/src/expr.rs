//! Symbolic expression algebra
//!
//! The expression language the interpolation engine manipulates: width-tagged
//! bitvector terms with array reads, casts, comparisons and existential
//! quantification. Expressions are immutable and shared behind `Rc` handles;
//! every constructor constant-folds when its operands are constants, so code
//! downstream can test `is_true`/`is_false` instead of re-evaluating.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::rc::Rc;

/// Shared handle to an expression node.
pub type ExprRef = Rc<Expr>;

/// Shared handle to a symbolic array.
pub type ArrayRef = Rc<Array>;

/// Width of a boolean expression, in bits.
pub const BOOL_WIDTH: u32 = 1;

/// A symbolic array of bytes.
///
/// Arrays are identified by `id`; two arrays with the same name but
/// different ids are distinct (the shadow registry relies on this).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Array {
    /// Unique id issued by the array cache
    pub id: u64,
    /// Human-readable name, used in rendering and shadow lookup
    pub name: String,
    /// Number of cells in the array
    pub size: u64,
    /// Width of an index expression, in bits
    pub domain_width: u32,
    /// Width of a stored cell, in bits
    pub range_width: u32,
}

/// An array plus the ordered list of symbolic writes applied to it.
///
/// Writes are stored oldest-first; a read consults the newest write whose
/// index matches before falling through to the root array.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UpdateList {
    pub root: ArrayRef,
    pub writes: Vec<(ExprRef, ExprRef)>,
}

impl UpdateList {
    #[must_use]
    pub fn new(root: ArrayRef) -> Self {
        Self {
            root,
            writes: vec![],
        }
    }

    #[must_use]
    pub fn with_writes(root: ArrayRef, writes: Vec<(ExprRef, ExprRef)>) -> Self {
        Self { root, writes }
    }
}

/// Binary bitvector operators (arithmetic and bitwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

/// Comparison operators; all produce a boolean (width-1) result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
}

impl CmpOp {
    /// The comparison with negated meaning, e.g. `Slt` ↔ `Sge`.
    #[must_use]
    pub const fn negated(self) -> Self {
        match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Ult => Self::Uge,
            Self::Ule => Self::Ugt,
            Self::Ugt => Self::Ule,
            Self::Uge => Self::Ult,
            Self::Slt => Self::Sge,
            Self::Sle => Self::Sgt,
            Self::Sgt => Self::Sle,
            Self::Sge => Self::Slt,
        }
    }
}

/// A symbolic expression.
///
/// Widths are capped at 64 bits; wider values are composed from byte-level
/// array reads with `Concat`, which is how the weakest-precondition pass
/// builds its variables.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Expr {
    /// Bitvector constant; `value` is masked to `width` bits
    Const { value: u64, width: u32 },
    /// Read of `updates` at `index`
    Read { updates: UpdateList, index: ExprRef },
    /// Concatenation; `msb` occupies the high bits
    Concat { msb: ExprRef, lsb: ExprRef },
    /// Bit extraction of `width` bits starting at `offset`
    Extract {
        expr: ExprRef,
        offset: u32,
        width: u32,
    },
    /// Zero extension to `width`
    ZExt { expr: ExprRef, width: u32 },
    /// Sign extension to `width`
    SExt { expr: ExprRef, width: u32 },
    /// If-then-else over values
    Select {
        cond: ExprRef,
        true_expr: ExprRef,
        false_expr: ExprRef,
    },
    /// Bitwise negation (boolean not at width 1)
    Not(ExprRef),
    /// Arithmetic or bitwise binary operation
    Binary {
        op: BinOp,
        left: ExprRef,
        right: ExprRef,
    },
    /// Comparison
    Cmp {
        op: CmpOp,
        left: ExprRef,
        right: ExprRef,
    },
    /// Existential quantification over the given arrays
    Exists { arrays: Vec<ArrayRef>, body: ExprRef },
}

fn mask(value: u64, width: u32) -> u64 {
    if width >= 64 {
        value
    } else {
        value & ((1u64 << width) - 1)
    }
}

fn sign_extend(value: u64, width: u32) -> i64 {
    if width >= 64 {
        value as i64
    } else {
        let shift = 64 - width;
        ((value << shift) as i64) >> shift
    }
}

impl Expr {
    /// Create a constant of the given width.
    #[must_use]
    pub fn constant(value: u64, width: u32) -> ExprRef {
        Rc::new(Self::Const {
            value: mask(value, width),
            width,
        })
    }

    /// Create a boolean constant.
    #[must_use]
    pub fn bool_const(value: bool) -> ExprRef {
        Self::constant(u64::from(value), BOOL_WIDTH)
    }

    /// The constant `true`.
    #[must_use]
    pub fn true_() -> ExprRef {
        Self::bool_const(true)
    }

    /// The constant `false`.
    #[must_use]
    pub fn false_() -> ExprRef {
        Self::bool_const(false)
    }

    /// Read from an update list at the given index.
    #[must_use]
    pub fn read(updates: UpdateList, index: ExprRef) -> ExprRef {
        Rc::new(Self::Read { updates, index })
    }

    /// Concatenate two expressions, `msb` in the high bits.
    #[must_use]
    pub fn concat(msb: ExprRef, lsb: ExprRef) -> ExprRef {
        let width = msb.width() + lsb.width();
        if let (Some((mv, _)), Some((lv, lw))) = (msb.as_const(), lsb.as_const()) {
            if width <= 64 {
                return Self::constant((mv << lw) | lv, width);
            }
        }
        Rc::new(Self::Concat { msb, lsb })
    }

    /// Extract `width` bits starting at bit `offset`.
    #[must_use]
    pub fn extract(expr: ExprRef, offset: u32, width: u32) -> ExprRef {
        if offset == 0 && width == expr.width() {
            return expr;
        }
        if let Some((v, _)) = expr.as_const() {
            return Self::constant(v >> offset, width);
        }
        Rc::new(Self::Extract {
            expr,
            offset,
            width,
        })
    }

    /// Zero-extend (or truncate) to `width` bits.
    #[must_use]
    pub fn zext(expr: ExprRef, width: u32) -> ExprRef {
        let from = expr.width();
        if width == from {
            return expr;
        }
        if width < from {
            return Self::extract(expr, 0, width);
        }
        if let Some((v, _)) = expr.as_const() {
            return Self::constant(v, width);
        }
        Rc::new(Self::ZExt { expr, width })
    }

    /// Sign-extend (or truncate) to `width` bits.
    #[must_use]
    pub fn sext(expr: ExprRef, width: u32) -> ExprRef {
        let from = expr.width();
        if width == from {
            return expr;
        }
        if width < from {
            return Self::extract(expr, 0, width);
        }
        if let Some((v, w)) = expr.as_const() {
            return Self::constant(sign_extend(v, w) as u64, width);
        }
        Rc::new(Self::SExt { expr, width })
    }

    /// Value-level if-then-else.
    #[must_use]
    pub fn select(cond: ExprRef, true_expr: ExprRef, false_expr: ExprRef) -> ExprRef {
        if cond.is_true() {
            return true_expr;
        }
        if cond.is_false() {
            return false_expr;
        }
        if true_expr == false_expr {
            return true_expr;
        }
        Rc::new(Self::Select {
            cond,
            true_expr,
            false_expr,
        })
    }

    /// Bitwise (or boolean) negation.
    #[must_use]
    pub fn not(expr: ExprRef) -> ExprRef {
        if let Some((v, w)) = expr.as_const() {
            return Self::constant(!v, w);
        }
        if let Self::Not(inner) = expr.as_ref() {
            return Rc::clone(inner);
        }
        Rc::new(Self::Not(expr))
    }

    /// Binary bitvector operation; both operands must share a width.
    #[must_use]
    pub fn binary(op: BinOp, left: ExprRef, right: ExprRef) -> ExprRef {
        let width = left.width();
        if let (Some((l, _)), Some((r, _))) = (left.as_const(), right.as_const()) {
            if let Some(v) = eval_binop(op, l, r, width) {
                return Self::constant(v, width);
            }
        }
        // Boolean identity folds keep path-condition conjunctions tidy.
        if width == BOOL_WIDTH {
            match op {
                BinOp::And => {
                    if left.is_true() {
                        return right;
                    }
                    if right.is_true() {
                        return left;
                    }
                    if left.is_false() || right.is_false() {
                        return Self::false_();
                    }
                }
                BinOp::Or => {
                    if left.is_false() {
                        return right;
                    }
                    if right.is_false() {
                        return left;
                    }
                    if left.is_true() || right.is_true() {
                        return Self::true_();
                    }
                }
                _ => {}
            }
        }
        Rc::new(Self::Binary { op, left, right })
    }

    /// Boolean conjunction.
    #[must_use]
    pub fn and(left: ExprRef, right: ExprRef) -> ExprRef {
        Self::binary(BinOp::And, left, right)
    }

    /// Boolean disjunction.
    #[must_use]
    pub fn or(left: ExprRef, right: ExprRef) -> ExprRef {
        Self::binary(BinOp::Or, left, right)
    }

    /// Conjoin onto an optional accumulator, the way interpolants are packed.
    #[must_use]
    pub fn and_opt(acc: Option<ExprRef>, expr: ExprRef) -> Option<ExprRef> {
        Some(match acc {
            Some(a) => Self::and(a, expr),
            None => expr,
        })
    }

    /// Comparison; folds on constant operands and on structurally equal ones.
    #[must_use]
    pub fn cmp(op: CmpOp, left: ExprRef, right: ExprRef) -> ExprRef {
        if let (Some((l, w)), Some((r, _))) = (left.as_const(), right.as_const()) {
            return Self::bool_const(eval_cmp(op, l, r, w));
        }
        if left == right {
            match op {
                CmpOp::Eq | CmpOp::Ule | CmpOp::Uge | CmpOp::Sle | CmpOp::Sge => {
                    return Self::true_()
                }
                CmpOp::Ne | CmpOp::Ult | CmpOp::Ugt | CmpOp::Slt | CmpOp::Sgt => {
                    return Self::false_()
                }
            }
        }
        Rc::new(Self::Cmp { op, left, right })
    }

    /// Shorthand for `cmp(Eq, ..)`.
    #[must_use]
    pub fn eq(left: ExprRef, right: ExprRef) -> ExprRef {
        Self::cmp(CmpOp::Eq, left, right)
    }

    /// Existential quantification; an empty variable list is the body itself.
    #[must_use]
    pub fn exists(arrays: Vec<ArrayRef>, body: ExprRef) -> ExprRef {
        if arrays.is_empty() || body.is_const() {
            return body;
        }
        Rc::new(Self::Exists { arrays, body })
    }

    /// Width of this expression in bits.
    #[must_use]
    pub fn width(&self) -> u32 {
        match self {
            Self::Const { width, .. } | Self::Extract { width, .. } => *width,
            Self::ZExt { width, .. } | Self::SExt { width, .. } => *width,
            Self::Read { updates, .. } => updates.root.range_width,
            Self::Concat { msb, lsb } => msb.width() + lsb.width(),
            Self::Select { true_expr, .. } => true_expr.width(),
            Self::Not(e) => e.width(),
            Self::Binary { left, .. } => left.width(),
            Self::Cmp { .. } | Self::Exists { .. } => BOOL_WIDTH,
        }
    }

    /// The constant payload, if this is a constant.
    #[must_use]
    pub fn as_const(&self) -> Option<(u64, u32)> {
        match self {
            Self::Const { value, width } => Some((*value, *width)),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_const(&self) -> bool {
        matches!(self, Self::Const { .. })
    }

    #[must_use]
    pub fn is_true(&self) -> bool {
        matches!(self, Self::Const { value: 1, width: 1 })
    }

    #[must_use]
    pub fn is_false(&self) -> bool {
        matches!(self, Self::Const { value: 0, width: 1 })
    }
}

fn eval_binop(op: BinOp, l: u64, r: u64, width: u32) -> Option<u64> {
    let v = match op {
        BinOp::Add => l.wrapping_add(r),
        BinOp::Sub => l.wrapping_sub(r),
        BinOp::Mul => l.wrapping_mul(r),
        BinOp::UDiv => l.checked_div(r)?,
        BinOp::SDiv => {
            let (ls, rs) = (sign_extend(l, width), sign_extend(r, width));
            ls.checked_div(rs)? as u64
        }
        BinOp::URem => l.checked_rem(r)?,
        BinOp::SRem => {
            let (ls, rs) = (sign_extend(l, width), sign_extend(r, width));
            ls.checked_rem(rs)? as u64
        }
        BinOp::And => l & r,
        BinOp::Or => l | r,
        BinOp::Xor => l ^ r,
        BinOp::Shl => {
            if r >= u64::from(width) {
                0
            } else {
                l << r
            }
        }
        BinOp::LShr => {
            if r >= u64::from(width) {
                0
            } else {
                l >> r
            }
        }
        BinOp::AShr => {
            let ls = sign_extend(l, width);
            if r >= u64::from(width) {
                if ls < 0 {
                    u64::MAX
                } else {
                    0
                }
            } else {
                (ls >> r) as u64
            }
        }
    };
    Some(v)
}

fn eval_cmp(op: CmpOp, l: u64, r: u64, width: u32) -> bool {
    let (ls, rs) = (sign_extend(l, width), sign_extend(r, width));
    match op {
        CmpOp::Eq => l == r,
        CmpOp::Ne => l != r,
        CmpOp::Ult => l < r,
        CmpOp::Ule => l <= r,
        CmpOp::Ugt => l > r,
        CmpOp::Uge => l >= r,
        CmpOp::Slt => ls < rs,
        CmpOp::Sle => ls <= rs,
        CmpOp::Sgt => ls > rs,
        CmpOp::Sge => ls >= rs,
    }
}

/// Replace every syntactic occurrence of `from` in `expr` with `to`.
///
/// `substitute(e, x, x)` is a fixed point.
#[must_use]
pub fn substitute(expr: &ExprRef, from: &ExprRef, to: &ExprRef) -> ExprRef {
    if expr == from {
        return Rc::clone(to);
    }
    match expr.as_ref() {
        Expr::Const { .. } => Rc::clone(expr),
        Expr::Read { updates, index } => {
            let writes = updates
                .writes
                .iter()
                .map(|(i, v)| (substitute(i, from, to), substitute(v, from, to)))
                .collect();
            Expr::read(
                UpdateList::with_writes(Rc::clone(&updates.root), writes),
                substitute(index, from, to),
            )
        }
        Expr::Concat { msb, lsb } => {
            Expr::concat(substitute(msb, from, to), substitute(lsb, from, to))
        }
        Expr::Extract {
            expr: inner,
            offset,
            width,
        } => Expr::extract(substitute(inner, from, to), *offset, *width),
        Expr::ZExt { expr: inner, width } => Expr::zext(substitute(inner, from, to), *width),
        Expr::SExt { expr: inner, width } => Expr::sext(substitute(inner, from, to), *width),
        Expr::Select {
            cond,
            true_expr,
            false_expr,
        } => Expr::select(
            substitute(cond, from, to),
            substitute(true_expr, from, to),
            substitute(false_expr, from, to),
        ),
        Expr::Not(inner) => Expr::not(substitute(inner, from, to)),
        Expr::Binary { op, left, right } => Expr::binary(
            *op,
            substitute(left, from, to),
            substitute(right, from, to),
        ),
        Expr::Cmp { op, left, right } => Expr::cmp(
            *op,
            substitute(left, from, to),
            substitute(right, from, to),
        ),
        Expr::Exists { arrays, body } => {
            Expr::exists(arrays.clone(), substitute(body, from, to))
        }
    }
}

/// Replace every read of array `from` with a read of array `to`.
#[must_use]
pub fn substitute_array(expr: &ExprRef, from: &ArrayRef, to: &ArrayRef) -> ExprRef {
    match expr.as_ref() {
        Expr::Const { .. } => Rc::clone(expr),
        Expr::Read { updates, index } => {
            let root = if updates.root.id == from.id {
                Rc::clone(to)
            } else {
                Rc::clone(&updates.root)
            };
            let writes = updates
                .writes
                .iter()
                .map(|(i, v)| (substitute_array(i, from, to), substitute_array(v, from, to)))
                .collect();
            Expr::read(
                UpdateList::with_writes(root, writes),
                substitute_array(index, from, to),
            )
        }
        Expr::Concat { msb, lsb } => Expr::concat(
            substitute_array(msb, from, to),
            substitute_array(lsb, from, to),
        ),
        Expr::Extract {
            expr: inner,
            offset,
            width,
        } => Expr::extract(substitute_array(inner, from, to), *offset, *width),
        Expr::ZExt { expr: inner, width } => {
            Expr::zext(substitute_array(inner, from, to), *width)
        }
        Expr::SExt { expr: inner, width } => {
            Expr::sext(substitute_array(inner, from, to), *width)
        }
        Expr::Select {
            cond,
            true_expr,
            false_expr,
        } => Expr::select(
            substitute_array(cond, from, to),
            substitute_array(true_expr, from, to),
            substitute_array(false_expr, from, to),
        ),
        Expr::Not(inner) => Expr::not(substitute_array(inner, from, to)),
        Expr::Binary { op, left, right } => Expr::binary(
            *op,
            substitute_array(left, from, to),
            substitute_array(right, from, to),
        ),
        Expr::Cmp { op, left, right } => Expr::cmp(
            *op,
            substitute_array(left, from, to),
            substitute_array(right, from, to),
        ),
        Expr::Exists { arrays, body } => {
            Expr::exists(arrays.clone(), substitute_array(body, from, to))
        }
    }
}

/// Collect every array read anywhere inside `expr`.
pub fn collect_arrays(expr: &ExprRef, out: &mut BTreeSet<ArrayRef>) {
    match expr.as_ref() {
        Expr::Const { .. } => {}
        Expr::Read { updates, index } => {
            out.insert(Rc::clone(&updates.root));
            for (i, v) in &updates.writes {
                collect_arrays(i, out);
                collect_arrays(v, out);
            }
            collect_arrays(index, out);
        }
        Expr::Concat { msb, lsb } => {
            collect_arrays(msb, out);
            collect_arrays(lsb, out);
        }
        Expr::Extract { expr: inner, .. }
        | Expr::ZExt { expr: inner, .. }
        | Expr::SExt { expr: inner, .. }
        | Expr::Not(inner) => collect_arrays(inner, out),
        Expr::Select {
            cond,
            true_expr,
            false_expr,
        } => {
            collect_arrays(cond, out);
            collect_arrays(true_expr, out);
            collect_arrays(false_expr, out);
        }
        Expr::Binary { left, right, .. } | Expr::Cmp { left, right, .. } => {
            collect_arrays(left, out);
            collect_arrays(right, out);
        }
        Expr::Exists { body, .. } => collect_arrays(body, out),
    }
}

/// Rebuild a binary or comparison node of the same kind with new operands.
///
/// Returns `None` for node kinds that are not two-operand.
#[must_use]
pub fn rebuild_binary(original: &ExprRef, left: ExprRef, right: ExprRef) -> Option<ExprRef> {
    match original.as_ref() {
        Expr::Binary { op, .. } => Some(Expr::binary(*op, left, right)),
        Expr::Cmp { op, .. } => Some(Expr::cmp(*op, left, right)),
        Expr::Concat { .. } => Some(Expr::concat(left, right)),
        _ => None,
    }
}

/// Push a negation into a comparison where possible: `¬(a < b)` becomes
/// `a >= b`. Other shapes keep the explicit `Not`.
#[must_use]
pub fn simplify_not(expr: ExprRef) -> ExprRef {
    if let Expr::Not(inner) = expr.as_ref() {
        if let Expr::Cmp { op, left, right } = inner.as_ref() {
            return Expr::cmp(op.negated(), Rc::clone(left), Rc::clone(right));
        }
    }
    expr
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Const { value, width } => {
                if *width == BOOL_WIDTH {
                    write!(f, "{}", if *value == 1 { "true" } else { "false" })
                } else {
                    write!(f, "{value}")
                }
            }
            Self::Read { updates, index } => {
                let mut name = updates.root.name.clone();
                for (i, v) in &updates.writes {
                    name = format!("update({name},{i},{v})");
                }
                write!(f, "{name}[{index}]")
            }
            Self::Concat { msb, lsb } => write!(f, "concat({msb},{lsb})"),
            Self::Extract {
                expr,
                offset,
                width,
            } => write!(f, "{expr}[{},{}]", offset + width - 1, offset),
            Self::ZExt { expr, .. } => write!(f, "{expr}"),
            Self::SExt { expr, .. } => write!(f, "sext({expr})"),
            Self::Select {
                cond,
                true_expr,
                false_expr,
            } => write!(f, "ite({cond},{true_expr},{false_expr})"),
            Self::Not(e) => write!(f, "!({e})"),
            Self::Binary { op, left, right } => {
                let sym = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::UDiv | BinOp::SDiv => "/",
                    BinOp::URem | BinOp::SRem => "%",
                    BinOp::And => "&",
                    BinOp::Or => "|",
                    BinOp::Xor => "^",
                    BinOp::Shl => "<<",
                    BinOp::LShr | BinOp::AShr => ">>",
                };
                write!(f, "({left} {sym} {right})")
            }
            Self::Cmp { op, left, right } => {
                let sym = match op {
                    CmpOp::Eq => "=",
                    CmpOp::Ne => "!=",
                    CmpOp::Ult | CmpOp::Slt => "<",
                    CmpOp::Ule | CmpOp::Sle => "<=",
                    CmpOp::Ugt | CmpOp::Sgt => ">",
                    CmpOp::Uge | CmpOp::Sge => ">=",
                };
                write!(f, "({left} {sym} {right})")
            }
            Self::Exists { arrays, body } => {
                let names: Vec<&str> = arrays.iter().map(|a| a.name.as_str()).collect();
                write!(f, "(exists ({}) {body})", names.join(","))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_array(id: u64, name: &str) -> ArrayRef {
        Rc::new(Array {
            id,
            name: name.to_string(),
            size: 4,
            domain_width: 32,
            range_width: 8,
        })
    }

    // ===== Constant folding =====

    #[test]
    fn test_constant_masks_to_width() {
        let c = Expr::constant(0x1ff, 8);
        assert_eq!(c.as_const(), Some((0xff, 8)));
    }

    #[test]
    fn test_add_folds() {
        let e = Expr::binary(BinOp::Add, Expr::constant(3, 32), Expr::constant(4, 32));
        assert_eq!(e.as_const(), Some((7, 32)));
    }

    #[test]
    fn test_add_wraps_at_width() {
        let e = Expr::binary(BinOp::Add, Expr::constant(0xff, 8), Expr::constant(1, 8));
        assert_eq!(e.as_const(), Some((0, 8)));
    }

    #[test]
    fn test_sdiv_sign_extends() {
        // -8 / 2 at width 8
        let e = Expr::binary(BinOp::SDiv, Expr::constant(0xf8, 8), Expr::constant(2, 8));
        assert_eq!(e.as_const(), Some((0xfc, 8)));
    }

    #[test]
    fn test_udiv_by_zero_does_not_fold() {
        let e = Expr::binary(BinOp::UDiv, Expr::constant(1, 32), Expr::constant(0, 32));
        assert!(!e.is_const());
    }

    #[test]
    fn test_cmp_folds_signed() {
        // -1 <s 0 at width 8
        let e = Expr::cmp(CmpOp::Slt, Expr::constant(0xff, 8), Expr::constant(0, 8));
        assert!(e.is_true());
    }

    #[test]
    fn test_cmp_on_equal_terms() {
        let a = test_array(1, "a");
        let read = Expr::read(UpdateList::new(a), Expr::constant(0, 32));
        assert!(Expr::cmp(CmpOp::Eq, Rc::clone(&read), Rc::clone(&read)).is_true());
        assert!(Expr::cmp(CmpOp::Ult, Rc::clone(&read), read).is_false());
    }

    #[test]
    fn test_bool_and_identities() {
        let a = test_array(1, "a");
        let p = Expr::eq(
            Expr::read(UpdateList::new(a), Expr::constant(0, 32)),
            Expr::constant(5, 8),
        );
        assert_eq!(Expr::and(Expr::true_(), Rc::clone(&p)), p);
        assert!(Expr::and(Expr::false_(), Rc::clone(&p)).is_false());
        assert_eq!(Expr::or(Expr::false_(), Rc::clone(&p)), p);
        assert!(Expr::or(Expr::true_(), p).is_true());
    }

    #[test]
    fn test_negated_comparison_pair() {
        let a = test_array(1, "x");
        let x = Expr::read(UpdateList::new(a), Expr::constant(0, 32));
        let cond = Expr::cmp(CmpOp::Slt, Rc::clone(&x), Expr::constant(5, 8));
        let neg = simplify_not(Expr::not(Rc::clone(&cond)));
        assert_eq!(neg, Expr::cmp(CmpOp::Sge, x, Expr::constant(5, 8)));
    }

    // ===== Casts =====

    #[test]
    fn test_zext_noop_and_fold() {
        let c = Expr::constant(5, 8);
        assert_eq!(Expr::zext(Rc::clone(&c), 8), c);
        assert_eq!(Expr::zext(c, 32).as_const(), Some((5, 32)));
    }

    #[test]
    fn test_sext_fold_negative() {
        let c = Expr::constant(0xff, 8); // -1
        assert_eq!(Expr::sext(c, 16).as_const(), Some((0xffff, 16)));
    }

    #[test]
    fn test_extract_fold() {
        let c = Expr::constant(0xabcd, 32);
        assert_eq!(Expr::extract(c, 8, 8).as_const(), Some((0xab, 8)));
    }

    #[test]
    fn test_concat_fold() {
        let e = Expr::concat(Expr::constant(0xab, 8), Expr::constant(0xcd, 8));
        assert_eq!(e.as_const(), Some((0xabcd, 16)));
    }

    #[test]
    fn test_select_folds_on_const_cond() {
        let t = Expr::constant(1, 32);
        let f = Expr::constant(2, 32);
        assert_eq!(Expr::select(Expr::true_(), Rc::clone(&t), Rc::clone(&f)), t);
        assert_eq!(Expr::select(Expr::false_(), t, Rc::clone(&f)), f);
    }

    // ===== Substitution =====

    #[test]
    fn test_substitute_fixed_point() {
        let a = test_array(1, "a");
        let x = Expr::read(UpdateList::new(a), Expr::constant(0, 32));
        let e = Expr::cmp(
            CmpOp::Slt,
            Expr::binary(BinOp::Add, Rc::clone(&x), Expr::constant(1, 8)),
            Expr::constant(9, 8),
        );
        assert_eq!(substitute(&e, &x, &x), e);
    }

    #[test]
    fn test_substitute_replaces_every_occurrence() {
        let a = test_array(1, "a");
        let x = Expr::read(UpdateList::new(a), Expr::constant(0, 32));
        let e = Expr::binary(BinOp::Add, Rc::clone(&x), Rc::clone(&x));
        let three = Expr::constant(3, 8);
        let replaced = substitute(&e, &x, &three);
        // 3 + 3 folds
        assert_eq!(replaced.as_const(), Some((6, 8)));
    }

    #[test]
    fn test_substitute_array_rewrites_root() {
        let a = test_array(1, "a");
        let b = test_array(2, "b");
        let e = Expr::read(UpdateList::new(Rc::clone(&a)), Expr::constant(0, 32));
        let swapped = substitute_array(&e, &a, &b);
        match swapped.as_ref() {
            Expr::Read { updates, .. } => assert_eq!(updates.root.name, "b"),
            other => panic!("expected read, got {other:?}"),
        }
    }

    #[test]
    fn test_collect_arrays_dedups() {
        let a = test_array(1, "a");
        let e = Expr::binary(
            BinOp::Add,
            Expr::read(UpdateList::new(Rc::clone(&a)), Expr::constant(0, 32)),
            Expr::read(UpdateList::new(Rc::clone(&a)), Expr::constant(1, 32)),
        );
        let mut out = BTreeSet::new();
        collect_arrays(&e, &mut out);
        assert_eq!(out.len(), 1);
    }

    // ===== Misc =====

    #[test]
    fn test_simplify_not_on_other_shapes_keeps_not() {
        let a = test_array(1, "a");
        let x = Expr::read(UpdateList::new(a), Expr::constant(0, 32));
        let e = Expr::not(Rc::clone(&x));
        assert_eq!(simplify_not(Rc::clone(&e)), e);
    }

    #[test]
    fn test_exists_of_empty_vars_is_body() {
        let a = test_array(1, "a");
        let body = Expr::eq(
            Expr::read(UpdateList::new(a), Expr::constant(0, 32)),
            Expr::constant(5, 8),
        );
        assert_eq!(Expr::exists(vec![], Rc::clone(&body)), body);
    }

    #[test]
    fn test_width_of_cmp_is_bool() {
        let e = Expr::cmp(CmpOp::Ult, Expr::constant(1, 32), Expr::constant(2, 32));
        assert_eq!(e.width(), BOOL_WIDTH);
    }

    #[test]
    fn test_display_forms() {
        let a = test_array(1, "a");
        let read = Expr::read(UpdateList::new(a), Expr::constant(0, 32));
        let e = Expr::cmp(CmpOp::Ult, read, Expr::constant(8, 8));
        assert_eq!(e.to_string(), "(a[0] < 8)");
    }

    #[test]
    fn test_serde_round_trip() {
        let a = test_array(1, "a");
        let e = Expr::cmp(
            CmpOp::Sle,
            Expr::read(UpdateList::new(a), Expr::constant(0, 32)),
            Expr::constant(7, 8),
        );
        let json = serde_json::to_string(&e).expect("serialize");
        let back: ExprRef = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, e);
    }
}
