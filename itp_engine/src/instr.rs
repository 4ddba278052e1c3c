//! Placeholder bitcode model
//!
//! The interpreter that drives this engine executes an LLVM-like instruction
//! language. The engine never loads bitcode itself; it consumes per-event
//! descriptions of instructions and operands. This module is the minimal
//! model of that language — values, types, opcodes, instructions, and a
//! value → defining-instruction index — in the same spirit as sketching the
//! source IR with placeholder types instead of linking the real compiler.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Identity of a program value (instruction result, argument, global,
/// or constant node). Comparisons on values are by id, never by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u64);

/// Identity of an instruction; doubles as the program point used to index
/// the subsumption table.
pub type InstrId = u64;

/// The ordered list of call instructions on the current call stack.
pub type CallHistory = Vec<InstrId>;

/// Shared handle to an operand description.
pub type ValueDescRef = Rc<ValueDesc>;

/// Shared handle to an instruction.
pub type InstrRef = Rc<Instruction>;

/// Static classification of a program value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    /// Result of an instruction
    Instruction,
    /// Function parameter; `of_main` marks arguments of the entry function,
    /// which are never allocated inside the analyzed program
    Argument { of_main: bool },
    /// Global variable
    Global,
    /// Integer constant
    ConstantInt { value: u64 },
    /// Constant pointer (e.g. a global's address or a constant GEP)
    ConstantPointer,
}

/// A program value as the interpreter describes it in events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDesc {
    pub id: ValueId,
    pub name: String,
    pub kind: ValueKind,
    pub ty: TypeDesc,
}

impl ValueDesc {
    #[must_use]
    pub fn is_constant(&self) -> bool {
        matches!(
            self.kind,
            ValueKind::ConstantInt { .. } | ValueKind::ConstantPointer
        )
    }

    #[must_use]
    pub fn is_argument(&self) -> bool {
        matches!(self.kind, ValueKind::Argument { .. })
    }

    #[must_use]
    pub fn is_main_argument(&self) -> bool {
        matches!(self.kind, ValueKind::Argument { of_main: true })
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        matches!(self.kind, ValueKind::Global)
    }
}

/// Types, at the granularity the engine cares about: widths and layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDesc {
    Void,
    Int { bits: u32 },
    Float { bits: u32 },
    Pointer { elem: Box<TypeDesc> },
    Array { elem: Box<TypeDesc>, count: u64 },
    Struct { fields: Vec<TypeDesc> },
}

impl TypeDesc {
    /// Width of one addressable cell of this type, in bits.
    ///
    /// Pointers and arrays answer for their element type, which is how the
    /// weakest-precondition pass sizes its symbolic variables.
    #[must_use]
    pub fn cell_bits(&self) -> Option<u32> {
        match self {
            Self::Int { bits } | Self::Float { bits } => Some(*bits),
            Self::Pointer { elem } | Self::Array { elem, .. } => elem.cell_bits(),
            Self::Void | Self::Struct { .. } => None,
        }
    }

    /// Total width in bits (array = element width × count).
    #[must_use]
    pub fn total_bits(&self) -> Option<u64> {
        match self {
            Self::Int { bits } | Self::Float { bits } => Some(u64::from(*bits)),
            Self::Pointer { elem } => elem.total_bits(),
            Self::Array { elem, count } => Some(elem.total_bits()? * count),
            Self::Void | Self::Struct { .. } => None,
        }
    }

    /// Number of elements when this is (a pointer to) an array, else 1.
    #[must_use]
    pub fn array_count(&self) -> u64 {
        match self {
            Self::Array { count, .. } => *count,
            Self::Pointer { elem } => elem.array_count(),
            _ => 1,
        }
    }
}

/// Data-layout provider.
#[derive(Debug, Clone)]
pub struct TargetData {
    /// Pointer width in bits
    pub pointer_bits: u32,
}

impl Default for TargetData {
    fn default() -> Self {
        Self { pointer_bits: 64 }
    }
}

impl TargetData {
    /// Store size of a type in bytes.
    #[must_use]
    pub fn store_size(&self, ty: &TypeDesc) -> u64 {
        match ty {
            TypeDesc::Void => 0,
            TypeDesc::Int { bits } | TypeDesc::Float { bits } => u64::from((bits + 7) / 8),
            TypeDesc::Pointer { .. } => u64::from(self.pointer_bits / 8),
            TypeDesc::Array { elem, count } => self.store_size(elem) * count,
            TypeDesc::Struct { fields } => fields.iter().map(|f| self.store_size(f)).sum(),
        }
    }
}

/// Integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntPredicate {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

/// Floating-point comparison predicates. Tracked for dispatch; the
/// weakest-precondition pass rejects them as unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatPredicate {
    Oeq,
    Ogt,
    Oge,
    Olt,
    Ole,
    One,
    Ord,
    Uno,
    Ueq,
    Ugt,
    Uge,
    Ult,
    Ule,
    Une,
}

/// Instruction opcodes the dependency tracker dispatches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opcode {
    Alloca { size: u64 },
    Load,
    Store,
    GetElementPtr,
    Trunc,
    ZExt,
    SExt,
    FpTrunc,
    FpExt,
    FpToUi,
    FpToSi,
    UiToFp,
    SiToFp,
    BitCast,
    IntToPtr,
    PtrToInt,
    ExtractValue,
    InsertValue,
    Select,
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
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
    ICmp(IntPredicate),
    FCmp(FloatPredicate),
    Br { conditional: bool },
    Phi,
    Call { callee: Option<String> },
    Ret { has_value: bool },
}

impl Opcode {
    /// Display name for diagnostics.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::Alloca { .. } => "alloca",
            Self::Load => "load",
            Self::Store => "store",
            Self::GetElementPtr => "getelementptr",
            Self::Trunc => "trunc",
            Self::ZExt => "zext",
            Self::SExt => "sext",
            Self::FpTrunc => "fptrunc",
            Self::FpExt => "fpext",
            Self::FpToUi => "fptoui",
            Self::FpToSi => "fptosi",
            Self::UiToFp => "uitofp",
            Self::SiToFp => "sitofp",
            Self::BitCast => "bitcast",
            Self::IntToPtr => "inttoptr",
            Self::PtrToInt => "ptrtoint",
            Self::ExtractValue => "extractvalue",
            Self::InsertValue => "insertvalue",
            Self::Select => "select",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::UDiv => "udiv",
            Self::SDiv => "sdiv",
            Self::URem => "urem",
            Self::SRem => "srem",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Shl => "shl",
            Self::LShr => "lshr",
            Self::AShr => "ashr",
            Self::FAdd => "fadd",
            Self::FSub => "fsub",
            Self::FMul => "fmul",
            Self::FDiv => "fdiv",
            Self::FRem => "frem",
            Self::ICmp(_) => "icmp",
            Self::FCmp(_) => "fcmp",
            Self::Br { .. } => "br",
            Self::Phi => "phi",
            Self::Call { .. } => "call",
            Self::Ret { .. } => "ret",
        }
    }

    /// Whether this opcode is a single-source cast.
    #[must_use]
    pub const fn is_cast(&self) -> bool {
        matches!(
            self,
            Self::Trunc
                | Self::ZExt
                | Self::SExt
                | Self::FpTrunc
                | Self::FpExt
                | Self::FpToUi
                | Self::FpToSi
                | Self::UiToFp
                | Self::SiToFp
                | Self::BitCast
                | Self::ExtractValue
        )
    }

    /// Whether this opcode is a two-operand arithmetic/bitwise/compare form.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Sub
                | Self::Mul
                | Self::UDiv
                | Self::SDiv
                | Self::URem
                | Self::SRem
                | Self::And
                | Self::Or
                | Self::Xor
                | Self::Shl
                | Self::LShr
                | Self::AShr
                | Self::FAdd
                | Self::FSub
                | Self::FMul
                | Self::FDiv
                | Self::FRem
                | Self::ICmp(_)
                | Self::FCmp(_)
                | Self::InsertValue
        )
    }
}

/// One instruction, as described by the interpreter.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// Unique id; the id of the first instruction of a basic block is the
    /// program point subsumption is indexed at
    pub id: InstrId,
    /// The value this instruction defines (its own id and result type)
    pub result: ValueDescRef,
    pub opcode: Opcode,
    pub operands: Vec<ValueDescRef>,
    /// Enclosing function name
    pub function: String,
}

impl Instruction {
    #[must_use]
    pub fn new(
        id: InstrId,
        opcode: Opcode,
        result: ValueDescRef,
        operands: Vec<ValueDescRef>,
        function: &str,
    ) -> InstrRef {
        Rc::new(Self {
            id,
            result,
            opcode,
            operands,
            function: function.to_string(),
        })
    }
}

/// Index from value ids to their defining instructions.
///
/// The weakest-precondition pass synthesizes operand expressions by walking
/// definitions backwards; this is the lookup it uses instead of pointers
/// into a loaded module.
#[derive(Debug, Default)]
pub struct Program {
    defs: RefCell<HashMap<ValueId, InstrRef>>,
}

impl Program {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an instruction as the definition of its result value.
    pub fn register(&self, instr: &InstrRef) {
        self.defs
            .borrow_mut()
            .insert(instr.result.id, Rc::clone(instr));
    }

    /// The instruction defining `value`, if any was registered.
    #[must_use]
    pub fn def(&self, value: ValueId) -> Option<InstrRef> {
        self.defs.borrow().get(&value).cloned()
    }
}
