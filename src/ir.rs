//! Arena-based intermediate representation analysed by the engine
//!
//! A [`Program`] is a whole-program snapshot of compiled C-like code:
//! - Modules own functions, functions own basic blocks, blocks own instructions
//! - Every entity lives in a flat arena and is addressed by a `u32` id
//! - Predecessors, successors, users and in-block positions are computed once by
//!   [`ProgramBuilder::finish`]
//!
//! Operands are plain [`Value`]s, so no instruction holds a reference to another.
//! All traversal is index based.

use std::fmt;

use crate::cfg::BlockEdges;

mod builder;
mod validate;

pub use builder::{FunctionBuilder, ProgramBuilder};
pub use validate::validate_function;

/// Module identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

/// Function identifier, unique across the whole program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

/// Basic block identifier, unique across the whole program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Instruction identifier, unique across the whole program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// IR type, reduced to what the analysis needs to distinguish
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IrType {
    Void,
    /// Integer with the given bit width
    Int(u32),
    Ptr,
    Aggregate(Vec<IrType>),
}

impl IrType {
    pub fn is_void(&self) -> bool {
        matches!(self, IrType::Void)
    }

    pub fn is_int(&self) -> bool {
        matches!(self, IrType::Int(_))
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, IrType::Ptr)
    }

    pub fn int_width(&self) -> Option<u32> {
        match self {
            IrType::Int(bits) => Some(*bits),
            _ => None,
        }
    }
}

/// Integer constant with its bit width; `value` is stored sign-extended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstInt {
    pub value: i64,
    pub bits: u32,
}

impl ConstInt {
    pub fn new(value: i64, bits: u32) -> Self {
        Self {
            value: sign_extend(value, bits),
            bits,
        }
    }

    pub fn bool(value: bool) -> Self {
        Self::new(value as i64, 1)
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    /// Value as a 32-bit integer, truncating wider constants
    pub fn as_i32(&self) -> i32 {
        self.value as i32
    }

    /// Value reinterpreted as unsigned at its own width
    pub fn as_unsigned(&self) -> u64 {
        if self.bits >= 64 {
            self.value as u64
        } else {
            (self.value as u64) & ((1u64 << self.bits) - 1)
        }
    }
}

fn sign_extend(value: i64, bits: u32) -> i64 {
    if bits == 0 || bits >= 64 {
        return value;
    }
    let shift = 64 - bits;
    (value << shift) >> shift
}

/// Instruction operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    /// Result of an instruction
    Inst(InstId),
    /// Formal parameter of a function
    Arg { func: FuncId, index: u32 },
    Const(ConstInt),
    /// Null pointer constant
    Null,
    /// Address of a function
    Func(FuncId),
    /// Address of a global variable
    Global(u32),
    Undef,
}

impl Value {
    pub fn as_inst(&self) -> Option<InstId> {
        match self {
            Value::Inst(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_const(&self) -> Option<ConstInt> {
        match self {
            Value::Const(c) => Some(*c),
            _ => None,
        }
    }

    /// Constants of any kind, including addresses of functions and globals
    pub fn is_constant(&self) -> bool {
        matches!(
            self,
            Value::Const(_) | Value::Null | Value::Func(_) | Value::Global(_) | Value::Undef
        )
    }

    pub fn int(value: i64, bits: u32) -> Self {
        Value::Const(ConstInt::new(value, bits))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Inst(id) => write!(f, "{}", id),
            Value::Arg { func, index } => write!(f, "{}.arg{}", func, index),
            Value::Const(c) => write!(f, "i{} {}", c.bits, c.value),
            Value::Null => write!(f, "null"),
            Value::Func(id) => write!(f, "@{}", id),
            Value::Global(id) => write!(f, "@g{}", id),
            Value::Undef => write!(f, "undef"),
        }
    }
}

/// Integer comparison predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Predicate {
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

impl Predicate {
    /// Predicate that holds exactly when `self` does not
    pub fn inverse(self) -> Self {
        match self {
            Predicate::Eq => Predicate::Ne,
            Predicate::Ne => Predicate::Eq,
            Predicate::Ugt => Predicate::Ule,
            Predicate::Uge => Predicate::Ult,
            Predicate::Ult => Predicate::Uge,
            Predicate::Ule => Predicate::Ugt,
            Predicate::Sgt => Predicate::Sle,
            Predicate::Sge => Predicate::Slt,
            Predicate::Slt => Predicate::Sge,
            Predicate::Sle => Predicate::Sgt,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            Predicate::Ugt | Predicate::Uge | Predicate::Ult | Predicate::Ule
        )
    }

    /// Whether `lhs self rhs` being true forces `lhs other rhs` to be true
    pub fn implies_true(self, other: Predicate) -> bool {
        if self == other {
            return true;
        }
        match self {
            Predicate::Eq => matches!(
                other,
                Predicate::Uge | Predicate::Ule | Predicate::Sge | Predicate::Sle
            ),
            Predicate::Ugt => matches!(other, Predicate::Ne | Predicate::Uge),
            Predicate::Ult => matches!(other, Predicate::Ne | Predicate::Ule),
            Predicate::Sgt => matches!(other, Predicate::Ne | Predicate::Sge),
            Predicate::Slt => matches!(other, Predicate::Ne | Predicate::Sle),
            _ => false,
        }
    }

    /// Whether `lhs self rhs` being true forces `lhs other rhs` to be false
    pub fn implies_false(self, other: Predicate) -> bool {
        self.implies_true(other.inverse())
    }

    /// Evaluate the comparison on two constants
    pub fn evaluate(self, lhs: ConstInt, rhs: ConstInt) -> bool {
        if self.is_unsigned() {
            let (l, r) = (lhs.as_unsigned(), rhs.as_unsigned());
            match self {
                Predicate::Ugt => l > r,
                Predicate::Uge => l >= r,
                Predicate::Ult => l < r,
                _ => l <= r,
            }
        } else {
            let (l, r) = (lhs.value, rhs.value);
            match self {
                Predicate::Eq => l == r,
                Predicate::Ne => l != r,
                Predicate::Sgt => l > r,
                Predicate::Sge => l >= r,
                Predicate::Slt => l < r,
                _ => l <= r,
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Predicate::Eq => "eq",
            Predicate::Ne => "ne",
            Predicate::Ugt => "ugt",
            Predicate::Uge => "uge",
            Predicate::Ult => "ult",
            Predicate::Ule => "ule",
            Predicate::Sgt => "sgt",
            Predicate::Sge => "sge",
            Predicate::Slt => "slt",
            Predicate::Sle => "sle",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastKind {
    Trunc,
    ZExt,
    SExt,
    BitCast,
    PtrToInt,
    IntToPtr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

impl fmt::Display for BinOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOpKind::Add => "add",
            BinOpKind::Sub => "sub",
            BinOpKind::Mul => "mul",
            BinOpKind::SDiv => "sdiv",
            BinOpKind::UDiv => "udiv",
            BinOpKind::SRem => "srem",
            BinOpKind::URem => "urem",
            BinOpKind::And => "and",
            BinOpKind::Or => "or",
            BinOpKind::Xor => "xor",
            BinOpKind::Shl => "shl",
            BinOpKind::LShr => "lshr",
            BinOpKind::AShr => "ashr",
        };
        write!(f, "{}", s)
    }
}

/// Call target as written in the IR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callee {
    Direct(FuncId),
    /// Call through a function pointer; targets come from the call graph
    Indirect(Value),
    InlineAsm,
}

/// Instruction kinds
#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    Call {
        callee: Callee,
        args: Vec<Value>,
    },
    Load {
        ptr: Value,
    },
    Store {
        ptr: Value,
        value: Value,
    },
    /// Stack allocation
    Alloca,
    /// Address computation; `offset` is the constant byte offset if known
    Gep {
        base: Value,
        offset: Option<i64>,
    },
    Cast {
        kind: CastKind,
        value: Value,
    },
    Freeze {
        value: Value,
    },
    Select {
        cond: Value,
        if_true: Value,
        if_false: Value,
    },
    Cmp {
        pred: Predicate,
        lhs: Value,
        rhs: Value,
    },
    BinOp {
        op: BinOpKind,
        lhs: Value,
        rhs: Value,
    },
    Phi {
        incoming: Vec<(BlockId, Value)>,
    },
    ExtractValue {
        aggregate: Value,
        index: u32,
    },

    // === Terminators ===
    Jump {
        target: BlockId,
    },
    Branch {
        cond: Value,
        if_true: BlockId,
        if_false: BlockId,
    },
    Switch {
        cond: Value,
        default: BlockId,
        cases: Vec<(ConstInt, BlockId)>,
    },
    Return {
        value: Option<Value>,
    },
    Unreachable,
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Jump { .. }
                | InstKind::Branch { .. }
                | InstKind::Switch { .. }
                | InstKind::Return { .. }
                | InstKind::Unreachable
        )
    }

    /// Successor edges in terminator order; a switch lists its default first
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Jump { target } => vec![*target],
            InstKind::Branch {
                if_true, if_false, ..
            } => vec![*if_true, *if_false],
            InstKind::Switch { default, cases, .. } => std::iter::once(*default)
                .chain(cases.iter().map(|(_, target)| *target))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Value operands in a fixed order
    pub fn operands(&self) -> Vec<Value> {
        match self {
            InstKind::Call { callee, args } => {
                let mut ops = args.clone();
                if let Callee::Indirect(target) = callee {
                    ops.push(*target);
                }
                ops
            }
            InstKind::Load { ptr } => vec![*ptr],
            InstKind::Store { ptr, value } => vec![*value, *ptr],
            InstKind::Alloca | InstKind::Jump { .. } | InstKind::Unreachable => Vec::new(),
            InstKind::Gep { base, .. } => vec![*base],
            InstKind::Cast { value, .. } | InstKind::Freeze { value } => vec![*value],
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => vec![*cond, *if_true, *if_false],
            InstKind::Cmp { lhs, rhs, .. } | InstKind::BinOp { lhs, rhs, .. } => vec![*lhs, *rhs],
            InstKind::Phi { incoming } => incoming.iter().map(|(_, v)| *v).collect(),
            InstKind::ExtractValue { aggregate, .. } => vec![*aggregate],
            InstKind::Branch { cond, .. } | InstKind::Switch { cond, .. } => vec![*cond],
            InstKind::Return { value } => value.iter().copied().collect(),
        }
    }
}

/// Source position attached to instructions and functions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebugLoc {
    pub file: String,
    pub line: u32,
    pub column: u32,
    /// Call site this location was inlined into
    pub inlined_at: Option<Box<DebugLoc>>,
}

impl DebugLoc {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
            inlined_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub kind: InstKind,
    /// Result type; `Void` for instructions without a result
    pub ty: IrType,
    pub block: BlockId,
    pub loc: Option<DebugLoc>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub func: FuncId,
    /// Instructions in order; the last one is the terminator
    pub insts: Vec<InstId>,
}

/// Function attributes relevant to reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FnAttrs {
    /// No side effects; results of pure calls are never reported
    pub pure: bool,
    /// Compiler annotation such as debug or lifetime markers
    pub intrinsic: bool,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub id: FuncId,
    pub name: String,
    pub module: ModuleId,
    pub params: Vec<IrType>,
    pub ret: IrType,
    /// Blocks in layout order, entry first; empty for declarations
    pub blocks: Vec<BlockId>,
    pub attrs: FnAttrs,
    /// Source-level return type name from debug info
    pub ret_type_name: Option<String>,
    pub loc: Option<DebugLoc>,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.blocks.first().copied()
    }
}

#[derive(Debug, Clone)]
pub struct Module {
    pub id: ModuleId,
    pub name: String,
    pub functions: Vec<FuncId>,
}

/// Whole-program IR arena
#[derive(Debug, Clone)]
pub struct Program {
    pub(crate) modules: Vec<Module>,
    pub(crate) functions: Vec<Function>,
    pub(crate) blocks: Vec<Block>,
    pub(crate) insts: Vec<Instruction>,
    pub(crate) edges: BlockEdges,
    pub(crate) users: Vec<Vec<InstId>>,
    pub(crate) positions: Vec<u32>,
}

impl Program {
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn module(&self, id: ModuleId) -> &Module {
        &self.modules[id.0 as usize]
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id.0 as usize]
    }

    pub fn kind(&self, id: InstId) -> &InstKind {
        &self.insts[id.0 as usize].kind
    }

    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions.iter().find(|f| f.name == name).map(|f| f.id)
    }

    /// Instruction kind behind a value, if the value is an instruction
    pub fn kind_of(&self, value: Value) -> Option<&InstKind> {
        value.as_inst().map(|id| self.kind(id))
    }

    pub fn block_of(&self, inst: InstId) -> BlockId {
        self.inst(inst).block
    }

    pub fn function_of(&self, inst: InstId) -> FuncId {
        self.block(self.block_of(inst)).func
    }

    /// Index of an instruction inside its block
    pub fn position(&self, inst: InstId) -> usize {
        self.positions[inst.0 as usize] as usize
    }

    pub fn users(&self, inst: InstId) -> &[InstId] {
        &self.users[inst.0 as usize]
    }

    pub fn successors(&self, block: BlockId) -> &[BlockId] {
        self.edges.successors(block)
    }

    pub fn predecessors(&self, block: BlockId) -> &[BlockId] {
        self.edges.predecessors(block)
    }

    pub fn terminator(&self, block: BlockId) -> Option<InstId> {
        let last = *self.block(block).insts.last()?;
        self.kind(last).is_terminator().then_some(last)
    }

    pub fn terminator_kind(&self, block: BlockId) -> Option<&InstKind> {
        self.terminator(block).map(|id| self.kind(id))
    }

    pub fn type_of(&self, value: Value) -> IrType {
        match value {
            Value::Inst(id) => self.inst(id).ty.clone(),
            Value::Arg { func, index } => self
                .function(func)
                .params
                .get(index as usize)
                .cloned()
                .unwrap_or(IrType::Void),
            Value::Const(c) => IrType::Int(c.bits),
            Value::Null | Value::Func(_) | Value::Global(_) => IrType::Ptr,
            Value::Undef => IrType::Int(32),
        }
    }

    /// Direct callee of a call instruction
    pub fn direct_callee(&self, inst: InstId) -> Option<FuncId> {
        match self.kind(inst) {
            InstKind::Call {
                callee: Callee::Direct(f),
                ..
            } => Some(*f),
            _ => None,
        }
    }

    pub fn is_call(&self, value: Value) -> bool {
        matches!(self.kind_of(value), Some(InstKind::Call { .. }))
    }

    pub fn is_cmp(&self, value: Value) -> bool {
        matches!(self.kind_of(value), Some(InstKind::Cmp { .. }))
    }

    /// Calls to inline assembly or to intrinsic annotations
    pub fn is_intrinsic_call(&self, inst: InstId) -> bool {
        match self.kind(inst) {
            InstKind::Call { callee, .. } => match callee {
                Callee::InlineAsm => true,
                Callee::Direct(f) => self.function(*f).attrs.intrinsic,
                Callee::Indirect(_) => false,
            },
            _ => false,
        }
    }

    /// Look through bitcasts and constant-offset address computations
    ///
    /// Returns the base pointer and the accumulated byte offset.
    pub fn strip_constant_offsets(&self, mut value: Value) -> (Value, i64) {
        let mut offset = 0i64;
        let mut steps = 0usize;
        while let Some(kind) = self.kind_of(value) {
            match kind {
                InstKind::Gep {
                    base,
                    offset: Some(off),
                } => {
                    offset = offset.wrapping_add(*off);
                    value = *base;
                }
                InstKind::Cast {
                    kind: CastKind::BitCast,
                    value: inner,
                } => value = *inner,
                _ => break,
            }
            steps += 1;
            if steps > self.insts.len() {
                break;
            }
        }
        (value, offset)
    }

    /// Call instructions of a function in layout order
    pub fn calls_in(&self, func: FuncId) -> impl Iterator<Item = InstId> + '_ {
        self.insts_in(func)
            .filter(move |id| matches!(self.kind(*id), InstKind::Call { .. }))
    }

    /// All instructions of a function in layout order
    pub fn insts_in(&self, func: FuncId) -> impl Iterator<Item = InstId> + '_ {
        self.function(func)
            .blocks
            .iter()
            .flat_map(move |b| self.block(*b).insts.iter().copied())
    }

    /// Return instructions of a function
    pub fn returns_in(&self, func: FuncId) -> impl Iterator<Item = InstId> + '_ {
        self.insts_in(func)
            .filter(move |id| matches!(self.kind(*id), InstKind::Return { .. }))
    }

    /// Whether every return of a defined function yields the same integer or null constant
    pub fn returns_single_constant(&self, func: FuncId) -> bool {
        let mut seen: Option<Value> = None;
        for ret in self.returns_in(func) {
            let InstKind::Return { value: Some(v) } = self.kind(ret) else {
                return false;
            };
            if !matches!(v, Value::Const(_) | Value::Null) {
                return false;
            }
            match seen {
                None => seen = Some(*v),
                Some(prev) if prev != *v => return false,
                Some(_) => {}
            }
        }
        seen.is_some()
    }
}

#[cfg(test)]
mod tests;
