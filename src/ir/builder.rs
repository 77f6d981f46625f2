//! Programmatic construction of [`Program`]s
//!
//! Loaders and tests build IR through [`ProgramBuilder`]: declare functions first, then
//! open a [`FunctionBuilder`] per definition. Blocks may be created before they are
//! filled, so forward branches and loop back-edges need no patching.

use super::*;

#[derive(Debug, Default)]
pub struct ProgramBuilder {
    modules: Vec<Module>,
    functions: Vec<Function>,
    blocks: Vec<Block>,
    insts: Vec<Instruction>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_module(&mut self, name: impl Into<String>) -> ModuleId {
        let id = ModuleId(self.modules.len() as u32);
        self.modules.push(Module {
            id,
            name: name.into(),
            functions: Vec::new(),
        });
        id
    }

    /// Declare a function; it stays a declaration until [`define`](Self::define) adds blocks
    pub fn declare(
        &mut self,
        module: ModuleId,
        name: impl Into<String>,
        params: Vec<IrType>,
        ret: IrType,
    ) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(Function {
            id,
            name: name.into(),
            module,
            params,
            ret,
            blocks: Vec::new(),
            attrs: FnAttrs::default(),
            ret_type_name: None,
            loc: None,
        });
        self.modules[module.0 as usize].functions.push(id);
        id
    }

    pub fn set_attrs(&mut self, func: FuncId, attrs: FnAttrs) {
        self.functions[func.0 as usize].attrs = attrs;
    }

    pub fn set_ret_type_name(&mut self, func: FuncId, name: impl Into<String>) {
        self.functions[func.0 as usize].ret_type_name = Some(name.into());
    }

    pub fn set_function_loc(&mut self, func: FuncId, loc: DebugLoc) {
        self.functions[func.0 as usize].loc = Some(loc);
    }

    /// Start adding a body to a declared function
    pub fn define(&mut self, func: FuncId) -> FunctionBuilder<'_> {
        FunctionBuilder {
            program: self,
            func,
            current: None,
            loc: None,
        }
    }

    fn value_type(&self, value: Value) -> IrType {
        match value {
            Value::Inst(id) => self.insts[id.0 as usize].ty.clone(),
            Value::Arg { func, index } => self.functions[func.0 as usize]
                .params
                .get(index as usize)
                .cloned()
                .unwrap_or(IrType::Void),
            Value::Const(c) => IrType::Int(c.bits),
            Value::Null | Value::Func(_) | Value::Global(_) => IrType::Ptr,
            Value::Undef => IrType::Int(32),
        }
    }

    /// Freeze the arena and compute edges, users and positions
    pub fn finish(self) -> Program {
        let mut positions = vec![0u32; self.insts.len()];
        for block in &self.blocks {
            for (pos, inst) in block.insts.iter().enumerate() {
                positions[inst.0 as usize] = pos as u32;
            }
        }

        let mut users: Vec<Vec<InstId>> = vec![Vec::new(); self.insts.len()];
        for (idx, inst) in self.insts.iter().enumerate() {
            let user = InstId(idx as u32);
            for op in inst.kind.operands() {
                if let Value::Inst(used) = op {
                    let list = &mut users[used.0 as usize];
                    if !list.contains(&user) {
                        list.push(user);
                    }
                }
            }
        }

        let edges = BlockEdges::build(&self.blocks, &self.insts);

        Program {
            modules: self.modules,
            functions: self.functions,
            blocks: self.blocks,
            insts: self.insts,
            edges,
            users,
            positions,
        }
    }
}

/// Appends blocks and instructions to one function
pub struct FunctionBuilder<'a> {
    program: &'a mut ProgramBuilder,
    func: FuncId,
    current: Option<BlockId>,
    loc: Option<DebugLoc>,
}

impl FunctionBuilder<'_> {
    pub fn func(&self) -> FuncId {
        self.func
    }

    pub fn arg(&self, index: u32) -> Value {
        Value::Arg {
            func: self.func,
            index,
        }
    }

    /// Allocate a new empty block; the first block created is the entry
    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.program.blocks.len() as u32);
        self.program.blocks.push(Block {
            id,
            func: self.func,
            insts: Vec::new(),
        });
        self.program.functions[self.func.0 as usize].blocks.push(id);
        id
    }

    /// Direct subsequent instructions into `block`
    pub fn switch_to(&mut self, block: BlockId) {
        self.current = Some(block);
    }

    /// Debug location attached to subsequently pushed instructions
    pub fn set_loc(&mut self, loc: Option<DebugLoc>) {
        self.loc = loc;
    }

    /// Append a raw instruction to the current block
    ///
    /// Creates an entry block first if none was selected.
    pub fn push(&mut self, kind: InstKind, ty: IrType) -> InstId {
        let block = match self.current {
            Some(block) => block,
            None => {
                let block = self.create_block();
                self.current = Some(block);
                block
            }
        };
        let id = InstId(self.program.insts.len() as u32);
        self.program.insts.push(Instruction {
            kind,
            ty,
            block,
            loc: self.loc.clone(),
        });
        self.program.blocks[block.0 as usize].insts.push(id);
        id
    }

    fn push_value(&mut self, kind: InstKind, ty: IrType) -> Value {
        Value::Inst(self.push(kind, ty))
    }

    pub fn call(&mut self, callee: FuncId, args: Vec<Value>) -> Value {
        let ty = self.program.functions[callee.0 as usize].ret.clone();
        self.push_value(
            InstKind::Call {
                callee: Callee::Direct(callee),
                args,
            },
            ty,
        )
    }

    pub fn call_indirect(&mut self, target: Value, args: Vec<Value>, ty: IrType) -> Value {
        self.push_value(
            InstKind::Call {
                callee: Callee::Indirect(target),
                args,
            },
            ty,
        )
    }

    pub fn inline_asm(&mut self, ty: IrType) -> Value {
        self.push_value(
            InstKind::Call {
                callee: Callee::InlineAsm,
                args: Vec::new(),
            },
            ty,
        )
    }

    pub fn load(&mut self, ptr: Value, ty: IrType) -> Value {
        self.push_value(InstKind::Load { ptr }, ty)
    }

    pub fn store(&mut self, ptr: Value, value: Value) -> InstId {
        self.push(InstKind::Store { ptr, value }, IrType::Void)
    }

    pub fn alloca(&mut self) -> Value {
        self.push_value(InstKind::Alloca, IrType::Ptr)
    }

    pub fn gep(&mut self, base: Value, offset: Option<i64>) -> Value {
        self.push_value(InstKind::Gep { base, offset }, IrType::Ptr)
    }

    pub fn cast(&mut self, kind: CastKind, value: Value, ty: IrType) -> Value {
        self.push_value(InstKind::Cast { kind, value }, ty)
    }

    pub fn freeze(&mut self, value: Value) -> Value {
        let ty = self.program.value_type(value);
        self.push_value(InstKind::Freeze { value }, ty)
    }

    pub fn select(&mut self, cond: Value, if_true: Value, if_false: Value) -> Value {
        let ty = self.program.value_type(if_true);
        self.push_value(
            InstKind::Select {
                cond,
                if_true,
                if_false,
            },
            ty,
        )
    }

    pub fn icmp(&mut self, pred: Predicate, lhs: Value, rhs: Value) -> Value {
        self.push_value(InstKind::Cmp { pred, lhs, rhs }, IrType::Int(1))
    }

    pub fn binop(&mut self, op: BinOpKind, lhs: Value, rhs: Value) -> Value {
        let ty = self.program.value_type(lhs);
        self.push_value(InstKind::BinOp { op, lhs, rhs }, ty)
    }

    pub fn phi(&mut self, ty: IrType, incoming: Vec<(BlockId, Value)>) -> Value {
        self.push_value(InstKind::Phi { incoming }, ty)
    }

    /// Replace the incoming list of a phi, for loop-carried values created later
    pub fn set_phi_incoming(&mut self, phi: Value, incoming: Vec<(BlockId, Value)>) {
        let Value::Inst(id) = phi else {
            return;
        };
        if let InstKind::Phi { incoming: slot } = &mut self.program.insts[id.0 as usize].kind {
            *slot = incoming;
        }
    }

    pub fn extract_value(&mut self, aggregate: Value, index: u32, ty: IrType) -> Value {
        self.push_value(InstKind::ExtractValue { aggregate, index }, ty)
    }

    pub fn jump(&mut self, target: BlockId) -> InstId {
        self.push(InstKind::Jump { target }, IrType::Void)
    }

    pub fn branch(&mut self, cond: Value, if_true: BlockId, if_false: BlockId) -> InstId {
        self.push(
            InstKind::Branch {
                cond,
                if_true,
                if_false,
            },
            IrType::Void,
        )
    }

    /// Switch on `cond`; case constants take the condition's width
    pub fn switch(&mut self, cond: Value, default: BlockId, cases: Vec<(i64, BlockId)>) -> InstId {
        let bits = self.program.value_type(cond).int_width().unwrap_or(32);
        let cases = cases
            .into_iter()
            .map(|(value, target)| (ConstInt::new(value, bits), target))
            .collect();
        self.push(
            InstKind::Switch {
                cond,
                default,
                cases,
            },
            IrType::Void,
        )
    }

    pub fn ret(&mut self, value: Option<Value>) -> InstId {
        self.push(InstKind::Return { value }, IrType::Void)
    }

    pub fn unreachable(&mut self) -> InstId {
        self.push(InstKind::Unreachable, IrType::Void)
    }
}
