/// Arena-form intermediate representation.
///
/// Values and basic blocks are u32 ids into per-function arenas; nothing in
/// the IR holds an owning pointer back to its function, so functions move
/// freely inside the module. Constants are value defs, inlined at their use
/// sites during emission. Every block carries at most one terminator; the
/// verifier requires exactly one on every reachable block.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum IrType {
    Void,
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Opaque pointer; strings and object references both lower to this.
    Ptr,
    /// Named struct type declared in the module type table.
    Struct(String),
}

impl IrType {
    pub fn is_int(&self) -> bool {
        matches!(self, IrType::I1 | IrType::I8 | IrType::I16 | IrType::I32 | IrType::I64)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, IrType::F32 | IrType::F64)
    }

    /// Storage size in bytes (structs are measured in 8-byte slots).
    pub fn size(&self, module: &IrModule) -> u64 {
        match self {
            IrType::Void => 0,
            IrType::I1 | IrType::I8 => 1,
            IrType::I16 => 2,
            IrType::I32 | IrType::F32 => 4,
            IrType::I64 | IrType::F64 | IrType::Ptr => 8,
            IrType::Struct(name) => module
                .struct_def(name)
                .map(|s| 8 * s.fields.len() as u64)
                .unwrap_or(8),
        }
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::Void => write!(f, "void"),
            IrType::I1 => write!(f, "i1"),
            IrType::I8 => write!(f, "i8"),
            IrType::I16 => write!(f, "i16"),
            IrType::I32 => write!(f, "i32"),
            IrType::I64 => write!(f, "i64"),
            IrType::F32 => write!(f, "float"),
            IrType::F64 => write!(f, "double"),
            IrType::Ptr => write!(f, "ptr"),
            IrType::Struct(name) => write!(f, "%{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(IrType, i64),
    Float(IrType, f64),
    Bool(bool),
    /// Pointer to a module-level global (string literal, vtable, slot).
    GlobalPtr(String),
    NullPtr,
}

/// How a value comes into existence.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueDef {
    /// Produced by the instruction that names this id as its result.
    Inst,
    Const(Constant),
    Param(usize),
}

#[derive(Debug, Clone)]
pub struct IrValueData {
    pub ty: IrType,
    pub def: ValueDef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    SDiv,
    SRem,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
    And,
    Or,
    Xor,
    Shl,
    AShr,
}

impl BinOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::SDiv => "sdiv",
            BinOp::SRem => "srem",
            BinOp::FAdd => "fadd",
            BinOp::FSub => "fsub",
            BinOp::FMul => "fmul",
            BinOp::FDiv => "fdiv",
            BinOp::FRem => "frem",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::AShr => "ashr",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            BinOp::FAdd | BinOp::FSub | BinOp::FMul | BinOp::FDiv | BinOp::FRem
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ICmpPred {
    Eq,
    Ne,
    Slt,
    Sgt,
    Sle,
    Sge,
}

impl ICmpPred {
    pub fn mnemonic(self) -> &'static str {
        match self {
            ICmpPred::Eq => "eq",
            ICmpPred::Ne => "ne",
            ICmpPred::Slt => "slt",
            ICmpPred::Sgt => "sgt",
            ICmpPred::Sle => "sle",
            ICmpPred::Sge => "sge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FCmpPred {
    Oeq,
    One,
    Olt,
    Ogt,
    Ole,
    Oge,
}

impl FCmpPred {
    pub fn mnemonic(self) -> &'static str {
        match self {
            FCmpPred::Oeq => "oeq",
            FCmpPred::One => "one",
            FCmpPred::Olt => "olt",
            FCmpPred::Ogt => "ogt",
            FCmpPred::Ole => "ole",
            FCmpPred::Oge => "oge",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    Alloca {
        ty: IrType,
    },
    Load {
        ty: IrType,
        ptr: ValueId,
    },
    Store {
        value: ValueId,
        ptr: ValueId,
    },
    Bin {
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    ICmp {
        pred: ICmpPred,
        lhs: ValueId,
        rhs: ValueId,
    },
    FCmp {
        pred: FCmpPred,
        lhs: ValueId,
        rhs: ValueId,
    },
    Call {
        callee: String,
        ret: IrType,
        args: Vec<ValueId>,
    },
    /// Field address inside a named struct (`getelementptr`). Index 0 is
    /// the vtable pointer slot.
    FieldPtr {
        struct_name: String,
        base: ValueId,
        index: usize,
    },
    /// Integer width/float conversions.
    Cast {
        kind: CastKind,
        value: ValueId,
        to: IrType,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    SiToFp,
    FpToSi,
    Trunc,
    Sext,
    Zext,
    FpExt,
    FpTrunc,
}

impl CastKind {
    pub fn mnemonic(self) -> &'static str {
        match self {
            CastKind::SiToFp => "sitofp",
            CastKind::FpToSi => "fptosi",
            CastKind::Trunc => "trunc",
            CastKind::Sext => "sext",
            CastKind::Zext => "zext",
            CastKind::FpExt => "fpext",
            CastKind::FpTrunc => "fptrunc",
        }
    }
}

impl InstKind {
    /// Instructions without observable effects may be removed when their
    /// result is unused.
    pub fn is_pure(&self) -> bool {
        !matches!(self, InstKind::Store { .. } | InstKind::Call { .. })
    }

    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            InstKind::Alloca { .. } => vec![],
            InstKind::Load { ptr, .. } => vec![*ptr],
            InstKind::Store { value, ptr } => vec![*value, *ptr],
            InstKind::Bin { lhs, rhs, .. }
            | InstKind::ICmp { lhs, rhs, .. }
            | InstKind::FCmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            InstKind::Call { args, .. } => args.clone(),
            InstKind::FieldPtr { base, .. } => vec![*base],
            InstKind::Cast { value, .. } => vec![*value],
        }
    }

    pub fn replace_operands(&mut self, map: &dyn Fn(ValueId) -> ValueId) {
        match self {
            InstKind::Alloca { .. } => {}
            InstKind::Load { ptr, .. } => *ptr = map(*ptr),
            InstKind::Store { value, ptr } => {
                *value = map(*value);
                *ptr = map(*ptr);
            }
            InstKind::Bin { lhs, rhs, .. }
            | InstKind::ICmp { lhs, rhs, .. }
            | InstKind::FCmp { lhs, rhs, .. } => {
                *lhs = map(*lhs);
                *rhs = map(*rhs);
            }
            InstKind::Call { args, .. } => {
                for a in args.iter_mut() {
                    *a = map(*a);
                }
            }
            InstKind::FieldPtr { base, .. } => *base = map(*base),
            InstKind::Cast { value, .. } => *value = map(*value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Inst {
    pub result: Option<ValueId>,
    pub kind: InstKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Br {
        target: BlockId,
    },
    CondBr {
        cond: ValueId,
        then_block: BlockId,
        else_block: BlockId,
    },
    Ret {
        value: Option<ValueId>,
    },
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Br { target } => vec![*target],
            Terminator::CondBr {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            Terminator::Ret { .. } | Terminator::Unreachable => vec![],
        }
    }
}

#[derive(Debug, Clone)]
pub struct IrBlock {
    pub label: String,
    pub insts: Vec<Inst>,
    pub terminator: Option<Terminator>,
}

#[derive(Debug, Clone)]
pub struct IrFunction {
    pub name: String,
    pub params: Vec<IrType>,
    pub ret: IrType,
    pub blocks: Vec<IrBlock>,
    pub values: Vec<IrValueData>,
    pub entry: BlockId,
    /// External declaration (no body).
    pub is_declaration: bool,
    /// Trailing `...` in the signature (libc printf).
    pub is_vararg: bool,
}

impl IrFunction {
    pub fn value(&self, id: ValueId) -> &IrValueData {
        &self.values[id.0 as usize]
    }

    pub fn block(&self, id: BlockId) -> &IrBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut IrBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn constant_of(&self, id: ValueId) -> Option<&Constant> {
        match &self.value(id).def {
            ValueDef::Const(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<IrType>,
}

#[derive(Debug, Clone)]
pub struct GlobalDef {
    pub name: String,
    /// Rendered type text (`i64`, `[2 x ptr]`).
    pub type_text: String,
    /// Rendered initializer (`0`, `null`, vtable array text).
    pub init: String,
    pub is_constant: bool,
}

#[derive(Debug, Clone)]
pub struct StringLiteral {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct IrModule {
    pub name: String,
    pub target_triple: String,
    pub data_layout: String,
    pub types: Vec<StructDef>,
    pub globals: Vec<GlobalDef>,
    pub strings: Vec<StringLiteral>,
    pub functions: Vec<IrFunction>,
}

impl IrModule {
    pub fn new(name: &str) -> Self {
        IrModule {
            name: name.to_string(),
            target_triple: "x86_64-unknown-linux-gnu".to_string(),
            data_layout: "e-m:e-p270:32:32-p271:32:32-p272:64:64-i64:64-f80:128-n8:16:32:64-S128"
                .to_string(),
            types: Vec::new(),
            globals: Vec::new(),
            strings: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn struct_def(&self, name: &str) -> Option<&StructDef> {
        self.types.iter().find(|s| s.name == name)
    }

    pub fn function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Intern a string literal, returning its global's name.
    pub fn intern_string(&mut self, text: &str) -> String {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        if let Some(existing) = self.strings.iter().find(|s| s.bytes == bytes) {
            return existing.name.clone();
        }
        let name = format!(".str.{}", self.strings.len());
        self.strings.push(StringLiteral {
            name: name.clone(),
            bytes,
        });
        name
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════

/// Appends instructions to a current block and allocates fresh value ids.
/// All `alloca`s land at the top of the entry block no matter when they are
/// requested.
pub struct FuncBuilder {
    pub func: IrFunction,
    current: BlockId,
    entry_alloca_count: usize,
}

impl FuncBuilder {
    pub fn new(name: &str, params: Vec<IrType>, ret: IrType) -> Self {
        let mut values = Vec::new();
        for (i, ty) in params.iter().enumerate() {
            values.push(IrValueData {
                ty: ty.clone(),
                def: ValueDef::Param(i),
            });
        }
        let entry = IrBlock {
            label: "entry".to_string(),
            insts: Vec::new(),
            terminator: None,
        };
        FuncBuilder {
            func: IrFunction {
                name: name.to_string(),
                params,
                ret,
                blocks: vec![entry],
                values,
                entry: BlockId(0),
                is_declaration: false,
                is_vararg: false,
            },
            current: BlockId(0),
            entry_alloca_count: 0,
        }
    }

    pub fn param(&self, index: usize) -> ValueId {
        ValueId(index as u32)
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    pub fn new_block(&mut self, label: impl Into<String>) -> BlockId {
        let id = BlockId(self.func.blocks.len() as u32);
        self.func.blocks.push(IrBlock {
            label: label.into(),
            insts: Vec::new(),
            terminator: None,
        });
        id
    }

    pub fn position_at_end(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn is_terminated(&self) -> bool {
        self.func.block(self.current).terminator.is_some()
    }

    fn new_value(&mut self, ty: IrType, def: ValueDef) -> ValueId {
        let id = ValueId(self.func.values.len() as u32);
        self.func.values.push(IrValueData { ty, def });
        id
    }

    fn push(&mut self, ty: IrType, kind: InstKind) -> ValueId {
        let result = self.new_value(ty, ValueDef::Inst);
        self.func.blocks[self.current.0 as usize].insts.push(Inst {
            result: Some(result),
            kind,
        });
        result
    }

    fn push_void(&mut self, kind: InstKind) {
        self.func.blocks[self.current.0 as usize]
            .insts
            .push(Inst { result: None, kind });
    }

    // ── Constants ────────────────────────────────────────────────────────

    pub fn const_int(&mut self, ty: IrType, v: i64) -> ValueId {
        self.new_value(ty.clone(), ValueDef::Const(Constant::Int(ty, v)))
    }

    pub fn const_float(&mut self, ty: IrType, v: f64) -> ValueId {
        self.new_value(ty.clone(), ValueDef::Const(Constant::Float(ty, v)))
    }

    pub fn const_bool(&mut self, v: bool) -> ValueId {
        self.new_value(IrType::I1, ValueDef::Const(Constant::Bool(v)))
    }

    pub fn const_null(&mut self) -> ValueId {
        self.new_value(IrType::Ptr, ValueDef::Const(Constant::NullPtr))
    }

    pub fn const_global(&mut self, global: impl Into<String>) -> ValueId {
        self.new_value(IrType::Ptr, ValueDef::Const(Constant::GlobalPtr(global.into())))
    }

    pub fn zero_of(&mut self, ty: &IrType) -> ValueId {
        match ty {
            IrType::F32 | IrType::F64 => self.const_float(ty.clone(), 0.0),
            IrType::Ptr | IrType::Struct(_) => self.const_null(),
            IrType::Void => self.const_int(IrType::I64, 0),
            other => self.const_int(other.clone(), 0),
        }
    }

    // ── Instructions ─────────────────────────────────────────────────────

    /// Allocate a stack slot; hoisted to the top of the entry block.
    pub fn alloca(&mut self, ty: IrType) -> ValueId {
        let result = self.new_value(IrType::Ptr, ValueDef::Inst);
        let at = self.entry_alloca_count;
        self.func.blocks[self.func.entry.0 as usize].insts.insert(
            at,
            Inst {
                result: Some(result),
                kind: InstKind::Alloca { ty },
            },
        );
        self.entry_alloca_count += 1;
        result
    }

    pub fn load(&mut self, ty: IrType, ptr: ValueId) -> ValueId {
        self.push(ty.clone(), InstKind::Load { ty, ptr })
    }

    pub fn store(&mut self, value: ValueId, ptr: ValueId) {
        self.push_void(InstKind::Store { value, ptr });
    }

    pub fn bin(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.func.value(lhs).ty.clone();
        self.push(ty, InstKind::Bin { op, lhs, rhs })
    }

    pub fn icmp(&mut self, pred: ICmpPred, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push(IrType::I1, InstKind::ICmp { pred, lhs, rhs })
    }

    pub fn fcmp(&mut self, pred: FCmpPred, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push(IrType::I1, InstKind::FCmp { pred, lhs, rhs })
    }

    pub fn call(&mut self, callee: &str, ret: IrType, args: Vec<ValueId>) -> Option<ValueId> {
        if ret == IrType::Void {
            self.push_void(InstKind::Call {
                callee: callee.to_string(),
                ret,
                args,
            });
            None
        } else {
            Some(self.push(
                ret.clone(),
                InstKind::Call {
                    callee: callee.to_string(),
                    ret,
                    args,
                },
            ))
        }
    }

    pub fn field_ptr(&mut self, struct_name: &str, base: ValueId, index: usize) -> ValueId {
        self.push(
            IrType::Ptr,
            InstKind::FieldPtr {
                struct_name: struct_name.to_string(),
                base,
                index,
            },
        )
    }

    pub fn cast(&mut self, kind: CastKind, value: ValueId, to: IrType) -> ValueId {
        self.push(to.clone(), InstKind::Cast { kind, value, to })
    }

    /// Numeric coercion helper; returns the value unchanged when the types
    /// already agree.
    pub fn coerce(&mut self, value: ValueId, to: &IrType) -> ValueId {
        let from = self.func.value(value).ty.clone();
        if &from == to {
            return value;
        }
        match (&from, to) {
            (f, t) if f.is_int() && t.is_float() => self.cast(CastKind::SiToFp, value, t.clone()),
            (f, t) if f.is_float() && t.is_int() => self.cast(CastKind::FpToSi, value, t.clone()),
            (IrType::F32, IrType::F64) => self.cast(CastKind::FpExt, value, IrType::F64),
            (IrType::F64, IrType::F32) => self.cast(CastKind::FpTrunc, value, IrType::F32),
            (f, t) if f.is_int() && t.is_int() => {
                if f.size_bits() < t.size_bits() {
                    self.cast(CastKind::Sext, value, t.clone())
                } else {
                    self.cast(CastKind::Trunc, value, t.clone())
                }
            }
            _ => value,
        }
    }

    // ── Terminators ──────────────────────────────────────────────────────

    pub fn br(&mut self, target: BlockId) {
        self.terminate(Terminator::Br { target });
    }

    pub fn cond_br(&mut self, cond: ValueId, then_block: BlockId, else_block: BlockId) {
        self.terminate(Terminator::CondBr {
            cond,
            then_block,
            else_block,
        });
    }

    pub fn ret(&mut self, value: Option<ValueId>) {
        self.terminate(Terminator::Ret { value });
    }

    pub fn unreachable(&mut self) {
        self.terminate(Terminator::Unreachable);
    }

    fn terminate(&mut self, term: Terminator) {
        let block = &mut self.func.blocks[self.current.0 as usize];
        if block.terminator.is_none() {
            block.terminator = Some(term);
        }
    }

    pub fn finish(self) -> IrFunction {
        self.func
    }
}

impl IrType {
    fn size_bits(&self) -> u32 {
        match self {
            IrType::I1 => 1,
            IrType::I8 => 8,
            IrType::I16 => 16,
            IrType::I32 | IrType::F32 => 32,
            _ => 64,
        }
    }
}
