/// Bytecode → IR lowering.
///
/// One bytecode function becomes one IR function. The operand stack is
/// simulated with SSA value ids; locals and parameters get `alloca` slots
/// hoisted to the top of the entry block. Basic blocks are keyed by the
/// branch targets discovered in a pre-scan; a conditional branch synthesizes
/// a fresh continuation block for its fall-through.
///
/// The lowering must agree with the engine on every rule it covers: numeric
/// promotion picks float variants when either side is floating, branch
/// coercion treats only `false` and null pointers as false, and integer
/// arithmetic wraps. Dynamic-only features (async, generators, iterators,
/// dynamic callees) have no native lowering and abort with a clear error.
use std::collections::{BTreeSet, HashMap};

use crate::bytecode::{Op, Program};
use crate::core::types::{MemberKind, TypeKind};
use crate::core::value::Value;
use crate::errors::BackendError;

use super::ir::{
    BinOp, BlockId, CastKind, FCmpPred, FuncBuilder, GlobalDef, ICmpPred, IrFunction, IrModule,
    IrType, StructDef, ValueId,
};

/// Lowered signature of one program function.
#[derive(Debug, Clone)]
pub struct FnSig {
    pub ir_name: String,
    pub params: Vec<IrType>,
    pub ret: IrType,
    pub takes_this: bool,
    /// Program type index of the owning class for method members.
    pub owner: Option<u32>,
}

pub fn lower_program(program: &Program, module_name: &str) -> Result<IrModule, BackendError> {
    let mut module = IrModule::new(module_name);

    // Class and struct types: opaque struct with a leading vtable pointer
    // slot plus one (i64) slot per declared field.
    for descriptor in &program.types {
        if matches!(descriptor.kind, TypeKind::Class | TypeKind::Struct) {
            let mut fields = vec![IrType::Ptr];
            fields.extend(std::iter::repeat(IrType::I64).take(descriptor.field_count()));
            module.types.push(StructDef {
                name: descriptor.name.clone(),
                fields,
            });
        }
    }

    let sigs = build_signatures(program)?;

    // Constant vtable globals for classes with virtual members.
    for descriptor in &program.types {
        if descriptor.virtuals.is_empty() {
            continue;
        }
        let mut entries = Vec::new();
        for virtual_name in &descriptor.virtuals {
            if let Some(MemberKind::Method { function }) = descriptor.member(virtual_name) {
                if let Some(sig) = sigs.get(function) {
                    entries.push(format!("ptr @{}", sig.ir_name));
                }
            }
        }
        module.globals.push(GlobalDef {
            name: format!("{}_vtable", descriptor.name),
            type_text: format!("[{} x ptr]", entries.len()),
            init: format!("[{}]", entries.join(", ")),
            is_constant: true,
        });
    }

    // Global slots.
    for i in 0..program.global_count {
        module.globals.push(GlobalDef {
            name: format!("g{}", i),
            type_text: "i64".to_string(),
            init: "0".to_string(),
            is_constant: false,
        });
    }

    declare_libc(&mut module);
    for f in intrinsic_functions() {
        module.functions.push(f);
    }

    for (idx, record) in program.functions.iter().enumerate() {
        if !record.is_callable() {
            continue;
        }
        let lowered = FnLowering::new(program, &mut module, &sigs, idx as u32)?.lower()?;
        module.functions.push(lowered);
    }

    module.functions.push(synthesize_entry(program, &sigs));

    Ok(module)
}

/// Method members get `<Class>_<member>` names and a leading `this`
/// parameter; a plain user `main` is renamed so the synthesized entry can
/// own the `main` symbol. Return type is `i64` when the body ever executes
/// a value-carrying `Return`, else void.
fn build_signatures(program: &Program) -> Result<HashMap<u32, FnSig>, BackendError> {
    let mut method_names: HashMap<u32, (String, u32)> = HashMap::new();
    for (type_idx, descriptor) in program.types.iter().enumerate() {
        for (member_name, member) in &descriptor.members {
            if let MemberKind::Method { function } = member {
                method_names.insert(
                    *function,
                    (
                        format!("{}_{}", descriptor.name, member_name),
                        type_idx as u32,
                    ),
                );
            }
        }
    }

    let mut sigs = HashMap::new();
    for (idx, record) in program.functions.iter().enumerate() {
        if !record.is_callable() {
            continue;
        }
        let idx = idx as u32;
        let takes_this = method_names.contains_key(&idx);
        let owner = method_names.get(&idx).map(|(_, t)| *t);
        let ir_name = method_names.get(&idx).map(|(n, _)| n.clone()).unwrap_or_else(|| {
            if record.name == "main" {
                "ouro_main".to_string()
            } else {
                record.name.replace('.', "_")
            }
        });
        let ret = if body_returns_value(program, record.start_offset as usize, record.end_offset as usize)
            .map_err(|e| BackendError::ModuleVerificationFailed {
                function: record.name.clone(),
                reason: e.to_string(),
            })? {
            IrType::I64
        } else {
            IrType::Void
        };
        let mut params = Vec::new();
        if takes_this {
            params.push(IrType::Ptr);
        }
        params.extend(std::iter::repeat(IrType::I64).take(record.parameter_count as usize));
        sigs.insert(
            idx,
            FnSig {
                ir_name,
                params,
                ret,
                takes_this,
                owner,
            },
        );
    }
    Ok(sigs)
}

fn body_returns_value(
    program: &Program,
    start: usize,
    end: usize,
) -> Result<bool, crate::errors::VmError> {
    let mut at = start;
    while at < end {
        let (op, _, next) = program.decode(at)?;
        if op == Op::Return {
            return Ok(true);
        }
        at = next;
    }
    Ok(false)
}

fn declaration(name: &str, params: Vec<IrType>, ret: IrType, is_vararg: bool) -> IrFunction {
    IrFunction {
        name: name.to_string(),
        params,
        ret,
        blocks: Vec::new(),
        values: Vec::new(),
        entry: BlockId(0),
        is_declaration: true,
        is_vararg,
    }
}

fn declare_libc(module: &mut IrModule) {
    module
        .functions
        .push(declaration("malloc", vec![IrType::I64], IrType::Ptr, false));
    module
        .functions
        .push(declaration("free", vec![IrType::Ptr], IrType::Void, false));
    module
        .functions
        .push(declaration("printf", vec![IrType::Ptr], IrType::I32, true));
    module
        .functions
        .push(declaration("exit", vec![IrType::I32], IrType::Void, false));
    module.functions.push(declaration(
        "pow",
        vec![IrType::F64, IrType::F64],
        IrType::F64,
        false,
    ));
}

/// Runtime intrinsics with default bodies delegating to libc.
fn intrinsic_functions() -> Vec<IrFunction> {
    let mut out = Vec::new();

    let mut b = FuncBuilder::new("ouroboros_alloc", vec![IrType::I64], IrType::Ptr);
    let size = b.param(0);
    let p = b.call("malloc", IrType::Ptr, vec![size]).unwrap();
    b.ret(Some(p));
    out.push(b.finish());

    let mut b = FuncBuilder::new("ouroboros_free", vec![IrType::Ptr], IrType::Void);
    let p = b.param(0);
    b.call("free", IrType::Void, vec![p]);
    b.ret(None);
    out.push(b.finish());

    let mut b = FuncBuilder::new("ouroboros_gc_collect", vec![], IrType::Void);
    b.ret(None);
    out.push(b.finish());

    let mut b = FuncBuilder::new("ouroboros_throw", vec![IrType::Ptr], IrType::Void);
    let one = b.const_int(IrType::I32, 1);
    b.call("exit", IrType::Void, vec![one]);
    b.unreachable();
    out.push(b.finish());

    let mut b = FuncBuilder::new("ouroboros_print", vec![IrType::Ptr], IrType::Void);
    let s = b.param(0);
    b.call("printf", IrType::I32, vec![s]);
    b.ret(None);
    out.push(b.finish());

    out
}

/// `main() → i32`: call the user `main` if declared, coerce an integer
/// result, return 0 otherwise.
fn synthesize_entry(program: &Program, sigs: &HashMap<u32, FnSig>) -> IrFunction {
    let mut b = FuncBuilder::new("main", vec![], IrType::I32);
    let user_main = program
        .function_by_name("main")
        .filter(|(_, f)| f.is_callable())
        .and_then(|(idx, _)| sigs.get(&idx));
    match user_main {
        Some(sig) => {
            let args: Vec<ValueId> = sig
                .params
                .iter()
                .map(|ty| b.zero_of(&ty.clone()))
                .collect();
            let result = b.call(&sig.ir_name, sig.ret.clone(), args);
            match result {
                Some(v) if b.func.value(v).ty == IrType::I64 => {
                    let truncated = b.cast(CastKind::Trunc, v, IrType::I32);
                    b.ret(Some(truncated));
                }
                Some(v) if b.func.value(v).ty == IrType::I32 => b.ret(Some(v)),
                _ => {
                    let zero = b.const_int(IrType::I32, 0);
                    b.ret(Some(zero));
                }
            }
        }
        None => {
            let zero = b.const_int(IrType::I32, 0);
            b.ret(Some(zero));
        }
    }
    b.finish()
}

// ═══════════════════════════════════════════════════════════════════════════
// Per-function lowering
// ═══════════════════════════════════════════════════════════════════════════

/// One simulated operand-stack slot. `callee` is carried from string
/// constants so `Call` can resolve statically; `class` is carried from `New`
/// so member opcodes know the receiver's layout.
#[derive(Clone)]
struct Entry {
    value: ValueId,
    callee: Option<String>,
    class: Option<u32>,
}

impl Entry {
    fn plain(value: ValueId) -> Self {
        Entry {
            value,
            callee: None,
            class: None,
        }
    }
}

struct FnLowering<'a> {
    program: &'a Program,
    module: &'a mut IrModule,
    sigs: &'a HashMap<u32, FnSig>,
    fn_name: String,
    start: usize,
    end: usize,
    b: FuncBuilder,
    blocks: HashMap<usize, BlockId>,
    /// Alloca slots for VM locals (captures are not modelled natively).
    slots: Vec<ValueId>,
    this_slot: Option<ValueId>,
    this_class: Option<u32>,
    stack: Vec<Entry>,
}

impl<'a> FnLowering<'a> {
    fn new(
        program: &'a Program,
        module: &'a mut IrModule,
        sigs: &'a HashMap<u32, FnSig>,
        fn_index: u32,
    ) -> Result<Self, BackendError> {
        let record = &program.functions[fn_index as usize];
        let sig = &sigs[&fn_index];
        let mut b = FuncBuilder::new(&sig.ir_name, sig.params.clone(), sig.ret.clone());

        // Entry block shape: every parameter gets an alloca and the incoming
        // value is stored there; locals get zero-initialized slots.
        let mut this_slot = None;
        let mut slots = Vec::new();
        let param_offset = if sig.takes_this { 1 } else { 0 };
        if sig.takes_this {
            let slot = b.alloca(IrType::Ptr);
            let incoming = b.param(0);
            b.store(incoming, slot);
            this_slot = Some(slot);
        }
        for i in 0..record.parameter_count as usize {
            let slot = b.alloca(IrType::I64);
            let incoming = b.param(param_offset + i);
            b.store(incoming, slot);
            slots.push(slot);
        }
        for _ in 0..record.local_count as usize {
            let slot = b.alloca(IrType::I64);
            let zero = b.const_int(IrType::I64, 0);
            b.store(zero, slot);
            slots.push(slot);
        }

        let start = record.start_offset as usize;
        let end = record.end_offset as usize;
        let mut lowering = FnLowering {
            program,
            module,
            sigs,
            fn_name: record.name.clone(),
            start,
            end,
            b,
            blocks: HashMap::new(),
            slots,
            this_slot,
            this_class: sig.owner,
            stack: Vec::new(),
        };
        lowering.scan_branch_targets()?;
        Ok(lowering)
    }

    fn unsupported(&self, what: impl Into<String>) -> BackendError {
        BackendError::Unsupported {
            function: self.fn_name.clone(),
            what: what.into(),
        }
    }

    fn decode_error(&self, e: crate::errors::VmError) -> BackendError {
        BackendError::ModuleVerificationFailed {
            function: self.fn_name.clone(),
            reason: e.to_string(),
        }
    }

    /// Pre-scan: every branch target becomes a basic block.
    fn scan_branch_targets(&mut self) -> Result<(), BackendError> {
        let mut targets = BTreeSet::new();
        let mut at = self.start;
        while at < self.end {
            let (op, imms, next) = self.program.decode(at).map_err(|e| self.decode_error(e))?;
            if op.is_branch() {
                let target = (next as i64 + imms[0] as i32 as i64) as usize;
                targets.insert(target);
            }
            at = next;
        }
        for target in targets {
            let bb = self.b.new_block(format!("bc{}", target));
            self.blocks.insert(target, bb);
        }
        Ok(())
    }

    fn lower(mut self) -> Result<IrFunction, BackendError> {
        let mut at = self.start;
        while at < self.end {
            if let Some(&bb) = self.blocks.get(&at) {
                if !self.b.is_terminated() {
                    if !self.stack.is_empty() {
                        return Err(self.unsupported("operand stack not empty at a merge point"));
                    }
                    self.b.br(bb);
                }
                self.stack.clear();
                self.b.position_at_end(bb);
            } else if self.b.is_terminated() {
                // Unreachable tail after a return/jump with no label.
                let dead = self.b.new_block(format!("dead{}", at));
                self.stack.clear();
                self.b.position_at_end(dead);
            }
            let (op, imms, next) = self.program.decode(at).map_err(|e| self.decode_error(e))?;
            self.lower_op(op, &imms, next)?;
            at = next;
        }

        // Synthesize terminators for any block left open, including bodies
        // that fall off the end without a Return.
        let ret_ty = self.b.func.ret.clone();
        for i in 0..self.b.func.blocks.len() {
            let id = BlockId(i as u32);
            if self.b.func.block(id).terminator.is_none() {
                self.b.position_at_end(id);
                if ret_ty == IrType::Void {
                    self.b.ret(None);
                } else {
                    let zero = self.b.zero_of(&ret_ty);
                    self.b.ret(Some(zero));
                }
            }
        }

        Ok(self.b.finish())
    }

    // ── Stack helpers ────────────────────────────────────────────────────

    fn push(&mut self, entry: Entry) {
        self.stack.push(entry);
    }

    fn push_value(&mut self, value: ValueId) {
        self.stack.push(Entry::plain(value));
    }

    fn pop(&mut self) -> Result<Entry, BackendError> {
        self.stack
            .pop()
            .ok_or_else(|| self.unsupported("operand stack underflow during lowering"))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Entry>, BackendError> {
        if self.stack.len() < n {
            return Err(self.unsupported("operand stack underflow during lowering"));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn ty(&self, v: ValueId) -> IrType {
        self.b.func.value(v).ty.clone()
    }

    fn slot(&mut self, index: usize) -> ValueId {
        while index >= self.slots.len() {
            let slot = self.b.alloca(IrType::I64);
            let zero = self.b.const_int(IrType::I64, 0);
            self.b.store(zero, slot);
            self.slots.push(slot);
        }
        self.slots[index]
    }

    fn block_at(&mut self, offset: usize) -> BlockId {
        if let Some(&bb) = self.blocks.get(&offset) {
            return bb;
        }
        let bb = self.b.new_block(format!("bc{}", offset));
        self.blocks.insert(offset, bb);
        bb
    }

    /// Branch coercion, identical to the engine: `false` and null pointers
    /// are false, every other value is true.
    fn coerce_to_bool(&mut self, v: ValueId) -> ValueId {
        match self.ty(v) {
            IrType::I1 => v,
            IrType::Ptr => {
                let null = self.b.const_null();
                self.b.icmp(ICmpPred::Ne, v, null)
            }
            _ => self.b.const_bool(true),
        }
    }

    // ── Opcode table ─────────────────────────────────────────────────────

    fn lower_op(&mut self, op: Op, imms: &[u32], next: usize) -> Result<(), BackendError> {
        let branch_target = |imm: u32| (next as i64 + imm as i32 as i64) as usize;
        match op {
            Op::Nop
            | Op::BeginTry
            | Op::BeginCatch
            | Op::BeginFinally
            | Op::EndFinally
            | Op::BeginAsync
            | Op::EndAsync
            | Op::BeginParallel
            | Op::EndParallel
            | Op::SetParallelism
            | Op::Import
            | Op::DefineClass
            | Op::DefineInterface
            | Op::DefineStruct
            | Op::DefineEnum
            | Op::DefineFunction => {}

            Op::Halt => {
                let ret_ty = self.b.func.ret.clone();
                if ret_ty == IrType::Void {
                    self.b.ret(None);
                } else {
                    let zero = self.b.zero_of(&ret_ty);
                    self.b.ret(Some(zero));
                }
            }

            // ── Branches ─────────────────────────────────────────────────
            Op::Jump | Op::Break | Op::Continue => {
                if !self.stack.is_empty() {
                    return Err(self.unsupported("operand stack not empty at a branch"));
                }
                let bb = self.block_at(branch_target(imms[0]));
                self.b.br(bb);
            }
            Op::JumpIfTrue | Op::JumpIfFalse => {
                let cond_entry = self.pop()?;
                if !self.stack.is_empty() {
                    return Err(self.unsupported("operand stack not empty at a branch"));
                }
                let cond = self.coerce_to_bool(cond_entry.value);
                let target = self.block_at(branch_target(imms[0]));
                let cont = self.b.new_block(format!("cont{}", next));
                if op == Op::JumpIfTrue {
                    self.b.cond_br(cond, target, cont);
                } else {
                    self.b.cond_br(cond, cont, target);
                }
                self.b.position_at_end(cont);
            }

            // ── Calls & returns ──────────────────────────────────────────
            Op::Call => {
                let argc = imms[0] as usize;
                let callee = self.pop()?;
                let args = self.pop_n(argc)?;
                let name = callee
                    .callee
                    .ok_or_else(|| self.unsupported("dynamic callee in Call"))?;
                self.lower_named_call(&name, args)?;
            }
            Op::Return => {
                let ret_ty = self.b.func.ret.clone();
                let value = match self.stack.pop() {
                    Some(entry) => entry.value,
                    None => self.b.zero_of(&ret_ty),
                };
                if ret_ty == IrType::Void {
                    self.b.ret(None);
                } else {
                    let coerced = self.b.coerce(value, &ret_ty);
                    self.b.ret(Some(coerced));
                }
            }
            Op::ReturnVoid => {
                let ret_ty = self.b.func.ret.clone();
                if ret_ty == IrType::Void {
                    self.b.ret(None);
                } else {
                    let zero = self.b.zero_of(&ret_ty);
                    self.b.ret(Some(zero));
                }
            }

            // ── Stack ────────────────────────────────────────────────────
            Op::Pop => {
                self.pop()?;
            }
            Op::Dup => {
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| self.unsupported("operand stack underflow during lowering"))?;
                self.push(top);
            }
            Op::Dup2 => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(self.unsupported("operand stack underflow during lowering"));
                }
                let a = self.stack[len - 2].clone();
                let b = self.stack[len - 1].clone();
                self.push(a);
                self.push(b);
            }
            Op::Swap => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(self.unsupported("operand stack underflow during lowering"));
                }
                self.stack.swap(len - 2, len - 1);
            }

            // ── Loads / stores ───────────────────────────────────────────
            Op::LoadConstant => {
                let constant = self
                    .program
                    .constant(imms[0])
                    .map_err(|e| self.decode_error(e))?
                    .clone();
                self.lower_constant(constant)?;
            }
            Op::LoadLocal => {
                let slot = self.slot(imms[0] as usize);
                let v = self.b.load(IrType::I64, slot);
                self.push_value(v);
            }
            Op::StoreLocal => {
                let entry = self.pop()?;
                let coerced = self.b.coerce(entry.value, &IrType::I64);
                let slot = self.slot(imms[0] as usize);
                self.b.store(coerced, slot);
            }
            Op::LoadGlobal => {
                let gptr = self.b.const_global(format!("g{}", imms[0]));
                let v = self.b.load(IrType::I64, gptr);
                self.push_value(v);
            }
            Op::StoreGlobal => {
                let entry = self.pop()?;
                let coerced = self.b.coerce(entry.value, &IrType::I64);
                let gptr = self.b.const_global(format!("g{}", imms[0]));
                self.b.store(coerced, gptr);
            }
            Op::LoadTrue => {
                let v = self.b.const_bool(true);
                self.push_value(v);
            }
            Op::LoadFalse => {
                let v = self.b.const_bool(false);
                self.push_value(v);
            }
            Op::LoadNull => {
                let v = self.b.const_null();
                self.push_value(v);
            }
            Op::LoadThis => match self.this_slot {
                Some(slot) => {
                    let v = self.b.load(IrType::Ptr, slot);
                    let class = self.this_class;
                    self.push(Entry {
                        value: v,
                        callee: None,
                        class,
                    });
                }
                None => {
                    let v = self.b.const_null();
                    self.push_value(v);
                }
            },

            // ── Arithmetic ───────────────────────────────────────────────
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::IntDiv => {
                self.lower_arith(op)?;
            }
            Op::Pow => {
                let r = self.pop()?;
                let l = self.pop()?;
                let lf = self.b.coerce(l.value, &IrType::F64);
                let rf = self.b.coerce(r.value, &IrType::F64);
                let v = self.b.call("pow", IrType::F64, vec![lf, rf]).unwrap();
                self.push_value(v);
            }
            Op::Neg => {
                let entry = self.pop()?;
                let ty = self.ty(entry.value);
                let v = if ty.is_float() {
                    let zero = self.b.const_float(ty, 0.0);
                    self.b.bin(BinOp::FSub, zero, entry.value)
                } else if ty.is_int() {
                    let zero = self.b.const_int(ty, 0);
                    self.b.bin(BinOp::Sub, zero, entry.value)
                } else {
                    return Err(self.unsupported("negation of a non-numeric value"));
                };
                self.push_value(v);
            }

            // ── Comparison ───────────────────────────────────────────────
            Op::Equal => self.lower_compare(ICmpPred::Eq, FCmpPred::Oeq, true)?,
            Op::NotEqual => self.lower_compare(ICmpPred::Ne, FCmpPred::One, true)?,
            Op::Less => self.lower_compare(ICmpPred::Slt, FCmpPred::Olt, false)?,
            Op::Greater => self.lower_compare(ICmpPred::Sgt, FCmpPred::Ogt, false)?,
            Op::LessEq => self.lower_compare(ICmpPred::Sle, FCmpPred::Ole, false)?,
            Op::GreaterEq => self.lower_compare(ICmpPred::Sge, FCmpPred::Oge, false)?,
            Op::Compare | Op::SpaceshipCompare => {
                let r = self.pop()?;
                let l = self.pop()?;
                let (lv, rv, float) = self.promote_pair(l.value, r.value)?;
                let (gt, lt) = if float {
                    (
                        self.b.fcmp(FCmpPred::Ogt, lv, rv),
                        self.b.fcmp(FCmpPred::Olt, lv, rv),
                    )
                } else {
                    (
                        self.b.icmp(ICmpPred::Sgt, lv, rv),
                        self.b.icmp(ICmpPred::Slt, lv, rv),
                    )
                };
                let gt32 = self.b.cast(CastKind::Zext, gt, IrType::I32);
                let lt32 = self.b.cast(CastKind::Zext, lt, IrType::I32);
                let v = self.b.bin(BinOp::Sub, gt32, lt32);
                self.push_value(v);
            }

            // ── Logical ──────────────────────────────────────────────────
            Op::And | Op::Or => {
                let r = self.pop()?;
                let l = self.pop()?;
                if self.ty(l.value) != IrType::I1 || self.ty(r.value) != IrType::I1 {
                    return Err(self.unsupported("logical op on non-boolean operands"));
                }
                let bin = if op == Op::And { BinOp::And } else { BinOp::Or };
                let v = self.b.bin(bin, l.value, r.value);
                self.push_value(v);
            }
            Op::Not => {
                let entry = self.pop()?;
                if self.ty(entry.value) != IrType::I1 {
                    return Err(self.unsupported("logical not on a non-boolean operand"));
                }
                let t = self.b.const_bool(true);
                let v = self.b.bin(BinOp::Xor, entry.value, t);
                self.push_value(v);
            }

            // ── Bitwise ──────────────────────────────────────────────────
            Op::BAnd | Op::BOr | Op::BXor | Op::Shl | Op::Shr => {
                let r = self.pop()?;
                let l = self.pop()?;
                if !self.ty(l.value).is_int() || !self.ty(r.value).is_int() {
                    return Err(self.unsupported("bitwise op on non-integer operands"));
                }
                let (lv, rv, _) = self.promote_pair(l.value, r.value)?;
                let bin = match op {
                    Op::BAnd => BinOp::And,
                    Op::BOr => BinOp::Or,
                    Op::BXor => BinOp::Xor,
                    Op::Shl => BinOp::Shl,
                    _ => BinOp::AShr,
                };
                let v = self.b.bin(bin, lv, rv);
                self.push_value(v);
            }
            Op::BNot => {
                let entry = self.pop()?;
                let ty = self.ty(entry.value);
                if !ty.is_int() {
                    return Err(self.unsupported("bitwise not on a non-integer operand"));
                }
                let minus_one = self.b.const_int(ty, -1);
                let v = self.b.bin(BinOp::Xor, entry.value, minus_one);
                self.push_value(v);
            }

            // ── Objects ──────────────────────────────────────────────────
            Op::New => self.lower_new(imms[0], imms[1] as usize)?,
            Op::LoadMember => {
                let member = self
                    .program
                    .name_constant(imms[0])
                    .map_err(|e| self.decode_error(e))?
                    .to_string();
                let receiver = self.pop()?;
                self.lower_load_field(receiver, &member)?;
            }
            Op::StoreMember => {
                let member = self
                    .program
                    .name_constant(imms[0])
                    .map_err(|e| self.decode_error(e))?
                    .to_string();
                let value = self.pop()?;
                let receiver = self.pop()?;
                self.lower_store_field(receiver, &member, value)?;
            }
            Op::CallMethod => {
                let member = self
                    .program
                    .name_constant(imms[0])
                    .map_err(|e| self.decode_error(e))?
                    .to_string();
                let argc = imms[1] as usize;
                let args = self.pop_n(argc)?;
                let receiver = self.pop()?;
                self.lower_call_method(receiver, &member, args)?;
            }

            // ── Types ────────────────────────────────────────────────────
            Op::SizeOf => {
                let name = self
                    .program
                    .name_constant(imms[0])
                    .map_err(|e| self.decode_error(e))?
                    .to_string();
                let size = self.static_size_of(&name)?;
                let v = self.b.const_int(IrType::I64, size);
                self.push_value(v);
            }
            Op::Cast => {
                let name = self
                    .program
                    .name_constant(imms[0])
                    .map_err(|e| self.decode_error(e))?
                    .to_string();
                let entry = self.pop()?;
                let target = match name.as_str() {
                    "i32" => IrType::I32,
                    "i64" => IrType::I64,
                    "f32" => IrType::F32,
                    "f64" => IrType::F64,
                    _ => return Err(self.unsupported(format!("cast to '{}'", name))),
                };
                let v = self.b.coerce(entry.value, &target);
                self.push_value(v);
            }

            // ── Exceptions (native flow terminates) ──────────────────────
            Op::Throw | Op::Rethrow | Op::ThrowMatchError => {
                let arg = if op == Op::Throw {
                    let entry = self.pop()?;
                    if self.ty(entry.value) == IrType::Ptr {
                        entry.value
                    } else {
                        self.b.const_null()
                    }
                } else {
                    self.b.const_null()
                };
                self.b.call("ouroboros_throw", IrType::Void, vec![arg]);
                self.b.unreachable();
            }

            other => {
                return Err(self.unsupported(format!(
                    "opcode {} has no native lowering",
                    other.name()
                )))
            }
        }
        Ok(())
    }

    fn lower_constant(&mut self, constant: Value) -> Result<(), BackendError> {
        match constant {
            Value::Null => {
                let v = self.b.const_null();
                self.push_value(v);
            }
            Value::Bool(x) => {
                let v = self.b.const_bool(x);
                self.push_value(v);
            }
            Value::I32(x) => {
                let v = self.b.const_int(IrType::I32, x as i64);
                self.push_value(v);
            }
            Value::I64(x) => {
                let v = self.b.const_int(IrType::I64, x);
                self.push_value(v);
            }
            Value::F32(x) => {
                let v = self.b.const_float(IrType::F32, x as f64);
                self.push_value(v);
            }
            Value::F64(x) => {
                let v = self.b.const_float(IrType::F64, x);
                self.push_value(v);
            }
            Value::Str(s) => {
                let global = self.module.intern_string(&s);
                let v = self.b.const_global(global);
                self.push(Entry {
                    value: v,
                    callee: Some(s.to_string()),
                    class: None,
                });
            }
            other => {
                return Err(self.unsupported(format!(
                    "constant of type {} in native code",
                    other.type_name()
                )))
            }
        }
        Ok(())
    }

    fn lower_arith(&mut self, op: Op) -> Result<(), BackendError> {
        let r = self.pop()?;
        let l = self.pop()?;
        let (lv, rv, float) = self.promote_pair(l.value, r.value)?;
        if op == Op::IntDiv && float {
            return Err(self.unsupported("integer division on float operands"));
        }
        let bin = match (op, float) {
            (Op::Add, false) => BinOp::Add,
            (Op::Sub, false) => BinOp::Sub,
            (Op::Mul, false) => BinOp::Mul,
            (Op::Div, false) | (Op::IntDiv, false) => BinOp::SDiv,
            (Op::Mod, false) => BinOp::SRem,
            (Op::Add, true) => BinOp::FAdd,
            (Op::Sub, true) => BinOp::FSub,
            (Op::Mul, true) => BinOp::FMul,
            (Op::Div, true) => BinOp::FDiv,
            (Op::Mod, true) => BinOp::FRem,
            _ => return Err(self.unsupported("arithmetic operator")),
        };
        let v = self.b.bin(bin, lv, rv);
        self.push_value(v);
        Ok(())
    }

    /// Numeric promotion mirroring the engine: either side floating → both
    /// to f64; else both to the wider integer.
    fn promote_pair(
        &mut self,
        l: ValueId,
        r: ValueId,
    ) -> Result<(ValueId, ValueId, bool), BackendError> {
        let lt = self.ty(l);
        let rt = self.ty(r);
        if lt == IrType::Ptr && rt == IrType::Ptr {
            return Ok((l, r, false));
        }
        if !(lt.is_int() || lt.is_float()) || !(rt.is_int() || rt.is_float()) {
            return Err(self.unsupported("arithmetic on non-numeric operands"));
        }
        if lt.is_float() || rt.is_float() {
            let lf = self.b.coerce(l, &IrType::F64);
            let rf = self.b.coerce(r, &IrType::F64);
            Ok((lf, rf, true))
        } else {
            let wide = if lt == IrType::I64 || rt == IrType::I64 {
                IrType::I64
            } else {
                IrType::I32
            };
            let li = self.b.coerce(l, &wide);
            let ri = self.b.coerce(r, &wide);
            Ok((li, ri, false))
        }
    }

    fn lower_compare(
        &mut self,
        ipred: ICmpPred,
        fpred: FCmpPred,
        allow_ptr: bool,
    ) -> Result<(), BackendError> {
        let r = self.pop()?;
        let l = self.pop()?;
        let lt = self.ty(l.value);
        let rt = self.ty(r.value);
        if lt == IrType::Ptr && rt == IrType::Ptr {
            if !allow_ptr {
                return Err(self.unsupported("ordering comparison on pointers"));
            }
            let v = self.b.icmp(ipred, l.value, r.value);
            self.push_value(v);
            return Ok(());
        }
        let (lv, rv, float) = self.promote_pair(l.value, r.value)?;
        let v = if float {
            self.b.fcmp(fpred, lv, rv)
        } else {
            self.b.icmp(ipred, lv, rv)
        };
        self.push_value(v);
        Ok(())
    }

    fn lower_named_call(&mut self, name: &str, args: Vec<Entry>) -> Result<(), BackendError> {
        if let Some((idx, record)) = self.program.function_by_name(name) {
            if record.is_callable() {
                let sig = self.sigs[&idx].clone();
                if sig.takes_this {
                    return Err(self.unsupported(format!("method '{}' called without receiver", name)));
                }
                if args.len() != sig.params.len() {
                    return Err(self.unsupported(format!(
                        "'{}' expects {} arguments, got {}",
                        name,
                        sig.params.len(),
                        args.len()
                    )));
                }
                let mut coerced = Vec::with_capacity(args.len());
                for (entry, ty) in args.iter().zip(sig.params.iter()) {
                    coerced.push(self.b.coerce(entry.value, ty));
                }
                if let Some(v) = self.b.call(&sig.ir_name, sig.ret.clone(), coerced) {
                    self.push_value(v);
                }
                return Ok(());
            }
        }
        // Host callable: declare an external with the call-site argument
        // types; floating arguments imply a floating return, integers imply
        // i64 (the native FFI convention for host shims).
        let mangled = name.replace('.', "_");
        let param_tys: Vec<IrType> = args.iter().map(|a| self.ty(a.value)).collect();
        let ret = if param_tys.iter().any(|t| t.is_float()) {
            IrType::F64
        } else {
            IrType::I64
        };
        if self.module.function(&mangled).is_none() {
            let decl = declaration(&mangled, param_tys, ret.clone(), false);
            self.module.functions.push(decl);
        }
        let arg_ids: Vec<ValueId> = args.iter().map(|a| a.value).collect();
        if let Some(v) = self.b.call(&mangled, ret, arg_ids) {
            self.push_value(v);
        }
        Ok(())
    }

    fn lower_new(&mut self, type_idx: u32, argc: usize) -> Result<(), BackendError> {
        let descriptor = self
            .program
            .types
            .get(type_idx as usize)
            .cloned()
            .ok_or_else(|| self.unsupported("type index out of range"))?;
        let args = self.pop_n(argc)?;
        let size = 8 * (1 + descriptor.field_count()) as i64;
        let size_v = self.b.const_int(IrType::I64, size);
        let obj = self
            .b
            .call("ouroboros_alloc", IrType::Ptr, vec![size_v])
            .unwrap();

        // Vtable pointer (or null for vtable-less types) in slot 0.
        let vtable = if descriptor.virtuals.is_empty() {
            self.b.const_null()
        } else {
            self.b.const_global(format!("{}_vtable", descriptor.name))
        };
        let slot0 = self.b.field_ptr(&descriptor.name, obj, 0);
        self.b.store(vtable, slot0);

        if let Some(MemberKind::Method { function }) = descriptor.member("init") {
            let sig = self.sigs[function].clone();
            let mut call_args = vec![obj];
            for (entry, ty) in args.iter().zip(sig.params.iter().skip(1)) {
                call_args.push(self.b.coerce(entry.value, ty));
            }
            self.b.call(&sig.ir_name, sig.ret, call_args);
        } else if !args.is_empty() {
            return Err(self.unsupported(format!(
                "'{}' has no init but New carries arguments",
                descriptor.name
            )));
        }

        self.push(Entry {
            value: obj,
            callee: None,
            class: Some(type_idx),
        });
        Ok(())
    }

    fn field_slot(&self, class: u32, member: &str) -> Option<(String, usize)> {
        let descriptor = self.program.types.get(class as usize)?;
        match descriptor.member(member)? {
            MemberKind::Field { slot } => Some((descriptor.name.clone(), slot + 1)),
            _ => None,
        }
    }

    fn lower_load_field(&mut self, receiver: Entry, member: &str) -> Result<(), BackendError> {
        let class = receiver
            .class
            .ok_or_else(|| self.unsupported(format!("member '{}' on a receiver of unknown class", member)))?;
        let (struct_name, index) = self
            .field_slot(class, member)
            .ok_or_else(|| self.unsupported(format!("member '{}' is not a stored field", member)))?;
        let ptr = self.b.field_ptr(&struct_name, receiver.value, index);
        let v = self.b.load(IrType::I64, ptr);
        self.push_value(v);
        Ok(())
    }

    fn lower_store_field(
        &mut self,
        receiver: Entry,
        member: &str,
        value: Entry,
    ) -> Result<(), BackendError> {
        let class = receiver
            .class
            .ok_or_else(|| self.unsupported(format!("member '{}' on a receiver of unknown class", member)))?;
        let (struct_name, index) = self
            .field_slot(class, member)
            .ok_or_else(|| self.unsupported(format!("member '{}' is not a stored field", member)))?;
        let ptr = self.b.field_ptr(&struct_name, receiver.value, index);
        let coerced = self.b.coerce(value.value, &IrType::I64);
        self.b.store(coerced, ptr);
        Ok(())
    }

    fn lower_call_method(
        &mut self,
        receiver: Entry,
        member: &str,
        args: Vec<Entry>,
    ) -> Result<(), BackendError> {
        let class = receiver
            .class
            .ok_or_else(|| self.unsupported(format!("method '{}' on a receiver of unknown class", member)))?;
        let descriptor = self
            .program
            .types
            .get(class as usize)
            .ok_or_else(|| self.unsupported("type index out of range"))?;
        let function = match descriptor.member(member) {
            Some(MemberKind::Method { function }) => *function,
            _ => {
                return Err(self.unsupported(format!(
                    "'{}' has no method '{}'",
                    descriptor.name, member
                )))
            }
        };
        let sig = self.sigs[&function].clone();
        if args.len() + 1 != sig.params.len() {
            return Err(self.unsupported(format!(
                "'{}.{}' expects {} arguments, got {}",
                descriptor.name,
                member,
                sig.params.len() - 1,
                args.len()
            )));
        }
        let mut call_args = vec![receiver.value];
        for (entry, ty) in args.iter().zip(sig.params.iter().skip(1)) {
            call_args.push(self.b.coerce(entry.value, ty));
        }
        if let Some(v) = self.b.call(&sig.ir_name, sig.ret, call_args) {
            self.push_value(v);
        }
        Ok(())
    }

    /// Same size table the engine's `SizeOf` uses.
    fn static_size_of(&self, name: &str) -> Result<i64, BackendError> {
        let primitive = match name {
            "void" => Some(0),
            "bool" | "i8" => Some(1),
            "i16" => Some(2),
            "i32" | "f32" => Some(4),
            "i64" | "f64" | "string" | "ptr" => Some(8),
            _ => None,
        };
        if let Some(size) = primitive {
            return Ok(size);
        }
        match self.program.type_by_name(name) {
            Some((_, descriptor)) => Ok(8 + 8 * descriptor.field_count() as i64),
            None => Err(self.unsupported(format!("sizeof unknown type '{}'", name))),
        }
    }
}
