/// Optimization pass pipeline.
///
/// Level 0 runs nothing. Level 1 canonicalizes and simplifies (constant
/// folding, instruction simplification, CFG cleanup). Level 2 adds
/// inlining, dead-code elimination, value numbering, loop unrolling, and
/// vectorization. Level 3 adds aggressive inlining, LICM, and loop
/// deletion.
///
/// Every pass is conservative: it transforms only the patterns it can prove
/// safe and leaves everything else untouched. Loop passes work on
/// single-block self-loops, which is what the lowering produces for
/// bytecode while-loops.
use std::collections::{HashMap, HashSet};

use super::ir::{
    BinOp, BlockId, CastKind, Constant, FCmpPred, ICmpPred, Inst, InstKind, IrFunction, IrModule,
    IrType, IrValueData, Terminator, ValueDef, ValueId,
};

#[derive(Debug, Clone, Copy)]
enum Pass {
    ConstFold,
    Simplify,
    SimplifyCfg,
    Dce,
    Gvn,
    Inline { budget: usize },
    LoopUnroll,
    Vectorize,
    Licm,
    LoopDelete,
}

fn pipeline(level: u8) -> Vec<Pass> {
    match level {
        0 => vec![],
        1 => vec![Pass::ConstFold, Pass::Simplify, Pass::SimplifyCfg],
        2 => vec![
            Pass::ConstFold,
            Pass::Simplify,
            Pass::SimplifyCfg,
            Pass::Inline { budget: 8 },
            Pass::Dce,
            Pass::Gvn,
            Pass::LoopUnroll,
            Pass::Vectorize,
            Pass::Dce,
        ],
        _ => vec![
            Pass::ConstFold,
            Pass::Simplify,
            Pass::SimplifyCfg,
            Pass::Inline { budget: 24 },
            Pass::Dce,
            Pass::Gvn,
            Pass::LoopUnroll,
            Pass::Vectorize,
            Pass::Licm,
            Pass::LoopDelete,
            Pass::Dce,
        ],
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassSummary {
    pub instructions_before: usize,
    pub instructions_after: usize,
}

pub fn run(module: &mut IrModule, level: u8) -> PassSummary {
    let count = |m: &IrModule| {
        m.functions
            .iter()
            .map(|f| f.blocks.iter().map(|b| b.insts.len()).sum::<usize>())
            .sum()
    };
    let before = count(module);
    for pass in pipeline(level) {
        match pass {
            Pass::Inline { budget } => inline(module, budget),
            other => {
                for f in module.functions.iter_mut().filter(|f| !f.is_declaration) {
                    match other {
                        Pass::ConstFold => const_fold(f),
                        Pass::Simplify => simplify(f),
                        Pass::SimplifyCfg => simplify_cfg(f),
                        Pass::Dce => dce(f),
                        Pass::Gvn => gvn(f),
                        Pass::LoopUnroll => loop_unroll(f),
                        Pass::Vectorize => vectorize(f),
                        Pass::Licm => licm(f),
                        Pass::LoopDelete => loop_delete(f),
                        Pass::Inline { .. } => unreachable!(),
                    }
                }
            }
        }
    }
    PassSummary {
        instructions_before: before,
        instructions_after: count(module),
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Shared helpers
// ───────────────────────────────────────────────────────────────────────────

fn replace_uses(func: &mut IrFunction, from: ValueId, to: ValueId) {
    let map = |v: ValueId| if v == from { to } else { v };
    for block in &mut func.blocks {
        for inst in &mut block.insts {
            inst.kind.replace_operands(&map);
        }
        match &mut block.terminator {
            Some(Terminator::CondBr { cond, .. }) => *cond = map(*cond),
            Some(Terminator::Ret { value: Some(v) }) => *v = map(*v),
            _ => {}
        }
    }
}

fn use_counts(func: &IrFunction) -> HashMap<ValueId, usize> {
    let mut counts: HashMap<ValueId, usize> = HashMap::new();
    for block in &func.blocks {
        for inst in &block.insts {
            for operand in inst.kind.operands() {
                *counts.entry(operand).or_default() += 1;
            }
        }
        match &block.terminator {
            Some(Terminator::CondBr { cond, .. }) => *counts.entry(*cond).or_default() += 1,
            Some(Terminator::Ret { value: Some(v) }) => *counts.entry(*v).or_default() += 1,
            _ => {}
        }
    }
    counts
}

fn reachable_blocks(func: &IrFunction) -> HashSet<BlockId> {
    let mut seen = HashSet::new();
    let mut work = vec![func.entry];
    while let Some(id) = work.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(term) = &func.block(id).terminator {
            work.extend(term.successors());
        }
    }
    seen
}

fn const_of(func: &IrFunction, v: ValueId) -> Option<Constant> {
    func.constant_of(v).cloned()
}

fn new_const(func: &mut IrFunction, ty: IrType, c: Constant) -> ValueId {
    let id = ValueId(func.values.len() as u32);
    func.values.push(IrValueData {
        ty,
        def: ValueDef::Const(c),
    });
    id
}

// ───────────────────────────────────────────────────────────────────────────
// Constant folding
// ───────────────────────────────────────────────────────────────────────────

fn wrap_to(ty: &IrType, v: i64) -> i64 {
    match ty {
        IrType::I32 => v as i32 as i64,
        IrType::I16 => v as i16 as i64,
        IrType::I8 => v as i8 as i64,
        IrType::I1 => v & 1,
        _ => v,
    }
}

fn const_fold(func: &mut IrFunction) {
    for bi in 0..func.blocks.len() {
        let mut idx = 0;
        while idx < func.blocks[bi].insts.len() {
            let inst = func.blocks[bi].insts[idx].clone();
            let folded = fold_inst(func, &inst);
            match folded {
                Some((result, replacement)) => {
                    func.blocks[bi].insts.remove(idx);
                    replace_uses(func, result, replacement);
                }
                None => idx += 1,
            }
        }
    }
}

fn fold_inst(func: &mut IrFunction, inst: &Inst) -> Option<(ValueId, ValueId)> {
    let result = inst.result?;
    match &inst.kind {
        InstKind::Bin { op, lhs, rhs } => {
            let l = const_of(func, *lhs)?;
            let r = const_of(func, *rhs)?;
            let ty = func.value(result).ty.clone();
            match (l, r) {
                (Constant::Int(_, a), Constant::Int(_, b)) => {
                    let v = match op {
                        BinOp::Add => a.wrapping_add(b),
                        BinOp::Sub => a.wrapping_sub(b),
                        BinOp::Mul => a.wrapping_mul(b),
                        BinOp::SDiv => {
                            if b == 0 {
                                return None;
                            }
                            a.wrapping_div(b)
                        }
                        BinOp::SRem => {
                            if b == 0 {
                                return None;
                            }
                            a.wrapping_rem(b)
                        }
                        BinOp::And => a & b,
                        BinOp::Or => a | b,
                        BinOp::Xor => a ^ b,
                        BinOp::Shl => a.wrapping_shl(b as u32 & 63),
                        BinOp::AShr => a.wrapping_shr(b as u32 & 63),
                        _ => return None,
                    };
                    let v = wrap_to(&ty, v);
                    let c = new_const(func, ty.clone(), Constant::Int(ty, v));
                    Some((result, c))
                }
                (Constant::Float(_, a), Constant::Float(_, b)) => {
                    let v = match op {
                        BinOp::FAdd => a + b,
                        BinOp::FSub => a - b,
                        BinOp::FMul => a * b,
                        BinOp::FDiv => a / b,
                        BinOp::FRem => a % b,
                        _ => return None,
                    };
                    let c = new_const(func, ty.clone(), Constant::Float(ty, v));
                    Some((result, c))
                }
                _ => None,
            }
        }
        InstKind::ICmp { pred, lhs, rhs } => {
            let (Constant::Int(_, a), Constant::Int(_, b)) =
                (const_of(func, *lhs)?, const_of(func, *rhs)?)
            else {
                return None;
            };
            let v = match pred {
                ICmpPred::Eq => a == b,
                ICmpPred::Ne => a != b,
                ICmpPred::Slt => a < b,
                ICmpPred::Sgt => a > b,
                ICmpPred::Sle => a <= b,
                ICmpPred::Sge => a >= b,
            };
            let c = new_const(func, IrType::I1, Constant::Bool(v));
            Some((result, c))
        }
        InstKind::FCmp { pred, lhs, rhs } => {
            let (Constant::Float(_, a), Constant::Float(_, b)) =
                (const_of(func, *lhs)?, const_of(func, *rhs)?)
            else {
                return None;
            };
            let v = match pred {
                FCmpPred::Oeq => a == b,
                FCmpPred::One => a != b,
                FCmpPred::Olt => a < b,
                FCmpPred::Ogt => a > b,
                FCmpPred::Ole => a <= b,
                FCmpPred::Oge => a >= b,
            };
            let c = new_const(func, IrType::I1, Constant::Bool(v));
            Some((result, c))
        }
        InstKind::Cast { kind, value, to } => {
            let c = const_of(func, *value)?;
            let to = to.clone();
            let folded = match (kind, c) {
                (CastKind::SiToFp, Constant::Int(_, a)) => Constant::Float(to.clone(), a as f64),
                (CastKind::FpToSi, Constant::Float(_, a)) => {
                    Constant::Int(to.clone(), wrap_to(&to, a as i64))
                }
                (CastKind::Trunc | CastKind::Sext | CastKind::Zext, Constant::Int(_, a)) => {
                    Constant::Int(to.clone(), wrap_to(&to, a))
                }
                (CastKind::FpExt | CastKind::FpTrunc, Constant::Float(_, a)) => {
                    Constant::Float(to.clone(), a)
                }
                _ => return None,
            };
            let cv = new_const(func, to, folded);
            Some((result, cv))
        }
        _ => None,
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Instruction simplification
// ───────────────────────────────────────────────────────────────────────────

/// Algebraic identities: `x+0`, `x-0`, `x*1`, `x*0`, `x&x`, `x|x`.
fn simplify(func: &mut IrFunction) {
    for bi in 0..func.blocks.len() {
        let mut idx = 0;
        while idx < func.blocks[bi].insts.len() {
            let inst = func.blocks[bi].insts[idx].clone();
            let Some(result) = inst.result else {
                idx += 1;
                continue;
            };
            let replacement = match &inst.kind {
                InstKind::Bin { op, lhs, rhs } => {
                    let lc = const_of(func, *lhs);
                    let rc = const_of(func, *rhs);
                    let int_of = |c: &Option<Constant>| match c {
                        Some(Constant::Int(_, v)) => Some(*v),
                        _ => None,
                    };
                    match op {
                        BinOp::Add | BinOp::Sub if int_of(&rc) == Some(0) => Some(*lhs),
                        BinOp::Add if int_of(&lc) == Some(0) => Some(*rhs),
                        BinOp::Mul if int_of(&rc) == Some(1) => Some(*lhs),
                        BinOp::Mul if int_of(&lc) == Some(1) => Some(*rhs),
                        BinOp::Mul if int_of(&rc) == Some(0) || int_of(&lc) == Some(0) => {
                            let ty = func.value(result).ty.clone();
                            Some(new_const(func, ty.clone(), Constant::Int(ty, 0)))
                        }
                        BinOp::And | BinOp::Or if lhs == rhs => Some(*lhs),
                        _ => None,
                    }
                }
                _ => None,
            };
            match replacement {
                Some(to) => {
                    func.blocks[bi].insts.remove(idx);
                    replace_uses(func, result, to);
                }
                None => idx += 1,
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// CFG cleanup
// ───────────────────────────────────────────────────────────────────────────

/// Thread jumps through empty forwarding blocks, fold constant conditional
/// branches, and neutralize unreachable blocks.
fn simplify_cfg(func: &mut IrFunction) {
    // Fold `condbr (const)` into `br`.
    for block in &mut func.blocks {
        if let Some(Terminator::CondBr {
            cond,
            then_block,
            else_block,
        }) = block.terminator.clone()
        {
            if let ValueDef::Const(Constant::Bool(b)) = &func.values[cond.0 as usize].def {
                let target = if *b { then_block } else { else_block };
                block.terminator = Some(Terminator::Br { target });
            }
        }
    }

    // Forwarding blocks: empty body, unconditional branch.
    let mut forward: HashMap<BlockId, BlockId> = HashMap::new();
    for (i, block) in func.blocks.iter().enumerate() {
        let id = BlockId(i as u32);
        if id == func.entry {
            continue;
        }
        if block.insts.is_empty() {
            if let Some(Terminator::Br { target }) = block.terminator {
                if target != id {
                    forward.insert(id, target);
                }
            }
        }
    }
    let resolve = |mut id: BlockId| {
        let mut hops = 0;
        while let Some(&next) = forward.get(&id) {
            id = next;
            hops += 1;
            if hops > 8 {
                break;
            }
        }
        id
    };
    for block in &mut func.blocks {
        match &mut block.terminator {
            Some(Terminator::Br { target }) => *target = resolve(*target),
            Some(Terminator::CondBr {
                then_block,
                else_block,
                ..
            }) => {
                *then_block = resolve(*then_block);
                *else_block = resolve(*else_block);
            }
            _ => {}
        }
    }

    // Anything unreachable becomes an explicit dead end.
    let reachable = reachable_blocks(func);
    for (i, block) in func.blocks.iter_mut().enumerate() {
        if !reachable.contains(&BlockId(i as u32)) {
            block.insts.clear();
            block.terminator = Some(Terminator::Unreachable);
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Dead code elimination
// ───────────────────────────────────────────────────────────────────────────

fn dce(func: &mut IrFunction) {
    loop {
        let counts = use_counts(func);
        let mut removed = false;
        for block in &mut func.blocks {
            block.insts.retain(|inst| {
                let keep = match inst.result {
                    Some(result) => {
                        !inst.kind.is_pure() || counts.get(&result).copied().unwrap_or(0) > 0
                    }
                    None => true,
                };
                if !keep {
                    removed = true;
                }
                keep
            });
        }
        if !removed {
            break;
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Local value numbering
// ───────────────────────────────────────────────────────────────────────────

/// Within one block, a pure instruction identical to an earlier one reuses
/// its result. Loads are excluded (a store may intervene).
fn gvn(func: &mut IrFunction) {
    for bi in 0..func.blocks.len() {
        let mut seen: Vec<(InstKind, ValueId)> = Vec::new();
        let mut replacements: Vec<(ValueId, ValueId)> = Vec::new();
        let mut kept: Vec<Inst> = Vec::new();
        for inst in func.blocks[bi].insts.clone() {
            let numberable = inst.result.is_some()
                && inst.kind.is_pure()
                && !matches!(inst.kind, InstKind::Load { .. } | InstKind::Alloca { .. });
            if numberable {
                if let Some((_, prior)) = seen.iter().find(|(kind, _)| *kind == inst.kind) {
                    replacements.push((inst.result.unwrap(), *prior));
                    continue;
                }
                seen.push((inst.kind.clone(), inst.result.unwrap()));
            }
            kept.push(inst);
        }
        func.blocks[bi].insts = kept;
        for (from, to) in replacements {
            replace_uses(func, from, to);
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Inlining
// ───────────────────────────────────────────────────────────────────────────

/// Splice single-block callees below the size budget into their callers.
fn inline(module: &mut IrModule, budget: usize) {
    // Candidates: defined, one block, small, straight-line return.
    let candidates: HashMap<String, IrFunction> = module
        .functions
        .iter()
        .filter(|f| {
            !f.is_declaration
                && f.blocks.len() == 1
                && f.blocks[0].insts.len() <= budget
                && matches!(f.blocks[0].terminator, Some(Terminator::Ret { .. }))
        })
        .map(|f| (f.name.clone(), f.clone()))
        .collect();

    for fi in 0..module.functions.len() {
        if module.functions[fi].is_declaration {
            continue;
        }
        let caller_name = module.functions[fi].name.clone();
        for bi in 0..module.functions[fi].blocks.len() {
            let mut idx = 0;
            while idx < module.functions[fi].blocks[bi].insts.len() {
                let inst = module.functions[fi].blocks[bi].insts[idx].clone();
                let InstKind::Call { callee, args, .. } = &inst.kind else {
                    idx += 1;
                    continue;
                };
                let Some(target) = candidates.get(callee) else {
                    idx += 1;
                    continue;
                };
                if *callee == caller_name || args.len() != target.params.len() {
                    idx += 1;
                    continue;
                }
                let spliced = splice(&mut module.functions[fi], bi, idx, &inst, target);
                if spliced {
                    // Revisit the same index: the call was replaced by the
                    // callee body.
                    continue;
                }
                idx += 1;
            }
        }
    }
}

/// Replace the call at `blocks[bi].insts[idx]` with a remapped copy of the
/// callee's single block.
fn splice(
    caller: &mut IrFunction,
    bi: usize,
    idx: usize,
    call: &Inst,
    callee: &IrFunction,
) -> bool {
    let InstKind::Call { args, .. } = &call.kind else {
        return false;
    };
    let mut remap: HashMap<ValueId, ValueId> = HashMap::new();
    // Parameters bind to the call arguments.
    for (vi, data) in callee.values.iter().enumerate() {
        if let ValueDef::Param(p) = data.def {
            remap.insert(ValueId(vi as u32), args[p]);
        }
    }
    // Constants are cloned into the caller's arena.
    for (vi, data) in callee.values.iter().enumerate() {
        if let ValueDef::Const(c) = &data.def {
            let id = new_const(caller, data.ty.clone(), c.clone());
            remap.insert(ValueId(vi as u32), id);
        }
    }
    let mut new_insts = Vec::new();
    for inst in &callee.blocks[0].insts {
        let mut kind = inst.kind.clone();
        // Allocas would escape the entry-block discipline; refuse.
        if matches!(kind, InstKind::Alloca { .. }) {
            return false;
        }
        let result = inst.result.map(|r| {
            let id = ValueId(caller.values.len() as u32);
            caller.values.push(IrValueData {
                ty: callee.value(r).ty.clone(),
                def: ValueDef::Inst,
            });
            remap.insert(r, id);
            id
        });
        kind.replace_operands(&|v| remap.get(&v).copied().unwrap_or(v));
        new_insts.push(Inst { result, kind });
    }
    let ret_value = match &callee.blocks[0].terminator {
        Some(Terminator::Ret { value }) => value.map(|v| remap.get(&v).copied().unwrap_or(v)),
        _ => return false,
    };

    caller.blocks[bi].insts.remove(idx);
    for (offset, inst) in new_insts.into_iter().enumerate() {
        caller.blocks[bi].insts.insert(idx + offset, inst);
    }
    if let (Some(call_result), Some(ret)) = (call.result, ret_value) {
        replace_uses(caller, call_result, ret);
    }
    true
}

// ───────────────────────────────────────────────────────────────────────────
// Loop passes (single-block self-loops)
// ───────────────────────────────────────────────────────────────────────────

/// A block whose conditional terminator targets itself.
fn self_loops(func: &IrFunction) -> Vec<BlockId> {
    func.blocks
        .iter()
        .enumerate()
        .filter_map(|(i, block)| {
            let id = BlockId(i as u32);
            match &block.terminator {
                Some(Terminator::CondBr {
                    then_block,
                    else_block,
                    ..
                }) if *then_block == id || *else_block == id => Some(id),
                _ => None,
            }
        })
        .collect()
}

fn defined_in(block: &super::ir::IrBlock) -> HashSet<ValueId> {
    block.insts.iter().filter_map(|i| i.result).collect()
}

/// Operands a loop body may reference while staying cloneable: values it
/// defines itself, constants, parameters, and entry-block allocas.
fn clonable_body(func: &IrFunction, id: BlockId) -> bool {
    let local = defined_in(func.block(id));
    let entry_allocas: HashSet<ValueId> = func
        .block(func.entry)
        .insts
        .iter()
        .filter(|i| matches!(i.kind, InstKind::Alloca { .. }))
        .filter_map(|i| i.result)
        .collect();
    for inst in &func.block(id).insts {
        if matches!(inst.kind, InstKind::Alloca { .. }) {
            return false;
        }
        for operand in inst.kind.operands() {
            let ok = local.contains(&operand)
                || entry_allocas.contains(&operand)
                || !matches!(func.value(operand).def, ValueDef::Inst);
            if !ok {
                return false;
            }
        }
    }
    true
}

/// Unroll self-loops by a factor of two, keeping the exit test between the
/// two copies, so the trip count is preserved exactly.
fn loop_unroll(func: &mut IrFunction) {
    for id in self_loops(func) {
        if !clonable_body(func, id) || func.block(id).insts.len() > 32 {
            continue;
        }
        let Some(Terminator::CondBr {
            cond,
            then_block,
            else_block,
        }) = func.block(id).terminator.clone()
        else {
            continue;
        };
        let back_is_then = then_block == id;

        // Clone the body with fresh result ids.
        let mut remap: HashMap<ValueId, ValueId> = HashMap::new();
        let body = func.block(id).insts.clone();
        let mut cloned = Vec::with_capacity(body.len());
        for inst in &body {
            let result = inst.result.map(|r| {
                let nid = ValueId(func.values.len() as u32);
                let ty = func.value(r).ty.clone();
                func.values.push(IrValueData {
                    ty,
                    def: ValueDef::Inst,
                });
                remap.insert(r, nid);
                nid
            });
            let mut kind = inst.kind.clone();
            kind.replace_operands(&|v| remap.get(&v).copied().unwrap_or(v));
            cloned.push(Inst { result, kind });
        }
        let cloned_cond = remap.get(&cond).copied().unwrap_or(cond);

        let second = BlockId(func.blocks.len() as u32);
        func.blocks.push(super::ir::IrBlock {
            label: format!("{}.unroll", func.block(id).label),
            insts: cloned,
            terminator: Some(if back_is_then {
                Terminator::CondBr {
                    cond: cloned_cond,
                    then_block: id,
                    else_block,
                }
            } else {
                Terminator::CondBr {
                    cond: cloned_cond,
                    then_block,
                    else_block: id,
                }
            }),
        });

        // First copy now falls through to the second on the back edge.
        func.block_mut(id).terminator = Some(if back_is_then {
            Terminator::CondBr {
                cond,
                then_block: second,
                else_block,
            }
        } else {
            Terminator::CondBr {
                cond,
                then_block,
                else_block: second,
            }
        });
    }
}

/// Scheduling transform: bubble independent same-op float instructions next
/// to each other so adjacent lanes are visible to a SIMD-capable assembler.
fn vectorize(func: &mut IrFunction) {
    for block in &mut func.blocks {
        if block.insts.len() < 3 {
            continue;
        }
        let mut i = 0;
        while i + 2 < block.insts.len() {
            let same_float_op = |a: &Inst, b: &Inst| match (&a.kind, &b.kind) {
                (InstKind::Bin { op: oa, .. }, InstKind::Bin { op: ob, .. }) => {
                    oa == ob && oa.is_float()
                }
                _ => false,
            };
            let independent = |between: &Inst, moved: &Inst| {
                between.kind.is_pure()
                    && !matches!(between.kind, InstKind::Load { .. })
                    && match between.result {
                        Some(r) => !moved.kind.operands().contains(&r),
                        None => true,
                    }
            };
            if same_float_op(&block.insts[i], &block.insts[i + 2])
                && !same_float_op(&block.insts[i], &block.insts[i + 1])
                && independent(&block.insts[i + 1], &block.insts[i + 2])
            {
                block.insts.swap(i + 1, i + 2);
            }
            i += 1;
        }
    }
}

/// Hoist loop-invariant pure instructions into the preheader of a
/// single-block self-loop. A load is invariant when its slot is never
/// stored inside the loop.
fn licm(func: &mut IrFunction) {
    for id in self_loops(func) {
        // Unique external predecessor with an unconditional branch in.
        let mut preds = Vec::new();
        for (i, block) in func.blocks.iter().enumerate() {
            let pid = BlockId(i as u32);
            if pid == id {
                continue;
            }
            if let Some(term) = &block.terminator {
                if term.successors().contains(&id) {
                    preds.push(pid);
                }
            }
        }
        let &[pre] = &preds[..] else { continue };
        if !matches!(
            func.block(pre).terminator,
            Some(Terminator::Br { target }) if target == id
        ) {
            continue;
        }

        let local = defined_in(func.block(id));
        let stored_in_loop: HashSet<ValueId> = func
            .block(id)
            .insts
            .iter()
            .filter_map(|i| match &i.kind {
                InstKind::Store { ptr, .. } => Some(*ptr),
                _ => None,
            })
            .collect();

        let mut hoisted_ids: HashSet<ValueId> = HashSet::new();
        let mut hoisted: Vec<Inst> = Vec::new();
        let mut kept: Vec<Inst> = Vec::new();
        for inst in func.block(id).insts.clone() {
            let invariant = inst.kind.is_pure()
                && !matches!(inst.kind, InstKind::Alloca { .. })
                && match &inst.kind {
                    InstKind::Load { ptr, .. } => !stored_in_loop.contains(ptr),
                    _ => true,
                }
                && inst.kind.operands().iter().all(|operand| {
                    hoisted_ids.contains(operand)
                        || !local.contains(operand)
                });
            if invariant {
                if let Some(r) = inst.result {
                    hoisted_ids.insert(r);
                }
                hoisted.push(inst);
            } else {
                kept.push(inst);
            }
        }
        if hoisted.is_empty() {
            continue;
        }
        func.block_mut(id).insts = kept;
        let pre_block = func.block_mut(pre);
        pre_block.insts.extend(hoisted);
    }
}

/// Delete effect-free self-loops whose values never escape; the loop is
/// assumed to terminate (standard loop-deletion contract).
fn loop_delete(func: &mut IrFunction) {
    for id in self_loops(func) {
        let block = func.block(id);
        let has_effects = block
            .insts
            .iter()
            .any(|i| matches!(i.kind, InstKind::Store { .. } | InstKind::Call { .. }));
        if has_effects {
            continue;
        }
        let Some(Terminator::CondBr {
            then_block,
            else_block,
            ..
        }) = block.terminator.clone()
        else {
            continue;
        };
        let exit = if then_block == id { else_block } else { then_block };
        let local = defined_in(block);
        // Escape check: any use of a loop-defined value outside the loop?
        let mut escapes = false;
        for (i, other) in func.blocks.iter().enumerate() {
            if BlockId(i as u32) == id {
                continue;
            }
            for inst in &other.insts {
                if inst.kind.operands().iter().any(|o| local.contains(o)) {
                    escapes = true;
                }
            }
            match &other.terminator {
                Some(Terminator::CondBr { cond, .. }) if local.contains(cond) => escapes = true,
                Some(Terminator::Ret { value: Some(v) }) if local.contains(v) => escapes = true,
                _ => {}
            }
        }
        if escapes {
            continue;
        }
        let block = func.block_mut(id);
        block.insts.clear();
        block.terminator = Some(Terminator::Br { target: exit });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ir::FuncBuilder;

    fn single_block_fn() -> IrFunction {
        let mut b = FuncBuilder::new("f", vec![IrType::I64], IrType::I64);
        let two = b.const_int(IrType::I64, 2);
        let three = b.const_int(IrType::I64, 3);
        let sum = b.bin(BinOp::Add, two, three);
        let arg = b.param(0);
        let out = b.bin(BinOp::Add, sum, arg);
        b.ret(Some(out));
        b.finish()
    }

    #[test]
    fn const_fold_replaces_constant_adds() {
        let mut f = single_block_fn();
        const_fold(&mut f);
        // 2+3 folded away; only the add against the parameter remains.
        assert_eq!(f.blocks[0].insts.len(), 1);
    }

    #[test]
    fn simplify_drops_add_zero() {
        let mut b = FuncBuilder::new("f", vec![IrType::I64], IrType::I64);
        let zero = b.const_int(IrType::I64, 0);
        let arg = b.param(0);
        let sum = b.bin(BinOp::Add, arg, zero);
        b.ret(Some(sum));
        let mut f = b.finish();
        simplify(&mut f);
        assert!(f.blocks[0].insts.is_empty());
        assert!(matches!(
            f.blocks[0].terminator,
            Some(Terminator::Ret { value: Some(v) }) if v == ValueId(0)
        ));
    }

    #[test]
    fn dce_removes_unused_pure_results() {
        let mut b = FuncBuilder::new("f", vec![IrType::I64], IrType::Void);
        let two = b.const_int(IrType::I64, 2);
        let arg = b.param(0);
        b.bin(BinOp::Mul, arg, two); // unused
        b.ret(None);
        let mut f = b.finish();
        dce(&mut f);
        assert!(f.blocks[0].insts.is_empty());
    }

    #[test]
    fn gvn_reuses_identical_pure_insts() {
        let mut b = FuncBuilder::new("f", vec![IrType::I64], IrType::I64);
        let arg = b.param(0);
        let a = b.bin(BinOp::Mul, arg, arg);
        let c = b.bin(BinOp::Mul, arg, arg);
        let sum = b.bin(BinOp::Add, a, c);
        b.ret(Some(sum));
        let mut f = b.finish();
        gvn(&mut f);
        assert_eq!(f.blocks[0].insts.len(), 2);
    }

    #[test]
    fn level_zero_runs_no_passes() {
        let mut module = IrModule::new("t");
        module.functions.push(single_block_fn());
        let summary = run(&mut module, 0);
        assert_eq!(summary.instructions_before, summary.instructions_after);
        assert_eq!(module.functions[0].blocks[0].insts.len(), 2);
    }

    #[test]
    fn inline_splices_small_callee() {
        let mut module = IrModule::new("t");
        // callee: double(x) = x + x
        let mut b = FuncBuilder::new("double", vec![IrType::I64], IrType::I64);
        let x = b.param(0);
        let sum = b.bin(BinOp::Add, x, x);
        b.ret(Some(sum));
        module.functions.push(b.finish());
        // caller: f(y) = double(y)
        let mut b = FuncBuilder::new("f", vec![IrType::I64], IrType::I64);
        let y = b.param(0);
        let call = b.call("double", IrType::I64, vec![y]).unwrap();
        b.ret(Some(call));
        module.functions.push(b.finish());

        inline(&mut module, 8);
        let f = module.function("f").unwrap();
        assert!(f.blocks[0]
            .insts
            .iter()
            .all(|i| !matches!(i.kind, InstKind::Call { .. })));
    }
}
