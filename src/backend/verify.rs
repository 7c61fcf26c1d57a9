/// Structural verification.
///
/// Every reachable block must carry exactly one terminator, every operand
/// must be defined by a dominating instruction (or be a constant or
/// parameter), and instruction types must agree. Verification failure
/// aborts module emission.
use std::collections::{HashMap, HashSet};

use petgraph::algo::dominators::{self, Dominators};
use petgraph::graph::{DiGraph, NodeIndex};

use super::ir::{BlockId, InstKind, IrFunction, IrModule, IrType, Terminator, ValueDef, ValueId};
use crate::errors::BackendError;

pub fn verify_module(module: &IrModule) -> Result<(), BackendError> {
    for func in &module.functions {
        if !func.is_declaration {
            verify_function(module, func)?;
        }
    }
    Ok(())
}

struct Verifier<'a> {
    module: &'a IrModule,
    func: &'a IrFunction,
    reachable: HashSet<BlockId>,
    nodes: Vec<NodeIndex>,
    doms: Dominators<NodeIndex>,
    /// Definition site of every instruction-produced value.
    defs: HashMap<ValueId, (BlockId, usize)>,
}

fn verify_function(module: &IrModule, func: &IrFunction) -> Result<(), BackendError> {
    let fail = |reason: String| BackendError::ModuleVerificationFailed {
        function: func.name.clone(),
        reason,
    };

    // CFG and reachability.
    let mut graph: DiGraph<(), ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = func.blocks.iter().map(|_| graph.add_node(())).collect();
    for (i, block) in func.blocks.iter().enumerate() {
        if let Some(term) = &block.terminator {
            for succ in term.successors() {
                if succ.0 as usize >= func.blocks.len() {
                    return Err(fail(format!(
                        "block '{}' branches to nonexistent block {}",
                        block.label, succ.0
                    )));
                }
                graph.add_edge(nodes[i], nodes[succ.0 as usize], ());
            }
        }
    }
    let mut reachable = HashSet::new();
    let mut work = vec![func.entry];
    while let Some(id) = work.pop() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(term) = &func.block(id).terminator {
            work.extend(term.successors());
        }
    }

    for &id in &reachable {
        if func.block(id).terminator.is_none() {
            return Err(fail(format!(
                "reachable block '{}' has no terminator",
                func.block(id).label
            )));
        }
    }

    let doms = dominators::simple_fast(&graph, nodes[func.entry.0 as usize]);

    let mut defs = HashMap::new();
    for (bi, block) in func.blocks.iter().enumerate() {
        for (ii, inst) in block.insts.iter().enumerate() {
            if let Some(result) = inst.result {
                defs.insert(result, (BlockId(bi as u32), ii));
            }
        }
    }

    let verifier = Verifier {
        module,
        func,
        reachable,
        nodes,
        doms,
        defs,
    };
    verifier.check()
}

impl<'a> Verifier<'a> {
    fn fail(&self, reason: String) -> BackendError {
        BackendError::ModuleVerificationFailed {
            function: self.func.name.clone(),
            reason,
        }
    }

    fn check(&self) -> Result<(), BackendError> {
        for &id in &self.reachable {
            let block = self.func.block(id);
            for (ii, inst) in block.insts.iter().enumerate() {
                for operand in inst.kind.operands() {
                    self.check_operand(operand, id, ii)?;
                }
                self.check_types(inst, id)?;
            }
            match block.terminator.as_ref().unwrap() {
                Terminator::CondBr { cond, .. } => {
                    self.check_operand(*cond, id, block.insts.len())?;
                    if self.func.value(*cond).ty != IrType::I1 {
                        return Err(self.fail(format!(
                            "conditional branch in '{}' on a non-i1 value",
                            block.label
                        )));
                    }
                }
                Terminator::Ret { value } => {
                    match (value, &self.func.ret) {
                        (None, IrType::Void) => {}
                        (None, other) => {
                            return Err(self.fail(format!(
                                "ret void in a function returning {}",
                                other
                            )))
                        }
                        (Some(_), IrType::Void) => {
                            return Err(self.fail("ret with a value in a void function".into()))
                        }
                        (Some(v), expected) => {
                            self.check_operand(*v, id, block.insts.len())?;
                            let ty = &self.func.value(*v).ty;
                            if ty != expected {
                                return Err(self.fail(format!(
                                    "ret of {} in a function returning {}",
                                    ty, expected
                                )));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// SSA dominance: the definition must precede the use in the same block
    /// or strictly dominate the using block.
    fn check_operand(&self, operand: ValueId, block: BlockId, index: usize) -> Result<(), BackendError> {
        if operand.0 as usize >= self.func.values.len() {
            return Err(self.fail(format!("use of nonexistent value v{}", operand.0)));
        }
        match &self.func.value(operand).def {
            ValueDef::Const(_) | ValueDef::Param(_) => Ok(()),
            ValueDef::Inst => {
                let (def_block, def_index) = self.defs.get(&operand).copied().ok_or_else(|| {
                    self.fail(format!("v{} is used but never defined", operand.0))
                })?;
                if def_block == block {
                    if def_index < index {
                        return Ok(());
                    }
                    return Err(self.fail(format!(
                        "v{} is used before its definition in '{}'",
                        operand.0,
                        self.func.block(block).label
                    )));
                }
                if self.dominates(def_block, block) {
                    Ok(())
                } else {
                    Err(self.fail(format!(
                        "definition of v{} in '{}' does not dominate its use in '{}'",
                        operand.0,
                        self.func.block(def_block).label,
                        self.func.block(block).label
                    )))
                }
            }
        }
    }

    fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let target = self.nodes[a.0 as usize];
        let mut at = self.nodes[b.0 as usize];
        loop {
            if at == target {
                return true;
            }
            match self.doms.immediate_dominator(at) {
                Some(idom) if idom != at => at = idom,
                _ => return false,
            }
        }
    }

    fn check_types(&self, inst: &super::ir::Inst, block: BlockId) -> Result<(), BackendError> {
        let label = &self.func.block(block).label;
        let ty = |v: ValueId| self.func.value(v).ty.clone();
        match &inst.kind {
            InstKind::Bin { op, lhs, rhs } => {
                let (lt, rt) = (ty(*lhs), ty(*rhs));
                if lt != rt {
                    return Err(self.fail(format!(
                        "{} in '{}' mixes {} and {}",
                        op.mnemonic(),
                        label,
                        lt,
                        rt
                    )));
                }
                if op.is_float() != lt.is_float() {
                    return Err(self.fail(format!(
                        "{} in '{}' applied to {} operands",
                        op.mnemonic(),
                        label,
                        lt
                    )));
                }
            }
            InstKind::ICmp { lhs, rhs, .. } => {
                let (lt, rt) = (ty(*lhs), ty(*rhs));
                if lt != rt || !(lt.is_int() || lt == IrType::Ptr) {
                    return Err(self.fail(format!(
                        "icmp in '{}' on {} and {}",
                        label, lt, rt
                    )));
                }
            }
            InstKind::FCmp { lhs, rhs, .. } => {
                if !ty(*lhs).is_float() || !ty(*rhs).is_float() {
                    return Err(self.fail(format!("fcmp in '{}' on non-float operands", label)));
                }
            }
            InstKind::Load { ptr, .. } | InstKind::Store { ptr, .. } => {
                if ty(*ptr) != IrType::Ptr {
                    return Err(self.fail(format!(
                        "memory access in '{}' through a non-pointer",
                        label
                    )));
                }
            }
            InstKind::FieldPtr {
                struct_name,
                base,
                index,
            } => {
                if ty(*base) != IrType::Ptr {
                    return Err(self.fail(format!(
                        "getelementptr in '{}' on a non-pointer base",
                        label
                    )));
                }
                let def = self.module.struct_def(struct_name).ok_or_else(|| {
                    self.fail(format!("getelementptr names unknown struct '{}'", struct_name))
                })?;
                if *index >= def.fields.len() {
                    return Err(self.fail(format!(
                        "field index {} out of range for '{}'",
                        index, struct_name
                    )));
                }
            }
            InstKind::Call { callee, ret, args } => {
                if let Some(target) = self.module.function(callee) {
                    let ok = if target.is_vararg {
                        args.len() >= target.params.len()
                    } else {
                        args.len() == target.params.len()
                    };
                    if !ok {
                        return Err(self.fail(format!(
                            "call to '{}' in '{}' passes {} arguments, expected {}",
                            callee,
                            label,
                            args.len(),
                            target.params.len()
                        )));
                    }
                    if &target.ret != ret {
                        return Err(self.fail(format!(
                            "call to '{}' in '{}' expects return {}, declared {}",
                            callee, label, ret, target.ret
                        )));
                    }
                }
            }
            InstKind::Alloca { .. } | InstKind::Cast { .. } => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ir::{BinOp, FuncBuilder};

    #[test]
    fn accepts_a_well_formed_function() {
        let mut module = IrModule::new("t");
        let mut b = FuncBuilder::new("f", vec![IrType::I64], IrType::I64);
        let x = b.param(0);
        let one = b.const_int(IrType::I64, 1);
        let sum = b.bin(BinOp::Add, x, one);
        b.ret(Some(sum));
        module.functions.push(b.finish());
        verify_module(&module).unwrap();
    }

    #[test]
    fn rejects_a_missing_terminator() {
        let mut module = IrModule::new("t");
        let b = FuncBuilder::new("f", vec![], IrType::Void);
        // entry block never terminated
        module.functions.push(b.finish());
        assert!(matches!(
            verify_module(&module),
            Err(BackendError::ModuleVerificationFailed { .. })
        ));
    }

    #[test]
    fn rejects_mixed_operand_types() {
        let mut module = IrModule::new("t");
        let mut b = FuncBuilder::new("f", vec![IrType::I64], IrType::Void);
        let x = b.param(0);
        let half = b.const_float(IrType::F64, 0.5);
        b.bin(BinOp::Add, x, half);
        b.ret(None);
        module.functions.push(b.finish());
        assert!(verify_module(&module).is_err());
    }

    #[test]
    fn rejects_non_dominating_definitions() {
        let mut module = IrModule::new("t");
        let mut b = FuncBuilder::new("f", vec![IrType::I1], IrType::I64);
        let cond = b.param(0);
        let side = b.new_block("side");
        let join = b.new_block("join");
        b.cond_br(cond, side, join);
        b.position_at_end(side);
        let one = b.const_int(IrType::I64, 1);
        let two = b.const_int(IrType::I64, 2);
        let defined_in_side = b.bin(BinOp::Add, one, two);
        b.br(join);
        b.position_at_end(join);
        // `side` does not dominate `join` (entry can reach join directly).
        b.ret(Some(defined_in_side));
        module.functions.push(b.finish());
        assert!(verify_module(&module).is_err());
    }

    #[test]
    fn rejects_return_type_disagreement() {
        let mut module = IrModule::new("t");
        let mut b = FuncBuilder::new("f", vec![], IrType::I64);
        b.ret(None);
        module.functions.push(b.finish());
        assert!(verify_module(&module).is_err());
    }
}
