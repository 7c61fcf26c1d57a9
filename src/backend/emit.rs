/// Module emission.
///
/// The module always renders to textual IR. The destination extension picks
/// the final format: `.ll` writes the text directly; `.bc`, `.s`/`.asm`,
/// and `.o`/`.obj` run the text through the external LLVM tools
/// (`llvm-as`, `llc`) — machine-code generation is deliberately a thin
/// external step. Unknown extensions default to an object file and rename
/// the output accordingly.
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;

#[allow(unused_imports)]
use super::ir::{
    Constant, Inst, InstKind, IrFunction, IrModule, IrType, Terminator, ValueDef, ValueId,
};
use crate::errors::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Object,
    Assembly,
    Bitcode,
    Textual,
}

/// Pick the output format from the destination extension; unknown
/// extensions become `.o` objects.
pub fn select_output(dest: &Path) -> (OutputKind, PathBuf) {
    let ext = dest
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("ll") => (OutputKind::Textual, dest.to_path_buf()),
        Some("bc") => (OutputKind::Bitcode, dest.to_path_buf()),
        Some("s") | Some("asm") => (OutputKind::Assembly, dest.to_path_buf()),
        Some("o") | Some("obj") => (OutputKind::Object, dest.to_path_buf()),
        _ => (OutputKind::Object, dest.with_extension("o")),
    }
}

pub fn emit_module(module: &IrModule, dest: &Path) -> Result<PathBuf, BackendError> {
    let (kind, out_path) = select_output(dest);
    let text = render_module(module);
    if kind == OutputKind::Textual {
        std::fs::write(&out_path, text)?;
        return Ok(out_path);
    }

    let temp = out_path.with_extension("tmp.ll");
    std::fs::write(&temp, text)?;
    let result = match kind {
        OutputKind::Bitcode => run_tool(
            "llvm-as",
            &[temp.as_path(), Path::new("-o"), out_path.as_path()],
        ),
        OutputKind::Assembly => run_tool(
            "llc",
            &[temp.as_path(), Path::new("-o"), out_path.as_path()],
        ),
        OutputKind::Object => run_tool(
            "llc",
            &[
                Path::new("-filetype=obj"),
                temp.as_path(),
                Path::new("-o"),
                out_path.as_path(),
            ],
        ),
        OutputKind::Textual => unreachable!(),
    };
    let _ = std::fs::remove_file(&temp);
    result?;
    Ok(out_path)
}

fn run_tool(tool: &str, args: &[&Path]) -> Result<(), BackendError> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| BackendError::LinkerFailed {
            tool: tool.to_string(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(BackendError::LinkerFailed {
            tool: tool.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────────────
// Textual rendering
// ───────────────────────────────────────────────────────────────────────────

pub fn render_module(module: &IrModule) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "; ModuleID = '{}'", module.name);
    let _ = writeln!(out, "source_filename = \"{}\"", module.name);
    let _ = writeln!(out, "target datalayout = \"{}\"", module.data_layout);
    let _ = writeln!(out, "target triple = \"{}\"", module.target_triple);
    out.push('\n');

    for def in &module.types {
        let fields: Vec<String> = def.fields.iter().map(|t| t.to_string()).collect();
        let _ = writeln!(out, "%{} = type {{ {} }}", def.name, fields.join(", "));
    }
    if !module.types.is_empty() {
        out.push('\n');
    }

    for s in &module.strings {
        let _ = writeln!(
            out,
            "@{} = private unnamed_addr constant [{} x i8] c\"{}\"",
            s.name,
            s.bytes.len(),
            escape_bytes(&s.bytes)
        );
    }
    for g in &module.globals {
        let linkage = if g.is_constant { "constant" } else { "global" };
        let _ = writeln!(out, "@{} = {} {} {}", g.name, linkage, g.type_text, g.init);
    }
    if !module.strings.is_empty() || !module.globals.is_empty() {
        out.push('\n');
    }

    for func in &module.functions {
        if func.is_declaration {
            let _ = writeln!(out, "{}", render_signature("declare", func));
        }
    }
    out.push('\n');

    for func in &module.functions {
        if func.is_declaration {
            continue;
        }
        let _ = writeln!(out, "{} {{", render_signature("define", func));
        for block in &func.blocks {
            let _ = writeln!(out, "{}:", block.label);
            for inst in &block.insts {
                let _ = writeln!(out, "  {}", render_inst(module, func, inst));
            }
            if let Some(term) = &block.terminator {
                let _ = writeln!(out, "  {}", render_terminator(func, term));
            }
        }
        let _ = writeln!(out, "}}\n");
    }

    out
}

fn render_signature(keyword: &str, func: &IrFunction) -> String {
    let mut params: Vec<String> = func
        .params
        .iter()
        .enumerate()
        .map(|(i, ty)| {
            if keyword == "define" {
                format!("{} %p{}", ty, i)
            } else {
                ty.to_string()
            }
        })
        .collect();
    if func.is_vararg {
        params.push("...".to_string());
    }
    format!(
        "{} {} @{}({})",
        keyword,
        func.ret,
        func.name,
        params.join(", ")
    )
}

fn operand(func: &IrFunction, v: ValueId) -> String {
    match &func.value(v).def {
        ValueDef::Param(i) => format!("%p{}", i),
        ValueDef::Inst => format!("%v{}", v.0),
        ValueDef::Const(c) => render_constant(c),
    }
}

fn render_constant(c: &Constant) -> String {
    match c {
        Constant::Int(_, v) => v.to_string(),
        // Hexadecimal double form: exact for both float and double
        // constants that originated at those widths.
        Constant::Float(_, v) => format!("0x{:016X}", v.to_bits()),
        Constant::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        Constant::GlobalPtr(name) => format!("@{}", name),
        Constant::NullPtr => "null".to_string(),
    }
}

fn typed_operand(func: &IrFunction, v: ValueId) -> String {
    format!("{} {}", func.value(v).ty, operand(func, v))
}

fn render_inst(module: &IrModule, func: &IrFunction, inst: &Inst) -> String {
    let result = |v: &Option<ValueId>| {
        v.map(|id| format!("%v{} = ", id.0)).unwrap_or_default()
    };
    match &inst.kind {
        InstKind::Alloca { ty } => format!("{}alloca {}", result(&inst.result), ty),
        InstKind::Load { ty, ptr } => format!(
            "{}load {}, ptr {}",
            result(&inst.result),
            ty,
            operand(func, *ptr)
        ),
        InstKind::Store { value, ptr } => format!(
            "store {}, ptr {}",
            typed_operand(func, *value),
            operand(func, *ptr)
        ),
        InstKind::Bin { op, lhs, rhs } => format!(
            "{}{} {} {}, {}",
            result(&inst.result),
            op.mnemonic(),
            func.value(*lhs).ty,
            operand(func, *lhs),
            operand(func, *rhs)
        ),
        InstKind::ICmp { pred, lhs, rhs } => format!(
            "{}icmp {} {} {}, {}",
            result(&inst.result),
            pred.mnemonic(),
            func.value(*lhs).ty,
            operand(func, *lhs),
            operand(func, *rhs)
        ),
        InstKind::FCmp { pred, lhs, rhs } => format!(
            "{}fcmp {} {} {}, {}",
            result(&inst.result),
            pred.mnemonic(),
            func.value(*lhs).ty,
            operand(func, *lhs),
            operand(func, *rhs)
        ),
        InstKind::Call { callee, ret, args } => {
            let rendered: Vec<String> = args.iter().map(|a| typed_operand(func, *a)).collect();
            // Vararg callees need the full function type at the call site.
            let callee_ty = match module.function(callee) {
                Some(f) if f.is_vararg => {
                    let params: Vec<String> = f.params.iter().map(|t| t.to_string()).collect();
                    format!("{} ({}, ...)", f.ret, params.join(", "))
                }
                _ => ret.to_string(),
            };
            format!(
                "{}call {} @{}({})",
                result(&inst.result),
                callee_ty,
                callee,
                rendered.join(", ")
            )
        }
        InstKind::FieldPtr {
            struct_name,
            base,
            index,
        } => format!(
            "{}getelementptr inbounds %{}, ptr {}, i32 0, i32 {}",
            result(&inst.result),
            struct_name,
            operand(func, *base),
            index
        ),
        InstKind::Cast { kind, value, to } => format!(
            "{}{} {} to {}",
            result(&inst.result),
            kind.mnemonic(),
            typed_operand(func, *value),
            to
        ),
    }
}

fn render_terminator(func: &IrFunction, term: &Terminator) -> String {
    match term {
        Terminator::Br { target } => {
            format!("br label %{}", func.block(*target).label)
        }
        Terminator::CondBr {
            cond,
            then_block,
            else_block,
        } => format!(
            "br i1 {}, label %{}, label %{}",
            operand(func, *cond),
            func.block(*then_block).label,
            func.block(*else_block).label
        ),
        Terminator::Ret { value: Some(v) } => format!("ret {}", typed_operand(func, *v)),
        Terminator::Ret { value: None } => "ret void".to_string(),
        Terminator::Unreachable => "unreachable".to_string(),
    }
}

fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::new();
    for &b in bytes {
        match b {
            b'"' | b'\\' => {
                let _ = write!(out, "\\{:02X}", b);
            }
            0x20..=0x7E => out.push(b as char),
            _ => {
                let _ = write!(out, "\\{:02X}", b);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ir::{BinOp, FuncBuilder};

    #[test]
    fn selects_output_by_extension() {
        let (k, p) = select_output(Path::new("out.ll"));
        assert_eq!(k, OutputKind::Textual);
        assert_eq!(p, Path::new("out.ll"));
        assert_eq!(select_output(Path::new("out.bc")).0, OutputKind::Bitcode);
        assert_eq!(select_output(Path::new("out.s")).0, OutputKind::Assembly);
        assert_eq!(select_output(Path::new("out.obj")).0, OutputKind::Object);
        let (k, p) = select_output(Path::new("out.wasm"));
        assert_eq!(k, OutputKind::Object);
        assert_eq!(p, Path::new("out.o"));
    }

    #[test]
    fn renders_a_define_with_blocks() {
        let mut module = IrModule::new("demo");
        let mut b = FuncBuilder::new("f", vec![IrType::I64, IrType::I64], IrType::I64);
        let x = b.param(0);
        let y = b.param(1);
        let prod = b.bin(BinOp::Mul, x, y);
        let sum = b.bin(BinOp::Add, prod, x);
        b.ret(Some(sum));
        module.functions.push(b.finish());

        let text = render_module(&module);
        assert!(text.contains("define i64 @f(i64 %p0, i64 %p1)"));
        assert!(text.contains("mul i64 %p0, %p1"));
        assert!(text.contains("ret i64"));
        assert!(text.contains("target triple"));
    }

    #[test]
    fn renders_vararg_call_with_full_type() {
        let mut module = IrModule::new("demo");
        module.functions.push(IrFunction {
            name: "printf".into(),
            params: vec![IrType::Ptr],
            ret: IrType::I32,
            blocks: vec![],
            values: vec![],
            entry: super::super::ir::BlockId(0),
            is_declaration: true,
            is_vararg: true,
        });
        let mut b = FuncBuilder::new("f", vec![], IrType::Void);
        let s = b.const_null();
        b.call("printf", IrType::I32, vec![s]);
        b.ret(None);
        module.functions.push(b.finish());

        let text = render_module(&module);
        assert!(text.contains("declare i32 @printf(ptr, ...)"));
        assert!(text.contains("call i32 (ptr, ...) @printf(ptr null)"));
    }

    #[test]
    fn escapes_string_literals() {
        assert_eq!(escape_bytes(b"hi\n\0"), "hi\\0A\\00");
        assert_eq!(escape_bytes(b"a\"b"), "a\\22b");
    }
}
