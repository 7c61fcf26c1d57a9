/// Integration tests for the IR backend.
///
/// These tests verify:
///   • Bytecode functions lower to verified IR with the documented shape
///     (entry-block allocas, blocks keyed by branch targets, synthesized
///     terminators)
///   • The synthesized `main` entry calls the user main
///   • Runtime intrinsics are declared with default bodies
///   • Class lowering: struct layout, name-mangled methods, vtable globals
///   • The pass pipeline keeps modules verifiable at every level
///   • Dynamic-only opcodes are rejected with a clear error
use ouroboros::backend::{emit, lower, passes, verify};
use ouroboros::bytecode::{BytecodeWriter, Op};
use ouroboros::core::types::{TypeDescriptor, TypeKind};
use ouroboros::core::value::Value;
use ouroboros::errors::BackendError;

fn fact_program() -> ouroboros::Program {
    let mut w = BytecodeWriter::new();
    let k1 = w.constant(Value::I64(1));
    let k5 = w.constant(Value::I64(5));
    let fact_name = w.name("fact");

    let loop_top = w.new_label();
    let done = w.new_label();
    w.begin_function("fact", 1);
    w.emit1(Op::LoadConstant, k1);
    w.emit1(Op::StoreLocal, 1);
    w.bind(loop_top);
    w.emit1(Op::LoadLocal, 0);
    w.emit1(Op::LoadConstant, k1);
    w.emit(Op::Greater);
    w.branch(Op::JumpIfFalse, done);
    w.emit1(Op::LoadLocal, 1);
    w.emit1(Op::LoadLocal, 0);
    w.emit(Op::Mul);
    w.emit1(Op::StoreLocal, 1);
    w.emit1(Op::LoadLocal, 0);
    w.emit1(Op::LoadConstant, k1);
    w.emit(Op::Sub);
    w.emit1(Op::StoreLocal, 0);
    w.branch(Op::Jump, loop_top);
    w.bind(done);
    w.emit1(Op::LoadLocal, 1);
    w.emit(Op::Return);
    w.end_function();

    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, k5);
    w.emit1(Op::LoadConstant, fact_name);
    w.emit1(Op::Call, 1);
    w.emit(Op::Return);
    w.end_function();
    w.finish()
}

#[test]
fn factorial_lowers_verifies_and_renders() {
    let program = fact_program();
    let module = lower::lower_program(&program, "fact_demo").expect("should lower");
    verify::verify_module(&module).expect("should verify");

    let text = emit::render_module(&module);
    assert!(text.contains("define i64 @fact(i64 %p0)"));
    // Parameters are alloca'd in the entry block and stored there.
    assert!(text.contains("alloca i64"));
    assert!(text.contains("store i64 %p0, ptr"));
    // The loop condition and body survive as icmp/mul over i64.
    assert!(text.contains("icmp sgt i64"));
    assert!(text.contains("mul i64"));
    // The user main is renamed; the synthesized entry calls it.
    assert!(text.contains("define i64 @ouro_main()"));
    assert!(text.contains("define i32 @main()"));
    assert!(text.contains("call i64 @ouro_main()"));
}

#[test]
fn every_reachable_block_has_exactly_one_terminator() {
    let program = fact_program();
    let module = lower::lower_program(&program, "fact_demo").expect("should lower");
    for func in module.functions.iter().filter(|f| !f.is_declaration) {
        for block in &func.blocks {
            assert!(
                block.terminator.is_some(),
                "block '{}' in '{}' has no terminator",
                block.label,
                func.name
            );
        }
    }
}

#[test]
fn runtime_intrinsics_carry_default_bodies() {
    let program = fact_program();
    let module = lower::lower_program(&program, "fact_demo").expect("should lower");
    let text = emit::render_module(&module);
    assert!(text.contains("define ptr @ouroboros_alloc(i64 %p0)"));
    assert!(text.contains("call ptr @malloc(i64 %p0)"));
    assert!(text.contains("define void @ouroboros_free(ptr %p0)"));
    assert!(text.contains("define void @ouroboros_gc_collect()"));
    assert!(text.contains("define void @ouroboros_throw(ptr %p0)"));
    assert!(text.contains("call void @exit(i32 1)"));
    assert!(text.contains("define void @ouroboros_print(ptr %p0)"));
    assert!(text.contains("declare i32 @printf(ptr, ...)"));
}

#[test]
fn pass_pipeline_preserves_verifiability_at_all_levels() {
    for level in 0..=3u8 {
        let program = fact_program();
        let mut module = lower::lower_program(&program, "fact_demo").expect("should lower");
        let summary = passes::run(&mut module, level);
        verify::verify_module(&module)
            .unwrap_or_else(|e| panic!("level {} broke verification: {}", level, e));
        if level == 0 {
            assert_eq!(summary.instructions_before, summary.instructions_after);
        } else {
            assert!(summary.instructions_after <= summary.instructions_before);
        }
    }
}

#[test]
fn float_arithmetic_selects_float_variants() {
    let mut w = BytecodeWriter::new();
    let ka = w.constant(Value::F64(1.5));
    let kb = w.constant(Value::I64(2));
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, ka);
    w.emit1(Op::LoadConstant, kb);
    w.emit(Op::Add); // mixed → promoted to double
    w.emit(Op::Return);
    w.end_function();

    let module = lower::lower_program(&w.finish(), "floats").expect("should lower");
    verify::verify_module(&module).expect("should verify");
    let text = emit::render_module(&module);
    assert!(text.contains("sitofp i64 2 to double"));
    assert!(text.contains("fadd double"));
}

#[test]
fn class_lowering_emits_struct_vtable_and_mangled_methods() {
    let mut w = BytecodeWriter::new();
    let x_name = w.name("x");
    let getter_name = w.name("get_x");

    let get_x = w.begin_function("point_get_x", 0);
    w.emit(Op::LoadThis);
    w.emit1(Op::LoadMember, x_name);
    w.emit(Op::Return);
    w.end_function();

    let point = w.define_type(
        TypeDescriptor::new("Point", TypeKind::Class)
            .with_field("x")
            .with_field("y")
            .with_virtual("get_x", get_x),
    );

    w.begin_function("main", 0);
    w.emit2(Op::New, point, 0);
    w.emit2(Op::CallMethod, getter_name, 0);
    w.emit(Op::Return);
    w.end_function();

    let module = lower::lower_program(&w.finish(), "points").expect("should lower");
    verify::verify_module(&module).expect("should verify");
    let text = emit::render_module(&module);

    // Struct: vtable pointer slot first, then one slot per field.
    assert!(text.contains("%Point = type { ptr, i64, i64 }"));
    // Constant vtable referencing the mangled virtual.
    assert!(text.contains("@Point_vtable = constant [1 x ptr] [ptr @Point_get_x]"));
    // Method takes `this` first and reads field slot 1 (after the vtable).
    assert!(text.contains("define i64 @Point_get_x(ptr %p0)"));
    assert!(text.contains("getelementptr inbounds %Point, ptr"));
    // Allocation goes through the runtime intrinsic: 8 bytes vtable + 2 fields.
    assert!(text.contains("call ptr @ouroboros_alloc(i64 24)"));
    assert!(text.contains("call i64 @Point_get_x(ptr"));
}

#[test]
fn dynamic_only_opcodes_are_rejected() {
    let mut w = BytecodeWriter::new();
    let k1 = w.constant(Value::I64(1));
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, k1);
    w.emit1(Op::MakeArray, 1);
    w.emit(Op::Return);
    w.end_function();

    let err = lower::lower_program(&w.finish(), "bad").unwrap_err();
    assert!(matches!(err, BackendError::Unsupported { .. }));
}

#[test]
fn host_calls_declare_externals_by_mangled_name() {
    let mut w = BytecodeWriter::new();
    let k16 = w.constant(Value::F64(16.0));
    let name = w.name("Math.Sqrt");
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, k16);
    w.emit1(Op::LoadConstant, name);
    w.emit1(Op::Call, 1);
    w.emit(Op::Return);
    w.end_function();

    let module = lower::lower_program(&w.finish(), "hosted").expect("should lower");
    verify::verify_module(&module).expect("should verify");
    let text = emit::render_module(&module);
    assert!(text.contains("declare double @Math_Sqrt(double)"));
    assert!(text.contains("call double @Math_Sqrt(double"));
}

#[test]
fn global_slots_become_module_globals() {
    let mut w = BytecodeWriter::new();
    let k9 = w.constant(Value::I64(9));
    let g = w.global("answer");
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, k9);
    w.emit1(Op::StoreGlobal, g);
    w.emit1(Op::LoadGlobal, g);
    w.emit(Op::Return);
    w.end_function();

    let module = lower::lower_program(&w.finish(), "globals").expect("should lower");
    verify::verify_module(&module).expect("should verify");
    let text = emit::render_module(&module);
    assert!(text.contains("@g0 = global i64 0"));
    assert!(text.contains("store i64 9, ptr @g0"));
    assert!(text.contains("load i64, ptr @g0"));
}

#[test]
fn compile_program_writes_textual_ir() {
    let program = fact_program();
    let dest = std::env::temp_dir().join(format!("ouro_backend_test_{}.ll", std::process::id()));
    let written = ouroboros::backend::compile_program(&program, "fact_demo", &dest, 1)
        .expect("textual emission needs no external tools");
    let text = std::fs::read_to_string(&written).expect("output exists");
    assert!(text.contains("target triple"));
    assert!(text.contains("define i32 @main()"));
    let _ = std::fs::remove_file(written);
}

#[test]
fn optimized_factorial_still_contains_the_loop_multiply() {
    let program = fact_program();
    let mut module = lower::lower_program(&program, "fact_demo").expect("should lower");
    passes::run(&mut module, 3);
    verify::verify_module(&module).expect("should verify");
    let text = emit::render_module(&module);
    assert!(text.contains("mul i64"));
    assert!(text.contains("define i32 @main()"));
}
