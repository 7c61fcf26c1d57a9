/// Integration tests for the dispatch loop and frame engine.
///
/// These tests verify:
///   • Straight-line arithmetic and the operand-stack delta contract
///   • Loops through locals and PC-relative branches (iterative factorial)
///   • Symbolic call resolution: user table, host table, suffix matching
///   • Closures capturing by value as a hidden locals prefix
///   • Iterators and generator suspension/resumption
///   • Objects: construction, field access, method dispatch
///   • Boundary cases: empty stack at branches, lazy local extension,
///     arity mismatch, integer wrap, division by zero
use std::sync::Arc;

use ouroboros::bytecode::{BytecodeWriter, Op};
use ouroboros::core::types::TypeDescriptor;
use ouroboros::core::types::TypeKind;
use ouroboros::core::value::Value;
use ouroboros::errors::VmError;
use ouroboros::vm::{Engine, StepOutcome};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn run(program: ouroboros::Program) -> Result<Value, VmError> {
    Engine::load_program(program).execute()
}

fn exception_kind(err: &VmError) -> String {
    match err {
        VmError::Uncaught(Value::Exception(o)) => o.type_name.to_string(),
        other => panic!("expected an uncaught exception, got {:?}", other),
    }
}

// ─── Arithmetic ───────────────────────────────────────────────────────────────

#[test]
fn adds_two_constants() {
    let mut w = BytecodeWriter::new();
    let k2 = w.constant(Value::I64(2));
    let k3 = w.constant(Value::I64(3));
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, k2);
    w.emit1(Op::LoadConstant, k3);
    w.emit(Op::Add);
    w.emit(Op::Return);
    w.end_function();

    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::I64(5)));
}

#[test]
fn integer_overflow_wraps_two_complement() {
    let mut w = BytecodeWriter::new();
    let kmax = w.constant(Value::I64(i64::MAX));
    let k1 = w.constant(Value::I64(1));
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, kmax);
    w.emit1(Op::LoadConstant, k1);
    w.emit(Op::Add);
    w.emit(Op::Return);
    w.end_function();

    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::I64(i64::MIN)));
}

#[test]
fn integer_division_by_zero_raises_float_does_not() {
    let make = |num: Value, den: Value| {
        let mut w = BytecodeWriter::new();
        let kn = w.constant(num);
        let kd = w.constant(den);
        w.begin_function("main", 0);
        w.emit1(Op::LoadConstant, kn);
        w.emit1(Op::LoadConstant, kd);
        w.emit(Op::Div);
        w.emit(Op::Return);
        w.end_function();
        w.finish()
    };

    let err = run(make(Value::I64(1), Value::I64(0))).unwrap_err();
    assert_eq!(exception_kind(&err), "DivideByZero");

    let ok = run(make(Value::F64(1.0), Value::F64(0.0))).expect("float division is IEEE");
    assert!(matches!(ok, Value::F64(x) if x.is_infinite()));
}

// ─── Branching: iterative factorial ──────────────────────────────────────────

fn fact_program() -> ouroboros::Program {
    let mut w = BytecodeWriter::new();
    let k1 = w.constant(Value::I64(1));
    let k5 = w.constant(Value::I64(5));
    let fact_name = w.name("fact");

    let loop_top = w.new_label();
    let done = w.new_label();
    w.begin_function("fact", 1);
    // acc (local 1) = 1
    w.emit1(Op::LoadConstant, k1);
    w.emit1(Op::StoreLocal, 1);
    w.bind(loop_top);
    // while n > 1
    w.emit1(Op::LoadLocal, 0);
    w.emit1(Op::LoadConstant, k1);
    w.emit(Op::Greater);
    w.branch(Op::JumpIfFalse, done);
    // acc *= n
    w.emit1(Op::LoadLocal, 1);
    w.emit1(Op::LoadLocal, 0);
    w.emit(Op::Mul);
    w.emit1(Op::StoreLocal, 1);
    // n -= 1
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
fn iterative_factorial_of_five_is_120() {
    let result = run(fact_program()).expect("should run");
    assert!(matches!(result, Value::I64(120)));
}

#[test]
fn locals_are_truncated_after_every_return() {
    let program = fact_program();
    let mut engine = Engine::load_program(program);
    engine.execute().expect("should run");
    assert!(engine.get_locals().is_empty());
    assert_eq!(engine.call_depth(), 0);
}

// ─── Stack delta contract ────────────────────────────────────────────────────

#[test]
fn operand_stack_follows_static_deltas() {
    let mut w = BytecodeWriter::new();
    let k2 = w.constant(Value::I64(2));
    let k3 = w.constant(Value::I64(3));
    // Top-level code, no functions: step from offset 0.
    w.emit1(Op::LoadConstant, k2);
    w.emit1(Op::LoadConstant, k3);
    w.emit(Op::Add);
    w.emit(Op::Dup);
    w.emit(Op::Swap);
    w.emit(Op::Pop);
    w.emit(Op::LoadNull);
    w.emit(Op::Pop);
    w.emit(Op::Halt);
    let program = w.finish();

    let mut engine = Engine::load_program(program);
    loop {
        let pc = engine.pc();
        let (op, imms, _) = engine.program().decode(pc).unwrap();
        let before = engine.stack_depth() as i32;
        match engine.step().expect("no faults in this program") {
            StepOutcome::Done(_) => break,
            StepOutcome::Running => {
                if let Some(delta) = op.stack_delta(&imms) {
                    assert_eq!(
                        engine.stack_depth() as i32,
                        before + delta,
                        "delta mismatch after {}",
                        op.name()
                    );
                }
            }
        }
    }
}

// ─── Branch boundary cases ───────────────────────────────────────────────────

#[test]
fn branch_on_empty_stack_is_false_with_diagnostic() {
    let mut w = BytecodeWriter::new();
    let k1 = w.constant(Value::I64(1));
    let k2 = w.constant(Value::I64(2));
    let taken = w.new_label();
    w.begin_function("main", 0);
    w.branch(Op::JumpIfFalse, taken); // empty stack → treated as false → jumps
    w.emit1(Op::LoadConstant, k1);
    w.emit(Op::Return);
    w.bind(taken);
    w.emit1(Op::LoadConstant, k2);
    w.emit(Op::Return);
    w.end_function();

    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::I64(2)));
}

#[test]
fn only_false_and_null_are_falsy_at_branches() {
    let check = |constant: Value, expect_taken: bool| {
        let mut w = BytecodeWriter::new();
        let k = w.constant(constant);
        let kyes = w.constant(Value::I64(1));
        let kno = w.constant(Value::I64(0));
        let yes = w.new_label();
        w.begin_function("main", 0);
        w.emit1(Op::LoadConstant, k);
        w.branch(Op::JumpIfTrue, yes);
        w.emit1(Op::LoadConstant, kno);
        w.emit(Op::Return);
        w.bind(yes);
        w.emit1(Op::LoadConstant, kyes);
        w.emit(Op::Return);
        w.end_function();
        let result = run(w.finish()).expect("should run");
        let taken = matches!(result, Value::I64(1));
        assert_eq!(taken, expect_taken);
    };
    check(Value::Bool(false), false);
    check(Value::Null, false);
    check(Value::I64(0), true); // zero is truthy
    check(Value::Str("".into()), true); // empty string is truthy
}

// ─── Locals ──────────────────────────────────────────────────────────────────

#[test]
fn oversize_local_reads_observe_null() {
    let mut w = BytecodeWriter::new();
    w.begin_function("main", 0);
    w.emit1(Op::LoadLocal, 99);
    w.emit(Op::Return);
    w.end_function();

    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::Null));
}

#[test]
fn null_coalesce_takes_the_fallback_on_null() {
    let mut w = BytecodeWriter::new();
    let k7 = w.constant(Value::I64(7));
    w.begin_function("main", 0);
    w.emit(Op::LoadNull);
    w.emit1(Op::LoadConstant, k7);
    w.emit(Op::NullCoalesce);
    w.emit(Op::Return);
    w.end_function();

    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::I64(7)));
}

// ─── Call resolution ─────────────────────────────────────────────────────────

#[test]
fn host_call_resolves_qualified_and_suffix_names() {
    for callee in ["Math.Sqrt", "Sqrt"] {
        let mut w = BytecodeWriter::new();
        let k16 = w.constant(Value::F64(16.0));
        let name = w.name(callee);
        w.begin_function("main", 0);
        w.emit1(Op::LoadConstant, k16);
        w.emit1(Op::LoadConstant, name);
        w.emit1(Op::Call, 1);
        w.emit(Op::Return);
        w.end_function();
        let result = run(w.finish()).expect("should run");
        assert!(matches!(result, Value::F64(x) if x == 4.0), "via {}", callee);
    }
}

#[test]
fn unresolved_function_raises() {
    let mut w = BytecodeWriter::new();
    let name = w.name("NoSuchFunction");
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, name);
    w.emit1(Op::Call, 0);
    w.emit(Op::Return);
    w.end_function();

    let err = run(w.finish()).unwrap_err();
    assert_eq!(exception_kind(&err), "UnresolvedFunction");
}

#[test]
fn bodyless_forward_declaration_is_not_callable() {
    let mut w = BytecodeWriter::new();
    let name = w.name("ghost");
    w.declare_function("ghost", 0);
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, name);
    w.emit1(Op::Call, 0);
    w.emit(Op::Return);
    w.end_function();

    let err = run(w.finish()).unwrap_err();
    assert_eq!(exception_kind(&err), "UnresolvedFunction");
}

#[test]
fn arity_mismatch_raises() {
    let mut w = BytecodeWriter::new();
    let k1 = w.constant(Value::I64(1));
    let name = w.name("one_arg");
    w.begin_function("one_arg", 1);
    w.emit1(Op::LoadLocal, 0);
    w.emit(Op::Return);
    w.end_function();
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, k1);
    w.emit1(Op::LoadConstant, k1);
    w.emit1(Op::LoadConstant, name);
    w.emit1(Op::Call, 2);
    w.emit(Op::Return);
    w.end_function();

    let err = run(w.finish()).unwrap_err();
    assert_eq!(exception_kind(&err), "ArityMismatch");
}

#[test]
fn type_mismatch_leaves_globals_intact() {
    let mut w = BytecodeWriter::new();
    let k7 = w.constant(Value::I64(7));
    let g = w.global("answer");
    let t0 = w.new_label();
    let t1 = w.new_label();
    let cat = w.new_label();
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, k7);
    w.emit1(Op::StoreGlobal, g);
    w.bind(t0);
    w.emit(Op::LoadTrue);
    w.emit1(Op::LoadConstant, k7);
    w.emit(Op::Add); // bool + int → TypeMismatch
    w.emit(Op::Return);
    w.bind(t1);
    w.bind(cat);
    w.emit(Op::BeginCatch);
    w.emit(Op::Pop);
    w.emit1(Op::LoadGlobal, g);
    w.emit(Op::Return);
    w.add_handler(t0, t1, Some(cat), None, None);
    w.end_function();

    let result = run(w.finish()).expect("handler should catch");
    assert!(matches!(result, Value::I64(7)));
}

// ─── Closures ────────────────────────────────────────────────────────────────

#[test]
fn closure_captures_bind_as_hidden_locals_prefix() {
    let mut w = BytecodeWriter::new();
    let k5 = w.constant(Value::I64(5));
    let k10 = w.constant(Value::I64(10));

    // adder(y) with captured x at local 0, y at local 1
    let adder = w.begin_function("adder", 1);
    w.emit1(Op::LoadLocal, 0);
    w.emit1(Op::LoadLocal, 1);
    w.emit(Op::Add);
    w.emit(Op::Return);
    w.end_function();

    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, k5);
    w.emit2(Op::MakeClosure, adder, 1);
    w.emit1(Op::StoreLocal, 0);
    w.emit1(Op::LoadConstant, k10);
    w.emit1(Op::LoadLocal, 0);
    w.emit1(Op::Call, 1);
    w.emit(Op::Return);
    w.end_function();

    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::I64(15)));
}

// ─── Collections & iterators ─────────────────────────────────────────────────

#[test]
fn array_iteration_sums_elements() {
    let mut w = BytecodeWriter::new();
    let k0 = w.constant(Value::I64(0));
    let k1 = w.constant(Value::I64(1));
    let k2 = w.constant(Value::I64(2));
    let k3 = w.constant(Value::I64(3));
    let loop_top = w.new_label();
    let done = w.new_label();

    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, k1);
    w.emit1(Op::LoadConstant, k2);
    w.emit1(Op::LoadConstant, k3);
    w.emit1(Op::MakeArray, 3);
    w.emit(Op::GetIterator);
    w.emit1(Op::StoreLocal, 0);
    w.emit1(Op::LoadConstant, k0);
    w.emit1(Op::StoreLocal, 1);
    w.bind(loop_top);
    w.emit1(Op::LoadLocal, 0);
    w.emit(Op::IteratorHasNext);
    w.emit(Op::Swap);
    w.emit(Op::Pop);
    w.branch(Op::JumpIfFalse, done);
    w.emit1(Op::LoadLocal, 0);
    w.emit(Op::IteratorNext);
    w.emit(Op::Swap);
    w.emit(Op::Pop);
    w.emit1(Op::LoadLocal, 1);
    w.emit(Op::Add);
    w.emit1(Op::StoreLocal, 1);
    w.branch(Op::Jump, loop_top);
    w.bind(done);
    w.emit1(Op::LoadLocal, 1);
    w.emit(Op::Return);
    w.end_function();

    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::I64(6)));
}

#[test]
fn make_array_preserves_source_order() {
    let mut w = BytecodeWriter::new();
    let k1 = w.constant(Value::I64(1));
    let k2 = w.constant(Value::I64(2));
    let k0 = w.constant(Value::I64(0));
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, k1);
    w.emit1(Op::LoadConstant, k2);
    w.emit1(Op::MakeArray, 2);
    w.emit1(Op::LoadConstant, k0);
    w.emit(Op::LoadElement);
    w.emit(Op::Return);
    w.end_function();

    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::I64(1)));
}

#[test]
fn element_store_and_out_of_range_load() {
    let mut w = BytecodeWriter::new();
    let k1 = w.constant(Value::I64(1));
    let k9 = w.constant(Value::I64(9));
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, k1);
    w.emit1(Op::MakeArray, 1);
    w.emit1(Op::LoadConstant, k9); // index 9 of a 1-element array
    w.emit(Op::LoadElement);
    w.emit(Op::Return);
    w.end_function();

    let err = run(w.finish()).unwrap_err();
    assert_eq!(exception_kind(&err), "IndexOutOfRange");
}

#[test]
fn generator_yields_then_finishes() {
    let mut w = BytecodeWriter::new();
    let k1 = w.constant(Value::I64(1));
    let k2 = w.constant(Value::I64(2));
    let gen_name = w.name("counter");

    w.begin_function_ext("counter", 0, false, true);
    w.emit1(Op::LoadConstant, k1);
    w.emit(Op::YieldReturn);
    w.emit1(Op::LoadConstant, k2);
    w.emit(Op::YieldReturn);
    w.emit(Op::YieldBreak);
    w.end_function();

    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, gen_name);
    w.emit1(Op::Call, 0); // calling a generator builds the iterator
    w.emit1(Op::StoreLocal, 0);
    // first + second yielded values
    w.emit1(Op::LoadLocal, 0);
    w.emit(Op::IteratorNext);
    w.emit(Op::Swap);
    w.emit(Op::Pop);
    w.emit1(Op::LoadLocal, 0);
    w.emit(Op::IteratorNext);
    w.emit(Op::Swap);
    w.emit(Op::Pop);
    w.emit(Op::Add);
    w.emit1(Op::StoreLocal, 1);
    // the trailing YieldBreak has not run yet, so the cursor is still live
    w.emit1(Op::LoadLocal, 0);
    w.emit(Op::IteratorHasNext);
    w.emit(Op::Swap);
    w.emit(Op::Pop);
    w.emit1(Op::StoreLocal, 2);
    w.emit1(Op::LoadLocal, 1);
    w.emit(Op::Return);
    w.end_function();

    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::I64(3)));
}

// ─── Objects ─────────────────────────────────────────────────────────────────

#[test]
fn object_fields_and_methods_dispatch_through_the_descriptor() {
    let mut w = BytecodeWriter::new();
    let k7 = w.constant(Value::I64(7));
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
            .with_method("get_x", get_x),
    );

    w.begin_function("main", 0);
    w.emit2(Op::New, point, 0);
    w.emit(Op::Dup);
    w.emit1(Op::LoadConstant, k7);
    w.emit1(Op::StoreMember, x_name);
    w.emit2(Op::CallMethod, getter_name, 0);
    w.emit(Op::Return);
    w.end_function();

    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::I64(7)));
}

#[test]
fn null_receiver_distinguishes_strict_and_null_safe_access() {
    let build = |safe: bool| {
        let mut w = BytecodeWriter::new();
        let member = w.name("x");
        w.begin_function("main", 0);
        w.emit(Op::LoadNull);
        if safe {
            w.emit1(Op::LoadMemberNullSafe, member);
        } else {
            w.emit1(Op::LoadMember, member);
        }
        w.emit(Op::Return);
        w.end_function();
        w.finish()
    };

    let ok = run(build(true)).expect("null-safe access yields null");
    assert!(matches!(ok, Value::Null));

    let err = run(build(false)).unwrap_err();
    assert_eq!(exception_kind(&err), "NullReference");
}

// ─── Vectors, matrices, strings ──────────────────────────────────────────────

#[test]
fn vector_arithmetic_is_elementwise() {
    let mut w = BytecodeWriter::new();
    let k1 = w.constant(Value::F64(1.0));
    let k2 = w.constant(Value::F64(2.0));
    let k3 = w.constant(Value::F64(3.0));
    let k4 = w.constant(Value::F64(4.0));
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, k1);
    w.emit1(Op::LoadConstant, k2);
    w.emit1(Op::MakeVector, 2);
    w.emit1(Op::LoadConstant, k3);
    w.emit1(Op::LoadConstant, k4);
    w.emit1(Op::MakeVector, 2);
    w.emit(Op::Add);
    w.emit(Op::Return);
    w.end_function();

    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::Vector(v) if v.as_ref() == &vec![4.0, 6.0]));
}

#[test]
fn string_concat_displays_in_push_order() {
    let mut w = BytecodeWriter::new();
    let ka = w.constant(Value::Str("n=".into()));
    let kn = w.constant(Value::I64(42));
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, ka);
    w.emit1(Op::LoadConstant, kn);
    w.emit1(Op::StringConcat, 2);
    w.emit(Op::Return);
    w.end_function();

    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::Str(s) if s.as_ref() == "n=42"));
}

// ─── Types ───────────────────────────────────────────────────────────────────

#[test]
fn sizeof_and_cast_follow_the_backend_mapping() {
    let mut w = BytecodeWriter::new();
    let i64_name = w.name("i64");
    w.begin_function("main", 0);
    w.emit1(Op::SizeOf, i64_name);
    w.emit(Op::Return);
    w.end_function();
    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::I64(8)));

    let mut w = BytecodeWriter::new();
    let kf = w.constant(Value::F64(3.9));
    let i32_name = w.name("i32");
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, kf);
    w.emit1(Op::Cast, i32_name);
    w.emit(Op::Return);
    w.end_function();
    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::I32(3)));
}

#[test]
fn failed_cast_raises_cast_error() {
    let mut w = BytecodeWriter::new();
    let ks = w.constant(Value::Str("not a number".into()));
    let name = w.name("i64");
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, ks);
    w.emit1(Op::Cast, name);
    w.emit(Op::Return);
    w.end_function();

    let err = run(w.finish()).unwrap_err();
    assert_eq!(exception_kind(&err), "CastError");
}

// ─── Decoder & debugger surface ──────────────────────────────────────────────

#[test]
fn unknown_opcode_is_fatal_not_catchable() {
    let mut w = BytecodeWriter::new();
    let t0 = w.new_label();
    let t1 = w.new_label();
    let cat = w.new_label();
    w.begin_function("main", 0);
    w.bind(t0);
    w.emit(Op::Nop);
    w.bind(t1);
    w.bind(cat);
    w.emit(Op::ReturnVoid);
    w.add_handler(t0, t1, Some(cat), None, None);
    w.end_function();
    let mut program = w.finish();
    program.code[0] = 0xEE; // stomp the Nop with garbage

    let err = run(program).unwrap_err();
    assert!(matches!(err, VmError::UnknownOpcode { value: 0xEE, .. }));
}

#[test]
fn debug_memory_window_is_64k() {
    let mut w = BytecodeWriter::new();
    w.begin_function("main", 0);
    w.emit(Op::ReturnVoid);
    w.end_function();
    let mut engine = Engine::load_program(w.finish());

    assert!(engine.write_memory(0, 0xAB));
    assert!(engine.write_memory(65535, 0xCD));
    assert!(!engine.write_memory(65536, 0x01));
    assert_eq!(engine.read_memory(0), Some(0xAB));
    assert_eq!(engine.read_memory(65535), Some(0xCD));
    assert_eq!(engine.read_memory(70000), None);
}

#[test]
fn instruction_observer_sees_every_step() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);

    let mut w = BytecodeWriter::new();
    let k2 = w.constant(Value::I64(2));
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, k2);
    w.emit(Op::Return);
    w.end_function();

    let mut engine = Engine::load_program(w.finish());
    engine.set_observer(Box::new(move |_pc, _op| {
        seen.fetch_add(1, Ordering::Relaxed);
    }));
    engine.execute().expect("should run");
    assert_eq!(counter.load(Ordering::Relaxed), 2);
}

#[test]
fn globals_are_readable_by_symbol_name() {
    let mut w = BytecodeWriter::new();
    let k9 = w.constant(Value::I64(9));
    let g = w.global("nine");
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, k9);
    w.emit1(Op::StoreGlobal, g);
    w.emit(Op::ReturnVoid);
    w.end_function();

    let mut engine = Engine::load_program(w.finish());
    engine.execute().expect("should run");
    assert!(matches!(engine.get_global("nine"), Some(Value::I64(9))));
    assert!(engine.get_global("missing").is_none());
}
