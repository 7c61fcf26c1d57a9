/// Integration tests for the unwinder and the async/parallel adapter.
///
/// These tests verify:
///   • Thrown values arrive in the catch handler intact
///   • Finally blocks run during unwinding before an outer catch matches
///   • Typed catches skip exceptions of other dynamic types
///   • Rethrow re-raises the in-flight exception; outside a catch it faults
///   • AsyncCall workers share globals and deliver results through futures
///   • Monitors serialize cross-engine global updates
///   • Cooperative cancellation raises a catchable Cancelled exception
use ouroboros::bytecode::{BytecodeWriter, Op};
use ouroboros::core::value::Value;
use ouroboros::errors::VmError;
use ouroboros::vm::Engine;

fn run(program: ouroboros::Program) -> Result<Value, VmError> {
    Engine::load_program(program).execute()
}

fn exception_kind(err: &VmError) -> String {
    match err {
        VmError::Uncaught(Value::Exception(o)) => o.type_name.to_string(),
        other => panic!("expected an uncaught exception, got {:?}", other),
    }
}

// ─── Catch ───────────────────────────────────────────────────────────────────

#[test]
fn thrown_exception_object_reaches_the_catch_intact() {
    let mut w = BytecodeWriter::new();
    let kx = w.constant(Value::Str("x".into()));
    let t0 = w.new_label();
    let t1 = w.new_label();
    let cat = w.new_label();

    w.begin_function("main", 0);
    w.emit(Op::BeginTry);
    w.bind(t0);
    w.emit1(Op::LoadConstant, kx);
    w.emit(Op::Throw);
    w.bind(t1);
    w.bind(cat);
    w.emit(Op::BeginCatch);
    w.emit1(Op::StoreLocal, 0);
    w.emit1(Op::LoadLocal, 0);
    w.emit(Op::Return);
    w.add_handler(t0, t1, Some(cat), None, Some("StringError"));
    w.end_function();

    let result = run(w.finish()).expect("catch should handle");
    match result {
        Value::Exception(o) => {
            assert_eq!(o.type_name.as_ref(), "StringError");
            assert!(matches!(o.get_field(0), Value::Str(s) if s.as_ref() == "x"));
        }
        other => panic!("expected the exception object, got {:?}", other),
    }
}

#[test]
fn typed_catch_skips_non_matching_exceptions() {
    // Inner catch only accepts "OtherError"; the outer untyped catch wins.
    let mut w = BytecodeWriter::new();
    let kx = w.constant(Value::Str("boom".into()));
    let k9 = w.constant(Value::I64(9));
    let o0 = w.new_label();
    let o1 = w.new_label();
    let outer_cat = w.new_label();
    let t0 = w.new_label();
    let t1 = w.new_label();
    let inner_cat = w.new_label();

    w.begin_function("main", 0);
    w.bind(o0);
    w.bind(t0);
    w.emit1(Op::LoadConstant, kx);
    w.emit(Op::Throw);
    w.bind(t1);
    w.bind(inner_cat);
    w.emit(Op::BeginCatch);
    w.emit(Op::Pop);
    w.emit(Op::ReturnVoid); // would yield Null if the typed catch matched
    w.bind(o1);
    w.bind(outer_cat);
    w.emit(Op::BeginCatch);
    w.emit(Op::Pop);
    w.emit1(Op::LoadConstant, k9);
    w.emit(Op::Return);
    w.add_handler(t0, t1, Some(inner_cat), None, Some("OtherError"));
    w.add_handler(o0, o1, Some(outer_cat), None, None);
    w.end_function();

    let result = run(w.finish()).expect("outer catch should handle");
    assert!(matches!(result, Value::I64(9)));
}

#[test]
fn uncaught_exception_propagates_to_the_embedder() {
    let mut w = BytecodeWriter::new();
    let kx = w.constant(Value::Str("x".into()));
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, kx);
    w.emit(Op::Throw);
    w.end_function();

    let err = run(w.finish()).unwrap_err();
    assert_eq!(exception_kind(&err), "StringError");
}

// ─── Finally ─────────────────────────────────────────────────────────────────

#[test]
fn finally_runs_during_unwinding_before_the_outer_catch() {
    let mut w = BytecodeWriter::new();
    let kx = w.constant(Value::Str("x".into()));
    let k1 = w.constant(Value::I64(1));
    let marker = w.global("finally_ran");
    let o0 = w.new_label();
    let o1 = w.new_label();
    let cat = w.new_label();
    let t0 = w.new_label();
    let t1 = w.new_label();
    let fin = w.new_label();

    w.begin_function("main", 0);
    w.bind(o0);
    w.bind(t0);
    w.emit1(Op::LoadConstant, kx);
    w.emit(Op::Throw);
    w.bind(t1);
    w.bind(fin);
    w.emit(Op::BeginFinally);
    w.emit1(Op::LoadConstant, k1);
    w.emit1(Op::StoreGlobal, marker);
    w.emit(Op::EndFinally); // resumes the pending exception
    w.bind(o1);
    w.bind(cat);
    w.emit(Op::BeginCatch);
    w.emit(Op::Pop);
    w.emit1(Op::LoadGlobal, marker);
    w.emit(Op::Return);
    w.add_handler(t0, t1, None, Some(fin), None);
    w.add_handler(o0, o1, Some(cat), None, None);
    w.end_function();

    let result = run(w.finish()).expect("outer catch should handle");
    // The returned marker proves the finally executed first.
    assert!(matches!(result, Value::I64(1)));
}

// ─── Rethrow ─────────────────────────────────────────────────────────────────

#[test]
fn rethrow_reraises_into_the_outer_handler() {
    let mut w = BytecodeWriter::new();
    let kx = w.constant(Value::Str("x".into()));
    let k9 = w.constant(Value::I64(9));
    let o0 = w.new_label();
    let o1 = w.new_label();
    let outer_cat = w.new_label();
    let t0 = w.new_label();
    let t1 = w.new_label();
    let inner_cat = w.new_label();

    w.begin_function("main", 0);
    w.bind(o0);
    w.bind(t0);
    w.emit1(Op::LoadConstant, kx);
    w.emit(Op::Throw);
    w.bind(t1);
    w.bind(inner_cat);
    w.emit(Op::BeginCatch);
    w.emit(Op::Pop);
    w.emit(Op::Rethrow);
    w.bind(o1);
    w.bind(outer_cat);
    w.emit(Op::BeginCatch);
    w.emit(Op::Pop);
    w.emit1(Op::LoadConstant, k9);
    w.emit(Op::Return);
    w.add_handler(t0, t1, Some(inner_cat), None, None);
    w.add_handler(o0, o1, Some(outer_cat), None, None);
    w.end_function();

    let result = run(w.finish()).expect("outer catch should handle");
    assert!(matches!(result, Value::I64(9)));
}

#[test]
fn rethrow_outside_a_catch_is_invalid() {
    let mut w = BytecodeWriter::new();
    w.begin_function("main", 0);
    w.emit(Op::Rethrow);
    w.end_function();

    let err = run(w.finish()).unwrap_err();
    assert_eq!(exception_kind(&err), "InvalidRethrow");
}

#[test]
fn match_error_opcode_raises() {
    let mut w = BytecodeWriter::new();
    w.begin_function("main", 0);
    w.emit(Op::ThrowMatchError);
    w.end_function();

    let err = run(w.finish()).unwrap_err();
    assert_eq!(exception_kind(&err), "MatchError");
}

// ─── Unwinding across frames ─────────────────────────────────────────────────

#[test]
fn unwinding_pops_frames_until_a_handler_matches() {
    let mut w = BytecodeWriter::new();
    let kx = w.constant(Value::Str("deep".into()));
    let k3 = w.constant(Value::I64(3));
    let thrower = w.name("thrower");
    let t0 = w.new_label();
    let t1 = w.new_label();
    let cat = w.new_label();

    w.begin_function("thrower", 0);
    w.emit1(Op::LoadConstant, kx);
    w.emit(Op::Throw);
    w.end_function();

    w.begin_function("main", 0);
    w.bind(t0);
    w.emit1(Op::LoadConstant, thrower);
    w.emit1(Op::Call, 0);
    w.bind(t1);
    w.bind(cat);
    w.emit(Op::BeginCatch);
    w.emit(Op::Pop);
    w.emit1(Op::LoadConstant, k3);
    w.emit(Op::Return);
    w.add_handler(t0, t1, Some(cat), None, None);
    w.end_function();

    let mut engine = Engine::load_program(w.finish());
    let result = engine.execute().expect("caller should catch");
    assert!(matches!(result, Value::I64(3)));
    // The thrower's frame and locals are gone.
    assert_eq!(engine.call_depth(), 0);
    assert!(engine.get_locals().is_empty());
}

// ─── Async ───────────────────────────────────────────────────────────────────

#[test]
fn async_call_returns_a_future_awaited_through_the_host() {
    let mut w = BytecodeWriter::new();
    let k42 = w.constant(Value::I64(42));
    let callee = w.name("forty_two");
    let await_name = w.name("Task.Await");

    w.begin_function("forty_two", 0);
    w.emit1(Op::LoadConstant, k42);
    w.emit(Op::Return);
    w.end_function();

    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, callee);
    w.emit1(Op::AsyncCall, 0);
    w.emit1(Op::LoadConstant, await_name);
    w.emit1(Op::Call, 1);
    w.emit(Op::Return);
    w.end_function();

    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::I64(42)));
}

#[test]
fn async_fault_surfaces_when_awaited() {
    let mut w = BytecodeWriter::new();
    let kx = w.constant(Value::Str("worker blew up".into()));
    let callee = w.name("bad");
    let await_name = w.name("Task.Await");

    w.begin_function("bad", 0);
    w.emit1(Op::LoadConstant, kx);
    w.emit(Op::Throw);
    w.end_function();

    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, callee);
    w.emit1(Op::AsyncCall, 0);
    w.emit1(Op::LoadConstant, await_name);
    w.emit1(Op::Call, 1);
    w.emit(Op::Return);
    w.end_function();

    let err = run(w.finish()).unwrap_err();
    assert_eq!(exception_kind(&err), "HostCallError");
}

#[test]
fn monitors_serialize_shared_global_updates() {
    const WORKERS: u32 = 4;

    let mut w = BytecodeWriter::new();
    let k1 = w.constant(Value::I64(1));
    let klock = w.constant(Value::Str("lock".into()));
    let counter = w.global("counter");
    let bump = w.name("bump");
    let await_name = w.name("Task.Await");

    // bump(): with the monitor held, counter += 1
    w.begin_function("bump", 0);
    w.emit1(Op::LoadConstant, klock);
    w.emit(Op::MonitorEnter);
    w.emit1(Op::LoadGlobal, counter);
    w.emit1(Op::LoadConstant, k1);
    w.emit(Op::Add);
    w.emit1(Op::StoreGlobal, counter);
    w.emit1(Op::LoadConstant, klock);
    w.emit(Op::MonitorExit);
    w.emit(Op::ReturnVoid);
    w.end_function();

    w.begin_function("main", 0);
    for i in 0..WORKERS {
        w.emit1(Op::LoadConstant, bump);
        w.emit1(Op::AsyncCall, 0);
        w.emit1(Op::StoreLocal, i);
    }
    for i in 0..WORKERS {
        w.emit1(Op::LoadLocal, i);
        w.emit1(Op::LoadConstant, await_name);
        w.emit1(Op::Call, 1);
        w.emit(Op::Pop);
    }
    w.emit1(Op::LoadGlobal, counter);
    w.emit(Op::Return);
    w.end_function();

    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::I64(n) if n == WORKERS as i64));
}

#[test]
fn parallel_region_with_explicit_degree_still_joins() {
    let mut w = BytecodeWriter::new();
    let k20 = w.constant(Value::I64(20));
    let k22 = w.constant(Value::I64(22));
    let twenty = w.name("twenty");
    let twenty_two = w.name("twenty_two");
    let await_name = w.name("Task.Await");

    w.begin_function("twenty", 0);
    w.emit1(Op::LoadConstant, k20);
    w.emit(Op::Return);
    w.end_function();

    w.begin_function("twenty_two", 0);
    w.emit1(Op::LoadConstant, k22);
    w.emit(Op::Return);
    w.end_function();

    w.begin_function("main", 0);
    w.emit(Op::BeginParallel);
    w.emit1(Op::SetParallelism, 2);
    w.emit1(Op::LoadConstant, twenty);
    w.emit1(Op::AsyncCall, 0);
    w.emit1(Op::StoreLocal, 0);
    w.emit1(Op::LoadConstant, twenty_two);
    w.emit1(Op::AsyncCall, 0);
    w.emit1(Op::StoreLocal, 1);
    w.emit(Op::EndParallel);
    w.emit1(Op::LoadLocal, 0);
    w.emit1(Op::LoadConstant, await_name);
    w.emit1(Op::Call, 1);
    w.emit1(Op::LoadLocal, 1);
    w.emit1(Op::LoadConstant, await_name);
    w.emit1(Op::Call, 1);
    w.emit(Op::Add);
    w.emit(Op::Return);
    w.end_function();

    let result = run(w.finish()).expect("should run");
    assert!(matches!(result, Value::I64(42)));
}

#[test]
fn task_is_done_and_monitor_misuse() {
    // MonitorExit without a matching enter is a host-call fault.
    let mut w = BytecodeWriter::new();
    let klock = w.constant(Value::Str("lock".into()));
    w.begin_function("main", 0);
    w.emit1(Op::LoadConstant, klock);
    w.emit(Op::MonitorExit);
    w.emit(Op::ReturnVoid);
    w.end_function();

    let err = run(w.finish()).unwrap_err();
    assert_eq!(exception_kind(&err), "HostCallError");
}

// ─── Cancellation ────────────────────────────────────────────────────────────

#[test]
fn cancellation_raises_a_catchable_exception() {
    let mut w = BytecodeWriter::new();
    let k7 = w.constant(Value::I64(7));
    let t0 = w.new_label();
    let t1 = w.new_label();
    let cat = w.new_label();

    w.begin_function("main", 0);
    w.bind(t0);
    w.emit(Op::Nop);
    w.emit(Op::ReturnVoid);
    w.bind(t1);
    w.bind(cat);
    w.emit(Op::BeginCatch);
    w.emit(Op::Pop);
    w.emit1(Op::LoadConstant, k7);
    w.emit(Op::Return);
    w.add_handler(t0, t1, Some(cat), None, Some("Cancelled"));
    w.end_function();

    let mut engine = Engine::load_program(w.finish());
    engine.cancel();
    let result = engine.execute().expect("handler should catch Cancelled");
    assert!(matches!(result, Value::I64(7)));
}

#[test]
fn cancellation_without_a_handler_faults() {
    let mut w = BytecodeWriter::new();
    w.begin_function("main", 0);
    w.emit(Op::Nop);
    w.emit(Op::ReturnVoid);
    w.end_function();

    let mut engine = Engine::load_program(w.finish());
    engine.cancel();
    let err = engine.execute().unwrap_err();
    assert_eq!(exception_kind(&err), "Cancelled");
}
