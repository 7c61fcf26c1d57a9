/// The Ouroboros execution engine.
///
/// ARCHITECTURE
/// ────────────
/// • Flat dispatch loop over byte-encoded instructions; zero Rust-stack
///   recursion — call frames live on a `Vec<Frame>`, locals in one shared
///   vector segmented by each frame's `locals_base`.
/// • One step: decode opcode, read immediates, apply the effect, fire the
///   instruction observer, apply any branch (PC-relative to the byte after
///   the immediate).
/// • Faults unwind through per-function handler-region tables; program
///   exceptions are `Value::Exception` objects, never Rust panics.
/// • Generators are reified state machines: a suspended generator stores
///   its pc, locals, stacks, and frames, and resumes on a scratch engine
///   sharing this engine's program and environment.
/// • `AsyncCall` offloads to worker engines (see `tasks`); a cooperative
///   cancellation flag is polled at every step boundary.
use colored::Colorize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bytecode::{Op, Program};
use crate::conf::OuroConf;
use crate::core::types::{MemberKind, ObjectData, TypeDescriptor};
use crate::core::value::{self, ArithOp, BitOp, ClosureData, Value};
use crate::env::{HostFn, ReturnKind, RuntimeEnv};
use crate::errors::VmError;
use crate::tasks::{self, MonitorTable, ParallelRegion};

/// Return address meaning "leave the loop and hand the value to the host".
const RETURN_TO_HOST: usize = usize::MAX;

/// Env-registered types carry this bit in their `Value::Type` id to keep
/// them apart from program-declared types.
const ENV_TYPE_BIT: u32 = 0x8000_0000;

const DEBUG_MEMORY_SIZE: usize = 64 * 1024;

// ═══════════════════════════════════════════════════════════════════════════
// Frames and iterator state
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct Frame {
    pub return_address: usize,
    pub locals_base: usize,
    /// Function table index; `u32::MAX` for the synthetic top-level frame.
    pub function: u32,
    saved_exception: Option<Value>,
    saved_pending: Option<Value>,
}

/// A suspended generator: everything needed to re-enter the dispatch loop
/// exactly where `YieldReturn` left it.
#[derive(Debug)]
pub struct GenState {
    pub function: u32,
    pc: usize,
    locals: Vec<Value>,
    operand_stack: Vec<Value>,
    call_stack: Vec<Frame>,
    this_stack: Vec<Value>,
    pub done: bool,
}

#[derive(Debug)]
pub enum IterState {
    /// Materialized sequence cursor (arrays, maps, strings, vectors).
    Seq { items: Vec<Value>, index: usize },
    /// Suspended generator function.
    Generator(GenState),
}

/// What a public `step` reports back to the debugger.
#[derive(Debug)]
pub enum StepOutcome {
    Running,
    Done(Value),
}

enum StepEvent {
    Continue,
    Done(Value),
    Yielded(Value),
}

enum LoopExit {
    Done(Value),
    Yielded(Value),
}

enum CallOutcome {
    FramePushed,
    Value(Value),
    Void,
}

pub type InstructionObserver = Box<dyn FnMut(usize, Op) + Send>;

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

pub struct Engine {
    program: Arc<Program>,
    pub env: Arc<RuntimeEnv>,
    conf: OuroConf,

    pc: usize,
    /// Offset of the opcode currently executing (handler-region lookups).
    op_pc: usize,
    operand_stack: Vec<Value>,
    locals: Vec<Value>,
    call_stack: Vec<Frame>,
    this_stack: Vec<Value>,

    /// Exception visible to `Rethrow`, set on catch entry, saved/restored
    /// across frames.
    current_exception: Option<Value>,
    /// Exception travelling through a finally block; `EndFinally` resumes it.
    pending: Option<Value>,

    cancel: Arc<AtomicBool>,
    cancel_seen: bool,
    monitors: Arc<MonitorTable>,
    parallel: Vec<ParallelRegion>,
    default_degree: usize,
    async_depth: usize,
    generator_mode: bool,

    observer: Option<InstructionObserver>,
    debug_memory: Option<Box<[u8]>>,
}

impl Engine {
    /// Load a program into a fresh engine with the built-in host modules.
    pub fn load_program(program: Program) -> Self {
        let env = RuntimeEnv::with_builtins(program.global_count);
        Self::with_env(Arc::new(program), env, OuroConf::global().clone())
    }

    /// Embedder entry point with explicit environment and configuration.
    pub fn with_env(program: Arc<Program>, env: Arc<RuntimeEnv>, conf: OuroConf) -> Self {
        let degree = conf.parallelism();
        Engine {
            program,
            env,
            conf,
            pc: 0,
            op_pc: 0,
            operand_stack: Vec::with_capacity(64),
            locals: Vec::with_capacity(64),
            call_stack: Vec::with_capacity(16),
            this_stack: Vec::with_capacity(16),
            current_exception: None,
            pending: None,
            cancel: Arc::new(AtomicBool::new(false)),
            cancel_seen: false,
            monitors: MonitorTable::new(),
            parallel: Vec::new(),
            default_degree: degree,
            async_depth: 0,
            generator_mode: false,
            observer: None,
            debug_memory: None,
        }
    }

    /// Worker constructor used by the async adapter and by generator
    /// resumption: shares program, environment, monitors, and the
    /// cancellation flag of the owning family.
    pub fn worker(
        program: Arc<Program>,
        env: Arc<RuntimeEnv>,
        conf: OuroConf,
        monitors: Arc<MonitorTable>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let mut engine = Self::with_env(program, env, conf);
        engine.monitors = monitors;
        engine.cancel = cancel;
        engine
    }

    // ── Embedding surface ────────────────────────────────────────────────

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn register_host_callable(
        &self,
        name: &str,
        arity: usize,
        func: HostFn,
        return_kind: ReturnKind,
    ) {
        self.env.register_host(name, arity, return_kind, func);
    }

    pub fn register_type(&self, descriptor: TypeDescriptor) {
        self.env.register_type(descriptor);
    }

    pub fn set_observer(&mut self, observer: InstructionObserver) {
        self.observer = Some(observer);
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// One byte of the 64 KiB debug memory window.
    pub fn read_memory(&mut self, addr: usize) -> Option<u8> {
        if addr >= DEBUG_MEMORY_SIZE {
            return None;
        }
        Some(self.memory()[addr])
    }

    pub fn write_memory(&mut self, addr: usize, byte: u8) -> bool {
        if addr >= DEBUG_MEMORY_SIZE {
            return false;
        }
        self.memory()[addr] = byte;
        true
    }

    fn memory(&mut self) -> &mut [u8] {
        self.debug_memory
            .get_or_insert_with(|| vec![0u8; DEBUG_MEMORY_SIZE].into_boxed_slice())
    }

    /// Read a global by symbolic name.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let sym = self.program.symbols.get(name)?;
        if !sym.is_global {
            return None;
        }
        Some(self.env.get_global(sym.index))
    }

    /// Snapshot of the current frame's locals, named through the symbol
    /// table where possible, `l{i}` otherwise.
    pub fn get_locals(&self) -> HashMap<String, Value> {
        let base = self.call_stack.last().map(|f| f.locals_base).unwrap_or(0);
        let slice = &self.locals[base..];
        let mut named: HashMap<usize, &str> = HashMap::new();
        for (name, sym) in &self.program.symbols {
            if !sym.is_global && (sym.index as usize) < slice.len() {
                named.insert(sym.index as usize, name);
            }
        }
        slice
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let name = named
                    .get(&i)
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| format!("l{}", i));
                (name, v.clone())
            })
            .collect()
    }

    pub fn stack_depth(&self) -> usize {
        self.operand_stack.len()
    }

    /// Offset of the next instruction to execute.
    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    /// Inside a `BeginAsync`..`EndAsync` region.
    pub fn in_async_region(&self) -> bool {
        self.async_depth > 0
    }

    // ── Top-level execution ──────────────────────────────────────────────

    /// Run to completion: the program's `main` if declared, else the code
    /// blob from offset 0. Returns the terminal value; an unhandled
    /// exception surfaces as `VmError::Uncaught`.
    pub fn execute(&mut self) -> Result<Value, VmError> {
        let main = self
            .program
            .function_by_name("main")
            .filter(|(_, f)| f.is_callable())
            .map(|(idx, _)| idx);
        match main {
            Some(idx) => self.run_function(idx, Vec::new()),
            None => {
                self.pc = 0;
                match self.run_loop()? {
                    LoopExit::Done(v) => Ok(v),
                    LoopExit::Yielded(_) => Err(VmError::BadImage {
                        message: "yield outside a generator body".into(),
                    }),
                }
            }
        }
    }

    /// Call a user function by table index and run it to completion.
    pub fn run_function(&mut self, index: u32, args: Vec<Value>) -> Result<Value, VmError> {
        self.push_frame(index, &[], args, Value::Null, RETURN_TO_HOST)?;
        match self.run_loop()? {
            LoopExit::Done(v) => Ok(v),
            LoopExit::Yielded(_) => Err(VmError::BadImage {
                message: "yield outside a generator body".into(),
            }),
        }
    }

    /// Call any callable value (function, closure, host, name) to
    /// completion; the entry point for worker engines.
    pub fn run_callable(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, VmError> {
        match self.call_value(callee, args, Value::Null, RETURN_TO_HOST)? {
            CallOutcome::FramePushed => match self.run_loop()? {
                LoopExit::Done(v) => Ok(v),
                LoopExit::Yielded(_) => Err(VmError::BadImage {
                    message: "yield outside a generator body".into(),
                }),
            },
            CallOutcome::Value(v) => Ok(v),
            CallOutcome::Void => Ok(Value::Null),
        }
    }

    /// Advance exactly one instruction (debugger surface). Faults unwind
    /// through handlers just like `execute`.
    pub fn step(&mut self) -> Result<StepOutcome, VmError> {
        match self.step_internal() {
            Ok(StepEvent::Continue) => Ok(StepOutcome::Running),
            Ok(StepEvent::Done(v)) => Ok(StepOutcome::Done(v)),
            Ok(StepEvent::Yielded(_)) => Err(VmError::BadImage {
                message: "yield outside a generator body".into(),
            }),
            Err(e) => {
                self.dispatch_fault(e)?;
                Ok(StepOutcome::Running)
            }
        }
    }

    // ── Dispatch loop ────────────────────────────────────────────────────

    fn run_loop(&mut self) -> Result<LoopExit, VmError> {
        loop {
            match self.step_internal() {
                Ok(StepEvent::Continue) => {}
                Ok(StepEvent::Done(v)) => return Ok(LoopExit::Done(v)),
                Ok(StepEvent::Yielded(v)) => return Ok(LoopExit::Yielded(v)),
                Err(e) => self.dispatch_fault(e)?,
            }
        }
    }

    /// Route a step fault: fatal errors abort, thrown exceptions unwind,
    /// other faults become exceptions and unwind. `Ok(())` means a handler
    /// took over and the loop continues.
    fn dispatch_fault(&mut self, error: VmError) -> Result<(), VmError> {
        let exception = match error {
            e @ (VmError::UnknownOpcode { .. } | VmError::BadImage { .. }) => return Err(e),
            VmError::Uncaught(exc) => exc,
            other => Value::from_fault(&other),
        };
        if self.raise(exception.clone()) {
            Ok(())
        } else {
            Err(VmError::Uncaught(exception))
        }
    }

    fn step_internal(&mut self) -> Result<StepEvent, VmError> {
        self.op_pc = self.pc;

        // Cooperative cancellation, observed once per engine at a step
        // boundary so handlers get a chance to run.
        if !self.cancel_seen && self.cancel.load(Ordering::Acquire) {
            self.cancel_seen = true;
            return Err(VmError::Cancelled);
        }

        let program = Arc::clone(&self.program);
        let (op, imms, next) = program.decode(self.pc)?;
        self.pc = next;

        let event = self.apply(op, &imms, next)?;

        if let Some(observer) = self.observer.as_mut() {
            observer(self.op_pc, op);
        }
        if self.conf.debug_dispatch {
            eprintln!(
                "{} {:6}  {:<16} stack={} frames={}",
                "ouro".dimmed(),
                self.op_pc,
                op.name(),
                self.operand_stack.len(),
                self.call_stack.len()
            );
        }
        Ok(event)
    }

    fn apply(&mut self, op: Op, imms: &[u32], next: usize) -> Result<StepEvent, VmError> {
        let program = Arc::clone(&self.program);
        match op {
            // ── Control ──────────────────────────────────────────────────
            Op::Nop => {}
            Op::Halt => {
                let value = self.operand_stack.pop().unwrap_or(Value::Null);
                return Ok(StepEvent::Done(value));
            }
            Op::Jump | Op::Break | Op::Continue => {
                self.jump(next, imms[0] as i32)?;
            }
            Op::JumpIfTrue => {
                let taken = self.branch_condition(next);
                if taken {
                    self.jump(next, imms[0] as i32)?;
                }
            }
            Op::JumpIfFalse => {
                let taken = self.branch_condition(next);
                if !taken {
                    self.jump(next, imms[0] as i32)?;
                }
            }
            Op::Call => {
                let argc = imms[0] as usize;
                let callee = self.pop("Call")?;
                let args = self.pop_args(argc, "Call")?;
                match self.call_value(callee, args, Value::Null, self.pc)? {
                    CallOutcome::FramePushed | CallOutcome::Void => {}
                    CallOutcome::Value(v) => self.operand_stack.push(v),
                }
            }
            Op::Return => {
                let value = self.operand_stack.pop().unwrap_or(Value::Null);
                match self.pop_frame() {
                    Some(RETURN_TO_HOST) | None => return Ok(StepEvent::Done(value)),
                    Some(return_address) => {
                        self.operand_stack.push(value);
                        self.pc = return_address;
                    }
                }
            }
            Op::ReturnVoid => match self.pop_frame() {
                Some(RETURN_TO_HOST) | None => return Ok(StepEvent::Done(Value::Null)),
                Some(return_address) => self.pc = return_address,
            },
            Op::AsyncCall => {
                let argc = imms[0] as usize;
                let callee = self.pop("AsyncCall")?;
                let args = self.pop_args(argc, "AsyncCall")?;
                let pool = self.parallel.last_mut().map(|region| region.pool());
                let handle = tasks::spawn_task(
                    Arc::clone(&self.program),
                    Arc::clone(&self.env),
                    self.conf.clone(),
                    Arc::clone(&self.monitors),
                    callee,
                    args,
                    pool,
                );
                self.operand_stack.push(Value::Future(handle));
            }

            // ── Stack ────────────────────────────────────────────────────
            Op::Pop => {
                self.pop("Pop")?;
            }
            Op::Dup => {
                let top = self.peek("Dup")?.clone();
                self.operand_stack.push(top);
            }
            Op::Dup2 => {
                let len = self.operand_stack.len();
                if len < 2 {
                    return Err(VmError::StackUnderflow { opcode: "Dup2" });
                }
                let a = self.operand_stack[len - 2].clone();
                let b = self.operand_stack[len - 1].clone();
                self.operand_stack.push(a);
                self.operand_stack.push(b);
            }
            Op::Swap => {
                let len = self.operand_stack.len();
                if len < 2 {
                    return Err(VmError::StackUnderflow { opcode: "Swap" });
                }
                self.operand_stack.swap(len - 2, len - 1);
            }

            // ── Load / store ─────────────────────────────────────────────
            Op::LoadConstant => {
                let value = program.constant(imms[0])?.clone();
                self.operand_stack.push(value);
            }
            Op::LoadLocal => {
                let value = self.load_local(imms[0] as usize);
                self.operand_stack.push(value);
            }
            Op::StoreLocal => {
                let value = self.pop("StoreLocal")?;
                self.store_local(imms[0] as usize, value);
            }
            Op::LoadGlobal => {
                self.operand_stack.push(self.env.get_global(imms[0]));
            }
            Op::StoreGlobal => {
                let value = self.pop("StoreGlobal")?;
                self.env.set_global(imms[0], value);
            }
            Op::LoadTrue => self.operand_stack.push(Value::Bool(true)),
            Op::LoadFalse => self.operand_stack.push(Value::Bool(false)),
            Op::LoadNull => self.operand_stack.push(Value::Null),
            Op::LoadThis => {
                let this = self.this_stack.last().cloned().unwrap_or(Value::Null);
                self.operand_stack.push(this);
            }

            // ── Arithmetic ───────────────────────────────────────────────
            Op::Add => self.binary_arith(ArithOp::Add)?,
            Op::Sub => self.binary_arith(ArithOp::Sub)?,
            Op::Mul => self.binary_arith(ArithOp::Mul)?,
            Op::Div => self.binary_arith(ArithOp::Div)?,
            Op::Mod => self.binary_arith(ArithOp::Mod)?,
            Op::Pow => self.binary_arith(ArithOp::Pow)?,
            Op::IntDiv => self.binary_arith(ArithOp::IntDiv)?,
            Op::Neg => {
                let v = self.pop("Neg")?;
                let out = value::arith(ArithOp::Neg, &v, &Value::Null)?;
                self.operand_stack.push(out);
            }

            // ── Comparison ───────────────────────────────────────────────
            Op::Equal => {
                let (l, r) = self.pop_pair("Equal")?;
                self.operand_stack.push(Value::Bool(l.eq_val(&r)));
            }
            Op::NotEqual => {
                let (l, r) = self.pop_pair("NotEqual")?;
                self.operand_stack.push(Value::Bool(!l.eq_val(&r)));
            }
            Op::Less => self.binary_cmp(|o| o.is_lt())?,
            Op::Greater => self.binary_cmp(|o| o.is_gt())?,
            Op::LessEq => self.binary_cmp(|o| o.is_le())?,
            Op::GreaterEq => self.binary_cmp(|o| o.is_ge())?,
            Op::Compare | Op::SpaceshipCompare => {
                let (l, r) = self.pop_pair("Compare")?;
                let ord = value::compare(&l, &r)?;
                self.operand_stack.push(Value::I32(ord as i32));
            }

            // ── Logical (strict) ─────────────────────────────────────────
            Op::And => {
                let (l, r) = self.pop_bool_pair("And")?;
                self.operand_stack.push(Value::Bool(l && r));
            }
            Op::Or => {
                let (l, r) = self.pop_bool_pair("Or")?;
                self.operand_stack.push(Value::Bool(l || r));
            }
            Op::Not => {
                let v = self.pop("Not")?;
                self.operand_stack.push(value::logical_not(&v)?);
            }

            // ── Bitwise ──────────────────────────────────────────────────
            Op::BAnd => self.binary_bit(BitOp::And)?,
            Op::BOr => self.binary_bit(BitOp::Or)?,
            Op::BXor => self.binary_bit(BitOp::Xor)?,
            Op::Shl => self.binary_bit(BitOp::Shl)?,
            Op::Shr => self.binary_bit(BitOp::Shr)?,
            Op::BNot => {
                let v = self.pop("BNot")?;
                self.operand_stack.push(value::bitwise_not(&v)?);
            }

            // ── Objects ──────────────────────────────────────────────────
            Op::New => {
                let type_idx = imms[0];
                let argc = imms[1] as usize;
                let args = self.pop_args(argc, "New")?;
                self.construct(type_idx, args)?;
            }
            Op::LoadMember => {
                let member = program.name_constant(imms[0])?.to_string();
                let receiver = self.pop("LoadMember")?;
                if receiver.is_null() {
                    return Err(VmError::NullReference { member });
                }
                let value = self.load_member(&receiver, &member)?;
                match value {
                    CallOutcome::FramePushed => {}
                    CallOutcome::Value(v) => self.operand_stack.push(v),
                    CallOutcome::Void => self.operand_stack.push(Value::Null),
                }
            }
            Op::LoadMemberNullSafe => {
                let member = program.name_constant(imms[0])?.to_string();
                let receiver = self.pop("LoadMemberNullSafe")?;
                if receiver.is_null() {
                    self.operand_stack.push(Value::Null);
                } else {
                    match self.load_member(&receiver, &member)? {
                        CallOutcome::FramePushed => {}
                        CallOutcome::Value(v) => self.operand_stack.push(v),
                        CallOutcome::Void => self.operand_stack.push(Value::Null),
                    }
                }
            }
            Op::StoreMember => {
                let member = program.name_constant(imms[0])?.to_string();
                let value = self.pop("StoreMember")?;
                let receiver = self.pop("StoreMember")?;
                self.store_member(receiver, &member, value)?;
            }
            Op::CallMethod => {
                let member = program.name_constant(imms[0])?.to_string();
                let argc = imms[1] as usize;
                let args = self.pop_args(argc, "CallMethod")?;
                let receiver = self.pop("CallMethod")?;
                match self.call_method(receiver, &member, args)? {
                    CallOutcome::FramePushed | CallOutcome::Void => {}
                    CallOutcome::Value(v) => self.operand_stack.push(v),
                }
            }

            // ── Collections ──────────────────────────────────────────────
            Op::MakeArray => {
                let items = self.pop_args(imms[0] as usize, "MakeArray")?;
                self.operand_stack
                    .push(Value::Array(Arc::new(Mutex::new(items))));
            }
            Op::MakeVector => {
                let items = self.pop_args(imms[0] as usize, "MakeVector")?;
                let mut xs = Vec::with_capacity(items.len());
                for item in &items {
                    xs.push(item.as_f64().ok_or_else(|| VmError::TypeMismatch {
                        expected: "numeric vector component".into(),
                        found: item.type_name().into(),
                    })?);
                }
                self.operand_stack.push(Value::Vector(Arc::new(xs)));
            }
            Op::MakeMatrix => {
                let rows = imms[0] as usize;
                let cols = imms[1] as usize;
                let items = self.pop_args(rows * cols, "MakeMatrix")?;
                let mut xs = Vec::with_capacity(items.len());
                for item in &items {
                    xs.push(item.as_f64().ok_or_else(|| VmError::TypeMismatch {
                        expected: "numeric matrix component".into(),
                        found: item.type_name().into(),
                    })?);
                }
                let matrix =
                    ndarray::Array2::from_shape_vec((rows, cols), xs).map_err(|_| {
                        VmError::BadImage {
                            message: "matrix shape disagrees with element count".into(),
                        }
                    })?;
                self.operand_stack.push(Value::Matrix(Arc::new(matrix)));
            }
            Op::MakeQuaternion => {
                let parts = self.pop_args(4, "MakeQuaternion")?;
                let mut xs = [0.0f64; 4];
                for (slot, part) in xs.iter_mut().zip(parts.iter()) {
                    *slot = part.as_f64().ok_or_else(|| VmError::TypeMismatch {
                        expected: "numeric quaternion component".into(),
                        found: part.type_name().into(),
                    })?;
                }
                self.operand_stack
                    .push(Value::Quaternion(xs[0], xs[1], xs[2], xs[3]));
            }
            Op::LoadElement => {
                let index = self.pop("LoadElement")?;
                let target = self.pop("LoadElement")?;
                let value = self.load_element(&target, &index)?;
                self.operand_stack.push(value);
            }
            Op::StoreElement => {
                let value = self.pop("StoreElement")?;
                let index = self.pop("StoreElement")?;
                let target = self.pop("StoreElement")?;
                self.store_element(&target, &index, value)?;
            }
            Op::GetIterator => {
                let source = self.pop("GetIterator")?;
                let iterator = self.make_iterator(source)?;
                self.operand_stack.push(iterator);
            }
            Op::IteratorHasNext => {
                let state = match self.peek("IteratorHasNext")? {
                    Value::Iterator(state) => Arc::clone(state),
                    other => {
                        return Err(VmError::TypeMismatch {
                            expected: "iterator".into(),
                            found: other.type_name().into(),
                        })
                    }
                };
                let has = self.iterator_has_next(&state);
                self.operand_stack.push(Value::Bool(has));
            }
            Op::IteratorNext => {
                let state = match self.peek("IteratorNext")? {
                    Value::Iterator(state) => Arc::clone(state),
                    other => {
                        return Err(VmError::TypeMismatch {
                            expected: "iterator".into(),
                            found: other.type_name().into(),
                        })
                    }
                };
                let value = self.iterator_next(&state)?;
                self.operand_stack.push(value);
            }

            // ── Strings ──────────────────────────────────────────────────
            Op::ToString => {
                let v = self.pop("ToString")?;
                self.operand_stack.push(Value::Str(v.display().into()));
            }
            Op::StringConcat => {
                let parts = self.pop_args(imms[0] as usize, "StringConcat")?;
                let mut out = String::new();
                for part in &parts {
                    out.push_str(&part.display());
                }
                self.operand_stack.push(Value::Str(out.into()));
            }

            // ── Types ────────────────────────────────────────────────────
            Op::TypeOf => {
                let name = program.name_constant(imms[0])?;
                let id = self.resolve_type_id(name)?;
                self.operand_stack.push(Value::Type(id));
            }
            Op::SizeOf => {
                let name = program.name_constant(imms[0])?.to_string();
                let size = self.size_of_type(&name)?;
                self.operand_stack.push(Value::I64(size));
            }
            Op::Cast => {
                let name = program.name_constant(imms[0])?.to_string();
                let v = self.pop("Cast")?;
                let out = self.cast_value(v, &name)?;
                self.operand_stack.push(out);
            }
            Op::IsInstance => {
                let name = program.name_constant(imms[0])?.to_string();
                let v = self.pop("IsInstance")?;
                self.operand_stack
                    .push(Value::Bool(self.is_instance(&v, &name)));
            }

            // ── Exceptions ───────────────────────────────────────────────
            Op::BeginTry | Op::BeginCatch | Op::BeginFinally => {}
            Op::EndFinally => {
                if let Some(exception) = self.pending.take() {
                    return Err(VmError::Uncaught(exception));
                }
            }
            Op::Throw => {
                let v = self.pop("Throw")?;
                let exception = to_exception(v);
                return Err(VmError::Uncaught(exception));
            }
            Op::Rethrow => match self.current_exception.clone() {
                Some(exception) => return Err(VmError::Uncaught(exception)),
                None => return Err(VmError::InvalidRethrow),
            },

            // ── Generators ───────────────────────────────────────────────
            Op::YieldReturn => {
                if !self.generator_mode {
                    return Err(VmError::TypeMismatch {
                        expected: "generator body".into(),
                        found: "plain function".into(),
                    });
                }
                let v = self.pop("YieldReturn")?;
                return Ok(StepEvent::Yielded(v));
            }
            Op::YieldBreak => {
                if !self.generator_mode {
                    return Err(VmError::TypeMismatch {
                        expected: "generator body".into(),
                        found: "plain function".into(),
                    });
                }
                return Ok(StepEvent::Done(Value::Null));
            }

            // ── Synchronization ──────────────────────────────────────────
            Op::MonitorEnter => {
                let v = self.pop("MonitorEnter")?;
                self.monitors.monitor_for(&v).enter();
            }
            Op::MonitorExit => {
                let v = self.pop("MonitorExit")?;
                self.monitors.monitor_for(&v).exit()?;
            }

            // ── Imports ──────────────────────────────────────────────────
            Op::Import => {
                let name = program.name_constant(imms[0])?.to_string();
                self.env.import(&name)?;
            }

            // ── Declarations ─────────────────────────────────────────────
            Op::DefineClass | Op::DefineInterface | Op::DefineStruct | Op::DefineEnum => {
                let name = program.name_constant(imms[0])?;
                match program.type_by_name(name) {
                    Some((_, descriptor)) => {
                        if self.env.type_by_name(name).is_none() {
                            self.env.register_type(descriptor.clone());
                        }
                    }
                    None => {
                        return Err(VmError::BadImage {
                            message: format!("{} names unknown type '{}'", op.name(), name),
                        })
                    }
                }
            }
            Op::DefineFunction => {
                let name = program.name_constant(imms[0])?;
                if program.function_by_name(name).is_none() {
                    return Err(VmError::BadImage {
                        message: format!("DefineFunction names unknown function '{}'", name),
                    });
                }
            }

            // ── Async / parallel regions ─────────────────────────────────
            Op::BeginAsync => self.async_depth += 1,
            Op::EndAsync => self.async_depth = self.async_depth.saturating_sub(1),
            Op::BeginParallel => {
                let degree = self.default_degree;
                self.parallel.push(ParallelRegion::new(degree));
            }
            Op::EndParallel => {
                self.parallel.pop();
            }
            Op::SetParallelism => {
                let n = imms[0] as usize;
                let degree = if n == 0 { self.conf.parallelism() } else { n };
                match self.parallel.last_mut() {
                    Some(region) => region.set_degree(degree),
                    None => self.default_degree = degree,
                }
            }

            // ── Other ────────────────────────────────────────────────────
            Op::NullCoalesce => {
                let fallback = self.pop("NullCoalesce")?;
                let primary = self.pop("NullCoalesce")?;
                self.operand_stack
                    .push(if primary.is_null() { fallback } else { primary });
            }
            Op::MakeClosure => {
                let function = imms[0];
                let captured = self.pop_args(imms[1] as usize, "MakeClosure")?;
                program.function(function)?;
                self.operand_stack
                    .push(Value::Closure(Arc::new(ClosureData { function, captured })));
            }
            Op::ThrowMatchError => {
                return Err(VmError::Uncaught(Value::exception(
                    "MatchError",
                    "no pattern matched the scrutinee",
                )));
            }
        }
        Ok(StepEvent::Continue)
    }

    // ── Stack & branch helpers ───────────────────────────────────────────

    fn pop(&mut self, opcode: &'static str) -> Result<Value, VmError> {
        self.operand_stack
            .pop()
            .ok_or(VmError::StackUnderflow { opcode })
    }

    fn peek(&self, opcode: &'static str) -> Result<&Value, VmError> {
        self.operand_stack
            .last()
            .ok_or(VmError::StackUnderflow { opcode })
    }

    fn pop_pair(&mut self, opcode: &'static str) -> Result<(Value, Value), VmError> {
        let r = self.pop(opcode)?;
        let l = self.pop(opcode)?;
        Ok((l, r))
    }

    fn pop_bool_pair(&mut self, opcode: &'static str) -> Result<(bool, bool), VmError> {
        let (l, r) = self.pop_pair(opcode)?;
        match (&l, &r) {
            (Value::Bool(a), Value::Bool(b)) => Ok((*a, *b)),
            _ => Err(VmError::TypeMismatch {
                expected: "bool operands".into(),
                found: format!("{} and {}", l.type_name(), r.type_name()),
            }),
        }
    }

    /// Pop `argc` values, restoring source push order.
    fn pop_args(&mut self, argc: usize, opcode: &'static str) -> Result<Vec<Value>, VmError> {
        if self.operand_stack.len() < argc {
            return Err(VmError::StackUnderflow { opcode });
        }
        Ok(self
            .operand_stack
            .split_off(self.operand_stack.len() - argc))
    }

    fn binary_arith(&mut self, op: ArithOp) -> Result<(), VmError> {
        let (l, r) = self.pop_pair("arith")?;
        let out = value::arith(op, &l, &r)?;
        self.operand_stack.push(out);
        Ok(())
    }

    fn binary_cmp(
        &mut self,
        decide: fn(std::cmp::Ordering) -> bool,
    ) -> Result<(), VmError> {
        let (l, r) = self.pop_pair("compare")?;
        let ord = value::compare(&l, &r)?;
        self.operand_stack.push(Value::Bool(decide(ord)));
        Ok(())
    }

    fn binary_bit(&mut self, op: BitOp) -> Result<(), VmError> {
        let (l, r) = self.pop_pair("bitwise")?;
        let out = value::bitwise(op, &l, &r)?;
        self.operand_stack.push(out);
        Ok(())
    }

    /// Pop the branch condition; an empty stack reads as false, with a
    /// diagnostic, instead of faulting.
    fn branch_condition(&mut self, next: usize) -> bool {
        match self.operand_stack.pop() {
            Some(v) => v.coerce_to_bool(),
            None => {
                eprintln!(
                    "{} empty operand stack at branch (offset {}), treated as false",
                    "ouro warning:".yellow(),
                    next
                );
                false
            }
        }
    }

    fn jump(&mut self, next: usize, offset: i32) -> Result<(), VmError> {
        let target = next as i64 + offset as i64;
        if target < 0 || target as usize > self.program.code.len() {
            return Err(VmError::BadImage {
                message: format!("branch target {} outside code", target),
            });
        }
        self.pc = target as usize;
        Ok(())
    }

    // ── Locals ───────────────────────────────────────────────────────────

    fn locals_base(&self) -> usize {
        self.call_stack.last().map(|f| f.locals_base).unwrap_or(0)
    }

    /// Reads past the current extent observe `Null` rather than fault.
    fn load_local(&mut self, index: usize) -> Value {
        let at = self.locals_base() + index;
        self.locals.get(at).cloned().unwrap_or(Value::Null)
    }

    fn store_local(&mut self, index: usize, value: Value) {
        let at = self.locals_base() + index;
        if at >= self.locals.len() {
            self.locals.resize(at + 1, Value::Null);
        }
        self.locals[at] = value;
    }

    // ── Calls ────────────────────────────────────────────────────────────

    fn push_frame(
        &mut self,
        function: u32,
        captures: &[Value],
        args: Vec<Value>,
        this: Value,
        return_address: usize,
    ) -> Result<(), VmError> {
        let record = self.program.function(function)?.clone();
        if !record.is_callable() {
            return Err(VmError::UnresolvedFunction { name: record.name });
        }
        if args.len() != record.parameter_count as usize {
            return Err(VmError::ArityMismatch {
                name: record.name,
                expected: record.parameter_count as usize,
                found: args.len(),
            });
        }
        if self.call_stack.len() >= self.conf.max_call_depth {
            return Err(VmError::CallDepthExceeded {
                limit: self.conf.max_call_depth,
            });
        }
        self.call_stack.push(Frame {
            return_address,
            locals_base: self.locals.len(),
            function,
            saved_exception: self.current_exception.take(),
            saved_pending: self.pending.take(),
        });
        self.this_stack.push(this);
        self.locals.extend_from_slice(captures);
        self.locals.extend(args);
        self.locals
            .extend(std::iter::repeat(Value::Null).take(record.local_count as usize));
        self.pc = record.start_offset as usize;
        Ok(())
    }

    /// Pop the active frame: truncate locals to its base and hand back the
    /// return address. `None` when the call stack was already empty.
    fn pop_frame(&mut self) -> Option<usize> {
        let frame = self.call_stack.pop()?;
        self.locals.truncate(frame.locals_base);
        self.this_stack.pop();
        self.current_exception = frame.saved_exception;
        self.pending = frame.saved_pending;
        Some(frame.return_address)
    }

    fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        this: Value,
        return_address: usize,
    ) -> Result<CallOutcome, VmError> {
        match callee {
            Value::Function(index) => {
                let record = self.program.function(index)?;
                if !record.is_callable() {
                    return Err(VmError::UnresolvedFunction {
                        name: record.name.clone(),
                    });
                }
                if record.is_generator {
                    let iterator = self.make_generator(index, &[], args, this)?;
                    return Ok(CallOutcome::Value(iterator));
                }
                self.push_frame(index, &[], args, this, return_address)?;
                Ok(CallOutcome::FramePushed)
            }
            Value::Closure(closure) => {
                let record = self.program.function(closure.function)?;
                if record.is_generator {
                    let iterator =
                        self.make_generator(closure.function, &closure.captured, args, this)?;
                    return Ok(CallOutcome::Value(iterator));
                }
                let captured = closure.captured.clone();
                self.push_frame(closure.function, &captured, args, this, return_address)?;
                Ok(CallOutcome::FramePushed)
            }
            Value::Host(index) => match self.env.call_host(index, &args)? {
                Some(v) => Ok(CallOutcome::Value(v)),
                None => Ok(CallOutcome::Void),
            },
            Value::Str(name) => self.call_by_name(&name, args, this, return_address),
            other => Err(VmError::TypeMismatch {
                expected: "callable value".into(),
                found: other.type_name().into(),
            }),
        }
    }

    /// Symbolic resolution: the program's function table first, then the
    /// host table (exact name, then `.name` suffix scan).
    fn call_by_name(
        &mut self,
        name: &str,
        args: Vec<Value>,
        this: Value,
        return_address: usize,
    ) -> Result<CallOutcome, VmError> {
        if let Some((index, record)) = self.program.function_by_name(name) {
            if record.is_callable() {
                return self.call_value(Value::Function(index), args, this, return_address);
            }
        }
        if let Some((index, _)) = self.env.lookup_host(name) {
            return match self.env.call_host(index, &args)? {
                Some(v) => Ok(CallOutcome::Value(v)),
                None => Ok(CallOutcome::Void),
            };
        }
        Err(VmError::UnresolvedFunction {
            name: name.to_string(),
        })
    }

    // ── Member access ────────────────────────────────────────────────────

    /// Walk the declared type and its base chain for a member.
    fn member_lookup(&self, type_id: u32, member: &str) -> Option<MemberKind> {
        let mut current = self.program.types.get(type_id as usize)?;
        loop {
            if let Some(kind) = current.member(member) {
                return Some(kind.clone());
            }
            let base = current.base.as_deref()?;
            let (next_id, _) = self.program.type_by_name(base)?;
            current = self.program.types.get(next_id as usize)?;
        }
    }

    fn load_member(&mut self, receiver: &Value, member: &str) -> Result<CallOutcome, VmError> {
        match receiver {
            Value::Object(object) | Value::Exception(object) => {
                match self.member_lookup(object.type_id, member) {
                    Some(MemberKind::Field { slot }) => {
                        Ok(CallOutcome::Value(object.get_field(slot)))
                    }
                    Some(MemberKind::Method { function }) => {
                        // Reading a method yields a bound-callable closure
                        // carrying the receiver as its hidden capture.
                        Ok(CallOutcome::Value(Value::Closure(Arc::new(ClosureData {
                            function,
                            captured: vec![receiver.clone()],
                        }))))
                    }
                    Some(MemberKind::Property { get: Some(getter), .. }) => {
                        self.push_frame(getter, &[], Vec::new(), receiver.clone(), self.pc)?;
                        Ok(CallOutcome::FramePushed)
                    }
                    Some(MemberKind::Property { get: None, .. }) | None => {
                        // Exception message convenience: field 0 by
                        // convention.
                        if matches!(receiver, Value::Exception(_)) && member == "message" {
                            return Ok(CallOutcome::Value(object.get_field(0)));
                        }
                        Err(VmError::UnresolvedMember {
                            type_name: object.type_name.to_string(),
                            member: member.to_string(),
                        })
                    }
                }
            }
            Value::Array(items) => match member {
                "length" => Ok(CallOutcome::Value(Value::I64(items.lock().len() as i64))),
                _ => Err(VmError::UnresolvedMember {
                    type_name: "array".into(),
                    member: member.to_string(),
                }),
            },
            Value::Str(s) => match member {
                "length" => Ok(CallOutcome::Value(Value::I64(s.chars().count() as i64))),
                _ => Err(VmError::UnresolvedMember {
                    type_name: "string".into(),
                    member: member.to_string(),
                }),
            },
            Value::Map(entries) => match member {
                "length" => Ok(CallOutcome::Value(Value::I64(entries.lock().len() as i64))),
                _ => {
                    let key = Value::Str(member.into());
                    let entries = entries.lock();
                    Ok(CallOutcome::Value(
                        entries
                            .iter()
                            .find(|(k, _)| k.eq_val(&key))
                            .map(|(_, v)| v.clone())
                            .unwrap_or(Value::Null),
                    ))
                }
            },
            Value::Vector(xs) => match member {
                "length" => Ok(CallOutcome::Value(Value::I64(xs.len() as i64))),
                _ => Err(VmError::UnresolvedMember {
                    type_name: "vector".into(),
                    member: member.to_string(),
                }),
            },
            Value::Matrix(m) => match member {
                "rows" => Ok(CallOutcome::Value(Value::I64(m.nrows() as i64))),
                "cols" => Ok(CallOutcome::Value(Value::I64(m.ncols() as i64))),
                _ => Err(VmError::UnresolvedMember {
                    type_name: "matrix".into(),
                    member: member.to_string(),
                }),
            },
            other => Err(VmError::UnresolvedMember {
                type_name: other.type_name().into(),
                member: member.to_string(),
            }),
        }
    }

    fn store_member(
        &mut self,
        receiver: Value,
        member: &str,
        value: Value,
    ) -> Result<(), VmError> {
        match &receiver {
            Value::Null => Err(VmError::NullReference {
                member: member.to_string(),
            }),
            Value::Object(object) | Value::Exception(object) => {
                match self.member_lookup(object.type_id, member) {
                    Some(MemberKind::Field { slot }) => {
                        object.set_field(slot, value);
                        Ok(())
                    }
                    Some(MemberKind::Property { set: Some(setter), .. }) => {
                        self.push_frame(setter, &[], vec![value], receiver.clone(), self.pc)?;
                        Ok(())
                    }
                    _ => Err(VmError::UnresolvedMember {
                        type_name: object.type_name.to_string(),
                        member: member.to_string(),
                    }),
                }
            }
            Value::Map(entries) => {
                let key = Value::Str(member.into());
                let mut entries = entries.lock();
                match entries.iter_mut().find(|(k, _)| k.eq_val(&key)) {
                    Some(entry) => entry.1 = value,
                    None => entries.push((key, value)),
                }
                Ok(())
            }
            other => Err(VmError::UnresolvedMember {
                type_name: other.type_name().into(),
                member: member.to_string(),
            }),
        }
    }

    fn call_method(
        &mut self,
        receiver: Value,
        member: &str,
        args: Vec<Value>,
    ) -> Result<CallOutcome, VmError> {
        match &receiver {
            Value::Null => Err(VmError::NullReference {
                member: member.to_string(),
            }),
            Value::Object(object) | Value::Exception(object) => {
                match self.member_lookup(object.type_id, member) {
                    Some(MemberKind::Method { function }) => {
                        self.call_value(Value::Function(function), args, receiver.clone(), self.pc)
                    }
                    Some(MemberKind::Field { slot }) => {
                        let field = object.get_field(slot);
                        self.call_value(field, args, receiver.clone(), self.pc)
                    }
                    _ => Err(VmError::UnresolvedMember {
                        type_name: object.type_name.to_string(),
                        member: member.to_string(),
                    }),
                }
            }
            // Built-in receivers route through the host table with the
            // receiver prepended, so `"abc".Upper()` is `Text.Upper("abc")`.
            _ => {
                let qualified = format!("{}.{}", capitalized_kind(&receiver), member);
                let mut host_args = Vec::with_capacity(args.len() + 1);
                host_args.push(receiver.clone());
                host_args.extend(args);
                let lookup = self
                    .env
                    .lookup_host(&qualified)
                    .or_else(|| self.env.lookup_host(member));
                match lookup {
                    Some((index, _)) => match self.env.call_host(index, &host_args)? {
                        Some(v) => Ok(CallOutcome::Value(v)),
                        None => Ok(CallOutcome::Void),
                    },
                    None => Err(VmError::UnresolvedMember {
                        type_name: receiver.type_name().into(),
                        member: member.to_string(),
                    }),
                }
            }
        }
    }

    fn construct(&mut self, type_idx: u32, args: Vec<Value>) -> Result<(), VmError> {
        let descriptor =
            self.program
                .types
                .get(type_idx as usize)
                .cloned()
                .ok_or(VmError::BadImage {
                    message: format!("type index {} out of range", type_idx),
                })?;
        let object = Arc::new(ObjectData::new(
            type_idx,
            &descriptor.name,
            descriptor.field_count(),
        ));
        let value = Value::Object(Arc::clone(&object));
        // The new object stays on the stack beneath the constructor frame;
        // `init` returns void and leaves it as the expression result.
        self.operand_stack.push(value.clone());
        match descriptor.member("init") {
            Some(MemberKind::Method { function }) => {
                self.push_frame(*function, &[], args, value, self.pc)?;
                Ok(())
            }
            _ if args.is_empty() => Ok(()),
            _ => Err(VmError::ArityMismatch {
                name: format!("{}.init", descriptor.name),
                expected: 0,
                found: args.len(),
            }),
        }
    }

    // ── Elements & iterators ─────────────────────────────────────────────

    fn load_element(&self, target: &Value, index: &Value) -> Result<Value, VmError> {
        match (target, index) {
            (Value::Array(items), idx) if idx.is_integer() => {
                let items = items.lock();
                let i = normalize_index(idx.as_i64().unwrap(), items.len())?;
                Ok(items[i].clone())
            }
            (Value::Str(s), idx) if idx.is_integer() => {
                let chars: Vec<char> = s.chars().collect();
                let i = normalize_index(idx.as_i64().unwrap(), chars.len())?;
                Ok(Value::Str(chars[i].to_string().into()))
            }
            (Value::Vector(xs), idx) if idx.is_integer() => {
                let i = normalize_index(idx.as_i64().unwrap(), xs.len())?;
                Ok(Value::F64(xs[i]))
            }
            (Value::Matrix(m), idx) if idx.is_integer() => {
                let i = normalize_index(idx.as_i64().unwrap(), m.nrows())?;
                Ok(Value::Vector(Arc::new(m.row(i).to_vec())))
            }
            (Value::Map(entries), key) => {
                let entries = entries.lock();
                Ok(entries
                    .iter()
                    .find(|(k, _)| k.eq_val(key))
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Null))
            }
            (Value::Null, _) => Err(VmError::NullReference {
                member: "[]".into(),
            }),
            _ => Err(VmError::TypeMismatch {
                expected: "indexable value".into(),
                found: format!("{}[{}]", target.type_name(), index.type_name()),
            }),
        }
    }

    fn store_element(&self, target: &Value, index: &Value, value: Value) -> Result<(), VmError> {
        match (target, index) {
            (Value::Array(items), idx) if idx.is_integer() => {
                let mut items = items.lock();
                let len = items.len();
                let i = normalize_index(idx.as_i64().unwrap(), len)?;
                items[i] = value;
                Ok(())
            }
            (Value::Map(entries), key) => {
                let mut entries = entries.lock();
                match entries.iter_mut().find(|(k, _)| k.eq_val(key)) {
                    Some(entry) => entry.1 = value,
                    None => entries.push((key.clone(), value)),
                }
                Ok(())
            }
            (Value::Null, _) => Err(VmError::NullReference {
                member: "[]".into(),
            }),
            _ => Err(VmError::TypeMismatch {
                expected: "indexable value".into(),
                found: format!("{}[{}]", target.type_name(), index.type_name()),
            }),
        }
    }

    fn make_iterator(&mut self, source: Value) -> Result<Value, VmError> {
        let state = match source {
            Value::Iterator(state) => return Ok(Value::Iterator(state)),
            Value::Array(items) => IterState::Seq {
                items: items.lock().clone(),
                index: 0,
            },
            Value::Map(entries) => IterState::Seq {
                items: entries
                    .lock()
                    .iter()
                    .map(|(k, v)| {
                        Value::Array(Arc::new(Mutex::new(vec![k.clone(), v.clone()])))
                    })
                    .collect(),
                index: 0,
            },
            Value::Str(s) => IterState::Seq {
                items: s
                    .chars()
                    .map(|c| Value::Str(c.to_string().into()))
                    .collect(),
                index: 0,
            },
            Value::Vector(xs) => IterState::Seq {
                items: xs.iter().map(|x| Value::F64(*x)).collect(),
                index: 0,
            },
            other => {
                return Err(VmError::TypeMismatch {
                    expected: "iterable value".into(),
                    found: other.type_name().into(),
                })
            }
        };
        Ok(Value::Iterator(Arc::new(Mutex::new(state))))
    }

    fn iterator_has_next(&self, state: &Arc<Mutex<IterState>>) -> bool {
        let state = state.lock();
        match &*state {
            IterState::Seq { items, index } => *index < items.len(),
            IterState::Generator(gen) => !gen.done,
        }
    }

    fn iterator_next(&mut self, state: &Arc<Mutex<IterState>>) -> Result<Value, VmError> {
        let mut guard = state.lock();
        match &mut *guard {
            IterState::Seq { items, index } => {
                if *index < items.len() {
                    let v = items[*index].clone();
                    *index += 1;
                    Ok(v)
                } else {
                    Ok(Value::Null)
                }
            }
            IterState::Generator(gen) => {
                if gen.done {
                    return Ok(Value::Null);
                }
                self.resume_generator(gen)
            }
        }
    }

    // ── Generators ───────────────────────────────────────────────────────

    fn make_generator(
        &mut self,
        function: u32,
        captures: &[Value],
        args: Vec<Value>,
        this: Value,
    ) -> Result<Value, VmError> {
        let record = self.program.function(function)?.clone();
        if args.len() != record.parameter_count as usize {
            return Err(VmError::ArityMismatch {
                name: record.name,
                expected: record.parameter_count as usize,
                found: args.len(),
            });
        }
        let mut locals = Vec::with_capacity(
            captures.len() + args.len() + record.local_count as usize,
        );
        locals.extend_from_slice(captures);
        locals.extend(args);
        locals.extend(std::iter::repeat(Value::Null).take(record.local_count as usize));
        let state = GenState {
            function,
            pc: record.start_offset as usize,
            locals,
            operand_stack: Vec::new(),
            call_stack: vec![Frame {
                return_address: RETURN_TO_HOST,
                locals_base: 0,
                function,
                saved_exception: None,
                saved_pending: None,
            }],
            this_stack: vec![this],
            done: false,
        };
        Ok(Value::Iterator(Arc::new(Mutex::new(IterState::Generator(
            state,
        )))))
    }

    /// Re-enter a suspended generator on a scratch engine and run until the
    /// next suspension point. Completion (or `YieldBreak`/`Return`) marks
    /// the generator done; its return value is not an iteration element.
    fn resume_generator(&mut self, gen: &mut GenState) -> Result<Value, VmError> {
        let mut scratch = Engine::worker(
            Arc::clone(&self.program),
            Arc::clone(&self.env),
            self.conf.clone(),
            Arc::clone(&self.monitors),
            Arc::clone(&self.cancel),
        );
        scratch.generator_mode = true;
        scratch.pc = gen.pc;
        scratch.locals = std::mem::take(&mut gen.locals);
        scratch.operand_stack = std::mem::take(&mut gen.operand_stack);
        scratch.call_stack = std::mem::take(&mut gen.call_stack);
        scratch.this_stack = std::mem::take(&mut gen.this_stack);

        let outcome = scratch.run_loop();

        gen.pc = scratch.pc;
        gen.locals = std::mem::take(&mut scratch.locals);
        gen.operand_stack = std::mem::take(&mut scratch.operand_stack);
        gen.call_stack = std::mem::take(&mut scratch.call_stack);
        gen.this_stack = std::mem::take(&mut scratch.this_stack);

        match outcome {
            Ok(LoopExit::Yielded(v)) => Ok(v),
            Ok(LoopExit::Done(_)) => {
                gen.done = true;
                Ok(Value::Null)
            }
            Err(e) => {
                gen.done = true;
                Err(e)
            }
        }
    }

    // ── Types ────────────────────────────────────────────────────────────

    fn resolve_type_id(&self, name: &str) -> Result<u32, VmError> {
        if let Some((idx, _)) = self.program.type_by_name(name) {
            return Ok(idx);
        }
        if let Some((idx, _)) = self.env.type_by_name(name) {
            return Ok(idx | ENV_TYPE_BIT);
        }
        if PRIMITIVE_TYPE_NAMES.contains(&name) {
            // Primitive pseudo-types get stable ids past the env bit range.
            let pos = PRIMITIVE_TYPE_NAMES.iter().position(|n| *n == name).unwrap();
            return Ok(ENV_TYPE_BIT | 0x4000_0000 | pos as u32);
        }
        Err(VmError::TypeMismatch {
            expected: "registered type".into(),
            found: name.to_string(),
        })
    }

    fn descriptor_by_name(&self, name: &str) -> Option<TypeDescriptor> {
        self.program
            .type_by_name(name)
            .map(|(_, d)| d.clone())
            .or_else(|| self.env.type_by_name(name).map(|(_, d)| d))
    }

    /// Storage size in bytes under the backend type mapping; classes are a
    /// vtable pointer plus one slot per field.
    fn size_of_type(&self, name: &str) -> Result<i64, VmError> {
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
        match self.descriptor_by_name(name) {
            Some(descriptor) => Ok(8 + 8 * descriptor.field_count() as i64),
            None => Err(VmError::TypeMismatch {
                expected: "registered type".into(),
                found: name.to_string(),
            }),
        }
    }

    fn cast_value(&self, v: Value, target: &str) -> Result<Value, VmError> {
        let fail = |v: &Value| VmError::CastError {
            from: v.type_name().to_string(),
            to: target.to_string(),
        };
        match target {
            "i32" => v
                .as_i64()
                .map(|n| Value::I32(n as i32))
                .or_else(|| v.as_f64().map(|x| Value::I32(x as i32)))
                .ok_or_else(|| fail(&v)),
            "i64" => v
                .as_i64()
                .map(Value::I64)
                .or_else(|| v.as_f64().map(|x| Value::I64(x as i64)))
                .ok_or_else(|| fail(&v)),
            "f32" => v.as_f64().map(|x| Value::F32(x as f32)).ok_or_else(|| fail(&v)),
            "f64" => v.as_f64().map(Value::F64).ok_or_else(|| fail(&v)),
            "bool" => match v {
                Value::Bool(_) => Ok(v),
                _ => Err(fail(&v)),
            },
            "string" => Ok(Value::Str(v.display().into())),
            _ => {
                if self.is_instance(&v, target) {
                    Ok(v)
                } else {
                    Err(fail(&v))
                }
            }
        }
    }

    fn is_instance(&self, v: &Value, name: &str) -> bool {
        if v.type_name() == name {
            return true;
        }
        match v {
            Value::Object(object) | Value::Exception(object) => {
                // Walk the base chain of the declared type.
                let mut current = self
                    .program
                    .types
                    .get(object.type_id as usize)
                    .map(|d| d.clone())
                    .or_else(|| self.descriptor_by_name(&object.type_name));
                while let Some(descriptor) = current {
                    if descriptor.name == name {
                        return true;
                    }
                    current = descriptor
                        .base
                        .as_deref()
                        .and_then(|b| self.descriptor_by_name(b));
                }
                false
            }
            _ => false,
        }
    }

    // ── Unwinder ─────────────────────────────────────────────────────────

    /// Unwind toward a handler for `exception`. Returns true when control
    /// was transferred to a catch or finally; false leaves the exception
    /// uncaught.
    fn raise(&mut self, exception: Value) -> bool {
        let mut search_pc = self.op_pc;
        loop {
            if let Some(target) = self.find_handler(search_pc, &exception) {
                match target {
                    HandlerTarget::Catch(at) => {
                        self.pc = at;
                        self.operand_stack.push(exception.clone());
                        self.current_exception = Some(exception);
                        self.pending = None;
                    }
                    HandlerTarget::Finally(at) => {
                        self.pc = at;
                        self.pending = Some(exception);
                    }
                }
                return true;
            }
            match self.pop_frame() {
                Some(return_address) if return_address != RETURN_TO_HOST => {
                    search_pc = return_address;
                    self.op_pc = return_address;
                }
                _ => return false,
            }
        }
    }

    /// Innermost protected region of the function containing `pc` that
    /// applies to this exception: a type-matching catch, else the region's
    /// finally for pass-through unwinding.
    fn find_handler(&self, pc: usize, exception: &Value) -> Option<HandlerTarget> {
        let (_, record) = self.program.function_at(pc)?;
        let mut candidates: Vec<_> = record
            .handlers
            .iter()
            .filter(|r| (r.try_start as usize) <= pc && pc < r.try_end as usize)
            .collect();
        // Innermost: latest start, earliest end.
        candidates.sort_by_key(|r| (std::cmp::Reverse(r.try_start), r.try_end));
        for region in candidates {
            let matches = region
                .exception_type
                .as_deref()
                .map(|t| self.is_instance(exception, t))
                .unwrap_or(true);
            if matches {
                if let Some(at) = region.catch_start {
                    return Some(HandlerTarget::Catch(at as usize));
                }
            }
            if let Some(at) = region.finally_start {
                return Some(HandlerTarget::Finally(at as usize));
            }
        }
        None
    }
}

enum HandlerTarget {
    Catch(usize),
    Finally(usize),
}

/// Values thrown by `Throw` become exception objects: strings wrap as
/// `StringError` with the string as the message, other non-exception
/// values wrap as `Error`.
fn to_exception(v: Value) -> Value {
    match v {
        Value::Exception(_) => v,
        Value::Str(s) => Value::exception("StringError", s.to_string()),
        other => Value::exception("Error", other.display()),
    }
}

fn normalize_index(index: i64, len: usize) -> Result<usize, VmError> {
    let adjusted = if index < 0 { len as i64 + index } else { index };
    if adjusted < 0 || adjusted as usize >= len {
        return Err(VmError::IndexOutOfRange { index, length: len });
    }
    Ok(adjusted as usize)
}

/// Host-module prefix for method dispatch on built-in receivers.
fn capitalized_kind(v: &Value) -> &'static str {
    match v {
        Value::Str(_) => "Text",
        Value::Future(_) => "Task",
        Value::I32(_) | Value::I64(_) | Value::F32(_) | Value::F64(_) => "Math",
        _ => "Value",
    }
}

const PRIMITIVE_TYPE_NAMES: &[&str] = &[
    "void", "bool", "i8", "i16", "i32", "i64", "f32", "f64", "string", "ptr",
];
