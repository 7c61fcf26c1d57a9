/// Async / parallel adapter.
///
/// `AsyncCall` offloads a call to a worker engine running on its own OS
/// thread (or on the active parallel region's rayon pool). The worker
/// shares the program and the runtime environment by reference and owns its
/// operand stack, locals, and frames. The caller gets a `TaskHandle` future;
/// joining happens through the `task` host module, not through an opcode.
///
/// Cancellation is cooperative: one `AtomicBool` per task, polled at every
/// dispatch step of the worker. `MonitorEnter`/`MonitorExit` acquire a
/// per-value reentrant monitor shared across the whole engine family.
use crossbeam::channel::{bounded, Receiver};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::bytecode::Program;
use crate::conf::OuroConf;
use crate::core::value::Value;
use crate::env::RuntimeEnv;
use crate::errors::VmError;
use crate::vm::Engine;

// ═══════════════════════════════════════════════════════════════════════════
// Task handles
// ═══════════════════════════════════════════════════════════════════════════

/// The future a caller holds after `AsyncCall`. The task result is the
/// worker's top-of-stack value (or `Null`); a worker exception becomes the
/// task's fault, delivered to whoever joins.
pub struct TaskHandle {
    cancel: Arc<AtomicBool>,
    done: AtomicBool,
    result: Mutex<Option<Result<Value, Value>>>,
    receiver: Receiver<Result<Value, Value>>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskHandle(done={})", self.is_done())
    }
}

impl TaskHandle {
    /// Block until the worker finishes. `Err` carries the fault exception
    /// object.
    pub fn join(&self) -> Result<Value, Value> {
        let mut slot = self.result.lock();
        if let Some(cached) = slot.as_ref() {
            return cached.clone();
        }
        let outcome = self
            .receiver
            .recv()
            .unwrap_or_else(|_| Err(Value::exception("Cancelled", "worker disappeared")));
        *slot = Some(outcome.clone());
        self.done.store(true, Ordering::Release);
        outcome
    }

    pub fn is_done(&self) -> bool {
        if self.done.load(Ordering::Acquire) {
            return true;
        }
        let mut slot = self.result.lock();
        if slot.is_some() {
            return true;
        }
        match self.receiver.try_recv() {
            Ok(outcome) => {
                *slot = Some(outcome);
                self.done.store(true, Ordering::Release);
                true
            }
            Err(_) => false,
        }
    }

    /// Request cooperative cancellation; the worker observes the flag at its
    /// next step boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }
}

/// Spawn a worker engine for `callee(args)`. When `pool` is set the task
/// runs inside that parallel region's rayon pool; otherwise it gets a
/// dedicated OS thread.
pub fn spawn_task(
    program: Arc<Program>,
    env: Arc<RuntimeEnv>,
    conf: OuroConf,
    monitors: Arc<MonitorTable>,
    callee: Value,
    args: Vec<Value>,
    pool: Option<Arc<rayon::ThreadPool>>,
) -> Arc<TaskHandle> {
    let cancel = Arc::new(AtomicBool::new(false));
    let (sender, receiver) = bounded(1);
    let handle = Arc::new(TaskHandle {
        cancel: Arc::clone(&cancel),
        done: AtomicBool::new(false),
        result: Mutex::new(None),
        receiver,
    });

    let job = move || {
        let mut worker = Engine::worker(program, env, conf, monitors, cancel);
        let outcome = match worker.run_callable(callee, args) {
            Ok(value) => Ok(value),
            Err(VmError::Uncaught(exc)) => Err(exc),
            Err(fault) => Err(Value::from_fault(&fault)),
        };
        // A dropped handle just discards the result.
        let _ = sender.send(outcome);
    };

    match pool {
        Some(pool) => pool.spawn(job),
        None => {
            thread::Builder::new()
                .name("ouro-worker".into())
                .spawn(job)
                .expect("spawning worker thread");
        }
    }

    handle
}

// ═══════════════════════════════════════════════════════════════════════════
// Parallel regions
// ═══════════════════════════════════════════════════════════════════════════

/// One `BeginParallel`..`EndParallel` scope. The pool is built on first use
/// and rebuilt when `SetParallelism` changes the degree mid-region.
pub struct ParallelRegion {
    degree: usize,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl ParallelRegion {
    pub fn new(degree: usize) -> Self {
        ParallelRegion { degree, pool: None }
    }

    pub fn set_degree(&mut self, degree: usize) {
        if degree != self.degree {
            self.degree = degree;
            self.pool = None;
        }
    }

    pub fn pool(&mut self) -> Arc<rayon::ThreadPool> {
        if self.pool.is_none() {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.degree.max(1))
                .thread_name(|i| format!("ouro-par-{}", i))
                .build()
                .expect("building parallel region pool");
            self.pool = Some(Arc::new(pool));
        }
        Arc::clone(self.pool.as_ref().unwrap())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Monitors
// ═══════════════════════════════════════════════════════════════════════════

/// Reentrant per-value monitor: owner thread plus depth, blocking entry on
/// a condvar.
pub struct Monitor {
    state: Mutex<MonitorState>,
    available: Condvar,
}

#[derive(Default)]
struct MonitorState {
    owner: Option<ThreadId>,
    depth: usize,
}

impl Monitor {
    fn new() -> Self {
        Monitor {
            state: Mutex::new(MonitorState::default()),
            available: Condvar::new(),
        }
    }

    pub fn enter(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                Some(_) => self.available.wait(&mut state),
            }
        }
    }

    pub fn exit(&self) -> Result<(), VmError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.owner {
            Some(owner) if owner == me => {
                state.depth -= 1;
                if state.depth == 0 {
                    state.owner = None;
                    self.available.notify_one();
                }
                Ok(())
            }
            _ => Err(VmError::HostCallError {
                name: "MonitorExit".into(),
                message: "monitor is not held by this engine".into(),
            }),
        }
    }
}

/// Monitor table shared across an engine family; keyed by value identity
/// (heap address for reference values, tag+bits hash for primitives).
#[derive(Default)]
pub struct MonitorTable {
    monitors: DashMap<u64, Arc<Monitor>>,
}

impl MonitorTable {
    pub fn new() -> Arc<Self> {
        Arc::new(MonitorTable::default())
    }

    pub fn monitor_for(&self, value: &Value) -> Arc<Monitor> {
        let key = value.identity_key();
        Arc::clone(
            &self
                .monitors
                .entry(key)
                .or_insert_with(|| Arc::new(Monitor::new())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_is_reentrant_on_one_thread() {
        let table = MonitorTable::new();
        let v = Value::I32(7);
        let m = table.monitor_for(&v);
        m.enter();
        m.enter();
        m.exit().unwrap();
        m.exit().unwrap();
        assert!(m.exit().is_err());
    }

    #[test]
    fn monitor_blocks_second_thread_until_exit() {
        let table = MonitorTable::new();
        let v = Value::Str("shared".into());
        let m = table.monitor_for(&v);
        m.enter();
        let m2 = Arc::clone(&m);
        let t = thread::spawn(move || {
            m2.enter();
            m2.exit().unwrap();
        });
        // Give the other thread a moment to block, then release.
        thread::sleep(std::time::Duration::from_millis(20));
        m.exit().unwrap();
        t.join().unwrap();
    }

    #[test]
    fn same_identity_shares_a_monitor() {
        let table = MonitorTable::new();
        let arr = Value::Array(Arc::new(Mutex::new(vec![])));
        let a = table.monitor_for(&arr);
        let b = table.monitor_for(&arr.clone());
        assert!(Arc::ptr_eq(&a, &b));
    }
}
