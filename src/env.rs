/// Process-wide runtime environment.
///
/// Holds the global slot array, the host-callable table, the type registry,
/// and the import cache. The engine takes an explicit `Arc<RuntimeEnv>`;
/// there is no process-wide singleton. Worker engines created by
/// `AsyncCall` share the same environment, so globals are shared by
/// reference — individual slot accesses take the lock, compound updates are
/// the program's responsibility (`MonitorEnter`/`MonitorExit`).
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::core::types::TypeDescriptor;
use crate::core::value::Value;
use crate::errors::VmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Void,
    Value,
}

/// Host function: plain args in, value or message out. Failure messages are
/// wrapped into `HostCallError` at the call site.
pub type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

#[derive(Clone)]
pub struct HostCallable {
    pub name: String,
    pub arity: usize,
    pub return_kind: ReturnKind,
    pub func: HostFn,
}

pub struct RuntimeEnv {
    /// Global slots, sized by the program's symbol table at load time.
    pub globals: RwLock<Vec<Value>>,
    /// Host callables in registration order; the order is observable
    /// through the suffix-match lookup rule.
    hosts: RwLock<Vec<Arc<HostCallable>>>,
    host_index: DashMap<String, u32>,
    /// Types registered by the embedder or by `Import`, beyond the ones the
    /// program itself declares.
    types: RwLock<Vec<TypeDescriptor>>,
    type_index: DashMap<String, u32>,
    imports: DashMap<String, ()>,
}

impl RuntimeEnv {
    pub fn new(global_count: u32) -> Self {
        RuntimeEnv {
            globals: RwLock::new(vec![Value::Null; global_count as usize]),
            hosts: RwLock::new(Vec::new()),
            host_index: DashMap::new(),
            types: RwLock::new(Vec::new()),
            type_index: DashMap::new(),
            imports: DashMap::new(),
        }
    }

    /// Environment with the built-in host modules already registered.
    pub fn with_builtins(global_count: u32) -> Arc<Self> {
        let env = Arc::new(Self::new(global_count));
        for module in crate::intrinsics::BUILTIN_MODULES {
            crate::intrinsics::register_module(&env, module);
            env.imports.insert((*module).to_string(), ());
        }
        env
    }

    // ── Globals ──────────────────────────────────────────────────────────

    pub fn get_global(&self, index: u32) -> Value {
        self.globals
            .read()
            .get(index as usize)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn set_global(&self, index: u32, value: Value) {
        let mut globals = self.globals.write();
        if (index as usize) < globals.len() {
            globals[index as usize] = value;
        }
    }

    pub fn global_count(&self) -> usize {
        self.globals.read().len()
    }

    // ── Host callables ───────────────────────────────────────────────────

    pub fn register_host(
        &self,
        name: &str,
        arity: usize,
        return_kind: ReturnKind,
        func: HostFn,
    ) -> u32 {
        let mut hosts = self.hosts.write();
        let index = hosts.len() as u32;
        hosts.push(Arc::new(HostCallable {
            name: name.to_string(),
            arity,
            return_kind,
            func,
        }));
        self.host_index.insert(name.to_string(), index);
        index
    }

    pub fn host(&self, index: u32) -> Option<Arc<HostCallable>> {
        self.hosts.read().get(index as usize).cloned()
    }

    /// The observable lookup rule: exact name first, then the first entry in
    /// registration order whose name ends with `".{name}"`.
    pub fn lookup_host(&self, name: &str) -> Option<(u32, Arc<HostCallable>)> {
        if let Some(index) = self.host_index.get(name) {
            let index = *index;
            return self.host(index).map(|h| (index, h));
        }
        let suffix = format!(".{}", name);
        let hosts = self.hosts.read();
        hosts
            .iter()
            .enumerate()
            .find(|(_, h)| h.name.ends_with(&suffix))
            .map(|(i, h)| (i as u32, Arc::clone(h)))
    }

    /// Invoke a host callable; `Ok(None)` for void return kinds. Arity is
    /// checked here, and failure messages become `HostCallError`.
    pub fn call_host(&self, index: u32, args: &[Value]) -> Result<Option<Value>, VmError> {
        let host = self.host(index).ok_or(VmError::BadImage {
            message: format!("host index {} out of range", index),
        })?;
        if args.len() != host.arity {
            return Err(VmError::ArityMismatch {
                name: host.name.clone(),
                expected: host.arity,
                found: args.len(),
            });
        }
        match (host.func)(args) {
            Ok(v) => Ok(match host.return_kind {
                ReturnKind::Void => None,
                ReturnKind::Value => Some(v),
            }),
            Err(message) => Err(VmError::HostCallError {
                name: host.name.clone(),
                message,
            }),
        }
    }

    // ── Type registry ────────────────────────────────────────────────────

    pub fn register_type(&self, descriptor: TypeDescriptor) -> u32 {
        let mut types = self.types.write();
        let index = types.len() as u32;
        self.type_index.insert(descriptor.name.clone(), index);
        types.push(descriptor);
        index
    }

    pub fn type_by_name(&self, name: &str) -> Option<(u32, TypeDescriptor)> {
        let index = *self.type_index.get(name)?;
        let types = self.types.read();
        types.get(index as usize).map(|t| (index, t.clone()))
    }

    // ── Imports ──────────────────────────────────────────────────────────

    /// Import a module by name: registers its types and callables once; a
    /// second import of the same name is a cached no-op. Unknown modules
    /// resolve to an unresolved-function fault at the importing call site,
    /// so importing them is reported here.
    pub fn import(&self, name: &str) -> Result<(), VmError> {
        if self.imports.contains_key(name) {
            return Ok(());
        }
        if !crate::intrinsics::BUILTIN_MODULES.contains(&name) {
            return Err(VmError::HostCallError {
                name: "import".into(),
                message: format!("no host module named '{}'", name),
            });
        }
        crate::intrinsics::register_module(self, name);
        self.imports.insert(name.to_string(), ());
        Ok(())
    }

    pub fn is_imported(&self, name: &str) -> bool {
        self.imports.contains_key(name)
    }
}
