/// Type descriptors and object storage.
///
/// Member access never goes through runtime reflection: when a type is
/// registered, every member name is resolved once into a `MemberKind` with a
/// fixed slot or function index, and `LoadMember`/`StoreMember`/`CallMethod`
/// do a single table lookup against that descriptor.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Class,
    Interface,
    Struct,
    Enum,
}

/// How a named member resolves on a type.
#[derive(Debug, Clone)]
pub enum MemberKind {
    /// Stored field at a fixed slot in the object's field vector.
    Field { slot: usize },
    /// Bound method; `function` indexes the program function table.
    Method { function: u32 },
    /// Property backed by getter/setter functions.
    Property { get: Option<u32>, set: Option<u32> },
}

#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub name: String,
    pub kind: TypeKind,
    /// Declared field names in slot order.
    pub fields: Vec<String>,
    /// Precomputed member table: name → slot/function.
    pub members: HashMap<String, MemberKind>,
    /// Virtual member names in vtable order (class lowering emits these).
    pub virtuals: Vec<String>,
    pub base: Option<String>,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        TypeDescriptor {
            name: name.into(),
            kind,
            fields: Vec::new(),
            members: HashMap::new(),
            virtuals: Vec::new(),
            base: None,
        }
    }

    /// Add a stored field; its slot is the declaration position.
    pub fn with_field(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        let slot = self.fields.len();
        self.fields.push(name.clone());
        self.members.insert(name, MemberKind::Field { slot });
        self
    }

    pub fn with_method(mut self, name: impl Into<String>, function: u32) -> Self {
        self.members
            .insert(name.into(), MemberKind::Method { function });
        self
    }

    pub fn with_virtual(mut self, name: impl Into<String>, function: u32) -> Self {
        let name = name.into();
        self.virtuals.push(name.clone());
        self.members.insert(name, MemberKind::Method { function });
        self
    }

    pub fn member(&self, name: &str) -> Option<&MemberKind> {
        self.members.get(name)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// Heap storage for one object instance. Field order matches the
/// descriptor's `fields`; identity is the `Arc` allocation.
#[derive(Debug)]
pub struct ObjectData {
    pub type_id: u32,
    pub type_name: Arc<str>,
    pub fields: Mutex<Vec<Value>>,
}

impl ObjectData {
    pub fn new(type_id: u32, type_name: impl AsRef<str>, field_count: usize) -> Self {
        ObjectData {
            type_id,
            type_name: Arc::from(type_name.as_ref()),
            fields: Mutex::new(vec![Value::Null; field_count]),
        }
    }

    pub fn get_field(&self, slot: usize) -> Value {
        self.fields.lock().get(slot).cloned().unwrap_or(Value::Null)
    }

    pub fn set_field(&self, slot: usize, value: Value) {
        let mut fields = self.fields.lock();
        if slot >= fields.len() {
            fields.resize(slot + 1, Value::Null);
        }
        fields[slot] = value;
    }
}
