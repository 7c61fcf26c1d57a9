/// Runtime value model.
///
/// `Value` is the universal tagged sum every opcode operates on. Arithmetic,
/// comparison, and coercion are closed matches over the tags (no virtual
/// dispatch), so the IR lowering can mirror each rule exactly.
///
/// Numeric promotion: a binary op widens to `F64` when either side is
/// floating, otherwise to the wider integer. Integer overflow wraps
/// (two's complement). `coerce_to_bool` is used only by conditional
/// branches: `false` and `Null` are false, everything else is true.
use ndarray::Array2;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::core::types::ObjectData;
use crate::errors::VmError;
use crate::tasks::TaskHandle;
use crate::vm::IterState;

/// Closure record: a function plus its captured environment. Captures are
/// bound as a hidden prefix of the callee's frame locals.
#[derive(Debug)]
pub struct ClosureData {
    pub function: u32,
    pub captured: Vec<Value>,
}

#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(Arc<str>),
    Array(Arc<Mutex<Vec<Value>>>),
    /// Association list keyed by structural equality; preserves insertion order.
    Map(Arc<Mutex<Vec<(Value, Value)>>>),
    Object(Arc<ObjectData>),
    /// Index into the program function table.
    Function(u32),
    /// Index into the runtime environment's host-callable table.
    Host(u32),
    Closure(Arc<ClosureData>),
    Future(Arc<TaskHandle>),
    Iterator(Arc<Mutex<IterState>>),
    Vector(Arc<Vec<f64>>),
    Matrix(Arc<Array2<f64>>),
    Quaternion(f64, f64, f64, f64),
    /// Index into the type registry.
    Type(u32),
    Exception(Arc<ObjectData>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::I32(n) => write!(f, "I32({})", n),
            Value::I64(n) => write!(f, "I64({})", n),
            Value::F32(x) => write!(f, "F32({})", x),
            Value::F64(x) => write!(f, "F64({})", x),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Array(a) => write!(f, "Array(len={})", a.lock().len()),
            Value::Map(m) => write!(f, "Map(len={})", m.lock().len()),
            Value::Object(o) => write!(f, "Object({})", o.type_name),
            Value::Function(i) => write!(f, "Function(#{})", i),
            Value::Host(i) => write!(f, "Host(#{})", i),
            Value::Closure(c) => write!(f, "Closure(#{}, {} captured)", c.function, c.captured.len()),
            Value::Future(_) => write!(f, "Future"),
            Value::Iterator(_) => write!(f, "Iterator"),
            Value::Vector(v) => write!(f, "Vector(dim={})", v.len()),
            Value::Matrix(m) => write!(f, "Matrix({}x{})", m.nrows(), m.ncols()),
            Value::Quaternion(w, x, y, z) => write!(f, "Quaternion({}, {}, {}, {})", w, x, y, z),
            Value::Type(i) => write!(f, "Type(#{})", i),
            Value::Exception(o) => write!(f, "Exception({})", o.type_name),
        }
    }
}

impl Value {
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Object(o) => &o.type_name,
            Value::Function(_) => "function",
            Value::Host(_) => "function",
            Value::Closure(_) => "function",
            Value::Future(_) => "future",
            Value::Iterator(_) => "iterator",
            Value::Vector(_) => "vector",
            Value::Matrix(_) => "matrix",
            Value::Quaternion(..) => "quaternion",
            Value::Type(_) => "type",
            Value::Exception(o) => &o.type_name,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::I32(_) | Value::I64(_) | Value::F32(_) | Value::F64(_)
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Value::F32(_) | Value::F64(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Value::I32(_) | Value::I64(_))
    }

    /// Branch coercion. Must stay identical in the IR lowering.
    #[inline(always)]
    pub fn coerce_to_bool(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::I32(n) => Some(*n as f64),
            Value::I64(n) => Some(*n as f64),
            Value::F32(x) => Some(*x as f64),
            Value::F64(x) => Some(*x),
            _ => None,
        }
    }

    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I32(n) => Some(*n as i64),
            Value::I64(n) => Some(*n),
            _ => None,
        }
    }

    /// Structural equality on primitives and strings, element-wise on the
    /// math values, identity on heap values. Total (never faults).
    pub fn eq_val(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (a, b) if a.is_numeric() && b.is_numeric() => {
                if a.is_float() || b.is_float() {
                    a.as_f64() == b.as_f64()
                } else {
                    a.as_i64() == b.as_i64()
                }
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Vector(a), Value::Vector(b)) => a == b,
            (Value::Quaternion(aw, ax, ay, az), Value::Quaternion(bw, bx, by, bz)) => {
                aw == bw && ax == bx && ay == by && az == bz
            }
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
            (Value::Matrix(a), Value::Matrix(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Host(a), Value::Host(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::Future(a), Value::Future(b)) => Arc::ptr_eq(a, b),
            (Value::Iterator(a), Value::Iterator(b)) => Arc::ptr_eq(a, b),
            (Value::Type(a), Value::Type(b)) => a == b,
            _ => false,
        }
    }

    /// Identity key for the monitor table: heap address for reference
    /// values, tag+bits hash for primitives (equal primitives share one).
    pub fn identity_key(&self) -> u64 {
        fn hash_bits(tag: u8, bits: u64) -> u64 {
            let mut h = std::collections::hash_map::DefaultHasher::new();
            tag.hash(&mut h);
            bits.hash(&mut h);
            h.finish()
        }
        match self {
            Value::Array(a) => Arc::as_ptr(a) as u64,
            Value::Map(m) => Arc::as_ptr(m) as u64,
            Value::Object(o) => Arc::as_ptr(o) as u64,
            Value::Exception(o) => Arc::as_ptr(o) as u64,
            Value::Closure(c) => Arc::as_ptr(c) as u64,
            Value::Future(t) => Arc::as_ptr(t) as u64,
            Value::Iterator(i) => Arc::as_ptr(i) as u64,
            Value::Matrix(m) => Arc::as_ptr(m) as u64,
            Value::Vector(v) => Arc::as_ptr(v) as u64,
            Value::Str(s) => hash_bits(1, {
                let mut h = std::collections::hash_map::DefaultHasher::new();
                s.hash(&mut h);
                h.finish()
            }),
            Value::Null => hash_bits(2, 0),
            Value::Bool(b) => hash_bits(3, *b as u64),
            Value::I32(n) => hash_bits(4, *n as u64),
            Value::I64(n) => hash_bits(4, *n as u64),
            Value::F32(x) => hash_bits(5, (*x as f64).to_bits()),
            Value::F64(x) => hash_bits(5, x.to_bits()),
            Value::Quaternion(w, ..) => hash_bits(6, w.to_bits()),
            Value::Function(i) => hash_bits(7, *i as u64),
            Value::Host(i) => hash_bits(8, *i as u64),
            Value::Type(i) => hash_bits(9, *i as u64),
        }
    }

    /// Construct an exception object with the conventional single
    /// `message` field.
    pub fn exception(kind: &str, message: impl Into<String>) -> Value {
        let data = ObjectData::new(u32::MAX, kind, 1);
        data.set_field(0, Value::Str(Arc::from(message.into().as_str())));
        Value::Exception(Arc::new(data))
    }

    /// Wrap an engine fault into the exception object the unwinder carries.
    pub fn from_fault(err: &VmError) -> Value {
        Value::exception(err.kind(), err.to_string())
    }

    pub fn display(&self) -> String {
        match self {
            Value::Null => "null".into(),
            Value::Bool(b) => b.to_string(),
            Value::I32(n) => n.to_string(),
            Value::I64(n) => n.to_string(),
            Value::F32(x) => x.to_string(),
            Value::F64(x) => x.to_string(),
            Value::Str(s) => s.to_string(),
            Value::Array(items) => {
                let items = items.lock();
                let parts: Vec<String> = items.iter().map(|v| v.display()).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Map(entries) => {
                let entries = entries.lock();
                let parts: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.display(), v.display()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Object(o) => format!("<{}>", o.type_name),
            Value::Function(i) => format!("<fn #{}>", i),
            Value::Host(i) => format!("<host #{}>", i),
            Value::Closure(c) => format!("<closure #{}>", c.function),
            Value::Future(_) => "<future>".into(),
            Value::Iterator(_) => "<iterator>".into(),
            Value::Vector(v) => {
                let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                format!("vec({})", parts.join(", "))
            }
            Value::Matrix(m) => format!("matrix({}x{})", m.nrows(), m.ncols()),
            Value::Quaternion(w, x, y, z) => format!("quat({}, {}, {}, {})", w, x, y, z),
            Value::Type(i) => format!("<type #{}>", i),
            Value::Exception(o) => {
                let msg = o.get_field(0);
                format!("{}: {}", o.type_name, msg.display())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Arithmetic
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Neg,
    IntDiv,
}

fn mismatch(op: &str, l: &Value, r: &Value) -> VmError {
    VmError::TypeMismatch {
        expected: format!("operands supporting {}", op),
        found: format!("{} and {}", l.type_name(), r.type_name()),
    }
}

/// Binary/unary arithmetic. `Neg` ignores the right operand.
pub fn arith(op: ArithOp, l: &Value, r: &Value) -> Result<Value, VmError> {
    match op {
        ArithOp::Add => add(l, r),
        ArithOp::Sub => sub(l, r),
        ArithOp::Mul => mul(l, r),
        ArithOp::Div => div(l, r),
        ArithOp::Mod => modulo(l, r),
        ArithOp::Pow => {
            let (a, b) = (l.as_f64(), r.as_f64());
            match (a, b) {
                (Some(a), Some(b)) => Ok(Value::F64(a.powf(b))),
                _ => Err(mismatch("pow", l, r)),
            }
        }
        ArithOp::Neg => neg(l),
        ArithOp::IntDiv => match (l, r) {
            (Value::I32(_), _) | (Value::I64(_), _) if r.is_integer() => {
                let (a, b) = (l.as_i64().unwrap(), r.as_i64().unwrap());
                if b == 0 {
                    return Err(VmError::DivideByZero);
                }
                let q = a.wrapping_div(b);
                Ok(narrow_int(l, r, q))
            }
            _ => Err(mismatch("integer division", l, r)),
        },
    }
}

/// Keep I32 when both inputs were I32, else I64.
#[inline]
fn narrow_int(l: &Value, r: &Value, v: i64) -> Value {
    if matches!(l, Value::I32(_)) && matches!(r, Value::I32(_)) {
        Value::I32(v as i32)
    } else {
        Value::I64(v)
    }
}

fn add(l: &Value, r: &Value) -> Result<Value, VmError> {
    match (l, r) {
        (a, b) if a.is_numeric() && b.is_numeric() => {
            if a.is_float() || b.is_float() {
                Ok(Value::F64(a.as_f64().unwrap() + b.as_f64().unwrap()))
            } else {
                let v = a.as_i64().unwrap().wrapping_add(b.as_i64().unwrap());
                Ok(narrow_int(a, b, v))
            }
        }
        (Value::Str(a), Value::Str(b)) => Ok(Value::Str(Arc::from(format!("{}{}", a, b).as_str()))),
        (Value::Vector(a), Value::Vector(b)) if a.len() == b.len() => Ok(Value::Vector(Arc::new(
            a.iter().zip(b.iter()).map(|(x, y)| x + y).collect(),
        ))),
        (Value::Matrix(a), Value::Matrix(b)) if a.dim() == b.dim() => {
            Ok(Value::Matrix(Arc::new(a.as_ref() + b.as_ref())))
        }
        (Value::Quaternion(aw, ax, ay, az), Value::Quaternion(bw, bx, by, bz)) => {
            Ok(Value::Quaternion(aw + bw, ax + bx, ay + by, az + bz))
        }
        _ => Err(mismatch("addition", l, r)),
    }
}

fn sub(l: &Value, r: &Value) -> Result<Value, VmError> {
    match (l, r) {
        (a, b) if a.is_numeric() && b.is_numeric() => {
            if a.is_float() || b.is_float() {
                Ok(Value::F64(a.as_f64().unwrap() - b.as_f64().unwrap()))
            } else {
                let v = a.as_i64().unwrap().wrapping_sub(b.as_i64().unwrap());
                Ok(narrow_int(a, b, v))
            }
        }
        (Value::Vector(a), Value::Vector(b)) if a.len() == b.len() => Ok(Value::Vector(Arc::new(
            a.iter().zip(b.iter()).map(|(x, y)| x - y).collect(),
        ))),
        (Value::Matrix(a), Value::Matrix(b)) if a.dim() == b.dim() => {
            Ok(Value::Matrix(Arc::new(a.as_ref() - b.as_ref())))
        }
        (Value::Quaternion(aw, ax, ay, az), Value::Quaternion(bw, bx, by, bz)) => {
            Ok(Value::Quaternion(aw - bw, ax - bx, ay - by, az - bz))
        }
        _ => Err(mismatch("subtraction", l, r)),
    }
}

fn mul(l: &Value, r: &Value) -> Result<Value, VmError> {
    match (l, r) {
        (a, b) if a.is_numeric() && b.is_numeric() => {
            if a.is_float() || b.is_float() {
                Ok(Value::F64(a.as_f64().unwrap() * b.as_f64().unwrap()))
            } else {
                let v = a.as_i64().unwrap().wrapping_mul(b.as_i64().unwrap());
                Ok(narrow_int(a, b, v))
            }
        }
        (Value::Vector(v), s) | (s, Value::Vector(v)) if s.is_numeric() => {
            let k = s.as_f64().unwrap();
            Ok(Value::Vector(Arc::new(v.iter().map(|x| x * k).collect())))
        }
        (Value::Matrix(m), s) | (s, Value::Matrix(m)) if s.is_numeric() => {
            let k = s.as_f64().unwrap();
            Ok(Value::Matrix(Arc::new(m.as_ref() * k)))
        }
        (Value::Matrix(a), Value::Matrix(b)) if a.ncols() == b.nrows() => {
            Ok(Value::Matrix(Arc::new(a.dot(b.as_ref()))))
        }
        // Hamilton product
        (Value::Quaternion(aw, ax, ay, az), Value::Quaternion(bw, bx, by, bz)) => {
            Ok(Value::Quaternion(
                aw * bw - ax * bx - ay * by - az * bz,
                aw * bx + ax * bw + ay * bz - az * by,
                aw * by - ax * bz + ay * bw + az * bx,
                aw * bz + ax * by - ay * bx + az * bw,
            ))
        }
        _ => Err(mismatch("multiplication", l, r)),
    }
}

fn div(l: &Value, r: &Value) -> Result<Value, VmError> {
    match (l, r) {
        (a, b) if a.is_numeric() && b.is_numeric() => {
            if a.is_float() || b.is_float() {
                // IEEE semantics for floats (inf / NaN, no fault)
                Ok(Value::F64(a.as_f64().unwrap() / b.as_f64().unwrap()))
            } else {
                let d = b.as_i64().unwrap();
                if d == 0 {
                    return Err(VmError::DivideByZero);
                }
                let v = a.as_i64().unwrap().wrapping_div(d);
                Ok(narrow_int(a, b, v))
            }
        }
        (Value::Vector(v), s) if s.is_numeric() => {
            let k = s.as_f64().unwrap();
            Ok(Value::Vector(Arc::new(v.iter().map(|x| x / k).collect())))
        }
        _ => Err(mismatch("division", l, r)),
    }
}

fn modulo(l: &Value, r: &Value) -> Result<Value, VmError> {
    match (l, r) {
        (a, b) if a.is_numeric() && b.is_numeric() => {
            if a.is_float() || b.is_float() {
                Ok(Value::F64(a.as_f64().unwrap() % b.as_f64().unwrap()))
            } else {
                let d = b.as_i64().unwrap();
                if d == 0 {
                    return Err(VmError::DivideByZero);
                }
                let v = a.as_i64().unwrap().wrapping_rem(d);
                Ok(narrow_int(a, b, v))
            }
        }
        _ => Err(mismatch("modulo", l, r)),
    }
}

fn neg(v: &Value) -> Result<Value, VmError> {
    match v {
        Value::I32(n) => Ok(Value::I32(n.wrapping_neg())),
        Value::I64(n) => Ok(Value::I64(n.wrapping_neg())),
        Value::F32(x) => Ok(Value::F32(-x)),
        Value::F64(x) => Ok(Value::F64(-x)),
        Value::Vector(xs) => Ok(Value::Vector(Arc::new(xs.iter().map(|x| -x).collect()))),
        Value::Matrix(m) => Ok(Value::Matrix(Arc::new(-m.as_ref().clone()))),
        Value::Quaternion(w, x, y, z) => Ok(Value::Quaternion(-w, -x, -y, -z)),
        _ => Err(VmError::TypeMismatch {
            expected: "numeric operand".into(),
            found: v.type_name().into(),
        }),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Comparison, logic, bitwise
// ═══════════════════════════════════════════════════════════════════════════

/// Total order on numeric widenings and strings; `TypeMismatch` elsewhere.
pub fn compare(l: &Value, r: &Value) -> Result<Ordering, VmError> {
    match (l, r) {
        (a, b) if a.is_numeric() && b.is_numeric() => {
            if a.is_float() || b.is_float() {
                let (x, y) = (a.as_f64().unwrap(), b.as_f64().unwrap());
                x.partial_cmp(&y).ok_or(VmError::TypeMismatch {
                    expected: "ordered floats".into(),
                    found: "NaN".into(),
                })
            } else {
                Ok(a.as_i64().unwrap().cmp(&b.as_i64().unwrap()))
            }
        }
        (Value::Str(a), Value::Str(b)) => Ok(a.as_ref().cmp(b.as_ref())),
        _ => Err(VmError::TypeMismatch {
            expected: "comparable operands".into(),
            found: format!("{} and {}", l.type_name(), r.type_name()),
        }),
    }
}

/// `Null` counts as false; otherwise a strict boolean is required.
pub fn logical_not(v: &Value) -> Result<Value, VmError> {
    match v {
        Value::Null => Ok(Value::Bool(true)),
        Value::Bool(b) => Ok(Value::Bool(!b)),
        _ => Err(VmError::TypeMismatch {
            expected: "bool".into(),
            found: v.type_name().into(),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

/// Integer-only bitwise ops. Shift counts take the right operand unsigned,
/// modulo the left operand's width.
pub fn bitwise(op: BitOp, l: &Value, r: &Value) -> Result<Value, VmError> {
    let (a, b) = match (l.as_i64(), r.as_i64()) {
        (Some(a), Some(b)) if l.is_integer() && r.is_integer() => (a, b),
        _ => {
            return Err(VmError::TypeMismatch {
                expected: "integer operands".into(),
                found: format!("{} and {}", l.type_name(), r.type_name()),
            })
        }
    };
    let wide = !(matches!(l, Value::I32(_)) && matches!(r, Value::I32(_)));
    let v = match op {
        BitOp::And => a & b,
        BitOp::Or => a | b,
        BitOp::Xor => a ^ b,
        BitOp::Shl | BitOp::Shr => {
            let width = if wide { 64 } else { 32 };
            let count = (b as u64 % width) as u32;
            match op {
                BitOp::Shl => {
                    if wide {
                        a.wrapping_shl(count)
                    } else {
                        (a as i32).wrapping_shl(count) as i64
                    }
                }
                _ => {
                    if wide {
                        a.wrapping_shr(count)
                    } else {
                        (a as i32).wrapping_shr(count) as i64
                    }
                }
            }
        }
    };
    Ok(if wide { Value::I64(v) } else { Value::I32(v as i32) })
}

pub fn bitwise_not(v: &Value) -> Result<Value, VmError> {
    match v {
        Value::I32(n) => Ok(Value::I32(!n)),
        Value::I64(n) => Ok(Value::I64(!n)),
        _ => Err(VmError::TypeMismatch {
            expected: "integer operand".into(),
            found: v.type_name().into(),
        }),
    }
}
