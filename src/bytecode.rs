/// Bytecode instruction set and program container.
///
/// ENCODING
/// ────────
/// One opcode byte followed by zero or more 32-bit little-endian immediates.
/// Immediate kinds: constant index, local index, global index, signed
/// PC-relative offset (measured from the byte after the immediate), argument
/// count, type/name index into the constant pool.
///
/// There is exactly one canonical ISA. Any opcode byte outside the table
/// below fails decoding with `UnknownOpcode`; there are no legacy aliases.
///
/// Per-opcode metadata: `name()` for diagnostics, `immediate_count()` for
/// the decoder, and `stack_delta(imms)` — the net operand-stack effect,
/// `None` for call-family opcodes whose effect depends on the callee.
use std::collections::HashMap;

use crate::core::types::TypeDescriptor;
use crate::core::value::Value;
use crate::errors::VmError;

macro_rules! opcodes {
    ($( $name:ident = $val:literal, $imms:literal ;)+) => {
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Op {
            $( $name = $val, )+
        }

        impl Op {
            pub fn from_byte(byte: u8) -> Option<Op> {
                match byte {
                    $( $val => Some(Op::$name), )+
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( Op::$name => stringify!($name), )+
                }
            }

            /// Number of 32-bit immediates following the opcode byte.
            pub fn immediate_count(self) -> usize {
                match self {
                    $( Op::$name => $imms, )+
                }
            }
        }
    };
}

opcodes! {
    // ── Control ──────────────────────────────────────────────────────────
    Nop             = 0x00, 0;
    Halt            = 0x01, 0;
    Jump            = 0x02, 1;
    JumpIfTrue      = 0x03, 1;
    JumpIfFalse     = 0x04, 1;
    Call            = 0x05, 1;
    Return          = 0x06, 0;
    ReturnVoid      = 0x07, 0;
    AsyncCall       = 0x08, 1;
    Break           = 0x09, 1;
    Continue        = 0x0A, 1;

    // ── Stack ────────────────────────────────────────────────────────────
    Pop             = 0x10, 0;
    Dup             = 0x11, 0;
    Dup2            = 0x12, 0;
    Swap            = 0x13, 0;

    // ── Load / store ─────────────────────────────────────────────────────
    LoadConstant    = 0x18, 1;
    LoadLocal       = 0x19, 1;
    StoreLocal      = 0x1A, 1;
    LoadGlobal      = 0x1B, 1;
    StoreGlobal     = 0x1C, 1;
    LoadTrue        = 0x1D, 0;
    LoadFalse       = 0x1E, 0;
    LoadNull        = 0x1F, 0;
    LoadThis        = 0x20, 0;

    // ── Arithmetic ───────────────────────────────────────────────────────
    Add             = 0x28, 0;
    Sub             = 0x29, 0;
    Mul             = 0x2A, 0;
    Div             = 0x2B, 0;
    Mod             = 0x2C, 0;
    Pow             = 0x2D, 0;
    Neg             = 0x2E, 0;
    IntDiv          = 0x2F, 0;

    // ── Comparison ───────────────────────────────────────────────────────
    Equal           = 0x38, 0;
    NotEqual        = 0x39, 0;
    Less            = 0x3A, 0;
    Greater         = 0x3B, 0;
    LessEq          = 0x3C, 0;
    GreaterEq       = 0x3D, 0;
    Compare         = 0x3E, 0;
    SpaceshipCompare= 0x3F, 0;

    // ── Logical (strict; short-circuit is lowered to branches) ───────────
    And             = 0x40, 0;
    Or              = 0x41, 0;
    Not             = 0x42, 0;

    // ── Bitwise ──────────────────────────────────────────────────────────
    BAnd            = 0x48, 0;
    BOr             = 0x49, 0;
    BXor            = 0x4A, 0;
    BNot            = 0x4B, 0;
    Shl             = 0x4C, 0;
    Shr             = 0x4D, 0;

    // ── Object ───────────────────────────────────────────────────────────
    New             = 0x58, 2;
    LoadMember      = 0x59, 1;
    LoadMemberNullSafe = 0x5A, 1;
    StoreMember     = 0x5B, 1;
    CallMethod      = 0x5C, 2;

    // ── Collections ──────────────────────────────────────────────────────
    MakeArray       = 0x60, 1;
    MakeVector      = 0x61, 1;
    MakeMatrix      = 0x62, 2;
    MakeQuaternion  = 0x63, 0;
    LoadElement     = 0x64, 0;
    StoreElement    = 0x65, 0;
    GetIterator     = 0x66, 0;
    IteratorHasNext = 0x67, 0;
    IteratorNext    = 0x68, 0;

    // ── Strings ──────────────────────────────────────────────────────────
    ToString        = 0x70, 0;
    StringConcat    = 0x71, 1;

    // ── Types ────────────────────────────────────────────────────────────
    TypeOf          = 0x78, 1;
    SizeOf          = 0x79, 1;
    Cast            = 0x7A, 1;
    IsInstance      = 0x7B, 1;

    // ── Exceptions ───────────────────────────────────────────────────────
    BeginTry        = 0x80, 0;
    BeginCatch      = 0x81, 0;
    BeginFinally    = 0x82, 0;
    EndFinally      = 0x83, 0;
    Throw           = 0x84, 0;
    Rethrow         = 0x85, 0;

    // ── Generators ───────────────────────────────────────────────────────
    YieldReturn     = 0x88, 0;
    YieldBreak      = 0x89, 0;

    // ── Synchronization ──────────────────────────────────────────────────
    MonitorEnter    = 0x90, 0;
    MonitorExit     = 0x91, 0;

    // ── Imports ──────────────────────────────────────────────────────────
    Import          = 0x98, 1;

    // ── Declarations ─────────────────────────────────────────────────────
    DefineClass     = 0xA0, 1;
    DefineInterface = 0xA1, 1;
    DefineStruct    = 0xA2, 1;
    DefineEnum      = 0xA3, 1;
    DefineFunction  = 0xA4, 1;

    // ── Async / parallel regions ─────────────────────────────────────────
    BeginAsync      = 0xA8, 0;
    EndAsync        = 0xA9, 0;
    BeginParallel   = 0xAA, 0;
    EndParallel     = 0xAB, 0;
    SetParallelism  = 0xAC, 1;

    // ── Other ────────────────────────────────────────────────────────────
    NullCoalesce    = 0xB0, 0;
    MakeClosure     = 0xB1, 2;
    ThrowMatchError = 0xB2, 0;
}

impl Op {
    /// Net operand-stack effect. `None` for the call family, whose push
    /// side depends on the callee's return kind.
    pub fn stack_delta(self, imms: &[u32]) -> Option<i32> {
        let n = |i: usize| imms.get(i).copied().unwrap_or(0) as i32;
        Some(match self {
            Op::Call | Op::CallMethod => return None,
            Op::AsyncCall => -n(0), // callee + argc popped, future pushed
            Op::New => 1 - n(1),
            Op::MakeArray | Op::MakeVector | Op::StringConcat => 1 - n(0),
            Op::MakeMatrix => 1 - n(0) * n(1),
            Op::MakeClosure => 1 - n(1),
            Op::MakeQuaternion => -3,

            Op::Pop | Op::Throw | Op::YieldReturn | Op::MonitorEnter | Op::MonitorExit => -1,
            Op::Dup => 1,
            Op::Dup2 => 2,

            Op::LoadConstant
            | Op::LoadLocal
            | Op::LoadGlobal
            | Op::LoadTrue
            | Op::LoadFalse
            | Op::LoadNull
            | Op::LoadThis
            | Op::TypeOf
            | Op::SizeOf
            | Op::IteratorHasNext
            | Op::IteratorNext => 1,
            Op::StoreLocal | Op::StoreGlobal => -1,

            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Pow
            | Op::IntDiv
            | Op::Equal
            | Op::NotEqual
            | Op::Less
            | Op::Greater
            | Op::LessEq
            | Op::GreaterEq
            | Op::Compare
            | Op::SpaceshipCompare
            | Op::And
            | Op::Or
            | Op::BAnd
            | Op::BOr
            | Op::BXor
            | Op::Shl
            | Op::Shr
            | Op::NullCoalesce
            | Op::LoadElement
            | Op::JumpIfTrue
            | Op::JumpIfFalse => -1,

            Op::StoreMember => -2,
            Op::StoreElement => -3,

            _ => 0,
        })
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Op::Jump | Op::JumpIfTrue | Op::JumpIfFalse | Op::Break | Op::Continue
        )
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Program metadata
// ───────────────────────────────────────────────────────────────────────────

/// Not-callable sentinel: the serialized form of a forward-declared symbol
/// with no body. Call resolution treats it as absent.
pub const NO_BODY: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct FunctionRecord {
    pub name: String,
    pub start_offset: u32,
    pub end_offset: u32,
    pub parameter_count: u32,
    /// Exact number of non-parameter locals the body uses, recorded at emit
    /// time; frames pad with this many `Null`s.
    pub local_count: u32,
    pub is_async: bool,
    pub is_generator: bool,
    /// Protected regions declared for this function, innermost last.
    pub handlers: Vec<HandlerRegion>,
}

impl FunctionRecord {
    pub fn is_callable(&self) -> bool {
        self.start_offset != NO_BODY
    }
}

#[derive(Debug, Clone)]
pub struct HandlerRegion {
    pub try_start: u32,
    pub try_end: u32,
    pub catch_start: Option<u32>,
    pub finally_start: Option<u32>,
    /// Restricts the catch to exceptions of this dynamic type; `None`
    /// catches everything.
    pub exception_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolInfo {
    pub is_global: bool,
    pub index: u32,
}

/// The immutable artifact both the VM and the backend consume.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub functions: Vec<FunctionRecord>,
    pub function_names: HashMap<String, u32>,
    pub types: Vec<TypeDescriptor>,
    pub type_names: HashMap<String, u32>,
    pub symbols: HashMap<String, SymbolInfo>,
    pub global_count: u32,
}

impl Program {
    pub fn constant(&self, idx: u32) -> Result<&Value, VmError> {
        self.constants.get(idx as usize).ok_or(VmError::BadImage {
            message: format!("constant index {} out of range", idx),
        })
    }

    /// Constant-pool string (used by name-immediate opcodes).
    pub fn name_constant(&self, idx: u32) -> Result<&str, VmError> {
        match self.constant(idx)? {
            Value::Str(s) => Ok(s),
            other => Err(VmError::BadImage {
                message: format!("constant {} is {} where a name was expected", idx, other.type_name()),
            }),
        }
    }

    pub fn function_by_name(&self, name: &str) -> Option<(u32, &FunctionRecord)> {
        let idx = *self.function_names.get(name)?;
        Some((idx, &self.functions[idx as usize]))
    }

    pub fn function(&self, idx: u32) -> Result<&FunctionRecord, VmError> {
        self.functions.get(idx as usize).ok_or(VmError::BadImage {
            message: format!("function index {} out of range", idx),
        })
    }

    pub fn type_by_name(&self, name: &str) -> Option<(u32, &TypeDescriptor)> {
        let idx = *self.type_names.get(name)?;
        Some((idx, &self.types[idx as usize]))
    }

    /// The function whose body spans `offset`, if any.
    pub fn function_at(&self, offset: usize) -> Option<(u32, &FunctionRecord)> {
        self.functions
            .iter()
            .enumerate()
            .find(|(_, f)| {
                f.is_callable()
                    && (f.start_offset as usize) <= offset
                    && offset < f.end_offset as usize
            })
            .map(|(i, f)| (i as u32, f))
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, VmError> {
        let bytes = self.code.get(offset..offset + 4).ok_or(VmError::BadImage {
            message: format!("immediate at {} runs past end of code", offset),
        })?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32(&self, offset: usize) -> Result<i32, VmError> {
        self.read_u32(offset).map(|v| v as i32)
    }

    /// Decode the instruction at `offset`: opcode plus immediates, and the
    /// offset just past it.
    pub fn decode(&self, offset: usize) -> Result<(Op, Vec<u32>, usize), VmError> {
        let byte = *self.code.get(offset).ok_or(VmError::BadImage {
            message: format!("code offset {} out of range", offset),
        })?;
        let op = Op::from_byte(byte).ok_or(VmError::UnknownOpcode {
            value: byte,
            offset,
        })?;
        let mut imms = Vec::with_capacity(op.immediate_count());
        let mut at = offset + 1;
        for _ in 0..op.immediate_count() {
            imms.push(self.read_u32(at)?);
            at += 4;
        }
        Ok((op, imms, at))
    }

    /// Pretty-print the whole code blob, one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut at = 0usize;
        while at < self.code.len() {
            if let Some((_, f)) = self
                .functions
                .iter()
                .enumerate()
                .find(|(_, f)| f.start_offset as usize == at && f.is_callable())
                .map(|(i, f)| (i, f))
            {
                out.push_str(&format!(
                    "\n{} (params={}, locals={}{}{}):\n",
                    f.name,
                    f.parameter_count,
                    f.local_count,
                    if f.is_async { ", async" } else { "" },
                    if f.is_generator { ", generator" } else { "" },
                ));
            }
            match self.decode(at) {
                Ok((op, imms, next)) => {
                    let imm_text: Vec<String> = imms.iter().map(|i| {
                        if op.is_branch() {
                            format!("{:+} (-> {})", *i as i32, next as i64 + *i as i32 as i64)
                        } else {
                            i.to_string()
                        }
                    }).collect();
                    out.push_str(&format!("  {:6}  {:<16} {}\n", at, op.name(), imm_text.join(", ")));
                    at = next;
                }
                Err(e) => {
                    out.push_str(&format!("  {:6}  <decode error: {}>\n", at, e));
                    break;
                }
            }
        }
        out
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Assembler
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Builds a `Program`: constant interning, label back-patching, function and
/// handler registration. The compiler front-end and the tests both emit
/// through this.
#[derive(Default)]
pub struct BytecodeWriter {
    code: Vec<u8>,
    constants: Vec<Value>,
    functions: Vec<FunctionRecord>,
    function_names: HashMap<String, u32>,
    types: Vec<TypeDescriptor>,
    type_names: HashMap<String, u32>,
    symbols: HashMap<String, SymbolInfo>,
    global_count: u32,
    labels: Vec<Option<u32>>,
    /// (patch offset, label) — the offset is where the i32 lives; the base
    /// for the relative distance is patch offset + 4.
    fixups: Vec<(usize, Label)>,
    current_fn: Option<OpenFunction>,
}

struct OpenFunction {
    index: u32,
    max_local: Option<u32>,
    handlers: Vec<OpenRegion>,
}

struct OpenRegion {
    try_start: Label,
    try_end: Label,
    catch_start: Option<Label>,
    finally_start: Option<Label>,
    exception_type: Option<String>,
}

impl BytecodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    /// Intern a constant; primitives and strings dedup by equality.
    pub fn constant(&mut self, value: Value) -> u32 {
        let dedup = matches!(
            value,
            Value::Null | Value::Bool(_) | Value::I32(_) | Value::I64(_)
                | Value::F32(_) | Value::F64(_) | Value::Str(_)
        );
        if dedup {
            if let Some(i) = self.constants.iter().position(|c| c.eq_val(&value)) {
                return i as u32;
            }
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    pub fn name(&mut self, s: &str) -> u32 {
        self.constant(Value::Str(s.into()))
    }

    pub fn emit(&mut self, op: Op) {
        debug_assert_eq!(op.immediate_count(), 0, "{} needs immediates", op.name());
        self.code.push(op as u8);
    }

    pub fn emit1(&mut self, op: Op, imm: u32) {
        debug_assert_eq!(op.immediate_count(), 1, "{} takes one immediate", op.name());
        self.code.push(op as u8);
        self.code.extend_from_slice(&imm.to_le_bytes());
        self.track_local(op, imm);
    }

    pub fn emit2(&mut self, op: Op, a: u32, b: u32) {
        debug_assert_eq!(op.immediate_count(), 2, "{} takes two immediates", op.name());
        self.code.push(op as u8);
        self.code.extend_from_slice(&a.to_le_bytes());
        self.code.extend_from_slice(&b.to_le_bytes());
    }

    fn track_local(&mut self, op: Op, imm: u32) {
        if matches!(op, Op::LoadLocal | Op::StoreLocal) {
            if let Some(open) = self.current_fn.as_mut() {
                open.max_local = Some(open.max_local.map_or(imm, |m| m.max(imm)));
            }
        }
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.here());
    }

    /// Emit a branch to `label`; forward references are patched in `finish`.
    pub fn branch(&mut self, op: Op, label: Label) {
        debug_assert!(op.is_branch(), "{} is not a branch", op.name());
        self.code.push(op as u8);
        let patch_at = self.code.len();
        self.code.extend_from_slice(&0i32.to_le_bytes());
        self.fixups.push((patch_at, label));
    }

    pub fn begin_function(&mut self, name: &str, parameter_count: u32) -> u32 {
        self.begin_function_ext(name, parameter_count, false, false)
    }

    pub fn begin_function_ext(
        &mut self,
        name: &str,
        parameter_count: u32,
        is_async: bool,
        is_generator: bool,
    ) -> u32 {
        let index = self.functions.len() as u32;
        self.functions.push(FunctionRecord {
            name: name.to_string(),
            start_offset: self.here(),
            end_offset: NO_BODY,
            parameter_count,
            local_count: 0,
            is_async,
            is_generator,
            handlers: Vec::new(),
        });
        self.function_names.insert(name.to_string(), index);
        self.current_fn = Some(OpenFunction {
            index,
            max_local: None,
            handlers: Vec::new(),
        });
        index
    }

    /// Declare a protected region inside the open function. Labels may be
    /// bound before or after this call.
    pub fn add_handler(
        &mut self,
        try_start: Label,
        try_end: Label,
        catch_start: Option<Label>,
        finally_start: Option<Label>,
        exception_type: Option<&str>,
    ) {
        let open = self
            .current_fn
            .as_mut()
            .expect("add_handler outside a function");
        open.handlers.push(OpenRegion {
            try_start,
            try_end,
            catch_start,
            finally_start,
            exception_type: exception_type.map(str::to_string),
        });
    }

    pub fn end_function(&mut self) {
        let open = self.current_fn.take().expect("end_function without begin");
        let end = self.here();
        let record = &mut self.functions[open.index as usize];
        record.end_offset = end;
        let params = record.parameter_count;
        record.local_count = match open.max_local {
            Some(m) if m + 1 > params => m + 1 - params,
            _ => 0,
        };
        let regions: Vec<OpenRegion> = open.handlers;
        let resolve = |labels: &Vec<Option<u32>>, l: Label| labels[l.0].expect("unbound handler label");
        let handlers: Vec<HandlerRegion> = regions
            .into_iter()
            .map(|r| HandlerRegion {
                try_start: resolve(&self.labels, r.try_start),
                try_end: resolve(&self.labels, r.try_end),
                catch_start: r.catch_start.map(|l| resolve(&self.labels, l)),
                finally_start: r.finally_start.map(|l| resolve(&self.labels, l)),
                exception_type: r.exception_type,
            })
            .collect();
        self.functions[open.index as usize].handlers = handlers;
    }

    /// Register a forward declaration with no body (never callable).
    pub fn declare_function(&mut self, name: &str, parameter_count: u32) -> u32 {
        let index = self.functions.len() as u32;
        self.functions.push(FunctionRecord {
            name: name.to_string(),
            start_offset: NO_BODY,
            end_offset: NO_BODY,
            parameter_count,
            local_count: 0,
            is_async: false,
            is_generator: false,
            handlers: Vec::new(),
        });
        self.function_names.insert(name.to_string(), index);
        index
    }

    pub fn define_type(&mut self, descriptor: TypeDescriptor) -> u32 {
        let index = self.types.len() as u32;
        self.type_names.insert(descriptor.name.clone(), index);
        self.types.push(descriptor);
        index
    }

    pub fn global(&mut self, name: &str) -> u32 {
        if let Some(sym) = self.symbols.get(name) {
            return sym.index;
        }
        let index = self.global_count;
        self.global_count += 1;
        self.symbols.insert(
            name.to_string(),
            SymbolInfo {
                is_global: true,
                index,
            },
        );
        index
    }

    /// Record a local-variable name for the debugger surface.
    pub fn local_symbol(&mut self, name: &str, index: u32) {
        self.symbols.insert(
            name.to_string(),
            SymbolInfo {
                is_global: false,
                index,
            },
        );
    }

    pub fn finish(mut self) -> Program {
        for (at, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0].expect("unbound branch label") as i64;
            let base = (at + 4) as i64;
            let rel = (target - base) as i32;
            self.code[at..at + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Program {
            code: self.code,
            constants: self.constants,
            functions: self.functions,
            function_names: self.function_names,
            types: self.types,
            type_names: self.type_names,
            symbols: self.symbols,
            global_count: self.global_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut program = Program::default();
        program.code = vec![0xFF];
        assert!(matches!(
            program.decode(0),
            Err(VmError::UnknownOpcode { value: 0xFF, offset: 0 })
        ));
    }

    #[test]
    fn branch_offsets_are_relative_to_end_of_immediate() {
        let mut w = BytecodeWriter::new();
        let target = w.new_label();
        w.branch(Op::Jump, target); // 5 bytes
        w.emit(Op::Nop); // offset 5
        w.bind(target); // offset 6
        w.emit(Op::Halt);
        let p = w.finish();
        let (op, imms, next) = p.decode(0).unwrap();
        assert_eq!(op, Op::Jump);
        assert_eq!(next, 5);
        // target 6, base 5 → +1
        assert_eq!(imms[0] as i32, 1);
    }

    #[test]
    fn backward_branch_is_negative() {
        let mut w = BytecodeWriter::new();
        let top = w.new_label();
        w.bind(top); // offset 0
        w.emit(Op::Nop);
        w.branch(Op::Jump, top); // at 1..6, base 6 → -6
        let p = w.finish();
        let (_, imms, _) = p.decode(1).unwrap();
        assert_eq!(imms[0] as i32, -6);
    }

    #[test]
    fn constants_are_interned_by_equality() {
        let mut w = BytecodeWriter::new();
        let a = w.constant(Value::I64(7));
        let b = w.constant(Value::I64(7));
        let c = w.constant(Value::Str("x".into()));
        let d = w.constant(Value::Str("x".into()));
        assert_eq!(a, b);
        assert_eq!(c, d);
        assert_ne!(a, c);
    }

    #[test]
    fn local_count_is_computed_from_the_body() {
        let mut w = BytecodeWriter::new();
        w.begin_function("f", 2);
        w.emit1(Op::LoadLocal, 0);
        w.emit1(Op::StoreLocal, 4); // locals 2..=4 beyond the params
        w.emit(Op::ReturnVoid);
        w.end_function();
        let p = w.finish();
        let (_, f) = p.function_by_name("f").unwrap();
        assert_eq!(f.parameter_count, 2);
        assert_eq!(f.local_count, 3);
    }

    #[test]
    fn declared_function_without_body_is_not_callable() {
        let mut w = BytecodeWriter::new();
        w.declare_function("ghost", 0);
        let p = w.finish();
        let (_, f) = p.function_by_name("ghost").unwrap();
        assert!(!f.is_callable());
    }

    #[test]
    fn variable_arity_deltas_use_immediates() {
        assert_eq!(Op::MakeArray.stack_delta(&[3]), Some(-2));
        assert_eq!(Op::MakeMatrix.stack_delta(&[2, 2]), Some(-3));
        assert_eq!(Op::Call.stack_delta(&[2]), None);
        assert_eq!(Op::AsyncCall.stack_delta(&[2]), Some(-2));
        assert_eq!(Op::Add.stack_delta(&[]), Some(-1));
    }
}
