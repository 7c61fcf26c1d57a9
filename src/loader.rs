/// On-disk bytecode images (`.orbc`).
///
/// Layout: `magic "ORBC"`, `version: u32`, then tagged sections
/// `{tag: u8, len: u32, payload}` — constants, symbols, functions (with
/// their handler tables), types, code blob. All integers little-endian.
/// The reader validates magic, version, and every bound; any malformed
/// input is a fatal `BadImage`, never a panic.
use std::path::Path;
use std::sync::Arc;

use crate::bytecode::{FunctionRecord, HandlerRegion, Program, SymbolInfo};
use crate::core::types::{MemberKind, TypeDescriptor, TypeKind};
use crate::core::value::Value;
use crate::errors::VmError;

pub const MAGIC: &[u8; 4] = b"ORBC";
pub const VERSION: u32 = 1;

const SEC_CONSTANTS: u8 = 0x01;
const SEC_SYMBOLS: u8 = 0x02;
const SEC_FUNCTIONS: u8 = 0x03;
const SEC_TYPES: u8 = 0x04;
const SEC_CODE: u8 = 0x05;

const NONE: u32 = u32::MAX;

fn bad(message: impl Into<String>) -> VmError {
    VmError::BadImage {
        message: message.into(),
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Reader cursor
// ───────────────────────────────────────────────────────────────────────────

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], VmError> {
        if self.remaining() < n {
            return Err(bad(format!(
                "truncated image: wanted {} bytes at {}, {} left",
                n, self.pos, self.remaining()
            )));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, VmError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, VmError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, VmError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, VmError> {
        Ok(f64::from_bits(self.i64()? as u64))
    }

    fn str(&mut self) -> Result<String, VmError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| bad("non-UTF-8 string in image"))
    }

    fn opt_u32(&mut self) -> Result<Option<u32>, VmError> {
        let v = self.u32()?;
        Ok(if v == NONE { None } else { Some(v) })
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Writer
// ───────────────────────────────────────────────────────────────────────────

struct Out {
    bytes: Vec<u8>,
}

impl Out {
    fn u8(&mut self, v: u8) {
        self.bytes.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }
    fn i64(&mut self, v: i64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }
    fn f64(&mut self, v: f64) {
        self.i64(v.to_bits() as i64);
    }
    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.bytes.extend_from_slice(s.as_bytes());
    }
    fn opt_u32(&mut self, v: Option<u32>) {
        self.u32(v.unwrap_or(NONE));
    }
}

fn section(into: &mut Vec<u8>, tag: u8, payload: Vec<u8>) {
    into.push(tag);
    into.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    into.extend_from_slice(&payload);
}

/// Serialize a program to the `.orbc` byte layout.
pub fn write_program(program: &Program) -> Vec<u8> {
    let mut image = Vec::new();
    image.extend_from_slice(MAGIC);
    image.extend_from_slice(&VERSION.to_le_bytes());

    // Constants. Only data constants appear in pools; anything else in the
    // in-memory pool (none today) would be a writer bug.
    let mut o = Out { bytes: Vec::new() };
    o.u32(program.constants.len() as u32);
    for c in &program.constants {
        match c {
            Value::Null => o.u8(0),
            Value::Bool(b) => {
                o.u8(1);
                o.u8(*b as u8);
            }
            Value::I32(n) => {
                o.u8(2);
                o.u32(*n as u32);
            }
            Value::I64(n) => {
                o.u8(3);
                o.i64(*n);
            }
            Value::F32(x) => {
                o.u8(4);
                o.u32(x.to_bits());
            }
            Value::F64(x) => {
                o.u8(5);
                o.f64(*x);
            }
            Value::Str(s) => {
                o.u8(6);
                o.str(s);
            }
            other => unreachable!("non-serializable constant {:?}", other),
        }
    }
    section(&mut image, SEC_CONSTANTS, o.bytes);

    // Symbols.
    let mut o = Out { bytes: Vec::new() };
    o.u32(program.global_count);
    o.u32(program.symbols.len() as u32);
    let mut symbols: Vec<(&String, &SymbolInfo)> = program.symbols.iter().collect();
    symbols.sort_by_key(|(name, _)| name.as_str());
    for (name, sym) in symbols {
        o.str(name);
        o.u8(sym.is_global as u8);
        o.u32(sym.index);
    }
    section(&mut image, SEC_SYMBOLS, o.bytes);

    // Functions.
    let mut o = Out { bytes: Vec::new() };
    o.u32(program.functions.len() as u32);
    for f in &program.functions {
        o.str(&f.name);
        o.u32(f.start_offset);
        o.u32(f.end_offset);
        o.u32(f.parameter_count);
        o.u32(f.local_count);
        o.u8((f.is_async as u8) | ((f.is_generator as u8) << 1));
        o.u32(f.handlers.len() as u32);
        for h in &f.handlers {
            o.u32(h.try_start);
            o.u32(h.try_end);
            o.opt_u32(h.catch_start);
            o.opt_u32(h.finally_start);
            match &h.exception_type {
                Some(t) => {
                    o.u8(1);
                    o.str(t);
                }
                None => o.u8(0),
            }
        }
    }
    section(&mut image, SEC_FUNCTIONS, o.bytes);

    // Types.
    let mut o = Out { bytes: Vec::new() };
    o.u32(program.types.len() as u32);
    for t in &program.types {
        o.str(&t.name);
        o.u8(match t.kind {
            TypeKind::Class => 0,
            TypeKind::Interface => 1,
            TypeKind::Struct => 2,
            TypeKind::Enum => 3,
        });
        o.u32(t.fields.len() as u32);
        for f in &t.fields {
            o.str(f);
        }
        let mut members: Vec<(&String, &MemberKind)> = t.members.iter().collect();
        members.sort_by_key(|(name, _)| name.as_str());
        o.u32(members.len() as u32);
        for (name, m) in members {
            o.str(name);
            match m {
                MemberKind::Field { slot } => {
                    o.u8(0);
                    o.u32(*slot as u32);
                }
                MemberKind::Method { function } => {
                    o.u8(1);
                    o.u32(*function);
                }
                MemberKind::Property { get, set } => {
                    o.u8(2);
                    o.opt_u32(*get);
                    o.opt_u32(*set);
                }
            }
        }
        o.u32(t.virtuals.len() as u32);
        for v in &t.virtuals {
            o.str(v);
        }
        match &t.base {
            Some(b) => {
                o.u8(1);
                o.str(b);
            }
            None => o.u8(0),
        }
    }
    section(&mut image, SEC_TYPES, o.bytes);

    // Code blob.
    section(&mut image, SEC_CODE, program.code.clone());

    image
}

/// Parse an `.orbc` image.
pub fn read_program(data: &[u8]) -> Result<Program, VmError> {
    let mut c = Cursor::new(data);
    if c.take(4)? != MAGIC {
        return Err(bad("bad magic, not an Ouroboros bytecode image"));
    }
    let version = c.u32()?;
    if version != VERSION {
        return Err(bad(format!(
            "unsupported image version {} (expected {})",
            version, VERSION
        )));
    }

    let mut program = Program::default();
    while c.remaining() > 0 {
        let tag = c.u8()?;
        let len = c.u32()? as usize;
        let payload = c.take(len)?;
        let mut s = Cursor::new(payload);
        match tag {
            SEC_CONSTANTS => {
                let count = s.u32()?;
                for _ in 0..count {
                    let value = match s.u8()? {
                        0 => Value::Null,
                        1 => Value::Bool(s.u8()? != 0),
                        2 => Value::I32(s.u32()? as i32),
                        3 => Value::I64(s.i64()?),
                        4 => Value::F32(f32::from_bits(s.u32()?)),
                        5 => Value::F64(s.f64()?),
                        6 => Value::Str(Arc::from(s.str()?.as_str())),
                        t => return Err(bad(format!("unknown constant tag {}", t))),
                    };
                    program.constants.push(value);
                }
            }
            SEC_SYMBOLS => {
                program.global_count = s.u32()?;
                let count = s.u32()?;
                for _ in 0..count {
                    let name = s.str()?;
                    let is_global = s.u8()? != 0;
                    let index = s.u32()?;
                    if is_global && index >= program.global_count {
                        return Err(bad(format!(
                            "global symbol '{}' index {} out of range ({})",
                            name, index, program.global_count
                        )));
                    }
                    program.symbols.insert(name, SymbolInfo { is_global, index });
                }
            }
            SEC_FUNCTIONS => {
                let count = s.u32()?;
                for _ in 0..count {
                    let name = s.str()?;
                    let start_offset = s.u32()?;
                    let end_offset = s.u32()?;
                    let parameter_count = s.u32()?;
                    let local_count = s.u32()?;
                    let flags = s.u8()?;
                    let handler_count = s.u32()?;
                    let mut handlers = Vec::with_capacity(handler_count as usize);
                    for _ in 0..handler_count {
                        let try_start = s.u32()?;
                        let try_end = s.u32()?;
                        let catch_start = s.opt_u32()?;
                        let finally_start = s.opt_u32()?;
                        let exception_type = if s.u8()? != 0 { Some(s.str()?) } else { None };
                        if catch_start.is_none() && finally_start.is_none() {
                            return Err(bad(format!(
                                "handler region in '{}' has neither catch nor finally",
                                name
                            )));
                        }
                        handlers.push(HandlerRegion {
                            try_start,
                            try_end,
                            catch_start,
                            finally_start,
                            exception_type,
                        });
                    }
                    let index = program.functions.len() as u32;
                    program.function_names.insert(name.clone(), index);
                    program.functions.push(FunctionRecord {
                        name,
                        start_offset,
                        end_offset,
                        parameter_count,
                        local_count,
                        is_async: flags & 1 != 0,
                        is_generator: flags & 2 != 0,
                        handlers,
                    });
                }
            }
            SEC_TYPES => {
                let count = s.u32()?;
                for _ in 0..count {
                    let name = s.str()?;
                    let kind = match s.u8()? {
                        0 => TypeKind::Class,
                        1 => TypeKind::Interface,
                        2 => TypeKind::Struct,
                        3 => TypeKind::Enum,
                        t => return Err(bad(format!("unknown type kind {}", t))),
                    };
                    let mut descriptor = TypeDescriptor::new(name, kind);
                    let field_count = s.u32()?;
                    for _ in 0..field_count {
                        descriptor = descriptor.with_field(s.str()?);
                    }
                    let member_count = s.u32()?;
                    for _ in 0..member_count {
                        let member_name = s.str()?;
                        let member = match s.u8()? {
                            0 => MemberKind::Field {
                                slot: s.u32()? as usize,
                            },
                            1 => MemberKind::Method { function: s.u32()? },
                            2 => MemberKind::Property {
                                get: s.opt_u32()?,
                                set: s.opt_u32()?,
                            },
                            t => return Err(bad(format!("unknown member kind {}", t))),
                        };
                        descriptor.members.insert(member_name, member);
                    }
                    let virtual_count = s.u32()?;
                    for _ in 0..virtual_count {
                        descriptor.virtuals.push(s.str()?);
                    }
                    if s.u8()? != 0 {
                        descriptor.base = Some(s.str()?);
                    }
                    let index = program.types.len() as u32;
                    program.type_names.insert(descriptor.name.clone(), index);
                    program.types.push(descriptor);
                }
            }
            SEC_CODE => {
                program.code = payload.to_vec();
            }
            t => return Err(bad(format!("unknown section tag {:#04x}", t))),
        }
    }

    validate(&program)?;
    Ok(program)
}

/// Structural sanity after all sections are in.
fn validate(program: &Program) -> Result<(), VmError> {
    for f in &program.functions {
        if !f.is_callable() {
            continue;
        }
        if f.end_offset as usize > program.code.len() || f.start_offset > f.end_offset {
            return Err(bad(format!(
                "function '{}' spans {}..{} outside code of {} bytes",
                f.name,
                f.start_offset,
                f.end_offset,
                program.code.len()
            )));
        }
    }
    Ok(())
}

pub fn load_file(path: &Path) -> Result<Program, VmError> {
    let data = std::fs::read(path).map_err(|e| bad(format!("cannot read '{}': {}", path.display(), e)))?;
    read_program(&data)
}

pub fn save_file(program: &Program, path: &Path) -> Result<(), VmError> {
    std::fs::write(path, write_program(program))
        .map_err(|e| bad(format!("cannot write '{}': {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeWriter, Op};

    fn sample() -> Program {
        let mut w = BytecodeWriter::new();
        let k = w.constant(Value::I64(42));
        w.global("answer");
        w.begin_function("main", 0);
        w.emit1(Op::LoadConstant, k);
        w.emit(Op::Return);
        w.end_function();
        w.finish()
    }

    #[test]
    fn round_trips_a_program() {
        let p = sample();
        let image = write_program(&p);
        let q = read_program(&image).unwrap();
        assert_eq!(q.code, p.code);
        assert_eq!(q.global_count, 1);
        assert!(q.function_by_name("main").is_some());
        assert!(matches!(q.constants[0], Value::I64(42)));
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        assert!(matches!(
            read_program(b"NOPE\x01\x00\x00\x00"),
            Err(VmError::BadImage { .. })
        ));
        let mut image = write_program(&sample());
        image[4] = 9; // version
        assert!(matches!(read_program(&image), Err(VmError::BadImage { .. })));
    }

    #[test]
    fn rejects_truncated_sections() {
        let image = write_program(&sample());
        assert!(read_program(&image[..image.len() - 3]).is_err());
    }

    #[test]
    fn rejects_out_of_range_global_symbols() {
        let mut p = sample();
        p.symbols.insert(
            "rogue".into(),
            SymbolInfo {
                is_global: true,
                index: 99,
            },
        );
        let image = write_program(&p);
        assert!(matches!(read_program(&image), Err(VmError::BadImage { .. })));
    }
}
