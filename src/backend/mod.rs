/// IR backend: lowers compiled bytecode to an SSA-form module, optimizes it
/// per the requested level, verifies it, and emits it in the format the
/// destination extension selects.
pub mod emit;
pub mod ir;
pub mod lower;
pub mod passes;
pub mod verify;

use std::path::Path;

use crate::bytecode::Program;
use crate::errors::BackendError;

/// Full compilation: lower, optimize, verify, emit. The emission format is
/// chosen from `dest`'s extension (`.ll`, `.bc`, `.s`/`.asm`, `.o`/`.obj`;
/// anything else defaults to an object file and renames the output).
pub fn compile_program(
    program: &Program,
    module_name: &str,
    dest: &Path,
    opt_level: u8,
) -> Result<std::path::PathBuf, BackendError> {
    let mut module = lower::lower_program(program, module_name)?;
    passes::run(&mut module, opt_level);
    verify::verify_module(&module)?;
    emit::emit_module(&module, dest)
}
