/// Ouroboros error types.
///
/// The engine has exactly one fault type, `VmError`. Program-level exceptions
/// are ordinary `Value::Exception` objects travelling through the unwinder;
/// a `VmError` raised mid-step is converted into such an object at the raise
/// site, so Rust errors never double as script control flow. The backend has
/// its own `BackendError` because its failures (verification, external
/// tools) are fatal to module emission rather than catchable by programs.
use thiserror::Error;

use crate::core::value::Value;

#[derive(Debug, Clone, Error)]
pub enum VmError {
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("division by zero")]
    DivideByZero,

    #[error("null reference: member '{member}' accessed on null")]
    NullReference { member: String },

    #[error("unresolved function '{name}'")]
    UnresolvedFunction { name: String },

    #[error("unresolved member '{member}' on type '{type_name}'")]
    UnresolvedMember { type_name: String, member: String },

    #[error("unknown opcode {value:#04x} at offset {offset}")]
    UnknownOpcode { value: u8, offset: usize },

    #[error("operand stack underflow in {opcode}")]
    StackUnderflow { opcode: &'static str },

    #[error("rethrow outside of a catch handler")]
    InvalidRethrow,

    #[error("cannot cast {from} to {to}")]
    CastError { from: String, to: String },

    #[error("execution cancelled")]
    Cancelled,

    #[error("host call '{name}' failed: {message}")]
    HostCallError { name: String, message: String },

    #[error("'{name}' expects {expected} arguments, got {found}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("index {index} out of range for length {length}")]
    IndexOutOfRange { index: i64, length: usize },

    #[error("call depth limit of {limit} frames exceeded")]
    CallDepthExceeded { limit: usize },

    #[error("malformed bytecode image: {message}")]
    BadImage { message: String },

    #[error("uncaught exception: {0}")]
    Uncaught(Value),
}

impl VmError {
    /// Short kind tag used as the exception object's type name when a fault
    /// is surfaced to the running program.
    pub fn kind(&self) -> &'static str {
        match self {
            VmError::TypeMismatch { .. } => "TypeMismatch",
            VmError::DivideByZero => "DivideByZero",
            VmError::NullReference { .. } => "NullReference",
            VmError::UnresolvedFunction { .. } => "UnresolvedFunction",
            VmError::UnresolvedMember { .. } => "UnresolvedMember",
            VmError::UnknownOpcode { .. } => "UnknownOpcode",
            VmError::StackUnderflow { .. } => "StackUnderflow",
            VmError::InvalidRethrow => "InvalidRethrow",
            VmError::CastError { .. } => "CastError",
            VmError::Cancelled => "Cancelled",
            VmError::HostCallError { .. } => "HostCallError",
            VmError::ArityMismatch { .. } => "ArityMismatch",
            VmError::IndexOutOfRange { .. } => "IndexOutOfRange",
            VmError::CallDepthExceeded { .. } => "CallDepthExceeded",
            VmError::BadImage { .. } => "BadImage",
            VmError::Uncaught(_) => "Uncaught",
        }
    }

}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("module verification failed in '{function}': {reason}")]
    ModuleVerificationFailed { function: String, reason: String },

    #[error("cannot lower '{function}' natively: {what}")]
    Unsupported { function: String, what: String },

    #[error("{tool} failed: {message}")]
    LinkerFailed { tool: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Process exit codes for the standalone driver.
pub const EXIT_OK: i32 = 0;
pub const EXIT_UNCAUGHT: i32 = 1;
pub const EXIT_VERIFY: i32 = 2;
pub const EXIT_LINK: i32 = 3;

impl BackendError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BackendError::ModuleVerificationFailed { .. } => EXIT_VERIFY,
            BackendError::Unsupported { .. } => EXIT_VERIFY,
            BackendError::LinkerFailed { .. } => EXIT_LINK,
            BackendError::Io(_) => EXIT_LINK,
        }
    }
}
