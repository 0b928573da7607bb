//! JIT compilation core.
//!
//! The pieces, bottom up: executable memory (`memory`), the code block
//! with labels and patchable references (`codebuf`), the x86-64 encoder
//! (`x86_64`), the per-version code-generation state (`state`), the
//! block-version table (`versions`), the per-opcode generators
//! (`lower`, `lower_call`, `ffi`), and the driver that ties them
//! together (`compiler`).

mod codebuf;
mod ffi;
mod lower;
mod lower_call;
mod memory;
mod state;
mod versions;
pub mod x86_64;

pub mod compiler;

pub use codebuf::{CodeBlock, Label};
pub use compiler::{Codegen, TypeHints};
pub use memory::{ExecMem, MemoryError};
pub use ffi::{FfiSig, FfiType};
pub use state::{CodeGenState, Operand, StateKey, ValueLoc};
pub use versions::{BlockVersion, BranchShape, VersionId, VersionTable};

use std::fmt;

/// Errors surfaced by the code generator. Buffer exhaustion and IR
/// well-formedness violations are fatal to the embedding VM; the error
/// is reported so the process can abort with context.
#[derive(Debug)]
pub enum CodegenError {
    /// The executable code heap is exhausted
    BufferOverflow,
    /// The link table is exhausted
    LinkTableFull,
    /// The IR violates a structural contract (missing target, arity
    /// mismatch on a primitive call, unsupported argument, bad FFI
    /// signature). These are IR-builder bugs, not user input.
    MalformedIr(String),
    /// Executable memory could not be mapped
    Memory(MemoryError),
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::BufferOverflow => write!(f, "code heap exhausted"),
            CodegenError::LinkTableFull => write!(f, "link table exhausted"),
            CodegenError::MalformedIr(msg) => write!(f, "malformed IR: {}", msg),
            CodegenError::Memory(e) => write!(f, "memory error: {}", e),
        }
    }
}

impl std::error::Error for CodegenError {}

impl From<MemoryError> for CodegenError {
    fn from(e: MemoryError) -> Self {
        CodegenError::Memory(e)
    }
}
