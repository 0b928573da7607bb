//! Intermediate representation consumed by the JIT.
//!
//! The IR is a linear single-assignment form: functions hold blocks,
//! blocks hold instructions, and every instruction produces at most one
//! value with a fixed home slot in the callee's stack frame. The builder
//! that produces it from source syntax is an external collaborator; this
//! module only defines the data model and the liveness query the code
//! generator needs.

mod instr;
mod liveness;
mod types;

pub use instr::{
    BlockId, Const, FunId, FunctionBuilder, IRArg, IRBlock, IRFunction, IRInstr, LinkSlot, Opcode,
    ValId,
};
pub use liveness::Liveness;
pub use types::{const_words, TypeTag, Word};
