//! Host-side runtime bridge.
//!
//! Everything emitted code shares with the host lives here: the
//! `#[repr(C)]` VM context with its host-function table, the ABI layout
//! constants for frames and heap records, the link table, the
//! function-entry table used for indirect calls, and the shadow stacks
//! a host uses to enter compiled code.

pub mod context;
pub mod funtable;
pub mod layout;
pub mod linktable;
pub mod pcache;
pub mod stacks;

pub use context::{ReturnPair, TaggedVal, VmContext};
pub use funtable::{FunEntry, FunEntryTable};
pub use linktable::LinkTable;
pub use pcache::PropCache;
pub use stacks::ShadowStacks;
