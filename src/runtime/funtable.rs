//! Function-entry records for indirect calls.
//!
//! Every IR function has a `FunEntry` record whose address is stable for
//! the life of the process: closures embed a pointer to it, and dynamic
//! call sites read the entry code, parameter count and frame size from
//! it at run time. `entry_code` initially points at a per-function
//! compile stub and is overwritten when the entry version is realized.

use std::mem::offset_of;

/// One function's runtime-visible record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FunEntry {
    /// Address of the compiled entry (or the compile stub)
    pub entry_code: u64,
    /// Formal parameter count
    pub num_params: u32,
    /// Frame size in slots (header + formals + temps)
    pub frame_slots: u32,
}

pub const FUN_ENTRY_CODE_OFS: i32 = offset_of!(FunEntry, entry_code) as i32;
pub const FUN_NUM_PARAMS_OFS: i32 = offset_of!(FunEntry, num_params) as i32;
pub const FUN_FRAME_SLOTS_OFS: i32 = offset_of!(FunEntry, frame_slots) as i32;

/// Fixed-capacity table of `FunEntry` records.
pub struct FunEntryTable {
    entries: Box<[FunEntry]>,
    used: usize,
}

impl FunEntryTable {
    pub fn new(max_funs: usize) -> Self {
        Self {
            entries: vec![
                FunEntry {
                    entry_code: 0,
                    num_params: 0,
                    frame_slots: 0,
                };
                max_funs
            ]
            .into_boxed_slice(),
            used: 0,
        }
    }

    /// Register a function's metadata; returns its index.
    pub fn push(&mut self, num_params: u32, frame_slots: u32) -> usize {
        let idx = self.used;
        assert!(idx < self.entries.len(), "function table exhausted");
        self.entries[idx].num_params = num_params;
        self.entries[idx].frame_slots = frame_slots;
        self.used += 1;
        idx
    }

    /// Install the entry code address once compiled (or its stub).
    pub fn set_entry(&mut self, idx: usize, entry_code: u64) {
        self.entries[idx].entry_code = entry_code;
    }

    pub fn entry(&self, idx: usize) -> &FunEntry {
        &self.entries[idx]
    }

    /// Stable address of a record, embedded in closures and call sites.
    pub fn entry_ptr(&self, idx: usize) -> *const FunEntry {
        &self.entries[idx] as *const FunEntry
    }
}
