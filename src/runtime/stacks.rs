//! Shadow stacks used to enter compiled code.
//!
//! The VM owns a word stack and a parallel type stack. Frames grow
//! toward lower addresses, so entering a unit function means pointing
//! the stack registers at `end - frame_slots` of each array.

use crate::ir::TypeTag;

use super::context::TaggedVal;

pub struct ShadowStacks {
    words: Vec<u64>,
    types: Vec<u8>,
}

impl ShadowStacks {
    pub fn new(slots: usize) -> Self {
        Self {
            words: vec![0; slots],
            types: vec![TypeTag::Const as u8; slots],
        }
    }

    pub fn slots(&self) -> usize {
        self.words.len()
    }

    /// Stack pointers for a frame of `frame_slots` at the top of the
    /// stacks.
    pub fn frame_base(&mut self, frame_slots: usize) -> (*mut u64, *mut u8) {
        assert!(frame_slots <= self.words.len(), "stack overflow");
        let base = self.words.len() - frame_slots;
        unsafe {
            (
                self.words.as_mut_ptr().add(base),
                self.types.as_mut_ptr().add(base),
            )
        }
    }

    /// Read the tagged value in slot `slot` of a frame of `frame_slots`.
    pub fn read_slot(&self, frame_slots: usize, slot: usize) -> (u64, u8) {
        let base = self.words.len() - frame_slots;
        (self.words[base + slot], self.types[base + slot])
    }

    /// Write a tagged value into slot `slot` of a frame of
    /// `frame_slots`.
    pub fn write_slot(&mut self, frame_slots: usize, slot: usize, val: TaggedVal) {
        let base = self.words.len() - frame_slots;
        self.words[base + slot] = val.word;
        self.types[base + slot] = val.tag as u8;
    }

    /// Write a raw (word, tag-byte) pair into a frame slot.
    pub fn write_slot_raw(&mut self, frame_slots: usize, slot: usize, word: u64, tag: u8) {
        let base = self.words.len() - frame_slots;
        self.words[base + slot] = word;
        self.types[base + slot] = tag;
    }
}
