//! Liveness analysis over IR functions.
//!
//! The code generator needs two queries: which values are live on entry
//! to a block (for state canonicalization), and which values are live
//! across a given instruction (for register reuse and spill predicates).
//! Both are computed once per function by a standard backward fixpoint.

use std::collections::HashSet;

use super::instr::{IRArg, IRFunction};
use super::ValId;

/// Precomputed liveness facts for one function.
pub struct Liveness {
    /// Values live on entry to each block
    live_in: Vec<HashSet<ValId>>,
    /// Per block, per instruction index: values live after the instruction
    live_after: Vec<Vec<HashSet<ValId>>>,
}

impl Liveness {
    pub fn analyze(fun: &IRFunction) -> Liveness {
        let n = fun.blocks.len();
        let mut live_in: Vec<HashSet<ValId>> = vec![HashSet::new(); n];
        let mut live_out: Vec<HashSet<ValId>> = vec![HashSet::new(); n];

        // Iterate to a fixpoint over the block graph
        let mut changed = true;
        while changed {
            changed = false;
            for b in (0..n).rev() {
                let mut out = HashSet::new();
                for instr in &fun.blocks[b].instrs {
                    for t in instr.targets.iter().flatten() {
                        for v in &live_in[t.0 as usize] {
                            out.insert(*v);
                        }
                    }
                }

                let mut live = out.clone();
                for instr in fun.blocks[b].instrs.iter().rev() {
                    if instr.op.has_output() {
                        live.remove(&instr.out);
                    }
                    for arg in &instr.args {
                        if let IRArg::Val(v) = arg {
                            live.insert(*v);
                        }
                    }
                }

                if live != live_in[b] {
                    live_in[b] = live;
                    changed = true;
                }
                live_out[b] = out;
            }
        }

        // Within each block, record the live-after set of every instruction
        let mut live_after = Vec::with_capacity(n);
        for b in 0..n {
            let count = fun.blocks[b].instrs.len();
            let mut per_instr = vec![HashSet::new(); count];
            let mut live = live_out[b].clone();
            for (i, instr) in fun.blocks[b].instrs.iter().enumerate().rev() {
                per_instr[i] = live.clone();
                if instr.op.has_output() {
                    live.remove(&instr.out);
                }
                for arg in &instr.args {
                    if let IRArg::Val(v) = arg {
                        live.insert(*v);
                    }
                }
            }
            live_after.push(per_instr);
        }

        Liveness {
            live_in,
            live_after,
        }
    }

    /// Values live on entry to `block`.
    pub fn block_live_in(&self, block: super::BlockId) -> &HashSet<ValId> {
        &self.live_in[block.0 as usize]
    }

    /// Values live after instruction `idx` of `block`.
    pub fn live_after(&self, block: super::BlockId, idx: usize) -> &HashSet<ValId> {
        &self.live_after[block.0 as usize][idx]
    }

    /// True if `v` is live after instruction `idx` of `block`.
    pub fn is_live_after(&self, block: super::BlockId, idx: usize, v: ValId) -> bool {
        self.live_after[block.0 as usize][idx].contains(&v)
    }
}
