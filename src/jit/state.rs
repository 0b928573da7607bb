//! Per-version code-generation state.
//!
//! Tracks, for every live IR value at the current emission point, a
//! concrete location (stack home, register, or compile-time immediate)
//! and an optional type fact. The same structure is the interning key
//! of block versions: two branches whose canonical states differ reach
//! different specialized versions of the successor block.
//!
//! Register allocation is single-pass first-free over the allocatable
//! caller-save set, with least-recently-used spilling when the set is
//! exhausted.

use std::collections::{HashMap, HashSet};

use crate::ir::{Const, IRArg, IRFunction, IRInstr, TypeTag, ValId};
use crate::runtime::layout::WORD_SIZE;

use super::codebuf::CodeBlock;
use super::x86_64::{regs, Asm, Reg};
use super::CodegenError;

/// Where a value's word lives right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLoc {
    /// The value's fixed stack home slot
    Stack,
    /// A general-purpose register
    Reg(Reg),
    /// A compile-time constant (word bit-pattern plus its tag)
    Imm(u64, TypeTag),
}

/// A concrete operand handed to the emitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Mem(Reg, i32),
    Imm(i64),
}

impl Operand {
    pub fn imm32(self) -> i32 {
        match self {
            Operand::Imm(v) => v as i32,
            _ => panic!("not an immediate operand"),
        }
    }
}

/// Word and tag of a plain constant argument.
pub fn const_word_tag(c: &Const) -> Result<(u64, TypeTag), CodegenError> {
    use crate::ir::const_words;
    match c {
        Const::Int32(n) => Ok((*n as i64 as u64, TypeTag::Int32)),
        Const::Float64(f) => Ok((f.to_bits(), TypeTag::Float64)),
        Const::Bool(true) => Ok((const_words::TRUE, TypeTag::Const)),
        Const::Bool(false) => Ok((const_words::FALSE, TypeTag::Const)),
        Const::Null => Ok((const_words::NULL, TypeTag::Const)),
        Const::Undef => Ok((const_words::UNDEF, TypeTag::Const)),
        Const::Str(_) | Const::Fun(_) | Const::Link(_) => Err(CodegenError::MalformedIr(
            "constant kind requires a dedicated lowering".to_string(),
        )),
    }
}

fn imm_fits(word: u64, size_bits: u8) -> bool {
    if size_bits >= 64 {
        // 64-bit ALU immediates are sign-extended from 32 bits
        let v = word as i64;
        v >= i32::MIN as i64 && v <= i32::MAX as i64
    } else {
        true
    }
}

/// Canonical form of a state, used for version interning. Only
/// non-default entries of values live at the block entry are included,
/// in sorted order, so dead-value residues and scratch registers cannot
/// split versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    locs: Vec<(u32, LocKey)>,
    types: Vec<(u32, u8)>,
    /// Call continuations are distinct from plain branch targets of the
    /// same block and state: their prologue stores the return registers
    /// into this slot
    cont: Option<u16>,
}

impl StateKey {
    pub fn with_cont(mut self, slot: u16) -> StateKey {
        self.cont = Some(slot);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum LocKey {
    Reg(u8),
    Imm(u64, u8),
}

#[derive(Debug, Clone, Default)]
pub struct CodeGenState {
    locs: HashMap<ValId, ValueLoc>,
    types: HashMap<ValId, TypeTag>,
    reg_owner: HashMap<Reg, ValId>,
    /// Allocation clock for LRU spilling
    clock: u64,
    reg_age: HashMap<Reg, u64>,
}

impl CodeGenState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current location of a value. Absent entries mean the stack home.
    pub fn loc(&self, v: ValId) -> ValueLoc {
        self.locs.get(&v).copied().unwrap_or(ValueLoc::Stack)
    }

    /// Statically known type of a value, if any.
    pub fn known_type(&self, v: ValId) -> Option<TypeTag> {
        self.types.get(&v).copied()
    }

    /// Refine the type of a value along a type-specialized branch.
    pub fn set_type(&mut self, v: ValId, tag: TypeTag) {
        self.types.insert(v, tag);
    }

    /// Record a compile-time constant location for a value.
    pub fn set_loc_imm(&mut self, v: ValId, word: u64, tag: TypeTag) {
        if let Some(ValueLoc::Reg(old)) = self.locs.get(&v) {
            let old = *old;
            self.reg_owner.remove(&old);
        }
        self.locs.insert(v, ValueLoc::Imm(word, tag));
        self.types.insert(v, tag);
    }

    /// Demote a value to its stack home without emitting anything.
    pub fn map_to_stack(&mut self, v: ValId) {
        if let ValueLoc::Reg(r) = self.loc(v) {
            self.reg_owner.remove(&r);
        }
        self.locs.insert(v, ValueLoc::Stack);
    }

    /// Forget all register assignments: every register-resident value
    /// falls back to its stack home. Used after calls, which clobber
    /// the whole allocatable set; live values must have been spilled.
    pub fn clobber_regs(&mut self) {
        let owners: Vec<ValId> = self.reg_owner.values().copied().collect();
        self.reg_owner.clear();
        for v in owners {
            self.locs.insert(v, ValueLoc::Stack);
        }
    }

    fn touch(&mut self, r: Reg) {
        self.clock += 1;
        self.reg_age.insert(r, self.clock);
    }

    fn is_allocatable(r: Reg) -> bool {
        regs::ALLOC_REGS.contains(&r)
    }

    fn claim(&mut self, v: ValId, r: Reg) {
        debug_assert!(Self::is_allocatable(r));
        debug_assert!(!self.reg_owner.contains_key(&r), "register already owned");
        self.locs.insert(v, ValueLoc::Reg(r));
        self.reg_owner.insert(r, v);
        self.touch(r);
    }

    /// Registers whose owner is one of `instr`'s value arguments.
    fn arg_regs(&self, instr: &IRInstr) -> Vec<Reg> {
        let mut out = Vec::new();
        for arg in &instr.args {
            if let IRArg::Val(v) = arg {
                if let ValueLoc::Reg(r) = self.loc(*v) {
                    out.push(r);
                }
            }
        }
        out
    }

    // ==================== Operand access ====================

    /// Concrete operand for the word of argument `idx`, readable at
    /// `size_bits`. Constants come back as immediates when `allow_imm`
    /// and the encoding permits; stack-resident values are loaded into
    /// `pref` without claiming it.
    pub fn get_word_opnd(
        &mut self,
        cb: &mut CodeBlock,
        fun: &IRFunction,
        instr: &IRInstr,
        idx: usize,
        size_bits: u8,
        pref: Reg,
        allow_imm: bool,
    ) -> Result<Operand, CodegenError> {
        let arg = instr.args.get(idx).ok_or_else(|| {
            CodegenError::MalformedIr(format!("{:?}: missing argument {}", instr.op, idx))
        })?;

        let word = match arg {
            IRArg::Const(c) => const_word_tag(c)?.0,
            IRArg::Val(v) => match self.loc(*v) {
                ValueLoc::Reg(r) => {
                    self.touch(r);
                    return Ok(Operand::Reg(r));
                }
                ValueLoc::Imm(w, _) => w,
                ValueLoc::Stack => {
                    let slot = fun.home_slot(*v) as i32;
                    let mut asm = Asm::new(cb);
                    if size_bits == 64 {
                        asm.mov_rm(pref, regs::WSP, slot * WORD_SIZE);
                    } else {
                        asm.mov_rm32(pref, regs::WSP, slot * WORD_SIZE);
                    }
                    return Ok(Operand::Reg(pref));
                }
            },
        };

        if allow_imm && imm_fits(word, size_bits) {
            return Ok(Operand::Imm(word as i64));
        }
        let mut asm = Asm::new(cb);
        asm.mov_ri64(pref, word as i64);
        Ok(Operand::Reg(pref))
    }

    /// Concrete operand for the 8-bit type tag of argument `idx`. A
    /// statically known tag comes back as an immediate without any
    /// load.
    pub fn get_type_opnd(
        &mut self,
        cb: &mut CodeBlock,
        fun: &IRFunction,
        instr: &IRInstr,
        idx: usize,
        pref: Reg,
    ) -> Result<Operand, CodegenError> {
        let arg = instr.args.get(idx).ok_or_else(|| {
            CodegenError::MalformedIr(format!("{:?}: missing argument {}", instr.op, idx))
        })?;

        match arg {
            IRArg::Const(c) => Ok(Operand::Imm(const_word_tag(c)?.1 as i64)),
            IRArg::Val(v) => {
                if let Some(t) = self.known_type(*v) {
                    return Ok(Operand::Imm(t as i64));
                }
                if let ValueLoc::Imm(_, t) = self.loc(*v) {
                    return Ok(Operand::Imm(t as i64));
                }
                let slot = fun.home_slot(*v) as i32;
                let mut asm = Asm::new(cb);
                asm.movzx_rm8(pref, regs::TSP, slot);
                Ok(Operand::Reg(pref))
            }
        }
    }

    /// Choose where `instr`'s result is written: a preferred register
    /// if free, a dying input register when `allow_reuse`, any free
    /// allocatable register, an LRU-spilled one, or the stack home as
    /// the last resort.
    pub fn get_out_opnd(
        &mut self,
        cb: &mut CodeBlock,
        fun: &IRFunction,
        instr: &IRInstr,
        live_after: &HashSet<ValId>,
        allow_reuse: bool,
        pref: Option<Reg>,
        avoid: &[Reg],
    ) -> Operand {
        debug_assert!(instr.op.has_output());
        let out = instr.out;

        // Slot variables (loop-carried moves) redefine an existing
        // value: release its old register first
        if let Some(ValueLoc::Reg(old)) = self.locs.get(&out) {
            let old = *old;
            self.reg_owner.remove(&old);
            self.locs.remove(&out);
        }
        self.types.remove(&out);

        if let Some(p) = pref {
            if Self::is_allocatable(p) && !self.reg_owner.contains_key(&p) && !avoid.contains(&p) {
                self.claim(out, p);
                return Operand::Reg(p);
            }
        }

        if allow_reuse {
            for arg in &instr.args {
                if let IRArg::Val(v) = arg {
                    if live_after.contains(v) {
                        continue;
                    }
                    if let ValueLoc::Reg(r) = self.loc(*v) {
                        if Self::is_allocatable(r) && !avoid.contains(&r) {
                            self.reg_owner.remove(&r);
                            self.locs.remove(v);
                            self.claim(out, r);
                            return Operand::Reg(r);
                        }
                    }
                }
            }
        }

        for r in regs::ALLOC_REGS {
            if !self.reg_owner.contains_key(&r) && !avoid.contains(&r) {
                self.claim(out, r);
                return Operand::Reg(r);
            }
        }

        // Spill the least recently used register that holds neither an
        // argument of this instruction nor a value we must avoid.
        let arg_regs = self.arg_regs(instr);
        let victim = regs::ALLOC_REGS
            .iter()
            .filter(|r| !avoid.contains(r) && !arg_regs.contains(r))
            .min_by_key(|r| self.reg_age.get(r).copied().unwrap_or(0))
            .copied();
        if let Some(r) = victim {
            self.spill_reg(cb, fun, r);
            self.claim(out, r);
            return Operand::Reg(r);
        }

        self.locs.insert(out, ValueLoc::Stack);
        Operand::Mem(regs::WSP, fun.home_slot(out) as i32 * WORD_SIZE)
    }

    /// Record the result's type as a statically known tag. The type
    /// byte in the frame is written lazily, at spill time.
    pub fn set_out_type(&mut self, instr: &IRInstr, tag: TypeTag) {
        self.types.insert(instr.out, tag);
    }

    /// Record the result's type from a register holding the tag byte:
    /// the byte is stored to the type-stack home now and the static
    /// type becomes unknown.
    pub fn set_out_type_reg(
        &mut self,
        cb: &mut CodeBlock,
        fun: &IRFunction,
        instr: &IRInstr,
        tag_reg: Reg,
    ) {
        let slot = fun.home_slot(instr.out) as i32;
        let mut asm = Asm::new(cb);
        asm.mov_mr8(regs::TSP, slot, tag_reg);
        self.types.remove(&instr.out);
    }

    // ==================== Spilling ====================

    /// Write the value owning `reg` back to its stack home and demote
    /// its location. The type byte is written when the tag is
    /// statically known; otherwise the home byte is already current.
    pub fn spill_reg(&mut self, cb: &mut CodeBlock, fun: &IRFunction, reg: Reg) {
        let Some(v) = self.reg_owner.remove(&reg) else {
            return;
        };
        let slot = fun.home_slot(v) as i32;
        let mut asm = Asm::new(cb);
        asm.mov_mr(regs::WSP, slot * WORD_SIZE, reg);
        if let Some(t) = self.types.get(&v) {
            asm.mov_mi8(regs::TSP, slot, *t as u8);
        }
        self.locs.insert(v, ValueLoc::Stack);
    }

    /// Materialize one value into its stack home (word and type byte),
    /// whatever its current location.
    pub fn spill_value(&mut self, cb: &mut CodeBlock, fun: &IRFunction, v: ValId) {
        match self.loc(v) {
            ValueLoc::Reg(r) => self.spill_reg(cb, fun, r),
            ValueLoc::Imm(word, tag) => {
                let slot = fun.home_slot(v) as i32;
                let mut asm = Asm::new(cb);
                asm.mov_ri64(regs::SCR2, word as i64);
                asm.mov_mr(regs::WSP, slot * WORD_SIZE, regs::SCR2);
                asm.mov_mi8(regs::TSP, slot, tag as u8);
                self.locs.insert(v, ValueLoc::Stack);
            }
            ValueLoc::Stack => {
                if let Some(t) = self.types.get(&v) {
                    let slot = fun.home_slot(v) as i32;
                    let mut asm = Asm::new(cb);
                    asm.mov_mi8(regs::TSP, slot, *t as u8);
                }
            }
        }
    }

    /// Spill every value matching the predicate. Run before host calls
    /// and GC safepoints so the frame is a valid root set.
    pub fn spill_values(
        &mut self,
        cb: &mut CodeBlock,
        fun: &IRFunction,
        pred: impl Fn(ValId) -> bool,
    ) {
        let mut vals: Vec<ValId> = self
            .locs
            .keys()
            .chain(self.types.keys())
            .copied()
            .collect();
        vals.sort();
        vals.dedup();
        for v in vals {
            if pred(v) {
                self.spill_value(cb, fun, v);
            }
        }
    }

    /// A register holding no value live across `instr`, spilling the
    /// least recently used if necessary.
    pub fn free_reg(
        &mut self,
        cb: &mut CodeBlock,
        fun: &IRFunction,
        instr: &IRInstr,
        live: &HashSet<ValId>,
        avoid: &[Reg],
    ) -> Reg {
        for r in regs::ALLOC_REGS {
            if !avoid.contains(&r) && !self.reg_owner.contains_key(&r) {
                self.touch(r);
                return r;
            }
        }
        // Reclaim a register owned by a dead value
        for r in regs::ALLOC_REGS {
            if avoid.contains(&r) {
                continue;
            }
            if let Some(v) = self.reg_owner.get(&r) {
                if !live.contains(v) {
                    let v = *v;
                    self.reg_owner.remove(&r);
                    self.locs.insert(v, ValueLoc::Stack);
                    self.touch(r);
                    return r;
                }
            }
        }
        let arg_regs = self.arg_regs(instr);
        let victim = regs::ALLOC_REGS
            .iter()
            .filter(|r| !avoid.contains(r) && !arg_regs.contains(r))
            .min_by_key(|r| self.reg_age.get(r).copied().unwrap_or(0))
            .copied()
            .expect("no spillable register");
        self.spill_reg(cb, fun, victim);
        self.touch(victim);
        victim
    }

    // ==================== Canonicalization ====================

    /// Restrict the state to values live at a successor entry.
    pub fn filtered(&self, live: &HashSet<ValId>) -> CodeGenState {
        let locs: HashMap<ValId, ValueLoc> = self
            .locs
            .iter()
            .filter(|(v, _)| live.contains(v))
            .map(|(v, l)| (*v, *l))
            .collect();
        let types = self
            .types
            .iter()
            .filter(|(v, _)| live.contains(v))
            .map(|(v, t)| (*v, *t))
            .collect();
        let reg_owner = self
            .reg_owner
            .iter()
            .filter(|(_, v)| live.contains(v))
            .map(|(r, v)| (*r, *v))
            .collect();
        CodeGenState {
            locs,
            types,
            reg_owner,
            clock: 0,
            reg_age: HashMap::new(),
        }
    }

    /// Canonical interning key over the values live at the block entry.
    pub fn canonical_key(&self, live_in: &HashSet<ValId>) -> StateKey {
        let mut locs: Vec<(u32, LocKey)> = self
            .locs
            .iter()
            .filter(|(v, _)| live_in.contains(v))
            .filter_map(|(v, l)| match l {
                ValueLoc::Stack => None,
                ValueLoc::Reg(r) => Some((v.0, LocKey::Reg(*r as u8))),
                ValueLoc::Imm(w, t) => Some((v.0, LocKey::Imm(*w, *t as u8))),
            })
            .collect();
        locs.sort();

        let mut types: Vec<(u32, u8)> = self
            .types
            .iter()
            .filter(|(v, _)| live_in.contains(v))
            .map(|(v, t)| (v.0, *t as u8))
            .collect();
        types.sort();

        StateKey {
            locs,
            types,
            cont: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Opcode};

    fn test_fun() -> IRFunction {
        let mut b = FunctionBuilder::new("f", 2);
        let p0 = b.param(0);
        let p1 = b.param(1);
        let v = b.emit(Opcode::AddI32, vec![p0.into(), p1.into()]);
        b.emit(Opcode::Ret, vec![v.into()]);
        b.finish()
    }

    fn cb() -> CodeBlock {
        CodeBlock::new(1 << 16).unwrap()
    }

    #[test]
    fn test_default_loc_is_stack() {
        let st = CodeGenState::new();
        assert_eq!(st.loc(ValId(0)), ValueLoc::Stack);
        assert_eq!(st.known_type(ValId(0)), None);
    }

    #[test]
    fn test_const_operand_as_imm() {
        let fun = test_fun();
        let mut st = CodeGenState::new();
        let mut code = cb();
        let instr = &fun.block(fun.entry).instrs[0];
        // p1 position replaced by looking at a const-free fetch: build
        // a const instr instead
        let mut b = FunctionBuilder::new("g", 0);
        let v = b.emit(Opcode::AddI32, vec![5.into(), 7.into()]);
        b.emit(Opcode::Ret, vec![v.into()]);
        let g = b.finish();
        let gi = &g.block(g.entry).instrs[0];

        let before = code.pos();
        let o = st
            .get_word_opnd(&mut code, &g, gi, 0, 32, regs::SCR0, true)
            .unwrap();
        assert_eq!(o, Operand::Imm(5));
        // No code emitted for an immediate
        assert_eq!(code.pos(), before);
        let _ = instr;
        let _ = &fun;
    }

    #[test]
    fn test_stack_operand_loads_into_pref() {
        let fun = test_fun();
        let mut st = CodeGenState::new();
        let mut code = cb();
        let instr = &fun.block(fun.entry).instrs[0];

        let o = st
            .get_word_opnd(&mut code, &fun, instr, 0, 32, regs::SCR0, true)
            .unwrap();
        assert_eq!(o, Operand::Reg(regs::SCR0));
        assert!(code.pos() > 0);
        // The load is transient: the value still lives on the stack
        assert_eq!(st.loc(ValId(0)), ValueLoc::Stack);
    }

    #[test]
    fn test_known_type_operand_is_imm_and_emits_nothing() {
        let fun = test_fun();
        let mut st = CodeGenState::new();
        let mut code = cb();
        let instr = &fun.block(fun.entry).instrs[0];

        st.set_type(ValId(0), TypeTag::Int32);
        let before = code.pos();
        let o = st
            .get_type_opnd(&mut code, &fun, instr, 0, regs::SCR0)
            .unwrap();
        assert_eq!(o, Operand::Imm(TypeTag::Int32 as i64));
        assert_eq!(code.pos(), before);
    }

    #[test]
    fn test_out_claims_first_free_register() {
        let fun = test_fun();
        let mut st = CodeGenState::new();
        let mut code = cb();
        let instr = &fun.block(fun.entry).instrs[0];
        let live = HashSet::new();

        let o = st.get_out_opnd(&mut code, &fun, instr, &live, false, None, &[]);
        assert_eq!(o, Operand::Reg(regs::ALLOC_REGS[0]));
        assert_eq!(st.loc(instr.out), ValueLoc::Reg(regs::ALLOC_REGS[0]));
    }

    #[test]
    fn test_location_uniqueness_under_pressure() {
        // Claim every allocatable register, then one more: the LRU one
        // is spilled and no two values share a register.
        let mut b = FunctionBuilder::new("f", 0);
        let mut outs = Vec::new();
        for _ in 0..regs::ALLOC_REGS.len() + 1 {
            outs.push(b.emit(Opcode::MakeLink, vec![]));
        }
        let last = *outs.last().unwrap();
        b.emit(Opcode::Ret, vec![last.into()]);
        let fun = b.finish();

        let mut st = CodeGenState::new();
        let mut code = cb();
        let live: HashSet<ValId> = outs.iter().copied().collect();
        for instr in &fun.block(fun.entry).instrs[..outs.len()] {
            st.get_out_opnd(&mut code, &fun, instr, &live, false, None, &[]);
        }

        let mut seen = HashSet::new();
        for v in &outs {
            if let ValueLoc::Reg(r) = st.loc(*v) {
                assert!(seen.insert(r), "two live values share {:?}", r);
            }
        }
        // Exactly one value was demoted to its home
        let on_stack = outs
            .iter()
            .filter(|v| st.loc(**v) == ValueLoc::Stack)
            .count();
        assert_eq!(on_stack, 1);
    }

    #[test]
    fn test_spill_writes_known_type_byte() {
        let fun = test_fun();
        let mut st = CodeGenState::new();
        let mut code = cb();
        let instr = &fun.block(fun.entry).instrs[0];
        let live = HashSet::new();

        let o = st.get_out_opnd(&mut code, &fun, instr, &live, false, None, &[]);
        st.set_out_type(instr, TypeTag::Int32);
        let Operand::Reg(r) = o else { panic!() };

        let before = code.pos();
        st.spill_reg(&mut code, &fun, r);
        // A word store plus a type-byte store
        assert!(code.pos() > before + 4);
        assert_eq!(st.loc(instr.out), ValueLoc::Stack);
        // The type fact survives the spill
        assert_eq!(st.known_type(instr.out), Some(TypeTag::Int32));
    }

    #[test]
    fn test_canonical_key_ignores_dead_values() {
        let fun = test_fun();
        let mut st1 = CodeGenState::new();
        let st2 = CodeGenState::new();
        let mut code = cb();
        let instr = &fun.block(fun.entry).instrs[0];
        let live_none = HashSet::new();

        // st1 has a dead value in a register; st2 is empty
        st1.get_out_opnd(&mut code, &fun, instr, &live_none, false, None, &[]);
        st1.set_out_type(instr, TypeTag::Int32);

        let live_in: HashSet<ValId> = [ValId(0), ValId(1)].into_iter().collect();
        assert_eq!(st1.canonical_key(&live_in), st2.canonical_key(&live_in));
    }

    #[test]
    fn test_canonical_key_distinguishes_types() {
        let st1 = {
            let mut s = CodeGenState::new();
            s.set_type(ValId(0), TypeTag::Int32);
            s
        };
        let st2 = CodeGenState::new();
        let live_in: HashSet<ValId> = [ValId(0)].into_iter().collect();
        assert_ne!(st1.canonical_key(&live_in), st2.canonical_key(&live_in));
    }

    #[test]
    fn test_clobber_regs_demotes_everything() {
        let fun = test_fun();
        let mut st = CodeGenState::new();
        let mut code = cb();
        let instr = &fun.block(fun.entry).instrs[0];
        st.get_out_opnd(&mut code, &fun, instr, &HashSet::new(), false, None, &[]);

        st.clobber_regs();
        assert_eq!(st.loc(instr.out), ValueLoc::Stack);
    }

    #[test]
    fn test_imm_spill_materializes_word_and_tag() {
        let fun = test_fun();
        let mut st = CodeGenState::new();
        let mut code = cb();

        st.set_loc_imm(ValId(0), 42, TypeTag::Int32);
        st.spill_value(&mut code, &fun, ValId(0));
        assert_eq!(st.loc(ValId(0)), ValueLoc::Stack);
        assert!(code.pos() > 0);
    }
}
