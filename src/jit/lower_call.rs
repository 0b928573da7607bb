//! Per-opcode generators for calls, returns, exceptions, heap
//! allocation, closures and shape-based property access.
//!
//! All host-callable sites follow the same discipline: values live
//! across the site are spilled so the frame is a valid root set, the
//! reserved JIT registers are saved and the stack registers published
//! to the VM context, and on return the allocatable set is treated as
//! clobbered. Calls that transfer control away (throw, apply, eval)
//! skip the register bracket and instead reload the stack registers
//! the host installed before jumping to the returned code pointer.

use std::collections::HashSet;

use crate::ir::{Const, IRArg, IRInstr, Opcode, TypeTag, ValId};
use crate::runtime::context::ctx_ofs;
use crate::runtime::funtable::{FUN_ENTRY_CODE_OFS, FUN_FRAME_SLOTS_OFS, FUN_NUM_PARAMS_OFS};
use crate::runtime::layout::{
    clos_cell_ofs, ARGC_SLOT, CELL_TYPE_OFS, CELL_WORD_OFS, CLOS_FUN_OFS, CLOS_SLOT, HDR_SLOTS,
    OBJ_CAP_OFS, OBJ_NEXT_OFS, OBJ_SHAPE_OFS, OBJ_SLOTS_OFS, RA_SLOT, SHAPE_SLOT_OFS, THIS_SLOT,
    WORD_SIZE,
};
use crate::runtime::pcache::{PropCache, PCACHE_ENTRY_SIZE, PCACHE_IDX_OFS, PCACHE_WAYS};

use super::compiler::{Codegen, Flow, JitState};
use super::state::{CodeGenState, Operand};
use super::versions::VersionId;
use super::x86_64::{regs, Asm, Cond, Reg};
use super::CodegenError;

fn malformed(msg: impl Into<String>) -> CodegenError {
    CodegenError::MalformedIr(msg.into())
}

impl Codegen {
    /// Stable address of the instruction being lowered, passed to host
    /// helpers for diagnostics and unwinding.
    fn instr_ptr(jit: &JitState) -> *const IRInstr {
        &jit.fun.block(jit.block).instrs[jit.idx] as *const IRInstr
    }

    /// Values live before the instruction: everything live after it
    /// plus its own argument values.
    fn live_before(jit: &JitState, instr: &IRInstr) -> HashSet<ValId> {
        let mut set = jit.live.live_after(jit.block, jit.idx).clone();
        for arg in &instr.args {
            if let IRArg::Val(v) = arg {
                set.insert(*v);
            }
        }
        set
    }

    // ==================== Call continuations ====================

    /// Create the continuation branch of a call and, when the call has
    /// an exception successor, the exception branch. Both versions read
    /// the return-value registers into the call's out slot in their
    /// prologue; the exception edge is registered for the unwinder.
    fn gen_call_branch(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<(VersionId, Option<VersionId>), CodegenError> {
        let cont_block = instr.targets[0].ok_or_else(|| malformed("call without continuation"))?;

        // The callee clobbers every allocatable register; compile-time
        // immediates and type facts survive
        let mut st = jit.st.clone();
        st.clobber_regs();

        let cont = self.request_cont_version(jit.fun_id, cont_block, st.clone(), instr.out_slot);
        let exc = match instr.targets[1] {
            Some(h) => {
                let exc = self.request_cont_version(jit.fun_id, h, st, instr.out_slot);
                self.vt.register_handler(cont, exc);
                Some(exc)
            }
            None => None,
        };
        Ok((cont, exc))
    }

    // ==================== Direct primitive calls ====================

    /// Call a named host-installed primitive resolved at compile time.
    /// The arity must match exactly; the frame is fully static and the
    /// jump goes straight to the callee's entry version.
    pub(crate) fn gen_call_prim(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx).clone();

        let name = match instr.args.first() {
            Some(IRArg::Const(Const::Str(s))) => s.clone(),
            _ => return Err(malformed("call_prim needs a primitive name")),
        };
        let callee_fid = *self
            .prims
            .get(name.as_ref())
            .ok_or_else(|| malformed(format!("unknown primitive '{}'", name)))?;
        let callee = self.function(callee_fid).clone();

        let nargs = instr.args.len() - 1;
        if callee.num_params as usize != nargs {
            return Err(malformed(format!(
                "primitive '{}' takes {} arguments, got {}",
                name, callee.num_params, nargs
            )));
        }

        let total = callee.num_slots as i32;

        // Copy arguments into the callee's formal slots at negative
        // offsets of the current frame
        for i in 0..nargs {
            let slot = HDR_SLOTS as i32 + i as i32 - total;
            let w = jit
                .st
                .get_word_opnd(&mut self.cb, &fun, instr, 1 + i, 64, regs::SCR0, false)?;
            let wr = match w {
                Operand::Reg(r) => r,
                _ => unreachable!(),
            };
            {
                let mut asm = Asm::new(&mut self.cb);
                asm.mov_mr(regs::WSP, slot * WORD_SIZE, wr);
            }
            let t = jit
                .st
                .get_type_opnd(&mut self.cb, &fun, instr, 1 + i, regs::SCR1)?;
            let mut asm = Asm::new(&mut self.cb);
            match t {
                Operand::Imm(tag) => asm.mov_mi8(regs::TSP, slot, tag as u8),
                Operand::Reg(r) => asm.mov_mr8(regs::TSP, slot, r),
                _ => unreachable!(),
            }
        }

        // Hidden slots: closure and receiver are undefined for
        // primitives, argc is the static count
        {
            let mut asm = Asm::new(&mut self.cb);
            let undef = crate::ir::const_words::UNDEF as i32;
            asm.mov_ri32(regs::SCR0, undef);
            asm.mov_mr(regs::WSP, (CLOS_SLOT as i32 - total) * WORD_SIZE, regs::SCR0);
            asm.mov_mi8(regs::TSP, CLOS_SLOT as i32 - total, TypeTag::Const as u8);
            asm.mov_mr(regs::WSP, (THIS_SLOT as i32 - total) * WORD_SIZE, regs::SCR0);
            asm.mov_mi8(regs::TSP, THIS_SLOT as i32 - total, TypeTag::Const as u8);
            asm.mov_ri32(regs::SCR0, nargs as i32);
            asm.mov_mr(regs::WSP, (ARGC_SLOT as i32 - total) * WORD_SIZE, regs::SCR0);
            asm.mov_mi8(regs::TSP, ARGC_SLOT as i32 - total, TypeTag::Int32 as u8);
        }

        // Everything live after the call goes to its home
        jit.st
            .spill_values(&mut self.cb, &fun, |v| la.contains(&v));

        let (cont, _exc) = self.gen_call_branch(jit, instr)?;

        // Return address, then commit the new frame and jump
        self.emit_code_addr(regs::SCR0, cont);
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_mr(regs::WSP, (RA_SLOT as i32 - total) * WORD_SIZE, regs::SCR0);
            asm.mov_mi8(regs::TSP, RA_SLOT as i32 - total, TypeTag::RawPtr as u8);
            asm.sub_ri32(regs::WSP, total * WORD_SIZE);
            asm.sub_ri32(regs::TSP, total);
        }

        let entry = self.request_version(callee_fid, callee.entry, CodeGenState::new());
        if self.vt.can_fall_through(entry) {
            return Ok(Flow::End(Some(entry)));
        }
        self.emit_jump_to(entry);
        Ok(Flow::End(None))
    }

    // ==================== Dynamic closure calls ====================

    /// Call through a closure value: guard the tag, read the callee's
    /// record for parameter count and frame size, build the frame with
    /// missing arguments initialized to undefined, and jump through the
    /// callee's entry-code cell (initially its compile stub).
    pub(crate) fn gen_call(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        if instr.args.len() < 2 {
            return Err(malformed("call needs a closure and a receiver"));
        }
        let nargs = instr.args.len() - 2;
        let iptr = Self::instr_ptr(jit);

        // The frame build below owns the whole allocatable set, so
        // every argument must be readable from its home or a constant
        let lb = Self::live_before(jit, instr);
        jit.st
            .spill_values(&mut self.cb, &fun, |v| lb.contains(&v));

        // Closure type guard
        let err = self.cb.new_label();
        let t = jit
            .st
            .get_type_opnd(&mut self.cb, &fun, instr, 0, regs::SCR0)?;
        match t {
            Operand::Imm(tag) => {
                if tag as u8 != TypeTag::Closure as u8 {
                    self.gen_type_error_exit(iptr);
                    return Ok(Flow::End(None));
                }
            }
            Operand::Reg(r) => {
                let mut asm = Asm::new(&mut self.cb);
                asm.cmp_ri32_r32(r, TypeTag::Closure as i32);
                asm.jcc_label(Cond::Ne, err);
            }
            _ => unreachable!(),
        }

        // Callee record pointer
        let w = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 64, regs::SCR0, false)?;
        let clos_reg = match w {
            Operand::Reg(r) => r,
            _ => unreachable!(),
        };
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rm(Reg::R10, clos_reg, CLOS_FUN_OFS);
            // extra = max(argc - num_params, 0)
            asm.mov_rm32(Reg::Rax, Reg::R10, FUN_NUM_PARAMS_OFS);
            asm.mov_ri32(Reg::Rcx, nargs as i32);
            asm.sub_rr32(Reg::Rcx, Reg::Rax);
            asm.mov_ri32(Reg::Rdx, 0);
            asm.cmovcc(Cond::S, Reg::Rcx, Reg::Rdx);
            // total frame slots
            asm.mov_rm32(Reg::R8, Reg::R10, FUN_FRAME_SLOTS_OFS);
            asm.add_rr(Reg::R8, Reg::Rcx);
            // new stack pointers
            asm.mov_rr(Reg::R11, Reg::R8);
            asm.shl_ri(Reg::R11, 3);
            asm.mov_rr(Reg::R9, regs::WSP);
            asm.sub_rr(Reg::R9, Reg::R11);
            asm.mov_rr(Reg::R11, regs::TSP);
            asm.sub_rr(Reg::R11, Reg::R8);
        }

        // Provided arguments land contiguously after the header; any
        // spill-over past the formals is dead space the callee's return
        // pops with the extra-argument count
        for i in 0..nargs {
            let slot = HDR_SLOTS as i32 + i as i32;
            let w = jit
                .st
                .get_word_opnd(&mut self.cb, &fun, instr, 2 + i, 64, regs::SCR0, false)?;
            let wr = match w {
                Operand::Reg(r) => r,
                _ => unreachable!(),
            };
            {
                let mut asm = Asm::new(&mut self.cb);
                asm.mov_mr(Reg::R9, slot * WORD_SIZE, wr);
            }
            let t = jit
                .st
                .get_type_opnd(&mut self.cb, &fun, instr, 2 + i, regs::SCR1)?;
            let mut asm = Asm::new(&mut self.cb);
            match t {
                Operand::Imm(tag) => asm.mov_mi8(Reg::R11, slot, tag as u8),
                Operand::Reg(r) => asm.mov_mr8(Reg::R11, slot, r),
                _ => unreachable!(),
            }
        }

        // Missing formals are initialized to undefined
        {
            let done = self.cb.new_label();
            let head = self.cb.new_label();
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rr32(Reg::Rcx, Reg::Rax);
            asm.sub_ri32_r32(Reg::Rcx, nargs as i32);
            asm.jcc_label(Cond::Le, done);
            asm.lea(regs::SCR0, Reg::R9, (HDR_SLOTS as i32 + nargs as i32) * WORD_SIZE);
            asm.lea(regs::SCR1, Reg::R11, HDR_SLOTS as i32 + nargs as i32);
            asm.mov_ri32(Reg::Rdx, crate::ir::const_words::UNDEF as i32);
            self.cb.bind(head);
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_mr(regs::SCR0, 0, Reg::Rdx);
            asm.mov_mi8(regs::SCR1, 0, TypeTag::Const as u8);
            asm.add_ri32(regs::SCR0, WORD_SIZE);
            asm.add_ri32(regs::SCR1, 1);
            asm.sub_ri32_r32(Reg::Rcx, 1);
            asm.jcc_label(Cond::G, head);
            self.cb.bind(done);
        }

        let (cont, _exc) = self.gen_call_branch(jit, instr)?;

        // Header: return address, closure, receiver, argument count
        self.emit_code_addr(regs::SCR0, cont);
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_mr(Reg::R9, RA_SLOT as i32 * WORD_SIZE, regs::SCR0);
            asm.mov_mi8(Reg::R11, RA_SLOT as i32, TypeTag::RawPtr as u8);
        }
        let w = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 64, regs::SCR0, false)?;
        {
            let wr = match w {
                Operand::Reg(r) => r,
                _ => unreachable!(),
            };
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_mr(Reg::R9, CLOS_SLOT as i32 * WORD_SIZE, wr);
            asm.mov_mi8(Reg::R11, CLOS_SLOT as i32, TypeTag::Closure as u8);
        }
        let w = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 1, 64, regs::SCR0, false)?;
        {
            let wr = match w {
                Operand::Reg(r) => r,
                _ => unreachable!(),
            };
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_mr(Reg::R9, THIS_SLOT as i32 * WORD_SIZE, wr);
        }
        let t = jit
            .st
            .get_type_opnd(&mut self.cb, &fun, instr, 1, regs::SCR1)?;
        {
            let mut asm = Asm::new(&mut self.cb);
            match t {
                Operand::Imm(tag) => asm.mov_mi8(Reg::R11, THIS_SLOT as i32, tag as u8),
                Operand::Reg(r) => asm.mov_mr8(Reg::R11, THIS_SLOT as i32, r),
                _ => unreachable!(),
            }
            asm.mov_ri32(regs::SCR0, nargs as i32);
            asm.mov_mr(Reg::R9, ARGC_SLOT as i32 * WORD_SIZE, regs::SCR0);
            asm.mov_mi8(Reg::R11, ARGC_SLOT as i32, TypeTag::Int32 as u8);

            // Commit and jump through the entry-code cell
            asm.mov_rr(regs::WSP, Reg::R9);
            asm.mov_rr(regs::TSP, Reg::R11);
            asm.mov_rm(regs::SCR0, Reg::R10, FUN_ENTRY_CODE_OFS);
            asm.jmp_r(regs::SCR0);
        }

        // Non-callable value: build a TypeError and unwind
        self.cb.bind(err);
        self.gen_type_error_exit(iptr);
        Ok(Flow::End(None))
    }

    /// Apply-style call: bail out to a host helper that unpacks the
    /// argument array, builds the callee frame and returns the entry
    /// code pointer to jump to.
    pub(crate) fn gen_call_apply(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        if instr.args.len() != 3 {
            return Err(malformed("call_apply takes closure, this, argument array"));
        }
        let iptr = Self::instr_ptr(jit);

        let lb = Self::live_before(jit, instr);
        jit.st
            .spill_values(&mut self.cb, &fun, |v| lb.contains(&v));

        let (cont, _exc) = self.gen_call_branch(jit, instr)?;

        let w0 = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 64, Reg::Rdx, false)?;
        self.mov_to_reg64(Reg::Rdx, w0);
        let w1 = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 1, 64, Reg::Rcx, false)?;
        self.mov_to_reg64(Reg::Rcx, w1);
        let w2 = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 2, 64, Reg::R8, false)?;
        self.mov_to_reg64(Reg::R8, w2);
        self.emit_code_addr(Reg::R9, cont);
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.sync_stack_regs();
            asm.mov_rr(Reg::Rdi, regs::VM);
            asm.mov_ri64(Reg::Rsi, iptr as i64);
            asm.mov_rm(Reg::Rax, regs::VM, ctx_ofs::CALL_APPLY);
            asm.call_r(Reg::Rax);
            asm.reload_stack_regs();
            asm.jmp_r(Reg::Rax);
        }
        Ok(Flow::End(None))
    }

    /// `load_file` and `eval_str`: the host parses and compiles the
    /// unit, builds its frame, and hands back the code to enter. Parse
    /// errors surface as the `throw_exc` result, which this jump takes
    /// just the same.
    pub(crate) fn gen_eval(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let iptr = Self::instr_ptr(jit);
        let ofs = match instr.op {
            Opcode::LoadFile => ctx_ofs::LOAD_FILE,
            Opcode::EvalStr => ctx_ofs::EVAL_STR,
            _ => unreachable!(),
        };

        let lb = Self::live_before(jit, instr);
        jit.st
            .spill_values(&mut self.cb, &fun, |v| lb.contains(&v));

        let (cont, _exc) = self.gen_call_branch(jit, instr)?;

        let w = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 64, Reg::Rdx, false)?;
        self.mov_to_reg64(Reg::Rdx, w);
        self.emit_code_addr(Reg::Rcx, cont);
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.sync_stack_regs();
            asm.mov_rr(Reg::Rdi, regs::VM);
            asm.mov_ri64(Reg::Rsi, iptr as i64);
            asm.mov_rm(Reg::Rax, regs::VM, ofs);
            asm.call_r(Reg::Rax);
            asm.reload_stack_regs();
            asm.jmp_r(Reg::Rax);
        }
        Ok(Flow::End(None))
    }

    // ==================== Return and throw ====================

    /// Move the return pair into the reserved registers, pop the frame
    /// (plus any extra arguments for variadic-capable callees) and jump
    /// through the saved return address.
    pub(crate) fn gen_ret(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();

        let w = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 64, regs::SCR0, false)?;
        self.mov_to_reg64(regs::RET_WORD, w);
        let t = jit
            .st
            .get_type_opnd(&mut self.cb, &fun, instr, 0, regs::SCR1)?;
        {
            let mut asm = Asm::new(&mut self.cb);
            match t {
                Operand::Imm(tag) => asm.mov_ri32(regs::RET_TYPE, tag as i32),
                Operand::Reg(r) => asm.mov_rr(regs::RET_TYPE, r),
                _ => unreachable!(),
            }
        }

        let n = fun.num_slots as i32;
        let mut asm = Asm::new(&mut self.cb);
        asm.mov_rm(regs::SCR0, regs::WSP, RA_SLOT as i32 * WORD_SIZE);
        if fun.fixed_arity {
            asm.add_ri32(regs::WSP, n * WORD_SIZE);
            asm.add_ri32(regs::TSP, n);
        } else {
            // extra = max(argc - num_params, 0); pop locals + extras
            asm.mov_rm32(regs::SCR1, regs::WSP, ARGC_SLOT as i32 * WORD_SIZE);
            asm.sub_ri32_r32(regs::SCR1, fun.num_params as i32);
            asm.mov_ri32(regs::SCR2, 0);
            asm.cmovcc(Cond::S, regs::SCR1, regs::SCR2);
            asm.lea_sib(regs::WSP, regs::WSP, regs::SCR1, 3, n * WORD_SIZE);
            asm.lea_sib(regs::TSP, regs::TSP, regs::SCR1, 0, n);
        }
        asm.jmp_r(regs::SCR0);
        Ok(Flow::End(None))
    }

    /// Throw: spill, hand the exception to the host unwinder, and jump
    /// to whatever handler it returns. The exception value rides the
    /// callee-saved return registers into the handler's prologue.
    pub(crate) fn gen_throw(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let iptr = Self::instr_ptr(jit);

        let lb = Self::live_before(jit, instr);
        jit.st
            .spill_values(&mut self.cb, &fun, |v| lb.contains(&v));

        let w = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 64, Reg::Rcx, false)?;
        self.mov_to_reg64(Reg::Rcx, w);
        let t = jit
            .st
            .get_type_opnd(&mut self.cb, &fun, instr, 0, regs::SCR1)?;
        {
            let mut asm = Asm::new(&mut self.cb);
            match t {
                Operand::Imm(tag) => asm.mov_ri32(Reg::R8, tag as i32),
                Operand::Reg(r) => asm.mov_rr(Reg::R8, r),
                _ => unreachable!(),
            }
            asm.mov_rr(regs::RET_WORD, Reg::Rcx);
            asm.mov_rr(regs::RET_TYPE, Reg::R8);
            asm.sync_stack_regs();
            asm.mov_rr(Reg::Rdi, regs::VM);
            asm.mov_ri64(Reg::Rsi, iptr as i64);
            asm.mov_ri32(Reg::Rdx, 0);
            asm.mov_rm(Reg::Rax, regs::VM, ctx_ofs::THROW_EXC);
            asm.call_r(Reg::Rax);
            asm.reload_stack_regs();
            asm.jmp_r(Reg::Rax);
        }
        Ok(Flow::End(None))
    }

    // ==================== Heap allocation ====================

    /// Inline bump-pointer allocation with an out-of-line host
    /// fallback. Live values are spilled up front so both paths rejoin
    /// in one consistent state and the GC sees a valid frame.
    pub(crate) fn gen_alloc(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
        tag: TypeTag,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx);
        let iptr = Self::instr_ptr(jit);

        let lb = Self::live_before(jit, instr);
        jit.st
            .spill_values(&mut self.cb, &fun, |v| lb.contains(&v));

        let size_imm = match instr.args.first() {
            Some(IRArg::Const(Const::Int32(n))) => Some(*n),
            Some(IRArg::Val(_)) => None,
            _ => return Err(malformed("alloc needs a size")),
        };

        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, la, false, None, &[]);
        let r = match out {
            Operand::Reg(r) => r,
            _ => unreachable!("allocation out is always a register"),
        };

        let fallback = self.cb.new_label();
        let done = self.cb.new_label();
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rm(r, regs::VM, ctx_ofs::ALLOC_PTR);
        }
        match size_imm {
            Some(n) => {
                let mut asm = Asm::new(&mut self.cb);
                asm.lea(regs::SCR0, r, n);
            }
            None => {
                let v = jit
                    .st
                    .get_word_opnd(&mut self.cb, &fun, instr, 0, 32, regs::SCR1, false)?;
                let vr = match v {
                    Operand::Reg(vr) => vr,
                    _ => unreachable!(),
                };
                let mut asm = Asm::new(&mut self.cb);
                asm.lea_sib(regs::SCR0, r, vr, 0, 0);
            }
        }
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.cmp_rm(regs::SCR0, regs::VM, ctx_ofs::HEAP_LIMIT);
            asm.jcc_label(Cond::A, fallback);
            // Align the bumped pointer and commit
            asm.add_ri32(regs::SCR0, 7);
            asm.and_ri32(regs::SCR0, -8);
            asm.mov_mr(regs::VM, ctx_ofs::ALLOC_PTR, regs::SCR0);
            asm.jmp_label(done);
        }

        self.cb.bind(fallback);
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.save_jit_regs();
            asm.sync_stack_regs();
            asm.mov_rr(Reg::Rdi, regs::VM);
            asm.mov_ri64(Reg::Rsi, iptr as i64);
        }
        match size_imm {
            Some(n) => {
                let mut asm = Asm::new(&mut self.cb);
                asm.mov_ri32(Reg::Rdx, n);
            }
            None => {
                let v = jit
                    .st
                    .get_word_opnd(&mut self.cb, &fun, instr, 0, 32, Reg::Rdx, false)?;
                self.mov_to_reg32(Reg::Rdx, v);
            }
        }
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rm(Reg::Rax, regs::VM, ctx_ofs::HEAP_ALLOC);
            asm.call_r(Reg::Rax);
            asm.load_jit_regs();
            asm.mov_rr(r, Reg::Rax);
        }
        self.cb.bind(done);

        jit.st.set_out_type(instr, tag);
        Ok(Flow::Next)
    }

    // ==================== Closures ====================

    pub(crate) fn gen_new_clos(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx).clone();
        let iptr = Self::instr_ptr(jit);

        let callee = match instr.args.first() {
            Some(IRArg::Const(Const::Fun(f))) => *f,
            _ => return Err(malformed("new_clos needs a function reference")),
        };
        let ncells = match instr.args.get(1) {
            Some(IRArg::Const(Const::Int32(n))) if *n >= 0 => *n,
            _ => return Err(malformed("new_clos needs a capture count")),
        };
        let fe = self.fun_entries.entry_ptr(callee.0 as usize);

        jit.st
            .spill_values(&mut self.cb, &fun, |v| la.contains(&v));
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.save_jit_regs();
            asm.sync_stack_regs();
            asm.mov_rr(Reg::Rdi, regs::VM);
            asm.mov_ri64(Reg::Rsi, iptr as i64);
            asm.mov_ri64(Reg::Rdx, fe as i64);
            asm.mov_ri32(Reg::Rcx, ncells);
            asm.mov_rm(Reg::Rax, regs::VM, ctx_ofs::NEW_CLOS);
            asm.call_r(Reg::Rax);
            asm.load_jit_regs();
        }
        jit.st.clobber_regs();

        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, &la, false, None, &[]);
        self.write_out64(out, Reg::Rax);
        jit.st.set_out_type(instr, TypeTag::Closure);
        Ok(Flow::Next)
    }

    /// Write a captured value into one of a closure's boxed cells.
    pub(crate) fn gen_clos_set_cell(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let idx = match instr.args.get(1) {
            Some(IRArg::Const(Const::Int32(n))) if *n >= 0 => *n as u32,
            _ => return Err(malformed("clos_set_cell needs a constant cell index")),
        };

        let c = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 64, regs::SCR0, false)?;
        {
            let cr = match c {
                Operand::Reg(r) => r,
                _ => unreachable!(),
            };
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rm(regs::SCR0, cr, clos_cell_ofs(idx));
        }
        let v = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 2, 64, regs::SCR1, false)?;
        {
            let vr = match v {
                Operand::Reg(r) => r,
                _ => unreachable!(),
            };
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_mr(regs::SCR0, CELL_WORD_OFS, vr);
        }
        let t = jit
            .st
            .get_type_opnd(&mut self.cb, &fun, instr, 2, regs::SCR1)?;
        let mut asm = Asm::new(&mut self.cb);
        match t {
            Operand::Imm(tag) => asm.mov_mi8(regs::SCR0, CELL_TYPE_OFS, tag as u8),
            Operand::Reg(r) => asm.mov_mr8(regs::SCR0, CELL_TYPE_OFS, r),
            _ => unreachable!(),
        }
        Ok(Flow::Next)
    }

    pub(crate) fn gen_clos_get_cell(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx);
        let idx = match instr.args.get(1) {
            Some(IRArg::Const(Const::Int32(n))) if *n >= 0 => *n as u32,
            _ => return Err(malformed("clos_get_cell needs a constant cell index")),
        };

        let c = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 64, regs::SCR0, false)?;
        {
            let cr = match c {
                Operand::Reg(r) => r,
                _ => unreachable!(),
            };
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rm(regs::SCR0, cr, clos_cell_ofs(idx));
        }
        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, la, false, None, &[]);
        let r = match out {
            Operand::Reg(r) => r,
            _ => regs::SCR2,
        };
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rm(r, regs::SCR0, CELL_WORD_OFS);
            asm.movzx_rm8(regs::SCR1, regs::SCR0, CELL_TYPE_OFS);
        }
        if let Operand::Mem(b, d) = out {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_mr(b, d, r);
        }
        jit.st
            .set_out_type_reg(&mut self.cb, &fun, instr, regs::SCR1);
        Ok(Flow::Next)
    }

    // ==================== Shape-based property access ====================

    /// The host-helper property operations: spill, marshal the operand
    /// words, call the specific helper that walks the hidden-class
    /// chain, and record the typed result.
    pub(crate) fn gen_shape_host(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx).clone();

        // (host fn offset, word-argument count, value+tag pair at the
        // end, result tag)
        let (ofs, words, with_val, ret): (i32, usize, bool, Option<TypeTag>) = match instr.op {
            Opcode::ShapeGetDef => (ctx_ofs::SHAPE_GET_DEF, 2, false, Some(TypeTag::ShapePtr)),
            Opcode::ShapeSetProp => (ctx_ofs::SHAPE_SET_PROP, 3, true, None),
            Opcode::ShapeDefConst => (ctx_ofs::SHAPE_DEF_CONST, 2, true, None),
            Opcode::ShapeSetAttrs => (ctx_ofs::SHAPE_SET_ATTRS, 3, false, None),
            Opcode::ShapeGetAttrs => (ctx_ofs::SHAPE_GET_ATTRS, 1, false, Some(TypeTag::Int32)),
            Opcode::ShapeParent => (ctx_ofs::SHAPE_PARENT, 1, false, Some(TypeTag::ShapePtr)),
            Opcode::ShapePropName => (ctx_ofs::SHAPE_PROP_NAME, 1, false, Some(TypeTag::String)),
            _ => unreachable!(),
        };

        jit.st
            .spill_values(&mut self.cb, &fun, |v| la.contains(&v));
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.save_jit_regs();
            asm.sync_stack_regs();
        }

        const ARG_REGS: [Reg; 5] = [Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];
        for i in 0..words {
            let w = jit
                .st
                .get_word_opnd(&mut self.cb, &fun, instr, i, 64, ARG_REGS[i], false)?;
            self.mov_to_reg64(ARG_REGS[i], w);
        }
        if with_val {
            let w = jit
                .st
                .get_word_opnd(&mut self.cb, &fun, instr, words, 64, ARG_REGS[words], false)?;
            self.mov_to_reg64(ARG_REGS[words], w);
            let t = jit
                .st
                .get_type_opnd(&mut self.cb, &fun, instr, words, ARG_REGS[words + 1])?;
            let mut asm = Asm::new(&mut self.cb);
            match t {
                Operand::Imm(tag) => asm.mov_ri32(ARG_REGS[words + 1], tag as i32),
                Operand::Reg(r) => {
                    if r != ARG_REGS[words + 1] {
                        asm.mov_rr(ARG_REGS[words + 1], r);
                    }
                }
                _ => unreachable!(),
            }
        }
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rr(Reg::Rdi, regs::VM);
            asm.mov_rm(Reg::Rax, regs::VM, ofs);
            asm.call_r(Reg::Rax);
            asm.load_jit_regs();
        }
        jit.st.clobber_regs();

        if let Some(tag) = ret {
            let out = jit
                .st
                .get_out_opnd(&mut self.cb, &fun, instr, &la, false, None, &[]);
            self.write_out64(out, Reg::Rax);
            jit.st.set_out_type(instr, tag);
        }
        Ok(Flow::Next)
    }

    /// Property read through a shape: entirely inline. Selects the
    /// inline slot area or the overflow extension object by comparing
    /// the shape's slot index against the object's capacity. With the
    /// site cache enabled, the slot index comes from a four-way probe
    /// on the object's shape word, falling back to a host lookup that
    /// updates the cache.
    pub(crate) fn gen_shape_get_prop(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx).clone();

        if self.cfg.prop_ic {
            let lb = Self::live_before(jit, instr);
            jit.st
                .spill_values(&mut self.cb, &fun, |v| lb.contains(&v));
        }

        let o = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 64, regs::SCR0, false)?;
        self.mov_to_reg64(regs::SCR0, o);
        let s = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 1, 64, regs::SCR1, false)?;
        self.mov_to_reg64(regs::SCR1, s);

        if self.cfg.prop_ic {
            self.gen_prop_probe(jit, instr)?;
        } else {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rm32(regs::SCR2, regs::SCR1, SHAPE_SLOT_OFS);
        }

        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, &la, false, None, &[]);
        let r = match out {
            Operand::Reg(r) => r,
            _ => unreachable!("property read out is always a register"),
        };
        let t = jit.st.free_reg(&mut self.cb, &fun, instr, &la, &[r]);

        let ext = self.cb.new_label();
        let done = self.cb.new_label();
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rm32(t, regs::SCR0, OBJ_CAP_OFS);
            asm.cmp_rr(regs::SCR2, t);
            asm.jcc_label(Cond::Ae, ext);
            // Inline slot: word, then the type byte past the word area
            asm.mov_rm_sib(r, regs::SCR0, regs::SCR2, 3, OBJ_SLOTS_OFS);
            asm.lea_sib(regs::SCR1, regs::SCR0, t, 3, OBJ_SLOTS_OFS);
            asm.movzx_rm8_sib(t, regs::SCR1, regs::SCR2, 0, 0);
            asm.jmp_label(done);
        }
        self.cb.bind(ext);
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rm(regs::SCR0, regs::SCR0, OBJ_NEXT_OFS);
            asm.mov_rm32(t, regs::SCR0, OBJ_CAP_OFS);
            asm.mov_rm_sib(r, regs::SCR0, regs::SCR2, 3, OBJ_SLOTS_OFS);
            asm.lea_sib(regs::SCR1, regs::SCR0, t, 3, OBJ_SLOTS_OFS);
            asm.movzx_rm8_sib(t, regs::SCR1, regs::SCR2, 0, 0);
        }
        self.cb.bind(done);

        jit.st.set_out_type_reg(&mut self.cb, &fun, instr, t);
        Ok(Flow::Next)
    }

    /// Four-way cache probe on the object's shape word, leaving the
    /// property index in the third scratch register. Present but off by
    /// default; the shape record stays authoritative.
    fn gen_prop_probe(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<(), CodegenError> {
        let fun = jit.fun.clone();
        let obj_home = match instr.args.first() {
            Some(IRArg::Val(v)) => fun.home_slot(*v) as i32,
            _ => return Err(malformed("property read on a constant")),
        };

        self.caches.push(Box::new(PropCache::new()));
        let cache = self.caches.last_mut().unwrap();
        let cache_ptr = &mut **cache as *mut PropCache;

        let join = self.cb.new_label();
        let ways: Vec<_> = (0..PCACHE_WAYS).map(|_| self.cb.new_label()).collect();
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rm(regs::SCR2, regs::SCR0, OBJ_SHAPE_OFS);
            asm.mov_ri64(Reg::Rax, cache_ptr as i64);
            for (i, way) in ways.iter().enumerate() {
                asm.cmp_rm(regs::SCR2, Reg::Rax, i as i32 * PCACHE_ENTRY_SIZE);
                asm.jcc_label(Cond::E, *way);
            }
            // Miss: full lookup through the host, which updates the way
            asm.save_jit_regs();
            asm.sync_stack_regs();
            asm.mov_rr(Reg::Rdx, regs::SCR0);
            asm.mov_rr(Reg::Rcx, regs::SCR1);
            asm.mov_rr(Reg::Rdi, regs::VM);
            asm.mov_ri64(Reg::Rsi, cache_ptr as i64);
            asm.mov_rm(Reg::Rax, regs::VM, ctx_ofs::PCACHE_MISS);
            asm.call_r(Reg::Rax);
            asm.load_jit_regs();
            asm.mov_rr32(regs::SCR2, Reg::Rax);
            // The call clobbered the scratch registers; reload the
            // object from its home
            asm.mov_rm(regs::SCR0, regs::WSP, obj_home * WORD_SIZE);
            asm.jmp_label(join);
        }
        for (i, way) in ways.iter().enumerate() {
            self.cb.bind(*way);
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rm32(
                regs::SCR2,
                Reg::Rax,
                i as i32 * PCACHE_ENTRY_SIZE + PCACHE_IDX_OFS,
            );
            asm.jmp_label(join);
        }
        self.cb.bind(join);
        jit.st.clobber_regs();
        Ok(())
    }

    // ==================== Host and OS services ====================

    pub(crate) fn gen_gc_collect(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let iptr = Self::instr_ptr(jit);

        let lb = Self::live_before(jit, instr);
        jit.st
            .spill_values(&mut self.cb, &fun, |v| lb.contains(&v));
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.save_jit_regs();
            asm.sync_stack_regs();
        }
        match instr.args.first() {
            Some(IRArg::Const(Const::Int32(n))) => {
                let mut asm = Asm::new(&mut self.cb);
                asm.mov_ri32(Reg::Rdx, *n);
            }
            Some(IRArg::Val(_)) => {
                let v = jit
                    .st
                    .get_word_opnd(&mut self.cb, &fun, instr, 0, 32, Reg::Rdx, false)?;
                self.mov_to_reg32(Reg::Rdx, v);
            }
            _ => {
                let mut asm = Asm::new(&mut self.cb);
                asm.mov_ri32(Reg::Rdx, 0);
            }
        }
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rr(Reg::Rdi, regs::VM);
            asm.mov_ri64(Reg::Rsi, iptr as i64);
            asm.mov_rm(Reg::Rax, regs::VM, ctx_ofs::GC_COLLECT);
            asm.call_r(Reg::Rax);
            asm.load_jit_regs();
        }
        jit.st.clobber_regs();
        Ok(Flow::Next)
    }

    pub(crate) fn gen_get_time_ms(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx).clone();

        jit.st
            .spill_values(&mut self.cb, &fun, |v| la.contains(&v));
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.save_jit_regs();
            asm.sync_stack_regs();
            asm.mov_rr(Reg::Rdi, regs::VM);
            asm.mov_rm(Reg::Rax, regs::VM, ctx_ofs::GET_TIME_MS);
            asm.call_r(Reg::Rax);
            asm.load_jit_regs();
        }
        jit.st.clobber_regs();

        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, &la, false, None, &[]);
        self.write_out64(out, Reg::Rax);
        jit.st.set_out_type(instr, TypeTag::Int64);
        Ok(Flow::Next)
    }

    /// dlopen-family helpers. A zero result means failure and raises a
    /// TypeError through the host thunk.
    fn gen_lib_host(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
        ofs: i32,
        words: usize,
        has_out: bool,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx).clone();
        let iptr = Self::instr_ptr(jit);

        jit.st
            .spill_values(&mut self.cb, &fun, |v| la.contains(&v));
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.save_jit_regs();
            asm.sync_stack_regs();
        }
        const ARG_REGS: [Reg; 2] = [Reg::Rsi, Reg::Rdx];
        for i in 0..words {
            let w = jit
                .st
                .get_word_opnd(&mut self.cb, &fun, instr, i, 64, ARG_REGS[i], false)?;
            self.mov_to_reg64(ARG_REGS[i], w);
        }
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rr(Reg::Rdi, regs::VM);
            asm.mov_rm(Reg::Rax, regs::VM, ofs);
            asm.call_r(Reg::Rax);
            asm.load_jit_regs();
        }
        jit.st.clobber_regs();

        let ok = self.cb.new_label();
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.test_rr(Reg::Rax, Reg::Rax);
            asm.jcc_label(Cond::Ne, ok);
        }
        self.gen_type_error_exit(iptr);
        self.cb.bind(ok);

        if has_out {
            let out = jit
                .st
                .get_out_opnd(&mut self.cb, &fun, instr, &la, false, None, &[]);
            self.write_out64(out, Reg::Rax);
            jit.st.set_out_type(instr, TypeTag::RawPtr);
        }
        Ok(Flow::Next)
    }

    pub(crate) fn gen_load_lib(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        self.gen_lib_host(jit, instr, ctx_ofs::LOAD_LIB, 1, true)
    }

    pub(crate) fn gen_get_sym(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        self.gen_lib_host(jit, instr, ctx_ofs::GET_SYM, 2, true)
    }

    pub(crate) fn gen_close_lib(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        self.gen_lib_host(jit, instr, ctx_ofs::CLOSE_LIB, 1, false)
    }
}
