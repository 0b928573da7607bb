//! Per-opcode generators: moves, arithmetic, comparisons, type tests,
//! memory access and intra-function control flow.
//!
//! Every generator follows the same contract: fetch operands through
//! the `CodeGenState`, emit code, update the state, and report how
//! control continues. Type tests and comparisons fuse with a directly
//! following `if_true` whose condition has no other use, in which case
//! the boolean is never materialized.

use crate::ir::{const_words, Const, IRArg, IRInstr, Opcode, TypeTag};
use crate::runtime::layout::WORD_SIZE;

use super::compiler::{BranchKind, Codegen, Flow, JitState};
use super::state::{Operand, ValueLoc};
use super::x86_64::{regs, Asm, Cond, Reg};
use super::CodegenError;

/// 32-bit ALU operations sharing one lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Alu32 {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

/// Shift operations sharing one lowering.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Shift32 {
    Lsft,
    Rsft,
    Ursft,
}

fn malformed(msg: impl Into<String>) -> CodegenError {
    CodegenError::MalformedIr(msg.into())
}

impl Codegen {
    /// The per-opcode dispatch table.
    pub(crate) fn lower_instr(&mut self, jit: &mut JitState) -> Result<Flow, CodegenError> {
        let instr = jit.fun.block(jit.block).instrs[jit.idx].clone();

        // Pure instructions whose result nobody reads emit nothing
        if Self::is_pure(instr.op) && !instr.has_uses() && instr.targets[0].is_none() {
            return Ok(Flow::Next);
        }

        match instr.op {
            Opcode::Mov => self.gen_mov(jit, &instr),
            Opcode::SetStr => self.gen_set_str(jit, &instr),
            Opcode::MakeLink => self.gen_make_link(jit, &instr),
            Opcode::GetLink => self.gen_get_link(jit, &instr),
            Opcode::SetLink => self.gen_set_link(jit, &instr),

            Opcode::AddI32 => self.gen_arith_i32(jit, &instr, Alu32::Add),
            Opcode::SubI32 => self.gen_arith_i32(jit, &instr, Alu32::Sub),
            Opcode::MulI32 => self.gen_arith_i32(jit, &instr, Alu32::Mul),
            Opcode::AndI32 => self.gen_arith_i32(jit, &instr, Alu32::And),
            Opcode::OrI32 => self.gen_arith_i32(jit, &instr, Alu32::Or),
            Opcode::XorI32 => self.gen_arith_i32(jit, &instr, Alu32::Xor),
            Opcode::NotI32 => self.gen_not_i32(jit, &instr),
            Opcode::DivI32 => self.gen_div_i32(jit, &instr, false),
            Opcode::ModI32 => self.gen_div_i32(jit, &instr, true),
            Opcode::LsftI32 => self.gen_shift_i32(jit, &instr, Shift32::Lsft),
            Opcode::RsftI32 => self.gen_shift_i32(jit, &instr, Shift32::Rsft),
            Opcode::UrsftI32 => self.gen_shift_i32(jit, &instr, Shift32::Ursft),

            Opcode::AddF64 | Opcode::SubF64 | Opcode::MulF64 | Opcode::DivF64 => {
                self.gen_arith_f64(jit, &instr)
            }
            Opcode::SinF64
            | Opcode::CosF64
            | Opcode::SqrtF64
            | Opcode::CeilF64
            | Opcode::FloorF64
            | Opcode::LogF64
            | Opcode::ExpF64
            | Opcode::PowF64
            | Opcode::FmodF64 => self.gen_math_host(jit, &instr),
            Opcode::I32ToF64 => self.gen_i32_to_f64(jit, &instr),
            Opcode::F64ToI32 => self.gen_f64_to_i32(jit, &instr),

            Opcode::LoadU8 => self.gen_load(jit, &instr, 8, false, TypeTag::Int32),
            Opcode::LoadI8 => self.gen_load(jit, &instr, 8, true, TypeTag::Int32),
            Opcode::LoadU16 => self.gen_load(jit, &instr, 16, false, TypeTag::Int32),
            Opcode::LoadI16 => self.gen_load(jit, &instr, 16, true, TypeTag::Int32),
            Opcode::LoadU32 => self.gen_load(jit, &instr, 32, false, TypeTag::Int32),
            Opcode::LoadI32 => self.gen_load(jit, &instr, 32, true, TypeTag::Int32),
            Opcode::LoadU64 => self.gen_load(jit, &instr, 64, false, TypeTag::Int64),
            Opcode::LoadF64 => self.gen_load(jit, &instr, 64, false, TypeTag::Float64),
            Opcode::LoadRefPtr => self.gen_load(jit, &instr, 64, false, TypeTag::RefPtr),
            Opcode::LoadRawPtr => self.gen_load(jit, &instr, 64, false, TypeTag::RawPtr),
            Opcode::LoadFunPtr => self.gen_load(jit, &instr, 64, false, TypeTag::FunPtr),
            Opcode::LoadShapePtr => self.gen_load(jit, &instr, 64, false, TypeTag::ShapePtr),

            Opcode::StoreU8 => self.gen_store(jit, &instr, 8),
            Opcode::StoreU16 => self.gen_store(jit, &instr, 16),
            Opcode::StoreU32 => self.gen_store(jit, &instr, 32),
            Opcode::StoreU64
            | Opcode::StoreF64
            | Opcode::StoreRefPtr
            | Opcode::StoreRawPtr
            | Opcode::StoreFunPtr
            | Opcode::StoreShapePtr => self.gen_store(jit, &instr, 64),

            Opcode::IsInt32 => self.gen_type_test(jit, &instr, TypeTag::Int32),
            Opcode::IsInt64 => self.gen_type_test(jit, &instr, TypeTag::Int64),
            Opcode::IsFloat64 => self.gen_type_test(jit, &instr, TypeTag::Float64),
            Opcode::IsConst => self.gen_type_test(jit, &instr, TypeTag::Const),
            Opcode::IsRefPtr => self.gen_type_test(jit, &instr, TypeTag::RefPtr),
            Opcode::IsRawPtr => self.gen_type_test(jit, &instr, TypeTag::RawPtr),
            Opcode::IsObject => self.gen_type_test(jit, &instr, TypeTag::Object),
            Opcode::IsArray => self.gen_type_test(jit, &instr, TypeTag::Array),
            Opcode::IsClosure => self.gen_type_test(jit, &instr, TypeTag::Closure),
            Opcode::IsString => self.gen_type_test(jit, &instr, TypeTag::String),
            Opcode::IsShapePtr => self.gen_type_test(jit, &instr, TypeTag::ShapePtr),
            Opcode::IsFunPtr => self.gen_type_test(jit, &instr, TypeTag::FunPtr),

            Opcode::EqI8 => self.gen_cmp_int(jit, &instr, 8, Cond::E),
            Opcode::NeI8 => self.gen_cmp_int(jit, &instr, 8, Cond::Ne),
            Opcode::EqI32 => self.gen_cmp_int(jit, &instr, 32, Cond::E),
            Opcode::NeI32 => self.gen_cmp_int(jit, &instr, 32, Cond::Ne),
            Opcode::LtI32 => self.gen_cmp_int(jit, &instr, 32, Cond::L),
            Opcode::LeI32 => self.gen_cmp_int(jit, &instr, 32, Cond::Le),
            Opcode::GtI32 => self.gen_cmp_int(jit, &instr, 32, Cond::G),
            Opcode::GeI32 => self.gen_cmp_int(jit, &instr, 32, Cond::Ge),
            Opcode::EqI64 => self.gen_cmp_int(jit, &instr, 64, Cond::E),
            Opcode::NeI64 => self.gen_cmp_int(jit, &instr, 64, Cond::Ne),
            Opcode::LtI64 => self.gen_cmp_int(jit, &instr, 64, Cond::L),
            Opcode::LeI64 => self.gen_cmp_int(jit, &instr, 64, Cond::Le),
            Opcode::GtI64 => self.gen_cmp_int(jit, &instr, 64, Cond::G),
            Opcode::GeI64 => self.gen_cmp_int(jit, &instr, 64, Cond::Ge),
            Opcode::EqF64 | Opcode::NeF64 | Opcode::LtF64 | Opcode::LeF64 | Opcode::GtF64
            | Opcode::GeF64 => self.gen_cmp_f64(jit, &instr),

            Opcode::Jump => self.gen_jump(jit, &instr),
            Opcode::IfTrue => self.gen_if_true(jit, &instr),

            Opcode::CallPrim => self.gen_call_prim(jit, &instr),
            Opcode::Call => self.gen_call(jit, &instr),
            Opcode::CallApply => self.gen_call_apply(jit, &instr),
            Opcode::CallFfi => self.gen_call_ffi(jit, &instr),
            Opcode::Ret => self.gen_ret(jit, &instr),
            Opcode::Throw => self.gen_throw(jit, &instr),

            Opcode::AllocObject => self.gen_alloc(jit, &instr, TypeTag::Object),
            Opcode::AllocArray => self.gen_alloc(jit, &instr, TypeTag::Array),
            Opcode::AllocString => self.gen_alloc(jit, &instr, TypeTag::String),
            Opcode::AllocClosure => self.gen_alloc(jit, &instr, TypeTag::Closure),

            Opcode::NewClos => self.gen_new_clos(jit, &instr),
            Opcode::ClosSetCell => self.gen_clos_set_cell(jit, &instr),
            Opcode::ClosGetCell => self.gen_clos_get_cell(jit, &instr),

            Opcode::ShapeGetDef
            | Opcode::ShapeSetProp
            | Opcode::ShapeDefConst
            | Opcode::ShapeSetAttrs
            | Opcode::ShapeGetAttrs
            | Opcode::ShapeParent
            | Opcode::ShapePropName => self.gen_shape_host(jit, &instr),
            Opcode::ShapeGetProp => self.gen_shape_get_prop(jit, &instr),

            Opcode::GcCollect => self.gen_gc_collect(jit, &instr),
            Opcode::GetTimeMs => self.gen_get_time_ms(jit, &instr),
            Opcode::LoadFile | Opcode::EvalStr => self.gen_eval(jit, &instr),
            Opcode::LoadLib => self.gen_load_lib(jit, &instr),
            Opcode::GetSym => self.gen_get_sym(jit, &instr),
            Opcode::CloseLib => self.gen_close_lib(jit, &instr),
        }
    }

    fn is_pure(op: Opcode) -> bool {
        matches!(
            op,
            Opcode::Mov
                | Opcode::MakeLink
                | Opcode::GetLink
                | Opcode::AddI32
                | Opcode::SubI32
                | Opcode::MulI32
                | Opcode::AndI32
                | Opcode::OrI32
                | Opcode::XorI32
                | Opcode::NotI32
                | Opcode::LsftI32
                | Opcode::RsftI32
                | Opcode::UrsftI32
                | Opcode::AddF64
                | Opcode::SubF64
                | Opcode::MulF64
                | Opcode::DivF64
                | Opcode::I32ToF64
                | Opcode::F64ToI32
                | Opcode::LoadU8
                | Opcode::LoadI8
                | Opcode::LoadU16
                | Opcode::LoadI16
                | Opcode::LoadU32
                | Opcode::LoadI32
                | Opcode::LoadU64
                | Opcode::LoadF64
                | Opcode::LoadRefPtr
                | Opcode::LoadRawPtr
                | Opcode::LoadFunPtr
                | Opcode::LoadShapePtr
                | Opcode::IsInt32
                | Opcode::IsInt64
                | Opcode::IsFloat64
                | Opcode::IsConst
                | Opcode::IsRefPtr
                | Opcode::IsRawPtr
                | Opcode::IsObject
                | Opcode::IsArray
                | Opcode::IsClosure
                | Opcode::IsString
                | Opcode::IsShapePtr
                | Opcode::IsFunPtr
                | Opcode::EqI8
                | Opcode::NeI8
                | Opcode::EqI32
                | Opcode::NeI32
                | Opcode::LtI32
                | Opcode::LeI32
                | Opcode::GtI32
                | Opcode::GeI32
                | Opcode::EqI64
                | Opcode::NeI64
                | Opcode::LtI64
                | Opcode::LeI64
                | Opcode::GtI64
                | Opcode::GeI64
                | Opcode::EqF64
                | Opcode::NeF64
                | Opcode::LtF64
                | Opcode::LeF64
                | Opcode::GtF64
                | Opcode::GeF64
                | Opcode::ClosGetCell
        )
    }

    // ==================== Shared emission helpers ====================

    /// Move an operand's word into a register, 64-bit.
    pub(crate) fn mov_to_reg64(&mut self, dst: Reg, o: Operand) {
        let mut asm = Asm::new(&mut self.cb);
        match o {
            Operand::Reg(r) => {
                if r != dst {
                    asm.mov_rr(dst, r);
                }
            }
            Operand::Imm(v) => {
                if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
                    asm.mov_ri32(dst, v as i32);
                } else {
                    asm.mov_ri64(dst, v);
                }
            }
            Operand::Mem(b, d) => asm.mov_rm(dst, b, d),
        }
    }

    /// Move an operand's word into a register, 32-bit.
    pub(crate) fn mov_to_reg32(&mut self, dst: Reg, o: Operand) {
        let mut asm = Asm::new(&mut self.cb);
        match o {
            Operand::Reg(r) => {
                if r != dst {
                    asm.mov_rr32(dst, r);
                }
            }
            Operand::Imm(v) => asm.mov_ri32(dst, v as i32),
            Operand::Mem(b, d) => asm.mov_rm32(dst, b, d),
        }
    }

    /// Write a 32-bit result held in `src` into the chosen out operand.
    fn write_out32(&mut self, out: Operand, src: Reg) {
        let mut asm = Asm::new(&mut self.cb);
        match out {
            Operand::Reg(r) => {
                if r != src {
                    asm.mov_rr32(r, src);
                }
            }
            Operand::Mem(b, d) => asm.mov_mr32(b, d, src),
            Operand::Imm(_) => unreachable!("immediate out operand"),
        }
    }

    /// Write a 64-bit result held in `src` into the chosen out operand.
    pub(crate) fn write_out64(&mut self, out: Operand, src: Reg) {
        let mut asm = Asm::new(&mut self.cb);
        match out {
            Operand::Reg(r) => {
                if r != src {
                    asm.mov_rr(r, src);
                }
            }
            Operand::Mem(b, d) => asm.mov_mr(b, d, src),
            Operand::Imm(_) => unreachable!("immediate out operand"),
        }
    }

    /// The register of an operand known to be one.
    fn opnd_reg(o: Operand) -> Reg {
        match o {
            Operand::Reg(r) => r,
            _ => unreachable!("operand is not a register"),
        }
    }

    /// Load a float argument into an XMM register.
    pub(crate) fn load_f64_arg(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
        idx: usize,
        xmm: u8,
        scratch: Reg,
    ) -> Result<(), CodegenError> {
        let fun = jit.fun.clone();
        let arg = instr
            .args
            .get(idx)
            .ok_or_else(|| malformed(format!("{:?}: missing argument {}", instr.op, idx)))?;
        match arg {
            IRArg::Val(v) => match jit.st.loc(*v) {
                ValueLoc::Stack => {
                    let slot = fun.home_slot(*v) as i32;
                    let mut asm = Asm::new(&mut self.cb);
                    asm.movsd_xmm_mem(xmm, regs::WSP, slot * WORD_SIZE);
                }
                ValueLoc::Reg(r) => {
                    let mut asm = Asm::new(&mut self.cb);
                    asm.movq_xmm_r64(xmm, r);
                }
                ValueLoc::Imm(w, _) => {
                    let mut asm = Asm::new(&mut self.cb);
                    asm.mov_ri64(scratch, w as i64);
                    asm.movq_xmm_r64(xmm, scratch);
                }
            },
            IRArg::Const(c) => {
                let (w, _) = super::state::const_word_tag(c)?;
                let mut asm = Asm::new(&mut self.cb);
                asm.mov_ri64(scratch, w as i64);
                asm.movq_xmm_r64(xmm, scratch);
            }
        }
        Ok(())
    }

    /// A directly following `if_true` consuming this instruction's
    /// boolean as its only use, eligible for branch fusion.
    fn fused_if_true(&self, jit: &JitState, instr: &IRInstr) -> Option<IRInstr> {
        if instr.use_count != 1 {
            return None;
        }
        let next = jit.fun.block(jit.block).instrs.get(jit.idx + 1)?;
        if next.op != Opcode::IfTrue {
            return None;
        }
        match next.args.first() {
            Some(IRArg::Val(v)) if *v == instr.out => Some(next.clone()),
            _ => None,
        }
    }

    /// Materialize a boolean from the current flags via CMOV.
    fn materialize_bool(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
        cond: Cond,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx);
        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, la, false, None, &[]);
        let r = match out {
            Operand::Reg(r) => r,
            _ => regs::SCR2,
        };
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_ri32(r, const_words::FALSE as i32);
            asm.mov_ri32(regs::SCR0, const_words::TRUE as i32);
            asm.cmovcc(cond, r, regs::SCR0);
        }
        if let Operand::Mem(b, d) = out {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_mr(b, d, r);
        }
        jit.st.set_out_type(instr, TypeTag::Const);
        Ok(Flow::Next)
    }

    // ==================== Moves and links ====================

    fn gen_mov(&mut self, jit: &mut JitState, instr: &IRInstr) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx);

        // Constants and immediate-located values propagate without code
        match instr.args.first() {
            Some(IRArg::Const(c)) => {
                let (w, t) = super::state::const_word_tag(c)?;
                jit.st.set_loc_imm(instr.out, w, t);
                return Ok(Flow::Next);
            }
            Some(IRArg::Val(v)) => {
                if let ValueLoc::Imm(w, t) = jit.st.loc(*v) {
                    jit.st.set_loc_imm(instr.out, w, t);
                    return Ok(Flow::Next);
                }
            }
            None => return Err(malformed("mov without source")),
        }

        let o = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 64, regs::SCR0, false)?;
        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, la, true, None, &[]);
        self.write_out64(out, Self::opnd_reg(o));

        let src = match &instr.args[0] {
            IRArg::Val(v) => *v,
            _ => unreachable!(),
        };
        match jit.st.known_type(src) {
            Some(t) => jit.st.set_out_type(instr, t),
            None => {
                let t = jit
                    .st
                    .get_type_opnd(&mut self.cb, &fun, instr, 0, regs::SCR1)?;
                match t {
                    Operand::Reg(r) => jit.st.set_out_type_reg(&mut self.cb, &fun, instr, r),
                    Operand::Imm(tag) => {
                        jit.st
                            .set_out_type(instr, TypeTag::from_u8(tag as u8).unwrap())
                    }
                    _ => unreachable!(),
                }
            }
        }
        Ok(Flow::Next)
    }

    fn gen_set_str(&mut self, jit: &mut JitState, instr: &IRInstr) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx);

        let s = match instr.args.first() {
            Some(IRArg::Const(Const::Str(s))) => s.clone(),
            _ => return Err(malformed("set_str needs a string literal")),
        };

        // Intern at compile time; the emitted code reads the link cell
        // so the collector may relocate the string
        let idx = match self.str_links.get(s.as_ref()) {
            Some(&idx) => idx,
            None => {
                let vm = self.vm;
                let word = unsafe { ((*vm).get_str)(vm, s.as_ptr(), s.len() as u64) };
                let idx = self
                    .link
                    .alloc(word, TypeTag::String)
                    .ok_or(CodegenError::LinkTableFull)?;
                self.str_links.insert(s.to_string(), idx);
                idx
            }
        };

        let addr = self.link.word_addr(idx);
        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, la, false, None, &[]);
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_ri64(regs::SCR0, addr as i64);
        }
        let r = match out {
            Operand::Reg(r) => r,
            _ => regs::SCR1,
        };
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_rm(r, regs::SCR0, 0);
        }
        if let Operand::Mem(b, d) = out {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_mr(b, d, r);
        }
        jit.st.set_out_type(instr, TypeTag::String);
        Ok(Flow::Next)
    }

    /// Resolve a link-table index argument, allocating the placeholder
    /// cell on first use.
    fn link_idx(&mut self, instr: &IRInstr, idx: usize) -> Result<u32, CodegenError> {
        match instr.args.get(idx) {
            Some(IRArg::Const(Const::Link(slot))) => match slot.get() {
                Some(i) => Ok(i),
                None => {
                    let i = self
                        .link
                        .alloc(const_words::NULL, TypeTag::Const)
                        .ok_or(CodegenError::LinkTableFull)?;
                    slot.set(i);
                    Ok(i)
                }
            },
            Some(IRArg::Const(Const::Int32(n))) if *n >= 0 => Ok(*n as u32),
            _ => Err(malformed("expected a link-table reference")),
        }
    }

    fn gen_make_link(&mut self, jit: &mut JitState, instr: &IRInstr) -> Result<Flow, CodegenError> {
        let idx = if instr.args.is_empty() {
            self.link
                .alloc(const_words::NULL, TypeTag::Const)
                .ok_or(CodegenError::LinkTableFull)?
        } else {
            self.link_idx(instr, 0)?
        };
        jit.st.set_loc_imm(instr.out, idx as u64, TypeTag::Int32);
        Ok(Flow::Next)
    }

    fn gen_get_link(&mut self, jit: &mut JitState, instr: &IRInstr) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx);
        let idx = self.link_idx(instr, 0)?;
        if idx as usize >= self.link.capacity() {
            return Err(malformed("link index out of range"));
        }

        let waddr = self.link.word_addr(idx);
        let taddr = self.link.tag_addr(idx);
        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, la, false, None, &[]);
        let r = match out {
            Operand::Reg(r) => r,
            _ => regs::SCR2,
        };
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_ri64(regs::SCR0, waddr as i64);
            asm.mov_rm(r, regs::SCR0, 0);
            asm.mov_ri64(regs::SCR0, taddr as i64);
            asm.movzx_rm8(regs::SCR1, regs::SCR0, 0);
        }
        if let Operand::Mem(b, d) = out {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_mr(b, d, r);
        }
        jit.st
            .set_out_type_reg(&mut self.cb, &fun, instr, regs::SCR1);
        Ok(Flow::Next)
    }

    fn gen_set_link(&mut self, jit: &mut JitState, instr: &IRInstr) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let idx = self.link_idx(instr, 0)?;
        if idx as usize >= self.link.capacity() {
            return Err(malformed("link index out of range"));
        }

        let waddr = self.link.word_addr(idx);
        let taddr = self.link.tag_addr(idx);
        let v = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 1, 64, regs::SCR1, false)?;
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_ri64(regs::SCR0, waddr as i64);
            asm.mov_mr(regs::SCR0, 0, Self::opnd_reg(v));
        }
        let t = jit
            .st
            .get_type_opnd(&mut self.cb, &fun, instr, 1, regs::SCR1)?;
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_ri64(regs::SCR0, taddr as i64);
            match t {
                Operand::Imm(tag) => asm.mov_mi8(regs::SCR0, 0, tag as u8),
                Operand::Reg(r) => asm.mov_mr8(regs::SCR0, 0, r),
                _ => unreachable!(),
            }
        }
        Ok(Flow::Next)
    }

    // ==================== Integer arithmetic ====================

    fn gen_arith_i32(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
        alu: Alu32,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx);
        let has_ovf = instr.targets[0].is_some();
        if has_ovf && !matches!(alu, Alu32::Add | Alu32::Sub | Alu32::Mul) {
            return Err(malformed("overflow variant on a non-overflowing opcode"));
        }

        // Multiply cannot take an immediate in this form
        let allow_imm = alu != Alu32::Mul;
        let commutative = !matches!(alu, Alu32::Sub);
        let mut o1 = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 1, 32, regs::SCR1, allow_imm)?;
        let mut o0 = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 32, regs::SCR0, false)?;

        // Subtraction must not reuse the second input's register: the
        // result would overwrite the subtrahend before the operation
        let avoid: Vec<Reg> = match (commutative, o1) {
            (false, Operand::Reg(s)) => vec![s],
            _ => Vec::new(),
        };
        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, la, true, None, &avoid);
        // Always a register here: the overflow variant must leave the
        // home slot untouched on the overflow edge, and the allocator
        // can spill its way to one
        let r = match out {
            Operand::Reg(r) => r,
            _ => unreachable!("arith out is always a register"),
        };
        // Commutative reuse of the second input swaps the operands
        if o1 == Operand::Reg(r) {
            std::mem::swap(&mut o0, &mut o1);
        }

        self.mov_to_reg32(r, o0);
        {
            let mut asm = Asm::new(&mut self.cb);
            match (alu, o1) {
                (Alu32::Add, Operand::Reg(s)) => asm.add_rr32(r, s),
                (Alu32::Add, Operand::Imm(v)) => asm.add_ri32_r32(r, v as i32),
                (Alu32::Sub, Operand::Reg(s)) => asm.sub_rr32(r, s),
                (Alu32::Sub, Operand::Imm(v)) => asm.sub_ri32_r32(r, v as i32),
                (Alu32::Mul, Operand::Reg(s)) => asm.imul_rr32(r, s),
                (Alu32::And, Operand::Reg(s)) => asm.and_rr32(r, s),
                (Alu32::And, Operand::Imm(v)) => asm.and_ri32_r32(r, v as i32),
                (Alu32::Or, Operand::Reg(s)) => asm.or_rr32(r, s),
                (Alu32::Or, Operand::Imm(v)) => asm.or_ri32_r32(r, v as i32),
                (Alu32::Xor, Operand::Reg(s)) => asm.xor_rr32(r, s),
                (Alu32::Xor, Operand::Imm(v)) => asm.xor_ri32_r32(r, v as i32),
                _ => unreachable!(),
            }
        }
        jit.st.set_out_type(instr, TypeTag::Int32);

        if has_ovf {
            // Successor 0 on no overflow, successor 1 on overflow. The
            // result register is only meaningful on the no-overflow
            // edge; the overflow edge sees the home slot unmodified.
            let t0 = instr.targets[0].unwrap();
            let t1 = instr.targets[1].ok_or_else(|| malformed("missing overflow target"))?;
            let st_ok = jit.st.clone();
            let mut st_ovf = jit.st.clone();
            st_ovf.map_to_stack(instr.out);
            return self.gen_branch(jit, BranchKind::Cond(Cond::No), t0, st_ok, Some((t1, st_ovf)));
        }
        Ok(Flow::Next)
    }

    fn gen_not_i32(&mut self, jit: &mut JitState, instr: &IRInstr) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx);

        let o0 = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 32, regs::SCR0, false)?;
        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, la, true, None, &[]);
        let r = match out {
            Operand::Reg(r) => r,
            _ => regs::SCR2,
        };
        self.mov_to_reg32(r, o0);
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.not32(r);
        }
        if let Operand::Mem(b, d) = out {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_mr32(b, d, r);
        }
        jit.st.set_out_type(instr, TypeTag::Int32);
        Ok(Flow::Next)
    }

    /// Integer division and modulo through the fixed RDX:RAX pair.
    fn gen_div_i32(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
        want_rem: bool,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx);

        jit.st.spill_reg(&mut self.cb, &fun, Reg::Rax);
        jit.st.spill_reg(&mut self.cb, &fun, Reg::Rdx);

        let o1 = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 1, 32, regs::SCR1, false)?;
        let divisor = Self::opnd_reg(o1);
        let o0 = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 32, regs::SCR0, false)?;
        self.mov_to_reg32(Reg::Rax, o0);
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.cdq();
            asm.idiv32(divisor);
        }

        let result = if want_rem { Reg::Rdx } else { Reg::Rax };
        let out = jit.st.get_out_opnd(
            &mut self.cb,
            &fun,
            instr,
            la,
            false,
            Some(result),
            &[if want_rem { Reg::Rax } else { Reg::Rdx }],
        );
        self.write_out32(out, result);
        jit.st.set_out_type(instr, TypeTag::Int32);
        Ok(Flow::Next)
    }

    /// Shifts: constant counts are masked to 5 bits; dynamic counts go
    /// through CL with the shiftee kept clear of RCX.
    fn gen_shift_i32(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
        kind: Shift32,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx);

        if let Some(IRArg::Const(Const::Int32(n))) = instr.args.get(1) {
            let count = (*n as u32 & 31) as u8;
            let o0 = jit
                .st
                .get_word_opnd(&mut self.cb, &fun, instr, 0, 32, regs::SCR0, false)?;
            let out = jit
                .st
                .get_out_opnd(&mut self.cb, &fun, instr, la, true, None, &[]);
            let r = match out {
                Operand::Reg(r) => r,
                _ => regs::SCR2,
            };
            self.mov_to_reg32(r, o0);
            {
                let mut asm = Asm::new(&mut self.cb);
                match kind {
                    Shift32::Lsft => asm.shl32_ri(r, count),
                    Shift32::Rsft => asm.sar32_ri(r, count),
                    Shift32::Ursft => asm.shr32_ri(r, count),
                }
            }
            if let Operand::Mem(b, d) = out {
                let mut asm = Asm::new(&mut self.cb);
                asm.mov_mr32(b, d, r);
            }
            jit.st.set_out_type(instr, TypeTag::Int32);
            return Ok(Flow::Next);
        }

        jit.st.spill_reg(&mut self.cb, &fun, Reg::Rcx);
        let o1 = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 1, 32, Reg::Rcx, false)?;
        if o1 != Operand::Reg(Reg::Rcx) {
            self.mov_to_reg32(Reg::Rcx, o1);
        }
        let o0 = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 32, regs::SCR0, false)?;
        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, la, false, None, &[Reg::Rcx]);
        let r = match out {
            Operand::Reg(r) => r,
            _ => regs::SCR2,
        };
        self.mov_to_reg32(r, o0);
        {
            let mut asm = Asm::new(&mut self.cb);
            match kind {
                Shift32::Lsft => asm.shl32_cl(r),
                Shift32::Rsft => asm.sar32_cl(r),
                Shift32::Ursft => asm.shr32_cl(r),
            }
        }
        if let Operand::Mem(b, d) = out {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_mr32(b, d, r);
        }
        jit.st.set_out_type(instr, TypeTag::Int32);
        Ok(Flow::Next)
    }

    // ==================== Float arithmetic ====================

    fn gen_arith_f64(&mut self, jit: &mut JitState, instr: &IRInstr) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx);

        self.load_f64_arg(jit, instr, 0, 0, regs::SCR0)?;
        self.load_f64_arg(jit, instr, 1, 1, regs::SCR0)?;
        {
            let mut asm = Asm::new(&mut self.cb);
            match instr.op {
                Opcode::AddF64 => asm.addsd(0, 1),
                Opcode::SubF64 => asm.subsd(0, 1),
                Opcode::MulF64 => asm.mulsd(0, 1),
                Opcode::DivF64 => asm.divsd(0, 1),
                _ => unreachable!(),
            }
        }

        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, la, true, None, &[]);
        {
            let mut asm = Asm::new(&mut self.cb);
            match out {
                Operand::Reg(r) => asm.movq_r64_xmm(r, 0),
                Operand::Mem(b, d) => asm.movsd_mem_xmm(b, d, 0),
                Operand::Imm(_) => unreachable!(),
            }
        }
        jit.st.set_out_type(instr, TypeTag::Float64);
        Ok(Flow::Next)
    }

    /// Transcendentals and float modulo route through host functions.
    fn gen_math_host(&mut self, jit: &mut JitState, instr: &IRInstr) -> Result<Flow, CodegenError> {
        use crate::runtime::context::ctx_ofs;

        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx).clone();

        let (ofs, two_args) = match instr.op {
            Opcode::SinF64 => (ctx_ofs::MATH_SIN, false),
            Opcode::CosF64 => (ctx_ofs::MATH_COS, false),
            Opcode::SqrtF64 => (ctx_ofs::MATH_SQRT, false),
            Opcode::CeilF64 => (ctx_ofs::MATH_CEIL, false),
            Opcode::FloorF64 => (ctx_ofs::MATH_FLOOR, false),
            Opcode::LogF64 => (ctx_ofs::MATH_LOG, false),
            Opcode::ExpF64 => (ctx_ofs::MATH_EXP, false),
            Opcode::PowF64 => (ctx_ofs::MATH_POW, true),
            Opcode::FmodF64 => (ctx_ofs::MATH_FMOD, true),
            _ => unreachable!(),
        };

        jit.st
            .spill_values(&mut self.cb, &fun, |v| la.contains(&v));
        self.load_f64_arg(jit, instr, 0, 0, regs::SCR0)?;
        if two_args {
            self.load_f64_arg(jit, instr, 1, 1, regs::SCR0)?;
        }
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.save_jit_regs();
            asm.sync_stack_regs();
            asm.mov_rm(Reg::Rax, regs::VM, ofs);
            asm.call_r(Reg::Rax);
            asm.load_jit_regs();
        }
        jit.st.clobber_regs();

        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, &la, false, None, &[]);
        {
            let mut asm = Asm::new(&mut self.cb);
            match out {
                Operand::Reg(r) => asm.movq_r64_xmm(r, 0),
                Operand::Mem(b, d) => asm.movsd_mem_xmm(b, d, 0),
                Operand::Imm(_) => unreachable!(),
            }
        }
        jit.st.set_out_type(instr, TypeTag::Float64);
        Ok(Flow::Next)
    }

    fn gen_i32_to_f64(&mut self, jit: &mut JitState, instr: &IRInstr) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx);

        let o0 = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 32, regs::SCR0, false)?;
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.movsxd(regs::SCR0, Self::opnd_reg(o0));
            asm.cvtsi2sd_xmm_r64(0, regs::SCR0);
        }
        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, la, true, None, &[]);
        {
            let mut asm = Asm::new(&mut self.cb);
            match out {
                Operand::Reg(r) => asm.movq_r64_xmm(r, 0),
                Operand::Mem(b, d) => asm.movsd_mem_xmm(b, d, 0),
                Operand::Imm(_) => unreachable!(),
            }
        }
        jit.st.set_out_type(instr, TypeTag::Float64);
        Ok(Flow::Next)
    }

    fn gen_f64_to_i32(&mut self, jit: &mut JitState, instr: &IRInstr) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx);

        self.load_f64_arg(jit, instr, 0, 0, regs::SCR0)?;
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.cvttsd2si_r64_xmm(regs::SCR0, 0);
        }
        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, la, true, None, &[]);
        self.write_out32(out, regs::SCR0);
        jit.st.set_out_type(instr, TypeTag::Int32);
        Ok(Flow::Next)
    }

    // ==================== Memory access ====================

    /// Effective-address setup shared by loads and stores: returns the
    /// base register and displacement to address `base + (imm | reg)`.
    fn gen_addr(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<(Reg, i32), CodegenError> {
        let fun = jit.fun.clone();
        let b = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 64, regs::SCR0, false)?;
        let breg = Self::opnd_reg(b);

        match instr.args.get(1) {
            Some(IRArg::Const(Const::Int32(d))) => Ok((breg, *d)),
            Some(_) => {
                let i = jit
                    .st
                    .get_word_opnd(&mut self.cb, &fun, instr, 1, 64, regs::SCR1, false)?;
                let ireg = Self::opnd_reg(i);
                let mut asm = Asm::new(&mut self.cb);
                asm.lea_sib(regs::SCR1, breg, ireg, 0, 0);
                Ok((regs::SCR1, 0))
            }
            None => Err(malformed("memory access without an index")),
        }
    }

    fn gen_load(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
        width: u8,
        signed: bool,
        tag: TypeTag,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx);

        let (base, disp) = self.gen_addr(jit, instr)?;
        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, la, false, None, &[]);
        let r = match out {
            Operand::Reg(r) => r,
            _ => regs::SCR2,
        };
        {
            let mut asm = Asm::new(&mut self.cb);
            match (width, signed) {
                (8, false) => asm.movzx_rm8(r, base, disp),
                (8, true) => asm.movsx_rm8(r, base, disp),
                (16, false) => asm.movzx_rm16(r, base, disp),
                (16, true) => asm.movsx_rm16(r, base, disp),
                (32, false) => asm.mov_rm32(r, base, disp),
                (32, true) => asm.mov_rm32_sx(r, base, disp),
                (64, _) => asm.mov_rm(r, base, disp),
                _ => unreachable!(),
            }
        }
        if let Operand::Mem(b, d) = out {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_mr(b, d, r);
        }
        jit.st.set_out_type(instr, tag);
        Ok(Flow::Next)
    }

    fn gen_store(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
        width: u8,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();

        let (base, disp) = self.gen_addr(jit, instr)?;
        let size = if width == 64 { 64 } else { 32 };
        let v = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 2, size, regs::SCR2, false)?;
        let vr = Self::opnd_reg(v);
        let mut asm = Asm::new(&mut self.cb);
        match width {
            8 => asm.mov_mr8(base, disp, vr),
            16 => asm.mov_mr16(base, disp, vr),
            32 => asm.mov_mr32(base, disp, vr),
            64 => asm.mov_mr(base, disp, vr),
            _ => unreachable!(),
        }
        Ok(Flow::Next)
    }

    // ==================== Type tests ====================

    fn gen_type_test(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
        tag: TypeTag,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();

        let arg_val = match instr.args.first() {
            Some(IRArg::Val(v)) => Some(*v),
            _ => None,
        };

        // 1/2: the per-version state, then the static analysis
        let known = match instr.args.first() {
            Some(IRArg::Val(v)) => jit
                .st
                .known_type(*v)
                .or_else(|| self.hinted_type(jit.fun_id, *v)),
            Some(IRArg::Const(c)) => Some(super::state::const_word_tag(c)?.1),
            None => return Err(malformed("type test without argument")),
        };

        let fused = self.fused_if_true(jit, instr);

        if let Some(t) = known {
            let res = t == tag;
            if let Some(ift) = fused {
                // 3: collapse to a direct jump to the chosen successor
                let t_true = ift.targets[0].ok_or_else(|| malformed("if_true without target"))?;
                let t_false = ift.targets[1].ok_or_else(|| malformed("if_true without target"))?;
                let target = if res { t_true } else { t_false };
                let mut st = jit.st.clone();
                if res && self.cfg.max_versions > 0 {
                    if let Some(v) = arg_val {
                        st.set_type(v, tag);
                    }
                }
                return self.gen_branch(jit, BranchKind::Jmp, target, st, None);
            }
            let word = if res {
                const_words::TRUE
            } else {
                const_words::FALSE
            };
            jit.st.set_loc_imm(instr.out, word, TypeTag::Const);
            return Ok(Flow::Next);
        }

        // 4: compare against the type byte in the frame
        let v = arg_val.ok_or_else(|| malformed("type test on untyped constant"))?;
        let slot = fun.home_slot(v) as i32;
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.cmp_mi8(regs::TSP, slot, tag as u8);
        }

        if let Some(ift) = fused {
            let t_true = ift.targets[0].ok_or_else(|| malformed("if_true without target"))?;
            let t_false = ift.targets[1].ok_or_else(|| malformed("if_true without target"))?;
            let mut st_t = jit.st.clone();
            if self.cfg.max_versions > 0 {
                st_t.set_type(v, tag);
            }
            let st_f = jit.st.clone();
            return self.gen_branch(jit, BranchKind::Cond(Cond::E), t_true, st_t, Some((t_false, st_f)));
        }

        self.materialize_bool(jit, instr, Cond::E)
    }

    // ==================== Comparisons ====================

    fn gen_cmp_int(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
        width: u8,
        cond: Cond,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();

        let o1 = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 1, width, regs::SCR1, true)?;
        let o0 = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, width, regs::SCR0, false)?;
        let r0 = Self::opnd_reg(o0);
        {
            let mut asm = Asm::new(&mut self.cb);
            match (width, o1) {
                (64, Operand::Reg(s)) => asm.cmp_rr(r0, s),
                (64, Operand::Imm(v)) => asm.cmp_ri32(r0, v as i32),
                (_, Operand::Reg(s)) => asm.cmp_rr32(r0, s),
                (_, Operand::Imm(v)) => asm.cmp_ri32_r32(r0, v as i32),
                _ => unreachable!(),
            }
        }

        if let Some(ift) = self.fused_if_true(jit, instr) {
            let t_true = ift.targets[0].ok_or_else(|| malformed("if_true without target"))?;
            let t_false = ift.targets[1].ok_or_else(|| malformed("if_true without target"))?;
            let st = jit.st.clone();
            return self.gen_branch(jit, BranchKind::Cond(cond), t_true, st.clone(), Some((t_false, st)));
        }
        self.materialize_bool(jit, instr, cond)
    }

    /// Float comparisons follow the IEEE unordered semantics of
    /// `ucomisd`: every comparison is false on NaN except not-equal.
    fn gen_cmp_f64(&mut self, jit: &mut JitState, instr: &IRInstr) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();

        // Ordered less-than family: swap operands so unordered results
        // fall on the false side of A/AE
        let (swap, cond) = match instr.op {
            Opcode::LtF64 => (true, Cond::A),
            Opcode::LeF64 => (true, Cond::Ae),
            Opcode::GtF64 => (false, Cond::A),
            Opcode::GeF64 => (false, Cond::Ae),
            Opcode::EqF64 | Opcode::NeF64 => (false, Cond::E),
            _ => unreachable!(),
        };

        self.load_f64_arg(jit, instr, 0, 0, regs::SCR0)?;
        self.load_f64_arg(jit, instr, 1, 1, regs::SCR0)?;
        {
            let mut asm = Asm::new(&mut self.cb);
            if swap {
                asm.ucomisd(1, 0);
            } else {
                asm.ucomisd(0, 1);
            }
        }

        let eq_family = matches!(instr.op, Opcode::EqF64 | Opcode::NeF64);
        let negate = instr.op == Opcode::NeF64;

        if let Some(ift) = self.fused_if_true(jit, instr) {
            let t_true = ift.targets[0].ok_or_else(|| malformed("if_true without target"))?;
            let t_false = ift.targets[1].ok_or_else(|| malformed("if_true without target"))?;
            let st = jit.st.clone();
            let kind = if eq_family {
                BranchKind::FloatEq { negate }
            } else {
                BranchKind::Cond(cond)
            };
            return self.gen_branch(jit, kind, t_true, st.clone(), Some((t_false, st)));
        }

        if !eq_family {
            return self.materialize_bool(jit, instr, cond);
        }

        // feq: ZF and not PF; fne is its negation
        let la = live.live_after(jit.block, jit.idx);
        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, la, false, None, &[]);
        let r = match out {
            Operand::Reg(r) => r,
            _ => regs::SCR2,
        };
        {
            let mut asm = Asm::new(&mut self.cb);
            let (init, on_e, on_p) = if !negate {
                (const_words::FALSE, const_words::TRUE, const_words::FALSE)
            } else {
                (const_words::TRUE, const_words::FALSE, const_words::TRUE)
            };
            asm.mov_ri32(r, init as i32);
            asm.mov_ri32(regs::SCR0, on_e as i32);
            asm.cmovcc(Cond::E, r, regs::SCR0);
            asm.mov_ri32(regs::SCR0, on_p as i32);
            asm.cmovcc(Cond::P, r, regs::SCR0);
        }
        if let Operand::Mem(b, d) = out {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_mr(b, d, r);
        }
        jit.st.set_out_type(instr, TypeTag::Const);
        Ok(Flow::Next)
    }

    // ==================== Control ====================

    fn gen_jump(&mut self, jit: &mut JitState, instr: &IRInstr) -> Result<Flow, CodegenError> {
        let t = instr.targets[0].ok_or_else(|| malformed("jump without target"))?;
        let st = jit.st.clone();
        self.gen_branch(jit, BranchKind::Jmp, t, st, None)
    }

    fn gen_if_true(&mut self, jit: &mut JitState, instr: &IRInstr) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let t0 = instr.targets[0].ok_or_else(|| malformed("if_true without target"))?;
        let t1 = instr.targets[1].ok_or_else(|| malformed("if_true without target"))?;

        // A constant condition collapses to a jump
        if let Some(IRArg::Val(v)) = instr.args.first() {
            if let ValueLoc::Imm(w, _) = jit.st.loc(*v) {
                let target = if w == const_words::TRUE { t0 } else { t1 };
                let st = jit.st.clone();
                return self.gen_branch(jit, BranchKind::Jmp, target, st, None);
            }
        }
        if let Some(IRArg::Const(c)) = instr.args.first() {
            let (w, _) = super::state::const_word_tag(c)?;
            let target = if w == const_words::TRUE { t0 } else { t1 };
            let st = jit.st.clone();
            return self.gen_branch(jit, BranchKind::Jmp, target, st, None);
        }

        let o = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 0, 32, regs::SCR0, false)?;
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.cmp_ri32_r32(Self::opnd_reg(o), const_words::TRUE as i32);
        }
        let st = jit.st.clone();
        self.gen_branch(jit, BranchKind::Cond(Cond::E), t0, st.clone(), Some((t1, st)))
    }

    /// A jump target used only by local error paths within a version:
    /// emit the TypeError exit sequence after the terminator.
    pub(crate) fn gen_type_error_exit(&mut self, instr_ptr: *const IRInstr) {
        use crate::runtime::context::ctx_ofs;
        let mut asm = Asm::new(&mut self.cb);
        asm.sync_stack_regs();
        asm.mov_rr(Reg::Rdi, regs::VM);
        asm.mov_ri64(Reg::Rsi, instr_ptr as i64);
        asm.mov_rm(Reg::Rax, regs::VM, ctx_ofs::THROW_TYPE_ERROR);
        asm.call_r(Reg::Rax);
        asm.reload_stack_regs();
        asm.jmp_r(Reg::Rax);
    }
}
