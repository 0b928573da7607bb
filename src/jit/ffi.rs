//! Foreign-function calls.
//!
//! The IR carries a signature string `"ret,arg0,arg1,…"` over the
//! primitive C types. Integer and pointer arguments fill the System V
//! integer argument registers in order, floats fill the XMM registers,
//! and overflow goes to the native stack in reverse order with a
//! scratch slot inserted when the stack-argument count is odd, keeping
//! RSP 16-byte aligned at the call.

use crate::ir::{Const, IRArg, IRInstr, TypeTag};
use crate::runtime::layout::WORD_SIZE;

use super::compiler::{Codegen, Flow, JitState};
use super::state::Operand;
use super::x86_64::{regs, Asm, Reg};
use super::CodegenError;

/// C-level types recognized in FFI signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F64,
    Ptr,
    Void,
}

impl FfiType {
    fn parse(s: &str) -> Result<FfiType, CodegenError> {
        match s {
            "i8" => Ok(FfiType::I8),
            "i16" => Ok(FfiType::I16),
            "i32" => Ok(FfiType::I32),
            "i64" => Ok(FfiType::I64),
            "u8" => Ok(FfiType::U8),
            "u16" => Ok(FfiType::U16),
            "u32" => Ok(FfiType::U32),
            "u64" => Ok(FfiType::U64),
            "f64" => Ok(FfiType::F64),
            "*" => Ok(FfiType::Ptr),
            "void" => Ok(FfiType::Void),
            _ => Err(CodegenError::MalformedIr(format!(
                "bad FFI type '{}'",
                s
            ))),
        }
    }

    pub fn is_float(self) -> bool {
        self == FfiType::F64
    }

    /// Type tag of the value produced from a C return of this type.
    pub fn ret_tag(self) -> Option<TypeTag> {
        match self {
            FfiType::I8 | FfiType::I16 | FfiType::I32 | FfiType::U8 | FfiType::U16
            | FfiType::U32 => Some(TypeTag::Int32),
            FfiType::I64 | FfiType::U64 => Some(TypeTag::Int64),
            FfiType::F64 => Some(TypeTag::Float64),
            FfiType::Ptr => Some(TypeTag::RawPtr),
            FfiType::Void => None,
        }
    }
}

/// A parsed FFI signature.
#[derive(Debug, Clone)]
pub struct FfiSig {
    pub ret: FfiType,
    pub args: Vec<FfiType>,
}

impl FfiSig {
    pub fn parse(sig: &str) -> Result<FfiSig, CodegenError> {
        let mut parts = sig.split(',');
        let ret = FfiType::parse(
            parts
                .next()
                .ok_or_else(|| CodegenError::MalformedIr("empty FFI signature".to_string()))?
                .trim(),
        )?;
        let mut args = Vec::new();
        for p in parts {
            let t = FfiType::parse(p.trim())?;
            if t == FfiType::Void {
                return Err(CodegenError::MalformedIr(
                    "void FFI argument".to_string(),
                ));
            }
            args.push(t);
        }
        Ok(FfiSig { ret, args })
    }
}

/// System V integer argument registers, in assignment order.
const INT_ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];
const NUM_XMM_ARGS: usize = 8;

/// Where each argument of a signature travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSlot {
    IntReg(Reg),
    Xmm(u8),
    Stack(usize),
}

/// Assign argument positions per the C ABI. Returns the slot of each
/// argument and the number of stack slots used.
pub fn classify_args(args: &[FfiType]) -> (Vec<ArgSlot>, usize) {
    let mut slots = Vec::with_capacity(args.len());
    let mut next_int = 0;
    let mut next_xmm = 0;
    let mut next_stack = 0;
    for t in args {
        if t.is_float() {
            if next_xmm < NUM_XMM_ARGS {
                slots.push(ArgSlot::Xmm(next_xmm as u8));
                next_xmm += 1;
            } else {
                slots.push(ArgSlot::Stack(next_stack));
                next_stack += 1;
            }
        } else if next_int < INT_ARG_REGS.len() {
            slots.push(ArgSlot::IntReg(INT_ARG_REGS[next_int]));
            next_int += 1;
        } else {
            slots.push(ArgSlot::Stack(next_stack));
            next_stack += 1;
        }
    }
    (slots, next_stack)
}

impl Codegen {
    /// Lower `call_ffi(sig, fptr, args…)`.
    pub(crate) fn gen_call_ffi(
        &mut self,
        jit: &mut JitState,
        instr: &IRInstr,
    ) -> Result<Flow, CodegenError> {
        let fun = jit.fun.clone();
        let live = jit.live.clone();
        let la = live.live_after(jit.block, jit.idx).clone();

        let sig = match instr.args.first() {
            Some(IRArg::Const(Const::Str(s))) => FfiSig::parse(s)?,
            _ => {
                return Err(CodegenError::MalformedIr(
                    "call_ffi needs a signature string".to_string(),
                ))
            }
        };
        let nargs = instr.args.len().saturating_sub(2);
        if nargs != sig.args.len() {
            return Err(CodegenError::MalformedIr(format!(
                "FFI call passes {} arguments for signature of {}",
                nargs,
                sig.args.len()
            )));
        }

        // Everything must be readable from frame homes: the marshaling
        // below owns all the argument registers
        let lb = Self::ffi_live_before(jit, instr);
        jit.st
            .spill_values(&mut self.cb, &fun, |v| lb.contains(&v));

        let (slots, n_stack) = classify_args(&sig.args);
        let pad = n_stack % 2 == 1;

        {
            let mut asm = Asm::new(&mut self.cb);
            asm.save_jit_regs();
            asm.sync_stack_regs();
        }

        // Callee pointer first, into a register the ABI leaves free
        let fp = jit
            .st
            .get_word_opnd(&mut self.cb, &fun, instr, 1, 64, Reg::R10, false)?;
        self.mov_to_reg64(Reg::R10, fp);

        // Stack overflow arguments, pushed in reverse order
        if pad {
            let mut asm = Asm::new(&mut self.cb);
            asm.sub_ri32(Reg::Rsp, 8);
        }
        for (i, slot) in slots.iter().enumerate().rev() {
            if let ArgSlot::Stack(_) = slot {
                let w = jit
                    .st
                    .get_word_opnd(&mut self.cb, &fun, instr, 2 + i, 64, regs::SCR0, false)?;
                let wr = match w {
                    Operand::Reg(r) => r,
                    _ => unreachable!(),
                };
                let mut asm = Asm::new(&mut self.cb);
                asm.push(wr);
            }
        }

        // Float registers
        let mut n_xmm = 0;
        for (i, slot) in slots.iter().enumerate() {
            if let ArgSlot::Xmm(x) = slot {
                self.load_f64_arg(jit, instr, 2 + i, *x, regs::SCR0)?;
                n_xmm += 1;
            }
        }

        // Integer registers
        for (i, slot) in slots.iter().enumerate() {
            if let ArgSlot::IntReg(r) = slot {
                let w = jit
                    .st
                    .get_word_opnd(&mut self.cb, &fun, instr, 2 + i, 64, *r, false)?;
                self.mov_to_reg64(*r, w);
            }
        }

        {
            let mut asm = Asm::new(&mut self.cb);
            // Vector-register count for variadic callees
            asm.mov_ri32(Reg::Rax, n_xmm);
            asm.call_r(Reg::R10);
            let pop_bytes = (n_stack + pad as usize) as i32 * WORD_SIZE;
            if pop_bytes > 0 {
                asm.add_ri32(Reg::Rsp, pop_bytes);
            }
            asm.load_jit_regs();
        }
        jit.st.clobber_regs();

        // Return value per signature
        match sig.ret {
            FfiType::Void => {
                jit.st
                    .set_loc_imm(instr.out, crate::ir::const_words::UNDEF, TypeTag::Const);
                return Ok(Flow::Next);
            }
            _ => {}
        }

        let out = jit
            .st
            .get_out_opnd(&mut self.cb, &fun, instr, &la, false, None, &[]);
        let r = match out {
            Operand::Reg(r) => r,
            _ => unreachable!("ffi out is always a register"),
        };
        {
            let mut asm = Asm::new(&mut self.cb);
            match sig.ret {
                FfiType::I8 => asm.movsx_r64_r8(r, Reg::Rax),
                FfiType::I16 => asm.movsx_r64_r16(r, Reg::Rax),
                FfiType::I32 => asm.movsxd(r, Reg::Rax),
                FfiType::U8 => asm.movzx_r64_r8(r, Reg::Rax),
                FfiType::U16 => asm.movzx_r64_r16(r, Reg::Rax),
                FfiType::U32 => asm.mov_rr32(r, Reg::Rax),
                FfiType::I64 | FfiType::U64 | FfiType::Ptr => {
                    if r != Reg::Rax {
                        asm.mov_rr(r, Reg::Rax);
                    }
                }
                FfiType::F64 => asm.movq_r64_xmm(r, 0),
                FfiType::Void => unreachable!(),
            }
        }
        jit.st.set_out_type(instr, sig.ret.ret_tag().unwrap());
        Ok(Flow::Next)
    }

    fn ffi_live_before(
        jit: &JitState,
        instr: &IRInstr,
    ) -> std::collections::HashSet<crate::ir::ValId> {
        let mut set = jit.live.live_after(jit.block, jit.idx).clone();
        for arg in &instr.args {
            if let IRArg::Val(v) = arg {
                set.insert(*v);
            }
        }
        set
    }
}
