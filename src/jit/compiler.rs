//! Code generator driver.
//!
//! Owns the code block, the version table, the link table and the
//! function registry. Compilation proceeds version by version: the
//! driver pulls a pending block version, lowers its instructions with
//! the current `CodeGenState`, and lets branch instructions request
//! successor versions. Under eager compilation the pending queue is
//! drained FIFO before the entry address is handed out; under lazy
//! compilation unrealized targets sit behind per-version stubs that
//! compile on first execution and patch themselves away.

use std::collections::HashMap;
use std::rc::Rc;

use crate::config::JitConfig;
use crate::ir::{BlockId, FunId, IRFunction, Liveness, TypeTag, ValId};
use crate::runtime::context::{ctx_ofs, ReturnPair, TaggedVal, VmContext};
use crate::runtime::funtable::FunEntryTable;
use crate::runtime::layout::{ARGC_SLOT, CLOS_SLOT, RA_SLOT, THIS_SLOT, WORD_SIZE};
use crate::runtime::linktable::LinkTable;
use crate::runtime::pcache::PropCache;
use crate::runtime::stacks::ShadowStacks;

use super::codebuf::CodeBlock;
use super::state::CodeGenState;
use super::versions::{BranchShape, RefKind, VersionId, VersionTable};
use super::x86_64::{regs, Asm, Cond, Reg};
use super::CodegenError;

/// Pluggable static type analysis, consulted alongside the per-version
/// state when `JitConfig::typeprop` is set.
pub trait TypeHints {
    fn value_type(&self, fun: FunId, val: ValId) -> Option<TypeTag>;
}

/// Signature of the generated entry thunk.
type EntryThunkFn =
    unsafe extern "C" fn(*mut VmContext, *mut u64, *mut u8, *const u8) -> ReturnPair;

/// Per-version lowering context.
pub(crate) struct JitState {
    pub fun_id: FunId,
    pub fun: Rc<IRFunction>,
    pub live: Rc<Liveness>,
    pub block: BlockId,
    /// Index of the instruction being lowered
    pub idx: usize,
    pub st: CodeGenState,
}

/// What the instruction lowering decided about control flow.
pub(crate) enum Flow {
    /// Continue with the next instruction
    Next,
    /// The version ends here; optionally fall through into a successor
    End(Option<VersionId>),
}

/// Branch encodings understood by `gen_branch`.
pub(crate) enum BranchKind {
    Jmp,
    Cond(Cond),
    /// Float equality: true iff ZF set and PF clear after `ucomisd`;
    /// `negate` selects the not-equal variant
    FloatEq { negate: bool },
}

pub struct Codegen {
    pub(crate) cfg: JitConfig,
    pub(crate) cb: CodeBlock,
    pub(crate) vt: VersionTable,
    pub(crate) link: LinkTable,
    funs: Vec<Rc<IRFunction>>,
    liveness: Vec<Rc<Liveness>>,
    pub(crate) fun_entries: FunEntryTable,
    pub(crate) prims: HashMap<String, FunId>,
    pub(crate) vm: *mut VmContext,
    hints: Option<Box<dyn TypeHints>>,
    /// Property-index caches owned by emission sites (stable addresses)
    pub(crate) caches: Vec<Box<PropCache>>,
    /// Interned string literals already given a link cell
    pub(crate) str_links: HashMap<String, u32>,
    /// Versions that need a compile stub once the current version's
    /// body is finished
    pending_stubs: Vec<VersionId>,
    entry_thunk: usize,
    pub(crate) exit_stub: usize,
}

const MAX_FUNS: usize = 4096;

impl Codegen {
    /// Build a code generator bound to a VM context. The context
    /// receives the link-table and function-table base pointers and
    /// the lazy-compilation callbacks.
    pub fn new(cfg: JitConfig, vm: &mut VmContext) -> Result<Box<Codegen>, CodegenError> {
        let mut cb = CodeBlock::new(cfg.code_heap_size)?;
        let link = LinkTable::with_capacity(cfg.link_table_size);
        let fun_entries = FunEntryTable::new(MAX_FUNS);

        let (entry_thunk, exit_stub) = Self::emit_entry_thunk(&mut cb);
        if cb.overflowed() {
            return Err(CodegenError::BufferOverflow);
        }

        let mut cg = Box::new(Codegen {
            cfg,
            cb,
            vt: VersionTable::new(),
            link,
            funs: Vec::new(),
            liveness: Vec::new(),
            fun_entries,
            prims: HashMap::new(),
            vm,
            hints: None,
            caches: Vec::new(),
            str_links: HashMap::new(),
            pending_stubs: Vec::new(),
            entry_thunk,
            exit_stub,
        });

        vm.link_words = cg.link.words_base();
        vm.link_tags = cg.link.tags_base();
        vm.fun_entries = cg.fun_entries.entry_ptr(0);
        vm.codegen = &mut *cg as *mut Codegen as *mut std::ffi::c_void;
        vm.compile_block = compile_block_cb;
        vm.compile_fun = compile_fun_cb;
        Ok(cg)
    }

    /// Register an IR function. Its entry-code cell initially points at
    /// a compile stub so dynamic calls can reach it before compilation.
    pub fn add_function(&mut self, fun: IRFunction) -> FunId {
        let fid = FunId(self.funs.len() as u32);
        let live = Liveness::analyze(&fun);
        let idx = self
            .fun_entries
            .push(fun.num_params as u32, fun.num_slots as u32);
        debug_assert_eq!(idx, fid.0 as usize);
        self.funs.push(Rc::new(fun));
        self.liveness.push(Rc::new(live));

        let stub = self.emit_fun_stub(fid);
        self.fun_entries.set_entry(fid.0 as usize, self.cb.addr(stub));
        fid
    }

    /// Install a host-registered primitive under a global name, making
    /// it resolvable by `CallPrim` at compile time.
    pub fn register_prim(&mut self, name: &str, fun: FunId) {
        self.prims.insert(name.to_string(), fun);
    }

    pub fn set_type_hints(&mut self, hints: Box<dyn TypeHints>) {
        self.hints = Some(hints);
    }

    pub fn config(&self) -> &JitConfig {
        &self.cfg
    }

    pub fn function(&self, fid: FunId) -> &Rc<IRFunction> {
        &self.funs[fid.0 as usize]
    }

    /// The version table, for inspection.
    pub fn versions(&self) -> &VersionTable {
        &self.vt
    }

    /// Copy out emitted bytes, for inspection.
    pub fn code_bytes(&self, start: usize, end: usize) -> Vec<u8> {
        self.cb.code_range(start, end)
    }

    /// Address of the exit stub a unit frame's return address points
    /// at. Useful to host unwinders terminating at the outermost frame.
    pub fn exit_stub_addr(&self) -> u64 {
        self.cb.addr(self.exit_stub)
    }

    pub(crate) fn hinted_type(&self, fun: FunId, v: ValId) -> Option<TypeTag> {
        if !self.cfg.typeprop {
            return None;
        }
        self.hints.as_ref()?.value_type(fun, v)
    }

    // ==================== Entry points ====================

    /// Compile a function's entry version (draining the pending queue
    /// under eager compilation) and install its entry address.
    pub fn compile_function(&mut self, fid: FunId) -> Result<*const u8, CodegenError> {
        let fun = self.funs[fid.0 as usize].clone();
        let vid = self.request_version(fid, fun.entry, CodeGenState::new());
        self.realize_chain(vid)?;

        let start = self.vt.get(vid).start.expect("entry version not realized");
        let addr = self.cb.addr(start);
        self.fun_entries.set_entry(fid.0 as usize, addr);
        Ok(addr as *const u8)
    }

    /// Run a compiled unit function on the given shadow stacks.
    ///
    /// # Safety
    /// Executes generated code. The VM context must outlive the call
    /// and the host functions it points to must uphold their contracts.
    /// Lazy compilation re-enters this code generator through the
    /// context's raw back pointer.
    pub unsafe fn call_unit(
        &mut self,
        fid: FunId,
        stacks: &mut ShadowStacks,
        args: &[TaggedVal],
    ) -> Result<ReturnPair, CodegenError> {
        let fun = self.funs[fid.0 as usize].clone();
        if args.len() != fun.num_params as usize {
            return Err(CodegenError::MalformedIr(format!(
                "unit call arity mismatch: {} args for {} params",
                args.len(),
                fun.num_params
            )));
        }

        let entry = if self.cfg.eager {
            self.compile_function(fid)?
        } else {
            self.fun_entries.entry(fid.0 as usize).entry_code as *const u8
        };

        let frame = fun.num_slots as usize;
        let exit = self.cb.addr(self.exit_stub);
        stacks.write_slot_raw(frame, RA_SLOT as usize, exit, TypeTag::RawPtr as u8);
        stacks.write_slot(frame, CLOS_SLOT as usize, TaggedVal::undef());
        stacks.write_slot(frame, THIS_SLOT as usize, TaggedVal::undef());
        stacks.write_slot(frame, ARGC_SLOT as usize, TaggedVal::int32(args.len() as i32));
        for (i, a) in args.iter().enumerate() {
            stacks.write_slot(frame, (RA_SLOT + 4 + i as u16) as usize, *a);
        }

        let (wsp, tsp) = stacks.frame_base(frame);
        let thunk: EntryThunkFn =
            unsafe { std::mem::transmute(self.cb.addr(self.entry_thunk) as *const u8) };
        Ok(unsafe { thunk(self.vm, wsp, tsp, entry) })
    }

    /// Entry point of the lazy-compilation callbacks.
    pub(crate) fn realize_for_stub(&mut self, vid: VersionId) -> Result<u64, CodegenError> {
        if self.vt.get(vid).start.is_none() {
            self.realize_chain(vid)?;
        }
        let start = self.vt.get(vid).start.expect("stub target not realized");
        Ok(self.cb.addr(start))
    }

    pub(crate) fn compile_fun_for_stub(&mut self, fid: FunId) -> Result<u64, CodegenError> {
        Ok(self.compile_function(fid)? as u64)
    }

    // ==================== Version machinery ====================

    /// Intern a successor version for `state` restricted to the values
    /// live at the block entry. New versions are queued under eager
    /// compilation.
    pub(crate) fn request_version(
        &mut self,
        fid: FunId,
        block: BlockId,
        state: CodeGenState,
    ) -> VersionId {
        let live = self.liveness[fid.0 as usize].clone();
        let live_in = live.block_live_in(block);
        let st = state.filtered(live_in);
        let key = st.canonical_key(live_in);
        let (vid, fresh) = self.vt.intern(fid, block, key, st);
        if fresh && self.cfg.eager {
            self.vt.queue.push_back(vid);
        }
        vid
    }

    /// Intern a call-continuation version: same interning discipline as
    /// `request_version`, but keyed apart from plain branch targets and
    /// carrying the return-register store slot.
    pub(crate) fn request_cont_version(
        &mut self,
        fid: FunId,
        block: BlockId,
        state: CodeGenState,
        cont_slot: u16,
    ) -> VersionId {
        let live = self.liveness[fid.0 as usize].clone();
        let live_in = live.block_live_in(block);
        let st = state.filtered(live_in);
        let key = st.canonical_key(live_in).with_cont(cont_slot);
        let (vid, fresh) = self.vt.intern(fid, block, key, st);
        if fresh {
            self.vt.get_mut(vid).cont_store = Some(cont_slot);
            if self.cfg.eager {
                self.vt.queue.push_back(vid);
            }
        }
        vid
    }

    /// Realize `root`, following fall-through chains, then drain the
    /// pending queue under eager compilation.
    pub(crate) fn realize_chain(&mut self, root: VersionId) -> Result<(), CodegenError> {
        let mut next = Some(root);
        loop {
            while let Some(v) = next {
                next = self.realize_one(v)?;
            }
            if !self.cfg.eager {
                return Ok(());
            }
            match self.vt.queue.pop_front() {
                Some(v) if self.vt.get(v).start.is_none() => next = Some(v),
                Some(_) => continue,
                None => return Ok(()),
            }
        }
    }

    /// Emit one version. Returns the successor chosen as fall-through,
    /// which must be realized immediately after.
    fn realize_one(&mut self, vid: VersionId) -> Result<Option<VersionId>, CodegenError> {
        if self.vt.get(vid).start.is_some() {
            return Ok(None);
        }

        self.vt.get_mut(vid).in_progress = true;
        let (fid, block, state, cont_store) = {
            let v = self.vt.get(vid);
            (v.fun, v.block, v.state.clone(), v.cont_store)
        };
        let fun = self.funs[fid.0 as usize].clone();
        if self.cfg.trace {
            eprintln!(
                "[JIT] realize v{} fn '{}' block {} ({} versions)",
                vid.0,
                fun.name,
                block.0,
                self.vt.count(fid, block)
            );
        }

        let start = self.cb.pos();

        // Call continuations read the return registers into the call's
        // out slot before the block body runs
        if let Some(slot) = cont_store {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_mr(regs::WSP, slot as i32 * WORD_SIZE, regs::RET_WORD);
            asm.mov_mr8(regs::TSP, slot as i32, regs::RET_TYPE);
        }

        let mut jit = JitState {
            fun_id: fid,
            fun,
            live: self.liveness[fid.0 as usize].clone(),
            block,
            idx: 0,
            st: state,
        };

        let fallthrough = loop {
            let flow = self.lower_instr(&mut jit)?;
            if self.cb.overflowed() {
                return Err(CodegenError::BufferOverflow);
            }
            match flow {
                Flow::Next => jit.idx += 1,
                Flow::End(ft) => break ft,
            }
        };

        let end = self.cb.pos();
        let refs = self.vt.mark_realized(vid, start, end);
        for r in refs {
            match r.kind {
                RefKind::Rel32 => self.cb.patch_rel32(r.ofs, start),
                RefKind::Abs64 => {
                    let addr = self.cb.addr(start);
                    self.cb.patch_u64(r.ofs, addr);
                }
            }
        }

        // Targets referenced lazily get their stubs now that the body
        // is complete
        let pend = std::mem::take(&mut self.pending_stubs);
        for t in pend {
            self.ensure_stub(t)?;
        }

        debug_assert!(!self.cb.has_pending_labels(), "unbound local label");
        Ok(fallthrough)
    }

    /// Emit a compile-on-first-reach stub for an unrealized version and
    /// repoint its existing references at it.
    fn ensure_stub(&mut self, vid: VersionId) -> Result<(), CodegenError> {
        if self.vt.get(vid).start.is_some() || self.vt.get(vid).stub.is_some() {
            return Ok(());
        }
        let ofs = self.cb.pos();
        {
            let mut asm = Asm::new(&mut self.cb);
            asm.save_jit_regs();
            asm.sync_stack_regs();
            asm.mov_rr(Reg::Rdi, regs::VM);
            asm.mov_ri32(Reg::Rsi, vid.0 as i32);
            asm.mov_rm(Reg::Rax, regs::VM, ctx_ofs::COMPILE_BLOCK);
            asm.call_r(Reg::Rax);
            asm.load_jit_regs();
            asm.jmp_r(Reg::Rax);
        }
        if self.cb.overflowed() {
            return Err(CodegenError::BufferOverflow);
        }
        self.vt.set_stub(vid, ofs);
        if self.cfg.trace {
            eprintln!("[JIT] stub for v{} at {:#x}", vid.0, ofs);
        }

        let refs = self.vt.get(vid).refs.clone();
        let stub_addr = self.cb.addr(ofs);
        for r in refs {
            match r.kind {
                RefKind::Rel32 => self.cb.patch_rel32(r.ofs, ofs),
                RefKind::Abs64 => self.cb.patch_u64(r.ofs, stub_addr),
            }
        }
        Ok(())
    }

    /// Per-function compile stub reached through the entry-code cell of
    /// `FunEntry` before the function is compiled.
    fn emit_fun_stub(&mut self, fid: FunId) -> usize {
        let ofs = self.cb.pos();
        let mut asm = Asm::new(&mut self.cb);
        asm.save_jit_regs();
        asm.sync_stack_regs();
        asm.mov_rr(Reg::Rdi, regs::VM);
        asm.mov_ri32(Reg::Rsi, fid.0 as i32);
        asm.mov_rm(Reg::Rax, regs::VM, ctx_ofs::COMPILE_FUN);
        asm.call_r(Reg::Rax);
        asm.load_jit_regs();
        asm.jmp_r(Reg::Rax);
        ofs
    }

    // ==================== Branch emission ====================

    /// Emit a jump to a version: direct when realized, otherwise a
    /// recorded reference (temporarily pointing at the stub if any).
    pub(crate) fn emit_jump_to(&mut self, target: VersionId) {
        let (start, stub) = {
            let v = self.vt.get(target);
            (v.start, v.stub)
        };
        match start {
            Some(s) => {
                let pos = self.cb.pos();
                let mut asm = Asm::new(&mut self.cb);
                asm.jmp_rel32((s as i64 - (pos as i64 + 5)) as i32);
            }
            None => {
                let ofs = {
                    let mut asm = Asm::new(&mut self.cb);
                    asm.jmp_rel32_patchable()
                };
                if let Some(stub_ofs) = stub {
                    self.cb.patch_rel32(ofs, stub_ofs);
                } else if !self.cfg.eager {
                    self.pending_stubs.push(target);
                }
                self.vt.record_ref(target, ofs, RefKind::Rel32);
            }
        }
    }

    /// Emit a conditional jump to a version.
    pub(crate) fn emit_jcc_to(&mut self, cond: Cond, target: VersionId) {
        let (start, stub) = {
            let v = self.vt.get(target);
            (v.start, v.stub)
        };
        match start {
            Some(s) => {
                let pos = self.cb.pos();
                let mut asm = Asm::new(&mut self.cb);
                asm.jcc_rel32(cond, (s as i64 - (pos as i64 + 6)) as i32);
            }
            None => {
                let ofs = {
                    let mut asm = Asm::new(&mut self.cb);
                    asm.jcc_rel32_patchable(cond)
                };
                if let Some(stub_ofs) = stub {
                    self.cb.patch_rel32(ofs, stub_ofs);
                } else if !self.cfg.eager {
                    self.pending_stubs.push(target);
                }
                self.vt.record_ref(target, ofs, RefKind::Rel32);
            }
        }
    }

    /// Load a version's absolute address into `dst` (for return
    /// addresses), recording the imm64 field for patching.
    pub(crate) fn emit_code_addr(&mut self, dst: Reg, target: VersionId) {
        let (start, stub) = {
            let v = self.vt.get(target);
            (v.start, v.stub)
        };
        let ofs = {
            let mut asm = Asm::new(&mut self.cb);
            asm.mov_ri64_patchable(dst)
        };
        match start {
            Some(s) => {
                let addr = self.cb.addr(s);
                self.cb.patch_u64(ofs, addr);
            }
            None => {
                if let Some(stub_ofs) = stub {
                    let addr = self.cb.addr(stub_ofs);
                    self.cb.patch_u64(ofs, addr);
                } else if !self.cfg.eager {
                    self.pending_stubs.push(target);
                }
                self.vt.record_ref(target, ofs, RefKind::Abs64);
            }
        }
    }

    /// Request one or two successor versions, decide the block layout
    /// shape, and emit the minimal jump sequence for `kind`. Degrades
    /// to generic successor states when the per-block version cap would
    /// be exceeded (always, when the cap is zero).
    pub(crate) fn gen_branch(
        &mut self,
        jit: &mut JitState,
        kind: BranchKind,
        t0: BlockId,
        st0: CodeGenState,
        t1: Option<(BlockId, CodeGenState)>,
    ) -> Result<Flow, CodegenError> {
        let fid = jit.fun_id;
        let fun = jit.fun.clone();
        let live = jit.live.clone();

        let mut st0 = st0;
        let mut t1 = t1;

        // Version-cap degradation: spill everything and request generic
        // successors
        let over = {
            let key0 = st0
                .filtered(live.block_live_in(t0))
                .canonical_key(live.block_live_in(t0));
            let over0 = self.vt.over_cap(fid, t0, &key0, self.cfg.max_versions);
            let over1 = t1.as_ref().is_some_and(|(b, s)| {
                let key = s
                    .filtered(live.block_live_in(*b))
                    .canonical_key(live.block_live_in(*b));
                self.vt.over_cap(fid, *b, &key, self.cfg.max_versions)
            });
            over0 || over1
        };
        if over {
            jit.st.spill_values(&mut self.cb, &fun, |_| true);
            st0 = CodeGenState::new();
            t1 = t1.map(|(b, _)| (b, CodeGenState::new()));
        }

        let v0 = self.request_version(fid, t0, st0);
        let v1 = t1.map(|(b, s)| self.request_version(fid, b, s));

        // Both edges reaching the same version collapses to a jump
        let kind = if v1 == Some(v0) { BranchKind::Jmp } else { kind };

        let shape = if self.vt.can_fall_through(v0) {
            BranchShape::Next0
        } else if v1.is_some() && self.vt.can_fall_through(v1.unwrap()) {
            BranchShape::Next1
        } else {
            BranchShape::Default
        };

        match kind {
            BranchKind::Jmp => {
                if self.vt.can_fall_through(v0) {
                    return Ok(Flow::End(Some(v0)));
                }
                self.emit_jump_to(v0);
                Ok(Flow::End(None))
            }
            BranchKind::Cond(cc) => {
                let v1 = v1.expect("conditional branch needs two targets");
                match shape {
                    BranchShape::Next0 => {
                        self.emit_jcc_to(cc.invert(), v1);
                        Ok(Flow::End(Some(v0)))
                    }
                    BranchShape::Next1 => {
                        self.emit_jcc_to(cc, v0);
                        Ok(Flow::End(Some(v1)))
                    }
                    BranchShape::Default => {
                        self.emit_jcc_to(cc, v0);
                        self.emit_jump_to(v1);
                        Ok(Flow::End(None))
                    }
                }
            }
            BranchKind::FloatEq { negate } => {
                let v1 = v1.expect("float equality branch needs two targets");
                if !negate {
                    // true iff ZF=1 and PF=0
                    self.emit_jcc_to(Cond::P, v1);
                    match shape {
                        BranchShape::Next0 => {
                            self.emit_jcc_to(Cond::Ne, v1);
                            Ok(Flow::End(Some(v0)))
                        }
                        BranchShape::Next1 => {
                            self.emit_jcc_to(Cond::E, v0);
                            Ok(Flow::End(Some(v1)))
                        }
                        BranchShape::Default => {
                            self.emit_jcc_to(Cond::E, v0);
                            self.emit_jump_to(v1);
                            Ok(Flow::End(None))
                        }
                    }
                } else {
                    // true iff PF=1 or ZF=0
                    self.emit_jcc_to(Cond::P, v0);
                    match shape {
                        BranchShape::Next0 => {
                            self.emit_jcc_to(Cond::E, v1);
                            Ok(Flow::End(Some(v0)))
                        }
                        BranchShape::Next1 => {
                            self.emit_jcc_to(Cond::Ne, v0);
                            Ok(Flow::End(Some(v1)))
                        }
                        BranchShape::Default => {
                            self.emit_jcc_to(Cond::Ne, v0);
                            self.emit_jump_to(v1);
                            Ok(Flow::End(None))
                        }
                    }
                }
            }
        }
    }

    // ==================== Bridge code ====================

    /// The host-to-JIT entry thunk and the exit stub. The thunk loads
    /// the reserved registers from its C arguments and calls the entry
    /// version; a returning function jumps through its frame's return
    /// address to the exit stub, whose `ret` lands back in the thunk.
    fn emit_entry_thunk(cb: &mut CodeBlock) -> (usize, usize) {
        let thunk = cb.pos();
        {
            let mut asm = Asm::new(cb);
            asm.push(Reg::Rbx);
            asm.push(Reg::Rbp);
            asm.push(Reg::R12);
            asm.push(Reg::R13);
            asm.push(Reg::R14);
            asm.push(Reg::R15);
            asm.mov_rr(regs::VM, Reg::Rdi);
            asm.mov_rr(regs::WSP, Reg::Rsi);
            asm.mov_rr(regs::TSP, Reg::Rdx);
            asm.call_r(Reg::Rcx);
            // Return pair: word in RAX, tag in RDX
            asm.mov_rr(Reg::Rax, regs::RET_WORD);
            asm.mov_rr(Reg::Rdx, regs::RET_TYPE);
            asm.pop(Reg::R15);
            asm.pop(Reg::R14);
            asm.pop(Reg::R13);
            asm.pop(Reg::R12);
            asm.pop(Reg::Rbp);
            asm.pop(Reg::Rbx);
            asm.ret();
        }
        let exit = cb.pos();
        {
            let mut asm = Asm::new(cb);
            asm.ret();
        }
        (thunk, exit)
    }
}

/// Lazy-compilation callback: a version stub lands here.
extern "C" fn compile_block_cb(vm: *mut VmContext, vid: u32) -> *const u8 {
    unsafe {
        let cg = (*vm).codegen as *mut Codegen;
        match (*cg).realize_for_stub(VersionId(vid)) {
            Ok(addr) => addr as *const u8,
            Err(e) => {
                eprintln!("[JIT] fatal: {}", e);
                std::process::abort();
            }
        }
    }
}

/// Lazy-compilation callback: a function-entry stub lands here.
extern "C" fn compile_fun_cb(vm: *mut VmContext, fid: u32) -> *const u8 {
    unsafe {
        let cg = (*vm).codegen as *mut Codegen;
        match (*cg).compile_fun_for_stub(FunId(fid)) {
            Ok(addr) => addr as *const u8,
            Err(e) => {
                eprintln!("[JIT] fatal: {}", e);
                std::process::abort();
            }
        }
    }
}
