//! In-process execution tests: build IR directly, compile it, run the
//! emitted code and check the observable word-and-tag results.

#![cfg(all(target_arch = "x86_64", unix))]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use corvus::ir::{Const, FunId, FunctionBuilder, Opcode, TypeTag};
use corvus::runtime::layout;
use corvus::runtime::{FunEntry, ShadowStacks, TaggedVal, VmContext};
use corvus::{Codegen, JitConfig};

fn setup(cfg: JitConfig) -> (Box<VmContext>, Box<Codegen>) {
    let mut vm = VmContext::new();
    let cg = Codegen::new(cfg, &mut vm).unwrap();
    (vm, cg)
}

fn run(
    cg: &mut Codegen,
    fid: FunId,
    args: &[TaggedVal],
) -> TaggedVal {
    let mut stacks = ShadowStacks::new(256);
    let ret = unsafe { cg.call_unit(fid, &mut stacks, args).unwrap() };
    ret.to_tagged().expect("bad return tag")
}

fn unit_ret_i32(b: &mut FunctionBuilder, n: i32) {
    let v = b.emit(Opcode::Mov, vec![n.into()]);
    b.emit(Opcode::Ret, vec![v.into()]);
}

// ==================== Arithmetic ====================

#[test]
fn test_add_i32() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("add", 2);
    let v = b.emit(Opcode::AddI32, vec![b.param(0).into(), b.param(1).into()]);
    b.emit(Opcode::Ret, vec![v.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[TaggedVal::int32(5), TaggedVal::int32(7)]);
    assert_eq!(r.as_i32(), 12);
    assert_eq!(r.tag, TypeTag::Int32);

    let r = run(&mut cg, fid, &[TaggedVal::int32(-5), TaggedVal::int32(2)]);
    assert_eq!(r.as_i32(), -3);
}

#[test]
fn test_arith_constants_and_sub_mul() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("mix", 1);
    let p = b.param(0);
    let a = b.emit(Opcode::MulI32, vec![p.into(), 3.into()]);
    let c = b.emit(Opcode::SubI32, vec![a.into(), 4.into()]);
    let d = b.emit(Opcode::XorI32, vec![c.into(), 0xff.into()]);
    b.emit(Opcode::Ret, vec![d.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[TaggedVal::int32(10)]);
    assert_eq!(r.as_i32(), (10 * 3 - 4) ^ 0xff);
}

#[test]
fn test_add_i32_overflow_edge() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("add_ovf", 2);
    let ok = b.new_block();
    let ovf = b.new_block();
    let v = b.emit_branch(
        Opcode::AddI32,
        vec![b.param(0).into(), b.param(1).into()],
        Some(ok),
        Some(ovf),
    );
    b.set_block(ok);
    b.emit(Opcode::Ret, vec![v.into()]);
    b.set_block(ovf);
    unit_ret_i32(&mut b, 999);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[TaggedVal::int32(i32::MAX), TaggedVal::int32(1)]);
    assert_eq!(r.as_i32(), 999);
    let r = run(&mut cg, fid, &[TaggedVal::int32(40), TaggedVal::int32(2)]);
    assert_eq!(r.as_i32(), 42);
}

#[test]
fn test_div_mod_and_shifts() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("divmod", 2);
    let p0 = b.param(0);
    let p1 = b.param(1);
    let q = b.emit(Opcode::DivI32, vec![p0.into(), p1.into()]);
    let m = b.emit(Opcode::ModI32, vec![p0.into(), p1.into()]);
    let s = b.emit(Opcode::LsftI32, vec![q.into(), 4.into()]);
    let t = b.emit(Opcode::LsftI32, vec![m.into(), q.into()]);
    let u = b.emit(Opcode::OrI32, vec![s.into(), t.into()]);
    b.emit(Opcode::Ret, vec![u.into()]);
    let fid = cg.add_function(b.finish());

    // 17 / 5 = 3, 17 % 5 = 2; (3 << 4) | (2 << 3) = 48 | 16
    let r = run(&mut cg, fid, &[TaggedVal::int32(17), TaggedVal::int32(5)]);
    assert_eq!(r.as_i32(), (3 << 4) | (2 << 3));
}

#[test]
fn test_negative_division_truncates() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("negdiv", 2);
    let q = b.emit(Opcode::DivI32, vec![b.param(0).into(), b.param(1).into()]);
    b.emit(Opcode::Ret, vec![q.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[TaggedVal::int32(-7), TaggedVal::int32(2)]);
    assert_eq!(r.as_i32(), -3);
}

// ==================== Floats ====================

#[test]
fn test_float_arith() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("fadd", 2);
    let v = b.emit(Opcode::AddF64, vec![b.param(0).into(), b.param(1).into()]);
    let w = b.emit(Opcode::MulF64, vec![v.into(), Const::Float64(2.0).into()]);
    b.emit(Opcode::Ret, vec![w.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(
        &mut cg,
        fid,
        &[TaggedVal::float64(1.5), TaggedVal::float64(2.25)],
    );
    assert_eq!(r.tag, TypeTag::Float64);
    assert_eq!(r.as_f64(), 7.5);
}

#[test]
fn test_float_host_routed_math() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("fmath", 1);
    let s = b.emit(Opcode::SqrtF64, vec![b.param(0).into()]);
    let m = b.emit(Opcode::FmodF64, vec![s.into(), Const::Float64(2.0).into()]);
    b.emit(Opcode::Ret, vec![m.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[TaggedVal::float64(81.0)]);
    // sqrt(81) = 9, fmod(9, 2) = 1
    assert_eq!(r.as_f64(), 1.0);
}

#[test]
fn test_int_float_conversions() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("conv", 1);
    let f = b.emit(Opcode::I32ToF64, vec![b.param(0).into()]);
    let g = b.emit(Opcode::DivF64, vec![f.into(), Const::Float64(2.0).into()]);
    let i = b.emit(Opcode::F64ToI32, vec![g.into()]);
    b.emit(Opcode::Ret, vec![i.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[TaggedVal::int32(-7)]);
    assert_eq!(r.as_i32(), -3); // -7 / 2 = -3.5, truncated
    assert_eq!(r.tag, TypeTag::Int32);
}

// ==================== Control flow and versioning ====================

/// Iterative sum 1..=n: a loop whose head is re-entered along the back
/// edge with a different state, exercising version interning and
/// convergence.
#[test]
fn test_loop_sum() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("sum", 1);
    let p = b.param(0);
    let head = b.new_block();
    let body = b.new_block();
    let exit = b.new_block();

    let i = b.emit(Opcode::Mov, vec![0.into()]);
    let s = b.emit(Opcode::Mov, vec![0.into()]);
    b.emit_branch(Opcode::Jump, vec![], Some(head), None);

    b.set_block(head);
    let c = b.emit(Opcode::LtI32, vec![i.into(), p.into()]);
    b.emit_branch(Opcode::IfTrue, vec![c.into()], Some(body), Some(exit));

    b.set_block(body);
    let i1 = b.emit(Opcode::AddI32, vec![i.into(), 1.into()]);
    let s1 = b.emit(Opcode::AddI32, vec![s.into(), i1.into()]);
    b.emit_mov_to(i, i1.into());
    b.emit_mov_to(s, s1.into());
    b.emit_branch(Opcode::Jump, vec![], Some(head), None);

    b.set_block(exit);
    b.emit(Opcode::Ret, vec![s.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[TaggedVal::int32(5)]);
    assert_eq!(r.as_i32(), 15);
    let r = run(&mut cg, fid, &[TaggedVal::int32(100)]);
    assert_eq!(r.as_i32(), 5050);
    assert_eq!(run(&mut cg, fid, &[TaggedVal::int32(0)]).as_i32(), 0);

    // The loop head converged to a bounded number of versions
    let head_versions = cg.versions().iter().filter(|v| v.block == head).count();
    assert!(head_versions >= 1 && head_versions <= 3);
}

#[test]
fn test_diamond_branch() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("pick", 1);
    let yes = b.new_block();
    let no = b.new_block();
    let c = b.emit(Opcode::LtI32, vec![b.param(0).into(), 10.into()]);
    b.emit_branch(Opcode::IfTrue, vec![c.into()], Some(yes), Some(no));
    b.set_block(yes);
    unit_ret_i32(&mut b, 1);
    b.set_block(no);
    unit_ret_i32(&mut b, 2);
    let fid = cg.add_function(b.finish());

    assert_eq!(run(&mut cg, fid, &[TaggedVal::int32(5)]).as_i32(), 1);
    assert_eq!(run(&mut cg, fid, &[TaggedVal::int32(15)]).as_i32(), 2);
}

/// A known type collapses the test to a direct jump: only the taken
/// successor is ever versioned, and its entry state carries the fact.
#[test]
fn test_type_test_collapses_on_known_type() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("known", 0);
    let yes = b.new_block();
    let no = b.new_block();
    let v = b.emit(Opcode::Mov, vec![42.into()]);
    let t = b.emit(Opcode::IsInt32, vec![v.into()]);
    b.emit_branch(Opcode::IfTrue, vec![t.into()], Some(yes), Some(no));
    b.set_block(yes);
    b.emit(Opcode::Ret, vec![v.into()]);
    b.set_block(no);
    unit_ret_i32(&mut b, 0);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[]);
    assert_eq!(r.as_i32(), 42);
    // The false successor was never requested
    assert_eq!(cg.versions().iter().count(), 2);
    // The taken successor knows the tested value is an int32
    let ver = cg.versions().iter().last().unwrap();
    assert_eq!(ver.state.known_type(v), Some(TypeTag::Int32));
}

/// Basic-block versioning proper: a second test of the same value in
/// the refined successor collapses, so its false edge never exists.
#[test]
fn test_bbv_refinement_eliminates_second_test() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("refine", 1);
    let p = b.param(0);
    let b1 = b.new_block();
    let b2 = b.new_block();
    let b3 = b.new_block();
    let b4 = b.new_block();

    let t = b.emit(Opcode::IsInt32, vec![p.into()]);
    b.emit_branch(Opcode::IfTrue, vec![t.into()], Some(b1), Some(b2));

    b.set_block(b1);
    let u = b.emit(Opcode::IsInt32, vec![p.into()]);
    b.emit_branch(Opcode::IfTrue, vec![u.into()], Some(b3), Some(b4));

    b.set_block(b2);
    unit_ret_i32(&mut b, 0);
    b.set_block(b3);
    unit_ret_i32(&mut b, 1);
    b.set_block(b4);
    unit_ret_i32(&mut b, 2);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[TaggedVal::int32(5)]);
    assert_eq!(r.as_i32(), 1);
    let r = run(&mut cg, fid, &[TaggedVal::float64(5.0)]);
    assert_eq!(r.as_i32(), 0);

    // b4 (the second test's false edge) must never have been versioned
    assert!(cg
        .versions()
        .iter()
        .all(|ver| ver.block != b4));
}

/// With the version cap at zero every successor is generic and the
/// test emits the full compare/cmov sequence with no refinement.
#[test]
fn test_generic_versions_under_zero_cap() {
    let cfg = JitConfig {
        max_versions: 0,
        ..JitConfig::default()
    };
    let (_vm, mut cg) = setup(cfg);
    let mut b = FunctionBuilder::new("generic", 1);
    let p = b.param(0);
    let t = b.emit(Opcode::IsString, vec![p.into()]);
    b.emit(Opcode::Ret, vec![t.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[TaggedVal::int32(3)]);
    assert_eq!(r.tag, TypeTag::Const);
    assert_eq!(r.word, 0); // false

    let fake_str = TaggedVal {
        word: 0x1000,
        tag: TypeTag::String,
    };
    let r = run(&mut cg, fid, &[fake_str]);
    assert_eq!(r.word, 1); // true

    // No version carries a type fact about the parameter
    assert!(cg
        .versions()
        .iter()
        .all(|ver| ver.state.known_type(p).is_none()));
}

// ==================== Calls ====================

#[test]
fn test_call_prim() {
    let (_vm, mut cg) = setup(JitConfig::default());

    let mut b = FunctionBuilder::new("rt_add", 2);
    b.fixed_arity();
    let v = b.emit(Opcode::AddI32, vec![b.param(0).into(), b.param(1).into()]);
    b.emit(Opcode::Ret, vec![v.into()]);
    let prim = cg.add_function(b.finish());
    cg.register_prim("rt_add", prim);

    let mut b = FunctionBuilder::new("caller", 0);
    let cont = b.new_block();
    let c = b.emit_branch(
        Opcode::CallPrim,
        vec![Const::str("rt_add").into(), 1.into(), 2.into()],
        Some(cont),
        None,
    );
    b.set_block(cont);
    b.emit(Opcode::Ret, vec![c.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[]);
    assert_eq!(r.as_i32(), 3);
    assert_eq!(r.tag, TypeTag::Int32);
}

#[test]
fn test_call_prim_arity_mismatch_is_fatal() {
    let (_vm, mut cg) = setup(JitConfig::default());

    let mut b = FunctionBuilder::new("one", 1);
    b.fixed_arity();
    let v = b.emit(Opcode::Mov, vec![b.param(0).into()]);
    b.emit(Opcode::Ret, vec![v.into()]);
    let prim = cg.add_function(b.finish());
    cg.register_prim("one", prim);

    let mut b = FunctionBuilder::new("caller", 0);
    let cont = b.new_block();
    let c = b.emit_branch(
        Opcode::CallPrim,
        vec![Const::str("one").into(), 1.into(), 2.into()],
        Some(cont),
        None,
    );
    b.set_block(cont);
    b.emit(Opcode::Ret, vec![c.into()]);
    let fid = cg.add_function(b.finish());

    assert!(cg.compile_function(fid).is_err());
}

static CLOS_BUMP: AtomicU64 = AtomicU64::new(0);

extern "C" fn host_new_clos(
    _vm: *mut VmContext,
    _instr: *const corvus::ir::IRInstr,
    fe: *const FunEntry,
    ncells: u32,
) -> u64 {
    let mut words: Vec<u64> = vec![0; 2 + ncells as usize];
    words[0] = fe as u64;
    words[1] = ncells as u64;
    for slot in words.iter_mut().skip(2) {
        let cell: Box<[u64; 2]> = Box::new([0; 2]);
        *slot = Box::into_raw(cell) as u64;
    }
    CLOS_BUMP.fetch_add(1, Ordering::SeqCst);
    Box::into_raw(words.into_boxed_slice()) as *mut u64 as u64
}

#[test]
fn test_dynamic_call_through_closure() {
    let (mut vm, mut cg) = setup(JitConfig::default());
    vm.new_clos = host_new_clos;

    // callee(a, b) = a * 10 + b
    let mut b = FunctionBuilder::new("callee", 2);
    let m = b.emit(Opcode::MulI32, vec![b.param(0).into(), 10.into()]);
    let v = b.emit(Opcode::AddI32, vec![m.into(), b.param(1).into()]);
    b.emit(Opcode::Ret, vec![v.into()]);
    let callee = cg.add_function(b.finish());

    let mut b = FunctionBuilder::new("caller", 0);
    let cont = b.new_block();
    let clos = b.emit(
        Opcode::NewClos,
        vec![Const::Fun(callee).into(), 0.into()],
    );
    let c = b.emit_branch(
        Opcode::Call,
        vec![clos.into(), Const::Undef.into(), 3.into(), 4.into()],
        Some(cont),
        None,
    );
    b.set_block(cont);
    b.emit(Opcode::Ret, vec![c.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[]);
    assert_eq!(r.as_i32(), 34);
}

#[test]
fn test_dynamic_call_missing_and_extra_args() {
    let (mut vm, mut cg) = setup(JitConfig::default());
    vm.new_clos = host_new_clos;

    // callee(a) returns its sole formal; callers pass 0 and 3 args
    let mut b = FunctionBuilder::new("id", 1);
    let v = b.emit(Opcode::Mov, vec![b.param(0).into()]);
    b.emit(Opcode::Ret, vec![v.into()]);
    let callee = cg.add_function(b.finish());

    // No arguments: the missing formal is undefined
    let mut b = FunctionBuilder::new("call0", 0);
    let cont = b.new_block();
    let clos = b.emit(Opcode::NewClos, vec![Const::Fun(callee).into(), 0.into()]);
    let c = b.emit_branch(
        Opcode::Call,
        vec![clos.into(), Const::Undef.into()],
        Some(cont),
        None,
    );
    b.set_block(cont);
    b.emit(Opcode::Ret, vec![c.into()]);
    let f0 = cg.add_function(b.finish());
    let r = run(&mut cg, f0, &[]);
    assert_eq!(r, TaggedVal::undef());

    // Three arguments: extras are popped by the callee's return
    let mut b = FunctionBuilder::new("call3", 0);
    let cont = b.new_block();
    let clos = b.emit(Opcode::NewClos, vec![Const::Fun(callee).into(), 0.into()]);
    let c = b.emit_branch(
        Opcode::Call,
        vec![
            clos.into(),
            Const::Undef.into(),
            7.into(),
            8.into(),
            9.into(),
        ],
        Some(cont),
        None,
    );
    b.set_block(cont);
    b.emit(Opcode::Ret, vec![c.into()]);
    let f3 = cg.add_function(b.finish());
    let r = run(&mut cg, f3, &[]);
    assert_eq!(r.as_i32(), 7);
}

static TYPE_ERROR_HIT: AtomicBool = AtomicBool::new(false);
static EXIT_STUB: AtomicU64 = AtomicU64::new(0);

extern "C" fn host_type_error(
    _vm: *mut VmContext,
    _instr: *const corvus::ir::IRInstr,
) -> *const u8 {
    TYPE_ERROR_HIT.store(true, Ordering::SeqCst);
    EXIT_STUB.load(Ordering::SeqCst) as *const u8
}

#[test]
fn test_call_of_non_callable_throws_type_error() {
    let (mut vm, mut cg) = setup(JitConfig::default());
    vm.throw_type_error = host_type_error;

    let mut b = FunctionBuilder::new("bad", 1);
    let cont = b.new_block();
    let c = b.emit_branch(
        Opcode::Call,
        vec![b.param(0).into(), Const::Undef.into()],
        Some(cont),
        None,
    );
    b.set_block(cont);
    b.emit(Opcode::Ret, vec![c.into()]);
    let fid = cg.add_function(b.finish());

    cg.compile_function(fid).unwrap();
    EXIT_STUB.store(cg.exit_stub_addr(), Ordering::SeqCst);
    TYPE_ERROR_HIT.store(false, Ordering::SeqCst);

    // An int32 is not callable: the guard must reach the host thunk.
    // The returned pair is whatever rode the return registers out.
    let mut stacks = ShadowStacks::new(256);
    let _ = unsafe { cg.call_unit(fid, &mut stacks, &[TaggedVal::int32(5)]).unwrap() };
    assert!(TYPE_ERROR_HIT.load(Ordering::SeqCst));
}

extern "C" fn host_throw_exc(
    vm: *mut VmContext,
    _instr: *const corvus::ir::IRInstr,
    _handler: *const u8,
    word: u64,
    tag: u8,
) -> *const u8 {
    assert_eq!(word, 42);
    assert_eq!(tag, TypeTag::Int32 as u8);
    // The frame must have been published before the call
    unsafe {
        assert_ne!((*vm).saved_wsp, 0);
    }
    EXIT_STUB.load(Ordering::SeqCst) as *const u8
}

#[test]
fn test_throw_reaches_host_unwinder() {
    let (mut vm, mut cg) = setup(JitConfig::default());
    vm.throw_exc = host_throw_exc;

    let mut b = FunctionBuilder::new("thrower", 0);
    b.emit(Opcode::Throw, vec![42.into()]);
    let fid = cg.add_function(b.finish());

    cg.compile_function(fid).unwrap();
    EXIT_STUB.store(cg.exit_stub_addr(), Ordering::SeqCst);

    // The unwinder hands back the exit stub; the exception value rides
    // the return registers out
    let r = run(&mut cg, fid, &[]);
    assert_eq!(r.as_i32(), 42);
    assert_eq!(r.tag, TypeTag::Int32);
}

// ==================== Heap allocation ====================

static ALLOC_FALLBACK_HIT: AtomicBool = AtomicBool::new(false);

extern "C" fn host_heap_alloc(
    _vm: *mut VmContext,
    _instr: *const corvus::ir::IRInstr,
    size: u64,
) -> u64 {
    assert_eq!(size, 32);
    ALLOC_FALLBACK_HIT.store(true, Ordering::SeqCst);
    0xDEAD_0000
}

fn alloc_fun(cg: &mut Codegen) -> FunId {
    let mut b = FunctionBuilder::new("mk", 0);
    let o = b.emit(Opcode::AllocObject, vec![32.into()]);
    b.emit(Opcode::Ret, vec![o.into()]);
    cg.add_function(b.finish())
}

#[test]
fn test_alloc_fast_path_bumps_and_aligns() {
    let (mut vm, mut cg) = setup(JitConfig::default());
    let heap = vec![0u8; 4096];
    let base = heap.as_ptr() as u64;
    vm.alloc_ptr = base + 4; // deliberately unaligned bump start
    vm.heap_limit = base + 4096;

    let fid = alloc_fun(&mut cg);
    let r = run(&mut cg, fid, &[]);
    assert_eq!(r.tag, TypeTag::Object);
    assert_eq!(r.word, base + 4);
    // allocPtr advanced to (old + 32 + 7) & !7
    assert_eq!(vm.alloc_ptr, (base + 4 + 32 + 7) & !7);
}

#[test]
fn test_alloc_fallback_calls_host() {
    let (mut vm, mut cg) = setup(JitConfig::default());
    vm.heap_alloc = host_heap_alloc;
    let heap = vec![0u8; 64];
    let base = heap.as_ptr() as u64;
    vm.alloc_ptr = base;
    vm.heap_limit = base + 8; // too small for 32 bytes

    ALLOC_FALLBACK_HIT.store(false, Ordering::SeqCst);
    let fid = alloc_fun(&mut cg);
    let r = run(&mut cg, fid, &[]);
    assert!(ALLOC_FALLBACK_HIT.load(Ordering::SeqCst));
    assert_eq!(r.word, 0xDEAD_0000);
    assert_eq!(r.tag, TypeTag::Object);
    // The fast-path bump never committed
    assert_eq!(vm.alloc_ptr, base);
}

// ==================== Shape property fast path ====================

/// Build a fake object: [shape, cap, next, words..., type bytes...].
fn build_object(cap: u32, shape: u64, next: u64, props: &[(u64, TypeTag)]) -> Vec<u8> {
    let size = layout::obj_size_bytes(cap) as usize;
    let mut buf = vec![0u8; size];
    buf[0..8].copy_from_slice(&shape.to_le_bytes());
    buf[8..12].copy_from_slice(&cap.to_le_bytes());
    buf[16..24].copy_from_slice(&next.to_le_bytes());
    for (i, (w, t)) in props.iter().enumerate() {
        let wofs = layout::obj_word_ofs(i as u32) as usize;
        buf[wofs..wofs + 8].copy_from_slice(&w.to_le_bytes());
        buf[layout::obj_type_ofs(cap, i as u32) as usize] = *t as u8;
    }
    buf
}

/// Build a fake shape record: [parent, name, slot_idx, attrs].
fn build_shape(slot_idx: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 24];
    buf[16..20].copy_from_slice(&slot_idx.to_le_bytes());
    buf
}

fn prop_fun(cg: &mut Codegen) -> FunId {
    let mut b = FunctionBuilder::new("getprop", 2);
    let v = b.emit(
        Opcode::ShapeGetProp,
        vec![b.param(0).into(), b.param(1).into()],
    );
    b.emit(Opcode::Ret, vec![v.into()]);
    cg.add_function(b.finish())
}

#[test]
fn test_shape_get_prop_inline_slot() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let obj = build_object(
        4,
        0x1111,
        0,
        &[
            (10, TypeTag::Int32),
            (f64::to_bits(2.5), TypeTag::Float64),
            (30, TypeTag::Int32),
        ],
    );
    let shape = build_shape(1);

    let fid = prop_fun(&mut cg);
    let r = run(
        &mut cg,
        fid,
        &[
            TaggedVal {
                word: obj.as_ptr() as u64,
                tag: TypeTag::Object,
            },
            TaggedVal {
                word: shape.as_ptr() as u64,
                tag: TypeTag::ShapePtr,
            },
        ],
    );
    assert_eq!(r.tag, TypeTag::Float64);
    assert_eq!(r.as_f64(), 2.5);
}

#[test]
fn test_shape_get_prop_extension_table() {
    let (_vm, mut cg) = setup(JitConfig::default());
    // The extension object holds all slots; index 6 exceeds the base
    // object's capacity of 4
    let mut ext_props = vec![(0u64, TypeTag::Const); 8];
    ext_props[6] = (777, TypeTag::Int32);
    let ext = build_object(8, 0x2222, 0, &ext_props);
    let obj = build_object(4, 0x1111, ext.as_ptr() as u64, &[]);
    let shape = build_shape(6);

    let fid = prop_fun(&mut cg);
    let r = run(
        &mut cg,
        fid,
        &[
            TaggedVal {
                word: obj.as_ptr() as u64,
                tag: TypeTag::Object,
            },
            TaggedVal {
                word: shape.as_ptr() as u64,
                tag: TypeTag::ShapePtr,
            },
        ],
    );
    assert_eq!(r.tag, TypeTag::Int32);
    assert_eq!(r.as_i32(), 777);
}

// ==================== FFI ====================

extern "C" fn int_add(a: i32, b: i32) -> i32 {
    a + b
}

extern "C" fn float_mix(a: f64, b: f64, c: i64) -> f64 {
    a * b + c as f64
}

extern "C" fn many_args(
    a: i64,
    b: i64,
    c: i64,
    d: i64,
    e: i64,
    f: i64,
    g: i64,
    h: i64,
) -> i64 {
    a + 2 * b + 3 * c + 4 * d + 5 * e + 6 * f + 7 * g + 8 * h
}

#[test]
fn test_call_ffi_int() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("ffi", 1);
    let v = b.emit(
        Opcode::CallFfi,
        vec![
            Const::str("i32,i32,i32").into(),
            b.param(0).into(),
            2.into(),
            3.into(),
        ],
    );
    b.emit(Opcode::Ret, vec![v.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[TaggedVal::raw_ptr(int_add as u64)]);
    assert_eq!(r.as_i32(), 5);
    assert_eq!(r.tag, TypeTag::Int32);
}

#[test]
fn test_call_ffi_floats_and_stack_args() {
    let (_vm, mut cg) = setup(JitConfig::default());

    let mut b = FunctionBuilder::new("ffi_f", 1);
    let v = b.emit(
        Opcode::CallFfi,
        vec![
            Const::str("f64,f64,f64,i64").into(),
            b.param(0).into(),
            Const::Float64(2.5).into(),
            Const::Float64(4.0).into(),
            7.into(),
        ],
    );
    b.emit(Opcode::Ret, vec![v.into()]);
    let fid = cg.add_function(b.finish());
    let r = run(&mut cg, fid, &[TaggedVal::raw_ptr(float_mix as u64)]);
    assert_eq!(r.as_f64(), 2.5 * 4.0 + 7.0);

    // Eight integer arguments: two spill to the native stack
    let mut b = FunctionBuilder::new("ffi_many", 1);
    let mut args: Vec<corvus::ir::IRArg> =
        vec![Const::str("i64,i64,i64,i64,i64,i64,i64,i64,i64").into(), b.param(0).into()];
    for i in 1..=8 {
        args.push(i.into());
    }
    let v = b.emit(Opcode::CallFfi, args);
    b.emit(Opcode::Ret, vec![v.into()]);
    let fid = cg.add_function(b.finish());
    let r = run(&mut cg, fid, &[TaggedVal::raw_ptr(many_args as u64)]);
    let expect: i64 = (1..=8).map(|i| i * i).sum();
    assert_eq!(r.word as i64, expect);
    assert_eq!(r.tag, TypeTag::Int64);
}

#[test]
fn test_call_ffi_void_yields_undefined() {
    extern "C" fn nop() {}
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("ffi_void", 1);
    let v = b.emit(
        Opcode::CallFfi,
        vec![Const::str("void").into(), b.param(0).into()],
    );
    b.emit(Opcode::Ret, vec![v.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[TaggedVal::raw_ptr(nop as u64)]);
    assert_eq!(r, TaggedVal::undef());
}

#[test]
fn test_bad_ffi_signature_is_fatal() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("ffi_bad", 1);
    let v = b.emit(
        Opcode::CallFfi,
        vec![Const::str("i32,i33").into(), b.param(0).into(), 1.into()],
    );
    b.emit(Opcode::Ret, vec![v.into()]);
    let fid = cg.add_function(b.finish());
    assert!(cg.compile_function(fid).is_err());
}

// ==================== Closure cells ====================

#[test]
fn test_closure_capture_cells() {
    let (mut vm, mut cg) = setup(JitConfig::default());
    vm.new_clos = host_new_clos;

    let mut b = FunctionBuilder::new("never", 0);
    unit_ret_i32(&mut b, 0);
    let dummy = cg.add_function(b.finish());

    let mut b = FunctionBuilder::new("cells", 0);
    let clos = b.emit(Opcode::NewClos, vec![Const::Fun(dummy).into(), 2.into()]);
    b.emit(
        Opcode::ClosSetCell,
        vec![clos.into(), 1.into(), Const::Float64(6.25).into()],
    );
    let v = b.emit(Opcode::ClosGetCell, vec![clos.into(), 1.into()]);
    b.emit(Opcode::Ret, vec![v.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[]);
    assert_eq!(r.tag, TypeTag::Float64);
    assert_eq!(r.as_f64(), 6.25);
}

// ==================== Lazy compilation ====================

#[test]
fn test_lazy_mode_compiles_on_first_reach() {
    let cfg = JitConfig {
        eager: false,
        ..JitConfig::default()
    };
    let (_vm, mut cg) = setup(cfg);

    let mut b = FunctionBuilder::new("pick", 1);
    let yes = b.new_block();
    let no = b.new_block();
    let c = b.emit(Opcode::LtI32, vec![b.param(0).into(), 10.into()]);
    b.emit_branch(Opcode::IfTrue, vec![c.into()], Some(yes), Some(no));
    b.set_block(yes);
    unit_ret_i32(&mut b, 1);
    b.set_block(no);
    unit_ret_i32(&mut b, 2);
    let fid = cg.add_function(b.finish());

    // First run enters through the function stub and compiles only the
    // path it takes; the second run triggers the other branch's stub
    assert_eq!(run(&mut cg, fid, &[TaggedVal::int32(5)]).as_i32(), 1);
    let realized_after_first = cg
        .versions()
        .iter()
        .filter(|v| v.is_realized())
        .count();
    assert_eq!(run(&mut cg, fid, &[TaggedVal::int32(50)]).as_i32(), 2);
    let realized_after_second = cg
        .versions()
        .iter()
        .filter(|v| v.is_realized())
        .count();
    assert!(realized_after_second > realized_after_first);
}

#[test]
fn test_lazy_call_continuation_stub() {
    let cfg = JitConfig {
        eager: false,
        ..JitConfig::default()
    };
    let (_vm, mut cg) = setup(cfg);

    let mut b = FunctionBuilder::new("rt_inc", 1);
    b.fixed_arity();
    let v = b.emit(Opcode::AddI32, vec![b.param(0).into(), 1.into()]);
    b.emit(Opcode::Ret, vec![v.into()]);
    let prim = cg.add_function(b.finish());
    cg.register_prim("rt_inc", prim);

    let mut b = FunctionBuilder::new("caller", 1);
    let cont = b.new_block();
    let c = b.emit_branch(
        Opcode::CallPrim,
        vec![Const::str("rt_inc").into(), b.param(0).into()],
        Some(cont),
        None,
    );
    b.set_block(cont);
    b.emit(Opcode::Ret, vec![c.into()]);
    let fid = cg.add_function(b.finish());

    assert_eq!(run(&mut cg, fid, &[TaggedVal::int32(41)]).as_i32(), 42);
}

// ==================== Link table and strings ====================

static STR_WORDS: AtomicU64 = AtomicU64::new(0x5000);

extern "C" fn host_get_str(_vm: *mut VmContext, _p: *const u8, _len: u64) -> u64 {
    STR_WORDS.fetch_add(0x10, Ordering::SeqCst)
}

#[test]
fn test_set_str_interns_once_per_literal() {
    let (mut vm, mut cg) = setup(JitConfig::default());
    vm.get_str = host_get_str;

    let mut b = FunctionBuilder::new("strs", 0);
    let a = b.emit(Opcode::SetStr, vec![Const::str("hello").into()]);
    let c = b.emit(Opcode::SetStr, vec![Const::str("hello").into()]);
    let e = b.emit(Opcode::EqI64, vec![a.into(), c.into()]);
    b.emit(Opcode::Ret, vec![e.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[]);
    // Same literal, same link cell, same interned word
    assert_eq!(r.word, 1);
    assert_eq!(r.tag, TypeTag::Const);
}

#[test]
fn test_link_cells_roundtrip() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("links", 1);
    let link = corvus::ir::LinkSlot::new();
    let idx = b.emit(Opcode::MakeLink, vec![Const::Link(link.clone()).into()]);
    b.emit(
        Opcode::SetLink,
        vec![Const::Link(link.clone()).into(), b.param(0).into()],
    );
    let v = b.emit(Opcode::GetLink, vec![Const::Link(link).into()]);
    let s = b.emit(Opcode::AddI32, vec![v.into(), idx.into()]);
    b.emit(Opcode::Ret, vec![s.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(&mut cg, fid, &[TaggedVal::int32(40)]);
    // The stored value round-trips; the link index is the first cell
    assert_eq!(r.as_i32(), 40);
}

// ==================== Comparisons ====================

#[test]
fn test_float_compare_unordered_semantics() {
    let (_vm, mut cg) = setup(JitConfig::default());

    let build = |op: Opcode| {
        let mut b = FunctionBuilder::new("fcmp", 2);
        let v = b.emit(op, vec![b.param(0).into(), b.param(1).into()]);
        b.emit(Opcode::Ret, vec![v.into()]);
        b.finish()
    };

    let feq = cg.add_function(build(Opcode::EqF64));
    let fne = cg.add_function(build(Opcode::NeF64));
    let flt = cg.add_function(build(Opcode::LtF64));

    let nan = TaggedVal::float64(f64::NAN);
    let one = TaggedVal::float64(1.0);
    let two = TaggedVal::float64(2.0);

    assert_eq!(run(&mut cg, feq, &[one, one]).word, 1);
    assert_eq!(run(&mut cg, feq, &[one, nan]).word, 0);
    assert_eq!(run(&mut cg, fne, &[one, nan]).word, 1);
    assert_eq!(run(&mut cg, fne, &[one, two]).word, 1);
    assert_eq!(run(&mut cg, flt, &[one, two]).word, 1);
    assert_eq!(run(&mut cg, flt, &[two, one]).word, 0);
    assert_eq!(run(&mut cg, flt, &[nan, one]).word, 0);
}

#[test]
fn test_int_compare_fused_into_branch() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut b = FunctionBuilder::new("max", 2);
    let yes = b.new_block();
    let no = b.new_block();
    let c = b.emit(Opcode::GtI32, vec![b.param(0).into(), b.param(1).into()]);
    b.emit_branch(Opcode::IfTrue, vec![c.into()], Some(yes), Some(no));
    b.set_block(yes);
    let v = b.emit(Opcode::Mov, vec![b.param(0).into()]);
    b.emit(Opcode::Ret, vec![v.into()]);
    b.set_block(no);
    let v = b.emit(Opcode::Mov, vec![b.param(1).into()]);
    b.emit(Opcode::Ret, vec![v.into()]);
    let fid = cg.add_function(b.finish());

    assert_eq!(
        run(&mut cg, fid, &[TaggedVal::int32(3), TaggedVal::int32(9)]).as_i32(),
        9
    );
    assert_eq!(
        run(&mut cg, fid, &[TaggedVal::int32(-1), TaggedVal::int32(-9)]).as_i32(),
        -1
    );
}

// ==================== Memory access ====================

#[test]
fn test_loads_and_stores() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let mut buf = [0u8; 64];
    buf[0] = 0xFF; // -1 as i8
    buf[8..12].copy_from_slice(&123456i32.to_le_bytes());

    let mut b = FunctionBuilder::new("mem", 1);
    let p = b.param(0);
    let sb = b.emit(Opcode::LoadI8, vec![p.into(), 0.into()]);
    let dw = b.emit(Opcode::LoadI32, vec![p.into(), 8.into()]);
    // store the sum at offset 16, then read it back as unsigned 64
    let sum = b.emit(Opcode::AddI32, vec![sb.into(), dw.into()]);
    b.emit(Opcode::StoreU32, vec![p.into(), 16.into(), sum.into()]);
    let back = b.emit(Opcode::LoadU32, vec![p.into(), 16.into()]);
    b.emit(Opcode::Ret, vec![back.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(
        &mut cg,
        fid,
        &[TaggedVal::raw_ptr(buf.as_mut_ptr() as u64)],
    );
    assert_eq!(r.as_i32(), 123455);
}

#[test]
fn test_load_with_register_index() {
    let (_vm, mut cg) = setup(JitConfig::default());
    let buf: Vec<u8> = (0..64).collect();

    let mut b = FunctionBuilder::new("memidx", 2);
    let v = b.emit(Opcode::LoadU8, vec![b.param(0).into(), b.param(1).into()]);
    b.emit(Opcode::Ret, vec![v.into()]);
    let fid = cg.add_function(b.finish());

    let r = run(
        &mut cg,
        fid,
        &[
            TaggedVal::raw_ptr(buf.as_ptr() as u64),
            TaggedVal::int64(37),
        ],
    );
    assert_eq!(r.as_i32(), 37);
}
