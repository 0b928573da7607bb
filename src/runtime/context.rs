//! VM context shared with emitted code.
//!
//! `VmContext` is the one structure both halves of the system agree on:
//! emitted code reads its fields at fixed offsets (heap bump pointers,
//! link-table bases, host-function pointers), and the host mutates it
//! between and during compilations. All host functions use the C ABI;
//! emitted call sites bracket them with the save/load of the reserved
//! JIT registers and store the current stack pointers into
//! `saved_wsp`/`saved_tsp` so the callee sees a valid frame.

use std::ffi::c_void;

use crate::ir::{IRInstr, TypeTag};

use super::funtable::FunEntry;
use super::pcache::PropCache;

/// A tagged value in host representation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaggedVal {
    pub word: u64,
    pub tag: TypeTag,
}

impl TaggedVal {
    pub fn int32(n: i32) -> Self {
        Self {
            word: n as i64 as u64,
            tag: TypeTag::Int32,
        }
    }

    pub fn int64(n: i64) -> Self {
        Self {
            word: n as u64,
            tag: TypeTag::Int64,
        }
    }

    pub fn float64(f: f64) -> Self {
        Self {
            word: f.to_bits(),
            tag: TypeTag::Float64,
        }
    }

    pub fn boolean(b: bool) -> Self {
        Self {
            word: if b {
                crate::ir::const_words::TRUE
            } else {
                crate::ir::const_words::FALSE
            },
            tag: TypeTag::Const,
        }
    }

    pub fn undef() -> Self {
        Self {
            word: crate::ir::const_words::UNDEF,
            tag: TypeTag::Const,
        }
    }

    pub fn null() -> Self {
        Self {
            word: crate::ir::const_words::NULL,
            tag: TypeTag::Const,
        }
    }

    pub fn raw_ptr(p: u64) -> Self {
        Self {
            word: p,
            tag: TypeTag::RawPtr,
        }
    }

    pub fn as_i32(&self) -> i32 {
        self.word as u32 as i32
    }

    pub fn as_f64(&self) -> f64 {
        f64::from_bits(self.word)
    }
}

/// Return value of a compiled unit function, read back by the host
/// through the entry thunk: word in RAX, tag in RDX.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReturnPair {
    pub word: u64,
    pub tag: u64,
}

impl ReturnPair {
    pub fn to_tagged(self) -> Option<TaggedVal> {
        TypeTag::from_u8(self.tag as u8).map(|tag| TaggedVal {
            word: self.word,
            tag,
        })
    }
}

// Host-function pointer types. `instr` parameters are opaque to the
// host; they identify the emission site for diagnostics and unwinding.
pub type HeapAllocFn = extern "C" fn(*mut VmContext, *const IRInstr, u64) -> u64;
pub type GcCollectFn = extern "C" fn(*mut VmContext, *const IRInstr, u64);
pub type GetStrFn = extern "C" fn(*mut VmContext, *const u8, u64) -> u64;
pub type ThrowExcFn = extern "C" fn(*mut VmContext, *const IRInstr, *const u8, u64, u8) -> *const u8;
pub type ThrowTypeErrorFn = extern "C" fn(*mut VmContext, *const IRInstr) -> *const u8;
pub type NewClosFn = extern "C" fn(*mut VmContext, *const IRInstr, *const FunEntry, u32) -> u64;
pub type CallApplyFn =
    extern "C" fn(*mut VmContext, *const IRInstr, u64, u64, u64, *const u8) -> *const u8;
pub type EvalFn = extern "C" fn(*mut VmContext, *const IRInstr, u64, *const u8) -> *const u8;
pub type GetTimeMsFn = extern "C" fn(*mut VmContext) -> u64;
pub type ShapeGetDefFn = extern "C" fn(*mut VmContext, u64, u64) -> u64;
pub type ShapeSetPropFn = extern "C" fn(*mut VmContext, u64, u64, u64, u64, u8);
pub type ShapeDefConstFn = extern "C" fn(*mut VmContext, u64, u64, u64, u8);
pub type ShapeSetAttrsFn = extern "C" fn(*mut VmContext, u64, u64, u32);
pub type ShapeGetAttrsFn = extern "C" fn(*mut VmContext, u64) -> u32;
pub type ShapeQueryFn = extern "C" fn(*mut VmContext, u64) -> u64;
pub type MathUnFn = extern "C" fn(f64) -> f64;
pub type MathBinFn = extern "C" fn(f64, f64) -> f64;
pub type LoadLibFn = extern "C" fn(*mut VmContext, u64) -> u64;
pub type GetSymFn = extern "C" fn(*mut VmContext, u64, u64) -> u64;
pub type CloseLibFn = extern "C" fn(*mut VmContext, u64) -> u64;
pub type CompileCallbackFn = extern "C" fn(*mut VmContext, u32) -> *const u8;
pub type PCacheMissFn = extern "C" fn(*mut VmContext, *mut PropCache, u64, u64) -> u32;

/// The context record emitted code addresses through its reserved
/// register. Field order is part of the emitted-code ABI; offsets are
/// taken with `offset_of!` below.
#[repr(C)]
pub struct VmContext {
    /// Heap bump pointer for the inline allocation fast path
    pub alloc_ptr: u64,
    /// Heap limit; fast path fails when the bumped pointer passes it
    pub heap_limit: u64,
    /// Word-stack pointer as of the last host call
    pub saved_wsp: u64,
    /// Type-stack pointer as of the last host call
    pub saved_tsp: u64,
    /// Link-table word array base
    pub link_words: *mut u64,
    /// Link-table tag array base
    pub link_tags: *mut u8,
    /// Function-entry table base
    pub fun_entries: *const FunEntry,
    /// Back pointer to the code generator, used by the compile stubs
    pub codegen: *mut c_void,

    pub heap_alloc: HeapAllocFn,
    pub gc_collect: GcCollectFn,
    pub get_str: GetStrFn,
    pub throw_exc: ThrowExcFn,
    pub throw_type_error: ThrowTypeErrorFn,
    pub new_clos: NewClosFn,
    pub call_apply: CallApplyFn,
    pub load_file: EvalFn,
    pub eval_str: EvalFn,
    pub get_time_ms: GetTimeMsFn,

    pub shape_get_def: ShapeGetDefFn,
    pub shape_set_prop: ShapeSetPropFn,
    pub shape_def_const: ShapeDefConstFn,
    pub shape_set_attrs: ShapeSetAttrsFn,
    pub shape_get_attrs: ShapeGetAttrsFn,
    pub shape_parent: ShapeQueryFn,
    pub shape_prop_name: ShapeQueryFn,

    pub math_sin: MathUnFn,
    pub math_cos: MathUnFn,
    pub math_sqrt: MathUnFn,
    pub math_ceil: MathUnFn,
    pub math_floor: MathUnFn,
    pub math_log: MathUnFn,
    pub math_exp: MathUnFn,
    pub math_pow: MathBinFn,
    pub math_fmod: MathBinFn,

    pub load_lib: LoadLibFn,
    pub get_sym: GetSymFn,
    pub close_lib: CloseLibFn,

    pub compile_block: CompileCallbackFn,
    pub compile_fun: CompileCallbackFn,
    pub pcache_miss: PCacheMissFn,
}

/// Byte offsets of the fields emitted code touches.
pub mod ctx_ofs {
    use super::VmContext;
    use std::mem::offset_of;

    pub const ALLOC_PTR: i32 = offset_of!(VmContext, alloc_ptr) as i32;
    pub const HEAP_LIMIT: i32 = offset_of!(VmContext, heap_limit) as i32;
    pub const SAVED_WSP: i32 = offset_of!(VmContext, saved_wsp) as i32;
    pub const SAVED_TSP: i32 = offset_of!(VmContext, saved_tsp) as i32;
    pub const HEAP_ALLOC: i32 = offset_of!(VmContext, heap_alloc) as i32;
    pub const GC_COLLECT: i32 = offset_of!(VmContext, gc_collect) as i32;
    pub const THROW_EXC: i32 = offset_of!(VmContext, throw_exc) as i32;
    pub const THROW_TYPE_ERROR: i32 = offset_of!(VmContext, throw_type_error) as i32;
    pub const NEW_CLOS: i32 = offset_of!(VmContext, new_clos) as i32;
    pub const CALL_APPLY: i32 = offset_of!(VmContext, call_apply) as i32;
    pub const LOAD_FILE: i32 = offset_of!(VmContext, load_file) as i32;
    pub const EVAL_STR: i32 = offset_of!(VmContext, eval_str) as i32;
    pub const GET_TIME_MS: i32 = offset_of!(VmContext, get_time_ms) as i32;
    pub const SHAPE_GET_DEF: i32 = offset_of!(VmContext, shape_get_def) as i32;
    pub const SHAPE_SET_PROP: i32 = offset_of!(VmContext, shape_set_prop) as i32;
    pub const SHAPE_DEF_CONST: i32 = offset_of!(VmContext, shape_def_const) as i32;
    pub const SHAPE_SET_ATTRS: i32 = offset_of!(VmContext, shape_set_attrs) as i32;
    pub const SHAPE_GET_ATTRS: i32 = offset_of!(VmContext, shape_get_attrs) as i32;
    pub const SHAPE_PARENT: i32 = offset_of!(VmContext, shape_parent) as i32;
    pub const SHAPE_PROP_NAME: i32 = offset_of!(VmContext, shape_prop_name) as i32;
    pub const MATH_SIN: i32 = offset_of!(VmContext, math_sin) as i32;
    pub const MATH_COS: i32 = offset_of!(VmContext, math_cos) as i32;
    pub const MATH_SQRT: i32 = offset_of!(VmContext, math_sqrt) as i32;
    pub const MATH_CEIL: i32 = offset_of!(VmContext, math_ceil) as i32;
    pub const MATH_FLOOR: i32 = offset_of!(VmContext, math_floor) as i32;
    pub const MATH_LOG: i32 = offset_of!(VmContext, math_log) as i32;
    pub const MATH_EXP: i32 = offset_of!(VmContext, math_exp) as i32;
    pub const MATH_POW: i32 = offset_of!(VmContext, math_pow) as i32;
    pub const MATH_FMOD: i32 = offset_of!(VmContext, math_fmod) as i32;
    pub const LOAD_LIB: i32 = offset_of!(VmContext, load_lib) as i32;
    pub const GET_SYM: i32 = offset_of!(VmContext, get_sym) as i32;
    pub const CLOSE_LIB: i32 = offset_of!(VmContext, close_lib) as i32;
    pub const COMPILE_BLOCK: i32 = offset_of!(VmContext, compile_block) as i32;
    pub const COMPILE_FUN: i32 = offset_of!(VmContext, compile_fun) as i32;
    pub const PCACHE_MISS: i32 = offset_of!(VmContext, pcache_miss) as i32;
}

impl VmContext {
    /// A context with real math/time services and trapping defaults for
    /// everything the embedder must supply.
    pub fn new() -> Box<VmContext> {
        Box::new(VmContext {
            alloc_ptr: 0,
            heap_limit: 0,
            saved_wsp: 0,
            saved_tsp: 0,
            link_words: std::ptr::null_mut(),
            link_tags: std::ptr::null_mut(),
            fun_entries: std::ptr::null(),
            codegen: std::ptr::null_mut(),
            heap_alloc: defaults::heap_alloc,
            gc_collect: defaults::gc_collect,
            get_str: defaults::get_str,
            throw_exc: defaults::throw_exc,
            throw_type_error: defaults::throw_type_error,
            new_clos: defaults::new_clos,
            call_apply: defaults::call_apply,
            load_file: defaults::eval,
            eval_str: defaults::eval,
            get_time_ms: defaults::get_time_ms,
            shape_get_def: defaults::shape_get_def,
            shape_set_prop: defaults::shape_set_prop,
            shape_def_const: defaults::shape_def_const,
            shape_set_attrs: defaults::shape_set_attrs,
            shape_get_attrs: defaults::shape_get_attrs,
            shape_parent: defaults::shape_query,
            shape_prop_name: defaults::shape_query,
            math_sin: defaults::math_sin,
            math_cos: defaults::math_cos,
            math_sqrt: defaults::math_sqrt,
            math_ceil: defaults::math_ceil,
            math_floor: defaults::math_floor,
            math_log: defaults::math_log,
            math_exp: defaults::math_exp,
            math_pow: defaults::math_pow,
            math_fmod: defaults::math_fmod,
            load_lib: defaults::load_lib,
            get_sym: defaults::get_sym,
            close_lib: defaults::close_lib,
            compile_block: defaults::compile_trap,
            compile_fun: defaults::compile_trap,
            pcache_miss: defaults::pcache_miss,
        })
    }
}

/// Default host services. Math and time are real; everything else traps
/// loudly, since calling it means the embedder forgot to wire a service
/// the compiled program depends on.
mod defaults {
    use super::*;

    fn trap(name: &str) -> ! {
        eprintln!("[JIT] host function '{}' not installed", name);
        std::process::abort();
    }

    pub extern "C" fn heap_alloc(_vm: *mut VmContext, _i: *const IRInstr, _size: u64) -> u64 {
        trap("heap_alloc")
    }

    pub extern "C" fn gc_collect(_vm: *mut VmContext, _i: *const IRInstr, _size: u64) {
        trap("gc_collect")
    }

    pub extern "C" fn get_str(_vm: *mut VmContext, _p: *const u8, _len: u64) -> u64 {
        trap("get_str")
    }

    pub extern "C" fn throw_exc(
        _vm: *mut VmContext,
        _i: *const IRInstr,
        _handler: *const u8,
        _word: u64,
        _tag: u8,
    ) -> *const u8 {
        trap("throw_exc")
    }

    pub extern "C" fn throw_type_error(_vm: *mut VmContext, _i: *const IRInstr) -> *const u8 {
        trap("throw_type_error")
    }

    pub extern "C" fn new_clos(
        _vm: *mut VmContext,
        _i: *const IRInstr,
        _fun: *const FunEntry,
        _cells: u32,
    ) -> u64 {
        trap("new_clos")
    }

    pub extern "C" fn call_apply(
        _vm: *mut VmContext,
        _i: *const IRInstr,
        _clos: u64,
        _this: u64,
        _args: u64,
        _ra: *const u8,
    ) -> *const u8 {
        trap("call_apply")
    }

    pub extern "C" fn eval(
        _vm: *mut VmContext,
        _i: *const IRInstr,
        _src: u64,
        _ra: *const u8,
    ) -> *const u8 {
        trap("eval")
    }

    pub extern "C" fn get_time_ms(_vm: *mut VmContext) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub extern "C" fn shape_get_def(_vm: *mut VmContext, _obj: u64, _name: u64) -> u64 {
        trap("shape_get_def")
    }

    pub extern "C" fn shape_set_prop(
        _vm: *mut VmContext,
        _obj: u64,
        _name: u64,
        _shape: u64,
        _word: u64,
        _tag: u8,
    ) {
        trap("shape_set_prop")
    }

    pub extern "C" fn shape_def_const(
        _vm: *mut VmContext,
        _obj: u64,
        _name: u64,
        _word: u64,
        _tag: u8,
    ) {
        trap("shape_def_const")
    }

    pub extern "C" fn shape_set_attrs(_vm: *mut VmContext, _obj: u64, _shape: u64, _attrs: u32) {
        trap("shape_set_attrs")
    }

    pub extern "C" fn shape_get_attrs(_vm: *mut VmContext, _shape: u64) -> u32 {
        trap("shape_get_attrs")
    }

    pub extern "C" fn shape_query(_vm: *mut VmContext, _shape: u64) -> u64 {
        trap("shape_query")
    }

    pub extern "C" fn math_sin(x: f64) -> f64 {
        x.sin()
    }

    pub extern "C" fn math_cos(x: f64) -> f64 {
        x.cos()
    }

    pub extern "C" fn math_sqrt(x: f64) -> f64 {
        x.sqrt()
    }

    pub extern "C" fn math_ceil(x: f64) -> f64 {
        x.ceil()
    }

    pub extern "C" fn math_floor(x: f64) -> f64 {
        x.floor()
    }

    pub extern "C" fn math_log(x: f64) -> f64 {
        x.ln()
    }

    pub extern "C" fn math_exp(x: f64) -> f64 {
        x.exp()
    }

    pub extern "C" fn math_pow(x: f64, y: f64) -> f64 {
        x.powf(y)
    }

    pub extern "C" fn math_fmod(x: f64, y: f64) -> f64 {
        x % y
    }

    pub extern "C" fn load_lib(_vm: *mut VmContext, _path: u64) -> u64 {
        trap("load_lib")
    }

    pub extern "C" fn get_sym(_vm: *mut VmContext, _handle: u64, _name: u64) -> u64 {
        trap("get_sym")
    }

    pub extern "C" fn close_lib(_vm: *mut VmContext, _handle: u64) -> u64 {
        trap("close_lib")
    }

    pub extern "C" fn compile_trap(_vm: *mut VmContext, _id: u32) -> *const u8 {
        trap("compile callback")
    }

    pub extern "C" fn pcache_miss(
        _vm: *mut VmContext,
        _cache: *mut PropCache,
        _obj: u64,
        _shape: u64,
    ) -> u32 {
        trap("pcache_miss")
    }
}
