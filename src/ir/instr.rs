//! IR instructions, blocks and functions.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::runtime::layout::HDR_SLOTS;

/// Index of a function in the function registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunId(pub u32);

/// Index of a block within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Identity of an IR value. Parameter values occupy ids
/// `0..num_params`; every instruction produces one fresh id after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValId(pub u32);

/// A link-table placeholder constant. The cell starts out unallocated
/// and the code generator assigns it a table index on first use.
#[derive(Debug, Clone, Default)]
pub struct LinkSlot(Rc<Cell<Option<u32>>>);

impl LinkSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<u32> {
        self.0.get()
    }

    pub fn set(&self, idx: u32) {
        self.0.set(Some(idx));
    }
}

/// A constant instruction argument.
#[derive(Debug, Clone)]
pub enum Const {
    Int32(i32),
    Float64(f64),
    Bool(bool),
    Null,
    Undef,
    /// Interned string literal
    Str(Rc<str>),
    /// Reference to another IR function
    Fun(FunId),
    /// Link-table placeholder, allocated on first use
    Link(LinkSlot),
}

impl Const {
    pub fn str(s: &str) -> Const {
        Const::Str(Rc::from(s))
    }
}

/// An instruction argument: an IR value reference or a constant.
#[derive(Debug, Clone)]
pub enum IRArg {
    Val(ValId),
    Const(Const),
}

impl From<ValId> for IRArg {
    fn from(v: ValId) -> IRArg {
        IRArg::Val(v)
    }
}

impl From<Const> for IRArg {
    fn from(c: Const) -> IRArg {
        IRArg::Const(c)
    }
}

impl From<i32> for IRArg {
    fn from(n: i32) -> IRArg {
        IRArg::Const(Const::Int32(n))
    }
}

/// IR opcodes, grouped by lowering family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Moves and link-table access
    Mov,
    SetStr,
    MakeLink,
    GetLink,
    SetLink,

    // 32-bit integer arithmetic. Add/Sub/Mul take two branch targets in
    // their overflow variant: successor 0 on no overflow, 1 on overflow.
    AddI32,
    SubI32,
    MulI32,
    AndI32,
    OrI32,
    XorI32,
    NotI32,
    DivI32,
    ModI32,
    LsftI32,
    RsftI32,
    UrsftI32,

    // Float64 arithmetic and conversions
    AddF64,
    SubF64,
    MulF64,
    DivF64,
    SinF64,
    CosF64,
    SqrtF64,
    CeilF64,
    FloorF64,
    LogF64,
    ExpF64,
    PowF64,
    FmodF64,
    I32ToF64,
    F64ToI32,

    // Loads: base + (imm | reg) at widths 8/16/32/64; the output tag is
    // fixed by the variant
    LoadU8,
    LoadI8,
    LoadU16,
    LoadI16,
    LoadU32,
    LoadI32,
    LoadU64,
    LoadF64,
    LoadRefPtr,
    LoadRawPtr,
    LoadFunPtr,
    LoadShapePtr,

    // Stores: same widths; the 64-bit variants differ only in the type
    // side effect of the value being stored
    StoreU8,
    StoreU16,
    StoreU32,
    StoreU64,
    StoreF64,
    StoreRefPtr,
    StoreRawPtr,
    StoreFunPtr,
    StoreShapePtr,

    // Type tests
    IsInt32,
    IsInt64,
    IsFloat64,
    IsConst,
    IsRefPtr,
    IsRawPtr,
    IsObject,
    IsArray,
    IsClosure,
    IsString,
    IsShapePtr,
    IsFunPtr,

    // Comparisons
    EqI8,
    NeI8,
    EqI32,
    NeI32,
    LtI32,
    LeI32,
    GtI32,
    GeI32,
    EqI64,
    NeI64,
    LtI64,
    LeI64,
    GtI64,
    GeI64,
    EqF64,
    NeF64,
    LtF64,
    LeF64,
    GtF64,
    GeF64,

    // Control
    Jump,
    IfTrue,

    // Calls. Targets: 0 = continuation, 1 = exception edge (optional)
    CallPrim,
    Call,
    CallApply,
    CallFfi,
    Ret,
    Throw,

    // Heap allocation (inline bump-pointer fast path)
    AllocObject,
    AllocArray,
    AllocString,
    AllocClosure,

    // Closures
    NewClos,
    ClosSetCell,
    ClosGetCell,

    // Shape-based property access
    ShapeGetDef,
    ShapeSetProp,
    ShapeGetProp,
    ShapeDefConst,
    ShapeSetAttrs,
    ShapeGetAttrs,
    ShapeParent,
    ShapePropName,

    // Host and OS services
    GcCollect,
    GetTimeMs,
    LoadFile,
    EvalStr,
    LoadLib,
    GetSym,
    CloseLib,
}

impl Opcode {
    /// Whether this opcode produces an output value.
    pub fn has_output(self) -> bool {
        !matches!(
            self,
            Opcode::SetLink
                | Opcode::StoreU8
                | Opcode::StoreU16
                | Opcode::StoreU32
                | Opcode::StoreU64
                | Opcode::StoreF64
                | Opcode::StoreRefPtr
                | Opcode::StoreRawPtr
                | Opcode::StoreFunPtr
                | Opcode::StoreShapePtr
                | Opcode::Jump
                | Opcode::IfTrue
                | Opcode::Ret
                | Opcode::Throw
                | Opcode::ClosSetCell
                | Opcode::ShapeSetProp
                | Opcode::ShapeDefConst
                | Opcode::ShapeSetAttrs
                | Opcode::GcCollect
                | Opcode::CloseLib
        )
    }
}

/// A single IR instruction.
#[derive(Debug, Clone)]
pub struct IRInstr {
    pub op: Opcode,
    pub args: Vec<IRArg>,
    /// Up to two branch targets (conditional / overflow / exception edges)
    pub targets: [Option<BlockId>; 2],
    /// Identity of the value this instruction produces
    pub out: ValId,
    /// Stack home slot of the output value
    pub out_slot: u16,
    /// Number of argument references to the output
    pub use_count: u32,
}

impl IRInstr {
    /// Whether any use of the output exists.
    pub fn has_uses(&self) -> bool {
        self.use_count > 0
    }

    /// Blocks end at instructions that transfer control.
    pub fn is_terminator(&self) -> bool {
        self.targets[0].is_some() || matches!(self.op, Opcode::Ret | Opcode::Throw)
    }
}

/// A basic block: a straight-line run of instructions ending in a
/// terminator.
#[derive(Debug, Clone, Default)]
pub struct IRBlock {
    pub instrs: Vec<IRInstr>,
}

/// An IR function. Lives for the process once handed to the JIT.
#[derive(Debug, Clone)]
pub struct IRFunction {
    pub name: String,
    pub num_params: u16,
    /// Total frame size in slots: header + formals + temps
    pub num_slots: u16,
    /// Fixed-arity callees (primitives) elide the extra-argument pop
    pub fixed_arity: bool,
    pub entry: BlockId,
    pub blocks: Vec<IRBlock>,
    /// Home slot per ValId (parameters first, then instruction outputs)
    home_slots: Vec<u16>,
}

impl IRFunction {
    pub fn num_values(&self) -> u32 {
        self.home_slots.len() as u32
    }

    /// The fixed stack home slot of a value.
    pub fn home_slot(&self, v: ValId) -> u16 {
        self.home_slots[v.0 as usize]
    }

    pub fn block(&self, b: BlockId) -> &IRBlock {
        &self.blocks[b.0 as usize]
    }

    /// The value ids of the formal parameters.
    pub fn params(&self) -> impl Iterator<Item = ValId> {
        (0..self.num_params as u32).map(ValId)
    }
}

impl fmt::Display for IRFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fn {}({} params, {} slots, {} blocks)",
            self.name,
            self.num_params,
            self.num_slots,
            self.blocks.len()
        )
    }
}

/// Incremental builder for IR functions.
///
/// Allocates value ids and home slots, tracks which outputs are used,
/// and validates block structure when finished.
pub struct FunctionBuilder {
    name: String,
    num_params: u16,
    fixed_arity: bool,
    blocks: Vec<IRBlock>,
    cur: BlockId,
    home_slots: Vec<u16>,
    next_slot: u16,
    /// Definition site per instruction-produced value, for use marking
    def_sites: Vec<(BlockId, usize)>,
}

impl FunctionBuilder {
    pub fn new(name: &str, num_params: u16) -> Self {
        // Parameters live in the formal slots right after the frame header
        let home_slots = (0..num_params).map(|i| HDR_SLOTS + i).collect();
        Self {
            name: name.to_string(),
            num_params,
            fixed_arity: false,
            blocks: vec![IRBlock::default()],
            cur: BlockId(0),
            home_slots,
            next_slot: HDR_SLOTS + num_params,
            def_sites: Vec::new(),
        }
    }

    /// Mark the function as fixed-arity (primitive callee).
    pub fn fixed_arity(&mut self) -> &mut Self {
        self.fixed_arity = true;
        self
    }

    pub fn param(&self, i: u16) -> ValId {
        assert!(i < self.num_params, "parameter index out of range");
        ValId(i as u32)
    }

    /// Append a fresh empty block and return its id.
    pub fn new_block(&mut self) -> BlockId {
        self.blocks.push(IRBlock::default());
        BlockId(self.blocks.len() as u32 - 1)
    }

    /// Switch emission to the given block.
    pub fn set_block(&mut self, b: BlockId) {
        self.cur = b;
    }

    /// Append an instruction with no branch targets.
    pub fn emit(&mut self, op: Opcode, args: Vec<IRArg>) -> ValId {
        self.emit_branch(op, args, None, None)
    }

    /// Append an instruction with branch targets.
    pub fn emit_branch(
        &mut self,
        op: Opcode,
        args: Vec<IRArg>,
        t0: Option<BlockId>,
        t1: Option<BlockId>,
    ) -> ValId {
        let out = ValId(self.home_slots.len() as u32);
        let out_slot = if op.has_output() {
            let s = self.next_slot;
            self.next_slot += 1;
            s
        } else {
            0
        };
        self.home_slots.push(out_slot);

        // Any value used as an argument counts as a use at its
        // definition site
        for arg in &args {
            if let IRArg::Val(v) = arg {
                if let Some(&(b, i)) = self
                    .def_sites
                    .get((v.0 as usize).wrapping_sub(self.num_params as usize))
                {
                    self.blocks[b.0 as usize].instrs[i].use_count += 1;
                }
            }
        }

        let block = self.cur;
        self.def_sites.push((block, self.blocks[block.0 as usize].instrs.len()));
        self.blocks[block.0 as usize].instrs.push(IRInstr {
            op,
            args,
            targets: [t0, t1],
            out,
            out_slot,
            use_count: 0,
        });
        out
    }

    /// Redefine an existing value in place: a move whose output is the
    /// value itself, used for loop-carried variables. The destination
    /// keeps its home slot; successor versions see whatever location
    /// the move leaves it in.
    pub fn emit_mov_to(&mut self, dst: ValId, src: IRArg) {
        if let IRArg::Val(v) = &src {
            if let Some(&(b, i)) = self
                .def_sites
                .get((v.0 as usize).wrapping_sub(self.num_params as usize))
            {
                self.blocks[b.0 as usize].instrs[i].use_count += 1;
            }
        }
        let out_slot = self.home_slots[dst.0 as usize];
        let block = self.cur;
        self.blocks[block.0 as usize].instrs.push(IRInstr {
            op: Opcode::Mov,
            args: vec![src],
            targets: [None, None],
            out: dst,
            out_slot,
            use_count: 1,
        });
    }

    /// Finish the function, checking block structure.
    pub fn finish(self) -> IRFunction {
        for (i, block) in self.blocks.iter().enumerate() {
            let last = block
                .instrs
                .last()
                .unwrap_or_else(|| panic!("block {} is empty", i));
            assert!(last.is_terminator(), "block {} does not end in a terminator", i);
            for instr in &block.instrs {
                for t in instr.targets.iter().flatten() {
                    assert!(
                        (t.0 as usize) < self.blocks.len(),
                        "branch target {:?} out of range",
                        t
                    );
                }
            }
        }
        IRFunction {
            name: self.name,
            num_params: self.num_params,
            num_slots: self.next_slot,
            fixed_arity: self.fixed_arity,
            entry: BlockId(0),
            blocks: self.blocks,
            home_slots: self.home_slots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_slots() {
        let mut b = FunctionBuilder::new("f", 2);
        let p0 = b.param(0);
        let p1 = b.param(1);
        let sum = b.emit(Opcode::AddI32, vec![p0.into(), p1.into()]);
        b.emit(Opcode::Ret, vec![sum.into()]);
        let fun = b.finish();

        assert_eq!(fun.home_slot(p0), HDR_SLOTS);
        assert_eq!(fun.home_slot(p1), HDR_SLOTS + 1);
        assert_eq!(fun.home_slot(sum), HDR_SLOTS + 2);
        assert_eq!(fun.num_slots, HDR_SLOTS + 3);
    }

    #[test]
    fn test_use_marking() {
        let mut b = FunctionBuilder::new("f", 1);
        let p0 = b.param(0);
        let v = b.emit(Opcode::AddI32, vec![p0.into(), 1.into()]);
        let w = b.emit(Opcode::MulI32, vec![v.into(), 2.into()]);
        b.emit(Opcode::Ret, vec![w.into()]);
        let fun = b.finish();

        let block = fun.block(fun.entry);
        assert!(block.instrs[0].has_uses());
        assert_eq!(block.instrs[0].use_count, 1);
        assert!(block.instrs[1].has_uses());
    }

    #[test]
    #[should_panic(expected = "does not end in a terminator")]
    fn test_missing_terminator() {
        let mut b = FunctionBuilder::new("f", 0);
        b.emit(Opcode::AddI32, vec![1.into(), 2.into()]);
        b.finish();
    }

    #[test]
    fn test_stores_have_no_output_slot() {
        assert!(!Opcode::StoreU64.has_output());
        assert!(!Opcode::Jump.has_output());
        assert!(Opcode::LoadU64.has_output());
        assert!(Opcode::Call.has_output());
    }
}
