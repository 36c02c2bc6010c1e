use super::buffer::CodeBuffer;
use super::{arm32, arm64, x86_32, x86_64, BranchKind};
use crate::config::Arch;
use crate::ir::Cmp;
use std::fmt;

/// Every operation an emitter knows how to encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Prologue,
    LoadArg,
    Const,
    ConstString,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Compare,
    AddImm,
    Load,
    Store,
    Drop,
    Halt,
    ReturnConst,
    Jump,
    JumpIfFalse,
    Call,
    LibcCall,
    Nop,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Prologue => "prologue",
            Operation::LoadArg => "argument load",
            Operation::Const => "constant",
            Operation::ConstString => "string constant",
            Operation::Add => "add",
            Operation::Sub => "sub",
            Operation::Mul => "mul",
            Operation::Div => "div",
            Operation::Mod => "mod",
            Operation::Compare => "compare",
            Operation::AddImm => "add immediate",
            Operation::Load => "local load",
            Operation::Store => "local store",
            Operation::Drop => "drop",
            Operation::Halt => "halt",
            Operation::ReturnConst => "constant return",
            Operation::Jump => "jump",
            Operation::JumpIfFalse => "conditional jump",
            Operation::Call => "call",
            Operation::LibcCall => "library call",
            Operation::Nop => "nop",
        };
        f.write_str(name)
    }
}

/// Arithmetic handled by [`Emitter::arith`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl Arith {
    pub fn operation(self) -> Operation {
        match self {
            Arith::Add => Operation::Add,
            Arith::Sub => Operation::Sub,
            Arith::Mul => Operation::Mul,
            Arith::Div => Operation::Div,
            Arith::Mod => Operation::Mod,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmitError {
    #[error("{op} is not supported on {arch}")]
    Unsupported { arch: Arch, op: Operation },
    #[error("machine code buffer would grow to {requested} bytes (limit {limit})")]
    OutOfMemory { requested: usize, limit: usize },
    #[error("{op} operand {value} cannot be encoded on {arch}")]
    OperandRange {
        arch: Arch,
        op: Operation,
        value: i64,
    },
}

/// A branch field left for the linker to fill in.
///
/// `offset` is the rel32 field on x86 and the branch instruction itself on ARM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchSite {
    pub offset: usize,
    pub kind: BranchKind,
}

/// Instruction encoder for one target.
///
/// Generated code runs a stack machine on the native stack: every value-producing
/// operation pushes one machine word and consumers pop their operands. Each
/// function keeps a frame pointer so locals and arguments have fixed
/// displacements from it.
pub trait Emitter {
    fn arch(&self) -> Arch;

    /// Bytes of the target's canonical no-op.
    fn nop(&self) -> &'static [u8];

    /// Set up a frame with `slots` local slots.
    fn prologue(&self, buf: &mut CodeBuffer, slots: u16) -> Result<(), EmitError>;

    /// Push argument `index` of `argc` (the caller pushed them left to right).
    fn load_arg(&self, buf: &mut CodeBuffer, index: u16, argc: u16) -> Result<(), EmitError>;

    fn const_i32(&self, buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError>;

    /// Embed `bytes` plus a NUL terminator inline and push its address.
    fn const_string(&self, buf: &mut CodeBuffer, bytes: &[u8]) -> Result<(), EmitError>;

    fn arith(&self, buf: &mut CodeBuffer, op: Arith) -> Result<(), EmitError>;

    fn compare(&self, buf: &mut CodeBuffer, cmp: Cmp) -> Result<(), EmitError>;

    /// Add a constant to the top of the stack in place.
    fn add_imm(&self, buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError>;

    fn load_local(&self, buf: &mut CodeBuffer, slot: u32) -> Result<(), EmitError>;

    fn store_local(&self, buf: &mut CodeBuffer, slot: u32) -> Result<(), EmitError>;

    fn drop_top(&self, buf: &mut CodeBuffer) -> Result<(), EmitError>;

    /// Pop the return value and leave the function.
    fn halt(&self, buf: &mut CodeBuffer) -> Result<(), EmitError>;

    fn return_const(&self, buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError>;

    fn jump(&self, buf: &mut CodeBuffer) -> Result<BranchSite, EmitError>;

    /// Pop a value and branch if it is zero.
    fn jump_if_false(&self, buf: &mut CodeBuffer) -> Result<BranchSite, EmitError>;

    /// Call a function whose `argc` arguments are on the stack, then replace
    /// them with its result.
    fn call(&self, buf: &mut CodeBuffer, argc: u16) -> Result<BranchSite, EmitError>;

    /// Call the runtime's library dispatcher with `(id, argc, args)`.
    fn libc_call(&self, buf: &mut CodeBuffer, id: u16, argc: u16) -> Result<BranchSite, EmitError>;
}

/// The emitter for `arch`.
pub fn emitter_for(arch: Arch) -> Box<dyn Emitter> {
    match arch {
        Arch::X86_64 => Box::new(x86_64::X86_64),
        Arch::Arm64 => Box::new(arm64::Arm64),
        Arch::X86_32 => Box::new(x86_32::X86_32),
        Arch::Arm32 => Box::new(arm32::Arm32),
    }
}

pub(crate) fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}
