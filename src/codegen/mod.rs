//! Machine code generation
//!
//! One [`Emitter`] per architecture encodes stack-machine operations into a
//! [`CodeBuffer`]. The result is a [`MachineCode`] image: raw bytes, the
//! instruction start offsets, every intra-module branch, the symbol table and
//! the relocations that still point outside the module.

pub mod arm32;
pub mod arm64;
mod buffer;
pub mod emitter;
pub mod symbols;
pub mod x86_32;
pub mod x86_64;

pub use buffer::CodeBuffer;
pub use emitter::{emitter_for, Arith, BranchSite, EmitError, Emitter, Operation};
pub use symbols::{Relocation, Symbol, SymbolId, SymbolKind, SymbolTable};

use crate::astc::DecodeError;
use crate::config::Arch;
use crate::ir::LowerError;

/// Name every library call is relocated against. The runtime provides it.
pub const LIBC_DISPATCH: &str = "__libc_dispatch";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodegenError {
    #[error(transparent)]
    Lower(#[from] LowerError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("{op} is not supported on {arch}")]
    Unsupported { arch: Arch, op: Operation },
    #[error("machine code would grow to {requested} bytes (limit {limit})")]
    OutOfMemory { requested: usize, limit: usize },
    #[error("{op} operand {value} cannot be encoded on {arch}")]
    OperandRange {
        arch: Arch,
        op: Operation,
        value: i64,
    },
    #[error("branch at {site:#x} cannot reach {target:#x}")]
    BranchOutOfRange { site: usize, target: usize },
    #[error("jump in '{function}' targets {target}, which is not an instruction boundary")]
    InvalidJumpTarget { function: String, target: u32 },
    #[error("call to function #{0}, which the module does not define")]
    UnknownFunction(u16),
    #[error("symbol '{0}' is defined more than once")]
    DuplicateSymbol(String),
    #[error("jump to label L{0} which was never bound")]
    UnboundLabel(u32),
    #[error("no 'main' function defined")]
    MissingMain,
}

impl From<EmitError> for CodegenError {
    fn from(e: EmitError) -> Self {
        match e {
            EmitError::Unsupported { arch, op } => CodegenError::Unsupported { arch, op },
            EmitError::OutOfMemory { requested, limit } => {
                CodegenError::OutOfMemory { requested, limit }
            }
            EmitError::OperandRange { arch, op, value } => {
                CodegenError::OperandRange { arch, op, value }
            }
        }
    }
}

/// Encoding of a branch displacement field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchKind {
    /// 32-bit displacement from the end of the field
    X86Rel32,
    /// `b`/`bl`: 26-bit word displacement from the instruction
    Arm64B26,
    /// `cbz`: 19-bit word displacement in bits 5..24
    Arm64Cbz19,
    /// `b`/`bl`/`beq`: 24-bit word displacement from the instruction + 8
    Arm32B24,
}

impl BranchKind {
    /// Write the displacement from `site` to `target` into `code`.
    pub fn patch(self, code: &mut [u8], site: usize, target: usize) -> Result<(), CodegenError> {
        let out_of_range = || CodegenError::BranchOutOfRange { site, target };
        let delta = target as i64 - site as i64;

        let fits = |value: i64, bits: u32| {
            let half = 1i64 << (bits - 1);
            (-half..half).contains(&value)
        };
        let word = |code: &[u8]| {
            u32::from_le_bytes([code[site], code[site + 1], code[site + 2], code[site + 3]])
        };

        let field = match self {
            BranchKind::X86Rel32 => {
                let rel = delta - 4;
                i32::try_from(rel).map_err(|_| out_of_range())? as u32
            }
            BranchKind::Arm64B26 => {
                if delta % 4 != 0 || !fits(delta / 4, 26) {
                    return Err(out_of_range());
                }
                (word(code) & !0x03FF_FFFF) | ((delta / 4) as u32 & 0x03FF_FFFF)
            }
            BranchKind::Arm64Cbz19 => {
                if delta % 4 != 0 || !fits(delta / 4, 19) {
                    return Err(out_of_range());
                }
                (word(code) & !(0x7FFFF << 5)) | (((delta / 4) as u32 & 0x7FFFF) << 5)
            }
            BranchKind::Arm32B24 => {
                let rel = delta - 8;
                if rel % 4 != 0 || !fits(rel / 4, 24) {
                    return Err(out_of_range());
                }
                (word(code) & !0x00FF_FFFF) | ((rel / 4) as u32 & 0x00FF_FFFF)
            }
        };
        code[site..site + 4].copy_from_slice(&field.to_le_bytes());
        Ok(())
    }
}

/// A resolved branch inside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    pub site: usize,
    pub kind: BranchKind,
    pub target: usize,
}

/// Byte ranges removed by an optimizer pass, as `(offset, removed)` pairs in
/// ascending order. Maps old offsets to new ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetMap {
    edits: Vec<(usize, usize)>,
}

impl OffsetMap {
    pub fn new(edits: Vec<(usize, usize)>) -> Self {
        Self { edits }
    }

    pub fn is_identity(&self) -> bool {
        self.edits.is_empty()
    }

    /// Whether old offset `at` lies inside a removed range.
    pub fn is_removed(&self, at: usize) -> bool {
        self.edits
            .iter()
            .any(|&(start, removed)| (start..start + removed).contains(&at))
    }

    /// New position of old offset `at`. Offsets inside a removed range map to
    /// its start.
    pub fn remap(&self, at: usize) -> usize {
        let mut shift = 0;
        for &(start, removed) in &self.edits {
            if start >= at {
                break;
            }
            shift += removed.min(at - start);
        }
        at - shift
    }
}

/// A generated code image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineCode {
    pub arch: Arch,
    pub code: Vec<u8>,
    /// Instruction start offsets, ascending
    pub marks: Vec<usize>,
    pub branches: Vec<Branch>,
    pub symbols: SymbolTable,
    /// Calls to symbols this module does not define
    pub relocations: Vec<Relocation>,
}

impl MachineCode {
    /// Replace the code with an optimized version and move every recorded
    /// offset along with it.
    pub fn apply(&mut self, code: Vec<u8>, map: &OffsetMap) {
        self.code = code;
        if map.is_identity() {
            return;
        }

        let mut marks: Vec<usize> = self
            .marks
            .iter()
            .filter(|&&m| !map.is_removed(m))
            .map(|&m| map.remap(m))
            .collect();
        marks.dedup();
        self.marks = marks;

        for branch in &mut self.branches {
            branch.site = map.remap(branch.site);
            branch.target = map.remap(branch.target);
        }
        for symbol in self.symbols.iter_mut() {
            if symbol.kind == SymbolKind::Function {
                let start = map.remap(symbol.offset);
                let end = map.remap(symbol.offset + symbol.size);
                symbol.offset = start;
                symbol.size = end - start;
            }
        }
        for reloc in &mut self.relocations {
            reloc.offset = map.remap(reloc.offset);
        }
    }

    /// Rewrite every branch displacement from the recorded targets.
    pub fn relink(&mut self) -> Result<(), CodegenError> {
        for branch in &self.branches {
            branch.kind.patch(&mut self.code, branch.site, branch.target)?;
        }
        Ok(())
    }

    /// Offset of `main`, if defined.
    pub fn entry_offset(&self) -> Option<usize> {
        self.symbols
            .lookup("main")
            .filter(|s| s.kind == SymbolKind::Function)
            .map(|s| s.offset)
    }

    /// Start of the instruction following the one at `mark`.
    pub fn instruction_end(&self, mark: usize) -> usize {
        match self.marks.binary_search(&mark) {
            Ok(i) => self.marks.get(i + 1).copied().unwrap_or(self.code.len()),
            Err(_) => mark,
        }
    }

    pub fn is_branch_target(&self, offset: usize) -> bool {
        self.branches.iter().any(|b| b.target == offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x86_rel32() {
        let mut code = vec![0xE9, 0, 0, 0, 0, 0x90, 0x90];
        BranchKind::X86Rel32.patch(&mut code, 1, 7).unwrap();
        assert_eq!(&code[1..5], &2i32.to_le_bytes());
        BranchKind::X86Rel32.patch(&mut code, 1, 0).unwrap();
        assert_eq!(&code[1..5], &(-5i32).to_le_bytes());
    }

    #[test]
    fn test_arm_fields_keep_opcode_bits() {
        let mut code = 0x1400_0000u32.to_le_bytes().to_vec();
        code.extend_from_slice(&[0; 8]);
        BranchKind::Arm64B26.patch(&mut code, 0, 8).unwrap();
        assert_eq!(&code[0..4], &0x1400_0002u32.to_le_bytes());

        let mut code = 0xB400_0000u32.to_le_bytes().to_vec();
        BranchKind::Arm64Cbz19.patch(&mut code, 0, 0).unwrap();
        assert_eq!(&code[0..4], &0xB400_0000u32.to_le_bytes());

        let mut code = 0xEA00_0000u32.to_le_bytes().to_vec();
        BranchKind::Arm32B24.patch(&mut code, 0, 0).unwrap();
        // pc reads 8 ahead, so a self branch is -2 words
        assert_eq!(&code[0..4], &0xEAFF_FFFEu32.to_le_bytes());
    }

    #[test]
    fn test_out_of_range() {
        let mut code = 0xB400_0000u32.to_le_bytes().to_vec();
        let err = BranchKind::Arm64Cbz19.patch(&mut code, 0, 4 << 19);
        assert!(matches!(err, Err(CodegenError::BranchOutOfRange { .. })));

        let err = BranchKind::Arm64B26.patch(&mut code, 0, 2);
        assert!(matches!(err, Err(CodegenError::BranchOutOfRange { .. })));
    }

    #[test]
    fn test_offset_map() {
        let map = OffsetMap::new(vec![(4, 3), (10, 2)]);
        assert_eq!(map.remap(0), 0);
        assert_eq!(map.remap(4), 4);
        assert_eq!(map.remap(5), 4);
        assert_eq!(map.remap(7), 4);
        assert_eq!(map.remap(8), 5);
        assert_eq!(map.remap(12), 7);
        assert_eq!(map.remap(20), 15);
        assert!(map.is_removed(5));
        assert!(!map.is_removed(7));
    }
}
