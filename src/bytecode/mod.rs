//! Stack bytecode
//!
//! A bytecode module is a flat code section plus a function table. Each
//! function owns a contiguous range of the code; jumps inside it carry
//! absolute code offsets. The payload layout is:
//!
//! ```text
//! name       opt str
//! imports    vec of (name: str, path: opt str)
//! exports    vec of str
//! functions  vec of (name: str, offset: u32, len: u32, params: u16, locals: u16)
//! code       u32 length + bytes
//! ```

mod builder;
pub mod libc;
pub mod opcode;

pub use builder::{compile_bytecode, BytecodeBuilder};
pub use opcode::{Instr, Instructions, Opcode};

use crate::astc::{ByteReader, ByteWriter, DecodeError, EncodeError};
use crate::ir::{FunctionInfo, ImportInfo, LowerError, ModuleInfo};
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BytecodeError {
    #[error(transparent)]
    Lower(#[from] LowerError),
    #[error("bytecode exceeds the 4 GiB code section limit")]
    TooLarge,
    #[error("string constant of {0} bytes is too long")]
    StringTooLong(usize),
    #[error("jump to label L{0} which was never bound")]
    UnboundLabel(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytecodeFunction {
    pub name: String,
    pub offset: u32,
    pub len: u32,
    pub params: u16,
    /// Frame slots, parameters included
    pub locals: u16,
}

impl BytecodeFunction {
    pub fn end(&self) -> u32 {
        self.offset + self.len
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BytecodeModule {
    pub name: Option<String>,
    pub imports: Vec<ImportInfo>,
    pub exports: Vec<String>,
    pub functions: Vec<BytecodeFunction>,
    pub code: Vec<u8>,
}

impl BytecodeModule {
    /// Code offset of `main`, if the module defines it.
    pub fn entry_offset(&self) -> Option<u32> {
        self.functions
            .iter()
            .find(|f| f.name == "main")
            .map(|f| f.offset)
    }

    /// The code range owned by `function`.
    pub fn function_code(&self, function: &BytecodeFunction) -> &[u8] {
        &self.code[function.offset as usize..function.end() as usize]
    }

    /// Module facts in the form every [`OpSink`](crate::ir::OpSink) expects.
    pub fn module_info(&self) -> ModuleInfo {
        ModuleInfo {
            name: self.name.clone(),
            imports: self.imports.clone(),
            exports: self.exports.clone(),
            functions: self
                .functions
                .iter()
                .map(|f| FunctionInfo {
                    name: f.name.clone(),
                    params: f.params,
                    locals: f.locals,
                })
                .collect(),
        }
    }

    pub fn write(&self, w: &mut ByteWriter) -> Result<(), EncodeError> {
        w.write_opt(self.name.as_ref(), |w, n| w.write_str(n))?;
        w.write_vec(&self.imports, "import list", |w, import| {
            w.write_str(&import.name)?;
            w.write_opt(import.path.as_ref(), |w, p| w.write_str(p))
        })?;
        w.write_vec(&self.exports, "export list", |w, e| w.write_str(e))?;
        w.write_vec(&self.functions, "function table", |w, f| {
            w.write_str(&f.name)?;
            w.write_u32(f.offset);
            w.write_u32(f.len);
            w.write_u16(f.params);
            w.write_u16(f.locals);
            Ok(())
        })?;
        w.write_len(self.code.len(), "code section")?;
        w.write_bytes(&self.code);
        Ok(())
    }

    pub fn read(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let name = r.read_opt(|r| r.read_str())?;
        let imports = r.read_vec(5, |r| {
            Ok(ImportInfo {
                name: r.read_str()?,
                path: r.read_opt(|r| r.read_str())?,
            })
        })?;
        let exports = r.read_vec(4, |r| r.read_str())?;
        let functions = r.read_vec(16, |r| {
            Ok(BytecodeFunction {
                name: r.read_str()?,
                offset: r.read_u32()?,
                len: r.read_u32()?,
                params: r.read_u16()?,
                locals: r.read_u16()?,
            })
        })?;
        let code_len = r.read_len(1)?;
        let code = r.read_bytes(code_len)?.to_vec();

        for f in &functions {
            let start = f.offset as usize;
            let end = start + f.len as usize;
            if end > code.len() || f.params > f.locals {
                return Err(DecodeError::FunctionOutOfRange {
                    name: f.name.clone(),
                    start,
                    end,
                    code_len: code.len(),
                });
            }
        }

        Ok(BytecodeModule {
            name,
            imports,
            exports,
            functions,
            code,
        })
    }

    /// Human-readable listing, one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        if let Some(name) = &self.name {
            let _ = writeln!(out, "module {name}");
        }
        for f in &self.functions {
            let _ = writeln!(
                out,
                "{}: ; params={} locals={} @{}..{}",
                f.name,
                f.params,
                f.locals,
                f.offset,
                f.end()
            );
            for item in Instructions::with_base(self.function_code(f), f.offset as usize) {
                match item {
                    Ok((offset, Instr::LibcCall { id, argc })) => {
                        let name = libc::name_of(id).unwrap_or("?");
                        let _ = writeln!(out, "  {offset:6}  LIBC_CALL {name} argc={argc}");
                    }
                    Ok((offset, Instr::CallUser { function, argc })) => {
                        let callee = self
                            .functions
                            .get(function as usize)
                            .map_or("?", |c| c.name.as_str());
                        let _ = writeln!(out, "  {offset:6}  CALL_USER {callee} argc={argc}");
                    }
                    Ok((offset, instr)) => {
                        let _ = writeln!(out, "  {offset:6}  {instr}");
                    }
                    Err(e) => {
                        let _ = writeln!(out, "  ; {e}");
                        break;
                    }
                }
            }
        }
        out
    }
}
