//! # Introduction
//!
//! astcc compiles a subset of C to native machine code for x86-64, ARM64,
//! x86-32 and ARM32. Programs can be stored in between as ASTC files, either
//! as a serialized syntax tree or as stack bytecode, and compiled later.
//!
//! ## Pipeline
//!
//! ```text
//! Source → Lexer → Parser → AST ─┬─────────────────→ JIT → Optimizer → RTME / PE
//!                                └→ ASTC (tree | bytecode) ┘
//! ```
//!
//! 1. [`parser`] tokenises the source and builds an AST.
//! 2. [`ir`] lowers the AST into stack-machine operations delivered to a sink.
//! 3. [`bytecode`] is one such sink; [`astc`] wraps trees and bytecode in a
//!    versioned container.
//! 4. [`jit`] is the other: it drives the per-architecture [`codegen`]
//!    emitters, from the AST directly or by replaying bytecode. Both routes
//!    produce identical machine code.
//! 5. [`optimizer`] rewrites the generated code at instruction boundaries.
//! 6. [`package`] writes RTME runtime images or PE executables.
//!
//! All target selection is carried by [`config::CompileOptions`]; nothing
//! depends on the host the compiler runs on.

pub mod astc;
pub mod bytecode;
pub mod codegen;
pub mod config;
pub mod ir;
pub mod jit;
pub mod optimizer;
pub mod package;
pub mod parser;

use config::CompileOptions;
use jit::CompiledProgram;

/// Any failure along the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse failed with {0}")]
    Parse(#[from] parser::ParseErrors),
    #[error(transparent)]
    Lower(#[from] ir::LowerError),
    #[error(transparent)]
    Bytecode(#[from] bytecode::BytecodeError),
    #[error("cannot encode ASTC: {0}")]
    Encode(#[from] astc::EncodeError),
    #[error("cannot decode ASTC: {0}")]
    Decode(#[from] astc::DecodeError),
    #[error(transparent)]
    Codegen(#[from] codegen::CodegenError),
    #[error(transparent)]
    Package(#[from] package::PackageError),
}

/// Parse `source` and compile it to native code.
pub fn compile_source(source: &str, options: &CompileOptions) -> Result<CompiledProgram, Error> {
    let unit = parser::parse(source)?;
    Ok(jit::compile_ast(&unit, options)?)
}

/// Parse `source` and serialize it as an ASTC file, as bytecode when
/// `bytecode` is set and as a syntax tree otherwise.
pub fn compile_to_astc(source: &str, bytecode: bool) -> Result<Vec<u8>, Error> {
    let unit = parser::parse(source)?;
    if bytecode {
        let module = bytecode::compile_bytecode(&unit)?;
        log::info!(
            "bytecode: {} function(s), {} bytes of code",
            module.functions.len(),
            module.code.len()
        );
        Ok(astc::encode_bytecode(&module)?)
    } else {
        Ok(astc::encode_tree(&unit)?)
    }
}
