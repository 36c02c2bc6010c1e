//! Native compilation driver
//!
//! Takes a parsed program, a bytecode module or a raw ASTC file and produces
//! a [`CompiledProgram`] for the architecture named in [`CompileOptions`]:
//!
//! 1. operations are generated into a fresh [`CompilationContext`]
//! 2. the optimizer runs at the requested level
//! 3. every intra-module branch is relinked against its final target
//!
//! Calls that leave the module (the libc dispatcher, functions of other
//! modules) stay in [`CompiledProgram::relocations`] for the packager.

mod context;
mod stream;

pub use context::{CompilationContext, Generated};
pub use stream::replay;

use crate::astc::{self, AstcPayload};
use crate::bytecode::{BytecodeModule, Instr, Instructions};
use crate::codegen::{CodegenError, Relocation, Symbol, SymbolTable};
use crate::config::{Arch, CompileOptions};
use crate::ir;
use crate::optimizer::{self, CodeQualityHook, NoopHook, OptimizationStats};
use crate::parser::ast::AstNode;

const BASE_CODE_LIMIT: usize = 4096;
const BYTES_PER_UNIT: usize = 64;

/// Result of one native compilation.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub arch: Arch,
    pub code: Vec<u8>,
    /// Offset of `main`, or 0 for runtime modules without one
    pub entry_offset: usize,
    pub symbols: SymbolTable,
    pub relocations: Vec<Relocation>,
    pub stats: OptimizationStats,
    pub warnings: Vec<String>,
}

impl CompiledProgram {
    /// Symbol a relocation points at.
    pub fn target_of(&self, reloc: &Relocation) -> Option<&Symbol> {
        self.symbols.get(reloc.symbol)
    }
}

/// Input accepted by [`compile`].
#[derive(Debug, Clone, Copy)]
pub enum Program<'a> {
    Ast(&'a AstNode),
    Bytecode(&'a BytecodeModule),
}

fn code_limit(options: &CompileOptions, units: usize, string_bytes: usize) -> usize {
    options.max_code_size.unwrap_or_else(|| {
        BASE_CODE_LIMIT
            .saturating_add(units.saturating_mul(BYTES_PER_UNIT))
            .saturating_add(string_bytes.saturating_mul(2))
    })
}

fn ast_limit(unit: &AstNode, options: &CompileOptions) -> usize {
    let mut nodes = 0;
    let mut strings = 0;
    unit.visit(&mut |node| {
        nodes += 1;
        if let AstNode::StringLiteral(s, _) = node {
            strings += s.len();
        }
    });
    code_limit(options, nodes, strings)
}

fn bytecode_limit(module: &BytecodeModule, options: &CompileOptions) -> usize {
    let strings = Instructions::new(&module.code)
        .filter_map(Result::ok)
        .map(|(_, instr)| match instr {
            Instr::ConstString(bytes) => bytes.len(),
            _ => 0,
        })
        .sum();
    code_limit(options, module.code.len(), strings)
}

/// Compile `program`, consulting `hook` at the highest optimization level.
pub fn compile(
    program: Program<'_>,
    options: &CompileOptions,
    hook: &mut dyn CodeQualityHook,
) -> Result<CompiledProgram, CodegenError> {
    let limit = match program {
        Program::Ast(unit) => ast_limit(unit, options),
        Program::Bytecode(module) => bytecode_limit(module, options),
    };
    log::debug!(
        "compiling for {} at {} (code limit {limit} bytes)",
        options.arch,
        options.opt_level
    );

    let mut ctx = CompilationContext::new(options, limit);
    match program {
        Program::Ast(unit) => {
            ir::lower(unit, &mut ctx)?;
        }
        Program::Bytecode(module) => replay(module, &mut ctx)?,
    }

    let Generated {
        mut machine,
        mut stats,
        warnings,
    } = ctx.finish()?;

    stats += optimizer::optimize(&mut machine, options.opt_level, hook);
    machine.relink()?;

    let entry_offset = machine.entry_offset().unwrap_or(0);
    log::info!(
        "generated {} bytes of {} code ({} symbol(s), {} external call(s), {} optimization(s))",
        machine.code.len(),
        options.arch,
        machine.symbols.len(),
        machine.relocations.len(),
        stats.total()
    );

    Ok(CompiledProgram {
        arch: machine.arch,
        code: machine.code,
        entry_offset,
        symbols: machine.symbols,
        relocations: machine.relocations,
        stats,
        warnings,
    })
}

/// Compile a parsed translation unit.
pub fn compile_ast(unit: &AstNode, options: &CompileOptions) -> Result<CompiledProgram, CodegenError> {
    compile(Program::Ast(unit), options, &mut NoopHook)
}

/// Compile a bytecode module.
pub fn compile_bytecode(
    module: &BytecodeModule,
    options: &CompileOptions,
) -> Result<CompiledProgram, CodegenError> {
    compile(Program::Bytecode(module), options, &mut NoopHook)
}

/// Decode an ASTC file and compile whichever payload it carries.
pub fn compile_astc(bytes: &[u8], options: &CompileOptions) -> Result<CompiledProgram, CodegenError> {
    match astc::decode(bytes)?.payload {
        AstcPayload::Tree(unit) => compile_ast(&unit, options),
        AstcPayload::Bytecode(module) => compile_bytecode(&module, options),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CodegenMode, ModuleKind, OptLevel};
    use crate::parser::parse;

    fn unit(source: &str) -> AstNode {
        parse(source).unwrap()
    }

    #[test]
    fn test_return_42_x86_64() {
        let program = compile_ast(&unit("int main() { return 42; }"), &CompileOptions::new(Arch::X86_64)).unwrap();
        assert_eq!(
            program.code,
            [0x55, 0x48, 0x89, 0xE5, 0xB8, 0x2A, 0, 0, 0, 0x48, 0x89, 0xEC, 0x5D, 0xC3]
        );
        assert_eq!(program.entry_offset, 0);
        assert!(program.relocations.is_empty());
    }

    #[test]
    fn test_ast_and_bytecode_paths_agree() {
        let source = r#"
            int add(int a, int b) { return a + b; }
            int main() {
                int i = 0;
                int total = 0;
                while (i < 10) {
                    total = add(total, i);
                    i = i + 1;
                }
                printf("%d\n", total);
                return total;
            }
        "#;
        let ast = unit(source);
        let module = crate::bytecode::compile_bytecode(&ast).unwrap();
        for arch in Arch::ALL {
            for level in 0..=3 {
                let options = CompileOptions::new(arch).with_opt_level(OptLevel::new(level));
                let a = compile_ast(&ast, &options).unwrap();
                let b = compile_bytecode(&module, &options).unwrap();
                assert_eq!(a.code, b.code, "{arch} O{level}");
                assert_eq!(a.entry_offset, b.entry_offset);
            }
        }
    }

    #[test]
    fn test_calls_are_linked() {
        let source = "int one() { return 1; } int main() { return one(); }";
        let program = compile_ast(&unit(source), &CompileOptions::new(Arch::X86_64)).unwrap();
        let one = program.symbols.lookup("one").unwrap();
        let main = program.symbols.lookup("main").unwrap();
        assert_eq!(one.offset, 0);
        assert_eq!(program.entry_offset, main.offset);

        let call = program.code[main.offset..]
            .iter()
            .position(|&b| b == 0xE8)
            .map(|i| main.offset + i)
            .unwrap();
        let rel = i32::from_le_bytes(program.code[call + 1..call + 5].try_into().unwrap());
        assert_eq!(call as i64 + 5 + rel as i64, one.offset as i64);
    }

    #[test]
    fn test_explicit_limit() {
        let options = CompileOptions::new(Arch::X86_64).with_max_code_size(8);
        let err = compile_ast(&unit("int main() { return 42; }"), &options).unwrap_err();
        assert!(matches!(err, CodegenError::OutOfMemory { limit: 8, .. }));
    }

    #[test]
    fn test_runtime_module_without_main() {
        let ast = unit("int helper(int x) { return x * 2; }");
        let user = compile_ast(&ast, &CompileOptions::new(Arch::Arm64));
        assert_eq!(user.unwrap_err(), CodegenError::MissingMain);

        let options = CompileOptions::new(Arch::Arm64).with_module_kind(ModuleKind::Vm);
        let vm = compile_ast(&ast, &options).unwrap();
        assert_eq!(vm.entry_offset, 0);
    }

    #[test]
    fn test_best_effort_warnings_survive() {
        let options = CompileOptions::new(Arch::Arm32).with_mode(CodegenMode::BestEffort);
        let program = compile_ast(&unit("int main() { int a = 7; return a / 2; }"), &options).unwrap();
        assert_eq!(program.warnings.len(), 1);
    }

    #[test]
    fn test_astc_dispatch() {
        let ast = unit("int main() { return 3; }");
        let options = CompileOptions::new(Arch::X86_64);
        let from_tree = compile_astc(&astc::encode_tree(&ast).unwrap(), &options).unwrap();
        let module = crate::bytecode::compile_bytecode(&ast).unwrap();
        let from_bytecode = compile_astc(&astc::encode_bytecode(&module).unwrap(), &options).unwrap();
        assert_eq!(from_tree.code, from_bytecode.code);
        assert!(matches!(
            compile_astc(b"NOPE", &options),
            Err(CodegenError::Decode(_))
        ));
    }
}
