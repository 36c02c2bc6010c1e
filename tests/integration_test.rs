// End-to-end tests for the compiler pipeline

use astcc::codegen::{CodegenError, Operation};
use astcc::config::{Arch, CodegenMode, CompileOptions, ModuleKind, OptLevel};
use astcc::astc::{self, tree::MAX_DEPTH, EncodeError};
use astcc::jit::{compile_ast, compile_astc, compile_bytecode};
use astcc::package::{self, rtme, OutputFormat};
use astcc::{bytecode, compile_source, compile_to_astc, parser, Error};

const LOOPS: &str = r#"
    int square(int x) {
        return x * x;
    }

    int main() {
        int sum = 0;
        for (int i = 0; i < 10; i++) {
            if (i == 3) continue;
            if (i > 7) break;
            sum += square(i);
        }
        int n = 5;
        do {
            n--;
        } while (n > 0);
        char c = 'A';
        putchar(c);
        printf("sum=%d\n", sum);
        return !sum + -n;
    }
"#;

fn x86_64() -> CompileOptions {
    CompileOptions::new(Arch::X86_64)
}

#[test]
fn test_return_constant_x86_64() {
    let program = compile_source("int main() { return 42; }", &x86_64()).expect("compilation failed");
    assert_eq!(
        program.code,
        [0x55, 0x48, 0x89, 0xE5, 0xB8, 0x2A, 0x00, 0x00, 0x00, 0x48, 0x89, 0xEC, 0x5D, 0xC3]
    );
    assert_eq!(program.entry_offset, 0);
    assert_eq!(program.stats.total(), 0);
}

#[test]
fn test_return_constant_other_targets() {
    let arm64 = compile_source("int main() { return 42; }", &CompileOptions::new(Arch::Arm64))
        .expect("compilation failed");
    // mov x0, #42
    assert!(arm64
        .code
        .chunks(4)
        .any(|w| w == 0xD280_0540u32.to_le_bytes()));
    assert_eq!(&arm64.code[arm64.code.len() - 4..], &0xD65F_03C0u32.to_le_bytes());

    let x86 = compile_source("int main() { return 42; }", &CompileOptions::new(Arch::X86_32))
        .expect("compilation failed");
    assert_eq!(x86.code.last(), Some(&0xC3));
}

#[test]
fn test_output_is_deterministic() {
    for arch in Arch::ALL {
        let options = CompileOptions::new(arch).with_opt_level(OptLevel::O2);
        let first = compile_source(LOOPS, &options).expect("first compilation failed");
        let second = compile_source(LOOPS, &options).expect("second compilation failed");
        assert_eq!(first.code, second.code, "{arch}");
    }
}

#[test]
fn test_ast_and_bytecode_agree_everywhere() {
    let unit = parser::parse(LOOPS).expect("parse failed");
    let module = bytecode::compile_bytecode(&unit).expect("bytecode failed");

    for arch in Arch::ALL {
        for level in 0..=3 {
            let options = CompileOptions::new(arch).with_opt_level(OptLevel::new(level));
            let direct = compile_ast(&unit, &options).expect("AST path failed");
            let replayed = compile_bytecode(&module, &options).expect("bytecode path failed");
            assert_eq!(direct.code, replayed.code, "{arch} O{level}");
            assert_eq!(direct.relocations.len(), replayed.relocations.len());
        }
    }
}

#[test]
fn test_astc_files_compile_like_source() {
    let options = CompileOptions::new(Arch::Arm64).with_opt_level(OptLevel::O1);
    let expected = compile_source(LOOPS, &options).expect("compilation failed");

    for as_bytecode in [false, true] {
        let file = compile_to_astc(LOOPS, as_bytecode).expect("ASTC encoding failed");
        assert_eq!(&file[0..4], b"ASTC");
        let program = compile_astc(&file, &options).expect("ASTC compilation failed");
        assert_eq!(program.code, expected.code);
    }
}

fn long_sum(terms: usize) -> String {
    format!("int main() {{ return {}; }}", vec!["1"; terms].join(" + "))
}

#[test]
fn test_long_sums_survive_astc_or_fail_to_encode() {
    // translation unit, function, body and return sit above the sum
    let deepest = MAX_DEPTH - 4;
    let source = long_sum(deepest);
    let file = compile_to_astc(&source, false).expect("encoding failed");
    let expected = compile_source(&source, &x86_64()).expect("compilation failed");
    let program = compile_astc(&file, &x86_64()).expect("ASTC compilation failed");
    assert_eq!(program.code, expected.code);

    let unit = parser::parse(&source).expect("parse failed");
    match astc::decode(&file).expect("decode failed").payload {
        astc::AstcPayload::Tree(decoded) => assert_eq!(decoded, unit),
        other => panic!("expected a tree payload, got {other:?}"),
    }

    let too_deep = long_sum(deepest + 1);
    assert!(compile_source(&too_deep, &x86_64()).is_ok());
    assert!(matches!(
        compile_to_astc(&too_deep, false),
        Err(Error::Encode(EncodeError::TooDeep(MAX_DEPTH)))
    ));
    // the bytecode payload is flat
    let bytecode = compile_to_astc(&too_deep, true).expect("bytecode encoding failed");
    assert!(compile_astc(&bytecode, &x86_64()).is_ok());
}

#[test]
fn test_optimization_levels() {
    let source = "int main() { int a = 1; int b = a + 2; return b; }";
    let o0 = compile_source(source, &x86_64()).expect("O0 failed");
    let o2 = compile_source(source, &x86_64().with_opt_level(OptLevel::O2)).expect("O2 failed");

    assert!(o2.code.len() < o0.code.len());
    assert_eq!(o2.stats.constants_folded, 1);
    assert!(o2.stats.redundant_moves_removed >= 1);

    let zero = compile_source("int main() { return 0; }", &x86_64().with_opt_level(OptLevel::O2))
        .expect("compilation failed");
    assert_eq!(
        zero.code,
        [0x55, 0x48, 0x89, 0xE5, 0x31, 0xC0, 0x48, 0x89, 0xEC, 0x5D, 0xC3]
    );
    assert_eq!(zero.stats.instructions_combined, 1);
}

#[test]
fn test_optimized_loops_stay_linked() {
    // symbol ranges follow the code through every pass
    let program = compile_source(LOOPS, &x86_64().with_opt_level(OptLevel::O3)).expect("compilation failed");
    let main = program.symbols.lookup("main").expect("main missing");
    let square = program.symbols.lookup("square").expect("square missing");
    assert!(square.offset + square.size <= main.offset);
    assert_eq!(main.offset + main.size, program.code.len());
}

#[test]
fn test_arm32_division_strict_and_best_effort() {
    let source = "int main() { int a = 9; return a / 2; }";

    let strict = compile_source(source, &CompileOptions::new(Arch::Arm32));
    match strict {
        Err(Error::Codegen(CodegenError::Unsupported { arch, op })) => {
            assert_eq!(arch, Arch::Arm32);
            assert_eq!(op, Operation::Div);
        }
        other => panic!("expected an unsupported-operation error, got {other:?}"),
    }

    let options = CompileOptions::new(Arch::Arm32).with_mode(CodegenMode::BestEffort);
    let program = compile_source(source, &options).expect("best-effort compilation failed");
    assert_eq!(program.warnings.len(), 1);
    assert!(program.code.chunks(4).any(|w| w == [0x00, 0x00, 0xA0, 0xE1]));
}

#[test]
fn test_main_requirement_follows_module_kind() {
    let source = "int helper(int x) { return x + 1; }";
    assert!(matches!(
        compile_source(source, &x86_64()),
        Err(Error::Codegen(CodegenError::MissingMain))
    ));

    for kind in [ModuleKind::Vm, ModuleKind::Libc] {
        let program = compile_source(source, &x86_64().with_module_kind(kind)).expect("runtime module failed");
        assert_eq!(program.entry_offset, 0);
        assert!(program.symbols.lookup("helper").is_some());
    }
}

#[test]
fn test_libc_calls_stay_unresolved() {
    let program = compile_source(LOOPS, &x86_64()).expect("compilation failed");
    assert_eq!(program.relocations.len(), 2);
    for reloc in &program.relocations {
        let target = program.target_of(reloc).expect("dangling relocation");
        assert_eq!(target.name, "__libc_dispatch");
    }
}

#[test]
fn test_exports_limit_exported_symbols() {
    let source = r#"
        export main;
        int hidden() { return 1; }
        int main() { return hidden(); }
    "#;
    let program = compile_source(source, &x86_64()).expect("compilation failed");
    assert!(program.symbols.lookup("main").expect("main").exported);
    assert!(!program.symbols.lookup("hidden").expect("hidden").exported);
}

#[test]
fn test_rtme_package() {
    let program = compile_source(LOOPS, &x86_64()).expect("compilation failed");
    let image = package::package(&program, OutputFormat::Rtme).expect("packaging failed");

    assert_eq!(&image[0..4], b"RTME");
    assert_eq!(u32::from_le_bytes(image[4..8].try_into().unwrap()), 1);
    assert_eq!(
        u32::from_le_bytes(image[8..12].try_into().unwrap()) as usize,
        program.code.len()
    );
    assert_eq!(
        u32::from_le_bytes(image[12..16].try_into().unwrap()) as usize,
        16 + program.entry_offset
    );
    assert_eq!(&image[16..], &program.code[..]);
    assert_eq!(rtme::parse(&image).expect("parse failed").code, &program.code[..]);
}

#[test]
fn test_pe_package() {
    let program = compile_source(LOOPS, &CompileOptions::new(Arch::Arm64)).expect("compilation failed");
    let image = package::package(&program, OutputFormat::Pe).expect("packaging failed");

    assert_eq!(&image[0..2], b"MZ");
    assert_eq!(&image[0x80..0x84], b"PE\0\0");
    assert_eq!(u16::from_le_bytes([image[0x84], image[0x85]]), 0xAA64);
    let entry = u32::from_le_bytes(image[0x98 + 16..0x98 + 20].try_into().unwrap());
    assert_eq!(entry as usize, 0x1000 + program.entry_offset);
    assert_eq!(image.len() % 0x200, 0);
    assert_eq!(&image[0x400..0x400 + program.code.len()], &program.code[..]);
}

#[test]
fn test_front_end_errors_are_reported() {
    assert!(matches!(
        compile_source("int main() { return 1 }", &x86_64()),
        Err(Error::Parse(_))
    ));
    assert!(matches!(
        compile_source("int main() { return missing; }", &x86_64()),
        Err(Error::Codegen(CodegenError::Lower(_)))
    ));
    assert!(matches!(
        compile_source("int main() { float f = 1.5; return 0; }", &x86_64()),
        Err(Error::Codegen(CodegenError::Lower(_)))
    ));
}
