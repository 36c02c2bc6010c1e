//! Output containers
//!
//! A compiled program is written either as an RTME runtime image or as a
//! PE32+ executable, chosen by the output file's extension. With debug info
//! enabled a plain-text map of symbols and relocations is written alongside.

pub mod pe;
pub mod rtme;

use crate::astc::DecodeError;
use crate::codegen::SymbolKind;
use crate::jit::CompiledProgram;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackageError {
    #[error("{0} bytes of machine code do not fit in a 32-bit image")]
    CodeTooLarge(usize),
    #[error("not an RTME image")]
    NotAnImage,
    #[error("unsupported RTME version {0}")]
    UnsupportedVersion(u32),
    #[error("entry point {entry} lies outside the {size}-byte code section")]
    EntryOutOfRange { entry: u32, size: usize },
    #[error("malformed image: {0}")]
    Malformed(#[from] DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Rtme,
    Pe,
}

impl OutputFormat {
    /// `.exe` selects PE; everything else is RTME.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("exe") => OutputFormat::Pe,
            _ => OutputFormat::Rtme,
        }
    }
}

/// Serialize `program` in `format`.
pub fn package(program: &CompiledProgram, format: OutputFormat) -> Result<Vec<u8>, PackageError> {
    let image = match format {
        OutputFormat::Rtme => rtme::build(&program.code, program.entry_offset)?,
        OutputFormat::Pe => pe::build(program.arch, &program.code, program.entry_offset)?,
    };
    log::debug!(
        "packaged {} bytes of code as {format:?} ({} bytes)",
        program.code.len(),
        image.len()
    );
    Ok(image)
}

/// Path of the map file written next to `output`.
pub fn map_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".map");
    PathBuf::from(name)
}

/// Text listing of every symbol and unresolved relocation.
pub fn write_map(program: &CompiledProgram) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "arch {}", program.arch);
    let _ = writeln!(out, "code {} bytes, entry {:#010x}", program.code.len(), program.entry_offset);
    let _ = writeln!(out);
    let _ = writeln!(out, "symbols:");
    for symbol in program.symbols.iter() {
        let kind = match symbol.kind {
            SymbolKind::Function if symbol.exported => "function export",
            SymbolKind::Function => "function",
            SymbolKind::External => "external",
        };
        let _ = writeln!(
            out,
            "  {:#010x} {:>6}  {:<16} {kind}",
            symbol.offset, symbol.size, symbol.name
        );
    }

    if !program.relocations.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "relocations:");
        for reloc in &program.relocations {
            let target = program.target_of(reloc).map_or("?", |s| s.name.as_str());
            let _ = writeln!(out, "  {:#010x} {:?} -> {target}", reloc.offset, reloc.kind);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Arch, CompileOptions};
    use crate::jit::compile_ast;
    use crate::parser::parse;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(OutputFormat::from_path(Path::new("a.exe")), OutputFormat::Pe);
        assert_eq!(OutputFormat::from_path(Path::new("A.EXE")), OutputFormat::Pe);
        assert_eq!(OutputFormat::from_path(Path::new("a.rtme")), OutputFormat::Rtme);
        assert_eq!(OutputFormat::from_path(Path::new("a.out")), OutputFormat::Rtme);
        assert_eq!(OutputFormat::from_path(Path::new("prog")), OutputFormat::Rtme);
        assert_eq!(map_path(Path::new("out/prog.exe")), Path::new("out/prog.exe.map"));
    }

    #[test]
    fn test_map_lists_symbols_and_relocations() {
        let unit = parse(r#"int helper() { return 1; } int main() { puts("x"); return helper(); }"#).unwrap();
        let program = compile_ast(&unit, &CompileOptions::new(Arch::X86_64)).unwrap();
        let map = write_map(&program);
        assert!(map.contains("helper"));
        assert!(map.contains("main"));
        assert!(map.contains("function export"));
        assert!(map.contains("-> __libc_dispatch"));
    }

    #[test]
    fn test_rtme_entry_points_at_main() {
        let unit = parse("int helper() { return 1; } int main() { return helper(); }").unwrap();
        let program = compile_ast(&unit, &CompileOptions::new(Arch::Arm64)).unwrap();
        let image = package(&program, OutputFormat::Rtme).unwrap();
        let parsed = rtme::parse(&image).unwrap();
        assert_eq!(parsed.entry_in_code(), program.entry_offset);
        assert!(program.entry_offset > 0);
    }
}
