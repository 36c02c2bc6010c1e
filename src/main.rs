// astcc: C to ASTC to native code compiler

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use astcc::config::{Arch, CodegenMode, CompileOptions, ModuleKind, OptLevel};
use astcc::jit::{self, CompiledProgram};
use astcc::package::{self, OutputFormat};
use astcc::{astc, bytecode, parser};

/// Compile C source or ASTC files to native code.
#[derive(Parser, Debug)]
#[command(name = "astcc", version)]
struct Cli {
    /// C source file, or an .astc file to compile directly
    input: PathBuf,

    /// Output file: .exe writes a PE image, -c writes ASTC, anything else RTME
    output: PathBuf,

    /// Stop after producing an ASTC file
    #[arg(short = 'c')]
    compile_only: bool,

    /// Go through stack bytecode instead of the syntax tree
    #[arg(long)]
    bytecode: bool,

    /// Build a VM runtime module (no main required)
    #[arg(long, conflicts_with = "libc")]
    vm: bool,

    /// Build a libc runtime module (no main required)
    #[arg(long)]
    libc: bool,

    /// Target architecture: x86_64, arm64, x86_32 or arm32
    #[arg(long, default_value = "x86_64")]
    arch: Arch,

    /// Optimization level
    #[arg(short = 'O', default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    opt_level: u8,

    /// Write a symbol map next to the output
    #[arg(short = 'g')]
    debug: bool,

    /// Replace unsupported operations with NOPs instead of failing
    #[arg(long)]
    best_effort: bool,

    /// Log every pipeline stage
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn options(&self) -> CompileOptions {
        let module_kind = if self.vm {
            ModuleKind::Vm
        } else if self.libc {
            ModuleKind::Libc
        } else {
            ModuleKind::User
        };
        let mode = if self.best_effort {
            CodegenMode::BestEffort
        } else {
            CodegenMode::Strict
        };
        CompileOptions::new(self.arch)
            .with_opt_level(OptLevel::new(self.opt_level))
            .with_mode(mode)
            .with_module_kind(module_kind)
            .with_debug_info(self.debug)
    }
}

const LEGACY_FLAGS: [&str; 7] = ["arch", "vm", "libc", "help", "bytecode", "verbose", "best-effort"];

/// Accept the historical single-dash spelling of long flags (`-arch x86`).
fn normalize_args(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    args.into_iter()
        .map(|arg| {
            let legacy = arg
                .to_str()
                .and_then(|s| s.strip_prefix('-'))
                .filter(|rest| !rest.starts_with('-'))
                .filter(|rest| {
                    let name = rest.split('=').next().unwrap_or_default();
                    LEGACY_FLAGS.contains(&name)
                });
            match legacy {
                Some(rest) => OsString::from(format!("--{rest}")),
                None => arg,
            }
        })
        .collect()
}

fn read_input(path: &Path) -> anyhow::Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("cannot read {}", path.display()))
}

fn source_text(path: &Path, bytes: Vec<u8>) -> anyhow::Result<String> {
    String::from_utf8(bytes).with_context(|| format!("{} is not valid UTF-8", path.display()))
}

fn write_output(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    fs::write(path, bytes).with_context(|| format!("cannot write {}", path.display()))
}

fn compile(cli: &Cli, input: Vec<u8>) -> anyhow::Result<CompiledProgram> {
    let options = cli.options();

    if input.starts_with(&astc::MAGIC) {
        log::info!("compiling ASTC file {}", cli.input.display());
        return Ok(jit::compile_astc(&input, &options)?);
    }

    let source = source_text(&cli.input, input)?;
    log::info!("parsing {}", cli.input.display());
    let unit = parser::parse(&source)?;

    let program = if cli.bytecode {
        let module = bytecode::compile_bytecode(&unit)?;
        log::debug!("bytecode:\n{}", module.disassemble());
        jit::compile_bytecode(&module, &options)?
    } else {
        jit::compile_ast(&unit, &options)?
    };
    Ok(program)
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let input = read_input(&cli.input)?;

    if cli.compile_only {
        let source = source_text(&cli.input, input)?;
        let astc = astcc::compile_to_astc(&source, cli.bytecode)?;
        write_output(&cli.output, &astc)?;
        log::info!("wrote {} ({} bytes)", cli.output.display(), astc.len());
        return Ok(());
    }

    let program = compile(cli, input)?;
    if !program.warnings.is_empty() {
        eprintln!("{} operation(s) replaced with NOPs", program.warnings.len());
    }

    let format = OutputFormat::from_path(&cli.output);
    let image = package::package(&program, format)?;
    write_output(&cli.output, &image)?;

    if cli.debug {
        let map = package::map_path(&cli.output);
        write_output(&map, package::write_map(&program).as_bytes())?;
        log::info!("wrote symbol map {}", map.display());
    }

    let stats = program.stats;
    log::info!(
        "wrote {} ({} bytes, {} code, {format:?})",
        cli.output.display(),
        image.len(),
        program.code.len()
    );
    log::debug!(
        "optimizations: {} dead, {} folded, {} moves, {} combined",
        stats.dead_code_eliminated,
        stats.constants_folded,
        stats.redundant_moves_removed,
        stats.instructions_combined
    );
    Ok(())
}

/// Exit status for a command line clap refused: 0 for `--help` and
/// `--version`, 1 for usage errors.
fn cli_exit_status(e: &clap::Error) -> u8 {
    u8::from(e.use_stderr())
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse_from(normalize_args(std::env::args_os())) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(cli_exit_status(&e));
        }
    };

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::builder()
        .format_timestamp(None)
        .filter_level(level)
        .parse_default_env()
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_legacy_flags() {
        assert_eq!(
            normalize_args(args(&["astcc", "-arch", "arm64", "-vm", "-O2", "-c", "a.c", "b"])),
            args(&["astcc", "--arch", "arm64", "--vm", "-O2", "-c", "a.c", "b"])
        );
        assert_eq!(normalize_args(args(&["-arch=x86"])), args(&["--arch=x86"]));
    }

    #[test]
    fn test_options_from_flags() {
        let cli = Cli::parse_from(normalize_args(args(&[
            "astcc", "in.c", "out.exe", "-arch", "arm32", "-O3", "--best-effort", "--libc",
        ])));
        let options = cli.options();
        assert_eq!(options.arch, Arch::Arm32);
        assert_eq!(options.opt_level, OptLevel::O3);
        assert!(options.best_effort());
        assert_eq!(options.module_kind, ModuleKind::Libc);
    }

    #[test]
    fn test_usage_errors_exit_with_one() {
        for bad in [
            &["astcc", "a.c", "b", "-O7"][..],
            &["astcc", "a.c", "b", "--vm", "--libc"],
            &["astcc", "a.c"],
            &["astcc", "a.c", "b", "--arch", "mips"],
        ] {
            let err = Cli::try_parse_from(normalize_args(args(bad))).expect_err("must be rejected");
            assert_eq!(cli_exit_status(&err), 1, "{bad:?}");
        }

        for info in [&["astcc", "--help"][..], &["astcc", "-help"], &["astcc", "--version"]] {
            let err = Cli::try_parse_from(normalize_args(args(info))).expect_err("prints and stops");
            assert_eq!(cli_exit_status(&err), 0, "{info:?}");
        }
    }

    #[test]
    fn test_vm_and_libc_conflict() {
        assert!(Cli::try_parse_from(args(&["astcc", "a.c", "b", "--vm", "--libc"])).is_err());
        assert!(Cli::try_parse_from(args(&["astcc", "a.c", "b", "-O7"])).is_err());
    }
}
