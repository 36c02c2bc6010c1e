//! Compilation options
//!
//! Everything the pipeline needs to know about the target is carried by a
//! [`CompileOptions`] value built at startup. Nothing here is detected from the
//! host at compile time; the caller chooses the architecture explicitly.

use std::fmt;
use std::str::FromStr;

/// Target instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Arm64,
    X86_32,
    Arm32,
}

impl Arch {
    /// Every architecture the emitter table supports.
    pub const ALL: [Arch; 4] = [Arch::X86_64, Arch::Arm64, Arch::X86_32, Arch::Arm32];

    /// Canonical command-line spelling.
    pub fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm64 => "arm64",
            Arch::X86_32 => "x86_32",
            Arch::Arm32 => "arm32",
        }
    }

    pub fn is_x86(self) -> bool {
        matches!(self, Arch::X86_64 | Arch::X86_32)
    }

    pub fn pointer_width(self) -> u32 {
        match self {
            Arch::X86_64 | Arch::Arm64 => 8,
            Arch::X86_32 | Arch::Arm32 => 4,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when an architecture name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown target architecture '{0}' (expected x86_64, arm64, x86_32 or arm32)")]
pub struct UnknownArch(pub String);

impl FromStr for Arch {
    type Err = UnknownArch;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x86_64" | "x86-64" | "amd64" | "x64" => Ok(Arch::X86_64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            "x86_32" | "x86" | "i386" | "i686" => Ok(Arch::X86_32),
            "arm32" | "arm" | "armv7" => Ok(Arch::Arm32),
            _ => Err(UnknownArch(s.to_string())),
        }
    }
}

/// Optimization level, 0 through 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct OptLevel(u8);

impl OptLevel {
    pub const O0: OptLevel = OptLevel(0);
    pub const O1: OptLevel = OptLevel(1);
    pub const O2: OptLevel = OptLevel(2);
    pub const O3: OptLevel = OptLevel(3);

    /// Build a level, clamping anything above 3.
    pub fn new(level: u8) -> Self {
        OptLevel(level.min(3))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "O{}", self.0)
    }
}

/// How the code generator reacts to an operation the target cannot encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodegenMode {
    /// Unsupported operations abort compilation.
    #[default]
    Strict,
    /// Unsupported operations become the target's NOP and a warning is recorded.
    BestEffort,
}

/// Kind of module being produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModuleKind {
    #[default]
    User,
    Vm,
    Libc,
}

impl ModuleKind {
    /// User programs must define `main`; runtime modules may not.
    pub fn requires_main(self) -> bool {
        matches!(self, ModuleKind::User)
    }
}

/// Options for one compilation request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileOptions {
    pub arch: Arch,
    pub opt_level: OptLevel,
    pub mode: CodegenMode,
    pub module_kind: ModuleKind,
    pub debug_info: bool,
    /// Upper bound for the machine-code buffer. `None` derives it from the input size.
    pub max_code_size: Option<usize>,
    /// Overrides the level-derived constant folding switch.
    pub constant_folding: Option<bool>,
}

impl CompileOptions {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            opt_level: OptLevel::O0,
            mode: CodegenMode::Strict,
            module_kind: ModuleKind::User,
            debug_info: false,
            max_code_size: None,
            constant_folding: None,
        }
    }

    pub fn with_opt_level(mut self, level: OptLevel) -> Self {
        self.opt_level = level;
        self
    }

    pub fn with_mode(mut self, mode: CodegenMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_module_kind(mut self, kind: ModuleKind) -> Self {
        self.module_kind = kind;
        self
    }

    pub fn with_debug_info(mut self, enabled: bool) -> Self {
        self.debug_info = enabled;
        self
    }

    pub fn with_max_code_size(mut self, limit: usize) -> Self {
        self.max_code_size = Some(limit);
        self
    }

    pub fn with_constant_folding(mut self, enabled: bool) -> Self {
        self.constant_folding = Some(enabled);
        self
    }

    /// Constant folding is on from level 1 unless explicitly overridden.
    pub fn folds_constants(&self) -> bool {
        self.constant_folding.unwrap_or(self.opt_level >= OptLevel::O1)
    }

    pub fn best_effort(&self) -> bool {
        self.mode == CodegenMode::BestEffort
    }
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::new(Arch::X86_64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_aliases() {
        assert_eq!("x64".parse::<Arch>(), Ok(Arch::X86_64));
        assert_eq!("amd64".parse::<Arch>(), Ok(Arch::X86_64));
        assert_eq!("aarch64".parse::<Arch>(), Ok(Arch::Arm64));
        assert_eq!("x86".parse::<Arch>(), Ok(Arch::X86_32));
        assert_eq!("i386".parse::<Arch>(), Ok(Arch::X86_32));
        assert_eq!("ARM".parse::<Arch>(), Ok(Arch::Arm32));
        assert!("mips".parse::<Arch>().is_err());
    }

    #[test]
    fn test_opt_level_clamps() {
        assert_eq!(OptLevel::new(9), OptLevel::O3);
        assert_eq!(OptLevel::new(2).get(), 2);
    }

    #[test]
    fn test_constant_folding_follows_level() {
        let opts = CompileOptions::new(Arch::X86_64);
        assert!(!opts.folds_constants());
        assert!(opts.clone().with_opt_level(OptLevel::O1).folds_constants());
        assert!(!opts
            .with_opt_level(OptLevel::O2)
            .with_constant_folding(false)
            .folds_constants());
    }
}
