//! Post-generation optimizer
//!
//! Levels are cumulative:
//!
//! - **O0**: nothing. Output is byte-identical to the unoptimized image.
//! - **O1**: runs of NOP instructions collapse to one.
//! - **O2**: x86 peepholes (`mov eax, 0` to `xor eax, eax`, and `push rax`
//!   immediately followed by `pop rax` removed).
//! - **O3**: the advanced pass, currently a no-op, followed by the
//!   [`CodeQualityHook`].
//!
//! Passes only match at recorded instruction starts, and every offset the
//! image carries (marks, branches, symbols, relocations) is moved along with
//! the bytes. The caller relinks branches afterwards.

mod passes;

use crate::codegen::{emitter_for, MachineCode};
use crate::config::OptLevel;
use std::ops::AddAssign;

/// Counters reported for one compilation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizationStats {
    pub dead_code_eliminated: usize,
    pub constants_folded: usize,
    pub redundant_moves_removed: usize,
    pub instructions_combined: usize,
}

impl OptimizationStats {
    pub fn total(&self) -> usize {
        self.dead_code_eliminated
            + self.constants_folded
            + self.redundant_moves_removed
            + self.instructions_combined
    }
}

impl AddAssign for OptimizationStats {
    fn add_assign(&mut self, other: Self) {
        self.dead_code_eliminated += other.dead_code_eliminated;
        self.constants_folded += other.constants_folded;
        self.redundant_moves_removed += other.redundant_moves_removed;
        self.instructions_combined += other.instructions_combined;
    }
}

/// External code-quality scoring, consulted at O3. Does nothing by default.
pub trait CodeQualityHook {
    fn evaluate(&mut self, _code: &MachineCode) -> Option<f64> {
        None
    }
}

/// The default hook.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl CodeQualityHook for NoopHook {}

/// Run every pass enabled at `level` over `machine`.
pub fn optimize(
    machine: &mut MachineCode,
    level: OptLevel,
    hook: &mut dyn CodeQualityHook,
) -> OptimizationStats {
    let mut stats = OptimizationStats::default();
    let level = level.get();
    if level == 0 {
        return stats;
    }

    let before = machine.code.len();
    let nop = emitter_for(machine.arch).nop();
    passes::collapse_nops(machine, nop, &mut stats);

    if level >= 2 && machine.arch.is_x86() {
        passes::zero_idiom(machine, &mut stats);
        passes::push_pop(machine, &mut stats);
    }

    if level >= 3 {
        log::debug!("advanced pass: no transformations registered");
        if let Some(score) = hook.evaluate(machine) {
            log::debug!("code quality score: {score:.3}");
        }
    }

    log::debug!(
        "optimizer O{level}: {before} -> {} bytes ({} rewrites)",
        machine.code.len(),
        stats.total()
    );
    stats
}

/// Optimize a bare x86 byte buffer that has no instruction map. Every offset
/// is considered an instruction start, so only NOP collapsing and the
/// `mov eax, 0` rewrite apply.
pub fn optimize_bytes(code: &[u8], level: OptLevel) -> (Vec<u8>, OptimizationStats) {
    let mut stats = OptimizationStats::default();
    if level == OptLevel::O0 {
        return (code.to_vec(), stats);
    }
    let out = passes::scan_bytes(code, level.get(), &mut stats);
    (out, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::SymbolTable;
    use crate::config::Arch;

    fn image(arch: Arch, code: Vec<u8>, marks: Vec<usize>) -> MachineCode {
        MachineCode {
            arch,
            code,
            marks,
            branches: Vec::new(),
            symbols: SymbolTable::new(),
            relocations: Vec::new(),
        }
    }

    #[test]
    fn test_level_zero_is_identity() {
        let code = vec![0x90, 0x90, 0xB8, 0, 0, 0, 0, 0xC3];
        let mut m = image(Arch::X86_64, code.clone(), vec![0, 1, 2, 7]);
        let stats = optimize(&mut m, OptLevel::O0, &mut NoopHook);
        assert_eq!(m.code, code);
        assert_eq!(stats, OptimizationStats::default());

        assert_eq!(optimize_bytes(&code, OptLevel::O0).0, code);
    }

    #[test]
    fn test_five_nops_collapse() {
        let (out, stats) = optimize_bytes(&[0x90, 0x90, 0x90, 0x90, 0x90, 0xC3], OptLevel::O1);
        assert_eq!(out, vec![0x90, 0xC3]);
        assert_eq!(stats.dead_code_eliminated, 4);
    }

    #[test]
    fn test_zero_idiom_needs_level_two() {
        let code = [0x55, 0xB8, 0, 0, 0, 0, 0x5D, 0xC3];
        assert_eq!(optimize_bytes(&code, OptLevel::O1).0, code.to_vec());
        let (out, stats) = optimize_bytes(&code, OptLevel::O2);
        assert_eq!(out, vec![0x55, 0x31, 0xC0, 0x5D, 0xC3]);
        assert_eq!(stats.instructions_combined, 1);
    }

    #[test]
    fn test_arm_nop_words_collapse() {
        let nop = [0x1F, 0x20, 0x03, 0xD5];
        let mut code = Vec::new();
        for _ in 0..3 {
            code.extend_from_slice(&nop);
        }
        code.extend_from_slice(&0xD65F_03C0u32.to_le_bytes());
        let mut m = image(Arch::Arm64, code, vec![0, 4, 8, 12]);

        let stats = optimize(&mut m, OptLevel::O2, &mut NoopHook);
        assert_eq!(m.code.len(), 8);
        assert_eq!(&m.code[..4], &nop);
        assert_eq!(m.marks, vec![0, 4]);
        assert_eq!(stats.dead_code_eliminated, 2);
    }

    struct Counting(usize);

    impl CodeQualityHook for Counting {
        fn evaluate(&mut self, code: &MachineCode) -> Option<f64> {
            self.0 += 1;
            Some(code.code.len() as f64)
        }
    }

    #[test]
    fn test_hook_runs_only_at_level_three() {
        let mut hook = Counting(0);
        let mut m = image(Arch::X86_64, vec![0xC3], vec![0]);
        optimize(&mut m, OptLevel::O2, &mut hook);
        assert_eq!(hook.0, 0);
        optimize(&mut m, OptLevel::O3, &mut hook);
        assert_eq!(hook.0, 1);
    }
}
