use super::OptimizationStats;
use crate::codegen::{MachineCode, OffsetMap};

const MOV_EAX_ZERO: [u8; 5] = [0xB8, 0x00, 0x00, 0x00, 0x00];
const XOR_EAX_EAX: [u8; 2] = [0x31, 0xC0];
const PUSH_RAX: u8 = 0x50;
const POP_RAX: u8 = 0x58;

/// Replace `len` bytes at `at` with the shorter `with`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rewrite {
    pub at: usize,
    pub len: usize,
    pub with: &'static [u8],
}

/// Apply non-overlapping rewrites in ascending order. Each rewrite keeps its
/// replacement at the front of the old range, so the removed bytes are always
/// the tail of that range.
pub fn apply(code: &[u8], rewrites: &[Rewrite]) -> (Vec<u8>, OffsetMap) {
    let mut out = Vec::with_capacity(code.len());
    let mut edits = Vec::with_capacity(rewrites.len());
    let mut pos = 0;

    for r in rewrites {
        out.extend_from_slice(&code[pos..r.at]);
        out.extend_from_slice(r.with);
        edits.push((r.at + r.with.len(), r.len - r.with.len()));
        pos = r.at + r.len;
    }
    out.extend_from_slice(&code[pos..]);

    (out, OffsetMap::new(edits))
}

fn run_pass(machine: &mut MachineCode, rewrites: Vec<Rewrite>) {
    if rewrites.is_empty() {
        return;
    }
    let (code, map) = apply(&machine.code, &rewrites);
    machine.apply(code, &map);
}

fn is_exactly(machine: &MachineCode, mark: usize, bytes: &[u8]) -> bool {
    let end = machine.instruction_end(mark);
    end - mark == bytes.len() && &machine.code[mark..end] == bytes
}

/// Collapse runs of whole NOP instructions into one.
pub fn collapse_nops(machine: &mut MachineCode, nop: &'static [u8], stats: &mut OptimizationStats) {
    let mut rewrites = Vec::new();
    let marks = &machine.marks;
    let mut i = 0;

    while i < marks.len() {
        if !is_exactly(machine, marks[i], nop) {
            i += 1;
            continue;
        }
        let start = marks[i];
        let mut run = 1;
        while i + run < marks.len() && is_exactly(machine, marks[i + run], nop) {
            run += 1;
        }
        if run > 1 {
            rewrites.push(Rewrite {
                at: start,
                len: run * nop.len(),
                with: nop,
            });
            stats.dead_code_eliminated += run - 1;
        }
        i += run;
    }

    run_pass(machine, rewrites);
}

/// `mov eax, 0` at an instruction start becomes `xor eax, eax`.
pub fn zero_idiom(machine: &mut MachineCode, stats: &mut OptimizationStats) {
    let rewrites: Vec<Rewrite> = machine
        .marks
        .iter()
        .copied()
        .filter(|&m| {
            machine.instruction_end(m) >= m + MOV_EAX_ZERO.len()
                && machine.code[m..].starts_with(&MOV_EAX_ZERO)
        })
        .map(|at| Rewrite {
            at,
            len: MOV_EAX_ZERO.len(),
            with: &XOR_EAX_EAX,
        })
        .collect();

    stats.instructions_combined += rewrites.len();
    run_pass(machine, rewrites);
}

/// Drop a standalone `push rax` immediately undone by the next instruction's
/// `pop rax`, unless something branches to the pop.
pub fn push_pop(machine: &mut MachineCode, stats: &mut OptimizationStats) {
    let mut rewrites = Vec::new();
    let marks = &machine.marks;
    let mut i = 0;

    while i + 1 < marks.len() {
        let (push, pop) = (marks[i], marks[i + 1]);
        if pop == push + 1
            && machine.code[push] == PUSH_RAX
            && machine.code[pop] == POP_RAX
            && !machine.is_branch_target(pop)
        {
            rewrites.push(Rewrite {
                at: push,
                len: 2,
                with: &[],
            });
            stats.redundant_moves_removed += 1;
            i += 2;
        } else {
            i += 1;
        }
    }

    run_pass(machine, rewrites);
}

/// Raw-buffer variant for code without an instruction map: every offset is
/// treated as a possible instruction start. Only the x86 byte patterns apply.
pub fn scan_bytes(code: &[u8], level: u8, stats: &mut OptimizationStats) -> Vec<u8> {
    let mut out = Vec::with_capacity(code.len());
    let mut i = 0;

    while i < code.len() {
        if level >= 2 && code[i..].starts_with(&MOV_EAX_ZERO) {
            out.extend_from_slice(&XOR_EAX_EAX);
            stats.instructions_combined += 1;
            i += MOV_EAX_ZERO.len();
        } else if level >= 1 && code[i] == 0x90 {
            let run = code[i..].iter().take_while(|&&b| b == 0x90).count();
            out.push(0x90);
            stats.dead_code_eliminated += run - 1;
            i += run;
        } else {
            out.push(code[i]);
            i += 1;
        }
    }

    out
}
