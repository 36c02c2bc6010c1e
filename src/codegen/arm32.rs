//! ARMv7 (A32) encoder
//!
//! `r0` is the accumulator, `r1` the second operand, `fp` (r11) the frame
//! pointer. Every stack slot is one word. There is no hardware divide in the
//! baseline profile, so division and remainder are reported as unsupported.

use super::emitter::{round_up, Arith, BranchSite, EmitError, Emitter, Operation};
use super::{BranchKind, CodeBuffer};
use crate::config::Arch;
use crate::ir::Cmp;

pub struct Arm32;

const PUSH_R0: u32 = 0xE52D_0004; // str r0, [sp, #-4]!
const POP_R0: u32 = 0xE49D_0004; // ldr r0, [sp], #4
const POP_R1: u32 = 0xE49D_1004; // ldr r1, [sp], #4
const EPILOGUE: [u32; 2] = [
    0xE1A0_D00B, // mov sp, fp
    0xE8BD_8800, // pop {fp, pc}
];

fn word(buf: &mut CodeBuffer, insn: u32) -> Result<(), EmitError> {
    buf.emit_u32(insn)
}

fn words(buf: &mut CodeBuffer, insns: &[u32]) -> Result<(), EmitError> {
    insns.iter().try_for_each(|&i| buf.emit_u32(i))
}

fn out_of_range(op: Operation, value: i64) -> EmitError {
    EmitError::OperandRange {
        arch: Arch::Arm32,
        op,
        value,
    }
}

/// Encode `value` as an A32 modified immediate (8 bits rotated right by an
/// even amount).
pub fn encode_arm_imm(value: u32) -> Option<u32> {
    (0..16).find_map(|rot| {
        let imm8 = value.rotate_left(rot * 2);
        (imm8 <= 0xFF).then_some(rot << 8 | imm8)
    })
}

/// `movw rd, #lo` and, when needed, `movt rd, #hi`.
fn mov_imm(buf: &mut CodeBuffer, rd: u32, value: i32) -> Result<(), EmitError> {
    let bits = value as u32;
    let lo = bits & 0xFFFF;
    let hi = bits >> 16;
    word(buf, 0xE300_0000 | (lo >> 12) << 16 | rd << 12 | (lo & 0xFFF))?;
    if hi != 0 {
        word(buf, 0xE340_0000 | (hi >> 12) << 16 | rd << 12 | (hi & 0xFFF))?;
    }
    Ok(())
}

fn adjust_sp(buf: &mut CodeBuffer, base: u32, bytes: usize, op: Operation) -> Result<(), EmitError> {
    if bytes == 0 {
        return Ok(());
    }
    let imm = u32::try_from(bytes)
        .ok()
        .and_then(encode_arm_imm)
        .ok_or_else(|| out_of_range(op, bytes as i64))?;
    word(buf, base | imm)
}

fn cond(cmp: Cmp) -> u32 {
    match cmp {
        Cmp::Eq => 0x0,
        Cmp::Ne => 0x1,
        Cmp::Lt => 0xB,
        Cmp::Le => 0xD,
        Cmp::Gt => 0xC,
        Cmp::Ge => 0xA,
    }
}

fn local_offset(slot: u32, op: Operation) -> Result<u32, EmitError> {
    let off = (slot as u64 + 1) * 4;
    if off > 0xFFF {
        return Err(out_of_range(op, slot as i64));
    }
    Ok(off as u32)
}

fn branch(buf: &mut CodeBuffer, insn: u32) -> Result<BranchSite, EmitError> {
    let offset = buf.len();
    word(buf, insn)?;
    Ok(BranchSite {
        offset,
        kind: BranchKind::Arm32B24,
    })
}

impl Emitter for Arm32 {
    fn arch(&self) -> Arch {
        Arch::Arm32
    }

    fn nop(&self) -> &'static [u8] {
        &[0x00, 0x00, 0xA0, 0xE1]
    }

    fn prologue(&self, buf: &mut CodeBuffer, slots: u16) -> Result<(), EmitError> {
        words(buf, &[0xE92D_4800, 0xE1A0_B00D])?; // push {fp, lr}; mov fp, sp
        let frame = round_up(slots as usize * 4, 8);
        adjust_sp(buf, 0xE24D_D000, frame, Operation::Prologue)
    }

    fn load_arg(&self, buf: &mut CodeBuffer, index: u16, argc: u16) -> Result<(), EmitError> {
        let off = 8 + 4 * (argc as u32 - 1 - index as u32);
        if off > 0xFFF {
            return Err(out_of_range(Operation::LoadArg, index as i64));
        }
        words(buf, &[0xE59B_0000 | off, PUSH_R0]) // ldr r0, [fp, #off]
    }

    fn const_i32(&self, buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError> {
        mov_imm(buf, 0, value)?;
        word(buf, PUSH_R0)
    }

    fn const_string(&self, buf: &mut CodeBuffer, bytes: &[u8]) -> Result<(), EmitError> {
        let padded = round_up(bytes.len() + 1, 4);
        word(buf, 0xE28F_0000)?; // add r0, pc, #0 (pc reads 8 ahead: the data)
        word(buf, 0xEA00_0000 | ((padded as u32 - 4) / 4 & 0x00FF_FFFF))?;
        let start = buf.len();
        buf.emit_bytes(bytes)?;
        while buf.len() < start + padded {
            buf.emit_u8(0)?;
        }
        word(buf, PUSH_R0)
    }

    fn arith(&self, buf: &mut CodeBuffer, op: Arith) -> Result<(), EmitError> {
        let insn = match op {
            Arith::Add => 0xE080_0001,
            Arith::Sub => 0xE040_0001,
            Arith::Mul => 0xE000_0190,
            Arith::Div | Arith::Mod => {
                return Err(EmitError::Unsupported {
                    arch: Arch::Arm32,
                    op: op.operation(),
                })
            }
        };
        words(buf, &[POP_R1, POP_R0, insn, PUSH_R0])
    }

    fn compare(&self, buf: &mut CodeBuffer, cmp: Cmp) -> Result<(), EmitError> {
        words(
            buf,
            &[
                POP_R1,
                POP_R0,
                0xE150_0001,                     // cmp r0, r1
                0xE3A0_0000,                     // mov r0, #0
                cond(cmp) << 28 | 0x03A0_0001, // mov<cond> r0, #1
                PUSH_R0,
            ],
        )
    }

    fn add_imm(&self, buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError> {
        word(buf, POP_R0)?;
        match encode_arm_imm(value as u32) {
            Some(imm) => word(buf, 0xE280_0000 | imm)?, // add r0, r0, #imm
            None => {
                mov_imm(buf, 1, value)?;
                word(buf, 0xE080_0001)?;
            }
        }
        word(buf, PUSH_R0)
    }

    fn load_local(&self, buf: &mut CodeBuffer, slot: u32) -> Result<(), EmitError> {
        let off = local_offset(slot, Operation::Load)?;
        words(buf, &[0xE51B_0000 | off, PUSH_R0]) // ldr r0, [fp, #-off]
    }

    fn store_local(&self, buf: &mut CodeBuffer, slot: u32) -> Result<(), EmitError> {
        let off = local_offset(slot, Operation::Store)?;
        words(buf, &[POP_R0, 0xE50B_0000 | off]) // str r0, [fp, #-off]
    }

    fn drop_top(&self, buf: &mut CodeBuffer) -> Result<(), EmitError> {
        word(buf, 0xE28D_D004) // add sp, sp, #4
    }

    fn halt(&self, buf: &mut CodeBuffer) -> Result<(), EmitError> {
        word(buf, POP_R0)?;
        words(buf, &EPILOGUE)
    }

    fn return_const(&self, buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError> {
        mov_imm(buf, 0, value)?;
        words(buf, &EPILOGUE)
    }

    fn jump(&self, buf: &mut CodeBuffer) -> Result<BranchSite, EmitError> {
        branch(buf, 0xEA00_0000)
    }

    fn jump_if_false(&self, buf: &mut CodeBuffer) -> Result<BranchSite, EmitError> {
        words(buf, &[POP_R0, 0xE350_0000])?; // cmp r0, #0
        branch(buf, 0x0A00_0000) // beq
    }

    fn call(&self, buf: &mut CodeBuffer, argc: u16) -> Result<BranchSite, EmitError> {
        let site = branch(buf, 0xEB00_0000)?;
        adjust_sp(buf, 0xE28D_D000, argc as usize * 4, Operation::Call)?;
        word(buf, PUSH_R0)?;
        Ok(site)
    }

    fn libc_call(&self, buf: &mut CodeBuffer, id: u16, argc: u16) -> Result<BranchSite, EmitError> {
        mov_imm(buf, 0, id as i32)?;
        mov_imm(buf, 1, argc as i32)?;
        word(buf, 0xE1A0_200D)?; // mov r2, sp
        let site = branch(buf, 0xEB00_0000)?;
        adjust_sp(buf, 0xE28D_D000, argc as usize * 4, Operation::LibcCall)?;
        word(buf, PUSH_R0)?;
        Ok(site)
    }
}
