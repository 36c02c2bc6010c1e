//! AArch64 encoder
//!
//! `x0` is the accumulator, `x1` the second operand. The stack pointer must
//! stay 16-byte aligned, so every pushed value takes a 16-byte slot. Locals
//! are 8 bytes each below `x29`.

use super::emitter::{round_up, Arith, BranchSite, EmitError, Emitter, Operation};
use super::{BranchKind, CodeBuffer};
use crate::config::Arch;
use crate::ir::Cmp;

pub struct Arm64;

const PUSH_X0: u32 = 0xF81F_0FE0; // str x0, [sp, #-16]!
const POP_X0: u32 = 0xF841_07E0; // ldr x0, [sp], #16
const POP_X1: u32 = 0xF841_07E1; // ldr x1, [sp], #16
const EPILOGUE: [u32; 3] = [
    0x9100_03BF, // mov sp, x29
    0xA8C1_7BFD, // ldp x29, x30, [sp], #16
    0xD65F_03C0, // ret
];

fn word(buf: &mut CodeBuffer, insn: u32) -> Result<(), EmitError> {
    buf.emit_u32(insn)
}

fn words(buf: &mut CodeBuffer, insns: &[u32]) -> Result<(), EmitError> {
    insns.iter().try_for_each(|&i| buf.emit_u32(i))
}

fn out_of_range(op: Operation, value: i64) -> EmitError {
    EmitError::OperandRange {
        arch: Arch::Arm64,
        op,
        value,
    }
}

/// Load a sign-extended 32-bit constant into `xd`.
fn mov_imm(buf: &mut CodeBuffer, rd: u32, value: i32) -> Result<(), EmitError> {
    if (0..=0xFFFF).contains(&value) {
        word(buf, 0xD280_0000 | (value as u32) << 5 | rd)
    } else if (-0x10000..0).contains(&value) {
        word(buf, 0x9280_0000 | (!value as u32 & 0xFFFF) << 5 | rd)
    } else {
        let bits = value as u32;
        words(
            buf,
            &[
                0x5280_0000 | (bits & 0xFFFF) << 5 | rd, // movz wd, #lo
                0x72A0_0000 | (bits >> 16) << 5 | rd,    // movk wd, #hi, lsl #16
                0x9340_7C00 | rd << 5 | rd,              // sxtw xd, wd
            ],
        )
    }
}

/// `add sp, sp, #bytes` or `sub sp, sp, #bytes`.
fn adjust_sp(buf: &mut CodeBuffer, base: u32, bytes: usize, op: Operation) -> Result<(), EmitError> {
    if bytes == 0 {
        return Ok(());
    }
    if bytes > 0xFFF {
        return Err(out_of_range(op, bytes as i64));
    }
    word(buf, base | (bytes as u32) << 10)
}

fn cset(cmp: Cmp) -> u32 {
    // csinc x0, xzr, xzr, <inverted cond>
    match cmp {
        Cmp::Eq => 0x9A9F_17E0,
        Cmp::Ne => 0x9A9F_07E0,
        Cmp::Lt => 0x9A9F_A7E0,
        Cmp::Le => 0x9A9F_C7E0,
        Cmp::Gt => 0x9A9F_D7E0,
        Cmp::Ge => 0x9A9F_B7E0,
    }
}

/// Access local `slot` at `[x29, #-off]` with `ldur`/`stur`, or through `x9`
/// when the offset is beyond the unscaled range.
fn local_access(
    buf: &mut CodeBuffer,
    slot: u32,
    unscaled: u32,
    via_x9: u32,
    op: Operation,
) -> Result<(), EmitError> {
    let off = (slot as u64 + 1) * 8;
    if off <= 256 {
        let imm9 = (-(off as i32)) as u32 & 0x1FF;
        word(buf, unscaled | imm9 << 12 | 29 << 5)
    } else if off <= 0xFFF {
        word(buf, 0xD100_03A9 | (off as u32) << 10)?; // sub x9, x29, #off
        word(buf, via_x9)
    } else {
        Err(out_of_range(op, slot as i64))
    }
}

fn branch(buf: &mut CodeBuffer, insn: u32, kind: BranchKind) -> Result<BranchSite, EmitError> {
    let offset = buf.len();
    word(buf, insn)?;
    Ok(BranchSite { offset, kind })
}

impl Emitter for Arm64 {
    fn arch(&self) -> Arch {
        Arch::Arm64
    }

    fn nop(&self) -> &'static [u8] {
        &[0x1F, 0x20, 0x03, 0xD5]
    }

    fn prologue(&self, buf: &mut CodeBuffer, slots: u16) -> Result<(), EmitError> {
        // stp x29, x30, [sp, #-16]!; mov x29, sp
        words(buf, &[0xA9BF_7BFD, 0x9100_03FD])?;
        let frame = round_up(slots as usize * 8, 16);
        adjust_sp(buf, 0xD100_03FF, frame, Operation::Prologue)
    }

    fn load_arg(&self, buf: &mut CodeBuffer, index: u16, argc: u16) -> Result<(), EmitError> {
        let off = 16 + 16 * (argc as u32 - 1 - index as u32);
        word(buf, 0xF940_0000 | (off / 8) << 10 | 29 << 5)?; // ldr x0, [x29, #off]
        word(buf, PUSH_X0)
    }

    fn const_i32(&self, buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError> {
        mov_imm(buf, 0, value)?;
        word(buf, PUSH_X0)
    }

    fn const_string(&self, buf: &mut CodeBuffer, bytes: &[u8]) -> Result<(), EmitError> {
        let padded = round_up(bytes.len() + 1, 4);
        word(buf, 0x1000_0040)?; // adr x0, #8
        word(buf, 0x1400_0000 | ((4 + padded) / 4) as u32)?; // b over the data
        let start = buf.len();
        buf.emit_bytes(bytes)?;
        while buf.len() < start + padded {
            buf.emit_u8(0)?;
        }
        word(buf, PUSH_X0)
    }

    fn arith(&self, buf: &mut CodeBuffer, op: Arith) -> Result<(), EmitError> {
        words(buf, &[POP_X1, POP_X0])?;
        match op {
            Arith::Add => word(buf, 0x8B01_0000)?,
            Arith::Sub => word(buf, 0xCB01_0000)?,
            Arith::Mul => word(buf, 0x9B01_7C00)?,
            Arith::Div => word(buf, 0x9AC1_0C00)?,
            Arith::Mod => {
                // sdiv x2, x0, x1; msub x0, x2, x1, x0
                words(buf, &[0x9AC1_0C02, 0x9B01_8040])?
            }
        }
        word(buf, PUSH_X0)
    }

    fn compare(&self, buf: &mut CodeBuffer, cmp: Cmp) -> Result<(), EmitError> {
        words(buf, &[POP_X1, POP_X0, 0xEB01_001F, cset(cmp), PUSH_X0])
    }

    fn add_imm(&self, buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError> {
        word(buf, POP_X0)?;
        if (0..=0xFFF).contains(&value) {
            word(buf, 0x9100_0000 | (value as u32) << 10)?; // add x0, x0, #imm
        } else {
            mov_imm(buf, 1, value)?;
            word(buf, 0x8B01_0000)?;
        }
        word(buf, PUSH_X0)
    }

    fn load_local(&self, buf: &mut CodeBuffer, slot: u32) -> Result<(), EmitError> {
        local_access(buf, slot, 0xF840_0000, 0xF940_0120, Operation::Load)?;
        word(buf, PUSH_X0)
    }

    fn store_local(&self, buf: &mut CodeBuffer, slot: u32) -> Result<(), EmitError> {
        word(buf, POP_X0)?;
        local_access(buf, slot, 0xF800_0000, 0xF900_0120, Operation::Store)
    }

    fn drop_top(&self, buf: &mut CodeBuffer) -> Result<(), EmitError> {
        word(buf, 0x9100_43FF) // add sp, sp, #16
    }

    fn halt(&self, buf: &mut CodeBuffer) -> Result<(), EmitError> {
        word(buf, POP_X0)?;
        words(buf, &EPILOGUE)
    }

    fn return_const(&self, buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError> {
        mov_imm(buf, 0, value)?;
        words(buf, &EPILOGUE)
    }

    fn jump(&self, buf: &mut CodeBuffer) -> Result<BranchSite, EmitError> {
        branch(buf, 0x1400_0000, BranchKind::Arm64B26)
    }

    fn jump_if_false(&self, buf: &mut CodeBuffer) -> Result<BranchSite, EmitError> {
        word(buf, POP_X0)?;
        branch(buf, 0xB400_0000, BranchKind::Arm64Cbz19)
    }

    fn call(&self, buf: &mut CodeBuffer, argc: u16) -> Result<BranchSite, EmitError> {
        let site = branch(buf, 0x9400_0000, BranchKind::Arm64B26)?;
        adjust_sp(buf, 0x9100_03FF, argc as usize * 16, Operation::Call)?;
        word(buf, PUSH_X0)?;
        Ok(site)
    }

    fn libc_call(&self, buf: &mut CodeBuffer, id: u16, argc: u16) -> Result<BranchSite, EmitError> {
        word(buf, 0xD280_0000 | (id as u32) << 5)?; // movz x0, #id
        word(buf, 0xD280_0001 | (argc as u32) << 5)?; // movz x1, #argc
        word(buf, 0x9100_03E2)?; // mov x2, sp
        let site = branch(buf, 0x9400_0000, BranchKind::Arm64B26)?;
        adjust_sp(buf, 0x9100_03FF, argc as usize * 16, Operation::LibcCall)?;
        word(buf, PUSH_X0)?;
        Ok(site)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl FnOnce(&mut CodeBuffer) -> Result<(), EmitError>) -> Vec<u32> {
        let mut buf = CodeBuffer::new(1 << 16);
        f(&mut buf).unwrap();
        buf.as_slice()
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_frame() {
        assert_eq!(
            emit(|b| Arm64.prologue(b, 3)),
            [0xA9BF_7BFD, 0x9100_03FD, 0xD100_83FF]
        );
        assert_eq!(
            emit(|b| Arm64.return_const(b, 42)),
            [0xD280_0540, 0x9100_03BF, 0xA8C1_7BFD, 0xD65F_03C0]
        );
        assert!(matches!(
            Arm64.prologue(&mut CodeBuffer::new(64), 1000),
            Err(EmitError::OperandRange { .. })
        ));
    }

    #[test]
    fn test_constants() {
        assert_eq!(emit(|b| Arm64.const_i32(b, 7)), [0xD280_00E0, PUSH_X0]);
        assert_eq!(emit(|b| Arm64.const_i32(b, -1)), [0x9280_0000, PUSH_X0]);
        assert_eq!(
            emit(|b| Arm64.const_i32(b, 0x12345)),
            [0x5284_68A0, 0x72A0_0020, 0x9340_7C00, PUSH_X0]
        );
    }

    #[test]
    fn test_arith_and_compare() {
        assert_eq!(
            emit(|b| Arm64.arith(b, Arith::Mod)),
            [POP_X1, POP_X0, 0x9AC1_0C02, 0x9B01_8040, PUSH_X0]
        );
        assert_eq!(
            emit(|b| Arm64.compare(b, Cmp::Le)),
            [POP_X1, POP_X0, 0xEB01_001F, 0x9A9F_C7E0, PUSH_X0]
        );
    }

    #[test]
    fn test_locals() {
        // ldur x0, [x29, #-8]
        assert_eq!(emit(|b| Arm64.load_local(b, 0)), [0xF85F_83A0, PUSH_X0]);
        // stur x0, [x29, #-16]
        assert_eq!(emit(|b| Arm64.store_local(b, 1)), [POP_X0, 0xF81F_03A0]);
        assert_eq!(
            emit(|b| Arm64.load_local(b, 40)),
            [0xD105_23A9, 0xF940_0120, PUSH_X0]
        );
        // ldr x0, [x29, #16]
        assert_eq!(emit(|b| Arm64.load_arg(b, 0, 1)), [0xF940_0BA0, PUSH_X0]);
    }

    #[test]
    fn test_const_string_skips_data() {
        let code = emit(|b| Arm64.const_string(b, b"abc"));
        assert_eq!(code[0], 0x1000_0040);
        assert_eq!(code[1], 0x1400_0002);
        assert_eq!(code[2], u32::from_le_bytes(*b"abc\0"));
        assert_eq!(code[3], PUSH_X0);
    }

    #[test]
    fn test_branch_sites() {
        let mut buf = CodeBuffer::new(64);
        let site = Arm64.jump_if_false(&mut buf).unwrap();
        assert_eq!(site.offset, 4);
        assert_eq!(site.kind, BranchKind::Arm64Cbz19);
        let site = Arm64.call(&mut buf, 1).unwrap();
        assert_eq!(site.offset, 8);
        assert_eq!(&buf.as_slice()[12..16], &0x9100_43FFu32.to_le_bytes());
    }
}
