//! x86-64 encoder
//!
//! `rax` is the accumulator and every stack slot is one quadword. Locals live
//! below `rbp`, arguments above the saved `rbp` and return address.

use super::emitter::{round_up, Arith, BranchSite, EmitError, Emitter, Operation};
use super::{BranchKind, CodeBuffer};
use crate::config::Arch;
use crate::ir::Cmp;

pub struct X86_64;

const EPILOGUE: [u8; 5] = [0x48, 0x89, 0xEC, 0x5D, 0xC3]; // mov rsp, rbp; pop rbp; ret

/// `setcc` second opcode byte.
pub(crate) fn setcc(cmp: Cmp) -> u8 {
    match cmp {
        Cmp::Eq => 0x94,
        Cmp::Ne => 0x95,
        Cmp::Lt => 0x9C,
        Cmp::Le => 0x9E,
        Cmp::Gt => 0x9F,
        Cmp::Ge => 0x9D,
    }
}

/// `push rax` as a standalone instruction.
pub(crate) fn push_acc(buf: &mut CodeBuffer) -> Result<(), EmitError> {
    buf.mark_instruction();
    buf.emit_u8(0x50)
}

/// `push imm` in its short form when the value fits a byte.
pub(crate) fn push_imm(buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError> {
    match i8::try_from(value) {
        Ok(b) => buf.emit_bytes(&[0x6A, b as u8]),
        Err(_) => {
            buf.emit_u8(0x68)?;
            buf.emit_i32(value)
        }
    }
}

/// `call` over inline data: the return address pushed is the data's address.
pub(crate) fn inline_data(buf: &mut CodeBuffer, bytes: &[u8]) -> Result<(), EmitError> {
    let len = bytes.len() + 1;
    buf.emit_u8(0xE8)?;
    buf.emit_u32(len as u32)?;
    buf.emit_bytes(bytes)?;
    buf.emit_u8(0)
}

/// `REX.W opcode [rbp + disp]` with `rax` as the register operand, using the
/// disp8 form when it fits.
fn rbp_operand(buf: &mut CodeBuffer, opcode: u8, disp: i32) -> Result<(), EmitError> {
    match i8::try_from(disp) {
        Ok(d) => buf.emit_bytes(&[0x48, opcode, 0x45, d as u8]),
        Err(_) => {
            buf.emit_bytes(&[0x48, opcode, 0x85])?;
            buf.emit_i32(disp)
        }
    }
}

fn local_disp(slot: u32, op: Operation) -> Result<i32, EmitError> {
    i32::try_from((slot as i64 + 1) * 8)
        .map(|d| -d)
        .map_err(|_| EmitError::OperandRange {
            arch: Arch::X86_64,
            op,
            value: slot as i64,
        })
}

/// Release `argc` argument slots after a call.
fn pop_args(buf: &mut CodeBuffer, argc: u16) -> Result<(), EmitError> {
    let bytes = argc as i32 * 8;
    if bytes == 0 {
        return Ok(());
    }
    match i8::try_from(bytes) {
        Ok(b) => buf.emit_bytes(&[0x48, 0x83, 0xC4, b as u8]),
        Err(_) => {
            buf.emit_bytes(&[0x48, 0x81, 0xC4])?;
            buf.emit_i32(bytes)
        }
    }
}

impl Emitter for X86_64 {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn nop(&self) -> &'static [u8] {
        &[0x90]
    }

    fn prologue(&self, buf: &mut CodeBuffer, slots: u16) -> Result<(), EmitError> {
        buf.emit_bytes(&[0x55, 0x48, 0x89, 0xE5])?; // push rbp; mov rbp, rsp
        let frame = round_up(slots as usize * 8, 16) as i32;
        if frame == 0 {
            return Ok(());
        }
        match i8::try_from(frame) {
            Ok(b) => buf.emit_bytes(&[0x48, 0x83, 0xEC, b as u8]),
            Err(_) => {
                buf.emit_bytes(&[0x48, 0x81, 0xEC])?;
                buf.emit_i32(frame)
            }
        }
    }

    fn load_arg(&self, buf: &mut CodeBuffer, index: u16, argc: u16) -> Result<(), EmitError> {
        let disp = 16 + 8 * (argc as i32 - 1 - index as i32);
        rbp_operand(buf, 0x8B, disp)?;
        push_acc(buf)
    }

    fn const_i32(&self, buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError> {
        push_imm(buf, value)
    }

    fn const_string(&self, buf: &mut CodeBuffer, bytes: &[u8]) -> Result<(), EmitError> {
        inline_data(buf, bytes)
    }

    fn arith(&self, buf: &mut CodeBuffer, op: Arith) -> Result<(), EmitError> {
        buf.emit_bytes(&[0x59, 0x58])?; // pop rcx; pop rax
        match op {
            Arith::Add => buf.emit_bytes(&[0x48, 0x01, 0xC8])?,
            Arith::Sub => buf.emit_bytes(&[0x48, 0x29, 0xC8])?,
            Arith::Mul => buf.emit_bytes(&[0x48, 0x0F, 0xAF, 0xC1])?,
            Arith::Div => buf.emit_bytes(&[0x48, 0x99, 0x48, 0xF7, 0xF9])?,
            Arith::Mod => {
                // remainder is in rdx
                buf.emit_bytes(&[0x48, 0x99, 0x48, 0xF7, 0xF9])?;
                return buf.emit_u8(0x52);
            }
        }
        push_acc(buf)
    }

    fn compare(&self, buf: &mut CodeBuffer, cmp: Cmp) -> Result<(), EmitError> {
        buf.emit_bytes(&[0x59, 0x58, 0x48, 0x39, 0xC8])?;
        buf.emit_bytes(&[0x0F, setcc(cmp), 0xC0, 0x0F, 0xB6, 0xC0])?;
        push_acc(buf)
    }

    fn add_imm(&self, buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError> {
        match i8::try_from(value) {
            Ok(b) => buf.emit_bytes(&[0x48, 0x83, 0x04, 0x24, b as u8]),
            Err(_) => {
                buf.emit_bytes(&[0x48, 0x81, 0x04, 0x24])?;
                buf.emit_i32(value)
            }
        }
    }

    fn load_local(&self, buf: &mut CodeBuffer, slot: u32) -> Result<(), EmitError> {
        let disp = local_disp(slot, Operation::Load)?;
        rbp_operand(buf, 0x8B, disp)?;
        push_acc(buf)
    }

    fn store_local(&self, buf: &mut CodeBuffer, slot: u32) -> Result<(), EmitError> {
        let disp = local_disp(slot, Operation::Store)?;
        buf.emit_u8(0x58)?;
        rbp_operand(buf, 0x89, disp)
    }

    fn drop_top(&self, buf: &mut CodeBuffer) -> Result<(), EmitError> {
        buf.emit_u8(0x58)
    }

    fn halt(&self, buf: &mut CodeBuffer) -> Result<(), EmitError> {
        buf.emit_u8(0x58)?;
        buf.emit_bytes(&EPILOGUE)
    }

    fn return_const(&self, buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError> {
        buf.emit_u8(0xB8)?; // mov eax, imm32
        buf.emit_i32(value)?;
        buf.emit_bytes(&EPILOGUE)
    }

    fn jump(&self, buf: &mut CodeBuffer) -> Result<BranchSite, EmitError> {
        buf.emit_u8(0xE9)?;
        let offset = buf.len();
        buf.emit_u32(0)?;
        Ok(BranchSite {
            offset,
            kind: BranchKind::X86Rel32,
        })
    }

    fn jump_if_false(&self, buf: &mut CodeBuffer) -> Result<BranchSite, EmitError> {
        // pop rax; test rax, rax; jz rel32
        buf.emit_bytes(&[0x58, 0x48, 0x85, 0xC0, 0x0F, 0x84])?;
        let offset = buf.len();
        buf.emit_u32(0)?;
        Ok(BranchSite {
            offset,
            kind: BranchKind::X86Rel32,
        })
    }

    fn call(&self, buf: &mut CodeBuffer, argc: u16) -> Result<BranchSite, EmitError> {
        buf.emit_u8(0xE8)?;
        let offset = buf.len();
        buf.emit_u32(0)?;
        pop_args(buf, argc)?;
        push_acc(buf)?;
        Ok(BranchSite {
            offset,
            kind: BranchKind::X86Rel32,
        })
    }

    fn libc_call(&self, buf: &mut CodeBuffer, id: u16, argc: u16) -> Result<BranchSite, EmitError> {
        buf.emit_u8(0xBF)?; // mov edi, id
        buf.emit_u32(id as u32)?;
        buf.emit_u8(0xBE)?; // mov esi, argc
        buf.emit_u32(argc as u32)?;
        buf.emit_bytes(&[0x48, 0x89, 0xE2])?; // mov rdx, rsp
        self.call(buf, argc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl FnOnce(&mut CodeBuffer) -> Result<(), EmitError>) -> Vec<u8> {
        let mut buf = CodeBuffer::new(1 << 16);
        f(&mut buf).unwrap();
        buf.into_parts().0
    }

    #[test]
    fn test_prologue_and_return() {
        assert_eq!(emit(|b| X86_64.prologue(b, 0)), [0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(
            emit(|b| X86_64.prologue(b, 3)),
            [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20]
        );
        assert_eq!(
            emit(|b| X86_64.return_const(b, 42)),
            [0xB8, 0x2A, 0, 0, 0, 0x48, 0x89, 0xEC, 0x5D, 0xC3]
        );
    }

    #[test]
    fn test_constants() {
        assert_eq!(emit(|b| X86_64.const_i32(b, -1)), [0x6A, 0xFF]);
        assert_eq!(emit(|b| X86_64.const_i32(b, 300)), [0x68, 0x2C, 0x01, 0, 0]);
        assert_eq!(
            emit(|b| X86_64.const_string(b, b"ok")),
            [0xE8, 3, 0, 0, 0, b'o', b'k', 0]
        );
    }

    #[test]
    fn test_arith_and_compare() {
        assert_eq!(
            emit(|b| X86_64.arith(b, Arith::Add)),
            [0x59, 0x58, 0x48, 0x01, 0xC8, 0x50]
        );
        assert_eq!(
            emit(|b| X86_64.arith(b, Arith::Mod)),
            [0x59, 0x58, 0x48, 0x99, 0x48, 0xF7, 0xF9, 0x52]
        );
        assert_eq!(
            emit(|b| X86_64.compare(b, Cmp::Lt)),
            [0x59, 0x58, 0x48, 0x39, 0xC8, 0x0F, 0x9C, 0xC0, 0x0F, 0xB6, 0xC0, 0x50]
        );
    }

    #[test]
    fn test_locals() {
        assert_eq!(
            emit(|b| X86_64.load_local(b, 0)),
            [0x48, 0x8B, 0x45, 0xF8, 0x50]
        );
        assert_eq!(
            emit(|b| X86_64.store_local(b, 1)),
            [0x58, 0x48, 0x89, 0x45, 0xF0]
        );
        // slot 20 needs a 32-bit displacement
        assert_eq!(
            emit(|b| X86_64.load_local(b, 20)),
            [0x48, 0x8B, 0x85, 0x58, 0xFF, 0xFF, 0xFF, 0x50]
        );
        // second of two arguments sits right above the return address
        assert_eq!(
            emit(|b| X86_64.load_arg(b, 1, 2)),
            [0x48, 0x8B, 0x45, 0x10, 0x50]
        );
    }

    #[test]
    fn test_branch_sites() {
        let mut buf = CodeBuffer::new(64);
        let site = X86_64.jump_if_false(&mut buf).unwrap();
        assert_eq!(site.offset, 6);
        let site = X86_64.call(&mut buf, 2).unwrap();
        assert_eq!(site.offset, 11);
        assert_eq!(&buf.as_slice()[15..], &[0x48, 0x83, 0xC4, 0x10, 0x50]);
        assert_eq!(buf.marks(), &[19]);
    }

    #[test]
    fn test_libc_call() {
        let mut buf = CodeBuffer::new(64);
        let site = X86_64.libc_call(&mut buf, 0x30, 1).unwrap();
        assert_eq!(
            buf.as_slice(),
            &[
                0xBF, 0x30, 0, 0, 0, 0xBE, 1, 0, 0, 0, 0x48, 0x89, 0xE2, 0xE8, 0, 0, 0, 0, 0x48,
                0x83, 0xC4, 0x08, 0x50
            ]
        );
        assert_eq!(site.offset, 14);
    }
}
