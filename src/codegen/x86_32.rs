//! x86 (32-bit) encoder. Same shape as x86-64 with doubleword slots and cdecl
//! arguments for the library dispatcher.

use super::emitter::{Arith, BranchSite, EmitError, Emitter, Operation};
use super::x86_64::{inline_data, push_acc, push_imm, setcc};
use super::{BranchKind, CodeBuffer};
use crate::config::Arch;
use crate::ir::Cmp;

pub struct X86_32;

const EPILOGUE: [u8; 4] = [0x89, 0xEC, 0x5D, 0xC3]; // mov esp, ebp; pop ebp; ret

fn ebp_operand(buf: &mut CodeBuffer, opcode: u8, disp: i32) -> Result<(), EmitError> {
    match i8::try_from(disp) {
        Ok(d) => buf.emit_bytes(&[opcode, 0x45, d as u8]),
        Err(_) => {
            buf.emit_bytes(&[opcode, 0x85])?;
            buf.emit_i32(disp)
        }
    }
}

fn local_disp(slot: u32, op: Operation) -> Result<i32, EmitError> {
    i32::try_from((slot as i64 + 1) * 4)
        .map(|d| -d)
        .map_err(|_| EmitError::OperandRange {
            arch: Arch::X86_32,
            op,
            value: slot as i64,
        })
}

fn adjust_esp(buf: &mut CodeBuffer, modrm: u8, bytes: i32) -> Result<(), EmitError> {
    if bytes == 0 {
        return Ok(());
    }
    match i8::try_from(bytes) {
        Ok(b) => buf.emit_bytes(&[0x83, modrm, b as u8]),
        Err(_) => {
            buf.emit_bytes(&[0x81, modrm])?;
            buf.emit_i32(bytes)
        }
    }
}

fn call_rel32(buf: &mut CodeBuffer) -> Result<BranchSite, EmitError> {
    buf.emit_u8(0xE8)?;
    let offset = buf.len();
    buf.emit_u32(0)?;
    Ok(BranchSite {
        offset,
        kind: BranchKind::X86Rel32,
    })
}

impl Emitter for X86_32 {
    fn arch(&self) -> Arch {
        Arch::X86_32
    }

    fn nop(&self) -> &'static [u8] {
        &[0x90]
    }

    fn prologue(&self, buf: &mut CodeBuffer, slots: u16) -> Result<(), EmitError> {
        buf.emit_bytes(&[0x55, 0x89, 0xE5])?;
        adjust_esp(buf, 0xEC, slots as i32 * 4)
    }

    fn load_arg(&self, buf: &mut CodeBuffer, index: u16, argc: u16) -> Result<(), EmitError> {
        let disp = 8 + 4 * (argc as i32 - 1 - index as i32);
        ebp_operand(buf, 0x8B, disp)?;
        push_acc(buf)
    }

    fn const_i32(&self, buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError> {
        push_imm(buf, value)
    }

    fn const_string(&self, buf: &mut CodeBuffer, bytes: &[u8]) -> Result<(), EmitError> {
        inline_data(buf, bytes)
    }

    fn arith(&self, buf: &mut CodeBuffer, op: Arith) -> Result<(), EmitError> {
        buf.emit_bytes(&[0x59, 0x58])?; // pop ecx; pop eax
        match op {
            Arith::Add => buf.emit_bytes(&[0x01, 0xC8])?,
            Arith::Sub => buf.emit_bytes(&[0x29, 0xC8])?,
            Arith::Mul => buf.emit_bytes(&[0x0F, 0xAF, 0xC1])?,
            Arith::Div => buf.emit_bytes(&[0x99, 0xF7, 0xF9])?,
            Arith::Mod => {
                buf.emit_bytes(&[0x99, 0xF7, 0xF9])?;
                return buf.emit_u8(0x52);
            }
        }
        push_acc(buf)
    }

    fn compare(&self, buf: &mut CodeBuffer, cmp: Cmp) -> Result<(), EmitError> {
        buf.emit_bytes(&[0x59, 0x58, 0x39, 0xC8])?;
        buf.emit_bytes(&[0x0F, setcc(cmp), 0xC0, 0x0F, 0xB6, 0xC0])?;
        push_acc(buf)
    }

    fn add_imm(&self, buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError> {
        match i8::try_from(value) {
            Ok(b) => buf.emit_bytes(&[0x83, 0x04, 0x24, b as u8]),
            Err(_) => {
                buf.emit_bytes(&[0x81, 0x04, 0x24])?;
                buf.emit_i32(value)
            }
        }
    }

    fn load_local(&self, buf: &mut CodeBuffer, slot: u32) -> Result<(), EmitError> {
        ebp_operand(buf, 0x8B, local_disp(slot, Operation::Load)?)?;
        push_acc(buf)
    }

    fn store_local(&self, buf: &mut CodeBuffer, slot: u32) -> Result<(), EmitError> {
        let disp = local_disp(slot, Operation::Store)?;
        buf.emit_u8(0x58)?;
        ebp_operand(buf, 0x89, disp)
    }

    fn drop_top(&self, buf: &mut CodeBuffer) -> Result<(), EmitError> {
        buf.emit_u8(0x58)
    }

    fn halt(&self, buf: &mut CodeBuffer) -> Result<(), EmitError> {
        buf.emit_u8(0x58)?;
        buf.emit_bytes(&EPILOGUE)
    }

    fn return_const(&self, buf: &mut CodeBuffer, value: i32) -> Result<(), EmitError> {
        buf.emit_u8(0xB8)?;
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
        buf.emit_bytes(&[0x58, 0x85, 0xC0, 0x0F, 0x84])?;
        let offset = buf.len();
        buf.emit_u32(0)?;
        Ok(BranchSite {
            offset,
            kind: BranchKind::X86Rel32,
        })
    }

    fn call(&self, buf: &mut CodeBuffer, argc: u16) -> Result<BranchSite, EmitError> {
        let site = call_rel32(buf)?;
        adjust_esp(buf, 0xC4, argc as i32 * 4)?;
        push_acc(buf)?;
        Ok(site)
    }

    fn libc_call(&self, buf: &mut CodeBuffer, id: u16, argc: u16) -> Result<BranchSite, EmitError> {
        // dispatch(id, argc, args): args pointer first since cdecl pushes right to left
        buf.emit_bytes(&[0x89, 0xE0, 0x50])?;
        buf.emit_u8(0x68)?;
        buf.emit_u32(argc as u32)?;
        buf.emit_u8(0x68)?;
        buf.emit_u32(id as u32)?;
        let site = call_rel32(buf)?;
        buf.emit_bytes(&[0x83, 0xC4, 0x0C])?;
        adjust_esp(buf, 0xC4, argc as i32 * 4)?;
        push_acc(buf)?;
        Ok(site)
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
    fn test_frame() {
        assert_eq!(
            emit(|b| X86_32.prologue(b, 2)),
            [0x55, 0x89, 0xE5, 0x83, 0xEC, 0x08]
        );
        assert_eq!(
            emit(|b| X86_32.halt(b)),
            [0x58, 0x89, 0xEC, 0x5D, 0xC3]
        );
    }

    #[test]
    fn test_arith() {
        assert_eq!(emit(|b| X86_32.arith(b, Arith::Add)), [0x59, 0x58, 0x01, 0xC8, 0x50]);
        assert_eq!(
            emit(|b| X86_32.arith(b, Arith::Div)),
            [0x59, 0x58, 0x99, 0xF7, 0xF9, 0x50]
        );
        assert_eq!(
            emit(|b| X86_32.compare(b, Cmp::Ne)),
            [0x59, 0x58, 0x39, 0xC8, 0x0F, 0x95, 0xC0, 0x0F, 0xB6, 0xC0, 0x50]
        );
    }

    #[test]
    fn test_locals_and_args() {
        assert_eq!(emit(|b| X86_32.load_local(b, 0)), [0x8B, 0x45, 0xFC, 0x50]);
        assert_eq!(emit(|b| X86_32.store_local(b, 2)), [0x58, 0x89, 0x45, 0xF4]);
        assert_eq!(emit(|b| X86_32.load_arg(b, 0, 1)), [0x8B, 0x45, 0x08, 0x50]);
    }

    #[test]
    fn test_libc_call() {
        let mut buf = CodeBuffer::new(64);
        let site = X86_32.libc_call(&mut buf, 0x81, 1).unwrap();
        assert_eq!(
            buf.as_slice(),
            &[
                0x89, 0xE0, 0x50, 0x68, 1, 0, 0, 0, 0x68, 0x81, 0, 0, 0, 0xE8, 0, 0, 0, 0, 0x83,
                0xC4, 0x0C, 0x83, 0xC4, 0x04, 0x50
            ]
        );
        assert_eq!(site.offset, 14);
        assert_eq!(buf.marks(), &[24]);
    }
}
