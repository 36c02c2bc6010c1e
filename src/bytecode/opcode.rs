//! The opcode table and instruction decoding
//!
//! This is the only place opcode numbers and operand lengths are defined.
//! The builder encodes through [`Instr::encode`] and every reader walks code
//! through [`Instructions`], so both sides always agree on instruction sizes.

use crate::astc::DecodeError;
use crate::ir::Cmp;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x00,
    Halt = 0x01,
    Drop = 0x02,
    ConstI32 = 0x10,
    ConstString = 0x12,
    Add = 0x20,
    Sub = 0x21,
    Mul = 0x22,
    Div = 0x23,
    Mod = 0x24,
    Eq = 0x25,
    Ne = 0x26,
    Lt = 0x27,
    Le = 0x28,
    Gt = 0x29,
    Ge = 0x2A,
    StoreLocal = 0x30,
    LoadLocal = 0x31,
    Jump = 0x40,
    JumpIfFalse = 0x41,
    CallUser = 0x50,
    LibcCall = 0xF0,
}

impl Opcode {
    pub const ALL: [Opcode; 22] = [
        Opcode::Nop,
        Opcode::Halt,
        Opcode::Drop,
        Opcode::ConstI32,
        Opcode::ConstString,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Mod,
        Opcode::Eq,
        Opcode::Ne,
        Opcode::Lt,
        Opcode::Le,
        Opcode::Gt,
        Opcode::Ge,
        Opcode::StoreLocal,
        Opcode::LoadLocal,
        Opcode::Jump,
        Opcode::JumpIfFalse,
        Opcode::CallUser,
        Opcode::LibcCall,
    ];

    pub fn from_byte(byte: u8) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| *op as u8 == byte)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::Halt => "HALT",
            Opcode::Drop => "DROP",
            Opcode::ConstI32 => "CONST_I32",
            Opcode::ConstString => "CONST_STRING",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Mod => "MOD",
            Opcode::Eq => "EQ",
            Opcode::Ne => "NE",
            Opcode::Lt => "LT",
            Opcode::Le => "LE",
            Opcode::Gt => "GT",
            Opcode::Ge => "GE",
            Opcode::StoreLocal => "STORE_LOCAL",
            Opcode::LoadLocal => "LOAD_LOCAL",
            Opcode::Jump => "JUMP",
            Opcode::JumpIfFalse => "JUMP_IF_FALSE",
            Opcode::CallUser => "CALL_USER",
            Opcode::LibcCall => "LIBC_CALL",
        }
    }

    /// Fixed operand bytes. `CONST_STRING` has a 4-byte length followed by
    /// that many bytes of data.
    pub fn operand_len(self) -> usize {
        match self {
            Opcode::ConstI32
            | Opcode::ConstString
            | Opcode::StoreLocal
            | Opcode::LoadLocal
            | Opcode::Jump
            | Opcode::JumpIfFalse
            | Opcode::CallUser
            | Opcode::LibcCall => 4,
            _ => 0,
        }
    }

    fn compare(self) -> Option<Cmp> {
        match self {
            Opcode::Eq => Some(Cmp::Eq),
            Opcode::Ne => Some(Cmp::Ne),
            Opcode::Lt => Some(Cmp::Lt),
            Opcode::Le => Some(Cmp::Le),
            Opcode::Gt => Some(Cmp::Gt),
            Opcode::Ge => Some(Cmp::Ge),
            _ => None,
        }
    }
}

impl From<Cmp> for Opcode {
    fn from(cmp: Cmp) -> Self {
        match cmp {
            Cmp::Eq => Opcode::Eq,
            Cmp::Ne => Opcode::Ne,
            Cmp::Lt => Opcode::Lt,
            Cmp::Le => Opcode::Le,
            Cmp::Gt => Opcode::Gt,
            Cmp::Ge => Opcode::Ge,
        }
    }
}

/// A decoded instruction. Jump targets are absolute code offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr<'a> {
    Nop,
    Halt,
    Drop,
    ConstI32(i32),
    ConstString(&'a [u8]),
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Compare(Cmp),
    StoreLocal(u32),
    LoadLocal(u32),
    Jump(u32),
    JumpIfFalse(u32),
    CallUser { function: u16, argc: u16 },
    LibcCall { id: u16, argc: u16 },
}

impl Instr<'_> {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instr::Nop => Opcode::Nop,
            Instr::Halt => Opcode::Halt,
            Instr::Drop => Opcode::Drop,
            Instr::ConstI32(_) => Opcode::ConstI32,
            Instr::ConstString(_) => Opcode::ConstString,
            Instr::Add => Opcode::Add,
            Instr::Sub => Opcode::Sub,
            Instr::Mul => Opcode::Mul,
            Instr::Div => Opcode::Div,
            Instr::Mod => Opcode::Mod,
            Instr::Compare(cmp) => Opcode::from(*cmp),
            Instr::StoreLocal(_) => Opcode::StoreLocal,
            Instr::LoadLocal(_) => Opcode::LoadLocal,
            Instr::Jump(_) => Opcode::Jump,
            Instr::JumpIfFalse(_) => Opcode::JumpIfFalse,
            Instr::CallUser { .. } => Opcode::CallUser,
            Instr::LibcCall { .. } => Opcode::LibcCall,
        }
    }

    /// Encoded size in bytes, opcode included.
    pub fn encoded_len(&self) -> usize {
        let data = match self {
            Instr::ConstString(bytes) => bytes.len(),
            _ => 0,
        };
        1 + self.opcode().operand_len() + data
    }

    /// Append the encoding to `out`. String data must fit a `u32` length;
    /// the builder checks that before encoding.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode() as u8);
        match *self {
            Instr::ConstI32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Instr::ConstString(bytes) => {
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            Instr::StoreLocal(slot) | Instr::LoadLocal(slot) => {
                out.extend_from_slice(&slot.to_le_bytes())
            }
            Instr::Jump(target) | Instr::JumpIfFalse(target) => {
                out.extend_from_slice(&target.to_le_bytes())
            }
            Instr::CallUser { function: a, argc }
            | Instr::LibcCall { id: a, argc } => {
                out.extend_from_slice(&a.to_le_bytes());
                out.extend_from_slice(&argc.to_le_bytes());
            }
            _ => {}
        }
    }

    pub fn jump_target(&self) -> Option<u32> {
        match self {
            Instr::Jump(t) | Instr::JumpIfFalse(t) => Some(*t),
            _ => None,
        }
    }
}

impl fmt::Display for Instr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.opcode().mnemonic();
        match self {
            Instr::ConstI32(v) => write!(f, "{name} {v}"),
            Instr::ConstString(bytes) => {
                write!(f, "{name} \"{}\"", String::from_utf8_lossy(bytes).escape_default())
            }
            Instr::StoreLocal(slot) | Instr::LoadLocal(slot) => write!(f, "{name} {slot}"),
            Instr::Jump(target) | Instr::JumpIfFalse(target) => write!(f, "{name} @{target}"),
            Instr::CallUser { function, argc } => write!(f, "{name} #{function} argc={argc}"),
            Instr::LibcCall { id, argc } => write!(f, "{name} 0x{id:04X} argc={argc}"),
            _ => f.write_str(name),
        }
    }
}

/// Iterator over `(offset, instruction)` pairs of a code slice. Offsets are
/// relative to `base`, so a function's code can be walked in place.
#[derive(Debug, Clone)]
pub struct Instructions<'a> {
    code: &'a [u8],
    pos: usize,
    base: usize,
    failed: bool,
}

impl<'a> Instructions<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Self::with_base(code, 0)
    }

    pub fn with_base(code: &'a [u8], base: usize) -> Self {
        Self {
            code,
            pos: 0,
            base,
            failed: false,
        }
    }

    fn take(&mut self, n: usize, start: usize) -> Result<&'a [u8], DecodeError> {
        if self.code.len() - self.pos < n {
            return Err(DecodeError::Truncated {
                offset: self.base + start,
                needed: n,
            });
        }
        let bytes = &self.code[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn take_u32(&mut self, start: usize) -> Result<u32, DecodeError> {
        let b = self.take(4, start)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_pair(&mut self, start: usize) -> Result<(u16, u16), DecodeError> {
        let b = self.take(4, start)?;
        Ok((
            u16::from_le_bytes([b[0], b[1]]),
            u16::from_le_bytes([b[2], b[3]]),
        ))
    }

    fn decode_one(&mut self) -> Result<(usize, Instr<'a>), DecodeError> {
        let start = self.pos;
        let byte = self.code[start];
        let opcode = Opcode::from_byte(byte).ok_or(DecodeError::UnknownOpcode {
            opcode: byte,
            offset: self.base + start,
        })?;
        self.pos += 1;

        let instr = match opcode {
            Opcode::Nop => Instr::Nop,
            Opcode::Halt => Instr::Halt,
            Opcode::Drop => Instr::Drop,
            Opcode::ConstI32 => Instr::ConstI32(self.take_u32(start)? as i32),
            Opcode::ConstString => {
                let len = self.take_u32(start)? as usize;
                Instr::ConstString(self.take(len, start)?)
            }
            Opcode::Add => Instr::Add,
            Opcode::Sub => Instr::Sub,
            Opcode::Mul => Instr::Mul,
            Opcode::Div => Instr::Div,
            Opcode::Mod => Instr::Mod,
            Opcode::StoreLocal => Instr::StoreLocal(self.take_u32(start)?),
            Opcode::LoadLocal => Instr::LoadLocal(self.take_u32(start)?),
            Opcode::Jump => Instr::Jump(self.take_u32(start)?),
            Opcode::JumpIfFalse => Instr::JumpIfFalse(self.take_u32(start)?),
            Opcode::CallUser => {
                let (function, argc) = self.take_pair(start)?;
                Instr::CallUser { function, argc }
            }
            Opcode::LibcCall => {
                let (id, argc) = self.take_pair(start)?;
                Instr::LibcCall { id, argc }
            }
            cmp => match cmp.compare() {
                Some(c) => Instr::Compare(c),
                None => Instr::Nop,
            },
        };

        Ok((self.base + start, instr))
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<(usize, Instr<'a>), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.code.len() {
            return None;
        }
        let item = self.decode_one();
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_numbers() {
        assert_eq!(Opcode::ConstI32 as u8, 0x10);
        assert_eq!(Opcode::LibcCall as u8, 0xF0);
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_byte(op as u8), Some(op));
        }
        assert_eq!(Opcode::from_byte(0x11), None);
    }

    #[test]
    fn test_operand_lengths() {
        let fixed4 = [
            Opcode::ConstI32,
            Opcode::ConstString,
            Opcode::StoreLocal,
            Opcode::LoadLocal,
            Opcode::Jump,
            Opcode::JumpIfFalse,
            Opcode::CallUser,
            Opcode::LibcCall,
        ];
        for op in Opcode::ALL {
            let expected = if fixed4.contains(&op) { 4 } else { 0 };
            assert_eq!(op.operand_len(), expected, "{}", op.mnemonic());
        }
    }

    #[test]
    fn test_decode_sequence() {
        let mut code = Vec::new();
        for instr in [
            Instr::ConstString(b"hi"),
            Instr::ConstI32(-2),
            Instr::Compare(Cmp::Ge),
            Instr::LibcCall { id: 0x30, argc: 2 },
            Instr::Halt,
        ] {
            instr.encode(&mut code);
        }

        let decoded: Vec<_> = Instructions::new(&code).collect::<Result<_, _>>().unwrap();
        let offsets: Vec<usize> = decoded.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![0, 7, 12, 13, 18]);
        assert_eq!(decoded[0].1, Instr::ConstString(b"hi"));
        assert_eq!(decoded[3].1.to_string(), "LIBC_CALL 0x0030 argc=2");
    }

    #[test]
    fn test_decode_errors() {
        let mut it = Instructions::with_base(&[0x10, 1, 2], 100);
        assert_eq!(
            it.next(),
            Some(Err(DecodeError::Truncated {
                offset: 100,
                needed: 4
            }))
        );
        assert_eq!(it.next(), None);

        let mut it = Instructions::new(&[0x01, 0x99]);
        assert!(matches!(it.next(), Some(Ok((0, Instr::Halt)))));
        assert_eq!(
            it.next(),
            Some(Err(DecodeError::UnknownOpcode {
                opcode: 0x99,
                offset: 1
            }))
        );
    }
}
