//! ASTC container format
//!
//! Every ASTC file starts with a fixed 16-byte little-endian header:
//!
//! | Offset | Size | Field         |
//! |--------|------|---------------|
//! | 0      | 4    | magic `ASTC`  |
//! | 4      | 4    | version (= 1) |
//! | 8      | 4    | payload size  |
//! | 12     | 4    | entry point   |
//!
//! The payload opens with a one-byte [`PayloadKind`]. A tree payload is the
//! serialized AST ([`tree`]); a bytecode payload is a
//! [`BytecodeModule`](crate::bytecode::BytecodeModule).
//!
//! The entry point is the index of `main` among the top-level declarations
//! for a tree payload, and the code offset of `main` for a bytecode payload.

pub mod bytes;
pub mod tree;

pub use bytes::{ByteReader, ByteWriter};

use crate::bytecode::BytecodeModule;
use crate::parser::ast::AstNode;

pub const MAGIC: [u8; 4] = *b"ASTC";
pub const VERSION: u32 = 1;
pub const HEADER_LEN: usize = 16;

/// Errors raised while serializing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("{what} of length {len} does not fit in a 32-bit field")]
    TooLarge { what: &'static str, len: usize },
    #[error("expected a translation unit, found {0}")]
    NotATranslationUnit(&'static str),
    #[error("tree nesting exceeds {0} levels")]
    TooDeep(usize),
}

/// Errors raised while reading an ASTC file or one of its payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("bad magic {0:02X?}, expected \"ASTC\"")]
    BadMagic([u8; 4]),
    #[error("unsupported ASTC version {0}")]
    UnsupportedVersion(u32),
    #[error("header declares {declared} payload bytes but {actual} are present")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("truncated input at offset {offset}: {needed} more bytes needed")]
    Truncated { offset: usize, needed: usize },
    #[error("unknown payload kind 0x{0:02X}")]
    UnknownPayloadKind(u8),
    #[error("unknown {what} tag 0x{tag:02X} at offset {offset}")]
    UnknownTag {
        what: &'static str,
        tag: u8,
        offset: usize,
    },
    #[error("unknown opcode 0x{opcode:02X} at code offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("invalid UTF-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("{count} trailing bytes after payload")]
    TrailingBytes { count: usize },
    #[error("expected {expected} at offset {offset}, found {found}")]
    UnexpectedNode {
        expected: &'static str,
        found: &'static str,
        offset: usize,
    },
    #[error("tree nesting exceeds {0} levels")]
    TooDeep(usize),
    #[error("function '{name}' spans {start}..{end} outside the {code_len}-byte code section")]
    FunctionOutOfRange {
        name: String,
        start: usize,
        end: usize,
        code_len: usize,
    },
}

/// First byte of every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    Tree = 0x01,
    Bytecode = 0x02,
}

impl PayloadKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(PayloadKind::Tree),
            0x02 => Some(PayloadKind::Bytecode),
            _ => None,
        }
    }
}

/// Fixed header at the front of an ASTC file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AstcHeader {
    pub version: u32,
    pub data_size: u32,
    pub entry_point: u32,
}

impl AstcHeader {
    pub fn write(&self, w: &mut ByteWriter) {
        w.write_bytes(&MAGIC);
        w.write_u32(self.version);
        w.write_u32(self.data_size);
        w.write_u32(self.entry_point);
    }

    /// Validate the header and return it with the payload that follows.
    pub fn read(bytes: &[u8]) -> Result<(AstcHeader, &[u8]), DecodeError> {
        let mut r = ByteReader::new(bytes);
        let magic = r.read_bytes(4)?;
        if magic != MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(magic);
            return Err(DecodeError::BadMagic(found));
        }

        let version = r.read_u32()?;
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let header = AstcHeader {
            version,
            data_size: r.read_u32()?,
            entry_point: r.read_u32()?,
        };

        let payload = &bytes[HEADER_LEN..];
        if payload.len() != header.data_size as usize {
            return Err(DecodeError::SizeMismatch {
                declared: header.data_size as usize,
                actual: payload.len(),
            });
        }

        Ok((header, payload))
    }
}

/// Decoded payload of an ASTC file.
#[derive(Debug, Clone, PartialEq)]
pub enum AstcPayload {
    Tree(AstNode),
    Bytecode(BytecodeModule),
}

/// A fully decoded ASTC file.
#[derive(Debug, Clone, PartialEq)]
pub struct AstcFile {
    pub header: AstcHeader,
    pub payload: AstcPayload,
}

fn wrap(kind: PayloadKind, entry_point: u32, body: ByteWriter) -> Result<Vec<u8>, EncodeError> {
    let body = body.finish();
    let data_size = body.len() + 1;
    let data_size = u32::try_from(data_size).map_err(|_| EncodeError::TooLarge {
        what: "payload",
        len: data_size,
    })?;

    let mut out = ByteWriter::with_capacity(HEADER_LEN + data_size as usize);
    AstcHeader {
        version: VERSION,
        data_size,
        entry_point,
    }
    .write(&mut out);
    out.write_u8(kind as u8);
    out.write_bytes(&body);
    Ok(out.finish())
}

/// Serialize a translation unit as a tree payload.
pub fn encode_tree(unit: &AstNode) -> Result<Vec<u8>, EncodeError> {
    if !matches!(unit, AstNode::TranslationUnit { .. }) {
        return Err(EncodeError::NotATranslationUnit(unit.kind_name()));
    }

    let entry = unit
        .declarations()
        .iter()
        .position(|d| matches!(d, AstNode::FunctionDecl { name, body: Some(_), .. } if name == "main"))
        .unwrap_or(0);

    let mut body = ByteWriter::new();
    tree::write_node(&mut body, unit)?;
    let entry = u32::try_from(entry).map_err(|_| EncodeError::TooLarge {
        what: "declaration list",
        len: entry,
    })?;
    wrap(PayloadKind::Tree, entry, body)
}

/// Serialize a bytecode module as a bytecode payload.
pub fn encode_bytecode(module: &BytecodeModule) -> Result<Vec<u8>, EncodeError> {
    let mut body = ByteWriter::new();
    module.write(&mut body)?;
    let entry = module.entry_offset().unwrap_or(0);
    wrap(PayloadKind::Bytecode, entry, body)
}

/// Parse and validate a complete ASTC file.
pub fn decode(bytes: &[u8]) -> Result<AstcFile, DecodeError> {
    let (header, payload) = AstcHeader::read(bytes)?;
    let mut r = ByteReader::new(payload);

    let kind_byte = r.read_u8()?;
    let kind = PayloadKind::from_byte(kind_byte).ok_or(DecodeError::UnknownPayloadKind(kind_byte))?;

    let payload = match kind {
        PayloadKind::Tree => {
            let node = tree::read_node(&mut r)?;
            if !matches!(node, AstNode::TranslationUnit { .. }) {
                return Err(DecodeError::UnexpectedNode {
                    expected: "translation unit",
                    found: node.kind_name(),
                    offset: 1,
                });
            }
            AstcPayload::Tree(node)
        }
        PayloadKind::Bytecode => AstcPayload::Bytecode(BytecodeModule::read(&mut r)?),
    };
    r.expect_end()?;

    log::debug!(
        "decoded ASTC v{} payload ({} bytes, entry {})",
        header.version,
        header.data_size,
        header.entry_point
    );

    Ok(AstcFile { header, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    #[test]
    fn test_header_layout() {
        let unit = parser::parse("int f() { return 1; }\nint main() { return 0; }").unwrap();
        let bytes = encode_tree(&unit).unwrap();

        assert_eq!(&bytes[0..4], b"ASTC");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 1);
        assert_eq!(
            u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize,
            bytes.len() - HEADER_LEN
        );
        // main is the second declaration
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 1);
        assert_eq!(bytes[16], PayloadKind::Tree as u8);
    }

    #[test]
    fn test_rejects_bad_headers() {
        let unit = parser::parse("int main() { return 0; }").unwrap();
        let good = encode_tree(&unit).unwrap();

        let mut bad_magic = good.clone();
        bad_magic[0] = b'X';
        assert!(matches!(decode(&bad_magic), Err(DecodeError::BadMagic(_))));

        let mut bad_version = good.clone();
        bad_version[4] = 9;
        assert_eq!(decode(&bad_version), Err(DecodeError::UnsupportedVersion(9)));

        let truncated = &good[..good.len() - 1];
        assert!(matches!(decode(truncated), Err(DecodeError::SizeMismatch { .. })));

        let mut bad_kind = good;
        bad_kind[HEADER_LEN] = 0x7F;
        assert_eq!(decode(&bad_kind), Err(DecodeError::UnknownPayloadKind(0x7F)));
    }

    #[test]
    fn test_tree_round_trip() {
        let unit = parser::parse(
            "module demo;\nexport main;\n\
             int main() { int x = 'a'; x += 2; printf(\"%d\\n\", x); return -x; }",
        )
        .unwrap();
        let file = decode(&encode_tree(&unit).unwrap()).unwrap();
        assert_eq!(file.payload, AstcPayload::Tree(unit));
    }

    #[test]
    fn test_every_node_kind_round_trips() {
        let source = r#"
            module everything;
            import io from "libc.rt";
            import util;
            export main;

            const unsigned int *cursor;
            double ratio = 1.5;
            long add(long a, char **b);

            int main() {
                int i = 0;
                char c = 'z';
                if (i < 1) { i = -i; } else if (i == 2) i++; else { --i; }
                while (i != 3) { i += 1; }
                do { i--; } while (i > 0 && !c);
                for (;;) { break; }
                for (i = 0; i <= 4; i++) { if (i % 2) continue; }
                printf("%d %c
", ~i, c);
                return (i | 1) ^ (i & 2) << 1;
            }
        "#;
        let unit = parser::parse(source).unwrap();
        let bytes = encode_tree(&unit).unwrap();
        let file = decode(&bytes).unwrap();
        assert_eq!(file.header.entry_point, 7);
        assert_eq!(file.payload, AstcPayload::Tree(unit));
    }
}
