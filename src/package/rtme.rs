//! RTME runtime images
//!
//! ```text
//! 0   "RTME"
//! 4   version (u32, = 1)
//! 8   code size (u32)
//! 12  entry offset from the start of the file (u32)
//! 16  machine code
//! ```

use super::PackageError;
use crate::astc::{ByteReader, ByteWriter};

pub const MAGIC: [u8; 4] = *b"RTME";
pub const VERSION: u32 = 1;
pub const HEADER_LEN: usize = 16;

/// A parsed RTME image, borrowing its code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtmeImage<'a> {
    pub version: u32,
    /// File offset of the entry point
    pub entry: u32,
    pub code: &'a [u8],
}

impl RtmeImage<'_> {
    /// Entry point relative to the start of the code.
    pub fn entry_in_code(&self) -> usize {
        (self.entry as usize).saturating_sub(HEADER_LEN)
    }
}

pub fn build(code: &[u8], entry_offset: usize) -> Result<Vec<u8>, PackageError> {
    let size = u32::try_from(code.len()).map_err(|_| PackageError::CodeTooLarge(code.len()))?;
    let entry = u32::try_from(HEADER_LEN + entry_offset)
        .map_err(|_| PackageError::CodeTooLarge(code.len()))?;

    let mut w = ByteWriter::with_capacity(HEADER_LEN + code.len());
    w.write_bytes(&MAGIC);
    w.write_u32(VERSION);
    w.write_u32(size);
    w.write_u32(entry);
    w.write_bytes(code);
    Ok(w.finish())
}

pub fn parse(bytes: &[u8]) -> Result<RtmeImage<'_>, PackageError> {
    let mut r = ByteReader::new(bytes);
    let magic = r.read_bytes(4)?;
    if magic != MAGIC {
        return Err(PackageError::NotAnImage);
    }
    let version = r.read_u32()?;
    if version != VERSION {
        return Err(PackageError::UnsupportedVersion(version));
    }
    let size = r.read_u32()? as usize;
    let entry = r.read_u32()?;
    let code = r.read_bytes(size)?;
    r.expect_end()?;

    if (size > 0 && (entry as usize) < HEADER_LEN) || entry as usize > HEADER_LEN + size {
        return Err(PackageError::EntryOutOfRange { entry, size });
    }
    Ok(RtmeImage {
        version,
        entry,
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let image = build(&[0xC3, 0x90], 1).unwrap();
        assert_eq!(&image[0..4], b"RTME");
        assert_eq!(&image[4..8], &1u32.to_le_bytes());
        assert_eq!(&image[8..12], &2u32.to_le_bytes());
        assert_eq!(&image[12..16], &17u32.to_le_bytes());
        assert_eq!(&image[16..], &[0xC3, 0x90]);

        let parsed = parse(&image).unwrap();
        assert_eq!(parsed.entry_in_code(), 1);
        assert_eq!(parsed.code, &[0xC3, 0x90]);
    }

    #[test]
    fn test_rejects_damaged_images() {
        let image = build(&[0xC3], 0).unwrap();
        assert!(matches!(parse(&image[..10]), Err(PackageError::Malformed(_))));
        assert!(matches!(parse(b"MZ\0\0"), Err(PackageError::NotAnImage)));

        let mut bad_entry = image.clone();
        bad_entry[12..16].copy_from_slice(&64u32.to_le_bytes());
        assert!(matches!(
            parse(&bad_entry),
            Err(PackageError::EntryOutOfRange { entry: 64, size: 1 })
        ));
    }
}
