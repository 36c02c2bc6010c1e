//! Minimal PE32+ image with a single `.text` section.
//!
//! This is a scaffold: headers are laid out the way the Windows loader
//! expects, but there is no import table, so the runtime has to provide
//! the libc dispatcher itself.

use super::PackageError;
use crate::astc::ByteWriter;
use crate::codegen::emitter::round_up;
use crate::config::Arch;

const PE_OFFSET: usize = 0x80;
const OPTIONAL_HEADER_SIZE: u16 = 0xF0;
const IMAGE_BASE: u64 = 0x1_4000_0000;
const SECTION_ALIGNMENT: u32 = 0x1000;
const FILE_ALIGNMENT: usize = 0x200;
const HEADERS_SIZE: usize = 0x400;
const TEXT_RVA: u32 = 0x1000;
const DATA_DIRECTORIES: u32 = 16;

// executable image, large address aware
const CHARACTERISTICS: u16 = 0x0022;
// code, execute, read
const TEXT_CHARACTERISTICS: u32 = 0x6000_0020;
const SUBSYSTEM_CONSOLE: u16 = 3;

/// COFF machine field for `arch`.
pub fn machine(arch: Arch) -> u16 {
    match arch {
        Arch::X86_64 => 0x8664,
        Arch::X86_32 => 0x014C,
        Arch::Arm64 => 0xAA64,
        Arch::Arm32 => 0x01C4,
    }
}

pub fn build(arch: Arch, code: &[u8], entry_offset: usize) -> Result<Vec<u8>, PackageError> {
    let too_large = || PackageError::CodeTooLarge(code.len());
    let raw_size = round_up(code.len(), FILE_ALIGNMENT);
    let code_size = u32::try_from(code.len()).map_err(|_| too_large())?;
    let raw_size_u32 = u32::try_from(raw_size).map_err(|_| too_large())?;
    let image_size = u32::try_from(round_up(code.len(), SECTION_ALIGNMENT as usize))
        .ok()
        .and_then(|s| s.checked_add(TEXT_RVA))
        .ok_or_else(too_large)?;
    let entry = u32::try_from(entry_offset)
        .ok()
        .and_then(|e| e.checked_add(TEXT_RVA))
        .ok_or_else(too_large)?;

    let mut w = ByteWriter::with_capacity(HEADERS_SIZE + raw_size);

    // DOS header
    w.write_bytes(b"MZ");
    w.pad_to(0x3C);
    w.write_u32(PE_OFFSET as u32);
    w.pad_to(PE_OFFSET);

    // COFF file header
    w.write_bytes(b"PE\0\0");
    w.write_u16(machine(arch));
    w.write_u16(1);
    w.write_u32(0); // timestamp
    w.write_u32(0); // symbol table
    w.write_u32(0);
    w.write_u16(OPTIONAL_HEADER_SIZE);
    w.write_u16(CHARACTERISTICS);

    // PE32+ optional header
    let optional_start = w.len();
    w.write_u16(0x020B);
    w.write_u8(1); // linker version
    w.write_u8(0);
    w.write_u32(raw_size_u32);
    w.write_u32(0); // initialized data
    w.write_u32(0); // uninitialized data
    w.write_u32(entry);
    w.write_u32(TEXT_RVA);
    w.write_u64(IMAGE_BASE);
    w.write_u32(SECTION_ALIGNMENT);
    w.write_u32(FILE_ALIGNMENT as u32);
    w.write_u16(6); // os version
    w.write_u16(0);
    w.write_u16(0); // image version
    w.write_u16(0);
    w.write_u16(6); // subsystem version
    w.write_u16(0);
    w.write_u32(0);
    w.write_u32(image_size);
    w.write_u32(HEADERS_SIZE as u32);
    w.write_u32(0); // checksum
    w.write_u16(SUBSYSTEM_CONSOLE);
    w.write_u16(0); // dll characteristics
    w.write_u64(0x10_0000); // stack reserve
    w.write_u64(0x1000); // stack commit
    w.write_u64(0x10_0000); // heap reserve
    w.write_u64(0x1000); // heap commit
    w.write_u32(0); // loader flags
    w.write_u32(DATA_DIRECTORIES);
    w.pad_to(optional_start + OPTIONAL_HEADER_SIZE as usize);

    // section table
    w.write_bytes(b".text\0\0\0");
    w.write_u32(code_size);
    w.write_u32(TEXT_RVA);
    w.write_u32(raw_size_u32);
    w.write_u32(HEADERS_SIZE as u32);
    w.write_u32(0); // relocations
    w.write_u32(0); // line numbers
    w.write_u16(0);
    w.write_u16(0);
    w.write_u32(TEXT_CHARACTERISTICS);

    w.pad_to(HEADERS_SIZE);
    w.write_bytes(code);
    w.pad_to(HEADERS_SIZE + raw_size);
    Ok(w.finish())
}
