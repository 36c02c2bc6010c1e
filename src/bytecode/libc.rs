//! Library function ids
//!
//! Calls to C library functions are lowered to `LIBC_CALL id argc`. The ids
//! are fixed: the runtime's dispatcher switches on them, so they must never be
//! renumbered.

use rustc_hash::FxHashMap;
use std::sync::OnceLock;

static TABLE: &[(&str, u16)] = &[
    // memory management
    ("malloc", 0x01),
    ("free", 0x02),
    // strings
    ("strlen", 0x10),
    ("strcpy", 0x11),
    ("strncpy", 0x12),
    ("strcmp", 0x13),
    ("strncmp", 0x14),
    ("strcat", 0x15),
    ("strncat", 0x16),
    ("strchr", 0x17),
    ("strstr", 0x18),
    ("strdup", 0x90),
    ("strtok", 0x91),
    // raw memory
    ("memcpy", 0x20),
    ("memset", 0x22),
    ("memcmp", 0x23),
    // stdio
    ("printf", 0x30),
    ("fprintf", 0x31),
    ("sprintf", 0x32),
    ("scanf", 0x33),
    ("puts", 0x80),
    ("putchar", 0x81),
    ("getchar", 0x82),
    // math
    ("sqrt", 0x52),
    ("pow", 0x53),
    ("sin", 0x54),
    ("cos", 0x55),
    ("tan", 0x56),
    ("log", 0xF3),
    ("log10", 0xF4),
    ("exp", 0xF5),
    ("floor", 0xF7),
    // conversion and process control
    ("atoi", 0x60),
    ("atol", 0x61),
    ("exit", 0x70),
    ("rand", 0xC2),
    ("srand", 0xC3),
    // ctype
    ("isalpha", 0xA0),
    ("isdigit", 0xA1),
    ("isspace", 0xA3),
    ("toupper", 0xA6),
    ("tolower", 0xA7),
    // time
    ("time", 0xB0),
    ("clock", 0xB1),
];

fn by_name() -> &'static FxHashMap<&'static str, u16> {
    static MAP: OnceLock<FxHashMap<&'static str, u16>> = OnceLock::new();
    MAP.get_or_init(|| TABLE.iter().copied().collect())
}

/// Dispatch id for a library function, if it is one the runtime provides.
pub fn lookup(name: &str) -> Option<u16> {
    by_name().get(name).copied()
}

/// Reverse lookup, used by the disassembler and the symbol map.
pub fn name_of(id: u16) -> Option<&'static str> {
    TABLE.iter().find(|(_, i)| *i == id).map(|(name, _)| *name)
}

pub fn all() -> &'static [(&'static str, u16)] {
    TABLE
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_known_ids() {
        assert_eq!(lookup("printf"), Some(0x30));
        assert_eq!(lookup("malloc"), Some(0x01));
        assert_eq!(lookup("strlen"), Some(0x10));
        assert_eq!(lookup("main"), None);
        assert_eq!(name_of(0x81), Some("putchar"));
        assert_eq!(name_of(0xFFFF), None);
    }

    #[test]
    fn test_ids_and_names_unique() {
        let ids: FxHashSet<u16> = all().iter().map(|(_, id)| *id).collect();
        let names: FxHashSet<&str> = all().iter().map(|(n, _)| *n).collect();
        assert_eq!(ids.len(), all().len());
        assert_eq!(names.len(), all().len());
    }
}
