//! Duplicate-check settings as configured in DIR_CONFIG.
//!
//! The settings travel as one flag word (stored in the FRA and in every
//! CRC table record) plus a timeout. Syntax of the option:
//!
//! ```text
//! dupcheck [<timeout> [<type> [<action> [<crc> [fixed] [recipient]]]]]
//! ```
//!
//! `type`: 1 name, 2 content, 3 name and content, 4 name without last
//! suffix, 5 name and size. `action`: 24 delete, 25 store, 26 warn,
//! 33 delete and warn, 34 store and warn. `crc`: 16 CRC-32, 17 CRC-32c,
//! 18 MurmurHash3.

use crate::{CatalogError, Result};

pub const DC_FILENAME_ONLY: u32 = 0x0000_0001;
pub const DC_FILE_CONTENT: u32 = 0x0000_0002;
pub const DC_FILE_CONT_NAME: u32 = 0x0000_0004;
pub const DC_NAME_NO_SUFFIX: u32 = 0x0000_0008;
pub const DC_FILENAME_AND_SIZE: u32 = 0x0000_0010;
pub const DC_TYPE_MASK: u32 = 0x0000_001f;

pub const DC_CRC32: u32 = 0x0000_8000;
pub const DC_CRC32C: u32 = 0x0001_0000;
pub const DC_MURMUR3: u32 = 0x0002_0000;
pub const DC_ALGORITHM_MASK: u32 = DC_CRC32 | DC_CRC32C | DC_MURMUR3;

pub const DC_DELETE: u32 = 0x0080_0000;
pub const DC_STORE: u32 = 0x0100_0000;
pub const DC_WARN: u32 = 0x0200_0000;
pub const DC_ACTION_MASK: u32 = DC_DELETE | DC_STORE | DC_WARN;

pub const TIMEOUT_IS_FIXED: u32 = 0x0400_0000;
pub const USE_RECIPIENT_ID: u32 = 0x0800_0000;

pub const DEFAULT_DUPCHECK_TIMEOUT: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DupCheckSpec {
    pub timeout: i64,
    pub flags: u32,
}

impl Default for DupCheckSpec {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DUPCHECK_TIMEOUT,
            flags: DC_FILENAME_ONLY | DC_DELETE | DC_CRC32,
        }
    }
}

impl DupCheckSpec {
    /// Parse the words following the `dupcheck` keyword
    pub fn parse(args: &[&str], line: usize) -> Result<Self> {
        let bad = |reason: String| CatalogError::DirConfig { line, reason };
        let number = |word: &str| {
            word.parse::<i64>()
                .map_err(|_| bad(format!("dupcheck: `{}` is not a number", word)))
        };

        let mut spec = Self::default();
        let mut words = args.iter();
        if let Some(w) = words.next() {
            spec.timeout = number(w)?;
            if spec.timeout < 0 {
                return Err(bad("dupcheck: negative timeout".into()));
            }
        }
        if let Some(w) = words.next() {
            let check = match number(w)? {
                1 => DC_FILENAME_ONLY,
                2 => DC_FILE_CONTENT,
                3 => DC_FILE_CONT_NAME,
                4 => DC_NAME_NO_SUFFIX,
                5 => DC_FILENAME_AND_SIZE,
                n => return Err(bad(format!("dupcheck: unknown check type {}", n))),
            };
            spec.flags = (spec.flags & !DC_TYPE_MASK) | check;
        }
        if let Some(w) = words.next() {
            let action = match number(w)? {
                24 => DC_DELETE,
                25 => DC_STORE,
                26 => DC_WARN,
                33 => DC_DELETE | DC_WARN,
                34 => DC_STORE | DC_WARN,
                n => return Err(bad(format!("dupcheck: unknown action {}", n))),
            };
            spec.flags = (spec.flags & !DC_ACTION_MASK) | action;
        }
        if let Some(w) = words.next() {
            let algorithm = match number(w)? {
                16 => DC_CRC32,
                17 => DC_CRC32C,
                18 => DC_MURMUR3,
                n => return Err(bad(format!("dupcheck: unknown checksum {}", n))),
            };
            spec.flags = (spec.flags & !DC_ALGORITHM_MASK) | algorithm;
        }
        for w in words {
            match *w {
                "fixed" => spec.flags |= TIMEOUT_IS_FIXED,
                "recipient" => spec.flags |= USE_RECIPIENT_ID,
                other => return Err(bad(format!("dupcheck: unexpected `{}`", other))),
            }
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_overrides() {
        assert_eq!(DupCheckSpec::parse(&[], 1).unwrap(), DupCheckSpec::default());

        let spec = DupCheckSpec::parse(&["600", "5", "33", "18", "fixed"], 1).unwrap();
        assert_eq!(spec.timeout, 600);
        assert_eq!(spec.flags & DC_TYPE_MASK, DC_FILENAME_AND_SIZE);
        assert_eq!(spec.flags & DC_ACTION_MASK, DC_DELETE | DC_WARN);
        assert_eq!(spec.flags & DC_ALGORITHM_MASK, DC_MURMUR3);
        assert_ne!(spec.flags & TIMEOUT_IS_FIXED, 0);
    }

    #[test]
    fn test_rejects_unknown_values() {
        assert!(DupCheckSpec::parse(&["x"], 3).is_err());
        assert!(DupCheckSpec::parse(&["10", "9"], 3).is_err());
        assert!(DupCheckSpec::parse(&["10", "1", "24", "16", "later"], 3).is_err());
    }
}
