//! CRC-32 identifiers with a trailing disambiguation byte.
//!
//! Every catalog ID is the checksum of the entity's canonical bytes with
//! one extra byte appended. The byte starts at zero and is bumped until the
//! ID is unused, so two different entities never share an ID while an
//! unchanged entity keeps the same ID across restarts.

use afd_config::log_catalog_error;

use crate::{CatalogError, Result};

/// Highest disambiguation byte tried before an insertion is refused
pub const MAX_DISAMBIGUATION: u8 = 254;

/// Checksum used to derive IDs
pub trait Checksum {
    fn checksum(&self, bytes: &[u8]) -> u32;
}

/// CRC-32 (IEEE), the on-disk ID function
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32;

impl Checksum for Crc32 {
    fn checksum(&self, bytes: &[u8]) -> u32 {
        crc32fast::hash(bytes)
    }
}

/// Derive an ID for `canonical` that `taken` does not already report.
///
/// `canonical` must not include the disambiguation byte; it is appended
/// here. Returns the ID together with the byte that produced it.
pub fn allocate_id<C, F>(hasher: &C, canonical: &[u8], taken: F) -> Result<(u32, u8)>
where
    C: Checksum + ?Sized,
    F: Fn(u32) -> bool,
{
    let mut buf = Vec::with_capacity(canonical.len() + 1);
    buf.extend_from_slice(canonical);
    buf.push(0);
    let last = buf.len() - 1;

    for byte in 0..=MAX_DISAMBIGUATION {
        buf[last] = byte;
        let id = hasher.checksum(&buf);
        if !taken(id) {
            return Ok((id, byte));
        }
    }

    log_catalog_error!(
        "Checksum collisions exhausted, entity rejected",
        attempts = MAX_DISAMBIGUATION as u32 + 1
    );
    Err(CatalogError::ChecksumExhausted)
}

/// Recompute the ID of a stored record
pub fn id_of<C: Checksum + ?Sized>(hasher: &C, canonical: &[u8], byte: u8) -> u32 {
    let mut buf = Vec::with_capacity(canonical.len() + 1);
    buf.extend_from_slice(canonical);
    buf.push(byte);
    hasher.checksum(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Constant(u32);

    impl Checksum for Constant {
        fn checksum(&self, _bytes: &[u8]) -> u32 {
            self.0
        }
    }

    #[test]
    fn test_known_crc32_collision_is_resolved() {
        // "plumless" and "buckeroo" share a CRC-32, and keep sharing it
        // with the same trailing byte appended
        assert_eq!(crc32fast::hash(b"plumless"), crc32fast::hash(b"buckeroo"));
        let (first, b1) = allocate_id(&Crc32, b"plumless", |_| false).unwrap();
        assert_eq!(b1, 0);
        let (second, b2) = allocate_id(&Crc32, b"buckeroo", |id| id == first).unwrap();
        assert_eq!(b2, 1);
        assert_ne!(first, second);
        assert_eq!(id_of(&Crc32, b"buckeroo", b2), second);
    }

    #[test]
    fn test_exhaustion_after_255_attempts() {
        let attempts = Cell::new(0u32);
        let result = allocate_id(&Constant(7), b"anything", |_| {
            attempts.set(attempts.get() + 1);
            true
        });
        assert!(matches!(result, Err(CatalogError::ChecksumExhausted)));
        assert_eq!(attempts.get(), 255);
    }
}
