//! File-mask database (`fifodir/file_mask.data`).
//!
//! Append-only list of variable-length records behind a word-offset header:
//!
//! ```text
//! <count:i32><max-single-len:i32><total-len:i32><id:u32><pad-len:u8>
//! <mask_0>\0<mask_1>\0..<mask_n>\0<redundancy:u8><pad-len zero bytes>
//! ```
//!
//! Records are padded to a multiple of four bytes. The ID is the CRC-32 of
//! the mask block followed by the redundancy byte, so identical mask lists
//! share one record.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use afd_config::log_catalog_debug;
use afd_status::header::WordOffsetHeader;
use afd_status::LockKind;

use crate::checksum::{allocate_id, id_of, Checksum, Crc32};
use crate::locked::{header_and_body, LockedFile};
use crate::{CatalogError, Result};

pub const FILE_MASK_VERSION: u8 = 1;

const FIXED_LEN: usize = 4 + 4 + 4 + 4 + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMaskEntry {
    pub id: u32,
    pub masks: Vec<String>,
    pub redundancy: u8,
}

impl FileMaskEntry {
    /// Masks joined and NUL terminated, as stored and checksummed
    pub fn mask_block(masks: &[String]) -> Vec<u8> {
        let mut block = Vec::new();
        for mask in masks {
            block.extend_from_slice(mask.as_bytes());
            block.push(0);
        }
        block
    }

    /// Encoded record bytes
    pub fn encode(&self) -> Vec<u8> {
        let block = Self::mask_block(&self.masks);
        let max_single = self.masks.iter().map(|m| m.len() + 1).max().unwrap_or(0);
        let unpadded = FIXED_LEN + block.len() + 1;
        let pad = (4 - unpadded % 4) % 4;

        let mut out = Vec::with_capacity(unpadded + pad);
        out.extend_from_slice(&(self.masks.len() as i32).to_ne_bytes());
        out.extend_from_slice(&(max_single as i32).to_ne_bytes());
        out.extend_from_slice(&(block.len() as i32).to_ne_bytes());
        out.extend_from_slice(&self.id.to_ne_bytes());
        out.push(pad as u8);
        out.extend_from_slice(&block);
        out.push(self.redundancy);
        out.resize(unpadded + pad, 0);
        out
    }

    /// Decode one record; returns it and the bytes consumed
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let corrupt = |what: &str| CatalogError::Corrupt(format!("file mask record: {}", what));
        if buf.len() < FIXED_LEN {
            return Err(corrupt("truncated header"));
        }
        let int = |at: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&buf[at..at + 4]);
            raw
        };
        let count = i32::from_ne_bytes(int(0));
        let total = i32::from_ne_bytes(int(8));
        let id = u32::from_ne_bytes(int(12));
        let pad = buf[16] as usize;
        if count < 0 || total < 0 {
            return Err(corrupt("negative length"));
        }
        let total = total as usize;
        let len = FIXED_LEN + total + 1 + pad;
        if buf.len() < len {
            return Err(corrupt("truncated body"));
        }
        let block = &buf[FIXED_LEN..FIXED_LEN + total];
        let masks: Vec<String> = block
            .split(|&b| b == 0)
            .take(count as usize)
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .collect();
        if masks.len() != count as usize {
            return Err(corrupt("mask count mismatch"));
        }
        let redundancy = buf[FIXED_LEN + total];
        Ok((
            Self {
                id,
                masks,
                redundancy,
            },
            len,
        ))
    }
}

fn parse_all(buf: &[u8]) -> Result<(WordOffsetHeader, Vec<FileMaskEntry>)> {
    let (header, mut body) = header_and_body(buf, FILE_MASK_VERSION)?;
    let mut entries = Vec::with_capacity(header.count.max(0) as usize);
    for _ in 0..header.count.max(0) {
        let (entry, used) = FileMaskEntry::decode(body)?;
        entries.push(entry);
        body = &body[used..];
    }
    Ok((header, entries))
}

/// Handle on the file-mask database
#[derive(Debug, Clone)]
pub struct FileMaskDb {
    path: PathBuf,
}

impl FileMaskDb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store a mask list, returning its (possibly pre-existing) ID
    pub fn store(&self, masks: &[String]) -> Result<u32> {
        self.store_with(&Crc32, masks)
    }

    pub fn store_with<C: Checksum + ?Sized>(&self, hasher: &C, masks: &[String]) -> Result<u32> {
        let mut file = LockedFile::open(&self.path, LockKind::Exclusive)?;
        let buf = file.read_all()?;
        let (mut header, entries) = parse_all(&buf)?;

        if let Some(existing) = entries.iter().find(|e| e.masks == masks) {
            return Ok(existing.id);
        }

        let block = FileMaskEntry::mask_block(masks);
        let (id, redundancy) = allocate_id(hasher, &block, |id| entries.iter().any(|e| e.id == id))?;
        let entry = FileMaskEntry {
            id,
            masks: masks.to_vec(),
            redundancy,
        };

        header.version = FILE_MASK_VERSION;
        header.count = entries.len() as i32 + 1;
        if buf.len() < afd_status::AFD_WORD_OFFSET {
            let mut fresh = header.to_bytes().to_vec();
            fresh.extend(entry.encode());
            file.rewrite(&fresh)?;
        } else {
            file.append(&entry.encode())?;
            file.write_at(0, &header.to_bytes())?;
            file.sync()?;
        }
        log_catalog_debug!("Stored file mask list", id = id, masks = masks.len(), redundancy = redundancy);
        Ok(id)
    }

    pub fn entries(&self) -> Result<Vec<FileMaskEntry>> {
        let mut file = LockedFile::open(&self.path, LockKind::Shared)?;
        let buf = file.read_all()?;
        drop(file);
        Ok(parse_all(&buf)?.1)
    }

    pub fn lookup(&self, id: u32) -> Result<Option<Vec<String>>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|e| e.id == id)
            .map(|e| e.masks))
    }

    /// Drop records no job refers to; returns how many were removed.
    ///
    /// Job records outlive their configuration, so `referenced` must hold
    /// the mask ID of every job record, not only the current ones. The
    /// file is only rewritten when something is dropped.
    pub fn drop_unreferenced(&self, referenced: &HashSet<u32>) -> Result<usize> {
        let mut file = LockedFile::open(&self.path, LockKind::Exclusive)?;
        let buf = file.read_all()?;
        let (mut header, entries) = parse_all(&buf)?;
        let before = entries.len();
        let kept: Vec<&FileMaskEntry> = entries.iter().filter(|e| referenced.contains(&e.id)).collect();
        if kept.len() == before {
            return Ok(0);
        }
        header.version = FILE_MASK_VERSION;
        header.count = kept.len() as i32;
        let mut out = header.to_bytes().to_vec();
        for entry in kept.iter() {
            out.extend(entry.encode());
        }
        file.rewrite(&out)?;
        Ok(before - kept.len())
    }

    /// Check every stored ID against its checksum
    pub fn verify(&self) -> Result<Vec<u32>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| id_of(&Crc32, &FileMaskEntry::mask_block(&e.masks), e.redundancy) != e.id)
            .map(|e| e.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn masks(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_record_wire_format() {
        let entry = FileMaskEntry {
            id: 0x11223344,
            masks: masks(&["*.bin", "a?"]),
            redundancy: 0,
        };
        let bytes = entry.encode();
        // 17 fixed + "*.bin\0a?\0" (9) + redundancy (1) = 27 -> padded to 28
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[0..4], &2i32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &6i32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &9i32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &0x11223344u32.to_ne_bytes());
        assert_eq!(bytes[16], 1);
        assert_eq!(&bytes[17..26], b"*.bin\0a?\0");
        assert_eq!(bytes[26], 0);

        let (decoded, used) = FileMaskEntry::decode(&bytes).unwrap();
        assert_eq!(used, 28);
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_identical_lists_share_an_id() {
        let temp = tempdir().unwrap();
        let db = FileMaskDb::new(temp.path().join("file_mask.data"));
        let a = db.store(&masks(&["*.bin"])).unwrap();
        let b = db.store(&masks(&["*.txt"])).unwrap();
        assert_ne!(a, b);
        assert_eq!(db.store(&masks(&["*.bin"])).unwrap(), a);
        assert_eq!(db.entries().unwrap().len(), 2);
        assert_eq!(db.lookup(b).unwrap(), Some(masks(&["*.txt"])));
        assert!(db.verify().unwrap().is_empty());
    }

    #[test]
    fn test_colliding_lists_get_distinct_ids() {
        let temp = tempdir().unwrap();
        let db = FileMaskDb::new(temp.path().join("file_mask.data"));
        // Equal-length inputs with equal CRC-32 keep colliding after the
        // same trailing bytes, so the second needs redundancy byte 1
        let first = db.store(&masks(&["plumless"])).unwrap();
        let second = db.store(&masks(&["buckeroo"])).unwrap();
        assert_ne!(first, second);

        let entries = db.entries().unwrap();
        assert_eq!(entries[0].redundancy, 0);
        assert_eq!(entries[1].redundancy, 1);
        assert_eq!(db.lookup(first).unwrap(), Some(masks(&["plumless"])));
        assert_eq!(db.lookup(second).unwrap(), Some(masks(&["buckeroo"])));
        assert!(db.verify().unwrap().is_empty());
    }

    #[test]
    fn test_empty_mask_list_and_unreferenced_drop() {
        let temp = tempdir().unwrap();
        let db = FileMaskDb::new(temp.path().join("file_mask.data"));
        let empty = db.store(&[]).unwrap();
        let bins = db.store(&masks(&["*.bin"])).unwrap();
        assert_eq!(db.lookup(empty).unwrap(), Some(vec![]));

        let referenced: HashSet<u32> = [empty, bins].into_iter().collect();
        let before = std::fs::read(db.path()).unwrap();
        assert_eq!(db.drop_unreferenced(&referenced).unwrap(), 0);
        assert_eq!(std::fs::read(db.path()).unwrap(), before);

        let referenced: HashSet<u32> = [bins].into_iter().collect();
        assert_eq!(db.drop_unreferenced(&referenced).unwrap(), 1);
        assert_eq!(db.lookup(empty).unwrap(), None);
        assert_eq!(db.lookup(bins).unwrap(), Some(masks(&["*.bin"])));
        assert!(db.verify().unwrap().is_empty());
    }
}
