//! Whole-file locked access to catalog files that are not mapped.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use afd_status::header::{WordOffsetHeader, AFD_WORD_OFFSET};
use afd_status::{AreaLock, LockKind, LockWait};

use crate::{CatalogError, Result};

/// An open file holding a whole-file `fcntl` lock until dropped
pub struct LockedFile {
    // Declared first so the lock is released before the descriptor closes
    _lock: AreaLock,
    file: File,
}

impl LockedFile {
    pub fn open(path: &Path, kind: LockKind) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let lock = AreaLock::acquire(file.as_raw_fd(), 0, 0, kind, LockWait::Wait)?;
        Ok(Self { _lock: lock, file })
    }

    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn rewrite(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(bytes)?;
        self.file.set_len(bytes.len() as u64)?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Split a word-offset file into its header and body, initializing an
/// empty or short file
pub fn header_and_body(buf: &[u8], version: u8) -> Result<(WordOffsetHeader, &[u8])> {
    if buf.len() < AFD_WORD_OFFSET {
        return Ok((WordOffsetHeader::new(version), &[]));
    }
    let header = WordOffsetHeader::read(buf);
    if header.version != version && !(header.version == 0 && header.count == 0) {
        return Err(CatalogError::Corrupt(format!(
            "unexpected version {} (expected {})",
            header.version, version
        )));
    }
    Ok((header, &buf[AFD_WORD_OFFSET..]))
}
