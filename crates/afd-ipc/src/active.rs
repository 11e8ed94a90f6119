//! Active-process lock (`fifodir/AFD_ACTIVE`).
//!
//! The supervisor holds an exclusive `flock` on the file for its whole
//! lifetime and writes its PID into it. Anyone else can probe whether an
//! AFD is alive by trying a shared lock.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::Result;

/// Held for as long as the supervisor runs. Dropping it releases the lock.
#[derive(Debug)]
pub struct ActiveLock {
    file: File,
    path: PathBuf,
}

impl ActiveLock {
    /// Try to become the active AFD.
    ///
    /// Returns `Ok(None)` if another process already holds the lock.
    pub fn acquire(path: &Path) -> Result<Option<Self>> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    /// PID of the active AFD, if one holds the lock
    pub fn probe(path: &Path) -> Result<Option<u32>> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                // Nobody holds it: stale file from a crashed run
                let _ = FileExt::unlock(&file);
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let mut contents = String::new();
                file.read_to_string(&mut contents)?;
                Ok(Some(contents.trim().parse().unwrap_or(0)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock and remove the file
    pub fn release(self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}
