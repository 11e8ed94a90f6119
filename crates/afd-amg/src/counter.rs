//! Unique-number counter shared by everything that names messages.
//!
//! `fifodir/counter` holds one native-endian `i32` and no header. Every
//! increment happens under an exclusive `flock`; the value wraps back to
//! zero after [`MAX_MSG_PER_SEC`] so a (time, number) pair stays unique
//! within one second.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use afd_config::MAX_MSG_PER_SEC;
use fs2::FileExt;

use crate::Result;

#[derive(Debug, Clone)]
pub struct UniqueCounter {
    path: PathBuf,
}

impl UniqueCounter {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = open(&path)?;
        if file.metadata()?.len() < 4 {
            FileExt::lock_exclusive(&file)?;
            let mut f = &file;
            f.seek(SeekFrom::Start(0))?;
            f.write_all(&0i32.to_ne_bytes())?;
            FileExt::unlock(&file)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Increment and return the new value
    pub fn next(&self) -> Result<u32> {
        let file = open(&self.path)?;
        FileExt::lock_exclusive(&file)?;
        let result = (|| -> std::io::Result<u32> {
            let mut f = &file;
            let mut buf = [0u8; 4];
            f.seek(SeekFrom::Start(0))?;
            let current = match f.read_exact(&mut buf) {
                Ok(()) => i32::from_ne_bytes(buf),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => 0,
                Err(e) => return Err(e),
            };
            let next = if current < 0 || current as u32 >= MAX_MSG_PER_SEC {
                0
            } else {
                current + 1
            };
            f.seek(SeekFrom::Start(0))?;
            f.write_all(&next.to_ne_bytes())?;
            Ok(next as u32)
        })();
        FileExt::unlock(&file)?;
        Ok(result?)
    }
}

fn open(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments_and_wraps() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("counter");
        let counter = UniqueCounter::open(&path).unwrap();
        assert_eq!(counter.next().unwrap(), 1);
        assert_eq!(counter.next().unwrap(), 2);

        std::fs::write(&path, (MAX_MSG_PER_SEC as i32).to_ne_bytes()).unwrap();
        assert_eq!(counter.next().unwrap(), 0);
        assert_eq!(counter.next().unwrap(), 1);
    }

    #[test]
    fn test_two_handles_share_state() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("counter");
        let a = UniqueCounter::open(&path).unwrap();
        let b = UniqueCounter::open(&path).unwrap();
        assert_eq!(a.next().unwrap(), 1);
        assert_eq!(b.next().unwrap(), 2);
    }
}
