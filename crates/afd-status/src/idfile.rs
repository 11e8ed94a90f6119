//! Generation ID files (`fsa.id`, `fra.id`).
//!
//! Each holds one native-endian `i32`: the suffix of the status file that
//! is currently live. Readers compare it with the generation they attached
//! to in order to notice a swap.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::lock::{AreaLock, LockKind, LockWait};
use crate::Result;

/// Current generation, or `None` when no ID file exists yet
pub fn read_id(path: &Path) -> Result<Option<i32>> {
    let mut file = match OpenOptions::new().read(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let _lock = AreaLock::acquire(file.as_raw_fd(), 0, 0, LockKind::Shared, LockWait::Wait)?;
    let mut raw = [0u8; 4];
    match file.read_exact(&mut raw) {
        Ok(()) => Ok(Some(i32::from_ne_bytes(raw))),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn write_id(path: &Path, id: i32) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let _lock = AreaLock::acquire(file.as_raw_fd(), 0, 0, LockKind::Exclusive, LockWait::Wait)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&id.to_ne_bytes())?;
    file.set_len(4)?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("fsa.id");
        assert_eq!(read_id(&path).unwrap(), None);
        write_id(&path, 4).unwrap();
        write_id(&path, 5).unwrap();
        assert_eq!(read_id(&path).unwrap(), Some(5));
        assert_eq!(std::fs::read(&path).unwrap(), 5i32.to_ne_bytes());
    }
}
