//! Byte-range `fcntl` locks.
//!
//! These are the locks every cooperating process agrees on: whole-file
//! locks for catalog writers and region locks on single record fields for
//! hot counters. Locks are per process, so two handles inside one process
//! never block each other; [`LocalLock`] covers that case.

use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::sync::{Condvar, LazyLock, Mutex, PoisonError};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};

use crate::{Result, StatusError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Block until the region is free
    Wait,
    /// Fail with [`StatusError::WouldBlock`] if the region is held
    Try,
}

fn flock_struct(l_type: libc::c_int, start: i64, len: i64) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = l_type as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;
    fl
}

/// Acquire a lock on `[start, start + len)`; `len == 0` means to end of file
pub fn lock_range(fd: RawFd, start: i64, len: i64, kind: LockKind, wait: LockWait) -> Result<()> {
    let l_type = match kind {
        LockKind::Shared => libc::F_RDLCK,
        LockKind::Exclusive => libc::F_WRLCK,
    };
    let fl = flock_struct(l_type, start, len);
    loop {
        let res = match wait {
            LockWait::Wait => fcntl(fd, FcntlArg::F_SETLKW(&fl)),
            LockWait::Try => fcntl(fd, FcntlArg::F_SETLK(&fl)),
        };
        match res {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) | Err(Errno::EACCES) => return Err(StatusError::WouldBlock),
            Err(e) => return Err(e.into()),
        }
    }
}

pub fn unlock_range(fd: RawFd, start: i64, len: i64) -> Result<()> {
    let fl = flock_struct(libc::F_UNLCK, start, len);
    fcntl(fd, FcntlArg::F_SETLK(&fl))?;
    Ok(())
}

/// A held region lock, released on drop.
///
/// The guard borrows nothing: it must not outlive the file descriptor it
/// was taken on. Closing any descriptor of the file releases every lock
/// this process holds on it anyway.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct AreaLock {
    fd: RawFd,
    start: i64,
    len: i64,
}

impl AreaLock {
    pub fn acquire(fd: RawFd, start: i64, len: i64, kind: LockKind, wait: LockWait) -> Result<Self> {
        lock_range(fd, start, len, kind, wait)?;
        Ok(Self { fd, start, len })
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn len(&self) -> i64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for AreaLock {
    fn drop(&mut self) {
        if let Err(e) = unlock_range(self.fd, self.start, self.len) {
            tracing::debug!(start = self.start, len = self.len, error = %e, "Failed to release region lock");
        }
    }
}

/// Device and inode of a locked file
pub type FileKey = (u64, u64);

static LOCAL_HELD: LazyLock<(Mutex<HashSet<FileKey>>, Condvar)> =
    LazyLock::new(|| (Mutex::new(HashSet::new()), Condvar::new()));

/// Exclusive hold on a file among the threads and tasks of this process.
///
/// Taken around every read-modify-write of a shared status record, next to
/// the `fcntl` lock that excludes other processes. Not reentrant. The hold
/// is short and never spans an `.await`.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LocalLock {
    key: FileKey,
}

impl LocalLock {
    pub fn acquire(key: FileKey) -> Self {
        let (held, freed) = &*LOCAL_HELD;
        let mut set = held.lock().unwrap_or_else(PoisonError::into_inner);
        while set.contains(&key) {
            set = freed.wait(set).unwrap_or_else(PoisonError::into_inner);
        }
        set.insert(key);
        Self { key }
    }
}

impl Drop for LocalLock {
    fn drop(&mut self) {
        let (held, freed) = &*LOCAL_HELD;
        held.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
        freed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_region_lock_and_release() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(64).unwrap();
        let fd = file.as_raw_fd();

        {
            let guard = AreaLock::acquire(fd, 16, 8, LockKind::Exclusive, LockWait::Try).unwrap();
            assert_eq!(guard.start(), 16);
            assert_eq!(guard.len(), 8);
        }
        // Same process may re-lock freely after release
        let whole = AreaLock::acquire(fd, 0, 0, LockKind::Shared, LockWait::Wait).unwrap();
        assert!(whole.is_empty());
    }

    #[test]
    fn test_local_lock_excludes_other_threads() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::time::Duration;

        let key = (u64::MAX, 7);
        let inside = Arc::new(AtomicBool::new(false));
        let first = LocalLock::acquire(key);
        let waiter = {
            let inside = Arc::clone(&inside);
            std::thread::spawn(move || {
                let _second = LocalLock::acquire(key);
                inside.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!inside.load(Ordering::SeqCst));

        // Other files are not affected
        drop(LocalLock::acquire((u64::MAX, 8)));

        drop(first);
        waiter.join().unwrap();
        assert!(inside.load(Ordering::SeqCst));
    }
}
