//! Paused directories.
//!
//! While a host's queue is paused its files wait in `<source>/.<alias>`.
//! The FRA counters `files_queued`/`bytes_in_queue` of the source
//! directory count exactly these files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::fsops::{list_files, mtime_secs};

/// Unlinks between two looks at the clock
pub const CLOCK_CHECK_INTERVAL: usize = 21;

pub fn paused_dir(source: &Path, host_alias: &str) -> PathBuf {
    source.join(format!(".{}", host_alias))
}

/// Files waiting for `host_alias`, sorted by name
pub fn list_paused(source: &Path, host_alias: &str) -> io::Result<Vec<(String, u64)>> {
    match list_files(&paused_dir(source, host_alias)) {
        Ok(files) => Ok(files),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Removal {
    /// Deleted files as (name, size)
    pub removed: Vec<(String, u64)>,
    pub files: u64,
    pub bytes: u64,
    /// Everything is gone, including the directory itself
    pub complete: bool,
}

/// Delete a paused directory, giving up once `limit` has passed. The
/// clock is only read every [`CLOCK_CHECK_INTERVAL`] unlinks.
pub fn remove_bounded(dir: &Path, limit: Duration) -> io::Result<Removal> {
    let started = Instant::now();
    let mut removal = Removal::default();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            removal.complete = true;
            return Ok(removal);
        }
        Err(e) => return Err(e),
    };

    let mut since_check = 0;
    for entry in entries {
        let entry = entry?;
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                removal.files += 1;
                removal.bytes += size;
                removal
                    .removed
                    .push((entry.file_name().to_string_lossy().into_owned(), size));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        since_check += 1;
        if since_check == CLOCK_CHECK_INTERVAL {
            since_check = 0;
            if started.elapsed() >= limit {
                return Ok(removal);
            }
        }
    }
    match fs::remove_dir(dir) {
        Ok(()) => removal.complete = true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => removal.complete = true,
        Err(_) => {}
    }
    Ok(removal)
}

/// Delete paused files last modified more than `max_age` seconds before
/// `now`. Returns what was deleted.
pub fn expire(source: &Path, host_alias: &str, max_age: u64, now: i64) -> io::Result<Vec<(String, u64)>> {
    let dir = paused_dir(source, host_alias);
    let mut expired = Vec::new();
    for (name, size) in list_paused(source, host_alias)? {
        let path = dir.join(&name);
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if now - mtime_secs(&meta) > max_age as i64 {
            fs::remove_file(&path)?;
            expired.push((name, size));
        }
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;

    fn fill(dir: &Path, n: usize) {
        fs::create_dir_all(dir).unwrap();
        for i in 0..n {
            fs::write(dir.join(format!("f{:03}", i)), b"abcd").unwrap();
        }
    }

    #[test]
    fn test_remove_completes() {
        let temp = tempfile::tempdir().unwrap();
        let dir = paused_dir(temp.path(), "h1");
        fill(&dir, 30);
        let removal = remove_bounded(&dir, Duration::from_secs(30)).unwrap();
        assert_eq!((removal.files, removal.bytes, removal.complete), (30, 120, true));
        assert_eq!(removal.removed.len(), 30);
        assert!(!dir.exists());
    }

    #[test]
    fn test_remove_stops_at_time_limit() {
        let temp = tempfile::tempdir().unwrap();
        let dir = paused_dir(temp.path(), "h1");
        fill(&dir, 30);
        let removal = remove_bounded(&dir, Duration::ZERO).unwrap();
        assert_eq!(removal.files, CLOCK_CHECK_INTERVAL as u64);
        assert!(!removal.complete);
        assert_eq!(list_paused(temp.path(), "h1").unwrap().len(), 30 - CLOCK_CHECK_INTERVAL);
    }

    #[test]
    fn test_expire_old_files() {
        let temp = tempfile::tempdir().unwrap();
        let dir = paused_dir(temp.path(), "h1");
        fill(&dir, 2);
        filetime::set_file_mtime(dir.join("f000"), FileTime::from_unix_time(1000, 0)).unwrap();
        filetime::set_file_mtime(dir.join("f001"), FileTime::from_unix_time(5000, 0)).unwrap();
        let expired = expire(temp.path(), "h1", 3600, 5100).unwrap();
        assert_eq!(expired, vec![("f000".to_string(), 4)]);
        assert!(list_paused(temp.path(), "missing").unwrap().is_empty());
    }
}
