//! Source directory listing.
//!
//! One pass over a source directory sorts its entries into files to
//! distribute (with the file group they matched), unknown files old enough
//! to delete and leftover dot files. Moving and distributing is up to the
//! caller.

use std::path::Path;

use afd_catalog::{first_matching_group, FileGroup};
use afd_catalog::dir_config::DirOptions;
use afd_status::fra::{ACCEPT_DOT_FILES, OLD_LOCKED_FILES, UNKNOWN_FILES};
use afd_status::DirectoryStatus;
use tracing::warn;
use walkdir::WalkDir;

use crate::fsops::mtime_secs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    /// Index of the first file group whose masks accept the name
    pub group: usize,
}

#[derive(Debug, Default)]
pub struct Listing {
    pub matched: Vec<Candidate>,
    /// Unmatched files past their time to live
    pub unknown: Vec<(String, u64)>,
    /// Dot files past their time to live
    pub old_locked: Vec<(String, u64)>,
    /// Matching files left for a later scan by the per-scan limits
    pub deferred: u32,
    pub files_in_dir: u32,
    pub bytes_in_dir: u64,
}

/// Limits and clocks for one pass
#[derive(Debug, Clone, Copy)]
pub struct ScanParams {
    pub now: i64,
    /// Look at unknown files this pass
    pub sweep_unknown: bool,
    /// Unknown files must also be older than this
    pub transfer_timeout: u64,
}

pub fn list_dir(
    path: &Path,
    groups: &[FileGroup],
    status: &DirectoryStatus,
    options: &DirOptions,
    params: ScanParams,
) -> std::io::Result<Listing> {
    let mut listing = Listing::default();
    let max_files = status.max_copied_files.max(1) as usize;
    let max_bytes = if status.max_copied_file_size == 0 {
        u64::MAX
    } else {
        status.max_copied_file_size
    };
    let mut bytes_taken = 0u64;

    let walker = WalkDir::new(path)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            // Vanished between listing and stat
            Err(e) if e.io_error().map(|io| io.kind()) == Some(std::io::ErrorKind::NotFound) => continue,
            Err(e) => {
                if e.depth() == 0 {
                    return Err(e.into());
                }
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let size = meta.len();
        let mtime = mtime_secs(&meta);
        let age = params.now - mtime;
        listing.files_in_dir += 1;
        listing.bytes_in_dir += size;

        if name.starts_with('.') && status.dir_flag & ACCEPT_DOT_FILES == 0 {
            if status.delete_files_flag & OLD_LOCKED_FILES != 0 {
                let ttl = options.delete_old_locked_files.unwrap_or(u64::MAX);
                if age > 0 && age as u64 > ttl {
                    listing.old_locked.push((name, size));
                }
            }
            continue;
        }

        match first_matching_group(groups, &name) {
            Some(group) => {
                if listing.matched.len() >= max_files || bytes_taken.saturating_add(size) > max_bytes {
                    // A single file larger than the byte limit still goes alone
                    if !(listing.matched.is_empty() && size > max_bytes) {
                        listing.deferred += 1;
                        continue;
                    }
                }
                bytes_taken += size;
                listing.matched.push(Candidate {
                    name,
                    size,
                    mtime,
                    group,
                });
            }
            None => {
                if params.sweep_unknown
                    && status.delete_files_flag & UNKNOWN_FILES != 0
                    && age > status.unknown_file_time
                    && age > params.transfer_timeout as i64
                {
                    listing.unknown.push((name, size));
                }
            }
        }
    }
    Ok(listing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::fs;

    fn status() -> DirectoryStatus {
        let mut s = DirectoryStatus::new(1, "in1", "/in1");
        s.max_copied_files = 100;
        s
    }

    fn params(now: i64, sweep: bool) -> ScanParams {
        ScanParams {
            now,
            sweep_unknown: sweep,
            transfer_timeout: 120,
        }
    }

    fn put(dir: &Path, name: &str, bytes: usize, mtime: i64) {
        let p = dir.join(name);
        fs::write(&p, vec![b'x'; bytes]).unwrap();
        filetime::set_file_mtime(&p, FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    #[test]
    fn test_matches_in_group_order() {
        let temp = tempfile::tempdir().unwrap();
        put(temp.path(), "a.bin", 100, 1000);
        put(temp.path(), "b.txt", 5, 1000);
        put(temp.path(), "c.dat", 1, 1000);
        put(temp.path(), ".hidden.bin", 1, 1000);
        fs::create_dir(temp.path().join(".h1")).unwrap();
        let groups = vec![
            FileGroup::new("bins", vec!["*.bin".into()]),
            FileGroup::new("texts", vec!["*.txt".into(), "*.bin".into()]),
        ];
        let listing = list_dir(temp.path(), &groups, &status(), &DirOptions::default(), params(2000, false)).unwrap();
        let got: Vec<(&str, usize)> = listing.matched.iter().map(|c| (c.name.as_str(), c.group)).collect();
        assert_eq!(got, vec![("a.bin", 0), ("b.txt", 1)]);
        assert_eq!(listing.files_in_dir, 4);
        assert!(listing.unknown.is_empty());
    }

    #[test]
    fn test_zero_masks_match_nothing() {
        let temp = tempfile::tempdir().unwrap();
        put(temp.path(), "a.bin", 1, 1000);
        let groups = vec![FileGroup::new("empty", Vec::new())];
        let listing = list_dir(temp.path(), &groups, &status(), &DirOptions::default(), params(2000, false)).unwrap();
        assert!(listing.matched.is_empty());
    }

    #[test]
    fn test_unknown_and_old_locked_files() {
        let temp = tempfile::tempdir().unwrap();
        put(temp.path(), "old.xyz", 3, 1000);
        put(temp.path(), "young.xyz", 3, 9900);
        put(temp.path(), ".part", 2, 1000);
        let mut s = status();
        s.delete_files_flag = UNKNOWN_FILES | OLD_LOCKED_FILES;
        s.unknown_file_time = 3600;
        let options = DirOptions {
            delete_old_locked_files: Some(3600),
            ..Default::default()
        };
        let groups = vec![FileGroup::new("bins", vec!["*.bin".into()])];

        let quiet = list_dir(temp.path(), &groups, &s, &options, params(10_000, false)).unwrap();
        assert!(quiet.unknown.is_empty());

        let sweep = list_dir(temp.path(), &groups, &s, &options, params(10_000, true)).unwrap();
        assert_eq!(sweep.unknown, vec![("old.xyz".to_string(), 3)]);
        assert_eq!(sweep.old_locked, vec![(".part".to_string(), 2)]);
    }

    #[test]
    fn test_per_scan_limits_defer() {
        let temp = tempfile::tempdir().unwrap();
        for i in 0..5 {
            put(temp.path(), &format!("f{}.bin", i), 10, 1000);
        }
        let groups = vec![FileGroup::new("bins", vec!["*.bin".into()])];
        let mut s = status();
        s.max_copied_files = 3;
        let listing = list_dir(temp.path(), &groups, &s, &DirOptions::default(), params(2000, false)).unwrap();
        assert_eq!(listing.matched.len(), 3);
        assert_eq!(listing.deferred, 2);

        s.max_copied_files = 100;
        s.max_copied_file_size = 25;
        let listing = list_dir(temp.path(), &groups, &s, &DirOptions::default(), params(2000, false)).unwrap();
        assert_eq!(listing.matched.len(), 2);
    }
}
