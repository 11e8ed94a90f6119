//! Duplicate suppression.
//!
//! One CRC table per directory or job under `files/store/crc/<id-hex>`.
//! Each table is a mapped area of [`CrcRecord`]s; a check takes the
//! whole-file lock for both the lookup and the insert, purging expired
//! records on the way.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use afd_catalog::dupcheck::{
    DC_CRC32C, DC_DELETE, DC_FILENAME_AND_SIZE, DC_FILE_CONTENT,
    DC_FILE_CONT_NAME, DC_MURMUR3, DC_NAME_NO_SUFFIX, DC_STORE, DC_TYPE_MASK, DC_WARN,
    TIMEOUT_IS_FIXED, USE_RECIPIENT_ID,
};
use afd_catalog::DupCheckSpec;
use afd_config::log_amg_debug;
use afd_status::{AreaSpec, LockKind, LockWait, MappedArea, Record};

use crate::fsops::move_file;
use crate::Result;

pub const CRC_VERSION: u8 = 1;
pub const CRC_STEP_SIZE: usize = 50;

static CRC32C: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcRecord {
    pub crc: u32,
    /// Check type and algorithm bits the value was computed with
    pub flag: u32,
    /// Expiry, epoch seconds
    pub timeout: i64,
}

const _: () = assert!(std::mem::size_of::<CrcRecord>() == 16);

unsafe impl Record for CrcRecord {}

/// What to do with a file seen before
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DupAction {
    pub delete: bool,
    pub store: bool,
    pub warn: bool,
}

impl DupAction {
    pub fn from_flags(flags: u32) -> Self {
        Self {
            delete: flags & DC_DELETE != 0,
            store: flags & DC_STORE != 0,
            warn: flags & DC_WARN != 0,
        }
    }

    /// The file leaves the distribution
    pub fn removes_file(&self) -> bool {
        self.delete || self.store
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    New,
    Duplicate(DupAction),
}

/// Drop the last `.suffix` of a name, keeping leading dots
fn strip_suffix(name: &str) -> &str {
    match name.rfind('.') {
        Some(0) | None => name,
        Some(i) => &name[..i],
    }
}

enum Digest {
    Crc32(crc32fast::Hasher),
    Crc32c(crc::Digest<'static, u32>),
    Murmur3(Vec<u8>),
}

impl Digest {
    fn new(flags: u32) -> Self {
        if flags & DC_MURMUR3 != 0 {
            Digest::Murmur3(Vec::new())
        } else if flags & DC_CRC32C != 0 {
            Digest::Crc32c(CRC32C.digest())
        } else {
            Digest::Crc32(crc32fast::Hasher::new())
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Digest::Crc32(h) => h.update(bytes),
            Digest::Crc32c(d) => d.update(bytes),
            Digest::Murmur3(buf) => buf.extend_from_slice(bytes),
        }
    }

    fn finish(self) -> io::Result<u32> {
        match self {
            Digest::Crc32(h) => Ok(h.finalize()),
            Digest::Crc32c(d) => Ok(d.finalize()),
            Digest::Murmur3(buf) => murmur3::murmur3_32(&mut io::Cursor::new(buf), 0),
        }
    }
}

/// Murmur3 has no incremental API; content is streamed into it directly
fn murmur_file(path: &Path, prefix: &[u8], suffix: &[u8]) -> io::Result<u32> {
    let file = BufReader::new(File::open(path)?);
    let mut reader = io::Cursor::new(prefix.to_vec()).chain(file).chain(io::Cursor::new(suffix.to_vec()));
    murmur3::murmur3_32(&mut reader, 0)
}

/// Checksum of a file as selected by `flags`. `prefix` is mixed in first
/// when checks are scoped to a recipient.
pub fn file_checksum(flags: u32, path: &Path, name: &str, size: u64, prefix: &[u8]) -> io::Result<u32> {
    let check = flags & DC_TYPE_MASK;
    let mut digest = Digest::new(flags);
    digest.update(prefix);
    match check {
        DC_FILE_CONTENT | DC_FILE_CONT_NAME => {
            let suffix: &[u8] = if check == DC_FILE_CONT_NAME {
                name.as_bytes()
            } else {
                &[]
            };
            if let Digest::Murmur3(_) = digest {
                return murmur_file(path, prefix, suffix);
            }
            let mut file = File::open(path)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                digest.update(&buf[..n]);
            }
            digest.update(suffix);
        }
        DC_NAME_NO_SUFFIX => digest.update(strip_suffix(name).as_bytes()),
        DC_FILENAME_AND_SIZE => {
            digest.update(name.as_bytes());
            digest.update(&size.to_ne_bytes());
        }
        _ => digest.update(name.as_bytes()),
    }
    digest.finish()
}

fn spec() -> AreaSpec<'static> {
    AreaSpec::new(CRC_STEP_SIZE, CrcRecord::SIZE, CRC_VERSION)
}

/// The CRC tables of one work directory
#[derive(Debug)]
pub struct CrcStore {
    crc_dir: PathBuf,
    store_dir: PathBuf,
    tables: HashMap<u32, MappedArea>,
}

impl CrcStore {
    pub fn new(crc_dir: impl Into<PathBuf>, store_dir: impl Into<PathBuf>) -> Self {
        Self {
            crc_dir: crc_dir.into(),
            store_dir: store_dir.into(),
            tables: HashMap::new(),
        }
    }

    pub fn table_path(&self, table_id: u32) -> PathBuf {
        self.crc_dir.join(format!("{:x}", table_id))
    }

    fn table(&mut self, table_id: u32) -> Result<&mut MappedArea> {
        match self.tables.entry(table_id) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                fs::create_dir_all(&self.crc_dir)?;
                let path = self.crc_dir.join(format!("{:x}", table_id));
                Ok(e.insert(MappedArea::attach(&path, &spec())?))
            }
        }
    }

    /// Record the file in table `table_id` and report whether it was
    /// already there.
    #[allow(clippy::too_many_arguments)]
    pub fn check(
        &mut self,
        table_id: u32,
        dc: &DupCheckSpec,
        path: &Path,
        name: &str,
        size: u64,
        recipient: &str,
        now: i64,
    ) -> Result<Verdict> {
        let check_bits = dc.flags & (DC_TYPE_MASK | DC_CRC32C | DC_MURMUR3);
        let prefix: &[u8] = if dc.flags & USE_RECIPIENT_ID != 0 {
            recipient.as_bytes()
        } else {
            &[]
        };
        let crc = file_checksum(dc.flags, path, name, size, prefix)?;

        let area = self.table(table_id)?;
        let _lock = area.lock_whole(LockKind::Exclusive, LockWait::Wait)?;
        let records: Vec<CrcRecord> = area.records();
        let mut live: Vec<CrcRecord> = records.iter().copied().filter(|r| r.timeout > now).collect();
        let purged = records.len() - live.len();

        let verdict = match live.iter_mut().find(|r| r.crc == crc && r.flag == check_bits) {
            Some(found) => {
                if dc.flags & TIMEOUT_IS_FIXED == 0 {
                    found.timeout = now + dc.timeout;
                }
                Verdict::Duplicate(DupAction::from_flags(dc.flags))
            }
            None => {
                live.push(CrcRecord {
                    crc,
                    flag: check_bits,
                    timeout: now + dc.timeout,
                });
                Verdict::New
            }
        };

        let mut bytes = vec![0u8; live.len() * CrcRecord::SIZE];
        for (i, r) in live.iter().enumerate() {
            r.write_bytes(&mut bytes[i * CrcRecord::SIZE..]);
        }
        area.replace_all(&bytes)?;
        area.flush()?;
        if purged > 0 {
            log_amg_debug!("Expired CRC records purged", table = table_id, purged = purged);
        }
        Ok(verdict)
    }

    /// Move a duplicate to `files/store/<id-hex>/`
    pub fn store_duplicate(&self, table_id: u32, path: &Path, name: &str) -> Result<PathBuf> {
        let dir = self.store_dir.join(format!("{:x}", table_id));
        fs::create_dir_all(&dir)?;
        let target = dir.join(name);
        move_file(path, &target)?;
        Ok(target)
    }

    /// Release the mapping of a table, e.g. after its job went away
    pub fn forget(&mut self, table_id: u32) {
        self.tables.remove(&table_id);
    }
}

/// Label for audit lines
pub fn check_type_name(flags: u32) -> &'static str {
    match flags & DC_TYPE_MASK {
        DC_FILE_CONTENT => "content",
        DC_FILE_CONT_NAME => "content+name",
        DC_NAME_NO_SUFFIX => "name without suffix",
        DC_FILENAME_AND_SIZE => "name+size",
        _ => "name",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afd_catalog::dupcheck::{DC_CRC32, DC_FILENAME_ONLY};

    fn setup() -> (tempfile::TempDir, CrcStore) {
        let temp = tempfile::tempdir().unwrap();
        let store = CrcStore::new(temp.path().join("store/crc"), temp.path().join("store"));
        (temp, store)
    }

    fn spec(flags: u32, timeout: i64) -> DupCheckSpec {
        DupCheckSpec { timeout, flags }
    }

    #[test]
    fn test_name_only_duplicate_within_timeout() {
        let (temp, mut store) = setup();
        let file = temp.path().join("a.bin");
        fs::write(&file, b"one").unwrap();
        let dc = spec(DC_FILENAME_ONLY | DC_CRC32 | DC_DELETE | DC_WARN, 60);

        assert_eq!(store.check(7, &dc, &file, "a.bin", 3, "", 1000).unwrap(), Verdict::New);
        fs::write(&file, b"other content").unwrap();
        let verdict = store.check(7, &dc, &file, "a.bin", 13, "", 1030).unwrap();
        assert_eq!(
            verdict,
            Verdict::Duplicate(DupAction {
                delete: true,
                store: false,
                warn: true
            })
        );
        // Expired after the (refreshed) timeout
        assert_eq!(store.check(7, &dc, &file, "a.bin", 13, "", 2000).unwrap(), Verdict::New);
    }

    #[test]
    fn test_fixed_timeout_is_not_refreshed() {
        let (temp, mut store) = setup();
        let file = temp.path().join("a");
        fs::write(&file, b"x").unwrap();
        let dc = spec(DC_FILENAME_ONLY | DC_DELETE | TIMEOUT_IS_FIXED, 60);
        assert_eq!(store.check(1, &dc, &file, "a", 1, "", 0).unwrap(), Verdict::New);
        assert!(matches!(store.check(1, &dc, &file, "a", 1, "", 50).unwrap(), Verdict::Duplicate(_)));
        assert_eq!(store.check(1, &dc, &file, "a", 1, "", 70).unwrap(), Verdict::New);
    }

    #[test]
    fn test_content_check_ignores_name() {
        let (temp, mut store) = setup();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();
        for algo in [DC_CRC32, DC_CRC32C, DC_MURMUR3] {
            let dc = spec(DC_FILE_CONTENT | algo | DC_DELETE, 60);
            let table = algo;
            assert_eq!(store.check(table, &dc, &a, "a", 10, "", 0).unwrap(), Verdict::New);
            assert!(matches!(
                store.check(table, &dc, &b, "b", 10, "", 1).unwrap(),
                Verdict::Duplicate(_)
            ));
        }
    }

    #[test]
    fn test_recipient_scope_and_suffix() {
        let (temp, mut store) = setup();
        let f = temp.path().join("f");
        fs::write(&f, b"").unwrap();
        let dc = spec(DC_NAME_NO_SUFFIX | USE_RECIPIENT_ID | DC_DELETE, 60);
        assert_eq!(store.check(2, &dc, &f, "r.txt", 0, "ftp://h1", 0).unwrap(), Verdict::New);
        assert!(matches!(
            store.check(2, &dc, &f, "r.csv", 0, "ftp://h1", 1).unwrap(),
            Verdict::Duplicate(_)
        ));
        assert_eq!(store.check(2, &dc, &f, "r.csv", 0, "ftp://h2", 2).unwrap(), Verdict::New);
    }

    #[test]
    fn test_store_duplicate_moves_file() {
        let (temp, store) = setup();
        let f = temp.path().join("dup.bin");
        fs::write(&f, b"1").unwrap();
        let target = store.store_duplicate(0xab, &f, "dup.bin").unwrap();
        assert!(!f.exists());
        assert!(target.ends_with("store/ab/dup.bin"));
    }

    #[test]
    fn test_strip_suffix() {
        assert_eq!(strip_suffix("a.tar.gz"), "a.tar");
        assert_eq!(strip_suffix(".hidden"), ".hidden");
        assert_eq!(strip_suffix("plain"), "plain");
    }
}
