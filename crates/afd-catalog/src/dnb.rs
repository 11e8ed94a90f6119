//! Directory-name buffer (`fifodir/directory_names`).
//!
//! Maps directory IDs to the absolute path and the path exactly as written
//! in DIR_CONFIG. Entries are only ever added; a directory that vanished
//! from the configuration keeps its ID so pool directories created for it
//! can still be resolved after a restart.

use std::path::PathBuf;

use afd_config::log_catalog_debug;
use afd_status::text::{cstr, set_cstr};
use afd_status::{AreaSpec, LockKind, LockWait, MappedArea, Record};

use crate::checksum::{allocate_id, Checksum, Crc32};
use crate::jid::text_limit;
use crate::{CatalogError, Result};

pub const DNB_VERSION: u8 = 1;
pub const DNB_STEP_SIZE: usize = 20;
pub const MAX_PATH_LENGTH: usize = 1024;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DirNameRecord {
    pub dir_id: u32,
    pub dir_name: [u8; MAX_PATH_LENGTH],
    pub orig_dir_name: [u8; MAX_PATH_LENGTH],
    pub disambig: u8,
    pub _pad: [u8; 3],
}

const _: () = assert!(std::mem::size_of::<DirNameRecord>() == 2056);

unsafe impl Record for DirNameRecord {}

impl DirNameRecord {
    pub fn dir_name(&self) -> String {
        cstr(&self.dir_name)
    }

    pub fn orig_dir_name(&self) -> String {
        cstr(&self.orig_dir_name)
    }

    pub fn canonical(dir_name: &str, orig_dir_name: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(dir_name.len() + orig_dir_name.len() + 1);
        buf.extend_from_slice(dir_name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(orig_dir_name.as_bytes());
        buf
    }
}

fn spec() -> AreaSpec<'static> {
    AreaSpec::new(DNB_STEP_SIZE, DirNameRecord::SIZE, DNB_VERSION)
}

#[derive(Debug)]
pub struct DirNameBuffer {
    area: MappedArea,
}

impl DirNameBuffer {
    pub fn attach(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            area: MappedArea::attach(&path.into(), &spec())?,
        })
    }

    /// ID of the directory, adding it on first sight
    pub fn insert(&mut self, dir_name: &str, orig_dir_name: &str) -> Result<u32> {
        self.insert_with(&Crc32, dir_name, orig_dir_name)
    }

    pub fn insert_with<C: Checksum + ?Sized>(
        &mut self,
        hasher: &C,
        dir_name: &str,
        orig_dir_name: &str,
    ) -> Result<u32> {
        if dir_name.len().max(orig_dir_name.len()) > text_limit(MAX_PATH_LENGTH) {
            return Err(CatalogError::TooLong {
                field: "directory name",
                limit: text_limit(MAX_PATH_LENGTH),
            });
        }
        let _lock = self.area.lock_whole(LockKind::Exclusive, LockWait::Wait)?;
        let records: Vec<DirNameRecord> = self.area.records();
        if let Some(r) = records
            .iter()
            .find(|r| r.dir_name() == dir_name && r.orig_dir_name() == orig_dir_name)
        {
            return Ok(r.dir_id);
        }

        let canonical = DirNameRecord::canonical(dir_name, orig_dir_name);
        let (dir_id, disambig) =
            allocate_id(hasher, &canonical, |id| records.iter().any(|r| r.dir_id == id))?;

        let mut record = DirNameRecord::zeroed();
        record.dir_id = dir_id;
        record.disambig = disambig;
        set_cstr(&mut record.dir_name, dir_name);
        set_cstr(&mut record.orig_dir_name, orig_dir_name);
        self.area.push(&record)?;
        self.area.flush()?;
        log_catalog_debug!("New directory ID", dir_id = dir_id, disambig = disambig);
        Ok(dir_id)
    }

    pub fn lookup(&self, dir_id: u32) -> Result<Option<DirNameRecord>> {
        let _lock = self.area.lock_whole(LockKind::Shared, LockWait::Wait)?;
        Ok(self
            .area
            .records::<DirNameRecord>()
            .into_iter()
            .find(|r| r.dir_id == dir_id))
    }

    pub fn dir_name(&self, dir_id: u32) -> Result<Option<PathBuf>> {
        Ok(self.lookup(dir_id)?.map(|r| PathBuf::from(r.dir_name())))
    }

    pub fn records(&self) -> Vec<DirNameRecord> {
        self.area.records()
    }

    pub fn len(&self) -> usize {
        self.area.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::id_of;

    #[test]
    fn test_insert_is_stable() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("directory_names");
        let id = {
            let mut dnb = DirNameBuffer::attach(&path).unwrap();
            let id = dnb.insert("/data/in1", "~afd/in1").unwrap();
            assert_eq!(dnb.insert("/data/in1", "~afd/in1").unwrap(), id);
            assert_ne!(dnb.insert("/data/in2", "/data/in2").unwrap(), id);
            id
        };

        let dnb = DirNameBuffer::attach(&path).unwrap();
        assert_eq!(dnb.len(), 2);
        let record = dnb.lookup(id).unwrap().unwrap();
        assert_eq!(record.orig_dir_name(), "~afd/in1");
        assert_eq!(
            id_of(&Crc32, &DirNameRecord::canonical("/data/in1", "~afd/in1"), record.disambig),
            id
        );
        assert_eq!(dnb.dir_name(id).unwrap(), Some(PathBuf::from("/data/in1")));
        assert_eq!(dnb.dir_name(1).unwrap(), None);
    }

    #[test]
    fn test_over_long_path_is_refused() {
        let temp = tempfile::tempdir().unwrap();
        let mut dnb = DirNameBuffer::attach(temp.path().join("directory_names")).unwrap();
        let long = format!("/{}", "d".repeat(MAX_PATH_LENGTH));
        assert!(matches!(
            dnb.insert(&long, &long),
            Err(CatalogError::TooLong { field: "directory name", .. })
        ));
        assert!(dnb.is_empty());
    }
}
