//! DIR_CONFIG-ID database (`fifodir/dc_id.data`).
//!
//! Every DIR_CONFIG file the AMG has read gets an ID derived from its path,
//! so jobs can record which configuration file defined them.

use std::path::{Path, PathBuf};

use afd_config::log_catalog_debug;
use afd_status::text::{cstr, set_cstr};
use afd_status::{AreaSpec, LockKind, LockWait, MappedArea, Record};

use crate::checksum::{allocate_id, Checksum, Crc32};
use crate::Result;

pub const DCID_VERSION: u8 = 1;
pub const DCID_STEP_SIZE: usize = 5;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DirConfigIdRecord {
    pub dc_id: u32,
    pub disambig: u8,
    pub _pad: [u8; 3],
    pub dir_config_name: [u8; 1024],
}

const _: () = assert!(std::mem::size_of::<DirConfigIdRecord>() == 1032);

unsafe impl Record for DirConfigIdRecord {}

impl DirConfigIdRecord {
    pub fn name(&self) -> String {
        cstr(&self.dir_config_name)
    }
}

#[derive(Debug)]
pub struct DirConfigIdDb {
    area: MappedArea,
}

impl DirConfigIdDb {
    pub fn attach(path: impl Into<PathBuf>) -> Result<Self> {
        let spec = AreaSpec::new(DCID_STEP_SIZE, DirConfigIdRecord::SIZE, DCID_VERSION);
        Ok(Self {
            area: MappedArea::attach(&path.into(), &spec)?,
        })
    }

    pub fn insert(&mut self, dir_config: &Path) -> Result<u32> {
        self.insert_with(&Crc32, dir_config)
    }

    pub fn insert_with<C: Checksum + ?Sized>(&mut self, hasher: &C, dir_config: &Path) -> Result<u32> {
        let name = dir_config.to_string_lossy();
        let _lock = self.area.lock_whole(LockKind::Exclusive, LockWait::Wait)?;
        let records: Vec<DirConfigIdRecord> = self.area.records();
        if let Some(r) = records.iter().find(|r| r.name() == name) {
            return Ok(r.dc_id);
        }

        let (dc_id, disambig) =
            allocate_id(hasher, name.as_bytes(), |id| records.iter().any(|r| r.dc_id == id))?;
        let mut record = DirConfigIdRecord::zeroed();
        record.dc_id = dc_id;
        record.disambig = disambig;
        set_cstr(&mut record.dir_config_name, &name);
        self.area.push(&record)?;
        self.area.flush()?;
        log_catalog_debug!("New DIR_CONFIG ID", dc_id = dc_id);
        Ok(dc_id)
    }

    pub fn lookup(&self, dc_id: u32) -> Option<PathBuf> {
        self.area
            .records::<DirConfigIdRecord>()
            .into_iter()
            .find(|r| r.dc_id == dc_id)
            .map(|r| PathBuf::from(r.name()))
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

    #[test]
    fn test_same_path_same_id() {
        let temp = tempfile::tempdir().unwrap();
        let mut db = DirConfigIdDb::attach(temp.path().join("dc_id.data")).unwrap();
        let a = db.insert(Path::new("/afd/etc/DIR_CONFIG")).unwrap();
        let b = db.insert(Path::new("/afd/etc/DIR_CONFIG.extra")).unwrap();
        assert_ne!(a, b);
        assert_eq!(db.insert(Path::new("/afd/etc/DIR_CONFIG")).unwrap(), a);
        assert_eq!(db.len(), 2);
        assert_eq!(db.lookup(b), Some(PathBuf::from("/afd/etc/DIR_CONFIG.extra")));
    }
}
