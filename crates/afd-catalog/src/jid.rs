//! Job-ID database (`fifodir/job_id.data`).
//!
//! One record per configured (directory, file masks, recipient, options)
//! tuple. The job ID is the CRC-32 over that tuple in canonical text form,
//! so re-reading an unchanged DIR_CONFIG yields the same IDs and queued
//! messages stay valid across restarts.

use std::path::PathBuf;

use afd_config::log_catalog_debug;
use afd_status::text::{cstr, set_cstr};
use afd_status::{AreaSpec, LockKind, LockWait, MappedArea, Record};

use crate::checksum::{allocate_id, id_of, Checksum, Crc32};
use crate::{CatalogError, Result};

pub const JID_VERSION: u8 = 1;
pub const JID_STEP_SIZE: usize = 20;
pub const MAX_RECIPIENT_LENGTH: usize = 512;
pub const MAX_OPTION_LENGTH: usize = 256;
pub const MAX_SEND_OPTION_LENGTH: usize = 640;
pub const MAX_HOST_ALIAS_FIELD: usize = 10;

pub const DEFAULT_PRIORITY: u8 = b'9';

/// What a job is made of before it has an ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub dir_id: u32,
    pub file_mask_id: u32,
    pub dir_config_id: u32,
    /// Recipient URL without password
    pub recipient: String,
    pub host_alias: String,
    pub priority: u8,
    pub local_options: Vec<String>,
    pub send_options: Vec<String>,
}

/// Longest text a NUL-terminated field of `size` bytes holds
pub const fn text_limit(size: usize) -> usize {
    size - 1
}

fn fits(field: &'static str, text: &str, size: usize) -> Result<()> {
    if text.len() > text_limit(size) {
        return Err(CatalogError::TooLong {
            field,
            limit: text_limit(size),
        });
    }
    Ok(())
}

impl JobDefinition {
    /// Fails when a field would not survive the fixed-size record intact.
    ///
    /// A truncated record no longer matches its own definition, so the
    /// same job would get a new ID on every build.
    pub fn check_lengths(&self) -> Result<()> {
        fits("recipient", &self.recipient, MAX_RECIPIENT_LENGTH)?;
        fits("host alias", &self.host_alias, MAX_HOST_ALIAS_FIELD)?;
        fits("local options", &self.local_options.join("\n"), MAX_OPTION_LENGTH)?;
        fits("send options", &self.send_options.join("\n"), MAX_SEND_OPTION_LENGTH)
    }

    pub fn canonical(&self) -> Vec<u8> {
        format!(
            "{:x}\0{:x}\0{}\0{}\0{}\0{}",
            self.file_mask_id,
            self.dir_id,
            self.recipient,
            self.local_options.join("\n"),
            self.send_options.join("\n"),
            self.priority as char
        )
        .into_bytes()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct JobIdRecord {
    pub job_id: u32,
    pub dir_id: u32,
    pub file_mask_id: u32,
    pub dir_config_id: u32,
    pub host_id: u32,
    pub no_of_loptions: i32,
    pub no_of_soptions: i32,
    pub priority: u8,
    pub disambig: u8,
    pub host_alias: [u8; MAX_HOST_ALIAS_FIELD],
    pub recipient: [u8; MAX_RECIPIENT_LENGTH],
    pub loptions: [u8; MAX_OPTION_LENGTH],
    pub soptions: [u8; MAX_SEND_OPTION_LENGTH],
}

const _: () = assert!(std::mem::size_of::<JobIdRecord>() == 1448);

unsafe impl Record for JobIdRecord {}

fn split_options(text: String) -> Vec<String> {
    if text.is_empty() {
        Vec::new()
    } else {
        text.split('\n').map(str::to_string).collect()
    }
}

impl JobIdRecord {
    pub fn recipient(&self) -> String {
        cstr(&self.recipient)
    }

    pub fn host_alias(&self) -> String {
        cstr(&self.host_alias)
    }

    pub fn local_options(&self) -> Vec<String> {
        split_options(cstr(&self.loptions))
    }

    pub fn send_options(&self) -> Vec<String> {
        split_options(cstr(&self.soptions))
    }

    pub fn definition(&self) -> JobDefinition {
        JobDefinition {
            dir_id: self.dir_id,
            file_mask_id: self.file_mask_id,
            dir_config_id: self.dir_config_id,
            recipient: self.recipient(),
            host_alias: self.host_alias(),
            priority: self.priority,
            local_options: self.local_options(),
            send_options: self.send_options(),
        }
    }

    /// Whether the stored ID still matches the stored content
    pub fn is_consistent(&self) -> bool {
        id_of(&Crc32, &self.definition().canonical(), self.disambig) == self.job_id
    }
}

fn spec() -> AreaSpec<'static> {
    AreaSpec::new(JID_STEP_SIZE, JobIdRecord::SIZE, JID_VERSION)
}

#[derive(Debug)]
pub struct JobIdDb {
    area: MappedArea,
}

impl JobIdDb {
    pub fn attach(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            area: MappedArea::attach(&path.into(), &spec())?,
        })
    }

    pub fn insert(&mut self, def: &JobDefinition) -> Result<u32> {
        self.insert_with(&Crc32, def)
    }

    pub fn insert_with<C: Checksum + ?Sized>(&mut self, hasher: &C, def: &JobDefinition) -> Result<u32> {
        def.check_lengths()?;
        let _lock = self.area.lock_whole(LockKind::Exclusive, LockWait::Wait)?;
        let records: Vec<JobIdRecord> = self.area.records();
        let canonical = def.canonical();
        if let Some(pos) = records
            .iter()
            .position(|r| r.definition().canonical() == canonical)
        {
            // Same job; only bookkeeping fields may have moved
            let mut existing = records[pos];
            if existing.dir_config_id != def.dir_config_id || existing.host_alias() != def.host_alias {
                existing.dir_config_id = def.dir_config_id;
                existing.host_id = crc32fast::hash(def.host_alias.as_bytes());
                set_cstr(&mut existing.host_alias, &def.host_alias);
                self.area.write(pos, &existing)?;
            }
            return Ok(existing.job_id);
        }

        let (job_id, disambig) = allocate_id(hasher, &canonical, |id| {
            records.iter().any(|r| r.job_id == id)
        })?;

        let mut record = JobIdRecord::zeroed();
        record.job_id = job_id;
        record.dir_id = def.dir_id;
        record.file_mask_id = def.file_mask_id;
        record.dir_config_id = def.dir_config_id;
        record.host_id = crc32fast::hash(def.host_alias.as_bytes());
        record.no_of_loptions = def.local_options.len() as i32;
        record.no_of_soptions = def.send_options.len() as i32;
        record.priority = def.priority;
        record.disambig = disambig;
        set_cstr(&mut record.host_alias, &def.host_alias);
        set_cstr(&mut record.recipient, &def.recipient);
        set_cstr(&mut record.loptions, &def.local_options.join("\n"));
        set_cstr(&mut record.soptions, &def.send_options.join("\n"));
        self.area.push(&record)?;
        self.area.flush()?;
        log_catalog_debug!("New job ID", job_id = job_id, dir_id = def.dir_id);
        Ok(job_id)
    }

    pub fn lookup(&self, job_id: u32) -> Result<Option<JobIdRecord>> {
        let _lock = self.area.lock_whole(LockKind::Shared, LockWait::Wait)?;
        Ok(self
            .area
            .records::<JobIdRecord>()
            .into_iter()
            .find(|r| r.job_id == job_id))
    }

    pub fn records(&self) -> Vec<JobIdRecord> {
        self.area.records()
    }

    /// Current job with the same directory, file masks and recipient.
    ///
    /// Options are deliberately not compared: a job whose options were
    /// edited still adopts files deferred under its old ID.
    pub fn find_similar(
        &self,
        dir_id: u32,
        file_mask_id: u32,
        recipient: &str,
        current: &[u32],
    ) -> Option<JobIdRecord> {
        self.records().into_iter().find(|r| {
            current.contains(&r.job_id)
                && r.dir_id == dir_id
                && r.file_mask_id == file_mask_id
                && r.recipient() == recipient
        })
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

    fn job(recipient: &str, loptions: &[&str]) -> JobDefinition {
        JobDefinition {
            dir_id: 0x10,
            file_mask_id: 0x20,
            dir_config_id: 0x30,
            recipient: recipient.into(),
            host_alias: "h".into(),
            priority: b'5',
            local_options: loptions.iter().map(|s| s.to_string()).collect(),
            send_options: vec!["lock DOT".into()],
        }
    }

    #[test]
    fn test_insert_lookup_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let mut db = JobIdDb::attach(temp.path().join("job_id.data")).unwrap();
        let def = job("ftp://u@h/out/", &["toupper"]);
        let id = db.insert(&def).unwrap();
        assert_eq!(db.insert(&def).unwrap(), id);

        let record = db.lookup(id).unwrap().unwrap();
        assert_eq!(record.definition(), def);
        assert!(record.is_consistent());
    }

    #[test]
    fn test_options_change_the_id() {
        let temp = tempfile::tempdir().unwrap();
        let mut db = JobIdDb::attach(temp.path().join("job_id.data")).unwrap();
        let a = db.insert(&job("ftp://u@h/out/", &[])).unwrap();
        let b = db.insert(&job("ftp://u@h/out/", &["toupper"])).unwrap();
        assert_ne!(a, b);
        assert!(db.lookup(a).unwrap().unwrap().local_options().is_empty());

        // Similarity ignores options
        let found = db.find_similar(0x10, 0x20, "ftp://u@h/out/", &[b]).unwrap();
        assert_eq!(found.job_id, b);
        assert!(db.find_similar(0x10, 0x21, "ftp://u@h/out/", &[a, b]).is_none());
    }

    #[test]
    fn test_over_long_options_are_refused() {
        let temp = tempfile::tempdir().unwrap();
        let mut db = JobIdDb::attach(temp.path().join("job_id.data")).unwrap();
        let long = format!("exec {}", "x".repeat(300));
        let err = db.insert(&job("ftp://u@h/out/", &[&long])).unwrap_err();
        assert!(matches!(err, CatalogError::TooLong { field: "local options", limit: 255 }));
        assert!(db.is_empty());

        // Right at the limit the record holds the whole text and keeps its ID
        let exact = format!("exec {}", "x".repeat(text_limit(MAX_OPTION_LENGTH) - 5));
        let def = job("ftp://u@h/out/", &[&exact]);
        let id = db.insert(&def).unwrap();
        assert_eq!(db.insert(&def).unwrap(), id);
        assert_eq!(db.len(), 1);
        assert!(db.lookup(id).unwrap().unwrap().is_consistent());
    }
}
