//! FRA: the file retrieve area, one [`DirectoryStatus`] per source directory.
//!
//! Besides static directory settings the FRA carries the hot per-directory
//! queue counters. Those are only ever changed through
//! [`Fra::adjust_queue_counters`], which holds a region lock on exactly the
//! counter fields.

use std::mem::offset_of;

use afd_config::path::FRA_ID_FILE;
use afd_config::WorkDir;
use tracing::{debug, warn};

use crate::area::{AreaSpec, MappedArea, Record};
use crate::idfile::{read_id, write_id};
use crate::lock::{LockKind, LockWait};
use crate::text::{cstr, set_cstr};
use crate::Result;

pub const CURRENT_FRA_VERSION: u8 = 1;
pub const FRA_STEP_SIZE: usize = 20;

pub const MAX_DIR_ALIAS_LENGTH: usize = 20;

// dir_flag bits
pub const DIR_DISABLED: u32 = 0x0001;
pub const ACCEPT_DOT_FILES: u32 = 0x0002;
pub const DONT_GET_DIR_LIST: u32 = 0x0004;
pub const INOTIFY_ENABLED: u32 = 0x0008;
pub const IS_TIME_DIR: u32 = 0x0010;

// delete_files_flag bits
pub const UNKNOWN_FILES: u8 = 0x01;
pub const QUEUED_FILES: u8 = 0x02;
pub const OLD_LOCKED_FILES: u8 = 0x04;

// dir_status values
pub const NORMAL_STATUS: u32 = 0;
pub const DIRECTORY_ACTIVE: u32 = 1;
pub const DIR_ERROR_SET: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryStatus {
    pub dir_alias: [u8; 24],
    pub host_alias: [u8; 16],
    pub url: [u8; 256],
    pub dir_id: u32,
    /// Index into the FSA for retrieve directories, -1 for local ones
    pub fsa_pos: i32,
    pub files_queued: u32,
    pub files_in_dir: u32,
    pub bytes_in_queue: u64,
    pub bytes_in_dir: u64,
    pub dir_flag: u32,
    pub dir_status: u32,
    pub max_copied_files: u32,
    pub dup_check_flag: u32,
    pub max_copied_file_size: u64,
    /// Seconds before an unmatched file may be deleted, 0 = never
    pub unknown_file_time: i64,
    pub dup_check_timeout: i64,
    pub last_retrieval: i64,
    pub rescan_time: i32,
    pub delete_files_flag: u8,
    pub priority: u8,
    pub _pad: [u8; 2],
}

const _: () = assert!(std::mem::size_of::<DirectoryStatus>() == 384);

unsafe impl Record for DirectoryStatus {}

impl DirectoryStatus {
    pub fn new(dir_id: u32, alias: &str, url: &str) -> Self {
        let mut entry = DirectoryStatus::zeroed();
        entry.dir_id = dir_id;
        entry.fsa_pos = -1;
        entry.priority = b'9';
        set_cstr(&mut entry.dir_alias, alias);
        set_cstr(&mut entry.url, url);
        entry
    }

    pub fn alias(&self) -> String {
        cstr(&self.dir_alias)
    }

    pub fn host_alias(&self) -> String {
        cstr(&self.host_alias)
    }

    pub fn set_host_alias(&mut self, alias: &str) {
        set_cstr(&mut self.host_alias, alias);
    }

    pub fn url(&self) -> String {
        cstr(&self.url)
    }

    pub fn is_disabled(&self) -> bool {
        self.dir_flag & DIR_DISABLED != 0
    }

    /// Replace the configured fields, keep counters and runtime status
    pub fn apply_config(&mut self, cfg: &DirectoryStatus) {
        let (queued, in_dir, bq, bd, status, last) = (
            self.files_queued,
            self.files_in_dir,
            self.bytes_in_queue,
            self.bytes_in_dir,
            self.dir_status,
            self.last_retrieval,
        );
        *self = *cfg;
        self.files_queued = queued;
        self.files_in_dir = in_dir;
        self.bytes_in_queue = bq;
        self.bytes_in_dir = bd;
        self.dir_status = status;
        self.last_retrieval = last;
    }
}

fn fra_spec() -> AreaSpec<'static> {
    AreaSpec::new(FRA_STEP_SIZE, DirectoryStatus::SIZE, CURRENT_FRA_VERSION)
}

#[derive(Debug)]
pub struct Fra {
    work_dir: WorkDir,
    id: i32,
    area: MappedArea,
}

impl Fra {
    pub fn attach(work_dir: &WorkDir) -> Result<Self> {
        let id_file = work_dir.fifo(FRA_ID_FILE);
        let id = match read_id(&id_file)? {
            Some(id) => id,
            None => {
                write_id(&id_file, 0)?;
                0
            }
        };
        let area = MappedArea::attach(&work_dir.fra_file(id), &fra_spec())?;
        debug!(id, dirs = area.count(), "Attached FRA");
        Ok(Self {
            work_dir: work_dir.clone(),
            id,
            area,
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.area.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stale(&self) -> Result<bool> {
        if self.area.is_stale_marked() {
            return Ok(true);
        }
        Ok(read_id(&self.work_dir.fifo(FRA_ID_FILE))? != Some(self.id))
    }

    pub fn reattach_if_stale(&mut self) -> Result<bool> {
        if !self.is_stale()? {
            return Ok(false);
        }
        *self = Fra::attach(&self.work_dir)?;
        Ok(true)
    }

    pub fn dir(&self, pos: usize) -> Result<DirectoryStatus> {
        self.area.read(pos)
    }

    pub fn dirs(&self) -> Vec<DirectoryStatus> {
        self.area.records()
    }

    pub fn position_by_id(&self, dir_id: u32) -> Option<usize> {
        (0..self.len()).find(|&i| {
            self.area
                .read::<DirectoryStatus>(i)
                .map(|d| d.dir_id == dir_id)
                .unwrap_or(false)
        })
    }

    pub fn position_by_alias(&self, alias: &str) -> Option<usize> {
        (0..self.len()).find(|&i| {
            self.area
                .read::<DirectoryStatus>(i)
                .map(|d| d.alias() == alias)
                .unwrap_or(false)
        })
    }

    /// Read-modify-write one directory under a record lock
    pub fn update<F>(&mut self, pos: usize, f: F) -> Result<DirectoryStatus>
    where
        F: FnOnce(&mut DirectoryStatus),
    {
        let _local = self.area.lock_local();
        let _lock = self.area.lock_region(
            self.area.record_offset(pos),
            DirectoryStatus::SIZE,
            LockKind::Exclusive,
        )?;
        let mut dir: DirectoryStatus = self.area.read(pos)?;
        f(&mut dir);
        self.area.write(pos, &dir)?;
        Ok(dir)
    }

    /// Add (or, with negative deltas, remove) queued files and bytes.
    ///
    /// Only the `files_queued`/`bytes_in_queue` range of the record is
    /// locked. Counters never go below zero.
    pub fn adjust_queue_counters(&mut self, pos: usize, files: i64, bytes: i64) -> Result<(u32, u64)> {
        let start = offset_of!(DirectoryStatus, files_queued);
        let end = offset_of!(DirectoryStatus, bytes_in_queue) + 8;
        let _local = self.area.lock_local();
        let _lock = self.area.lock_region(
            self.area.record_offset(pos) + start,
            end - start,
            LockKind::Exclusive,
        )?;
        let dir: DirectoryStatus = self.area.read(pos)?;
        let raw_files = dir.files_queued as i64 + files;
        let new_files = raw_files.max(0);
        let new_bytes = (dir.bytes_in_queue as i128 + bytes as i128).max(0);
        if raw_files < 0 {
            warn!(
                dir = dir.alias().as_str(),
                files_queued = dir.files_queued,
                delta = files,
                "files_queued would go negative, clamped"
            );
        }
        let files_queued = new_files.min(u32::MAX as i64) as u32;
        let bytes_in_queue = new_bytes.min(u64::MAX as i128) as u64;

        // Write back only the locked range
        let record = self.area.record_bytes_mut(pos)?;
        let bq = offset_of!(DirectoryStatus, bytes_in_queue);
        record[start..start + 4].copy_from_slice(&files_queued.to_ne_bytes());
        record[bq..bq + 8].copy_from_slice(&bytes_in_queue.to_ne_bytes());
        Ok((files_queued, bytes_in_queue))
    }

    /// Rewrite every `fsa_pos` with the position of the record's host alias
    pub fn remap_hosts<F>(&mut self, new_pos: F) -> Result<()>
    where
        F: Fn(&str) -> Option<usize>,
    {
        let _local = self.area.lock_local();
        let _lock = self.area.lock_whole(LockKind::Exclusive, LockWait::Wait)?;
        for i in 0..self.len() {
            let mut dir: DirectoryStatus = self.area.read(i)?;
            let alias = dir.host_alias();
            if alias.is_empty() {
                continue;
            }
            dir.fsa_pos = new_pos(&alias).map(|p| p as i32).unwrap_or(-1);
            self.area.write(i, &dir)?;
        }
        self.area.flush()
    }

    /// Replace the directory list.
    ///
    /// Directories already present (same `dir_id`) keep their counters.
    /// The same order is rewritten in place; any other change swaps in a
    /// new generation the way the FSA does.
    pub fn sync(&mut self, dirs: &[DirectoryStatus]) -> Result<()> {
        let local = self.area.lock_local();
        let old: Vec<DirectoryStatus> = self.dirs();
        let merged: Vec<DirectoryStatus> = dirs
            .iter()
            .map(|cfg| match old.iter().find(|d| d.dir_id == cfg.dir_id) {
                Some(existing) => {
                    let mut d = *existing;
                    d.apply_config(cfg);
                    d
                }
                None => *cfg,
            })
            .collect();

        let same_order = old.len() == merged.len()
            && old.iter().zip(&merged).all(|(a, b)| a.dir_id == b.dir_id);

        let mut raw = vec![0u8; merged.len() * DirectoryStatus::SIZE];
        for (i, d) in merged.iter().enumerate() {
            d.write_bytes(&mut raw[i * DirectoryStatus::SIZE..]);
        }

        if same_order {
            let _lock = self.area.lock_whole(LockKind::Exclusive, LockWait::Wait)?;
            self.area.replace_all(&raw)?;
            return self.area.flush();
        }

        let id_file = self.work_dir.fifo(FRA_ID_FILE);
        let whole = self.area.lock_whole(LockKind::Exclusive, LockWait::Wait)?;
        let new_id = self.id + 1;
        let new_path = self.work_dir.fra_file(new_id);
        if new_path.exists() {
            std::fs::remove_file(&new_path)?;
        }
        let mut next = MappedArea::attach(&new_path, &fra_spec())?;
        next.replace_all(&raw)?;
        next.flush()?;

        self.area.mark_stale();
        write_id(&id_file, new_id)?;
        let old_path = self.area.path().to_path_buf();
        drop(whole);
        drop(local);
        let old_area = std::mem::replace(&mut self.area, next);
        old_area.detach()?;
        if let Err(e) = std::fs::remove_file(&old_path) {
            warn!(path = %old_path.display(), error = %e, "Failed to unlink old FRA");
        }
        self.id = new_id;
        debug!(id = new_id, dirs = merged.len(), "New FRA generation live");
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.area.flush()
    }
}
