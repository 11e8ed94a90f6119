//! The message queue (`fifodir/msg_queue`).
//!
//! Entries are kept sorted by `msg_number`. The number folds the priority
//! into the creation time, so walking the queue front to back visits
//! higher priorities first and, within one priority, oldest first. Equal
//! numbers keep their insertion order.

use std::path::Path;

use afd_amg::MessageName;
use afd_config::path::MSG_QUEUE_FILE;
use afd_config::{WorkDir, MAX_MSG_PER_SEC};
use afd_status::text::{cstr, set_cstr};
use afd_status::{AreaSpec, MappedArea, Record};

use crate::Result;

pub const MSG_QUEUE_VERSION: u8 = 1;
pub const MSG_QUEUE_STEP_SIZE: usize = 100;

// special_flag bits
pub const RESEND_JOB: u32 = 0x01;
pub const HELPER_JOB: u32 = 0x02;
pub const FETCH_JOB: u32 = 0x04;
pub const QUEUED_FOR_BURST: u32 = 0x08;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueEntry {
    pub msg_number: f64,
    pub creation_time: i64,
    pub file_size_to_send: u64,
    pub job_id: u32,
    pub unique_number: u32,
    pub split_job_counter: u32,
    pub files_to_send: u32,
    pub retries: u32,
    /// Worker holding the message, 0 while pending
    pub pid: i32,
    /// Job slot of the host the message is transmitted in, -1 if none
    pub connect_pos: i32,
    pub special_flag: u32,
    pub msg_name: [u8; 64],
}

const _: () = assert!(std::mem::size_of::<QueueEntry>() == 120);

// SAFETY: repr(C), no padding, every bit pattern is a valid value
unsafe impl Record for QueueEntry {}

/// Sort key: priority '0' ranks before '9', then creation time, then the
/// unique and split numbers of the message
pub fn msg_number(priority: u8, name: &MessageName) -> f64 {
    let level = priority.saturating_sub(b'0').min(9) as f64 + 1.0;
    let stamp = name.creation_time as f64 * (MAX_MSG_PER_SEC as f64 + 1.0)
        + name.unique_number as f64
        + name.split_job_counter as f64 / 1000.0;
    level * stamp
}

impl QueueEntry {
    pub fn new(name: &MessageName, priority: u8, files: u32, bytes: u64) -> Self {
        let mut entry = Self::zeroed();
        entry.msg_number = msg_number(priority, name);
        entry.creation_time = name.creation_time;
        entry.file_size_to_send = bytes;
        entry.job_id = name.job_id;
        entry.unique_number = name.unique_number;
        entry.split_job_counter = name.split_job_counter;
        entry.files_to_send = files;
        entry.connect_pos = -1;
        set_cstr(&mut entry.msg_name, &name.to_string());
        entry
    }

    pub fn msg_name(&self) -> String {
        cstr(&self.msg_name)
    }

    pub fn is_pending(&self) -> bool {
        self.pid == 0
    }
}

#[derive(Debug)]
pub struct MsgQueue {
    area: MappedArea,
}

impl MsgQueue {
    pub fn attach(work_dir: &WorkDir) -> Result<Self> {
        Self::attach_path(&work_dir.fifo(MSG_QUEUE_FILE))
    }

    pub fn attach_path(path: &Path) -> Result<Self> {
        let spec = AreaSpec::new(MSG_QUEUE_STEP_SIZE, QueueEntry::SIZE, MSG_QUEUE_VERSION);
        Ok(Self {
            area: MappedArea::attach(path, &spec)?,
        })
    }

    pub fn len(&self) -> usize {
        self.area.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<QueueEntry> {
        self.area.records()
    }

    pub fn get(&self, index: usize) -> Result<QueueEntry> {
        Ok(self.area.read(index)?)
    }

    pub fn position(&self, msg_name: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.msg_name() == msg_name)
    }

    /// Insert keeping `msg_number` order; returns the new index
    pub fn insert(&mut self, entry: &QueueEntry) -> Result<usize> {
        let entries = self.entries();
        let index = entries.partition_point(|e| e.msg_number <= entry.msg_number);
        self.area.push(entry)?;
        for i in (index..entries.len()).rev() {
            self.area.write(i + 1, &entries[i])?;
        }
        self.area.write(index, entry)?;
        Ok(index)
    }

    pub fn remove(&mut self, index: usize) -> Result<QueueEntry> {
        let entry = self.get(index)?;
        self.area.remove(index)?;
        Ok(entry)
    }

    pub fn update<F>(&mut self, index: usize, f: F) -> Result<QueueEntry>
    where
        F: FnOnce(&mut QueueEntry),
    {
        let mut entry: QueueEntry = self.area.read(index)?;
        f(&mut entry);
        self.area.write(index, &entry)?;
        Ok(entry)
    }

    pub fn flush(&self) -> Result<()> {
        Ok(self.area.flush()?)
    }
}
