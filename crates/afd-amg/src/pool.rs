//! Pool and message directories.
//!
//! Matched files first move into a pool directory named
//! `<pid>_<time>_<unique>_<dir-id>` (hex) below `files/pool/`, then get
//! linked into one message directory per job. Message directories live
//! in numbered buckets below `files/outgoing/<job-id>/` so no parent
//! exceeds the filesystem's link-count limit.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use afd_config::log_amg_debug;

use crate::message::MessageName;
use crate::{AmgError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolName {
    pub pid: u32,
    pub creation_time: i64,
    pub unique_number: u32,
    pub dir_id: u32,
    /// Set when the plain name was already taken
    pub disambig: Option<u8>,
}

impl fmt::Display for PoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}_{:x}_{:x}_{:x}",
            self.pid, self.creation_time, self.unique_number, self.dir_id
        )?;
        if let Some(d) = self.disambig {
            write!(f, "_{:x}", d)?;
        }
        Ok(())
    }
}

impl FromStr for PoolName {
    type Err = AmgError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bad = || AmgError::PoolName(s.to_string());
        let fields: Vec<&str> = s.split('_').collect();
        if fields.len() != 4 && fields.len() != 5 {
            return Err(bad());
        }
        let hex32 = |t: &str| u32::from_str_radix(t, 16).map_err(|_| bad());
        Ok(Self {
            pid: hex32(fields[0])?,
            creation_time: i64::from_str_radix(fields[1], 16).map_err(|_| bad())?,
            unique_number: hex32(fields[2])?,
            dir_id: hex32(fields[3])?,
            disambig: match fields.get(4) {
                Some(d) => Some(u8::from_str_radix(d, 16).map_err(|_| bad())?),
                None => None,
            },
        })
    }
}

/// Free slots left in the current bucket of one job
#[derive(Debug, Clone, Copy)]
struct Cursor {
    seq: u32,
    left: u32,
}

#[derive(Debug)]
pub struct PoolManager {
    pool_dir: PathBuf,
    outgoing_dir: PathBuf,
    max_link_count: u32,
    cursors: HashMap<u32, Cursor>,
}

impl PoolManager {
    pub fn new(pool_dir: impl Into<PathBuf>, outgoing_dir: impl Into<PathBuf>, max_link_count: u32) -> Self {
        Self {
            pool_dir: pool_dir.into(),
            outgoing_dir: outgoing_dir.into(),
            max_link_count: max_link_count.max(3),
            cursors: HashMap::new(),
        }
    }

    pub fn pool_dir(&self) -> &Path {
        &self.pool_dir
    }

    pub fn outgoing_dir(&self) -> &Path {
        &self.outgoing_dir
    }

    /// Create a fresh pool directory, disambiguating a name already in use
    pub fn create_pool_dir(&self, mut name: PoolName) -> Result<(PoolName, PathBuf)> {
        fs::create_dir_all(&self.pool_dir)?;
        for attempt in 0..=u8::MAX {
            let path = self.pool_dir.join(name.to_string());
            match fs::create_dir(&path) {
                Ok(()) => return Ok((name, path)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    name.disambig = Some(attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AmgError::PoolName(name.to_string()))
    }

    /// Create the directory of a new message for `job_id`
    pub fn create_message_dir(
        &mut self,
        job_id: u32,
        creation_time: i64,
        unique_number: u32,
        split_job_counter: u32,
    ) -> Result<(MessageName, PathBuf)> {
        let seq = self.reserve_slot(job_id)?;
        let mut name = MessageName {
            job_id,
            seq,
            creation_time,
            unique_number,
            split_job_counter,
        };
        loop {
            let path = self.outgoing_dir.join(name.to_string());
            match fs::create_dir(&path) {
                Ok(()) => return Ok((name, path)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    name.split_job_counter += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn job_parent(&self, job_id: u32) -> PathBuf {
        self.outgoing_dir.join(format!("{:x}", job_id))
    }

    /// Find a bucket with room, probing from the remembered one
    fn reserve_slot(&mut self, job_id: u32) -> Result<u32> {
        let parent = self.job_parent(job_id);
        let limit = self.max_link_count;

        if let Some(cursor) = self.cursors.get_mut(&job_id) {
            if cursor.left > 0 && parent.join(format!("{:x}", cursor.seq)).is_dir() {
                cursor.left -= 1;
                return Ok(cursor.seq);
            }
        }

        // Both the job directory and each bucket hold at most limit - 2
        // entries besides . and ..
        let capacity = limit - 2;
        let start = self.cursors.get(&job_id).map(|c| c.seq).unwrap_or(0);
        for i in 0..capacity {
            let seq = (start + i) % capacity;
            let bucket = parent.join(format!("{:x}", seq));
            let used = match fs::read_dir(&bucket) {
                Ok(entries) => entries.count() as u32,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir_all(&bucket)?;
                    0
                }
                Err(e) => return Err(e.into()),
            };
            if used < capacity {
                self.cursors.insert(
                    job_id,
                    Cursor {
                        seq,
                        left: capacity - used - 1,
                    },
                );
                log_amg_debug!("Message bucket selected", job_id = job_id, seq = seq, used = used);
                return Ok(seq);
            }
        }
        Err(AmgError::LinkLimit {
            parent: parent.display().to_string(),
            limit,
        })
    }
}
