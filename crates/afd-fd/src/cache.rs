//! Message cache (`fifodir/msg_cache`): what the dispatcher needs to know
//! about a job without going back to the job catalog.

use std::collections::HashSet;
use std::path::Path;

use afd_config::path::MSG_CACHE_FILE;
use afd_config::WorkDir;
use afd_status::text::{cstr, set_cstr};
use afd_status::{AreaSpec, Fsa, MappedArea, Record};

use crate::Result;

pub const MSG_CACHE_VERSION: u8 = 1;
pub const MSG_CACHE_STEP_SIZE: usize = 50;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    /// Creation time of the newest message of this job
    pub msg_time: i64,
    pub last_transfer_time: i64,
    pub job_id: u32,
    pub fsa_pos: i32,
    /// Seconds a message may wait, 0 = forever
    pub age_limit: u32,
    pub port: i32,
    pub host_name: [u8; 12],
    /// Protocol bit of the recipient scheme
    pub protocol: u32,
    pub in_current_fsa: u8,
    pub priority: u8,
    pub _pad: [u8; 6],
}

const _: () = assert!(std::mem::size_of::<CacheEntry>() == 56);

// SAFETY: repr(C), no padding, every bit pattern is a valid value
unsafe impl Record for CacheEntry {}

impl CacheEntry {
    pub fn host_alias(&self) -> String {
        cstr(&self.host_name)
    }
}

/// Values a new message brings into the cache
#[derive(Debug, Clone)]
pub struct CacheUpdate<'a> {
    pub job_id: u32,
    pub host_alias: &'a str,
    pub fsa_pos: i32,
    pub protocol: u32,
    pub port: i32,
    pub age_limit: u32,
    pub priority: u8,
    pub msg_time: i64,
}

#[derive(Debug)]
pub struct MessageCache {
    area: MappedArea,
}

impl MessageCache {
    pub fn attach(work_dir: &WorkDir) -> Result<Self> {
        Self::attach_path(&work_dir.fifo(MSG_CACHE_FILE))
    }

    pub fn attach_path(path: &Path) -> Result<Self> {
        let spec = AreaSpec::new(MSG_CACHE_STEP_SIZE, CacheEntry::SIZE, MSG_CACHE_VERSION);
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

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.area.records()
    }

    pub fn find(&self, job_id: u32) -> Option<usize> {
        self.entries().iter().position(|e| e.job_id == job_id)
    }

    pub fn get(&self, index: usize) -> Result<CacheEntry> {
        Ok(self.area.read(index)?)
    }

    pub fn lookup(&self, job_id: u32) -> Option<CacheEntry> {
        self.entries().into_iter().find(|e| e.job_id == job_id)
    }

    /// Insert or refresh the entry of `u.job_id`; returns its index
    pub fn upsert(&mut self, u: &CacheUpdate<'_>) -> Result<usize> {
        let apply = |e: &mut CacheEntry| {
            e.job_id = u.job_id;
            set_cstr(&mut e.host_name, u.host_alias);
            e.fsa_pos = u.fsa_pos;
            e.protocol = u.protocol;
            e.port = u.port;
            e.age_limit = u.age_limit;
            e.priority = u.priority;
            e.msg_time = e.msg_time.max(u.msg_time);
            e.in_current_fsa = 1;
        };
        match self.find(u.job_id) {
            Some(index) => {
                self.update(index, apply)?;
                Ok(index)
            }
            None => {
                let mut entry = CacheEntry::zeroed();
                apply(&mut entry);
                Ok(self.area.push(&entry)?)
            }
        }
    }

    pub fn update<F>(&mut self, index: usize, f: F) -> Result<CacheEntry>
    where
        F: FnOnce(&mut CacheEntry),
    {
        let mut entry: CacheEntry = self.area.read(index)?;
        f(&mut entry);
        self.area.write(index, &entry)?;
        Ok(entry)
    }

    /// Apply `f` to every entry of `host_alias`
    pub fn update_host<F>(&mut self, host_alias: &str, mut f: F) -> Result<usize>
    where
        F: FnMut(&mut CacheEntry),
    {
        let mut touched = 0;
        for index in 0..self.len() {
            let entry = self.get(index)?;
            if entry.host_alias() == host_alias {
                self.update(index, &mut f)?;
                touched += 1;
            }
        }
        Ok(touched)
    }

    /// Bring the cache in line with a (possibly reordered) FSA.
    ///
    /// Every entry is first marked as not current, then re-asserted with
    /// its host's new position. Entries whose host is gone are removed;
    /// their job IDs are returned.
    pub fn refresh(&mut self, fsa: &Fsa) -> Result<Vec<u32>> {
        let mut entries = self.entries();
        for e in entries.iter_mut() {
            e.in_current_fsa = 0;
        }
        for e in entries.iter_mut() {
            if let Some(pos) = fsa.position(&e.host_alias()) {
                e.fsa_pos = pos as i32;
                e.in_current_fsa = 1;
            }
        }
        let (kept, purged): (Vec<CacheEntry>, Vec<CacheEntry>) =
            entries.into_iter().partition(|e| e.in_current_fsa != 0);

        let mut bytes = vec![0u8; kept.len() * CacheEntry::SIZE];
        for (i, e) in kept.iter().enumerate() {
            e.write_bytes(&mut bytes[i * CacheEntry::SIZE..]);
        }
        self.area.replace_all(&bytes)?;
        Ok(purged.iter().map(|e| e.job_id).collect())
    }

    /// Drop entries no queued message refers to
    pub fn retain_jobs(&mut self, in_use: &HashSet<u32>) -> Result<usize> {
        let before = self.len();
        let kept: Vec<CacheEntry> = self
            .entries()
            .into_iter()
            .filter(|e| in_use.contains(&e.job_id))
            .collect();
        if kept.len() == before {
            return Ok(0);
        }
        let mut bytes = vec![0u8; kept.len() * CacheEntry::SIZE];
        for (i, e) in kept.iter().enumerate() {
            e.write_bytes(&mut bytes[i * CacheEntry::SIZE..]);
        }
        self.area.replace_all(&bytes)?;
        Ok(before - kept.len())
    }

    pub fn flush(&self) -> Result<()> {
        Ok(self.area.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn update(job_id: u32, alias: &str, pos: i32) -> CacheUpdate<'_> {
        CacheUpdate {
            job_id,
            host_alias: alias,
            fsa_pos: pos,
            protocol: 1,
            port: 21,
            age_limit: 0,
            priority: b'5',
            msg_time: 100,
        }
    }

    #[test]
    fn test_upsert_refreshes_existing() {
        let temp = tempdir().unwrap();
        let mut cache = MessageCache::attach_path(&temp.path().join("c")).unwrap();
        assert_eq!(cache.upsert(&update(1, "h1", 0)).unwrap(), 0);
        assert_eq!(cache.upsert(&update(2, "h2", 1)).unwrap(), 1);
        let mut newer = update(1, "h1", 3);
        newer.msg_time = 200;
        assert_eq!(cache.upsert(&newer).unwrap(), 0);
        let e = cache.lookup(1).unwrap();
        assert_eq!((e.fsa_pos, e.msg_time, e.host_alias()), (3, 200, "h1".to_string()));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_update_host_and_retain() {
        let temp = tempdir().unwrap();
        let mut cache = MessageCache::attach_path(&temp.path().join("c")).unwrap();
        cache.upsert(&update(1, "h1", 0)).unwrap();
        cache.upsert(&update(2, "h1", 0)).unwrap();
        cache.upsert(&update(3, "h2", 1)).unwrap();
        let n = cache.update_host("h1", |e| e.last_transfer_time = 42).unwrap();
        assert_eq!(n, 2);
        assert_eq!(cache.lookup(2).unwrap().last_transfer_time, 42);
        assert_eq!(cache.retain_jobs(&HashSet::from([1, 3])).unwrap(), 1);
        assert!(cache.find(2).is_none());
    }
}
