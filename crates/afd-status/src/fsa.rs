//! FSA: the file transfer status area, one [`HostEntry`] per remote host.
//!
//! The live area is `fifodir/fsa_status.<id>` where `<id>` is stored in
//! `fifodir/fsa.id`. Hosts are never removed in place: a changed host list
//! is written into the next generation and swapped in (see [`Fsa::reorder`]).

use std::mem::offset_of;

use afd_config::{log_status_info, WorkDir};
use afd_config::path::FSA_ID_FILE;
use tracing::{debug, info, warn};

use crate::area::{AreaSpec, Converter, MappedArea, Record};
use crate::fra::Fra;
use crate::host_config::{HostConfigEntry, HostToggle};
use crate::idfile::{read_id, write_id};
use crate::lock::{AreaLock, LockKind, LockWait};
use crate::text::{cstr, set_cstr};
use crate::{Result, StatusError};

pub const CURRENT_FSA_VERSION: u8 = 2;
pub const FSA_STEP_SIZE: usize = 20;
pub const MAX_NO_PARALLEL_JOBS: usize = 5;

// host_status bits
pub const PAUSE_QUEUE: u32 = 0x0001;
pub const AUTO_PAUSE_QUEUE: u32 = 0x0002;
pub const DANGER_PAUSE_QUEUE: u32 = 0x0004;
pub const STOP_TRANSFER: u32 = 0x0008;
pub const HOST_DISABLED: u32 = 0x0010;
pub const ERROR_QUEUE_SET: u32 = 0x0020;
pub const HOST_ERROR_OFFLINE: u32 = 0x0040;
pub const HOST_ACTION_SUCCESS: u32 = 0x0080;

/// Status bits that divert new files into the paused directory
pub const QUEUE_PAUSED_MASK: u32 = PAUSE_QUEUE | AUTO_PAUSE_QUEUE | DANGER_PAUSE_QUEUE | ERROR_QUEUE_SET;

/// Status bits that keep the dispatcher away from a host
pub const DISPATCH_BLOCKED_MASK: u32 = PAUSE_QUEUE | AUTO_PAUSE_QUEUE | STOP_TRANSFER | HOST_DISABLED;

// protocol bits
pub const FTP_FLAG: u32 = 0x01;
pub const LOC_FLAG: u32 = 0x02;
pub const SMTP_FLAG: u32 = 0x04;
pub const SFTP_FLAG: u32 = 0x08;
pub const HTTP_FLAG: u32 = 0x10;
pub const SCP_FLAG: u32 = 0x20;
pub const EXEC_FLAG: u32 = 0x40;

/// Protocol bit for a recipient URL scheme
pub fn protocol_flag(scheme: &str) -> u32 {
    match scheme {
        "ftp" | "ftps" => FTP_FLAG,
        "file" | "loc" => LOC_FLAG,
        "mailto" | "smtp" => SMTP_FLAG,
        "sftp" => SFTP_FLAG,
        "http" | "https" => HTTP_FLAG,
        "scp" => SCP_FLAG,
        "exec" => EXEC_FLAG,
        _ => 0,
    }
}

// connect_status values of a job slot
pub const DISCONNECT: u8 = 0;
pub const CONNECTING: u8 = 1;
pub const TRANSFER_ACTIVE: u8 = 2;
pub const NOT_WORKING: u8 = 3;

/// One parallel transfer slot of a host
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatus {
    pub proc_id: i32,
    pub connect_status: u8,
    /// Messages handed to this session without a respawn
    pub burst_count: u8,
    pub _pad: [u8; 2],
    pub job_id: u32,
    pub no_of_files: i32,
    pub file_size: u64,
    pub file_size_done: u64,
    pub no_of_files_done: i32,
    pub _pad2: u32,
    pub unique_name: [u8; 48],
}

const _: () = assert!(std::mem::size_of::<JobStatus>() == 88);

unsafe impl Record for JobStatus {}

/// Host record, schema version 2
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEntry {
    pub host_alias: [u8; 9],
    /// 0 = first real hostname, 1 = second
    pub toggle_pos: u8,
    pub original_toggle_pos: u8,
    pub auto_toggle: u8,
    pub host_id: u32,
    pub real_hostname: [[u8; 48]; 2],
    pub proxy_name: [u8; 80],
    pub allowed_transfers: i32,
    pub max_errors: i32,
    pub retry_interval: i32,
    pub block_size: i32,
    pub active_transfers: i32,
    pub error_counter: i32,
    pub total_errors: u32,
    pub successful_retries: u32,
    pub protocol: u32,
    pub protocol_options: u32,
    pub host_status: u32,
    pub special_flag: u32,
    pub jobs_queued: u32,
    pub file_counter_done: u32,
    pub connections: u32,
    pub total_file_counter: i32,
    pub transfer_timeout: i64,
    pub bytes_send: u64,
    pub total_file_size: u64,
    pub last_connection: i64,
    pub last_retry_time: i64,
    pub job_status: [JobStatus; MAX_NO_PARALLEL_JOBS],
}

const _: () = assert!(std::mem::size_of::<HostEntry>() == 736);

unsafe impl Record for HostEntry {}

/// Host record, schema version 1 (no `successful_retries`, no `special_flag`)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEntryV1 {
    pub host_alias: [u8; 9],
    pub toggle_pos: u8,
    pub original_toggle_pos: u8,
    pub auto_toggle: u8,
    pub host_id: u32,
    pub real_hostname: [[u8; 48]; 2],
    pub proxy_name: [u8; 80],
    pub allowed_transfers: i32,
    pub max_errors: i32,
    pub retry_interval: i32,
    pub block_size: i32,
    pub active_transfers: i32,
    pub error_counter: i32,
    pub total_errors: u32,
    pub protocol: u32,
    pub protocol_options: u32,
    pub host_status: u32,
    pub jobs_queued: u32,
    pub file_counter_done: u32,
    pub connections: u32,
    pub total_file_counter: i32,
    pub transfer_timeout: i64,
    pub bytes_send: u64,
    pub total_file_size: u64,
    pub last_connection: i64,
    pub last_retry_time: i64,
    pub job_status: [JobStatus; MAX_NO_PARALLEL_JOBS],
}

const _: () = assert!(std::mem::size_of::<HostEntryV1>() == 728);

unsafe impl Record for HostEntryV1 {}

/// CRC-32 of the alias text
pub fn host_id(alias: &str) -> u32 {
    crc32fast::hash(alias.as_bytes())
}

impl HostEntry {
    pub fn from_config(cfg: &HostConfigEntry) -> Self {
        let mut entry = HostEntry::zeroed();
        set_cstr(&mut entry.host_alias, &cfg.alias);
        entry.host_id = host_id(&cfg.alias);
        entry.apply_config(cfg);
        entry.host_status = cfg.host_status;
        entry
    }

    /// Overwrite the configured fields, leave runtime counters alone
    pub fn apply_config(&mut self, cfg: &HostConfigEntry) {
        set_cstr(&mut self.real_hostname[0], &cfg.real_hostname[0]);
        set_cstr(&mut self.real_hostname[1], &cfg.real_hostname[1]);
        set_cstr(&mut self.proxy_name, &cfg.proxy_name);
        self.auto_toggle = (cfg.toggle == HostToggle::Auto) as u8;
        if cfg.toggle == HostToggle::None {
            self.toggle_pos = 0;
        }
        self.allowed_transfers = cfg.allowed_transfers;
        self.max_errors = cfg.max_errors;
        self.retry_interval = cfg.retry_interval;
        self.block_size = cfg.block_size;
        self.transfer_timeout = cfg.transfer_timeout;
        self.protocol_options = cfg.protocol_options;
    }

    pub fn alias(&self) -> String {
        cstr(&self.host_alias)
    }

    /// Hostname currently selected by the toggle
    pub fn active_hostname(&self) -> String {
        cstr(&self.real_hostname[(self.toggle_pos & 1) as usize])
    }

    pub fn has_toggle(&self) -> bool {
        self.real_hostname[1][0] != 0
    }

    pub fn is_queue_paused(&self) -> bool {
        self.host_status & QUEUE_PAUSED_MASK != 0
    }

    pub fn is_disabled(&self) -> bool {
        self.host_status & HOST_DISABLED != 0
    }

    /// Snapshot back into HOST_CONFIG form
    pub fn to_config(&self) -> HostConfigEntry {
        let mut cfg = HostConfigEntry::new(&self.alias());
        cfg.real_hostname = [cstr(&self.real_hostname[0]), cstr(&self.real_hostname[1])];
        cfg.toggle = if self.auto_toggle != 0 {
            HostToggle::Auto
        } else if self.has_toggle() {
            HostToggle::Manual
        } else {
            HostToggle::None
        };
        cfg.proxy_name = cstr(&self.proxy_name);
        cfg.allowed_transfers = self.allowed_transfers;
        cfg.max_errors = self.max_errors;
        cfg.retry_interval = self.retry_interval;
        cfg.block_size = self.block_size;
        cfg.transfer_timeout = self.transfer_timeout;
        cfg.protocol_options = self.protocol_options;
        cfg.host_status = self.host_status;
        cfg
    }
}

impl From<&HostEntryV1> for HostEntry {
    fn from(v1: &HostEntryV1) -> Self {
        HostEntry {
            host_alias: v1.host_alias,
            toggle_pos: v1.toggle_pos,
            original_toggle_pos: v1.original_toggle_pos,
            auto_toggle: v1.auto_toggle,
            host_id: v1.host_id,
            real_hostname: v1.real_hostname,
            proxy_name: v1.proxy_name,
            allowed_transfers: v1.allowed_transfers,
            max_errors: v1.max_errors,
            retry_interval: v1.retry_interval,
            block_size: v1.block_size,
            active_transfers: v1.active_transfers,
            error_counter: v1.error_counter,
            total_errors: v1.total_errors,
            successful_retries: 0,
            protocol: v1.protocol,
            protocol_options: v1.protocol_options,
            host_status: v1.host_status,
            special_flag: 0,
            jobs_queued: v1.jobs_queued,
            file_counter_done: v1.file_counter_done,
            connections: v1.connections,
            total_file_counter: v1.total_file_counter,
            transfer_timeout: v1.transfer_timeout,
            bytes_send: v1.bytes_send,
            total_file_size: v1.total_file_size,
            last_connection: v1.last_connection,
            last_retry_time: v1.last_retry_time,
            job_status: v1.job_status,
        }
    }
}

impl From<&HostEntry> for HostEntryV1 {
    fn from(v2: &HostEntry) -> Self {
        HostEntryV1 {
            host_alias: v2.host_alias,
            toggle_pos: v2.toggle_pos,
            original_toggle_pos: v2.original_toggle_pos,
            auto_toggle: v2.auto_toggle,
            host_id: v2.host_id,
            real_hostname: v2.real_hostname,
            proxy_name: v2.proxy_name,
            allowed_transfers: v2.allowed_transfers,
            max_errors: v2.max_errors,
            retry_interval: v2.retry_interval,
            block_size: v2.block_size,
            active_transfers: v2.active_transfers,
            error_counter: v2.error_counter,
            total_errors: v2.total_errors,
            protocol: v2.protocol,
            protocol_options: v2.protocol_options,
            host_status: v2.host_status,
            jobs_queued: v2.jobs_queued,
            file_counter_done: v2.file_counter_done,
            connections: v2.connections,
            total_file_counter: v2.total_file_counter,
            transfer_timeout: v2.transfer_timeout,
            bytes_send: v2.bytes_send,
            total_file_size: v2.total_file_size,
            last_connection: v2.last_connection,
            last_retry_time: v2.last_retry_time,
            job_status: v2.job_status,
        }
    }
}

/// FSA version 1 -> 2
pub struct FsaV1Converter;

impl Converter for FsaV1Converter {
    fn from_version(&self) -> u8 {
        1
    }

    fn to_version(&self) -> u8 {
        2
    }

    fn old_record_size(&self) -> usize {
        HostEntryV1::SIZE
    }

    fn new_record_size(&self) -> usize {
        HostEntry::SIZE
    }

    fn convert(&self, old: &[u8], count: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; count * HostEntry::SIZE];
        for i in 0..count {
            let v1 = HostEntryV1::from_bytes(&old[i * HostEntryV1::SIZE..]);
            HostEntry::from(&v1).write_bytes(&mut out[i * HostEntry::SIZE..]);
        }
        Ok(out)
    }

    fn revert(&self, new: &[u8], count: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; count * HostEntryV1::SIZE];
        for i in 0..count {
            let v2 = HostEntry::from_bytes(&new[i * HostEntry::SIZE..]);
            HostEntryV1::from(&v2).write_bytes(&mut out[i * HostEntryV1::SIZE..]);
        }
        Ok(out)
    }
}

fn fsa_spec() -> AreaSpec<'static> {
    static CONVERTERS: [&dyn Converter; 1] = [&FsaV1Converter];
    AreaSpec::new(FSA_STEP_SIZE, HostEntry::SIZE, CURRENT_FSA_VERSION).with_converters(&CONVERTERS)
}

/// Attached FSA generation
#[derive(Debug)]
pub struct Fsa {
    work_dir: WorkDir,
    id: i32,
    area: MappedArea,
}

impl Fsa {
    /// Attach the generation named in `fsa.id`, creating generation 0 if
    /// there is none yet
    pub fn attach(work_dir: &WorkDir) -> Result<Self> {
        let id_file = work_dir.fifo(FSA_ID_FILE);
        let id = match read_id(&id_file)? {
            Some(id) => id,
            None => {
                write_id(&id_file, 0)?;
                0
            }
        };
        let area = MappedArea::attach(&work_dir.fsa_file(id), &fsa_spec())?;
        debug!(id, hosts = area.count(), "Attached FSA");
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

    /// True once another process swapped in a newer generation
    pub fn is_stale(&self) -> Result<bool> {
        if self.area.is_stale_marked() {
            return Ok(true);
        }
        Ok(read_id(&self.work_dir.fifo(FSA_ID_FILE))? != Some(self.id))
    }

    /// Re-attach if stale. Returns whether the generation changed.
    pub fn reattach_if_stale(&mut self) -> Result<bool> {
        if !self.is_stale()? {
            return Ok(false);
        }
        let fresh = Fsa::attach(&self.work_dir)?;
        debug!(old = self.id, new = fresh.id, "Re-attached FSA");
        *self = fresh;
        Ok(true)
    }

    pub fn host(&self, pos: usize) -> Result<HostEntry> {
        self.area.read(pos)
    }

    pub fn hosts(&self) -> Vec<HostEntry> {
        self.area.records()
    }

    pub fn position(&self, alias: &str) -> Option<usize> {
        (0..self.len()).find(|&i| {
            self.area
                .read::<HostEntry>(i)
                .map(|h| h.alias() == alias)
                .unwrap_or(false)
        })
    }

    /// Lock one field of one host record (`field` is an `offset_of!`)
    pub fn lock_field(&self, pos: usize, field: usize, len: usize) -> Result<AreaLock> {
        self.area
            .lock_region(self.area.record_offset(pos) + field, len, LockKind::Exclusive)
    }

    /// Read-modify-write one host under a record lock.
    ///
    /// The generator and the dispatcher may share a process, so the
    /// in-process lock is held as well.
    pub fn update<F>(&mut self, pos: usize, f: F) -> Result<HostEntry>
    where
        F: FnOnce(&mut HostEntry),
    {
        let _local = self.area.lock_local();
        let _lock = self.area.lock_region(
            self.area.record_offset(pos),
            HostEntry::SIZE,
            LockKind::Exclusive,
        )?;
        let mut host: HostEntry = self.area.read(pos)?;
        f(&mut host);
        self.area.write(pos, &host)?;
        Ok(host)
    }

    /// Set and clear `host_status` bits under the field lock; returns the new status
    pub fn change_status(&mut self, pos: usize, set: u32, clear: u32) -> Result<u32> {
        let _local = self.area.lock_local();
        let field = offset_of!(HostEntry, host_status);
        let _lock = self.lock_field(pos, field, 4)?;
        let host: HostEntry = self.area.read(pos)?;
        let status = (host.host_status | set) & !clear;
        // Only the locked field is written back
        self.area.record_bytes_mut(pos)?[field..field + 4].copy_from_slice(&status.to_ne_bytes());
        Ok(status)
    }

    pub fn flush(&self) -> Result<()> {
        self.area.flush()
    }

    pub fn work_dir(&self) -> &WorkDir {
        &self.work_dir
    }

    /// Write `hosts` into the next generation and swap it in.
    ///
    /// Existing hosts keep their runtime state and move to their new
    /// position; new aliases start from their configuration. When `fra`
    /// is given, every directory's `fsa_pos` is rewritten to the new
    /// order before the old generation is marked stale. The old file is
    /// unlinked, so readers still mapping it keep a consistent view until
    /// they notice the ID change.
    pub fn reorder(&mut self, hosts: &[HostConfigEntry], fra: Option<&mut Fra>) -> Result<()> {
        let id_file = self.work_dir.fifo(FSA_ID_FILE);
        let local = self.area.lock_local();
        let whole = self.area.lock_whole(LockKind::Exclusive, LockWait::Wait)?;

        let current = read_id(&id_file)?.unwrap_or(self.id);
        if current != self.id {
            return Err(StatusError::IdChanged {
                expected: self.id,
                found: current,
            });
        }

        let new_id = self.id + 1;
        let new_path = self.work_dir.fsa_file(new_id);
        if new_path.exists() {
            std::fs::remove_file(&new_path)?;
        }
        let mut next = MappedArea::attach(&new_path, &fsa_spec())?;
        next.resize(hosts.len())?;

        let old_hosts: Vec<HostEntry> = self.area.records();
        let mut kept = 0usize;
        for (pos, cfg) in hosts.iter().enumerate() {
            let entry = match old_hosts.iter().find(|h| h.alias() == cfg.alias) {
                Some(old) => {
                    kept += 1;
                    let mut entry = *old;
                    entry.apply_config(cfg);
                    entry
                }
                None => HostEntry::from_config(cfg),
            };
            next.write(pos, &entry)?;
        }
        next.set_features(self.area.features());
        next.flush()?;

        if let Some(fra) = fra {
            fra.remap_hosts(|alias| hosts.iter().position(|h| h.alias == alias))?;
        }

        self.area.mark_stale();
        write_id(&id_file, new_id)?;

        let old_path = self.area.path().to_path_buf();
        drop(whole);
        drop(local);
        let old = std::mem::replace(&mut self.area, next);
        old.detach()?;
        if let Err(e) = std::fs::remove_file(&old_path) {
            warn!(path = %old_path.display(), error = %e, "Failed to unlink old FSA");
        }
        self.id = new_id;

        log_status_info!("FSA reordered", id = new_id, hosts = hosts.len(), kept = kept);
        info!(path = %self.area.path().display(), "New FSA generation live");
        Ok(())
    }

    /// Bring the FSA in line with a host list, swapping generations only
    /// when the set or order of aliases changed
    pub fn sync(&mut self, hosts: &[HostConfigEntry], fra: Option<&mut Fra>) -> Result<()> {
        let same_order = self.len() == hosts.len()
            && hosts
                .iter()
                .enumerate()
                .all(|(i, cfg)| self.host(i).map(|h| h.alias() == cfg.alias).unwrap_or(false));
        if !same_order {
            return self.reorder(hosts, fra);
        }
        for (pos, cfg) in hosts.iter().enumerate() {
            self.update(pos, |h| h.apply_config(cfg))?;
        }
        self.flush()
    }

    /// Current hosts in HOST_CONFIG form
    pub fn to_config(&self) -> Vec<HostConfigEntry> {
        self.hosts().iter().map(HostEntry::to_config).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afd_config::testing::TestEnvironment;

    fn hosts(aliases: &[&str]) -> Vec<HostConfigEntry> {
        aliases.iter().map(|a| HostConfigEntry::new(a)).collect()
    }

    #[test]
    fn test_record_layout() {
        assert_eq!(offset_of!(HostEntry, host_id), 12);
        assert_eq!(offset_of!(HostEntry, transfer_timeout), 256);
        assert_eq!(offset_of!(HostEntry, job_status), 296);
        assert_eq!(offset_of!(HostEntryV1, transfer_timeout), 248);
    }

    #[test]
    fn test_attach_creates_generation_zero() {
        let env = TestEnvironment::new().unwrap();
        let fsa = Fsa::attach(&env.work_dir).unwrap();
        assert_eq!(fsa.id(), 0);
        assert!(fsa.is_empty());
        assert!(env.work_dir.fsa_file(0).exists());
        assert!(!fsa.is_stale().unwrap());
    }

    #[test]
    fn test_sync_adds_hosts_and_updates_config() {
        let env = TestEnvironment::new().unwrap();
        let mut fsa = Fsa::attach(&env.work_dir).unwrap();
        fsa.sync(&hosts(&["h1", "h2"]), None).unwrap();
        assert_eq!(fsa.len(), 2);
        assert_eq!(fsa.host(1).unwrap().host_id, host_id("h2"));

        fsa.update(0, |h| h.bytes_send = 500).unwrap();
        let mut changed = hosts(&["h1", "h2"]);
        changed[0].allowed_transfers = 4;
        let id = fsa.id();
        fsa.sync(&changed, None).unwrap();
        // Same order: updated in place, no new generation
        assert_eq!(fsa.id(), id);
        let h1 = fsa.host(0).unwrap();
        assert_eq!(h1.allowed_transfers, 4);
        assert_eq!(h1.bytes_send, 500);
    }

    #[test]
    fn test_change_status_flags() {
        let env = TestEnvironment::new().unwrap();
        let mut fsa = Fsa::attach(&env.work_dir).unwrap();
        fsa.sync(&hosts(&["h1"]), None).unwrap();

        let status = fsa.change_status(0, PAUSE_QUEUE | ERROR_QUEUE_SET, 0).unwrap();
        assert_eq!(status, PAUSE_QUEUE | ERROR_QUEUE_SET);
        assert!(fsa.host(0).unwrap().is_queue_paused());
        let status = fsa.change_status(0, 0, PAUSE_QUEUE).unwrap();
        assert_eq!(status, ERROR_QUEUE_SET);
    }

    #[test]
    fn test_reorder_refuses_when_id_changed() {
        let env = TestEnvironment::new().unwrap();
        let mut a = Fsa::attach(&env.work_dir).unwrap();
        let mut b = Fsa::attach(&env.work_dir).unwrap();
        a.reorder(&hosts(&["h1"]), None).unwrap();
        let err = b.reorder(&hosts(&["h2"]), None).unwrap_err();
        assert!(matches!(err, StatusError::IdChanged { expected: 0, found: 1 }));
    }

    #[test]
    fn test_v1_area_is_converted_on_attach() {
        let env = TestEnvironment::new().unwrap();
        let wd = &env.work_dir;
        write_id(&wd.fifo(FSA_ID_FILE), 0).unwrap();

        let mut v1 = HostEntryV1::zeroed();
        set_cstr(&mut v1.host_alias, "old");
        v1.bytes_send = 4242;
        v1.host_status = PAUSE_QUEUE;
        v1.job_status[4].proc_id = 17;
        {
            let spec = AreaSpec::new(FSA_STEP_SIZE, HostEntryV1::SIZE, 1);
            let mut area = MappedArea::attach(&wd.fsa_file(0), &spec).unwrap();
            area.push(&v1).unwrap();
        }

        let fsa = Fsa::attach(wd).unwrap();
        let host = fsa.host(0).unwrap();
        assert_eq!(host.alias(), "old");
        assert_eq!(host.bytes_send, 4242);
        assert_eq!(host.host_status, PAUSE_QUEUE);
        assert_eq!(host.successful_retries, 0);
        assert_eq!(host.job_status[4].proc_id, 17);
    }

    #[test]
    fn test_converter_round_trip() {
        let mut v1 = HostEntryV1::zeroed();
        set_cstr(&mut v1.host_alias, "rt");
        v1.total_errors = 3;
        v1.last_retry_time = 99;
        let mut old = vec![0u8; HostEntryV1::SIZE];
        v1.write_bytes(&mut old);

        let conv = FsaV1Converter;
        let new = conv.convert(&old, 1).unwrap();
        assert_eq!(conv.convert(&conv.revert(&new, 1).unwrap(), 1).unwrap(), new);
        assert_eq!(conv.revert(&new, 1).unwrap(), old);
    }
}
