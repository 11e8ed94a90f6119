//! The dispatcher context and its event loop.
//!
//! `Fd` owns the queue, the message cache and one transport session per
//! busy job slot. Sessions run as tasks and report back through a
//! [`WorkerEvent`] channel; all queue and FSA bookkeeping happens here,
//! on the dispatcher's own task.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use afd_amg::fsops::now;
use afd_amg::{MessageName, NewMessage};
use afd_catalog::{JobIdDb, JobIdRecord, Recipient};
use afd_config::logging::Sign;
use afd_config::path::{ActionKind, JOB_ID_DATA_FILE};
use afd_config::{log_fd_debug, log_fd_info, log_fd_warn, Config, WorkDir};
use afd_ipc::FdCommand;
use afd_log::{DeleteReason, DeleteRecord, Logs};
use afd_status::fsa::{
    protocol_flag, DISCONNECT, DISPATCH_BLOCKED_MASK, ERROR_QUEUE_SET, HOST_DISABLED, MAX_NO_PARALLEL_JOBS,
    PAUSE_QUEUE, TRANSFER_ACTIVE,
};
use afd_status::text::set_cstr;
use afd_status::{Fsa, HostEntry, JobStatus, Record};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::action::{run_action, ActionPhase};
use crate::backoff::retry_due;
use crate::burst;
use crate::cache::{CacheUpdate, MessageCache};
use crate::queue::{MsgQueue, QueueEntry, QUEUED_FOR_BURST};
use crate::transport::{scheme_of, Session, SessionTarget, TransferOutcome, TransferRequest, Transport};
use crate::{FdError, Result};

const DELETED_BY: &str = "fd";

/// One job slot of one host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub host_alias: String,
    pub slot: usize,
}

impl SlotKey {
    pub fn new(host_alias: impl Into<String>, slot: usize) -> Self {
        Self {
            host_alias: host_alias.into(),
            slot,
        }
    }
}

/// A session finished one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEvent {
    pub key: SlotKey,
    pub msg_name: String,
    pub outcome: TransferOutcome,
}

/// What [`Fd::recover`] found in the queue
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Recovery {
    /// In-flight entries put back to pending
    pub requeued: usize,
    /// Entries dropped because their message directory is gone
    pub missing: usize,
    /// Message directories the queue did not know about
    pub adopted: usize,
}

struct ActiveSession {
    tx: mpsc::UnboundedSender<TransferRequest>,
    handle: JoinHandle<()>,
    scheme: String,
    pid: i32,
}

async fn session_task(
    mut session: Box<dyn Session>,
    key: SlotKey,
    first: TransferRequest,
    mut rx: mpsc::UnboundedReceiver<TransferRequest>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut request = first;
    loop {
        let outcome = session.transfer(&request).await;
        let failed = !outcome.is_success();
        let event = WorkerEvent {
            key: key.clone(),
            msg_name: request.msg_name.clone(),
            outcome,
        };
        if events.send(event).is_err() || failed {
            break;
        }
        match rx.recv().await {
            Some(next) => request = next,
            None => break,
        }
    }
    session.close().await;
}

/// Files of a message directory, sorted by name
fn list_msg_files(dir: &Path) -> Vec<(String, u64)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<(String, u64)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            meta.is_file()
                .then(|| (e.file_name().to_string_lossy().into_owned(), meta.len()))
        })
        .collect();
    files.sort();
    files
}

fn remove_msg_dir(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log_fd_warn!(
            "Failed to remove message directory",
            dir = dir.display().to_string().as_str(),
            error = e.to_string().as_str()
        ),
    }
}

pub struct Fd {
    work_dir: WorkDir,
    config: Config,
    fsa: Fsa,
    queue: MsgQueue,
    cache: MessageCache,
    logs: Logs,
    transport: Arc<dyn Transport>,
    sessions: HashMap<SlotKey, ActiveSession>,
    /// job ID -> recipient, filled from the job catalog on first use
    recipients: HashMap<u32, String>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
    pid: i32,
}

impl std::fmt::Debug for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fd")
            .field("work_dir", &self.work_dir)
            .field("queued", &self.queue.len())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl Fd {
    pub fn open(work_dir: WorkDir, config: Config, logs: Logs, transport: Arc<dyn Transport>) -> Result<Self> {
        let fsa = Fsa::attach(&work_dir)?;
        let queue = MsgQueue::attach(&work_dir)?;
        let cache = MessageCache::attach(&work_dir)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            work_dir,
            config,
            fsa,
            queue,
            cache,
            logs,
            transport,
            sessions: HashMap::new(),
            recipients: HashMap::new(),
            events_tx,
            events_rx: Some(events_rx),
            pid: std::process::id() as i32,
        })
    }

    pub fn queue(&self) -> &MsgQueue {
        &self.queue
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    pub fn fsa(&self) -> &Fsa {
        &self.fsa
    }

    pub fn fsa_mut(&mut self) -> &mut Fsa {
        &mut self.fsa
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Wait for the next worker report. Only usable before [`Fd::run`].
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events_rx.as_mut()?.recv().await
    }

    fn job(&self, job_id: u32) -> Result<Option<JobIdRecord>> {
        let path = self.work_dir.fifo(JOB_ID_DATA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        // Attached per lookup: the generator may have grown the catalog
        let jobs = JobIdDb::attach(path)?;
        Ok(jobs.lookup(job_id)?)
    }

    fn recipient(&mut self, job_id: u32) -> Result<Option<String>> {
        if let Some(r) = self.recipients.get(&job_id) {
            return Ok(Some(r.clone()));
        }
        let Some(record) = self.job(job_id)? else {
            return Ok(None);
        };
        let recipient = record.recipient();
        self.recipients.insert(job_id, recipient.clone());
        Ok(Some(recipient))
    }

    fn msg_dir(&self, msg_name: &str) -> std::path::PathBuf {
        self.work_dir.outgoing_dir().join(msg_name)
    }

    /// Log every file of a message as deleted and remove its directory
    fn discard_files(
        &self,
        msg_name: &str,
        job_id: u32,
        alias: &str,
        input: (i64, u32, u32),
        fallback_size: u64,
        reason: DeleteReason,
    ) {
        let dir = self.msg_dir(msg_name);
        let mut files = list_msg_files(&dir);
        if files.is_empty() {
            files.push((msg_name.to_string(), fallback_size));
        }
        for (name, size) in &files {
            let mut record = DeleteRecord::new(reason, name.as_str(), *size as i64)
                .job(job_id)
                .user(DELETED_BY)
                .input(input.0, input.1, input.2);
            if !alias.is_empty() {
                record = record.host(alias);
            }
            self.logs.delete(&record);
        }
        remove_msg_dir(&dir);
    }

    fn drop_new_message(&self, msg: &NewMessage, reason: DeleteReason) {
        let name = msg.msg_name();
        log_fd_warn!(
            "Message dropped",
            msg = name.as_str(),
            host = msg.host_alias.as_str(),
            reason = reason.as_str()
        );
        self.discard_files(
            &name,
            msg.job_id(),
            &msg.host_alias,
            (msg.name.creation_time, msg.name.unique_number, msg.name.split_job_counter),
            msg.bytes,
            reason,
        );
    }

    /// Take a new message from the generator. Returns whether it was queued.
    pub fn enqueue(&mut self, msg: &NewMessage, now: i64) -> Result<bool> {
        let Some(pos) = self.fsa.position(&msg.host_alias) else {
            self.drop_new_message(msg, DeleteReason::JidLookupFailure);
            return Ok(false);
        };
        let host = self.fsa.host(pos)?;
        if host.host_status & HOST_DISABLED != 0 {
            self.drop_new_message(msg, DeleteReason::HostDisabled);
            return Ok(false);
        }
        let Some(recipient) = self.recipient(msg.job_id())? else {
            self.drop_new_message(msg, DeleteReason::JidLookupFailure);
            return Ok(false);
        };

        let port = Recipient::parse(&recipient)
            .ok()
            .and_then(|r| r.port)
            .map(i32::from)
            .unwrap_or(0);
        let age_limit = if msg.age_limit > 0 {
            msg.age_limit
        } else {
            self.config.fd.default_age_limit
        };
        self.cache.upsert(&CacheUpdate {
            job_id: msg.job_id(),
            host_alias: &msg.host_alias,
            fsa_pos: pos as i32,
            protocol: protocol_flag(scheme_of(&recipient)),
            port,
            age_limit,
            priority: msg.priority,
            msg_time: msg.name.creation_time,
        })?;
        self.queue
            .insert(&QueueEntry::new(&msg.name, msg.priority, msg.files, msg.bytes))?;
        self.fsa.update(pos, |h| {
            h.jobs_queued += 1;
            h.total_file_counter += msg.files as i32;
            h.total_file_size += msg.bytes;
        })?;
        log_fd_debug!(
            "Message queued",
            msg = msg.msg_name().as_str(),
            host = msg.host_alias.as_str(),
            files = msg.files,
            at = now
        );
        Ok(true)
    }

    fn release_counters(&mut self, alias: &str, entry: &QueueEntry) -> Result<()> {
        if let Some(pos) = self.fsa.position(alias) {
            self.fsa.update(pos, |h| {
                h.jobs_queued = h.jobs_queued.saturating_sub(1);
                h.total_file_counter = (h.total_file_counter - entry.files_to_send as i32).max(0);
                h.total_file_size = h.total_file_size.saturating_sub(entry.file_size_to_send);
            })?;
        }
        Ok(())
    }

    fn host_of(&self, job_id: u32) -> String {
        self.cache
            .lookup(job_id)
            .map(|c| c.host_alias())
            .unwrap_or_default()
    }

    /// Remove queue entry `index` together with its files
    fn delete_message(&mut self, index: usize, reason: DeleteReason) -> Result<()> {
        let entry = self.queue.remove(index)?;
        let alias = self.host_of(entry.job_id);
        self.discard_files(
            &entry.msg_name(),
            entry.job_id,
            &alias,
            (entry.creation_time, entry.unique_number, entry.split_job_counter),
            entry.file_size_to_send,
            reason,
        );
        if !alias.is_empty() {
            self.release_counters(&alias, &entry)?;
        }
        Ok(())
    }

    /// Delete pending messages older than their job's age limit
    pub fn expire_aged(&mut self, now: i64) -> Result<usize> {
        let mut expired = 0;
        let mut i = 0;
        while i < self.queue.len() {
            let entry = self.queue.get(i)?;
            let limit = self.cache.lookup(entry.job_id).map(|c| c.age_limit).unwrap_or(0);
            if entry.is_pending() && limit > 0 && now - entry.creation_time > i64::from(limit) {
                log_fd_info!(
                    "Message exceeded age limit",
                    msg = entry.msg_name().as_str(),
                    age_limit = limit
                );
                self.delete_message(i, DeleteReason::AgeOutput)?;
                expired += 1;
                continue;
            }
            i += 1;
        }
        Ok(expired)
    }

    /// Delete every pending message of `alias`
    fn purge_host(&mut self, alias: &str, reason: DeleteReason) -> Result<usize> {
        let mut purged = 0;
        let mut i = 0;
        while i < self.queue.len() {
            let entry = self.queue.get(i)?;
            if entry.is_pending() && self.host_of(entry.job_id) == alias {
                self.delete_message(i, reason)?;
                purged += 1;
                continue;
            }
            i += 1;
        }
        Ok(purged)
    }

    /// Re-derive the queued counters of every host from the queue
    fn recount_hosts(&mut self) -> Result<()> {
        let mut totals: HashMap<String, (u32, i32, u64)> = HashMap::new();
        for entry in self.queue.entries() {
            let alias = self.host_of(entry.job_id);
            if alias.is_empty() {
                continue;
            }
            let t = totals.entry(alias).or_default();
            t.0 += 1;
            t.1 += entry.files_to_send as i32;
            t.2 += entry.file_size_to_send;
        }
        for pos in 0..self.fsa.len() {
            let alias = self.fsa.host(pos)?.alias();
            let (jobs, files, bytes) = totals.get(&alias).copied().unwrap_or_default();
            self.fsa.update(pos, |h| {
                h.jobs_queued = jobs;
                h.total_file_counter = files;
                h.total_file_size = bytes;
            })?;
        }
        Ok(())
    }

    /// Follow a reordered FSA; messages of hosts that are gone are deleted
    fn refresh_cache(&mut self) -> Result<()> {
        let purged = self.cache.refresh(&self.fsa)?;
        if !purged.is_empty() {
            let mut i = 0;
            while i < self.queue.len() {
                let entry = self.queue.get(i)?;
                if entry.is_pending() && purged.contains(&entry.job_id) {
                    self.delete_message(i, DeleteReason::JidLookupFailure)?;
                    continue;
                }
                i += 1;
            }
            for job_id in &purged {
                self.recipients.remove(job_id);
            }
        }
        self.prune_cache()?;
        self.recount_hosts()
    }

    /// Drop cache entries and recipients of jobs no queued message uses
    pub fn prune_cache(&mut self) -> Result<usize> {
        let in_use: HashSet<u32> = self.queue.entries().iter().map(|e| e.job_id).collect();
        let dropped = self.cache.retain_jobs(&in_use)?;
        self.recipients.retain(|job_id, _| in_use.contains(job_id));
        if dropped > 0 {
            log_fd_debug!("Pruned message cache", dropped = dropped, kept = self.cache.len());
        }
        Ok(dropped)
    }

    /// Bring queue, cache and FSA in line after a start.
    ///
    /// In-flight entries go back to pending, entries whose directory is
    /// gone are dropped and message directories nobody queued are adopted.
    pub fn recover(&mut self, now: i64) -> Result<Recovery> {
        let mut recovery = Recovery::default();

        for pos in 0..self.fsa.len() {
            self.fsa.update(pos, |h| {
                h.active_transfers = 0;
                h.job_status = [JobStatus::zeroed(); MAX_NO_PARALLEL_JOBS];
            })?;
        }

        let mut i = 0;
        while i < self.queue.len() {
            let entry = self.queue.get(i)?;
            if !self.msg_dir(&entry.msg_name()).is_dir() {
                self.queue.remove(i)?;
                let record = DeleteRecord::new(
                    DeleteReason::MissingMessage,
                    entry.msg_name(),
                    entry.file_size_to_send as i64,
                )
                .job(entry.job_id)
                .user(DELETED_BY)
                .input(entry.creation_time, entry.unique_number, entry.split_job_counter);
                self.logs.delete(&record);
                recovery.missing += 1;
                continue;
            }
            if entry.pid != 0 {
                self.queue.update(i, |e| {
                    e.pid = 0;
                    e.connect_pos = -1;
                    e.special_flag &= !QUEUED_FOR_BURST;
                })?;
                recovery.requeued += 1;
            }
            i += 1;
        }

        let known: HashSet<String> = self.queue.entries().iter().map(|e| e.msg_name()).collect();
        let outgoing = self.work_dir.outgoing_dir();
        let orphans: Vec<MessageName> = WalkDir::new(&outgoing)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .filter_map(|e| {
                let rel = e.path().strip_prefix(&outgoing).ok()?.to_string_lossy().into_owned();
                if known.contains(&rel) {
                    return None;
                }
                rel.parse::<MessageName>().ok()
            })
            .collect();
        for name in orphans {
            if self.adopt(name, now)? {
                recovery.adopted += 1;
            }
        }

        // Cache entries may point at positions of an older FSA
        self.refresh_cache()?;

        if recovery != Recovery::default() {
            log_fd_info!(
                "Queue recovered",
                requeued = recovery.requeued,
                missing = recovery.missing,
                adopted = recovery.adopted
            );
        }
        Ok(recovery)
    }

    fn adopt(&mut self, name: MessageName, now: i64) -> Result<bool> {
        let dir = self.msg_dir(&name.to_string());
        let files = list_msg_files(&dir);
        if files.is_empty() {
            remove_msg_dir(&dir);
            return Ok(false);
        }
        let Some(job) = self.job(name.job_id)? else {
            self.discard_files(
                &name.to_string(),
                name.job_id,
                "",
                (name.creation_time, name.unique_number, name.split_job_counter),
                0,
                DeleteReason::JidLookupFailure,
            );
            return Ok(false);
        };
        let age_limit = self.cache.lookup(name.job_id).map(|c| c.age_limit).unwrap_or(0);
        let msg = NewMessage {
            name,
            dir_id: job.dir_id,
            host_alias: job.host_alias(),
            priority: job.priority,
            files: files.len() as u32,
            bytes: files.iter().map(|(_, s)| s).sum(),
            age_limit,
        };
        self.enqueue(&msg, now)
    }

    fn slot_limit(&self, host: &HostEntry) -> usize {
        if host.host_status & ERROR_QUEUE_SET != 0 {
            return usize::from(self.config.fd.error_queue_probe);
        }
        (host.allowed_transfers.max(1) as usize).min(MAX_NO_PARALLEL_JOBS)
    }

    fn free_slot(&self, host: &HostEntry) -> Option<usize> {
        let alias = host.alias();
        let active = self
            .sessions
            .keys()
            .filter(|k| k.host_alias == alias)
            .count();
        if active >= self.slot_limit(host) {
            return None;
        }
        (0..MAX_NO_PARALLEL_JOBS).find(|&slot| !self.sessions.contains_key(&SlotKey::new(alias.as_str(), slot)))
    }

    fn retry_waiting(&self, entry: &QueueEntry, last_transfer: i64, host: &HostEntry, now: i64) -> bool {
        entry.retries > 0
            && !retry_due(
                now,
                last_transfer,
                host.retry_interval,
                entry.retries,
                self.config.fd.max_retry_backoff_factor,
            )
    }

    /// Start sessions for every message that may go now.
    /// Returns the number of sessions started.
    pub fn dispatch(&mut self, now: i64) -> Result<usize> {
        let mut started = 0;
        for entry in self.queue.entries() {
            if !entry.is_pending() {
                continue;
            }
            let Some(cached) = self.cache.lookup(entry.job_id) else {
                continue;
            };
            if cached.fsa_pos < 0 {
                continue;
            }
            let pos = cached.fsa_pos as usize;
            let Ok(host) = self.fsa.host(pos) else {
                continue;
            };
            if host.host_status & DISPATCH_BLOCKED_MASK != 0
                || self.retry_waiting(&entry, cached.last_transfer_time, &host, now)
            {
                continue;
            }
            let Some(slot) = self.free_slot(&host) else {
                continue;
            };
            if self.start_session(&entry, pos, &host, slot, now)? {
                started += 1;
            }
        }
        Ok(started)
    }

    fn request_for(&mut self, entry: &QueueEntry) -> Result<TransferRequest> {
        let msg_name = entry.msg_name();
        Ok(TransferRequest {
            msg_dir: self.msg_dir(&msg_name),
            msg_name,
            job_id: entry.job_id,
            recipient: self.recipient(entry.job_id)?.unwrap_or_default(),
            files: entry.files_to_send,
            bytes: entry.file_size_to_send,
        })
    }

    fn start_session(&mut self, entry: &QueueEntry, pos: usize, host: &HostEntry, slot: usize, now: i64) -> Result<bool> {
        let request = self.request_for(entry)?;
        let alias = host.alias();
        let hostname = match host.active_hostname() {
            h if h.is_empty() => alias.clone(),
            h => h,
        };
        let timeout = if host.transfer_timeout > 0 {
            host.transfer_timeout as u64
        } else {
            self.config.amg.default_transfer_timeout
        };
        let target = SessionTarget {
            host_alias: alias.clone(),
            hostname,
            scheme: scheme_of(&request.recipient).to_string(),
            transfer_timeout: timeout,
        };

        let session = match self.transport.open(&target) {
            Ok(session) => session,
            Err(e) => {
                log_fd_warn!("Failed to open session", host = alias.as_str(), error = e.to_string().as_str());
                if let Some(index) = self.queue.position(&request.msg_name) {
                    self.transfer_failed(&alias, None, pos, index, &e.to_string(), now)?;
                }
                return Ok(false);
            }
        };
        let pid = session.pid().map(|p| p as i32).unwrap_or(self.pid);
        self.mark_running(pos, slot, pid, &request, false)?;
        self.fsa.update(pos, |h| {
            h.active_transfers += 1;
            h.connections += 1;
        })?;

        let key = SlotKey::new(alias.as_str(), slot);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(session_task(session, key.clone(), request, rx, self.events_tx.clone()));
        self.sessions.insert(
            key,
            ActiveSession {
                tx,
                handle,
                scheme: target.scheme,
                pid,
            },
        );
        log_fd_debug!("Session started", host = alias.as_str(), slot = slot, pid = pid);
        Ok(true)
    }

    /// Record `request` as running in its queue entry and in the host's job slot
    fn mark_running(&mut self, pos: usize, slot: usize, pid: i32, request: &TransferRequest, burst: bool) -> Result<()> {
        if let Some(index) = self.queue.position(&request.msg_name) {
            self.queue.update(index, |e| {
                e.pid = pid;
                e.connect_pos = slot as i32;
                if burst {
                    e.special_flag |= QUEUED_FOR_BURST;
                }
            })?;
        }
        self.fsa.update(pos, |h| {
            let js = &mut h.job_status[slot];
            js.proc_id = pid;
            js.connect_status = TRANSFER_ACTIVE;
            js.job_id = request.job_id;
            js.no_of_files = request.files as i32;
            js.file_size = request.bytes;
            js.no_of_files_done = 0;
            js.file_size_done = 0;
            js.burst_count = if burst { js.burst_count.saturating_add(1) } else { 0 };
            set_cstr(&mut js.unique_name, &request.msg_name);
        })?;
        Ok(())
    }

    fn close_session(&mut self, key: &SlotKey) -> Result<()> {
        // Dropping the sender lets the task close its worker
        if self.sessions.remove(key).is_none() {
            return Ok(());
        }
        if let Some(pos) = self.fsa.position(&key.host_alias) {
            self.fsa.update(pos, |h| {
                h.active_transfers = (h.active_transfers - 1).max(0);
                let js = &mut h.job_status[key.slot];
                js.proc_id = 0;
                js.connect_status = DISCONNECT;
                js.burst_count = 0;
                set_cstr(&mut js.unique_name, "");
            })?;
        }
        Ok(())
    }

    /// Book a worker report
    pub fn handle_event(&mut self, event: WorkerEvent, now: i64) -> Result<()> {
        let WorkerEvent { key, msg_name, outcome } = event;
        let (Some(index), Some(pos)) = (self.queue.position(&msg_name), self.fsa.position(&key.host_alias)) else {
            self.close_session(&key)?;
            return Ok(());
        };
        match outcome {
            TransferOutcome::Sent { files, bytes } => {
                self.transfer_done(&key, pos, index, files, bytes, now)?;
                if !self.continue_burst(&key, pos, now)? {
                    self.close_session(&key)?;
                }
            }
            TransferOutcome::Failed { reason } => {
                self.transfer_failed(&key.host_alias, Some(key.slot), pos, index, &reason, now)?;
                self.close_session(&key)?;
            }
        }
        Ok(())
    }

    fn transfer_done(&mut self, key: &SlotKey, pos: usize, index: usize, files: u32, bytes: u64, now: i64) -> Result<()> {
        let entry = self.queue.get(index)?;
        let dir = self.msg_dir(&entry.msg_name());
        let names: Vec<String> = list_msg_files(&dir).into_iter().map(|(n, _)| n).collect();
        self.logs.transfer.host(
            Sign::Info,
            &key.host_alias,
            Some(key.slot),
            &format!("{} [{} files, {} bytes] #{:x}", names.join(" "), files, bytes, entry.job_id),
        );
        remove_msg_dir(&dir);
        self.queue.remove(index)?;

        let before = self.fsa.host(pos)?;
        self.fsa.update(pos, |h| {
            h.bytes_send += bytes;
            h.file_counter_done += files;
            h.jobs_queued = h.jobs_queued.saturating_sub(1);
            h.total_file_counter = (h.total_file_counter - entry.files_to_send as i32).max(0);
            h.total_file_size = h.total_file_size.saturating_sub(entry.file_size_to_send);
            h.last_connection = now;
            if h.error_counter > 0 {
                h.successful_retries += 1;
            }
            h.error_counter = 0;
            h.host_status &= !ERROR_QUEUE_SET;
            let js = &mut h.job_status[key.slot];
            js.no_of_files_done = files as i32;
            js.file_size_done = bytes;
        })?;
        if let Some(c) = self.cache.find(entry.job_id) {
            self.cache.update(c, |c| c.last_transfer_time = now)?;
        }
        if before.error_counter > 0 {
            self.host_recovered(&before);
        }
        log_fd_debug!(
            "Message sent",
            msg = entry.msg_name().as_str(),
            host = key.host_alias.as_str(),
            bytes = bytes
        );
        Ok(())
    }

    fn host_recovered(&self, before: &HostEntry) {
        let alias = before.alias();
        if before.host_status & ERROR_QUEUE_SET != 0 {
            self.logs.system.info(&format!("{}: transfers working again", alias));
            run_action(&self.work_dir, ActionKind::Error, &alias, ActionPhase::Stop);
        }
        run_action(&self.work_dir, ActionKind::Warn, &alias, ActionPhase::Stop);
        run_action(&self.work_dir, ActionKind::Success, &alias, ActionPhase::Start);
    }

    fn transfer_failed(
        &mut self,
        alias: &str,
        slot: Option<usize>,
        pos: usize,
        index: usize,
        reason: &str,
        now: i64,
    ) -> Result<()> {
        let entry = self.queue.update(index, |e| {
            e.retries += 1;
            e.pid = 0;
            e.connect_pos = -1;
            e.special_flag &= !QUEUED_FOR_BURST;
        })?;
        self.logs.transfer.host(
            Sign::Warn,
            alias,
            slot,
            &format!("Failed to send {}: {}", entry.msg_name(), reason),
        );
        if let Some(c) = self.cache.find(entry.job_id) {
            self.cache.update(c, |c| c.last_transfer_time = now)?;
        }
        self.note_error(pos, now)
    }

    fn note_error(&mut self, pos: usize, now: i64) -> Result<()> {
        let before = self.fsa.host(pos)?;
        let host = self.fsa.update(pos, |h| {
            h.error_counter += 1;
            h.total_errors += 1;
            h.last_retry_time = now;
            if h.auto_toggle != 0 && h.has_toggle() {
                h.toggle_pos ^= 1;
            }
        })?;
        let alias = host.alias();
        if host.auto_toggle != 0 && host.has_toggle() {
            self.logs.transfer.host(
                Sign::Info,
                &alias,
                None,
                &format!("Automatic switch to {}", host.active_hostname()),
            );
        }
        if host.error_counter == 1 {
            run_action(&self.work_dir, ActionKind::Warn, &alias, ActionPhase::Start);
        }
        if host.max_errors > 0
            && host.error_counter >= host.max_errors
            && before.host_status & ERROR_QUEUE_SET == 0
        {
            self.fsa.change_status(pos, ERROR_QUEUE_SET, 0)?;
            self.logs.system.warn(&format!(
                "{}: {} errors in a row, queue held back",
                alias, host.error_counter
            ));
            log_fd_warn!("Host entered error queue", host = alias.as_str(), errors = host.error_counter);
            run_action(&self.work_dir, ActionKind::Error, &alias, ActionPhase::Start);
        }
        Ok(())
    }

    /// Hand the next queued message of the same host and protocol to the
    /// still open session. Returns false when there is none.
    fn continue_burst(&mut self, key: &SlotKey, pos: usize, now: i64) -> Result<bool> {
        if !self.config.fd.burst_enabled {
            return Ok(false);
        }
        let Some((tx, scheme, pid)) = self
            .sessions
            .get(key)
            .map(|s| (s.tx.clone(), s.scheme.clone(), s.pid))
        else {
            return Ok(false);
        };
        let host = self.fsa.host(pos)?;
        if host.host_status & (DISPATCH_BLOCKED_MASK | ERROR_QUEUE_SET) != 0 {
            return Ok(false);
        }
        for entry in self.queue.entries() {
            if !entry.is_pending() {
                continue;
            }
            let Some(cached) = self.cache.lookup(entry.job_id) else {
                continue;
            };
            if cached.fsa_pos != pos as i32
                || self.retry_waiting(&entry, cached.last_transfer_time, &host, now)
            {
                continue;
            }
            let request = self.request_for(&entry)?;
            if scheme_of(&request.recipient) != scheme {
                continue;
            }
            if tx.send(request.clone()).is_err() {
                return Ok(false);
            }
            self.mark_running(pos, key.slot, pid, &request, true)?;
            burst::record_burst();
            log_fd_debug!(
                "Burst",
                host = key.host_alias.as_str(),
                slot = key.slot,
                msg = request.msg_name.as_str()
            );
            return Ok(true);
        }
        burst::record_miss();
        Ok(false)
    }

    fn host_pos(&self, pos: i32) -> Option<usize> {
        usize::try_from(pos).ok().filter(|&p| p < self.fsa.len())
    }

    /// Apply a command from `fd.cmd`. Returns true on shutdown.
    pub fn handle_command(&mut self, cmd: FdCommand, now: i64) -> Result<bool> {
        let target = match cmd {
            FdCommand::Shutdown => return Ok(true),
            FdCommand::CheckFsa => {
                if self.fsa.reattach_if_stale()? {
                    self.refresh_cache()?;
                    log_fd_info!("Re-attached FSA", hosts = self.fsa.len());
                } else {
                    self.prune_cache()?;
                }
                return Ok(false);
            }
            FdCommand::Retry(p)
            | FdCommand::PauseQueue(p)
            | FdCommand::ResumeQueue(p)
            | FdCommand::DisableHost(p)
            | FdCommand::EnableHost(p) => p,
        };
        // Positions refer to the current generation
        if self.fsa.reattach_if_stale()? {
            self.refresh_cache()?;
        }
        let Some(pos) = self.host_pos(target) else {
            log_fd_warn!("Command for unknown host position", pos = target);
            return Ok(false);
        };
        let alias = self.fsa.host(pos)?.alias();
        match cmd {
            FdCommand::Retry(_) => {
                self.cache.update_host(&alias, |c| c.last_transfer_time = 0)?;
                self.fsa.change_status(pos, 0, ERROR_QUEUE_SET)?;
                self.logs.event.info(&format!("{}: retry", alias));
                self.dispatch(now)?;
            }
            FdCommand::PauseQueue(_) => {
                self.fsa.change_status(pos, PAUSE_QUEUE, 0)?;
                self.logs.event.info(&format!("{}: queue paused", alias));
            }
            FdCommand::ResumeQueue(_) => {
                self.fsa.change_status(pos, 0, PAUSE_QUEUE)?;
                self.logs.event.info(&format!("{}: queue resumed", alias));
                self.dispatch(now)?;
            }
            FdCommand::DisableHost(_) => {
                self.fsa.change_status(pos, HOST_DISABLED, 0)?;
                let purged = self.purge_host(&alias, DeleteReason::HostDisabled)?;
                self.logs
                    .event
                    .info(&format!("{}: host disabled, {} messages deleted", alias, purged));
            }
            FdCommand::EnableHost(_) => {
                self.fsa.change_status(pos, 0, HOST_DISABLED)?;
                self.logs.event.info(&format!("{}: host enabled", alias));
            }
            FdCommand::Shutdown | FdCommand::CheckFsa => {}
        }
        Ok(false)
    }

    /// One pass: follow the FSA, expire old messages, start what may go
    pub fn tick(&mut self, now: i64) -> Result<usize> {
        if self.fsa.reattach_if_stale()? {
            self.refresh_cache()?;
        }
        self.expire_aged(now)?;
        self.dispatch(now)
    }

    /// End every session and put their messages back to pending
    fn stop_sessions(&mut self) -> Result<()> {
        for (_, session) in self.sessions.drain() {
            session.handle.abort();
        }
        for i in 0..self.queue.len() {
            if self.queue.get(i)?.pid != 0 {
                self.queue.update(i, |e| {
                    e.pid = 0;
                    e.connect_pos = -1;
                    e.special_flag &= !QUEUED_FOR_BURST;
                })?;
            }
        }
        for pos in 0..self.fsa.len() {
            self.fsa.update(pos, |h| {
                h.active_transfers = 0;
                h.job_status = [JobStatus::zeroed(); MAX_NO_PARALLEL_JOBS];
            })?;
        }
        Ok(())
    }

    pub async fn run(
        mut self,
        mut messages: mpsc::UnboundedReceiver<NewMessage>,
        mut commands: mpsc::Receiver<FdCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut events = self.events_rx.take().ok_or(FdError::AlreadyRunning)?;
        self.recover(now())?;
        log_fd_info!("Dispatcher running", queued = self.queue.len(), pid = self.pid);

        let mut tick = tokio::time::interval(Duration::from_millis(self.config.fd.tick_ms.max(10)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.tick(now()) {
                        log_fd_warn!("Dispatcher tick failed", error = e.to_string().as_str());
                    }
                }
                Some(msg) = messages.recv() => {
                    let t = now();
                    match self.enqueue(&msg, t) {
                        Ok(true) => {
                            if let Err(e) = self.dispatch(t) {
                                log_fd_warn!("Dispatch failed", error = e.to_string().as_str());
                            }
                        }
                        Ok(false) => {}
                        Err(e) => log_fd_warn!(
                            "Failed to queue message",
                            msg = msg.msg_name().as_str(),
                            error = e.to_string().as_str()
                        ),
                    }
                }
                Some(event) = events.recv() => {
                    if let Err(e) = self.handle_event(event, now()) {
                        log_fd_warn!("Failed to book worker report", error = e.to_string().as_str());
                    }
                }
                cmd = commands.recv() => match cmd {
                    Some(cmd) => match self.handle_command(cmd, now()) {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(e) => log_fd_warn!("Command failed", error = e.to_string().as_str()),
                    },
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        self.stop_sessions()?;
        self.queue.flush()?;
        self.cache.flush()?;
        self.fsa.flush()?;
        log_fd_info!("Dispatcher stopped", queued = self.queue.len());
        Ok(())
    }
}
