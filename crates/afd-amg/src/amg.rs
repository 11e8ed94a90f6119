//! The generator context and its event loop.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use afd_catalog::{first_matching_group, DupCheckSpec};
use afd_config::path::COUNTER_FILE;
use afd_config::{log_amg_debug, log_amg_error, log_amg_info, log_amg_warn, Config, WorkDir};
use afd_log::{DeleteReason, DeleteRecord, DistributionRecord, DistributionType, Logs};
use afd_status::fsa::{HOST_DISABLED, QUEUE_PAUSED_MASK};
use afd_status::{Fra, Fsa};
use tokio::sync::{mpsc, watch};

use crate::catalog::{Catalog, DirJobs, JobSpec};
use crate::counter::UniqueCounter;
use crate::dupcheck::{check_type_name, CrcStore, DupAction, Verdict};
use crate::fsops::{link_or_copy, move_file, now};
use crate::message::NewMessage;
use crate::paused::{list_paused, paused_dir, remove_bounded};
use crate::pool::{PoolManager, PoolName};
use crate::recovery::{clear_pool_dir, recover_time_dirs};
use crate::scan::{list_dir, Candidate, ScanParams};
use crate::time_job::{self, TimeJobClock};
use crate::watch::{spawn_watch_task, WatchedDir};
use crate::{options, paused, AmgError, Result};

const DELETED_BY: &str = "amg";

/// Requests the generator takes while running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmgCommand {
    RereadConfig,
    /// Scan every directory now, ignoring rescan intervals
    Rescan,
}

/// State of a host as the generator sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostMode {
    Normal,
    Paused,
    Disabled,
}

fn host_mode(status: u32) -> HostMode {
    if status & HOST_DISABLED != 0 {
        HostMode::Disabled
    } else if status & QUEUE_PAUSED_MASK != 0 {
        HostMode::Paused
    } else {
        HostMode::Normal
    }
}

/// What became of one scan's staged files
#[derive(Debug, Default)]
struct Distributed {
    created: usize,
    /// File groups no job took
    returned: Vec<usize>,
    /// Raised after everything else was handled
    fatal: Option<AmgError>,
}

pub struct Amg {
    work_dir: WorkDir,
    config: Config,
    fsa: Fsa,
    fra: Fra,
    catalog: Catalog,
    counter: UniqueCounter,
    pool: PoolManager,
    crc: CrcStore,
    clock: TimeJobClock,
    logs: Logs,
    tx: mpsc::UnboundedSender<NewMessage>,
    pid: u32,
    /// Files and bytes already unlinked by paused-directory deletes that
    /// have not finished yet, by (dir ID, host alias)
    pending_removals: HashMap<(u32, String), (u64, u64)>,
    last_scan: HashMap<u32, i64>,
    last_unknown_sweep: i64,
}

impl std::fmt::Debug for Amg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Amg")
            .field("work_dir", &self.work_dir)
            .field("dirs", &self.catalog.dirs.len())
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Amg {
    /// Attach the status areas and build the catalog
    pub fn open(work_dir: WorkDir, config: Config, logs: Logs, tx: mpsc::UnboundedSender<NewMessage>) -> Result<Self> {
        work_dir.create_layout()?;
        let mut fsa = Fsa::attach(&work_dir)?;
        let mut fra = Fra::attach(&work_dir)?;
        let catalog = Catalog::build(&work_dir, &config, &mut fsa, &mut fra, &logs)?;
        let counter = UniqueCounter::open(work_dir.fifo(COUNTER_FILE))?;
        let pool = PoolManager::new(work_dir.pool_dir(), work_dir.outgoing_dir(), config.amg.max_link_count);
        let crc = CrcStore::new(work_dir.crc_dir(), work_dir.store_dir());
        let started = now();
        Ok(Self {
            work_dir,
            config,
            fsa,
            fra,
            catalog,
            counter,
            pool,
            crc,
            clock: TimeJobClock::new(started),
            logs,
            tx,
            pid: std::process::id(),
            pending_removals: HashMap::new(),
            last_scan: HashMap::new(),
            last_unknown_sweep: started,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn fsa(&self) -> &Fsa {
        &self.fsa
    }

    pub fn fsa_mut(&mut self) -> &mut Fsa {
        &mut self.fsa
    }

    pub fn fra(&self) -> &Fra {
        &self.fra
    }

    /// Undo what a crash left in the pool and re-home deferred jobs
    pub fn recover(&mut self) -> Result<()> {
        clear_pool_dir(self.pool.pool_dir(), &self.catalog.dir_names, &self.logs)?;
        let current = self.catalog.job_ids();
        recover_time_dirs(&self.work_dir.time_dir(), &self.catalog.jobs, &current, &self.logs)?;
        Ok(())
    }

    pub fn reread_config(&mut self) -> Result<()> {
        self.fsa.reattach_if_stale()?;
        self.fra.reattach_if_stale()?;
        self.catalog = Catalog::build(&self.work_dir, &self.config, &mut self.fsa, &mut self.fra, &self.logs)?;
        let current = self.catalog.job_ids();
        recover_time_dirs(&self.work_dir.time_dir(), &self.catalog.jobs, &current, &self.logs)?;
        self.last_scan.clear();
        self.logs.system.config("Configuration reread");
        Ok(())
    }

    /// One generator tick: scan the directories that are due, follow host
    /// state changes and release time jobs. Returns the messages created.
    pub fn tick(&mut self, now: i64) -> Result<usize> {
        self.fsa.reattach_if_stale()?;
        self.fra.reattach_if_stale()?;
        let mut created = self.scan_all(now, false)?;
        self.check_hosts(now)?;
        created += self.check_time_jobs(now)?;
        Ok(created)
    }

    /// Scan directories; with `force` every directory, otherwise only
    /// those whose rescan interval passed
    pub fn scan_all(&mut self, now: i64, force: bool) -> Result<usize> {
        let sweep_unknown = force || now - self.last_unknown_sweep >= self.config.amg.unknown_file_tick as i64;
        if sweep_unknown {
            self.last_unknown_sweep = now;
        }
        let mut created = 0;
        for idx in 0..self.catalog.dirs.len() {
            let dir_id = self.catalog.dirs[idx].dir_id;
            if !force {
                let interval = self
                    .fra
                    .position_by_id(dir_id)
                    .and_then(|pos| self.fra.dir(pos).ok())
                    .map(|d| d.rescan_time.max(1) as i64)
                    .unwrap_or(self.config.amg.rescan_time as i64);
                if let Some(last) = self.last_scan.get(&dir_id) {
                    if now - last < interval {
                        continue;
                    }
                }
            }
            self.last_scan.insert(dir_id, now);
            match self.scan_dir(idx, now, sweep_unknown) {
                Ok(n) => created += n,
                Err(AmgError::ChannelClosed) => return Err(AmgError::ChannelClosed),
                Err(e) => {
                    let alias = &self.catalog.dirs[idx].alias;
                    log_amg_warn!("Directory scan failed", dir = alias.as_str(), error = e.to_string().as_str());
                    self.logs.system.warn(&format!("Failed to scan {}: {}", alias, e));
                }
            }
        }
        Ok(created)
    }

    /// Scan one directory by ID, e.g. after a watch event
    pub fn scan_dir_id(&mut self, dir_id: u32, now: i64) -> Result<usize> {
        match self.catalog.dirs.iter().position(|d| d.dir_id == dir_id) {
            Some(idx) => {
                self.last_scan.insert(dir_id, now);
                self.scan_dir(idx, now, false)
            }
            None => Ok(0),
        }
    }

    fn scan_dir(&mut self, idx: usize, now: i64, sweep_unknown: bool) -> Result<usize> {
        let dir = self.catalog.dirs[idx].clone();
        let Some(pos) = self.fra.position_by_id(dir.dir_id) else {
            return Ok(0);
        };
        let status = self.fra.dir(pos)?;
        if status.is_disabled() {
            return Ok(0);
        }
        let max_files = dir.options.max_queued_files.unwrap_or(self.config.amg.max_queued_files);
        let max_size = dir.options.max_queued_size.unwrap_or(self.config.amg.max_queued_size);
        let queue_full = (max_files > 0 && status.files_queued > max_files)
            || (max_size > 0 && status.bytes_in_queue > max_size);
        if queue_full {
            log_amg_debug!(
                "Directory held back by queued files",
                dir = dir.alias.as_str(),
                files_queued = status.files_queued,
                bytes_in_queue = status.bytes_in_queue
            );
            return Ok(0);
        }

        let params = ScanParams {
            now,
            sweep_unknown,
            transfer_timeout: self.config.amg.default_transfer_timeout,
        };
        let listing = list_dir(&dir.path, &dir.groups, &status, &dir.options, params)?;

        for (name, size, reason) in listing
            .unknown
            .iter()
            .map(|(n, s)| (n, s, DeleteReason::UnknownFile))
            .chain(listing.old_locked.iter().map(|(n, s)| (n, s, DeleteReason::OldLockedFile)))
        {
            match fs::remove_file(dir.path.join(name)) {
                Ok(()) => self.logs.delete(
                    &DeleteRecord::new(reason, name.as_str(), *size as i64)
                        .dir(dir.dir_id)
                        .user(DELETED_BY),
                ),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log_amg_warn!("Failed to delete file", file = name.as_str(), error = e.to_string().as_str()),
            }
        }
        self.fra.update(pos, |d| {
            d.files_in_dir = listing.files_in_dir;
            d.bytes_in_dir = listing.bytes_in_dir;
            d.last_retrieval = now;
        })?;

        let mut matched = Vec::with_capacity(listing.matched.len());
        if status.dup_check_flag != 0 {
            let dc = DupCheckSpec {
                timeout: status.dup_check_timeout,
                flags: status.dup_check_flag,
            };
            for c in listing.matched {
                let path = dir.path.join(&c.name);
                match self.crc.check(dir.dir_id, &dc, &path, &c.name, c.size, "", now)? {
                    Verdict::New => matched.push(c),
                    Verdict::Duplicate(action) => {
                        if !self.input_duplicate(&dir, &c, action, now)? {
                            matched.push(c);
                        }
                    }
                }
            }
        } else {
            matched = listing.matched;
        }
        if matched.is_empty() {
            return Ok(0);
        }

        let unique = self.counter.next()?;
        let (_, pool_path) = self.pool.create_pool_dir(PoolName {
            pid: self.pid,
            creation_time: now,
            unique_number: unique,
            dir_id: dir.dir_id,
            disambig: None,
        })?;
        let mut staged = Vec::with_capacity(matched.len());
        for c in matched {
            match move_file(&dir.path.join(&c.name), &pool_path.join(&c.name)) {
                Ok(()) => staged.push(c),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log_amg_warn!("Failed to move file into pool", file = c.name.as_str(), error = e.to_string().as_str()),
            }
        }

        let outcome = self.distribute(&dir, &pool_path, &staged, now, unique);

        // Files of committed groups live on in their messages; the rest go
        // back where they came from
        let mut kept_in_pool = 0;
        for c in &staged {
            let in_pool = pool_path.join(&c.name);
            let result = if outcome.returned.contains(&c.group) {
                move_file(&in_pool, &dir.path.join(&c.name))
            } else {
                fs::remove_file(&in_pool)
            };
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    kept_in_pool += 1;
                    log_amg_warn!("Failed to clear pool file", file = c.name.as_str(), error = e.to_string().as_str());
                }
            }
        }
        if kept_in_pool > 0 {
            // Pool recovery at the next start returns or logs them
            log_amg_error!(
                "Pool directory kept",
                pool = pool_path.display().to_string().as_str(),
                files = kept_in_pool
            );
        } else if let Err(e) = fs::remove_dir_all(&pool_path) {
            log_amg_warn!("Failed to remove pool directory", error = e.to_string().as_str());
        }
        match outcome.fatal {
            Some(e) => Err(e),
            None => Ok(outcome.created),
        }
    }

    /// Apply the directory's duplicate action. Returns whether the file
    /// left the distribution.
    fn input_duplicate(&mut self, dir: &DirJobs, c: &Candidate, action: DupAction, now: i64) -> Result<bool> {
        let path = dir.path.join(&c.name);
        log_amg_info!("Duplicate input file", dir = dir.alias.as_str(), file = c.name.as_str());
        if action.warn {
            self.logs.system.warn(&format!(
                "Duplicate file {} in {} ({} check)",
                c.name,
                dir.alias,
                check_type_name(self.fra_dupcheck_flags(dir.dir_id))
            ));
        }
        if !action.removes_file() {
            return Ok(false);
        }
        if action.store {
            self.crc.store_duplicate(dir.dir_id, &path, &c.name)?;
        } else {
            fs::remove_file(&path)?;
        }
        self.logs.delete(
            &DeleteRecord::new(DeleteReason::DupInput, c.name.as_str(), c.size as i64)
                .dir(dir.dir_id)
                .user(DELETED_BY),
        );
        self.logs.distribution(&DistributionRecord::new(
            DistributionType::DupDel,
            c.name.as_str(),
            c.size as i64,
            dir.dir_id,
            now,
            0,
        ));
        Ok(true)
    }

    fn fra_dupcheck_flags(&self, dir_id: u32) -> u32 {
        self.fra
            .position_by_id(dir_id)
            .and_then(|pos| self.fra.dir(pos).ok())
            .map(|d| d.dup_check_flag)
            .unwrap_or(0)
    }

    /// Fan the staged files out to every job of their group.
    ///
    /// A group counts as committed once one job took its files. Jobs that
    /// failed after that lose the files, with a delete record; a group no
    /// job took is listed in [`Distributed::returned`].
    fn distribute(&mut self, dir: &DirJobs, pool_path: &Path, staged: &[Candidate], now: i64, unique: u32) -> Distributed {
        let mut out = Distributed::default();
        let mut split = 0u32;
        for group in 0..dir.groups.len() {
            let files: Vec<(String, u64)> = staged
                .iter()
                .filter(|c| c.group == group)
                .map(|c| (c.name.clone(), c.size))
                .collect();
            if files.is_empty() {
                continue;
            }

            let mut routed: Vec<(DistributionType, Vec<u32>)> = Vec::new();
            let mut failed: Vec<(&JobSpec, String)> = Vec::new();
            for job in dir.jobs_of_group(group) {
                let kind = match self.route(dir, job, pool_path, &files, now, unique, &mut split) {
                    Ok((kind, made)) => {
                        out.created += made;
                        kind
                    }
                    // The message is complete in the outgoing directory and
                    // the dispatcher adopts it when it starts again
                    Err(AmgError::ChannelClosed) => {
                        out.fatal = Some(AmgError::ChannelClosed);
                        DistributionType::Normal
                    }
                    Err(e) => {
                        log_amg_warn!(
                            "Failed to distribute files",
                            dir = dir.alias.as_str(),
                            job_id = job.job_id,
                            error = e.to_string().as_str()
                        );
                        failed.push((job, e.to_string()));
                        continue;
                    }
                };
                match routed.iter_mut().find(|(k, _)| *k == kind) {
                    Some((_, ids)) => ids.push(job.job_id),
                    None => routed.push((kind, vec![job.job_id])),
                }
            }

            if routed.is_empty() {
                if let Some((_, reason)) = failed.first() {
                    self.logs
                        .system
                        .warn(&format!("Could not distribute files of {}: {}", dir.alias, reason));
                }
                out.returned.push(group);
                continue;
            }
            for (job, reason) in &failed {
                self.logs.system.error(&format!(
                    "Job #{:x} lost {} files of {}: {}",
                    job.job_id,
                    files.len(),
                    dir.alias,
                    reason
                ));
                for (name, size) in &files {
                    self.logs.delete(
                        &DeleteRecord::new(DeleteReason::DistributionFailure, name.as_str(), *size as i64)
                            .job(job.job_id)
                            .dir(dir.dir_id)
                            .host(job.host_alias.as_str())
                            .input(now, unique, split)
                            .user(DELETED_BY)
                            .extra(reason.as_str()),
                    );
                }
            }
            for (name, size) in &files {
                for (kind, ids) in &routed {
                    self.logs.distribution(
                        &DistributionRecord::new(*kind, name.as_str(), *size as i64, dir.dir_id, now, unique)
                            .with_jobs(ids.clone()),
                    );
                }
            }
        }
        out
    }

    fn host_status(&self, alias: &str) -> u32 {
        self.fsa
            .position(alias)
            .and_then(|pos| self.fsa.host(pos).ok())
            .map(|h| h.host_status)
            .unwrap_or(0)
    }

    #[allow(clippy::too_many_arguments)]
    fn route(
        &mut self,
        dir: &DirJobs,
        job: &JobSpec,
        src: &Path,
        files: &[(String, u64)],
        now: i64,
        unique: u32,
        split: &mut u32,
    ) -> Result<(DistributionType, usize)> {
        match host_mode(self.host_status(&job.host_alias)) {
            HostMode::Disabled => {
                for (name, size) in files {
                    self.logs.delete(
                        &DeleteRecord::new(DeleteReason::HostDisabled, name.as_str(), *size as i64)
                            .job(job.job_id)
                            .dir(dir.dir_id)
                            .host(job.host_alias.as_str())
                            .input(now, unique, *split)
                            .user(DELETED_BY),
                    );
                }
                Ok((DistributionType::Disabled, 0))
            }
            HostMode::Paused => {
                let target = paused_dir(&dir.path, &job.host_alias);
                fs::create_dir_all(&target)?;
                let (mut added, mut bytes) = (0i64, 0i64);
                for (name, size) in files {
                    let to = target.join(name);
                    let existed = to.exists();
                    link_or_copy(&src.join(name), &to)?;
                    if !existed {
                        added += 1;
                        bytes += *size as i64;
                    }
                }
                if let Some(pos) = self.fra.position_by_id(dir.dir_id) {
                    self.fra.adjust_queue_counters(pos, added, bytes)?;
                }
                Ok((DistributionType::QueueStopped, 0))
            }
            HostMode::Normal if job.time.is_some() => {
                time_job::defer(&self.work_dir.time_dir(), job.job_id, src, files)?;
                Ok((DistributionType::TimeJob, 0))
            }
            HostMode::Normal => {
                let made = self.build_message(dir.dir_id, job, src, files, now, unique, *split)?;
                *split += 1;
                Ok((DistributionType::Normal, made.is_some() as usize))
            }
        }
    }

    /// Link `files` of `src` into a new message for `job`, run the local
    /// options and queue it. `None` when nothing was left to send.
    #[allow(clippy::too_many_arguments)]
    fn build_message(
        &mut self,
        dir_id: u32,
        job: &JobSpec,
        src: &Path,
        files: &[(String, u64)],
        creation_time: i64,
        unique: u32,
        split: u32,
    ) -> Result<Option<NewMessage>> {
        let mut files = files.to_vec();
        if let Some(dc) = job.dupcheck {
            let mut kept = Vec::with_capacity(files.len());
            for (name, size) in files {
                let path = src.join(&name);
                match self.crc.check(job.job_id, &dc, &path, &name, size, &job.recipient, creation_time)? {
                    Verdict::New => kept.push((name, size)),
                    Verdict::Duplicate(action) => {
                        log_amg_info!("Duplicate output file", job_id = job.job_id, file = name.as_str());
                        if action.warn {
                            self.logs.system.warn(&format!(
                                "Duplicate file {} for job #{:x} ({} check)",
                                name,
                                job.job_id,
                                check_type_name(dc.flags)
                            ));
                        }
                        if !action.removes_file() {
                            kept.push((name, size));
                            continue;
                        }
                        if action.store {
                            let store = self.work_dir.store_dir().join(format!("{:x}", job.job_id));
                            fs::create_dir_all(&store)?;
                            link_or_copy(&path, &store.join(&name))?;
                        }
                        self.logs.delete(
                            &DeleteRecord::new(DeleteReason::DupOutput, name.as_str(), size as i64)
                                .job(job.job_id)
                                .dir(dir_id)
                                .host(job.host_alias.as_str())
                                .input(creation_time, unique, split)
                                .user(DELETED_BY),
                        );
                    }
                }
            }
            files = kept;
        }
        if files.is_empty() {
            return Ok(None);
        }

        let (name, msg_dir) = self.pool.create_message_dir(job.job_id, creation_time, unique, split)?;
        for (file, _) in &files {
            if let Err(e) = link_or_copy(&src.join(file), &msg_dir.join(file)) {
                // A half-built message must not be adopted by the dispatcher
                let _ = fs::remove_dir_all(&msg_dir);
                return Err(e.into());
            }
        }

        let applied = match options::apply(&job.local_options, &msg_dir, files.clone()) {
            Ok(applied) => applied,
            Err(e) => {
                self.logs.maintainer.warn(&format!("Job #{:x}: {}", job.job_id, e));
                for (file, size) in &files {
                    self.logs.delete(
                        &DeleteRecord::new(DeleteReason::OptionFailure, file.as_str(), *size as i64)
                            .job(job.job_id)
                            .dir(dir_id)
                            .host(job.host_alias.as_str())
                            .input(creation_time, unique, split)
                            .user(DELETED_BY)
                            .extra(e.to_string()),
                    );
                }
                let _ = fs::remove_dir_all(&msg_dir);
                return Ok(None);
            }
        };
        for (file, size) in &applied.deleted {
            self.logs.delete(
                &DeleteRecord::new(DeleteReason::UserDel, file.as_str(), *size as i64)
                    .job(job.job_id)
                    .dir(dir_id)
                    .host(job.host_alias.as_str())
                    .input(creation_time, unique, split)
                    .user(DELETED_BY),
            );
        }
        for ignored in &applied.ignored {
            log_amg_debug!("Local option not applied", job_id = job.job_id, option = ignored.as_str());
        }
        if applied.files.is_empty() {
            let _ = fs::remove_dir_all(&msg_dir);
            return Ok(None);
        }

        let msg = NewMessage {
            name,
            dir_id,
            host_alias: job.host_alias.clone(),
            priority: job.priority,
            files: applied.files.len() as u32,
            bytes: applied.files.iter().map(|(_, s)| s).sum(),
            age_limit: job.age_limit,
        };
        self.tx.send(msg.clone()).map_err(|_| AmgError::ChannelClosed)?;
        log_amg_debug!("Message queued", msg = msg.msg_name().as_str(), files = msg.files);
        Ok(Some(msg))
    }

    /// Follow host state: delete paused directories of disabled hosts,
    /// expire old paused files and requeue those of resumed hosts
    pub fn check_hosts(&mut self, now: i64) -> Result<()> {
        let mut pairs: Vec<(usize, String)> = Vec::new();
        for (idx, dir) in self.catalog.dirs.iter().enumerate() {
            for job in &dir.jobs {
                if !pairs.iter().any(|(i, a)| *i == idx && *a == job.host_alias) {
                    pairs.push((idx, job.host_alias.clone()));
                }
            }
        }

        for (idx, alias) in pairs {
            let dir = self.catalog.dirs[idx].clone();
            let result = match host_mode(self.host_status(&alias)) {
                HostMode::Disabled => self.remove_paused(&dir, &alias),
                HostMode::Paused => self.expire_paused(&dir, &alias, now),
                HostMode::Normal => self.requeue_paused(&dir, &alias, now).map(|_| ()),
            };
            match result {
                Ok(()) => {}
                Err(AmgError::ChannelClosed) => return Err(AmgError::ChannelClosed),
                Err(e) => log_amg_warn!("Paused directory handling failed", host = alias.as_str(), error = e.to_string().as_str()),
            }
        }
        Ok(())
    }

    fn remove_paused(&mut self, dir: &DirJobs, alias: &str) -> Result<()> {
        let target = paused_dir(&dir.path, alias);
        let key = (dir.dir_id, alias.to_string());
        if !target.exists() && !self.pending_removals.contains_key(&key) {
            return Ok(());
        }
        let limit = Duration::from_secs(self.config.amg.paused_delete_timeout);
        let removal = remove_bounded(&target, limit)?;
        for (name, size) in &removal.removed {
            self.logs.delete(
                &DeleteRecord::new(DeleteReason::HostDisabled, name.as_str(), *size as i64)
                    .dir(dir.dir_id)
                    .host(alias)
                    .user(DELETED_BY),
            );
        }
        let pending = self.pending_removals.entry(key.clone()).or_default();
        pending.0 += removal.files;
        pending.1 += removal.bytes;

        if !removal.complete {
            log_amg_warn!("Paused directory delete timed out, continuing next tick", host = alias, removed = removal.files);
            return Ok(());
        }
        let (files, bytes) = self.pending_removals.remove(&key).unwrap_or_default();
        if files > 0 {
            if let Some(pos) = self.fra.position_by_id(dir.dir_id) {
                self.fra.adjust_queue_counters(pos, -(files as i64), -(bytes as i64))?;
            }
            self.logs.system.info(&format!(
                "Deleted {} queued files ({} bytes) of disabled host {} in {}",
                files, bytes, alias, dir.alias
            ));
        }
        Ok(())
    }

    fn expire_paused(&mut self, dir: &DirJobs, alias: &str, now: i64) -> Result<()> {
        let Some(max_age) = dir.options.delete_queued_files else {
            return Ok(());
        };
        let expired = paused::expire(&dir.path, alias, max_age, now)?;
        if expired.is_empty() {
            return Ok(());
        }
        let bytes: u64 = expired.iter().map(|(_, s)| s).sum();
        for (name, size) in &expired {
            self.logs.delete(
                &DeleteRecord::new(DeleteReason::QueuedFileTimeout, name.as_str(), *size as i64)
                    .dir(dir.dir_id)
                    .host(alias)
                    .user(DELETED_BY),
            );
        }
        if let Some(pos) = self.fra.position_by_id(dir.dir_id) {
            self.fra.adjust_queue_counters(pos, -(expired.len() as i64), -(bytes as i64))?;
        }
        Ok(())
    }

    /// Put the files of a resumed host back into the normal flow
    pub fn requeue_paused(&mut self, dir: &DirJobs, alias: &str, now: i64) -> Result<usize> {
        let files = list_paused(&dir.path, alias)?;
        if files.is_empty() {
            return Ok(0);
        }
        let src = paused_dir(&dir.path, alias);
        let unique = self.counter.next()?;
        let mut split = 0;
        let mut created = 0;
        for job in dir.jobs.iter().filter(|j| j.host_alias == alias) {
            let mine: Vec<(String, u64)> = files
                .iter()
                .filter(|(name, _)| first_matching_group(&dir.groups, name) == Some(job.group))
                .cloned()
                .collect();
            if mine.is_empty() {
                continue;
            }
            if job.time.is_some() {
                time_job::defer(&self.work_dir.time_dir(), job.job_id, &src, &mine)?;
                continue;
            }
            if self.build_message(dir.dir_id, job, &src, &mine, now, unique, split)?.is_some() {
                created += 1;
            }
            split += 1;
        }

        let mut bytes = 0u64;
        for (name, size) in &files {
            match fs::remove_file(src.join(name)) {
                Ok(()) => bytes += size,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let _ = fs::remove_dir(&src);
        if let Some(pos) = self.fra.position_by_id(dir.dir_id) {
            self.fra.adjust_queue_counters(pos, -(files.len() as i64), -(bytes as i64))?;
        }
        self.logs.system.info(&format!("Requeued {} paused files for {} from {}", files.len(), alias, dir.alias));
        Ok(created)
    }

    /// Release time jobs whose crontab matched since the last check
    pub fn check_time_jobs(&mut self, now: i64) -> Result<usize> {
        let due = self.clock.due(self.catalog.dirs.iter().flat_map(|d| d.jobs.iter()), now);
        let time_dir = self.work_dir.time_dir();
        let mut created = 0;
        for job_id in due {
            let Some((dir, job)) = self.catalog.job(job_id).map(|(d, j)| (d.dir_id, j.clone())) else {
                continue;
            };
            let files = time_job::pending(&time_dir, job_id)?;
            if files.is_empty() {
                continue;
            }
            let mode = host_mode(self.host_status(&job.host_alias));
            if mode == HostMode::Paused {
                continue;
            }
            let src = time_job::time_job_dir(&time_dir, job_id);
            if mode == HostMode::Disabled {
                for (name, size) in &files {
                    self.logs.delete(
                        &DeleteRecord::new(DeleteReason::HostDisabled, name.as_str(), *size as i64)
                            .job(job_id)
                            .dir(dir)
                            .host(job.host_alias.as_str())
                            .user(DELETED_BY),
                    );
                }
            } else {
                let unique = self.counter.next()?;
                if self.build_message(dir, &job, &src, &files, now, unique, 0)?.is_some() {
                    created += 1;
                }
            }
            fs::remove_dir_all(&src)?;
        }
        Ok(created)
    }

    fn watched_dirs(&self) -> Vec<WatchedDir> {
        if !self.config.amg.inotify {
            return Vec::new();
        }
        let filters_dir = self.work_dir.filters_dir();
        self.catalog
            .dirs
            .iter()
            .filter(|d| d.options.inotify)
            .map(|d| WatchedDir {
                dir_id: d.dir_id,
                path: d.path.clone(),
                filter_file: filters_dir.join(&d.alias),
            })
            .collect()
    }

    /// Run until `shutdown` flips or the command channel closes
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<AmgCommand>,
        mut shutdown: watch::Receiver<bool>,
        scan_at_start: bool,
    ) -> Result<()> {
        self.recover()?;
        let (watch_tx, mut watch_rx) = mpsc::channel(256);
        let start_watch = |amg: &Amg| {
            let dirs = amg.watched_dirs();
            (!dirs.is_empty()).then(|| spawn_watch_task(dirs, watch_tx.clone()))
        };
        let mut watcher = start_watch(&self);

        if scan_at_start {
            self.scan_all(now(), true)?;
        }
        log_amg_info!("Generator running", dirs = self.catalog.dirs.len(), pid = self.pid);

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let result = loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.tick(now()) {
                        Ok(_) => {}
                        Err(AmgError::ChannelClosed) => break Err(AmgError::ChannelClosed),
                        Err(e) => log_amg_warn!("Generator tick failed", error = e.to_string().as_str()),
                    }
                }
                Some(dir_id) = watch_rx.recv() => {
                    if let Err(e) = self.scan_dir_id(dir_id, now()) {
                        log_amg_warn!("Scan after watch event failed", dir_id = dir_id, error = e.to_string().as_str());
                    }
                }
                cmd = commands.recv() => match cmd {
                    Some(AmgCommand::RereadConfig) => {
                        match self.reread_config() {
                            Ok(()) => {
                                if let Some(w) = watcher.take() {
                                    w.abort();
                                }
                                watcher = start_watch(&self);
                            }
                            Err(e) => {
                                log_amg_error!("Reread failed", error = e.to_string().as_str());
                                self.logs.system.error(&format!("Failed to reread configuration: {}", e));
                            }
                        }
                    }
                    Some(AmgCommand::Rescan) => {
                        if let Err(e) = self.scan_all(now(), true) {
                            log_amg_warn!("Rescan failed", error = e.to_string().as_str());
                        }
                    }
                    None => break Ok(()),
                },
                _ = shutdown.changed() => break Ok(()),
            }
        };

        if let Some(w) = watcher {
            w.abort();
        }
        self.fsa.flush()?;
        self.fra.flush()?;
        log_amg_info!("Generator stopped");
        result
    }
}
