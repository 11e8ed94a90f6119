//! Configuration to catalog.
//!
//! [`Catalog::build`] is run at start and on every reread: it parses
//! `DIR_CONFIG` and `HOST_CONFIG`, gives every directory, mask list and job
//! its checksum ID, stores passwords, writes the filter files and brings
//! the FRA and FSA in line with the result.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;

use afd_catalog::dir_config::DirOptions;
use afd_catalog::vault::StoreOutcome;
use afd_catalog::{
    filters, DirConfig, DirConfigIdDb, DirNameBuffer, DupCheckSpec, FileGroup, FileMaskDb,
    JobDefinition, JobIdDb, PasswordVault,
};
use afd_config::path::{DC_ID_FILE, DIR_NAME_FILE, FILE_MASK_FILE, JOB_ID_DATA_FILE, PWB_DATA_FILE};
use afd_config::{log_amg_info, log_amg_warn, Config, WorkDir};
use afd_log::Logs;
use afd_status::fra::DIR_DISABLED;
use afd_status::{host_config, DirectoryStatus, Fra, Fsa, HostConfigEntry};

use crate::crontab::CronSpec;
use crate::Result;

/// One job as the generator uses it
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub job_id: u32,
    pub dir_id: u32,
    pub file_mask_id: u32,
    /// Index of the file group in [`DirJobs::groups`]
    pub group: usize,
    /// Recipient URL without password
    pub recipient: String,
    pub host_alias: String,
    pub protocol: u32,
    pub priority: u8,
    /// Transformations applied while the message is built
    pub local_options: Vec<String>,
    pub send_options: Vec<String>,
    /// Seconds, 0 = unlimited
    pub age_limit: u32,
    pub time: Option<CronSpec>,
    pub dupcheck: Option<DupCheckSpec>,
}

/// A source directory with its file groups and jobs
#[derive(Debug, Clone)]
pub struct DirJobs {
    pub dir_id: u32,
    pub alias: String,
    pub path: PathBuf,
    pub options: DirOptions,
    pub groups: Vec<FileGroup>,
    pub jobs: Vec<JobSpec>,
}

impl DirJobs {
    pub fn jobs_of_group(&self, group: usize) -> impl Iterator<Item = &JobSpec> {
        self.jobs.iter().filter(move |j| j.group == group)
    }
}

#[derive(Debug)]
pub struct Catalog {
    pub dirs: Vec<DirJobs>,
    pub hosts: Vec<HostConfigEntry>,
    pub dir_names: DirNameBuffer,
    pub jobs: JobIdDb,
    pub dir_config_id: u32,
}

/// Aliases (or paths) listed in `DISABLED_DIR_FILE`
fn disabled_dirs(work_dir: &WorkDir) -> HashSet<String> {
    match fs::read_to_string(work_dir.disabled_dir_file()) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(String::from)
            .collect(),
        Err(_) => HashSet::new(),
    }
}

impl Catalog {
    pub fn build(
        work_dir: &WorkDir,
        config: &Config,
        fsa: &mut Fsa,
        fra: &mut Fra,
        logs: &Logs,
    ) -> Result<Self> {
        let dir_config_path = work_dir.dir_config();
        let dc = DirConfig::load(&dir_config_path)?;
        for error in &dc.errors {
            logs.maintainer.warn(&error.to_string());
            log_amg_warn!("DIR_CONFIG entry skipped", reason = error.to_string().as_str());
        }

        let mut hosts = match host_config::load(&work_dir.host_config()) {
            Ok(hosts) => hosts,
            Err(afd_status::StatusError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let hosts_before = hosts.len();

        let mut dcid_db = DirConfigIdDb::attach(work_dir.fifo(DC_ID_FILE))?;
        let dir_config_id = dcid_db.insert(&dir_config_path)?;
        let mut dir_names = DirNameBuffer::attach(work_dir.fifo(DIR_NAME_FILE))?;
        let masks = FileMaskDb::new(work_dir.fifo(FILE_MASK_FILE));
        let mut jobs_db = JobIdDb::attach(work_dir.fifo(JOB_ID_DATA_FILE))?;
        let mut vault = PasswordVault::attach(work_dir.fifo(PWB_DATA_FILE))?;
        vault.begin_pass()?;

        let disabled = disabled_dirs(work_dir);
        let filters_dir = work_dir.filters_dir();
        fs::create_dir_all(&filters_dir)?;

        let mut dirs = Vec::with_capacity(dc.dirs.len());
        let mut statuses = Vec::with_capacity(dc.dirs.len());
        let mut kept_masks = HashSet::new();
        let mut protocols: HashMap<String, u32> = HashMap::new();

        for entry in &dc.dirs {
            let dir_name = entry.path.to_string_lossy();
            let dir_id = dir_names.insert(&dir_name, &entry.location)?;
            let groups = entry.file_groups();

            let mut status: DirectoryStatus = entry.status(dir_id);
            if status.max_copied_files == 0 {
                status.max_copied_files = config.amg.max_copied_files;
            }
            if status.max_copied_file_size == 0 {
                status.max_copied_file_size = config.amg.max_copied_file_size;
            }
            if status.rescan_time == 0 {
                status.rescan_time = config.amg.rescan_time as i32;
            }
            if disabled.contains(&entry.alias) || disabled.contains(&*dir_name) {
                status.dir_flag |= DIR_DISABLED;
            }
            statuses.push(status);

            if let Err(e) = filters::write(&filters_dir.join(&entry.alias), &groups) {
                log_amg_warn!("Failed to write filter file", dir = entry.alias.as_str(), error = e.to_string().as_str());
            }

            let mut jobs = Vec::new();
            for (group_index, group) in entry.groups.iter().enumerate() {
                let file_mask_id = masks.store(&group.group.masks)?;
                kept_masks.insert(file_mask_id);

                for dest in &group.destinations {
                    let time = match dest.options.time_spec() {
                        Some(text) => match CronSpec::parse(&text) {
                            Ok(spec) => Some(spec),
                            Err(e) => {
                                logs.maintainer.warn(&format!("{}: {}", entry.alias, e));
                                None
                            }
                        },
                        None => None,
                    };
                    let age_limit = dest
                        .options
                        .age_limit()
                        .map(|s| s.min(u32::MAX as u64) as u32)
                        .unwrap_or(config.fd.default_age_limit);

                    for recipient in &dest.recipients {
                        let host_alias = recipient.host_alias();
                        if let Some(password) = &recipient.password {
                            match vault.store(&recipient.user, &recipient.hostname, password) {
                                Ok(StoreOutcome::Conflict) => logs.maintainer.warn(&format!(
                                    "Different passwords for {}@{}, using the last one",
                                    recipient.user, recipient.hostname
                                )),
                                Ok(_) => {}
                                Err(e) => logs.maintainer.warn(&e.to_string()),
                            }
                        }
                        if !hosts.iter().any(|h| h.alias == host_alias) {
                            hosts.push(HostConfigEntry::new(&host_alias).with_hostname(&recipient.hostname));
                        }
                        *protocols.entry(host_alias.clone()).or_default() |= recipient.protocol();

                        let def = JobDefinition {
                            dir_id,
                            file_mask_id,
                            dir_config_id,
                            recipient: recipient.stored_text().to_string(),
                            host_alias: host_alias.clone(),
                            priority: dest.options.priority,
                            local_options: dest.options.local.clone(),
                            send_options: dest.options.send.clone(),
                        };
                        let job_id = match jobs_db.insert(&def) {
                            Ok(id) => id,
                            Err(e) => {
                                logs.system.error(&format!(
                                    "No job ID for {} in {}: {}",
                                    def.recipient, entry.alias, e
                                ));
                                continue;
                            }
                        };
                        jobs.push(JobSpec {
                            job_id,
                            dir_id,
                            file_mask_id,
                            group: group_index,
                            recipient: def.recipient,
                            host_alias,
                            protocol: recipient.protocol(),
                            priority: def.priority,
                            local_options: dest.options.transformations().cloned().collect(),
                            send_options: def.send_options,
                            age_limit,
                            time,
                            dupcheck: dest.options.dupcheck(),
                        });
                    }
                }
            }

            dirs.push(DirJobs {
                dir_id,
                alias: entry.alias.clone(),
                path: entry.path.clone(),
                options: entry.options.clone(),
                groups,
                jobs,
            });
        }

        if hosts.len() != hosts_before {
            host_config::write(&work_dir.host_config(), &hosts)?;
        }

        fra.sync(&statuses)?;
        fsa.sync(&hosts, Some(fra))?;
        for (pos, host) in hosts.iter().enumerate() {
            let bits = protocols.get(&host.alias).copied().unwrap_or(0);
            fsa.update(pos, |h| h.protocol = bits)?;
        }

        // Jobs of earlier configurations may still have messages in time
        // or pool directories, so their masks stay
        let mut referenced: HashSet<u32> = jobs_db.records().iter().map(|r| r.file_mask_id).collect();
        referenced.extend(kept_masks);
        let dropped = masks.drop_unreferenced(&referenced)?;
        let mismatched = masks.verify()?;
        if !mismatched.is_empty() {
            log_amg_warn!("File mask IDs not matching their masks", count = mismatched.len());
            logs.maintainer.warn(&format!("{} file mask IDs do not match their masks", mismatched.len()));
        }
        let job_count: usize = dirs.iter().map(|d| d.jobs.len()).sum();
        log_amg_info!(
            "Catalog built",
            dirs = dirs.len(),
            jobs = job_count,
            hosts = hosts.len(),
            dropped_masks = dropped
        );
        logs.system.info(&format!(
            "Found {} directories with {} jobs for {} hosts",
            dirs.len(),
            job_count,
            hosts.len()
        ));

        Ok(Self {
            dirs,
            hosts,
            dir_names,
            jobs: jobs_db,
            dir_config_id,
        })
    }

    pub fn dir(&self, dir_id: u32) -> Option<&DirJobs> {
        self.dirs.iter().find(|d| d.dir_id == dir_id)
    }

    pub fn job(&self, job_id: u32) -> Option<(&DirJobs, &JobSpec)> {
        self.dirs
            .iter()
            .find_map(|d| d.jobs.iter().find(|j| j.job_id == job_id).map(|j| (d, j)))
    }

    pub fn job_ids(&self) -> Vec<u32> {
        self.dirs.iter().flat_map(|d| d.jobs.iter().map(|j| j.job_id)).collect()
    }
}
