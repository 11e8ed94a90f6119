//! Start-up recovery of what a crash left behind.
//!
//! - Pool directories still holding files go back to their source
//!   directory, or are deleted when that directory is gone.
//! - Deferred time-job directories are adopted by the current job with the
//!   same directory, file masks and recipient, or deleted.

use std::fs;
use std::io;
use std::path::Path;

use afd_catalog::{DirNameBuffer, JobIdDb};
use afd_config::{log_amg_info, log_amg_warn};
use afd_log::{DeleteReason, DeleteRecord, Logs};
use walkdir::WalkDir;

use crate::fsops::{is_cross_device, list_files, move_file};
use crate::pool::PoolName;
use crate::Result;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolRecovery {
    pub dirs: usize,
    pub files_moved: usize,
    pub files_deleted: usize,
}

fn delete_all(dir: &Path, reason: DeleteReason, logs: &Logs, tag: impl Fn(DeleteRecord) -> DeleteRecord) -> usize {
    let files = list_files(dir).unwrap_or_default();
    for (name, size) in &files {
        logs.delete(&tag(DeleteRecord::new(reason, name.as_str(), *size as i64)));
    }
    if let Err(e) = fs::remove_dir_all(dir) {
        log_amg_warn!("Failed to remove directory", path = dir.display().to_string().as_str(), error = e.to_string().as_str());
    }
    files.len()
}

/// Empty the pool directory after a restart
pub fn clear_pool_dir(pool_dir: &Path, dir_names: &DirNameBuffer, logs: &Logs) -> Result<PoolRecovery> {
    let mut report = PoolRecovery::default();
    let entries = match fs::read_dir(pool_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        report.dirs += 1;
        let text = entry.file_name().to_string_lossy().into_owned();
        let name: PoolName = match text.parse() {
            Ok(name) => name,
            Err(_) => {
                report.files_deleted += delete_all(&path, DeleteReason::PoolRecovery, logs, |r| r.extra(text.as_str()));
                logs.system.warn(&format!("Removed pool directory {} with an invalid name", text));
                continue;
            }
        };

        let source = dir_names
            .dir_name(name.dir_id)?
            .filter(|p| p.is_dir());
        let Some(source) = source else {
            report.files_deleted += delete_all(&path, DeleteReason::PoolRecovery, logs, |r| {
                r.dir(name.dir_id).input(name.creation_time, name.unique_number, 0)
            });
            continue;
        };

        let mut moved = 0;
        for (file, _) in list_files(&path)? {
            let target = source.join(&file);
            match move_file(&path.join(&file), &target) {
                Ok(()) => moved += 1,
                Err(e) => {
                    log_amg_warn!("Failed to move pool file back", file = file.as_str(), error = e.to_string().as_str());
                }
            }
        }
        if moved > 0 {
            logs.system.info(&format!("Moved {} files back to {}", moved, source.display()));
        }
        report.files_moved += moved;
        report.files_deleted += delete_all(&path, DeleteReason::PoolRecovery, logs, |r| r.dir(name.dir_id));
    }

    if report.dirs > 0 {
        log_amg_info!(
            "Pool recovered",
            dirs = report.dirs,
            moved = report.files_moved,
            deleted = report.files_deleted
        );
    }
    Ok(report)
}

/// Move the files of `from` below `to`, renaming the whole directory
/// when possible
fn move_dir(from: &Path, to: &Path) -> io::Result<()> {
    if !to.exists() {
        match fs::rename(from, to) {
            Ok(()) => return Ok(()),
            Err(e) if is_cross_device(&e) => {}
            Err(e) => return Err(e),
        }
    }
    fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).min_depth(1).max_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            move_file(entry.path(), &to.join(entry.file_name()))?;
        }
    }
    fs::remove_dir_all(from)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimeRecovery {
    pub kept: usize,
    pub moved: usize,
    pub deleted: usize,
}

/// Hand deferred files to the current jobs after a configuration change
pub fn recover_time_dirs(time_dir: &Path, jobs: &JobIdDb, current: &[u32], logs: &Logs) -> Result<TimeRecovery> {
    let mut report = TimeRecovery::default();
    let entries = match fs::read_dir(time_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let text = entry.file_name().to_string_lossy().into_owned();
        let Ok(old_id) = u32::from_str_radix(&text, 16) else {
            continue;
        };
        if current.contains(&old_id) {
            report.kept += 1;
            continue;
        }

        let target = match jobs.lookup(old_id)? {
            Some(old) => jobs.find_similar(old.dir_id, old.file_mask_id, &old.recipient(), current),
            None => None,
        };
        match target {
            Some(job) => {
                let to = time_dir.join(format!("{:x}", job.job_id));
                move_dir(&path, &to)?;
                logs.system.info(&format!(
                    "Deferred files of job #{:x} now belong to job #{:x}",
                    old_id, job.job_id
                ));
                report.moved += 1;
            }
            None => {
                delete_all(&path, DeleteReason::JidLookupFailure, logs, |r| r.job(old_id));
                logs.system.warn(&format!("No current job for deferred job #{:x}, files deleted", old_id));
                report.deleted += 1;
            }
        }
    }
    Ok(report)
}
