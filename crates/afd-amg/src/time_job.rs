//! Deferred jobs.
//!
//! Files of a job with a `time` option collect in `files/time/<job-id>/`
//! until the job's crontab matches; then they are released as one message.

use std::io;
use std::path::{Path, PathBuf};

use crate::catalog::JobSpec;
use crate::fsops::{link_or_copy, list_files};

pub fn time_job_dir(time_dir: &Path, job_id: u32) -> PathBuf {
    time_dir.join(format!("{:x}", job_id))
}

/// Link `files` of `src` into the job's time directory
pub fn defer(time_dir: &Path, job_id: u32, src: &Path, files: &[(String, u64)]) -> io::Result<()> {
    let dir = time_job_dir(time_dir, job_id);
    std::fs::create_dir_all(&dir)?;
    for (name, _) in files {
        link_or_copy(&src.join(name), &dir.join(name))?;
    }
    Ok(())
}

/// Files waiting for `job_id`
pub fn pending(time_dir: &Path, job_id: u32) -> io::Result<Vec<(String, u64)>> {
    match list_files(&time_job_dir(time_dir, job_id)) {
        Ok(files) => Ok(files),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Remembers when time jobs were last looked at so no minute is missed
/// between two checks
#[derive(Debug, Clone, Copy)]
pub struct TimeJobClock {
    last_check: i64,
}

impl TimeJobClock {
    pub fn new(now: i64) -> Self {
        Self { last_check: now }
    }

    pub fn last_check(&self) -> i64 {
        self.last_check
    }

    /// IDs of the jobs whose crontab matched a minute since the last call
    pub fn due<'a>(&mut self, jobs: impl IntoIterator<Item = &'a JobSpec>, now: i64) -> Vec<u32> {
        let after = self.last_check;
        if now.div_euclid(60) == after.div_euclid(60) {
            return Vec::new();
        }
        self.last_check = now;
        jobs.into_iter()
            .filter(|j| j.time.map(|t| t.due_between(after, now)).unwrap_or(false))
            .map(|j| j.job_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crontab::CronSpec;

    fn job(id: u32, time: Option<&str>) -> JobSpec {
        JobSpec {
            job_id: id,
            dir_id: 1,
            file_mask_id: 2,
            group: 0,
            recipient: "ftp://u@h/".into(),
            host_alias: "h".into(),
            protocol: 1,
            priority: b'5',
            local_options: Vec::new(),
            send_options: Vec::new(),
            age_limit: 0,
            time: time.map(|t| CronSpec::parse(t).unwrap()),
            dupcheck: None,
        }
    }

    #[test]
    fn test_due_once_per_minute() {
        let jobs = vec![job(1, Some("* * * * *")), job(2, None)];
        let mut clock = TimeJobClock::new(0);
        assert!(clock.due(&jobs, 30).is_empty());
        assert_eq!(clock.due(&jobs, 61), vec![1]);
        assert!(clock.due(&jobs, 90).is_empty());
        assert_eq!(clock.due(&jobs, 125), vec![1]);
    }

    #[test]
    fn test_defer_and_pending() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("pool");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("a.bin"), b"123").unwrap();
        let time_dir = temp.path().join("time");
        defer(&time_dir, 0xab, &src, &[("a.bin".to_string(), 3)]).unwrap();
        assert_eq!(pending(&time_dir, 0xab).unwrap(), vec![("a.bin".to_string(), 3)]);
        assert!(pending(&time_dir, 0xcd).unwrap().is_empty());
        assert!(time_dir.join("ab/a.bin").exists());
    }
}
