//! `afd status`: who is running and what the status areas say.

use std::fmt::Write;

use afd_status::fsa::{
    AUTO_PAUSE_QUEUE, DANGER_PAUSE_QUEUE, ERROR_QUEUE_SET, HOST_DISABLED, HOST_ERROR_OFFLINE, PAUSE_QUEUE,
    STOP_TRANSFER,
};
use afd_status::{DirectoryStatus, HostEntry};

/// One letter per set status bit, `-` when none is
pub fn status_letters(status: u32) -> String {
    const LETTERS: [(u32, char); 7] = [
        (PAUSE_QUEUE, 'P'),
        (AUTO_PAUSE_QUEUE, 'A'),
        (DANGER_PAUSE_QUEUE, 'G'),
        (STOP_TRANSFER, 'S'),
        (HOST_DISABLED, 'D'),
        (ERROR_QUEUE_SET, 'E'),
        (HOST_ERROR_OFFLINE, 'O'),
    ];
    let letters: String = LETTERS
        .iter()
        .filter(|(bit, _)| status & bit != 0)
        .map(|(_, c)| *c)
        .collect();
    if letters.is_empty() {
        "-".to_string()
    } else {
        letters
    }
}

pub fn render_hosts(hosts: &[HostEntry]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<9} {:<20} {:<7} {:>6} {:>6} {:>6} {:>8} {:>12}",
        "HOST", "HOSTNAME", "STATUS", "ACTIVE", "QUEUED", "ERRORS", "FILES", "BYTES"
    );
    for host in hosts {
        let _ = writeln!(
            out,
            "{:<9} {:<20} {:<7} {:>6} {:>6} {:>6} {:>8} {:>12}",
            host.alias(),
            host.active_hostname(),
            status_letters(host.host_status),
            host.active_transfers,
            host.jobs_queued,
            host.error_counter,
            host.total_file_counter,
            host.total_file_size
        );
    }
    out
}

pub fn render_dirs(dirs: &[DirectoryStatus]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<24} {:>8} {:>12} {:>8}", "DIRECTORY", "QUEUED", "BYTES", "IN DIR");
    for dir in dirs {
        let mut alias = dir.alias();
        if dir.is_disabled() {
            alias.push_str(" (off)");
        }
        let _ = writeln!(
            out,
            "{:<24} {:>8} {:>12} {:>8}",
            alias, dir.files_queued, dir.bytes_in_queue, dir.files_in_dir
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_letters() {
        assert_eq!(status_letters(0), "-");
        assert_eq!(status_letters(PAUSE_QUEUE | ERROR_QUEUE_SET), "PE");
        assert_eq!(status_letters(HOST_DISABLED), "D");
    }

    #[test]
    fn test_dir_table_marks_disabled() {
        let mut dir = DirectoryStatus::new(1, "in1", "/data/in1");
        dir.files_queued = 3;
        let table = render_dirs(&[dir]);
        assert!(table.lines().nth(1).unwrap().starts_with("in1"));
        assert!(table.contains(" 3 "));
    }
}
