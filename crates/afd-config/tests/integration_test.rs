//! Integration tests for afd-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use afd_config::{Config, WorkDir};
use tempfile::tempdir;

/// Test config loading from a real AFD_CONFIG file
#[test]
fn test_load_afd_config_from_file() {
    let temp = tempdir().unwrap();
    let wd = WorkDir::new(temp.path());
    wd.create_layout().unwrap();

    let config_content = r#"
[afd]
max_connections = 8

[amg]
rescan_time = 2
max_copied_files = 10
max_queued_files = 5000
inotify = false

[fd]
burst_enabled = false
max_retry_backoff_factor = 3

[transport.workers]
ftp = "/usr/local/bin/sf_ftp"
"#;
    std::fs::write(wd.afd_config(), config_content).unwrap();

    let config = Config::load(&wd).unwrap();

    assert_eq!(config.afd.max_connections, 8);
    assert_eq!(config.amg.rescan_time, 2);
    assert_eq!(config.amg.max_copied_files, 10);
    assert_eq!(config.amg.max_queued_files, 5000);
    assert_eq!(config.amg.max_queued_size, 0);
    assert!(!config.amg.inotify);
    assert!(!config.fd.burst_enabled);
    assert_eq!(config.fd.max_retry_backoff_factor, 3);
    assert_eq!(config.transport.workers["ftp"], "/usr/local/bin/sf_ftp");
    // Unspecified keys keep their defaults
    assert_eq!(config.amg.paused_delete_timeout, 30);
}

/// Test that a malformed file is reported instead of silently ignored
#[test]
fn test_invalid_toml_is_error() {
    let temp = tempdir().unwrap();
    let wd = WorkDir::new(temp.path());
    wd.create_layout().unwrap();
    std::fs::write(wd.afd_config(), "[amg\nrescan_time = ").unwrap();

    assert!(Config::load(&wd).is_err());
}

/// Test work dir resolution from the environment
#[test]
fn test_work_dir_from_env() {
    let temp = tempdir().unwrap();
    unsafe { std::env::set_var("AFD_WORK_DIR", temp.path()) };
    let wd = WorkDir::from_env();
    assert_eq!(wd.root(), temp.path());
    unsafe { std::env::remove_var("AFD_WORK_DIR") };
}
