//! Work-directory layout.
//!
//! Every cooperating process resolves its files through [`WorkDir`] so the
//! on-disk layout lives in one place:
//!
//! ```text
//! $AFD_WORK_DIR/
//! ├── fifodir/     FIFOs, ID files, registries
//! ├── files/       pool, outgoing, time, store, incoming/{filters,ls_data}
//! ├── log/
//! └── etc/         AFD_CONFIG, DIR_CONFIG, HOST_CONFIG, action/
//! ```

use std::io;
use std::path::{Path, PathBuf};

pub const FIFO_DIR: &str = "fifodir";
pub const FILE_DIR: &str = "files";
pub const LOG_DIR: &str = "log";
pub const ETC_DIR: &str = "etc";

pub const AFD_CMD_FIFO: &str = "afd.cmd";
pub const AFD_RESP_FIFO: &str = "afd.resp";
pub const AMG_CMD_FIFO: &str = "amg.cmd";
pub const FD_CMD_FIFO: &str = "fd.cmd";
pub const IP_FIN_FIFO: &str = "ip.fin";
pub const PROBE_ONLY_FIFO: &str = "probe.only";

pub const FSA_ID_FILE: &str = "fsa.id";
pub const FRA_ID_FILE: &str = "fra.id";
pub const FSA_STAT_FILE: &str = "fsa_status";
pub const FRA_STAT_FILE: &str = "fra_status";
pub const COUNTER_FILE: &str = "counter";
pub const DIR_NAME_FILE: &str = "directory_names";
pub const PWB_DATA_FILE: &str = "pwb.data";
pub const JOB_ID_DATA_FILE: &str = "job_id.data";
pub const FILE_MASK_FILE: &str = "file_mask.data";
pub const DC_ID_FILE: &str = "dc_id.data";
pub const MSG_QUEUE_FILE: &str = "msg_queue";
pub const MSG_CACHE_FILE: &str = "msg_cache";
pub const AFD_ACTIVE_FILE: &str = "AFD_ACTIVE";

pub const AFD_CONFIG_FILE: &str = "AFD_CONFIG";
pub const DIR_CONFIG_FILE: &str = "DIR_CONFIG";
pub const HOST_CONFIG_FILE: &str = "HOST_CONFIG";
pub const DISABLED_DIR_FILE: &str = "DISABLED_DIR_FILE";

/// Every log FIFO the core writes to
pub const LOG_FIFOS: &[&str] = &[
    "system.log",
    "transfer.log",
    "trans_db.log",
    "event.log",
    "receive.log",
    "maintainer.log",
    "delete.log",
    "distribution.log",
    "production.log",
    "input.log",
    "output.log",
];

/// Who an action script is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionTarget {
    Target,
    Source,
}

/// Which transition an action script reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Error,
    Warn,
    Info,
    Success,
}

impl ActionKind {
    fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Error => "error",
            ActionKind::Warn => "warn",
            ActionKind::Info => "info",
            ActionKind::Success => "success",
        }
    }
}

/// Resolved AFD work directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$AFD_WORK_DIR`, else `$HOME/.afd`, else `/tmp/.afd`
    pub fn from_env() -> Self {
        if let Ok(dir) = std::env::var("AFD_WORK_DIR") {
            if !dir.is_empty() {
                return Self::new(dir);
            }
        }
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        Self::new(home.join(".afd"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fifo_dir(&self) -> PathBuf {
        self.root.join(FIFO_DIR)
    }

    pub fn fifo(&self, name: &str) -> PathBuf {
        self.fifo_dir().join(name)
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join(FILE_DIR)
    }

    /// Staging area for freshly ingested batches
    pub fn pool_dir(&self) -> PathBuf {
        self.files_dir().join("pool")
    }

    /// Message directories waiting for the dispatcher
    pub fn outgoing_dir(&self) -> PathBuf {
        self.files_dir().join("outgoing")
    }

    /// Deferred (time option) job directories
    pub fn time_dir(&self) -> PathBuf {
        self.files_dir().join("time")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.files_dir().join("store")
    }

    pub fn crc_dir(&self) -> PathBuf {
        self.store_dir().join("crc")
    }

    pub fn filters_dir(&self) -> PathBuf {
        self.files_dir().join("incoming").join("filters")
    }

    pub fn ls_data_dir(&self) -> PathBuf {
        self.files_dir().join("incoming").join("ls_data")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.root.join(ETC_DIR)
    }

    pub fn afd_config(&self) -> PathBuf {
        self.etc_dir().join(AFD_CONFIG_FILE)
    }

    pub fn dir_config(&self) -> PathBuf {
        self.etc_dir().join(DIR_CONFIG_FILE)
    }

    pub fn host_config(&self) -> PathBuf {
        self.etc_dir().join(HOST_CONFIG_FILE)
    }

    pub fn disabled_dir_file(&self) -> PathBuf {
        self.etc_dir().join(DISABLED_DIR_FILE)
    }

    pub fn action_script(&self, target: ActionTarget, kind: ActionKind, alias: &str) -> PathBuf {
        let target = match target {
            ActionTarget::Target => "target",
            ActionTarget::Source => "source",
        };
        self.etc_dir()
            .join("action")
            .join(target)
            .join(kind.as_str())
            .join(alias)
    }

    pub fn fsa_file(&self, id: i32) -> PathBuf {
        self.fifo(&format!("{}.{}", FSA_STAT_FILE, id))
    }

    pub fn fra_file(&self, id: i32) -> PathBuf {
        self.fifo(&format!("{}.{}", FRA_STAT_FILE, id))
    }

    /// Create every directory and leave files alone
    pub fn create_layout(&self) -> io::Result<()> {
        for dir in [
            self.fifo_dir(),
            self.pool_dir(),
            self.outgoing_dir(),
            self.time_dir(),
            self.crc_dir(),
            self.filters_dir(),
            self.ls_data_dir(),
            self.log_dir(),
            self.etc_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let wd = WorkDir::new("/srv/afd");
        assert_eq!(wd.fifo(AFD_CMD_FIFO), PathBuf::from("/srv/afd/fifodir/afd.cmd"));
        assert_eq!(wd.fsa_file(3), PathBuf::from("/srv/afd/fifodir/fsa_status.3"));
        assert_eq!(wd.crc_dir(), PathBuf::from("/srv/afd/files/store/crc"));
        assert_eq!(
            wd.filters_dir(),
            PathBuf::from("/srv/afd/files/incoming/filters")
        );
        assert_eq!(
            wd.action_script(ActionTarget::Target, ActionKind::Error, "h1"),
            PathBuf::from("/srv/afd/etc/action/target/error/h1")
        );
    }

    #[test]
    fn test_create_layout() {
        let temp = tempfile::tempdir().unwrap();
        let wd = WorkDir::new(temp.path());
        wd.create_layout().unwrap();
        assert!(wd.pool_dir().is_dir());
        assert!(wd.ls_data_dir().is_dir());
        // Idempotent
        wd.create_layout().unwrap();
    }
}
