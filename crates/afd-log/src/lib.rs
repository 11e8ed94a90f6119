//! # afd-log
//!
//! The audit side of AFD logging. Diagnostics go through `tracing`; what
//! operators and accounting tools read goes through named FIFOs under
//! `fifodir/`, one record per `write(2)`:
//!
//! - text logs (`system.log`, `transfer.log`, ...) carry
//!   `"<dd mm HH:MM:SS> <X> text"` lines ([`text`])
//! - `delete.log` carries [`delete::DeleteRecord`]s
//! - `distribution.log` carries [`distribution::DistributionRecord`]s,
//!   split into numbered segments when the job list is long
//!
//! [`drain::LogDrain`] is the reading end that appends everything to
//! `log/<NAME>.0`.

pub mod delete;
pub mod distribution;
pub mod drain;
pub mod sink;
pub mod text;

pub use delete::{DeleteReason, DeleteRecord};
pub use distribution::{DistributionRecord, DistributionType};
pub use drain::LogDrain;
pub use sink::{FifoSink, MemorySink, RecordSink};
pub use text::TextLogger;

use std::sync::Arc;

use afd_config::WorkDir;
use thiserror::Error;

/// Largest write a FIFO reader is guaranteed to receive in one piece
pub const PIPE_BUF: usize = libc::PIPE_BUF;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record of {0} bytes exceeds the atomic write size")]
    TooLong(usize),

    /// More bytes are needed before the record can be decoded
    #[error("Incomplete log record")]
    Incomplete,

    #[error("Malformed log record: {0}")]
    Malformed(String),

    #[error(transparent)]
    Ipc(#[from] afd_ipc::IpcError),
}

pub type Result<T> = std::result::Result<T, LogError>;

/// Every log a core process writes to
#[derive(Clone)]
pub struct Logs {
    pub system: TextLogger,
    pub maintainer: TextLogger,
    pub event: TextLogger,
    pub transfer: TextLogger,
    pub delete: Arc<dyn RecordSink>,
    pub distribution: Arc<dyn RecordSink>,
}

impl std::fmt::Debug for Logs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logs").finish_non_exhaustive()
    }
}

impl Logs {
    /// Open the log FIFOs of `work_dir`, creating them when missing
    pub fn open(work_dir: &WorkDir) -> Result<Self> {
        let fifo = |name: &str| -> Result<Arc<dyn RecordSink>> {
            Ok(Arc::new(FifoSink::open(&work_dir.fifo(name))?))
        };
        Ok(Self {
            system: TextLogger::new(fifo("system.log")?),
            maintainer: TextLogger::new(fifo("maintainer.log")?),
            event: TextLogger::new(fifo("event.log")?),
            transfer: TextLogger::new(fifo("transfer.log")?),
            delete: fifo("delete.log")?,
            distribution: fifo("distribution.log")?,
        })
    }

    /// In-memory logs for tests and dry runs
    pub fn memory() -> (Self, MemoryLogs) {
        let mem = MemoryLogs::default();
        let logs = Self {
            system: TextLogger::new(mem.system.clone()),
            maintainer: TextLogger::new(mem.maintainer.clone()),
            event: TextLogger::new(mem.event.clone()),
            transfer: TextLogger::new(mem.transfer.clone()),
            delete: mem.delete.clone(),
            distribution: mem.distribution.clone(),
        };
        (logs, mem)
    }

    pub fn delete(&self, record: &DeleteRecord) {
        let bytes = record.encode();
        if let Err(e) = self.delete.write_record(&bytes) {
            tracing::warn!(error = %e, file = record.file_name.as_str(), "Failed to write delete log record");
        }
    }

    pub fn distribution(&self, record: &DistributionRecord) {
        for segment in record.encode_segments() {
            if let Err(e) = self.distribution.write_record(&segment) {
                tracing::warn!(error = %e, file = record.file_name.as_str(), "Failed to write distribution log record");
                return;
            }
        }
    }
}

/// Handles onto the buffers behind [`Logs::memory`]
#[derive(Clone, Default)]
pub struct MemoryLogs {
    pub system: Arc<MemorySink>,
    pub maintainer: Arc<MemorySink>,
    pub event: Arc<MemorySink>,
    pub transfer: Arc<MemorySink>,
    pub delete: Arc<MemorySink>,
    pub distribution: Arc<MemorySink>,
}

impl MemoryLogs {
    pub fn delete_records(&self) -> Vec<DeleteRecord> {
        self.delete
            .records()
            .iter()
            .filter_map(|r| DeleteRecord::decode(r).ok().map(|(rec, _)| rec))
            .collect()
    }

    pub fn distribution_records(&self) -> Vec<DistributionRecord> {
        self.distribution
            .records()
            .iter()
            .filter_map(|r| DistributionRecord::decode(r).ok().map(|(rec, _)| rec))
            .collect()
    }
}
