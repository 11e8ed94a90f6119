//! # afd-status
//!
//! Shared state substrate of the AFD core.
//!
//! Every structure cooperating processes share lives in a file that starts
//! with the 16-byte word-offset header ([`header`]) followed by fixed-size
//! records, mapped with `memmap2` ([`area::MappedArea`]) and guarded by
//! `fcntl` byte-range locks ([`lock`]). On top of that sit the two status
//! areas: the FSA (hosts, [`fsa`]) and the FRA (directories, [`fra`]), plus
//! the `HOST_CONFIG` file the FSA is built from.

pub mod area;
pub mod fra;
pub mod fsa;
pub mod header;
pub mod host_config;
pub mod idfile;
pub mod lock;
pub mod text;

pub use area::{AreaSpec, Converter, MappedArea, Record};
pub use fra::{DirectoryStatus, Fra};
pub use fsa::{Fsa, HostEntry, JobStatus};
pub use header::{WordOffsetHeader, AFD_WORD_OFFSET};
pub use host_config::HostConfigEntry;
pub use lock::{AreaLock, LockKind, LockWait};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System error: {0}")]
    Nix(#[from] nix::Error),

    #[error("{path}: unknown version {found} (expected {expected}) and no converter applies")]
    UnknownVersion {
        path: String,
        found: u8,
        expected: u8,
    },

    #[error("Conversion failed: {0}")]
    Convert(String),

    #[error("Region is locked by another process")]
    WouldBlock,

    #[error("ID file changed from {expected} to {found} while attached")]
    IdChanged { expected: i32, found: i32 },

    #[error("Record {index} out of range (count {count})")]
    OutOfRange { index: usize, count: usize },

    #[error("HOST_CONFIG line {line}: {reason}")]
    HostConfig { line: usize, reason: String },

    #[error("Unknown host alias {0}")]
    UnknownHost(String),
}

pub type Result<T> = std::result::Result<T, StatusError>;
