//! # afd-amg
//!
//! The message generator: turns configuration into catalogs and files in
//! source directories into messages.
//!
//! ## Flow
//!
//! 1. [`catalog::Catalog::build`] reads `DIR_CONFIG`/`HOST_CONFIG`, fills
//!    the ID catalogs and brings FSA and FRA in line.
//! 2. [`Amg::scan_all`] lists every source directory, moves matching
//!    files into a pool directory ([`pool`]) and fans them out into one
//!    message per job under `files/outgoing/`.
//! 3. Each message is handed to the dispatcher as a [`NewMessage`].
//!
//! Files for hosts whose queue is paused wait in `.<alias>` below the
//! source directory ([`paused`]); files for `time` jobs wait under
//! `files/time/` ([`time_job`]). On start [`recovery`] returns what a
//! crash left in the pool.

pub mod amg;
pub mod catalog;
pub mod counter;
pub mod crontab;
pub mod dupcheck;
pub mod fsops;
pub mod message;
pub mod options;
pub mod paused;
pub mod pool;
pub mod recovery;
pub mod scan;
pub mod time_job;
pub mod watch;

pub use amg::{Amg, AmgCommand};
pub use catalog::{Catalog, DirJobs, JobSpec};
pub use counter::UniqueCounter;
pub use dupcheck::{CrcStore, DupAction, Verdict};
pub use message::{MessageName, NewMessage};
pub use pool::{PoolManager, PoolName};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AmgError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Status(#[from] afd_status::StatusError),

    #[error(transparent)]
    Catalog(#[from] afd_catalog::CatalogError),

    #[error(transparent)]
    Log(#[from] afd_log::LogError),

    #[error("System error: {0}")]
    Nix(#[from] nix::Error),

    #[error("Watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("{parent}: link count limit of {limit} reached")]
    LinkLimit { parent: String, limit: u32 },

    #[error("Invalid crontab `{spec}`: {reason}")]
    Crontab { spec: String, reason: String },

    #[error("Invalid pool directory name {0}")]
    PoolName(String),

    #[error("Local option `{option}` failed: {reason}")]
    Option { option: String, reason: String },

    #[error("Dispatcher channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, AmgError>;
