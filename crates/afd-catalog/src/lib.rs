//! # afd-catalog
//!
//! Content-addressed catalogs of the AFD core.
//!
//! Directories, file-mask lists, jobs and DIR_CONFIG files are all named by
//! a CRC-32 over their canonical bytes plus a disambiguation byte, so the
//! same configuration always produces the same IDs ([`checksum`]). The
//! crate also owns the text side of configuration: the `DIR_CONFIG`
//! parser, recipient URLs, the password vault and the wildcard matcher the
//! scanner uses.

pub mod checksum;
pub mod dcid;
pub mod dir_config;
pub mod dnb;
pub mod dupcheck;
pub mod filters;
pub mod fmd;
pub mod jid;
pub mod locked;
pub mod matcher;
pub mod recipient;
pub mod vault;

pub use checksum::{Checksum, Crc32};
pub use dcid::DirConfigIdDb;
pub use dir_config::{Destination, DirConfig, DirEntry, JobOptions};
pub use dnb::DirNameBuffer;
pub use dupcheck::DupCheckSpec;
pub use fmd::FileMaskDb;
pub use jid::{JobDefinition, JobIdDb, JobIdRecord};
pub use matcher::{first_matching_group, matches, pmatch, FileGroup, MatchResult};
pub use recipient::Recipient;
pub use vault::PasswordVault;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Status(#[from] afd_status::StatusError),

    #[error("System error: {0}")]
    Nix(#[from] nix::Error),

    #[error("No free ID after exhausting every disambiguation byte")]
    ChecksumExhausted,

    #[error("Corrupt catalog: {0}")]
    Corrupt(String),

    #[error("Invalid recipient {url}: {reason}")]
    Recipient { url: String, reason: String },

    #[error("DIR_CONFIG line {line}: {reason}")]
    DirConfig { line: usize, reason: String },

    #[error("{field} longer than {limit} bytes")]
    TooLong { field: &'static str, limit: usize },

    #[error("Password vault: {0}")]
    Vault(String),
}

pub type Result<T> = std::result::Result<T, CatalogError>;
