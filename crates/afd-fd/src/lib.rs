//! # afd-fd
//!
//! The dispatcher: keeps the message queue, picks the next message a host
//! may take and hands it to a transport worker session.
//!
//! - [`queue`]: persistent queue ordered by priority and age
//! - [`cache`]: per-job host data the dispatcher looks up on every pass
//! - [`transport`]: the worker seam, one session per job slot of a host
//! - [`fd::Fd`]: ties them together with the FSA

pub mod action;
pub mod backoff;
pub mod burst;
pub mod cache;
pub mod fd;
pub mod queue;
pub mod transport;

pub use cache::{CacheEntry, MessageCache};
pub use fd::{Fd, Recovery, SlotKey, WorkerEvent};
pub use queue::{MsgQueue, QueueEntry};
pub use transport::{ProcessTransport, Session, SessionTarget, TransferOutcome, TransferRequest, Transport};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Status(#[from] afd_status::StatusError),

    #[error(transparent)]
    Catalog(#[from] afd_catalog::CatalogError),

    #[error(transparent)]
    Log(#[from] afd_log::LogError),

    #[error(transparent)]
    Ipc(#[from] afd_ipc::IpcError),

    #[error("System error: {0}")]
    Nix(#[from] nix::Error),

    #[error("No transport worker configured for scheme `{0}`")]
    NoWorker(String),

    #[error("Failed to start worker {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Dispatcher is already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, FdError>;
