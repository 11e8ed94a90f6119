//! # afd-ipc
//!
//! Command protocol shared by the AFD supervisor, AMG, FD and external tools.
//!
//! Commands are single bytes written to a named FIFO under `fifodir/`;
//! replies come back as single bytes on the paired response FIFO. FD
//! commands that address a host append the FSA position as a native-endian
//! `i32`. The byte values are part of the external interface and must not
//! change.

pub mod active;
pub mod fifo;

pub use active::ActiveLock;
pub use fifo::{CommandChannel, CommandListener};

use thiserror::Error;

pub const START_AFD: u8 = 0x1;
pub const START_AFD_NO_DIR_SCAN: u8 = 0x2;
pub const SHUTDOWN: u8 = 0x3;
pub const AMG_READY: u8 = 0x4;
pub const IS_ALIVE: u8 = 0x5;
pub const ACKN: u8 = 0x6;

/// Re-read DIR_CONFIG / HOST_CONFIG (amg.cmd)
pub const REREAD_CONFIG: u8 = 0x10;

pub const FD_RETRY: u8 = 0x20;
pub const FD_PAUSE_QUEUE: u8 = 0x21;
pub const FD_RESUME_QUEUE: u8 = 0x22;
pub const FD_DISABLE_HOST: u8 = 0x23;
pub const FD_ENABLE_HOST: u8 = 0x24;
pub const FD_CHECK_FSA: u8 = 0x25;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System error: {0}")]
    Nix(#[from] nix::Error),

    #[error("No process is reading {0}")]
    NoReader(String),

    #[error("No response within {0} seconds")]
    Timeout(u64),

    #[error("Unexpected response byte {0:#x}")]
    UnexpectedResponse(u8),

    #[error("Unknown command byte {0:#x}")]
    UnknownCommand(u8),
}

pub type Result<T> = std::result::Result<T, IpcError>;

/// Commands understood on afd.cmd
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfdCommand {
    StartAfd,
    StartAfdNoDirScan,
    Shutdown,
    AmgReady,
    IsAlive,
    Ackn,
}

impl AfdCommand {
    pub fn to_byte(self) -> u8 {
        match self {
            AfdCommand::StartAfd => START_AFD,
            AfdCommand::StartAfdNoDirScan => START_AFD_NO_DIR_SCAN,
            AfdCommand::Shutdown => SHUTDOWN,
            AfdCommand::AmgReady => AMG_READY,
            AfdCommand::IsAlive => IS_ALIVE,
            AfdCommand::Ackn => ACKN,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            START_AFD => AfdCommand::StartAfd,
            START_AFD_NO_DIR_SCAN => AfdCommand::StartAfdNoDirScan,
            SHUTDOWN => AfdCommand::Shutdown,
            AMG_READY => AfdCommand::AmgReady,
            IS_ALIVE => AfdCommand::IsAlive,
            ACKN => AfdCommand::Ackn,
            _ => return None,
        })
    }
}

/// Commands understood on fd.cmd
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdCommand {
    Shutdown,
    /// Drop retry wait for a host and try again now
    Retry(i32),
    PauseQueue(i32),
    ResumeQueue(i32),
    DisableHost(i32),
    EnableHost(i32),
    /// Re-attach the FSA (after a reorder)
    CheckFsa,
}

impl FdCommand {
    pub fn encode(&self) -> Vec<u8> {
        let (cmd, pos) = match *self {
            FdCommand::Shutdown => (SHUTDOWN, None),
            FdCommand::Retry(p) => (FD_RETRY, Some(p)),
            FdCommand::PauseQueue(p) => (FD_PAUSE_QUEUE, Some(p)),
            FdCommand::ResumeQueue(p) => (FD_RESUME_QUEUE, Some(p)),
            FdCommand::DisableHost(p) => (FD_DISABLE_HOST, Some(p)),
            FdCommand::EnableHost(p) => (FD_ENABLE_HOST, Some(p)),
            FdCommand::CheckFsa => (FD_CHECK_FSA, None),
        };
        let mut buf = vec![cmd];
        if let Some(p) = pos {
            buf.extend_from_slice(&p.to_ne_bytes());
        }
        buf
    }

    /// Decode every complete command in `buf`.
    ///
    /// Returns the commands and the number of bytes consumed; an incomplete
    /// trailing command is left for the next read.
    pub fn decode_all(buf: &[u8]) -> Result<(Vec<FdCommand>, usize)> {
        let mut cmds = Vec::new();
        let mut pos = 0;
        while pos < buf.len() {
            let cmd = buf[pos];
            let needs_arg = matches!(
                cmd,
                FD_RETRY | FD_PAUSE_QUEUE | FD_RESUME_QUEUE | FD_DISABLE_HOST | FD_ENABLE_HOST
            );
            if needs_arg {
                if pos + 5 > buf.len() {
                    break;
                }
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&buf[pos + 1..pos + 5]);
                let host = i32::from_ne_bytes(raw);
                cmds.push(match cmd {
                    FD_RETRY => FdCommand::Retry(host),
                    FD_PAUSE_QUEUE => FdCommand::PauseQueue(host),
                    FD_RESUME_QUEUE => FdCommand::ResumeQueue(host),
                    FD_DISABLE_HOST => FdCommand::DisableHost(host),
                    _ => FdCommand::EnableHost(host),
                });
                pos += 5;
            } else {
                cmds.push(match cmd {
                    SHUTDOWN => FdCommand::Shutdown,
                    FD_CHECK_FSA => FdCommand::CheckFsa,
                    other => return Err(IpcError::UnknownCommand(other)),
                });
                pos += 1;
            }
        }
        Ok((cmds, pos))
    }
}
