//! `afd host <action> <alias>`: flip a host's status bits in the FSA and
//! tell the dispatcher.
//!
//! The bits are set here as well so the change holds when no AFD runs;
//! `HOST_CONFIG` is written back so it also survives the next rebuild.

use anyhow::{Context, Result};
use clap::ValueEnum;

use afd_config::path::FD_CMD_FIFO;
use afd_config::WorkDir;
use afd_ipc::fifo::send_bytes;
use afd_ipc::{FdCommand, IpcError};
use afd_status::fsa::{ERROR_QUEUE_SET, HOST_DISABLED, PAUSE_QUEUE};
use afd_status::{host_config, Fsa};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HostAction {
    /// Stop dispatching, keep queueing
    Pause,
    Resume,
    /// Stop dispatching and drop everything queued for the host
    Disable,
    Enable,
    /// Forget the retry wait and leave the error queue
    Retry,
}

impl HostAction {
    /// Status bits to (set, clear)
    pub fn flags(self) -> (u32, u32) {
        match self {
            HostAction::Pause => (PAUSE_QUEUE, 0),
            HostAction::Resume => (0, PAUSE_QUEUE),
            HostAction::Disable => (HOST_DISABLED, 0),
            HostAction::Enable => (0, HOST_DISABLED),
            HostAction::Retry => (0, ERROR_QUEUE_SET),
        }
    }

    pub fn command(self, pos: i32) -> FdCommand {
        match self {
            HostAction::Pause => FdCommand::PauseQueue(pos),
            HostAction::Resume => FdCommand::ResumeQueue(pos),
            HostAction::Disable => FdCommand::DisableHost(pos),
            HostAction::Enable => FdCommand::EnableHost(pos),
            HostAction::Retry => FdCommand::Retry(pos),
        }
    }

    pub fn past_tense(self) -> &'static str {
        match self {
            HostAction::Pause => "paused",
            HostAction::Resume => "resumed",
            HostAction::Disable => "disabled",
            HostAction::Enable => "enabled",
            HostAction::Retry => "retrying",
        }
    }
}

/// Result of [`apply`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostChange {
    pub pos: usize,
    pub host_status: u32,
    /// Whether a running dispatcher received the command
    pub notified: bool,
}

/// Apply `action` to `alias`. `Ok(None)` when the FSA has no such host.
pub async fn apply(work_dir: &WorkDir, action: HostAction, alias: &str) -> Result<Option<HostChange>> {
    let mut fsa = Fsa::attach(work_dir).context("Attaching FSA")?;
    let Some(pos) = fsa.position(alias) else {
        return Ok(None);
    };
    let (set, clear) = action.flags();
    let host_status = fsa.change_status(pos, set, clear)?;
    fsa.flush()?;

    let host_config_path = work_dir.host_config();
    host_config::write(&host_config_path, &fsa.to_config())
        .with_context(|| format!("Writing {}", host_config_path.display()))?;

    let bytes = action.command(pos as i32).encode();
    let notified = match send_bytes(&work_dir.fifo(FD_CMD_FIFO), &bytes).await {
        Ok(()) => true,
        Err(IpcError::NoReader(_)) => false,
        Err(e) => return Err(e).context("Writing fd.cmd"),
    };
    tracing::debug!(host = alias, action = ?action, notified, "Host action applied");

    Ok(Some(HostChange {
        pos,
        host_status,
        notified,
    }))
}
