//! # afd-daemon
//!
//! The supervisor behind `afdd`. It owns the active lock, creates the
//! FIFOs, runs the generator and the dispatcher as tasks and answers on
//! `afd.cmd` until told to shut down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use afd_amg::{Amg, AmgCommand};
use afd_config::path::{
    AFD_ACTIVE_FILE, AFD_CMD_FIFO, AFD_RESP_FIFO, AMG_CMD_FIFO, FD_CMD_FIFO, IP_FIN_FIFO, LOG_FIFOS,
    PROBE_ONLY_FIFO,
};
use afd_config::{log_afd_debug, log_afd_error, log_afd_info, log_afd_warn, Config, WorkDir};
use afd_fd::{Fd, ProcessTransport};
use afd_ipc::fifo::make_fifo;
use afd_ipc::{ActiveLock, AfdCommand, CommandListener, FdCommand, ACKN, REREAD_CONFIG};
use afd_log::drain::LogDrain;
use afd_log::Logs;

/// What the supervisor does with one byte read from `afd.cmd`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Answer with ACKN and keep running
    Acknowledge,
    /// Answer with ACKN and trigger a full directory scan
    AcknowledgeAndScan,
    /// Answer with ACKN, then stop
    Shutdown,
    /// Nothing to answer
    Ignore,
}

pub fn react(byte: u8) -> Reaction {
    match AfdCommand::from_byte(byte) {
        Some(AfdCommand::IsAlive) | Some(AfdCommand::StartAfdNoDirScan) => Reaction::Acknowledge,
        Some(AfdCommand::StartAfd) => Reaction::AcknowledgeAndScan,
        Some(AfdCommand::Shutdown) => Reaction::Shutdown,
        Some(AfdCommand::AmgReady) | Some(AfdCommand::Ackn) | None => Reaction::Ignore,
    }
}

fn create_fifos(work_dir: &WorkDir) -> Result<()> {
    let names = [AFD_CMD_FIFO, AFD_RESP_FIFO, AMG_CMD_FIFO, FD_CMD_FIFO, IP_FIN_FIFO, PROBE_ONLY_FIFO];
    for name in names.iter().chain(LOG_FIFOS.iter()) {
        let path = work_dir.fifo(name);
        make_fifo(&path).with_context(|| format!("creating FIFO {}", path.display()))?;
    }
    Ok(())
}

/// Turn `amg.cmd` bytes into generator commands
async fn forward_amg_commands(mut listener: CommandListener, tx: mpsc::Sender<AmgCommand>) -> Result<()> {
    loop {
        for byte in listener.recv().await? {
            let cmd = match byte {
                REREAD_CONFIG => AmgCommand::RereadConfig,
                other => {
                    log_afd_warn!("Unknown command on amg.cmd", byte = other);
                    continue;
                }
            };
            if tx.send(cmd).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Turn `fd.cmd` bytes into dispatcher commands; a partial command waits
/// for the rest of its bytes
async fn forward_fd_commands(mut listener: CommandListener, tx: mpsc::Sender<FdCommand>) -> Result<()> {
    let mut pending: Vec<u8> = Vec::new();
    loop {
        pending.extend(listener.recv().await?);
        match FdCommand::decode_all(&pending) {
            Ok((cmds, used)) => {
                pending.drain(..used);
                for cmd in cmds {
                    if tx.send(cmd).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                log_afd_warn!("Discarding bad fd.cmd input", error = e.to_string().as_str());
                pending.clear();
            }
        }
    }
}

async fn join_until<E: std::fmt::Display>(name: &str, handle: JoinHandle<Result<(), E>>, deadline: Instant) {
    let abort = handle.abort_handle();
    match tokio::time::timeout_at(deadline, handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => log_afd_error!("Task ended with error", task = name, error = e.to_string().as_str()),
        Ok(Err(e)) => log_afd_error!("Task failed", task = name, error = e.to_string().as_str()),
        Err(_) => {
            log_afd_warn!("Task did not stop in time", task = name);
            abort.abort();
        }
    }
}

/// Run the AFD in `work_dir` until a shutdown request or signal.
pub async fn run(work_dir: WorkDir, config: Config, scan_at_start: bool) -> Result<()> {
    work_dir.create_layout().context("creating work directory layout")?;
    let active_path = work_dir.fifo(AFD_ACTIVE_FILE);
    let Some(active) = ActiveLock::acquire(&active_path)? else {
        let pid = ActiveLock::probe(&active_path)?.unwrap_or(0);
        bail!("AFD already active in {} (pid {})", work_dir.root().display(), pid);
    };
    create_fifos(&work_dir)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let drain = tokio::spawn(LogDrain::new(&work_dir).run(shutdown_rx.clone()));
    let logs = Logs::open(&work_dir).context("opening log FIFOs")?;
    logs.system.info(&format!("AFD starting in {}", work_dir.root().display()));

    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (amg_tx, amg_rx) = mpsc::channel(16);
    let (fd_tx, fd_rx) = mpsc::channel(64);

    let amg = Amg::open(work_dir.clone(), config.clone(), logs.clone(), msg_tx).context("starting generator")?;
    log_afd_info!("Generator ready");
    let transport = Arc::new(ProcessTransport::new(work_dir.clone(), config.transport.workers.clone()));
    let fd = Fd::open(work_dir.clone(), config.clone(), logs.clone(), transport).context("starting dispatcher")?;

    let mut amg_task = tokio::spawn(amg.run(amg_rx, shutdown_rx.clone(), scan_at_start));
    let mut fd_task = tokio::spawn(fd.run(msg_rx, fd_rx, shutdown_rx.clone()));
    let amg_listener = CommandListener::open(&work_dir.fifo(AMG_CMD_FIFO), None)?;
    let fd_listener = CommandListener::open(&work_dir.fifo(FD_CMD_FIFO), None)?;
    let amg_forward = tokio::spawn(forward_amg_commands(amg_listener, amg_tx.clone()));
    let fd_forward = tokio::spawn(forward_fd_commands(fd_listener, fd_tx));

    let mut afd_listener = CommandListener::open(&work_dir.fifo(AFD_CMD_FIFO), Some(&work_dir.fifo(AFD_RESP_FIFO)))?;
    let mut sigterm = signal(SignalKind::terminate())?;
    // Log rotation sends SIGHUP; it must not take the drain down
    let mut sighup = signal(SignalKind::hangup())?;
    log_afd_info!("AFD running", work_dir = work_dir.root().display().to_string().as_str());

    let mut amg_done = false;
    let mut fd_done = false;
    loop {
        tokio::select! {
            received = afd_listener.recv() => {
                let bytes = match received {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log_afd_error!("Lost afd.cmd", error = e.to_string().as_str());
                        logs.system.error("Cannot read afd.cmd, shutting down");
                        break;
                    }
                };
                let mut stop = false;
                for byte in bytes {
                    match react(byte) {
                        Reaction::Acknowledge => afd_listener.reply(ACKN).await.unwrap_or_else(reply_failed),
                        Reaction::AcknowledgeAndScan => {
                            let _ = amg_tx.send(AmgCommand::Rescan).await;
                            afd_listener.reply(ACKN).await.unwrap_or_else(reply_failed);
                        }
                        Reaction::Shutdown => {
                            afd_listener.reply(ACKN).await.unwrap_or_else(reply_failed);
                            stop = true;
                        }
                        Reaction::Ignore => {}
                    }
                }
                if stop {
                    log_afd_info!("Shutdown requested");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log_afd_info!("Interrupted");
                break;
            }
            _ = sigterm.recv() => {
                log_afd_info!("Terminated");
                break;
            }
            _ = sighup.recv() => {
                log_afd_debug!("Ignoring SIGHUP");
            }
            joined = &mut amg_task, if !amg_done => {
                amg_done = true;
                let reason = describe_exit(joined);
                log_afd_error!("Generator stopped unexpectedly", reason = reason.as_str());
                logs.system.error(&format!("Generator stopped ({}), shutting down", reason));
                break;
            }
            joined = &mut fd_task, if !fd_done => {
                fd_done = true;
                let reason = describe_exit(joined);
                log_afd_error!("Dispatcher stopped unexpectedly", reason = reason.as_str());
                logs.system.error(&format!("Dispatcher stopped ({}), shutting down", reason));
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    amg_forward.abort();
    fd_forward.abort();
    // Everything has to be down within one response time
    let deadline = Instant::now() + Duration::from_secs(config.afd.default_response_time.max(1));
    if !amg_done {
        join_until("generator", amg_task, deadline).await;
    }
    if !fd_done {
        join_until("dispatcher", fd_task, deadline).await;
    }
    logs.system.info("AFD stopped");
    join_until("log drain", drain, deadline.max(Instant::now() + Duration::from_secs(1))).await;

    active.release();
    log_afd_info!("AFD stopped");
    Ok(())
}

fn describe_exit<E: std::fmt::Display>(joined: Result<Result<(), E>, tokio::task::JoinError>) -> String {
    match joined {
        Ok(Ok(())) => "finished".to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(e) => e.to_string(),
    }
}

fn reply_failed(e: afd_ipc::IpcError) {
    log_afd_warn!("Failed to answer on afd.resp", error = e.to_string().as_str());
}

/// PID of the AFD running in `work_dir`, if any
pub fn active_pid(work_dir: &WorkDir) -> Result<Option<u32>> {
    Ok(ActiveLock::probe(&work_dir.fifo(AFD_ACTIVE_FILE))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use afd_ipc::{IS_ALIVE, SHUTDOWN, START_AFD, START_AFD_NO_DIR_SCAN};

    #[test]
    fn test_reactions() {
        assert_eq!(react(IS_ALIVE), Reaction::Acknowledge);
        assert_eq!(react(START_AFD_NO_DIR_SCAN), Reaction::Acknowledge);
        assert_eq!(react(START_AFD), Reaction::AcknowledgeAndScan);
        assert_eq!(react(SHUTDOWN), Reaction::Shutdown);
        assert_eq!(react(ACKN), Reaction::Ignore);
        assert_eq!(react(0x7f), Reaction::Ignore);
    }
}
