//! Starting and stopping the supervisor.

use std::io::{BufRead, IsTerminal, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::time::Instant;

use afd_config::path::{AFD_ACTIVE_FILE, AFD_CMD_FIFO, AMG_CMD_FIFO, FD_CMD_FIFO};
use afd_config::{Config, WorkDir};
use afd_ipc::fifo::drain_fifo;
use afd_ipc::{ActiveLock, CommandChannel, IpcError, ACKN, IS_ALIVE, SHUTDOWN};

use crate::exit::{INCORRECT, NO_ACTIVE_AFD, SUCCESS};
use crate::response_time;

const POLL: Duration = Duration::from_millis(100);

/// What to do with the leftovers of an AFD that does not answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purge {
    /// Ask on the terminal
    Ask,
    Always,
    Never,
}

impl Purge {
    pub fn from_flag(force: bool) -> Self {
        if force {
            Purge::Always
        } else if std::io::stdin().is_terminal() {
            Purge::Ask
        } else {
            Purge::Never
        }
    }

    fn confirm(self, pid: u32) -> Result<bool> {
        match self {
            Purge::Always => Ok(true),
            Purge::Never => Ok(false),
            Purge::Ask => {
                print!("Kill process {} and remove stale AFD resources? (y/n) ", pid);
                std::io::stdout().flush()?;
                let mut answer = String::new();
                std::io::stdin().lock().read_line(&mut answer)?;
                Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
            }
        }
    }
}

fn find_daemon() -> Result<PathBuf> {
    let current_exe = std::env::current_exe()?;
    let bin_dir = current_exe.parent().context("Failed to get bin dir")?;
    let daemon_bin = bin_dir.join("afdd");
    if daemon_bin.exists() {
        Ok(daemon_bin)
    } else {
        anyhow::bail!("Could not find afdd next to {}", current_exe.display())
    }
}

fn spawn_daemon(work_dir: &WorkDir, dir_scan: bool) -> Result<u32> {
    let daemon_bin = find_daemon()?;
    tracing::info!("Spawning daemon: {:?}", daemon_bin);

    let mut cmd = Command::new(&daemon_bin);
    cmd.arg("--work-dir").arg(work_dir.root());
    if !dir_scan {
        cmd.arg("--no-dir-scan");
    }
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .context("Failed to spawn afdd")?;
    Ok(child.id())
}

/// Start an AFD in `work_dir` and wait until it answers.
pub async fn start(work_dir: &WorkDir, config: &Config, dir_scan: bool) -> Result<u8> {
    if let Some(pid) = ActiveLock::probe(&work_dir.fifo(AFD_ACTIVE_FILE))? {
        println!("AFD already active in {} (pid {})", work_dir.root().display(), pid);
        return Ok(SUCCESS);
    }
    let pid = spawn_daemon(work_dir, dir_scan)?;
    if wait_alive(work_dir, response_time(config)).await? {
        println!("AFD started in {} (pid {})", work_dir.root().display(), pid);
        Ok(SUCCESS)
    } else {
        eprintln!("AFD is NOT responding");
        Ok(INCORRECT)
    }
}

/// Poll with IS_ALIVE until ACKN comes back or `limit` passes
pub async fn wait_alive(work_dir: &WorkDir, limit: Duration) -> Result<bool> {
    let channel = CommandChannel::afd(work_dir);
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        match channel.request(IS_ALIVE, Duration::from_millis(500)).await {
            Ok(ACKN) => return Ok(true),
            Ok(other) => tracing::debug!(reply = other, "Unexpected reply to IS_ALIVE"),
            Err(IpcError::NoReader(_)) | Err(IpcError::Timeout(_)) => {}
            Err(e) => return Err(e).context("Waiting for AFD"),
        }
        tokio::time::sleep(POLL).await;
    }
    Ok(false)
}

/// Wait until nobody holds the active lock
async fn wait_released(active: &Path, limit: Duration) -> Result<bool> {
    let deadline = Instant::now() + limit;
    loop {
        if ActiveLock::probe(active)?.is_none() {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Stop the AFD in `work_dir`.
///
/// Returns [`NO_ACTIVE_AFD`] when there is nothing to stop.
pub async fn shutdown(work_dir: &WorkDir, config: &Config, purge: Purge) -> Result<u8> {
    let active = work_dir.fifo(AFD_ACTIVE_FILE);
    let Some(pid) = ActiveLock::probe(&active)? else {
        println!("No AFD active in {}", work_dir.root().display());
        return Ok(NO_ACTIVE_AFD);
    };

    let limit = response_time(config);
    let channel = CommandChannel::afd(work_dir);
    match channel.request(SHUTDOWN, limit).await {
        Ok(ACKN) => {
            if wait_released(&active, limit).await? {
                println!("AFD stopped");
                return Ok(SUCCESS);
            }
        }
        Ok(other) => tracing::warn!(reply = other, "Unexpected reply to SHUTDOWN"),
        Err(IpcError::NoReader(_)) | Err(IpcError::Timeout(_)) => {
            // It may have gone down without answering
            if wait_released(&active, POLL).await? {
                println!("AFD stopped");
                return Ok(SUCCESS);
            }
        }
        Err(e) => return Err(e).context("Sending SHUTDOWN"),
    }

    eprintln!("AFD is NOT responding");
    if purge.confirm(pid)? {
        purge_stale(work_dir, pid).await?;
        println!("Removed stale AFD resources");
        Ok(SUCCESS)
    } else {
        Ok(INCORRECT)
    }
}

/// Kill the process holding the active lock and clear what it left behind
pub async fn purge_stale(work_dir: &WorkDir, pid: u32) -> Result<()> {
    let active = work_dir.fifo(AFD_ACTIVE_FILE);
    if pid != 0 && pid != std::process::id() {
        let target = Pid::from_raw(pid as i32);
        signal_process(target, Signal::SIGTERM)?;
        if !wait_released(&active, Duration::from_secs(2)).await? {
            signal_process(target, Signal::SIGKILL)?;
            wait_released(&active, Duration::from_secs(2)).await?;
        }
    }
    match std::fs::remove_file(&active) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Removing {}", active.display())),
    }
    // Commands nobody will ever read
    for name in [AFD_CMD_FIFO, AMG_CMD_FIFO, FD_CMD_FIFO] {
        let path = work_dir.fifo(name);
        if path.exists() {
            let drained = drain_fifo(&path).unwrap_or(0);
            tracing::debug!(fifo = name, bytes = drained, "Drained FIFO");
        }
    }
    Ok(())
}

fn signal_process(pid: Pid, signal: Signal) -> Result<()> {
    match kill(pid, signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Sending {} to {}", signal, pid)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afd_config::testing::TestEnvironment;

    #[tokio::test]
    async fn test_shutdown_without_afd_reports_no_active() {
        let env = TestEnvironment::new().unwrap();
        let mut config = Config::default();
        config.afd.default_response_time = 1;
        let code = shutdown(&env.work_dir, &config, Purge::Never).await.unwrap();
        assert_eq!(code, NO_ACTIVE_AFD);
    }

    #[tokio::test]
    async fn test_purge_removes_stale_lock_file() {
        let env = TestEnvironment::new().unwrap();
        let active = env.work_dir.fifo(AFD_ACTIVE_FILE);
        std::fs::write(&active, "0\n").unwrap();

        purge_stale(&env.work_dir, 0).await.unwrap();
        assert!(!active.exists());
    }

    #[tokio::test]
    async fn test_unresponsive_afd_is_reported() {
        let env = TestEnvironment::new().unwrap();
        let mut config = Config::default();
        config.afd.default_response_time = 1;
        // Lock held by this process, nothing reads afd.cmd
        let lock = ActiveLock::acquire(&env.work_dir.fifo(AFD_ACTIVE_FILE))
            .unwrap()
            .unwrap();

        let code = shutdown(&env.work_dir, &config, Purge::Never).await.unwrap();
        assert_eq!(code, INCORRECT);
        lock.release();
    }
}
