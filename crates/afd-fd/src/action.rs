//! Action scripts under `etc/action/target/<kind>/<alias>`.
//!
//! They are run with `start` when a host enters a state and `stop` when
//! it leaves it. A missing script is not an error.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Stdio;

use afd_config::path::{ActionKind, ActionTarget};
use afd_config::{log_fd_info, log_fd_warn, WorkDir};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPhase {
    Start,
    Stop,
}

impl ActionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionPhase::Start => "start",
            ActionPhase::Stop => "stop",
        }
    }
}

/// Executable script for `kind` and `alias`, if one is installed
pub fn action_script(work_dir: &WorkDir, kind: ActionKind, alias: &str) -> Option<PathBuf> {
    let path = work_dir.action_script(ActionTarget::Target, kind, alias);
    let meta = std::fs::metadata(&path).ok()?;
    (meta.is_file() && meta.permissions().mode() & 0o111 != 0).then_some(path)
}

/// Start the script in the background. Returns whether one was started.
///
/// Must be called from within a tokio runtime.
pub fn run_action(work_dir: &WorkDir, kind: ActionKind, alias: &str, phase: ActionPhase) -> bool {
    let Some(script) = action_script(work_dir, kind, alias) else {
        return false;
    };
    let mut child = match Command::new(&script)
        .arg(phase.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            log_fd_warn!(
                "Failed to run action script",
                script = script.display().to_string().as_str(),
                error = e.to_string().as_str()
            );
            return false;
        }
    };
    log_fd_info!(
        "Action script started",
        host = alias,
        script = script.display().to_string().as_str(),
        phase = phase.as_str()
    );
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
    true
}
