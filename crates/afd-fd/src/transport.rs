//! Transport workers.
//!
//! The dispatcher never speaks FTP or SFTP itself. It opens a [`Session`]
//! for a host through a [`Transport`] and hands it one message at a time.
//! A session stays open between messages so a burst can reuse it.
//!
//! [`ProcessTransport`] runs the worker program configured for the URL
//! scheme (`[transport] workers` in `AFD_CONFIG`) as a child process:
//!
//! ```text
//! argv:   <program> <work-dir> <host-alias> <hostname>
//! stdin:  <message-dir>\t<recipient>\n        one line per message
//! stdout: OK <files> <bytes>\n | ERR <reason>\n   one line per message
//! ```
//!
//! Closing stdin ends the session.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use afd_config::{log_fd_debug, WorkDir};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::{FdError, Result};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Where a session connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub host_alias: String,
    /// Real hostname currently selected by the toggle
    pub hostname: String,
    pub scheme: String,
    /// Seconds one message may take, 0 = no limit
    pub transfer_timeout: u64,
}

/// One message handed to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub msg_name: String,
    pub msg_dir: PathBuf,
    pub job_id: u32,
    pub recipient: String,
    pub files: u32,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Sent { files: u32, bytes: u64 },
    Failed { reason: String },
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Sent { .. })
    }
}

pub trait Session: Send {
    /// PID of the worker process, if there is one
    fn pid(&self) -> Option<u32>;

    fn transfer<'a>(&'a mut self, request: &'a TransferRequest) -> BoxFuture<'a, TransferOutcome>;

    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

pub trait Transport: Send + Sync {
    fn open(&self, target: &SessionTarget) -> Result<Box<dyn Session>>;
}

/// Scheme of a recipient URL (`ftp` for `ftp://u@h/`)
pub fn scheme_of(recipient: &str) -> &str {
    recipient.split_once("://").map(|(s, _)| s).unwrap_or("")
}

/// Starts the configured worker program per scheme
#[derive(Debug, Clone)]
pub struct ProcessTransport {
    work_dir: WorkDir,
    workers: BTreeMap<String, String>,
}

impl ProcessTransport {
    pub fn new(work_dir: WorkDir, workers: BTreeMap<String, String>) -> Self {
        Self { work_dir, workers }
    }
}

impl Transport for ProcessTransport {
    fn open(&self, target: &SessionTarget) -> Result<Box<dyn Session>> {
        let program = self
            .workers
            .get(&target.scheme)
            .ok_or_else(|| FdError::NoWorker(target.scheme.clone()))?;

        let mut child = Command::new(program)
            .arg(self.work_dir.root())
            .arg(&target.host_alias)
            .arg(&target.hostname)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FdError::Spawn {
                program: program.clone(),
                source: e,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(FdError::Spawn {
                program: program.clone(),
                source: std::io::Error::other("worker pipes unavailable"),
            });
        };
        log_fd_debug!(
            "Worker started",
            host = target.host_alias.as_str(),
            program = program.as_str(),
            pid = child.id().unwrap_or(0)
        );
        Ok(Box::new(ProcessSession {
            child,
            stdin: Some(stdin),
            replies: BufReader::new(stdout).lines(),
            timeout: (target.transfer_timeout > 0).then(|| Duration::from_secs(target.transfer_timeout)),
        }))
    }
}

pub struct ProcessSession {
    child: Child,
    stdin: Option<ChildStdin>,
    replies: Lines<BufReader<ChildStdout>>,
    timeout: Option<Duration>,
}

/// Parse one reply line of a worker
pub fn parse_reply(line: &str) -> TransferOutcome {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("OK") => {
            let files = words.next().and_then(|w| w.parse().ok());
            let bytes = words.next().and_then(|w| w.parse().ok());
            match (files, bytes) {
                (Some(files), Some(bytes)) => TransferOutcome::Sent { files, bytes },
                _ => TransferOutcome::Failed {
                    reason: format!("malformed reply `{}`", line),
                },
            }
        }
        Some("ERR") => TransferOutcome::Failed {
            reason: line.trim_start()[3..].trim().to_string(),
        },
        _ => TransferOutcome::Failed {
            reason: format!("malformed reply `{}`", line),
        },
    }
}

impl ProcessSession {
    async fn exchange(&mut self, request: &TransferRequest) -> TransferOutcome {
        let Some(stdin) = self.stdin.as_mut() else {
            return TransferOutcome::Failed {
                reason: "session closed".into(),
            };
        };
        let line = format!("{}\t{}\n", request.msg_dir.display(), request.recipient);
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            return TransferOutcome::Failed {
                reason: format!("worker stdin: {}", e),
            };
        }
        if let Err(e) = stdin.flush().await {
            return TransferOutcome::Failed {
                reason: format!("worker stdin: {}", e),
            };
        }
        match self.replies.next_line().await {
            Ok(Some(reply)) => parse_reply(&reply),
            Ok(None) => TransferOutcome::Failed {
                reason: "worker exited".into(),
            },
            Err(e) => TransferOutcome::Failed {
                reason: format!("worker stdout: {}", e),
            },
        }
    }
}

impl Session for ProcessSession {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn transfer<'a>(&'a mut self, request: &'a TransferRequest) -> BoxFuture<'a, TransferOutcome> {
        Box::pin(async move {
            match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, self.exchange(request)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        let _ = self.child.start_kill();
                        self.stdin = None;
                        TransferOutcome::Failed {
                            reason: format!("transfer timeout after {}s", limit.as_secs()),
                        }
                    }
                },
                None => self.exchange(request).await,
            }
        })
    }

    fn close(mut self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.stdin = None;
            match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = self.child.kill().await;
                }
            }
        })
    }
}
