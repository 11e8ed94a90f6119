//! FIFO transport for the command protocol.
//!
//! Readers open their FIFO read-write so they never observe EOF when the
//! last writer goes away. Writers open write-only and non-blocking, which
//! fails with `ENXIO` when nobody is reading: that is how callers detect a
//! dead peer without waiting for a timeout.

use std::fs::OpenOptions;
use std::io::{self, Read};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::stat::Mode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tracing::debug;

use afd_config::path::{AFD_CMD_FIFO, AFD_RESP_FIFO};
use afd_config::WorkDir;

use crate::{IpcError, Result};

/// Create a FIFO at `path`, replacing any non-FIFO file of the same name
pub fn make_fifo(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(()),
        Ok(_) => std::fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)?;
    Ok(())
}

/// Read and discard everything currently buffered in a FIFO.
///
/// Returns the number of bytes removed.
pub fn drain_fifo(path: &Path) -> io::Result<usize> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    let mut buf = [0u8; 512];
    let mut total = 0;
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Write `bytes` to the FIFO at `path` in one call
pub async fn send_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tx = match pipe::OpenOptions::new().open_sender(path) {
        Ok(tx) => tx,
        Err(e)
            if e.raw_os_error() == Some(libc::ENXIO) || e.kind() == io::ErrorKind::NotFound =>
        {
            return Err(IpcError::NoReader(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    tx.write_all(bytes).await?;
    Ok(())
}

/// Client side of a command/response FIFO pair
#[derive(Debug, Clone)]
pub struct CommandChannel {
    cmd: PathBuf,
    resp: PathBuf,
}

impl CommandChannel {
    pub fn new(cmd: impl Into<PathBuf>, resp: impl Into<PathBuf>) -> Self {
        Self {
            cmd: cmd.into(),
            resp: resp.into(),
        }
    }

    /// afd.cmd / afd.resp of a work directory
    pub fn afd(work_dir: &WorkDir) -> Self {
        Self::new(work_dir.fifo(AFD_CMD_FIFO), work_dir.fifo(AFD_RESP_FIFO))
    }

    /// Fire-and-forget write to the command FIFO
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        send_bytes(&self.cmd, bytes).await
    }

    /// Send one command byte and wait up to `timeout` for one reply byte.
    ///
    /// On timeout our own command is drained back out of the command FIFO
    /// so a later caller's re-send is not answered with our reply.
    pub async fn request(&self, cmd: u8, timeout: Duration) -> Result<u8> {
        make_fifo(&self.resp)?;
        let mut rx = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&self.resp)?;

        // Stale replies from an earlier, abandoned request
        let mut stale = [0u8; 64];
        while let Ok(n) = rx.try_read(&mut stale) {
            if n == 0 {
                break;
            }
            debug!(bytes = n, "Discarded stale response bytes");
        }

        self.send(&[cmd]).await?;

        let mut reply = [0u8; 1];
        match tokio::time::timeout(timeout, rx.read_exact(&mut reply)).await {
            Ok(Ok(_)) => Ok(reply[0]),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                let drained = drain_fifo(&self.cmd).unwrap_or(0);
                debug!(drained, cmd, "Response timeout, drained own command");
                Err(IpcError::Timeout(timeout.as_secs()))
            }
        }
    }
}

/// Server side: reads a command FIFO and answers on its response FIFO
pub struct CommandListener {
    rx: pipe::Receiver,
    resp: Option<PathBuf>,
}

impl CommandListener {
    /// Create the FIFOs if needed and open the command side for reading
    pub fn open(cmd: &Path, resp: Option<&Path>) -> Result<Self> {
        make_fifo(cmd)?;
        if let Some(resp) = resp {
            make_fifo(resp)?;
        }
        let rx = pipe::OpenOptions::new().read_write(true).open_receiver(cmd)?;
        Ok(Self {
            rx,
            resp: resp.map(Path::to_path_buf),
        })
    }

    /// Wait for at least one byte and return everything available
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 512];
        let n = self.rx.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Reply one byte on the response FIFO
    pub async fn reply(&self, byte: u8) -> Result<()> {
        match &self.resp {
            Some(resp) => send_bytes(resp, &[byte]).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ACKN, IS_ALIVE, SHUTDOWN};
    use tempfile::tempdir;

    #[test]
    fn test_make_fifo_replaces_regular_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("afd.cmd");
        std::fs::write(&path, b"junk").unwrap();

        make_fifo(&path).unwrap();
        let meta = std::fs::symlink_metadata(&path).unwrap();
        assert!(meta.file_type().is_fifo());

        // Second call is a no-op
        make_fifo(&path).unwrap();
    }

    #[tokio::test]
    async fn test_send_without_reader_reports_no_reader() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("afd.cmd");
        make_fifo(&path).unwrap();

        let result = send_bytes(&path, &[SHUTDOWN]).await;
        assert!(matches!(result, Err(IpcError::NoReader(_))));

        let missing = temp.path().join("missing.cmd");
        let result = send_bytes(&missing, &[SHUTDOWN]).await;
        assert!(matches!(result, Err(IpcError::NoReader(_))));
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let temp = tempdir().unwrap();
        let cmd = temp.path().join("afd.cmd");
        let resp = temp.path().join("afd.resp");

        let mut listener = CommandListener::open(&cmd, Some(&resp)).unwrap();
        let server = tokio::spawn(async move {
            let bytes = listener.recv().await.unwrap();
            assert_eq!(bytes, vec![IS_ALIVE]);
            listener.reply(ACKN).await.unwrap();
        });

        let channel = CommandChannel::new(&cmd, &resp);
        let reply = channel
            .request(IS_ALIVE, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, ACKN);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_drains_own_command() {
        let temp = tempdir().unwrap();
        let cmd = temp.path().join("afd.cmd");
        let resp = temp.path().join("afd.resp");

        // A reader exists but never answers
        let mut listener = CommandListener::open(&cmd, Some(&resp)).unwrap();

        let channel = CommandChannel::new(&cmd, &resp);
        let result = channel
            .request(SHUTDOWN, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(IpcError::Timeout(_))));

        // Our SHUTDOWN byte must be gone
        let pending =
            tokio::time::timeout(Duration::from_millis(100), listener.recv()).await;
        assert!(pending.is_err());
    }
}
