//! Reading end of the log FIFOs.
//!
//! One task per FIFO reads whatever arrives and appends it to
//! `log/<NAME>.0`. Text logs are copied as they are; binary records are
//! reassembled across partial reads and written as one text line each.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::watch;
use tokio::task::JoinSet;

use afd_config::path::LOG_FIFOS;
use afd_config::{log_pipeline_debug, log_pipeline_warn, WorkDir};
use afd_ipc::fifo::make_fifo;

use crate::{DeleteRecord, DistributionRecord, LogError, Result, PIPE_BUF};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text,
    Delete,
    Distribution,
}

impl Format {
    fn of(fifo: &str) -> Self {
        match fifo {
            "delete.log" => Format::Delete,
            "distribution.log" => Format::Distribution,
            _ => Format::Text,
        }
    }
}

/// `delete.log` -> `DELETE_LOG.0`
pub fn log_file_name(fifo: &str) -> String {
    format!("{}.0", fifo.to_uppercase().replace('.', "_"))
}

#[derive(Debug, Clone)]
pub struct LogDrain {
    fifo_dir: PathBuf,
    log_dir: PathBuf,
}

impl LogDrain {
    pub fn new(work_dir: &WorkDir) -> Self {
        Self {
            fifo_dir: work_dir.fifo_dir(),
            log_dir: work_dir.log_dir(),
        }
    }

    /// Drain every log FIFO until `shutdown` turns true
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let mut tasks = JoinSet::new();
        for name in LOG_FIFOS {
            let fifo = self.fifo_dir.join(name);
            let target = self.log_dir.join(log_file_name(name));
            let shutdown = shutdown.clone();
            tasks.spawn(drain_one(fifo, target, Format::of(name), shutdown));
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log_pipeline_warn!("Log drain task failed", error = e.to_string()),
                Err(e) => log_pipeline_warn!("Log drain task panicked", error = e.to_string()),
            }
        }
        Ok(())
    }
}

async fn drain_one(
    fifo: PathBuf,
    target: PathBuf,
    format: Format,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    make_fifo(&fifo)?;
    let mut rx = pipe::OpenOptions::new().read_write(true).open_receiver(&fifo)?;
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; PIPE_BUF * 4];

    log_pipeline_debug!("Draining log FIFO", fifo = fifo.display().to_string());
    loop {
        tokio::select! {
            read = rx.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    continue;
                }
                pending.extend_from_slice(&buf[..n]);
                let out = render(format, &mut pending);
                if !out.is_empty() {
                    append(&target, &out).await?;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Whatever the writers managed to queue before shutdown
    while let Ok(n) = rx.try_read(&mut buf) {
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);
    }
    let out = render(format, &mut pending);
    if !out.is_empty() {
        append(&target, &out).await?;
    }
    Ok(())
}

/// Turn complete records at the front of `pending` into log text,
/// leaving an incomplete tail in place
fn render(format: Format, pending: &mut Vec<u8>) -> Vec<u8> {
    match format {
        Format::Text => std::mem::take(pending),
        Format::Delete => render_records(pending, |b| {
            DeleteRecord::decode(b).map(|(r, n)| (r.to_string(), n))
        }),
        Format::Distribution => render_records(pending, |b| {
            DistributionRecord::decode(b).map(|(r, n)| (r.to_string(), n))
        }),
    }
}

fn render_records<F>(pending: &mut Vec<u8>, decode: F) -> Vec<u8>
where
    F: Fn(&[u8]) -> Result<(String, usize)>,
{
    let mut out = Vec::new();
    let mut used = 0;
    while used < pending.len() {
        match decode(&pending[used..]) {
            Ok((line, n)) => {
                out.extend_from_slice(line.as_bytes());
                out.push(b'\n');
                used += n;
            }
            Err(LogError::Incomplete) => break,
            Err(e) => {
                // Lost framing; nothing after this point can be trusted
                log_pipeline_warn!(
                    "Discarding undecodable log bytes",
                    error = e.to_string(),
                    bytes = pending.len() - used
                );
                used = pending.len();
            }
        }
    }
    pending.drain(..used);
    out
}

async fn append(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeleteReason, DistributionType, FifoSink, RecordSink};
    use std::time::Duration;

    #[test]
    fn test_log_file_name() {
        assert_eq!(log_file_name("delete.log"), "DELETE_LOG.0");
        assert_eq!(log_file_name("trans_db.log"), "TRANS_DB_LOG.0");
    }

    #[test]
    fn test_partial_binary_record_waits_for_rest() {
        let bytes = DeleteRecord::new(DeleteReason::UnknownFile, "junk", 3).encode();
        let (head, tail) = bytes.split_at(20);

        let mut pending = head.to_vec();
        assert!(render(Format::Delete, &mut pending).is_empty());
        assert_eq!(pending.len(), 20);

        pending.extend_from_slice(tail);
        let out = String::from_utf8(render(Format::Delete, &mut pending)).unwrap();
        assert!(out.contains("junk"));
        assert!(out.contains("unknown file"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_garbage_is_discarded() {
        let mut pending = vec![0xffu8; 64];
        assert!(render(Format::Distribution, &mut pending).is_empty());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_drain_writes_log_files() {
        let temp = tempfile::tempdir().unwrap();
        let work_dir = WorkDir::new(temp.path());
        work_dir.create_layout().unwrap();

        let (tx, rx) = watch::channel(false);
        let drain = tokio::spawn(LogDrain::new(&work_dir).run(rx));

        let system = FifoSink::open(&work_dir.fifo("system.log")).unwrap();
        system.write_record(b"07 03 09:05:01 <I> AFD started\n").unwrap();
        let dist = FifoSink::open(&work_dir.fifo("distribution.log")).unwrap();
        let rec = DistributionRecord::new(DistributionType::Normal, "a.bin", 10, 0xd1, 1, 1)
            .with_jobs(vec![0xab]);
        for seg in rec.encode_segments() {
            dist.write_record(&seg).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        drain.await.unwrap().unwrap();

        let system_log = std::fs::read_to_string(work_dir.log_dir().join("SYSTEM_LOG.0")).unwrap();
        assert!(system_log.contains("<I> AFD started"));
        let dist_log =
            std::fs::read_to_string(work_dir.log_dir().join("DISTRIBUTION_LOG.0")).unwrap();
        assert!(dist_log.starts_with("a.bin 10 d1"));
        assert!(dist_log.trim_end().ends_with(" ab"));
    }
}
