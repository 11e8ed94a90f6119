//! Destinations for encoded log records.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use afd_config::log_pipeline_warn;
use afd_ipc::fifo::make_fifo;

use crate::{LogError, Result, PIPE_BUF};

/// Receives whole records; one call is one atomic unit for the reader
pub trait RecordSink: Send + Sync {
    fn write_record(&self, bytes: &[u8]) -> Result<()>;
}

/// Writing end of a log FIFO.
///
/// Opened read-write so a missing reader never turns writes into `EPIPE`;
/// records simply queue in the pipe until the drain picks them up. When the
/// pipe is full the record is dropped and counted.
#[derive(Debug)]
pub struct FifoSink {
    file: File,
    path: PathBuf,
    dropped: AtomicU64,
}

impl FifoSink {
    pub fn open(path: &Path) -> Result<Self> {
        make_fifo(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl RecordSink for FifoSink {
    fn write_record(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > PIPE_BUF {
            return Err(LogError::TooLong(bytes.len()));
        }
        loop {
            match (&self.file).write(bytes) {
                Ok(n) if n == bytes.len() => return Ok(()),
                Ok(n) => {
                    return Err(LogError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short write of {} of {} bytes", n, bytes.len()),
                    )))
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    log_pipeline_warn!(
                        "Log FIFO full, record dropped",
                        fifo = self.path.display().to_string(),
                        dropped = dropped
                    );
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Vec<u8>>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<Vec<u8>> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Records interpreted as text lines
    pub fn lines(&self) -> Vec<String> {
        self.records()
            .iter()
            .map(|r| String::from_utf8_lossy(r).trim_end().to_string())
            .collect()
    }
}

impl RecordSink for MemorySink {
    fn write_record(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > PIPE_BUF {
            return Err(LogError::TooLong(bytes.len()));
        }
        if let Ok(mut records) = self.records.lock() {
            records.push(bytes.to_vec());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_fifo_sink_without_reader() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("system.log");
        let sink = FifoSink::open(&path).unwrap();
        sink.write_record(b"one\n").unwrap();
        sink.write_record(b"two\n").unwrap();

        let mut reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .unwrap();
        let mut buf = [0u8; 64];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one\ntwo\n");
    }

    #[test]
    fn test_oversized_record_rejected() {
        let sink = MemorySink::default();
        let big = vec![b'x'; PIPE_BUF + 1];
        assert!(matches!(sink.write_record(&big), Err(LogError::TooLong(_))));
        assert!(sink.records().is_empty());
    }
}
