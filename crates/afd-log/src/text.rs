//! Text audit logs.

use std::sync::Arc;

use afd_config::logging::{log_timestamp, Sign};
use chrono::Local;

use crate::sink::RecordSink;
use crate::PIPE_BUF;

/// Writes `"<dd mm HH:MM:SS> <X> text"` lines into one log
#[derive(Clone)]
pub struct TextLogger {
    sink: Arc<dyn RecordSink>,
}

impl std::fmt::Debug for TextLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextLogger").finish_non_exhaustive()
    }
}

impl TextLogger {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self { sink }
    }

    pub fn log(&self, sign: Sign, text: &str) {
        self.emit(format!("{} {} {}", log_timestamp(Local::now()), sign, text));
    }

    /// Transfer-log style line naming the host and the worker slot
    pub fn host(&self, sign: Sign, alias: &str, slot: Option<usize>, text: &str) {
        let slot = slot.map(|s| format!("[{}]", s)).unwrap_or_default();
        self.emit(format!(
            "{} {} {:<8}{}: {}",
            log_timestamp(Local::now()),
            sign,
            alias,
            slot,
            text
        ));
    }

    pub fn info(&self, text: &str) {
        self.log(Sign::Info, text)
    }

    pub fn warn(&self, text: &str) {
        self.log(Sign::Warn, text)
    }

    pub fn error(&self, text: &str) {
        self.log(Sign::Error, text)
    }

    pub fn config(&self, text: &str) {
        self.log(Sign::Config, text)
    }

    fn emit(&self, mut line: String) {
        if line.len() >= PIPE_BUF {
            let mut cut = PIPE_BUF - 1;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
        }
        line.push('\n');
        if let Err(e) = self.sink.write_record(line.as_bytes()) {
            tracing::warn!(error = %e, "Failed to write text log line");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    #[test]
    fn test_line_shape() {
        let sink = Arc::new(MemorySink::default());
        let log = TextLogger::new(sink.clone());
        log.warn("Directory /in is full");
        log.host(Sign::Info, "h1", Some(0), "3 files sent");

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        // "dd mm HH:MM:SS" is 14 characters
        assert_eq!(&lines[0][14..], " <W> Directory /in is full");
        assert_eq!(&lines[1][14..], " <I> h1      [0]: 3 files sent");
        assert!(sink.records()[0].ends_with(b"\n"));
    }

    #[test]
    fn test_long_line_is_cut_to_one_write() {
        let sink = Arc::new(MemorySink::default());
        let log = TextLogger::new(sink.clone());
        log.info(&"é".repeat(PIPE_BUF));
        let rec = &sink.records()[0];
        assert!(rec.len() <= PIPE_BUF);
        assert!(std::str::from_utf8(rec).is_ok());
    }
}
