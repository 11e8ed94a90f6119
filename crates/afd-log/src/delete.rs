//! Delete-log records.
//!
//! Every file the core removes without delivering it is accounted for with
//! one record:
//!
//! ```text
//! <file_size:i64><input_time:i64><job_id:u32><dir_id:u32><unique_number:u32>
//! <split_job_counter:u32><reason:u16><file_name_len:u16><host_len:u8>
//! <user_len:u8><extra_len:u16><host><file_name><user><extra>
//! ```

use std::fmt;

use crate::{LogError, Result, PIPE_BUF};

const FIXED_LEN: usize = 40;
pub const MAX_FILENAME_LENGTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DeleteReason {
    /// Queued message older than its job's age limit
    AgeOutput = 1,
    /// Input file older than the directory allows
    AgeInput = 2,
    UserDel = 3,
    /// Duplicate found while ingesting
    DupInput = 4,
    /// Duplicate found for one job
    DupOutput = 5,
    /// Deferred time job no longer matches any configured job
    JidLookupFailure = 6,
    UnknownFile = 7,
    OldLockedFile = 8,
    /// Pool directory left by a crash that could not be returned
    PoolRecovery = 9,
    /// Paused files removed because the host was disabled
    HostDisabled = 10,
    /// File sat in a paused directory for too long
    QueuedFileTimeout = 11,
    /// Queue entry whose message directory is gone
    MissingMessage = 12,
    /// Local option failed on the file
    OptionFailure = 13,
    /// Could not be handed to a job and not returned to its directory
    DistributionFailure = 14,
}

impl DeleteReason {
    pub fn from_code(code: u16) -> Option<Self> {
        use DeleteReason::*;
        Some(match code {
            1 => AgeOutput,
            2 => AgeInput,
            3 => UserDel,
            4 => DupInput,
            5 => DupOutput,
            6 => JidLookupFailure,
            7 => UnknownFile,
            8 => OldLockedFile,
            9 => PoolRecovery,
            10 => HostDisabled,
            11 => QueuedFileTimeout,
            12 => MissingMessage,
            13 => OptionFailure,
            14 => DistributionFailure,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteReason::AgeOutput => "age limit (output)",
            DeleteReason::AgeInput => "age limit (input)",
            DeleteReason::UserDel => "deleted by user",
            DeleteReason::DupInput => "duplicate (input)",
            DeleteReason::DupOutput => "duplicate (output)",
            DeleteReason::JidLookupFailure => "JID lookup failure",
            DeleteReason::UnknownFile => "unknown file",
            DeleteReason::OldLockedFile => "old locked file",
            DeleteReason::PoolRecovery => "pool directory recovery",
            DeleteReason::HostDisabled => "host disabled",
            DeleteReason::QueuedFileTimeout => "queued file timeout",
            DeleteReason::MissingMessage => "message missing",
            DeleteReason::OptionFailure => "option failure",
            DeleteReason::DistributionFailure => "distribution failure",
        }
    }
}

impl fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRecord {
    pub file_size: i64,
    pub input_time: i64,
    pub job_id: u32,
    pub dir_id: u32,
    pub unique_number: u32,
    pub split_job_counter: u32,
    pub reason: DeleteReason,
    pub host_alias: String,
    pub file_name: String,
    /// Process (and user) that deleted the file
    pub user: String,
    pub extra: String,
}

impl DeleteRecord {
    pub fn new(reason: DeleteReason, file_name: impl Into<String>, file_size: i64) -> Self {
        Self {
            file_size,
            input_time: 0,
            job_id: 0,
            dir_id: 0,
            unique_number: 0,
            split_job_counter: 0,
            reason,
            host_alias: String::new(),
            file_name: file_name.into(),
            user: String::new(),
            extra: String::new(),
        }
    }

    pub fn job(mut self, job_id: u32) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn dir(mut self, dir_id: u32) -> Self {
        self.dir_id = dir_id;
        self
    }

    pub fn host(mut self, alias: impl Into<String>) -> Self {
        self.host_alias = alias.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = extra.into();
        self
    }

    pub fn input(mut self, input_time: i64, unique_number: u32, split_job_counter: u32) -> Self {
        self.input_time = input_time;
        self.unique_number = unique_number;
        self.split_job_counter = split_job_counter;
        self
    }

    /// Encode, truncating strings so the record fits one atomic write
    pub fn encode(&self) -> Vec<u8> {
        let host = truncate(&self.host_alias, u8::MAX as usize);
        let name = truncate(&self.file_name, MAX_FILENAME_LENGTH);
        let user = truncate(&self.user, u8::MAX as usize);
        let room = PIPE_BUF - FIXED_LEN - host.len() - name.len() - user.len();
        let extra = truncate(&self.extra, room.min(u16::MAX as usize));

        let mut out = Vec::with_capacity(FIXED_LEN + host.len() + name.len() + user.len() + extra.len());
        out.extend_from_slice(&self.file_size.to_ne_bytes());
        out.extend_from_slice(&self.input_time.to_ne_bytes());
        out.extend_from_slice(&self.job_id.to_ne_bytes());
        out.extend_from_slice(&self.dir_id.to_ne_bytes());
        out.extend_from_slice(&self.unique_number.to_ne_bytes());
        out.extend_from_slice(&self.split_job_counter.to_ne_bytes());
        out.extend_from_slice(&(self.reason as u16).to_ne_bytes());
        out.extend_from_slice(&(name.len() as u16).to_ne_bytes());
        out.push(host.len() as u8);
        out.push(user.len() as u8);
        out.extend_from_slice(&(extra.len() as u16).to_ne_bytes());
        out.extend_from_slice(host);
        out.extend_from_slice(name);
        out.extend_from_slice(user);
        out.extend_from_slice(extra);
        out
    }

    /// Decode one record; returns it with the bytes consumed
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < FIXED_LEN {
            return Err(LogError::Incomplete);
        }
        let i64_at = |at: usize| i64::from_ne_bytes(array(&buf[at..at + 8]));
        let u32_at = |at: usize| u32::from_ne_bytes(array(&buf[at..at + 4]));
        let u16_at = |at: usize| u16::from_ne_bytes(array(&buf[at..at + 2]));

        let reason = DeleteReason::from_code(u16_at(32))
            .ok_or_else(|| LogError::Malformed(format!("unknown delete reason {}", u16_at(32))))?;
        let name_len = u16_at(34) as usize;
        let host_len = buf[36] as usize;
        let user_len = buf[37] as usize;
        let extra_len = u16_at(38) as usize;
        let total = FIXED_LEN + host_len + name_len + user_len + extra_len;
        if buf.len() < total {
            return Err(LogError::Incomplete);
        }

        let mut at = FIXED_LEN;
        let mut take = |len: usize| {
            let s = String::from_utf8_lossy(&buf[at..at + len]).into_owned();
            at += len;
            s
        };
        let host_alias = take(host_len);
        let file_name = take(name_len);
        let user = take(user_len);
        let extra = take(extra_len);

        Ok((
            Self {
                file_size: i64_at(0),
                input_time: i64_at(8),
                job_id: u32_at(16),
                dir_id: u32_at(20),
                unique_number: u32_at(24),
                split_job_counter: u32_at(28),
                reason,
                host_alias,
                file_name,
                user,
                extra,
            },
            total,
        ))
    }
}

impl fmt::Display for DeleteRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<8} {} {} {:x} {:x} {:x}_{:x}_{:x} {} [{}]",
            self.host_alias,
            self.file_name,
            self.file_size,
            self.job_id,
            self.dir_id,
            self.input_time,
            self.unique_number,
            self.split_job_counter,
            self.user,
            self.reason
        )?;
        if !self.extra.is_empty() {
            write!(f, " {}", self.extra)?;
        }
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> &[u8] {
    let bytes = s.as_bytes();
    &bytes[..bytes.len().min(max)]
}

pub(crate) fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let rec = DeleteRecord::new(DeleteReason::DupInput, "a.bin", 100)
            .dir(0x1234)
            .host("h")
            .user("amg")
            .input(1_700_000_000, 7, 0);
        let bytes = rec.encode();
        assert_eq!(bytes.len(), FIXED_LEN + 1 + 5 + 3);
        let (back, used) = DeleteRecord::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(back, rec);
        assert!(back.to_string().contains("duplicate"));
    }

    #[test]
    fn test_long_strings_stay_atomic() {
        let rec = DeleteRecord::new(DeleteReason::UserDel, "n".repeat(1000), 1).extra("x".repeat(10_000));
        let bytes = rec.encode();
        assert!(bytes.len() <= PIPE_BUF);
        let (back, _) = DeleteRecord::decode(&bytes).unwrap();
        assert_eq!(back.file_name.len(), MAX_FILENAME_LENGTH);
    }

    #[test]
    fn test_back_to_back_records() {
        let mut stream = DeleteRecord::new(DeleteReason::AgeOutput, "x", 1).encode();
        stream.extend(DeleteRecord::new(DeleteReason::JidLookupFailure, "y", 2).encode());
        let (first, used) = DeleteRecord::decode(&stream).unwrap();
        let (second, _) = DeleteRecord::decode(&stream[used..]).unwrap();
        assert_eq!(first.reason, DeleteReason::AgeOutput);
        assert_eq!(second.file_name, "y");
        assert!(DeleteRecord::decode(&stream[..10]).is_err());
    }
}
