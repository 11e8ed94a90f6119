//! Messages handed from the generator to the dispatcher.
//!
//! A message is one directory below `files/outgoing/` holding the files of
//! one job. Its name is `<job-id>/<seq>/<creation-time>_<unique>_<split>`,
//! every field hex, so the dispatcher can rebuild the queue from the
//! directory tree alone.

use std::fmt;
use std::str::FromStr;

use crate::AmgError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageName {
    pub job_id: u32,
    /// Link-count bucket below the job directory
    pub seq: u32,
    pub creation_time: i64,
    pub unique_number: u32,
    pub split_job_counter: u32,
}

impl fmt::Display for MessageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}/{:x}/{:x}_{:x}_{:x}",
            self.job_id, self.seq, self.creation_time, self.unique_number, self.split_job_counter
        )
    }
}

impl FromStr for MessageName {
    type Err = AmgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || AmgError::PoolName(s.to_string());
        let mut parts = s.split('/');
        let (Some(job), Some(seq), Some(leaf), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };
        let mut fields = leaf.split('_');
        let (Some(time), Some(unique), Some(split), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(bad());
        };
        let hex32 = |t: &str| u32::from_str_radix(t, 16).map_err(|_| bad());
        Ok(Self {
            job_id: hex32(job)?,
            seq: hex32(seq)?,
            creation_time: i64::from_str_radix(time, 16).map_err(|_| bad())?,
            unique_number: hex32(unique)?,
            split_job_counter: hex32(split)?,
        })
    }
}

/// A message ready for the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub name: MessageName,
    pub dir_id: u32,
    pub host_alias: String,
    pub priority: u8,
    pub files: u32,
    pub bytes: u64,
    /// Seconds the message may wait before it is deleted (0 = forever)
    pub age_limit: u32,
}

impl NewMessage {
    pub fn job_id(&self) -> u32 {
        self.name.job_id
    }

    /// Path below `files/outgoing/`
    pub fn msg_name(&self) -> String {
        self.name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_name_text() {
        let name = MessageName {
            job_id: 0xabc,
            seq: 0,
            creation_time: 0x65000000,
            unique_number: 7,
            split_job_counter: 0,
        };
        assert_eq!(name.to_string(), "abc/0/65000000_7_0");
        assert_eq!("abc/0/65000000_7_0".parse::<MessageName>().unwrap(), name);
        assert!("abc/65000000_7_0".parse::<MessageName>().is_err());
        assert!("abc/0/zz_7_0".parse::<MessageName>().is_err());
    }
}
