//! Distribution-log records: which jobs an incoming file was handed to.
//!
//! ```text
//! <input_time:i64><file_size:i64><dir_id:u32><unique_number:u32>
//! <file_name_len:u16><no_of_dist_types:u8><job_count:u32>[<job_id:u32>..]
//! <dist_type:u8><total_segments:u8><segment:u8>[<proc_cycles:u8>..]<file_name>
//! ```
//!
//! A record whose job list would not fit one atomic write is split into
//! segments that each repeat the header and the file name.

use std::fmt;

use crate::delete::{array, MAX_FILENAME_LENGTH};
use crate::{LogError, Result, PIPE_BUF};

/// Bytes before the job list
const HEAD_LEN: usize = 8 + 8 + 4 + 4 + 2 + 1 + 4;
/// Bytes between job list and cycles
const MID_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DistributionType {
    Normal = 0,
    TimeJob = 1,
    QueueStopped = 2,
    Disabled = 3,
    AgeLimitDelete = 4,
    /// Deleted as a duplicate before any job saw it
    DupDel = 5,
}

impl DistributionType {
    pub fn from_code(code: u8) -> Option<Self> {
        use DistributionType::*;
        Some(match code {
            0 => Normal,
            1 => TimeJob,
            2 => QueueStopped,
            3 => Disabled,
            4 => AgeLimitDelete,
            5 => DupDel,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionType::Normal => "NORMAL_DIS",
            DistributionType::TimeJob => "TIME_JOB_DIS",
            DistributionType::QueueStopped => "QUEUE_STOPPED_DIS",
            DistributionType::Disabled => "DISABLED_DIS",
            DistributionType::AgeLimitDelete => "AGE_LIMIT_DELETE_DIS",
            DistributionType::DupDel => "DUP_DEL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionRecord {
    pub input_time: i64,
    pub file_size: i64,
    pub dir_id: u32,
    pub unique_number: u32,
    pub dist_type: DistributionType,
    pub job_ids: Vec<u32>,
    /// Processing cycles per job, parallel to `job_ids`
    pub proc_cycles: Vec<u8>,
    pub file_name: String,
    /// Set on decoded segments: (total, this one), both from 1
    pub segment: (u8, u8),
}

impl DistributionRecord {
    pub fn new(
        dist_type: DistributionType,
        file_name: impl Into<String>,
        file_size: i64,
        dir_id: u32,
        input_time: i64,
        unique_number: u32,
    ) -> Self {
        Self {
            input_time,
            file_size,
            dir_id,
            unique_number,
            dist_type,
            job_ids: Vec::new(),
            proc_cycles: Vec::new(),
            file_name: file_name.into(),
            segment: (1, 1),
        }
    }

    pub fn with_jobs(mut self, job_ids: Vec<u32>) -> Self {
        self.proc_cycles = vec![0; job_ids.len()];
        self.job_ids = job_ids;
        self
    }

    /// Jobs a single segment can carry next to `name_len` bytes of name
    pub fn jobs_per_segment(name_len: usize) -> usize {
        (PIPE_BUF - HEAD_LEN - MID_LEN - name_len) / 5
    }

    /// Encode into one or more segments, each at most `PIPE_BUF` long
    pub fn encode_segments(&self) -> Vec<Vec<u8>> {
        let name = &self.file_name.as_bytes()[..self.file_name.len().min(MAX_FILENAME_LENGTH)];
        let per = Self::jobs_per_segment(name.len());
        let chunks: Vec<(&[u32], &[u8])> = if self.job_ids.is_empty() {
            vec![(&[][..], &[][..])]
        } else {
            self.job_ids
                .chunks(per)
                .zip(self.proc_cycles.chunks(per))
                .collect()
        };
        let total = chunks.len().min(u8::MAX as usize) as u8;

        chunks
            .iter()
            .take(total as usize)
            .enumerate()
            .map(|(i, (ids, cycles))| {
                let mut out = Vec::with_capacity(HEAD_LEN + ids.len() * 5 + MID_LEN + name.len());
                out.extend_from_slice(&self.input_time.to_ne_bytes());
                out.extend_from_slice(&self.file_size.to_ne_bytes());
                out.extend_from_slice(&self.dir_id.to_ne_bytes());
                out.extend_from_slice(&self.unique_number.to_ne_bytes());
                out.extend_from_slice(&(name.len() as u16).to_ne_bytes());
                out.push(1);
                out.extend_from_slice(&(ids.len() as u32).to_ne_bytes());
                for id in ids.iter() {
                    out.extend_from_slice(&id.to_ne_bytes());
                }
                out.push(self.dist_type as u8);
                out.push(total);
                out.push(i as u8 + 1);
                out.extend_from_slice(cycles);
                out.extend_from_slice(name);
                out
            })
            .collect()
    }

    /// Decode one segment; returns it with the bytes consumed
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < HEAD_LEN {
            return Err(LogError::Incomplete);
        }
        let input_time = i64::from_ne_bytes(array(&buf[0..8]));
        let file_size = i64::from_ne_bytes(array(&buf[8..16]));
        let dir_id = u32::from_ne_bytes(array(&buf[16..20]));
        let unique_number = u32::from_ne_bytes(array(&buf[20..24]));
        let name_len = u16::from_ne_bytes(array(&buf[24..26])) as usize;
        let types = buf[26];
        if types != 1 {
            return Err(LogError::Malformed(format!("{} distribution types per record", types)));
        }
        let jobs = u32::from_ne_bytes(array(&buf[27..31])) as usize;
        let total = HEAD_LEN + jobs * 4 + MID_LEN + jobs + name_len;
        if buf.len() < total {
            return Err(LogError::Incomplete);
        }

        let mut at = HEAD_LEN;
        let job_ids: Vec<u32> = (0..jobs)
            .map(|i| u32::from_ne_bytes(array(&buf[at + i * 4..at + i * 4 + 4])))
            .collect();
        at += jobs * 4;
        let dist_type = DistributionType::from_code(buf[at])
            .ok_or_else(|| LogError::Malformed(format!("unknown distribution type {}", buf[at])))?;
        let segment = (buf[at + 1], buf[at + 2]);
        at += MID_LEN;
        let proc_cycles = buf[at..at + jobs].to_vec();
        at += jobs;
        let file_name = String::from_utf8_lossy(&buf[at..at + name_len]).into_owned();

        Ok((
            Self {
                input_time,
                file_size,
                dir_id,
                unique_number,
                dist_type,
                job_ids,
                proc_cycles,
                file_name,
                segment,
            },
            total,
        ))
    }
}

impl fmt::Display for DistributionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:x} {:x}_{:x} {} {}/{}",
            self.file_name,
            self.file_size,
            self.dir_id,
            self.input_time,
            self.unique_number,
            self.dist_type.as_str(),
            self.segment.1,
            self.segment.0
        )?;
        for id in &self.job_ids {
            write!(f, " {:x}", id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_segment_layout() {
        let rec = DistributionRecord::new(DistributionType::Normal, "a.bin", 100, 0xd1, 1000, 3)
            .with_jobs(vec![0xaa, 0xbb]);
        let segs = rec.encode_segments();
        assert_eq!(segs.len(), 1);
        let bytes = &segs[0];
        assert_eq!(bytes.len(), HEAD_LEN + 8 + MID_LEN + 2 + 5);
        assert_eq!(&bytes[27..31], &2u32.to_ne_bytes());
        assert_eq!(&bytes[31..35], &0xaau32.to_ne_bytes());
        assert_eq!(bytes[39], DistributionType::Normal as u8);
        assert_eq!((bytes[40], bytes[41]), (1, 1));
        assert!(bytes.ends_with(b"a.bin"));

        let (back, used) = DistributionRecord::decode(bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(back, rec);
    }

    #[test]
    fn test_duplicate_record_has_no_jobs() {
        let rec = DistributionRecord::new(DistributionType::DupDel, "a.bin", 100, 1, 2, 3);
        let segs = rec.encode_segments();
        assert_eq!(segs.len(), 1);
        let (back, _) = DistributionRecord::decode(&segs[0]).unwrap();
        assert!(back.job_ids.is_empty());
        assert_eq!(back.dist_type, DistributionType::DupDel);
        assert!(back.to_string().contains("DUP_DEL"));
    }

    #[test]
    fn test_long_job_list_is_segmented() {
        let per = DistributionRecord::jobs_per_segment(5);
        let ids: Vec<u32> = (0..(per as u32 * 2 + 3)).collect();
        let rec = DistributionRecord::new(DistributionType::Normal, "a.bin", 1, 1, 1, 1).with_jobs(ids.clone());
        let segs = rec.encode_segments();
        assert_eq!(segs.len(), 3);

        let mut seen = Vec::new();
        for (i, seg) in segs.iter().enumerate() {
            assert!(seg.len() <= PIPE_BUF);
            let (part, _) = DistributionRecord::decode(seg).unwrap();
            assert_eq!(part.segment, (3, i as u8 + 1));
            assert_eq!(part.file_name, "a.bin");
            seen.extend(part.job_ids);
        }
        assert_eq!(seen, ids);
    }
}
