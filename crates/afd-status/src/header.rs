//! Word-offset header shared by every persistent AFD structure.
//!
//! Layout (16 bytes, native byte order):
//! ```text
//! offset  field            size
//! ------  ---------------  ----
//!  0      record count      4   (i32)
//!  4      stale marker      1   (reserved, 0 while current)
//!  5      feature flags     1
//!  6      reserved          1
//!  7      schema version    1
//!  8      page size         4   (i32, at creation)
//! 12      reserved          4
//! ```
//! Followed by `count` fixed-size records. The file is always
//! `ceil(count / step) * step * record_size + 16` bytes long.

pub const AFD_WORD_OFFSET: usize = 16;

pub const COUNT_OFFSET: usize = 0;
pub const STALE_OFFSET: usize = 4;
pub const FEATURE_FLAG_OFFSET: usize = 5;
pub const VERSION_OFFSET: usize = 7;
pub const PAGESIZE_OFFSET: usize = 8;

/// Value of the stale byte once a newer generation has replaced the file
pub const STALE: u8 = 0xff;

pub const FEATURE_DISABLE_ARCHIVE: u8 = 0x01;
pub const FEATURE_DISABLE_RETRIEVE: u8 = 0x02;
pub const FEATURE_DISABLE_DUPCHECK: u8 = 0x04;

/// Decoded word-offset header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordOffsetHeader {
    pub count: i32,
    pub stale: u8,
    pub features: u8,
    pub version: u8,
    pub pagesize: i32,
}

impl WordOffsetHeader {
    pub fn new(version: u8) -> Self {
        Self {
            count: 0,
            stale: 0,
            features: 0,
            version,
            pagesize: page_size(),
        }
    }

    /// Decode from the first 16 bytes of `buf`
    pub fn read(buf: &[u8]) -> Self {
        let mut count = [0u8; 4];
        count.copy_from_slice(&buf[COUNT_OFFSET..COUNT_OFFSET + 4]);
        let mut pagesize = [0u8; 4];
        pagesize.copy_from_slice(&buf[PAGESIZE_OFFSET..PAGESIZE_OFFSET + 4]);
        Self {
            count: i32::from_ne_bytes(count),
            stale: buf[STALE_OFFSET],
            features: buf[FEATURE_FLAG_OFFSET],
            version: buf[VERSION_OFFSET],
            pagesize: i32::from_ne_bytes(pagesize),
        }
    }

    /// Encode into the first 16 bytes of `buf`; reserved bytes are zeroed
    pub fn write(&self, buf: &mut [u8]) {
        buf[..AFD_WORD_OFFSET].fill(0);
        buf[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&self.count.to_ne_bytes());
        buf[STALE_OFFSET] = self.stale;
        buf[FEATURE_FLAG_OFFSET] = self.features;
        buf[VERSION_OFFSET] = self.version;
        buf[PAGESIZE_OFFSET..PAGESIZE_OFFSET + 4].copy_from_slice(&self.pagesize.to_ne_bytes());
    }

    pub fn to_bytes(&self) -> [u8; AFD_WORD_OFFSET] {
        let mut buf = [0u8; AFD_WORD_OFFSET];
        self.write(&mut buf);
        buf
    }
}

/// System page size
pub fn page_size() -> i32 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as i32
    }
}

/// Number of record slots allocated for `count` records
pub fn capacity_for(count: usize, step: usize) -> usize {
    count.div_ceil(step) * step
}

/// File size for `count` records grown in `step` increments
pub fn area_size(count: usize, step: usize, record_size: usize) -> usize {
    capacity_for(count, step) * record_size + AFD_WORD_OFFSET
}
