//! Memory-mapped record areas.
//!
//! A [`MappedArea`] is a file of the form `<header><record>*` mapped
//! read-write and shared between processes. Records are plain `#[repr(C)]`
//! structs without padding; they are copied in and out with unaligned
//! reads so callers never hold references into the mapping.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use memmap2::MmapMut;
use tracing::{debug, info, warn};

use crate::header::{
    area_size, WordOffsetHeader, AFD_WORD_OFFSET, FEATURE_FLAG_OFFSET, STALE, STALE_OFFSET,
};
use crate::lock::{AreaLock, FileKey, LocalLock, LockKind, LockWait};
use crate::{Result, StatusError};

/// Fixed-size record stored in a mapped area.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no padding, no pointers and
/// no fields with invalid bit patterns: every byte sequence of the right
/// length must be a valid value.
pub unsafe trait Record: Copy + 'static {
    const SIZE: usize = std::mem::size_of::<Self>();

    fn zeroed() -> Self {
        // SAFETY: all-zero bytes are a valid value per the trait contract
        unsafe { std::mem::zeroed() }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= Self::SIZE);
        // SAFETY: length checked; any bit pattern is valid
        unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        assert!(bytes.len() >= Self::SIZE);
        // SAFETY: length checked
        unsafe { std::ptr::write_unaligned(bytes.as_mut_ptr() as *mut Self, *self) }
    }
}

/// Rewrites the records of an older schema version into the next one
pub trait Converter: Sync {
    fn from_version(&self) -> u8;
    fn to_version(&self) -> u8;
    fn old_record_size(&self) -> usize;
    fn new_record_size(&self) -> usize;

    /// `old` holds exactly `count` records of the old size
    fn convert(&self, old: &[u8], count: usize) -> Result<Vec<u8>>;

    /// Inverse of [`Converter::convert`] for fields both versions share
    fn revert(&self, new: &[u8], count: usize) -> Result<Vec<u8>>;
}

/// Shape of an area as the current code expects it
pub struct AreaSpec<'a> {
    pub step: usize,
    pub record_size: usize,
    pub version: u8,
    pub converters: &'a [&'a dyn Converter],
}

impl<'a> AreaSpec<'a> {
    pub fn new(step: usize, record_size: usize, version: u8) -> Self {
        Self {
            step,
            record_size,
            version,
            converters: &[],
        }
    }

    pub fn with_converters(mut self, converters: &'a [&'a dyn Converter]) -> Self {
        self.converters = converters;
        self
    }
}

pub struct MappedArea {
    file: File,
    key: FileKey,
    mmap: MmapMut,
    path: PathBuf,
    step: usize,
    record_size: usize,
}

impl std::fmt::Debug for MappedArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedArea")
            .field("path", &self.path)
            .field("count", &self.count())
            .field("record_size", &self.record_size)
            .finish()
    }
}

impl MappedArea {
    /// Open (creating if needed) and map the area at `path`.
    ///
    /// A file shorter than the header is initialized empty. A version byte
    /// different from `spec.version` runs the matching converters first;
    /// if none applies the attach is refused with
    /// [`StatusError::UnknownVersion`].
    pub fn attach(path: &Path, spec: &AreaSpec<'_>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // Serialize initialization and conversion between processes
        let _init = AreaLock::acquire(file.as_raw_fd(), 0, 0, LockKind::Exclusive, LockWait::Wait)?;

        let meta = file.metadata()?;
        let key = (meta.dev(), meta.ino());
        let len = meta.len() as usize;
        let fresh = len < AFD_WORD_OFFSET;
        if fresh {
            file.set_len(AFD_WORD_OFFSET as u64)?;
        }
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let mut header = WordOffsetHeader::read(&mmap);
        if fresh || (header.version == 0 && header.count == 0) {
            header = WordOffsetHeader::new(spec.version);
            header.write(&mut mmap);
            debug!(path = %path.display(), version = spec.version, "Initialized area header");
        }

        let mut area = Self {
            file,
            key,
            mmap,
            path: path.to_path_buf(),
            step: spec.step,
            record_size: spec.record_size,
        };

        if header.version != spec.version {
            area.convert(header.version, spec)?;
        }

        // Grow a truncated file to the size its count demands
        let want = area_size(area.count(), area.step, area.record_size);
        if area.mmap.len() < want {
            area.remap(want)?;
        }

        Ok(area)
    }

    fn convert(&mut self, mut version: u8, spec: &AreaSpec<'_>) -> Result<()> {
        while version != spec.version {
            let converter = spec
                .converters
                .iter()
                .find(|c| c.from_version() == version)
                .ok_or_else(|| StatusError::UnknownVersion {
                    path: self.path.display().to_string(),
                    found: version,
                    expected: spec.version,
                })?;

            let count = self.count();
            let old_size = converter.old_record_size();
            let old_end = AFD_WORD_OFFSET + count * old_size;
            if self.mmap.len() < old_end {
                return Err(StatusError::Convert(format!(
                    "{} is shorter than {} records of version {}",
                    self.path.display(),
                    count,
                    version
                )));
            }
            let converted = converter.convert(&self.mmap[AFD_WORD_OFFSET..old_end], count)?;
            let new_size = converter.new_record_size();
            if converted.len() != count * new_size {
                return Err(StatusError::Convert(format!(
                    "converter {}->{} produced {} bytes for {} records",
                    converter.from_version(),
                    converter.to_version(),
                    converted.len(),
                    count
                )));
            }

            let mut header = WordOffsetHeader::read(&self.mmap);
            header.version = converter.to_version();
            self.record_size = new_size;
            self.remap(area_size(count, self.step, new_size))?;
            header.write(&mut self.mmap);
            let tail = AFD_WORD_OFFSET + converted.len();
            self.mmap[AFD_WORD_OFFSET..tail].copy_from_slice(&converted);
            self.mmap[tail..].fill(0);
            self.mmap.flush()?;

            info!(
                path = %self.path.display(),
                from = version,
                to = header.version,
                records = count,
                "Converted status area"
            );
            version = header.version;
        }
        if self.record_size != spec.record_size {
            return Err(StatusError::Convert(format!(
                "{}: converted record size {} does not match {}",
                self.path.display(),
                self.record_size,
                spec.record_size
            )));
        }
        Ok(())
    }

    fn remap(&mut self, size: usize) -> Result<()> {
        self.mmap.flush()?;
        self.file.set_len(size as u64)?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn header(&self) -> WordOffsetHeader {
        WordOffsetHeader::read(&self.mmap)
    }

    fn count_cell(&self) -> &AtomicI32 {
        // SAFETY: the mapping is page aligned and at least 16 bytes long
        unsafe { &*(self.mmap.as_ptr() as *const AtomicI32) }
    }

    fn byte_cell(&self, offset: usize) -> &AtomicU8 {
        // SAFETY: offset lies inside the header
        unsafe { &*(self.mmap.as_ptr().add(offset) as *const AtomicU8) }
    }

    pub fn count(&self) -> usize {
        self.count_cell().load(Ordering::Acquire).max(0) as usize
    }

    fn set_count(&self, count: usize) {
        self.count_cell().store(count as i32, Ordering::Release);
    }

    /// Record slots available before the file must grow
    pub fn capacity(&self) -> usize {
        (self.mmap.len() - AFD_WORD_OFFSET) / self.record_size
    }

    pub fn features(&self) -> u8 {
        self.byte_cell(FEATURE_FLAG_OFFSET).load(Ordering::Acquire)
    }

    pub fn set_features(&self, flags: u8) {
        self.byte_cell(FEATURE_FLAG_OFFSET).store(flags, Ordering::Release);
    }

    /// Flag this file as replaced by a newer generation
    pub fn mark_stale(&self) {
        self.byte_cell(STALE_OFFSET).store(STALE, Ordering::Release);
    }

    pub fn is_stale_marked(&self) -> bool {
        self.byte_cell(STALE_OFFSET).load(Ordering::Acquire) == STALE
    }

    /// Byte offset of record `index` in the file
    pub fn record_offset(&self, index: usize) -> usize {
        AFD_WORD_OFFSET + index * self.record_size
    }

    fn check_index(&self, index: usize) -> Result<()> {
        let count = self.count();
        // Another process may have grown the file past our mapping
        if index >= count || self.record_offset(index + 1) > self.mmap.len() {
            return Err(StatusError::OutOfRange { index, count });
        }
        Ok(())
    }

    pub fn record_bytes(&self, index: usize) -> Result<&[u8]> {
        self.check_index(index)?;
        let off = self.record_offset(index);
        Ok(&self.mmap[off..off + self.record_size])
    }

    pub fn record_bytes_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        self.check_index(index)?;
        let off = self.record_offset(index);
        let size = self.record_size;
        Ok(&mut self.mmap[off..off + size])
    }

    pub fn read<T: Record>(&self, index: usize) -> Result<T> {
        debug_assert_eq!(T::SIZE, self.record_size);
        Ok(T::from_bytes(self.record_bytes(index)?))
    }

    pub fn write<T: Record>(&mut self, index: usize, record: &T) -> Result<()> {
        debug_assert_eq!(T::SIZE, self.record_size);
        record.write_bytes(self.record_bytes_mut(index)?);
        Ok(())
    }

    /// Every record inside this mapping. Records another process appended
    /// beyond it are left out until the area is re-attached.
    pub fn records<T: Record>(&self) -> Vec<T> {
        let count = self.count();
        let records: Vec<T> = (0..count).map_while(|i| self.read(i).ok()).collect();
        if records.len() < count {
            warn!(
                path = %self.path.display(),
                mapped = records.len(),
                count,
                "Records beyond the mapping skipped"
            );
        }
        records
    }

    /// Change the record count. Shrinking truncates the file, growing
    /// zeroes the records that become visible.
    pub fn resize(&mut self, new_count: usize) -> Result<()> {
        let old_count = self.count();
        let size = area_size(new_count, self.step, self.record_size);
        if size != self.mmap.len() {
            self.remap(size)?;
        }
        if new_count > old_count {
            let from = self.record_offset(old_count);
            let to = self.record_offset(new_count);
            self.mmap[from..to].fill(0);
        }
        self.set_count(new_count);
        Ok(())
    }

    /// Append a record and return its index
    pub fn push<T: Record>(&mut self, record: &T) -> Result<usize> {
        let index = self.count();
        self.resize(index + 1)?;
        self.write(index, record)?;
        Ok(index)
    }

    /// Remove record `index`, shifting later records down
    pub fn remove(&mut self, index: usize) -> Result<()> {
        self.check_index(index)?;
        let count = self.count();
        let from = self.record_offset(index + 1);
        let to = self.record_offset(count);
        let dest = self.record_offset(index);
        self.mmap.copy_within(from..to, dest);
        self.resize(count - 1)
    }

    /// Replace every record at once
    pub fn replace_all(&mut self, records: &[u8]) -> Result<()> {
        let count = records.len() / self.record_size;
        self.resize(count)?;
        let end = AFD_WORD_OFFSET + records.len();
        self.mmap[AFD_WORD_OFFSET..end].copy_from_slice(records);
        Ok(())
    }

    /// Exclude other handles on this file within the process
    pub fn lock_local(&self) -> LocalLock {
        LocalLock::acquire(self.key)
    }

    pub fn lock_whole(&self, kind: LockKind, wait: LockWait) -> Result<AreaLock> {
        AreaLock::acquire(self.file.as_raw_fd(), 0, 0, kind, wait)
    }

    pub fn lock_region(&self, offset: usize, len: usize, kind: LockKind) -> Result<AreaLock> {
        AreaLock::acquire(
            self.file.as_raw_fd(),
            offset as i64,
            len as i64,
            kind,
            LockWait::Wait,
        )
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Flush and unmap
    pub fn detach(self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pair {
        a: u32,
        b: u32,
    }
    unsafe impl Record for Pair {}

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Triple {
        a: u32,
        b: u32,
        c: u32,
    }
    unsafe impl Record for Triple {}

    struct PairToTriple;

    impl Converter for PairToTriple {
        fn from_version(&self) -> u8 {
            1
        }
        fn to_version(&self) -> u8 {
            2
        }
        fn old_record_size(&self) -> usize {
            8
        }
        fn new_record_size(&self) -> usize {
            12
        }
        fn convert(&self, old: &[u8], count: usize) -> Result<Vec<u8>> {
            let mut out = vec![0u8; count * 12];
            for i in 0..count {
                let p = Pair::from_bytes(&old[i * 8..]);
                Triple { a: p.a, b: p.b, c: 0 }.write_bytes(&mut out[i * 12..]);
            }
            Ok(out)
        }
        fn revert(&self, new: &[u8], count: usize) -> Result<Vec<u8>> {
            let mut out = vec![0u8; count * 8];
            for i in 0..count {
                let t = Triple::from_bytes(&new[i * 12..]);
                Pair { a: t.a, b: t.b }.write_bytes(&mut out[i * 8..]);
            }
            Ok(out)
        }
    }

    #[test]
    fn test_attach_initializes_short_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("area");
        std::fs::write(&path, b"abc").unwrap();

        let area = MappedArea::attach(&path, &AreaSpec::new(4, 8, 1)).unwrap();
        assert_eq!(area.count(), 0);
        assert_eq!(area.header().version, 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16);
    }

    #[test]
    fn test_resize_keeps_step_layout() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("area");
        let mut area = MappedArea::attach(&path, &AreaSpec::new(4, 8, 1)).unwrap();

        for i in 0..5u32 {
            area.push(&Pair { a: i, b: i * 10 }).unwrap();
        }
        assert_eq!(area.count(), 5);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8 * 8 + 16);

        area.remove(1).unwrap();
        let pairs: Vec<Pair> = area.records();
        assert_eq!(pairs.iter().map(|p| p.a).collect::<Vec<_>>(), vec![0, 2, 3, 4]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * 8 + 16);

        // Growing again exposes zeroed records, not the removed data
        area.resize(6).unwrap();
        assert_eq!(area.read::<Pair>(5).unwrap(), Pair { a: 0, b: 0 });
        assert!(matches!(
            area.read::<Pair>(6),
            Err(StatusError::OutOfRange { index: 6, count: 6 })
        ));
    }

    #[test]
    fn test_reattach_sees_records() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("area");
        {
            let mut area = MappedArea::attach(&path, &AreaSpec::new(4, 8, 1)).unwrap();
            area.push(&Pair { a: 7, b: 8 }).unwrap();
            area.detach().unwrap();
        }
        let area = MappedArea::attach(&path, &AreaSpec::new(4, 8, 1)).unwrap();
        assert_eq!(area.read::<Pair>(0).unwrap(), Pair { a: 7, b: 8 });
    }

    #[test]
    fn test_records_stop_at_the_mapping() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("area");
        let mut writer = MappedArea::attach(&path, &AreaSpec::new(4, 8, 1)).unwrap();
        for i in 0..4u32 {
            writer.push(&Pair { a: i, b: 0 }).unwrap();
        }
        let reader = MappedArea::attach(&path, &AreaSpec::new(4, 8, 1)).unwrap();

        // The fifth record grows the file past the reader's mapping
        writer.push(&Pair { a: 4, b: 0 }).unwrap();
        assert_eq!(reader.count(), 5);
        let seen: Vec<Pair> = reader.records();
        assert_eq!(seen.iter().map(|p| p.a).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_unknown_version_is_refused() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("area");
        {
            let mut area = MappedArea::attach(&path, &AreaSpec::new(4, 8, 9)).unwrap();
            area.push(&Pair { a: 1, b: 1 }).unwrap();
        }
        let err = MappedArea::attach(&path, &AreaSpec::new(4, 8, 1)).unwrap_err();
        assert!(matches!(
            err,
            StatusError::UnknownVersion {
                found: 9,
                expected: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_converter_runs_before_callers_see_data() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("area");
        {
            let mut area = MappedArea::attach(&path, &AreaSpec::new(4, 8, 1)).unwrap();
            area.push(&Pair { a: 1, b: 2 }).unwrap();
            area.push(&Pair { a: 3, b: 4 }).unwrap();
        }

        let converters: [&dyn Converter; 1] = [&PairToTriple];
        let spec = AreaSpec::new(4, 12, 2).with_converters(&converters);
        let area = MappedArea::attach(&path, &spec).unwrap();
        assert_eq!(area.header().version, 2);
        assert_eq!(area.count(), 2);
        assert_eq!(area.read::<Triple>(1).unwrap(), Triple { a: 3, b: 4, c: 0 });
        drop(area);

        // Already current: attaching again leaves it untouched
        let area = MappedArea::attach(&path, &spec).unwrap();
        assert_eq!(area.read::<Triple>(0).unwrap(), Triple { a: 1, b: 2, c: 0 });
    }

    #[test]
    fn test_stale_marker_and_features() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("area");
        let area = MappedArea::attach(&path, &AreaSpec::new(4, 8, 1)).unwrap();
        assert!(!area.is_stale_marked());
        area.set_features(crate::header::FEATURE_DISABLE_DUPCHECK);
        area.mark_stale();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes[STALE_OFFSET], STALE);
        assert_eq!(bytes[FEATURE_FLAG_OFFSET], crate::header::FEATURE_DISABLE_DUPCHECK);
        assert!(area.is_stale_marked());
    }
}
