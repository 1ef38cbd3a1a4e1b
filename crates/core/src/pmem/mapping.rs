//! Mapping - a region file mapped into the address space
//!
//! The only place that turns a region-relative offset into an absolute
//! address. Everything above this module speaks offsets.

use super::layout::RegionHeader;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use tracing::debug;

/// A writable shared mapping of a whole region file
pub struct Mapping {
    mmap: MmapMut,
    base: NonNull<u8>,
    len: usize,
    _file: File,
}

// Concurrent access to the mapped bytes is coordinated by the log protocol
// and by atomics; the mapping itself never moves while it is alive.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Create a new zero-filled file of `size` bytes and map it
    pub fn create(path: &Path, size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(size)?;
        file.sync_all()?;
        Self::map(file)
    }

    /// Map an existing region file
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::map(file)
    }

    fn map(file: File) -> io::Result<Self> {
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let len = mmap.len();
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| io::Error::other("mapping returned a null base"))?;
        debug!("Mapped {} bytes at {:p}", len, base);
        Ok(Self {
            mmap,
            base,
            len,
            _file: file,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if `[offset, offset + len)` is inside the mapping
    #[inline]
    pub fn in_bounds(&self, offset: u64, len: u64) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.len as u64)
    }

    #[inline]
    fn ptr(&self, offset: u64, len: usize) -> *mut u8 {
        assert!(
            self.in_bounds(offset, len as u64),
            "range {:#x}+{} outside mapping of {} bytes",
            offset,
            len,
            self.len
        );
        unsafe { self.base.as_ptr().add(offset as usize) }
    }

    /// The region header at offset 0
    pub fn header(&self) -> &RegionHeader {
        assert!(self.len >= size_of::<RegionHeader>());
        unsafe { &*(self.base.as_ptr() as *const RegionHeader) }
    }

    /// Copy bytes out of the mapping
    pub fn read(&self, offset: u64, buf: &mut [u8]) {
        let src = self.ptr(offset, buf.len());
        unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
    }

    pub fn read_vec(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.read(offset, &mut buf);
        buf
    }

    /// Copy bytes into the mapping (not yet durable)
    pub fn write(&self, offset: u64, data: &[u8]) {
        let dst = self.ptr(offset, data.len());
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
    }

    pub fn zero(&self, offset: u64, len: usize) {
        let dst = self.ptr(offset, len);
        unsafe { std::ptr::write_bytes(dst, 0, len) };
    }

    /// An 8-byte aligned word of the mapping viewed as an atomic
    pub fn atomic_u64(&self, offset: u64) -> &AtomicU64 {
        assert!(offset % 8 == 0, "unaligned atomic at {:#x}", offset);
        let ptr = self.ptr(offset, 8);
        unsafe { &*(ptr as *const AtomicU64) }
    }

    /// Absolute address of an offset; valid only while the mapping lives
    pub fn address(&self, offset: u64) -> *const u8 {
        self.ptr(offset, 0)
    }

    /// Write back a byte range to the backing file (msync)
    pub fn flush_range(&self, offset: u64, len: usize) -> io::Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.ptr(offset, len);
        self.mmap.flush_range(offset as usize, len)
    }

    /// Write back the whole mapping
    pub fn flush_all(&self) -> io::Result<()> {
        self.mmap.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    #[test]
    fn test_create_is_zeroed() -> io::Result<()> {
        let dir = tempdir()?;
        let mapping = Mapping::create(&dir.path().join("r.pm"), 64 * 1024)?;
        assert_eq!(mapping.len(), 64 * 1024);
        assert!(mapping.read_vec(0, 4096).iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn test_write_survives_remap() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("r.pm");
        {
            let mapping = Mapping::create(&path, 64 * 1024)?;
            mapping.write(100, &[0xAB; 16]);
            mapping.atomic_u64(4096).store(42, Ordering::Release);
            mapping.flush_all()?;
        }
        let mapping = Mapping::open(&path)?;
        assert_eq!(mapping.read_vec(100, 16), vec![0xAB; 16]);
        assert_eq!(mapping.atomic_u64(4096).load(Ordering::Acquire), 42);
        Ok(())
    }

    #[test]
    fn test_create_refuses_existing_file() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("r.pm");
        Mapping::create(&path, 4096)?;
        assert!(Mapping::create(&path, 4096).is_err());
        Ok(())
    }

    #[test]
    fn test_bounds() -> io::Result<()> {
        let dir = tempdir()?;
        let mapping = Mapping::create(&dir.path().join("r.pm"), 4096)?;
        assert!(mapping.in_bounds(4088, 8));
        assert!(!mapping.in_bounds(4089, 8));
        assert!(!mapping.in_bounds(u64::MAX, 2));
        Ok(())
    }

    #[test]
    #[should_panic]
    fn test_out_of_bounds_write_panics() {
        let dir = tempdir().unwrap();
        let mapping = Mapping::create(&dir.path().join("r.pm"), 4096).unwrap();
        mapping.write(4090, &[0; 8]);
    }
}
