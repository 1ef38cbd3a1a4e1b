//! Region Layout - on-media format of a persistent region
//!
//! Every region file is laid out as:
//!
//! ```text
//! +----------------------+  0
//! |   RegionHeader       |  (4KB) magic, geometry, clean flag, session, root
//! +----------------------+  ALLOC_META_OFFSET
//! |   Allocator metadata |  (4KB) magic, frontier, size-class free-list heads
//! +----------------------+  log_offset
//! |   Log area           |  lane_count x lane_size bytes
//! +----------------------+  heap_offset
//! |   Heap               |  blocks carved by the allocator
//! +----------------------+  size
//! ```
//!
//! Every reference stored inside a region is a region-relative offset.

use crate::error::RegionError;
use std::mem::{offset_of, size_of};
use std::sync::atomic::AtomicU64;

/// Magic number identifying a region file
pub const REGION_MAGIC: u64 = 0x314D_5052_4542_4D45; // "EMBERPM1"

/// Version of the region layout
pub const REGION_VERSION: u32 = 1;

/// Page size used for region geometry
pub const PAGE_SIZE: usize = 4096;

/// Cache line size; the unit of flushing
pub const CACHE_LINE: usize = 64;

/// Size of the region header
pub const HEADER_SIZE: usize = 4096;

/// Offset of the allocator metadata page
pub const ALLOC_META_OFFSET: u64 = HEADER_SIZE as u64;

/// Size of the allocator metadata page
pub const ALLOC_META_SIZE: usize = 4096;

/// Smallest heap a region may have
pub const MIN_HEAP_SIZE: u64 = 64 * 1024;

/// Largest region supported; offsets must fit the 48-bit tagged words
pub const MAX_REGION_SIZE: u64 = 1 << 46;

/// Magic number identifying initialised allocator metadata
pub const ALLOC_MAGIC: u64 = 0x4154_454D_434F_4C41; // "ALOCMETA"

/// Number of power-of-two size classes
pub const NUM_SIZE_CLASSES: usize = 32;

/// Block size of size class 0
pub const MIN_BLOCK_SIZE: u64 = 32;

/// Bytes of header in front of every heap block
pub const BLOCK_HEADER_SIZE: u64 = 16;

/// Blocks are carved from the frontier in spans of at least this many bytes
pub const SPAN_SIZE: u64 = 16 * 1024;

/// Magic stamped in the upper half of a block header's first word
pub const BLOCK_MAGIC: u32 = 0xB10C_0A7E;

/// RegionHeader - first page of every region file
///
/// The geometry fields are written once at creation and covered by
/// `geometry_checksum`. `clean`, `session` and `root` are mutated in place.
#[repr(C)]
#[derive(Debug)]
pub struct RegionHeader {
    pub magic: u64,
    pub version: u32,
    pub flags: u32,
    /// Total size of the region file in bytes
    pub size: u64,
    /// Identity stamped at creation, checked against the region table
    pub uuid: [u8; 16],
    pub alloc_meta_offset: u64,
    pub log_offset: u64,
    pub lane_count: u32,
    pub lane_size: u32,
    pub heap_offset: u64,
    pub heap_size: u64,
    /// CRC32 of every byte before this field
    pub geometry_checksum: u32,
    pub _pad: u32,
    /// 1 after a clean close, 0 while open or after a crash
    pub clean: AtomicU64,
    /// Incremented on every open; the upper half of transaction ids
    pub session: AtomicU64,
    /// Region-relative offset of the program's root object, 0 if unset
    pub root: AtomicU64,
    pub _reserved: [u8; 3984],
}

const _: () = {
    assert!(size_of::<RegionHeader>() == HEADER_SIZE);
};

/// Offset of the root word inside the header
pub const ROOT_OFFSET: u64 = offset_of!(RegionHeader, root) as u64;

/// Offset of the clean-shutdown word inside the header
pub const CLEAN_OFFSET: u64 = offset_of!(RegionHeader, clean) as u64;

/// Offset of the session word inside the header
pub const SESSION_OFFSET: u64 = offset_of!(RegionHeader, session) as u64;

/// Placement of the allocator metadata, log area and heap within a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub size: u64,
    pub alloc_meta_offset: u64,
    pub log_offset: u64,
    pub lane_count: u32,
    pub lane_size: u32,
    pub heap_offset: u64,
    pub heap_size: u64,
}

impl Geometry {
    /// Compute the layout of a new region of `size` bytes
    pub fn compute(size: u64, lane_count: u32, lane_size: u32) -> Result<Self, RegionError> {
        if size == 0 || size % PAGE_SIZE as u64 != 0 || size > MAX_REGION_SIZE {
            return Err(RegionError::InvalidSize(size));
        }

        let log_offset = ALLOC_META_OFFSET + ALLOC_META_SIZE as u64;
        let log_size = lane_count as u64 * lane_size as u64;
        let heap_offset = align_to((log_offset + log_size) as usize, PAGE_SIZE) as u64;

        if heap_offset + MIN_HEAP_SIZE > size {
            return Err(RegionError::InvalidSize(size));
        }

        Ok(Self {
            size,
            alloc_meta_offset: ALLOC_META_OFFSET,
            log_offset,
            lane_count,
            lane_size,
            heap_offset,
            heap_size: size - heap_offset,
        })
    }

    /// Offset of the first byte of a lane
    #[inline]
    pub fn lane_offset(&self, lane: u32) -> u64 {
        self.log_offset + lane as u64 * self.lane_size as u64
    }

    /// True if `[offset, offset + len)` lies inside the heap
    #[inline]
    pub fn in_heap(&self, offset: u64, len: u64) -> bool {
        offset >= self.heap_offset
            && offset
                .checked_add(len)
                .is_some_and(|end| end <= self.size)
    }
}

impl RegionHeader {
    /// Build the header of a freshly created region
    pub fn new(geometry: &Geometry, uuid: [u8; 16]) -> Self {
        let mut header = Self {
            magic: REGION_MAGIC,
            version: REGION_VERSION,
            flags: 0,
            size: geometry.size,
            uuid,
            alloc_meta_offset: geometry.alloc_meta_offset,
            log_offset: geometry.log_offset,
            lane_count: geometry.lane_count,
            lane_size: geometry.lane_size,
            heap_offset: geometry.heap_offset,
            heap_size: geometry.heap_size,
            geometry_checksum: 0,
            _pad: 0,
            clean: AtomicU64::new(0),
            session: AtomicU64::new(0),
            root: AtomicU64::new(0),
            _reserved: [0; 3984],
        };
        header.geometry_checksum = header.compute_checksum();
        header
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = unsafe {
            std::slice::from_raw_parts(
                self as *const _ as *const u8,
                offset_of!(RegionHeader, geometry_checksum),
            )
        };
        checksum(bytes)
    }

    /// Check magic, version and geometry checksum; returns the reason on failure
    pub fn validate(&self, file_len: u64) -> Result<Geometry, String> {
        if self.magic != REGION_MAGIC {
            return Err(format!("bad magic {:#x}", self.magic));
        }
        if self.version != REGION_VERSION {
            return Err(format!(
                "version mismatch: expected {}, got {}",
                REGION_VERSION, self.version
            ));
        }
        if self.geometry_checksum != self.compute_checksum() {
            return Err("geometry checksum mismatch".into());
        }
        if self.size != file_len {
            return Err(format!(
                "size mismatch: header says {}, file is {}",
                self.size, file_len
            ));
        }

        let geometry = self.geometry();
        let expected = Geometry::compute(self.size, self.lane_count, self.lane_size)
            .map_err(|e| e.to_string())?;
        if geometry != expected {
            return Err("inconsistent geometry".into());
        }
        Ok(geometry)
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            size: self.size,
            alloc_meta_offset: self.alloc_meta_offset,
            log_offset: self.log_offset,
            lane_count: self.lane_count,
            lane_size: self.lane_size,
            heap_offset: self.heap_offset,
            heap_size: self.heap_size,
        }
    }

    /// Raw bytes of the header, for the initial write
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self as *const _ as *const u8, HEADER_SIZE) }
    }
}

/// Offset of the allocator's frontier word
#[inline]
pub fn frontier_offset(geometry: &Geometry) -> u64 {
    geometry.alloc_meta_offset + 8
}

/// Offset of the free-list head word for a size class
#[inline]
pub fn class_head_offset(geometry: &Geometry, class: usize) -> u64 {
    geometry.alloc_meta_offset + 16 + class as u64 * 8
}

/// Block states stored in the low byte of a block header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free = 1,
    Allocated = 2,
}

/// Decoded first word of a block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub class: u8,
    pub state: BlockState,
}

impl BlockHeader {
    pub fn encode(&self) -> u64 {
        ((BLOCK_MAGIC as u64) << 32) | ((self.class as u64) << 8) | self.state as u64
    }

    /// Decode a header word; `None` if the magic or fields are invalid
    pub fn decode(word: u64) -> Option<Self> {
        if (word >> 32) as u32 != BLOCK_MAGIC {
            return None;
        }
        let class = ((word >> 8) & 0xFF) as u8;
        if class as usize >= NUM_SIZE_CLASSES {
            return None;
        }
        let state = match word & 0xFF {
            1 => BlockState::Free,
            2 => BlockState::Allocated,
            _ => return None,
        };
        Some(Self { class, state })
    }

    /// Total bytes of a block in this class, header included
    #[inline]
    pub fn block_size(&self) -> u64 {
        class_block_size(self.class as usize)
    }
}

/// Total bytes of a block in `class`, header included
#[inline]
pub fn class_block_size(class: usize) -> u64 {
    MIN_BLOCK_SIZE << class
}

/// Smallest size class whose blocks fit `size` payload bytes
pub fn size_class(size: u64) -> Option<usize> {
    let needed = size.checked_add(BLOCK_HEADER_SIZE)?.max(MIN_BLOCK_SIZE);
    let class = (needed.next_power_of_two() / MIN_BLOCK_SIZE).trailing_zeros() as usize;
    (class < NUM_SIZE_CLASSES).then_some(class)
}

/// Align a value to the given alignment (a power of two)
#[inline]
pub fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// CRC32 checksum used for headers and log entries
#[inline]
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size() {
        assert_eq!(size_of::<RegionHeader>(), HEADER_SIZE);
        assert_eq!(ROOT_OFFSET % 8, 0);
        assert_eq!(CLEAN_OFFSET % 8, 0);
    }

    #[test]
    fn test_geometry_one_mib() -> Result<(), RegionError> {
        let g = Geometry::compute(1 << 20, 16, 16 * 1024)?;
        assert_eq!(g.log_offset, 8192);
        assert_eq!(g.heap_offset, 8192 + 256 * 1024);
        assert_eq!(g.heap_offset + g.heap_size, 1 << 20);
        assert_eq!(g.heap_offset % PAGE_SIZE as u64, 0);
        Ok(())
    }

    #[test]
    fn test_geometry_rejects_bad_sizes() {
        assert!(matches!(
            Geometry::compute(0, 16, 16 * 1024),
            Err(RegionError::InvalidSize(0))
        ));
        assert!(Geometry::compute(1_000_000, 16, 16 * 1024).is_err());
        // log area leaves no room for a heap
        assert!(Geometry::compute(256 * 1024, 16, 16 * 1024).is_err());
    }

    #[test]
    fn test_header_validation() -> Result<(), RegionError> {
        let g = Geometry::compute(1 << 20, 4, 4096)?;
        let header = RegionHeader::new(&g, [7; 16]);
        assert_eq!(header.validate(1 << 20), Ok(g));
        assert!(header.validate(2 << 20).is_err());

        let mut broken = RegionHeader::new(&g, [7; 16]);
        broken.heap_size -= 1;
        assert!(broken.validate(1 << 20).is_err());
        Ok(())
    }

    #[test]
    fn test_size_classes() {
        assert_eq!(size_class(0), Some(0));
        assert_eq!(size_class(16), Some(0));
        assert_eq!(size_class(17), Some(1));
        assert_eq!(size_class(48), Some(1));
        assert_eq!(size_class(100), Some(3));
        assert_eq!(class_block_size(3), 256);
        assert_eq!(size_class(u64::MAX), None);
    }

    #[test]
    fn test_block_header_roundtrip() {
        let header = BlockHeader {
            class: 5,
            state: BlockState::Allocated,
        };
        assert_eq!(BlockHeader::decode(header.encode()), Some(header));
        assert_eq!(BlockHeader::decode(0), None);
        assert_eq!(BlockHeader::decode(header.encode() & !0xFF), None);
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align_to(1, 64), 64);
        assert_eq!(align_to(64, 64), 64);
        assert_eq!(align_to(65, 64), 128);
    }
}
