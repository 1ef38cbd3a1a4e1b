//! Persistent Allocator - size-classed heap inside a region
//!
//! This allocator provides:
//! - Power-of-two size classes from 32 bytes, one free list per class
//! - Self-describing blocks: a 16-byte header holds magic, class and state
//! - Lock-free free lists (tagged Treiber stacks, CAS on the head word)
//! - Spans carved from a persistent frontier under a rarely taken mutex
//!
//! Block headers are the source of truth. Free-list heads and links are
//! derived from them and rebuilt by recovery, so a crash in the middle of a
//! list splice never loses or duplicates a block.

use super::barrier::{FlushMode, PersistBarrier, persist};
use super::layout::{
    ALLOC_MAGIC, BLOCK_HEADER_SIZE, BlockHeader, BlockState, Geometry, NUM_SIZE_CLASSES,
    SPAN_SIZE, class_block_size, class_head_offset, frontier_offset,
};
use super::mapping::Mapping;
use crate::error::{AllocationError, RecoveryError, Result};
use crate::sync::Tagged;
use crossbeam_utils::Backoff;
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Result of walking the heap and its free lists
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapAudit {
    pub heap_bytes: u64,
    pub allocated_bytes: u64,
    pub free_bytes: u64,
    /// Bytes past the frontier, never carved
    pub unformatted_bytes: u64,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub free_listed_blocks: usize,
    /// Every free block is on exactly one list of its own class, and
    /// nothing else is on any list
    pub consistent: bool,
}

impl HeapAudit {
    /// Free space as seen by the allocator: listed blocks plus untouched heap
    pub fn available_bytes(&self) -> u64 {
        self.free_bytes + self.unformatted_bytes
    }
}

/// Counts from rebuilding the free lists
#[derive(Debug, Clone, Copy, Default)]
pub struct RebuildSummary {
    pub free_blocks: usize,
    pub allocated_blocks: usize,
}

pub struct Heap {
    geometry: Geometry,
    mode: FlushMode,
    carve_lock: Mutex<()>,
}

impl Heap {
    pub fn new(geometry: Geometry, mode: FlushMode) -> Self {
        Self {
            geometry,
            mode,
            carve_lock: Mutex::new(()),
        }
    }

    /// Write empty allocator metadata for a new region
    pub fn format(mapping: &Mapping, geometry: &Geometry, mode: FlushMode) -> Result<()> {
        let meta = geometry.alloc_meta_offset;
        mapping.atomic_u64(meta).store(ALLOC_MAGIC, Ordering::Release);
        mapping
            .atomic_u64(frontier_offset(geometry))
            .store(geometry.heap_offset, Ordering::Release);
        for class in 0..NUM_SIZE_CLASSES {
            mapping
                .atomic_u64(class_head_offset(geometry, class))
                .store(0, Ordering::Release);
        }
        persist(mapping, mode, meta, 16 + NUM_SIZE_CLASSES * 8)?;
        debug!(
            "Heap formatted: {} bytes at {:#x}",
            geometry.heap_size, geometry.heap_offset
        );
        Ok(())
    }

    /// True if the metadata page carries the allocator magic and a sane frontier
    pub fn meta_is_valid(&self, mapping: &Mapping) -> bool {
        let magic = mapping
            .atomic_u64(self.geometry.alloc_meta_offset)
            .load(Ordering::Acquire);
        let frontier = self.frontier(mapping);
        magic == ALLOC_MAGIC
            && frontier >= self.geometry.heap_offset
            && frontier <= self.geometry.size
    }

    #[inline]
    fn head<'m>(&self, mapping: &'m Mapping, class: usize) -> &'m AtomicU64 {
        mapping.atomic_u64(class_head_offset(&self.geometry, class))
    }

    #[inline]
    fn frontier(&self, mapping: &Mapping) -> u64 {
        mapping
            .atomic_u64(frontier_offset(&self.geometry))
            .load(Ordering::Acquire)
    }

    #[inline]
    fn next_link<'m>(&self, mapping: &'m Mapping, block: u64) -> &'m AtomicU64 {
        mapping.atomic_u64(block + 8)
    }

    /// Decode the header of the block at `block`, if it is one
    pub fn header_at(&self, mapping: &Mapping, block: u64) -> Option<BlockHeader> {
        if block % 8 != 0 || block < self.geometry.heap_offset {
            return None;
        }
        if block + BLOCK_HEADER_SIZE > self.frontier(mapping) {
            return None;
        }
        let word = mapping.atomic_u64(block).load(Ordering::Acquire);
        let header = BlockHeader::decode(word)?;
        (block + header.block_size() <= self.frontier(mapping)).then_some(header)
    }

    /// Resolve a user offset to its block, checking it is a live allocation
    pub fn allocated_block(&self, mapping: &Mapping, offset: u64) -> Result<(u64, BlockHeader)> {
        let block = offset
            .checked_sub(BLOCK_HEADER_SIZE)
            .ok_or(AllocationError::InvalidOffset(offset))?;
        let header = self
            .header_at(mapping, block)
            .ok_or(AllocationError::InvalidOffset(offset))?;
        match header.state {
            BlockState::Allocated => Ok((block, header)),
            BlockState::Free => Err(AllocationError::DoubleFree(offset).into()),
        }
    }

    /// Set a block's state in place; the caller decides how it is flushed
    pub fn set_state(&self, mapping: &Mapping, block: u64, class: u8, state: BlockState) {
        let word = BlockHeader { class, state }.encode();
        mapping.atomic_u64(block).store(word, Ordering::Release);
    }

    /// Take a free block of `class` off its list, carving a new span if the
    /// list is empty. The block's header still reads FREE.
    pub fn take_block(&self, mapping: &Mapping, class: usize) -> Result<u64> {
        if let Some(block) = self.pop(mapping, class) {
            return Ok(block);
        }
        match self.carve(mapping, class)? {
            Some(block) => Ok(block),
            None => Err(AllocationError::OutOfSpace(class_block_size(class)).into()),
        }
    }

    fn pop(&self, mapping: &Mapping, class: usize) -> Option<u64> {
        let head = self.head(mapping, class);
        let backoff = Backoff::new();
        loop {
            let current = Tagged::from_raw(head.load(Ordering::Acquire));
            if current.is_null() {
                return None;
            }
            let next = self
                .next_link(mapping, current.offset())
                .load(Ordering::Acquire);
            let new = current.successor(next);
            if head
                .compare_exchange(
                    current.raw(),
                    new.raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(current.offset());
            }
            backoff.spin();
        }
    }

    /// Put a free block back on its list
    pub fn push(&self, mapping: &Mapping, class: usize, block: u64) {
        self.push_chain(mapping, class, block, block);
    }

    /// Push an already linked chain `first ..= last` in one CAS
    fn push_chain(&self, mapping: &Mapping, class: usize, first: u64, last: u64) {
        let head = self.head(mapping, class);
        let backoff = Backoff::new();
        loop {
            let current = Tagged::from_raw(head.load(Ordering::Acquire));
            self.next_link(mapping, last)
                .store(current.offset(), Ordering::Release);
            let new = current.successor(first);
            if head
                .compare_exchange(
                    current.raw(),
                    new.raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    /// Format a span of `class` blocks at the frontier. Returns the first
    /// block to the caller and pushes the rest; `None` when the heap is full.
    fn carve(&self, mapping: &Mapping, class: usize) -> Result<Option<u64>> {
        let _guard = self.carve_lock.lock();

        // another thread may have carved while we waited
        if let Some(block) = self.pop(mapping, class) {
            return Ok(Some(block));
        }

        let block_size = class_block_size(class);
        let frontier = self.frontier(mapping);
        let available = self.geometry.size - frontier;
        let span = SPAN_SIZE.max(block_size).min(available / block_size * block_size);
        if span < block_size {
            return Ok(None);
        }

        let count = span / block_size;
        for i in 0..count {
            let block = frontier + i * block_size;
            let next = if i + 1 < count { block + block_size } else { 0 };
            self.set_state(mapping, block, class as u8, BlockState::Free);
            self.next_link(mapping, block).store(next, Ordering::Release);
        }
        persist(mapping, self.mode, frontier, span as usize)?;

        // headers are durable before the frontier that covers them
        mapping
            .atomic_u64(frontier_offset(&self.geometry))
            .store(frontier + span, Ordering::Release);
        persist(mapping, self.mode, frontier_offset(&self.geometry), 8)?;

        debug!(
            "Carved {} blocks of {} bytes at {:#x}, frontier now {:#x}",
            count,
            block_size,
            frontier,
            frontier + span
        );

        if count > 1 {
            let last = frontier + (count - 1) * block_size;
            self.push_chain(mapping, class, frontier + block_size, last);
        }
        Ok(Some(frontier))
    }

    /// Visit every carved block in address order
    fn walk(
        &self,
        mapping: &Mapping,
        mut visit: impl FnMut(u64, BlockHeader),
    ) -> std::result::Result<(), RecoveryError> {
        let frontier = self.frontier(mapping);
        let mut block = self.geometry.heap_offset;
        while block < frontier {
            let word = mapping.atomic_u64(block).load(Ordering::Acquire);
            let header = BlockHeader::decode(word).ok_or_else(|| {
                RecoveryError::IrrecoverableCorruption(format!(
                    "bad block header {:#018x} at {:#x}",
                    word, block
                ))
            })?;
            if block + header.block_size() > frontier {
                return Err(RecoveryError::IrrecoverableCorruption(format!(
                    "block at {:#x} runs past the frontier {:#x}",
                    block, frontier
                )));
            }
            visit(block, header);
            block += header.block_size();
        }
        Ok(())
    }

    /// Rebuild every free list from the block headers
    pub fn rebuild(&self, mapping: &Mapping) -> Result<RebuildSummary> {
        if !self.meta_is_valid(mapping) {
            return Err(RecoveryError::IrrecoverableCorruption(
                "allocator metadata is damaged".into(),
            )
            .into());
        }

        let mut chains: Vec<Vec<u64>> = vec![Vec::new(); NUM_SIZE_CLASSES];
        let mut summary = RebuildSummary::default();
        self.walk(mapping, |block, header| match header.state {
            BlockState::Free => {
                chains[header.class as usize].push(block);
                summary.free_blocks += 1;
            }
            BlockState::Allocated => summary.allocated_blocks += 1,
        })?;

        for (class, chain) in chains.iter().enumerate() {
            for pair in chain.windows(2) {
                self.next_link(mapping, pair[0])
                    .store(pair[1], Ordering::Release);
            }
            if let Some(&last) = chain.last() {
                self.next_link(mapping, last).store(0, Ordering::Release);
            }
            let head = self.head(mapping, class);
            let old = Tagged::from_raw(head.load(Ordering::Acquire));
            let first = chain.first().copied().unwrap_or(0);
            head.store(old.successor(first).raw(), Ordering::Release);
        }
        // links and heads are derived; a crash here just rebuilds again
        let heap_offset = self.geometry.heap_offset;
        let mut barrier = PersistBarrier::new(mapping, self.mode);
        barrier.flush(heap_offset, (self.frontier(mapping) - heap_offset) as usize);
        barrier.flush(class_head_offset(&self.geometry, 0), NUM_SIZE_CLASSES * 8);
        barrier.drain()?;

        info!(
            "Free lists rebuilt: {} free blocks, {} allocated blocks",
            summary.free_blocks, summary.allocated_blocks
        );
        Ok(summary)
    }

    /// Check the free lists against the block headers. Meaningful only when
    /// no allocation is in flight.
    pub fn audit(&self, mapping: &Mapping) -> Result<HeapAudit> {
        let frontier = self.frontier(mapping);
        let mut audit = HeapAudit {
            heap_bytes: self.geometry.heap_size,
            unformatted_bytes: self.geometry.size - frontier,
            ..HeapAudit::default()
        };

        let mut free: HashSet<(u64, u8)> = HashSet::new();
        self.walk(mapping, |block, header| match header.state {
            BlockState::Free => {
                audit.free_bytes += header.block_size();
                audit.free_blocks += 1;
                free.insert((block, header.class));
            }
            BlockState::Allocated => {
                audit.allocated_bytes += header.block_size();
                audit.allocated_blocks += 1;
            }
        })?;

        let mut consistent = true;
        let mut seen: HashSet<u64> = HashSet::new();
        for class in 0..NUM_SIZE_CLASSES {
            let mut node = Tagged::from_raw(self.head(mapping, class).load(Ordering::Acquire)).offset();
            while node != 0 {
                if !free.contains(&(node, class as u8)) || !seen.insert(node) {
                    consistent = false;
                    break;
                }
                audit.free_listed_blocks += 1;
                node = self.next_link(mapping, node).load(Ordering::Acquire);
            }
        }
        audit.consistent = consistent && audit.free_listed_blocks == audit.free_blocks;
        Ok(audit)
    }
}
