//! Log lanes
//!
//! The log area is cut into fixed-size lanes. A transaction owns one lane
//! from `begin` until its outcome is applied; its entries are appended to
//! the lane back to back, starting with a `Begin` entry at the lane start.
//! A lane is empty when its first bytes do not decode as a `Begin`.

use super::entry::{ENTRY_HEADER_SIZE, EntryKind, LogEntry};
use crate::error::{Result, TransactionError};
use crate::pmem::barrier::{FlushMode, PersistBarrier, persist};
use crate::pmem::layout::Geometry;
use crate::pmem::mapping::Mapping;
use crossbeam_utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Volatile ownership bitmap of the lanes of one region
pub struct LaneSet {
    words: Vec<CachePadded<AtomicU64>>,
    count: u32,
}

impl LaneSet {
    pub fn new(count: u32) -> Self {
        let words = (0..count.div_ceil(64))
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect();
        Self { words, count }
    }

    /// Claim a free lane, waiting while every lane is owned
    pub fn acquire(&self) -> u32 {
        let backoff = Backoff::new();
        loop {
            if let Some(lane) = self.try_acquire() {
                return lane;
            }
            backoff.snooze();
        }
    }

    pub fn try_acquire(&self) -> Option<u32> {
        for (i, word) in self.words.iter().enumerate() {
            let mut current = word.load(Ordering::Acquire);
            loop {
                let lanes_here = (self.count - i as u32 * 64).min(64);
                let valid = if lanes_here == 64 {
                    u64::MAX
                } else {
                    (1u64 << lanes_here) - 1
                };
                let free = !current & valid;
                if free == 0 {
                    break;
                }
                let bit = free.trailing_zeros();
                match word.compare_exchange_weak(
                    current,
                    current | (1 << bit),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(i as u32 * 64 + bit),
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }

    pub fn release(&self, lane: u32) {
        let word = &self.words[(lane / 64) as usize];
        word.fetch_and(!(1 << (lane % 64)), Ordering::Release);
    }

    pub fn in_use(&self) -> u32 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones())
            .sum()
    }
}

/// Append position inside one owned lane
pub struct LaneCursor {
    pub lane: u32,
    start: u64,
    end: u64,
    pos: u64,
}

impl LaneCursor {
    pub fn new(geometry: &Geometry, lane: u32) -> Self {
        let start = geometry.lane_offset(lane);
        Self {
            lane,
            start,
            end: start + geometry.lane_size as u64,
            pos: start,
        }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        (self.end - self.pos) as usize
    }

    #[inline]
    pub fn used(&self) -> usize {
        (self.pos - self.start) as usize
    }

    /// Write an entry at the cursor and flush it (not drained).
    /// Returns the entry's offset.
    pub fn append(
        &mut self,
        mapping: &Mapping,
        barrier: &mut PersistBarrier<'_>,
        entry: &LogEntry,
    ) -> Result<u64> {
        let needed = entry.encoded_len();
        if needed > self.remaining() {
            return Err(TransactionError::LogSpaceExhausted {
                needed,
                remaining: self.remaining(),
            }
            .into());
        }
        let bytes = entry.encode()?;
        let at = self.pos;
        mapping.write(at, &bytes);
        barrier.flush(at, bytes.len());
        self.pos += bytes.len() as u64;
        trace!(
            "lane {} += {:?} seq {} at {:#x}",
            self.lane, entry.kind, entry.seq, at
        );
        Ok(at)
    }

    /// Take back the last entry appended at `at`
    pub fn retract(&mut self, mapping: &Mapping, mode: FlushMode, at: u64) -> Result<()> {
        debug_assert!(at >= self.start && at < self.pos);
        mapping.zero(at, ENTRY_HEADER_SIZE);
        persist(mapping, mode, at, ENTRY_HEADER_SIZE)?;
        self.pos = at;
        Ok(())
    }

    /// Empty the lane: destroy the `Begin` header durably
    pub fn truncate(&mut self, mapping: &Mapping, mode: FlushMode) -> Result<()> {
        truncate_lane(mapping, mode, self.start)?;
        self.pos = self.start;
        Ok(())
    }
}

pub fn truncate_lane(mapping: &Mapping, mode: FlushMode, lane_start: u64) -> Result<()> {
    mapping.zero(lane_start, ENTRY_HEADER_SIZE);
    persist(mapping, mode, lane_start, ENTRY_HEADER_SIZE)
}

/// Read the surviving entries of a lane: a valid `Begin` followed by every
/// entry of the same transaction with consecutive sequence numbers
pub fn scan_lane(mapping: &Mapping, geometry: &Geometry, lane: u32) -> Vec<LogEntry> {
    let start = geometry.lane_offset(lane);
    let bytes = mapping.read_vec(start, geometry.lane_size as usize);

    let mut entries: Vec<LogEntry> = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let Some(entry) = LogEntry::decode(&bytes[pos..]) else {
            break;
        };
        let expected_seq = entries.len() as u32;
        let belongs = match entries.first() {
            None => entry.kind == EntryKind::Begin,
            Some(begin) => begin.txn_id == entry.txn_id && entry.kind != EntryKind::Begin,
        };
        if !belongs || entry.seq != expected_seq {
            break;
        }
        pos += entry.encoded_len();
        let terminal = matches!(entry.kind, EntryKind::Commit | EntryKind::Abort);
        entries.push(entry);
        if terminal {
            break;
        }
    }
    entries
}
