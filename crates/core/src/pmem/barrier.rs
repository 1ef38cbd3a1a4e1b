//! Persist Barrier - flush + fence ordering primitive
//!
//! `flush` marks a range as needing durability, `drain` makes every marked
//! range durable and fences. Anything that claims data is durable (a log
//! entry, a commit record, the clean flag) must be drained only after the
//! data it describes has been drained.

use super::mapping::Mapping;
use crate::error::{ConfigError, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{Ordering, fence};
use tracing::trace;

#[cfg(target_arch = "x86_64")]
use super::layout::CACHE_LINE;

/// How stores are pushed to the persistence domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// `msync` of the dirty pages; correct for any file-backed mapping
    #[default]
    Msync,
    /// `clflush` per cache line and `sfence`; for DAX-mapped persistent memory
    CacheLine,
}

impl FlushMode {
    /// Fail if this mode cannot work on the current host
    pub fn ensure_supported(&self) -> Result<()> {
        match self {
            FlushMode::Msync => Ok(()),
            FlushMode::CacheLine if cfg!(target_arch = "x86_64") => Ok(()),
            FlushMode::CacheLine => {
                Err(ConfigError::UnsupportedFlushMode(self.to_string()).into())
            }
        }
    }
}

impl fmt::Display for FlushMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushMode::Msync => write!(f, "msync"),
            FlushMode::CacheLine => write!(f, "cache_line"),
        }
    }
}

impl FromStr for FlushMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "msync" => Ok(FlushMode::Msync),
            "cache_line" | "cacheline" | "clflush" => Ok(FlushMode::CacheLine),
            other => Err(ConfigError::Invalid(format!("unknown flush mode: {}", other)).into()),
        }
    }
}

/// Pending flushes against one mapping
pub struct PersistBarrier<'m> {
    mapping: &'m Mapping,
    mode: FlushMode,
    pending: Vec<(u64, u64)>,
}

impl<'m> PersistBarrier<'m> {
    pub fn new(mapping: &'m Mapping, mode: FlushMode) -> Self {
        Self {
            mapping,
            mode,
            pending: Vec::new(),
        }
    }

    /// Mark `[offset, offset + len)` as needing durability
    pub fn flush(&mut self, offset: u64, len: usize) {
        if len == 0 {
            return;
        }
        match self.mode {
            FlushMode::Msync => self.pending.push((offset, offset + len as u64)),
            FlushMode::CacheLine => {
                self.pending.push((offset, offset + len as u64));
                flush_lines(self.mapping, offset, len);
            }
        }
    }

    /// Make every flushed range durable, then fence
    pub fn drain(&mut self) -> Result<()> {
        if self.mode == FlushMode::Msync {
            for (start, end) in coalesce(&mut self.pending) {
                self.mapping.flush_range(start, (end - start) as usize)?;
            }
        }
        self.pending.clear();
        store_fence();
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Forget pending ranges without draining them; returns what was dropped
    pub fn discard(&mut self) -> Vec<(u64, u64)> {
        trace!("Discarding {} pending flush ranges", self.pending.len());
        std::mem::take(&mut self.pending)
    }
}

/// Flush and drain a single range
pub fn persist(mapping: &Mapping, mode: FlushMode, offset: u64, len: usize) -> Result<()> {
    let mut barrier = PersistBarrier::new(mapping, mode);
    barrier.flush(offset, len);
    barrier.drain()
}

/// Sort ranges and merge any that overlap or touch
fn coalesce(ranges: &mut [(u64, u64)]) -> Vec<(u64, u64)> {
    ranges.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for &(start, end) in ranges.iter() {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

#[cfg(target_arch = "x86_64")]
fn flush_lines(mapping: &Mapping, offset: u64, len: usize) {
    let first = offset & !(CACHE_LINE as u64 - 1);
    let end = offset + len as u64;
    let mut line = first;
    while line < end {
        let addr = mapping.address(line);
        unsafe { std::arch::x86_64::_mm_clflush(addr) };
        line += CACHE_LINE as u64;
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn flush_lines(_mapping: &Mapping, _offset: u64, _len: usize) {
    // unreachable: ensure_supported rejects CacheLine on this target
}

#[inline]
fn store_fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_mm_sfence()
    };
    fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_coalesce() {
        let mut ranges = vec![(100, 200), (0, 50), (150, 300), (300, 310), (400, 401)];
        assert_eq!(
            coalesce(&mut ranges),
            vec![(0, 50), (100, 310), (400, 401)]
        );
    }

    #[test]
    fn test_flush_mode_parse() -> Result<()> {
        assert_eq!("msync".parse::<FlushMode>()?, FlushMode::Msync);
        assert_eq!("CACHE_LINE".parse::<FlushMode>()?, FlushMode::CacheLine);
        assert!("fsync".parse::<FlushMode>().is_err());
        assert_eq!(FlushMode::CacheLine.to_string(), "cache_line");
        Ok(())
    }

    #[test]
    fn test_flush_mode_serde() -> std::result::Result<(), serde_json::Error> {
        let mode: FlushMode = serde_json::from_str("\"cache_line\"")?;
        assert_eq!(mode, FlushMode::CacheLine);
        assert_eq!(serde_json::to_string(&FlushMode::Msync)?, "\"msync\"");
        Ok(())
    }

    #[test]
    fn test_drain_clears_pending() -> Result<()> {
        let dir = tempdir()?;
        let mapping = Mapping::create(&dir.path().join("r.pm"), 16 * 1024)?;
        let mut barrier = PersistBarrier::new(&mapping, FlushMode::Msync);
        mapping.write(10, b"hello");
        barrier.flush(10, 5);
        barrier.flush(8000, 64);
        assert!(barrier.has_pending());
        barrier.drain()?;
        assert!(!barrier.has_pending());
        Ok(())
    }

    #[test]
    fn test_discard_returns_ranges() -> Result<()> {
        let dir = tempdir()?;
        let mapping = Mapping::create(&dir.path().join("r.pm"), 16 * 1024)?;
        let mut barrier = PersistBarrier::new(&mapping, FlushMode::Msync);
        barrier.flush(64, 8);
        assert_eq!(barrier.discard(), vec![(64, 72)]);
        assert!(!barrier.has_pending());
        Ok(())
    }
}
