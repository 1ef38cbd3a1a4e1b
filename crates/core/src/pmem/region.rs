//! Region - handle to one open persistent region
//!
//! A `Region` owns the mapping of a region file and the volatile state that
//! goes with an open session: lane ownership, transaction id counters, the
//! allocator's carve lock and statistics. Handles are shared as
//! `Arc<Region>` and obtained from [`super::manager::RegionManager`].

use super::allocator::{Heap, HeapAudit};
use super::barrier::FlushMode;
use super::failpoint::{FailPoint, FailPointSlot};
use super::layout::{BLOCK_HEADER_SIZE, Geometry};
use super::mapping::Mapping;
use super::recovery::RecoveryReport;
use crate::error::{AllocationError, RegionError, Result};
use crate::txn::Transaction;
use crate::txn::claims::WordClaims;
use crate::txn::lane::LaneSet;
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

pub type RegionId = u32;

/// Point-in-time statistics of an open region
#[derive(Debug, Clone, Default)]
pub struct RegionStats {
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub bytes_logged: u64,
    pub active_transactions: usize,
    pub lanes_in_use: u32,
    /// Times a CAS waited for another transaction's claim on its word
    pub claim_waits: u64,
    /// Report of the recovery run by the open that produced this handle
    pub last_recovery: Option<RecoveryReport>,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub committed: AtomicU64,
    pub aborted: AtomicU64,
    pub bytes_logged: AtomicU64,
}

pub struct Region {
    id: RegionId,
    name: String,
    path: PathBuf,
    pub(crate) mapping: Mapping,
    pub(crate) geometry: Geometry,
    pub(crate) mode: FlushMode,
    pub(crate) heap: Heap,
    pub(crate) lanes: LaneSet,
    pub(crate) claims: WordClaims,
    pub(crate) failpoint: FailPointSlot,
    pub(crate) counters: Counters,
    session: u64,
    txn_counter: AtomicU64,
    commit_counter: AtomicU64,
    active: AtomicUsize,
    closed: AtomicBool,
    crashed: AtomicBool,
    last_recovery: Mutex<Option<RecoveryReport>>,
}

impl Region {
    pub(crate) fn new(
        id: RegionId,
        name: String,
        path: PathBuf,
        mapping: Mapping,
        geometry: Geometry,
        mode: FlushMode,
        session: u64,
    ) -> Self {
        Self {
            id,
            name,
            path,
            mapping,
            geometry,
            mode,
            heap: Heap::new(geometry, mode),
            lanes: LaneSet::new(geometry.lane_count),
            claims: WordClaims::new(),
            failpoint: FailPointSlot::default(),
            counters: Counters::default(),
            session,
            txn_counter: AtomicU64::new(0),
            commit_counter: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            crashed: AtomicBool::new(false),
            last_recovery: Mutex::new(None),
        }
    }

    #[inline]
    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.geometry.size
    }

    #[inline]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// First offset of usable space
    #[inline]
    pub fn heap_offset(&self) -> u64 {
        self.geometry.heap_offset
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.mode
    }

    /// Session number of this open; the upper half of every transaction id
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Offset of the program's root object, 0 if none was set
    pub fn root(&self) -> u64 {
        self.mapping.header().root.load(Ordering::Acquire)
    }

    /// True if `[offset, offset + len)` lies in the region's usable space
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        self.geometry.in_heap(offset, len)
    }

    /// Start a transaction; waits if every log lane is in use
    pub fn begin(&self) -> Result<Transaction<'_>> {
        Transaction::begin(self)
    }

    /// Allocate `size` bytes in a transaction of its own
    pub fn allocate(&self, size: u64) -> Result<u64> {
        let mut txn = self.begin()?;
        let offset = txn.allocate(size)?;
        txn.commit()?;
        Ok(offset)
    }

    /// Allocate `size` bytes that read as zero
    pub fn allocate_zeroed(&self, size: u64) -> Result<u64> {
        let mut txn = self.begin()?;
        let offset = txn.allocate(size)?;
        txn.write_fresh(offset, &vec![0u8; size as usize])?;
        txn.commit()?;
        Ok(offset)
    }

    /// Move an allocation to a block of `new_size` bytes, keeping its
    /// contents up to the smaller of the two sizes
    pub fn reallocate(&self, offset: u64, new_size: u64) -> Result<u64> {
        let old_size = self.usable_size(offset)?;
        let mut txn = self.begin()?;
        let new_offset = txn.allocate(new_size)?;
        let keep = old_size.min(new_size) as usize;
        let contents = self.mapping.read_vec(offset, keep);
        txn.write_fresh(new_offset, &contents)?;
        txn.free(offset)?;
        txn.commit()?;
        Ok(new_offset)
    }

    /// Free an allocation in a transaction of its own
    pub fn deallocate(&self, offset: u64) -> Result<()> {
        let mut txn = self.begin()?;
        txn.free(offset)?;
        txn.commit()
    }

    /// Bytes usable at `offset`; at least what was asked for
    pub fn usable_size(&self, offset: u64) -> Result<u64> {
        let (_, header) = self.heap.allocated_block(&self.mapping, offset)?;
        Ok(header.block_size() - BLOCK_HEADER_SIZE)
    }

    /// Walk the heap and check the free lists; call while no transaction runs
    pub fn audit(&self) -> Result<HeapAudit> {
        self.heap.audit(&self.mapping)
    }

    /// Copy `len` bytes out of the region
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if !self.mapping.in_bounds(offset, len as u64) {
            return Err(AllocationError::InvalidOffset(offset).into());
        }
        Ok(self.mapping.read_vec(offset, len))
    }

    /// Atomically load an aligned word
    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        if offset % 8 != 0 || !self.mapping.in_bounds(offset, 8) {
            return Err(AllocationError::InvalidOffset(offset).into());
        }
        Ok(self.mapping.atomic_u64(offset).load(Ordering::Acquire))
    }

    /// An aligned heap word for unlogged atomic access. Changes made through
    /// it are not undone by abort or recovery.
    pub fn atomic(&self, offset: u64) -> Result<&AtomicU64> {
        if offset % 8 != 0 || !self.contains(offset, 8) {
            return Err(AllocationError::InvalidOffset(offset).into());
        }
        Ok(self.mapping.atomic_u64(offset))
    }

    /// True if the word at `offset` holds `value` because of a CAS whose
    /// transaction has not committed or aborted yet
    pub fn is_pending(&self, offset: u64, value: u64) -> bool {
        self.claims.is_pending(offset, value)
    }

    /// Flush and drain a range outside of any transaction
    pub fn persist(&self, offset: u64, len: usize) -> Result<()> {
        if !self.mapping.in_bounds(offset, len as u64) {
            return Err(AllocationError::InvalidOffset(offset).into());
        }
        super::barrier::persist(&self.mapping, self.mode, offset, len)
    }

    pub fn stats(&self) -> RegionStats {
        RegionStats {
            transactions_committed: self.counters.committed.load(Ordering::Relaxed),
            transactions_aborted: self.counters.aborted.load(Ordering::Relaxed),
            bytes_logged: self.counters.bytes_logged.load(Ordering::Relaxed),
            active_transactions: self.active.load(Ordering::Relaxed),
            lanes_in_use: self.lanes.in_use(),
            claim_waits: self.claims.waits(),
            last_recovery: self.last_recovery.lock().clone(),
        }
    }

    /// Arm a one-shot simulated crash at `point`
    pub fn arm_failpoint(&self, point: FailPoint) {
        debug!("Region {}: failpoint {:?} armed", self.name, point);
        self.failpoint.arm(point);
    }

    pub fn disarm_failpoint(&self) {
        self.failpoint.disarm();
    }

    /// True once a failpoint fired; the handle then refuses all work
    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_recovery(&self, report: RecoveryReport) {
        *self.last_recovery.lock() = Some(report);
    }

    pub(crate) fn next_txn_id(&self) -> u64 {
        let n = self.txn_counter.fetch_add(1, Ordering::Relaxed) + 1;
        (self.session << 32) | (n & 0xFFFF_FFFF)
    }

    pub(crate) fn next_commit_seq(&self) -> u64 {
        let n = self.commit_counter.fetch_add(1, Ordering::AcqRel) + 1;
        (self.session << 32) | (n & 0xFFFF_FFFF)
    }

    /// Register a transaction; fails on a closed or crashed handle
    pub(crate) fn enter(&self) -> Result<()> {
        self.active.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) || self.crashed.load(Ordering::SeqCst) {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return Err(RegionError::Closed(self.name.clone()).into());
        }
        Ok(())
    }

    pub(crate) fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn active_transactions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Claim the handle for closing; fails while transactions are in flight
    pub(crate) fn begin_close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(RegionError::Closed(self.name.clone()).into());
        }
        let active = self.active.load(Ordering::SeqCst);
        if active > 0 {
            self.closed.store(false, Ordering::SeqCst);
            return Err(RegionError::Busy {
                name: self.name.clone(),
                active,
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn mark_crashed(&self, point: FailPoint) {
        warn!(
            "Region {}: simulated crash at {:?}, handle is now unusable",
            self.name, point
        );
        self.crashed.store(true, Ordering::Release);
    }

    /// Stop using the handle after a failure that leaves the outcome of a
    /// transaction to recovery
    pub(crate) fn mark_failed(&self, reason: &dyn fmt::Display) {
        warn!(
            "Region {}: {}, handle is now unusable until reopened",
            self.name, reason
        );
        self.crashed.store(true, Ordering::Release);
    }

    pub(crate) fn closed_error(&self) -> crate::error::Error {
        RegionError::Closed(self.name.clone()).into()
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.geometry.size)
            .field("session", &self.session)
            .finish()
    }
}
