//! Transactions - undo/redo logged updates to a region
//!
//! Write path for a logged update:
//!
//! 1. capture the before-image, append an `Update` entry (before ‖ after)
//! 2. drain the log, so the entry is durable before the data changes
//! 3. write the after-image in place and flush it, without draining
//!
//! Commit drains everything the transaction wrote without logging (fresh
//! blocks, block headers), then appends and drains the `Commit` entry. That
//! drain is the commit point. The in-place data is drained after it; if a
//! crash loses it, recovery redoes it from the after-images.
//!
//! A successful CAS claims its word until the transaction ends (see
//! [`super::claims`]); CASes of other transactions on that word wait.

use super::entry::{ENTRY_HEADER_SIZE, EntryKind, LogEntry};
use super::lane::LaneCursor;
use crate::error::{AllocationError, Result, TransactionError};
use crate::pmem::barrier::PersistBarrier;
use crate::pmem::failpoint::FailPoint;
use crate::pmem::layout::{
    BLOCK_HEADER_SIZE, BlockState, ROOT_OFFSET, class_block_size, size_class,
};
use crate::pmem::region::Region;
use std::io;
use std::sync::atomic::Ordering;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// What abort needs to roll one entry back
#[derive(Debug)]
enum Undo {
    Update { target: u64, before: Vec<u8> },
    Cas { target: u64, expected: u64, new: u64 },
    Alloc { block: u64, class: u8 },
    Free { block: u64, class: u8 },
}

pub struct Transaction<'r> {
    region: &'r Region,
    id: u64,
    seq: u32,
    state: TxnState,
    cursor: LaneCursor,
    /// log entries and unlogged writes that must precede the next entry
    log_barrier: PersistBarrier<'r>,
    /// logged in-place writes, drained after the commit point
    data_barrier: PersistBarrier<'r>,
    undo: Vec<Undo>,
    /// `[start, end)` user ranges of blocks allocated by this transaction
    fresh: Vec<(u64, u64)>,
    /// words this transaction claimed with a CAS
    claimed: Vec<u64>,
    lane_held: bool,
}

impl<'r> Transaction<'r> {
    pub(crate) fn begin(region: &'r Region) -> Result<Self> {
        region.enter()?;
        let lane = region.lanes.acquire();
        let mut txn = Self {
            region,
            id: region.next_txn_id(),
            seq: 0,
            state: TxnState::Active,
            cursor: LaneCursor::new(&region.geometry, lane),
            log_barrier: PersistBarrier::new(&region.mapping, region.mode),
            data_barrier: PersistBarrier::new(&region.mapping, region.mode),
            undo: Vec::new(),
            fresh: Vec::new(),
            claimed: Vec::new(),
            lane_held: true,
        };

        let begin = LogEntry::marker(EntryKind::Begin, txn.id, 0);
        if let Err(e) = txn.append(&begin).and_then(|_| txn.log_barrier.drain()) {
            txn.state = TxnState::Aborted;
            txn.release();
            return Err(e);
        }
        trace!("txn {:#x} began on lane {}", txn.id, lane);
        Ok(txn)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn region(&self) -> &'r Region {
        self.region
    }

    /// Log bytes used so far in this transaction's lane
    pub fn log_used(&self) -> usize {
        self.cursor.used()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TxnState::Active => Ok(()),
            _ => Err(TransactionError::NoActiveTransaction.into()),
        }
    }

    /// Append an entry, keeping room for the closing commit or abort
    fn append(&mut self, entry: &LogEntry) -> Result<u64> {
        let reserve = match entry.kind {
            EntryKind::Commit | EntryKind::Abort => 0,
            _ => ENTRY_HEADER_SIZE,
        };
        let needed = entry.encoded_len();
        if needed + reserve > self.cursor.remaining() {
            return Err(TransactionError::LogSpaceExhausted {
                needed,
                remaining: self.cursor.remaining().saturating_sub(reserve),
            }
            .into());
        }
        let at = self
            .cursor
            .append(&self.region.mapping, &mut self.log_barrier, entry)?;
        self.seq += 1;
        self.region
            .counters
            .bytes_logged
            .fetch_add(needed as u64, Ordering::Relaxed);
        Ok(at)
    }

    /// Append an entry and make it durable
    fn log(&mut self, entry: &LogEntry) -> Result<u64> {
        let at = self.append(entry)?;
        self.log_barrier.drain()?;
        Ok(at)
    }

    fn store(&self, offset: u64, bytes: &[u8]) {
        let mapping = &self.region.mapping;
        if bytes.len() == 8 && offset % 8 == 0 {
            let mut word = [0u8; 8];
            word.copy_from_slice(bytes);
            mapping
                .atomic_u64(offset)
                .store(u64::from_le_bytes(word), Ordering::Release);
        } else {
            mapping.write(offset, bytes);
        }
    }

    /// Logged write of `bytes` at `offset` (the `log(addr, len, new_bytes)`
    /// operation): durable once the transaction commits, undone on abort
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.ensure_active()?;
        if !self.region.contains(offset, bytes.len() as u64) {
            return Err(AllocationError::InvalidOffset(offset).into());
        }
        self.write_logged(offset, bytes)
    }

    fn write_logged(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let before = self.region.mapping.read_vec(offset, bytes.len());
        let entry = LogEntry::update(self.id, self.seq, offset, &before, bytes);
        self.log(&entry)?;

        self.store(offset, bytes);
        self.data_barrier.flush(offset, bytes.len());
        self.undo.push(Undo::Update {
            target: offset,
            before,
        });
        Ok(())
    }

    pub fn write_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Record `offset` as the region's root object
    pub fn set_root(&mut self, offset: u64) -> Result<()> {
        self.ensure_active()?;
        if offset != 0 && !self.region.contains(offset, 1) {
            return Err(AllocationError::InvalidOffset(offset).into());
        }
        self.write_logged(ROOT_OFFSET, &offset.to_le_bytes())
    }

    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.region.read(offset, len)
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        self.region.read_u64(offset)
    }

    /// Logged compare-and-swap of one aligned word. The entry is durable
    /// before the swap; a failed swap takes its entry back.
    ///
    /// If another live transaction swapped this word, waits until it commits
    /// or aborts and compares against what the word holds then. A wait that
    /// would deadlock fails with `Deadlock`.
    ///
    /// `new` must not have been installed at `offset` before by anyone
    /// else; tag the word (see [`crate::sync::Tagged`]) to make it unique.
    pub fn compare_and_swap(&mut self, offset: u64, expected: u64, new: u64) -> Result<bool> {
        self.ensure_active()?;
        if offset % 8 != 0 || !self.region.contains(offset, 8) {
            return Err(AllocationError::InvalidOffset(offset).into());
        }
        let region = self.region;
        let was_new = region.claims.acquire(self.id, offset, new)?;
        let swapped = if region.is_crashed() {
            Err(region.closed_error())
        } else {
            self.swap_claimed(offset, expected, new)
        };
        match swapped {
            Ok(true) => {
                if was_new {
                    self.claimed.push(offset);
                }
            }
            _ => region.claims.undo_acquire(self.id, offset, new, was_new),
        }
        swapped
    }

    fn swap_claimed(&mut self, offset: u64, expected: u64, new: u64) -> Result<bool> {
        let region = self.region;
        let word = region.mapping.atomic_u64(offset);
        if word.load(Ordering::Acquire) != expected {
            return Ok(false);
        }

        let entry = LogEntry::cas(self.id, self.seq, offset, expected, new);
        let at = self.log(&entry)?;

        match word.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                self.data_barrier.flush(offset, 8);
                self.undo.push(Undo::Cas {
                    target: offset,
                    expected,
                    new,
                });
                Ok(true)
            }
            Err(_) => {
                self.cursor.retract(&region.mapping, region.mode, at)?;
                self.seq -= 1;
                Ok(false)
            }
        }
    }

    /// Initialise memory of a block this transaction allocated. Not logged:
    /// abort discards the whole block.
    pub fn write_fresh(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.ensure_active()?;
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or(AllocationError::InvalidOffset(offset))?;
        if !self
            .fresh
            .iter()
            .any(|&(start, stop)| offset >= start && end <= stop)
        {
            return Err(TransactionError::NotAllocatedHere(offset).into());
        }
        self.store(offset, bytes);
        self.log_barrier.flush(offset, bytes.len());
        Ok(())
    }

    /// Allocate `size` bytes; released again if the transaction aborts
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        self.ensure_active()?;
        let class = size_class(size).ok_or(AllocationError::SizeTooLarge(size))?;
        let region = self.region;
        let heap = &region.heap;
        let mapping = &region.mapping;
        let block = heap.take_block(mapping, class)?;

        let entry = LogEntry::block(EntryKind::Alloc, self.id, self.seq, block, class as u8);
        if let Err(e) = self.log(&entry) {
            heap.push(mapping, class, block);
            return Err(e);
        }

        heap.set_state(mapping, block, class as u8, BlockState::Allocated);
        self.log_barrier.flush(block, 8);
        self.undo.push(Undo::Alloc {
            block,
            class: class as u8,
        });

        let offset = block + BLOCK_HEADER_SIZE;
        self.fresh.push((offset, block + class_block_size(class)));
        debug!(
            "txn {:#x} allocated {} bytes at {:#x} (class {})",
            self.id, size, offset, class
        );
        Ok(offset)
    }

    /// Free an allocation when this transaction commits
    pub fn free(&mut self, offset: u64) -> Result<()> {
        self.ensure_active()?;
        let (block, header) = self
            .region
            .heap
            .allocated_block(&self.region.mapping, offset)?;
        let pending = self
            .undo
            .iter()
            .any(|u| matches!(u, Undo::Free { block: b, .. } if *b == block));
        if pending {
            return Err(AllocationError::DoubleFree(offset).into());
        }

        let entry = LogEntry::block(EntryKind::Free, self.id, self.seq, block, header.class);
        self.log(&entry)?;
        self.undo.push(Undo::Free {
            block,
            class: header.class,
        });
        self.fresh.retain(|&(start, _)| start != offset);
        debug!("txn {:#x} will free {:#x}", self.id, offset);
        Ok(())
    }

    /// Make the transaction durable and apply its deferred frees
    pub fn commit(&mut self) -> Result<()> {
        match self.state {
            TxnState::Active => {}
            TxnState::Committed => return Err(TransactionError::DoubleCommit(self.id).into()),
            TxnState::Aborted => return Err(TransactionError::NoActiveTransaction.into()),
        }
        let region = self.region;
        let mapping = &region.mapping;
        if region.is_crashed() {
            return Err(region.closed_error());
        }

        // everything the commit record vouches for goes first
        self.log_barrier.drain()?;

        let mut commit = LogEntry::marker(EntryKind::Commit, self.id, self.seq);
        commit.target = region.next_commit_seq();
        let at = self.append(&commit)?;

        if region.failpoint.take(FailPoint::BeforeCommitDrain) {
            // the record never reached media
            mapping.zero(at, commit.encoded_len());
            self.log_barrier.discard();
            return Err(self.crash(FailPoint::BeforeCommitDrain));
        }

        if let Err(e) = self.drain_commit() {
            self.take_back_commit(at, &e);
            return Err(e);
        }
        self.state = TxnState::Committed;

        if region.failpoint.take(FailPoint::AfterCommitDrain) {
            // the in-place writes never reached media
            for undo in self.undo.iter().rev() {
                match undo {
                    Undo::Update { target, before } => self.store(*target, before),
                    Undo::Cas {
                        target, expected, ..
                    } => mapping.atomic_u64(*target).store(*expected, Ordering::Release),
                    Undo::Alloc { .. } | Undo::Free { .. } => {}
                }
            }
            self.data_barrier.discard();
            return Err(self.crash(FailPoint::AfterCommitDrain));
        }

        self.data_barrier.drain()?;

        let mut freed = Vec::new();
        for undo in &self.undo {
            if let Undo::Free { block, class } = *undo {
                region
                    .heap
                    .set_state(mapping, block, class, BlockState::Free);
                self.data_barrier.flush(block, 8);
                freed.push((block, class));
            }
        }
        self.data_barrier.drain()?;

        if region.failpoint.take(FailPoint::BeforeTruncate) {
            return Err(self.crash(FailPoint::BeforeTruncate));
        }

        self.cursor.truncate(mapping, region.mode)?;
        for (block, class) in freed {
            region.heap.push(mapping, class as usize, block);
        }
        region.counters.committed.fetch_add(1, Ordering::Relaxed);
        trace!("txn {:#x} committed", self.id);
        self.release();
        Ok(())
    }

    /// Roll back every change and release the log lane
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_active()?;
        let region = self.region;
        let mapping = &region.mapping;

        let mut released = Vec::new();
        for undo in self.undo.iter().rev() {
            match *undo {
                Undo::Update {
                    target,
                    ref before,
                } => {
                    self.store(target, before);
                    self.data_barrier.flush(target, before.len());
                }
                Undo::Cas {
                    target,
                    expected,
                    new,
                } => {
                    if mapping
                        .atomic_u64(target)
                        .compare_exchange(new, expected, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.data_barrier.flush(target, 8);
                    }
                }
                Undo::Alloc { block, class } => {
                    region
                        .heap
                        .set_state(mapping, block, class, BlockState::Free);
                    self.data_barrier.flush(block, 8);
                    released.push((block, class));
                }
                Undo::Free { .. } => {}
            }
        }
        self.data_barrier.drain()?;
        self.log_barrier.drain()?;

        let abort = LogEntry::marker(EntryKind::Abort, self.id, self.seq);
        self.log(&abort)?;
        self.cursor.truncate(mapping, region.mode)?;
        self.state = TxnState::Aborted;

        for (block, class) in released {
            region.heap.push(mapping, class as usize, block);
        }
        region.counters.aborted.fetch_add(1, Ordering::Relaxed);
        debug!("txn {:#x} aborted, {} entries undone", self.id, self.undo.len());
        self.release();
        Ok(())
    }

    fn drain_commit(&mut self) -> Result<()> {
        if self.region.failpoint.take(FailPoint::CommitDrainError) {
            self.log_barrier.discard();
            return Err(io::Error::other("injected failure draining the commit entry").into());
        }
        self.log_barrier.drain()
    }

    /// The commit entry at `at` may or may not be on media after a failed
    /// drain. Erase it durably so the transaction stays active and can still
    /// abort; if even that fails, recovery decides the outcome.
    fn take_back_commit(&mut self, at: u64, cause: &crate::error::Error) {
        let region = self.region;
        self.log_barrier.discard();
        match self.cursor.retract(&region.mapping, region.mode, at) {
            Ok(()) => {
                self.seq -= 1;
                warn!(
                    "txn {:#x}: commit entry not durable ({}), taken back",
                    self.id, cause
                );
            }
            Err(e) => {
                error!(
                    "txn {:#x}: cannot take back commit entry after {}: {}",
                    self.id, cause, e
                );
                region.mark_failed(&format!("outcome of txn {:#x} left to recovery", self.id));
                self.release();
            }
        }
    }

    fn crash(&mut self, point: FailPoint) -> crate::error::Error {
        self.region.mark_crashed(point);
        self.release();
        TransactionError::Interrupted(point).into()
    }

    fn release(&mut self) {
        if !self.claimed.is_empty() {
            self.region.claims.release(self.id, &self.claimed);
            self.claimed.clear();
        }
        if self.lane_held {
            self.lane_held = false;
            self.region.lanes.release(self.cursor.lane);
            self.region.leave();
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxnState::Active && self.lane_held && !self.region.is_crashed() {
            warn!(
                "txn {:#x} dropped while active, aborting {} entries",
                self.id,
                self.undo.len()
            );
            if let Err(e) = self.abort() {
                error!("txn {:#x}: abort on drop failed: {}", self.id, e);
            }
        }
        self.release();
    }
}
