//! Recovery Engine - brings a region back to a consistent state after a crash
//!
//! After a crash, recovery:
//! 1. Scans every log lane and groups the surviving entries by transaction
//! 2. Classifies each transaction as committed, aborted or incomplete
//! 3. Undoes incomplete transactions, newest first
//! 4. Redoes committed transactions in commit order
//! 5. Truncates the log and rebuilds the allocator's free lists
//!
//! Every step compares before writing, so running recovery again after a
//! crash in the middle of it converges to the same state.

use super::barrier::PersistBarrier;
use super::failpoint::FailPoint;
use super::layout::{BlockState, CLEAN_OFFSET, ROOT_OFFSET};
use super::region::Region;
use crate::error::{RecoveryError, Result};
use crate::txn::entry::{ENTRY_HEADER_SIZE, EntryKind, LogEntry};
use crate::txn::lane::scan_lane;
use hashbrown::HashMap;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// What one recovery run found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub lanes_with_entries: u32,
    pub entries_scanned: usize,
    pub committed: usize,
    pub aborted: usize,
    pub incomplete: usize,
    pub redone: usize,
    pub undone: usize,
    pub skipped: usize,
    pub bytes_redone: u64,
    pub bytes_undone: u64,
    pub free_blocks: usize,
    pub allocated_blocks: usize,
}

impl RecoveryReport {
    pub fn summary(&self) -> String {
        format!(
            "Recovery: {} entries in {} lanes, {} committed, {} aborted, {} incomplete, \
             {} redone ({} bytes), {} undone ({} bytes), {} already applied",
            self.entries_scanned,
            self.lanes_with_entries,
            self.committed,
            self.aborted,
            self.incomplete,
            self.redone,
            self.bytes_redone,
            self.undone,
            self.bytes_undone,
            self.skipped,
        )
    }
}

/// Outcome of a logged transaction, decided by its last durable entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    /// Abort record durable: its rollback was drained before the record
    Aborted,
    /// Neither commit nor abort record: treated as aborted
    Incomplete,
}

#[derive(Debug)]
struct LoggedTransaction {
    id: u64,
    outcome: Outcome,
    commit_seq: u64,
    entries: Vec<LogEntry>,
}

impl LoggedTransaction {
    fn classify(entries: Vec<LogEntry>) -> Option<Self> {
        let first = entries.first()?;
        let id = first.txn_id;
        let last = entries.last()?;
        let (outcome, commit_seq) = match last.kind {
            EntryKind::Commit => (Outcome::Committed, last.target),
            EntryKind::Abort => (Outcome::Aborted, 0),
            _ => (Outcome::Incomplete, 0),
        };
        Some(Self {
            id,
            outcome,
            commit_seq,
            entries,
        })
    }
}

/// Run recovery over an opened, not yet published region
pub fn recover(region: &Region) -> Result<RecoveryReport> {
    let geometry = region.geometry();
    let mapping = &region.mapping;
    info!("Starting recovery of region {}", region.name());

    let log_end = geometry.lane_offset(geometry.lane_count);
    if (geometry.lane_size as usize) < ENTRY_HEADER_SIZE
        || log_end > geometry.heap_offset
        || geometry.heap_offset > geometry.size
    {
        return Err(RecoveryError::UnreadableLog(format!(
            "log area {:#x}..{:#x} does not fit before the heap at {:#x}",
            geometry.log_offset, log_end, geometry.heap_offset
        ))
        .into());
    }

    let mut report = RecoveryReport::default();
    let mut transactions: HashMap<u64, LoggedTransaction> = HashMap::new();
    for lane in 0..geometry.lane_count {
        let entries = scan_lane(mapping, &geometry, lane);
        if entries.is_empty() {
            continue;
        }
        report.lanes_with_entries += 1;
        report.entries_scanned += entries.len();
        for entry in &entries {
            validate_entry(region, entry)?;
        }
        if let Some(txn) = LoggedTransaction::classify(entries) {
            debug!(
                "lane {}: txn {:#x} {:?} with {} entries",
                lane,
                txn.id,
                txn.outcome,
                txn.entries.len()
            );
            if transactions.insert(txn.id, txn).is_some() {
                return Err(RecoveryError::IrrecoverableCorruption(format!(
                    "transaction in lane {} appears in two lanes",
                    lane
                ))
                .into());
            }
        }
    }

    let mut losers: Vec<&LoggedTransaction> = Vec::new();
    let mut winners: Vec<&LoggedTransaction> = Vec::new();
    for txn in transactions.values() {
        match txn.outcome {
            Outcome::Committed => {
                report.committed += 1;
                winners.push(txn);
            }
            Outcome::Aborted => report.aborted += 1,
            Outcome::Incomplete => {
                report.incomplete += 1;
                losers.push(txn);
            }
        }
    }
    losers.sort_by(|a, b| b.id.cmp(&a.id));
    winners.sort_by_key(|t| t.commit_seq);

    let mut barrier = PersistBarrier::new(mapping, region.flush_mode());
    for txn in losers {
        for entry in txn.entries.iter().rev() {
            undo_entry(region, &mut barrier, entry, &mut report);
        }
    }
    for txn in winners {
        for entry in &txn.entries {
            redo_entry(region, &mut barrier, entry, &mut report);
        }
    }
    barrier.drain()?;

    if region.failpoint.take(FailPoint::DuringRecovery) {
        warn!(
            "Region {}: simulated crash during recovery, log left in place",
            region.name()
        );
        return Err(RecoveryError::Interrupted(FailPoint::DuringRecovery).into());
    }

    for lane in 0..geometry.lane_count {
        let start = geometry.lane_offset(lane);
        mapping.zero(start, ENTRY_HEADER_SIZE);
        barrier.flush(start, ENTRY_HEADER_SIZE);
    }
    barrier.drain()?;

    let rebuilt = region.heap.rebuild(mapping)?;
    report.free_blocks = rebuilt.free_blocks;
    report.allocated_blocks = rebuilt.allocated_blocks;

    mapping.header().clean.store(1, Ordering::Release);
    barrier.flush(CLEAN_OFFSET, 8);
    barrier.drain()?;

    info!("{}", report.summary());
    Ok(report)
}

/// True if the log area holds at least one transaction
pub fn log_has_entries(region: &Region) -> bool {
    let geometry = region.geometry();
    (0..geometry.lane_count).any(|lane| !scan_lane(&region.mapping, &geometry, lane).is_empty())
}

fn validate_entry(region: &Region, entry: &LogEntry) -> Result<()> {
    let geometry = region.geometry();
    let len = (entry.payload.len() / 2) as u64;
    let valid = match entry.kind {
        EntryKind::Update => {
            geometry.in_heap(entry.target, len) || (entry.target == ROOT_OFFSET && len == 8)
        }
        EntryKind::Cas => entry.target % 8 == 0 && geometry.in_heap(entry.target, 8),
        EntryKind::Alloc | EntryKind::Free => region
            .heap
            .header_at(&region.mapping, entry.target)
            .is_some_and(|h| h.class == entry.flags),
        EntryKind::Begin | EntryKind::Commit | EntryKind::Abort => true,
    };
    if valid {
        Ok(())
    } else {
        Err(RecoveryError::IrrecoverableCorruption(format!(
            "{:?} entry of txn {:#x} targets {:#x}",
            entry.kind, entry.txn_id, entry.target
        ))
        .into())
    }
}

fn undo_entry(
    region: &Region,
    barrier: &mut PersistBarrier<'_>,
    entry: &LogEntry,
    report: &mut RecoveryReport,
) {
    let mapping = &region.mapping;
    match entry.kind {
        EntryKind::Update => {
            let before = entry.before();
            if mapping.read_vec(entry.target, before.len()) != before {
                mapping.write(entry.target, before);
                barrier.flush(entry.target, before.len());
                report.undone += 1;
                report.bytes_undone += before.len() as u64;
            } else {
                report.skipped += 1;
            }
        }
        EntryKind::Cas => {
            let (expected, new) = entry.cas_words();
            let word = mapping.atomic_u64(entry.target);
            if word.load(Ordering::Acquire) == new {
                word.store(expected, Ordering::Release);
                barrier.flush(entry.target, 8);
                report.undone += 1;
                report.bytes_undone += 8;
            } else {
                report.skipped += 1;
            }
        }
        EntryKind::Alloc => {
            ensure_state(region, barrier, entry, BlockState::Free);
        }
        EntryKind::Free | EntryKind::Begin | EntryKind::Commit | EntryKind::Abort => {}
    }
}

fn redo_entry(
    region: &Region,
    barrier: &mut PersistBarrier<'_>,
    entry: &LogEntry,
    report: &mut RecoveryReport,
) {
    let mapping = &region.mapping;
    match entry.kind {
        EntryKind::Update => {
            let (before, after) = (entry.before(), entry.after());
            if mapping.read_vec(entry.target, before.len()) == before && before != after {
                mapping.write(entry.target, after);
                barrier.flush(entry.target, after.len());
                report.redone += 1;
                report.bytes_redone += after.len() as u64;
            } else {
                report.skipped += 1;
            }
        }
        EntryKind::Cas => {
            let (expected, new) = entry.cas_words();
            let word = mapping.atomic_u64(entry.target);
            if word.load(Ordering::Acquire) == expected {
                word.store(new, Ordering::Release);
                barrier.flush(entry.target, 8);
                report.redone += 1;
                report.bytes_redone += 8;
            } else {
                report.skipped += 1;
            }
        }
        EntryKind::Free => {
            ensure_state(region, barrier, entry, BlockState::Free);
        }
        // the block header was durable before the commit record
        EntryKind::Alloc | EntryKind::Begin | EntryKind::Commit | EntryKind::Abort => {}
    }
}

fn ensure_state(
    region: &Region,
    barrier: &mut PersistBarrier<'_>,
    entry: &LogEntry,
    state: BlockState,
) {
    let header = region.heap.header_at(&region.mapping, entry.target);
    if header.is_some_and(|h| h.state != state) {
        region
            .heap
            .set_state(&region.mapping, entry.target, entry.flags, state);
        barrier.flush(entry.target, 8);
    }
}
