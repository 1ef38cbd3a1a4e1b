//! Lock-free persistent FIFO queue of `u64`
//!
//! A Michael & Scott queue laid out in a region. The queue object is a
//! block `[head][tail]` of tagged node offsets; a node is
//! `[value][next][ready]`. `head` always points at a dummy node whose
//! successor holds the first value.
//!
//! Linking a node into `next` and moving `head` are logged CASes inside a
//! transaction. Moving `tail` is not logged; `tail` is a hint that may lag
//! and is repaired by [`PersistentQueue::attach`].
//!
//! `ready` is set once the transaction that linked a node has committed.
//! Nobody links behind or dequeues a node that is not ready. A dequeue that
//! finds `head` moved by a transaction still in flight waits for it in the
//! CAS on `head` (see [`crate::txn::claims`]). No committed change ever
//! depends on one that may still roll back.

use crate::error::{AllocationError, Result};
use crate::pmem::region::Region;
use crate::sync::Tagged;
use crate::txn::Transaction;
use crossbeam_utils::Backoff;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, trace};

const HEAD: u64 = 0;
const TAIL: u64 = 8;

const VALUE: u64 = 0;
const NEXT: u64 = 8;
const READY: u64 = 16;
const NODE_SIZE: u64 = 24;

pub struct PersistentQueue {
    region: Arc<Region>,
    root: u64,
}

impl PersistentQueue {
    /// Allocate an empty queue in `region`
    pub fn create(region: Arc<Region>) -> Result<Self> {
        let mut txn = region.begin()?;
        let root = txn.allocate(16)?;
        let dummy = txn.allocate(NODE_SIZE)?;
        let next = fresh_next(&txn, dummy)?;
        txn.write_fresh(dummy, &node_bytes(0, next, 1))?;
        let start = Tagged::new(dummy, 0).raw();
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&start.to_le_bytes());
        bytes.extend_from_slice(&start.to_le_bytes());
        txn.write_fresh(root, &bytes)?;
        txn.commit()?;
        drop(txn);
        Ok(Self { region, root })
    }

    /// Use the queue whose object lives at `offset`.
    ///
    /// Must run while no other handle uses the queue, typically right after
    /// the region was opened: it marks every linked node ready (their
    /// transactions committed, or recovery would have unlinked them) and
    /// moves `tail` to the last node.
    pub fn attach(region: Arc<Region>, offset: u64) -> Result<Self> {
        if region.usable_size(offset)? < 16 {
            return Err(AllocationError::InvalidOffset(offset).into());
        }
        let queue = Self {
            region,
            root: offset,
        };
        queue.repair()?;
        Ok(queue)
    }

    fn repair(&self) -> Result<()> {
        let region = &self.region;
        let head = self.load(HEAD)?;
        let mut last = head.offset();
        let mut marked = 0usize;
        // a chain longer than the heap can hold nodes is a cycle
        let limit = region.size() / 32;
        let mut steps = 0u64;
        loop {
            let ready = region.atomic(last + READY)?;
            if ready.load(Ordering::Acquire) == 0 {
                ready.store(1, Ordering::Release);
                region.persist(last + READY, 8)?;
                marked += 1;
            }
            let next = Tagged::from_raw(region.read_u64(last + NEXT)?);
            if next.is_null() {
                break;
            }
            steps += 1;
            if steps > limit {
                return Err(AllocationError::InvalidOffset(next.offset()).into());
            }
            last = next.offset();
        }

        let tail = self.load(TAIL)?;
        if tail.offset() != last {
            region
                .atomic(self.root + TAIL)?
                .store(tail.successor(last).raw(), Ordering::Release);
            region.persist(self.root + TAIL, 8)?;
        }
        if marked > 0 || tail.offset() != last {
            debug!(
                "queue {:#x}: marked {} nodes ready, tail {:#x} -> {:#x}",
                self.root,
                marked,
                tail.offset(),
                last
            );
        }
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        self.root
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    fn load(&self, field: u64) -> Result<Tagged> {
        Ok(Tagged::from_raw(self.region.read_u64(self.root + field)?))
    }

    fn is_ready(&self, node: u64) -> Result<bool> {
        Ok(self.region.read_u64(node + READY)? != 0)
    }

    fn next_of(&self, node: u64) -> Result<Tagged> {
        Ok(Tagged::from_raw(self.region.read_u64(node + NEXT)?))
    }

    /// Move `tail` from `tail` to `node` if nobody else did
    fn swing_tail(&self, tail: Tagged, node: u64) -> Result<()> {
        let word = self.region.atomic(self.root + TAIL)?;
        if word
            .compare_exchange(
                tail.raw(),
                tail.successor(node).raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.region.persist(self.root + TAIL, 8)?;
        }
        Ok(())
    }

    pub fn enqueue(&self, value: u64) -> Result<()> {
        let region = &self.region;
        let mut txn = region.begin()?;
        let node = txn.allocate(NODE_SIZE)?;
        let next = fresh_next(&txn, node)?;
        txn.write_fresh(node, &node_bytes(value, next, 0))?;

        let backoff = Backoff::new();
        loop {
            let tail = self.load(TAIL)?;
            let last = tail.offset();
            // `last` may have been dequeued and reused; re-check tail below
            let Ok(next) = self.next_of(last) else {
                backoff.snooze();
                continue;
            };
            if self.load(TAIL)? != tail {
                continue;
            }
            if !next.is_null() {
                if self.is_ready(next.offset()).unwrap_or(false) {
                    self.swing_tail(tail, next.offset())?;
                } else {
                    backoff.snooze();
                }
                continue;
            }
            if !self.is_ready(last).unwrap_or(false) {
                backoff.snooze();
                continue;
            }
            if txn.compare_and_swap(last + NEXT, next.raw(), next.successor(node).raw())? {
                break;
            }
            backoff.spin();
        }
        txn.commit()?;
        drop(txn);

        region.atomic(node + READY)?.store(1, Ordering::Release);
        region.persist(node + READY, 8)?;
        let tail = self.load(TAIL)?;
        if self.next_of(tail.offset())?.offset() == node {
            self.swing_tail(tail, node)?;
        }
        trace!("queue {:#x}: enqueued {} at {:#x}", self.root, value, node);
        Ok(())
    }

    /// Remove the oldest value, `None` if the queue is empty
    pub fn dequeue(&self) -> Result<Option<u64>> {
        let backoff = Backoff::new();
        loop {
            let head = self.load(HEAD)?;
            let tail = self.load(TAIL)?;
            let first = head.offset();
            let Ok(next) = self.next_of(first) else {
                backoff.snooze();
                continue;
            };
            if self.load(HEAD)? != head {
                continue;
            }
            if next.is_null() {
                // an uncommitted dequeue took the last value; it may come back
                if self.region.is_pending(self.root + HEAD, head.raw()) {
                    backoff.snooze();
                    continue;
                }
                return Ok(None);
            }
            // linked but not committed yet: not in the queue
            if !self.is_ready(next.offset()).unwrap_or(false) {
                return Ok(None);
            }
            if first == tail.offset() {
                self.swing_tail(tail, next.offset())?;
                continue;
            }
            let Ok(value) = self.region.read_u64(next.offset() + VALUE) else {
                backoff.snooze();
                continue;
            };

            let mut txn = self.region.begin()?;
            if txn.compare_and_swap(
                self.root + HEAD,
                head.raw(),
                head.successor(next.offset()).raw(),
            )? {
                txn.free(first)?;
                txn.commit()?;
                trace!("queue {:#x}: dequeued {}", self.root, value);
                return Ok(Some(value));
            }
            txn.abort()?;
            drop(txn);
            backoff.spin();
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        loop {
            let head = self.load(HEAD)?;
            let Ok(next) = self.next_of(head.offset()) else {
                continue;
            };
            if self.load(HEAD)? != head {
                continue;
            }
            return Ok(next.is_null() || !self.is_ready(next.offset()).unwrap_or(false));
        }
    }

    /// Number of committed values; exact only while the queue is quiescent
    pub fn len(&self) -> Result<usize> {
        'retry: loop {
            let head = self.load(HEAD)?;
            let mut node = head.offset();
            let mut count = 0;
            loop {
                let Ok(next) = self.next_of(node) else {
                    continue 'retry;
                };
                if next.is_null() || !self.is_ready(next.offset()).unwrap_or(false) {
                    break;
                }
                count += 1;
                node = next.offset();
                if self.load(HEAD)? != head {
                    continue 'retry;
                }
            }
            return Ok(count);
        }
    }
}

/// Null `next` for a node in a block that may have been a node before.
/// The tag moves past the block's old one, so a CAS by someone still
/// holding the old node's null `next` fails.
fn fresh_next(txn: &Transaction<'_>, node: u64) -> Result<Tagged> {
    let old = Tagged::from_raw(txn.read_u64(node + NEXT)?);
    Ok(Tagged::new(0, old.tag().wrapping_add(1)))
}

fn node_bytes(value: u64, next: Tagged, ready: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(NODE_SIZE as usize);
    bytes.extend_from_slice(&value.to_le_bytes());
    bytes.extend_from_slice(&next.raw().to_le_bytes());
    bytes.extend_from_slice(&ready.to_le_bytes());
    bytes
}

impl std::fmt::Debug for PersistentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentQueue")
            .field("region", &self.region.name())
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::pmem::manager::RegionManager;
    use std::thread;
    use tempfile::{TempDir, tempdir};

    fn setup() -> Result<(TempDir, RegionManager, Arc<Region>)> {
        let dir = tempdir()?;
        let manager = RegionManager::new(RuntimeConfig::with_dir(dir.path()))?;
        let region = manager.create_region("queue", 1 << 20)?;
        Ok((dir, manager, region))
    }

    #[test]
    fn test_fifo_order() -> Result<()> {
        let (_dir, _manager, region) = setup()?;
        let queue = PersistentQueue::create(region)?;
        assert!(queue.is_empty()?);
        assert_eq!(queue.dequeue()?, None);

        for v in 1..=5 {
            queue.enqueue(v)?;
        }
        assert_eq!(queue.len()?, 5);
        assert!(!queue.is_empty()?);
        for v in 1..=5 {
            assert_eq!(queue.dequeue()?, Some(v));
        }
        assert_eq!(queue.dequeue()?, None);
        assert!(queue.is_empty()?);
        Ok(())
    }

    #[test]
    fn test_dequeue_frees_old_dummy() -> Result<()> {
        let (_dir, _manager, region) = setup()?;
        let queue = PersistentQueue::create(region.clone())?;
        assert_eq!(region.audit()?.allocated_blocks, 2);
        for v in 0..10 {
            queue.enqueue(v)?;
            assert_eq!(queue.dequeue()?, Some(v));
        }
        let audit = region.audit()?;
        assert_eq!(audit.allocated_blocks, 2);
        assert!(audit.consistent);
        Ok(())
    }

    #[test]
    fn test_attach_after_reopen() -> Result<()> {
        let (_dir, manager, region) = setup()?;
        let queue = PersistentQueue::create(region.clone())?;
        let mut txn = region.begin()?;
        txn.set_root(queue.offset())?;
        txn.commit()?;
        drop(txn);
        queue.enqueue(11)?;
        queue.enqueue(12)?;
        queue.enqueue(13)?;
        assert_eq!(queue.dequeue()?, Some(11));
        let id = region.id();
        drop(queue);
        manager.close_region(id)?;
        drop(region);

        let region = manager.open_region("queue")?;
        let queue = PersistentQueue::attach(region.clone(), region.root())?;
        queue.enqueue(14)?;
        assert_eq!(queue.dequeue()?, Some(12));
        assert_eq!(queue.dequeue()?, Some(13));
        assert_eq!(queue.dequeue()?, Some(14));
        assert_eq!(queue.dequeue()?, None);
        Ok(())
    }

    #[test]
    fn test_attach_repairs_unready_nodes() -> Result<()> {
        let (_dir, _manager, region) = setup()?;
        let queue = PersistentQueue::create(region.clone())?;
        queue.enqueue(1)?;
        // as if the process died between commit and setting ready
        let head = Tagged::from_raw(region.read_u64(queue.offset() + HEAD)?);
        let node = Tagged::from_raw(region.read_u64(head.offset() + NEXT)?).offset();
        region.atomic(node + READY)?.store(0, Ordering::Release);
        assert!(queue.is_empty()?);

        let queue = PersistentQueue::attach(region, queue.offset())?;
        assert_eq!(queue.dequeue()?, Some(1));
        Ok(())
    }

    #[test]
    fn test_dequeue_waits_for_uncommitted_dequeue() -> Result<()> {
        let (_dir, _manager, region) = setup()?;
        let queue = PersistentQueue::create(region.clone())?;
        queue.enqueue(1)?;
        queue.enqueue(2)?;

        // a dequeue of 1 that moved head but has not committed
        let head = queue.load(HEAD)?;
        let first = queue.next_of(head.offset())?;
        let mut txn = region.begin()?;
        assert!(txn.compare_and_swap(
            queue.offset() + HEAD,
            head.raw(),
            head.successor(first.offset()).raw()
        )?);

        thread::scope(|s| -> Result<()> {
            let consumer = s.spawn(|| queue.dequeue());
            while region.stats().claim_waits == 0 {
                thread::yield_now();
            }
            assert!(!consumer.is_finished());
            txn.abort()?;
            assert_eq!(consumer.join().expect("consumer panicked")?, Some(1));
            Ok(())
        })?;
        drop(txn);

        assert_eq!(queue.dequeue()?, Some(2));
        assert_eq!(queue.dequeue()?, None);
        let audit = region.audit()?;
        assert!(audit.consistent);
        assert_eq!(audit.allocated_blocks, 2);
        Ok(())
    }

    #[test]
    fn test_dequeue_of_last_value_waits_for_uncommitted_dequeue() -> Result<()> {
        let (_dir, _manager, region) = setup()?;
        let queue = PersistentQueue::create(region.clone())?;
        queue.enqueue(1)?;

        let head = queue.load(HEAD)?;
        let first = queue.next_of(head.offset())?;
        let mut txn = region.begin()?;
        assert!(txn.compare_and_swap(
            queue.offset() + HEAD,
            head.raw(),
            head.successor(first.offset()).raw()
        )?);

        thread::scope(|s| -> Result<()> {
            let consumer = s.spawn(|| queue.dequeue());
            thread::sleep(std::time::Duration::from_millis(20));
            assert!(!consumer.is_finished());
            txn.abort()?;
            assert_eq!(consumer.join().expect("consumer panicked")?, Some(1));
            Ok(())
        })?;
        drop(txn);
        assert!(queue.is_empty()?);
        Ok(())
    }
}
