//! Copy-on-write persistent array list of `u64`
//!
//! The list object is one word: a tagged offset `(generation, array)`.
//! An array block is `[len][prev][elements...]` and is never modified after
//! it is published, except for its `prev` field.
//!
//! A mutation builds a new array, points its `prev` at the current one and
//! swaps the root with a logged CAS that bumps the generation. The array two
//! generations back is freed in the same transaction, so readers of the
//! current or the previous generation always copy a live array. A reader
//! validates its copy by re-reading the root: at most one generation later
//! means nothing it read was freed.
//!
//! Until the swapping transaction commits, the new root is pending and
//! readers see the array its `prev` points at, the last committed one.
//! Writers through other handles wait in the CAS on the root.

use crate::error::{AllocationError, Result};
use crate::pmem::region::Region;
use crate::sync::Tagged;
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

const LEN: u64 = 0;
const PREV: u64 = 8;
const ELEMENTS: u64 = 16;

pub struct CowArrayList {
    region: Arc<Region>,
    root: u64,
    writer: Mutex<()>,
}

impl CowArrayList {
    /// Allocate an empty list in `region`
    pub fn create(region: Arc<Region>) -> Result<Self> {
        let mut txn = region.begin()?;
        let root = txn.allocate(8)?;
        txn.write_fresh(root, &Tagged::NULL.raw().to_le_bytes())?;
        txn.commit()?;
        drop(txn);
        Ok(Self::at(region, root))
    }

    /// Use the list whose root word lives at `offset`
    pub fn attach(region: Arc<Region>, offset: u64) -> Result<Self> {
        if region.usable_size(offset)? < 8 {
            return Err(AllocationError::InvalidOffset(offset).into());
        }
        Ok(Self::at(region, offset))
    }

    fn at(region: Arc<Region>, root: u64) -> Self {
        Self {
            region,
            root,
            writer: Mutex::new(()),
        }
    }

    /// Offset of the root word; store it to find the list again
    pub fn offset(&self) -> u64 {
        self.root
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    fn load_root(&self) -> Result<Tagged> {
        Ok(Tagged::from_raw(self.region.read_u64(self.root)?))
    }

    /// Copy the array a root points to; `None` if what was read cannot be
    /// an array (it was freed and reused under us)
    fn read_array(&self, root: Tagged) -> Option<Vec<u64>> {
        if root.is_null() {
            return Some(Vec::new());
        }
        let array = root.offset();
        let len = self.region.read_u64(array + LEN).ok()?;
        let max = self.region.size().saturating_sub(array + ELEMENTS) / 8;
        if len > max {
            return None;
        }
        let bytes = self.region.read(array + ELEMENTS, len as usize * 8).ok()?;
        Some(
            bytes
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        )
    }

    /// The last committed generation as of `root`. A root installed by a
    /// transaction still in flight stands for its predecessor.
    fn committed(&self, root: Tagged) -> Result<(Tagged, bool)> {
        if root.is_null() || !self.region.is_pending(self.root, root.raw()) {
            return Ok((root, false));
        }
        let prev = self.region.read_u64(root.offset() + PREV)?;
        Ok((Tagged::new(prev, root.tag().wrapping_sub(1)), true))
    }

    /// True if nothing read through `before` can have been freed by the
    /// time the root reads `after`
    fn still_valid(before: Tagged, after: Tagged, pending: bool) -> bool {
        if pending {
            after == before
        } else {
            after.tag().wrapping_sub(before.tag()) <= 1
        }
    }

    /// A fully consistent copy of the list as last committed
    pub fn snapshot(&self) -> Result<Vec<u64>> {
        let backoff = Backoff::new();
        loop {
            let before = self.load_root()?;
            let (view, pending) = self.committed(before)?;
            let copy = self.read_array(view);
            let after = self.load_root()?;
            if let Some(values) = copy {
                if Self::still_valid(before, after, pending) {
                    return Ok(values);
                }
            }
            backoff.snooze();
        }
    }

    pub fn iter(&self) -> Result<std::vec::IntoIter<u64>> {
        Ok(self.snapshot()?.into_iter())
    }

    pub fn len(&self) -> Result<usize> {
        let backoff = Backoff::new();
        loop {
            let before = self.load_root()?;
            let (view, pending) = self.committed(before)?;
            if view.is_null() {
                return Ok(0);
            }
            let len = self.region.read_u64(view.offset() + LEN)?;
            if Self::still_valid(before, self.load_root()?, pending) {
                return Ok(len as usize);
            }
            backoff.snooze();
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, index: usize) -> Result<Option<u64>> {
        Ok(self.snapshot()?.get(index).copied())
    }

    pub fn contains(&self, value: u64) -> Result<bool> {
        Ok(self.snapshot()?.contains(&value))
    }

    /// Append `value`; returns its index
    pub fn append(&self, value: u64) -> Result<usize> {
        self.mutate(|values| {
            values.push(value);
            Some(values.len() - 1)
        })
        .map(|index| index.unwrap_or_default())
    }

    /// Replace the value at `index`; returns the old value, `None` if out of
    /// range
    pub fn set(&self, index: usize, value: u64) -> Result<Option<u64>> {
        self.mutate(|values| {
            let slot = values.get_mut(index)?;
            Some(std::mem::replace(slot, value))
        })
    }

    /// Insert at `index`, shifting later values; false if `index > len`
    pub fn insert(&self, index: usize, value: u64) -> Result<bool> {
        self.mutate(|values| {
            if index > values.len() {
                return None;
            }
            values.insert(index, value);
            Some(())
        })
        .map(|done| done.is_some())
    }

    /// Remove and return the value at `index`
    pub fn remove(&self, index: usize) -> Result<Option<u64>> {
        self.mutate(|values| (index < values.len()).then(|| values.remove(index)))
    }

    /// Run `change` on a copy of the current array and publish the result.
    /// `change` returning `None` means no change; nothing is written.
    ///
    /// The copy may come from a root another handle installed without
    /// committing yet. The CAS then waits for that transaction and fails if
    /// it aborted, so the change is redone on what was committed.
    fn mutate<T>(&self, change: impl Fn(&mut Vec<u64>) -> Option<T>) -> Result<Option<T>> {
        let _writer = self.writer.lock();
        let backoff = Backoff::new();
        loop {
            let current = self.load_root()?;
            let Some(mut values) = self.read_array(current) else {
                backoff.snooze();
                continue;
            };
            let Some(result) = change(&mut values) else {
                return Ok(None);
            };

            let mut txn = self.region.begin()?;
            let array = txn.allocate(ELEMENTS + values.len() as u64 * 8)?;
            let mut bytes = Vec::with_capacity(ELEMENTS as usize + values.len() * 8);
            bytes.extend_from_slice(&(values.len() as u64).to_le_bytes());
            bytes.extend_from_slice(&current.offset().to_le_bytes());
            for v in &values {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            txn.write_fresh(array, &bytes)?;

            let next = current.successor(array);
            if !txn.compare_and_swap(self.root, current.raw(), next.raw())? {
                txn.abort()?;
                backoff.snooze();
                continue;
            }

            if !current.is_null() {
                let retired = self.region.read_u64(current.offset() + PREV)?;
                if retired != 0 {
                    txn.write_u64(current.offset() + PREV, 0)?;
                    txn.free(retired)?;
                }
            }
            txn.commit()?;
            trace!(
                "list {:#x}: generation {} -> array {:#x} ({} values)",
                self.root,
                next.tag(),
                array,
                values.len()
            );
            return Ok(Some(result));
        }
    }
}

impl std::fmt::Debug for CowArrayList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CowArrayList")
            .field("region", &self.region.name())
            .field("root", &self.root)
            .field(
                "generation",
                &self
                    .region
                    .read_u64(self.root)
                    .map(|w| Tagged::from_raw(w).tag())
                    .ok(),
            )
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
        let region = manager.create_region("list", 1 << 20)?;
        Ok((dir, manager, region))
    }

    #[test]
    fn test_append_get_set() -> Result<()> {
        let (_dir, _manager, region) = setup()?;
        let list = CowArrayList::create(region)?;
        assert!(list.is_empty()?);

        assert_eq!(list.append(10)?, 0);
        assert_eq!(list.append(20)?, 1);
        assert_eq!(list.append(30)?, 2);
        assert_eq!(list.len()?, 3);
        assert_eq!(list.get(1)?, Some(20));
        assert_eq!(list.get(3)?, None);

        assert_eq!(list.set(1, 21)?, Some(20));
        assert_eq!(list.set(9, 0)?, None);
        assert_eq!(list.snapshot()?, vec![10, 21, 30]);
        Ok(())
    }

    #[test]
    fn test_insert_remove_contains() -> Result<()> {
        let (_dir, _manager, region) = setup()?;
        let list = CowArrayList::create(region)?;
        list.append(1)?;
        list.append(3)?;
        assert!(list.insert(1, 2)?);
        assert!(!list.insert(9, 9)?);
        assert_eq!(list.iter()?.collect::<Vec<_>>(), vec![1, 2, 3]);

        assert_eq!(list.remove(0)?, Some(1));
        assert_eq!(list.remove(5)?, None);
        assert!(list.contains(3)?);
        assert!(!list.contains(1)?);
        Ok(())
    }

    #[test]
    fn test_retains_at_most_one_old_generation() -> Result<()> {
        let (_dir, _manager, region) = setup()?;
        let list = CowArrayList::create(region.clone())?;
        for i in 0..20 {
            list.append(i)?;
        }
        // root word, current array and the one retained predecessor
        let audit = region.audit()?;
        assert_eq!(audit.allocated_blocks, 3);
        assert!(audit.consistent);
        Ok(())
    }

    #[test]
    fn test_attach_after_reopen() -> Result<()> {
        let (_dir, manager, region) = setup()?;
        let list = CowArrayList::create(region.clone())?;
        let mut txn = region.begin()?;
        txn.set_root(list.offset())?;
        txn.commit()?;
        drop(txn);
        list.append(7)?;
        list.append(8)?;
        let id = region.id();
        drop(list);
        manager.close_region(id)?;
        drop(region);

        let region = manager.open_region("list")?;
        let list = CowArrayList::attach(region.clone(), region.root())?;
        assert_eq!(list.snapshot()?, vec![7, 8]);
        assert!(CowArrayList::attach(region, 12).is_err());
        Ok(())
    }

    /// Swap in a two-value array after `[10]` without committing
    fn pending_append<'r>(
        region: &'r Region,
        list: &CowArrayList,
    ) -> Result<crate::txn::Transaction<'r>> {
        let current = list.load_root()?;
        let mut txn = region.begin()?;
        let array = txn.allocate(ELEMENTS + 16)?;
        let mut bytes = Vec::new();
        for word in [2, current.offset(), 10, 99] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        txn.write_fresh(array, &bytes)?;
        assert!(txn.compare_and_swap(
            list.offset(),
            current.raw(),
            current.successor(array).raw()
        )?);
        Ok(txn)
    }

    #[test]
    fn test_readers_see_committed_generation() -> Result<()> {
        let (_dir, _manager, region) = setup()?;
        let list = CowArrayList::create(region.clone())?;
        list.append(10)?;

        let mut txn = pending_append(&region, &list)?;
        assert_eq!(list.snapshot()?, vec![10]);
        assert_eq!(list.len()?, 1);
        txn.commit()?;
        drop(txn);
        assert_eq!(list.snapshot()?, vec![10, 99]);
        assert_eq!(list.len()?, 2);
        Ok(())
    }

    #[test]
    fn test_writer_does_not_build_on_aborted_generation() -> Result<()> {
        let (_dir, _manager, region) = setup()?;
        let list = CowArrayList::create(region.clone())?;
        list.append(10)?;
        let other = CowArrayList::attach(region.clone(), list.offset())?;

        let mut txn = pending_append(&region, &list)?;
        thread::scope(|s| -> Result<()> {
            let writer = s.spawn(|| other.append(7));
            while region.stats().claim_waits == 0 {
                thread::yield_now();
            }
            assert!(!writer.is_finished());
            txn.abort()?;
            assert_eq!(writer.join().expect("writer panicked")?, 1);
            Ok(())
        })?;
        drop(txn);

        assert_eq!(list.snapshot()?, vec![10, 7]);
        // root word, current array and the one retained predecessor
        let audit = region.audit()?;
        assert!(audit.consistent);
        assert_eq!(audit.allocated_blocks, 3);
        Ok(())
    }
}
