//! Property-based Tests for Ember
//!
//! Uses proptest to run random transaction scripts, crashes included, and
//! compare the region against a simple in-memory model.

use ember_core::{
    CowArrayList, FailPoint, PersistentQueue, Region, RegionManager, RuntimeConfig,
};
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::Arc;

const SLOTS: usize = 8;

/// One step inside a transaction
#[derive(Debug, Clone)]
enum TxnOp {
    Write(usize, u64),
    Cas { slot: usize, matches: bool, value: u64 },
    Alloc(u64),
    Free(usize),
}

/// How a transaction ends
#[derive(Debug, Clone, Copy)]
enum TxnEnd {
    Commit,
    Abort,
    Drop,
    Crash(FailPoint),
}

fn arb_op() -> impl Strategy<Value = TxnOp> {
    prop_oneof![
        4 => (0..SLOTS, any::<u64>()).prop_map(|(s, v)| TxnOp::Write(s, v)),
        2 => (0..SLOTS, any::<bool>(), any::<u64>())
            .prop_map(|(slot, matches, value)| TxnOp::Cas { slot, matches, value }),
        1 => (1..300u64).prop_map(TxnOp::Alloc),
        1 => any::<usize>().prop_map(TxnOp::Free),
    ]
}

fn arb_end() -> impl Strategy<Value = TxnEnd> {
    prop_oneof![
        4 => Just(TxnEnd::Commit),
        1 => Just(TxnEnd::Abort),
        1 => Just(TxnEnd::Drop),
        1 => Just(TxnEnd::Crash(FailPoint::BeforeCommitDrain)),
        1 => Just(TxnEnd::Crash(FailPoint::AfterCommitDrain)),
        1 => Just(TxnEnd::Crash(FailPoint::BeforeTruncate)),
    ]
}

fn arb_script() -> impl Strategy<Value = Vec<(Vec<TxnOp>, TxnEnd)>> {
    prop::collection::vec((prop::collection::vec(arb_op(), 0..12), arb_end()), 1..12)
}

fn read_slots(region: &Region, base: u64) -> Vec<u64> {
    (0..SLOTS)
        .map(|s| region.read_u64(base + s as u64 * 8).unwrap())
        .collect()
}

#[derive(Debug, Clone)]
enum ListCommand {
    Append(u64),
    Set(usize, u64),
    Insert(usize, u64),
    Remove(usize),
}

fn arb_list_command() -> impl Strategy<Value = ListCommand> {
    prop_oneof![
        3 => any::<u64>().prop_map(ListCommand::Append),
        1 => (0..16usize, any::<u64>()).prop_map(|(i, v)| ListCommand::Set(i, v)),
        1 => (0..16usize, any::<u64>()).prop_map(|(i, v)| ListCommand::Insert(i, v)),
        1 => (0..16usize).prop_map(ListCommand::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Committed transactions are visible, everything else is not, across
    /// aborts and crashes at every commit step
    #[test]
    fn prop_transactions_match_model(script in arb_script()) {
        let dir = tempfile::tempdir().unwrap();
        let manager = RegionManager::new(RuntimeConfig {
            log_lanes: 2,
            ..RuntimeConfig::with_dir(dir.path())
        })
        .unwrap();
        let mut region = manager.create_region("fuzz", 1 << 20).unwrap();
        let base = region.allocate_zeroed(SLOTS as u64 * 8).unwrap();

        let mut slots = vec![0u64; SLOTS];
        let mut live: Vec<u64> = Vec::new();

        for (ops, end) in script {
            let mut working = slots.clone();
            let mut working_live = live.clone();

            if let TxnEnd::Crash(point) = end {
                region.arm_failpoint(point);
            }
            let mut txn = region.begin().unwrap();
            for op in ops {
                match op {
                    TxnOp::Write(s, v) => {
                        txn.write_u64(base + s as u64 * 8, v).unwrap();
                        working[s] = v;
                    }
                    TxnOp::Cas { slot, matches, value } => {
                        let current = working[slot];
                        let expected = if matches { current } else { current ^ 1 };
                        let swapped = txn
                            .compare_and_swap(base + slot as u64 * 8, expected, value)
                            .unwrap();
                        prop_assert_eq!(swapped, matches);
                        if swapped {
                            working[slot] = value;
                        }
                    }
                    TxnOp::Alloc(size) => {
                        let offset = txn.allocate(size).unwrap();
                        txn.write_fresh(offset, &vec![0x5A; size as usize]).unwrap();
                        working_live.push(offset);
                    }
                    TxnOp::Free(pick) => {
                        if !working_live.is_empty() {
                            let offset = working_live.swap_remove(pick % working_live.len());
                            txn.free(offset).unwrap();
                        }
                    }
                }
            }

            match end {
                TxnEnd::Commit => {
                    txn.commit().unwrap();
                    slots = working;
                    live = working_live;
                }
                TxnEnd::Abort => txn.abort().unwrap(),
                TxnEnd::Drop => drop(txn),
                TxnEnd::Crash(point) => {
                    let err = txn.commit().unwrap_err();
                    prop_assert!(err.is_interrupted());
                    drop(txn);
                    if point != FailPoint::BeforeCommitDrain {
                        slots = working;
                        live = working_live;
                    }
                    drop(region);
                    region = manager.open_region("fuzz").unwrap();
                }
            }

            prop_assert_eq!(read_slots(&region, base), slots.clone());
            let audit = region.audit().unwrap();
            prop_assert!(audit.consistent);
            prop_assert_eq!(audit.allocated_blocks, live.len() + 1);
            for &offset in &live {
                prop_assert_eq!(region.read(offset, 1).unwrap(), vec![0x5A]);
            }
        }
    }

    /// The array list behaves like a `Vec`
    #[test]
    fn prop_array_list_matches_vec(
        commands in prop::collection::vec(arb_list_command(), 0..40)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let manager = RegionManager::new(RuntimeConfig::with_dir(dir.path())).unwrap();
        let region = manager.create_region("list", 1 << 20).unwrap();
        let list = CowArrayList::create(Arc::clone(&region)).unwrap();
        let mut model: Vec<u64> = Vec::new();

        for cmd in commands {
            match cmd {
                ListCommand::Append(v) => {
                    prop_assert_eq!(list.append(v).unwrap(), model.len());
                    model.push(v);
                }
                ListCommand::Set(i, v) => {
                    let expected = model.get_mut(i).map(|slot| std::mem::replace(slot, v));
                    prop_assert_eq!(list.set(i, v).unwrap(), expected);
                }
                ListCommand::Insert(i, v) => {
                    let fits = i <= model.len();
                    if fits {
                        model.insert(i, v);
                    }
                    prop_assert_eq!(list.insert(i, v).unwrap(), fits);
                }
                ListCommand::Remove(i) => {
                    let expected = (i < model.len()).then(|| model.remove(i));
                    prop_assert_eq!(list.remove(i).unwrap(), expected);
                }
            }
            prop_assert_eq!(list.len().unwrap(), model.len());
        }
        prop_assert_eq!(list.snapshot().unwrap(), model);
        prop_assert!(region.audit().unwrap().consistent);
    }

    /// The queue behaves like a `VecDeque`
    #[test]
    fn prop_queue_matches_vecdeque(ops in prop::collection::vec(any::<Option<u64>>(), 0..60)) {
        let dir = tempfile::tempdir().unwrap();
        let manager = RegionManager::new(RuntimeConfig::with_dir(dir.path())).unwrap();
        let region = manager.create_region("queue", 1 << 20).unwrap();
        let queue = PersistentQueue::create(Arc::clone(&region)).unwrap();
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                Some(v) => {
                    queue.enqueue(v).unwrap();
                    model.push_back(v);
                }
                None => prop_assert_eq!(queue.dequeue().unwrap(), model.pop_front()),
            }
        }
        prop_assert_eq!(queue.len().unwrap(), model.len());
        prop_assert_eq!(region.audit().unwrap().allocated_blocks, model.len() + 2);
    }
}
