//! Word claims - commit ordering between transactions that CAS one word
//!
//! A successful logged CAS claims its word for the transaction until the
//! transaction commits or aborts. A CAS by another transaction on a claimed
//! word waits for the claim to go away and only then compares, against
//! whatever the word holds by then. A committed CAS therefore never builds
//! on a value that may still be rolled back, and commits that share a word
//! are ordered the way their CASes were.
//!
//! Waiters are kept in a wait-for map; a wait that would close a cycle fails
//! with `Deadlock` instead of blocking.

use crate::error::{Result, TransactionError};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

#[derive(Debug)]
struct Claim {
    owner: u64,
    /// Values the owner installed in the word, oldest first
    installed: Vec<u64>,
}

#[derive(Debug, Default)]
struct ClaimState {
    claims: HashMap<u64, Claim>,
    /// waiting transaction -> transaction it waits for
    waits_for: HashMap<u64, u64>,
}

impl ClaimState {
    fn closes_cycle(&self, waiter: u64, owner: u64) -> bool {
        let mut current = owner;
        loop {
            if current == waiter {
                return true;
            }
            match self.waits_for.get(&current) {
                Some(&next) => current = next,
                None => return false,
            }
        }
    }
}

/// Volatile claim table of one open region
#[derive(Debug, Default)]
pub struct WordClaims {
    state: Mutex<ClaimState>,
    released: Condvar,
    waits: AtomicU64,
}

impl WordClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `offset` for `txn`, about to install `value` there. Waits while
    /// another transaction holds the word.
    ///
    /// Returns true if the claim is new, false if `txn` already held it.
    pub fn acquire(&self, txn: u64, offset: u64, value: u64) -> Result<bool> {
        let mut state = self.state.lock();
        loop {
            let owner = match state.claims.get_mut(&offset) {
                None => break,
                Some(claim) if claim.owner == txn => {
                    claim.installed.push(value);
                    return Ok(false);
                }
                Some(claim) => claim.owner,
            };
            if state.closes_cycle(txn, owner) {
                warn!(
                    "txn {:#x} would wait for txn {:#x} on {:#x}, which waits for it",
                    txn, owner, offset
                );
                return Err(TransactionError::Deadlock { txn, owner, offset }.into());
            }
            self.waits.fetch_add(1, Ordering::Relaxed);
            debug!("txn {:#x} waits for txn {:#x} on {:#x}", txn, owner, offset);
            state.waits_for.insert(txn, owner);
            self.released.wait(&mut state);
            state.waits_for.remove(&txn);
        }
        state.claims.insert(
            offset,
            Claim {
                owner: txn,
                installed: vec![value],
            },
        );
        Ok(true)
    }

    /// Take back an `acquire` whose CAS did not happen
    pub fn undo_acquire(&self, txn: u64, offset: u64, value: u64, was_new: bool) {
        let mut state = self.state.lock();
        let Some(claim) = state.claims.get_mut(&offset) else {
            return;
        };
        if claim.owner != txn {
            return;
        }
        if was_new {
            state.claims.remove(&offset);
            drop(state);
            self.released.notify_all();
        } else if let Some(pos) = claim.installed.iter().rposition(|&v| v == value) {
            claim.installed.remove(pos);
        }
    }

    /// Drop the claims `txn` holds on `offsets` and wake every waiter
    pub fn release(&self, txn: u64, offsets: &[u64]) {
        if offsets.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for offset in offsets {
            if state.claims.get(offset).is_some_and(|c| c.owner == txn) {
                state.claims.remove(offset);
            }
        }
        drop(state);
        self.released.notify_all();
    }

    /// True if `value` sits in `offset` because of a transaction that has
    /// not finished yet
    pub fn is_pending(&self, offset: u64, value: u64) -> bool {
        self.state
            .lock()
            .claims
            .get(&offset)
            .is_some_and(|c| c.installed.contains(&value))
    }

    /// Owner of the claim on `offset`, if any
    pub fn owner(&self, offset: u64) -> Option<u64> {
        self.state.lock().claims.get(&offset).map(|c| c.owner)
    }

    /// How many times a transaction had to wait for another
    pub fn waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }
}
