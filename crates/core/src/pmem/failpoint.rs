//! Failpoints - deterministic crash injection at protocol steps
//!
//! A failpoint is armed on one region and fires once. When a crash point
//! fires the operation stops as if power had been lost at that step: writes
//! that were not yet drained are rolled back to what the media would hold,
//! the region is marked crashed and the caller gets `Interrupted`.
//! `CommitDrainError` is not a crash: the drain of the commit entry reports
//! an I/O error and the process carries on.

use std::sync::atomic::{AtomicU8, Ordering};

/// Named steps of the commit and recovery protocols
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// Commit entry written but not drained; the transaction is not durable
    BeforeCommitDrain = 1,
    /// Commit entry durable, in-place data writes not yet drained
    AfterCommitDrain = 2,
    /// Transaction fully applied, log lane not yet truncated
    BeforeTruncate = 3,
    /// Recovery has replayed the log but not truncated it
    DuringRecovery = 4,
    /// Draining the commit entry fails with an I/O error
    CommitDrainError = 5,
}

impl FailPoint {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(FailPoint::BeforeCommitDrain),
            2 => Some(FailPoint::AfterCommitDrain),
            3 => Some(FailPoint::BeforeTruncate),
            4 => Some(FailPoint::DuringRecovery),
            5 => Some(FailPoint::CommitDrainError),
            _ => None,
        }
    }
}

/// One armed failpoint per region
#[derive(Debug, Default)]
pub struct FailPointSlot(AtomicU8);

impl FailPointSlot {
    pub fn arm(&self, point: FailPoint) {
        self.0.store(point as u8, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn armed(&self) -> Option<FailPoint> {
        FailPoint::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Fire `point` if it is the armed one; disarms on success
    pub fn take(&self, point: FailPoint) -> bool {
        self.0
            .compare_exchange(point as u8, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot() {
        let slot = FailPointSlot::default();
        assert_eq!(slot.armed(), None);
        slot.arm(FailPoint::BeforeTruncate);
        assert!(!slot.take(FailPoint::BeforeCommitDrain));
        assert!(slot.take(FailPoint::BeforeTruncate));
        assert!(!slot.take(FailPoint::BeforeTruncate));
    }

    #[test]
    fn test_disarm() {
        let slot = FailPointSlot::default();
        slot.arm(FailPoint::DuringRecovery);
        slot.disarm();
        assert!(!slot.take(FailPoint::DuringRecovery));
    }
}
