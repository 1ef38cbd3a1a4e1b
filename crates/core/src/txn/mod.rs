//! Log & Transaction Engine
//!
//! - `claims` - CAS word claims that order dependent commits
//! - `entry` - on-media format of log entries
//! - `lane` - per-transaction log lanes and lane scanning
//! - `transaction` - begin / write / commit / abort

pub mod claims;
pub mod entry;
pub mod lane;
pub mod transaction;

pub use entry::{EntryKind, LogEntry};
pub use transaction::{Transaction, TxnState};
