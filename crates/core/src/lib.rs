//! Ember - a runtime for programming against persistent memory
//!
//! Named regions are memory-mapped files whose contents survive crashes.
//! Inside a region, a size-classed allocator hands out blocks and an
//! undo/redo log makes groups of writes atomic with respect to crashes.
//! Every persistent reference is a region-relative offset.
//!
//! ```no_run
//! use ember_core::{RegionManager, RuntimeConfig};
//!
//! # fn main() -> ember_core::Result<()> {
//! let manager = RegionManager::new(RuntimeConfig::with_dir("/tmp/ember"))?;
//! let (region, _) = manager.find_or_create_region("notes", 1 << 20)?;
//!
//! let mut txn = region.begin()?;
//! let note = txn.allocate(64)?;
//! txn.write_fresh(note, b"hello")?;
//! txn.set_root(note)?;
//! txn.commit()?;
//!
//! manager.close_region(region.id())?;
//! # Ok(())
//! # }
//! ```

pub mod collections;
pub mod config;
pub mod error;
pub mod pmem;
pub mod sync;
pub mod txn;

pub use collections::{CowArrayList, PersistentQueue};
pub use config::RuntimeConfig;
pub use error::{
    AllocationError, ConfigError, Error, RecoveryError, RegionError, Result, TransactionError,
};
pub use pmem::{
    FailPoint, FlushMode, HeapAudit, RecoveryReport, Region, RegionId, RegionManager, RegionStats,
};
pub use txn::{Transaction, TxnState};
