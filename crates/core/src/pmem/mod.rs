//! Persistent Memory (PMEM) Module
//!
//! This module provides persistent regions and everything beneath the log:
//!
//! - `layout` - on-media format of regions, allocator metadata and blocks
//! - `mapping` - memory-mapped region files and offset translation
//! - `barrier` - flush/drain persist barrier
//! - `failpoint` - crash injection at named protocol steps
//! - `allocator` - size-classed persistent heap
//! - `recovery` - log replay and free-list rebuild after a crash
//! - `region` - handle to an open region
//! - `table` - persisted name → region metadata
//! - `manager` - create/open/close/remove of named regions

pub mod allocator;
pub mod barrier;
pub mod failpoint;
pub mod layout;
pub mod manager;
pub mod mapping;
pub mod recovery;
pub mod region;
pub mod table;

pub use allocator::HeapAudit;
pub use barrier::FlushMode;
pub use failpoint::FailPoint;
pub use manager::{HeaderSummary, RegionInfo, RegionManager};
pub use recovery::RecoveryReport;
pub use region::{Region, RegionId, RegionStats};
