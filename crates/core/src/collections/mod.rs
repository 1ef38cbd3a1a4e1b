//! Persistent collections built on regions and transactions
//!
//! Both collections store `u64` values and are found again after a restart
//! through the offset of their root object, usually kept as the region root.

pub mod array_list;
pub mod queue;

pub use array_list::CowArrayList;
pub use queue::PersistentQueue;
