//! Synchronization primitives for persistent data
//!
//! - `tagged` - offset + ABA tag packed into one CAS-able word

pub mod tagged;

pub use tagged::Tagged;
