//! Error Handling Module
//!
//! Every failure surfaced by the runtime is typed. Each subsystem owns a
//! category enum and the crate-level [`Error`] wraps them all, so callers can
//! either match a precise variant or just propagate with `?`.
//!
//! Contention (CAS retries) and benign replay during recovery are handled
//! locally and never show up here.

use crate::pmem::failpoint::FailPoint;
use std::io;
use thiserror::Error;

/// Failures of the region manager: create/open/close/remove and the table.
#[derive(Error, Debug)]
pub enum RegionError {
    #[error("region already exists: {0}")]
    AlreadyExists(String),

    #[error("region not found: {0}")]
    NotFound(String),

    #[error("corrupt region header in {name}: {reason}")]
    CorruptHeader { name: String, reason: String },

    #[error("invalid region size: {0} bytes")]
    InvalidSize(u64),

    #[error("region is already open: {0}")]
    AlreadyOpen(String),

    #[error("region {0} is not open")]
    NotOpen(u32),

    #[error("region {name} has {active} transaction(s) in flight")]
    Busy { name: String, active: usize },

    #[error("region handle was closed: {0}")]
    Closed(String),

    #[error("region table error: {0}")]
    Table(String),
}

/// Failures of the persistent allocator.
#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("out of space: cannot satisfy {0} bytes")]
    OutOfSpace(u64),

    #[error("invalid offset: {0:#x}")]
    InvalidOffset(u64),

    #[error("allocation too large: {0} bytes")]
    SizeTooLarge(u64),

    #[error("block at {0:#x} is already free")]
    DoubleFree(u64),
}

/// Failures of the log and transaction engine.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("no active transaction")]
    NoActiveTransaction,

    #[error("transaction {0:#x} already committed")]
    DoubleCommit(u64),

    #[error("log lane exhausted: entry of {needed} bytes, {remaining} bytes left")]
    LogSpaceExhausted { needed: usize, remaining: usize },

    #[error("offset {0:#x} was not allocated by this transaction")]
    NotAllocatedHere(u64),

    #[error("simulated crash at {0:?}")]
    Interrupted(FailPoint),

    #[error("txn {txn:#x} and txn {owner:#x} would wait for each other (word {offset:#x})")]
    Deadlock { txn: u64, owner: u64, offset: u64 },
}

/// Failures of the recovery engine. Both variants leave the region closed.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("log area unreadable: {0}")]
    UnreadableLog(String),

    #[error("irrecoverable corruption: {0}")]
    IrrecoverableCorruption(String),

    #[error("simulated crash during recovery at {0:?}")]
    Interrupted(FailPoint),
}

/// Failures while loading or validating [`crate::config::RuntimeConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("flush mode {0} is not available on this host")]
    UnsupportedFlushMode(String),

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Crate-level error type
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Region(#[from] RegionError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True if this error is a simulated crash from an armed failpoint
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            Error::Transaction(TransactionError::Interrupted(_))
                | Error::Recovery(RecoveryError::Interrupted(_))
        )
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
