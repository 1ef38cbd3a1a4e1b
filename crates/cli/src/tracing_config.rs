//! Tracing setup for the ember tool
//!
//! This module provides:
//! - Operation context with correlation IDs
//! - Structured logging configuration

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Level, Span};
use uuid::Uuid;

/// Global operation counter for correlation ID generation
static OPERATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Context of one administrative operation, attached to its log lines
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Unique correlation ID, to find every line one invocation logged
    pub correlation_id: String,
    /// Subcommand being executed (if known)
    pub command: Option<String>,
    /// Region the operation works on (if any)
    pub region: Option<String>,
    pub seq: u64,
}

impl OperationContext {
    pub fn new() -> Self {
        let (correlation_id, seq) = generate_correlation_id();
        Self {
            correlation_id,
            command: None,
            region: None,
            seq,
        }
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.command = Some(command.to_lowercase());
        self
    }

    pub fn with_region(mut self, region: &str) -> Self {
        self.region = Some(region.to_string());
        self
    }

    /// Create a tracing span for this operation
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "operation",
            correlation_id = %self.correlation_id,
            command = self.command.as_deref().unwrap_or("unknown"),
            region = self.region.as_deref().unwrap_or("-"),
            seq = self.seq
        )
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a unique correlation ID and return it with the sequence number
///
/// First 8 chars of a UUID v7 (time-ordered) plus a monotonic counter.
fn generate_correlation_id() -> (String, u64) {
    let uuid = Uuid::now_v7();
    let counter = OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
    let correlation_id = format!("{}-{:06x}", &uuid.to_string()[..8], counter & 0xFFFFFF);
    (correlation_id, counter)
}

/// Tracing subscriber configuration
pub struct TracingConfig {
    /// Log level (default: INFO)
    pub level: Level,
    /// Enable JSON output format
    pub json_format: bool,
    /// Include file and line numbers in logs
    pub include_location: bool,
    /// Include thread IDs in logs
    pub include_thread_ids: bool,
    /// Include target module in logs
    pub include_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            include_location: false,
            include_thread_ids: false,
            include_target: true,
        }
    }
}

impl TracingConfig {
    /// Parse a level name; unknown names fall back to INFO
    pub fn parse_level(name: &str) -> Level {
        match name.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }

    /// Initialize the global tracing subscriber with this configuration.
    /// Logs go to stderr; stdout carries command output.
    pub fn init(self) {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::fmt;
        use tracing_subscriber::prelude::*;

        // Allow RUST_LOG to override the default level
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.to_string()));

        if self.json_format {
            let subscriber = tracing_subscriber::registry().with(filter).with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_file(self.include_location)
                    .with_line_number(self.include_location)
                    .with_thread_ids(self.include_thread_ids)
                    .with_target(self.include_target),
            );
            subscriber.init();
        } else {
            let subscriber = tracing_subscriber::registry().with(filter).with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_file(self.include_location)
                    .with_line_number(self.include_location)
                    .with_thread_ids(self.include_thread_ids)
                    .with_target(self.include_target),
            );
            subscriber.init();
        }
    }
}
