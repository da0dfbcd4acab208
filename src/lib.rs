//! Faultline - error tracking and performance monitoring backend
//!
//! This library provides the core ingestion, grouping, rollup and incident
//! detection pipeline: errors are fingerprinted into issues, performance
//! samples are rolled into percentile aggregates, and latency degradations
//! open and close incidents that route through a rate-limited dispatcher.

pub mod alert;
pub mod cli;
pub mod config;
pub mod counter;
pub mod fingerprint;
pub mod incident;
pub mod ingest;
pub mod nplusone;
pub mod rollup;
pub mod storage;

/// Re-export commonly used types
pub use alert::{AlertDispatcher, AlertType, LogTransport, NotificationTransport};
pub use config::CoreConfig;
pub use counter::{CounterStore, DbCounterStore, MemoryCounterStore};
pub use incident::IncidentEngine;
pub use ingest::IngestPipeline;
pub use rollup::RollupEngine;
pub use storage::Database;

/// Application-wide error type
pub use anyhow::Result;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = "faultline";
