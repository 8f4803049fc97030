//! Core pipeline logic.
//!
//! This module contains:
//! - Runner: the parallel batch pipeline over a library source
//! - Throttle: rate-limited summarization calls with retry and caching
//! - Checkpoint: resumable run state and the append-only done record
//! - Cache: fingerprint-keyed summary cache with a freshness window
//! - History: the append-only log of past runs

pub mod cache;
pub mod checkpoint;
pub mod history;
pub mod runner;
pub mod throttle;

// Re-export commonly used types
pub use cache::ResponseCache;
pub use checkpoint::{Checkpoint, DoneRecord};
pub use history::{append_history, read_history, HistoryEntry};
pub use runner::{BatchPipeline, StageConfig, StatePaths, StopSignal, CHECKPOINT_INTERVAL};
pub use throttle::{RateLimitedCaller, RetryPolicy};
