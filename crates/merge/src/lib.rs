//! Streaming merge engine.
//!
//! Folds throttled batches of stream events into per-topic canonical tables
//! under a last-write-wins policy on event timestamps, seeded from a
//! baseline fetch.

pub mod baseline;
pub mod engine;
pub mod error;
pub mod table;

pub use baseline::{BaselineEntry, BaselineSource, HttpBaselineSource};
pub use engine::{MergeConfig, MergeEngine, MergeStats, MergeUpdate, TopicStats};
pub use error::{MergeError, Result};
pub use table::{CanonicalRecord, RecordSource, TableSnapshot, Verdict};
