//! Aggregates repeated, out-of-order fetches of the same document into one
//! record per URL: publish date and fetch time of the earliest fetch, content
//! and fetch time of the latest one.

pub mod aggregation;
pub mod config;
pub mod domain;
pub mod metrics;
pub mod utils;

pub use aggregation::{AggregationStore, MemoryStore, PostgresStore};
pub use crate::config::AppConfig;
pub use domain::document::{
    merge, AggregateState, AggregatedDocument, DocumentProcessor, Observation, StoreError,
    UpsertOutcome,
};
