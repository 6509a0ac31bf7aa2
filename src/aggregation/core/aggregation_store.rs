use async_trait::async_trait;

use crate::domain::document::{AggregatedDocument, Observation, StoreError, UpsertOutcome};

// ============================================================================
// Aggregation Store Trait
// ============================================================================
//
// Guarantees every backend must provide:
// 1. Per-key linearizability: concurrent upserts for one key behave as if
//    the merge policy had been applied to them one at a time
// 2. No ordering between different keys
// 3. `Changed` carries a document, `Unchanged` never does
// 4. Malformed observations are rejected, not dropped
//
// ============================================================================

/// Owner of per-key aggregate state.
#[async_trait]
pub trait AggregationStore: Send + Sync {
    /// Merge one observation into the aggregate for its key.
    async fn upsert(&self, obs: &Observation) -> Result<UpsertOutcome, StoreError>;

    /// Snapshot of the aggregate as of the last completed upsert for `key`.
    ///
    /// Returns `None` if the key has never been observed.
    async fn get_by_key(&self, key: &str) -> Result<Option<AggregatedDocument>, StoreError>;

    /// Short backend name used in logs and metric labels.
    fn backend_name(&self) -> &'static str;
}
