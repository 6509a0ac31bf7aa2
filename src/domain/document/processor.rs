use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::aggregation::AggregationStore;
use crate::metrics::{
    Metrics, OUTCOME_CHANGED, OUTCOME_FAILED, OUTCOME_REJECTED, OUTCOME_UNCHANGED,
};

use super::errors::StoreError;
use super::value_objects::{AggregatedDocument, Observation, UpsertOutcome};

// ============================================================================
// Document Processor
// ============================================================================
//
// Orchestrates: Observation → Aggregation Store → changed aggregate (or None)
//
// Downstream only ever sees documents whose extremes actually moved.
//
// ============================================================================

pub struct DocumentProcessor {
    store: Arc<dyn AggregationStore>,
    metrics: Arc<Metrics>,
    operation_timeout: Duration,
}

impl DocumentProcessor {
    pub fn new(
        store: Arc<dyn AggregationStore>,
        metrics: Arc<Metrics>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            operation_timeout,
        }
    }

    /// Merge `obs` and return the new aggregate if it changed.
    pub async fn process(&self, obs: &Observation) -> Result<Option<AggregatedDocument>, StoreError> {
        self.process_with_cancel(obs, &CancellationToken::new()).await
    }

    /// Like [`process`](Self::process), but gives up with
    /// `StoreError::Cancelled` as soon as `cancel` fires.
    pub async fn process_with_cancel(
        &self,
        obs: &Observation,
        cancel: &CancellationToken,
    ) -> Result<Option<AggregatedDocument>, StoreError> {
        let started = Instant::now();
        let result = self.bounded(cancel, self.store.upsert(obs)).await;

        let backend = self.store.backend_name();
        let outcome = match &result {
            Ok(UpsertOutcome::Changed(doc)) => {
                tracing::info!(
                    key = %doc.key,
                    first_fetch_time = doc.first_fetch_time,
                    fetch_time = doc.fetch_time,
                    "Aggregate changed"
                );
                OUTCOME_CHANGED
            }
            Ok(UpsertOutcome::Unchanged) => {
                tracing::debug!(key = %obs.key, fetch_time = obs.fetch_time, "Observation suppressed");
                OUTCOME_UNCHANGED
            }
            Err(StoreError::InvalidObservation(reason)) => {
                tracing::warn!(key = %obs.key, reason = %reason, "Observation rejected");
                OUTCOME_REJECTED
            }
            Err(error) => {
                tracing::error!(
                    key = %obs.key,
                    backend = backend,
                    error = %error,
                    "Failed to process observation"
                );
                OUTCOME_FAILED
            }
        };
        self.metrics
            .record_upsert(backend, outcome, started.elapsed().as_secs_f64());

        result.map(UpsertOutcome::into_document)
    }

    /// Current aggregate for `key`, if any.
    pub async fn get(&self, key: &str) -> Result<Option<AggregatedDocument>, StoreError> {
        self.get_with_cancel(key, &CancellationToken::new()).await
    }

    /// Like [`get`](Self::get), under the same deadline and cancellation
    /// rules as [`process_with_cancel`](Self::process_with_cancel).
    pub async fn get_with_cancel(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<AggregatedDocument>, StoreError> {
        let result = self.bounded(cancel, self.store.get_by_key(key)).await;
        if let Err(error) = &result {
            tracing::warn!(key = %key, error = %error, "Failed to read aggregate");
        }
        result
    }

    /// Race a store call against the operation deadline and `cancel`.
    async fn bounded<T>(
        &self,
        cancel: &CancellationToken,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StoreError::Cancelled),
            r = tokio::time::timeout(self.operation_timeout, call) => {
                r.unwrap_or(Err(StoreError::Timeout(self.operation_timeout)))
            }
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::MemoryStore;
    use async_trait::async_trait;

    struct SlowStore;

    #[async_trait]
    impl AggregationStore for SlowStore {
        async fn upsert(&self, _obs: &Observation) -> Result<UpsertOutcome, StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(UpsertOutcome::Unchanged)
        }

        async fn get_by_key(&self, _key: &str) -> Result<Option<AggregatedDocument>, StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }

        fn backend_name(&self) -> &'static str {
            "slow"
        }
    }

    struct UnavailableStore;

    #[async_trait]
    impl AggregationStore for UnavailableStore {
        async fn upsert(&self, _obs: &Observation) -> Result<UpsertOutcome, StoreError> {
            Err(StoreError::StorageUnavailable(sqlx::Error::PoolTimedOut))
        }

        async fn get_by_key(&self, _key: &str) -> Result<Option<AggregatedDocument>, StoreError> {
            Err(StoreError::StorageUnavailable(sqlx::Error::PoolTimedOut))
        }

        fn backend_name(&self) -> &'static str {
            "unavailable"
        }
    }

    fn processor(store: Arc<dyn AggregationStore>, timeout: Duration) -> DocumentProcessor {
        DocumentProcessor::new(store, Arc::new(Metrics::new().unwrap()), timeout)
    }

    fn memory_processor() -> DocumentProcessor {
        processor(Arc::new(MemoryStore::new()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_forwards_only_changed_documents() {
        let processor = memory_processor();
        let url = "https://example.com";

        let first = processor
            .process(&Observation::new(url, 100, 100, "T1"))
            .await
            .unwrap();
        assert_eq!(first.map(|d| d.content), Some("T1".to_string()));

        let newer = processor
            .process(&Observation::new(url, 200, 200, "T2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(newer.publish_date, 100);
        assert_eq!(newer.fetch_time, 200);

        let mid = processor
            .process(&Observation::new(url, 150, 150, "Mid"))
            .await
            .unwrap();
        assert!(mid.is_none());

        let dup = processor
            .process(&Observation::new(url, 200, 200, "Dup"))
            .await
            .unwrap();
        assert!(dup.is_none());

        let metrics = processor.metrics();
        assert_eq!(metrics.outcome_count("memory", OUTCOME_CHANGED), 2);
        assert_eq!(metrics.outcome_count("memory", OUTCOME_UNCHANGED), 2);

        let stored = processor.get(url).await.unwrap().unwrap();
        assert_eq!(stored, newer);
    }

    #[tokio::test]
    async fn test_invalid_observation_is_reported() {
        let processor = memory_processor();
        let result = processor.process(&Observation::new("", 1, 1, "x")).await;

        assert!(matches!(result, Err(StoreError::InvalidObservation(_))));
        assert_eq!(processor.metrics().outcome_count("memory", OUTCOME_REJECTED), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let processor = memory_processor();
        let token = CancellationToken::new();
        token.cancel();

        let result = processor
            .process_with_cancel(&Observation::new("https://example.com", 1, 1, "x"), &token)
            .await;

        assert!(matches!(result, Err(StoreError::Cancelled)));
        // nothing was merged
        assert!(processor.get("https://example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_in_flight() {
        let processor = processor(Arc::new(SlowStore), Duration::from_secs(60));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = processor
            .process_with_cancel(&Observation::new("https://example.com", 1, 1, "x"), &token)
            .await;

        assert!(matches!(result, Err(StoreError::Cancelled)));
        assert_eq!(processor.metrics().outcome_count("slow", OUTCOME_FAILED), 1);
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let timeout = Duration::from_millis(20);
        let processor = processor(Arc::new(SlowStore), timeout);

        let result = processor
            .process(&Observation::new("https://example.com", 1, 1, "x"))
            .await;

        match result {
            Err(StoreError::Timeout(elapsed)) => assert_eq!(elapsed, timeout),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_storage_failure_propagates() {
        let processor = processor(Arc::new(UnavailableStore), Duration::from_secs(1));

        let result = processor
            .process(&Observation::new("https://example.com", 1, 1, "x"))
            .await;
        assert!(matches!(result, Err(StoreError::StorageUnavailable(_))));
        assert_eq!(processor.metrics().outcome_count("unavailable", OUTCOME_FAILED), 1);

        assert!(processor.get("https://example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_get_deadline_exceeded() {
        let timeout = Duration::from_millis(20);
        let processor = processor(Arc::new(SlowStore), timeout);

        match processor.get("https://example.com").await {
            Err(StoreError::Timeout(elapsed)) => assert_eq!(elapsed, timeout),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_cancel_in_flight() {
        let processor = processor(Arc::new(SlowStore), Duration::from_secs(60));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = processor.get_with_cancel("https://example.com", &token).await;
        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[tokio::test]
    async fn test_get_cancelled_before_start() {
        let processor = memory_processor();
        processor
            .process(&Observation::new("https://example.com", 1, 1, "x"))
            .await
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let result = processor.get_with_cancel("https://example.com", &token).await;
        assert!(matches!(result, Err(StoreError::Cancelled)));

        assert!(processor.get("https://example.com").await.unwrap().is_some());
    }
}
