use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tokio::sync::RwLock;

use crate::aggregation::core::AggregationStore;
use crate::domain::document::{
    AggregateState, AggregatedDocument, Observation, StoreError, UpsertOutcome,
};

// ============================================================================
// In-Memory Aggregation Store
// ============================================================================
//
// Key -> AggregateState, split across one or more shards. Each shard has its
// own RwLock and a key always hashes to the same shard, so all mutation of a
// given key is serialized by exactly one lock.
//
// With the default single shard the whole store sits behind one lock.
//
// ============================================================================

type Shard = RwLock<HashMap<String, AggregateState>>;

pub struct MemoryStore {
    shards: Box<[Shard]>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_shards(1)
    }

    /// Spread keys over `shard_count` independently locked maps.
    pub fn with_shards(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Number of distinct keys held.
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in self.shards.iter() {
            total += shard.read().await.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn shard_for(&self, key: &str) -> &Shard {
        if self.shards.len() == 1 {
            return &self.shards[0];
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AggregationStore for MemoryStore {
    #[tracing::instrument(skip(self, obs), fields(key = %obs.key, fetch_time = obs.fetch_time))]
    async fn upsert(&self, obs: &Observation) -> Result<UpsertOutcome, StoreError> {
        obs.validate()?;

        let mut shard = self.shard_for(&obs.key).write().await;

        if let Some(state) = shard.get_mut(&obs.key) {
            if !state.absorb(obs) {
                tracing::debug!("Observation did not move either extreme");
                return Ok(UpsertOutcome::Unchanged);
            }
            tracing::debug!(
                first_fetch_time = state.first_fetch_time,
                latest_fetch_time = state.latest_fetch_time,
                "Aggregate updated"
            );
            return Ok(UpsertOutcome::Changed(state.to_document(&obs.key)));
        }

        let state = AggregateState::bootstrap(obs);
        let doc = state.to_document(&obs.key);
        shard.insert(obs.key.clone(), state);

        tracing::debug!("Aggregate created");
        Ok(UpsertOutcome::Changed(doc))
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<AggregatedDocument>, StoreError> {
        let shard = self.shard_for(key).read().await;
        Ok(shard.get(key).map(|state| state.to_document(key)))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::Arc;

    const URL: &str = "https://example.com";

    fn doc(publish_date: u64, fetch_time: u64, content: &str, first_fetch_time: u64) -> AggregatedDocument {
        AggregatedDocument {
            key: URL.to_string(),
            publish_date,
            fetch_time,
            content: content.to_string(),
            first_fetch_time,
        }
    }

    #[tokio::test]
    async fn test_reference_scenario() {
        let store = MemoryStore::new();

        let steps = vec![
            (Observation::new(URL, 100, 100, "T1"), Some(doc(100, 100, "T1", 100))),
            (Observation::new(URL, 200, 200, "T2"), Some(doc(100, 200, "T2", 100))),
            (Observation::new(URL, 50, 50, "Old"), Some(doc(50, 200, "T2", 50))),
            (Observation::new(URL, 150, 150, "Mid"), None),
            (Observation::new(URL, 200, 200, "Dup"), None),
        ];

        for (input, expected) in steps {
            let outcome = store.upsert(&input).await.unwrap();
            assert_eq!(outcome.changed(), expected.is_some(), "input: {:?}", input);
            assert_eq!(outcome.into_document(), expected);
        }

        assert_eq!(
            store.get_by_key(URL).await.unwrap(),
            Some(doc(50, 200, "T2", 50))
        );
    }

    #[tokio::test]
    async fn test_first_observation_bootstraps() {
        let store = MemoryStore::new();
        let outcome = store
            .upsert(&Observation::new(URL, 7, 42, "body"))
            .await
            .unwrap();

        let doc = outcome.into_document().unwrap();
        assert_eq!(doc.first_fetch_time, 42);
        assert_eq!(doc.fetch_time, 42);
        assert_eq!(doc.publish_date, 7);
    }

    #[tokio::test]
    async fn test_duplicate_does_not_alter_state() {
        let store = MemoryStore::new();
        store.upsert(&Observation::new(URL, 1, 10, "a")).await.unwrap();
        store.upsert(&Observation::new(URL, 2, 20, "b")).await.unwrap();
        let before = store.get_by_key(URL).await.unwrap();

        for ft in [10, 20] {
            let outcome = store
                .upsert(&Observation::new(URL, 999, ft, "replayed"))
                .await
                .unwrap();
            assert_eq!(outcome, UpsertOutcome::Unchanged);
        }

        assert_eq!(store.get_by_key(URL).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_per_key_isolation() {
        let store = MemoryStore::new();
        store.upsert(&Observation::new("a", 1, 10, "a1")).await.unwrap();
        store.upsert(&Observation::new("b", 5, 50, "b1")).await.unwrap();
        let b_before = store.get_by_key("b").await.unwrap();

        store.upsert(&Observation::new("a", 0, 1, "a0")).await.unwrap();
        store.upsert(&Observation::new("a", 9, 99, "a9")).await.unwrap();

        assert_eq!(store.get_by_key("b").await.unwrap(), b_before);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_get_unknown_key() {
        let store = MemoryStore::new();
        assert!(store.get_by_key("missing").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_blank_key_rejected() {
        let store = MemoryStore::new();
        let result = store.upsert(&Observation::new("", 1, 1, "x")).await;

        assert!(matches!(result, Err(StoreError::InvalidObservation(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_nul_bytes_rejected() {
        let store = MemoryStore::new();
        let url = "https://example.com";

        let result = store.upsert(&Observation::new(url, 1, 1, "a\0b")).await;
        assert!(matches!(result, Err(StoreError::InvalidObservation(_))));
        assert!(store.is_empty().await);

        // an existing aggregate is left alone too
        store.upsert(&Observation::new(url, 1, 1, "T1")).await.unwrap();
        let result = store.upsert(&Observation::new(url, 2, 2, "T2\0")).await;
        assert!(matches!(result, Err(StoreError::InvalidObservation(_))));
        assert_eq!(store.get_by_key(url).await.unwrap().unwrap().content, "T1");
    }

    #[tokio::test]
    async fn test_zero_shards_means_one() {
        assert_eq!(MemoryStore::with_shards(0).shard_count(), 1);
        assert_eq!(MemoryStore::with_shards(8).shard_count(), 8);
    }

    #[tokio::test]
    async fn test_sharded_store_matches_single_lock_store() {
        let single = MemoryStore::new();
        let sharded = MemoryStore::with_shards(16);

        let keys = ["k1", "k2", "k3", "k4", "k5"];
        let fetch_times = [30u64, 10, 50, 20, 40, 10, 60];

        for key in keys {
            for (i, ft) in fetch_times.iter().enumerate() {
                let obs = Observation::new(key, i as u64, *ft, format!("{}-{}", key, ft));
                let a = single.upsert(&obs).await.unwrap();
                let b = sharded.upsert(&obs).await.unwrap();
                assert_eq!(a, b);
            }
        }

        for key in keys {
            assert_eq!(
                single.get_by_key(key).await.unwrap(),
                sharded.get_by_key(key).await.unwrap()
            );
        }
        assert_eq!(sharded.len().await, keys.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_same_key() {
        let store = Arc::new(MemoryStore::new());
        let fetch_times: Vec<u64> = (1..=200).map(|i| (i * 7919) % 1000 + 1).collect();
        let min = *fetch_times.iter().min().unwrap();
        let max = *fetch_times.iter().max().unwrap();

        let tasks = fetch_times.iter().map(|&ft| {
            let store = store.clone();
            tokio::spawn(async move {
                let obs = Observation::new(URL, ft + 1000, ft, format!("content-{}", ft));
                (ft, store.upsert(&obs).await.unwrap())
            })
        });

        let results: Vec<(u64, UpsertOutcome)> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        // whatever the interleaving, the extremes themselves always win
        for (ft, outcome) in &results {
            if *ft == min || *ft == max {
                assert!(outcome.changed(), "extreme {} reported unchanged", ft);
            }
        }

        let doc = store.get_by_key(URL).await.unwrap().unwrap();
        assert_eq!(doc.first_fetch_time, min);
        assert_eq!(doc.publish_date, min + 1000);
        assert_eq!(doc.fetch_time, max);
        assert_eq!(doc.content, format!("content-{}", max));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_many_keys_sharded() {
        let store = Arc::new(MemoryStore::with_shards(8));

        let tasks = (0..64u64).map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                let key = format!("https://example.com/{}", i % 8);
                store
                    .upsert(&Observation::new(key, i, i, format!("v{}", i)))
                    .await
                    .unwrap()
            })
        });
        for result in join_all(tasks).await {
            result.unwrap();
        }

        assert_eq!(store.len().await, 8);
        for k in 0..8u64 {
            let doc = store
                .get_by_key(&format!("https://example.com/{}", k))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(doc.first_fetch_time, k);
            assert_eq!(doc.fetch_time, 56 + k);
            assert_eq!(doc.content, format!("v{}", 56 + k));
        }
    }
}
