use serde::{Deserialize, Serialize};

use super::errors::StoreError;

// ============================================================================
// Document Value Objects
// ============================================================================

/// One fetch of a document, as delivered by the ingestion transport.
///
/// Observations for the same `key` are ordered by `fetch_time`. Two
/// observations with the same `(key, fetch_time)` are the same snapshot.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub key: String,
    pub publish_date: u64,
    pub fetch_time: u64,
    pub content: String,
}

impl Observation {
    pub fn new(
        key: impl Into<String>,
        publish_date: u64,
        fetch_time: u64,
        content: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            publish_date,
            fetch_time,
            content: content.into(),
        }
    }

    /// Reject observations that not every store can record.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.key.trim().is_empty() {
            return Err(StoreError::InvalidObservation(
                "observation key must not be empty".to_string(),
            ));
        }
        // text columns cannot hold NUL, so neither store accepts it
        if self.key.contains('\0') {
            return Err(StoreError::InvalidObservation(
                "observation key must not contain NUL bytes".to_string(),
            ));
        }
        if self.content.contains('\0') {
            return Err(StoreError::InvalidObservation(
                "observation content must not contain NUL bytes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-key merged state. Owned by a store, never handed out directly.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AggregateState {
    pub first_fetch_time: u64,
    pub publish_date_at_first: u64,
    pub latest_fetch_time: u64,
    pub latest_content: String,
}

impl AggregateState {
    /// State for a key seen exactly once.
    pub fn bootstrap(obs: &Observation) -> Self {
        Self {
            first_fetch_time: obs.fetch_time,
            publish_date_at_first: obs.publish_date,
            latest_fetch_time: obs.fetch_time,
            latest_content: obs.content.clone(),
        }
    }

    /// Project this state into the document view for `key`.
    pub fn to_document(&self, key: &str) -> AggregatedDocument {
        AggregatedDocument {
            key: key.to_string(),
            publish_date: self.publish_date_at_first,
            fetch_time: self.latest_fetch_time,
            content: self.latest_content.clone(),
            first_fetch_time: self.first_fetch_time,
        }
    }
}

/// Snapshot of a key's aggregate: publish date from the earliest fetch,
/// fetch time and content from the latest one.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AggregatedDocument {
    pub key: String,
    pub publish_date: u64,
    pub fetch_time: u64,
    pub content: String,
    pub first_fetch_time: u64,
}

/// Result of feeding one observation into a store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// An extreme moved (or the key is new); carries the new aggregate.
    Changed(AggregatedDocument),
    /// Duplicate or dominated observation. Nothing to propagate.
    Unchanged,
}

impl UpsertOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, UpsertOutcome::Changed(_))
    }

    pub fn document(&self) -> Option<&AggregatedDocument> {
        match self {
            UpsertOutcome::Changed(doc) => Some(doc),
            UpsertOutcome::Unchanged => None,
        }
    }

    pub fn into_document(self) -> Option<AggregatedDocument> {
        match self {
            UpsertOutcome::Changed(doc) => Some(doc),
            UpsertOutcome::Unchanged => None,
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
