use super::value_objects::{AggregateState, Observation};

// ============================================================================
// Aggregate Merge Policy
// ============================================================================
//
// Ordering is decided only by the caller-supplied `fetch_time`:
// - a strictly earlier fetch replaces the first fetch time and publish date
// - a strictly later fetch replaces the latest fetch time and content
// - anything else (ties included) leaves the state untouched
//
// ============================================================================

/// Fold `obs` into `current`, returning the next state and whether any
/// extreme moved. `None` means the key has never been seen.
pub fn merge(current: Option<AggregateState>, obs: &Observation) -> (AggregateState, bool) {
    match current {
        None => (AggregateState::bootstrap(obs), true),
        Some(mut state) => {
            let changed = state.absorb(obs);
            (state, changed)
        }
    }
}

impl AggregateState {
    /// In-place form of [`merge`] for an existing key.
    pub fn absorb(&mut self, obs: &Observation) -> bool {
        let min_updated = obs.fetch_time < self.first_fetch_time;
        if min_updated {
            self.first_fetch_time = obs.fetch_time;
            self.publish_date_at_first = obs.publish_date;
        }

        let max_updated = obs.fetch_time > self.latest_fetch_time;
        if max_updated {
            self.latest_fetch_time = obs.fetch_time;
            self.latest_content = obs.content.clone();
        }

        min_updated || max_updated
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
