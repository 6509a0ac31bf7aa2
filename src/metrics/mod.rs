use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Tracks, per store backend:
// - observations processed, by outcome
// - upsert latency
//
// The registry is exposed for whichever process embeds the crate to scrape.
// ============================================================================

pub const OUTCOME_CHANGED: &str = "changed";
pub const OUTCOME_UNCHANGED: &str = "unchanged";
pub const OUTCOME_REJECTED: &str = "rejected";
pub const OUTCOME_FAILED: &str = "failed";

pub struct Metrics {
    registry: Registry,

    pub observations_total: IntCounterVec,
    pub upsert_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let observations_total = IntCounterVec::new(
            Opts::new(
                "document_observations_total",
                "Observations processed by the aggregation store",
            ),
            &["backend", "outcome"],
        )?;
        registry.register(Box::new(observations_total.clone()))?;

        let upsert_duration = HistogramVec::new(
            HistogramOpts::new(
                "document_upsert_duration_seconds",
                "Time spent merging one observation",
            )
            .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["backend"],
        )?;
        registry.register(Box::new(upsert_duration.clone()))?;

        Ok(Self {
            registry,
            observations_total,
            upsert_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Count one processed observation and its latency.
    pub fn record_upsert(&self, backend: &str, outcome: &str, duration_secs: f64) {
        self.observations_total
            .with_label_values(&[backend, outcome])
            .inc();
        self.upsert_duration
            .with_label_values(&[backend])
            .observe(duration_secs);
    }

    pub fn outcome_count(&self, backend: &str, outcome: &str) -> u64 {
        self.observations_total
            .with_label_values(&[backend, outcome])
            .get()
    }
}
