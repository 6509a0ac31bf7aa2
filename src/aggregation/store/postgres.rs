use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};

use crate::aggregation::core::AggregationStore;
use crate::config::DatabaseConfig;
use crate::domain::document::{
    AggregateState, AggregatedDocument, Observation, StoreError, UpsertOutcome,
};
use crate::utils::{retry_on_transient, RetryConfig};

// ============================================================================
// PostgreSQL Aggregation Store
// ============================================================================
//
// Every observation is appended to `documents`, unique on (url, fetch_time)
// through an md5 digest of the url so arbitrarily long urls index.
// The aggregate is never stored; it is re-derived from the min and max rows.
//
// One upsert = one transaction:
// 1. Per-key advisory lock, so writers for the same url serialize
// 2. INSERT ... ON CONFLICT DO NOTHING (0 rows affected = duplicate)
// 3. Read both extremes in a single statement
// 4. Report a change only if the new row became an extreme
//
// A retried attempt that hits an existing row checks whether that row is its
// own earlier write, committed before the acknowledgement was lost.
//
// Dropping the future mid-flight drops the transaction, which rolls back.
//
// ============================================================================

const LOCK_KEY: &str = "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))";

const INSERT_OBSERVATION: &str = r#"
    INSERT INTO documents (url, pub_date, fetch_time, content)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (url_hash, fetch_time) DO NOTHING
"#;

const SELECT_OBSERVATION: &str = r#"
    SELECT pub_date, content FROM documents
    WHERE url_hash = decode(md5($1), 'hex') AND url = $1 AND fetch_time = $2
"#;

const SELECT_EXTREMES: &str = r#"
    SELECT lo.pub_date   AS first_pub_date,
           lo.fetch_time AS first_fetch_time,
           hi.fetch_time AS latest_fetch_time,
           hi.content    AS latest_content
    FROM (
        SELECT pub_date, fetch_time FROM documents
        WHERE url_hash = decode(md5($1), 'hex') AND url = $1
        ORDER BY fetch_time ASC LIMIT 1
    ) AS lo
    CROSS JOIN (
        SELECT fetch_time, content FROM documents
        WHERE url_hash = decode(md5($1), 'hex') AND url = $1
        ORDER BY fetch_time DESC LIMIT 1
    ) AS hi
"#;

const COUNT_OBSERVATIONS: &str =
    "SELECT COUNT(*) FROM documents WHERE url_hash = decode(md5($1), 'hex') AND url = $1";

#[derive(Debug, sqlx::FromRow)]
struct ExtremesRow {
    first_pub_date: i64,
    first_fetch_time: i64,
    latest_fetch_time: i64,
    latest_content: String,
}

impl ExtremesRow {
    fn into_state(self) -> Result<AggregateState, StoreError> {
        Ok(AggregateState {
            first_fetch_time: from_bigint("fetch_time", self.first_fetch_time)?,
            publish_date_at_first: from_bigint("pub_date", self.first_pub_date)?,
            latest_fetch_time: from_bigint("fetch_time", self.latest_fetch_time)?,
            latest_content: self.latest_content,
        })
    }
}

/// The row already stored at (url, fetch_time).
#[derive(Debug, sqlx::FromRow)]
struct StoredObservation {
    pub_date: i64,
    content: String,
}

fn to_bigint(field: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| {
        StoreError::InvalidObservation(format!(
            "{} {} exceeds the storable range (max {})",
            field,
            value,
            i64::MAX
        ))
    })
}

fn from_bigint(column: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::CorruptRow(format!("negative {}: {}", column, value)))
}

/// Whether a conflicting row can be this call's own write from an earlier
/// attempt. The first attempt never has one.
fn is_own_earlier_write(
    attempt: u32,
    obs: &Observation,
    pub_date: i64,
    stored: &StoredObservation,
) -> bool {
    attempt > 1 && stored.pub_date == pub_date && stored.content == obs.content
}

/// Changed iff the row written for `obs` is one of the extremes.
fn outcome_for_write(obs: &Observation, state: AggregateState) -> UpsertOutcome {
    // fetch_time is unique per url, so equality means this row is the extreme
    if state.first_fetch_time != obs.fetch_time && state.latest_fetch_time != obs.fetch_time {
        tracing::debug!("Fetch recorded between existing extremes");
        return UpsertOutcome::Unchanged;
    }

    tracing::debug!(
        first_fetch_time = state.first_fetch_time,
        latest_fetch_time = state.latest_fetch_time,
        "Aggregate updated"
    );
    UpsertOutcome::Changed(state.to_document(&obs.key))
}

async fn fetch_extremes(
    conn: &mut PgConnection,
    key: &str,
) -> Result<Option<AggregateState>, StoreError> {
    sqlx::query_as::<_, ExtremesRow>(SELECT_EXTREMES)
        .bind(key)
        .fetch_optional(conn)
        .await?
        .map(ExtremesRow::into_state)
        .transpose()
}

pub struct PostgresStore {
    pool: PgPool,
    retry: RetryConfig,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Build a connection pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let url = config
            .url
            .as_deref()
            .context("database.url is not configured")?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(url)
            .await
            .context("failed to connect to PostgreSQL")?;

        tracing::info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );

        Ok(Self::new(pool))
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    /// Number of distinct fetches recorded for `key`, extremes or not.
    pub async fn observation_count(&self, key: &str) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(COUNT_OBSERVATIONS)
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        from_bigint("count", count)
    }

    async fn upsert_once(
        &self,
        obs: &Observation,
        pub_date: i64,
        fetch_time: i64,
        attempt: u32,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(LOCK_KEY)
            .bind(&obs.key)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(INSERT_OBSERVATION)
            .bind(&obs.key)
            .bind(pub_date)
            .bind(fetch_time)
            .bind(&obs.content)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;

        if !inserted {
            if attempt > 1 {
                let stored = sqlx::query_as::<_, StoredObservation>(SELECT_OBSERVATION)
                    .bind(&obs.key)
                    .bind(fetch_time)
                    .fetch_optional(&mut *tx)
                    .await?;

                if let Some(stored) = stored {
                    if is_own_earlier_write(attempt, obs, pub_date, &stored) {
                        let state = fetch_extremes(&mut *tx, &obs.key).await?;
                        tx.commit().await?;
                        tracing::debug!(attempt, "Row written by an earlier attempt");
                        let state = state.ok_or_else(|| {
                            StoreError::CorruptRow(format!("no rows for {} after insert", obs.key))
                        })?;
                        return Ok(outcome_for_write(obs, state));
                    }
                }
            }

            tx.commit().await?;
            tracing::debug!("Duplicate fetch, row already recorded");
            return Ok(UpsertOutcome::Unchanged);
        }

        let state = fetch_extremes(&mut *tx, &obs.key).await?;
        tx.commit().await?;

        let state = state.ok_or_else(|| {
            StoreError::CorruptRow(format!("no rows for {} after insert", obs.key))
        })?;
        Ok(outcome_for_write(obs, state))
    }

    async fn get_once(&self, key: &str) -> Result<Option<AggregatedDocument>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let state = fetch_extremes(&mut *conn, key).await?;
        Ok(state.map(|state| state.to_document(key)))
    }
}

#[async_trait]
impl AggregationStore for PostgresStore {
    #[tracing::instrument(skip(self, obs), fields(key = %obs.key, fetch_time = obs.fetch_time))]
    async fn upsert(&self, obs: &Observation) -> Result<UpsertOutcome, StoreError> {
        obs.validate()?;
        let pub_date = to_bigint("publish_date", obs.publish_date)?;
        let fetch_time = to_bigint("fetch_time", obs.fetch_time)?;

        retry_on_transient(&self.retry, "postgres_upsert", |attempt| {
            self.upsert_once(obs, pub_date, fetch_time, attempt)
        })
        .await
        .into_result()
    }

    #[tracing::instrument(skip(self))]
    async fn get_by_key(&self, key: &str) -> Result<Option<AggregatedDocument>, StoreError> {
        retry_on_transient(&self.retry, "postgres_get_by_key", |_attempt| self.get_once(key))
            .await
            .into_result()
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
