//! Postgres-backed job store.
//!
//! Window ownership rests on the `(key, bucket)` primary key of the `jobs`
//! table. Acquisition is a single statement:
//!
//! ```sql
//! INSERT INTO jobs (...) VALUES (...)
//! ON CONFLICT (key, bucket) DO NOTHING
//! RETURNING ...
//! ```
//!
//! A returned row means this process won the window; no row means another
//! process already holds it. Nothing else is needed: no transaction, no
//! advisory lock, no prior SELECT.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError | Scenario |
//! |------------|---------------|----------|
//! | Database (any code) | `Unavailable` | Statement rejected; the key conflict is not an error |
//! | PoolClosed / PoolTimedOut / Io / Tls | `Unavailable` | Datastore unreachable |
//! | ColumnDecode / Decode / RowNotFound | `Storage` | Row could not be read back |
//!
//! A row that decodes but holds a value the domain rejects (blank key, zero
//! period, unknown stage) surfaces as `Invalid`.
//! | Other | `Unavailable` | Anything else the driver reports |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use flagkeeper_core::{
    Bucket, BucketClock, Clock, DomainError, JobId, JobKey, Period, SystemClock,
};

use crate::config::DatabaseConfig;

use super::store::{JobStore, JobStoreError};
use super::types::{AcquiredBucket, JobRecord, JobStage};

/// Where "now" comes from when computing buckets and timestamps.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ClockSource {
    /// The injected application `Clock`. Processes with skewed clocks may
    /// disagree about the current bucket near window edges.
    #[default]
    Application,
    /// The database server's `now()`, evaluated inside the acquiring
    /// statement. Every process sees the same clock.
    Database,
}

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id             UUID        NOT NULL UNIQUE,
    key            TEXT        NOT NULL,
    bucket         BIGINT      NOT NULL,
    period_seconds BIGINT      NOT NULL CHECK (period_seconds > 0),
    stage          TEXT        NOT NULL CHECK (stage IN ('running', 'completed', 'failed')),
    started_at     TIMESTAMPTZ NOT NULL,
    finished_at    TIMESTAMPTZ,
    PRIMARY KEY (key, bucket),
    CHECK ((stage = 'running') = (finished_at IS NULL))
)
"#;

const CREATE_FINISHED_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_finished_at ON jobs (finished_at)";

/// Postgres-backed job store.
///
/// `Send + Sync` and cheap to clone; all statements go through the SQLx pool.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    clock_source: ClockSource,
}

impl PostgresJobStore {
    /// Store using the wall clock for buckets.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: Arc::new(SystemClock),
            clock_source: ClockSource::Application,
        }
    }

    /// Connect using a `DatabaseConfig` and create the schema if missing.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, JobStoreError> {
        let pool = config
            .connect()
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool).with_clock_source(config.clock_source);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Use a specific application clock. Implies `ClockSource::Application`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self.clock_source = ClockSource::Application;
        self
    }

    pub fn with_clock_source(mut self, clock_source: ClockSource) -> Self {
        self.clock_source = clock_source;
        self
    }

    pub fn clock_source(&self) -> ClockSource {
        self.clock_source
    }

    /// Create the `jobs` table and its index if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_table", e))?;
        sqlx::query(CREATE_FINISHED_INDEX)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_index", e))?;
        Ok(())
    }

    /// Application-side "now", or `None` to let the statement use `now()`.
    fn app_now(&self) -> Option<DateTime<Utc>> {
        match self.clock_source {
            ClockSource::Application => Some(self.clock.now()),
            ClockSource::Database => None,
        }
    }

    async fn finish(&self, id: JobId, stage: JobStage) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET stage = $2, finished_at = COALESCE($3::timestamptz, now())
            WHERE id = $1 AND stage = 'running'
            "#,
        )
        .bind(id.as_uuid())
        .bind(stage.as_str())
        .bind(self.app_now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finish", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Nothing updated: tell a missing row apart from a settled one.
        let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("finish_lookup", e))?;

        match exists {
            Some(_) => Err(JobStoreError::NotRunning(id)),
            None => Err(JobStoreError::NotFound(id)),
        }
    }
}

impl std::fmt::Debug for PostgresJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresJobStore")
            .field("clock_source", &self.clock_source)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip_all, fields(key = %key, period = %period), err)]
    async fn acquire_bucket(
        &self,
        key: &JobKey,
        period: Period,
    ) -> Result<Option<AcquiredBucket>, JobStoreError> {
        let id = JobId::new();
        let now = self.app_now();
        let bucket = now.map(|now| BucketClock::bucket_at(now, period).as_i64());

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (id, key, bucket, period_seconds, stage, started_at)
            VALUES (
                $1,
                $2,
                COALESCE($3::bigint, floor(extract(epoch FROM now()) / $4::bigint)::bigint),
                $4::bigint,
                'running',
                COALESCE($5::timestamptz, now())
            )
            ON CONFLICT (key, bucket) DO NOTHING
            RETURNING id, key, bucket, period_seconds, stage, started_at, finished_at
            "#,
        )
        .bind(id.as_uuid())
        .bind(key.as_str())
        .bind(bucket)
        .bind(period.as_secs_i64())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("acquire_bucket", e))?;

        match row {
            Some(row) => {
                let record = JobRow::from_pg_row(&row)?.into_record()?;
                debug!(job_id = %record.id, bucket = %record.bucket, "acquired job bucket");
                Ok(Some(record.to_acquired()))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip_all, fields(job_id = %id), err)]
    async fn mark_completed(&self, id: JobId) -> Result<(), JobStoreError> {
        self.finish(id, JobStage::Completed).await
    }

    #[instrument(skip_all, fields(job_id = %id), err)]
    async fn mark_failed(&self, id: JobId) -> Result<(), JobStoreError> {
        self.finish(id, JobStage::Failed).await
    }

    #[instrument(skip_all, fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, key, bucket, period_seconds, stage, started_at, finished_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| JobRow::from_pg_row(&row)?.into_record())
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn get_all(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, key, bucket, period_seconds, stage, started_at, finished_at
            FROM jobs
            ORDER BY started_at ASC, key ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_all", e))?;

        rows.iter()
            .map(|row| JobRow::from_pg_row(row)?.into_record())
            .collect()
    }

    #[instrument(skip_all, fields(key = %key), err)]
    async fn list_by_key(&self, key: &JobKey) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, key, bucket, period_seconds, stage, started_at, finished_at
            FROM jobs
            WHERE key = $1
            ORDER BY started_at ASC, bucket ASC
            "#,
        )
        .bind(key.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_key", e))?;

        rows.iter()
            .map(|row| JobRow::from_pg_row(row)?.into_record())
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn count(&self) -> Result<u64, JobStoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM jobs")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| map_sqlx_error("count_decode", e))?;
        Ok(total.max(0) as u64)
    }

    #[instrument(skip(self), err)]
    async fn delete_all(&self) -> Result<(), JobStoreError> {
        sqlx::query("DELETE FROM jobs")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_all", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result =
            sqlx::query("DELETE FROM jobs WHERE finished_at IS NOT NULL AND finished_at < $1")
                .bind(cutoff)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("delete_finished_before", e))?;
        Ok(result.rows_affected())
    }
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            JobStoreError::Unavailable(format!(
                "database error in {} ({}): {}",
                operation,
                code,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("timed out acquiring a connection in {}", operation))
        }
        sqlx::Error::Io(e) => {
            JobStoreError::Unavailable(format!("io error in {}: {}", operation, e))
        }
        sqlx::Error::Tls(e) => {
            JobStoreError::Unavailable(format!("tls error in {}: {}", operation, e))
        }
        sqlx::Error::RowNotFound => {
            JobStoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        e @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)) => {
            JobStoreError::Storage(format!("failed to decode row in {}: {}", operation, e))
        }
        _ => JobStoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    key: String,
    bucket: i64,
    period_seconds: i64,
    stage: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn from_pg_row(row: &PgRow) -> Result<Self, JobStoreError> {
        let decode = |e| map_sqlx_error("decode_job_row", e);
        Ok(JobRow {
            id: row.try_get("id").map_err(decode)?,
            key: row.try_get("key").map_err(decode)?,
            bucket: row.try_get("bucket").map_err(decode)?,
            period_seconds: row.try_get("period_seconds").map_err(decode)?,
            stage: row.try_get("stage").map_err(decode)?,
            started_at: row.try_get("started_at").map_err(decode)?,
            finished_at: row.try_get("finished_at").map_err(decode)?,
        })
    }

    /// Validate a raw row. Values the domain rejects come back as `Invalid`.
    fn into_record(self) -> Result<JobRecord, JobStoreError> {
        let key = JobKey::new(self.key)?;
        let period = u64::try_from(self.period_seconds)
            .map_err(|_| {
                DomainError::validation(format!("negative period: {}", self.period_seconds))
            })
            .and_then(Period::from_secs)?;
        let stage: JobStage = self.stage.parse()?;

        Ok(JobRecord {
            id: JobId::from_uuid(self.id),
            key,
            bucket: Bucket::from_raw(self.bucket),
            period,
            stage,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> JobRow {
        JobRow {
            id: uuid::Uuid::now_v7(),
            key: "license-count".to_string(),
            bucket: 7,
            period_seconds: 3600,
            stage: "completed".to_string(),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
        }
    }

    #[test]
    fn row_converts_to_record() {
        let record = row().into_record().unwrap();
        assert_eq!(record.key.as_str(), "license-count");
        assert_eq!(record.bucket.as_i64(), 7);
        assert_eq!(record.period.as_secs(), 3600);
        assert_eq!(record.stage, JobStage::Completed);
    }

    #[test]
    fn unknown_stage_is_invalid() {
        let mut bad = row();
        bad.stage = "started".to_string();
        assert!(matches!(
            bad.into_record(),
            Err(JobStoreError::Invalid(DomainError::Validation(msg))) if msg.contains("started")
        ));
    }

    #[test]
    fn non_positive_period_is_invalid() {
        let mut bad = row();
        bad.period_seconds = 0;
        assert!(matches!(bad.into_record(), Err(JobStoreError::Invalid(_))));
        let mut bad = row();
        bad.period_seconds = -5;
        assert!(matches!(bad.into_record(), Err(JobStoreError::Invalid(_))));
    }

    #[test]
    fn blank_key_is_invalid() {
        let mut bad = row();
        bad.key = "   ".to_string();
        assert!(matches!(bad.into_record(), Err(JobStoreError::Invalid(_))));
    }

    #[test]
    fn connection_errors_are_unavailable() {
        assert!(matches!(
            map_sqlx_error("acquire_bucket", sqlx::Error::PoolClosed),
            JobStoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("acquire_bucket", sqlx::Error::PoolTimedOut),
            JobStoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("get", sqlx::Error::RowNotFound),
            JobStoreError::Storage(_)
        ));
    }

    #[test]
    fn clock_source_defaults_to_application() {
        assert_eq!(ClockSource::default(), ClockSource::Application);
    }
}
