//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use flagkeeper_core::{Bucket, BucketClock, Clock, DomainError, JobId, JobKey, Period, SystemClock};

use super::types::{AcquiredBucket, JobRecord, JobStage};

/// Persistence for job windows.
///
/// ## Acquisition
///
/// `acquire_bucket` is the only synchronization point of the whole
/// coordinator. Implementations must perform it as a single atomic
/// insert-if-absent keyed on `(key, bucket)`:
///
/// - `Ok(Some(_))`: this caller created the row and owns the window
/// - `Ok(None)`: a row already exists; someone else owns the window
/// - `Err(_)`: the store could not answer. Never collapse this into `None`.
///
/// A "select, then insert if missing" sequence is not acceptable: two
/// processes can both observe the gap and both insert.
///
/// ## Outcomes
///
/// `mark_completed` / `mark_failed` are called once, by the owner of the row.
/// They only succeed on a `Running` row.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Try to take the current window for `key`.
    async fn acquire_bucket(
        &self,
        key: &JobKey,
        period: Period,
    ) -> Result<Option<AcquiredBucket>, JobStoreError>;

    /// Record a successful run.
    async fn mark_completed(&self, id: JobId) -> Result<(), JobStoreError>;

    /// Record a failed run.
    async fn mark_failed(&self, id: JobId) -> Result<(), JobStoreError>;

    /// Get a row by ID.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Every row, any stage, unordered.
    async fn get_all(&self) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Rows for one key, oldest first.
    async fn list_by_key(&self, key: &JobKey) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Total number of rows.
    async fn count(&self) -> Result<u64, JobStoreError>;

    /// Remove every row (administrative/test reset).
    async fn delete_all(&self) -> Result<(), JobStoreError>;

    /// Remove terminal rows that finished before `cutoff`. Returns how many were removed.
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    /// The datastore could not be reached or refused the statement.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// Outcome reported for a row that already settled.
    #[error("job {0} is not running")]
    NotRunning(JobId),
    /// Stored data could not be read back (undecodable row, poisoned lock).
    #[error("storage error: {0}")]
    Storage(String),
    /// A stored row holds a value the domain rejects.
    #[error(transparent)]
    Invalid(#[from] DomainError),
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn acquire_bucket(
        &self,
        key: &JobKey,
        period: Period,
    ) -> Result<Option<AcquiredBucket>, JobStoreError> {
        (**self).acquire_bucket(key, period).await
    }

    async fn mark_completed(&self, id: JobId) -> Result<(), JobStoreError> {
        (**self).mark_completed(id).await
    }

    async fn mark_failed(&self, id: JobId) -> Result<(), JobStoreError> {
        (**self).mark_failed(id).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(id).await
    }

    async fn get_all(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).get_all().await
    }

    async fn list_by_key(&self, key: &JobKey) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list_by_key(key).await
    }

    async fn count(&self) -> Result<u64, JobStoreError> {
        (**self).count().await
    }

    async fn delete_all(&self) -> Result<(), JobStoreError> {
        (**self).delete_all().await
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).delete_finished_before(cutoff).await
    }
}

#[derive(Debug, Default)]
struct Rows {
    by_window: HashMap<(JobKey, Bucket), JobRecord>,
    windows: HashMap<JobId, (JobKey, Bucket)>,
}

/// In-memory job store for tests/dev and single-process deployments.
///
/// The `(key, bucket)` map entry plays the role of the unique constraint; the
/// check and the insert happen under one write lock.
pub struct InMemoryJobStore {
    rows: RwLock<Rows>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: RwLock::new(Rows::default()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Rows>, JobStoreError> {
        self.rows
            .read()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Rows>, JobStoreError> {
        self.rows
            .write()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".to_string()))
    }

    fn finish(&self, id: JobId, stage: JobStage) -> Result<(), JobStoreError> {
        let now = self.clock.now();
        let mut rows = self.write()?;
        let window = rows.windows.get(&id).cloned().ok_or(JobStoreError::NotFound(id))?;
        let record = rows
            .by_window
            .get_mut(&window)
            .ok_or_else(|| JobStoreError::Storage(format!("index points at missing job {id}")))?;

        if record.stage.is_terminal() {
            return Err(JobStoreError::NotRunning(id));
        }
        record.stage = stage;
        record.finished_at = Some(now);
        Ok(())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobStore")
            .field("rows", &self.rows)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn acquire_bucket(
        &self,
        key: &JobKey,
        period: Period,
    ) -> Result<Option<AcquiredBucket>, JobStoreError> {
        let now = self.clock.now();
        let bucket = BucketClock::bucket_at(now, period);
        let window = (key.clone(), bucket);

        let mut rows = self.write()?;
        if rows.by_window.contains_key(&window) {
            return Ok(None);
        }

        let record = JobRecord::running(key.clone(), bucket, period, now);
        let acquired = record.to_acquired();
        rows.windows.insert(record.id, window.clone());
        rows.by_window.insert(window, record);
        Ok(Some(acquired))
    }

    async fn mark_completed(&self, id: JobId) -> Result<(), JobStoreError> {
        self.finish(id, JobStage::Completed)
    }

    async fn mark_failed(&self, id: JobId) -> Result<(), JobStoreError> {
        self.finish(id, JobStage::Failed)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let rows = self.read()?;
        Ok(rows
            .windows
            .get(&id)
            .and_then(|window| rows.by_window.get(window))
            .cloned())
    }

    async fn get_all(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = self.read()?;
        Ok(rows.by_window.values().cloned().collect())
    }

    async fn list_by_key(&self, key: &JobKey) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = self.read()?;
        let mut result: Vec<_> = rows
            .by_window
            .values()
            .filter(|r| &r.key == key)
            .cloned()
            .collect();

        result.sort_by_key(|r| (r.started_at, r.bucket));
        Ok(result)
    }

    async fn count(&self) -> Result<u64, JobStoreError> {
        Ok(self.read()?.by_window.len() as u64)
    }

    async fn delete_all(&self) -> Result<(), JobStoreError> {
        let mut rows = self.write()?;
        rows.by_window.clear();
        rows.windows.clear();
        Ok(())
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut rows = self.write()?;
        let expired: Vec<_> = rows
            .by_window
            .iter()
            .filter(|(_, r)| r.finished_at.is_some_and(|finished| finished < cutoff))
            .map(|(window, r)| (window.clone(), r.id))
            .collect();

        for (window, id) in &expired {
            rows.by_window.remove(window);
            rows.windows.remove(id);
        }
        Ok(expired.len() as u64)
    }
}
