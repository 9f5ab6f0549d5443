//! Single-instance wrapping of periodic work.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use tracing::{Instrument, debug, error, info, instrument};

use flagkeeper_core::{JobKey, Period};

use super::store::{JobStore, JobStoreError};
use super::types::{AcquiredBucket, JobRun};

/// Turns units of work into callables that run at most once per window.
///
/// The store is injected; independent services over independent stores do
/// not see each other.
pub struct JobService<S: JobStore> {
    store: Arc<S>,
}

impl<S: JobStore + 'static> JobService<S> {
    /// Create a service over the given store.
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// Create a service sharing an existing store handle.
    pub fn from_arc(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Wrap `job` so that, across every process sharing the store, it runs at
    /// most once per `period`-long window for `key`.
    ///
    /// The returned value is meant to be driven by an external scheduler that
    /// calls [`SingleInstance::run`] as often as it likes.
    pub fn single_instance<F, Fut>(
        &self,
        key: JobKey,
        job: F,
        period: Period,
    ) -> SingleInstance<S, F>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        SingleInstance {
            store: self.store.clone(),
            key,
            period,
            job: Arc::new(job),
        }
    }
}

impl<S: JobStore> Clone for JobService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

/// A unit of work bound to a key and a period.
///
/// Cheap to clone; every clone coordinates through the same store.
pub struct SingleInstance<S: JobStore, F> {
    store: Arc<S>,
    key: JobKey,
    period: Period,
    job: Arc<F>,
}

impl<S, F, Fut> SingleInstance<S, F>
where
    S: JobStore + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn period(&self) -> Period {
        self.period
    }

    /// Run the job if this caller wins the current window.
    ///
    /// - window already taken: returns `Ok(JobRun::Skipped)` without running the job
    /// - job succeeds: row marked completed, `Ok(JobRun::Completed)`
    /// - job errors or panics: error logged, row marked failed, `Ok(JobRun::Failed)`
    ///
    /// Only store errors are returned. The job's own failure never is.
    ///
    /// Once the window is acquired, the job and its outcome write run on their
    /// own task: dropping the returned future does not leave the row running.
    #[instrument(skip_all, fields(job = %self.key, period = %self.period))]
    pub async fn run(&self) -> Result<JobRun, JobStoreError> {
        let Some(acquired) = self.store.acquire_bucket(&self.key, self.period).await? else {
            debug!("window already taken, skipping");
            return Ok(JobRun::Skipped);
        };

        let settle = Self::settle(self.store.clone(), self.job.clone(), acquired);
        match tokio::spawn(settle.in_current_span()).await {
            Ok(result) => result,
            Err(join) => Err(JobStoreError::Storage(format!(
                "outcome task did not finish: {join}"
            ))),
        }
    }

    /// Execute the job and record how it ended.
    async fn settle(
        store: Arc<S>,
        job: Arc<F>,
        acquired: AcquiredBucket,
    ) -> Result<JobRun, JobStoreError> {
        let started = Instant::now();
        match execute(job).await {
            Ok(()) => {
                store.mark_completed(acquired.id).await?;
                info!(
                    job_id = %acquired.id,
                    bucket = %acquired.bucket,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
                Ok(JobRun::Completed(acquired.id))
            }
            Err(err) => {
                error!(
                    job_id = %acquired.id,
                    bucket = %acquired.bucket,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %format!("{err:#}"),
                    "job failed"
                );
                store.mark_failed(acquired.id).await?;
                Ok(JobRun::Failed(acquired.id))
            }
        }
    }
}

/// Run the job on its own task so a panic is reported as a failure instead
/// of unwinding into the scheduler.
async fn execute<F, Fut>(job: Arc<F>) -> anyhow::Result<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let fut = panic::catch_unwind(AssertUnwindSafe(|| (*job)()))
        .map_err(|payload| anyhow!("job panicked: {}", panic_message(payload.as_ref())))?;

    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(join) if join.is_panic() => {
            let payload = join.into_panic();
            Err(anyhow!("job panicked: {}", panic_message(payload.as_ref())))
        }
        Err(join) => Err(anyhow!("job task did not finish: {join}")),
    }
}

impl<S: JobStore, F> Clone for SingleInstance<S, F> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            key: self.key.clone(),
            period: self.period,
            job: self.job.clone(),
        }
    }
}

impl<S: JobStore, F> std::fmt::Debug for SingleInstance<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleInstance")
            .field("key", &self.key)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
