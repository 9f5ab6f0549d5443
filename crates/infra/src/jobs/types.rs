//! Core job types.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flagkeeper_core::{Bucket, DomainError, JobId, JobKey, Period};

/// Lifecycle stage of a job record.
///
/// `Running` is the only non-terminal stage. A row moves to `Completed` or
/// `Failed` exactly once and never changes again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    /// Window acquired, work in progress
    Running,
    /// Work finished without error
    Completed,
    /// Work returned an error or panicked
    Failed,
}

impl JobStage {
    pub fn is_terminal(&self) -> bool {
        match self {
            JobStage::Running => false,
            JobStage::Completed | JobStage::Failed => true,
        }
    }

    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Running => "running",
            JobStage::Completed => "completed",
            JobStage::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStage::Running),
            "completed" => Ok(JobStage::Completed),
            "failed" => Ok(JobStage::Failed),
            other => Err(DomainError::validation(format!("unknown job stage: {other}"))),
        }
    }
}

/// One stored job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Row identifier
    pub id: JobId,
    /// Logical job name
    pub key: JobKey,
    /// Window this row owns; unique together with `key`
    pub bucket: Bucket,
    /// Period `bucket` was computed with
    pub period: Period,
    /// Current stage
    pub stage: JobStage,
    /// When the window was acquired
    pub started_at: DateTime<Utc>,
    /// When the work settled; `None` while running
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Fresh row for a just-acquired window.
    pub fn running(key: JobKey, bucket: Bucket, period: Period, started_at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            key,
            bucket,
            period,
            stage: JobStage::Running,
            started_at,
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Wall time between acquisition and settlement, once finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|finished| finished - self.started_at)
    }

    /// Handle returned to the owner of a freshly inserted row.
    pub fn to_acquired(&self) -> AcquiredBucket {
        AcquiredBucket {
            id: self.id,
            key: self.key.clone(),
            bucket: self.bucket,
            period: self.period,
            started_at: self.started_at,
        }
    }
}

/// Proof of ownership for one `(key, bucket)` window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquiredBucket {
    pub id: JobId,
    pub key: JobKey,
    pub bucket: Bucket,
    pub period: Period,
    pub started_at: DateTime<Utc>,
}

/// What a single `SingleInstance::run` call did.
///
/// Purely informational; the scheduler driving the wrapper may ignore it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobRun {
    /// Another caller already owns the current window
    Skipped,
    /// This caller owned the window and the work succeeded
    Completed(JobId),
    /// This caller owned the window and the work failed (error contained)
    Failed(JobId),
}

impl JobRun {
    /// Whether the wrapped work ran during this call.
    pub fn executed(&self) -> bool {
        !matches!(self, JobRun::Skipped)
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobRun::Skipped => None,
            JobRun::Completed(id) | JobRun::Failed(id) => Some(*id),
        }
    }
}
