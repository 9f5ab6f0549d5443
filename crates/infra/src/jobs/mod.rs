//! Periodic job coordination over a shared relational table.
//!
//! ## Design
//!
//! - Many server processes share one `jobs` table and nothing else
//! - A job key may run at most once per time window (bucket)
//! - Ownership of a window is won by a single uniqueness-enforced insert
//! - Outcomes (completed/failed) are persisted on the winning row
//! - Job errors are recorded, never propagated to the scheduler
//!
//! ## Components
//!
//! - `JobStore`: acquisition and outcome persistence (in-memory or Postgres)
//! - `JobService`: wraps a unit of work into a `SingleInstance` callable
//! - `JobRecord` / `JobStage`: the persisted row and its state machine

pub mod postgres;
pub mod service;
pub mod store;
pub mod types;

pub use postgres::{ClockSource, PostgresJobStore};
pub use service::{JobService, SingleInstance};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{AcquiredBucket, JobRecord, JobRun, JobStage};
