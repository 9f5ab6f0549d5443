//! `flagkeeper-core` — domain primitives for the periodic job coordinator.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): job
//! identifiers, job keys, time windows and the clock that maps "now" onto them.

pub mod bucket;
pub mod error;
pub mod id;
pub mod key;

pub use bucket::{Bucket, BucketClock, Clock, ManualClock, Period, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use key::JobKey;
