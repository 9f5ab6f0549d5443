//! Time windows ("buckets") and the clocks that feed them.
//!
//! A bucket is the unit of mutual exclusion: for a given job key, at most one
//! execution may be recorded per bucket. Buckets are derived purely from wall
//! clock time and a period length:
//!
//! ```text
//! bucket = floor(unix_seconds(now) / period_seconds)
//! ```
//!
//! ## Boundary rule
//!
//! Sub-second precision is dropped before dividing, and division floors toward
//! negative infinity. An instant that lands exactly on a window edge therefore
//! belongs to the **new** window. Two invocations that straddle that instant
//! fall into different buckets and may both execute; this is an accepted,
//! rare outcome and is not compensated for with retries.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Length of a coordination window, in whole seconds. Always > 0.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Period(u64);

impl Period {
    pub fn from_secs(secs: u64) -> DomainResult<Self> {
        if secs == 0 {
            return Err(DomainError::validation("period must be greater than zero"));
        }
        if secs > i64::MAX as u64 {
            return Err(DomainError::validation(format!(
                "period of {secs}s does not fit a signed 64-bit second count"
            )));
        }
        Ok(Self(secs))
    }

    pub fn from_minutes(minutes: u64) -> DomainResult<Self> {
        let secs = minutes
            .checked_mul(60)
            .ok_or_else(|| DomainError::validation("period overflows"))?;
        Self::from_secs(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Same value as `as_secs`, typed for SQL binds and chrono arithmetic.
    pub fn as_secs_i64(&self) -> i64 {
        // Bounded by the constructor.
        self.0 as i64
    }
}

impl TryFrom<u64> for Period {
    type Error = DomainError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::from_secs(value)
    }
}

impl From<Period> for u64 {
    fn from(value: Period) -> Self {
        value.0
    }
}

impl core::fmt::Display for Period {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}s", self.0)
    }
}

/// Identifier of one period-aligned window.
///
/// The number is only meaningful together with the period that produced it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bucket(i64);

impl Bucket {
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// First instant of this window.
    pub fn starts_at(&self, period: Period) -> Option<DateTime<Utc>> {
        let secs = self.0.checked_mul(period.as_secs_i64())?;
        DateTime::from_timestamp(secs, 0)
    }

    /// First instant of the following window.
    pub fn ends_at(&self, period: Period) -> Option<DateTime<Utc>> {
        self.next().starts_at(period)
    }

    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl core::fmt::Display for Bucket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Pure mapping from an instant and a period to a bucket.
#[derive(Debug, Copy, Clone, Default)]
pub struct BucketClock;

impl BucketClock {
    /// Bucket containing `now` for the given period (floor semantics).
    pub fn bucket_at(now: DateTime<Utc>, period: Period) -> Bucket {
        // `timestamp()` already floors pre-epoch instants with a sub-second part.
        Bucket(now.timestamp().div_euclid(period.as_secs_i64()))
    }

    /// Bucket containing the clock's current time.
    pub fn current(clock: &dyn Clock, period: Period) -> Bucket {
        Self::bucket_at(clock.now(), period)
    }
}

/// Source of "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

impl<C> Clock for Arc<C>
where
    C: Clock + ?Sized,
{
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Wall clock.
#[derive(Debug, Copy, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used to drive tests across window edges.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn arc(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self::new(start))
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(|e| e.into_inner()) = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}
