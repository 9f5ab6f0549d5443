//! Job keys: the name of a logical periodic job.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Longest key accepted, in bytes.
pub const MAX_KEY_LEN: usize = 255;

/// Name of a logical job, e.g. `"aggregate-daily-metrics"`.
///
/// Keys are independent of each other: acquiring a window for one key never
/// affects another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobKey(String);

impl JobKey {
    /// Validate and wrap a key. Empty, whitespace-only and over-long keys are rejected.
    pub fn new(key: impl Into<String>) -> DomainResult<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(DomainError::validation("job key must not be empty"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(DomainError::validation(format!(
                "job key is {} bytes, limit is {MAX_KEY_LEN}",
                key.len()
            )));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JobKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for JobKey {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobKey> for String {
    fn from(value: JobKey) -> Self {
        value.0
    }
}
