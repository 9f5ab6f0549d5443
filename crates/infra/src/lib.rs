//! Infrastructure layer: job persistence, coordination and datastore wiring.

pub mod config;
pub mod jobs;
