//! Guarded background jobs.

pub mod model;
pub mod runner;
pub mod service;
pub mod timer;

pub use model::{JobRecord, JobRun, JobStatus};
pub use runner::{JobOutcome, JobRunner, SkipReason};
pub use service::{ExpiryReport, JobService, JobStatusView};
pub use timer::spawn_local_timer;
