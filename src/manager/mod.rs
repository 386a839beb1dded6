//! Job Manager module
//!
//! Drives the job folder: staging, execution, reset, status and config.

mod job_manager;

pub use job_manager::{ExecuteSummary, JobManager, StatusReport};
