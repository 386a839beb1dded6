//! Local backend - runs task-lists in-process.

use log::debug;

use crate::backend::{JobRef, JobState};
use crate::error::Result;
use crate::runner::TaskListExecutor;
use crate::store::TaskList;

pub const BACKEND: &str = "local";

/// Runs each task-list to completion on this machine at submit time.
///
/// Reconciliation is left to the driver so that failed tasks stay in the
/// submitted area for a retry round.
pub struct LocalBackend {
    executor: TaskListExecutor,
}

impl LocalBackend {
    pub fn new(executor: TaskListExecutor) -> Self {
        Self { executor }
    }

    pub async fn submit(&self, tasklist: &TaskList) -> Result<JobRef> {
        debug!(
            "Running task-list {} locally on {} workers",
            tasklist.name,
            self.executor.workers()
        );
        let summary = self.executor.run_tasks(&tasklist.tasks).await;
        let code = if summary.is_clean() { 0 } else { 1 };
        Ok(JobRef::Local { code })
    }

    pub fn poll(code: i32) -> JobState {
        if code == 0 {
            JobState::Succeeded
        } else {
            JobState::Failed { code: Some(code) }
        }
    }
}
