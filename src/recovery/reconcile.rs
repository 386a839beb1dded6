//! Reconciliation of a task-list after execution.
//!
//! Every task is classified by its sentinels:
//! 1. Never started or started-not-finished: the executor may have died, so
//!    the task goes back to the stage area
//! 2. Finished without success: left in place for inspection and retry
//! 3. Succeeded: retired
//!
//! Tasks that no longer exist were already handled by someone else (usually a
//! remote executor that reconciled its own task-list).

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::error::Result;
use crate::store::{TaskEntry, TaskState, TaskStore};

/// What happened to each task of a reconciled task-list.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Succeeded and deleted
    pub retired: Vec<PathBuf>,
    /// Moved back to the stage area
    pub restaged: Vec<TaskEntry>,
    /// Ran and failed; still in the submitted area
    pub failed: Vec<PathBuf>,
    /// No longer present in the submitted area
    pub missing: Vec<PathBuf>,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.retired.len() + self.restaged.len() + self.failed.len() + self.missing.len()
    }

    /// True when no task is left in the failed state.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn merge(&mut self, other: ReconcileReport) {
        self.retired.extend(other.retired);
        self.restaged.extend(other.restaged);
        self.failed.extend(other.failed);
        self.missing.extend(other.missing);
    }
}

/// Classify and settle every task of a task-list.
pub fn reconcile(store: &TaskStore, tasks: &[PathBuf]) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    for task in tasks {
        reconcile_one(store, task, &mut report)?;
    }

    info!(
        "Reconciled {} tasks: {} retired, {} restaged, {} failed, {} missing",
        report.total(),
        report.retired.len(),
        report.restaged.len(),
        report.failed.len(),
        report.missing.len()
    );
    Ok(report)
}

fn reconcile_one(store: &TaskStore, task: &Path, report: &mut ReconcileReport) -> Result<()> {
    if !task.exists() {
        warn!("Cannot find {} anymore", task.display());
        report.missing.push(task.to_path_buf());
        return Ok(());
    }

    match store.state(task) {
        TaskState::NeverStarted => {
            info!("Never started {}, restaging", task.display());
            report.restaged.push(store.restage(task)?);
        }
        TaskState::RunningOrCrashed => {
            info!("{} did not finish, restaging", task.display());
            report.restaged.push(store.restage(task)?);
        }
        TaskState::FinishedFailed => {
            warn!("{} did not succeed, leaving it in place", task.display());
            report.failed.push(task.to_path_buf());
        }
        TaskState::Succeeded => {
            store.retire(task)?;
            report.retired.push(task.to_path_buf());
        }
    }
    Ok(())
}
