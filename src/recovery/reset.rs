//! Operator reset of the submitted area.
//!
//! A soft reset retires succeeded tasks and restages never-started tasks that
//! no outstanding manifest refers to. A hard reset assumes nothing is running
//! any more: every unsuccessful task goes back to stage and all task-lists are
//! deleted.

use std::collections::HashSet;
use std::path::PathBuf;

use log::{info, warn};

use crate::error::Result;
use crate::store::{TaskState, TaskStore};

/// Outcome of a reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetReport {
    pub retired: usize,
    pub restaged: usize,
    pub tasklists_removed: usize,
}

/// Recover submitted work back to the stage area.
pub fn reset(store: &TaskStore, hard: bool) -> Result<ResetReport> {
    let referenced = if hard { HashSet::new() } else { referenced_tasks(store)? };
    let mut report = ResetReport::default();

    let submitted: Vec<PathBuf> = store
        .list_submitted()?
        .map(|entry| entry.map(|e| e.path))
        .collect::<Result<_>>()?;

    for task in submitted {
        match store.state(&task) {
            TaskState::Succeeded => {
                store.retire(&task)?;
                report.retired += 1;
            }
            TaskState::NeverStarted if hard || !referenced.contains(&task) => {
                store.restage(&task)?;
                report.restaged += 1;
            }
            TaskState::RunningOrCrashed | TaskState::FinishedFailed if hard => {
                store.restage(&task)?;
                report.restaged += 1;
            }
            _ => {}
        }
    }

    if hard {
        report.tasklists_removed = store.clear_tasklists()?;
    }

    info!(
        "Reset ({}): retired {}, restaged {}, removed {} task-list files",
        if hard { "hard" } else { "soft" },
        report.retired,
        report.restaged,
        report.tasklists_removed
    );
    Ok(report)
}

/// Task paths named by any outstanding manifest.
fn referenced_tasks(store: &TaskStore) -> Result<HashSet<PathBuf>> {
    let mut referenced = HashSet::new();
    for manifest in store.list_tasklists()? {
        match store.read_tasklist(&manifest) {
            Ok(tasks) => referenced.extend(tasks),
            Err(e) => warn!("Skipping unreadable task-list {}: {}", manifest.display(), e),
        }
    }
    Ok(referenced)
}
