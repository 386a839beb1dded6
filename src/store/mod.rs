//! Storage layer for jobctl.
//!
//! Tasks are plain files moving through three areas of the job folder:
//! - **stage/**: staged, not yet dispatched
//! - **submitted/**: packed into a task-list, with sentinels written alongside
//! - **tasklists/**: one manifest per dispatched batch
//!
//! # Example
//!
//! ```ignore
//! use jobctl::config::JobFolder;
//! use jobctl::store::TaskStore;
//! use std::path::Path;
//!
//! let store = TaskStore::open(&JobFolder::new("/tmp/jobs"))?;
//! let entry = store.stage("echo hello\n", Path::new("/tmp"), 60.0)?;
//! let submitted = store.move_to_submitted(&entry.name)?;
//! store.mark_started(&submitted)?;
//! ```

mod records;
mod task_store;

pub use records::{
    OUT_SUFFIX, RUN_SUFFIX, Sentinel, TaskEntry, TaskList, TaskRecord, TaskState, format_eta, parse_eta,
    parse_task_name, sidecar_path, validate_eta,
};
pub use task_store::{TaskEntries, TaskStore};
