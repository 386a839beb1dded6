//! jobctl - A file-system job queue
//!
//! Tasks are staged as files in a job folder, packed into CPU-time bounded
//! task-lists and dispatched to a local worker pool or a Moab/Slurm cluster.
//! Sentinel files next to each task record progress so that any crash can be
//! recovered from the folder alone.

pub mod backend;
pub mod config;
pub mod error;
pub mod id;
pub mod manager;
pub mod recovery;
pub mod runner;
pub mod scheduler;
pub mod store;

pub use error::{JobControlError, Result};
