//! Runner module - executes task-lists on this machine.
//!
//! Used in-process by the local backend and, through the `run-tasklist`
//! subcommand, by the submission scripts of the cluster backends.

mod executor;

pub use executor::{
    ExecutionReport, RunSummary, SLURM_CPUS_ENV, TaskListExecutor, TaskOutcome, default_workers,
};
