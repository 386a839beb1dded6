//! Task-list executor - runs the scripts of one task-list on a worker pool.
//!
//! Each task walks the sentinel protocol:
//! 1. `.start` is touched
//! 2. the `.run` copy is written
//! 3. `bash {task}.run` runs in the task's working directory
//! 4. `.finish` is touched, also when any of the above failed
//! 5. `.success` is touched iff the exit code was exactly zero
//!
//! A failing task never aborts the pool. Afterwards the task-list is
//! reconciled and its manifest removed; the submission script that launched
//! the run is left for the driver to clean up.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::Result;
use crate::recovery::{ReconcileReport, reconcile};
use crate::store::TaskStore;

/// Environment variable Slurm sets to the CPUs allocated on the node
pub const SLURM_CPUS_ENV: &str = "SLURM_CPUS_ON_NODE";

/// How a single task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Script exited with code 0
    Succeeded,
    /// Script exited non-zero or was killed by a signal (no code)
    Failed(Option<i32>),
    /// Task file was gone before it could start
    Skipped,
    /// The executor itself could not run the script
    Error(String),
}

/// Counts over one pool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Succeeded => self.succeeded += 1,
            TaskOutcome::Failed(_) => self.failed += 1,
            TaskOutcome::Skipped => self.skipped += 1,
            TaskOutcome::Error(_) => self.errors += 1,
        }
    }

    /// True when every task that ran exited with code 0.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.errors
    }
}

/// Result of running and reconciling a whole task-list.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub tasklist: String,
    pub run: RunSummary,
    pub reconcile: ReconcileReport,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.reconcile.is_success()
    }
}

/// Runs task scripts with at most `workers` running at once.
#[derive(Debug, Clone)]
pub struct TaskListExecutor {
    store: TaskStore,
    workers: usize,
    capture_output: bool,
}

impl TaskListExecutor {
    pub fn new(store: TaskStore, workers: usize, capture_output: bool) -> Self {
        Self {
            store,
            workers: workers.max(1),
            capture_output,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Run the given submitted tasks. Sentinels record every outcome.
    pub async fn run_tasks(&self, tasks: &[PathBuf]) -> RunSummary {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut pool = JoinSet::new();

        for task in tasks {
            let semaphore = Arc::clone(&semaphore);
            let store = self.store.clone();
            let task = task.clone();
            let capture_output = self.capture_output;
            pool.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return TaskOutcome::Error(e.to_string()),
                };
                run_task(&store, &task, capture_output).await
            });
        }

        let mut summary = RunSummary::default();
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    error!("Worker aborted: {}", e);
                    summary.errors += 1;
                }
            }
        }

        info!(
            "Ran {} tasks on {} workers: {} succeeded, {} failed, {} skipped, {} errors",
            summary.total(),
            self.workers,
            summary.succeeded,
            summary.failed,
            summary.skipped,
            summary.errors
        );
        summary
    }

    /// Execute a task-list manifest end to end.
    pub async fn run_tasklist(&self, manifest: &Path) -> Result<ExecutionReport> {
        let tasklist = self.store.load_tasklist(manifest)?;
        info!(
            "Executing task-list {} ({} tasks, {}s)",
            tasklist.name,
            tasklist.tasks.len(),
            tasklist.eta
        );

        let run = self.run_tasks(&tasklist.tasks).await;
        let reconcile = reconcile(&self.store, &tasklist.tasks)?;
        self.store.remove_manifest(manifest)?;

        Ok(ExecutionReport {
            tasklist: tasklist.name,
            run,
            reconcile,
        })
    }
}

/// Worker count for a pool: explicit value, then `SLURM_CPUS_ON_NODE`, then
/// the machine's available parallelism.
pub fn default_workers(explicit: Option<usize>) -> usize {
    if let Some(n) = explicit.filter(|&n| n > 0) {
        return n;
    }
    if let Some(n) = std::env::var(SLURM_CPUS_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
    {
        return n;
    }
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

async fn run_task(store: &TaskStore, task: &Path, capture_output: bool) -> TaskOutcome {
    if !task.exists() {
        warn!("Task {} no longer exists, skipping", task.display());
        return TaskOutcome::Skipped;
    }

    let outcome = match run_script(store, task, capture_output).await {
        Ok(Some(0)) => TaskOutcome::Succeeded,
        Ok(code) => {
            debug!("{} exited with {:?}", task.display(), code);
            TaskOutcome::Failed(code)
        }
        Err(e) => {
            error!("Could not run {}: {}", task.display(), e);
            TaskOutcome::Error(e.to_string())
        }
    };

    if let Err(e) = store.mark_finished(task) {
        error!("Could not mark {} finished: {}", task.display(), e);
        return TaskOutcome::Error(e.to_string());
    }
    if outcome == TaskOutcome::Succeeded {
        if let Err(e) = store.mark_success(task) {
            error!("Could not mark {} successful: {}", task.display(), e);
            return TaskOutcome::Error(e.to_string());
        }
    }
    outcome
}

async fn run_script(store: &TaskStore, task: &Path, capture_output: bool) -> Result<Option<i32>> {
    store.mark_started(task)?;
    let record = store.materialize(task)?;

    let stdout = if capture_output {
        Stdio::from(File::create(store.output_path(task))?)
    } else {
        Stdio::null()
    };

    let status = Command::new("bash")
        .arg(store.run_path(task))
        .current_dir(&record.working_dir)
        .stdin(Stdio::null())
        .stdout(stdout)
        .status()
        .await?;
    Ok(status.code())
}
