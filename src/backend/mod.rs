//! Backend module - dispatches task-lists to where they run.
//!
//! The backend is a closed set selected from `slurmmode`:
//! - **Local**: runs each task-list in-process on a worker pool of `ncpus`
//! - **Moab**: renders an `msub` script per task-list, polls `checkjob`
//! - **Slurm**: renders an `sbatch` script per task-list, polls `sacct`
//!
//! [`Cluster`] layers the driver operations on top: run, wait, and ensure
//! success with bounded resubmission of failed work.

pub mod command;
mod local;
pub mod moab;
pub mod slurm;
mod template;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use log::{info, warn};

use crate::config::{BackendKind, JobConfig, JobFolder, format_walltime};
use crate::error::{JobControlError, Result};
use crate::recovery::reconcile;
use crate::runner::TaskListExecutor;
use crate::store::{TaskList, TaskStore};

pub use command::QueryPolicy;
pub use local::LocalBackend;
pub use moab::MoabBackend;
pub use slurm::SlurmBackend;
pub use template::{ScriptContext, ScriptRenderer};

/// Scheduler-side state of a dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    /// Completed with a non-zero code, or killed without one
    Failed { code: Option<i32> },
    /// Removed or cancelled before completing
    Removed,
}

impl JobState {
    /// Still waiting or running on the scheduler.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    /// Ended without a clean completion.
    pub fn is_failed(&self) -> bool {
        matches!(self, JobState::Failed { .. } | JobState::Removed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed { code: Some(code) } => write!(f, "failed ({})", code),
            JobState::Failed { code: None } => write!(f, "failed"),
            JobState::Removed => write!(f, "removed"),
        }
    }
}

/// Reference to a dispatched job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRef {
    /// Task-list already ran in-process; its aggregate exit code
    Local { code: i32 },
    /// Job id assigned by an external scheduler
    External(String),
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobRef::Local { code } => write!(f, "local (exit {})", code),
            JobRef::External(id) => write!(f, "{}", id),
        }
    }
}

/// A task-list together with the job running it.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    pub tasklist: TaskList,
    pub job: JobRef,
    /// Submissions of this task-list so far, the first included
    pub submissions: u32,
}

/// Settings shared by the cluster backends.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub ncpus: u32,
    /// Lower bound of a derived walltime
    pub default_walltime_secs: f64,
    /// jobctl binary the submission script invokes
    pub executor: PathBuf,
    pub root: PathBuf,
    pub tasklists_dir: PathBuf,
    pub query: QueryPolicy,
    pub poll_interval: Duration,
}

impl RemoteSettings {
    pub fn from_config(config: &JobConfig, folder: &JobFolder) -> Result<Self> {
        let executor = match &config.executor {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };
        Ok(Self {
            ncpus: config.ncpus,
            default_walltime_secs: config.default_walltime_secs(),
            executor,
            root: folder.root().to_path_buf(),
            tasklists_dir: folder.tasklists_dir(),
            query: QueryPolicy::new(config.query_retries, config.query_backoff()),
            poll_interval: config.poll_interval(),
        })
    }

    /// Walltime for a task-list of `eta` CPU seconds spread over `ncpus`,
    /// never below the default. Oversized batches get the time they need.
    pub fn walltime_for(&self, eta: f64) -> String {
        let per_cpu = eta / f64::from(self.ncpus.max(1));
        format_walltime(per_cpu.max(self.default_walltime_secs))
    }
}

/// The configured execution backend.
pub enum Backend {
    Local(LocalBackend),
    Moab(MoabBackend),
    Slurm(SlurmBackend),
}

impl Backend {
    /// Build the backend named by `slurmmode`.
    pub fn from_config(config: &JobConfig, folder: &JobFolder, store: &TaskStore) -> Result<Self> {
        let backend = match config.backend_kind()? {
            BackendKind::Local => {
                let workers = usize::try_from(config.ncpus).unwrap_or(1);
                Backend::Local(LocalBackend::new(TaskListExecutor::new(
                    store.clone(),
                    workers,
                    config.capture_output,
                )))
            }
            BackendKind::Bwuni => Backend::Moab(MoabBackend::new(
                config.bwuni.clone(),
                RemoteSettings::from_config(config, folder)?,
            )),
            BackendKind::Heidelberg => Backend::Slurm(SlurmBackend::new(
                config.heidelberg.clone(),
                RemoteSettings::from_config(config, folder)?,
            )),
        };
        Ok(backend)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Local(_) => local::BACKEND,
            Backend::Moab(_) => moab::BACKEND,
            Backend::Slurm(_) => slurm::BACKEND,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Backend::Local(_))
    }

    /// Start one task-list.
    pub async fn submit(&self, tasklist: &TaskList) -> Result<JobRef> {
        match self {
            Backend::Local(local) => local.submit(tasklist).await,
            Backend::Moab(moab) => moab.submit(tasklist).await,
            Backend::Slurm(slurm) => slurm.submit(tasklist).await,
        }
    }

    /// Current state of a job.
    pub async fn poll(&self, job: &JobRef) -> Result<JobState> {
        match (self, job) {
            (Backend::Local(_), JobRef::Local { code }) => Ok(LocalBackend::poll(*code)),
            (Backend::Moab(moab), JobRef::External(id)) => moab.poll(id).await,
            (Backend::Slurm(slurm), JobRef::External(id)) => slurm.poll(id).await,
            (backend, job) => Err(JobControlError::scheduler(
                backend.name(),
                format!("job {} was not dispatched by this backend", job),
            )),
        }
    }
}

/// Outcome of [`Cluster::ensure_success`].
#[derive(Debug, Clone, Default)]
pub struct EnsureOutcome {
    /// No failed work remains
    pub success: bool,
    pub retired: usize,
    pub restaged: usize,
    /// Tasks already settled elsewhere (a remote executor retired or restaged them)
    pub missing: usize,
    /// Submissions made by the retry rounds
    pub resubmissions: u32,
    /// Task-lists that still failed after every retry; manifests kept in `tasklists/`
    pub residue: Vec<TaskList>,
}

impl EnsureOutcome {
    pub fn failed_tasks(&self) -> usize {
        self.residue.iter().map(|list| list.tasks.len()).sum()
    }
}

/// Driver-side operations over a backend and the store.
pub struct Cluster {
    backend: Backend,
    store: TaskStore,
    poll_interval: Duration,
}

impl Cluster {
    pub fn new(backend: Backend, store: TaskStore, poll_interval: Duration) -> Self {
        Self {
            backend,
            store,
            poll_interval,
        }
    }

    pub fn from_config(config: &JobConfig, folder: &JobFolder, store: TaskStore) -> Result<Self> {
        let backend = Backend::from_config(config, folder, &store)?;
        Ok(Self::new(backend, store, config.poll_interval()))
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Dispatch every task-list. Local task-lists run to completion here,
    /// one after the other.
    pub async fn run_jobs(&self, tasklists: Vec<TaskList>) -> Result<Vec<DispatchHandle>> {
        let mut handles = Vec::with_capacity(tasklists.len());
        for tasklist in tasklists {
            let job = self.backend.submit(&tasklist).await?;
            handles.push(DispatchHandle {
                tasklist,
                job,
                submissions: 1,
            });
        }
        info!("Dispatched {} task-lists to {}", handles.len(), self.backend.name());
        Ok(handles)
    }

    /// Poll until no job is queued or running, returning the final states in
    /// handle order.
    pub async fn wait_for_finish(&self, handles: &[DispatchHandle]) -> Result<Vec<JobState>> {
        loop {
            let mut states = Vec::with_capacity(handles.len());
            for handle in handles {
                states.push(self.backend.poll(&handle.job).await?);
            }

            let active = states.iter().filter(|s| s.is_active()).count();
            if active == 0 {
                return Ok(states);
            }
            info!(
                "{} of {} jobs still queued or running, next check in {:?}",
                active,
                handles.len(),
                self.poll_interval
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Reconcile finished jobs and resubmit failed work up to `retries` times.
    ///
    /// Work is failed when tasks finished unsuccessfully or when the job
    /// itself failed or was removed.
    pub async fn ensure_success(&self, handles: Vec<DispatchHandle>, retries: u32) -> Result<EnsureOutcome> {
        let mut outcome = EnsureOutcome::default();
        let mut states = self.wait_for_finish(&handles).await?;
        let mut pending = handles;
        let mut round = 0;

        loop {
            let failed = self.settle(pending, &states, &mut outcome)?;
            if failed.is_empty() {
                outcome.success = true;
                break;
            }

            if round >= retries {
                for (handle, tasks) in failed {
                    let manifest = self.store.write_tasklist(&handle.tasklist.name, &tasks)?;
                    warn!(
                        "Task-list {} still has {} unsuccessful tasks after {} submissions",
                        handle.tasklist.name,
                        tasks.len(),
                        handle.submissions
                    );
                    outcome.residue.push(self.store.load_tasklist(&manifest)?);
                }
                break;
            }
            round += 1;

            let mut resubmitted = Vec::with_capacity(failed.len());
            for (handle, tasks) in failed {
                for task in &tasks {
                    self.store.rearm(task)?;
                }
                let manifest = self.store.write_tasklist(&handle.tasklist.name, &tasks)?;
                let tasklist = self.store.load_tasklist(&manifest)?;
                info!(
                    "Resubmitting task-list {} with {} failed tasks (retry {}/{})",
                    tasklist.name,
                    tasklist.tasks.len(),
                    round,
                    retries
                );
                let job = self.backend.submit(&tasklist).await?;
                outcome.resubmissions += 1;
                resubmitted.push(DispatchHandle {
                    tasklist,
                    job,
                    submissions: handle.submissions + 1,
                });
            }

            states = self.wait_for_finish(&resubmitted).await?;
            pending = resubmitted;
        }

        info!(
            "Ensure success: {} retired, {} restaged, {} settled remotely, {} resubmissions, {} failed task-lists",
            outcome.retired,
            outcome.restaged,
            outcome.missing,
            outcome.resubmissions,
            outcome.residue.len()
        );
        Ok(outcome)
    }

    /// Reconcile one round of finished jobs; returns handles with work to retry.
    ///
    /// A job that failed as a whole keeps its unfinished tasks: whatever
    /// reconcile restaged is taken back into the submitted area so the
    /// task-list is resubmitted instead of counted as settled.
    fn settle(
        &self,
        handles: Vec<DispatchHandle>,
        states: &[JobState],
        outcome: &mut EnsureOutcome,
    ) -> Result<Vec<(DispatchHandle, Vec<PathBuf>)>> {
        let mut failed = Vec::new();

        for (handle, state) in handles.into_iter().zip(states) {
            let report = reconcile(&self.store, &handle.tasklist.tasks)?;
            outcome.retired += report.retired.len();
            outcome.missing += report.missing.len();

            let mut retry = report.failed;
            if state.is_failed() {
                for entry in &report.restaged {
                    retry.push(self.store.move_to_submitted(&entry.name)?);
                }
            } else {
                outcome.restaged += report.restaged.len();
            }

            if !retry.is_empty() {
                warn!(
                    "Job {} for task-list {} ended {} with {} tasks to retry",
                    handle.job,
                    handle.tasklist.name,
                    state,
                    retry.len()
                );
                failed.push((handle, retry));
                continue;
            }
            if state.is_failed() {
                warn!(
                    "Job {} for task-list {} ended {} but none of its tasks are left",
                    handle.job, handle.tasklist.name, state
                );
            }
            self.store.remove_tasklist(&handle.tasklist.manifest)?;
        }
        Ok(failed)
    }
}
