//! Job Manager implementation
//!
//! JobManager owns the job folder, its configuration and the task store, and
//! exposes the operations behind each CLI subcommand.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::backend::{Cluster, EnsureOutcome};
use crate::config::{JobConfig, JobFolder};
use crate::error::Result;
use crate::recovery::{ResetReport, reset};
use crate::runner::{ExecutionReport, TaskListExecutor, default_workers};
use crate::scheduler::Batcher;
use crate::store::{TaskEntry, TaskState, TaskStore, parse_eta};

/// Result of `execute`.
#[derive(Debug, Clone)]
pub struct ExecuteSummary {
    pub backend: String,
    pub tasklists: usize,
    pub tasks: usize,
    /// Set unless the run was detached
    pub outcome: Option<EnsureOutcome>,
    /// Tasks waiting in stage after the run (restaged work for a later pass)
    pub staged_after: usize,
}

impl ExecuteSummary {
    pub fn is_success(&self) -> bool {
        self.outcome.as_ref().is_none_or(|o| o.success)
    }
}

/// Counts shown by `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub root: PathBuf,
    pub backend: String,
    pub staged: usize,
    pub never_started: usize,
    pub running_or_crashed: usize,
    pub finished_failed: usize,
    pub succeeded: usize,
    pub tasklists: usize,
}

impl StatusReport {
    pub fn submitted(&self) -> usize {
        self.never_started + self.running_or_crashed + self.finished_failed + self.succeeded
    }
}

/// Entry point for every job folder operation
pub struct JobManager {
    folder: JobFolder,
    config: JobConfig,
    store: TaskStore,
}

impl JobManager {
    /// Open a job folder, creating its areas and default config as needed.
    pub fn open(folder: JobFolder) -> Result<Self> {
        let config = JobConfig::load_or_init(&folder)?;
        Self::with_config(folder, config)
    }

    /// Open a job folder with an explicit configuration.
    pub fn with_config(folder: JobFolder, config: JobConfig) -> Result<Self> {
        config.validate()?;
        let store = TaskStore::open(&folder)?;
        Ok(Self { folder, config, store })
    }

    pub fn folder(&self) -> &JobFolder {
        &self.folder
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Stage the contents of a script file.
    pub fn add(&self, script_path: &Path, working_dir: &Path, eta: &str) -> Result<TaskEntry> {
        let eta = parse_eta(eta)?;
        let script = fs::read_to_string(script_path)?;
        self.add_script(&script, working_dir, eta)
    }

    /// Stage a script given as text.
    pub fn add_script(&self, script: &str, working_dir: &Path, eta: f64) -> Result<TaskEntry> {
        let working_dir = std::path::absolute(working_dir)?;
        let entry = self.store.stage(script, &working_dir, eta)?;
        info!("Added task {} in {}", entry.name, working_dir.display());
        Ok(entry)
    }

    /// Batch all staged work and dispatch it.
    ///
    /// Unless detached, waits for the jobs and retries failed work up to the
    /// configured `retries`. The local backend always runs in the foreground.
    pub async fn execute(&self, detach: bool) -> Result<ExecuteSummary> {
        let cluster = Cluster::from_config(&self.config, &self.folder, self.store.clone())?;
        let backend = cluster.backend().name().to_string();

        let tasklists = Batcher::new(&self.store, self.config.cpu_seconds_ceiling()).batch_staged()?;
        let tasks = tasklists.iter().map(|list| list.tasks.len()).sum();
        let count = tasklists.len();

        let outcome = if tasklists.is_empty() {
            info!("Nothing staged, nothing to execute");
            None
        } else {
            let handles = cluster.run_jobs(tasklists).await?;
            if detach && !cluster.backend().is_local() {
                info!("Detached after submitting {} task-lists", handles.len());
                None
            } else {
                Some(cluster.ensure_success(handles, self.config.retries).await?)
            }
        };

        Ok(ExecuteSummary {
            backend,
            tasklists: count,
            tasks,
            outcome,
            staged_after: self.store.list_staged()?.count(),
        })
    }

    /// Run one task-list manifest on this machine.
    pub async fn run_tasklist(&self, manifest: &Path, cpus: Option<usize>) -> Result<ExecutionReport> {
        let executor = TaskListExecutor::new(self.store.clone(), default_workers(cpus), self.config.capture_output);
        executor.run_tasklist(manifest).await
    }

    pub fn reset(&self, hard: bool) -> Result<ResetReport> {
        reset(&self.store, hard)
    }

    pub fn status(&self) -> Result<StatusReport> {
        let mut report = StatusReport {
            root: self.folder.root().to_path_buf(),
            backend: self.config.slurmmode.clone(),
            staged: self.store.list_staged()?.count(),
            tasklists: self.store.list_tasklists()?.len(),
            ..Default::default()
        };

        for entry in self.store.list_submitted()? {
            let entry = entry?;
            match self.store.state(&entry.path) {
                TaskState::NeverStarted => report.never_started += 1,
                TaskState::RunningOrCrashed => report.running_or_crashed += 1,
                TaskState::FinishedFailed => report.finished_failed += 1,
                TaskState::Succeeded => report.succeeded += 1,
            }
        }
        Ok(report)
    }

    /// The whole configuration, or one dotted key, as YAML text.
    pub fn config_get(&self, key: Option<&str>) -> Result<String> {
        let text = match key {
            None => serde_yaml::to_string(&self.config)?,
            Some(key) => serde_yaml::to_string(&self.config.get_key(key)?)?,
        };
        Ok(text.trim_end().to_string())
    }

    /// Update one dotted key and persist the configuration.
    pub fn config_set(&mut self, key: &str, value: &str) -> Result<()> {
        self.config.set_key(key, value)?;
        self.config.save(&self.folder)?;
        info!("Set {} = {}", key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobControlError;
    use tempfile::TempDir;

    fn create_manager() -> (JobManager, TempDir) {
        let temp = TempDir::new().unwrap();
        let manager = JobManager::open(JobFolder::new(temp.path().join("jobs"))).unwrap();
        (manager, temp)
    }

    #[test]
    fn test_open_writes_default_config() {
        let (manager, temp) = create_manager();
        assert!(temp.path().join("jobs/config.yaml").exists());
        assert_eq!(manager.config(), &JobConfig::default());
    }

    #[test]
    fn test_add_reads_script_file() {
        let (manager, temp) = create_manager();
        let script = temp.path().join("job.sh");
        fs::write(&script, "echo from file\n").unwrap();

        let entry = manager.add(&script, temp.path(), "12.5").unwrap();
        let record = manager.store().read_task(&entry.path).unwrap();
        assert_eq!(record.eta, 12.5);
        assert_eq!(record.script, "echo from file\n");
    }

    #[test]
    fn test_add_rejects_bad_eta_before_reading() {
        let (manager, temp) = create_manager();
        let err = manager.add(&temp.path().join("absent.sh"), temp.path(), "soon").unwrap_err();
        assert!(matches!(err, JobControlError::InvalidEta(_)));
    }

    #[test]
    fn test_add_rejects_missing_working_dir() {
        let (manager, temp) = create_manager();
        let err = manager
            .add_script("true", &temp.path().join("nowhere"), 1.0)
            .unwrap_err();
        assert!(matches!(err, JobControlError::InvalidWorkingDirectory(_)));
    }

    #[test]
    fn test_status_counts_states() {
        let (manager, temp) = create_manager();
        let store = manager.store();
        manager.add_script("true", temp.path(), 1.0).unwrap();
        let a = store.stage("true", temp.path(), 1.0).unwrap();
        let b = store.stage("true", temp.path(), 1.0).unwrap();
        let a = store.move_to_submitted(&a.name).unwrap();
        let b = store.move_to_submitted(&b.name).unwrap();
        store.mark_started(&b).unwrap();
        store.write_tasklist("pending", &[a, b]).unwrap();

        let status = manager.status().unwrap();
        assert_eq!(status.staged, 1);
        assert_eq!(status.never_started, 1);
        assert_eq!(status.running_or_crashed, 1);
        assert_eq!(status.submitted(), 2);
        assert_eq!(status.tasklists, 1);
        assert_eq!(status.backend, "local");
    }

    #[test]
    fn test_config_set_persists() {
        let (mut manager, temp) = create_manager();
        manager.config_set("ncpus", "4").unwrap();
        manager.config_set("heidelberg.partition", "batch").unwrap();
        assert_eq!(manager.config_get(Some("ncpus")).unwrap(), "4");

        let reopened = JobManager::open(JobFolder::new(temp.path().join("jobs"))).unwrap();
        assert_eq!(reopened.config().ncpus, 4);
        assert_eq!(reopened.config().heidelberg.partition, "batch");
    }

    #[test]
    fn test_config_set_rejects_invalid_value() {
        let (mut manager, _temp) = create_manager();
        assert!(manager.config_set("ncpus", "0").is_err());
        assert!(manager.config_set("slurmmode", "pbs").is_err());
        assert_eq!(manager.config().ncpus, 1);
    }

    #[tokio::test]
    async fn test_execute_local_end_to_end() {
        let (manager, temp) = create_manager();
        manager.add_script("echo ok > done.txt\n", temp.path(), 10.0).unwrap();
        manager.add_script("exit 0\n", temp.path(), 10.0).unwrap();

        let summary = manager.execute(false).await.unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.backend, "local");
        assert_eq!(summary.tasks, 2);
        assert_eq!(summary.staged_after, 0);
        assert!(temp.path().join("done.txt").exists());
        assert_eq!(manager.status().unwrap(), StatusReport {
            root: manager.folder().root().to_path_buf(),
            backend: "local".to_string(),
            ..Default::default()
        });
    }

    #[tokio::test]
    async fn test_execute_with_nothing_staged() {
        let (manager, _temp) = create_manager();
        let summary = manager.execute(false).await.unwrap();
        assert_eq!(summary.tasklists, 0);
        assert!(summary.outcome.is_none());
        assert!(summary.is_success());
    }
}
