//! Job folder layout and job configuration.
//!
//! The job folder root comes from `JOB_FOLDER` (default `~/.jobfolder`) and
//! holds `stage/`, `submitted/`, `tasklists/` and `config.yaml`. The
//! configuration is loaded once at program entry and handed to every
//! component that needs it.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{JobControlError, Result};

/// Environment variable overriding the job folder root
pub const JOB_FOLDER_ENV: &str = "JOB_FOLDER";

const CONFIG_FILE: &str = "config.yaml";

/// Paths of the job folder areas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFolder {
    root: PathBuf,
}

impl JobFolder {
    /// Use the given root directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the root: explicit path, then `$JOB_FOLDER`, then `~/.jobfolder`.
    ///
    /// The result is made absolute so task paths written into manifests stay
    /// valid regardless of the working directory of whoever reads them.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = match explicit {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os(JOB_FOLDER_ENV) {
                Some(value) if !value.is_empty() => PathBuf::from(value),
                _ => dirs::home_dir()
                    .ok_or_else(|| JobControlError::Config("Cannot determine home directory".to_string()))?
                    .join(".jobfolder"),
            },
        };
        Ok(Self::new(std::path::absolute(root)?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stage_dir(&self) -> PathBuf {
        self.root.join("stage")
    }

    pub fn submitted_dir(&self) -> PathBuf {
        self.root.join("submitted")
    }

    pub fn tasklists_dir(&self) -> PathBuf {
        self.root.join("tasklists")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }
}

/// The execution backends a job folder can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Worker pool on this machine
    Local,
    /// Moab cluster (`msub`/`checkjob`/`showq`)
    Bwuni,
    /// Slurm cluster (`sbatch`/`sacct`)
    Heidelberg,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Bwuni => "bwuni",
            BackendKind::Heidelberg => "heidelberg",
        }
    }
}

impl FromStr for BackendKind {
    type Err = JobControlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "bwuni" | "moab" => Ok(BackendKind::Bwuni),
            "heidelberg" | "slurm" => Ok(BackendKind::Heidelberg),
            other => Err(JobControlError::UnknownBackend(other.to_string())),
        }
    }
}

/// Contents of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    /// CPU hours a single task-list may consume per CPU
    pub maxcpuhours: f64,

    /// CPUs a single job may allocate
    pub ncpus: u32,

    /// Backend name: local, bwuni or heidelberg
    pub slurmmode: String,

    /// Extra submissions of a failed task-list before giving up
    pub retries: u32,

    /// Sleep between two status polls of outstanding jobs
    pub poll_interval_ms: u64,

    /// Attempts for a scheduler status query before it is fatal
    pub query_retries: u32,

    /// Sleep between two attempts of a failing status query
    pub query_backoff_ms: u64,

    /// Write script stdout to `{task}.out` instead of discarding it
    pub capture_output: bool,

    /// jobctl binary invoked by submission scripts (default: this executable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<PathBuf>,

    pub bwuni: MoabConfig,

    pub heidelberg: SlurmConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            maxcpuhours: 0.5,
            ncpus: 1,
            slurmmode: "local".to_string(),
            retries: 2,
            poll_interval_ms: 60_000,
            query_retries: 10,
            query_backoff_ms: 5_000,
            capture_output: true,
            executor: None,
            bwuni: MoabConfig::default(),
            heidelberg: SlurmConfig::default(),
        }
    }
}

/// Parameters of the Moab backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MoabConfig {
    pub nodes: u32,
    /// `HH:MM:SS`; derived from each task-list eta when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub walltime: Option<String>,
    /// Do not submit while `showq` reports this many jobs or more
    pub max_queue_size: u32,
    pub submit_command: String,
    pub status_command: String,
    pub queue_command: String,
}

impl Default for MoabConfig {
    fn default() -> Self {
        Self {
            nodes: 1,
            walltime: None,
            max_queue_size: 100,
            submit_command: "msub".to_string(),
            status_command: "checkjob".to_string(),
            queue_command: "showq".to_string(),
        }
    }
}

/// Parameters of the Slurm backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlurmConfig {
    pub nodes: u32,
    pub partition: String,
    /// `HH:MM:SS`; derived from each task-list eta when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub walltime: Option<String>,
    pub submit_command: String,
    pub status_command: String,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            nodes: 1,
            partition: "simulation".to_string(),
            walltime: None,
            submit_command: "sbatch".to_string(),
            status_command: "sacct".to_string(),
        }
    }
}

impl JobConfig {
    /// Load `config.yaml` from the job folder, writing the defaults first if
    /// the file does not exist yet.
    pub fn load_or_init(folder: &JobFolder) -> Result<Self> {
        let path = folder.config_path();
        if !path.exists() {
            fs::create_dir_all(folder.root())?;
            let config = Self::default();
            config.save(folder)?;
            log::info!("Wrote default config to {}", path.display());
            return Ok(config);
        }
        Self::load_from_file(&path)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            log::warn!("Config file {} is empty, using defaults", path.display());
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        log::info!("Loaded config from: {}", path.display());
        Ok(config)
    }

    /// Write the configuration to `config.yaml`.
    pub fn save(&self, folder: &JobFolder) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(folder.config_path(), content)?;
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.ncpus == 0 {
            return Err(JobControlError::Config("ncpus must be > 0".to_string()));
        }
        if !self.maxcpuhours.is_finite() || self.maxcpuhours <= 0.0 {
            return Err(JobControlError::Config("maxcpuhours must be a positive number".to_string()));
        }
        if self.query_retries == 0 {
            return Err(JobControlError::Config("query_retries must be > 0".to_string()));
        }
        self.backend_kind()?;
        Ok(())
    }

    pub fn backend_kind(&self) -> Result<BackendKind> {
        self.slurmmode.parse()
    }

    /// Budget of one task-list in CPU seconds: `ncpus × maxcpuhours × 3600`.
    pub fn cpu_seconds_ceiling(&self) -> f64 {
        f64::from(self.ncpus) * self.maxcpuhours * 3600.0
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn query_backoff(&self) -> Duration {
        Duration::from_millis(self.query_backoff_ms)
    }

    /// Shortest walltime in seconds a job gets when a backend has none configured.
    pub fn default_walltime_secs(&self) -> f64 {
        self.maxcpuhours * 3600.0
    }

    /// Look up a dotted key path such as `bwuni.nodes`.
    pub fn get_key(&self, key_path: &str) -> Result<Value> {
        let doc = serde_yaml::to_value(self)?;
        let mut current = &doc;
        for key in key_path.split('.') {
            current = current
                .as_mapping()
                .and_then(|m| m.get(key))
                .ok_or_else(|| JobControlError::Config(format!("Unknown key: {}", key_path)))?;
        }
        Ok(current.clone())
    }

    /// Set a dotted key path to a raw value.
    ///
    /// The raw value is read as a YAML scalar, so `4` becomes a number and
    /// `true` a boolean. The updated document must still form a valid
    /// configuration, otherwise nothing changes.
    pub fn set_key(&mut self, key_path: &str, raw: &str) -> Result<()> {
        let value: Value = serde_yaml::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        let mut doc = serde_yaml::to_value(&*self)?;

        let keys: Vec<&str> = key_path.split('.').collect();
        let (leaf, parents) = keys
            .split_last()
            .ok_or_else(|| JobControlError::Config("Empty key".to_string()))?;

        let mut current = &mut doc;
        for key in parents {
            current = current
                .as_mapping_mut()
                .and_then(|m| m.get_mut(*key))
                .ok_or_else(|| JobControlError::Config(format!("Unknown key: {}", key_path)))?;
        }
        let mapping: &mut Mapping = current
            .as_mapping_mut()
            .ok_or_else(|| JobControlError::Config(format!("{} is not a section", parents.join("."))))?;
        mapping.insert(Value::String((*leaf).to_string()), value);

        let updated: JobConfig = serde_yaml::from_value(doc)
            .map_err(|e| JobControlError::Config(format!("Cannot set {}: {}", key_path, e)))?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Format seconds as a scheduler walltime `HH:MM:SS`, rounded up to the minute.
pub fn format_walltime(seconds: f64) -> String {
    let minutes = (seconds.max(60.0) / 60.0).ceil() as u64;
    format!("{:02}:{:02}:00", minutes / 60, minutes % 60)
}
