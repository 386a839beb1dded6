//! Record types persisted in the job folder.
//!
//! A task file is plain text: the eta on the first line, the working
//! directory on the second, and the script body verbatim after that.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{JobControlError, Result};

/// Zero-byte marker files written next to a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Start,
    Finish,
    Success,
}

impl Sentinel {
    pub const ALL: [Sentinel; 3] = [Sentinel::Start, Sentinel::Finish, Sentinel::Success];

    pub fn suffix(&self) -> &'static str {
        match self {
            Sentinel::Start => ".start",
            Sentinel::Finish => ".finish",
            Sentinel::Success => ".success",
        }
    }
}

/// Suffix of the runnable copy of a task's script
pub const RUN_SUFFIX: &str = ".run";

/// Suffix of a task's captured stdout
pub const OUT_SUFFIX: &str = ".out";

/// Suffix of files being written before an atomic rename
pub const TMP_SUFFIX: &str = ".tmp";

/// True for files that live next to task files but are not tasks themselves.
pub fn is_sidecar(file_name: &str) -> bool {
    Sentinel::ALL.iter().any(|s| file_name.ends_with(s.suffix()))
        || file_name.ends_with(RUN_SUFFIX)
        || file_name.ends_with(OUT_SUFFIX)
        || file_name.ends_with(TMP_SUFFIX)
}

/// Path of a file named `{task}{suffix}` next to the task.
pub fn sidecar_path(task: &Path, suffix: &str) -> PathBuf {
    let mut name = task.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Lifecycle state of a submitted task, derived from its sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    /// No sentinel yet
    NeverStarted,
    /// `.start` without `.finish`: still running, or the executor died
    RunningOrCrashed,
    /// `.finish` without `.success`: the script ran and failed
    FinishedFailed,
    /// All three sentinels: pending retirement
    Succeeded,
}

impl TaskState {
    pub fn from_sentinels(started: bool, finished: bool, succeeded: bool) -> Self {
        match (started, finished, succeeded) {
            (_, true, true) => TaskState::Succeeded,
            (_, true, false) => TaskState::FinishedFailed,
            (true, false, _) => TaskState::RunningOrCrashed,
            (false, false, _) => TaskState::NeverStarted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::NeverStarted => "never started",
            TaskState::RunningOrCrashed => "running or crashed",
            TaskState::FinishedFailed => "failed",
            TaskState::Succeeded => "succeeded",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of a task file.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub eta: f64,
    pub working_dir: PathBuf,
    pub script: String,
}

impl TaskRecord {
    pub fn new(eta: f64, working_dir: impl Into<PathBuf>, script: impl Into<String>) -> Self {
        Self {
            eta,
            working_dir: working_dir.into(),
            script: script.into(),
        }
    }

    /// Serialize to the on-disk format.
    pub fn to_file_contents(&self) -> String {
        format!("{}\n{}\n{}", format_eta(self.eta), self.working_dir.display(), self.script)
    }

    /// Parse the on-disk format; `path` is only used for error messages.
    pub fn parse(path: &Path, contents: &str) -> Result<Self> {
        let malformed = |reason: &str| JobControlError::MalformedTask {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let mut parts = contents.splitn(3, '\n');
        let eta_line = parts.next().ok_or_else(|| malformed("empty file"))?;
        let eta: f64 = eta_line
            .trim()
            .parse()
            .map_err(|_| malformed(&format!("eta line is not a number: {:?}", eta_line)))?;
        let cwd_line = parts.next().ok_or_else(|| malformed("missing working directory line"))?;
        let cwd = cwd_line.trim_end_matches('\r');
        if cwd.is_empty() {
            return Err(malformed("empty working directory line"));
        }
        let script = parts.next().unwrap_or_default();

        Ok(Self::new(eta, cwd, script))
    }
}

/// A task file in the stage or submitted area.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEntry {
    /// File name, `{id}_{eta}`
    pub name: String,
    pub path: PathBuf,
    pub eta: f64,
}

/// A batch of submitted tasks recorded in a manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskList {
    pub name: String,
    pub manifest: PathBuf,
    pub tasks: Vec<PathBuf>,
    pub eta: f64,
}

/// Longest plain decimal eta written before switching to exponent form
const MAX_PLAIN_ETA_LEN: usize = 24;

/// Shortest text that parses back to the same eta. Very large or very small
/// values use exponent form so the task file name stays short.
pub fn format_eta(eta: f64) -> String {
    let plain = format!("{}", eta);
    if plain.len() > MAX_PLAIN_ETA_LEN {
        format!("{:e}", eta)
    } else {
        plain
    }
}

/// Parse a textual eta, rejecting negative and non-finite values.
pub fn parse_eta(raw: &str) -> Result<f64> {
    let eta: f64 = raw
        .trim()
        .parse()
        .map_err(|_| JobControlError::InvalidEta(raw.to_string()))?;
    validate_eta(eta)?;
    Ok(eta)
}

pub fn validate_eta(eta: f64) -> Result<()> {
    if eta.is_finite() && eta >= 0.0 {
        Ok(())
    } else {
        Err(JobControlError::InvalidEta(eta.to_string()))
    }
}

/// Split a task file name `{id}_{eta}` into its id and eta.
pub fn parse_task_name(name: &str) -> Option<(&str, f64)> {
    let (id, eta) = name.rsplit_once('_')?;
    let eta: f64 = eta.parse().ok()?;
    if id.is_empty() || validate_eta(eta).is_err() {
        return None;
    }
    Some((id, eta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_sentinels() {
        assert_eq!(TaskState::from_sentinels(false, false, false), TaskState::NeverStarted);
        assert_eq!(TaskState::from_sentinels(true, false, false), TaskState::RunningOrCrashed);
        assert_eq!(TaskState::from_sentinels(true, true, false), TaskState::FinishedFailed);
        assert_eq!(TaskState::from_sentinels(true, true, true), TaskState::Succeeded);
    }

    #[test]
    fn test_state_finish_wins_over_missing_start() {
        // An executor error before `.start` was written still marks `.finish`
        assert_eq!(TaskState::from_sentinels(false, true, false), TaskState::FinishedFailed);
    }

    #[test]
    fn test_record_round_trip_keeps_script_verbatim() {
        let record = TaskRecord::new(12.5, "/data/run 1", "cd here\n\necho 'a b'\n");
        let contents = record.to_file_contents();
        assert!(contents.starts_with("12.5\n/data/run 1\n"));

        let parsed = TaskRecord::parse(Path::new("x"), &contents).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_record_without_script_body() {
        let parsed = TaskRecord::parse(Path::new("x"), "3\n/tmp").unwrap();
        assert_eq!(parsed.eta, 3.0);
        assert_eq!(parsed.working_dir, PathBuf::from("/tmp"));
        assert_eq!(parsed.script, "");
    }

    #[test]
    fn test_record_malformed() {
        assert!(TaskRecord::parse(Path::new("x"), "").is_err());
        assert!(TaskRecord::parse(Path::new("x"), "ten\n/tmp\necho").is_err());
        assert!(TaskRecord::parse(Path::new("x"), "10").is_err());
        assert!(TaskRecord::parse(Path::new("x"), "10\n\necho").is_err());
    }

    #[test]
    fn test_parse_eta() {
        assert_eq!(parse_eta("10").unwrap(), 10.0);
        assert_eq!(parse_eta(" 0.25 ").unwrap(), 0.25);
        assert_eq!(parse_eta("0").unwrap(), 0.0);
        assert!(matches!(parse_eta("-1"), Err(JobControlError::InvalidEta(_))));
        assert!(matches!(parse_eta("soon"), Err(JobControlError::InvalidEta(_))));
        assert!(matches!(parse_eta("inf"), Err(JobControlError::InvalidEta(_))));
        assert!(matches!(parse_eta("NaN"), Err(JobControlError::InvalidEta(_))));
    }

    #[test]
    fn test_parse_task_name() {
        assert_eq!(
            parse_task_name("20261016093012123456-0007a1b2_10"),
            Some(("20261016093012123456-0007a1b2", 10.0))
        );
        assert_eq!(parse_task_name("abc_1.5"), Some(("abc", 1.5)));
        assert_eq!(parse_task_name("abc"), None);
        assert_eq!(parse_task_name("_3"), None);
        assert_eq!(parse_task_name("abc_x"), None);
    }

    #[test]
    fn test_format_eta_parses_back() {
        for eta in [0.0, 1.0, 10.0, 0.1, 1234.5678, 1e-7] {
            assert_eq!(format_eta(eta).parse::<f64>().unwrap(), eta);
        }
    }

    #[test]
    fn test_format_eta_extremes_stay_short() {
        assert_eq!(format_eta(1e300), "1e300");
        assert_eq!(format_eta(1e-300), "1e-300");
        assert_eq!(format_eta(86400.0), "86400");
        assert_eq!(parse_task_name("abc_1e300"), Some(("abc", 1e300)));
        assert_eq!(parse_task_name("abc_2.5e-300"), Some(("abc", 2.5e-300)));
    }

    #[test]
    fn test_sidecars() {
        assert!(is_sidecar("abc_10.start"));
        assert!(is_sidecar("abc_10.finish"));
        assert!(is_sidecar("abc_10.success"));
        assert!(is_sidecar("abc_10.run"));
        assert!(is_sidecar("abc_10.out"));
        assert!(is_sidecar("abc_10.tmp"));
        assert!(!is_sidecar("abc_10"));
        assert!(!is_sidecar("abc_10.5"));

        let task = Path::new("/jobs/submitted/abc_10");
        assert_eq!(
            sidecar_path(task, Sentinel::Finish.suffix()),
            PathBuf::from("/jobs/submitted/abc_10.finish")
        );
    }
}
