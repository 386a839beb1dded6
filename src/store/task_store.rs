//! TaskStore implementation over the job folder directories.
//!
//! Ownership follows location: a task in `stage/` belongs to the batcher, a
//! task in `submitted/` to the executor (sentinels and `.run` copy) until it
//! is retired or restaged. Moves between areas are single renames.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::config::JobFolder;
use crate::error::{JobControlError, Result};
use crate::id::generate_id;
use crate::store::records::{
    OUT_SUFFIX, RUN_SUFFIX, Sentinel, TMP_SUFFIX, TaskEntry, TaskList, TaskRecord, TaskState, format_eta,
    is_sidecar, parse_task_name, sidecar_path, validate_eta,
};

/// Filesystem-backed task queue.
#[derive(Debug, Clone)]
pub struct TaskStore {
    stage_dir: PathBuf,
    submitted_dir: PathBuf,
    tasklists_dir: PathBuf,
}

impl TaskStore {
    /// Open the store, creating the area directories if needed.
    pub fn open(folder: &JobFolder) -> Result<Self> {
        let store = Self {
            stage_dir: folder.stage_dir(),
            submitted_dir: folder.submitted_dir(),
            tasklists_dir: folder.tasklists_dir(),
        };
        for dir in [&store.stage_dir, &store.submitted_dir, &store.tasklists_dir] {
            ensure_dir(dir)?;
        }
        Ok(store)
    }

    pub fn stage_dir(&self) -> &Path {
        &self.stage_dir
    }

    pub fn submitted_dir(&self) -> &Path {
        &self.submitted_dir
    }

    pub fn tasklists_dir(&self) -> &Path {
        &self.tasklists_dir
    }

    /// Stage a new task.
    pub fn stage(&self, script: &str, working_dir: &Path, eta: f64) -> Result<TaskEntry> {
        if !working_dir.is_dir() {
            return Err(JobControlError::InvalidWorkingDirectory(working_dir.to_path_buf()));
        }
        validate_eta(eta)?;
        let entry = self.write_staged(&TaskRecord::new(eta, working_dir, script))?;
        debug!("Staged {} (eta {}s)", entry.name, eta);
        Ok(entry)
    }

    /// Write a record into the stage area under a fresh name.
    fn write_staged(&self, record: &TaskRecord) -> Result<TaskEntry> {
        let name = format!("{}_{}", generate_id(), format_eta(record.eta));
        let path = self.stage_dir.join(&name);
        write_atomically(&path, record.to_file_contents().as_bytes())?;
        Ok(TaskEntry {
            name,
            path,
            eta: record.eta,
        })
    }

    /// Staged tasks in directory order. Call again to restart.
    pub fn list_staged(&self) -> Result<TaskEntries> {
        TaskEntries::new(&self.stage_dir)
    }

    /// Submitted tasks in directory order.
    pub fn list_submitted(&self) -> Result<TaskEntries> {
        TaskEntries::new(&self.submitted_dir)
    }

    /// Read and parse a task file.
    pub fn read_task(&self, task: &Path) -> Result<TaskRecord> {
        let contents = read_existing(task)?;
        TaskRecord::parse(task, &contents)
    }

    /// Rename a staged task into the submitted area.
    pub fn move_to_submitted(&self, name: &str) -> Result<PathBuf> {
        let from = self.stage_dir.join(name);
        let to = self.submitted_dir.join(name);
        fs::rename(&from, &to).map_err(|e| not_found_as_task(e, &from))?;
        Ok(to)
    }

    pub fn mark_started(&self, task: &Path) -> Result<()> {
        touch(&sidecar_path(task, Sentinel::Start.suffix()))
    }

    pub fn mark_finished(&self, task: &Path) -> Result<()> {
        touch(&sidecar_path(task, Sentinel::Finish.suffix()))
    }

    pub fn mark_success(&self, task: &Path) -> Result<()> {
        touch(&sidecar_path(task, Sentinel::Success.suffix()))
    }

    pub fn has_sentinel(&self, task: &Path, sentinel: Sentinel) -> bool {
        sidecar_path(task, sentinel.suffix()).exists()
    }

    /// Classify a submitted task by its sentinels.
    pub fn state(&self, task: &Path) -> TaskState {
        TaskState::from_sentinels(
            self.has_sentinel(task, Sentinel::Start),
            self.has_sentinel(task, Sentinel::Finish),
            self.has_sentinel(task, Sentinel::Success),
        )
    }

    pub fn run_path(&self, task: &Path) -> PathBuf {
        sidecar_path(task, RUN_SUFFIX)
    }

    pub fn output_path(&self, task: &Path) -> PathBuf {
        sidecar_path(task, OUT_SUFFIX)
    }

    /// Write the runnable copy `{task}.run` (the script without the header).
    pub fn materialize(&self, task: &Path) -> Result<TaskRecord> {
        let record = self.read_task(task)?;
        fs::write(self.run_path(task), &record.script)?;
        Ok(record)
    }

    /// Delete a finished task together with its sentinels and copies.
    pub fn retire(&self, task: &Path) -> Result<()> {
        if !task.exists() {
            return Err(JobControlError::TaskNotFound(task.display().to_string()));
        }
        if !self.has_sentinel(task, Sentinel::Finish) {
            return Err(JobControlError::TaskNotFinished(task.display().to_string()));
        }
        self.remove_artifacts(task)?;
        debug!("Retired {}", task.display());
        Ok(())
    }

    /// Recreate a submitted task in the stage area and drop the old files.
    pub fn restage(&self, task: &Path) -> Result<TaskEntry> {
        let record = self.read_task(task)?;
        let entry = self.write_staged(&record)?;
        self.remove_artifacts(task)?;
        info!("Restaged {} as {}", task.display(), entry.name);
        Ok(entry)
    }

    /// Clear sentinels and the `.run` copy so the task runs again in place.
    pub fn rearm(&self, task: &Path) -> Result<()> {
        if !task.exists() {
            return Err(JobControlError::TaskNotFound(task.display().to_string()));
        }
        for sentinel in Sentinel::ALL {
            remove_if_exists(&sidecar_path(task, sentinel.suffix()))?;
        }
        remove_if_exists(&self.run_path(task))?;
        Ok(())
    }

    fn remove_artifacts(&self, task: &Path) -> Result<()> {
        for sentinel in Sentinel::ALL {
            remove_if_exists(&sidecar_path(task, sentinel.suffix()))?;
        }
        remove_if_exists(&self.run_path(task))?;
        remove_if_exists(&self.output_path(task))?;
        fs::remove_file(task)?;
        Ok(())
    }

    /// Persist a manifest `tasklists/{name}` listing the given task paths.
    pub fn write_tasklist(&self, name: &str, tasks: &[PathBuf]) -> Result<PathBuf> {
        let path = self.tasklists_dir.join(name);
        let mut contents = String::new();
        for task in tasks {
            contents.push_str(&task.display().to_string());
            contents.push('\n');
        }
        write_atomically(&path, contents.as_bytes())?;
        Ok(path)
    }

    /// Task paths listed in a manifest.
    pub fn read_tasklist(&self, manifest: &Path) -> Result<Vec<PathBuf>> {
        let contents = read_existing(manifest)?;
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Remove only the manifest file.
    pub fn remove_manifest(&self, manifest: &Path) -> Result<()> {
        remove_if_exists(manifest)
    }

    /// Remove a manifest and any submission script rendered next to it.
    pub fn remove_tasklist(&self, manifest: &Path) -> Result<()> {
        remove_if_exists(manifest)?;
        if let Some(name) = manifest.file_name().and_then(|n| n.to_str()) {
            for entry in fs::read_dir(&self.tasklists_dir)? {
                let entry = entry?;
                let file_name = entry.file_name();
                let file_name = file_name.to_string_lossy();
                if file_name.starts_with(&format!("{}.", name)) {
                    remove_if_exists(&entry.path())?;
                }
            }
        }
        Ok(())
    }

    /// Outstanding manifests (files in `tasklists/` without an extension).
    pub fn list_tasklists(&self) -> Result<Vec<PathBuf>> {
        let mut manifests = Vec::new();
        for entry in fs::read_dir(&self.tasklists_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if !entry.file_name().to_string_lossy().contains('.') {
                manifests.push(entry.path());
            }
        }
        manifests.sort();
        Ok(manifests)
    }

    /// Delete everything under `tasklists/`, returning the number of files removed.
    pub fn clear_tasklists(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.tasklists_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
            removed += 1;
        }
        Ok(removed)
    }

    /// Build the in-memory task-list for a manifest.
    pub fn load_tasklist(&self, manifest: &Path) -> Result<TaskList> {
        let tasks = self.read_tasklist(manifest)?;
        let eta = tasks
            .iter()
            .filter_map(|t| t.file_name().and_then(|n| n.to_str()).and_then(parse_task_name))
            .map(|(_, eta)| eta)
            .sum();
        let name = manifest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(TaskList {
            name,
            manifest: manifest.to_path_buf(),
            tasks,
            eta,
        })
    }
}

/// Lazy iterator over the task files of one area.
///
/// Sidecar files are skipped. A task whose name does not carry its eta is
/// read to recover it; if that fails the item is an error rather than being
/// silently dropped.
pub struct TaskEntries {
    inner: fs::ReadDir,
}

impl TaskEntries {
    fn new(dir: &Path) -> Result<Self> {
        Ok(Self {
            inner: fs::read_dir(dir)?,
        })
    }
}

impl Iterator for TaskEntries {
    type Item = Result<TaskEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_sidecar(&name) {
                continue;
            }
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some((_, eta)) = parse_task_name(&name) {
                return Some(Ok(TaskEntry { name, path, eta }));
            }
            warn!("Task file {} does not carry its eta in the name", path.display());
            let recovered = fs::read_to_string(&path)
                .map_err(JobControlError::from)
                .and_then(|contents| TaskRecord::parse(&path, &contents))
                .map(|record| TaskEntry {
                    name,
                    path,
                    eta: record.eta,
                });
            return Some(recovered);
        }
    }
}

/// Create a directory; an already existing one is fine.
fn ensure_dir(dir: &Path) -> Result<()> {
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Create an empty file if it does not exist yet.
fn touch(path: &Path) -> Result<()> {
    OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn read_existing(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| not_found_as_task(e, path))
}

fn not_found_as_task(e: io::Error, path: &Path) -> JobControlError {
    if e.kind() == io::ErrorKind::NotFound {
        JobControlError::TaskNotFound(path.display().to_string())
    } else {
        e.into()
    }
}

/// Write `{path}.tmp` and rename it over `path`.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = sidecar_path(path, TMP_SUFFIX);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_temp_store() -> (TaskStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = TaskStore::open(&JobFolder::new(temp_dir.path())).unwrap();
        (store, temp_dir)
    }

    fn stage_and_submit(store: &TaskStore, work: &Path, script: &str, eta: f64) -> PathBuf {
        let entry = store.stage(script, work, eta).unwrap();
        store.move_to_submitted(&entry.name).unwrap()
    }

    #[test]
    fn test_open_creates_areas() {
        let (store, temp) = create_temp_store();
        assert!(temp.path().join("stage").is_dir());
        assert!(temp.path().join("submitted").is_dir());
        assert!(temp.path().join("tasklists").is_dir());

        // Opening twice is fine
        TaskStore::open(&JobFolder::new(temp.path())).unwrap();
        assert_eq!(store.stage_dir(), temp.path().join("stage"));
    }

    #[test]
    fn test_stage_writes_header_and_script() {
        let (store, temp) = create_temp_store();
        let entry = store.stage("echo hi\n", temp.path(), 10.0).unwrap();

        assert!(entry.name.ends_with("_10"));
        let contents = fs::read_to_string(&entry.path).unwrap();
        assert_eq!(contents, format!("10\n{}\necho hi\n", temp.path().display()));
    }

    #[test]
    fn test_stage_rejects_missing_working_dir() {
        let (store, temp) = create_temp_store();
        let err = store.stage("true", &temp.path().join("missing"), 1.0).unwrap_err();
        assert!(matches!(err, JobControlError::InvalidWorkingDirectory(_)));
        assert_eq!(store.list_staged().unwrap().count(), 0);
    }

    #[test]
    fn test_stage_rejects_negative_eta() {
        let (store, temp) = create_temp_store();
        let err = store.stage("true", temp.path(), -1.0).unwrap_err();
        assert!(matches!(err, JobControlError::InvalidEta(_)));
        let err = store.stage("true", temp.path(), f64::NAN).unwrap_err();
        assert!(matches!(err, JobControlError::InvalidEta(_)));
    }

    #[test]
    fn test_stage_huge_eta_keeps_short_name() {
        let (store, temp) = create_temp_store();
        let entry = store.stage("true", temp.path(), 1e300).unwrap();

        assert!(entry.name.ends_with("_1e300"));
        let listed: Vec<TaskEntry> = store.list_staged().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].eta, 1e300);
        assert_eq!(store.read_task(&entry.path).unwrap().eta, 1e300);
    }

    #[test]
    fn test_stage_list_read_round_trip() {
        let (store, temp) = create_temp_store();
        let script = "#!/bin/bash\nset -e\necho \"$PWD\"\n";
        store.stage(script, temp.path(), 42.5).unwrap();

        let entries: Vec<TaskEntry> = store.list_staged().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].eta, 42.5);

        let record = store.read_task(&entries[0].path).unwrap();
        assert_eq!(record.eta, 42.5);
        assert_eq!(record.working_dir, temp.path());
        assert_eq!(record.script, script);
    }

    #[test]
    fn test_concurrent_stages_never_collide() {
        let (store, temp) = create_temp_store();
        for _ in 0..200 {
            store.stage("true", temp.path(), 1.0).unwrap();
        }
        assert_eq!(store.list_staged().unwrap().count(), 200);
    }

    #[test]
    fn test_listing_skips_sidecars() {
        let (store, temp) = create_temp_store();
        let task = stage_and_submit(&store, temp.path(), "true", 5.0);
        store.mark_started(&task).unwrap();
        store.materialize(&task).unwrap();
        fs::write(store.output_path(&task), "output").unwrap();

        let submitted: Vec<TaskEntry> = store.list_submitted().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].path, task);
    }

    #[test]
    fn test_listing_recovers_eta_from_header() {
        let (store, temp) = create_temp_store();
        let path = store.stage_dir().join("handwritten");
        fs::write(&path, format!("7\n{}\ntrue", temp.path().display())).unwrap();

        let entries: Vec<TaskEntry> = store.list_staged().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].eta, 7.0);
    }

    #[test]
    fn test_listing_reports_malformed_task() {
        let (store, _temp) = create_temp_store();
        fs::write(store.stage_dir().join("garbage"), "not a task").unwrap();

        let results: Vec<Result<TaskEntry>> = store.list_staged().unwrap().collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(JobControlError::MalformedTask { .. })));
    }

    #[test]
    fn test_move_to_submitted() {
        let (store, temp) = create_temp_store();
        let entry = store.stage("true", temp.path(), 3.0).unwrap();
        let submitted = store.move_to_submitted(&entry.name).unwrap();

        assert!(!entry.path.exists());
        assert!(submitted.exists());
        assert_eq!(submitted, store.submitted_dir().join(&entry.name));

        let err = store.move_to_submitted(&entry.name).unwrap_err();
        assert!(matches!(err, JobControlError::TaskNotFound(_)));
    }

    #[test]
    fn test_sentinels_are_idempotent() {
        let (store, temp) = create_temp_store();
        let task = stage_and_submit(&store, temp.path(), "true", 1.0);

        assert_eq!(store.state(&task), TaskState::NeverStarted);
        store.mark_started(&task).unwrap();
        store.mark_started(&task).unwrap();
        assert_eq!(store.state(&task), TaskState::RunningOrCrashed);
        store.mark_finished(&task).unwrap();
        store.mark_finished(&task).unwrap();
        assert_eq!(store.state(&task), TaskState::FinishedFailed);
        store.mark_success(&task).unwrap();
        store.mark_success(&task).unwrap();
        assert_eq!(store.state(&task), TaskState::Succeeded);

        let start = sidecar_path(&task, Sentinel::Start.suffix());
        assert_eq!(fs::metadata(start).unwrap().len(), 0);
    }

    #[test]
    fn test_materialize_strips_header() {
        let (store, temp) = create_temp_store();
        let task = stage_and_submit(&store, temp.path(), "echo one\necho two\n", 1.0);

        let record = store.materialize(&task).unwrap();
        assert_eq!(record.working_dir, temp.path());
        assert_eq!(fs::read_to_string(store.run_path(&task)).unwrap(), "echo one\necho two\n");
    }

    #[test]
    fn test_retire_requires_finish() {
        let (store, temp) = create_temp_store();
        let task = stage_and_submit(&store, temp.path(), "true", 1.0);
        store.mark_started(&task).unwrap();

        let err = store.retire(&task).unwrap_err();
        assert!(matches!(err, JobControlError::TaskNotFinished(_)));
        assert!(task.exists());
    }

    #[test]
    fn test_retire_removes_everything() {
        let (store, temp) = create_temp_store();
        let task = stage_and_submit(&store, temp.path(), "true", 1.0);
        store.mark_started(&task).unwrap();
        store.materialize(&task).unwrap();
        fs::write(store.output_path(&task), "out").unwrap();
        store.mark_finished(&task).unwrap();
        store.mark_success(&task).unwrap();

        store.retire(&task).unwrap();
        let leftovers: Vec<_> = fs::read_dir(store.submitted_dir()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_restage_preserves_fields() {
        let (store, temp) = create_temp_store();
        let script = "echo restage\nexit 0\n";
        let task = stage_and_submit(&store, temp.path(), script, 33.0);
        store.mark_started(&task).unwrap();
        store.materialize(&task).unwrap();

        let entry = store.restage(&task).unwrap();
        assert!(!task.exists());
        assert!(!store.run_path(&task).exists());
        assert!(!store.has_sentinel(&task, Sentinel::Start));
        assert_eq!(entry.eta, 33.0);

        let record = store.read_task(&entry.path).unwrap();
        assert_eq!(record, TaskRecord::new(33.0, temp.path(), script));
    }

    #[test]
    fn test_restage_twice_is_byte_identical_in_fields() {
        let (store, temp) = create_temp_store();
        let task = stage_and_submit(&store, temp.path(), "echo twice", 8.0);

        let first = store.restage(&task).unwrap();
        let first_contents = fs::read_to_string(&first.path).unwrap();
        let resubmitted = store.move_to_submitted(&first.name).unwrap();
        let second = store.restage(&resubmitted).unwrap();
        let second_contents = fs::read_to_string(&second.path).unwrap();

        assert_ne!(first.name, second.name);
        assert_eq!(first_contents, second_contents);
    }

    #[test]
    fn test_rearm_clears_sentinels() {
        let (store, temp) = create_temp_store();
        let task = stage_and_submit(&store, temp.path(), "false", 1.0);
        store.mark_started(&task).unwrap();
        store.materialize(&task).unwrap();
        store.mark_finished(&task).unwrap();

        store.rearm(&task).unwrap();
        assert_eq!(store.state(&task), TaskState::NeverStarted);
        assert!(!store.run_path(&task).exists());
        assert!(task.exists());
    }

    #[test]
    fn test_tasklist_manifest_round_trip() {
        let (store, temp) = create_temp_store();
        let a = stage_and_submit(&store, temp.path(), "true", 4.0);
        let b = stage_and_submit(&store, temp.path(), "true", 6.0);

        let manifest = store.write_tasklist("list-1", &[a.clone(), b.clone()]).unwrap();
        assert_eq!(store.read_tasklist(&manifest).unwrap(), vec![a, b]);
        assert_eq!(store.list_tasklists().unwrap(), vec![manifest.clone()]);

        let loaded = store.load_tasklist(&manifest).unwrap();
        assert_eq!(loaded.name, "list-1");
        assert_eq!(loaded.eta, 10.0);
    }

    #[test]
    fn test_remove_tasklist_removes_script() {
        let (store, _temp) = create_temp_store();
        let manifest = store.write_tasklist("list-2", &[]).unwrap();
        fs::write(store.tasklists_dir().join("list-2.moab"), "#!/bin/bash").unwrap();
        store.write_tasklist("list-20", &[]).unwrap();

        store.remove_tasklist(&manifest).unwrap();
        assert!(!manifest.exists());
        assert!(!store.tasklists_dir().join("list-2.moab").exists());
        assert!(store.tasklists_dir().join("list-20").exists());
    }

    #[test]
    fn test_remove_manifest_keeps_script() {
        let (store, _temp) = create_temp_store();
        let manifest = store.write_tasklist("list-3", &[]).unwrap();
        fs::write(store.tasklists_dir().join("list-3.sbatch"), "#!/bin/bash").unwrap();

        store.remove_manifest(&manifest).unwrap();
        store.remove_manifest(&manifest).unwrap();
        assert!(!manifest.exists());
        assert!(store.tasklists_dir().join("list-3.sbatch").exists());
    }

    #[test]
    fn test_clear_tasklists() {
        let (store, _temp) = create_temp_store();
        store.write_tasklist("a", &[]).unwrap();
        store.write_tasklist("b", &[]).unwrap();
        fs::write(store.tasklists_dir().join("b.sbatch"), "").unwrap();

        assert_eq!(store.clear_tasklists().unwrap(), 3);
        assert!(store.list_tasklists().unwrap().is_empty());
    }
}
