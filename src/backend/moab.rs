//! Moab backend (`msub` / `checkjob` / `showq`).

use std::path::PathBuf;

use log::{debug, info};

use crate::backend::command::{self, QueryPolicy};
use crate::backend::template::{ScriptContext, ScriptRenderer};
use crate::backend::{JobRef, JobState, RemoteSettings};
use crate::config::MoabConfig;
use crate::error::{JobControlError, Result};
use crate::store::TaskList;

pub const BACKEND: &str = "bwuni";

const TEMPLATE: &str = r#"#!/bin/bash
#MSUB -V
#MSUB -N {{name}}
#MSUB -l nodes={{nodes}}:ppn={{ncpus}}
#MSUB -l walltime={{walltime}}

exec "{{executor}}" --job-folder "{{root}}" run-tasklist "{{manifest}}" --cpus {{ncpus}}
"#;

/// Submits task-lists as Moab jobs.
pub struct MoabBackend {
    params: MoabConfig,
    settings: RemoteSettings,
    renderer: ScriptRenderer,
}

impl MoabBackend {
    pub fn new(params: MoabConfig, settings: RemoteSettings) -> Self {
        Self {
            params,
            settings,
            renderer: ScriptRenderer::new(),
        }
    }

    fn query_policy(&self) -> QueryPolicy {
        self.settings.query
    }

    /// Render `{tasklists}/{name}.moab` for a task-list.
    pub fn write_script(&self, tasklist: &TaskList) -> Result<PathBuf> {
        let walltime = match &self.params.walltime {
            Some(walltime) => walltime.clone(),
            None => self.settings.walltime_for(tasklist.eta),
        };
        let context = ScriptContext {
            name: &tasklist.name,
            nodes: self.params.nodes,
            ncpus: self.settings.ncpus,
            walltime: &walltime,
            executor: &self.settings.executor,
            root: &self.settings.root,
            manifest: &tasklist.manifest,
        };
        let script = self.renderer.render(BACKEND, TEMPLATE, &context, &[])?;
        let path = self.settings.tasklists_dir.join(format!("{}.moab", tasklist.name));
        std::fs::write(&path, script)?;
        Ok(path)
    }

    /// Block until `showq` reports fewer jobs than `max_queue_size`.
    pub async fn wait_for_queue_room(&self) -> Result<()> {
        loop {
            let queued = command::query_with_retry(
                BACKEND,
                &self.params.queue_command,
                &[] as &[&str],
                self.query_policy(),
                parse_showq,
            )
            .await?;
            if queued < self.params.max_queue_size {
                return Ok(());
            }
            info!(
                "Queue holds {} jobs (limit {}), waiting {:?}",
                queued, self.params.max_queue_size, self.settings.poll_interval
            );
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    pub async fn submit(&self, tasklist: &TaskList) -> Result<JobRef> {
        self.wait_for_queue_room().await?;
        let script = self.write_script(tasklist)?;
        let stdout = command::submit(BACKEND, &self.params.submit_command, &[&script]).await?;
        let id = parse_msub(&stdout).ok_or_else(|| {
            JobControlError::scheduler(BACKEND, format!("no job id in msub output: {}", stdout.trim()))
        })?;
        info!("Submitted task-list {} as Moab job {}", tasklist.name, id);
        Ok(JobRef::External(id))
    }

    pub async fn poll(&self, id: &str) -> Result<JobState> {
        let state = command::query_with_retry(
            BACKEND,
            &self.params.status_command,
            &[id],
            self.query_policy(),
            parse_checkjob,
        )
        .await?;
        debug!("Moab job {} is {}", id, state);
        Ok(state)
    }
}

/// Job id printed by `msub`: the last non-empty line.
pub fn parse_msub(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(str::to_string)
}

/// Job count from the `Total jobs: N` summary of `showq`.
pub fn parse_showq(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .rev()
        .find(|line| line.contains("Total jobs"))
        .and_then(|line| line.split_whitespace().last())
        .and_then(|n| n.parse().ok())
}

/// Classify `checkjob` output by its `State:` and `Completion Code:` fields.
pub fn parse_checkjob(stdout: &str) -> Option<JobState> {
    let state = field(stdout, "State:")?;
    match state {
        "Completed" => {
            let code = field(stdout, "Completion Code:")?.parse::<i32>().ok()?;
            Some(if code == 0 {
                JobState::Succeeded
            } else {
                JobState::Failed { code: Some(code) }
            })
        }
        "Running" | "Starting" | "Canceling" => Some(JobState::Running),
        "Idle" | "Deferred" | "Hold" | "BatchHold" | "SystemHold" | "UserHold" | "Blocked"
        | "Staging" | "NotQueued" => Some(JobState::Queued),
        "Removed" | "Vacated" => Some(JobState::Removed),
        _ => None,
    }
}

/// First whitespace-delimited word after `label`.
fn field<'a>(stdout: &'a str, label: &str) -> Option<&'a str> {
    stdout.lines().find_map(|line| {
        let (_, rest) = line.split_once(label)?;
        rest.split_whitespace().next()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECKJOB_COMPLETED: &str = "\
job 8410722

AName: 20240101120000000000-0001abcd
State: Completed
Completion Code: 0  Time: Mon Jan  1 13:02:11
Creds:  user:ab123  group:ab  class:singlenode
";

    #[test]
    fn test_checkjob_completed() {
        assert_eq!(parse_checkjob(CHECKJOB_COMPLETED), Some(JobState::Succeeded));
        let failed = CHECKJOB_COMPLETED.replace("Completion Code: 0", "Completion Code: 271");
        assert_eq!(parse_checkjob(&failed), Some(JobState::Failed { code: Some(271) }));
    }

    #[test]
    fn test_checkjob_active_and_removed() {
        assert_eq!(parse_checkjob("State: Running\n"), Some(JobState::Running));
        assert_eq!(parse_checkjob("State: Idle\n"), Some(JobState::Queued));
        assert_eq!(parse_checkjob("State: Removed\n"), Some(JobState::Removed));
    }

    #[test]
    fn test_checkjob_unrecognized_is_transient() {
        assert_eq!(parse_checkjob("ERROR: cannot locate job"), None);
        assert_eq!(parse_checkjob("State: Completed\n"), None);
        assert_eq!(parse_checkjob("State: Mystery\n"), None);
    }

    #[test]
    fn test_showq_total() {
        let out = "active jobs------------------------\n\nTotal jobs:  57\n";
        assert_eq!(parse_showq(out), Some(57));
        assert_eq!(parse_showq("Total jobs 3"), Some(3));
        assert_eq!(parse_showq("nothing here"), None);
    }

    #[test]
    fn test_msub_id() {
        assert_eq!(parse_msub("\n8410722\n\n"), Some("8410722".to_string()));
        assert_eq!(parse_msub("   \n"), None);
    }
}
