//! Slurm backend (`sbatch` / `sacct`).

use std::fs;
use std::path::PathBuf;

use log::{debug, info};

use crate::backend::command::{self, QueryPolicy};
use crate::backend::template::{ScriptContext, ScriptRenderer};
use crate::backend::{JobRef, JobState, RemoteSettings};
use crate::config::SlurmConfig;
use crate::error::{JobControlError, Result};
use crate::store::TaskList;

pub const BACKEND: &str = "heidelberg";

const TEMPLATE: &str = r#"#!/bin/bash
#SBATCH --job-name={{name}}
#SBATCH --nodes={{nodes}}
#SBATCH --cpus-per-task={{ncpus}}
#SBATCH --partition={{partition}}
#SBATCH --time={{walltime}}

exec "{{executor}}" --job-folder "{{root}}" run-tasklist "{{manifest}}" --cpus {{ncpus}}
"#;

/// Submits task-lists as Slurm batch jobs.
pub struct SlurmBackend {
    params: SlurmConfig,
    settings: RemoteSettings,
    renderer: ScriptRenderer,
}

impl SlurmBackend {
    pub fn new(params: SlurmConfig, settings: RemoteSettings) -> Self {
        Self {
            params,
            settings,
            renderer: ScriptRenderer::new(),
        }
    }

    fn query_policy(&self) -> QueryPolicy {
        self.settings.query
    }

    /// Render `{tasklists}/{name}.sbatch` for a task-list.
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
        let extra = [("partition", self.params.partition.clone())];
        let script = self.renderer.render(BACKEND, TEMPLATE, &context, &extra)?;
        let path = self.settings.tasklists_dir.join(format!("{}.sbatch", tasklist.name));
        fs::write(&path, script)?;
        Ok(path)
    }

    pub async fn submit(&self, tasklist: &TaskList) -> Result<JobRef> {
        let script = self.write_script(tasklist)?;
        let stdout = command::submit(BACKEND, &self.params.submit_command, &[&script]).await?;
        let id = parse_sbatch(&stdout).ok_or_else(|| {
            JobControlError::scheduler(BACKEND, format!("no job id in sbatch output: {}", stdout.trim()))
        })?;
        info!("Submitted task-list {} as Slurm job {}", tasklist.name, id);
        Ok(JobRef::External(id))
    }

    pub async fn poll(&self, id: &str) -> Result<JobState> {
        let args = ["-j", id, "-n", "-X", "-P", "-o", "State,ExitCode"];
        let state = command::query_with_retry(
            BACKEND,
            &self.params.status_command,
            &args,
            self.query_policy(),
            parse_sacct,
        )
        .await?;
        debug!("Slurm job {} is {}", id, state);
        Ok(state)
    }
}

/// Job id from `Submitted batch job N` or the `--parsable` form `N;cluster`.
pub fn parse_sbatch(stdout: &str) -> Option<String> {
    let last = stdout.lines().map(str::trim).rfind(|line| !line.is_empty())?;
    let token = last.split_whitespace().last()?;
    let id = token.split(';').next()?;
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

/// Classify `sacct -n -X -P -o State,ExitCode` output (`STATE|code:signal`).
///
/// A job that has not reached the accounting database yet prints nothing and
/// counts as queued.
pub fn parse_sacct(stdout: &str) -> Option<JobState> {
    let line = match stdout.lines().map(str::trim).find(|line| !line.is_empty()) {
        Some(line) => line,
        None => return Some(JobState::Queued),
    };
    let (state, exit) = line.split_once('|')?;
    let state = state.split_whitespace().next()?;
    let code = exit.split(':').next().and_then(|c| c.trim().parse::<i32>().ok());

    match state {
        "PENDING" | "REQUEUED" | "RESIZING" | "SUSPENDED" => Some(JobState::Queued),
        "RUNNING" | "COMPLETING" | "CONFIGURING" | "STAGE_OUT" => Some(JobState::Running),
        "COMPLETED" => Some(match code {
            Some(0) => JobState::Succeeded,
            other => JobState::Failed { code: other },
        }),
        "FAILED" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL" | "BOOT_FAIL" | "DEADLINE" | "PREEMPTED" => {
            Some(JobState::Failed { code })
        }
        "CANCELLED" | "REVOKED" => Some(JobState::Removed),
        _ => None,
    }
}
