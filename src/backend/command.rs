//! External scheduler commands.
//!
//! Submissions run once; a failed submission is an error. Status queries are
//! retried on transient failure (spawn error, non-zero exit, output that does
//! not parse) and only become fatal after the retry bound.

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use tokio::process::Command;

use crate::error::{JobControlError, Result};

/// Retry bound and backoff for status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl QueryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }
}

/// Captured result of one command run.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run `program args...` and capture its output.
pub async fn run<S: AsRef<OsStr>>(program: &str, args: &[S]) -> std::io::Result<CommandOutput> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a submission command once, returning its stdout.
pub async fn submit<S: AsRef<OsStr>>(backend: &str, program: &str, args: &[S]) -> Result<String> {
    let output = run(program, args)
        .await
        .map_err(|e| JobControlError::scheduler(backend, format!("cannot run {}: {}", program, e)))?;
    if !output.success() {
        return Err(JobControlError::scheduler(
            backend,
            format!("{} exited with {:?}: {}", program, output.code, output.stderr.trim()),
        ));
    }
    Ok(output.stdout)
}

/// Run a status query until `parse` accepts its output.
pub async fn query_with_retry<S, T, F>(
    backend: &str,
    program: &str,
    args: &[S],
    policy: QueryPolicy,
    parse: F,
) -> Result<T>
where
    S: AsRef<OsStr>,
    F: Fn(&str) -> Option<T>,
{
    let mut last_problem = String::new();

    for attempt in 1..=policy.attempts {
        match run(program, args).await {
            Ok(output) if output.success() => match parse(&output.stdout) {
                Some(value) => return Ok(value),
                None => last_problem = format!("unrecognized output: {}", output.stdout.trim()),
            },
            Ok(output) => {
                last_problem = format!("exited with {:?}: {}", output.code, output.stderr.trim());
            }
            Err(e) => last_problem = format!("cannot run: {}", e),
        }

        if attempt < policy.attempts {
            warn!(
                "{} query attempt {}/{} failed ({}), retrying in {:?}",
                program, attempt, policy.attempts, last_problem, policy.backoff
            );
            tokio::time::sleep(policy.backoff).await;
        }
    }

    debug!("{} query gave up: {}", program, last_problem);
    Err(JobControlError::scheduler(
        backend,
        format!("{} failed after {} attempts: {}", program, policy.attempts, last_problem),
    ))
}
