//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - add: stage a script
//! - execute: batch and dispatch staged work
//! - config: show or change config.yaml
//! - reset: move submitted work back to stage
//! - status: counts per area
//! - run-tasklist: execute one task-list (used by submission scripts)

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// jobctl - A file-system job queue for local and cluster execution
#[derive(Parser, Debug)]
#[command(name = "jobctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Job folder root (default: $JOB_FOLDER or ~/.jobfolder)
    #[arg(long, global = true)]
    pub job_folder: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stage the contents of a script file as a new task
    #[command(visible_alias = "a")]
    Add {
        /// Script whose contents become the task
        script: PathBuf,

        /// Working directory the script runs in
        cwd: PathBuf,

        /// Estimated runtime in seconds
        #[arg(allow_hyphen_values = true)]
        eta: String,
    },

    /// Batch all staged tasks and dispatch them to the configured backend
    #[command(visible_alias = "e")]
    Execute {
        /// Return after submission instead of waiting for the jobs
        #[arg(short, long)]
        detach: bool,
    },

    /// Show the configuration, one key, or set a key
    #[command(visible_alias = "c")]
    Config {
        /// Dotted key path, e.g. ncpus or bwuni.nodes
        key: Option<String>,

        /// New value for the key
        value: Option<String>,
    },

    /// Move submitted work back to stage
    #[command(
        visible_alias = "r",
        after_help = "A plain reset retires succeeded tasks and restages never-started tasks that no \
                      task-list in tasklists/ refers to. Tasks still listed by a task-list (for example \
                      after a driver was killed between batching and running, or a failed task-list left \
                      by execute) stay put. Use `reset hard` once nothing is running any more to restage \
                      them and clear tasklists/."
    )]
    Reset {
        /// `hard` restages every unsuccessful task and clears all task-lists
        #[arg(value_enum)]
        mode: Option<ResetMode>,
    },

    /// Show task counts per area and state
    #[command(visible_alias = "s")]
    Status,

    /// Execute a task-list manifest on this machine
    RunTasklist {
        /// Manifest file under tasklists/
        manifest: PathBuf,

        /// Worker count (default: $SLURM_CPUS_ON_NODE or all CPUs)
        #[arg(long)]
        cpus: Option<usize>,
    },
}

/// Reset strength
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetMode {
    Hard,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_parse_add() {
        let cli = Cli::try_parse_from(["jobctl", "a", "run.sh", "/tmp", "3600"]).unwrap();
        match cli.command {
            Commands::Add { script, cwd, eta } => {
                assert_eq!(script, PathBuf::from("run.sh"));
                assert_eq!(cwd, PathBuf::from("/tmp"));
                assert_eq!(eta, "3600");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_negative_eta_reaches_validation() {
        let cli = Cli::try_parse_from(["jobctl", "add", "run.sh", "/tmp", "-5"]).unwrap();
        assert!(matches!(cli.command, Commands::Add { eta, .. } if eta == "-5"));
    }

    #[test]
    fn test_parse_reset_modes() {
        let cli = Cli::try_parse_from(["jobctl", "r"]).unwrap();
        assert!(matches!(cli.command, Commands::Reset { mode: None }));
        let cli = Cli::try_parse_from(["jobctl", "reset", "hard"]).unwrap();
        assert!(matches!(cli.command, Commands::Reset { mode: Some(ResetMode::Hard) }));
        assert!(Cli::try_parse_from(["jobctl", "reset", "soft"]).is_err());
    }

    #[test]
    fn test_parse_global_options() {
        let cli = Cli::try_parse_from(["jobctl", "e", "--detach", "-v", "--job-folder", "/data/jobs"]).unwrap();
        assert!(cli.is_verbose());
        assert_eq!(cli.job_folder, Some(PathBuf::from("/data/jobs")));
        assert!(matches!(cli.command, Commands::Execute { detach: true }));
    }

    #[test]
    fn test_reset_help_points_to_hard_mode() {
        let cmd = Cli::command();
        let reset = cmd.find_subcommand("reset").unwrap();
        let help = reset.get_after_help().unwrap().to_string();
        assert!(help.contains("reset hard"));
        assert!(help.contains("never-started"));
    }

    #[test]
    fn test_parse_run_tasklist() {
        let cli = Cli::try_parse_from(["jobctl", "run-tasklist", "/jobs/tasklists/x", "--cpus", "8"]).unwrap();
        match cli.command {
            Commands::RunTasklist { manifest, cpus } => {
                assert_eq!(manifest, PathBuf::from("/jobs/tasklists/x"));
                assert_eq!(cpus, Some(8));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_config_forms() {
        let cli = Cli::try_parse_from(["jobctl", "c", "bwuni.nodes", "2"]).unwrap();
        match cli.command {
            Commands::Config { key, value } => {
                assert_eq!(key.as_deref(), Some("bwuni.nodes"));
                assert_eq!(value.as_deref(), Some("2"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
