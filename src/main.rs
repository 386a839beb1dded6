use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

mod cli;

use cli::Cli;
use cli::commands::{Commands, ResetMode};
use jobctl::config::JobFolder;
use jobctl::manager::JobManager;

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jobctl")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("jobctl.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn run_application(cli: &Cli) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    let folder = JobFolder::resolve(cli.job_folder.as_deref()).context("Failed to resolve job folder")?;
    let mut manager = JobManager::open(folder).context("Failed to open job folder")?;

    match &cli.command {
        Commands::Add { script, cwd, eta } => handle_add_command(&manager, script, cwd, eta),
        Commands::Execute { detach } => handle_execute_command(&manager, *detach).await,
        Commands::Config { key, value } => handle_config_command(&mut manager, key.as_deref(), value.as_deref()),
        Commands::Reset { mode } => handle_reset_command(&manager, *mode),
        Commands::Status => handle_status_command(&manager),
        Commands::RunTasklist { manifest, cpus } => handle_run_tasklist_command(&manager, manifest, *cpus).await,
    }
}

fn handle_add_command(manager: &JobManager, script: &Path, cwd: &Path, eta: &str) -> Result<()> {
    let entry = manager
        .add(script, cwd, eta)
        .with_context(|| format!("Failed to add {}", script.display()))?;
    println!("{} {}", "Staged:".green(), entry.name);
    Ok(())
}

async fn handle_execute_command(manager: &JobManager, detach: bool) -> Result<()> {
    let summary = manager.execute(detach).await.context("Failed to execute staged tasks")?;

    if summary.tasklists == 0 {
        println!("{}", "Nothing staged.".yellow());
        return Ok(());
    }
    println!(
        "{} {} tasks in {} task-lists on {}",
        "Submitted:".cyan(),
        summary.tasks,
        summary.tasklists,
        summary.backend
    );

    match &summary.outcome {
        None => println!("{}", "Detached; run `jobctl reset` to recover unfinished work later.".yellow()),
        Some(outcome) if outcome.success => {
            println!("{} all task-lists completed", "Success:".green());
        }
        Some(outcome) => {
            println!(
                "{} {} tasks in {} task-lists still fail after {} retries",
                "Failed:".red(),
                outcome.failed_tasks(),
                outcome.residue.len(),
                manager.config().retries
            );
            for list in &outcome.residue {
                println!("  {}", list.manifest.display());
            }
        }
    }
    if summary.staged_after > 0 {
        println!(
            "{} {} tasks are staged again for a later run",
            "Restaged:".yellow(),
            summary.staged_after
        );
    }

    if !summary.is_success() {
        bail!("Some tasks failed permanently");
    }
    Ok(())
}

fn handle_config_command(manager: &mut JobManager, key: Option<&str>, value: Option<&str>) -> Result<()> {
    match (key, value) {
        (Some(key), Some(value)) => {
            manager
                .config_set(key, value)
                .with_context(|| format!("Failed to set {}", key))?;
            println!("{} {} = {}", "Updated:".green(), key, value);
        }
        (key, _) => {
            if key.is_none() {
                println!("{} {}", "Job folder:".cyan(), manager.folder().root().display());
            }
            println!("{}", manager.config_get(key)?);
        }
    }
    Ok(())
}

fn handle_reset_command(manager: &JobManager, mode: Option<ResetMode>) -> Result<()> {
    let hard = mode == Some(ResetMode::Hard);
    let report = manager.reset(hard).context("Failed to reset job folder")?;
    println!(
        "{} retired {}, restaged {}, removed {} task-list files",
        "Reset:".green(),
        report.retired,
        report.restaged,
        report.tasklists_removed
    );
    Ok(())
}

fn handle_status_command(manager: &JobManager) -> Result<()> {
    let status = manager.status().context("Failed to read job folder")?;
    println!("{} {} ({})", "Job folder:".cyan(), status.root.display(), status.backend);
    println!("  staged:     {}", status.staged);
    println!("  submitted:  {}", status.submitted());
    println!("    never started:      {}", status.never_started);
    println!("    running or crashed: {}", status.running_or_crashed);
    println!("    finished, failed:   {}", status.finished_failed.to_string().red());
    println!("    succeeded:          {}", status.succeeded.to_string().green());
    println!("  task-lists: {}", status.tasklists);
    Ok(())
}

async fn handle_run_tasklist_command(manager: &JobManager, manifest: &Path, cpus: Option<usize>) -> Result<()> {
    let report = manager
        .run_tasklist(manifest, cpus)
        .await
        .with_context(|| format!("Failed to run task-list {}", manifest.display()))?;

    println!(
        "{} {}: {} succeeded, {} failed, {} restaged",
        "Task-list".cyan(),
        report.tasklist,
        report.reconcile.retired.len(),
        report.reconcile.failed.len(),
        report.reconcile.restaged.len()
    );
    if !report.is_success() {
        bail!("{} tasks failed", report.reconcile.failed.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // A read-only home must not stop a cluster node from running its task-list
    if let Err(e) = setup_logging() {
        eprintln!("{} {:#}", "Logging disabled:".yellow(), e);
    }

    // Parse CLI arguments
    let cli = Cli::parse();

    info!("Starting with job folder override: {:?}", cli.job_folder);

    // Run the main application logic
    run_application(&cli).await.context("Application failed")?;

    Ok(())
}
