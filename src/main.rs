use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use claimr::coordinator::{CompletionReport, Coordinator, ProcessSource, ProgressReporter};
use claimr::daemon::{self, Daemon};
use claimr::domain::WorkStatus;
use claimr::ipc::IpcServer;
use claimr::registry::{StateFile, WorkRegistry, read_keys_file};
use claimr::{ClaimrError, id};

mod cli;
mod config;

use cli::Cli;
use cli::commands::{Commands, JobArgs};
use config::Config;

/// Exit status when the server has nothing left to hand out.
const EXIT_NO_WORK: u8 = 3;

fn setup_logging(log_file: Option<&PathBuf>, level: &str) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if let Some(log_file) = log_file {
        if let Some(dir) = log_file.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).context("Failed to create log directory")?;
        }
        let target = Box::new(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .context("Failed to open log file")?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.init();
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<ExitCode> {
    match &cli.command {
        Commands::Serve {
            keys,
            keys_file,
            bind,
            state_file,
            stale_timeout,
            exit_when_done,
        } => {
            let mut server = config.server.clone();
            if let Some(bind) = bind {
                server.bind = bind.clone();
            }
            if let Some(secs) = stale_timeout {
                server.stale_timeout_secs = Some(*secs);
            }
            if let Some(path) = state_file {
                server.state_file = Some(path.clone());
            }
            handle_serve(keys, keys_file.as_deref(), &server, *exit_when_done).await
        }
        Commands::Claim { job } => handle_claim(cli, job, config).await,
        Commands::Done { key, server } => handle_done(key, server.as_deref(), config).await,
        Commands::Status { server, detailed } => handle_status(server.as_deref(), *detailed, config).await,
        Commands::Run { job, command } => handle_run(cli, job, command, config).await,
    }
}

async fn handle_serve(
    keys: &[String],
    keys_file: Option<&Path>,
    server: &config::ServerConfig,
    exit_when_done: bool,
) -> Result<ExitCode> {
    let mut keys = keys.to_vec();
    if let Some(path) = keys_file {
        keys.extend(read_keys_file(path)?);
    }

    let state_file = server.state_file.as_ref().map(StateFile::new);
    let daemon = Daemon::open(keys, state_file, server.tick()).context("Failed to open registry")?;
    if daemon.registry().is_empty() {
        return Err(eyre!("No work items: pass keys, --keys-file, or an existing --state-file"));
    }

    let ipc = IpcServer::bind(server.ipc()).await.context("Failed to start server")?;
    let shutdown = ipc.shutdown_token();
    let daemon = if exit_when_done {
        daemon.with_finish_signal(shutdown.clone())
    } else {
        daemon
    };

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        }
    });

    println!(
        "{} {} items on {}",
        "Serving:".green(),
        daemon.registry().len(),
        ipc.local_addr()?
    );
    let registry = daemon::serve(daemon, ipc).await.context("Server failed")?;
    print_summary(&registry);
    Ok(ExitCode::SUCCESS)
}

/// Job id, job name and log path for a client command
fn job_identity(cli: &Cli, job: &JobArgs) -> (String, String, String) {
    let job_id = job.job_id.clone().unwrap_or_else(id::resolve_job_id);
    let job_name = job.job_name.clone().unwrap_or_else(|| job_id.clone());
    let log_path = job
        .log_path
        .as_ref()
        .or(cli.log_file.as_ref())
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    (job_id, job_name, log_path)
}

/// Claim a key, mapping "no work" to its own exit status
async fn claim(coordinator: &mut Coordinator, log_path: &str, job_id: &str, job_name: &str) -> Result<Option<String>> {
    match coordinator.get_work_with_retry(log_path, job_id, job_name).await {
        Ok(key) => Ok(Some(key)),
        Err(ClaimrError::NoWorkAvailable) => {
            info!("no work available job_id={}", job_id);
            eprintln!("{}", "No work available".yellow());
            Ok(None)
        }
        Err(e) => Err(e).context(format!("Failed to claim work from {}", coordinator.endpoint())),
    }
}

async fn handle_claim(cli: &Cli, job: &JobArgs, config: &Config) -> Result<ExitCode> {
    let (job_id, job_name, log_path) = job_identity(cli, job);
    let mut coordinator = Coordinator::new(config.client.coordinator(job.server.as_deref()));
    match claim(&mut coordinator, &log_path, &job_id, &job_name).await? {
        Some(key) => {
            println!("{}", key);
            Ok(ExitCode::SUCCESS)
        }
        None => Ok(ExitCode::from(EXIT_NO_WORK)),
    }
}

async fn handle_done(key: &str, server: Option<&str>, config: &Config) -> Result<ExitCode> {
    let mut coordinator = Coordinator::new(config.client.coordinator(server));
    match coordinator.report_done(key).await {
        CompletionReport::Acknowledged => println!("{} {}", "Done:".green(), key),
        CompletionReport::UnknownKey => println!("{} {} is not a known key", "Ignored:".yellow(), key),
        CompletionReport::Unconfirmed(e) => println!("{} {} ({})", "Unconfirmed:".yellow(), key, e),
    }
    Ok(ExitCode::SUCCESS)
}

async fn handle_status(server: Option<&str>, detailed: bool, config: &Config) -> Result<ExitCode> {
    let mut coordinator = Coordinator::new(config.client.coordinator(server));
    let items = coordinator
        .status()
        .await
        .context(format!("Failed to query {}", coordinator.endpoint()))?;

    if detailed {
        for item in &items {
            let status = match item.status() {
                WorkStatus::Pending => item.status().to_string().normal(),
                WorkStatus::Claimed => item.status().to_string().cyan(),
                WorkStatus::Done => item.status().to_string().green(),
            };
            let holder = match (&item.claimed_by, &item.claim_time) {
                (Some(job), Some(at)) => format!("{} since {}", job, at.format("%Y-%m-%d %H:%M:%S")),
                (Some(job), None) => job.clone(),
                _ => String::new(),
            };
            println!("{:<8} {} {}", status, item.key, holder);
        }
    }

    let registry = WorkRegistry::from_items(items)?;
    print_summary(&registry);
    Ok(ExitCode::SUCCESS)
}

async fn handle_run(cli: &Cli, job: &JobArgs, command: &[String], config: &Config) -> Result<ExitCode> {
    let (program, args) = command.split_first().ok_or_else(|| eyre!("No command given"))?;
    let (job_id, job_name, log_path) = job_identity(cli, job);
    let mut coordinator = Coordinator::new(config.client.coordinator(job.server.as_deref()));
    let Some(key) = claim(&mut coordinator, &log_path, &job_id, &job_name).await? else {
        return Ok(ExitCode::from(EXIT_NO_WORK));
    };

    let mut child = tokio::process::Command::new(program)
        .args(args)
        .env("CLAIMR_KEY", &key)
        .env("CLAIMR_JOB_ID", &job_id)
        .env("CLAIMR_JOB_NAME", &job_name)
        .spawn()
        .context(format!("Failed to start {} for key {}", program, key))?;

    let reporter = ProgressReporter::spawn(
        key.clone(),
        Arc::new(ProcessSource::new(child.id())),
        config.client.telemetry_interval(),
    );
    let status = child.wait().await.context("Failed waiting for command")?;
    reporter.stop();

    if status.success() {
        info!("command finished key={}", key);
        coordinator.report_done(&key).await;
        return Ok(ExitCode::SUCCESS);
    }

    warn!("command failed key={} status={}; claim left for the stale sweep", key, status);
    Ok(ExitCode::from(child_exit_code(status.code())))
}

/// Exit status for a failed child. Never 0, and never the no-work status,
/// so a job script can tell "nothing to do" apart from a failed run.
fn child_exit_code(code: Option<i32>) -> u8 {
    match code.and_then(|c| u8::try_from(c).ok()) {
        Some(0) | None => 1,
        Some(EXIT_NO_WORK) => {
            warn!("command exited with {}, reporting 1 to keep it apart from no-work", EXIT_NO_WORK);
            1
        }
        Some(c) => c,
    }
}

fn print_summary(registry: &WorkRegistry) {
    let counts = registry.counts();
    println!(
        "{} {}  {} {}  {} {}  ({} total)",
        "pending".normal(),
        counts.pending,
        "claimed".cyan(),
        counts.claimed,
        "done".green(),
        counts.done,
        counts.total()
    );
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    let level = if cli.is_verbose() {
        "debug"
    } else {
        config.log_level.as_deref().unwrap_or("info")
    };
    setup_logging(cli.log_file.as_ref(), level).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    let result = run_application(&cli, &config).await;
    if let Err(e) = &result {
        // unattended jobs are diagnosed from their log file
        error!("{:?}", e);
    }
    result.context("Application failed")
}
