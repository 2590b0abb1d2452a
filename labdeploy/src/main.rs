//! labdeploy - Entry Point
//!
//! Packages rendered network lab configuration and starts the labs on remote
//! emulation hosts over SSH.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

use labdeploy::app::options::AppOptions;
use labdeploy::app::run::{package, run};
use labdeploy::config::settings::{Settings, SETTINGS_FILE};
use labdeploy::filesys::file::File;
use labdeploy::logs::{init_logging, LogLevel, LogOptions};
use labdeploy::models::result::{DeploymentReport, DeploymentResult};
use labdeploy::utils::version_info;

#[derive(Debug, Parser)]
#[command(name = "labdeploy", about = "Deploy rendered network labs to remote hosts")]
struct Cli {
    /// Settings file
    #[arg(long, short, default_value = SETTINGS_FILE)]
    config: PathBuf,

    /// Comma separated host ids, defaults to every configured host
    #[arg(long, value_delimiter = ',')]
    hosts: Vec<String>,

    /// Hosts deployed at the same time
    #[arg(long)]
    parallelism: Option<usize>,

    /// Debug logging, including raw remote output
    #[arg(long)]
    debug: bool,

    /// JSON formatted logs
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Package, upload and start the labs (default)
    Deploy,

    /// Only write the archives
    Package,

    /// List configured hosts
    Hosts,

    /// Print version information as JSON
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match try_main(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn try_main(cli: Cli) -> anyhow::Result<ExitCode> {
    let options = AppOptions {
        hosts: cli.hosts.clone(),
        parallelism: cli.parallelism,
        ..Default::default()
    };

    match cli.command.unwrap_or(Command::Deploy) {
        Command::Version => {
            println!("{}", serde_json::to_string_pretty(&version_info())?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Hosts => {
            let settings = load_settings(&cli).await?;
            print_hosts(&settings);
            Ok(ExitCode::SUCCESS)
        }
        Command::Package => {
            let settings = load_settings(&cli).await?;
            let _log_guard = setup_logging(&cli, &settings)?;
            let mut failed = false;
            for (host, result) in package(&settings, &options).await {
                match result {
                    Ok(archive) => println!(
                        "{:<20} {} {} ({} files, sha256 {})",
                        host,
                        "packaged".cyan(),
                        archive.path.display(),
                        archive.file_count,
                        archive.sha256
                    ),
                    Err(e) => {
                        failed = true;
                        println!("{:<20} {} {}", host, "failed".red(), e);
                    }
                }
            }
            Ok(exit_code(failed))
        }
        Command::Deploy => {
            let settings = load_settings(&cli).await?;
            let _log_guard = setup_logging(&cli, &settings)?;
            info!("Running labdeploy {}", version_info().version);
            let report = run(Arc::new(settings), options, await_shutdown_signal())
                .await
                .context("Deployment did not run")?;
            print_report(&report);
            Ok(exit_code(report.has_failures()))
        }
    }
}

async fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    Settings::load(&File::new(&cli.config))
        .await
        .with_context(|| format!("Unable to read settings file {}", cli.config.display()))
}

fn setup_logging(cli: &Cli, settings: &Settings) -> anyhow::Result<Option<WorkerGuard>> {
    let log_options = LogOptions {
        log_level: if cli.debug {
            LogLevel::Debug
        } else {
            settings.log_level.clone()
        },
        log_dir: settings.log_dir.clone(),
        json_format: cli.json_logs || settings.json_logs,
        ..Default::default()
    };
    init_logging(log_options).context("Failed to initialize logging")
}

fn exit_code(failed: bool) -> ExitCode {
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn print_hosts(settings: &Settings) {
    for (id, record) in &settings.hosts {
        println!(
            "{:<20} {:<12} {}",
            id,
            record.platform.as_deref().unwrap_or("-"),
            record.host.as_deref().unwrap_or("-")
        );
    }
}

fn print_report(report: &DeploymentReport) {
    println!();
    println!("{} {}", "Deployment".bold(), report.run_id);
    for entry in &report.entries {
        let status = match &entry.result {
            DeploymentResult::Succeeded => "ok".green(),
            DeploymentResult::Packaged { .. } => "packaged".cyan(),
            DeploymentResult::Failed { .. } => "failed".red(),
            _ => "skipped".yellow(),
        };
        println!("  {:<20} {:<9} {}", entry.host, status, entry.result);
    }
    let elapsed = report.finished_at - report.started_at;
    println!(
        "{} host(s) in {:.1}s",
        report.len(),
        elapsed.num_milliseconds() as f64 / 1000.0
    );
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Unable to install signal handlers, only Ctrl+C stops the run");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down...");
        }
    }
}
