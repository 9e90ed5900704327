//! Blocklist CLI - Main entry point for CLI binary
//!
//! This binary provides the `blocklist-cli` tool for managing the on-device
//! blocklist.

use anyhow::{bail, Context};
use blocklist_updater::engine::{
    cli::formatter::{format_duration, CliFormatter},
    cli::{Cli, Commands, ConfigAction, DownloaderChoice, OutputFormat},
    config::{UpdaterConfig, CONFIG_FILE},
    updater::{
        CheckOutcome, Confirmation, DownloadOutcome, DownloadReply, StaticPolicy,
        UpdateCoordinator,
    },
};
use chrono::Utc;
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run_cli(cli) {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let data_dir = cli.get_data_dir();
    let json_output = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Status => {
            let coordinator = open(&data_dir, cli.restricted, false)?;
            cmd_status(&coordinator, json_output)?;
        }
        Commands::Check => {
            let coordinator = open(&data_dir, cli.restricted, true)?;
            cmd_check(&coordinator, json_output)?;
        }
        Commands::Download {
            force,
            in_process,
            system,
        } => {
            let coordinator = open(&data_dir, cli.restricted, true)?;
            let choice = match (in_process, system) {
                (true, _) => Some(DownloaderChoice::InProcess),
                (_, true) => Some(DownloaderChoice::System),
                _ => None,
            };
            cmd_download(&coordinator, force, choice, json_output)?;
        }
        Commands::Delete { yes } => {
            let coordinator = open(&data_dir, cli.restricted, true)?;
            cmd_delete(&coordinator, yes, json_output)?;
        }
        Commands::Prefer { downloader } => {
            let coordinator = open(&data_dir, cli.restricted, false)?;
            cmd_prefer(&coordinator, downloader, json_output)?;
        }
        Commands::Config { action } => {
            cmd_config(action, &data_dir, json_output)?;
        }
    }

    Ok(())
}

/// Load config and state. Commands that change the blocklist first repair
/// anything a crash left behind; `recover` takes the shared lock, so it is
/// refused while another process is mid-operation.
fn open(data_dir: &Path, restricted: bool, recover: bool) -> anyhow::Result<UpdateCoordinator> {
    let config = UpdaterConfig::load_or_default(data_dir)
        .with_context(|| format!("loading {}", data_dir.join(CONFIG_FILE).display()))?;
    let policy = Arc::new(StaticPolicy::new(restricted));
    let coordinator = UpdateCoordinator::open(&config, data_dir, policy)
        .with_context(|| format!("opening blocklist state in {}", data_dir.display()))?;
    if recover {
        coordinator.recover()?;
    }
    Ok(coordinator)
}

fn cmd_status(coordinator: &UpdateCoordinator, json: bool) -> anyhow::Result<()> {
    let markers = coordinator.store().markers();
    let state = coordinator.evaluate();
    let last_check = coordinator.store().last_check();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "artifact": coordinator.artifact_name(),
                "state": state,
                "markers": markers,
                "last_check": last_check,
                "prefers_in_process": coordinator.store().prefers_in_process(),
                "policy_restricted": coordinator.is_policy_restricted(),
                "active_operation": coordinator.active_operation(),
            })
        );
        return Ok(());
    }

    CliFormatter::header("Local Blocklist");
    CliFormatter::kv("State", &CliFormatter::state(state).to_string());
    CliFormatter::kv("Installed", &markers.installed.describe());
    CliFormatter::kv("Fetched", &markers.fetched.describe());
    CliFormatter::kv("Newest remote", &markers.known_remote.describe());
    let checked = match last_check {
        Some(at) => {
            let age = Utc::now().signed_duration_since(at).num_seconds().max(0) as u64;
            format!("{} ago", format_duration(age))
        }
        None => "never".to_string(),
    };
    CliFormatter::kv("Last check", &checked);
    if let Some(active) = coordinator.active_operation() {
        CliFormatter::kv(
            "In progress",
            &format!("{} (PID {})", active.description, active.pid),
        );
    }
    CliFormatter::kv(
        "Downloader",
        if coordinator.store().prefers_in_process() {
            "in-app"
        } else {
            "system (on restricted networks)"
        },
    );
    CliFormatter::kv(
        "Location",
        &coordinator
            .artifacts()
            .path(coordinator.artifact_name())
            .display()
            .to_string(),
    );
    Ok(())
}

#[tokio::main]
async fn cmd_check(coordinator: &UpdateCoordinator, json: bool) -> anyhow::Result<()> {
    let outcome = coordinator.check().await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "outcome": outcome, "state": coordinator.evaluate() })
        );
        return Ok(());
    }

    match outcome {
        CheckOutcome::UpdateAvailable { remote } => {
            CliFormatter::info(&format!("A newer blocklist is available: {}", remote.describe()));
            CliFormatter::info("Run `blocklist-cli download` to install it");
        }
        CheckOutcome::UpToDate { .. } => CliFormatter::success("Local blocklist is up to date"),
        CheckOutcome::Failed { reason } => bail!("update check failed: {}", reason),
    }
    Ok(())
}

#[tokio::main]
async fn cmd_download(
    coordinator: &UpdateCoordinator,
    force: bool,
    choice: Option<DownloaderChoice>,
    json: bool,
) -> anyhow::Result<()> {
    let outcome = match coordinator.download(force).await? {
        DownloadReply::Completed(outcome) => outcome,
        DownloadReply::ConfirmationRequired(confirmation) => {
            let choice = match choice {
                Some(choice) => choice,
                None if json => bail!(
                    "network is policy-restricted: pass --in-process or --system to choose a downloader"
                ),
                None => prompt_downloader()?,
            };
            resolve(confirmation, coordinator, choice).await?
        }
    };

    if json {
        println!(
            "{}",
            serde_json::json!({ "outcome": outcome, "state": coordinator.evaluate() })
        );
        return Ok(());
    }

    match outcome {
        DownloadOutcome::Succeeded { version } => {
            CliFormatter::success(&format!("Blocklist {} installed", version.describe()))
        }
        DownloadOutcome::NotStarted => CliFormatter::info("Local blocklist is already current"),
        DownloadOutcome::Failed { reason } => bail!("download failed: {}", reason),
    }
    Ok(())
}

async fn resolve(
    confirmation: Confirmation,
    coordinator: &UpdateCoordinator,
    choice: DownloaderChoice,
) -> anyhow::Result<DownloadOutcome> {
    let outcome = match choice {
        DownloaderChoice::InProcess => confirmation.enable_in_process(coordinator).await?,
        DownloaderChoice::System => confirmation.use_system(coordinator).await?,
    };
    Ok(outcome)
}

/// Asked once per download; anything but "y" falls back to the system downloader
fn prompt_downloader() -> anyhow::Result<DownloaderChoice> {
    CliFormatter::warning("All traffic is routed through the VPN in lockdown mode.");
    CliFormatter::warning("The system downloader may be blocked by it.");
    print!("Enable the in-app downloader and continue? [y/N] ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    if answer.trim().eq_ignore_ascii_case("y") {
        Ok(DownloaderChoice::InProcess)
    } else {
        Ok(DownloaderChoice::System)
    }
}

#[tokio::main]
async fn cmd_delete(coordinator: &UpdateCoordinator, yes: bool, json: bool) -> anyhow::Result<()> {
    if !yes && !json {
        print!("Delete the local blocklist? [y/N] ");
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            CliFormatter::info("Nothing deleted");
            return Ok(());
        }
    }

    coordinator.delete().await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "success": true, "state": coordinator.evaluate() })
        );
    } else {
        CliFormatter::success("Local blocklist deleted");
    }
    Ok(())
}

fn cmd_prefer(
    coordinator: &UpdateCoordinator,
    downloader: DownloaderChoice,
    json: bool,
) -> anyhow::Result<()> {
    let in_process = downloader == DownloaderChoice::InProcess;
    coordinator.store().set_prefers_in_process(in_process)?;

    if json {
        println!("{}", serde_json::json!({ "prefers_in_process": in_process }));
    } else if in_process {
        CliFormatter::success("In-app downloader enabled");
    } else {
        CliFormatter::success("System downloader will be used on restricted networks");
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, data_dir: &Path, json: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { force } => {
            let path = data_dir.join(CONFIG_FILE);
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            UpdaterConfig::default().save(data_dir)?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "success": true, "path": path.display().to_string() })
                );
            } else {
                CliFormatter::success(&format!("Wrote {}", path.display()));
            }
        }
        ConfigAction::Show => {
            let config = UpdaterConfig::load_or_default(data_dir)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
