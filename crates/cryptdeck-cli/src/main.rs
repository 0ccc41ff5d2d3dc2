//! cryptdeck command-line interface for inspecting and driving crypttab volumes.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cryptdeck_core::{
    config::{CryptdeckConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH},
    logging, presentation_channel, EventReceiver, NoticeLevel, Presenter, SnapshotSummary,
    Transition, TransitionOutcome, TransitionWorker, VolumeController, VolumeState, VolumeStatus,
};
use cryptdeck_luks::SystemVolumeOps;
use log::{debug, warn};
use rpassword::prompt_password;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "cryptdeck",
    version,
    about = "Unlock, mount, unmount, and eject encrypted volumes listed in crypttab."
)]
struct Cli {
    /// Path to the cryptdeck configuration file.
    #[arg(short, long, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every configured volume with its mount point and state.
    Status,

    /// Unlock (prompting when needed) and mount a volume.
    Mount { volume: String },

    /// Unmount and lock a volume.
    Unmount { volume: String },

    /// Eject the disk backing an unlocked-but-unused volume.
    Disconnect { volume: String },

    /// Mount when unmounted, unmount when mounted.
    Toggle { volume: String },

    /// Validate configuration and report unparseable table lines.
    Check,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    logging::init("info");
    let cli = Cli::parse();
    let config = load_cli_config(&cli.config)?;

    match cli.command {
        Commands::Status => {
            let (controller, _events) = build_controller(&config);
            controller.refresh();
            print_status_table(&controller.overview());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Mount { volume } => run_transition(&config, &volume, Transition::Mount),
        Commands::Unmount { volume } => run_transition(&config, &volume, Transition::Unmount),
        Commands::Disconnect { volume } => {
            run_transition(&config, &volume, Transition::Disconnect)
        }
        Commands::Toggle { volume } => run_transition(&config, &volume, Transition::Toggle),
        Commands::Check => Ok(run_check(&config)),
    }
}

fn load_cli_config(path: &Path) -> Result<CryptdeckConfig> {
    CryptdeckConfig::load_or_default(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn build_controller(
    config: &CryptdeckConfig,
) -> (VolumeController<SystemVolumeOps>, EventReceiver) {
    let (link, events) = presentation_channel();
    let ops = SystemVolumeOps::from_config(config);
    (VolumeController::new(config, ops, link), events)
}

/// Run one transition on the worker thread while this thread answers prompts.
fn run_transition(
    config: &CryptdeckConfig,
    volume: &str,
    transition: Transition,
) -> Result<ExitCode> {
    let (controller, events) = build_controller(config);
    let worker = TransitionWorker::new(Arc::new(controller));
    let ticket = worker
        .submit(volume, transition)
        .with_context(|| format!("unable to start {transition} of `{volume}`"))?;

    let outcome = ticket.serve(&events, &mut TerminalPresenter)?;
    Ok(match outcome {
        TransitionOutcome::Applied | TransitionOutcome::Unchanged => ExitCode::SUCCESS,
        TransitionOutcome::Cancelled => ExitCode::from(2),
        TransitionOutcome::Refused(_) | TransitionOutcome::Failed(_) => ExitCode::FAILURE,
    })
}

fn run_check(config: &CryptdeckConfig) -> ExitCode {
    let issues = config.validate();
    let (controller, _events) = build_controller(config);
    let snapshot = controller.refresh();

    if config.path.exists() {
        println!("Configuration: {}", config.path.display());
    } else {
        println!(
            "Configuration: built-in defaults ({} not found)",
            config.path.display()
        );
    }

    let summary = snapshot.summary();
    println!(
        "Tables: {} volume(s), {} mount entr{}, {} live mount(s)",
        summary.volumes,
        summary.mount_points,
        if summary.mount_points == 1 { "y" } else { "ies" },
        summary.live_mounts
    );

    for issue in &issues {
        println!("[warn] {issue}");
    }
    for skipped in snapshot.skipped() {
        println!(
            "[warn] {} line {}: {}",
            skipped.source, skipped.line, skipped.reason
        );
    }

    if issues.is_empty() && snapshot.skipped().is_empty() {
        println!("[ok] no problems found");
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_status_table(rows: &[VolumeStatus]) {
    println!("{:<20} {:<32} STATE", "VOLUME", "MOUNT POINT");
    for row in rows {
        let mount_point = row
            .mount_point
            .as_deref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<20} {:<32} {}", row.name, mount_point, row.state.label());
    }
}

fn level_tag(level: NoticeLevel) -> &'static str {
    match level {
        NoticeLevel::Warning => "warn",
        NoticeLevel::Error => "error",
    }
}

/// Answers worker interactions on the terminal.
struct TerminalPresenter;

impl Presenter for TerminalPresenter {
    fn passphrase(
        &mut self,
        _volume: &str,
        title: &str,
        prompt: &str,
    ) -> Option<Zeroizing<String>> {
        match prompt_password(format!("{title}\n{prompt}: ")) {
            Ok(secret) => Some(Zeroizing::new(secret)),
            Err(err) => {
                warn!("passphrase prompt failed: {err}");
                None
            }
        }
    }

    fn notice(&mut self, level: NoticeLevel, title: &str, message: &str) {
        eprintln!("[{}] {title}: {message}", level_tag(level));
    }

    fn refreshed(&mut self, summary: SnapshotSummary) {
        debug!(
            "tables refreshed: {} volume(s), {} live mount(s)",
            summary.volumes, summary.live_mounts
        );
    }

    fn transition_complete(
        &mut self,
        volume: &str,
        state: Option<VolumeState>,
        outcome: &TransitionOutcome,
    ) {
        let state = state.map(VolumeState::label).unwrap_or("unknown");
        match outcome {
            TransitionOutcome::Unchanged => println!("{volume}: already {state}"),
            TransitionOutcome::Cancelled => println!("{volume}: cancelled ({state})"),
            _ => println!("{volume}: {state}"),
        }
    }
}
