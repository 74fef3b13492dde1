// ============================================
// veeam-server - main.rs
// ============================================
// This is the entry point of the application.
//
// The program flow is:
// 1. main() starts, sets up logging
// 2. Parse the command line (converge is the default)
// 3. Load settings (veeam-server.toml next to the EXE)
// 4. Build the host context (real Windows host + data bag secrets)
// 5. converge: run the install workflow, save the run report
//    verify:   run the compliance checks
// ============================================

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Our modules
mod compliance;  // Post-install checks (port + service)
mod config;      // Settings file
mod converge;    // The install workflow state machine
mod host;        // Host capability traits
mod installer;   // msiexec invocation
mod media;       // ISO download / copy + cleanup
mod mount;       // ISO mount / unmount + MediaGuard
mod preflight;   // Precondition checks
mod request;     // Per-run snapshot of settings + host facts
mod secrets;     // Data bag items (license, download credentials)
mod windows;     // Real host implementation

#[cfg(test)]
mod fakes;

use host::HostContext;
use secrets::DataBagStore;
use windows::WindowsHost;

#[derive(Parser)]
#[command(name = "veeam-server", version, about = "Install the Veeam Backup & Replication server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the backup server if it isn't installed yet (default)
    Converge,
    /// Check that the backup server is installed and serving
    Verify,
}

// ============================================
// MAIN FUNCTION
// ============================================

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    info!("============================================");
    info!("veeam-server v{}", env!("CARGO_PKG_VERSION"));
    info!("============================================");

    let result = match cli.command.unwrap_or(Commands::Converge) {
        Commands::Converge => run_converge(),
        Commands::Verify => run_verify(),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// RUST_LOG wins; otherwise info and above.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

// ============================================
// COMMANDS
// ============================================

fn run_converge() -> Result<bool> {
    let settings = config::load().context("Failed to load settings")?;
    info!(cache = %settings.cache_dir().display(), "cache directory");

    let host = WindowsHost;
    let secrets = DataBagStore::new(settings.secrets_dir());
    let ctx = HostContext {
        facts: &host,
        registry: &host,
        images: &host,
        runner: &host,
        services: &host,
        secrets: &secrets,
    };

    let (report, succeeded) = match converge::converge(&settings, &ctx) {
        Ok(report) => (report, true),
        Err(failure) => {
            error!("{}", failure);
            (failure.report, false)
        }
    };

    match converge::save_report(&report, &settings.cache_dir()) {
        Ok(path) => info!(path = %path.display(), "run report saved"),
        Err(e) => error!(error = %e, "could not save run report"),
    }
    info!(
        state = ?report.final_state(),
        media_downloaded = report.media_downloaded(),
        installer_ran = report.visited(converge::RunState::Installed) || report.visited(converge::RunState::InstallFailed),
        "finished"
    );
    Ok(succeeded)
}

fn run_verify() -> Result<bool> {
    let report = compliance::verify(
        &WindowsHost,
        compliance::BACKUP_SERVICE_PORT,
        compliance::BACKUP_SERVICE_NAME,
    );
    let json = serde_json::to_string_pretty(&report).context("Failed to serialize compliance report")?;
    println!("{}", json);

    if report.passed() {
        info!(control = %report.control, "all checks passed");
    } else {
        error!(control = %report.control, "compliance checks failed");
    }
    Ok(report.passed())
}
