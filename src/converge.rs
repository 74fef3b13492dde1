// ============================================
// veeam-server - converge.rs
// ============================================
// One convergence run, start to finish:
//
//   Start
//     -> Validated          (preflight passed; otherwise Aborted)
//     -> AlreadyInstalled   (backup service exists -> Done, nothing else)
//     -> MediaAcquired      (ISO in cache; otherwise Aborted)
//     -> Mounted
//     -> Installed | InstallFailed (prerequisites, then the server MSI)
//     -> Unmounted
//     -> CleanedUp
//     -> Done
//
// Once the ISO is acquired, unmount and cleanup ALWAYS run (MediaGuard),
// including after a mount or install failure. The first error is what the
// caller gets back; secondary errors from the release steps are logged.
//
// A run holds no state across invocations. Running it again with nothing
// changed on the host ends in the same place.
// ============================================

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::compliance::BACKUP_SERVICE_NAME;
use crate::config::Settings;
use crate::host::HostContext;
use crate::installer::{self, InstallError, InstallOutcome};
use crate::media::{self, AcquisitionError, CleanupError, MediaArtifact};
use crate::mount::{self, MediaGuard, MountError};
use crate::preflight::{self, PreflightError};
use crate::request::InstallRequest;

/// Last run report, written into the cache directory.
pub const REPORT_FILE_NAME: &str = "veeam_server_last_run.json";

// ============================================
// STATES, ERRORS, REPORT
// ============================================

/// Where a run is (or ended).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Start,
    Validated,
    AlreadyInstalled,
    MediaAcquired,
    Mounted,
    Installed,
    InstallFailed,
    Unmounted,
    CleanedUp,
    Done,
    Aborted,
}

/// Anything that stops a run from converging.
#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error(transparent)]
    Preflight(#[from] PreflightError),
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
}

/// What a run did, in order.
#[derive(Debug, Clone, Serialize)]
pub struct ConvergeReport {
    /// States visited, starting with Start
    pub states: Vec<RunState>,
    /// The ISO as it was left (None if never acquired)
    pub media: Option<MediaArtifact>,
    /// Installer result (None if the installer never ran)
    pub outcome: Option<InstallOutcome>,
    /// Error the run ended with, if any
    pub error: Option<String>,
}

impl ConvergeReport {
    fn new() -> Self {
        ConvergeReport {
            states: vec![RunState::Start],
            media: None,
            outcome: None,
            error: None,
        }
    }

    fn enter(&mut self, state: RunState) {
        info!(?state, "convergence state");
        self.states.push(state);
    }

    /// The state the run ended in.
    pub fn final_state(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Start)
    }

    /// Did this run download (or copy) the ISO?
    pub fn media_downloaded(&self) -> bool {
        self.media.as_ref().is_some_and(|m| m.downloaded)
    }

    pub fn visited(&self, state: RunState) -> bool {
        self.states.contains(&state)
    }
}

/// A run that ended with an error, along with what it did.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ConvergeFailure {
    pub report: ConvergeReport,
    #[source]
    pub error: ConvergeError,
}

// ============================================
// CONVERGE
// ============================================

/// Run the install workflow once against the host in `ctx`.
pub fn converge(settings: &Settings, ctx: &HostContext<'_>) -> Result<ConvergeReport, ConvergeFailure> {
    let mut report = ConvergeReport::new();
    let request = InstallRequest::gather(settings, ctx);

    if let Err(e) = preflight::validate(&request) {
        error!(error = %e, "precondition failed");
        return Err(abort(report, e.into()));
    }
    report.enter(RunState::Validated);

    if let Some(status) = ctx.services.query(BACKUP_SERVICE_NAME) {
        info!(service = BACKUP_SERVICE_NAME, state = ?status.state, "Veeam Backup server already installed");
        report.enter(RunState::AlreadyInstalled);
        report.enter(RunState::Done);
        return Ok(report);
    }

    let artifact = match media::acquire(&request) {
        Ok(artifact) => artifact,
        Err(e) => {
            error!(error = %e, retryable = e.is_retryable(), "could not acquire installer media");
            return Err(abort(report, e.into()));
        }
    };
    report.enter(RunState::MediaAcquired);

    // From here on the guard owns the media: every path releases it
    let mut guard = MediaGuard::new(artifact, ctx, &request);
    debug!(path = %guard.artifact().local_path.display(), "installer media guarded");
    let primary = mount_and_install(ctx, &request, &mut guard, &mut report);
    let (artifact, released) = guard.release();
    if released.is_empty() {
        info!("installer media released");
    }

    if released.unmount.is_none() {
        report.enter(RunState::Unmounted);
    }
    if released.cleanup.is_none() {
        report.enter(RunState::CleanedUp);
    }
    report.media = Some(artifact);

    let error = match primary {
        Some(e) => {
            if let Some(secondary) = &released.unmount {
                warn!(error = %secondary, "unmount also failed");
            }
            if let Some(secondary) = &released.cleanup {
                warn!(error = %secondary, "cleanup also failed");
            }
            Some(e)
        }
        None => {
            if let (Some(_), Some(secondary)) = (&released.unmount, &released.cleanup) {
                warn!(error = %secondary, "cleanup also failed");
            }
            released
                .unmount
                .map(ConvergeError::from)
                .or_else(|| released.cleanup.map(ConvergeError::from))
        }
    };

    report.enter(RunState::Done);
    match error {
        Some(error) => {
            error!(error = %error, "convergence finished with an error");
            report.error = Some(error.to_string());
            Err(ConvergeFailure { report, error })
        }
        None => {
            info!("convergence complete");
            Ok(report)
        }
    }
}

/// Mount then install. Returns the error that should end the run, if any.
fn mount_and_install(
    ctx: &HostContext<'_>,
    request: &InstallRequest,
    guard: &mut MediaGuard<'_, '_>,
    report: &mut ConvergeReport,
) -> Option<ConvergeError> {
    let root = match mount::mount(ctx, guard.artifact_mut()) {
        Ok(root) => root,
        Err(e) => {
            error!(error = %e, "could not mount installer media");
            return Some(e.into());
        }
    };
    report.enter(RunState::Mounted);

    let outcome = installer::install_prerequisites(ctx, &root, request).and_then(|outcome| match outcome {
        InstallOutcome::Installed => installer::install(ctx, &root, request),
        failed => Ok(failed),
    });
    match outcome {
        Ok(InstallOutcome::Installed) => {
            report.outcome = Some(InstallOutcome::Installed);
            report.enter(RunState::Installed);
            None
        }
        Ok(InstallOutcome::InstallFailed { exit_code, diagnostics }) => {
            report.outcome = Some(InstallOutcome::InstallFailed {
                exit_code,
                diagnostics: diagnostics.clone(),
            });
            report.enter(RunState::InstallFailed);
            Some(InstallError::InstallFailed { exit_code, diagnostics }.into())
        }
        Err(e) => {
            report.enter(RunState::InstallFailed);
            Some(e.into())
        }
    }
}

fn abort(mut report: ConvergeReport, error: ConvergeError) -> ConvergeFailure {
    report.enter(RunState::Aborted);
    report.error = Some(error.to_string());
    ConvergeFailure { report, error }
}

// ============================================
// REPORT PERSISTENCE
// ============================================

/// Write the report as JSON into `cache_dir`. Returns the file written.
pub fn save_report(report: &ConvergeReport, cache_dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(cache_dir)?;
    let path = cache_dir.join(REPORT_FILE_NAME);
    let json = serde_json::to_string_pretty(report).map_err(io::Error::other)?;
    fs::write(&path, json)?;
    Ok(path)
}

// ============================================
// TESTS
// ============================================
