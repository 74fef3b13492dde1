// ============================================
// veeam-server - installer.rs
// ============================================
// Runs the Backup server MSI from the mounted media, silently.
//
// Command line (properties only added when they apply):
//
//   msiexec.exe /qn /norestart /i "<media>\Backup\Server.x64.msi"
//               /L*v "<cache>\VeeamServerInstall.log"
//               ACCEPTEULA=YES
//               INSTALLDIR=...                   (install_dir set)
//               VBR_LICENSE_FILE=...             (license in data bag)
//               VBR_SERVICE_USER=... VBR_SERVICE_PASSWORD=...
//                                                (BOTH user and password)
//               VBR_SERVICE_PORT=9392
//               VBR_SECURE_CONNECTIONS_PORT=9401
//               VBR_SQLSERVER_SERVER=host[\instance] (sql_server set)
//               VBR_SQLSERVER_DATABASE=...       (sql_database set)
//               VBR_CHECK_UPDATES=0|1
//
// Before the server MSI, the redistributables it needs (SQL CLR types,
// SQL Management Objects) are installed from the media's Redistr folder
// the same way. A redistributable the media doesn't carry is skipped.
//
// Exit code 0 is success. Anything else is a failed install carrying the
// exit code and the tail of the installer's diagnostics. Nothing is
// retried. Logs from an earlier run are deleted first so diagnostics
// always belong to this run.
// ============================================

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::host::HostContext;
use crate::request::InstallRequest;

/// Windows Installer executable.
pub const MSIEXEC: &str = "msiexec.exe";

/// Verbose installer log, written into the cache directory.
pub const INSTALL_LOG_NAME: &str = "VeeamServerInstall.log";

/// Prefix of the per-prerequisite verbose logs in the cache directory.
pub const PREREQUISITE_LOG_PREFIX: &str = "VeeamPrerequisite_";

/// License file handed to the installer, removed right after.
pub const LICENSE_FILE_NAME: &str = "veeam_license.lic";

/// How much diagnostic text a failed install carries.
const DIAGNOSTIC_LIMIT: usize = 2000;

/// How deep to look for the MSI below the media root.
const MSI_SEARCH_DEPTH: usize = 3;

// ============================================
// ERRORS AND OUTCOMES
// ============================================

/// Why the installer could not be run to completion.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{msi_name} not found on installer media at {root}")]
    MsiNotFound { msi_name: String, root: PathBuf },

    #[error("Failed to write license file {path}")]
    LicenseFile { path: PathBuf, source: io::Error },

    #[error("Failed to start {program}")]
    Spawn { program: PathBuf, source: io::Error },

    #[error("{program} did not finish within {seconds} seconds")]
    Timeout { program: PathBuf, seconds: u64 },

    #[error("Veeam Backup server installation failed with exit code {exit_code}: {diagnostics}")]
    InstallFailed { exit_code: i32, diagnostics: String },
}

/// Result of running the installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InstallOutcome {
    Installed,
    InstallFailed { exit_code: i32, diagnostics: String },
}

// ============================================
// ARGUMENTS
// ============================================

/// Build the msiexec argument list.
pub fn build_arguments(
    msi: &Path,
    log: &Path,
    license_file: Option<&Path>,
    request: &InstallRequest,
) -> Vec<String> {
    let mut args = vec![
        "/qn".to_string(),
        "/norestart".to_string(),
        "/i".to_string(),
        msi.display().to_string(),
        "/L*v".to_string(),
        log.display().to_string(),
        "ACCEPTEULA=YES".to_string(),
    ];

    if let Some(dir) = &request.install_dir {
        args.push(format!("INSTALLDIR={}", dir.display()));
    }

    if let Some(path) = license_file {
        args.push(format!("VBR_LICENSE_FILE={}", path.display()));
    }

    let user = request.service_user.as_deref().filter(|u| !u.is_empty());
    let password = request.service_password.as_deref().filter(|p| !p.is_empty());
    if let (Some(user), Some(password)) = (user, password) {
        args.push(format!("VBR_SERVICE_USER={}", user));
        args.push(format!("VBR_SERVICE_PASSWORD={}", password));
    }

    args.push(format!("VBR_SERVICE_PORT={}", request.service_port));
    args.push(format!("VBR_SECURE_CONNECTIONS_PORT={}", request.secure_connections_port));

    if let Some(server) = &request.sql_server {
        let target = match &request.sql_instance {
            Some(instance) => format!("{}\\{}", server, instance),
            None => server.clone(),
        };
        args.push(format!("VBR_SQLSERVER_SERVER={}", target));
    }
    if let Some(database) = &request.sql_database {
        args.push(format!("VBR_SQLSERVER_DATABASE={}", database));
    }

    args.push(format!("VBR_CHECK_UPDATES={}", if request.check_updates { 1 } else { 0 }));
    args
}

/// Arguments safe to log (password values replaced).
pub fn masked_arguments(args: &[String]) -> Vec<String> {
    args.iter()
        .map(|arg| match arg.split_once('=') {
            Some((key, _)) if key.ends_with("PASSWORD") => format!("{}=********", key),
            _ => arg.clone(),
        })
        .collect()
}

// ============================================
// INSTALL
// ============================================

/// Find the server MSI below the mounted media root.
pub fn find_msi(root: &Path, msi_name: &str) -> Result<PathBuf, InstallError> {
    WalkDir::new(root)
        .max_depth(MSI_SEARCH_DEPTH)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| {
            entry.file_type().is_file()
                && entry.file_name().to_string_lossy().eq_ignore_ascii_case(msi_name)
        })
        .map(|entry| entry.into_path())
        .ok_or_else(|| InstallError::MsiNotFound {
            msi_name: msi_name.to_string(),
            root: root.to_path_buf(),
        })
}

/// Run the installer from the mounted media.
///
/// `Ok(InstallOutcome::InstallFailed)` means msiexec ran and returned a
/// non-zero code; `Err` means it couldn't be run to completion at all.
pub fn install(
    ctx: &HostContext<'_>,
    media_root: &Path,
    request: &InstallRequest,
) -> Result<InstallOutcome, InstallError> {
    let msi = find_msi(media_root, &request.msi_name)?;
    let log = request.cache_dir.join(INSTALL_LOG_NAME);
    info!(msi = %msi.display(), "installing Veeam Backup server");

    let license_file = match &request.license {
        Some(license) => {
            let path = request.cache_dir.join(LICENSE_FILE_NAME);
            fs::write(&path, &license.content)
                .map_err(|source| InstallError::LicenseFile { path: path.clone(), source })?;
            debug!(path = %path.display(), "license file written");
            Some(path)
        }
        None => None,
    };

    remove_stale_log(&log);
    let args = build_arguments(&msi, &log, license_file.as_deref(), request);
    info!(args = ?masked_arguments(&args), "running {}", MSIEXEC);

    let result = ctx.runner.run(Path::new(MSIEXEC), &args, request.install_timeout);

    // The license file is only needed while msiexec runs
    if let Some(path) = &license_file {
        if let Err(e) = fs::remove_file(path) {
            error!(path = %path.display(), error = %e, "failed to remove license file");
        }
    }

    let output = result?;
    if !output.stdout.trim().is_empty() {
        debug!(stdout = %output.stdout.trim(), "installer output");
    }
    if output.exit_code == 0 {
        info!("Veeam Backup server installed");
        return Ok(InstallOutcome::Installed);
    }

    let diagnostics = collect_diagnostics(&output.stderr, &log);
    error!(exit_code = output.exit_code, "installer reported failure");
    Ok(InstallOutcome::InstallFailed { exit_code: output.exit_code, diagnostics })
}

/// Install each prerequisite MSI found on the media, in order.
///
/// Stops at the first one that fails and returns its outcome; the server
/// MSI must not run after that.
pub fn install_prerequisites(
    ctx: &HostContext<'_>,
    media_root: &Path,
    request: &InstallRequest,
) -> Result<InstallOutcome, InstallError> {
    for name in &request.prerequisites {
        let msi = match find_msi(media_root, name) {
            Ok(msi) => msi,
            Err(_) => {
                warn!(msi = %name, "prerequisite not on installer media, skipping");
                continue;
            }
        };

        let stem = Path::new(name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        let log = request.cache_dir.join(format!("{}{}.log", PREREQUISITE_LOG_PREFIX, stem));
        remove_stale_log(&log);

        let args = vec![
            "/qn".to_string(),
            "/norestart".to_string(),
            "/i".to_string(),
            msi.display().to_string(),
            "/L*v".to_string(),
            log.display().to_string(),
        ];
        info!(msi = %msi.display(), "installing prerequisite");
        let output = ctx.runner.run(Path::new(MSIEXEC), &args, request.install_timeout)?;

        if output.exit_code != 0 {
            let diagnostics = format!("{}: {}", name, collect_diagnostics(&output.stderr, &log));
            error!(msi = %name, exit_code = output.exit_code, "prerequisite install failed");
            return Ok(InstallOutcome::InstallFailed { exit_code: output.exit_code, diagnostics });
        }
        debug!(msi = %name, "prerequisite installed");
    }
    Ok(InstallOutcome::Installed)
}

/// Delete an installer log left behind by an earlier run.
fn remove_stale_log(log: &Path) {
    match fs::remove_file(log) {
        Ok(()) => debug!(path = %log.display(), "removed stale installer log"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %log.display(), error = %e, "could not remove stale installer log"),
    }
}

/// Tail of stderr, or of the verbose MSI log when stderr is empty.
fn collect_diagnostics(stderr: &str, log: &Path) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return tail(stderr, DIAGNOSTIC_LIMIT);
    }

    // MSI logs are UTF-16 LE with a BOM
    match fs::read(log) {
        Ok(bytes) => tail(decode_log(&bytes).trim(), DIAGNOSTIC_LIMIT),
        Err(_) => String::from("no diagnostic output"),
    }
}

fn decode_log(bytes: &[u8]) -> String {
    if let Some(body) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    String::from_utf8_lossy(bytes).into_owned()
}

/// Last `limit` characters of `text`.
fn tail(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    if count <= limit {
        return text.to_string();
    }
    text.chars().skip(count - limit).collect()
}

// ============================================
// TESTS
// ============================================
