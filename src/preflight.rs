// ============================================
// veeam-server - preflight.rs
// ============================================
// Precondition checks that must ALL pass before anything is downloaded,
// mounted or installed. Checks run in this order and stop at the first
// failure:
//
//   1. Windows 2008R2 or higher      -> UnsupportedOs
//   2. .NET Framework 4.5.2 or higher -> MissingDotNet
//   3. EULA accepted                  -> EulaNotAccepted
//   4. service user => password       -> IncompleteCredentials
//
// Pure: reads the InstallRequest only. Runs again on every convergence.
// ============================================

use thiserror::Error;
use tracing::{info, warn};

use crate::host::WindowsRelease;
use crate::request::{DotNetRelease, InstallRequest};

/// Oldest Windows release the backup server installs on.
pub const MINIMUM_OS: WindowsRelease = WindowsRelease::Server2008R2;

/// A failed precondition. All of these are fatal and not retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreflightError {
    #[error("Unsupported OS: Veeam Backup and Replication requires a Windows 2008R2 or higher host! (found {found})")]
    UnsupportedOs { found: WindowsRelease },

    #[error("Missing .NET Framework: Veeam Backup and Replication requires that Microsoft .NET Framework 4.5.2 or higher be installed ({})", describe_dotnet(.found))]
    MissingDotNet { found: Option<DotNetRelease> },

    #[error("EULA not accepted: The Veeam Backup and Replication EULA must be accepted. Set server.accept_eula = true")]
    EulaNotAccepted,

    #[error("Incomplete credentials: The VBR service password must be set if a username is supplied (user {user})")]
    IncompleteCredentials { user: String },
}

fn describe_dotnet(found: &Option<DotNetRelease>) -> String {
    match found {
        Some(release) => format!("found {}", release),
        None => "not found".to_string(),
    }
}

/// Outcome of the precondition checks.
pub type ValidationResult = Result<(), PreflightError>;

/// Check every precondition for `request`, stopping at the first failure.
pub fn validate(request: &InstallRequest) -> ValidationResult {
    // OS check must come first: on an unsupported host nothing else matters
    if !request.os_version.is_at_least(&MINIMUM_OS) {
        return Err(PreflightError::UnsupportedOs { found: request.os_version.clone() });
    }

    match request.dotnet_version_found {
        Some(release) if release >= DotNetRelease::MINIMUM => {}
        found => return Err(PreflightError::MissingDotNet { found }),
    }

    if !request.accept_eula {
        return Err(PreflightError::EulaNotAccepted);
    }

    // Only user-without-password is rejected. A password with no user is
    // ignored when the installer arguments are built.
    if let Some(user) = request.service_user.as_deref().filter(|u| !u.is_empty()) {
        let has_password = request
            .service_password
            .as_deref()
            .is_some_and(|p| !p.is_empty());
        if !has_password {
            return Err(PreflightError::IncompleteCredentials { user: user.to_string() });
        }
    } else if request.service_password.is_some() {
        warn!("server.service_password is set without server.service_user; it will be ignored");
    }

    info!("all preconditions satisfied");
    Ok(())
}

// ============================================
// TESTS
// ============================================
