// ============================================
// veeam-server - host.rs
// ============================================
// Everything the workflow needs to know about (or do to) the target host
// goes through the traits in this file:
//
//   HostFacts     - which Windows release are we on?
//   Registry      - read values under a registry key
//   DiscImages    - is an ISO attached? where? mount it, dismount it
//   ProcessRunner - run a program and wait for it (with a timeout)
//   ServiceStates - state and start mode of a Windows service
//
// The real implementations live in windows.rs. Tests swap in the fakes
// from fakes.rs so nothing touches real host state.
//
// HostContext bundles one of each for a single convergence run.
// ============================================

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::installer::InstallError;
use crate::mount::MountError;
use crate::secrets::SecretStore;

// ============================================
// WINDOWS RELEASES
// ============================================

/// Windows Server release, derived from the NT kernel version.
///
/// Variants are declared oldest first so the derived ordering can be used
/// for "X or higher" checks. `Unknown` sits between known releases by its
/// version numbers (see the `Ord` impl).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WindowsRelease {
    /// NT 5.2 (Server 2003 / 2003 R2)
    Server2003,
    /// NT 6.0
    Server2008,
    /// NT 6.1
    Server2008R2,
    /// NT 6.2
    Server2012,
    /// NT 6.3
    Server2012R2,
    /// NT 10.x (Server 2016, 2019, 2022 ...)
    Server2016OrLater,
    /// A Windows kernel version we don't have a name for
    Unknown { major: u32, minor: u32 },
    /// Not a Windows host at all (family name, e.g. "linux")
    NotWindows(String),
}

impl WindowsRelease {
    /// Map an NT kernel version to a release.
    pub fn from_nt_version(major: u32, minor: u32) -> Self {
        match (major, minor) {
            (5, 2) => WindowsRelease::Server2003,
            (6, 0) => WindowsRelease::Server2008,
            (6, 1) => WindowsRelease::Server2008R2,
            (6, 2) => WindowsRelease::Server2012,
            (6, 3) => WindowsRelease::Server2012R2,
            (10, _) => WindowsRelease::Server2016OrLater,
            _ => WindowsRelease::Unknown { major, minor },
        }
    }

    /// Parse a version string like "6.3.9600.0" (what .NET's
    /// `OSVersion.Version.ToString()` prints).
    pub fn parse_nt_version(text: &str) -> Option<Self> {
        let mut parts = text.trim().split('.');
        let major = parts.next()?.trim().parse().ok()?;
        let minor = parts.next()?.trim().parse().ok()?;
        Some(Self::from_nt_version(major, minor))
    }

    /// (major, minor) NT version used for ordering. `None` off Windows.
    fn nt_version(&self) -> Option<(u32, u32)> {
        match self {
            WindowsRelease::Server2003 => Some((5, 2)),
            WindowsRelease::Server2008 => Some((6, 0)),
            WindowsRelease::Server2008R2 => Some((6, 1)),
            WindowsRelease::Server2012 => Some((6, 2)),
            WindowsRelease::Server2012R2 => Some((6, 3)),
            WindowsRelease::Server2016OrLater => Some((10, 0)),
            WindowsRelease::Unknown { major, minor } => Some((*major, *minor)),
            WindowsRelease::NotWindows(_) => None,
        }
    }

    /// True if this host is a Windows release at or above `minimum`.
    /// Non-Windows hosts never satisfy a minimum.
    pub fn is_at_least(&self, minimum: &WindowsRelease) -> bool {
        matches!(
            self.partial_cmp(minimum),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        )
    }
}

impl PartialOrd for WindowsRelease {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.nt_version()?.cmp(&other.nt_version()?))
    }
}

impl fmt::Display for WindowsRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowsRelease::Server2003 => write!(f, "Windows 2003"),
            WindowsRelease::Server2008 => write!(f, "Windows 2008"),
            WindowsRelease::Server2008R2 => write!(f, "Windows 2008R2"),
            WindowsRelease::Server2012 => write!(f, "Windows 2012"),
            WindowsRelease::Server2012R2 => write!(f, "Windows 2012R2"),
            WindowsRelease::Server2016OrLater => write!(f, "Windows 2016 or later"),
            WindowsRelease::Unknown { major, minor } => write!(f, "Windows NT {}.{}", major, minor),
            WindowsRelease::NotWindows(family) => write!(f, "{} (not Windows)", family),
        }
    }
}

// ============================================
// REGISTRY VALUES
// ============================================

/// One value under a registry key, as `reg query` reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryValue {
    /// Value name (e.g. "Release")
    pub name: String,
    /// Registry type (e.g. "REG_DWORD")
    pub kind: String,
    /// Raw data as printed (e.g. "0x5cbf5")
    pub data: String,
}

impl RegistryValue {
    /// Interpret the data as a DWORD. `reg query` prints DWORDs in hex
    /// ("0x5cbf5"), but plain decimal is accepted too.
    pub fn as_dword(&self) -> Option<u32> {
        let data = self.data.trim();
        match data.strip_prefix("0x").or_else(|| data.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => data.parse().ok(),
        }
    }
}

// ============================================
// PROCESSES AND SERVICES
// ============================================

/// What a finished process left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code (-1 when the process was terminated without one)
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run state of a Windows service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    Running,
    Stopped,
    StartPending,
    StopPending,
    Paused,
    Other,
}

/// Start type of a Windows service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StartMode {
    Auto,
    Manual,
    Disabled,
    Other,
}

impl fmt::Display for StartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartMode::Auto => write!(f, "Auto"),
            StartMode::Manual => write!(f, "Manual"),
            StartMode::Disabled => write!(f, "Disabled"),
            StartMode::Other => write!(f, "Other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub start_mode: StartMode,
}

// ============================================
// CAPABILITY TRAITS
// ============================================

/// Facts about the host operating system.
pub trait HostFacts {
    fn os_version(&self) -> WindowsRelease;
}

/// Read-only access to registry-like key/value data.
pub trait Registry {
    /// All values directly under `key`, or `None` if the key is missing
    /// or could not be read.
    fn values(&self, key: &str) -> Option<Vec<RegistryValue>>;
}

/// Disc image (ISO) attach state and mount commands.
pub trait DiscImages {
    /// Does the OS currently report this image as attached?
    fn is_attached(&self, image: &Path) -> Result<bool, MountError>;
    /// Attach the image and return the root of the mounted volume.
    fn mount(&self, image: &Path) -> Result<PathBuf, MountError>;
    /// Root of the volume of an image that is already attached.
    fn volume_root(&self, image: &Path) -> Result<PathBuf, MountError>;
    /// Detach the image.
    fn dismount(&self, image: &Path) -> Result<(), MountError>;
}

/// Runs external programs to completion.
pub trait ProcessRunner {
    /// Run `program` with `args` and wait at most `timeout` for it to exit.
    fn run(&self, program: &Path, args: &[String], timeout: Duration)
        -> Result<ProcessOutput, InstallError>;
}

/// Windows service lookups.
pub trait ServiceStates {
    /// `None` when no service with that name is installed.
    fn query(&self, name: &str) -> Option<ServiceStatus>;
}

// ============================================
// RUN CONTEXT
// ============================================

/// Every host capability one convergence run uses.
///
/// Built once per run and passed by reference into each step. Nothing in
/// here is cached between runs.
pub struct HostContext<'a> {
    pub facts: &'a dyn HostFacts,
    pub registry: &'a dyn Registry,
    pub images: &'a dyn DiscImages,
    pub runner: &'a dyn ProcessRunner,
    pub services: &'a dyn ServiceStates,
    pub secrets: &'a dyn SecretStore,
}

// ============================================
// TESTS
// ============================================
