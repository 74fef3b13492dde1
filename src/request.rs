// ============================================
// veeam-server - request.rs
// ============================================
// InstallRequest: the frozen snapshot one convergence run works from.
//
// It's built ONCE at the start of a run from:
//   - declared settings (veeam-server.toml)
//   - host facts (Windows release)
//   - the registry (.NET Framework release)
//   - the secret store (license, download credentials)
// and never changes afterwards.
// ============================================

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::Settings;
use crate::host::{HostContext, WindowsRelease};
use crate::secrets::{self, Credentials, LicenseMaterial};

/// Registry key holding the installed .NET Framework 4.x release.
pub const DOTNET_REGISTRY_KEY: &str = r"HKLM\SOFTWARE\Microsoft\NET Framework Setup\NDP\v4\Full";

/// Registry value under DOTNET_REGISTRY_KEY with the release number.
pub const DOTNET_RELEASE_VALUE: &str = "Release";

// ============================================
// .NET FRAMEWORK RELEASES
// ============================================

/// Release numbers for the .NET Framework 4.x versions we can name.
/// Lowest release value Microsoft documents for each version.
const DOTNET_RELEASES: &[(u32, &str)] = &[
    (378389, "4.5"),
    (378675, "4.5.1"),
    (379893, "4.5.2"),
    (393295, "4.6"),
    (394254, "4.6.1"),
    (394802, "4.6.2"),
    (460798, "4.7"),
    (461308, "4.7.1"),
    (461808, "4.7.2"),
    (528040, "4.8"),
];

/// The `Release` DWORD of the .NET Framework 4.x registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DotNetRelease(pub u32);

impl DotNetRelease {
    /// .NET Framework 4.5.2
    pub const MINIMUM: DotNetRelease = DotNetRelease(379893);

    /// Highest named version this release satisfies ("4.7.2"), if any.
    pub fn version_name(&self) -> Option<&'static str> {
        DOTNET_RELEASES
            .iter()
            .rev()
            .find(|(release, _)| self.0 >= *release)
            .map(|(_, name)| *name)
    }
}

impl fmt::Display for DotNetRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version_name() {
            Some(name) => write!(f, "{} (release {})", name, self.0),
            None => write!(f, "release {}", self.0),
        }
    }
}

/// Look up the installed .NET Framework release.
///
/// A missing key, a missing `Release` value, or data that isn't a DWORD
/// all come back as `None`.
pub fn detect_dotnet(ctx: &HostContext<'_>) -> Option<DotNetRelease> {
    let values = ctx.registry.values(DOTNET_REGISTRY_KEY)?;
    let release = values
        .iter()
        .find(|v| v.name.eq_ignore_ascii_case(DOTNET_RELEASE_VALUE))?
        .as_dword()?;
    Some(DotNetRelease(release))
}

// ============================================
// INSTALL REQUEST
// ============================================

/// Immutable configuration snapshot for one convergence run.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub accept_eula: bool,
    pub install_dir: Option<PathBuf>,
    pub keep_media: bool,
    pub service_user: Option<String>,
    pub service_password: Option<String>,
    pub license: Option<LicenseMaterial>,
    pub os_version: WindowsRelease,
    pub dotnet_version_found: Option<DotNetRelease>,

    // Media
    pub package_source: String,
    pub package_checksum: Option<String>,
    pub iso_file_name: String,
    pub download_credentials: Option<Credentials>,
    pub download_timeout: Duration,
    pub cache_dir: PathBuf,

    // Installer
    pub msi_name: String,
    pub prerequisites: Vec<String>,
    pub install_timeout: Duration,
    pub service_port: u16,
    pub secure_connections_port: u16,
    pub sql_server: Option<String>,
    pub sql_instance: Option<String>,
    pub sql_database: Option<String>,
    pub check_updates: bool,
}

impl InstallRequest {
    /// Build the snapshot for this run. Queries the host once.
    pub fn gather(settings: &Settings, ctx: &HostContext<'_>) -> Self {
        let os_version = ctx.facts.os_version();
        let dotnet_version_found = detect_dotnet(ctx);
        let bag = settings.secrets.bag.as_str();
        let license = secrets::license(ctx.secrets, bag);
        let download_credentials = secrets::download_credentials(ctx.secrets, bag);

        info!(os = %os_version, "host operating system");
        match &dotnet_version_found {
            Some(release) => info!(dotnet = %release, ".NET Framework detected"),
            None => info!(".NET Framework 4.x not detected"),
        }
        debug!(
            license = license.is_some(),
            download_credentials = download_credentials.is_some(),
            "secret items resolved"
        );

        let server = &settings.server;
        let installer = &settings.installer;

        InstallRequest {
            accept_eula: server.accept_eula,
            install_dir: server.install_dir.clone(),
            keep_media: server.keep_media,
            service_user: server.service_user.clone(),
            service_password: server.service_password.clone(),
            license,
            os_version,
            dotnet_version_found,
            package_source: installer.source(),
            package_checksum: installer.package_checksum.clone(),
            iso_file_name: installer.iso_file_name(),
            download_credentials,
            download_timeout: Duration::from_secs(installer.download_timeout_secs),
            cache_dir: settings.cache_dir(),
            msi_name: installer.msi_name.clone(),
            prerequisites: installer.prerequisites.clone(),
            install_timeout: Duration::from_secs(installer.install_timeout_secs),
            service_port: server.service_port,
            secure_connections_port: server.secure_connections_port,
            sql_server: server.sql_server.clone(),
            sql_instance: server.sql_instance.clone(),
            sql_database: server.sql_database.clone(),
            check_updates: server.check_updates,
        }
    }

    /// Folder the ISO is downloaded into.
    pub fn package_dir(&self) -> PathBuf {
        self.cache_dir.join("package")
    }

    /// Deterministic ISO destination, the same for every run.
    pub fn media_path(&self) -> PathBuf {
        self.package_dir().join(&self.iso_file_name)
    }
}

// ============================================
// TESTS
// ============================================
