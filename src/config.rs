// ============================================
// veeam-server - config.rs
// ============================================
// Loads the declared configuration for a run.
//
// PORTABLE DESIGN:
// The config file, download cache and data bags live NEXT TO the EXE
// unless the config says otherwise:
//
//   C:\veeam\
//   ├── veeam-server.exe
//   ├── veeam-server.toml       # settings (optional, all keys default)
//   ├── cache\
//   │   └── package\            # downloaded ISO lands here
//   └── data_bags\
//       └── veeam\              # license.json, download.json
//
// Set VEEAM_SERVER_CONFIG to point at a different settings file.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

/// Settings file name looked up next to the EXE.
pub const CONFIG_FILE_NAME: &str = "veeam-server.toml";

/// Environment variable that overrides the settings file location.
pub const CONFIG_ENV_VAR: &str = "VEEAM_SERVER_CONFIG";

/// Where the vendor publishes installer ISOs.
const DEFAULT_DOWNLOAD_BASE: &str = "http://download2.veeam.com";

// ============================================
// SETTINGS
// ============================================

/// Everything declared for a run. Every key has a default, so an empty
/// (or missing) file is a valid configuration that fails preflight on the
/// EULA check.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub server: ServerSettings,
    pub installer: InstallerSettings,
    pub cache: CacheSettings,
    pub secrets: SecretSettings,
}

/// `[server]` - how the backup server is installed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    /// Must be explicitly true before anything is installed
    pub accept_eula: bool,
    /// Install location (vendor default when unset)
    pub install_dir: Option<PathBuf>,
    /// Keep the downloaded ISO after installation
    pub keep_media: bool,
    /// Account the backup service runs as (LocalSystem when unset)
    pub service_user: Option<String>,
    pub service_password: Option<String>,
    /// Port the backup service listens on
    pub service_port: u16,
    pub secure_connections_port: u16,
    /// SQL Server host for the configuration database
    pub sql_server: Option<String>,
    /// SQL Server named instance (e.g. "VEEAMSQL2012")
    pub sql_instance: Option<String>,
    pub sql_database: Option<String>,
    /// Let the product check for updates on its own
    pub check_updates: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            accept_eula: false,
            install_dir: None,
            keep_media: false,
            service_user: None,
            service_password: None,
            service_port: 9392,
            secure_connections_port: 9401,
            sql_server: None,
            sql_instance: None,
            sql_database: None,
            check_updates: false,
        }
    }
}

/// `[installer]` - which package to fetch and how long to wait for it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallerSettings {
    pub package_name: String,
    pub version: String,
    /// URL, file:// URL, or local/UNC path. Derived from name and version
    /// when unset.
    pub package_url: Option<String>,
    /// Expected SHA-256 of the ISO (hex)
    pub package_checksum: Option<String>,
    /// Server MSI on the installation media
    pub msi_name: String,
    /// Redistributable MSIs installed before the server, in order
    pub prerequisites: Vec<String>,
    pub download_timeout_secs: u64,
    pub install_timeout_secs: u64,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        InstallerSettings {
            package_name: "VeeamBackup&Replication".to_string(),
            version: "9.0.0.902".to_string(),
            package_url: None,
            package_checksum: None,
            msi_name: "Server.x64.msi".to_string(),
            prerequisites: vec![
                "SQLSysClrTypes.msi".to_string(),
                "SharedManagementObjects.msi".to_string(),
            ],
            download_timeout_secs: 1800,
            install_timeout_secs: 3600,
        }
    }
}

impl InstallerSettings {
    /// File name of the ISO, e.g. "VeeamBackup&Replication_9.0.0.902.iso".
    pub fn iso_file_name(&self) -> String {
        format!("{}_{}.iso", self.package_name, self.version)
    }

    /// Where to fetch the ISO from.
    pub fn source(&self) -> String {
        match &self.package_url {
            Some(url) => url.clone(),
            None => format!("{}/{}", DEFAULT_DOWNLOAD_BASE, self.iso_file_name()),
        }
    }
}

/// `[cache]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    /// Cache root (default: cache/ next to the EXE)
    pub path: Option<PathBuf>,
}

/// `[secrets]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecretSettings {
    /// Data bag root (default: data_bags/ next to the EXE)
    pub path: Option<PathBuf>,
    /// Bag holding this product's items
    pub bag: String,
}

impl Default for SecretSettings {
    fn default() -> Self {
        SecretSettings { path: None, bag: "veeam".to_string() }
    }
}

impl Settings {
    /// Parse settings from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid settings file")
    }

    /// Cache root for this run.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .path
            .clone()
            .unwrap_or_else(|| get_app_directory().join("cache"))
    }

    /// Data bag root for this run.
    pub fn secrets_dir(&self) -> PathBuf {
        self.secrets
            .path
            .clone()
            .unwrap_or_else(|| get_app_directory().join("data_bags"))
    }
}

// ============================================
// LOADING
// ============================================

/// Get the directory where the EXE is located.
///
/// Canonicalizes to resolve symlinks/junctions and strips the \\?\ prefix
/// Windows adds. Falls back to the current directory.
pub fn get_app_directory() -> PathBuf {
    if let Ok(exe_path) = std::env::current_exe() {
        let resolved = exe_path.canonicalize().unwrap_or(exe_path);
        if let Some(parent) = resolved.parent() {
            let parent_str = parent.to_string_lossy();
            if let Some(stripped) = parent_str.strip_prefix(r"\\?\") {
                return PathBuf::from(stripped);
            }
            return parent.to_path_buf();
        }
    }
    warn!("could not determine EXE directory, using current directory");
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Which settings file this run reads.
pub fn config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => get_app_directory().join(CONFIG_FILE_NAME),
    }
}

/// Load settings from `path`. A missing file means all defaults.
pub fn load_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        info!(path = %path.display(), "no settings file, using defaults");
        return Ok(Settings::default());
    }

    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    let settings = Settings::from_toml(&text)
        .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
    info!(path = %path.display(), "loaded settings");
    Ok(settings)
}

/// Load the settings for this run.
pub fn load() -> Result<Settings> {
    load_from(&config_path())
}

// ============================================
// TESTS
// ============================================
