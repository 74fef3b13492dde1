// ============================================
// veeam-server - secrets.rs
// ============================================
// Optional secret material: the product license and credentials for the
// download share. Items are JSON "data bags" on disk:
//
//   data_bags/
//   └── veeam/
//       ├── license.json    {"license": "<license file content>"}
//       └── download.json   {"username": "...", "password": "..."}
//
// A missing or unreadable item is "not provided", never an error.
// ============================================

use std::fs;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Name of the data bag item holding the license file content.
pub const LICENSE_ITEM: &str = "license";

/// Name of the data bag item holding download credentials.
pub const DOWNLOAD_ITEM: &str = "download";

/// Lookup of named secret items.
pub trait SecretStore {
    /// The item `name` in `bag`, or `None` if it does not exist.
    fn item(&self, bag: &str, name: &str) -> Option<Value>;
}

/// Secret store backed by a directory of JSON files.
#[derive(Debug, Clone)]
pub struct DataBagStore {
    root: PathBuf,
}

impl DataBagStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DataBagStore { root: root.into() }
    }
}

impl SecretStore for DataBagStore {
    fn item(&self, bag: &str, name: &str) -> Option<Value> {
        let path = self.root.join(bag).join(format!("{}.json", name));
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "data bag item not available");
                return None;
            }
        };

        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring malformed data bag item");
                None
            }
        }
    }
}

// ============================================
// TYPED ITEMS
// ============================================

/// License file content handed to the installer.
#[derive(Clone, PartialEq, Eq)]
pub struct LicenseMaterial {
    pub content: String,
}

// Never print license content.
impl std::fmt::Debug for LicenseMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LicenseMaterial({} bytes)", self.content.len())
    }
}

/// Username/password pair.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

/// Resolve the license item. Empty content counts as "no license".
pub fn license(store: &dyn SecretStore, bag: &str) -> Option<LicenseMaterial> {
    let item = store.item(bag, LICENSE_ITEM)?;
    let content = item.get("license")?.as_str()?;
    if content.trim().is_empty() {
        return None;
    }
    Some(LicenseMaterial { content: content.to_string() })
}

/// Resolve download credentials. Anything incomplete counts as "none".
pub fn download_credentials(store: &dyn SecretStore, bag: &str) -> Option<Credentials> {
    let item = store.item(bag, DOWNLOAD_ITEM)?;
    match serde_json::from_value::<Credentials>(item) {
        Ok(creds) if !creds.username.is_empty() => Some(creds),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "download credentials item is incomplete; using anonymous access");
            None
        }
    }
}

// ============================================
// TESTS
// ============================================
