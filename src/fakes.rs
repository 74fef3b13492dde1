// ============================================
// veeam-server - fakes.rs (tests only)
// ============================================
// An in-memory host for unit tests. It answers every host trait from
// recorded state and remembers what it was asked to do, so tests can
// assert on calls (mounts, dismounts, installer runs) without touching
// the real machine.
//
// Defaults (FakeHost::supported()):
//   - Windows 2012R2
//   - .NET 4.5.2 (Release 0x5cbf5)
//   - no secrets, no services
//   - a "mounted volume" directory with Backup/Server.x64.msi
//   - msiexec exits 0 and registers VeeamBackupSvc (Running, Auto)
//   - mounting an image that is already attached fails, like the real
//     Mount-DiskImage
// ============================================

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};

use crate::compliance::BACKUP_SERVICE_NAME;
use crate::host::{
    DiscImages, HostContext, HostFacts, ProcessOutput, ProcessRunner, Registry, RegistryValue,
    ServiceStates, ServiceState, ServiceStatus, StartMode, WindowsRelease,
};
use crate::installer::InstallError;
use crate::mount::MountError;
use crate::request::{DOTNET_REGISTRY_KEY, DOTNET_RELEASE_VALUE};
use crate::secrets::{SecretStore, DOWNLOAD_ITEM, LICENSE_ITEM};

/// One recorded disc image or process call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    IsAttached(PathBuf),
    VolumeRoot(PathBuf),
    Mount(PathBuf),
    Dismount(PathBuf),
    Run { program: PathBuf, args: Vec<String> },
}

/// How the fake msiexec behaves.
#[derive(Debug, Clone)]
enum InstallerBehaviour {
    Exit { code: i32, stderr: String },
    Timeout,
}

pub struct FakeHost {
    os: WindowsRelease,
    registry: HashMap<String, Vec<RegistryValue>>,
    secrets: HashMap<(String, String), Value>,
    installer: InstallerBehaviour,
    installer_log: Option<String>,
    registers_service: bool,
    failing_mount: bool,
    drifting_mount: bool,
    failing_dismount: bool,
    mount_dir: tempfile::TempDir,

    attached: RefCell<HashSet<PathBuf>>,
    services: RefCell<HashMap<String, ServiceStatus>>,
    calls: RefCell<Vec<Call>>,
    license_seen: RefCell<Option<String>>,
}

impl FakeHost {
    /// A host that satisfies every prerequisite.
    pub fn supported() -> Self {
        let mount_dir = tempfile::tempdir().expect("create fake mount root");
        let backup = mount_dir.path().join("Backup");
        fs::create_dir_all(&backup).expect("create fake volume layout");
        fs::write(backup.join("Server.x64.msi"), b"MSI").expect("write fake msi");

        FakeHost {
            os: WindowsRelease::Server2012R2,
            registry: HashMap::new(),
            secrets: HashMap::new(),
            installer: InstallerBehaviour::Exit { code: 0, stderr: String::new() },
            installer_log: None,
            registers_service: true,
            failing_mount: false,
            drifting_mount: false,
            failing_dismount: false,
            mount_dir,
            attached: RefCell::new(HashSet::new()),
            services: RefCell::new(HashMap::new()),
            calls: RefCell::new(Vec::new()),
            license_seen: RefCell::new(None),
        }
        .with_dotnet_release(379893)
    }

    // ---- builders ----

    pub fn with_os(mut self, os: WindowsRelease) -> Self {
        self.os = os;
        self
    }

    pub fn without_dotnet(mut self) -> Self {
        self.registry.remove(DOTNET_REGISTRY_KEY);
        self
    }

    pub fn with_dotnet_release(self, release: u32) -> Self {
        let data = format!("0x{:x}", release);
        self.with_registry_values(
            DOTNET_REGISTRY_KEY,
            &[("Install", "REG_DWORD", "0x1"), (DOTNET_RELEASE_VALUE, "REG_DWORD", data.as_str())],
        )
    }

    /// Replace every value under `key`.
    pub fn with_registry_values(mut self, key: &str, values: &[(&str, &str, &str)]) -> Self {
        let values = values
            .iter()
            .map(|(name, kind, data)| RegistryValue {
                name: name.to_string(),
                kind: kind.to_string(),
                data: data.to_string(),
            })
            .collect();
        self.registry.insert(key.to_string(), values);
        self
    }

    pub fn with_license(mut self, content: &str) -> Self {
        self.secrets.insert(
            ("veeam".to_string(), LICENSE_ITEM.to_string()),
            json!({ "license": content }),
        );
        self
    }

    pub fn with_download_credentials(mut self, username: &str, password: &str) -> Self {
        self.secrets.insert(
            ("veeam".to_string(), DOWNLOAD_ITEM.to_string()),
            json!({ "username": username, "password": password }),
        );
        self
    }

    pub fn with_installer_exit(mut self, code: i32, stderr: &str) -> Self {
        self.installer = InstallerBehaviour::Exit { code, stderr: stderr.to_string() };
        self
    }

    /// msiexec writes `content` to its /L*v log (UTF-16 LE, like the real one).
    pub fn with_installer_log(mut self, content: &str) -> Self {
        self.installer_log = Some(content.to_string());
        self
    }

    /// Put the redistributable MSIs under Redistr\x64 on the fake volume.
    pub fn with_prerequisites_on_media(self) -> Self {
        let redistr = self.mount_dir.path().join("Redistr").join("x64");
        fs::create_dir_all(&redistr).expect("create fake redistr folder");
        for msi in ["SQLSysClrTypes.msi", "SharedManagementObjects.msi"] {
            fs::write(redistr.join(msi), b"MSI").expect("write fake prerequisite");
        }
        self
    }

    pub fn with_installer_timeout(mut self) -> Self {
        self.installer = InstallerBehaviour::Timeout;
        self
    }

    pub fn with_failing_mount(mut self) -> Self {
        self.failing_mount = true;
        self
    }

    /// Mount succeeds but the OS "forgets" the image straight away, as if
    /// someone dismounted it by hand.
    pub fn with_drifting_mount(mut self) -> Self {
        self.drifting_mount = true;
        self
    }

    pub fn with_failing_dismount(mut self) -> Self {
        self.failing_dismount = true;
        self
    }

    /// msiexec succeeds but no service shows up afterwards.
    pub fn without_service_registration(mut self) -> Self {
        self.registers_service = false;
        self
    }

    pub fn with_service(self, name: &str, status: ServiceStatus) -> Self {
        self.services.borrow_mut().insert(name.to_string(), status);
        self
    }

    // ---- accessors ----

    pub fn context(&self) -> HostContext<'_> {
        HostContext {
            facts: self,
            registry: self,
            images: self,
            runner: self,
            services: self,
            secrets: self,
        }
    }

    /// Root of the fake mounted volume.
    pub fn mount_root(&self) -> PathBuf {
        self.mount_dir.path().to_path_buf()
    }

    /// Mark an image as attached, as if an earlier run left it mounted.
    pub fn attach(&self, image: &Path) {
        self.attached.borrow_mut().insert(image.to_path_buf());
    }

    pub fn is_image_attached(&self, image: &Path) -> bool {
        self.attached.borrow().contains(image)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn mount_calls(&self) -> usize {
        self.calls.borrow().iter().filter(|c| matches!(c, Call::Mount(_))).count()
    }

    pub fn dismount_calls(&self) -> usize {
        self.calls.borrow().iter().filter(|c| matches!(c, Call::Dismount(_))).count()
    }

    /// Every program run as (program, args).
    pub fn runs(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::Run { program, args } => Some((program.clone(), args.clone())),
                _ => None,
            })
            .collect()
    }

    /// License file content as it existed while the installer ran.
    pub fn license_seen(&self) -> Option<String> {
        self.license_seen.borrow().clone()
    }
}

impl HostFacts for FakeHost {
    fn os_version(&self) -> WindowsRelease {
        self.os.clone()
    }
}

impl Registry for FakeHost {
    fn values(&self, key: &str) -> Option<Vec<RegistryValue>> {
        self.registry.get(key).cloned()
    }
}

impl DiscImages for FakeHost {
    fn is_attached(&self, image: &Path) -> Result<bool, MountError> {
        self.calls.borrow_mut().push(Call::IsAttached(image.to_path_buf()));
        Ok(self.is_image_attached(image))
    }

    fn mount(&self, image: &Path) -> Result<PathBuf, MountError> {
        self.calls.borrow_mut().push(Call::Mount(image.to_path_buf()));
        if self.failing_mount {
            return Err(MountError::MountFailed {
                path: image.to_path_buf(),
                reason: "The file or directory is corrupted and unreadable.".to_string(),
            });
        }
        if self.is_image_attached(image) {
            return Err(MountError::MountFailed {
                path: image.to_path_buf(),
                reason: "The process cannot access the file because it is being used by another process.".to_string(),
            });
        }
        if !self.drifting_mount {
            self.attached.borrow_mut().insert(image.to_path_buf());
        }
        Ok(self.mount_root())
    }

    fn volume_root(&self, image: &Path) -> Result<PathBuf, MountError> {
        self.calls.borrow_mut().push(Call::VolumeRoot(image.to_path_buf()));
        if !self.is_image_attached(image) {
            return Err(MountError::StatusQuery {
                path: image.to_path_buf(),
                reason: "image is not attached".to_string(),
            });
        }
        Ok(self.mount_root())
    }

    fn dismount(&self, image: &Path) -> Result<(), MountError> {
        self.calls.borrow_mut().push(Call::Dismount(image.to_path_buf()));
        if self.failing_dismount {
            return Err(MountError::DismountFailed {
                path: image.to_path_buf(),
                reason: "The device is busy.".to_string(),
            });
        }
        self.attached.borrow_mut().remove(image);
        Ok(())
    }
}

impl ProcessRunner for FakeHost {
    fn run(&self, program: &Path, args: &[String], timeout: Duration) -> Result<ProcessOutput, InstallError> {
        self.calls.borrow_mut().push(Call::Run {
            program: program.to_path_buf(),
            args: args.to_vec(),
        });

        let license = args
            .iter()
            .find_map(|a| a.strip_prefix("VBR_LICENSE_FILE="))
            .and_then(|path| fs::read_to_string(path).ok());
        if license.is_some() {
            *self.license_seen.borrow_mut() = license;
        }

        if let Some(content) = &self.installer_log {
            let log = args.iter().position(|a| a == "/L*v").and_then(|i| args.get(i + 1));
            if let Some(log) = log {
                let mut bytes = vec![0xFF, 0xFE];
                for unit in content.encode_utf16() {
                    bytes.extend_from_slice(&unit.to_le_bytes());
                }
                fs::write(log, bytes).expect("write fake installer log");
            }
        }

        match &self.installer {
            InstallerBehaviour::Timeout => Err(InstallError::Timeout {
                program: program.to_path_buf(),
                seconds: timeout.as_secs(),
            }),
            InstallerBehaviour::Exit { code, stderr } => {
                if *code == 0 && self.registers_service {
                    self.services.borrow_mut().insert(
                        BACKUP_SERVICE_NAME.to_string(),
                        ServiceStatus { state: ServiceState::Running, start_mode: StartMode::Auto },
                    );
                }
                Ok(ProcessOutput {
                    exit_code: *code,
                    stdout: String::new(),
                    stderr: stderr.clone(),
                })
            }
        }
    }
}

impl ServiceStates for FakeHost {
    fn query(&self, name: &str) -> Option<ServiceStatus> {
        self.services.borrow().get(name).copied()
    }
}

impl SecretStore for FakeHost {
    fn item(&self, bag: &str, name: &str) -> Option<Value> {
        self.secrets.get(&(bag.to_string(), name.to_string())).cloned()
    }
}
