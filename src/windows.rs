// ============================================
// veeam-server - windows.rs
// ============================================
// The real host: every trait from host.rs implemented with the tools that
// ship with Windows Server.
//
//   OS version      powershell [System.Environment]::OSVersion.Version
//   Registry        reg.exe query <key>
//   Disc images     powershell Get-DiskImage / Mount-DiskImage /
//                   Dismount-DiskImage (built into Windows 8 / 2012+)
//   Services        sc.exe query / sc.exe qc
//   Processes       std::process with a polling timeout
//
// The output parsers are plain functions so they can be tested anywhere.
// ============================================

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::host::{
    DiscImages, HostFacts, ProcessOutput, ProcessRunner, Registry, RegistryValue, ServiceStates,
    ServiceState, ServiceStatus, StartMode, WindowsRelease,
};
use crate::installer::InstallError;
use crate::mount::MountError;

/// How often a running process is checked for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// `sc.exe` exit code for "service does not exist".
const SC_SERVICE_DOES_NOT_EXIST: i32 = 1060;

/// The local Windows host.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsHost;

// ============================================
// POWERSHELL HELPER
// ============================================

/// Quote a path for a single-quoted PowerShell string.
fn ps_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "''"))
}

/// Run an inline PowerShell command. Ok(stdout) on success,
/// Err(stderr or launch error) otherwise.
fn powershell(script: &str) -> Result<String, String> {
    let output = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command", script])
        .output()
        .map_err(|e| format!("failed to run PowerShell: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(stderr.trim().to_string());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

// ============================================
// HOST FACTS
// ============================================

impl HostFacts for WindowsHost {
    fn os_version(&self) -> WindowsRelease {
        if !cfg!(windows) {
            return WindowsRelease::NotWindows(std::env::consts::OS.to_string());
        }

        match powershell("[System.Environment]::OSVersion.Version.ToString()") {
            Ok(text) => WindowsRelease::parse_nt_version(&text).unwrap_or_else(|| {
                warn!(output = %text, "unrecognised OS version output");
                WindowsRelease::Unknown { major: 0, minor: 0 }
            }),
            Err(e) => {
                warn!(error = %e, "could not read OS version");
                WindowsRelease::Unknown { major: 0, minor: 0 }
            }
        }
    }
}

// ============================================
// REGISTRY
// ============================================

impl Registry for WindowsHost {
    fn values(&self, key: &str) -> Option<Vec<RegistryValue>> {
        let output = Command::new("reg").args(["query", key]).output().ok()?;
        if !output.status.success() {
            debug!(key, "registry key not found");
            return None;
        }
        Some(parse_reg_query(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `reg query <key>` output:
///
/// ```text
/// HKEY_LOCAL_MACHINE\SOFTWARE\Microsoft\NET Framework Setup\NDP\v4\Full
///     Release    REG_DWORD    0x5cbf5
///     Version    REG_SZ    4.5.51209
/// ```
///
/// Fields are separated by four spaces; names may contain single spaces.
pub fn parse_reg_query(output: &str) -> Vec<RegistryValue> {
    output
        .lines()
        .filter(|line| line.starts_with(' '))
        .filter_map(|line| {
            let parts: Vec<&str> = line.trim().split("    ").map(str::trim).collect();
            if parts.len() < 2 || !parts[1].starts_with("REG_") {
                return None;
            }
            Some(RegistryValue {
                name: parts[0].to_string(),
                kind: parts[1].to_string(),
                data: parts.get(2..).map(|rest| rest.join("    ")).unwrap_or_default(),
            })
        })
        .collect()
}

// ============================================
// DISC IMAGES
// ============================================

impl DiscImages for WindowsHost {
    fn is_attached(&self, image: &Path) -> Result<bool, MountError> {
        // Get-DiskImage errors on paths that don't exist; a missing file
        // can't be attached
        if !image.exists() {
            return Ok(false);
        }

        let script = format!("(Get-DiskImage -ImagePath {}).Attached", ps_quote(image));
        let stdout = powershell(&script).map_err(|reason| MountError::StatusQuery {
            path: image.to_path_buf(),
            reason,
        })?;
        Ok(stdout.eq_ignore_ascii_case("true"))
    }

    fn mount(&self, image: &Path) -> Result<PathBuf, MountError> {
        let script = format!(
            "(Mount-DiskImage -ImagePath {} -PassThru | Get-Volume).DriveLetter",
            ps_quote(image)
        );
        let failed = |reason: String| MountError::MountFailed { path: image.to_path_buf(), reason };

        let stdout = powershell(&script).map_err(failed)?;
        drive_root(&stdout).ok_or_else(|| failed("image mounted but no drive letter assigned".to_string()))
    }

    fn volume_root(&self, image: &Path) -> Result<PathBuf, MountError> {
        let script = format!(
            "(Get-DiskImage -ImagePath {} | Get-Volume).DriveLetter",
            ps_quote(image)
        );
        let failed = |reason: String| MountError::StatusQuery { path: image.to_path_buf(), reason };

        let stdout = powershell(&script).map_err(failed)?;
        drive_root(&stdout).ok_or_else(|| failed("image attached but has no drive letter".to_string()))
    }

    fn dismount(&self, image: &Path) -> Result<(), MountError> {
        let script = format!("Dismount-DiskImage -ImagePath {} | Out-Null", ps_quote(image));
        powershell(&script).map(|_| ()).map_err(|reason| MountError::DismountFailed {
            path: image.to_path_buf(),
            reason,
        })
    }
}

/// "E" (first line of Get-Volume output) -> E:\
fn drive_root(stdout: &str) -> Option<PathBuf> {
    let letter = stdout.lines().next()?.trim();
    if letter.is_empty() {
        return None;
    }
    Some(PathBuf::from(format!("{}:\\", letter)))
}

// ============================================
// SERVICES
// ============================================

impl ServiceStates for WindowsHost {
    fn query(&self, name: &str) -> Option<ServiceStatus> {
        let query = Command::new("sc.exe").args(["query", name]).output().ok()?;
        if query.status.code() == Some(SC_SERVICE_DOES_NOT_EXIST) || !query.status.success() {
            return None;
        }
        let state = parse_sc_state(&String::from_utf8_lossy(&query.stdout));

        let start_mode = match Command::new("sc.exe").args(["qc", name]).output() {
            Ok(qc) if qc.status.success() => parse_sc_start_mode(&String::from_utf8_lossy(&qc.stdout)),
            _ => StartMode::Other,
        };

        Some(ServiceStatus { state, start_mode })
    }
}

/// Value after "KEY :" in sc.exe output, e.g. "4  RUNNING".
fn sc_field<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        if k.trim().eq_ignore_ascii_case(key) {
            Some(v.trim())
        } else {
            None
        }
    })
}

/// STATE from `sc.exe query`.
pub fn parse_sc_state(output: &str) -> ServiceState {
    let Some(value) = sc_field(output, "STATE") else {
        return ServiceState::Other;
    };
    match value.split_whitespace().nth(1) {
        Some("RUNNING") => ServiceState::Running,
        Some("STOPPED") => ServiceState::Stopped,
        Some("START_PENDING") => ServiceState::StartPending,
        Some("STOP_PENDING") => ServiceState::StopPending,
        Some("PAUSED") => ServiceState::Paused,
        _ => ServiceState::Other,
    }
}

/// START_TYPE from `sc.exe qc`.
pub fn parse_sc_start_mode(output: &str) -> StartMode {
    let Some(value) = sc_field(output, "START_TYPE") else {
        return StartMode::Other;
    };
    match value.split_whitespace().nth(1) {
        // Delayed auto start is still automatic
        Some("AUTO_START") => StartMode::Auto,
        Some("DEMAND_START") => StartMode::Manual,
        Some("DISABLED") => StartMode::Disabled,
        _ => StartMode::Other,
    }
}

// ============================================
// PROCESSES
// ============================================

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    let mut pipe = pipe?;
    Some(thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = pipe.read_to_end(&mut bytes);
        String::from_utf8_lossy(&bytes).into_owned()
    }))
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!(error = %e, "failed to kill timed out process");
    }
    let _ = child.wait();
}

impl ProcessRunner for WindowsHost {
    fn run(&self, program: &Path, args: &[String], timeout: Duration) -> Result<ProcessOutput, InstallError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| InstallError::Spawn { program: program.to_path_buf(), source })?;
        debug!(pid = child.id(), program = %program.display(), "process started");

        // Pipes are drained on their own threads so a chatty process
        // can't block on a full pipe while we poll
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= timeout => {
                    kill(&mut child);
                    return Err(InstallError::Timeout {
                        program: program.to_path_buf(),
                        seconds: timeout.as_secs(),
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL.min(timeout)),
                Err(source) => {
                    kill(&mut child);
                    return Err(InstallError::Spawn { program: program.to_path_buf(), source });
                }
            }
        };

        Ok(ProcessOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }
}

// ============================================
// TESTS
// ============================================
