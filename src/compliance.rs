// ============================================
// veeam-server - compliance.rs
// ============================================
// Post-install verification, separate from convergence:
//
//   Server-feature-installed
//     - port 9392 is listening
//     - service VeeamBackupSvc is running, start mode Auto
//
// `converge` never looks at these results; `verify` runs them on their
// own and fails if any check fails.
// ============================================

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::host::{ServiceStates, ServiceState, StartMode};

/// Windows service the backup server runs as.
pub const BACKUP_SERVICE_NAME: &str = "VeeamBackupSvc";

/// Port the backup service listens on.
pub const BACKUP_SERVICE_PORT: u16 = 9392;

/// How long to wait for the listener to accept.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// One check and how it went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// All checks of the control.
#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    pub control: String,
    pub checks: Vec<CheckResult>,
}

impl ComplianceReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

/// Is something accepting TCP connections on `port` locally?
pub fn port_listening(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok()
}

fn check_port(port: u16) -> CheckResult {
    let passed = port_listening(port);
    CheckResult {
        name: format!("port {} listening", port),
        passed,
        detail: if passed {
            "accepting connections".to_string()
        } else {
            "nothing listening".to_string()
        },
    }
}

fn check_service(services: &dyn ServiceStates, name: &str) -> Vec<CheckResult> {
    let status = services.query(name);
    let running = status.is_some_and(|s| s.state == ServiceState::Running);
    let auto = status.is_some_and(|s| s.start_mode == StartMode::Auto);

    let state_detail = match status {
        Some(s) => format!("{:?}", s.state),
        None => "not installed".to_string(),
    };
    let mode_detail = match status {
        Some(s) => s.start_mode.to_string(),
        None => "not installed".to_string(),
    };

    vec![
        CheckResult {
            name: format!("service {} running", name),
            passed: running,
            detail: state_detail,
        },
        CheckResult {
            name: format!("service {} start mode Auto", name),
            passed: auto,
            detail: mode_detail,
        },
    ]
}

/// Verify the backup server is installed and serving.
pub fn verify(services: &dyn ServiceStates, port: u16, service: &str) -> ComplianceReport {
    let mut checks = vec![check_port(port)];
    checks.extend(check_service(services, service));

    for check in &checks {
        if check.passed {
            info!(check = %check.name, detail = %check.detail, "pass");
        } else {
            warn!(check = %check.name, detail = %check.detail, "FAIL");
        }
    }

    ComplianceReport {
        control: "Server-feature-installed".to_string(),
        checks,
    }
}

// ============================================
// TESTS
// ============================================
