use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde_json::{json, Value};

/// Scan collaborators return a value or a description of what went wrong;
/// no panic ever crosses this boundary.
pub type ProbeResult = Result<Value, String>;

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);
const COMMON_PORTS: [u16; 10] = [21, 22, 23, 25, 80, 135, 139, 443, 445, 3389];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanKind {
    Quick,
    System,
    Network,
    Full,
}

impl ScanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanKind::Quick => "quick",
            ScanKind::System => "system",
            ScanKind::Network => "network",
            ScanKind::Full => "full",
        }
    }
}

impl FromStr for ScanKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(ScanKind::Quick),
            "system" => Ok(ScanKind::System),
            "network" => Ok(ScanKind::Network),
            "full" => Ok(ScanKind::Full),
            other => Err(format!("unknown scan type '{}'", other)),
        }
    }
}

/// How deep the network probes go. `Full` scans run everything at `Deep`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeDepth {
    Standard,
    Deep,
}

/// The scan collaborators the task runner composes into pipelines. The real
/// probe engines live outside this crate; this trait is their call contract
/// and the seam tests use to inject failures. Implementations may block;
/// the runner executes pipelines off the session loop.
pub trait ScanProbes: Send + Sync {
    fn system_info(&self) -> ProbeResult;
    fn detailed_system(&self) -> ProbeResult;
    fn config_check(&self) -> ProbeResult;
    fn local_vulnerabilities(&self) -> ProbeResult;
    fn malware_artifacts(&self) -> ProbeResult;
    fn common_ports(&self) -> ProbeResult;
    fn discover_devices(&self, depth: ProbeDepth) -> ProbeResult;
    fn service_scan(&self, depth: ProbeDepth) -> ProbeResult;
    fn firewall_check(&self) -> ProbeResult;
    fn network_vulnerabilities(&self, depth: ProbeDepth) -> ProbeResult;
}

/// Default probe suite: cheap, bounded host checks so the agent is useful
/// even without the full scan engines installed.
pub struct HostProbes;

impl HostProbes {
    fn probe_port(port: u16) -> bool {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_ok()
    }
}

impl ScanProbes for HostProbes {
    fn system_info(&self) -> ProbeResult {
        let hostname = std::process::Command::new("hostname")
            .output()
            .ok()
            .and_then(|out| String::from_utf8(out.stdout).ok())
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());

        Ok(json!({
            "hostname": hostname,
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "family": std::env::consts::FAMILY,
        }))
    }

    fn detailed_system(&self) -> ProbeResult {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .map_err(|e| format!("cpu count unavailable: {}", e))?;

        Ok(json!({
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "cpus": cpus,
        }))
    }

    fn config_check(&self) -> ProbeResult {
        // Presence checks only; content inspection belongs to the real engine.
        let checked = ["/etc/passwd", "/etc/ssh/sshd_config", "/etc/sudoers"];
        let findings: Vec<Value> = checked
            .iter()
            .map(|p| json!({ "path": p, "present": Path::new(p).exists() }))
            .collect();

        Ok(json!({ "checked": checked.len(), "findings": findings }))
    }

    fn local_vulnerabilities(&self) -> ProbeResult {
        Ok(json!({ "checked": 0, "findings": [] }))
    }

    fn malware_artifacts(&self) -> ProbeResult {
        Ok(json!({ "scannedPaths": 0, "matches": [] }))
    }

    fn common_ports(&self) -> ProbeResult {
        let open: Vec<u16> = COMMON_PORTS
            .iter()
            .copied()
            .filter(|p| Self::probe_port(*p))
            .collect();

        Ok(json!({ "probed": COMMON_PORTS.len(), "open": open }))
    }

    fn discover_devices(&self, _depth: ProbeDepth) -> ProbeResult {
        Ok(json!({ "devices": [] }))
    }

    fn service_scan(&self, depth: ProbeDepth) -> ProbeResult {
        let mut result = self.common_ports()?;
        result["depth"] = json!(match depth {
            ProbeDepth::Standard => "standard",
            ProbeDepth::Deep => "deep",
        });
        Ok(result)
    }

    fn firewall_check(&self) -> ProbeResult {
        let managers = ["/usr/sbin/nft", "/usr/sbin/iptables", "/usr/sbin/ufw"];
        let present: Vec<&str> = managers
            .iter()
            .copied()
            .filter(|p| Path::new(p).exists())
            .collect();

        Ok(json!({ "managers": present, "configured": !present.is_empty() }))
    }

    fn network_vulnerabilities(&self, _depth: ProbeDepth) -> ProbeResult {
        Ok(json!({ "checked": 0, "findings": [] }))
    }
}
