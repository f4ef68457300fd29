use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::store::{keys, Store};
use crate::utils::datetime;

use super::scans::{ProbeDepth, ScanKind, ScanProbes};
use super::session::SessionHandle;
use super::state::{AgentState, AgentStatus};

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub scan_id: String,
    pub scan_type: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Restores the agent status when the scan is over, success or not. Tied to
/// drop order so a failing pipeline can never leave the agent `scanning`.
struct StatusGuard {
    state: Arc<AgentState>,
}

impl StatusGuard {
    fn scanning(state: Arc<AgentState>) -> Self {
        state.set_status(AgentStatus::Scanning);
        Self { state }
    }
}

impl Drop for StatusGuard {
    fn drop(&mut self) {
        self.state.set_status(AgentStatus::Online);
    }
}

/// Executes one scan at a time by delegating to the probe collaborators.
/// Holds the single task slot: a second invocation while one is in flight is
/// rejected, never queued.
pub struct TaskRunner {
    state: Arc<AgentState>,
    store: Arc<Store>,
    session: SessionHandle,
    probes: Arc<dyn ScanProbes>,
    reports_dir: PathBuf,
    slot: Arc<Semaphore>,
}

impl TaskRunner {
    pub fn new(
        state: Arc<AgentState>,
        store: Arc<Store>,
        session: SessionHandle,
        probes: Arc<dyn ScanProbes>,
        reports_dir: PathBuf,
    ) -> Self {
        Self {
            state,
            store,
            session,
            probes,
            reports_dir,
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Whether a scan is currently in flight. The scheduler uses this to
    /// skip overlapping fires.
    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }

    /// Runs one scan to completion. Returns `AlreadyScanning` without side
    /// effects if another scan holds the slot. The report is always produced
    /// otherwise, carrying either results or the failure description.
    pub async fn run_scan(&self, kind: ScanKind, scan_id: Option<String>) -> Result<ScanReport> {
        let permit = self
            .slot
            .clone()
            .try_acquire_owned()
            .map_err(|_| AgentError::AlreadyScanning)?;

        let scan_id = scan_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let _status = StatusGuard::scanning(Arc::clone(&self.state));

        info!("scan {} started (type: {})", scan_id, kind.as_str());
        let _ = self
            .session
            .send(crate::agent::messages::Envelope::scan_start(
                &scan_id,
                kind.as_str(),
            ));

        let started_at = Utc::now();
        let probes = Arc::clone(&self.probes);
        let outcome = tokio::task::spawn_blocking(move || run_pipeline(probes.as_ref(), kind)).await;

        let (success, results, error) = match outcome {
            Ok(Ok(results)) => (true, Some(results), None),
            Ok(Err(e)) => (false, None, Some(e)),
            Err(e) => (false, None, Some(format!("scan task panicked: {}", e))),
        };

        let report = ScanReport {
            scan_id: scan_id.clone(),
            scan_type: kind.as_str().to_string(),
            started_at,
            finished_at: Utc::now(),
            success,
            results,
            error,
        };

        self.persist_report(&report);
        drop(permit);

        if report.success {
            info!("scan {} finished", scan_id);
        } else {
            warn!(
                "scan {} failed: {}",
                scan_id,
                report.error.as_deref().unwrap_or("unknown")
            );
        }

        Ok(report)
    }

    /// Report persistence is best effort; a full disk must not turn a
    /// finished scan into a failure.
    fn persist_report(&self, report: &ScanReport) {
        let path = self
            .reports_dir
            .join(format!("scan-{}-{}.json", datetime::dirstamp(), report.scan_id));

        match serde_json::to_vec_pretty(report) {
            Ok(bytes) => {
                if let Err(e) = fs::write(&path, bytes) {
                    warn!("unable to persist scan report {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("unable to serialize scan report: {}", e),
        }

        if let Err(e) = self
            .store
            .set(keys::LAST_SCAN, &report.finished_at.to_rfc3339())
        {
            warn!("unable to record last scan time: {}", e);
        }
    }
}

/// Composes the collaborator pipeline for one scan kind. Every pipeline
/// starts with basic system info; the first failing probe aborts the scan.
fn run_pipeline(probes: &dyn ScanProbes, kind: ScanKind) -> std::result::Result<Value, String> {
    let mut results = json!({ "systemInfo": probes.system_info()? });

    match kind {
        ScanKind::Quick => {
            results["network"] = json!({ "commonPorts": probes.common_ports()? });
        }
        ScanKind::System => {
            results["system"] = system_section(probes)?;
        }
        ScanKind::Network => {
            results["network"] = network_section(probes, ProbeDepth::Standard)?;
        }
        ScanKind::Full => {
            results["system"] = system_section(probes)?;
            results["network"] = network_section(probes, ProbeDepth::Deep)?;
        }
    }

    Ok(results)
}

fn system_section(probes: &dyn ScanProbes) -> std::result::Result<Value, String> {
    Ok(json!({
        "details": probes.detailed_system()?,
        "config": probes.config_check()?,
        "vulnerabilities": probes.local_vulnerabilities()?,
        "malware": probes.malware_artifacts()?,
    }))
}

fn network_section(
    probes: &dyn ScanProbes,
    depth: ProbeDepth,
) -> std::result::Result<Value, String> {
    Ok(json!({
        "devices": probes.discover_devices(depth)?,
        "services": probes.service_scan(depth)?,
        "firewall": probes.firewall_check()?,
        "vulnerabilities": probes.network_vulnerabilities(depth)?,
    }))
}
