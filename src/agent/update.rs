use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::{Config, DEFAULT_SERVER_URL};
use crate::error::{AgentError, Result};
use crate::store::{keys, Store};
use crate::utils::datetime;

use super::identity::AGENT_VERSION;
use super::state::{AgentState, AgentStatus};

pub const UPDATE_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
pub const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// How long to keep the process alive after announcing a restart, so the
/// last messages make it out before the supervisor takes over.
pub const RESTART_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdatePhase {
    Checking,
    BackingUp,
    Downloading,
    Installing,
    Verifying,
    Done,
    RolledBack,
    Failed,
}

impl UpdatePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdatePhase::Checking => "checking",
            UpdatePhase::BackingUp => "backing-up",
            UpdatePhase::Downloading => "downloading",
            UpdatePhase::Installing => "installing",
            UpdatePhase::Verifying => "verifying",
            UpdatePhase::Done => "done",
            UpdatePhase::RolledBack => "rolled-back",
            UpdatePhase::Failed => "failed",
        }
    }
}

/// Answer from the server's update endpoint.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheck {
    #[serde(default)]
    pub update_available: bool,
    #[serde(default)]
    pub latest_version: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub changelog: Option<String>,
    #[serde(default)]
    pub mandatory: bool,
}

impl UpdateCheck {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Version metadata shipped inside every installation directory.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: String,
}

/// Pointer to the live installation, swapped atomically on success. The
/// running process image is never modified in place; a restart picks up the
/// new code.
#[derive(Debug, Serialize, Deserialize)]
struct CurrentPointer {
    version: String,
    path: PathBuf,
}

struct StatusGuard {
    state: Arc<AgentState>,
}

impl Drop for StatusGuard {
    fn drop(&mut self) {
        self.state.set_status(AgentStatus::Online);
    }
}

/// Checks for, stages, verifies and rolls back agent updates. One update
/// cycle at a time; the cycle lock also keeps two `update_agent` commands
/// from interleaving.
pub struct UpdateManager {
    config: Config,
    store: Arc<Store>,
    state: Arc<AgentState>,
    http: reqwest::Client,
    cycle: Mutex<()>,
}

impl UpdateManager {
    pub fn new(config: Config, store: Arc<Store>, state: Arc<AgentState>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(UPDATE_CHECK_TIMEOUT)
            .build()?;

        Ok(Self {
            config,
            store,
            state,
            http,
            cycle: Mutex::new(()),
        })
    }

    /// Makes sure an installation directory with a manifest exists, so the
    /// first update cycle has something to back up and verify against.
    pub fn ensure_install_dir(&self) -> Result<PathBuf> {
        let install_dir = match self.store.get(keys::INSTALL_DIR)? {
            Some(dir) => PathBuf::from(dir),
            None => self.config.versions_dir().join(AGENT_VERSION),
        };

        fs::create_dir_all(&install_dir)?;

        let manifest_path = install_dir.join("manifest.json");
        if !manifest_path.exists() {
            let manifest = Manifest {
                version: AGENT_VERSION.to_string(),
            };
            fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;
        }

        self.store
            .set(keys::INSTALL_DIR, &install_dir.to_string_lossy())?;
        Ok(install_dir)
    }

    /// Asks the server whether a newer build exists. Disabled entirely when
    /// auto-update is off; a dead update channel is never allowed to block
    /// normal operation, so network failures come back as "no update".
    pub async fn check(&self) -> UpdateCheck {
        if !self.store.get_bool(keys::AUTO_UPDATE, true) {
            debug!("auto-update disabled, skipping update check");
            return UpdateCheck::none();
        }

        match self.query_server().await {
            Ok(check) => check,
            Err(e) => {
                warn!("update check failed: {}", e);
                UpdateCheck::none()
            }
        }
    }

    async fn query_server(&self) -> Result<UpdateCheck> {
        let server_url = self.store.get_or(keys::SERVER_URL, DEFAULT_SERVER_URL);
        let endpoint = format!("{}/api/agent/update", server_url.trim_end_matches('/'));

        let mut request = self.http.get(&endpoint).query(&[
            ("version", AGENT_VERSION),
            ("platform", std::env::consts::OS),
            ("arch", std::env::consts::ARCH),
        ]);
        if let Some(token) = self.store.get(keys::SERVER_TOKEN)? {
            request = request.bearer_auth(token);
        }

        let check = request
            .send()
            .await
            .map_err(|e| AgentError::UpdateCheck(e.to_string()))?
            .error_for_status()
            .map_err(|e| AgentError::UpdateCheck(e.to_string()))?
            .json::<UpdateCheck>()
            .await
            .map_err(|e| AgentError::UpdateCheck(e.to_string()))?;

        self.store
            .set(keys::LAST_UPDATE_CHECK, &Utc::now().to_rfc3339())?;

        Ok(check)
    }

    /// Runs one full update cycle and returns the installed version.
    /// Success never restarts the process; that is the caller's decision.
    pub async fn update(&self, target: Option<String>) -> Result<String> {
        let _cycle = self.cycle.lock().await;

        match self.run_cycle(target).await {
            Ok(installed) => {
                info!(
                    "update cycle: {} (version {})",
                    UpdatePhase::Done.as_str(),
                    installed
                );
                Ok(installed)
            }
            Err(e) => {
                match &e {
                    // Not failures: nothing to do, or already reported as
                    // rolled-back with the state restored.
                    AgentError::NoUpdateAvailable | AgentError::UpdateRolledBack { .. } => {}
                    _ => warn!("update cycle: {} ({})", UpdatePhase::Failed.as_str(), e),
                }
                Err(e)
            }
        }
    }

    async fn run_cycle(&self, target: Option<String>) -> Result<String> {
        info!("update cycle: {}", UpdatePhase::Checking.as_str());
        let check = self.query_server().await.map_err(|e| {
            // Without an explicit target an unreachable channel just means
            // there is nothing to do.
            if target.is_none() {
                AgentError::NoUpdateAvailable
            } else {
                e
            }
        })?;

        if !check.update_available && target.is_none() {
            return Err(AgentError::NoUpdateAvailable);
        }

        let version = target
            .or(check.latest_version.clone())
            .ok_or_else(|| AgentError::UpdateCheck("server sent no version".to_string()))?;
        let download_url = check
            .download_url
            .clone()
            .ok_or_else(|| AgentError::UpdateCheck("server sent no download url".to_string()))?;

        if version == AGENT_VERSION {
            return Err(AgentError::NoUpdateAvailable);
        }

        self.state.set_status(AgentStatus::Updating);
        let _status = StatusGuard {
            state: Arc::clone(&self.state),
        };

        // Backup comes first: if no safety copy can be made, the cycle ends
        // before a single byte is downloaded.
        let (install_dir, backup_dir) = self.backup_current().await?;
        let archive = self.download(&download_url, &version).await?;
        let installed = self
            .apply_package(&archive, &version, &install_dir, &backup_dir)
            .await?;
        let _ = fs::remove_file(&archive);

        Ok(installed)
    }

    async fn download(&self, url: &str, version: &str) -> Result<PathBuf> {
        info!("update cycle: {}", UpdatePhase::Downloading.as_str());

        let mut request = self.http.get(url);
        if let Some(token) = self.store.get(keys::SERVER_TOKEN)? {
            request = request.bearer_auth(token);
        }

        let bytes = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AgentError::UpdateAborted {
                phase: "downloading",
                reason: e.to_string(),
            })?
            .bytes()
            .await
            .map_err(|e| AgentError::UpdateAborted {
                phase: "downloading",
                reason: e.to_string(),
            })?;

        let archive = self.config.tmp_dir().join(format!("pkg-{}.tar.gz", version));
        fs::write(&archive, &bytes)?;
        Ok(archive)
    }

    /// Phase: backing-up. Copies the live installation (code and manifest)
    /// into a timestamped backup directory. No backup, no update.
    async fn backup_current(&self) -> Result<(PathBuf, PathBuf)> {
        let install_dir = PathBuf::from(self.store.get_or(
            keys::INSTALL_DIR,
            &self.config.versions_dir().join(AGENT_VERSION).to_string_lossy(),
        ));

        info!("update cycle: {}", UpdatePhase::BackingUp.as_str());
        let backup_dir = self
            .config
            .backups_dir()
            .join(format!("backup-{}", datetime::dirstamp()));
        {
            let src = install_dir.clone();
            let dst = backup_dir.clone();
            tokio::task::spawn_blocking(move || copy_dir(&src, &dst))
                .await
                .map_err(|e| AgentError::UpdateAborted {
                    phase: "backing-up",
                    reason: e.to_string(),
                })?
                .map_err(|e| AgentError::UpdateAborted {
                    phase: "backing-up",
                    reason: e.to_string(),
                })?;
        }
        self.store
            .set(keys::LAST_BACKUP_PATH, &backup_dir.to_string_lossy())?;

        Ok((install_dir, backup_dir))
    }

    /// Stage, verify, swap. The live installation directory is never
    /// written during staging; on any failure the backup is restored over
    /// it anyway so the cycle always ends byte-identical to its start.
    async fn apply_package(
        &self,
        archive: &Path,
        version: &str,
        install_dir: &Path,
        backup_dir: &Path,
    ) -> Result<String> {
        // Phase: installing. Stage a fresh directory next to the live one.
        info!("update cycle: {}", UpdatePhase::Installing.as_str());
        let stage_dir = self.config.versions_dir().join(version);
        let staged = {
            let archive = archive.to_path_buf();
            let install = install_dir.to_path_buf();
            let stage = stage_dir.clone();
            tokio::task::spawn_blocking(move || stage_install(&archive, &install, &stage))
                .await
                .map_err(|e| format!("staging task failed: {}", e))
                .and_then(|r| r)
        };
        if let Err(reason) = staged {
            return self
                .rollback(install_dir, backup_dir, &stage_dir, reason)
                .await;
        }

        // Phase: verifying. The staged tree must identify as the version we
        // were promised before it becomes current.
        info!("update cycle: {}", UpdatePhase::Verifying.as_str());
        if let Err(reason) = verify_manifest(&stage_dir, version) {
            return self
                .rollback(install_dir, backup_dir, &stage_dir, reason)
                .await;
        }

        // Swap the pointer atomically; the old directory stays in place.
        let pointer = CurrentPointer {
            version: version.to_string(),
            path: stage_dir.clone(),
        };
        let pointer_path = self.config.app_dir.join("current.json");
        let pointer_tmp = self.config.tmp_dir().join("current.json");
        fs::write(&pointer_tmp, serde_json::to_vec_pretty(&pointer)?)?;
        fs::rename(&pointer_tmp, &pointer_path)?;
        self.store
            .set(keys::INSTALL_DIR, &stage_dir.to_string_lossy())?;

        Ok(version.to_string())
    }

    /// The offline portion of an update cycle, for exercising the
    /// filesystem state machine without a server.
    #[cfg(test)]
    async fn install_archive(&self, archive: &Path, version: &str) -> Result<String> {
        let (install_dir, backup_dir) = self.backup_current().await?;
        self.apply_package(archive, version, &install_dir, &backup_dir)
            .await
    }

    /// Restores the pre-cycle state. A rollback that itself fails is the one
    /// operator-visible emergency in this agent.
    async fn rollback(
        &self,
        install_dir: &Path,
        backup_dir: &Path,
        stage_dir: &Path,
        error: String,
    ) -> Result<String> {
        warn!("update failed ({}), rolling back", error);

        let restore = {
            let install = install_dir.to_path_buf();
            let backup = backup_dir.to_path_buf();
            let stage = stage_dir.to_path_buf();
            tokio::task::spawn_blocking(move || -> std::result::Result<(), String> {
                if stage.exists() {
                    fs::remove_dir_all(&stage).map_err(|e| e.to_string())?;
                }
                if install.exists() {
                    fs::remove_dir_all(&install).map_err(|e| e.to_string())?;
                }
                copy_dir(&backup, &install).map_err(|e| e.to_string())
            })
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r)
        };

        match restore {
            Ok(()) => {
                info!("update cycle: {}", UpdatePhase::RolledBack.as_str());
                Err(AgentError::UpdateRolledBack { error })
            }
            Err(rollback_error) => {
                error!(
                    "rollback failed, installation may be inconsistent: {}",
                    rollback_error
                );
                Err(AgentError::RollbackFailed {
                    error,
                    rollback_error,
                })
            }
        }
    }
}

/// Background update timer: checks the server every six hours and applies
/// anything it finds. A successful background update exits the process so
/// the supervisor restarts it on the new code.
pub async fn run_periodic(manager: Arc<UpdateManager>, session: super::session::SessionHandle) {
    let mut interval = tokio::time::interval(UPDATE_CHECK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; the first real check waits a period.
    interval.tick().await;

    loop {
        interval.tick().await;

        let check = manager.check().await;
        if !check.update_available {
            continue;
        }
        info!(
            "update available: {}",
            check.latest_version.as_deref().unwrap_or("unknown")
        );

        match manager.update(None).await {
            Ok(version) => {
                let _ = session.send(super::messages::Envelope::update_complete(
                    true,
                    serde_json::json!(version),
                ));
                info!("updated to {}, exiting for supervisor restart", version);
                tokio::time::sleep(RESTART_GRACE).await;
                std::process::exit(0);
            }
            Err(AgentError::NoUpdateAvailable) => {}
            Err(e @ AgentError::RollbackFailed { .. }) => {
                error!("{}", e);
                let _ = session.send(super::messages::Envelope::error(&e.to_string()));
            }
            Err(e) => {
                warn!("background update failed: {}", e);
                let _ = session.send(super::messages::Envelope::update_complete(
                    false,
                    serde_json::json!(e.to_string()),
                ));
            }
        }
    }
}

/// Copies the installation into the stage directory, then overlays the
/// package on top. The overlay only ever writes inside the stage tree;
/// nothing outside the package's own paths is deleted.
fn stage_install(
    archive: &Path,
    install_dir: &Path,
    stage_dir: &Path,
) -> std::result::Result<(), String> {
    if stage_dir.exists() {
        fs::remove_dir_all(stage_dir).map_err(|e| format!("clearing stale stage: {}", e))?;
    }
    copy_dir(install_dir, stage_dir).map_err(|e| format!("copying installation: {}", e))?;

    let file = fs::File::open(archive).map_err(|e| format!("opening package: {}", e))?;
    let tar = flate2::read::GzDecoder::new(file);
    let mut unpacker = tar::Archive::new(tar);
    unpacker.set_overwrite(true);
    unpacker
        .unpack(stage_dir)
        .map_err(|e| format!("extracting package: {}", e))?;

    Ok(())
}

fn verify_manifest(stage_dir: &Path, expected: &str) -> std::result::Result<(), String> {
    let manifest_path = stage_dir.join("manifest.json");
    let raw = fs::read(&manifest_path)
        .map_err(|e| format!("reading staged manifest: {}", e))?;
    let manifest: Manifest =
        serde_json::from_slice(&raw).map_err(|e| format!("parsing staged manifest: {}", e))?;

    if manifest.version != expected {
        return Err(format!(
            "staged manifest reports version '{}', expected '{}'",
            manifest.version, expected
        ));
    }

    Ok(())
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
