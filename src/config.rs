use std::fs;
use std::path::PathBuf;

use crate::error::Result;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_SCAN_INTERVAL: &str = "0 0 */6 * * *";
pub const DEFAULT_LOCAL_API_PORT: u16 = 8787;

/// Filesystem layout of one agent installation. Everything the agent
/// persists lives under `app_dir`.
#[derive(Clone, Debug)]
pub struct Config {
    pub app_dir: PathBuf,
    pub local_api_port: u16,
}

impl Config {
    pub fn new() -> Self {
        let app_dir = match home::home_dir() {
            Some(path) if !path.as_os_str().is_empty() => path.join(".fleetmon"),
            // If the home directory is not found, use the current working directory.
            _ => PathBuf::from(".fleetmon"),
        };

        Self {
            app_dir,
            local_api_port: DEFAULT_LOCAL_API_PORT,
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.app_dir.join("agent.db")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.app_dir.join("reports")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.app_dir.join("backups")
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.app_dir.join("versions")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.app_dir.join("tmp")
    }

    /// Creates the directory tree. Failure here is fatal at startup.
    pub fn mkdirs(&self) -> Result<()> {
        for dir in [
            self.app_dir.clone(),
            self.reports_dir(),
            self.backups_dir(),
            self.versions_dir(),
            self.tmp_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
