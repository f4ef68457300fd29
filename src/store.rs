use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// Well-known configuration keys. The store itself is an opaque map; these
/// constants keep the callers in agreement on spelling.
pub mod keys {
    pub const AGENT_ID: &str = "agentId";
    pub const CLIENT_ID: &str = "clientId";
    pub const SERVER_URL: &str = "serverUrl";
    pub const SERVER_TOKEN: &str = "serverToken";
    pub const TEMP_DEVICE_TOKEN: &str = "tempDeviceToken";
    pub const LOCAL_API_TOKEN: &str = "localApiToken";
    pub const SCAN_INTERVAL: &str = "scanInterval";
    pub const LAST_SCAN: &str = "lastScan";
    pub const SETUP_COMPLETE: &str = "setupComplete";
    pub const AUTO_UPDATE: &str = "autoUpdate";
    pub const INSTALL_DIR: &str = "installDir";
    pub const LAST_BACKUP_PATH: &str = "lastBackupPath";
    pub const LAST_UPDATE_CHECK: &str = "lastUpdateCheck";
}

/// Keys that must never leave the agent or be written over the local API.
pub const PROTECTED_KEYS: [&str; 2] = [keys::SERVER_TOKEN, keys::LOCAL_API_TOKEN];

/// Persistent key/value map backing the agent's identity, credentials and
/// settings. Survives process restarts; every write is a single statement
/// (or a single transaction), so readers never observe partial updates.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key     TEXT PRIMARY KEY,
                value   TEXT NOT NULL
            )",
            (),
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key     TEXT PRIMARY KEY,
                value   TEXT NOT NULL
            )",
            (),
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;

        Ok(value)
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Ok(Some(v)) => v,
            _ => default.to_string(),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Ok(Some(v)) => matches!(v.as_str(), "true" | "1"),
            _ => default,
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            (key, value),
        )?;

        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;

        Ok(())
    }

    /// Every key/value pair currently in the store.
    pub fn all(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key, value FROM kv ORDER BY key")?;
        let rows = stmt.query_map((), |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row?);
        }
        Ok(pairs)
    }

    /// Stores the server-issued token and drops the temporary device token
    /// in one transaction. The two credentials are mutually exclusive, so a
    /// concurrent reader can never see both.
    pub fn set_server_token(&self, token: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            (keys::SERVER_TOKEN, token),
        )?;
        tx.execute("DELETE FROM kv WHERE key = ?1", [keys::TEMP_DEVICE_TOKEN])?;
        tx.commit()?;

        Ok(())
    }

    /// Stores a freshly generated device token, dropping any stale server
    /// token first. The inverse of [`set_server_token`](Self::set_server_token).
    pub fn set_device_token(&self, token: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            (keys::TEMP_DEVICE_TOKEN, token),
        )?;
        tx.execute("DELETE FROM kv WHERE key = ?1", [keys::SERVER_TOKEN])?;
        tx.commit()?;

        Ok(())
    }
}
