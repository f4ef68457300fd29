use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::identity::AgentIdentity;
use super::state::AgentStatus;

/// Every message on the session, in either direction, is one JSON envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(msg_type: &str, data: Value) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn auth(identity: &AgentIdentity, client_id: Option<&str>, token: &str) -> Self {
        Self::new(
            "auth",
            json!({
                "agentId": identity.agent_id,
                "clientId": client_id,
                "hostname": identity.hostname,
                "platform": identity.platform,
                "arch": identity.arch,
                "version": identity.version,
                "token": token,
            }),
        )
    }

    pub fn heartbeat(status: AgentStatus) -> Self {
        Self::new(
            "heartbeat",
            json!({
                "status": status.as_str(),
                "timestamp": Utc::now(),
            }),
        )
    }

    pub fn scan_start(scan_id: &str, scan_type: &str) -> Self {
        Self::new(
            "scan_start",
            json!({ "scanId": scan_id, "type": scan_type }),
        )
    }

    pub fn scan_complete(scan_id: &str, success: bool, payload: Value) -> Self {
        let mut data = json!({ "scanId": scan_id, "success": success });
        let field = if success { "results" } else { "error" };
        data[field] = payload;
        Self::new("scan_complete", data)
    }

    pub fn config_update_ack(success: bool) -> Self {
        Self::new("config_update_ack", json!({ "success": success }))
    }

    pub fn update_complete(success: bool, detail: Value) -> Self {
        let mut data = json!({ "success": success });
        let field = if success { "version" } else { "error" };
        data[field] = detail;
        Self::new("update_complete", data)
    }

    pub fn reboot_ack() -> Self {
        Self::new("reboot_ack", json!({}))
    }

    pub fn shutdown(reason: &str) -> Self {
        Self::new("shutdown", json!({ "reason": reason }))
    }

    pub fn error(message: &str) -> Self {
        Self::new("error", json!({ "message": message }))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, rename = "clientId")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl AuthResponse {
    /// Whether the failure reason means our persisted token is no good and
    /// should be thrown away before the next attempt.
    pub fn token_rejected(&self) -> bool {
        !self.success
            && self
                .message
                .as_deref()
                .map(|m| m.to_lowercase().contains("token"))
                .unwrap_or(false)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RunScan {
    #[serde(default, rename = "scanId")]
    pub scan_id: Option<String>,
    #[serde(default, rename = "type")]
    pub scan_type: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpdateAgent {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub restart: bool,
}

/// A server-to-agent command, decoded once at the session boundary and then
/// routed by exhaustive match.
#[derive(Clone, Debug)]
pub enum ServerCommand {
    AuthResponse(AuthResponse),
    ConfigUpdate(Map<String, Value>),
    RunScan(RunScan),
    UpdateAgent(UpdateAgent),
    Reboot,
    /// Unrecognized types are ignored, not protocol errors.
    Unknown(String),
}

impl ServerCommand {
    pub fn decode(envelope: Envelope) -> Result<ServerCommand, serde_json::Error> {
        let cmd = match envelope.msg_type.as_str() {
            "auth_response" => ServerCommand::AuthResponse(serde_json::from_value(envelope.data)?),
            "config_update" => {
                let values = match envelope.data {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                ServerCommand::ConfigUpdate(values)
            }
            "run_scan" => ServerCommand::RunScan(serde_json::from_value(envelope.data)?),
            "update_agent" => ServerCommand::UpdateAgent(serde_json::from_value(envelope.data)?),
            "reboot" => ServerCommand::Reboot,
            other => ServerCommand::Unknown(other.to_string()),
        };

        Ok(cmd)
    }
}
