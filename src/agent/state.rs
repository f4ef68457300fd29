use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;

/// What the agent is busy with right now. Reported in heartbeats and on the
/// local API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Starting,
    Online,
    Scanning,
    Updating,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Online => "online",
            AgentStatus::Scanning => "scanning",
            AgentStatus::Updating => "updating",
        }
    }
}

/// Where the server session is. One instance per process, never persisted;
/// every start begins at `Disconnected`.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Online,
    Reconnecting {
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Online => "online",
            SessionState::Reconnecting { .. } => "reconnecting",
        }
    }
}

/// Shared mutable agent state, constructor-injected wherever it is needed.
/// Both fields are guarded so transitions are serialized.
pub struct AgentState {
    status: Mutex<AgentStatus>,
    session: Mutex<SessionState>,
}

impl AgentState {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(AgentStatus::Starting),
            session: Mutex::new(SessionState::Disconnected),
        }
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: AgentStatus) {
        let mut guard = self.status.lock().unwrap();
        if *guard != status {
            debug!("agent status: {} -> {}", guard.as_str(), status.as_str());
        }
        *guard = status;
    }

    pub fn session(&self) -> SessionState {
        self.session.lock().unwrap().clone()
    }

    pub fn set_session(&self, state: SessionState) {
        let mut guard = self.session.lock().unwrap();
        if *guard != state {
            debug!("session state: {} -> {}", guard.label(), state.label());
        }
        *guard = state;
    }

    pub fn is_session_online(&self) -> bool {
        matches!(*self.session.lock().unwrap(), SessionState::Online)
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}
