use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::config::DEFAULT_SERVER_URL;
use crate::error::{AgentError, Result};
use crate::store::{keys, Store};

use super::dispatch::Dispatcher;
use super::identity::{self, AgentIdentity};
use super::messages::{Envelope, ServerCommand};
use super::state::{AgentState, AgentStatus, SessionState};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const RECONNECT_BASE: Duration = Duration::from_secs(10);
pub const RECONNECT_CAP: Duration = Duration::from_secs(60);
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Out-of-band instructions for the session loop.
#[derive(Clone, Debug)]
pub enum ControlMsg {
    /// Drop the current connection (if any) and connect again immediately,
    /// e.g. after the server address changed.
    Reconnect,
    /// Send a shutdown notice, close, and suppress reconnection.
    Shutdown(String),
}

/// Cheap handle other components use to send messages over the session.
/// The sender slot is only populated while the session is online, so nothing
/// is ever buffered across a reconnect: callers re-derive state instead.
#[derive(Clone)]
pub struct SessionHandle {
    slot: Arc<Mutex<Option<mpsc::UnboundedSender<Envelope>>>>,
    state: Arc<AgentState>,
}

impl SessionHandle {
    pub fn detached(state: Arc<AgentState>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            state,
        }
    }

    pub fn send(&self, envelope: Envelope) -> Result<()> {
        let slot = self.slot.lock().unwrap();
        match slot.as_ref() {
            Some(tx) if self.state.is_session_online() => {
                tx.send(envelope).map_err(|_| AgentError::NotOnline)
            }
            _ => Err(AgentError::NotOnline),
        }
    }

    fn attach(&self, tx: mpsc::UnboundedSender<Envelope>) {
        *self.slot.lock().unwrap() = Some(tx);
    }

    fn detach(&self) {
        *self.slot.lock().unwrap() = None;
    }

    /// Attaches a fresh channel and hands back the receiving end so tests
    /// can observe outbound traffic without a live connection.
    #[cfg(test)]
    pub(crate) fn attach_for_tests(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach(tx);
        rx
    }
}

/// Derives the session endpoint from the configured server address.
pub fn ws_url(server_url: &str) -> Result<String> {
    let mut url = Url::parse(server_url)
        .map_err(|e| AgentError::Transport(format!("invalid server url '{}': {}", server_url, e)))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| AgentError::Transport(format!("invalid server url '{}'", server_url)))?;
    url.set_path("/ws/agent");

    Ok(url.to_string())
}

/// Capped exponential backoff: 10s doubling up to 60s.
pub fn next_backoff(current: Duration) -> Duration {
    std::cmp::min(current * 2, RECONNECT_CAP)
}

enum SessionExit {
    /// Transport dropped or auth failed; retry with backoff.
    Dropped { was_online: bool },
    /// Reconnect was requested; retry immediately.
    Reconnect,
    /// Shutdown was requested; do not retry.
    Shutdown,
}

enum Inbound {
    Continue,
    AuthFailed,
}

/// Owns the single long-lived connection to the server: connect,
/// authenticate, heartbeat, receive commands, reconnect forever. Transport
/// errors never terminate the process.
pub struct SessionManager {
    store: Arc<Store>,
    identity: AgentIdentity,
    state: Arc<AgentState>,
    handle: SessionHandle,
    dispatcher: Arc<Dispatcher>,
    control_rx: mpsc::UnboundedReceiver<ControlMsg>,
}

impl SessionManager {
    pub fn new(
        store: Arc<Store>,
        identity: AgentIdentity,
        state: Arc<AgentState>,
        handle: SessionHandle,
        dispatcher: Arc<Dispatcher>,
        control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    ) -> Self {
        Self {
            store,
            identity,
            state,
            handle,
            dispatcher,
            control_rx,
        }
    }

    pub async fn run(mut self) {
        let mut backoff = RECONNECT_BASE;
        let mut attempt: u32 = 0;

        loop {
            self.state.set_session(SessionState::Connecting);

            let exit = match self.connect_once().await {
                Ok(exit) => exit,
                Err(e) => {
                    warn!("session connection failed: {}", e);
                    SessionExit::Dropped { was_online: false }
                }
            };
            self.handle.detach();

            match exit {
                SessionExit::Shutdown => break,
                SessionExit::Reconnect => {
                    backoff = RECONNECT_BASE;
                    attempt = 0;
                    continue;
                }
                SessionExit::Dropped { was_online } => {
                    if was_online {
                        // A session that made it online resets the backoff.
                        backoff = RECONNECT_BASE;
                        attempt = 0;
                    }
                }
            }

            attempt += 1;
            let next_retry_at = Utc::now()
                + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(10));
            self.state.set_session(SessionState::Reconnecting {
                attempt,
                next_retry_at,
            });
            info!(
                "reconnecting in {}s (attempt {})",
                backoff.as_secs(),
                attempt
            );

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                ctrl = self.control_rx.recv() => match ctrl {
                    Some(ControlMsg::Reconnect) => {
                        backoff = RECONNECT_BASE;
                        attempt = 0;
                        continue;
                    }
                    Some(ControlMsg::Shutdown(reason)) => {
                        debug!("shutdown while waiting to reconnect: {}", reason);
                        break;
                    }
                    None => break,
                },
            }
            backoff = next_backoff(backoff);
        }

        self.state.set_session(SessionState::Disconnected);
        info!("session loop stopped");
    }

    async fn connect_once(&mut self) -> Result<SessionExit> {
        let server_url = self.store.get_or(keys::SERVER_URL, DEFAULT_SERVER_URL);
        let endpoint = ws_url(&server_url)?;

        debug!("connecting to {}", endpoint);
        let (ws_stream, _) = connect_async(&endpoint)
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        let (mut sender, mut receiver) = ws_stream.split();

        // Authenticate first; the server says nothing else until then.
        self.state.set_session(SessionState::Authenticating);
        let token = identity::auth_token(&self.store)?;
        let client_id = self.store.get(keys::CLIENT_ID)?;
        let auth = Envelope::auth(&self.identity, client_id.as_deref(), &token);
        sender
            .send(Message::Text(serde_json::to_string(&auth)?))
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.reset();

        // A server that accepts the socket but never answers the auth
        // message must not stall the session forever.
        let auth_deadline = tokio::time::sleep(AUTH_TIMEOUT);
        tokio::pin!(auth_deadline);

        let mut online = false;

        loop {
            tokio::select! {
                _ = &mut auth_deadline, if !online => {
                    warn!(
                        "no auth response within {}s, dropping connection",
                        AUTH_TIMEOUT.as_secs()
                    );
                    let _ = sender.send(Message::Close(None)).await;
                    return Ok(SessionExit::Dropped { was_online: false });
                }

                _ = heartbeat.tick() => {
                    if !online {
                        continue;
                    }
                    let hb = Envelope::heartbeat(self.state.status());
                    let text = serde_json::to_string(&hb)?;
                    if let Err(e) = sender.send(Message::Text(text)).await {
                        // Any heartbeat failure is a disconnect.
                        warn!("heartbeat failed: {}", e);
                        return Ok(SessionExit::Dropped { was_online: online });
                    }
                }

                Some(envelope) = rx.recv() => {
                    let text = serde_json::to_string(&envelope)?;
                    if let Err(e) = sender.send(Message::Text(text)).await {
                        warn!("send failed ({}): {}", envelope.msg_type, e);
                        return Ok(SessionExit::Dropped { was_online: online });
                    }
                }

                ctrl = self.control_rx.recv() => match ctrl {
                    Some(ControlMsg::Reconnect) => {
                        info!("reconnect requested, dropping current session");
                        let _ = sender.send(Message::Close(None)).await;
                        return Ok(SessionExit::Reconnect);
                    }
                    Some(ControlMsg::Shutdown(reason)) => {
                        info!("shutting down session: {}", reason);
                        let notice = Envelope::shutdown(&reason);
                        if let Ok(text) = serde_json::to_string(&notice) {
                            let _ = sender.send(Message::Text(text)).await;
                        }
                        let _ = sender.send(Message::Close(None)).await;
                        return Ok(SessionExit::Shutdown);
                    }
                    None => return Ok(SessionExit::Shutdown),
                },

                msg = receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match self.handle_text(&text, &tx).await {
                            Inbound::Continue => {
                                online = self.state.is_session_online();
                            }
                            Inbound::AuthFailed => {
                                return Ok(SessionExit::Dropped { was_online: false });
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("server closed the connection");
                        return Ok(SessionExit::Dropped { was_online: online });
                    }
                    Some(Err(e)) => {
                        warn!("transport error: {}", e);
                        return Ok(SessionExit::Dropped { was_online: online });
                    }
                    None => {
                        warn!("transport stream ended");
                        return Ok(SessionExit::Dropped { was_online: online });
                    }
                    _ => {}
                },
            }
        }
    }

    /// Decodes one inbound message. Malformed messages are logged and
    /// dropped; they never take the session down.
    async fn handle_text(&self, text: &str, tx: &mpsc::UnboundedSender<Envelope>) -> Inbound {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                warn!("dropping malformed message: {}", e);
                return Inbound::Continue;
            }
        };

        let command = match ServerCommand::decode(envelope) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("dropping undecodable command: {}", e);
                return Inbound::Continue;
            }
        };

        match command {
            ServerCommand::AuthResponse(auth) => self.handle_auth(auth, tx),
            other => {
                self.dispatcher.dispatch(other).await;
                Inbound::Continue
            }
        }
    }

    fn handle_auth(
        &self,
        auth: super::messages::AuthResponse,
        tx: &mpsc::UnboundedSender<Envelope>,
    ) -> Inbound {
        if auth.success {
            if let Some(token) = auth.token.as_deref() {
                if let Err(e) = self.store.set_server_token(token) {
                    error!("unable to persist server token: {}", e);
                }
            }
            if let Some(client_id) = auth.client_id.as_deref() {
                if let Err(e) = self.store.set(keys::CLIENT_ID, client_id) {
                    error!("unable to persist client id: {}", e);
                }
            }
            if let Err(e) = self.store.set(keys::SETUP_COMPLETE, "true") {
                error!("unable to persist setup flag: {}", e);
            }

            self.handle.attach(tx.clone());
            self.state.set_session(SessionState::Online);
            if self.state.status() == AgentStatus::Starting {
                self.state.set_status(AgentStatus::Online);
            }
            info!("authenticated, session online");

            // Re-derive and announce current status right away; there is no
            // backlog to replay after a reconnect.
            let _ = tx.send(Envelope::heartbeat(self.state.status()));

            Inbound::Continue
        } else {
            let reason = auth.message.as_deref().unwrap_or("unspecified").to_string();
            warn!("authentication failed: {}", reason);

            if auth.token_rejected() {
                // Force fresh device-token auth on the next attempt.
                if let Err(e) = self.store.delete(keys::SERVER_TOKEN) {
                    error!("unable to delete rejected token: {}", e);
                }
            }

            Inbound::AuthFailed
        }
    }

}
