use std::process::Command;

use uuid::Uuid;

use crate::error::Result;
use crate::store::{keys, Store};
use crate::utils::random;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Who this agent is. `agent_id` is generated once and persisted forever;
/// the remaining fields are collected from the host at startup. The operator
/// assigned `client_id` lives in the store because the server may update it.
#[derive(Clone, Debug)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub hostname: String,
    pub platform: String,
    pub arch: String,
    pub version: String,
}

impl AgentIdentity {
    pub fn load_or_create(store: &Store) -> Result<Self> {
        let agent_id = match store.get(keys::AGENT_ID)? {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                store.set(keys::AGENT_ID, &id)?;
                id
            }
        };

        Ok(Self {
            agent_id,
            hostname: hostname(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: AGENT_VERSION.to_string(),
        })
    }
}

fn hostname() -> String {
    match Command::new("hostname").output() {
        Ok(out) => match String::from_utf8(out.stdout) {
            Ok(h) if !h.trim().is_empty() => h.trim().to_string(),
            _ => String::from("unknown"),
        },
        _ => String::from("unknown"),
    }
}

/// Makes sure the loopback API has a bearer token to check against.
pub fn ensure_local_api_token(store: &Store) -> Result<String> {
    if let Some(token) = store.get(keys::LOCAL_API_TOKEN)? {
        return Ok(token);
    }

    let token = random::local_api_token();
    store.set(keys::LOCAL_API_TOKEN, &token)?;
    Ok(token)
}

/// Credential for the next auth attempt: the server-issued token when we
/// have one, otherwise a freshly generated device token. The device token
/// write atomically evicts any stale server token, so the two are never
/// both present.
pub fn auth_token(store: &Store) -> Result<String> {
    if let Some(token) = store.get(keys::SERVER_TOKEN)? {
        return Ok(token);
    }

    let token = random::device_token();
    store.set_device_token(&token)?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_is_stable_across_loads() {
        let store = Store::open_in_memory().unwrap();

        let first = AgentIdentity::load_or_create(&store).unwrap();
        let second = AgentIdentity::load_or_create(&store).unwrap();

        assert_eq!(first.agent_id, second.agent_id);
        assert!(!first.agent_id.is_empty());
    }

    #[test]
    fn auth_token_prefers_server_token() {
        let store = Store::open_in_memory().unwrap();

        store.set_server_token("srv").unwrap();
        assert_eq!(auth_token(&store).unwrap(), "srv");
        assert!(store.get(keys::TEMP_DEVICE_TOKEN).unwrap().is_none());
    }

    #[test]
    fn auth_token_generates_device_token_when_missing() {
        let store = Store::open_in_memory().unwrap();

        let token = auth_token(&store).unwrap();
        assert_eq!(token.len(), random::DEVICE_TOKEN_LEN);
        assert_eq!(
            store.get(keys::TEMP_DEVICE_TOKEN).unwrap().as_deref(),
            Some(token.as_str())
        );
        assert!(store.get(keys::SERVER_TOKEN).unwrap().is_none());
    }

    #[test]
    fn local_api_token_is_created_once() {
        let store = Store::open_in_memory().unwrap();

        let first = ensure_local_api_token(&store).unwrap();
        let second = ensure_local_api_token(&store).unwrap();
        assert_eq!(first, second);
    }
}
