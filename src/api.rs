use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use log::{info, warn};
use serde_json::{json, Map, Value};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::agent::identity::AGENT_VERSION;
use crate::agent::runner::TaskRunner;
use crate::agent::scans::ScanKind;
use crate::agent::scheduler::Scheduler;
use crate::agent::state::AgentState;
use crate::error::Result;
use crate::store::{keys, Store, PROTECTED_KEYS};

/// Loopback status and control API for operators and local tooling.
/// Everything except `/health` requires the bearer token from the config
/// store, so only processes that can read the agent's files get in.
struct Api {
    store: Arc<Store>,
    state: Arc<AgentState>,
    runner: Arc<TaskRunner>,
    scheduler: Arc<Scheduler>,
}

pub async fn serve(
    port: u16,
    store: Arc<Store>,
    state: Arc<AgentState>,
    runner: Arc<TaskRunner>,
    scheduler: Arc<Scheduler>,
) -> Result<()> {
    let api = Arc::new(Api {
        store,
        state,
        runner,
        scheduler,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/info", get(agent_info))
        .route("/api/scan", post(start_scan))
        .route("/api/config", get(read_config).post(write_config))
        .with_state(api)
        .layer((
            TraceLayer::new_for_http(),
            TimeoutLayer::new(Duration::from_secs(10)),
        ));

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!(
        "local status API on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| format!("127.0.0.1:{}", port))
    );

    axum::serve(listener, app).await?;
    Ok(())
}

fn authorized(api: &Api, headers: &HeaderMap) -> bool {
    let expected = match api.store.get(keys::LOCAL_API_TOKEN) {
        Ok(Some(token)) => token,
        _ => return false,
    };

    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(header) => header
            .strip_prefix("Bearer ")
            .map(|t| t == expected)
            .unwrap_or(false),
        None => false,
    }
}

async fn health(State(api): State<Arc<Api>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": AGENT_VERSION,
        "agentStatus": api.state.status().as_str(),
    }))
}

async fn agent_info(
    State(api): State<Arc<Api>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    if !authorized(&api, &headers) {
        return unauthorized();
    }

    let agent_id = api.store.get_or(keys::AGENT_ID, "");
    let client_id = api.store.get(keys::CLIENT_ID).ok().flatten();
    let last_scan = api.store.get(keys::LAST_SCAN).ok().flatten();
    let last_update_check = api.store.get(keys::LAST_UPDATE_CHECK).ok().flatten();

    (
        StatusCode::OK,
        Json(json!({
            "agentId": agent_id,
            "clientId": client_id,
            "version": AGENT_VERSION,
            "agentStatus": api.state.status().as_str(),
            "session": api.state.session().label(),
            "lastScan": last_scan,
            "lastUpdateCheck": last_update_check,
        })),
    )
}

#[derive(serde::Deserialize, Default)]
struct ScanRequest {
    #[serde(default, rename = "type")]
    scan_type: Option<String>,
}

async fn start_scan(
    State(api): State<Arc<Api>>,
    headers: HeaderMap,
    body: Option<Json<ScanRequest>>,
) -> (StatusCode, Json<Value>) {
    if !authorized(&api, &headers) {
        return unauthorized();
    }

    let request = body.map(|Json(r)| r).unwrap_or_default();
    let kind = match request.scan_type.as_deref() {
        Some(raw) => match ScanKind::from_str(raw) {
            Ok(kind) => kind,
            Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))),
        },
        None => ScanKind::Quick,
    };

    if api.runner.is_busy() {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "a scan is already running" })),
        );
    }

    let scan_id = Uuid::new_v4().to_string();
    info!("local API triggered a {} scan ({})", kind.as_str(), scan_id);

    let runner = Arc::clone(&api.runner);
    let id = scan_id.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.run_scan(kind, Some(id)).await {
            warn!("locally triggered scan did not run: {}", e);
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "scanId": scan_id, "type": kind.as_str() })),
    )
}

async fn read_config(
    State(api): State<Arc<Api>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    if !authorized(&api, &headers) {
        return unauthorized();
    }

    let mut out = Map::new();
    match api.store.all() {
        Ok(pairs) => {
            for (key, value) in pairs {
                // Credentials never leave the process.
                if PROTECTED_KEYS.contains(&key.as_str()) || key == keys::TEMP_DEVICE_TOKEN {
                    continue;
                }
                out.insert(key, Value::String(value));
            }
            (StatusCode::OK, Json(Value::Object(out)))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn write_config(
    State(api): State<Arc<Api>>,
    headers: HeaderMap,
    Json(values): Json<Map<String, Value>>,
) -> (StatusCode, Json<Value>) {
    if !authorized(&api, &headers) {
        return unauthorized();
    }

    for key in values.keys() {
        if PROTECTED_KEYS.contains(&key.as_str()) || key == keys::TEMP_DEVICE_TOKEN {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("'{}' cannot be set through this API", key) })),
            );
        }
    }

    for (key, value) in &values {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let result = if key == keys::SCAN_INTERVAL {
            api.scheduler.reschedule(&value)
        } else {
            api.store.set(key, &value)
        };

        if let Err(e) = result {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("'{}': {}", key, e) })),
            );
        }
    }

    (StatusCode::OK, Json(json!({ "updated": values.len() })))
}

fn unauthorized() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "missing or invalid token" })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::scans::{HostProbes, ScanProbes};
    use crate::agent::session::SessionHandle;

    fn api_fixture(dir: &std::path::Path) -> Arc<Api> {
        let state = Arc::new(AgentState::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let session = SessionHandle::detached(Arc::clone(&state));

        let probes: Arc<dyn ScanProbes> = Arc::new(HostProbes);
        let runner = Arc::new(TaskRunner::new(
            Arc::clone(&state),
            Arc::clone(&store),
            session.clone(),
            probes,
            dir.join("reports"),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&runner),
            session,
        ));

        Arc::new(Api {
            store,
            state,
            runner,
            scheduler,
        })
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {}", token).parse().unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn health_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let api = api_fixture(dir.path());

        let Json(body) = health(State(api)).await;
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["version"], json!(AGENT_VERSION));
    }

    #[tokio::test]
    async fn info_requires_the_token() {
        let dir = tempfile::tempdir().unwrap();
        let api = api_fixture(dir.path());
        api.store.set(keys::LOCAL_API_TOKEN, "secret").unwrap();

        let (status, _) = agent_info(State(Arc::clone(&api)), HeaderMap::new()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = agent_info(State(Arc::clone(&api)), bearer("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, Json(body)) = agent_info(State(api), bearer("secret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], json!(AGENT_VERSION));
    }

    #[tokio::test]
    async fn config_read_redacts_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let api = api_fixture(dir.path());
        api.store.set(keys::LOCAL_API_TOKEN, "secret").unwrap();
        api.store.set_server_token("srv-token").unwrap();
        api.store.set(keys::SERVER_URL, "http://fleet.example").unwrap();

        let (status, Json(body)) = read_config(State(api), bearer("secret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[keys::SERVER_URL], json!("http://fleet.example"));
        assert!(body.get(keys::SERVER_TOKEN).is_none());
        assert!(body.get(keys::LOCAL_API_TOKEN).is_none());
    }

    #[tokio::test]
    async fn config_write_rejects_protected_keys() {
        let dir = tempfile::tempdir().unwrap();
        let api = api_fixture(dir.path());
        api.store.set(keys::LOCAL_API_TOKEN, "secret").unwrap();

        let mut values = Map::new();
        values.insert(keys::SERVER_TOKEN.to_string(), json!("hijacked"));

        let (status, _) =
            write_config(State(Arc::clone(&api)), bearer("secret"), Json(values)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(api.store.get(keys::SERVER_TOKEN).unwrap().is_none());
    }

    #[tokio::test]
    async fn config_write_persists_plain_keys() {
        let dir = tempfile::tempdir().unwrap();
        let api = api_fixture(dir.path());
        api.store.set(keys::LOCAL_API_TOKEN, "secret").unwrap();

        let mut values = Map::new();
        values.insert(keys::AUTO_UPDATE.to_string(), json!("false"));

        let (status, Json(body)) =
            write_config(State(Arc::clone(&api)), bearer("secret"), Json(values)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updated"], json!(1));
        assert_eq!(api.store.get_or(keys::AUTO_UPDATE, ""), "false");
    }

    #[tokio::test]
    async fn bad_scan_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let api = api_fixture(dir.path());
        api.store.set(keys::LOCAL_API_TOKEN, "secret").unwrap();

        let (status, _) = start_scan(
            State(api),
            bearer("secret"),
            Some(Json(ScanRequest {
                scan_type: Some("bogus".to_string()),
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
