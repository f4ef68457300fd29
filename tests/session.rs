use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use fleetmon::agent::dispatch::Dispatcher;
use fleetmon::agent::identity::AgentIdentity;
use fleetmon::agent::runner::TaskRunner;
use fleetmon::agent::scans::{HostProbes, ScanProbes};
use fleetmon::agent::scheduler::Scheduler;
use fleetmon::agent::session::{ControlMsg, SessionHandle, SessionManager};
use fleetmon::agent::state::{AgentState, SessionState};
use fleetmon::agent::update::UpdateManager;
use fleetmon::config::Config;
use fleetmon::store::{keys, Store};
use fleetmon::utils::random;

/// Scripted server side of the session: replies to `auth` with a canned
/// response, optionally pushes more envelopes afterwards, and forwards
/// every message the agent sends into a channel for assertions.
struct Script {
    auth_reply: Value,
    after_auth: Vec<Value>,
    seen: mpsc::UnboundedSender<Value>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(script): State<Arc<Script>>) -> Response {
    ws.on_upgrade(move |socket| handle_session(socket, script))
}

async fn handle_session(mut socket: WebSocket, script: Arc<Script>) {
    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return,
            _ => continue,
        };

        let value: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let _ = script.seen.send(value.clone());

        if value["type"] == json!("auth") {
            let reply = json!({
                "type": "auth_response",
                "data": script.auth_reply,
                "timestamp": Utc::now(),
            });
            if socket.send(Message::Text(reply.to_string())).await.is_err() {
                return;
            }

            if script.auth_reply["success"] == json!(true) {
                for envelope in &script.after_auth {
                    if socket
                        .send(Message::Text(envelope.to_string()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }
}

async fn start_server(script: Script) -> SocketAddr {
    start_server_on("127.0.0.1:0", script).await
}

async fn start_server_on(addr: &str, script: Script) -> SocketAddr {
    let app = Router::new()
        .route("/ws/agent", get(ws_handler))
        .with_state(Arc::new(script));

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Server that accepts the connection and reads messages but never says
/// anything back.
async fn start_silent_server() -> SocketAddr {
    async fn handler(ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(|mut socket| async move {
            while socket.recv().await.is_some() {}
        })
    }

    let app = Router::new().route("/ws/agent", get(handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct Agent {
    store: Arc<Store>,
    state: Arc<AgentState>,
    control: mpsc::UnboundedSender<ControlMsg>,
    session: JoinHandle<()>,
}

/// Full component graph minus the local API, pointed at the scripted server.
fn spawn_agent(dir: &std::path::Path, server: SocketAddr, store: Arc<Store>) -> Agent {
    let config = Config {
        app_dir: dir.to_path_buf(),
        local_api_port: 0,
    };
    config.mkdirs().unwrap();

    store
        .set(keys::SERVER_URL, &format!("http://{}", server))
        .unwrap();

    let identity = AgentIdentity::load_or_create(&store).unwrap();
    let state = Arc::new(AgentState::new());
    let handle = SessionHandle::detached(Arc::clone(&state));
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let probes: Arc<dyn ScanProbes> = Arc::new(HostProbes);
    let runner = Arc::new(TaskRunner::new(
        Arc::clone(&state),
        Arc::clone(&store),
        handle.clone(),
        probes,
        config.reports_dir(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&runner),
        handle.clone(),
    ));
    let updater = Arc::new(
        UpdateManager::new(config.clone(), Arc::clone(&store), Arc::clone(&state)).unwrap(),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        runner,
        scheduler,
        updater,
        handle.clone(),
        control_tx.clone(),
    ));

    let manager = SessionManager::new(
        Arc::clone(&store),
        identity,
        Arc::clone(&state),
        handle,
        dispatcher,
        control_rx,
    );
    let session = tokio::spawn(manager.run());

    Agent {
        store,
        state,
        control: control_tx,
        session,
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    wait_until_for(cond, Duration::from_secs(5), what).await;
}

async fn wait_until_for<F: Fn() -> bool>(cond: F, limit: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + limit;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn next_of_type(rx: &mut mpsc::UnboundedReceiver<Value>, msg_type: &str) -> Value {
    let deadline = Duration::from_secs(5);
    loop {
        match tokio::time::timeout(deadline, rx.recv()).await {
            Ok(Some(value)) if value["type"] == json!(msg_type) => return value,
            Ok(Some(_)) => continue,
            _ => panic!("no '{}' message arrived", msg_type),
        }
    }
}

#[tokio::test]
async fn first_contact_authenticates_with_a_device_token() {
    let dir = tempfile::tempdir().unwrap();
    let (seen_tx, mut seen) = mpsc::unbounded_channel();

    let addr = start_server(Script {
        auth_reply: json!({ "success": true, "token": "T", "clientId": "c-1" }),
        after_auth: vec![],
        seen: seen_tx,
    })
    .await;

    let store = Arc::new(Store::open_in_memory().unwrap());
    let agent = spawn_agent(dir.path(), addr, store);

    let auth = next_of_type(&mut seen, "auth").await;
    let token = auth["data"]["token"].as_str().unwrap();
    assert_eq!(token.len(), random::DEVICE_TOKEN_LEN);

    wait_until(|| agent.state.is_session_online(), "session online").await;

    // Server-issued credentials replace the throwaway device token.
    assert_eq!(
        agent.store.get(keys::SERVER_TOKEN).unwrap().as_deref(),
        Some("T")
    );
    assert_eq!(
        agent.store.get(keys::CLIENT_ID).unwrap().as_deref(),
        Some("c-1")
    );
    assert!(agent
        .store
        .get(keys::TEMP_DEVICE_TOKEN)
        .unwrap()
        .is_none());
    assert_eq!(agent.store.get_or(keys::SETUP_COMPLETE, ""), "true");

    // The first heartbeat goes out as soon as the session is online.
    next_of_type(&mut seen, "heartbeat").await;

    agent
        .control
        .send(ControlMsg::Shutdown("test over".to_string()))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), agent.session)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(agent.state.session(), SessionState::Disconnected);
}

#[tokio::test]
async fn rejected_token_is_discarded_before_the_next_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let (seen_tx, mut seen) = mpsc::unbounded_channel();

    let addr = start_server(Script {
        auth_reply: json!({ "success": false, "message": "Invalid token" }),
        after_auth: vec![],
        seen: seen_tx,
    })
    .await;

    let store = Arc::new(Store::open_in_memory().unwrap());
    store.set_server_token("STALE").unwrap();
    let agent = spawn_agent(dir.path(), addr, store);

    let auth = next_of_type(&mut seen, "auth").await;
    assert_eq!(auth["data"]["token"], json!("STALE"));

    let store = Arc::clone(&agent.store);
    wait_until(
        move || store.get(keys::SERVER_TOKEN).unwrap().is_none(),
        "stale token deletion",
    )
    .await;
    assert!(!agent.state.is_session_online());

    agent
        .control
        .send(ControlMsg::Shutdown("test over".to_string()))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), agent.session)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn reconnect_converges_once_the_server_comes_up() {
    let dir = tempfile::tempdir().unwrap();
    let (seen_tx, mut seen) = mpsc::unbounded_channel();

    // Reserve a port, then leave it closed so the first attempt is refused.
    let addr = {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap()
    };

    let store = Arc::new(Store::open_in_memory().unwrap());
    let agent = spawn_agent(dir.path(), addr, store);

    {
        let state = Arc::clone(&agent.state);
        wait_until(
            move || matches!(state.session(), SessionState::Reconnecting { .. }),
            "first failed attempt",
        )
        .await;
    }

    start_server_on(
        &addr.to_string(),
        Script {
            auth_reply: json!({ "success": true, "token": "T", "clientId": "c-1" }),
            after_auth: vec![],
            seen: seen_tx,
        },
    )
    .await;
    agent.control.send(ControlMsg::Reconnect).unwrap();

    wait_until(|| agent.state.is_session_online(), "session online").await;

    // Exactly one authentication round happened against the live server.
    next_of_type(&mut seen, "auth").await;
    agent
        .control
        .send(ControlMsg::Shutdown("test over".to_string()))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), agent.session)
        .await
        .unwrap()
        .unwrap();

    let mut auths = 0;
    while let Ok(msg) = seen.try_recv() {
        if msg["type"] == json!("auth") {
            auths += 1;
        }
    }
    assert_eq!(auths, 0, "no second auth round after convergence");
}

#[tokio::test]
async fn silent_server_does_not_stall_authentication() {
    let dir = tempfile::tempdir().unwrap();

    let addr = start_silent_server().await;
    let store = Arc::new(Store::open_in_memory().unwrap());
    let agent = spawn_agent(dir.path(), addr, store);

    // The auth deadline drops the connection and the retry loop takes over.
    {
        let state = Arc::clone(&agent.state);
        wait_until_for(
            move || matches!(state.session(), SessionState::Reconnecting { .. }),
            fleetmon::agent::session::AUTH_TIMEOUT + Duration::from_secs(5),
            "auth deadline to fire",
        )
        .await;
    }
    assert!(!agent.state.is_session_online());

    agent
        .control
        .send(ControlMsg::Shutdown("test over".to_string()))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), agent.session)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn config_update_is_applied_and_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    let (seen_tx, mut seen) = mpsc::unbounded_channel();

    let addr = start_server(Script {
        auth_reply: json!({ "success": true, "token": "T", "clientId": "c-1" }),
        after_auth: vec![json!({
            "type": "config_update",
            "data": { "autoUpdate": "false" },
            "timestamp": Utc::now(),
        })],
        seen: seen_tx,
    })
    .await;

    let store = Arc::new(Store::open_in_memory().unwrap());
    let agent = spawn_agent(dir.path(), addr, store);

    let ack = next_of_type(&mut seen, "config_update_ack").await;
    assert_eq!(ack["data"]["success"], json!(true));
    assert_eq!(agent.store.get_or(keys::AUTO_UPDATE, ""), "false");

    agent
        .control
        .send(ControlMsg::Shutdown("test over".to_string()))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), agent.session)
        .await
        .unwrap()
        .unwrap();
}
