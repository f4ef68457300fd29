use std::str::FromStr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::AgentError;
use crate::store::{keys, Store};

use super::messages::{Envelope, RunScan, ServerCommand, UpdateAgent};
use super::runner::TaskRunner;
use super::scans::ScanKind;
use super::scheduler::Scheduler;
use super::session::{ControlMsg, SessionHandle};
use super::update::{UpdateManager, RESTART_GRACE};

/// Routes decoded server commands to the task runner, the scheduler, or the
/// update manager, and sends the correlated response back over the session.
/// Holds no state of its own. Downstream errors never escape to the session
/// loop; they become failure payloads in the response.
pub struct Dispatcher {
    store: Arc<Store>,
    runner: Arc<TaskRunner>,
    scheduler: Arc<Scheduler>,
    updater: Arc<UpdateManager>,
    session: SessionHandle,
    control: mpsc::UnboundedSender<ControlMsg>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        runner: Arc<TaskRunner>,
        scheduler: Arc<Scheduler>,
        updater: Arc<UpdateManager>,
        session: SessionHandle,
        control: mpsc::UnboundedSender<ControlMsg>,
    ) -> Self {
        Self {
            store,
            runner,
            scheduler,
            updater,
            session,
            control,
        }
    }

    pub async fn dispatch(&self, command: ServerCommand) {
        match command {
            // Credential updates are handled where the auth state machine
            // lives; nothing to do here.
            ServerCommand::AuthResponse(_) => {
                debug!("auth_response outside the auth flow, ignoring")
            }
            ServerCommand::ConfigUpdate(values) => self.handle_config_update(values),
            ServerCommand::RunScan(cmd) => self.handle_run_scan(cmd),
            ServerCommand::UpdateAgent(cmd) => self.handle_update_agent(cmd),
            ServerCommand::Reboot => self.handle_reboot(),
            ServerCommand::Unknown(msg_type) => {
                info!("ignoring unrecognized command '{}'", msg_type);
            }
        }
    }

    fn handle_config_update(&self, values: Map<String, Value>) {
        let mut success = true;

        for (key, value) in &values {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };

            match key.as_str() {
                keys::SCAN_INTERVAL => {
                    // reschedule persists the expression itself.
                    if let Err(e) = self.scheduler.reschedule(&value) {
                        warn!("rejected scan interval from server: {}", e);
                        success = false;
                    }
                }
                keys::SERVER_URL => {
                    let changed = self
                        .store
                        .get(keys::SERVER_URL)
                        .ok()
                        .flatten()
                        .as_deref()
                        != Some(value.as_str());

                    if let Err(e) = self.store.set(keys::SERVER_URL, &value) {
                        error!("unable to persist server url: {}", e);
                        success = false;
                    } else if changed {
                        info!("server url changed, forcing reconnect");
                        let _ = self.control.send(ControlMsg::Reconnect);
                    }
                }
                _ => {
                    if let Err(e) = self.store.set(key, &value) {
                        error!("unable to persist config key '{}': {}", key, e);
                        success = false;
                    }
                }
            }
        }

        let _ = self.session.send(Envelope::config_update_ack(success));
    }

    fn handle_run_scan(&self, cmd: RunScan) {
        let scan_id = cmd
            .scan_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let kind = match cmd.scan_type.as_deref() {
            Some(raw) => match ScanKind::from_str(raw) {
                Ok(kind) => kind,
                Err(e) => {
                    let _ = self
                        .session
                        .send(Envelope::scan_complete(&scan_id, false, json!(e)));
                    return;
                }
            },
            None => ScanKind::Quick,
        };

        let runner = Arc::clone(&self.runner);
        let session = self.session.clone();
        let task = tokio::spawn(async move {
            match runner.run_scan(kind, Some(scan_id.clone())).await {
                Ok(report) => {
                    let payload = if report.success {
                        report.results.unwrap_or_default()
                    } else {
                        json!(report.error.unwrap_or_default())
                    };
                    let _ = session.send(Envelope::scan_complete(
                        &report.scan_id,
                        report.success,
                        payload,
                    ));
                }
                Err(AgentError::AlreadyScanning) => {
                    let _ = session.send(Envelope::scan_complete(
                        &scan_id,
                        false,
                        json!("a scan is already running"),
                    ));
                }
                Err(e) => {
                    let _ = session.send(Envelope::scan_complete(
                        &scan_id,
                        false,
                        json!(e.to_string()),
                    ));
                }
            }
        });
        super::supervise("scan command", self.session.clone(), task);
    }

    fn handle_update_agent(&self, cmd: UpdateAgent) {
        let updater = Arc::clone(&self.updater);
        let session = self.session.clone();

        let task = tokio::spawn(async move {
            match updater.update(cmd.version).await {
                Ok(version) => {
                    let _ = session.send(Envelope::update_complete(true, json!(version)));
                    if cmd.restart {
                        info!("restart requested, exiting for supervisor restart");
                        tokio::time::sleep(RESTART_GRACE).await;
                        std::process::exit(0);
                    }
                }
                Err(e) => {
                    if matches!(e, AgentError::RollbackFailed { .. }) {
                        error!("{}", e);
                    }
                    let _ = session.send(Envelope::update_complete(false, json!(e.to_string())));
                }
            }
        });
        super::supervise("update command", self.session.clone(), task);
    }

    fn handle_reboot(&self) {
        let _ = self.session.send(Envelope::reboot_ack());
        info!("reboot commanded, exiting for supervisor restart");

        tokio::spawn(async {
            tokio::time::sleep(RESTART_GRACE).await;
            std::process::exit(0);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::scans::{HostProbes, ScanProbes};
    use crate::agent::state::{AgentState, SessionState};
    use crate::config::Config;

    struct Fixture {
        dispatcher: Dispatcher,
        store: Arc<Store>,
        outbound: mpsc::UnboundedReceiver<Envelope>,
        control: mpsc::UnboundedReceiver<ControlMsg>,
    }

    fn fixture(dir: &std::path::Path) -> Fixture {
        let config = Config {
            app_dir: dir.to_path_buf(),
            local_api_port: 0,
        };
        config.mkdirs().unwrap();

        let state = Arc::new(AgentState::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let session = SessionHandle::detached(Arc::clone(&state));

        // Wire the handle up as if the session were online so responses are
        // observable.
        let outbound = session.attach_for_tests();
        state.set_session(SessionState::Online);

        let probes: Arc<dyn ScanProbes> = Arc::new(HostProbes);
        let runner = Arc::new(TaskRunner::new(
            Arc::clone(&state),
            Arc::clone(&store),
            session.clone(),
            probes,
            config.reports_dir(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&runner),
            session.clone(),
        ));
        let updater = Arc::new(
            UpdateManager::new(config, Arc::clone(&store), Arc::clone(&state)).unwrap(),
        );

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            runner,
            scheduler,
            updater,
            session,
            control_tx,
        );

        Fixture {
            dispatcher,
            store,
            outbound,
            control: control_rx,
        }
    }

    fn config_update(pairs: &[(&str, Value)]) -> ServerCommand {
        let mut map = Map::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        ServerCommand::ConfigUpdate(map)
    }

    #[tokio::test]
    async fn config_update_merges_and_acks() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());

        fx.dispatcher
            .dispatch(config_update(&[
                ("autoUpdate", json!(false)),
                ("reportRetention", json!(30)),
            ]))
            .await;

        assert_eq!(fx.store.get_or("autoUpdate", ""), "false");
        assert_eq!(fx.store.get_or("reportRetention", ""), "30");

        let ack = fx.outbound.try_recv().unwrap();
        assert_eq!(ack.msg_type, "config_update_ack");
        assert_eq!(ack.data["success"], json!(true));
    }

    #[tokio::test]
    async fn server_url_change_forces_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());

        fx.dispatcher
            .dispatch(config_update(&[(
                keys::SERVER_URL,
                json!("http://new.example:9000"),
            )]))
            .await;

        assert_eq!(
            fx.store.get(keys::SERVER_URL).unwrap().as_deref(),
            Some("http://new.example:9000")
        );
        assert!(matches!(
            fx.control.try_recv().unwrap(),
            ControlMsg::Reconnect
        ));
    }

    #[tokio::test]
    async fn unchanged_server_url_does_not_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());
        fx.store
            .set(keys::SERVER_URL, "http://same.example")
            .unwrap();

        fx.dispatcher
            .dispatch(config_update(&[(
                keys::SERVER_URL,
                json!("http://same.example"),
            )]))
            .await;

        assert!(fx.control.try_recv().is_err());
    }

    #[tokio::test]
    async fn bad_scan_interval_acks_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());

        fx.dispatcher
            .dispatch(config_update(&[(
                keys::SCAN_INTERVAL,
                json!("every other thursday"),
            )]))
            .await;

        let ack = fx.outbound.try_recv().unwrap();
        assert_eq!(ack.data["success"], json!(false));
    }

    #[tokio::test]
    async fn unknown_scan_type_yields_failed_scan_complete() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());

        fx.dispatcher
            .dispatch(ServerCommand::RunScan(RunScan {
                scan_id: Some("s-9".to_string()),
                scan_type: Some("xray".to_string()),
            }))
            .await;

        let msg = fx.outbound.try_recv().unwrap();
        assert_eq!(msg.msg_type, "scan_complete");
        assert_eq!(msg.data["scanId"], json!("s-9"));
        assert_eq!(msg.data["success"], json!(false));
    }

    #[tokio::test]
    async fn unknown_commands_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());

        fx.dispatcher
            .dispatch(ServerCommand::Unknown("mystery".to_string()))
            .await;

        assert!(fx.outbound.try_recv().is_err());
        assert!(fx.control.try_recv().is_err());
    }
}
