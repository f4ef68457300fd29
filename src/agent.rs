pub mod dispatch;
pub mod identity;
pub mod messages;
pub mod runner;
pub mod scans;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod update;

use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api;
use crate::config::Config;
use crate::error::Result;
use crate::store::Store;

use dispatch::Dispatcher;
use identity::AgentIdentity;
use messages::Envelope;
use runner::TaskRunner;
use scans::{HostProbes, ScanProbes};
use scheduler::Scheduler;
use session::{ControlMsg, SessionHandle, SessionManager};
use state::AgentState;
use update::UpdateManager;

/// Watches a spawned task so a panic in it is logged and best-effort
/// reported to the server instead of silently killing the subsystem.
/// Cancellation is not an error; aborted tasks are expected.
pub(crate) fn supervise(name: &'static str, session: SessionHandle, task: JoinHandle<()>) {
    tokio::spawn(async move {
        if let Err(e) = task.await {
            if e.is_panic() {
                error!("{} task panicked: {}", name, e);
                let _ = session.send(Envelope::error(&format!("{} task panicked", name)));
            }
        }
    });
}

/// Logs every panic in the process before the default hook runs, so a
/// panicking detached task always leaves a trace.
fn install_panic_logger() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("panic: {}", info);
        default_hook(info);
    }));
}

/// Wires every component together and runs the agent until shutdown.
/// The session loop is the foreground task; the scheduler, the periodic
/// update check, and the local status API run beside it.
pub async fn run(config: Config) -> Result<()> {
    install_panic_logger();
    config.mkdirs()?;

    let store = Arc::new(Store::open(&config.store_path())?);
    let identity = AgentIdentity::load_or_create(&store)?;
    identity::ensure_local_api_token(&store)?;

    info!(
        "agent {} starting (version {}, host {})",
        identity.agent_id, identity.version, identity.hostname
    );

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

    let updater = Arc::new(UpdateManager::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&state),
    )?);
    updater.ensure_install_dir()?;

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&runner),
        Arc::clone(&scheduler),
        Arc::clone(&updater),
        handle.clone(),
        control_tx.clone(),
    ));

    let session = SessionManager::new(
        Arc::clone(&store),
        identity,
        Arc::clone(&state),
        handle.clone(),
        dispatcher,
        control_rx,
    );

    scheduler.start()?;

    let api_task = api::serve(
        config.local_api_port,
        Arc::clone(&store),
        Arc::clone(&state),
        Arc::clone(&runner),
        Arc::clone(&scheduler),
    );
    tokio::spawn(async move {
        if let Err(e) = api_task.await {
            warn!("local status API stopped: {}", e);
        }
    });

    let update_task = tokio::spawn(update::run_periodic(Arc::clone(&updater), handle.clone()));
    supervise("background update", handle.clone(), update_task);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = control_tx.send(ControlMsg::Shutdown("operator interrupt".to_string()));
        } else {
            warn!("unable to listen for interrupts");
        }
    });

    session.run().await;
    scheduler.stop();

    Ok(())
}
