use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use log::{info, warn};
use tokio::task::AbortHandle;

use crate::config::DEFAULT_SCAN_INTERVAL;
use crate::error::{AgentError, Result};
use crate::store::{keys, Store};

use super::messages::Envelope;
use super::runner::TaskRunner;
use super::scans::ScanKind;
use super::session::SessionHandle;

/// Fires the task runner with a `system` scan on a cron schedule the server
/// can reprogram. Single-flight: an overlapping fire is skipped and logged,
/// never queued. Missed fires during downtime are not caught up; the next
/// fire is computed from the current wall clock.
pub struct Scheduler {
    store: Arc<Store>,
    runner: Arc<TaskRunner>,
    session: SessionHandle,
    job: Mutex<Option<AbortHandle>>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, runner: Arc<TaskRunner>, session: SessionHandle) -> Self {
        Self {
            store,
            runner,
            session,
            job: Mutex::new(None),
        }
    }

    /// Starts the schedule persisted from the last run, or the default.
    pub fn start(&self) -> Result<()> {
        let expr = self
            .store
            .get_or(keys::SCAN_INTERVAL, DEFAULT_SCAN_INTERVAL);

        match self.reschedule(&expr) {
            Ok(()) => Ok(()),
            Err(e) => {
                // A bad persisted expression must not keep the agent down.
                warn!("stored schedule '{}' rejected ({}), using default", expr, e);
                self.reschedule(DEFAULT_SCAN_INTERVAL)
            }
        }
    }

    /// Replaces the active schedule atomically: the old timer is stopped
    /// before the new one starts, and the expression is persisted so it
    /// survives a restart.
    pub fn reschedule(&self, expr: &str) -> Result<()> {
        let schedule = parse_schedule(expr)?;
        self.store.set(keys::SCAN_INTERVAL, expr)?;

        let runner = Arc::clone(&self.runner);
        let session = self.session.clone();

        let mut job = self.job.lock().unwrap();
        if let Some(old) = job.take() {
            old.abort();
        }
        let task = tokio::spawn(run_schedule(schedule, runner, session));
        *job = Some(task.abort_handle());
        super::supervise("scan scheduler", self.session.clone(), task);

        info!("scan schedule set to '{}'", expr);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(old) = self.job.lock().unwrap().take() {
            old.abort();
        }
    }
}

async fn run_schedule(schedule: Schedule, runner: Arc<TaskRunner>, session: SessionHandle) {
    loop {
        let now = Utc::now();
        let next = match schedule.after(&now).next() {
            Some(next) => next,
            None => {
                warn!("schedule has no future fire times, scheduler idle");
                return;
            }
        };

        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        fire_once(&runner, &session).await;
    }
}

/// One schedule fire. Returns whether a scan actually ran. The scan itself
/// is detached so a reschedule never cancels it mid-flight.
pub(crate) async fn fire_once(runner: &Arc<TaskRunner>, session: &SessionHandle) -> bool {
    if runner.is_busy() {
        warn!("scheduled scan skipped: previous scan still running");
        return false;
    }

    let runner = Arc::clone(runner);
    let session = session.clone();
    tokio::spawn(async move {
        match runner.run_scan(ScanKind::System, None).await {
            Ok(report) => {
                let payload = if report.success {
                    report.results.clone().unwrap_or_default()
                } else {
                    serde_json::json!(report.error.clone().unwrap_or_default())
                };
                let _ = session.send(Envelope::scan_complete(
                    &report.scan_id,
                    report.success,
                    payload,
                ));
            }
            Err(AgentError::AlreadyScanning) => {
                warn!("scheduled scan skipped: previous scan still running");
            }
            Err(e) => warn!("scheduled scan failed to start: {}", e),
        }
    });

    true
}

/// Accepts a full cron expression, or a plain number of minutes which is
/// converted to one, so the server can send simple intervals. Minute counts
/// that don't map onto a cron step (not under an hour, not a whole number
/// of hours below a day) are rejected rather than approximated.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();

    let normalized = match expr.parse::<u32>() {
        Ok(mins) if mins > 0 && mins < 60 => format!("0 */{} * * * *", mins),
        Ok(mins) if mins > 0 && mins % 60 == 0 && mins / 60 < 24 => {
            format!("0 0 */{} * * *", mins / 60)
        }
        Ok(_) => {
            return Err(AgentError::Schedule {
                expr: expr.to_string(),
                reason: "interval must be 1-59 minutes or a whole number of hours below 24"
                    .to_string(),
            })
        }
        Err(_) => expr.to_string(),
    };

    Schedule::from_str(&normalized).map_err(|e| AgentError::Schedule {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}
