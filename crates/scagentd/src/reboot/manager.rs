//! Reboot arbitration: pause flag, minimum-uptime guard, one reboot
//! per process lifetime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sc_shared::status::{AgentStatus, RebootManagerStatus};
use sc_shared::ScError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::group::{Group, RebootRequest};
use crate::metrics::Metrics;

/// Default and floor for the minimum-uptime guard. Rebooting a machine
/// that just booted is how reboot loops happen.
pub const DEFAULT_SAFE_MIN_UPTIME: Duration = Duration::from_secs(4 * 3600);
pub const MIN_SAFE_MIN_UPTIME: Duration = Duration::from_secs(3600);

/// Issues the actual reboot. Behind a trait so tests never reboot the
/// build host.
pub trait RebootExecutor: Send + Sync {
    fn reboot(&self) -> Result<(), ScError>;
}

/// Reboots through systemd.
pub struct SystemctlExecutor;

impl RebootExecutor for SystemctlExecutor {
    fn reboot(&self) -> Result<(), ScError> {
        let status = std::process::Command::new("systemctl")
            .arg("reboot")
            .status()
            .map_err(|e| ScError::Internal(format!("spawning systemctl: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(ScError::Internal(format!(
                "systemctl reboot exited with {status}"
            )))
        }
    }
}

/// Source of the current system uptime.
pub trait UptimeSource: Send + Sync {
    fn uptime(&self) -> Duration;
}

/// Reads `/proc/uptime`.
pub struct ProcUptime;

impl UptimeSource for ProcUptime {
    fn uptime(&self) -> Duration {
        std::fs::read_to_string("/proc/uptime")
            .ok()
            .and_then(|s| {
                s.split_whitespace()
                    .next()
                    .and_then(|v| v.parse::<f64>().ok())
            })
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::ZERO)
    }
}

/// Shared view of the manager for the admin API: pause toggling and
/// the status listing. The request loop itself stays in the manager.
#[derive(Clone)]
pub struct ManagerHandle {
    paused: Arc<AtomicBool>,
    groups: Arc<Vec<Arc<Group>>>,
    uptime: Arc<dyn UptimeSource>,
    safe_min_uptime: Duration,
}

impl ManagerHandle {
    pub fn pause(&self) {
        info!("reboot manager paused");
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn unpause(&self) {
        info!("reboot manager unpaused");
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Union of all groups' agents with state names and dwell times.
    pub async fn status(&self) -> RebootManagerStatus {
        let mut agents = Vec::new();
        for group in self.groups.iter() {
            for agent in group.agents() {
                let snap = agent.snapshot().await;
                agents.push(AgentStatus {
                    group: group.name().to_string(),
                    name: agent.name().to_string(),
                    state: snap.state.name().to_string(),
                    state_duration_secs: snap.state_duration().as_secs(),
                });
            }
        }
        RebootManagerStatus {
            paused: self.is_paused(),
            uptime_secs: self.uptime.uptime().as_secs(),
            safe_min_uptime_secs: self.safe_min_uptime.as_secs(),
            agents,
        }
    }
}

/// Single consumer of the reboot request channel.
pub struct RebootManager {
    groups: Arc<Vec<Arc<Group>>>,
    executor: Box<dyn RebootExecutor>,
    uptime: Arc<dyn UptimeSource>,
    paused: Arc<AtomicBool>,
    safe_min_uptime: Duration,
    rebooted: bool,
    warned_under_min_uptime: bool,
    metrics: Arc<Metrics>,
}

impl RebootManager {
    pub fn new(
        groups: Vec<Arc<Group>>,
        executor: Box<dyn RebootExecutor>,
        uptime: Arc<dyn UptimeSource>,
        safe_min_uptime: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            groups: Arc::new(groups),
            executor,
            uptime,
            paused: Arc::new(AtomicBool::new(false)),
            safe_min_uptime: safe_min_uptime.max(MIN_SAFE_MIN_UPTIME),
            rebooted: false,
            warned_under_min_uptime: false,
            metrics,
        }
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            paused: Arc::clone(&self.paused),
            groups: Arc::clone(&self.groups),
            uptime: Arc::clone(&self.uptime),
            safe_min_uptime: self.safe_min_uptime,
        }
    }

    /// Spawn all groups and serve the request channel until cancelled.
    /// Runs in the main task.
    pub async fn run(mut self, cancel: CancellationToken) {
        let (request_tx, mut request_rx) = mpsc::channel::<RebootRequest>(8);
        let mut tasks = tokio::task::JoinSet::new();
        for group in self.groups.iter() {
            tasks.spawn(Arc::clone(group).run(request_tx.clone(), cancel.child_token()));
        }
        drop(request_tx);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = request_rx.recv() => {
                    match request {
                        Some(req) => self.handle_request(req),
                        None => break,
                    }
                }
            }
        }
        tasks.shutdown().await;
    }

    /// Apply the guards and, at most once per process, reboot.
    fn handle_request(&mut self, request: RebootRequest) {
        self.metrics.reboot_requests.with_label_values(&[&request.group]).inc();
        if self.rebooted {
            // First request won; later ones are expected and redundant.
            debug!(group = %request.group, "reboot already issued, dropping request");
            return;
        }
        if self.paused.load(Ordering::SeqCst) {
            info!(group = %request.group, "reboot manager paused, dropping request");
            self.metrics.reboots_refused.with_label_values(&["paused"]).inc();
            return;
        }
        let uptime = self.uptime.uptime();
        if uptime < self.safe_min_uptime {
            if !self.warned_under_min_uptime {
                warn!(
                    group = %request.group,
                    uptime_secs = uptime.as_secs(),
                    required_secs = self.safe_min_uptime.as_secs(),
                    "uptime below safety minimum, refusing reboot"
                );
                self.warned_under_min_uptime = true;
            } else {
                debug!(group = %request.group, "uptime still below safety minimum");
            }
            self.metrics.reboots_refused.with_label_values(&["uptime"]).inc();
            return;
        }
        info!(group = %request.group, "issuing reboot");
        match self.executor.reboot() {
            Ok(()) => {
                self.rebooted = true;
                self.metrics.reboots_issued.inc();
            }
            Err(e) => {
                error!(group = %request.group, error = %e, "reboot attempt failed");
                self.metrics.reboots_refused.with_label_values(&["error"]).inc();
            }
        }
    }
}
