//! Prometheus metrics shared across the daemon.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use sc_shared::ScError;

pub struct Metrics {
    pub registry: Registry,
    /// Reboot requests received, per group.
    pub reboot_requests: IntCounterVec,
    /// Requests refused, by reason (paused, uptime, error).
    pub reboots_refused: IntCounterVec,
    pub reboots_issued: IntCounter,
    /// Materialization cycles, by artifact class and outcome
    /// (written, unchanged, adopted, failed).
    pub materializations: IntCounterVec,
    /// Credential renewals, by outcome.
    pub credential_renewals: IntCounterVec,
    /// Secret-id rotations, by outcome.
    pub secret_id_rotations: IntCounterVec,
    /// Post-hook executions, by outcome.
    pub hook_runs: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, ScError> {
        let registry = Registry::new();
        let reboot_requests = IntCounterVec::new(
            Opts::new("sc_reboot_requests_total", "Reboot requests received"),
            &["group"],
        )
        .map_err(internal)?;
        let reboots_refused = IntCounterVec::new(
            Opts::new("sc_reboots_refused_total", "Reboot requests refused"),
            &["reason"],
        )
        .map_err(internal)?;
        let reboots_issued =
            IntCounter::new("sc_reboots_issued_total", "Reboots issued").map_err(internal)?;
        let materializations = IntCounterVec::new(
            Opts::new("sc_materializations_total", "Materialization cycles"),
            &["class", "outcome"],
        )
        .map_err(internal)?;
        let credential_renewals = IntCounterVec::new(
            Opts::new("sc_credential_renewals_total", "Credential renewals"),
            &["outcome"],
        )
        .map_err(internal)?;
        let secret_id_rotations = IntCounterVec::new(
            Opts::new("sc_secret_id_rotations_total", "Secret-id rotations"),
            &["outcome"],
        )
        .map_err(internal)?;
        let hook_runs = IntCounterVec::new(
            Opts::new("sc_hook_runs_total", "Post-hook executions"),
            &["outcome"],
        )
        .map_err(internal)?;

        for collector in [
            Box::new(reboot_requests.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(reboots_refused.clone()),
            Box::new(reboots_issued.clone()),
            Box::new(materializations.clone()),
            Box::new(credential_renewals.clone()),
            Box::new(secret_id_rotations.clone()),
            Box::new(hook_runs.clone()),
        ] {
            registry.register(collector).map_err(internal)?;
        }

        Ok(Self {
            registry,
            reboot_requests,
            reboots_refused,
            reboots_issued,
            materializations,
            credential_renewals,
            secret_id_rotations,
            hook_runs,
        })
    }

    /// Text exposition for the metrics endpoint.
    pub fn render(&self) -> Result<String, ScError> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(internal)?;
        String::from_utf8(buf).map_err(|e| ScError::Internal(e.to_string()))
    }
}

fn internal(e: prometheus::Error) -> ScError {
    ScError::Internal(e.to_string())
}
