//! Health checkers: ternary verdicts feeding the per-agent state machine.
//!
//! A checker answers exactly one question about the host and answers it
//! with `Healthy`, `Unhealthy` or `Error`. Transport failures are
//! `Error`, never `Unhealthy`: the streak counters must not advance on
//! network weather.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sc_shared::ScError;
use serde::Deserialize;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Connect/probe deadline for the network checkers.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Deadline for remote metrics queries.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sentinel written by Debian-family package managers when a reboot is due.
const REBOOT_SENTINEL: &str = "/var/run/reboot-required";

/// Verdict of a single check invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResult {
    Healthy,
    Unhealthy,
    Error { kind: String, detail: String },
}

impl CheckResult {
    fn error(kind: &str, detail: impl Into<String>) -> Self {
        CheckResult::Error {
            kind: kind.to_string(),
            detail: detail.into(),
        }
    }
}

/// Checker configuration as it appears under an agent's `checker:` key.
///
/// The `type` discriminator selects the implementation; unknown
/// discriminators fail configuration load.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum CheckerSpec {
    /// Healthy iff the file exists, inverted by `wants_absence`.
    File {
        path: PathBuf,
        #[serde(default)]
        wants_absence: bool,
    },
    /// Healthy iff the name resolves.
    Dns { host: String },
    /// Healthy iff a TCP connect succeeds within the probe deadline.
    /// Connection-refused counts as Healthy: the host answered.
    Tcp { host: String, port: u16 },
    /// Healthy iff one echo reply arrives within the probe deadline.
    Icmp { host: String },
    /// Distribution-native reboot signal: sentinel file on the Debian
    /// family, `needs-restarting -r` on the RPM family.
    OsRebootNeeded {
        #[serde(default)]
        family: Option<OsFamily>,
    },
    /// Parse `needrestart -b` output for the kernel state integer and
    /// service-restart markers.
    Needrestart {
        #[serde(default)]
        kernel_threshold: i64,
        #[serde(default = "default_true")]
        check_services: bool,
    },
    /// Evaluate time-series queries against a remote metrics endpoint.
    /// All queries must pass for Healthy.
    #[serde(alias = "prometheus")]
    MetricsQuery {
        url: String,
        queries: Vec<String>,
        #[serde(default = "default_true")]
        want_response: bool,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OsFamily {
    Debian,
    Rpm,
}

/// A constructed checker. One instance per agent; the needrestart
/// variant latches Unhealthy for the process lifetime once it fires,
/// because that signal cannot unstick without a reboot.
pub struct Checker {
    spec: CheckerSpec,
    http: reqwest::Client,
    latched_unhealthy: AtomicBool,
}

impl Checker {
    pub fn new(spec: CheckerSpec) -> Result<Self, ScError> {
        if let CheckerSpec::MetricsQuery { queries, .. } = &spec {
            if queries.is_empty() {
                return Err(ScError::Config(
                    "metrics-query checker needs at least one query".into(),
                ));
            }
        }
        let http = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .map_err(|e| ScError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            spec,
            http,
            latched_unhealthy: AtomicBool::new(false),
        })
    }

    /// Short stable name of the checker kind.
    pub fn name(&self) -> &'static str {
        match &self.spec {
            CheckerSpec::File { .. } => "file",
            CheckerSpec::Dns { .. } => "dns",
            CheckerSpec::Tcp { .. } => "tcp",
            CheckerSpec::Icmp { .. } => "icmp",
            CheckerSpec::OsRebootNeeded { .. } => "os-reboot-needed",
            CheckerSpec::Needrestart { .. } => "needrestart",
            CheckerSpec::MetricsQuery { .. } => "metrics-query",
        }
    }

    /// Run one check. Cancellation aborts with an `Error` verdict; the
    /// owning agent loop is exiting anyway and will not apply it.
    pub async fn check(&self, cancel: &CancellationToken) -> CheckResult {
        if self.latched_unhealthy.load(Ordering::Relaxed) {
            return CheckResult::Unhealthy;
        }
        let verdict = tokio::select! {
            _ = cancel.cancelled() => CheckResult::error("cancelled", "shutdown in progress"),
            v = self.run_inner() => v,
        };
        if verdict == CheckResult::Unhealthy {
            if let CheckerSpec::Needrestart { .. } = self.spec {
                self.latched_unhealthy.store(true, Ordering::Relaxed);
            }
        }
        verdict
    }

    async fn run_inner(&self) -> CheckResult {
        match &self.spec {
            CheckerSpec::File { path, wants_absence } => {
                let exists = path.exists();
                if exists != *wants_absence {
                    CheckResult::Healthy
                } else {
                    CheckResult::Unhealthy
                }
            }
            CheckerSpec::Dns { host } => self.check_dns(host).await,
            CheckerSpec::Tcp { host, port } => self.check_tcp(host, *port).await,
            CheckerSpec::Icmp { host } => self.check_icmp(host).await,
            CheckerSpec::OsRebootNeeded { family } => self.check_os_signal(*family).await,
            CheckerSpec::Needrestart {
                kernel_threshold,
                check_services,
            } => self.check_needrestart(*kernel_threshold, *check_services).await,
            CheckerSpec::MetricsQuery {
                url,
                queries,
                want_response,
            } => self.check_metrics(url, queries, *want_response).await,
        }
    }

    async fn check_dns(&self, host: &str) -> CheckResult {
        match timeout(PROBE_TIMEOUT, tokio::net::lookup_host((host, 0u16))).await {
            Ok(Ok(mut addrs)) => {
                if addrs.next().is_some() {
                    CheckResult::Healthy
                } else {
                    CheckResult::Unhealthy
                }
            }
            Ok(Err(_)) => CheckResult::Unhealthy,
            Err(_) => CheckResult::error("timeout", format!("resolving {host}")),
        }
    }

    async fn check_tcp(&self, host: &str, port: u16) -> CheckResult {
        match timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => CheckResult::Healthy,
            // Refused means the host answered; port policy says nothing
            // about host health.
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => CheckResult::Healthy,
            Ok(Err(_)) => CheckResult::Unhealthy,
            Err(_) => CheckResult::Unhealthy,
        }
    }

    async fn check_icmp(&self, host: &str) -> CheckResult {
        // The system ping binary already handles the privileged vs
        // unprivileged socket selection per platform.
        let result = tokio::process::Command::new("ping")
            .args(["-c", "1", "-W", "3", host])
            .output()
            .await;
        match result {
            Ok(out) if out.status.success() => CheckResult::Healthy,
            Ok(out) if out.status.code() == Some(1) => CheckResult::Unhealthy,
            Ok(out) => CheckResult::error(
                "ping",
                format!("unexpected exit {:?}", out.status.code()),
            ),
            Err(e) => CheckResult::error("spawn", e.to_string()),
        }
    }

    async fn check_os_signal(&self, family: Option<OsFamily>) -> CheckResult {
        let family = match family {
            Some(f) => f,
            None => detect_os_family().await,
        };
        match family {
            OsFamily::Debian => {
                if std::path::Path::new(REBOOT_SENTINEL).exists() {
                    CheckResult::Unhealthy
                } else {
                    CheckResult::Healthy
                }
            }
            OsFamily::Rpm => {
                let result = tokio::process::Command::new("needs-restarting")
                    .arg("-r")
                    .output()
                    .await;
                match result {
                    Ok(out) => match out.status.code() {
                        Some(0) => CheckResult::Healthy,
                        Some(1) => CheckResult::Unhealthy,
                        code => CheckResult::error(
                            "needs-restarting",
                            format!("unexpected exit {code:?}"),
                        ),
                    },
                    Err(e) => CheckResult::error("spawn", e.to_string()),
                }
            }
        }
    }

    async fn check_needrestart(&self, kernel_threshold: i64, check_services: bool) -> CheckResult {
        let result = tokio::process::Command::new("needrestart")
            .arg("-b")
            .output()
            .await;
        let out = match result {
            Ok(out) => out,
            Err(e) => return CheckResult::error("spawn", e.to_string()),
        };
        let text = String::from_utf8_lossy(&out.stdout);
        match parse_needrestart(&text, kernel_threshold, check_services) {
            Ok(true) => CheckResult::Unhealthy,
            Ok(false) => CheckResult::Healthy,
            Err(detail) => CheckResult::error("parse", detail),
        }
    }

    async fn check_metrics(
        &self,
        url: &str,
        queries: &[String],
        want_response: bool,
    ) -> CheckResult {
        for query in queries {
            let request = self
                .http
                .get(format!("{}/api/v1/query", url.trim_end_matches('/')))
                .query(&[("query", query.as_str())]);
            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => return CheckResult::error("http", e.to_string()),
            };
            if !response.status().is_success() {
                return CheckResult::error("http", format!("status {}", response.status()));
            }
            let body: serde_json::Value = match response.json().await {
                Ok(b) => b,
                Err(e) => return CheckResult::error("parse", e.to_string()),
            };
            let non_empty = body
                .pointer("/data/result")
                .and_then(|r| r.as_array())
                .map(|a| !a.is_empty())
                .unwrap_or(false);
            debug!(query, non_empty, "metrics query evaluated");
            if non_empty != want_response {
                return CheckResult::Unhealthy;
            }
        }
        CheckResult::Healthy
    }
}

/// `needrestart -b` emits `NEEDRESTART-KSTA: <n>` for the kernel state
/// and one `NEEDRESTART-SVC: <unit>` line per service wanting a
/// restart. KSTA strictly above the threshold means a kernel update.
fn parse_needrestart(output: &str, kernel_threshold: i64, check_services: bool) -> Result<bool, String> {
    let mut ksta: Option<i64> = None;
    let mut service_marker = false;
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("NEEDRESTART-KSTA:") {
            ksta = Some(
                rest.trim()
                    .parse::<i64>()
                    .map_err(|e| format!("bad KSTA value {:?}: {e}", rest.trim()))?,
            );
        } else if line.starts_with("NEEDRESTART-SVC:") {
            service_marker = true;
        }
    }
    let ksta = ksta.ok_or_else(|| "no NEEDRESTART-KSTA line in output".to_string())?;
    if ksta > kernel_threshold {
        return Ok(true);
    }
    Ok(check_services && service_marker)
}

async fn detect_os_family() -> OsFamily {
    match tokio::fs::read_to_string("/etc/os-release").await {
        Ok(content) => {
            let lower = content.to_lowercase();
            if lower.contains("debian") || lower.contains("ubuntu") {
                OsFamily::Debian
            } else {
                OsFamily::Rpm
            }
        }
        Err(_) => OsFamily::Rpm,
    }
}
