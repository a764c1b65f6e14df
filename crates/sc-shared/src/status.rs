//! JSON payload types for the admin API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One agent as reported by the reboot manager status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub group: String,
    pub name: String,
    /// Short state name, e.g. "ok", "uncertain", "reboot-needed".
    pub state: String,
    /// Seconds spent in the current state.
    pub state_duration_secs: u64,
}

/// Reboot manager status: pause flag plus every agent across all groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebootManagerStatus {
    pub paused: bool,
    pub uptime_secs: u64,
    pub safe_min_uptime_secs: u64,
    pub agents: Vec<AgentStatus>,
}

/// One managed replication item (HTTP, secret, X.509, SSH or ACME).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemStatus {
    pub id: String,
    pub source: String,
    pub destinations: Vec<String>,
    /// Hex SHA-256 of the last materialized content, if any cycle
    /// has completed since the process started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_materialized: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemListResponse {
    pub items: Vec<ItemStatus>,
}

/// Request body for POST /v1/pki/x509/{id}/issue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueRequest {
    /// Force issuance even if the cached digest is unchanged.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueResponse {
    pub id: String,
    pub written: bool,
    pub digest: String,
}
