//! Daemon configuration: YAML document, drop-in overlay directory,
//! environment overrides, and the builders that turn config sections
//! into runtime objects.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sc_shared::ScError;
use serde::Deserialize;
use serde_yaml::Value;
use tracing::debug;

use crate::materialize::{
    FileDest, Hook, PkiSinks, ReplicationItem, SecretFormatter, SinkSet, SourceKind,
};
use crate::reboot::agent::{Agent, Streaks};
use crate::reboot::check::{Checker, CheckerSpec};
use crate::reboot::group::{EvaluatorMode, Group, StateEvaluator, StateKind};
use crate::reboot::precondition::{Precondition, PreconditionSpec};
use crate::vault::{AuthMethod, CidrResolution, StoreClient};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sc-agent.yaml";
const ENV_PREFIX: &str = "SC_AGENT_";

fn default_http_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_address() -> String {
    "127.0.0.1:9100".to_string()
}

fn default_safe_min_uptime_secs() -> u64 {
    4 * 3600
}

fn default_evaluator_mode() -> String {
    "and".to_string()
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_streak() -> u32 {
    1
}

fn default_replication_interval_secs() -> u64 {
    600
}

fn default_pki_interval_secs() -> u64 {
    3600
}

fn default_formatter() -> String {
    "yaml".to_string()
}

fn default_pki_mount() -> String {
    "pki".to_string()
}

fn default_ssh_mount() -> String {
    "ssh".to_string()
}

fn default_ssh_ttl_secs() -> u64 {
    86400
}

fn default_profile() -> String {
    "default".to_string()
}

fn default_cidr() -> String {
    "dynamic".to_string()
}

/// Top-level document. Every section is optional; an absent section
/// leaves its component disabled.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub http: Option<HttpConfig>,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default, alias = "conditional_reboot")]
    pub reboot_manager: Option<RebootManagerConfig>,
    #[serde(default)]
    pub http_replication: Option<HttpReplicationConfig>,
    #[serde(default)]
    pub secrets_replication: Option<SecretsReplicationConfig>,
    #[serde(default)]
    pub x509_pki: Option<X509PkiConfig>,
    #[serde(default)]
    pub ssh_pki: Option<SshPkiConfig>,
    #[serde(default)]
    pub acme: Option<AcmeConfig>,
    /// Named secret-store credential profiles.
    #[serde(default)]
    pub vault: HashMap<String, VaultProfile>,
    // Platform-adapter sections are accepted so shared config files
    // parse; their services live outside this daemon.
    #[serde(default)]
    pub wol: Option<Value>,
    #[serde(default)]
    pub libvirt: Option<Value>,
    #[serde(default)]
    pub services: Option<Value>,
    #[serde(default)]
    pub packages: Option<Value>,
    #[serde(default)]
    pub power_status: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "default_http_address")]
    pub address: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_address")]
    pub address: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// Mutual-TLS material and peer allow-lists for the listeners.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    #[serde(default)]
    pub client_ca: Option<PathBuf>,
    #[serde(default)]
    pub allowed_cns: Vec<String>,
    #[serde(default)]
    pub allowed_san_emails: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RebootManagerConfig {
    #[serde(default = "default_safe_min_uptime_secs")]
    pub safe_min_uptime_secs: u64,
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub name: String,
    pub evaluator: EvaluatorConfig,
    pub agents: Vec<AgentConfig>,
}

/// `states` maps a state name to the minimum dwell time in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluatorConfig {
    #[serde(default = "default_evaluator_mode")]
    pub mode: String,
    pub states: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub name: String,
    pub checker: CheckerSpec,
    #[serde(default)]
    pub precondition: Option<PreconditionSpec>,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_streak")]
    pub streak_until_ok: u32,
    #[serde(default = "default_streak")]
    pub streak_until_reboot: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpReplicationConfig {
    #[serde(default = "default_replication_interval_secs")]
    pub interval_secs: u64,
    pub items: Vec<HttpItemConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpItemConfig {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub sha256: Option<String>,
    pub dests: Vec<String>,
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretsReplicationConfig {
    #[serde(default = "default_profile")]
    pub vault_profile: String,
    #[serde(default = "default_replication_interval_secs")]
    pub interval_secs: u64,
    pub items: Vec<SecretItemConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretItemConfig {
    pub id: String,
    pub secret_path: String,
    #[serde(default = "default_formatter")]
    pub formatter: String,
    #[serde(default)]
    pub template: Option<String>,
    pub dest: String,
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct X509PkiConfig {
    #[serde(default = "default_profile")]
    pub vault_profile: String,
    #[serde(default = "default_pki_mount")]
    pub mount: String,
    #[serde(default = "default_pki_interval_secs")]
    pub interval_secs: u64,
    pub items: Vec<X509ItemConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct X509ItemConfig {
    pub id: String,
    pub role: String,
    pub common_name: String,
    #[serde(default)]
    pub alt_names: Vec<String>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    pub certificate: String,
    pub private_key: String,
    #[serde(default)]
    pub ca: Option<String>,
    #[serde(default)]
    pub ca_chain: Option<String>,
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshPkiConfig {
    #[serde(default = "default_profile")]
    pub vault_profile: String,
    #[serde(default = "default_ssh_mount")]
    pub mount: String,
    #[serde(default = "default_pki_interval_secs")]
    pub interval_secs: u64,
    pub items: Vec<SshItemConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshItemConfig {
    pub id: String,
    pub role: String,
    pub public_key_file: PathBuf,
    #[serde(default)]
    pub principals: Vec<String>,
    #[serde(default = "default_ssh_ttl_secs")]
    pub ttl_secs: u64,
    pub dest: String,
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcmeConfig {
    #[serde(default = "default_profile")]
    pub vault_profile: String,
    #[serde(default = "default_pki_interval_secs")]
    pub interval_secs: u64,
    pub items: Vec<AcmeItemConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcmeItemConfig {
    pub id: String,
    pub cache_path: String,
    pub certificate: String,
    pub private_key: String,
    #[serde(default)]
    pub ca: Option<String>,
    #[serde(default)]
    pub ca_chain: Option<String>,
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultProfile {
    pub address: String,
    pub auth: AuthConfig,
    /// `dynamic`, or a literal CIDR bound to fresh secret-ids.
    #[serde(default = "default_cidr")]
    pub cidr: String,
    #[serde(default)]
    pub rotation_threshold_pct: Option<f64>,
    #[serde(default)]
    pub rotation_check_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case", deny_unknown_fields)]
pub enum AuthConfig {
    Token {
        token: String,
    },
    Approle {
        role_id: String,
        role_name: String,
        secret_id_file: PathBuf,
        #[serde(default)]
        wrapped: bool,
    },
}

impl VaultProfile {
    pub fn auth_method(&self) -> AuthMethod {
        match &self.auth {
            AuthConfig::Token { token } => AuthMethod::Token {
                token: token.clone(),
            },
            AuthConfig::Approle {
                role_id,
                role_name,
                secret_id_file,
                wrapped,
            } => AuthMethod::AppRole {
                role_id: role_id.clone(),
                role_name: role_name.clone(),
                secret_id_file: secret_id_file.clone(),
                wrapped: *wrapped,
            },
        }
    }

    pub fn cidr_resolution(&self) -> CidrResolution {
        if self.cidr == "dynamic" {
            CidrResolution::Dynamic
        } else {
            CidrResolution::Static(self.cidr.clone())
        }
    }

    pub fn rotation_check_interval(&self) -> Option<Duration> {
        self.rotation_check_interval_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load the document at `path`, merge `<path>.d/*` drop-ins in
    /// sorted filename order, then apply `SC_AGENT_` environment
    /// overrides. Later layers win on conflicting keys.
    pub fn load(path: &Path) -> Result<Self, ScError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ScError::Config(format!("reading {}: {e}", path.display())))?;
        let mut doc = parse_document(&raw, path)?;

        let dropin_dir = PathBuf::from(format!("{}.d", path.display()));
        if dropin_dir.is_dir() {
            for dropin in sorted_dropins(&dropin_dir)? {
                let raw = std::fs::read_to_string(&dropin)
                    .map_err(|e| ScError::Config(format!("reading {}: {e}", dropin.display())))?;
                let overlay = parse_document(&raw, &dropin)?;
                debug!(file = %dropin.display(), "merging drop-in");
                merge_value(&mut doc, overlay);
            }
        }

        apply_env_overrides(&mut doc, std::env::vars());
        Self::from_value(doc)
    }

    pub fn from_value(doc: Value) -> Result<Self, ScError> {
        let config: Config = serde_yaml::from_value(doc)
            .map_err(|e| ScError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(raw: &str) -> Result<Self, ScError> {
        Self::from_value(parse_document(raw, Path::new("<inline>"))?)
    }

    fn validate(&self) -> Result<(), ScError> {
        if let Some(http) = &self.http {
            parse_addr(&http.address, "http.address")?;
        }
        if let Some(metrics) = &self.metrics {
            parse_addr(&metrics.address, "metrics.address")?;
        }
        if let Some(rm) = &self.reboot_manager {
            if rm.groups.is_empty() {
                return Err(ScError::Config("reboot_manager.groups is empty".into()));
            }
            for group in &rm.groups {
                if group.agents.is_empty() {
                    return Err(ScError::Config(format!(
                        "group {:?} has no agents",
                        group.name
                    )));
                }
                for agent in &group.agents {
                    if agent.streak_until_ok < 1 || agent.streak_until_reboot < 1 {
                        return Err(ScError::Config(format!(
                            "agent {:?}: streaks must be at least 1",
                            agent.name
                        )));
                    }
                }
            }
        }
        if let Some(section) = &self.http_replication {
            unique_ids("http_replication", section.items.iter().map(|i| &i.id))?;
        }
        if let Some(section) = &self.secrets_replication {
            unique_ids("secrets_replication", section.items.iter().map(|i| &i.id))?;
            self.require_profile(&section.vault_profile, "secrets_replication")?;
        }
        if let Some(section) = &self.x509_pki {
            unique_ids("x509_pki", section.items.iter().map(|i| &i.id))?;
            self.require_profile(&section.vault_profile, "x509_pki")?;
        }
        if let Some(section) = &self.ssh_pki {
            unique_ids("ssh_pki", section.items.iter().map(|i| &i.id))?;
            self.require_profile(&section.vault_profile, "ssh_pki")?;
        }
        if let Some(section) = &self.acme {
            unique_ids("acme", section.items.iter().map(|i| &i.id))?;
            self.require_profile(&section.vault_profile, "acme")?;
        }
        Ok(())
    }

    fn require_profile(&self, name: &str, section: &str) -> Result<(), ScError> {
        if self.vault.contains_key(name) {
            Ok(())
        } else {
            Err(ScError::Config(format!(
                "{section} references unknown vault profile {name:?}"
            )))
        }
    }

    pub fn http_address(&self) -> Result<Option<SocketAddr>, ScError> {
        self.http
            .as_ref()
            .map(|h| parse_addr(&h.address, "http.address"))
            .transpose()
    }

    pub fn metrics_address(&self) -> Result<Option<SocketAddr>, ScError> {
        self.metrics
            .as_ref()
            .map(|m| parse_addr(&m.address, "metrics.address"))
            .transpose()
    }
}

fn parse_addr(raw: &str, key: &str) -> Result<SocketAddr, ScError> {
    raw.parse()
        .map_err(|e| ScError::Config(format!("{key} {raw:?}: {e}")))
}

fn unique_ids<'a>(section: &str, ids: impl Iterator<Item = &'a String>) -> Result<(), ScError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ScError::Config(format!("{section}: duplicate item {id:?}")));
        }
    }
    Ok(())
}

fn parse_document(raw: &str, path: &Path) -> Result<Value, ScError> {
    let doc: Value = serde_yaml::from_str(raw)
        .map_err(|e| ScError::Config(format!("{}: {e}", path.display())))?;
    match doc {
        Value::Null => Ok(Value::Mapping(Default::default())),
        Value::Mapping(_) => Ok(doc),
        _ => Err(ScError::Config(format!(
            "{}: top level must be a mapping",
            path.display()
        ))),
    }
}

fn sorted_dropins(dir: &Path) -> Result<Vec<PathBuf>, ScError> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| ScError::Config(format!("reading {}: {e}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| ScError::Config(e.to_string()))?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Deep merge: mappings merge recursively, everything else is
/// replaced by the overlay.
fn merge_value(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// `SC_AGENT_HTTP__ADDRESS=1.2.3.4:80` sets `http.address`. Double
/// underscores separate path segments; values are parsed as YAML
/// scalars with a string fallback.
fn apply_env_overrides(doc: &mut Value, vars: impl Iterator<Item = (String, String)>) {
    for (key, raw) in vars {
        let Some(path) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        if path.is_empty() {
            continue;
        }
        let segments: Vec<String> = path.split("__").map(|s| s.to_ascii_lowercase()).collect();
        let value: Value = serde_yaml::from_str(&raw).unwrap_or(Value::String(raw));
        set_path(doc, &segments, value);
    }
}

fn set_path(doc: &mut Value, segments: &[String], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let Value::Mapping(map) = doc else {
        return;
    };
    let key = Value::String(head.clone());
    if rest.is_empty() {
        map.insert(key, value);
        return;
    }
    let slot = map
        .entry(key)
        .or_insert_with(|| Value::Mapping(Default::default()));
    if !slot.is_mapping() {
        *slot = Value::Mapping(Default::default());
    }
    set_path(slot, rest, value);
}

impl RebootManagerConfig {
    pub fn safe_min_uptime(&self) -> Duration {
        Duration::from_secs(self.safe_min_uptime_secs)
    }

    pub fn build_groups(&self) -> Result<Vec<Arc<Group>>, ScError> {
        self.groups.iter().map(build_group).collect()
    }
}

fn build_group(config: &GroupConfig) -> Result<Arc<Group>, ScError> {
    let mode = match config.evaluator.mode.as_str() {
        "and" => EvaluatorMode::And,
        "or" => EvaluatorMode::Or,
        other => {
            return Err(ScError::Config(format!(
                "group {:?}: unknown evaluator mode {other:?}",
                config.name
            )))
        }
    };
    let requirements = config
        .evaluator
        .states
        .iter()
        .map(|(state, secs)| Ok((StateKind::parse(state)?, Duration::from_secs(*secs))))
        .collect::<Result<Vec<_>, ScError>>()?;
    let evaluator = StateEvaluator::new(mode, requirements)?;

    let mut agents = Vec::with_capacity(config.agents.len());
    for spec in &config.agents {
        let checker = Checker::new(spec.checker.clone())?;
        let precondition = match &spec.precondition {
            Some(p) => Precondition::from_spec(p)?,
            None => Precondition::Always,
        };
        agents.push(Arc::new(Agent::new(
            spec.name.clone(),
            checker,
            precondition,
            Duration::from_secs(spec.check_interval_secs),
            Streaks {
                until_ok: spec.streak_until_ok,
                until_reboot: spec.streak_until_reboot,
            },
        )));
    }
    Ok(Arc::new(Group::new(config.name.clone(), agents, evaluator)))
}

impl HttpReplicationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn build_items(&self) -> Result<Vec<ReplicationItem>, ScError> {
        self.items
            .iter()
            .map(|item| {
                let dests = item
                    .dests
                    .iter()
                    .map(|uri| FileDest::parse(uri))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ReplicationItem {
                    id: item.id.clone(),
                    source: SourceKind::http(item.source.clone())?,
                    expected_sha256: item.sha256.clone(),
                    sinks: SinkSet::content(dests)?,
                    hooks: item.hooks.clone(),
                })
            })
            .collect()
    }
}

impl SecretsReplicationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn build_items(&self, store: Arc<StoreClient>) -> Result<Vec<ReplicationItem>, ScError> {
        self.items
            .iter()
            .map(|item| {
                let formatter =
                    SecretFormatter::parse(&item.formatter, item.template.as_deref())?;
                Ok(ReplicationItem {
                    id: item.id.clone(),
                    source: SourceKind::Secret {
                        store: Arc::clone(&store),
                        path: item.secret_path.clone(),
                        formatter,
                    },
                    expected_sha256: None,
                    sinks: SinkSet::content(vec![FileDest::parse(&item.dest)?])?,
                    hooks: item.hooks.clone(),
                })
            })
            .collect()
    }
}

fn pki_sinks(
    certificate: &str,
    private_key: &str,
    ca: Option<&str>,
    ca_chain: Option<&str>,
) -> Result<SinkSet, ScError> {
    Ok(SinkSet::Pki(PkiSinks {
        certificate: FileDest::parse(certificate)?,
        private_key: FileDest::parse(private_key)?,
        ca: ca.map(FileDest::parse).transpose()?,
        ca_chain: ca_chain.map(FileDest::parse).transpose()?,
    }))
}

impl X509PkiConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn build_items(&self, store: Arc<StoreClient>) -> Result<Vec<ReplicationItem>, ScError> {
        self.items
            .iter()
            .map(|item| {
                Ok(ReplicationItem {
                    id: item.id.clone(),
                    source: SourceKind::x509(
                        Arc::clone(&store),
                        self.mount.clone(),
                        item.role.clone(),
                        item.common_name.clone(),
                        item.alt_names.clone(),
                        item.ttl_secs.map(Duration::from_secs),
                    ),
                    expected_sha256: None,
                    sinks: pki_sinks(
                        &item.certificate,
                        &item.private_key,
                        item.ca.as_deref(),
                        item.ca_chain.as_deref(),
                    )?,
                    hooks: item.hooks.clone(),
                })
            })
            .collect()
    }
}

impl SshPkiConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn build_items(&self, store: Arc<StoreClient>) -> Result<Vec<ReplicationItem>, ScError> {
        self.items
            .iter()
            .map(|item| {
                Ok(ReplicationItem {
                    id: item.id.clone(),
                    source: SourceKind::ssh(
                        Arc::clone(&store),
                        self.mount.clone(),
                        item.role.clone(),
                        item.public_key_file.clone(),
                        item.principals.clone(),
                        Duration::from_secs(item.ttl_secs),
                    ),
                    expected_sha256: None,
                    sinks: SinkSet::content(vec![FileDest::parse(&item.dest)?])?,
                    hooks: item.hooks.clone(),
                })
            })
            .collect()
    }
}

impl AcmeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn build_items(&self, store: Arc<StoreClient>) -> Result<Vec<ReplicationItem>, ScError> {
        self.items
            .iter()
            .map(|item| {
                Ok(ReplicationItem {
                    id: item.id.clone(),
                    source: SourceKind::AcmeCache {
                        store: Arc::clone(&store),
                        path: item.cache_path.clone(),
                    },
                    expected_sha256: None,
                    sinks: pki_sinks(
                        &item.certificate,
                        &item.private_key,
                        item.ca.as_deref(),
                        item.ca_chain.as_deref(),
                    )?,
                    hooks: item.hooks.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
reboot_manager:
  groups:
    - name: web
      evaluator:
        states:
          reboot-needed: 300
      agents:
        - name: kernel
          checker:
            type: os-reboot-needed
"#;

    #[test]
    fn test_minimal_document() {
        let config = Config::from_str(MINIMAL).unwrap();
        let rm = config.reboot_manager.unwrap();
        assert_eq!(rm.safe_min_uptime(), Duration::from_secs(4 * 3600));
        let agent = &rm.groups[0].agents[0];
        assert_eq!(agent.check_interval_secs, 60);
        assert_eq!(agent.streak_until_ok, 1);
        assert!(config.http.is_none());
    }

    #[test]
    fn test_conditional_reboot_alias() {
        let raw = MINIMAL.replace("reboot_manager:", "conditional_reboot:");
        let config = Config::from_str(&raw).unwrap();
        assert!(config.reboot_manager.is_some());
    }

    #[test]
    fn test_empty_group_rejected() {
        let raw = r#"
reboot_manager:
  groups:
    - name: empty
      evaluator:
        states:
          ok: 0
      agents: []
"#;
        assert!(Config::from_str(raw).is_err());
    }

    #[test]
    fn test_zero_streak_rejected() {
        let raw = r#"
reboot_manager:
  groups:
    - name: web
      evaluator:
        states:
          reboot-needed: 0
      agents:
        - name: kernel
          checker:
            type: os-reboot-needed
          streak_until_ok: 0
"#;
        assert!(Config::from_str(raw).is_err());
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        assert!(Config::from_str("bogus: 1").is_err());
    }

    #[test]
    fn test_platform_sections_accepted() {
        let config = Config::from_str("wol:\n  aliases:\n    nas: aa:bb:cc:dd:ee:ff\n").unwrap();
        assert!(config.wol.is_some());
    }

    #[test]
    fn test_build_groups() {
        let config = Config::from_str(MINIMAL).unwrap();
        let groups = config.reboot_manager.unwrap().build_groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name(), "web");
        assert_eq!(groups[0].agents().len(), 1);
    }

    #[test]
    fn test_bad_evaluator_mode_rejected() {
        let raw = MINIMAL.replace("evaluator:", "evaluator:\n        mode: xor");
        let config = Config::from_str(&raw).unwrap();
        assert!(config.reboot_manager.unwrap().build_groups().is_err());
    }

    #[test]
    fn test_vault_profile_reference_checked() {
        let raw = r#"
secrets_replication:
  items:
    - id: app
      secret_path: secret/app
      dest: file:///etc/app.yaml
"#;
        let err = Config::from_str(raw).unwrap_err();
        assert!(err.to_string().contains("vault profile"));
    }

    #[test]
    fn test_duplicate_item_ids_rejected() {
        let raw = r#"
http_replication:
  items:
    - id: same
      source: https://a.example/x
      dests: [file:///etc/x]
    - id: same
      source: https://a.example/y
      dests: [file:///etc/y]
"#;
        assert!(Config::from_str(raw).is_err());
    }

    #[test]
    fn test_full_document_with_profiles() {
        let raw = r#"
http:
  address: "127.0.0.1:8080"
metrics:
  address: "127.0.0.1:9100"
vault:
  default:
    address: https://vault.example.com:8200
    auth:
      method: approle
      role_id: rid
      role_name: host
      secret_id_file: /etc/sc-agent/secret-id
      wrapped: true
    cidr: 10.0.0.0/24
secrets_replication:
  vault_profile: default
  items:
    - id: app-env
      secret_path: secret/data/app
      formatter: env
      dest: file:///etc/app.env
x509_pki:
  vault_profile: default
  mount: pki_int
  items:
    - id: web
      role: server
      common_name: web.example.com
      certificate: file:///etc/ssl/web.crt
      private_key: file:///etc/ssl/web.key?chmod=0600
      hooks:
        - name: reload
          command: systemctl reload nginx
"#;
        let config = Config::from_str(raw).unwrap();
        let profile = &config.vault["default"];
        assert!(matches!(
            profile.auth_method(),
            AuthMethod::AppRole { wrapped: true, .. }
        ));
        assert!(matches!(
            profile.cidr_resolution(),
            CidrResolution::Static(_)
        ));

        let (store, _) = StoreClient::in_memory();
        let items = config
            .x509_pki
            .as_ref()
            .unwrap()
            .build_items(Arc::clone(&store))
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].hooks[0].name, "reload");

        let items = config
            .secrets_replication
            .as_ref()
            .unwrap()
            .build_items(store)
            .unwrap();
        assert_eq!(items[0].id, "app-env");
    }

    #[test]
    fn test_dropin_overlay_sorted_order() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("sc-agent.yaml");
        std::fs::write(&base, "metrics:\n  address: \"127.0.0.1:9100\"\n").unwrap();
        let dropins = dir.path().join("sc-agent.yaml.d");
        std::fs::create_dir(&dropins).unwrap();
        std::fs::write(
            dropins.join("20-late.yaml"),
            "metrics:\n  address: \"127.0.0.1:9300\"\n",
        )
        .unwrap();
        std::fs::write(
            dropins.join("10-early.yaml"),
            "metrics:\n  address: \"127.0.0.1:9200\"\nhttp:\n  address: \"127.0.0.1:8080\"\n",
        )
        .unwrap();

        let config = Config::load(&base).unwrap();
        // Last writer wins; the untouched http key from the early
        // drop-in survives.
        assert_eq!(config.metrics.unwrap().address, "127.0.0.1:9300");
        assert_eq!(config.http.unwrap().address, "127.0.0.1:8080");
    }

    #[test]
    fn test_env_override_paths() {
        let mut doc = parse_document("http:\n  address: \"127.0.0.1:1\"\n", Path::new("x")).unwrap();
        apply_env_overrides(
            &mut doc,
            vec![
                ("SC_AGENT_HTTP__ADDRESS".to_string(), "127.0.0.1:8081".to_string()),
                ("SC_AGENT_METRICS__ADDRESS".to_string(), "127.0.0.1:9101".to_string()),
                ("UNRELATED".to_string(), "ignored".to_string()),
            ]
            .into_iter(),
        );
        let config = Config::from_value(doc).unwrap();
        assert_eq!(config.http.unwrap().address, "127.0.0.1:8081");
        assert_eq!(config.metrics.unwrap().address, "127.0.0.1:9101");
    }

    #[test]
    fn test_merge_replaces_sequences() {
        let mut base: Value = serde_yaml::from_str("a:\n  - 1\n  - 2\n").unwrap();
        let overlay: Value = serde_yaml::from_str("a:\n  - 3\n").unwrap();
        merge_value(&mut base, overlay);
        let merged: Vec<u32> = serde_yaml::from_value(base["a"].clone()).unwrap();
        assert_eq!(merged, vec![3]);
    }

    #[test]
    fn test_bad_address_rejected() {
        assert!(Config::from_str("http:\n  address: not-an-addr\n").is_err());
    }
}
