//! Authoritative sources the materialization engine fetches from.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sc_shared::ScError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::artifact::{Artifact, CertParts};
use super::formatter::SecretFormatter;
use super::sink::{atomic_write, SinkSet};
use crate::vault::StoreClient;

const HTTP_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Re-issue once less than a third of the lifetime remains.
fn renewal_due(issued_at: i64, expires_at: i64, now: i64) -> bool {
    let lifetime = expires_at - issued_at;
    if lifetime <= 0 {
        return true;
    }
    (expires_at - now) < lifetime / 3
}

/// Issued material remembered between cycles so an unexpired
/// certificate is served from memory instead of being re-issued.
#[derive(Debug, Clone)]
struct IssuedState {
    parts: CertParts,
    issued_at: i64,
    expires_at: i64,
    /// For signed SSH keys: the public key the material was issued for.
    public_key: Option<String>,
}

impl IssuedState {
    fn needs_renewal(&self, now: i64) -> bool {
        renewal_due(self.issued_at, self.expires_at, now)
    }
}

/// In-memory issuance cache. The material itself never leaves this
/// module; the engine only sees finished artifacts.
#[derive(Default)]
pub struct IssuedCache {
    state: Mutex<Option<IssuedState>>,
}

impl IssuedCache {
    fn snapshot(&self) -> Option<IssuedState> {
        self.state.lock().unwrap().clone()
    }

    fn store(&self, state: IssuedState) {
        *self.state.lock().unwrap() = Some(state);
    }

    fn clear(&self) {
        *self.state.lock().unwrap() = None;
    }
}

/// Issuance timestamps persisted next to the primary slot. A restarted
/// daemon reads these to tell fresh on-disk material from material due
/// for renewal; the material itself stays in the slots.
#[derive(Debug, Serialize, Deserialize)]
struct IssuedMeta {
    issued_at: i64,
    expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
}

fn persist_meta(sinks: &SinkSet, state: &IssuedState) {
    let Some(path) = sinks.issuance_meta_path() else {
        return;
    };
    let meta = IssuedMeta {
        issued_at: state.issued_at,
        expires_at: state.expires_at,
        public_key: state.public_key.clone(),
    };
    match serde_json::to_vec(&meta) {
        Ok(bytes) => {
            if let Err(e) = atomic_write(&path, &bytes, 0o600) {
                warn!(path = %path.display(), error = %e, "failed to persist issuance metadata");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode issuance metadata"),
    }
}

fn load_meta(sinks: &SinkSet) -> Option<IssuedMeta> {
    let path = sinks.issuance_meta_path()?;
    let raw = std::fs::read(&path).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn discard_meta(sinks: &SinkSet) {
    if let Some(path) = sinks.issuance_meta_path() {
        let _ = std::fs::remove_file(path);
    }
}

/// Rebuild the issuance state of an X.509 item from its destination:
/// persisted timestamps plus the slot contents. `None` means the
/// destination cannot be trusted and a fresh issuance is needed.
fn recover_certificate(sinks: &SinkSet, now: i64) -> Option<IssuedState> {
    let meta = load_meta(sinks)?;
    if renewal_due(meta.issued_at, meta.expires_at, now) {
        return None;
    }
    let parts = sinks.read_parts().ok()?;
    Some(IssuedState {
        parts,
        issued_at: meta.issued_at,
        expires_at: meta.expires_at,
        public_key: None,
    })
}

/// Same recovery for a signed SSH key; the destination holds the
/// signed certificate verbatim. A host key that changed while the
/// daemon was down invalidates the recovered material.
fn recover_signed_key(sinks: &SinkSet, public_key: &str, now: i64) -> Option<IssuedState> {
    let meta = load_meta(sinks)?;
    if meta.public_key.as_deref() != Some(public_key)
        || renewal_due(meta.issued_at, meta.expires_at, now)
    {
        return None;
    }
    let bytes = match sinks {
        SinkSet::Content(dests) => dests.first()?.read().ok()?,
        SinkSet::Pki(_) => return None,
    };
    let certificate = String::from_utf8(bytes).ok()?;
    Some(IssuedState {
        parts: CertParts {
            certificate,
            private_key: String::new(),
            ca: None,
            ca_chain: vec![],
        },
        issued_at: meta.issued_at,
        expires_at: meta.expires_at,
        public_key: Some(public_key.to_string()),
    })
}

/// One source per replication item. HTTP and secret sources are
/// naturally idempotent; the issuing sources cache their last result
/// because every issuance produces fresh bytes.
pub enum SourceKind {
    Http {
        url: String,
        client: reqwest::Client,
    },
    Secret {
        store: Arc<StoreClient>,
        path: String,
        formatter: SecretFormatter,
    },
    X509 {
        store: Arc<StoreClient>,
        mount: String,
        role: String,
        common_name: String,
        alt_names: Vec<String>,
        ttl: Option<Duration>,
        issued: IssuedCache,
    },
    Ssh {
        store: Arc<StoreClient>,
        mount: String,
        role: String,
        public_key_file: PathBuf,
        principals: Vec<String>,
        ttl: Duration,
        issued: IssuedCache,
    },
    /// Mirror of an ACME cache entry kept in the secret store.
    AcmeCache {
        store: Arc<StoreClient>,
        path: String,
    },
}

impl SourceKind {
    pub fn http(url: String) -> Result<Self, ScError> {
        Ok(SourceKind::Http {
            url,
            client: reqwest::Client::builder()
                .timeout(HTTP_FETCH_TIMEOUT)
                .build()
                .map_err(|e| ScError::Config(format!("HTTP client: {e}")))?,
        })
    }

    pub fn x509(
        store: Arc<StoreClient>,
        mount: String,
        role: String,
        common_name: String,
        alt_names: Vec<String>,
        ttl: Option<Duration>,
    ) -> Self {
        SourceKind::X509 {
            store,
            mount,
            role,
            common_name,
            alt_names,
            ttl,
            issued: IssuedCache::default(),
        }
    }

    pub fn ssh(
        store: Arc<StoreClient>,
        mount: String,
        role: String,
        public_key_file: PathBuf,
        principals: Vec<String>,
        ttl: Duration,
    ) -> Self {
        SourceKind::Ssh {
            store,
            mount,
            role,
            public_key_file,
            principals,
            ttl,
            issued: IssuedCache::default(),
        }
    }

    /// Drop any remembered issuance, in memory and on disk, so the
    /// next fetch goes back to the issuer. No-op for sources without
    /// caches.
    pub fn reset(&self, sinks: &SinkSet) {
        match self {
            SourceKind::X509 { issued, .. } | SourceKind::Ssh { issued, .. } => {
                issued.clear();
                discard_meta(sinks);
            }
            _ => {}
        }
    }

    /// Human-readable source descriptor for status payloads.
    pub fn describe(&self) -> String {
        match self {
            SourceKind::Http { url, .. } => url.clone(),
            SourceKind::Secret { path, .. } => format!("secret:{path}"),
            SourceKind::X509 {
                mount,
                role,
                common_name,
                ..
            } => format!("x509:{mount}/{role}/{common_name}"),
            SourceKind::Ssh { mount, role, .. } => format!("ssh:{mount}/{role}"),
            SourceKind::AcmeCache { path, .. } => format!("acme:{path}"),
        }
    }

    pub async fn fetch(&self, sinks: &SinkSet) -> Result<Artifact, ScError> {
        match self {
            SourceKind::Http { url, client } => {
                let response = client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| ScError::Http(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(ScError::Http(format!(
                        "{url} returned {}",
                        response.status()
                    )));
                }
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| ScError::Http(e.to_string()))?;
                Ok(Artifact::opaque(bytes.to_vec()))
            }
            SourceKind::Secret {
                store,
                path,
                formatter,
            } => {
                let secret = store.kv_get(path).await?;
                Ok(Artifact::opaque(formatter.render(&secret)?))
            }
            SourceKind::X509 {
                store,
                mount,
                role,
                common_name,
                alt_names,
                ttl,
                issued,
            } => {
                let now = Utc::now().timestamp();
                if let Some(state) = issued.snapshot() {
                    if !state.needs_renewal(now) {
                        debug!(common_name, "serving unexpired certificate from memory");
                        return Ok(Artifact::certificate(state.parts));
                    }
                } else if let Some(state) = recover_certificate(sinks, now) {
                    debug!(common_name, "recovered unexpired certificate from destination");
                    let artifact = Artifact::certificate(state.parts.clone());
                    issued.store(state);
                    return Ok(artifact);
                }
                let cert = store
                    .pki_issue(mount, role, common_name, alt_names, *ttl)
                    .await?;
                let state = IssuedState {
                    parts: cert.parts.clone(),
                    issued_at: now,
                    expires_at: cert.expiration,
                    public_key: None,
                };
                persist_meta(sinks, &state);
                issued.store(state);
                Ok(Artifact::certificate(cert.parts))
            }
            SourceKind::Ssh {
                store,
                mount,
                role,
                public_key_file,
                principals,
                ttl,
                issued,
            } => {
                let public_key = tokio::fs::read_to_string(public_key_file)
                    .await
                    .map_err(|e| {
                        ScError::Store(format!("reading {}: {e}", public_key_file.display()))
                    })?
                    .trim()
                    .to_string();
                let now = Utc::now().timestamp();
                if let Some(state) = issued.snapshot() {
                    if state.public_key.as_deref() == Some(public_key.as_str())
                        && !state.needs_renewal(now)
                    {
                        return Ok(Artifact::opaque(state.parts.certificate.into_bytes()));
                    }
                } else if let Some(state) = recover_signed_key(sinks, &public_key, now) {
                    debug!(role, "recovered signed key from destination");
                    let artifact = Artifact::opaque(state.parts.certificate.clone().into_bytes());
                    issued.store(state);
                    return Ok(artifact);
                }
                let signed = store.ssh_sign(mount, role, &public_key, principals).await?;
                let signed = if signed.ends_with('\n') {
                    signed
                } else {
                    format!("{signed}\n")
                };
                let state = IssuedState {
                    parts: CertParts {
                        certificate: signed.clone(),
                        private_key: String::new(),
                        ca: None,
                        ca_chain: vec![],
                    },
                    issued_at: now,
                    expires_at: now + ttl.as_secs() as i64,
                    public_key: Some(public_key),
                };
                persist_meta(sinks, &state);
                issued.store(state);
                Ok(Artifact::opaque(signed.into_bytes()))
            }
            SourceKind::AcmeCache { store, path } => {
                let entry = store.kv_get(path).await?;
                let field = |name: &str| {
                    entry
                        .get(name)
                        .and_then(Value::as_str)
                        .map(str::to_string)
                };
                let certificate = field("certificate")
                    .ok_or_else(|| ScError::Store(format!("{path} carries no certificate")))?;
                let private_key = field("private_key")
                    .ok_or_else(|| ScError::Store(format!("{path} carries no private_key")))?;
                Ok(Artifact::certificate(CertParts {
                    certificate,
                    private_key,
                    ca: field("issuing_ca"),
                    ca_chain: entry
                        .get("ca_chain")
                        .and_then(Value::as_array)
                        .map(|a| {
                            a.iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materialize::sink::{FileDest, PkiSinks, SinkSet};
    use serde_json::json;
    use tempfile::TempDir;

    fn content_sinks(dir: &TempDir) -> SinkSet {
        let dest =
            FileDest::parse(&format!("file://{}/slot", dir.path().display())).unwrap();
        SinkSet::content(vec![dest]).unwrap()
    }

    fn pki_sinks(dir: &TempDir) -> SinkSet {
        let dest = |name: &str| {
            FileDest::parse(&format!("file://{}/{name}", dir.path().display())).unwrap()
        };
        SinkSet::Pki(PkiSinks {
            certificate: dest("web.crt"),
            private_key: dest("web.key"),
            ca: None,
            ca_chain: None,
        })
    }

    fn x509_source(store: Arc<StoreClient>) -> SourceKind {
        SourceKind::x509(
            store,
            "pki".into(),
            "server".into(),
            "web.example.com".into(),
            vec![],
            None,
        )
    }

    #[tokio::test]
    async fn test_x509_source_caches_until_renewal_due() {
        let dir = TempDir::new().unwrap();
        let sinks = pki_sinks(&dir);
        let (store, state) = StoreClient::in_memory();
        let source = x509_source(store);
        let first = source.fetch(&sinks).await.unwrap();
        let second = source.fetch(&sinks).await.unwrap();
        // One issuance, identical bytes on the second cycle.
        assert_eq!(*state.issued.lock().unwrap(), 1);
        assert_eq!(first.bytes, second.bytes);
    }

    #[tokio::test]
    async fn test_x509_source_recovers_after_restart() {
        let dir = TempDir::new().unwrap();
        let sinks = pki_sinks(&dir);
        let (store, state) = StoreClient::in_memory();
        let source = x509_source(Arc::clone(&store));
        let artifact = source.fetch(&sinks).await.unwrap();
        sinks.write(&artifact).unwrap();

        // A fresh source over the same destination serves from disk
        // instead of going back to the issuer.
        let restarted = x509_source(store);
        let recovered = restarted.fetch(&sinks).await.unwrap();
        assert_eq!(*state.issued.lock().unwrap(), 1);
        assert!(sinks.matches(&recovered));
    }

    #[tokio::test]
    async fn test_x509_reset_discards_recovery_state() {
        let dir = TempDir::new().unwrap();
        let sinks = pki_sinks(&dir);
        let (store, state) = StoreClient::in_memory();
        let source = x509_source(Arc::clone(&store));
        let artifact = source.fetch(&sinks).await.unwrap();
        sinks.write(&artifact).unwrap();

        let restarted = x509_source(store);
        restarted.reset(&sinks);
        restarted.fetch(&sinks).await.unwrap();
        assert_eq!(*state.issued.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ssh_source_resigns_on_key_change() {
        let dir = TempDir::new().unwrap();
        let key_file = dir.path().join("id_ed25519.pub");
        std::fs::write(&key_file, "ssh-ed25519 AAAA host\n").unwrap();
        let sinks = content_sinks(&dir);
        let (store, state) = StoreClient::in_memory();
        let source = SourceKind::ssh(
            store,
            "ssh".into(),
            "host".into(),
            key_file.clone(),
            vec!["root".into()],
            Duration::from_secs(86400),
        );
        source.fetch(&sinks).await.unwrap();
        source.fetch(&sinks).await.unwrap();
        assert_eq!(*state.ssh_signed.lock().unwrap(), 1);

        std::fs::write(&key_file, "ssh-ed25519 BBBB host\n").unwrap();
        source.fetch(&sinks).await.unwrap();
        assert_eq!(*state.ssh_signed.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ssh_source_recovers_signed_key_after_restart() {
        let dir = TempDir::new().unwrap();
        let key_file = dir.path().join("id_ed25519.pub");
        std::fs::write(&key_file, "ssh-ed25519 AAAA host\n").unwrap();
        let sinks = content_sinks(&dir);
        let (store, state) = StoreClient::in_memory();
        let source = |store: Arc<StoreClient>| {
            SourceKind::ssh(
                store,
                "ssh".into(),
                "host".into(),
                key_file.clone(),
                vec!["root".into()],
                Duration::from_secs(86400),
            )
        };
        let artifact = source(Arc::clone(&store)).fetch(&sinks).await.unwrap();
        sinks.write(&artifact).unwrap();

        let again = source(Arc::clone(&store)).fetch(&sinks).await.unwrap();
        assert_eq!(*state.ssh_signed.lock().unwrap(), 1);
        assert_eq!(artifact.bytes, again.bytes);

        // A host key that changed while the daemon was down
        // invalidates the recovered material.
        std::fs::write(&key_file, "ssh-ed25519 BBBB host\n").unwrap();
        source(store).fetch(&sinks).await.unwrap();
        assert_eq!(*state.ssh_signed.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_acme_cache_source_builds_cert_parts() {
        let dir = TempDir::new().unwrap();
        let (store, state) = StoreClient::in_memory();
        let mut entry = serde_json::Map::new();
        entry.insert("certificate".into(), json!("CERT"));
        entry.insert("private_key".into(), json!("KEY"));
        entry.insert("issuing_ca".into(), json!("CA"));
        state.kv.lock().unwrap().insert("acme/web".into(), entry);

        let source = SourceKind::AcmeCache {
            store,
            path: "acme/web".into(),
        };
        let artifact = source.fetch(&content_sinks(&dir)).await.unwrap();
        let parts = artifact.parts.unwrap();
        assert_eq!(parts.certificate, "CERT");
        assert_eq!(parts.ca.as_deref(), Some("CA"));
    }

    #[test]
    fn test_renewal_threshold() {
        assert!(!renewal_due(0, 900, 500));
        assert!(renewal_due(0, 900, 700));
        // Zero or negative lifetime always renews.
        assert!(renewal_due(100, 100, 100));
    }
}
