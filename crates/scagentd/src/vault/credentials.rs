//! Credential lifecycle: login, session renewal, secret-id rotation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sc_shared::ScError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{AuthInfo, StoreClient};
use crate::materialize::sink::atomic_write;
use crate::metrics::Metrics;

/// Rotation triggers below this share of secret-id lifetime left.
pub const DEFAULT_ROTATION_THRESHOLD_PCT: f64 = 50.0;
const DEFAULT_ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(3600);
const RENEWAL_RETRIES: u32 = 3;
const MIN_RENEWAL_SLEEP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum AuthMethod {
    Token {
        token: String,
    },
    AppRole {
        role_id: String,
        /// Role name used for secret-id management endpoints.
        role_name: String,
        secret_id_file: PathBuf,
        /// The file may hold a response-wrapping token instead of the
        /// secret-id itself; it is unwrapped once and persisted back.
        wrapped: bool,
    },
}

/// How the CIDR bound to freshly minted secret-ids is determined.
#[derive(Debug, Clone)]
pub enum CidrResolution {
    /// Open a transient socket to the store and take the local address.
    Dynamic,
    Static(String),
}

pub struct CredentialLifecycle {
    store: Arc<StoreClient>,
    auth: AuthMethod,
    cidr: CidrResolution,
    rotation_threshold_pct: f64,
    rotation_check_interval: Duration,
    metrics: Arc<Metrics>,
}

impl CredentialLifecycle {
    pub fn new(
        store: Arc<StoreClient>,
        auth: AuthMethod,
        cidr: CidrResolution,
        rotation_threshold_pct: Option<f64>,
        rotation_check_interval: Option<Duration>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            auth,
            cidr,
            rotation_threshold_pct: rotation_threshold_pct
                .unwrap_or(DEFAULT_ROTATION_THRESHOLD_PCT),
            rotation_check_interval: rotation_check_interval
                .unwrap_or(DEFAULT_ROTATION_CHECK_INTERVAL),
            metrics,
        }
    }

    pub fn store(&self) -> Arc<StoreClient> {
        Arc::clone(&self.store)
    }

    /// Authenticate and install the session token on the client.
    pub async fn login(&self) -> Result<AuthInfo, ScError> {
        let auth = match &self.auth {
            AuthMethod::Token { token } => {
                self.store.set_token(token.clone()).await;
                self.store.lookup_token(token).await?
            }
            AuthMethod::AppRole {
                role_id,
                secret_id_file,
                wrapped,
                ..
            } => {
                let secret_id = self.load_secret_id(secret_id_file, *wrapped).await?;
                let auth = self.store.login_approle(role_id, &secret_id).await?;
                self.store.set_token(auth.client_token.clone()).await;
                auth
            }
        };
        info!(
            store = self.store.address(),
            lease_secs = auth.lease_duration.as_secs(),
            renewable = auth.renewable,
            "authenticated to secret store"
        );
        Ok(auth)
    }

    async fn load_secret_id(
        &self,
        file: &PathBuf,
        wrapped: bool,
    ) -> Result<String, ScError> {
        let raw = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| ScError::Auth(format!("reading {}: {e}", file.display())))?;
        let raw = raw.trim().to_string();
        if raw.is_empty() {
            return Err(ScError::Auth(format!("{} is empty", file.display())));
        }
        if !wrapped {
            return Ok(raw);
        }
        // Unwrap once and persist the unwrapped secret-id so the next
        // start does not try to reuse a spent wrapping token.
        let secret_id = self.store.unwrap(&raw).await?;
        atomic_write(file, format!("{secret_id}\n").as_bytes(), 0o600)?;
        info!(file = %file.display(), "persisted unwrapped secret-id");
        Ok(secret_id)
    }

    /// Keep the session alive. Unrecoverable failure surfaces on the
    /// fatal channel and the supervisor shuts the daemon down.
    pub async fn renewal_loop(
        &self,
        initial: AuthInfo,
        fatal: mpsc::Sender<ScError>,
        cancel: CancellationToken,
    ) {
        if !initial.renewable {
            info!("session token is not renewable, renewal loop idle");
            cancel.cancelled().await;
            return;
        }
        let mut lease = initial.lease_duration;
        loop {
            // Renew at two thirds of the lease.
            let sleep = (lease * 2 / 3).max(MIN_RENEWAL_SLEEP);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(sleep) => {}
            }
            match self.renew_with_retries(&cancel).await {
                Ok(auth) => {
                    debug!(lease_secs = auth.lease_duration.as_secs(), "session renewed");
                    self.metrics
                        .credential_renewals
                        .with_label_values(&["ok"])
                        .inc();
                    lease = auth.lease_duration;
                }
                Err(ScError::Cancelled) => return,
                Err(e) => {
                    error!(error = %e, "session renewal failed permanently");
                    self.metrics
                        .credential_renewals
                        .with_label_values(&["fatal"])
                        .inc();
                    let _ = fatal.send(ScError::Auth(format!("renewal failed: {e}"))).await;
                    return;
                }
            }
        }
    }

    async fn renew_with_retries(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AuthInfo, ScError> {
        let mut last_err = None;
        for attempt in 0..RENEWAL_RETRIES {
            match self.store.renew_self().await {
                Ok(auth) => return Ok(auth),
                Err(e) => {
                    warn!(attempt, error = %e, "session renewal attempt failed");
                    self.metrics
                        .credential_renewals
                        .with_label_values(&["retry"])
                        .inc();
                    last_err = Some(e);
                }
            }
            let backoff = Duration::from_secs(1 << attempt);
            tokio::select! {
                _ = cancel.cancelled() => return Err(ScError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
        Err(last_err.unwrap_or_else(|| ScError::Internal("no renewal attempt ran".into())))
    }

    /// Periodically rotate the approle secret-id when its remaining
    /// lifetime drops under the threshold.
    pub async fn rotation_loop(&self, cancel: CancellationToken) {
        if !matches!(self.auth, AuthMethod::AppRole { .. }) {
            cancel.cancelled().await;
            return;
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.rotation_check_interval) => {}
            }
            match self.rotate_once().await {
                Ok(true) => {
                    info!("secret-id rotated");
                    self.metrics
                        .secret_id_rotations
                        .with_label_values(&["rotated"])
                        .inc();
                }
                Ok(false) => {
                    self.metrics
                        .secret_id_rotations
                        .with_label_values(&["fresh"])
                        .inc();
                }
                Err(e) => {
                    warn!(error = %e, "secret-id rotation failed");
                    self.metrics
                        .secret_id_rotations
                        .with_label_values(&["failed"])
                        .inc();
                }
            }
        }
    }

    /// One rotation pass. Ordering is the point: generate the new
    /// secret-id, persist it, and only then destroy the old one. A
    /// failed write leaves the live secret-id untouched.
    pub async fn rotate_once(&self) -> Result<bool, ScError> {
        let (role_name, secret_id_file) = match &self.auth {
            AuthMethod::AppRole {
                role_name,
                secret_id_file,
                ..
            } => (role_name, secret_id_file),
            AuthMethod::Token { .. } => return Ok(false),
        };
        let current = tokio::fs::read_to_string(secret_id_file)
            .await
            .map_err(|e| ScError::Store(format!("reading {}: {e}", secret_id_file.display())))?
            .trim()
            .to_string();
        let ttl = self.store.secret_id_ttl(role_name, &current).await?;
        let pct = ttl.percent_remaining();
        if pct >= self.rotation_threshold_pct {
            debug!(pct, "secret-id still fresh");
            return Ok(false);
        }
        info!(pct, "secret-id below rotation threshold");
        let cidrs = self.resolve_cidrs().await?;
        let fresh = self.store.secret_id_generate(role_name, &cidrs).await?;
        atomic_write(secret_id_file, format!("{fresh}\n").as_bytes(), 0o600)?;
        // The new secret-id is durably persisted; the old one may go.
        self.store.secret_id_destroy(role_name, &current).await?;
        Ok(true)
    }

    async fn resolve_cidrs(&self) -> Result<Vec<String>, ScError> {
        match &self.cidr {
            CidrResolution::Static(cidr) => Ok(vec![cidr.clone()]),
            CidrResolution::Dynamic => {
                let addr = outbound_probe_addr(self.store.address())?;
                let stream = tokio::net::TcpStream::connect(&addr)
                    .await
                    .map_err(|e| ScError::Store(format!("probing {addr}: {e}")))?;
                let local = stream
                    .local_addr()
                    .map_err(|e| ScError::Internal(e.to_string()))?;
                Ok(vec![format!("{}/32", local.ip())])
            }
        }
    }
}

/// `host:port` the transient CIDR-resolution socket connects to.
fn outbound_probe_addr(store_addr: &str) -> Result<String, ScError> {
    let url = reqwest::Url::parse(store_addr).map_err(|e| ScError::Config(e.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| ScError::Config(format!("store address {store_addr} has no host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ScError::Config(format!("store address {store_addr} has no port")))?;
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::client::SecretIdTtl;
    use tempfile::TempDir;

    fn lifecycle(
        store: Arc<StoreClient>,
        secret_id_file: PathBuf,
    ) -> CredentialLifecycle {
        CredentialLifecycle::new(
            store,
            AuthMethod::AppRole {
                role_id: "rid".into(),
                role_name: "host".into(),
                secret_id_file,
                wrapped: false,
            },
            CidrResolution::Static("10.0.0.1/32".into()),
            None,
            None,
            Arc::new(Metrics::new().unwrap()),
        )
    }

    fn seed_ttl(state: &crate::vault::client::StaticStoreState, id: &str, pct: u64) {
        state.secret_id_ttls.lock().unwrap().insert(
            id.to_string(),
            SecretIdTtl {
                remaining: Duration::from_secs(pct),
                total: Duration::from_secs(100),
            },
        );
    }

    #[tokio::test]
    async fn test_rotation_replaces_then_destroys() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("secret-id");
        std::fs::write(&file, "old-id\n").unwrap();
        let (store, state) = StoreClient::in_memory();
        seed_ttl(&state, "old-id", 20);

        let lc = lifecycle(store, file.clone());
        assert!(lc.rotate_once().await.unwrap());

        let persisted = std::fs::read_to_string(&file).unwrap();
        assert_eq!(persisted.trim(), "secret-id-1");
        assert_eq!(*state.destroyed.lock().unwrap(), vec!["old-id".to_string()]);
    }

    #[tokio::test]
    async fn test_fresh_secret_id_not_rotated() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("secret-id");
        std::fs::write(&file, "old-id\n").unwrap();
        let (store, state) = StoreClient::in_memory();
        seed_ttl(&state, "old-id", 80);

        let lc = lifecycle(store, file.clone());
        assert!(!lc.rotate_once().await.unwrap());
        assert!(state.destroyed.lock().unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(&file).unwrap().trim(), "old-id");
    }

    #[tokio::test]
    async fn test_failed_generation_keeps_live_secret_id() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("secret-id");
        std::fs::write(&file, "old-id\n").unwrap();
        let (store, state) = StoreClient::in_memory();
        seed_ttl(&state, "old-id", 10);
        *state.fail_generate.lock().unwrap() = true;

        let lc = lifecycle(store, file.clone());
        assert!(lc.rotate_once().await.is_err());
        // Nothing destroyed, file untouched.
        assert!(state.destroyed.lock().unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(&file).unwrap().trim(), "old-id");
    }

    #[tokio::test]
    async fn test_wrapped_secret_id_unwrapped_and_persisted() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("secret-id");
        std::fs::write(&file, "wrapping-token\n").unwrap();
        let (store, state) = StoreClient::in_memory();
        state
            .wrapped
            .lock()
            .unwrap()
            .insert("wrapping-token".into(), "real-secret-id".into());

        let lc = CredentialLifecycle::new(
            store,
            AuthMethod::AppRole {
                role_id: "rid".into(),
                role_name: "host".into(),
                secret_id_file: file.clone(),
                wrapped: true,
            },
            CidrResolution::Dynamic,
            None,
            None,
            Arc::new(Metrics::new().unwrap()),
        );
        lc.login().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&file).unwrap().trim(),
            "real-secret-id"
        );
    }

    #[test]
    fn test_outbound_probe_addr() {
        assert_eq!(
            outbound_probe_addr("https://vault.example.com:8200").unwrap(),
            "vault.example.com:8200"
        );
        assert_eq!(
            outbound_probe_addr("https://vault.example.com").unwrap(),
            "vault.example.com:443"
        );
        assert!(outbound_probe_addr("not a url").is_err());
    }
}
