//! The materialization loop: fetch → validate → diff → write → hooks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sc_shared::status::ItemStatus;
use sc_shared::ScError;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hooks::{run_hooks, Hook};
use super::sink::SinkSet;
use super::source::SourceKind;
use crate::metrics::Metrics;

/// Jitter window subtracted from the base interval and re-added as a
/// uniform random delay per tick.
pub const DEFAULT_JITTER: Duration = Duration::from_secs(5 * 60);

/// One managed artifact.
pub struct ReplicationItem {
    pub id: String,
    pub source: SourceKind,
    /// Pinned content digest; mismatching fetches are rejected.
    pub expected_sha256: Option<String>,
    pub sinks: SinkSet,
    pub hooks: Vec<Hook>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Written,
    Unchanged,
    /// Destination already held the fetched content on first
    /// observation; digest cached without writing or running hooks.
    Adopted,
}

impl CycleOutcome {
    fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Written => "written",
            CycleOutcome::Unchanged => "unchanged",
            CycleOutcome::Adopted => "adopted",
        }
    }
}

pub enum EngineCommand {
    Materialize {
        id: String,
        force: bool,
        reply: oneshot::Sender<Result<(CycleOutcome, String), ScError>>,
    },
}

/// Read side of an engine, shared with the admin API.
#[derive(Clone)]
pub struct EngineHandle {
    class: &'static str,
    status: Arc<RwLock<HashMap<String, ItemStatus>>>,
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub fn class(&self) -> &'static str {
        self.class
    }

    pub async fn list(&self) -> Vec<ItemStatus> {
        let mut items: Vec<ItemStatus> = self.status.read().await.values().cloned().collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    pub async fn get(&self, id: &str) -> Option<ItemStatus> {
        self.status.read().await.get(id).cloned()
    }

    /// Ask the owning engine task to materialize one item now.
    pub async fn materialize(
        &self,
        id: &str,
        force: bool,
    ) -> Result<(CycleOutcome, String), ScError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Materialize {
                id: id.to_string(),
                force,
                reply,
            })
            .await
            .map_err(|_| ScError::Internal("engine task gone".into()))?;
        rx.await
            .map_err(|_| ScError::Internal("engine dropped the request".into()))?
    }
}

/// Periodic, jittered loop over one class of replication items. The
/// engine owns its digest cache; cycles for the same item never
/// overlap because the whole engine is one task.
pub struct MaterializationEngine {
    class: &'static str,
    items: Vec<ReplicationItem>,
    base_interval: Duration,
    jitter: Duration,
    cache: HashMap<String, String>,
    status: Arc<RwLock<HashMap<String, ItemStatus>>>,
    commands: mpsc::Receiver<EngineCommand>,
    handle: EngineHandle,
    metrics: Arc<Metrics>,
}

impl MaterializationEngine {
    pub fn new(
        class: &'static str,
        items: Vec<ReplicationItem>,
        base_interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::with_jitter(class, items, base_interval, DEFAULT_JITTER, metrics)
    }

    pub fn with_jitter(
        class: &'static str,
        items: Vec<ReplicationItem>,
        base_interval: Duration,
        jitter: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        let base_interval = base_interval.max(jitter);
        let status_map: HashMap<String, ItemStatus> = items
            .iter()
            .map(|item| {
                (
                    item.id.clone(),
                    ItemStatus {
                        id: item.id.clone(),
                        source: item.source.describe(),
                        destinations: item.sinks.uris(),
                        last_digest: None,
                        last_materialized: None,
                    },
                )
            })
            .collect();
        let status = Arc::new(RwLock::new(status_map));
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let handle = EngineHandle {
            class,
            status: Arc::clone(&status),
            commands: cmd_tx,
        };
        Self {
            class,
            items,
            base_interval,
            jitter,
            cache: HashMap::new(),
            status,
            commands: cmd_rx,
            handle,
            metrics,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        // First pass runs immediately so a fresh start converges fast.
        self.cycle_all(&cancel).await;
        let tick = self.base_interval.saturating_sub(self.jitter / 2);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = self.commands.recv() => {
                    match command {
                        Some(cmd) => self.handle_command(cmd, &cancel).await,
                        None => break,
                    }
                }
                _ = tokio::time::sleep(tick) => {
                    let delay = if self.jitter.is_zero() {
                        Duration::ZERO
                    } else {
                        rand::thread_rng().gen_range(Duration::ZERO..self.jitter)
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.cycle_all(&cancel).await;
                }
            }
        }
        debug!(class = self.class, "materialization engine stopped");
    }

    async fn handle_command(&mut self, command: EngineCommand, cancel: &CancellationToken) {
        match command {
            EngineCommand::Materialize { id, force, reply } => {
                let result = match self.items.iter().position(|i| i.id == id) {
                    Some(idx) => match self.cycle_item(idx, force, cancel).await {
                        Ok(outcome) => {
                            self.metrics
                                .materializations
                                .with_label_values(&[self.class, outcome.label()])
                                .inc();
                            let digest = self.cache.get(&id).cloned().unwrap_or_default();
                            Ok((outcome, digest))
                        }
                        Err(ScError::Cancelled) => Err(ScError::Cancelled),
                        Err(e) => {
                            self.metrics
                                .materializations
                                .with_label_values(&[self.class, "failed"])
                                .inc();
                            Err(e)
                        }
                    },
                    None => Err(ScError::NotFound(id)),
                };
                let _ = reply.send(result);
            }
        }
    }

    /// Items are processed sequentially within one tick.
    async fn cycle_all(&mut self, cancel: &CancellationToken) {
        for idx in 0..self.items.len() {
            if cancel.is_cancelled() {
                return;
            }
            let id = self.items[idx].id.clone();
            match self.cycle_item(idx, false, cancel).await {
                Ok(outcome) => {
                    self.metrics
                        .materializations
                        .with_label_values(&[self.class, outcome.label()])
                        .inc();
                    if outcome == CycleOutcome::Written {
                        info!(class = self.class, item = %id, "materialized");
                    }
                }
                Err(ScError::Cancelled) => return,
                Err(e) => {
                    self.metrics
                        .materializations
                        .with_label_values(&[self.class, "failed"])
                        .inc();
                    warn!(class = self.class, item = %id, error = %e, "materialization failed");
                }
            }
        }
    }

    /// One materialization attempt for one item. A forced attempt
    /// drops issuance caches and rewrites even when nothing changed.
    async fn cycle_item(
        &mut self,
        idx: usize,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, ScError> {
        let item = &self.items[idx];
        if force {
            item.source.reset(&item.sinks);
        }
        let artifact = tokio::select! {
            _ = cancel.cancelled() => return Err(ScError::Cancelled),
            result = item.source.fetch(&item.sinks) => result?,
        };
        let digest = sha256_hex(&artifact.bytes);

        // A pinned digest mismatch is invalid data: no cache update, no
        // write, no hooks.
        if let Some(expected) = &item.expected_sha256 {
            if !expected.eq_ignore_ascii_case(&digest) {
                return Err(ScError::InvalidChecksum {
                    id: item.id.clone(),
                    expected: expected.clone(),
                    actual: digest,
                });
            }
        }

        let previous = self.cache.get(&item.id).cloned();
        if !force && previous.as_deref() == Some(digest.as_str()) {
            return Ok(CycleOutcome::Unchanged);
        }

        // First observation: adopt matching destination content rather
        // than rewriting it, so a daemon restart does not re-fire hooks.
        if !force && previous.is_none() && item.sinks.matches(&artifact) {
            self.cache.insert(item.id.clone(), digest.clone());
            self.publish_status(idx, &digest).await;
            return Ok(CycleOutcome::Adopted);
        }

        self.cache.insert(item.id.clone(), digest.clone());

        if cancel.is_cancelled() {
            // Abort before touching the destination; roll the cache
            // back so the next start retries the write.
            restore_cache(&mut self.cache, &self.items[idx].id, previous);
            return Err(ScError::Cancelled);
        }
        let item = &self.items[idx];
        if let Err(e) = item.sinks.write(&artifact) {
            restore_cache(&mut self.cache, &item.id, previous);
            return Err(e);
        }
        self.publish_status(idx, &digest).await;

        if let Err(e) = run_hooks(&item.hooks).await {
            // The write stands; hook failures are reported, not rolled
            // back.
            warn!(class = self.class, item = %item.id, error = %e, "post-hooks failed");
            self.metrics.hook_runs.with_label_values(&["failed"]).inc();
        } else if !item.hooks.is_empty() {
            self.metrics.hook_runs.with_label_values(&["ok"]).inc();
        }
        Ok(CycleOutcome::Written)
    }

    async fn publish_status(&self, idx: usize, digest: &str) {
        let item = &self.items[idx];
        let mut status = self.status.write().await;
        if let Some(entry) = status.get_mut(&item.id) {
            entry.last_digest = Some(digest.to_string());
            entry.last_materialized = Some(chrono::Utc::now());
        }
    }
}

fn restore_cache(cache: &mut HashMap<String, String>, id: &str, previous: Option<String>) {
    match previous {
        Some(digest) => cache.insert(id.to_string(), digest),
        None => cache.remove(id),
    };
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
