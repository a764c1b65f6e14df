//! sc-agent daemon: composition root and lifecycle supervisor.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sc_shared::ScError;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use scagentd::config::{Config, DEFAULT_CONFIG_PATH};
use scagentd::materialize::MaterializationEngine;
use scagentd::metrics::Metrics;
use scagentd::reboot::manager::{ProcUptime, RebootManager, SystemctlExecutor};
use scagentd::server::{self, AppState};
use scagentd::vault::{CredentialLifecycle, StoreClient};

/// Time tasks get to wind down after the root token cancels.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

#[derive(Debug, Parser)]
#[command(name = "scagentd", version, about = "Host agent for conditional reboots and artifact materialization")]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Log at debug level.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("scagentd v{} starting", env!("CARGO_PKG_VERSION"));
    match run(args).await {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let metrics = Arc::new(Metrics::new()?);
    let cancel = CancellationToken::new();
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<ScError>(4);
    let mut tasks: JoinSet<()> = JoinSet::new();

    // Secret-store sessions come up first; everything PKI- or
    // secret-shaped depends on them.
    let mut stores: std::collections::HashMap<String, Arc<StoreClient>> =
        std::collections::HashMap::new();
    for (name, profile) in &config.vault {
        let store = StoreClient::shared(&profile.address)?;
        let lifecycle = Arc::new(CredentialLifecycle::new(
            Arc::clone(&store),
            profile.auth_method(),
            profile.cidr_resolution(),
            profile.rotation_threshold_pct,
            profile.rotation_check_interval(),
            Arc::clone(&metrics),
        ));
        let auth = lifecycle
            .login()
            .await
            .with_context(|| format!("logging in to vault profile {name:?}"))?;

        let renew = Arc::clone(&lifecycle);
        let renew_fatal = fatal_tx.clone();
        let renew_cancel = cancel.child_token();
        tasks.spawn(async move {
            renew.renewal_loop(auth, renew_fatal, renew_cancel).await;
        });
        let rotate = Arc::clone(&lifecycle);
        let rotate_cancel = cancel.child_token();
        tasks.spawn(async move {
            rotate.rotation_loop(rotate_cancel).await;
        });
        stores.insert(name.clone(), store);
    }

    let store_for = |profile: &str| -> Result<Arc<StoreClient>> {
        stores
            .get(profile)
            .cloned()
            .with_context(|| format!("vault profile {profile:?} not configured"))
    };

    // Materialization engines, one per configured class.
    let mut engines = Vec::new();
    if let Some(section) = &config.http_replication {
        let engine = MaterializationEngine::new(
            "http",
            section.build_items()?,
            section.interval(),
            Arc::clone(&metrics),
        );
        engines.push(engine.handle());
        tasks.spawn(engine.run(cancel.child_token()));
    }
    if let Some(section) = &config.secrets_replication {
        let engine = MaterializationEngine::new(
            "secrets",
            section.build_items(store_for(&section.vault_profile)?)?,
            section.interval(),
            Arc::clone(&metrics),
        );
        engines.push(engine.handle());
        tasks.spawn(engine.run(cancel.child_token()));
    }
    if let Some(section) = &config.x509_pki {
        let engine = MaterializationEngine::new(
            "x509",
            section.build_items(store_for(&section.vault_profile)?)?,
            section.interval(),
            Arc::clone(&metrics),
        );
        engines.push(engine.handle());
        tasks.spawn(engine.run(cancel.child_token()));
    }
    if let Some(section) = &config.ssh_pki {
        let engine = MaterializationEngine::new(
            "ssh",
            section.build_items(store_for(&section.vault_profile)?)?,
            section.interval(),
            Arc::clone(&metrics),
        );
        engines.push(engine.handle());
        tasks.spawn(engine.run(cancel.child_token()));
    }
    if let Some(section) = &config.acme {
        let engine = MaterializationEngine::new(
            "acme",
            section.build_items(store_for(&section.vault_profile)?)?,
            section.interval(),
            Arc::clone(&metrics),
        );
        engines.push(engine.handle());
        tasks.spawn(engine.run(cancel.child_token()));
    }

    // Conditional reboot.
    let mut reboot_handle = None;
    if let Some(section) = &config.reboot_manager {
        let manager = RebootManager::new(
            section.build_groups()?,
            Box::new(SystemctlExecutor),
            Arc::new(ProcUptime),
            section.safe_min_uptime(),
            Arc::clone(&metrics),
        );
        reboot_handle = Some(manager.handle());
        tasks.spawn(manager.run(cancel.child_token()));
    }

    // HTTP surfaces.
    let state = Arc::new(AppState::new(
        engines,
        reboot_handle,
        Arc::clone(&metrics),
    ));
    if let Some(addr) = config.http_address()? {
        let state = Arc::clone(&state);
        let token = cancel.child_token();
        tasks.spawn(async move {
            if let Err(e) = server::run(state, addr, token).await {
                error!(error = %format!("{e:#}"), "admin API server failed");
            }
        });
    }
    if let Some(addr) = config.metrics_address()? {
        let metrics = Arc::clone(&metrics);
        let token = cancel.child_token();
        tasks.spawn(async move {
            if let Err(e) = server::run_metrics(metrics, addr, token).await {
                error!(error = %format!("{e:#}"), "metrics server failed");
            }
        });
    }
    drop(fatal_tx);

    // Supervise until a signal arrives or a lifecycle declares a
    // fatal condition.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    // A closed fatal channel means no lifecycle can fail any more, not
    // that one has.
    let fatal_wait = async {
        loop {
            match fatal_rx.recv().await {
                Some(e) => return e,
                None => std::future::pending::<()>().await,
            }
        }
    };
    let fatal: Option<ScError> = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            None
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
            None
        }
        e = fatal_wait => Some(e),
    };

    cancel.cancel();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "tasks still running after grace period, aborting them"
        );
        tasks.shutdown().await;
    }

    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
