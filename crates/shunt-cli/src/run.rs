//! `shunt run`: the forwarding daemon

use anyhow::{bail, Context, Result};
use shunt_config::{FileSource, ReloadTrigger, Source, SourceMetrics};
use shunt_proxy::{Daemon, MetricsRegistry};
use shunt_signed::{FileApplier, HttpSource, KeyRing, PullOptions, UploadState};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admin::admin_router;
use crate::signals::{SignalEvent, Signals};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub keyring: Option<PathBuf>,
    pub admin_addr: Option<SocketAddr>,
    pub zk_servers: Option<String>,
    pub zk_path: Option<String>,
    pub pull_url: Option<String>,
}

/// The configuration source picked from the command line, plus what hangs off it
pub struct SelectedSource {
    pub source: Arc<dyn Source>,
    /// Present for the file source; SIGHUP and uploads fire it
    pub trigger: Option<ReloadTrigger>,
    /// Present when uploads can be verified and written back
    pub upload: Option<UploadState>,
}

fn load_keyring(path: &Path) -> Result<KeyRing> {
    let keyring = KeyRing::load(path)
        .with_context(|| format!("Failed to load keyring {}", path.display()))?;
    info!("Trusting {} signing key(s) from {}", keyring.len(), path.display());
    Ok(keyring)
}

pub fn select_source(
    options: &RunOptions,
    metrics: Arc<dyn SourceMetrics>,
) -> Result<SelectedSource> {
    let chosen = [
        options.config.is_some(),
        options.zk_path.is_some(),
        options.pull_url.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if chosen > 1 {
        bail!("Choose one of --config, --zk-path or --pull-url");
    }

    if let Some(url) = &options.pull_url {
        let Some(keyring) = &options.keyring else {
            bail!("--pull-url requires --keyring to verify the grove's signature");
        };
        info!("Pulling configuration from {}", url);
        let source = HttpSource::with_options(
            url.clone(),
            load_keyring(keyring)?,
            PullOptions::default(),
            metrics,
        );
        return Ok(SelectedSource {
            source: Arc::new(source),
            trigger: None,
            upload: None,
        });
    }

    if let Some(path) = &options.zk_path {
        return coordination_source(options.zk_servers.as_deref().unwrap_or_default(), path, metrics);
    }

    let Some(path) = &options.config else {
        bail!("No configuration source: pass --config, --zk-path or --pull-url");
    };
    info!("Reading configuration from {}", path.display());
    let trigger = ReloadTrigger::new();
    let source = FileSource::with_metrics(path, trigger.clone(), metrics);
    let upload = match &options.keyring {
        Some(keyring) => Some(UploadState::new(
            load_keyring(keyring)?,
            Arc::new(FileApplier::new(path, trigger.clone())),
        )),
        None => None,
    };

    Ok(SelectedSource {
        source: Arc::new(source),
        trigger: Some(trigger),
        upload,
    })
}

#[cfg(feature = "zookeeper")]
fn coordination_source(
    servers: &str,
    path: &str,
    metrics: Arc<dyn SourceMetrics>,
) -> Result<SelectedSource> {
    use shunt_config::zookeeper::ZooKeeperCoordinator;
    use shunt_config::{CoordinationOptions, CoordinationSource};

    let coordinator = ZooKeeperCoordinator::new(servers);
    info!("Watching {} on {}", path, coordinator.cluster());
    let source = CoordinationSource::with_options(
        Arc::new(coordinator),
        path,
        CoordinationOptions::default(),
        metrics,
    );
    Ok(SelectedSource {
        source: Arc::new(source),
        trigger: None,
        upload: None,
    })
}

#[cfg(not(feature = "zookeeper"))]
fn coordination_source(
    _servers: &str,
    _path: &str,
    _metrics: Arc<dyn SourceMetrics>,
) -> Result<SelectedSource> {
    bail!("--zk-path needs a build with the `zookeeper` feature")
}

pub async fn run(options: RunOptions) -> Result<()> {
    let mut signals = Signals::new()?;
    let metrics = Arc::new(MetricsRegistry::new());
    let selected = select_source(&options, metrics.clone())?;

    let admin_addr = options
        .admin_addr
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 9090)));
    let listener = TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("Failed to bind admin listener on {}", admin_addr))?;
    if selected.upload.is_some() {
        info!("Accepting signed uploads on http://{}/upload", admin_addr);
    }
    info!("Serving metrics on http://{}/metrics", admin_addr);

    let router = admin_router(metrics.clone(), selected.upload);
    let server_shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let token = server_shutdown.clone();
        async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        }
    });

    let daemon = Daemon::start(selected.source, metrics).await;
    for port in daemon.running().await {
        info!(
            "Port {} listening on {} -> {}",
            port.name, port.local_addr, port.target
        );
    }

    loop {
        match signals.next().await {
            SignalEvent::Reload => match &selected.trigger {
                Some(trigger) => {
                    info!("Reloading configuration");
                    trigger.fire();
                }
                None => info!("Ignoring reload: configuration is not read from a file"),
            },
            SignalEvent::Shutdown => break,
        }
    }

    info!("Shutting down");
    server_shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Admin listener failed: {}", e),
        Err(e) => warn!("Admin listener task failed: {}", e),
    }
    daemon.stop().await;
    info!("Stopped");
    Ok(())
}
