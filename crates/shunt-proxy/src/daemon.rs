//! Daemon: reconciles the running listen ports against each delivered configuration
//!
//! All changes to the port map happen on one control-loop task. The source's
//! callback hands each event to that loop and waits until it has been applied,
//! so a slow reconcile holds the source back rather than queueing events.

use futures::future::join_all;
use shunt_config::{callback, Config, ForwardingRule, Source, SourceEvent, Subscription};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::ProxyMetrics;
use crate::port::ListenPort;
use crate::transport::Listener;

/// What one reconcile changed, by listen key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub altered: Vec<String>,
    pub stopped: Vec<String>,
    /// Rules skipped this round because their listen address could not be bound
    pub bind_failures: Vec<String>,
}

impl ReconcileReport {
    /// True when no port was started, retargeted or stopped
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.altered.is_empty() && self.stopped.is_empty()
    }
}

/// Point-in-time view of one running port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStatus {
    pub key: String,
    pub name: String,
    pub target: String,
    pub local_addr: String,
}

/// The running port map and the algorithm that updates it
pub struct Reconciler {
    ports: HashMap<String, ListenPort>,
    metrics: Arc<dyn ProxyMetrics>,
}

impl Reconciler {
    pub fn new(metrics: Arc<dyn ProxyMetrics>) -> Self {
        Self {
            ports: HashMap::new(),
            metrics,
        }
    }

    /// Bring the running ports in line with `config`
    pub async fn apply(&mut self, config: &Config) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let wanted = dedupe(config);

        for (key, rule) in &wanted {
            if let Some(port) = self.ports.get(key) {
                if port.target().canonical() != rule.connect.canonical() {
                    port.alter(rule.connect.clone());
                    self.metrics.port_restarted(port.name());
                    report.altered.push(key.clone());
                }
                continue;
            }

            let listener = match Listener::bind(&rule.listen).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("[{}] Skipping rule: {}", rule.name, e);
                    report.bind_failures.push(key.clone());
                    continue;
                }
            };
            let port = ListenPort::start(
                rule.name.as_str(),
                key.as_str(),
                listener,
                rule.connect.clone(),
                self.metrics.clone(),
            );
            self.metrics.port_restarted(port.name());
            self.ports.insert(key.clone(), port);
            report.started.push(key.clone());
        }

        let removed: Vec<String> = self
            .ports
            .keys()
            .filter(|key| !wanted.iter().any(|(wanted_key, _)| wanted_key == *key))
            .cloned()
            .collect();
        let removed_ports: Vec<ListenPort> = removed
            .iter()
            .filter_map(|key| self.ports.remove(key))
            .collect();
        for port in &removed_ports {
            info!("[{}] Closing {}", port.name(), port.key());
            port.stop();
        }
        join_all(removed_ports.iter().map(ListenPort::drain)).await;
        report.stopped = removed;

        report
    }

    /// Stop and drain every port
    pub async fn shutdown(&mut self) {
        let ports: Vec<ListenPort> = self.ports.drain().map(|(_, port)| port).collect();
        for port in &ports {
            port.stop();
        }
        join_all(ports.iter().map(ListenPort::drain)).await;
        debug!("Stopped {} ports", ports.len());
    }

    pub fn snapshot(&self) -> Vec<PortStatus> {
        let mut ports: Vec<PortStatus> = self
            .ports
            .iter()
            .map(|(key, port)| PortStatus {
                key: key.clone(),
                name: port.name().to_string(),
                target: port.target().canonical(),
                local_addr: port.local_addr().to_string(),
            })
            .collect();
        ports.sort_by(|a, b| a.key.cmp(&b.key));
        ports
    }

    pub fn port(&self, key: &str) -> Option<&ListenPort> {
        self.ports.get(key)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// One rule per listen key, in first-appearance order; a later rule for the same key replaces the earlier one
fn dedupe(config: &Config) -> Vec<(String, &ForwardingRule)> {
    let mut wanted: Vec<(String, &ForwardingRule)> = Vec::with_capacity(config.ports.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for rule in &config.ports {
        let key = rule.listen.canonical();
        match index.get(&key) {
            Some(&i) => wanted[i].1 = rule,
            None => {
                index.insert(key.clone(), wanted.len());
                wanted.push((key, rule));
            }
        }
    }
    wanted
}

/// Commands handled by the control loop
enum DaemonCommand {
    /// Apply one source event, acknowledging once done
    Apply(SourceEvent, oneshot::Sender<()>),
    GetStatus(oneshot::Sender<Vec<PortStatus>>),
}

/// Runs the reconciler against a configuration source
pub struct Daemon {
    source: Arc<dyn Source>,
    subscription: Subscription,
    commands: mpsc::Sender<DaemonCommand>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    /// Subscribe to `source`, start it, and apply whatever it delivers
    pub async fn start(source: Arc<dyn Source>, metrics: Arc<dyn ProxyMetrics>) -> Self {
        let (commands, command_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(control_loop(
            Reconciler::new(metrics),
            command_rx,
            shutdown.clone(),
        ));

        let tx = commands.clone();
        let subscription = source
            .watch(callback(move |event| {
                let tx = tx.clone();
                async move {
                    let (done_tx, done_rx) = oneshot::channel();
                    if tx.send(DaemonCommand::Apply(event, done_tx)).await.is_ok() {
                        let _ = done_rx.await;
                    }
                }
            }))
            .await;
        source.start();
        info!("Daemon started");

        Self {
            source,
            subscription,
            commands,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Ports currently running. Empty once the daemon is stopped.
    pub async fn running(&self) -> Vec<PortStatus> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(DaemonCommand::GetStatus(reply))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop the source, then stop and drain every port. Returns once every socket is closed.
    pub async fn stop(&self) {
        self.source.unwatch(self.subscription);
        self.source.stop().await;
        self.shutdown.cancel();

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Daemon control loop failed: {}", e);
            }
            info!("Daemon stopped");
        }
    }
}

async fn control_loop(
    mut reconciler: Reconciler,
    mut commands: mpsc::Receiver<DaemonCommand>,
    shutdown: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            DaemonCommand::Apply(Ok(config), done) => {
                let report = reconciler.apply(&config).await;
                if report.is_noop() {
                    debug!("Configuration unchanged ({} ports)", reconciler.len());
                } else {
                    info!(
                        "Configuration applied: {} started, {} retargeted, {} stopped, {} running",
                        report.started.len(),
                        report.altered.len(),
                        report.stopped.len(),
                        reconciler.len()
                    );
                }
                let _ = done.send(());
            }
            DaemonCommand::Apply(Err(e), done) => {
                error!("Keeping current configuration: {}", e);
                let _ = done.send(());
            }
            DaemonCommand::GetStatus(reply) => {
                let _ = reply.send(reconciler.snapshot());
            }
        }
    }

    reconciler.shutdown().await;
}
