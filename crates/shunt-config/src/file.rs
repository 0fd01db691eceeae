//! File-backed configuration source
//!
//! Reads the file once on start, then again every time the [`ReloadTrigger`]
//! fires. The binary wires SIGHUP to the trigger; the upload endpoint fires it
//! after rewriting the file.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics::{NoopSourceMetrics, SourceMetrics};
use crate::model::{Config, ConfigError};
use crate::source::{Callback, Source, SourceEvent, Subscription, TaskSlot, Watchers};

/// Wakes a [`FileSource`] to re-read its file.
///
/// A trigger fired while the source is not waiting (before `start`, or during a
/// load) is remembered, and any number of such triggers collapse into a single
/// extra re-read once the source next waits. A change written during a load is
/// therefore never missed.
#[derive(Debug, Clone, Default)]
pub struct ReloadTrigger {
    notify: Arc<Notify>,
}

impl ReloadTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.notify.notify_one();
    }

    async fn fired(&self) {
        self.notify.notified().await;
    }
}

pub struct FileSource {
    inner: Arc<FileInner>,
    task: TaskSlot,
}

struct FileInner {
    path: PathBuf,
    trigger: ReloadTrigger,
    watchers: Watchers,
    metrics: Arc<dyn SourceMetrics>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, trigger: ReloadTrigger) -> Self {
        Self::with_metrics(path, trigger, Arc::new(NoopSourceMetrics))
    }

    pub fn with_metrics(
        path: impl Into<PathBuf>,
        trigger: ReloadTrigger,
        metrics: Arc<dyn SourceMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(FileInner {
                path: path.into(),
                trigger,
                watchers: Watchers::new(),
                metrics,
            }),
            task: TaskSlot::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn trigger(&self) -> ReloadTrigger {
        self.inner.trigger.clone()
    }

    /// The most recent successfully loaded configuration
    pub fn current(&self) -> Option<Arc<Config>> {
        self.inner.watchers.current()
    }
}

impl FileInner {
    async fn load(&self) -> SourceEvent {
        self.metrics.load_attempted();

        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(source) => {
                self.metrics.read_failed();
                return Err(ConfigError::Read {
                    path: self.path.display().to_string(),
                    source,
                }
                .into());
            }
        };

        match Config::parse(&raw) {
            Ok(config) => {
                self.metrics.load_succeeded();
                Ok(Arc::new(config))
            }
            Err(e) => {
                self.metrics.parse_failed();
                Err(e.into())
            }
        }
    }

    async fn run(self: Arc<Self>, stop: CancellationToken) {
        info!("Watching configuration file {}", self.path.display());

        loop {
            let event = self.load().await;
            if stop.is_cancelled() {
                break;
            }
            self.watchers.publish(event).await;

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = self.trigger.fired() => {
                    debug!("Reloading configuration file {}", self.path.display());
                }
            }
        }

        debug!("Stopped watching {}", self.path.display());
    }
}

#[async_trait]
impl Source for FileSource {
    fn start(&self) {
        let inner = self.inner.clone();
        self.task.start(move |stop| inner.run(stop));
    }

    async fn stop(&self) {
        self.task.stop().await;
    }

    async fn watch(&self, callback: Callback) -> Subscription {
        self.inner.watchers.subscribe(callback).await
    }

    fn unwatch(&self, subscription: Subscription) {
        self.inner.watchers.unsubscribe(subscription);
    }
}
