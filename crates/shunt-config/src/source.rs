//! Configuration sources
//!
//! A [`Source`] is a long-lived task that produces a sequence of
//! configurations (or errors) and hands each one to every subscriber.
//! Subscribing replays the most recent successfully loaded configuration,
//! so a late subscriber always starts from the current state when one exists.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::model::{Config, ConfigError};

/// Errors delivered to subscribers. Transient transport failures never show up here;
/// sources retry those internally.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("failed to read configuration: {0}")]
    Read(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("coordination service error: {0}")]
    Coordination(String),

    #[error("configuration signature rejected: {0}")]
    Signature(String),
}

impl From<ConfigError> for SourceError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Read { .. } => SourceError::Read(err.to_string()),
            ConfigError::Parse(_) | ConfigError::Serialize(_) => {
                SourceError::Parse(err.to_string())
            }
        }
    }
}

/// One delivery from a source
pub type SourceEvent = Result<Arc<Config>, SourceError>;

/// Subscriber callback. The source awaits the returned future before moving on,
/// so a slow subscriber holds the source back instead of queueing events.
pub type Callback = Arc<dyn Fn(SourceEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`Callback`]
pub fn callback<F, Fut>(f: F) -> Callback
where
    F: Fn(SourceEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| -> BoxFuture<'static, ()> { Box::pin(f(event)) })
}

/// Handle returned by [`Watchers::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct WatchersInner {
    next_id: u64,
    callbacks: Vec<(u64, Callback)>,
    current: Option<Arc<Config>>,
}

/// Observer registry shared by every source implementation
#[derive(Default)]
pub struct Watchers {
    inner: Mutex<WatchersInner>,
    // Held across a whole publish or replay so each subscriber sees events in order.
    delivery: tokio::sync::Mutex<()>,
}

impl Watchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback and replay the current configuration to it, if any
    pub async fn subscribe(&self, callback: Callback) -> Subscription {
        let _delivery = self.delivery.lock().await;

        let (id, current) = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.callbacks.push((id, callback.clone()));
            (id, inner.current.clone())
        };

        if let Some(config) = current {
            callback(Ok(config)).await;
        }

        Subscription(id)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        lock(&self.inner)
            .callbacks
            .retain(|(id, _)| *id != subscription.0);
    }

    /// The most recent successfully loaded configuration
    pub fn current(&self) -> Option<Arc<Config>> {
        lock(&self.inner).current.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).callbacks.len()
    }

    /// Deliver an event to every subscriber. Errors leave the current configuration alone.
    pub async fn publish(&self, event: SourceEvent) {
        let _delivery = self.delivery.lock().await;

        let callbacks: Vec<Callback> = {
            let mut inner = lock(&self.inner);
            if let Ok(config) = &event {
                inner.current = Some(config.clone());
            }
            inner.callbacks.iter().map(|(_, cb)| cb.clone()).collect()
        };

        for callback in callbacks {
            callback(event.clone()).await;
        }
    }
}

/// Configuration over time
#[async_trait]
pub trait Source: Send + Sync {
    /// Start the background task. Starting twice, or after `stop`, does nothing.
    fn start(&self);

    /// Stop the background task and wait for it to release its resources.
    /// Nothing is delivered after this returns.
    async fn stop(&self);

    /// Register a subscriber, replaying the current configuration if there is one
    async fn watch(&self, callback: Callback) -> Subscription;

    fn unwatch(&self, subscription: Subscription);
}

/// Owns the background task of a source and its stop signal
#[derive(Default)]
pub struct TaskSlot {
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the task built by `make`, unless one was already spawned or the slot is stopped
    pub fn start<F, Fut>(&self, make: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut task = lock(&self.task);
        if task.is_some() || self.stop.is_cancelled() {
            return;
        }
        *task = Some(tokio::spawn(make(self.stop.clone())));
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Signal the task and wait for it to exit
    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Configuration source task panicked: {}", e);
                }
            }
        }
    }
}

/// A source fed by hand, for embedding the daemon in another program
#[derive(Default)]
pub struct ManualSource {
    watchers: Watchers,
    stop: CancellationToken,
}

impl ManualSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a configuration to every subscriber
    pub async fn set(&self, config: Config) {
        self.publish(Ok(Arc::new(config))).await;
    }

    /// Publish an arbitrary event. Ignored once the source is stopped.
    pub async fn publish(&self, event: SourceEvent) {
        if self.stop.is_cancelled() {
            return;
        }
        self.watchers.publish(event).await;
    }
}

#[async_trait]
impl Source for ManualSource {
    fn start(&self) {}

    async fn stop(&self) {
        self.stop.cancel();
    }

    async fn watch(&self, callback: Callback) -> Subscription {
        self.watchers.subscribe(callback).await
    }

    fn unwatch(&self, subscription: Subscription) {
        self.watchers.unsubscribe(subscription);
    }
}
