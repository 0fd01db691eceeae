//! ZooKeeper binding for [`CoordinationSource`](crate::coordination::CoordinationSource)

use async_trait::async_trait;
use zookeeper_client as zk;

use crate::coordination::{
    CoordinationError, CoordinationSession, Coordinator, FailureKind, WatchEvent, WatchFuture,
};

/// Environment variable consulted when no server list is given
pub const SERVERS_ENV: &str = "ZOOKEEPER_SERVERS";

/// Server list used when neither the caller nor the environment provides one
pub const DEFAULT_SERVERS: &str = "127.0.0.1:2181";

pub struct ZooKeeperCoordinator {
    cluster: String,
}

impl ZooKeeperCoordinator {
    /// `servers` is a comma-separated `host:port` list; empty falls back to
    /// `$ZOOKEEPER_SERVERS`, then to `127.0.0.1:2181`
    pub fn new(servers: &str) -> Self {
        let servers = if servers.is_empty() {
            std::env::var(SERVERS_ENV).unwrap_or_default()
        } else {
            servers.to_string()
        };
        let cluster = if servers.is_empty() {
            DEFAULT_SERVERS.to_string()
        } else {
            servers
        };
        Self { cluster }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }
}

fn map_error(err: zk::Error) -> CoordinationError {
    let kind = match err {
        zk::Error::NoNode => FailureKind::NoNode,
        zk::Error::ConnectionLoss | zk::Error::SessionMoved | zk::Error::Timeout => {
            FailureKind::Transient
        }
        zk::Error::NoHosts => FailureKind::Unavailable,
        _ => FailureKind::Fatal,
    };
    CoordinationError::new(kind, err.to_string())
}

fn map_event(event: zk::WatchedEvent) -> WatchEvent {
    match event.event_type {
        zk::EventType::NodeCreated => WatchEvent::Created,
        zk::EventType::NodeDeleted => WatchEvent::Deleted,
        zk::EventType::NodeDataChanged => WatchEvent::DataChanged,
        zk::EventType::Session => WatchEvent::SessionLost,
        _ => WatchEvent::Other,
    }
}

fn watch_future(watcher: zk::OneshotWatcher) -> WatchFuture {
    Box::pin(async move { map_event(watcher.changed().await) })
}

#[async_trait]
impl Coordinator for ZooKeeperCoordinator {
    async fn connect(&self) -> Result<Box<dyn CoordinationSession>, CoordinationError> {
        let client = zk::Client::connect(&self.cluster).await.map_err(map_error)?;
        Ok(Box::new(ZooKeeperSession { client }))
    }
}

struct ZooKeeperSession {
    client: zk::Client,
}

#[async_trait]
impl CoordinationSession for ZooKeeperSession {
    async fn exists_watch(&self, path: &str) -> Result<(bool, WatchFuture), CoordinationError> {
        let (stat, watcher) = self
            .client
            .check_and_watch_stat(path)
            .await
            .map_err(map_error)?;
        Ok((stat.is_some(), watch_future(watcher)))
    }

    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, WatchFuture), CoordinationError> {
        let (data, _stat, watcher) = self
            .client
            .get_and_watch_data(path)
            .await
            .map_err(map_error)?;
        Ok((data, watch_future(watcher)))
    }
}
