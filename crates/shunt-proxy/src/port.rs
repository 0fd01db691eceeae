//! Listen port: one bound listener and the pairs it has accepted
//!
//! The target address and the pair list share one lock, so a connection
//! accepted during [`ListenPort::alter`] either sees the old target and is
//! stopped by the alter, or sees the new target and survives it.

use shunt_config::Address;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::metrics::ProxyMetrics;
use crate::pair::SocketPair;
use crate::transport::Listener;

struct PortState {
    target: Address,
    pairs: Vec<SocketPair>,
}

struct PortShared {
    name: Arc<str>,
    key: String,
    local_addr: String,
    state: Mutex<PortState>,
    next_pair_id: AtomicU64,
    metrics: Arc<dyn ProxyMetrics>,
}

impl PortShared {
    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ListenPort {
    shared: Arc<PortShared>,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl ListenPort {
    /// Start accepting on an already bound listener
    pub fn start(
        name: impl Into<Arc<str>>,
        key: impl Into<String>,
        listener: Listener,
        target: Address,
        metrics: Arc<dyn ProxyMetrics>,
    ) -> Self {
        let shared = Arc::new(PortShared {
            name: name.into(),
            key: key.into(),
            local_addr: listener.local_addr().to_string(),
            state: Mutex::new(PortState {
                target,
                pairs: Vec::new(),
            }),
            next_pair_id: AtomicU64::new(1),
            metrics,
        });
        let stop = CancellationToken::new();
        let tracker = TaskTracker::new();

        info!(
            "[{}] Listening on {} -> {}",
            shared.name,
            shared.local_addr,
            shared.lock().target
        );
        tracker.spawn(accept_loop(
            shared.clone(),
            listener,
            stop.clone(),
            tracker.clone(),
        ));

        Self {
            shared,
            stop,
            tracker,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Canonical listen address this port was configured with
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Address actually bound, with any port 0 resolved
    pub fn local_addr(&self) -> &str {
        &self.shared.local_addr
    }

    pub fn target(&self) -> Address {
        self.shared.lock().target.clone()
    }

    /// Point the port at a new backend. Every existing pair is stopped; the
    /// listener is kept.
    pub fn alter(&self, target: Address) {
        let evicted = {
            let mut state = self.shared.lock();
            info!(
                "[{}] Retargeting {} -> {}",
                self.shared.name, state.target, target
            );
            state.target = target;
            std::mem::take(&mut state.pairs)
        };
        for pair in &evicted {
            pair.stop();
        }
        debug!("[{}] Stopped {} pairs", self.shared.name, evicted.len());
    }

    /// Stop accepting and stop every pair. Returns without waiting.
    pub fn stop(&self) {
        self.stop.cancel();
        let pairs = std::mem::take(&mut self.shared.lock().pairs);
        for pair in &pairs {
            pair.stop();
        }
    }

    /// Wait for the accept loop and every pair task to finish
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        debug!("[{}] Drained", self.shared.name);
    }

    pub async fn stop_and_drain(&self) {
        self.stop();
        self.drain().await;
    }

    /// Number of pairs that are still dialing or forwarding
    pub fn live_pairs(&self) -> usize {
        self.shared
            .lock()
            .pairs
            .iter()
            .filter(|pair| pair.is_live())
            .count()
    }
}

async fn accept_loop(
    shared: Arc<PortShared>,
    listener: Listener,
    stop: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (connection, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("[{}] Failed to accept: {}", shared.name, e);
                break;
            }
        };
        debug!("[{}] Accepted connection from {}", shared.name, peer);
        shared.metrics.connection_accepted(&shared.name);

        let id = shared.next_pair_id.fetch_add(1, Ordering::Relaxed);
        let mut state = shared.lock();
        let pair = SocketPair::start(
            id,
            shared.name.clone(),
            connection,
            state.target.clone(),
            shared.metrics.clone(),
            &tracker,
        );
        state.pairs.retain(SocketPair::is_live);
        state.pairs.push(pair);
    }

    drop(listener);
    let pairs = std::mem::take(&mut shared.lock().pairs);
    for pair in &pairs {
        pair.stop();
    }
    debug!("[{}] Accept loop exited", shared.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    async fn bound() -> (Listener, String) {
        let listener = Listener::bind(&Address::tcp("127.0.0.1:0")).await.unwrap();
        let addr = listener.local_addr().trim_start_matches("tcp://").to_string();
        (listener, addr)
    }

    async fn backend() -> (TcpListener, Address) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = Address::tcp(listener.local_addr().unwrap().to_string());
        (listener, address)
    }

    async fn read_eof(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 16];
        matches!(
            timeout(Duration::from_secs(5), stream.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    #[tokio::test]
    async fn test_alter_keeps_listener_and_stops_pairs() {
        let (listener, addr) = bound().await;
        let (first_backend, first) = backend().await;
        let (second_backend, second) = backend().await;

        let port = ListenPort::start("web", "tcp://127.0.0.1:0", listener, first, Arc::new(NoopMetrics));

        let mut client = TcpStream::connect(&addr).await.unwrap();
        let (mut server, _) = first_backend.accept().await.unwrap();
        client.write_all(b"a").await.unwrap();
        let mut buf = [0u8; 1];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(port.live_pairs(), 1);

        port.alter(second.clone());
        assert_eq!(port.target(), second);
        assert!(read_eof(&mut client).await);
        assert_eq!(port.live_pairs(), 0);

        let mut client = TcpStream::connect(&addr).await.unwrap();
        let (mut server, _) = second_backend.accept().await.unwrap();
        client.write_all(b"b").await.unwrap();
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"b");

        port.stop_and_drain().await;
    }

    #[tokio::test]
    async fn test_stop_releases_listener() {
        let (listener, addr) = bound().await;
        let (_backend, target) = backend().await;

        let port = ListenPort::start("web", "tcp://127.0.0.1:0", listener, target, Arc::new(NoopMetrics));
        assert_eq!(port.local_addr(), format!("tcp://{}", addr));

        timeout(Duration::from_secs(5), port.stop_and_drain())
            .await
            .unwrap();
        assert!(TcpListener::bind(&addr).await.is_ok());
    }
}
