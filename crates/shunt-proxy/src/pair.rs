//! Socket pair: one accepted connection and the backend connection dialed for it
//!
//! A pair moves `Dialing -> Forwarding -> Closed`, or straight from `Dialing`
//! to `Closed` when the dial fails or the pair is stopped first. While
//! forwarding, one direction runs on a spawned task and the other on the
//! pair's own task. When either direction ends, both connections are closed so
//! the other direction unwinds too.

use shunt_config::Address;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::metrics::ProxyMetrics;
use crate::transport::{self, Connection};

/// Size of the buffer used by each copy direction
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Dialing,
    Forwarding,
    Closed,
}

struct PairInner {
    state: PairState,
    stopped: bool,
}

struct PairShared {
    id: u64,
    port: Arc<str>,
    target: Address,
    stop: CancellationToken,
    inner: Mutex<PairInner>,
}

impl PairShared {
    fn lock(&self) -> MutexGuard<'_, PairInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.lock().state = PairState::Closed;
    }
}

/// Handle to a running pair. Cloning shares the same pair.
#[derive(Clone)]
pub struct SocketPair {
    shared: Arc<PairShared>,
}

impl SocketPair {
    /// Start dialing `target` for `origin` on a task owned by `tracker`
    pub fn start(
        id: u64,
        port: Arc<str>,
        origin: Connection,
        target: Address,
        metrics: Arc<dyn ProxyMetrics>,
        tracker: &TaskTracker,
    ) -> Self {
        let shared = Arc::new(PairShared {
            id,
            port,
            target,
            stop: CancellationToken::new(),
            inner: Mutex::new(PairInner {
                state: PairState::Dialing,
                stopped: false,
            }),
        });
        tracker.spawn(run(shared.clone(), origin, metrics));
        Self { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn target(&self) -> &Address {
        &self.shared.target
    }

    pub fn state(&self) -> PairState {
        self.shared.lock().state
    }

    /// Close both connections. Safe to call at any point, any number of times.
    pub fn stop(&self) {
        self.shared.lock().stopped = true;
        self.shared.stop.cancel();
    }

    /// Whether the pair is still worth tracking. Pruning uses this; a pair that
    /// reports dead is simply forgotten, its task still finishes on its own.
    pub fn is_live(&self) -> bool {
        let inner = self.shared.lock();
        !inner.stopped && inner.state != PairState::Closed
    }
}

async fn run(shared: Arc<PairShared>, origin: Connection, metrics: Arc<dyn ProxyMetrics>) {
    let port = shared.port.clone();

    let dialed = tokio::select! {
        biased;
        _ = shared.stop.cancelled() => {
            debug!("[{}] Pair {} stopped while dialing", port, shared.id);
            drop(origin);
            shared.close();
            return;
        }
        dialed = transport::dial(&shared.target) => dialed,
    };

    let destination = match dialed {
        Ok(destination) => destination,
        Err(e) => {
            warn!("[{}] {}", port, e);
            metrics.dial_failed(&port);
            drop(origin);
            shared.close();
            return;
        }
    };
    metrics.backend_connected(&port);

    {
        let mut inner = shared.lock();
        if inner.stopped {
            inner.state = PairState::Closed;
            drop(inner);
            debug!("[{}] Pair {} stopped during dial", port, shared.id);
            return;
        }
        inner.state = PairState::Forwarding;
    }

    debug!(
        "[{}] Pair {} forwarding to {}",
        port, shared.id, shared.target
    );
    metrics.connection_opened(&port);
    forward(&port, origin, destination, shared.stop.child_token()).await;
    metrics.connection_closed(&port);

    shared.close();
    debug!("[{}] Pair {} closed", port, shared.id);
}

/// Copy both ways until either direction ends or `done` is cancelled, then close both sides
async fn forward(port: &Arc<str>, origin: Connection, destination: Connection, done: CancellationToken) {
    let (origin_read, origin_write) = tokio::io::split(origin);
    let (destination_read, destination_write) = tokio::io::split(destination);

    let upstream = tokio::spawn(copy_direction(
        port.clone(),
        "origin->destination",
        origin_read,
        destination_write,
        done.clone(),
    ));
    let downstream = copy_direction(
        port.clone(),
        "destination->origin",
        destination_read,
        origin_write,
        done.clone(),
    )
    .await;

    let (origin_read, destination_write) = match upstream.await {
        Ok(halves) => halves,
        Err(e) => {
            warn!("[{}] Copy task failed: {}", port, e);
            close_half(port, "origin", downstream.1).await;
            return;
        }
    };
    let (destination_read, origin_write) = downstream;

    close_half(port, "destination", destination_write).await;
    close_half(port, "origin", origin_write).await;
    drop(origin_read);
    drop(destination_read);
}

async fn copy_direction<R, W>(
    port: Arc<str>,
    direction: &'static str,
    mut reader: R,
    mut writer: W,
    done: CancellationToken,
) -> (R, W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = done.cancelled() => break,
            read = reader.read(&mut buffer) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if is_closed(&e) => break,
                Err(e) => {
                    warn!("[{}] Failed to read ({}): {}", port, direction, e);
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = done.cancelled() => break,
            written = writer.write_all(&buffer[..n]) => written,
        };
        if let Err(e) = written {
            if !is_closed(&e) {
                warn!("[{}] Failed to write ({}): {}", port, direction, e);
            }
            break;
        }
    }

    done.cancel();
    (reader, writer)
}

async fn close_half(port: &str, role: &str, mut half: WriteHalf<Connection>) {
    if let Err(e) = half.shutdown().await {
        if !is_closed(&e) {
            warn!("[{}] Failed to close {}: {}", port, role, e);
        }
    }
}

fn is_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}
