//! Shunt forwarding engine
//!
//! The [`Daemon`] keeps one [`ListenPort`] per configured listen address and
//! reconciles that set against every configuration its source delivers. Each
//! port accepts connections and hands each one to a [`SocketPair`], which dials
//! the backend and copies bytes both ways until either side closes.

pub mod daemon;
pub mod metrics;
pub mod pair;
pub mod port;
pub mod transport;

mod error;

pub use daemon::{Daemon, PortStatus, ReconcileReport, Reconciler};
pub use error::ProxyError;
pub use metrics::{MetricsRegistry, NoopMetrics, ProxyMetrics};
pub use pair::{PairState, SocketPair};
pub use port::ListenPort;
pub use transport::{dial, Connection, Listener};
