//! Binding and dialing by address family
//!
//! Supported families are `tcp`, `tcp4`, `tcp6` and `unix`. A TCP location
//! with no host (`:9001`) listens on every interface and dials loopback.

use shunt_config::Address;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

impl Family {
    fn of(address: &Address) -> Result<Self, ProxyError> {
        match address.family.as_str() {
            "tcp" | "" => Ok(Family::Tcp),
            "tcp4" => Ok(Family::Tcp4),
            "tcp6" => Ok(Family::Tcp6),
            "unix" => Ok(Family::Unix),
            other => Err(ProxyError::UnsupportedFamily(other.to_string())),
        }
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Tcp => true,
            Family::Tcp4 => addr.is_ipv4(),
            Family::Tcp6 => addr.is_ipv6(),
            Family::Unix => false,
        }
    }

    /// Fill in the host of a `:port` location
    fn host_port(self, location: &str, listening: bool) -> String {
        if !location.starts_with(':') {
            return location.to_string();
        }
        let host = match (self, listening) {
            (Family::Tcp6, true) => "[::]",
            (Family::Tcp6, false) => "[::1]",
            (_, true) => "0.0.0.0",
            (_, false) => "127.0.0.1",
        };
        format!("{}{}", host, location)
    }

    async fn resolve(self, location: &str, listening: bool) -> io::Result<Vec<SocketAddr>> {
        let host_port = self.host_port(location, listening);
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&host_port)
            .await?
            .filter(|addr| self.accepts(addr))
            .collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no usable address for {}", host_port),
            ));
        }
        Ok(addrs)
    }
}

/// A bound listener. Unix-domain listeners remove their socket file when dropped.
#[derive(Debug)]
pub struct Listener {
    kind: ListenerKind,
    local: String,
}

#[derive(Debug)]
enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
}

impl Listener {
    pub async fn bind(address: &Address) -> Result<Self, ProxyError> {
        let bind_error = |source| ProxyError::Bind {
            address: address.canonical(),
            source,
        };

        match Family::of(address)? {
            Family::Unix => Self::bind_unix(address),
            family => {
                let addrs = family
                    .resolve(&address.location, true)
                    .await
                    .map_err(bind_error)?;
                let listener = TcpListener::bind(&addrs[..]).await.map_err(bind_error)?;
                let local = match listener.local_addr() {
                    Ok(local) => format!("{}://{}", address.family, local),
                    Err(_) => address.canonical(),
                };
                Ok(Self {
                    kind: ListenerKind::Tcp(listener),
                    local,
                })
            }
        }
    }

    #[cfg(unix)]
    fn bind_unix(address: &Address) -> Result<Self, ProxyError> {
        let path = PathBuf::from(&address.location);
        let listener = UnixListener::bind(&path).map_err(|source| ProxyError::Bind {
            address: address.canonical(),
            source,
        })?;
        Ok(Self {
            kind: ListenerKind::Unix { listener, path },
            local: address.canonical(),
        })
    }

    #[cfg(not(unix))]
    fn bind_unix(address: &Address) -> Result<Self, ProxyError> {
        Err(ProxyError::UnsupportedFamily(address.family.clone()))
    }

    /// Actual bound address in `family://location` form (resolves port 0)
    pub fn local_addr(&self) -> &str {
        &self.local
    }

    /// Accept one connection, returning it with a printable peer address
    pub async fn accept(&self) -> io::Result<(Connection, String)> {
        match &self.kind {
            ListenerKind::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                set_nodelay(&stream);
                Ok((Connection::Tcp(stream), peer.to_string()))
            }
            #[cfg(unix)]
            ListenerKind::Unix { listener, .. } => {
                let (stream, peer) = listener.accept().await?;
                let peer = peer
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unix:@".to_string());
                Ok((Connection::Unix(stream), peer))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let ListenerKind::Unix { path, .. } = &self.kind {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove socket {}: {}", path.display(), e),
            }
        }
    }
}

fn set_nodelay(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
}

/// Dial a backend address
pub async fn dial(address: &Address) -> Result<Connection, ProxyError> {
    let dial_error = |source| ProxyError::Dial {
        address: address.canonical(),
        source,
    };

    match Family::of(address)? {
        #[cfg(unix)]
        Family::Unix => UnixStream::connect(&address.location)
            .await
            .map(Connection::Unix)
            .map_err(dial_error),
        #[cfg(not(unix))]
        Family::Unix => Err(ProxyError::UnsupportedFamily(address.family.clone())),
        family => {
            let addrs = family
                .resolve(&address.location, false)
                .await
                .map_err(dial_error)?;
            let stream = TcpStream::connect(&addrs[..]).await.map_err(dial_error)?;
            set_nodelay(&stream);
            Ok(Connection::Tcp(stream))
        }
    }
}

/// A connected stream of any supported family
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
