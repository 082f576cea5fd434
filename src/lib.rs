//! Pool TCP connections to a small set of remote endpoints.
//!
//! Clients that open many short-lived conversations to the same endpoints
//! pay for a three-way handshake (and, when layered, TLS) on every one.
//! This crate amortizes that cost: connections handed back on close are
//! seated in a keyed idle store and reissued on the next dial to the same
//! endpoint. Each seated connection is watched by a guardian task that
//! removes it when the peer closes, the idle timeout elapses, or the pool
//! evicts it, so a caller is never handed a dead socket the pool already
//! knew about.
//!
//! Connections are keyed by the caller-supplied `(network, address)` pair,
//! not by the resolved address: `("tcp", "1.2.3.4:80")` and
//! `("tcp", "host.example:80")` are distinct buckets even if they resolve
//! to the same socket endpoint.
//!
//! # Example
//!
//! ```no_run
//! use connpool::{Config, Pool};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = Pool::new(Config::default());
//!
//!     // First dial opens a fresh connection.
//!     let mut conn = pool.dial("tcp", "example.com:80").await?;
//!     conn.write_all(b"GET / HTTP/1.0\r\n\r\n").await?;
//!     let mut response = Vec::new();
//!     conn.read_to_end(&mut response).await?;
//!
//!     // Close recycles the connection into the pool...
//!     conn.close().await?;
//!
//!     // ...so the next dial to the same endpoint reuses it.
//!     let conn = pool.dial("tcp", "example.com:80").await?;
//!     assert!(conn.is_reused());
//!     Ok(())
//! }
//! ```

use futures::future::BoxFuture;
use std::{future::Future, io, net::SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

mod bucket;
mod conn;
mod key;
mod metrics;
mod pool;
mod tcp;

pub use conn::PooledConn;
pub use key::Key;
pub use pool::{Config, DialOptions, Pool};
pub use tcp::{resolve_addr, TcpDialer};

#[derive(Error, Debug)]
pub enum Error {
    /// Any operation on a closed pool (redundant closes are no-ops).
    #[error("pool is closed")]
    PoolClosed,
    /// The global live-connection cap would be exceeded.
    #[error("pool is at its maximum number of live connections")]
    AtCapacity,
    /// The per-endpoint idle cap would be exceeded.
    #[error("idle store for this endpoint is full")]
    BucketFull,
    /// No idle connection is seated for the endpoint.
    #[error("no idle connection available")]
    NoIdle,
    /// The socket was closed before the pool could seat it.
    #[error("connection is already closed")]
    ConnClosed,
    /// Close on a handle that was already closed.
    #[error("handle is already closed")]
    AlreadyClosed,
    /// The resolver or dialer does not recognize the network tag.
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Interface that any pooled transport must implement.
///
/// The pool moves opaque byte streams; the only structure it needs is
/// addressing (for keying donated connections) and async I/O.
pub trait Conn: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {
    /// Returns the local address of the connection.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Returns the remote address of the connection.
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// Close-notify capability on a pooled transport.
///
/// The guardian of a seated connection awaits [`CloseNotify::peer_closed`]
/// rather than reading from the socket, so peer-initiated closes are
/// observed without a dedicated reader task. A transport with no native
/// way to observe closure can implement `peer_closed` as
/// [`std::future::pending`] and `is_peer_closed` as `false`: idle-timeout
/// and eviction semantics are unaffected, only prompt peer-close
/// detection is lost.
pub trait CloseNotify {
    /// Resolves once the connection can no longer be reused: the peer
    /// closed its half, the socket errored, or unsolicited data arrived
    /// while the connection sat idle.
    fn peer_closed(&self) -> impl Future<Output = ()> + Send;

    /// Non-blocking probe of [`CloseNotify::peer_closed`].
    fn is_peer_closed(&self) -> bool;
}

/// Interface that opens raw connections for the pool.
pub trait Dialer: Send + Sync + 'static {
    /// The transport this dialer produces.
    type Conn: Conn + CloseNotify;

    /// Dial the given resolved address.
    ///
    /// Called without any pool lock held; it may block on the network for
    /// as long as the caller is willing to await it.
    fn dial(
        &self,
        network: &str,
        addr: SocketAddr,
    ) -> impl Future<Output = Result<Self::Conn, Error>> + Send;
}

/// Address resolution seam, overriding [`resolve_addr`] when configured.
pub trait Resolver: Send + Sync {
    /// Resolve `(network, address)` to a dialable address.
    fn resolve<'a>(
        &'a self,
        network: &'a str,
        address: &'a str,
    ) -> BoxFuture<'a, Result<SocketAddr, Error>>;
}
