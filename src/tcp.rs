//! TCP implementations of the pool's transport seams.

use crate::{CloseNotify, Conn, Dialer, Error};
use futures::FutureExt;
use std::{io, net::SocketAddr};
use tokio::{
    io::Interest,
    net::{lookup_host, TcpStream},
};
use tracing::warn;

impl Conn for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

impl CloseNotify for TcpStream {
    async fn peer_closed(&self) {
        let mut buf = [0u8; 1];
        loop {
            let ready = match self.ready(Interest::READABLE).await {
                Ok(ready) => ready,
                Err(_) => return,
            };
            if ready.is_read_closed() {
                return;
            }
            // Peek rather than read: EOF resolves, stray bytes resolve
            // (an idle connection with unsolicited data cannot be
            // reused), and the bytes stay in the socket for whoever ends
            // up owning it.
            match self.peek(&mut buf).await {
                Ok(_) => return,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(_) => return,
            }
        }
    }

    fn is_peer_closed(&self) -> bool {
        self.peer_closed().now_or_never().is_some()
    }
}

/// Default dialer: `TcpStream::connect` for `tcp` networks.
#[derive(Clone, Debug, Default)]
pub struct TcpDialer {
    /// Whether to disable Nagle's algorithm on dialed connections.
    /// `None` leaves the OS default in place.
    pub nodelay: Option<bool>,
}

impl Dialer for TcpDialer {
    type Conn = TcpStream;

    async fn dial(&self, network: &str, addr: SocketAddr) -> Result<TcpStream, Error> {
        if !matches!(network, "tcp" | "tcp4" | "tcp6") {
            return Err(Error::UnsupportedNetwork(network.into()));
        }
        let stream = TcpStream::connect(addr).await?;
        if let Some(nodelay) = self.nodelay {
            if let Err(err) = stream.set_nodelay(nodelay) {
                warn!(?err, "failed to set TCP_NODELAY");
            }
        }
        Ok(stream)
    }
}

/// Resolve `(network, address)` to a dialable socket address.
///
/// Supports the `tcp` and `udp` network families (`address` must be a
/// `host:port` pair); anything else fails with
/// [`Error::UnsupportedNetwork`].
pub async fn resolve_addr(network: &str, address: &str) -> Result<SocketAddr, Error> {
    match network {
        "tcp" | "tcp4" | "tcp6" | "udp" | "udp4" | "udp6" => {
            let mut addrs = lookup_host(address).await?;
            addrs.next().ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses found for {address}"),
                ))
            })
        }
        _ => Err(Error::UnsupportedNetwork(network.into())),
    }
}
