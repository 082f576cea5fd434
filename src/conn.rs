//! The connection handle returned to callers.

use crate::{pool::Shared, CloseNotify, Conn, Dialer, Error, Key};
use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{sleep_until, Instant, Sleep},
};
use tracing::debug;

/// A live connection checked out of a [`Pool`](crate::Pool).
///
/// Reads and writes delegate to the underlying transport. Dropping the
/// handle destroys the connection; call [`PooledConn::close`] to hand it
/// back to the pool instead. An I/O error other than a timeout marks the
/// connection as discarded, after which `close` destroys rather than
/// recycles.
pub struct PooledConn<D: Dialer> {
    conn: Option<D::Conn>,
    shared: Arc<Shared<D>>,
    key: Key,
    reused: bool,
    closed: bool,
    discarded: bool,
    raw_taken: bool,
    read_timer: Option<Pin<Box<Sleep>>>,
    write_timer: Option<Pin<Box<Sleep>>>,
}

impl<D: Dialer> PooledConn<D> {
    pub(crate) fn new(conn: D::Conn, shared: Arc<Shared<D>>, key: Key, reused: bool) -> Self {
        Self {
            conn: Some(conn),
            shared,
            key,
            reused,
            closed: false,
            discarded: false,
            raw_taken: false,
            read_timer: None,
            write_timer: None,
        }
    }

    /// Whether this handle was served from the idle store rather than a
    /// fresh dial.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Mark the connection so that [`PooledConn::close`] destroys it
    /// instead of recycling it.
    pub fn discard(&mut self) {
        self.discarded = true;
    }

    /// Returns the local address of the connection.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let conn = self.conn.as_ref().ok_or(Error::AlreadyClosed)?;
        Ok(conn.local_addr()?)
    }

    /// Returns the remote address of the connection.
    pub fn peer_addr(&self) -> Result<SocketAddr, Error> {
        let conn = self.conn.as_ref().ok_or(Error::AlreadyClosed)?;
        Ok(conn.peer_addr()?)
    }

    /// Set both the read and write deadlines.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) -> Result<(), Error> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }

    /// Fail reads that have not completed by `deadline` with
    /// [`io::ErrorKind::TimedOut`]. `None` clears the deadline. Deadline
    /// expiry does not discard the connection.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) -> Result<(), Error> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        self.read_timer = deadline.map(|deadline| Box::pin(sleep_until(deadline)));
        Ok(())
    }

    /// Fail writes that have not completed by `deadline` with
    /// [`io::ErrorKind::TimedOut`]. `None` clears the deadline.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) -> Result<(), Error> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        self.write_timer = deadline.map(|deadline| Box::pin(sleep_until(deadline)));
        Ok(())
    }

    /// Close the handle.
    ///
    /// If the connection is still healthy and not discarded, it is
    /// handed back to the pool for reuse and stays live; otherwise (or
    /// if the pool refuses it) it is destroyed. Fails with
    /// [`Error::AlreadyClosed`] on a second call; does nothing after
    /// [`PooledConn::raw_conn`].
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.raw_taken {
            return Ok(());
        }
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        self.closed = true;
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        if !self.discarded && !conn.is_peer_closed() {
            match self.shared.recycle(conn, &self.key).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(key = %self.key, %err, "recycle refused, destroying connection")
                }
            }
        } else {
            drop(conn);
        }
        self.shared.counters.decr_live();
        Ok(())
    }

    /// Claim the underlying transport irrevocably.
    ///
    /// The connection leaves the pool's accounting and the handle
    /// becomes inert: a later `close` is a no-op. Panics if called twice
    /// or on a closed handle; both are programmer errors.
    pub fn raw_conn(&mut self) -> D::Conn {
        assert!(!self.raw_taken, "raw connection already taken");
        assert!(!self.closed, "handle already closed");
        self.raw_taken = true;
        self.closed = true;
        self.shared.counters.decr_live();
        self.conn.take().expect("open handle missing its connection")
    }
}

impl<D: Dialer> AsyncRead for PooledConn<D> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(conn) = this.conn.as_mut() else {
            // A closed handle reads as end-of-stream.
            return Poll::Ready(Ok(()));
        };
        if let Some(timer) = this.read_timer.as_mut() {
            if timer.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "read deadline elapsed",
                )));
            }
        }
        match Pin::new(conn).poll_read(cx, buf) {
            Poll::Ready(Err(err)) => {
                if err.kind() != io::ErrorKind::TimedOut {
                    this.discarded = true;
                }
                Poll::Ready(Err(err))
            }
            poll => poll,
        }
    }
}

impl<D: Dialer> AsyncWrite for PooledConn<D> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(conn) = this.conn.as_mut() else {
            return Poll::Ready(Err(closed_pipe()));
        };
        if let Some(timer) = this.write_timer.as_mut() {
            if timer.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "write deadline elapsed",
                )));
            }
        }
        match Pin::new(conn).poll_write(cx, buf) {
            Poll::Ready(Err(err)) => {
                if err.kind() != io::ErrorKind::TimedOut {
                    this.discarded = true;
                }
                Poll::Ready(Err(err))
            }
            poll => poll,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(conn) = this.conn.as_mut() else {
            return Poll::Ready(Err(closed_pipe()));
        };
        Pin::new(conn).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(conn) = this.conn.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        // A half-closed socket must never be reseated.
        this.discarded = true;
        Pin::new(conn).poll_shutdown(cx)
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "handle is closed")
}

impl<D: Dialer> Drop for PooledConn<D> {
    fn drop(&mut self) {
        // A handle dropped without close() destroys its connection.
        if !self.closed && !self.raw_taken && self.conn.is_some() {
            self.shared.counters.decr_live();
        }
    }
}

impl<D: Dialer> fmt::Debug for PooledConn<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConn")
            .field("key", &self.key)
            .field("reused", &self.reused)
            .field("closed", &self.closed)
            .finish()
    }
}
