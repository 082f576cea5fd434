//! The pool engine: a map of endpoint key to idle bucket, the dial path,
//! and the caller-facing operations.

use crate::{
    bucket::Bucket,
    conn::PooledConn,
    key::Key,
    metrics::Metrics,
    tcp::{resolve_addr, TcpDialer},
    Conn, Dialer, Error, Resolver,
};
use prometheus_client::registry::Registry;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// Configuration for a [`Pool`]. Immutable once the pool is built.
pub struct Config<D: Dialer = TcpDialer> {
    /// Registry for metrics.
    pub registry: Arc<Mutex<Registry>>,

    /// Opens fresh connections when the idle store has none to offer.
    pub dialer: D,

    /// Overrides [`resolve_addr`] for turning `(network, address)` pairs
    /// into dial targets.
    pub resolver: Option<Box<dyn Resolver>>,

    /// Maximum idle connections seated per endpoint key. Zero disables
    /// recycling entirely: every close destroys its connection.
    pub max_idle_per_key: usize,

    /// Maximum live connections across the pool, counting both
    /// handle-held and seated connections. Zero means unlimited.
    pub max_live: usize,

    /// How long a seated connection may sit idle before it is destroyed.
    /// `None` means seated connections never expire.
    pub idle_timeout: Option<Duration>,
}

impl Default for Config<TcpDialer> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            dialer: TcpDialer::default(),
            resolver: None,
            max_idle_per_key: 8,
            max_live: 0,
            idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

/// Per-dial options, passed to [`Pool::dial_with`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DialOptions {
    /// Skip the idle store and dial a fresh connection even when an idle
    /// one is seated.
    pub priority: bool,
}

/// Live-connection accounting, shared with every bucket's guardians.
pub(crate) struct Counters {
    pub(crate) live: AtomicI64,
    pub(crate) metrics: Metrics,
}

impl Counters {
    pub(crate) fn new(metrics: Metrics) -> Self {
        Self {
            live: AtomicI64::new(0),
            metrics,
        }
    }

    pub(crate) fn incr_live(&self) {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.metrics.live.inc();
    }

    pub(crate) fn decr_live(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.metrics.live.dec();
    }
}

pub(crate) struct Shared<D: Dialer> {
    dialer: D,
    resolver: Option<Box<dyn Resolver>>,
    max_idle: usize,
    max_live: usize,
    idle_timeout: Option<Duration>,
    buckets: AsyncMutex<HashMap<Key, Arc<Bucket<D::Conn>>>>,
    pub(crate) counters: Arc<Counters>,
    closed: AtomicBool,
}

impl<D: Dialer> Shared<D> {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn resolve(&self, network: &str, address: &str) -> Result<SocketAddr, Error> {
        match &self.resolver {
            Some(resolver) => resolver.resolve(network, address).await,
            None => resolve_addr(network, address).await,
        }
    }

    /// Take an idle connection for the key, pruning the bucket from the
    /// map once it is drained.
    async fn take_idle(&self, key: &Key) -> Option<D::Conn> {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.get(key)?.clone();
        match bucket.get().await {
            Ok(conn) => Some(conn),
            Err(_) => {
                buckets.remove(key);
                None
            }
        }
    }

    /// Seat a connection in the key's bucket, creating the bucket on
    /// demand. The buckets map stays locked for the duration so a
    /// concurrent drain cannot prune the bucket out from under the seat.
    async fn seat(&self, conn: D::Conn, key: &Key) -> Result<(), Error> {
        if self.max_idle == 0 {
            return Err(Error::BucketFull);
        }
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Bucket::new(self.counters.clone())))
            .clone();
        bucket.put(conn, self.max_idle, self.idle_timeout).await
    }

    /// Hand a connection back from a closing handle.
    pub(crate) async fn recycle(&self, conn: D::Conn, key: &Key) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        self.seat(conn, key).await?;
        self.counters.metrics.recycled.inc();
        Ok(())
    }

    async fn dial_fresh(&self, network: &str, addr: SocketAddr) -> Result<D::Conn, Error> {
        if self.max_live != 0 && self.counters.live.load(Ordering::SeqCst) >= self.max_live as i64
        {
            return Err(Error::AtCapacity);
        }
        let conn = self.dialer.dial(network, addr).await?;

        // The dial runs without any lock held, so the cap has to be
        // re-checked once the connection is counted; the loser closes
        // what it just opened.
        let total = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        if self.max_live != 0 && total > self.max_live as i64 {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::AtCapacity);
        }
        self.counters.metrics.live.inc();
        self.counters.metrics.dialed.inc();
        debug!(network, %addr, "dialed fresh connection");
        Ok(conn)
    }
}

/// A keyed pool of live connections.
///
/// Cloning is cheap and every clone operates on the same pool.
pub struct Pool<D: Dialer = TcpDialer> {
    shared: Arc<Shared<D>>,
}

impl<D: Dialer> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: Dialer> Pool<D> {
    pub fn new(cfg: Config<D>) -> Self {
        let metrics = Metrics::init(cfg.registry);
        Self {
            shared: Arc::new(Shared {
                dialer: cfg.dialer,
                resolver: cfg.resolver,
                max_idle: cfg.max_idle_per_key,
                max_live: cfg.max_live,
                idle_timeout: cfg.idle_timeout,
                buckets: AsyncMutex::new(HashMap::new()),
                counters: Arc::new(Counters::new(metrics)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Get a connection to the endpoint, reusing an idle one when
    /// possible.
    pub async fn dial(&self, network: &str, address: &str) -> Result<PooledConn<D>, Error> {
        self.dial_with(network, address, DialOptions::default()).await
    }

    /// Same as [`Pool::dial`], with per-dial options.
    ///
    /// The endpoint key is the `(network, address)` pair as given; it is
    /// never the resolved address, so a hostname and the IP it resolves
    /// to select distinct buckets.
    pub async fn dial_with(
        &self,
        network: &str,
        address: &str,
        opts: DialOptions,
    ) -> Result<PooledConn<D>, Error> {
        if self.shared.is_closed() {
            return Err(Error::PoolClosed);
        }
        let addr = self.shared.resolve(network, address).await?;
        let key = Key::new(network, address);
        if !opts.priority {
            if let Some(conn) = self.shared.take_idle(&key).await {
                self.shared.counters.metrics.reused.inc();
                debug!(%key, "reused idle connection");
                return Ok(PooledConn::new(conn, self.shared.clone(), key, true));
            }
        }
        let conn = self.shared.dial_fresh(network, addr).await?;
        Ok(PooledConn::new(conn, self.shared.clone(), key, false))
    }

    /// Take an idle connection raw.
    ///
    /// The connection leaves the pool entirely: the live count drops
    /// and closing it is the caller's responsibility. Handles returned
    /// by [`Pool::dial`] are unaffected.
    pub async fn get_idle(&self, key: impl Into<Key>) -> Result<D::Conn, Error> {
        if self.shared.is_closed() {
            return Err(Error::PoolClosed);
        }
        let key = key.into();
        let Some(conn) = self.shared.take_idle(&key).await else {
            return Err(Error::NoIdle);
        };
        self.shared.counters.decr_live();
        debug!(%key, "idle connection taken");
        Ok(conn)
    }

    /// Donate an externally-opened connection, keyed by its remote
    /// address.
    pub async fn add(&self, conn: D::Conn) -> Result<(), Error> {
        let addr = conn.peer_addr()?;
        self.put(conn, Key::from(addr)).await
    }

    /// Donate an externally-opened connection under an arbitrary key.
    ///
    /// On rejection (pool closed, at capacity, bucket full, socket
    /// already closed) the connection is dropped.
    pub async fn put(&self, conn: D::Conn, key: Key) -> Result<(), Error> {
        if self.shared.is_closed() {
            return Err(Error::PoolClosed);
        }
        if self.shared.max_live != 0
            && self.shared.counters.live.load(Ordering::SeqCst) >= self.shared.max_live as i64
        {
            return Err(Error::AtCapacity);
        }
        self.shared.counters.incr_live();
        match self.shared.seat(conn, &key).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.shared.counters.decr_live();
                Err(err)
            }
        }
    }

    /// Snapshot of the live-connection count (handle-held plus seated).
    /// Zero once the pool is closed.
    pub fn live_count(&self) -> usize {
        if self.shared.is_closed() {
            return 0;
        }
        self.shared.counters.live.load(Ordering::SeqCst).max(0) as usize
    }

    /// Snapshot of one endpoint's seated-connection count. Not
    /// synchronized with in-flight puts and gets.
    pub async fn idle_count(&self, network: &str, address: &str) -> usize {
        if self.shared.is_closed() {
            return 0;
        }
        let key = Key::new(network, address);
        let buckets = self.shared.buckets.lock().await;
        buckets.get(&key).map_or(0, |bucket| bucket.length())
    }

    /// Evict every seated connection. Guardians close their sockets and
    /// decrement the live count asynchronously.
    pub async fn close_idle_connections(&self) {
        let mut buckets = self.shared.buckets.lock().await;
        for (key, bucket) in buckets.drain() {
            debug!(%key, seated = bucket.length(), "evicting idle connections");
            bucket.evict();
        }
    }

    /// Close the pool. Idempotent; once closed, every other operation
    /// fails with [`Error::PoolClosed`]. Connections still held by
    /// callers stay usable, but their closes destroy rather than
    /// recycle.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("pool closed");
        self.close_idle_connections().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        task::JoinHandle,
    };

    const SETTLE: Duration = Duration::from_millis(50);

    /// Echo listener on an OS-assigned port; connections are held open
    /// until the client closes.
    async fn echo_listener() -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        (addr, server)
    }

    fn config(max_idle: usize, max_live: usize) -> Config {
        Config {
            max_idle_per_key: max_idle,
            max_live,
            idle_timeout: None,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_recycle_then_count() {
        let (addr, _server) = echo_listener().await;
        let address = addr.to_string();
        let pool = Pool::new(config(5, 2));

        let mut first = pool.dial("tcp", &address).await.unwrap();
        let mut second = pool.dial("tcp", &address).await.unwrap();
        first.close().await.unwrap();
        second.close().await.unwrap();

        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.idle_count("tcp", &address).await, 2);

        pool.close_idle_connections().await;
        tokio::time::sleep(SETTLE).await;
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count("tcp", &address).await, 0);
    }

    #[tokio::test]
    async fn test_reuse_returns_same_socket() {
        let (addr, _server) = echo_listener().await;
        let address = addr.to_string();
        let pool = Pool::new(config(5, 0));

        let mut conn = pool.dial("tcp", &address).await.unwrap();
        assert!(!conn.is_reused());
        let local = conn.local_addr().unwrap();
        conn.close().await.unwrap();

        let conn = pool.dial("tcp", &address).await.unwrap();
        assert!(conn.is_reused());
        assert_eq!(conn.local_addr().unwrap(), local);
    }

    #[tokio::test]
    async fn test_raw_conn_suppresses_recycling() {
        let (addr, _server) = echo_listener().await;
        let address = addr.to_string();
        let pool = Pool::new(config(5, 0));

        let mut conn = pool.dial("tcp", &address).await.unwrap();
        conn.close().await.unwrap();

        let mut conn = pool.dial("tcp", &address).await.unwrap();
        assert!(conn.is_reused());
        let raw = conn.raw_conn();
        drop(raw);
        conn.close().await.unwrap();

        assert_eq!(pool.live_count(), 0);
        tokio::time::sleep(SETTLE).await;
        assert_eq!(pool.idle_count("tcp", &address).await, 0);
    }

    #[tokio::test]
    async fn test_get_idle_removes_from_pool() {
        let (addr, _server) = echo_listener().await;
        let address = addr.to_string();
        let pool = Pool::new(config(5, 0));

        let mut conn = pool.dial("tcp", &address).await.unwrap();
        let remote = conn.peer_addr().unwrap();
        conn.close().await.unwrap();
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.idle_count("tcp", &address).await, 1);

        let raw = pool.get_idle(remote).await.unwrap();
        drop(raw);
        assert_eq!(pool.live_count(), 0);
        tokio::time::sleep(SETTLE).await;
        assert_eq!(pool.idle_count("tcp", &address).await, 0);
    }

    #[tokio::test]
    async fn test_discard_prevents_recycling() {
        let (addr, _server) = echo_listener().await;
        let address = addr.to_string();
        let pool = Pool::new(config(5, 2));

        let mut conn = pool.dial("tcp", &address).await.unwrap();
        conn.close().await.unwrap();

        let mut conn = pool.dial("tcp", &address).await.unwrap();
        assert!(conn.is_reused());
        conn.discard();
        conn.close().await.unwrap();

        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_priority_dial_bypasses_pool() {
        let (addr, _server) = echo_listener().await;
        let address = addr.to_string();
        let pool = Pool::new(config(5, 2));

        let mut conn = pool.dial("tcp", &address).await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(pool.idle_count("tcp", &address).await, 1);

        let mut fresh = pool
            .dial_with("tcp", &address, DialOptions { priority: true })
            .await
            .unwrap();
        assert!(!fresh.is_reused());
        fresh.close().await.unwrap();

        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.idle_count("tcp", &address).await, 2);

        pool.close_idle_connections().await;
        tokio::time::sleep(SETTLE).await;
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count("tcp", &address).await, 0);
    }

    #[tokio::test]
    async fn test_dead_conn_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drop(server);
        tokio::time::sleep(SETTLE).await;

        let pool = Pool::new(config(5, 0));
        assert!(matches!(
            pool.put(client, Key::from(addr)).await,
            Err(Error::ConnClosed)
        ));
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count("tcp", &addr.to_string()).await, 0);
        assert!(matches!(pool.get_idle(addr).await, Err(Error::NoIdle)));
    }

    #[tokio::test]
    async fn test_live_cap_is_strict() {
        let (addr, _server) = echo_listener().await;
        let address = addr.to_string();
        let pool = Pool::new(config(5, 1));

        let first = pool.dial("tcp", &address).await.unwrap();
        assert!(matches!(
            pool.dial("tcp", &address).await,
            Err(Error::AtCapacity)
        ));

        // Destroying the first frees the slot.
        drop(first);
        let _second = pool.dial("tcp", &address).await.unwrap();
    }

    #[tokio::test]
    async fn test_recycling_disabled() {
        let (addr, _server) = echo_listener().await;
        let address = addr.to_string();
        let pool = Pool::new(config(0, 0));

        let mut conn = pool.dial("tcp", &address).await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count("tcp", &address).await, 0);
    }

    #[tokio::test]
    async fn test_idle_timeout_destroys_seated() {
        let (addr, _server) = echo_listener().await;
        let address = addr.to_string();
        let pool = Pool::new(Config {
            max_idle_per_key: 5,
            idle_timeout: Some(Duration::from_millis(50)),
            ..Config::default()
        });

        let mut conn = pool.dial("tcp", &address).await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.idle_count("tcp", &address).await, 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count("tcp", &address).await, 0);
    }

    #[tokio::test]
    async fn test_add_then_get_idle() {
        let (addr, _server) = echo_listener().await;
        let pool = Pool::new(config(5, 0));

        let conn = TcpStream::connect(addr).await.unwrap();
        let remote = conn.peer_addr().unwrap();
        pool.add(conn).await.unwrap();
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.idle_count("tcp", &remote.to_string()).await, 1);

        let back = pool.get_idle(remote).await.unwrap();
        assert_eq!(back.peer_addr().unwrap(), remote);
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (addr, _server) = echo_listener().await;
        let address = addr.to_string();
        let pool = Pool::new(config(5, 0));

        let mut seated = pool.dial("tcp", &address).await.unwrap();
        seated.close().await.unwrap();
        let mut held = pool.dial_with("tcp", &address, DialOptions { priority: true })
            .await
            .unwrap();

        pool.close().await;
        pool.close().await;
        pool.close_idle_connections().await;

        tokio::time::sleep(SETTLE).await;
        // The seated connection was destroyed; the held one survives.
        assert_eq!(pool.shared.counters.live.load(Ordering::SeqCst), 1);
        assert_eq!(pool.live_count(), 0);

        assert!(matches!(
            pool.dial("tcp", &address).await,
            Err(Error::PoolClosed)
        ));
        assert!(matches!(pool.get_idle(addr).await, Err(Error::PoolClosed)));
        let donated = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(pool.add(donated).await, Err(Error::PoolClosed)));

        // The held handle stays usable and its close destroys.
        held.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        held.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        held.close().await.unwrap();
        assert_eq!(pool.shared.counters.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsupported_network() {
        let pool = Pool::new(config(5, 0));
        assert!(matches!(
            pool.dial("pigeon", "coop:1").await,
            Err(Error::UnsupportedNetwork(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_dial_and_close() {
        let (addr, _server) = echo_listener().await;
        let address = addr.to_string();
        let pool = Pool::new(config(4, 0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let address = address.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let mut conn = pool.dial("tcp", &address).await.unwrap();
                    conn.write_all(b"ping").await.unwrap();
                    let mut buf = [0u8; 4];
                    conn.read_exact(&mut buf).await.unwrap();
                    conn.close().await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Every connection ended up either seated or destroyed; nothing
        // leaked, nothing double-counted.
        tokio::time::sleep(SETTLE).await;
        let idle = pool.idle_count("tcp", &address).await;
        assert_eq!(pool.live_count(), idle);
        assert!(idle <= 4);

        pool.close_idle_connections().await;
        tokio::time::sleep(SETTLE).await;
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_custom_resolver_keeps_caller_key() {
        use futures::future::BoxFuture;

        struct Fixed(SocketAddr);

        impl Resolver for Fixed {
            fn resolve<'a>(
                &'a self,
                _network: &'a str,
                _address: &'a str,
            ) -> BoxFuture<'a, Result<SocketAddr, Error>> {
                Box::pin(async move { Ok(self.0) })
            }
        }

        let (addr, _server) = echo_listener().await;
        let pool = Pool::new(Config {
            resolver: Some(Box::new(Fixed(addr))),
            max_idle_per_key: 5,
            idle_timeout: None,
            ..Config::default()
        });

        let mut conn = pool.dial("tcp", "echo.internal:9").await.unwrap();
        conn.close().await.unwrap();

        // The bucket is keyed by the caller's address, not the resolved
        // one.
        assert_eq!(pool.idle_count("tcp", "echo.internal:9").await, 1);
        assert_eq!(pool.idle_count("tcp", &addr.to_string()).await, 0);

        let conn = pool.dial("tcp", "echo.internal:9").await.unwrap();
        assert!(conn.is_reused());
    }

    #[tokio::test]
    async fn test_donation_respects_live_cap() {
        let (addr, _server) = echo_listener().await;
        let address = addr.to_string();
        let pool = Pool::new(config(5, 1));

        let _held = pool.dial("tcp", &address).await.unwrap();
        let donated = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(pool.add(donated).await, Err(Error::AtCapacity)));
        assert_eq!(pool.live_count(), 1);
    }
}
