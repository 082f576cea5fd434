//! The idle store for a single endpoint.
//!
//! A bucket seats connections in an indexed slot table with a free-list
//! of vacant positions. Every seated slot is watched by a guardian task
//! that waits for whichever comes first: the peer closing the socket,
//! the idle timeout elapsing, or the slot being cancelled (by a `get`
//! claiming the connection or by bulk eviction). The guardian is the
//! only code that removes a slot from the table, so a peer close racing
//! a `get` can never double-remove; the slot's `unavailable` flag
//! decides who owns the connection.

use crate::{
    metrics::{Reason, Removal},
    pool::Counters,
    CloseNotify, Conn, Error,
};
use std::{
    future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One seated connection.
///
/// The connection lives behind an async mutex: the guardian holds the
/// lock for the whole time the slot is seated (it needs the connection
/// by reference to await its close-notify signal), and releases it only
/// when the slot leaves circulation. Whoever wins the `unavailable`
/// claim takes the connection out.
struct Slot<C> {
    conn: AsyncMutex<Option<C>>,
    cancel: CancellationToken,
    unavailable: AtomicBool,
    pos: usize,
}

struct State<C> {
    slots: Vec<Option<Arc<Slot<C>>>>,
    vacancy: Vec<usize>,
}

pub(crate) struct Bucket<C> {
    state: Mutex<State<C>>,
    root: CancellationToken,
    counters: Arc<Counters>,
}

impl<C: Conn + CloseNotify> Bucket<C> {
    pub(crate) fn new(counters: Arc<Counters>) -> Self {
        Self {
            state: Mutex::new(State {
                slots: Vec::new(),
                vacancy: Vec::new(),
            }),
            root: CancellationToken::new(),
            counters,
        }
    }

    /// Seat a connection.
    ///
    /// Fails with [`Error::ConnClosed`] if the peer already closed the
    /// socket and with [`Error::BucketFull`] if the idle cap is reached;
    /// in both cases the connection is dropped. Returns only after the
    /// slot's guardian has armed its watch, so a peer close after `put`
    /// returns cannot be missed.
    pub(crate) async fn put(
        self: Arc<Self>,
        conn: C,
        max_idle: usize,
        idle_timeout: Option<Duration>,
    ) -> Result<(), Error> {
        if conn.is_peer_closed() {
            return Err(Error::ConnClosed);
        }
        let armed = {
            let mut state = self.state.lock().unwrap();
            let pos = loop {
                match state.vacancy.pop() {
                    // A vacant index at or beyond the cap is never reseated.
                    Some(pos) if max_idle != 0 && pos >= max_idle => continue,
                    Some(pos) => break pos,
                    None => {
                        if max_idle != 0 && state.slots.len() >= max_idle {
                            return Err(Error::BucketFull);
                        }
                        state.slots.push(None);
                        break state.slots.len() - 1;
                    }
                }
            };
            let slot = Arc::new(Slot {
                conn: AsyncMutex::new(Some(conn)),
                cancel: self.root.child_token(),
                unavailable: AtomicBool::new(false),
                pos,
            });
            state.slots[pos] = Some(slot.clone());
            self.counters.metrics.idle.inc();
            let (armed_tx, armed_rx) = oneshot::channel();
            tokio::spawn(guard(self.clone(), slot, idle_timeout, armed_tx));
            armed_rx
        };
        let _ = armed.await;
        Ok(())
    }

    /// Take any seated connection.
    ///
    /// Claims a slot by winning its `unavailable` flag, then wakes the
    /// guardian; the guardian observes the lost claim, releases the
    /// connection, and performs the structural removal itself.
    pub(crate) async fn get(&self) -> Result<C, Error> {
        let claimed = {
            let state = self.state.lock().unwrap();
            let mut claimed = None;
            for slot in state.slots.iter().flatten() {
                if !slot.unavailable.swap(true, Ordering::SeqCst) {
                    claimed = Some(slot.clone());
                    break;
                }
            }
            claimed
        };
        let Some(slot) = claimed else {
            return Err(Error::NoIdle);
        };
        slot.cancel.cancel();
        let conn = slot
            .conn
            .lock()
            .await
            .take()
            .expect("claimed slot lost its connection");
        Ok(conn)
    }

    /// Number of seated slots, including claimed slots whose guardians
    /// have not finished cleaning up. Snapshot only.
    pub(crate) fn length(&self) -> usize {
        self.state.lock().unwrap().slots.iter().flatten().count()
    }

    /// Cancel every guardian in the bucket. Each one closes its
    /// connection and removes its slot asynchronously.
    pub(crate) fn evict(&self) {
        self.root.cancel();
    }
}

async fn guard<C: Conn + CloseNotify>(
    bucket: Arc<Bucket<C>>,
    slot: Arc<Slot<C>>,
    idle_timeout: Option<Duration>,
    armed: oneshot::Sender<()>,
) {
    let mut seat = slot.conn.lock().await;
    let _ = armed.send(());
    let reason = if seat.is_none() {
        // A get claimed the connection before the watch began.
        None
    } else {
        let reason = {
            let conn = seat.as_ref().expect("seated slot holds a connection");
            let expire = async {
                match idle_timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => future::pending().await,
                }
            };
            tokio::select! {
                _ = conn.peer_closed() => Reason::PeerClosed,
                _ = slot.cancel.cancelled() => Reason::Evicted,
                _ = expire => Reason::Expired,
            }
        };
        if slot.unavailable.swap(true, Ordering::SeqCst) {
            // Lost the claim: a get owns the connection now. Releasing
            // the lock hands it over.
            None
        } else {
            drop(seat.take());
            bucket.counters.decr_live();
            Some(reason)
        }
    };
    drop(seat);
    {
        let mut state = bucket.state.lock().unwrap();
        state.slots[slot.pos] = None;
        state.vacancy.push(slot.pos);
    }
    bucket.counters.metrics.idle.dec();
    if let Some(reason) = reason {
        bucket
            .counters
            .metrics
            .removed
            .get_or_create(&Removal { reason })
            .inc();
        debug!(pos = slot.pos, ?reason, "removed idle connection");
    }
}
