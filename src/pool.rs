//! Pool of keep-alive TCP connections, keyed by `host:port`.
//!
//! A connection is owned by exactly one caller while checked out; the
//! socket travels inside an async mutex and the checkout holds the owned
//! guard, so two exchanges can never interleave on one socket. Idle
//! connections are reaped after a configurable timeout, and per-host and
//! global caps are enforced with FIFO queueing per host.

use crate::buf_reader::BufIo;
use crate::{err_closed, Error};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Cap on live connections across all hosts.
    pub max_total: usize,
    /// Cap on live connections per host key.
    pub max_per_host: usize,
    /// Idle duration after which a connection is reaped.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_total: 100,
            max_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

struct Inner {
    config: PoolConfig,
    state: Mutex<State>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct State {
    hosts: HashMap<String, HostEntry>,
    /// Live connections over all hosts, dials in flight included.
    total: usize,
}

#[derive(Default)]
struct HostEntry {
    conns: Vec<Arc<PooledConn>>,
    /// Dials in flight count against the caps before the socket exists.
    pending_dials: usize,
    waiters: VecDeque<oneshot::Sender<Handoff>>,
}

struct PooledConn {
    id: u64,
    key: String,
    io: Arc<AsyncMutex<BufIo<TcpStream>>>,
    state: Mutex<ConnState>,
}

#[derive(Debug)]
struct ConnState {
    idle: bool,
    idle_since: Instant,
    closed: bool,
}

/// What a queued waiter receives: either a live connection straight from
/// the releasing caller, or permission to dial now that a slot is free.
/// Dropping it unconsumed puts the slot back.
struct Handoff {
    pool: Pool,
    inner: Option<HandoffKind>,
}

enum HandoffKind {
    Conn(Arc<PooledConn>),
    Dial(String),
}

impl Handoff {
    fn take(mut self) -> Option<HandoffKind> {
        self.inner.take()
    }
}

impl Drop for Handoff {
    fn drop(&mut self) {
        // the receiver went away between send and consumption.
        match self.inner.take() {
            Some(HandoffKind::Conn(conn)) => self.pool.release_conn(&conn),
            Some(HandoffKind::Dial(key)) => self.pool.cancel_dial(&key),
            None => {}
        }
    }
}

/// Exclusive use of one pooled connection for one exchange.
///
/// Dropping a checkout closes the connection; only an explicit
/// [`release`][Checkout::release] after a fully drained response makes it
/// available for reuse.
pub struct Checkout {
    pool: Pool,
    conn: Arc<PooledConn>,
    io: Option<OwnedMutexGuard<BufIo<TcpStream>>>,
    done: bool,
}

impl std::fmt::Debug for Checkout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkout")
            .field("id", &self.conn.id)
            .field("done", &self.done)
            .finish()
    }
}

impl Checkout {
    pub fn id(&self) -> u64 {
        self.conn.id
    }

    pub(crate) fn io_mut(&mut self) -> &mut BufIo<TcpStream> {
        // invariant: the guard is only taken in release/close which consume self.
        self.io.as_deref_mut().expect("checkout io")
    }

    /// Put the connection back for reuse.
    pub fn release(mut self) {
        self.done = true;
        // unlock the socket before anyone else is offered the connection.
        drop(self.io.take());
        self.pool.release_conn(&self.conn);
    }

    /// Close the connection and free its slot.
    pub fn close(mut self) {
        self.done = true;
        drop(self.io.take());
        self.pool.close_conn(&self.conn);
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if !self.done {
            drop(self.io.take());
            self.pool.close_conn(&self.conn);
        }
    }
}

enum Plan {
    Reuse(Arc<PooledConn>),
    Dial,
    Wait(oneshot::Receiver<Handoff>),
}

impl Pool {
    pub fn new(config: PoolConfig) -> Pool {
        Pool {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Live connections over all hosts.
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().unwrap().total
    }

    /// Idle connections for one host key.
    pub fn idle_count(&self, key: &str) -> usize {
        let state = self.inner.state.lock().unwrap();
        state
            .hosts
            .get(key)
            .map(|e| {
                e.conns
                    .iter()
                    .filter(|c| c.state.lock().unwrap().idle)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Check out a connection to `key` (`host:port`), reusing an idle one,
    /// dialing under the caps, or joining the host's FIFO queue until one
    /// is released. The deadline bounds the queue wait.
    pub async fn acquire(
        &self,
        key: &str,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<Checkout, Error> {
        self.reap();

        let plan = {
            let mut guard = self.inner.state.lock().unwrap();
            let state = &mut *guard;
            let config = &self.inner.config;

            let entry = state.hosts.entry(key.to_string()).or_default();

            if let Some(conn) = find_idle(entry) {
                Plan::Reuse(conn)
            } else if entry.conns.len() + entry.pending_dials < config.max_per_host
                && state.total < config.max_total
            {
                entry.pending_dials += 1;
                state.total += 1;
                Plan::Dial
            } else {
                let (tx, rx) = oneshot::channel();
                entry.waiters.push_back(tx);
                Plan::Wait(rx)
            }
        };

        match plan {
            Plan::Reuse(conn) => Ok(self.checkout(conn)),

            Plan::Dial => self.dial(key).await,

            Plan::Wait(rx) => {
                trace!("waiting for a connection to {}", key);

                let received = match deadline {
                    Some(d) => match tokio::time::timeout_at(d, rx).await {
                        Ok(r) => r,
                        Err(_) => return Err(Error::DeadlineExceeded),
                    },
                    None => rx.await,
                };

                let handoff = match received {
                    Ok(h) => h,
                    // pool dropped underneath us.
                    Err(_) => return err_closed(),
                };

                match handoff.take() {
                    Some(HandoffKind::Conn(conn)) => Ok(self.checkout(conn)),
                    Some(HandoffKind::Dial(_)) => self.dial(key).await,
                    None => err_closed(),
                }
            }
        }
    }

    /// Close and remove everything that is flagged closed or has idled
    /// past the timeout. Runs at the top of every acquire and may also be
    /// called from a periodic task.
    pub fn reap(&self) {
        let now = Instant::now();
        let idle_timeout = self.inner.config.idle_timeout;

        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;

        let mut removed = 0;

        for entry in state.hosts.values_mut() {
            entry.conns.retain(|conn| {
                let mut cs = conn.state.lock().unwrap();
                if cs.closed {
                    removed += 1;
                    return false;
                }
                if cs.idle && now.duration_since(cs.idle_since) >= idle_timeout {
                    cs.closed = true;
                    debug!("reaped idle connection {}", conn.id);
                    removed += 1;
                    return false;
                }
                true
            });
        }

        state.total -= removed;

        state
            .hosts
            .retain(|_, e| !e.conns.is_empty() || !e.waiters.is_empty() || e.pending_dials > 0);

        if removed > 0 {
            // freed slots may unblock waiters held back by the caps.
            self.wake_locked(state, "");
        }
    }

    fn checkout(&self, conn: Arc<PooledConn>) -> Checkout {
        // the connection is non-idle and belongs to us, so its io lock
        // must be free.
        let io = match conn.io.clone().try_lock_owned() {
            Ok(io) => io,
            Err(_) => unreachable!("checked-out connection with a held io lock"),
        };
        Checkout {
            pool: self.clone(),
            conn,
            io: Some(io),
            done: false,
        }
    }

    /// Dial with the counters already charged. The permit pays them back
    /// if the dial fails or the caller goes away mid-connect.
    async fn dial(&self, key: &str) -> Result<Checkout, Error> {
        debug!("dialing {}", key);

        let mut permit = DialPermit {
            pool: self.clone(),
            key: key.to_string(),
            armed: true,
        };

        let tcp = TcpStream::connect(key).await.map_err(Error::Io)?;
        let _ = tcp.set_nodelay(true);

        let conn = Arc::new(PooledConn {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            key: key.to_string(),
            io: Arc::new(AsyncMutex::new(BufIo::new(tcp))),
            state: Mutex::new(ConnState {
                idle: false,
                idle_since: Instant::now(),
                closed: false,
            }),
        });

        // invariant: the io lock of a fresh connection is free.
        let io = match conn.io.clone().try_lock_owned() {
            Ok(io) => io,
            Err(_) => unreachable!("fresh connection with a held io lock"),
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            let entry = state.hosts.entry(key.to_string()).or_default();
            entry.pending_dials -= 1;
            entry.conns.push(conn.clone());
        }
        permit.armed = false;

        debug!("new connection {} to {}", conn.id, key);

        Ok(Checkout {
            pool: self.clone(),
            conn,
            io: Some(io),
            done: false,
        })
    }

    fn release_conn(&self, conn: &Arc<PooledConn>) {
        if conn.state.lock().unwrap().closed {
            // flagged closed while checked out, nothing to offer.
            return self.close_conn(conn);
        }

        let mut guard = self.inner.state.lock().unwrap();

        if let Some(entry) = guard.hosts.get_mut(&conn.key) {
            while let Some(tx) = entry.waiters.pop_front() {
                let handoff = Handoff {
                    pool: self.clone(),
                    inner: Some(HandoffKind::Conn(conn.clone())),
                };
                match tx.send(handoff) {
                    Ok(()) => {
                        trace!("handed connection {} to a waiter", conn.id);
                        return;
                    }
                    Err(mut h) => {
                        // waiter gave up; defuse and try the next one.
                        h.inner = None;
                    }
                }
            }
        }

        let mut cs = conn.state.lock().unwrap();
        cs.idle = true;
        cs.idle_since = Instant::now();
        trace!("connection {} idle", conn.id);
    }

    fn close_conn(&self, conn: &Arc<PooledConn>) {
        {
            let mut cs = conn.state.lock().unwrap();
            if cs.closed {
                return;
            }
            cs.closed = true;
        }

        debug!("closed connection {}", conn.id);

        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;

        if let Some(entry) = state.hosts.get_mut(&conn.key) {
            if let Some(i) = entry.conns.iter().position(|c| Arc::ptr_eq(c, conn)) {
                entry.conns.remove(i);
                state.total -= 1;
            }
        }

        self.wake_locked(state, &conn.key);
    }

    fn cancel_dial(&self, key: &str) {
        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;

        if let Some(entry) = state.hosts.get_mut(key) {
            if entry.pending_dials > 0 {
                entry.pending_dials -= 1;
            }
        }
        if state.total > 0 {
            state.total -= 1;
        }

        self.wake_locked(state, key);
    }

    /// A slot opened up: grant a dial permit to the oldest waiter of the
    /// same host, or — the freed slot may have been the global cap — of
    /// any host still under its own cap.
    fn wake_locked(&self, state: &mut State, prefer: &str) {
        let config = &self.inner.config;

        let mut keys = Vec::with_capacity(state.hosts.len());
        keys.push(prefer.to_string());
        for k in state.hosts.keys() {
            if k != prefer {
                keys.push(k.clone());
            }
        }

        for key in keys {
            if state.total >= config.max_total {
                return;
            }

            let entry = match state.hosts.get_mut(&key) {
                Some(e) => e,
                None => continue,
            };

            if entry.conns.len() + entry.pending_dials >= config.max_per_host {
                continue;
            }

            while let Some(tx) = entry.waiters.pop_front() {
                let handoff = Handoff {
                    pool: self.clone(),
                    inner: Some(HandoffKind::Dial(key.clone())),
                };
                match tx.send(handoff) {
                    Ok(()) => {
                        entry.pending_dials += 1;
                        state.total += 1;
                        return;
                    }
                    Err(mut h) => {
                        h.inner = None;
                    }
                }
            }
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Pool::new(PoolConfig::default())
    }
}

/// Pays the charged counters back unless the dial completed.
struct DialPermit {
    pool: Pool,
    key: String,
    armed: bool,
}

impl Drop for DialPermit {
    fn drop(&mut self) {
        if self.armed {
            self.pool.cancel_dial(&self.key);
        }
    }
}

fn find_idle(entry: &mut HostEntry) -> Option<Arc<PooledConn>> {
    for conn in &entry.conns {
        let mut cs = conn.state.lock().unwrap();
        if cs.idle && !cs.closed {
            cs.idle = false;
            debug!("found idle connection {}, reusing", conn.id);
            return Some(conn.clone());
        }
    }
    None
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Pool")
            .field("total", &state.total)
            .field("hosts", &state.hosts.len())
            .finish()
    }
}
