//! Core session: lifecycle, bounded queues, and the per-connection I/O loops.
//!
//! A [`Session`] owns exactly one connection plus its read and write loops,
//! timers, and codec/listener bindings. It is the unit of backpressure (the
//! bounded write queue) and of lifecycle (`Init → Activated → Closing →
//! Closed`, monotonic). Endpoints create sessions, hand them to the caller's
//! initialization callback for configuration, then activate them with
//! [`Session::run`].

use crate::codec::{EventListener, PkgHandler};
use crate::error::Error;
use crate::task::TaskPool;
use crate::transport::{ConnInfo, ConnReader, ConnWriter, Connection, Input, TransportKind};
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

/// Session lifecycle states; transitions are monotonic, never backward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// Created, configurable, loops not running
    Init,
    /// Connection usable, read/write loops running
    Activated,
    /// No new writes accepted; queued writes draining
    Closing,
    /// Terminal; connection released, loops terminated
    Closed,
}

/// Per-session tunables. Set before activation, immutable thereafter.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Maximum encoded message length
    pub max_msg_len: usize,
    /// Read-dispatch queue capacity (kept for surface parity; the read path
    /// currently dispatches decoded packets directly)
    pub rq_len: usize,
    /// Write queue capacity; the backpressure bound
    pub wq_len: usize,
    /// Read timeout; expiry without data is an idle signal, not an error
    pub read_timeout: Duration,
    /// Per-write transmit timeout
    pub write_timeout: Duration,
    /// Interval between `on_cron` invocations; zero disables cron
    pub cron_period: Duration,
    /// Graceful-close budget for draining queued writes
    pub wait_time: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_msg_len: 1024 * 1024,
            rq_len: 1024,
            wq_len: 512,
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(5),
            cron_period: Duration::from_secs(10),
            wait_time: Duration::from_secs(3),
        }
    }
}

/// Point-in-time session counters
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    /// Total payload bytes received
    pub bytes_in: u64,
    /// Total payload bytes sent
    pub bytes_out: u64,
    /// Packets decoded and dispatched
    pub pkgs_in: u64,
    /// Packets transmitted
    pub pkgs_out: u64,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    pkgs_in: AtomicU64,
    pkgs_out: AtomicU64,
}

/// One encoded packet queued for transmission
struct OutboundPkg {
    data: Bytes,
    peer: Option<SocketAddr>,
}

struct Bindings<P> {
    handler: Option<Arc<dyn PkgHandler<P>>>,
    listener: Option<Arc<dyn EventListener<P>>>,
    task_pool: Option<Arc<TaskPool>>,
}

impl<P> Default for Bindings<P> {
    fn default() -> Self {
        Self {
            handler: None,
            listener: None,
            task_pool: None,
        }
    }
}

/// A session wrapping one live connection
pub struct Session<P> {
    id: u32,
    // Handle back to the owning Arc, for spawning loops and listener calls
    me: Weak<Session<P>>,
    kind: TransportKind,
    name: Mutex<String>,
    state_tx: watch::Sender<State>,
    config: Mutex<SessionConfig>,
    bindings: Mutex<Bindings<P>>,
    conn: Mutex<Option<Connection>>,
    conn_info: Mutex<Option<ConnInfo>>,
    writer_tx: Mutex<Option<mpsc::Sender<OutboundPkg>>>,
    force: Notify,
    // Pool-dispatched on_message handlers still running; on_close waits for
    // this to reach zero so it stays the final callback
    inflight: AtomicUsize,
    pool_idle: Notify,
    counters: Counters,
}

impl<P: Send + 'static> Session<P> {
    /// Wrap a connection in a new, unactivated session
    pub fn new(conn: Connection, config: SessionConfig) -> Arc<Self> {
        let info = conn.info();
        let (state_tx, _) = watch::channel(State::Init);

        Arc::new_cyclic(|me| Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            kind: info.kind,
            name: Mutex::new(String::from("session")),
            state_tx,
            config: Mutex::new(config),
            bindings: Mutex::new(Bindings::default()),
            conn: Mutex::new(Some(conn)),
            conn_info: Mutex::new(Some(info)),
            writer_tx: Mutex::new(None),
            force: Notify::new(),
            inflight: AtomicUsize::new(0),
            pool_idle: Notify::new(),
            counters: Counters::default(),
        })
    }

    /// Process-unique session id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Transport variant behind this session
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Human-readable session name
    pub fn name(&self) -> String {
        self.name.lock().expect("name lock").clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> State {
        *self.state_tx.borrow()
    }

    /// Whether the session has entered Closing/Closed
    pub fn is_closed(&self) -> bool {
        self.state() >= State::Closing
    }

    /// Connection metadata, or `None` once reset/closed
    pub fn conn(&self) -> Option<ConnInfo> {
        self.conn_info.lock().expect("conn_info lock").clone()
    }

    /// Local socket address
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn().and_then(|info| info.local_addr)
    }

    /// Peer address (dialed server address on client datagram sessions)
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn().and_then(|info| info.peer_addr)
    }

    /// Maximum encoded message length
    pub fn max_msg_len(&self) -> usize {
        self.config.lock().expect("config lock").max_msg_len
    }

    /// Point-in-time traffic counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
            pkgs_in: self.counters.pkgs_in.load(Ordering::Relaxed),
            pkgs_out: self.counters.pkgs_out.load(Ordering::Relaxed),
        }
    }

    /// Watch the session's lifecycle state
    pub fn state_watch(&self) -> watch::Receiver<State> {
        self.state_tx.subscribe()
    }

    /// Resolve once the session reaches `Closed`
    pub async fn closed(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == State::Closed).await;
    }

    // --- configuration setters; valid only before activation -------------

    /// Rename the session. Unlike the other setters this is allowed at any
    /// time; the name is diagnostic only.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().expect("name lock") = name.into();
    }

    fn configurable(&self, what: &str) -> bool {
        if self.state() == State::Init {
            true
        } else {
            warn!(id = self.id, setter = what, "setter ignored after activation");
            false
        }
    }

    /// Set the maximum encoded message length
    pub fn set_max_msg_len(&self, len: usize) {
        if self.configurable("max_msg_len") {
            self.config.lock().expect("config lock").max_msg_len = len;
        }
    }

    /// Set the read-dispatch queue capacity
    pub fn set_rq_len(&self, len: usize) {
        if self.configurable("rq_len") {
            self.config.lock().expect("config lock").rq_len = len;
        }
    }

    /// Set the write queue capacity
    pub fn set_wq_len(&self, len: usize) {
        if self.configurable("wq_len") {
            self.config.lock().expect("config lock").wq_len = len;
        }
    }

    /// Set the read timeout
    pub fn set_read_timeout(&self, t: Duration) {
        if self.configurable("read_timeout") {
            self.config.lock().expect("config lock").read_timeout = t;
        }
    }

    /// Set the per-write timeout
    pub fn set_write_timeout(&self, t: Duration) {
        if self.configurable("write_timeout") {
            self.config.lock().expect("config lock").write_timeout = t;
        }
    }

    /// Set the cron period; zero disables `on_cron`
    pub fn set_cron_period(&self, t: Duration) {
        if self.configurable("cron_period") {
            self.config.lock().expect("config lock").cron_period = t;
        }
    }

    /// Set the graceful-close wait budget
    pub fn set_wait_time(&self, t: Duration) {
        if self.configurable("wait_time") {
            self.config.lock().expect("config lock").wait_time = t;
        }
    }

    /// Bind the codec
    pub fn set_pkg_handler(&self, handler: Arc<dyn PkgHandler<P>>) {
        if self.configurable("pkg_handler") {
            self.bindings.lock().expect("bindings lock").handler = Some(handler);
        }
    }

    /// Bind the event listener
    pub fn set_event_listener(&self, listener: Arc<dyn EventListener<P>>) {
        if self.configurable("event_listener") {
            self.bindings.lock().expect("bindings lock").listener = Some(listener);
        }
    }

    /// Dispatch `on_message` through a task pool instead of inline on the
    /// read loop
    pub fn set_task_pool(&self, pool: Option<Arc<TaskPool>>) {
        if self.configurable("task_pool") {
            self.bindings.lock().expect("bindings lock").task_pool = pool;
        }
    }

    // --- write path -------------------------------------------------------

    /// Enqueue a packet for asynchronous transmission.
    ///
    /// A zero `wait` is non-blocking: a saturated queue fails immediately
    /// with `QueueFull`. Packets enqueued by one caller in sequence are
    /// transmitted in that sequence. Datagram sessions require explicit
    /// addressing; use [`Session::write_pkg_to`].
    pub async fn write_pkg(&self, pkg: P, wait: Duration) -> Result<(), Error> {
        self.writable()?;
        if self.kind.is_datagram() {
            return Err(Error::invalid(
                "datagram session requires a peer address; use write_pkg_to",
            ));
        }
        self.enqueue(pkg, None, wait).await
    }

    /// Enqueue a packet for a specific peer; datagram sessions only
    pub async fn write_pkg_to(
        &self,
        pkg: P,
        peer: SocketAddr,
        wait: Duration,
    ) -> Result<(), Error> {
        self.writable()?;
        if !self.kind.is_datagram() {
            return Err(Error::invalid(
                "write_pkg_to is only valid on datagram sessions",
            ));
        }
        self.enqueue(pkg, Some(peer), wait).await
    }

    // Lifecycle gate for the write path; checked before addressing so a
    // closed session always reports SessionClosed
    fn writable(&self) -> Result<(), Error> {
        match self.state() {
            State::Init => Err(Error::invalid("session not activated")),
            State::Closing | State::Closed => Err(Error::SessionClosed),
            State::Activated => Ok(()),
        }
    }

    async fn enqueue(&self, pkg: P, peer: Option<SocketAddr>, wait: Duration) -> Result<(), Error> {
        let handler = self
            .bindings
            .lock()
            .expect("bindings lock")
            .handler
            .clone()
            .ok_or_else(|| Error::invalid("no codec bound"))?;
        let data = handler.write(self, &pkg)?;

        let tx = self
            .writer_tx
            .lock()
            .expect("writer_tx lock")
            .clone()
            .ok_or(Error::SessionClosed)?;

        let out = OutboundPkg { data, peer };
        if wait.is_zero() {
            tx.try_send(out).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::QueueFull {
                    waited: Duration::ZERO,
                },
                mpsc::error::TrySendError::Closed(_) => Error::SessionClosed,
            })
        } else {
            match timeout(wait, tx.send(out)).await {
                Err(_) => Err(Error::QueueFull { waited: wait }),
                Ok(Err(_)) => Err(Error::SessionClosed),
                Ok(Ok(())) => Ok(()),
            }
        }
    }

    // --- lifecycle --------------------------------------------------------

    /// Activate the session: invoke `on_open`, then start the read and
    /// write loops. Called by the endpoint once the initialization callback
    /// has bound a codec and listener.
    pub async fn run(&self) -> Result<(), Error> {
        if self.state() != State::Init {
            return Err(Error::invalid("session already activated"));
        }

        let this = self
            .me
            .upgrade()
            .ok_or_else(|| Error::invalid("session dropped"))?;

        let (handler, listener, pool) = {
            let bindings = self.bindings.lock().expect("bindings lock");
            let handler = bindings
                .handler
                .clone()
                .ok_or_else(|| Error::invalid("no codec bound"))?;
            let listener = bindings
                .listener
                .clone()
                .ok_or_else(|| Error::invalid("no event listener bound"))?;
            (handler, listener, bindings.task_pool.clone())
        };

        let conn = self
            .conn
            .lock()
            .expect("conn lock")
            .take()
            .ok_or_else(|| Error::invalid("no connection to activate"))?;

        let cfg = self.config.lock().expect("config lock").clone();
        let (tx, rx) = mpsc::channel(cfg.wq_len.max(1));
        *self.writer_tx.lock().expect("writer_tx lock") = Some(tx);

        let (reader, writer) = conn.split();
        self.advance_state(State::Activated);

        if let Err(err) = listener.on_open(&this).await {
            warn!(id = self.id, %err, "session rejected by on_open");
            self.advance_state(State::Closing);
            self.writer_tx.lock().expect("writer_tx lock").take();
            *self.conn_info.lock().expect("conn_info lock") = None;
            self.advance_state(State::Closed);
            return Err(err);
        }

        debug!(id = self.id, kind = ?self.kind, name = %self.name(), "session activated");

        let read_handle = tokio::spawn(Self::read_loop(
            this.clone(),
            reader,
            cfg.clone(),
            handler,
            listener.clone(),
            pool,
        ));
        let write_handle =
            tokio::spawn(Self::write_loop(this.clone(), writer, rx, cfg, listener.clone()));

        tokio::spawn(async move {
            let _ = read_handle.await;
            let _ = write_handle.await;
            Self::finish_close(&this, listener).await;
        });

        Ok(())
    }

    /// Transition to `Closing`, drain queued writes up to `wait_time`, then
    /// force the connection closed and reach `Closed`. Idempotent;
    /// `on_close` fires exactly once per session.
    pub async fn close(&self) {
        let state = self.state();
        if state >= State::Closing {
            return;
        }

        if state == State::Init {
            // Never activated: release resources, no callbacks were promised
            self.advance_state(State::Closing);
            *self.conn.lock().expect("conn lock") = None;
            *self.conn_info.lock().expect("conn_info lock") = None;
            self.advance_state(State::Closed);
            return;
        }

        let wait = self.config.lock().expect("config lock").wait_time;
        self.begin_close();

        let mut rx = self.state_tx.subscribe();
        if timeout(wait, rx.wait_for(|s| *s == State::Closed))
            .await
            .is_err()
        {
            warn!(id = self.id, "graceful drain exceeded wait budget; forcing close");
            self.force.notify_waiters();
            if timeout(wait, rx.wait_for(|s| *s == State::Closed))
                .await
                .is_err()
            {
                warn!(id = self.id, "session loops did not stop within the wait budget");
            }
        }
    }

    /// Release the connection resources without a graceful drain. Used
    /// after [`Session::close`] for cleanup; afterwards [`Session::conn`]
    /// returns `None`.
    pub fn reset(&self) {
        self.force.notify_waiters();
        *self.conn.lock().expect("conn lock") = None;
        *self.conn_info.lock().expect("conn_info lock") = None;
        self.writer_tx.lock().expect("writer_tx lock").take();
    }

    fn advance_state(&self, next: State) -> State {
        let mut prev = State::Init;
        self.state_tx.send_modify(|s| {
            prev = *s;
            if next > *s {
                *s = next;
            }
        });
        prev
    }

    fn begin_close(&self) {
        let prev = self.advance_state(State::Closing);
        if prev < State::Closing {
            // Dropping the sender lets the write loop drain and exit
            self.writer_tx.lock().expect("writer_tx lock").take();
        }
    }

    async fn finish_close(session: &Arc<Self>, listener: Arc<dyn EventListener<P>>) {
        session.begin_close();

        // Queued pool dispatches must finish before the final callback
        while session.inflight.load(Ordering::Acquire) != 0 {
            session.pool_idle.notified().await;
        }

        *session.conn_info.lock().expect("conn_info lock") = None;

        let prev = session.advance_state(State::Closed);
        if prev != State::Closed {
            let stats = session.stats();
            info!(
                id = session.id,
                name = %session.name(),
                bytes_in = stats.bytes_in,
                bytes_out = stats.bytes_out,
                "session closed"
            );
            listener.on_close(session).await;
        }
    }

    // --- I/O loops --------------------------------------------------------

    async fn read_loop(
        session: Arc<Self>,
        mut reader: ConnReader,
        cfg: SessionConfig,
        handler: Arc<dyn PkgHandler<P>>,
        listener: Arc<dyn EventListener<P>>,
        pool: Option<Arc<TaskPool>>,
    ) {
        let mut buf = BytesMut::with_capacity(16 * 1024);
        let mut state_rx = session.state_tx.subscribe();

        loop {
            tokio::select! {
                biased;

                // The watch guard must drop inside the block: holding it
                // across the sibling arm's awaits makes the future !Send
                _ = async { let _ = state_rx.wait_for(|s| *s >= State::Closing).await; } => break,

                input = reader.recv(&mut buf, cfg.read_timeout) => {
                    let result = match input {
                        Ok(Input::Idle) => Ok(()),
                        Ok(Input::Eof) => {
                            debug!(id = session.id, "peer closed connection");
                            break;
                        }
                        Ok(Input::Buffered(n)) => {
                            session.counters.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                            Self::drain_buffer(&session, &mut buf, cfg.max_msg_len, &handler, &listener, &pool)
                                .await
                        }
                        Ok(Input::Datagram(data, peer)) => {
                            session.counters.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
                            Self::consume_unit(&session, &data, Some(peer), &handler, &listener, &pool)
                                .await
                        }
                        Ok(Input::Message(data)) => {
                            session.counters.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
                            Self::consume_unit(&session, &data, None, &handler, &listener, &pool)
                                .await
                        }
                        Err(err) => Err(err),
                    };

                    if let Err(err) = result {
                        warn!(id = session.id, %err, "read path failed; closing session");
                        listener.on_error(&session, &err).await;
                        break;
                    }
                }
            }
        }

        session.begin_close();
    }

    /// Decode as many packets as the buffered stream bytes allow; partial
    /// frames stay in the buffer for the next read.
    async fn drain_buffer(
        session: &Arc<Self>,
        buf: &mut BytesMut,
        max_msg_len: usize,
        handler: &Arc<dyn PkgHandler<P>>,
        listener: &Arc<dyn EventListener<P>>,
        pool: &Option<Arc<TaskPool>>,
    ) -> Result<(), Error> {
        loop {
            match handler.read(session, &buf[..])? {
                Some((pkg, consumed)) => {
                    if consumed == 0 || consumed > buf.len() {
                        return Err(Error::codec("codec reported an invalid consumed length"));
                    }
                    buf.advance(consumed);
                    session.counters.pkgs_in.fetch_add(1, Ordering::Relaxed);
                    Self::deliver(session, pkg, None, listener, pool).await;
                }
                None => {
                    if buf.len() > max_msg_len {
                        return Err(Error::codec(format!(
                            "undecodable input exceeds max message length {max_msg_len}"
                        )));
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Decode one self-contained unit (a datagram or websocket message);
    /// trailing undecodable bytes mean the unit was truncated or corrupt.
    async fn consume_unit(
        session: &Arc<Self>,
        data: &[u8],
        from: Option<SocketAddr>,
        handler: &Arc<dyn PkgHandler<P>>,
        listener: &Arc<dyn EventListener<P>>,
        pool: &Option<Arc<TaskPool>>,
    ) -> Result<(), Error> {
        let mut buf = BytesMut::from(data);
        while !buf.is_empty() {
            match handler.read(session, &buf[..])? {
                Some((pkg, consumed)) => {
                    if consumed == 0 || consumed > buf.len() {
                        return Err(Error::codec("codec reported an invalid consumed length"));
                    }
                    buf.advance(consumed);
                    session.counters.pkgs_in.fetch_add(1, Ordering::Relaxed);
                    Self::deliver(session, pkg, from, listener, pool).await;
                }
                None => return Err(Error::codec("truncated message")),
            }
        }
        Ok(())
    }

    async fn deliver(
        session: &Arc<Self>,
        pkg: P,
        from: Option<SocketAddr>,
        listener: &Arc<dyn EventListener<P>>,
        pool: &Option<Arc<TaskPool>>,
    ) {
        match pool {
            Some(pool) => {
                let listener = listener.clone();
                let tracked = session.clone();
                session.inflight.fetch_add(1, Ordering::AcqRel);
                pool.dispatch(async move {
                    listener.on_message(&tracked, pkg, from).await;
                    // notify_one stores a permit, so a drain racing this
                    // decrement still wakes
                    if tracked.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
                        tracked.pool_idle.notify_one();
                    }
                })
                .await;
            }
            None => listener.on_message(session, pkg, from).await,
        }
    }

    async fn write_loop(
        session: Arc<Self>,
        mut writer: ConnWriter,
        mut rx: mpsc::Receiver<OutboundPkg>,
        cfg: SessionConfig,
        listener: Arc<dyn EventListener<P>>,
    ) {
        let mut cron = if cfg.cron_period.is_zero() {
            None
        } else {
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + cfg.cron_period,
                cfg.cron_period,
            );
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            Some(interval)
        };

        loop {
            tokio::select! {
                biased;

                _ = session.force.notified() => break,

                maybe = rx.recv() => match maybe {
                    Some(out) => {
                        // A force close must also interrupt a transmit
                        // stalled on a saturated socket
                        let sent = tokio::select! {
                            biased;
                            _ = session.force.notified() => None,
                            result = writer.send(&out.data, out.peer, cfg.write_timeout) => Some(result),
                        };
                        match sent {
                            None => break,
                            Some(Ok(())) => {
                                session.counters.bytes_out.fetch_add(out.data.len() as u64, Ordering::Relaxed);
                                session.counters.pkgs_out.fetch_add(1, Ordering::Relaxed);
                            }
                            Some(Err(err)) => {
                                warn!(id = session.id, %err, "write failed; closing session");
                                listener.on_error(&session, &err).await;
                                break;
                            }
                        }
                    }
                    // Queue closed and fully drained
                    None => break,
                },

                _ = async {
                    match cron.as_mut() {
                        Some(c) => {
                            c.tick().await;
                        }
                        None => std::future::pending().await,
                    }
                } => {
                    if session.state() == State::Activated {
                        listener.on_cron(&session).await;
                    }
                }
            }
        }

        writer.shutdown().await;
        session.begin_close();
    }
}

impl<P> std::fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FramedCodec;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::UdpSocket;

    #[derive(Default)]
    struct CountingListener {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl EventListener<Bytes> for CountingListener {
        async fn on_open(&self, _session: &Arc<Session<Bytes>>) -> Result<(), Error> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_close(&self, _session: &Arc<Session<Bytes>>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn udp_session(
        listener: Arc<CountingListener>,
    ) -> (Arc<Session<Bytes>>, SocketAddr) {
        let peer_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer_sock.local_addr().unwrap();
        // Keep the peer socket alive for the duration of the test
        std::mem::forget(peer_sock);

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let conn = Connection::Datagram {
            socket,
            peer: Some(peer_addr),
        };

        let session = Session::new(
            conn,
            SessionConfig {
                read_timeout: Duration::from_millis(50),
                cron_period: Duration::ZERO,
                ..SessionConfig::default()
            },
        );
        session.set_pkg_handler(Arc::new(FramedCodec));
        session.set_event_listener(listener);
        (session, peer_addr)
    }

    #[tokio::test]
    async fn test_write_before_activation_rejected() {
        let listener = Arc::new(CountingListener::default());
        let (session, _) = udp_session(listener).await;

        let err = session
            .write_pkg(Bytes::from_static(b"early"), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_datagram_addressing_rules() {
        let listener = Arc::new(CountingListener::default());
        let (session, peer_addr) = udp_session(listener.clone()).await;
        session.run().await.unwrap();

        // Plain write_pkg has no addressing context on UDP
        let err = session
            .write_pkg(Bytes::from_static(b"hello"), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        // Explicit addressing succeeds
        session
            .write_pkg_to(Bytes::from_static(b"hello"), peer_addr, Duration::from_secs(1))
            .await
            .unwrap();

        session.close().await;
    }

    #[tokio::test]
    async fn test_close_reset_and_single_on_close() {
        let listener = Arc::new(CountingListener::default());
        let (session, peer_addr) = udp_session(listener.clone()).await;
        session.run().await.unwrap();
        assert_eq!(listener.opened.load(Ordering::SeqCst), 1);

        session.close().await;
        assert!(session.is_closed());
        // Closed wins over the datagram addressing check on both paths
        assert!(matches!(
            session
                .write_pkg(Bytes::from_static(b"late"), Duration::ZERO)
                .await,
            Err(Error::SessionClosed)
        ));
        assert!(matches!(
            session
                .write_pkg_to(Bytes::from_static(b"late"), peer_addr, Duration::ZERO)
                .await,
            Err(Error::SessionClosed)
        ));

        // Second close is a no-op and must not double-invoke on_close
        session.close().await;
        session.closed().await;
        assert_eq!(listener.closed.load(Ordering::SeqCst), 1);

        session.reset();
        assert!(session.conn().is_none());
    }

    #[tokio::test]
    async fn test_setters_ignored_after_activation() {
        let listener = Arc::new(CountingListener::default());
        let (session, _) = udp_session(listener).await;
        session.set_max_msg_len(4096);
        assert_eq!(session.max_msg_len(), 4096);

        session.run().await.unwrap();
        session.set_max_msg_len(1);
        assert_eq!(session.max_msg_len(), 4096);

        session.close().await;
    }

    #[tokio::test]
    async fn test_rejected_on_open_yields_no_on_close() {
        struct Rejecting;

        #[async_trait]
        impl EventListener<Bytes> for Rejecting {
            async fn on_open(&self, _session: &Arc<Session<Bytes>>) -> Result<(), Error> {
                Err(Error::invalid("not welcome"))
            }
        }

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let session = Session::new(
            Connection::Datagram { socket, peer: None },
            SessionConfig::default(),
        );
        session.set_pkg_handler(Arc::new(FramedCodec));
        session.set_event_listener(Arc::new(Rejecting));

        assert!(session.run().await.is_err());
        assert!(session.is_closed());
        assert!(session.conn().is_none());
    }
}
