//! Shared fixtures for the endpoint integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether::{Error, EventListener, FramedCodec, Session, SessionInit};
use tokio::sync::mpsc;

pub type Received = (Bytes, Option<SocketAddr>);

/// Listener recording lifecycle counts and forwarding every packet to a
/// test channel
pub struct Recorder {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub errors: AtomicUsize,
    pub crons: AtomicUsize,
    tx: mpsc::UnboundedSender<Received>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Received>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Self {
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            crons: AtomicUsize::new(0),
            tx,
        });
        (recorder, rx)
    }
}

#[async_trait]
impl EventListener<Bytes> for Recorder {
    async fn on_open(&self, _session: &Arc<Session<Bytes>>) -> Result<(), Error> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_close(&self, _session: &Arc<Session<Bytes>>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_error(&self, _session: &Arc<Session<Bytes>>, _error: &Error) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_message(&self, _session: &Arc<Session<Bytes>>, pkg: Bytes, from: Option<SocketAddr>) {
        let _ = self.tx.send((pkg, from));
    }

    async fn on_cron(&self, _session: &Arc<Session<Bytes>>) {
        self.crons.fetch_add(1, Ordering::SeqCst);
    }
}

/// Listener echoing every packet back where it came from
pub struct EchoBack;

#[async_trait]
impl EventListener<Bytes> for EchoBack {
    async fn on_message(&self, session: &Arc<Session<Bytes>>, pkg: Bytes, from: Option<SocketAddr>) {
        let result = match from {
            Some(peer) => session.write_pkg_to(pkg, peer, Duration::from_secs(1)).await,
            None => session.write_pkg(pkg, Duration::from_secs(1)).await,
        };
        if let Err(err) = result {
            tracing::warn!(%err, "echo failed");
        }
    }
}

/// Listener that stalls the read loop on the first packet, for
/// backpressure tests
pub struct Stall;

#[async_trait]
impl EventListener<Bytes> for Stall {
    async fn on_message(&self, _session: &Arc<Session<Bytes>>, _pkg: Bytes, _from: Option<SocketAddr>) {
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
}

/// Initialization callback binding the framed codec, the given listener,
/// and test-friendly timeouts
pub fn init_with(listener: Arc<dyn EventListener<Bytes>>) -> SessionInit<Bytes> {
    Arc::new(move |session: &Session<Bytes>| {
        session.set_pkg_handler(Arc::new(FramedCodec));
        session.set_event_listener(listener.clone());
        session.set_read_timeout(Duration::from_millis(100));
        session.set_wait_time(Duration::from_millis(500));
        session.set_cron_period(Duration::ZERO);
        Ok(())
    })
}

/// Poll `snapshot` until it yields a session
pub async fn wait_session(
    snapshot: impl Fn() -> Vec<Arc<Session<Bytes>>>,
) -> Arc<Session<Bytes>> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(session) = snapshot().into_iter().next() {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no session established within 5s")
}

/// Receive one forwarded packet or fail the test
pub async fn recv_packet(rx: &mut mpsc::UnboundedReceiver<Received>) -> Received {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no packet within 5s")
        .expect("recorder dropped")
}

/// Poll `counter` until it reaches `at_least`
pub async fn wait_count(counter: &AtomicUsize, at_least: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while counter.load(Ordering::SeqCst) < at_least {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("counter did not reach target within 5s");
}
