//! Length-framed echo over TCP.
//!
//! Starts a server that echoes every packet back, dials it with a client,
//! sends a handful of packets, and prints what comes back.
//!
//! ```sh
//! cargo run --example echo
//! ```

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether::{
    Client, ClientOptions, EndpointKind, Error, EventListener, FramedCodec, Server, ServerOptions,
    Session, SessionInit,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct EchoServer;

#[async_trait]
impl EventListener<Bytes> for EchoServer {
    async fn on_open(&self, session: &Arc<Session<Bytes>>) -> Result<(), Error> {
        info!(id = session.id(), peer = ?session.peer_addr(), "client connected");
        Ok(())
    }

    async fn on_message(
        &self,
        session: &Arc<Session<Bytes>>,
        pkg: Bytes,
        _from: Option<SocketAddr>,
    ) {
        if let Err(err) = session.write_pkg(pkg, Duration::from_secs(1)).await {
            info!(id = session.id(), %err, "echo failed");
        }
    }

    async fn on_close(&self, session: &Arc<Session<Bytes>>) {
        info!(id = session.id(), "client disconnected");
    }
}

struct Printer {
    echoed: tokio::sync::mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl EventListener<Bytes> for Printer {
    async fn on_message(
        &self,
        _session: &Arc<Session<Bytes>>,
        pkg: Bytes,
        _from: Option<SocketAddr>,
    ) {
        info!(echo = %String::from_utf8_lossy(&pkg), "received");
        let _ = self.echoed.send(pkg);
    }
}

fn bind_session(listener: Arc<dyn EventListener<Bytes>>) -> SessionInit<Bytes> {
    Arc::new(move |session: &Session<Bytes>| {
        session.set_pkg_handler(Arc::new(FramedCodec));
        session.set_event_listener(listener.clone());
        Ok(())
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let server = Server::new(EndpointKind::TcpServer, ServerOptions::new("127.0.0.1:0"))?;
    server
        .run_event_loop(bind_session(Arc::new(EchoServer)))
        .await?;
    let addr = server.listen_addr().expect("server bound");
    info!(%addr, "echo server listening");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let client = Client::new(EndpointKind::TcpClient, ClientOptions::new(addr.to_string()))?;
    client
        .run_event_loop(bind_session(Arc::new(Printer { echoed: tx })))
        .await?;

    // Wait for the pool slot to establish its session
    let session = loop {
        if let Some(session) = client.sessions().into_iter().next() {
            break session;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    for i in 0..5 {
        let msg = format!("hello {i}");
        session
            .write_pkg(Bytes::from(msg), Duration::from_secs(1))
            .await?;
    }
    for _ in 0..5 {
        rx.recv().await;
    }

    client.close().await;
    server.close().await;
    Ok(())
}
