//! Client endpoint: dial, maintain a session pool, and reconnect.
//!
//! A client keeps `connection_number` sessions alive against one server.
//! Each pool slot runs a supervisor that dials, runs the session to
//! completion, then retries after a fixed `reconnect_interval`. Retries
//! continue until the endpoint is closed; there is no attempt cap and no
//! backoff growth, so a recovered server is rediscovered within one
//! interval.

use crate::options::{ClientOptions, EndpointKind, SessionInit};
use crate::server::open_session;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tether_session::{tls, Connection, Error, IoStream, Session};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::http::Uri;
use tracing::{debug, info, warn};

/// A client endpoint maintaining sessions against one server
pub struct Client<P> {
    id: u32,
    kind: EndpointKind,
    opts: ClientOptions,
    sessions: Arc<DashMap<u32, Arc<Session<P>>>>,
    closed_tx: watch::Sender<bool>,
}

impl<P: Send + 'static> Client<P> {
    /// Create a client endpoint of the given kind. `kind` must be a client
    /// variant.
    pub fn new(kind: EndpointKind, opts: ClientOptions) -> Result<Self, Error> {
        if !kind.is_client() {
            return Err(Error::invalid(format!(
                "{kind:?} is a server kind; use Server"
            )));
        }
        if kind == EndpointKind::WssClient && opts.root_cert_file.is_none() {
            return Err(Error::invalid("WssClient requires root_cert_file"));
        }

        let (closed_tx, _) = watch::channel(false);
        Ok(Self {
            id: crate::next_endpoint_id(),
            kind,
            opts,
            sessions: Arc::new(DashMap::new()),
            closed_tx,
        })
    }

    /// Endpoint id, unique within the process
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Endpoint kind
    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of the live sessions
    pub fn sessions(&self) -> Vec<Arc<Session<P>>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Whether the endpoint has been closed
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Start the connection pool. Returns once configuration has been
    /// validated; dialing and reconnection proceed in the background. `init`
    /// runs on every new session before activation.
    pub async fn run_event_loop(&self, init: SessionInit<P>) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::EndpointClosed);
        }

        // Build the TLS config up front so bad certificate material fails
        // the call instead of looping in the background
        let tls_config = if self.kind == EndpointKind::WssClient {
            let ca = self
                .opts
                .root_cert_file
                .as_deref()
                .ok_or_else(|| Error::invalid("WssClient requires root_cert_file"))?;
            Some(Arc::new(tls::client_config(ca)?))
        } else {
            None
        };

        info!(
            id = self.id,
            kind = ?self.kind,
            server = %self.opts.server_addr,
            slots = self.opts.connection_number.max(1),
            "client endpoint starting"
        );

        for slot in 0..self.opts.connection_number.max(1) {
            tokio::spawn(run_slot(
                slot,
                self.kind,
                self.opts.clone(),
                tls_config.clone(),
                self.sessions.clone(),
                self.closed_tx.subscribe(),
                init.clone(),
            ));
        }

        Ok(())
    }

    /// Stop reconnecting and close every live session. Idempotent.
    pub async fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        info!(id = self.id, "client endpoint closing");

        let live: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in live {
            session.close().await;
        }
        self.sessions.clear();
    }
}

/// One pool slot: dial, run the session until it closes, wait the fixed
/// interval, repeat.
async fn run_slot<P: Send + 'static>(
    slot: usize,
    kind: EndpointKind,
    opts: ClientOptions,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    sessions: Arc<DashMap<u32, Arc<Session<P>>>>,
    mut closed_rx: watch::Receiver<bool>,
    init: SessionInit<P>,
) {
    loop {
        if *closed_rx.borrow() {
            break;
        }

        match dial(kind, &opts, tls_config.clone()).await {
            Ok(conn) => {
                if let Some(session) =
                    open_session(conn, &opts.defaults, &init, &sessions, &closed_rx).await
                {
                    debug!(slot, id = session.id(), "session established");

                    // Hold the slot until the session ends or the endpoint
                    // closes; only then does the reconnect timer start
                    tokio::select! {
                        // Guard dropped inside the block so the slot future
                        // stays Send
                        _ = async { let _ = closed_rx.wait_for(|closed| *closed).await; } => {
                            session.close().await;
                            break;
                        }
                        _ = session.closed() => {
                            debug!(slot, id = session.id(), "session ended");
                        }
                    }
                }
            }
            Err(err) => {
                warn!(slot, %err, server = %opts.server_addr, "connect failed");
            }
        }

        // Fixed-interval retry; no backoff, no attempt cap
        tokio::select! {
            _ = async { let _ = closed_rx.wait_for(|closed| *closed).await; } => break,
            _ = tokio::time::sleep(opts.reconnect_interval) => {}
        }
    }

    debug!(slot, "client slot stopped");
}

/// Establish one connection of the endpoint's kind
async fn dial(
    kind: EndpointKind,
    opts: &ClientOptions,
    tls_config: Option<Arc<rustls::ClientConfig>>,
) -> Result<Connection, Error> {
    match kind {
        EndpointKind::TcpClient => {
            let stream = TcpStream::connect(&opts.server_addr)
                .await
                .map_err(Error::Connection)?;
            Ok(Connection::Stream(IoStream::Plain(stream)))
        }

        EndpointKind::UdpClient => {
            let peer: SocketAddr = opts
                .server_addr
                .parse()
                .map_err(|_| Error::invalid(format!("bad udp address: {}", opts.server_addr)))?;
            // Unconnected socket in the peer's address family; the dialed
            // address is recorded for the application's write_pkg_to calls
            let bind = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind).await.map_err(Error::Connection)?;
            Ok(Connection::Datagram {
                socket: Arc::new(socket),
                peer: Some(peer),
            })
        }

        EndpointKind::WsClient | EndpointKind::WssClient => {
            let uri: Uri = opts
                .server_addr
                .parse()
                .map_err(|_| Error::invalid(format!("bad websocket url: {}", opts.server_addr)))?;
            let host = uri
                .host()
                .ok_or_else(|| Error::invalid("websocket url has no host"))?
                .to_owned();
            let default_port = if kind == EndpointKind::WssClient { 443 } else { 80 };
            let port = uri.port_u16().unwrap_or(default_port);

            let tcp = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(Error::Connection)?;
            let io = match tls_config {
                Some(config) => tls::connect_tls(config, tcp, &host).await?,
                None => IoStream::Plain(tcp),
            };

            let (ws, _response) = client_async(opts.server_addr.as_str(), io).await?;
            Ok(Connection::Ws(ws))
        }

        _ => Err(Error::invalid("server kinds cannot dial")),
    }
}

impl<P> std::fmt::Debug for Client<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("closed", &*self.closed_tx.borrow())
            .finish()
    }
}

impl<P> Drop for Client<P> {
    fn drop(&mut self) {
        // Stops the slot supervisors; sessions wind down through close
        let _ = self.closed_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_server_kind() {
        let err = Client::<bytes::Bytes>::new(
            EndpointKind::TcpServer,
            ClientOptions::new("127.0.0.1:9000"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_wss_requires_root_cert() {
        let err = Client::<bytes::Bytes>::new(
            EndpointKind::WssClient,
            ClientOptions::new("wss://localhost:9000"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
