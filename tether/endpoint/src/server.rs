//! Server endpoint: bind, accept, and manage inbound sessions.

use crate::options::{EndpointKind, ServerOptions, SessionDefaults, SessionInit};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_session::{tls, Connection, Error, IoStream, Session};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

/// A server endpoint accepting sessions over one transport
pub struct Server<P> {
    id: u32,
    kind: EndpointKind,
    opts: ServerOptions,
    sessions: Arc<DashMap<u32, Arc<Session<P>>>>,
    closed_tx: watch::Sender<bool>,
    bound: Mutex<Option<SocketAddr>>,
}

impl<P: Send + 'static> Server<P> {
    /// Create a server endpoint of the given kind. `kind` must be a server
    /// variant.
    pub fn new(kind: EndpointKind, opts: ServerOptions) -> Result<Self, Error> {
        if kind.is_client() {
            return Err(Error::invalid(format!(
                "{kind:?} is a client kind; use Client"
            )));
        }
        if kind == EndpointKind::WssServer && (opts.cert_file.is_none() || opts.key_file.is_none())
        {
            return Err(Error::invalid("WssServer requires cert_file and key_file"));
        }

        let (closed_tx, _) = watch::channel(false);
        Ok(Self {
            id: crate::next_endpoint_id(),
            kind,
            opts,
            sessions: Arc::new(DashMap::new()),
            closed_tx,
            bound: Mutex::new(None),
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

    /// Bound listen address, available once `run_event_loop` returns.
    /// Useful when binding port 0.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().expect("bound lock")
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

    /// Bind the listen address and start accepting. Returns once the bind
    /// has succeeded; accepting proceeds in the background. `init` runs on
    /// every new session before activation.
    pub async fn run_event_loop(&self, init: SessionInit<P>) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::EndpointClosed);
        }

        let closed_rx = self.closed_tx.subscribe();
        let sessions = self.sessions.clone();
        let defaults = self.opts.defaults.clone();

        match self.kind {
            EndpointKind::TcpServer => {
                let listener = TcpListener::bind(&self.opts.local_addr)
                    .await
                    .map_err(Error::Connection)?;
                let addr = listener.local_addr().map_err(Error::Connection)?;
                *self.bound.lock().expect("bound lock") = Some(addr);
                info!(id = self.id, %addr, "tcp server listening");

                tokio::spawn(accept_loop(
                    listener, None, None, sessions, closed_rx, init, defaults,
                ));
            }

            EndpointKind::UdpServer => {
                let socket = UdpSocket::bind(&self.opts.local_addr)
                    .await
                    .map_err(Error::Connection)?;
                let addr = socket.local_addr().map_err(Error::Connection)?;
                *self.bound.lock().expect("bound lock") = Some(addr);
                info!(id = self.id, %addr, "udp server bound");

                // One long-lived session serves every peer of the socket
                let conn = Connection::Datagram {
                    socket: Arc::new(socket),
                    peer: None,
                };
                open_session(conn, &defaults, &init, &sessions, &closed_rx).await;
            }

            EndpointKind::WsServer | EndpointKind::WssServer => {
                let acceptor = if self.kind == EndpointKind::WssServer {
                    // Validated in new(); rebuilt here so config errors
                    // surface to the caller
                    let cert = self
                        .opts
                        .cert_file
                        .as_deref()
                        .ok_or_else(|| Error::invalid("WssServer requires cert_file"))?;
                    let key = self
                        .opts
                        .key_file
                        .as_deref()
                        .ok_or_else(|| Error::invalid("WssServer requires key_file"))?;
                    Some(TlsAcceptor::from(Arc::new(tls::server_config(cert, key)?)))
                } else {
                    None
                };

                let listener = TcpListener::bind(&self.opts.local_addr)
                    .await
                    .map_err(Error::Connection)?;
                let addr = listener.local_addr().map_err(Error::Connection)?;
                *self.bound.lock().expect("bound lock") = Some(addr);
                info!(id = self.id, %addr, path = %self.opts.ws_path, "websocket server listening");

                tokio::spawn(accept_loop(
                    listener,
                    acceptor,
                    Some(self.opts.ws_path.clone()),
                    sessions,
                    closed_rx,
                    init,
                    defaults,
                ));
            }

            _ => unreachable!("client kinds rejected in new()"),
        }

        Ok(())
    }

    /// Stop accepting and close every live session. Idempotent.
    pub async fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        info!(id = self.id, "server endpoint closing");

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

/// Accept TCP connections, optionally upgrading through TLS and websocket
/// handshakes, until the endpoint closes.
async fn accept_loop<P: Send + 'static>(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    ws_path: Option<String>,
    sessions: Arc<DashMap<u32, Arc<Session<P>>>>,
    mut closed_rx: watch::Receiver<bool>,
    init: SessionInit<P>,
    defaults: SessionDefaults,
) {
    loop {
        tokio::select! {
            // Drop the watch guard inside the block; holding it across the
            // accept arm's awaits makes the future !Send
            _ = async { let _ = closed_rx.wait_for(|closed| *closed).await; } => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "inbound connection");
                    let acceptor = acceptor.clone();
                    let ws_path = ws_path.clone();
                    let sessions = sessions.clone();
                    let init = init.clone();
                    let defaults = defaults.clone();
                    let closed = closed_rx.clone();

                    // Handshakes can stall; keep them off the accept loop
                    tokio::spawn(async move {
                        match upgrade(stream, acceptor, ws_path).await {
                            Ok(conn) => {
                                let _ =
                                    open_session(conn, &defaults, &init, &sessions, &closed).await;
                            }
                            Err(err) => warn!(%peer, %err, "handshake failed"),
                        }
                    });
                }
                Err(e) if is_transient(&e) => {
                    warn!(%e, "transient accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    error!(%e, "accept failed; stopping server loop");
                    break;
                }
            },
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

/// Run the TLS and websocket handshakes an accepted socket needs for its
/// endpoint kind
async fn upgrade(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    ws_path: Option<String>,
) -> Result<Connection, Error> {
    let io = match &acceptor {
        Some(acceptor) => tls::accept_tls(acceptor, stream).await?,
        None => IoStream::Plain(stream),
    };

    match ws_path {
        Some(path) => {
            let check = move |req: &Request, resp: Response| {
                if req.uri().path() == path {
                    Ok(resp)
                } else {
                    let mut not_found = ErrorResponse::new(Some(String::from("not found")));
                    *not_found.status_mut() = StatusCode::NOT_FOUND;
                    Err(not_found)
                }
            };
            let ws = accept_hdr_async(io, check).await?;
            Ok(Connection::Ws(ws))
        }
        None => Ok(Connection::Stream(io)),
    }
}

/// Create a session for a new connection, run the caller's initialization,
/// and activate it. The session tracks itself out of the registry on close.
pub(crate) async fn open_session<P: Send + 'static>(
    conn: Connection,
    defaults: &SessionDefaults,
    init: &SessionInit<P>,
    sessions: &Arc<DashMap<u32, Arc<Session<P>>>>,
    closed: &watch::Receiver<bool>,
) -> Option<Arc<Session<P>>> {
    let session = Session::new(conn, defaults.config.clone());
    session.set_name(defaults.name.clone());

    if let Err(err) = init(&session) {
        warn!(id = session.id(), %err, "session init rejected");
        session.reset();
        return None;
    }

    if let Err(err) = session.run().await {
        warn!(id = session.id(), %err, "session activation failed");
        return None;
    }

    sessions.insert(session.id(), session.clone());
    let registry = sessions.clone();
    let tracked = session.clone();
    tokio::spawn(async move {
        tracked.closed().await;
        registry.remove(&tracked.id());
    });

    // The endpoint may have closed while the handshake ran; close() snapshots
    // the registry before this insert lands, so check again here
    if *closed.borrow() {
        sessions.remove(&session.id());
        session.close().await;
        return None;
    }

    Some(session)
}

impl<P> std::fmt::Debug for Server<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("closed", &*self.closed_tx.borrow())
            .finish()
    }
}

impl<P> Drop for Server<P> {
    fn drop(&mut self) {
        // Stops the accept loop; sessions wind down through their own close
        let _ = self.closed_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_client_kind() {
        let err = Server::<bytes::Bytes>::new(
            EndpointKind::TcpClient,
            ServerOptions::new("127.0.0.1:0"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_wss_requires_tls_files() {
        let err = Server::<bytes::Bytes>::new(
            EndpointKind::WssServer,
            ServerOptions::new("127.0.0.1:0"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_open_session_refused_after_close() {
        use bytes::Bytes;
        use tether_session::{EventListener, FramedCodec};

        struct Quiet;

        #[async_trait::async_trait]
        impl EventListener<Bytes> for Quiet {}

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::Datagram {
            socket: Arc::new(socket),
            peer: None,
        };

        let sessions: Arc<DashMap<u32, Arc<Session<Bytes>>>> = Arc::new(DashMap::new());
        let init: SessionInit<Bytes> = Arc::new(|session: &Session<Bytes>| {
            session.set_pkg_handler(Arc::new(FramedCodec));
            session.set_event_listener(Arc::new(Quiet));
            Ok(())
        });

        // A handshake that finishes after the endpoint closed must not leave
        // a live session behind
        let (_closed_tx, closed_rx) = watch::channel(true);
        let opened = open_session(
            conn,
            &SessionDefaults::default(),
            &init,
            &sessions,
            &closed_rx,
        )
        .await;

        assert!(opened.is_none());
        assert!(sessions.is_empty());
    }
}
