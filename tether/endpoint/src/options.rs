//! Endpoint flavors and their construction options.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether_session::{Error, Session, SessionConfig, TransportKind};

/// Which endpoint flavor to run. Clients dial out and maintain a pool of
/// sessions; servers accept inbound connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Dial a TCP server
    TcpClient,
    /// Accept TCP connections
    TcpServer,
    /// Bind an unconnected UDP socket aimed at a server
    UdpClient,
    /// Bind a UDP socket serving all peers through one session
    UdpServer,
    /// Dial a websocket server
    WsClient,
    /// Accept websocket connections
    WsServer,
    /// Dial a websocket server over TLS
    WssClient,
    /// Accept websocket connections over TLS
    WssServer,
}

impl EndpointKind {
    /// Whether this endpoint dials out rather than accepts
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            EndpointKind::TcpClient
                | EndpointKind::UdpClient
                | EndpointKind::WsClient
                | EndpointKind::WssClient
        )
    }

    /// The transport the endpoint's sessions run over
    pub fn transport(&self) -> TransportKind {
        match self {
            EndpointKind::TcpClient | EndpointKind::TcpServer => TransportKind::Tcp,
            EndpointKind::UdpClient | EndpointKind::UdpServer => TransportKind::Udp,
            EndpointKind::WsClient | EndpointKind::WsServer => TransportKind::Ws,
            EndpointKind::WssClient | EndpointKind::WssServer => TransportKind::Wss,
        }
    }
}

/// Per-session startup callback. The endpoint invokes it on every new
/// session, before activation; it must bind a codec and listener, and may
/// adjust session configuration. Returning an error rejects the session.
pub type SessionInit<P> = Arc<dyn Fn(&Session<P>) -> Result<(), Error> + Send + Sync>;

/// Baseline applied to every session an endpoint creates, before the
/// initialization callback runs
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    /// Session name prefix, diagnostic only
    pub name: String,
    /// Baseline session configuration
    pub config: SessionConfig,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            name: String::from("session"),
            config: SessionConfig::default(),
        }
    }
}

/// Client endpoint options
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server address: `host:port` for TCP/UDP, a `ws://` or `wss://` URL
    /// for websockets
    pub server_addr: String,
    /// How many concurrent sessions to maintain against the server
    pub connection_number: usize,
    /// Fixed delay between reconnection attempts
    pub reconnect_interval: Duration,
    /// Root certificate trusted for WSS connections
    pub root_cert_file: Option<PathBuf>,
    /// Baseline for new sessions
    pub defaults: SessionDefaults,
}

impl ClientOptions {
    /// Options dialing `server_addr` with a single session
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            connection_number: 1,
            reconnect_interval: Duration::from_secs(3),
            root_cert_file: None,
            defaults: SessionDefaults::default(),
        }
    }

    /// Maintain `n` concurrent sessions
    pub fn with_connection_number(mut self, n: usize) -> Self {
        self.connection_number = n;
        self
    }

    /// Fixed delay between reconnection attempts
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Trust the given root certificate for WSS
    pub fn with_root_cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_cert_file = Some(path.into());
        self
    }

    /// Baseline for new sessions
    pub fn with_defaults(mut self, defaults: SessionDefaults) -> Self {
        self.defaults = defaults;
        self
    }
}

/// Server endpoint options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to bind, `host:port`
    pub local_addr: String,
    /// Accepted request path for websocket upgrades
    pub ws_path: String,
    /// Certificate chain file for WSS
    pub cert_file: Option<PathBuf>,
    /// Private key file for WSS
    pub key_file: Option<PathBuf>,
    /// Baseline for new sessions
    pub defaults: SessionDefaults,
}

impl ServerOptions {
    /// Options binding `local_addr`
    pub fn new(local_addr: impl Into<String>) -> Self {
        Self {
            local_addr: local_addr.into(),
            ws_path: String::from("/"),
            cert_file: None,
            key_file: None,
            defaults: SessionDefaults::default(),
        }
    }

    /// Accepted request path for websocket upgrades
    pub fn with_ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }

    /// Certificate chain and private key files for WSS
    pub fn with_tls_files(
        mut self,
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
    ) -> Self {
        self.cert_file = Some(cert_file.into());
        self.key_file = Some(key_file.into());
        self
    }

    /// Baseline for new sessions
    pub fn with_defaults(mut self, defaults: SessionDefaults) -> Self {
        self.defaults = defaults;
        self
    }
}
