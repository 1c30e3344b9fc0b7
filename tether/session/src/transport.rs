//! Connection adapters for stream, datagram, and websocket transports.
//!
//! Every transport exposes the same shape to the session: a reader half
//! yielding [`Input`] events under a read timeout, and a writer half taking
//! encoded bytes with optional datagram addressing. Session logic stays
//! transport-agnostic; the differences (partial frames vs. whole datagrams
//! vs. protocol-framed messages) live entirely in this module.

use crate::error::Error;
use bytes::BytesMut;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Largest datagram the read path will accept
const MAX_DATAGRAM: usize = 64 * 1024;

/// How much spare capacity the stream read path keeps in its buffer
const READ_CHUNK: usize = 16 * 1024;

/// Transport variant behind a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// TCP stream
    Tcp,
    /// UDP datagram socket
    Udp,
    /// Plain WebSocket
    Ws,
    /// WebSocket over TLS
    Wss,
}

impl TransportKind {
    /// Whether this transport is connectionless and requires explicit
    /// per-write addressing
    pub fn is_datagram(&self) -> bool {
        matches!(self, TransportKind::Udp)
    }
}

/// Unified stream type: plain TCP or either side of a TLS session
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// Server-side TLS stream
    ServerTls(tokio_rustls::server::TlsStream<TcpStream>),
    /// Client-side TLS stream
    ClientTls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl IoStream {
    /// Peer address of the underlying socket
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(s) => s.peer_addr(),
            IoStream::ServerTls(s) => s.get_ref().0.peer_addr(),
            IoStream::ClientTls(s) => s.get_ref().0.peer_addr(),
        }
    }

    /// Local address of the underlying socket
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(s) => s.local_addr(),
            IoStream::ServerTls(s) => s.get_ref().0.local_addr(),
            IoStream::ClientTls(s) => s.get_ref().0.local_addr(),
        }
    }

    fn is_tls(&self) -> bool {
        !matches!(self, IoStream::Plain(_))
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            IoStream::ServerTls(s) => Pin::new(s).poll_read(cx, buf),
            IoStream::ClientTls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            IoStream::ServerTls(s) => Pin::new(s).poll_write(cx, buf),
            IoStream::ClientTls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_flush(cx),
            IoStream::ServerTls(s) => Pin::new(s).poll_flush(cx),
            IoStream::ClientTls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            IoStream::ServerTls(s) => Pin::new(s).poll_shutdown(cx),
            IoStream::ClientTls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A live connection, one variant per transport family
pub enum Connection {
    /// Byte stream: reads may return partial frames, the codec buffers
    /// across calls
    Stream(IoStream),
    /// Datagram socket: each read yields one datagram plus its sender;
    /// writes require an explicit destination. `peer` records the dialed
    /// server address on client sockets, for the application's reply
    /// addressing; it is never used implicitly.
    Datagram {
        /// The bound socket
        socket: Arc<UdpSocket>,
        /// Dialed server address, if any
        peer: Option<SocketAddr>,
    },
    /// WebSocket: one protocol message per read/write, framing owned by
    /// the protocol
    Ws(WebSocketStream<IoStream>),
}

/// Addressing and diagnostic metadata for a connection, retained by the
/// session after the I/O halves move into its loops
#[derive(Debug, Clone)]
pub struct ConnInfo {
    /// Transport variant
    pub kind: TransportKind,
    /// Local socket address
    pub local_addr: Option<SocketAddr>,
    /// Peer address (dialed server address for client datagram sockets)
    pub peer_addr: Option<SocketAddr>,
}

impl Connection {
    /// Transport variant of this connection
    pub fn kind(&self) -> TransportKind {
        match self {
            Connection::Stream(_) => TransportKind::Tcp,
            Connection::Datagram { .. } => TransportKind::Udp,
            Connection::Ws(ws) if ws.get_ref().is_tls() => TransportKind::Wss,
            Connection::Ws(_) => TransportKind::Ws,
        }
    }

    /// Snapshot the connection's addressing metadata
    pub fn info(&self) -> ConnInfo {
        let (local_addr, peer_addr) = match self {
            Connection::Stream(s) => (s.local_addr().ok(), s.peer_addr().ok()),
            Connection::Datagram { socket, peer } => (socket.local_addr().ok(), *peer),
            Connection::Ws(ws) => (ws.get_ref().local_addr().ok(), ws.get_ref().peer_addr().ok()),
        };

        ConnInfo {
            kind: self.kind(),
            local_addr,
            peer_addr,
        }
    }

    /// Split into independently owned read and write halves, one per
    /// session loop
    pub fn split(self) -> (ConnReader, ConnWriter) {
        match self {
            Connection::Stream(s) => {
                let (r, w) = tokio::io::split(s);
                (ConnReader::Stream(r), ConnWriter::Stream(w))
            }
            Connection::Datagram { socket, .. } => (
                ConnReader::Datagram {
                    socket: socket.clone(),
                    scratch: vec![0u8; MAX_DATAGRAM],
                },
                ConnWriter::Datagram(socket),
            ),
            Connection::Ws(ws) => {
                let (sink, stream) = ws.split();
                (ConnReader::Ws(stream), ConnWriter::Ws(sink))
            }
        }
    }
}

/// One read-side event delivered to the session loop
#[derive(Debug)]
pub enum Input {
    /// New bytes appended to the stream buffer; frames may still be partial
    Buffered(usize),
    /// One complete datagram and its sender
    Datagram(Vec<u8>, SocketAddr),
    /// One complete websocket message
    Message(Vec<u8>),
    /// Read timeout expired with no data, or a non-data protocol frame
    /// arrived; an idle signal, not an error
    Idle,
    /// Peer closed the connection
    Eof,
}

/// Read half of a connection
pub enum ConnReader {
    /// Stream read half
    Stream(ReadHalf<IoStream>),
    /// Datagram socket with its receive scratch buffer
    Datagram {
        /// The shared socket
        socket: Arc<UdpSocket>,
        /// Receive buffer, reused across reads
        scratch: Vec<u8>,
    },
    /// WebSocket message stream
    Ws(SplitStream<WebSocketStream<IoStream>>),
}

impl ConnReader {
    /// Block for inbound data up to `read_timeout`. A timeout yields
    /// [`Input::Idle`], which the session treats as recoverable.
    pub async fn recv(&mut self, buf: &mut BytesMut, read_timeout: Duration) -> Result<Input, Error> {
        match self {
            ConnReader::Stream(r) => {
                if buf.capacity() - buf.len() < READ_CHUNK {
                    buf.reserve(READ_CHUNK);
                }
                match timeout(read_timeout, r.read_buf(buf)).await {
                    Err(_) => Ok(Input::Idle),
                    Ok(Ok(0)) => Ok(Input::Eof),
                    Ok(Ok(n)) => Ok(Input::Buffered(n)),
                    Ok(Err(e)) => Err(Error::Connection(e)),
                }
            }

            ConnReader::Datagram { socket, scratch } => {
                match timeout(read_timeout, socket.recv_from(scratch)).await {
                    Err(_) => Ok(Input::Idle),
                    Ok(Ok((n, peer))) => Ok(Input::Datagram(scratch[..n].to_vec(), peer)),
                    Ok(Err(e)) => Err(Error::Connection(e)),
                }
            }

            ConnReader::Ws(stream) => match timeout(read_timeout, stream.next()).await {
                Err(_) => Ok(Input::Idle),
                Ok(None) => Ok(Input::Eof),
                Ok(Some(Ok(Message::Binary(data)))) => Ok(Input::Message(data)),
                Ok(Some(Ok(Message::Text(text)))) => Ok(Input::Message(text.into_bytes())),
                Ok(Some(Ok(Message::Close(_)))) => Ok(Input::Eof),
                // Ping/pong and raw frames carry no application payload
                Ok(Some(Ok(_))) => Ok(Input::Idle),
                Ok(Some(Err(e))) => Err(Error::WebSocket(e)),
            },
        }
    }
}

/// Write half of a connection
pub enum ConnWriter {
    /// Stream write half
    Stream(WriteHalf<IoStream>),
    /// Datagram socket
    Datagram(Arc<UdpSocket>),
    /// WebSocket message sink
    Ws(SplitSink<WebSocketStream<IoStream>, Message>),
}

impl ConnWriter {
    /// Transmit one encoded packet, bounded by `write_timeout`. Datagram
    /// transports require `peer`; stream and websocket transports ignore it.
    pub async fn send(
        &mut self,
        data: &[u8],
        peer: Option<SocketAddr>,
        write_timeout: Duration,
    ) -> Result<(), Error> {
        match self {
            ConnWriter::Stream(w) => match timeout(write_timeout, w.write_all(data)).await {
                Err(_) => Err(Error::Connection(std::io::ErrorKind::TimedOut.into())),
                Ok(result) => result.map_err(Error::Connection),
            },

            ConnWriter::Datagram(socket) => {
                let target = peer
                    .ok_or_else(|| Error::invalid("datagram write requires a peer address"))?;
                match timeout(write_timeout, socket.send_to(data, target)).await {
                    Err(_) => Err(Error::Connection(std::io::ErrorKind::TimedOut.into())),
                    Ok(result) => result.map(|_| ()).map_err(Error::Connection),
                }
            }

            ConnWriter::Ws(sink) => {
                match timeout(write_timeout, sink.send(Message::Binary(data.to_vec()))).await {
                    Err(_) => Err(Error::Connection(std::io::ErrorKind::TimedOut.into())),
                    Ok(result) => result.map_err(Error::WebSocket),
                }
            }
        }
    }

    /// Release the transport: shut down the stream or send a websocket
    /// close frame. Datagram sockets have nothing to tear down.
    pub async fn shutdown(&mut self) {
        match self {
            ConnWriter::Stream(w) => {
                let _ = w.shutdown().await;
            }
            ConnWriter::Datagram(_) => {}
            ConnWriter::Ws(sink) => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            }
        }
    }
}

/// TLS configuration and handshakes, loading PEM material by file path
pub mod tls {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use std::fs::File;
    use std::io::BufReader;
    use std::path::Path;
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use tracing::debug;

    /// Build a server-side TLS config from PEM certificate chain and
    /// private key files
    pub fn server_config(cert_file: &Path, key_file: &Path) -> Result<ServerConfig, Error> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let certs = load_certs(cert_file)?;
        let key = load_key(key_file)?;

        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::handshake(format!("server certificate rejected: {e}")))
    }

    /// Build a client-side TLS config trusting the given root certificate
    /// file
    pub fn client_config(ca_file: &Path) -> Result<ClientConfig, Error> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_file)? {
            roots
                .add(cert)
                .map_err(|e| Error::handshake(format!("bad root certificate: {e}")))?;
        }

        Ok(ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth())
    }

    /// Accept-side TLS handshake. Failure rejects the connection before any
    /// session exists.
    pub async fn accept_tls(acceptor: &TlsAcceptor, tcp: TcpStream) -> Result<IoStream, Error> {
        let peer = tcp.peer_addr().ok();
        let stream = acceptor
            .accept(tcp)
            .await
            .map_err(|e| Error::handshake(format!("tls accept from {peer:?}: {e}")))?;

        debug!(?peer, "tls handshake accepted");
        Ok(IoStream::ServerTls(stream))
    }

    /// Connect-side TLS handshake with SNI
    pub async fn connect_tls(
        config: Arc<ClientConfig>,
        tcp: TcpStream,
        sni: &str,
    ) -> Result<IoStream, Error> {
        let connector = TlsConnector::from(config);
        let name = ServerName::try_from(sni.to_owned())
            .map_err(|_| Error::handshake(format!("invalid server name: {sni}")))?;

        let stream = connector
            .connect(name, tcp)
            .await
            .map_err(|e| Error::handshake(format!("tls connect (sni {sni}): {e}")))?;

        debug!(sni, "tls handshake established");
        Ok(IoStream::ClientTls(stream))
    }

    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
        let mut reader = BufReader::new(File::open(path)?);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::Connection)?;

        if certs.is_empty() {
            return Err(Error::handshake(format!(
                "no certificates in {}",
                path.display()
            )));
        }
        Ok(certs)
    }

    fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
        let mut reader = BufReader::new(File::open(path)?);
        rustls_pemfile::private_key(&mut reader)
            .map_err(Error::Connection)?
            .ok_or_else(|| Error::handshake(format!("no private key in {}", path.display())))
    }
}
