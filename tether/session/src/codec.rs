//! Codec and event-listener contracts.
//!
//! Both contracts are supplied by the application and only invoked by the
//! engine: the codec converts raw bytes to and from typed packets, the
//! listener observes session lifecycle and inbound packets. A built-in
//! [`FramedCodec`] covers applications whose packets are plain byte blobs.

use crate::error::Error;
use crate::session::Session;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tether_wire::FrameDecoder;

/// Converts raw bytes to and from application packets.
///
/// `read` must be resynchronizable: on partial input it returns `Ok(None)`
/// and will be called again once more bytes arrive. Returning an error is
/// treated as unrecoverable framing corruption and closes the session.
pub trait PkgHandler<P>: Send + Sync
where
    P: Send + 'static,
{
    /// Decode one packet from the front of `buf`, returning the packet and
    /// the number of bytes consumed, or `Ok(None)` when more are needed.
    fn read(&self, session: &Session<P>, buf: &[u8]) -> Result<Option<(P, usize)>, Error>;

    /// Encode one packet into the bytes to transmit.
    fn write(&self, session: &Session<P>, pkg: &P) -> Result<Bytes, Error>;
}

/// Application hook invoked on session lifecycle events and inbound packets.
///
/// For a given session, `on_open` always precedes any `on_message`/`on_cron`,
/// which always precede the single `on_close`.
#[async_trait]
pub trait EventListener<P>: Send + Sync
where
    P: Send + 'static,
{
    /// Invoked once the session is activated. Returning an error rejects the
    /// session, which is closed immediately.
    async fn on_open(&self, _session: &Arc<Session<P>>) -> Result<(), Error> {
        Ok(())
    }

    /// Invoked exactly once when the session reaches its terminal state.
    async fn on_close(&self, _session: &Arc<Session<P>>) {}

    /// Invoked when a codec or connection error is about to close the session.
    async fn on_error(&self, _session: &Arc<Session<P>>, _err: &Error) {}

    /// Invoked for each decoded packet. On datagram transports `from` carries
    /// the sender's address for reply addressing; on stream and websocket
    /// transports it is `None`.
    async fn on_message(&self, _session: &Arc<Session<P>>, _pkg: P, _from: Option<SocketAddr>) {}

    /// Invoked every cron period; the sole hook for application heartbeats
    /// and idle-connection policy.
    async fn on_cron(&self, _session: &Arc<Session<P>>) {}
}

/// Built-in codec for raw byte packets, framed with a u32 big-endian length
/// prefix. The session's configured maximum message length bounds the
/// encoded frame size in both directions.
#[derive(Debug, Default)]
pub struct FramedCodec;

impl PkgHandler<Bytes> for FramedCodec {
    fn read(&self, session: &Session<Bytes>, buf: &[u8]) -> Result<Option<(Bytes, usize)>, Error> {
        let mut window = BytesMut::from(buf);
        let before = window.len();

        let mut decoder = FrameDecoder::new(session.max_msg_len());
        match decoder.decode(&mut window)? {
            Some(payload) => Ok(Some((payload, before - window.len()))),
            None => Ok(None),
        }
    }

    fn write(&self, session: &Session<Bytes>, pkg: &Bytes) -> Result<Bytes, Error> {
        Ok(tether_wire::encode_frame(pkg, session.max_msg_len())?)
    }
}
