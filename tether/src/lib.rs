//! Asynchronous session framework over TCP, UDP, and websockets.
//!
//! Tether wraps each connection in a [`Session`]: a read loop, a bounded
//! write queue, and cron timers, driven by two application-supplied traits.
//! A [`PkgHandler`] turns bytes into packets and back; an [`EventListener`]
//! receives lifecycle and message callbacks. [`Server`] and [`Client`]
//! endpoints own the socket-level concerns (accepting, dialing,
//! fixed-interval reconnection) and hand every new session to an
//! initialization callback before activating it.
//!
//! ```no_run
//! use bytes::Bytes;
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tether::{
//!     Client, ClientOptions, EndpointKind, EventListener, FramedCodec, Session,
//! };
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl EventListener<Bytes> for Echo {
//!     async fn on_message(
//!         &self,
//!         session: &Arc<Session<Bytes>>,
//!         pkg: Bytes,
//!         _from: Option<SocketAddr>,
//!     ) {
//!         let _ = session.write_pkg(pkg, Duration::from_secs(1)).await;
//!     }
//! }
//!
//! # async fn run() -> Result<(), tether::Error> {
//! let client = Client::new(
//!     EndpointKind::TcpClient,
//!     ClientOptions::new("127.0.0.1:9000"),
//! )?;
//! client
//!     .run_event_loop(Arc::new(|session: &Session<Bytes>| {
//!         session.set_pkg_handler(Arc::new(FramedCodec));
//!         session.set_event_listener(Arc::new(Echo));
//!         Ok(())
//!     }))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub use tether_endpoint::{
    Client, ClientOptions, EndpointKind, Server, ServerOptions, SessionDefaults, SessionInit,
};
pub use tether_session::{
    tls, ConnInfo, Connection, Error, EventListener, FramedCodec, IoStream, PkgHandler, Session,
    SessionConfig, SessionStats, State, TaskPool, TransportKind,
};
pub use tether_wire::{encode_frame, FrameDecoder, WireError, DEFAULT_MAX_FRAME};
