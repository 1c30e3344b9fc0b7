//! Transport-agnostic sessions over TCP, UDP, and websockets.
//!
//! This crate provides the [`Session`] abstraction: one live connection
//! wrapped with a read loop, a bounded write queue, cron timers, and a
//! monotonic lifecycle. Applications plug in behavior through two traits:
//!
//! * [`PkgHandler`] decodes inbound bytes into packets and encodes
//!   outbound packets into bytes.
//! * [`EventListener`] receives lifecycle and message callbacks
//!   (`on_open`, `on_message`, `on_cron`, `on_error`, `on_close`).
//!
//! Sessions are transport-agnostic: the same codec and listener run
//! unchanged over TCP, UDP, WS, and WSS connections. Endpoint management
//! (dialing, accepting, reconnection) lives in the companion endpoint
//! crate.

#![warn(missing_docs)]

mod codec;
mod error;
mod session;
mod task;
mod transport;

pub use codec::{EventListener, FramedCodec, PkgHandler};
pub use error::Error;
pub use session::{Session, SessionConfig, SessionStats, State};
pub use task::TaskPool;
pub use transport::{tls, ConnInfo, Connection, IoStream, TransportKind};
