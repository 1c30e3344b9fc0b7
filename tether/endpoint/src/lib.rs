//! Client and server endpoints supervising tether sessions.
//!
//! An endpoint owns the socket-level concerns a session deliberately does
//! not: binding and accepting ([`Server`]), dialing and fixed-interval
//! reconnection ([`Client`]), and a registry of the sessions it has
//! created. Both endpoint flavors hand every new session to the caller's
//! [`SessionInit`] callback, which binds the codec and listener before the
//! session activates.

#![warn(missing_docs)]

mod client;
mod options;
mod server;

pub use client::Client;
pub use options::{ClientOptions, EndpointKind, ServerOptions, SessionDefaults, SessionInit};
pub use server::Server;

use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_ENDPOINT_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_endpoint_id() -> u32 {
    NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed)
}
