//! Length-delimited framing for tether sessions.
//!
//! Stream transports deliver arbitrary byte chunks, so application codecs
//! need a way to mark packet boundaries. This crate provides the u32
//! big-endian length-prefix framing used by the built-in codec and available
//! to applications building their own.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod frame;

pub use error::WireError;
pub use frame::{encode_frame, FrameDecoder, DEFAULT_MAX_FRAME};
