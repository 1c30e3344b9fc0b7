//! Framing error types.

use thiserror::Error;

/// Framing errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame size exceeds the configured limit
    #[error("frame size {0} exceeds limit")]
    Size(usize),

    /// Length prefix inconsistent with the buffer contents
    #[error("malformed frame")]
    Malformed,
}
