//! Error handling utils.
//!
//! Most of the I/O framework reports recoverable, per-pipe conditions
//! through the [`Status`](crate::pipe::Status) algebra, the pump rewinds a
//! chain on an error status and offers every earlier pipe a chance to
//! handle it. The `Error` type below is for everything that happens
//! *outside* a running chain: socket setup and request construction.
//! Wire parse failures stay inside the protocol pipes, which answer them
//! on the wire (`400 Bad Request`, rpc faults) rather than surfacing them
//! to the embedder.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for the setup routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("bad url '{url}': {reason}")]
    BadUrl { url: String, reason: &'static str },

    #[error("failed to resolve address '{0}'")]
    ResolveAddress(String),
}
