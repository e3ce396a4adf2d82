//! Error types shared across the bridge.
//!
//! Wire-level decode errors live next to their codecs
//! ([`crate::codec::DatagramError`], [`crate::frame::FrameError`]); this
//! module holds the errors that cross task boundaries.

use std::io;
use std::net::SocketAddr;

/// Errors raised by the controller link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A transmission is awaiting acknowledgement; offer the payload again later.
    #[error("transport busy: a transmission is awaiting acknowledgement")]
    Busy,
    /// A UDP socket could not be bound.
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// Unrecoverable I/O failure on the shared socket pair.
    #[error("controller socket error: {0}")]
    Socket(#[from] io::Error),
    /// The transport task has exited.
    #[error("transport stopped")]
    Closed,
}

/// Errors that end the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to bind {what} listener on {addr}: {source}")]
    Listen {
        what: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}
