//! Error types for the server lifecycle and per-connection failures.

use std::io;
use std::net::{AddrParseError, SocketAddr};

/// Error produced by user hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Everything the server can fail with.
///
/// Lifecycle and start-time variants are returned to the caller of
/// [`Server::start`](crate::Server::start). Per-connection variants never
/// leave the connection task; they are handed to the error hook only.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// `start` was called while a run is starting or running.
    #[error("server is already running")]
    AlreadyRunning,

    /// `start` was called on an instance whose run has ended.
    #[error("server has already completed a run")]
    AlreadyStopped,

    /// The server is not running.
    #[error("server is not running")]
    NotRunning,

    /// The bind address is not an IPv4 or IPv6 literal.
    #[error("invalid address '{address}': {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: AddrParseError,
    },

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A single accept failed; the accept loop keeps running.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// The listener failed and no further connections can be accepted.
    #[error("listener failed: {0}")]
    Listener(#[source] io::Error),

    /// Read or write failure on one connection.
    #[error("connection {peer}: {source}")]
    Connection {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A text-mode line exceeded the configured maximum length.
    #[error("connection {peer}: line exceeds {limit} bytes")]
    FrameTooLong { peer: SocketAddr, limit: usize },

    /// A user hook returned an error.
    #[error("hook failed for {peer}: {source}")]
    Hook {
        peer: SocketAddr,
        #[source]
        source: HookError,
    },
}

impl ServerError {
    /// Remote peer the error belongs to, for per-connection errors.
    pub fn peer(&self) -> Option<SocketAddr> {
        match self {
            ServerError::Connection { peer, .. }
            | ServerError::FrameTooLong { peer, .. }
            | ServerError::Hook { peer, .. } => Some(*peer),
            _ => None,
        }
    }

    /// Whether the error is contained to a single connection.
    pub fn is_connection_error(&self) -> bool {
        self.peer().is_some()
    }
}
