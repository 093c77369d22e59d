//! socketr: a minimal asynchronous TCP server.
//!
//! The server listens on one address, accepts concurrent connections and
//! hands every inbound message to a single user-supplied data hook:
//! - Text framing: newline-delimited UTF-8, each line answered with a line
//! - Raw framing: fixed-size chunks, no reply
//!
//! Features:
//! - Connected, data and error hooks configured before start
//! - Registry of live connections, closed in bulk on stop
//! - Cooperative shutdown with a bounded grace period
//!
//! ```no_run
//! use socketr::{DataHandler, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), socketr::ServerError> {
//! let server = Server::new()
//!     .on_data(DataHandler::text(|line| async move { Ok(format!("Echo: {line}")) }));
//! server.start("127.0.0.1", 12345, CancellationToken::new()).await
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod hooks;
pub mod registry;
pub mod server;

pub use connection::{ConnectionHandler, ConnectionInfo, Disconnect};
pub use error::{HookError, ServerError};
pub use framing::Framing;
pub use hooks::{DataHandler, Hooks, DEFAULT_ACK};
pub use registry::ConnectionRegistry;
pub use server::{Server, ServerOptions};
