//! Hooks invoked by the server at connection lifecycle points.
//!
//! There is exactly one hook per event kind. The data hook is a tagged
//! variant so the framing mode travels with it:
//!
//! - [`DataHandler::Text`]: line in, line out.
//! - [`DataHandler::Raw`]: chunk in, nothing out.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{error, info, trace};

use crate::connection::ConnectionInfo;
use crate::error::{HookError, ServerError};
use crate::framing::Framing;

/// Reply sent by the default text hook.
pub const DEFAULT_ACK: &str = "Message received and processed successfully.";

/// Boxed future returned by data hooks.
pub type HookFuture<T> = Pin<Box<dyn Future<Output = Result<T, HookError>> + Send>>;

/// Called synchronously by the accept loop for every new connection.
pub type ConnectedHook = Arc<dyn Fn(&ConnectionInfo) -> Result<(), HookError> + Send + Sync>;

/// Text-mode data hook: receives a line, returns the reply line.
pub type TextHook = Arc<dyn Fn(String) -> HookFuture<String> + Send + Sync>;

/// Raw-mode data hook: receives a chunk, replies with nothing.
pub type RawHook = Arc<dyn Fn(Bytes) -> HookFuture<()> + Send + Sync>;

/// Receives every error that is not returned to a caller.
pub type ErrorHook = Arc<dyn Fn(&ServerError) + Send + Sync>;

/// The data hook together with its framing mode.
///
/// A panic inside the hook unwinds its connection task only: the
/// connection is deregistered and closed, other connections and the
/// accept loop carry on.
#[derive(Clone)]
pub enum DataHandler {
    Text(TextHook),
    Raw(RawHook),
}

impl DataHandler {
    /// Build a text-mode handler from an async closure.
    pub fn text<F, Fut>(f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, HookError>> + Send + 'static,
    {
        DataHandler::Text(Arc::new(move |line| -> HookFuture<String> {
            Box::pin(f(line))
        }))
    }

    /// Build a raw-mode handler from an async closure.
    pub fn raw<F, Fut>(f: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        DataHandler::Raw(Arc::new(move |chunk| -> HookFuture<()> {
            Box::pin(f(chunk))
        }))
    }

    /// Framing mode implied by this handler.
    pub fn framing(&self) -> Framing {
        match self {
            DataHandler::Text(_) => Framing::Text,
            DataHandler::Raw(_) => Framing::Raw,
        }
    }

    /// Default handler for a framing mode: log the payload and acknowledge.
    pub fn default_for(framing: Framing) -> Self {
        match framing {
            Framing::Text => DataHandler::text(|line| async move {
                info!(data = %line, "Data received");
                Ok(DEFAULT_ACK.to_string())
            }),
            Framing::Raw => DataHandler::raw(|chunk| async move {
                info!(len = chunk.len(), "Data received");
                trace!(data = ?chunk, "Raw payload");
                Ok(())
            }),
        }
    }
}

impl std::fmt::Debug for DataHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataHandler::{:?}", self.framing())
    }
}

/// The full hook set of a server.
#[derive(Clone)]
pub struct Hooks {
    pub(crate) connected: ConnectedHook,
    pub(crate) data: DataHandler,
    pub(crate) error: ErrorHook,
}

impl Hooks {
    /// Run the connected hook.
    pub(crate) fn connected(&self, info: &ConnectionInfo) -> Result<(), HookError> {
        (self.connected)(info)
    }

    /// Hand an error to the error hook.
    pub(crate) fn report(&self, err: &ServerError) {
        (self.error)(err)
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            connected: Arc::new(|conn: &ConnectionInfo| {
                info!(peer = %conn.peer, conn_id = conn.id, "Client connected");
                Ok::<(), HookError>(())
            }),
            data: DataHandler::default_for(Framing::Text),
            error: Arc::new(|err: &ServerError| {
                error!(error = %err, "Server error");
            }),
        }
    }
}
