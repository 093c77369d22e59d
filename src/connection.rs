//! Per-connection read/dispatch loop.
//!
//! Each accepted socket gets one [`ConnectionHandler`] running as its own
//! task. The handler reads a message, awaits the data hook and, in text
//! mode, writes the reply before reading the next message. Failures end
//! this connection only and go to the error hook.
//!
//! In text mode an empty line is the peer's goodbye, the same as end of
//! stream: the loop exits without dispatching it.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::ServerError;
use crate::framing::{take_line, take_remainder, LineResult};
use crate::hooks::{DataHandler, Hooks, RawHook, TextHook};
use crate::registry::Registration;
use crate::server::ServerOptions;

/// Identity of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Unique for the lifetime of the server.
    pub id: u64,
    /// Remote address.
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

/// Why a connection loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The peer closed its side.
    PeerClosed,
    /// The server closed the connection (stop or run cancellation).
    Canceled,
    /// An error ended the loop; it was handed to the error hook.
    Failed,
}

/// Drives one connection from accept to close.
pub struct ConnectionHandler<S> {
    stream: S,
    info: ConnectionInfo,
    hooks: Arc<Hooks>,
    options: ServerOptions,
    registration: Registration,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        info: ConnectionInfo,
        hooks: Arc<Hooks>,
        options: ServerOptions,
        registration: Registration,
    ) -> Self {
        Self {
            stream,
            info,
            hooks,
            options,
            registration,
        }
    }

    /// Run the loop until the peer closes, an error occurs or the
    /// connection is closed by the server.
    ///
    /// On return the registry entry is gone and the socket is closed.
    pub async fn run(mut self) -> Disconnect {
        let close = self.registration.close_signal().clone();

        let result = tokio::select! {
            _ = close.cancelled() => Ok(Disconnect::Canceled),
            res = self.serve() => res,
        };

        let reason = match result {
            Ok(reason) => {
                debug!(peer = %self.info.peer, conn_id = self.info.id, ?reason, "Connection closed");
                reason
            }
            Err(err) => {
                debug!(peer = %self.info.peer, conn_id = self.info.id, error = %err, "Connection failed");
                self.hooks.report(&err);
                Disconnect::Failed
            }
        };

        let ConnectionHandler {
            stream,
            registration,
            ..
        } = self;
        drop(registration);
        drop(stream);

        reason
    }

    async fn serve(&mut self) -> Result<Disconnect, ServerError> {
        match self.hooks.data.clone() {
            DataHandler::Text(hook) => self.serve_text(hook).await,
            DataHandler::Raw(hook) => self.serve_raw(hook).await,
        }
    }

    async fn serve_text(&mut self, hook: TextHook) -> Result<Disconnect, ServerError> {
        let peer = self.info.peer;
        let max_len = self.options.max_line_length;
        let mut buffer = BytesMut::with_capacity(self.options.buffer_size);

        loop {
            // Drain every complete line before reading again
            while let Some(line) = self.next_line(&mut buffer, max_len, false)? {
                if line.is_empty() {
                    trace!(peer = %peer, "Empty line, closing connection");
                    return Ok(Disconnect::PeerClosed);
                }
                self.reply(&hook, line).await?;
            }

            buffer.reserve(self.options.buffer_size);
            let n = self
                .stream
                .read_buf(&mut buffer)
                .await
                .map_err(|source| ServerError::Connection { peer, source })?;

            if n == 0 {
                if let Some(line) = self.next_line(&mut buffer, max_len, true)? {
                    if !line.is_empty() {
                        self.reply(&hook, line).await?;
                    }
                }
                trace!(peer = %peer, "Connection closed by client");
                return Ok(Disconnect::PeerClosed);
            }
        }
    }

    fn next_line(
        &self,
        buffer: &mut BytesMut,
        max_len: usize,
        at_eof: bool,
    ) -> Result<Option<String>, ServerError> {
        let peer = self.info.peer;
        let result = if at_eof {
            take_remainder(buffer, max_len)
        } else {
            take_line(buffer, max_len)
        };

        match result {
            LineResult::Complete(line) => Ok(Some(line)),
            LineResult::Incomplete => Ok(None),
            LineResult::TooLong => Err(ServerError::FrameTooLong {
                peer,
                limit: max_len,
            }),
            LineResult::InvalidUtf8 => Err(ServerError::Connection {
                peer,
                source: io::Error::new(io::ErrorKind::InvalidData, "line is not valid UTF-8"),
            }),
        }
    }

    async fn reply(&mut self, hook: &TextHook, line: String) -> Result<(), ServerError> {
        let peer = self.info.peer;
        trace!(peer = %peer, data = %line, "Processing line");

        let response = hook(line)
            .await
            .map_err(|source| ServerError::Hook { peer, source })?;

        let mut out = BytesMut::with_capacity(response.len() + 1);
        out.extend_from_slice(response.as_bytes());
        out.put_u8(b'\n');

        self.stream
            .write_all(&out)
            .await
            .map_err(|source| ServerError::Connection { peer, source })?;
        self.stream
            .flush()
            .await
            .map_err(|source| ServerError::Connection { peer, source })
    }

    async fn serve_raw(&mut self, hook: RawHook) -> Result<Disconnect, ServerError> {
        let peer = self.info.peer;
        let size = self.options.buffer_size;
        let mut buffer = BytesMut::with_capacity(size);

        loop {
            buffer.resize(size, 0);
            let n = self
                .stream
                .read(&mut buffer[..])
                .await
                .map_err(|source| ServerError::Connection { peer, source })?;

            if n == 0 {
                trace!(peer = %peer, "Connection closed by client");
                return Ok(Disconnect::PeerClosed);
            }

            buffer.truncate(n);
            let chunk: Bytes = buffer.split().freeze();
            trace!(peer = %peer, len = n, "Processing chunk");

            hook(chunk)
                .await
                .map_err(|source| ServerError::Hook { peer, source })?;
        }
    }
}
