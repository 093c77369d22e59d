//! TCP server: listener, accept loop and shutdown.
//!
//! A [`Server`] is configured with its hooks, then `start` binds and runs
//! the accept loop until cancelled. Every accepted connection is
//! registered and served by its own tracked task. `stop` cancels the run,
//! waits for the listener to be released, closes all connections and
//! waits up to the grace period for their tasks to finish.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Stopped
//!            |
//!            +-> StartFailed (bad address or bind failed; may start again)
//! ```
//!
//! An instance serves a single run; use a fresh one to serve again.

use chrono::Utc;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionHandler, ConnectionInfo};
use crate::error::{HookError, ServerError};
use crate::framing::{DEFAULT_BUFFER_SIZE, DEFAULT_MAX_LINE_LENGTH};
use crate::hooks::{DataHandler, Hooks};
use crate::registry::ConnectionRegistry;

/// Maximum number of concurrent connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// How long `stop` waits for the accept loop and connection tasks
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Pause after running out of descriptors before accepting again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Tunables for a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    /// Raw mode chunk size; also the initial text read buffer size.
    pub buffer_size: usize,
    /// Longest accepted text line, excluding the terminator.
    pub max_line_length: usize,
    /// Connections beyond this are refused.
    pub max_connections: usize,
    pub shutdown_grace: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

#[derive(Debug, Clone)]
enum RunState {
    Idle,
    Starting(CancellationToken),
    StartFailed,
    Running {
        cancel: CancellationToken,
        local_addr: SocketAddr,
    },
    Stopping,
    Stopped,
}

/// Server instance
pub struct Server {
    hooks: Arc<Hooks>,
    options: ServerOptions,
    state: watch::Sender<RunState>,
    registry: Arc<ConnectionRegistry>,
    tracker: TaskTracker,
    next_id: AtomicU64,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Create a server with default options and log-and-acknowledge hooks.
    pub fn new() -> Self {
        Self::with_options(ServerOptions::default())
    }

    /// Create a server with the given options and default hooks.
    pub fn with_options(options: ServerOptions) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Server {
            hooks: Arc::new(Hooks::default()),
            options,
            state,
            registry: Arc::new(ConnectionRegistry::new(options.max_connections)),
            tracker: TaskTracker::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Set the hook called for every accepted connection.
    ///
    /// An error returned by the hook, or a panic inside it, goes to the
    /// error hook; the connection is served regardless.
    pub fn on_connected<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ConnectionInfo) -> Result<(), HookError> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.hooks).connected = Arc::new(hook);
        self
    }

    /// Set the data hook, which also selects the framing mode.
    pub fn on_data(mut self, handler: DataHandler) -> Self {
        Arc::make_mut(&mut self.hooks).data = handler;
        self
    }

    /// Set the hook receiving connection and accept errors.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ServerError) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.hooks).error = Arc::new(hook);
        self
    }

    /// Options this server was created with.
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Bind `address:port` and accept connections until `cancel` fires,
    /// [`stop`](Self::stop) is called or the listener fails.
    ///
    /// Returns `Ok(())` on cancellation and [`ServerError::Listener`] when
    /// the listener fails. Per-connection failures never end up here.
    ///
    /// Lifecycle misuse is checked first: a running server answers
    /// [`ServerError::AlreadyRunning`] whatever the address.
    pub async fn start(
        &self,
        address: &str,
        port: u16,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        let run = cancel.child_token();
        let mut claimed = Err(ServerError::AlreadyRunning);
        self.state.send_if_modified(|state| match state {
            RunState::Idle | RunState::StartFailed => {
                *state = RunState::Starting(run.clone());
                claimed = Ok(());
                true
            }
            RunState::Stopped => {
                claimed = Err(ServerError::AlreadyStopped);
                false
            }
            _ => false,
        });
        claimed?;

        let ip: IpAddr = match address.parse() {
            Ok(ip) => ip,
            Err(source) => {
                self.abandon_start();
                return Err(ServerError::InvalidAddress {
                    address: address.to_string(),
                    source,
                });
            }
        };
        let addr = SocketAddr::new(ip, port);

        let listener = match bind_listener(addr) {
            Ok(listener) => listener,
            Err(source) => {
                self.abandon_start();
                return Err(ServerError::Bind { addr, source });
            }
        };

        // From here on, leaving this function (even by being dropped)
        // releases the listener and ends the run.
        let _finish = RunFinisher { server: self };
        let listener = listener;

        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let promoted = self.state.send_if_modified(|state| match state {
            RunState::Starting(_) => {
                *state = RunState::Running {
                    cancel: run.clone(),
                    local_addr,
                };
                true
            }
            _ => false,
        });
        if !promoted {
            // stop() arrived while binding
            return Ok(());
        }

        info!(address = %local_addr, framing = %self.hooks.data.framing(), "Server listening");

        let result = loop {
            let accepted = tokio::select! {
                biased;
                _ = run.cancelled() => break Ok(()),
                res = listener.accept() => res,
            };

            match accepted {
                Ok((stream, peer)) => self.admit(stream, peer, &run),
                Err(e) if is_transient(&e) => {
                    warn!(error = %e, "Failed to accept connection");
                    let backoff = is_resource_exhausted(&e);
                    self.hooks.report(&ServerError::Accept(e));
                    if backoff {
                        tokio::select! {
                            _ = run.cancelled() => break Ok(()),
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Listener failed");
                    let err = ServerError::Listener(e);
                    self.hooks.report(&err);
                    break Err(err);
                }
            }
        };

        drop(listener);
        info!(address = %local_addr, "Server stopped accepting");
        result
    }

    /// Leave `Starting` after a failed start, waking `wait_listening`.
    ///
    /// If `stop` arrived meanwhile the run counts as finished.
    fn abandon_start(&self) {
        self.state.send_modify(|state| {
            *state = match state {
                RunState::Starting(_) => RunState::StartFailed,
                _ => RunState::Stopped,
            };
        });
    }

    /// Register an accepted connection and spawn its handler.
    fn admit(&self, stream: TcpStream, peer: SocketAddr, run: &CancellationToken) {
        if self.registry.len() >= self.registry.capacity() {
            warn!(
                peer = %peer,
                max_connections = self.registry.capacity(),
                "Connection limit reached, refusing connection"
            );
            return;
        }

        let info = ConnectionInfo {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            peer,
            connected_at: Utc::now(),
        };
        debug!(peer = %peer, conn_id = info.id, "New connection");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.hooks.connected(&info)))
            .unwrap_or_else(|payload| Err(panic_message(payload).into()));
        if let Err(source) = outcome {
            self.hooks.report(&ServerError::Hook { peer, source });
        }

        let Some(registration) = self.registry.register(info.clone(), run) else {
            warn!(peer = %peer, "Connection limit reached, refusing connection");
            return;
        };

        let handler = ConnectionHandler::new(
            stream,
            info,
            Arc::clone(&self.hooks),
            self.options,
            registration,
        );
        self.tracker.spawn(handler.run());
    }

    /// Stop the server.
    ///
    /// Safe to call at any time and more than once. On return the listener
    /// is released, the registry is empty and every connection task has
    /// exited, unless the grace period ran out first.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let mut wait_for_loop = false;
        self.state.send_if_modified(|state| match state {
            RunState::Starting(cancel) | RunState::Running { cancel, .. } => {
                cancel.cancel();
                *state = RunState::Stopping;
                wait_for_loop = true;
                true
            }
            RunState::Stopping => {
                wait_for_loop = true;
                false
            }
            _ => false,
        });

        let grace = self.options.shutdown_grace;

        if wait_for_loop {
            info!("Stopping server");
            let mut rx = self.state.subscribe();
            let released = tokio::time::timeout(
                grace,
                rx.wait_for(|state| matches!(state, RunState::Stopped)),
            )
            .await
            .is_ok();
            if !released {
                warn!(grace_ms = grace.as_millis() as u64, "Accept loop did not exit in time");
            }
        }

        let closed = self.registry.close_all();
        if closed > 0 {
            debug!(count = closed, "Closed open connections");
        }

        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                remaining = self.tracker.len(),
                "Connection tasks still running after grace period"
            );
        }

        Ok(())
    }

    /// Wait until the server is accepting and return its bound address.
    ///
    /// Fails with [`ServerError::NotRunning`] once the run has ended, or
    /// when a start that began after this call fails.
    pub async fn wait_listening(&self) -> Result<SocketAddr, ServerError> {
        let mut rx = self.state.subscribe();
        let mut first = true;
        loop {
            match &*rx.borrow_and_update() {
                RunState::Running { local_addr, .. } => return Ok(*local_addr),
                RunState::Stopping | RunState::Stopped => return Err(ServerError::NotRunning),
                // A failure left over from an earlier attempt does not count
                RunState::StartFailed if !first => return Err(ServerError::NotRunning),
                _ => {}
            }
            first = false;
            rx.changed().await.map_err(|_| ServerError::NotRunning)?;
        }
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.borrow() {
            RunState::Running { local_addr, .. } => Some(*local_addr),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.state.borrow(), RunState::Running { .. })
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Identities of the registered connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.snapshot()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let RunState::Starting(cancel) | RunState::Running { cancel, .. } = &*self.state.borrow()
        {
            cancel.cancel();
        }
        self.registry.close_all();
    }
}

/// Ends a run when `start` returns or is dropped.
struct RunFinisher<'a> {
    server: &'a Server,
}

impl Drop for RunFinisher<'_> {
    fn drop(&mut self) {
        self.server.registry.close_all();
        self.server.state.send_replace(RunState::Stopped);
    }
}

/// Text of a caught panic, for the error hook.
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown payload".to_string());
    format!("hook panicked: {detail}")
}

/// Create the listening socket.
///
/// SO_REUSEADDR lets a new server bind right after a previous one on the
/// same address stopped, while connections linger in TIME_WAIT.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Accept errors that affect one pending connection, not the listener.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_resource_exhausted(e)
}

/// Out of descriptors or buffers; retrying immediately would spin.
fn is_resource_exhausted(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(
            e.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
        )
    }

    #[cfg(not(unix))]
    {
        let _ = e;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = ServerOptions::default();
        assert_eq!(options.buffer_size, 1024);
        assert_eq!(options.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(options.shutdown_grace, Duration::from_secs(5));
        assert_eq!(Server::new().options(), &options);
    }

    #[test]
    fn test_with_options() {
        let options = ServerOptions {
            buffer_size: 16,
            max_connections: 2,
            ..ServerOptions::default()
        };
        let server = Server::with_options(options);
        assert_eq!(server.options().buffer_size, 16);
        assert_eq!(server.registry.capacity(), 2);
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload), "hook panicked: boom");

        let payload = panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload), "hook panicked: code 7");
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));

        #[cfg(unix)]
        {
            let emfile = io::Error::from_raw_os_error(libc::EMFILE);
            assert!(is_transient(&emfile));
            assert!(is_resource_exhausted(&emfile));
        }
    }

    #[tokio::test]
    async fn test_stop_idle_server() {
        let server = Server::new();
        assert!(server.stop().await.is_ok());
        assert!(server.stop().await.is_ok());
        assert!(!server.is_running());
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let server = Server::new();
        let err = server
            .start("not-an-ip", 0, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidAddress { .. }));
        assert!(server.local_addr().is_none());

        // The failed start left the instance startable
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(server.start("127.0.0.1", 0, cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_listening_wakes_on_failed_bind() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let server = Server::new();

        let (waited, started) = tokio::time::timeout(
            Duration::from_secs(5),
            async {
                tokio::join!(
                    server.wait_listening(),
                    server.start("127.0.0.1", port, CancellationToken::new())
                )
            },
        )
        .await
        .expect("wait_listening missed the failed bind");

        assert!(matches!(started, Err(ServerError::Bind { .. })));
        assert!(matches!(waited, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_wait_listening_ignores_earlier_failure() {
        let server = Arc::new(Server::new());
        let err = server
            .start("bogus", 0, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidAddress { .. }));

        let waiter = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.wait_listening().await })
        };
        tokio::task::yield_now().await;

        let runner = Arc::clone(&server);
        let run = tokio::spawn(async move {
            runner
                .start("127.0.0.1", 0, CancellationToken::new())
                .await
        });

        let addr = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter did not wake")
            .unwrap()
            .unwrap();
        assert_eq!(server.local_addr(), Some(addr));

        server.stop().await.unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_running_server_rejects_start_before_parsing() {
        let server = Arc::new(Server::new());
        let runner = Arc::clone(&server);
        let run = tokio::spawn(async move {
            runner
                .start("127.0.0.1", 0, CancellationToken::new())
                .await
        });
        server.wait_listening().await.unwrap();

        let err = server
            .start("bogus", 0, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::AlreadyRunning));
        assert!(server.is_running());

        server.stop().await.unwrap();
        run.await.unwrap().unwrap();
    }

    #[test]
    fn test_fluent_setters_replace_hooks() {
        let server = Server::new()
            .on_data(DataHandler::default_for(crate::framing::Framing::Raw))
            .on_connected(|_conn: &ConnectionInfo| Ok(()))
            .on_error(|_err: &ServerError| {});
        assert_eq!(server.hooks.data.framing(), crate::framing::Framing::Raw);
    }

    #[tokio::test]
    async fn test_cancelled_token_ends_start() {
        let server = Server::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        // An already-cancelled token binds, then returns at once
        let result = server.start("127.0.0.1", 0, cancel).await;
        assert!(result.is_ok());
        assert!(matches!(
            server.wait_listening().await,
            Err(ServerError::NotRunning)
        ));
    }
}
