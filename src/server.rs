//! Server lifecycle management.
//!
//! # States
//!
//! ```text
//! Idle ──serve()──▶ Running ──token cancelled──▶ ShuttingDown ──drained / grace elapsed──▶ Stopped
//! ```
//!
//! - **Running**: the composed handler is bound to a listener. Every accepted
//!   connection is served by its own task in a `JoinSet`.
//! - **ShuttingDown**: entered when the [`CancellationToken`] passed to
//!   [`Server::serve`] is cancelled. The listener is closed at once and every
//!   open connection is asked to finish its current request and close.
//! - **Stopped**: every connection finished within the grace period
//!   (`Ok(())`), or the grace period elapsed first, the remaining connections
//!   were aborted and [`ServerError::ShutdownTimeout`] is returned.
//!
//! Accept errors that only concern one connection (refused, aborted, reset)
//! are logged and skipped. Any other accept error is fatal: open connections
//! get the same grace-bounded drain and `serve` returns [`ServerError::Serve`].
//!
//! The manager never installs signal handlers itself. The binary cancels the
//! token from [`utils::cancel_on_signal`](crate::utils::cancel_on_signal);
//! tests cancel it directly.
//!
//! # Timeouts
//!
//! | Option | Enforcement |
//! |--------|-------------|
//! | `write_timeout` | `tower_http` `TimeoutLayer`: the whole request, answered with `408` |
//! | `read_timeout` | hyper `header_read_timeout` for the request head, `tower_http` `RequestBodyTimeoutLayer` for the body |
//! | `idle_timeout` | Per connection: a keep-alive connection with no request in flight for this long is closed |
//!
//! # Handler layout
//!
//! ```text
//! middlewares (first listed outermost)
//!   └─ write timeout
//!        └─ CORS
//!             └─ read timeout
//!                  └─ application router
//! ```

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tower::{Layer, ServiceExt};
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tracing::{debug, error, info, warn};

use crate::error::ServerError;
use crate::middleware::{CorsLayer, Handler, Middleware, compose, handler};

/// Lifecycle states of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

/// Fixed server settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Zero disables the per-connection idle bound.
    pub idle_timeout: Duration,
    /// How long in-flight requests may run once shutdown begins.
    pub shutdown_grace: Duration,
    pub cors_allow_credentials: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(10),
            cors_allow_credentials: false,
        }
    }
}

/// Owns the composed handler and drives it through one serve cycle.
pub struct Server {
    handler: Handler,
    options: ServerOptions,
    state: watch::Sender<ServerState>,
}

impl Server {
    /// Compose `app` with the CORS layer, the timeouts and `middlewares`.
    pub fn new(app: Router, middlewares: &[Middleware], options: ServerOptions) -> Self {
        let inner = RequestBodyTimeoutLayer::new(options.read_timeout).layer(app);
        let inner = CorsLayer::new(options.cors_allow_credentials).layer(inner);
        let inner =
            TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, options.write_timeout)
                .layer(inner);

        Self {
            handler: compose(handler(inner), middlewares),
            options,
            state: watch::Sender::new(ServerState::Idle),
        }
    }

    /// The fully composed handler, for in-process use.
    pub fn handler(&self) -> Handler {
        self.handler.clone()
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Bind `addr` and [`serve`](Self::serve) until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the address cannot be bound, otherwise as
    /// for [`serve`](Self::serve).
    pub async fn run(&self, addr: &str, shutdown: CancellationToken) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` is cancelled, then
    /// drain for at most the configured grace period.
    ///
    /// # Errors
    ///
    /// - [`ServerError::AlreadyStarted`] if this server has been started before
    /// - [`ServerError::Serve`] if accepting fails for a reason other than a
    ///   single refused, aborted or reset connection
    /// - [`ServerError::ShutdownTimeout`] if connections are still open when
    ///   the grace period elapses; they are aborted before this returns
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        let started = self.state.send_if_modified(|state| {
            if *state == ServerState::Idle {
                *state = ServerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ServerError::AlreadyStarted);
        }

        let addr = listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();

        // `closing` asks connections to finish up; `kill` ends the tasks
        // hyper spawned for HTTP/2 streams once the grace period is over.
        let closing = shutdown.child_token();
        let kill = CancellationToken::new();
        let builder = self.connection_builder(kill.clone());
        let mut connections = JoinSet::new();

        info!(addr = %addr, "Server started");

        let accepted = loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = Connection {
                            builder: builder.clone(),
                            handler: self.handler.clone(),
                            closing: closing.clone(),
                            idle_timeout: self.options.idle_timeout,
                            peer,
                        };
                        connections.spawn(conn.serve(stream));
                    }
                    Err(e) if is_connection_error(&e) => {
                        debug!(error = %e, "Dropped connection during accept");
                    }
                    Err(e) => break Err(ServerError::Serve(e)),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    reap(joined);
                }
            }
        };
        drop(listener);

        self.state.send_replace(ServerState::ShuttingDown);
        match &accepted {
            Ok(()) => info!(
                open = connections.len(),
                "Server graceful shutdown requested"
            ),
            Err(err) => error!(error = %err, "HTTP server error"),
        }
        closing.cancel();

        let grace = self.options.shutdown_grace;
        let drained = match tokio::time::timeout(grace, drain(&mut connections)).await {
            Ok(()) => {
                info!("Graceful shutdown complete");
                Ok(())
            }
            Err(_) => {
                warn!(
                    grace = ?grace,
                    open = connections.len(),
                    "Connections still open after grace period, aborting them"
                );
                kill.cancel();
                connections.abort_all();
                drain(&mut connections).await;
                Err(ServerError::ShutdownTimeout(grace))
            }
        };

        self.state.send_replace(ServerState::Stopped);
        accepted.and(drained)
    }

    fn connection_builder(&self, kill: CancellationToken) -> ConnBuilder<KillableExecutor> {
        let mut builder = ConnBuilder::new(KillableExecutor { kill });
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.options.read_timeout);
        builder.http2().timer(TokioTimer::new());
        builder
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("options", &self.options)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Accept errors that end one connection but leave the listener usable.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

fn reap(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined
        && e.is_panic()
    {
        error!(error = %e, "Connection task panicked");
    }
}

async fn drain(connections: &mut JoinSet<()>) {
    while let Some(joined) = connections.join_next().await {
        reap(joined);
    }
}

// =============================================================================
// Connections
// =============================================================================

/// Spawns hyper's background tasks so they stop when `kill` is cancelled.
#[derive(Debug, Clone)]
struct KillableExecutor {
    kill: CancellationToken,
}

impl<F> hyper::rt::Executor<F> for KillableExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        let kill = self.kill.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = kill.cancelled() => {}
                _ = fut => {}
            }
        });
    }
}

/// Requests in flight on one connection and when the last one finished.
#[derive(Debug)]
struct Activity {
    in_flight: AtomicUsize,
    last_active: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            last_active: Mutex::new(Instant::now()),
        }
    }

    fn begin(self: &Arc<Self>) -> ActivityGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        ActivityGuard(self.clone())
    }

    fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// When the connection becomes idle if nothing else arrives.
    fn idle_deadline(&self, idle: Duration) -> Instant {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            Instant::now() + idle
        } else {
            self.last_active() + idle
        }
    }

    fn is_idle(&self, idle: Duration) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
            && Instant::now().saturating_duration_since(self.last_active()) >= idle
    }
}

struct ActivityGuard(Arc<Activity>);

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        *self.0.last_active.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything one connection task needs.
struct Connection {
    builder: ConnBuilder<KillableExecutor>,
    handler: Handler,
    closing: CancellationToken,
    idle_timeout: Duration,
    peer: SocketAddr,
}

impl Connection {
    async fn serve(self, stream: TcpStream) {
        let Self {
            builder,
            handler,
            closing,
            idle_timeout,
            peer,
        } = self;

        let activity = Arc::new(Activity::new());
        let service = {
            let activity = activity.clone();
            service_fn(move |req: Request<Incoming>| {
                let guard = activity.begin();
                let mut req = req.map(Body::new);
                req.extensions_mut().insert(ConnectInfo(peer));
                let call = handler.clone().oneshot(req);
                async move {
                    let response = call.await;
                    drop(guard);
                    response
                }
            })
        };

        let conn = builder.serve_connection(TokioIo::new(stream), service);
        tokio::pin!(conn);

        let idle_bounded = !idle_timeout.is_zero();
        let mut finishing = false;
        loop {
            let idle_at = activity.idle_deadline(idle_timeout);
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!(peer = %peer, error = %e, "Connection closed with error");
                    }
                    break;
                }
                () = closing.cancelled(), if !finishing => {
                    finishing = true;
                    conn.as_mut().graceful_shutdown();
                }
                () = sleep_until(idle_at), if idle_bounded && !finishing => {
                    if activity.is_idle(idle_timeout) {
                        debug!(peer = %peer, idle = ?idle_timeout, "Closing idle connection");
                        finishing = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }
        }
    }
}
