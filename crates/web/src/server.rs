//! The listening server: connection accounting, graceful shutdown and
//! request dispatch into the root handler.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, DATE};
use http::{HeaderValue, Request, Response, StatusCode};
use onion_http::connection::{ConnectionAction, ConnectionObserver, HttpConnection};
use onion_http::handler::Handler;
use onion_http::protocol::body::ReqBody;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::body::ResponseBody;
use crate::chain::{HttpHandler, Next};
use crate::config::ServerConfig;
use crate::context::RequestContext;
use crate::date::DateService;
use crate::error::{GENERIC_SERVER_MESSAGE, HttpError, ServerError};
use crate::tls;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Draining,
}

/// An HTTP server driving every request through one root handler.
///
/// ```no_run
/// use onion_web::{MiddlewareChain, Server, ServerConfig, StandardHandler};
///
/// # async fn run(app: MiddlewareChain) -> Result<(), onion_web::ServerError> {
/// let root = MiddlewareChain::builder().add_last(StandardHandler::new()).add_last(app).build();
/// let server = Server::new(ServerConfig::default(), root);
///
/// server.start().await?;
/// tokio::signal::ctrl_c().await?;
/// server.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<Registry>,
    lifecycle: Mutex<Lifecycle>,
}

struct Lifecycle {
    state: ServerState,
    running: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    stop_accepting: CancellationToken,
    accept_task: JoinHandle<()>,
    tracker: TaskTracker,
}

impl Server {
    pub fn new<H: HttpHandler + 'static>(config: ServerConfig, root: H) -> Self {
        let dispatcher = Dispatcher { root: Arc::new(root), body_limit: config.body_limit };
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            registry: Arc::new(Registry::default()),
            lifecycle: Mutex::new(Lifecycle { state: ServerState::Stopped, running: None }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle().state
    }

    /// The bound address while running; useful when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle().running.as_ref().map(|running| running.local_addr)
    }

    pub fn open_connections(&self) -> usize {
        self.registry.connections.len()
    }

    pub fn in_flight_requests(&self) -> usize {
        self.registry.connections.iter().map(|entry| entry.pending).sum()
    }

    /// Binds the listener and starts accepting connections.
    /// Calling it on a server that is not stopped does nothing.
    pub async fn start(&self) -> Result<(), ServerError> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != ServerState::Stopped {
                debug!(state = ?lifecycle.state, "server already started");
                return Ok(());
            }
            lifecycle.state = ServerState::Starting;
        }

        match self.bind().await {
            Ok(running) => {
                info!(address = %running.local_addr, tls = self.config.tls.is_enabled(), "listening");
                let mut lifecycle = self.lifecycle();
                lifecycle.running = Some(running);
                lifecycle.state = ServerState::Running;
                Ok(())
            }
            Err(e) => {
                error!(cause = %e, "can't start server");
                self.lifecycle().state = ServerState::Stopped;
                Err(e)
            }
        }
    }

    async fn bind(&self) -> Result<Running, ServerError> {
        let tls = tls::acceptor(&self.config.tls)?;

        let address = self.config.socket_addr();
        let listener = TcpListener::bind(address).await.map_err(|source| ServerError::Bind { address, source })?;
        let local_addr = listener.local_addr()?;

        self.registry.draining.store(false, Ordering::SeqCst);
        let tracker = TaskTracker::new();
        let stop_accepting = CancellationToken::new();
        let spawner = ConnectionSpawner {
            dispatcher: Arc::clone(&self.dispatcher),
            registry: Arc::clone(&self.registry),
            tracker: tracker.clone(),
            tls,
            idle_timeout: self.config.socket_timeout(),
        };
        let accept_task = tokio::spawn(accept_loop(listener, spawner, stop_accepting.clone()));

        Ok(Running { local_addr, stop_accepting, accept_task, tracker })
    }

    /// Drains and stops the server. Calling it on a server that is not running does nothing.
    ///
    /// Requests keep being served for the configured shutdown delay. Then the
    /// listener closes, idle connections are closed, and busy ones are closed
    /// as soon as their current response is written. Connections still open
    /// one socket timeout later are aborted.
    pub async fn stop(&self) {
        let running = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != ServerState::Running {
                debug!(state = ?lifecycle.state, "server is not running");
                return;
            }
            lifecycle.state = ServerState::Draining;
            lifecycle.running.take()
        };
        let Some(running) = running else { return };

        self.registry.draining.store(true, Ordering::SeqCst);
        let delay = self.config.shutdown_delay();
        info!(delay_ms = self.config.shutdown_delay_ms, in_flight = self.in_flight_requests(), "draining");
        tokio::time::sleep(delay).await;

        running.stop_accepting.cancel();
        if let Err(e) = running.accept_task.await {
            warn!(cause = %e, "accept loop ended abnormally");
        }

        running.tracker.close();
        self.registry.close_idle();

        let grace = self.config.force_close_grace();
        if tokio::time::timeout(grace, running.tracker.wait()).await.is_err() {
            warn!(remaining = self.open_connections(), grace_ms = self.config.socket_timeout_ms, "closing connections forcibly");
            self.registry.abort_all();
            running.tracker.wait().await;
        }

        self.registry.connections.clear();
        self.lifecycle().state = ServerState::Stopped;
        info!("server stopped");
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(running) = self.lifecycle().running.take() {
            running.stop_accepting.cancel();
            running.accept_task.abort();
            self.registry.abort_all();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("config", &self.config).field("state", &self.state()).finish_non_exhaustive()
    }
}

async fn accept_loop(listener: TcpListener, spawner: ConnectionSpawner, stop: CancellationToken) {
    loop {
        select! {
            biased;
            () = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => spawner.spawn(stream, peer),
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    // usually fd exhaustion; don't spin on it
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    debug!("stopped accepting connections");
}

struct ConnectionSpawner {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<Registry>,
    tracker: TaskTracker,
    tls: Option<TlsAcceptor>,
    idle_timeout: Option<Duration>,
}

impl ConnectionSpawner {
    fn spawn(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(cause = %e, "can't set TCP_NODELAY");
        }

        let (id, close_signal) = self.registry.register();
        let hooks = ConnectionHooks { registry: Arc::clone(&self.registry), id };
        let dispatcher = Arc::clone(&self.dispatcher);
        let tls = self.tls.clone();
        let idle_timeout = self.idle_timeout;

        let task = self.tracker.spawn(async move {
            match tls {
                Some(acceptor) => {
                    let handshake = match idle_timeout {
                        Some(limit) => tokio::time::timeout(limit, acceptor.accept(stream)).await,
                        None => Ok(acceptor.accept(stream).await),
                    };
                    match handshake {
                        Ok(Ok(tls_stream)) => {
                            let (reader, writer) = tokio::io::split(tls_stream);
                            serve(reader, writer, dispatcher, &hooks, close_signal, idle_timeout, peer).await;
                        }
                        Ok(Err(e)) => debug!(%peer, cause = %e, "tls handshake failed"),
                        Err(_elapsed) => debug!(%peer, "tls handshake timed out"),
                    }
                }
                None => {
                    let (reader, writer) = stream.into_split();
                    serve(reader, writer, dispatcher, &hooks, close_signal, idle_timeout, peer).await;
                }
            }
        });
        self.registry.attach(id, task.abort_handle());
    }
}

async fn serve<R, W>(
    reader: R,
    writer: W,
    dispatcher: Arc<Dispatcher>,
    hooks: &ConnectionHooks,
    close_signal: CancellationToken,
    idle_timeout: Option<Duration>,
    peer: SocketAddr,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut connection = HttpConnection::new(reader, writer).with_close_signal(close_signal);
    if let Some(idle_timeout) = idle_timeout {
        connection = connection.with_idle_timeout(idle_timeout);
    }
    match connection.process_observed(dispatcher, hooks).await {
        Ok(()) => debug!(%peer, "connection closed"),
        Err(e) => warn!(%peer, cause = %e, "connection closed with error"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConnectionId(u64);

struct ConnectionEntry {
    pending: usize,
    close: CancellationToken,
    abort: Option<AbortHandle>,
}

/// Live connections and the number of requests in flight on each.
#[derive(Default)]
struct Registry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    draining: AtomicBool,
    next_id: AtomicU64,
}

impl Registry {
    fn register(&self) -> (ConnectionId, CancellationToken) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let close = CancellationToken::new();
        self.connections.insert(id, ConnectionEntry { pending: 0, close: close.clone(), abort: None });
        (id, close)
    }

    fn attach(&self, id: ConnectionId, abort: AbortHandle) {
        if let Some(mut entry) = self.connections.get_mut(&id) {
            entry.abort = Some(abort);
        }
    }

    fn remove(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    fn close_idle(&self) {
        for entry in &self.connections {
            if entry.pending == 0 {
                entry.close.cancel();
            }
        }
    }

    fn abort_all(&self) {
        let handles: Vec<AbortHandle> = self
            .connections
            .iter()
            .filter_map(|entry| {
                entry.close.cancel();
                entry.abort.clone()
            })
            .collect();

        for handle in handles {
            handle.abort();
        }
    }
}

/// Per-connection view of the registry handed to the connection loop.
struct ConnectionHooks {
    registry: Arc<Registry>,
    id: ConnectionId,
}

impl ConnectionObserver for ConnectionHooks {
    fn request_started(&self) {
        if let Some(mut entry) = self.registry.connections.get_mut(&self.id) {
            entry.pending += 1;
        }
    }

    fn response_finished(&self) -> ConnectionAction {
        let pending = match self.registry.connections.get_mut(&self.id) {
            Some(mut entry) => {
                entry.pending = entry.pending.saturating_sub(1);
                entry.pending
            }
            None => 0,
        };

        if pending == 0 && self.registry.draining.load(Ordering::SeqCst) { ConnectionAction::Close } else { ConnectionAction::KeepAlive }
    }
}

impl Drop for ConnectionHooks {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

/// Adapts the root handler to the connection's [`Handler`] contract.
struct Dispatcher {
    root: Arc<dyn HttpHandler>,
    body_limit: usize,
}

impl Dispatcher {
    async fn dispatch(&self, request: Request<ReqBody>) -> Response<ResponseBody> {
        let mut ctx = RequestContext::new(request, self.body_limit);

        let outcome = AssertUnwindSafe(self.root.handle(&mut ctx, Next::terminal()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_panic| Err(HttpError::from_error("request handler panicked")));

        let mut response = match outcome.and_then(|()| ctx.send_response()) {
            Ok(response) => response,
            Err(e) => {
                error!(method = %ctx.method(), path = ctx.path(), cause = %e, "unhandled request error");
                fallback_response(&e)
            }
        };

        response.headers_mut().insert(DATE, DateService::global().http_date());
        response
    }
}

impl Handler for Dispatcher {
    type RespBody = ResponseBody;
    type Error = Infallible;
    type Fut<'fut> = BoxFuture<'fut, Result<Response<ResponseBody>, Infallible>>;

    fn call(&self, req: Request<ReqBody>) -> Self::Fut<'_> {
        self.dispatch(req).map(Ok).boxed()
    }
}

/// The response of last resort, used when an error escapes the root handler.
fn fallback_response(error: &HttpError) -> Response<ResponseBody> {
    let (status, name, message) = match error.status() {
        Some(status) => (status, error.name(), error.to_string()),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "ServerError", GENERIC_SERVER_MESSAGE.to_string()),
    };
    let body = Bytes::from(json!({ "name": name, "message": message }).to_string());

    let mut response = Response::new(ResponseBody::once(body.clone()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    response
}
