//! TCP/TLS server lifecycle: `starting -> listening -> shutting-down -> stopped`.
//!
//! Every accepted socket is served by hyper in its own task and registered
//! with the [`ConnectionTracker`]. Shutdown stops the accept loop, waits for the
//! in-flight requests to drain (bounded by the grace period), asks each open
//! socket to close (bounded by the close timeout, then destroys stragglers)
//! and finally tears down the data providers.
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use eyre::{Result, WrapErr, eyre};
use hyper::service::service_fn;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    adapters::{
        http_handler::HttpHandler,
        middleware::{RequestLogger, ShutdownGuard, TrailingSlash},
        route_discovery::{HandlerRegistry, populate_router},
        tls::load_tls_acceptor,
    },
    config::models::ServerConfig,
    core::{
        Dispatcher,
        middleware::{Handler, Middleware},
        route::Router,
    },
    metrics,
    ports::{AuthStrategy, DataProvider, HttpServer},
    tracing_setup,
    utils::{
        ConnectionGuard, ConnectionTracker, GracefulShutdown, Lifecycle, ServerState, ShutdownReason,
        connection_tracker::ConnectionId,
    },
};

/// Outcome of [`Server::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every in-flight request finished within the grace period.
    pub drained: bool,
    /// Requests still in flight when the grace period ended.
    pub residual_requests: usize,
    pub sockets_closed: usize,
    pub sockets_forced: usize,
    /// `"<provider>: <error>"` for each provider whose teardown failed.
    pub provider_errors: Vec<String>,
    /// Another caller performed the shutdown; this one only waited for it.
    pub already_stopping: bool,
}

impl ShutdownReport {
    fn already_stopping() -> Self {
        Self {
            already_stopping: true,
            ..Self::default()
        }
    }
}

/// Assembles a [`Server`] from configuration, routers, interceptors, auth
/// strategies and data providers.
pub struct ServerBuilder {
    config: ServerConfig,
    routers: Vec<Router>,
    middleware: Vec<Arc<dyn Middleware>>,
    strategies: Vec<(String, Arc<dyn AuthStrategy>)>,
    providers: Vec<Arc<dyn DataProvider>>,
    handlers: HandlerRegistry,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            routers: Vec::new(),
            middleware: Vec::new(),
            strategies: Vec::new(),
            providers: Vec::new(),
            handlers: HandlerRegistry::new(),
        }
    }

    /// Register a router. Routers added here come before those declared in
    /// the configuration.
    pub fn router(mut self, router: Router) -> Self {
        self.routers.push(router);
        self
    }

    /// Application interceptor, run after the built-in ones.
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn strategy(mut self, name: impl Into<String>, strategy: impl AuthStrategy) -> Self {
        self.strategies.push((name.into(), Arc::new(strategy)));
        self
    }

    pub fn provider(mut self, provider: impl DataProvider) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    pub fn provider_arc(mut self, provider: Arc<dyn DataProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Handlers that route manifests refer to by name.
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn handler(mut self, name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.handlers.register(name, handler);
        self
    }

    /// Discover manifest routes, build the dispatcher and finalize the route
    /// table.
    pub fn build(self) -> Result<Server> {
        metrics::init_metrics()?;

        let grace_period = self
            .config
            .shutdown
            .request_grace_period()
            .wrap_err("Invalid shutdown.request_grace_period")?;
        let close_timeout = self
            .config
            .shutdown
            .socket_close_timeout()
            .wrap_err("Invalid shutdown.socket_close_timeout")?;

        let mut routers = self.routers;
        routers.extend(self.config.routers.iter().map(Router::from_config));
        for router in &mut routers {
            populate_router(router, &self.handlers)
                .wrap_err_with(|| format!("Failed to discover routes for router '{}'", router.name()))?;
        }

        let lifecycle = Arc::new(Lifecycle::new());
        let mut builder = Dispatcher::builder()
            .limits(self.config.payload)
            .middleware(RequestLogger)
            .middleware(ShutdownGuard::new(lifecycle.clone()))
            .middleware(TrailingSlash::new(self.config.trailing_slash));
        for middleware in self.middleware {
            builder = builder.middleware_arc(middleware);
        }
        for (name, strategy) in self.strategies {
            builder = builder.strategy_arc(name, strategy);
        }
        let dispatcher = builder
            .routers(routers)
            .build()
            .wrap_err("Failed to build route table")?;

        Ok(Server {
            config: self.config,
            dispatcher: Arc::new(dispatcher),
            lifecycle,
            tracker: ConnectionTracker::new(),
            providers: self.providers,
            signals: GracefulShutdown::new(),
            grace_period,
            close_timeout,
            running: Mutex::new(None),
        })
    }
}

struct Running {
    local_addr: SocketAddr,
    accept_cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    providers: Vec<Arc<dyn DataProvider>>,
}

pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    lifecycle: Arc<Lifecycle>,
    tracker: ConnectionTracker,
    providers: Vec<Arc<dyn DataProvider>>,
    signals: GracefulShutdown,
    grace_period: Duration,
    close_timeout: Duration,
    running: Mutex<Option<Running>>,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.state()
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn connection_tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .ok()
            .and_then(|running| running.as_ref().map(|r| r.local_addr))
    }

    /// Bind, create data providers and start accepting connections.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.lifecycle.state() != ServerState::Starting || self.lifecycle.is_shutting_down() {
            return Err(eyre!("Server cannot start from state {}", self.lifecycle.state()));
        }

        let tls = self.config.tls.as_ref().map(load_tls_acceptor).transpose()?;
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .wrap_err_with(|| format!("Failed to bind to address {}", self.config.listen_addr))?;
        let local_addr = listener
            .local_addr()
            .wrap_err("Failed to get local addr")?;

        let providers = self.create_providers().await?;

        let accept_cancel = CancellationToken::new();
        let handler = HttpHandler::new(self.dispatcher.clone(), self.tracker.clone());
        let accept_task = tokio::spawn(accept_loop(
            listener,
            tls,
            handler,
            self.tracker.clone(),
            accept_cancel.clone(),
        ));

        let stored = match self.running.lock() {
            Ok(mut running) if running.is_none() && !self.lifecycle.is_shutting_down() => {
                *running = Some(Running {
                    local_addr,
                    accept_cancel: accept_cancel.clone(),
                    accept_task,
                    providers,
                });
                None
            }
            _ => Some((accept_task, providers)),
        };
        if let Some((accept_task, providers)) = stored {
            accept_cancel.cancel();
            let _ = accept_task.await;
            destroy_providers(&providers).await;
            return Err(eyre!("Server was started twice or stopped while starting"));
        }

        self.lifecycle.mark_listening();
        tracing::info!(
            "Keel server listening on {} ({})",
            local_addr,
            if self.config.tls.is_some() { "https" } else { "http" }
        );
        Ok(local_addr)
    }

    async fn create_providers(&self) -> Result<Vec<Arc<dyn DataProvider>>> {
        let mut created: Vec<Arc<dyn DataProvider>> = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            tracing::info!("Creating data provider '{}'", provider.name());
            if let Err(e) = provider.create().await {
                tracing::error!("Data provider '{}' failed to start: {:#}", provider.name(), e);
                destroy_providers(&created).await;
                return Err(e.wrap_err(format!(
                    "Failed to create data provider '{}'",
                    provider.name()
                )));
            }
            created.push(provider.clone());
        }
        Ok(created)
    }

    /// Run the shutdown sequence. Concurrent and repeated calls perform a
    /// single teardown; the others wait for it and get an `already_stopping`
    /// report.
    pub async fn shutdown(&self) -> ShutdownReport {
        if !self.lifecycle.begin_shutdown() {
            tracing::info!("Shutdown already in progress, waiting for it to complete");
            self.lifecycle.wait_stopped().await;
            return ShutdownReport::already_stopping();
        }

        let started = Instant::now();
        tracing::info!("Shutting down server");

        let running = self.running.lock().ok().and_then(|mut running| running.take());
        let Some(running) = running else {
            tracing::info!("Server was never started");
            self.lifecycle.mark_stopped();
            return ShutdownReport {
                drained: true,
                ..ShutdownReport::default()
            };
        };

        running.accept_cancel.cancel();
        if let Err(e) = running.accept_task.await {
            tracing::warn!("Accept loop ended abnormally: {}", e);
        }

        let drained = self.tracker.wait_for_requests(self.grace_period).await;
        let residual_requests = self.tracker.in_flight_count();
        if !drained {
            tracing::warn!(
                "Proceeding with {} requests still in flight",
                residual_requests
            );
        }

        let (sockets_closed, sockets_forced) = self.tracker.close_sockets(self.close_timeout).await;
        let provider_errors = destroy_providers(&running.providers).await;

        self.lifecycle.mark_stopped();
        tracing::info!(
            "Shutdown complete in {:?}: drained={}, sockets_closed={}, sockets_forced={}, provider_errors={}",
            started.elapsed(),
            drained,
            sockets_closed,
            sockets_forced,
            provider_errors.len()
        );

        ShutdownReport {
            drained,
            residual_requests,
            sockets_closed,
            sockets_forced,
            provider_errors,
            already_stopping: false,
        }
    }

    /// Ask [`Server::run_until_signal`] to shut down as if a signal arrived.
    pub fn trigger_shutdown(&self) {
        self.signals.trigger_shutdown(ShutdownReason::Manual);
    }

    /// Start (if needed), serve until SIGINT/SIGTERM or
    /// [`Server::trigger_shutdown`], then shut down.
    pub async fn run_until_signal(&self) -> Result<ShutdownReport> {
        if self.lifecycle.state() == ServerState::Starting {
            self.start().await?;
        }

        tokio::select! {
            result = self.signals.run_signal_handler() => {
                result?;
            }
            reason = self.signals.wait_for_shutdown_signal() => {
                tracing::info!("Shutdown requested: {:?}", reason);
            }
        }

        Ok(self.shutdown().await)
    }
}

impl HttpServer for Server {
    fn run(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        async move {
            let report = self.run_until_signal().await?;
            if !report.provider_errors.is_empty() {
                return Err(eyre!(
                    "Data provider teardown failed: {}",
                    report.provider_errors.join("; ")
                ));
            }
            Ok(())
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listen_addr", &self.config.listen_addr)
            .field("state", &self.lifecycle.state())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

/// Destroy providers in reverse creation order, collecting failures.
async fn destroy_providers(providers: &[Arc<dyn DataProvider>]) -> Vec<String> {
    let mut errors = Vec::new();
    for provider in providers.iter().rev() {
        tracing::info!("Destroying data provider '{}'", provider.name());
        if let Err(e) = provider.destroy().await {
            tracing::error!("Data provider '{}' failed to stop: {:#}", provider.name(), e);
            errors.push(format!("{}: {:#}", provider.name(), e));
        }
    }
    errors
}

/// Delay before retrying after `failures` consecutive accept errors, such
/// as descriptor exhaustion. Doubles from 5ms up to one second.
fn accept_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(8);
    Duration::from_millis(5 << exponent).min(ACCEPT_BACKOFF_MAX)
}

const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    handler: HttpHandler,
    tracker: ConnectionTracker,
    cancel: CancellationToken,
) {
    let mut accept_failures: u32 = 0;
    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Listener stopped accepting connections");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => {
                    accept_failures = 0;
                    pair
                }
                Err(e) => {
                    accept_failures = accept_failures.saturating_add(1);
                    let delay = accept_backoff(accept_failures);
                    tracing::warn!("Accept error: {} (retrying in {:?})", e, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::info!("Listener stopped accepting connections");
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            },
        };

        let guard = tracker.register_connection(remote_addr);
        let info = guard.info().clone();
        let span = tracing_setup::create_connection_span(&remote_addr.to_string(), guard.id());
        let task = tokio::spawn(
            serve_socket(stream, remote_addr, tls.clone(), handler.clone(), guard).instrument(span),
        );
        info.attach_abort_handle(task.abort_handle());
    }
}

async fn serve_socket(
    stream: TcpStream,
    remote_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    handler: HttpHandler,
    guard: ConnectionGuard,
) {
    let close = guard.info().close_token();
    let connection_id = guard.id();

    match tls {
        Some(acceptor) => {
            let stream = tokio::select! {
                _ = close.cancelled() => return,
                accepted = acceptor.accept(stream) => match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::debug!("TLS handshake with {} failed: {}", remote_addr, e);
                        return;
                    }
                },
            };
            serve_io(stream, remote_addr, connection_id, handler, close).await;
        }
        None => serve_io(stream, remote_addr, connection_id, handler, close).await,
    }

    drop(guard);
}

async fn serve_io<I>(
    io: I,
    remote_addr: SocketAddr,
    connection_id: ConnectionId,
    handler: HttpHandler,
    close: CancellationToken,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let handler = handler.clone();
        async move { handler.serve(req, remote_addr, connection_id).await }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = close.cancelled() => {
            tracing::debug!("Closing connection from {}", remote_addr);
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };
    if let Err(e) = result {
        tracing::debug!("Connection from {} ended with error: {}", remote_addr, e);
    }
}
