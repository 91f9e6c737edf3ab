//! Keel - an embeddable HTTP server core.
//!
//! Keel implements a **hexagonal architecture** around a single request
//! pipeline. Application code registers routers of pattern-addressed routes;
//! Keel matches each request, runs the interceptor chain, decodes the body and
//! hands a typed [`core::Request`] / [`core::Response`] pair to the handler.
//!
//! # Features
//! - Path patterns with named parameters, inline regex constraints and greedy captures
//! - One route table across routers, with catch-all entries evaluated last
//! - 404 fallbacks per router, 405 with `Allow` for known paths
//! - Middleware nested as global -> router -> route around every handler
//! - JSON, url-encoded and multipart bodies with per-route size and count limits
//! - JSON Schema validation of params, query and body
//! - Named authentication strategies with optional scope checks
//! - Routes discovered from JSON / TOML / YAML manifest directories
//! - HTTP/1.1 + HTTP/2 with optional TLS
//! - Graceful shutdown: drain in-flight requests, then close sockets, then tear down providers
//! - Structured tracing via `tracing` and request metrics via `metrics`
//!
//! # Quick Example
//! ```no_run
//! use http::StatusCode;
//! use keel::{
//!     Server,
//!     config::ServerConfig,
//!     core::{Route, Router, handler_fn},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = ServerConfig::builder().listen_addr("127.0.0.1:8080").build().map_err(eyre::Report::msg)?;
//! let api = Router::new("api", "/api").route(Route::get(
//!     "/users/{id}",
//!     handler_fn(|req, res| {
//!         let id = req.param("id").unwrap_or_default().to_string();
//!         res.text(StatusCode::OK, id)?;
//!         Ok(())
//!     }),
//! ));
//! let server = Server::builder(config).router(api).build()?;
//! server.run_until_signal().await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits an application implements: auth
//! strategies, data providers, view providers) from **adapters** (the hyper
//! server, built-in interceptors, manifest discovery) while keeping routing
//! and the request pipeline inside `core`.
//!
//! # Error Handling
//! Startup and configuration APIs return `eyre::Result<T>` with context
//! attached via `WrapErr`. Route registration reports [`core::RouteError`];
//! request handling reports [`core::HttpError`], which is rendered as a JSON
//! error envelope.
//!
//! # Concurrency & Data Structures
//! Open sockets and in-flight requests are tracked in `dashmap::DashMap` so
//! drop guards can deregister synchronously from any task.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{HandlerRegistry, HttpHandler, Server, ServerBuilder, ShutdownReport},
    core::{Dispatcher, HttpError, Request, Response, Route, Router},
    ports::{AuthResult, AuthStrategy, DataProvider, ViewProvider},
    utils::{ConnectionTracker, GracefulShutdown},
};
