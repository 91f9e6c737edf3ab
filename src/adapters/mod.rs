pub mod http_handler;
pub mod http_server;
pub mod middleware;
pub mod route_discovery;
pub mod tls;

/// Re-export commonly used types from adapters
pub use http_handler::HttpHandler;
pub use http_server::{Server, ServerBuilder, ShutdownReport};
pub use middleware::*;
pub use route_discovery::{HandlerRegistry, discover_routes, populate_router};
pub use tls::load_tls_acceptor;
