pub mod connection_tracker;
pub mod graceful_shutdown;
pub mod lifecycle;

pub use connection_tracker::{
    ConnectionGuard, ConnectionInfo, ConnectionStats, ConnectionTracker, RequestGuard,
};
pub use graceful_shutdown::{GracefulShutdown, ShutdownReason};
pub use lifecycle::{Lifecycle, ServerState};
