//! Open-socket and in-flight-request registries.
//!
//! Every accepted socket is registered with a close token (ask the connection
//! to finish gracefully) and an abort handle (destroy it). Every request is
//! registered for as long as the pipeline runs. Both registries are removed
//! from by RAII guards, so a connection task that ends for any reason,
//! including being aborted, leaves no stale record behind.
use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::{
    sync::Notify,
    task::AbortHandle,
    time::{Instant as TokioInstant, timeout_at},
};
use tokio_util::sync::CancellationToken;

use crate::metrics;

/// Unique identifier for a connection
pub type ConnectionId = u64;

/// Unique identifier for an in-flight request
pub type RequestId = u64;

/// Information about an open socket.
#[derive(Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub established_at: Instant,
    close: CancellationToken,
    abort: Mutex<Option<AbortHandle>>,
}

impl ConnectionInfo {
    fn new(id: ConnectionId, remote_addr: SocketAddr) -> Self {
        Self {
            id,
            remote_addr,
            established_at: Instant::now(),
            close: CancellationToken::new(),
            abort: Mutex::new(None),
        }
    }

    /// Token the connection task watches to start a graceful close.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    /// Attach the handle of the task serving this socket.
    pub fn attach_abort_handle(&self, handle: AbortHandle) {
        if let Ok(mut slot) = self.abort.lock() {
            *slot = Some(handle);
        }
    }

    /// Ask the connection to close once its current exchange completes.
    pub fn request_close(&self) {
        self.close.cancel();
    }

    /// Destroy the serving task. Returns false if no task was attached.
    pub fn force_close(&self) -> bool {
        match self.abort.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(handle) => {
                    handle.abort();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }
}

#[derive(Debug, Clone)]
pub struct InFlightRequest {
    pub connection_id: Option<ConnectionId>,
    pub method: String,
    pub path: String,
    pub started_at: Instant,
}

#[derive(Debug, Default)]
struct Registries {
    connections: DashMap<ConnectionId, Arc<ConnectionInfo>>,
    requests: DashMap<RequestId, InFlightRequest>,
    next_connection_id: AtomicU64,
    next_request_id: AtomicU64,
    requests_changed: Notify,
    connections_changed: Notify,
}

/// Tracks open sockets and in-flight requests for the shutdown sequence.
#[derive(Clone, Debug, Default)]
pub struct ConnectionTracker {
    inner: Arc<Registries>,
}

/// Removes its connection from the tracker when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    info: Arc<ConnectionInfo>,
}

impl ConnectionGuard {
    pub fn info(&self) -> &Arc<ConnectionInfo> {
        &self.info
    }

    pub fn id(&self) -> ConnectionId {
        self.info.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.unregister_connection(self.info.id);
    }
}

/// Removes its request from the in-flight registry when dropped.
#[derive(Debug)]
pub struct RequestGuard {
    tracker: ConnectionTracker,
    id: RequestId,
}

impl RequestGuard {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tracker.finish_request(self.id);
    }
}

impl ConnectionTracker {
    /// Create a new empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly accepted socket.
    pub fn register_connection(&self, remote_addr: SocketAddr) -> ConnectionGuard {
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let info = Arc::new(ConnectionInfo::new(id, remote_addr));
        self.inner.connections.insert(id, info.clone());

        let open = self.inner.connections.len();
        metrics::set_open_sockets(open);
        tracing::debug!(
            "Connection registered: id={}, remote_addr={}, open_sockets={}",
            id,
            remote_addr,
            open
        );

        ConnectionGuard {
            tracker: self.clone(),
            info,
        }
    }

    fn unregister_connection(&self, id: ConnectionId) {
        if let Some((_, info)) = self.inner.connections.remove(&id) {
            let open = self.inner.connections.len();
            metrics::set_open_sockets(open);
            tracing::debug!(
                "Connection unregistered: id={}, age={:?}, open_sockets={}",
                id,
                info.age(),
                open
            );
        }
        self.inner.connections_changed.notify_waiters();
    }

    /// Record a request entering the pipeline.
    pub fn begin_request(
        &self,
        connection_id: Option<ConnectionId>,
        method: &str,
        path: &str,
    ) -> RequestGuard {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.requests.insert(
            id,
            InFlightRequest {
                connection_id,
                method: method.to_string(),
                path: path.to_string(),
                started_at: Instant::now(),
            },
        );
        metrics::set_in_flight_requests(self.inner.requests.len());
        RequestGuard {
            tracker: self.clone(),
            id,
        }
    }

    fn finish_request(&self, id: RequestId) {
        self.inner.requests.remove(&id);
        metrics::set_in_flight_requests(self.inner.requests.len());
        self.inner.requests_changed.notify_waiters();
    }

    pub fn open_socket_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.requests.len()
    }

    /// Snapshot of the in-flight registry.
    pub fn in_flight_requests(&self) -> Vec<InFlightRequest> {
        self.inner
            .requests
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connections(&self) -> Vec<Arc<ConnectionInfo>> {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Wait until no request is in flight or `grace` elapses.
    /// Returns whether the registry drained.
    pub async fn wait_for_requests(&self, grace: Duration) -> bool {
        let deadline = TokioInstant::now() + grace;
        loop {
            let notified = self.inner.requests_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let remaining = self.in_flight_count();
            if remaining == 0 {
                tracing::info!("All in-flight requests drained");
                return true;
            }
            tracing::debug!("Waiting for {} in-flight requests", remaining);

            if timeout_at(deadline, notified).await.is_err() {
                tracing::warn!(
                    "Request grace period of {:?} elapsed with {} requests still in flight",
                    grace,
                    self.in_flight_count()
                );
                return self.in_flight_count() == 0;
            }
        }
    }

    /// Ask every open socket to close, wait up to `close_timeout`, then destroy
    /// the ones still open. Returns `(closed_gracefully, forced)`.
    pub async fn close_sockets(&self, close_timeout: Duration) -> (usize, usize) {
        let initial = self.open_socket_count();
        if initial == 0 {
            return (0, 0);
        }
        tracing::info!("Closing {} open sockets", initial);

        for info in self.connections() {
            info.request_close();
        }

        let deadline = TokioInstant::now() + close_timeout;
        loop {
            let notified = self.inner.connections_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.open_socket_count() == 0 {
                return (initial, 0);
            }
            if timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let stragglers = self.connections();
        let mut forced = 0;
        for info in &stragglers {
            tracing::warn!(
                "Socket {} ({}) did not close within {:?}, destroying it",
                info.id,
                info.remote_addr,
                close_timeout
            );
            if info.force_close() {
                forced += 1;
            }
            // aborted tasks drop their guard asynchronously; the record goes now
            self.unregister_connection(info.id);
        }
        (initial.saturating_sub(stragglers.len()), forced)
    }

    /// Aggregate snapshot statistics.
    pub fn get_stats(&self) -> ConnectionStats {
        let oldest_connection_age = self
            .connections()
            .iter()
            .map(|info| info.age())
            .max()
            .unwrap_or_default();
        let oldest_request_age = self
            .inner
            .requests
            .iter()
            .map(|entry| entry.value().started_at.elapsed())
            .max()
            .unwrap_or_default();

        ConnectionStats {
            open_sockets: self.open_socket_count(),
            in_flight_requests: self.in_flight_count(),
            oldest_connection_age,
            oldest_request_age,
        }
    }
}

/// Statistics about current connections
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub open_sockets: usize,
    pub in_flight_requests: usize,
    pub oldest_connection_age: Duration,
    pub oldest_request_age: Duration,
}
