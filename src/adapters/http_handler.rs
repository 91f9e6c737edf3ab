use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use axum::body::Body;
use hyper::{Request, Response, body::Incoming};

use crate::{
    core::Dispatcher,
    utils::{ConnectionTracker, connection_tracker::ConnectionId},
};

/// hyper-facing entry point: records the request as in flight for as long
/// as the pipeline runs, then hands it to the dispatcher.
#[derive(Clone)]
pub struct HttpHandler {
    dispatcher: Arc<Dispatcher>,
    connection_tracker: ConnectionTracker,
}

impl HttpHandler {
    pub fn new(dispatcher: Arc<Dispatcher>, connection_tracker: ConnectionTracker) -> Self {
        Self {
            dispatcher,
            connection_tracker,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Main request handler.
    pub async fn handle_request(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
        connection_id: Option<ConnectionId>,
    ) -> Response<Body> {
        let _in_flight = self.connection_tracker.begin_request(
            connection_id,
            req.method().as_str(),
            req.uri().path(),
        );
        self.dispatcher.handle(req, client_addr).await
    }

    /// Adapter for `hyper::service::service_fn`.
    pub async fn serve(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        connection_id: ConnectionId,
    ) -> Result<Response<Body>, Infallible> {
        Ok(self
            .handle_request(req.map(Body::new), Some(client_addr), Some(connection_id))
            .await)
    }
}

impl std::fmt::Debug for HttpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpHandler")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
