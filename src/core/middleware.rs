//! Continuation-passing middleware.
//!
//! A [`MiddlewareChain`] is an ordered list of [`Middleware`]. Executing it
//! hands the first interceptor a [`Next`] that, when run, calls the next
//! interceptor or, once the list is exhausted, the endpoint [`Handler`].
//! Not running `next` short-circuits everything after it. Chains nest by
//! making one chain's endpoint execute the next chain.
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::core::{error::HandlerResult, request::Request, response::Response};

/// Terminal step of a chain.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, req: &mut Request, res: &mut Response) -> HandlerResult;
}

/// An interceptor. Errors are not caught by the chain; they propagate to the
/// caller of [`MiddlewareChain::execute`].
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, req: &mut Request, res: &mut Response, next: Next<'_>) -> HandlerResult;
}

/// The rest of the chain from the current interceptor's point of view.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middleware: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub fn new(middleware: &'a [Arc<dyn Middleware>], endpoint: &'a dyn Handler) -> Self {
        Self {
            middleware,
            endpoint,
        }
    }

    /// Interceptors still waiting to run, not counting the endpoint.
    pub fn remaining(&self) -> usize {
        self.middleware.len()
    }

    pub async fn run(self, req: &mut Request, res: &mut Response) -> HandlerResult {
        match self.middleware.split_first() {
            Some((current, rest)) => {
                current
                    .handle(req, res, Next::new(rest, self.endpoint))
                    .await
            }
            None => self.endpoint.call(req, res).await,
        }
    }
}

#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, middleware: impl Middleware) -> &mut Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    pub fn push_arc(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.layers.push(middleware);
        self
    }

    pub fn extend(&mut self, other: &MiddlewareChain) {
        self.layers.extend(other.layers.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Run the chain in registration order with `endpoint` as the last step.
    pub async fn execute(
        &self,
        req: &mut Request,
        res: &mut Response,
        endpoint: &dyn Handler,
    ) -> HandlerResult {
        Next::new(&self.layers, endpoint).run(req, res).await
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("len", &self.layers.len())
            .finish()
    }
}

/// Handler built from a synchronous closure.
pub struct FnHandler<F>(F);

/// Wrap a synchronous closure as a handler.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut Request, &mut Response) -> HandlerResult + Send + Sync + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut Request, &mut Response) -> HandlerResult + Send + Sync + 'static,
{
    async fn call(&self, req: &mut Request, res: &mut Response) -> HandlerResult {
        (self.0)(req, res)
    }
}

/// Handler built from a closure returning a boxed future.
pub struct AsyncFnHandler<F>(F);

/// Wrap an async closure as a handler:
/// `async_handler_fn(|req, res| Box::pin(async move { ... }))`.
pub fn async_handler_fn<F>(f: F) -> AsyncFnHandler<F>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync
        + 'static,
{
    AsyncFnHandler(f)
}

#[async_trait]
impl<F> Handler for AsyncFnHandler<F>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync
        + 'static,
{
    async fn call(&self, req: &mut Request, res: &mut Response) -> HandlerResult {
        (self.0)(req, res).await
    }
}

/// Middleware built from a closure returning a boxed future.
pub struct FnMiddleware<F>(F);

/// Wrap an async closure as middleware:
/// `middleware_fn(|req, res, next| Box::pin(async move { next.run(req, res).await }))`.
pub fn middleware_fn<F>(f: F) -> FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response, Next<'a>) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync
        + 'static,
{
    FnMiddleware(f)
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response, Next<'a>) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync
        + 'static,
{
    async fn handle(&self, req: &mut Request, res: &mut Response, next: Next<'_>) -> HandlerResult {
        (self.0)(req, res, next).await
    }
}
