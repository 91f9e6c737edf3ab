//! The per-request pipeline.
//!
//! [`Dispatcher::handle`] runs the global middleware chain with the route
//! stage as its endpoint. The route stage matches the request, pins the route,
//! stages cache and security headers, authenticates, binds parameters, parses
//! the body, validates, and finally runs the router chain wrapping the route
//! chain wrapping the handler. Each stage that fails finalizes the response
//! itself; only handler and middleware errors (and panics) reach the single
//! boundary in `handle`, where they become error responses.
use std::{any::Any, collections::HashMap, net::SocketAddr, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use axum::body::Body;
use futures_util::FutureExt;

use crate::{
    config::models::PayloadLimits,
    core::{
        body::{BodyParser, carries_body},
        error::{HandlerResult, HttpError, RouteError},
        middleware::{Handler, Middleware, MiddlewareChain},
        options::{AuthOptions, RouteOptions},
        path_matcher::{PathPattern, join_paths},
        request::{MatchedRoute, Request},
        response::Response,
        route::{MethodSet, Router},
        route_table::{ResolvedRoute, RouteLookup, RouteTable},
        validation::CompiledValidation,
    },
    ports::{AuthResult, AuthStrategy},
};

/// Pattern appended to a router's base path for its not-found fallback.
const FALLBACK_SUFFIX: &str = "{path:.*}";

pub struct Dispatcher {
    global: MiddlewareChain,
    table: RouteTable,
    strategies: HashMap<String, Arc<dyn AuthStrategy>>,
    limits: PayloadLimits,
}

#[derive(Default)]
pub struct DispatcherBuilder {
    routers: Vec<Router>,
    middleware: MiddlewareChain,
    strategies: HashMap<String, Arc<dyn AuthStrategy>>,
    limits: PayloadLimits,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn router(mut self, router: Router) -> Self {
        self.routers.push(router);
        self
    }

    pub fn routers(mut self, routers: impl IntoIterator<Item = Router>) -> Self {
        self.routers.extend(routers);
        self
    }

    /// Append a global interceptor. Global interceptors run in the order
    /// they were added, before any router or route interceptor.
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn middleware_arc(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push_arc(middleware);
        self
    }

    pub fn strategy(self, name: impl Into<String>, strategy: impl AuthStrategy) -> Self {
        self.strategy_arc(name, Arc::new(strategy))
    }

    pub fn strategy_arc(mut self, name: impl Into<String>, strategy: Arc<dyn AuthStrategy>) -> Self {
        self.strategies.insert(name.into(), strategy);
        self
    }

    /// Server-wide payload budgets used where a route sets none.
    pub fn limits(mut self, limits: PayloadLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Resolve every router into the route table, add the per-router
    /// not-found fallbacks and finalize the table.
    ///
    /// A router's fallback is registered right after the routes of the last
    /// router mounted at or below its base path, so later unrelated routers
    /// cannot capture its sub-paths and nested routers are not shadowed.
    pub fn build(self) -> Result<Dispatcher, RouteError> {
        let mounts: Vec<String> = self
            .routers
            .iter()
            .map(|router| join_paths(router.base_path(), ""))
            .collect();
        let mut scheduled: Vec<Vec<(String, String)>> = vec![Vec::new(); mounts.len()];
        for (idx, router) in self.routers.iter().enumerate() {
            if !router.has_not_found_fallback() {
                continue;
            }
            let slot = (idx..mounts.len())
                .rev()
                .find(|&later| is_mounted_under(&mounts[later], &mounts[idx]))
                .unwrap_or(idx);
            scheduled[slot].push((router.name().to_string(), mounts[idx].clone()));
        }

        let mut table = RouteTable::new();
        for (router, mut fallbacks) in self.routers.into_iter().zip(scheduled) {
            let router = router.into_parts();
            tracing::debug!(
                "Resolving router '{}' mounted at '{}' with {} routes",
                router.name,
                router.base_path,
                router.routes.len()
            );
            for route in router.routes {
                let resolved = ResolvedRoute::resolve(
                    &router.name,
                    &router.base_path,
                    &router.defaults,
                    &router.middleware,
                    route.into_parts(),
                )?;
                check_strategies(&resolved, &self.strategies)?;
                table.register(resolved)?;
            }

            // deeper mount points first
            fallbacks.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
            for (name, mount) in fallbacks {
                let pattern = join_paths(&mount, FALLBACK_SUFFIX);
                let matcher = PathPattern::compile(&pattern, false)?;
                if table.has_equivalent(&matcher) {
                    tracing::debug!("Router '{}' already covers {}, no fallback added", name, pattern);
                    continue;
                }
                table.register(not_found_route(name, pattern))?;
            }
        }

        table.finalize();
        tracing::info!("Route table finalized with {} entries", table.len());

        Ok(Dispatcher {
            global: self.middleware,
            table,
            strategies: self.strategies,
            limits: self.limits,
        })
    }
}

fn is_mounted_under(child: &str, parent: &str) -> bool {
    parent == "/"
        || child == parent
        || child
            .strip_prefix(parent)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn check_strategies(
    route: &ResolvedRoute,
    strategies: &HashMap<String, Arc<dyn AuthStrategy>>,
) -> Result<(), RouteError> {
    let Some(auth) = &route.options.auth else {
        return Ok(());
    };
    match auth
        .strategy_names()
        .iter()
        .find(|name| !strategies.contains_key(name.as_str()))
    {
        Some(missing) => Err(RouteError::UnknownStrategy {
            path: route.pattern.clone(),
            strategy: missing.clone(),
        }),
        None => Ok(()),
    }
}

fn not_found_route(router: String, pattern: String) -> ResolvedRoute {
    ResolvedRoute {
        pattern,
        router,
        methods: MethodSet::Any,
        case_sensitive: false,
        options: RouteOptions::default(),
        validation: CompiledValidation::default(),
        router_middleware: MiddlewareChain::new(),
        middleware: MiddlewareChain::new(),
        handler: Arc::new(NotFoundHandler),
    }
}

struct NotFoundHandler;

#[async_trait]
impl Handler for NotFoundHandler {
    async fn call(&self, _req: &mut Request, res: &mut Response) -> HandlerResult {
        res.not_found();
        Ok(())
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub fn route_table(&self) -> &RouteTable {
        &self.table
    }

    pub fn limits(&self) -> &PayloadLimits {
        &self.limits
    }

    /// Run one request through the whole pipeline. Never fails: every error,
    /// including a panic, is turned into a response.
    pub async fn handle(
        &self,
        req: http::Request<Body>,
        remote_addr: Option<SocketAddr>,
    ) -> http::Response<Body> {
        let mut req = Request::from_http(req, remote_addr);
        let mut res = Response::new();

        let stage = RouteStage { dispatcher: self };
        let outcome = AssertUnwindSafe(self.global.execute(&mut req, &mut res, &stage))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => report(&req, &mut res, err),
            Err(panic) => {
                let err = HttpError::internal(eyre::eyre!(
                    "Handler panicked: {}",
                    panic_message(panic.as_ref())
                ));
                report(&req, &mut res, err);
            }
        }

        res.into_http()
    }

    /// Try each named strategy in order until one authenticates.
    async fn authenticate(&self, req: &mut Request, options: &AuthOptions) -> Result<(), HttpError> {
        let names = options.strategy_names();
        if names.is_empty() {
            return Ok(());
        }

        let mut outcome = AuthResult::unauthenticated();
        for name in names {
            let Some(strategy) = self.strategies.get(name) else {
                continue;
            };
            match strategy.authenticate(req).await {
                Ok(mut result) if result.authenticated => {
                    if result.strategy.is_none() {
                        result.strategy = Some(name.clone());
                    }
                    tracing::debug!("Request {} authenticated by '{}'", req.id(), name);
                    outcome = result;
                    break;
                }
                Ok(_) => tracing::debug!("Strategy '{}' did not authenticate request", name),
                Err(e) => tracing::warn!("Strategy '{}' failed: {:#}", name, e),
            }
        }

        let authenticated = outcome.authenticated;
        req.set_auth(outcome);

        if !authenticated {
            return if options.is_optional() {
                Ok(())
            } else {
                Err(HttpError::Unauthorized)
            };
        }

        match &options.scope {
            Some(scope) if !req.auth().has_scope(scope) => Err(HttpError::Forbidden {
                scope: scope.clone(),
            }),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut strategies: Vec<&String> = self.strategies.keys().collect();
        strategies.sort();
        f.debug_struct("Dispatcher")
            .field("global", &self.global)
            .field("routes", &self.table.len())
            .field("strategies", &strategies)
            .finish()
    }
}

/// Endpoint of the global chain.
struct RouteStage<'a> {
    dispatcher: &'a Dispatcher,
}

#[async_trait]
impl Handler for RouteStage<'_> {
    async fn call(&self, req: &mut Request, res: &mut Response) -> HandlerResult {
        let dispatcher = self.dispatcher;
        let method = req.method().clone();

        let (route, params) = match dispatcher.table.lookup(&method, req.path()) {
            RouteLookup::Found { route, params } => (route.clone(), params),
            RouteLookup::MethodNotAllowed { allow } => {
                return fail(res, HttpError::MethodNotAllowed { method, allow });
            }
            RouteLookup::NotFound => return fail(res, HttpError::NotFound),
        };

        req.set_route(MatchedRoute {
            pattern: route.pattern.clone(),
            router: route.router.clone(),
        });

        if let Some(cache) = &route.options.cache {
            res.stage_cache_control(cache);
        }
        if let Some(security) = &route.options.security {
            for (name, value) in security.headers() {
                res.insert_header(name, value)?;
            }
        }

        if let Some(auth) = &route.options.auth {
            if let Err(err) = dispatcher.authenticate(req, auth).await {
                return fail(res, err);
            }
        }

        req.set_params(params);

        if carries_body(&method) {
            let parser = BodyParser::new(route.options.payload.as_ref(), &dispatcher.limits);
            match parser.parse(req).await {
                Ok(payload) => req.set_payload(payload),
                Err(err) => return fail(res, err),
            }
        }

        if !route.validation.is_empty() {
            if let Err(err) = route.validation.validate(req) {
                return fail(res, err);
            }
        }

        let endpoint = RouteEndpoint { route: &route };
        route.router_middleware.execute(req, res, &endpoint).await
    }
}

/// Endpoint of the router chain: the route chain wrapping the handler.
struct RouteEndpoint<'a> {
    route: &'a ResolvedRoute,
}

#[async_trait]
impl Handler for RouteEndpoint<'_> {
    async fn call(&self, req: &mut Request, res: &mut Response) -> HandlerResult {
        self.route
            .middleware
            .execute(req, res, self.route.handler.as_ref())
            .await
    }
}

/// Terminate a pipeline stage by finalizing the response with `err`.
fn fail(res: &mut Response, err: HttpError) -> HandlerResult {
    tracing::debug!("Pipeline stopped with {}: {}", err.status(), err);
    res.send_error(&err);
    Ok(())
}

fn report(req: &Request, res: &mut Response, err: HttpError) {
    if err.is_internal() {
        tracing::error!(
            "Unhandled error for {} {} (request {}): {:?}",
            req.method(),
            req.path(),
            req.id(),
            err
        );
    } else {
        tracing::debug!("Handler returned {}: {}", err.status(), err);
    }
    res.send_error(&err);
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use http::{Method, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};

    use super::*;
    use crate::core::{
        error::ErrorEnvelope,
        middleware::{handler_fn, middleware_fn},
        options::{CacheOptions, PayloadOptions, SecurityOptions, ValidationSchemas},
        route::Route,
    };

    struct HeaderToken;

    #[async_trait]
    impl AuthStrategy for HeaderToken {
        async fn authenticate(&self, req: &Request) -> eyre::Result<AuthResult> {
            Ok(match req.header("x-token") {
                Some("admin") => AuthResult::authenticated("root").with_scopes(["admin"]),
                Some("user") => AuthResult::authenticated("alice"),
                _ => AuthResult::unauthenticated(),
            })
        }
    }

    struct Broken;

    #[async_trait]
    impl AuthStrategy for Broken {
        async fn authenticate(&self, _req: &Request) -> eyre::Result<AuthResult> {
            Err(eyre::eyre!("backend unreachable"))
        }
    }

    fn ok_text(body: &'static str) -> impl Handler {
        handler_fn(move |_req, res| {
            res.text(StatusCode::OK, body)?;
            Ok(())
        })
    }

    fn request(method: Method, uri: &str) -> http::Request<Body> {
        http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(res: http::Response<Body>) -> Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(res: http::Response<Body>) -> String {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_params_are_bound_before_handler() {
        let dispatcher = Dispatcher::builder()
            .router(Router::new("api", "/api").route(Route::get(
                "/users/{id}",
                handler_fn(|req, res| {
                    let id = req.param("id").unwrap_or_default().to_string();
                    res.json(StatusCode::OK, &json!({ "id": id, "route": req.route().unwrap().pattern }))?;
                    Ok(())
                }),
            )))
            .build()
            .unwrap();

        let res = dispatcher.handle(request(Method::GET, "/api/users/42"), None).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            body_json(res).await,
            json!({ "id": "42", "route": "/api/users/{id}" })
        );
    }

    #[tokio::test]
    async fn test_method_not_allowed_lists_supported_methods() {
        let dispatcher = Dispatcher::builder()
            .router(Router::new("root", "").route(Route::new(
                MethodSet::parse(&["GET", "POST"]).unwrap(),
                "/items",
                ok_text("items"),
            )))
            .build()
            .unwrap();

        let res = dispatcher.handle(request(Method::POST, "/items"), None).await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = dispatcher.handle(request(Method::DELETE, "/items"), None).await;
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(res.headers()[header::ALLOW], "GET, POST");
    }

    #[tokio::test]
    async fn test_router_fallback_answers_not_found() {
        let dispatcher = Dispatcher::builder()
            .router(Router::new("api", "/api").route(Route::get("/ping", ok_text("pong"))))
            .router(
                Router::new("site", "")
                    .route(Route::get("/{page}/{rest:.*}", ok_text("site")))
                    .not_found_fallback(false),
            )
            .build()
            .unwrap();

        // without the api fallback the site route would swallow this path
        let res = dispatcher.handle(request(Method::GET, "/api/missing"), None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let envelope: ErrorEnvelope = serde_json::from_value(body_json(res).await).unwrap();
        assert_eq!(envelope.status, 404);

        let res = dispatcher.handle(request(Method::GET, "/docs/intro"), None).await;
        assert_eq!(body_text(res).await, "site");
    }

    #[tokio::test]
    async fn test_nested_router_fallbacks_are_not_shadowed() {
        let dispatcher = Dispatcher::builder()
            .router(Router::new("api", "/api"))
            .router(Router::new("v2", "/api/v2").route(Route::any("/{path:.*}", ok_text("v2"))))
            .build()
            .unwrap();

        let patterns: Vec<&str> = dispatcher
            .route_table()
            .entries()
            .iter()
            .map(|entry| entry.pattern())
            .collect();
        // the explicit v2 route owns its fallback pattern, the api fallback follows it
        assert_eq!(patterns, ["/api/v2/{path:.*}", "/api/{path:.*}"]);

        let res = dispatcher.handle(request(Method::GET, "/api/v2/anything"), None).await;
        assert_eq!(body_text(res).await, "v2");
        let res = dispatcher.handle(request(Method::GET, "/api/other"), None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_mount_nesting() {
        assert!(is_mounted_under("/api/v2", "/api"));
        assert!(is_mounted_under("/api", "/api"));
        assert!(is_mounted_under("/api", "/"));
        assert!(!is_mounted_under("/apiv2", "/api"));
        assert!(!is_mounted_under("/", "/api"));
    }

    #[tokio::test]
    async fn test_auth_pipeline() {
        let dispatcher = Dispatcher::builder()
            .strategy("broken", Broken)
            .strategy("token", HeaderToken)
            .router(
                Router::new("admin", "/admin")
                    .route(
                        Route::get("/panel", ok_text("panel"))
                            .auth(AuthOptions::required(&["broken", "token"]).with_scope("admin")),
                    )
                    .route(
                        Route::get(
                            "/maybe",
                            handler_fn(|req, res| {
                                let who = req.auth().principal.clone().unwrap_or_default();
                                res.text(StatusCode::OK, who)?;
                                Ok(())
                            }),
                        )
                        .auth(AuthOptions::required(&["token"]).optional()),
                    ),
            )
            .build()
            .unwrap();

        let res = dispatcher.handle(request(Method::GET, "/admin/panel"), None).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let mut req = request(Method::GET, "/admin/panel");
        req.headers_mut().insert("x-token", "user".parse().unwrap());
        let res = dispatcher.handle(req, None).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let mut req = request(Method::GET, "/admin/panel");
        req.headers_mut().insert("x-token", "admin".parse().unwrap());
        let res = dispatcher.handle(req, None).await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = dispatcher.handle(request(Method::GET, "/admin/maybe"), None).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_text(res).await, "");
    }

    #[test]
    fn test_unknown_strategy_is_a_build_error() {
        let err = Dispatcher::builder()
            .router(
                Router::new("r", "")
                    .route(Route::get("/x", ok_text("x")).auth(AuthOptions::required(&["jwt"]))),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, RouteError::UnknownStrategy { strategy, .. } if strategy == "jwt"));
    }

    #[tokio::test]
    async fn test_json_body_and_validation() {
        let schema = json!({
            "type": "object",
            "required": ["name"],
            "properties": { "name": { "type": "string" } }
        });
        let dispatcher = Dispatcher::builder()
            .router(Router::new("r", "").route(
                Route::post(
                    "/echo",
                    handler_fn(|req, res| {
                        let value = req.payload().to_value();
                        res.json(StatusCode::CREATED, &value)?;
                        Ok(())
                    }),
                )
                .validation(ValidationSchemas::body(schema)),
            ))
            .build()
            .unwrap();

        let req = http::Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"name":"keel"}"#))
            .unwrap();
        let res = dispatcher.handle(req, None).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(body_json(res).await, json!({ "name": "keel" }));

        let req = http::Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"name":7}"#))
            .unwrap();
        let res = dispatcher.handle(req, None).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = body_json(res).await;
        assert_eq!(body["detail"]["errors"][0]["location"], "body");
    }

    #[tokio::test]
    async fn test_unsupported_media_type_names_accepted_types() {
        let dispatcher = Dispatcher::builder()
            .router(Router::new("r", "").route(
                Route::put("/doc", ok_text("ok")).payload(PayloadOptions::allow(&["application/json"])),
            ))
            .build()
            .unwrap();

        let req = http::Request::builder()
            .method(Method::PUT)
            .uri("/doc")
            .header(header::CONTENT_TYPE, "text/csv")
            .body(Body::from("a,b"))
            .unwrap();
        let res = dispatcher.handle(req, None).await;
        assert_eq!(res.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(res.headers()["accept-put"], "application/json");
    }

    #[tokio::test]
    async fn test_cache_and_security_headers() {
        let dispatcher = Dispatcher::builder()
            .router(
                Router::new("r", "")
                    .defaults(RouteOptions {
                        security: Some(SecurityOptions::hardened()),
                        ..RouteOptions::default()
                    })
                    .route(Route::get("/cached", ok_text("c")).cache(CacheOptions::max_age(30)))
                    .route(Route::get(
                        "/override",
                        handler_fn(|_req, res| {
                            res.cache_control(&CacheOptions::no_store())?;
                            res.text(StatusCode::OK, "o")?;
                            Ok(())
                        }),
                    ).cache(CacheOptions::max_age(30))),
            )
            .build()
            .unwrap();

        let res = dispatcher.handle(request(Method::GET, "/cached"), None).await;
        assert_eq!(res.headers()[header::CACHE_CONTROL], "public, max-age=30");
        assert_eq!(res.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");

        let res = dispatcher.handle(request(Method::GET, "/override"), None).await;
        assert_eq!(res.headers()[header::CACHE_CONTROL], "no-store");
    }

    #[tokio::test]
    async fn test_chains_nest_global_router_route() {
        fn tag(name: &'static str) -> impl Middleware {
            middleware_fn(move |req, res, next| {
                Box::pin(async move {
                    res.append_header(
                        http::HeaderName::from_static("x-trace"),
                        http::HeaderValue::from_static(name),
                    )?;
                    next.run(req, res).await
                })
            })
        }

        let dispatcher = Dispatcher::builder()
            .middleware(tag("global"))
            .router(
                Router::new("r", "")
                    .middleware(tag("router"))
                    .route(Route::get("/t", ok_text("t")).middleware(tag("route"))),
            )
            .build()
            .unwrap();

        let res = dispatcher.handle(request(Method::GET, "/t"), None).await;
        let trace: Vec<&str> = res
            .headers()
            .get_all("x-trace")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(trace, ["global", "router", "route"]);
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics_become_500() {
        let dispatcher = Dispatcher::builder()
            .router(
                Router::new("r", "")
                    .route(Route::get(
                        "/fail",
                        handler_fn(|_req, _res| Err(eyre::eyre!("database exploded").into())),
                    ))
                    .route(Route::get(
                        "/panic",
                        handler_fn(|_req, _res| panic!("handler bug")),
                    )),
            )
            .build()
            .unwrap();

        for path in ["/fail", "/panic"] {
            let res = dispatcher.handle(request(Method::GET, path), None).await;
            assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
            let body = body_json(res).await;
            assert_eq!(body["message"], "Internal Server Error");
            assert!(!body.to_string().contains("exploded"));
        }
    }
}
