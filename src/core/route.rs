//! Route and router definitions, as supplied by application code.
use std::{path::PathBuf, sync::Arc};

use http::Method;

use crate::{
    config::models::RouterConfig,
    core::{
        error::RouteError,
        middleware::{Handler, Middleware, MiddlewareChain},
        options::{
            AuthOptions, CacheOptions, PayloadOptions, RouteOptions, SecurityOptions,
            ValidationSchemas,
        },
    },
};

/// Key used for wildcard method bindings.
pub const ANY_METHOD: &str = "*";

/// The methods a route answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodSet {
    Any,
    Only(Vec<Method>),
}

impl MethodSet {
    /// Parse method names; `"*"` anywhere in the list means any method.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, RouteError> {
        let mut methods: Vec<Method> = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref().trim();
            if name == ANY_METHOD {
                return Ok(MethodSet::Any);
            }
            let method = Method::from_bytes(name.to_ascii_uppercase().as_bytes()).map_err(|_| {
                RouteError::InvalidMethod {
                    method: name.to_string(),
                }
            })?;
            if !methods.contains(&method) {
                methods.push(method);
            }
        }
        if methods.is_empty() {
            return Err(RouteError::InvalidMethod {
                method: String::new(),
            });
        }
        Ok(MethodSet::Only(methods))
    }

    /// Binding keys within a route table entry.
    pub fn keys(&self) -> Vec<String> {
        match self {
            MethodSet::Any => vec![ANY_METHOD.to_string()],
            MethodSet::Only(methods) => methods.iter().map(|m| m.as_str().to_string()).collect(),
        }
    }
}

impl std::fmt::Display for MethodSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.keys().join(","))
    }
}

/// A `(methods, pattern, handler, options)` binding.
pub struct Route {
    methods: MethodSet,
    path: String,
    case_sensitive: bool,
    options: RouteOptions,
    middleware: MiddlewareChain,
    handler: Arc<dyn Handler>,
}

impl Route {
    pub fn new(methods: MethodSet, path: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::with_shared_handler(methods, path, Arc::new(handler))
    }

    pub fn with_shared_handler(
        methods: MethodSet,
        path: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            methods,
            path: path.into(),
            case_sensitive: false,
            options: RouteOptions::default(),
            middleware: MiddlewareChain::new(),
            handler,
        }
    }

    pub fn get(path: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::new(MethodSet::Only(vec![Method::GET]), path, handler)
    }

    pub fn post(path: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::new(MethodSet::Only(vec![Method::POST]), path, handler)
    }

    pub fn put(path: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::new(MethodSet::Only(vec![Method::PUT]), path, handler)
    }

    pub fn patch(path: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::new(MethodSet::Only(vec![Method::PATCH]), path, handler)
    }

    pub fn delete(path: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::new(MethodSet::Only(vec![Method::DELETE]), path, handler)
    }

    pub fn any(path: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::new(MethodSet::Any, path, handler)
    }

    /// A route for an explicit method list. An empty list is rejected.
    pub fn methods(
        methods: &[Method],
        path: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Result<Self, RouteError> {
        let mut unique: Vec<Method> = Vec::with_capacity(methods.len());
        for method in methods {
            if !unique.contains(method) {
                unique.push(method.clone());
            }
        }
        if unique.is_empty() {
            return Err(RouteError::InvalidMethod {
                method: String::new(),
            });
        }
        Ok(Self::new(MethodSet::Only(unique), path, handler))
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn options(mut self, options: RouteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn cache(mut self, cache: CacheOptions) -> Self {
        self.options.cache = Some(cache);
        self
    }

    pub fn auth(mut self, auth: AuthOptions) -> Self {
        self.options.auth = Some(auth);
        self
    }

    pub fn security(mut self, security: SecurityOptions) -> Self {
        self.options.security = Some(security);
        self
    }

    pub fn payload(mut self, payload: PayloadOptions) -> Self {
        self.options.payload = Some(payload);
        self
    }

    pub fn validation(mut self, validation: ValidationSchemas) -> Self {
        self.options.validation = Some(validation);
        self
    }

    /// Add route-scoped middleware, run after the router's.
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn method_set(&self) -> &MethodSet {
        &self.methods
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn route_options(&self) -> &RouteOptions {
        &self.options
    }

    pub(crate) fn into_parts(self) -> RouteParts {
        RouteParts {
            methods: self.methods,
            path: self.path,
            case_sensitive: self.case_sensitive,
            options: self.options,
            middleware: self.middleware,
            handler: self.handler,
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("methods", &self.methods)
            .field("path", &self.path)
            .field("case_sensitive", &self.case_sensitive)
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

pub(crate) struct RouteParts {
    pub methods: MethodSet,
    pub path: String,
    pub case_sensitive: bool,
    pub options: RouteOptions,
    pub middleware: MiddlewareChain,
    pub handler: Arc<dyn Handler>,
}

/// A named group of routes under a shared mount prefix.
#[derive(Debug)]
pub struct Router {
    name: String,
    base_path: String,
    defaults: RouteOptions,
    middleware: MiddlewareChain,
    routes: Vec<Route>,
    directories: Vec<PathBuf>,
    not_found_fallback: bool,
}

impl Router {
    pub fn new(name: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_path: base_path.into(),
            defaults: RouteOptions::default(),
            middleware: MiddlewareChain::new(),
            routes: Vec::new(),
            directories: Vec::new(),
            not_found_fallback: true,
        }
    }

    /// Router described by configuration; its routes come from `directories`.
    pub fn from_config(config: &RouterConfig) -> Self {
        let mut router = Self::new(config.name.clone(), config.base_path.clone())
            .not_found_fallback(config.not_found_fallback);
        router.directories = config.directories.iter().map(PathBuf::from).collect();
        router
    }

    /// Options merged into every route; route values win.
    pub fn defaults(mut self, defaults: RouteOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn routes(mut self, routes: impl IntoIterator<Item = Route>) -> Self {
        self.routes.extend(routes);
        self
    }

    /// Directory scanned for route manifests when the server starts.
    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directories.push(dir.into());
        self
    }

    /// Whether unmatched paths under the base path answer 404 instead of
    /// falling through to other routers.
    pub fn not_found_fallback(mut self, enabled: bool) -> Self {
        self.not_found_fallback = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn route_defaults(&self) -> &RouteOptions {
        &self.defaults
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    pub fn has_not_found_fallback(&self) -> bool {
        self.not_found_fallback
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub(crate) fn add_routes(&mut self, routes: impl IntoIterator<Item = Route>) {
        self.routes.extend(routes);
    }

    pub(crate) fn into_parts(self) -> RouterParts {
        RouterParts {
            name: self.name,
            base_path: self.base_path,
            defaults: self.defaults,
            middleware: self.middleware,
            routes: self.routes,
            not_found_fallback: self.not_found_fallback,
        }
    }
}

pub(crate) struct RouterParts {
    pub name: String,
    pub base_path: String,
    pub defaults: RouteOptions,
    pub middleware: MiddlewareChain,
    pub routes: Vec<Route>,
    pub not_found_fallback: bool,
}
