//! The route table: one entry per normalized pattern, each binding methods
//! to routes. Entries are matched in registration order, except that
//! catch-all entries always come last once the table is finalized.
use std::{collections::HashMap, sync::Arc};

use http::Method;

use crate::core::{
    error::RouteError,
    middleware::{Handler, MiddlewareChain},
    options::RouteOptions,
    path_matcher::{PathParams, PathPattern, join_paths},
    route::{ANY_METHOD, MethodSet, RouteParts},
    validation::CompiledValidation,
};

/// A route ready for dispatch: router defaults merged, schemas compiled.
pub struct ResolvedRoute {
    pub pattern: String,
    pub router: String,
    pub methods: MethodSet,
    pub case_sensitive: bool,
    pub options: RouteOptions,
    pub validation: CompiledValidation,
    pub router_middleware: MiddlewareChain,
    pub middleware: MiddlewareChain,
    pub handler: Arc<dyn Handler>,
}

impl ResolvedRoute {
    pub(crate) fn resolve(
        router: &str,
        base_path: &str,
        defaults: &RouteOptions,
        router_middleware: &MiddlewareChain,
        route: RouteParts,
    ) -> Result<Self, RouteError> {
        let pattern = join_paths(base_path, &route.path);
        let options = route.options.merged_with(defaults);
        let validation = match &options.validation {
            Some(schemas) => CompiledValidation::compile(&pattern, schemas)?,
            None => CompiledValidation::default(),
        };

        Ok(Self {
            pattern,
            router: router.to_string(),
            methods: route.methods,
            case_sensitive: route.case_sensitive,
            options,
            validation,
            router_middleware: router_middleware.clone(),
            middleware: route.middleware,
            handler: route.handler,
        })
    }
}

impl std::fmt::Debug for ResolvedRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedRoute")
            .field("pattern", &self.pattern)
            .field("router", &self.router)
            .field("methods", &self.methods)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct RouteEntry {
    matcher: PathPattern,
    bindings: HashMap<String, Arc<ResolvedRoute>>,
}

impl RouteEntry {
    pub fn pattern(&self) -> &str {
        self.matcher.as_str()
    }

    pub fn matcher(&self) -> &PathPattern {
        &self.matcher
    }

    pub fn is_catch_all(&self) -> bool {
        self.matcher.is_catch_all()
    }

    /// Bound method keys, sorted, `*` included.
    pub fn method_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.bindings.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn route_for(&self, method: &Method) -> Option<&Arc<ResolvedRoute>> {
        self.bindings
            .get(method.as_str())
            .or_else(|| self.bindings.get(ANY_METHOD))
    }

    /// Concrete methods, sorted, for an `Allow` header.
    pub fn allowed_methods(&self) -> Vec<Method> {
        let mut allow: Vec<Method> = self
            .bindings
            .keys()
            .filter(|k| k.as_str() != ANY_METHOD)
            .filter_map(|k| Method::from_bytes(k.as_bytes()).ok())
            .collect();
        allow.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        allow
    }
}

/// Result of resolving a request against the table.
#[derive(Debug)]
pub enum RouteLookup<'a> {
    Found {
        route: &'a Arc<ResolvedRoute>,
        params: PathParams,
    },
    MethodNotAllowed {
        allow: Vec<Method>,
    },
    NotFound,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    index: HashMap<String, usize>,
    finalized: bool,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `route` to the entry for its pattern, creating the entry on first
    /// sight. Case sensitivity is fixed by the first route of an entry.
    pub fn register(&mut self, route: ResolvedRoute) -> Result<(), RouteError> {
        if self.finalized {
            return Err(RouteError::TableFinalized {
                path: route.pattern,
            });
        }

        if route.methods == MethodSet::Only(Vec::new()) {
            return Err(RouteError::InvalidMethod {
                method: String::new(),
            });
        }

        let idx = match self.index.get(&route.pattern) {
            Some(&idx) => idx,
            None => {
                let matcher = PathPattern::compile(&route.pattern, route.case_sensitive)?;
                self.entries.push(RouteEntry {
                    matcher,
                    bindings: HashMap::new(),
                });
                let idx = self.entries.len() - 1;
                self.index.insert(route.pattern.clone(), idx);
                idx
            }
        };

        let entry = &mut self.entries[idx];
        let keys = route.methods.keys();
        if let Some(taken) = keys.iter().find(|k| entry.bindings.contains_key(*k)) {
            return Err(RouteError::DuplicateMethod {
                method: taken.clone(),
                path: route.pattern,
            });
        }

        tracing::debug!("Registered route {} {} ({})", route.methods, route.pattern, route.router);
        let route = Arc::new(route);
        for key in keys {
            entry.bindings.insert(key, route.clone());
        }
        Ok(())
    }

    pub fn contains_pattern(&self, pattern: &str) -> bool {
        self.index.contains_key(pattern)
    }

    /// Whether some entry already accepts every path `matcher` accepts.
    pub fn has_equivalent(&self, matcher: &PathPattern) -> bool {
        self.contains_pattern(matcher.as_str())
            || self
                .entries
                .iter()
                .any(|entry| matcher.is_equivalent_to(&entry.matcher))
    }

    /// Move catch-all entries to the end, keeping relative order otherwise.
    /// Registration is rejected afterwards.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        let (specific, catch_all): (Vec<RouteEntry>, Vec<RouteEntry>) =
            std::mem::take(&mut self.entries)
                .into_iter()
                .partition(|entry| !entry.is_catch_all());
        self.entries = specific;
        self.entries.extend(catch_all);
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| (entry.pattern().to_string(), idx))
            .collect();
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry whose matcher accepts `path`.
    pub fn match_path(&self, path: &str) -> Option<(&RouteEntry, PathParams)> {
        self.entries
            .iter()
            .find_map(|entry| entry.matcher.captures(path).map(|params| (entry, params)))
    }

    pub fn lookup(&self, method: &Method, path: &str) -> RouteLookup<'_> {
        let Some((entry, params)) = self.match_path(path) else {
            return RouteLookup::NotFound;
        };
        match entry.route_for(method) {
            Some(route) => RouteLookup::Found { route, params },
            None => RouteLookup::MethodNotAllowed {
                allow: entry.allowed_methods(),
            },
        }
    }
}
