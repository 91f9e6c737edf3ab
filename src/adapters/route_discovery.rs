//! Loads route definitions from manifest directories.
//!
//! Every `.json`, `.toml`, `.yaml` or `.yml` file below a router directory
//! declares a `routes` list. A definition's path is the file's directory
//! relative to the scanned root, then the file stem (unless `exclude_name`),
//! then the definition's own `path`. The router's base path is prepended when
//! the router is resolved. Handlers are referenced by name and looked up in a
//! [`HandlerRegistry`].
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Deserialize;

use crate::core::{
    error::RouteError,
    middleware::Handler,
    options::RouteOptions,
    path_matcher::join_paths,
    route::{MethodSet, Route, Router},
};

/// Named handlers that route manifests can refer to.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.register(name, handler);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn register_arc(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct RouteManifest {
    #[serde(default)]
    routes: Vec<RouteDefinition>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MethodSpec {
    One(String),
    Many(Vec<String>),
}

impl Default for MethodSpec {
    fn default() -> Self {
        MethodSpec::One("GET".to_string())
    }
}

impl MethodSpec {
    fn parse(&self) -> Result<MethodSet, RouteError> {
        match self {
            MethodSpec::One(method) => MethodSet::parse(std::slice::from_ref(method)),
            MethodSpec::Many(methods) => MethodSet::parse(methods),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RouteDefinition {
    #[serde(default)]
    method: MethodSpec,
    #[serde(default)]
    path: String,
    handler: String,
    #[serde(default)]
    case_sensitive: bool,
    #[serde(default)]
    exclude_name: bool,
    #[serde(flatten)]
    options: RouteOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManifestFormat {
    Json,
    Toml,
    Yaml,
}

impl ManifestFormat {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }

    fn parse(self, source: &str) -> Result<RouteManifest, String> {
        match self {
            Self::Json => serde_json::from_str(source).map_err(|e| e.to_string()),
            Self::Toml => toml::from_str(source).map_err(|e| e.to_string()),
            Self::Yaml => serde_yaml::from_str(source).map_err(|e| e.to_string()),
        }
    }
}

fn discovery_error(path: &Path, message: impl Into<String>) -> RouteError {
    RouteError::Discovery {
        path: path.display().to_string(),
        message: message.into(),
    }
}

/// Manifest files below `root`, depth first, in sorted order.
fn collect_manifests(root: &Path, dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), RouteError> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| discovery_error(dir, e.to_string()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| discovery_error(dir, e.to_string()))?;
    entries.sort();

    for path in entries {
        let hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.'));
        if hidden {
            continue;
        }
        if path.is_dir() {
            collect_manifests(root, &path, found)?;
        } else if ManifestFormat::from_path(&path).is_some() {
            found.push(path);
        } else {
            tracing::debug!("Skipping non-manifest file {}", path.display());
        }
    }
    Ok(())
}

/// Path prefix a manifest contributes: its directory below `root` plus,
/// unless excluded, its stem.
fn manifest_prefix(root: &Path, file: &Path, exclude_name: bool) -> String {
    let mut prefix = String::new();
    if let Some(parent) = file.parent().and_then(|p| p.strip_prefix(root).ok()) {
        for component in parent.components() {
            prefix.push('/');
            prefix.push_str(&component.as_os_str().to_string_lossy());
        }
    }
    if !exclude_name {
        if let Some(stem) = file.file_stem() {
            prefix.push('/');
            prefix.push_str(&stem.to_string_lossy());
        }
    }
    prefix
}

fn load_manifest(
    root: &Path,
    file: &Path,
    registry: &HandlerRegistry,
) -> Result<Vec<Route>, RouteError> {
    let Some(format) = ManifestFormat::from_path(file) else {
        return Ok(Vec::new());
    };
    let source = fs::read_to_string(file).map_err(|e| discovery_error(file, e.to_string()))?;
    let manifest = format
        .parse(&source)
        .map_err(|message| discovery_error(file, message))?;

    manifest
        .routes
        .into_iter()
        .map(|definition| {
            let handler =
                registry
                    .get(&definition.handler)
                    .ok_or_else(|| RouteError::UnknownHandler {
                        file: file.display().to_string(),
                        handler: definition.handler.clone(),
                    })?;
            let prefix = manifest_prefix(root, file, definition.exclude_name);
            let path = join_paths(&prefix, &definition.path);
            Ok(
                Route::with_shared_handler(definition.method.parse()?, path, handler)
                    .case_sensitive(definition.case_sensitive)
                    .options(definition.options),
            )
        })
        .collect()
}

/// Load every route declared below `root`.
pub fn discover_routes(root: &Path, registry: &HandlerRegistry) -> Result<Vec<Route>, RouteError> {
    if !root.is_dir() {
        return Err(discovery_error(root, "not a directory"));
    }

    let mut manifests = Vec::new();
    collect_manifests(root, root, &mut manifests)?;

    let mut routes = Vec::new();
    for file in &manifests {
        let loaded = load_manifest(root, file, registry)?;
        tracing::debug!("Loaded {} routes from {}", loaded.len(), file.display());
        routes.extend(loaded);
    }
    tracing::info!(
        "Discovered {} routes in {} manifests under {}",
        routes.len(),
        manifests.len(),
        root.display()
    );
    Ok(routes)
}

/// Add the routes found in each of the router's directories.
pub fn populate_router(router: &mut Router, registry: &HandlerRegistry) -> Result<(), RouteError> {
    let directories = router.directories().to_vec();
    for dir in directories {
        let routes = discover_routes(&dir, registry)?;
        router.add_routes(routes);
    }
    Ok(())
}
