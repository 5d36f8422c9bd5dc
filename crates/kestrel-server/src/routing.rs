//! Route registry and the default static file routes.
//!
//! Patterns that end in `/` match every path under them; all other patterns
//! match one path exactly. When several patterns match, the longest wins.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use kestrel_common::Result;

use crate::runtime::ScriptSource;

/// What serves a matched request.
#[derive(Debug, Clone)]
pub enum Route {
    /// A function registered by a script with `server.handle`
    Script {
        source: Arc<ScriptSource>,
        pattern: String,
    },
    /// Files under `root`, with `prefix` stripped from the request path
    Static { root: PathBuf, prefix: String },
    /// One file, whatever the request path
    File(PathBuf),
}

#[derive(Debug, Default)]
pub struct RoutingRegistry {
    routes: RwLock<Vec<(String, Route)>>,
}

impl RoutingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route, replacing any route with the same pattern.
    pub fn register(&self, pattern: impl Into<String>, route: Route) {
        let pattern = pattern.into();
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = routes.iter_mut().find(|(p, _)| *p == pattern) {
            existing.1 = route;
        } else {
            routes.push((pattern, route));
        }
    }

    /// Finds the route for a request path.
    pub fn resolve(&self, path: &str) -> Option<(String, Route)> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, path))
            .max_by_key(|(pattern, _)| pattern.len())
            .cloned()
    }

    pub fn patterns(&self) -> Vec<String> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    if pattern.ends_with('/') {
        path.starts_with(pattern) || path == pattern.trim_end_matches('/')
    } else {
        path == pattern
    }
}

/// Installs request handlers when no server script took over.
pub trait RouteInstaller: Send + Sync {
    fn install_defaults(&self, routes: &RoutingRegistry) -> Result<()>;
}

/// Default handlers serving the server root from disk.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    single_file: bool,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            single_file: false,
        }
    }

    /// Serves `file` for every request.
    pub fn single_file(file: impl Into<PathBuf>) -> Self {
        Self {
            root: file.into(),
            single_file: true,
        }
    }
}

impl RouteInstaller for StaticFiles {
    fn install_defaults(&self, routes: &RoutingRegistry) -> Result<()> {
        let route = if self.single_file {
            Route::File(self.root.clone())
        } else {
            Route::Static {
                root: self.root.clone(),
                prefix: "/".to_string(),
            }
        };
        tracing::debug!(root = %self.root.display(), "Installing default routes");
        routes.register("/", route);
        Ok(())
    }
}

/// Canonical form of a request path: `/a/b`, without empty or `.` segments.
///
/// Returns `None` when the path contains a `..` segment. Every routing and
/// permission decision is made on this form.
pub fn normalize_request_path(path: &str) -> Option<String> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let mut canonical = String::with_capacity(path.len() + 1);
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            part => {
                canonical.push('/');
                canonical.push_str(part);
            }
        }
    }
    if canonical.is_empty() {
        canonical.push('/');
    }
    Some(canonical)
}

/// Maps a request path to a file below `root`.
///
/// Returns `None` for paths that try to leave `root`. Directories resolve to
/// their `index.html`.
pub fn resolve_static(root: &Path, prefix: &str, request_path: &str) -> Option<PathBuf> {
    let relative = request_path.strip_prefix(prefix).unwrap_or(request_path);
    let relative = relative.split(['?', '#']).next().unwrap_or_default();

    let mut resolved = root.to_path_buf();
    for component in Path::new(relative.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    if resolved.is_dir() {
        resolved.push("index.html");
    }
    Some(resolved)
}

/// Content type for a file, guessed from its extension.
///
/// Text types are sent as UTF-8.
pub fn content_type_for(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::TEXT && mime.get_param(mime_guess::mime::CHARSET).is_none() {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script_route(pattern: &str) -> Route {
        Route::Script {
            source: Arc::new(ScriptSource::new("test.js", "")),
            pattern: pattern.to_string(),
        }
    }

    #[test]
    fn test_exact_and_prefix_matching() {
        let routes = RoutingRegistry::new();
        routes.register("/", Route::Static { root: PathBuf::from("/srv"), prefix: "/".into() });
        routes.register("/api/", script_route("/api/"));
        routes.register("/api/users", script_route("/api/users"));

        assert_eq!(routes.resolve("/api/users").unwrap().0, "/api/users");
        assert_eq!(routes.resolve("/api/users/7").unwrap().0, "/api/");
        assert_eq!(routes.resolve("/api").unwrap().0, "/api/");
        assert_eq!(routes.resolve("/style.css").unwrap().0, "/");
    }

    #[test]
    fn test_exact_pattern_does_not_match_subpaths() {
        let routes = RoutingRegistry::new();
        routes.register("/hello", script_route("/hello"));
        assert!(routes.resolve("/hello/there").is_none());
        assert!(routes.resolve("/").is_none());
    }

    #[test]
    fn test_register_replaces_same_pattern() {
        let routes = RoutingRegistry::new();
        routes.register("/x", script_route("/x"));
        routes.register("/x", Route::File(PathBuf::from("x.html")));
        assert_eq!(routes.len(), 1);
        assert!(matches!(routes.resolve("/x").unwrap().1, Route::File(_)));
    }

    #[test]
    fn test_static_files_installs_root_route() {
        let routes = RoutingRegistry::new();
        StaticFiles::new("/srv/www").install_defaults(&routes).unwrap();
        assert_eq!(routes.patterns(), vec!["/"]);

        let single = RoutingRegistry::new();
        StaticFiles::single_file("page.html").install_defaults(&single).unwrap();
        assert!(matches!(single.resolve("/anything").unwrap().1, Route::File(_)));
    }

    #[test]
    fn test_resolve_static_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_static(dir.path(), "/", "/../etc/passwd").is_none());
        assert!(resolve_static(dir.path(), "/", "/a/../../b").is_none());
        assert_eq!(
            resolve_static(dir.path(), "/", "/css/site.css?v=2").unwrap(),
            dir.path().join("css").join("site.css")
        );
    }

    #[test]
    fn test_resolve_static_directory_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        assert_eq!(
            resolve_static(dir.path(), "/", "/docs").unwrap(),
            dir.path().join("docs").join("index.html")
        );
        assert_eq!(resolve_static(dir.path(), "/", "/").unwrap(), dir.path().join("index.html"));
    }

    #[test]
    fn test_normalize_request_path() {
        assert_eq!(normalize_request_path("/").as_deref(), Some("/"));
        assert_eq!(normalize_request_path("").as_deref(), Some("/"));
        assert_eq!(normalize_request_path("//admin/secret.txt").as_deref(), Some("/admin/secret.txt"));
        assert_eq!(normalize_request_path("/./admin/./secret.txt").as_deref(), Some("/admin/secret.txt"));
        assert_eq!(normalize_request_path("/docs/").as_deref(), Some("/docs"));
        assert_eq!(normalize_request_path("/a?b=/../c").as_deref(), Some("/a"));
        assert!(normalize_request_path("/a/../admin").is_none());
        assert!(normalize_request_path("/..").is_none());
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("index.HTML")), "text/html; charset=utf-8");
        assert_eq!(content_type_for(Path::new("site.css")), "text/css; charset=utf-8");
        assert_eq!(content_type_for(Path::new("logo.png")), "image/png");
        assert!(content_type_for(Path::new("app.js")).contains("javascript"));
        assert_eq!(content_type_for(Path::new("blob")), "application/octet-stream");
    }
}
