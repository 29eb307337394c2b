//! Alias routes and the ordered table they are resolved from.
//!
//! A route is declared as `"METHOD /path"` (or just `"/path"`, which accepts any method)
//! and bound to a [`RouteTarget`]. Its path is relative to the mount path of the handler
//! that owns it; the compiled [`PathPattern`] matches the full path.
//!
//! | Definition           | Mounted at | Full path              | Method |
//! |----------------------|------------|------------------------|--------|
//! | `GET /math/add`      | `/api`     | `/api/math/add`        | `GET`  |
//! | `/users/:id`         | `/`        | `/users/:id`           | any    |
//! | `POST /files/:path+` | `/v2`      | `/v2/files/:path+`     | `POST` |
//!
//! With auto-ordering enabled the table is kept sorted by [`specificity_order`], so a
//! generic `/:id` route can never shadow a static `/health` one, whatever the
//! registration order.

pub mod pattern;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::http::Method;
use crate::middleware::SharedMiddleware;
use pattern::{PathParams, PathPattern, PatternError, PatternOptions};

/// What a route resolves to.
pub enum RouteTarget {
    /// Call the named backend action.
    Action(String),
    /// Run `middlewares` in order, then call `action` when one is given.
    ///
    /// A chain without an action must produce the response itself; otherwise the
    /// request completes with an empty body.
    Chain {
        middlewares: Vec<SharedMiddleware>,
        action: Option<String>,
    },
}

impl RouteTarget {
    /// Returns the action this target calls, if any.
    pub fn action(&self) -> Option<&str> {
        match self {
            RouteTarget::Action(name) => Some(name),
            RouteTarget::Chain { action, .. } => action.as_deref(),
        }
    }

    /// Returns the route-level middleware chain (empty for a bare action).
    pub fn middlewares(&self) -> &[SharedMiddleware] {
        match self {
            RouteTarget::Action(_) => &[],
            RouteTarget::Chain { middlewares, .. } => middlewares,
        }
    }
}

impl From<&str> for RouteTarget {
    fn from(action: &str) -> Self {
        RouteTarget::Action(action.to_owned())
    }
}

impl From<String> for RouteTarget {
    fn from(action: String) -> Self {
        RouteTarget::Action(action)
    }
}

impl fmt::Debug for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::Action(name) => f.debug_tuple("Action").field(name).finish(),
            RouteTarget::Chain {
                middlewares,
                action,
            } => f
                .debug_struct("Chain")
                .field("middlewares", &middlewares.len())
                .field("action", action)
                .finish(),
        }
    }
}

/// A compiled alias route. Immutable once built.
#[derive(Debug)]
pub struct Route {
    method: Option<Method>,
    path: String,
    full_path: String,
    pattern: PathPattern,
    target: RouteTarget,
    handler_path: String,
    auto: bool,
}

impl Route {
    /// Compiles `definition` relative to the mount path `handler_path`.
    ///
    /// # Errors
    ///
    /// Returns the [`PatternError`] raised while compiling the full path.
    pub fn new(
        definition: &str,
        target: RouteTarget,
        handler_path: &str,
    ) -> Result<Self, PatternError> {
        let (method, path) = parse_definition(definition);
        let path = trim_slashes(path).to_owned();
        let full_path = format!("{}{}", add_slashes(handler_path), path);
        let pattern = PathPattern::compile(&full_path, PatternOptions::default())?;

        Ok(Self {
            method,
            path,
            full_path,
            pattern,
            target,
            handler_path: handler_path.to_owned(),
            auto: false,
        })
    }

    /// Marks the route as derived from the backend catalog rather than configured.
    #[must_use]
    pub fn generated(mut self) -> Self {
        self.auto = true;
        self
    }

    /// `None` accepts any method.
    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    /// The path as declared, without surrounding slashes.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    pub fn target(&self) -> &RouteTarget {
        &self.target
    }

    /// Mount path of the owning handler.
    pub fn handler_path(&self) -> &str {
        &self.handler_path
    }

    pub fn is_generated(&self) -> bool {
        self.auto
    }

    /// Matches a request path and method against this route.
    pub fn matches(&self, path: &str, method: &Method) -> Option<PathParams> {
        match &self.method {
            Some(expected) if expected != method => None,
            _ => self.pattern.matches(path),
        }
    }
}

/// A successful table lookup.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub params: PathParams,
}

/// An ordered collection of routes.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a route. Call [`sort`](Self::sort) afterwards to restore ordering.
    pub fn push(&mut self, route: Arc<Route>) {
        self.routes.push(route);
    }

    pub fn extend(&mut self, routes: impl IntoIterator<Item = Arc<Route>>) {
        self.routes.extend(routes);
    }

    /// Keeps only the routes for which `keep` returns `true`.
    pub fn retain(&mut self, keep: impl FnMut(&Arc<Route>) -> bool) {
        self.routes.retain(keep);
    }

    /// Sorts the table by [`specificity_order`] on the full path.
    ///
    /// The sort is stable, so routes that compare equal keep their registration order.
    pub fn sort(&mut self) {
        self.routes
            .sort_by(|a, b| specificity_order(a.full_path(), b.full_path()));
    }

    /// Returns the first route, in table order, accepting `method` and matching `path`.
    pub fn resolve(&self, path: &str, method: &Method) -> Option<RouteMatch> {
        self.routes.iter().find_map(|route| {
            route.matches(path, method).map(|params| RouteMatch {
                route: Arc::clone(route),
                params,
            })
        })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.iter()
    }
}

/// Orders paths from most to least specific.
///
/// 1. More segments first (counted on the slash-terminated path).
/// 2. Fewer `:` parameters first.
/// 3. Plain string order, so the result never depends on registration order.
///
/// ```
/// use rpcgate::router::specificity_order;
///
/// let mut paths = vec!["/api/:anything", "/", "/api/math", "/api/v2/status"];
/// paths.sort_by(|a, b| specificity_order(a, b));
/// assert_eq!(paths, vec!["/api/v2/status", "/api/math", "/api/:anything", "/"]);
/// ```
pub fn specificity_order(a: &str, b: &str) -> Ordering {
    let segments = |path: &str| add_slashes(path).split('/').count();
    let params = |path: &str| path.matches(':').count();

    segments(b)
        .cmp(&segments(a))
        .then_with(|| params(a).cmp(&params(b)))
        .then_with(|| a.cmp(b))
}

/// Splits `"METHOD /path"` into its method (`None` for `*` or when omitted) and path.
pub fn parse_definition(definition: &str) -> (Option<Method>, &str) {
    let definition = definition.trim();
    match definition.split_once(' ') {
        Some((method, path)) => {
            let path = path.trim();
            if method == "*" {
                (None, path)
            } else {
                let Ok(method) = method.parse::<Method>();
                (Some(method), path)
            }
        }
        None => (None, definition),
    }
}

/// Ensures `path` starts and ends with exactly the slashes it needs: `api` → `/api/`.
pub fn add_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 2);
    if !path.starts_with('/') {
        out.push('/');
    }
    out.push_str(path);
    if !path.ends_with('/') {
        out.push('/');
    }
    out
}

/// Collapses runs of `/` into one.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    out
}

/// Removes one leading and one trailing slash.
pub fn trim_slashes(path: &str) -> &str {
    let path = path.strip_prefix('/').unwrap_or(path);
    path.strip_suffix('/').unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(definition: &str, action: &str, mount: &str) -> Arc<Route> {
        Arc::new(Route::new(definition, action.into(), mount).unwrap())
    }

    fn table(routes: Vec<Arc<Route>>) -> RouteTable {
        let mut table = RouteTable::new();
        table.extend(routes);
        table.sort();
        table
    }

    // ── definitions ───────────────────────────────────────────────────────────

    #[test]
    fn definition_with_method() {
        assert_eq!(parse_definition("GET /math/add"), (Some(Method::Get), "/math/add"));
        assert_eq!(parse_definition("post /x"), (Some(Method::Post), "/x"));
    }

    #[test]
    fn definition_without_method_accepts_any() {
        assert_eq!(parse_definition("/math/add"), (None, "/math/add"));
        assert_eq!(parse_definition("* /math/add"), (None, "/math/add"));
    }

    #[test]
    fn full_path_joins_mount_and_route() {
        let r = route("GET /math/add/", "math.add", "/api");
        assert_eq!(r.path(), "math/add");
        assert_eq!(r.full_path(), "/api/math/add");
        assert_eq!(r.handler_path(), "/api");
        assert!(!r.is_generated());

        let r = route("/status", "node.status", "/");
        assert_eq!(r.full_path(), "/status");
    }

    #[test]
    fn invalid_template_is_rejected() {
        assert!(Route::new("GET /user/:id(\\d+", "user.get".into(), "/").is_err());
    }

    #[test]
    fn slash_helpers() {
        assert_eq!(add_slashes("api"), "/api/");
        assert_eq!(add_slashes("/api/"), "/api/");
        assert_eq!(add_slashes("/"), "/");
        assert_eq!(normalize_path("//api///v1/"), "/api/v1/");
        assert_eq!(trim_slashes("/a/b/"), "a/b");
        assert_eq!(trim_slashes("/"), "");
    }

    // ── ordering ──────────────────────────────────────────────────────────────

    #[test]
    fn static_route_beats_parametric_in_either_order() {
        for routes in [
            vec![
                route("GET /math", "math.info", "/api"),
                route("GET /:anything", "catch.all", "/api"),
            ],
            vec![
                route("GET /:anything", "catch.all", "/api"),
                route("GET /math", "math.info", "/api"),
            ],
        ] {
            let table = table(routes);
            let found = table.resolve("/api/math", &Method::Get).unwrap();
            assert_eq!(found.route.target().action(), Some("math.info"));

            let found = table.resolve("/api/other", &Method::Get).unwrap();
            assert_eq!(found.route.target().action(), Some("catch.all"));
            assert_eq!(
                found.params.get("anything").and_then(|v| v.as_str()),
                Some("other")
            );
        }
    }

    #[test]
    fn deeper_paths_sort_first() {
        let table = table(vec![
            route("/", "root", "/"),
            route("/a/:b", "ab", "/"),
            route("/a/b/c", "abc", "/"),
            route("/a/b", "a.b", "/"),
        ]);
        let order: Vec<_> = table.iter().map(|r| r.full_path().to_owned()).collect();
        assert_eq!(order, vec!["/a/b/c", "/a/b", "/a/:b", "/"]);
    }

    #[test]
    fn mount_paths_use_the_same_ordering() {
        let mut mounts = vec!["/", "/:tenant", "/api", "/api/v2"];
        mounts.sort_by(|a, b| specificity_order(a, b));
        assert_eq!(mounts, vec!["/api/v2", "/api", "/:tenant", "/"]);
    }

    // ── resolve ───────────────────────────────────────────────────────────────

    #[test]
    fn resolve_checks_method() {
        let table = table(vec![
            route("POST /users", "users.create", "/"),
            route("GET /users", "users.list", "/"),
        ]);
        let found = table.resolve("/users", &Method::Post).unwrap();
        assert_eq!(found.route.target().action(), Some("users.create"));
        assert!(table.resolve("/users", &Method::Delete).is_none());
    }

    #[test]
    fn any_method_route() {
        let table = table(vec![route("/ping", "node.ping", "/")]);
        assert!(table.resolve("/ping", &Method::Get).is_some());
        assert!(table.resolve("/ping", &Method::Patch).is_some());
    }

    #[test]
    fn retain_drops_routes_of_a_handler() {
        let mut table = table(vec![
            route("/a", "a", "/one"),
            route("/b", "b", "/two"),
        ]);
        table.retain(|r| r.handler_path() != "/one");
        assert_eq!(table.len(), 1);
        assert!(table.resolve("/one/a", &Method::Get).is_none());
        assert!(table.resolve("/two/b", &Method::Get).is_some());
    }

    #[test]
    fn chain_target_reports_its_action() {
        let target = RouteTarget::Chain {
            middlewares: Vec::new(),
            action: Some("math.add".into()),
        };
        assert_eq!(target.action(), Some("math.add"));
        assert!(target.middlewares().is_empty());
        assert_eq!(RouteTarget::from("x").middlewares().len(), 0);
    }
}
