//! The gateway: handler registry, route table and request dispatch.
//!
//! A [`Gateway`] owns an immutable [`Topology`] (handlers plus alias routes) published
//! through [`ArcSwap`]. Requests load the current topology once and run against it,
//! so registering a handler or regenerating routes never blocks in-flight requests.
//!
//! Dispatch order for one request:
//!
//! 1. Look the path up in the route table. A hit runs the handler the route belongs to.
//! 2. Otherwise the first handler (most specific mount first) whose mount path covers
//!    the request path handles it.
//! 3. If nothing produced a response, static files are tried, then `404 Not found`.
//!
//! Every error from any stage goes through one exit that consults the handler's
//! `request_failed` hook, then the gateway's, then renders the default JSON body.

pub mod hooks;
pub mod serialize;

mod handler;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, error, info, trace, warn};

use crate::assets::{AssetFolder, StaticFiles};
use crate::backend::{Backend, Visibility};
use crate::config::{GatewaySettings, LogLevel};
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::http::{Method, Request, Response, StatusCode};
use crate::middleware::SharedMiddleware;
use crate::router::{
    Route, RouteTable, RouteTarget, add_slashes, normalize_path, parse_definition,
    specificity_order,
};
use crate::server::{Server, ServerError};

pub use handler::{Handler, HandlerSpec};
pub use hooks::{
    AfterRequest, Authorize, BeforeRequest, HandlerHooks, RequestFailed, after_fn, authorize_fn,
    before_fn, failed_fn,
};

use handler::Shared;
use serialize::{JSON_CONTENT_TYPE, error_body, internal_error, not_found, strip_body};

/// Renders the body of an error response. The body is sent as JSON unless
/// [`GatewayBuilder::error_content_type`] says otherwise.
pub type ErrorFormatter = Arc<dyn Fn(StatusCode, &GatewayError) -> String + Send + Sync>;

/// Picks a status for errors that do not carry one.
pub type StatusMapper = Arc<dyn Fn(&GatewayError) -> Option<StatusCode> + Send + Sync>;

/// Handlers and routes, swapped in together.
#[derive(Clone, Default)]
pub struct Topology {
    handlers: Vec<Arc<Handler>>,
    routes: RouteTable,
}

impl Topology {
    pub fn handlers(&self) -> &[Arc<Handler>] {
        &self.handlers
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    fn handler(&self, path: &str) -> Option<&Arc<Handler>> {
        self.handlers.iter().find(|h| h.path() == path)
    }
}

/// Assembles a [`Gateway`].
///
/// ```
/// use std::sync::Arc;
/// use rpcgate::backend::LocalBackend;
/// use rpcgate::config::GatewaySettings;
/// use rpcgate::gateway::{GatewayBuilder, HandlerSpec};
///
/// let gateway = GatewayBuilder::new(GatewaySettings::default(), Arc::new(LocalBackend::new()))
///     .handler(HandlerSpec::new("/api").whitelist(["math.*"]))
///     .build()
///     .unwrap();
/// assert_eq!(gateway.topology().handlers().len(), 1);
/// ```
pub struct GatewayBuilder {
    settings: GatewaySettings,
    backend: Arc<dyn Backend>,
    middlewares: Vec<SharedMiddleware>,
    authorize: Option<Arc<dyn Authorize>>,
    request_failed: Option<Arc<dyn RequestFailed>>,
    error_formatter: Option<ErrorFormatter>,
    error_content_type: Option<String>,
    status_mapper: Option<StatusMapper>,
    static_files: Option<Arc<dyn StaticFiles>>,
    specs: Vec<HandlerSpec>,
}

impl GatewayBuilder {
    pub fn new(settings: GatewaySettings, backend: Arc<dyn Backend>) -> Self {
        Self {
            settings,
            backend,
            middlewares: Vec::new(),
            authorize: None,
            request_failed: None,
            error_formatter: None,
            error_content_type: None,
            status_mapper: None,
            static_files: None,
            specs: Vec::new(),
        }
    }

    /// Appends a global middleware, run by every handler before its own.
    #[must_use]
    pub fn middleware(mut self, middleware: SharedMiddleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    #[must_use]
    pub fn authorize(mut self, hook: Arc<dyn Authorize>) -> Self {
        self.authorize = Some(hook);
        self
    }

    /// Gateway-wide failure hook, consulted after the handler's own.
    #[must_use]
    pub fn request_failed(mut self, hook: Arc<dyn RequestFailed>) -> Self {
        self.request_failed = Some(hook);
        self
    }

    #[must_use]
    pub fn error_formatter(mut self, formatter: ErrorFormatter) -> Self {
        self.error_formatter = Some(formatter);
        self
    }

    /// `Content-Type` of bodies produced by the [`error_formatter`](Self::error_formatter).
    #[must_use]
    pub fn error_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.error_content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn status_mapper(mut self, mapper: StatusMapper) -> Self {
        self.status_mapper = Some(mapper);
        self
    }

    /// Replaces the static-file fallback. By default an [`AssetFolder`] is used when
    /// `assets` is configured.
    #[must_use]
    pub fn static_files(mut self, files: Arc<dyn StaticFiles>) -> Self {
        self.static_files = Some(files);
        self
    }

    /// Registers a handler given in code. Handlers from the settings are registered
    /// first.
    #[must_use]
    pub fn handler(mut self, spec: HandlerSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// # Errors
    ///
    /// Fails on an invalid whitelist, CORS origin or route pattern.
    pub fn build(self) -> Result<Gateway, GatewayError> {
        let static_files = self.static_files.or_else(|| {
            self.settings.assets.as_ref().map(|assets| {
                Arc::new(AssetFolder::new(assets.folder.clone()).index(assets.index.clone())) as Arc<dyn StaticFiles>
            })
        });

        let from_settings: Vec<HandlerSpec> = self
            .settings
            .handlers
            .iter()
            .cloned()
            .map(HandlerSpec::from_settings)
            .collect();

        let gateway = Gateway {
            shared: Arc::new(Shared {
                settings: self.settings,
                backend: self.backend,
                middlewares: self.middlewares,
                authorize: self.authorize,
            }),
            topology: ArcSwap::from_pointee(Topology::default()),
            request_failed: self.request_failed,
            error_formatter: self.error_formatter,
            error_content_type: self
                .error_content_type
                .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned()),
            status_mapper: self.status_mapper,
            static_files,
        };

        for spec in from_settings.into_iter().chain(self.specs) {
            gateway.add_handler(spec)?;
        }
        Ok(gateway)
    }
}

/// Dispatches HTTP requests to backend actions.
pub struct Gateway {
    shared: Arc<Shared>,
    topology: ArcSwap<Topology>,
    request_failed: Option<Arc<dyn RequestFailed>>,
    error_formatter: Option<ErrorFormatter>,
    error_content_type: String,
    status_mapper: Option<StatusMapper>,
    static_files: Option<Arc<dyn StaticFiles>>,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topology = self.topology.load();
        f.debug_struct("Gateway")
            .field(
                "handlers",
                &topology.handlers.iter().map(|h| h.path()).collect::<Vec<_>>(),
            )
            .field("routes", &topology.routes.len())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn builder(settings: GatewaySettings, backend: Arc<dyn Backend>) -> GatewayBuilder {
        GatewayBuilder::new(settings, backend)
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.shared.settings
    }

    /// Snapshot of the current handlers and routes.
    pub fn topology(&self) -> Arc<Topology> {
        self.topology.load_full()
    }

    /// Compiles and registers a handler.
    ///
    /// A handler already mounted on the same path is replaced, and its routes with it.
    ///
    /// # Errors
    ///
    /// Fails on an invalid whitelist, CORS origin or route pattern; the current
    /// topology is left untouched.
    pub fn add_handler(&self, spec: HandlerSpec) -> Result<(), GatewayError> {
        let (handler, mut routes) = Handler::build(spec, &self.shared)?;
        if handler.generates_auto_routes() {
            routes.extend(self.generate_routes(handler.path())?);
        }
        let handler = Arc::new(handler);
        let auto_order = self.shared.settings.auto_order_routes;

        self.topology.rcu(|current| {
            let mut next = Topology::clone(current);
            match next.handlers.iter().position(|h| h.path() == handler.path()) {
                Some(index) => next.handlers[index] = Arc::clone(&handler),
                None => next.handlers.push(Arc::clone(&handler)),
            }
            next.routes.retain(|route| route.handler_path() != handler.path());
            next.routes.extend(routes.iter().cloned());
            if auto_order {
                next.handlers
                    .sort_by(|a, b| specificity_order(a.path(), b.path()));
                next.routes.sort();
            }
            next
        });

        info!(
            handler = %handler.path(),
            routes = routes.len(),
            "handler registered"
        );
        Ok(())
    }

    /// Routes derived from the backend catalog for the handler mounted at
    /// `handler_path`.
    fn generate_routes(&self, handler_path: &str) -> Result<Vec<Arc<Route>>, GatewayError> {
        let mut routes = Vec::new();
        for info in self.shared.backend.catalog() {
            if info
                .visibility
                .is_some_and(|visibility| visibility != Visibility::Published)
            {
                continue;
            }
            let Some(rest) = info.rest.as_deref() else {
                continue;
            };

            let base = info
                .service_rest
                .clone()
                .unwrap_or_else(|| add_slashes(&info.service));
            let (method, path) = parse_definition(rest);
            let path = normalize_path(&format!("{base}/{path}"));
            let definition = match method {
                Some(method) => format!("{method} {path}"),
                None => path,
            };

            let route = Route::new(&definition, RouteTarget::Action(info.name.clone()), handler_path)
                .map_err(|source| GatewayError::InvalidRoute {
                    route: definition.clone(),
                    source,
                })?;
            trace!(route = %definition, action = %info.name, "generated route");
            routes.push(Arc::new(route.generated()));
        }
        Ok(routes)
    }

    /// Rebuilds the generated routes of every handler that asked for them, e.g. after
    /// the backend's set of actions changed. Configured routes are kept.
    ///
    /// # Errors
    ///
    /// Fails if a catalog `rest` annotation does not compile; nothing is replaced then.
    pub fn regenerate_auto_routes(&self) -> Result<(), GatewayError> {
        let current = self.topology.load_full();
        let mut generated = Vec::new();
        for handler in current.handlers.iter().filter(|h| h.generates_auto_routes()) {
            generated.push((handler.path().to_owned(), self.generate_routes(handler.path())?));
        }
        if generated.is_empty() {
            return Ok(());
        }
        let auto_order = self.shared.settings.auto_order_routes;

        self.topology.rcu(|current| {
            let mut next = Topology::clone(current);
            for (path, routes) in &generated {
                next.routes
                    .retain(|route| !(route.is_generated() && route.handler_path() == path.as_str()));
                next.routes.extend(routes.iter().cloned());
            }
            if auto_order {
                next.routes.sort();
            }
            next
        });

        debug!(handlers = generated.len(), "auto routes regenerated");
        Ok(())
    }

    /// Runs one request through the gateway. Never fails: errors become error
    /// responses.
    pub async fn dispatch(&self, request: Request) -> Response {
        let keep_alive = request.is_keep_alive();
        let mut ctx = RequestContext::new(request);
        let level = self.shared.settings.request_log_level;
        log_at(
            level,
            &format!("=> {} {}", ctx.request().method(), ctx.request().url()),
        );

        let topology = self.topology.load_full();
        let mut response = match self.route(&topology, &mut ctx).await {
            Ok(Some(response)) => response,
            Ok(None) => self.fallback(&ctx).await,
            Err(error) => self.fail(&topology, &mut ctx, error).await,
        };

        response.headers_mut().merge(ctx.response_headers());
        if let Some(id) = ctx.request_id() {
            response.headers_mut().set("X-Request-Id", id);
        }

        log_at(
            level,
            &format!(
                "<= {} {} {} {}",
                response.status().as_u16(),
                ctx.request().method(),
                ctx.request().url(),
                format_duration(ctx.elapsed()),
            ),
        );
        response.keep_alive(keep_alive)
    }

    async fn route(
        &self,
        topology: &Topology,
        ctx: &mut RequestContext,
    ) -> Result<Option<Response>, GatewayError> {
        if let Some(matched) = topology.routes.resolve(ctx.path(), ctx.request().method()) {
            return match topology.handler(matched.route.handler_path()) {
                Some(handler) => handler.handle(ctx, Some(matched)).await,
                None => Ok(None),
            };
        }

        match topology.handlers.iter().find(|h| h.mounts(ctx.path())) {
            Some(handler) => handler.handle(ctx, None).await,
            None => Ok(None),
        }
    }

    async fn fallback(&self, ctx: &RequestContext) -> Response {
        if let Some(files) = &self.static_files {
            if let Some(response) = files.serve(ctx.request()).await {
                return response;
            }
        }
        let mut response = not_found();
        if *ctx.request().method() == Method::Head {
            strip_body(&mut response);
        }
        response
    }

    /// The single error exit.
    async fn fail(
        &self,
        topology: &Topology,
        ctx: &mut RequestContext,
        error: GatewayError,
    ) -> Response {
        debug!(error = %error, action = ?ctx.action(), "request failed");

        let handler_hook = ctx
            .handler_path()
            .and_then(|path| topology.handler(path))
            .and_then(|handler| handler.hooks().request_failed.clone());

        let mut error = error;
        for hook in [handler_hook, self.request_failed.clone()].into_iter().flatten() {
            let outcome = hook.failed(ctx, &error).await;
            match outcome {
                Ok(Some(response)) => return response,
                Ok(None) => {}
                Err(replaced) => {
                    warn!(error = %replaced, "request_failed hook failed");
                    error = replaced;
                    break;
                }
            }
        }

        let mut response = self.error_response(&error);
        if *ctx.request().method() == Method::Head {
            strip_body(&mut response);
        }
        response
    }

    /// Status of an error response: the error's own, then the status mapper, then 500.
    pub fn status_for(&self, error: &GatewayError) -> StatusCode {
        error
            .status()
            .or_else(|| self.status_mapper.as_ref().and_then(|mapper| mapper(error)))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self, error: &GatewayError) -> Response {
        let status = self.status_for(error);
        let body = match &self.error_formatter {
            Some(format) => Ok((format(status, error), self.error_content_type.as_str())),
            None => error_body(status, error).map(|body| (body, JSON_CONTENT_TYPE)),
        };
        match body {
            Ok((body, content_type)) => Response::new(status)
                .header("Content-Type", content_type)
                .body(body),
            Err(e) => {
                error!(error = %e, "failed to render error body");
                internal_error()
            }
        }
    }

    /// Serves the gateway on an already bound server until it is shut down.
    ///
    /// # Errors
    ///
    /// Returns the server's error if the listener fails.
    pub async fn serve(self: Arc<Self>, server: Server) -> Result<(), ServerError> {
        server
            .run(move |request| {
                let gateway = Arc::clone(&self);
                async move { gateway.dispatch(request).await }
            })
            .await
    }

    /// Binds to the configured `ip`/`port` and serves.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound or the listener fails.
    pub async fn listen(self: Arc<Self>) -> Result<(), ServerError> {
        let server = Server::bind(self.shared.settings.bind_addr()).await?;
        self.serve(server).await
    }
}

fn log_at(level: LogLevel, line: &str) {
    match level {
        LogLevel::Trace => trace!("{line}"),
        LogLevel::Debug => debug!("{line}"),
        LogLevel::Info => info!("{line}"),
    }
}

/// `[12.345 ms]`, or `[1.234 s]` above one second.
fn format_duration(elapsed: Duration) -> String {
    let ms = elapsed.as_secs_f64() * 1000.0;
    if ms > 1000.0 {
        format!("[{:.3} s]", ms / 1000.0)
    } else {
        format!("[{ms:.3} ms]")
    }
}
