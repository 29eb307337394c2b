//! Handlers: everything scoped to one mount path, and the request pipeline they run.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::backend::{Backend, Payload};
use crate::config::{GatewaySettings, HandlerSettings, MappingPolicy, merged, mount_path};
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::http::{Response, StatusCode};
use crate::middleware::{Flow, JsonBodyParser, SharedMiddleware, UrlEncodedBodyParser, run_chain};
use crate::router::{Route, RouteMatch, RouteTarget};
use crate::security::{
    Cors, CorsPolicy, KeyExtractor, MemoryStore, RateLimitPolicy, RateLimitStore, RateLimiter,
    Whitelist, client_key,
};

use super::hooks::{AfterRequest, Authorize, BeforeRequest, HandlerHooks, RequestFailed};
use super::serialize::payload_response;

/// Gateway-wide pieces every handler needs while running a request.
pub(crate) struct Shared {
    pub(crate) settings: GatewaySettings,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) middlewares: Vec<SharedMiddleware>,
    pub(crate) authorize: Option<Arc<dyn Authorize>>,
}

/// Declarative description of a handler: its settings plus the pieces that can only be
/// given in code.
///
/// ```
/// use rpcgate::config::MappingPolicy;
/// use rpcgate::gateway::HandlerSpec;
/// use rpcgate::middleware::{Flow, from_fn};
///
/// let spec = HandlerSpec::new("/api")
///     .whitelist(["math.*"])
///     .mapping_policy(MappingPolicy::Restricted)
///     .route("GET /add/:a/:b", "math.add")
///     .middleware(from_fn(|_ctx| Ok(Flow::Next)))
///     .json_body_parser();
/// # let _ = spec;
/// ```
pub struct HandlerSpec {
    settings: HandlerSettings,
    middlewares: Vec<SharedMiddleware>,
    routes: Vec<(String, RouteTarget)>,
    hooks: HandlerHooks,
    store: Option<Arc<dyn RateLimitStore>>,
    key: Option<KeyExtractor>,
}

impl HandlerSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self::from_settings(HandlerSettings::new(path))
    }

    pub fn from_settings(settings: HandlerSettings) -> Self {
        Self {
            settings,
            middlewares: Vec::new(),
            routes: Vec::new(),
            hooks: HandlerHooks::default(),
            store: None,
            key: None,
        }
    }

    pub fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    #[must_use]
    pub fn whitelist<I, S>(mut self, masks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.whitelist = Some(masks.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn mapping_policy(mut self, policy: MappingPolicy) -> Self {
        self.settings.mapping_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn cors(mut self, policy: CorsPolicy) -> Self {
        self.settings.cors = Some(policy);
        self
    }

    #[must_use]
    pub fn rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.settings.rate_limit = Some(policy);
        self
    }

    /// Replaces the in-memory counter store, e.g. with a shared one.
    #[must_use]
    pub fn rate_limit_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the default client key ([`client_key`]).
    #[must_use]
    pub fn rate_limit_key(mut self, key: KeyExtractor) -> Self {
        self.key = Some(key);
        self
    }

    /// Adds an alias route. `target` is an action name or a [`RouteTarget::Chain`].
    #[must_use]
    pub fn route(mut self, definition: impl Into<String>, target: impl Into<RouteTarget>) -> Self {
        self.routes.push((definition.into(), target.into()));
        self
    }

    /// Appends a handler middleware. Handler middlewares run after the global ones.
    #[must_use]
    pub fn middleware(mut self, middleware: SharedMiddleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    #[must_use]
    pub fn authorization(mut self, enabled: bool) -> Self {
        self.settings.authorization = enabled;
        self
    }

    #[must_use]
    pub fn json_body_parser(mut self) -> Self {
        self.settings.body_parsers.json = true;
        self
    }

    #[must_use]
    pub fn urlencoded_body_parser(mut self) -> Self {
        self.settings.body_parsers.urlencoded = true;
        self
    }

    #[must_use]
    pub fn generate_auto_routes(mut self) -> Self {
        self.settings.generate_auto_routes = true;
        self
    }

    #[must_use]
    pub fn before_request(mut self, hook: Arc<dyn BeforeRequest>) -> Self {
        self.hooks.before_request = Some(hook);
        self
    }

    #[must_use]
    pub fn after_request(mut self, hook: Arc<dyn AfterRequest>) -> Self {
        self.hooks.after_request = Some(hook);
        self
    }

    #[must_use]
    pub fn request_failed(mut self, hook: Arc<dyn RequestFailed>) -> Self {
        self.hooks.request_failed = Some(hook);
        self
    }
}

/// A compiled handler.
pub struct Handler {
    path: String,
    middlewares: Vec<SharedMiddleware>,
    whitelist: Option<Whitelist>,
    mapping_policy: MappingPolicy,
    cors: Option<Cors>,
    rate_limiter: Option<RateLimiter>,
    authorization: bool,
    hooks: HandlerHooks,
    auto_routes: bool,
    shared: Arc<Shared>,
}

impl Handler {
    /// Compiles `spec` against the gateway-wide settings, returning the handler and its
    /// alias routes.
    pub(crate) fn build(
        spec: HandlerSpec,
        shared: &Arc<Shared>,
    ) -> Result<(Self, Vec<Arc<Route>>), GatewayError> {
        let HandlerSpec {
            settings,
            middlewares: handler_middlewares,
            routes: code_routes,
            hooks,
            store,
            key,
        } = spec;
        let global = &shared.settings;
        let path = mount_path(&global.path, &settings.path);

        let whitelist = settings
            .whitelist
            .as_deref()
            .map(|masks| Whitelist::new(masks))
            .transpose()
            .map_err(|e| GatewayError::Internal(format!("handler '{path}': invalid whitelist: {e}")))?;

        let cors = merged(global.cors.as_ref(), settings.cors.as_ref(), CorsPolicy::merge)
            .map(|policy| policy.compile())
            .transpose()
            .map_err(|e| GatewayError::Internal(format!("handler '{path}': invalid CORS origin: {e}")))?;

        let rate_limiter = merged(
            global.rate_limit.as_ref(),
            settings.rate_limit.as_ref(),
            RateLimitPolicy::merge,
        )
        .map(|policy| {
            let limits = policy.resolve();
            let store = store.unwrap_or_else(|| MemoryStore::spawn(limits.window));
            let key = key.unwrap_or_else(|| Arc::new(client_key));
            RateLimiter::new(limits, store, key)
        });

        let authorization = if settings.authorization && shared.authorize.is_none() {
            warn!(handler = %path, "authorization requested but no authorize hook is installed; running without it");
            false
        } else {
            settings.authorization
        };

        let mut middlewares = handler_middlewares;
        if settings.body_parsers.json {
            middlewares.push(Arc::new(JsonBodyParser));
        }
        if settings.body_parsers.urlencoded {
            middlewares.push(Arc::new(UrlEncodedBodyParser));
        }
        debug!(handler = %path, middlewares = middlewares.len(), "handler compiled");

        let definitions = settings
            .routes
            .iter()
            .map(|(definition, action)| (definition.clone(), RouteTarget::Action(action.clone())))
            .chain(code_routes);
        let mut routes = Vec::new();
        for (definition, target) in definitions {
            let route = Route::new(&definition, target, &path).map_err(|source| {
                GatewayError::InvalidRoute {
                    route: definition.clone(),
                    source,
                }
            })?;
            routes.push(Arc::new(route));
        }

        let handler = Self {
            path,
            middlewares,
            whitelist,
            mapping_policy: settings.mapping_policy.unwrap_or(global.mapping_policy),
            cors,
            rate_limiter,
            authorization,
            hooks,
            auto_routes: settings.generate_auto_routes,
            shared: Arc::clone(shared),
        };
        Ok((handler, routes))
    }

    /// Normalized mount path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mapping_policy(&self) -> MappingPolicy {
        self.mapping_policy
    }

    pub fn hooks(&self) -> &HandlerHooks {
        &self.hooks
    }

    pub fn generates_auto_routes(&self) -> bool {
        self.auto_routes
    }

    /// `true` when `path` is the mount path or below it, on a segment boundary.
    pub fn mounts(&self, path: &str) -> bool {
        if self.path == "/" {
            return true;
        }
        path.strip_prefix(self.path.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    /// Action name derived from the path below the mount point: `/api/math/add` under
    /// `/api` is `math.add`, and a leading `~` becomes the reserved `$` namespace.
    fn implicit_action(&self, path: &str) -> Option<String> {
        let rest = path.strip_prefix(self.path.as_str()).unwrap_or(path);
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        if rest.is_empty() {
            return None;
        }
        Some(rest.replacen('~', "$", 1).replace('/', "."))
    }

    /// Runs the pipeline for one request.
    ///
    /// `Ok(Some(_))` is a complete response, `Ok(None)` means nothing matched and the
    /// caller should fall through to static files or a 404. Any error goes to the
    /// gateway's error exit.
    pub async fn handle(
        &self,
        ctx: &mut RequestContext,
        route: Option<RouteMatch>,
    ) -> Result<Option<Response>, GatewayError> {
        ctx.set_handler_path(&self.path);
        if let Some(matched) = &route {
            ctx.set_route(Arc::clone(&matched.route));
        }

        if let Flow::Respond(response) = run_chain(&self.shared.middlewares, ctx).await? {
            return Ok(Some(response));
        }
        if let Flow::Respond(response) = run_chain(&self.middlewares, ctx).await? {
            return Ok(Some(response));
        }

        if let Some(cors) = &self.cors {
            let preflight = Cors::is_preflight(ctx.request());
            let (request, headers) = ctx.request_and_headers();
            cors.apply(request, headers, preflight)?;
            if preflight {
                return Ok(Some(Response::new(StatusCode::NO_CONTENT)));
            }
        }

        ctx.merge_params();
        let action = match &route {
            Some(matched) => {
                ctx.merge_route_params(&matched.params);
                matched.route.target().action().map(str::to_owned)
            }
            None if self.mapping_policy == MappingPolicy::Restricted => return Ok(None),
            None => match self.implicit_action(ctx.path()) {
                Some(action) => Some(action),
                None => return Ok(None),
            },
        };

        if let Some(action) = &action {
            ctx.set_action(action.as_str());

            if self.whitelist.as_ref().is_some_and(|w| !w.allows(action)) {
                debug!(action = %action, handler = %self.path, "action is not on the whitelist");
                return Err(GatewayError::ActionNotFound {
                    action: action.clone(),
                });
            }
        }

        if let Some(limiter) = &self.rate_limiter {
            let (request, headers) = ctx.request_and_headers();
            limiter.check(request, headers).await?;
        }

        if let Some(action) = &action {
            match self.shared.backend.resolve(action) {
                Some(endpoint) if !endpoint.is_private() => ctx.set_endpoint(endpoint),
                _ => {
                    return Err(GatewayError::ActionNotFound {
                        action: action.clone(),
                    });
                }
            }
        }

        if let Some(hook) = &self.hooks.before_request {
            hook.before(ctx).await?;
        }
        if self.authorization {
            if let Some(authorize) = &self.shared.authorize {
                authorize.authorize(ctx).await?;
            }
        }

        if let Some(matched) = &route {
            if let Flow::Respond(response) =
                run_chain(matched.route.target().middlewares(), ctx).await?
            {
                return Ok(Some(response));
            }
        }

        let payload = match ctx.endpoint().cloned() {
            Some(endpoint) => {
                debug!(action = endpoint.action(), "calling action");
                self.shared
                    .backend
                    .call(ctx.action_call(&endpoint))
                    .await
                    .inspect_err(|e| error!(action = endpoint.action(), error = %e, "action call failed"))?
            }
            None => Payload::Empty,
        };

        let payload = match &self.hooks.after_request {
            Some(hook) => hook.after(ctx, payload).await?,
            None => payload,
        };

        payload_response(ctx.request().method(), ctx.meta(), payload).map(Some)
    }
}
