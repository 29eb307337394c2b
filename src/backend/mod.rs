//! The backend collaborator: where named actions are resolved and executed.
//!
//! The gateway never executes actions itself. It asks a [`Backend`] to resolve an
//! action name into an [`Endpoint`], then to call that endpoint with the merged request
//! parameters. How the call travels (in-process, over a message bus, across the
//! network) is the backend's business.
//!
//! [`LocalBackend`] is an in-process registry satisfying the contract. It is what the
//! tests use and is enough to front a set of Rust functions with HTTP routes.
//!
//! ```
//! use rpcgate::backend::{ActionDef, LocalBackend, Payload, Service, action_fn};
//! use serde_json::json;
//!
//! let backend = LocalBackend::new().service(
//!     Service::new("greeter").action(ActionDef::new(
//!         "hello",
//!         action_fn(|params, _meta| {
//!             let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("world");
//!             Ok(Payload::Json(json!(format!("Hello, {name}!"))))
//!         }),
//!     )),
//! );
//! # let _ = backend;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncRead;

use crate::context::{Params, ResponseMeta};
use crate::error::GatewayError;
use crate::middleware::BoxFuture;

/// Who may call an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Callable from anywhere and eligible for generated routes.
    Published,
    /// Callable from anywhere.
    Public,
    /// Callable by other services only.
    Protected,
    /// Never reachable through the gateway.
    Private,
}

/// A resolved, invocable action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    action: String,
    visibility: Option<Visibility>,
}

impl Endpoint {
    pub fn new(action: impl Into<String>, visibility: Option<Visibility>) -> Self {
        Self {
            action: action.into(),
            visibility,
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn visibility(&self) -> Option<Visibility> {
        self.visibility
    }

    pub fn is_private(&self) -> bool {
        self.visibility == Some(Visibility::Private)
    }
}

/// Catalog entry describing one action, used to generate routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionInfo {
    /// Owning service name.
    pub service: String,
    /// Fully qualified action name (`service.action`).
    pub name: String,
    pub visibility: Option<Visibility>,
    /// REST annotation of the action, e.g. `"GET /add"`.
    pub rest: Option<String>,
    /// REST base of the owning service. `None` means `/<service>`.
    pub service_rest: Option<String>,
}

/// The value an action returns.
pub enum Payload {
    /// No body.
    Empty,
    /// A JSON value. Scalars are sent raw when a content type was set, JSON otherwise.
    Json(Value),
    /// Binary data, sent as `application/octet-stream` unless overridden.
    Bytes(Bytes),
    /// Streamed binary data, piped to the client without buffering.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl Payload {
    /// Folds the JSON shapes that have a more specific meaning into their variants:
    /// `null` becomes [`Payload::Empty`] and a serialized buffer
    /// (`{"type": "Buffer", "data": [..]}`) becomes [`Payload::Bytes`].
    #[must_use]
    pub fn normalize(self) -> Self {
        match self {
            Payload::Json(Value::Null) => Payload::Empty,
            Payload::Json(value) => match buffer_bytes(&value) {
                Some(bytes) => Payload::Bytes(bytes),
                None => Payload::Json(value),
            },
            other => other,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Empty => f.write_str("Empty"),
            Payload::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Payload::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Payload::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

fn buffer_bytes(value: &Value) -> Option<Bytes> {
    let object = value.as_object()?;
    if object.get("type")?.as_str()? != "Buffer" {
        return None;
    }
    object
        .get("data")?
        .as_array()?
        .iter()
        .map(|byte| byte.as_u64().and_then(|b| u8::try_from(b).ok()))
        .collect::<Option<Vec<u8>>>()
        .map(Bytes::from)
}

/// Everything a backend needs to execute one call.
pub struct ActionCall<'a> {
    pub endpoint: &'a Endpoint,
    pub params: &'a Params,
    /// Correlation id of the inbound request, when one was supplied.
    pub request_id: Option<&'a str>,
    /// Response metadata the action may set (status, headers, content type).
    pub meta: &'a mut ResponseMeta,
}

/// The contract the gateway needs from the action registry / RPC transport.
pub trait Backend: Send + Sync {
    /// Resolves an action name. `None` when no such action exists.
    fn resolve(&self, action: &str) -> Option<Endpoint>;

    /// Invokes a resolved endpoint.
    ///
    /// The gateway never retries a failed call and has no way to cancel one.
    fn call<'a>(&'a self, call: ActionCall<'a>) -> BoxFuture<'a, Result<Payload, GatewayError>>;

    /// Lists the actions known to the backend, for route generation.
    fn catalog(&self) -> Vec<ActionInfo> {
        Vec::new()
    }
}

/// An action implementation registered in a [`LocalBackend`].
pub trait ActionHandler: Send + Sync {
    fn call<'a>(&'a self, call: ActionCall<'a>) -> BoxFuture<'a, Result<Payload, GatewayError>>;
}

/// Wraps a synchronous closure as an [`ActionHandler`].
pub fn action_fn<F>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(&Params, &mut ResponseMeta) -> Result<Payload, GatewayError> + Send + Sync + 'static,
{
    Arc::new(FnAction(f))
}

struct FnAction<F>(F);

impl<F> ActionHandler for FnAction<F>
where
    F: Fn(&Params, &mut ResponseMeta) -> Result<Payload, GatewayError> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, call: ActionCall<'a>) -> BoxFuture<'a, Result<Payload, GatewayError>> {
        let result = (self.0)(call.params, call.meta);
        Box::pin(async move { result })
    }
}

/// One action of a [`Service`].
pub struct ActionDef {
    name: String,
    handler: Arc<dyn ActionHandler>,
    visibility: Option<Visibility>,
    rest: Option<String>,
}

impl ActionDef {
    pub fn new(name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            visibility: None,
            rest: None,
        }
    }

    #[must_use]
    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    /// REST annotation used for generated routes, e.g. `"GET /add"`.
    #[must_use]
    pub fn rest(mut self, rest: impl Into<String>) -> Self {
        self.rest = Some(rest.into());
        self
    }
}

/// A named group of actions.
pub struct Service {
    name: String,
    rest: Option<String>,
    actions: Vec<ActionDef>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rest: None,
            actions: Vec::new(),
        }
    }

    /// Overrides the base path of generated routes (default `/<name>`).
    #[must_use]
    pub fn rest(mut self, base: impl Into<String>) -> Self {
        self.rest = Some(base.into());
        self
    }

    #[must_use]
    pub fn action(mut self, action: ActionDef) -> Self {
        self.actions.push(action);
        self
    }
}

struct LocalAction {
    handler: Arc<dyn ActionHandler>,
    info: ActionInfo,
}

/// In-process backend: a map from `service.action` to its handler.
#[derive(Default)]
pub struct LocalBackend {
    actions: HashMap<String, LocalAction>,
    order: Vec<String>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every action of `service` as `<service>.<action>`. Registering an
    /// existing name replaces it.
    #[must_use]
    pub fn service(mut self, service: Service) -> Self {
        for action in service.actions {
            let name = format!("{}.{}", service.name, action.name);
            let info = ActionInfo {
                service: service.name.clone(),
                name: name.clone(),
                visibility: action.visibility,
                rest: action.rest,
                service_rest: service.rest.clone(),
            };
            let previous = self.actions.insert(
                name.clone(),
                LocalAction {
                    handler: action.handler,
                    info,
                },
            );
            if previous.is_none() {
                self.order.push(name);
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Backend for LocalBackend {
    fn resolve(&self, action: &str) -> Option<Endpoint> {
        self.actions
            .get(action)
            .map(|local| Endpoint::new(action, local.info.visibility))
    }

    fn call<'a>(&'a self, call: ActionCall<'a>) -> BoxFuture<'a, Result<Payload, GatewayError>> {
        match self.actions.get(call.endpoint.action()) {
            Some(local) => local.handler.call(call),
            None => {
                let action = call.endpoint.action().to_owned();
                Box::pin(async move { Err(GatewayError::ActionNotFound { action }) })
            }
        }
    }

    fn catalog(&self) -> Vec<ActionInfo> {
        self.order
            .iter()
            .filter_map(|name| self.actions.get(name))
            .map(|local| local.info.clone())
            .collect()
    }
}
