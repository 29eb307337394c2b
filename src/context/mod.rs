//! Per-request state carried through the dispatch pipeline.
//!
//! A [`RequestContext`] is created when a request enters the gateway and dropped once
//! its response is written. Middlewares, hooks and route functions all receive it by
//! `&mut`, so whatever one stage records (parsed body, merged parameters, response
//! metadata, typed extensions) is visible to the next.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use serde_json::Value;
use tokio::time::Instant;

use crate::backend::{ActionCall, Endpoint};
use crate::http::{Headers, Request, StatusCode};
use crate::router::Route;
use crate::router::pattern::{ParamValue, PathParams};

/// Request parameters, as handed to backend actions.
pub type Params = serde_json::Map<String, Value>;

/// Type-erased map used to pass typed state between middlewares, hooks and route
/// functions without them knowing about each other.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Response metadata an action (or hook) may set while handling a request.
///
/// Applied by the response serializer: `status` and `status_message` replace the
/// defaults, `headers` are copied onto the response, and a `Content-Type` entry in
/// `headers` (or `content_type`) replaces the computed content type.
#[derive(Debug, Clone, Default)]
pub struct ResponseMeta {
    pub status: Option<StatusCode>,
    pub status_message: Option<String>,
    pub content_type: Option<String>,
    pub headers: Headers,
}

impl ResponseMeta {
    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        self.status = Some(status);
        self
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) -> &mut Self {
        self.status_message = Some(message.into());
        self
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) -> &mut Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.set(name, value);
        self
    }
}

/// State of one request as it moves through the pipeline.
pub struct RequestContext {
    request: Request,
    path: String,
    query: Params,
    body: Option<Params>,
    params: Params,
    route: Option<Arc<Route>>,
    handler_path: Option<String>,
    action: Option<String>,
    endpoint: Option<Endpoint>,
    request_id: Option<String>,
    started: Instant,
    meta: ResponseMeta,
    response_headers: Headers,
    extensions: Extensions,
}

impl RequestContext {
    /// Creates the context for `request`, decoding its query string and recording
    /// the start time.
    pub fn new(request: Request) -> Self {
        let path = normalize_request_path(request.path()).to_owned();
        let query = query_params(&request);
        let request_id = request
            .headers()
            .get("x-request-id")
            .map(str::to_owned)
            .filter(|id| !id.is_empty());

        Self {
            request,
            path,
            query,
            body: None,
            params: Params::new(),
            route: None,
            handler_path: None,
            action: None,
            endpoint: None,
            request_id,
            started: Instant::now(),
            meta: ResponseMeta::default(),
            response_headers: Headers::new(),
            extensions: Extensions::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The request path without query string or trailing slash (`/` stays `/`).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Decoded query-string parameters. Repeated keys collect into an array.
    pub fn query(&self) -> &Params {
        &self.query
    }

    /// Parameters decoded from the request body by a body parser, if any ran.
    pub fn body(&self) -> Option<&Params> {
        self.body.as_ref()
    }

    pub fn set_body(&mut self, body: Params) {
        self.body = Some(body);
    }

    /// Merged parameters passed to the action: body, then query, then route params,
    /// later sources overriding earlier ones.
    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    /// Rebuilds [`params`](Self::params) from the body and the query string.
    pub(crate) fn merge_params(&mut self) {
        let mut params = self.body.clone().unwrap_or_default();
        params.extend(self.query.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.params = params;
    }

    /// Overlays route parameters on the merged parameters.
    pub(crate) fn merge_route_params(&mut self, route_params: &PathParams) {
        for (key, value) in route_params.iter() {
            let value = match value {
                ParamValue::One(v) => Value::String(v.clone()),
                ParamValue::Many(vs) => Value::Array(vs.iter().cloned().map(Value::String).collect()),
            };
            self.params.insert(key.to_owned(), value);
        }
    }

    /// The alias route that matched, if the request was routed through one.
    pub fn route(&self) -> Option<&Arc<Route>> {
        self.route.as_ref()
    }

    pub(crate) fn set_route(&mut self, route: Arc<Route>) {
        self.route = Some(route);
    }

    /// Mount path of the handler serving the request.
    pub fn handler_path(&self) -> Option<&str> {
        self.handler_path.as_deref()
    }

    pub(crate) fn set_handler_path(&mut self, path: &str) {
        self.handler_path = Some(path.to_owned());
    }

    /// The action this request will call, once known.
    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub(crate) fn set_action(&mut self, action: impl Into<String>) {
        self.action = Some(action.into());
    }

    /// The resolved backend endpoint, once known.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub(crate) fn set_endpoint(&mut self, endpoint: Endpoint) {
        self.endpoint = Some(endpoint);
    }

    /// Assembles the backend call for `endpoint` from the merged parameters, the
    /// correlation id and the response metadata.
    pub(crate) fn action_call<'a>(&'a mut self, endpoint: &'a Endpoint) -> ActionCall<'a> {
        ActionCall {
            endpoint,
            params: &self.params,
            request_id: self.request_id.as_deref(),
            meta: &mut self.meta,
        }
    }

    /// Correlation id taken from the inbound `X-Request-Id` header.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn meta(&self) -> &ResponseMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut ResponseMeta {
        &mut self.meta
    }

    /// Headers written by the pipeline itself (CORS, rate limiting, correlation id).
    /// They are sent with every response for this request, error responses included.
    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    pub fn response_headers_mut(&mut self) -> &mut Headers {
        &mut self.response_headers
    }

    /// Borrows the request alongside the pipeline response headers, for stages that
    /// read one while writing the other.
    pub fn request_and_headers(&mut self) -> (&Request, &mut Headers) {
        (&self.request, &mut self.response_headers)
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Deserializes the raw request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }
}

/// Strips one trailing slash, keeping the root path intact.
pub fn normalize_request_path(path: &str) -> &str {
    if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

fn query_params(request: &Request) -> Params {
    let mut params = Params::new();
    for (key, value) in request.query_pairs() {
        insert_repeated(&mut params, key, Value::String(value));
    }
    params
}

/// Inserts `value` under `key`, turning repeated keys into arrays.
pub(crate) fn insert_repeated(params: &mut Params, key: String, value: Value) {
    match params.get_mut(&key) {
        Some(Value::Array(values)) => values.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            params.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(raw: &str) -> RequestContext {
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        RequestContext::new(request)
    }

    #[test]
    fn path_is_normalized() {
        assert_eq!(context("GET /api/math/ HTTP/1.1\r\n\r\n").path(), "/api/math");
        assert_eq!(context("GET / HTTP/1.1\r\n\r\n").path(), "/");
        assert_eq!(context("GET /a?x=1 HTTP/1.1\r\n\r\n").path(), "/a");
    }

    #[test]
    fn repeated_query_keys_become_arrays() {
        let ctx = context("GET /a?tag=x&tag=y&tag=z&p=1 HTTP/1.1\r\n\r\n");
        assert_eq!(ctx.query().get("tag"), Some(&json!(["x", "y", "z"])));
        assert_eq!(ctx.query().get("p"), Some(&json!("1")));
    }

    #[test]
    fn merge_order_is_body_query_route() {
        let mut ctx = context("POST /u/7?a=query&b=query HTTP/1.1\r\n\r\n");
        let mut body = Params::new();
        body.insert("a".into(), json!("body"));
        body.insert("b".into(), json!("body"));
        body.insert("c".into(), json!("body"));
        ctx.set_body(body);
        ctx.merge_params();

        let mut route = PathParams::new();
        route.insert("b", "route");
        route.insert("parts", vec!["x", "y"]);
        ctx.merge_route_params(&route);

        assert_eq!(
            Value::Object(ctx.params().clone()),
            json!({ "a": "query", "b": "route", "c": "body", "parts": ["x", "y"] })
        );
    }

    #[test]
    fn request_id_comes_from_header() {
        let ctx = context("GET / HTTP/1.1\r\nX-Request-Id: abc-123\r\n\r\n");
        assert_eq!(ctx.request_id(), Some("abc-123"));
        assert_eq!(context("GET / HTTP/1.1\r\n\r\n").request_id(), None);
    }

    #[test]
    fn extensions_are_typed() {
        #[derive(Debug, PartialEq)]
        struct User(&'static str);

        let mut ctx = context("GET / HTTP/1.1\r\n\r\n");
        assert!(ctx.extensions_mut().insert(User("ada")).is_none());
        assert_eq!(ctx.extensions().get::<User>(), Some(&User("ada")));
        assert_eq!(ctx.extensions_mut().insert(User("bob")), Some(User("ada")));
        assert_eq!(ctx.extensions_mut().remove::<User>(), Some(User("bob")));
        assert!(ctx.extensions().get::<u32>().is_none());
    }

    #[test]
    fn response_meta_setters_chain() {
        let mut meta = ResponseMeta::default();
        meta.set_status(StatusCode::CREATED)
            .set_header("X-Cache", "miss")
            .set_content_type("text/csv");
        assert_eq!(meta.status, Some(StatusCode::CREATED));
        assert_eq!(meta.headers.get("x-cache"), Some("miss"));
        assert_eq!(meta.content_type.as_deref(), Some("text/csv"));
    }
}
