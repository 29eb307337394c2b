//! Middleware pipeline: ordered request processing ahead of the action call.
//!
//! A middleware receives the [`RequestContext`] by mutable reference and returns a
//! [`Flow`]:
//!
//! - [`Flow::Next`] hands the request to the next middleware.
//! - [`Flow::Respond`] ends the pipeline with the given response; nothing after it
//!   runs, the action included.
//! - `Err(_)` aborts the pipeline and routes the request to the error exit.
//!
//! [`run_chain`] folds a slice of middlewares in order, strictly sequentially. The
//! gateway runs global middlewares, then handler middlewares, then the body parsers
//! enabled for the handler; route-level chains use the same machinery.
//!
//! ## Core types
//!
//! - [`Middleware`] — trait implemented by all middleware.
//! - [`SharedMiddleware`] — the reference-counted form stored in handlers and routes.
//! - [`from_fn`] — adapts a synchronous closure.
//! - [`JsonBodyParser`], [`UrlEncodedBodyParser`] — built-in body decoders.

use std::{future::Future, pin::Pin, sync::Arc};

use serde_json::Value;

use crate::context::{Params, RequestContext, insert_repeated};
use crate::error::{GatewayError, ServiceError};
use crate::http::Response;
use crate::http::request::parse_query_string;

/// A boxed, `Send` future borrowing from its caller for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What the pipeline should do after a middleware returns.
#[derive(Debug)]
pub enum Flow {
    /// Continue with the next stage.
    Next,
    /// Stop and send this response.
    Respond(Response),
}

/// The core trait for all middleware.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync`: one instance serves every request.
/// - The returned future borrows the context; it must not outlive the call.
///
/// # Examples
///
/// ```rust
/// use rpcgate::context::RequestContext;
/// use rpcgate::error::GatewayError;
/// use rpcgate::middleware::{BoxFuture, Flow, Middleware};
///
/// struct Stamp;
///
/// impl Middleware for Stamp {
///     fn handle<'a>(
///         &'a self,
///         ctx: &'a mut RequestContext,
///     ) -> BoxFuture<'a, Result<Flow, GatewayError>> {
///         Box::pin(async move {
///             ctx.response_headers_mut().set("X-Served-By", "rpcgate");
///             Ok(Flow::Next)
///         })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync {
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<Flow, GatewayError>>;
}

/// Reference-counted middleware, cheap to clone into several handlers.
pub type SharedMiddleware = Arc<dyn Middleware>;

/// Runs `middlewares` in order, stopping at the first response or error.
pub async fn run_chain(
    middlewares: &[SharedMiddleware],
    ctx: &mut RequestContext,
) -> Result<Flow, GatewayError> {
    for middleware in middlewares {
        if let Flow::Respond(response) = middleware.handle(ctx).await? {
            return Ok(Flow::Respond(response));
        }
    }
    Ok(Flow::Next)
}

/// Wraps a synchronous closure as a middleware.
///
/// ```rust
/// use rpcgate::middleware::{Flow, from_fn};
///
/// let tag = from_fn(|ctx| {
///     ctx.response_headers_mut().set("X-Handler", "api");
///     Ok(Flow::Next)
/// });
/// ```
pub fn from_fn<F>(f: F) -> SharedMiddleware
where
    F: Fn(&mut RequestContext) -> Result<Flow, GatewayError> + Send + Sync + 'static,
{
    Arc::new(FnMiddleware(f))
}

struct FnMiddleware<F>(F);

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut RequestContext) -> Result<Flow, GatewayError> + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<Flow, GatewayError>> {
        let result = (self.0)(ctx);
        Box::pin(async move { result })
    }
}

// Compares the media type of the request's Content-Type, ignoring parameters.
fn media_type(ctx: &RequestContext) -> Option<String> {
    ctx.request()
        .headers()
        .get("content-type")
        .and_then(|value| value.split(';').next())
        .map(|media| media.trim().to_ascii_lowercase())
}

/// Decodes `application/json` (and `+json`) bodies into the body parameters.
///
/// The body must be a JSON object; anything else is a `400 Bad Request`.
pub struct JsonBodyParser;

impl Middleware for JsonBodyParser {
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<Flow, GatewayError>> {
        Box::pin(async move {
            let is_json = media_type(ctx)
                .is_some_and(|media| media == "application/json" || media.ends_with("+json"));
            if !is_json || ctx.request().body().is_empty() {
                return Ok(Flow::Next);
            }

            let value: Value = serde_json::from_slice(ctx.request().body())
                .map_err(|e| ServiceError::bad_request(format!("Invalid JSON body: {e}")))?;
            match value {
                Value::Object(map) => {
                    ctx.set_body(map);
                    Ok(Flow::Next)
                }
                _ => Err(ServiceError::bad_request("JSON body must be an object").into()),
            }
        })
    }
}

/// Decodes `application/x-www-form-urlencoded` bodies into the body parameters.
///
/// Repeated keys collect into arrays, as they do in the query string.
pub struct UrlEncodedBodyParser;

impl Middleware for UrlEncodedBodyParser {
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<Flow, GatewayError>> {
        Box::pin(async move {
            let is_form = media_type(ctx).is_some_and(|media| media == "application/x-www-form-urlencoded");
            if !is_form || ctx.request().body().is_empty() {
                return Ok(Flow::Next);
            }

            let raw = String::from_utf8_lossy(ctx.request().body()).into_owned();
            let mut body = Params::new();
            for (key, value) in parse_query_string(&raw) {
                insert_repeated(&mut body, key, Value::String(value));
            }
            ctx.set_body(body);
            Ok(Flow::Next)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::http::{Request, StatusCode};

    fn context(raw: &str) -> RequestContext {
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        RequestContext::new(request)
    }

    fn post(content_type: &str, body: &str) -> RequestContext {
        context(&format!(
            "POST /api HTTP/1.1\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ))
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> SharedMiddleware {
        let log = Arc::clone(log);
        from_fn(move |_ctx| {
            log.lock().unwrap().push(name);
            Ok(Flow::Next)
        })
    }

    #[tokio::test]
    async fn chain_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![recorder(&log, "global"), recorder(&log, "handler"), recorder(&log, "parser")];

        let mut ctx = context("GET / HTTP/1.1\r\n\r\n");
        assert!(matches!(run_chain(&chain, &mut ctx).await, Ok(Flow::Next)));
        assert_eq!(*log.lock().unwrap(), vec!["global", "handler", "parser"]);
    }

    #[tokio::test]
    async fn respond_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![
            recorder(&log, "first"),
            from_fn(|_ctx| Ok(Flow::Respond(Response::new(StatusCode::UNAUTHORIZED)))),
            recorder(&log, "never"),
        ];

        let mut ctx = context("GET / HTTP/1.1\r\n\r\n");
        match run_chain(&chain, &mut ctx).await {
            Ok(Flow::Respond(response)) => assert_eq!(response.status(), StatusCode::UNAUTHORIZED),
            other => panic!("expected a response, got {other:?}"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn error_aborts_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![
            from_fn(|_ctx| Err(GatewayError::service("AuthError", 401, "no token"))),
            recorder(&log, "never"),
        ];

        let mut ctx = context("GET / HTTP/1.1\r\n\r\n");
        let err = run_chain(&chain, &mut ctx).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn middleware_state_is_visible_downstream() {
        let chain = vec![
            from_fn(|ctx| {
                ctx.extensions_mut().insert(42u32);
                Ok(Flow::Next)
            }),
            from_fn(|ctx| {
                let seen = ctx.extensions().get::<u32>().copied();
                ctx.response_headers_mut().set("X-Seen", format!("{seen:?}"));
                Ok(Flow::Next)
            }),
        ];
        let mut ctx = context("GET / HTTP/1.1\r\n\r\n");
        run_chain(&chain, &mut ctx).await.unwrap();
        assert_eq!(ctx.response_headers().get("x-seen"), Some("Some(42)"));
    }

    #[tokio::test]
    async fn json_body_is_decoded() {
        let mut ctx = post("application/json; charset=utf-8", r#"{"p1":1,"p2":"two"}"#);
        JsonBodyParser.handle(&mut ctx).await.unwrap();
        assert_eq!(
            ctx.body().cloned().map(Value::Object),
            Some(json!({ "p1": 1, "p2": "two" }))
        );
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let mut ctx = post("application/json", "{oops");
        let err = JsonBodyParser.handle(&mut ctx).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));

        let mut ctx = post("application/json", "[1,2]");
        assert!(JsonBodyParser.handle(&mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn parsers_ignore_other_content_types() {
        let mut ctx = post("text/plain", "p1=1");
        JsonBodyParser.handle(&mut ctx).await.unwrap();
        UrlEncodedBodyParser.handle(&mut ctx).await.unwrap();
        assert!(ctx.body().is_none());
    }

    #[tokio::test]
    async fn urlencoded_body_is_decoded() {
        let mut ctx = post("application/x-www-form-urlencoded", "name=J%C3%BCrgen+M&tag=a&tag=b");
        UrlEncodedBodyParser.handle(&mut ctx).await.unwrap();
        assert_eq!(
            ctx.body().cloned().map(Value::Object),
            Some(json!({ "name": "Jürgen M", "tag": ["a", "b"] }))
        );
    }
}
