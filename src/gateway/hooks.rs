//! Lifecycle hooks around the action call.
//!
//! | Hook              | Runs                                   | May                         |
//! |-------------------|----------------------------------------|-----------------------------|
//! | [`BeforeRequest`] | after the endpoint is resolved         | abort with an error         |
//! | [`Authorize`]     | next, on handlers asking for it        | reject with its own error   |
//! | [`AfterRequest`]  | after the action returned              | replace the payload         |
//! | [`RequestFailed`] | on any pipeline error                  | produce the error response  |
//!
//! Each trait has a closure adapter (`before_fn`, `after_fn`, ...) for the common
//! synchronous case.

use std::sync::Arc;

use crate::backend::Payload;
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::http::Response;
use crate::middleware::BoxFuture;

pub trait BeforeRequest: Send + Sync {
    fn before<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<(), GatewayError>>;
}

pub trait AfterRequest: Send + Sync {
    /// Receives the action result and returns what should be serialized.
    fn after<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        payload: Payload,
    ) -> BoxFuture<'a, Result<Payload, GatewayError>>;
}

pub trait RequestFailed: Send + Sync {
    /// Returns the response to send for `error`, or `None` to leave it to the next
    /// hook and finally the default error body.
    ///
    /// An error returned from here replaces the original one and is rendered by the
    /// default error body.
    fn failed<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        error: &'a GatewayError,
    ) -> BoxFuture<'a, Result<Option<Response>, GatewayError>>;
}

pub trait Authorize: Send + Sync {
    fn authorize<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<(), GatewayError>>;
}

/// Optional hooks of one handler.
#[derive(Clone, Default)]
pub struct HandlerHooks {
    pub before_request: Option<Arc<dyn BeforeRequest>>,
    pub after_request: Option<Arc<dyn AfterRequest>>,
    pub request_failed: Option<Arc<dyn RequestFailed>>,
}

impl std::fmt::Debug for HandlerHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerHooks")
            .field("before_request", &self.before_request.is_some())
            .field("after_request", &self.after_request.is_some())
            .field("request_failed", &self.request_failed.is_some())
            .finish()
    }
}

struct BeforeFn<F>(F);

pub fn before_fn<F>(f: F) -> Arc<dyn BeforeRequest>
where
    F: Fn(&mut RequestContext) -> Result<(), GatewayError> + Send + Sync + 'static,
{
    Arc::new(BeforeFn(f))
}

impl<F> BeforeRequest for BeforeFn<F>
where
    F: Fn(&mut RequestContext) -> Result<(), GatewayError> + Send + Sync + 'static,
{
    fn before<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<(), GatewayError>> {
        let result = (self.0)(ctx);
        Box::pin(async move { result })
    }
}

struct AuthorizeFn<F>(F);

pub fn authorize_fn<F>(f: F) -> Arc<dyn Authorize>
where
    F: Fn(&mut RequestContext) -> Result<(), GatewayError> + Send + Sync + 'static,
{
    Arc::new(AuthorizeFn(f))
}

impl<F> Authorize for AuthorizeFn<F>
where
    F: Fn(&mut RequestContext) -> Result<(), GatewayError> + Send + Sync + 'static,
{
    fn authorize<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<(), GatewayError>> {
        let result = (self.0)(ctx);
        Box::pin(async move { result })
    }
}

struct AfterFn<F>(F);

pub fn after_fn<F>(f: F) -> Arc<dyn AfterRequest>
where
    F: Fn(&mut RequestContext, Payload) -> Result<Payload, GatewayError> + Send + Sync + 'static,
{
    Arc::new(AfterFn(f))
}

impl<F> AfterRequest for AfterFn<F>
where
    F: Fn(&mut RequestContext, Payload) -> Result<Payload, GatewayError> + Send + Sync + 'static,
{
    fn after<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        payload: Payload,
    ) -> BoxFuture<'a, Result<Payload, GatewayError>> {
        let result = (self.0)(ctx, payload);
        Box::pin(async move { result })
    }
}

struct FailedFn<F>(F);

pub fn failed_fn<F>(f: F) -> Arc<dyn RequestFailed>
where
    F: Fn(&mut RequestContext, &GatewayError) -> Result<Option<Response>, GatewayError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FailedFn(f))
}

impl<F> RequestFailed for FailedFn<F>
where
    F: Fn(&mut RequestContext, &GatewayError) -> Result<Option<Response>, GatewayError>
        + Send
        + Sync
        + 'static,
{
    fn failed<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        error: &'a GatewayError,
    ) -> BoxFuture<'a, Result<Option<Response>, GatewayError>> {
        let result = (self.0)(ctx, error);
        Box::pin(async move { result })
    }
}
