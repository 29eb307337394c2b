//! # rpcgate
//!
//! An async HTTP-to-RPC gateway. Incoming HTTP requests are matched against alias
//! routes or mapped onto action names (`/api/math/add` → `math.add`), checked against
//! whitelists, CORS policies and rate limits, and forwarded to a [`Backend`] that
//! executes the action. The result comes back as JSON, text, bytes or a stream.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rpcgate::backend::{ActionDef, LocalBackend, Payload, Service, action_fn};
//! use rpcgate::config::GatewaySettings;
//! use rpcgate::gateway::{Gateway, HandlerSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = LocalBackend::new().service(Service::new("math").action(ActionDef::new(
//!         "add",
//!         action_fn(|params, _meta| {
//!             let arg = |key: &str| {
//!                 params.get(key).and_then(|v| v.as_str()).and_then(|v| v.parse::<f64>().ok())
//!             };
//!             Ok(Payload::from(serde_json::json!(arg("a").unwrap_or(0.0) + arg("b").unwrap_or(0.0))))
//!         }),
//!     )));
//!
//!     let gateway = Gateway::builder(GatewaySettings::default(), Arc::new(backend))
//!         .handler(HandlerSpec::new("/api").whitelist(["math.*"]))
//!         .build()?;
//!     Arc::new(gateway).listen().await?;
//!     Ok(())
//! }
//! ```

pub mod assets;
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod http;
pub mod middleware;
pub mod router;
pub mod security;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use backend::{Backend, LocalBackend, Payload};
pub use config::{ConfigError, GatewaySettings, HandlerSettings};
pub use context::RequestContext;
pub use error::{GatewayError, ServiceError};
pub use gateway::{Gateway, GatewayBuilder, HandlerSpec};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError, ShutdownHandle};
