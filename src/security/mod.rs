//! Request admission: CORS, rate limiting and action whitelisting.
//!
//! - [`cors`] — origin checks and `Access-Control-*` headers, preflight handling.
//! - [`rate_limit`] — fixed-window counters behind the [`RateLimitStore`] seam.
//! - [`whitelist`] — glob masks restricting which actions a handler exposes.

pub mod cors;
pub mod rate_limit;
pub mod whitelist;

pub use cors::{Cors, CorsPolicy, OneOrMany, OriginPattern};
pub use rate_limit::{
    KeyExtractor, MemoryStore, RateLimitPolicy, RateLimitSettings, RateLimitStore, RateLimiter,
    client_key,
};
pub use whitelist::Whitelist;
