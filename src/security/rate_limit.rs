//! Fixed-window request rate limiting.
//!
//! Every window, all counters reset together: a client that starts sending late in a
//! window gets a fresh budget at the next boundary, regardless of when its own count
//! started. Stores implementing [`RateLimitStore`] may count elsewhere (a shared cache,
//! another process); the pipeline only relies on the two trait operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, interval_at};

use crate::error::GatewayError;
use crate::http::{Headers, Request};
use crate::middleware::BoxFuture;

/// Counter backend for the rate limiter.
pub trait RateLimitStore: Send + Sync {
    /// Increments the counter of `key` and returns its new value.
    fn increment<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<u64, GatewayError>>;

    /// Clears every counter.
    fn reset(&self);
}

/// Derives the rate-limit key of a request. `None` exempts the request.
pub type KeyExtractor = Arc<dyn Fn(&Request) -> Option<String> + Send + Sync>;

/// Default key: the first `X-Forwarded-For` entry, else the peer IP address.
pub fn client_key(request: &Request) -> Option<String> {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|forwarded| forwarded.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .map(str::to_owned)
        .or_else(|| request.remote_addr().map(|addr| addr.ip().to_string()))
}

/// Configured rate-limit block. Unset fields inherit from the gateway-level block,
/// then from the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    pub window_size_ms: Option<u64>,
    pub limit: Option<u64>,
    pub headers: Option<bool>,
}

impl RateLimitPolicy {
    #[must_use]
    pub fn merge(&self, over: &RateLimitPolicy) -> RateLimitPolicy {
        RateLimitPolicy {
            window_size_ms: over.window_size_ms.or(self.window_size_ms),
            limit: over.limit.or(self.limit),
            headers: over.headers.or(self.headers),
        }
    }

    /// Fills unset fields with the defaults: 5000 ms window, 50 requests, no headers.
    pub fn resolve(&self) -> RateLimitSettings {
        RateLimitSettings {
            window: Duration::from_millis(self.window_size_ms.unwrap_or(5000)),
            limit: self.limit.unwrap_or(50),
            headers: self.headers.unwrap_or(false),
        }
    }
}

/// Effective rate-limit settings of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub limit: u64,
    /// Emit `X-Rate-Limit-*` headers.
    pub headers: bool,
}

/// A handler's rate limiter: settings, store and key extractor.
pub struct RateLimiter {
    settings: RateLimitSettings,
    store: Arc<dyn RateLimitStore>,
    key: KeyExtractor,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings, store: Arc<dyn RateLimitStore>, key: KeyExtractor) -> Self {
        Self { settings, store, key }
    }

    /// A limiter backed by a fresh [`MemoryStore`] and [`client_key`].
    pub fn in_memory(settings: RateLimitSettings) -> Self {
        Self::new(
            settings,
            MemoryStore::spawn(settings.window),
            Arc::new(client_key),
        )
    }

    pub fn settings(&self) -> RateLimitSettings {
        self.settings
    }

    /// Counts `request` against its key, writing quota headers when enabled.
    ///
    /// # Errors
    ///
    /// [`GatewayError::RateLimitExceeded`] once the count passes the limit, or
    /// whatever the store reports.
    pub async fn check(&self, request: &Request, headers: &mut Headers) -> Result<(), GatewayError> {
        let Some(key) = (self.key)(request) else {
            return Ok(());
        };

        let count = self.store.increment(&key).await?;
        let remaining = self.settings.limit.saturating_sub(count);

        if self.settings.headers {
            headers.set("X-Rate-Limit-Limit", self.settings.limit.to_string());
            headers.set("X-Rate-Limit-Window", self.settings.window.as_millis().to_string());
            headers.set("X-Rate-Limit-Remaining", remaining.to_string());
        }

        if count > self.settings.limit {
            tracing::debug!(key = %key, count, limit = self.settings.limit, "rate limit exceeded");
            return Err(GatewayError::RateLimitExceeded);
        }
        Ok(())
    }
}

struct Window {
    counters: HashMap<String, u64>,
    reset_time: Instant,
}

/// In-process fixed-window store.
///
/// A background task started by [`spawn`](Self::spawn) swaps out the whole counter map
/// at every window boundary. The task only holds a weak reference and stops once the
/// store is dropped. Increments also roll the window when they observe an expired
/// boundary first, so counting stays correct if the timer is delayed.
pub struct MemoryStore {
    window: Duration,
    state: Mutex<Window>,
}

impl MemoryStore {
    /// Creates a store with the given window and starts its reset timer on the current
    /// Tokio runtime, if there is one.
    pub fn spawn(window: Duration) -> Arc<Self> {
        let window = window.max(Duration::from_millis(1));
        let first_reset = Instant::now() + window;
        let store = Arc::new(Self {
            window,
            state: Mutex::new(Window {
                counters: HashMap::new(),
                reset_time: first_reset,
            }),
        });

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let weak = Arc::downgrade(&store);
                runtime.spawn(async move {
                    let mut ticker = interval_at(first_reset, window);
                    loop {
                        ticker.tick().await;
                        let Some(store) = weak.upgrade() else {
                            break;
                        };
                        store.roll(Instant::now());
                    }
                });
            }
            Err(_) => {
                tracing::warn!("no Tokio runtime; rate-limit windows roll on increment only");
            }
        }

        store
    }

    /// When the current window ends.
    pub fn reset_time(&self) -> Instant {
        self.lock().reset_time
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn roll(&self, now: Instant) {
        roll_window(&mut self.lock(), now, self.window);
    }
}

fn roll_window(state: &mut Window, now: Instant, window: Duration) {
    if now < state.reset_time {
        return;
    }
    state.counters = HashMap::new();
    while state.reset_time <= now {
        state.reset_time += window;
    }
}

impl RateLimitStore for MemoryStore {
    fn increment<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<u64, GatewayError>> {
        let count = {
            let mut state = self.lock();
            roll_window(&mut state, Instant::now(), self.window);
            let counter = state.counters.entry(key.to_owned()).or_insert(0);
            *counter += 1;
            *counter
        };
        Box::pin(async move { Ok(count) })
    }

    fn reset(&self) {
        self.lock().counters.clear();
    }
}
