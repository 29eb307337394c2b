//! Gateway settings.
//!
//! Settings are plain data: they can be built in code or deserialized from TOML, and
//! are checked by [`GatewaySettings::validate`], which reports every problem at once.
//! Behavior that cannot be expressed as data (middlewares, hooks, custom stores) is
//! attached through [`HandlerSpec`](crate::gateway::HandlerSpec) and
//! [`GatewayBuilder`](crate::gateway::GatewayBuilder).
//!
//! ```toml
//! port = 8080
//! path = "/"
//!
//! [rate_limit]
//! window_size_ms = 5000
//! limit = 50
//! headers = true
//!
//! [[handlers]]
//! path = "/api"
//! whitelist = ["math.*"]
//! mapping_policy = "restricted"
//! body_parsers = { json = true }
//!
//! [handlers.routes]
//! "GET /math/add" = "math.add"
//! "POST /users/:id" = "users.update"
//!
//! [handlers.cors]
//! origin = ["http://*.example.com"]
//! credentials = true
//! ```

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::router::pattern::{PathPattern, PatternOptions};
use crate::router::{add_slashes, normalize_path, parse_definition, trim_slashes};
use crate::security::{CorsPolicy, RateLimitPolicy, Whitelist};

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid settings: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Whether unmatched paths fall back to an implicit action name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingPolicy {
    /// `/api/math/add` calls `math.add` when no alias matches.
    #[default]
    #[serde(alias = "ALL")]
    All,
    /// Only alias routes are reachable.
    #[serde(alias = "RESTRICTED")]
    Restricted,
}

/// Level of the per-request `=>` / `<=` log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    #[default]
    Debug,
    Info,
}

/// Implicit body-parsing middlewares of a handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyParsers {
    pub json: bool,
    pub urlencoded: bool,
}

/// Static-file fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetSettings {
    pub folder: PathBuf,
    /// File served for directory paths.
    pub index: String,
}

impl Default for AssetSettings {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("public"),
            index: "index.html".to_owned(),
        }
    }
}

/// One handler: everything scoped to a mount path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerSettings {
    /// Mount path, relative to the gateway path.
    pub path: String,
    /// Action masks this handler exposes. Unset exposes everything.
    pub whitelist: Option<Vec<String>>,
    /// Overrides the gateway-level policy.
    pub mapping_policy: Option<MappingPolicy>,
    /// Overrides the gateway-level CORS policy field by field.
    pub cors: Option<CorsPolicy>,
    /// Overrides the gateway-level rate limit field by field.
    pub rate_limit: Option<RateLimitPolicy>,
    /// Alias routes: `"METHOD /path"` to action name.
    pub routes: BTreeMap<String, String>,
    /// Run the gateway's authorize hook before calling actions.
    pub authorization: bool,
    pub body_parsers: BodyParsers,
    /// Derive routes from the backend catalog.
    pub generate_auto_routes: bool,
}

impl HandlerSettings {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Top-level gateway settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub port: u16,
    pub ip: String,
    /// Prefix applied to every handler path.
    pub path: String,
    pub mapping_policy: MappingPolicy,
    /// Default CORS policy. Without it (and without a handler-level one) no CORS
    /// headers are written.
    pub cors: Option<CorsPolicy>,
    /// Default rate limit. Without it (and without a handler-level one) requests are
    /// not counted.
    pub rate_limit: Option<RateLimitPolicy>,
    /// Keep handlers and routes sorted by specificity.
    pub auto_order_routes: bool,
    pub request_log_level: LogLevel,
    pub assets: Option<AssetSettings>,
    pub handlers: Vec<HandlerSettings>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            port: 3000,
            ip: "0.0.0.0".to_owned(),
            path: "/".to_owned(),
            mapping_policy: MappingPolicy::All,
            cors: None,
            rate_limit: None,
            auto_order_routes: true,
            request_log_level: LogLevel::Debug,
            assets: None,
            handlers: Vec::new(),
        }
    }
}

impl GatewaySettings {
    /// Parses TOML settings. The result is not validated.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed TOML or unexpected value types.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reads, parses and validates a TOML settings file.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`].
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_owned(),
                source,
            })?;
        let settings = Self::from_toml_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// `ip:port`, as passed to the listener.
    pub fn bind_addr(&self) -> String {
        match self.ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.port),
            _ => format!("{}:{}", self.ip, self.port),
        }
    }

    /// Absolute mount path of `handler`: the gateway path joined with the handler path.
    pub fn mount_path(&self, handler: &HandlerSettings) -> String {
        mount_path(&self.path, &handler.path)
    }

    /// Checks the settings for consistency.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] listing every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.ip.parse::<IpAddr>().is_err() {
            errors.push(format!("ip '{}' is not an IP address", self.ip));
        }
        if self.assets.as_ref().is_some_and(|assets| assets.index.is_empty()) {
            errors.push("assets.index must not be empty".to_owned());
        }
        check_policies("gateway", self.cors.as_ref(), self.rate_limit.as_ref(), &mut errors);

        let mut mounts = HashSet::new();
        for handler in &self.handlers {
            let mount = self.mount_path(handler);
            let scope = format!("handler '{mount}'");
            if !mounts.insert(mount.clone()) {
                errors.push(format!("{scope} is declared more than once"));
            }

            if let Some(Err(e)) = handler.whitelist.as_deref().map(|masks| Whitelist::new(masks)) {
                errors.push(format!("{scope}: invalid whitelist: {e}"));
            }

            let cors = merged(self.cors.as_ref(), handler.cors.as_ref(), CorsPolicy::merge);
            let rate_limit = merged(
                self.rate_limit.as_ref(),
                handler.rate_limit.as_ref(),
                RateLimitPolicy::merge,
            );
            check_policies(&scope, cors.as_ref(), rate_limit.as_ref(), &mut errors);

            for (definition, action) in &handler.routes {
                if action.trim().is_empty() {
                    errors.push(format!("{scope}: route '{definition}' has no action"));
                }
                let (_, path) = parse_definition(definition);
                let full_path = format!("{}{}", add_slashes(&mount), trim_slashes(path));
                if let Err(e) = PathPattern::compile(&full_path, PatternOptions::default()) {
                    errors.push(format!("{scope}: route '{definition}': {e}"));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

/// Joins the gateway path and a handler path into a normalized mount path without a
/// trailing slash (`/` stays `/`).
pub fn mount_path(global: &str, handler: &str) -> String {
    let joined = normalize_path(&format!("{}{}", add_slashes(global), handler));
    let trimmed = joined.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Merges a handler-level block over the gateway-level one. `None` when neither is set.
pub(crate) fn merged<T: Clone>(
    global: Option<&T>,
    handler: Option<&T>,
    merge: fn(&T, &T) -> T,
) -> Option<T> {
    match (global, handler) {
        (Some(global), Some(handler)) => Some(merge(global, handler)),
        (Some(only), None) | (None, Some(only)) => Some(only.clone()),
        (None, None) => None,
    }
}

fn check_policies(
    scope: &str,
    cors: Option<&CorsPolicy>,
    rate_limit: Option<&RateLimitPolicy>,
    errors: &mut Vec<String>,
) {
    if let Some(Err(e)) = cors.map(CorsPolicy::compile) {
        errors.push(format!("{scope}: invalid CORS origin pattern: {e}"));
    }
    if rate_limit.is_some_and(|policy| policy.window_size_ms == Some(0)) {
        errors.push(format!("{scope}: rate_limit.window_size_ms must be positive"));
    }
}
