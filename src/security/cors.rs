//! Cross-Origin Resource Sharing policy.
//!
//! A [`CorsPolicy`] is the configured form: every field optional so a handler-level
//! block can override the gateway-level one field by field. [`CorsPolicy::compile`]
//! turns the merged policy into a [`Cors`] enforcer, precompiling origin globs once.
//!
//! Origin patterns are either exact strings or globs where `*` matches any run of
//! characters and `?` a single one:
//!
//! | Pattern                     | Matches                          |
//! |-----------------------------|----------------------------------|
//! | `https://app.example.com`   | that origin only                 |
//! | `http://*.localhost:5147`   | `http://test.localhost:5147`     |
//! | `https://app?.example.com`  | `https://app1.example.com`       |

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::http::{Headers, Method, Request};

const DEFAULT_METHODS: [&str; 6] = ["GET", "HEAD", "PUT", "PATCH", "POST", "DELETE"];

/// A single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn values(&self) -> Vec<&str> {
        match self {
            OneOrMany::One(value) => vec![value.as_str()],
            OneOrMany::Many(values) => values.iter().map(String::as_str).collect(),
        }
    }

    /// Header rendering: list entries joined with `, `.
    pub fn joined(&self) -> String {
        self.values().join(", ")
    }
}

impl From<&str> for OneOrMany {
    fn from(value: &str) -> Self {
        OneOrMany::One(value.to_owned())
    }
}

impl From<Vec<&str>> for OneOrMany {
    fn from(values: Vec<&str>) -> Self {
        OneOrMany::Many(values.into_iter().map(str::to_owned).collect())
    }
}

/// Configured CORS policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsPolicy {
    /// Allowed origins. Unset or `"*"` allows any origin.
    pub origin: Option<OneOrMany>,
    /// Methods announced on preflight. Defaults to `GET, HEAD, PUT, PATCH, POST, DELETE`.
    pub methods: Option<OneOrMany>,
    /// Headers announced on preflight. Unset echoes `Access-Control-Request-Headers`.
    pub allowed_headers: Option<OneOrMany>,
    pub exposed_headers: Option<OneOrMany>,
    pub credentials: Option<bool>,
    /// Preflight cache lifetime in seconds.
    pub max_age: Option<u64>,
}

impl CorsPolicy {
    /// Returns a policy where every field set in `over` replaces the one in `self`.
    #[must_use]
    pub fn merge(&self, over: &CorsPolicy) -> CorsPolicy {
        CorsPolicy {
            origin: over.origin.clone().or_else(|| self.origin.clone()),
            methods: over.methods.clone().or_else(|| self.methods.clone()),
            allowed_headers: over
                .allowed_headers
                .clone()
                .or_else(|| self.allowed_headers.clone()),
            exposed_headers: over
                .exposed_headers
                .clone()
                .or_else(|| self.exposed_headers.clone()),
            credentials: over.credentials.or(self.credentials),
            max_age: over.max_age.or(self.max_age),
        }
    }

    /// Compiles the policy, applying defaults.
    ///
    /// # Errors
    ///
    /// Fails only if a glob cannot be turned into a regular expression.
    pub fn compile(&self) -> Result<Cors, regex::Error> {
        let origin = match &self.origin {
            None => AllowedOrigin::Any,
            Some(OneOrMany::One(value)) if value == "*" => AllowedOrigin::Any,
            Some(origins) => AllowedOrigin::Patterns(
                origins
                    .values()
                    .into_iter()
                    .map(OriginPattern::new)
                    .collect::<Result<_, _>>()?,
            ),
        };

        Ok(Cors {
            origin,
            methods: self
                .methods
                .as_ref()
                .map_or_else(|| DEFAULT_METHODS.join(", "), OneOrMany::joined),
            allowed_headers: self.allowed_headers.as_ref().map(OneOrMany::joined),
            exposed_headers: self.exposed_headers.as_ref().map(OneOrMany::joined),
            credentials: self.credentials.unwrap_or(false),
            max_age: self.max_age,
        })
    }
}

/// One allowed-origin entry.
#[derive(Debug, Clone)]
pub enum OriginPattern {
    Exact(String),
    Glob(Regex),
}

impl OriginPattern {
    /// Builds an exact pattern, or a glob when `pattern` contains `*` or `?`.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        if !pattern.contains(['*', '?']) {
            return Ok(OriginPattern::Exact(pattern.to_owned()));
        }

        let mut source = String::from("^");
        for c in pattern.chars() {
            match c {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                c => source.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
            }
        }
        source.push('$');
        Regex::new(&source).map(OriginPattern::Glob)
    }

    pub fn matches(&self, origin: &str) -> bool {
        match self {
            OriginPattern::Exact(expected) => expected == origin,
            OriginPattern::Glob(re) => re.is_match(origin),
        }
    }
}

#[derive(Debug, Clone)]
enum AllowedOrigin {
    Any,
    Patterns(Vec<OriginPattern>),
}

/// A compiled CORS policy.
#[derive(Debug, Clone)]
pub struct Cors {
    origin: AllowedOrigin,
    methods: String,
    allowed_headers: Option<String>,
    exposed_headers: Option<String>,
    credentials: bool,
    max_age: Option<u64>,
}

impl Cors {
    /// `true` for an `OPTIONS` request carrying `Access-Control-Request-Method`.
    pub fn is_preflight(request: &Request) -> bool {
        request.method() == &Method::Options
            && request.headers().contains("access-control-request-method")
    }

    /// Writes the CORS response headers for `request` into `headers`.
    ///
    /// Requests without an `Origin` header are left alone. Allowed headers, allowed
    /// methods and max-age are only written when `preflight` is set.
    ///
    /// # Errors
    ///
    /// [`GatewayError::OriginNotAllowed`] when the origin matches no pattern.
    pub fn apply(
        &self,
        request: &Request,
        headers: &mut Headers,
        preflight: bool,
    ) -> Result<(), GatewayError> {
        let Some(origin) = request.headers().get("origin") else {
            return Ok(());
        };

        match &self.origin {
            AllowedOrigin::Any => headers.set("Access-Control-Allow-Origin", "*"),
            AllowedOrigin::Patterns(patterns) => {
                if !patterns.iter().any(|p| p.matches(origin)) {
                    return Err(GatewayError::OriginNotAllowed {
                        origin: origin.to_owned(),
                    });
                }
                headers.set("Access-Control-Allow-Origin", origin);
                add_vary(headers, "Origin");
            }
        }

        if self.credentials {
            headers.set("Access-Control-Allow-Credentials", "true");
        }
        if let Some(exposed) = &self.exposed_headers {
            headers.set("Access-Control-Expose-Headers", exposed.as_str());
        }

        if preflight {
            match &self.allowed_headers {
                Some(allowed) => headers.set("Access-Control-Allow-Headers", allowed.as_str()),
                None => {
                    if let Some(requested) = request.headers().get("access-control-request-headers") {
                        add_vary(headers, "Access-Control-Request-Headers");
                        headers.set("Access-Control-Allow-Headers", requested);
                    }
                }
            }
            headers.set("Access-Control-Allow-Methods", self.methods.as_str());
            if let Some(max_age) = self.max_age {
                headers.set("Access-Control-Max-Age", max_age.to_string());
            }
        }

        Ok(())
    }
}

fn add_vary(headers: &mut Headers, field: &str) {
    if !headers
        .get_all("vary")
        .any(|value| value.eq_ignore_ascii_case(field))
    {
        headers.insert("Vary", field);
    }
}
