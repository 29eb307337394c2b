//! The gateway's error taxonomy and its mapping onto HTTP status codes.
//!
//! Every stage of the dispatch pipeline returns `Result<_, GatewayError>`; the first
//! error short-circuits the request and is turned into a response by the gateway's
//! single error exit. Errors raised by backend actions, hooks and middlewares travel as
//! [`ServiceError`], whose `code` decides the status:
//!
//! | Code                                                   | Status |
//! |--------------------------------------------------------|--------|
//! | `HTTP_ORIGIN_NOT_ALLOWED`                              | 403    |
//! | `HTTP_NOT_FOUND`, `SERVICE_NOT_FOUND_ERROR`            | 404    |
//! | `PARAMETER_VALIDATION_ERROR`                           | 422    |
//! | `HTTP_RATE_LIMIT_EXCEEDED`, `QUEUE_SIZE_EXCEEDED_ERROR`| 429    |
//! | `MAX_CALL_LEVEL_ERROR`                                 | 500    |
//! | `SERVICE_NOT_AVAILABLE_ERROR`                          | 503    |
//! | `REQUEST_TIMEOUT_ERROR`                                | 504    |
//! | any number in `100..=599`                              | itself |
//!
//! Anything else is left to the configured status mapper, then defaults to 500.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::http::StatusCode;
use crate::router::pattern::PatternError;

/// Machine-readable error code: a number or a symbolic string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Numeric(u16),
    Text(String),
}

impl ErrorCode {
    /// Maps the code to its well-known HTTP status, if it has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ErrorCode::Numeric(code) if (100..=599).contains(code) => {
                Some(StatusCode::from_u16(*code))
            }
            ErrorCode::Numeric(_) => None,
            ErrorCode::Text(code) => match code.as_str() {
                "HTTP_ORIGIN_NOT_ALLOWED" => Some(StatusCode::FORBIDDEN),
                "HTTP_NOT_FOUND" | "SERVICE_NOT_FOUND_ERROR" => Some(StatusCode::NOT_FOUND),
                "PARAMETER_VALIDATION_ERROR" => Some(StatusCode::UNPROCESSABLE_ENTITY),
                "SERVICE_NOT_AVAILABLE_ERROR" => Some(StatusCode::SERVICE_UNAVAILABLE),
                "REQUEST_TIMEOUT_ERROR" => Some(StatusCode::GATEWAY_TIMEOUT),
                "HTTP_RATE_LIMIT_EXCEEDED" | "QUEUE_SIZE_EXCEEDED_ERROR" => {
                    Some(StatusCode::TOO_MANY_REQUESTS)
                }
                "MAX_CALL_LEVEL_ERROR" => Some(StatusCode::INTERNAL_SERVER_ERROR),
                _ => None,
            },
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Numeric(code) => write!(f, "{code}"),
            ErrorCode::Text(code) => f.write_str(code),
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(code: u16) -> Self {
        ErrorCode::Numeric(code)
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        ErrorCode::Text(code.to_owned())
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        ErrorCode::Text(code)
    }
}

/// An error raised outside the gateway core: by a backend action, a hook or a
/// middleware.
///
/// ```
/// use rpcgate::error::{ServiceError, GatewayError};
/// use rpcgate::http::StatusCode;
///
/// let err: GatewayError = ServiceError::new(
///     "ValidationError",
///     "PARAMETER_VALIDATION_ERROR",
///     "p1 must be a number",
/// )
/// .into();
/// assert_eq!(err.status(), Some(StatusCode::UNPROCESSABLE_ENTITY));
/// ```
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ServiceError {
    pub name: String,
    pub code: ErrorCode,
    pub message: String,
    pub data: Option<Value>,
}

impl ServiceError {
    pub fn new(
        name: impl Into<String>,
        code: impl Into<ErrorCode>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Attaches structured detail, rendered as the `data` field of the error body.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// A `400 Bad Request` error, as raised for malformed request bodies.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BadRequestError", 400u16, message)
    }
}

/// Errors surfaced by the dispatch pipeline.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The request's `Origin` matches none of the configured CORS patterns.
    #[error("Forbidden.")]
    OriginNotAllowed { origin: String },

    /// The action does not exist, is private, or is not whitelisted.
    #[error("Service '{action}' not found.")]
    ActionNotFound { action: String },

    #[error("Too many requests.")]
    RateLimitExceeded,

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("invalid route '{route}': {source}")]
    InvalidRoute {
        route: String,
        #[source]
        source: PatternError,
    },

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// Shorthand for a [`ServiceError`].
    pub fn service(
        name: impl Into<String>,
        code: impl Into<ErrorCode>,
        message: impl Into<String>,
    ) -> Self {
        GatewayError::Service(ServiceError::new(name, code, message))
    }

    /// The `name` field of the error body.
    pub fn name(&self) -> &str {
        match self {
            GatewayError::OriginNotAllowed { .. } => "ForbiddenError",
            GatewayError::ActionNotFound { .. } => "ServiceNotFoundError",
            GatewayError::RateLimitExceeded => "RateLimitExceededError",
            GatewayError::Service(err) => &err.name,
            GatewayError::InvalidRoute { .. } => "InvalidRouteError",
            GatewayError::Internal(_) => "InternalServerError",
        }
    }

    /// The `code` field of the error body.
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::OriginNotAllowed { .. } => "HTTP_ORIGIN_NOT_ALLOWED".into(),
            GatewayError::ActionNotFound { .. } => "SERVICE_NOT_FOUND_ERROR".into(),
            GatewayError::RateLimitExceeded => 429u16.into(),
            GatewayError::Service(err) => err.code.clone(),
            GatewayError::InvalidRoute { .. } => "INVALID_ROUTE".into(),
            GatewayError::Internal(_) => 500u16.into(),
        }
    }

    /// The `data` field of the error body.
    pub fn data(&self) -> Option<Value> {
        match self {
            GatewayError::OriginNotAllowed { origin } => {
                Some(serde_json::json!({ "origin": origin }))
            }
            GatewayError::ActionNotFound { action } => {
                Some(serde_json::json!({ "actionName": action }))
            }
            GatewayError::Service(err) => err.data.clone(),
            _ => None,
        }
    }

    /// The HTTP status this error maps to, or `None` when it is unclassified and
    /// should go through the gateway's status mapper.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            GatewayError::OriginNotAllowed { .. } => Some(StatusCode::FORBIDDEN),
            GatewayError::ActionNotFound { .. } => Some(StatusCode::NOT_FOUND),
            GatewayError::RateLimitExceeded => Some(StatusCode::TOO_MANY_REQUESTS),
            GatewayError::Service(err) => err.code.status(),
            GatewayError::InvalidRoute { .. } | GatewayError::Internal(_) => {
                Some(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}
