//! Turning action results and pipeline errors into responses.

use serde::Serialize;
use serde_json::Value;
use serde_json::ser::PrettyFormatter;

use crate::backend::Payload;
use crate::context::ResponseMeta;
use crate::error::{ErrorCode, GatewayError};
use crate::http::{Method, Response, StatusCode};

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const OCTET_STREAM: &str = "application/octet-stream";

/// Builds the response for an action result.
///
/// Status, reason phrase and headers come from `meta`. A content type set in `meta`
/// (directly or as a `Content-Type` header) replaces the computed one. `204`/`304`
/// responses and `HEAD` requests never carry a body.
///
/// # Errors
///
/// Only if a JSON value cannot be encoded.
pub fn payload_response(
    method: &Method,
    meta: &ResponseMeta,
    payload: Payload,
) -> Result<Response, GatewayError> {
    let mut response = Response::new(meta.status.unwrap_or(StatusCode::OK));
    if let Some(message) = &meta.status_message {
        response = response.reason(message.as_str());
    }

    let mut explicit_type = meta.content_type.clone();
    for (name, value) in meta.headers.iter() {
        if name.eq_ignore_ascii_case("content-type") {
            if explicit_type.is_none() {
                explicit_type = Some(value.to_owned());
            }
        } else {
            response.headers_mut().insert(name, value);
        }
    }
    let content_type = |default: &str| explicit_type.clone().unwrap_or_else(|| default.to_owned());

    response = match payload.normalize() {
        Payload::Empty => response,
        Payload::Bytes(bytes) => response
            .header("Content-Type", content_type(OCTET_STREAM))
            .body_bytes(bytes),
        Payload::Stream(reader) => response
            .header("Content-Type", content_type(OCTET_STREAM))
            .body_stream(reader),
        Payload::Json(value @ (Value::Object(_) | Value::Array(_))) => response
            .header("Content-Type", content_type(JSON_CONTENT_TYPE))
            .body_bytes(encode(&value)?),
        Payload::Json(scalar) => match &explicit_type {
            Some(explicit) => {
                let raw = match scalar {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                response.header("Content-Type", explicit.as_str()).body(raw)
            }
            None => response
                .header("Content-Type", JSON_CONTENT_TYPE)
                .body_bytes(encode(&scalar)?),
        },
    };

    if response.status().is_bodiless() {
        let headers = response.headers_mut();
        headers.remove("content-type");
        headers.remove("content-length");
        headers.remove("transfer-encoding");
        response.set_body(Default::default());
    } else if *method == Method::Head {
        strip_body(&mut response);
    }

    Ok(response)
}

/// Drops the body of a `HEAD` response while keeping the framing headers a `GET`
/// would have carried.
pub fn strip_body(response: &mut Response) {
    let length = response.body_ref().as_bytes().map(|bytes| bytes.len());
    match length {
        Some(length) => {
            if !response.headers().contains("content-length") {
                response
                    .headers_mut()
                    .set("Content-Length", length.to_string());
            }
        }
        None => response.headers_mut().set("Transfer-Encoding", "chunked"),
    }
    response.set_body(Default::default());
}

fn encode(value: &Value) -> Result<Vec<u8>, GatewayError> {
    serde_json::to_vec(value).map_err(|e| GatewayError::Internal(format!("failed to encode response: {e}")))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    name: &'a str,
    code: ErrorCode,
    status_code: u16,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// The default error body: `{ name, code, statusCode, message, data }`, pretty-printed
/// with four-space indentation. `data` is omitted when the error carries none.
///
/// # Errors
///
/// Only if `data` cannot be encoded.
pub fn error_body(status: StatusCode, error: &GatewayError) -> Result<String, serde_json::Error> {
    let body = ErrorBody {
        name: error.name(),
        code: error.code(),
        status_code: status.as_u16(),
        message: error.to_string(),
        data: error.data(),
    };

    let mut out = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    body.serialize(&mut serializer)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Written when a request matches nothing.
pub fn not_found() -> Response {
    Response::new(StatusCode::NOT_FOUND)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body("Not found")
}

/// Last-resort response, used when the error exit itself fails.
pub fn internal_error() -> Response {
    Response::new(StatusCode::INTERNAL_SERVER_ERROR)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body("Internal Server Error")
}
