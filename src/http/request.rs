//! HTTP/1.1 request parsing using the [`httparse`] crate.

use std::net::SocketAddr;

use bytes::Bytes;
use percent_encoding::percent_decode_str;
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("announced body of {length} bytes exceeds the {limit} byte limit")]
    BodyTooLarge { length: usize, limit: usize },
}

/// A fully parsed HTTP/1.1 request.
///
/// Created by [`Request::parse`] from a raw byte buffer, or by
/// [`Request::from_parts`] when the request does not come off a socket.
///
/// # Examples
///
/// ```
/// use rpcgate::http::request::Request;
///
/// let raw = b"GET /api/math/add?p1=1&p2=2 HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _consumed) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/api/math/add");
/// assert_eq!(request.query_string(), Some("p1=1&p2=2"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: String,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Largest `Content-Length` [`parse`](Self::parse) accepts.
    pub const MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Returns the parsed `Request` and the total number of bytes it occupies in
    /// `buf` (head plus `Content-Length` bytes of body). Bytes past that point
    /// belong to the next pipelined request and are left untouched.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] — the head or the announced body has not fully arrived.
    /// - [`RequestError::Parse`] — the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`] — a required field (method, path, version) is absent.
    /// - [`RequestError::InvalidContentLength`] — `Content-Length` is not a number.
    /// - [`RequestError::BodyTooLarge`] — `Content-Length` is above [`Self::MAX_BODY_SIZE`].
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let Ok(method) = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse::<Method>();

        let url = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?
            .to_owned();

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let content_length = match header_map.get("content-length") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| RequestError::InvalidContentLength)?,
            None => 0,
        };
        if content_length > Self::MAX_BODY_SIZE {
            return Err(RequestError::BodyTooLarge {
                length: content_length,
                limit: Self::MAX_BODY_SIZE,
            });
        }
        let total = body_offset
            .checked_add(content_length)
            .ok_or(RequestError::InvalidContentLength)?;
        if buf.len() < total {
            return Err(RequestError::Incomplete);
        }

        let body = Bytes::copy_from_slice(&buf[body_offset..total]);
        let mut request = Self::from_parts(method, &url, header_map, body);
        request.version = version;

        Ok((request, total))
    }

    /// Builds a request from already-separated parts.
    ///
    /// `url` is the request target as it appears on the request line, query string
    /// included. The version defaults to HTTP/1.1.
    pub fn from_parts(
        method: Method,
        url: impl Into<String>,
        headers: Headers,
        body: impl Into<Bytes>,
    ) -> Self {
        let url = url.into();
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (url.clone(), None),
        };

        Self {
            method,
            url,
            path,
            version: 1,
            headers,
            query,
            body: body.into(),
            remote_addr: None,
        }
    }

    /// Records the peer address of the connection the request arrived on.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the full request target, query string included.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the decoded `key=value` pairs of the query string, in order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query
            .as_deref()
            .map(parse_query_string)
            .unwrap_or_default()
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the peer address, when the request came off a socket.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.to_ascii_lowercase().contains("keep-alive"),
            None => self.version == 1,
        }
    }
}

/// Parses a URL-encoded form (`key=value&key2=value2`) into decoded pairs.
///
/// `+` decodes to a space and `%XX` sequences are percent-decoded. Invalid UTF-8
/// after decoding is replaced rather than rejected. Empty segments are skipped.
pub fn parse_query_string(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_form_component(key), decode_form_component(value))
        })
        .collect()
}

fn decode_form_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, consumed) = Request::parse(raw).unwrap();
        assert_eq!(req.method().as_str(), "GET");
        assert_eq!(req.path(), "/");
        assert_eq!(req.version(), 1);
        assert_eq!(req.headers().get("host"), Some("localhost"));
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn query_pairs_are_decoded() {
        let raw = b"GET /search?q=hello+rust&tag=%F0%9F%A6%80&flag HTTP/1.1\r\nHost: x\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.path(), "/search");
        assert_eq!(req.url(), "/search?q=hello+rust&tag=%F0%9F%A6%80&flag");
        assert_eq!(
            req.query_pairs(),
            vec![
                ("q".to_owned(), "hello rust".to_owned()),
                ("tag".to_owned(), "🦀".to_owned()),
                ("flag".to_owned(), String::new()),
            ]
        );
    }

    #[test]
    fn incomplete_head() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn oversized_content_length_is_rejected_before_reading() {
        let raw = b"GET / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n";
        assert!(matches!(
            Request::parse(raw),
            Err(RequestError::BodyTooLarge { limit: Request::MAX_BODY_SIZE, .. })
        ));

        let raw = format!(
            "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            Request::MAX_BODY_SIZE + 1
        );
        assert!(matches!(
            Request::parse(raw.as_bytes()),
            Err(RequestError::BodyTooLarge { .. })
        ));
    }

    #[test]
    fn incomplete_body() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn body_stops_at_content_length() {
        let raw = b"POST /a HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET /b HTTP/1.1\r\n\r\n";
        let (req, consumed) = Request::parse(raw).unwrap();
        assert_eq!(req.body().as_ref(), b"hello");
        assert_eq!(&raw[consumed..consumed + 6], b"GET /b");
    }

    #[test]
    fn lowercase_method_is_normalized() {
        let raw = b"get / HTTP/1.1\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.method(), &Method::Get);
    }

    #[test]
    fn keep_alive_rules() {
        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(req.is_keep_alive());

        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());

        let (req, _) = Request::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());
    }
}
