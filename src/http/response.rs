//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and writing them to
//! a socket. Bodies are either fully buffered ([`Body::Full`]) or streamed from an
//! [`AsyncRead`] source ([`Body::Stream`]); streamed bodies are sent with chunked
//! transfer encoding and are never collected in memory.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Headers, StatusCode};

/// Chunk size used when copying a streamed body to the socket.
const STREAM_CHUNK_SIZE: usize = 8 * 1024;

/// A response body.
pub enum Body {
    /// A fully buffered body; `Content-Length` is computed from it.
    Full(Bytes),
    /// A body produced incrementally by a reader.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl Body {
    /// Returns an empty buffered body.
    pub fn empty() -> Self {
        Self::Full(Bytes::new())
    }

    /// Returns the buffered bytes, or `None` for a streamed body.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Full(bytes) => Some(bytes),
            Self::Stream(_) => None,
        }
    }

    /// Returns `true` for an empty buffered body.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Full(bytes) if bytes.is_empty())
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// An HTTP/1.1 response, ready to be written.
///
/// # Examples
///
/// ```
/// use rpcgate::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    reason: Option<String>,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: Headers::new(),
            body: Body::empty(),
            keep_alive: true,
        }
    }

    /// Sets a header, replacing any previous value with the same name.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically unless one was set
    /// explicitly.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(Bytes::from(body.into()));
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Sets a streamed body.
    #[must_use]
    pub fn body_stream(mut self, reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        self.body = Body::Stream(reader);
        self
    }

    /// Overrides the reason phrase written on the status line.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Changes the status code in place.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Returns the reason phrase that will be written on the status line.
    pub fn reason_phrase(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| self.status.canonical_reason())
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response headers for in-place decoration.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the body.
    pub fn body_ref(&self) -> &Body {
        &self.body
    }

    /// Replaces the body in place.
    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    /// Returns the buffered body as UTF-8 text, or `None` when the body is streamed
    /// or not valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        self.body
            .as_bytes()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// Serializes the status line and headers.
    ///
    /// Automatically adds:
    /// - `Content-Length` for buffered bodies, unless already set (so a `HEAD` response
    ///   can announce the length of the body it omits) or the status is bodiless.
    /// - `Transfer-Encoding: chunked` for streamed bodies.
    /// - `Connection: keep-alive` or `Connection: close`.
    fn head_bytes(&mut self) -> BytesMut {
        match &self.body {
            Body::Full(bytes) => {
                if !self.status.is_bodiless()
                    && !self.headers.contains("content-length")
                    && !self.headers.contains("transfer-encoding")
                {
                    self.headers.set("Content-Length", bytes.len().to_string());
                }
            }
            Body::Stream(_) => {
                self.headers.remove("content-length");
                self.headers.set("Transfer-Encoding", "chunked");
            }
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64);
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.reason_phrase()
            )
            .as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        buf.put(&b"\r\n"[..]);
        buf
    }

    /// Serializes a buffered response into a single buffer.
    ///
    /// A streamed body cannot be collected here; only its head is returned. Use
    /// [`write_to`](Self::write_to) to send streamed responses.
    pub fn into_bytes(mut self) -> BytesMut {
        let mut buf = self.head_bytes();
        if let Body::Full(bytes) = &self.body {
            buf.put(bytes.as_ref());
        }
        buf
    }

    /// Writes the response to `writer`, streaming the body when it is a reader.
    pub async fn write_to<W>(mut self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let head = self.head_bytes();
        writer.write_all(&head).await?;

        match self.body {
            Body::Full(bytes) => {
                if !bytes.is_empty() {
                    writer.write_all(&bytes).await?;
                }
            }
            Body::Stream(mut reader) => {
                let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
                loop {
                    let n = reader.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    writer.write_all(format!("{n:x}\r\n").as_bytes()).await?;
                    writer.write_all(&chunk[..n]).await?;
                    writer.write_all(b"\r\n").await?;
                }
                writer.write_all(b"0\r\n\r\n").await?;
            }
        }

        writer.flush().await
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}
