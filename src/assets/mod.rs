//! Static-file fallback for requests no handler answered.

use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use tracing::{trace, warn};

use crate::http::{Method, Request, Response, StatusCode};
use crate::middleware::BoxFuture;

/// Serves requests that fell through every handler.
pub trait StaticFiles: Send + Sync {
    /// `None` when there is nothing to serve; the gateway then answers `404`.
    fn serve<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Option<Response>>;
}

/// Serves `GET`/`HEAD` requests from a directory.
///
/// Directory paths resolve to the index file. Paths with `..` segments are never
/// served.
#[derive(Debug, Clone)]
pub struct AssetFolder {
    root: PathBuf,
    index: String,
}

impl AssetFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: "index.html".to_owned(),
        }
    }

    #[must_use]
    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = index.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a request path below the root. `None` if it would escape it.
    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let decoded = percent_decode_str(request_path).decode_utf8().ok()?;
        let mut path = self.root.clone();
        for segment in decoded.split('/') {
            match segment {
                "" | "." => {}
                ".." => return None,
                s if s.contains(['\\', '\0']) => return None,
                s => path.push(s),
            }
        }
        Some(path)
    }

    async fn lookup(&self, request_path: &str) -> Option<(PathBuf, u64)> {
        let mut path = self.resolve(request_path)?;
        let mut metadata = tokio::fs::metadata(&path).await.ok()?;
        if metadata.is_dir() {
            path.push(&self.index);
            metadata = tokio::fs::metadata(&path).await.ok()?;
        }
        metadata.is_file().then_some((path, metadata.len()))
    }
}

impl StaticFiles for AssetFolder {
    fn serve<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Option<Response>> {
        Box::pin(async move {
            let head = match request.method() {
                Method::Get => false,
                Method::Head => true,
                _ => return None,
            };
            let (path, len) = self.lookup(request.path()).await?;
            trace!(file = %path.display(), "serving asset");

            let content_type = mime_guess::from_path(&path).first_or_octet_stream();
            let response = Response::new(StatusCode::OK).header("Content-Type", content_type.as_ref());
            if head {
                return Some(response.header("Content-Length", len.to_string()));
            }

            match tokio::fs::read(&path).await {
                Ok(data) => Some(response.body_bytes(data)),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "failed to read asset");
                    None
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    async fn fixture(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("rpcgate-assets-{name}-{}", std::process::id()));
        tokio::fs::create_dir_all(root.join("docs")).await.unwrap();
        tokio::fs::write(root.join("index.html"), "<h1>home</h1>").await.unwrap();
        tokio::fs::write(root.join("app.js"), "let x = 1;").await.unwrap();
        tokio::fs::write(root.join("docs/index.html"), "<h1>docs</h1>").await.unwrap();
        root
    }

    #[tokio::test]
    async fn serves_files_with_content_type() {
        let folder = AssetFolder::new(fixture("files").await);

        let response = folder.serve(&request("GET /app.js HTTP/1.1\r\n\r\n")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text(), Some("let x = 1;"));
        assert!(response.headers().get("content-type").unwrap().contains("javascript"));
    }

    #[tokio::test]
    async fn directories_use_the_index() {
        let folder = AssetFolder::new(fixture("index").await);

        let response = folder.serve(&request("GET / HTTP/1.1\r\n\r\n")).await.unwrap();
        assert_eq!(response.text(), Some("<h1>home</h1>"));
        assert_eq!(response.headers().get("content-type"), Some("text/html"));

        let response = folder.serve(&request("GET /docs HTTP/1.1\r\n\r\n")).await.unwrap();
        assert_eq!(response.text(), Some("<h1>docs</h1>"));
    }

    #[tokio::test]
    async fn misses_and_traversal_fall_through() {
        let folder = AssetFolder::new(fixture("miss").await.join("docs"));

        assert!(folder.serve(&request("GET /nope.txt HTTP/1.1\r\n\r\n")).await.is_none());
        assert!(folder.serve(&request("GET /../app.js HTTP/1.1\r\n\r\n")).await.is_none());
        assert!(folder.serve(&request("GET /%2e%2e/app.js HTTP/1.1\r\n\r\n")).await.is_none());
        assert!(folder.serve(&request("POST / HTTP/1.1\r\n\r\n")).await.is_none());
    }

    #[tokio::test]
    async fn head_reports_length_only() {
        let folder = AssetFolder::new(fixture("head").await);

        let response = folder.serve(&request("HEAD /app.js HTTP/1.1\r\n\r\n")).await.unwrap();
        assert!(response.body_ref().is_empty());
        assert_eq!(response.headers().get("content-length"), Some("10"));
    }
}
