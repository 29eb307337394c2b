//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler function.
//! Connections are persistent unless the request asks otherwise, pipelined requests
//! are answered in order, and every open connection is tracked so that a
//! [`ShutdownHandle`] can stop the accept loop and drop them all.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it: the
/// largest accepted body plus 64 KiB of head.
const MAX_REQUEST_SIZE: usize = Request::MAX_BODY_SIZE + 64 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Open connections, each with the handle that tears its task down.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, (SocketAddr, AbortHandle)>>,
}

impl ConnectionRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, (SocketAddr, AbortHandle)>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every open connection. Requests already handed to the pipeline keep
    /// running; their responses are discarded. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, (peer, abort)) in &drained {
            debug!(peer = %peer, "closing connection");
            abort.abort();
        }
        drained.len()
    }
}

/// Stops a running [`Server`] from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    signal: Arc<watch::Sender<bool>>,
    connections: Arc<ConnectionRegistry>,
}

impl ShutdownHandle {
    /// Stops accepting and closes every open connection.
    pub fn shutdown(&self) {
        self.signal.send_replace(true);
        self.connections.close_all();
    }
}

/// The gateway's HTTP/1.1 server.
///
/// # Examples
///
/// ```rust,no_run
/// use rpcgate::server::Server;
/// use rpcgate::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|_req| async {
///         Response::new(StatusCode::OK).body("Hello!")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: Arc<ConnectionRegistry>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            local_addr,
            connections: Arc::default(),
            shutdown: Arc::new(shutdown),
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.connections)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            signal: Arc::clone(&self.shutdown),
            connections: Arc::clone(&self.connections),
        }
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// Each request runs as its own task, so a client that disconnects early never
    /// cancels the work it started. Runs until [`ShutdownHandle::shutdown`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let mut shutdown = self.shutdown.subscribe();
        info!(address = %self.local_addr, "rpcgate listening");

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);
            let registry = Arc::clone(&self.connections);
            let id = self.connections.next_id.fetch_add(1, Ordering::Relaxed);

            // Held across the spawn so the task cannot deregister before it is registered.
            let mut open = self.connections.lock();
            let task = tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
                registry.remove(id);
            });
            open.insert(id, (peer_addr, task.abort_handle()));
            drop(open);
        }

        let closed = self.connections.close_all();
        info!(address = %self.local_addr, closed, "rpcgate stopped");
        Ok(())
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, answering one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`. While a request is in the pipeline the socket is still
/// read, both to buffer pipelined requests and to notice the peer going away.
/// A peer that only shuts down its write side still gets its response; one that
/// resets the connection, or can no longer be written to, has it discarded.
async fn handle_connection<H, F>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    let mut read_closed = false;

    loop {
        let (request, consumed) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                // Guard against excessively large requests.
                if buf.len() > MAX_REQUEST_SIZE {
                    warn!(peer = %peer_addr, "request too large, sending 413");
                    too_large().write_to(&mut writer).await?;
                    break;
                }
                if read_closed || reader.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    break;
                }
                continue;
            }
            Err(e @ RequestError::BodyTooLarge { .. }) => {
                warn!(peer = %peer_addr, error = %e, "request too large, sending 413");
                too_large().write_to(&mut writer).await?;
                break;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                Response::new(StatusCode::BAD_REQUEST)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false)
                    .write_to(&mut writer)
                    .await?;
                break;
            }
        };

        // Drop the consumed request bytes from the buffer.
        let _ = buf.split_to(consumed);
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let mut pipeline = tokio::spawn(handler(request.with_remote_addr(peer_addr)));
        let outcome = loop {
            tokio::select! {
                outcome = &mut pipeline => break outcome,
                read = reader.read_buf(&mut buf), if !read_closed && buf.len() <= MAX_REQUEST_SIZE => match read {
                    // A half-closed peer can still read the response.
                    Ok(0) => read_closed = true,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(peer = %peer_addr, error = %e, "peer went away, discarding the response");
                        return Ok(());
                    }
                },
            }
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                error!(peer = %peer_addr, error = %e, "request task failed");
                Response::new(StatusCode::INTERNAL_SERVER_ERROR).body("Internal Server Error")
            }
        };
        let written = match response.keep_alive(keep_alive).write_to(&mut writer).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!(peer = %peer_addr, error = %e, "peer went away, discarding the response");
            return Ok(());
        }

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

fn too_large() -> Response {
    Response::new(StatusCode::PAYLOAD_TOO_LARGE)
        .body("Request entity too large")
        .keep_alive(false)
}
