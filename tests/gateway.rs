//! End-to-end tests: a gateway served over a real TCP socket.

use std::net::SocketAddr;
use std::sync::Arc;

use rpcgate::backend::{ActionDef, LocalBackend, Service, action_fn};
use rpcgate::config::{GatewaySettings, MappingPolicy};
use rpcgate::gateway::{Gateway, HandlerSpec};
use rpcgate::security::{CorsPolicy, OneOrMany, RateLimitPolicy};
use rpcgate::server::{Server, ShutdownHandle};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

fn backend() -> LocalBackend {
    LocalBackend::new().service(Service::new("math").action(ActionDef::new(
        "test",
        action_fn(|params, _| {
            let arg = |key: &str| {
                params
                    .get(key)
                    .and_then(Value::as_str)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0)
            };
            Ok(json!(arg("p1") + arg("p2")).into())
        }),
    )))
}

async fn serve(gateway: Gateway) -> (SocketAddr, ShutdownHandle) {
    init_tracing();
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    let handle = server.shutdown_handle();
    tokio::spawn(Arc::new(gateway).serve(server));
    (addr, handle)
}

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

fn parse_reply(raw: &str) -> Reply {
    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let mut lines = head.lines();
    let status = lines.next().unwrap().split(' ').nth(1).unwrap().parse().unwrap();
    let headers = lines
        .filter_map(|line| line.split_once(": "))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
    Reply {
        status,
        headers,
        body: body.to_owned(),
    }
}

/// Sends one request on a fresh connection and reads until the server closes it.
async fn call(addr: SocketAddr, method: &str, url: &str, headers: &[(&str, &str)]) -> Reply {
    let mut raw = format!("{method} {url} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    for (name, value) in headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str("\r\n");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    parse_reply(&String::from_utf8(out).unwrap())
}

#[tokio::test]
async fn whitelisted_action_returns_json() {
    let gateway = Gateway::builder(GatewaySettings::default(), Arc::new(backend()))
        .handler(HandlerSpec::new("/api").whitelist(["math.*"]))
        .build()
        .unwrap();
    let (addr, shutdown) = serve(gateway).await;

    let reply = call(addr, "GET", "/api/math/test?p1=1&p2=2", &[]).await;
    assert_eq!(reply.status, 200);
    assert!(reply.header("content-type").unwrap().starts_with("application/json"));
    assert_eq!(reply.header("content-length"), Some("1"));
    assert_eq!(reply.body, "3");

    shutdown.shutdown();
}

#[tokio::test]
async fn rate_limit_reports_remaining_then_rejects() {
    let policy = RateLimitPolicy {
        window_size_ms: Some(60_000),
        limit: Some(3),
        headers: Some(true),
    };
    let gateway = Gateway::builder(GatewaySettings::default(), Arc::new(backend()))
        .handler(HandlerSpec::new("/api").rate_limit(policy))
        .build()
        .unwrap();
    let (addr, shutdown) = serve(gateway).await;

    for remaining in ["2", "1", "0"] {
        let reply = call(addr, "GET", "/api/math/test", &[]).await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.header("x-rate-limit-remaining"), Some(remaining));
        assert_eq!(reply.header("x-rate-limit-limit"), Some("3"));
        assert_eq!(reply.header("x-rate-limit-window"), Some("60000"));
    }

    let reply = call(addr, "GET", "/api/math/test", &[]).await;
    assert_eq!(reply.status, 429);
    let body = reply.json();
    assert_eq!(body["name"], "RateLimitExceededError");
    assert_eq!(body["code"], 429);
    assert_eq!(body["message"], "Too many requests.");

    shutdown.shutdown();
}

#[tokio::test]
async fn cors_origin_globs() {
    let policy = CorsPolicy {
        origin: Some(OneOrMany::from(vec!["http://*.a.com", "http://*.localhost:5147"])),
        ..CorsPolicy::default()
    };
    let gateway = Gateway::builder(GatewaySettings::default(), Arc::new(backend()))
        .handler(HandlerSpec::new("/api").cors(policy))
        .build()
        .unwrap();
    let (addr, shutdown) = serve(gateway).await;

    let reply = call(
        addr,
        "GET",
        "/api/math/test",
        &[("Origin", "http://test.localhost:5147")],
    )
    .await;
    assert_eq!(reply.status, 200);
    assert_eq!(
        reply.header("access-control-allow-origin"),
        Some("http://test.localhost:5147")
    );
    assert_eq!(reply.header("vary"), Some("Origin"));

    let reply = call(addr, "GET", "/api/math/test", &[("Origin", "http://localhost:5147")]).await;
    assert_eq!(reply.status, 403);
    assert_eq!(reply.json()["code"], "HTTP_ORIGIN_NOT_ALLOWED");

    let reply = call(
        addr,
        "OPTIONS",
        "/api/math/test",
        &[
            ("Origin", "http://x.a.com"),
            ("Access-Control-Request-Method", "POST"),
            ("Access-Control-Request-Headers", "X-Token"),
        ],
    )
    .await;
    assert_eq!(reply.status, 204);
    assert_eq!(reply.body, "");
    assert_eq!(reply.header("access-control-allow-headers"), Some("X-Token"));

    shutdown.shutdown();
}

#[tokio::test]
async fn mapping_policy_decides_implicit_actions() {
    let gateway = Gateway::builder(GatewaySettings::default(), Arc::new(backend()))
        .handler(HandlerSpec::new("/strict").mapping_policy(MappingPolicy::Restricted))
        .handler(HandlerSpec::new("/open").mapping_policy(MappingPolicy::All))
        .build()
        .unwrap();
    let (addr, shutdown) = serve(gateway).await;

    let reply = call(addr, "GET", "/strict/math/test?p1=1&p2=2", &[]).await;
    assert_eq!(reply.status, 404);
    assert_eq!(reply.body, "Not found");

    let reply = call(addr, "GET", "/open/math/test?p1=1&p2=2", &[]).await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "3");

    shutdown.shutdown();
}

#[tokio::test]
async fn settings_file_drives_the_gateway() {
    let settings = GatewaySettings::from_toml_str(
        r#"
        path = "/v2"

        [[handlers]]
        path = "/api"
        whitelist = ["math.*"]
        mapping_policy = "restricted"

        [handlers.routes]
        "GET /sum/:p1/:p2" = "math.test"
        "#,
    )
    .unwrap();
    settings.validate().unwrap();

    let gateway = Gateway::builder(settings, Arc::new(backend())).build().unwrap();
    let (addr, shutdown) = serve(gateway).await;

    let reply = call(addr, "GET", "/v2/api/sum/20/22", &[]).await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "42");

    let reply = call(addr, "GET", "/v2/api/math/test", &[]).await;
    assert_eq!(reply.status, 404);

    shutdown.shutdown();
}

#[tokio::test]
async fn keep_alive_serves_several_requests_per_connection() {
    let gateway = Gateway::builder(GatewaySettings::default(), Arc::new(backend()))
        .handler(HandlerSpec::new("/api"))
        .build()
        .unwrap();
    let (addr, shutdown) = serve(gateway).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /api/math/test?p1=1 HTTP/1.1\r\nX-Request-Id: r-1\r\n\r\n")
        .await
        .unwrap();

    let mut buf = vec![0u8; 1024];
    let mut first = String::new();
    while !first.ends_with("\r\n\r\n1") {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed early");
        first.push_str(std::str::from_utf8(&buf[..n]).unwrap());
    }
    let reply = parse_reply(&first);
    assert_eq!(reply.header("connection"), Some("keep-alive"));
    assert_eq!(reply.header("x-request-id"), Some("r-1"));

    stream
        .write_all(b"GET /api/math/test?p2=5 HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    let reply = parse_reply(&String::from_utf8(rest).unwrap());
    assert_eq!(reply.body, "5");
    assert_eq!(reply.header("connection"), Some("close"));

    shutdown.shutdown();
}
