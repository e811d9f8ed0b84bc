//! Shared utilities for integration testing: scripted raw-TCP upstreams
//! and a proxy spawner bound to an ephemeral port.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use rmirror::config::{build_runtime, MirrorConfig, RouteConfig};
use rmirror::lifecycle::Controller;

/// Request head as seen by a mock upstream.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl ReceivedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Render a raw HTTP/1.1 response with Content-Length and close semantics.
pub fn http_response(status: u16, reason: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    ));
    out
}

/// Start a scripted mock upstream. Every accepted connection reads one
/// request head, records it, and writes whatever the scripted responder
/// produces.
pub async fn start_upstream<F, Fut>(respond: F) -> (SocketAddr, Arc<Mutex<Vec<ReceivedRequest>>>)
where
    F: Fn(ReceivedRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = String> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let respond = Arc::new(respond);

    let accept_log = log.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let respond = respond.clone();
            let log = accept_log.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let Some(request) = parse_request(&buf) else {
                    return;
                };
                log.lock().unwrap().push(request.clone());
                let response = respond(request).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, log)
}

fn parse_request(raw: &[u8]) -> Option<ReceivedRequest> {
    let head = String::from_utf8_lossy(raw);
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Some(ReceivedRequest {
        method,
        target,
        headers,
    })
}

/// A proxy config bound to an ephemeral loopback port with the given
/// routes and access logging off.
pub fn proxy_config(routes: Vec<RouteConfig>) -> MirrorConfig {
    let mut cfg = MirrorConfig::default();
    cfg.listen = "127.0.0.1:0".to_string();
    cfg.access_log = false;
    cfg.routes = routes;
    cfg
}

pub fn route(name: &str, prefix: &str, upstream: SocketAddr) -> RouteConfig {
    RouteConfig {
        name: name.to_string(),
        public_prefix: prefix.to_string(),
        upstream: format!("http://{upstream}"),
        preserve_host: false,
    }
}

/// Spawn the proxy and return its bound address plus the server handle.
pub async fn start_proxy(cfg: MirrorConfig) -> (SocketAddr, axum_server::Handle) {
    let runtime = build_runtime(&cfg).expect("test config must validate");
    let controller = Arc::new(Controller::new(
        PathBuf::from("unused-config.toml"),
        runtime,
        None,
        false,
    ));
    let handle = axum_server::Handle::new();
    let server_handle = handle.clone();
    tokio::spawn(async move {
        let _ = rmirror::net::serve(controller, server_handle).await;
    });
    let addr = handle.listening().await.expect("proxy failed to bind");
    (addr, handle)
}

/// A client that does not follow redirects, so Location headers can be
/// asserted as-is.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .unwrap()
}
