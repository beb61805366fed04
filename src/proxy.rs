//! Host-routing reverse proxy engine
//!
//! Terminates HTTP/1.1 and HTTP/2 at the proxy port, matches each
//! request's effective host against the route table, and forwards to the
//! owning backend at `127.0.0.1:<port>` as plain HTTP/1.1 through a pooled
//! client. WebSocket upgrades are relayed raw: the upgrade request is
//! rewritten onto a fresh backend socket and the two connections are piped
//! together once the backend switches protocols.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::{HeaderMap, Request, Response, StatusCode, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::error::{self, AbortConnection, ProxyBody, MAX_HOPS, X_PORTLESS_HOPS};
use crate::hostname::strip_port;
use crate::routes::Route;

/// Response headers stripped when relaying an HTTP/1.1 backend response to
/// an HTTP/2 client; they describe the hop, not the resource.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Longest a non-101 upgrade response body is read before relaying.
const UPGRADE_BODY_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared, live view of the route table. The daemon's watcher refreshes it;
/// the request path only ever takes the read lock.
pub type SharedRoutes = Arc<RwLock<Vec<Route>>>;

/// The routing engine. Cheap to clone; one instance serves every listener
/// branch (TLS and plain) of a daemon.
#[derive(Clone)]
pub struct ProxyEngine {
    routes: SharedRoutes,
    client: Client<HttpConnector, Incoming>,
    proxy_port: u16,
    tls: bool,
}

impl ProxyEngine {
    pub fn new(routes: SharedRoutes, proxy_port: u16, tls: bool) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);
        Self {
            routes,
            client,
            proxy_port,
            tls,
        }
    }

    /// Handle one request. `via_tls` says whether TLS terminated on this
    /// connection (the shim serves plain HTTP on the same port).
    /// `Err(AbortConnection)` makes hyper drop the connection without a
    /// response, which is how upgrade requests for unknown hosts die.
    pub async fn handle(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
        via_tls: bool,
    ) -> Result<Response<ProxyBody>, AbortConnection> {
        let upgrade = is_upgrade_request(&req);

        let Some(raw_host) = effective_host(&req) else {
            return Ok(error::missing_host());
        };
        let host = strip_port(&raw_host).to_string();
        if host.is_empty() {
            return Ok(error::missing_host());
        }

        let hops = parse_hops(req.headers());
        if hops >= MAX_HOPS {
            error!(
                %host,
                hops,
                "forwarding loop detected; a dev server is proxying back through portless \
                 without rewriting the Host header (changeOrigin)"
            );
            return Ok(error::loop_detected());
        }

        let route = {
            let routes = self.routes.read();
            routes.iter().find(|r| r.hostname == host).cloned()
        };
        let Some(route) = route else {
            if upgrade {
                debug!(%host, "upgrade for unknown host, closing connection");
                return Err(AbortConnection);
            }
            let listing = self.routes.read().clone();
            return Ok(error::unknown_host(&host, &listing, self.proxy_port, self.tls));
        };

        inject_forwarded_headers(req.headers_mut(), &raw_host, client_addr, via_tls, hops);

        debug!(
            %host,
            backend = route.port,
            method = %req.method(),
            uri = %req.uri(),
            upgrade,
            "routing request"
        );

        if upgrade {
            return self.handle_upgrade(req, &host, route.port).await;
        }

        self.forward(req, &host, route.port).await
    }

    /// Forward a plain HTTP request to the backend, streaming both bodies.
    async fn forward(
        &self,
        req: Request<Incoming>,
        host: &str,
        backend_port: u16,
    ) -> Result<Response<ProxyBody>, AbortConnection> {
        let was_h2 = req.version() == Version::HTTP_2;

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://127.0.0.1:{backend_port}{path_and_query}");

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(Version::HTTP_11);
        // HeaderMap cannot hold HTTP/2 pseudo-headers, so copying it wholesale
        // yields a clean HTTP/1.1 header set.
        for (name, value) in parts.headers.iter() {
            builder = builder.header(name, value);
        }
        let backend_req = match builder.body(body) {
            Ok(r) => r,
            Err(e) => {
                warn!(host, error = %e, "failed to build backend request");
                return Ok(error::bad_gateway(host, false));
            }
        };

        match self.client.request(backend_req).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                if was_h2 {
                    for header in HOP_BY_HOP_HEADERS {
                        parts.headers.remove(*header);
                    }
                }
                Ok(Response::from_parts(parts, body.boxed()))
            }
            Err(e) => {
                let refused = is_connection_refused(&e);
                error!(host, backend = backend_port, error = %e, refused, "backend request failed");
                Ok(error::bad_gateway(host, refused))
            }
        }
    }

    /// Relay a WebSocket (or other HTTP/1.1) upgrade. The backend's `101`
    /// is reproduced header-for-header; a non-101 answer is relayed
    /// verbatim and the connection closed.
    async fn handle_upgrade(
        &self,
        req: Request<Incoming>,
        host: &str,
        backend_port: u16,
    ) -> Result<Response<ProxyBody>, AbortConnection> {
        let backend_addr = format!("127.0.0.1:{backend_port}");
        let mut backend = match TcpStream::connect(&backend_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(host, backend = backend_port, error = %e, "backend connect failed for upgrade");
                let refused = e.kind() == std::io::ErrorKind::ConnectionRefused;
                return Ok(error::bad_gateway(host, refused));
            }
        };

        let raw_request = build_upgrade_request(&req);
        if let Err(e) = backend.write_all(&raw_request).await {
            error!(host, error = %e, "failed to send upgrade request to backend");
            return Ok(error::bad_gateway(host, false));
        }

        // Read the backend's response head; bytes past the blank line are
        // early frames that must reach the client after the switch.
        let (head, mut leftover) = match read_response_head(&mut backend).await {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(host, error = %e, "failed to read upgrade response from backend");
                return Ok(error::bad_gateway(host, false));
            }
        };
        let Some((status, headers)) = parse_response_head(&head) else {
            error!(host, "backend sent an unparsable upgrade response");
            return Ok(error::bad_gateway(host, false));
        };

        if status != StatusCode::SWITCHING_PROTOCOLS {
            debug!(host, status = %status, "backend declined the upgrade");
            let body = read_declined_body(&mut backend, &headers, std::mem::take(&mut leftover)).await;
            let mut builder = Response::builder().status(status);
            for (name, value) in &headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let response = builder
                .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
                .map_err(|_| AbortConnection)?;
            return Ok(response);
        }

        // Mirror the 101 head onto the hyper response, preserving header
        // order as sent by the backend.
        let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &headers {
            let lower = name.to_ascii_lowercase();
            if lower == "content-length" || lower == "transfer-encoding" {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder
            .body(empty_body())
            .map_err(|_| AbortConnection)?;

        let host_owned = host.to_string();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut client_io = TokioIo::new(upgraded);
                    if !leftover.is_empty() {
                        if let Err(e) = client_io.write_all(&leftover).await {
                            debug!(host = %host_owned, error = %e, "client closed during upgrade handoff");
                            return;
                        }
                    }
                    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
                        Ok((to_backend, to_client)) => {
                            debug!(
                                host = %host_owned,
                                to_backend, to_client, "upgraded connection closed"
                            );
                        }
                        Err(e) => {
                            debug!(host = %host_owned, error = %e, "upgraded connection closed with error");
                        }
                    }
                }
                Err(e) => {
                    error!(host = %host_owned, error = %e, "client upgrade failed");
                }
            }
        });

        Ok(response)
    }
}

fn empty_body() -> ProxyBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

/// The effective host: the `:authority` pseudo-header (surfaced by hyper as
/// the request URI's authority) for HTTP/2, else the `Host` header.
fn effective_host(req: &Request<Incoming>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.to_string());
    }
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse the hop-count header; absent or unparsable counts as zero.
fn parse_hops(headers: &HeaderMap) -> u32 {
    headers
        .get(X_PORTLESS_HOPS)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(0)
}

/// Inject the forwarding headers the backend sees. `X-Forwarded-For`
/// appends (chain-friendly); the other `X-Forwarded-*` headers are only
/// set when absent so an upstream proxy's values survive; the hop counter
/// is always advanced.
fn inject_forwarded_headers(
    headers: &mut HeaderMap,
    raw_host: &str,
    client_addr: SocketAddr,
    via_tls: bool,
    hops: u32,
) {
    let client_ip = client_addr.ip().to_string();
    let xff = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&xff) {
        headers.insert("x-forwarded-for", value);
    }

    if !headers.contains_key("x-forwarded-proto") {
        let proto = if via_tls { "https" } else { "http" };
        headers.insert("x-forwarded-proto", HeaderValue::from_static(proto));
    }

    if !headers.contains_key("x-forwarded-host") {
        if let Ok(value) = HeaderValue::from_str(raw_host) {
            headers.insert("x-forwarded-host", value);
        }
    }

    if !headers.contains_key("x-forwarded-port") {
        let port = raw_host
            .split_once(':')
            .and_then(|(_, p)| p.parse::<u16>().ok())
            .unwrap_or(if via_tls { 443 } else { 80 });
        if let Ok(value) = HeaderValue::from_str(&port.to_string()) {
            headers.insert("x-forwarded-port", value);
        }
    }

    let next = (hops + 1).to_string();
    if let Ok(value) = HeaderValue::from_str(&next) {
        headers.insert(HeaderName::from_static(X_PORTLESS_HOPS), value);
    }
}

/// Whether a request asks for a protocol upgrade (`Connection: upgrade`
/// plus an `Upgrade` header).
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let wants_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    wants_upgrade && req.headers().contains_key(UPGRADE)
}

/// Serialize the upgrade request for the backend as raw HTTP/1.1,
/// preserving header order.
fn build_upgrade_request(req: &Request<Incoming>) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut raw = format!("{} {} HTTP/1.1\r\n", req.method(), path);
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            raw.push_str(&format!("{name}: {v}\r\n"));
        }
    }
    raw.push_str("\r\n");
    raw.into_bytes()
}

/// Read from the backend until the end of the response head. Returns the
/// head bytes and whatever the backend sent past the blank line.
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    const MAX_HEAD: usize = 64 * 1024;
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed before completing the response head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response head too large",
            ));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Parse status code and header list out of a raw response head.
fn parse_response_head(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.lines();

    let status_line = lines.next()?;
    let code = status_line.split_whitespace().nth(1)?;
    let status = StatusCode::from_u16(code.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Some((status, headers))
}

/// Collect the body of a declined (non-101) upgrade response:
/// Content-Length bytes when declared, otherwise whatever arrives before
/// EOF or a short timeout.
async fn read_declined_body(
    stream: &mut TcpStream,
    headers: &[(String, String)],
    mut body: Vec<u8>,
) -> Vec<u8> {
    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok());

    let read_more = async {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(len) = content_length {
                if body.len() >= len {
                    break;
                }
            }
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
    };
    let _ = tokio::time::timeout(UPGRADE_BODY_TIMEOUT, read_more).await;
    body
}

/// Walk the error chain looking for a refused TCP connection, which gets
/// its own 502 body because it usually means the registered app crashed.
fn is_connection_refused(err: &hyper_util::client::legacy::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = current.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(entries: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in entries {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn client_addr() -> SocketAddr {
        "127.0.0.1:54321".parse().unwrap()
    }

    #[test]
    fn test_parse_hops() {
        assert_eq!(parse_hops(&headers_with(&[])), 0);
        assert_eq!(parse_hops(&headers_with(&[("x-portless-hops", "3")])), 3);
        assert_eq!(parse_hops(&headers_with(&[("x-portless-hops", "junk")])), 0);
        assert_eq!(parse_hops(&headers_with(&[("x-portless-hops", "")])), 0);
    }

    #[test]
    fn test_forwarded_headers_set_when_absent() {
        let mut headers = headers_with(&[("host", "myapp.localhost:1355")]);
        inject_forwarded_headers(&mut headers, "myapp.localhost:1355", client_addr(), false, 0);

        assert_eq!(headers.get("x-forwarded-for").unwrap(), "127.0.0.1");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(
            headers.get("x-forwarded-host").unwrap(),
            "myapp.localhost:1355"
        );
        assert_eq!(headers.get("x-forwarded-port").unwrap(), "1355");
        assert_eq!(headers.get("x-portless-hops").unwrap(), "1");
    }

    #[test]
    fn test_forwarded_headers_preserved_when_present() {
        let mut headers = headers_with(&[
            ("x-forwarded-for", "10.0.0.9"),
            ("x-forwarded-proto", "https"),
            ("x-forwarded-host", "public.example.com"),
            ("x-forwarded-port", "443"),
            ("x-portless-hops", "2"),
        ]);
        inject_forwarded_headers(&mut headers, "myapp.localhost", client_addr(), false, 2);

        // XFF appends; the rest keep their incoming values.
        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "10.0.0.9, 127.0.0.1"
        );
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "public.example.com");
        assert_eq!(headers.get("x-forwarded-port").unwrap(), "443");
        // The hop counter always advances.
        assert_eq!(headers.get("x-portless-hops").unwrap(), "3");
    }

    #[test]
    fn test_forwarded_port_defaults() {
        let mut headers = HeaderMap::new();
        inject_forwarded_headers(&mut headers, "myapp.localhost", client_addr(), true, 0);
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(headers.get("x-forwarded-port").unwrap(), "443");
    }

    #[test]
    fn test_is_upgrade_request() {
        let upgrade = Request::builder()
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&upgrade));

        let keepalive_only = Request::builder()
            .header(CONNECTION, "keep-alive")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&keepalive_only));

        let upgrade_header_only = Request::builder()
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&upgrade_header_only));
    }

    #[test]
    fn test_parse_response_head() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\n\
                     Upgrade: websocket\r\n\
                     Sec-WebSocket-Accept: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                     Sec-WebSocket-Protocol: graphql-ws\r\n\r\n";
        let (status, headers) = parse_response_head(head).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            headers,
            vec![
                ("Upgrade".to_string(), "websocket".to_string()),
                (
                    "Sec-WebSocket-Accept".to_string(),
                    "dGhlIHNhbXBsZSBub25jZQ==".to_string()
                ),
                (
                    "Sec-WebSocket-Protocol".to_string(),
                    "graphql-ws".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_parse_response_head_rejects_garbage() {
        assert!(parse_response_head(b"\xff\xfe").is_none());
        assert!(parse_response_head(b"nonsense\r\n\r\n").is_none());
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"HTTP/1.1 101 X\r\n\r\nrest"), Some(18));
        assert_eq!(find_head_end(b"partial\r\n"), None);
    }
}
