//! Responses the proxy generates itself
//!
//! Everything portless answers on its own behalf (rather than relaying
//! from a backend) carries the `X-Portless: 1` identity header, which is
//! also what daemon discovery probes for to tell a portless proxy apart
//! from any other server squatting on the port.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

use crate::hostname::{display_url, escape_html};
use crate::routes::Route;

/// Identity header set on every self-generated response.
pub const X_PORTLESS: &str = "x-portless";

/// Hop-count request header used for forwarding-loop detection.
pub const X_PORTLESS_HOPS: &str = "x-portless-hops";

/// Requests that have traversed the proxy this many times are refused.
pub const MAX_HOPS: u32 = 5;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Returned from the request handler to make hyper drop the connection
/// without writing any response (used when an upgrade names an unknown
/// host).
#[derive(Debug)]
pub struct AbortConnection;

impl std::fmt::Display for AbortConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection aborted")
    }
}

impl std::error::Error for AbortConnection {}

fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

fn self_response(status: StatusCode, content_type: &str, body: String) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .header(X_PORTLESS, "1")
        .body(full_body(body))
        .expect("valid response with static headers")
}

/// `400` for requests with no usable Host header or :authority.
pub fn missing_host() -> Response<ProxyBody> {
    self_response(
        StatusCode::BAD_REQUEST,
        "text/plain",
        "Missing Host header\n".to_string(),
    )
}

/// `404` page listing the currently registered routes as links. Every
/// user-controlled string is HTML-escaped before embedding.
pub fn unknown_host(requested: &str, routes: &[Route], proxy_port: u16, tls: bool) -> Response<ProxyBody> {
    let mut list = String::new();
    for route in routes {
        let host = escape_html(&route.hostname);
        let url = escape_html(&display_url(&route.hostname, proxy_port, tls));
        list.push_str(&format!(
            "    <li><a href=\"{url}\">{host}</a> &rarr; 127.0.0.1:{}</li>\n",
            route.port
        ));
    }
    if list.is_empty() {
        list.push_str("    <li><em>no apps registered</em></li>\n");
    }

    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>portless: not found</title></head>\n<body>\n  \
         <h1>404 Not Found</h1>\n  <p>No app is registered for <code>{}</code>.</p>\n  \
         <p>Registered apps:</p>\n  <ul>\n{list}  </ul>\n</body>\n</html>\n",
        escape_html(requested)
    );

    self_response(StatusCode::NOT_FOUND, "text/html", body)
}

/// `508` once a request has looped through the proxy too many times.
pub fn loop_detected() -> Response<ProxyBody> {
    self_response(
        StatusCode::LOOP_DETECTED,
        "text/plain",
        "Loop detected: this request has passed through portless repeatedly.\n\
         A dev server is probably proxying back through portless without\n\
         rewriting the Host header; set changeOrigin: true (or the\n\
         equivalent) in its proxy configuration.\n"
            .to_string(),
    )
}

/// `502` when the backend cannot be reached. A connection refusal gets a
/// more specific hint, since it usually means the app crashed after
/// registering.
pub fn bad_gateway(host: &str, refused: bool) -> Response<ProxyBody> {
    let body = if refused {
        format!(
            "502 Bad Gateway: the app behind {host} is not responding.\n\
             It may have crashed; check its terminal output.\n"
        )
    } else {
        format!("502 Bad Gateway: error talking to the app behind {host}.\n")
    };
    self_response(StatusCode::BAD_GATEWAY, "text/plain", body)
}
