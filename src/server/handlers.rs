//! Route handlers: health probes, metrics export, and the proxy fallback.

use crate::server::error_response::engine_error_response;
use crate::server::headers::{
    METRICS_CONTENT_TYPE, PROXY_NAME, X_FORWARDED_FOR, X_FORWARDED_HOST, X_PROXY_BY,
};
use crate::server::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{error, warn};

pub async fn ping() -> &'static str {
    "pong"
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let uptime = state.started_at.elapsed();

    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": humantime::format_duration(std::time::Duration::from_secs(uptime.as_secs()))
            .to_string(),
        "system": {
            "pid": std::process::id(),
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        },
    }))
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    (
        [(CONTENT_TYPE, METRICS_CONTENT_TYPE)],
        state.metrics.export(),
    )
        .into_response()
}

/// Fallback handler: everything that is not a named route is a proxy
/// candidate, regardless of method.
pub async fn proxy(State(state): State<AppState>, request: Request) -> Response {
    let mut req_uri = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let prefix = &state.settings.route_prefix;
    if !prefix.is_empty() && req_uri.starts_with(&format!("{prefix}/")) {
        req_uri = req_uri[prefix.len()..].to_string();
    }

    let headers = collect_headers(&request);
    let public_host = public_host(&request);

    let mut response = match state
        .proxy
        .proxy_request(&req_uri, &headers, &public_host)
        .await
    {
        Ok(proxied) => {
            let mut response = (proxied.status, proxied.body).into_response();
            if !proxied.content_type.is_empty() {
                if let Ok(content_type) = HeaderValue::from_str(&proxied.content_type) {
                    response.headers_mut().insert(CONTENT_TYPE, content_type);
                }
            }
            response
        }
        Err(err @ crate::error::Error::Validation(_)) => {
            warn!(uri = %req_uri, error = %err, "request rejected by validation");
            engine_error_response(&err)
        }
        Err(err) => {
            error!(uri = %req_uri, error = %err, "proxy request failed");
            engine_error_response(&err)
        }
    };

    response
        .headers_mut()
        .insert(X_PROXY_BY, HeaderValue::from_static(PROXY_NAME));
    response
}

/// All inbound headers (axum lowercases names) plus the synthetic `uip` and
/// `ua` entries the engine injects from.
fn collect_headers(request: &Request) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }

    headers.insert("uip".to_string(), client_ip(request));
    if let Some(ua) = request
        .headers()
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
    {
        if !ua.is_empty() {
            headers.insert("ua".to_string(), ua.to_string());
        }
    }

    headers
}

/// Client identity: the first forwarded address when fronted by a trusted
/// proxy, otherwise the socket peer.
pub fn client_ip(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Externally visible host for script rewriting: `X-Forwarded-Host` wins,
/// then the request's own host.
fn public_host(request: &Request) -> String {
    for candidate in [
        request.headers().get(X_FORWARDED_HOST),
        request.headers().get(HOST),
    ]
    .into_iter()
    .flatten()
    {
        if let Ok(host) = candidate.to_str() {
            if !host.is_empty() {
                return host.to_string();
            }
        }
    }

    request
        .uri()
        .authority()
        .map(|authority| authority.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(headers: &[(&str, &str)]) -> Request {
        let mut builder = axum::http::Request::builder().uri("/collect?v=1");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn client_ip_prefers_first_forwarded_address() {
        let request = request_with(&[("x-forwarded-for", "9.9.9.9, 10.0.0.1")]);
        assert_eq!(client_ip(&request), "9.9.9.9");
    }

    #[test]
    fn client_ip_falls_back_to_unknown_without_peer_info() {
        let request = request_with(&[]);
        assert_eq!(client_ip(&request), "unknown");
    }

    #[test]
    fn public_host_prefers_forwarded_host() {
        let request = request_with(&[("x-forwarded-host", "hihihi.com"), ("host", "example.com")]);
        assert_eq!(public_host(&request), "hihihi.com");

        let request = request_with(&[("host", "example.com")]);
        assert_eq!(public_host(&request), "example.com");
    }

    #[test]
    fn collected_headers_include_synthetic_entries() {
        let request = request_with(&[
            ("user-agent", "Unitest"),
            ("x-forwarded-for", "9.9.9.9"),
            ("x-email", "me@duyet.net"),
        ]);

        let headers = collect_headers(&request);
        assert_eq!(headers.get("uip").unwrap(), "9.9.9.9");
        assert_eq!(headers.get("ua").unwrap(), "Unitest");
        assert_eq!(headers.get("x-email").unwrap(), "me@duyet.net");
    }
}
