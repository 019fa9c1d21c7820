//! HTTP header and path constants for the edge.

/// Identifies proxied responses.
pub const X_PROXY_BY: &str = "x-proxy-by";

/// Value of the proxy identification header.
pub const PROXY_NAME: &str = "gaxy";

/// Request ID for tracing and correlation.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Externally visible host when fronted by another reverse proxy.
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Client address chain when fronted by another reverse proxy.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Prometheus text exposition content type.
pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Well-known routes.
pub mod paths {
    pub const PING: &str = "/ping";
    pub const HEALTH: &str = "/health";
}
