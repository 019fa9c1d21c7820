//! Edge middleware: request IDs, logging, metrics, rate limiting, security
//! headers, CORS, and panic recovery.

use crate::config::Settings;
use crate::metrics::Metrics;
use crate::server::error_response::error_response;
use crate::server::handlers::client_ip;
use crate::server::headers::X_REQUEST_ID;
use crate::server::AppState;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Ensure every request carries an `X-Request-ID`, propagating a caller-supplied
/// one and echoing it on the response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .filter(|value| !value.is_empty())
        .cloned()
        .unwrap_or_else(|| {
            HeaderValue::from_str(&Uuid::now_v7().to_string())
                .expect("UUID v7 should always produce a valid header value")
        });

    request
        .headers_mut()
        .insert(X_REQUEST_ID, request_id.clone());

    let mut response = next.run(request).await;
    response.headers_mut().insert(X_REQUEST_ID, request_id);
    response
}

/// Structured request/response logging with timing.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let ip = client_ip(&request);
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    info!(
        request_id,
        method = %method,
        path,
        ip,
        user_agent,
        "request started"
    );

    let response = next.run(request).await;
    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;

    if status >= 500 {
        error!(request_id, method = %method, path, status, duration_ms, "request failed");
    } else if status >= 400 {
        warn!(
            request_id,
            method = %method,
            path,
            status,
            duration_ms,
            "request completed with client error"
        );
    } else {
        info!(request_id, method = %method, path, status, duration_ms, "request completed");
    }

    response
}

/// Track the in-flight gauge and per-status duration histogram.
pub async fn metrics_middleware(
    State(metrics): State<Arc<Metrics>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    metrics.inc_requests_in_flight();

    let response = next.run(request).await;

    metrics.dec_requests_in_flight();
    metrics.record_request(response.status().as_u16(), start.elapsed());
    response
}

/// Deny requests once the client's token bucket is empty.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(limiter) = &state.limiter {
        let ip = client_ip(&request);
        if !limiter.allow(&ip) {
            state.metrics.record_rate_limit_drop();
            warn!(ip, "rate limit exceeded");
            return error_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
        }
    }

    next.run(request).await
}

/// Standard browser hardening headers.
pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert("x-frame-options", HeaderValue::from_static("SAMEORIGIN"));
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-xss-protection", HeaderValue::from_static("1; mode=block"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    response
}

/// CORS with configurable allowed origins; preflights short-circuit to 204.
pub async fn cors_middleware(
    State(settings): State<Arc<Settings>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = if settings.cors_allow_origins.is_empty() {
        "*"
    } else {
        settings.cors_allow_origins.as_str()
    };
    let origin = HeaderValue::from_str(origin).unwrap_or(HeaderValue::from_static("*"));

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", origin);
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type, Authorization, X-Request-ID"),
    );
    headers.insert("access-control-max-age", HeaderValue::from_static("3600"));

    response
}

/// Convert a panicking handler into a 500 response instead of a dropped
/// connection.
pub async fn recovery_middleware(request: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());

            error!(panic = %detail, "panic recovered");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::middleware::from_fn;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn ok() -> &'static str {
        "ok"
    }

    #[tokio::test]
    async fn request_id_is_generated_when_missing() {
        let app = Router::new()
            .route("/", get(ok))
            .layer(from_fn(request_id_middleware));

        let response = app
            .oneshot(axum::http::Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let id = response.headers().get(X_REQUEST_ID).expect("id expected");
        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn request_id_is_propagated_when_present() {
        let app = Router::new()
            .route("/", get(ok))
            .layer(from_fn(request_id_middleware));

        let response = app
            .oneshot(
                axum::http::Request::get("/")
                    .header(X_REQUEST_ID, "req-from-edge-proxy")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get(X_REQUEST_ID).unwrap(),
            "req-from-edge-proxy"
        );
    }

    #[tokio::test]
    async fn security_headers_are_applied() {
        let app = Router::new()
            .route("/", get(ok))
            .layer(from_fn(security_headers_middleware));

        let response = app
            .oneshot(axum::http::Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.headers().get("x-frame-options").unwrap(), "SAMEORIGIN");
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(
            response.headers().get("x-xss-protection").unwrap(),
            "1; mode=block"
        );
        assert_eq!(
            response.headers().get("referrer-policy").unwrap(),
            "strict-origin-when-cross-origin"
        );
    }

    #[tokio::test]
    async fn preflight_short_circuits_to_no_content() {
        let settings = Arc::new(Settings::for_tests());
        let app = Router::new().route("/", get(ok)).layer(
            axum::middleware::from_fn_with_state(settings, cors_middleware),
        );

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/collect")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn panics_become_500_json() {
        async fn boom() -> &'static str {
            panic!("handler exploded");
        }

        let app = Router::new()
            .route("/", get(boom))
            .layer(from_fn(recovery_middleware));

        let response = app
            .oneshot(axum::http::Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"error":"Internal server error"}"#);
    }
}
