//! HTTP edge: routing, middleware chain, and response writing.
//!
//! The edge classifies requests (`/ping`, `/health`, the metrics path),
//! applies the middleware chain, and hands everything else to the proxy
//! engine via the fallback handler.

pub mod error_response;
pub mod handlers;
pub mod headers;
pub mod middleware;

use crate::config::Settings;
use crate::metrics::Metrics;
use crate::proxy::ProxyService;
use crate::ratelimit::RateLimiter;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Instant;

/// Shared state behind every handler and stateful middleware.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub proxy: Arc<ProxyService>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(settings: Arc<Settings>) -> crate::error::Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let proxy = Arc::new(ProxyService::new(settings.clone(), metrics.clone())?);
        let limiter = settings.rate_limit_enabled.then(|| {
            Arc::new(RateLimiter::new(
                settings.rate_limit_rps,
                settings.rate_limit_burst,
            ))
        });

        Ok(Self {
            settings,
            proxy,
            limiter,
            metrics,
            started_at: Instant::now(),
        })
    }
}

/// Assemble the router with the middleware chain.
///
/// Layer order, outermost first: panic recovery, request ID, logging,
/// metrics, security headers, CORS, rate limiting. Recovery wraps everything
/// so even middleware panics become 500s; the limiter runs before routing, so
/// named routes are limited like proxy candidates.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route(headers::paths::PING, get(handlers::ping))
        .route(headers::paths::HEALTH, get(handlers::health));

    if state.settings.metrics_enabled {
        router = router.route(state.settings.metrics_path.as_str(), get(handlers::metrics));
    }

    let mut router = router
        .fallback(handlers::proxy)
        .with_state(state.clone());

    // `.layer` wraps outside-in, so the innermost middleware is added first.
    if state.settings.rate_limit_enabled {
        router = router.layer(from_fn_with_state(
            state.clone(),
            middleware::rate_limit_middleware,
        ));
    }
    if state.settings.enable_cors {
        router = router.layer(from_fn_with_state(
            state.settings.clone(),
            middleware::cors_middleware,
        ));
    }
    if state.settings.enable_security_headers {
        router = router.layer(from_fn(middleware::security_headers_middleware));
    }

    router
        .layer(from_fn_with_state(
            state.metrics.clone(),
            middleware::metrics_middleware,
        ))
        .layer(from_fn(middleware::logging_middleware))
        .layer(from_fn(middleware::request_id_middleware))
        .layer(from_fn(middleware::recovery_middleware))
}
