//! Application wiring: state construction, janitor startup, serving, and
//! graceful shutdown.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::server::{build_router, AppState};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Coordinates the HTTP edge and the background janitors.
pub struct Application {
    state: AppState,
}

impl Application {
    pub fn new(settings: Settings) -> Result<Self> {
        let state = AppState::new(Arc::new(settings))?;
        Ok(Self { state })
    }

    pub fn settings(&self) -> &Settings {
        &self.state.settings
    }

    /// Serve until a shutdown signal arrives, then drain in-flight requests
    /// for up to the shutdown timeout. A drain that overruns the timeout is a
    /// forced shutdown and surfaces as an error (non-zero exit).
    pub async fn run(self) -> Result<()> {
        let settings = self.state.settings.clone();
        let router = build_router(self.state.clone());

        if let Some(cache) = self.state.proxy.cache() {
            cache.clone().spawn_janitor();
        }
        if let Some(limiter) = &self.state.limiter {
            limiter.clone().spawn_janitor();
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::internal(format!("failed to bind {addr}: {e}")))?;
        info!(%addr, "gaxy listening");

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(());
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(());
        });

        let mut deadline_rx = shutdown_rx.clone();
        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .into_future();

        tokio::select! {
            result = server => {
                result.map_err(|e| Error::internal(format!("server error: {e}")))?;
                info!("shutdown complete");
                Ok(())
            }
            _ = async {
                let _ = deadline_rx.changed().await;
                tokio::time::sleep(settings.shutdown_timeout).await;
            } => {
                warn!(timeout = ?settings.shutdown_timeout, "forced shutdown: drain deadline exceeded");
                Err(Error::internal("forced shutdown after drain deadline"))
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_builds_from_valid_settings() {
        let app = Application::new(Settings::for_tests()).expect("application should build");
        assert_eq!(app.settings().port, 3000);
    }

    #[test]
    fn disabled_limiter_is_not_constructed() {
        let mut settings = Settings::for_tests();
        settings.rate_limit_enabled = false;
        let app = Application::new(settings).unwrap();
        assert!(app.state.limiter.is_none());
    }

    #[test]
    fn disabled_cache_is_not_constructed() {
        let mut settings = Settings::for_tests();
        settings.cache_enabled = false;
        let app = Application::new(settings).unwrap();
        assert!(app.state.proxy.cache().is_none());
    }
}
