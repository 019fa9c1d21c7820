//! Pooled upstream HTTP client with retry logic.

use crate::config::Settings;
use crate::error::{Error, Result};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::error::Error as _;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

const MAX_IDLE_CONN_LIFETIME: Duration = Duration::from_secs(90);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONN_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A fully collected upstream response.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Connection-pooled client wrapping `reqwest` with linear-backoff retries.
///
/// Total in-flight connections are bounded by `UPSTREAM_MAX_CONNS` (there is
/// a single configured origin, so the global bound is the per-host bound);
/// callers wait at most `MAX_CONN_WAIT_TIMEOUT` for a slot before failing.
pub struct UpstreamClient {
    client: reqwest::Client,
    conns: Semaphore,
    retry_count: u32,
    retry_delay: Duration,
}

impl UpstreamClient {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(settings.upstream_max_idle_conns)
            .pool_idle_timeout(MAX_IDLE_CONN_LIFETIME)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(settings.upstream_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| Error::upstream("failed to build upstream client", e))?;

        Ok(Self {
            client,
            conns: Semaphore::new(settings.upstream_max_conns),
            retry_count: settings.upstream_retry_count,
            retry_delay: settings.upstream_retry_delay,
        })
    }

    /// Perform the request, retrying up to `retry_count` extra attempts.
    ///
    /// Attempt `n+1` is preceded by a `retry_delay * n` sleep. Only timeouts
    /// and closed-connection failures are retried; every attempt gets its own
    /// upstream timeout and holds one connection slot for its duration. The
    /// caller composes the final URL and headers; this method performs no
    /// mutation beyond network I/O.
    pub async fn dispatch(&self, url: &str, headers: HeaderMap) -> Result<UpstreamResponse> {
        let mut last_err: Option<reqwest::Error> = None;

        for attempt in 0..=self.retry_count {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay * attempt).await;
            }

            // Exhausted capacity is terminal, not retryable: waiting longer
            // would only deepen the queue.
            let permit =
                match tokio::time::timeout(MAX_CONN_WAIT_TIMEOUT, self.conns.acquire()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(closed)) => {
                        return Err(Error::upstream("upstream connection limiter closed", closed))
                    }
                    Err(elapsed) => {
                        return Err(Error::upstream(
                            "timed out waiting for a free upstream connection",
                            elapsed,
                        ))
                    }
                };

            let result = self.attempt(url, headers.clone()).await;
            drop(permit);

            match result {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let retryable = should_retry(&err);
                    warn!(attempt, error = %err, retryable, "upstream attempt failed");
                    last_err = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        match last_err {
            Some(err) => Err(Error::upstream("upstream request failed after retries", err)),
            None => Err(Error::internal("upstream dispatch finished without result")),
        }
    }

    async fn attempt(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> std::result::Result<UpstreamResponse, reqwest::Error> {
        let response = self.client.get(url).headers(headers).send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Timeouts and closed-connection failures are transient; anything else is
/// terminal.
///
/// A pooled connection torn down by the peer does not show up as a connect
/// error: it surfaces as a request error wrapping either an I/O failure
/// (reset, broken pipe) or the transport's closed-before-response error,
/// which carries no I/O cause at all.
fn should_retry(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }

    if !err.is_request() || err.is_body() || err.is_decode() {
        return false;
    }

    let mut cause: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(inner) = cause {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            );
        }
        cause = inner.source();
    }

    // No I/O cause exposed: the peer closed the connection before a full
    // response was read.
    true
}
