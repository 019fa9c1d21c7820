//! Application configuration loaded from environment variables.
//!
//! Every variable has an explicit default registered on the builder, so the
//! full schema is visible in one place. Values are validated once at startup;
//! a validation failure aborts the process.

use crate::error::{Error, Result};
use config::{Config, Environment};
use http::Uri;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    // Server
    pub port: u16,
    #[serde(deserialize_with = "de_duration")]
    pub shutdown_timeout: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub read_timeout: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub write_timeout: Duration,

    // Routing
    pub route_prefix: String,

    // Upstream
    pub google_origin: String,
    #[serde(deserialize_with = "de_duration")]
    pub upstream_timeout: Duration,
    pub upstream_max_idle_conns: usize,
    pub upstream_max_conns: usize,
    pub upstream_retry_count: u32,
    #[serde(deserialize_with = "de_duration")]
    pub upstream_retry_delay: Duration,

    // Header injection
    pub inject_params_from_req_headers: String,
    pub skip_params_from_req_headers: String,

    // Cache
    pub cache_enabled: bool,
    #[serde(deserialize_with = "de_duration")]
    pub cache_ttl: Duration,
    pub cache_max_size: u64,
    pub cache_key_pattern: String,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_rps: u32,
    pub rate_limit_burst: u32,

    // Logging
    pub log_level: String,
    pub log_format: String,

    // Metrics
    pub metrics_enabled: bool,
    pub metrics_path: String,

    // Security
    pub enable_cors: bool,
    pub cors_allow_origins: String,
    pub enable_security_headers: bool,
}

/// A header-to-query-parameter mapping derived from
/// `INJECT_PARAMS_FROM_REQ_HEADERS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMapping {
    /// Lowercased inbound header name.
    pub header_name: String,
    /// Query parameter name the value is appended under.
    pub param_name: String,
}

impl Settings {
    /// Load settings from the environment with defaults applied.
    pub fn load() -> Result<Self> {
        let config = Self::builder()
            .map_err(|e| Error::config_with("failed to load configuration", e))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| Error::config_with("failed to parse configuration", e))?;

        settings.validate()?;
        Ok(settings)
    }

    fn builder() -> std::result::Result<Config, config::ConfigError> {
        Config::builder()
            .set_default("port", 3000)?
            .set_default("shutdown_timeout", "10s")?
            .set_default("read_timeout", "30s")?
            .set_default("write_timeout", "30s")?
            .set_default("route_prefix", "")?
            .set_default("google_origin", "https://www.google-analytics.com")?
            .set_default("upstream_timeout", "10s")?
            .set_default("upstream_max_idle_conns", 100)?
            .set_default("upstream_max_conns", 100)?
            .set_default("upstream_retry_count", 2)?
            .set_default("upstream_retry_delay", "100ms")?
            .set_default("inject_params_from_req_headers", "")?
            .set_default("skip_params_from_req_headers", "")?
            .set_default("cache_enabled", true)?
            .set_default("cache_ttl", "5m")?
            .set_default("cache_max_size", 104_857_600)?
            .set_default("cache_key_pattern", "*.js")?
            .set_default("rate_limit_enabled", true)?
            .set_default("rate_limit_rps", 100)?
            .set_default("rate_limit_burst", 200)?
            .set_default("log_level", "info")?
            .set_default("log_format", "json")?
            .set_default("metrics_enabled", true)?
            .set_default("metrics_path", "/metrics")?
            .set_default("enable_cors", true)?
            .set_default("cors_allow_origins", "*")?
            .set_default("enable_security_headers", true)?
            .add_source(Environment::default().try_parsing(true))
            .build()
    }

    /// Validate the loaded values. Called by `load`; failure aborts startup.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::config("PORT must be a non-zero port number"));
        }

        if self.google_origin.is_empty() {
            return Err(Error::config("GOOGLE_ORIGIN cannot be empty"));
        }
        let (scheme, _) = self.parsed_origin()?;
        if scheme != "http" && scheme != "https" {
            return Err(Error::config(format!(
                "GOOGLE_ORIGIN must use http or https scheme, got: {scheme}"
            )));
        }

        if !self.route_prefix.is_empty() {
            if !self.route_prefix.starts_with('/') {
                return Err(Error::config("ROUTE_PREFIX must start with /"));
            }
            if self.route_prefix.ends_with('/') {
                return Err(Error::config("ROUTE_PREFIX must not end with /"));
            }
        }

        if self.upstream_timeout.is_zero() {
            return Err(Error::config("UPSTREAM_TIMEOUT must be positive"));
        }
        if self.read_timeout.is_zero() {
            return Err(Error::config("READ_TIMEOUT must be positive"));
        }
        if self.write_timeout.is_zero() {
            return Err(Error::config("WRITE_TIMEOUT must be positive"));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(Error::config("SHUTDOWN_TIMEOUT must be positive"));
        }

        if self.upstream_max_idle_conns == 0 {
            return Err(Error::config("UPSTREAM_MAX_IDLE_CONNS must be positive"));
        }
        if self.upstream_max_conns == 0 {
            return Err(Error::config("UPSTREAM_MAX_CONNS must be positive"));
        }
        if self.upstream_max_conns < self.upstream_max_idle_conns {
            return Err(Error::config(
                "UPSTREAM_MAX_CONNS must be >= UPSTREAM_MAX_IDLE_CONNS",
            ));
        }

        if self.cache_enabled {
            if self.cache_ttl.is_zero() {
                return Err(Error::config("CACHE_TTL must be positive when cache is enabled"));
            }
            if self.cache_max_size == 0 {
                return Err(Error::config(
                    "CACHE_MAX_SIZE must be positive when cache is enabled",
                ));
            }
        }

        if self.rate_limit_enabled {
            if self.rate_limit_rps == 0 {
                return Err(Error::config(
                    "RATE_LIMIT_RPS must be positive when rate limiting is enabled",
                ));
            }
            if self.rate_limit_burst == 0 {
                return Err(Error::config(
                    "RATE_LIMIT_BURST must be positive when rate limiting is enabled",
                ));
            }
        }

        match self.log_level.to_lowercase().as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(Error::config(format!(
                    "invalid LOG_LEVEL: {other} (must be debug, info, warn, or error)"
                )))
            }
        }
        if self.log_format != "json" && self.log_format != "text" {
            return Err(Error::config(format!(
                "invalid LOG_FORMAT: {} (must be json or text)",
                self.log_format
            )));
        }

        if !self.metrics_path.starts_with('/') {
            return Err(Error::config("METRICS_PATH must start with /"));
        }

        Ok(())
    }

    /// Scheme and authority of the upstream origin.
    pub fn parsed_origin(&self) -> Result<(String, String)> {
        let uri: Uri = self
            .google_origin
            .parse()
            .map_err(|e: http::uri::InvalidUri| Error::config_with("invalid GOOGLE_ORIGIN URL", e))?;

        let scheme = uri
            .scheme_str()
            .ok_or_else(|| Error::config("GOOGLE_ORIGIN must be an absolute URL"))?
            .to_string();
        let authority = uri
            .authority()
            .ok_or_else(|| Error::config("GOOGLE_ORIGIN must contain a host"))?
            .to_string();

        Ok((scheme, authority))
    }

    /// Header-to-parameter mappings from the inject spec.
    ///
    /// Items are comma-separated; `HEADER__PARAM` renames, a bare `HEADER`
    /// keeps its own name. Splitting uses the first `__`. Empty items and
    /// surrounding whitespace are ignored.
    pub fn inject_headers(&self) -> Vec<HeaderMapping> {
        self.inject_params_from_req_headers
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| match item.split_once("__") {
                Some((header, param)) => HeaderMapping {
                    header_name: header.to_ascii_lowercase(),
                    param_name: param.to_string(),
                },
                None => HeaderMapping {
                    header_name: item.to_ascii_lowercase(),
                    param_name: item.to_string(),
                },
            })
            .collect()
    }

    /// Query parameter names to strip before the upstream call.
    pub fn skip_params(&self) -> Vec<String> {
        self.skip_params_from_req_headers
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(String::from)
            .collect()
    }
}

/// Deserialize a humantime duration string such as `10s` or `100ms`.
fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}

#[cfg(test)]
impl Settings {
    /// Baseline settings for tests; individual tests override fields inline.
    pub(crate) fn for_tests() -> Self {
        Self {
            port: 3000,
            shutdown_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            route_prefix: String::new(),
            google_origin: "https://www.google-analytics.com".to_string(),
            upstream_timeout: Duration::from_secs(10),
            upstream_max_idle_conns: 100,
            upstream_max_conns: 100,
            upstream_retry_count: 2,
            upstream_retry_delay: Duration::from_millis(100),
            inject_params_from_req_headers: String::new(),
            skip_params_from_req_headers: String::new(),
            cache_enabled: true,
            cache_ttl: Duration::from_secs(300),
            cache_max_size: 104_857_600,
            cache_key_pattern: "*.js".to_string(),
            rate_limit_enabled: true,
            rate_limit_rps: 100,
            rate_limit_burst: 200,
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            metrics_enabled: true,
            metrics_path: "/metrics".to_string(),
            enable_cors: true,
            cors_allow_origins: "*".to_string(),
            enable_security_headers: true,
        }
    }
}
