use thiserror::Error;

/// Boxed error cause attached to taxonomy variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Gaxy error taxonomy.
///
/// Each variant is terminal at a known layer: `Config` aborts startup,
/// `Validation` and `RateLimit` map to 4xx responses at the edge,
/// `Upstream` and `Proxy` map to 502, everything else to 500.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{0}")]
    Validation(String),

    #[error("upstream error: {message}")]
    Upstream {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("proxy error: {message}")]
    Proxy {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("rate limit exceeded")]
    RateLimit,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn upstream(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Upstream {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn proxy(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Proxy {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
