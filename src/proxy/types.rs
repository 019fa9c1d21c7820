//! Type definitions for the proxy engine.

use bytes::Bytes;
use http::StatusCode;
use nutype::nutype;

/// A request URI that passed SSRF sanitization: path plus optional query,
/// with no scheme, host, traversal sequence, or fragment.
///
/// Constructed by `validation::sanitize_request_uri`; the predicate re-states
/// the invariant so a `SanitizedUri` cannot be built around the sanitizer.
#[nutype(
    derive(Clone, Debug, Display, PartialEq, Eq, Hash, AsRef),
    validate(predicate = is_sanitized),
)]
pub struct SanitizedUri(String);

fn is_sanitized(uri: &str) -> bool {
    uri.starts_with('/') && !uri.starts_with("//") && !uri.contains("://") && !uri.contains("..")
}

impl SanitizedUri {
    /// Split into path and query components.
    pub fn split(&self) -> (&str, &str) {
        match self.as_ref().split_once('?') {
            Some((path, query)) => (path, query),
            None => (self.as_ref(), ""),
        }
    }
}

/// The engine's answer for one proxied request.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: String,
}
