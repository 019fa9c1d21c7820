//! The proxy engine: sanitize, consult the cache, call upstream, rewrite the
//! body, and store the result.

use crate::cache::Cache;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::proxy::client::{UpstreamClient, UpstreamResponse};
use crate::proxy::types::ProxyResponse;
use crate::proxy::validation::{is_allowed_path, sanitize_request_uri};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use http::HeaderMap;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Google Analytics and Tag Manager domains rewritten in script bodies.
///
/// Order is load-bearing: replacement is left-to-right and non-overlapping,
/// so the specific hosts must be consumed before the bare suffixes.
const GOOGLE_DOMAINS: [&str; 5] = [
    "ssl.google-analytics.com",
    "www.google-analytics.com",
    "google-analytics.com",
    "www.googletagmanager.com",
    "googletagmanager.com",
];

/// Headers never forwarded upstream: hop-by-hop headers plus the ones the
/// composed request owns (`Host` routes to the configured origin and the
/// client recomputes framing).
const SKIPPED_REQUEST_HEADERS: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub struct ProxyService {
    settings: Arc<Settings>,
    client: UpstreamClient,
    cache: Option<Arc<Cache>>,
    metrics: Arc<Metrics>,
    origin_scheme: String,
    origin_authority: String,
}

impl ProxyService {
    pub fn new(settings: Arc<Settings>, metrics: Arc<Metrics>) -> Result<Self> {
        let (origin_scheme, origin_authority) = settings.parsed_origin()?;

        let cache = settings
            .cache_enabled
            .then(|| Arc::new(Cache::new(settings.cache_ttl, settings.cache_max_size)));

        let client = UpstreamClient::from_settings(&settings)?;

        Ok(Self {
            settings,
            client,
            cache,
            metrics,
            origin_scheme,
            origin_authority,
        })
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.cache.as_ref()
    }

    /// Proxy one request to the configured origin.
    ///
    /// `headers` carries every inbound header (lowercased names) plus the
    /// synthetic `uip`/`ua` entries supplied by the edge. `public_host` is
    /// substituted into rewritten script bodies.
    pub async fn proxy_request(
        &self,
        req_uri: &str,
        headers: &HashMap<String, String>,
        public_host: &str,
    ) -> Result<ProxyResponse> {
        let start = Instant::now();

        let safe = sanitize_request_uri(req_uri)?;
        let (path, query) = safe.split();

        if !is_allowed_path(path) {
            return Err(Error::validation("path is not allowed for proxying"));
        }

        let cacheable = self.is_cacheable(path);
        if cacheable {
            if let Some(cache) = &self.cache {
                if let Some(entry) = cache.get(safe.as_ref()) {
                    debug!(uri = %safe, "cache hit");
                    self.metrics.update_cache_stats(&cache.stats());
                    return Ok(ProxyResponse {
                        status: http::StatusCode::from_u16(entry.status)
                            .map_err(|e| Error::proxy("cached status code invalid", e))?,
                        body: entry.body,
                        content_type: entry.content_type,
                    });
                }
                debug!(uri = %safe, "cache miss");
            }
        }

        let url = self.compose_upstream_url(path, query, headers);
        let upstream_headers = build_upstream_headers(headers);
        debug!(upstream_url = %url, "proxying request");

        let result = self.client.dispatch(&url, upstream_headers).await;
        let duration = start.elapsed();

        let response = match result {
            Ok(response) => {
                self.metrics
                    .record_upstream(response.status.as_u16(), duration, false);
                response
            }
            Err(err) => {
                self.metrics.record_upstream(0, duration, true);
                return Err(err);
            }
        };

        let status = response.status;
        let (body, content_type) = self.postprocess(response, public_host)?;

        if status.as_u16() == 200 && cacheable {
            if let Some(cache) = &self.cache {
                cache.set(safe.as_ref(), body.clone(), &content_type, status.as_u16());
                debug!(cache_key = %safe, "cached response");
                self.metrics.update_cache_stats(&cache.stats());
            }
        }

        Ok(ProxyResponse {
            status,
            body,
            content_type,
        })
    }

    /// Inflate the body if needed and rewrite Google domains in JavaScript.
    fn postprocess(
        &self,
        response: UpstreamResponse,
        public_host: &str,
    ) -> Result<(Bytes, String)> {
        let content_encoding = header_str(&response.headers, &CONTENT_ENCODING);
        let content_type = header_str(&response.headers, &CONTENT_TYPE).to_string();

        let mut body = decode_body(response.body, content_encoding)?;

        if is_javascript(&content_type) {
            let replacement = format!("{public_host}{}", self.settings.route_prefix);
            for domain in GOOGLE_DOMAINS {
                body = replace_all(&body, domain.as_bytes(), replacement.as_bytes());
            }
        }

        Ok((Bytes::from(body), content_type))
    }

    fn compose_upstream_url(
        &self,
        path: &str,
        query: &str,
        headers: &HashMap<String, String>,
    ) -> String {
        // Raw pairs survive byte-for-byte; only injected values are encoded.
        let mut pairs: Vec<String> = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(String::from)
            .collect();

        for mapping in self.settings.inject_headers() {
            if let Some(value) = headers.get(&mapping.header_name) {
                if !value.is_empty() {
                    debug!(
                        header = %mapping.header_name,
                        param = %mapping.param_name,
                        "injected header as query param"
                    );
                    pairs.push(format!(
                        "{}={}",
                        mapping.param_name,
                        urlencoding::encode(value)
                    ));
                }
            }
        }

        for param in self.settings.skip_params() {
            pairs.retain(|pair| raw_param_name(pair) != param);
        }

        let mut url = format!(
            "{}://{}{}",
            self.origin_scheme, self.origin_authority, path
        );
        if !pairs.is_empty() {
            url.push('?');
            url.push_str(&pairs.join("&"));
        }
        url
    }

    fn is_cacheable(&self, path: &str) -> bool {
        self.cache.is_some() && glob_match(&self.settings.cache_key_pattern, basename(path))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

/// Copy the edge's header map into upstream request headers, dropping
/// hop-by-hop and composed-request headers and anything that is not a valid
/// header name/value.
fn build_upstream_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lowered = name.to_ascii_lowercase();
        if SKIPPED_REQUEST_HEADERS.contains(&lowered.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(lowered.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out.insert(name, value);
        }
    }
    out
}

fn raw_param_name(pair: &str) -> &str {
    match pair.split_once('=') {
        Some((name, _)) => name,
        None => pair,
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Simple `*` wildcard match, anchored at both ends.
fn glob_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if name.len() < first.len() + last.len() {
        return false;
    }
    if !name.starts_with(first) || !name.ends_with(last) {
        return false;
    }

    let mut pos = first.len();
    let end = name.len() - last.len();
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match name[pos..end].find(part) {
            Some(found) => pos += found + part.len(),
            None => return false,
        }
    }
    true
}

fn is_javascript(content_type: &str) -> bool {
    content_type.starts_with("text/javascript")
        || content_type.starts_with("application/javascript")
        || content_type.starts_with("application/x-javascript")
}

/// Inflate the body according to `Content-Encoding`; unknown encodings pass
/// through untouched.
fn decode_body(body: Bytes, content_encoding: &str) -> Result<Vec<u8>> {
    match content_encoding {
        "gzip" => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(body.as_ref())
                .read_to_end(&mut out)
                .map_err(|e| Error::proxy("failed to decode gzip response body", e))?;
            Ok(out)
        }
        "deflate" => {
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(body.as_ref())
                .read_to_end(&mut out)
                .map_err(|e| Error::proxy("failed to decode deflate response body", e))?;
            Ok(out)
        }
        "br" => {
            let mut out = Vec::new();
            brotli::Decompressor::new(body.as_ref(), 4096)
                .read_to_end(&mut out)
                .map_err(|e| Error::proxy("failed to decode brotli response body", e))?;
            Ok(out)
        }
        _ => Ok(body.to_vec()),
    }
}

/// Literal byte-level replacement, left-to-right and non-overlapping.
fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }

    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}
