//! Request, cache, upstream, and rate-limit telemetry with Prometheus text
//! exposition.
//!
//! Counters and the rolling duration windows live behind one mutex; the
//! windows keep the last 1000 samples and quantiles are computed from a
//! sorted copy at export time.

use crate::cache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

const DURATION_WINDOW: usize = 1000;

#[derive(Default)]
struct CacheGauges {
    hits: u64,
    misses: u64,
    evictions: u64,
    size_bytes: u64,
    entries: usize,
}

#[derive(Default)]
struct Inner {
    requests_total: HashMap<u16, u64>,
    request_durations: Vec<f64>,
    requests_in_flight: i64,

    upstream_requests_total: HashMap<u16, u64>,
    upstream_errors: u64,
    upstream_durations: Vec<f64>,

    cache: CacheGauges,
    rate_limit_dropped: u64,
}

pub struct Metrics {
    inner: Mutex<Inner>,
    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            start_time: Instant::now(),
        }
    }

    pub fn record_request(&self, status: u16, duration: Duration) {
        let mut inner = self.inner.lock();
        *inner.requests_total.entry(status).or_insert(0) += 1;
        push_sample(&mut inner.request_durations, duration.as_secs_f64());
    }

    pub fn inc_requests_in_flight(&self) {
        self.inner.lock().requests_in_flight += 1;
    }

    pub fn dec_requests_in_flight(&self) {
        self.inner.lock().requests_in_flight -= 1;
    }

    /// Record an upstream attempt outcome. Transport failures carry status 0.
    pub fn record_upstream(&self, status: u16, duration: Duration, is_error: bool) {
        let mut inner = self.inner.lock();
        *inner.upstream_requests_total.entry(status).or_insert(0) += 1;
        push_sample(&mut inner.upstream_durations, duration.as_secs_f64());
        if is_error {
            inner.upstream_errors += 1;
        }
    }

    /// Refresh cache gauges from a cache stats snapshot.
    pub fn update_cache_stats(&self, stats: &cache::Stats) {
        let mut inner = self.inner.lock();
        inner.cache = CacheGauges {
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            size_bytes: stats.size_bytes,
            entries: stats.entry_count,
        };
    }

    pub fn record_rate_limit_drop(&self) {
        self.inner.lock().rate_limit_dropped += 1;
    }

    /// Render the Prometheus text exposition format.
    pub fn export(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::with_capacity(4096);

        let _ = writeln!(out, "# HELP gaxy_info Process information");
        let _ = writeln!(out, "# TYPE gaxy_info gauge");
        let _ = writeln!(out, "gaxy_info{{version=\"{}\"}} 1\n", env!("CARGO_PKG_VERSION"));

        let uptime = self.start_time.elapsed().as_secs_f64();
        let _ = writeln!(out, "# HELP gaxy_uptime_seconds Process uptime in seconds");
        let _ = writeln!(out, "# TYPE gaxy_uptime_seconds counter");
        let _ = writeln!(out, "gaxy_uptime_seconds {uptime:.6}\n");

        let _ = writeln!(out, "# HELP gaxy_requests_total Total number of HTTP requests");
        let _ = writeln!(out, "# TYPE gaxy_requests_total counter");
        let mut statuses: Vec<_> = inner.requests_total.iter().collect();
        statuses.sort_by_key(|(status, _)| **status);
        for (status, count) in statuses {
            let _ = writeln!(out, "gaxy_requests_total{{status=\"{status}\"}} {count}");
        }
        out.push('\n');

        let _ = writeln!(
            out,
            "# HELP gaxy_requests_in_flight Number of requests currently being processed"
        );
        let _ = writeln!(out, "# TYPE gaxy_requests_in_flight gauge");
        let _ = writeln!(out, "gaxy_requests_in_flight {}\n", inner.requests_in_flight);

        write_duration_summary(
            &mut out,
            "gaxy_request_duration_seconds",
            "HTTP request duration",
            &inner.request_durations,
        );

        let _ = writeln!(out, "# HELP gaxy_cache_hits_total Total number of cache hits");
        let _ = writeln!(out, "# TYPE gaxy_cache_hits_total counter");
        let _ = writeln!(out, "gaxy_cache_hits_total {}\n", inner.cache.hits);

        let _ = writeln!(out, "# HELP gaxy_cache_misses_total Total number of cache misses");
        let _ = writeln!(out, "# TYPE gaxy_cache_misses_total counter");
        let _ = writeln!(out, "gaxy_cache_misses_total {}\n", inner.cache.misses);

        let _ = writeln!(out, "# HELP gaxy_cache_evictions_total Total number of cache evictions");
        let _ = writeln!(out, "# TYPE gaxy_cache_evictions_total counter");
        let _ = writeln!(out, "gaxy_cache_evictions_total {}\n", inner.cache.evictions);

        let _ = writeln!(out, "# HELP gaxy_cache_size_bytes Current cache size in bytes");
        let _ = writeln!(out, "# TYPE gaxy_cache_size_bytes gauge");
        let _ = writeln!(out, "gaxy_cache_size_bytes {}\n", inner.cache.size_bytes);

        let _ = writeln!(out, "# HELP gaxy_cache_entries Current number of cache entries");
        let _ = writeln!(out, "# TYPE gaxy_cache_entries gauge");
        let _ = writeln!(out, "gaxy_cache_entries {}\n", inner.cache.entries);

        let _ = writeln!(
            out,
            "# HELP gaxy_upstream_requests_total Total number of upstream requests"
        );
        let _ = writeln!(out, "# TYPE gaxy_upstream_requests_total counter");
        let mut statuses: Vec<_> = inner.upstream_requests_total.iter().collect();
        statuses.sort_by_key(|(status, _)| **status);
        for (status, count) in statuses {
            let _ = writeln!(out, "gaxy_upstream_requests_total{{status=\"{status}\"}} {count}");
        }
        out.push('\n');

        let _ = writeln!(out, "# HELP gaxy_upstream_errors_total Total number of upstream errors");
        let _ = writeln!(out, "# TYPE gaxy_upstream_errors_total counter");
        let _ = writeln!(out, "gaxy_upstream_errors_total {}\n", inner.upstream_errors);

        write_duration_summary(
            &mut out,
            "gaxy_upstream_duration_seconds",
            "Upstream request duration",
            &inner.upstream_durations,
        );

        let _ = writeln!(
            out,
            "# HELP gaxy_rate_limit_dropped_total Total number of rate-limited requests"
        );
        let _ = writeln!(out, "# TYPE gaxy_rate_limit_dropped_total counter");
        let _ = writeln!(out, "gaxy_rate_limit_dropped_total {}", inner.rate_limit_dropped);

        out
    }
}

/// Append a sample, trimming the window to the last `DURATION_WINDOW` values.
fn push_sample(window: &mut Vec<f64>, value: f64) {
    window.push(value);
    if window.len() > DURATION_WINDOW {
        let excess = window.len() - DURATION_WINDOW;
        window.drain(..excess);
    }
}

fn write_duration_summary(out: &mut String, name: &str, help: &str, samples: &[f64]) {
    if samples.is_empty() {
        return;
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let sum: f64 = sorted.iter().sum();
    let p50 = percentile(&sorted, 0.50);
    let p95 = percentile(&sorted, 0.95);
    let p99 = percentile(&sorted, 0.99);

    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} summary");
    let _ = writeln!(out, "{name}{{quantile=\"0.5\"}} {p50:.6}");
    let _ = writeln!(out, "{name}{{quantile=\"0.95\"}} {p95:.6}");
    let _ = writeln!(out, "{name}{{quantile=\"0.99\"}} {p99:.6}");
    let _ = writeln!(out, "{name}_sum {sum:.6}");
    let _ = writeln!(out, "{name}_count {}\n", sorted.len());
}

/// Approximate quantile over a sorted window.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64) * p) as usize;
    sorted[index.min(sorted.len() - 1)]
}
