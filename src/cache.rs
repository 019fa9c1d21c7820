//! Bounded in-memory TTL cache for upstream response bodies.
//!
//! Entries are keyed by sanitized request URI and expire a fixed TTL after
//! insertion. The cache is size-bounded: inserts evict earliest-expiring
//! entries until the new body fits. Expired entries count as misses on read
//! and are reclaimed by a periodic janitor; reads never block on cleanup.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// A cached upstream response.
#[derive(Debug, Clone)]
pub struct Entry {
    pub body: Bytes,
    pub content_type: String,
    pub status: u16,
    expires_at: Instant,
}

/// Counter snapshot plus current occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub sets: u64,
    pub size_bytes: u64,
    pub entry_count: usize,
}

struct Inner {
    entries: HashMap<String, Entry>,
    current_size: u64,
}

/// Bounded TTL cache. Mutation is serialized under one writer-exclusive lock;
/// reads and stats snapshots take the shared side.
pub struct Cache {
    inner: RwLock<Inner>,
    ttl: Duration,
    max_size: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    sets: AtomicU64,
}

impl Cache {
    pub fn new(ttl: Duration, max_size: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                current_size: 0,
            }),
            ttl,
            max_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    /// Look up a live entry. An entry past its expiration is a miss; it is
    /// left in place for the janitor.
    pub fn get(&self, key: &str) -> Option<Entry> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn get_at(&self, key: &str, now: Instant) -> Option<Entry> {
        let inner = self.inner.read();
        match inner.entries.get(key) {
            Some(entry) if now < entry.expires_at => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert an entry expiring `TTL` from now.
    ///
    /// A body that cannot fit even in an empty cache is not inserted, keeping
    /// `current_size <= max_size` after every call.
    pub fn set(&self, key: &str, body: Bytes, content_type: &str, status: u16) {
        self.set_at(key, body, content_type, status, Instant::now());
    }

    pub(crate) fn set_at(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        status: u16,
        now: Instant,
    ) {
        let body_len = body.len() as u64;
        if body_len > self.max_size {
            debug!(key, body_len, max_size = self.max_size, "entry exceeds cache capacity");
            return;
        }

        let mut inner = self.inner.write();

        if let Some(old) = inner.entries.remove(key) {
            inner.current_size -= old.body.len() as u64;
        }

        while inner.current_size + body_len > self.max_size && !inner.entries.is_empty() {
            self.evict_earliest(&mut inner);
        }

        inner.entries.insert(
            key.to_string(),
            Entry {
                body,
                content_type: content_type.to_string(),
                status,
                expires_at: now + self.ttl,
            },
        );
        inner.current_size += body_len;
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.remove(key) {
            inner.current_size -= entry.body.len() as u64;
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.current_size = 0;
    }

    pub fn stats(&self) -> Stats {
        let inner = self.inner.read();
        Stats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            size_bytes: inner.current_size,
            entry_count: inner.entries.len(),
        }
    }

    /// Remove every entry whose expiration has elapsed. Returns the number of
    /// entries removed.
    pub fn remove_expired(&self, now: Instant) -> usize {
        let mut inner = self.inner.write();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = inner.entries.remove(key) {
                inner.current_size -= entry.body.len() as u64;
            }
        }
        expired.len()
    }

    /// Periodic sweep of expired entries. The lock is only held for the
    /// in-memory removal, never across an await point.
    pub fn spawn_janitor(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = self.remove_expired(Instant::now());
                if removed > 0 {
                    debug!(removed, "cache janitor removed expired entries");
                }
            }
        })
    }

    /// Evict the entry with the earliest expiration; ties break on key order
    /// so repeated calls within one `set` are deterministic.
    fn evict_earliest(&self, inner: &mut Inner) {
        let victim = inner
            .entries
            .iter()
            .min_by(|(ka, a), (kb, b)| a.expires_at.cmp(&b.expires_at).then_with(|| ka.cmp(kb)))
            .map(|(key, _)| key.clone());

        if let Some(key) = victim {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.current_size -= entry.body.len() as u64;
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    fn body(len: usize) -> Bytes {
        Bytes::from(vec![b'x'; len])
    }

    #[test]
    fn set_then_get_returns_equal_fields() {
        let cache = Cache::new(TTL, 1024);
        cache.set("/analytics.js", Bytes::from_static(b"var ga;"), "text/javascript", 200);

        let entry = cache.get("/analytics.js").expect("entry should be live");
        assert_eq!(entry.body, Bytes::from_static(b"var ga;"));
        assert_eq!(entry.content_type, "text/javascript");
        assert_eq!(entry.status, 200);
    }

    #[test]
    fn get_counts_hits_and_misses() {
        let cache = Cache::new(TTL, 1024);
        assert!(cache.get("/missing").is_none());
        cache.set("/a.js", body(4), "text/javascript", 200);
        assert!(cache.get("/a.js").is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
    }

    #[test]
    fn expired_entry_is_a_miss_but_not_removed() {
        let cache = Cache::new(TTL, 1024);
        let now = Instant::now();
        cache.set_at("/a.js", body(4), "text/javascript", 200, now);

        assert!(cache.get_at("/a.js", now + TTL).is_none());
        assert_eq!(cache.stats().entry_count, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn size_tracks_sum_of_body_lengths() {
        let cache = Cache::new(TTL, 1024);
        cache.set("/a.js", body(100), "text/javascript", 200);
        cache.set("/b.js", body(200), "text/javascript", 200);
        assert_eq!(cache.stats().size_bytes, 300);

        cache.delete("/a.js");
        assert_eq!(cache.stats().size_bytes, 200);

        cache.clear();
        assert_eq!(cache.stats().size_bytes, 0);
        assert_eq!(cache.stats().entry_count, 0);
    }

    #[test]
    fn replacing_a_key_subtracts_the_old_body() {
        let cache = Cache::new(TTL, 1024);
        cache.set("/a.js", body(400), "text/javascript", 200);
        cache.set("/a.js", body(100), "text/javascript", 200);

        let stats = cache.stats();
        assert_eq!(stats.size_bytes, 100);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.sets, 2);
    }

    #[test]
    fn evicts_earliest_expiration_first() {
        let cache = Cache::new(TTL, 300);
        let now = Instant::now();
        cache.set_at("/old.js", body(100), "text/javascript", 200, now);
        cache.set_at("/new.js", body(100), "text/javascript", 200, now + Duration::from_secs(1));

        // Needs 200 bytes free: only /old.js has to go.
        cache.set_at("/big.js", body(200), "text/javascript", 200, now + Duration::from_secs(2));

        assert!(cache.get_at("/old.js", now + Duration::from_secs(2)).is_none());
        assert!(cache.get_at("/new.js", now + Duration::from_secs(2)).is_some());
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size_bytes, 300);
    }

    #[test]
    fn size_stays_bounded_after_any_set_sequence() {
        let cache = Cache::new(TTL, 250);
        for i in 0..20 {
            cache.set(&format!("/{i}.js"), body(100), "text/javascript", 200);
            let stats = cache.stats();
            assert!(stats.size_bytes <= 250);
            assert_eq!(
                stats.size_bytes,
                stats.entry_count as u64 * 100,
                "size must equal the sum of entry body lengths"
            );
        }
    }

    #[test]
    fn oversized_body_is_not_inserted() {
        let cache = Cache::new(TTL, 100);
        cache.set("/huge.js", body(101), "text/javascript", 200);

        let stats = cache.stats();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.size_bytes, 0);
        assert_eq!(stats.sets, 0);
    }

    #[test]
    fn empty_body_is_cacheable() {
        let cache = Cache::new(TTL, 100);
        cache.set("/empty.js", Bytes::new(), "text/javascript", 200);
        let entry = cache.get("/empty.js").expect("empty body should be cached");
        assert!(entry.body.is_empty());
    }

    #[test]
    fn remove_expired_reclaims_only_elapsed_entries() {
        let cache = Cache::new(Duration::from_secs(60), 1024);
        let now = Instant::now();
        cache.set_at("/old.js", body(10), "text/javascript", 200, now);
        cache.set_at("/new.js", body(10), "text/javascript", 200, now + Duration::from_secs(30));

        let removed = cache.remove_expired(now + Duration::from_secs(61));
        assert_eq!(removed, 1);

        let stats = cache.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.size_bytes, 10);
        assert!(cache.get_at("/new.js", now + Duration::from_secs(61)).is_some());
    }
}
