//! Hostname -> backend cache backed by DNS SRV lookups.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::persistence::{CacheFile, PersistedBackend, PersistedCache};
use super::resolver::{srv_name, SrvResolver};
use super::DiscoveryError;

/// Default idle time after which an entry is evicted (96 hours).
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(96 * 60 * 60);

/// A resolved backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    /// Target host from the SRV record.
    pub target: String,
    /// Target port from the SRV record.
    pub port: u16,
}

impl Backend {
    pub fn new(target: impl Into<String>, port: u16) -> Self {
        Self {
            target: target.into(),
            port,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target, self.port)
    }
}

/// A cached backend for one hostname.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub backend: Backend,
    /// Last connection or relayed chunk for this hostname.
    pub last_accessed_at: DateTime<Utc>,
    /// Last successful SRV answer stored in this entry.
    pub resolved_at: DateTime<Utc>,
}

impl CacheEntry {
    fn fresh(backend: Backend) -> Self {
        let now = Utc::now();
        Self {
            backend,
            last_accessed_at: now,
            resolved_at: now,
        }
    }
}

/// Outcome of one refresh sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failed: usize,
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub lookup_failures: AtomicU64,
    pub evictions: AtomicU64,
}

/// Discovery cache shared by every connection and the maintenance tasks.
///
/// All map mutations go through one RwLock. Persistence is serialized by a
/// separate lock and always writes a snapshot taken after acquiring it, so
/// the file converges to the in-memory state once the last writer is done.
pub struct DiscoveryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    resolver: Arc<dyn SrvResolver>,
    store: Option<CacheFile>,
    persist_lock: Mutex<()>,
    idle_ttl: chrono::Duration,
    stats: CacheStats,
}

impl DiscoveryCache {
    /// Create an in-memory cache using `resolver` for misses.
    pub fn new(resolver: Arc<dyn SrvResolver>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            resolver,
            store: None,
            persist_lock: Mutex::new(()),
            idle_ttl: to_chrono(DEFAULT_IDLE_TTL),
            stats: CacheStats::default(),
        }
    }

    /// Persist every mutation to `store`.
    pub fn with_store(mut self, store: CacheFile) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the idle eviction threshold.
    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = to_chrono(idle_ttl);
        self
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Resolve the backend for `hostname`.
    ///
    /// A hit refreshes the access time without I/O. A miss queries
    /// `_pdcache._tcp.<hostname>`, stores the first record and persists the
    /// cache. Failures are not cached.
    pub async fn resolve(&self, hostname: &str) -> Result<Backend, DiscoveryError> {
        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(hostname) {
                entry.last_accessed_at = Utc::now();
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(hostname, backend = %entry.backend, "Backend found in cache");
                return Ok(entry.backend.clone());
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let backend = match self.lookup(hostname).await {
            Ok(backend) => backend,
            Err(e) => {
                self.stats.lookup_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        info!(hostname, backend = %backend, "Backend discovered");
        self.entries
            .write()
            .await
            .insert(hostname.to_string(), CacheEntry::fresh(backend.clone()));
        self.persist().await;

        Ok(backend)
    }

    /// Mark `hostname` as accessed now.
    pub async fn touch(&self, hostname: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(hostname) {
            entry.last_accessed_at = Utc::now();
        }
    }

    /// Get a copy of the entry for `hostname`.
    pub async fn get(&self, hostname: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(hostname).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Cached hostnames and backends, as written to the cache file.
    pub async fn snapshot(&self) -> PersistedCache {
        self.entries
            .read()
            .await
            .iter()
            .map(|(hostname, entry)| {
                (
                    hostname.clone(),
                    PersistedBackend {
                        target: entry.backend.target.clone(),
                        port: entry.backend.port,
                    },
                )
            })
            .collect()
    }

    /// Re-resolve every cached hostname and overwrite its entry wholesale,
    /// even when the answer is unchanged.
    ///
    /// An overwritten entry counts as accessed now, so only hostnames whose
    /// lookups keep failing age toward eviction. A failed lookup leaves that
    /// entry as it was.
    pub async fn refresh_all(&self) -> RefreshReport {
        let hostnames: Vec<String> = self.entries.read().await.keys().cloned().collect();
        let mut report = RefreshReport::default();

        for hostname in hostnames {
            match self.lookup(&hostname).await {
                Ok(backend) => {
                    let mut entries = self.entries.write().await;
                    // Evicted while the lookup was in flight.
                    let Some(entry) = entries.get_mut(&hostname) else {
                        continue;
                    };
                    if entry.backend != backend {
                        info!(
                            hostname = %hostname,
                            old_backend = %entry.backend,
                            new_backend = %backend,
                            "Backend changed on refresh"
                        );
                    }
                    *entry = CacheEntry::fresh(backend);
                    report.refreshed += 1;
                }
                Err(e) => {
                    self.stats.lookup_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(hostname = %hostname, error = %e, "Refresh lookup failed, keeping entry");
                    report.failed += 1;
                }
            }
        }

        self.persist().await;
        report
    }

    /// Remove entries idle for longer than the threshold as of `now`.
    ///
    /// Returns the number of entries removed.
    pub async fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let removed = {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|hostname, entry| {
                let idle = now - entry.last_accessed_at;
                if idle > self.idle_ttl {
                    info!(
                        hostname = %hostname,
                        idle_hours = idle.num_hours(),
                        "Removing cached entry due to inactivity"
                    );
                    false
                } else {
                    true
                }
            });
            before - entries.len()
        };

        self.stats
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        self.persist().await;
        removed
    }

    /// Drop every entry and overwrite the cache file with an empty mapping.
    pub async fn reset(&self) {
        self.entries.write().await.clear();
        self.persist().await;
        info!("Discovery cache cleared");
    }

    /// Populate the map from the cache file.
    ///
    /// Loaded entries count as accessed now. An unreadable file is logged and
    /// leaves the cache empty. Returns the number of entries loaded.
    pub async fn load_persisted(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        let persisted = match store.load().await {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(
                    path = %store.path().display(),
                    error = %e,
                    "Failed to load discovery cache, starting empty"
                );
                return 0;
            }
        };

        let mut entries = self.entries.write().await;
        for (hostname, p) in persisted {
            entries.insert(hostname, CacheEntry::fresh(Backend::new(p.target, p.port)));
        }
        entries.len()
    }

    /// SRV lookup for `hostname`, taking the first record as returned.
    async fn lookup(&self, hostname: &str) -> Result<Backend, DiscoveryError> {
        let name = srv_name(hostname);
        let records = self.resolver.lookup_srv(&name).await?;

        // No priority/weight ordering: the first answer wins.
        let record = records
            .into_iter()
            .next()
            .ok_or(DiscoveryError::NoRecords { name })?;

        Ok(Backend::new(record.target, record.port))
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };

        let _guard = self.persist_lock.lock().await;
        let snapshot = self.snapshot().await;
        if let Err(e) = store.save(&snapshot).await {
            warn!(
                path = %store.path().display(),
                error = %e,
                "Failed to persist discovery cache"
            );
        }
    }

    #[cfg(test)]
    pub(crate) async fn set_last_accessed(&self, hostname: &str, at: DateTime<Utc>) {
        if let Some(entry) = self.entries.write().await.get_mut(hostname) {
            entry.last_accessed_at = at;
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{MockSrvResolver, SrvRecord};
    use tempfile::tempdir;

    fn cache_with(resolver: &Arc<MockSrvResolver>) -> DiscoveryCache {
        DiscoveryCache::new(Arc::clone(resolver) as Arc<dyn SrvResolver>)
    }

    #[tokio::test]
    async fn test_resolve_miss_stores_first_record() {
        let resolver = Arc::new(MockSrvResolver::new());
        resolver.set(
            "app.example.com",
            vec![
                SrvRecord::new("node1.example.net", 8443),
                SrvRecord::new("node2.example.net", 9443),
            ],
        );
        let cache = cache_with(&resolver);

        let backend = cache.resolve("app.example.com").await.unwrap();
        assert_eq!(backend, Backend::new("node1.example.net", 8443));
        assert_eq!(resolver.calls_for("app.example.com"), 1);
        assert_eq!(
            resolver.queried_names(),
            vec!["_pdcache._tcp.app.example.com".to_string()]
        );

        let entry = cache.get("app.example.com").await.unwrap();
        assert_eq!(entry.backend, backend);
    }

    #[tokio::test]
    async fn test_resolve_hit_does_not_query() {
        let resolver = Arc::new(MockSrvResolver::new());
        resolver.set("app.example.com", vec![SrvRecord::new("node1", 8443)]);
        let cache = cache_with(&resolver);

        cache.resolve("app.example.com").await.unwrap();
        let old = Utc::now() - chrono::Duration::hours(1);
        cache.set_last_accessed("app.example.com", old).await;

        cache.resolve("app.example.com").await.unwrap();
        assert_eq!(resolver.calls_for("app.example.com"), 1);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);

        let entry = cache.get("app.example.com").await.unwrap();
        assert!(entry.last_accessed_at > old);
    }

    #[tokio::test]
    async fn test_resolve_empty_answer_is_not_cached() {
        let resolver = Arc::new(MockSrvResolver::new());
        resolver.set("app.example.com", vec![]);
        let cache = cache_with(&resolver);

        let err = cache.resolve("app.example.com").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NoRecords { .. }));
        assert!(cache.is_empty().await);

        // Next attempt queries again.
        let _ = cache.resolve("app.example.com").await;
        assert_eq!(resolver.calls_for("app.example.com"), 2);
    }

    #[tokio::test]
    async fn test_resolve_lookup_error_is_not_cached() {
        let resolver = Arc::new(MockSrvResolver::new());
        let cache = cache_with(&resolver);

        let err = cache.resolve("unknown.example.com").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::DnsLookupFailed { .. }));
        assert!(cache.get("unknown.example.com").await.is_none());
        assert_eq!(cache.stats().lookup_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_evict_idle_threshold() {
        let resolver = Arc::new(MockSrvResolver::new());
        resolver.set("old.example.com", vec![SrvRecord::new("node1", 1)]);
        resolver.set("recent.example.com", vec![SrvRecord::new("node2", 2)]);
        let cache = cache_with(&resolver);
        cache.resolve("old.example.com").await.unwrap();
        cache.resolve("recent.example.com").await.unwrap();

        let now = Utc::now();
        cache
            .set_last_accessed("old.example.com", now - chrono::Duration::hours(97))
            .await;
        cache
            .set_last_accessed("recent.example.com", now - chrono::Duration::hours(95))
            .await;

        assert_eq!(cache.evict_idle(now).await, 1);
        assert!(cache.get("old.example.com").await.is_none());
        assert!(cache.get("recent.example.com").await.is_some());
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_evict_idle_custom_ttl() {
        let resolver = Arc::new(MockSrvResolver::new());
        resolver.set("a.example.com", vec![SrvRecord::new("node1", 1)]);
        let cache = cache_with(&resolver).with_idle_ttl(Duration::from_secs(60));
        cache.resolve("a.example.com").await.unwrap();

        assert_eq!(cache.evict_idle(Utc::now()).await, 0);
        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(cache.evict_idle(later).await, 1);
    }

    #[tokio::test]
    async fn test_refresh_overwrites_every_entry() {
        let resolver = Arc::new(MockSrvResolver::new());
        resolver.set("a.example.com", vec![SrvRecord::new("node1", 1)]);
        resolver.set("b.example.com", vec![SrvRecord::new("node2", 2)]);
        let cache = cache_with(&resolver);
        cache.resolve("a.example.com").await.unwrap();
        cache.resolve("b.example.com").await.unwrap();

        let before_a = cache.get("a.example.com").await.unwrap();
        resolver.set("b.example.com", vec![SrvRecord::new("node3", 3)]);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = cache.refresh_all().await;
        assert_eq!(report, RefreshReport { refreshed: 2, failed: 0 });
        assert_eq!(resolver.calls_for("a.example.com"), 2);
        assert_eq!(resolver.calls_for("b.example.com"), 2);

        // Unchanged answer is still written.
        let after_a = cache.get("a.example.com").await.unwrap();
        assert_eq!(after_a.backend, before_a.backend);
        assert!(after_a.resolved_at > before_a.resolved_at);
        assert!(after_a.last_accessed_at > before_a.last_accessed_at);

        assert_eq!(
            cache.get("b.example.com").await.unwrap().backend,
            Backend::new("node3", 3)
        );
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_entry() {
        let resolver = Arc::new(MockSrvResolver::new());
        resolver.set("a.example.com", vec![SrvRecord::new("node1", 1)]);
        resolver.set("b.example.com", vec![SrvRecord::new("node2", 2)]);
        let cache = cache_with(&resolver);
        cache.resolve("a.example.com").await.unwrap();
        cache.resolve("b.example.com").await.unwrap();

        resolver.fail("a.example.com");
        resolver.set("b.example.com", vec![SrvRecord::new("node3", 3)]);

        let report = cache.refresh_all().await;
        assert_eq!(report, RefreshReport { refreshed: 1, failed: 1 });
        assert_eq!(
            cache.get("a.example.com").await.unwrap().backend,
            Backend::new("node1", 1)
        );
        assert_eq!(
            cache.get("b.example.com").await.unwrap().backend,
            Backend::new("node3", 3)
        );
    }

    #[tokio::test]
    async fn test_only_failing_refreshes_age_out() {
        let resolver = Arc::new(MockSrvResolver::new());
        resolver.set("live.example.com", vec![SrvRecord::new("node1", 1)]);
        resolver.set("gone.example.com", vec![SrvRecord::new("node2", 2)]);
        let cache = cache_with(&resolver);
        cache.resolve("live.example.com").await.unwrap();
        cache.resolve("gone.example.com").await.unwrap();

        let old = Utc::now() - chrono::Duration::hours(97);
        cache.set_last_accessed("live.example.com", old).await;
        cache.set_last_accessed("gone.example.com", old).await;

        resolver.fail("gone.example.com");
        cache.refresh_all().await;

        assert_eq!(cache.evict_idle(Utc::now()).await, 1);
        assert!(cache.get("live.example.com").await.is_some());
        assert!(cache.get("gone.example.com").await.is_none());
    }

    #[tokio::test]
    async fn test_mutations_are_persisted() {
        let dir = tempdir().unwrap();
        let file = CacheFile::new(dir.path().join("cache.json"));
        let resolver = Arc::new(MockSrvResolver::new());
        resolver.set("a.example.com", vec![SrvRecord::new("node1", 1)]);
        let cache = cache_with(&resolver).with_store(file.clone());

        cache.resolve("a.example.com").await.unwrap();
        let on_disk = file.load().await.unwrap();
        assert_eq!(on_disk, cache.snapshot().await);
        assert_eq!(on_disk.len(), 1);

        cache
            .set_last_accessed("a.example.com", Utc::now() - chrono::Duration::hours(100))
            .await;
        cache.evict_idle(Utc::now()).await;
        assert!(file.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_then_reset() {
        let dir = tempdir().unwrap();
        let file = CacheFile::new(dir.path().join("cache.json"));
        let mut persisted = PersistedCache::new();
        persisted.insert(
            "a.example.com".to_string(),
            PersistedBackend {
                target: "node1".to_string(),
                port: 1,
            },
        );
        file.save(&persisted).await.unwrap();

        let resolver = Arc::new(MockSrvResolver::new());
        let cache = cache_with(&resolver).with_store(file.clone());

        assert_eq!(cache.load_persisted().await, 1);
        assert_eq!(cache.snapshot().await, persisted);

        cache.reset().await;
        assert!(cache.is_empty().await);
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_load_corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "[[[").unwrap();

        let resolver = Arc::new(MockSrvResolver::new());
        let cache = cache_with(&resolver).with_store(CacheFile::new(path));

        assert_eq!(cache.load_persisted().await, 0);
        assert!(cache.is_empty().await);
    }
}
