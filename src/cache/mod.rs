//! Result cache keyed by normalised link.
//!
//! Entries are immutable: a re-resolution swaps the whole entry, readers get
//! clones. Expiry is lazy on lookup; an optional sweeper task purges expired
//! entries in the background and an optional [`CacheBacking`] keeps resolved
//! links across restarts.

pub mod backing;

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::core::{NormalizedKey, normalize};

pub use backing::{BackingError, CacheBacking, RedbBacking};

/// Seven days, the retention used for resolved links.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub final_url: String,
    pub method: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        final_url: impl Into<String>,
        method: impl Into<String>,
        created_at: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            final_url: final_url.into(),
            method: method.into(),
            created_at,
            expires_at: created_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// An entry is dead from `expires_at` onwards.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

pub struct ResultCache {
    entries: DashMap<NormalizedKey, CacheEntry>,
    ttl: chrono::Duration,
    backing: Option<Arc<dyn CacheBacking>>,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            backing: None,
        }
    }

    pub fn with_backing(mut self, backing: Arc<dyn CacheBacking>) -> Self {
        self.backing = Some(backing);
        self
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    pub fn has_backing(&self) -> bool {
        self.backing.is_some()
    }

    /// Build an entry stamped now with this cache's TTL.
    pub fn entry_for(&self, final_url: &str, method: &str) -> CacheEntry {
        CacheEntry::new(final_url, method, Utc::now(), self.ttl)
    }

    pub fn get(&self, key: &NormalizedKey) -> Option<CacheEntry> {
        self.get_at(key, Utc::now())
    }

    /// Lookup against an explicit clock. Expired entries are dropped.
    pub fn get_at(&self, key: &NormalizedKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        // The shard guard must be released before `remove_if` takes it again.
        let entry = self.entries.get(key).map(|found| found.value().clone())?;
        if entry.is_expired_at(now) {
            self.entries
                .remove_if(key, |_, current| current.is_expired_at(now));
            return None;
        }
        Some(entry)
    }

    /// Memory is updated first and the backing follows, here and in
    /// [`invalidate`](Self::invalidate). Readers never wait on backing I/O.
    pub async fn put(&self, key: NormalizedKey, entry: CacheEntry) {
        self.entries.insert(key.clone(), entry.clone());
        if let Some(backing) = &self.backing
            && let Err(err) = backing.store(key.as_str(), &entry).await
        {
            log::warn!("Cache backing write failed for {key}: {err}");
        }
    }

    pub async fn invalidate(&self, key: &NormalizedKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if let Some(backing) = &self.backing
            && let Err(err) = backing.remove(key.as_str()).await
        {
            log::warn!("Cache backing delete failed for {key}: {err}");
        }
        removed
    }

    pub async fn clear(&self) {
        self.entries.clear();
        if let Some(backing) = &self.backing
            && let Err(err) = backing.clear().await
        {
            log::warn!("Cache backing clear failed: {err}");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        before.saturating_sub(self.entries.len())
    }

    /// Reload unexpired entries from the backing. Entries already in memory
    /// are kept as they are newer than anything on disk.
    pub async fn warm(&self) -> Result<usize, BackingError> {
        let Some(backing) = &self.backing else {
            return Ok(0);
        };

        let now = Utc::now();
        let mut loaded = 0;
        for (raw_key, entry) in backing.load_all().await? {
            if entry.is_expired_at(now) {
                continue;
            }
            let Ok(key) = normalize(&raw_key) else {
                log::warn!("Ignoring cache row with malformed key {raw_key}");
                continue;
            };
            if !self.entries.contains_key(&key) {
                self.entries.insert(key, entry);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Start a background task purging expired entries every `period`.
    ///
    /// The task holds a weak reference and stops on its own once the cache is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> CacheSweeper {
        let cache: Weak<ResultCache> = Arc::downgrade(self);
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            log::debug!("Cache sweeper purged {purged} expired entries");
                        }
                    }
                }
            }
        });

        CacheSweeper {
            stop: Some(stop_tx),
            handle,
        }
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .field("backing", &self.backing.is_some())
            .finish()
    }
}

/// Handle on the background purge task.
#[derive(Debug)]
pub struct CacheSweeper {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl CacheSweeper {
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(err) = (&mut self.handle).await
            && err.is_panic()
        {
            log::error!("Cache sweeper panicked: {err}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        if self.stop.is_some() {
            self.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    fn key(raw: &str) -> NormalizedKey {
        normalize(raw).unwrap()
    }

    #[tokio::test]
    async fn put_then_get_returns_the_entry() {
        let cache = ResultCache::default();
        let entry = cache.entry_for("https://dest.example/page", "static_html");
        cache.put(key("https://short.ly/abc"), entry.clone()).await;

        assert_eq!(cache.get(&key("HTTPS://SHORT.LY/abc/")), Some(entry));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn entries_expire_exactly_at_ttl() {
        let cache = ResultCache::new(Duration::from_secs(60));
        let t0 = Utc::now();
        let entry = CacheEntry::new("https://dest.example", "css_hidden", t0, cache.ttl());
        let k = key("https://short.ly/ttl");
        cache.put(k.clone(), entry).await;

        let just_before = t0 + chrono::Duration::seconds(59);
        assert!(cache.get_at(&k, just_before).is_some());

        let at_expiry = t0 + chrono::Duration::seconds(60);
        assert!(cache.get_at(&k, at_expiry).is_none());
        assert!(cache.is_empty(), "expired entry should be dropped on lookup");
    }

    #[tokio::test]
    async fn invalidate_and_purge() {
        let cache = ResultCache::new(Duration::from_secs(10));
        let now = Utc::now();
        cache
            .put(
                key("https://short.ly/old"),
                CacheEntry::new("https://a.example", "javascript", now, chrono::Duration::seconds(1)),
            )
            .await;
        cache
            .put(
                key("https://short.ly/new"),
                CacheEntry::new("https://b.example", "javascript", now, chrono::Duration::hours(1)),
            )
            .await;

        assert_eq!(cache.purge_expired_at(now + chrono::Duration::seconds(5)), 1);
        assert!(cache.invalidate(&key("https://short.ly/new")).await);
        assert!(!cache.invalidate(&key("https://short.ly/new")).await);
        assert!(cache.is_empty());
    }

    #[derive(Default)]
    struct RecordingBacking {
        rows: Mutex<Vec<(String, CacheEntry)>>,
    }

    #[async_trait]
    impl CacheBacking for RecordingBacking {
        async fn store(&self, key: &str, entry: &CacheEntry) -> Result<(), BackingError> {
            self.rows
                .lock()
                .unwrap()
                .push((key.to_string(), entry.clone()));
            Ok(())
        }

        async fn remove(&self, key: &str) -> Result<(), BackingError> {
            self.rows.lock().unwrap().retain(|(k, _)| k != key);
            Ok(())
        }

        async fn clear(&self) -> Result<(), BackingError> {
            self.rows.lock().unwrap().clear();
            Ok(())
        }

        async fn load_all(&self) -> Result<Vec<(String, CacheEntry)>, BackingError> {
            Ok(self.rows.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn warm_skips_expired_rows() {
        let backing = Arc::new(RecordingBacking::default());
        let now = Utc::now();
        backing
            .store(
                "https://short.ly/live",
                &CacheEntry::new("https://live.example", "anti_bot", now, chrono::Duration::hours(1)),
            )
            .await
            .unwrap();
        backing
            .store(
                "https://short.ly/dead",
                &CacheEntry::new(
                    "https://dead.example",
                    "anti_bot",
                    now - chrono::Duration::hours(2),
                    chrono::Duration::hours(1),
                ),
            )
            .await
            .unwrap();

        let cache = ResultCache::default().with_backing(backing.clone());
        assert_eq!(cache.warm().await.unwrap(), 1);
        assert!(cache.get(&key("https://short.ly/live")).is_some());
        assert!(cache.get(&key("https://short.ly/dead")).is_none());

        cache.invalidate(&key("https://short.ly/live")).await;
        assert_eq!(backing.rows.lock().unwrap().len(), 1);
    }

    /// Holds every write until the test hands out a permit.
    struct GatedBacking {
        gate: Arc<Semaphore>,
    }

    impl GatedBacking {
        async fn pass(&self) {
            self.gate.acquire().await.unwrap().forget();
        }
    }

    #[async_trait]
    impl CacheBacking for GatedBacking {
        async fn store(&self, _key: &str, _entry: &CacheEntry) -> Result<(), BackingError> {
            self.pass().await;
            Ok(())
        }

        async fn remove(&self, _key: &str) -> Result<(), BackingError> {
            self.pass().await;
            Ok(())
        }

        async fn clear(&self) -> Result<(), BackingError> {
            Ok(())
        }

        async fn load_all(&self) -> Result<Vec<(String, CacheEntry)>, BackingError> {
            Ok(Vec::new())
        }
    }

    async fn settle_until(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..50 {
            if done() {
                return true;
            }
            tokio::task::yield_now().await;
        }
        done()
    }

    #[tokio::test]
    async fn memory_is_updated_before_the_backing() {
        let gate = Arc::new(Semaphore::new(0));
        let cache = Arc::new(ResultCache::default().with_backing(Arc::new(GatedBacking {
            gate: Arc::clone(&gate),
        })));
        let k = key("https://short.ly/slow-disk");

        let put = tokio::spawn({
            let cache = Arc::clone(&cache);
            let entry = cache.entry_for("https://dest.example/", "css_hidden");
            let k = k.clone();
            async move { cache.put(k, entry).await }
        });
        assert!(settle_until(|| cache.get(&k).is_some()).await);
        assert!(!put.is_finished());
        gate.add_permits(1);
        put.await.unwrap();

        let invalidate = tokio::spawn({
            let cache = Arc::clone(&cache);
            let k = k.clone();
            async move { cache.invalidate(&k).await }
        });
        assert!(settle_until(|| cache.get(&k).is_none()).await);
        assert!(!invalidate.is_finished());
        gate.add_permits(1);
        assert!(invalidate.await.unwrap());
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let cache = Arc::new(ResultCache::default());
        let sweeper = cache.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!sweeper.is_finished());
        sweeper.shutdown().await;
    }
}
