//! Persistent storage behind the in-memory result cache.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use thiserror::Error;

use super::CacheEntry;

#[derive(Debug, Error)]
pub enum BackingError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("entry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("blocking task failed: {0}")]
    Join(String),
}

fn storage<E: Into<redb::Error>>(err: E) -> BackingError {
    BackingError::Storage(err.into().to_string())
}

/// Write-through store for resolved links. The memory layer stays
/// authoritative; implementations only have to survive restarts.
#[async_trait]
pub trait CacheBacking: Send + Sync {
    async fn store(&self, key: &str, entry: &CacheEntry) -> Result<(), BackingError>;
    async fn remove(&self, key: &str) -> Result<(), BackingError>;
    async fn clear(&self) -> Result<(), BackingError>;
    /// Every stored entry, expired ones included.
    async fn load_all(&self) -> Result<Vec<(String, CacheEntry)>, BackingError>;
}

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("resolved_links");

/// [`CacheBacking`] on a single redb file. All I/O runs on the blocking pool.
#[derive(Clone)]
pub struct RedbBacking {
    db: Arc<Database>,
}

impl RedbBacking {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackingError> {
        let db = Database::create(path.as_ref()).map_err(storage)?;

        let txn = db.begin_write().map_err(storage)?;
        {
            txn.open_table(ENTRIES).map_err(storage)?;
        }
        txn.commit().map_err(storage)?;

        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, job: F) -> Result<T, BackingError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, BackingError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || job(&db))
            .await
            .map_err(|err| BackingError::Join(err.to_string()))?
    }
}

impl std::fmt::Debug for RedbBacking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBacking").finish_non_exhaustive()
    }
}

#[async_trait]
impl CacheBacking for RedbBacking {
    async fn store(&self, key: &str, entry: &CacheEntry) -> Result<(), BackingError> {
        let key = key.to_string();
        let bytes = serde_json::to_vec(entry)?;
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(storage)?;
            {
                let mut table = txn.open_table(ENTRIES).map_err(storage)?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(storage)?;
            }
            txn.commit().map_err(storage)
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), BackingError> {
        let key = key.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(storage)?;
            {
                let mut table = txn.open_table(ENTRIES).map_err(storage)?;
                table.remove(key.as_str()).map_err(storage)?;
            }
            txn.commit().map_err(storage)
        })
        .await
    }

    async fn clear(&self) -> Result<(), BackingError> {
        self.blocking(|db| {
            let txn = db.begin_write().map_err(storage)?;
            txn.delete_table(ENTRIES).map_err(storage)?;
            {
                txn.open_table(ENTRIES).map_err(storage)?;
            }
            txn.commit().map_err(storage)
        })
        .await
    }

    async fn load_all(&self) -> Result<Vec<(String, CacheEntry)>, BackingError> {
        self.blocking(|db| {
            let txn = db.begin_read().map_err(storage)?;
            let table = txn.open_table(ENTRIES).map_err(storage)?;
            let mut entries = Vec::new();
            for row in table.iter().map_err(storage)? {
                let (key, value) = row.map_err(storage)?;
                match serde_json::from_slice::<CacheEntry>(value.value()) {
                    Ok(entry) => entries.push((key.value().to_string(), entry)),
                    Err(err) => {
                        log::warn!("Skipping unreadable cache row {}: {err}", key.value())
                    }
                }
            }
            Ok(entries)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn entry(url: &str) -> CacheEntry {
        CacheEntry::new(url, "static_html", Utc::now(), Duration::days(7))
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links.redb");

        {
            let backing = RedbBacking::open(&path).unwrap();
            backing
                .store("https://short.ly/abc", &entry("https://dest.example/abc"))
                .await
                .unwrap();
            backing
                .store("https://short.ly/gone", &entry("https://dest.example/gone"))
                .await
                .unwrap();
            backing.remove("https://short.ly/gone").await.unwrap();
        }

        let reopened = RedbBacking::open(&path).unwrap();
        let rows = reopened.load_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "https://short.ly/abc");
        assert_eq!(rows[0].1.final_url, "https://dest.example/abc");
    }

    #[tokio::test]
    async fn clear_empties_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let backing = RedbBacking::open(dir.path().join("links.redb")).unwrap();
        backing
            .store("https://short.ly/abc", &entry("https://dest.example/abc"))
            .await
            .unwrap();
        backing.clear().await.unwrap();
        assert!(backing.load_all().await.unwrap().is_empty());
    }
}
