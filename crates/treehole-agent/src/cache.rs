//! Disk cache for forum search results.
//!
//! Results are stored as one JSON file per `(keyword, page, limit)` key
//! under the configured cache directory, so repeated CLI invocations
//! reuse them. Freshness comes from the file's mtime. Within one
//! process, concurrent lookups of the same key are single-flighted: the
//! second caller waits for the first fetch instead of hitting the forum
//! again.
//!
//! Cache failures are never fatal. A broken or unwritable cache degrades
//! to plain network fetches with a warning.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use treehole_core::{AgentError, Comment, ForumSearcher, Post};

use crate::config::CacheConfig;

pub struct SearchCache {
    dir: PathBuf,
    expiration: Duration,
    enabled: bool,
    /// Per-key locks for in-process single-flight.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SearchCache {
    pub fn from_config(config: &CacheConfig) -> Self {
        SearchCache {
            dir: config.dir.clone(),
            expiration: Duration::from_secs(config.expiration_secs),
            enabled: config.enabled,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Stable file key for one search request.
    pub fn key(keyword: &str, page: u32, limit: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{keyword}|{page}|{limit}").as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.entry(key.to_string()).or_default().clone()
    }

    /// Drop the key's lock once no other caller holds it, so the map
    /// stays bounded by the searches actually in flight.
    fn release(&self, key: &str, slot: &Arc<tokio::sync::Mutex<()>>) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = inflight.get(key) {
            // One reference in the map, one held by this caller.
            if Arc::ptr_eq(existing, slot) && Arc::strong_count(slot) <= 2 {
                inflight.remove(key);
            }
        }
    }

    /// Load a fresh entry, or `None` on miss, expiry, or any IO problem.
    pub fn load(&self, key: &str) -> Option<Vec<Post>> {
        if !self.enabled {
            return None;
        }
        let path = self.path_for(key);
        let metadata = std::fs::metadata(&path).ok()?;
        let modified = metadata.modified().ok()?;
        let age = SystemTime::now().duration_since(modified).ok()?;
        if age >= self.expiration {
            return None;
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(posts) => Some(posts),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "discarding corrupt cache entry");
                    None
                }
            },
            Err(_) => None,
        }
    }

    pub fn store(&self, key: &str, posts: &[Post]) {
        if !self.enabled {
            return;
        }
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "cannot create cache dir");
            return;
        }
        let path = self.path_for(key);
        match serde_json::to_string(posts) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::warn!(path = %path.display(), error = %e, "cache write failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "cache serialization failed"),
        }
    }
}

/// [`ForumSearcher`] decorator adding the disk cache to searches.
/// Comment fetches pass through uncached; the per-run comment cache in
/// the retrieval loop already covers them.
pub struct CachedSearcher {
    inner: Arc<dyn ForumSearcher>,
    cache: SearchCache,
}

impl CachedSearcher {
    pub fn new(inner: Arc<dyn ForumSearcher>, cache: SearchCache) -> Self {
        CachedSearcher { inner, cache }
    }
}

#[async_trait]
impl ForumSearcher for CachedSearcher {
    async fn search(&self, keyword: &str, limit: u32) -> Result<Vec<Post>, AgentError> {
        let key = SearchCache::key(keyword, 1, limit);
        let slot = self.cache.lock_for(&key);

        let result = {
            let _guard = slot.lock().await;

            if let Some(posts) = self.cache.load(&key) {
                tracing::debug!(keyword, "search cache hit");
                Ok(posts)
            } else {
                match self.inner.search(keyword, limit).await {
                    Ok(posts) => {
                        self.cache.store(&key, &posts);
                        Ok(posts)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        self.cache.release(&key, &slot);
        result
    }

    async fn fetch_comments(
        &self,
        post_id: u64,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Comment>, AgentError> {
        self.inner.fetch_comments(post_id, page, limit).await
    }
}
