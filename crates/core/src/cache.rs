//! Blob cache capability and an in-process implementation.
//!
//! The cache holds serialised values with a TTL: file metadata, resolved
//! part locations and per-user channel selections. Keys are colon-separated
//! (`file:{id}`, `location:{fileId}:{partId}`, `channel:selected:{userId}`)
//! so related entries can be dropped with a prefix pattern.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

/// Key/value cache with TTL and pattern delete.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch a live value.
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Store a value for `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration);

    /// Remove one key.
    async fn delete(&self, key: &str);

    /// Remove every key matching a glob pattern; only a trailing `*` is supported.
    async fn delete_pattern(&self, pattern: &str);
}

/// Read and deserialize a JSON value. Undecodable entries count as misses.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
    let raw = cache.get(key).await?;
    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(key, error = %e, "dropping undecodable cache entry");
            cache.delete(key).await;
            None
        }
    }
}

/// Serialize and store a JSON value.
pub async fn set_json<T: Serialize + Sync>(cache: &dyn Cache, key: &str, value: &T, ttl: Duration) {
    match serde_json::to_vec(value) {
        Ok(raw) => cache.set(key, raw, ttl).await,
        Err(e) => tracing::warn!(key, error = %e, "failed to serialize cache entry"),
    }
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process cache backed by a concurrent map.
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            self.sweep();
            if self.entries.len() >= self.max_entries {
                tracing::debug!(key, "cache full, skipping insert");
                return;
            }
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn delete_pattern(&self, pattern: &str) {
        match pattern.strip_suffix('*') {
            Some(prefix) => self.entries.retain(|key, _| !key.starts_with(prefix)),
            None => {
                self.entries.remove(pattern);
            }
        }
    }
}

/// Cache key for a file row.
pub fn file_key(file_id: &crate::FileId) -> String {
    format!("file:{file_id}")
}

/// Cache key for a resolved part location.
pub fn location_key(file_id: &crate::FileId, part_id: i64) -> String {
    format!("location:{file_id}:{part_id}")
}

/// Pattern matching every location of one file.
pub fn location_pattern(file_id: &crate::FileId) -> String {
    format!("location:{file_id}:*")
}

/// Cache key for a user's selected channel.
pub fn selected_channel_key(user_id: i64) -> String {
    format!("channel:selected:{user_id}")
}

/// Cache key for a user's bot tokens.
pub fn bots_key(user_id: i64) -> String {
    format!("bots:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_expire() {
        let cache = MemoryCache::new(10);
        cache.set("a", b"1".to_vec(), Duration::from_secs(60)).await;
        cache.set("b", b"2".to_vec(), Duration::ZERO).await;
        assert_eq!(cache.get("a").await.as_deref(), Some(&b"1"[..]));
        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_pattern_by_prefix() {
        let cache = MemoryCache::new(10);
        let ttl = Duration::from_secs(60);
        cache.set("location:f1:1", vec![1], ttl).await;
        cache.set("location:f1:2", vec![2], ttl).await;
        cache.set("location:f2:1", vec![3], ttl).await;
        cache.delete_pattern("location:f1:*").await;
        assert!(cache.get("location:f1:1").await.is_none());
        assert!(cache.get("location:f1:2").await.is_none());
        assert!(cache.get("location:f2:1").await.is_some());
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let cache = MemoryCache::default();
        set_json(&cache, "k", &vec![1u32, 2, 3], Duration::from_secs(5)).await;
        let back: Option<Vec<u32>> = get_json(&cache, "k").await;
        assert_eq!(back, Some(vec![1, 2, 3]));

        cache.set("bad", b"{".to_vec(), Duration::from_secs(5)).await;
        let bad: Option<Vec<u32>> = get_json(&cache, "bad").await;
        assert!(bad.is_none());
        assert!(cache.get("bad").await.is_none());
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let cache = MemoryCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.set("a", vec![], ttl).await;
        cache.set("b", vec![], ttl).await;
        cache.set("c", vec![], ttl).await;
        assert_eq!(cache.len(), 2);
        assert!(cache.get("c").await.is_none());
    }
}
