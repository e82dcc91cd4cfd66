use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// In-process TTL store for per-request state that must not outlive its
/// usefulness (seeded credentials, CSRF tokens). `get` evicts expired
/// entries lazily; a periodic sweep reclaims the rest.
pub struct EphemeralStore<T> {
    entries: Mutex<HashMap<String, (T, Instant)>>,
    ttl: Duration,
}

impl<T: Clone> EphemeralStore<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn put(&self, key: impl Into<String>, value: T) {
        self.entries
            .lock()
            .await
            .insert(key.into(), (value, Instant::now()));
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((_, at)) if at.elapsed() > self.ttl => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    pub async fn remove(&self, key: &str) -> Option<T> {
        self.entries.lock().await.remove(key).map(|(v, _)| v)
    }

    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, (_, at)| at.elapsed() <= self.ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = EphemeralStore::new(Duration::from_secs(60));
        store.put("a", 1u32).await;
        assert_eq!(store.get("a").await, Some(1));
        assert_eq!(store.remove("a").await, Some(1));
        assert_eq!(store.get("a").await, None);
    }

    #[tokio::test]
    async fn test_get_evicts_expired() {
        let store = EphemeralStore::new(Duration::from_millis(10));
        store.put("a", 1u32).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(store.get("a").await, None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep() {
        let store = EphemeralStore::new(Duration::from_millis(10));
        store.put("a", 1u32).await;
        store.put("b", 2u32).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        store.put("c", 3u32).await;
        assert_eq!(store.sweep().await, 2);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("c").await, Some(3));
    }
}
