use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

type Flight = Arc<Mutex<()>>;

struct Entries<K, V> {
    values: HashMap<K, V>,
    order: VecDeque<K>,
}

/// Bounded key/value store with get-or-fetch semantics.
///
/// Holds at most `capacity` entries; inserting past that evicts the entry
/// inserted earliest. Concurrent misses on one key share a single fetch.
pub struct EntityCache<K, V> {
    capacity: usize,
    entries: Mutex<Entries<K, V>>,
    inflight: DashMap<K, Flight>,
}

/// Drops a caller's interest in an in-flight fetch, including when the
/// caller is cancelled mid-fetch.
struct FlightRelease<'a, K: Eq + Hash> {
    inflight: &'a DashMap<K, Flight>,
    key: K,
}

impl<K: Eq + Hash> Drop for FlightRelease<'_, K> {
    fn drop(&mut self) {
        // Only the map's reference left means nobody else is queued.
        self.inflight
            .remove_if(&self.key, |_, flight| Arc::strong_count(flight) == 1);
    }
}

impl<K, V> EntityCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Entries {
                values: HashMap::new(),
                order: VecDeque::new(),
            }),
            inflight: DashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.values.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.entries.lock().await.values.contains_key(key)
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().await.values.get(key).cloned()
    }

    /// Keys from oldest to newest insertion.
    pub async fn keys(&self) -> Vec<K> {
        self.entries.lock().await.order.iter().cloned().collect()
    }

    /// Store a value. Replacing an existing key keeps its original position.
    /// Returns the key evicted to make room, if any.
    pub async fn insert(&self, key: K, value: V) -> Option<K> {
        let mut entries = self.entries.lock().await;
        if let Some(slot) = entries.values.get_mut(&key) {
            *slot = value;
            return None;
        }

        let mut evicted = None;
        if entries.values.len() >= self.capacity {
            evicted = entries.order.pop_front();
            if let Some(oldest) = &evicted {
                entries.values.remove(oldest);
            }
        }
        entries.order.push_back(key.clone());
        entries.values.insert(key, value);
        evicted
    }

    /// Return the cached value for `key`, or run `fetch` and cache its
    /// result. Fetch errors propagate and leave the key absent.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let entries = self.entries.lock().await;
        if let Some(value) = entries.values.get(&key) {
            return Ok(value.clone());
        }
        // Declared before `flight` so it runs after that handle is gone.
        let _release = FlightRelease {
            inflight: &self.inflight,
            key: key.clone(),
        };
        let flight = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        drop(entries);

        let _turn = flight.lock().await;
        // Whoever held the turn before us may have filled the slot.
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }
        let value = fetch(key.clone()).await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_evicts_earliest_insertion() {
        let cache = EntityCache::new(2);
        cache.insert(1, "a").await;
        cache.insert(2, "b").await;
        let evicted = cache.insert(3, "c").await;

        assert_eq!(evicted, Some(1));
        assert_eq!(cache.keys().await, vec![2, 3]);
        assert!(!cache.contains(&1).await);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_fetch_overflow_evicts_earliest() {
        let cache = EntityCache::new(2);
        for key in [1u64, 2, 3] {
            let value = cache
                .get_or_fetch(key, |k| async move { Ok::<_, String>(k * 100) })
                .await
                .unwrap();
            assert_eq!(value, key * 100);
        }
        assert_eq!(cache.keys().await, vec![2, 3]);
        assert_eq!(cache.get(&1).await, None);
    }

    #[tokio::test]
    async fn test_replacing_keeps_position() {
        let cache = EntityCache::new(2);
        cache.insert(1, "a").await;
        cache.insert(2, "b").await;
        assert_eq!(cache.insert(1, "a2").await, None);
        cache.insert(3, "c").await;

        assert_eq!(cache.keys().await, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_size_never_exceeds_capacity() {
        let cache = EntityCache::new(5);
        for i in 0..6 {
            cache.insert(i, i * 10).await;
            assert!(cache.len().await <= 5);
        }
        assert_eq!(cache.len().await, 5);
        assert!(!cache.contains(&0).await);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_clamped() {
        let cache = EntityCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert("x", 1).await;
        cache.insert("y", 2).await;
        assert_eq!(cache.keys().await, vec!["y"]);
    }

    #[tokio::test]
    async fn test_hit_skips_fetch() {
        let cache = EntityCache::new(4);
        let calls = AtomicUsize::new(0);
        let fetch = |key: u64| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, String>(format!("user-{key}")) }
        };

        assert_eq!(cache.get_or_fetch(7, fetch).await.unwrap(), "user-7");
        assert_eq!(cache.get_or_fetch(7, fetch).await.unwrap(), "user-7");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_error_is_not_cached() {
        let cache: EntityCache<u64, String> = EntityCache::new(4);
        let err = cache
            .get_or_fetch(1, |_| async { Err::<String, _>("unavailable") })
            .await
            .unwrap_err();
        assert_eq!(err, "unavailable");
        assert!(cache.is_empty().await);

        let value = cache
            .get_or_fetch(1, |_| async { Ok::<_, &str>("found".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "found");
    }

    #[tokio::test]
    async fn test_concurrent_misses_fetch_once() {
        let cache = Arc::new(EntityCache::new(4));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(42u64, |key| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, String>(key * 2)
                    })
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 84);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_failed_fetch_lets_next_caller_retry() {
        let cache = Arc::new(EntityCache::new(4));
        let first = cache
            .get_or_fetch(1u64, |_| async { Err::<u64, _>("down") })
            .await;
        assert!(first.is_err());
        let second = cache.get_or_fetch(1u64, |_| async { Ok::<_, &str>(5) }).await;
        assert_eq!(second, Ok(5));
        assert_eq!(cache.get(&1).await, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_fetch_releases_its_slot() {
        let cache: EntityCache<u64, u64> = EntityCache::new(4);
        for key in 0..100u64 {
            let pending = cache.get_or_fetch(key, |_| std::future::pending::<Result<u64, String>>());
            let outcome = tokio::time::timeout(Duration::from_millis(1), pending).await;
            assert!(outcome.is_err());
        }
        assert!(cache.is_empty().await);
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_holder_hands_over_to_waiter() {
        let cache = Arc::new(EntityCache::new(4));

        let holder = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(9u64, |_| std::future::pending::<Result<u64, String>>())
                    .await
            })
        };
        while cache.inflight.is_empty() {
            tokio::task::yield_now().await;
        }
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(9u64, |_| async { Ok::<_, String>(90) })
                    .await
            })
        };
        tokio::task::yield_now().await;
        holder.abort();

        assert_eq!(waiter.await.unwrap(), Ok(90));
        assert!(cache.inflight.is_empty());
    }
}
