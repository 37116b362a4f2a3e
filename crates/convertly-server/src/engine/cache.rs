use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use convertly_core::path::ConversionPath;

/// Cache key. A path depends on the session contents (captured by `version`)
/// and the conversion cut-off, never on wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathKey {
    pub session_id: String,
    pub version: u64,
    pub upto_ms: i64,
    /// The converting touchpoint, which always closes the path.
    pub touchpoint_id: String,
}

impl PathKey {
    pub fn new(session_id: &str, version: u64, upto: DateTime<Utc>, touchpoint_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            version,
            upto_ms: upto.timestamp_millis(),
            touchpoint_id: touchpoint_id.to_string(),
        }
    }
}

struct Entries<K, V> {
    values: HashMap<K, V>,
    order: VecDeque<K>,
}

/// Bounded FIFO cache.
///
/// Inserting past `max_entries` evicts the oldest entry. A `max_entries` of
/// zero disables caching.
pub struct BoundedCache<K, V> {
    entries: Mutex<Entries<K, V>>,
    max_entries: usize,
}

/// Reconstructed conversion paths. A late event bumps the session version, so
/// stale entries are simply never looked up again and age out through eviction.
pub type PathCache = BoundedCache<PathKey, ConversionPath>;

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(Entries {
                values: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_entries,
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().await.values.get(key).cloned()
    }

    /// Insert or replace. Replacing keeps the entry's place in the eviction order.
    pub async fn insert(&self, key: K, value: V) {
        if self.max_entries == 0 {
            return;
        }
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.values.get_mut(&key) {
            *existing = value;
            return;
        }
        while entries.order.len() >= self.max_entries {
            match entries.order.pop_front() {
                Some(oldest) => {
                    entries.values.remove(&oldest);
                }
                None => break,
            }
        }
        entries.order.push_back(key.clone());
        entries.values.insert(key, value);
    }

    /// Drop every entry whose key fails `keep`.
    pub async fn retain(&self, keep: impl Fn(&K) -> bool) {
        let mut entries = self.entries.lock().await;
        entries.order.retain(|k| keep(k));
        entries.values.retain(|k, _| keep(k));
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.values.len()
    }
}
