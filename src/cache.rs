use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Memoises values by key for a fixed time-to-live. Expiry is the only
/// invalidation.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: HashMap<K, (Instant, V)>,
}

impl<K: Eq + Hash, V> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &K, now: Instant) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|(stored, _)| now.duration_since(*stored) < self.ttl)
            .map(|(_, value)| value)
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.entries.insert(key, (Instant::now(), value));
    }

    pub fn purge_expired(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.entries.retain(|_, (stored, _)| now.duration_since(*stored) < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
