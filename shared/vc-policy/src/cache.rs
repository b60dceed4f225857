//! Bounded, idle-expiring concurrent cache.
//!
//! Backed by `DashMap` so lookups never contend on a global lock. Every
//! read refreshes the entry's last-access stamp; an entry not read within
//! the TTL is treated as absent and dropped lazily. When an insert would
//! exceed the capacity, expired entries are purged first and then the
//! least recently accessed tenth of the cache is evicted.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Slot<V> {
    value: V,
    /// Milliseconds since the cache epoch.
    last_access: AtomicU64,
}

pub struct TtlCache<K, V> {
    entries: DashMap<K, Slot<V>>,
    capacity: usize,
    ttl: Duration,
    epoch: Instant,
}

impl<K: Eq + Hash, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// `capacity` is clamped to at least one entry.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
            epoch: Instant::now(),
        }
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn is_expired(&self, slot: &Slot<V>, now: u64) -> bool {
        let idle = now.saturating_sub(slot.last_access.load(Ordering::Relaxed));
        u128::from(idle) >= self.ttl.as_millis()
    }

    /// Value for `key`, refreshing its idle timer.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.now();

        {
            let slot = self.entries.get(key)?;
            if !self.is_expired(&slot, now) {
                slot.last_access.store(now, Ordering::Relaxed);
                return Some(slot.value.clone());
            }
        }

        self.entries.remove_if(key, |_, slot| self.is_expired(slot, now));
        None
    }

    pub fn insert(&self, key: K, value: V) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict();
        }

        self.entries.insert(
            key,
            Slot {
                value,
                last_access: AtomicU64::new(self.now()),
            },
        );
    }

    /// Cached value for `key`, or the result of `init` (which is then cached).
    pub fn get_or_insert_with(&self, key: K, init: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get(&key) {
            return value;
        }

        let value = init();
        self.insert(key, value.clone());
        value
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, slot)| slot.value)
    }

    /// Keep only the entries for which `keep` returns `true`.
    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) {
        self.entries.retain(|key, slot| keep(key, &slot.value));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of resident entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !self.is_expired(slot, now));
        before.saturating_sub(self.entries.len())
    }

    fn evict(&self) {
        self.purge_expired();
        if self.entries.len() < self.capacity {
            return;
        }

        let mut stamps: Vec<(u64, K)> = self
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.value().last_access.load(Ordering::Relaxed),
                    entry.key().clone(),
                )
            })
            .collect();

        let batch = (self.capacity / 10).clamp(1, stamps.len());
        if batch < stamps.len() {
            stamps.select_nth_unstable_by_key(batch, |(stamp, _)| *stamp);
        }

        for (_, key) in stamps.into_iter().take(batch) {
            self.entries.remove(&key);
        }

        tracing::trace!(evicted = batch, capacity = self.capacity, "Evicted idle cache entries");
    }
}
