// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Identity-keyed cache of host resources.
//!
//! Each entry owns a host handle plus the byte size the guest declared for
//! it. Replaced and evicted handles are passed to a disposer exactly once.
//! While the cache is locked nothing is disposed: replaced handles are queued
//! and released on [`ResourceCache::unlock`].

use std::time::{Duration, Instant};

use gal_common::CacheKey;
use log::{debug, trace};
use lru::LruCache;

use crate::error::{GalError, GalResult};

/// Eviction policy for unused entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    /// Entries unused for longer than this are eligible for eviction.
    pub max_age: Duration,
    /// Upper bound on evictions per expiry pass.
    pub max_removals_per_run: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(300),
            max_removals_per_run: 10,
        }
    }
}

pub type Disposer<V> = Box<dyn FnMut(V) + Send>;

struct Entry<V> {
    value: V,
    size: u64,
    last_used: Instant,
}

pub struct ResourceCache<V> {
    name: &'static str,
    entries: LruCache<CacheKey, Entry<V>>,
    disposer: Disposer<V>,
    locked: bool,
    deferred: Vec<V>,
    limits: CacheLimits,
}

impl<V> ResourceCache<V> {
    pub fn new(name: &'static str, limits: CacheLimits, disposer: Disposer<V>) -> Self {
        Self {
            name,
            entries: LruCache::unbounded(),
            disposer,
            locked: false,
            deferred: Vec::new(),
            limits,
        }
    }

    /// Install `value` under `key`, disposing (or queueing, while locked) the
    /// handle previously stored there.
    pub fn add_or_update(&mut self, key: CacheKey, value: V, size: u64) {
        let now = Instant::now();
        if let Some(old) = self.entries.pop(&key) {
            trace!("{}: replacing 0x{:X}", self.name, key);
            self.retire(old.value);
        }
        self.entries.push(
            key,
            Entry {
                value,
                size,
                last_used: now,
            },
        );
        if !self.locked {
            self.expire_unused(now);
        }
    }

    /// Swap the handle stored under `key` without touching its size or age.
    pub fn replace_value(&mut self, key: CacheKey, value: V) -> GalResult<()> {
        let entry = self
            .entries
            .peek_mut(&key)
            .ok_or(GalError::NotCached { key })?;
        let old = std::mem::replace(&mut entry.value, value);
        self.retire(old);
        Ok(())
    }

    pub fn try_get_value(&self, key: CacheKey) -> Option<&V> {
        self.entries.peek(&key).map(|e| &e.value)
    }

    pub fn try_get_value_mut(&mut self, key: CacheKey) -> Option<&mut V> {
        self.entries.peek_mut(&key).map(|e| &mut e.value)
    }

    pub fn try_get_size(&self, key: CacheKey) -> Option<u64> {
        self.entries.peek(&key).map(|e| e.size)
    }

    pub fn contains(&self, key: CacheKey) -> bool {
        self.entries.contains(&key)
    }

    /// Record a new declared size. The handle is left alone.
    pub fn resize(&mut self, key: CacheKey, size: u64) -> GalResult<()> {
        let entry = self
            .entries
            .peek_mut(&key)
            .ok_or(GalError::NotCached { key })?;
        entry.size = size;
        Ok(())
    }

    /// Mark `key` as just used. Returns false if it is not cached.
    pub fn touch(&mut self, key: CacheKey) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: CacheKey) -> bool {
        match self.entries.pop(&key) {
            Some(old) => {
                self.retire(old.value);
                true
            }
            None => false,
        }
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
        if !self.deferred.is_empty() {
            debug!(
                "{}: releasing {} handles replaced while locked",
                self.name,
                self.deferred.len()
            );
        }
        for value in std::mem::take(&mut self.deferred) {
            (self.disposer)(value);
        }
        self.expire_unused(Instant::now());
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Evict up to `max_removals_per_run` least recently used entries older
    /// than `max_age` at `now`. Does nothing while locked.
    pub fn expire_unused(&mut self, now: Instant) -> usize {
        if self.locked {
            return 0;
        }
        let mut removed = 0;
        while removed < self.limits.max_removals_per_run {
            let expired = match self.entries.peek_lru() {
                Some((_, entry)) => now.saturating_duration_since(entry.last_used) > self.limits.max_age,
                None => false,
            };
            if !expired {
                break;
            }
            if let Some((key, entry)) = self.entries.pop_lru() {
                trace!("{}: expiring 0x{:X}", self.name, key);
                (self.disposer)(entry.value);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("{}: expired {} unused entries", self.name, removed);
        }
        removed
    }

    /// Dispose every entry. Entries are queued instead while locked.
    pub fn clear(&mut self) {
        while let Some((_, entry)) = self.entries.pop_lru() {
            self.retire(entry.value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|(_, e)| e.size).sum()
    }

    fn retire(&mut self, value: V) {
        if self.locked {
            self.deferred.push(value);
        } else {
            (self.disposer)(value);
        }
    }
}

impl<V> Drop for ResourceCache<V> {
    fn drop(&mut self) {
        for value in std::mem::take(&mut self.deferred) {
            (self.disposer)(value);
        }
        while let Some((_, entry)) = self.entries.pop_lru() {
            (self.disposer)(entry.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn tracked(limits: CacheLimits) -> (ResourceCache<u32>, Arc<Mutex<Vec<u32>>>) {
        let disposed = Arc::new(Mutex::new(Vec::new()));
        let sink = disposed.clone();
        let cache = ResourceCache::new("test", limits, Box::new(move |v| sink.lock().push(v)));
        (cache, disposed)
    }

    #[test]
    fn test_replace_disposes_old_once() {
        let (mut cache, disposed) = tracked(CacheLimits::default());
        cache.add_or_update(7, 1, 100);
        cache.add_or_update(7, 2, 200);

        assert_eq!(*disposed.lock(), vec![1]);
        assert_eq!(cache.try_get_value(7), Some(&2));
        assert_eq!(cache.try_get_size(7), Some(200));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lock_defers_disposal() {
        let (mut cache, disposed) = tracked(CacheLimits::default());
        cache.add_or_update(1, 10, 4);
        cache.lock();
        cache.add_or_update(1, 11, 4);
        cache.add_or_update(1, 12, 4);
        assert!(cache.remove(1));
        assert!(disposed.lock().is_empty());

        cache.unlock();
        assert_eq!(*disposed.lock(), vec![10, 11, 12]);

        cache.add_or_update(2, 20, 4);
        cache.add_or_update(2, 21, 4);
        assert_eq!(disposed.lock().last(), Some(&20));
    }

    #[test]
    fn test_lookups_are_pure() {
        let (mut cache, _) = tracked(CacheLimits::default());
        assert!(!cache.contains(3));
        assert_eq!(cache.try_get_value(3), None);
        assert_eq!(cache.try_get_size(3), None);
        assert!(matches!(cache.resize(3, 1), Err(GalError::NotCached { key: 3 })));

        cache.add_or_update(3, 30, 16);
        cache.resize(3, 64).unwrap();
        assert_eq!(cache.try_get_size(3), Some(64));
        assert_eq!(cache.try_get_value(3), Some(&30));
        assert_eq!(cache.total_size(), 64);
    }

    #[test]
    fn test_expire_unused_respects_limits() {
        let limits = CacheLimits {
            max_age: Duration::from_secs(60),
            max_removals_per_run: 2,
        };
        let (mut cache, disposed) = tracked(limits);
        for key in 0..5 {
            cache.add_or_update(key, key as u32, 1);
        }
        cache.touch(0);

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(cache.expire_unused(later), 2);
        // Key 0 was touched last, so it is the most recently used.
        assert_eq!(*disposed.lock(), vec![1, 2]);

        cache.lock();
        assert_eq!(cache.expire_unused(later), 0);
        cache.unlock();

        assert_eq!(cache.expire_unused(Instant::now()), 0);
        assert_eq!(cache.expire_unused(later), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_replace_value_keeps_size() {
        let (mut cache, disposed) = tracked(CacheLimits::default());
        cache.add_or_update(9, 90, 32);
        cache.replace_value(9, 91).unwrap();
        assert_eq!(*disposed.lock(), vec![90]);
        assert_eq!(cache.try_get_size(9), Some(32));
        assert!(cache.replace_value(8, 1).is_err());
    }

    #[test]
    fn test_drop_disposes_everything() {
        let (mut cache, disposed) = tracked(CacheLimits::default());
        cache.add_or_update(1, 1, 1);
        cache.add_or_update(2, 2, 1);
        cache.lock();
        cache.add_or_update(2, 3, 1);
        drop(cache);

        let mut all = disposed.lock().clone();
        all.sort_unstable();
        assert_eq!(all, vec![1, 2, 3]);
    }
}
