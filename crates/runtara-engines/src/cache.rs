// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine Instance Cache.
//!
//! Bounded token → instance map with least-recently-used eviction. Evicted
//! entries are handed to the eviction callback after the cache lock has
//! been released, so the callback may freely call back into the cache.
//!
//! An evicted entry stays reachable through [`InstanceCache::evicted`] for
//! as long as something else holds it, so callers can tell an instance
//! that is still shutting down from one that is gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;
use uuid::Uuid;

/// Callback invoked for every evicted entry.
pub type EvictCallback<T> = Box<dyn Fn(Uuid, Arc<T>) + Send + Sync>;

struct Entry<T> {
    value: Arc<T>,
    last_used: u64,
}

struct Slots<T> {
    entries: HashMap<Uuid, Entry<T>>,
    evicted: HashMap<Uuid, Weak<T>>,
    clock: u64,
}

impl<T> Slots<T> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Bounded LRU registry of live instances keyed by execution token.
pub struct InstanceCache<T> {
    capacity: usize,
    slots: Mutex<Slots<T>>,
    on_evict: EvictCallback<T>,
}

impl<T> InstanceCache<T> {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize, on_evict: EvictCallback<T>) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Mutex::new(Slots {
                entries: HashMap::new(),
                evicted: HashMap::new(),
                clock: 0,
            }),
            on_evict,
        }
    }

    // Entries are plain data; a poisoned lock still holds a consistent map.
    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up an entry and mark it as most recently used.
    pub fn get(&self, token: &Uuid) -> Option<Arc<T>> {
        let mut slots = self.lock();
        let tick = slots.tick();
        slots.entries.get_mut(token).map(|entry| {
            entry.last_used = tick;
            entry.value.clone()
        })
    }

    /// Insert or replace an entry, evicting least-recently-used entries
    /// while over capacity. Returns the tokens that were evicted.
    ///
    /// A replaced entry for the same token is not treated as an eviction.
    pub fn set(&self, token: Uuid, value: Arc<T>) -> Vec<Uuid> {
        let evicted = {
            let mut slots = self.lock();
            let tick = slots.tick();
            slots.evicted.retain(|_, value| value.strong_count() > 0);
            slots.evicted.remove(&token);
            slots.entries.insert(
                token,
                Entry {
                    value,
                    last_used: tick,
                },
            );

            let mut evicted = Vec::new();
            while slots.entries.len() > self.capacity {
                let Some(victim) = slots
                    .entries
                    .iter()
                    .filter(|(key, _)| **key != token)
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(key, _)| *key)
                else {
                    break;
                };
                if let Some(entry) = slots.entries.remove(&victim) {
                    slots.evicted.insert(victim, Arc::downgrade(&entry.value));
                    evicted.push((victim, entry.value));
                }
            }
            evicted
        };

        let tokens = evicted.iter().map(|(token, _)| *token).collect();
        for (victim, value) in evicted {
            debug!(token = %victim, "Evicting instance from cache");
            (self.on_evict)(victim, value);
        }
        tokens
    }

    /// An evicted entry for `token` that is still alive elsewhere.
    ///
    /// Cleared once the value is dropped or the token is cached again.
    pub fn evicted(&self, token: &Uuid) -> Option<Arc<T>> {
        let mut slots = self.lock();
        let value = slots.evicted.get(token).and_then(Weak::upgrade);
        if value.is_none() {
            slots.evicted.remove(token);
        }
        value
    }

    /// Remove an entry without invoking the eviction callback.
    pub fn delete(&self, token: &Uuid) -> Option<Arc<T>> {
        self.lock().entries.remove(token).map(|entry| entry.value)
    }

    /// Remove an entry only if it is still `value`.
    ///
    /// Returns false when the token maps to a different instance or is absent.
    pub fn remove_if_same(&self, token: &Uuid, value: &Arc<T>) -> bool {
        let mut slots = self.lock();
        let same = slots
            .entries
            .get(token)
            .is_some_and(|entry| Arc::ptr_eq(&entry.value, value));
        if same {
            slots.entries.remove(token);
        }
        same
    }

    /// Whether the cache holds an entry for `token`, without touching recency.
    pub fn contains(&self, token: &Uuid) -> bool {
        self.lock().entries.contains_key(token)
    }

    /// Tokens currently cached.
    pub fn keys(&self) -> Vec<Uuid> {
        self.lock().entries.keys().copied().collect()
    }

    /// All cached entries.
    pub fn values(&self) -> Vec<Arc<T>> {
        self.lock()
            .entries
            .values()
            .map(|entry| entry.value.clone())
            .collect()
    }

    /// Number of cached entries.
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
