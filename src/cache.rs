//! Time- and size-bounded cache for derived views.
//!
//! Entries expire `ttl` after insertion. When the cache is full, expired
//! entries are purged first and then the oldest entry is evicted.
//!
//! Every key carries a generation that [`TtlCache::invalidate`] bumps. A
//! value computed from state read at generation `g` is stored with
//! [`TtlCache::insert_if_current`] and dropped if the key was invalidated
//! meanwhile.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

struct Slots<K, V> {
    entries: HashMap<K, (Instant, V)>,
    generations: HashMap<K, u64>,
}

pub struct TtlCache<K, V> {
    slots: Mutex<Slots<K, V>>,
    ttl: Duration,
    capacity: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots { entries: HashMap::new(), generations: HashMap::new() }),
            ttl,
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots<K, V>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_disabled(&self) -> bool {
        self.capacity == 0 || self.ttl.is_zero()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut slots = self.lock();
        match slots.entries.get(key) {
            Some((at, value)) if at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                slots.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Current generation of `key`. Read it before computing a value.
    pub fn generation(&self, key: &K) -> u64 {
        self.lock().generations.get(key).copied().unwrap_or(0)
    }

    pub fn insert(&self, key: K, value: V) {
        if self.is_disabled() {
            return;
        }
        let mut slots = self.lock();
        self.store(&mut slots, key, value);
    }

    /// Stores `value` only if `key` was not invalidated since `generation`
    /// was read. Returns whether it was stored.
    pub fn insert_if_current(&self, key: K, value: V, generation: u64) -> bool {
        if self.is_disabled() {
            return false;
        }
        let mut slots = self.lock();
        if slots.generations.get(&key).copied().unwrap_or(0) != generation {
            return false;
        }
        self.store(&mut slots, key, value);
        true
    }

    fn store(&self, slots: &mut Slots<K, V>, key: K, value: V) {
        let entries = &mut slots.entries;
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let ttl = self.ttl;
            entries.retain(|_, (at, _)| at.elapsed() < ttl);
            if entries.len() >= self.capacity {
                let oldest = entries.iter().min_by_key(|(_, (at, _))| *at).map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(key, (Instant::now(), value));
    }

    pub fn invalidate(&self, key: &K) {
        let mut slots = self.lock();
        slots.entries.remove(key);
        // generations are never forgotten, a reset to 0 could match a stale reader
        *slots.generations.entry(key.clone()).or_insert(0) += 1;
    }

    /// Drops every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut slots = self.lock();
        let before = slots.entries.len();
        let ttl = self.ttl;
        slots.entries.retain(|_, (at, _)| at.elapsed() < ttl);
        before - slots.entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
