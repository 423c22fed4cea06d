//! Bounded in-memory L1 tier.
//!
//! Recency is tracked with a logical clock rather than wall time, so two
//! operations never share a timestamp and eviction order is deterministic.
//! Reads bump recency through an atomic under the shared lock; eviction
//! decisions are made under the exclusive lock.
//!
//! Eviction candidates come from an ordered index of stamps. A read does not
//! touch the index, so an indexed stamp may be older than the slot's current
//! one; eviction re-files such entries under their current stamp before
//! choosing a victim. Stamps only grow, so the first entry whose indexed
//! stamp is still current is the true least recently used one.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use fundcache_core::{CacheEntry, CacheResult, EvictionPolicy, StorageError};

/// Outcome of an L1 lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L1Lookup {
    /// Present and unexpired.
    Hit(CacheEntry),
    /// Present but past its expiry; left in place for the next sweep.
    Expired,
    /// Not present.
    Miss,
}

#[derive(Debug)]
struct L1Slot {
    entry: CacheEntry,
    /// Stamp of the last insert or, under LRU, the last read.
    last_accessed: AtomicU64,
    /// Stamp this slot is filed under in `L1State::order`.
    indexed: u64,
}

#[derive(Debug, Default)]
struct L1State {
    slots: HashMap<String, L1Slot>,
    order: BTreeMap<u64, String>,
}

impl L1State {
    fn remove(&mut self, key: &str) -> Option<L1Slot> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.indexed);
        Some(slot)
    }

    /// Remove and return the least recently used key.
    fn evict_one(&mut self) -> Option<String> {
        while let Some((stamp, key)) = self.order.pop_first() {
            let Some(slot) = self.slots.get_mut(&key) else {
                continue;
            };
            let current = slot.last_accessed.load(Ordering::Relaxed);
            if current == stamp {
                self.slots.remove(&key);
                return Some(key);
            }
            slot.indexed = current;
            self.order.insert(current, key);
        }
        None
    }
}

/// Entry-count bounded map with LRU or FIFO eviction.
#[derive(Debug)]
pub struct L1Tier {
    state: RwLock<L1State>,
    clock: AtomicU64,
    capacity: usize,
    policy: EvictionPolicy,
}

impl L1Tier {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            state: RwLock::new(L1State {
                slots: HashMap::with_capacity(capacity.min(4096)),
                order: BTreeMap::new(),
            }),
            clock: AtomicU64::new(0),
            capacity: capacity.max(1),
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up `key`, refreshing its recency on a hit.
    pub fn lookup(&self, key: &str, now: DateTime<Utc>) -> CacheResult<L1Lookup> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        let Some(slot) = state.slots.get(key) else {
            return Ok(L1Lookup::Miss);
        };
        if slot.entry.is_expired_at(now) {
            return Ok(L1Lookup::Expired);
        }
        if self.policy == EvictionPolicy::Lru {
            slot.last_accessed.store(self.tick(), Ordering::Relaxed);
        }
        Ok(L1Lookup::Hit(slot.entry.clone()))
    }

    /// Insert or replace `key`. Returns the keys evicted to make room.
    pub fn insert(&self, key: &str, entry: CacheEntry) -> CacheResult<Vec<String>> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;

        let mut evicted = Vec::new();
        if state.remove(key).is_none() {
            while state.slots.len() >= self.capacity {
                match state.evict_one() {
                    Some(victim) => evicted.push(victim),
                    None => break,
                }
            }
        }

        let now = self.tick();
        state.slots.insert(
            key.to_string(),
            L1Slot {
                entry,
                last_accessed: AtomicU64::new(now),
                indexed: now,
            },
        );
        state.order.insert(now, key.to_string());
        Ok(evicted)
    }

    pub fn remove(&self, key: &str) -> CacheResult<bool> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.remove(key).is_some())
    }

    /// Drop every entry. Returns how many were held.
    pub fn clear(&self) -> CacheResult<usize> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        let count = state.slots.len();
        state.slots.clear();
        state.order.clear();
        Ok(count)
    }

    /// Remove entries expired at `now`. Returns their keys.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> CacheResult<Vec<String>> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        let expired: Vec<String> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        Ok(expired)
    }

    pub fn len(&self) -> CacheResult<usize> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.slots.len())
    }

    pub fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Sum of advisory entry sizes.
    pub fn size_bytes(&self) -> CacheResult<u64> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state
            .slots
            .values()
            .map(|slot| slot.entry.size_estimate() as u64)
            .sum())
    }

    pub fn keys(&self) -> CacheResult<Vec<String>> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.slots.keys().cloned().collect())
    }
}
