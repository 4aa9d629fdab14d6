//! TTL-bounded result cache with insertion-order eviction.
//!
//! Lookups never refresh an entry: an entry lives exactly `ttl` from the
//! moment it was inserted, and when the cache is full the entry inserted
//! first goes, however often it has been read since.

use std::collections::{HashMap, VecDeque};
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use crate::request::RequestKey;

pub const DEFAULT_CACHE_CAPACITY: usize = 50;

pub fn default_ttl() -> TimeDelta {
    TimeDelta::hours(24)
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("cache TTL must be positive, got {0}")]
    NonPositiveTtl(TimeDelta),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: RequestKey,
    pub value: V,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
}

/// Not `Sync` on its own; shared owners wrap it in a `Mutex`.
#[derive(Debug)]
pub struct ResultCache<V> {
    entries: HashMap<RequestKey, CacheEntry<V>>,
    /// Oldest insertion at the front
    order: VecDeque<RequestKey>,
    capacity: usize,
    ttl: TimeDelta,
}

impl<V: Clone> ResultCache<V> {
    /// A zero capacity is treated as one.
    pub fn new(capacity: usize, ttl: TimeDelta) -> Result<Self, CacheError> {
        if ttl <= TimeDelta::zero() {
            return Err(CacheError::NonPositiveTtl(ttl));
        }
        let capacity = capacity.max(1);

        Ok(Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            ttl,
        })
    }

    /// Return a clone of the cached value if it has not expired at `now`
    pub fn get(&mut self, key: &RequestKey, now: DateTime<Utc>) -> Option<V> {
        let expired = self.entries.get(key)?.is_expired(now);
        if expired {
            self.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn put(&mut self, key: RequestKey, value: V, now: DateTime<Utc>) {
        if self.entries.contains_key(&key) {
            self.remove(&key);
        }

        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }

        let entry = CacheEntry {
            key: key.clone(),
            value,
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.order.push_back(key.clone());
        self.entries.insert(key, entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            capacity: self.capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    fn remove(&mut self, key: &RequestKey) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}
