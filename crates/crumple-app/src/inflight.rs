//! Single-flight registry: at most one running execution per request key.
//!
//! Entries hold only a weak handle to the shared outcome. The running future
//! owns a cleanup guard, so the entry disappears when the work settles, and
//! also when every waiter has gone away and the work is dropped unfinished.
//!
//! Each entry also carries a `watch` handle chosen by whoever started the
//! work (an event sender, say), handed to every caller that joins it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use futures::future::{self, BoxFuture, FutureExt, Shared, WeakShared};
use log::debug;
use crumple_core::RequestKey;

pub type SharedOutcome<T> = Shared<BoxFuture<'static, T>>;

/// How [`InFlightRegistry::get_or_start`] produced its outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flight {
    Started,
    Joined,
    /// No work was pending and the `settled` lookup already had a value
    Settled,
}

pub struct Lookup<T, W> {
    pub outcome: SharedOutcome<T>,
    pub flight: Flight,
    /// `None` for settled lookups
    pub watch: Option<W>,
}

struct Entry<T, W> {
    generation: u64,
    outcome: WeakShared<BoxFuture<'static, T>>,
    watch: W,
}

struct Entries<T, W> {
    map: HashMap<RequestKey, Entry<T, W>>,
    next_generation: u64,
}

pub struct InFlightRegistry<T, W = ()> {
    entries: Arc<Mutex<Entries<T, W>>>,
}

impl<T, W> Clone for InFlightRegistry<T, W> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T, W> Default for InFlightRegistry<T, W> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                map: HashMap::new(),
                next_generation: 0,
            })),
        }
    }
}

impl<T, W> InFlightRegistry<T, W>
where
    T: Clone + Send + Sync + 'static,
    W: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the pending execution for `key`; failing that, take the value
    /// `settled` reports; failing that, start `factory`'s work.
    ///
    /// All three steps run under one lock. Work that stores its result where
    /// `settled` looks before it finishes therefore leaves no window in which
    /// a caller sees neither the running work nor its result.
    pub fn get_or_start<S, F, Fut>(&self, key: &RequestKey, settled: S, factory: F) -> Lookup<T, W>
    where
        S: FnOnce() -> Option<T>,
        F: FnOnce() -> (Fut, W),
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut entries = lock(&self.entries);

        if let Some(entry) = entries.map.get(key) {
            if let Some(outcome) = entry.outcome.upgrade() {
                debug!("Joining in-flight transform {}", key);
                return Lookup {
                    outcome,
                    flight: Flight::Joined,
                    watch: Some(entry.watch.clone()),
                };
            }
        }

        if let Some(value) = settled() {
            debug!("Transform {} settled before it could be joined", key);
            return Lookup {
                outcome: future::ready(value).boxed().shared(),
                flight: Flight::Settled,
                watch: None,
            };
        }

        entries.next_generation += 1;
        let generation = entries.next_generation;
        let guard = Cleanup {
            entries: Arc::downgrade(&self.entries),
            key: key.clone(),
            generation,
        };

        let (work, watch) = factory();
        let outcome = async move {
            let _guard = guard;
            work.await
        }
        .boxed()
        .shared();

        if let Some(weak) = outcome.downgrade() {
            entries.map.insert(
                key.clone(),
                Entry {
                    generation,
                    outcome: weak,
                    watch: watch.clone(),
                },
            );
        }

        Lookup {
            outcome,
            flight: Flight::Started,
            watch: Some(watch),
        }
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        lock(&self.entries).map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its entry on drop, unless a newer execution took the key over
struct Cleanup<T, W> {
    entries: Weak<Mutex<Entries<T, W>>>,
    key: RequestKey,
    generation: u64,
}

impl<T, W> Drop for Cleanup<T, W> {
    fn drop(&mut self) {
        let Some(entries) = self.entries.upgrade() else {
            return;
        };
        let mut entries = lock(&entries);
        if entries.map.get(&self.key).is_some_and(|e| e.generation == self.generation) {
            entries.map.remove(&self.key);
            debug!("Released in-flight transform {}", self.key);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
