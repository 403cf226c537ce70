/// In-memory identity cache
///
/// An LRU over resolved identities with the same stale/expired semantics
/// as the persistent layer, just much shorter-lived.
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::identity::Identity;

struct Entry {
    identity: Identity,
    inserted: Instant,
}

pub struct MemoryCache {
    entries: Mutex<LruCache<String, Entry>>,
    stale_after: Duration,
    max_age: Duration,
}

impl MemoryCache {
    pub fn new(capacity: usize, stale_after: Duration, max_age: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            stale_after,
            max_age,
        }
    }

    /// Cached identity plus whether it is due a refresh
    pub fn get(&self, did: &str) -> Option<(Identity, bool)> {
        let mut entries = self.entries.lock().expect("memory cache poisoned");
        let entry = entries.get(did)?;
        let age = entry.inserted.elapsed();
        if age > self.max_age {
            entries.pop(did);
            return None;
        }
        Some((entry.identity.clone(), age > self.stale_after))
    }

    pub fn put(&self, identity: Identity) {
        let mut entries = self.entries.lock().expect("memory cache poisoned");
        entries.put(
            identity.did.clone(),
            Entry {
                identity,
                inserted: Instant::now(),
            },
        );
    }

    pub fn remove(&self, did: &str) {
        let mut entries = self.entries.lock().expect("memory cache poisoned");
        entries.pop(did);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("memory cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
