//! Cache of inflated object bytes keyed by `(pack, offset)`.
//!
//! Delta chains revisit the same base repeatedly; caching the inflated
//! bytes of recently used entries turns an O(chain) re-inflation into a
//! map lookup. The budget is independent of the window cache's and the
//! keys carry the pack identity token, so entries for a repacked file can
//! never be served against its replacement.
//!
//! # Invariants
//! - Total resident bytes never exceed the budget after a `store`.
//! - An entry larger than the whole budget is refused, not stored.
//! - Eviction is strict LRU over both hits and stores.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::entry::ObjectKind;
use crate::window::PackToken;

struct CacheEntry {
    kind: ObjectKind,
    bytes: Arc<[u8]>,
    last_used: u64,
}

struct Inner {
    budget_bytes: usize,
    tick: u64,
    entries: HashMap<(PackToken, u64), CacheEntry>,
    resident_bytes: usize,
}

impl Inner {
    fn evict_to(&mut self, target: usize) {
        while self.resident_bytes > target {
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| *key);
            let Some(key) = victim else { break };
            if let Some(entry) = self.entries.remove(&key) {
                self.resident_bytes -= entry.bytes.len();
            }
        }
    }
}

/// Shared LRU cache of inflated objects.
pub struct UnpackedObjectCache {
    inner: Mutex<Inner>,
}

impl UnpackedObjectCache {
    /// Creates a cache with the given byte budget.
    #[must_use]
    pub fn new(budget_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                budget_bytes,
                tick: 0,
                entries: HashMap::new(),
                resident_bytes: 0,
            }),
        })
    }

    /// Fetches the cached bytes for a pack entry, bumping its recency.
    #[must_use]
    pub fn get(&self, pack: PackToken, offset: u64) -> Option<(Arc<[u8]>, ObjectKind)> {
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner.entries.get_mut(&(pack, offset))?;
        entry.last_used = tick;
        Some((Arc::clone(&entry.bytes), entry.kind))
    }

    /// Stores inflated bytes for a pack entry.
    ///
    /// Entries larger than the whole budget are refused without error, and
    /// commits are never cached: they are read once during traversal and
    /// would only displace delta bases that do get revisited.
    pub fn store(&self, pack: PackToken, offset: u64, bytes: Arc<[u8]>, kind: ObjectKind) {
        if kind == ObjectKind::Commit {
            return;
        }
        let mut inner = self.lock();
        if bytes.len() > inner.budget_bytes {
            return;
        }
        inner.tick += 1;
        let tick = inner.tick;

        let incoming = bytes.len();
        let target = inner.budget_bytes - incoming;
        inner.evict_to(target);

        let prev = inner.entries.insert(
            (pack, offset),
            CacheEntry {
                kind,
                bytes,
                last_used: tick,
            },
        );
        inner.resident_bytes += incoming;
        if let Some(prev) = prev {
            inner.resident_bytes -= prev.bytes.len();
        }
    }

    /// Drops every entry belonging to one pack identity.
    ///
    /// Must run before a pack path is reused for different bytes.
    pub fn purge(&self, pack: PackToken) {
        let mut inner = self.lock();
        let mut freed = 0usize;
        inner.entries.retain(|(token, _), entry| {
            if *token == pack {
                freed += entry.bytes.len();
                false
            } else {
                true
            }
        });
        inner.resident_bytes -= freed;
    }

    /// Current resident byte total, for tests and diagnostics.
    #[must_use]
    pub fn resident_bytes(&self) -> usize {
        self.lock().resident_bytes
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(len: usize, fill: u8) -> Arc<[u8]> {
        Arc::from(vec![fill; len].into_boxed_slice())
    }

    #[test]
    fn store_then_get_round_trips() {
        let cache = UnpackedObjectCache::new(1024);
        let pack = PackToken::next();
        cache.store(pack, 40, bytes(16, 0xaa), ObjectKind::Blob);

        let (got, kind) = cache.get(pack, 40).unwrap();
        assert_eq!(kind, ObjectKind::Blob);
        assert_eq!(&got[..], &[0xaa; 16][..]);
        assert!(cache.get(pack, 41).is_none());
    }

    #[test]
    fn lru_eviction_respects_budget() {
        let cache = UnpackedObjectCache::new(32);
        let pack = PackToken::next();
        cache.store(pack, 0, bytes(16, 1), ObjectKind::Blob);
        cache.store(pack, 16, bytes(16, 2), ObjectKind::Blob);
        // Touch the first entry so the second is the LRU victim.
        cache.get(pack, 0).unwrap();
        cache.store(pack, 32, bytes(16, 3), ObjectKind::Blob);

        assert!(cache.get(pack, 0).is_some());
        assert!(cache.get(pack, 16).is_none());
        assert!(cache.get(pack, 32).is_some());
        assert!(cache.resident_bytes() <= 32);
    }

    #[test]
    fn oversized_entries_are_refused() {
        let cache = UnpackedObjectCache::new(8);
        let pack = PackToken::next();
        cache.store(pack, 0, bytes(9, 0), ObjectKind::Blob);
        assert!(cache.get(pack, 0).is_none());
        assert_eq!(cache.resident_bytes(), 0);
    }

    #[test]
    fn commits_are_never_cached() {
        let cache = UnpackedObjectCache::new(1024);
        let pack = PackToken::next();
        cache.store(pack, 0, bytes(4, 0), ObjectKind::Commit);
        assert!(cache.get(pack, 0).is_none());
    }

    #[test]
    fn purge_is_scoped_to_one_pack() {
        let cache = UnpackedObjectCache::new(1024);
        let stale = PackToken::next();
        let live = PackToken::next();
        cache.store(stale, 0, bytes(8, 1), ObjectKind::Blob);
        cache.store(stale, 8, bytes(8, 2), ObjectKind::Tree);
        cache.store(live, 0, bytes(8, 3), ObjectKind::Blob);

        cache.purge(stale);
        assert!(cache.get(stale, 0).is_none());
        assert!(cache.get(stale, 8).is_none());
        assert!(cache.get(live, 0).is_some());
        assert_eq!(cache.resident_bytes(), 8);
    }

    #[test]
    fn restore_of_same_key_replaces_without_leak() {
        let cache = UnpackedObjectCache::new(64);
        let pack = PackToken::next();
        cache.store(pack, 0, bytes(16, 1), ObjectKind::Blob);
        cache.store(pack, 0, bytes(8, 2), ObjectKind::Blob);
        assert_eq!(cache.resident_bytes(), 8);
        let (got, _) = cache.get(pack, 0).unwrap();
        assert_eq!(&got[..], &[2u8; 8][..]);
    }
}
