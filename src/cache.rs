//! Bounded recency sets used for inventory dedup and self-connection
//! detection.

use std::borrow::Borrow;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

/// Default capacity of the process-wide sent-nonce set. Self-connections
/// can only race a handful of in-flight outbound attempts, so tens of
/// entries are plenty.
pub const DEFAULT_SENT_NONCE_CAPACITY: usize = 50;

/// A bounded membership set with strict least-recently-used eviction.
///
/// `insert` promotes an existing key to most-recent; `contains` is a pure
/// membership test with no effect on recency order.
pub struct RecencySet<K: Hash + Eq> {
    entries: LruCache<K, ()>,
}

impl<K: Hash + Eq> RecencySet<K> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Insert a key, promoting it if already present. Evicts the single
    /// least-recently-used entry when over capacity.
    pub fn insert(&mut self, key: K) {
        self.entries.put(key, ());
    }

    /// Membership test without touching recency order.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

/// Process-wide set of version nonces this node recently sent.
///
/// Shared across all peer instances: a self-connection can complete against
/// any outbound attempt, so detection has to see every nonce in flight.
/// Explicitly constructed and injected into each peer rather than living in
/// a global, which keeps test setups isolated.
pub struct SentNonces {
    nonces: Mutex<RecencySet<u64>>,
}

impl SentNonces {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            nonces: Mutex::new(RecencySet::new(capacity)),
        })
    }

    /// Generate a fresh random nonce, register it, and return it. Loops on
    /// the (astronomically unlikely) collision with a live nonce.
    pub fn next_nonce(&self) -> u64 {
        let mut nonces = self.nonces.lock();
        loop {
            let nonce = rand::random::<u64>();
            if !nonces.contains(&nonce) {
                nonces.insert(nonce);
                return nonce;
            }
        }
    }

    /// True if `nonce` is one we sent recently, i.e. the remote "peer" is us.
    pub fn contains(&self, nonce: u64) -> bool {
        self.nonces.lock().contains(&nonce)
    }
}

impl Default for SentNonces {
    fn default() -> Self {
        Self {
            nonces: Mutex::new(RecencySet::new(DEFAULT_SENT_NONCE_CAPACITY)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_members_survive_until_capacity_exceeded() {
        let mut set = RecencySet::new(3);
        set.insert("a");
        set.insert("b");
        set.insert("c");
        assert!(set.contains("a"));
        assert!(set.contains("b"));
        assert!(set.contains("c"));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_eviction_is_least_recently_used() {
        let mut set = RecencySet::new(3);
        set.insert("a");
        set.insert("b");
        set.insert("c");
        set.insert("d"); // "a" is the oldest untouched entry
        assert!(!set.contains("a"));
        assert!(set.contains("b"));
        assert!(set.contains("d"));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_reinsert_promotes_to_most_recent() {
        let mut set = RecencySet::new(3);
        set.insert("a");
        set.insert("b");
        set.insert("c");
        set.insert("a"); // promote
        set.insert("d"); // evicts "b", not "a"
        assert!(set.contains("a"));
        assert!(!set.contains("b"));
    }

    #[test]
    fn test_contains_does_not_promote() {
        let mut set = RecencySet::new(3);
        set.insert("a");
        set.insert("b");
        set.insert("c");
        assert!(set.contains("a")); // lookup must not refresh "a"
        set.insert("d");
        assert!(!set.contains("a"));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut set = RecencySet::new(0);
        set.insert(1u64);
        assert!(set.contains(&1));
        assert_eq!(set.capacity(), 1);
    }

    #[test]
    fn test_nonce_service_detects_own_nonce() {
        let nonces = SentNonces::new(8);
        let nonce = nonces.next_nonce();
        assert!(nonces.contains(nonce));
        assert!(!nonces.contains(nonce.wrapping_add(1)));
    }

    #[test]
    fn test_nonce_service_bounded() {
        let nonces = SentNonces::new(4);
        let first = nonces.next_nonce();
        for _ in 0..8 {
            nonces.next_nonce();
        }
        assert!(!nonces.contains(first));
    }
}
