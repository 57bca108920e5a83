use crate::{model::Symbol, pattern::PatternKind};
use fnv::FnvHashSet;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Identity of an alert: one per (symbol, pattern, candle open time).
#[derive(Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
pub struct DedupKey {
    pub symbol: Symbol,
    pub pattern: PatternKind,
    pub candle_open_time_ms: i64,
}

/// Bounded store of recently emitted alert keys.
///
/// Entries are evicted once older than the retention horizon, and the oldest entry is evicted
/// when capacity is reached, so memory never grows with uptime.
#[derive(Debug)]
pub struct DedupStore {
    retention_ms: i64,
    capacity: usize,
    order: VecDeque<(i64, DedupKey)>,
    keys: FnvHashSet<DedupKey>,
}

impl DedupStore {
    pub fn new(retention_ms: i64, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            retention_ms,
            capacity,
            order: VecDeque::with_capacity(capacity),
            keys: FnvHashSet::default(),
        }
    }

    /// Key was emitted within the retention horizon ending at `now_ms`.
    pub fn contains(&mut self, key: &DedupKey, now_ms: i64) -> bool {
        self.prune(now_ms);
        self.keys.contains(key)
    }

    /// Record `key`. Returns false if it was already present.
    pub fn insert(&mut self, key: DedupKey, now_ms: i64) -> bool {
        self.prune(now_ms);
        if self.keys.contains(&key) {
            return false;
        }

        while self.order.len() >= self.capacity {
            if let Some((_, evicted)) = self.order.pop_front() {
                self.keys.remove(&evicted);
            }
        }

        self.keys.insert(key.clone());
        self.order.push_back((now_ms, key));
        true
    }

    /// Drop entries older than the retention horizon.
    pub fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.retention_ms;
        while let Some((inserted_at, _)) = self.order.front() {
            if *inserted_at > cutoff {
                break;
            }
            if let Some((_, key)) = self.order.pop_front() {
                self.keys.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pattern: PatternKind, candle_open_time_ms: i64) -> DedupKey {
        DedupKey {
            symbol: Symbol::new("BTCUSDT"),
            pattern,
            candle_open_time_ms,
        }
    }

    #[test]
    fn test_dedup_store_insert() {
        struct TestCase {
            key: DedupKey,
            now_ms: i64,
            expected: bool,
        }

        let mut store = DedupStore::new(1_000, 3);

        let tests = vec![
            TestCase {
                // TC0: first sighting
                key: key(PatternKind::Trap, 0),
                now_ms: 0,
                expected: true,
            },
            TestCase {
                // TC1: duplicate inside retention
                key: key(PatternKind::Trap, 0),
                now_ms: 500,
                expected: false,
            },
            TestCase {
                // TC2: same candle, different pattern
                key: key(PatternKind::Pullback, 0),
                now_ms: 600,
                expected: true,
            },
            TestCase {
                // TC3: duplicate after retention expired is new again
                key: key(PatternKind::Trap, 0),
                now_ms: 1_000,
                expected: true,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = store.insert(test.key, test.now_ms);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_dedup_store_is_bounded() {
        let mut store = DedupStore::new(i64::MAX / 2, 3);
        for open_time in 0..10 {
            assert!(store.insert(key(PatternKind::Ignition, open_time), open_time));
            assert!(store.len() <= 3);
        }

        assert_eq!(store.len(), 3);
        assert!(!store.contains(&key(PatternKind::Ignition, 6), 10));
        assert!(store.contains(&key(PatternKind::Ignition, 7), 10));
        assert!(store.contains(&key(PatternKind::Ignition, 9), 10));
    }

    #[test]
    fn test_dedup_store_prunes_by_age() {
        let mut store = DedupStore::new(100, 10);
        store.insert(key(PatternKind::Trap, 0), 0);
        store.insert(key(PatternKind::Trap, 1), 50);

        store.prune(120);
        assert_eq!(store.len(), 1);
        assert!(store.contains(&key(PatternKind::Trap, 1), 120));
        assert!(!store.is_empty());

        store.prune(150);
        assert!(store.is_empty());
    }
}
