//! Lock-free byte counters keyed by [`AuditKey`]

use super::key::AuditKey;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Accumulated byte counts waiting to be written
#[derive(Debug, Default)]
pub struct AuditCounters {
    counts: DashMap<AuditKey, AtomicU64>,
}

impl AuditCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `count` to the counter for `key`, creating it if absent
    pub fn add(&self, key: AuditKey, count: u64) {
        if count == 0 {
            return;
        }
        if let Some(counter) = self.counts.get(&key) {
            counter.fetch_add(count, Ordering::AcqRel);
            return;
        }
        self.counts
            .entry(key)
            .or_default()
            .fetch_add(count, Ordering::AcqRel);
    }

    /// Current value of a counter
    pub fn get(&self, key: &AuditKey) -> Option<u64> {
        self.counts.get(key).map(|c| c.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Snapshot of the current keys
    pub fn keys(&self) -> Vec<AuditKey> {
        self.counts.iter().map(|e| e.key().clone()).collect()
    }

    /// Read and reset a counter to zero, leaving the key in place
    pub fn take(&self, key: &AuditKey) -> Option<u64> {
        self.counts.get(key).map(|c| c.swap(0, Ordering::AcqRel))
    }

    /// Remove a counter if it is still zero
    ///
    /// The check and removal happen under the shard lock, so an increment
    /// racing with this call either lands first (and the key stays) or
    /// recreates the key afterwards.
    pub fn remove_if_zero(&self, key: &AuditKey) -> bool {
        self.counts
            .remove_if(key, |_, c| c.load(Ordering::Acquire) == 0)
            .is_some()
    }

    /// Put back a count that could not be written
    pub fn restore(&self, key: AuditKey, count: u64) {
        self.add(key, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::key::Traffic;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn make_key(object_id: i64) -> AuditKey {
        AuditKey::new(
            Traffic::Publish,
            object_id,
            Some("a".to_string()),
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_add_and_take() {
        let counters = AuditCounters::new();
        counters.add(make_key(1), 10);
        counters.add(make_key(1), 20);
        counters.add(make_key(1), 5);
        counters.add(make_key(2), 0);

        assert_eq!(counters.len(), 1);
        assert_eq!(counters.take(&make_key(1)), Some(35));
        assert_eq!(counters.get(&make_key(1)), Some(0));
        assert_eq!(counters.take(&make_key(2)), None);
    }

    #[test]
    fn test_remove_if_zero() {
        let counters = AuditCounters::new();
        counters.add(make_key(1), 10);
        assert!(!counters.remove_if_zero(&make_key(1)));

        counters.take(&make_key(1));
        assert!(counters.remove_if_zero(&make_key(1)));
        assert!(counters.is_empty());
    }

    #[test]
    fn test_restore() {
        let counters = AuditCounters::new();
        counters.add(make_key(1), 10);
        let taken = counters.take(&make_key(1)).unwrap();
        counters.add(make_key(1), 3);
        counters.restore(make_key(1), taken);
        assert_eq!(counters.get(&make_key(1)), Some(13));
    }

    #[test]
    fn test_concurrent_adds() {
        let counters = Arc::new(AuditCounters::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = Arc::clone(&counters);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        counters.add(make_key(i % 4), 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let total: u64 = (0..4).map(|i| counters.get(&make_key(i)).unwrap()).sum();
        assert_eq!(total, 8000);
    }
}
