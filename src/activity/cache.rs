//! Bounded recency cache.
//!
//! Keeps the most recent N items sorted descending by time. Merging is
//! insert-then-reorder-then-truncate: entries sharing an identity key are
//! overwritten in place (re-delivered activity is idempotent), new entries
//! are appended, then a stable sort and a truncate restore the invariant.
//! Sort stability preserves insertion order among equal timestamps.

use std::hash::Hash;

use chrono::{DateTime, Utc};

/// An item a [`RecencyCache`] can hold: an identity key for overwrite
/// semantics plus an ordering timestamp.
pub trait Recent {
    type Key: PartialEq + Eq + Hash;

    fn key(&self) -> Self::Key;
    fn time(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone)]
pub struct RecencyCache<T> {
    items: Vec<T>,
    cap: usize,
}

impl<T: Recent> RecencyCache<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            items: Vec::new(),
            cap,
        }
    }

    /// Merge a batch, overwriting entries with matching identity keys,
    /// then re-sort descending by time and truncate to capacity.
    pub fn merge(&mut self, batch: Vec<T>) {
        for item in batch {
            let key = item.key();
            match self.items.iter().position(|e| e.key() == key) {
                Some(i) => self.items[i] = item,
                None => self.items.push(item),
            }
        }
        self.items.sort_by(|a, b| b.time().cmp(&a.time()));
        self.items.truncate(self.cap);
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: u64,
        tag: &'static str,
        time: DateTime<Utc>,
    }

    impl Recent for Item {
        type Key = u64;

        fn key(&self) -> u64 {
            self.id
        }

        fn time(&self) -> DateTime<Utc> {
            self.time
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn item(id: u64, tag: &'static str, secs: i64) -> Item {
        Item {
            id,
            tag,
            time: at(secs),
        }
    }

    #[test]
    fn test_merge_sorts_descending_by_time() {
        let mut cache = RecencyCache::new(10);
        cache.merge(vec![item(1, "a", 10), item(2, "b", 30), item(3, "c", 20)]);
        let times: Vec<i64> = cache.items().iter().map(|i| i.time.timestamp()).collect();
        assert_eq!(times, vec![30, 20, 10]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = RecencyCache::new(2);
        cache.merge(vec![item(1, "a", 10), item(2, "b", 30), item(3, "c", 20)]);
        assert_eq!(cache.len(), 2);
        let ids: Vec<u64> = cache.items().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_same_key_overwrites_in_place() {
        let mut cache = RecencyCache::new(10);
        cache.merge(vec![item(1, "old", 10)]);
        cache.merge(vec![item(1, "new", 10)]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.items()[0].tag, "new");
    }

    #[test]
    fn test_equal_timestamps_preserve_insertion_order() {
        let mut cache = RecencyCache::new(10);
        cache.merge(vec![item(1, "first", 10), item(2, "second", 10)]);
        cache.merge(vec![item(3, "third", 10)]);
        let ids: Vec<u64> = cache.items().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
