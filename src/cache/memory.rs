//! Memory tier: bounded map with insertion-order eviction.
//!
//! When full, the entry inserted (or last rewritten) longest ago is dropped.
//! Read hits do not reorder entries, so this only approximates LRU.

use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
struct Slot {
    value: String,
    seq: u64,
}

/// Fixed-capacity in-memory tier.
#[derive(Debug)]
pub struct MemoryTier {
    capacity: usize,
    entries: HashMap<String, Slot>,
    /// Insertion sequence -> key, oldest first.
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|slot| slot.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or overwrite `key`. Returns the key evicted to make room, if any.
    pub fn insert(&mut self, key: String, value: String) -> Option<String> {
        if self.capacity == 0 {
            return None;
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(slot) = self.entries.get_mut(&key) {
            self.order.remove(&slot.seq);
            slot.value = value;
            slot.seq = seq;
            self.order.insert(seq, key);
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        self.order.insert(seq, key.clone());
        self.entries.insert(key, Slot { value, seq });
        evicted
    }

    /// Insert `key` only if it is not already present. Returns whether it was inserted.
    pub fn insert_if_absent(&mut self, key: &str, value: &str) -> bool {
        if self.capacity == 0 || self.entries.contains_key(key) {
            return false;
        }
        self.insert(key.to_string(), value.to_string());
        true
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(slot) => {
                self.order.remove(&slot.seq);
                true
            }
            None => false,
        }
    }

    /// Remove every key starting with `prefix`. Returns how many were removed.
    pub fn remove_prefix(&mut self, prefix: &str) -> usize {
        let doomed: Vec<String> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_inserted() {
        let mut tier = MemoryTier::new(2);
        assert_eq!(tier.insert("a".into(), "1".into()), None);
        assert_eq!(tier.insert("b".into(), "2".into()), None);
        assert_eq!(tier.insert("c".into(), "3".into()), Some("a".to_string()));
        assert_eq!(tier.len(), 2);
        assert!(tier.contains("b"));
        assert!(tier.contains("c"));
    }

    #[test]
    fn test_overwrite_refreshes_position() {
        let mut tier = MemoryTier::new(2);
        tier.insert("a".into(), "1".into());
        tier.insert("b".into(), "2".into());
        tier.insert("a".into(), "1b".into());
        assert_eq!(tier.insert("c".into(), "3".into()), Some("b".to_string()));
        assert_eq!(tier.get("a").as_deref(), Some("1b"));
    }

    #[test]
    fn test_never_evicts_newest() {
        let mut tier = MemoryTier::new(3);
        for i in 0..50 {
            let key = format!("k{i}");
            let evicted = tier.insert(key.clone(), i.to_string());
            assert_ne!(evicted.as_deref(), Some(key.as_str()));
            assert!(tier.contains(&key));
            assert!(tier.len() <= 3);
        }
    }

    #[test]
    fn test_remove_prefix() {
        let mut tier = MemoryTier::new(10);
        tier.insert("7_page_0".into(), "x".into());
        tier.insert("7_page_1".into(), "y".into());
        tier.insert("70_page_0".into(), "z".into());
        assert_eq!(tier.remove_prefix("7_page_"), 2);
        assert_eq!(tier.len(), 1);
        assert!(tier.contains("70_page_0"));
    }

    #[test]
    fn test_insert_if_absent_keeps_existing() {
        let mut tier = MemoryTier::new(2);
        tier.insert("k".into(), "new".into());
        assert!(!tier.insert_if_absent("k", "old"));
        assert_eq!(tier.get("k").as_deref(), Some("new"));

        assert!(tier.insert_if_absent("j", "1"));
        assert_eq!(tier.get("j").as_deref(), Some("1"));
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let mut tier = MemoryTier::new(0);
        tier.insert("a".into(), "1".into());
        assert!(tier.is_empty());
    }
}
