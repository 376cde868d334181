//! Global system facts.

use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Named global scalars, mutated only via atomic read-modify-write.
///
/// The sync engine keeps its logical clock and the lookup-cache horizon
/// here. Values are never cached across call boundaries: every read goes
/// back to the shared map.
#[derive(Debug, Default)]
pub struct SystemFacts {
    values: Mutex<BTreeMap<String, u64>>,
}

impl SystemFacts {
    /// Creates an empty fact store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the fact's value, if it has ever been set.
    pub fn get(&self, key: &str) -> Option<u64> {
        self.values.lock().get(key).copied()
    }

    /// Sets the fact's value.
    pub fn set(&self, key: &str, value: u64) {
        self.values.lock().insert(key.to_owned(), value);
    }

    /// Removes the fact entirely.
    pub fn clear(&self, key: &str) {
        self.values.lock().remove(key);
    }

    /// Atomically adds `by` to the fact (treating an unset fact as 0) and
    /// returns the post-increment value.
    ///
    /// This is the single mutation point for the sync engine's logical
    /// clock: two concurrent callers can never observe the same
    /// post-increment value.
    pub fn increment(&self, key: &str, by: u64) -> u64 {
        let mut values = self.values.lock();
        let entry = values.entry(key.to_owned()).or_insert(0);
        *entry += by;
        *entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn unset_fact_is_none() {
        let facts = SystemFacts::new();
        assert_eq!(facts.get("missing"), None);
    }

    #[test]
    fn set_and_get() {
        let facts = SystemFacts::new();
        facts.set("horizon", 12);
        assert_eq!(facts.get("horizon"), Some(12));
        facts.clear("horizon");
        assert_eq!(facts.get("horizon"), None);
    }

    #[test]
    fn increment_from_unset() {
        let facts = SystemFacts::new();
        assert_eq!(facts.increment("tick", 2), 2);
        assert_eq!(facts.increment("tick", 2), 4);
        assert_eq!(facts.get("tick"), Some(4));
    }

    #[test]
    fn concurrent_increments_are_distinct() {
        let facts = Arc::new(SystemFacts::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let facts = Arc::clone(&facts);
            handles.push(std::thread::spawn(move || {
                (0..100).map(|_| facts.increment("tick", 2)).collect::<Vec<_>>()
            }));
        }

        let mut seen = std::collections::BTreeSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                // Every post-increment value is unique and even.
                assert_eq!(value % 2, 0);
                assert!(seen.insert(value));
            }
        }
        assert_eq!(seen.len(), 800);
        assert_eq!(facts.get("tick"), Some(1600));
    }
}
