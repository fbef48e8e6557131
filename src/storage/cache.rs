//! In-process cache of the driver tags currently represented by at least one
//! pool. API admission reads it on every request instead of paying for a
//! catalog transaction.
//!
//! Copy-on-write discipline: readers clone an `Arc` snapshot and never block;
//! writers take the mutex, rebuild the set, and publish a fresh snapshot.
//! Nothing slow is ever done under the lock.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct DriverCache {
    snapshot: Mutex<Arc<BTreeSet<String>>>,
}

impl DriverCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current immutable snapshot.
    pub fn snapshot(&self) -> Arc<BTreeSet<String>> {
        self.snapshot.lock().clone()
    }

    pub fn contains(&self, driver: &str) -> bool {
        self.snapshot.lock().contains(driver)
    }

    /// Publishes a snapshot with `driver` added. Called after a pool create
    /// commits.
    pub fn insert(&self, driver: &str) {
        let mut guard = self.snapshot.lock();
        if guard.contains(driver) {
            return;
        }
        let mut next: BTreeSet<String> = (**guard).clone();
        next.insert(driver.to_string());
        *guard = Arc::new(next);
    }

    /// Publishes a snapshot with `driver` removed. Callers only do this once
    /// no pool uses the driver any more.
    pub fn remove(&self, driver: &str) {
        let mut guard = self.snapshot.lock();
        if !guard.contains(driver) {
            return;
        }
        let mut next: BTreeSet<String> = (**guard).clone();
        next.remove(driver);
        *guard = Arc::new(next);
    }

    /// Replaces the snapshot wholesale, e.g. when rebuilding from the catalog
    /// at boot or after a pool delete.
    pub fn replace(&self, drivers: impl IntoIterator<Item = String>) {
        let next: BTreeSet<String> = drivers.into_iter().collect();
        *self.snapshot.lock() = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_keep_their_snapshot_across_writes() {
        let cache = DriverCache::new();
        cache.insert("dir");

        let before = cache.snapshot();
        cache.insert("zfs");
        let after = cache.snapshot();

        assert!(before.contains("dir") && !before.contains("zfs"));
        assert!(after.contains("dir") && after.contains("zfs"));
    }

    #[test]
    fn insert_and_remove_converge() {
        let cache = DriverCache::new();
        cache.insert("dir");
        cache.insert("dir");
        assert!(cache.contains("dir"));

        cache.remove("dir");
        cache.remove("dir");
        assert!(!cache.contains("dir"));
    }

    #[test]
    fn replace_is_wholesale() {
        let cache = DriverCache::new();
        cache.insert("dir");
        cache.replace(vec!["zfs".to_string(), "lvm".to_string()]);

        let snapshot = cache.snapshot();
        assert_eq!(
            snapshot.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["lvm", "zfs"]
        );
    }
}
