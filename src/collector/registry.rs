//! Process-wide set of mount points whose stat call is believed hung.
//!
//! Every operation is a single short critical section; nothing here ever runs
//! a syscall while holding the lock. The compound operations
//! ([`StuckMountRegistry::mark_unless`], [`StuckMountRegistry::clear_after`])
//! are the two halves of the watchdog race and must stay atomic.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Snapshot of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StuckMount {
    pub mount_point: PathBuf,
    pub stuck_for: Duration,
}

#[derive(Debug, Default)]
pub struct StuckMountRegistry {
    // Value is when the entry was marked; reporting only.
    entries: Mutex<HashMap<PathBuf, Instant>>,
}

static GLOBAL: OnceLock<Arc<StuckMountRegistry>> = OnceLock::new();

impl StuckMountRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared instance for binaries. Library users and tests should inject
    /// their own registry instead.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    #[must_use]
    pub fn is_stuck(&self, mount_point: &Path) -> bool {
        self.entries.lock().contains_key(mount_point)
    }

    /// Returns `true` if the path was not already marked. A repeated mark keeps
    /// the original timestamp.
    pub fn mark_stuck(&self, mount_point: &Path) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(mount_point) {
            return false;
        }
        entries.insert(mount_point.to_path_buf(), Instant::now());
        true
    }

    /// Remove the path; returns how long it had been stuck.
    pub fn clear_stuck(&self, mount_point: &Path) -> Option<Duration> {
        self.entries
            .lock()
            .remove(mount_point)
            .map(|since| since.elapsed())
    }

    /// Mark the path stuck unless `resolved()` reports that the call already
    /// finished. `resolved` is evaluated under the lock. Returns whether the
    /// path was marked.
    pub fn mark_unless(&self, mount_point: &Path, resolved: impl FnOnce() -> bool) -> bool {
        let mut entries = self.entries.lock();
        if resolved() {
            return false;
        }
        entries
            .entry(mount_point.to_path_buf())
            .or_insert_with(Instant::now);
        true
    }

    /// Run `publish` and clear the path in one critical section, so a
    /// concurrent [`Self::mark_unless`] sees either neither or both.
    pub fn clear_after<R>(
        &self,
        mount_point: &Path,
        publish: impl FnOnce() -> R,
    ) -> (R, Option<Duration>) {
        let mut entries = self.entries.lock();
        let published = publish();
        let cleared = entries.remove(mount_point).map(|since| since.elapsed());
        (published, cleared)
    }

    /// Current entries sorted by mount point.
    #[must_use]
    pub fn stuck_mounts(&self) -> Vec<StuckMount> {
        let mut snapshot: Vec<StuckMount> = self
            .entries
            .lock()
            .iter()
            .map(|(mount_point, since)| StuckMount {
                mount_point: mount_point.clone(),
                stuck_for: since.elapsed(),
            })
            .collect();
        snapshot.sort_by(|left, right| left.mount_point.cmp(&right.mount_point));
        snapshot
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn mark_check_clear() {
        let registry = StuckMountRegistry::new();
        let nfs = Path::new("/mnt/nfs");
        assert!(!registry.is_stuck(nfs));

        assert!(registry.mark_stuck(nfs));
        assert!(!registry.mark_stuck(nfs), "second mark is a no-op");
        assert!(registry.is_stuck(nfs));
        assert_eq!(registry.len(), 1);

        assert!(registry.clear_stuck(nfs).is_some());
        assert!(registry.clear_stuck(nfs).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn mark_unless_respects_resolution() {
        let registry = StuckMountRegistry::new();
        let nfs = Path::new("/mnt/nfs");

        assert!(!registry.mark_unless(nfs, || true));
        assert!(!registry.is_stuck(nfs));

        assert!(registry.mark_unless(nfs, || false));
        assert!(registry.is_stuck(nfs));
    }

    #[test]
    fn clear_after_publishes_then_clears() {
        let registry = StuckMountRegistry::new();
        let nfs = Path::new("/mnt/nfs");
        registry.mark_stuck(nfs);

        let (value, cleared) = registry.clear_after(nfs, || 42);
        assert_eq!(value, 42);
        assert!(cleared.is_some());
        assert!(!registry.is_stuck(nfs));

        let (_, cleared) = registry.clear_after(nfs, || ());
        assert!(cleared.is_none());
    }

    #[test]
    fn snapshot_is_sorted_and_ages() {
        let registry = StuckMountRegistry::new();
        registry.mark_stuck(Path::new("/mnt/z"));
        registry.mark_stuck(Path::new("/mnt/a"));
        thread::sleep(Duration::from_millis(5));

        let snapshot = registry.stuck_mounts();
        let paths: Vec<_> = snapshot.iter().map(|s| s.mount_point.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("/mnt/a"), PathBuf::from("/mnt/z")]);
        assert!(snapshot.iter().all(|s| s.stuck_for >= Duration::from_millis(5)));
    }

    #[test]
    fn independent_instances_do_not_share_state() {
        let a = StuckMountRegistry::new();
        let b = StuckMountRegistry::new();
        a.mark_stuck(Path::new("/mnt/nfs"));
        assert!(!b.is_stuck(Path::new("/mnt/nfs")));
    }

    #[test]
    fn global_is_a_single_instance() {
        let first = StuckMountRegistry::global();
        let second = StuckMountRegistry::global();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn concurrent_marks_and_clears_stay_consistent() {
        let registry = Arc::new(StuckMountRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let path = PathBuf::from(format!("/mnt/{}", i % 4));
                    for _ in 0..200 {
                        registry.mark_stuck(&path);
                        let _ = registry.is_stuck(&path);
                        registry.clear_stuck(&path);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert!(registry.is_empty());
    }
}
