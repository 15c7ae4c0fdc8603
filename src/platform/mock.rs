//! Scripted platform for tests and dry runs: fixed mount table, per-path stat
//! behaviour (ready, failing, hung until released, slow, panicking) and call
//! counters.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::core::errors::{MgError, Result};
use crate::platform::pal::{MountEnumerator, MountLabel, RawStatFs, StatFs};

/// How a mock stat call behaves for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockStat {
    Ready(RawStatFs),
    Fail(String),
    /// Block until [`MockPlatform::release`] is called, then return the counters.
    Hang(RawStatFs),
    Delay(Duration, RawStatFs),
    Panic,
    /// Sleep, then panic.
    PanicAfter(Duration),
}

#[derive(Debug, Clone)]
enum Behaviour {
    Ready(RawStatFs),
    Fail(String),
    Hang { gate: Receiver<()>, raw: RawStatFs },
    Delay(Duration, RawStatFs),
    Panic,
    PanicAfter(Duration),
}

#[derive(Debug, Default)]
pub struct MockPlatform {
    mounts: Vec<MountLabel>,
    enumeration_error: Mutex<Option<String>>,
    behaviours: Mutex<HashMap<PathBuf, Behaviour>>,
    gates: Mutex<HashMap<PathBuf, Sender<()>>>,
    calls: Mutex<HashMap<PathBuf, usize>>,
}

impl MockPlatform {
    #[must_use]
    pub fn new(mounts: Vec<MountLabel>) -> Self {
        Self {
            mounts,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_stat(self, mount_point: impl Into<PathBuf>, stat: MockStat) -> Self {
        self.set_stat(mount_point, stat);
        self
    }

    pub fn set_stat(&self, mount_point: impl Into<PathBuf>, stat: MockStat) {
        let mount_point = mount_point.into();
        let behaviour = match stat {
            MockStat::Ready(raw) => Behaviour::Ready(raw),
            MockStat::Fail(details) => Behaviour::Fail(details),
            MockStat::Delay(delay, raw) => Behaviour::Delay(delay, raw),
            MockStat::Panic => Behaviour::Panic,
            MockStat::PanicAfter(delay) => Behaviour::PanicAfter(delay),
            MockStat::Hang(raw) => {
                let (tx, gate) = bounded::<()>(0);
                self.gates.lock().insert(mount_point.clone(), tx);
                Behaviour::Hang { gate, raw }
            }
        };
        self.behaviours.lock().insert(mount_point, behaviour);
    }

    /// Unblock every call hung on `mount_point`; later calls return at once.
    pub fn release(&self, mount_point: &Path) {
        let mut behaviours = self.behaviours.lock();
        if let Some(Behaviour::Hang { raw, .. }) = behaviours.get(mount_point) {
            let raw = *raw;
            behaviours.insert(mount_point.to_path_buf(), Behaviour::Ready(raw));
        }
        drop(behaviours);
        self.gates.lock().remove(mount_point);
    }

    pub fn fail_enumeration(&self, details: impl Into<String>) {
        *self.enumeration_error.lock() = Some(details.into());
    }

    /// Stat calls issued for `mount_point`, including ones still blocked.
    #[must_use]
    pub fn calls(&self, mount_point: &Path) -> usize {
        self.calls.lock().get(mount_point).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

impl MountEnumerator for MockPlatform {
    fn mount_points(&self) -> Result<Vec<MountLabel>> {
        if let Some(details) = self.enumeration_error.lock().clone() {
            return Err(MgError::MountParse { details });
        }
        Ok(self.mounts.clone())
    }
}

impl StatFs for MockPlatform {
    fn statfs(&self, mount_point: &Path) -> Result<RawStatFs> {
        *self
            .calls
            .lock()
            .entry(mount_point.to_path_buf())
            .or_insert(0) += 1;

        // Clone out so no lock is held while blocking.
        let behaviour = self.behaviours.lock().get(mount_point).cloned();
        match behaviour {
            Some(Behaviour::Ready(raw)) => Ok(raw),
            Some(Behaviour::Fail(details)) => Err(MgError::FsStats {
                path: mount_point.to_path_buf(),
                details,
            }),
            Some(Behaviour::Hang { gate, raw }) => {
                // Nothing is ever sent; recv returns once the sender is dropped.
                let _ = gate.recv();
                Ok(raw)
            }
            Some(Behaviour::Delay(delay, raw)) => {
                thread::sleep(delay);
                Ok(raw)
            }
            Some(Behaviour::Panic) => panic!("mock statfs panic on {}", mount_point.display()),
            Some(Behaviour::PanicAfter(delay)) => {
                thread::sleep(delay);
                panic!("mock statfs late panic on {}", mount_point.display())
            }
            None => Err(MgError::FsStats {
                path: mount_point.to_path_buf(),
                details: "ENOENT: No such file or directory".to_string(),
            }),
        }
    }
}
