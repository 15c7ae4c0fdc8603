//! PAL traits and the Linux implementation (mountinfo enumeration + `statvfs`).

#![allow(missing_docs)]

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::config::PathsConfig;
use crate::core::errors::{MgError, Result};
use crate::platform::mountinfo::parse_mountinfo;

/// One row of the mount table, as handed to the collector.
///
/// Option strings are only kept long enough to detect read-only mounts; see
/// [`MountLabel::without_options`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MountLabel {
    pub device: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub mount_options: String,
    pub super_options: String,
    pub major: String,
    pub minor: String,
}

impl MountLabel {
    #[must_use]
    pub fn new(
        device: impl Into<String>,
        mount_point: impl Into<PathBuf>,
        fs_type: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            mount_point: mount_point.into(),
            fs_type: fs_type.into(),
            mount_options: String::new(),
            super_options: String::new(),
            major: "0".to_string(),
            minor: "0".to_string(),
        }
    }

    #[must_use]
    pub fn with_options(
        mut self,
        mount_options: impl Into<String>,
        super_options: impl Into<String>,
    ) -> Self {
        self.mount_options = mount_options.into();
        self.super_options = super_options.into();
        self
    }

    #[must_use]
    pub fn with_device_number(mut self, major: u32, minor: u32) -> Self {
        self.major = major.to_string();
        self.minor = minor.to_string();
        self
    }

    /// `ro` in either the per-mount or the superblock option list.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        [&self.mount_options, &self.super_options]
            .iter()
            .any(|options| options.split(',').any(|option| option == "ro"))
    }

    /// Drop option text so the same device mounted twice with different
    /// options collapses to one label set.
    #[must_use]
    pub fn without_options(mut self) -> Self {
        self.mount_options.clear();
        self.super_options.clear();
        self
    }

    /// Mount point as a label value.
    #[must_use]
    pub fn mount_point_label(&self) -> String {
        self.mount_point.to_string_lossy().into_owned()
    }
}

/// Raw counters returned by a stat call on a mount point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RawStatFs {
    pub block_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
}

impl RawStatFs {
    #[must_use]
    pub fn size_bytes(&self) -> f64 {
        scaled_bytes(self.blocks, self.block_size)
    }

    #[must_use]
    pub fn free_bytes(&self) -> f64 {
        scaled_bytes(self.blocks_free, self.block_size)
    }

    #[must_use]
    pub fn available_bytes(&self) -> f64 {
        scaled_bytes(self.blocks_available, self.block_size)
    }
}

/// `count * block_size` as f64, rounded once.
///
/// The product is formed in 128-bit integers so it never overflows; only the
/// final conversion rounds, to the nearest representable f64.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn scaled_bytes(count: u64, block_size: u64) -> f64 {
    (u128::from(count) * u128::from(block_size)) as f64
}

/// Produces the current mount table.
pub trait MountEnumerator: Send + Sync {
    fn mount_points(&self) -> Result<Vec<MountLabel>>;
}

/// Blocking filesystem stat call. Implementations may never return for a hung
/// network mount; callers must not hold locks across it.
pub trait StatFs: Send + Sync {
    fn statfs(&self, mount_point: &Path) -> Result<RawStatFs>;
}

/// OS abstraction used by the collector.
pub trait Platform: MountEnumerator + StatFs {}

impl<T> Platform for T where T: MountEnumerator + StatFs {}

/// Host root prefix used when running inside a container with the host
/// filesystem mounted at e.g. `/host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootFs {
    prefix: PathBuf,
}

impl Default for RootFs {
    fn default() -> Self {
        Self::new("/")
    }
}

impl RootFs {
    #[must_use]
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn is_host_root(&self) -> bool {
        self.prefix == Path::new("/")
    }

    /// Path to hand to the stat call for a host mount point.
    #[must_use]
    pub fn file_path(&self, mount_point: &Path) -> PathBuf {
        if self.is_host_root() {
            return mount_point.to_path_buf();
        }
        self.prefix
            .join(mount_point.strip_prefix("/").unwrap_or(mount_point))
    }

    /// Host view of a mount point; paths outside the prefix are returned as-is.
    #[must_use]
    pub fn strip_prefix(&self, mount_point: &Path) -> PathBuf {
        if self.is_host_root() {
            return mount_point.to_path_buf();
        }
        match mount_point.strip_prefix(&self.prefix) {
            Ok(rest) => Path::new("/").join(rest),
            Err(_) => mount_point.to_path_buf(),
        }
    }
}

/// Linux platform implementation using `/proc/<pid>/mountinfo` + `statvfs`.
#[derive(Debug, Clone)]
pub struct LinuxPlatform {
    proc_path: PathBuf,
    rootfs: RootFs,
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        let defaults = PathsConfig::default();
        Self::new(defaults.proc_path, RootFs::new(defaults.rootfs_path))
    }
}

impl LinuxPlatform {
    #[must_use]
    pub fn new(proc_path: impl Into<PathBuf>, rootfs: RootFs) -> Self {
        Self {
            proc_path: proc_path.into(),
            rootfs,
        }
    }

    #[must_use]
    pub fn from_paths(paths: &PathsConfig) -> Self {
        Self::new(&paths.proc_path, RootFs::new(&paths.rootfs_path))
    }

    /// Prefer init's view of the mount table; fall back to our own when pid 1
    /// is not visible (unprivileged containers, hidepid).
    fn read_mountinfo(&self) -> Result<String> {
        let primary = self.proc_path.join("1/mountinfo");
        match fs::read_to_string(&primary) {
            Ok(raw) => Ok(raw),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let fallback = self.proc_path.join("self/mountinfo");
                fs::read_to_string(&fallback).map_err(|source| MgError::io(&fallback, source))
            }
            Err(source) => Err(MgError::io(&primary, source)),
        }
    }
}

impl MountEnumerator for LinuxPlatform {
    fn mount_points(&self) -> Result<Vec<MountLabel>> {
        let raw = self.read_mountinfo()?;
        let mut mounts = parse_mountinfo(&raw)?;
        for mount in &mut mounts {
            mount.mount_point = self.rootfs.strip_prefix(&mount.mount_point);
        }
        Ok(mounts)
    }
}

impl StatFs for LinuxPlatform {
    #[allow(clippy::useless_conversion)]
    fn statfs(&self, mount_point: &Path) -> Result<RawStatFs> {
        let target = self.rootfs.file_path(mount_point);
        let stat = nix::sys::statvfs::statvfs(&target).map_err(|error| MgError::FsStats {
            path: target.clone(),
            details: error.to_string(),
        })?;
        Ok(RawStatFs {
            block_size: u64::from(stat.fragment_size()),
            blocks: u64::from(stat.blocks()),
            blocks_free: u64::from(stat.blocks_free()),
            blocks_available: u64::from(stat.blocks_available()),
            files: u64::from(stat.files()),
            files_free: u64::from(stat.files_free()),
        })
    }
}

/// Detect active platform implementation.
pub fn detect_platform(paths: &PathsConfig) -> Result<Arc<dyn Platform>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxPlatform::from_paths(paths)))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = paths;
        Err(MgError::UnsupportedPlatform {
            details: "only Linux is currently implemented".to_string(),
        })
    }
}
