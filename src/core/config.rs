//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{MgError, Result};

/// Mount points that never carry useful capacity data.
pub const DEFAULT_MOUNT_POINTS_EXCLUDE: &str = "^/(dev|proc|run/credentials/.+|sys|var/lib/docker/.+|var/lib/containers/storage/.+)($|/)";

/// Pseudo and read-only image filesystems skipped by default.
pub const DEFAULT_FS_TYPES_EXCLUDE: &str = "^(autofs|binfmt_misc|bpf|cgroup2?|configfs|debugfs|devpts|devtmpfs|fusectl|hugetlbfs|iso9660|mqueue|nsfs|overlay|proc|procfs|pstore|rpc_pipefs|securityfs|selinuxfs|squashfs|erofs|sysfs|tracefs)$";

/// Full mountguard configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub collector: CollectorConfig,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
    pub daemon: DaemonConfig,
}

/// Filesystem collector knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CollectorConfig {
    /// How long a single stat call may take before the mount is marked stuck.
    pub mount_timeout_ms: u64,
    /// Number of concurrent stat workers. Zero is clamped to one.
    pub stat_workers: usize,
    pub mount_points_exclude: String,
    pub mount_points_include: String,
    pub fs_types_exclude: String,
    pub fs_types_include: String,
}

/// Filesystem paths used by mountguard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    /// procfs mount point; mountinfo is read below it.
    pub proc_path: PathBuf,
    /// Prefix of the host root filesystem when running inside a container.
    pub rootfs_path: PathBuf,
    pub jsonl_log: PathBuf,
}

/// Activity log settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub jsonl_enabled: bool,
    /// Also record debug events (ignored mounts, per-scrape skips).
    pub verbose: bool,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
}

/// Watch-loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub scrape_interval_ms: u64,
    /// Textfile rewritten after every scrape; stdout when unset.
    pub output_file: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            mount_timeout_ms: 5_000,
            stat_workers: 4,
            mount_points_exclude: DEFAULT_MOUNT_POINTS_EXCLUDE.to_string(),
            mount_points_include: String::new(),
            fs_types_exclude: DEFAULT_FS_TYPES_EXCLUDE.to_string(),
            fs_types_include: String::new(),
        }
    }
}

impl CollectorConfig {
    #[must_use]
    pub fn mount_timeout(&self) -> Duration {
        Duration::from_millis(self.mount_timeout_ms)
    }

    /// Worker count with the minimum of one enforced.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.stat_workers.max(1)
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("/etc/mountguard/config.toml"),
            proc_path: PathBuf::from("/proc"),
            rootfs_path: PathBuf::from("/"),
            jsonl_log: PathBuf::from("/var/lib/mountguard/activity.jsonl"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            jsonl_enabled: true,
            verbose: false,
            max_size_bytes: 32 * 1024 * 1024,
            max_rotated_files: 5,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            scrape_interval_ms: 15_000,
            output_file: None,
        }
    }
}

impl DaemonConfig {
    #[must_use]
    pub fn scrape_interval(&self) -> Duration {
        Duration::from_millis(self.scrape_interval_ms)
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| MgError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(MgError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides()?;
        cfg.resolve_filter_defaults();
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON form so the value is stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env_overrides_from(env_var)
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // collector
        if let Some(raw) = lookup("MOUNTGUARD_MOUNT_TIMEOUT_MS") {
            self.collector.mount_timeout_ms = parse_env("MOUNTGUARD_MOUNT_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("MOUNTGUARD_STAT_WORKERS") {
            self.collector.stat_workers = parse_env("MOUNTGUARD_STAT_WORKERS", &raw)?;
        }
        for (name, slot) in [
            (
                "MOUNTGUARD_MOUNT_POINTS_EXCLUDE",
                &mut self.collector.mount_points_exclude,
            ),
            (
                "MOUNTGUARD_MOUNT_POINTS_INCLUDE",
                &mut self.collector.mount_points_include,
            ),
            (
                "MOUNTGUARD_FS_TYPES_EXCLUDE",
                &mut self.collector.fs_types_exclude,
            ),
            (
                "MOUNTGUARD_FS_TYPES_INCLUDE",
                &mut self.collector.fs_types_include,
            ),
        ] {
            if let Some(raw) = lookup(name) {
                *slot = raw;
            }
        }

        // paths
        if let Some(raw) = lookup("MOUNTGUARD_PROC_PATH") {
            self.paths.proc_path = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("MOUNTGUARD_ROOTFS_PATH") {
            self.paths.rootfs_path = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("MOUNTGUARD_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }

        // logging
        if let Some(raw) = lookup("MOUNTGUARD_JSONL_ENABLED") {
            self.logging.jsonl_enabled = parse_env("MOUNTGUARD_JSONL_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("MOUNTGUARD_LOG_VERBOSE") {
            self.logging.verbose = parse_env("MOUNTGUARD_LOG_VERBOSE", &raw)?;
        }

        // daemon
        if let Some(raw) = lookup("MOUNTGUARD_SCRAPE_INTERVAL_MS") {
            self.daemon.scrape_interval_ms = parse_env("MOUNTGUARD_SCRAPE_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = lookup("MOUNTGUARD_OUTPUT_FILE") {
            self.daemon.output_file = Some(PathBuf::from(raw));
        }
        Ok(())
    }

    /// An include pattern replaces the built-in exclude default for the same
    /// target; only an explicitly customised exclude conflicts with it.
    fn resolve_filter_defaults(&mut self) {
        let collector = &mut self.collector;
        if !collector.mount_points_include.is_empty()
            && collector.mount_points_exclude == DEFAULT_MOUNT_POINTS_EXCLUDE
        {
            collector.mount_points_exclude.clear();
        }
        if !collector.fs_types_include.is_empty()
            && collector.fs_types_exclude == DEFAULT_FS_TYPES_EXCLUDE
        {
            collector.fs_types_exclude.clear();
        }
    }

    fn normalize_paths(&mut self) {
        for path in [
            &mut self.paths.proc_path,
            &mut self.paths.rootfs_path,
            &mut self.paths.jsonl_log,
        ] {
            let s = path.to_string_lossy();
            if s.len() > 1
                && let Some(stripped) = s.strip_suffix('/')
            {
                *path = PathBuf::from(stripped);
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.collector.mount_timeout_ms == 0 {
            return Err(MgError::InvalidConfig {
                details: "collector.mount_timeout_ms must be > 0".to_string(),
            });
        }
        if self.daemon.scrape_interval_ms == 0 {
            return Err(MgError::InvalidConfig {
                details: "daemon.scrape_interval_ms must be > 0".to_string(),
            });
        }

        let collector = &self.collector;
        for (target, exclude, include) in [
            (
                "mount_points",
                &collector.mount_points_exclude,
                &collector.mount_points_include,
            ),
            (
                "fs_types",
                &collector.fs_types_exclude,
                &collector.fs_types_include,
            ),
        ] {
            if !exclude.is_empty() && !include.is_empty() {
                return Err(MgError::InvalidConfig {
                    details: format!(
                        "collector.{target}_exclude and collector.{target}_include are mutually exclusive"
                    ),
                });
            }
            for (kind, pattern) in [("exclude", exclude), ("include", include)] {
                if pattern.is_empty() {
                    continue;
                }
                Regex::new(pattern).map_err(|error| MgError::InvalidConfig {
                    details: format!("collector.{target}_{kind} is not a valid regex: {error}"),
                })?;
            }
        }

        if self.logging.max_size_bytes < 4096 {
            return Err(MgError::InvalidConfig {
                details: format!(
                    "logging.max_size_bytes must be >= 4096, got {}",
                    self.logging.max_size_bytes
                ),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| MgError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}
