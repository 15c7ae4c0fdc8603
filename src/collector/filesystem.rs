//! Filesystem statistics collector: enumerate → filter → fan out stat calls →
//! fan in records → emit gauges.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus::{GaugeVec, Registry};
use serde::Serialize;

use crate::collector::filter::{FilterVerdict, MountFilters};
use crate::collector::pool::{Admission, StatWorkerPool};
use crate::collector::registry::StuckMountRegistry;
use crate::collector::watchdog::{MOUNT_TIMEOUT_CAUSE, StatOutcome, StatWatchdog};
use crate::core::config::CollectorConfig;
use crate::core::errors::Result;
use crate::exporter::{Collector, register_gauge_vec};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, millis};
use crate::platform::pal::{MountLabel, Platform, RawStatFs};

// ──────────────────── metric families ────────────────────

const LABELS: &[&str] = &["device", "mountpoint", "fstype"];
const MOUNT_INFO_LABELS: &[&str] = &["device", "major", "minor", "mountpoint"];

/// The `node_filesystem_*` families, registered once per scrape.
struct FilesystemGauges {
    size: GaugeVec,
    free: GaugeVec,
    avail: GaugeVec,
    files: GaugeVec,
    files_free: GaugeVec,
    readonly: GaugeVec,
    device_error: GaugeVec,
    mount_info: GaugeVec,
}

impl FilesystemGauges {
    fn register(registry: &Registry) -> Result<Self> {
        Ok(Self {
            size: register_gauge_vec(
                registry,
                "node_filesystem_size_bytes",
                "Filesystem size in bytes.",
                LABELS,
            )?,
            free: register_gauge_vec(
                registry,
                "node_filesystem_free_bytes",
                "Filesystem free space in bytes.",
                LABELS,
            )?,
            avail: register_gauge_vec(
                registry,
                "node_filesystem_avail_bytes",
                "Filesystem space available to non-root users in bytes.",
                LABELS,
            )?,
            files: register_gauge_vec(
                registry,
                "node_filesystem_files",
                "Filesystem total file nodes.",
                LABELS,
            )?,
            files_free: register_gauge_vec(
                registry,
                "node_filesystem_files_free",
                "Filesystem total free file nodes.",
                LABELS,
            )?,
            readonly: register_gauge_vec(
                registry,
                "node_filesystem_readonly",
                "Filesystem read-only status.",
                LABELS,
            )?,
            device_error: register_gauge_vec(
                registry,
                "node_filesystem_device_error",
                "Whether an error occurred while getting statistics for the given device.",
                LABELS,
            )?,
            mount_info: register_gauge_vec(
                registry,
                "node_filesystem_mount_info",
                "Filesystem mount information.",
                MOUNT_INFO_LABELS,
            )?,
        })
    }

    fn observe(&self, record: &FilesystemStats) -> Result<()> {
        let labels = &record.labels;
        let mount_point = labels.mount_point_label();
        let values = [
            labels.device.as_str(),
            mount_point.as_str(),
            labels.fs_type.as_str(),
        ];

        self.mount_info
            .get_metric_with_label_values(&[
                labels.device.as_str(),
                labels.major.as_str(),
                labels.minor.as_str(),
                mount_point.as_str(),
            ])?
            .set(1.0);
        self.device_error
            .get_metric_with_label_values(&values)?
            .set(record.device_error);
        self.readonly
            .get_metric_with_label_values(&values)?
            .set(record.ro);
        if record.is_device_error() {
            return Ok(());
        }
        for (family, value) in [
            (&self.size, record.size),
            (&self.free, record.free),
            (&self.avail, record.avail),
            (&self.files, record.files),
            (&self.files_free, record.files_free),
        ] {
            family.get_metric_with_label_values(&values)?.set(value);
        }
        Ok(())
    }
}

// ──────────────────── records ────────────────────

/// One mount's statistics for one collection cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilesystemStats {
    /// Options are always stripped.
    pub labels: MountLabel,
    pub size: f64,
    pub free: f64,
    pub avail: f64,
    pub files: f64,
    pub files_free: f64,
    pub ro: f64,
    pub device_error: f64,
    /// Why `device_error` is set. Logged, never exported as a label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl FilesystemStats {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_raw(label: MountLabel, raw: &RawStatFs) -> Self {
        let ro = bool_gauge(label.is_read_only());
        Self {
            labels: label.without_options(),
            size: raw.size_bytes(),
            free: raw.free_bytes(),
            avail: raw.available_bytes(),
            files: raw.files as f64,
            files_free: raw.files_free as f64,
            ro,
            device_error: 0.0,
            cause: None,
        }
    }

    #[must_use]
    pub fn device_error(label: MountLabel, cause: impl Into<String>) -> Self {
        let ro = bool_gauge(label.is_read_only());
        Self {
            labels: label.without_options(),
            size: 0.0,
            free: 0.0,
            avail: 0.0,
            files: 0.0,
            files_free: 0.0,
            ro,
            device_error: 1.0,
            cause: Some(cause.into()),
        }
    }

    /// Synthetic record for a mount whose stat call timed out.
    #[must_use]
    pub fn stuck(label: MountLabel) -> Self {
        Self::device_error(label, MOUNT_TIMEOUT_CAUSE)
    }

    /// The same outcome under another label for the same mount point.
    #[must_use]
    pub fn relabel(&self, label: MountLabel) -> Self {
        Self {
            ro: bool_gauge(label.is_read_only()),
            labels: label.without_options(),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn is_device_error(&self) -> bool {
        self.device_error > 0.0
    }

    #[must_use]
    pub fn mount_point(&self) -> &std::path::Path {
        &self.labels.mount_point
    }
}

const fn bool_gauge(flag: bool) -> f64 {
    if flag { 1.0 } else { 0.0 }
}

/// Split mounts into the first label per mount point and the repeats
/// (over-mounts, bind mounts onto the same path). Only the first is stat'ed.
fn split_repeated_mount_points(mounts: Vec<MountLabel>) -> (Vec<MountLabel>, Vec<MountLabel>) {
    let mut seen = HashSet::with_capacity(mounts.len());
    mounts
        .into_iter()
        .partition(|mount| seen.insert(mount.mount_point.clone()))
}

// ──────────────────── collector ────────────────────

pub struct FilesystemStatsCollector {
    platform: Arc<dyn Platform>,
    registry: Arc<StuckMountRegistry>,
    filters: MountFilters,
    pool: StatWorkerPool,
    watchdog: StatWatchdog,
    logger: Option<ActivityLoggerHandle>,
}

impl FilesystemStatsCollector {
    /// Build from collector config. The registry is injected so that callers
    /// decide whether stuck state is shared (daemon reloads) or isolated (tests).
    pub fn new(
        platform: Arc<dyn Platform>,
        registry: Arc<StuckMountRegistry>,
        config: &CollectorConfig,
    ) -> Result<Self> {
        let filters = MountFilters::from_config(config)?;
        let watchdog = StatWatchdog::new(
            Arc::clone(&platform),
            Arc::clone(&registry),
            config.mount_timeout(),
        );
        Ok(Self {
            platform,
            registry,
            filters,
            pool: StatWorkerPool::new(config.effective_workers()),
            watchdog,
            logger: None,
        })
    }

    #[must_use]
    pub fn with_logger(mut self, logger: ActivityLoggerHandle) -> Self {
        self.watchdog = self.watchdog.with_logger(Some(logger.clone()));
        self.logger = Some(logger);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<StuckMountRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn mount_timeout(&self) -> Duration {
        self.watchdog.timeout()
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.pool.workers()
    }

    /// Every enumerated mount with the filter verdict it would get.
    pub fn mounts_with_verdicts(&self) -> Result<Vec<(MountLabel, FilterVerdict)>> {
        Ok(self
            .platform
            .mount_points()?
            .into_iter()
            .map(|mount| {
                let verdict = self.filters.verdict(&mount);
                (mount, verdict)
            })
            .collect())
    }

    /// One collection cycle. Only a failure to enumerate mounts is an error;
    /// each filtered-in mount yields exactly one record.
    pub fn get_stats(&self) -> Result<Vec<FilesystemStats>> {
        let started = Instant::now();
        let mounts = self.platform.mount_points()?;

        let mut accepted = Vec::with_capacity(mounts.len());
        for mount in mounts {
            match self.filters.verdict(&mount) {
                FilterVerdict::Accepted => accepted.push(mount),
                verdict => self.log(ActivityEvent::MountIgnored {
                    mount_point: mount.mount_point_label(),
                    fs_type: mount.fs_type,
                    reason: verdict.as_str().to_string(),
                }),
            }
        }

        let (distinct, repeated) = split_repeated_mount_points(accepted);
        let mut stats = self.pool.run(
            distinct,
            |label| self.admit(label),
            |label| self.process_stat(label),
        );
        for label in repeated {
            let shared = stats
                .iter()
                .find(|record| record.labels.mount_point == label.mount_point)
                .map(|record| record.relabel(label));
            stats.extend(shared);
        }

        self.log(ActivityEvent::ScrapeCompleted {
            records: stats.len(),
            stuck: self.registry.len(),
            duration_ms: millis(started.elapsed()),
        });
        Ok(stats)
    }

    /// Short-circuit mounts already known to be stuck.
    fn admit(&self, label: MountLabel) -> Admission<FilesystemStats> {
        if !self.registry.is_stuck(&label.mount_point) {
            return Admission::Dispatch(label);
        }
        self.log(ActivityEvent::MountSkipped {
            mount_point: label.mount_point_label(),
            device: label.device.clone(),
            fs_type: label.fs_type.clone(),
        });
        Admission::Resolved(FilesystemStats::stuck(label))
    }

    /// Worker body: one watchdog-guarded stat call, converted to a record.
    pub fn process_stat(&self, label: MountLabel) -> FilesystemStats {
        match self.watchdog.stat(&label.mount_point) {
            StatOutcome::Completed(Ok(raw)) => FilesystemStats::from_raw(label, &raw),
            StatOutcome::Completed(Err(err)) => {
                self.log(ActivityEvent::StatFailed {
                    mount_point: label.mount_point_label(),
                    device: label.device.clone(),
                    fs_type: label.fs_type.clone(),
                    error_code: err.code().to_string(),
                    error_message: err.cause(),
                });
                FilesystemStats::device_error(label, err.cause())
            }
            StatOutcome::TimedOut => {
                self.log(ActivityEvent::MountStuck {
                    mount_point: label.mount_point_label(),
                    device: label.device.clone(),
                    fs_type: label.fs_type.clone(),
                    timeout_ms: millis(self.watchdog.timeout()),
                });
                FilesystemStats::stuck(label)
            }
        }
    }

    fn log(&self, event: ActivityEvent) {
        if let Some(logger) = &self.logger {
            logger.send(event);
        }
    }
}

impl Collector for FilesystemStatsCollector {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn update(&self, registry: &Registry) -> Result<()> {
        let stats = self.get_stats()?;
        let gauges = FilesystemGauges::register(registry)?;
        let mut seen: HashSet<(String, PathBuf, String)> = HashSet::with_capacity(stats.len());

        for record in &stats {
            let labels = &record.labels;
            let key = (
                labels.device.clone(),
                labels.mount_point.clone(),
                labels.fs_type.clone(),
            );
            if seen.insert(key) {
                gauges.observe(record)?;
            }
        }
        Ok(())
    }
}
