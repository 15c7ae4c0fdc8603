//! Activity logger: a dedicated thread owns the `JsonlWriter`; everything else
//! sends `ActivityEvent`s through a bounded crossbeam channel with `try_send`,
//! so a slow disk can never stall a scrape.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::config::Config;
use crate::core::errors::{MgError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

// ──────────────────── channel capacity ────────────────────

const CHANNEL_CAPACITY: usize = 1024;

// ──────────────────── public event type ────────────────────

#[derive(Debug, Clone)]
pub enum ActivityEvent {
    CollectorStarted {
        version: String,
        config_hash: String,
    },
    CollectorStopped {
        reason: String,
        uptime_secs: u64,
    },
    ScrapeCompleted {
        records: usize,
        stuck: usize,
        duration_ms: u64,
    },
    /// Dropped by a mount-point or fs-type filter.
    MountIgnored {
        mount_point: String,
        fs_type: String,
        reason: String,
    },
    /// Stat call exceeded the mount timeout; the mount is now quarantined.
    MountStuck {
        mount_point: String,
        device: String,
        fs_type: String,
        timeout_ms: u64,
    },
    /// Not dispatched because it is already in the stuck registry.
    MountSkipped {
        mount_point: String,
        device: String,
        fs_type: String,
    },
    /// The hung stat call finally returned and the registry entry was cleared.
    MountRecovered {
        mount_point: String,
        stuck_for_ms: u64,
    },
    StatFailed {
        mount_point: String,
        device: String,
        fs_type: String,
        error_code: String,
        error_message: String,
    },
    ConfigReloaded {
        details: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Sentinel to request graceful shutdown of the logger thread.
    Shutdown,
}

impl ActivityEvent {
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::MountIgnored { .. } => Severity::Debug,
            Self::MountStuck { .. } | Self::StatFailed { .. } => Severity::Warning,
            Self::Error { .. } => Severity::Critical,
            _ => Severity::Info,
        }
    }
}

/// Saturating millisecond count for event payloads.
#[must_use]
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ──────────────────── public handle ────────────────────

/// Cheaply cloneable handle; `send` never blocks.
#[derive(Debug, Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    min_severity: Severity,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Queue an event. Events below the configured severity are discarded
    /// here; a full channel drops the event and bumps the dropped counter.
    pub fn send(&self, event: ActivityEvent) {
        if event.severity() < self.min_severity {
            return;
        }
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine during shutdown.
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit. Join the handle returned by
    /// [`spawn_logger`] to wait for it.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

// ──────────────────── configuration ────────────────────

#[derive(Debug, Clone)]
pub struct ActivityLoggerConfig {
    pub jsonl_config: JsonlConfig,
    pub channel_capacity: usize,
    /// Record debug events (ignored and skipped mounts).
    pub verbose: bool,
}

impl Default for ActivityLoggerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ActivityLoggerConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            jsonl_config: JsonlConfig::from_config(config),
            channel_capacity: CHANNEL_CAPACITY,
            verbose: config.logging.verbose,
        }
    }
}

// ──────────────────── spawn ────────────────────

/// Spawn the logger thread. It runs until `shutdown()` is called or every
/// handle has been dropped.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_clone = Arc::clone(&dropped);

    let handle = ActivityLoggerHandle {
        tx,
        min_severity: if config.verbose {
            Severity::Debug
        } else {
            Severity::Info
        },
        dropped_events: dropped,
    };

    let join = thread::Builder::new()
        .name("mountguard-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config.jsonl_config, &dropped_clone))
        .map_err(|e| MgError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

// ──────────────────── logger thread ────────────────────

fn logger_thread_main(
    rx: &Receiver<ActivityEvent>,
    jsonl_config: JsonlConfig,
    dropped: &AtomicU64,
) {
    let mut jsonl = JsonlWriter::open(jsonl_config);

    while let Ok(event) = rx.recv() {
        let d = dropped.swap(0, Ordering::Relaxed);
        if d > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!("{d} log events dropped due to back-pressure"));
            jsonl.write_entry(&warn);
        }

        let Some(entry) = event_to_log_entry(&event) else {
            break;
        };
        jsonl.write_entry(&entry);
    }

    jsonl.flush();
    jsonl.fsync();
}

// ──────────────────── event conversion ────────────────────

fn event_to_log_entry(event: &ActivityEvent) -> Option<LogEntry> {
    let severity = event.severity();
    let entry = match event {
        ActivityEvent::CollectorStarted {
            version,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::CollectorStart, severity);
            e.details = Some(format!("version={version} config_hash={config_hash}"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::CollectorStopped {
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::CollectorStop, severity);
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::ScrapeCompleted {
            records,
            stuck,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::ScrapeComplete, severity);
            e.records = Some(*records);
            e.stuck = Some(*stuck);
            e.duration_ms = Some(*duration_ms);
            e.ok = Some(true);
            e
        }
        ActivityEvent::MountIgnored {
            mount_point,
            fs_type,
            reason,
        } => {
            let mut e = LogEntry::new(EventType::MountIgnored, severity);
            e.mount_point = Some(mount_point.clone());
            e.fs_type = Some(fs_type.clone());
            e.details = Some(reason.clone());
            e
        }
        ActivityEvent::MountStuck {
            mount_point,
            device,
            fs_type,
            timeout_ms,
        } => {
            let mut e = LogEntry::new(EventType::MountStuck, severity);
            e.mount_point = Some(mount_point.clone());
            e.device = Some(device.clone());
            e.fs_type = Some(fs_type.clone());
            e.duration_ms = Some(*timeout_ms);
            e.ok = Some(false);
            e
        }
        ActivityEvent::MountSkipped {
            mount_point,
            device,
            fs_type,
        } => {
            let mut e = LogEntry::new(EventType::MountSkipped, severity);
            e.mount_point = Some(mount_point.clone());
            e.device = Some(device.clone());
            e.fs_type = Some(fs_type.clone());
            e
        }
        ActivityEvent::MountRecovered {
            mount_point,
            stuck_for_ms,
        } => {
            let mut e = LogEntry::new(EventType::MountRecovered, severity);
            e.mount_point = Some(mount_point.clone());
            e.duration_ms = Some(*stuck_for_ms);
            e.ok = Some(true);
            e
        }
        ActivityEvent::StatFailed {
            mount_point,
            device,
            fs_type,
            error_code,
            error_message,
        } => {
            let mut e = LogEntry::new(EventType::StatFailed, severity);
            e.mount_point = Some(mount_point.clone());
            e.device = Some(device.clone());
            e.fs_type = Some(fs_type.clone());
            e.ok = Some(false);
            e.error_code = Some(error_code.clone());
            e.error_message = Some(error_message.clone());
            e
        }
        ActivityEvent::ConfigReloaded { details } => {
            let mut e = LogEntry::new(EventType::ConfigReload, severity);
            e.details = Some(details.clone());
            e.ok = Some(true);
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, severity);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::Shutdown => return None,
    };
    Some(entry)
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn test_config(dir: &Path, verbose: bool) -> ActivityLoggerConfig {
        ActivityLoggerConfig {
            jsonl_config: JsonlConfig {
                path: dir.join("activity.jsonl"),
                fallback_path: None,
                max_size_bytes: 10 * 1024 * 1024,
                max_rotated_files: 3,
                fsync_interval_secs: 60,
            },
            channel_capacity: 64,
            verbose,
        }
    }

    fn read_events(dir: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(dir.join("activity.jsonl"))
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn spawn_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), false)).unwrap();
        handle.send(ActivityEvent::CollectorStarted {
            version: "0.3.1".to_string(),
            config_hash: "abc".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let events = read_events(dir.path());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], "collector_start");
    }

    #[test]
    fn mount_events_carry_labels() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), false)).unwrap();
        handle.send(ActivityEvent::MountStuck {
            mount_point: "/mnt/nfs".to_string(),
            device: "server:/export".to_string(),
            fs_type: "nfs4".to_string(),
            timeout_ms: 5000,
        });
        handle.send(ActivityEvent::MountRecovered {
            mount_point: "/mnt/nfs".to_string(),
            stuck_for_ms: 61_000,
        });
        handle.send(ActivityEvent::ScrapeCompleted {
            records: 10,
            stuck: 1,
            duration_ms: 5003,
        });
        handle.shutdown();
        join.join().unwrap();

        let events = read_events(dir.path());
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["event"], "mount_stuck");
        assert_eq!(events[0]["severity"], "warning");
        assert_eq!(events[0]["device"], "server:/export");
        assert_eq!(events[1]["event"], "mount_recovered");
        assert_eq!(events[1]["duration_ms"], 61_000);
        assert_eq!(events[2]["records"], 10);
        assert_eq!(events[2]["stuck"], 1);
    }

    #[test]
    fn debug_events_need_verbose() {
        let ignored = || ActivityEvent::MountIgnored {
            mount_point: "/proc".to_string(),
            fs_type: "proc".to_string(),
            reason: "fs_type".to_string(),
        };

        let quiet = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(quiet.path(), false)).unwrap();
        handle.send(ignored());
        handle.shutdown();
        join.join().unwrap();
        assert!(read_events(quiet.path()).is_empty());

        let loud = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(loud.path(), true)).unwrap();
        handle.send(ignored());
        handle.shutdown();
        join.join().unwrap();
        let events = read_events(loud.path());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["severity"], "debug");
    }

    #[test]
    fn skipped_stuck_mounts_are_logged_without_verbose() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), false)).unwrap();
        handle.send(ActivityEvent::MountSkipped {
            mount_point: "/mnt/nfs".to_string(),
            device: "server:/export".to_string(),
            fs_type: "nfs4".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let events = read_events(dir.path());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], "mount_skipped");
        assert_eq!(events[0]["severity"], "info");
        assert_eq!(events[0]["mount_point"], "/mnt/nfs");
    }

    #[test]
    fn handles_cloneable_and_send() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), false)).unwrap();
        let h2 = handle.clone();
        let sender = thread::spawn(move || {
            h2.send(ActivityEvent::Error {
                code: "MG-3900".to_string(),
                message: "boom".to_string(),
            });
        });
        sender.join().unwrap();
        handle.shutdown();
        join.join().unwrap();

        let events = read_events(dir.path());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["error_code"], "MG-3900");
    }

    #[test]
    fn logger_exits_when_all_handles_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), false)).unwrap();
        drop(handle);
        join.join().unwrap();
    }

    #[test]
    fn dropped_counter_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), false)).unwrap();
        assert_eq!(handle.dropped_events(), 0);
        handle.shutdown();
        join.join().unwrap();
    }
}
