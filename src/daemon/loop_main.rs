//! Watch loop: scrape on an interval (or on SIGUSR1), render the exposition and
//! publish it to a textfile or a writer.
//!
//! Threads: the loop itself (main), the activity logger thread, the stat
//! worker pool spawned per scrape, and any stat threads still blocked on
//! hung mounts. The stuck registry outlives config reloads so a reload never
//! redispatches a mount that is still hung.

#![allow(missing_docs)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::collector::filesystem::FilesystemStatsCollector;
use crate::collector::registry::StuckMountRegistry;
use crate::core::config::Config;
use crate::core::errors::{MgError, Result};
use crate::daemon::signals::SignalHandler;
use crate::exporter::scrape;
use crate::exporter::text::{render_text, write_textfile_atomic};
use crate::logger::activity::{
    ActivityEvent, ActivityLoggerConfig, ActivityLoggerHandle, spawn_logger,
};
use crate::platform::pal::{Platform, detect_platform};

/// Command-line overrides for the watch loop.
#[derive(Debug, Clone, Default)]
pub struct WatchArgs {
    /// Overrides `daemon.scrape_interval_ms`.
    pub interval: Option<Duration>,
    /// Overrides `daemon.output_file`.
    pub output: Option<PathBuf>,
    /// Stop after this many scrapes.
    pub max_scrapes: Option<u64>,
}

pub struct WatchLoop {
    config: Config,
    args: WatchArgs,
    platform: Arc<dyn Platform>,
    registry: Arc<StuckMountRegistry>,
    collector: FilesystemStatsCollector,
    logger_handle: Option<ActivityLoggerHandle>,
    logger_join: Option<thread::JoinHandle<()>>,
    signal_handler: SignalHandler,
    start_time: Instant,
    scrapes: u64,
}

impl WatchLoop {
    /// Production wiring: detected platform, process-global registry, OS
    /// signal hooks, JSONL logger when enabled.
    pub fn init(config: Config, args: WatchArgs) -> Result<Self> {
        let platform = detect_platform(&config.paths)?;
        Self::with_parts(
            config,
            args,
            platform,
            StuckMountRegistry::global(),
            SignalHandler::new(),
        )
    }

    pub fn with_parts(
        config: Config,
        args: WatchArgs,
        platform: Arc<dyn Platform>,
        registry: Arc<StuckMountRegistry>,
        signal_handler: SignalHandler,
    ) -> Result<Self> {
        let (logger_handle, logger_join) = if config.logging.jsonl_enabled {
            let (handle, join) = spawn_logger(ActivityLoggerConfig::from_config(&config))?;
            (Some(handle), Some(join))
        } else {
            (None, None)
        };

        let collector =
            build_collector(&config, &platform, &registry, logger_handle.as_ref())?;

        Ok(Self {
            config,
            args,
            platform,
            registry,
            collector,
            logger_handle,
            logger_join,
            signal_handler,
            start_time: Instant::now(),
            scrapes: 0,
        })
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.args
            .interval
            .unwrap_or_else(|| self.config.daemon.scrape_interval())
    }

    #[must_use]
    pub fn output_path(&self) -> Option<&PathBuf> {
        self.args
            .output
            .as_ref()
            .or(self.config.daemon.output_file.as_ref())
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<StuckMountRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run until shutdown is requested or `max_scrapes` is reached. Without an
    /// output file, each exposition is written to `out`. Returns the number of
    /// scrapes performed.
    pub fn run(&mut self, out: &mut dyn Write) -> Result<u64> {
        self.log(ActivityEvent::CollectorStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: self.config.stable_hash().unwrap_or_default(),
        });

        let result = self.run_inner(out);
        self.shutdown();
        result.map(|()| self.scrapes)
    }

    fn run_inner(&mut self, out: &mut dyn Write) -> Result<()> {
        loop {
            if self.signal_handler.should_shutdown() {
                eprintln!("[MG-WATCH] shutdown requested");
                return Ok(());
            }
            if self.signal_handler.should_reload() {
                self.handle_config_reload();
            }
            // An explicit scrape request is satisfied by the scrape below.
            let _ = self.signal_handler.should_scrape();

            self.scrape_once(out)?;
            self.scrapes += 1;

            if self.args.max_scrapes.is_some_and(|max| self.scrapes >= max) {
                return Ok(());
            }
            self.signal_handler.sleep_interruptible(self.interval());
        }
    }

    /// One scrape. Collector failures are logged and the previous textfile is
    /// left in place; only a failing writer is returned as an error.
    fn scrape_once(&mut self, out: &mut dyn Write) -> Result<()> {
        let text = match scrape(&self.collector).and_then(|families| render_text(&families)) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("[MG-WATCH] scrape failed: {e}");
                self.log(ActivityEvent::Error {
                    code: e.code().to_string(),
                    message: format!("scrape failed: {e}"),
                });
                return Ok(());
            }
        };

        if let Some(path) = self.output_path().cloned() {
            if let Err(e) = write_textfile_atomic(&path, &text) {
                eprintln!("[MG-WATCH] {e}");
                self.log(ActivityEvent::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
            }
            return Ok(());
        }

        out.write_all(text.as_bytes())
            .and_then(|()| out.flush())
            .map_err(|source| MgError::io("<stdout>", source))
    }

    fn handle_config_reload(&mut self) {
        eprintln!("[MG-WATCH] config reload requested (SIGHUP)");

        let new_config = match Config::load(Some(&self.config.paths.config_file)) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("[MG-WATCH] config reload failed: {e}");
                self.log(ActivityEvent::Error {
                    code: e.code().to_string(),
                    message: format!("config reload failed: {e}"),
                });
                return;
            }
        };

        let old_hash = self.config.stable_hash().unwrap_or_default();
        let new_hash = new_config.stable_hash().unwrap_or_default();
        if old_hash == new_hash {
            eprintln!("[MG-WATCH] config unchanged, skipping reload");
            return;
        }
        if new_config.paths.proc_path != self.config.paths.proc_path
            || new_config.paths.rootfs_path != self.config.paths.rootfs_path
        {
            eprintln!("[MG-WATCH] proc/rootfs path changes take effect after restart");
        }

        match build_collector(
            &new_config,
            &self.platform,
            &self.registry,
            self.logger_handle.as_ref(),
        ) {
            Ok(collector) => {
                self.collector = collector;
                self.log(ActivityEvent::ConfigReloaded {
                    details: format!("config hash: {old_hash} -> {new_hash}"),
                });
                self.config = new_config;
                eprintln!("[MG-WATCH] config reloaded successfully");
            }
            Err(e) => {
                eprintln!("[MG-WATCH] config reload rejected: {e}");
                self.log(ActivityEvent::Error {
                    code: e.code().to_string(),
                    message: format!("config reload rejected: {e}"),
                });
            }
        }
    }

    fn shutdown(&mut self) {
        let uptime_secs = self.start_time.elapsed().as_secs();
        self.log(ActivityEvent::CollectorStopped {
            reason: "clean shutdown".to_string(),
            uptime_secs,
        });

        if let Some(handle) = self.logger_handle.take() {
            handle.shutdown();
        }
        if let Some(join) = self.logger_join.take() {
            let _ = join.join();
        }

        eprintln!(
            "[MG-WATCH] stopped after {} scrapes (uptime={uptime_secs}s)",
            self.scrapes
        );
    }

    fn log(&self, event: ActivityEvent) {
        if let Some(handle) = &self.logger_handle {
            handle.send(event);
        }
    }
}

fn build_collector(
    config: &Config,
    platform: &Arc<dyn Platform>,
    registry: &Arc<StuckMountRegistry>,
    logger: Option<&ActivityLoggerHandle>,
) -> Result<FilesystemStatsCollector> {
    let collector = FilesystemStatsCollector::new(
        Arc::clone(platform),
        Arc::clone(registry),
        &config.collector,
    )?;
    Ok(match logger {
        Some(handle) => collector.with_logger(handle.clone()),
        None => collector,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::platform::mock::{MockPlatform, MockStat};
    use crate::platform::pal::{MountLabel, RawStatFs};

    fn raw() -> RawStatFs {
        RawStatFs {
            block_size: 1024,
            blocks: 100,
            blocks_free: 50,
            blocks_available: 25,
            files: 10,
            files_free: 5,
        }
    }

    fn mock() -> Arc<MockPlatform> {
        Arc::new(
            MockPlatform::new(vec![MountLabel::new("/dev/sda1", "/", "ext4")])
                .with_stat("/", MockStat::Ready(raw())),
        )
    }

    fn quiet_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.paths.config_file = dir.join("config.toml");
        config.paths.jsonl_log = dir.join("activity.jsonl");
        config.daemon.scrape_interval_ms = 10;
        config
    }

    fn watch(config: Config, args: WatchArgs, signals: SignalHandler) -> WatchLoop {
        let platform: Arc<dyn Platform> = mock();
        WatchLoop::with_parts(
            config,
            args,
            platform,
            Arc::new(StuckMountRegistry::new()),
            signals,
        )
        .unwrap()
    }

    #[test]
    fn stops_after_max_scrapes_and_writes_to_writer() {
        let dir = tempfile::tempdir().unwrap();
        let args = WatchArgs {
            max_scrapes: Some(3),
            ..WatchArgs::default()
        };
        let mut watch = watch(quiet_config(dir.path()), args, SignalHandler::unregistered());

        let mut out = Vec::new();
        assert_eq!(watch.run(&mut out).unwrap(), 3);

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("# TYPE node_filesystem_size_bytes gauge").count(), 3);

        let log = fs::read_to_string(dir.path().join("activity.jsonl")).unwrap();
        assert!(log.contains("collector_start"));
        assert_eq!(log.matches("scrape_complete").count(), 3);
        assert!(log.contains("collector_stop"));
    }

    #[test]
    fn writes_textfile_when_output_set() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("prom/filesystem.prom");
        let args = WatchArgs {
            output: Some(output.clone()),
            max_scrapes: Some(1),
            ..WatchArgs::default()
        };
        let mut watch = watch(quiet_config(dir.path()), args, SignalHandler::unregistered());

        let mut out = Vec::new();
        watch.run(&mut out).unwrap();
        assert!(out.is_empty());
        let text = fs::read_to_string(output).unwrap();
        assert!(text.contains("node_filesystem_avail_bytes{device=\"/dev/sda1\",fstype=\"ext4\",mountpoint=\"/\"} 25600"));
    }

    #[test]
    fn shutdown_before_first_scrape() {
        let dir = tempfile::tempdir().unwrap();
        let signals = SignalHandler::unregistered();
        signals.request_shutdown();
        let mut watch = watch(quiet_config(dir.path()), WatchArgs::default(), signals);
        assert_eq!(watch.run(&mut Vec::new()).unwrap(), 0);
    }

    #[test]
    fn shutdown_from_another_thread_interrupts_sleep() {
        let dir = tempfile::tempdir().unwrap();
        let signals = SignalHandler::unregistered();
        let remote = signals.clone();
        let args = WatchArgs {
            interval: Some(Duration::from_secs(60)),
            ..WatchArgs::default()
        };
        let mut watch = watch(quiet_config(dir.path()), args, signals);

        let poker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            remote.request_shutdown();
        });
        let start = Instant::now();
        assert_eq!(watch.run(&mut Vec::new()).unwrap(), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
        poker.join().unwrap();
    }

    #[test]
    fn reload_keeps_registry_and_applies_new_filters() {
        let dir = tempfile::tempdir().unwrap();
        let config = quiet_config(dir.path());
        fs::write(
            &config.paths.config_file,
            format!(
                "[paths]\nconfig_file = {:?}\njsonl_log = {:?}\n[collector]\nmount_points_exclude = \"^/$\"\n",
                config.paths.config_file, config.paths.jsonl_log
            ),
        )
        .unwrap();

        let signals = SignalHandler::unregistered();
        let mut watch = watch(config, WatchArgs::default(), signals.clone());
        let registry = Arc::clone(watch.registry());
        registry.mark_stuck(Path::new("/mnt/elsewhere"));

        signals.request_reload();
        watch.handle_config_reload();
        assert!(Arc::ptr_eq(&registry, watch.registry()));
        assert!(registry.is_stuck(Path::new("/mnt/elsewhere")));
        assert_eq!(watch.config().collector.mount_points_exclude, "^/$");

        let mut out = Vec::new();
        watch.scrape_once(&mut out).unwrap();
        assert!(!String::from_utf8(out).unwrap().contains("mountpoint=\"/\""));
    }

    #[test]
    fn failed_reload_keeps_running_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = quiet_config(dir.path());
        fs::write(&config.paths.config_file, "[collector]\nmount_timeout_ms = 0\n").unwrap();

        let mut watch = watch(config, WatchArgs::default(), SignalHandler::unregistered());
        watch.handle_config_reload();
        assert_eq!(watch.config().collector.mount_timeout_ms, 5000);
    }

    #[test]
    fn enumeration_failure_does_not_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let platform = mock();
        platform.fail_enumeration("gone");
        let dyn_platform: Arc<dyn Platform> = Arc::clone(&platform) as Arc<dyn Platform>;
        let mut watch = WatchLoop::with_parts(
            quiet_config(dir.path()),
            WatchArgs {
                max_scrapes: Some(2),
                ..WatchArgs::default()
            },
            dyn_platform,
            Arc::new(StuckMountRegistry::new()),
            SignalHandler::unregistered(),
        )
        .unwrap();

        let mut out = Vec::new();
        assert_eq!(watch.run(&mut out).unwrap(), 2);
        assert!(out.is_empty());
    }
}
