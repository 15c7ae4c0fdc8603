//! Deadline-guarded stat call.
//!
//! The blocking syscall runs on its own detached thread because it cannot be
//! cancelled. The calling thread waits for at most the timeout. Both sides
//! resolve the race through the stuck registry's mutex:
//!
//! - stat thread, on return: under the lock, publish the outcome, close the
//!   completion signal, clear any stuck entry for the path;
//! - watchdog, on deadline: under the lock, mark the path stuck unless the
//!   completion signal is already closed.
//!
//! Exactly one of "completed" and "timed out" is reported per call. A stat
//! thread that outlives its deadline keeps running and clears the registry
//! entry when (if ever) the kernel lets it go. A panic inside the stat call
//! counts as a return with an error.

#![allow(missing_docs)]

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{TryRecvError, after, bounded, select};

use crate::collector::registry::StuckMountRegistry;
use crate::core::errors::{MgError, Result};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, millis};
use crate::platform::pal::{Platform, RawStatFs};

/// Cause attached to records whose stat call did not finish in time.
pub const MOUNT_TIMEOUT_CAUSE: &str = "mountpoint timeout";

#[derive(Debug)]
pub enum StatOutcome {
    /// The call returned before the deadline (or in the instant between the
    /// deadline and the watchdog taking the lock).
    Completed(Result<RawStatFs>),
    /// The path has been marked stuck; the call is still in flight.
    TimedOut,
}

pub struct StatWatchdog {
    platform: Arc<dyn Platform>,
    registry: Arc<StuckMountRegistry>,
    timeout: Duration,
    logger: Option<ActivityLoggerHandle>,
}

impl StatWatchdog {
    pub fn new(
        platform: Arc<dyn Platform>,
        registry: Arc<StuckMountRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            platform,
            registry,
            timeout,
            logger: None,
        }
    }

    #[must_use]
    pub fn with_logger(mut self, logger: Option<ActivityLoggerHandle>) -> Self {
        self.logger = logger;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Stat `mount_point`, giving up after the timeout.
    pub fn stat(&self, mount_point: &Path) -> StatOutcome {
        let (outcome_tx, outcome_rx) = bounded::<Result<RawStatFs>>(1);
        // Never sent on; closed by dropping the sender.
        let (done_tx, done_rx) = bounded::<()>(0);

        let platform = Arc::clone(&self.platform);
        let registry = Arc::clone(&self.registry);
        let logger = self.logger.clone();
        let path = mount_point.to_path_buf();

        let spawned = thread::Builder::new()
            .name("mountguard-statfs".to_string())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| platform.statfs(&path)))
                    .unwrap_or_else(|payload| Err(stat_panicked(&path, payload.as_ref())));
                let ((), cleared) = registry.clear_after(&path, move || {
                    // Receiver is gone when the watchdog already gave up.
                    let _ = outcome_tx.try_send(result);
                    drop(done_tx);
                });
                if let Some(stuck_for) = cleared {
                    report_recovery(logger.as_ref(), &path, stuck_for);
                }
            });
        if let Err(e) = spawned {
            return StatOutcome::Completed(Err(MgError::Runtime {
                details: format!("failed to spawn stat thread: {e}"),
            }));
        }

        select! {
            recv(outcome_rx) -> msg => {
                return StatOutcome::Completed(
                    msg.unwrap_or_else(|_| Err(stat_thread_died(mount_point))),
                );
            }
            recv(after(self.timeout)) -> _ => {}
        }

        let marked = self.registry.mark_unless(mount_point, || {
            matches!(done_rx.try_recv(), Err(TryRecvError::Disconnected))
        });
        if marked {
            return StatOutcome::TimedOut;
        }

        // Lost the race by a hair: the outcome was published under the lock.
        match outcome_rx.try_recv() {
            Ok(result) => StatOutcome::Completed(result),
            Err(_) => StatOutcome::Completed(Err(stat_thread_died(mount_point))),
        }
    }
}

fn stat_thread_died(mount_point: &Path) -> MgError {
    MgError::Runtime {
        details: format!(
            "stat thread for {} exited without a result",
            mount_point.display()
        ),
    }
}

fn stat_panicked(mount_point: &Path, payload: &(dyn Any + Send)) -> MgError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    MgError::Runtime {
        details: format!("stat call on {} panicked: {message}", mount_point.display()),
    }
}

fn report_recovery(
    logger: Option<&ActivityLoggerHandle>,
    mount_point: &Path,
    stuck_for: Duration,
) {
    if let Some(logger) = logger {
        logger.send(ActivityEvent::MountRecovered {
            mount_point: mount_point.to_string_lossy().into_owned(),
            stuck_for_ms: millis(stuck_for),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::platform::mock::{MockPlatform, MockStat};

    fn raw() -> RawStatFs {
        RawStatFs {
            block_size: 4096,
            blocks: 1000,
            blocks_free: 500,
            blocks_available: 400,
            files: 100,
            files_free: 50,
        }
    }

    fn watchdog(
        mock: &Arc<MockPlatform>,
        timeout_ms: u64,
    ) -> (StatWatchdog, Arc<StuckMountRegistry>) {
        let registry = Arc::new(StuckMountRegistry::new());
        let platform: Arc<dyn Platform> = Arc::clone(mock) as Arc<dyn Platform>;
        let dog = StatWatchdog::new(
            platform,
            Arc::clone(&registry),
            Duration::from_millis(timeout_ms),
        );
        (dog, registry)
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn fast_call_completes() {
        let mock = Arc::new(MockPlatform::default().with_stat("/", MockStat::Ready(raw())));
        let (dog, registry) = watchdog(&mock, 1000);

        match dog.stat(Path::new("/")) {
            StatOutcome::Completed(Ok(got)) => assert_eq!(got, raw()),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn syscall_error_is_completed_not_stuck() {
        let mock = Arc::new(
            MockPlatform::default().with_stat("/mnt/gone", MockStat::Fail("ESTALE".to_string())),
        );
        let (dog, registry) = watchdog(&mock, 1000);

        match dog.stat(Path::new("/mnt/gone")) {
            StatOutcome::Completed(Err(err)) => assert_eq!(err.cause(), "ESTALE"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!registry.is_stuck(Path::new("/mnt/gone")));
    }

    #[test]
    fn hung_call_times_out_and_marks_stuck() {
        let mock = Arc::new(MockPlatform::default().with_stat("/mnt/nfs", MockStat::Hang(raw())));
        let (dog, registry) = watchdog(&mock, 100);

        let start = Instant::now();
        let outcome = dog.stat(Path::new("/mnt/nfs"));
        let elapsed = start.elapsed();

        assert!(matches!(outcome, StatOutcome::TimedOut), "{outcome:?}");
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(1000), "took {elapsed:?}");
        assert!(registry.is_stuck(Path::new("/mnt/nfs")));

        mock.release(Path::new("/mnt/nfs"));
    }

    #[test]
    fn late_return_clears_stuck_entry() {
        let mock = Arc::new(MockPlatform::default().with_stat("/mnt/nfs", MockStat::Hang(raw())));
        let (dog, registry) = watchdog(&mock, 50);

        assert!(matches!(dog.stat(Path::new("/mnt/nfs")), StatOutcome::TimedOut));
        assert!(registry.is_stuck(Path::new("/mnt/nfs")));

        mock.release(Path::new("/mnt/nfs"));
        assert!(
            wait_until(Duration::from_secs(2), || registry.is_empty()),
            "hung call returning must clear the entry"
        );
    }

    #[test]
    fn slow_but_in_time_call_is_not_stuck() {
        let mock = Arc::new(MockPlatform::default().with_stat(
            "/mnt/slow",
            MockStat::Delay(Duration::from_millis(20), raw()),
        ));
        let (dog, registry) = watchdog(&mock, 500);

        assert!(matches!(
            dog.stat(Path::new("/mnt/slow")),
            StatOutcome::Completed(Ok(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn panicking_stat_is_a_runtime_error() {
        let mock = Arc::new(MockPlatform::default().with_stat("/mnt/bug", MockStat::Panic));
        let (dog, registry) = watchdog(&mock, 1000);

        match dog.stat(Path::new("/mnt/bug")) {
            StatOutcome::Completed(Err(err)) => {
                assert_eq!(err.code(), "MG-3900");
                assert!(err.to_string().contains("panicked"), "{err}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn panic_after_deadline_still_clears_stuck_entry() {
        let mock = Arc::new(MockPlatform::default().with_stat(
            "/mnt/bug",
            MockStat::PanicAfter(Duration::from_millis(100)),
        ));
        let (dog, registry) = watchdog(&mock, 20);

        assert!(matches!(dog.stat(Path::new("/mnt/bug")), StatOutcome::TimedOut));
        assert!(registry.is_stuck(Path::new("/mnt/bug")));
        assert!(
            wait_until(Duration::from_secs(2), || registry.is_empty()),
            "a panicking late call must still release the mount"
        );
    }

    #[test]
    fn exactly_one_outcome_under_tight_deadlines() {
        // Calls that finish right around the deadline must yield either a
        // completed result with no stuck entry, or a timeout with one.
        for _ in 0..20 {
            let mock = Arc::new(MockPlatform::default().with_stat(
                "/mnt/edge",
                MockStat::Delay(Duration::from_millis(10), raw()),
            ));
            let (dog, registry) = watchdog(&mock, 10);
            match dog.stat(Path::new("/mnt/edge")) {
                StatOutcome::Completed(Ok(_)) => assert!(registry.is_empty()),
                StatOutcome::TimedOut => {
                    // The late return then clears it.
                    assert!(wait_until(Duration::from_secs(1), || registry.is_empty()));
                }
                StatOutcome::Completed(Err(err)) => panic!("unexpected error: {err}"),
            }
        }
    }
}
