//! Signal handling: SIGTERM/SIGINT graceful shutdown, SIGHUP config reload,
//! SIGUSR1 immediate scrape.
//!
//! `signal-hook` flips atomic flags; the watch loop polls them between
//! sleeps rather than blocking on signals.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Granularity of [`SignalHandler::sleep_interruptible`].
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Flags shared between the signal hooks and the watch loop.
///
/// `Relaxed` ordering is enough: the loop polls every slice and nothing else
/// is published through these flags.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    reload_flag: Arc<AtomicBool>,
    scrape_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register OS signal hooks. Registration is
    /// best-effort; failures are reported on stderr.
    pub fn new() -> Self {
        let handler = Self::unregistered();
        handler.register_signals();
        handler
    }

    /// Flags only; no OS hooks. For embedding and tests.
    pub fn unregistered() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            reload_flag: Arc::new(AtomicBool::new(false)),
            scrape_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Check and clear.
    pub fn should_reload(&self) -> bool {
        self.reload_flag.swap(false, Ordering::Relaxed)
    }

    /// Check and clear.
    pub fn should_scrape(&self) -> bool {
        self.scrape_flag.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_reload(&self) {
        self.reload_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_scrape(&self) {
        self.scrape_flag.store(true, Ordering::Relaxed);
    }

    /// Sleep up to `duration`, returning early once any flag is raised.
    /// Flags are left set for the caller to consume.
    pub fn sleep_interruptible(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.pending() {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            thread::sleep(remaining.min(POLL_SLICE));
        }
    }

    fn pending(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
            || self.reload_flag.load(Ordering::Relaxed)
            || self.scrape_flag.load(Ordering::Relaxed)
    }

    fn register_signals(&self) {
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[MG-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[MG-SIGNAL] failed to register SIGINT: {e}");
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::{SIGHUP, SIGUSR1};
            if let Err(e) = signal_hook::flag::register(SIGHUP, Arc::clone(&self.reload_flag)) {
                eprintln!("[MG-SIGNAL] failed to register SIGHUP: {e}");
            }
            if let Err(e) = signal_hook::flag::register(SIGUSR1, Arc::clone(&self.scrape_flag)) {
                eprintln!("[MG-SIGNAL] failed to register SIGUSR1: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
