//! Fixed-size stat worker pool.
//!
//! The calling thread is the dispatcher: it runs the admission check for each
//! mount and hands admitted labels to the workers over a rendezvous channel, so
//! a label only leaves the dispatcher when a worker is free to take it. Results
//! come back on an unbounded channel that closes once the dispatcher and every
//! worker have dropped their senders.

#![allow(missing_docs)]

use std::thread;

use crossbeam_channel::{SendError, bounded, unbounded};

use crate::platform::pal::MountLabel;

/// Dispatcher verdict for one mount.
#[derive(Debug)]
pub enum Admission<T> {
    /// Send to a worker.
    Dispatch(MountLabel),
    /// Already resolved without a stat call (e.g. known stuck).
    Resolved(T),
    /// Produce nothing.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatWorkerPool {
    workers: usize,
}

impl StatWorkerPool {
    /// `workers` is clamped to at least one.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Run `process` over every admitted mount and collect all records.
    /// Output order is unspecified. Every mount yields exactly one record
    /// unless `admit` returns [`Admission::Skip`].
    pub fn run<T, A, P>(&self, mounts: Vec<MountLabel>, mut admit: A, process: P) -> Vec<T>
    where
        T: Send,
        A: FnMut(MountLabel) -> Admission<T>,
        P: Fn(MountLabel) -> T + Sync,
    {
        let (job_tx, job_rx) = bounded::<MountLabel>(0);
        let (result_tx, result_rx) = unbounded::<T>();
        let process = &process;

        thread::scope(|scope| {
            for id in 0..self.workers {
                let jobs = job_rx.clone();
                let results = result_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("mountguard-stat-{id}"))
                    .spawn_scoped(scope, move || {
                        for label in jobs {
                            if results.send(process(label)).is_err() {
                                break;
                            }
                        }
                    });
                if let Err(e) = spawned {
                    eprintln!("[MG-POOL] failed to spawn stat worker {id}: {e}");
                }
            }
            // Only workers hold receivers now; with none alive, sends fail.
            drop(job_rx);

            for mount in mounts {
                match admit(mount) {
                    Admission::Dispatch(label) => {
                        if let Err(SendError(label)) = job_tx.send(label) {
                            // No worker could be started; do the work here.
                            let _ = result_tx.send(process(label));
                        }
                    }
                    Admission::Resolved(record) => {
                        let _ = result_tx.send(record);
                    }
                    Admission::Skip => {}
                }
            }
            drop(job_tx);
            drop(result_tx);

            result_rx.iter().collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use super::*;

    fn labels(n: usize) -> Vec<MountLabel> {
        (0..n)
            .map(|i| MountLabel::new(format!("/dev/sd{i}"), format!("/mnt/{i}"), "ext4"))
            .collect()
    }

    #[test]
    fn zero_workers_clamped_to_one() {
        assert_eq!(StatWorkerPool::new(0).workers(), 1);
        assert_eq!(StatWorkerPool::new(8).workers(), 8);
    }

    #[test]
    fn every_mount_processed_once() {
        let pool = StatWorkerPool::new(3);
        let out = pool.run(labels(25), Admission::Dispatch, |label| {
            label.mount_point_label()
        });
        assert_eq!(out.len(), 25);
        let unique: HashSet<_> = out.iter().collect();
        assert_eq!(unique.len(), 25);
    }

    #[test]
    fn resolved_and_skipped_bypass_workers() {
        let processed = AtomicUsize::new(0);
        let pool = StatWorkerPool::new(2);
        let out = pool.run(
            labels(6),
            |label| match label.mount_point_label().as_str() {
                "/mnt/0" => Admission::Skip,
                "/mnt/1" => Admission::Resolved("synthetic".to_string()),
                _ => Admission::Dispatch(label),
            },
            |label| {
                processed.fetch_add(1, Ordering::SeqCst);
                label.mount_point_label()
            },
        );
        assert_eq!(out.len(), 5);
        assert!(out.contains(&"synthetic".to_string()));
        assert!(!out.contains(&"/mnt/0".to_string()));
        assert_eq!(processed.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn empty_input_returns_empty() {
        let pool = StatWorkerPool::new(4);
        let out: Vec<String> = pool.run(Vec::new(), Admission::Dispatch, |l| l.device);
        assert!(out.is_empty());
    }

    #[test]
    fn workers_run_in_parallel() {
        let pool = StatWorkerPool::new(4);
        let start = Instant::now();
        let out = pool.run(labels(4), Admission::Dispatch, |label| {
            thread::sleep(Duration::from_millis(100));
            label
        });
        assert_eq!(out.len(), 4);
        assert!(
            start.elapsed() < Duration::from_millis(350),
            "took {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn concurrency_never_exceeds_worker_count() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let pool = StatWorkerPool::new(2);
        pool.run(labels(10), Admission::Dispatch, |label| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            active.fetch_sub(1, Ordering::SeqCst);
            label
        });
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
