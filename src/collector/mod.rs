//! Timeout-resilient filesystem statistics collection: stuck-mount registry,
//! stat watchdog, worker pool, filters and the collector that wires them.

pub mod filesystem;
pub mod filter;
pub mod pool;
pub mod registry;
pub mod watchdog;
