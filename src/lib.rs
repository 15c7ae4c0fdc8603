#![forbid(unsafe_code)]

//! mountguard: a filesystem statistics collector that keeps scraping when
//! network mounts hang.
//!
//! Every mount is stat'ed on a bounded worker pool behind a per-call
//! watchdog. A call that outlives the mount timeout is abandoned, its mount
//! is quarantined in a shared stuck registry, and the mount is reported with
//! `device_error=1` until the hung call finally returns.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use mountguard::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use mountguard::collector::registry::StuckMountRegistry;
//! use mountguard::core::config::Config;
//! ```

pub mod prelude;

pub mod collector;
pub mod core;
pub mod daemon;
pub mod exporter;
pub mod logger;
pub mod platform;
