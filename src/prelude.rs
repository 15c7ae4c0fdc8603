//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use mountguard::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{MgError, Result};

// Platform
pub use crate::platform::pal::{MountLabel, Platform, RawStatFs, RootFs, detect_platform};

// Collector
pub use crate::collector::filesystem::{FilesystemStats, FilesystemStatsCollector};
pub use crate::collector::filter::{DeviceFilter, FilterVerdict, MountFilters};
pub use crate::collector::pool::{Admission, StatWorkerPool};
pub use crate::collector::registry::{StuckMount, StuckMountRegistry};
pub use crate::collector::watchdog::{StatOutcome, StatWatchdog};

// Exporter
pub use crate::exporter::text::{render_text, write_textfile_atomic};
pub use crate::exporter::{Collector, register_gauge_vec, scrape};
