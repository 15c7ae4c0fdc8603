//! Regex include/exclude predicates for mount points and filesystem types.

#![allow(missing_docs)]

use regex::Regex;

use crate::core::config::CollectorConfig;
use crate::core::errors::{MgError, Result};
use crate::platform::pal::MountLabel;

/// Ignore/accept pair. An empty pattern means "unset".
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    ignore: Option<Regex>,
    accept: Option<Regex>,
}

impl DeviceFilter {
    pub fn new(ignore_pattern: &str, accept_pattern: &str) -> Result<Self> {
        Ok(Self {
            ignore: compile(ignore_pattern)?,
            accept: compile(accept_pattern)?,
        })
    }

    /// Matches the ignore pattern, or an accept pattern is set and does not match.
    #[must_use]
    pub fn ignored(&self, name: &str) -> bool {
        self.ignore.as_ref().is_some_and(|re| re.is_match(name))
            || self.accept.as_ref().is_some_and(|re| !re.is_match(name))
    }
}

fn compile(pattern: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern).map(Some).map_err(MgError::from)
}

/// Which filter rejected a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Accepted,
    MountPointIgnored,
    FsTypeIgnored,
}

impl FilterVerdict {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::MountPointIgnored => "mount_point",
            Self::FsTypeIgnored => "fs_type",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MountFilters {
    pub mount_points: DeviceFilter,
    pub fs_types: DeviceFilter,
}

impl MountFilters {
    pub fn from_config(config: &CollectorConfig) -> Result<Self> {
        Ok(Self {
            mount_points: DeviceFilter::new(
                &config.mount_points_exclude,
                &config.mount_points_include,
            )?,
            fs_types: DeviceFilter::new(&config.fs_types_exclude, &config.fs_types_include)?,
        })
    }

    #[must_use]
    pub fn verdict(&self, mount: &MountLabel) -> FilterVerdict {
        if self.mount_points.ignored(&mount.mount_point_label()) {
            FilterVerdict::MountPointIgnored
        } else if self.fs_types.ignored(&mount.fs_type) {
            FilterVerdict::FsTypeIgnored
        } else {
            FilterVerdict::Accepted
        }
    }
}
