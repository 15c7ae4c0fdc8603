//! MG-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, MgError>;

/// Top-level error type for mountguard.
#[derive(Debug, Error)]
pub enum MgError {
    #[error("[MG-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[MG-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[MG-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[MG-1101] unsupported platform: {details}")]
    UnsupportedPlatform { details: String },

    #[error("[MG-2001] filesystem stats failure for {path}: {details}")]
    FsStats { path: PathBuf, details: String },

    #[error("[MG-2002] mount table parse failure: {details}")]
    MountParse { details: String },

    #[error("[MG-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[MG-2201] metrics failure: {details}")]
    Metrics { details: String },

    #[error("[MG-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[MG-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[MG-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl MgError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "MG-1001",
            Self::MissingConfig { .. } => "MG-1002",
            Self::ConfigParse { .. } => "MG-1003",
            Self::UnsupportedPlatform { .. } => "MG-1101",
            Self::FsStats { .. } => "MG-2001",
            Self::MountParse { .. } => "MG-2002",
            Self::Serialization { .. } => "MG-2101",
            Self::Metrics { .. } => "MG-2201",
            Self::Io { .. } => "MG-3002",
            Self::ChannelClosed { .. } => "MG-3003",
            Self::Runtime { .. } => "MG-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::FsStats { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Human-readable cause without the code prefix, used for per-mount
    /// device-error records where the error text ends up in logs.
    #[must_use]
    pub fn cause(&self) -> String {
        match self {
            Self::FsStats { details, .. } => details.clone(),
            Self::Io { source, .. } => source.to_string(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for MgError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for MgError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<prometheus::Error> for MgError {
    fn from(value: prometheus::Error) -> Self {
        Self::Metrics {
            details: value.to_string(),
        }
    }
}

impl From<regex::Error> for MgError {
    fn from(value: regex::Error) -> Self {
        Self::InvalidConfig {
            details: format!("invalid pattern: {value}"),
        }
    }
}
