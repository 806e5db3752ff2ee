//! Typed configuration for dispatch loops and the demo binary.
//!
//! [`LoopConfig`] can come from code (`Default`), a TOML document, or
//! environment variables. [`Config`] adds the process-level telemetry
//! settings and is loaded once at startup.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Settings for a single dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopConfig {
    /// Name given to the worker thread.
    pub thread_name: String,
    /// Upper bound on pending items. `None` means unbounded.
    pub max_pending: Option<usize>,
    /// Worker thread stack size in bytes. `None` uses the platform default.
    pub stack_size: Option<usize>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            thread_name: "dispatch-loop".to_string(),
            max_pending: None,
            stack_size: None,
        }
    }
}

impl LoopConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad loop config: {e}")))?;
        config.validate()
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read loop config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Overlay `DISPATCH_*` environment variables on the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(name) = std::env::var("DISPATCH_THREAD_NAME") {
            config.thread_name = name;
        }
        config.max_pending = optional_usize("DISPATCH_MAX_PENDING")?;
        config.stack_size = optional_usize("DISPATCH_STACK_SIZE")?;
        config.validate()
    }

    fn validate(self) -> Result<Self> {
        if self.thread_name.trim().is_empty() {
            return Err(Error::Config("thread_name must not be empty".to_string()));
        }
        if self.max_pending == Some(0) {
            return Err(Error::Config("max_pending must be at least 1".to_string()));
        }
        Ok(self)
    }
}

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub dispatch: LoopConfig,
    /// OTLP/gRPC collector. `None` keeps telemetry local.
    pub otel_endpoint: Option<String>,
    /// Reported as `service.name` on exported telemetry.
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatch: LoopConfig::default(),
            otel_endpoint: None,
            service_name: "dispatch-loop".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            dispatch: LoopConfig::from_env()?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            service_name: std::env::var("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }
}

fn optional_usize(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?} is not a valid count: {e}"))),
        Err(_) => Ok(None),
    }
}
