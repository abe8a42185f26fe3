//! Shared configuration for the switchyard dispatch engine.
//!
//! The crate describes where buses live ([`BusAddress`], [`BusType`]), how the
//! dispatch engine is tuned ([`DispatcherConfig`]) and how telemetry is
//! rendered ([`LogFormat`]). [`Config`] aggregates the three and is layered
//! from defaults, a configuration file and `SWITCHYARD_*` environment
//! variables.

mod address;
mod bus_type;
mod defaults;
mod dispatch;
mod logging;

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use address::{AddressParseError, BusAddress, BusEndpoint};
pub use bus_type::{BusType, BusTypeError, SESSION_BUS_ENV, STARTER_BUS_ENV, SYSTEM_BUS_ENV};
pub use defaults::{
    DEFAULT_BATCH_SIZE, DEFAULT_DISPATCH_LOOP_LIMIT, DEFAULT_LOG_FILTER,
    DEFAULT_MAX_POLL_INTERVAL, DEFAULT_MAX_POLL_INTERVAL_MS, DEFAULT_THREAD_NAME,
    SYSTEM_BUS_DEFAULT_ADDRESS, default_log_filter, default_log_filter_string,
    default_log_format,
};
pub use dispatch::DispatcherConfig;
pub use logging::{LogFormat, LogFormatParseError};

/// Environment variable naming an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "SWITCHYARD_CONFIG_PATH";
/// Environment variable overriding the log filter.
pub const LOG_FILTER_ENV: &str = "SWITCHYARD_LOG_FILTER";
/// Environment variable overriding the log format.
pub const LOG_FORMAT_ENV: &str = "SWITCHYARD_LOG_FORMAT";
/// Environment variable overriding the dispatch loop limit.
pub const DISPATCH_LOOP_LIMIT_ENV: &str = "SWITCHYARD_DISPATCH_LOOP_LIMIT";
/// Environment variable overriding the wait bound, in milliseconds.
pub const MAX_POLL_INTERVAL_ENV: &str = "SWITCHYARD_MAX_POLL_INTERVAL_MS";

/// Resolved configuration shared by the engine and its telemetry.
///
/// Layers apply in order: built-in defaults, a TOML configuration file
/// (named by `SWITCHYARD_CONFIG_PATH` or discovered by the loader), then
/// `SWITCHYARD_*` environment variables. Environment names are the field
/// names upper-cased behind the prefix, e.g. `SWITCHYARD_BATCH_SIZE`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, OrthoConfig)]
#[ortho_config(prefix = "SWITCHYARD")]
#[serde(default)]
pub struct Config {
    log_filter: String,
    log_format: LogFormat,
    dispatch_loop_limit: u32,
    max_poll_interval_ms: u64,
    thread_name: String,
    autostart: bool,
    batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::default();
        Self {
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            dispatch_loop_limit: dispatcher.dispatch_loop_limit(),
            max_poll_interval_ms: DEFAULT_MAX_POLL_INTERVAL_MS,
            thread_name: dispatcher.thread_name().to_owned(),
            autostart: dispatcher.autostart(),
            batch_size: dispatcher.batch_size(),
        }
    }
}

impl Config {
    /// Loads the layered configuration without consulting command-line
    /// arguments, which belong to the embedding process.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] when a file cannot be read or a layer
    /// holds a value of the wrong shape.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from(env!("CARGO_PKG_NAME"))])
            .map_err(|source| ConfigError::Load { source })
    }

    /// Log filter expression understood by `tracing-subscriber`.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Output format for telemetry.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Dispatch engine tuning assembled from the loaded values.
    #[must_use]
    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_dispatch_loop_limit(self.dispatch_loop_limit)
            .with_max_poll_interval(Duration::from_millis(self.max_poll_interval_ms))
            .with_thread_name(self.thread_name.as_str())
            .with_autostart(self.autostart)
            .with_batch_size(self.batch_size)
    }

    /// Replaces the log filter.
    #[must_use]
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Replaces the log format.
    #[must_use]
    pub const fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }
}

/// Errors raised while loading layered configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration layer could not be read or merged.
    #[error("failed to load configuration: {source}")]
    Load {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn defaults_mirror_the_engine_defaults() {
        let config = Config::default();
        assert_eq!(config.log_filter(), DEFAULT_LOG_FILTER);
        assert_eq!(config.log_format(), LogFormat::Json);
        assert_eq!(config.dispatcher(), DispatcherConfig::default());
    }

    #[rstest]
    fn zero_poll_interval_in_a_document_is_clamped() {
        let config: Config = serde_json::from_str(r#"{"max_poll_interval_ms": 0}"#)
            .expect("config should deserialise");
        assert_eq!(
            config.dispatcher().max_poll_interval(),
            Duration::from_millis(1)
        );
    }
}
