//! Installs the global `tracing` subscriber for processes embedding the
//! engine.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::{Subscriber, info, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use switchyard_config::{Config, LogFormat};

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

const TELEMETRY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::telemetry");

/// Proof that telemetry has been configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The configured filter expression does not parse.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Another subscriber was installed first.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs a subscriber honouring the filter and format in `config`.
///
/// Only the first successful call installs anything; later calls return a
/// fresh handle. Dispatcher events are emitted under the `switchyard::*`
/// targets, so `switchyard::dispatch=debug` isolates the engine.
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] for an unparsable filter and
/// [`TelemetryError::Subscriber`] when the process already has a global
/// subscriber from elsewhere.
///
/// # Examples
///
/// ```rust
/// use switchyard::{Config, initialise_telemetry};
///
/// # fn main() -> Result<(), switchyard::TelemetryError> {
/// let config = Config::default().with_log_filter("switchyard=debug");
/// let _handle = initialise_telemetry(&config)?;
/// let _again = initialise_telemetry(&config)?;
/// # Ok(())
/// # }
/// ```
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(config))
        .map(|_| TelemetryHandle)
}

fn install_subscriber(config: &Config) -> Result<(), TelemetryError> {
    let filter = engine_filter(config)?;

    let builder = |filter: EnvFilter| {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            // Engine events are emitted on the named dispatch thread.
            .with_thread_names(true)
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
            .with_timer(fmt::time::UtcTime::rfc_3339())
    };

    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.log_format() {
        LogFormat::Json => Box::new(builder(filter).json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder(filter).compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)?;
    let dispatcher = config.dispatcher();
    info!(
        target: TELEMETRY_TARGET,
        filter = config.log_filter(),
        format = %config.log_format(),
        dispatch_thread = dispatcher.thread_name(),
        loop_limit = dispatcher.dispatch_loop_limit(),
        "telemetry initialised"
    );
    Ok(())
}

/// Parses the configured filter, which may address engine targets such as
/// `switchyard::dispatch` or `switchyard::transport` individually.
fn engine_filter(config: &Config) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(config.log_filter())
        .map_err(|error| TelemetryError::Filter(error.to_string()))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn malformed_filters_are_rejected() {
        let config = Config::default().with_log_filter("switchyard=loudest");
        let error = install_subscriber(&config).expect_err("filter should not parse");
        assert!(matches!(error, TelemetryError::Filter(_)));
    }

    #[rstest]
    #[case("info")]
    #[case("warn,switchyard::dispatch=debug")]
    #[case("switchyard::transport=trace,switchyard::wakeup=off")]
    fn engine_targets_can_be_tuned_separately(#[case] filter: &str) {
        let config = Config::default().with_log_filter(filter);
        let parsed = engine_filter(&config).expect("filter should parse");
        assert!(!parsed.to_string().is_empty());
    }
}
