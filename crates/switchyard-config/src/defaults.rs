use std::time::Duration;

/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default number of batches dispatched per connection in one pass.
pub const DEFAULT_DISPATCH_LOOP_LIMIT: u32 = 10;

/// Default upper bound on a single multiplexed wait, in milliseconds.
pub const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 1_000;

/// Default upper bound on a single multiplexed wait.
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_millis(DEFAULT_MAX_POLL_INTERVAL_MS);

/// Default name given to the dispatch thread.
pub const DEFAULT_THREAD_NAME: &str = "switchyard-dispatch";

/// Default number of messages handled by one batch of the stream transport.
pub const DEFAULT_BATCH_SIZE: usize = 1;

/// Address of the system bus when the environment does not override it.
pub const SYSTEM_BUS_DEFAULT_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// Default log filter expression.
#[must_use]
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format.
#[must_use]
pub fn default_log_format() -> crate::logging::LogFormat {
    crate::logging::LogFormat::Json
}
