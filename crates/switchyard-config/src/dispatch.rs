//! Tuning knobs for the dispatch engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults::{
    DEFAULT_BATCH_SIZE, DEFAULT_DISPATCH_LOOP_LIMIT, DEFAULT_MAX_POLL_INTERVAL_MS,
    DEFAULT_THREAD_NAME,
};

/// Configuration consumed by a dispatcher when it is created.
///
/// `dispatch_loop_limit` bounds how many batches one connection may
/// dispatch in a single pass. Zero removes the bound: the connection is
/// drained until it stops reporting buffered data.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatcherConfig {
    dispatch_loop_limit: u32,
    max_poll_interval_ms: u64,
    thread_name: String,
    autostart: bool,
    batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dispatch_loop_limit: DEFAULT_DISPATCH_LOOP_LIMIT,
            max_poll_interval_ms: DEFAULT_MAX_POLL_INTERVAL_MS,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
            autostart: true,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl DispatcherConfig {
    /// Maximum batches per connection per pass; zero means unbounded.
    #[must_use]
    pub const fn dispatch_loop_limit(&self) -> u32 {
        self.dispatch_loop_limit
    }

    /// Upper bound on one multiplexed wait, after which dispatch status is
    /// re-checked even without I/O. Never below one millisecond, so an idle
    /// engine always blocks.
    #[must_use]
    pub const fn max_poll_interval(&self) -> Duration {
        if self.max_poll_interval_ms == 0 {
            Duration::from_millis(1)
        } else {
            Duration::from_millis(self.max_poll_interval_ms)
        }
    }

    /// Name given to the dispatch thread.
    #[must_use]
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Whether the dispatch thread starts as soon as the engine is created.
    #[must_use]
    pub const fn autostart(&self) -> bool {
        self.autostart
    }

    /// Messages handled by one batch of the stream transport (at least one).
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        if self.batch_size == 0 {
            1
        } else {
            self.batch_size
        }
    }

    /// Sets the per-pass batch bound.
    #[must_use]
    pub fn with_dispatch_loop_limit(mut self, limit: u32) -> Self {
        self.dispatch_loop_limit = limit;
        self
    }

    /// Sets the wait bound.
    #[must_use]
    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval_ms = duration_millis(interval).max(1);
        self
    }

    /// Sets the dispatch thread name.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Sets whether the dispatch thread starts on creation.
    #[must_use]
    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    /// Sets the transport batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
