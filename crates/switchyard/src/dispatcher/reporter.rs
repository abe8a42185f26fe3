//! Structured reporting for dispatcher lifecycle events.

use std::sync::Arc;

use super::{ConnectionId, DISPATCH_TARGET};

/// Outcome of one pass over the registered connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Monotonic pass counter, starting at one for each dispatch thread.
    pub cycle: u64,
    /// Connections visited in the pass.
    pub connections: usize,
    /// Batches dispatched across all connections.
    pub batches: usize,
    /// Connections left with buffered data because they hit the loop limit.
    pub deferred: usize,
    /// Whether the wait ended because the wakeup channel was signalled.
    pub woken_by_signal: bool,
}

/// Observer trait used to surface dispatcher events to telemetry sinks.
///
/// Every method runs on the thread that caused the event. Thread and pass
/// events run on the dispatch thread, so implementations must not block.
pub trait DispatchReporter: Send + Sync {
    /// Invoked once the dispatch thread is running.
    fn thread_started(&self, name: &str);

    /// Invoked as the dispatch thread exits.
    fn thread_stopped(&self, name: &str, passes: u64);

    /// Invoked after a connection is registered.
    fn connection_added(&self, id: ConnectionId);

    /// Invoked after a connection is unregistered.
    fn connection_removed(&self, id: ConnectionId);

    /// Invoked after every pass.
    fn pass_completed(&self, summary: &PassSummary);

    /// Invoked when a connection callback panicked during a pass.
    fn connection_panicked(&self, id: ConnectionId, message: &str);
}

impl<T> DispatchReporter for Arc<T>
where
    T: DispatchReporter + ?Sized,
{
    fn thread_started(&self, name: &str) {
        (**self).thread_started(name);
    }

    fn thread_stopped(&self, name: &str, passes: u64) {
        (**self).thread_stopped(name, passes);
    }

    fn connection_added(&self, id: ConnectionId) {
        (**self).connection_added(id);
    }

    fn connection_removed(&self, id: ConnectionId) {
        (**self).connection_removed(id);
    }

    fn pass_completed(&self, summary: &PassSummary) {
        (**self).pass_completed(summary);
    }

    fn connection_panicked(&self, id: ConnectionId, message: &str) {
        (**self).connection_panicked(id, message);
    }
}

/// Default reporter that records dispatcher events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredDispatchReporter;

impl StructuredDispatchReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl DispatchReporter for StructuredDispatchReporter {
    fn thread_started(&self, name: &str) {
        tracing::info!(
            target: DISPATCH_TARGET,
            event = "thread_started",
            thread = name,
            "dispatch thread running"
        );
    }

    fn thread_stopped(&self, name: &str, passes: u64) {
        tracing::info!(
            target: DISPATCH_TARGET,
            event = "thread_stopped",
            thread = name,
            passes,
            "dispatch thread stopped"
        );
    }

    fn connection_added(&self, id: ConnectionId) {
        tracing::debug!(
            target: DISPATCH_TARGET,
            event = "connection_added",
            connection = %id,
            "connection registered"
        );
    }

    fn connection_removed(&self, id: ConnectionId) {
        tracing::debug!(
            target: DISPATCH_TARGET,
            event = "connection_removed",
            connection = %id,
            "connection unregistered"
        );
    }

    fn pass_completed(&self, summary: &PassSummary) {
        tracing::trace!(
            target: DISPATCH_TARGET,
            event = "pass_completed",
            cycle = summary.cycle,
            connections = summary.connections,
            batches = summary.batches,
            deferred = summary.deferred,
            woken_by_signal = summary.woken_by_signal,
            "dispatch pass completed"
        );
    }

    fn connection_panicked(&self, id: ConnectionId, message: &str) {
        tracing::error!(
            target: DISPATCH_TARGET,
            event = "connection_panicked",
            connection = %id,
            message,
            "connection callback panicked; continuing with the next connection"
        );
    }
}
