//! Shared doubles for the behavioural suites.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::{ConnectionId, DispatchReporter, PassSummary};

/// Dispatcher events in the order they were reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EngineEvent {
    ThreadStarted(String),
    ThreadStopped(String),
    ConnectionAdded(ConnectionId),
    ConnectionRemoved(ConnectionId),
    PassCompleted,
    ConnectionPanicked(ConnectionId),
}

impl EngineEvent {
    /// Name used by feature files.
    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Self::ThreadStarted(_) => "thread started",
            Self::ThreadStopped(_) => "thread stopped",
            Self::ConnectionAdded(_) => "connection added",
            Self::ConnectionRemoved(_) => "connection removed",
            Self::PassCompleted => "pass completed",
            Self::ConnectionPanicked(_) => "connection panicked",
        }
    }
}

/// Records dispatcher events for assertions.
#[derive(Debug, Default)]
pub(crate) struct RecordingReporter {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingReporter {
    pub(crate) fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .expect("reporter mutex poisoned")
            .clone()
    }

    fn record(&self, event: EngineEvent) {
        self.events
            .lock()
            .expect("reporter mutex poisoned")
            .push(event);
    }
}

impl DispatchReporter for RecordingReporter {
    fn thread_started(&self, name: &str) {
        self.record(EngineEvent::ThreadStarted(name.to_owned()));
    }

    fn thread_stopped(&self, name: &str, _passes: u64) {
        self.record(EngineEvent::ThreadStopped(name.to_owned()));
    }

    fn connection_added(&self, id: ConnectionId) {
        self.record(EngineEvent::ConnectionAdded(id));
    }

    fn connection_removed(&self, id: ConnectionId) {
        self.record(EngineEvent::ConnectionRemoved(id));
    }

    fn pass_completed(&self, _summary: &PassSummary) {
        self.record(EngineEvent::PassCompleted);
    }

    fn connection_panicked(&self, id: ConnectionId, _message: &str) {
        self.record(EngineEvent::ConnectionPanicked(id));
    }
}

/// Polls `check` until it holds or five seconds pass.
pub(crate) fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}
