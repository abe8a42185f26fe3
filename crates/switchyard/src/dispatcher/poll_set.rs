//! Multiplexed wait over the wakeup channel and every connection's watches.

use std::io;
use std::os::fd::{AsFd, RawFd};
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags};

use crate::connection::{Interest, TimeoutId, Watch};
use crate::sys::{poll_fds, poll_flags, readiness};
use crate::wakeup::WakeupChannel;

use super::registry::Entry;

/// Watches and deadlines gathered from one registry snapshot.
///
/// Indices refer to positions in the snapshot the plan was built from.
pub(super) struct PollPlan {
    watches: Vec<(usize, Watch)>,
    deadlines: Vec<(usize, TimeoutId, Instant)>,
}

/// Readiness observed by one wait.
#[derive(Debug, Default)]
pub(super) struct Readiness {
    pub(super) woken: bool,
    events: Vec<(usize, RawFd, Interest)>,
}

impl Readiness {
    /// Watch events reported for the connection at `index`.
    pub(super) fn events_for(&self, index: usize) -> impl Iterator<Item = (RawFd, Interest)> + '_ {
        self.events
            .iter()
            .filter(move |(owner, _, _)| *owner == index)
            .map(|(_, fd, ready)| (*fd, *ready))
    }
}

impl PollPlan {
    pub(super) fn collect(entries: &[Entry]) -> Self {
        let mut watches = Vec::new();
        let mut deadlines = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            let connection = entry.connection();
            watches.extend(
                connection
                    .watches()
                    .into_iter()
                    .filter(Watch::is_enabled)
                    .map(|watch| (index, watch)),
            );
            deadlines.extend(
                connection
                    .timeouts()
                    .into_iter()
                    .map(|timeout| (index, timeout.id(), timeout.deadline())),
            );
        }
        Self { watches, deadlines }
    }

    /// Earliest deadline across every connection.
    pub(super) fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().map(|(_, _, deadline)| *deadline).min()
    }

    /// Timeouts of the connection at `index` that are due at `now`.
    pub(super) fn expired_for(&self, index: usize, now: Instant) -> impl Iterator<Item = TimeoutId> + '_ {
        self.deadlines
            .iter()
            .filter(move |(owner, _, deadline)| *owner == index && *deadline <= now)
            .map(|(_, id, _)| *id)
    }

    /// Bounds the wait by the poll interval and the nearest deadline.
    pub(super) fn wait_bound(&self, interval: Duration, now: Instant) -> Duration {
        self.next_deadline().map_or(interval, |deadline| {
            interval.min(deadline.saturating_duration_since(now))
        })
    }

    /// Blocks until a watch is ready, the wakeup channel is signalled or
    /// `timeout` elapses.
    pub(super) fn wait(&self, wakeup: &WakeupChannel, timeout: Duration) -> io::Result<Readiness> {
        let mut fds = Vec::with_capacity(self.watches.len() + 1);
        fds.push(PollFd::new(wakeup.as_fd(), PollFlags::POLLIN));
        fds.extend(
            self.watches
                .iter()
                .map(|(_, watch)| PollFd::new(watch.fd(), poll_flags(watch.interest()))),
        );
        poll_fds(&mut fds, Some(timeout))?;

        let mut observed = Readiness::default();
        let mut reported = fds.iter().map(|fd| fd.revents().map_or(Interest::NONE, readiness));
        observed.woken = reported.next().is_some_and(|ready| !ready.is_empty());
        for ((owner, watch), ready) in self.watches.iter().zip(reported) {
            if !ready.is_empty() {
                observed.events.push((*owner, watch.raw_fd(), ready));
            }
        }
        Ok(observed)
    }
}
