//! Capability interface the dispatch engine consumes from a bus connection.
//!
//! The engine never inspects messages. It only needs to know which file
//! descriptors a connection wants polled, when its next timeout falls due,
//! and whether it has buffered data left to dispatch. Any transport that can
//! answer those questions implements [`BusConnection`] and can be attached
//! to a [`Dispatcher`](crate::Dispatcher).

use std::fmt;
use std::ops::BitOr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

/// Readiness reported by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchStatus {
    /// Nothing is buffered in either direction.
    Idle,
    /// Incoming messages are buffered and waiting to be dispatched.
    DataRemains,
    /// Outgoing data is queued and waiting for the socket to accept it.
    NeedWrite,
}

/// Interest or readiness mask for a watched file descriptor.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    /// No interest.
    pub const NONE: Self = Self(0);
    /// Data can be read.
    pub const READABLE: Self = Self(0b0001);
    /// Data can be written.
    pub const WRITABLE: Self = Self(0b0010);
    /// The descriptor reported an error condition.
    pub const ERROR: Self = Self(0b0100);
    /// The peer hung up.
    pub const HANGUP: Self = Self(0b1000);

    /// Returns `true` when every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` when readable interest or readiness is set.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns `true` when writable interest or readiness is set.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Returns `true` when an error or hang-up was reported.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        self.0 & (Self::ERROR.0 | Self::HANGUP.0) != 0
    }

    /// Returns `true` when no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READABLE, "READABLE"),
            (Self::WRITABLE, "WRITABLE"),
            (Self::ERROR, "ERROR"),
            (Self::HANGUP, "HANGUP"),
        ];
        let mut set = formatter.debug_set();
        for (flag, name) in names {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// File descriptor a connection wants included in the engine's wait.
///
/// The descriptor is shared so that a snapshot taken by the dispatch thread
/// keeps it open for the duration of the wait, even if the connection drops
/// its own copy concurrently.
#[derive(Debug, Clone)]
pub struct Watch {
    fd: Arc<OwnedFd>,
    interest: Interest,
    enabled: bool,
}

impl Watch {
    /// Builds an enabled watch.
    #[must_use]
    pub const fn new(fd: Arc<OwnedFd>, interest: Interest) -> Self {
        Self {
            fd,
            interest,
            enabled: true,
        }
    }

    /// Marks the watch as temporarily disabled.
    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Borrowed descriptor for polling.
    #[must_use]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Raw descriptor number, reported back in readiness events.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Requested readiness.
    #[must_use]
    pub const fn interest(&self) -> Interest {
        self.interest
    }

    /// Whether the engine should poll this watch.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled && !self.interest.is_empty()
    }
}

/// Identifier of a connection-level timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeoutId(pub u64);

/// Deadline a connection wants the engine to honour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    id: TimeoutId,
    deadline: Instant,
    recurring: bool,
}

impl Timeout {
    /// Builds a timeout that fires once.
    #[must_use]
    pub const fn once(id: TimeoutId, deadline: Instant) -> Self {
        Self {
            id,
            deadline,
            recurring: false,
        }
    }

    /// Builds a timeout the connection re-arms after each expiry.
    #[must_use]
    pub const fn recurring(id: TimeoutId, deadline: Instant) -> Self {
        Self {
            id,
            deadline,
            recurring: true,
        }
    }

    /// Identifier passed back through [`BusConnection::handle_timeout`].
    #[must_use]
    pub const fn id(&self) -> TimeoutId {
        self.id
    }

    /// Instant at which the timeout falls due.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether the connection re-arms the timeout after it fires.
    #[must_use]
    pub const fn is_recurring(&self) -> bool {
        self.recurring
    }
}

/// Callback invoked when a connection's dispatch status changes.
pub type StatusCallback = Arc<dyn Fn(DispatchStatus) + Send + Sync>;

/// Callback invoked when a connection has new work for the engine, such as
/// outgoing data queued from an application thread.
pub type WakeupCallback = Arc<dyn Fn() + Send + Sync>;

/// Operations the dispatch engine requires from a connection.
///
/// Implementations must tolerate concurrent calls: the dispatch thread drains
/// inbound traffic while application threads queue outbound messages on the
/// same connection.
pub trait BusConnection: Send + Sync {
    /// Current dispatch status.
    fn dispatch_status(&self) -> DispatchStatus;

    /// Installs or clears the status-changed callback.
    fn set_dispatch_status_changed_callback(&self, callback: Option<StatusCallback>);

    /// Installs or clears the wakeup callback.
    fn set_wakeup_callback(&self, callback: Option<WakeupCallback>);

    /// Descriptors to include in the next wait.
    fn watches(&self) -> Vec<Watch>;

    /// Deadlines to honour in the next wait.
    fn timeouts(&self) -> Vec<Timeout>;

    /// Reports readiness on one of the connection's watches.
    fn handle_watch_event(&self, fd: RawFd, readiness: Interest);

    /// Reports that a timeout reached its deadline.
    fn handle_timeout(&self, id: TimeoutId);

    /// Dispatches at most one batch of buffered messages.
    fn dispatch_one_batch(&self) -> DispatchStatus;
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn interest_combines_flags() {
        let interest = Interest::READABLE | Interest::WRITABLE;
        assert!(interest.is_readable());
        assert!(interest.is_writable());
        assert!(!interest.is_failure());
        assert!(interest.contains(Interest::READABLE));
        assert!(!Interest::READABLE.contains(interest));
    }

    #[rstest]
    fn empty_interest_disables_watch() {
        let (left, _right) = std::os::unix::net::UnixStream::pair().expect("socket pair");
        let fd = Arc::new(OwnedFd::from(left));
        assert!(!Watch::new(Arc::clone(&fd), Interest::NONE).is_enabled());
        assert!(!Watch::new(Arc::clone(&fd), Interest::READABLE).disabled().is_enabled());
        assert!(Watch::new(fd, Interest::READABLE).is_enabled());
    }

    #[rstest]
    fn debug_lists_set_flags() {
        let rendered = format!("{:?}", Interest::READABLE | Interest::HANGUP);
        assert_eq!(rendered, "{READABLE, HANGUP}");
    }
}
