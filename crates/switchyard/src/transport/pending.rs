//! Method calls awaiting a reply.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::connection::{Timeout, TimeoutId};
use crate::delivery::CallingThread;
use crate::message::Message;

/// Callback receiving the reply, or a synthesised error, for a call.
pub type ReplyCallback = Box<dyn FnOnce(Message) + Send>;

pub(crate) struct PendingCall {
    deadline: Instant,
    expired: bool,
    pub(crate) calling_thread: CallingThread,
    pub(crate) callback: ReplyCallback,
}

/// Outstanding calls keyed by serial.
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: BTreeMap<u32, PendingCall>,
}

impl PendingCalls {
    pub(crate) fn insert(
        &mut self,
        serial: u32,
        deadline: Instant,
        calling_thread: CallingThread,
        callback: ReplyCallback,
    ) {
        self.calls.insert(
            serial,
            PendingCall {
                deadline,
                expired: false,
                calling_thread,
                callback,
            },
        );
    }

    pub(crate) fn take(&mut self, serial: u32) -> Option<PendingCall> {
        self.calls.remove(&serial)
    }

    /// Marks the call as timed out. Returns `false` when it was already
    /// answered or already marked.
    pub(crate) fn expire(&mut self, serial: u32, now: Instant) -> bool {
        match self.calls.get_mut(&serial) {
            Some(call) if !call.expired && call.deadline <= now => {
                call.expired = true;
                true
            }
            _ => false,
        }
    }

    /// Marks every call that has not timed out yet and returns their
    /// serials.
    pub(crate) fn expire_all(&mut self) -> Vec<u32> {
        self.calls
            .iter_mut()
            .filter(|(_, call)| !call.expired)
            .map(|(serial, call)| {
                call.expired = true;
                *serial
            })
            .collect()
    }

    /// Deadlines of calls that have not timed out yet.
    pub(crate) fn timeouts(&self) -> Vec<Timeout> {
        self.calls
            .iter()
            .filter(|(_, call)| !call.expired)
            .map(|(serial, call)| Timeout::once(TimeoutId(u64::from(*serial)), call.deadline))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    fn ignore() -> ReplyCallback {
        Box::new(|_| {})
    }

    #[rstest]
    fn expired_calls_leave_the_timeout_set() {
        let now = Instant::now();
        let mut pending = PendingCalls::default();
        pending.insert(1, now, CallingThread::Dispatcher, ignore());
        pending.insert(2, now + Duration::from_secs(60), CallingThread::Dispatcher, ignore());

        assert!(pending.expire(1, now));
        assert!(!pending.expire(1, now));
        assert!(!pending.expire(2, now));

        let remaining: Vec<_> = pending.timeouts().iter().map(Timeout::id).collect();
        assert_eq!(remaining, vec![TimeoutId(2)]);
        assert_eq!(pending.len(), 2);
        assert!(pending.take(1).is_some());
        assert!(pending.take(1).is_none());
    }

    #[rstest]
    fn expire_all_skips_calls_already_timed_out() {
        let now = Instant::now();
        let mut pending = PendingCalls::default();
        pending.insert(4, now, CallingThread::Dispatcher, ignore());
        pending.insert(5, now + Duration::from_secs(60), CallingThread::Dispatcher, ignore());
        assert!(pending.expire(4, now));

        assert_eq!(pending.expire_all(), vec![5]);
        assert!(pending.expire_all().is_empty());
        assert!(pending.timeouts().is_empty());
    }
}
