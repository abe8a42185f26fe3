//! Routing of handler invocations to the thread that should run them.
//!
//! Each handler is tagged with a [`CallingThread`] when it is registered.
//! Handlers tagged [`CallingThread::Dispatcher`] run inline on the dispatch
//! thread while it drains the connection. Handlers tagged with a designated
//! thread are queued on that thread's [`DeliveryQueue`] and run when it
//! pumps. Queueing never blocks, so a handler that replies synchronously to
//! a peer cannot deadlock the dispatch thread.

mod queue;

use tracing::warn;

pub use self::queue::{DeliveryQueue, DeliveryTarget};

pub(crate) const DELIVERY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::delivery");

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Thread on which a handler runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CallingThread {
    /// Inline on the dispatch thread.
    #[default]
    Dispatcher,
    /// Queued on a designated thread's delivery queue.
    Designated(DeliveryTarget),
}

impl CallingThread {
    /// Designates the calling thread.
    #[must_use]
    pub fn current() -> Self {
        Self::Designated(DeliveryQueue::target())
    }
}

/// Runs `job` inline or queues it, according to `calling_thread`.
///
/// Never blocks. A job for a thread that has exited is dropped with a
/// warning.
pub fn deliver(calling_thread: &CallingThread, job: impl FnOnce() + Send + 'static) {
    match calling_thread {
        CallingThread::Dispatcher => job(),
        CallingThread::Designated(target) => {
            if target.push(Box::new(job)).is_err() {
                warn!(
                    target: DELIVERY_TARGET,
                    thread = ?target.thread_id(),
                    "designated thread has exited; dropping delivery"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use rstest::rstest;

    use super::*;

    #[rstest]
    fn dispatcher_jobs_run_inline() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        deliver(&CallingThread::Dispatcher, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    fn designated_jobs_wait_for_a_pump() {
        let ran = Arc::new(AtomicUsize::new(0));
        let calling_thread = CallingThread::current();
        let counter = Arc::clone(&ran);
        thread::spawn(move || {
            deliver(&calling_thread, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        })
        .join()
        .expect("delivering thread");

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(DeliveryQueue::pump(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    fn jobs_for_exited_threads_are_dropped() {
        let target = thread::spawn(CallingThread::current)
            .join()
            .expect("target thread");
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        deliver(&target, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
