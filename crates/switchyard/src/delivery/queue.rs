//! Per-thread FIFO of handler invocations.

use std::cell::Cell;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use super::Job;

struct LocalQueue {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
}

thread_local! {
    static LOCAL_QUEUE: LocalQueue = {
        let (sender, receiver) = unbounded();
        LocalQueue { sender, receiver }
    };
    static PUMPING: Cell<bool> = const { Cell::new(false) };
}

/// Send side of another thread's delivery queue.
#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    sender: Sender<Job>,
    thread: ThreadId,
}

impl DeliveryTarget {
    /// Thread that runs deliveries sent to this target.
    #[must_use]
    pub const fn thread_id(&self) -> ThreadId {
        self.thread
    }

    /// Whether the calling thread owns this target.
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Queues `job`, handing it back when the owning thread has exited.
    pub(super) fn push(&self, job: Job) -> Result<(), Job> {
        self.sender.send(job).map_err(|error| error.into_inner())
    }
}

impl PartialEq for DeliveryTarget {
    fn eq(&self, other: &Self) -> bool {
        self.thread == other.thread && self.sender.same_channel(&other.sender)
    }
}

impl Eq for DeliveryTarget {}

/// Operations on the calling thread's delivery queue.
///
/// A thread that wants handlers to run on it obtains a target with
/// [`DeliveryQueue::target`], registers handlers with that target and then
/// periodically pumps. Handlers queued for a thread that never pumps are
/// delayed indefinitely; the dispatch thread never waits for them.
#[derive(Debug)]
pub struct DeliveryQueue;

impl DeliveryQueue {
    /// Target that queues deliveries to the calling thread.
    #[must_use]
    pub fn target() -> DeliveryTarget {
        LOCAL_QUEUE.with(|queue| DeliveryTarget {
            sender: queue.sender.clone(),
            thread: thread::current().id(),
        })
    }

    /// Number of deliveries waiting on the calling thread.
    #[must_use]
    pub fn pending() -> usize {
        LOCAL_QUEUE.with(|queue| queue.receiver.len())
    }

    /// Runs every queued delivery and returns how many ran.
    ///
    /// Deliveries queued while pumping run in the same call. A pump started
    /// from inside a delivery returns zero without running anything.
    #[must_use = "the count shows whether any delivery ran"]
    pub fn pump() -> usize {
        with_pump(|receiver| run_ready(receiver))
    }

    /// Waits up to `timeout` for work, then runs everything queued.
    #[must_use = "the count shows whether any delivery ran"]
    pub fn pump_for(timeout: Duration) -> usize {
        with_pump(|receiver| match receiver.recv_timeout(timeout) {
            Ok(job) => {
                job();
                1 + run_ready(receiver)
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => 0,
        })
    }

    /// Pumps until `done` returns `true` or `deadline` passes.
    ///
    /// Returns the final value of `done`.
    pub fn pump_until<F>(deadline: Instant, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        with_pump(|receiver| loop {
            run_ready(receiver);
            if done() {
                return true;
            }
            match receiver.recv_deadline(deadline) {
                Ok(job) => job(),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return done(),
            }
        })
    }
}

fn run_ready(receiver: &Receiver<Job>) -> usize {
    let mut ran = 0;
    while let Ok(job) = receiver.try_recv() {
        job();
        ran += 1;
    }
    ran
}

/// Runs `body` against the local queue unless a pump is already active on
/// this thread.
fn with_pump<T: Default>(body: impl FnOnce(&Receiver<Job>) -> T) -> T {
    if PUMPING.with(|active| active.replace(true)) {
        return T::default();
    }
    let _reset = PumpGuard;
    // The receiver is cloned out of the thread-local so deliveries may use
    // the queue again without re-entering `with`.
    let receiver = LOCAL_QUEUE.with(|queue| queue.receiver.clone());
    body(&receiver)
}

struct PumpGuard;

impl Drop for PumpGuard {
    fn drop(&mut self) {
        PUMPING.with(|active| active.set(false));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::rstest;

    use super::*;

    #[rstest]
    fn jobs_run_in_fifo_order_on_the_owner() {
        let target = DeliveryQueue::target();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let producer = {
            let target = target.clone();
            let order = Arc::clone(&order);
            thread::spawn(move || {
                for index in 0..3 {
                    let order = Arc::clone(&order);
                    let job: Job = Box::new(move || {
                        order.lock().expect("order lock").push((index, thread::current().id()));
                    });
                    assert!(target.push(job).is_ok());
                }
            })
        };
        producer.join().expect("producer thread");

        assert_eq!(DeliveryQueue::pending(), 3);
        assert_eq!(DeliveryQueue::pump(), 3);
        let recorded = order.lock().expect("order lock").clone();
        let me = thread::current().id();
        assert_eq!(recorded, vec![(0, me), (1, me), (2, me)]);
    }

    #[rstest]
    fn nested_pump_runs_nothing() {
        let target = DeliveryQueue::target();
        let nested = Arc::new(AtomicUsize::new(usize::MAX));
        let observed = Arc::clone(&nested);
        let job: Job = Box::new(move || observed.store(DeliveryQueue::pump(), Ordering::SeqCst));
        assert!(target.push(job).is_ok());
        let follow_up: Job = Box::new(|| {});
        assert!(target.push(follow_up).is_ok());

        assert_eq!(DeliveryQueue::pump(), 2);
        assert_eq!(nested.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    fn pump_for_times_out_without_work() {
        let started = Instant::now();
        assert_eq!(DeliveryQueue::pump_for(Duration::from_millis(20)), 0);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[rstest]
    fn pump_until_stops_when_condition_holds() {
        let target = DeliveryQueue::target();
        let counter = Arc::new(AtomicUsize::new(0));
        let producer = {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                let job: Job = Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
                thread::sleep(Duration::from_millis(10));
                assert!(target.push(job).is_ok());
            })
        };
        let done = DeliveryQueue::pump_until(Instant::now() + Duration::from_secs(2), || {
            counter.load(Ordering::SeqCst) == 1
        });
        producer.join().expect("producer thread");
        assert!(done);
    }

    #[rstest]
    fn push_to_exited_thread_returns_the_job() {
        let target = thread::spawn(DeliveryQueue::target)
            .join()
            .expect("target thread");
        let job: Job = Box::new(|| {});
        assert!(target.push(job).is_err());
    }
}
