//! One round-robin pass over a registry snapshot.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::connection::DispatchStatus;

use super::poll_set::{PollPlan, Readiness};
use super::registry::Entry;
use super::reporter::{DispatchReporter, PassSummary};

/// Inputs shared by every connection in a pass.
pub(super) struct PassContext<'a> {
    pub(super) plan: &'a PollPlan,
    pub(super) readiness: &'a Readiness,
    pub(super) loop_limit: u32,
    pub(super) stop_requested: &'a AtomicBool,
    pub(super) reporter: &'a dyn DispatchReporter,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Drained {
    batches: usize,
    deferred: bool,
}

/// Services every connection in registry order.
///
/// Each connection first sees its ready watch events and expired timeouts,
/// then dispatches batches while it reports buffered data, up to the loop
/// limit. A stop request observed between batches ends the pass; the batch
/// already running always completes.
pub(super) fn run(entries: &[Entry], context: &PassContext<'_>, cycle: u64) -> PassSummary {
    let now = Instant::now();
    let mut summary = PassSummary {
        cycle,
        woken_by_signal: context.readiness.woken,
        ..PassSummary::default()
    };
    for (index, entry) in entries.iter().enumerate() {
        if context.stop_requested.load(Ordering::Acquire) {
            break;
        }
        if entry.is_retired() {
            continue;
        }
        summary.connections += 1;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            service(entry, index, context, now)
        }));
        match outcome {
            Ok(drained) => {
                summary.batches += drained.batches;
                summary.deferred += usize::from(drained.deferred);
            }
            Err(payload) => {
                context
                    .reporter
                    .connection_panicked(entry.id(), &panic_message(payload.as_ref()));
            }
        }
    }
    summary
}

fn service(entry: &Entry, index: usize, context: &PassContext<'_>, now: Instant) -> Drained {
    let connection = entry.connection();
    for (fd, ready) in context.readiness.events_for(index) {
        if entry.is_retired() {
            return Drained::default();
        }
        connection.handle_watch_event(fd, ready);
    }
    for id in context.plan.expired_for(index, now) {
        if entry.is_retired() {
            return Drained::default();
        }
        connection.handle_timeout(id);
    }
    drain(entry, context)
}

fn drain(entry: &Entry, context: &PassContext<'_>) -> Drained {
    let connection = entry.connection();
    let limit = usize::try_from(context.loop_limit).unwrap_or(usize::MAX);
    let mut drained = Drained::default();
    while connection.dispatch_status() == DispatchStatus::DataRemains {
        if entry.is_retired() || context.stop_requested.load(Ordering::Acquire) {
            break;
        }
        if limit > 0 && drained.batches >= limit {
            drained.deferred = true;
            break;
        }
        connection.dispatch_one_batch();
        drained.batches += 1;
    }
    drained
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("non-string panic payload"))
}
