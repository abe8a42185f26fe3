//! Body of the dispatch thread.

use std::cell::Cell;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::connection::DispatchStatus;

use super::pass::{self, PassContext};
use super::poll_set::PollPlan;
use super::registry::Entry;
use super::{DISPATCH_TARGET, EngineState, Shared};

const ERROR_BACKOFF: Duration = Duration::from_millis(50);

thread_local! {
    static ACTIVE_ENGINE: Cell<usize> = const { Cell::new(0) };
}

/// Returns `true` when called from the dispatch thread of `shared`.
pub(super) fn is_dispatch_thread(shared: &Arc<Shared>) -> bool {
    ACTIVE_ENGINE.with(|active| active.get() == Arc::as_ptr(shared).addr())
}

/// Resets engine state however the loop exits, including by panic.
struct ExitGuard<'a> {
    shared: &'a Arc<Shared>,
    name: String,
    passes: u64,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        ACTIVE_ENGINE.with(|active| active.set(0));
        self.shared.mark_stopped();
        self.shared.reporter.thread_stopped(&self.name, self.passes);
    }
}

pub(super) fn run(shared: &Arc<Shared>) {
    let mut exit = ExitGuard {
        shared,
        name: shared.config.thread_name().to_owned(),
        passes: 0,
    };
    ACTIVE_ENGINE.with(|active| active.set(Arc::as_ptr(shared).addr()));
    shared.advance_state(EngineState::Starting, EngineState::Running);
    shared.reporter.thread_started(&exit.name);

    let mut last_error = None::<io::ErrorKind>;
    while !shared.is_stop_requested() {
        let entries = shared.snapshot();
        let plan = PollPlan::collect(&entries);
        let bound = if has_backlog(&entries) {
            Duration::ZERO
        } else {
            plan.wait_bound(shared.config.max_poll_interval(), Instant::now())
        };

        let readiness = match plan.wait(&shared.wakeup, bound) {
            Ok(observed) => {
                last_error = None;
                observed
            }
            Err(error) => {
                let kind = error.kind();
                if last_error != Some(kind) {
                    warn!(
                        target: DISPATCH_TARGET,
                        error = %error,
                        "dispatch wait failed"
                    );
                }
                last_error = Some(kind);
                thread::sleep(ERROR_BACKOFF);
                continue;
            }
        };
        if readiness.woken {
            shared.wakeup.drain();
        }
        if shared.is_stop_requested() {
            break;
        }

        exit.passes += 1;
        let context = PassContext {
            plan: &plan,
            readiness: &readiness,
            loop_limit: shared.config.dispatch_loop_limit(),
            stop_requested: &shared.stop_requested,
            reporter: shared.reporter.as_ref(),
        };
        let summary = pass::run(&entries, &context, exit.passes);
        shared.reporter.pass_completed(&summary);
    }
}

fn has_backlog(entries: &[Entry]) -> bool {
    entries.iter().any(|entry| {
        !entry.is_retired() && entry.connection().dispatch_status() == DispatchStatus::DataRemains
    })
}
