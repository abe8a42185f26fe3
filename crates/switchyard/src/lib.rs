//! Connection-multiplexing dispatch engine for message-bus clients.
//!
//! A [`Dispatcher`] drives any number of bus connections from one background
//! thread. The thread waits in a single multiplexed `poll(2)` over every
//! connection's socket watches plus a [`WakeupChannel`], and services each
//! ready connection in turn: watch events first, then expired timeouts, then
//! buffered messages in bounded batches. Any thread may signal the wakeup
//! channel, which is how new connections, fresh outbound data and stop
//! requests reach a dispatcher that is blocked in its wait.
//!
//! Handlers attached to a connection carry a [`CallingThread`]. Handlers for
//! the dispatcher run inline on the dispatch thread; handlers for a
//! designated thread are queued on that thread's [`DeliveryQueue`] and run
//! when it pumps. Because queueing never blocks, two peers that answer each
//! other's signals with synchronous calls cannot deadlock the engine.
//!
//! [`StreamConnection`] is the bundled connection type. It speaks a
//! JSON-lines rendition of bus messages over Unix-domain or TCP streams and
//! resolves addresses through [`switchyard_config`]. Any other transport can
//! join a dispatcher by implementing [`BusConnection`].

mod connection;
mod delivery;
mod dispatcher;
mod message;
mod sys;
mod telemetry;
mod transport;
mod wakeup;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use connection::{
    BusConnection, DispatchStatus, Interest, StatusCallback, Timeout, TimeoutId, WakeupCallback,
    Watch,
};
pub use delivery::{CallingThread, DeliveryQueue, DeliveryTarget, deliver};
pub use dispatcher::{
    BusTarget, ConnectionId, DispatchError, DispatchReporter, Dispatcher, EngineState,
    PassSummary, StopHandle, StructuredDispatchReporter,
};
pub use message::{
    DISCONNECTED_ERROR, FAILED_ERROR, MatchRule, Message, MessageKind, NO_REPLY_ERROR,
    UNKNOWN_METHOD_ERROR,
};
pub use telemetry::{TelemetryError, TelemetryHandle, initialise as initialise_telemetry};
pub use transport::{
    ConnectionOptions, HandlerId, MAX_FRAME_BYTES, MethodError, MethodHandler, ReplyCallback,
    SignalHandler, StreamConnection, TransportError,
};
pub use wakeup::{WakeupChannel, WakeupSignal};

pub use switchyard_config::{
    BusAddress, BusEndpoint, BusType, BusTypeError, Config, ConfigError, DispatcherConfig,
    LogFormat,
};

/// Locks `mutex`, recovering the data if a panicking holder poisoned it.
///
/// Handler panics are contained per connection, so shared state must stay
/// usable afterwards.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests;
