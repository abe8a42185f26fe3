//! Dispatch engine shared by many bus connections.
//!
//! A [`Dispatcher`] owns one background thread. The thread blocks in a
//! single `poll(2)` over the wakeup channel and every registered
//! connection's watches, then walks the connections in registration order.
//! Each connection handles its ready I/O and expired timeouts and then
//! dispatches buffered messages, at most `dispatch_loop_limit` batches per
//! pass, so a chatty connection cannot starve the rest.
//!
//! Connections never hold a reference to the dispatcher. The callbacks it
//! installs capture only a [`WakeupSignal`](crate::WakeupSignal), so a
//! connection can outlive the engine and vice versa.

mod errors;
mod pass;
mod poll_set;
mod registry;
mod reporter;
mod thread;


use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{Builder, JoinHandle};

use strum::Display;
use tracing::{debug, warn};

use switchyard_config::{BusAddress, BusEndpoint, BusType, DispatcherConfig};

use crate::connection::{BusConnection, DispatchStatus};
use crate::lock;
use crate::transport::{ConnectionOptions, StreamConnection};
use crate::wakeup::{WakeupChannel, WakeupSignal};

pub use self::errors::DispatchError;
pub use self::registry::ConnectionId;
pub use self::reporter::{DispatchReporter, PassSummary, StructuredDispatchReporter};

use self::registry::{Entry, Registry};

pub(crate) const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatch");

/// Lifecycle of the dispatch thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EngineState {
    /// No dispatch thread is running.
    Stopped,
    /// The thread has been spawned but has not entered its loop yet.
    Starting,
    /// The thread is waiting for or servicing connections.
    Running,
    /// A stop was requested; the thread exits after its current pass.
    StopRequested,
}

impl EngineState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::StopRequested => 3,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::StopRequested,
            _ => Self::Stopped,
        }
    }
}

/// Where [`Dispatcher::create_connection`] should connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusTarget {
    /// An explicit address.
    Address(BusAddress),
    /// A well-known bus resolved from the environment.
    Bus(BusType),
}

impl From<BusAddress> for BusTarget {
    fn from(address: BusAddress) -> Self {
        Self::Address(address)
    }
}

impl From<BusEndpoint> for BusTarget {
    fn from(endpoint: BusEndpoint) -> Self {
        Self::Address(BusAddress::single(endpoint))
    }
}

impl From<BusType> for BusTarget {
    fn from(bus: BusType) -> Self {
        Self::Bus(bus)
    }
}

impl FromStr for BusTarget {
    type Err = DispatchError;

    /// Accepts a well-known bus name (`session`, `system`, `starter`) or an
    /// address string such as `unix:path=/run/bus;tcp:host=localhost,port=7`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if let Ok(bus) = raw.trim().parse::<BusType>() {
            return Ok(Self::Bus(bus));
        }
        Ok(Self::Address(raw.parse::<BusAddress>()?))
    }
}

/// State shared between the dispatcher handle and its thread.
pub(crate) struct Shared {
    config: DispatcherConfig,
    registry: Mutex<Registry>,
    wakeup: WakeupChannel,
    running: AtomicBool,
    stop_requested: AtomicBool,
    state: AtomicU8,
    reporter: Arc<dyn DispatchReporter>,
}

impl Shared {
    fn snapshot(&self) -> Vec<Entry> {
        lock(&self.registry).snapshot()
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    fn advance_state(&self, from: EngineState, to: EngineState) {
        // Loses the race only to a stop request, which must stay visible.
        let _outcome = self.state.compare_exchange(
            from.to_u8(),
            to.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        if self.running.load(Ordering::Acquire) {
            self.set_state(EngineState::StopRequested);
        }
        self.wakeup.signal();
    }

    fn mark_stopped(&self) {
        self.running.store(false, Ordering::Release);
        self.set_state(EngineState::Stopped);
    }
}

/// Connection-multiplexing dispatch engine.
///
/// Every method may be called from any thread. Calls made from the dispatch
/// thread itself, for example from a handler running inline, never block on
/// the thread: [`Dispatcher::stop`] is queued and [`Dispatcher::start`] is a
/// no-op.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use switchyard::{Dispatcher, StreamConnection};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dispatcher = Dispatcher::create(true)?;
/// let (left, right) = StreamConnection::pair()?;
/// dispatcher.add_connection(Arc::new(left))?;
/// dispatcher.add_connection(Arc::new(right))?;
/// dispatcher.stop()?;
/// # Ok(())
/// # }
/// ```
pub struct Dispatcher {
    shared: Arc<Shared>,
    lifecycle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Builds a dispatcher with default tuning, starting the dispatch thread
    /// when `autostart` is set.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Wakeup`] when the wakeup channel cannot be
    /// created, or [`DispatchError::Spawn`] when the thread cannot be spawned.
    pub fn create(autostart: bool) -> Result<Self, DispatchError> {
        Self::with_config(DispatcherConfig::default().with_autostart(autostart))
    }

    /// Builds a dispatcher from explicit configuration.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::create`].
    pub fn with_config(config: DispatcherConfig) -> Result<Self, DispatchError> {
        Self::with_reporter(config, Arc::new(StructuredDispatchReporter::new()))
    }

    /// Builds a dispatcher that reports lifecycle events to `reporter`.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::create`].
    pub fn with_reporter(
        config: DispatcherConfig,
        reporter: Arc<dyn DispatchReporter>,
    ) -> Result<Self, DispatchError> {
        let wakeup = WakeupChannel::new().map_err(|source| DispatchError::Wakeup { source })?;
        let autostart = config.autostart();
        let dispatcher = Self {
            shared: Arc::new(Shared {
                config,
                registry: Mutex::new(Registry::default()),
                wakeup,
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                state: AtomicU8::new(EngineState::Stopped.to_u8()),
                reporter,
            }),
            lifecycle: Mutex::new(None),
        };
        if autostart {
            dispatcher.start()?;
        }
        Ok(dispatcher)
    }

    /// Tuning the dispatcher was built with.
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    /// Spawns the dispatch thread unless it is already running.
    ///
    /// A thread that exited after a queued stop is joined first.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Spawn`] when the thread cannot be spawned,
    /// leaving the engine stopped, or [`DispatchError::ThreadPanic`] when the
    /// previous thread panicked.
    pub fn start(&self) -> Result<(), DispatchError> {
        if thread::is_dispatch_thread(&self.shared) {
            return Ok(());
        }
        let mut lifecycle = lock(&self.lifecycle);
        if self.shared.running.load(Ordering::Acquire) && !self.shared.is_stop_requested() {
            return Ok(());
        }
        if let Some(previous) = lifecycle.take() {
            join(previous)?;
        }

        self.shared.stop_requested.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        self.shared.set_state(EngineState::Starting);
        let shared = Arc::clone(&self.shared);
        let name = self.shared.config.thread_name().to_owned();
        match Builder::new()
            .name(name.clone())
            .spawn(move || thread::run(&shared))
        {
            Ok(handle) => {
                *lifecycle = Some(handle);
                Ok(())
            }
            Err(source) => {
                self.shared.mark_stopped();
                Err(DispatchError::spawn(&name, source))
            }
        }
    }

    /// Stops the dispatch thread and waits for it to exit.
    ///
    /// Idempotent. Concurrent callers all return once the thread has been
    /// joined, which happens exactly once. Called from the dispatch thread,
    /// the stop is queued instead: the thread exits after its current pass
    /// and is joined by the next `start`, `stop` or drop.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ThreadPanic`] when the thread panicked.
    pub fn stop(&self) -> Result<(), DispatchError> {
        if thread::is_dispatch_thread(&self.shared) {
            debug!(target: DISPATCH_TARGET, "stop queued from the dispatch thread");
            self.shared.request_stop();
            return Ok(());
        }
        let mut lifecycle = lock(&self.lifecycle);
        let Some(handle) = lifecycle.take() else {
            return Ok(());
        };
        self.shared.request_stop();
        let joined = join(handle);
        self.shared.mark_stopped();
        joined
    }

    /// Returns a handle that can request a stop without keeping the
    /// dispatcher alive.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Whether the dispatch thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        lock(&self.shared.registry).len()
    }

    /// Attaches a connection and wakes the dispatch thread.
    ///
    /// Connections added while the engine is stopped are serviced once it
    /// starts.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::AlreadyRegistered`] when the same handle is
    /// already attached; nothing changes in that case.
    pub fn add_connection(
        &self,
        connection: Arc<dyn BusConnection>,
    ) -> Result<ConnectionId, DispatchError> {
        let added = {
            let mut registry = lock(&self.shared.registry);
            let id = registry.insert(Arc::clone(&connection))?;
            install_callbacks(connection.as_ref(), &self.shared.wakeup.signaller());
            id
        };
        self.shared.reporter.connection_added(added);
        self.shared.wakeup.signal();
        Ok(added)
    }

    /// Detaches a connection and clears the callbacks the dispatcher
    /// installed on it.
    ///
    /// A pass already in progress makes no further calls into the
    /// connection, although a call already executing runs to completion.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NotRegistered`] for unknown handles.
    pub fn remove_connection<C>(&self, connection: &Arc<C>) -> Result<ConnectionId, DispatchError>
    where
        C: BusConnection + ?Sized,
    {
        let removed = lock(&self.shared.registry).remove(connection)?;
        self.shared.reporter.connection_removed(removed);
        self.shared.wakeup.signal();
        Ok(removed)
    }

    /// Connects to `target`, attaches the connection and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Resolve`] when a bus type has no address,
    /// [`DispatchError::Connect`] when no address alternative accepts the
    /// connection.
    pub fn create_connection(
        &self,
        target: impl Into<BusTarget>,
    ) -> Result<Arc<StreamConnection>, DispatchError> {
        let address = match target.into() {
            BusTarget::Address(address) => address,
            BusTarget::Bus(bus) => bus.resolve()?,
        };
        let options = ConnectionOptions::from(&self.shared.config);
        let connection = StreamConnection::connect(&address, options)
            .map(Arc::new)
            .map_err(|source| DispatchError::connect(&address, source))?;
        self.add_connection(Arc::clone(&connection) as Arc<dyn BusConnection>)?;
        Ok(connection)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Dispatcher")
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            warn!(target: DISPATCH_TARGET, error = %error, "dispatch thread failed during shutdown");
        }
        let removed = lock(&self.shared.registry).clear();
        for id in removed {
            self.shared.reporter.connection_removed(id);
        }
    }
}

/// Requests a stop from anywhere, including handlers, without owning the
/// dispatcher.
#[derive(Debug, Clone)]
pub struct StopHandle {
    shared: Weak<Shared>,
}

impl StopHandle {
    /// Queues a stop. Returns `false` when the dispatcher no longer exists.
    ///
    /// The dispatch thread exits after its current pass; joining it is left
    /// to the dispatcher.
    pub fn request_stop(&self) -> bool {
        self.shared.upgrade().is_some_and(|shared| {
            shared.request_stop();
            true
        })
    }
}

fn install_callbacks(connection: &dyn BusConnection, signal: &WakeupSignal) {
    let on_status = signal.clone();
    connection.set_dispatch_status_changed_callback(Some(Arc::new(move |status| {
        if status != DispatchStatus::Idle {
            on_status.signal();
        }
    })));
    let on_wakeup = signal.clone();
    connection.set_wakeup_callback(Some(Arc::new(move || on_wakeup.signal())));
}

fn join(handle: JoinHandle<()>) -> Result<(), DispatchError> {
    handle.join().map_err(|_| DispatchError::ThreadPanic)
}
