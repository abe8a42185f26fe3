//! Reference bus connection over a Unix-domain or TCP stream.
//!
//! [`StreamConnection`] frames [`Message`] envelopes as JSON lines and
//! implements [`BusConnection`], so it can be driven by a
//! [`Dispatcher`](crate::Dispatcher). Reads happen only when the dispatcher
//! reports readiness; writes are attempted immediately by the sending
//! thread and the remainder is flushed once the socket becomes writable.

mod errors;
mod framing;
mod handlers;
mod pending;
mod stream;

use std::collections::VecDeque;
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, trace, warn};

use switchyard_config::{BusAddress, DispatcherConfig};

use crate::connection::{
    BusConnection, DispatchStatus, Interest, StatusCallback, Timeout, TimeoutId, Watch,
    WakeupCallback,
};
use crate::delivery::{CallingThread, deliver};
use crate::lock;
use crate::message::{
    DISCONNECTED_ERROR, MatchRule, Message, MessageKind, NO_REPLY_ERROR, UNKNOWN_METHOD_ERROR,
};
use crate::sys::wait_for;

pub use self::errors::TransportError;
pub use self::framing::MAX_FRAME_BYTES;
pub use self::handlers::{HandlerId, MethodError, MethodHandler, SignalHandler};
pub use self::pending::ReplyCallback;

use self::framing::{FrameDecoder, encode};
use self::handlers::Handlers;
use self::pending::PendingCalls;
use self::stream::ConnectionStream;

pub(crate) const TRANSPORT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");

/// Bytes read per readiness event before yielding to other connections.
const READ_BUDGET: usize = 64 * 1024;
/// Extra time a blocking call waits beyond its reply timeout for the
/// synthesised timeout error to arrive.
const REPLY_GRACE: Duration = Duration::from_secs(1);

/// Per-connection tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    batch_size: usize,
    name: Option<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&DispatcherConfig::default())
    }
}

impl From<&DispatcherConfig> for ConnectionOptions {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            batch_size: config.batch_size(),
            name: None,
        }
    }
}

impl ConnectionOptions {
    /// Sets how many messages one batch dispatches (at least one).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the name stamped as sender on outgoing messages.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Messages dispatched per batch.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Sender name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[derive(Default)]
struct Inbound {
    decoder: FrameDecoder,
    queue: VecDeque<Message>,
}

#[derive(Default)]
struct Outbound {
    frames: VecDeque<Vec<u8>>,
    offset: usize,
}

impl Outbound {
    fn pending_bytes(&self) -> usize {
        self.frames
            .iter()
            .map(Vec::len)
            .sum::<usize>()
            .saturating_sub(self.offset)
    }
}

#[derive(Default)]
struct Callbacks {
    status: Option<StatusCallback>,
    wakeup: Option<WakeupCallback>,
}

/// Socket state shared with handlers that reply from other threads.
struct Link {
    stream: ConnectionStream,
    watch_fd: Arc<OwnedFd>,
    name: Option<String>,
    inbound: Mutex<Inbound>,
    outbound: Mutex<Outbound>,
    callbacks: Mutex<Callbacks>,
    last_status: Mutex<DispatchStatus>,
    connected: AtomicBool,
    next_serial: AtomicU32,
}

impl Link {
    fn new(stream: ConnectionStream, name: Option<String>) -> Result<Self, TransportError> {
        stream.configure()?;
        let watch_fd = stream
            .as_fd()
            .try_clone_to_owned()
            .map_err(|source| TransportError::io("duplicate socket descriptor", source))?;
        Ok(Self {
            stream,
            watch_fd: Arc::new(watch_fd),
            name,
            inbound: Mutex::new(Inbound::default()),
            outbound: Mutex::new(Outbound::default()),
            callbacks: Mutex::new(Callbacks::default()),
            last_status: Mutex::new(DispatchStatus::Idle),
            connected: AtomicBool::new(true),
            next_serial: AtomicU32::new(1),
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn allocate_serial(&self) -> u32 {
        loop {
            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }

    fn status(&self) -> DispatchStatus {
        if !lock(&self.inbound).queue.is_empty() {
            return DispatchStatus::DataRemains;
        }
        if self.is_connected() && !lock(&self.outbound).frames.is_empty() {
            return DispatchStatus::NeedWrite;
        }
        DispatchStatus::Idle
    }

    /// Recomputes the status and reports a change to the dispatcher.
    fn refresh_status(&self) -> DispatchStatus {
        let status = self.status();
        let changed = {
            let mut last = lock(&self.last_status);
            let changed = *last != status;
            *last = status;
            changed
        };
        if changed {
            let callback = lock(&self.callbacks).status.clone();
            if let Some(callback) = callback {
                callback(status);
            }
        }
        status
    }

    fn wake(&self) {
        let callback = lock(&self.callbacks).wakeup.clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Queues `message` with a fresh serial and attempts to write it.
    fn send(&self, mut message: Message) -> Result<u32, TransportError> {
        let serial = self.allocate_serial();
        message.set_serial(serial);
        self.send_with_serial(message).map(|()| serial)
    }

    fn send_with_serial(&self, mut message: Message) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        if message.sender().is_none()
            && let Some(name) = &self.name
        {
            message = message.with_sender(name.clone());
        }
        let frame = encode(&message)?;
        lock(&self.outbound).frames.push_back(frame);
        let flushed = self.flush_ready();
        if flushed.is_ok() && !lock(&self.outbound).frames.is_empty() {
            self.wake();
        }
        self.refresh_status();
        flushed
    }

    /// Writes queued frames until the socket would block.
    fn flush_ready(&self) -> Result<(), TransportError> {
        let mut guard = lock(&self.outbound);
        let outbound = &mut *guard;
        while let Some(frame) = outbound.frames.front() {
            let Some(remaining) = frame.get(outbound.offset..) else {
                outbound.frames.pop_front();
                outbound.offset = 0;
                continue;
            };
            match self.stream.write(remaining) {
                Ok(0) => {
                    drop(guard);
                    self.close("peer stopped accepting data");
                    return Err(TransportError::Disconnected);
                }
                Ok(written) if written == remaining.len() => {
                    outbound.frames.pop_front();
                    outbound.offset = 0;
                }
                Ok(written) => outbound.offset += written,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    drop(guard);
                    self.close("write failed");
                    return Err(TransportError::io("write", error));
                }
            }
        }
        Ok(())
    }

    /// Reads what the socket holds, up to the per-event budget.
    fn read_ready(&self) -> Result<usize, TransportError> {
        let mut chunk = [0_u8; 4096];
        let mut total = 0;
        while total < READ_BUDGET {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(read) => {
                    total += read;
                    let bytes = chunk.get(..read).unwrap_or_default();
                    let mut inbound = lock(&self.inbound);
                    let messages = inbound.decoder.push(bytes)?;
                    inbound.queue.extend(messages);
                }
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(error) => return Err(TransportError::io("read", error)),
            }
        }
        Ok(total)
    }

    /// Marks the link closed and releases the socket.
    ///
    /// Returns `true` for the call that performed the close.
    fn close(&self, reason: &str) -> bool {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.stream.shutdown();
        let dropped = {
            let mut outbound = lock(&self.outbound);
            let pending = outbound.pending_bytes();
            outbound.frames.clear();
            outbound.offset = 0;
            pending
        };
        debug!(
            target: TRANSPORT_TARGET,
            reason,
            dropped_bytes = dropped,
            "connection closed"
        );
        self.wake();
        true
    }
}

/// Bus connection over a byte stream.
///
/// All methods take `&self` and are safe to call from any thread while the
/// dispatcher drains the connection.
pub struct StreamConnection {
    link: Arc<Link>,
    handlers: Mutex<Handlers>,
    pending: Mutex<PendingCalls>,
    dispatching: Mutex<()>,
    options: ConnectionOptions,
}

impl StreamConnection {
    /// Connects to the first reachable alternative of `address`.
    ///
    /// # Errors
    ///
    /// Returns the failure of the last alternative when none connects.
    pub fn connect(address: &BusAddress, options: ConnectionOptions) -> Result<Self, TransportError> {
        let mut last_error = TransportError::Disconnected;
        for endpoint in address.endpoints() {
            match ConnectionStream::connect(endpoint) {
                Ok(stream) => {
                    debug!(target: TRANSPORT_TARGET, endpoint = %endpoint, "connected");
                    return Self::from_stream(stream, options);
                }
                Err(error) => {
                    debug!(
                        target: TRANSPORT_TARGET,
                        endpoint = %endpoint,
                        error = %error,
                        "endpoint unreachable"
                    );
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    /// Builds a connected pair of peers.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when the socket pair cannot be created.
    pub fn pair() -> Result<(Self, Self), TransportError> {
        let (left, right) =
            UnixStream::pair().map_err(|source| TransportError::io("socket pair", source))?;
        Ok((
            Self::from_unix(left, ConnectionOptions::default())?,
            Self::from_unix(right, ConnectionOptions::default())?,
        ))
    }

    /// Wraps an already connected Unix-domain stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when the socket cannot be configured.
    pub fn from_unix(stream: UnixStream, options: ConnectionOptions) -> Result<Self, TransportError> {
        Self::from_stream(ConnectionStream::Unix(stream), options)
    }

    /// Wraps an already connected TCP stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] when the socket cannot be configured.
    pub fn from_tcp(stream: TcpStream, options: ConnectionOptions) -> Result<Self, TransportError> {
        Self::from_stream(ConnectionStream::Tcp(stream), options)
    }

    fn from_stream(stream: ConnectionStream, options: ConnectionOptions) -> Result<Self, TransportError> {
        Ok(Self {
            link: Arc::new(Link::new(stream, options.name.clone())?),
            handlers: Mutex::new(Handlers::default()),
            pending: Mutex::new(PendingCalls::default()),
            dispatching: Mutex::new(()),
            options,
        })
    }

    /// Options the connection was built with.
    #[must_use]
    pub const fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Whether the stream is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Queues `message` and returns the serial assigned to it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Disconnected`] once the stream is closed, or
    /// the encoding or write failure.
    pub fn send(&self, message: Message) -> Result<u32, TransportError> {
        let sent = self.link.send(message);
        self.fail_pending_if_closed();
        sent
    }

    /// Emits a signal from `path`.
    ///
    /// # Errors
    ///
    /// See [`StreamConnection::send`].
    pub fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        body: Value,
    ) -> Result<u32, TransportError> {
        self.send(Message::signal(path, interface, member).with_body(body))
    }

    /// Sends a method call and routes its reply to `callback`.
    ///
    /// The callback runs on `calling_thread` with the reply, or with a
    /// synthesised error reply when `timeout` elapses first or the
    /// connection closes.
    ///
    /// # Errors
    ///
    /// See [`StreamConnection::send`]. The callback is dropped unrun when
    /// sending fails.
    pub fn call<F>(
        &self,
        mut message: Message,
        timeout: Duration,
        calling_thread: CallingThread,
        callback: F,
    ) -> Result<u32, TransportError>
    where
        F: FnOnce(Message) + Send + 'static,
    {
        let serial = self.link.allocate_serial();
        message.set_serial(serial);
        lock(&self.pending).insert(
            serial,
            Instant::now() + timeout,
            calling_thread,
            Box::new(callback),
        );
        if let Err(error) = self.link.send_with_serial(message) {
            drop(lock(&self.pending).take(serial));
            self.fail_pending_if_closed();
            return Err(error);
        }
        // The dispatcher has to add the new deadline to its wait.
        self.link.wake();
        Ok(serial)
    }

    /// Sends a method call and blocks until its reply arrives.
    ///
    /// The reply is routed by the dispatch thread, so this must not be
    /// called from a handler running on it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ReplyTimeout`] when nothing arrives,
    /// otherwise see [`StreamConnection::send`]. Error replies are returned
    /// as messages.
    pub fn call_blocking(&self, message: Message, timeout: Duration) -> Result<Message, TransportError> {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let serial = self.call(message, timeout, CallingThread::Dispatcher, move |reply| {
            if sender.send(reply).is_err() {
                trace!(target: TRANSPORT_TARGET, "blocking caller gave up before its reply");
            }
        })?;
        receiver
            .recv_timeout(timeout + REPLY_GRACE)
            .map_err(|_| TransportError::ReplyTimeout { serial })
    }

    /// Registers a handler for signals matching `rule`.
    pub fn add_signal_handler<F>(
        &self,
        rule: MatchRule,
        calling_thread: CallingThread,
        handler: F,
    ) -> HandlerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        lock(&self.handlers).add_signal(rule, calling_thread, Arc::new(handler))
    }

    /// Registers a handler answering calls to `member` on `path`.
    ///
    /// With `interface` unset, calls naming any interface, or none, match.
    pub fn add_method_handler<F>(
        &self,
        path: &str,
        interface: Option<&str>,
        member: &str,
        calling_thread: CallingThread,
        handler: F,
    ) -> HandlerId
    where
        F: Fn(&Message) -> Result<Value, MethodError> + Send + Sync + 'static,
    {
        lock(&self.handlers).add_method(
            path.to_owned(),
            interface.map(str::to_owned),
            member.to_owned(),
            calling_thread,
            Arc::new(handler),
        )
    }

    /// Unregisters a handler. Returns `false` for unknown identifiers.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        lock(&self.handlers).remove(id)
    }

    /// Number of calls still waiting for a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Blocks until every queued byte is written or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::FlushTimeout`] when data remains queued,
    /// [`TransportError::Disconnected`] when the stream closes first.
    pub fn flush(&self, timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.link.flush_ready()?;
            let pending = lock(&self.link.outbound).pending_bytes();
            if pending == 0 {
                self.link.refresh_status();
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::FlushTimeout { pending });
            }
            wait_for(self.link.watch_fd.as_fd(), Interest::WRITABLE, Some(remaining))
                .map_err(|source| TransportError::io("wait for writable socket", source))?;
        }
    }

    /// Queues a synthesised error reply for every outstanding call once the
    /// link has closed.
    fn fail_pending_if_closed(&self) {
        if self.link.is_connected() {
            return;
        }
        let serials = lock(&self.pending).expire_all();
        if serials.is_empty() {
            return;
        }
        {
            let mut inbound = lock(&self.link.inbound);
            for serial in serials {
                inbound.queue.push_back(Message::local_error(
                    serial,
                    DISCONNECTED_ERROR,
                    "connection closed before the reply arrived",
                ));
            }
        }
        self.link.refresh_status();
    }

    fn route(&self, message: Message) {
        match message.kind() {
            MessageKind::MethodReturn | MessageKind::Error => self.route_reply(message),
            MessageKind::Signal => self.route_signal(&message),
            MessageKind::MethodCall => self.route_call(message),
        }
    }

    fn route_reply(&self, reply: Message) {
        let call = reply
            .reply_serial()
            .and_then(|serial| lock(&self.pending).take(serial));
        let Some(call) = call else {
            trace!(
                target: TRANSPORT_TARGET,
                reply_serial = ?reply.reply_serial(),
                "reply has no outstanding call"
            );
            return;
        };
        let callback = call.callback;
        deliver(&call.calling_thread, move || callback(reply));
    }

    fn route_signal(&self, signal: &Message) {
        let targets = lock(&self.handlers).signal_targets(signal);
        if targets.is_empty() {
            trace!(
                target: TRANSPORT_TARGET,
                member = signal.member(),
                "signal has no handler"
            );
            return;
        }
        let shared = Arc::new(signal.clone());
        for (calling_thread, handler) in targets {
            let delivered = Arc::clone(&shared);
            deliver(&calling_thread, move || handler(&delivered));
        }
    }

    fn route_call(&self, call: Message) {
        let target = lock(&self.handlers).method_target(&call);
        let Some((calling_thread, handler)) = target else {
            let text = format!(
                "no handler for {} on {}",
                call.member().unwrap_or_default(),
                call.path().unwrap_or_default()
            );
            self.reply(Message::error(&call, UNKNOWN_METHOD_ERROR, text));
            return;
        };
        let link = Arc::clone(&self.link);
        deliver(&calling_thread, move || {
            let reply = match handler(&call) {
                Ok(body) => Message::method_return(&call).with_body(body),
                Err(error) => Message::error(&call, error.name(), error.message()),
            };
            if let Err(error) = link.send(reply) {
                warn!(
                    target: TRANSPORT_TARGET,
                    error = %error,
                    "failed to send method reply"
                );
            }
        });
    }

    fn reply(&self, reply: Message) {
        if let Err(error) = self.link.send(reply) {
            warn!(
                target: TRANSPORT_TARGET,
                error = %error,
                "failed to send error reply"
            );
        }
        self.fail_pending_if_closed();
    }
}

impl BusConnection for StreamConnection {
    fn dispatch_status(&self) -> DispatchStatus {
        self.link.status()
    }

    fn set_dispatch_status_changed_callback(&self, callback: Option<StatusCallback>) {
        lock(&self.link.callbacks).status = callback;
    }

    fn set_wakeup_callback(&self, callback: Option<WakeupCallback>) {
        lock(&self.link.callbacks).wakeup = callback;
    }

    fn watches(&self) -> Vec<Watch> {
        if !self.link.is_connected() {
            return Vec::new();
        }
        let interest = if lock(&self.link.outbound).frames.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        vec![Watch::new(Arc::clone(&self.link.watch_fd), interest)]
    }

    fn timeouts(&self) -> Vec<Timeout> {
        lock(&self.pending).timeouts()
    }

    fn handle_watch_event(&self, fd: RawFd, readiness: Interest) {
        if fd != self.link.watch_fd.as_raw_fd() || !self.link.is_connected() {
            return;
        }
        if readiness.is_readable() || readiness.is_failure() {
            match self.link.read_ready() {
                Ok(read) => trace!(target: TRANSPORT_TARGET, bytes = read, "read from stream"),
                Err(TransportError::Disconnected) => {
                    self.link.close("peer closed the stream");
                }
                Err(error) => {
                    warn!(
                        target: TRANSPORT_TARGET,
                        error = %error,
                        "dropping connection after a protocol error"
                    );
                    self.link.close("protocol error");
                }
            }
        }
        if readiness.is_writable()
            && let Err(error) = self.link.flush_ready()
        {
            debug!(target: TRANSPORT_TARGET, error = %error, "flush failed");
        }
        self.fail_pending_if_closed();
        self.link.refresh_status();
    }

    fn handle_timeout(&self, id: TimeoutId) {
        let Ok(serial) = u32::try_from(id.0) else {
            return;
        };
        if !lock(&self.pending).expire(serial, Instant::now()) {
            return;
        }
        lock(&self.link.inbound).queue.push_back(Message::local_error(
            serial,
            NO_REPLY_ERROR,
            "no reply before the call timed out",
        ));
        self.link.refresh_status();
    }

    fn dispatch_one_batch(&self) -> DispatchStatus {
        let _batch = match self.dispatching.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return self.link.status(),
        };
        for _ in 0..self.options.batch_size() {
            let next = lock(&self.link.inbound).queue.pop_front();
            let Some(message) = next else {
                break;
            };
            self.route(message);
        }
        self.link.refresh_status()
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("StreamConnection")
            .field("connected", &self.is_connected())
            .field("status", &self.link.status())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.link.close("connection dropped");
    }
}
