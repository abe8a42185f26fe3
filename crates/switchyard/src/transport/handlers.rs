//! Signal and method handlers registered on a connection.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::delivery::CallingThread;
use crate::message::{FAILED_ERROR, MatchRule, Message};

/// Identifier returned when a handler is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "handler-{}", self.0)
    }
}

/// Failure returned by a method handler, sent back as an error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError {
    name: String,
    message: String,
}

impl MethodError {
    /// Builds an error with an explicit error name.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Builds a generic failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(FAILED_ERROR, message)
    }

    /// Error name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for MethodError {}

/// Callback for signals selected by a [`MatchRule`].
pub type SignalHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Callback answering a method call with a reply body.
pub type MethodHandler = Arc<dyn Fn(&Message) -> Result<Value, MethodError> + Send + Sync>;

struct SignalEntry {
    id: HandlerId,
    rule: MatchRule,
    calling_thread: CallingThread,
    handler: SignalHandler,
}

struct MethodEntry {
    id: HandlerId,
    path: String,
    interface: Option<String>,
    member: String,
    calling_thread: CallingThread,
    handler: MethodHandler,
}

impl MethodEntry {
    fn accepts(&self, call: &Message) -> bool {
        call.path() == Some(self.path.as_str())
            && call.member() == Some(self.member.as_str())
            && match (self.interface.as_deref(), call.interface()) {
                (Some(wanted), Some(actual)) => wanted == actual,
                _ => true,
            }
    }
}

/// Handlers of one connection, in registration order.
#[derive(Default)]
pub(crate) struct Handlers {
    signals: Vec<SignalEntry>,
    methods: Vec<MethodEntry>,
    next_id: u64,
}

impl Handlers {
    fn allocate(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }

    pub(crate) fn add_signal(
        &mut self,
        rule: MatchRule,
        calling_thread: CallingThread,
        handler: SignalHandler,
    ) -> HandlerId {
        let id = self.allocate();
        self.signals.push(SignalEntry {
            id,
            rule,
            calling_thread,
            handler,
        });
        id
    }

    pub(crate) fn add_method(
        &mut self,
        path: String,
        interface: Option<String>,
        member: String,
        calling_thread: CallingThread,
        handler: MethodHandler,
    ) -> HandlerId {
        let id = self.allocate();
        self.methods.push(MethodEntry {
            id,
            path,
            interface,
            member,
            calling_thread,
            handler,
        });
        id
    }

    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.signals.len() + self.methods.len();
        self.signals.retain(|entry| entry.id != id);
        self.methods.retain(|entry| entry.id != id);
        before != self.signals.len() + self.methods.len()
    }

    /// Signal handlers whose rule matches `signal`.
    pub(crate) fn signal_targets(&self, signal: &Message) -> Vec<(CallingThread, SignalHandler)> {
        self.signals
            .iter()
            .filter(|entry| entry.rule.matches(signal))
            .map(|entry| (entry.calling_thread.clone(), Arc::clone(&entry.handler)))
            .collect()
    }

    /// First method handler registered for `call`.
    pub(crate) fn method_target(&self, call: &Message) -> Option<(CallingThread, MethodHandler)> {
        self.methods
            .iter()
            .find(|entry| entry.accepts(call))
            .map(|entry| (entry.calling_thread.clone(), Arc::clone(&entry.handler)))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn echo() -> MethodHandler {
        Arc::new(|call: &Message| Ok(call.body().clone()))
    }

    #[rstest]
    fn method_lookup_honours_optional_interface() {
        let mut handlers = Handlers::default();
        handlers.add_method(
            String::from("/echo"),
            Some(String::from("org.example.Echo")),
            String::from("Ping"),
            CallingThread::Dispatcher,
            echo(),
        );

        let typed = Message::method_call("/echo", "org.example.Echo", "Ping");
        let other = Message::method_call("/echo", "org.example.Other", "Ping");
        assert!(handlers.method_target(&typed).is_some());
        assert!(handlers.method_target(&other).is_none());
    }

    #[rstest]
    fn removed_handlers_stop_matching() {
        let mut handlers = Handlers::default();
        let id = handlers.add_signal(
            MatchRule::signal().member("Changed"),
            CallingThread::Dispatcher,
            Arc::new(|_: &Message| {}),
        );
        let signal = Message::signal("/a", "org.example.A", "Changed");
        assert_eq!(handlers.signal_targets(&signal).len(), 1);

        assert!(handlers.remove(id));
        assert!(!handlers.remove(id));
        assert!(handlers.signal_targets(&signal).is_empty());
    }

    #[rstest]
    fn method_errors_render_name_and_text() {
        let error = MethodError::failed("no such echo");
        assert_eq!(error.to_string(), format!("{FAILED_ERROR}: no such echo"));
        let handler = echo();
        let call = Message::method_call("/echo", "org.example.Echo", "Ping").with_body(json!(3));
        assert_eq!(handler(&call), Ok(json!(3)));
    }
}
