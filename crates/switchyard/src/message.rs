//! Message envelope carried by the stream transport.
//!
//! The envelope mirrors the header fields of a message-bus message. The body
//! is an opaque JSON value; typed marshalling is left to callers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

/// Error name used when a call reaches an object with no matching handler.
pub const UNKNOWN_METHOD_ERROR: &str = "org.freedesktop.DBus.Error.UnknownMethod";
/// Error name used when a call receives no reply before its timeout.
pub const NO_REPLY_ERROR: &str = "org.freedesktop.DBus.Error.NoReply";
/// Error name used when the connection closes with a call outstanding.
pub const DISCONNECTED_ERROR: &str = "org.freedesktop.DBus.Error.Disconnected";
/// Error name used when a method handler fails without naming an error.
pub const FAILED_ERROR: &str = "org.freedesktop.DBus.Error.Failed";

/// Kind of a [`Message`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageKind {
    /// A request expecting a reply.
    MethodCall,
    /// A successful reply.
    MethodReturn,
    /// A failed reply.
    Error,
    /// A broadcast notification.
    Signal,
}

/// One message on a bus connection.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Message {
    kind: MessageKind,
    #[serde(default)]
    serial: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_serial: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    member: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    body: Value,
}

impl Message {
    const fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            serial: 0,
            reply_serial: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            destination: None,
            sender: None,
            body: Value::Null,
        }
    }

    /// Builds a signal emitted from `path`.
    #[must_use]
    pub fn signal(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Self::empty(MessageKind::Signal)
        }
    }

    /// Builds a method call on the object at `path`.
    #[must_use]
    pub fn method_call(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Self::empty(MessageKind::MethodCall)
        }
    }

    /// Builds a successful reply to `call`.
    #[must_use]
    pub fn method_return(call: &Self) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            ..Self::empty(MessageKind::MethodReturn)
        }
    }

    /// Builds an error reply to `call`.
    #[must_use]
    pub fn error(call: &Self, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            error_name: Some(name.into()),
            body: Value::String(text.into()),
            ..Self::empty(MessageKind::Error)
        }
    }

    /// Builds an error answering the call with `serial`, for replies the
    /// connection synthesises itself.
    pub(crate) fn local_error(serial: u32, name: &str, text: &str) -> Self {
        Self {
            reply_serial: Some(serial),
            error_name: Some(name.to_owned()),
            body: Value::String(text.to_owned()),
            ..Self::empty(MessageKind::Error)
        }
    }

    /// Replaces the body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Sets the destination.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Sets the sender.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub(crate) const fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    /// Message kind.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Serial assigned by the sending connection; zero until sent.
    #[must_use]
    pub const fn serial(&self) -> u32 {
        self.serial
    }

    /// Serial of the call this message answers.
    #[must_use]
    pub const fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    /// Object path.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Interface name.
    #[must_use]
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Member name.
    #[must_use]
    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    /// Error name of an error reply.
    #[must_use]
    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    /// Destination.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Sender.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Message body.
    #[must_use]
    pub const fn body(&self) -> &Value {
        &self.body
    }

    /// Whether this is an error reply.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self.kind, MessageKind::Error)
    }
}

/// Filter selecting messages for a signal handler.
///
/// Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    kind: Option<MessageKind>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    sender: Option<String>,
}

impl MatchRule {
    /// Rule matching every signal.
    #[must_use]
    pub fn signal() -> Self {
        Self {
            kind: Some(MessageKind::Signal),
            ..Self::default()
        }
    }

    /// Restricts the object path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Restricts the interface.
    #[must_use]
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Restricts the member.
    #[must_use]
    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    /// Restricts the sender.
    #[must_use]
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Whether `message` satisfies every field of the rule.
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        self.kind.is_none_or(|kind| kind == message.kind)
            && field_matches(self.path.as_deref(), message.path())
            && field_matches(self.interface.as_deref(), message.interface())
            && field_matches(self.member.as_deref(), message.member())
            && field_matches(self.sender.as_deref(), message.sender())
    }
}

fn field_matches(expected: Option<&str>, actual: Option<&str>) -> bool {
    expected.is_none_or(|wanted| actual == Some(wanted))
}

impl fmt::Display for MatchRule {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind.as_ref().map(ToString::to_string);
        let fields = [
            ("type", kind.as_deref()),
            ("sender", self.sender.as_deref()),
            ("path", self.path.as_deref()),
            ("interface", self.interface.as_deref()),
            ("member", self.member.as_deref()),
        ];
        let mut separator = "";
        for (key, field) in fields {
            if let Some(value) = field {
                write!(formatter, "{separator}{key}='{value}'")?;
                separator = ",";
            }
        }
        Ok(())
    }
}
