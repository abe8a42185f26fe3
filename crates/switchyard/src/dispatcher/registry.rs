//! Insertion-ordered set of attached connections.

use std::fmt;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::connection::BusConnection;

use super::DispatchError;

/// Identifier assigned to a connection when it joins a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Numeric value of the identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "conn-{}", self.0)
    }
}

/// Registered connection plus the flag that hides it from in-flight passes.
#[derive(Clone)]
pub(super) struct Entry {
    id: ConnectionId,
    connection: Arc<dyn BusConnection>,
    retired: Arc<AtomicBool>,
}

impl Entry {
    pub(super) const fn id(&self) -> ConnectionId {
        self.id
    }

    pub(super) fn connection(&self) -> &dyn BusConnection {
        self.connection.as_ref()
    }

    /// Whether the connection left the registry after this entry was
    /// snapshotted.
    pub(super) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn is<C: ?Sized>(&self, connection: &Arc<C>) -> bool {
        ptr::addr_eq(Arc::as_ptr(&self.connection), Arc::as_ptr(connection))
    }

    fn detach(&self) {
        self.retired.store(true, Ordering::Release);
        self.connection.set_dispatch_status_changed_callback(None);
        self.connection.set_wakeup_callback(None);
    }
}

/// Connections in drain order. Only touched under the dispatcher lock.
#[derive(Default)]
pub(super) struct Registry {
    entries: Vec<Entry>,
    next_id: u64,
}

impl Registry {
    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn contains<C: ?Sized>(&self, connection: &Arc<C>) -> bool {
        self.entries.iter().any(|entry| entry.is(connection))
    }

    /// Appends a connection, rejecting handles that are already present.
    pub(super) fn insert(
        &mut self,
        connection: Arc<dyn BusConnection>,
    ) -> Result<ConnectionId, DispatchError> {
        if self.contains(&connection) {
            return Err(DispatchError::AlreadyRegistered);
        }
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.entries.push(Entry {
            id,
            connection,
            retired: Arc::new(AtomicBool::new(false)),
        });
        Ok(id)
    }

    /// Removes a connection, clearing the callbacks the dispatcher installed.
    pub(super) fn remove<C: ?Sized>(
        &mut self,
        connection: &Arc<C>,
    ) -> Result<ConnectionId, DispatchError> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.is(connection))
            .ok_or(DispatchError::NotRegistered)?;
        let entry = self.entries.remove(position);
        entry.detach();
        Ok(entry.id)
    }

    /// Removes every connection.
    pub(super) fn clear(&mut self) -> Vec<ConnectionId> {
        self.entries
            .drain(..)
            .map(|entry| {
                entry.detach();
                entry.id
            })
            .collect()
    }

    /// Clones the current entries for one dispatch pass.
    pub(super) fn snapshot(&self) -> Vec<Entry> {
        self.entries.clone()
    }
}
