//! Error types for dispatcher operations.

use std::io;

use thiserror::Error;

use switchyard_config::{AddressParseError, BusAddress, BusTypeError};

use crate::transport::TransportError;

/// Errors surfaced by [`Dispatcher`](super::Dispatcher) operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The connection is already attached to this dispatcher.
    #[error("connection is already registered with this dispatcher")]
    AlreadyRegistered,
    /// The connection is not attached to this dispatcher.
    #[error("connection is not registered with this dispatcher")]
    NotRegistered,
    /// The wakeup channel could not be created.
    #[error("failed to create wakeup channel: {source}")]
    Wakeup {
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The dispatch thread could not be spawned.
    #[error("failed to spawn dispatch thread '{name}': {source}")]
    Spawn {
        /// Requested thread name.
        name: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The dispatch thread panicked outside any connection callback.
    #[error("dispatch thread panicked")]
    ThreadPanic,
    /// A bus type could not be resolved to an address.
    #[error("failed to resolve bus address: {source}")]
    Resolve {
        /// Resolution failure.
        #[source]
        source: BusTypeError,
    },
    /// A bus address string was malformed.
    #[error("invalid bus address: {source}")]
    Address {
        /// Parser failure.
        #[source]
        source: AddressParseError,
    },
    /// None of the address alternatives accepted a connection.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        /// Address that was tried.
        address: String,
        /// Failure of the last alternative tried.
        #[source]
        source: TransportError,
    },
}

impl DispatchError {
    pub(crate) fn spawn(name: &str, source: io::Error) -> Self {
        Self::Spawn {
            name: name.to_owned(),
            source,
        }
    }

    pub(crate) fn connect(address: &BusAddress, source: TransportError) -> Self {
        Self::Connect {
            address: address.to_string(),
            source,
        }
    }
}

impl From<BusTypeError> for DispatchError {
    fn from(source: BusTypeError) -> Self {
        Self::Resolve { source }
    }
}

impl From<AddressParseError> for DispatchError {
    fn from(source: AddressParseError) -> Self {
        Self::Address { source }
    }
}
