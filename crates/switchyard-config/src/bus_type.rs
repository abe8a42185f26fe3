//! Well-known buses and their address resolution.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::address::{AddressParseError, BusAddress, BusEndpoint};
use crate::defaults::SYSTEM_BUS_DEFAULT_ADDRESS;

/// Environment variable naming the session bus address.
pub const SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";
/// Environment variable overriding the system bus address.
pub const SYSTEM_BUS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";
/// Environment variable set by the bus when it activates a service.
pub const STARTER_BUS_ENV: &str = "DBUS_STARTER_ADDRESS";

/// Well-known message buses.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum BusType {
    /// Per-login-session bus.
    #[default]
    Session,
    /// System-wide bus.
    System,
    /// Bus that activated the current process.
    Starter,
}

impl BusType {
    /// Resolves the bus address from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`BusTypeError`] when no address is configured for the bus or
    /// the configured address is malformed.
    pub fn resolve(self) -> Result<BusAddress, BusTypeError> {
        self.resolve_with(|key| std::env::var(key).ok(), runtime_bus_socket)
    }

    /// Resolves the bus address using the supplied environment lookup.
    ///
    /// `session_fallback` is consulted only for the session bus when the
    /// environment does not name one.
    ///
    /// # Errors
    ///
    /// Returns [`BusTypeError`] when no address is configured for the bus or
    /// the configured address is malformed.
    pub fn resolve_with<L, F>(self, lookup: L, session_fallback: F) -> Result<BusAddress, BusTypeError>
    where
        L: Fn(&str) -> Option<String>,
        F: FnOnce() -> Option<BusEndpoint>,
    {
        let variable = match self {
            Self::Session => SESSION_BUS_ENV,
            Self::System => SYSTEM_BUS_ENV,
            Self::Starter => STARTER_BUS_ENV,
        };
        if let Some(raw) = lookup(variable).filter(|value| !value.trim().is_empty()) {
            return raw.parse().map_err(|source| BusTypeError::Malformed {
                bus: self,
                variable,
                source,
            });
        }

        match self {
            Self::System => {
                SYSTEM_BUS_DEFAULT_ADDRESS
                    .parse()
                    .map_err(|source| BusTypeError::Malformed {
                        bus: self,
                        variable,
                        source,
                    })
            }
            Self::Session => session_fallback()
                .map(BusAddress::single)
                .ok_or(BusTypeError::Unconfigured { bus: self, variable }),
            Self::Starter => Err(BusTypeError::Unconfigured { bus: self, variable }),
        }
    }
}

#[cfg(unix)]
fn runtime_bus_socket() -> Option<BusEndpoint> {
    let mut path = dirs::runtime_dir()?;
    path.push("bus");
    if !path.exists() {
        return None;
    }
    camino::Utf8PathBuf::from_path_buf(path)
        .ok()
        .map(BusEndpoint::unix)
}

#[cfg(not(unix))]
fn runtime_bus_socket() -> Option<BusEndpoint> {
    None
}

/// Errors raised while resolving a [`BusType`] to an address.
#[derive(Debug, Error)]
pub enum BusTypeError {
    /// Nothing in the environment names an address for the bus.
    #[error("no address configured for the {bus} bus; set {variable}")]
    Unconfigured {
        /// Bus being resolved.
        bus: BusType,
        /// Environment variable consulted.
        variable: &'static str,
    },
    /// The configured address failed to parse.
    #[error("malformed {bus} bus address in {variable}: {source}")]
    Malformed {
        /// Bus being resolved.
        bus: BusType,
        /// Environment variable consulted.
        variable: &'static str,
        /// Parser failure.
        #[source]
        source: AddressParseError,
    },
}
