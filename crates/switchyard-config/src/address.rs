//! Message-bus address strings.
//!
//! A bus address is a `;`-separated list of alternatives. Each alternative
//! names a transport followed by `key=value` pairs, for example
//! `unix:path=/run/user/1000/bus` or `tcp:host=127.0.0.1,port=4000`. Values
//! are percent-escaped. Clients try the alternatives in order and use the
//! first that connects. Alternatives naming a transport this crate cannot
//! open, such as `autolaunch:`, are skipped while parsing.

use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const ADDRESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::address");

/// Bytes that may appear unescaped in an address value.
const VALUE_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'/')
    .remove(b'.')
    .remove(b'\\')
    .remove(b'*');

/// One transport alternative inside a [`BusAddress`].
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum BusEndpoint {
    /// Unix domain socket bound to a filesystem path.
    Unix {
        /// Socket path.
        path: Utf8PathBuf,
    },
    /// Unix domain socket in the Linux abstract namespace.
    UnixAbstract {
        /// Abstract socket name, without the leading NUL byte.
        name: String,
    },
    /// TCP socket endpoint.
    Tcp {
        /// Host name or address literal.
        host: String,
        /// TCP port.
        port: u16,
    },
}

impl BusEndpoint {
    /// Builds a Unix domain socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Builds a TCP socket endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Returns the Unix socket path when the endpoint uses a filesystem socket.
    #[must_use]
    pub fn unix_path(&self) -> Option<&Utf8Path> {
        match self {
            Self::Unix { path } => Some(path.as_ref()),
            Self::UnixAbstract { .. } | Self::Tcp { .. } => None,
        }
    }

    fn parse_entry(entry: &str) -> Result<Self, AddressParseError> {
        let (transport, rest) = entry
            .split_once(':')
            .ok_or_else(|| AddressParseError::MissingTransport(entry.to_owned()))?;
        let pairs = parse_pairs(entry, rest)?;
        let lookup = |key: &str| {
            pairs
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.as_str())
        };

        match transport {
            "unix" => match (lookup("path"), lookup("abstract")) {
                (Some(path), None) => Ok(Self::unix(path)),
                (None, Some(name)) => Ok(Self::UnixAbstract {
                    name: name.to_owned(),
                }),
                (Some(_), Some(_)) => Err(AddressParseError::ConflictingKeys(entry.to_owned())),
                (None, None) => Err(AddressParseError::MissingKey {
                    entry: entry.to_owned(),
                    key: "path",
                }),
            },
            "tcp" => {
                let host = lookup("host").unwrap_or("localhost");
                let port = lookup("port").ok_or_else(|| AddressParseError::MissingKey {
                    entry: entry.to_owned(),
                    key: "port",
                })?;
                let port = port
                    .parse::<u16>()
                    .map_err(|_| AddressParseError::InvalidPort {
                        entry: entry.to_owned(),
                        port: port.to_owned(),
                    })?;
                Ok(Self::tcp(host, port))
            }
            other => Err(AddressParseError::UnsupportedTransport(other.to_owned())),
        }
    }
}

impl fmt::Display for BusEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(formatter, "unix:path={}", escape(path.as_str())),
            Self::UnixAbstract { name } => write!(formatter, "unix:abstract={}", escape(name)),
            Self::Tcp { host, port } => write!(formatter, "tcp:host={},port={port}", escape(host)),
        }
    }
}

/// Ordered list of transport alternatives for one bus.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct BusAddress {
    endpoints: Vec<BusEndpoint>,
}

impl BusAddress {
    /// Builds an address with a single alternative.
    #[must_use]
    pub fn single(endpoint: BusEndpoint) -> Self {
        Self {
            endpoints: vec![endpoint],
        }
    }

    /// Builds an address from several alternatives, tried in order.
    ///
    /// # Errors
    ///
    /// Returns [`AddressParseError::Empty`] when no alternative is supplied.
    pub fn from_endpoints(endpoints: Vec<BusEndpoint>) -> Result<Self, AddressParseError> {
        if endpoints.is_empty() {
            return Err(AddressParseError::Empty);
        }
        Ok(Self { endpoints })
    }

    /// Alternatives in the order they should be attempted.
    #[must_use]
    pub fn endpoints(&self) -> &[BusEndpoint] {
        &self.endpoints
    }
}

impl From<BusEndpoint> for BusAddress {
    fn from(endpoint: BusEndpoint) -> Self {
        Self::single(endpoint)
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            if index > 0 {
                formatter.write_str(";")?;
            }
            write!(formatter, "{endpoint}")?;
        }
        Ok(())
    }
}

impl FromStr for BusAddress {
    type Err = AddressParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut endpoints = Vec::new();
        let mut unsupported = None;
        for entry in input.split(';').map(str::trim).filter(|entry| !entry.is_empty()) {
            match BusEndpoint::parse_entry(entry) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(AddressParseError::UnsupportedTransport(transport)) => {
                    debug!(
                        target: ADDRESS_TARGET,
                        transport = %transport,
                        "skipping bus address alternative with unsupported transport"
                    );
                    unsupported.get_or_insert(transport);
                }
                Err(error) => return Err(error),
            }
        }
        match unsupported {
            Some(transport) if endpoints.is_empty() => {
                Err(AddressParseError::UnsupportedTransport(transport))
            }
            _ => Self::from_endpoints(endpoints),
        }
    }
}

impl TryFrom<String> for BusAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BusAddress> for String {
    fn from(address: BusAddress) -> Self {
        address.to_string()
    }
}

fn parse_pairs(entry: &str, rest: &str) -> Result<Vec<(String, String)>, AddressParseError> {
    rest.split(',')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, raw) = pair
                .split_once('=')
                .ok_or_else(|| AddressParseError::MalformedPair {
                    entry: entry.to_owned(),
                    pair: pair.to_owned(),
                })?;
            let value = percent_decode_str(raw)
                .decode_utf8()
                .map_err(|_| AddressParseError::InvalidEscape {
                    entry: entry.to_owned(),
                    value: raw.to_owned(),
                })?;
            Ok((key.to_owned(), value.into_owned()))
        })
        .collect()
}

fn escape(value: &str) -> String {
    utf8_percent_encode(value, VALUE_ESCAPES).to_string()
}

/// Errors encountered while parsing a [`BusAddress`] from text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressParseError {
    /// The address contained no alternatives.
    #[error("bus address is empty")]
    Empty,
    /// An alternative lacked the `transport:` prefix.
    #[error("missing transport prefix in '{0}'")]
    MissingTransport(String),
    /// Transport name was not recognised.
    #[error("unsupported bus transport '{0}'")]
    UnsupportedTransport(String),
    /// A `key=value` pair lacked the `=` separator.
    #[error("malformed pair '{pair}' in '{entry}'")]
    MalformedPair {
        /// Offending alternative.
        entry: String,
        /// Offending pair.
        pair: String,
    },
    /// A required key was absent.
    #[error("missing '{key}' in '{entry}'")]
    MissingKey {
        /// Offending alternative.
        entry: String,
        /// Name of the missing key.
        key: &'static str,
    },
    /// Mutually exclusive keys were both present.
    #[error("'path' and 'abstract' are mutually exclusive in '{0}'")]
    ConflictingKeys(String),
    /// TCP port was not a valid number.
    #[error("invalid port '{port}' in '{entry}'")]
    InvalidPort {
        /// Offending alternative.
        entry: String,
        /// Raw port text.
        port: String,
    },
    /// A percent escape did not decode to UTF-8.
    #[error("invalid escape sequence in '{value}' of '{entry}'")]
    InvalidEscape {
        /// Offending alternative.
        entry: String,
        /// Raw value text.
        value: String,
    },
}
