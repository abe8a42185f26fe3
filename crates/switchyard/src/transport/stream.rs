//! Socket streams the transport can run over.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use switchyard_config::BusEndpoint;

use super::TransportError;

/// Connected, non-blocking socket.
#[derive(Debug)]
pub(crate) enum ConnectionStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl ConnectionStream {
    /// Connects to `endpoint` and switches the socket to non-blocking mode.
    pub(crate) fn connect(endpoint: &BusEndpoint) -> Result<Self, TransportError> {
        let stream = match endpoint {
            BusEndpoint::Unix { path } => UnixStream::connect(path.as_std_path())
                .map(Self::Unix)
                .map_err(|source| TransportError::io("unix connect", source))?,
            BusEndpoint::UnixAbstract { name } => Self::Unix(connect_abstract(endpoint, name)?),
            BusEndpoint::Tcp { host, port } => {
                let tcp = TcpStream::connect((host.as_str(), *port))
                    .map_err(|source| TransportError::io("tcp connect", source))?;
                tcp.set_nodelay(true)
                    .map_err(|source| TransportError::io("tcp configure", source))?;
                Self::Tcp(tcp)
            }
        };
        stream.configure()?;
        Ok(stream)
    }

    pub(crate) fn configure(&self) -> Result<(), TransportError> {
        match self {
            Self::Tcp(stream) => stream.set_nonblocking(true),
            Self::Unix(stream) => stream.set_nonblocking(true),
        }
        .map_err(|source| TransportError::io("enable non-blocking mode", source))
    }

    pub(crate) fn read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => (&*stream).read(buffer),
            Self::Unix(stream) => (&*stream).read(buffer),
        }
    }

    pub(crate) fn write(&self, buffer: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => (&*stream).write(buffer),
            Self::Unix(stream) => (&*stream).write(buffer),
        }
    }

    pub(crate) fn shutdown(&self) {
        // The peer may already be gone; nothing remains to release.
        let _closed = match self {
            Self::Tcp(stream) => stream.shutdown(Shutdown::Both),
            Self::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
    }
}

impl AsFd for ConnectionStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Tcp(stream) => stream.as_fd(),
            Self::Unix(stream) => stream.as_fd(),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn connect_abstract(_endpoint: &BusEndpoint, name: &str) -> Result<UnixStream, TransportError> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let address = SocketAddr::from_abstract_name(name.as_bytes())
        .map_err(|source| TransportError::io("abstract socket address", source))?;
    UnixStream::connect_addr(&address)
        .map_err(|source| TransportError::io("unix connect", source))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn connect_abstract(endpoint: &BusEndpoint, _name: &str) -> Result<UnixStream, TransportError> {
    Err(TransportError::UnsupportedTransport {
        endpoint: endpoint.to_string(),
    })
}
