//! Cross-thread wakeup for the dispatch thread's multiplexed wait.
//!
//! A non-blocking socket pair: the read end joins every poll set, the write
//! end is shared with whoever needs to interrupt the wait. A pending flag
//! coalesces bursts so at most one byte is ever in flight.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

pub(crate) const WAKEUP_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::wakeup");

/// Read end of the wakeup channel, owned by the dispatch engine.
#[derive(Debug)]
pub struct WakeupChannel {
    reader: UnixStream,
    signal: WakeupSignal,
}

impl WakeupChannel {
    /// Creates a non-blocking channel.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the socket pair cannot be created, for
    /// example when the process has exhausted its descriptors.
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self {
            reader,
            signal: WakeupSignal {
                inner: Arc::new(SignalInner {
                    writer,
                    pending: AtomicBool::new(false),
                }),
            },
        })
    }

    /// Interrupts the current or next wait.
    pub fn signal(&self) {
        self.signal.signal();
    }

    /// Returns a write handle that can be moved into callbacks.
    #[must_use]
    pub fn signaller(&self) -> WakeupSignal {
        self.signal.clone()
    }

    /// Consumes every pending wakeup byte and returns how many were read.
    ///
    /// Bytes are read before the pending flag is cleared. A signal that
    /// lands after the flag is cleared writes a fresh byte, so the next wait
    /// still wakes.
    pub fn drain(&self) -> usize {
        let mut buffer = [0_u8; 64];
        let mut total = 0;
        loop {
            match (&self.reader).read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => total += read,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    trace!(target: WAKEUP_TARGET, error = %error, "wakeup drain failed");
                    break;
                }
            }
        }
        self.signal.inner.pending.swap(false, Ordering::AcqRel);
        total
    }
}

impl AsFd for WakeupChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

/// Cloneable write end of a [`WakeupChannel`].
#[derive(Debug, Clone)]
pub struct WakeupSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug)]
struct SignalInner {
    writer: UnixStream,
    pending: AtomicBool,
}

impl WakeupSignal {
    /// Writes a wakeup byte unless one is already pending.
    ///
    /// Never blocks and never fails; errors are logged at trace level. The
    /// engine's bounded poll interval restores liveness if a byte is lost.
    pub fn signal(&self) {
        if self.inner.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            match (&self.inner.writer).write(&[1]) {
                Ok(_) => return,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => {
                    // A full buffer still wakes the reader; anything else
                    // leaves nothing in flight.
                    if error.kind() != io::ErrorKind::WouldBlock {
                        self.inner.pending.store(false, Ordering::Release);
                    }
                    trace!(target: WAKEUP_TARGET, error = %error, "wakeup signal dropped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::connection::Interest;
    use crate::sys::wait_for;

    fn readable(channel: &WakeupChannel) -> bool {
        wait_for(channel.as_fd(), Interest::READABLE, Some(Duration::ZERO))
            .expect("poll wakeup channel")
            .is_readable()
    }

    #[rstest]
    fn repeated_signals_coalesce_into_one_byte() {
        let channel = WakeupChannel::new().expect("wakeup channel");
        let signal = channel.signaller();
        for _ in 0..16 {
            signal.signal();
        }
        channel.signal();

        assert!(readable(&channel));
        assert_eq!(channel.drain(), 1);
        assert!(!readable(&channel));
    }

    #[rstest]
    fn signal_after_drain_wakes_again() {
        let channel = WakeupChannel::new().expect("wakeup channel");
        channel.signal();
        channel.drain();

        channel.signal();
        assert!(readable(&channel));
        assert_eq!(channel.drain(), 1);
    }

    #[rstest]
    fn signals_from_other_threads_are_observed() {
        let channel = WakeupChannel::new().expect("wakeup channel");
        let signal = channel.signaller();
        std::thread::spawn(move || signal.signal())
            .join()
            .expect("signalling thread");

        let ready = wait_for(channel.as_fd(), Interest::READABLE, Some(Duration::from_secs(1)))
            .expect("poll wakeup channel");
        assert!(ready.is_readable());
    }

    #[rstest]
    fn drain_without_signal_reads_nothing() {
        let channel = WakeupChannel::new().expect("wakeup channel");
        assert_eq!(channel.drain(), 0);
    }
}
