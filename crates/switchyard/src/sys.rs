//! Thin wrappers over `poll(2)`.

use std::io;
use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::connection::Interest;

/// Converts a wait bound into a `poll(2)` timeout.
///
/// Sub-millisecond waits round up so a pending deadline never degenerates
/// into a busy loop. Waits longer than the widest supported timeout are
/// clamped; callers re-poll after the clamp expires.
pub(crate) fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    let Some(bound) = timeout else {
        return PollTimeout::NONE;
    };
    if bound.is_zero() {
        return PollTimeout::ZERO;
    }
    let millis = bound.as_millis().max(1);
    PollTimeout::from(u16::try_from(millis).unwrap_or(u16::MAX))
}

/// Polls `fds`, retrying when interrupted by a signal.
pub(crate) fn poll_fds(fds: &mut [PollFd<'_>], timeout: Option<Duration>) -> io::Result<usize> {
    let deadline = timeout.map(|bound| Instant::now() + bound);
    loop {
        let remaining = deadline.map(|until| until.saturating_duration_since(Instant::now()));
        match poll(fds, poll_timeout(remaining)) {
            Ok(ready) => return Ok(usize::try_from(ready).unwrap_or_default()),
            Err(Errno::EINTR) => {}
            Err(errno) => return Err(io::Error::from(errno)),
        }
    }
}

/// Blocks until `fd` reports any of `interest` or the timeout elapses.
///
/// Returns the reported readiness, which is empty on timeout.
pub(crate) fn wait_for(
    fd: BorrowedFd<'_>,
    interest: Interest,
    timeout: Option<Duration>,
) -> io::Result<Interest> {
    let mut fds = [PollFd::new(fd, poll_flags(interest))];
    poll_fds(&mut fds, timeout)?;
    Ok(fds
        .first()
        .and_then(|pfd| pfd.revents())
        .map_or(Interest::NONE, readiness))
}

/// Maps an interest mask onto `poll(2)` request flags.
pub(crate) fn poll_flags(interest: Interest) -> PollFlags {
    let mut flags = PollFlags::empty();
    if interest.is_readable() {
        flags |= PollFlags::POLLIN;
    }
    if interest.is_writable() {
        flags |= PollFlags::POLLOUT;
    }
    flags
}

/// Maps `poll(2)` result flags onto a readiness mask.
pub(crate) fn readiness(flags: PollFlags) -> Interest {
    let mut ready = Interest::NONE;
    if flags.intersects(PollFlags::POLLIN | PollFlags::POLLPRI) {
        ready = ready | Interest::READABLE;
    }
    if flags.contains(PollFlags::POLLOUT) {
        ready = ready | Interest::WRITABLE;
    }
    if flags.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
        ready = ready | Interest::ERROR;
    }
    if flags.contains(PollFlags::POLLHUP) {
        ready = ready | Interest::HANGUP;
    }
    ready
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(None, PollTimeout::NONE)]
    #[case(Some(Duration::ZERO), PollTimeout::ZERO)]
    #[case(Some(Duration::from_micros(10)), PollTimeout::from(1_u16))]
    #[case(Some(Duration::from_secs(3600)), PollTimeout::from(u16::MAX))]
    fn timeouts_round_up_and_clamp(#[case] input: Option<Duration>, #[case] expected: PollTimeout) {
        assert_eq!(poll_timeout(input), expected);
    }

    #[rstest]
    fn readiness_folds_error_conditions() {
        let ready = readiness(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLNVAL);
        assert!(ready.is_readable());
        assert!(ready.contains(Interest::HANGUP));
        assert!(ready.contains(Interest::ERROR));
        assert!(!ready.is_writable());
    }
}
