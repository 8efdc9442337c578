//! Readiness set over `mio::Poll`
//!
//! This module wraps the cross-platform `mio` poller (epoll on Linux,
//! kqueue on macOS/BSD) behind the small poll-set contract the proactor
//! needs: register a raw descriptor with an interest mask, poll with a
//! timeout for a batch of `(descriptor, readiness)` pairs, and wake the
//! poller from another thread.
//!
//! Registration is keyed by raw descriptor; the descriptor doubles as the
//! `mio::Token`. A dedicated wake token carries `wake_up()` notifications
//! and is filtered out of the event batch.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

/// Poll mode bit: readiness for reading
pub const POLL_READ: u8 = 0x01;
/// Poll mode bit: readiness for writing
pub const POLL_WRITE: u8 = 0x02;
/// Poll mode bit: error condition on the socket
///
/// Error events are always delivered for registered sockets; the bit
/// exists so registration masks stay composable.
pub const POLL_ERROR: u8 = 0x04;

/// Token reserved for wake-up notifications; never a valid descriptor.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// A readiness event batch entry: descriptor plus `POLL_*` bits.
pub(crate) type PollEvent = (RawFd, u8);

// Poll and its event buffer belong to whichever thread is inside poll();
// registration goes through the cloned Registry and never touches them.
struct PollCore {
    poll: Poll,
    events: Events,
}

/// Readiness set shared between the poll thread and registration callers
pub(crate) struct PollSet {
    core: Mutex<PollCore>,
    registry: Registry,
    waker: Waker,
    /// Current `POLL_*` mask per known descriptor. A zero mask means the
    /// descriptor is known but currently deregistered from the poller.
    interests: Mutex<HashMap<RawFd, u8>>,
}

impl PollSet {
    pub(crate) fn new(event_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            core: Mutex::new(PollCore {
                poll,
                events: Events::with_capacity(event_capacity),
            }),
            registry,
            waker,
            interests: Mutex::new(HashMap::new()),
        })
    }

    /// Adds the given mode bits to the descriptor's interest mask,
    /// registering it with the poller on first use.
    ///
    /// An already-registered descriptor is re-registered even when the
    /// mask is unchanged: the poller reports edges, and re-arming makes a
    /// condition that is already true (for example buffered input) visible
    /// to the next poll.
    pub(crate) fn add(&self, fd: RawFd, mode: u8) -> io::Result<()> {
        let mut interests = self.interests.lock().unwrap();
        let current = interests.get(&fd).copied().unwrap_or(0);
        let merged = current | mode;
        let interest = to_interest(merged);
        if current == 0 {
            self.registry.register(&mut SourceFd(&fd), Token(fd as usize), interest)?;
        } else {
            self.registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest)?;
        }
        interests.insert(fd, merged);
        Ok(())
    }

    /// Drops the given mode bits from the descriptor's interest mask.
    ///
    /// When no interest remains the descriptor is deregistered from the
    /// poller but stays known to the set, so a later `add` re-registers it
    /// and `has` keeps answering true.
    pub(crate) fn remove_interest(&self, fd: RawFd, mode: u8) -> io::Result<()> {
        let mut interests = self.interests.lock().unwrap();
        let Some(current) = interests.get(&fd).copied() else {
            return Ok(());
        };
        let remaining = current & !mode;
        if remaining == current {
            return Ok(());
        }
        if remaining == 0 {
            self.registry.deregister(&mut SourceFd(&fd))?;
        } else {
            self.registry
                .reregister(&mut SourceFd(&fd), Token(fd as usize), to_interest(remaining))?;
        }
        interests.insert(fd, remaining);
        Ok(())
    }

    /// Removes the descriptor from the set entirely.
    ///
    /// Returns true if the descriptor was known. Unknown descriptors are
    /// a no-op.
    pub(crate) fn remove(&self, fd: RawFd) -> io::Result<bool> {
        let mut interests = self.interests.lock().unwrap();
        let Some(current) = interests.remove(&fd) else {
            return Ok(false);
        };
        if current != 0 {
            self.registry.deregister(&mut SourceFd(&fd))?;
        }
        Ok(true)
    }

    /// Returns true if the descriptor is known to the set.
    pub(crate) fn has(&self, fd: RawFd) -> bool {
        self.interests.lock().unwrap().contains_key(&fd)
    }

    /// Polls for readiness, appending `(descriptor, bits)` pairs to `out`.
    ///
    /// Blocks up to `timeout`. Wake-up notifications terminate the wait
    /// early and are not reported as events. A signal interruption is
    /// treated as an empty poll.
    pub(crate) fn poll(&self, timeout: Duration, out: &mut Vec<PollEvent>) -> io::Result<()> {
        let mut core = self.core.lock().unwrap();
        let core = &mut *core;
        match core.poll.poll(&mut core.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        for event in core.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let mut bits = 0u8;
            if event.is_readable() || event.is_read_closed() {
                bits |= POLL_READ;
            }
            if event.is_writable() {
                bits |= POLL_WRITE;
            }
            if event.is_error() {
                bits |= POLL_ERROR;
            }
            if bits != 0 {
                out.push((event.token().0 as RawFd, bits));
            }
        }
        Ok(())
    }

    /// Interrupts a blocking `poll` from any thread.
    pub(crate) fn wake_up(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

impl std::fmt::Debug for PollSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let interests = self.interests.lock().unwrap();
        f.debug_struct("PollSet").field("sockets", &interests.len()).finish()
    }
}

fn to_interest(mode: u8) -> Interest {
    match (mode & POLL_READ != 0, mode & POLL_WRITE != 0) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        // Error-only registrations still need a base interest; error
        // events are delivered regardless of the mask.
        _ => Interest::READABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;
    use std::time::Instant;

    #[test]
    fn test_empty_poll_times_out() {
        let set = PollSet::new(64).unwrap();
        let mut out = Vec::new();
        let start = Instant::now();
        set.poll(Duration::from_millis(50), &mut out).unwrap();
        assert!(out.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wake_up_interrupts_poll() {
        let set = std::sync::Arc::new(PollSet::new(64).unwrap());
        let waker_set = set.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            waker_set.wake_up().unwrap();
        });
        let mut out = Vec::new();
        let start = Instant::now();
        set.poll(Duration::from_secs(5), &mut out).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(out.is_empty());
        waker.join().unwrap();
    }

    #[test]
    fn test_writable_udp_socket_reports_write_readiness() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let fd = socket.as_raw_fd();

        let set = PollSet::new(64).unwrap();
        set.add(fd, POLL_WRITE).unwrap();

        let mut out = Vec::new();
        set.poll(Duration::from_millis(500), &mut out).unwrap();
        assert!(out.iter().any(|&(efd, bits)| efd == fd && bits & POLL_WRITE != 0));
    }

    #[test]
    fn test_interest_trimming_deregisters() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let fd = socket.as_raw_fd();

        let set = PollSet::new(64).unwrap();
        set.add(fd, POLL_WRITE).unwrap();
        set.remove_interest(fd, POLL_WRITE).unwrap();
        assert!(set.has(fd));

        // No interest left: an always-writable socket must not surface.
        let mut out = Vec::new();
        set.poll(Duration::from_millis(50), &mut out).unwrap();
        assert!(out.is_empty());

        // Re-enabling restores delivery.
        set.add(fd, POLL_WRITE).unwrap();
        out.clear();
        set.poll(Duration::from_millis(500), &mut out).unwrap();
        assert!(!out.is_empty());
    }

    #[test]
    fn test_remove_unknown_socket_is_noop() {
        let set = PollSet::new(64).unwrap();
        assert!(!set.remove(12345).unwrap());
    }
}
