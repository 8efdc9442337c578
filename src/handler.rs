//! Pending-request records and per-socket FIFO queues
//!
//! Every `add_*` registration becomes a [`Handler`]: the buffer to move
//! bytes through, an optional peer address for datagram traffic, and the
//! completion callback. Handlers queue per socket and direction in a
//! [`SubscriberMap`] and are consumed strictly in FIFO order; the head of
//! a queue is the one request the poll loop is allowed to drive at any
//! instant.
//!
//! Buffers and addresses come in two ownership flavors. Owned slots move
//! the value into the handler and release it when the completion fires.
//! Shared slots (`Arc<Mutex<_>>`) keep the storage visible to the caller,
//! which is how receive destinations work: the poll loop fills the shared
//! buffer, and the callback observes the bytes through its own clone.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

/// Byte buffer type moved through I/O requests
pub type Buffer = Vec<u8>;

/// Caller-visible buffer slot for receive destinations and shared sends
///
/// Do not hold the lock while calling registration methods on the
/// proactor; the poll thread takes it briefly during the I/O operation.
pub type SharedBuffer = Arc<Mutex<Buffer>>;

/// Caller-visible address slot filled in by `add_receive_from`
pub type SharedAddr = Arc<Mutex<SocketAddr>>;

/// Completion callback invoked exactly once on the completion thread
///
/// Receives the transferred byte count on success (`Ok(0)` signals
/// end-of-stream on stream sockets) or the OS error that failed the
/// operation. Would-block conditions are never surfaced; the request
/// simply stays queued.
pub type Callback = Box<dyn FnOnce(io::Result<usize>) + Send + 'static>;

/// Wraps a buffer in a [`SharedBuffer`] slot.
pub fn shared_buffer(buf: Buffer) -> SharedBuffer {
    Arc::new(Mutex::new(buf))
}

/// Wraps an address in a [`SharedAddr`] slot.
pub fn shared_addr(addr: SocketAddr) -> SharedAddr {
    Arc::new(Mutex::new(addr))
}

/// Buffer slot of a pending request; the variant encodes who releases it.
pub(crate) enum IoBuffer {
    Owned(Buffer),
    Shared(SharedBuffer),
}

impl IoBuffer {
    /// Runs `f` over the buffer contents (send path).
    pub(crate) fn with_ref<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            IoBuffer::Owned(buf) => f(buf),
            IoBuffer::Shared(slot) => f(&lock_ignore_poison(slot)),
        }
    }

    /// Runs `f` over the mutable buffer (receive path).
    pub(crate) fn with_mut<R>(&mut self, f: impl FnOnce(&mut Buffer) -> R) -> R {
        match self {
            IoBuffer::Owned(buf) => f(buf),
            IoBuffer::Shared(slot) => f(&mut lock_ignore_poison(slot)),
        }
    }
}

/// Peer-address slot of a datagram request.
pub(crate) enum AddrSlot {
    Owned(SocketAddr),
    Shared(SharedAddr),
}

impl AddrSlot {
    pub(crate) fn get(&self) -> SocketAddr {
        match self {
            AddrSlot::Owned(addr) => *addr,
            AddrSlot::Shared(slot) => *lock_ignore_poison(slot),
        }
    }

    pub(crate) fn set(&self, addr: SocketAddr) {
        match self {
            AddrSlot::Owned(_) => {}
            AddrSlot::Shared(slot) => *lock_ignore_poison(slot) = addr,
        }
    }
}

// A completion handler that panicked while holding a shared slot must not
// wedge the poll loop, so poisoning is ignored on these user-facing locks.
fn lock_ignore_poison<T>(slot: &Arc<Mutex<T>>) -> std::sync::MutexGuard<'_, T> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One pending I/O request
///
/// The presence of the address slot selects datagram I/O (`send_to` /
/// `recv_from`) over stream I/O at dispatch time.
pub(crate) struct Handler {
    pub(crate) buf: IoBuffer,
    pub(crate) addr: Option<AddrSlot>,
    pub(crate) on_completion: Callback,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("datagram", &self.addr.is_some())
            .finish()
    }
}

/// Per-socket FIFO queues of pending handlers, one map per direction
///
/// Queues are created on first append and retained when they drain;
/// removing a socket from the map is an explicit operation.
#[derive(Debug, Default)]
pub(crate) struct SubscriberMap {
    queues: HashMap<RawFd, VecDeque<Handler>>,
}

impl SubscriberMap {
    pub(crate) fn append(&mut self, fd: RawFd, handler: Handler) {
        self.queues.entry(fd).or_default().push_back(handler);
    }

    pub(crate) fn head_mut(&mut self, fd: RawFd) -> Option<&mut Handler> {
        self.queues.get_mut(&fd)?.front_mut()
    }

    pub(crate) fn pop_head(&mut self, fd: RawFd) -> Option<Handler> {
        self.queues.get_mut(&fd)?.pop_front()
    }

    pub(crate) fn has(&self, fd: RawFd) -> bool {
        self.queues.contains_key(&fd)
    }

    pub(crate) fn queue_len(&self, fd: RawFd) -> usize {
        self.queues.get(&fd).map_or(0, VecDeque::len)
    }

    pub(crate) fn remove(&mut self, fd: RawFd) -> Option<VecDeque<Handler>> {
        self.queues.remove(&fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler(tag: u8) -> Handler {
        Handler {
            buf: IoBuffer::Owned(vec![tag]),
            addr: None,
            on_completion: Box::new(|_| {}),
        }
    }

    #[test]
    fn test_fifo_order_per_socket() {
        let mut map = SubscriberMap::default();
        map.append(3, noop_handler(1));
        map.append(3, noop_handler(2));
        map.append(3, noop_handler(3));

        for expected in 1..=3u8 {
            let handler = map.pop_head(3).unwrap();
            handler.buf.with_ref(|bytes| assert_eq!(bytes, &[expected]));
        }
        assert!(map.pop_head(3).is_none());
    }

    #[test]
    fn test_empty_queue_is_retained() {
        let mut map = SubscriberMap::default();
        map.append(5, noop_handler(0));
        assert!(map.pop_head(5).is_some());
        assert!(map.has(5));
        assert_eq!(map.queue_len(5), 0);

        map.remove(5);
        assert!(!map.has(5));
    }

    #[test]
    fn test_head_mut_peeks_without_consuming() {
        let mut map = SubscriberMap::default();
        map.append(7, noop_handler(9));
        assert!(map.head_mut(7).is_some());
        assert_eq!(map.queue_len(7), 1);
    }

    #[test]
    fn test_shared_buffer_visible_through_clone() {
        let slot = shared_buffer(vec![0u8; 4]);
        let mut buf = IoBuffer::Shared(slot.clone());
        buf.with_mut(|b| b.copy_from_slice(&[1, 2, 3, 4]));
        assert_eq!(*slot.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_shared_addr_set() {
        let slot = shared_addr("0.0.0.0:0".parse().unwrap());
        let addr_slot = AddrSlot::Shared(slot.clone());
        let peer: SocketAddr = "127.0.0.1:4321".parse().unwrap();
        addr_slot.set(peer);
        assert_eq!(addr_slot.get(), peer);
        assert_eq!(*slot.lock().unwrap(), peer);
    }
}
