//! The proactor facade
//!
//! [`SocketProactor`] ties the subsystems together: callers register I/O
//! intents from any thread, the poll loop owns the readiness set and the
//! per-socket handler queues and drives the actual socket operations, and
//! completed requests are handed to the completion executor for callback
//! dispatch.
//!
//! # Data Flow
//!
//! An `add_receive` / `add_send` / `add_receive_from` / `add_send_to`
//! call appends a handler to the socket's read or write queue, enables
//! the matching readiness interest and wakes the poll loop. When the
//! socket turns ready, the loop performs the non-blocking operation
//! against the head-of-queue handler: on success (or failure other than
//! would-block) it moves the callback into a completion notification and
//! pops the handler; on would-block the handler simply stays queued.
//!
//! # Shutdown
//!
//! `stop()` is the only cancellation mechanism. Requests still pending
//! when the proactor is dropped are released without their callbacks
//! ever firing.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::backoff::Backoff;
use crate::completion::CompletionExecutor;
use crate::config::ProactorConfig;
use crate::handler::{
    AddrSlot, Buffer, Callback, Handler, IoBuffer, SharedAddr, SharedBuffer, SubscriberMap,
};
use crate::poll::{PollEvent, PollSet, POLL_ERROR, POLL_READ, POLL_WRITE};
use crate::schedule::WorkSchedule;
use crate::sys;

// Lifecycle: Idle -> Running -> Stopping -> Stopped; Stopped is terminal.
const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

/// Proactor-style asynchronous socket I/O dispatcher
///
/// Issue requests with the `add_*` methods and drive them by calling
/// [`run`](Self::run) (typically on a dedicated thread) or by calling
/// [`poll`](Self::poll) manually. Completion callbacks fire on the
/// proactor's completion thread, serialised with each other and ordered
/// FIFO per socket and direction. No ordering holds across different
/// sockets or directions.
///
/// The proactor identifies sockets by raw descriptor; the caller keeps
/// the socket itself alive (and non-blocking) for as long as requests
/// against it are pending.
pub struct SocketProactor {
    timeout_ms: AtomicU64,
    max_backoff: Duration,
    state: AtomicU8,
    stop_flag: Arc<AtomicBool>,
    poll_set: PollSet,
    read_handlers: Mutex<SubscriberMap>,
    write_handlers: Mutex<SubscriberMap>,
    completion: CompletionExecutor,
    schedule: Arc<WorkSchedule>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SocketProactor {
    /// Creates a proactor with the default 250 ms timeout.
    ///
    /// `worker` controls the optional work-executor thread that drains
    /// the work schedule alongside the poll loop; see
    /// [`ProactorConfig::worker`].
    pub fn new(worker: bool) -> io::Result<Self> {
        Self::with_config(ProactorConfig {
            worker,
            ..Default::default()
        })
    }

    /// Creates a proactor with the given poll timeout.
    pub fn with_timeout(timeout: Duration, worker: bool) -> io::Result<Self> {
        Self::with_config(ProactorConfig {
            poll_timeout_ms: timeout.as_millis() as u64,
            worker,
            ..Default::default()
        })
    }

    /// Creates a proactor from a full configuration.
    ///
    /// Fails only on lifecycle errors: readiness-set creation or worker
    /// spawn. I/O errors never surface here.
    pub fn with_config(config: ProactorConfig) -> io::Result<Self> {
        let poll_set = PollSet::new(config.event_capacity)?;
        let completion = CompletionExecutor::start(config.max_backoff())?;
        let schedule = Arc::new(WorkSchedule::new());
        let stop_flag = Arc::new(AtomicBool::new(false));

        let worker = if config.worker {
            let schedule = schedule.clone();
            let stop = stop_flag.clone();
            let max_backoff = config.max_backoff();
            Some(
                thread::Builder::new()
                    .name("proactor-work".into())
                    .spawn(move || {
                        let mut backoff = Backoff::new(max_backoff);
                        while !stop.load(Ordering::Acquire) {
                            let outcome = schedule.dispatch(true, false);
                            backoff.pause(outcome.invoked > 0);
                        }
                    })?,
            )
        } else {
            None
        };

        debug!(
            "proactor created: timeout {} ms, worker {}",
            config.poll_timeout_ms, config.worker
        );
        Ok(Self {
            timeout_ms: AtomicU64::new(config.poll_timeout_ms),
            max_backoff: config.max_backoff(),
            state: AtomicU8::new(IDLE),
            stop_flag,
            poll_set,
            read_handlers: Mutex::new(SubscriberMap::default()),
            write_handlers: Mutex::new(SubscriberMap::default()),
            completion,
            schedule,
            worker,
        })
    }

    // ---- lifecycle -----------------------------------------------------

    /// Runs the proactor until [`stop`](Self::stop) is called from
    /// another thread.
    ///
    /// Each cycle executes due scheduled and permanent work, polls for
    /// socket readiness, then applies the adaptive idle backoff: sleep
    /// grows from 1 ms, doubling up to the configured cap, and resets to
    /// zero whenever a cycle produced work. Returns immediately if the
    /// proactor was already stopped.
    pub fn run(&self) {
        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!("proactor running");
        let mut backoff = Backoff::new(self.max_backoff);
        while !self.stop_flag.load(Ordering::Acquire) {
            let work = self.schedule.dispatch(false, false).invoked;
            let io = match self.poll(None) {
                Ok(n) => n,
                Err(e) => {
                    warn!("readiness poll failed: {e}");
                    0
                }
            };
            backoff.pause(work + io > 0);
        }
        self.state.store(STOPPED, Ordering::Release);
        debug!("proactor stopped");
    }

    /// Stops the proactor.
    ///
    /// The run loop exits when it next observes the flag; a blocking
    /// readiness poll is woken immediately. Pending requests are not
    /// flushed: their callbacks never fire once the proactor is dropped.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        let _ = self
            .state
            .compare_exchange(IDLE, STOPPED, Ordering::AcqRel, Ordering::Acquire);
        let _ = self
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire);
        self.wake_poll();
    }

    /// Wakes an idle proactor without stopping it.
    pub fn wake_up(&self) {
        self.wake_poll();
    }

    /// Sets the readiness-poll timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Returns the readiness-poll timeout.
    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    // ---- poll / dispatch -----------------------------------------------

    /// Performs one poll iteration.
    ///
    /// Blocks up to the configured timeout for readiness, then drives the
    /// head-of-queue handler of every ready socket: writable sockets
    /// send, readable sockets receive, error conditions fail the pending
    /// handlers of both directions. Returns the number of completion
    /// callbacks enqueued; `handled`, when supplied, receives the number
    /// of distinct read/write/error socket events serviced.
    pub fn poll(&self, handled: Option<&mut usize>) -> io::Result<usize> {
        let mut events: Vec<PollEvent> = Vec::new();
        self.poll_set.poll(self.get_timeout(), &mut events)?;

        let mut completions = 0;
        let mut serviced = 0;
        for (fd, bits) in events {
            if bits & POLL_ERROR != 0 {
                completions += self.fail_pending(fd);
                serviced += 1;
            }
            if bits & POLL_WRITE != 0 {
                completions += self.send_ready(fd);
                serviced += 1;
            }
            if bits & POLL_READ != 0 {
                completions += self.receive_ready(fd);
                serviced += 1;
            }
        }
        if serviced > 0 {
            trace!("serviced {serviced} socket events, enqueued {completions} completions");
        }
        if let Some(out) = handled {
            *out = serviced;
        }
        Ok(completions)
    }

    /// Drives queued write handlers of a writable socket until the queue
    /// drains or the socket would block. The poller reports edges, so one
    /// writability event must serve every request it covers. Returns the
    /// number of completions enqueued.
    fn send_ready(&self, fd: RawFd) -> usize {
        let mut writers = self.write_handlers.lock().unwrap();
        let mut completions = 0;
        while let Some(handler) = writers.head_mut(fd) {
            let result = match &handler.addr {
                Some(slot) => handler.buf.with_ref(|bytes| sys::send_to(fd, bytes, slot.get())),
                None => handler.buf.with_ref(|bytes| sys::send(fd, bytes)),
            };
            let (bytes, error) = match result {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Ok(n) => (n, None),
                Err(e) => (0, Some(e)),
            };
            if let Some(handler) = writers.pop_head(fd) {
                self.completion.enqueue(handler.on_completion, bytes, error);
                completions += 1;
            }
        }
        // A drained queue drops its interest; a bare add_socket
        // registration (no queue at all) stays untouched.
        if writers.has(fd) && writers.queue_len(fd) == 0 {
            self.trim_interest(fd, POLL_WRITE);
        }
        completions
    }

    /// Drives queued read handlers of a readable socket until the queue
    /// drains or the socket would block. Returns the number of
    /// completions enqueued.
    fn receive_ready(&self, fd: RawFd) -> usize {
        let mut readers = self.read_handlers.lock().unwrap();
        let mut completions = 0;
        while let Some(handler) = readers.head_mut(fd) {
            // Readability-size hint: grow the destination to fit what the
            // socket reports as immediately available. A readable stream
            // socket reporting zero produces the 0-byte end-of-stream
            // completion through the recv below.
            let available = sys::available(fd).unwrap_or(0);

            let result = if handler.addr.is_some() {
                let received = handler.buf.with_mut(|buf| {
                    if available > buf.len() {
                        buf.resize(available, 0);
                    }
                    let received = sys::recv_from(fd, buf);
                    if let Ok((n, _)) = received {
                        buf.truncate(n);
                    }
                    received
                });
                match received {
                    Ok((n, from)) => {
                        if let Some(slot) = &handler.addr {
                            slot.set(from);
                        }
                        Ok(n)
                    }
                    Err(e) => Err(e),
                }
            } else {
                handler.buf.with_mut(|buf| {
                    if available > buf.len() {
                        buf.resize(available, 0);
                    }
                    let received = sys::recv(fd, buf);
                    if let Ok(n) = received {
                        buf.truncate(n);
                    }
                    received
                })
            };
            let (bytes, error) = match result {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Ok(n) => (n, None),
                Err(e) => (0, Some(e)),
            };
            if let Some(handler) = readers.pop_head(fd) {
                self.completion.enqueue(handler.on_completion, bytes, error);
                completions += 1;
            }
        }
        if readers.has(fd) && readers.queue_len(fd) == 0 {
            self.trim_interest(fd, POLL_READ);
        }
        completions
    }

    /// Fails the head handler of both directions after an error readiness
    /// event. Returns the number of completions enqueued.
    fn fail_pending(&self, fd: RawFd) -> usize {
        let code = match sys::take_socket_error(fd) {
            Ok(Some(e)) => e.raw_os_error(),
            _ => None,
        };
        let make_error = || match code {
            Some(code) => io::Error::from_raw_os_error(code),
            None => io::Error::other("socket error event"),
        };

        let mut enqueued = 0;
        for (map, bit) in [
            (&self.read_handlers, POLL_READ),
            (&self.write_handlers, POLL_WRITE),
        ] {
            let mut handlers = map.lock().unwrap();
            if let Some(handler) = handlers.pop_head(fd) {
                self.completion.enqueue(handler.on_completion, 0, Some(make_error()));
                enqueued += 1;
            }
            if handlers.has(fd) && handlers.queue_len(fd) == 0 {
                self.trim_interest(fd, bit);
            }
        }
        enqueued
    }

    // ---- registration --------------------------------------------------

    /// Registers an asynchronous receive on a stream socket.
    ///
    /// The shared buffer is the receive destination; it may be grown to
    /// fit the readable byte count and is truncated to the bytes actually
    /// received. The callback receives the byte count, with `Ok(0)`
    /// signalling end-of-stream.
    pub fn add_receive(
        &self,
        socket: RawFd,
        buf: SharedBuffer,
        on_completion: Callback,
    ) -> io::Result<()> {
        self.add_read_handler(
            socket,
            Handler {
                buf: IoBuffer::Shared(buf),
                addr: None,
                on_completion,
            },
        )
    }

    /// Registers an asynchronous send of an owned message on a stream
    /// socket.
    pub fn add_send(
        &self,
        socket: RawFd,
        message: Buffer,
        on_completion: Callback,
    ) -> io::Result<()> {
        self.add_write_handler(
            socket,
            Handler {
                buf: IoBuffer::Owned(message),
                addr: None,
                on_completion,
            },
        )
    }

    /// Registers an asynchronous send of a caller-shared message on a
    /// stream socket. The caller must keep the contents stable until the
    /// completion fires.
    pub fn add_send_shared(
        &self,
        socket: RawFd,
        message: SharedBuffer,
        on_completion: Callback,
    ) -> io::Result<()> {
        self.add_write_handler(
            socket,
            Handler {
                buf: IoBuffer::Shared(message),
                addr: None,
                on_completion,
            },
        )
    }

    /// Registers an asynchronous datagram receive.
    ///
    /// On completion the shared buffer holds the datagram (truncated to
    /// its length) and the shared address slot holds the sender.
    pub fn add_receive_from(
        &self,
        socket: RawFd,
        buf: SharedBuffer,
        addr: SharedAddr,
        on_completion: Callback,
    ) -> io::Result<()> {
        self.add_read_handler(
            socket,
            Handler {
                buf: IoBuffer::Shared(buf),
                addr: Some(AddrSlot::Shared(addr)),
                on_completion,
            },
        )
    }

    /// Registers an asynchronous datagram send of an owned message to an
    /// owned destination address.
    pub fn add_send_to(
        &self,
        socket: RawFd,
        message: Buffer,
        addr: SocketAddr,
        on_completion: Callback,
    ) -> io::Result<()> {
        self.add_write_handler(
            socket,
            Handler {
                buf: IoBuffer::Owned(message),
                addr: Some(AddrSlot::Owned(addr)),
                on_completion,
            },
        )
    }

    /// Registers an asynchronous datagram send with caller-shared message
    /// and destination slots.
    pub fn add_send_to_shared(
        &self,
        socket: RawFd,
        message: SharedBuffer,
        addr: SharedAddr,
        on_completion: Callback,
    ) -> io::Result<()> {
        self.add_write_handler(
            socket,
            Handler {
                buf: IoBuffer::Shared(message),
                addr: Some(AddrSlot::Shared(addr)),
                on_completion,
            },
        )
    }

    /// Registers a socket in the readiness set without an I/O intent.
    ///
    /// `mode` is a combination of [`POLL_READ`], [`POLL_WRITE`] and
    /// [`POLL_ERROR`].
    pub fn add_socket(&self, socket: RawFd, mode: u8) -> io::Result<()> {
        self.poll_set.add(socket, mode)?;
        self.wake_poll();
        Ok(())
    }

    /// Removes a socket from the proactor, dropping its pending handlers
    /// without firing their callbacks. Removing an unknown socket is a
    /// no-op; returns whether the socket was known.
    pub fn remove_socket(&self, socket: RawFd) -> bool {
        let read = self.read_handlers.lock().unwrap().remove(socket).is_some();
        let write = self.write_handlers.lock().unwrap().remove(socket).is_some();
        let polled = match self.poll_set.remove(socket) {
            Ok(known) => known,
            Err(e) => {
                warn!("deregistering socket {socket} failed: {e}");
                false
            }
        };
        read || write || polled
    }

    /// Returns true if the socket is registered with this proactor in
    /// either direction.
    pub fn has(&self, socket: RawFd) -> bool {
        self.poll_set.has(socket)
            || self.read_handlers.lock().unwrap().has(socket)
            || self.write_handlers.lock().unwrap().has(socket)
    }

    /// Returns the pending request counts for a socket as
    /// `(receive, send)` queue depths.
    pub fn pending_io(&self, socket: RawFd) -> (usize, usize) {
        (
            self.read_handlers.lock().unwrap().queue_len(socket),
            self.write_handlers.lock().unwrap().queue_len(socket),
        )
    }

    fn add_read_handler(&self, fd: RawFd, handler: Handler) -> io::Result<()> {
        {
            let mut readers = self.read_handlers.lock().unwrap();
            self.poll_set.add(fd, POLL_READ)?;
            readers.append(fd, handler);
        }
        self.wake_poll();
        Ok(())
    }

    fn add_write_handler(&self, fd: RawFd, handler: Handler) -> io::Result<()> {
        {
            let mut writers = self.write_handlers.lock().unwrap();
            self.poll_set.add(fd, POLL_WRITE)?;
            writers.append(fd, handler);
        }
        self.wake_poll();
        Ok(())
    }

    /// Drops a readiness interest once its queue has drained; an
    /// always-writable socket must not keep waking the loop.
    fn trim_interest(&self, fd: RawFd, bit: u8) {
        if let Err(e) = self.poll_set.remove_interest(fd, bit) {
            warn!("trimming interest on socket {fd} failed: {e}");
        }
    }

    fn wake_poll(&self) {
        if let Err(e) = self.poll_set.wake_up() {
            warn!("waking the poll loop failed: {e}");
        }
    }

    // ---- work schedule -------------------------------------------------

    /// Schedules user work.
    ///
    /// `expiration_ms` of [`PERMANENT_COMPLETION_HANDLER`] keeps the
    /// entry on the schedule until removed; `0` runs it once on the next
    /// dispatch; any other non-negative value is a deadline of now +
    /// `expiration_ms` during which the entry runs on every dispatch.
    ///
    /// [`PERMANENT_COMPLETION_HANDLER`]: crate::PERMANENT_COMPLETION_HANDLER
    pub fn add_work<W>(&self, work: W, expiration_ms: i64)
    where
        W: FnMut() + Send + 'static,
    {
        self.add_work_at(work, expiration_ms, None);
    }

    /// Schedules user work at a position in the schedule (front = 0);
    /// `None` appends.
    pub fn add_work_at<W>(&self, work: W, expiration_ms: i64, pos: Option<usize>)
    where
        W: FnMut() + Send + 'static,
    {
        self.schedule.add(Box::new(work), expiration_ms, pos);
        self.wake_poll();
    }

    /// Removes all scheduled and permanent work.
    pub fn remove_work(&self) {
        self.schedule.clear();
    }

    /// Removes the first `count` deadline-bounded entries (all if
    /// negative); returns how many were removed.
    pub fn remove_scheduled_work(&self, count: i64) -> usize {
        self.schedule.remove_scheduled(count)
    }

    /// Removes the first `count` permanent entries (all if negative);
    /// returns how many were removed.
    pub fn remove_permanent_work(&self, count: i64) -> usize {
        self.schedule.remove_permanent(count)
    }

    /// Number of deadline-bounded work entries.
    pub fn scheduled_work(&self) -> usize {
        self.schedule.scheduled()
    }

    /// Number of permanent work entries.
    pub fn permanent_work(&self) -> usize {
        self.schedule.permanent()
    }

    /// Blocks until one work entry has been invoked; returns 1 if it
    /// completed normally, 0 if it panicked (the panic is trapped).
    pub fn run_one(&self) -> usize {
        self.schedule.run_one_blocking(self.max_backoff)
    }
}

impl Drop for SocketProactor {
    fn drop(&mut self) {
        self.stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.completion.stop();
        self.completion.wait();
        // Subscriber maps and the poll set drop with the struct; pending
        // handlers are released without firing.
    }
}

impl std::fmt::Debug for SocketProactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketProactor")
            .field("timeout_ms", &self.timeout_ms.load(Ordering::Relaxed))
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("poll_set", &self.poll_set)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{shared_addr, shared_buffer};
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;
    use std::time::Instant;

    #[test]
    fn test_default_timeout() {
        let proactor = SocketProactor::new(false).unwrap();
        assert_eq!(proactor.get_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_set_timeout() {
        let proactor = SocketProactor::new(false).unwrap();
        proactor.set_timeout(Duration::from_millis(10));
        assert_eq!(proactor.get_timeout(), Duration::from_millis(10));
    }

    #[test]
    fn test_poll_without_registrations_returns_zero_after_timeout() {
        let proactor = SocketProactor::with_timeout(Duration::from_millis(50), false).unwrap();
        let start = Instant::now();
        let mut handled = 7;
        let completions = proactor.poll(Some(&mut handled)).unwrap();
        assert_eq!(completions, 0);
        assert_eq!(handled, 0);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_has_and_remove_socket() {
        let proactor = SocketProactor::new(false).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let fd = socket.as_raw_fd();

        assert!(!proactor.has(fd));
        proactor.add_socket(fd, POLL_READ | POLL_ERROR).unwrap();
        assert!(proactor.has(fd));

        assert!(proactor.remove_socket(fd));
        assert!(!proactor.has(fd));
        assert!(!proactor.remove_socket(fd));
    }

    #[test]
    fn test_pending_io_counts() {
        let proactor = SocketProactor::new(false).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let fd = socket.as_raw_fd();

        let buf = shared_buffer(vec![0u8; 64]);
        let addr = shared_addr("0.0.0.0:0".parse().unwrap());
        proactor
            .add_receive_from(fd, buf, addr, Box::new(|_| {}))
            .unwrap();
        assert_eq!(proactor.pending_io(fd), (1, 0));

        // Dropping the proactor releases the pending handler silently.
    }

    #[test]
    fn test_run_after_stop_returns_immediately() {
        let proactor = SocketProactor::new(false).unwrap();
        proactor.stop();
        let start = Instant::now();
        proactor.run();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_work_schedule_counts() {
        let proactor = SocketProactor::new(false).unwrap();
        proactor.add_work(|| {}, crate::PERMANENT_COMPLETION_HANDLER);
        proactor.add_work(|| {}, 10_000);
        assert_eq!(proactor.permanent_work(), 1);
        assert_eq!(proactor.scheduled_work(), 1);

        assert_eq!(proactor.remove_scheduled_work(-1), 1);
        assert_eq!(proactor.remove_permanent_work(-1), 1);
        proactor.add_work(|| {}, 10_000);
        proactor.remove_work();
        assert_eq!(proactor.scheduled_work(), 0);
    }
}
