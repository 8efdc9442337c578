//! I/O completion executor
//!
//! The poll loop never invokes user callbacks directly. When an I/O
//! operation completes it packs the callback, the byte count and the
//! outcome into a [`Notification`] and pushes it onto a multi-producer
//! FIFO; a dedicated consumer thread drains the queue and invokes the
//! callbacks one at a time. Two callbacks therefore never run
//! concurrently, and a callback that blocks delays other completions but
//! never the poll loop itself.
//!
//! A panicking callback is trapped and logged; the executor keeps
//! running.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::warn;

use crate::backoff::Backoff;
use crate::handler::Callback;

/// One entry in the completion queue.
///
/// `WakeUp` carries no payload; it exists to unblock the consumer when
/// the executor is being stopped or poked.
pub(crate) enum Notification {
    Io {
        on_completion: Callback,
        bytes: usize,
        error: Option<io::Error>,
    },
    WakeUp,
}

impl std::fmt::Debug for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notification::Io { bytes, error, .. } => f
                .debug_struct("Io")
                .field("bytes", bytes)
                .field("error", error)
                .finish_non_exhaustive(),
            Notification::WakeUp => f.write_str("WakeUp"),
        }
    }
}

/// Single-consumer worker draining the completion notification queue
#[derive(Debug)]
pub(crate) struct CompletionExecutor {
    tx: Sender<Notification>,
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CompletionExecutor {
    /// Starts the consumer thread. Failure to spawn is fatal for the
    /// proactor being constructed.
    pub(crate) fn start(max_backoff: Duration) -> io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let worker_running = running.clone();
        let thread = thread::Builder::new()
            .name("proactor-io-completion".into())
            .spawn(move || completion_loop(rx, worker_running, max_backoff))?;
        Ok(Self {
            tx,
            running,
            thread: Some(thread),
        })
    }

    /// Enqueues a completion. Multi-producer, never blocks.
    pub(crate) fn enqueue(&self, on_completion: Callback, bytes: usize, error: Option<io::Error>) {
        let _ = self.tx.send(Notification::Io {
            on_completion,
            bytes,
            error,
        });
    }

    /// Signals termination and wakes the consumer. Notifications still
    /// queued when the consumer observes the signal are dropped without
    /// being invoked.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake_up();
    }

    /// Pokes the consumer without stopping it.
    pub(crate) fn wake_up(&self) {
        let _ = self.tx.send(Notification::WakeUp);
    }

    /// Blocks until the consumer thread has exited.
    pub(crate) fn wait(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CompletionExecutor {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

fn completion_loop(rx: Receiver<Notification>, running: Arc<AtomicBool>, max_backoff: Duration) {
    let mut backoff = Backoff::new(max_backoff);
    while running.load(Ordering::Acquire) {
        match rx.recv_timeout(backoff.wait()) {
            Ok(Notification::Io {
                on_completion,
                bytes,
                error,
            }) => {
                let result = match error {
                    Some(e) => Err(e),
                    None => Ok(bytes),
                };
                run_safely("I/O completion handler", move || on_completion(result));
                backoff.reset();
            }
            Ok(Notification::WakeUp) => backoff.reset(),
            Err(RecvTimeoutError::Timeout) => backoff.grow(),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Invokes a user callback, trapping panics so one bad handler cannot
/// take down the invoking thread. Returns whether the callback returned
/// normally.
pub(crate) fn run_safely<F: FnOnce()>(what: &str, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(_) => {
            warn!("{what} panicked; continuing");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn test_invokes_callback_with_byte_count() {
        let mut executor = CompletionExecutor::start(Duration::from_millis(50)).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        executor.enqueue(
            Box::new(move |result| {
                *sink.lock().unwrap() = Some(result.unwrap());
            }),
            42,
            None,
        );

        thread::sleep(Duration::from_millis(100));
        assert_eq!(*seen.lock().unwrap(), Some(42));
        executor.stop();
        executor.wait();
    }

    #[test]
    fn test_error_notification_reaches_callback() {
        let mut executor = CompletionExecutor::start(Duration::from_millis(50)).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        executor.enqueue(
            Box::new(move |result| {
                *sink.lock().unwrap() = Some(result.unwrap_err().kind());
            }),
            0,
            Some(io::Error::from(io::ErrorKind::ConnectionReset)),
        );

        thread::sleep(Duration::from_millis(100));
        assert_eq!(*seen.lock().unwrap(), Some(io::ErrorKind::ConnectionReset));
        executor.stop();
        executor.wait();
    }

    #[test]
    fn test_survives_panicking_callback() {
        let mut executor = CompletionExecutor::start(Duration::from_millis(50)).unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        executor.enqueue(Box::new(|_| panic!("bad handler")), 0, None);
        let counter = count.clone();
        executor.enqueue(
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            1,
            None,
        );

        thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        executor.stop();
        executor.wait();
    }

    #[test]
    fn test_completions_are_serialised_in_order() {
        let mut executor = CompletionExecutor::start(Duration::from_millis(50)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10usize {
            let sink = order.clone();
            executor.enqueue(
                Box::new(move |result| {
                    sink.lock().unwrap().push(result.unwrap());
                }),
                i,
                None,
            );
        }

        thread::sleep(Duration::from_millis(200));
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
        executor.stop();
        executor.wait();
    }

    #[test]
    fn test_stop_then_wait_terminates() {
        let mut executor = CompletionExecutor::start(Duration::from_millis(250)).unwrap();
        executor.stop();
        executor.wait();
    }
}
