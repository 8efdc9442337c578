//! # Socket Proactor - Asynchronous Socket I/O with Completion Callbacks
//!
//! This crate implements the proactor pattern over readiness polling: callers
//! issue asynchronous send/receive requests against non-blocking stream or
//! datagram sockets and supply a completion callback, and the proactor drives
//! each request to completion on a single-threaded poll loop, dispatching the
//! callback from a dedicated completion thread.
//!
//! ## Key Features
//!
//! - **Issue-once, callback-on-completion**: `add_receive`, `add_send`,
//!   `add_receive_from` and `add_send_to` return immediately; the callback
//!   fires later with `io::Result<usize>` (byte count or OS error)
//! - **Per-socket FIFO ordering**: completions for one socket and direction
//!   fire in the order their requests were issued
//! - **Decoupled completion dispatch**: callbacks run on their own worker
//!   thread and never stall the poll loop, no matter how long they block
//! - **Cooperative work schedule**: deadline-bounded and permanent callbacks
//!   interleaved with poll cycles
//! - **Adaptive idle backoff**: sleep between unproductive cycles grows from
//!   zero toward a configurable cap and resets on any work
//! - **mio-based readiness polling**: epoll on Linux, kqueue on macOS/BSD
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use socket_proactor::{shared_addr, shared_buffer, SocketProactor};
//! use std::net::UdpSocket;
//! use std::os::fd::AsRawFd;
//!
//! fn main() -> std::io::Result<()> {
//!     let proactor = SocketProactor::new(true)?;
//!
//!     let socket = UdpSocket::bind("127.0.0.1:0")?;
//!     socket.set_nonblocking(true)?;
//!
//!     // Issue an asynchronous receive; the callback fires on the
//!     // completion thread once a datagram arrives.
//!     let buf = shared_buffer(vec![0u8; 2048]);
//!     let from = shared_addr("0.0.0.0:0".parse().unwrap());
//!     proactor.add_receive_from(
//!         socket.as_raw_fd(),
//!         buf.clone(),
//!         from.clone(),
//!         Box::new(|result| {
//!             println!("received {:?} bytes", result);
//!         }),
//!     )?;
//!
//!     // Drive I/O until stop() is called from another thread.
//!     proactor.run();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The crate is organized into several key modules:
//!
//! - [`config`]: Proactor configuration (poll timeout, backoff cap, worker)
//! - `sys`: Low-level non-blocking socket I/O on raw descriptors
//! - `poll`: Readiness set over `mio::Poll` with interest bookkeeping
//! - `handler`: Pending-request records and per-socket FIFO queues
//! - `completion`: The completion notification queue and its worker thread
//! - `schedule`: Deadline-bounded and permanent work entries
//! - `proactor`: The [`SocketProactor`] facade tying it all together
//!
//! ## Threading Model
//!
//! Up to three kinds of threads interact with one proactor: the poll thread
//! (whichever thread calls [`SocketProactor::run`]), the completion thread
//! (owned by the proactor, runs all I/O callbacks serially), and any number
//! of caller threads issuing registrations. Completion callbacks may block
//! freely; they can never starve the poll loop.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Proactor configuration and performance presets
        pub mod config;

        mod backoff;
        mod completion;
        mod handler;
        mod poll;
        mod proactor;
        mod schedule;
        mod sys;

        pub use config::ProactorConfig;
        pub use handler::{shared_addr, shared_buffer, Buffer, Callback, SharedAddr, SharedBuffer};
        pub use poll::{POLL_ERROR, POLL_READ, POLL_WRITE};
        pub use proactor::SocketProactor;
        pub use schedule::PERMANENT_COMPLETION_HANDLER;
    } else {
        compile_error!("socket-proactor supports Unix platforms only (epoll/kqueue via mio)");
    }
}
