//! Low-level non-blocking socket I/O on raw descriptors
//!
//! This module performs the actual socket system calls for the poll loop.
//! All sockets handed to the proactor are identified by their raw
//! descriptor and must already be in non-blocking mode; every operation
//! here returns `WouldBlock` rather than suspending the calling thread.
//!
//! # Key Operations
//!
//! - **Stream I/O**: `send` / `recv`
//! - **Datagram I/O**: `send_to` / `recv_from` with address conversion
//! - **Readability hint**: `available` (FIONREAD) reports pending bytes
//! - **Error retrieval**: `take_socket_error` drains SO_ERROR after an
//!   error readiness event
//!
//! # Safety
//!
//! This module contains `unsafe` code for raw socket system calls and for
//! decoding OS socket address storage. All `unsafe` operations are
//! encapsulated within safe interfaces; the caller only guarantees that
//! the descriptor refers to an open socket.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;

/// Platform socket handle type
pub type OsSocket = RawFd;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        // Suppress SIGPIPE on peer-closed stream sends; surfaced as EPIPE.
        const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
    } else {
        const SEND_FLAGS: libc::c_int = 0;
    }
}

/// Sends bytes on a connected stream socket
pub fn send(os: OsSocket, buf: &[u8]) -> io::Result<usize> {
    let rc = unsafe { libc::send(os, buf.as_ptr() as *const _, buf.len(), SEND_FLAGS) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// Receives bytes from a connected stream socket
///
/// Returns `Ok(0)` when the peer has shut down its write side.
pub fn recv(os: OsSocket, buf: &mut [u8]) -> io::Result<usize> {
    let rc = unsafe { libc::recv(os, buf.as_mut_ptr() as *mut _, buf.len(), 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// Sends a datagram to the given address
pub fn send_to(os: OsSocket, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
    let (sa, len) = to_sockaddr(addr);
    let ptr = match &sa {
        SockAddr::V4(s) => s as *const _ as *const libc::sockaddr,
        SockAddr::V6(s) => s as *const _ as *const libc::sockaddr,
    };
    let rc = unsafe { libc::sendto(os, buf.as_ptr() as *const _, buf.len(), SEND_FLAGS, ptr, len) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// Receives a datagram and the sender's address
pub fn recv_from(os: OsSocket, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::recvfrom(
            os,
            buf.as_mut_ptr() as *mut _,
            buf.len(),
            0,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((rc as usize, from_sockaddr(&storage)?))
}

/// Returns the number of bytes readable without blocking
///
/// Used as a sizing hint before a receive; a readable socket reporting
/// zero available bytes signals end-of-stream on stream sockets.
pub fn available(os: OsSocket) -> io::Result<usize> {
    let mut n: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(os, libc::FIONREAD as _, &mut n) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n.max(0) as usize)
}

/// Retrieves and clears the pending socket error (SO_ERROR)
///
/// Returns `None` when no error is pending.
pub fn take_socket_error(os: OsSocket) -> io::Result<Option<io::Error>> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            os,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut _,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(err)))
    }
}

/// Platform-specific socket address storage
#[allow(non_camel_case_types)]
#[derive(Debug)]
pub enum SockAddr {
    /// IPv4 socket address
    V4(libc::sockaddr_in),
    /// IPv6 socket address
    V6(libc::sockaddr_in6),
}

/// Convert SocketAddr to platform-specific socket address
pub fn to_sockaddr(addr: SocketAddr) -> (SockAddr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(a) => {
            let mut s: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            s.sin_family = libc::AF_INET as _;
            s.sin_port = a.port().to_be();
            s.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()).to_be() };
            (SockAddr::V4(s), std::mem::size_of::<libc::sockaddr_in>() as _)
        }
        SocketAddr::V6(a) => {
            let mut s: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            s.sin6_family = libc::AF_INET6 as _;
            s.sin6_port = a.port().to_be();
            s.sin6_flowinfo = a.flowinfo();
            s.sin6_scope_id = a.scope_id();
            s.sin6_addr = libc::in6_addr { s6_addr: a.ip().octets() };
            (SockAddr::V6(s), std::mem::size_of::<libc::sockaddr_in6>() as _)
        }
    }
}

/// Convert platform socket address storage back to SocketAddr
pub fn from_sockaddr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            let port = u16::from_be(sin.sin_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family: {family}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.0.2.7:4242".parse().unwrap();
        let (sa, _len) = to_sockaddr(addr);
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        match sa {
            SockAddr::V4(s) => unsafe {
                std::ptr::copy_nonoverlapping(
                    &s as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            },
            SockAddr::V6(_) => panic!("expected V4"),
        }
        assert_eq!(from_sockaddr(&storage).unwrap(), addr);
    }

    #[test]
    fn test_sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8::1]:9000".parse().unwrap();
        let (sa, _len) = to_sockaddr(addr);
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        match sa {
            SockAddr::V6(s) => unsafe {
                std::ptr::copy_nonoverlapping(
                    &s as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            },
            SockAddr::V4(_) => panic!("expected V6"),
        }
        assert_eq!(from_sockaddr(&storage).unwrap(), addr);
    }

    #[test]
    fn test_datagram_loopback() {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let sent = send_to(a.as_raw_fd(), b"ping", b.local_addr().unwrap()).unwrap();
        assert_eq!(sent, 4);

        // Loopback delivery is fast but not instant.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(available(b.as_raw_fd()).unwrap(), 4);

        let mut buf = [0u8; 16];
        let (n, from) = recv_from(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn test_recv_would_block() {
        let s = UdpSocket::bind("127.0.0.1:0").unwrap();
        s.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 16];
        let err = recv(s.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_no_pending_socket_error() {
        let s = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(take_socket_error(s.as_raw_fd()).unwrap().is_none());
    }
}
