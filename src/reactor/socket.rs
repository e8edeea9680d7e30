//! Thin wrappers over the BSD socket calls the reactor performs.
//!
//! Every descriptor created here is non-blocking. Errors are returned as
//! [`io::Error`] carrying the raw `errno`.

use crate::net::utils::{raw_to_socketaddr, socketaddr_to_raw};

use libc::{
    AF_INET, AF_INET6, EINPROGRESS, F_GETFL, F_SETFL, IPPROTO_TCP, O_NONBLOCK, SO_ERROR,
    SO_LINGER, SO_REUSEADDR, SOCK_STREAM, SOL_SOCKET, TCP_NODELAY, c_int, c_void, sockaddr,
    sockaddr_storage, socklen_t,
};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::ptr;

fn cvt(result: c_int) -> io::Result<c_int> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

/// True for conditions that only mean "try again on a later cycle".
pub(crate) fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

pub(crate) fn set_nonblocking(file_descriptor: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(file_descriptor, F_GETFL) })?;
    cvt(unsafe { libc::fcntl(file_descriptor, F_SETFL, flags | O_NONBLOCK) })?;

    Ok(())
}

fn configure(file_descriptor: RawFd) -> io::Result<()> {
    set_nonblocking(file_descriptor)?;

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    set_option(file_descriptor, SOL_SOCKET, libc::SO_NOSIGPIPE, 1 as c_int)?;

    Ok(())
}

/// Creates a non-blocking stream socket of the family of `address`.
pub(crate) fn stream_socket(address: &SocketAddr) -> io::Result<RawFd> {
    let domain = match address {
        SocketAddr::V4(_) => AF_INET,
        SocketAddr::V6(_) => AF_INET6,
    };

    let file_descriptor = cvt(unsafe { libc::socket(domain, SOCK_STREAM, 0) })?;

    if let Err(error) = configure(file_descriptor) {
        close(file_descriptor);
        return Err(error);
    }

    Ok(file_descriptor)
}

/// Starts connecting. `EINPROGRESS` counts as success.
pub(crate) fn connect(file_descriptor: RawFd, address: &SocketAddr) -> io::Result<()> {
    let (storage, length) = socketaddr_to_raw(address);
    let result = unsafe {
        libc::connect(
            file_descriptor,
            &storage as *const sockaddr_storage as *const sockaddr,
            length,
        )
    };

    if result == 0 {
        return Ok(());
    }

    let error = io::Error::last_os_error();
    if error.raw_os_error() == Some(EINPROGRESS) {
        Ok(())
    } else {
        Err(error)
    }
}

pub(crate) fn bind(file_descriptor: RawFd, address: &SocketAddr) -> io::Result<()> {
    let (storage, length) = socketaddr_to_raw(address);
    cvt(unsafe {
        libc::bind(
            file_descriptor,
            &storage as *const sockaddr_storage as *const sockaddr,
            length,
        )
    })?;

    Ok(())
}

pub(crate) fn listen(file_descriptor: RawFd, backlog: c_int) -> io::Result<()> {
    cvt(unsafe { libc::listen(file_descriptor, backlog) })?;

    Ok(())
}

/// Accepts one pending connection and makes it non-blocking.
pub(crate) fn accept(listener: RawFd) -> io::Result<RawFd> {
    let client = cvt(unsafe { libc::accept(listener, ptr::null_mut(), ptr::null_mut()) })?;

    if let Err(error) = configure(client) {
        close(client);
        return Err(error);
    }

    Ok(client)
}

pub(crate) fn recv(file_descriptor: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
    let result = unsafe {
        libc::recv(
            file_descriptor,
            buffer.as_mut_ptr() as *mut c_void,
            buffer.len(),
            0,
        )
    };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result as usize)
    }
}

/// Sends as much of `buffer` as the socket accepts. `more` hints that further
/// data follows immediately.
pub(crate) fn send(file_descriptor: RawFd, buffer: &[u8], more: bool) -> io::Result<usize> {
    let result = unsafe {
        libc::send(
            file_descriptor,
            buffer.as_ptr() as *const c_void,
            buffer.len(),
            send_flags(more),
        )
    };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result as usize)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_flags(more: bool) -> c_int {
    if more {
        libc::MSG_NOSIGNAL | libc::MSG_MORE
    } else {
        libc::MSG_NOSIGNAL
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_flags(_more: bool) -> c_int {
    0
}

fn set_option<T>(file_descriptor: RawFd, level: c_int, name: c_int, value: T) -> io::Result<()> {
    cvt(unsafe {
        libc::setsockopt(
            file_descriptor,
            level,
            name,
            &value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    })?;

    Ok(())
}

fn get_int_option(file_descriptor: RawFd, level: c_int, name: c_int) -> io::Result<c_int> {
    let mut value: c_int = 0;
    let mut length = mem::size_of::<c_int>() as socklen_t;

    cvt(unsafe {
        libc::getsockopt(
            file_descriptor,
            level,
            name,
            &mut value as *mut c_int as *mut c_void,
            &mut length,
        )
    })?;

    Ok(value)
}

/// Pending asynchronous error of the socket (`SO_ERROR`), `0` if none.
pub(crate) fn take_error(file_descriptor: RawFd) -> io::Result<i32> {
    get_int_option(file_descriptor, SOL_SOCKET, SO_ERROR)
}

/// Makes the next `close` send a reset instead of a graceful shutdown.
pub(crate) fn set_linger_reset(file_descriptor: RawFd) -> io::Result<()> {
    set_option(
        file_descriptor,
        SOL_SOCKET,
        SO_LINGER,
        libc::linger {
            l_onoff: 1,
            l_linger: 0,
        },
    )
}

pub(crate) fn set_nodelay(file_descriptor: RawFd, enabled: bool) -> io::Result<()> {
    set_option(file_descriptor, IPPROTO_TCP, TCP_NODELAY, enabled as c_int)
}

pub(crate) fn nodelay(file_descriptor: RawFd) -> io::Result<bool> {
    Ok(get_int_option(file_descriptor, IPPROTO_TCP, TCP_NODELAY)? != 0)
}

pub(crate) fn set_reuse_address(file_descriptor: RawFd) -> io::Result<()> {
    set_option(file_descriptor, SOL_SOCKET, SO_REUSEADDR, 1 as c_int)
}

pub(crate) fn peer_addr(file_descriptor: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut length = mem::size_of::<sockaddr_storage>() as socklen_t;

    cvt(unsafe {
        libc::getpeername(
            file_descriptor,
            &mut storage as *mut sockaddr_storage as *mut sockaddr,
            &mut length,
        )
    })?;

    raw_to_socketaddr(&storage, length)
}

pub(crate) fn local_addr(file_descriptor: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut length = mem::size_of::<sockaddr_storage>() as socklen_t;

    cvt(unsafe {
        libc::getsockname(
            file_descriptor,
            &mut storage as *mut sockaddr_storage as *mut sockaddr,
            &mut length,
        )
    })?;

    raw_to_socketaddr(&storage, length)
}

pub(crate) fn close(file_descriptor: RawFd) {
    unsafe {
        libc::close(file_descriptor);
    }
}
