//! Readiness waiting through `select(2)`.

use libc::{FD_ISSET, FD_SET, FD_SETSIZE, FD_ZERO, c_int, fd_set, timeval};

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

/// A descriptor set together with the highest descriptor it holds.
pub(crate) struct FdSet {
    raw: fd_set,
    max: RawFd,
}

impl FdSet {
    pub(crate) fn new() -> Self {
        let mut raw: fd_set = unsafe { mem::zeroed() };
        unsafe { FD_ZERO(&mut raw) };

        Self { raw, max: -1 }
    }

    /// Adds `file_descriptor`. Returns `false` if it cannot be represented in an `fd_set`.
    pub(crate) fn insert(&mut self, file_descriptor: RawFd) -> bool {
        if file_descriptor < 0 || file_descriptor as usize >= FD_SETSIZE as usize {
            return false;
        }

        unsafe { FD_SET(file_descriptor, &mut self.raw) };
        self.max = self.max.max(file_descriptor);

        true
    }

    pub(crate) fn contains(&self, file_descriptor: RawFd) -> bool {
        if file_descriptor < 0 || file_descriptor as usize >= FD_SETSIZE as usize {
            return false;
        }

        unsafe { FD_ISSET(file_descriptor, &self.raw) }
    }
}

fn to_timeval(timeout: Duration) -> timeval {
    timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    }
}

/// Waits until a descriptor of either set is ready or `timeout` elapses.
///
/// On return the sets only contain the ready descriptors. With both sets
/// empty this degenerates into a sleep.
pub(crate) fn select(read: &mut FdSet, write: &mut FdSet, timeout: Duration) -> io::Result<usize> {
    let mut timeout = to_timeval(timeout);
    let highest = read.max.max(write.max);

    let result = unsafe {
        libc::select(
            (highest + 1) as c_int,
            &mut read.raw,
            &mut write.raw,
            ptr::null_mut(),
            &mut timeout,
        )
    };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result as usize)
    }
}

fn probe(file_descriptor: RawFd, writable: bool) -> bool {
    let mut set = FdSet::new();
    if !set.insert(file_descriptor) {
        return false;
    }

    let mut empty = FdSet::new();
    let ready = if writable {
        select(&mut empty, &mut set, Duration::ZERO)
    } else {
        select(&mut set, &mut empty, Duration::ZERO)
    };

    matches!(ready, Ok(count) if count > 0) && set.contains(file_descriptor)
}

/// Zero-timeout readability check.
pub(crate) fn probe_readable(file_descriptor: RawFd) -> bool {
    probe(file_descriptor, false)
}

/// Zero-timeout writability check.
pub(crate) fn probe_writable(file_descriptor: RawFd) -> bool {
    probe(file_descriptor, true)
}
