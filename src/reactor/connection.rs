//! Per-socket state shared by clients and servers, and the trait the reactor
//! dispatches through.

use crate::reactor::core::Registry;
use crate::reactor::socket;

use parking_lot::Mutex;
use tracing::debug;

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Instant;

/// A connection kind the reactor knows how to drive.
///
/// Every hook runs on the reactor thread. Hooks that may fire user callbacks
/// take `self: Arc<Self>` so the connection stays alive for the whole call.
pub(crate) trait ManagedConnection: Send + Sync {
    fn connection(&self) -> &Connection;

    fn is_server(&self) -> bool {
        false
    }

    /// Whether the socket should be polled for writability.
    fn pending_write(&self) -> bool {
        false
    }

    /// Returns `true` if the event counted as activity.
    fn on_writable(self: Arc<Self>) -> bool {
        false
    }

    fn on_readable(self: Arc<Self>, buffer: &mut [u8]);

    fn on_delayed_connect(self: Arc<Self>) {}

    fn on_poll_tick(self: Arc<Self>) {}

    fn on_cycle_done(self: Arc<Self>) {}
}

/// Socket descriptor, activity timestamp and DNS completion flag of one
/// registered connection.
///
/// Dropping it unregisters the owner from the registry and closes the socket.
pub(crate) struct Connection {
    socket: AtomicI32,
    dns_finished: AtomicBool,
    last_active: Mutex<Instant>,
    key: usize,
    registry: Registry,
}

impl Connection {
    pub(crate) fn new(key: usize, registry: Registry) -> Self {
        Self {
            socket: AtomicI32::new(-1),
            dns_finished: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
            key,
            registry,
        }
    }

    pub(crate) fn key(&self) -> usize {
        self.key
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current descriptor, `-1` when closed.
    pub(crate) fn socket(&self) -> RawFd {
        self.socket.load(Ordering::Acquire)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.socket() >= 0
    }

    /// Stores `file_descriptor` only if no socket is installed yet.
    pub(crate) fn install_socket(&self, file_descriptor: RawFd) -> bool {
        self.socket
            .compare_exchange(-1, file_descriptor, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Removes the descriptor and returns it. The caller owns closing it.
    pub(crate) fn take_socket(&self) -> Option<RawFd> {
        let file_descriptor = self.socket.swap(-1, Ordering::AcqRel);

        (file_descriptor >= 0).then_some(file_descriptor)
    }

    pub(crate) fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    pub(crate) fn set_last_active(&self, now: Instant) {
        *self.last_active.lock() = now;
    }

    /// Called from the resolver thread once a lookup has completed.
    pub(crate) fn finish_dns(&self) {
        self.dns_finished.store(true, Ordering::Release);
    }

    /// Consumes the DNS completion flag.
    pub(crate) fn take_dns_finished(&self) -> bool {
        self.dns_finished.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn set_no_delay(&self, enabled: bool) -> io::Result<()> {
        match self.socket() {
            file_descriptor if file_descriptor >= 0 => socket::set_nodelay(file_descriptor, enabled),
            _ => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    pub(crate) fn no_delay(&self) -> bool {
        match self.socket() {
            file_descriptor if file_descriptor >= 0 => {
                socket::nodelay(file_descriptor).unwrap_or(false)
            }
            _ => false,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.registry.unregister(self.key);

        if let Some(file_descriptor) = self.take_socket() {
            debug!(key = self.key, fd = file_descriptor, "closing socket of dropped connection");
            socket::close(file_descriptor);
        }
    }
}
