//! The reactor: connection registry, readiness loop and socket primitives.
//!
//! - [`core`]: the [`Registry`](core::Registry) and its polling thread
//! - [`connection`]: state shared by every registered socket
//! - [`poller`]: `select(2)` wrappers
//! - [`socket`]: non-blocking socket syscalls

pub mod core;
pub(crate) mod connection;
pub(crate) mod poller;
pub(crate) mod socket;
