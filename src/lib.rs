//! Callback-driven TCP clients and servers over non-blocking BSD sockets.
//!
//! One reactor thread per [`Registry`] waits for socket readiness with
//! `select(2)` and runs every I/O syscall and user callback. Calls made from
//! application threads (`connect`, `add`, `write`, `close`) never block.
//!
//! # Architecture
//!
//! - **Registry**: handle to the reactor thread and its registered connections
//! - **Client**: connect/send/receive state machine with a bounded write queue
//! - **Server**: listener that hands accepted clients to a callback
//! - **RegistryBuilder**: fluent construction of a configured registry
//! - **ReactorConfig**: poll interval, timeouts and budgets
//!
//! Each reactor cycle builds the read and write sets, waits for at most one
//! poll interval, dispatches writable clients, readable clients and listening
//! servers in that order, then completes DNS lookups, runs idle-poll ticks
//! (ACK and receive timeouts) and delivers sent callbacks.

mod builder;
mod config;
mod error;
mod net;
mod reactor;
mod utils;

pub use builder::RegistryBuilder;
pub use config::{
    DEFAULT_MAX_ACK_TIME, DEFAULT_MAX_CONNECTIONS, DEFAULT_POLL_INTERVAL,
    DEFAULT_READ_BUFFER_SIZE, DEFAULT_THREAD_NAME, DEFAULT_WRITE_SPACE, ReactorConfig,
};
pub use error::{ERR_DNS_RESOLUTION_FAILED, Error, Result, error_to_string};
pub use net::callbacks::{
    AcceptHandler, AckHandler, ConnectHandler, DataHandler, DisconnectHandler, ErrorHandler,
    PollHandler, TimeoutHandler,
};
pub use net::client::{Client, ConnectionState};
pub use net::server::{BACKLOG, Server};
pub use net::write_queue::ApiFlags;
pub use reactor::core::Registry;
