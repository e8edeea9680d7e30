//! Tunables consumed by a [`Registry`](crate::Registry) at construction time.

use std::time::Duration;

/// Default select timeout and idle-poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(125);

/// Default ACK timeout applied to newly created clients.
pub const DEFAULT_MAX_ACK_TIME: Duration = Duration::from_millis(5000);

/// Default per-client budget of queued, not yet transmitted bytes.
pub const DEFAULT_WRITE_SPACE: usize = 5744;

/// Default size of the read buffer shared by every connection.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1436;

/// Default ceiling above which listening sockets stop being polled for accepts.
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Default name of the reactor thread.
pub const DEFAULT_THREAD_NAME: &str = "asyncsock-reactor";

/// Reactor configuration.
///
/// Every value is read once when the registry is built; later changes to a
/// `ReactorConfig` have no effect on a running reactor.
#[derive(Clone, Debug)]
pub struct ReactorConfig {
    /// Upper bound of a single readiness wait, and the idle-poll period.
    pub poll_interval: Duration,
    /// ACK timeout given to new clients. `None` disables it.
    pub max_ack_time: Option<Duration>,
    /// Initial write budget of each client, in bytes.
    pub write_space: usize,
    /// Size of the read buffer; bounds the payload of one receive callback.
    pub read_buffer_size: usize,
    /// Registered connections at which servers stop accepting.
    pub max_connections: usize,
    /// Name given to the reactor thread.
    pub thread_name: String,
    /// Stack size of the reactor thread. `None` keeps the platform default.
    pub stack_size: Option<usize>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_ack_time: Some(DEFAULT_MAX_ACK_TIME),
            write_space: DEFAULT_WRITE_SPACE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
            stack_size: None,
        }
    }
}

impl ReactorConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }
}
