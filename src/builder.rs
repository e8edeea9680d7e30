//! Fluent builder for Registry construction.

use crate::config::ReactorConfig;
use crate::error::Result;
use crate::reactor::core::Registry;

use std::time::Duration;

/// Builder for a [`Registry`] with a customised [`ReactorConfig`].
///
/// # Example
/// ```no_run
/// use std::time::Duration;
///
/// let registry = asyncsock::Registry::builder()
///     .poll_interval(Duration::from_millis(50))
///     .max_connections(8)
///     .build()
///     .expect("reactor thread");
/// ```
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    config: ReactorConfig,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select timeout and idle-poll period.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Default ACK timeout of new clients, `None` to disable.
    pub fn max_ack_time(mut self, timeout: Option<Duration>) -> Self {
        self.config.max_ack_time = timeout;
        self
    }

    /// Initial write budget of each client.
    pub fn write_space(mut self, bytes: usize) -> Self {
        self.config.write_space = bytes;
        self
    }

    pub fn read_buffer_size(mut self, bytes: usize) -> Self {
        self.config.read_buffer_size = bytes;
        self
    }

    /// Connection count at which servers stop accepting.
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.stack_size = Some(bytes);
        self
    }

    /// Starts the reactor thread.
    ///
    /// Fails with [`Error::ReactorSpawn`](crate::Error::ReactorSpawn) if the
    /// thread cannot be created.
    pub fn build(self) -> Result<Registry> {
        Registry::with_config(self.config)
    }
}
