//! Error types and transport error codes.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Error code reported to `on_error` when a host name could not be resolved.
pub const ERR_DNS_RESOLUTION_FAILED: i32 = -55;

/// Errors returned by setup operations.
///
/// Failures on an established connection are never returned; they are
/// delivered as integer codes to the client's error callback instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The reactor thread could not be started. No networking is possible.
    #[error("failed to spawn reactor thread: {0}")]
    ReactorSpawn(#[source] io::Error),

    /// `socket(2)` or its configuration failed.
    #[error("failed to create socket: {0}")]
    Socket(#[source] io::Error),

    /// `connect(2)` failed with something other than `EINPROGRESS`.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// `bind(2)` failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// `listen(2)` failed.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The client already owns an open socket.
    #[error("connection already open")]
    AlreadyConnected,

    /// Name resolution could not be started.
    #[error("name resolution failed: {0}")]
    Resolve(String),
}

impl Error {
    /// Integer code of this error, as it would be passed to an error callback.
    pub fn code(&self) -> i32 {
        match self {
            Self::ReactorSpawn(source) | Self::Socket(source) => os_code(source),
            Self::Connect { source, .. }
            | Self::Bind { source, .. }
            | Self::Listen { source, .. } => os_code(source),
            Self::AlreadyConnected => libc::EISCONN,
            Self::Resolve(_) => ERR_DNS_RESOLUTION_FAILED,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn os_code(error: &io::Error) -> i32 {
    error.raw_os_error().unwrap_or(libc::EIO)
}

/// Human readable description of an error callback code.
pub fn error_to_string(code: i32) -> String {
    match code {
        0 => "OK".to_owned(),
        ERR_DNS_RESOLUTION_FAILED => "DNS failed".to_owned(),
        code => io::Error::from_raw_os_error(code).to_string(),
    }
}
