//! Listening sockets that hand accepted connections to a callback.

use crate::error::{Error, Result};
use crate::net::callbacks::ServerCallbacks;
use crate::net::client::Client;
use crate::reactor::connection::{Connection, ManagedConnection};
use crate::reactor::core::Registry;
use crate::reactor::socket;

use tracing::{debug, error, warn};

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Pending-connection queue length passed to `listen(2)`.
pub const BACKLOG: i32 = 5;

pub(crate) struct ServerCore {
    connection: Connection,
    address: SocketAddr,
    no_delay: AtomicBool,
    callbacks: ServerCallbacks,
}

impl ManagedConnection for ServerCore {
    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn is_server(&self) -> bool {
        true
    }

    fn on_readable(self: Arc<Self>, _buffer: &mut [u8]) {
        let listener = self.connection.socket();
        if listener < 0 {
            return;
        }

        let file_descriptor = match socket::accept(listener) {
            Ok(file_descriptor) => file_descriptor,
            Err(error) if socket::is_transient(&error) => return,
            Err(error) => {
                error!(address = %self.address, %error, "accept failed");
                return;
            }
        };

        let client = Client::from_socket(self.connection.registry(), file_descriptor);
        client.set_no_delay(self.no_delay.load(Ordering::Relaxed));
        debug!(address = %self.address, fd = file_descriptor, "accepted connection");

        if let Err(client) = self.callbacks.invoke_accept(client) {
            warn!(address = %self.address, "no accept handler installed, closing connection");
            client.close(true);
        }
    }
}

/// A listening TCP socket.
///
/// Each accepted connection becomes a connected [`Client`] registered with the
/// same [`Registry`] and is moved into the handler set with
/// [`on_client`](Self::on_client). Dropping the server stops listening.
#[derive(Clone)]
pub struct Server {
    core: Arc<ServerCore>,
}

impl Server {
    /// A server for `port` on every IPv4 interface.
    pub fn new(registry: &Registry, port: u16) -> Self {
        Self::with_addr(registry, IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    pub fn with_addr(registry: &Registry, ip: IpAddr, port: u16) -> Self {
        let core = registry.manage(|connection| ServerCore {
            connection,
            address: SocketAddr::new(ip, port),
            no_delay: AtomicBool::new(false),
            callbacks: ServerCallbacks::default(),
        });

        Self { core }
    }

    /// Starts listening. A no-op if already listening.
    pub fn begin(&self) -> Result<()> {
        if self.core.connection.is_open() {
            return Ok(());
        }

        let address = self.core.address;
        let file_descriptor = socket::stream_socket(&address).map_err(|source| {
            error!(%address, error = %source, "failed to create listening socket");
            Error::Socket(source)
        })?;

        if let Err(error) = configure_listener(file_descriptor, &address) {
            socket::close(file_descriptor);
            return Err(error);
        }

        if !self.core.connection.install_socket(file_descriptor) {
            socket::close(file_descriptor);
            return Ok(());
        }

        debug!(%address, fd = file_descriptor, "listening");

        Ok(())
    }

    /// Stops listening. Accepted clients are unaffected.
    pub fn end(&self) {
        if let Some(file_descriptor) = self.core.connection.take_socket() {
            socket::close(file_descriptor);
            debug!(address = %self.core.address, "stopped listening");
        }
    }

    pub fn is_open(&self) -> bool {
        self.core.connection.is_open()
    }

    /// The bound address, with the actual port when bound to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.core.connection.socket() {
            file_descriptor if file_descriptor >= 0 => socket::local_addr(file_descriptor).ok(),
            _ => None,
        }
    }

    /// Whether `TCP_NODELAY` is set on accepted connections. Defaults to `false`.
    pub fn set_no_delay(&self, enabled: bool) {
        self.core.no_delay.store(enabled, Ordering::Relaxed);
    }

    pub fn no_delay(&self) -> bool {
        self.core.no_delay.load(Ordering::Relaxed)
    }

    /// Installs the accept handler, which takes ownership of every new client.
    pub fn on_client<F>(&self, handler: F)
    where
        F: Fn(Client) + Send + Sync + 'static,
    {
        self.core.callbacks.set_accept(Some(Arc::new(handler)));
    }
}

fn configure_listener(file_descriptor: RawFd, address: &SocketAddr) -> Result<()> {
    let failed = |source: io::Error, operation: &str| {
        error!(%address, error = %source, operation, "failed to set up listener");
        source
    };

    socket::set_reuse_address(file_descriptor)
        .map_err(|source| Error::Socket(failed(source, "setsockopt")))?;

    socket::bind(file_descriptor, address).map_err(|source| Error::Bind {
        addr: *address,
        source: failed(source, "bind"),
    })?;

    socket::listen(file_descriptor, BACKLOG).map_err(|source| Error::Listen {
        addr: *address,
        source: failed(source, "listen"),
    })?;

    Ok(())
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.core.address)
            .field("socket", &self.core.connection.socket())
            .field("no_delay", &self.no_delay())
            .finish()
    }
}
