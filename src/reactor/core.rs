use crate::builder::RegistryBuilder;
use crate::config::ReactorConfig;
use crate::error::{Error, Result};
use crate::reactor::connection::{Connection, ManagedConnection};
use crate::reactor::poller::{self, FdSet};
use crate::utils::slab::Slab;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

type Snapshot = Vec<Arc<dyn ManagedConnection>>;

/// Handle to a reactor thread and the connections it drives.
///
/// Clients and servers are created against a `Registry` and register
/// themselves with it. The handle is cheap to clone; the reactor thread stops
/// once every handle (including the ones held by live connections) is gone, or
/// when [`Registry::shutdown`] is called.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: ReactorConfig,
    connections: Mutex<Slab<Weak<dyn ManagedConnection>>>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    /// Starts a reactor with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(ReactorConfig::default())
    }

    /// Starts a reactor with `config`.
    pub fn with_config(config: ReactorConfig) -> Result<Self> {
        let inner = Arc::new(RegistryInner {
            connections: Mutex::new(Slab::with_capacity(config.max_connections)),
            running: AtomicBool::new(true),
            thread: Mutex::new(None),
            config,
        });

        let mut thread = thread::Builder::new().name(inner.config.thread_name.clone());
        if let Some(stack_size) = inner.config.stack_size {
            thread = thread.stack_size(stack_size);
        }

        let weak = Arc::downgrade(&inner);
        let handle = thread.spawn(move || run(weak)).map_err(|source| {
            error!(error = %source, "failed to spawn reactor thread");
            Error::ReactorSpawn(source)
        })?;

        debug!(thread = %inner.config.thread_name, "reactor started");
        *inner.thread.lock() = Some(handle);

        Ok(Self { inner })
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.inner.config
    }

    /// Number of registered clients and servers.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Whether servers are still polled for new connections.
    pub fn has_free_socket(&self) -> bool {
        self.connection_count() < self.inner.config.max_connections
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Stops the reactor thread.
    ///
    /// Joins the thread unless called from the reactor thread itself, for
    /// example from inside a callback. Connections stay registered but are no
    /// longer serviced.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }

            if handle.join().is_err() {
                error!("reactor thread panicked");
            }
        }

        debug!("reactor stopped");
    }

    pub(crate) fn register(&self, connection: Weak<dyn ManagedConnection>) -> usize {
        let key = self.inner.connections.lock().insert(connection);
        trace!(key, "connection registered");

        key
    }

    /// Removing an unknown key is a no-op.
    pub(crate) fn unregister(&self, key: usize) {
        let removed = self.inner.connections.lock().remove(key);

        if removed.is_some() {
            trace!(key, "connection unregistered");
        }
    }

    /// Allocates a connection of kind `T` registered with this registry.
    pub(crate) fn manage<T, F>(&self, build: F) -> Arc<T>
    where
        T: ManagedConnection + 'static,
        F: FnOnce(Connection) -> T,
    {
        Arc::new_cyclic(|weak: &Weak<T>| {
            let weak: Weak<dyn ManagedConnection> = weak.clone();
            let key = self.register(weak);

            build(Connection::new(key, self.clone()))
        })
    }

    /// Strong references to every live connection.
    ///
    /// The returned `Vec` must be dropped without the registry lock held, since
    /// releasing the last reference unregisters the connection.
    fn snapshot(&self) -> Snapshot {
        let connections = self.inner.connections.lock();

        connections
            .iter()
            .filter_map(|(_, connection)| connection.upgrade())
            .collect()
    }

    fn cycle(&self, buffer: &mut [u8]) {
        let config = &self.inner.config;

        let mut read = FdSet::new();
        let mut write = FdSet::new();
        let mut polled = HashSet::new();

        let connections = self.snapshot();
        let accepting = self.has_free_socket();

        for connection in &connections {
            let file_descriptor = connection.connection().socket();
            if file_descriptor < 0 {
                continue;
            }

            if connection.is_server() {
                if accepting {
                    add_to_set(&mut read, file_descriptor);
                }
            } else {
                add_to_set(&mut read, file_descriptor);
                if connection.pending_write() {
                    add_to_set(&mut write, file_descriptor);
                }
            }

            polled.insert((connection.connection().key(), file_descriptor));
        }
        drop(connections);

        match poller::select(&mut read, &mut write, config.poll_interval) {
            Ok(0) => {}
            Ok(ready) => {
                trace!(ready, "sockets ready");
                self.dispatch_io(&read, &write, &polled, buffer);
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => error!(%error, "select failed"),
        }

        let connections = self.snapshot();

        for connection in &connections {
            if connection.connection().take_dns_finished() {
                Arc::clone(connection).on_delayed_connect();
            }
        }

        let now = Instant::now();
        for connection in &connections {
            let record = connection.connection();
            if now.saturating_duration_since(record.last_active()) >= config.poll_interval {
                record.set_last_active(now);
                Arc::clone(connection).on_poll_tick();
            }
        }

        for connection in &connections {
            Arc::clone(connection).on_cycle_done();
        }
    }

    fn dispatch_io(
        &self,
        read: &FdSet,
        write: &FdSet,
        polled: &HashSet<(usize, RawFd)>,
        buffer: &mut [u8],
    ) {
        let connections = self.snapshot();

        // Only descriptors that were part of the wait count; a socket closed and
        // reopened in the meantime may carry a recycled number.
        let ready = |connection: &Arc<dyn ManagedConnection>, set: &FdSet| {
            let record = connection.connection();
            let file_descriptor = record.socket();

            file_descriptor >= 0
                && set.contains(file_descriptor)
                && polled.contains(&(record.key(), file_descriptor))
        };

        for connection in connections.iter().filter(|c| !c.is_server()) {
            if ready(connection, write) && Arc::clone(connection).on_writable() {
                connection.connection().set_last_active(Instant::now());
            }
        }

        for connection in connections.iter().filter(|c| !c.is_server()) {
            if ready(connection, read) {
                connection.connection().set_last_active(Instant::now());
                Arc::clone(connection).on_readable(buffer);
            }
        }

        for connection in connections.iter().filter(|c| c.is_server()) {
            if ready(connection, read) {
                Arc::clone(connection).on_readable(buffer);
            }
        }
    }
}

fn add_to_set(set: &mut FdSet, file_descriptor: RawFd) {
    if !set.insert(file_descriptor) {
        warn!(fd = file_descriptor, "descriptor exceeds FD_SETSIZE, not polled");
    }
}

fn run(registry: Weak<RegistryInner>) {
    let mut buffer = match registry.upgrade() {
        Some(inner) => vec![0u8; inner.config.read_buffer_size.max(1)],
        None => return,
    };

    while let Some(inner) = registry.upgrade() {
        if !inner.running.load(Ordering::Acquire) {
            break;
        }

        Registry { inner }.cycle(&mut buffer);
    }

    trace!("reactor thread exiting");
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.inner.config)
            .field("connections", &self.connection_count())
            .field("running", &self.is_running())
            .finish()
    }
}
