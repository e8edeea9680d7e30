//! Outbound and accepted TCP connections.

use crate::error::{ERR_DNS_RESOLUTION_FAILED, Error, Result, os_code};
use crate::net::callbacks::{ClientCallbacks, ClientEvent};
use crate::net::write_queue::{ApiFlags, BorrowedSlice, Payload, WriteQueue};
use crate::reactor::connection::{Connection, ManagedConnection};
use crate::reactor::core::Registry;
use crate::reactor::{poller, socket};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, error, trace, warn};

use std::cell::Cell;
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Lifecycle state of a [`Client`].
///
/// A socket that is still connecting keeps its previous state until the reactor
/// observes writability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    WaitingForDns,
    Connected,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::WaitingForDns,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::WaitingForDns => 1,
            Self::Connected => 2,
        }
    }
}

struct Timeouts {
    ack: Option<Duration>,
    rx: Option<Duration>,
    rx_last_packet: Instant,
}

#[derive(Default)]
struct Target {
    ip: Option<IpAddr>,
    port: u16,
}

pub(crate) struct ClientCore {
    connection: Connection,
    state: AtomicU8,
    queue: Mutex<WriteQueue>,
    /// Serializes sent-callback delivery and teardown. Set while a delivery
    /// pass is running.
    delivery: ReentrantMutex<Cell<bool>>,
    timeouts: Mutex<Timeouts>,
    target: Mutex<Target>,
    callbacks: ClientCallbacks,
}

impl ClientCore {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.state.swap(state.as_u8(), Ordering::AcqRel))
    }
}

impl ManagedConnection for ClientCore {
    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn pending_write(&self) -> bool {
        self.connection.is_open()
            && (self.state() != ConnectionState::Connected || !self.queue.lock().is_empty())
    }

    fn on_writable(self: Arc<Self>) -> bool {
        Client { core: self }.handle_writable()
    }

    fn on_readable(self: Arc<Self>, buffer: &mut [u8]) {
        Client { core: self }.handle_readable(buffer);
    }

    fn on_delayed_connect(self: Arc<Self>) {
        Client { core: self }.handle_delayed_connect();
    }

    fn on_poll_tick(self: Arc<Self>) {
        Client { core: self }.handle_poll_tick();
    }

    fn on_cycle_done(self: Arc<Self>) {
        let client = Client { core: self };
        if client.connected() {
            client.cleanup_write_queue();
        }
    }
}

/// Handle to one TCP connection driven by a [`Registry`].
///
/// Handles are cheap to clone and all refer to the same connection. Dropping
/// the last one closes the socket without firing any callback.
///
/// Callbacks run on the reactor thread, except those triggered by a direct
/// [`close`](Self::close), [`abort`](Self::abort) or [`send`](Self::send) call,
/// which run on the calling thread. A callback that captures a handle to its own
/// client keeps that client alive until the callback is replaced.
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

impl Client {
    /// Creates a disconnected client registered with `registry`.
    pub fn new(registry: &Registry) -> Self {
        let config = registry.config();
        let core = registry.manage(|connection| ClientCore {
            connection,
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            queue: Mutex::new(WriteQueue::new(config.write_space)),
            delivery: ReentrantMutex::new(Cell::new(false)),
            timeouts: Mutex::new(Timeouts {
                ack: config.max_ack_time,
                rx: None,
                rx_last_packet: Instant::now(),
            }),
            target: Mutex::new(Target::default()),
            callbacks: ClientCallbacks::default(),
        });

        Self { core }
    }

    /// Wraps an accepted, already configured socket.
    pub(crate) fn from_socket(registry: &Registry, file_descriptor: RawFd) -> Self {
        let client = Self::new(registry);

        if !client.core.connection.install_socket(file_descriptor) {
            socket::close(file_descriptor);
            return client;
        }

        if let Ok(peer) = socket::peer_addr(file_descriptor) {
            let mut target = client.core.target.lock();
            target.ip = Some(peer.ip());
            target.port = peer.port();
        }

        client.core.set_state(ConnectionState::Connected);
        client.core.timeouts.lock().rx_last_packet = Instant::now();

        client
    }

    /// Starts a non-blocking connect to `ip:port`.
    ///
    /// Returns once the connection attempt is under way; the connect callback
    /// fires when it completes, the error callback if it fails.
    pub fn connect(&self, ip: IpAddr, port: u16) -> Result<()> {
        let connection = &self.core.connection;
        if connection.is_open() {
            warn!(key = connection.key(), "connect on an open connection");
            return Err(Error::AlreadyConnected);
        }

        let address = SocketAddr::new(ip, port);
        let file_descriptor = socket::stream_socket(&address).map_err(|source| {
            error!(%address, error = %source, "failed to create socket");
            Error::Socket(source)
        })?;

        if let Err(source) = socket::connect(file_descriptor, &address) {
            error!(%address, error = %source, "connect failed");
            socket::close(file_descriptor);
            return Err(Error::Connect {
                addr: address,
                source,
            });
        }

        {
            let mut target = self.core.target.lock();
            target.ip = Some(ip);
            target.port = port;
        }

        if !connection.install_socket(file_descriptor) {
            socket::close(file_descriptor);
            return Err(Error::AlreadyConnected);
        }

        debug!(key = connection.key(), fd = file_descriptor, %address, "connecting");

        Ok(())
    }

    /// Connects to `host:port`, resolving `host` on a background thread.
    ///
    /// IP literals connect immediately. Otherwise the client enters
    /// [`ConnectionState::WaitingForDns`] and the reactor connects once the
    /// lookup finishes; a failed lookup is reported to the error callback with
    /// [`ERR_DNS_RESOLUTION_FAILED`].
    pub fn connect_host(&self, host: &str, port: u16) -> Result<()> {
        if host.is_empty() {
            return Err(Error::Resolve("empty host name".to_owned()));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.connect(ip, port);
        }

        if self.core.connection.is_open() || self.state() == ConnectionState::WaitingForDns {
            warn!(key = self.core.connection.key(), "connect on an open connection");
            return Err(Error::AlreadyConnected);
        }

        {
            let mut target = self.core.target.lock();
            target.ip = None;
            target.port = port;
        }
        self.core.set_state(ConnectionState::WaitingForDns);

        let core = Arc::downgrade(&self.core);
        let name = host.to_owned();
        let spawned = thread::Builder::new()
            .name("asyncsock-dns".to_owned())
            .spawn(move || finish_resolution(core, resolve(&name, port)));

        if let Err(source) = spawned {
            error!(host, error = %source, "failed to spawn resolver thread");
            self.core.set_state(ConnectionState::Disconnected);
            return Err(Error::Resolve(source.to_string()));
        }

        debug!(key = self.core.connection.key(), host, port, "resolving");

        Ok(())
    }

    /// Closes the connection, discarding unsent data.
    ///
    /// Idempotent: the disconnect callback fires once per established or pending
    /// connection. Closing is always immediate, `now` has no effect.
    pub fn close(&self, now: bool) {
        trace!(key = self.core.connection.key(), now, "close requested");
        self.close_connection();
    }

    /// Resets the connection instead of closing it gracefully.
    ///
    /// Returns `ECONNABORTED`.
    pub fn abort(&self) -> i32 {
        let file_descriptor = self.core.connection.socket();
        if file_descriptor >= 0 {
            if let Err(error) = socket::set_linger_reset(file_descriptor) {
                debug!(%error, "zero linger not supported, closing normally");
            }
        }

        self.close_connection();

        libc::ECONNABORTED
    }

    /// Queues a copy of up to [`space`](Self::space) bytes of `data`.
    ///
    /// Returns the number of bytes accepted, `0` when not connected or out of
    /// budget. Nothing is transmitted until the next reactor cycle or
    /// [`send`](Self::send).
    pub fn add(&self, data: &[u8], flags: ApiFlags) -> usize {
        self.enqueue(data.len(), flags, |len| Payload::Owned(data[..len].into()))
    }

    /// Queues `data` without copying unless [`ApiFlags::COPY`] is set.
    pub fn add_static(&self, data: &'static [u8], flags: ApiFlags) -> usize {
        self.enqueue(data.len(), flags, |len| {
            if flags.contains(ApiFlags::COPY) {
                Payload::Owned(data[..len].into())
            } else {
                Payload::Static(&data[..len])
            }
        })
    }

    /// Queues a view into `data` unless [`ApiFlags::COPY`] is set.
    ///
    /// # Safety
    ///
    /// Without `COPY`, the accepted bytes of `data` must stay valid and
    /// unmodified until the sent callback reports them or the connection is
    /// closed.
    pub unsafe fn add_borrowed(&self, data: &[u8], flags: ApiFlags) -> usize {
        self.enqueue(data.len(), flags, |len| {
            if flags.contains(ApiFlags::COPY) {
                Payload::Owned(data[..len].into())
            } else {
                Payload::Borrowed(unsafe { BorrowedSlice::new(&data[..len]) })
            }
        })
    }

    fn enqueue<F>(&self, len: usize, flags: ApiFlags, payload: F) -> usize
    where
        F: FnOnce(usize) -> Payload,
    {
        if !self.connected() || len == 0 {
            return 0;
        }

        let mut queue = self.core.queue.lock();
        let accepted = queue.space().min(len);
        if accepted == 0 {
            return 0;
        }

        queue.push(payload(accepted), flags.contains(ApiFlags::MORE), Instant::now())
    }

    /// Transmits queued data now if the socket is writable.
    ///
    /// Runs on the calling thread, so sent, error and disconnect callbacks may
    /// fire here. Returns whether the queue was processed.
    pub fn send(&self) -> bool {
        let file_descriptor = self.core.connection.socket();
        if file_descriptor < 0 || !self.connected() {
            return false;
        }

        if !poller::probe_writable(file_descriptor) {
            return false;
        }

        self.drain_write_queue();
        self.cleanup_write_queue();

        true
    }

    /// [`add`](Self::add) followed by [`send`](Self::send).
    pub fn write(&self, data: &[u8], flags: ApiFlags) -> usize {
        let accepted = self.add(data, flags);
        if accepted > 0 {
            self.send();
        }

        accepted
    }

    pub fn write_str(&self, data: &str) -> usize {
        self.write(data.as_bytes(), ApiFlags::COPY)
    }

    /// Sets how long the head of the write queue may wait to be fully written
    /// before the timeout callback fires. `None` disables the check.
    pub fn set_ack_timeout(&self, timeout: Option<Duration>) {
        self.core.timeouts.lock().ack = timeout;
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.core.timeouts.lock().ack
    }

    /// Sets how long the connection may stay silent before it is closed.
    /// `None` disables the check.
    pub fn set_rx_timeout(&self, timeout: Option<Duration>) {
        let mut timeouts = self.core.timeouts.lock();
        timeouts.rx = timeout;
        timeouts.rx_last_packet = Instant::now();
    }

    pub fn rx_timeout(&self) -> Option<Duration> {
        self.core.timeouts.lock().rx
    }

    /// Toggles `TCP_NODELAY`. Returns `false` if the socket is closed or the
    /// option could not be set.
    pub fn set_no_delay(&self, enabled: bool) -> bool {
        match self.core.connection.set_no_delay(enabled) {
            Ok(()) => true,
            Err(error) => {
                debug!(%error, "failed to set TCP_NODELAY");
                false
            }
        }
    }

    pub fn no_delay(&self) -> bool {
        self.core.connection.no_delay()
    }

    /// Bytes that can still be queued, `0` while not connected.
    pub fn space(&self) -> usize {
        if !self.connected() {
            return 0;
        }

        self.core.queue.lock().space()
    }

    pub fn can_send(&self) -> bool {
        self.space() > 0
    }

    /// Buffers in the write queue, including written ones not yet acknowledged
    /// to the sent callback.
    pub fn queued_buffers(&self) -> usize {
        self.core.queue.lock().len()
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether the connection is fully closed and no resolution is pending.
    pub fn freeable(&self) -> bool {
        !self.is_open() && self.state() == ConnectionState::Disconnected
    }

    /// Whether a socket is open, including one still connecting.
    pub fn is_open(&self) -> bool {
        self.core.connection.is_open()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self.core.connection.socket() {
            file_descriptor if file_descriptor >= 0 => socket::peer_addr(file_descriptor).ok(),
            _ => None,
        }
    }

    /// Peer address, falling back to the last connect target.
    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_addr()
            .map(|address| address.ip())
            .or_else(|| self.core.target.lock().ip)
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_addr()
            .map_or_else(|| self.core.target.lock().port, |address| address.port())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.core.connection.socket() {
            file_descriptor if file_descriptor >= 0 => socket::local_addr(file_descriptor).ok(),
            _ => None,
        }
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        self.local_addr().map(|address| address.ip())
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr().map_or(0, |address| address.port())
    }

    /// Fires once the connection is established.
    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.core.callbacks.set_connect(Some(Arc::new(handler)));
    }

    /// Fires once per connection, after which no other callback fires for it.
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.core.callbacks.set_disconnect(Some(Arc::new(handler)));
    }

    /// Fires on every idle-poll tick while connected.
    pub fn on_poll<F>(&self, handler: F)
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.core.callbacks.set_poll(Some(Arc::new(handler)));
    }

    /// Fires once per fully written buffer, in queue order.
    pub fn on_ack<F>(&self, handler: F)
    where
        F: Fn(&Client, usize, u32) + Send + Sync + 'static,
    {
        self.core.callbacks.set_ack(Some(Arc::new(handler)));
    }

    pub fn on_data<F>(&self, handler: F)
    where
        F: Fn(&Client, &[u8]) + Send + Sync + 'static,
    {
        self.core.callbacks.set_data(Some(Arc::new(handler)));
    }

    /// Fires before the connection is closed because of a failure.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Client, i32) + Send + Sync + 'static,
    {
        self.core.callbacks.set_error(Some(Arc::new(handler)));
    }

    /// Fires at most once until more data is queued or the client reconnects.
    /// The connection stays open.
    pub fn on_timeout<F>(&self, handler: F)
    where
        F: Fn(&Client, u32) + Send + Sync + 'static,
    {
        self.core.callbacks.set_timeout(Some(Arc::new(handler)));
    }

    fn invoke(&self, event: ClientEvent<'_>) {
        self.core.callbacks.invoke(self, event);
    }

    fn close_connection(&self) {
        let _delivery = self.core.delivery.lock();
        let previous = self.core.set_state(ConnectionState::Disconnected);

        match self.core.connection.take_socket() {
            Some(file_descriptor) => socket::close(file_descriptor),
            None if previous != ConnectionState::WaitingForDns => return,
            None => {}
        }

        self.core.queue.lock().clear();
        debug!(key = self.core.connection.key(), "connection closed");

        self.invoke(ClientEvent::Disconnect);
    }

    /// Reports `code` to the error callback, then closes.
    fn fail(&self, code: i32) {
        let _delivery = self.core.delivery.lock();
        if !self.is_open() && self.state() != ConnectionState::WaitingForDns {
            return;
        }

        debug!(key = self.core.connection.key(), code, "connection failed");
        self.invoke(ClientEvent::Error(code));
        self.close_connection();
    }

    fn handle_writable(&self) -> bool {
        if self.connected() {
            return self.drain_write_queue() > 0;
        }

        let file_descriptor = self.core.connection.socket();
        if file_descriptor < 0 {
            return false;
        }

        match socket::take_error(file_descriptor) {
            Ok(0) => {}
            Ok(code) => {
                self.fail(code);
                return true;
            }
            Err(error) => {
                self.fail(os_code(&error));
                return true;
            }
        }

        self.core.set_state(ConnectionState::Connected);
        self.core.timeouts.lock().rx_last_packet = Instant::now();
        self.core.queue.lock().reset_ack_timeout();
        debug!(key = self.core.connection.key(), fd = file_descriptor, "connected");

        self.invoke(ClientEvent::Connect);

        if self.connected() {
            self.drain_write_queue();
        }

        true
    }

    fn handle_readable(&self, buffer: &mut [u8]) {
        let file_descriptor = self.core.connection.socket();
        if file_descriptor < 0 {
            return;
        }

        match socket::recv(file_descriptor, buffer) {
            Ok(0) => {
                debug!(key = self.core.connection.key(), "remote closed");
                self.close_connection();
            }
            Ok(received) => {
                trace!(key = self.core.connection.key(), received, "received");
                self.core.timeouts.lock().rx_last_packet = Instant::now();
                self.invoke(ClientEvent::Data(&buffer[..received]));
            }
            Err(error) if socket::is_transient(&error) => {}
            Err(error) => {
                error!(key = self.core.connection.key(), %error, "read failed");
                self.fail(os_code(&error));
            }
        }
    }

    fn handle_delayed_connect(&self) {
        if self.state() != ConnectionState::WaitingForDns {
            return;
        }

        let (ip, port) = {
            let target = self.core.target.lock();
            (target.ip, target.port)
        };

        match ip {
            Some(ip) => {
                if let Err(error) = self.connect(ip, port) {
                    self.fail(error.code());
                }
            }
            None => self.fail(ERR_DNS_RESOLUTION_FAILED),
        }
    }

    fn handle_poll_tick(&self) {
        if !self.connected() {
            return;
        }

        self.cleanup_write_queue();
        if !self.connected() {
            return;
        }

        let now = Instant::now();
        if self.check_ack_timeout(now) {
            return;
        }

        if self.rx_timed_out(now) {
            debug!(key = self.core.connection.key(), "receive timeout");
            self.close_connection();
            return;
        }

        self.invoke(ClientEvent::Poll);
    }

    fn check_ack_timeout(&self, now: Instant) -> bool {
        let Some(timeout) = self.core.timeouts.lock().ack else {
            return false;
        };

        let stall = {
            let mut queue = self.core.queue.lock();
            if queue.ack_timeout_signaled() {
                return false;
            }

            match queue.head_stall(now) {
                Some(stall) if stall >= timeout => {
                    queue.signal_ack_timeout();
                    stall
                }
                _ => return false,
            }
        };

        let delay = u32::try_from(stall.as_millis()).unwrap_or(u32::MAX);
        debug!(key = self.core.connection.key(), delay, "ack timeout");
        self.invoke(ClientEvent::Timeout(delay));

        true
    }

    fn rx_timed_out(&self, now: Instant) -> bool {
        let mut timeouts = self.core.timeouts.lock();
        let Some(timeout) = timeouts.rx else {
            return false;
        };

        if now.saturating_duration_since(timeouts.rx_last_packet) < timeout {
            return false;
        }

        if poller::probe_readable(self.core.connection.socket()) {
            timeouts.rx_last_packet = now;
            return false;
        }

        true
    }

    fn drain_write_queue(&self) -> usize {
        let file_descriptor = self.core.connection.socket();
        if file_descriptor < 0 {
            return 0;
        }

        let written = self
            .core
            .queue
            .lock()
            .drain(Instant::now(), |data, more| socket::send(file_descriptor, data, more));

        if written > 0 {
            trace!(key = self.core.connection.key(), written, "written");
        }

        written
    }

    /// Delivers sent callbacks for finished buffers, then takes the error path
    /// if a write failed.
    ///
    /// Only one thread delivers at a time. A call made from inside one of these
    /// callbacks returns at once; the running pass picks up what it finished.
    fn cleanup_write_queue(&self) {
        let delivery = self.core.delivery.lock();
        if delivery.replace(true) {
            return;
        }

        loop {
            let finished = self.core.queue.lock().collect_finished();
            if finished.acked.is_empty() && finished.error.is_none() {
                break;
            }

            if let Some(written_at) = finished.last_written {
                let mut timeouts = self.core.timeouts.lock();
                timeouts.rx_last_packet = timeouts.rx_last_packet.max(written_at);
            }

            for (len, delay) in finished.acked {
                if !self.connected() {
                    break;
                }
                self.invoke(ClientEvent::Ack { len, delay });
            }

            if let Some(code) = finished.error {
                error!(key = self.core.connection.key(), code, "write failed");
                self.fail(code);
                break;
            }
        }

        delivery.set(false);
    }
}

fn resolve(host: &str, port: u16) -> Option<IpAddr> {
    let addresses: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
        Ok(addresses) => addresses.collect(),
        Err(error) => {
            debug!(host, %error, "resolution failed");
            return None;
        }
    };

    addresses
        .iter()
        .find(|address| address.is_ipv4())
        .or_else(|| addresses.first())
        .map(|address| address.ip())
}

fn finish_resolution(core: Weak<ClientCore>, ip: Option<IpAddr>) {
    let Some(core) = core.upgrade() else {
        return;
    };

    if core.state() != ConnectionState::WaitingForDns {
        return;
    }

    core.target.lock().ip = ip;
    core.connection.finish_dns();
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("key", &self.core.connection.key())
            .field("socket", &self.core.connection.socket())
            .field("state", &self.state())
            .finish()
    }
}
