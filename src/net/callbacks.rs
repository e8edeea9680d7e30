//! Per-connection callback tables.
//!
//! Handlers are cloned out of the table and called after its lock is released,
//! so a handler may replace handlers or call back into its connection.

use crate::net::client::Client;

use parking_lot::Mutex;
use tracing::trace;

use std::sync::Arc;

pub type ConnectHandler = Arc<dyn Fn(&Client) + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn(&Client) + Send + Sync>;
pub type PollHandler = Arc<dyn Fn(&Client) + Send + Sync>;
/// Called with the acknowledged length and the queue-to-wire delay in milliseconds.
pub type AckHandler = Arc<dyn Fn(&Client, usize, u32) + Send + Sync>;
/// The slice is only valid for the duration of the call.
pub type DataHandler = Arc<dyn Fn(&Client, &[u8]) + Send + Sync>;
/// Called with an OS error code or [`ERR_DNS_RESOLUTION_FAILED`](crate::ERR_DNS_RESOLUTION_FAILED).
pub type ErrorHandler = Arc<dyn Fn(&Client, i32) + Send + Sync>;
/// Called with the time in milliseconds the head of the write queue has been stuck.
pub type TimeoutHandler = Arc<dyn Fn(&Client, u32) + Send + Sync>;
/// Receives sole ownership of the accepted connection.
pub type AcceptHandler = Arc<dyn Fn(Client) + Send + Sync>;

/// An event delivered to a client's handlers.
#[derive(Clone, Copy)]
pub(crate) enum ClientEvent<'a> {
    Connect,
    Disconnect,
    Poll,
    Ack { len: usize, delay: u32 },
    Data(&'a [u8]),
    Error(i32),
    Timeout(u32),
}

impl ClientEvent<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Poll => "poll",
            Self::Ack { .. } => "ack",
            Self::Data(_) => "data",
            Self::Error(_) => "error",
            Self::Timeout(_) => "timeout",
        }
    }
}

#[derive(Default)]
struct ClientHandlers {
    connect: Option<ConnectHandler>,
    disconnect: Option<DisconnectHandler>,
    poll: Option<PollHandler>,
    ack: Option<AckHandler>,
    data: Option<DataHandler>,
    error: Option<ErrorHandler>,
    timeout: Option<TimeoutHandler>,
}

#[derive(Default)]
pub(crate) struct ClientCallbacks {
    handlers: Mutex<ClientHandlers>,
}

impl ClientCallbacks {
    pub(crate) fn set_connect(&self, handler: Option<ConnectHandler>) {
        self.handlers.lock().connect = handler;
    }

    pub(crate) fn set_disconnect(&self, handler: Option<DisconnectHandler>) {
        self.handlers.lock().disconnect = handler;
    }

    pub(crate) fn set_poll(&self, handler: Option<PollHandler>) {
        self.handlers.lock().poll = handler;
    }

    pub(crate) fn set_ack(&self, handler: Option<AckHandler>) {
        self.handlers.lock().ack = handler;
    }

    pub(crate) fn set_data(&self, handler: Option<DataHandler>) {
        self.handlers.lock().data = handler;
    }

    pub(crate) fn set_error(&self, handler: Option<ErrorHandler>) {
        self.handlers.lock().error = handler;
    }

    pub(crate) fn set_timeout(&self, handler: Option<TimeoutHandler>) {
        self.handlers.lock().timeout = handler;
    }

    /// Calls the handler registered for `event`, if any.
    pub(crate) fn invoke(&self, client: &Client, event: ClientEvent<'_>) {
        trace!(event = event.name(), "dispatching client callback");

        match event {
            ClientEvent::Connect => {
                let handler = self.handlers.lock().connect.clone();
                if let Some(handler) = handler {
                    handler(client);
                }
            }
            ClientEvent::Disconnect => {
                let handler = self.handlers.lock().disconnect.clone();
                if let Some(handler) = handler {
                    handler(client);
                }
            }
            ClientEvent::Poll => {
                let handler = self.handlers.lock().poll.clone();
                if let Some(handler) = handler {
                    handler(client);
                }
            }
            ClientEvent::Ack { len, delay } => {
                let handler = self.handlers.lock().ack.clone();
                if let Some(handler) = handler {
                    handler(client, len, delay);
                }
            }
            ClientEvent::Data(data) => {
                let handler = self.handlers.lock().data.clone();
                if let Some(handler) = handler {
                    handler(client, data);
                }
            }
            ClientEvent::Error(code) => {
                let handler = self.handlers.lock().error.clone();
                if let Some(handler) = handler {
                    handler(client, code);
                }
            }
            ClientEvent::Timeout(delay) => {
                let handler = self.handlers.lock().timeout.clone();
                if let Some(handler) = handler {
                    handler(client, delay);
                }
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct ServerCallbacks {
    accept: Mutex<Option<AcceptHandler>>,
}

impl ServerCallbacks {
    pub(crate) fn set_accept(&self, handler: Option<AcceptHandler>) {
        *self.accept.lock() = handler;
    }

    /// Hands `client` to the accept handler, or gives it back if none is set.
    pub(crate) fn invoke_accept(&self, client: Client) -> Result<(), Client> {
        let handler = self.accept.lock().clone();

        match handler {
            Some(handler) => {
                handler(client);
                Ok(())
            }
            None => Err(client),
        }
    }
}
