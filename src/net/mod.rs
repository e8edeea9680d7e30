//! TCP clients and servers driven by a [`Registry`](crate::Registry).
//!
//! - [`client`]: [`Client`], one outbound or accepted connection
//! - [`server`]: [`Server`], a listener producing clients
//! - [`callbacks`]: handler types of both
//! - [`write_queue`]: [`ApiFlags`] for queued writes
//!
//! # Example
//!
//! ```no_run
//! use asyncsock::{ApiFlags, Registry, Server};
//! use std::sync::{Arc, Mutex};
//!
//! let registry = Registry::new().expect("reactor");
//! let server = Server::new(&registry, 8080);
//! let clients = Arc::new(Mutex::new(Vec::new()));
//!
//! let accepted = Arc::clone(&clients);
//! server.on_client(move |client| {
//!     client.on_data(|client, data| {
//!         client.write(data, ApiFlags::COPY);
//!     });
//!     accepted.lock().unwrap().push(client);
//! });
//! server.begin().expect("listen");
//! ```
//!
//! [`Client`]: client::Client
//! [`Server`]: server::Server
//! [`ApiFlags`]: write_queue::ApiFlags

pub mod callbacks;
pub mod client;
pub mod server;
pub(crate) mod utils;
pub mod write_queue;
