use asyncsock::{
    Client, DEFAULT_POLL_INTERVAL, ERR_DNS_RESOLUTION_FAILED, ReactorConfig, Registry, Server,
    error_to_string,
};

use std::time::{Duration, Instant};

/// The reactor may briefly hold a connection while it runs a cycle.
fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    condition()
}

#[test]
fn default_config_matches_defaults() {
    let config = ReactorConfig::default();

    assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
    assert_eq!(config.poll_interval, Duration::from_millis(125));
    assert_eq!(config.max_ack_time, Some(Duration::from_millis(5000)));
    assert_eq!(config.write_space, 5744);
    assert_eq!(config.read_buffer_size, 1436);
    assert_eq!(config.max_connections, 16);
    assert_eq!(config.stack_size, None);
}

#[test]
fn builder_values_reach_the_registry() {
    let registry = Registry::builder()
        .poll_interval(Duration::from_millis(10))
        .max_ack_time(None)
        .write_space(1024)
        .read_buffer_size(512)
        .max_connections(4)
        .thread_name("test-reactor")
        .stack_size(256 * 1024)
        .build()
        .expect("reactor thread");

    let config = registry.config();
    assert_eq!(config.poll_interval, Duration::from_millis(10));
    assert_eq!(config.max_ack_time, None);
    assert_eq!(config.write_space, 1024);
    assert_eq!(config.read_buffer_size, 512);
    assert_eq!(config.max_connections, 4);
    assert_eq!(config.thread_name, "test-reactor");
    assert_eq!(config.stack_size, Some(256 * 1024));

    let client = Client::new(&registry);
    assert_eq!(client.ack_timeout(), None);
    assert_eq!(client.rx_timeout(), None);
}

#[test]
fn connections_register_and_unregister() {
    let registry = Registry::new().expect("reactor thread");
    assert_eq!(registry.connection_count(), 0);

    let first = Client::new(&registry);
    let second = first.clone();
    let server = Server::new(&registry, 0);
    assert_eq!(registry.connection_count(), 2);

    drop(first);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(registry.connection_count(), 2);

    drop(second);
    drop(server);
    assert!(eventually(|| registry.connection_count() == 0));
}

#[test]
fn free_socket_follows_connection_ceiling() {
    let registry = Registry::builder()
        .max_connections(2)
        .build()
        .expect("reactor thread");
    assert!(registry.has_free_socket());

    let _first = Client::new(&registry);
    assert!(registry.has_free_socket());

    let second = Client::new(&registry);
    assert!(!registry.has_free_socket());

    drop(second);
    assert!(eventually(|| registry.has_free_socket()));
}

#[test]
fn shutdown_stops_the_reactor() {
    let registry = Registry::new().expect("reactor thread");
    assert!(registry.is_running());

    let handle = registry.clone();
    handle.shutdown();
    assert!(!registry.is_running());

    registry.shutdown();
    assert!(!registry.is_running());
}

#[test]
fn error_codes_have_descriptions() {
    assert_eq!(error_to_string(0), "OK");
    assert_eq!(error_to_string(ERR_DNS_RESOLUTION_FAILED), "DNS failed");
    assert!(!error_to_string(libc::ECONNREFUSED).is_empty());
}

#[test]
fn debug_output_names_the_type() {
    let registry = Registry::new().expect("reactor thread");
    let client = Client::new(&registry);

    assert!(format!("{registry:?}").starts_with("Registry"));
    assert!(format!("{client:?}").contains("Disconnected"));
}
