use asyncsock::{
    ApiFlags, Client, ConnectionState, ERR_DNS_RESOLUTION_FAILED, Error, Registry,
};

use std::io::{ErrorKind, Read};
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::mpsc;
use std::time::Duration;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
enum Event {
    Connect,
    Error(i32),
    Disconnect,
}

fn registry() -> Registry {
    Registry::builder()
        .poll_interval(Duration::from_millis(20))
        .build()
        .expect("reactor thread")
}

fn observed(client: &Client) -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel();

    let connect = tx.clone();
    client.on_connect(move |_| {
        let _ = connect.send(Event::Connect);
    });
    let error = tx.clone();
    client.on_error(move |_, code| {
        let _ = error.send(Event::Error(code));
    });
    client.on_disconnect(move |_| {
        let _ = tx.send(Event::Disconnect);
    });

    rx
}

fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().unwrap().port()
}

#[test]
fn refused_connect_reports_error_then_disconnect() {
    let registry = registry();
    let client = Client::new(&registry);
    let events = observed(&client);

    match client.connect(LOCALHOST, unused_port()) {
        Err(Error::Connect { .. }) => return,
        Err(other) => panic!("unexpected error {other}"),
        Ok(()) => {}
    }

    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Event::Error(libc::ECONNREFUSED)
    );
    assert_eq!(events.recv_timeout(WAIT).unwrap(), Event::Disconnect);
    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(client.freeable());
}

#[test]
fn host_name_connects_after_resolution() {
    let registry = registry();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();

    let client = Client::new(&registry);
    let events = observed(&client);
    client.connect_host("localhost", port).expect("connect_host");

    let (_stream, _) = listener.accept().expect("accept");
    assert_eq!(events.recv_timeout(WAIT).unwrap(), Event::Connect);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.remote_port(), port);
}

#[test]
fn ip_literal_host_connects_directly() {
    let registry = registry();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();

    let client = Client::new(&registry);
    let events = observed(&client);
    client.connect_host("127.0.0.1", port).expect("connect_host");
    assert_ne!(client.state(), ConnectionState::WaitingForDns);
    assert!(client.is_open());

    let (_stream, _) = listener.accept().expect("accept");
    assert_eq!(events.recv_timeout(WAIT).unwrap(), Event::Connect);
    assert_eq!(client.remote_ip(), Some(LOCALHOST));
}

#[test]
fn unresolvable_host_fails_with_dns_code() {
    let registry = registry();
    let client = Client::new(&registry);
    let events = observed(&client);

    client.connect_host("bad\0host", 80).expect("resolution started");

    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Event::Error(ERR_DNS_RESOLUTION_FAILED)
    );
    assert_eq!(events.recv_timeout(WAIT).unwrap(), Event::Disconnect);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[test]
fn empty_host_is_rejected() {
    let registry = registry();
    let client = Client::new(&registry);

    let error = client.connect_host("", 80).unwrap_err();
    assert!(matches!(error, Error::Resolve(_)));
    assert_eq!(error.code(), ERR_DNS_RESOLUTION_FAILED);
}

#[test]
fn second_connect_is_rejected() {
    let registry = registry();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();

    let client = Client::new(&registry);
    client.connect(LOCALHOST, port).expect("connect");

    let error = client.connect(LOCALHOST, port).unwrap_err();
    assert!(matches!(error, Error::AlreadyConnected));
    assert_eq!(error.code(), libc::EISCONN);
}

#[test]
fn abort_resets_the_peer() {
    let registry = registry();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();

    let client = Client::new(&registry);
    let events = observed(&client);
    client.connect(LOCALHOST, port).expect("connect");

    let (mut stream, _) = listener.accept().expect("accept");
    assert_eq!(events.recv_timeout(WAIT).unwrap(), Event::Connect);

    assert_eq!(client.abort(), libc::ECONNABORTED);
    assert_eq!(events.recv_timeout(WAIT).unwrap(), Event::Disconnect);

    stream.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 8];
    let error = stream.read(&mut buf).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ConnectionReset);
}

#[test]
fn close_while_resolving_fires_disconnect_once() {
    let registry = registry();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();

    let client = Client::new(&registry);
    let events = observed(&client);

    client.connect_host("localhost", port).expect("connect_host");
    client.close(true);

    loop {
        match events.recv_timeout(WAIT).expect("disconnect") {
            Event::Disconnect => break,
            Event::Connect => {}
            Event::Error(code) => panic!("unexpected error {code}"),
        }
    }
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(client.write(b"late", ApiFlags::COPY), 0);
    assert!(client.freeable());
}
