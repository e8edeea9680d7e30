use asyncsock::{ApiFlags, Client, Registry};

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const WAIT: Duration = Duration::from_secs(5);

fn registry() -> Registry {
    Registry::builder()
        .poll_interval(Duration::from_millis(20))
        .write_space(64 * 1024 * 1024)
        .build()
        .expect("reactor thread")
}

#[test]
fn ack_timeout_fires_once_per_stall() {
    let registry = registry();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();

    let timeouts = Arc::new(AtomicUsize::new(0));
    let (delay_tx, delay_rx) = mpsc::channel();
    let (disconnect_tx, disconnect_rx) = mpsc::channel();

    let client = Client::new(&registry);
    client.set_ack_timeout(Some(Duration::from_millis(100)));
    assert_eq!(client.ack_timeout(), Some(Duration::from_millis(100)));

    let count = Arc::clone(&timeouts);
    client.on_timeout(move |_, delay| {
        count.fetch_add(1, Ordering::SeqCst);
        let _ = delay_tx.send(delay);
    });
    client.on_disconnect(move |_| {
        let _ = disconnect_tx.send(());
    });
    client.on_connect(|client| {
        let payload = vec![0u8; 32 * 1024 * 1024];
        assert_eq!(client.add(&payload, ApiFlags::COPY), payload.len());
    });
    client.connect(LOCALHOST, port).expect("connect");

    // Accept but never read, so the send buffer fills up.
    let (_stream, _) = listener.accept().expect("accept");

    let delay = delay_rx.recv_timeout(WAIT).expect("timeout callback");
    assert!(delay >= 100, "reported delay {delay}ms");

    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    assert!(client.connected());
    assert!(disconnect_rx.try_recv().is_err());
}

#[test]
fn rx_timeout_closes_silent_connection() {
    let registry = registry();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();

    let connected_at = Arc::new(Mutex::new(None));
    let (tx, rx) = mpsc::channel();

    let client = Client::new(&registry);
    let started = Arc::clone(&connected_at);
    client.on_connect(move |client| {
        client.set_rx_timeout(Some(Duration::from_millis(200)));
        *started.lock().unwrap() = Some(Instant::now());
    });
    client.on_disconnect(move |_| {
        let _ = tx.send(Instant::now());
    });
    client.connect(LOCALHOST, port).expect("connect");

    let (_stream, _) = listener.accept().expect("accept");

    let closed_at = rx.recv_timeout(WAIT).expect("disconnect");
    let started = connected_at.lock().unwrap().expect("connected");
    assert!(closed_at.duration_since(started) >= Duration::from_millis(200));
    assert!(!client.connected());
    assert_eq!(client.rx_timeout(), Some(Duration::from_millis(200)));
}

#[test]
fn rx_timeout_is_held_off_by_traffic() {
    let registry = registry();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();

    let (connect_tx, connect_rx) = mpsc::channel();
    let (disconnect_tx, disconnect_rx) = mpsc::channel();

    let client = Client::new(&registry);
    client.on_connect(move |client| {
        client.set_rx_timeout(Some(Duration::from_millis(200)));
        let _ = connect_tx.send(());
    });
    client.on_data(|_, _| {});
    client.on_disconnect(move |_| {
        let _ = disconnect_tx.send(());
    });
    client.connect(LOCALHOST, port).expect("connect");

    let (mut stream, _) = listener.accept().expect("accept");
    connect_rx.recv_timeout(WAIT).expect("connect");

    for _ in 0..12 {
        stream.write_all(b"x").expect("write");
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(disconnect_rx.try_recv().is_err());
    assert!(client.connected());

    disconnect_rx.recv_timeout(WAIT).expect("disconnect after silence");
}

#[test]
fn poll_callback_ticks_while_idle() {
    let registry = registry();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();

    let polls = Arc::new(AtomicUsize::new(0));
    let client = Client::new(&registry);
    let count = Arc::clone(&polls);
    client.on_poll(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    client.connect(LOCALHOST, port).expect("connect");

    let (_stream, _) = listener.accept().expect("accept");
    std::thread::sleep(Duration::from_millis(400));

    assert!(polls.load(Ordering::SeqCst) >= 3);
}
