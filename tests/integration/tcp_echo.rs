//! End-to-end TCP relay over the fake TUN

use std::sync::Arc;
use std::time::Duration;

use tunsocks::Tunnel;

use super::support::{fake_tun, mock_socks5_server, test_config, wait_for, TcpHost};

#[test]
fn tcp_echo_end_to_end() {
    let socks = mock_socks5_server();
    let (tun_fd, host) = fake_tun();
    let config = test_config(socks, "", "");

    let tunnel = Arc::new(Tunnel::init(config, Some(tun_fd)).expect("init"));
    let runner = {
        let tunnel = Arc::clone(&tunnel);
        std::thread::spawn(move || tunnel.run())
    };
    assert!(wait_for(Duration::from_secs(2), || tunnel.is_running()));

    let mut conn = TcpHost::new(
        Arc::clone(&host),
        "198.18.0.1:40001".parse().unwrap(),
        "1.1.1.1:7".parse().unwrap(),
    );
    conn.handshake();
    conn.send(b"hello");

    let echoed = conn.recv(Duration::from_secs(5)).expect("echoed payload");
    assert_eq!(echoed, b"hello");

    assert_eq!(tunnel.session_count(), 1);

    // Close from the host side; the mock server answers EOF with EOF, which
    // comes back to us as the tunnel's FIN.
    conn.fin();
    assert!(conn.expect_fin(Duration::from_secs(5)), "tunnel FIN");
    assert!(
        wait_for(Duration::from_secs(5), || tunnel.session_count() == 0),
        "session did not close"
    );

    let stats = tunnel.stats();
    assert!(stats.rx_packets >= 2, "rx_packets = {}", stats.rx_packets);
    assert!(stats.tx_packets >= 2, "tx_packets = {}", stats.tx_packets);
    assert!(stats.rx_bytes > 0);
    assert!(stats.tx_bytes > 0);

    tunnel.stop();
    runner.join().unwrap().expect("run returns cleanly");
    tunnel.fini();
}

#[test]
fn concurrent_tcp_connections() {
    let socks = mock_socks5_server();
    let (tun_fd, host) = fake_tun();
    let config = test_config(socks, "", "");

    let tunnel = Arc::new(Tunnel::init(config, Some(tun_fd)).expect("init"));
    let runner = {
        let tunnel = Arc::clone(&tunnel);
        std::thread::spawn(move || tunnel.run())
    };
    assert!(wait_for(Duration::from_secs(2), || tunnel.is_running()));

    let mut connections: Vec<TcpHost> = (0..4)
        .map(|i| {
            TcpHost::new(
                Arc::clone(&host),
                format!("198.18.0.1:{}", 41000 + i).parse().unwrap(),
                "1.1.1.1:7".parse().unwrap(),
            )
        })
        .collect();

    for conn in &mut connections {
        conn.handshake();
    }
    assert!(wait_for(Duration::from_secs(2), || {
        tunnel.session_count() == 4
    }));

    for (i, conn) in connections.iter_mut().enumerate() {
        let payload = format!("payload-{i}");
        conn.send(payload.as_bytes());
        let echoed = conn.recv(Duration::from_secs(5)).expect("echo");
        assert_eq!(echoed, payload.as_bytes());
    }

    tunnel.stop();
    runner.join().unwrap().unwrap();
    tunnel.fini();
    assert_eq!(tunnel.session_count(), 0);
}
