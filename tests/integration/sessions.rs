//! UDP relaying and the session limit

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tunsocks::stack::packet::build_udp;
use tunsocks::tun::TunFd;
use tunsocks::Tunnel;

use super::support::{
    fake_tun, mock_socks5_server, mock_socks5_udp_tcp_server, parse_udp, read_packet, test_config,
    wait_for, write_packet,
};

/// Send a datagram from `src` to `dst` and wait for the echoed reply
fn udp_roundtrip(host: &TunFd, src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let packet = build_udp(src, dst, payload).unwrap();
    write_packet(host, &packet);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("UDP reply not received");
        let reply = read_packet(host, remaining).expect("UDP reply not received");
        let Some((from, to, data)) = parse_udp(&reply) else {
            continue;
        };
        if from == dst && to == src {
            return data;
        }
    }
}

#[test]
fn udp_relay_roundtrip() {
    let socks = mock_socks5_server();
    let (tun_fd, host) = fake_tun();
    let config = test_config(socks, "  udp-idle-timeout: 2\n", "");

    let tunnel = Arc::new(Tunnel::init(config, Some(tun_fd)).expect("init"));
    let runner = {
        let tunnel = Arc::clone(&tunnel);
        std::thread::spawn(move || tunnel.run())
    };
    assert!(wait_for(Duration::from_secs(2), || tunnel.is_running()));

    let src: SocketAddr = "198.18.0.1:7001".parse().unwrap();
    let dst: SocketAddr = "9.9.9.9:500".parse().unwrap();
    let reply = udp_roundtrip(&host, src, dst, b"ping");
    assert_eq!(reply, b"ping-pong");
    assert_eq!(tunnel.session_count(), 1);

    // A second destination reuses the same session (same source port).
    let other: SocketAddr = "9.9.9.10:501".parse().unwrap();
    let reply = udp_roundtrip(&host, src, other, b"ping2");
    assert_eq!(reply, b"ping2-pong");
    assert_eq!(tunnel.session_count(), 1);

    // Idle timeout reaps the session.
    assert!(
        wait_for(Duration::from_secs(5), || tunnel.session_count() == 0),
        "session did not idle out"
    );

    tunnel.stop();
    runner.join().unwrap().unwrap();
    tunnel.fini();
}

#[test]
fn udp_in_tcp_relay_roundtrip() {
    let socks = mock_socks5_udp_tcp_server();
    let (tun_fd, host) = fake_tun();
    let config = test_config(socks, "  udp: tcp\n  udp-idle-timeout: 2\n", "");

    let tunnel = Arc::new(Tunnel::init(config, Some(tun_fd)).expect("init"));
    let runner = {
        let tunnel = Arc::clone(&tunnel);
        std::thread::spawn(move || tunnel.run())
    };
    assert!(wait_for(Duration::from_secs(2), || tunnel.is_running()));

    let src: SocketAddr = "198.18.0.1:7002".parse().unwrap();
    let dst: SocketAddr = "9.9.9.9:500".parse().unwrap();
    let reply = udp_roundtrip(&host, src, dst, b"framed");
    assert_eq!(reply, b"framed-pong");

    tunnel.stop();
    runner.join().unwrap().unwrap();
    tunnel.fini();
}

#[test]
fn session_limit_terminates_oldest() {
    let socks = mock_socks5_server();
    let (tun_fd, host) = fake_tun();
    let config = test_config(
        socks,
        "  udp-idle-timeout: 30\n",
        "misc:\n  max-session-count: 2\n",
    );

    let tunnel = Arc::new(Tunnel::init(config, Some(tun_fd)).expect("init"));
    let runner = {
        let tunnel = Arc::clone(&tunnel);
        std::thread::spawn(move || tunnel.run())
    };
    assert!(wait_for(Duration::from_secs(2), || tunnel.is_running()));

    let dst: SocketAddr = "9.9.9.9:500".parse().unwrap();
    for port in [7101u16, 7102, 7103] {
        let src = SocketAddr::new("198.18.0.1".parse().unwrap(), port);
        let reply = udp_roundtrip(&host, src, dst, b"hi");
        assert_eq!(reply, b"hi-pong");
    }

    // The third session pushed the count over the limit; the oldest gets
    // terminated and the steady state settles at the limit.
    assert!(
        wait_for(Duration::from_secs(5), || tunnel.session_count() <= 2),
        "oldest session was not terminated"
    );

    // The newest flow is still alive.
    let src: SocketAddr = "198.18.0.1:7103".parse().unwrap();
    let reply = udp_roundtrip(&host, src, dst, b"still-here");
    assert_eq!(reply, b"still-here-pong");

    tunnel.stop();
    runner.join().unwrap().unwrap();
    tunnel.fini();
}
