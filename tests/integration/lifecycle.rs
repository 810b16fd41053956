//! Lifecycle: init/run/stop/fini ordering and shutdown latency

use std::sync::Arc;
use std::time::{Duration, Instant};

use tunsocks::Tunnel;

use super::support::{fake_tun, mock_socks5_server, test_config, wait_for, TcpHost};

#[test]
fn fini_without_run_releases_everything() {
    let socks = mock_socks5_server();
    let (tun_fd, _host) = fake_tun();
    let config = test_config(socks, "", "");

    let tunnel = Tunnel::init(config, Some(tun_fd)).expect("init");
    assert!(!tunnel.is_running());
    tunnel.fini();
    assert_eq!(tunnel.session_count(), 0);
    // Dropping after an explicit fini must not double-free anything.
    drop(tunnel);
}

#[test]
fn stop_is_idempotent() {
    let socks = mock_socks5_server();
    let (tun_fd, _host) = fake_tun();
    let config = test_config(socks, "", "");

    let tunnel = Arc::new(Tunnel::init(config, Some(tun_fd)).expect("init"));
    let runner = {
        let tunnel = Arc::clone(&tunnel);
        std::thread::spawn(move || tunnel.run())
    };
    assert!(wait_for(Duration::from_secs(2), || tunnel.is_running()));

    tunnel.stop();
    tunnel.stop();
    runner.join().unwrap().expect("run returns after stop");
    assert!(!tunnel.is_running());

    tunnel.fini();
    tunnel.fini();
}

#[test]
fn shutdown_under_load_is_prompt() {
    let socks = mock_socks5_server();
    let (tun_fd, host) = fake_tun();
    let config = test_config(socks, "", "");

    let tunnel = Arc::new(Tunnel::init(config, Some(tun_fd)).expect("init"));
    let runner = {
        let tunnel = Arc::clone(&tunnel);
        std::thread::spawn(move || tunnel.run())
    };
    assert!(wait_for(Duration::from_secs(2), || tunnel.is_running()));

    // A few mid-stream connections that never close.
    let mut connections: Vec<TcpHost> = (0..3)
        .map(|i| {
            TcpHost::new(
                Arc::clone(&host),
                format!("198.18.0.1:{}", 42000 + i).parse().unwrap(),
                "1.1.1.1:7".parse().unwrap(),
            )
        })
        .collect();
    for conn in &mut connections {
        conn.handshake();
        conn.send(b"data");
    }
    assert!(wait_for(Duration::from_secs(2), || {
        tunnel.session_count() == 3
    }));

    let start = Instant::now();
    tunnel.stop();
    runner.join().unwrap().expect("run returns");
    tunnel.fini();
    let elapsed = start.elapsed();

    assert!(elapsed < Duration::from_secs(2), "shutdown took {elapsed:?}");
    assert_eq!(tunnel.session_count(), 0);
}
