//! Mapped DNS intercept over the fake TUN

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};

use tunsocks::stack::packet::build_udp;
use tunsocks::tun::TunFd;
use tunsocks::Tunnel;

use super::support::{fake_tun, mock_socks5_server, parse_udp, read_packet, test_config, wait_for, write_packet};

const MAPDNS_SECTION: &str = "mapdns:\n  network: 198.19.0.0\n  netmask: 255.255.0.0\n  cache-size: 256\n  address: 198.18.0.53\n  port: 53\n";

fn a_query(id: u16, name: &str) -> Vec<u8> {
    let mut request = Message::new();
    request.set_id(id);
    request.set_message_type(MessageType::Query);
    request.set_op_code(OpCode::Query);
    request.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    request.to_vec().unwrap()
}

fn query_once(host: &TunFd, id: u16, name: &str) -> (u16, std::net::Ipv4Addr) {
    let src: SocketAddr = "198.18.0.1:5353".parse().unwrap();
    let dst: SocketAddr = "198.18.0.53:53".parse().unwrap();
    let query = build_udp(src, dst, &a_query(id, name)).unwrap();
    write_packet(host, &query);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("DNS response not received");
        let packet = read_packet(host, remaining).expect("DNS response not received");
        let Some((from, to, payload)) = parse_udp(&packet) else {
            continue;
        };
        if from != dst || to != src {
            continue;
        }
        let message = Message::from_vec(&payload).unwrap();
        let Some(RData::A(a)) = message.answers()[0].data() else {
            panic!("expected A record");
        };
        return (message.id(), a.0);
    }
}

#[test]
fn dns_queries_get_stable_mapped_addresses() {
    let socks = mock_socks5_server();
    let (tun_fd, host) = fake_tun();
    let config = test_config(socks, "", MAPDNS_SECTION);

    let tunnel = Arc::new(Tunnel::init(config, Some(tun_fd)).expect("init"));
    let runner = {
        let tunnel = Arc::clone(&tunnel);
        std::thread::spawn(move || tunnel.run())
    };
    assert!(wait_for(Duration::from_secs(2), || tunnel.is_running()));

    let subnet: ipnet::Ipv4Net = "198.19.0.0/16".parse().unwrap();

    let (id, first) = query_once(&host, 100, "example.com.");
    assert_eq!(id, 100);
    assert!(subnet.contains(&first), "{first} outside mapped subnet");

    // The identical query resolves to the identical address.
    let (_, second) = query_once(&host, 101, "example.com.");
    assert_eq!(first, second);

    // A different name gets a different address.
    let (_, other) = query_once(&host, 102, "other.example.");
    assert_ne!(first, other);
    assert!(subnet.contains(&other));

    // Intercepted queries never become sessions.
    assert_eq!(tunnel.session_count(), 0);

    tunnel.stop();
    runner.join().unwrap().unwrap();
    tunnel.fini();
}
