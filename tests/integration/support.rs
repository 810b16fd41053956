//! Shared test infrastructure
//!
//! - a socketpair standing in for the TUN device
//! - a mock SOCKS5 server (CONNECT echoes bytes, UDP ASSOCIATE echoes
//!   datagrams)
//! - a host-side TCP harness speaking raw segments against the tunnel

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, TcpControl, TcpPacket, TcpRepr,
    TcpSeqNumber,
};

use tunsocks::socks5::{
    self, decode_udp_packet, encode_udp_packet, Target, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6,
    AUTH_METHOD_NONE, CMD_CONNECT, CMD_UDP_ASSOCIATE, REPLY_SUCCEEDED, SOCKS5_VERSION,
};
use tunsocks::tun::TunFd;
use tunsocks::{load_config_str, Config};

/// Create the fake TUN: returns (tunnel side fd, host side handle)
pub fn fake_tun() -> (RawFd, Arc<TunFd>) {
    let mut fds = [0 as RawFd; 2];
    let res = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
    assert_eq!(res, 0, "socketpair failed");
    let host = Arc::new(TunFd::adopt(fds[1]).expect("adopt host side"));
    (fds[0], host)
}

/// Build a config pointing at `socks5_addr`
///
/// `socks5_extra` is appended inside the `socks5` section (2-space
/// indented lines); `tail` is appended at the top level.
pub fn test_config(socks5_addr: SocketAddr, socks5_extra: &str, tail: &str) -> Config {
    let yaml = format!(
        "tunnel:\n  name: tun0\n  ipv4: 198.18.0.1\n  mtu: 1500\nsocks5:\n  address: {}\n  port: {}\n  connect-timeout: 2\n{}{}",
        socks5_addr.ip(),
        socks5_addr.port(),
        socks5_extra,
        tail
    );
    load_config_str(&yaml).expect("test config parses")
}

/// Write one packet from the host side, retrying on a full buffer
pub fn write_packet(tun: &TunFd, packet: &[u8]) {
    let mut remaining = 50;
    loop {
        match tun.write(packet) {
            Ok(_) => return,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && remaining > 0 => {
                remaining -= 1;
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(e) => panic!("host write failed: {e}"),
        }
    }
}

/// Parse an IPv4 UDP packet into (src, dst, payload)
pub fn parse_udp(packet: &[u8]) -> Option<(SocketAddr, SocketAddr, Vec<u8>)> {
    let ip = Ipv4Packet::new_checked(packet).ok()?;
    if ip.next_header() != IpProtocol::Udp {
        return None;
    }
    let src_ip = std::net::Ipv4Addr::from(ip.src_addr().0);
    let dst_ip = std::net::Ipv4Addr::from(ip.dst_addr().0);
    let udp = smoltcp::wire::UdpPacket::new_checked(ip.payload()).ok()?;
    Some((
        SocketAddr::new(src_ip.into(), udp.src_port()),
        SocketAddr::new(dst_ip.into(), udp.dst_port()),
        udp.payload().to_vec(),
    ))
}

/// Read one packet from the host side, waiting up to `timeout`
pub fn read_packet(tun: &TunFd, timeout: Duration) -> Option<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 4096];
    loop {
        match tun.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => return Some(buf[..n].to_vec()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return None;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(e) => panic!("host read failed: {e}"),
        }
    }
}

// ----------------------------------------------------------------------
// Raw TCP segments
// ----------------------------------------------------------------------

#[allow(clippy::cast_possible_wrap)]
pub fn build_tcp(
    src: SocketAddr,
    dst: SocketAddr,
    control: TcpControl,
    seq: u32,
    ack: Option<u32>,
    payload: &[u8],
) -> Vec<u8> {
    let (std::net::IpAddr::V4(src_ip), std::net::IpAddr::V4(dst_ip)) = (src.ip(), dst.ip()) else {
        panic!("IPv4 only helper");
    };
    let caps = ChecksumCapabilities::default();
    let tcp_repr = TcpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
        control,
        seq_number: TcpSeqNumber(seq as i32),
        ack_number: ack.map(|a| TcpSeqNumber(a as i32)),
        window_len: 65535,
        window_scale: None,
        max_seg_size: if control == TcpControl::Syn {
            Some(1460)
        } else {
            None
        },
        sack_permitted: false,
        sack_ranges: [None; 3],
        payload,
    };
    let ip_repr = Ipv4Repr {
        src_addr: Ipv4Address(src_ip.octets()),
        dst_addr: Ipv4Address(dst_ip.octets()),
        next_header: IpProtocol::Tcp,
        payload_len: tcp_repr.buffer_len(),
        hop_limit: 64,
    };

    let mut bytes = vec![0u8; ip_repr.buffer_len() + tcp_repr.buffer_len()];
    let mut ip_packet = Ipv4Packet::new_unchecked(&mut bytes);
    ip_repr.emit(&mut ip_packet, &caps);
    let mut tcp_packet = TcpPacket::new_unchecked(ip_packet.payload_mut());
    tcp_repr.emit(
        &mut tcp_packet,
        &IpAddress::Ipv4(Ipv4Address(src_ip.octets())),
        &IpAddress::Ipv4(Ipv4Address(dst_ip.octets())),
        &caps,
    );
    bytes
}

pub struct HostTcp {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub seq: u32,
    pub ack_number: u32,
    pub payload: Vec<u8>,
}

#[allow(clippy::cast_sign_loss)]
pub fn parse_tcp(packet: &[u8]) -> Option<HostTcp> {
    let ip = Ipv4Packet::new_checked(packet).ok()?;
    if ip.next_header() != IpProtocol::Tcp {
        return None;
    }
    let src_ip = std::net::Ipv4Addr::from(ip.src_addr().0);
    let dst_ip = std::net::Ipv4Addr::from(ip.dst_addr().0);
    let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
    Some(HostTcp {
        src: SocketAddr::new(src_ip.into(), tcp.src_port()),
        dst: SocketAddr::new(dst_ip.into(), tcp.dst_port()),
        syn: tcp.syn(),
        ack: tcp.ack(),
        fin: tcp.fin(),
        rst: tcp.rst(),
        seq: tcp.seq_number().0 as u32,
        ack_number: tcp.ack_number().0 as u32,
        payload: tcp.payload().to_vec(),
    })
}

/// Host side of one TCP connection through the tunnel
pub struct TcpHost {
    tun: Arc<TunFd>,
    pub client: SocketAddr,
    pub server: SocketAddr,
    /// Next sequence number we send
    seq: u32,
    /// Next sequence number we expect from the tunnel
    ack: u32,
}

impl TcpHost {
    pub fn new(tun: Arc<TunFd>, client: SocketAddr, server: SocketAddr) -> Self {
        Self {
            tun,
            client,
            server,
            seq: 1000,
            ack: 0,
        }
    }

    fn write(&self, packet: Vec<u8>) {
        let mut remaining = 20;
        loop {
            match self.tun.write(&packet) {
                Ok(_) => return,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && remaining > 0 => {
                    remaining -= 1;
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(e) => panic!("host write failed: {e}"),
            }
        }
    }

    /// Read segments for this connection, skipping everything else
    fn next_segment(&self, timeout: Duration) -> Option<HostTcp> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let packet = read_packet(&self.tun, remaining)?;
            if let Some(seg) = parse_tcp(&packet) {
                if seg.src == self.server && seg.dst == self.client {
                    return Some(seg);
                }
            }
        }
    }

    /// SYN → SYN-ACK → ACK
    pub fn handshake(&mut self) {
        self.write(build_tcp(
            self.client,
            self.server,
            TcpControl::Syn,
            self.seq,
            None,
            b"",
        ));
        let syn_ack = loop {
            let seg = self
                .next_segment(Duration::from_secs(5))
                .expect("SYN-ACK not received");
            if seg.syn && seg.ack {
                break seg;
            }
        };
        assert_eq!(syn_ack.ack_number, self.seq.wrapping_add(1));
        self.seq = self.seq.wrapping_add(1);
        self.ack = syn_ack.seq.wrapping_add(1);
        self.write(build_tcp(
            self.client,
            self.server,
            TcpControl::None,
            self.seq,
            Some(self.ack),
            b"",
        ));
    }

    /// Send payload bytes
    pub fn send(&mut self, payload: &[u8]) {
        self.write(build_tcp(
            self.client,
            self.server,
            TcpControl::Psh,
            self.seq,
            Some(self.ack),
            payload,
        ));
        self.seq = self.seq.wrapping_add(payload.len() as u32);
    }

    /// Receive the next in-order payload, acknowledging it
    pub fn recv(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let seg = self.next_segment(remaining)?;
            if seg.payload.is_empty() || seg.seq != self.ack {
                continue; // pure ACK, window update, or retransmission
            }
            self.ack = self.ack.wrapping_add(seg.payload.len() as u32);
            self.write(build_tcp(
                self.client,
                self.server,
                TcpControl::None,
                self.seq,
                Some(self.ack),
                b"",
            ));
            return Some(seg.payload);
        }
    }

    /// Send our FIN
    pub fn fin(&mut self) {
        self.write(build_tcp(
            self.client,
            self.server,
            TcpControl::Fin,
            self.seq,
            Some(self.ack),
            b"",
        ));
        self.seq = self.seq.wrapping_add(1);
    }

    /// Wait for the tunnel's FIN and acknowledge it
    pub fn expect_fin(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let Some(seg) = self.next_segment(remaining) else {
                return false;
            };
            if seg.fin {
                self.ack = seg.seq.wrapping_add(seg.payload.len() as u32 + 1);
                self.write(build_tcp(
                    self.client,
                    self.server,
                    TcpControl::None,
                    self.seq,
                    Some(self.ack),
                    b"",
                ));
                return true;
            }
        }
    }
}

// ----------------------------------------------------------------------
// Mock SOCKS5 server
// ----------------------------------------------------------------------

/// Start a mock SOCKS5 server; CONNECT targets echo bytes, UDP ASSOCIATE
/// echoes datagrams back from their destination address.
pub fn mock_socks5_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let addr = listener.local_addr().unwrap();

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            std::thread::spawn(move || {
                let _ = serve_connection(stream);
            });
        }
    });

    addr
}

fn serve_connection(mut stream: std::net::TcpStream) -> std::io::Result<()> {
    // Method negotiation
    let mut header = [0u8; 2];
    stream.read_exact(&mut header)?;
    assert_eq!(header[0], SOCKS5_VERSION);
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods)?;
    stream.write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE])?;

    // Request
    let mut request = [0u8; 4];
    stream.read_exact(&mut request)?;
    match request[3] {
        ATYP_IPV4 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest)?;
        }
        ATYP_IPV6 => {
            let mut rest = [0u8; 18];
            stream.read_exact(&mut rest)?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest)?;
        }
        other => panic!("unexpected ATYP {other}"),
    }

    match request[1] {
        CMD_CONNECT => {
            let reply = [
                SOCKS5_VERSION,
                REPLY_SUCCEEDED,
                0,
                ATYP_IPV4,
                0,
                0,
                0,
                0,
                0,
                0,
            ];
            stream.write_all(&reply)?;
            // Echo until EOF.
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                stream.write_all(&buf[..n])?;
            }
            Ok(())
        }
        CMD_UDP_ASSOCIATE => {
            let relay = UdpSocket::bind("127.0.0.1:0")?;
            let relay_addr = relay.local_addr()?;
            let std::net::IpAddr::V4(relay_ip) = relay_addr.ip() else {
                unreachable!()
            };

            let mut reply = vec![SOCKS5_VERSION, REPLY_SUCCEEDED, 0, ATYP_IPV4];
            reply.extend_from_slice(&relay_ip.octets());
            reply.extend_from_slice(&relay_addr.port().to_be_bytes());
            stream.write_all(&reply)?;

            // Relay echo: reply to each datagram from its destination.
            std::thread::spawn(move || {
                let mut buf = [0u8; 65536];
                relay
                    .set_read_timeout(Some(Duration::from_secs(30)))
                    .unwrap();
                while let Ok((n, client)) = relay.recv_from(&mut buf) {
                    let Ok((dst, payload)) = decode_udp_packet(&buf[..n]) else {
                        continue;
                    };
                    let mut echo = payload;
                    echo.extend_from_slice(b"-pong");
                    let packet = encode_udp_packet(&Target::Ip(dst), &echo).unwrap();
                    let _ = relay.send_to(&packet, client);
                }
            });

            // Keep the control connection open until the client drops it.
            let mut sink = [0u8; 64];
            while stream.read(&mut sink)? > 0 {}
            Ok(())
        }
        other => panic!("unexpected command {other}"),
    }
}

/// Mock that speaks UDP-in-TCP: datagrams echoed on the control stream
pub fn mock_socks5_udp_tcp_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let addr = listener.local_addr().unwrap();

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            std::thread::spawn(move || -> std::io::Result<()> {
                let mut header = [0u8; 2];
                stream.read_exact(&mut header)?;
                let mut methods = vec![0u8; header[1] as usize];
                stream.read_exact(&mut methods)?;
                stream.write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE])?;

                let mut request = [0u8; 4];
                stream.read_exact(&mut request)?;
                assert_eq!(request[1], CMD_UDP_ASSOCIATE);
                let mut rest = [0u8; 6];
                stream.read_exact(&mut rest)?;

                let reply = [
                    SOCKS5_VERSION,
                    REPLY_SUCCEEDED,
                    0,
                    ATYP_IPV4,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0,
                ];
                stream.write_all(&reply)?;

                loop {
                    let (dst, payload) = match socks5::read_tcp_datagram(&mut stream) {
                        Ok(pair) => pair,
                        Err(_) => return Ok(()),
                    };
                    let mut echo = payload;
                    echo.extend_from_slice(b"-pong");
                    socks5::write_tcp_datagram(&mut stream, &Target::Ip(dst), &echo)
                        .map_err(|e| std::io::Error::other(e.to_string()))?;
                }
            });
        }
    });

    addr
}

/// Poll `predicate` until it holds or `timeout` elapses
pub fn wait_for(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}
