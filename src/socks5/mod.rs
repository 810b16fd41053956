//! SOCKS5 client (RFC 1928, RFC 1929)
//!
//! Implements the upstream side of every session: method negotiation,
//! username/password authentication, CONNECT, and UDP ASSOCIATE. Sessions
//! run on worker threads, so all I/O here is blocking `std::net` with
//! explicit timeouts.
//!
//! # UDP relaying
//!
//! Two modes are supported, selected by `socks5.udp` in the configuration:
//!
//! - `udp`: a standard UDP ASSOCIATE; datagrams travel over a dedicated UDP
//!   socket to the relay address the server returns, each wrapped in the
//!   RFC 1928 section 7 header.
//! - `tcp`: datagrams stay on the TCP control connection, each sent as a
//!   2-byte big-endian length prefix followed by the same RFC 1928 UDP
//!   packet. This survives middleboxes that drop plain UDP.
//!
//! ```text
//! +------+------+------+----------+----------+----------+
//! | RSV  | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +------+------+------+----------+----------+----------+
//! |  2   |  1   |  1   | Variable |    2     | Variable |
//! +------+------+------+----------+----------+----------+
//! ```

use std::fmt;
use std::io::{Read, Write};
use std::net::{
    IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, TcpStream, UdpSocket,
};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use thiserror::Error;
use tracing::{debug, trace};

/// SOCKS protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

/// No authentication required
pub const AUTH_METHOD_NONE: u8 = 0x00;
/// Username/password authentication (RFC 1929)
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;
/// No acceptable methods
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;
/// Username/password sub-negotiation version
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;

/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;
/// UDP ASSOCIATE command
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// IPv4 address type
pub const ATYP_IPV4: u8 = 0x01;
/// Domain name address type
pub const ATYP_DOMAIN: u8 = 0x03;
/// IPv6 address type
pub const ATYP_IPV6: u8 = 0x04;

/// Request succeeded
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// Human-readable message for a SOCKS5 reply code
#[must_use]
pub fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// SOCKS5 client errors
#[derive(Debug, Error)]
pub enum Socks5Error {
    /// Invalid protocol version
    #[error("Invalid SOCKS version: expected {expected}, got {actual}")]
    InvalidVersion { expected: u8, actual: u8 },

    /// No acceptable authentication method
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Authentication failed
    #[error("SOCKS5 authentication failed")]
    AuthFailed,

    /// Server returned an error reply
    #[error("SOCKS5 server error (code {code:#04x}): {message}")]
    ServerReply { code: u8, message: &'static str },

    /// Invalid address type in a reply or relayed packet
    #[error("Invalid address type: {0:#04x}")]
    InvalidAddressType(u8),

    /// Malformed message
    #[error("SOCKS5 protocol error: {0}")]
    Protocol(String),

    /// Fragmented UDP packet (not supported)
    #[error("Fragmented UDP packet not supported (FRAG={frag})")]
    FragmentedPacket { frag: u8 },

    /// Underlying I/O error
    #[error("SOCKS5 I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A destination as presented to the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Literal socket address
    Ip(SocketAddr),
    /// Hostname and port; the proxy resolves the name
    Domain(String, u16),
}

impl Target {
    /// Destination port
    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Static parameters for upstream connections
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// SOCKS5 server address
    pub server: SocketAddr,
    /// Optional username/password credentials
    pub auth: Option<(String, String)>,
    /// Connect and handshake timeout
    pub timeout: Duration,
}

impl ProxyConfig {
    /// Create a config without authentication
    #[must_use]
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self {
            server,
            auth: None,
            timeout,
        }
    }

    /// Attach credentials
    #[must_use]
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }
}

/// Open a TCP connection to the SOCKS5 server
///
/// Keepalive and `TCP_NODELAY` are enabled; the handshake timeout is applied
/// as the connect timeout and as the stream's initial read/write timeout.
fn tcp_connect(config: &ProxyConfig) -> Result<TcpStream, Socks5Error> {
    let domain = if config.server.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(15));
    socket.set_tcp_keepalive(&keepalive)?;

    socket.connect_timeout(&config.server.into(), config.timeout)?;

    let stream: TcpStream = socket.into();
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(config.timeout))?;
    stream.set_write_timeout(Some(config.timeout))?;
    Ok(stream)
}

/// Perform method negotiation and (if configured) authentication
fn handshake(stream: &mut TcpStream, config: &ProxyConfig) -> Result<(), Socks5Error> {
    let methods: &[u8] = if config.auth.is_some() {
        &[SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
    };

    trace!("sending SOCKS5 method selection: {methods:?}");
    stream.write_all(methods)?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response)?;

    if response[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion {
            expected: SOCKS5_VERSION,
            actual: response[0],
        });
    }

    match response[1] {
        AUTH_METHOD_NONE => Ok(()),
        AUTH_METHOD_PASSWORD => authenticate(stream, config),
        AUTH_METHOD_NO_ACCEPTABLE => Err(Socks5Error::NoAcceptableMethod),
        other => Err(Socks5Error::Protocol(format!(
            "unsupported auth method: {other:#04x}"
        ))),
    }
}

/// RFC 1929 username/password sub-negotiation
fn authenticate(stream: &mut TcpStream, config: &ProxyConfig) -> Result<(), Socks5Error> {
    let Some((username, password)) = config.auth.as_ref() else {
        return Err(Socks5Error::AuthFailed);
    };

    if username.len() > 255 {
        return Err(Socks5Error::Protocol("username too long (max 255)".into()));
    }
    if password.len() > 255 {
        return Err(Socks5Error::Protocol("password too long (max 255)".into()));
    }

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(AUTH_PASSWORD_VERSION);
    #[allow(clippy::cast_possible_truncation)]
    request.push(username.len() as u8);
    request.extend_from_slice(username.as_bytes());
    #[allow(clippy::cast_possible_truncation)]
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());

    stream.write_all(&request)?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response)?;

    if response[0] != AUTH_PASSWORD_VERSION {
        return Err(Socks5Error::Protocol(format!(
            "invalid auth version: {:#04x}",
            response[0]
        )));
    }
    if response[1] != 0x00 {
        return Err(Socks5Error::AuthFailed);
    }

    trace!("SOCKS5 authentication successful");
    Ok(())
}

/// Append `ATYP | ADDR | PORT` for a target
fn encode_target(buf: &mut Vec<u8>, target: &Target) -> Result<(), Socks5Error> {
    match target {
        Target::Ip(SocketAddr::V4(v4)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&v4.ip().octets());
        }
        Target::Ip(SocketAddr::V6(v6)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&v6.ip().octets());
        }
        Target::Domain(host, _) => {
            if host.is_empty() || host.len() > 255 {
                return Err(Socks5Error::Protocol(format!(
                    "domain length {} out of range",
                    host.len()
                )));
            }
            buf.push(ATYP_DOMAIN);
            #[allow(clippy::cast_possible_truncation)]
            buf.push(host.len() as u8);
            buf.extend_from_slice(host.as_bytes());
        }
    }
    buf.extend_from_slice(&target.port().to_be_bytes());
    Ok(())
}

/// Build a `VER | CMD | RSV | ATYP | ADDR | PORT` request
fn build_request(cmd: u8, target: &Target) -> Result<Vec<u8>, Socks5Error> {
    let mut request = Vec::with_capacity(22);
    request.push(SOCKS5_VERSION);
    request.push(cmd);
    request.push(0x00);
    encode_target(&mut request, target)?;
    Ok(request)
}

/// Read a reply and extract the bound address
fn read_reply(stream: &mut TcpStream) -> Result<SocketAddr, Socks5Error> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;

    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion {
            expected: SOCKS5_VERSION,
            actual: header[0],
        });
    }
    if header[1] != REPLY_SUCCEEDED {
        return Err(Socks5Error::ServerReply {
            code: header[1],
            message: reply_message(header[1]),
        });
    }

    let bound = match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr)?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port)?;
            SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(addr),
                u16::from_be_bytes(port),
            ))
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr)?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port)?;
            SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr),
                u16::from_be_bytes(port),
                0,
                0,
            ))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain)?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port)?;
            // A domain-form BND.ADDR cannot be dialed; keep the port only.
            SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                u16::from_be_bytes(port),
            ))
        }
        other => return Err(Socks5Error::InvalidAddressType(other)),
    };

    trace!("SOCKS5 bound address: {bound}");
    Ok(bound)
}

/// Connect to `target` through the proxy
///
/// Performs the full sequence: TCP connect, method negotiation, optional
/// authentication, CONNECT, reply validation. The returned stream carries
/// the relayed connection; its read/write timeouts are cleared.
///
/// # Errors
///
/// Any handshake, authentication or reply failure.
pub fn connect(config: &ProxyConfig, target: &Target) -> Result<TcpStream, Socks5Error> {
    let mut stream = tcp_connect(config)?;
    handshake(&mut stream, config)?;

    let request = build_request(CMD_CONNECT, target)?;
    stream.write_all(&request)?;
    read_reply(&mut stream)?;

    debug!(%target, "SOCKS5 CONNECT succeeded");

    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;
    Ok(stream)
}

/// An established UDP ASSOCIATE
///
/// The TCP control connection must stay open for the lifetime of the
/// association; dropping this struct tears the association down.
#[derive(Debug)]
pub struct UdpAssociation {
    /// Control connection; the server may close it to end the association
    pub control: TcpStream,
    /// Local UDP socket, connected to the relay address
    pub relay: UdpSocket,
    relay_addr: SocketAddr,
}

impl UdpAssociation {
    /// The relay endpoint the server returned
    #[must_use]
    pub const fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// Send one datagram to `target` through the relay
    ///
    /// # Errors
    ///
    /// Encoding or socket errors.
    pub fn send_to(&self, target: &Target, payload: &[u8]) -> Result<(), Socks5Error> {
        let packet = encode_udp_packet(target, payload)?;
        self.relay.send(&packet)?;
        Ok(())
    }

    /// Receive one datagram from the relay
    ///
    /// Returns the origin address and payload. Blocks up to the socket's
    /// read timeout.
    ///
    /// # Errors
    ///
    /// Socket errors, malformed packets, or fragmented packets.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(SocketAddr, Vec<u8>), Socks5Error> {
        let n = self.relay.recv(buf)?;
        decode_udp_packet(&buf[..n])
    }
}

/// Establish a UDP ASSOCIATE with the proxy
///
/// # Errors
///
/// Handshake failures, or a server reply without a usable relay address.
pub fn udp_associate(config: &ProxyConfig) -> Result<UdpAssociation, Socks5Error> {
    let mut control = tcp_connect(config)?;
    handshake(&mut control, config)?;

    // DST.ADDR/DST.PORT are the address the client will send from; we do
    // not know it yet, so all-zeros per common practice.
    let target = Target::Ip(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
    let request = build_request(CMD_UDP_ASSOCIATE, &target)?;
    control.write_all(&request)?;
    let mut relay_addr = read_reply(&mut control)?;

    // Servers behind NAT often reply with an unspecified address; the relay
    // then lives on the server's own address.
    if relay_addr.ip().is_unspecified() {
        relay_addr.set_ip(config.server.ip());
    }
    if relay_addr.port() == 0 {
        return Err(Socks5Error::Protocol("relay port is zero".into()));
    }

    let bind_addr: SocketAddr = if relay_addr.is_ipv4() {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0))
    };
    let relay = UdpSocket::bind(bind_addr)?;
    relay.connect(relay_addr)?;

    control.set_read_timeout(None)?;
    control.set_write_timeout(None)?;

    debug!(%relay_addr, "SOCKS5 UDP association established");

    Ok(UdpAssociation {
        control,
        relay,
        relay_addr,
    })
}

/// Establish a UDP association carried on the TCP control stream
///
/// Same negotiation as [`udp_associate`], but datagrams are then exchanged
/// on the returned control stream itself, length-prefixed (see
/// [`write_tcp_datagram`] / [`read_tcp_datagram`]). The relay address in
/// the reply is irrelevant in this mode.
///
/// # Errors
///
/// Handshake or reply failures.
pub fn udp_associate_stream(config: &ProxyConfig) -> Result<TcpStream, Socks5Error> {
    let mut control = tcp_connect(config)?;
    handshake(&mut control, config)?;

    let target = Target::Ip(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
    let request = build_request(CMD_UDP_ASSOCIATE, &target)?;
    control.write_all(&request)?;
    read_reply(&mut control)?;

    control.set_read_timeout(None)?;
    control.set_write_timeout(None)?;

    debug!("SOCKS5 UDP-in-TCP association established");
    Ok(control)
}

/// Wrap a payload in the RFC 1928 UDP packet header
///
/// # Errors
///
/// Returns a protocol error for out-of-range domain names.
pub fn encode_udp_packet(target: &Target, payload: &[u8]) -> Result<Vec<u8>, Socks5Error> {
    let mut packet = Vec::with_capacity(22 + payload.len());
    packet.extend_from_slice(&[0x00, 0x00]); // RSV
    packet.push(0x00); // FRAG
    encode_target(&mut packet, target)?;
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// Strip the RFC 1928 UDP packet header
///
/// Returns the origin address and the payload.
///
/// # Errors
///
/// Malformed headers, fragments, and domain-form origins (which cannot be
/// mapped back to a packet source) are rejected.
pub fn decode_udp_packet(packet: &[u8]) -> Result<(SocketAddr, Vec<u8>), Socks5Error> {
    if packet.len() < 4 {
        return Err(Socks5Error::Protocol("UDP packet too short".into()));
    }
    if packet[0] != 0 || packet[1] != 0 {
        return Err(Socks5Error::Protocol("non-zero RSV field".into()));
    }
    if packet[2] != 0 {
        return Err(Socks5Error::FragmentedPacket { frag: packet[2] });
    }

    let (origin, offset) = match packet[3] {
        ATYP_IPV4 => {
            if packet.len() < 10 {
                return Err(Socks5Error::Protocol("truncated IPv4 header".into()));
            }
            let ip = Ipv4Addr::new(packet[4], packet[5], packet[6], packet[7]);
            let port = u16::from_be_bytes([packet[8], packet[9]]);
            (SocketAddr::V4(SocketAddrV4::new(ip, port)), 10)
        }
        ATYP_IPV6 => {
            if packet.len() < 22 {
                return Err(Socks5Error::Protocol("truncated IPv6 header".into()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[4..20]);
            let port = u16::from_be_bytes([packet[20], packet[21]]);
            (
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0)),
                22,
            )
        }
        ATYP_DOMAIN => {
            return Err(Socks5Error::Protocol(
                "domain-form origin in relayed packet".into(),
            ));
        }
        other => return Err(Socks5Error::InvalidAddressType(other)),
    };

    Ok((origin, packet[offset..].to_vec()))
}

/// Send one length-prefixed UDP packet on a TCP control stream
///
/// # Errors
///
/// Encoding errors, oversized datagrams, or stream errors.
pub fn write_tcp_datagram<W: Write>(
    stream: &mut W,
    target: &Target,
    payload: &[u8],
) -> Result<(), Socks5Error> {
    let packet = encode_udp_packet(target, payload)?;
    let len = u16::try_from(packet.len())
        .map_err(|_| Socks5Error::Protocol("datagram exceeds 65535 bytes".into()))?;
    let mut frame = Vec::with_capacity(2 + packet.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&packet);
    stream.write_all(&frame)?;
    Ok(())
}

/// Read one length-prefixed UDP packet from a TCP control stream
///
/// Returns the origin address and payload.
///
/// # Errors
///
/// Stream errors (including read timeouts) and malformed packets.
pub fn read_tcp_datagram<R: Read>(stream: &mut R) -> Result<(SocketAddr, Vec<u8>), Socks5Error> {
    let mut len = [0u8; 2];
    stream.read_exact(&mut len)?;
    let len = u16::from_be_bytes(len) as usize;
    let mut packet = vec![0u8; len];
    stream.read_exact(&mut packet)?;
    decode_udp_packet(&packet)
}

/// Reverse-map an IP destination into a domain target when possible
///
/// Sessions use this so the proxy sees the hostname the client originally
/// resolved instead of a synthesized address.
#[must_use]
pub fn target_for(dst: SocketAddr, mapdns: Option<&crate::mapdns::MappedDns>) -> Target {
    if let (SocketAddr::V4(v4), Some(dns)) = (dst, mapdns) {
        if let Some(host) = dns.lookup(*v4.ip()) {
            return Target::Domain(host, v4.port());
        }
    }
    Target::Ip(dst)
}
