//! Raw UDP packet construction
//!
//! UDP never touches the embedded stack's socket layer: inbound datagrams
//! are parsed straight out of `Stack::input`, and responses are rebuilt here
//! as complete IP packets with the exact source the peer expects. Building
//! responses directly sidesteps source-address selection on a many-flows,
//! any-IP interface.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use super::checksum;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;

/// Build a complete IP/UDP packet from `src` to `dst`
///
/// Returns `None` for mixed address families.
#[must_use]
pub fn build_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    match (src, dst) {
        (SocketAddr::V4(s), SocketAddr::V4(d)) => Some(build_udp_v4(
            *s.ip(),
            *d.ip(),
            s.port(),
            d.port(),
            payload,
        )),
        (SocketAddr::V6(s), SocketAddr::V6(d)) => Some(build_udp_v6(
            *s.ip(),
            *d.ip(),
            s.port(),
            d.port(),
            payload,
        )),
        _ => None,
    }
}

fn build_udp_v4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut buffer = vec![0u8; total_len];

    buffer[0] = 0x45; // version 4, IHL 5
    #[allow(clippy::cast_possible_truncation)]
    buffer[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buffer[8] = 64; // TTL
    buffer[9] = 17; // UDP
    buffer[12..16].copy_from_slice(&src.octets());
    buffer[16..20].copy_from_slice(&dst.octets());

    let udp = IPV4_HEADER_LEN;
    buffer[udp..udp + 2].copy_from_slice(&src_port.to_be_bytes());
    buffer[udp + 2..udp + 4].copy_from_slice(&dst_port.to_be_bytes());
    #[allow(clippy::cast_possible_truncation)]
    buffer[udp + 4..udp + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[udp + UDP_HEADER_LEN..].copy_from_slice(payload);

    let udp_checksum = checksum::udp_ipv4(src, dst, &buffer[udp..]);
    buffer[udp + 6..udp + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    let ip_checksum = checksum::ipv4_header(&buffer[..IPV4_HEADER_LEN]);
    buffer[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    buffer
}

fn build_udp_v6(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut buffer = vec![0u8; IPV6_HEADER_LEN + udp_len];

    buffer[0] = 0x60; // version 6
    #[allow(clippy::cast_possible_truncation)]
    buffer[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[6] = 17; // next header = UDP
    buffer[7] = 64; // hop limit
    buffer[8..24].copy_from_slice(&src.octets());
    buffer[24..40].copy_from_slice(&dst.octets());

    let udp = IPV6_HEADER_LEN;
    buffer[udp..udp + 2].copy_from_slice(&src_port.to_be_bytes());
    buffer[udp + 2..udp + 4].copy_from_slice(&dst_port.to_be_bytes());
    #[allow(clippy::cast_possible_truncation)]
    buffer[udp + 4..udp + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[udp + UDP_HEADER_LEN..].copy_from_slice(payload);

    // Checksum is mandatory for IPv6.
    let udp_checksum = checksum::udp_ipv6(src, dst, &buffer[udp..]);
    buffer[udp + 6..udp + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    buffer
}
