//! Embedded IP stack domain
//!
//! Everything in this module lives behind a single process-wide mutex, the
//! **stack lock** (`Mutex<Stack>` held by the tunnel controller). Readers
//! call [`Stack::input`] under the lock; sessions take the lock for the
//! duration of one operation; the timer takes it around [`Stack::tick`].
//! Holding the lock across upstream socket I/O is prohibited.
//!
//! # Inbound classification
//!
//! The interface accepts any destination (`set_any_ip`), and a listening
//! TCP socket is materialized per flow when its first SYN is seen, before
//! the packet is fed to the interface. That makes every inbound TCP
//! destination connectable, the way a gateway stack with a pretend-TCP
//! listener behaves.
//!
//! UDP is handled out of band: datagrams are parsed here and delivered to
//! per-flow inboxes consumed by UDP sessions; responses come back as
//! hand-built packets (see [`packet`]). Datagrams for the mapped-DNS
//! intercept address are answered synchronously and never create a flow.

pub mod checksum;
pub mod device;
pub mod packet;

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant as StdInstant;

use parking_lot::Mutex;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpListenEndpoint, IpProtocol, Ipv4Address, Ipv4Packet,
    Ipv6Address, Ipv6Packet, TcpPacket, UdpPacket,
};
use tracing::{debug, trace, warn};

use crate::error::StackError;
use crate::io::PacketQueue;
use crate::mapdns::MappedDns;
use device::StackDevice;

/// Per-direction TCP buffer size
pub const TCP_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on live sockets in the socket set
const MAX_SOCKETS: usize = 4096;

/// Datagrams a UDP flow inbox holds before dropping
const UDP_INBOX_CAPACITY: usize = 128;

/// Key of a TCP flow: (host-side source, destination)
pub type TcpFlowKey = (SocketAddr, SocketAddr);

/// Key of a UDP flow: the host-side source endpoint
pub type UdpFlowKey = SocketAddr;

/// One inbound datagram as seen by a UDP session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Destination the host addressed
    pub dst: SocketAddr,
    /// UDP payload
    pub payload: Vec<u8>,
}

/// Bounded inbox of inbound datagrams for one UDP flow
///
/// Filled by [`Stack::input`] under the stack lock, drained by the session
/// under the inbox's own lock.
#[derive(Debug)]
pub struct UdpInbox {
    queue: Mutex<VecDeque<Datagram>>,
    capacity: usize,
}

impl UdpInbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Append a datagram; `false` (dropped) when the inbox is full
    pub fn push(&self, datagram: Datagram) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(datagram);
        true
    }

    /// Take the oldest datagram
    pub fn pop(&self) -> Option<Datagram> {
        self.queue.lock().pop_front()
    }

    /// Current depth
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Check whether the inbox is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// Event produced by [`Stack::input`]
///
/// The dispatcher handles these after releasing the stack lock; session
/// construction and index insertion never run under it.
#[derive(Debug)]
pub enum StackEvent {
    /// A new inbound TCP connection left the listen state
    TcpAccepted {
        /// Flow key; `key.1` is the destination the host dialed
        key: TcpFlowKey,
        /// Socket handle for session I/O
        handle: SocketHandle,
    },
    /// First datagram of a new UDP flow arrived
    UdpFlowNew {
        /// Host-side source endpoint
        key: UdpFlowKey,
        /// Inbox already holding the first datagram
        inbox: Arc<UdpInbox>,
    },
}

/// Result of a TCP receive attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpRecv {
    /// Bytes copied out
    Data(usize),
    /// Nothing buffered; the flow is still open
    Empty,
    /// Receive half closed (FIN seen and drained)
    Closed,
}

struct TcpFlow {
    handle: SocketHandle,
    accepted: bool,
}

/// The embedded stack and its flow tables
pub struct Stack {
    iface: Interface,
    sockets: SocketSet<'static>,
    device: StackDevice,
    tcp_flows: HashMap<TcpFlowKey, TcpFlow>,
    udp_flows: HashMap<UdpFlowKey, Arc<UdpInbox>>,
    mapdns: Option<Arc<MappedDns>>,
    intercept: Option<(Ipv4Addr, u16)>,
    epoch: StdInstant,
}

impl Stack {
    /// Create the stack
    ///
    /// `queue` is the shared outbound packet queue. `ipv4`/`ipv6` become
    /// the interface's own addresses (loopback when unset; with any-IP
    /// routing the value only matters for locally originated traffic).
    /// `mapdns` plus `intercept` enable the DNS intercept.
    #[must_use]
    pub fn new(
        queue: Arc<PacketQueue>,
        mtu: usize,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
        mapdns: Option<Arc<MappedDns>>,
        intercept: Option<(Ipv4Addr, u16)>,
    ) -> Self {
        let epoch = StdInstant::now();
        let mut device = StackDevice::new(queue, mtu);

        let config = IfaceConfig::new(HardwareAddress::Ip);
        let mut iface = Interface::new(config, &mut device, SmoltcpInstant::from_millis(0));
        iface.set_any_ip(true);

        let v4 = ipv4.unwrap_or(Ipv4Addr::LOCALHOST);
        let v6 = ipv6.unwrap_or(Ipv6Addr::LOCALHOST);
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(Ipv4Address(v4.octets())), 32));
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv6(Ipv6Address(v6.octets())), 128));
        });
        {
            let routes = iface.routes_mut();
            routes.add_default_ipv4_route(Ipv4Address(v4.octets())).ok();
            routes.add_default_ipv6_route(Ipv6Address(v6.octets())).ok();
        }

        debug!(mtu, %v4, %v6, "stack initialized");

        Self {
            iface,
            sockets: SocketSet::new(Vec::new()),
            device,
            tcp_flows: HashMap::new(),
            udp_flows: HashMap::new(),
            mapdns,
            intercept,
            epoch,
        }
    }

    /// Feed one packet read from the TUN device
    ///
    /// Consumes the packet and returns events for the dispatcher to handle
    /// after the stack lock is released.
    pub fn input(&mut self, packet: Vec<u8>) -> Vec<StackEvent> {
        let mut events = Vec::new();
        match packet.first().map(|b| b >> 4) {
            Some(4) => self.input_v4(packet, &mut events),
            Some(6) => self.input_v6(packet, &mut events),
            Some(v) => trace!(version = v, "dropping packet with unknown IP version"),
            None => {}
        }
        events
    }

    fn input_v4(&mut self, packet: Vec<u8>, events: &mut Vec<StackEvent>) {
        let (proto, src_ip, dst_ip) = {
            let ip = match Ipv4Packet::new_checked(&packet[..]) {
                Ok(ip) => ip,
                Err(e) => {
                    trace!("dropping invalid IPv4 packet: {e}");
                    return;
                }
            };
            if ip.frag_offset() != 0 || ip.more_frags() {
                trace!("dropping IPv4 fragment");
                return;
            }
            (
                ip.next_header(),
                IpAddr::V4(Ipv4Addr::from(ip.src_addr().0)),
                IpAddr::V4(Ipv4Addr::from(ip.dst_addr().0)),
            )
        };

        match proto {
            IpProtocol::Udp => {
                let ip = Ipv4Packet::new_unchecked(&packet[..]);
                let Ok(udp) = UdpPacket::new_checked(ip.payload()) else {
                    trace!("dropping invalid UDP datagram");
                    return;
                };
                let src = SocketAddr::new(src_ip, udp.src_port());
                let dst = SocketAddr::new(dst_ip, udp.dst_port());
                let payload = udp.payload().to_vec();
                self.input_udp(src, dst, payload, events);
            }
            IpProtocol::Tcp => {
                let key = {
                    let ip = Ipv4Packet::new_unchecked(&packet[..]);
                    self.classify_tcp(src_ip, dst_ip, ip.payload())
                };
                self.feed_and_poll(packet);
                if let Some(key) = key {
                    self.maybe_accept(key, events);
                }
            }
            _ => self.feed_and_poll(packet),
        }
    }

    fn input_v6(&mut self, packet: Vec<u8>, events: &mut Vec<StackEvent>) {
        let (proto, src_ip, dst_ip) = {
            let ip = match Ipv6Packet::new_checked(&packet[..]) {
                Ok(ip) => ip,
                Err(e) => {
                    trace!("dropping invalid IPv6 packet: {e}");
                    return;
                }
            };
            (
                ip.next_header(),
                IpAddr::V6(Ipv6Addr::from(ip.src_addr().0)),
                IpAddr::V6(Ipv6Addr::from(ip.dst_addr().0)),
            )
        };

        match proto {
            IpProtocol::Udp => {
                let ip = Ipv6Packet::new_unchecked(&packet[..]);
                let Ok(udp) = UdpPacket::new_checked(ip.payload()) else {
                    trace!("dropping invalid UDP datagram");
                    return;
                };
                let src = SocketAddr::new(src_ip, udp.src_port());
                let dst = SocketAddr::new(dst_ip, udp.dst_port());
                let payload = udp.payload().to_vec();
                self.input_udp(src, dst, payload, events);
            }
            IpProtocol::Tcp => {
                let key = {
                    let ip = Ipv6Packet::new_unchecked(&packet[..]);
                    self.classify_tcp(src_ip, dst_ip, ip.payload())
                };
                self.feed_and_poll(packet);
                if let Some(key) = key {
                    self.maybe_accept(key, events);
                }
            }
            _ => self.feed_and_poll(packet),
        }
    }

    /// Parse the TCP header and make sure a flow socket exists for new SYNs
    ///
    /// Returns the flow key when a flow record exists afterwards, so the
    /// caller can fire the accept check after feeding the packet.
    fn classify_tcp(
        &mut self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        segment: &[u8],
    ) -> Option<TcpFlowKey> {
        let tcp = TcpPacket::new_checked(segment).ok()?;
        let src = SocketAddr::new(src_ip, tcp.src_port());
        let dst = SocketAddr::new(dst_ip, tcp.dst_port());
        let key = (src, dst);

        if self.tcp_flows.contains_key(&key) {
            return Some(key);
        }
        if !(tcp.syn() && !tcp.ack()) {
            // Mid-stream segment for an unknown flow; the interface answers
            // with a reset.
            return None;
        }
        if self.sockets.iter().count() >= MAX_SOCKETS {
            warn!("socket set exhausted, refusing new TCP flow");
            return None;
        }

        let mut socket = TcpSocket::new(
            SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
            SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
        );
        socket.set_nagle_enabled(false);

        let endpoint = IpListenEndpoint {
            addr: Some(to_smol_ip(dst.ip())),
            port: dst.port(),
        };
        if let Err(e) = socket.listen(endpoint) {
            warn!(%dst, "flow listen failed: {e}");
            return None;
        }

        let handle = self.sockets.add(socket);
        self.tcp_flows.insert(key, TcpFlow {
            handle,
            accepted: false,
        });
        trace!(%src, %dst, "TCP flow socket created");
        Some(key)
    }

    fn maybe_accept(&mut self, key: TcpFlowKey, events: &mut Vec<StackEvent>) {
        let Some(flow) = self.tcp_flows.get_mut(&key) else {
            return;
        };
        if flow.accepted {
            return;
        }
        let socket = self.sockets.get::<TcpSocket>(flow.handle);
        if socket.state() != TcpState::Listen {
            flow.accepted = true;
            debug!(src = %key.0, dst = %key.1, "TCP connection accepted");
            events.push(StackEvent::TcpAccepted {
                key,
                handle: flow.handle,
            });
        }
    }

    fn input_udp(
        &mut self,
        src: SocketAddr,
        dst: SocketAddr,
        payload: Vec<u8>,
        events: &mut Vec<StackEvent>,
    ) {
        // DNS intercept: answered synchronously, no flow is created.
        if let (SocketAddr::V4(d), Some((addr, port))) = (dst, self.intercept) {
            if *d.ip() == addr && d.port() == port {
                if let Some(dns) = self.mapdns.as_ref() {
                    if let Some(response) = dns.handle(&payload) {
                        if let Some(reply) = packet::build_udp(dst, src, &response) {
                            self.device.emit(reply);
                        }
                    }
                }
                return;
            }
        }

        if let Some(inbox) = self.udp_flows.get(&src) {
            if !inbox.push(Datagram { dst, payload }) {
                trace!(%src, "UDP inbox full, datagram dropped");
            }
            return;
        }

        let inbox = Arc::new(UdpInbox::new(UDP_INBOX_CAPACITY));
        inbox.push(Datagram { dst, payload });
        self.udp_flows.insert(src, Arc::clone(&inbox));
        debug!(%src, %dst, "UDP flow created");
        events.push(StackEvent::UdpFlowNew { key: src, inbox });
    }

    fn feed_and_poll(&mut self, packet: Vec<u8>) {
        self.device.stage_rx(packet);
        self.poll_now();
    }

    fn poll_now(&mut self) {
        let timestamp = self.timestamp();
        let Self {
            iface,
            device,
            sockets,
            ..
        } = self;
        iface.poll(timestamp, device, sockets);
    }

    fn timestamp(&self) -> SmoltcpInstant {
        #[allow(clippy::cast_possible_truncation)]
        SmoltcpInstant::from_micros(self.epoch.elapsed().as_micros() as i64)
    }

    /// Drive the stack's timers (TCP retransmission, delayed ACKs)
    ///
    /// Called by the timer thread on its tick.
    pub fn tick(&mut self) {
        self.poll_now();
    }

    // ------------------------------------------------------------------
    // Session-facing TCP operations (all called under the stack lock)
    // ------------------------------------------------------------------

    /// Receive inbound bytes from a flow socket
    pub fn tcp_recv(&mut self, handle: SocketHandle, buf: &mut [u8]) -> TcpRecv {
        let socket = self.sockets.get_mut::<TcpSocket>(handle);
        if socket.can_recv() {
            match socket.recv_slice(buf) {
                Ok(0) => TcpRecv::Empty,
                Ok(n) => {
                    // Receiving frees window space; announce it.
                    self.poll_now();
                    TcpRecv::Data(n)
                }
                Err(_) => TcpRecv::Closed,
            }
        } else if socket.may_recv() {
            TcpRecv::Empty
        } else {
            TcpRecv::Closed
        }
    }

    /// Send bytes toward the host on a flow socket
    ///
    /// `Ok(0)` means the send buffer is full (back off and retry).
    ///
    /// # Errors
    ///
    /// `StackError::Send` when the send half is no longer open.
    pub fn tcp_send(&mut self, handle: SocketHandle, data: &[u8]) -> Result<usize, StackError> {
        let socket = self.sockets.get_mut::<TcpSocket>(handle);
        if !socket.may_send() {
            return Err(StackError::Send("send half closed".into()));
        }
        match socket.send_slice(data) {
            Ok(n) => {
                self.poll_now();
                Ok(n)
            }
            Err(e) => Err(StackError::Send(e.to_string())),
        }
    }

    /// Close the host-facing send half (emits FIN once drained)
    pub fn tcp_close(&mut self, handle: SocketHandle) {
        self.sockets.get_mut::<TcpSocket>(handle).close();
        self.poll_now();
    }

    /// Reset the flow
    pub fn tcp_abort(&mut self, handle: SocketHandle) {
        self.sockets.get_mut::<TcpSocket>(handle).abort();
        self.poll_now();
    }

    /// Whether the socket still participates in a connection
    #[must_use]
    pub fn tcp_is_active(&self, handle: SocketHandle) -> bool {
        self.sockets.get::<TcpSocket>(handle).is_active()
    }

    /// Whether the send half toward the host is open
    #[must_use]
    pub fn tcp_may_send(&self, handle: SocketHandle) -> bool {
        self.sockets.get::<TcpSocket>(handle).may_send()
    }

    /// Current TCP state of a flow socket
    #[must_use]
    pub fn tcp_state(&self, handle: SocketHandle) -> TcpState {
        self.sockets.get::<TcpSocket>(handle).state()
    }

    /// Remove a TCP flow and destroy its socket
    pub fn remove_tcp_flow(&mut self, key: &TcpFlowKey) {
        if let Some(flow) = self.tcp_flows.remove(key) {
            self.sockets.remove(flow.handle);
            self.poll_now();
            trace!(src = %key.0, dst = %key.1, "TCP flow removed");
        }
    }

    /// Remove a UDP flow and its inbox
    pub fn remove_udp_flow(&mut self, key: &UdpFlowKey) {
        if self.udp_flows.remove(key).is_some() {
            trace!(src = %key, "UDP flow removed");
        }
    }

    /// Emit a pre-built packet onto the outbound queue
    ///
    /// Non-blocking; drops with a rate-limited warning when the queue is
    /// full.
    pub fn emit(&self, packet: Vec<u8>) -> bool {
        self.device.emit(packet)
    }

    /// Number of live TCP flows
    #[must_use]
    pub fn tcp_flow_count(&self) -> usize {
        self.tcp_flows.len()
    }

    /// Number of live UDP flows
    #[must_use]
    pub fn udp_flow_count(&self) -> usize {
        self.udp_flows.len()
    }
}

fn to_smol_ip(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address(v4.octets())),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address(v6.octets())),
    }
}
