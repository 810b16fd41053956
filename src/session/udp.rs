//! UDP session relay
//!
//! One task per host-side source port. Inbound datagrams arrive through the
//! flow inbox filled by the stack under the stack lock; the session
//! encapsulates each one toward the proxy, tracking every destination it
//! has seen in its peer table. Responses from the proxy are rebuilt as raw
//! packets sourced from the peer the host addressed and injected onto the
//! outbound queue.
//!
//! Destinations inside the mapped-DNS subnet are presented to the proxy by
//! hostname. The proxy then replies from the real address, which the host
//! has never seen, so response origins are rewritten back to the synthetic
//! peer with the matching port before injection.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

use super::{SessionCtl, SessionIndex};
use crate::config::UdpMode;
use crate::mapdns::MappedDns;
use crate::socks5::{self, ProxyConfig, Socks5Error, UdpAssociation};
use crate::stack::{packet, Stack, UdpFlowKey, UdpInbox};

/// Upstream receive timeout; paces the relay loop
const POLL_TICK: Duration = Duration::from_millis(10);

/// Timeout for the body of a length-prefixed frame once its start was seen
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest datagram accepted from the relay
const RECV_BUFFER: usize = 64 * 1024;

enum Upstream {
    /// Native UDP ASSOCIATE relay
    Assoc(UdpAssociation),
    /// Datagrams carried on the TCP control connection
    Stream(TcpStream),
}

/// A UDP session bound to one host-side source port
pub struct UdpSession {
    key: UdpFlowKey,
    inbox: Arc<UdpInbox>,
    stack: Arc<Mutex<Stack>>,
    proxy: ProxyConfig,
    mode: UdpMode,
    idle_timeout: Duration,
    mapdns: Option<Arc<MappedDns>>,
    index: Arc<SessionIndex>,
    ctl: Arc<SessionCtl>,
    run_flag: Arc<AtomicBool>,
}

impl UdpSession {
    /// Create a session for a new UDP flow
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: UdpFlowKey,
        inbox: Arc<UdpInbox>,
        stack: Arc<Mutex<Stack>>,
        proxy: ProxyConfig,
        mode: UdpMode,
        idle_timeout: Duration,
        mapdns: Option<Arc<MappedDns>>,
        index: Arc<SessionIndex>,
        ctl: Arc<SessionCtl>,
        run_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            key,
            inbox,
            stack,
            proxy,
            mode,
            idle_timeout,
            mapdns,
            index,
            ctl,
            run_flag,
        }
    }

    /// Run the session to completion
    pub fn run(self) {
        if self.ctl.is_cancelled() || !self.run_flag.load(Ordering::Relaxed) {
            self.teardown();
            return;
        }

        debug!(session = self.ctl.id(), peer = %self.key, mode = ?self.mode, "UDP session starting");

        let upstream = match self.open_upstream() {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(session = self.ctl.id(), "SOCKS5 UDP association failed: {e}");
                self.teardown();
                return;
            }
        };

        self.relay(&upstream);
        self.teardown();
    }

    fn open_upstream(&self) -> Result<Upstream, Socks5Error> {
        match self.mode {
            UdpMode::Udp => {
                let assoc = socks5::udp_associate(&self.proxy)?;
                assoc.relay.set_read_timeout(Some(POLL_TICK))?;
                Ok(Upstream::Assoc(assoc))
            }
            UdpMode::Tcp => {
                let stream = socks5::udp_associate_stream(&self.proxy)?;
                stream.set_read_timeout(Some(POLL_TICK))?;
                Ok(Upstream::Stream(stream))
            }
        }
    }

    fn relay(&self, upstream: &Upstream) {
        let mut recv_buf = vec![0u8; RECV_BUFFER];
        // Destinations the host has addressed, newest activity last.
        let mut peers: HashMap<SocketAddr, Instant> = HashMap::new();
        let mut last_activity = Instant::now();

        loop {
            if self.ctl.is_cancelled() || !self.run_flag.load(Ordering::Relaxed) {
                trace!(session = self.ctl.id(), "session cancelled");
                return;
            }

            // inbound -> upstream
            while let Some(datagram) = self.inbox.pop() {
                last_activity = Instant::now();
                if peers.insert(datagram.dst, last_activity).is_none() {
                    trace!(session = self.ctl.id(), peer = %datagram.dst, "new UDP peer");
                }
                let target = socks5::target_for(datagram.dst, self.mapdns.as_deref());
                let sent = match upstream {
                    Upstream::Assoc(assoc) => assoc.send_to(&target, &datagram.payload),
                    Upstream::Stream(stream) => {
                        let mut stream = stream;
                        socks5::write_tcp_datagram(&mut stream, &target, &datagram.payload)
                    }
                };
                if let Err(e) = sent {
                    debug!(session = self.ctl.id(), "upstream send failed: {e}");
                    return;
                }
            }

            // upstream -> inbound
            match self.recv_upstream(upstream, &mut recv_buf) {
                Ok(Some((origin, payload))) => {
                    last_activity = Instant::now();
                    let origin = self.rewrite_origin(origin, &peers);
                    match packet::build_udp(origin, self.key, &payload) {
                        Some(reply) => {
                            self.stack.lock().emit(reply);
                        }
                        None => trace!(
                            session = self.ctl.id(),
                            %origin,
                            "response family mismatch, dropped"
                        ),
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(session = self.ctl.id(), "upstream receive failed: {e}");
                    return;
                }
            }

            if last_activity.elapsed() > self.idle_timeout {
                debug!(session = self.ctl.id(), peer = %self.key, "UDP session idle timeout");
                return;
            }
        }
    }

    /// Receive one relayed datagram; `Ok(None)` on a poll timeout
    fn recv_upstream(
        &self,
        upstream: &Upstream,
        buf: &mut [u8],
    ) -> Result<Option<(SocketAddr, Vec<u8>)>, Socks5Error> {
        match upstream {
            Upstream::Assoc(assoc) => match assoc.recv_from(buf) {
                Ok(pair) => Ok(Some(pair)),
                Err(Socks5Error::Io(e)) if is_transient(&e) => Ok(None),
                Err(e @ Socks5Error::Io(_)) => Err(e),
                Err(e) => {
                    // Malformed datagram: drop it, keep the session.
                    trace!(session = self.ctl.id(), "dropping bad relay datagram: {e}");
                    Ok(None)
                }
            },
            Upstream::Stream(stream) => {
                // A frame may straddle poll ticks; only commit to reading it
                // once its first bytes are visible, then allow the sender a
                // full frame timeout.
                let mut probe = [0u8; 2];
                match stream.peek(&mut probe) {
                    Ok(0) => {
                        return Err(Socks5Error::Protocol("control connection closed".into()))
                    }
                    Ok(_) => {}
                    Err(e) if is_transient(&e) => return Ok(None),
                    Err(e) => return Err(e.into()),
                }

                stream.set_read_timeout(Some(FRAME_TIMEOUT))?;
                let mut stream_ref = stream;
                let result = socks5::read_tcp_datagram(&mut stream_ref);
                stream.set_read_timeout(Some(POLL_TICK))?;
                result.map(Some)
            }
        }
    }

    /// Map a response origin back into the host's view of the world
    ///
    /// Origins the host already knows pass through. Unknown origins are
    /// matched by port against peers inside the mapped-DNS subnet (the
    /// proxy resolved a hostname we presented and replied from the real
    /// address).
    fn rewrite_origin(&self, origin: SocketAddr, peers: &HashMap<SocketAddr, Instant>) -> SocketAddr {
        if peers.contains_key(&origin) {
            return origin;
        }
        let Some(mapdns) = self.mapdns.as_ref() else {
            return origin;
        };
        peers
            .keys()
            .find(|peer| {
                peer.port() == origin.port()
                    && matches!(peer, SocketAddr::V4(v4) if mapdns.contains(*v4.ip()))
            })
            .copied()
            .unwrap_or(origin)
    }

    fn teardown(self) {
        self.stack.lock().remove_udp_flow(&self.key);
        self.index.remove(self.ctl.id());
        debug!(session = self.ctl.id(), peer = %self.key, "UDP session closed");
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}
