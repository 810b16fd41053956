//! TCP session relay
//!
//! One task per accepted inbound connection: connect to the SOCKS5 server,
//! CONNECT to the destination the host dialed (by hostname when mapped DNS
//! knows it), then shuttle bytes both ways until either side closes.
//!
//! The relay loop alternates between the two directions. Stack operations
//! take the stack lock for one call at a time; upstream socket I/O happens
//! strictly outside it, with the upstream read timeout pacing the loop.
//! Unwritten upstream data is held back in a pending buffer, which stops
//! stack reads and lets the flow's receive window close; backpressure
//! reaches the host as a shrinking window.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use smoltcp::iface::SocketHandle;
use tracing::{debug, trace, warn};

use super::{SessionCtl, SessionIndex};
use crate::mapdns::MappedDns;
use crate::socks5::{self, ProxyConfig};
use crate::stack::{Stack, TcpFlowKey, TcpRecv};

/// Upstream read timeout; paces the relay loop when idle
const POLL_TICK: Duration = Duration::from_millis(10);

/// Upstream write timeout; a stalled peer surfaces as a timed-out write
const WRITE_TICK: Duration = Duration::from_millis(10);

/// Backoff when the stack reports no buffer space
const STACK_BACKOFF: Duration = Duration::from_millis(1);

/// Grace period for the final FIN exchange on clean close
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Relay buffer size per direction
const RELAY_BUFFER: usize = 16 * 1024;

/// A TCP session bound to one inbound flow
pub struct TcpSession {
    key: TcpFlowKey,
    handle: SocketHandle,
    stack: Arc<Mutex<Stack>>,
    proxy: ProxyConfig,
    mapdns: Option<Arc<MappedDns>>,
    index: Arc<SessionIndex>,
    ctl: Arc<SessionCtl>,
    run_flag: Arc<AtomicBool>,
}

impl TcpSession {
    /// Create a session for an accepted flow
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: TcpFlowKey,
        handle: SocketHandle,
        stack: Arc<Mutex<Stack>>,
        proxy: ProxyConfig,
        mapdns: Option<Arc<MappedDns>>,
        index: Arc<SessionIndex>,
        ctl: Arc<SessionCtl>,
        run_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            key,
            handle,
            stack,
            proxy,
            mapdns,
            index,
            ctl,
            run_flag,
        }
    }

    /// Run the session to completion
    ///
    /// Executed on a worker thread; owns all cleanup.
    pub fn run(self) {
        if self.ctl.is_cancelled() || !self.run_flag.load(Ordering::Relaxed) {
            self.teardown(None, true);
            return;
        }

        let target = socks5::target_for(self.key.1, self.mapdns.as_deref());
        debug!(session = self.ctl.id(), peer = %self.key.0, %target, "TCP session starting");

        let upstream = match socks5::connect(&self.proxy, &target) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session = self.ctl.id(), %target, "SOCKS5 connect failed: {e}");
                self.teardown(None, true);
                return;
            }
        };

        let graceful = self.relay(&upstream);
        self.teardown(Some(upstream), !graceful);
    }

    /// Streaming phase; returns `true` on a clean bidirectional close
    fn relay(&self, upstream: &TcpStream) -> bool {
        if upstream.set_read_timeout(Some(POLL_TICK)).is_err()
            || upstream.set_write_timeout(Some(WRITE_TICK)).is_err()
        {
            return false;
        }
        let mut upstream = upstream;

        let mut stack_buf = vec![0u8; RELAY_BUFFER];
        let mut upstream_buf = vec![0u8; RELAY_BUFFER];
        // Bytes read from the stack but not yet written upstream.
        let mut pending: Vec<u8> = Vec::new();
        let mut pending_off = 0;

        let mut host_closed = false;
        let mut upstream_eof = false;

        loop {
            if self.ctl.is_cancelled() || !self.run_flag.load(Ordering::Relaxed) {
                trace!(session = self.ctl.id(), "session cancelled");
                return false;
            }
            let mut progressed = false;

            // stack -> upstream: only read more once the pending chunk is out.
            if !host_closed && pending_off == pending.len() {
                match self.stack.lock().tcp_recv(self.handle, &mut stack_buf) {
                    TcpRecv::Data(n) => {
                        pending.clear();
                        pending.extend_from_slice(&stack_buf[..n]);
                        pending_off = 0;
                    }
                    TcpRecv::Empty => {}
                    TcpRecv::Closed => {
                        host_closed = true;
                        let _ = upstream.shutdown(Shutdown::Write);
                        trace!(session = self.ctl.id(), "host closed, upstream write shut down");
                    }
                }
            }
            if pending_off < pending.len() {
                match upstream.write(&pending[pending_off..]) {
                    Ok(0) => {
                        debug!(session = self.ctl.id(), "upstream write side closed");
                        return false;
                    }
                    Ok(n) => {
                        pending_off += n;
                        progressed = true;
                    }
                    Err(e) if is_transient(&e) => {}
                    Err(e) => {
                        debug!(session = self.ctl.id(), "upstream write error: {e}");
                        return false;
                    }
                }
            }

            // upstream -> stack
            if !upstream_eof {
                match upstream.read(&mut upstream_buf) {
                    Ok(0) => {
                        upstream_eof = true;
                        self.stack.lock().tcp_close(self.handle);
                        trace!(session = self.ctl.id(), "upstream EOF, inbound write shut down");
                    }
                    Ok(n) => {
                        progressed = true;
                        if !self.push_to_stack(&upstream_buf[..n]) {
                            return false;
                        }
                    }
                    Err(e) if is_transient(&e) => {}
                    Err(e) => {
                        debug!(session = self.ctl.id(), "upstream read error: {e}");
                        return false;
                    }
                }
            }

            if host_closed && upstream_eof {
                return true;
            }
            if !progressed {
                if !self.stack.lock().tcp_is_active(self.handle) {
                    trace!(session = self.ctl.id(), "flow no longer active");
                    return host_closed && upstream_eof;
                }
                if upstream_eof {
                    // Nothing left to pace the loop; the host drain side
                    // polls on its own clock.
                    std::thread::sleep(POLL_TICK);
                }
            }
        }
    }

    /// Hand upstream bytes to the stack, backing off on a full buffer
    fn push_to_stack(&self, mut data: &[u8]) -> bool {
        while !data.is_empty() {
            if self.ctl.is_cancelled() || !self.run_flag.load(Ordering::Relaxed) {
                return false;
            }
            match self.stack.lock().tcp_send(self.handle, data) {
                Ok(0) => std::thread::sleep(STACK_BACKOFF),
                Ok(n) => data = &data[n..],
                Err(e) => {
                    debug!(session = self.ctl.id(), "stack send failed: {e}");
                    return false;
                }
            }
        }
        true
    }

    fn teardown(self, upstream: Option<TcpStream>, abort: bool) {
        if abort {
            self.stack.lock().tcp_abort(self.handle);
        } else {
            // Close was already initiated by the relay loop; give the final
            // FIN exchange a moment before tearing the socket down.
            self.stack.lock().tcp_close(self.handle);
            let deadline = std::time::Instant::now() + CLOSE_GRACE;
            while std::time::Instant::now() < deadline {
                if !self.stack.lock().tcp_is_active(self.handle) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        self.stack.lock().remove_tcp_flow(&self.key);
        drop(upstream);
        self.index.remove(self.ctl.id());
        debug!(session = self.ctl.id(), peer = %self.key.0, "TCP session closed");
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
