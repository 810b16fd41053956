//! Tunnel controller
//!
//! The facade tying everything together: TUN device, I/O engine, embedded
//! stack, thread pool, session index, mapped DNS and the timer.
//!
//! # Lifecycle
//!
//! - [`Tunnel::init`]: open (or adopt) the TUN device, build the stack and
//!   the pool, wire the read callback. No threads are started.
//! - [`Tunnel::run`]: start the timer and the I/O engine; blocks until
//!   [`Tunnel::stop`].
//! - [`Tunnel::stop`]: clear the run flag, cancel sessions, stop I/O.
//! - [`Tunnel::fini`]: tear down in reverse order of `init`; also runs on
//!   drop.
//!
//! # Data path
//!
//! Reader threads deliver packets to the dispatcher, which feeds the stack
//! under the stack lock and handles the resulting events after releasing
//! it: sessions are constructed lock-free, registered in the index, and
//! submitted to the pool. Session tasks do the rest.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use smoltcp::iface::SocketHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, UdpMode};
use crate::error::TunSocksError;
use crate::io::{StatsSnapshot, TunnelIo};
use crate::mapdns::MappedDns;
use crate::pool::ThreadPool;
use crate::session::{SessionIndex, SessionKind, TcpSession, UdpSession};
use crate::socks5::ProxyConfig;
use crate::stack::{Stack, StackEvent, TcpFlowKey, UdpFlowKey, UdpInbox};
use crate::timer::TimerDriver;
use crate::tun::{self, TunFd};

/// The tunnel controller
pub struct Tunnel {
    config: Config,
    run_flag: Arc<AtomicBool>,
    tun: Arc<TunFd>,
    io: Arc<TunnelIo>,
    pool: Arc<ThreadPool>,
    stack: Arc<Mutex<Stack>>,
    sessions: Arc<SessionIndex>,
    finished: AtomicBool,
}

impl Tunnel {
    /// Initialize the tunnel
    ///
    /// With `extern_tun_fd` set, that descriptor is switched to
    /// non-blocking mode and adopted (and never closed by us); otherwise a
    /// TUN device is opened and configured per `config.tunnel`, and the
    /// post-up script runs.
    ///
    /// # Errors
    ///
    /// Configuration, TUN or resolution failures; nothing is left running
    /// on error.
    pub fn init(config: Config, extern_tun_fd: Option<RawFd>) -> Result<Self, TunSocksError> {
        info!("initializing tunnel");

        config.validate()?;

        // A dead upstream write must surface as an error, not a signal.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let tun = match extern_tun_fd {
            Some(fd) => TunFd::adopt(fd)?,
            None => {
                let tun = TunFd::open(&config.tunnel.name)?;
                tun::configure(&tun, &config.tunnel)?;
                if let Some(script) = &config.tunnel.post_up {
                    tun::run_script(script, tun.name(), "post-up");
                }
                tun
            }
        };
        let tun = Arc::new(tun);

        let proxy = proxy_config(&config)?;

        let mapdns = match &config.mapdns {
            Some(section) => Some(Arc::new(MappedDns::from_config(section)?)),
            None => None,
        };
        let intercept = config.mapdns.as_ref().map(|m| (m.address, m.port));

        let io = Arc::new(TunnelIo::new(
            Arc::clone(&tun),
            usize::from(config.tunnel.mtu),
        ));
        let stack = Arc::new(Mutex::new(Stack::new(
            Arc::clone(io.queue()),
            usize::from(config.tunnel.mtu),
            config.tunnel.ipv4,
            config.tunnel.ipv6,
            mapdns.clone(),
            intercept,
        )));
        let pool = Arc::new(ThreadPool::new(0));
        let sessions = Arc::new(SessionIndex::new(config.misc.max_session_count));
        let run_flag = Arc::new(AtomicBool::new(false));

        let dispatcher = Dispatcher {
            stack: Arc::clone(&stack),
            pool: Arc::clone(&pool),
            sessions: Arc::clone(&sessions),
            proxy,
            mapdns,
            run_flag: Arc::clone(&run_flag),
            udp_mode: config.socks5.udp,
            udp_idle_timeout: config.socks5.udp_idle_timeout(),
        };
        io.set_read_callback(Some(Box::new(move |packet| dispatcher.on_packet(packet))));

        info!("tunnel initialized");

        Ok(Self {
            config,
            run_flag,
            tun,
            io,
            pool,
            stack,
            sessions,
            finished: AtomicBool::new(false),
        })
    }

    /// Run the tunnel; blocks until [`Tunnel::stop`]
    ///
    /// # Errors
    ///
    /// Currently infallible after a successful `init`; the `Result` keeps
    /// room for startup failures.
    pub fn run(&self) -> Result<(), TunSocksError> {
        info!("starting tunnel");

        self.run_flag.store(true, Ordering::SeqCst);
        let timer = TimerDriver::start(Arc::clone(&self.stack), Arc::clone(&self.run_flag));
        self.io.start();

        info!("tunnel running");

        // The timer exits once the run flag clears; that is the signal that
        // `stop` was called.
        timer.join();

        info!("tunnel stopped");
        Ok(())
    }

    /// Signal every thread to exit
    ///
    /// Idempotent. Joins the I/O threads; worker threads wind down as their
    /// sessions observe the cancellation and are joined by [`Tunnel::fini`].
    pub fn stop(&self) {
        if !self.run_flag.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping tunnel");
        self.sessions.cancel_all();
        self.io.stop();
    }

    /// Tear everything down in reverse order of `init`
    ///
    /// Idempotent; also invoked on drop. The pre-down script runs before
    /// the owned TUN device is released.
    pub fn fini(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("finalizing tunnel");

        self.stop();
        self.pool.shutdown();
        self.sessions.clear();

        if self.tun.is_owned() {
            if let Some(script) = &self.config.tunnel.pre_down {
                tun::run_script(script, self.tun.name(), "pre-down");
            }
        }
        // The TUN fd itself closes when the last Arc drops (only if owned).

        info!("tunnel finalized");
    }

    /// Snapshot of the traffic counters
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.io.stats()
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.count()
    }

    /// Whether `run` is active
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.run_flag.load(Ordering::Relaxed)
    }

    /// The loaded configuration
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.fini();
    }
}

fn proxy_config(config: &Config) -> Result<ProxyConfig, TunSocksError> {
    let server: SocketAddr = config.socks5.server_addr()?;
    let mut proxy = ProxyConfig::new(server, config.socks5.connect_timeout());
    if let (Some(user), Some(pass)) = (&config.socks5.username, &config.socks5.password) {
        proxy = proxy.with_auth(user.clone(), pass.clone());
    }
    Ok(proxy)
}

/// Glue between the reader callback and the session layer
///
/// Feeds the stack under the stack lock, then handles the returned events
/// with the lock released: session construction never nests the index lock
/// inside the stack lock.
struct Dispatcher {
    stack: Arc<Mutex<Stack>>,
    pool: Arc<ThreadPool>,
    sessions: Arc<SessionIndex>,
    proxy: ProxyConfig,
    mapdns: Option<Arc<MappedDns>>,
    run_flag: Arc<AtomicBool>,
    udp_mode: UdpMode,
    udp_idle_timeout: Duration,
}

impl Dispatcher {
    fn on_packet(&self, packet: Vec<u8>) {
        if !self.run_flag.load(Ordering::Relaxed) {
            return;
        }

        let events = self.stack.lock().input(packet);
        for event in events {
            match event {
                StackEvent::TcpAccepted { key, handle } => self.spawn_tcp(key, handle),
                StackEvent::UdpFlowNew { key, inbox } => self.spawn_udp(key, inbox),
            }
        }
    }

    fn spawn_tcp(&self, key: TcpFlowKey, handle: SocketHandle) {
        let ctl = self.sessions.insert(SessionKind::Tcp, key.0);
        let session = TcpSession::new(
            key,
            handle,
            Arc::clone(&self.stack),
            self.proxy.clone(),
            self.mapdns.clone(),
            Arc::clone(&self.sessions),
            Arc::clone(&ctl),
            Arc::clone(&self.run_flag),
        );

        if let Err(e) = self.pool.submit(move || session.run()) {
            warn!("failed to submit TCP session: {e}");
            self.sessions.remove(ctl.id());
            let mut stack = self.stack.lock();
            stack.tcp_abort(handle);
            stack.remove_tcp_flow(&key);
        } else {
            debug!(src = %key.0, dst = %key.1, "TCP session dispatched");
        }
    }

    fn spawn_udp(&self, key: UdpFlowKey, inbox: Arc<UdpInbox>) {
        let ctl = self.sessions.insert(SessionKind::Udp, key);
        let session = UdpSession::new(
            key,
            inbox,
            Arc::clone(&self.stack),
            self.proxy.clone(),
            self.udp_mode,
            self.udp_idle_timeout,
            self.mapdns.clone(),
            Arc::clone(&self.sessions),
            Arc::clone(&ctl),
            Arc::clone(&self.run_flag),
        );

        if let Err(e) = self.pool.submit(move || session.run()) {
            warn!("failed to submit UDP session: {e}");
            self.sessions.remove(ctl.id());
            self.stack.lock().remove_udp_flow(&key);
        } else {
            debug!(src = %key, "UDP session dispatched");
        }
    }
}
