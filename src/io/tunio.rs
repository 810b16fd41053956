//! Multi-threaded TUN I/O engine
//!
//! Owns the reader threads (TUN fd → read callback) and writer threads
//! (packet queue → TUN fd), plus the traffic counters. Reader and writer
//! counts scale with the host: two of each on machines with four or more
//! CPUs, one of each below that.
//!
//! Packets read concurrently by multiple readers, or written concurrently by
//! multiple writers, carry no relative ordering guarantee; the embedded
//! stack tolerates reordering the way any IP network does.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::queue::PacketQueue;
use crate::tun::TunFd;

/// Packets moved from the queue to the device per writer wakeup
const WRITE_BATCH: usize = 16;

/// Bounded wait on the queue condition before re-checking the run flag
const WRITE_WAIT: Duration = Duration::from_millis(1);

/// Backoff after a transient read error on the TUN fd
const READ_RETRY_DELAY: Duration = Duration::from_micros(100);

/// Queue-full warnings are emitted once per this many drops
const DROP_WARN_INTERVAL: u64 = 1024;

/// Callback invoked with each packet read from the TUN device
///
/// The callback owns the packet and must consume it.
pub type ReadCallback = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// Snapshot of the traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Packets written to the TUN device
    pub tx_packets: u64,
    /// Bytes written to the TUN device
    pub tx_bytes: u64,
    /// Packets read from the TUN device
    pub rx_packets: u64,
    /// Bytes read from the TUN device
    pub rx_bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    queue_drops: AtomicU64,
}

/// Multi-threaded reader/writer engine over a shared TUN descriptor
pub struct TunnelIo {
    tun: Arc<TunFd>,
    mtu: usize,
    num_readers: usize,
    num_writers: usize,
    running: Arc<AtomicBool>,
    queue: Arc<PacketQueue>,
    callback: Arc<Mutex<Option<ReadCallback>>>,
    counters: Arc<Counters>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelIo {
    /// Create the engine for a TUN descriptor
    ///
    /// Thread counts are sized from the CPU count at construction.
    #[must_use]
    pub fn new(tun: Arc<TunFd>, mtu: usize) -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        let num_readers = if cpus >= 4 { 2 } else { 1 };
        let num_writers = if cpus >= 4 { 2 } else { 1 };

        info!(num_readers, num_writers, mtu, "tunnel io created");

        Self {
            tun,
            mtu,
            num_readers,
            num_writers,
            running: Arc::new(AtomicBool::new(false)),
            queue: PacketQueue::new(),
            callback: Arc::new(Mutex::new(None)),
            counters: Arc::new(Counters::default()),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Install or replace the read callback
    ///
    /// The callback pointer sits behind its own short-lived lock so it can
    /// be swapped while readers are live.
    pub fn set_read_callback(&self, callback: Option<ReadCallback>) {
        *self.callback.lock() = callback;
    }

    /// The shared outbound packet queue
    ///
    /// The stack's output path enqueues here directly.
    #[must_use]
    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    /// Enqueue a packet for the TUN writers
    ///
    /// Never blocks. On a full queue the packet is dropped and `false`
    /// returned; the warning is rate limited.
    pub fn write(&self, packet: Vec<u8>) -> bool {
        if self.queue.push(packet) {
            return true;
        }
        let drops = self.counters.queue_drops.fetch_add(1, Ordering::Relaxed);
        if drops % DROP_WARN_INTERVAL == 0 {
            warn!(drops = drops + 1, "tunnel io: write queue full");
        }
        false
    }

    /// Start the reader and writer threads
    ///
    /// Spawns exactly `num_readers + num_writers` threads. Idempotent while
    /// running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut threads = self.threads.lock();
        for i in 0..self.num_readers {
            let tun = Arc::clone(&self.tun);
            let running = Arc::clone(&self.running);
            let callback = Arc::clone(&self.callback);
            let counters = Arc::clone(&self.counters);
            let mtu = self.mtu;
            threads.push(
                std::thread::Builder::new()
                    .name(format!("tun-reader-{i}"))
                    .spawn(move || reader_loop(&tun, mtu, &running, &callback, &counters))
                    .expect("spawn reader thread"),
            );
        }
        for i in 0..self.num_writers {
            let tun = Arc::clone(&self.tun);
            let running = Arc::clone(&self.running);
            let queue = Arc::clone(&self.queue);
            let counters = Arc::clone(&self.counters);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("tun-writer-{i}"))
                    .spawn(move || writer_loop(&tun, &running, &queue, &counters))
                    .expect("spawn writer thread"),
            );
        }
        drop(threads);

        info!("tunnel io started");
    }

    /// Stop and join every I/O thread, then drain the queue
    ///
    /// Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.queue.notify_all();

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }

        let dropped = self.queue.drain();
        if dropped > 0 {
            debug!(dropped, "tunnel io: residual queue entries dropped");
        }
        info!("tunnel io stopped");
    }

    /// Whether the engine threads are running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Snapshot of the traffic counters
    ///
    /// Counters use relaxed atomics; a snapshot is not a consistent cut
    /// across all four values.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_packets: self.counters.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.counters.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.counters.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.counters.rx_bytes.load(Ordering::Relaxed),
        }
    }

    /// Configured reader thread count
    #[must_use]
    pub const fn num_readers(&self) -> usize {
        self.num_readers
    }

    /// Configured writer thread count
    #[must_use]
    pub const fn num_writers(&self) -> usize {
        self.num_writers
    }
}

impl Drop for TunnelIo {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader_loop(
    tun: &TunFd,
    mtu: usize,
    running: &AtomicBool,
    callback: &Mutex<Option<ReadCallback>>,
    counters: &Counters,
) {
    let mut buf = vec![0u8; mtu + 4];

    debug!("tunnel io: reader thread started");

    while running.load(Ordering::Relaxed) {
        match tun.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                let packet = buf[..n].to_vec();
                counters.rx_packets.fetch_add(1, Ordering::Relaxed);
                counters.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);

                let cb = callback.lock();
                if let Some(cb) = cb.as_ref() {
                    cb(packet);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(READ_RETRY_DELAY);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!("tunnel io: read error: {e}");
                break;
            }
        }
    }

    debug!("tunnel io: reader thread stopped");
}

fn writer_loop(tun: &TunFd, running: &AtomicBool, queue: &PacketQueue, counters: &Counters) {
    debug!("tunnel io: writer thread started");

    loop {
        if !running.load(Ordering::Relaxed) && queue.is_empty() {
            break;
        }

        for packet in queue.pop_batch(WRITE_BATCH, WRITE_WAIT) {
            match tun.write(&packet) {
                Ok(n) => {
                    counters.tx_packets.fetch_add(1, Ordering::Relaxed);
                    counters.tx_bytes.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    trace!("tunnel io: transient write error, packet dropped");
                }
                Err(e) => {
                    warn!("tunnel io: write error: {e}");
                }
            }
        }
    }

    debug!("tunnel io: writer thread stopped");
}
