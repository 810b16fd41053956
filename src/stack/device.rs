//! smoltcp device adapter
//!
//! Bridges the embedded stack to the tunnel engine through in-memory
//! queues: inbound packets are staged by `Stack::input` and consumed by the
//! interface poll; outbound packets produced by the stack go straight onto
//! the shared [`PacketQueue`] drained by the TUN writer threads.
//!
//! The transmit path never blocks. When the queue is full the packet is
//! dropped (the stack retransmits TCP data on its own schedule) and a
//! rate-limited warning is logged.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smoltcp::phy::{Checksum, ChecksumCapabilities, Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant as SmoltcpInstant;
use tracing::warn;

use crate::io::PacketQueue;

/// Transmit-drop warnings are emitted once per this many drops
const DROP_WARN_INTERVAL: u64 = 1024;

/// Virtual device feeding the interface from staged packets
pub struct StackDevice {
    /// Inbound packets staged for the next poll
    rx: VecDeque<Vec<u8>>,
    /// Shared outbound queue drained by the TUN writers
    queue: Arc<PacketQueue>,
    mtu: usize,
    tx_drops: Arc<AtomicU64>,
}

impl StackDevice {
    /// Create a device emitting into `queue`
    #[must_use]
    pub fn new(queue: Arc<PacketQueue>, mtu: usize) -> Self {
        Self {
            rx: VecDeque::new(),
            queue,
            mtu,
            tx_drops: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Stage an inbound packet for the next interface poll
    pub fn stage_rx(&mut self, packet: Vec<u8>) {
        self.rx.push_back(packet);
    }

    /// Number of staged inbound packets
    #[must_use]
    pub fn rx_len(&self) -> usize {
        self.rx.len()
    }

    /// Total outbound packets dropped against a full queue
    #[must_use]
    pub fn tx_drops(&self) -> u64 {
        self.tx_drops.load(Ordering::Relaxed)
    }

    /// Emit a pre-built packet directly onto the outbound queue
    ///
    /// Used for hand-built UDP responses that bypass the interface.
    pub fn emit(&self, packet: Vec<u8>) -> bool {
        if self.queue.push(packet) {
            return true;
        }
        let drops = self.tx_drops.fetch_add(1, Ordering::Relaxed);
        if drops % DROP_WARN_INTERVAL == 0 {
            warn!(drops = drops + 1, "stack: packet queue full, output dropped");
        }
        false
    }
}

impl Device for StackDevice {
    type RxToken<'a> = StackRxToken where Self: 'a;
    type TxToken<'a> = StackTxToken<'a> where Self: 'a;

    fn receive(
        &mut self,
        _timestamp: SmoltcpInstant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.rx.pop_front()?;
        Some((
            StackRxToken { packet },
            StackTxToken {
                queue: &self.queue,
                drops: &self.tx_drops,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
        Some(StackTxToken {
            queue: &self.queue,
            drops: &self.tx_drops,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps.checksum = ChecksumCapabilities::default();
        caps.checksum.ipv4 = Checksum::Both;
        caps.checksum.tcp = Checksum::Both;
        caps.checksum.udp = Checksum::Both;
        caps.checksum.icmpv4 = Checksum::Both;
        caps
    }
}

/// Receive token over one staged packet
pub struct StackRxToken {
    packet: Vec<u8>,
}

impl RxToken for StackRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut packet = self.packet;
        f(&mut packet)
    }
}

/// Transmit token writing into the shared packet queue
pub struct StackTxToken<'a> {
    queue: &'a Arc<PacketQueue>,
    drops: &'a AtomicU64,
}

impl TxToken for StackTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);

        if !self.queue.push(buffer) {
            let drops = self.drops.fetch_add(1, Ordering::Relaxed);
            if drops % DROP_WARN_INTERVAL == 0 {
                warn!(drops = drops + 1, "stack: packet queue full, output dropped");
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_packets_are_received_in_order() {
        let queue = PacketQueue::with_capacity(16);
        let mut device = StackDevice::new(queue, 1500);
        let timestamp = SmoltcpInstant::from_millis(0);

        assert!(device.receive(timestamp).is_none());

        device.stage_rx(vec![1, 2, 3]);
        device.stage_rx(vec![4, 5]);
        assert_eq!(device.rx_len(), 2);

        let (rx, _tx) = device.receive(timestamp).unwrap();
        assert_eq!(rx.consume(|buf| buf.to_vec()), vec![1, 2, 3]);
        let (rx, _tx) = device.receive(timestamp).unwrap();
        assert_eq!(rx.consume(|buf| buf.to_vec()), vec![4, 5]);
        assert!(device.receive(timestamp).is_none());
    }

    #[test]
    fn transmit_lands_on_queue() {
        let queue = PacketQueue::with_capacity(16);
        let mut device = StackDevice::new(Arc::clone(&queue), 1500);
        let timestamp = SmoltcpInstant::from_millis(0);

        let tx = device.transmit(timestamp).unwrap();
        tx.consume(4, |buf| buf.copy_from_slice(&[9, 9, 9, 9]));

        assert_eq!(queue.pop(), Some(vec![9, 9, 9, 9]));
    }

    #[test]
    fn transmit_drop_on_full_queue_is_counted() {
        let queue = PacketQueue::with_capacity(1);
        queue.push(vec![0]);
        let mut device = StackDevice::new(Arc::clone(&queue), 1500);
        let timestamp = SmoltcpInstant::from_millis(0);

        let tx = device.transmit(timestamp).unwrap();
        tx.consume(1, |buf| buf[0] = 1);

        assert_eq!(device.tx_drops(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn capabilities_are_ip_medium() {
        let device = StackDevice::new(PacketQueue::with_capacity(1), 1420);
        let caps = device.capabilities();
        assert_eq!(caps.medium, Medium::Ip);
        assert_eq!(caps.max_transmission_unit, 1420);
    }
}
