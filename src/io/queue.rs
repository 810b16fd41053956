//! Bounded packet queue between the embedded stack and the TUN writers
//!
//! The queue holds whole IP packets as owned byte vectors. Producers never
//! block: a push against a full queue fails and the packet is dropped by the
//! caller. Consumers dequeue in batches with a bounded wait so writer threads
//! can notice shutdown promptly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Capacity of the outbound packet queue
pub const PACKET_QUEUE_CAPACITY: usize = 4096;

/// Bounded FIFO of owned IP packets
///
/// Insertion order is preserved. The queue is shared between the stack's
/// output path (producers) and the TUN writer threads (consumers).
pub struct PacketQueue {
    inner: Mutex<VecDeque<Vec<u8>>>,
    not_empty: Condvar,
    capacity: usize,
}

impl PacketQueue {
    /// Create a queue with the default capacity
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_capacity(PACKET_QUEUE_CAPACITY)
    }

    /// Create a queue with a custom capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            capacity,
        })
    }

    /// Append a packet at the tail
    ///
    /// Returns `false` without modifying the queue when it is at capacity;
    /// the caller owns (and drops) the rejected packet.
    pub fn push(&self, packet: Vec<u8>) -> bool {
        let mut queue = self.inner.lock();
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(packet);
        drop(queue);
        self.not_empty.notify_one();
        true
    }

    /// Dequeue a single packet without waiting
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.inner.lock().pop_front()
    }

    /// Dequeue up to `max` packets, waiting at most `timeout` when empty
    ///
    /// Returns an empty vector when the timeout elapses with nothing queued.
    pub fn pop_batch(&self, max: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let mut queue = self.inner.lock();
        if queue.is_empty() {
            self.not_empty.wait_for(&mut queue, timeout);
        }
        let take = queue.len().min(max);
        queue.drain(..take).collect()
    }

    /// Wake every waiting consumer (used at shutdown)
    pub fn notify_all(&self) {
        self.not_empty.notify_all();
    }

    /// Remove and drop every queued packet, returning how many were dropped
    pub fn drain(&self) -> usize {
        let mut queue = self.inner.lock();
        let n = queue.len();
        queue.clear();
        n
    }

    /// Current queue depth
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// The configured capacity
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for PacketQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
