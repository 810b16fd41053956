//! Packet I/O between the TUN device and the embedded stack
//!
//! - [`queue::PacketQueue`]: bounded FIFO of outbound packets
//! - [`tunio::TunnelIo`]: reader/writer thread engine over the TUN fd

pub mod queue;
pub mod tunio;

pub use queue::{PacketQueue, PACKET_QUEUE_CAPACITY};
pub use tunio::{StatsSnapshot, TunnelIo};
