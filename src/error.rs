//! Error types for tunsocks
//!
//! Errors are categorized by subsystem. Per-packet failures are absorbed at
//! the component boundary and never surface here; only initialization and
//! per-session failures travel through these types.

use std::io;

use thiserror::Error;

/// Top-level error type for tunsocks
#[derive(Debug, Error)]
pub enum TunSocksError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// TUN device errors (open, ioctl, addressing)
    #[error("TUN error: {0}")]
    Tun(#[from] TunError),

    /// Embedded stack errors
    #[error("Stack error: {0}")]
    Stack(#[from] StackError),

    /// SOCKS5 client errors
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] crate::socks5::Socks5Error),

    /// Thread pool errors
    #[error("Thread pool error: {0}")]
    Pool(#[from] PoolError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunSocksError {
    /// Check if this error is recoverable (the operation can be retried)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Tun(_) => false,
            Self::Stack(e) => e.is_recoverable(),
            Self::Socks5(_) => true,
            Self::Pool(e) => matches!(e, PoolError::QueueFull),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// YAML parsing error
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    Validation(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    Env { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    Io(#[from] io::Error),
}

/// TUN device errors
#[derive(Debug, Error)]
pub enum TunError {
    /// Failed to open the device node
    #[error("Failed to open TUN device {name}: {reason}")]
    Open { name: String, reason: String },

    /// An ioctl on the device failed
    #[error("TUN ioctl {op} failed: {reason}")]
    Ioctl { op: &'static str, reason: String },

    /// A file descriptor handed to us is not usable
    #[error("Invalid external TUN fd: {0}")]
    InvalidFd(i32),

    /// TUN devices are not supported on this platform
    #[error("TUN devices are not supported on this platform")]
    Unsupported,

    /// I/O error on the device
    #[error("TUN I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Embedded stack errors
#[derive(Debug, Error)]
pub enum StackError {
    /// A packet could not be parsed
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// The socket set is at capacity
    #[error("Socket set exhausted")]
    SocketExhausted,

    /// A listen operation on a flow socket failed
    #[error("Listen failed: {0}")]
    Listen(String),

    /// The stack refused a send (closed or invalid endpoint state)
    #[error("Send failed: {0}")]
    Send(String),

    /// The stack refused a receive
    #[error("Receive failed: {0}")]
    Recv(String),
}

impl StackError {
    /// Packet-level errors are dropped and retried with the next packet;
    /// socket exhaustion recovers as sessions close.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidPacket(_) | Self::SocketExhausted)
    }
}

/// Thread pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    /// The task queue is at capacity; the task was dropped
    #[error("Task queue full")]
    QueueFull,

    /// The pool has been shut down
    #[error("Thread pool is shut down")]
    Shutdown,
}
