//! tunsocks: userspace TUN to SOCKS5 tunnel
//!
//! Bridges a host-side TUN interface to an upstream SOCKS5 proxy. IP
//! packets routed into the TUN are terminated by an embedded TCP/IP stack;
//! the payloads of the resulting TCP and UDP flows are relayed over SOCKS5
//! connections, and proxy responses are re-injected as packets on the way
//! back.
//!
//! # Architecture
//!
//! ```text
//! TUN fd → readers ─→ stack (one lock) ─→ sessions on worker pool ─→ SOCKS5
//!    ↑                   │ output
//!    └── writers ←── packet queue ←───────────────────────────────────┘
//! ```
//!
//! The embedded stack is single-writer: every call into it and every
//! callback out of it happens under one mutex (the stack lock).
//! Parallelism lives at the edges: multiple TUN reader and writer
//! threads, and one worker-pool task per session, each spending most of
//! its time in upstream socket I/O outside the lock.
//!
//! # Quick start
//!
//! ```no_run
//! use tunsocks::{load_config, Tunnel};
//!
//! # fn main() -> Result<(), tunsocks::TunSocksError> {
//! let config = load_config("/etc/tunsocks.yml")?;
//! let tunnel = Tunnel::init(config, None)?;
//! // `run` blocks until another thread calls `tunnel.stop()`.
//! tunnel.run()?;
//! tunnel.fini();
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: YAML configuration loading and validation
//! - [`tun`]: TUN device open/adopt and interface setup
//! - [`io`]: packet queue and the reader/writer thread engine
//! - [`stack`]: the embedded stack domain behind the stack lock
//! - [`pool`]: worker thread pool running session tasks
//! - [`session`]: session index and the TCP/UDP relay loops
//! - [`socks5`]: SOCKS5 client (CONNECT and both UDP modes)
//! - [`mapdns`]: hostname ↔ virtual address table with DNS intercept
//! - [`timer`]: the stack timer thread
//! - [`tunnel`]: the controller facade

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod io;
pub mod mapdns;
pub mod pool;
pub mod session;
pub mod socks5;
pub mod stack;
pub mod timer;
pub mod tun;
pub mod tunnel;

pub use config::{load_config, load_config_str, load_config_with_env, Config};
pub use error::{ConfigError, PoolError, StackError, TunError, TunSocksError};
pub use tunnel::Tunnel;
