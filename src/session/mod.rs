//! Session tracking
//!
//! Every relayed flow (one TCP connection or one UDP source port) is a
//! session. Sessions are registered in the [`SessionIndex`] in insertion
//! order; the index enforces the configured session limit by marking the
//! oldest session for termination when the limit is exceeded. Each session's
//! relay loop polls its [`SessionCtl`] cancellation flag at the top of every
//! iteration.

pub mod tcp;
pub mod udp;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

pub use tcp::TcpSession;
pub use udp::UdpSession;

/// Session flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// One relayed TCP connection
    Tcp,
    /// One relayed UDP source port
    Udp,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Shared control block of one session
///
/// The index owns one reference; the running session task owns another.
#[derive(Debug)]
pub struct SessionCtl {
    id: u64,
    kind: SessionKind,
    peer: SocketAddr,
    created_at: Instant,
    cancel: AtomicBool,
}

impl SessionCtl {
    /// Unique session id
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Session flavor
    #[must_use]
    pub const fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Host-side endpoint that created the session
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Age of the session
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Request termination; the relay loop honors it on its next iteration
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Whether termination was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

struct IndexInner {
    map: HashMap<u64, Arc<SessionCtl>>,
    /// Insertion order; the front is the eviction candidate
    order: VecDeque<u64>,
    next_id: u64,
}

/// Registry of live sessions, oldest first
pub struct SessionIndex {
    inner: Mutex<IndexInner>,
    max_sessions: usize,
}

impl SessionIndex {
    /// Create an index; `max_sessions == 0` disables the limit
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(IndexInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                next_id: 1,
            }),
            max_sessions,
        }
    }

    /// Register a new session
    ///
    /// The session is always created; when the limit is exceeded the oldest
    /// session is marked for termination instead.
    pub fn insert(&self, kind: SessionKind, peer: SocketAddr) -> Arc<SessionCtl> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let ctl = Arc::new(SessionCtl {
            id,
            kind,
            peer,
            created_at: Instant::now(),
            cancel: AtomicBool::new(false),
        });
        inner.map.insert(id, Arc::clone(&ctl));
        inner.order.push_back(id);

        if self.max_sessions > 0 && inner.map.len() > self.max_sessions {
            // Oldest not-yet-cancelled session gets the termination marker.
            let oldest = inner
                .order
                .iter()
                .find_map(|id| inner.map.get(id).filter(|c| !c.is_cancelled()).cloned());
            if let Some(oldest) = oldest {
                warn!(
                    session = oldest.id(),
                    kind = %oldest.kind(),
                    peer = %oldest.peer(),
                    "session limit reached, terminating oldest session"
                );
                oldest.cancel();
            }
        }

        debug!(session = id, %kind, %peer, count = inner.map.len(), "session registered");
        ctl
    }

    /// Remove a session by id
    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock();
        if inner.map.remove(&id).is_some() {
            inner.order.retain(|entry| *entry != id);
            debug!(session = id, count = inner.map.len(), "session removed");
        }
    }

    /// Number of live sessions
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Mark every session for termination (shutdown path)
    pub fn cancel_all(&self) {
        let inner = self.inner.lock();
        for ctl in inner.map.values() {
            ctl.cancel();
        }
    }

    /// Drop every record (final teardown; sessions have already exited)
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
    }

    /// The configured limit; 0 means unlimited
    #[must_use]
    pub const fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}

impl fmt::Debug for SessionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIndex")
            .field("count", &self.count())
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}
