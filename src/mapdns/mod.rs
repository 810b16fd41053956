//! Mapped DNS
//!
//! Synthesizes stable virtual IPv4 addresses for hostnames seen in DNS
//! queries, so name-based connections intercepted by the tunnel can be
//! forwarded to the proxy with the original hostname preserved.
//!
//! The table is a fixed-capacity, least-recently-used map between hostnames
//! and addresses drawn from a configured virtual subnet. Queries for `A`
//! records are answered from the table (allocating on first sight);
//! everything else is left unanswered and the caller drops the query.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use hickory_proto::op::{Header, Message, MessageType, OpCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::MapDnsConfig;
use crate::error::ConfigError;

/// TTL advertised in synthesized answers
///
/// Short, because an entry may be evicted and its address remapped.
const MAPPED_TTL_SECS: u32 = 6;

struct Inner {
    by_name: HashMap<String, Ipv4Addr>,
    by_addr: HashMap<Ipv4Addr, String>,
    /// LRU order; front is the eviction candidate
    order: VecDeque<String>,
    cursor: u32,
}

impl Inner {
    fn touch(&mut self, name: &str) {
        if let Some(pos) = self.order.iter().position(|n| n == name) {
            let entry = self.order.remove(pos).expect("position is valid");
            self.order.push_back(entry);
        }
    }
}

/// Hostname ↔ synthesized address table
pub struct MappedDns {
    inner: Mutex<Inner>,
    subnet: Ipv4Net,
    capacity: usize,
    /// First usable address as a host integer
    base: u32,
    /// Number of usable addresses (network and broadcast excluded)
    pool_size: u32,
}

impl MappedDns {
    /// Create a table over `subnet` holding at most `capacity` mappings
    ///
    /// `capacity` must not exceed the subnet's usable host count; the
    /// configuration layer validates this.
    #[must_use]
    pub fn new(subnet: Ipv4Net, capacity: usize) -> Self {
        let network = u32::from(subnet.network());
        let pool_size = 2u32.pow(u32::from(32 - subnet.prefix_len())) - 2;

        debug!(%subnet, capacity, pool_size, "mapped DNS initialized");

        Self {
            inner: Mutex::new(Inner {
                by_name: HashMap::new(),
                by_addr: HashMap::new(),
                order: VecDeque::new(),
                cursor: 0,
            }),
            subnet,
            capacity,
            base: network + 1,
            pool_size,
        }
    }

    /// Create a table from the configuration section
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the subnet definition is invalid.
    pub fn from_config(config: &MapDnsConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.subnet()?, config.cache_size))
    }

    /// The virtual subnet addresses are drawn from
    #[must_use]
    pub const fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    /// Check whether `addr` lies inside the virtual subnet
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.subnet.contains(&addr)
    }

    /// Resolve a hostname to its synthesized address, allocating on first use
    pub fn resolve(&self, name: &str) -> Ipv4Addr {
        let mut inner = self.inner.lock();

        if let Some(&addr) = inner.by_name.get(name) {
            inner.touch(name);
            return addr;
        }

        if inner.by_name.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                if let Some(addr) = inner.by_name.remove(&oldest) {
                    inner.by_addr.remove(&addr);
                }
                trace!(evicted = %oldest, "mapped DNS table full");
            }
        }

        let addr = self.allocate(&mut inner);
        inner.by_name.insert(name.to_string(), addr);
        inner.by_addr.insert(addr, name.to_string());
        inner.order.push_back(name.to_string());

        trace!(name, %addr, "mapped DNS allocation");
        addr
    }

    /// Look up the hostname behind a synthesized address
    ///
    /// Refreshes the entry's recency.
    #[must_use]
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<String> {
        let mut inner = self.inner.lock();
        let name = inner.by_addr.get(&addr)?.clone();
        inner.touch(&name);
        Some(name)
    }

    /// Number of live mappings
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().by_name.len()
    }

    /// Check whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_name.is_empty()
    }

    /// Handle one DNS query datagram
    ///
    /// Returns the response bytes for queries containing at least one
    /// answerable `IN A` question; `None` for everything else (the caller
    /// discards the query).
    #[must_use]
    pub fn handle(&self, query: &[u8]) -> Option<Vec<u8>> {
        let request = Message::from_vec(query).ok()?;

        if request.op_code() != OpCode::Query || request.message_type() != MessageType::Query {
            return None;
        }

        let mut response = Message::new();
        response.set_header(Header::response_from_request(request.header()));

        let mut answered = false;
        for query in request.queries() {
            response.add_query(query.clone());

            if query.query_class() != DNSClass::IN || query.query_type() != RecordType::A {
                trace!(
                    qtype = %query.query_type(),
                    "mapped DNS: unsupported query type"
                );
                continue;
            }

            let name = query.name().to_string();
            let name = name.trim_end_matches('.');
            if name.is_empty() {
                continue;
            }

            let addr = self.resolve(name);
            let mut record =
                Record::from_rdata(query.name().clone(), MAPPED_TTL_SECS, RData::A(A(addr)));
            record.set_dns_class(query.query_class());
            response.add_answer(record);
            answered = true;
        }

        if !answered {
            return None;
        }
        response.to_vec().ok()
    }

    fn allocate(&self, inner: &mut Inner) -> Ipv4Addr {
        // Linear probe from the cursor; capacity <= pool_size guarantees a
        // free address after an eviction.
        for _ in 0..self.pool_size {
            let candidate = Ipv4Addr::from(self.base + inner.cursor % self.pool_size);
            inner.cursor = inner.cursor.wrapping_add(1);
            if !inner.by_addr.contains_key(&candidate) {
                return candidate;
            }
        }
        unreachable!("mapped DNS pool smaller than its capacity");
    }
}

impl std::fmt::Debug for MappedDns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedDns")
            .field("subnet", &self.subnet)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
