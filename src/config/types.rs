//! Configuration schema
//!
//! ```yaml
//! tunnel:
//!   name: tun0
//!   ipv4: 198.18.0.1
//!   mtu: 8500
//! socks5:
//!   address: 127.0.0.1
//!   port: 1080
//!   udp: udp
//! mapdns:
//!   network: 198.19.0.0
//!   netmask: 255.255.0.0
//!   cache-size: 256
//!   address: 198.18.0.53
//!   port: 53
//! misc:
//!   max-session-count: 0
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TUN device setup
    pub tunnel: TunnelConfig,
    /// Upstream SOCKS5 server
    pub socks5: Socks5Config,
    /// Mapped DNS (disabled when absent)
    #[serde(default)]
    pub mapdns: Option<MapDnsConfig>,
    /// Miscellaneous limits
    #[serde(default)]
    pub misc: MiscConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tunnel.validate()?;
        self.socks5.validate()?;
        if let Some(mapdns) = &self.mapdns {
            mapdns.validate()?;
        }
        Ok(())
    }
}

/// TUN device configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelConfig {
    /// Interface name
    #[serde(default = "default_tun_name")]
    pub name: String,
    /// IPv4 address assigned to the interface (a /32)
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,
    /// IPv6 address assigned to the interface (a /128)
    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,
    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Script executed after the interface comes up
    #[serde(default, rename = "post-up")]
    pub post_up: Option<String>,
    /// Script executed before the interface is torn down
    #[serde(default, rename = "pre-down")]
    pub pre_down: Option<String>,
}

impl TunnelConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.name.len() >= 16 {
            return Err(ConfigError::Validation(format!(
                "tunnel.name must be 1-15 characters, got {:?}",
                self.name
            )));
        }
        if self.mtu < 576 {
            return Err(ConfigError::Validation(format!(
                "tunnel.mtu must be at least 576, got {}",
                self.mtu
            )));
        }
        if self.ipv6.is_some() && self.mtu < 1280 {
            return Err(ConfigError::Validation(
                "tunnel.mtu must be at least 1280 when ipv6 is set".into(),
            ));
        }
        if self.ipv4.is_none() && self.ipv6.is_none() {
            return Err(ConfigError::Validation(
                "tunnel needs at least one of ipv4 or ipv6".into(),
            ));
        }
        Ok(())
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            ipv4: Some(Ipv4Addr::new(198, 18, 0, 1)),
            ipv6: None,
            mtu: default_mtu(),
            post_up: None,
            pre_down: None,
        }
    }
}

/// UDP relay mode toward the SOCKS5 server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UdpMode {
    /// UDP ASSOCIATE with a native UDP relay socket
    #[default]
    Udp,
    /// UDP packets carried length-prefixed on the TCP control connection
    Tcp,
}

/// Upstream SOCKS5 server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Socks5Config {
    /// Server host (IP address or resolvable name)
    pub address: String,
    /// Server port
    pub port: u16,
    /// Username for RFC 1929 authentication
    #[serde(default)]
    pub username: Option<String>,
    /// Password for RFC 1929 authentication
    #[serde(default)]
    pub password: Option<String>,
    /// UDP relay mode
    #[serde(default)]
    pub udp: UdpMode,
    /// Connect and handshake timeout in seconds
    #[serde(default = "default_connect_timeout", rename = "connect-timeout")]
    pub connect_timeout_secs: u64,
    /// UDP session idle timeout in seconds
    #[serde(default = "default_udp_idle_timeout", rename = "udp-idle-timeout")]
    pub udp_idle_timeout_secs: u64,
}

impl Socks5Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::Validation("socks5.address is required".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Validation("socks5.port must be non-zero".into()));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(ConfigError::Validation(
                "socks5.username and socks5.password must be set together".into(),
            ));
        }
        if let Some(user) = &self.username {
            if user.len() > 255 {
                return Err(ConfigError::Validation(
                    "socks5.username exceeds 255 bytes".into(),
                ));
            }
        }
        if let Some(pass) = &self.password {
            if pass.len() > 255 {
                return Err(ConfigError::Validation(
                    "socks5.password exceeds 255 bytes".into(),
                ));
            }
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "socks5.connect-timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the server address to a socket address
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if the address cannot be resolved.
    pub fn server_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Ok(ip) = self.address.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        (self.address.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                ConfigError::Validation(format!(
                    "socks5.address {:?} did not resolve: {e}",
                    self.address
                ))
            })?
            .next()
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "socks5.address {:?} resolved to no addresses",
                    self.address
                ))
            })
    }

    /// Connect/handshake timeout as a `Duration`
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// UDP idle timeout as a `Duration`
    #[must_use]
    pub const fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }

    /// Check if authentication is configured
    #[must_use]
    pub fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

/// Mapped DNS configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapDnsConfig {
    /// Network address of the virtual subnet addresses are drawn from
    pub network: Ipv4Addr,
    /// Netmask of the virtual subnet
    pub netmask: Ipv4Addr,
    /// Maximum number of hostname mappings kept alive
    #[serde(default = "default_mapdns_cache_size", rename = "cache-size")]
    pub cache_size: usize,
    /// Address DNS queries are intercepted on
    pub address: Ipv4Addr,
    /// Port DNS queries are intercepted on
    #[serde(default = "default_mapdns_port")]
    pub port: u16,
}

impl MapDnsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let net = self.subnet()?;
        if net.prefix_len() > 30 {
            return Err(ConfigError::Validation(format!(
                "mapdns subnet {net} is too small for address synthesis"
            )));
        }
        let hosts = 2u64.pow(u32::from(32 - net.prefix_len())) - 2;
        if self.cache_size == 0 {
            return Err(ConfigError::Validation(
                "mapdns.cache-size must be non-zero".into(),
            ));
        }
        if self.cache_size as u64 > hosts {
            return Err(ConfigError::Validation(format!(
                "mapdns.cache-size {} exceeds the {hosts} usable addresses of {net}",
                self.cache_size
            )));
        }
        if net.contains(&self.address) {
            return Err(ConfigError::Validation(format!(
                "mapdns.address {} must lie outside the virtual subnet {net}",
                self.address
            )));
        }
        if self.port == 0 {
            return Err(ConfigError::Validation("mapdns.port must be non-zero".into()));
        }
        Ok(())
    }

    /// The virtual subnet as an `Ipv4Net`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if network/netmask do not form a
    /// valid prefix.
    pub fn subnet(&self) -> Result<Ipv4Net, ConfigError> {
        Ipv4Net::with_netmask(self.network, self.netmask)
            .map_err(|e| {
                ConfigError::Validation(format!(
                    "mapdns network/netmask invalid: {e}"
                ))
            })
            .map(|net| net.trunc())
    }
}

/// Miscellaneous limits
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MiscConfig {
    /// Maximum number of live sessions; 0 disables the limit
    #[serde(default, rename = "max-session-count")]
    pub max_session_count: usize,
}

fn default_tun_name() -> String {
    "tun0".to_string()
}

const fn default_mtu() -> u16 {
    8500
}

const fn default_connect_timeout() -> u64 {
    10
}

const fn default_udp_idle_timeout() -> u64 {
    60
}

const fn default_mapdns_cache_size() -> usize {
    256
}

const fn default_mapdns_port() -> u16 {
    53
}
