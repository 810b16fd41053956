//! Configuration types and loading
//!
//! Configuration is a YAML document with four sections: `tunnel`, `socks5`,
//! `mapdns` and `misc`. See [`types::Config`] for the full schema.

mod loader;
mod types;

pub use loader::{load_config, load_config_str, load_config_with_env};
pub use types::{
    Config, MapDnsConfig, MiscConfig, Socks5Config, TunnelConfig, UdpMode,
};
