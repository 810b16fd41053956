//! TUN device handling
//!
//! Opens a Linux TUN interface (`IFF_TUN | IFF_NO_PI`), assigns addresses and
//! MTU, and wraps the file descriptor for shared use by the reader and writer
//! threads. An externally created descriptor (e.g. handed over by a VPN
//! service) can be adopted instead; adopted descriptors are not closed on
//! drop.
//!
//! Concurrent `read` and `write` on one TUN descriptor is permitted by the
//! kernel, so a single [`TunFd`] is shared by every I/O thread.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::unix::io::RawFd;
use std::process::Command;

use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::error::TunError;

#[cfg(target_os = "linux")]
const TUNSETIFF: libc::c_ulong = 0x4004_54CA;
#[cfg(target_os = "linux")]
const IFF_TUN: libc::c_short = 0x0001;
#[cfg(target_os = "linux")]
const IFF_NO_PI: libc::c_short = 0x1000;

/// A TUN file descriptor shared by the I/O threads
///
/// Reads return whole outbound IP packets; writes inject inbound IP packets.
#[derive(Debug)]
pub struct TunFd {
    fd: RawFd,
    owned: bool,
    name: String,
}

impl TunFd {
    /// Open a new TUN interface with the configured name
    ///
    /// The descriptor is set non-blocking.
    ///
    /// # Errors
    ///
    /// Returns `TunError` if the device node cannot be opened or the
    /// interface cannot be created.
    #[cfg(target_os = "linux")]
    pub fn open(name: &str) -> Result<Self, TunError> {
        let fd = unsafe {
            libc::open(
                c"/dev/net/tun".as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(TunError::Open {
                name: name.to_string(),
                reason: io::Error::last_os_error().to_string(),
            });
        }

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_flags = IFF_TUN | IFF_NO_PI;

        let res = unsafe { libc::ioctl(fd, TUNSETIFF, &mut ifr) };
        if res < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TunError::Ioctl {
                op: "TUNSETIFF",
                reason: err.to_string(),
            });
        }

        info!(name, fd, "TUN device opened");
        Ok(Self {
            fd,
            owned: true,
            name: name.to_string(),
        })
    }

    /// Open a new TUN interface
    ///
    /// # Errors
    ///
    /// Always returns `TunError::Unsupported` on non-Linux platforms.
    #[cfg(not(target_os = "linux"))]
    pub fn open(_name: &str) -> Result<Self, TunError> {
        Err(TunError::Unsupported)
    }

    /// Adopt an externally created TUN descriptor
    ///
    /// The descriptor is switched to non-blocking mode and is not closed
    /// when this handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns `TunError::InvalidFd` if `fd` is negative, or an ioctl error
    /// if non-blocking mode cannot be set.
    pub fn adopt(fd: RawFd) -> Result<Self, TunError> {
        if fd < 0 {
            return Err(TunError::InvalidFd(fd));
        }
        let mut nonblock: libc::c_int = 1;
        let res = unsafe { libc::ioctl(fd, libc::FIONBIO, &mut nonblock) };
        if res < 0 {
            return Err(TunError::Ioctl {
                op: "FIONBIO",
                reason: io::Error::last_os_error().to_string(),
            });
        }
        info!(fd, "adopted external TUN fd");
        Ok(Self {
            fd,
            owned: false,
            name: String::new(),
        })
    }

    /// Interface name; empty for adopted descriptors
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle owns (and will close) the descriptor
    #[must_use]
    pub const fn is_owned(&self) -> bool {
        self.owned
    }

    /// The raw descriptor
    #[must_use]
    pub const fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Read one packet from the device
    ///
    /// # Errors
    ///
    /// Forwards the OS error; `WouldBlock` and `Interrupted` are transient.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            #[allow(clippy::cast_sign_loss)]
            Ok(n as usize)
        }
    }

    /// Write one packet to the device
    ///
    /// # Errors
    ///
    /// Forwards the OS error; `WouldBlock` and `Interrupted` are transient.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            #[allow(clippy::cast_sign_loss)]
            Ok(n as usize)
        }
    }
}

impl Drop for TunFd {
    fn drop(&mut self) {
        if self.owned && self.fd >= 0 {
            debug!(fd = self.fd, "closing TUN fd");
            unsafe { libc::close(self.fd) };
        }
    }
}

// The fd is shared by readers and writers; the kernel serializes packet
// boundaries on TUN devices.
unsafe impl Send for TunFd {}
unsafe impl Sync for TunFd {}

/// Bring a freshly opened interface up with the configured MTU and addresses
///
/// Addressing goes through `ip(8)`, matching how the interface would be set
/// up by hand.
///
/// # Errors
///
/// Returns `TunError::Ioctl` when a setup command fails.
pub fn configure(tun: &TunFd, config: &TunnelConfig) -> Result<(), TunError> {
    let name = tun.name();

    run_ip(&["link", "set", "dev", name, "mtu", &config.mtu.to_string()])?;

    if let Some(ipv4) = config.ipv4 {
        run_ip(&["addr", "add", &format!("{ipv4}/32"), "dev", name])?;
    }
    if let Some(ipv6) = config.ipv6 {
        run_ip(&["-6", "addr", "add", &format!("{ipv6}/128"), "dev", name])?;
    }

    run_ip(&["link", "set", "dev", name, "up"])?;

    info!(
        name,
        mtu = config.mtu,
        ipv4 = ?config.ipv4,
        ipv6 = ?config.ipv6,
        "TUN device configured"
    );
    Ok(())
}

fn run_ip(args: &[&str]) -> Result<(), TunError> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| TunError::Ioctl {
            op: "ip",
            reason: e.to_string(),
        })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(TunError::Ioctl {
            op: "ip",
            reason: format!(
                "`ip {}` failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

/// Run a post-up or pre-down script
///
/// The script runs through `sh -c` with `TUN_NAME` and `TUN_PHASE`
/// (`post-up` or `pre-down`) in its environment. Failures are logged and
/// otherwise ignored; lifecycle scripts must not take the tunnel down.
pub fn run_script(script: &str, tun_name: &str, phase: &str) {
    debug!(script, phase, "running tunnel script");
    match Command::new("sh")
        .arg("-c")
        .arg(script)
        .env("TUN_NAME", tun_name)
        .env("TUN_PHASE", phase)
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(script, phase, %status, "tunnel script exited non-zero"),
        Err(e) => warn!(script, phase, error = %e, "tunnel script failed to start"),
    }
}

/// Validate that an address pair is usable for the tunnel
///
/// Only used by callers that accept addresses outside the config path.
#[must_use]
pub fn address_family_mix(ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>) -> bool {
    ipv4.is_some() || ipv6.is_some()
}
