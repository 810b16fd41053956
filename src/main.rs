//! tunsocks entry point
//!
//! ```bash
//! # Run with a configuration file
//! sudo tunsocks -c /etc/tunsocks.yml
//!
//! # Validate a configuration without starting
//! tunsocks -c /etc/tunsocks.yml --check-config
//!
//! # Print a starter configuration
//! tunsocks --generate-config > tunsocks.yml
//! ```
//!
//! `SIGINT`/`SIGTERM` trigger a clean shutdown. Log verbosity follows
//! `TUNSOCKS_LOG` (tracing env-filter syntax, default `info`).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tunsocks::{load_config_with_env, Tunnel};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Command-line arguments
struct Args {
    config_path: PathBuf,
    check_config: bool,
    generate_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/tunsocks.yml");
        let mut check_config = false;
        let mut generate_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--check-config" => check_config = true,
                "--generate-config" => generate_config = true,
                "-h" | "--help" => {
                    print_usage();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("unknown argument: {other}");
                    print_usage();
                    std::process::exit(2);
                }
            }
        }

        Self {
            config_path,
            check_config,
            generate_config,
        }
    }
}

fn print_usage() {
    eprintln!(
        "usage: tunsocks [-c CONFIG] [--check-config] [--generate-config]\n\
         \n\
         options:\n\
         \x20 -c, --config PATH    configuration file (default /etc/tunsocks.yml)\n\
         \x20 --check-config       validate the configuration and exit\n\
         \x20 --generate-config    print a starter configuration and exit"
    );
}

const STARTER_CONFIG: &str = "\
tunnel:
  name: tun0
  ipv4: 198.18.0.1
  mtu: 8500
socks5:
  address: 127.0.0.1
  port: 1080
  udp: udp
mapdns:
  network: 198.19.0.0
  netmask: 255.255.0.0
  cache-size: 256
  address: 198.18.0.53
  port: 53
misc:
  max-session-count: 0
";

fn install_signal_handlers() {
    #[allow(clippy::fn_to_numeric_cast_any)]
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        print!("{STARTER_CONFIG}");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TUNSOCKS_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config_with_env(&args.config_path)
        .with_context(|| format!("loading {}", args.config_path.display()))?;

    if args.check_config {
        println!("configuration OK: {}", args.config_path.display());
        return Ok(());
    }

    let tunnel = Arc::new(Tunnel::init(config, None).context("initializing tunnel")?);

    install_signal_handlers();
    {
        let tunnel = Arc::clone(&tunnel);
        std::thread::Builder::new()
            .name("signal-watch".into())
            .spawn(move || {
                while !SHUTDOWN.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(100));
                }
                info!("shutdown signal received");
                tunnel.stop();
            })
            .expect("spawn signal watcher");
    }

    if let Err(e) = tunnel.run() {
        error!("tunnel failed: {e}");
    }

    let stats = tunnel.stats();
    info!(
        tx_packets = stats.tx_packets,
        tx_bytes = stats.tx_bytes,
        rx_packets = stats.rx_packets,
        rx_bytes = stats.rx_bytes,
        "final traffic counters"
    );

    tunnel.fini();
    Ok(())
}
