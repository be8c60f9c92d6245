//! Soxy Check - concurrent proxy validator
//!
//! Checks large batches of HTTP, HTTPS, SOCKS4 and SOCKS5 proxies for
//! liveness, latency and egress IP, with pause, resume and stop control
//! over a running batch.

pub mod error;
pub mod proxy;
pub mod settings;
pub mod tui;

pub use error::{ProbeError, StateError};
pub use proxy::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `verbosity` picks the crate level
/// (0 = info, 1 = debug, 2+ = trace). Output goes to stderr so it never
/// mixes with exported results.
pub fn init_logger(verbosity: u8) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("soxy_check={}", level)));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
