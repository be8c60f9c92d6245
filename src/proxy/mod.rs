//! Proxy validation engine
//!
//! This module provides functionality for:
//! - Probing HTTP, HTTPS, SOCKS4 and SOCKS5 proxies, optionally through an upstream proxy
//! - Detecting the protocol of an unlabeled proxy
//! - Running large batches of checks with pause, resume and stop control
//! - Loading endpoint lists and exporting live results

pub mod control;
pub mod detect;
pub mod manager;
pub mod models;
pub mod parser;
pub mod probe;
pub mod stats;

pub use control::{ControlChannel, Signal, WorkerGate};
pub use detect::{detect, Detector};
pub use manager::{CheckManager, CheckStatus, LogCallback, RunConfiguration, RunState, UpdateCallback};
pub use models::{ProbeOutcome, ProxyKind, ProxyResult, ResultSetExt};
pub use parser::{ExportFormat, ProxyEntry, ProxyParser};
pub use probe::{probe, Dialer, HostPort, ProbeTarget, UpstreamProxy};
pub use stats::{format_duration, RunStatistics, StatsTracker};
