//! TUI module for terminal user interfaces

mod proxy_checker;

pub use proxy_checker::{OutputFiles, ProxyCheckerApp};
