//! Error types for probing and run control

use crate::proxy::models::{ProbeOutcome, ProxyKind};
use thiserror::Error;

/// Failure of a single probe or detection attempt.
///
/// These never escape a worker: the orchestrator folds them into a terminal
/// result and moves on to the next endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The endpoint is not a `host:port` pair
    #[error("invalid proxy format: {0}")]
    InvalidFormat(String),

    /// The kind cannot be probed (e.g. `auto` or `unknown` reached the probe layer)
    #[error("unsupported proxy type: {0}")]
    UnsupportedKind(ProxyKind),

    /// Transport level failure talking to the proxy, the upstream or the target
    #[error("proxy connection failed: {0}")]
    ConnectionFailed(String),

    /// The target answered with a blank body
    #[error("empty response from endpoint")]
    EmptyResponse,

    /// Chaining an upstream proxy in front of a SOCKS candidate
    #[error("upstream proxy not supported for {0} checks")]
    UpstreamUnsupported(ProxyKind),

    /// None of the protocols answered during auto-detection
    #[error("could not detect proxy type")]
    DetectionFailed,
}

impl ProbeError {
    pub(crate) fn connection(context: &str, err: impl std::fmt::Display) -> Self {
        ProbeError::ConnectionFailed(format!("{}: {}", context, err))
    }

    /// Whether the failure comes from the input rather than the proxy itself
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProbeError::InvalidFormat(_)
                | ProbeError::UnsupportedKind(_)
                | ProbeError::UpstreamUnsupported(_)
        )
    }
}

/// A control operation or result transition attempted in the wrong state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("check already in progress")]
    AlreadyRunning,

    #[error("no check in progress")]
    NotRunning,

    #[error("check already paused")]
    AlreadyPaused,

    #[error("check not paused")]
    NotPaused,

    #[error("cannot clear results while check is running; stop or pause first")]
    ClearWhileRunning,

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: ProbeOutcome, to: ProbeOutcome },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_error_messages() {
        assert_eq!(
            ProbeError::InvalidFormat("not-an-address".to_string()).to_string(),
            "invalid proxy format: not-an-address"
        );
        assert_eq!(
            ProbeError::UpstreamUnsupported(ProxyKind::Socks5).to_string(),
            "upstream proxy not supported for socks5 checks"
        );
        assert_eq!(ProbeError::EmptyResponse.to_string(), "empty response from endpoint");
    }

    #[test]
    fn test_configuration_classification() {
        assert!(ProbeError::InvalidFormat(String::new()).is_configuration());
        assert!(ProbeError::UnsupportedKind(ProxyKind::Auto).is_configuration());
        assert!(!ProbeError::EmptyResponse.is_configuration());
        assert!(!ProbeError::ConnectionFailed("refused".to_string()).is_configuration());
    }

    #[test]
    fn test_transition_message() {
        let err = StateError::InvalidTransition {
            from: ProbeOutcome::Live,
            to: ProbeOutcome::Checking,
        };
        assert_eq!(err.to_string(), "invalid status transition: live -> checking");
    }
}
