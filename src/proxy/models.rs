//! Proxy data models

use crate::error::StateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Proxy kind enumeration
///
/// `Auto` only appears in requests, `Unknown` only in results where
/// detection gave up.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Auto,
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
    Unknown,
}

impl ProxyKind {
    /// Kinds that have a probe behind them
    pub const CONCRETE: [ProxyKind; 4] = [
        ProxyKind::Http,
        ProxyKind::Https,
        ProxyKind::Socks4,
        ProxyKind::Socks5,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Auto => "auto",
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Socks4 => "socks4",
            ProxyKind::Socks5 => "socks5",
            ProxyKind::Unknown => "unknown",
        }
    }

    pub fn is_concrete(&self) -> bool {
        Self::CONCRETE.contains(self)
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid proxy type: {0}. Use: auto, http, https, socks4, socks5")]
pub struct ParseKindError(String);

impl FromStr for ProxyKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(ProxyKind::Auto),
            "http" => Ok(ProxyKind::Http),
            "https" => Ok(ProxyKind::Https),
            "socks4" => Ok(ProxyKind::Socks4),
            "socks5" => Ok(ProxyKind::Socks5),
            "unknown" => Ok(ProxyKind::Unknown),
            _ => Err(ParseKindError(s.to_string())),
        }
    }
}

/// Lifecycle of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOutcome {
    Pending,
    Checking,
    Live,
    Dead,
    Error,
}

impl ProbeOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProbeOutcome::Live | ProbeOutcome::Dead | ProbeOutcome::Error)
    }

    fn can_become(&self, next: ProbeOutcome) -> bool {
        match self {
            ProbeOutcome::Pending => next == ProbeOutcome::Checking,
            ProbeOutcome::Checking => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeOutcome::Pending => "pending",
            ProbeOutcome::Checking => "checking",
            ProbeOutcome::Live => "live",
            ProbeOutcome::Dead => "dead",
            ProbeOutcome::Error => "error",
        };
        f.write_str(s)
    }
}

/// Outcome of checking one proxy endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResult {
    /// Endpoint in `host:port` form
    pub endpoint: String,
    /// Declared or detected kind
    pub kind: ProxyKind,
    pub outcome: ProbeOutcome,
    /// Round trip of the probe in milliseconds, only set for live results
    pub latency_ms: u64,
    /// Address the target saw the request coming from
    pub egress_ip: Option<String>,
    /// Filled in by an external geolocation lookup
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub error: Option<String>,
    /// Time of the last status change
    pub checked_at: DateTime<Utc>,
    /// Whether the proxy hides the client address, from external enrichment
    pub anonymous: bool,
    /// Set when a TLS exchange went through the proxy
    pub supports_https: bool,
}

impl ProxyResult {
    /// Create a pending result for an endpoint
    pub fn pending(endpoint: impl Into<String>, kind: ProxyKind) -> Self {
        Self {
            endpoint: endpoint.into(),
            kind,
            outcome: ProbeOutcome::Pending,
            latency_ms: 0,
            egress_ip: None,
            country: None,
            country_code: None,
            error: None,
            checked_at: Utc::now(),
            anonymous: false,
            supports_https: false,
        }
    }

    fn transition(&mut self, to: ProbeOutcome) -> Result<(), StateError> {
        if !self.outcome.can_become(to) {
            return Err(StateError::InvalidTransition {
                from: self.outcome,
                to,
            });
        }
        self.outcome = to;
        self.checked_at = Utc::now();
        Ok(())
    }

    pub fn mark_checking(&mut self) -> Result<(), StateError> {
        self.transition(ProbeOutcome::Checking)
    }

    pub fn set_live(&mut self, latency_ms: u64, egress_ip: Option<String>) -> Result<(), StateError> {
        self.transition(ProbeOutcome::Live)?;
        self.latency_ms = latency_ms;
        self.egress_ip = egress_ip;
        self.error = None;
        Ok(())
    }

    pub fn set_dead(&mut self, error: impl Into<String>) -> Result<(), StateError> {
        self.transition(ProbeOutcome::Dead)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn set_error(&mut self, error: impl Into<String>) -> Result<(), StateError> {
        self.transition(ProbeOutcome::Error)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Record the detected kind. Rejected once the result is terminal.
    pub fn set_kind(&mut self, kind: ProxyKind) -> Result<(), StateError> {
        if self.outcome.is_terminal() {
            return Err(StateError::InvalidTransition {
                from: self.outcome,
                to: self.outcome,
            });
        }
        self.kind = kind;
        self.checked_at = Utc::now();
        Ok(())
    }

    pub fn set_geo_info(&mut self, country: impl Into<String>, country_code: impl Into<String>) {
        self.country = Some(country.into());
        self.country_code = Some(country_code.into());
    }

    pub fn set_anonymous(&mut self, anonymous: bool) {
        self.anonymous = anonymous;
    }

    pub fn set_supports_https(&mut self, supports_https: bool) {
        self.supports_https = supports_https;
    }

    pub fn is_live(&self) -> bool {
        self.outcome == ProbeOutcome::Live
    }

    /// `kind://host:port`
    pub fn to_kind_string(&self) -> String {
        format!("{}://{}", self.kind, self.endpoint)
    }
}

/// Read-only views over a set of results. Every view returns a new collection.
pub trait ResultSetExt {
    fn filter_by_outcome(&self, outcome: ProbeOutcome) -> Vec<ProxyResult>;
    fn filter_by_kind(&self, kind: ProxyKind) -> Vec<ProxyResult>;
    fn live_endpoints(&self) -> Vec<String>;
    fn live_endpoints_with_kind(&self) -> Vec<String>;
}

impl ResultSetExt for [ProxyResult] {
    fn filter_by_outcome(&self, outcome: ProbeOutcome) -> Vec<ProxyResult> {
        self.iter().filter(|r| r.outcome == outcome).cloned().collect()
    }

    fn filter_by_kind(&self, kind: ProxyKind) -> Vec<ProxyResult> {
        self.iter().filter(|r| r.kind == kind).cloned().collect()
    }

    fn live_endpoints(&self) -> Vec<String> {
        self.iter()
            .filter(|r| r.is_live())
            .map(|r| r.endpoint.clone())
            .collect()
    }

    fn live_endpoints_with_kind(&self) -> Vec<String> {
        self.iter()
            .filter(|r| r.is_live())
            .map(ProxyResult::to_kind_string)
            .collect()
    }
}
