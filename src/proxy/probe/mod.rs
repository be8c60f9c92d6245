//! Protocol probes
//!
//! A probe routes one request through a candidate proxy to the target
//! endpoint and reports the egress IP the target saw. Each protocol has its
//! own module; [`probe`] dispatches on the kind. Probes are stateless, so any
//! number of them can run concurrently.

mod http;
mod socks;
mod transport;
mod upstream;

pub use transport::{BoxedStream, ProxyStream};
pub use upstream::{Dialer, UpstreamProxy};

pub(crate) use socks::{socks4_connect, socks5_connect};
pub(crate) use transport::connect_tcp;

use crate::error::ProbeError;
use crate::proxy::models::ProxyKind;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;
use url::{Host, Url};

/// Default timeout for a single probe in seconds
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Browser header set sent with every probe request
pub(crate) const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
pub(crate) const ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
pub(crate) const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.5";

/// A `host:port` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port` or `[v6]:port`
    pub fn parse(input: &str) -> Result<Self, ProbeError> {
        let input = input.trim();
        let invalid = || ProbeError::InvalidFormat(input.to_string());

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
            (host, port)
        } else {
            let (host, port) = input.rsplit_once(':').ok_or_else(invalid)?;
            if host.contains(':') {
                return Err(invalid());
            }
            (host, port)
        };

        let port: u16 = port.parse().map_err(|_| invalid())?;
        if host.is_empty() || port == 0 {
            return Err(invalid());
        }

        Ok(Self::new(host, port))
    }

    fn is_ipv6(&self) -> bool {
        matches!(self.host.parse::<IpAddr>(), Ok(IpAddr::V6(_)))
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScheme {
    Http,
    Https,
    /// Plain `host:port` or a non-HTTP URL; reachability is the only check
    Raw,
}

/// The liveness target a probe talks to through the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub scheme: TargetScheme,
    pub address: HostPort,
    /// Path and query, always starting with `/`
    pub path: String,
}

impl ProbeTarget {
    /// Parse a URL (`https://api.ipify.org`) or a bare `host:port`.
    ///
    /// Ports default to 443 for https and 80 for everything else.
    pub fn parse(target: &str) -> Result<Self, ProbeError> {
        let target = target.trim();
        if !target.contains("://") {
            return Ok(Self {
                scheme: TargetScheme::Raw,
                address: HostPort::parse(target)?,
                path: "/".to_string(),
            });
        }

        let url = Url::parse(target)
            .map_err(|e| ProbeError::InvalidFormat(format!("invalid endpoint URL {}: {}", target, e)))?;

        let scheme = match url.scheme() {
            "http" => TargetScheme::Http,
            "https" => TargetScheme::Https,
            _ => TargetScheme::Raw,
        };
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => {
                return Err(ProbeError::InvalidFormat(format!(
                    "endpoint URL has no host: {}",
                    target
                )))
            }
        };
        let default_port = if scheme == TargetScheme::Https { 443 } else { 80 };
        let port = url.port().unwrap_or(default_port);

        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            scheme,
            address: HostPort::new(host, port),
            path,
        })
    }

    pub fn is_http(&self) -> bool {
        self.scheme != TargetScheme::Raw
    }

    /// Value for the `Host` header; omits the port when it is the default
    pub fn authority(&self) -> String {
        let default_port = match self.scheme {
            TargetScheme::Https => 443,
            _ => 80,
        };
        match (self.address.port == default_port, self.address.is_ipv6()) {
            (true, true) => format!("[{}]", self.address.host),
            (true, false) => self.address.host.clone(),
            (false, _) => self.address.to_string(),
        }
    }

    /// Absolute-form request target, used when talking to an HTTP proxy
    pub fn absolute_uri(&self) -> String {
        let scheme = match self.scheme {
            TargetScheme::Https => "https",
            _ => "http",
        };
        format!("{}://{}{}", scheme, self.authority(), self.path)
    }
}

/// Probe one proxy endpoint.
///
/// Returns the egress IP reported by the target, or `None` when the target
/// is not an HTTP endpoint and establishing the tunnel is the whole check.
/// The probe is bounded by `timeout` and cannot be interrupted otherwise.
pub async fn probe(
    kind: ProxyKind,
    endpoint: &str,
    target: &str,
    timeout: Duration,
    upstream: Option<&UpstreamProxy>,
) -> Result<Option<String>, ProbeError> {
    let proxy = HostPort::parse(endpoint)?;
    let target = ProbeTarget::parse(target)?;
    let dialer = match upstream {
        Some(upstream) => Dialer::through(upstream, timeout)?,
        None => Dialer::direct(timeout),
    };

    debug!(%kind, proxy = %proxy, target = %target.address, chained = dialer.is_chained(), "probing");

    let attempt = async {
        match kind {
            ProxyKind::Http | ProxyKind::Https => http::check(kind, &proxy, &target, &dialer).await,
            ProxyKind::Socks4 | ProxyKind::Socks5 => {
                socks::check(kind, &proxy, &target, &dialer).await
            }
            ProxyKind::Auto | ProxyKind::Unknown => Err(ProbeError::UnsupportedKind(kind)),
        }
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::ConnectionFailed(format!(
            "timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Issue the GET for `target` over a stream that already reaches it
pub(crate) async fn request_over_tunnel(
    stream: BoxedStream,
    target: &ProbeTarget,
) -> Result<Option<String>, ProbeError> {
    match target.scheme {
        TargetScheme::Http => transport::fetch_body(stream, &target.path, &target.authority())
            .await
            .map(Some),
        TargetScheme::Https => {
            let stream = transport::wrap_tls(stream, &target.address.host).await?;
            transport::fetch_body(stream, &target.path, &target.authority())
                .await
                .map(Some)
        }
        TargetScheme::Raw => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port_parse() {
        let hp = HostPort::parse("203.0.113.5:8080").unwrap();
        assert_eq!(hp.host, "203.0.113.5");
        assert_eq!(hp.port, 8080);

        let hp = HostPort::parse("[::1]:1080").unwrap();
        assert_eq!(hp.host, "::1");
        assert_eq!(hp.to_string(), "[::1]:1080");

        let hp = HostPort::parse(" proxy.example.com:3128 ").unwrap();
        assert_eq!(hp.to_string(), "proxy.example.com:3128");
    }

    #[test]
    fn test_host_port_rejects_malformed() {
        for bad in ["not-an-address", ":8080", "1.2.3.4:", "1.2.3.4:abc", "1.2.3.4:0", "::1:80", "1.2.3.4:70000"] {
            assert_eq!(
                HostPort::parse(bad),
                Err(ProbeError::InvalidFormat(bad.to_string())),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn test_target_url_defaults() {
        let target = ProbeTarget::parse("https://api.ipify.org").unwrap();
        assert_eq!(target.scheme, TargetScheme::Https);
        assert_eq!(target.address, HostPort::new("api.ipify.org", 443));
        assert_eq!(target.path, "/");
        assert_eq!(target.authority(), "api.ipify.org");

        let target = ProbeTarget::parse("http://httpbin.org/ip?format=text").unwrap();
        assert_eq!(target.address.port, 80);
        assert_eq!(target.path, "/ip?format=text");
        assert_eq!(target.absolute_uri(), "http://httpbin.org/ip?format=text");
    }

    #[test]
    fn test_target_explicit_port() {
        let target = ProbeTarget::parse("http://127.0.0.1:8081/ip").unwrap();
        assert_eq!(target.authority(), "127.0.0.1:8081");
        assert_eq!(target.absolute_uri(), "http://127.0.0.1:8081/ip");
    }

    #[test]
    fn test_target_raw_host_port() {
        let target = ProbeTarget::parse("smtp.example.com:25").unwrap();
        assert_eq!(target.scheme, TargetScheme::Raw);
        assert!(!target.is_http());
        assert_eq!(target.address, HostPort::new("smtp.example.com", 25));

        let target = ProbeTarget::parse("tcp://10.0.0.1").unwrap();
        assert_eq!(target.scheme, TargetScheme::Raw);
        assert_eq!(target.address.port, 80);
    }

    #[tokio::test]
    async fn test_probe_rejects_malformed_endpoint() {
        let err = probe(
            ProxyKind::Http,
            "not-an-address",
            "http://127.0.0.1/",
            Duration::from_secs(1),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err, ProbeError::InvalidFormat("not-an-address".to_string()));
    }

    #[tokio::test]
    async fn test_probe_rejects_wildcard_kinds() {
        for kind in [ProxyKind::Auto, ProxyKind::Unknown] {
            let err = probe(kind, "127.0.0.1:1", "http://127.0.0.1/", Duration::from_secs(1), None)
                .await
                .unwrap_err();
            assert_eq!(err, ProbeError::UnsupportedKind(kind));
        }
    }

    #[tokio::test]
    async fn test_socks_rejects_upstream_chaining() {
        let upstream = UpstreamProxy::new("127.0.0.1:3128", ProxyKind::Http);
        for kind in [ProxyKind::Socks4, ProxyKind::Socks5] {
            let err = probe(
                kind,
                "127.0.0.1:1080",
                "http://127.0.0.1/",
                Duration::from_secs(1),
                Some(&upstream),
            )
            .await
            .unwrap_err();
            assert_eq!(err, ProbeError::UpstreamUnsupported(kind));
        }
    }
}
