//! Upstream proxy chaining
//!
//! Every probe connection is opened by a [`Dialer`]. A direct dialer opens a
//! TCP socket; a chained dialer first reaches the upstream proxy and asks it
//! for a tunnel to the candidate.

use super::socks::{socks4_connect, socks5_connect};
use super::transport::{connect_tcp, http_connect, wrap_tls};
use super::{BoxedStream, HostPort};
use crate::error::ProbeError;
use crate::proxy::models::ProxyKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// An intermediary the candidate proxy is reached through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamProxy {
    /// `host:port`
    pub address: String,
    pub kind: ProxyKind,
}

impl UpstreamProxy {
    pub fn new(address: impl Into<String>, kind: ProxyKind) -> Self {
        Self {
            address: address.into(),
            kind,
        }
    }

    /// Probe `target` through this upstream alone.
    ///
    /// Returns the egress IP and the round trip in milliseconds.
    pub async fn test_connection(
        &self,
        target: &str,
        timeout: Duration,
    ) -> Result<(Option<String>, u64), ProbeError> {
        let start = Instant::now();
        let egress = super::probe(self.kind, &self.address, target, timeout, None).await?;
        Ok((egress, start.elapsed().as_millis() as u64))
    }
}

impl fmt::Display for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.address)
    }
}

#[derive(Debug, Clone)]
enum Route {
    Direct,
    Http { proxy: HostPort, tls: bool },
    Socks4(HostPort),
    Socks5(HostPort),
}

/// Opens connections either directly or through an upstream proxy
#[derive(Debug, Clone)]
pub struct Dialer {
    route: Route,
    timeout: Duration,
}

impl Dialer {
    pub fn direct(timeout: Duration) -> Self {
        Self {
            route: Route::Direct,
            timeout,
        }
    }

    pub fn through(upstream: &UpstreamProxy, timeout: Duration) -> Result<Self, ProbeError> {
        let proxy = HostPort::parse(&upstream.address)?;
        let route = match upstream.kind {
            ProxyKind::Http => Route::Http { proxy, tls: false },
            ProxyKind::Https => Route::Http { proxy, tls: true },
            ProxyKind::Socks4 => Route::Socks4(proxy),
            ProxyKind::Socks5 => Route::Socks5(proxy),
            other => return Err(ProbeError::UnsupportedKind(other)),
        };
        Ok(Self { route, timeout })
    }

    pub fn is_chained(&self) -> bool {
        !matches!(self.route, Route::Direct)
    }

    /// Open a stream that ends at `addr`
    pub async fn dial(&self, addr: &HostPort) -> Result<BoxedStream, ProbeError> {
        match &self.route {
            Route::Direct => connect_tcp(addr, self.timeout).await,
            Route::Http { proxy, tls } => {
                let mut stream = connect_tcp(proxy, self.timeout).await?;
                if *tls {
                    stream = wrap_tls(stream, &proxy.host).await?;
                }
                debug!(upstream = %proxy, %addr, "chaining through http upstream");
                http_connect(stream, addr).await
            }
            Route::Socks4(proxy) => {
                let stream = connect_tcp(proxy, self.timeout).await?;
                debug!(upstream = %proxy, %addr, "chaining through socks4 upstream");
                socks4_connect(stream, addr).await
            }
            Route::Socks5(proxy) => {
                let stream = connect_tcp(proxy, self.timeout).await?;
                debug!(upstream = %proxy, %addr, "chaining through socks5 upstream");
                socks5_connect(stream, addr).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_display() {
        let upstream = UpstreamProxy::new("10.0.0.1:3128", ProxyKind::Http);
        assert_eq!(upstream.to_string(), "http://10.0.0.1:3128");
    }

    #[test]
    fn test_dialer_routes() {
        let timeout = Duration::from_secs(1);
        assert!(!Dialer::direct(timeout).is_chained());

        let socks = UpstreamProxy::new("10.0.0.1:1080", ProxyKind::Socks5);
        assert!(Dialer::through(&socks, timeout).unwrap().is_chained());
    }

    #[test]
    fn test_dialer_rejects_bad_upstream() {
        let timeout = Duration::from_secs(1);
        let auto = UpstreamProxy::new("10.0.0.1:1080", ProxyKind::Auto);
        assert_eq!(
            Dialer::through(&auto, timeout).unwrap_err(),
            ProbeError::UnsupportedKind(ProxyKind::Auto)
        );

        let malformed = UpstreamProxy::new("nowhere", ProxyKind::Http);
        assert_eq!(
            Dialer::through(&malformed, timeout).unwrap_err(),
            ProbeError::InvalidFormat("nowhere".to_string())
        );
    }

    #[tokio::test]
    async fn test_direct_dial_refused() {
        let err = Dialer::direct(Duration::from_secs(2))
            .dial(&HostPort::new("127.0.0.1", 1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProbeError::ConnectionFailed(_)));
    }
}
