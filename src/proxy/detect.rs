//! Proxy type auto-detection
//!
//! Tries cheap variants of each probe against a well-known host, in the
//! order SOCKS5, SOCKS4, HTTPS, HTTP. The first protocol that answers wins.

use crate::error::ProbeError;
use crate::proxy::models::ProxyKind;
use crate::proxy::probe::{connect_tcp, socks4_connect, socks5_connect, HostPort};
use reqwest::{Client, Method, Proxy as ReqwestProxy};
use std::time::Duration;
use tracing::debug;

/// Host every quick check talks to
pub const DEFAULT_DETECT_HOST: &str = "www.google.com";

/// Fixed destination of the raw SOCKS4 check; SOCKS4 has no hostname support
const SOCKS4_DETECT_ADDR: (&str, u16) = ("8.8.8.8", 80);

/// Auto-detector configuration
#[derive(Debug, Clone)]
pub struct Detector {
    probe_host: String,
    timeout: Duration,
}

impl Detector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            probe_host: DEFAULT_DETECT_HOST.to_string(),
            timeout,
        }
    }

    pub fn with_probe_host(mut self, host: impl Into<String>) -> Self {
        self.probe_host = host.into();
        self
    }

    /// Classify `endpoint`. Every quick check gets the full timeout.
    pub async fn detect(&self, endpoint: &str) -> Result<ProxyKind, ProbeError> {
        let proxy = HostPort::parse(endpoint)?;

        for kind in [
            ProxyKind::Socks5,
            ProxyKind::Socks4,
            ProxyKind::Https,
            ProxyKind::Http,
        ] {
            let attempt = async {
                match kind {
                    ProxyKind::Socks5 => self.check_socks5(&proxy).await,
                    ProxyKind::Socks4 => self.check_socks4(&proxy).await,
                    _ => self.check_http(kind, &proxy).await,
                }
            };
            let answered = match tokio::time::timeout(self.timeout, attempt).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    debug!(%proxy, %kind, "quick check failed: {}", e);
                    false
                }
                Err(_) => {
                    debug!(%proxy, %kind, "quick check timed out");
                    false
                }
            };
            if answered {
                debug!(%proxy, %kind, "detected");
                return Ok(kind);
            }
        }

        Err(ProbeError::DetectionFailed)
    }

    async fn check_socks5(&self, proxy: &HostPort) -> Result<(), ProbeError> {
        let stream = connect_tcp(proxy, self.timeout).await?;
        socks5_connect(stream, &HostPort::new(self.probe_host.clone(), 80)).await?;
        Ok(())
    }

    async fn check_socks4(&self, proxy: &HostPort) -> Result<(), ProbeError> {
        let (host, port) = SOCKS4_DETECT_ADDR;
        let stream = connect_tcp(proxy, self.timeout).await?;
        socks4_connect(stream, &HostPort::new(host, port)).await?;
        Ok(())
    }

    /// HEAD through the proxy; any status below 500 means it forwarded the request
    async fn check_http(&self, kind: ProxyKind, proxy: &HostPort) -> Result<(), ProbeError> {
        let scheme = if kind == ProxyKind::Https { "https" } else { "http" };
        let client = self.create_client(proxy)?;
        let response = client
            .request(Method::HEAD, format!("{}://{}", scheme, self.probe_host))
            .send()
            .await
            .map_err(|e| ProbeError::connection("request failed", e))?;

        let status = response.status().as_u16();
        if (200..500).contains(&status) {
            Ok(())
        } else {
            Err(ProbeError::ConnectionFailed(format!("HTTP status: {}", status)))
        }
    }

    fn create_client(&self, proxy: &HostPort) -> Result<Client, ProbeError> {
        let reqwest_proxy = ReqwestProxy::all(format!("http://{}", proxy))
            .map_err(|e| ProbeError::InvalidFormat(format!("{}: {}", proxy, e)))?;

        Client::builder()
            .proxy(reqwest_proxy)
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProbeError::connection("failed to build client", e))
    }
}

/// Detect with the default probe host
pub async fn detect(endpoint: &str, timeout: Duration) -> Result<ProxyKind, ProbeError> {
    Detector::new(timeout).detect(endpoint).await
}
