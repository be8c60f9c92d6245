//! SOCKS4 and SOCKS5 negotiation and probes

use super::{request_over_tunnel, BoxedStream, Dialer, HostPort, ProbeTarget};
use crate::error::ProbeError;
use crate::proxy::models::ProxyKind;
use std::net::{IpAddr, Ipv4Addr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS5_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const SOCKS4_GRANTED: u8 = 90;
const SOCKS5_NO_AUTH: u8 = 0x00;
const SOCKS5_NO_ACCEPTABLE_METHOD: u8 = 0xff;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Open a tunnel through a SOCKS candidate and fetch the target over it.
///
/// Chaining through an upstream is refused up front.
pub(super) async fn check(
    kind: ProxyKind,
    proxy: &HostPort,
    target: &ProbeTarget,
    dialer: &Dialer,
) -> Result<Option<String>, ProbeError> {
    if dialer.is_chained() {
        return Err(ProbeError::UpstreamUnsupported(kind));
    }

    let stream = dialer.dial(proxy).await?;
    let tunnel = match kind {
        ProxyKind::Socks4 => socks4_connect(stream, &target.address).await?,
        ProxyKind::Socks5 => socks5_connect(stream, &target.address).await?,
        other => return Err(ProbeError::UnsupportedKind(other)),
    };
    debug!(%kind, proxy = %proxy, target = %target.address, "socks tunnel established");

    request_over_tunnel(tunnel, target).await
}

fn io_error(context: &'static str) -> impl Fn(std::io::Error) -> ProbeError {
    move |e| ProbeError::connection(context, e)
}

/// SOCKS5 CONNECT without authentication
pub(crate) async fn socks5_connect(
    mut stream: BoxedStream,
    target: &HostPort,
) -> Result<BoxedStream, ProbeError> {
    stream
        .write_all(&[SOCKS5_VERSION, 1, SOCKS5_NO_AUTH])
        .await
        .map_err(io_error("SOCKS5 greeting failed"))?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .map_err(io_error("SOCKS5 greeting failed"))?;
    if choice[0] != SOCKS5_VERSION {
        return Err(ProbeError::ConnectionFailed(format!(
            "SOCKS5 invalid version {}",
            choice[0]
        )));
    }
    match choice[1] {
        SOCKS5_NO_AUTH => {}
        SOCKS5_NO_ACCEPTABLE_METHOD => {
            return Err(ProbeError::ConnectionFailed(
                "SOCKS5 proxy requires authentication".to_string(),
            ))
        }
        method => {
            return Err(ProbeError::ConnectionFailed(format!(
                "SOCKS5 proxy selected unsupported method {}",
                method
            )))
        }
    }

    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match target.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let host = target.host.as_bytes();
            if host.len() > u8::MAX as usize {
                return Err(ProbeError::InvalidFormat(target.to_string()));
            }
            request.push(ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host);
        }
    }
    request.extend_from_slice(&target.port.to_be_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(io_error("SOCKS5 connect request failed"))?;

    let mut reply = [0u8; 4];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(io_error("SOCKS5 connect reply failed"))?;
    if reply[0] != SOCKS5_VERSION {
        return Err(ProbeError::ConnectionFailed(format!(
            "SOCKS5 invalid version {}",
            reply[0]
        )));
    }
    if reply[1] != 0x00 {
        return Err(ProbeError::ConnectionFailed(format!(
            "SOCKS5 connection failed: {}",
            socks5_reply_message(reply[1])
        )));
    }

    // BND.ADDR and BND.PORT are unused but must be drained
    let remaining = match reply[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(io_error("SOCKS5 connect reply failed"))?;
            len[0] as usize + 2
        }
        atyp => {
            return Err(ProbeError::ConnectionFailed(format!(
                "SOCKS5 invalid address type {}",
                atyp
            )))
        }
    };
    let mut bound = vec![0u8; remaining];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(io_error("SOCKS5 connect reply failed"))?;

    Ok(stream)
}

fn socks5_reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// SOCKS4 CONNECT, falling back to SOCKS4a when the target has no IPv4 address
pub(crate) async fn socks4_connect(
    mut stream: BoxedStream,
    target: &HostPort,
) -> Result<BoxedStream, ProbeError> {
    let ipv4 = resolve_ipv4(target).await;

    let mut request = vec![SOCKS4_VERSION, CMD_CONNECT];
    request.extend_from_slice(&target.port.to_be_bytes());
    match ipv4 {
        Some(ip) => {
            request.extend_from_slice(&ip.octets());
            request.push(0x00);
        }
        None => {
            request.extend_from_slice(&[0, 0, 0, 1]);
            request.push(0x00);
            request.extend_from_slice(target.host.as_bytes());
            request.push(0x00);
        }
    }

    stream
        .write_all(&request)
        .await
        .map_err(io_error("SOCKS4 connect request failed"))?;

    let mut reply = [0u8; 8];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(io_error("SOCKS4 connect reply failed"))?;
    if reply[0] != 0x00 {
        return Err(ProbeError::ConnectionFailed(format!(
            "SOCKS4 invalid response version {}",
            reply[0]
        )));
    }
    if reply[1] != SOCKS4_GRANTED {
        return Err(ProbeError::ConnectionFailed(format!(
            "SOCKS4 request rejected or failed (code {})",
            reply[1]
        )));
    }

    Ok(stream)
}

async fn resolve_ipv4(target: &HostPort) -> Option<Ipv4Addr> {
    match target.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => return Some(ip),
        Ok(IpAddr::V6(_)) => return None,
        Err(_) => {}
    }
    tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .ok()?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_socks5_connect_domain_request() {
        let (client, mut server) = duplex(1024);
        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            server.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            server.read_exact(&mut rest).await.unwrap();

            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
                .await
                .unwrap();
            (greeting, head, rest)
        });

        socks5_connect(Box::new(client), &HostPort::new("www.google.com", 80))
            .await
            .unwrap();

        let (greeting, head, rest) = proxy.await.unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        assert_eq!(&head[..4], &[0x05, 0x01, 0x00, ATYP_DOMAIN]);
        assert_eq!(&rest[..rest.len() - 2], b"www.google.com");
        assert_eq!(&rest[rest.len() - 2..], &80u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_socks5_requires_auth() {
        let (client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            let _ = server.read_exact(&mut greeting).await;
            let _ = server.write_all(&[0x05, 0xff]).await;
        });

        let err = socks5_connect(Box::new(client), &HostPort::new("127.0.0.1", 80))
            .await
            .err()
            .unwrap();
        assert_eq!(
            err,
            ProbeError::ConnectionFailed("SOCKS5 proxy requires authentication".to_string())
        );
    }

    #[tokio::test]
    async fn test_socks5_reports_reply_code() {
        let (client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            let _ = server.read_exact(&mut greeting).await;
            let _ = server.write_all(&[0x05, 0x00]).await;
            let mut request = [0u8; 10];
            let _ = server.read_exact(&mut request).await;
            let _ = server
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await;
        });

        let err = socks5_connect(Box::new(client), &HostPort::new("127.0.0.1", 80))
            .await
            .err()
            .unwrap();
        assert_eq!(
            err,
            ProbeError::ConnectionFailed("SOCKS5 connection failed: connection refused".to_string())
        );
    }

    #[tokio::test]
    async fn test_socks4_connect_ipv4_request() {
        let (client, mut server) = duplex(1024);
        let proxy = tokio::spawn(async move {
            let mut request = [0u8; 9];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&[0x00, SOCKS4_GRANTED, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            request
        });

        socks4_connect(Box::new(client), &HostPort::new("8.8.8.8", 80))
            .await
            .unwrap();
        assert_eq!(proxy.await.unwrap(), [4, 1, 0, 80, 8, 8, 8, 8, 0]);
    }

    #[tokio::test]
    async fn test_socks4_rejected() {
        let (client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut request = [0u8; 9];
            let _ = server.read_exact(&mut request).await;
            let _ = server.write_all(&[0x00, 91, 0, 0, 0, 0, 0, 0]).await;
        });

        let err = socks4_connect(Box::new(client), &HostPort::new("8.8.8.8", 80))
            .await
            .err()
            .unwrap();
        assert_eq!(
            err,
            ProbeError::ConnectionFailed("SOCKS4 request rejected or failed (code 91)".to_string())
        );
    }

    #[tokio::test]
    async fn test_socks4a_for_ipv6_only_targets() {
        let (client, mut server) = duplex(1024);
        let proxy = tokio::spawn(async move {
            let mut request = [0u8; 13];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&[0x00, SOCKS4_GRANTED, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            request
        });

        socks4_connect(Box::new(client), &HostPort::new("::1", 80))
            .await
            .unwrap();
        let request = proxy.await.unwrap();
        assert_eq!(&request[4..8], &[0, 0, 0, 1]);
        assert_eq!(&request[9..12], b"::1");
        assert_eq!(request[12], 0);
    }
}
