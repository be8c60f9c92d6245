//! Streams, TLS and HTTP plumbing shared by the probes

use super::{HostPort, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use crate::error::ProbeError;
use hyper::header::{self, HeaderValue};
use hyper::{Body, Method, Request};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Longest response head accepted from a proxy answering CONNECT
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Any bidirectional byte stream a probe can speak through
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Open a plain TCP connection
pub(crate) async fn connect_tcp(addr: &HostPort, timeout: Duration) -> Result<BoxedStream, ProbeError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((addr.host.as_str(), addr.port)))
        .await
        .map_err(|_| ProbeError::ConnectionFailed(format!("connect to {} timed out", addr)))?
        .map_err(|e| ProbeError::connection(&format!("connect to {}", addr), e))?;
    let _ = stream.set_nodelay(true);
    Ok(Box::new(stream))
}

/// Run a TLS handshake on top of an existing stream
pub(crate) async fn wrap_tls(stream: BoxedStream, domain: &str) -> Result<BoxedStream, ProbeError> {
    let connector = native_tls::TlsConnector::new()
        .map_err(|e| ProbeError::connection("failed to build TLS connector", e))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    let stream = connector
        .connect(domain, stream)
        .await
        .map_err(|e| ProbeError::connection(&format!("TLS handshake with {} failed", domain), e))?;
    Ok(Box::new(stream))
}

/// Ask an HTTP proxy to open a tunnel to `target`
pub(crate) async fn http_connect(
    mut stream: BoxedStream,
    target: &HostPort,
) -> Result<BoxedStream, ProbeError> {
    let request = format!(
        "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nUser-Agent: {1}\r\nProxy-Connection: keep-alive\r\n\r\n",
        target, USER_AGENT
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| ProbeError::connection("failed to send CONNECT", e))?;

    let head = read_response_head(&mut stream).await?;
    let status = parse_status_code(&head)?;
    if !(200..300).contains(&status) {
        return Err(ProbeError::ConnectionFailed(format!(
            "CONNECT {} rejected with status {}",
            target, status
        )));
    }

    debug!(%target, status, "tunnel established");
    Ok(stream)
}

/// Read up to and including the blank line that ends a response head.
///
/// Reads byte by byte so nothing after the head is consumed.
async fn read_response_head(stream: &mut BoxedStream) -> Result<String, ProbeError> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(ProbeError::ConnectionFailed(
                "CONNECT response head too large".to_string(),
            ));
        }
        let read = stream
            .read(&mut byte)
            .await
            .map_err(|e| ProbeError::connection("failed to read CONNECT response", e))?;
        if read == 0 {
            return Err(ProbeError::ConnectionFailed(
                "proxy closed the connection during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn parse_status_code(head: &str) -> Result<u16, ProbeError> {
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| ProbeError::ConnectionFailed(format!("malformed status line: {}", status_line))),
        _ => Err(ProbeError::ConnectionFailed(format!(
            "malformed status line: {}",
            status_line
        ))),
    }
}

/// Send a GET over `stream` and return the trimmed body.
///
/// `uri` is written as the request target verbatim: origin-form for a
/// direct tunnel, absolute-form when the stream ends at an HTTP proxy.
pub(crate) async fn fetch_body(stream: BoxedStream, uri: &str, host: &str) -> Result<String, ProbeError> {
    let (mut sender, connection) = hyper::client::conn::handshake(stream)
        .await
        .map_err(|e| ProbeError::connection("HTTP handshake failed", e))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("probe connection closed: {}", e);
        }
    });

    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(header::HOST, host)
        .header(header::USER_AGENT, HeaderValue::from_static(USER_AGENT))
        .header(header::ACCEPT, HeaderValue::from_static(ACCEPT))
        .header(header::ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANGUAGE))
        .header(header::CONNECTION, HeaderValue::from_static("keep-alive"))
        .header(header::UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"))
        .body(Body::empty())
        .map_err(|e| ProbeError::connection("failed to create request", e))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| ProbeError::connection("request failed", e))?;
    debug!(status = %response.status(), "probe response");

    let body = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(|e| ProbeError::connection("failed to read response", e))?;
    egress_from_body(&body)
}

/// The target is expected to echo the caller's address as its body
pub(crate) fn egress_from_body(body: &[u8]) -> Result<String, ProbeError> {
    let text = String::from_utf8_lossy(body).trim().to_string();
    if text.is_empty() {
        return Err(ProbeError::EmptyResponse);
    }
    Ok(text)
}
