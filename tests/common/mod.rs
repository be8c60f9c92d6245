//! Local mock servers for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const EGRESS_IP: &str = "203.0.113.9";

async fn listen() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// A port with nothing listening on it
pub async fn closed_port() -> SocketAddr {
    let (listener, addr) = listen().await;
    drop(listener);
    addr
}

/// Read a request head, or the first bytes of a SOCKS greeting
async fn read_head(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        head.extend_from_slice(&chunk[..n]);
        if head[0] == 4 || head[0] == 5 || head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Some(head);
        }
    }
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// HTTP server answering every request with `body`
pub async fn spawn_target(body: &'static str) -> SocketAddr {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if read_head(&mut stream).await.is_some() {
                    respond(&mut stream, "200 OK", body).await;
                }
            });
        }
    });
    addr
}

/// HTTP proxy that is its own exit.
///
/// Plain requests are answered with `body` directly. CONNECT is tunneled,
/// but only to loopback addresses. SOCKS greetings are dropped.
pub async fn spawn_http_proxy(body: &'static str) -> SocketAddr {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Some(head) = read_head(&mut stream).await else {
                    return;
                };
                if head[0] == 4 || head[0] == 5 {
                    return;
                }
                let head = String::from_utf8_lossy(&head).to_string();
                let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
                let method = request_line.next().unwrap_or_default();
                let target = request_line.next().unwrap_or_default();

                if method != "CONNECT" {
                    respond(&mut stream, "200 OK", body).await;
                    return;
                }
                if !target.starts_with("127.0.0.1:") {
                    respond(&mut stream, "403 Forbidden", "").await;
                    return;
                }
                match TcpStream::connect(target).await {
                    Ok(mut upstream) => {
                        let _ = stream
                            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                            .await;
                        let _ = copy_bidirectional(&mut stream, &mut upstream).await;
                    }
                    Err(_) => respond(&mut stream, "502 Bad Gateway", "").await,
                }
            });
        }
    });
    addr
}

/// SOCKS5 proxy without authentication.
///
/// The success reply is sent before the destination is dialed, so a
/// CONNECT to any host succeeds; traffic is relayed when the dial works.
pub async fn spawn_socks5_relay() -> SocketAddr {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = socks5_session(stream).await;
            });
        }
    });
    addr
}

async fn socks5_session(mut stream: TcpStream) -> std::io::Result<()> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != 5 {
        return Ok(());
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[5, 0]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let host = match header[3] {
        1 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        3 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).to_string()
        }
        4 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
        _ => return Ok(()),
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    stream.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;

    let dial = TcpStream::connect((host.as_str(), port));
    if let Ok(Ok(mut upstream)) = tokio::time::timeout(Duration::from_secs(2), dial).await {
        copy_bidirectional(&mut stream, &mut upstream).await?;
    }
    Ok(())
}

/// SOCKS4 proxy relaying to IPv4 destinations
pub async fn spawn_socks4_relay() -> SocketAddr {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = socks4_session(stream).await;
            });
        }
    });
    addr
}

async fn socks4_session(mut stream: TcpStream) -> std::io::Result<()> {
    let mut request = [0u8; 8];
    stream.read_exact(&mut request).await?;
    if request[0] != 4 {
        return Ok(());
    }
    // user id, NUL terminated
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            break;
        }
    }

    let port = u16::from_be_bytes([request[2], request[3]]);
    let ip = std::net::Ipv4Addr::new(request[4], request[5], request[6], request[7]);
    match TcpStream::connect((ip, port)).await {
        Ok(mut upstream) => {
            stream.write_all(&[0, 90, 0, 0, 0, 0, 0, 0]).await?;
            copy_bidirectional(&mut stream, &mut upstream).await?;
        }
        Err(_) => stream.write_all(&[0, 91, 0, 0, 0, 0, 0, 0]).await?,
    }
    Ok(())
}

/// Accepts connections and never answers
pub async fn spawn_blackhole() -> SocketAddr {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}
