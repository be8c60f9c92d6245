mod common;

use common::EGRESS_IP;
use soxy_check::proxy::detect::Detector;
use soxy_check::{probe, ProbeError, ProxyKind, UpstreamProxy};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn test_http_proxy_returns_egress_ip() {
    let proxy = common::spawn_http_proxy(EGRESS_IP).await;
    let target = common::spawn_target("198.51.100.1").await;

    let egress = probe(
        ProxyKind::Http,
        &proxy.to_string(),
        &format!("http://{}/ip", target),
        TIMEOUT,
        None,
    )
    .await
    .unwrap();
    assert_eq!(egress.as_deref(), Some(EGRESS_IP));
}

#[tokio::test]
async fn test_http_proxy_raw_target_succeeds_on_connect() {
    let proxy = common::spawn_http_proxy(EGRESS_IP).await;
    let target = common::spawn_target(EGRESS_IP).await;

    let egress = probe(ProxyKind::Http, &proxy.to_string(), &target.to_string(), TIMEOUT, None)
        .await
        .unwrap();
    assert_eq!(egress, None);
}

#[tokio::test]
async fn test_http_proxy_empty_body() {
    let proxy = common::spawn_http_proxy("  \n").await;

    let err = probe(
        ProxyKind::Http,
        &proxy.to_string(),
        "http://127.0.0.1/",
        TIMEOUT,
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err, ProbeError::EmptyResponse);
}

#[tokio::test]
async fn test_socks5_tunnel_to_target() {
    let relay = common::spawn_socks5_relay().await;
    let target = common::spawn_target(EGRESS_IP).await;

    let egress = probe(
        ProxyKind::Socks5,
        &relay.to_string(),
        &format!("http://{}/", target),
        TIMEOUT,
        None,
    )
    .await
    .unwrap();
    assert_eq!(egress.as_deref(), Some(EGRESS_IP));

    let raw = probe(ProxyKind::Socks5, &relay.to_string(), &target.to_string(), TIMEOUT, None)
        .await
        .unwrap();
    assert_eq!(raw, None);
}

#[tokio::test]
async fn test_socks4_tunnel_to_target() {
    let relay = common::spawn_socks4_relay().await;
    let target = common::spawn_target(EGRESS_IP).await;

    let egress = probe(
        ProxyKind::Socks4,
        &relay.to_string(),
        &format!("http://{}/", target),
        TIMEOUT,
        None,
    )
    .await
    .unwrap();
    assert_eq!(egress.as_deref(), Some(EGRESS_IP));
}

#[tokio::test]
async fn test_refused_and_timed_out() {
    let closed = common::closed_port().await;
    let err = probe(ProxyKind::Http, &closed.to_string(), "http://127.0.0.1/", TIMEOUT, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::ConnectionFailed(_)), "{:?}", err);

    let blackhole = common::spawn_blackhole().await;
    let err = probe(
        ProxyKind::Http,
        &blackhole.to_string(),
        "http://127.0.0.1/",
        Duration::from_millis(300),
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err, ProbeError::ConnectionFailed("timed out after 300ms".to_string()));
}

#[tokio::test]
async fn test_chained_through_upstream() {
    let candidate = common::spawn_http_proxy(EGRESS_IP).await;
    let upstream = common::spawn_http_proxy("198.51.100.1").await;
    let upstream = UpstreamProxy::new(upstream.to_string(), ProxyKind::Http);

    let egress = probe(
        ProxyKind::Http,
        &candidate.to_string(),
        "http://127.0.0.1/ip",
        TIMEOUT,
        Some(&upstream),
    )
    .await
    .unwrap();
    assert_eq!(egress.as_deref(), Some(EGRESS_IP));
}

#[tokio::test]
async fn test_chained_through_socks5_upstream() {
    let candidate = common::spawn_http_proxy(EGRESS_IP).await;
    let upstream = common::spawn_socks5_relay().await;
    let upstream = UpstreamProxy::new(upstream.to_string(), ProxyKind::Socks5);

    let egress = probe(
        ProxyKind::Http,
        &candidate.to_string(),
        "http://127.0.0.1/ip",
        TIMEOUT,
        Some(&upstream),
    )
    .await
    .unwrap();
    assert_eq!(egress.as_deref(), Some(EGRESS_IP));
}

#[tokio::test]
async fn test_upstream_test_connection() {
    let upstream = common::spawn_http_proxy(EGRESS_IP).await;
    let upstream = UpstreamProxy::new(upstream.to_string(), ProxyKind::Http);

    let (egress, _latency) = upstream
        .test_connection("http://127.0.0.1/ip", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(egress.as_deref(), Some(EGRESS_IP));
}

#[tokio::test]
async fn test_detect_socks5() {
    let relay = common::spawn_socks5_relay().await;
    let kind = Detector::new(TIMEOUT).detect(&relay.to_string()).await.unwrap();
    assert_eq!(kind, ProxyKind::Socks5);
}

#[tokio::test]
async fn test_detect_http() {
    let proxy = common::spawn_http_proxy(EGRESS_IP).await;
    let kind = Detector::new(TIMEOUT).detect(&proxy.to_string()).await.unwrap();
    assert_eq!(kind, ProxyKind::Http);
}
