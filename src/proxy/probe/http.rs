//! HTTP and HTTPS proxy probes

use super::transport::{fetch_body, http_connect, wrap_tls};
use super::{request_over_tunnel, Dialer, HostPort, ProbeTarget, TargetScheme};
use crate::error::ProbeError;
use crate::proxy::models::ProxyKind;

/// Send the target request through an HTTP(S) proxy.
///
/// Plain-http targets go out as an absolute-form GET to the proxy; https
/// targets are tunneled with CONNECT first. For an `https` proxy the link to
/// the proxy itself is TLS.
pub(super) async fn check(
    kind: ProxyKind,
    proxy: &HostPort,
    target: &ProbeTarget,
    dialer: &Dialer,
) -> Result<Option<String>, ProbeError> {
    let mut stream = dialer.dial(proxy).await?;
    if kind == ProxyKind::Https {
        stream = wrap_tls(stream, &proxy.host).await?;
    }

    match target.scheme {
        TargetScheme::Http => fetch_body(stream, &target.absolute_uri(), &target.authority())
            .await
            .map(Some),
        TargetScheme::Https => {
            let tunnel = http_connect(stream, &target.address).await?;
            request_over_tunnel(tunnel, target).await
        }
        TargetScheme::Raw => {
            http_connect(stream, &target.address).await?;
            Ok(None)
        }
    }
}
